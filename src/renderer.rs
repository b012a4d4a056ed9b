//! Reverse-proxy config generation
//!
//! Every provisioned branch gets one nginx server block routing its server
//! name to `ip:port`. Writes are atomic (temp file + rename) and followed by
//! the configured reload command.

use crate::config::RendererConfig;
use crate::error::RenderError;
use crate::registry::ProjectRecord;
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, info, warn};

const DEFAULT_TEMPLATE: &str = r#"# Generated by previewd for {{ project_name }} ({{ created_at }})
server {
    listen 80;
    server_name {{ server_name }};

    location / {
        proxy_pass http://{{ ip }}:{{ port }};
        proxy_http_version 1.1;
        proxy_set_header Host $host;
        proxy_set_header X-Real-IP $remote_addr;
        proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;
        proxy_set_header Upgrade $http_upgrade;
        proxy_set_header Connection "upgrade";
    }
}
"#;

/// Data handed to the renderer for one branch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectData {
    pub branch: String,
    pub created_at: String,
    pub ip: String,
    pub port: u16,
    pub project_name: String,
    pub server_name: String,
}

impl From<&ProjectRecord> for ProjectData {
    fn from(record: &ProjectRecord) -> Self {
        Self {
            branch: record.branch.clone(),
            created_at: record.created_at.clone(),
            ip: record.ip.clone(),
            port: record.port,
            project_name: record.project_name.clone().unwrap_or_default(),
            server_name: record.server_name.clone().unwrap_or_default(),
        }
    }
}

/// Handle of a rendered artifact
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArtifactId(String);

impl ArtifactId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ArtifactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Produces and removes the proxy config of a branch
pub trait ConfigRenderer: Send + Sync {
    /// Artifact identifier for a branch key
    fn artifact_id(&self, branch: &str) -> ArtifactId;

    /// Write (or rewrite) the branch's artifact and signal the proxy
    fn render(&self, project: &ProjectData) -> Result<ArtifactId, RenderError>;

    /// Remove an artifact. Removing a missing artifact is not an error.
    fn remove(&self, artifact: &ArtifactId) -> Result<(), RenderError>;
}

/// Substitute `{{ name }}` placeholders
pub fn render_template(template: &str, project: &ProjectData) -> Result<String, RenderError> {
    let mut out = String::with_capacity(template.len() + 64);
    let mut rest = template;

    while let Some(open) = rest.find("{{") {
        out.push_str(&rest[..open]);
        let after = &rest[open + 2..];
        let close = after
            .find("}}")
            .ok_or_else(|| RenderError::Template("unclosed '{{' in template".to_string()))?;

        let port;
        let value = match after[..close].trim() {
            "branch" => project.branch.as_str(),
            "created_at" => project.created_at.as_str(),
            "ip" => project.ip.as_str(),
            "port" => {
                port = project.port.to_string();
                port.as_str()
            }
            "project_name" => project.project_name.as_str(),
            "server_name" => project.server_name.as_str(),
            other => {
                return Err(RenderError::Template(format!(
                    "unknown placeholder '{}'",
                    other
                )))
            }
        };
        out.push_str(value);
        rest = &after[close + 2..];
    }

    out.push_str(rest);
    Ok(out)
}

/// File stem for a branch key.
///
/// Lowercase alphanumerics, `-` and `.` are kept; every other byte becomes
/// `_xx` (lowercase hex). `_` itself is escaped, so distinct keys never share
/// a file, and `/` never reaches the path.
pub fn artifact_name(branch: &str) -> String {
    let mut name = String::with_capacity(branch.len());
    for byte in branch.bytes() {
        match byte {
            b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' => name.push(byte as char),
            _ => name.push_str(&format!("_{:02x}", byte)),
        }
    }
    name
}

/// Writes nginx server blocks into a directory
pub struct NginxRenderer {
    output_dir: PathBuf,
    template: String,
    reload_command: Option<Vec<String>>,
}

impl NginxRenderer {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            template: DEFAULT_TEMPLATE.to_string(),
            reload_command: None,
        }
    }

    pub fn from_config(config: &RendererConfig) -> Result<Self, RenderError> {
        let mut renderer = Self::new(&config.output_dir);

        if let Some(path) = &config.template {
            let template = std::fs::read_to_string(path).map_err(|source| RenderError::Io {
                path: path.display().to_string(),
                source,
            })?;
            renderer = renderer.with_template(template);
        }

        if let Some(cmd) = &config.reload_command {
            let argv = shell_words::split(cmd)
                .map_err(|e| RenderError::Reload(format!("cannot parse '{}': {}", cmd, e)))?;
            renderer = renderer.with_reload_command(argv);
        }

        std::fs::create_dir_all(&renderer.output_dir).map_err(|source| RenderError::Io {
            path: renderer.output_dir.display().to_string(),
            source,
        })?;

        Ok(renderer)
    }

    /// Set the template (builder pattern)
    pub fn with_template(mut self, template: impl Into<String>) -> Self {
        self.template = template.into();
        self
    }

    /// Set the reload command argv (builder pattern)
    pub fn with_reload_command(mut self, argv: Vec<String>) -> Self {
        self.reload_command = if argv.is_empty() { None } else { Some(argv) };
        self
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Path of the file behind an artifact
    pub fn artifact_path(&self, artifact: &ArtifactId) -> PathBuf {
        self.output_dir.join(format!("{}.conf", artifact.as_str()))
    }

    fn write_atomic(&self, path: &Path, content: &str) -> Result<(), RenderError> {
        let io_err = |source| RenderError::Io {
            path: path.display().to_string(),
            source,
        };

        let mut tmp = tempfile::NamedTempFile::new_in(&self.output_dir).map_err(io_err)?;
        tmp.write_all(content.as_bytes()).map_err(io_err)?;
        tmp.persist(path).map_err(|e| io_err(e.error))?;
        Ok(())
    }

    fn read_existing(&self, path: &Path) -> Result<Option<String>, RenderError> {
        match std::fs::read_to_string(path) {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(RenderError::Io {
                path: path.display().to_string(),
                source,
            }),
        }
    }

    fn reload(&self) -> Result<(), RenderError> {
        let Some(argv) = &self.reload_command else {
            return Ok(());
        };

        debug!(command = ?argv, "Running reload command");
        let output = Command::new(&argv[0])
            .args(&argv[1..])
            .output()
            .map_err(|e| RenderError::Reload(format!("{}: {}", argv[0], e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(RenderError::Reload(format!(
                "{} exited with {}: {}",
                argv[0],
                output.status,
                stderr.trim()
            )));
        }

        Ok(())
    }
}

impl ConfigRenderer for NginxRenderer {
    fn artifact_id(&self, branch: &str) -> ArtifactId {
        ArtifactId::new(artifact_name(branch))
    }

    fn render(&self, project: &ProjectData) -> Result<ArtifactId, RenderError> {
        let artifact = self.artifact_id(&project.branch);
        if artifact.as_str().is_empty() {
            return Err(RenderError::Template(format!(
                "branch '{}' has no usable file name",
                project.branch
            )));
        }

        let content = render_template(&self.template, project)?;
        let path = self.artifact_path(&artifact);
        let previous = self.read_existing(&path)?;
        self.write_atomic(&path, &content)?;

        if let Err(e) = self.reload() {
            // Put back whatever the proxy was serving before this write
            let restored = match &previous {
                Some(old) => self.write_atomic(&path, old),
                None => std::fs::remove_file(&path).map_err(|source| RenderError::Io {
                    path: path.display().to_string(),
                    source,
                }),
            };
            if let Err(re) = restored {
                warn!(path = %path.display(), error = %re, "Failed to restore config after reload failure");
            }
            return Err(e);
        }

        info!(
            artifact = %artifact,
            server_name = %project.server_name,
            upstream = %format!("{}:{}", project.ip, project.port),
            "Rendered proxy config"
        );
        Ok(artifact)
    }

    fn remove(&self, artifact: &ArtifactId) -> Result<(), RenderError> {
        let path = self.artifact_path(artifact);
        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "Config already absent");
            }
            Err(source) => {
                return Err(RenderError::Io {
                    path: path.display().to_string(),
                    source,
                })
            }
        }

        self.reload()?;
        info!(artifact = %artifact, "Removed proxy config");
        Ok(())
    }
}
