//! Parsing of caller-supplied project identifiers
//!
//! Callers name a preview environment with a dotted string:
//! `project`, `project.branch` or `project.branch.env`. The normalized string
//! is the registry key; the segments give the project name and the public
//! server name.

use crate::error::ProvisionError;

/// A parsed `project[.branch[.env]]` identifier
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectIdentifier {
    key: String,
    pub project: String,
    pub branch: Option<String>,
    pub environment: Option<String>,
}

impl ProjectIdentifier {
    pub fn parse(input: &str) -> Result<Self, ProvisionError> {
        let key = input.trim().to_lowercase();
        if key.is_empty() {
            return Err(ProvisionError::InvalidInput("branch must not be empty".to_string()));
        }

        let segments: Vec<&str> = key.split('.').collect();
        if segments.len() > 3 {
            return Err(ProvisionError::InvalidInput(format!(
                "'{}' has more than three segments (project.branch.env)",
                key
            )));
        }

        for segment in &segments {
            if segment.is_empty() {
                return Err(ProvisionError::InvalidInput(format!(
                    "'{}' contains an empty segment",
                    key
                )));
            }
            if let Some(bad) = segment
                .chars()
                .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '/')))
            {
                return Err(ProvisionError::InvalidInput(format!(
                    "'{}' contains invalid character '{}'",
                    key, bad
                )));
            }
        }

        let mut parts = segments.into_iter().map(str::to_string);
        let project = parts.next().unwrap_or_default();
        let branch = parts.next();
        let environment = parts.next();

        Ok(Self {
            key,
            project,
            branch,
            environment,
        })
    }

    /// Registry key: the normalized input
    pub fn key(&self) -> &str {
        &self.key
    }

    /// DNS name for the environment: `env.branch.project.<base_domain>`
    pub fn server_name(&self, base_domain: &str) -> String {
        let mut labels: Vec<String> = Vec::with_capacity(4);
        if let Some(env) = &self.environment {
            labels.push(slugify(env));
        }
        if let Some(branch) = &self.branch {
            labels.push(slugify(branch));
        }
        labels.push(slugify(&self.project));

        let base = base_domain.trim_matches('.');
        if !base.is_empty() {
            labels.push(base.to_string());
        }
        labels.join(".")
    }
}

/// Lowercase, keeping alphanumerics, `-` and `.`; everything else becomes `-`
pub fn slugify(input: &str) -> String {
    let slug: String = input
        .trim()
        .to_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '.' {
                c
            } else {
                '-'
            }
        })
        .collect();
    slug.trim_matches('-').to_string()
}
