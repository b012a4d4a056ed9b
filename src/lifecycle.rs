//! Create/delete orchestration for preview environments
//!
//! A branch is either unprovisioned or provisioned (record + allocated port +
//! rendered config). The manager is the only place that keeps the registry
//! and the port pools consistent with each other: a record's port is
//! allocated exactly as long as the record exists.

use crate::allocator::Allocator;
use crate::error::{ProvisionError, Result};
use crate::locks::KeyedLocks;
use crate::pool::{PortPool, PortPoolStore, PortRange};
use crate::registry::{ProjectRecord, ProjectRegistry};
use crate::renderer::{ConfigRenderer, ProjectData};
use crate::store::KvStore;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Result of a create request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateOutcome {
    /// A port was allocated and the branch provisioned
    Created { ip: String, port: u16 },
    /// The branch already existed; its config was refreshed
    AlreadyProvisioned { ip: String, port: u16 },
}

impl CreateOutcome {
    pub fn code(&self) -> u16 {
        match self {
            CreateOutcome::Created { .. } => 201,
            CreateOutcome::AlreadyProvisioned { .. } => 304,
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            CreateOutcome::Created { .. } => "created",
            CreateOutcome::AlreadyProvisioned { .. } => "not modified",
        }
    }

    pub fn ip(&self) -> &str {
        match self {
            CreateOutcome::Created { ip, .. } | CreateOutcome::AlreadyProvisioned { ip, .. } => ip,
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            CreateOutcome::Created { port, .. }
            | CreateOutcome::AlreadyProvisioned { port, .. } => *port,
        }
    }
}

/// Result of a delete request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// Port released, record and config removed
    Released { ip: String, port: u16 },
    /// Branch or pool unknown; nothing changed
    NotFound,
}

impl DeleteOutcome {
    pub fn code(&self) -> u16 {
        match self {
            DeleteOutcome::Released { .. } => 202,
            DeleteOutcome::NotFound => 404,
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            DeleteOutcome::Released { .. } => "released",
            DeleteOutcome::NotFound => "not found",
        }
    }
}

pub struct LifecycleManager {
    allocator: Allocator,
    registry: ProjectRegistry,
    renderer: Arc<dyn ConfigRenderer>,
    /// Serializes create/delete per branch; taken before any other lock
    branch_locks: KeyedLocks,
    /// Serializes claims on a server name; taken after the branch lock and
    /// before the IP lock
    name_locks: KeyedLocks,
}

impl LifecycleManager {
    pub fn new(store: Arc<dyn KvStore>, range: PortRange, renderer: Arc<dyn ConfigRenderer>) -> Self {
        let pools = Arc::new(PortPoolStore::new(Arc::clone(&store), range));
        Self {
            allocator: Allocator::new(pools),
            registry: ProjectRegistry::new(store),
            renderer,
            branch_locks: KeyedLocks::new(),
            name_locks: KeyedLocks::new(),
        }
    }

    pub fn pools(&self) -> &PortPoolStore {
        self.allocator.pools()
    }

    pub fn registry(&self) -> &ProjectRegistry {
        &self.registry
    }

    /// Provision `branch` on `ip`, or refresh it if already provisioned.
    ///
    /// Fails with `Conflict` when another provisioned branch already routes
    /// `server_name`.
    pub fn create(
        &self,
        branch: &str,
        ip: &str,
        project_name: &str,
        server_name: &str,
    ) -> Result<CreateOutcome> {
        validate_keys(branch, ip)?;

        self.branch_locks.with(branch, || {
            self.pools().ensure(ip)?;

            if self.registry.exists(branch)? {
                return self.refresh(branch, ip, project_name, server_name);
            }

            self.name_locks.with(server_name, || {
                self.claim_server_name(branch, server_name)?;
                self.provision(branch, ip, project_name, server_name).map_err(|e| {
                    self.unclaim_server_name(branch, server_name);
                    e
                })
            })
        })
    }

    fn provision(
        &self,
        branch: &str,
        ip: &str,
        project_name: &str,
        server_name: &str,
    ) -> Result<CreateOutcome> {
        let port = self.allocator.allocate(ip)?;
        let record = ProjectRecord::new(branch, ip, port, project_name, server_name);

        let artifact = match self.renderer.render(&ProjectData::from(&record)) {
            Ok(artifact) => artifact,
            Err(e) => {
                error!(branch, ip, port, error = %e, "Config render failed, releasing port");
                self.undo_allocation(ip, port);
                return Err(e.into());
            }
        };

        if let Err(e) = self.registry.put(branch, &record) {
            error!(branch, ip, port, error = %e, "Failed to store project, rolling back");
            self.undo_allocation(ip, port);
            if let Err(rm) = self.renderer.remove(&artifact) {
                warn!(branch, artifact = %artifact, error = %rm, "Failed to remove config during rollback");
            }
            return Err(e);
        }

        info!(branch, ip, port, server_name, "Branch provisioned");
        Ok(CreateOutcome::Created {
            ip: ip.to_string(),
            port,
        })
    }

    /// Idempotent re-create: re-render the stored record unchanged, filling
    /// only metadata that legacy records never had.
    fn refresh(
        &self,
        branch: &str,
        ip: &str,
        project_name: &str,
        server_name: &str,
    ) -> Result<CreateOutcome> {
        let mut record = self.registry.get(branch)?;
        if record.ip != ip {
            warn!(
                branch,
                requested_ip = ip,
                provisioned_ip = %record.ip,
                "Branch already provisioned on another IP"
            );
        }

        let backfilled = record.backfill(project_name, server_name);
        let name = record.server_name.clone().unwrap_or_default();

        self.name_locks.with(&name, || {
            // Records from before the server name index get indexed here
            self.claim_server_name(branch, &name)?;

            let refreshed = self
                .renderer
                .render(&ProjectData::from(&record))
                .map_err(ProvisionError::from)
                .and_then(|_| {
                    if backfilled {
                        self.registry.put(branch, &record)?;
                        info!(branch, "Backfilled missing project metadata");
                    }
                    Ok(())
                });
            if let Err(e) = refreshed {
                if backfilled {
                    self.unclaim_server_name(branch, &name);
                }
                return Err(e);
            }

            info!(branch, ip = %record.ip, port = record.port, "Branch already provisioned");
            Ok(CreateOutcome::AlreadyProvisioned {
                ip: record.ip.clone(),
                port: record.port,
            })
        })
    }

    /// Record `branch` as the owner of `server_name` unless another
    /// provisioned branch holds it. Claims of deleted branches are taken over.
    fn claim_server_name(&self, branch: &str, server_name: &str) -> Result<()> {
        if server_name.is_empty() {
            return Ok(());
        }

        if let Some(owner) = self.registry.server_name_owner(server_name)? {
            if owner == branch {
                return Ok(());
            }
            if self.registry.exists(&owner)? {
                warn!(branch, server_name, owner = %owner, "Server name already in use");
                return Err(ProvisionError::Conflict(format!(
                    "server name {} is already routed to {}",
                    server_name, owner
                )));
            }
        }
        self.registry.claim_server_name(server_name, branch)
    }

    fn unclaim_server_name(&self, branch: &str, server_name: &str) {
        if server_name.is_empty() {
            return;
        }
        if let Err(e) = self.registry.release_server_name(server_name, branch) {
            error!(branch, server_name, error = %e, "Failed to release server name");
        }
    }

    /// Release `branch`'s port and remove its record and config.
    pub fn delete(&self, branch: &str, ip: &str) -> Result<DeleteOutcome> {
        validate_keys(branch, ip)?;

        self.branch_locks.with(branch, || {
            if !self.registry.exists(branch)? || !self.pools().exists(ip)? {
                info!(branch, ip, "Delete of unknown branch or IP");
                return Ok(DeleteOutcome::NotFound);
            }

            let record = self.registry.get(branch)?;
            if record.ip != ip {
                warn!(
                    branch,
                    requested_ip = ip,
                    provisioned_ip = %record.ip,
                    "Delete for IP the branch is not provisioned on"
                );
                return Ok(DeleteOutcome::NotFound);
            }

            match self.allocator.release(ip, record.port) {
                Ok(()) => {}
                // Port outside the pool (range changed since creation): nothing to free
                Err(ProvisionError::NotFound(what)) => {
                    warn!(branch, ip, port = record.port, "Not releasing {}", what);
                }
                Err(e) => return Err(e),
            }

            self.registry.delete(branch)?;

            if let Some(name) = record.server_name.as_deref() {
                self.name_locks.with(name, || self.unclaim_server_name(branch, name));
            }

            let artifact = self.renderer.artifact_id(branch);
            if let Err(e) = self.renderer.remove(&artifact) {
                // A stale config file can be cleaned up later; the port is already free
                warn!(branch, artifact = %artifact, error = %e, "Failed to remove proxy config");
            }

            info!(branch, ip, port = record.port, "Branch released");
            Ok(DeleteOutcome::Released {
                ip: record.ip,
                port: record.port,
            })
        })
    }

    /// Stored record of a branch
    pub fn project(&self, branch: &str) -> Result<ProjectRecord> {
        self.registry.get(branch)
    }

    /// Current pool state of an IP
    pub fn pool(&self, ip: &str) -> Result<PortPool> {
        self.pools().snapshot(ip)
    }

    fn undo_allocation(&self, ip: &str, port: u16) {
        if let Err(e) = self.allocator.release(ip, port) {
            error!(ip, port, error = %e, "Failed to release port during rollback");
        }
    }
}

fn validate_keys(branch: &str, ip: &str) -> Result<()> {
    if branch.trim().is_empty() {
        return Err(ProvisionError::InvalidInput("branch must not be empty".to_string()));
    }
    if ip.trim().is_empty() {
        return Err(ProvisionError::InvalidInput("ip must not be empty".to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{RenderError, StoreError};
    use crate::renderer::ArtifactId;
    use crate::store::MemoryStore;
    use parking_lot::Mutex;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;

    #[derive(Default)]
    struct RecordingRenderer {
        rendered: Mutex<Vec<ProjectData>>,
        removed: Mutex<Vec<ArtifactId>>,
        fail_render: AtomicBool,
        fail_remove: AtomicBool,
    }

    impl ConfigRenderer for RecordingRenderer {
        fn artifact_id(&self, branch: &str) -> ArtifactId {
            ArtifactId::new(branch)
        }

        fn render(&self, project: &ProjectData) -> std::result::Result<ArtifactId, RenderError> {
            if self.fail_render.load(Ordering::SeqCst) {
                return Err(RenderError::Reload("injected".to_string()));
            }
            self.rendered.lock().push(project.clone());
            Ok(self.artifact_id(&project.branch))
        }

        fn remove(&self, artifact: &ArtifactId) -> std::result::Result<(), RenderError> {
            if self.fail_remove.load(Ordering::SeqCst) {
                return Err(RenderError::Reload("injected".to_string()));
            }
            self.removed.lock().push(artifact.clone());
            Ok(())
        }
    }

    /// Store whose project writes can be made to fail
    #[derive(Default)]
    struct FlakyStore {
        inner: MemoryStore,
        fail_project_writes: AtomicBool,
    }

    impl KvStore for FlakyStore {
        fn get(&self, key: &str) -> std::result::Result<Option<Vec<u8>>, StoreError> {
            self.inner.get(key)
        }

        fn set(&self, key: &str, value: &[u8]) -> std::result::Result<(), StoreError> {
            if key.starts_with("project:") && self.fail_project_writes.load(Ordering::SeqCst) {
                return Err(StoreError::Unavailable("injected".to_string()));
            }
            self.inner.set(key, value)
        }

        fn exists(&self, key: &str) -> std::result::Result<bool, StoreError> {
            self.inner.exists(key)
        }

        fn delete(&self, key: &str) -> std::result::Result<(), StoreError> {
            self.inner.delete(key)
        }
    }

    const IP: &str = "10.0.0.1";

    fn manager(start: u16, end: u16) -> (LifecycleManager, Arc<RecordingRenderer>) {
        let renderer = Arc::new(RecordingRenderer::default());
        let manager = LifecycleManager::new(
            Arc::new(MemoryStore::new()),
            PortRange::new(start, end).unwrap(),
            renderer.clone(),
        );
        (manager, renderer)
    }

    fn create(manager: &LifecycleManager, branch: &str) -> Result<CreateOutcome> {
        manager.create(branch, IP, "shop", &format!("{}.preview.localhost", branch))
    }

    #[test]
    fn test_example_scenario() {
        let (manager, _) = manager(8100, 8102);

        let out = create(&manager, "feature/x").unwrap();
        assert_eq!(out, CreateOutcome::Created { ip: IP.to_string(), port: 8100 });
        assert_eq!(out.code(), 201);

        let out = create(&manager, "feature/x").unwrap();
        assert_eq!(
            out,
            CreateOutcome::AlreadyProvisioned { ip: IP.to_string(), port: 8100 }
        );
        assert_eq!(out.code(), 304);
        assert_eq!(out.message(), "not modified");

        assert_eq!(create(&manager, "feature/y").unwrap().port(), 8101);

        let out = manager.delete("feature/x", IP).unwrap();
        assert_eq!(out, DeleteOutcome::Released { ip: IP.to_string(), port: 8100 });
        assert_eq!(out.code(), 202);

        let out = create(&manager, "feature/z").unwrap();
        assert_eq!(out, CreateOutcome::Created { ip: IP.to_string(), port: 8100 });
    }

    #[test]
    fn test_recreate_is_noop_on_state() {
        let (manager, renderer) = manager(8100, 8102);

        create(&manager, "feature/x").unwrap();
        let record = manager.project("feature/x").unwrap();
        let pool = manager.pool(IP).unwrap();

        create(&manager, "feature/x").unwrap();
        assert_eq!(manager.project("feature/x").unwrap(), record);
        assert_eq!(manager.pool(IP).unwrap(), pool);

        // Rendered on both calls
        assert_eq!(renderer.rendered.lock().len(), 2);
    }

    #[test]
    fn test_recreate_keeps_original_metadata() {
        let (manager, renderer) = manager(8100, 8102);

        manager.create("b", IP, "original", "b.one.localhost").unwrap();
        manager.create("b", IP, "renamed", "b.two.localhost").unwrap();

        let record = manager.project("b").unwrap();
        assert_eq!(record.project_name.as_deref(), Some("original"));
        assert_eq!(record.server_name.as_deref(), Some("b.one.localhost"));
        assert_eq!(renderer.rendered.lock()[1].server_name, "b.one.localhost");
    }

    #[test]
    fn test_recreate_backfills_legacy_record() {
        let store = Arc::new(MemoryStore::new());
        let renderer = Arc::new(RecordingRenderer::default());
        let manager = LifecycleManager::new(
            store.clone(),
            PortRange::new(8100, 8102).unwrap(),
            renderer.clone(),
        );

        manager.pools().ensure(IP).unwrap();
        let port = manager.allocator.allocate(IP).unwrap();
        store
            .set(
                "project:legacy",
                format!(r#"{{"created_at":"01-01-2019 00:00:00","ip":"{}","port":"{}"}}"#, IP, port)
                    .as_bytes(),
            )
            .unwrap();

        let out = manager.create("legacy", IP, "shop", "legacy.preview.localhost").unwrap();
        assert_eq!(out, CreateOutcome::AlreadyProvisioned { ip: IP.to_string(), port });

        let record = manager.project("legacy").unwrap();
        assert_eq!(record.project_name.as_deref(), Some("shop"));
        assert_eq!(record.server_name.as_deref(), Some("legacy.preview.localhost"));
        assert_eq!(record.created_at, "01-01-2019 00:00:00");
        assert_eq!(renderer.rendered.lock()[0].server_name, "legacy.preview.localhost");
    }

    #[test]
    fn test_exhaustion() {
        let (manager, _) = manager(8100, 8101);
        create(&manager, "a").unwrap();
        create(&manager, "b").unwrap();

        assert!(matches!(
            create(&manager, "c"),
            Err(ProvisionError::PoolExhausted { .. })
        ));
        assert!(!manager.registry().exists("c").unwrap());
    }

    #[test]
    fn test_delete_then_create_cycle() {
        let (manager, renderer) = manager(8100, 8102);

        let port = create(&manager, "b").unwrap().port();
        manager.delete("b", IP).unwrap();

        assert!(!manager.registry().exists("b").unwrap());
        assert_eq!(manager.pool(IP).unwrap().is_free(port), Some(true));
        assert_eq!(renderer.removed.lock().as_slice(), &[ArtifactId::new("b")]);

        assert_eq!(create(&manager, "b").unwrap().port(), port);
    }

    #[test]
    fn test_render_failure_releases_port() {
        let (manager, renderer) = manager(8100, 8102);

        renderer.fail_render.store(true, Ordering::SeqCst);
        assert!(matches!(
            create(&manager, "b"),
            Err(ProvisionError::Render(_))
        ));
        assert!(!manager.registry().exists("b").unwrap());

        // The tentatively reserved port comes back first
        assert_eq!(manager.allocator.allocate(IP).unwrap(), 8100);
    }

    #[test]
    fn test_store_failure_rolls_back() {
        let store = Arc::new(FlakyStore::default());
        let renderer = Arc::new(RecordingRenderer::default());
        let manager = LifecycleManager::new(
            store.clone(),
            PortRange::new(8100, 8102).unwrap(),
            renderer.clone(),
        );

        store.fail_project_writes.store(true, Ordering::SeqCst);
        assert!(matches!(
            create(&manager, "b"),
            Err(ProvisionError::Store(_))
        ));

        assert_eq!(manager.pool(IP).unwrap().free_count(), 3);
        assert_eq!(renderer.removed.lock().as_slice(), &[ArtifactId::new("b")]);

        store.fail_project_writes.store(false, Ordering::SeqCst);
        assert_eq!(create(&manager, "b").unwrap().port(), 8100);
    }

    #[test]
    fn test_delete_unknown() {
        let (manager, _) = manager(8100, 8102);
        assert_eq!(manager.delete("b", IP).unwrap(), DeleteOutcome::NotFound);

        create(&manager, "b").unwrap();
        assert_eq!(manager.delete("b", "10.0.0.2").unwrap(), DeleteOutcome::NotFound);
        assert_eq!(manager.delete("other", IP).unwrap(), DeleteOutcome::NotFound);

        // Nothing was touched
        assert!(manager.registry().exists("b").unwrap());
        assert_eq!(manager.pool(IP).unwrap().allocated(), vec![8100]);
    }

    #[test]
    fn test_delete_with_mismatched_ip_pool_present() {
        let (manager, _) = manager(8100, 8102);
        create(&manager, "b").unwrap();
        manager.pools().ensure("10.0.0.2").unwrap();

        assert_eq!(manager.delete("b", "10.0.0.2").unwrap(), DeleteOutcome::NotFound);
        assert_eq!(manager.pool(IP).unwrap().allocated(), vec![8100]);
    }

    #[test]
    fn test_remove_failure_still_releases() {
        let (manager, renderer) = manager(8100, 8102);
        create(&manager, "b").unwrap();

        renderer.fail_remove.store(true, Ordering::SeqCst);
        let out = manager.delete("b", IP).unwrap();
        assert_eq!(out, DeleteOutcome::Released { ip: IP.to_string(), port: 8100 });
        assert!(!manager.registry().exists("b").unwrap());
        assert_eq!(manager.pool(IP).unwrap().free_count(), 3);
    }

    #[test]
    fn test_rejects_empty_keys() {
        let (manager, _) = manager(8100, 8102);
        assert!(matches!(
            manager.create(" ", IP, "p", "s"),
            Err(ProvisionError::InvalidInput(_))
        ));
        assert!(matches!(
            manager.delete("b", ""),
            Err(ProvisionError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_server_name_conflict_rejected() {
        let (manager, renderer) = manager(8100, 8102);
        let host = "a-b.shop.preview.localhost";

        manager.create("shop.a_b", IP, "shop", host).unwrap();
        assert!(matches!(
            manager.create("shop.a-b", IP, "shop", host),
            Err(ProvisionError::Conflict(_))
        ));

        // The rejected branch left nothing behind
        assert!(!manager.registry().exists("shop.a-b").unwrap());
        assert_eq!(manager.pool(IP).unwrap().allocated(), vec![8100]);
        assert_eq!(renderer.rendered.lock().len(), 1);
        assert_eq!(manager.delete("shop.a-b", IP).unwrap(), DeleteOutcome::NotFound);
        assert!(renderer.removed.lock().is_empty());
        assert_eq!(
            manager.registry().server_name_owner(host).unwrap().as_deref(),
            Some("shop.a_b")
        );

        // Free again once the owner is gone
        manager.delete("shop.a_b", IP).unwrap();
        assert_eq!(manager.registry().server_name_owner(host).unwrap(), None);
        assert_eq!(
            manager.create("shop.a-b", IP, "shop", host).unwrap(),
            CreateOutcome::Created { ip: IP.to_string(), port: 8100 }
        );
    }

    #[test]
    fn test_failed_create_releases_server_name() {
        let (manager, renderer) = manager(8100, 8102);

        renderer.fail_render.store(true, Ordering::SeqCst);
        assert!(create(&manager, "a").is_err());
        assert_eq!(
            manager.registry().server_name_owner("a.preview.localhost").unwrap(),
            None
        );

        renderer.fail_render.store(false, Ordering::SeqCst);
        manager.create("b", IP, "shop", "a.preview.localhost").unwrap();
    }

    #[test]
    fn test_stale_server_name_claim_is_taken_over() {
        let (manager, _) = manager(8100, 8102);
        manager
            .registry()
            .claim_server_name("b.preview.localhost", "gone")
            .unwrap();

        create(&manager, "b").unwrap();
        assert_eq!(
            manager
                .registry()
                .server_name_owner("b.preview.localhost")
                .unwrap()
                .as_deref(),
            Some("b")
        );
    }

    #[test]
    fn test_branch_locks_do_not_accumulate() {
        let (manager, _) = manager(8100, 8102);

        for i in 0..50 {
            let branch = format!("branch-{}", i);
            create(&manager, &branch).unwrap();
            manager.delete(&branch, IP).unwrap();
            assert_eq!(manager.delete(&branch, IP).unwrap(), DeleteOutcome::NotFound);
        }

        assert!(manager.branch_locks.is_empty());
        assert!(manager.name_locks.is_empty());
    }

    #[test]
    fn test_concurrent_creates_get_distinct_ports() {
        let (manager, _) = manager(8100, 8299);
        let manager = Arc::new(manager);

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let manager = Arc::clone(&manager);
                thread::spawn(move || create(&manager, &format!("branch-{}", i)).unwrap().port())
            })
            .collect();

        let ports: HashSet<u16> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(ports.len(), 16);
        assert_eq!(manager.pool(IP).unwrap().allocated().len(), 16);
    }

    #[test]
    fn test_concurrent_creates_same_branch_allocate_once() {
        let (manager, _) = manager(8100, 8299);
        let manager = Arc::new(manager);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let manager = Arc::clone(&manager);
                thread::spawn(move || create(&manager, "shared").unwrap())
            })
            .collect();

        let outcomes: Vec<CreateOutcome> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let created = outcomes
            .iter()
            .filter(|o| matches!(o, CreateOutcome::Created { .. }))
            .count();

        assert_eq!(created, 1);
        assert!(outcomes.iter().all(|o| o.port() == 8100));
        assert_eq!(manager.pool(IP).unwrap().allocated(), vec![8100]);
    }
}
