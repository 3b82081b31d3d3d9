/// Render job coordination
///
/// The coordinator is the only entry point the hosting transport talks to.
/// It admits uploads through the validator, serializes renders per
/// resource key through lock markers and runs exactly one renderer
/// process per accepted render request, on the caller's thread.
use crate::config::loader::RenderboxConfig;
use crate::config::types::{
    AcceptedAsset, AssetUpload, JobState, LockError, LockInfo, ReapPolicy, RenderOutcome,
    RenderboxError, ResourceKey, Result,
};
use crate::config::validator::validate_config;
use crate::core::store::{AssetStore, StoredResource};
use crate::exec::supervisor::{ProcessSupervisor, RenderJob};
use crate::mirror::{FetchStatus, MirrorQueue};
use crate::observability::audit::{AuditEvent, AuditEventType, AuditLog};
use crate::observability::metrics::{export_lock_stats, RenderMetrics};
use crate::safety::{InstanceGuard, LockManager, StaleLockReaper};
use crate::security::filename::{derive_key, has_allowed_extension};
use crate::security::Validator;
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use uuid::Uuid;

/// Result of one render request that reached the renderer
#[derive(Debug, Clone)]
pub struct RenderReport {
    pub job: RenderJob,
    /// Lifecycle states visited, `Idle` first
    pub states: Vec<JobState>,
}

impl RenderReport {
    pub fn outcome(&self) -> &RenderOutcome {
        &self.job.outcome
    }

    pub fn is_done(&self) -> bool {
        self.job.outcome.is_done()
    }

    pub fn final_state(&self) -> JobState {
        if self.is_done() {
            JobState::Done
        } else {
            JobState::Failed
        }
    }
}

/// Listing row: stored input plus current lock holder
#[derive(Debug, Clone)]
pub struct ResourceStatus {
    pub stored: StoredResource,
    pub lock: Option<LockInfo>,
}

/// Outcome of ingesting one finished mirror fetch
#[derive(Debug)]
pub struct IngestResult {
    pub asset_name: String,
    pub result: Result<AcceptedAsset>,
}

pub struct JobCoordinator {
    config: RenderboxConfig,
    store: AssetStore,
    validator: Validator,
    locks: LockManager,
    supervisor: ProcessSupervisor,
    audit: AuditLog,
    metrics: RenderMetrics,
    reaped_at_start: usize,
    // Held for the coordinator's lifetime
    _instance: InstanceGuard,
}

impl JobCoordinator {
    /// Validate config, prepare directories, claim the lock namespace and
    /// sweep markers left by a previous run. Must complete before any
    /// request is served.
    pub fn start(config: RenderboxConfig) -> Result<Self> {
        Self::open(config, false)
    }

    /// Join the lock namespace next to other one-shot coordinators, as a
    /// CLI invocation does. Renders of one key still exclude each other
    /// through its marker, distinct keys proceed in parallel. Only markers
    /// whose lease expired or whose owner is gone are reclaimed, whatever
    /// the configured reap policy.
    pub fn attach(config: RenderboxConfig) -> Result<Self> {
        Self::open(config, true)
    }

    fn open(config: RenderboxConfig, shared: bool) -> Result<Self> {
        validate_config(&config)?;

        let store = AssetStore::new(&config.paths, &config.renderer);
        store.ensure_dirs()?;

        let locks = LockManager::new(config.paths.lock_dir(), config.locks.lease_ttl())?;
        let (instance, policy) = if shared {
            (locks.join_instance()?, ReapPolicy::Expired)
        } else {
            (locks.claim_instance()?, config.locks.reap_policy)
        };
        let audit = AuditLog::new(config.audit.events_file.clone())?;
        let metrics = RenderMetrics::new();

        let reaped = StaleLockReaper::new(&locks, policy).sweep()?;
        metrics.stale_locks_reaped.add(reaped as u64);
        if reaped > 0 {
            audit.record(AuditEvent::new(
                AuditEventType::LocksReaped,
                format!("removed {} stale lock marker(s)", reaped),
            ));
        }

        log::info!(
            "Coordinator ready (instance {}{}, work dir {})",
            locks.instance_id(),
            if shared { ", attached" } else { "" },
            config.paths.work_dir.display()
        );

        Ok(Self {
            validator: Validator::new(&config.validation),
            supervisor: ProcessSupervisor::new(config.renderer.clone()),
            store,
            locks,
            audit,
            metrics,
            reaped_at_start: reaped,
            _instance: instance,
            config,
        })
    }

    pub fn config(&self) -> &RenderboxConfig {
        &self.config
    }

    pub fn store(&self) -> &AssetStore {
        &self.store
    }

    pub fn reaped_at_start(&self) -> usize {
        self.reaped_at_start
    }

    /// Screen an upload and persist it as the render input for its key.
    /// Rejected uploads leave nothing on disk.
    pub fn submit(&self, upload: AssetUpload) -> Result<AcceptedAsset> {
        let key = derive_key(&upload.filename)?;
        if !has_allowed_extension(&upload.filename, &self.config.validation.allowed_extensions) {
            log::warn!(
                "Upload {:?} has an unexpected extension; relying on signature check",
                upload.filename
            );
        }

        let size = upload.bytes.len() as u64;
        let staged = self.store.stage(&key, &upload.bytes)?;
        let report = self.validator.validate(&upload.bytes, size);

        if let Err(rejection) = report.into_result() {
            drop(staged);
            self.metrics.uploads_rejected.inc();
            self.audit.record(
                AuditEvent::new(AuditEventType::AssetRejected, rejection.to_string()).with_key(&key),
            );
            log::warn!("Rejected upload {:?}: {}", upload.filename, rejection);
            return Err(rejection.into());
        }

        let path = self.store.commit(staged)?;
        let sha256 = format!("{:x}", Sha256::digest(&upload.bytes));

        self.metrics.uploads_accepted.inc();
        self.audit.record(
            AuditEvent::new(
                AuditEventType::AssetAccepted,
                format!("{} bytes, sha256 {}", size, sha256),
            )
            .with_key(&key)
            .with_file_path(&path),
        );
        log::info!("Accepted upload {} as {}", key, path.display());

        Ok(AcceptedAsset {
            key,
            path,
            size,
            sha256,
        })
    }

    /// Render `key` once. Unknown keys and busy keys fail immediately;
    /// the lock is released on every path out of this function.
    pub fn render(&self, key: &ResourceKey) -> Result<RenderReport> {
        let mut states = vec![JobState::Idle];
        let resource = self.store.resource(key)?;

        let guard = match self.locks.acquire(key) {
            Ok(guard) => guard,
            Err(LockError::Busy { key, owner_pid }) => {
                self.metrics.lock_contentions.inc();
                self.audit.record(
                    AuditEvent::new(
                        AuditEventType::RenderBusy,
                        format!("render in progress (owner pid {:?})", owner_pid),
                    )
                    .with_key(&key),
                );
                log::info!("Render of {} refused: busy", key);
                return Err(LockError::Busy { key, owner_pid }.into());
            }
            Err(e) => return Err(e.into()),
        };
        states.push(JobState::Locked);

        let job_id = Uuid::new_v4();
        self.audit.record(
            AuditEvent::new(AuditEventType::RenderStarted, "lock acquired")
                .with_key(key)
                .with_job_id(job_id),
        );

        states.push(JobState::Rendering);
        self.metrics.renders_started.inc();
        self.metrics.active_renders.inc();
        let invoked = self
            .supervisor
            .invoke(job_id, &resource, self.config.renderer.deadline());
        self.metrics.active_renders.dec();

        let job = match invoked {
            Ok(job) => job,
            Err(e) => {
                self.metrics.renders_spawn_failed.inc();
                log::error!("Render of {} could not start: {}", key, e);
                // guard drops here and removes the marker
                return Err(e);
            }
        };

        if let Err(e) = guard.release() {
            log::warn!("Failed to release lock for {}: {}", key, e);
        }

        self.metrics.record_outcome(&job.outcome, job.wall_time);
        let details = match &job.outcome {
            RenderOutcome::Done(path) => format!("done: {}", path.display()),
            RenderOutcome::Failed(failure) => {
                format!("failed ({}): {}", failure.error.kind(), failure.excerpt)
            }
        };
        self.audit.record(
            AuditEvent::new(AuditEventType::RenderFinished, details)
                .with_key(key)
                .with_job_id(job.job_id),
        );

        states.push(if job.outcome.is_done() {
            JobState::Done
        } else {
            JobState::Failed
        });
        Ok(RenderReport { job, states })
    }

    /// Accept an upload and render it right away
    pub fn submit_and_render(&self, upload: AssetUpload) -> Result<(AcceptedAsset, RenderReport)> {
        let accepted = self.submit(upload)?;
        let report = self.render(&accepted.key)?;
        Ok((accepted, report))
    }

    pub fn list_resources(&self) -> Result<Vec<ResourceStatus>> {
        Ok(self
            .store
            .list_resources()?
            .into_iter()
            .map(|stored| ResourceStatus {
                lock: self.locks.owner(&stored.resource.key),
                stored,
            })
            .collect())
    }

    /// Path of the rendered image for `key`, if one exists
    pub fn artifact_path(&self, key: &ResourceKey) -> Result<PathBuf> {
        let artifact = self.store.describe(key).artifact_path;
        if artifact.is_file() {
            Ok(artifact)
        } else {
            Err(RenderboxError::NotFound { key: key.clone() })
        }
    }

    pub fn read_artifact(&self, key: &ResourceKey) -> Result<Vec<u8>> {
        let path = self.artifact_path(key)?;
        Ok(std::fs::read(path)?)
    }

    /// Lock records currently present in the namespace
    pub fn held_locks(&self) -> Result<Vec<LockInfo>> {
        Ok(self
            .locks
            .held_keys()?
            .iter()
            .filter_map(|key| self.locks.owner(key))
            .collect())
    }

    pub fn metrics(&self) -> &RenderMetrics {
        &self.metrics
    }

    /// Prometheus text for render and lock counters
    pub fn metrics_text(&self) -> String {
        let mut text = self.metrics.export_prometheus();
        text.push_str(&export_lock_stats(&self.locks.stats()));
        text
    }

    /// Run finished mirror downloads through `submit`. Downloaded files
    /// are removed from the incoming directory either way.
    pub fn ingest_fetched(&self, queue: &MirrorQueue) -> Vec<IngestResult> {
        let mut results = Vec::new();
        for record in queue.drain_finished() {
            let path = match record.status {
                FetchStatus::Fetched(path) => path,
                FetchStatus::Failed(reason) => {
                    self.metrics.mirror_failed.inc();
                    self.audit.record(AuditEvent::new(
                        AuditEventType::MirrorFailed,
                        format!("{}: {}", record.asset.name, reason),
                    ));
                    continue;
                }
                _ => continue,
            };

            self.metrics.mirror_fetched.inc();
            self.audit.record(
                AuditEvent::new(AuditEventType::MirrorFetched, record.asset.name.clone())
                    .with_file_path(&path),
            );

            let result = std::fs::read(&path)
                .map_err(RenderboxError::from)
                .and_then(|bytes| self.submit(AssetUpload::new(record.asset.name.clone(), bytes)));
            if let Err(e) = std::fs::remove_file(&path) {
                log::warn!("Failed to remove fetched file {}: {}", path.display(), e);
            }
            results.push(IngestResult {
                asset_name: record.asset.name,
                result,
            });
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::ValidationError;
    use tempfile::TempDir;

    fn coordinator(tmp: &TempDir) -> JobCoordinator {
        let mut config = RenderboxConfig::with_work_dir(tmp.path());
        config.renderer.binary = PathBuf::from("/bin/false");
        JobCoordinator::start(config).unwrap()
    }

    #[test]
    fn coordinator_is_shareable_across_threads() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<JobCoordinator>();
    }

    #[test]
    fn accepted_upload_is_stored_under_its_key() {
        let tmp = TempDir::new().unwrap();
        let coord = coordinator(&tmp);

        let accepted = coord
            .submit(AssetUpload::new("My Scene.blend", b"BLENDER-v300 data".to_vec()))
            .unwrap();
        assert_eq!(accepted.key.as_str(), "My_Scene");
        assert_eq!(accepted.path, tmp.path().join("uploads/My_Scene.blend"));
        assert_eq!(accepted.size, 17);
        assert_eq!(accepted.sha256.len(), 64);
        assert_eq!(coord.metrics().uploads_accepted.get(), 1);
    }

    #[test]
    fn rejected_upload_leaves_no_files() {
        let tmp = TempDir::new().unwrap();
        let coord = coordinator(&tmp);

        let err = coord
            .submit(AssetUpload::new("scene.blend", b"PK\x03\x04zip".to_vec()))
            .unwrap_err();
        assert!(matches!(
            err,
            RenderboxError::Validation(ValidationError::BadSignature { .. })
        ));
        assert_eq!(
            std::fs::read_dir(tmp.path().join("uploads")).unwrap().count(),
            0
        );
        assert_eq!(coord.metrics().uploads_rejected.get(), 1);
    }

    #[test]
    fn unknown_key_fails_without_locking() {
        let tmp = TempDir::new().unwrap();
        let coord = coordinator(&tmp);
        let key = ResourceKey::parse("nothing").unwrap();

        assert!(matches!(
            coord.render(&key),
            Err(RenderboxError::NotFound { .. })
        ));
        assert_eq!(coord.locks.stats().acquisitions, 0);
        assert!(coord.held_locks().unwrap().is_empty());
    }

    #[test]
    fn second_coordinator_on_same_namespace_is_refused() {
        let tmp = TempDir::new().unwrap();
        let _first = coordinator(&tmp);
        let second = JobCoordinator::start(RenderboxConfig::with_work_dir(tmp.path()));
        assert!(matches!(
            second,
            Err(RenderboxError::Lock(LockError::InstanceActive { .. }))
        ));
    }

    #[test]
    fn attached_coordinators_share_the_namespace() {
        let tmp = TempDir::new().unwrap();
        let config = RenderboxConfig::with_work_dir(tmp.path());

        let first = JobCoordinator::attach(config.clone()).unwrap();
        let second = JobCoordinator::attach(config.clone()).unwrap();
        assert!(matches!(
            JobCoordinator::start(config.clone()),
            Err(RenderboxError::Lock(LockError::InstanceActive { .. }))
        ));

        drop(first);
        drop(second);
        let _server = JobCoordinator::start(config.clone()).unwrap();
        assert!(matches!(
            JobCoordinator::attach(config),
            Err(RenderboxError::Lock(LockError::InstanceActive { .. }))
        ));
    }

    #[test]
    fn attach_reclaims_only_markers_of_dead_owners() {
        let tmp = TempDir::new().unwrap();
        let config = RenderboxConfig::with_work_dir(tmp.path());
        let lock_dir = config.paths.lock_dir();
        std::fs::create_dir_all(&lock_dir).unwrap();

        let live = LockInfo {
            key: ResourceKey::parse("live").unwrap(),
            // pid 1 always exists
            pid: 1,
            instance_id: "other-process".to_string(),
            token: "t".to_string(),
            acquired_at: chrono::Utc::now(),
            expires_at: None,
            renderbox_version: "0".to_string(),
        };
        let dead = LockInfo {
            key: ResourceKey::parse("dead").unwrap(),
            // above any pid_max
            pid: 0x7fff_fff0,
            ..live.clone()
        };
        for info in [&live, &dead] {
            std::fs::write(
                lock_dir.join(format!("{}.lock", info.key)),
                serde_json::to_string(info).unwrap(),
            )
            .unwrap();
        }

        let coord = JobCoordinator::attach(config).unwrap();
        assert_eq!(coord.reaped_at_start(), 1);
        let held: Vec<_> = coord.held_locks().unwrap().into_iter().map(|i| i.key).collect();
        assert_eq!(held, vec![ResourceKey::parse("live").unwrap()]);
    }

    #[test]
    fn missing_artifact_is_not_found() {
        let tmp = TempDir::new().unwrap();
        let coord = coordinator(&tmp);
        let key = ResourceKey::parse("scene").unwrap();
        assert!(matches!(
            coord.read_artifact(&key),
            Err(RenderboxError::NotFound { .. })
        ));
    }
}
