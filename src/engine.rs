//! Engine facade: one registry owning every storage directory's
//! moving parts.
//!
//! Each set-up storage directory gets an `SdRuntime` holding its
//! loggers, cache, document registry, watcher handle, poll timers and
//! worker thread; setup and cleanup are construction and destruction
//! of that struct. Different directories sync fully in parallel —
//! their state is disjoint — while passes within one directory are
//! serialized by its worker queue.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use bytes::Bytes;
use crossbeam::channel::{Receiver, Sender, bounded, unbounded};
use thiserror::Error;
use tracing::{info, warn};

use crate::cache::{CacheError, NoteCache, SkippedEntry, WatermarkRow};
use crate::core::{FolderId, InstanceId, Limits, MoveId, NoteId, SdId, Tombstone, WallClock};
use crate::crdt::{DocError, DocumentRegistry, DocumentStore};
use crate::log::{
    ActivityLogger, ActivitySync, DeletionLogger, DeletionSync, LogError,
};
use crate::moves::{MoveEnds, MoveError, MoveManager, MoveState, scan_moves};
use crate::paths;
use crate::sd::{self, SdError};
use crate::watch::{
    PhaseCell, PollTimer, SdTask, SdWatcher, SdWorkerCtx, SyncPhase, SyncReport, SyncScope,
    run_sd_worker,
};

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("storage directory {sd_id} is not set up")]
    UnknownSd { sd_id: SdId },
    #[error("worker for storage directory {sd_id} is gone")]
    WorkerGone { sd_id: SdId },
    #[error("note {note_id} is permanently deleted")]
    NoteDeleted { note_id: NoteId },
    #[error("file watcher setup failed: {0}")]
    Watch(#[from] notify::Error),
    #[error("worker thread spawn failed: {0}")]
    Spawn(#[source] io::Error),
    #[error(transparent)]
    Log(#[from] LogError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Sd(#[from] SdError),
    #[error(transparent)]
    Move(#[from] MoveError),
    #[error(transparent)]
    Doc(#[from] DocError),
}

impl EngineError {
    pub fn transience(&self) -> crate::error::Transience {
        use crate::error::Transience;
        match self {
            EngineError::UnknownSd { .. } | EngineError::NoteDeleted { .. } => {
                Transience::Permanent
            }
            EngineError::WorkerGone { .. } | EngineError::Watch(_) | EngineError::Spawn(_) => {
                Transience::Unknown
            }
            EngineError::Log(e) => e.transience(),
            EngineError::Cache(e) => e.transience(),
            EngineError::Sd(e) => e.transience(),
            EngineError::Move(e) => e.transience(),
            EngineError::Doc(e) => e.transience(),
        }
    }
}

struct SdRuntime {
    root: PathBuf,
    sd_id: Arc<Mutex<SdId>>,
    cache: Arc<NoteCache>,
    registry: Arc<DocumentRegistry>,
    activity_logger: Mutex<ActivityLogger>,
    deletion_logger: Mutex<DeletionLogger>,
    tasks: Sender<SdTask>,
    worker: Option<JoinHandle<()>>,
    watcher: Option<SdWatcher>,
    poll_timers: Vec<PollTimer>,
    phase: PhaseCell,
}

impl SdRuntime {
    fn current_sd_id(&self) -> SdId {
        *self.sd_id.lock().expect("sd id poisoned")
    }
}

pub struct SyncEngine {
    instance_id: InstanceId,
    limits: Limits,
    store: Arc<dyn DocumentStore>,
    runtimes: Mutex<BTreeMap<PathBuf, SdRuntime>>,
    reports_tx: Sender<SyncReport>,
    reports_rx: Receiver<SyncReport>,
}

impl SyncEngine {
    pub fn new(instance_id: InstanceId, limits: Limits, store: Arc<dyn DocumentStore>) -> Self {
        let (reports_tx, reports_rx) = unbounded();
        Self {
            instance_id,
            limits,
            store,
            runtimes: Mutex::new(BTreeMap::new()),
            reports_tx,
            reports_rx,
        }
    }

    pub fn instance_id(&self) -> InstanceId {
        self.instance_id
    }

    /// Stream of background-sync results (affected note sets), for the
    /// cache-reindex/UI-notification layer. Single consumer.
    pub fn reports(&self) -> Receiver<SyncReport> {
        self.reports_rx.clone()
    }

    /// Bring a storage directory online: identity, layout, loggers,
    /// cache, watcher, poll timers, worker, and the initial sync.
    pub fn setup_sd(&self, root: &Path) -> EngineResult<SdId> {
        if let Some(existing) = self
            .runtimes
            .lock()
            .expect("runtimes poisoned")
            .get(root)
            .map(|rt| rt.current_sd_id())
        {
            return Ok(existing);
        }

        let now_ms = WallClock::now().get();
        let marker = sd::open_or_create(root, now_ms)?;
        let sd_id = marker.sd_id;
        sd::ensure_layout(root)?;
        sd::ensure_instance_profile(root, self.instance_id, now_ms, None)?;

        let cache_dir = locate_cache_dir(sd_id);
        let cache = Arc::new(NoteCache::open(&cache_dir, sd_id)?);
        if cache.sd_id()? != sd_id {
            // The marker on disk is the truth; the cache carries an
            // identity from before the last adoption.
            cache.set_sd_id(sd_id)?;
        }

        let registry = Arc::new(DocumentRegistry::new(Arc::clone(&self.store)));
        let activity_logger =
            ActivityLogger::open(root, sd_id, self.instance_id, &self.limits, now_ms)?;
        let deletion_logger =
            DeletionLogger::open(root, sd_id, self.instance_id, &self.limits, now_ms)?;

        let phase = PhaseCell::new();
        let (tasks_tx, tasks_rx) = unbounded();
        let sd_id_shared = Arc::new(Mutex::new(sd_id));

        let ctx = SdWorkerCtx {
            sd_root: root.to_path_buf(),
            sd_id: Arc::clone(&sd_id_shared),
            cache: Arc::clone(&cache),
            deletion_sync: DeletionSync::new(
                root.to_path_buf(),
                self.instance_id,
                Arc::clone(&cache),
                Arc::clone(&registry),
                self.limits.clone(),
            ),
            activity_sync: ActivitySync::new(
                root.to_path_buf(),
                self.instance_id,
                Arc::clone(&cache),
                Arc::clone(&registry),
                self.limits.clone(),
            ),
            phase: phase.clone(),
            reports: Some(self.reports_tx.clone()),
        };
        let worker = std::thread::Builder::new()
            .name(format!("folio-sd-{sd_id}"))
            .spawn(move || run_sd_worker(ctx, tasks_rx))
            .map_err(EngineError::Spawn)?;

        let watcher = SdWatcher::spawn(
            root,
            self.instance_id,
            phase.clone(),
            tasks_tx.clone(),
            Duration::from_millis(self.limits.watch_debounce_ms),
        )?;
        let poll_timers = vec![
            PollTimer::spawn(
                Duration::from_millis(self.limits.activity_poll_interval_ms),
                phase.clone(),
                tasks_tx.clone(),
                SyncScope::Full,
                "activity-poll",
            ),
            PollTimer::spawn(
                Duration::from_millis(self.limits.deletion_poll_interval_ms),
                phase.clone(),
                tasks_tx.clone(),
                SyncScope::DeletionsOnly,
                "deletion-poll",
            ),
        ];

        phase.set(SyncPhase::InitialSyncInFlight);
        let _ = tasks_tx.send(SdTask::Sync {
            scope: SyncScope::Full,
            cause: "startup",
        });

        let runtime = SdRuntime {
            root: root.to_path_buf(),
            sd_id: sd_id_shared,
            cache,
            registry,
            activity_logger: Mutex::new(activity_logger),
            deletion_logger: Mutex::new(deletion_logger),
            tasks: tasks_tx,
            worker: Some(worker),
            watcher: Some(watcher),
            poll_timers,
            phase,
        };
        self.runtimes
            .lock()
            .expect("runtimes poisoned")
            .insert(root.to_path_buf(), runtime);

        info!(%sd_id, root = %root.display(), "storage directory set up");
        Ok(sd_id)
    }

    /// Stop the watcher, poll timers and worker for one storage
    /// directory and forget it. Logs and cache stay on disk; a later
    /// `setup_sd` resumes from the persisted watermarks.
    pub fn cleanup_watchers(&self, sd_id: SdId) -> EngineResult<()> {
        let runtime = {
            let mut runtimes = self.runtimes.lock().expect("runtimes poisoned");
            let root = runtimes
                .iter()
                .find(|(_, rt)| rt.current_sd_id() == sd_id)
                .map(|(root, _)| root.clone())
                .ok_or(EngineError::UnknownSd { sd_id })?;
            runtimes.remove(&root).expect("runtime present")
        };
        teardown(runtime);
        Ok(())
    }

    pub fn cleanup_all_watchers(&self) {
        let runtimes = std::mem::take(&mut *self.runtimes.lock().expect("runtimes poisoned"));
        for (_, runtime) in runtimes {
            teardown(runtime);
        }
    }

    /// Run a full replay pass (deletions, then activity) for one
    /// storage directory and return the affected note ids. Serialized
    /// with background passes by the directory's worker.
    pub fn sync_from_other_instances(&self, sd_id: SdId) -> EngineResult<BTreeSet<NoteId>> {
        let tasks = self.with_runtime(sd_id, |rt| rt.tasks.clone())?;
        let (result_tx, result_rx) = bounded(1);
        tasks
            .send(SdTask::SyncNow {
                scope: SyncScope::Full,
                result: result_tx,
            })
            .map_err(|_| EngineError::WorkerGone { sd_id })?;
        let outcome = result_rx
            .recv()
            .map_err(|_| EngineError::WorkerGone { sd_id })?;
        Ok(outcome?)
    }

    /// Wait until every queued sync (all directories) has drained.
    /// Returns false on timeout; shutdown may proceed regardless since
    /// replay resumes from watermarks on the next startup.
    pub fn wait_for_pending_syncs(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let acks: Vec<(SdId, Receiver<()>)> = {
            let runtimes = self.runtimes.lock().expect("runtimes poisoned");
            runtimes
                .values()
                .filter_map(|rt| {
                    let (ack_tx, ack_rx) = bounded(1);
                    rt.tasks
                        .send(SdTask::Drain { ack: ack_tx })
                        .ok()
                        .map(|_| (rt.current_sd_id(), ack_rx))
                })
                .collect()
        };

        let mut drained = true;
        for (sd_id, ack) in acks {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if ack.recv_timeout(remaining).is_err() {
                warn!(%sd_id, "timed out waiting for pending syncs");
                drained = false;
            }
        }
        drained
    }

    /// Record a local edit's update bytes in our own activity log.
    /// Durable when it returns; failure must surface to the caller.
    pub fn record_update(
        &self,
        sd_id: SdId,
        note_id: NoteId,
        update: Bytes,
    ) -> EngineResult<u64> {
        let now_ms = WallClock::now().get();
        self.with_runtime(sd_id, |rt| {
            if rt.cache.is_tombstoned(note_id)? {
                return Err(EngineError::NoteDeleted { note_id });
            }
            let mut logger = rt.activity_logger.lock().expect("activity logger poisoned");
            Ok(logger.record_update(note_id, update, now_ms)?)
        })?
    }

    /// Permanently delete a note: tombstone in our deletion log, then
    /// the full local effect (document unload, on-disk removal, cache
    /// purge). Peers replay the tombstone from the log.
    pub fn record_deletion(&self, sd_id: SdId, note_id: NoteId) -> EngineResult<()> {
        let now_ms = WallClock::now().get();
        self.with_runtime(sd_id, |rt| {
            {
                let mut logger = rt.deletion_logger.lock().expect("deletion logger poisoned");
                logger.record_deletion(note_id, now_ms)?;
            }

            rt.registry.unload(note_id);
            remove_dir_if_present(&paths::note_dir(&rt.root, note_id))?;
            remove_dir_if_present(&paths::note_media_dir(&rt.root, note_id))?;
            rt.cache.delete_note(note_id)?;
            rt.cache
                .insert_tombstone(&Tombstone::new(note_id, now_ms, self.instance_id))?;
            Ok(())
        })?
    }

    /// Fold our activity log into per-note snapshots when it has
    /// outgrown the threshold. No-op otherwise.
    pub fn compact_activity_log(&self, sd_id: SdId) -> EngineResult<bool> {
        let now_ms = WallClock::now().get();
        self.with_runtime(sd_id, |rt| {
            let mut logger = rt.activity_logger.lock().expect("activity logger poisoned");
            if !logger.needs_compaction(&self.limits) {
                return Ok(false);
            }

            let mut snapshots = Vec::new();
            for note_id in logger.notes_in_log()? {
                if rt.cache.is_tombstoned(note_id)? {
                    continue;
                }
                // A note we cannot materialize must keep its records;
                // compacting it away would lose them.
                let state = rt.registry.encode_state(&rt.root, note_id)?;
                snapshots.push((note_id, Bytes::from(state)));
            }
            logger.compact(snapshots, now_ms)?;
            Ok(true)
        })?
    }

    pub fn get_watermarks(&self, sd_id: SdId) -> EngineResult<Vec<WatermarkRow>> {
        self.with_runtime(sd_id, |rt| Ok(rt.cache.load_watermarks()?))?
    }

    pub fn load_skipped_entries(&self, sd_id: SdId) -> EngineResult<Vec<SkippedEntry>> {
        let now_ms = WallClock::now().get();
        self.with_activity_sync(sd_id, |sync| Ok(sync.load_skipped_entries(now_ms)?))
    }

    /// Explicitly abandon a skipped record, advancing the watermark
    /// past it.
    pub fn skip_entry(&self, sd_id: SdId, entry: &SkippedEntry) -> EngineResult<()> {
        self.with_activity_sync(sd_id, |sync| Ok(sync.skip_entry(entry)?))
    }

    /// Drop bookkeeping for vanished logs and delete fully-replayed
    /// logs of departed instances.
    pub fn cleanup_orphaned_logs(&self, sd_id: SdId) -> EngineResult<()> {
        self.with_activity_sync(sd_id, |sync| Ok(sync.cleanup_orphaned_logs()?))
    }

    /// Move a note to another storage directory (both must be set up).
    /// Destination conflict policy is the caller's, resolved before
    /// this call.
    pub fn move_note(
        &self,
        source_sd: SdId,
        target_sd: SdId,
        note_id: NoteId,
        target_folder: FolderId,
    ) -> EngineResult<MoveId> {
        let now_ms = WallClock::now().get();
        let (source_root, source_cache, source_registry) = self.with_runtime(source_sd, |rt| {
            Ok::<_, EngineError>((rt.root.clone(), Arc::clone(&rt.cache), Arc::clone(&rt.registry)))
        })??;
        let target_root = self.with_runtime(target_sd, |rt| Ok::<_, EngineError>(rt.root.clone()))??;

        let manager = MoveManager::new(self.instance_id, self.limits.clone());
        let ends = MoveEnds {
            source_root: &source_root,
            source_sd,
            target_root: &target_root,
            target_sd,
        };
        let move_id = manager.begin_move(&ends, note_id, target_folder, now_ms)?;

        // The source no longer owns the note (no tombstone: the note
        // lives on at the target).
        source_registry.unload(note_id);
        source_cache.delete_note(note_id)?;
        Ok(move_id)
    }

    /// Moves in this directory abandoned by their initiating instance.
    pub fn get_stale_moves(&self, sd_id: SdId) -> EngineResult<Vec<MoveState>> {
        let now_ms = WallClock::now().get();
        let root = self.with_runtime(sd_id, |rt| Ok::<_, EngineError>(rt.root.clone()))??;
        let manager = MoveManager::new(self.instance_id, self.limits.clone());
        Ok(manager.get_stale_moves(&root, now_ms)?)
    }

    /// Adopt an abandoned move and finish it from its last completed
    /// step.
    pub fn take_over_move(&self, source_sd: SdId, move_id: MoveId) -> EngineResult<()> {
        let now_ms = WallClock::now().get();
        let (source_root, source_cache, source_registry) = self.with_runtime(source_sd, |rt| {
            Ok::<_, EngineError>((rt.root.clone(), Arc::clone(&rt.cache), Arc::clone(&rt.registry)))
        })??;

        let manager = MoveManager::new(self.instance_id, self.limits.clone());
        let state = scan_moves(&source_root, &self.limits)?
            .remove(&move_id)
            .ok_or(MoveError::UnknownMove { move_id })?;

        let target_root =
            self.with_runtime(state.target_sd, |rt| Ok::<_, EngineError>(rt.root.clone()))??;
        let ends = MoveEnds {
            source_root: &source_root,
            source_sd,
            target_root: &target_root,
            target_sd: state.target_sd,
        };
        manager.take_over_move(&ends, move_id, now_ms)?;

        source_registry.unload(state.note_id);
        source_cache.delete_note(state.note_id)?;
        Ok(())
    }

    /// Roll back an abandoned move's partial copies and cancel it.
    pub fn cancel_move(&self, source_sd: SdId, move_id: MoveId) -> EngineResult<()> {
        let now_ms = WallClock::now().get();
        let source_root =
            self.with_runtime(source_sd, |rt| Ok::<_, EngineError>(rt.root.clone()))??;

        let manager = MoveManager::new(self.instance_id, self.limits.clone());
        let state = scan_moves(&source_root, &self.limits)?
            .remove(&move_id)
            .ok_or(MoveError::UnknownMove { move_id })?;
        let target_root =
            self.with_runtime(state.target_sd, |rt| Ok::<_, EngineError>(rt.root.clone()))??;

        let ends = MoveEnds {
            source_root: &source_root,
            source_sd,
            target_root: &target_root,
            target_sd: state.target_sd,
        };
        Ok(manager.cancel_move(&ends, move_id, now_ms)?)
    }

    /// Current startup phase of a storage directory.
    pub fn sync_phase(&self, sd_id: SdId) -> EngineResult<SyncPhase> {
        self.with_runtime(sd_id, |rt| Ok::<_, EngineError>(rt.phase.get()))?
    }

    fn with_runtime<T>(
        &self,
        sd_id: SdId,
        f: impl FnOnce(&SdRuntime) -> T,
    ) -> EngineResult<T> {
        let runtimes = self.runtimes.lock().expect("runtimes poisoned");
        let runtime = runtimes
            .values()
            .find(|rt| rt.current_sd_id() == sd_id)
            .ok_or(EngineError::UnknownSd { sd_id })?;
        Ok(f(runtime))
    }

    /// Maintenance entry points run on an ephemeral sync driver; safe
    /// beside the worker because they only remove state the worker has
    /// fully consumed.
    fn with_activity_sync<T>(
        &self,
        sd_id: SdId,
        f: impl FnOnce(&ActivitySync) -> EngineResult<T>,
    ) -> EngineResult<T> {
        let sync = self.with_runtime(sd_id, |rt| {
            ActivitySync::new(
                rt.root.clone(),
                self.instance_id,
                Arc::clone(&rt.cache),
                Arc::clone(&rt.registry),
                self.limits.clone(),
            )
        })?;
        f(&sync)
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        self.cleanup_all_watchers();
    }
}

fn teardown(mut runtime: SdRuntime) {
    let sd_id = runtime.current_sd_id();
    runtime.watcher.take();
    for timer in &mut runtime.poll_timers {
        timer.stop();
    }
    let _ = runtime.tasks.send(SdTask::Shutdown);
    if let Some(worker) = runtime.worker.take() {
        let _ = worker.join();
    }
    info!(%sd_id, root = %runtime.root.display(), "storage directory torn down");
}

/// Find the cache directory for an identity, following adoption: the
/// directory keeps its original name, but its meta row carries the
/// adopted id.
fn locate_cache_dir(sd_id: SdId) -> PathBuf {
    let default = paths::sd_cache_dir(sd_id);
    if default.exists() {
        return default;
    }

    let root = paths::sd_data_root();
    let Ok(entries) = fs::read_dir(&root) else {
        return default;
    };
    for entry in entries.flatten() {
        let dir = entry.path();
        if !dir.is_dir() {
            continue;
        }
        match NoteCache::peek_sd_id(&dir) {
            Ok(Some(found)) if found == sd_id => return dir,
            Ok(_) => {}
            Err(err) => {
                warn!(dir = %dir.display(), error = %err, "unreadable cache directory");
            }
        }
    }
    default
}

fn remove_dir_if_present(dir: &Path) -> Result<(), EngineError> {
    match fs::remove_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(EngineError::Log(LogError::io(dir, source))),
    }
}
