//! Watch/poll trigger layer.
//!
//! Two trigger paths feed each storage directory's worker: debounced
//! filesystem notifications, and fixed-interval polls. The poll is not
//! a workaround — cloud-sync clients land files with atomic renames
//! and coalesced events the watcher can miss, so both paths are
//! load-bearing.
//!
//! Everything funnels into one single-consumer channel per storage
//! directory; the worker thread draining it is what serializes replay
//! passes, so two passes can never race on the same watermark.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::channel::{Receiver, Sender, bounded};
use notify::RecursiveMode;
use notify_debouncer_mini::{DebounceEventResult, Debouncer, new_debouncer};
use tracing::{debug, info, trace, warn};

use crate::cache::NoteCache;
use crate::core::{InstanceId, NoteId, SdId, WallClock};
use crate::log::{ActivitySync, DeletionSync, LogResult};
use crate::paths;
use crate::sd;

/// Startup state machine for one storage directory.
///
/// File events observed before `Steady` are logged and dropped: the
/// explicit initial sync covers them, and acting on both would race
/// duplicate imports.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum SyncPhase {
    NotStarted = 0,
    InitialSyncInFlight = 1,
    Steady = 2,
}

impl SyncPhase {
    fn from_u8(value: u8) -> SyncPhase {
        match value {
            0 => SyncPhase::NotStarted,
            1 => SyncPhase::InitialSyncInFlight,
            _ => SyncPhase::Steady,
        }
    }
}

/// Shared, lock-free view of a directory's phase.
#[derive(Clone)]
pub struct PhaseCell(Arc<AtomicU8>);

impl PhaseCell {
    pub fn new() -> Self {
        Self(Arc::new(AtomicU8::new(SyncPhase::NotStarted as u8)))
    }

    pub fn get(&self) -> SyncPhase {
        SyncPhase::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn set(&self, phase: SyncPhase) {
        self.0.store(phase as u8, Ordering::Release);
    }
}

impl Default for PhaseCell {
    fn default() -> Self {
        Self::new()
    }
}

/// How much of a pass to run. Every scope that replays activity also
/// replays deletions first, so a tombstone is always applied before
/// any activity batch could resurrect its note.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncScope {
    Full,
    DeletionsOnly,
}

/// Work items for a storage directory's worker.
pub enum SdTask {
    /// Background pass (watcher or poll); failures are logged and the
    /// next trigger retries.
    Sync { scope: SyncScope, cause: &'static str },
    /// Synchronous pass on behalf of a caller.
    SyncNow {
        scope: SyncScope,
        result: Sender<LogResult<BTreeSet<NoteId>>>,
    },
    /// Queue drain marker: acked once everything before it ran.
    Drain { ack: Sender<()> },
    Shutdown,
}

/// Pushed to the application after a background pass touched notes.
#[derive(Clone, Debug)]
pub struct SyncReport {
    pub sd_id: SdId,
    pub affected: BTreeSet<NoteId>,
    pub cause: &'static str,
}

pub struct SdWorkerCtx {
    pub sd_root: PathBuf,
    pub sd_id: Arc<Mutex<SdId>>,
    pub cache: Arc<NoteCache>,
    pub deletion_sync: DeletionSync,
    pub activity_sync: ActivitySync,
    pub phase: PhaseCell,
    pub reports: Option<Sender<SyncReport>>,
}

/// Single consumer of a storage directory's task queue.
pub fn run_sd_worker(ctx: SdWorkerCtx, tasks: Receiver<SdTask>) {
    while let Ok(task) = tasks.recv() {
        match task {
            SdTask::Sync { scope, cause } => {
                match run_pass(&ctx, scope) {
                    Ok(affected) => {
                        if !affected.is_empty()
                            && let Some(reports) = &ctx.reports
                        {
                            let sd_id = *ctx.sd_id.lock().expect("sd id poisoned");
                            let _ = reports.send(SyncReport {
                                sd_id,
                                affected,
                                cause,
                            });
                        }
                    }
                    Err(err) => {
                        warn!(cause, error = %err, "background sync pass failed; will retry");
                    }
                }
                if ctx.phase.get() == SyncPhase::InitialSyncInFlight {
                    ctx.phase.set(SyncPhase::Steady);
                    info!(sd_root = %ctx.sd_root.display(), "initial sync complete");
                }
            }
            SdTask::SyncNow { scope, result } => {
                let outcome = run_pass(&ctx, scope);
                if ctx.phase.get() == SyncPhase::InitialSyncInFlight {
                    ctx.phase.set(SyncPhase::Steady);
                }
                let _ = result.send(outcome);
            }
            SdTask::Drain { ack } => {
                let _ = ack.send(());
            }
            SdTask::Shutdown => break,
        }
    }
}

fn run_pass(ctx: &SdWorkerCtx, scope: SyncScope) -> LogResult<BTreeSet<NoteId>> {
    reconcile_identity(ctx);

    let now_ms = WallClock::now().get();
    let mut affected = ctx.deletion_sync.sync_from_other_instances(now_ms)?;
    if scope == SyncScope::Full {
        affected.extend(ctx.activity_sync.sync_from_other_instances(now_ms)?);
    }
    Ok(affected)
}

/// Adopt a replaced identity marker before replaying (the folder-sync
/// client may have resolved a creation race in the other machine's
/// favor long after setup).
fn reconcile_identity(ctx: &SdWorkerCtx) {
    let current = *ctx.sd_id.lock().expect("sd id poisoned");
    match sd::reconcile(&ctx.sd_root, current) {
        Ok(Some(adopted)) => {
            if let Err(err) = ctx.cache.set_sd_id(adopted) {
                warn!(error = %err, "failed to persist adopted identity; will retry");
                return;
            }
            *ctx.sd_id.lock().expect("sd id poisoned") = adopted;
            info!(old = %current, new = %adopted, "adopted storage directory identity");
        }
        Ok(None) => {}
        Err(err) => {
            debug!(error = %err, "identity reconciliation failed; will retry");
        }
    }
}

/// Debounced recursive watcher for one storage directory.
///
/// Kept alive by ownership; dropping it stops the OS-level watch.
pub struct SdWatcher {
    _debouncer: Debouncer<notify::RecommendedWatcher>,
}

impl SdWatcher {
    pub fn spawn(
        sd_root: &Path,
        own_instance: InstanceId,
        phase: PhaseCell,
        tasks: Sender<SdTask>,
        debounce: Duration,
    ) -> Result<Self, notify::Error> {
        let root = sd_root.to_path_buf();
        let mut debouncer = new_debouncer(
            debounce,
            move |result: DebounceEventResult| match result {
                Ok(events) => {
                    for event in events {
                        let Some(scope) = classify_event(&event.path, &root, own_instance)
                        else {
                            continue;
                        };
                        if phase.get() != SyncPhase::Steady {
                            // Startup grace: the initial sync will
                            // cover whatever this event announced.
                            debug!(path = %event.path.display(),
                                   "file event during startup; not triggering replay");
                            continue;
                        }
                        trace!(path = %event.path.display(), "file event triggers sync");
                        if tasks
                            .send(SdTask::Sync {
                                scope,
                                cause: "watch",
                            })
                            .is_err()
                        {
                            return;
                        }
                    }
                }
                Err(err) => {
                    warn!(error = %err, "file watcher error");
                }
            },
        )?;

        debouncer
            .watcher()
            .watch(sd_root, RecursiveMode::Recursive)?;

        Ok(Self {
            _debouncer: debouncer,
        })
    }
}

/// Map a filesystem event to a sync scope.
///
/// Only peer log files matter: our own writes, directory events and
/// everything outside `activity/` and `deleted/` are filtered so an
/// instance never reacts to itself.
fn classify_event(path: &Path, sd_root: &Path, own_instance: InstanceId) -> Option<SyncScope> {
    let writer = paths::log_file_writer(path)?;
    if writer == own_instance {
        return None;
    }
    let parent = path.parent()?;
    if parent == paths::activity_dir(sd_root) {
        Some(SyncScope::Full)
    } else if parent == paths::deleted_dir(sd_root) {
        Some(SyncScope::Full)
    } else {
        None
    }
}

/// Fixed-interval poll feeding the same task queue as the watcher.
pub struct PollTimer {
    stop: Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl PollTimer {
    pub fn spawn(
        interval: Duration,
        phase: PhaseCell,
        tasks: Sender<SdTask>,
        scope: SyncScope,
        cause: &'static str,
    ) -> Self {
        let (stop_tx, stop_rx) = bounded::<()>(0);
        let handle = std::thread::spawn(move || {
            loop {
                match stop_rx.recv_timeout(interval) {
                    Err(crossbeam::channel::RecvTimeoutError::Timeout) => {
                        if phase.get() != SyncPhase::Steady {
                            continue;
                        }
                        if tasks.send(SdTask::Sync { scope, cause }).is_err() {
                            break;
                        }
                    }
                    // Stopped, or the timer's owner went away.
                    _ => break,
                }
            }
        });
        Self {
            stop: stop_tx,
            handle: Some(handle),
        }
    }

    pub fn stop(&mut self) {
        let _ = self.stop.send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for PollTimer {
    fn drop(&mut self) {
        self.stop();
    }
}
