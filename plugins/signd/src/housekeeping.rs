use crate::{api::AppState, model::Process, storage::FileLookup};
use anyhow::Result;
use std::collections::HashMap;
use tokio::{
    task::JoinHandle,
    time::{interval, Duration, MissedTickBehavior},
};
use tracing::{error, info, warn};

/// Timer id the host uses for cleanup ticks.
pub const CLEANUP_TIMER_ID: &str = "signd.cleanup";

/// The mapping table as seen by the cleanup.
pub trait MappingStore: Send + Sync {
    fn find_all(&self) -> Result<Vec<Process>>;
    fn delete(&self, process: &Process) -> Result<()>;
}

/// Outcome of one sweep.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub total: usize,
    pub deleted: usize,
    pub lookup_failures: usize,
    pub delete_failures: usize,
}

/// Delete mapping rows whose file no longer exists in host storage.
///
/// Each distinct file id is looked up once. A failed lookup counts as
/// "exists" so nothing is deleted on ambiguous state. A failed delete is
/// logged and skipped. Never returns an error.
pub fn sweep_orphans<S, F>(store: &S, files: &F) -> SweepReport
where
    S: MappingStore + ?Sized,
    F: FileLookup + ?Sized,
{
    let processes = match store.find_all() {
        Ok(p) => p,
        Err(e) => {
            error!(error = %e, "cleanup: failed to load processes");
            return SweepReport::default();
        }
    };
    if processes.is_empty() {
        return SweepReport::default();
    }

    let mut report = SweepReport {
        total: processes.len(),
        ..Default::default()
    };
    let mut exists: HashMap<i64, bool> = HashMap::new();
    for process in &processes {
        exists.entry(process.file_id).or_insert_with(|| {
            match files.get_by_id(process.file_id) {
                Ok(nodes) => !nodes.is_empty(),
                Err(e) => {
                    warn!(file_id = process.file_id, error = %e, "cleanup: error checking file");
                    report.lookup_failures += 1;
                    true
                }
            }
        });
    }

    for process in &processes {
        if exists.get(&process.file_id).copied().unwrap_or(true) {
            continue;
        }
        match store.delete(process) {
            Ok(()) => report.deleted += 1,
            Err(e) => {
                error!(
                    process_id = %process.process_id,
                    file_id = process.file_id,
                    error = %e,
                    "cleanup: failed to delete orphaned process"
                );
                report.delete_failures += 1;
            }
        }
    }

    if report.deleted > 0 {
        info!(
            total = report.total,
            deleted = report.deleted,
            "cleanup: checked processes, deleted orphaned entries"
        );
    }
    report
}

/// Run one sweep on a blocking thread.
pub async fn run_once(state: AppState) -> SweepReport {
    let res = tokio::task::spawn_blocking(move || {
        sweep_orphans(&state.processes, state.storage.as_ref())
    })
    .await;
    match res {
        Ok(report) => report,
        Err(e) => {
            error!(error = %e, "cleanup: sweep task failed");
            SweepReport::default()
        }
    }
}

/// Periodically remove orphaned processes when no host timer drives us.
pub fn run_housekeeping(state: AppState, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = interval(every);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // the first tick completes immediately
        tick.tick().await;
        loop {
            tick.tick().await;
            run_once(state.clone()).await;
        }
    })
}
