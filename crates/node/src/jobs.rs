//! The live job table.
//!
//! Each valid job owns one [`Timer`] task that runs the check on the
//! wall-clock grid and persists the result. Merging a job list received
//! from the server pairs old and new entries by id: an entry whose
//! `(id, period, start, check)` is unchanged keeps its running task;
//! everything else is stopped, started, or dropped. The new table is
//! persisted in one transaction *before* the live state is swapped.

use std::sync::Arc;
use std::time::Duration;

use benchnet_proto::JobSpec;
use benchnet_stdb::Db;
use futures::future::join_all;
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

use benchnet_common::check;

use crate::store::{self, NodeStoreError};
use crate::timer::Timer;
use crate::check as runner;

pub struct JobEntry {
    pub spec: JobSpec,
    pub timer: Option<Timer>,
}

/// Owns the job table and the per-job timer tasks.
pub struct Runner {
    db: Db,
    table: Mutex<Vec<JobEntry>>,
}

/// A job the node is willing to run: positive period, known check.
fn valid(spec: &JobSpec) -> bool {
    spec.period > 0 && check::validate(&spec.check)
}

impl Runner {
    pub fn new(db: Db) -> Arc<Runner> {
        Arc::new(Runner { db, table: Mutex::new(Vec::new()) })
    }

    /// Loads the persisted job list and starts a timer per valid job.
    pub async fn load(&self) -> Result<(), NodeStoreError> {
        let specs = store::load_jobs(&self.db).await?;
        let mut table = self.table.lock().await;
        for spec in specs {
            if !valid(&spec) {
                error!("invalid job {}: {:?}", spec.id, spec.check);
                continue;
            }
            table.push(JobEntry { spec, timer: None });
        }
        for entry in table.iter_mut() {
            entry.timer = Some(self.start_timer(&entry.spec));
        }
        Ok(())
    }

    fn start_timer(&self, spec: &JobSpec) -> Timer {
        debug!(
            "start job {}: period {}, start {}, check {:?}",
            spec.id, spec.period, spec.start, spec.check
        );
        let db = self.db.clone();
        let spec = spec.clone();
        Timer::spawn(
            Duration::from_secs(spec.period as u64),
            Duration::from_secs(spec.start as u64),
            move || {
                let db = db.clone();
                let spec = spec.clone();
                async move {
                    let result = runner::run(spec.id, &spec.check).await;
                    if let Err(e) = store::insert_result(&db, &result).await {
                        error!("job {}: {e}", spec.id);
                    }
                }
            },
        )
    }

    /// Installs a job list received from the server.
    ///
    /// Invalid entries are dropped. Unchanged entries keep their running
    /// task. The table is persisted before the swap; a storage failure
    /// leaves the live state untouched.
    pub async fn merge(&self, mut new: Vec<JobSpec>) -> Result<(), NodeStoreError> {
        new.sort_by_key(|j| j.id);
        let before = new.len();
        new.retain(|j| {
            if valid(j) {
                true
            } else {
                warn!("dropping invalid job {}: {:?}", j.id, j.check);
                false
            }
        });
        debug!("merging {} jobs ({} dropped)", new.len(), before - new.len());

        let mut table = self.table.lock().await;
        let mut incoming: Vec<JobEntry> =
            new.into_iter().map(|spec| JobEntry { spec, timer: None }).collect();

        // pair by id (both sides sorted); identical specs hand their
        // task over, leaving None behind in the old entry
        transfer(&mut table, &mut incoming, false);

        // old entries still holding a task are going away or changing;
        // incoming entries without one are new or changed
        let delete: Vec<u64> = table
            .iter()
            .filter(|e| e.timer.is_some())
            .map(|e| e.spec.id)
            .collect();
        let insert: Vec<JobSpec> = incoming
            .iter()
            .filter(|e| e.timer.is_none())
            .map(|e| e.spec.clone())
            .collect();
        if let Err(e) = store::replace_jobs(&self.db, &delete, &insert).await {
            // hand the transferred tasks back; the old table stays live
            transfer(&mut incoming, &mut table, true);
            return Err(e);
        }

        // stop obsolete tasks in parallel
        let stops: Vec<(u64, Timer)> = table
            .iter_mut()
            .filter_map(|e| e.timer.take().map(|t| (e.spec.id, t)))
            .collect();
        join_all(stops.into_iter().map(|(id, t)| async move {
            t.stop().await;
            debug!("killed job {id}");
        }))
        .await;

        *table = incoming;
        for entry in table.iter_mut() {
            if entry.timer.is_none() {
                entry.timer = Some(self.start_timer(&entry.spec));
            }
        }
        Ok(())
    }

    /// Stops every job task and waits for all of them, in parallel.
    pub async fn stop_all(&self) {
        let mut table = self.table.lock().await;
        let stops: Vec<(u64, Timer)> = table
            .iter_mut()
            .filter_map(|e| e.timer.take().map(|t| (e.spec.id, t)))
            .collect();
        join_all(stops.into_iter().map(|(id, t)| async move {
            t.stop().await;
            debug!("killed job {id}");
        }))
        .await;
    }

    /// Snapshot of `(job id, timer id)` pairs, in table order.
    pub async fn timer_ids(&self) -> Vec<(u64, Option<u64>)> {
        self.table
            .lock()
            .await
            .iter()
            .map(|e| (e.spec.id, e.timer.as_ref().map(Timer::id)))
            .collect()
    }
}

/// Moves tasks between matching entries of two id-sorted tables. With
/// `back == false` only identical specs transfer (merge); with
/// `back == true` any id match transfers (undo after a failed persist).
fn transfer(from: &mut [JobEntry], to: &mut [JobEntry], back: bool) {
    let mut i = 0;
    let mut j = 0;
    while i < from.len() && j < to.len() {
        if from[i].spec.id == to[j].spec.id {
            if from[i].timer.is_some() && (back || from[i].spec == to[j].spec) {
                to[j].timer = from[i].timer.take();
            }
            i += 1;
            j += 1;
        } else if from[i].spec.id < to[j].spec.id {
            i += 1;
        } else {
            j += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(id: u64, period: u32, host: &str) -> JobSpec {
        JobSpec {
            id,
            period,
            start: 0,
            check: vec!["dns".into(), host.into()],
        }
    }

    async fn fresh() -> (Arc<Runner>, Db, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db = store::open(dir.path().join("n.db")).await.unwrap();
        (Runner::new(db.clone()), db, dir)
    }

    #[tokio::test]
    async fn merge_starts_everything_from_empty() {
        let (r, db, _dir) = fresh().await;
        r.merge(vec![spec(1, 3600, "a"), spec(2, 3600, "b")]).await.unwrap();
        let ids = r.timer_ids().await;
        assert_eq!(ids.len(), 2);
        assert!(ids.iter().all(|(_, t)| t.is_some()));
        // persisted too
        assert_eq!(store::load_jobs(&db).await.unwrap().len(), 2);
        r.stop_all().await;
    }

    #[tokio::test]
    async fn unchanged_jobs_keep_their_task() {
        let (r, _db, _dir) = fresh().await;
        r.merge(vec![spec(1, 3600, "a"), spec(2, 3600, "b")]).await.unwrap();
        let before = r.timer_ids().await;
        r.merge(vec![spec(1, 3600, "a"), spec(2, 3600, "b")]).await.unwrap();
        let after = r.timer_ids().await;
        assert_eq!(before, after, "unchanged jobs must not restart");
        r.stop_all().await;
    }

    #[tokio::test]
    async fn changed_job_restarts() {
        let (r, _db, _dir) = fresh().await;
        r.merge(vec![spec(1, 3600, "a"), spec(2, 3600, "b")]).await.unwrap();
        let before = r.timer_ids().await;
        // job 2 changes period, job 1 stays
        r.merge(vec![spec(1, 3600, "a"), spec(2, 7200, "b")]).await.unwrap();
        let after = r.timer_ids().await;
        assert_eq!(after[0], before[0], "job 1 restarted");
        assert_eq!(after[1].0, 2);
        assert_ne!(after[1].1, before[1].1, "job 2 kept its stale task");
        r.stop_all().await;
    }

    #[tokio::test]
    async fn removed_and_added_jobs() {
        let (r, db, _dir) = fresh().await;
        r.merge(vec![spec(1, 3600, "a"), spec(2, 3600, "b")]).await.unwrap();
        r.merge(vec![spec(2, 3600, "b"), spec(3, 3600, "c")]).await.unwrap();
        let ids: Vec<u64> = r.timer_ids().await.iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, vec![2, 3]);
        let persisted: Vec<u64> =
            store::load_jobs(&db).await.unwrap().iter().map(|j| j.id).collect();
        assert_eq!(persisted, vec![2, 3]);
        r.stop_all().await;
    }

    #[tokio::test]
    async fn invalid_jobs_are_dropped() {
        let (r, db, _dir) = fresh().await;
        let bogus = JobSpec { id: 9, period: 60, start: 0, check: vec!["smtp".into(), "x".into()] };
        let zero_period = JobSpec { id: 10, period: 0, start: 0, check: vec!["dns".into(), "x".into()] };
        r.merge(vec![spec(1, 3600, "a"), bogus, zero_period]).await.unwrap();
        let ids: Vec<u64> = r.timer_ids().await.iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, vec![1]);
        assert_eq!(store::load_jobs(&db).await.unwrap().len(), 1);
        r.stop_all().await;
    }

    #[tokio::test]
    async fn merge_sorts_incoming_lists() {
        let (r, _db, _dir) = fresh().await;
        r.merge(vec![spec(3, 3600, "c"), spec(1, 3600, "a"), spec(2, 3600, "b")])
            .await
            .unwrap();
        let ids: Vec<u64> = r.timer_ids().await.iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        r.stop_all().await;
    }

    #[tokio::test]
    async fn failed_persist_leaves_live_state_alone() {
        let (r, db, _dir) = fresh().await;
        r.merge(vec![spec(1, 3600, "a")]).await.unwrap();
        let before = r.timer_ids().await;
        db.close().await.unwrap();
        let err = r.merge(vec![spec(1, 3600, "a"), spec(2, 3600, "b")]).await;
        assert!(err.is_err());
        let after = r.timer_ids().await;
        assert_eq!(before, after, "table changed despite storage failure");
        r.stop_all().await;
    }

    #[tokio::test]
    async fn load_starts_persisted_jobs() {
        let (r, db, _dir) = fresh().await;
        store::replace_jobs(&db, &[], &[spec(1, 3600, "a"), spec(2, 3600, "b")])
            .await
            .unwrap();
        r.load().await.unwrap();
        let ids = r.timer_ids().await;
        assert_eq!(ids.len(), 2);
        assert!(ids.iter().all(|(_, t)| t.is_some()));
        r.stop_all().await;
    }

    #[tokio::test]
    async fn stop_all_clears_tasks() {
        let (r, _db, _dir) = fresh().await;
        r.merge(vec![spec(1, 3600, "a")]).await.unwrap();
        r.stop_all().await;
        let ids = r.timer_ids().await;
        assert_eq!(ids.len(), 1);
        assert!(ids[0].1.is_none());
    }
}
