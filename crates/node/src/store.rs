//! Node persistence.
//!
//! Two tables: the local job list and the results waiting for upload.
//!
//! ```text
//! jobs    (id, period, start, cmd)
//! results (id, start, duration, flags, err, result)
//! ```
//!
//! `cmd` is the check tokens joined by spaces; `result` is the output
//! list in the quoted string-array form and must round-trip through
//! `benchnet_common::strarray` on load.

use std::path::Path;

use benchnet_proto::JobSpec;
use benchnet_stdb::{sql_params, Db, DbError};
use thiserror::Error;

use benchnet_common::{strarray, CheckResult};

const CREATE_JOBS: &str = "CREATE TABLE IF NOT EXISTS jobs \
    (id INTEGER PRIMARY KEY, period INTEGER, start INTEGER, cmd TEXT)";
const CREATE_RESULTS: &str = "CREATE TABLE IF NOT EXISTS results \
    (id INTEGER, start INTEGER, duration INTEGER, flags INTEGER, err TEXT, result TEXT)";
const INSERT_JOB: &str =
    "INSERT OR REPLACE INTO jobs (id, period, start, cmd) VALUES (?, ?, ?, ?)";
const SELECT_JOBS: &str = "SELECT id, period, start, cmd FROM jobs";
const DELETE_JOB: &str = "DELETE FROM jobs WHERE id = ?";
const INSERT_RESULT: &str = "INSERT OR REPLACE INTO results \
    (id, start, duration, flags, err, result) VALUES (?, ?, ?, ?, ?, ?)";
const SELECT_RESULTS: &str =
    "SELECT id, start, duration, flags, err, result FROM results WHERE start >= ?";
const DELETE_RESULTS: &str = "DELETE FROM results WHERE start < ?";

#[derive(Debug, Error)]
pub enum NodeStoreError {
    #[error(transparent)]
    Db(#[from] DbError),
    /// A stored `result` column failed to parse back.
    #[error("result column: {0}")]
    BadResult(#[from] strarray::StrArrayError),
}

/// Opens the node database and creates missing tables.
pub async fn open(path: impl AsRef<Path>) -> Result<Db, NodeStoreError> {
    let db = Db::open(path).await?;
    for stmt in [CREATE_JOBS, CREATE_RESULTS] {
        if let Err(e) = db.exec(stmt, vec![]).await {
            let _ = db.close().await;
            return Err(e.into());
        }
    }
    Ok(db)
}

/// Loads the persisted job list, in id order.
pub async fn load_jobs(db: &Db) -> Result<Vec<JobSpec>, NodeStoreError> {
    let mut rows = db.query(SELECT_JOBS, vec![]).await?;
    let mut jobs = Vec::new();
    while let Some(row) = rows.next().await? {
        let cmd: String = row.get(3)?;
        jobs.push(JobSpec {
            id: row.get(0)?,
            period: row.get(1)?,
            start: row.get(2)?,
            check: cmd.split_whitespace().map(str::to_string).collect(),
        });
    }
    jobs.sort_by_key(|j| j.id);
    Ok(jobs)
}

/// Replaces the persisted job table in one transaction: rows for stopped
/// jobs go away, rows for new jobs come in. Unchanged jobs are left
/// untouched.
pub async fn replace_jobs(
    db: &Db,
    delete: &[u64],
    insert: &[JobSpec],
) -> Result<(), NodeStoreError> {
    let tx = db.begin().await?;
    for id in delete {
        if let Err(e) = tx.exec(DELETE_JOB, sql_params![*id as i64]).await {
            let _ = tx.rollback().await;
            return Err(e.into());
        }
    }
    for job in insert {
        let res = tx
            .exec(
                INSERT_JOB,
                sql_params![
                    job.id as i64,
                    job.period as i64,
                    job.start as i64,
                    job.cmd()
                ],
            )
            .await;
        if let Err(e) = res {
            let _ = tx.rollback().await;
            return Err(e.into());
        }
    }
    tx.commit().await?;
    Ok(())
}

/// Persists one check result.
pub async fn insert_result(db: &Db, r: &CheckResult) -> Result<(), NodeStoreError> {
    db.exec(
        INSERT_RESULT,
        sql_params![
            r.job_id as i64,
            r.start,
            r.rt,
            r.flags as i64,
            r.errs.clone(),
            strarray::print(&r.output)
        ],
    )
    .await?;
    Ok(())
}

/// Loads results that started at or after `since` (nanoseconds).
pub async fn load_results(db: &Db, since: u64) -> Result<Vec<CheckResult>, NodeStoreError> {
    let mut rows = db.query(SELECT_RESULTS, sql_params![since as i64]).await?;
    let mut out = Vec::new();
    while let Some(row) = rows.next().await? {
        let rendered: String = row.get(5)?;
        out.push(CheckResult {
            job_id: row.get(0)?,
            start: row.get(1)?,
            rt: row.get(2)?,
            flags: row.get(3)?,
            errs: row.get(4)?,
            output: strarray::parse(&rendered)?,
        });
    }
    Ok(out)
}

/// Deletes results that started before `cutoff` (nanoseconds).
pub async fn delete_results(db: &Db, cutoff: u64) -> Result<(), NodeStoreError> {
    db.exec(DELETE_RESULTS, sql_params![cutoff as i64]).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn fresh() -> (Db, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db = open(dir.path().join("n.db")).await.unwrap();
        (db, dir)
    }

    fn spec(id: u64) -> JobSpec {
        JobSpec {
            id,
            period: 60,
            start: 5,
            check: vec!["dns".into(), "x.example".into()],
        }
    }

    #[tokio::test]
    async fn jobs_roundtrip() {
        let (db, _dir) = fresh().await;
        replace_jobs(&db, &[], &[spec(2), spec(1)]).await.unwrap();
        let jobs = load_jobs(&db).await.unwrap();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].id, 1, "sorted by id");
        assert_eq!(jobs[1].id, 2);
        assert_eq!(jobs[0].check, vec!["dns".to_string(), "x.example".to_string()]);
    }

    #[tokio::test]
    async fn replace_deletes_and_inserts() {
        let (db, _dir) = fresh().await;
        replace_jobs(&db, &[], &[spec(1), spec(2)]).await.unwrap();
        replace_jobs(&db, &[1], &[spec(3)]).await.unwrap();
        let ids: Vec<u64> = load_jobs(&db).await.unwrap().iter().map(|j| j.id).collect();
        assert_eq!(ids, vec![2, 3]);
    }

    #[tokio::test]
    async fn results_roundtrip_and_trim() {
        let (db, _dir) = fresh().await;
        for (id, start) in [(1u64, 100i64), (2, 200), (3, 300)] {
            insert_result(
                &db,
                &CheckResult {
                    job_id: id,
                    flags: 0,
                    start,
                    rt: 5,
                    errs: String::new(),
                    output: vec!["out\r\n".into(), "žž".into()],
                },
            )
            .await
            .unwrap();
        }
        let all = load_results(&db, 0).await.unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].output, vec!["out\r\n".to_string(), "žž".to_string()]);

        let recent = load_results(&db, 200).await.unwrap();
        assert_eq!(recent.len(), 2);

        delete_results(&db, 250).await.unwrap();
        let left = load_results(&db, 0).await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].job_id, 3);
    }

    #[tokio::test]
    async fn empty_output_roundtrips() {
        let (db, _dir) = fresh().await;
        insert_result(&db, &CheckResult { job_id: 1, start: 1, ..CheckResult::default() })
            .await
            .unwrap();
        let all = load_results(&db, 0).await.unwrap();
        assert!(all[0].output.is_empty());
    }
}
