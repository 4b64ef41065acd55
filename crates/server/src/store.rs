//! Server persistence: schema, catalog loading, and snapshot commits.
//!
//! Database schema:
//!
//! ```text
//! nodes   (id, last, capa, loc, key)      key is the 32-byte network key
//! jobs    (id, period, start, capa, want, cmd)
//! running (job, node)                     one row per placement
//! results (node, job, start, duration, flags, err, result)
//! ```
//!
//! `cmd` is the check tokens joined by spaces; `result` is the output
//! list rendered by `benchnet_common::strarray`.

use std::path::Path;

use benchnet_proto::JobSpec;
use benchnet_stdb::{sql_params, Db, DbError};
use thiserror::Error;
use tracing::{debug, warn};

use benchnet_common::strarray;

use crate::data::{DataState, Diff, Job, Node, TaggedResult};

const CREATE_NODES: &str = "CREATE TABLE IF NOT EXISTS nodes \
    (id INTEGER PRIMARY KEY, last INTEGER, capa INTEGER, loc INTEGER, key BLOB)";
const CREATE_JOBS: &str = "CREATE TABLE IF NOT EXISTS jobs \
    (id INTEGER PRIMARY KEY, period INTEGER, start INTEGER, capa INTEGER, want INTEGER, cmd TEXT)";
const CREATE_RUNNING: &str = "CREATE TABLE IF NOT EXISTS running (job INTEGER, node INTEGER)";
const CREATE_RESULTS: &str = "CREATE TABLE IF NOT EXISTS results \
    (node INTEGER, job INTEGER, start INTEGER, duration INTEGER, \
     flags INTEGER, err TEXT, result TEXT)";

const SELECT_NODES: &str = "SELECT id, last, capa, loc, key FROM nodes";
const INSERT_NODE: &str =
    "INSERT OR REPLACE INTO nodes (id, last, capa, loc, key) VALUES (?, ?, ?, ?, ?)";
const DELETE_NODE: &str = "DELETE FROM nodes WHERE id = ?";
const SELECT_JOBS: &str = "SELECT id, period, start, capa, want, cmd FROM jobs";
const INSERT_JOB: &str =
    "INSERT OR REPLACE INTO jobs (id, period, start, capa, want, cmd) VALUES (?, ?, ?, ?, ?, ?)";
const DELETE_JOB: &str = "DELETE FROM jobs WHERE id = ?";
const SELECT_RUNNING: &str = "SELECT job, node FROM running";
const INSERT_RUNNING: &str = "INSERT OR REPLACE INTO running (job, node) VALUES (?, ?)";
const DELETE_RUNNING: &str = "DELETE FROM running WHERE job = ? AND node = ?";
const INSERT_RESULT: &str = "INSERT OR REPLACE INTO results \
    (node, job, start, duration, flags, err, result) VALUES (?, ?, ?, ?, ?, ?, ?)";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Db(#[from] DbError),
    /// The `running` table references a job the `jobs` table lacks.
    #[error("job {0} not found")]
    JobNotFound(u64),
    /// The `running` table references a node the `nodes` table lacks.
    #[error("node {0} not found")]
    NodeNotFound(u64),
    /// A stored network key is not exactly 32 bytes.
    #[error("node {node}: bad key length {len}")]
    BadKey { node: u64, len: usize },
}

/// Opens the database and creates any missing tables.
pub async fn open(path: impl AsRef<Path>) -> Result<Db, StoreError> {
    let db = Db::open(path).await?;
    for stmt in [CREATE_JOBS, CREATE_NODES, CREATE_RUNNING, CREATE_RESULTS] {
        if let Err(e) = db.exec(stmt, vec![]).await {
            let _ = db.close().await;
            return Err(e.into());
        }
    }
    Ok(db)
}

/// Loads nodes, jobs, and placements into a fresh in-memory state.
pub async fn load(db: &Db) -> Result<DataState, StoreError> {
    let mut state = DataState::default();
    load_nodes(db, &mut state).await?;
    load_jobs(db, &mut state).await?;
    load_running(db, &mut state).await?;
    Ok(state)
}

async fn load_nodes(db: &Db, state: &mut DataState) -> Result<(), StoreError> {
    let mut rows = db.query(SELECT_NODES, vec![]).await?;
    while let Some(row) = rows.next().await? {
        let id: u64 = row.get(0)?;
        let key_bytes: Vec<u8> = row.get(4)?;
        let key: [u8; 32] = key_bytes
            .try_into()
            .map_err(|v: Vec<u8>| StoreError::BadKey { node: id, len: v.len() })?;
        let node = Node {
            id,
            last_seen: row.get(1)?,
            capa: row.get(2)?,
            used: 0,
            loc: row.get(3)?,
            key,
            jobs: vec![],
        };
        state.nodes.insert(id, node);
    }
    Ok(())
}

async fn load_jobs(db: &Db, state: &mut DataState) -> Result<(), StoreError> {
    let mut rows = db.query(SELECT_JOBS, vec![]).await?;
    while let Some(row) = rows.next().await? {
        let cmd: String = row.get(5)?;
        let spec = JobSpec {
            id: row.get(0)?,
            period: row.get(1)?,
            start: row.get(2)?,
            check: cmd.split_whitespace().map(str::to_string).collect(),
        };
        let want: i64 = row.get(4)?;
        let job = Job {
            capa: row.get(3)?,
            want: want.max(0) as usize,
            nodes: vec![],
            spec,
        };
        state.jobs.insert(job.id(), job);
    }
    Ok(())
}

async fn load_running(db: &Db, state: &mut DataState) -> Result<(), StoreError> {
    let mut rows = db.query(SELECT_RUNNING, vec![]).await?;
    let mut links = Vec::new();
    while let Some(row) = rows.next().await? {
        links.push((row.get::<u64>(0)?, row.get::<u64>(1)?));
    }
    for (job, node) in links {
        if !state.jobs.contains_key(&job) {
            return Err(StoreError::JobNotFound(job));
        }
        if !state.nodes.contains_key(&node) {
            return Err(StoreError::NodeNotFound(node));
        }
        state.attach(job, node);
    }
    Ok(())
}

/// Applies one snapshot of diffs and results in a single transaction.
/// On failure the transaction is rolled back and the snapshot is
/// dropped; in-memory state is the source of truth until restart.
pub async fn commit(db: &Db, diffs: Vec<Diff>, results: Vec<TaggedResult>) {
    debug!("commit starting");
    if let Err(e) = try_commit(db, diffs, results).await {
        warn!("commit failed: {e}");
    }
    debug!("commit done");
}

async fn try_commit(db: &Db, diffs: Vec<Diff>, results: Vec<TaggedResult>) -> Result<(), DbError> {
    let tx = db.begin().await?;
    for diff in diffs {
        let res = match diff {
            Diff::AddLink { job, node } => {
                tx.exec(INSERT_RUNNING, sql_params![job as i64, node as i64]).await
            }
            Diff::RmLink { job, node } => {
                tx.exec(DELETE_RUNNING, sql_params![job as i64, node as i64]).await
            }
            Diff::AddNode(n) => {
                tx.exec(
                    INSERT_NODE,
                    sql_params![
                        n.id as i64,
                        n.last_seen as i64,
                        n.capa as i64,
                        n.loc as i64,
                        n.key.to_vec()
                    ],
                )
                .await
            }
            Diff::RmNode(id) => tx.exec(DELETE_NODE, sql_params![id as i64]).await,
            Diff::AddJob(j) => {
                tx.exec(
                    INSERT_JOB,
                    sql_params![
                        j.id() as i64,
                        j.spec.period as i64,
                        j.spec.start as i64,
                        j.capa as i64,
                        j.want as i64,
                        j.spec.cmd()
                    ],
                )
                .await
            }
            Diff::RmJob(id) => tx.exec(DELETE_JOB, sql_params![id as i64]).await,
        };
        if let Err(e) = res {
            let _ = tx.rollback().await;
            return Err(e);
        }
    }
    for r in results {
        let res = tx
            .exec(
                INSERT_RESULT,
                sql_params![
                    r.node_id as i64,
                    r.result.job_id as i64,
                    r.result.start,
                    r.result.rt,
                    r.result.flags as i64,
                    r.result.errs,
                    strarray::print(&r.result.output)
                ],
            )
            .await;
        if let Err(e) = res {
            let _ = tx.rollback().await;
            return Err(e);
        }
    }
    tx.commit().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{test_job, test_node, Op};
    use benchnet_common::CheckResult;

    async fn fresh() -> (Db, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db = open(dir.path().join("s.db")).await.unwrap();
        (db, dir)
    }

    #[tokio::test]
    async fn roundtrip_catalogs() {
        let (db, _dir) = fresh().await;
        let mut s = DataState::default();
        let mut n = test_node(7, 10);
        n.loc = 0xdead;
        n.key = [0x11; 32];
        s.apply(Op::AddNode(n));
        s.apply(Op::AddJob(test_job(1, 3, 2)));
        s.apply(Op::AddLink { job: 1, node: 7 });
        let (diffs, results) = s.take_snapshot();
        commit(&db, diffs, results).await;

        let loaded = load(&db).await.unwrap();
        let n = &loaded.nodes[&7];
        assert_eq!(n.loc, 0xdead);
        assert_eq!(n.key, [0x11; 32]);
        assert_eq!(n.used, 3);
        assert_eq!(n.jobs.len(), 1);
        let j = &loaded.jobs[&1];
        assert_eq!(j.want, 2);
        assert_eq!(j.nodes, vec![7]);
        assert_eq!(j.spec.check, vec!["dns".to_string(), "x.example".to_string()]);
        db.close().await.unwrap();
    }

    #[tokio::test]
    async fn coalesced_link_writes_single_row() {
        // AddLink; RmLink; AddLink nets to one INSERT
        let (db, _dir) = fresh().await;
        let mut s = DataState::default();
        s.apply(Op::AddNode(test_node(7, 10)));
        s.apply(Op::AddJob(test_job(1, 3, 2)));
        s.apply(Op::AddLink { job: 1, node: 7 });
        s.apply(Op::RmLink { job: 1, node: 7 });
        s.apply(Op::AddLink { job: 1, node: 7 });
        let (diffs, results) = s.take_snapshot();
        commit(&db, diffs, results).await;
        let row = db
            .query_row("SELECT COUNT(*) FROM running", vec![])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.get::<i64>(0).unwrap(), 1);
        db.close().await.unwrap();
    }

    #[tokio::test]
    async fn results_round_trip_through_strarray() {
        let (db, _dir) = fresh().await;
        let r = TaggedResult {
            node_id: 7,
            result: CheckResult {
                job_id: 1,
                flags: 1,
                start: 1000,
                rt: 500,
                errs: "x".into(),
                output: vec!["HTTP/1.1 200 OK".into(), "a\r\nb".into()],
            },
        };
        commit(&db, vec![], vec![r.clone()]).await;
        let row = db
            .query_row("SELECT node, job, result FROM results", vec![])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.get::<u64>(0).unwrap(), 7);
        assert_eq!(row.get::<u64>(1).unwrap(), 1);
        let rendered: String = row.get(2).unwrap();
        assert_eq!(strarray::parse(&rendered).unwrap(), r.result.output);
        db.close().await.unwrap();
    }

    #[tokio::test]
    async fn stale_running_row_fails_load() {
        let (db, _dir) = fresh().await;
        db.exec("INSERT INTO running (job, node) VALUES (9, 9)", vec![])
            .await
            .unwrap();
        match load(&db).await {
            Err(StoreError::JobNotFound(9)) => {}
            other => panic!("expected JobNotFound, got {other:?}"),
        }
        db.close().await.unwrap();
    }

    #[tokio::test]
    async fn bad_key_length_fails_load() {
        let (db, _dir) = fresh().await;
        db.exec(
            "INSERT INTO nodes (id, last, capa, loc, key) VALUES (1, 0, 0, 0, ?)",
            sql_params![vec![0u8; 16]],
        )
        .await
        .unwrap();
        match load(&db).await {
            Err(StoreError::BadKey { node: 1, len: 16 }) => {}
            other => panic!("expected BadKey, got {other:?}"),
        }
        db.close().await.unwrap();
    }

    #[tokio::test]
    async fn rm_diffs_delete_rows() {
        let (db, _dir) = fresh().await;
        let mut s = DataState::default();
        s.apply(Op::AddNode(test_node(7, 10)));
        s.apply(Op::AddJob(test_job(1, 3, 1)));
        s.apply(Op::AddLink { job: 1, node: 7 });
        let (diffs, _) = s.take_snapshot();
        commit(&db, diffs, vec![]).await;

        s.apply(Op::RmJob(1));
        s.apply(Op::RmNode(7));
        let (diffs, _) = s.take_snapshot();
        commit(&db, diffs, vec![]).await;

        for table in ["nodes", "jobs", "running"] {
            let row = db
                .query_row(&format!("SELECT COUNT(*) FROM {table}"), vec![])
                .await
                .unwrap()
                .unwrap();
            assert_eq!(row.get::<i64>(0).unwrap(), 0, "{table} not empty");
        }
        db.close().await.unwrap();
    }
}
