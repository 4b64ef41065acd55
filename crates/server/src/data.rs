//! In-memory data model and the serial event loop that owns it.
//!
//! All server state (the node and job catalogs, the running links
//! between them, the pending diff log, and the pending result inserts)
//! is owned by a single task. Everything else talks to it through
//! message passing: reads come back as deep copies, mutations are
//! fire-and-forget operations, and scheduler/commit runs are requested
//! through non-blocking, coalescing channels.
//!
//! The diff log records pending persistent changes in order, coalescing
//! opposites so that e.g. an `AddLink` followed by an `RmLink` for the
//! same pair nets out to nothing. Objects entering the log are copied at
//! mutation time, so later in-memory changes never disturb a snapshot
//! awaiting commit.

use std::collections::BTreeMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::time::Duration;

use benchnet_proto::JobSpec;
use benchnet_stdb::Db;
use futures::FutureExt;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use benchnet_common::CheckResult;

use crate::store;

/// How often the scheduler runs without being asked.
const SCHED_INTERVAL: Duration = Duration::from_secs(600);

/// A deployed probe.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Node {
    pub id: u64,
    /// Time the node last connected, nanoseconds since the Unix epoch.
    pub last_seen: u64,
    /// Total capacity of jobs the node is prepared to run.
    pub capa: u32,
    /// Capacity in use, always the sum of the linked jobs' costs.
    pub used: u32,
    /// Opaque geolocation tag.
    pub loc: u64,
    /// Network key.
    pub key: [u8; 32],
    /// Jobs placed on this node, sorted by id.
    pub jobs: Vec<JobSpec>,
}

/// A recurring check, replicated `want` times across nodes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Job {
    pub spec: JobSpec,
    /// Resource cost of one instance.
    pub capa: u32,
    /// Desired number of copies.
    pub want: usize,
    /// Nodes currently running the job, unsorted.
    pub nodes: Vec<u64>,
}

impl Job {
    pub fn id(&self) -> u64 {
        self.spec.id
    }

    /// True if the job wants to run on more nodes.
    pub fn runnable(&self) -> bool {
        self.nodes.len() < self.want
    }
}

impl Node {
    /// True if this node is willing to take `j`.
    pub fn can_run(&self, j: &Job) -> bool {
        j.capa <= self.capa.saturating_sub(self.used)
            && self.jobs.binary_search_by_key(&j.id(), |s| s.id).is_err()
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Node {}\nlastSeen {}\ncapacity {}, used {}\ngeolocation {}\nkey {}\njobs:",
            self.id,
            self.last_seen,
            self.capa,
            self.used,
            self.loc,
            hex::encode(self.key)
        )?;
        for j in &self.jobs {
            write!(f, " {}", j.id)?;
        }
        Ok(())
    }
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Job {}\nperiod {}s, start {}\ncapacity {}\ncheck {:?}\nnodes {:?} ({}/{})",
            self.spec.id,
            self.spec.period,
            self.spec.start,
            self.capa,
            self.spec.check,
            self.nodes,
            self.nodes.len(),
            self.want
        )
    }
}

/// A check result tagged with the authenticated node that produced it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaggedResult {
    pub node_id: u64,
    pub result: CheckResult,
}

/// One pending persistent change.
#[derive(Clone, Debug, PartialEq)]
pub enum Diff {
    AddLink { job: u64, node: u64 },
    RmLink { job: u64, node: u64 },
    AddNode(Node),
    RmNode(u64),
    AddJob(Job),
    RmJob(u64),
}

/// A mutation request for the data loop.
#[derive(Debug)]
pub enum Op {
    AddLink { job: u64, node: u64 },
    RmLink { job: u64, node: u64 },
    AddNode(Node),
    RmNode(u64),
    AddJob(Job),
    RmJob(u64),
    NodeSeen { node: u64, last_seen: u64 },
    AddResults(Vec<TaggedResult>),
}

enum Get {
    Job(u64, oneshot::Sender<Option<Job>>),
    Node(u64, oneshot::Sender<Option<Node>>),
    /// Deep copy of both catalogs, for the management `list` command.
    All(oneshot::Sender<(Vec<Node>, Vec<Job>)>),
}

/// Reads and mutations share one channel, so the loop serves them in
/// the order they were sent and a read observes every earlier op.
enum Request {
    Op(Op),
    Get(Get),
}

// ──────────────────────────────────────────────────────────────────────
// STATE AND MUTATIONS
// ──────────────────────────────────────────────────────────────────────

/// The catalogs plus the pending-change buffers.
#[derive(Default, Debug)]
pub struct DataState {
    pub(crate) nodes: BTreeMap<u64, Node>,
    pub(crate) jobs: BTreeMap<u64, Job>,
    pub(crate) diffs: Vec<Diff>,
    pub(crate) results: Vec<TaggedResult>,
}

impl DataState {
    /// Applies one operation, maintaining the link symmetry and
    /// coalescing the diff log. Requests that cannot be satisfied
    /// (unknown ids) are silent no-ops.
    pub fn apply(&mut self, op: Op) {
        match op {
            Op::AddLink { job, node } => self.link(job, node, true),
            Op::RmLink { job, node } => self.link(job, node, false),
            Op::AddNode(n) => {
                self.nodes.insert(n.id, n.clone());
                self.record_add_node(n);
            }
            Op::RmNode(id) => {
                let Some(node) = self.nodes.get(&id) else { return };
                let placed: Vec<u64> = node.jobs.iter().map(|s| s.id).collect();
                for job in placed {
                    self.link(job, id, false);
                }
                self.nodes.remove(&id);
                let mut i = 0;
                while i < self.diffs.len() {
                    match &self.diffs[i] {
                        Diff::RmNode(d) if *d == id => return,
                        Diff::AddNode(n) if n.id == id => {
                            self.diffs.remove(i);
                            return;
                        }
                        _ => i += 1,
                    }
                }
                self.diffs.push(Diff::RmNode(id));
            }
            Op::AddJob(j) => {
                self.jobs.insert(j.id(), j.clone());
                let mut i = 0;
                while i < self.diffs.len() {
                    match &mut self.diffs[i] {
                        Diff::AddJob(existing) if existing.id() == j.id() => {
                            *existing = j;
                            return;
                        }
                        Diff::RmJob(id) if *id == j.id() => {
                            self.diffs.remove(i);
                        }
                        _ => i += 1,
                    }
                }
                self.diffs.push(Diff::AddJob(j));
            }
            Op::RmJob(id) => {
                let Some(job) = self.jobs.get(&id) else { return };
                let placed = job.nodes.clone();
                for node in placed {
                    self.link(id, node, false);
                }
                self.jobs.remove(&id);
                let mut i = 0;
                while i < self.diffs.len() {
                    match &self.diffs[i] {
                        Diff::RmJob(d) if *d == id => return,
                        Diff::AddJob(j) if j.id() == id => {
                            self.diffs.remove(i);
                            return;
                        }
                        _ => i += 1,
                    }
                }
                self.diffs.push(Diff::RmJob(id));
            }
            Op::NodeSeen { node, last_seen } => {
                let Some(n) = self.nodes.get_mut(&node) else { return };
                n.last_seen = last_seen;
                let copy = n.clone();
                self.record_add_node(copy);
            }
            Op::AddResults(mut r) => self.results.append(&mut r),
        }
    }

    /// Coalesces an AddNode-shaped change into the diff log: merge into
    /// an existing AddNode for the id, cancel a pending RmNode, or
    /// append.
    fn record_add_node(&mut self, n: Node) {
        let mut i = 0;
        while i < self.diffs.len() {
            match &mut self.diffs[i] {
                Diff::AddNode(existing) if existing.id == n.id => {
                    *existing = n;
                    return;
                }
                Diff::RmNode(id) if *id == n.id => {
                    self.diffs.remove(i);
                }
                _ => i += 1,
            }
        }
        self.diffs.push(Diff::AddNode(n));
    }

    /// Creates or removes one placement, keeping both membership lists
    /// and the node's used counter in step, then coalesces the link op
    /// with the diff log.
    fn link(&mut self, job: u64, node: u64, add: bool) {
        let (Some(j), Some(n)) = (self.jobs.get_mut(&job), self.nodes.get_mut(&node)) else {
            return;
        };
        if add {
            let Err(pos) = n.jobs.binary_search_by_key(&job, |s| s.id) else {
                debug_assert!(false, "link ({job},{node}) added twice");
                return;
            };
            n.jobs.insert(pos, j.spec.clone());
            j.nodes.push(node);
            n.used += j.capa;
        } else {
            let Ok(pos) = n.jobs.binary_search_by_key(&job, |s| s.id) else {
                return;
            };
            n.jobs.remove(pos);
            if let Some(k) = j.nodes.iter().position(|&id| id == node) {
                j.nodes.remove(k);
            }
            n.used = n.used.saturating_sub(j.capa);
        }
        let (this, opposite) = if add {
            (Diff::AddLink { job, node }, Diff::RmLink { job, node })
        } else {
            (Diff::RmLink { job, node }, Diff::AddLink { job, node })
        };
        for i in 0..self.diffs.len() {
            if self.diffs[i] == opposite {
                self.diffs.remove(i);
                return;
            }
            if self.diffs[i] == this {
                debug_assert!(false, "duplicate link diff for ({job},{node})");
                return;
            }
        }
        self.diffs.push(this);
    }

    /// Attaches a link while loading from the database, without
    /// recording a diff.
    pub(crate) fn attach(&mut self, job: u64, node: u64) -> bool {
        let (Some(j), Some(n)) = (self.jobs.get_mut(&job), self.nodes.get_mut(&node)) else {
            return false;
        };
        let Err(pos) = n.jobs.binary_search_by_key(&job, |s| s.id) else {
            return false;
        };
        n.jobs.insert(pos, j.spec.clone());
        j.nodes.push(node);
        n.used += j.capa;
        true
    }

    pub fn get_job(&self, id: u64) -> Option<Job> {
        self.jobs.get(&id).cloned()
    }

    pub fn get_node(&self, id: u64) -> Option<Node> {
        self.nodes.get(&id).cloned()
    }

    /// Takes the pending diffs and results, leaving empty buffers.
    pub fn take_snapshot(&mut self) -> (Vec<Diff>, Vec<TaggedResult>) {
        (std::mem::take(&mut self.diffs), std::mem::take(&mut self.results))
    }
}

// ──────────────────────────────────────────────────────────────────────
// HANDLE
// ──────────────────────────────────────────────────────────────────────

/// Cloneable front end to the data loop.
#[derive(Clone)]
pub struct DataHandle {
    reqs: mpsc::Sender<Request>,
    sched: mpsc::Sender<()>,
    commit: mpsc::Sender<()>,
}

impl DataHandle {
    /// Fetches a deep copy of the job, or None.
    pub async fn get_job(&self, id: u64) -> Option<Job> {
        let (tx, rx) = oneshot::channel();
        self.reqs.send(Request::Get(Get::Job(id, tx))).await.ok()?;
        rx.await.ok().flatten()
    }

    /// Fetches a deep copy of the node, or None.
    pub async fn get_node(&self, id: u64) -> Option<Node> {
        let (tx, rx) = oneshot::channel();
        self.reqs.send(Request::Get(Get::Node(id, tx))).await.ok()?;
        rx.await.ok().flatten()
    }

    /// Deep copies of both catalogs, in id order.
    pub async fn list(&self) -> (Vec<Node>, Vec<Job>) {
        let (tx, rx) = oneshot::channel();
        if self.reqs.send(Request::Get(Get::All(tx))).await.is_err() {
            return (vec![], vec![]);
        }
        rx.await.unwrap_or_default()
    }

    pub async fn op(&self, op: Op) {
        let _ = self.reqs.send(Request::Op(op)).await;
    }

    pub async fn add_node(&self, n: Node) {
        self.op(Op::AddNode(n)).await;
    }

    pub async fn rm_node(&self, id: u64) {
        self.op(Op::RmNode(id)).await;
    }

    pub async fn add_job(&self, j: Job) {
        self.op(Op::AddJob(j)).await;
    }

    pub async fn rm_job(&self, id: u64) {
        self.op(Op::RmJob(id)).await;
    }

    pub async fn node_seen(&self, node: u64, last_seen: u64) {
        self.op(Op::NodeSeen { node, last_seen }).await;
    }

    pub async fn add_results(&self, r: Vec<TaggedResult>) {
        if !r.is_empty() {
            self.op(Op::AddResults(r)).await;
        }
    }

    /// Requests a scheduler run. Requests arriving while one is already
    /// queued are absorbed.
    pub fn request_schedule(&self) {
        let _ = self.sched.try_send(());
    }

    /// Requests a commit. Coalesces like `request_schedule`.
    pub fn request_commit(&self) {
        let _ = self.commit.try_send(());
    }
}

// ──────────────────────────────────────────────────────────────────────
// EVENT LOOP
// ──────────────────────────────────────────────────────────────────────

/// A running data loop plus the means to stop it.
pub struct DataContext {
    pub handle: DataHandle,
    kill: mpsc::Sender<()>,
    done: oneshot::Receiver<()>,
}

impl DataContext {
    /// Stops the loop: waits out any in-flight commit, runs a final
    /// commit, and closes the database.
    pub async fn shutdown(self) {
        let _ = self.kill.send(()).await;
        let _ = self.done.await;
    }
}

struct DataLoop {
    state: DataState,
    db: Db,
    reqs_rx: mpsc::Receiver<Request>,
    sched_rx: mpsc::Receiver<()>,
    commit_rx: mpsc::Receiver<()>,
    kill_rx: mpsc::Receiver<()>,
    sched_tx: mpsc::Sender<()>,
    commit_tx: mpsc::Sender<()>,
    commit_done_tx: mpsc::Sender<()>,
    commit_done_rx: mpsc::Receiver<()>,
    committing: bool,
}

/// Opens the database, loads the catalogs, and starts the event loop.
pub async fn start(db_path: impl AsRef<Path>) -> Result<DataContext, store::StoreError> {
    let db = store::open(db_path).await?;
    let state = match store::load(&db).await {
        Ok(s) => s,
        Err(e) => {
            let _ = db.close().await;
            return Err(e);
        }
    };
    debug!("database loaded: {} nodes, {} jobs", state.nodes.len(), state.jobs.len());

    let (reqs_tx, reqs_rx) = mpsc::channel(16);
    let (sched_tx, sched_rx) = mpsc::channel(2);
    let (commit_tx, commit_rx) = mpsc::channel(2);
    let (kill_tx, kill_rx) = mpsc::channel(1);
    let (commit_done_tx, commit_done_rx) = mpsc::channel(2);
    let (done_tx, done_rx) = oneshot::channel();

    let handle = DataHandle {
        reqs: reqs_tx,
        sched: sched_tx.clone(),
        commit: commit_tx.clone(),
    };
    let looped = DataLoop {
        state,
        db,
        reqs_rx,
        sched_rx,
        commit_rx,
        kill_rx,
        sched_tx,
        commit_tx,
        commit_done_tx,
        commit_done_rx,
        committing: false,
    };
    tokio::spawn(looped.run(done_tx));
    Ok(DataContext { handle, kill: kill_tx, done: done_rx })
}

impl DataLoop {
    async fn run(mut self, done: oneshot::Sender<()>) {
        // A panic anywhere in the loop body must not skip the final
        // commit, so the serving loop is fenced off.
        if let Err(panic) = AssertUnwindSafe(self.serve()).catch_unwind().await {
            let msg = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".into());
            error!("data loop: panic: {msg}");
        }
        // requests already accepted onto the channel are honored before
        // the final commit
        while let Ok(req) = self.reqs_rx.try_recv() {
            self.handle_request(req);
        }
        if self.committing {
            let _ = self.commit_done_rx.recv().await;
            self.committing = false;
        }
        let (diffs, results) = self.state.take_snapshot();
        if !diffs.is_empty() || !results.is_empty() {
            store::commit(&self.db, diffs, results).await;
        }
        if let Err(e) = self.db.close().await {
            warn!("closing database: {e}");
        }
        debug!("data loop done");
        let _ = done.send(());
    }

    async fn serve(&mut self) {
        let mut tick = tokio::time::interval(SCHED_INTERVAL);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.kill_rx.recv() => {
                    debug!("data loop: headshot");
                    return;
                }
                // fires immediately on startup, seeding the first
                // scheduler pass over the loaded catalogs
                _ = tick.tick() => {
                    let _ = self.sched_tx.try_send(());
                }
                Some(()) = self.sched_rx.recv() => {
                    self.state.schedule();
                    let _ = self.commit_tx.try_send(());
                }
                Some(()) = self.commit_rx.recv() => {
                    if !self.committing {
                        self.start_commit();
                    }
                }
                Some(()) = self.commit_done_rx.recv() => {
                    if !self.committing {
                        error!("data loop: commit done while not committing");
                    } else {
                        debug!("data loop: commit done");
                    }
                    self.committing = false;
                }
                Some(req) = self.reqs_rx.recv() => {
                    self.handle_request(req);
                }
            }
        }
    }

    fn handle_request(&mut self, req: Request) {
        match req {
            Request::Op(op) => self.state.apply(op),
            Request::Get(Get::Job(id, reply)) => {
                let _ = reply.send(self.state.get_job(id));
            }
            Request::Get(Get::Node(id, reply)) => {
                let _ = reply.send(self.state.get_node(id));
            }
            Request::Get(Get::All(reply)) => {
                let nodes = self.state.nodes.values().cloned().collect();
                let jobs = self.state.jobs.values().cloned().collect();
                let _ = reply.send((nodes, jobs));
            }
        }
    }

    /// Snapshots the pending buffers and hands them to an asynchronous
    /// commit task. No-op when there is nothing to write.
    fn start_commit(&mut self) {
        let (diffs, results) = self.state.take_snapshot();
        if diffs.is_empty() && results.is_empty() {
            debug!("data loop: nothing to commit");
            return;
        }
        info!("committing {} diffs, {} results", diffs.len(), results.len());
        self.committing = true;
        let db = self.db.clone();
        let done = self.commit_done_tx.clone();
        tokio::spawn(async move {
            store::commit(&db, diffs, results).await;
            let _ = done.send(()).await;
        });
    }
}

// ──────────────────────────────────────────────────────────────────────
// TESTS
// ──────────────────────────────────────────────────────────────────────

#[cfg(test)]
pub(crate) fn test_node(id: u64, capa: u32) -> Node {
    Node {
        id,
        last_seen: 0,
        capa,
        used: 0,
        loc: 0,
        key: [0; 32],
        jobs: vec![],
    }
}

#[cfg(test)]
pub(crate) fn test_job(id: u64, capa: u32, want: usize) -> Job {
    Job {
        spec: JobSpec {
            id,
            period: 60,
            start: 0,
            check: vec!["dns".into(), "x.example".into()],
        },
        capa,
        want,
        nodes: vec![],
    }
}

#[cfg(test)]
impl DataState {
    /// Asserts the structural invariants of the catalogs and diff log.
    pub(crate) fn assert_invariants(&self) {
        for (id, n) in &self.nodes {
            assert_eq!(*id, n.id);
            // node job lists sorted by id, no duplicates
            assert!(n.jobs.windows(2).all(|w| w[0].id < w[1].id), "node {id} jobs unsorted");
            // used equals the sum of linked job costs
            let sum: u32 = n.jobs.iter().map(|s| self.jobs[&s.id].capa).sum();
            assert_eq!(n.used, sum, "node {id} used mismatch");
            assert!(n.used <= n.capa, "node {id} over capacity");
            // symmetry, node side
            for s in &n.jobs {
                assert!(
                    self.jobs[&s.id].nodes.contains(id),
                    "asymmetric link job {} node {id}",
                    s.id
                );
            }
        }
        for (id, j) in &self.jobs {
            assert_eq!(*id, j.id());
            assert!(j.nodes.len() <= j.want, "job {id} over want");
            // symmetry, job side
            for nid in &j.nodes {
                assert!(
                    self.nodes[nid].jobs.binary_search_by_key(id, |s| s.id).is_ok(),
                    "asymmetric link job {id} node {nid}"
                );
            }
        }
        // no Add+Rm for the same target in the log at once
        for (i, a) in self.diffs.iter().enumerate() {
            for b in &self.diffs[i + 1..] {
                match (a, b) {
                    (Diff::AddLink { job: j1, node: n1 }, Diff::RmLink { job: j2, node: n2 })
                    | (Diff::RmLink { job: j1, node: n1 }, Diff::AddLink { job: j2, node: n2 }) => {
                        assert!(!(j1 == j2 && n1 == n2), "conflicting link diffs");
                    }
                    (Diff::AddNode(n), Diff::RmNode(id)) | (Diff::RmNode(id), Diff::AddNode(n)) => {
                        assert_ne!(n.id, *id, "conflicting node diffs");
                    }
                    (Diff::AddJob(j), Diff::RmJob(id)) | (Diff::RmJob(id), Diff::AddJob(j)) => {
                        assert_ne!(j.id(), *id, "conflicting job diffs");
                    }
                    _ => {}
                }
            }
        }
    }
}
