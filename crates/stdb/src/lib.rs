//! Single-threaded database gateway.
//!
//! SQLite connections are not safe to share between callers, and
//! sprinkling a mutex over every call site scales badly once cursors and
//! transactions enter the picture. Instead, one dedicated worker thread
//! owns the [`rusqlite::Connection`] and services typed requests arriving
//! on a channel; callers get their answers back on per-call oneshot
//! channels. This serializes every database operation in FIFO order and
//! makes transactions naturally linearizable.
//!
//! While a [`Rows`] cursor or a [`Tx`] transaction is open, the worker
//! services *only* that cursor or transaction; other requests queue up on
//! the main channel until it ends. This is intentional back-pressure.
//! Dropping a `Rows` releases the worker; dropping a `Tx` without
//! committing rolls the transaction back.

use std::path::{Path, PathBuf};
use std::thread;

use rusqlite::Connection;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

pub use rusqlite::types::Value;

#[derive(Debug, Error)]
pub enum DbError {
    /// Error from the storage engine, propagated as-is.
    #[error("storage error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    /// The cursor was drained or closed; no further rows can be read.
    #[error("rows cursor closed")]
    RowsClosed,
    /// The transaction has already ended (or its worker is gone).
    #[error("transaction done")]
    TxDone,
    /// A cell held a value of an unexpected concrete type.
    #[error("wrong data type in column {0}")]
    WrongType(usize),
    /// The worker thread has terminated.
    #[error("database worker gone")]
    WorkerGone,
    #[error("can't start database worker: {0}")]
    Spawn(std::io::Error),
}

/// Builds a `Vec<Value>` argument list for the gateway calls.
#[macro_export]
macro_rules! sql_params {
    ($($v:expr),* $(,)?) => {
        vec![$($crate::Value::from($v)),*]
    };
}

// ──────────────────────────────────────────────────────────────────────
// ROW DATA
// ──────────────────────────────────────────────────────────────────────

/// One fetched row, with every column copied out of the engine.
#[derive(Debug, Clone)]
pub struct Row(Vec<Value>);

/// Conversion from a fetched SQLite value.
pub trait FromValue: Sized {
    fn from_value(v: &Value) -> Option<Self>;
}

impl FromValue for i64 {
    fn from_value(v: &Value) -> Option<Self> {
        match v {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }
}

impl FromValue for u64 {
    /// Ids are stored as the INTEGER bit pattern; the cast round-trips.
    fn from_value(v: &Value) -> Option<Self> {
        match v {
            Value::Integer(i) => Some(*i as u64),
            _ => None,
        }
    }
}

impl FromValue for u32 {
    fn from_value(v: &Value) -> Option<Self> {
        match v {
            Value::Integer(i) => u32::try_from(*i).ok(),
            _ => None,
        }
    }
}

impl FromValue for String {
    fn from_value(v: &Value) -> Option<Self> {
        match v {
            Value::Text(s) => Some(s.clone()),
            _ => None,
        }
    }
}

impl FromValue for Vec<u8> {
    /// NULL reads as an empty blob.
    fn from_value(v: &Value) -> Option<Self> {
        match v {
            Value::Blob(b) => Some(b.clone()),
            Value::Null => Some(Vec::new()),
            _ => None,
        }
    }
}

impl Row {
    pub fn get<T: FromValue>(&self, idx: usize) -> Result<T, DbError> {
        self.0
            .get(idx)
            .and_then(T::from_value)
            .ok_or(DbError::WrongType(idx))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

// ──────────────────────────────────────────────────────────────────────
// REQUESTS
// ──────────────────────────────────────────────────────────────────────

type Reply<T> = oneshot::Sender<Result<T, DbError>>;

enum Request {
    Exec { sql: String, args: Vec<Value>, reply: Reply<usize> },
    Query { sql: String, args: Vec<Value>, reply: Reply<Rows> },
    QueryRow { sql: String, args: Vec<Value>, reply: Reply<Option<Row>> },
    Begin { reply: Reply<Tx> },
    Close { reply: Reply<()> },
}

enum CursorRequest {
    Next(Reply<Option<Row>>),
    Close(oneshot::Sender<()>),
}

enum TxRequest {
    Exec { sql: String, args: Vec<Value>, reply: Reply<usize> },
    Query { sql: String, args: Vec<Value>, reply: Reply<Rows> },
    Commit(Reply<()>),
    Rollback(Reply<()>),
}

// ──────────────────────────────────────────────────────────────────────
// HANDLES
// ──────────────────────────────────────────────────────────────────────

/// A database handle. Cloning shares the same worker.
#[derive(Clone)]
pub struct Db {
    tx: mpsc::Sender<Request>,
}

/// Result of [`Db::query`]: holds the worker until drained or closed.
pub struct Rows {
    tx: mpsc::Sender<CursorRequest>,
    closed: bool,
}

/// An open transaction: holds the worker until commit or rollback.
/// Dropping it rolls back.
pub struct Tx {
    tx: mpsc::Sender<TxRequest>,
}

impl Db {
    /// Opens the database file and starts the worker thread.
    pub async fn open(path: impl AsRef<Path>) -> Result<Db, DbError> {
        let path: PathBuf = path.as_ref().to_path_buf();
        let (tx, rx) = mpsc::channel(16);
        let (ready_tx, ready_rx) = oneshot::channel();
        thread::Builder::new()
            .name("stdb".into())
            .spawn(move || worker(path, rx, ready_tx))
            .map_err(DbError::Spawn)?;
        ready_rx.await.map_err(|_| DbError::WorkerGone)??;
        Ok(Db { tx })
    }

    /// Executes a statement that returns no rows; yields affected rows.
    pub async fn exec(&self, sql: &str, args: Vec<Value>) -> Result<usize, DbError> {
        let (reply, rx) = oneshot::channel();
        self.send(Request::Exec { sql: sql.into(), args, reply }).await?;
        rx.await.map_err(|_| DbError::WorkerGone)?
    }

    /// Executes a query that returns rows. The worker stays locked on the
    /// returned cursor until it is drained, closed, or dropped.
    pub async fn query(&self, sql: &str, args: Vec<Value>) -> Result<Rows, DbError> {
        let (reply, rx) = oneshot::channel();
        self.send(Request::Query { sql: sql.into(), args, reply }).await?;
        rx.await.map_err(|_| DbError::WorkerGone)?
    }

    /// Executes a query expected to return at most one row.
    pub async fn query_row(&self, sql: &str, args: Vec<Value>) -> Result<Option<Row>, DbError> {
        let (reply, rx) = oneshot::channel();
        self.send(Request::QueryRow { sql: sql.into(), args, reply }).await?;
        rx.await.map_err(|_| DbError::WorkerGone)?
    }

    /// Starts a transaction, locking the worker onto the returned handle.
    pub async fn begin(&self) -> Result<Tx, DbError> {
        let (reply, rx) = oneshot::channel();
        self.send(Request::Begin { reply }).await?;
        rx.await.map_err(|_| DbError::WorkerGone)?
    }

    /// Closes the database and terminates the worker thread.
    pub async fn close(&self) -> Result<(), DbError> {
        let (reply, rx) = oneshot::channel();
        self.send(Request::Close { reply }).await?;
        rx.await.map_err(|_| DbError::WorkerGone)?
    }

    async fn send(&self, req: Request) -> Result<(), DbError> {
        self.tx.send(req).await.map_err(|_| DbError::WorkerGone)
    }
}

impl Rows {
    /// Advances the cursor and fetches the next row. `Ok(None)` means the
    /// result set is exhausted; the cursor is closed at that point and
    /// any further call is a [`DbError::RowsClosed`] error.
    pub async fn next(&mut self) -> Result<Option<Row>, DbError> {
        if self.closed {
            return Err(DbError::RowsClosed);
        }
        let (reply, rx) = oneshot::channel();
        if self.tx.send(CursorRequest::Next(reply)).await.is_err() {
            self.closed = true;
            return Err(DbError::RowsClosed);
        }
        let res = rx.await.map_err(|_| DbError::WorkerGone)?;
        if !matches!(res, Ok(Some(_))) {
            self.closed = true;
        }
        res
    }

    /// Releases the worker without draining. Closing twice is a no-op.
    pub async fn close(&mut self) -> Result<(), DbError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let (reply, rx) = oneshot::channel();
        if self.tx.send(CursorRequest::Close(reply)).await.is_ok() {
            let _ = rx.await;
        }
        Ok(())
    }
}

impl Tx {
    pub async fn exec(&self, sql: &str, args: Vec<Value>) -> Result<usize, DbError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(TxRequest::Exec { sql: sql.into(), args, reply })
            .await
            .map_err(|_| DbError::TxDone)?;
        rx.await.map_err(|_| DbError::TxDone)?
    }

    /// Runs a nested query inside the transaction. The transaction (and
    /// the worker) stay locked on the cursor until it ends.
    pub async fn query(&self, sql: &str, args: Vec<Value>) -> Result<Rows, DbError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(TxRequest::Query { sql: sql.into(), args, reply })
            .await
            .map_err(|_| DbError::TxDone)?;
        rx.await.map_err(|_| DbError::TxDone)?
    }

    pub async fn commit(self) -> Result<(), DbError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(TxRequest::Commit(reply))
            .await
            .map_err(|_| DbError::TxDone)?;
        rx.await.map_err(|_| DbError::TxDone)?
    }

    pub async fn rollback(self) -> Result<(), DbError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(TxRequest::Rollback(reply))
            .await
            .map_err(|_| DbError::TxDone)?;
        rx.await.map_err(|_| DbError::TxDone)?
    }
}

// ──────────────────────────────────────────────────────────────────────
// WORKER
// ──────────────────────────────────────────────────────────────────────

fn worker(
    path: PathBuf,
    mut rx: mpsc::Receiver<Request>,
    ready: oneshot::Sender<Result<(), DbError>>,
) {
    let mut conn = match Connection::open(&path) {
        Ok(c) => c,
        Err(e) => {
            let _ = ready.send(Err(e.into()));
            return;
        }
    };
    let _ = ready.send(Ok(()));
    debug!("database worker up: {}", path.display());
    let mut close_reply = None;
    while let Some(req) = rx.blocking_recv() {
        match req {
            Request::Exec { sql, args, reply } => {
                let _ = reply.send(exec_on(&conn, &sql, &args));
            }
            Request::Query { sql, args, reply } => serve_query(&conn, &sql, &args, reply),
            Request::QueryRow { sql, args, reply } => {
                let _ = reply.send(one_row(&conn, &sql, &args));
            }
            Request::Begin { reply } => serve_tx(&mut conn, reply),
            Request::Close { reply } => {
                close_reply = Some(reply);
                break;
            }
        }
    }
    let res = conn.close().map_err(|(_, e)| DbError::from(e));
    match close_reply {
        Some(reply) => {
            let _ = reply.send(res);
        }
        None => {
            if let Err(e) = res {
                warn!("database close: {e}");
            }
        }
    }
    debug!("database worker done");
}

fn exec_on(conn: &Connection, sql: &str, args: &[Value]) -> Result<usize, DbError> {
    conn.execute(sql, rusqlite::params_from_iter(args.iter()))
        .map_err(Into::into)
}

fn one_row(conn: &Connection, sql: &str, args: &[Value]) -> Result<Option<Row>, DbError> {
    let mut stmt = conn.prepare(sql)?;
    let ncols = stmt.column_count();
    let mut rows = stmt.query(rusqlite::params_from_iter(args.iter()))?;
    match rows.next()? {
        Some(row) => Ok(Some(copy_row(row, ncols)?)),
        None => Ok(None),
    }
}

fn copy_row(row: &rusqlite::Row<'_>, ncols: usize) -> Result<Row, DbError> {
    let mut vals = Vec::with_capacity(ncols);
    for i in 0..ncols {
        vals.push(row.get::<_, Value>(i)?);
    }
    Ok(Row(vals))
}

/// Query loop: the worker stays here until the cursor is drained, closed,
/// or its handle is dropped.
fn serve_query(conn: &Connection, sql: &str, args: &[Value], reply: Reply<Rows>) {
    let mut stmt = match conn.prepare(sql) {
        Ok(s) => s,
        Err(e) => {
            let _ = reply.send(Err(e.into()));
            return;
        }
    };
    let ncols = stmt.column_count();
    let mut rows = match stmt.query(rusqlite::params_from_iter(args.iter())) {
        Ok(r) => r,
        Err(e) => {
            let _ = reply.send(Err(e.into()));
            return;
        }
    };
    let (tx, mut cursor_rx) = mpsc::channel(1);
    if reply.send(Ok(Rows { tx, closed: false })).is_err() {
        return;
    }
    while let Some(req) = cursor_rx.blocking_recv() {
        match req {
            CursorRequest::Next(r) => match rows.next() {
                Ok(Some(row)) => {
                    let _ = r.send(copy_row(row, ncols).map(Some));
                }
                Ok(None) => {
                    let _ = r.send(Ok(None));
                    return;
                }
                Err(e) => {
                    let _ = r.send(Err(e.into()));
                    return;
                }
            },
            CursorRequest::Close(r) => {
                let _ = r.send(());
                return;
            }
        }
    }
}

/// Transaction loop: the worker stays here until commit or rollback.
/// A dropped handle ends the loop and the transaction rolls back when it
/// goes out of scope.
fn serve_tx(conn: &mut Connection, reply: Reply<Tx>) {
    let tx = match conn.transaction() {
        Ok(t) => t,
        Err(e) => {
            let _ = reply.send(Err(e.into()));
            return;
        }
    };
    let (sender, mut tx_rx) = mpsc::channel(1);
    if reply.send(Ok(Tx { tx: sender })).is_err() {
        return;
    }
    while let Some(req) = tx_rx.blocking_recv() {
        match req {
            TxRequest::Exec { sql, args, reply } => {
                let _ = reply.send(exec_on(&tx, &sql, &args));
            }
            TxRequest::Query { sql, args, reply } => serve_query(&tx, &sql, &args, reply),
            TxRequest::Commit(r) => {
                let _ = r.send(tx.commit().map_err(Into::into));
                return;
            }
            TxRequest::Rollback(r) => {
                let _ = r.send(tx.rollback().map_err(Into::into));
                return;
            }
        }
    }
    debug!("transaction handle dropped, rolling back");
}

// ──────────────────────────────────────────────────────────────────────
// TESTS
// ──────────────────────────────────────────────────────────────────────
