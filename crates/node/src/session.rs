//! Node side of the server protocol, plus the reconnect loop.
//!
//! The node dials the server, authenticates with its network key,
//! uploads the results the server has not seen, installs the returned
//! job list, and says goodbye. After a successful session the next
//! attempt happens in about an hour; after a failure, in about ten
//! minutes; both fuzzed by a uniform random offset so a fleet of nodes
//! does not reconnect in lockstep.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use benchnet_proto::wire::{recv_frame, send_frame};
use benchnet_proto::{JobSpec, Session, SessionError, CLIENT_PORT, GREET};
use rand::Rng;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::config::NodeConfig;
use crate::jobs::Runner;
use crate::store::{self, NodeStoreError};

const RECONNECT: Duration = Duration::from_secs(60 * 60);
const RECONNECT_FUZZ: Duration = Duration::from_secs(10 * 60);
const RETRY: Duration = Duration::from_secs(10 * 60);
const RETRY_FUZZ: Duration = Duration::from_secs(2 * 60);

/// Results older than this are kept locally even after upload, so a
/// server restoring from an old backup can ask for them again.
const RETENTION: Duration = Duration::from_secs(2 * 60 * 60);

#[derive(Debug, Error)]
pub enum TalkError {
    /// The server's recorded timestamp is ahead of our clock.
    #[error("timestamp in the future")]
    Future,
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Store(#[from] NodeStoreError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

fn now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
}

/// One full session against the server.
pub async fn talk(cfg: &NodeConfig, db: &benchnet_stdb::Db, runner: &Runner) -> Result<(), TalkError> {
    let addr = format!("{}:{}", cfg.server, CLIENT_PORT);
    info!("connecting to server {addr}");
    let stream = TcpStream::connect(&addr).await?;
    let mut session = Session::new(stream);
    session.set_key(&cfg.key)?;
    run(&mut session, cfg, db, runner).await
}

/// The protocol steps, generic over the stream for testing.
pub async fn run<S>(
    session: &mut Session<S>,
    cfg: &NodeConfig,
    db: &benchnet_stdb::Db,
    runner: &Runner,
) -> Result<(), TalkError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    recv_greet(session).await?;
    auth(session, cfg).await?;
    send_logs(session, db).await?;
    recv_jobs(session, runner).await?;
    send_bye(session).await
}

async fn recv_greet<S>(session: &mut Session<S>) -> Result<(), TalkError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut greet = [0u8; GREET.len()];
    session.read_exact(&mut greet).await?;
    if greet[..] != *GREET {
        return Err(SessionError::Proto.into());
    }
    session.receive_challenge().await?;
    Ok(())
}

async fn auth<S>(session: &mut Session<S>, cfg: &NodeConfig) -> Result<(), TalkError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // the greeting passed through the hash; start over for the ids
    session.reset();
    let mut buf = Vec::with_capacity(16 + 32);
    buf.extend_from_slice(&cfg.client_id.to_be_bytes());
    buf.extend_from_slice(&cfg.node_id.to_be_bytes());
    session.sign(&mut buf)?;
    session.send_challenge(&buf).await?;
    Ok(())
}

async fn send_logs<S>(session: &mut Session<S>, db: &benchnet_stdb::Db) -> Result<(), TalkError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = [0u8; 8];
    session.read_exact(&mut buf).await?;
    let then = u64::from_be_bytes(buf);
    let now = now_nanos();
    if then > now {
        return Err(TalkError::Future);
    }
    session.check_sig().await?;

    let batch = store::load_results(db, then).await?;
    debug!("sending {} results", batch.len());
    send_frame(session, &batch).await?;

    // trim what was sent, but keep a retention window in case the
    // server loses our upload to a restart
    let cutoff = then.min(now.saturating_sub(RETENTION.as_nanos() as u64));
    store::delete_results(db, cutoff).await?;

    session.send_sig().await?;
    Ok(())
}

async fn recv_jobs<S>(session: &mut Session<S>, runner: &Runner) -> Result<(), TalkError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let new: Vec<JobSpec> = recv_frame(session).await?;
    debug!("received {} jobs", new.len());
    session.check_sig().await?;
    if let Err(e) = runner.merge(new).await {
        // the session itself succeeded; the stale job table will be
        // replaced on the next connection
        warn!("merging job list: {e}");
    }
    Ok(())
}

async fn send_bye<S>(session: &mut Session<S>) -> Result<(), TalkError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    session.write_all(&[0]).await?;
    session.send_sig().await?;
    Ok(())
}

/// `dur ± fuzz`, uniformly.
fn fuzzed(dur: Duration, fuzz: Duration) -> Duration {
    let spread = fuzz.as_nanos() as u64 * 2;
    let offset = rand::thread_rng().gen_range(0..spread);
    dur - fuzz + Duration::from_nanos(offset)
}

/// Dials the server forever: immediately on startup, then on the fuzzed
/// reconnect schedule. Cancelled by `shutdown`.
pub async fn net_loop(
    cfg: NodeConfig,
    db: benchnet_stdb::Db,
    runner: Arc<Runner>,
    shutdown: Arc<Notify>,
) {
    loop {
        let ok = match talk(&cfg, &db, &runner).await {
            Ok(()) => {
                info!("connection completed");
                true
            }
            Err(e) => {
                warn!("session: {e}");
                false
            }
        };
        let wait = if ok {
            fuzzed(RECONNECT, RECONNECT_FUZZ)
        } else {
            fuzzed(RETRY, RETRY_FUZZ)
        };
        debug!("next connection in {wait:?}");
        tokio::select! {
            _ = shutdown.notified() => {
                debug!("net loop done");
                return;
            }
            _ = tokio::time::sleep(wait) => {}
        }
    }
}
