//! Server side of the node protocol.
//!
//! One task per accepted connection, stepping through
//! greet → authenticate → receive results → send jobs → bye. Any error
//! aborts the state machine, closes the socket, and is logged; the peer
//! learns nothing beyond the disconnect. On success the data core is
//! told the node was seen, the result batch is queued (tagged with the
//! authenticated node id), and a commit is requested.

use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};

use benchnet_proto::wire::{recv_frame, send_frame};
use benchnet_proto::{Session, SessionError, GREET};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info};

use benchnet_common::CheckResult;

use crate::data::{DataHandle, Node, TaggedResult};

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("node {0} not found")]
    NodeNotFound(u64),
    #[error(transparent)]
    Session(#[from] SessionError),
}

/// Nanoseconds since the Unix epoch.
pub(crate) fn now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
}

/// Runs one client connection to completion.
pub async fn handle(socket: TcpStream, peer: SocketAddr, data: DataHandle) {
    let mut session = Session::new(socket);
    match run(&mut session, &data).await {
        Ok(outcome) => {
            info!("client {peer}: connection completed");
            data.node_seen(outcome.node_id, outcome.seen).await;
            data.add_results(outcome.results).await;
            data.request_commit();
        }
        Err(e) => {
            info!("client {peer}: handle: {e}");
        }
    }
}

pub struct Outcome {
    pub node_id: u64,
    pub seen: u64,
    pub results: Vec<TaggedResult>,
}

/// The protocol steps, generic over the stream so tests can drive them
/// over an in-memory duplex.
pub async fn run<S>(session: &mut Session<S>, data: &DataHandle) -> Result<Outcome, ProtoError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    send_greet(session).await?;
    let node = auth_client(session, data).await?;
    let (seen, results) = recv_logs(session, &node).await?;
    send_jobs(session, &node).await?;
    recv_bye(session).await?;
    Ok(Outcome { node_id: node.id, seen, results })
}

async fn send_greet<S>(session: &mut Session<S>) -> Result<(), ProtoError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    session.send_challenge(GREET).await?;
    Ok(())
}

async fn auth_client<S>(session: &mut Session<S>, data: &DataHandle) -> Result<Node, ProtoError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // the first u64 is a legacy client id, carried but unused
    let mut client_id = [0u8; 8];
    let mut node_id_buf = [0u8; 8];
    session.read_exact(&mut client_id).await?;
    session.read_exact(&mut node_id_buf).await?;
    let node_id = u64::from_be_bytes(node_id_buf);
    let node = data
        .get_node(node_id)
        .await
        .ok_or(ProtoError::NodeNotFound(node_id))?;
    session.set_key(&node.key)?;
    // the ids were read before the key existed; hash them now
    session.absorb(&client_id);
    session.absorb(&node_id_buf);
    session.check_sig().await?;
    debug!("authenticated node {node_id}");
    session.receive_challenge().await?;
    Ok(node)
}

async fn recv_logs<S>(
    session: &mut Session<S>,
    node: &Node,
) -> Result<(u64, Vec<TaggedResult>), ProtoError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    session.write_all(&node.last_seen.to_be_bytes()).await?;
    session.send_sig().await?;
    let seen = now_nanos();
    let batch: Vec<CheckResult> = recv_frame(session).await?;
    session.check_sig().await?;
    let results = batch
        .into_iter()
        .map(|result| TaggedResult { node_id: node.id, result })
        .collect();
    Ok((seen, results))
}

async fn send_jobs<S>(session: &mut Session<S>, node: &Node) -> Result<(), ProtoError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    send_frame(session, &node.jobs).await?;
    session.send_sig().await?;
    Ok(())
}

async fn recv_bye<S>(session: &mut Session<S>) -> Result<(), ProtoError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut bye = [0u8; 1];
    session.read_exact(&mut bye).await?;
    if bye[0] != 0 {
        return Err(SessionError::Proto.into());
    }
    session.check_sig().await?;
    Ok(())
}
