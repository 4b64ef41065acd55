//! Accept loops for the client and management ports.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::data::DataHandle;

/// Accepts connections until shutdown, spawning `handler` per client.
pub async fn net_loop<H, F>(
    listener: TcpListener,
    data: DataHandle,
    shutdown: Arc<Notify>,
    name: &'static str,
    handler: H,
) where
    H: Fn(TcpStream, SocketAddr, DataHandle) -> F + Send + 'static,
    F: Future<Output = ()> + Send + 'static,
{
    loop {
        tokio::select! {
            _ = shutdown.notified() => {
                debug!("{name} loop killed");
                return;
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((socket, peer)) => {
                        info!("accept {name} connection from {peer}");
                        tokio::spawn(handler(socket, peer, data.clone()));
                    }
                    Err(e) => {
                        warn!("accept: {e}");
                    }
                }
            }
        }
    }
}
