//! TCP messenger
//!
//! One listener per configured port. Every connection gets a reader task
//! that decodes length-prefixed [`ClientRequest`] frames and a writer task
//! that sends [`OpReply`] frames back. Enqueueing onto the adaptor can
//! block on a full queue, so it runs on the blocking pool.

use crate::adaptor::ServerAdaptor;
use crate::handler::Connection;
use crate::processor::InboundOp;
use crate::wire::{self, ClientRequest, OpReply};
use futures::{SinkExt, StreamExt};
use radosproxy_common::{Error, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, error, info, warn};

/// Largest accepted frame
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Length-delimited framing shared by server and clients
#[must_use]
pub fn frame_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LEN)
        .new_codec()
}

/// Reply path of one TCP connection
struct TcpConnection {
    peer: SocketAddr,
    tx: mpsc::UnboundedSender<OpReply>,
}

impl Connection for TcpConnection {
    fn send_reply(&self, reply: OpReply) -> Result<()> {
        self.tx.send(reply).map_err(|_| Error::NotConnected)
    }

    fn peer(&self) -> String {
        self.peer.to_string()
    }
}

/// Running listeners
pub struct Messenger {
    local_addrs: Vec<SocketAddr>,
    shutdown: watch::Sender<bool>,
    listeners: Vec<JoinHandle<()>>,
}

impl Messenger {
    /// Bind one listener per port on `ip` and start accepting. Port `"0"`
    /// picks a free port; see [`local_addrs`](Self::local_addrs).
    pub async fn bind(ip: &str, ports: &[String], adaptor: Arc<ServerAdaptor>) -> Result<Self> {
        let (shutdown, _) = watch::channel(false);
        let mut messenger = Self {
            local_addrs: Vec::with_capacity(ports.len()),
            shutdown,
            listeners: Vec::with_capacity(ports.len()),
        };

        for port in ports {
            let listener = match bind_port(ip, port).await {
                Ok(listener) => listener,
                Err(e) => {
                    error!("Bind {}:{} failed: {}", ip, port, e);
                    messenger.shutdown().await;
                    return Err(e);
                }
            };
            let addr = listener.local_addr()?;
            info!("Messenger listening on {}", addr);
            messenger.local_addrs.push(addr);
            messenger.listeners.push(tokio::spawn(accept_loop(
                listener,
                Arc::clone(&adaptor),
                messenger.shutdown.subscribe(),
            )));
        }
        Ok(messenger)
    }

    pub fn local_addrs(&self) -> &[SocketAddr] {
        &self.local_addrs
    }

    /// Stop accepting and close every connection's reader. Replies to
    /// requests already queued are still written while the peer is there.
    pub async fn shutdown(&mut self) {
        let _ = self.shutdown.send(true);
        for handle in self.listeners.drain(..) {
            if let Err(e) = handle.await {
                error!("Listener task failed: {}", e);
            }
        }
        info!("Messenger stopped");
    }
}

async fn bind_port(ip: &str, port: &str) -> Result<TcpListener> {
    let port: u16 = port
        .trim()
        .parse()
        .map_err(|e| Error::configuration(format!("listen port {port:?}: {e}")))?;
    Ok(TcpListener::bind((ip, port)).await?)
}

async fn accept_loop(
    listener: TcpListener,
    adaptor: Arc<ServerAdaptor>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!("set_nodelay for {} failed: {}", peer, e);
                    }
                    tokio::spawn(serve_connection(
                        stream,
                        peer,
                        Arc::clone(&adaptor),
                        shutdown.clone(),
                    ));
                }
                Err(e) => {
                    warn!("Accept failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            }
        }
    }
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    adaptor: Arc<ServerAdaptor>,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!("Connection from {}", peer);
    let (mut sink, mut frames) = Framed::new(stream, frame_codec()).split();
    let (tx, mut rx) = mpsc::unbounded_channel::<OpReply>();
    let conn: Arc<dyn Connection> = Arc::new(TcpConnection { peer, tx });

    // Ends once every in-flight request has dropped its connection handle.
    let writer = tokio::spawn(async move {
        while let Some(reply) = rx.recv().await {
            let frame = match wire::encode(&reply) {
                Ok(frame) => frame,
                Err(e) => {
                    error!("Encode reply {} for {} failed: {}", reply.tid, peer, e);
                    continue;
                }
            };
            if let Err(e) = sink.send(frame).await {
                warn!("Write to {} failed: {}", peer, e);
                break;
            }
        }
    });

    loop {
        let frame = tokio::select! {
            _ = shutdown.changed() => break,
            frame = frames.next() => frame,
        };
        let buf = match frame {
            None => break,
            Some(Ok(buf)) => buf,
            Some(Err(e)) => {
                warn!("Read from {} failed: {}", peer, e);
                break;
            }
        };
        let request: ClientRequest = match wire::decode(&buf) {
            Ok(request) => request,
            Err(e) => {
                warn!("Undecodable frame from {}: {}", peer, e);
                break;
            }
        };

        let op = InboundOp::new(request, Arc::clone(&conn));
        let adaptor = Arc::clone(&adaptor);
        if let Err(e) = tokio::task::spawn_blocking(move || adaptor.enqueue(op)).await {
            error!("Enqueue task for {} failed: {}", peer, e);
            break;
        }
    }

    drop(conn);
    if let Err(e) = writer.await {
        error!("Writer task for {} failed: {}", peer, e);
    }
    debug!("Connection from {} closed", peer);
}
