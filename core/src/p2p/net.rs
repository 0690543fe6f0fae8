//! TCP transport.
//!
//! One read loop and one writer task per connection. The writer drains a
//! bounded channel, so `send` never blocks a protocol handler; a full
//! channel drops the message, which the protocol timeouts absorb. The first
//! frame on every connection is a handshake carrying the node id, which
//! becomes the peer id for everything that follows.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use log::{debug, info, warn};
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use super::codec::{read_frame, write_frame, CodecError};
use super::messages::{Message, PROTOCOL_VERSION};
use super::{MessageHandler, PeerId, Transport};

/// Per-peer outbound queue depth.
const OUTBOUND_QUEUE: usize = 256;
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const DIAL_BACKOFF_BASE_SECS: u64 = 2;
const DIAL_BACKOFF_MAX_SECS: u64 = 120;

pub struct TcpTransport {
    node_id: String,
    max_connections: usize,
    connections: Mutex<HashMap<PeerId, mpsc::Sender<Message>>>,
    handler: OnceLock<Arc<dyn MessageHandler>>,
}

impl TcpTransport {
    pub fn new(node_id: String, max_connections: usize) -> Arc<Self> {
        Arc::new(Self {
            node_id,
            max_connections,
            connections: Mutex::new(HashMap::new()),
            handler: OnceLock::new(),
        })
    }

    /// Sets the inbound handler. Only the first call has an effect.
    pub fn set_handler(&self, handler: Arc<dyn MessageHandler>) {
        if self.handler.set(handler).is_err() {
            warn!("[p2p] inbound handler already set");
        }
    }

    pub fn connected_peers(&self) -> Vec<PeerId> {
        self.connections.lock().keys().cloned().collect()
    }

    /// Binds `addr` and accepts connections in the background.
    pub async fn listen(self: &Arc<Self>, addr: &str) -> Result<SocketAddr> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("binding {addr}"))?;
        let local = listener.local_addr()?;
        info!("[p2p] listening on {}", local);

        let me = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let (socket, remote) = match listener.accept().await {
                    Ok(a) => a,
                    Err(e) => {
                        warn!("[p2p] accept failed: {}", e);
                        continue;
                    }
                };
                if me.connections.lock().len() >= me.max_connections {
                    debug!("[p2p] connection limit reached, rejecting {}", remote);
                    continue;
                }
                let conn = Arc::clone(&me);
                tokio::spawn(async move {
                    if let Err(e) = conn.run_connection(socket, remote).await {
                        debug!("[p2p] inbound {} closed: {:#}", remote, e);
                    }
                });
            }
        });
        Ok(local)
    }

    /// Keeps an outbound connection to `addr` alive, redialling with
    /// exponential backoff.
    pub fn dial(self: &Arc<Self>, addr: String) {
        let me = Arc::clone(self);
        tokio::spawn(async move {
            let mut failures: u32 = 0;
            loop {
                match TcpStream::connect(&addr).await {
                    Ok(stream) => match stream.peer_addr() {
                        Ok(remote) => {
                            failures = 0;
                            info!("[p2p] connected to {}", addr);
                            if let Err(e) = Arc::clone(&me).run_connection(stream, remote).await {
                                debug!("[p2p] outbound {} closed: {:#}", addr, e);
                            }
                        }
                        Err(e) => {
                            failures = failures.saturating_add(1);
                            warn!("[p2p] {}: {}", addr, e);
                        }
                    },
                    Err(e) => {
                        failures = failures.saturating_add(1);
                        debug!("[p2p] dial {} failed ({} in a row): {}", addr, failures, e);
                    }
                }
                let backoff = DIAL_BACKOFF_BASE_SECS
                    .saturating_mul(1u64 << failures.min(16))
                    .min(DIAL_BACKOFF_MAX_SECS);
                tokio::time::sleep(Duration::from_secs(backoff)).await;
            }
        });
    }

    async fn run_connection(self: Arc<Self>, socket: TcpStream, remote: SocketAddr) -> Result<()> {
        socket.set_nodelay(true)?;
        let (mut reader, mut writer) = socket.into_split();

        write_frame(
            &mut writer,
            &Message::Handshake {
                node_id: self.node_id.clone(),
                version: PROTOCOL_VERSION,
            },
        )
        .await?;
        let first = tokio::time::timeout(HANDSHAKE_TIMEOUT, read_frame(&mut reader))
            .await
            .context("handshake timed out")??;
        let peer: PeerId = match first {
            Message::Handshake { node_id, version } => {
                if version != PROTOCOL_VERSION {
                    bail!("{} speaks protocol {}, we speak {}", remote, version, PROTOCOL_VERSION);
                }
                node_id
            }
            other => bail!("{} opened with {} instead of a handshake", remote, other.kind()),
        };
        if peer == self.node_id {
            bail!("connected to ourselves via {}", remote);
        }

        let (tx, mut rx) = mpsc::channel::<Message>(OUTBOUND_QUEUE);
        {
            let mut conns = self.connections.lock();
            if conns.contains_key(&peer) {
                bail!("already connected to {}", peer);
            }
            conns.insert(peer.clone(), tx);
        }
        info!("[p2p] peer {} up at {}", peer, remote);

        let writer_peer = peer.clone();
        let writer_task = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let Err(e) = write_frame(&mut writer, &msg).await {
                    debug!("[p2p] write to {} failed: {}", writer_peer, e);
                    break;
                }
            }
        });

        let handler = self.handler.get().cloned();
        if let Some(h) = &handler {
            let hello = Message::Handshake {
                node_id: peer.clone(),
                version: PROTOCOL_VERSION,
            };
            let (h, p) = (Arc::clone(h), peer.clone());
            tokio::task::spawn_blocking(move || h.handle(p, hello)).await?;
        }

        let result: Result<(), CodecError> = loop {
            let msg = match read_frame(&mut reader).await {
                Ok(m) => m,
                Err(e) => break Err(e),
            };
            let Some(h) = &handler else {
                continue;
            };
            let (h, p) = (Arc::clone(h), peer.clone());
            // handlers take chain locks; keep them off the async workers and in order
            if let Err(e) = tokio::task::spawn_blocking(move || h.handle(p, msg)).await {
                warn!("[p2p] handler for {} panicked: {}", peer, e);
            }
        };

        self.connections.lock().remove(&peer);
        writer_task.abort();
        info!("[p2p] peer {} down", peer);
        result.map_err(Into::into)
    }
}

impl Transport for TcpTransport {
    fn send(&self, peer: &PeerId, msg: Message) {
        let tx = self.connections.lock().get(peer).cloned();
        match tx {
            Some(tx) => {
                if let Err(e) = tx.try_send(msg) {
                    debug!("[p2p] dropping message to {}: {}", peer, e);
                }
            }
            None => debug!("[p2p] no connection to {}, dropping {}", peer, msg.kind()),
        }
    }

    fn transmit_to_neighbors(&self, msg: Message) {
        let senders: Vec<_> = self.connections.lock().values().cloned().collect();
        for tx in senders {
            let _ = tx.try_send(msg.clone());
        }
    }
}
