//! Inbound TCP listener.
//!
//! A single listener accepts peer connections; each connection gets its own
//! task that accumulates bytes, parses length-prefixed frames, answers
//! pings with the pong byte, and feeds every received message into local
//! delivery. Replies never travel back over this stream — the sending node
//! drives them through its own reply handler and its own outbound
//! connection.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Weak};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Handle;
use tokio::task::AbortHandle;
use tracing::{debug, error, trace, warn};

use crate::bus::BusInner;
use crate::wire::{self, Frame};

/// The running inbound listener.
pub(crate) struct Server {
    local_addr: SocketAddr,
    /// Accept loop plus one task per accepted connection; shutdown aborts
    /// them all, which drops the accepted sockets.
    tasks: Arc<Mutex<Vec<AbortHandle>>>,
}

impl Server {
    /// Spawn the accept loop over an already-bound listener.
    pub(crate) fn start(
        listener: TcpListener,
        bus: Weak<BusInner>,
        handle: Handle,
    ) -> std::io::Result<Server> {
        let local_addr = listener.local_addr()?;
        let tasks = Arc::new(Mutex::new(Vec::new()));
        let accept_tasks = tasks.clone();
        let accept_handle = handle.clone();
        let accept = handle.spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer_addr)) => {
                        debug!(peer = %peer_addr, "accepted cluster connection");
                        let conn =
                            accept_handle.spawn(handle_connection(stream, peer_addr, bus.clone()));
                        let mut tasks = accept_tasks.lock().unwrap();
                        tasks.retain(|t: &AbortHandle| !t.is_finished());
                        tasks.push(conn.abort_handle());
                    }
                    Err(e) => {
                        // Transient accept errors (fd pressure) are survivable.
                        error!(error = %e, "cluster accept error");
                    }
                }
            }
        });
        tasks.lock().unwrap().push(accept.abort_handle());
        Ok(Server { local_addr, tasks })
    }

    /// The actually-bound address (resolves wildcard ports).
    pub(crate) fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting and drop every accepted connection.
    pub(crate) fn shutdown(&self) {
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn handle_connection(mut stream: TcpStream, peer_addr: SocketAddr, bus: Weak<BusInner>) {
    let mut read_buf: Vec<u8> = Vec::with_capacity(4096);

    'conn: loop {
        match stream.read_buf(&mut read_buf).await {
            Ok(0) => {
                debug!(peer = %peer_addr, "cluster connection closed by peer");
                break;
            }
            Ok(n) => trace!(peer = %peer_addr, bytes = n, "read from cluster connection"),
            Err(e) => {
                debug!(peer = %peer_addr, error = %e, "cluster connection read error");
                break;
            }
        }

        loop {
            let Some(bus) = bus.upgrade() else {
                return;
            };
            match wire::try_decode_frame(&mut read_buf, &bus.codecs) {
                Ok(Some(Frame::Ping { sender })) => {
                    trace!(peer = %peer_addr, node = %sender, "ping received");
                    if let Err(e) = stream.write_all(&[wire::PONG]).await {
                        debug!(peer = %peer_addr, error = %e, "failed to write pong");
                        break 'conn;
                    }
                }
                Ok(Some(Frame::Message(msg))) => {
                    trace!(peer = %peer_addr, address = %msg.address, "message received");
                    // No reply plumbing here: the sender's reply handler
                    // lives on the sending node.
                    bus.receive_message(msg, None);
                }
                Ok(None) => break,
                Err(e @ crate::error::WireError::FrameTooLarge { .. }) => {
                    // The stream offset is lost; drop the connection.
                    warn!(peer = %peer_addr, error = %e, "closing cluster connection");
                    break 'conn;
                }
                Err(e) => {
                    // The offending frame was consumed; keep the stream.
                    warn!(peer = %peer_addr, error = %e, "discarding malformed frame");
                    if read_buf.is_empty() {
                        break;
                    }
                }
            }
        }
    }
}
