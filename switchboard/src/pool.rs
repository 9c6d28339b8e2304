//! Outbound connection pool.
//!
//! One lazily-created TCP connection per remote node. Writes issued before
//! the connect handshake completes queue into the holder's pending FIFO
//! and drain, in order, once the socket is up. Each live connection runs
//! three tasks: a writer draining framed bytes onto the socket, a reader
//! treating any inbound byte as a pong, and a monitor running the
//! ping/pong liveness cycle. A dead connection is removed from the pool by
//! identity, so a reconnect racing the cleanup never loses its fresh
//! holder.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use switchboard_cluster::{AsyncMultiMap, NodeId};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, Notify};
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use crate::codec::CodecRegistry;
use crate::config::BusConfig;
use crate::message::MessageData;
use crate::wire;

/// Connection pool keyed by peer node.
#[derive(Clone)]
pub(crate) struct ConnectionPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    connections: DashMap<NodeId, Arc<ConnectionHolder>>,
    config: BusConfig,
    codecs: Arc<CodecRegistry>,
    self_node: NodeId,
    subs: Option<Arc<dyn AsyncMultiMap>>,
    handle: Handle,
    closed: AtomicBool,
}

/// State for one outbound connection.
pub(crate) struct ConnectionHolder {
    peer: NodeId,
    state: Mutex<HolderState>,
    /// Signalled by the reader whenever bytes arrive; the monitor treats
    /// it as pong reception.
    pong: Notify,
    tasks: Mutex<Vec<AbortHandle>>,
}

struct HolderState {
    connected: bool,
    pending: VecDeque<Vec<u8>>,
    writer: Option<mpsc::UnboundedSender<Vec<u8>>>,
}

impl ConnectionHolder {
    fn new(peer: NodeId) -> Self {
        Self {
            peer,
            state: Mutex::new(HolderState {
                connected: false,
                pending: VecDeque::new(),
                writer: None,
            }),
            pong: Notify::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Write a frame, or queue it while the handshake is in flight.
    fn write(&self, frame: Vec<u8>) {
        let mut state = self.state.lock().unwrap();
        if state.connected {
            if let Some(writer) = &state.writer {
                if writer.send(frame).is_ok() {
                    return;
                }
            }
            // Writer gone: the connection is being torn down, the frame
            // shares the fate of other in-flight messages.
            debug!(peer = %self.peer, "dropping frame for closing connection");
        } else {
            state.pending.push_back(frame);
        }
    }

    /// Write a frame only when the socket is already up. Returns whether
    /// the frame was handed to the writer.
    fn write_if_connected(&self, frame: Vec<u8>) -> bool {
        let state = self.state.lock().unwrap();
        if !state.connected {
            return false;
        }
        state
            .writer
            .as_ref()
            .is_some_and(|writer| writer.send(frame).is_ok())
    }
}

impl ConnectionPool {
    pub(crate) fn new(
        config: BusConfig,
        codecs: Arc<CodecRegistry>,
        self_node: NodeId,
        subs: Option<Arc<dyn AsyncMultiMap>>,
        handle: Handle,
    ) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                connections: DashMap::new(),
                config,
                codecs,
                self_node,
                subs,
                handle,
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Send a message to a peer, establishing the connection lazily.
    ///
    /// Never blocks: the message is either written, queued behind the
    /// in-flight handshake, or dropped (encode failure, pool closed) —
    /// remote delivery is not guaranteed.
    pub(crate) fn write_to(&self, peer: &NodeId, msg: &MessageData) {
        if self.inner.closed.load(Ordering::Acquire) {
            return;
        }
        let frame = match wire::encode_message(msg, &self.inner.codecs) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(peer = %peer, address = %msg.address, error = %e, "dropping unencodable message");
                return;
            }
        };

        let holder = match self.inner.connections.entry(peer.clone()) {
            Entry::Occupied(e) => e.get().clone(),
            Entry::Vacant(e) => {
                let holder = Arc::new(ConnectionHolder::new(peer.clone()));
                e.insert(holder.clone());
                debug!(peer = %peer, "opening cluster connection");
                let task = self
                    .inner
                    .handle
                    .spawn(connect(self.inner.clone(), holder.clone()));
                holder.tasks.lock().unwrap().push(task.abort_handle());
                holder
            }
        };
        holder.write(frame);
    }

    /// Close every pooled connection. Pending queues are discarded.
    pub(crate) fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        let holders: Vec<_> = self
            .inner
            .connections
            .iter()
            .map(|e| e.value().clone())
            .collect();
        for holder in holders {
            self.inner.cleanup(&holder, false);
        }
    }

    #[cfg(test)]
    pub(crate) fn connection_count(&self) -> usize {
        self.inner.connections.len()
    }
}

impl PoolInner {
    /// Tear one connection down: stop its tasks, drop its socket halves,
    /// and remove the pool entry if it still maps to this holder (a newer
    /// holder for the same peer is left alone). On failure the peer's
    /// subscriptions are purged, best-effort — the peer re-registers them
    /// when it comes back.
    fn cleanup(&self, holder: &Arc<ConnectionHolder>, failed: bool) {
        {
            let mut state = holder.state.lock().unwrap();
            state.connected = false;
            state.writer = None;
            state.pending.clear();
        }
        for task in holder.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
        let removed = self
            .connections
            .remove_if(&holder.peer, |_, existing| Arc::ptr_eq(existing, holder))
            .is_some();
        if removed {
            debug!(peer = %holder.peer, failed, "cluster connection closed");
            if failed {
                if let Some(subs) = self.subs.clone() {
                    let peer = holder.peer.clone();
                    self.handle.spawn(async move {
                        if let Err(e) = subs.remove_all_for_value(&peer).await {
                            warn!(peer = %peer, error = %e, "failed to purge subscriptions for dead peer");
                        }
                    });
                }
            }
        }
    }
}

/// Establish the socket for a fresh holder, then hand it to `connected`.
async fn connect(pool: Arc<PoolInner>, holder: Arc<ConnectionHolder>) {
    let addr = format!("{}:{}", holder.peer.host(), holder.peer.port());
    let attempt = tokio::time::timeout(pool.config.connect_timeout, TcpStream::connect(&addr));
    match attempt.await {
        Ok(Ok(stream)) => connected(pool, holder, stream),
        Ok(Err(e)) => {
            warn!(peer = %holder.peer, error = %e, "cluster connect failed");
            pool.cleanup(&holder, true);
        }
        Err(_) => {
            warn!(peer = %holder.peer, "cluster connect timed out");
            pool.cleanup(&holder, true);
        }
    }
}

/// Install the socket tasks, mark the holder connected and drain the
/// pending queue in order.
fn connected(pool: Arc<PoolInner>, holder: Arc<ConnectionHolder>, stream: TcpStream) {
    if pool.closed.load(Ordering::Acquire) {
        pool.cleanup(&holder, false);
        return;
    }
    let _ = stream.set_nodelay(true);
    let (mut read_half, mut write_half) = stream.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();

    let writer = {
        let pool = pool.clone();
        let holder = holder.clone();
        pool.handle.clone().spawn(async move {
            while let Some(frame) = rx.recv().await {
                if let Err(e) = write_half.write_all(&frame).await {
                    debug!(peer = %holder.peer, error = %e, "cluster connection write failed");
                    pool.cleanup(&holder, true);
                    return;
                }
            }
        })
    };

    let reader = {
        let pool = pool.clone();
        let holder = holder.clone();
        pool.handle.clone().spawn(async move {
            let mut buf = [0u8; 1024];
            loop {
                match read_half.read(&mut buf).await {
                    // Anything the peer writes back on this stream is a
                    // liveness signal (the pong byte in practice).
                    Ok(n) if n > 0 => holder.pong.notify_one(),
                    Ok(_) => {
                        debug!(peer = %holder.peer, "cluster connection closed by peer");
                        pool.cleanup(&holder, false);
                        return;
                    }
                    Err(e) => {
                        debug!(peer = %holder.peer, error = %e, "cluster connection read failed");
                        pool.cleanup(&holder, true);
                        return;
                    }
                }
            }
        })
    };

    let monitor = {
        let pool = pool.clone();
        let holder = holder.clone();
        pool.handle.clone().spawn(monitor(pool.clone(), holder))
    };

    holder.tasks.lock().unwrap().extend([
        writer.abort_handle(),
        reader.abort_handle(),
        monitor.abort_handle(),
    ]);

    let mut state = holder.state.lock().unwrap();
    for frame in state.pending.drain(..) {
        let _ = tx.send(frame);
    }
    state.writer = Some(tx);
    state.connected = true;
    drop(state);
    debug!(peer = %holder.peer, "cluster connection established");
}

/// Ping/pong liveness cycle: send a ping every interval, and tear the
/// connection down when no byte arrives within the reply interval.
async fn monitor(pool: Arc<PoolInner>, holder: Arc<ConnectionHolder>) {
    loop {
        tokio::time::sleep(pool.config.ping_interval).await;
        let frame = match wire::encode_ping(&pool.self_node) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "failed to encode ping");
                return;
            }
        };
        if !holder.write_if_connected(frame) {
            // Connection already torn down; cleanup owns the rest.
            return;
        }
        tokio::select! {
            _ = holder.pong.notified() => {}
            _ = tokio::time::sleep(pool.config.ping_reply_interval) => {
                warn!(peer = %holder.peer, "no pong from peer, considering it dead");
                pool.cleanup(&holder, true);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::body::Body;
    use std::time::Duration;

    fn pool_with(config: BusConfig) -> ConnectionPool {
        ConnectionPool::new(
            config,
            Arc::new(CodecRegistry::new()),
            NodeId::new("127.0.0.1", 1),
            None,
            Handle::current(),
        )
    }

    #[tokio::test]
    async fn test_failed_connect_removes_pool_entry() {
        let mut config = BusConfig::local_network();
        config.connect_timeout = Duration::from_millis(200);
        let pool = pool_with(config);

        // Nothing listens on this port; the connect attempt must fail and
        // clean its holder out of the pool.
        let dead_peer = NodeId::new("127.0.0.1", 1);
        let msg = MessageData::new(true, "addr", Body::from("x"));
        pool.write_to(&dead_peer, &msg);
        assert_eq!(pool.connection_count(), 1);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(pool.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_pending_writes_drain_on_connect() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let peer = NodeId::from_socket_addr(listener.local_addr().unwrap());

        let pool = pool_with(BusConfig::default());
        let codecs = CodecRegistry::new();

        // Queue two messages before the peer accepts.
        for text in ["first", "second"] {
            let msg = MessageData::new(true, "addr", Body::from(text));
            pool.write_to(&peer, &msg);
        }

        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = Vec::new();
        let mut seen = Vec::new();
        while seen.len() < 2 {
            let mut chunk = [0u8; 1024];
            let n = socket.read(&mut chunk).await.unwrap();
            assert!(n > 0, "connection closed before both frames arrived");
            buf.extend_from_slice(&chunk[..n]);
            while let Some(frame) = wire::try_decode_frame(&mut buf, &codecs).unwrap() {
                if let wire::Frame::Message(m) = frame {
                    seen.push(m.body.as_str().unwrap().to_string());
                }
            }
        }
        assert_eq!(seen, vec!["first", "second"]);
    }

    #[tokio::test]
    async fn test_ping_timeout_cleans_up_silent_peer() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let peer = NodeId::from_socket_addr(listener.local_addr().unwrap());

        let mut config = BusConfig::default();
        config.ping_interval = Duration::from_millis(100);
        config.ping_reply_interval = Duration::from_millis(100);
        let pool = pool_with(config);

        pool.write_to(&peer, &MessageData::new(true, "addr", Body::Null));

        // Accept but never write back: the monitor must give up.
        let (socket, _) = listener.accept().await.unwrap();
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(pool.connection_count(), 0);
        drop(socket);
    }

    #[tokio::test]
    async fn test_close_discards_connections() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let peer = NodeId::from_socket_addr(listener.local_addr().unwrap());

        let pool = pool_with(BusConfig::default());
        pool.write_to(&peer, &MessageData::new(true, "addr", Body::Null));
        pool.close();
        assert_eq!(pool.connection_count(), 0);

        // Writes after close are ignored.
        pool.write_to(&peer, &MessageData::new(true, "addr", Body::Null));
        assert_eq!(pool.connection_count(), 0);
    }
}
