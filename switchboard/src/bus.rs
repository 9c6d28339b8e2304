//! The event bus: dispatch engine and public API.
//!
//! Routing follows one path for every operation. A caller's `send` or
//! `publish` enters [`BusInner::send_or_pub`], which allocates the reply
//! address and timeout when a reply is expected, then routes: a reply goes
//! straight to its destination node, a clustered send consults the
//! subscription map, everything else delivers locally. Remote frames
//! re-enter the same path on the receiving node as a purely local
//! delivery.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use switchboard_cluster::{
    AsyncMultiMap, ChoosableSet, ClusterManager, NodeId, NodeListener,
};
use tokio::net::TcpListener;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::body::Body;
use crate::codec::{CodecRegistry, MessageCodec};
use crate::config::BusConfig;
use crate::context::Context;
use crate::error::{BusError, ReplyError};
use crate::message::{Message, MessageData, MessageHandler, ReplyResult};
use crate::pool::ConnectionPool;
use crate::registry::{HandlerHolder, HandlerRegistry};
use crate::server::Server;

/// Subscription-map name the bus stores its address routing in.
const SUBS_MAP_NAME: &str = "subs";

/// One-shot callback receiving the reply, or the reason there is none.
pub(crate) type ReplyCallback = Box<dyn FnOnce(ReplyResult) + Send + 'static>;

/// Adapts a one-shot reply callback into a registered handler.
///
/// The callback fires at most once, whether through a delivery, a timeout
/// or a no-handlers failure — whichever comes first wins and the rest are
/// ignored.
struct ReplyAdapter {
    callback: Mutex<Option<ReplyCallback>>,
}

impl ReplyAdapter {
    fn new(callback: ReplyCallback) -> Arc<Self> {
        Arc::new(Self {
            callback: Mutex::new(Some(callback)),
        })
    }

    fn fire(&self, result: ReplyResult) {
        if let Some(callback) = self.callback.lock().unwrap().take() {
            callback(result);
        }
    }
}

impl MessageHandler for ReplyAdapter {
    fn handle(&self, msg: Message) {
        let result = match msg.body() {
            Body::Failure { code, message } => Err(ReplyError::Recipient {
                code: *code,
                message: message.clone(),
            }),
            _ => Ok(msg),
        };
        self.fire(result);
    }
}

/// Everything a local delivery needs to surface a no-handlers failure back
/// to the caller that expected a reply.
pub(crate) struct ReplyCtx {
    adapter: Arc<ReplyAdapter>,
    reply_address: String,
    holder: Arc<HandlerHolder>,
}

/// Serial lane for subscription lookups.
///
/// Clustered sends resolve their destination through the async
/// subscription map; running those lookups on one queue keeps
/// sender-order intact all the way onto each peer connection. Without it,
/// two back-to-back sends could race their lookups and swap their write
/// order.
struct DispatchLane {
    tx: tokio::sync::mpsc::UnboundedSender<
        std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>>,
    >,
}

impl DispatchLane {
    fn new(handle: &Handle) -> Self {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<
            std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>>,
        >();
        handle.spawn(async move {
            while let Some(job) = rx.recv().await {
                job.await;
            }
        });
        Self { tx }
    }

    fn enqueue(&self, job: impl std::future::Future<Output = ()> + Send + 'static) {
        let _ = self.tx.send(Box::pin(job));
    }
}

/// Surfaces cluster membership changes in the log.
struct LoggingNodeListener;

impl NodeListener for LoggingNodeListener {
    fn node_added(&self, node_id: &str) {
        info!(member = %node_id, "cluster member joined");
    }

    fn node_left(&self, node_id: &str) {
        info!(member = %node_id, "cluster member left");
    }
}

/// Shared bus state. Public handles ([`EventBus`], [`Registration`],
/// [`Message`]) hold it through `Arc`/`Weak`.
pub(crate) struct BusInner {
    node_id: NodeId,
    registry: HandlerRegistry,
    pool: Option<ConnectionPool>,
    pub(crate) codecs: Arc<CodecRegistry>,
    subs: Option<Arc<dyn AsyncMultiMap>>,
    cluster: Option<Arc<dyn ClusterManager>>,
    server: Mutex<Option<Server>>,
    reply_sequence: AtomicU64,
    default_reply_timeout: Mutex<Option<Duration>>,
    dispatch: DispatchLane,
    handle: Handle,
    closed: AtomicBool,
    self_ref: Weak<BusInner>,
}

impl BusInner {
    fn clustered(&self) -> bool {
        self.subs.is_some()
    }

    /// Reply addresses must be unguessable on a clustered bus (a malicious
    /// peer could otherwise inject replies to predicted addresses); a
    /// local bus only needs uniqueness and takes the cheaper counter.
    fn generate_reply_address(&self) -> String {
        if self.clustered() {
            Uuid::new_v4().to_string()
        } else {
            (self.reply_sequence.fetch_add(1, Ordering::Relaxed) + 1).to_string()
        }
    }

    /// Register a handler holder, propagating the first non-reply,
    /// non-local registration on an address into the subscription map.
    /// Returns the holder and the readiness receiver (None when readiness
    /// is immediate).
    fn register(
        &self,
        address: &str,
        handler: Arc<dyn MessageHandler>,
        reply_handler: bool,
        local_only: bool,
    ) -> Result<
        (
            Arc<HandlerHolder>,
            Option<oneshot::Receiver<Result<(), BusError>>>,
        ),
        BusError,
    > {
        if self.closed.load(Ordering::Acquire) {
            return Err(BusError::Closed);
        }
        let context = Context::new(&self.handle);
        let (holder, first) =
            self.registry
                .register(address, handler, reply_handler, local_only, context);

        let readiness = if first && !reply_handler && !local_only {
            self.subs.clone().map(|subs| {
                let (tx, rx) = oneshot::channel();
                let address = address.to_string();
                let node = self.node_id.clone();
                self.handle.spawn(async move {
                    let result = subs
                        .add(&address, node)
                        .await
                        .map_err(BusError::from);
                    let _ = tx.send(result);
                });
                rx
            })
        } else {
            None
        };
        Ok((holder, readiness))
    }

    /// Unregister and wait for the subscription-map removal to ack.
    pub(crate) async fn unregister_handler(
        &self,
        address: &str,
        id: u64,
    ) -> Result<(), BusError> {
        if self.registry.unregister(address, id) == Some(true) {
            if let Some(subs) = &self.subs {
                subs.remove(address, &self.node_id).await?;
            }
        }
        Ok(())
    }

    /// Unregister without waiting; the subscription-map removal (when one
    /// is due) happens in the background.
    fn unregister_detached(&self, address: &str, id: u64) {
        if self.registry.unregister(address, id) == Some(true) {
            if let Some(subs) = self.subs.clone() {
                let address = address.to_string();
                let node = self.node_id.clone();
                self.handle.spawn(async move {
                    if let Err(e) = subs.remove(&address, &node).await {
                        warn!(address = %address, error = %e, "failed to remove subscription");
                    }
                });
            }
        }
    }

    /// Reply routing entry point used by [`Message::reply`] and friends.
    pub(crate) fn send_reply(
        &self,
        reply_dest: Option<NodeId>,
        msg: MessageData,
        reply_handler: Option<ReplyCallback>,
        timeout: Option<Duration>,
    ) {
        // The destination defaults to this node: a message that carried no
        // sender was delivered locally.
        let dest = reply_dest.unwrap_or_else(|| self.node_id.clone());
        if let Err(e) = self.send_or_pub(Some(dest), msg, reply_handler, timeout) {
            warn!(error = %e, "reply could not be sent");
        }
    }

    /// The dispatch engine.
    pub(crate) fn send_or_pub(
        &self,
        reply_dest: Option<NodeId>,
        mut msg: MessageData,
        reply_handler: Option<ReplyCallback>,
        timeout: Option<Duration>,
    ) -> Result<(), BusError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BusError::Closed);
        }
        if self.clustered() {
            if let Body::Object { type_name, .. } = &msg.body {
                if !self.codecs.contains(type_name) {
                    return Err(BusError::NoCodec(type_name.clone()));
                }
            }
        }
        msg.sender = Some(self.node_id.clone());
        let timeout = timeout.or(*self.default_reply_timeout.lock().unwrap());

        let reply_ctx = match reply_handler {
            Some(callback) => Some(self.install_reply_handler(&mut msg, callback, timeout)?),
            None => None,
        };

        if let Some(dest) = reply_dest {
            if dest == self.node_id {
                self.receive_message(msg, reply_ctx);
            } else {
                self.write_remote(&dest, &msg);
            }
        } else if let Some(subs) = self.subs.clone() {
            let bus = self.self_ref.clone();
            let address = msg.address.clone();
            self.dispatch.enqueue(async move {
                let Some(bus) = bus.upgrade() else { return };
                match subs.get(&address).await {
                    Ok(set) if !set.is_empty() => bus.send_to_subs(&set, msg, reply_ctx),
                    // Nothing propagated for the address: let the local
                    // registry decide between delivery and no-handlers.
                    Ok(_) => bus.receive_message(msg, reply_ctx),
                    Err(e) => {
                        error!(address = %address, error = %e, "subscriber lookup failed, dropping message");
                    }
                }
            });
        } else {
            self.receive_message(msg, reply_ctx);
        }
        Ok(())
    }

    /// Allocate the reply address, register the one-shot reply handler at
    /// it, and arm the reply timeout.
    fn install_reply_handler(
        &self,
        msg: &mut MessageData,
        callback: ReplyCallback,
        timeout: Option<Duration>,
    ) -> Result<ReplyCtx, BusError> {
        let reply_address = self.generate_reply_address();
        msg.reply_address = Some(reply_address.clone());
        let adapter = ReplyAdapter::new(callback);
        let (holder, _) = self.register(&reply_address, adapter.clone(), true, true)?;

        if let Some(timeout) = timeout {
            let bus = self.self_ref.clone();
            let address = reply_address.clone();
            let adapter = adapter.clone();
            let holder_id = holder.id;
            let task = self.handle.spawn(async move {
                tokio::time::sleep(timeout).await;
                let Some(bus) = bus.upgrade() else { return };
                warn!(address = %address, "reply timed out, removing reply handler");
                bus.unregister_detached(&address, holder_id);
                adapter.fire(Err(ReplyError::Timeout));
            });
            holder.set_timeout(task.abort_handle());
        }

        Ok(ReplyCtx {
            adapter,
            reply_address,
            holder,
        })
    }

    /// Route one message to the subscriber set.
    fn send_to_subs(
        &self,
        set: &ChoosableSet<NodeId>,
        msg: MessageData,
        reply_ctx: Option<ReplyCtx>,
    ) {
        if msg.send {
            if let Some(node) = set.choose() {
                if *node == self.node_id {
                    self.receive_message(msg, reply_ctx);
                } else {
                    self.write_remote(node, &msg);
                }
            }
        } else {
            for node in set.iter() {
                if *node == self.node_id {
                    self.receive_message(msg.clone(), None);
                } else {
                    self.write_remote(node, &msg);
                }
            }
        }
    }

    fn write_remote(&self, dest: &NodeId, msg: &MessageData) {
        match &self.pool {
            Some(pool) => pool.write_to(dest, msg),
            None => warn!(dest = %dest, "no connection pool, dropping remote message"),
        }
    }

    /// Local delivery: round-robin for sends, snapshot fan-out for
    /// publishes, no-handlers signalling for callers expecting a reply.
    pub(crate) fn receive_message(&self, msg: MessageData, reply_ctx: Option<ReplyCtx>) {
        match self.registry.bucket(&msg.address) {
            Some(handlers) => {
                if msg.send {
                    if let Some(holder) = handlers.choose() {
                        self.do_receive(msg, holder);
                    }
                } else {
                    for holder in handlers.snapshot() {
                        self.do_receive(msg.clone(), holder);
                    }
                }
            }
            None => {
                if let Some(ctx) = reply_ctx {
                    ctx.holder.cancel_timeout();
                    self.unregister_detached(&ctx.reply_address, ctx.holder.id);
                    let adapter = ctx.adapter;
                    // Asynchronously, like every other reply outcome.
                    self.handle.spawn(async move {
                        adapter.fire(Err(ReplyError::NoHandlers));
                    });
                } else {
                    debug!(address = %msg.address, "no handlers, dropping message");
                }
            }
        }
    }

    /// Schedule one delivery onto the holder's context.
    fn do_receive(&self, msg: MessageData, holder: Arc<HandlerHolder>) {
        let bus = self.self_ref.clone();
        let address = msg.address.clone();
        // Each handler gets an independent envelope over the shared body.
        let message = Message::new(msg, bus.clone());
        let holder_for_job = holder.clone();
        holder.context.execute(move || {
            let holder = holder_for_job;
            // The handler may have been unregistered between dispatch and
            // execution.
            if !holder.removed.load(Ordering::Acquire) {
                let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    holder.handler.handle(message)
                }));
                if outcome.is_err() {
                    error!(address = %address, "handler panicked during delivery");
                }
            }
            // First delivery wins, whether or not the handler panicked.
            if holder.reply_handler {
                if let Some(bus) = bus.upgrade() {
                    bus.unregister_detached(&address, holder.id);
                }
            }
        });
    }
}

impl Drop for BusInner {
    fn drop(&mut self) {
        // Best-effort release of sockets when the last handle goes away
        // without an explicit close.
        if let Ok(mut server) = self.server.lock() {
            server.take();
        }
        if let Some(pool) = &self.pool {
            pool.close();
        }
    }
}

/// The event bus.
///
/// Cloning is cheap and every clone drives the same bus. See
/// [`EventBus::local`] for a single-process bus and
/// [`EventBus::start_clustered`] for a cluster member.
///
/// # Example
///
/// ```rust,ignore
/// let bus = EventBus::local();
///
/// let registration = bus.register_handler("orders.created", |msg: Message| {
///     println!("got {:?}", msg.body());
///     msg.reply("ack");
/// })?;
/// registration.completion().await?;
///
/// bus.send_with_timeout("orders.created", "order-17", Duration::from_secs(1), |reply| {
///     match reply {
///         Ok(msg) => println!("acked: {:?}", msg.body()),
///         Err(e) => println!("failed: {e}"),
///     }
/// })?;
/// ```
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    /// Create a non-clustered bus.
    ///
    /// No listener is bound and nothing ever crosses the wire; bodies are
    /// passed by reference and codecs are not required.
    ///
    /// Must be called within a tokio runtime.
    pub fn local() -> EventBus {
        let handle = Handle::current();
        let inner = Arc::new_cyclic(|self_ref: &Weak<BusInner>| BusInner {
            node_id: NodeId::new("localhost", 0),
            registry: HandlerRegistry::new(),
            pool: None,
            codecs: Arc::new(CodecRegistry::new()),
            subs: None,
            cluster: None,
            server: Mutex::new(None),
            reply_sequence: AtomicU64::new(0),
            default_reply_timeout: Mutex::new(None),
            dispatch: DispatchLane::new(&handle),
            handle,
            closed: AtomicBool::new(false),
            self_ref: self_ref.clone(),
        });
        EventBus { inner }
    }

    /// Join the cluster and start the bus.
    ///
    /// Binds the inbound listener on `config.host:config.port`, resolves
    /// the advertised identity (operator overrides win, then the actual
    /// bound port), joins the cluster and obtains the subscription map.
    ///
    /// # Errors
    ///
    /// Fails when the listener cannot bind or the cluster cannot be
    /// joined.
    pub async fn start_clustered(
        config: BusConfig,
        cluster: Arc<dyn ClusterManager>,
    ) -> Result<EventBus, BusError> {
        let handle = Handle::current();
        cluster.join().await?;
        let subs = cluster.multi_map(SUBS_MAP_NAME)?;

        let bind_addr = format!("{}:{}", config.host, config.port);
        let listener = TcpListener::bind(&bind_addr)
            .await
            .map_err(|e| BusError::Bind {
                addr: bind_addr.clone(),
                source: e,
            })?;
        let local_addr = listener.local_addr().map_err(|e| BusError::Bind {
            addr: bind_addr,
            source: e,
        })?;

        let port = config.public_port.unwrap_or_else(|| local_addr.port());
        let host = config
            .public_host
            .clone()
            .unwrap_or_else(|| config.host.clone());
        let node_id = NodeId::new(host, port);
        info!(node = %node_id, bound = %local_addr, "event bus listening");

        let codecs = Arc::new(CodecRegistry::new());
        let default_reply_timeout = config.default_reply_timeout;
        let inner = Arc::new_cyclic(|self_ref: &Weak<BusInner>| BusInner {
            node_id: node_id.clone(),
            registry: HandlerRegistry::new(),
            pool: Some(ConnectionPool::new(
                config,
                codecs.clone(),
                node_id,
                Some(subs.clone()),
                handle.clone(),
            )),
            codecs,
            subs: Some(subs),
            cluster: Some(cluster.clone()),
            server: Mutex::new(None),
            reply_sequence: AtomicU64::new(0),
            default_reply_timeout: Mutex::new(default_reply_timeout),
            dispatch: DispatchLane::new(&handle),
            handle: handle.clone(),
            closed: AtomicBool::new(false),
            self_ref: self_ref.clone(),
        });

        let server = Server::start(listener, Arc::downgrade(&inner), handle)
            .map_err(|e| BusError::Bind {
                addr: local_addr.to_string(),
                source: e,
            })?;
        *inner.server.lock().unwrap() = Some(server);
        cluster.set_node_listener(Arc::new(LoggingNodeListener));

        Ok(EventBus { inner })
    }

    /// This node's advertised identity.
    pub fn node_id(&self) -> &NodeId {
        &self.inner.node_id
    }

    /// Point-to-point send: exactly one handler on the address receives
    /// the message, chosen round-robin across the cluster.
    ///
    /// # Errors
    ///
    /// Fails synchronously when the bus is closed, or when `body` is an
    /// object body with no codec registered on a clustered bus. Absence of
    /// handlers is not an error — the message is dropped.
    pub fn send(&self, address: &str, body: impl Into<Body>) -> Result<(), BusError> {
        self.inner
            .send_or_pub(None, MessageData::new(true, address, body.into()), None, None)
    }

    /// Send and receive the reply through `reply_handler`.
    ///
    /// The bus default reply timeout applies when one is configured;
    /// without one the handler waits indefinitely (or until
    /// `NO_HANDLERS`).
    pub fn send_with_reply<F>(
        &self,
        address: &str,
        body: impl Into<Body>,
        reply_handler: F,
    ) -> Result<(), BusError>
    where
        F: FnOnce(ReplyResult) + Send + 'static,
    {
        self.inner.send_or_pub(
            None,
            MessageData::new(true, address, body.into()),
            Some(Box::new(reply_handler)),
            None,
        )
    }

    /// Send with an explicit reply timeout.
    ///
    /// `reply_handler` fires exactly once: with the reply, or with
    /// [`ReplyError::Timeout`], [`ReplyError::NoHandlers`] or
    /// [`ReplyError::Recipient`].
    pub fn send_with_timeout<F>(
        &self,
        address: &str,
        body: impl Into<Body>,
        timeout: Duration,
        reply_handler: F,
    ) -> Result<(), BusError>
    where
        F: FnOnce(ReplyResult) + Send + 'static,
    {
        self.inner.send_or_pub(
            None,
            MessageData::new(true, address, body.into()),
            Some(Box::new(reply_handler)),
            Some(timeout),
        )
    }

    /// Fan-out: every handler on the address, on every node, receives the
    /// message once.
    pub fn publish(&self, address: &str, body: impl Into<Body>) -> Result<(), BusError> {
        self.inner
            .send_or_pub(None, MessageData::new(false, address, body.into()), None, None)
    }

    /// Register a handler on an address, visible to the whole cluster.
    ///
    /// Local sends can reach the handler as soon as this returns; sends
    /// from other nodes once [`Registration::completion`] resolves.
    pub fn register_handler(
        &self,
        address: &str,
        handler: impl MessageHandler,
    ) -> Result<Registration, BusError> {
        self.register(address, Arc::new(handler), false)
    }

    /// Register a handler that only receives messages sent from this node.
    /// Nothing is propagated into the subscription map.
    pub fn register_local_handler(
        &self,
        address: &str,
        handler: impl MessageHandler,
    ) -> Result<Registration, BusError> {
        self.register(address, Arc::new(handler), true)
    }

    fn register(
        &self,
        address: &str,
        handler: Arc<dyn MessageHandler>,
        local_only: bool,
    ) -> Result<Registration, BusError> {
        let (holder, readiness) = self.inner.register(address, handler, false, local_only)?;
        Ok(Registration {
            address: address.to_string(),
            id: holder.id,
            bus: Arc::downgrade(&self.inner),
            readiness: Mutex::new(readiness),
        })
    }

    /// Register the codec used when `T` crosses the wire as a message
    /// body. Keyed by `T`'s runtime type name.
    pub fn register_codec<T: std::any::Any>(&self, codec: impl MessageCodec + 'static) {
        self.inner
            .codecs
            .register(std::any::type_name::<T>(), Arc::new(codec));
    }

    /// Remove the codec for `T`. Returns whether one was registered.
    pub fn unregister_codec<T: std::any::Any>(&self) -> bool {
        self.inner.codecs.unregister(std::any::type_name::<T>())
    }

    /// Reply timeout applied to sends that don't specify one. `None`
    /// disables the default (the initial state).
    pub fn set_default_reply_timeout(&self, timeout: Option<Duration>) {
        *self.inner.default_reply_timeout.lock().unwrap() = timeout;
    }

    /// The current default reply timeout.
    pub fn get_default_reply_timeout(&self) -> Option<Duration> {
        *self.inner.default_reply_timeout.lock().unwrap()
    }

    /// Shut the bus down: cancel reply timers, close the inbound listener
    /// and every pooled connection, and leave the cluster (peers observe
    /// `node_left`). In-flight deliveries already on their contexts may
    /// still run. Idempotent.
    pub async fn close(&self) -> Result<(), BusError> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!(node = %self.inner.node_id, "closing event bus");
        self.inner.registry.clear();
        let server = self.inner.server.lock().unwrap().take();
        drop(server);
        if let Some(pool) = &self.inner.pool {
            pool.close();
        }
        if let Some(cluster) = &self.inner.cluster {
            cluster.leave().await?;
        }
        Ok(())
    }
}

/// Handle for a registered handler.
///
/// Dropping the handle does not unregister the handler; call
/// [`Registration::unregister`].
pub struct Registration {
    address: String,
    id: u64,
    bus: Weak<BusInner>,
    readiness: Mutex<Option<oneshot::Receiver<Result<(), BusError>>>>,
}

impl Registration {
    /// The address the handler is registered on.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Resolves once the registration is visible to the whole cluster —
    /// immediately for local-only handlers and non-clustered buses.
    pub async fn completion(&self) -> Result<(), BusError> {
        let receiver = self.readiness.lock().unwrap().take();
        match receiver {
            None => Ok(()),
            Some(rx) => rx.await.unwrap_or(Err(BusError::Closed)),
        }
    }

    /// Remove the handler. Resolves once the subscription-map removal (if
    /// this was the last cluster-visible handler on the address) has been
    /// acknowledged. No further deliveries reach the handler afterwards.
    pub async fn unregister(self) -> Result<(), BusError> {
        let Some(bus) = self.bus.upgrade() else {
            return Ok(());
        };
        bus.unregister_handler(&self.address, self.id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_local_reply_addresses_are_sequential() {
        let bus = EventBus::local();
        let a = bus.inner.generate_reply_address();
        let b = bus.inner.generate_reply_address();
        assert_eq!(a, "1");
        assert_eq!(b, "2");
    }

    #[tokio::test]
    async fn test_default_reply_timeout_round_trips() {
        let bus = EventBus::local();
        assert_eq!(bus.get_default_reply_timeout(), None);
        bus.set_default_reply_timeout(Some(Duration::from_millis(250)));
        assert_eq!(
            bus.get_default_reply_timeout(),
            Some(Duration::from_millis(250))
        );
    }

    #[tokio::test]
    async fn test_operations_fail_after_close() {
        let bus = EventBus::local();
        bus.close().await.unwrap();
        assert!(matches!(bus.send("a", "x"), Err(BusError::Closed)));
        assert!(matches!(
            bus.register_handler("a", |_msg: Message| {}),
            Err(BusError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let bus = EventBus::local();
        bus.close().await.unwrap();
        bus.close().await.unwrap();
    }
}
