//! Message envelopes delivered to handlers.

use std::sync::Weak;
use switchboard_cluster::NodeId;
use tracing::debug;

use crate::body::Body;
use crate::bus::BusInner;
use crate::error::ReplyError;

/// Outcome delivered to a reply handler: the reply message, or the reason
/// no reply will ever come.
pub type ReplyResult = Result<Message, ReplyError>;

/// A message handler bound to an address.
///
/// Implemented for any `Fn(Message)` closure; deliveries to one handler run
/// serially on the execution lane it was bound to at registration.
pub trait MessageHandler: Send + Sync + 'static {
    /// Handle one delivery.
    fn handle(&self, msg: Message);
}

impl<F> MessageHandler for F
where
    F: Fn(Message) + Send + Sync + 'static,
{
    fn handle(&self, msg: Message) {
        self(msg)
    }
}

/// Routing state shared between the dispatch engine, the wire codec and
/// the connection pool. Every handler invocation gets its own clone.
#[derive(Debug, Clone)]
pub(crate) struct MessageData {
    /// True for point-to-point delivery, false for fan-out.
    pub send: bool,
    pub address: String,
    pub reply_address: Option<String>,
    pub sender: Option<NodeId>,
    pub body: Body,
}

impl MessageData {
    pub(crate) fn new(send: bool, address: impl Into<String>, body: Body) -> Self {
        Self {
            send,
            address: address.into(),
            reply_address: None,
            sender: None,
            body,
        }
    }
}

/// A received message.
///
/// Each handler invocation receives an independent envelope (so reply
/// routing on one delivery cannot interfere with another) over a shared
/// body.
#[derive(Debug)]
pub struct Message {
    data: MessageData,
    bus: Weak<BusInner>,
}

impl Message {
    pub(crate) fn new(data: MessageData, bus: Weak<BusInner>) -> Self {
        Self { data, bus }
    }

    /// The address this message was sent to.
    pub fn address(&self) -> &str {
        &self.data.address
    }

    /// The body payload.
    pub fn body(&self) -> &Body {
        &self.data.body
    }

    /// The reply address, when the sender expects a reply.
    pub fn reply_address(&self) -> Option<&str> {
        self.data.reply_address.as_deref()
    }

    /// The node the message originated from.
    pub fn sender(&self) -> Option<&NodeId> {
        self.data.sender.as_ref()
    }

    /// True when this was a point-to-point send, false for a publish.
    pub fn is_send(&self) -> bool {
        self.data.send
    }

    /// Reply to the sender.
    ///
    /// No-op when the sender did not supply a reply address, or when the
    /// bus has been closed.
    pub fn reply(&self, body: impl Into<Body>) {
        self.send_back(body.into(), None, None);
    }

    /// Reply and expect a reply to the reply, making nested
    /// request/response conversations symmetric. The bus default reply
    /// timeout applies.
    pub fn reply_with<F>(&self, body: impl Into<Body>, reply_handler: F)
    where
        F: FnOnce(ReplyResult) + Send + 'static,
    {
        self.send_back(body.into(), Some(Box::new(reply_handler)), None);
    }

    /// Like [`reply_with`](Self::reply_with) with an explicit timeout.
    pub fn reply_with_timeout<F>(
        &self,
        body: impl Into<Body>,
        timeout: std::time::Duration,
        reply_handler: F,
    ) where
        F: FnOnce(ReplyResult) + Send + 'static,
    {
        self.send_back(body.into(), Some(Box::new(reply_handler)), Some(timeout));
    }

    /// Signal failure to the sender.
    ///
    /// The sender's reply handler fires with
    /// [`ReplyError::Recipient`] carrying `code` and `message`.
    pub fn fail(&self, code: i32, message: &str) {
        self.send_back(
            Body::Failure {
                code,
                message: message.to_string(),
            },
            None,
            None,
        );
    }

    fn send_back(
        &self,
        body: Body,
        reply_handler: Option<crate::bus::ReplyCallback>,
        timeout: Option<std::time::Duration>,
    ) {
        let Some(reply_address) = self.data.reply_address.clone() else {
            debug!(address = %self.data.address, "reply ignored: no reply address");
            return;
        };
        let Some(bus) = self.bus.upgrade() else {
            debug!("reply ignored: bus is gone");
            return;
        };
        let msg = MessageData::new(true, reply_address, body);
        bus.send_reply(self.data.sender.clone(), msg, reply_handler, timeout);
    }
}
