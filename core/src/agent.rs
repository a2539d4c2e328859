// Contracts of the external messaging agent
//
// The agent owns the bus connection and its worker threads. Everything it
// hands back (messages, call replies, incoming calls) arrives on those
// threads and is forwarded into the bridge channels.
use std::fmt;
use std::sync::Arc;

use tether_caps::Caps;

/// Transport status returned by `post`/`call` and carried by return events.
pub type Status = i32;

/// Status codes shared by the bridge and the bundled loopback agent.
pub mod status {
    use super::Status;

    pub const SUCCESS: Status = 0;
    pub const INVALID_ARGUMENT: Status = -2;
    pub const NOT_CONNECTED: Status = -3;
    pub const TIMEOUT: Status = -4;
    pub const NOT_FOUND: Status = -5;
    pub const CLOSED: Status = -6;
}

/// Delivery classification of a published message, passed through untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct DeliveryClass(pub u32);

impl DeliveryClass {
    /// Delivered to current subscribers only.
    pub const INSTANT: DeliveryClass = DeliveryClass(0);
    /// Retained by the bus and replayed to late subscribers.
    pub const PERSIST: DeliveryClass = DeliveryClass(1);
}

impl fmt::Display for DeliveryClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of connection the current event arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionType {
    Local,
    Remote,
}

/// Per-event view of the connection that produced it.
///
/// Only valid for the duration of the agent callback it is passed to.
pub trait ConnectionContext {
    fn connection_type(&self) -> ConnectionType;
    /// Process id of a local peer.
    fn pid(&self) -> u32;
    /// Address of a remote peer.
    fn ipaddr(&self) -> String;
    /// Port of a remote peer.
    fn port(&self) -> u16;
    fn name(&self) -> String;
}

/// Response to an outgoing call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Response {
    pub ret_code: i32,
    pub data: Option<Arc<Caps>>,
}

/// Response builder for an incoming call, owned by the agent.
#[cfg_attr(test, mockall::automock)]
pub trait Reply: Send + Sync {
    fn write_code(&self, code: i32);
    fn write_data(&self, data: Option<Arc<Caps>>);
    /// Finalize and send the response.
    fn end(&self, code: i32, data: Option<Arc<Caps>>);
}

/// Connection settings forwarded to [`Agent::configure`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentConfig {
    pub uri: String,
    pub buffer_size: u32,
    pub reconnect_interval_ms: u32,
    pub keepalive_interval_ms: u32,
    pub keepalive_timeout_ms: u32,
}

pub type MessageHandler =
    Box<dyn Fn(&str, Option<Arc<Caps>>, DeliveryClass, &dyn ConnectionContext) + Send + Sync>;

/// Fired exactly once per accepted call.
pub type ReturnHandler = Box<dyn FnOnce(Status, Response) + Send>;

pub type MethodHandler =
    Box<dyn Fn(&str, Option<Arc<Caps>>, Arc<dyn Reply>, &dyn ConnectionContext) + Send + Sync>;

/// Publish/subscribe and RPC bus client.
///
/// Implementations invoke handlers from their own threads; they never call
/// into host code directly.
#[cfg_attr(test, mockall::automock)]
pub trait Agent: Send + Sync {
    fn configure(&self, config: &AgentConfig);

    fn start(&self);

    fn subscribe(&self, topic: &str, on_message: MessageHandler);

    fn unsubscribe(&self, topic: &str);

    fn post(&self, topic: &str, msg: Option<Arc<Caps>>, delivery: DeliveryClass) -> Status;

    fn call(
        &self,
        method: &str,
        msg: Option<Arc<Caps>>,
        target: &str,
        on_reply: ReturnHandler,
        timeout_ms: u32,
    ) -> Status;

    fn declare_method(&self, name: &str, on_call: MethodHandler);

    fn remove_method(&self, name: &str);

    fn close(&self);
}
