// Tether Core Library
// Bridges a multi-threaded pub/sub + RPC agent onto a single host thread

pub mod agent;
pub mod bridge;
pub mod handle;
pub mod loopback;
pub mod options;
pub mod registry;
pub mod reply;
pub mod sender;
pub mod telemetry;

// Export core types
pub use agent::{status, Agent, AgentConfig, DeliveryClass, Reply, Response, Status};
pub use bridge::{Bridge, DispatchStats};
pub use handle::Handle;
pub use options::HandleOptions;
pub use registry::{
    CallCallback, CallerId, HandleId, Message, PostCallback, ReturnCallback, ReturnValue,
    SubscriptionKey,
};
pub use reply::ReplyProxy;
pub use sender::SenderIdentity;

pub use tether_caps as caps;
pub use tether_caps::{HostValue, Payload};

// Error types
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TetherError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Encoding error: {0}")]
    Encoding(#[from] tether_caps::CodecError),

    #[error("Handle is closed")]
    Closed,

    #[error("Reply already ended")]
    ReplyEnded,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
pub type Result<T> = std::result::Result<T, TetherError>;
