// Sender identity attached to posts and incoming calls
use std::fmt;

use serde::Serialize;

use crate::agent::{ConnectionContext, ConnectionType};

/// Who produced an event, captured on the agent thread at enqueue time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum SenderIdentity {
    Local { pid: u32, name: String },
    Remote { ipaddr: String, port: u16, name: String },
}

impl SenderIdentity {
    /// Read the sender out of the connection the current event arrived on.
    ///
    /// Local peers are identified by pid, remote peers by address and port;
    /// the other accessors of `ctx` are not consulted.
    pub fn capture(ctx: &dyn ConnectionContext) -> Self {
        match ctx.connection_type() {
            ConnectionType::Local => SenderIdentity::Local {
                pid: ctx.pid(),
                name: ctx.name(),
            },
            ConnectionType::Remote => SenderIdentity::Remote {
                ipaddr: ctx.ipaddr(),
                port: ctx.port(),
                name: ctx.name(),
            },
        }
    }

    pub fn name(&self) -> &str {
        match self {
            SenderIdentity::Local { name, .. } | SenderIdentity::Remote { name, .. } => name,
        }
    }

    pub fn connection_type(&self) -> ConnectionType {
        match self {
            SenderIdentity::Local { .. } => ConnectionType::Local,
            SenderIdentity::Remote { .. } => ConnectionType::Remote,
        }
    }

    /// Host-facing object form: `{pid, name}` or `{ipaddr, port, name}`.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

impl fmt::Display for SenderIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SenderIdentity::Local { pid, name } => write!(f, "{name}(pid {pid})"),
            SenderIdentity::Remote { ipaddr, port, name } => write!(f, "{name}@{ipaddr}:{port}"),
        }
    }
}
