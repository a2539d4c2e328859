// Owner-scoped callback registries: subscriptions, pending callers, callees
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tether_caps::{decode_opt, Caps, CodecError, HostValue, Payload};
use tracing::debug;

use crate::agent::{DeliveryClass, Status};
use crate::reply::ReplyProxy;
use crate::sender::SenderIdentity;

/// Stable identity of a [`Handle`](crate::Handle); never reused in a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(u64);

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "h{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionKey(pub u64);

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallerId(pub u64);

impl fmt::Display for CallerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A payload as delivered to host callbacks.
///
/// Carries the decoded host array together with the shared container it was
/// decoded from, so the host can forward it without re-encoding.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    values: Vec<HostValue>,
    caps: Option<Arc<Caps>>,
}

impl Message {
    pub fn decode(caps: Option<Arc<Caps>>) -> Result<Self, CodecError> {
        let values = decode_opt(caps.as_deref())?;
        Ok(Self { values, caps })
    }

    pub fn values(&self) -> &[HostValue] {
        &self.values
    }

    pub fn into_values(self) -> Vec<HostValue> {
        self.values
    }

    /// The container the values were decoded from, if any.
    pub fn encoded(&self) -> Option<&Arc<Caps>> {
        self.caps.as_ref()
    }

    /// Zero-copy payload for forwarding this message.
    pub fn to_payload(&self) -> Payload {
        match &self.caps {
            Some(caps) => Payload::Encoded(Arc::clone(caps)),
            None => Payload::Raw(Vec::new()),
        }
    }
}

/// Second argument of a return callback.
#[derive(Debug, Clone, PartialEq)]
pub struct ReturnValue {
    pub ret_code: i32,
    pub msg: Message,
}

pub type PostCallback = Arc<dyn Fn(Message, DeliveryClass, &SenderIdentity) + Send + Sync>;
pub type ReturnCallback = Box<dyn FnOnce(Status, ReturnValue) + Send + Sync>;
pub type CallCallback = Arc<dyn Fn(Message, ReplyProxy, &SenderIdentity) + Send + Sync>;

struct Subscription {
    topic: String,
    owner: HandleId,
    wrapped: PostCallback,
    raw: Option<PostCallback>,
}

struct Caller {
    owner: HandleId,
    callback: ReturnCallback,
}

struct Callee {
    owner: HandleId,
    callback: CallCallback,
}

/// Number of records dropped by [`Registries::remove_owner`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Removed {
    pub subscriptions: usize,
    pub callers: usize,
    pub callees: usize,
}

impl Removed {
    pub fn total(&self) -> usize {
        self.subscriptions + self.callers + self.callees
    }
}

/// Process-wide registries shared by every handle.
///
/// Lookups clone the callback out of the map before it is invoked, so a
/// callback may freely register or close while it runs.
#[derive(Default)]
pub struct Registries {
    subscriptions: DashMap<SubscriptionKey, Subscription>,
    callers: DashMap<CallerId, Caller>,
    callees: DashMap<String, Callee>,
    handle_seq: AtomicU64,
    sub_seq: AtomicU64,
    caller_seq: AtomicU64,
}

impl Registries {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mint_handle_id(&self) -> HandleId {
        HandleId(self.handle_seq.fetch_add(1, Ordering::Relaxed) + 1)
    }

    pub fn subscribe(
        &self,
        topic: &str,
        owner: HandleId,
        wrapped: PostCallback,
        raw: Option<PostCallback>,
    ) -> SubscriptionKey {
        let key = SubscriptionKey(self.sub_seq.fetch_add(1, Ordering::Relaxed) + 1);
        self.subscriptions.insert(
            key,
            Subscription {
                topic: topic.to_string(),
                owner,
                wrapped,
                raw,
            },
        );
        debug!(key = %key, topic, owner = %owner, "Subscription registered");
        key
    }

    /// Drop `owner`'s subscriptions to `topic`; with `raw`, only the one
    /// registered with that exact callback.
    ///
    /// Returns how many were removed and whether `owner` still has any
    /// subscription to `topic`.
    pub fn unsubscribe(
        &self,
        owner: HandleId,
        topic: &str,
        raw: Option<&PostCallback>,
    ) -> (usize, bool) {
        let before = self.subscriptions.len();
        self.subscriptions.retain(|_, sub| {
            let same_cb = match (raw, &sub.raw) {
                (None, _) => true,
                (Some(want), Some(have)) => Arc::ptr_eq(want, have),
                (Some(_), None) => false,
            };
            !(sub.owner == owner && sub.topic == topic && same_cb)
        });
        let removed = before.saturating_sub(self.subscriptions.len());
        let remaining = self
            .subscriptions
            .iter()
            .any(|e| e.owner == owner && e.topic == topic);
        (removed, remaining)
    }

    pub fn post_target(&self, key: SubscriptionKey) -> Option<PostCallback> {
        self.subscriptions
            .get(&key)
            .map(|sub| Arc::clone(&sub.wrapped))
    }

    /// Reserve a caller id; it only becomes a dispatch target once
    /// [`add_caller`](Self::add_caller) records it.
    pub fn next_caller_id(&self) -> CallerId {
        CallerId(self.caller_seq.fetch_add(1, Ordering::Relaxed) + 1)
    }

    pub fn add_caller(&self, id: CallerId, owner: HandleId, callback: ReturnCallback) {
        self.callers.insert(id, Caller { owner, callback });
    }

    /// Remove a caller for delivery of its single return.
    pub fn take_caller(&self, id: CallerId) -> Option<ReturnCallback> {
        self.callers.remove(&id).map(|(_, caller)| caller.callback)
    }

    /// Bind `name` to `callback`, replacing any previous binding.
    ///
    /// Returns the previous owner, which is not notified.
    pub fn declare_method(
        &self,
        name: &str,
        owner: HandleId,
        callback: CallCallback,
    ) -> Option<HandleId> {
        self.callees
            .insert(name.to_string(), Callee { owner, callback })
            .map(|prev| prev.owner)
    }

    /// Remove `name` only if `owner` holds the current binding.
    pub fn remove_method(&self, owner: HandleId, name: &str) -> bool {
        self.callees
            .remove_if(name, |_, callee| callee.owner == owner)
            .is_some()
    }

    pub fn call_target(&self, name: &str) -> Option<CallCallback> {
        self.callees
            .get(name)
            .map(|callee| Arc::clone(&callee.callback))
    }

    /// Drop every record owned by `owner`, leaving other owners untouched.
    pub fn remove_owner(&self, owner: HandleId) -> Removed {
        let (subs, callers, callees) = self.counts();
        self.subscriptions.retain(|_, sub| sub.owner != owner);
        self.callers.retain(|_, caller| caller.owner != owner);
        self.callees.retain(|_, callee| callee.owner != owner);
        let (subs_after, callers_after, callees_after) = self.counts();
        Removed {
            subscriptions: subs.saturating_sub(subs_after),
            callers: callers.saturating_sub(callers_after),
            callees: callees.saturating_sub(callees_after),
        }
    }

    /// (subscriptions, callers, callees)
    pub fn counts(&self) -> (usize, usize, usize) {
        (
            self.subscriptions.len(),
            self.callers.len(),
            self.callees.len(),
        )
    }
}
