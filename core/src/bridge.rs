// Event bridge: agent threads -> host thread
//
// Three one-directional channels (post, return, call). Producers append under
// a short lock and signal the channel's wake primitive; the host thread swaps
// the pending list out under the same lock and dispatches outside it.
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use tether_caps::Caps;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::agent::{DeliveryClass, Reply, Status};
use crate::registry::{CallerId, Message, Registries, ReturnValue, SubscriptionKey};
use crate::reply::ReplyProxy;
use crate::sender::SenderIdentity;

/// A published message routed to one subscription.
pub struct PostEvent {
    pub key: SubscriptionKey,
    pub msg: Option<Arc<Caps>>,
    pub delivery: DeliveryClass,
    pub sender: SenderIdentity,
}

/// The single response to an accepted outgoing call.
pub struct ReturnEvent {
    pub caller_id: CallerId,
    pub status: Status,
    pub ret_code: i32,
    pub msg: Option<Arc<Caps>>,
}

/// An incoming call for a declared method.
pub struct CallEvent {
    pub method: String,
    pub msg: Option<Arc<Caps>>,
    pub reply: Arc<dyn Reply>,
    pub sender: SenderIdentity,
}

/// Producer-safe pending list plus its host-thread wake signal.
pub struct Channel<E> {
    pending: Mutex<Vec<E>>,
    wake: Notify,
}

impl<E> Default for Channel<E> {
    fn default() -> Self {
        Self {
            pending: Mutex::new(Vec::new()),
            wake: Notify::new(),
        }
    }
}

impl<E> Channel<E> {
    /// Append one event and wake the host thread. Callable from any thread.
    ///
    /// Repeated signals before the host wakes collapse into one.
    pub fn push(&self, event: E) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
        self.wake.notify_one();
    }

    /// Swap the pending list for an empty one.
    pub fn take(&self) -> Vec<E> {
        std::mem::take(&mut *self.pending.lock().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn len(&self) -> usize {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    async fn woken(&self) {
        self.wake.notified().await
    }
}

/// Reference count deciding whether the host loop keeps running.
///
/// Non-daemon handles hold one reference while started.
#[derive(Default)]
pub struct KeepAlive {
    refs: AtomicUsize,
    changed: Notify,
}

impl KeepAlive {
    pub fn acquire(&self) {
        self.refs.fetch_add(1, Ordering::AcqRel);
        self.changed.notify_one();
    }

    pub fn release(&self) {
        let _ = self
            .refs
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        self.changed.notify_one();
    }

    pub fn count(&self) -> usize {
        self.refs.load(Ordering::Acquire)
    }

    pub fn is_held(&self) -> bool {
        self.count() > 0
    }
}

/// Outcome of one drain pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub delivered: usize,
    pub dropped: usize,
}

impl DispatchStats {
    fn merge(self, other: DispatchStats) -> DispatchStats {
        DispatchStats {
            delivered: self.delivered + other.delivered,
            dropped: self.dropped + other.dropped,
        }
    }
}

/// Process-wide coordinator shared by every handle.
///
/// Owns the registries, the three channels and the keep-alive count. Exactly
/// one thread, the host thread, runs the `dispatch_*` methods (directly or
/// through [`run`](Self::run)); any thread may enqueue.
#[derive(Default)]
pub struct Bridge {
    registries: Registries,
    posts: Channel<PostEvent>,
    returns: Channel<ReturnEvent>,
    calls: Channel<CallEvent>,
    keep_alive: KeepAlive,
}

static GLOBAL: OnceLock<Arc<Bridge>> = OnceLock::new();

impl Bridge {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The coordinator shared by all handles in this process.
    pub fn global() -> Arc<Self> {
        Arc::clone(GLOBAL.get_or_init(Bridge::new))
    }

    pub fn registries(&self) -> &Registries {
        &self.registries
    }

    pub fn keep_alive(&self) -> &KeepAlive {
        &self.keep_alive
    }

    pub fn enqueue_post(&self, event: PostEvent) {
        self.posts.push(event);
    }

    pub fn enqueue_return(&self, event: ReturnEvent) {
        self.returns.push(event);
    }

    pub fn enqueue_call(&self, event: CallEvent) {
        self.calls.push(event);
    }

    /// Events waiting in (post, return, call).
    pub fn pending(&self) -> (usize, usize, usize) {
        (self.posts.len(), self.returns.len(), self.calls.len())
    }

    pub fn dispatch_posts(&self) -> DispatchStats {
        let mut stats = DispatchStats::default();
        for event in self.posts.take() {
            let Some(callback) = self.registries.post_target(event.key) else {
                debug!(key = %event.key, "Dropping post for removed subscription");
                stats.dropped += 1;
                continue;
            };
            match Message::decode(event.msg) {
                Ok(msg) => {
                    callback(msg, event.delivery, &event.sender);
                    stats.delivered += 1;
                }
                Err(err) => {
                    warn!(key = %event.key, error = %err, "Dropping undecodable post");
                    stats.dropped += 1;
                }
            }
        }
        stats
    }

    pub fn dispatch_returns(&self) -> DispatchStats {
        let mut stats = DispatchStats::default();
        for event in self.returns.take() {
            let Some(callback) = self.registries.take_caller(event.caller_id) else {
                debug!(caller_id = %event.caller_id, "Dropping return for removed caller");
                stats.dropped += 1;
                continue;
            };
            match Message::decode(event.msg) {
                Ok(msg) => {
                    callback(
                        event.status,
                        ReturnValue {
                            ret_code: event.ret_code,
                            msg,
                        },
                    );
                    stats.delivered += 1;
                }
                Err(err) => {
                    warn!(caller_id = %event.caller_id, error = %err, "Dropping undecodable return");
                    stats.dropped += 1;
                }
            }
        }
        stats
    }

    pub fn dispatch_calls(&self) -> DispatchStats {
        let mut stats = DispatchStats::default();
        for event in self.calls.take() {
            let Some(callback) = self.registries.call_target(&event.method) else {
                debug!(method = %event.method, "Dropping call for removed method");
                stats.dropped += 1;
                continue;
            };
            match Message::decode(event.msg) {
                Ok(msg) => {
                    callback(msg, ReplyProxy::new(event.reply), &event.sender);
                    stats.delivered += 1;
                }
                Err(err) => {
                    warn!(method = %event.method, error = %err, "Dropping undecodable call");
                    stats.dropped += 1;
                }
            }
        }
        stats
    }

    /// Drain each channel once.
    pub fn dispatch_pending(&self) -> DispatchStats {
        self.dispatch_posts()
            .merge(self.dispatch_returns())
            .merge(self.dispatch_calls())
    }

    /// Host loop: dispatch each channel when its wake signal fires.
    ///
    /// Returns once no keep-alive reference is held. Events still pending at
    /// that point stay queued until the next drain.
    pub async fn run(&self) {
        info!(refs = self.keep_alive.count(), "Host loop started");
        while self.keep_alive.is_held() {
            tokio::select! {
                _ = self.posts.woken() => {
                    self.dispatch_posts();
                }
                _ = self.returns.woken() => {
                    self.dispatch_returns();
                }
                _ = self.calls.woken() => {
                    self.dispatch_calls();
                }
                _ = self.keep_alive.changed.notified() => {}
            }
        }
        info!("Host loop finished");
    }

    /// Drive [`run`](Self::run) on the calling thread.
    pub fn run_blocking(&self) -> std::io::Result<()> {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        rt.block_on(self.run());
        Ok(())
    }
}
