// Host-visible session multiplexed through the shared bridge
use std::sync::{Arc, Mutex, PoisonError};

use tether_caps::{Caps, Payload};
use tracing::{debug, info};

use crate::agent::{status, Agent, ConnectionContext, DeliveryClass, Reply, Response, Status};
use crate::bridge::{Bridge, CallEvent, PostEvent, ReturnEvent};
use crate::options::HandleOptions;
use crate::registry::{CallCallback, HandleId, PostCallback, ReturnCallback, SubscriptionKey};
use crate::sender::SenderIdentity;
use crate::{Result, TetherError};

#[derive(Debug, Default)]
struct State {
    started: bool,
    // holds a keep-alive reference on the bridge
    referenced: bool,
    closed: bool,
}

/// One agent connection as seen by host code.
///
/// Registrations made through a handle are owned by its [`HandleId`] and are
/// removed together on [`close`](Self::close), which also runs on drop.
pub struct Handle {
    id: HandleId,
    uri: String,
    options: HandleOptions,
    agent: Arc<dyn Agent>,
    bridge: Arc<Bridge>,
    state: Mutex<State>,
}

impl Handle {
    /// Create a handle on `bridge`, usually [`Bridge::global`].
    pub fn new(
        uri: impl Into<String>,
        options: HandleOptions,
        agent: Arc<dyn Agent>,
        bridge: Arc<Bridge>,
    ) -> Result<Self> {
        let uri = uri.into();
        if uri.is_empty() {
            return Err(TetherError::InvalidArgument("uri must not be empty".into()));
        }
        let id = bridge.registries().mint_handle_id();
        debug!(handle = %id, uri = %uri, daemon = options.daemon, "Handle created");
        Ok(Self {
            id,
            uri,
            options,
            agent,
            bridge,
            state: Mutex::new(State::default()),
        })
    }

    pub fn id(&self) -> HandleId {
        self.id
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn options(&self) -> &HandleOptions {
        &self.options
    }

    pub fn is_started(&self) -> bool {
        self.state().started
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.state().closed {
            return Err(TetherError::Closed);
        }
        Ok(())
    }

    /// Configure and start the agent. A closed handle may be started again.
    pub fn start(&self) -> Result<()> {
        {
            let mut state = self.state();
            if state.started {
                debug!(handle = %self.id, "Handle already started");
                return Ok(());
            }
            state.closed = false;
            state.started = true;
            if !self.options.daemon && !state.referenced {
                self.bridge.keep_alive().acquire();
                state.referenced = true;
            }
        }
        info!(handle = %self.id, uri = %self.uri, "Starting agent");
        self.agent.configure(&self.options.agent_config(&self.uri));
        self.agent.start();
        Ok(())
    }

    /// Register `wrapped` for messages on `topic`.
    ///
    /// `raw` is the callback as the host passed it; it is kept alive with the
    /// subscription and identifies it for [`unsubscribe`](Self::unsubscribe).
    pub fn subscribe(
        &self,
        topic: &str,
        wrapped: PostCallback,
        raw: Option<PostCallback>,
    ) -> Result<SubscriptionKey> {
        self.ensure_open()?;
        require_name("topic", topic)?;
        let key = self
            .bridge
            .registries()
            .subscribe(topic, self.id, wrapped, raw);
        let bridge = Arc::clone(&self.bridge);
        self.agent.subscribe(
            topic,
            Box::new(
                move |_topic: &str,
                      msg: Option<Arc<Caps>>,
                      delivery: DeliveryClass,
                      ctx: &dyn ConnectionContext| {
                    bridge.enqueue_post(PostEvent {
                        key,
                        msg,
                        delivery,
                        sender: SenderIdentity::capture(ctx),
                    });
                },
            ),
        );
        Ok(key)
    }

    /// Remove this handle's subscriptions to `topic`, or only the one
    /// registered with `raw`. Returns how many were removed.
    pub fn unsubscribe(&self, topic: &str, raw: Option<&PostCallback>) -> Result<usize> {
        require_name("topic", topic)?;
        let (removed, remaining) = self.bridge.registries().unsubscribe(self.id, topic, raw);
        if removed > 0 && !remaining {
            self.agent.unsubscribe(topic);
        }
        debug!(handle = %self.id, topic, removed, "Unsubscribed");
        Ok(removed)
    }

    /// Publish `payload` on `topic`. Transport failures come back as a
    /// non-zero status, not as an error.
    pub fn post(
        &self,
        topic: &str,
        payload: Option<Payload>,
        delivery: DeliveryClass,
    ) -> Result<Status> {
        require_name("topic", topic)?;
        let msg = payload.map(Payload::into_caps).transpose()?;
        let status = self.agent.post(topic, msg, delivery);
        if status != status::SUCCESS {
            debug!(handle = %self.id, topic, status, "Post rejected");
        }
        Ok(status)
    }

    /// Invoke `method` on `target`; `on_reply` runs once with the result.
    ///
    /// The callback is only registered when the agent accepts the call, so a
    /// rejected call never produces a return event.
    pub fn call(
        &self,
        method: &str,
        payload: Option<Payload>,
        target: &str,
        on_reply: ReturnCallback,
        timeout_ms: u32,
    ) -> Result<Status> {
        self.ensure_open()?;
        require_name("method", method)?;
        let msg = payload.map(Payload::into_caps).transpose()?;
        let registries = self.bridge.registries();
        let caller_id = registries.next_caller_id();
        let bridge = Arc::clone(&self.bridge);
        let status = self.agent.call(
            method,
            msg,
            target,
            Box::new(move |status: Status, resp: Response| {
                bridge.enqueue_return(ReturnEvent {
                    caller_id,
                    status,
                    ret_code: resp.ret_code,
                    msg: resp.data,
                });
            }),
            timeout_ms,
        );
        // A reply racing ahead of this insert waits in the queue until the
        // host thread, which is this thread, drains it.
        if status == status::SUCCESS {
            registries.add_caller(caller_id, self.id, on_reply);
        } else {
            debug!(handle = %self.id, method, target, status, "Call rejected");
        }
        Ok(status)
    }

    /// Serve `name`. A later declaration of the same name, from any handle,
    /// replaces this one.
    pub fn declare_method(&self, name: &str, on_call: CallCallback) -> Result<()> {
        self.ensure_open()?;
        require_name("method", name)?;
        if let Some(prev) = self
            .bridge
            .registries()
            .declare_method(name, self.id, on_call)
        {
            debug!(handle = %self.id, previous = %prev, method = name, "Method redeclared");
        }
        let bridge = Arc::clone(&self.bridge);
        self.agent.declare_method(
            name,
            Box::new(
                move |method: &str,
                      msg: Option<Arc<Caps>>,
                      reply: Arc<dyn Reply>,
                      ctx: &dyn ConnectionContext| {
                    bridge.enqueue_call(CallEvent {
                        method: method.to_string(),
                        msg,
                        reply,
                        sender: SenderIdentity::capture(ctx),
                    });
                },
            ),
        );
        Ok(())
    }

    /// Stop serving `name` if this handle holds the current declaration.
    pub fn remove_method(&self, name: &str) -> bool {
        let removed = self.bridge.registries().remove_method(self.id, name);
        if removed {
            self.agent.remove_method(name);
        }
        removed
    }

    /// Close the agent and drop every registration of this handle.
    /// Idempotent.
    pub fn close(&self) {
        let release = {
            let mut state = self.state();
            if state.closed {
                return;
            }
            state.closed = true;
            state.started = false;
            std::mem::take(&mut state.referenced)
        };
        self.agent.close();
        let removed = self.bridge.registries().remove_owner(self.id);
        if release {
            self.bridge.keep_alive().release();
        }
        let (subs, callers, callees) = self.bridge.registries().counts();
        info!(
            handle = %self.id,
            removed = removed.total(),
            remaining_subscriptions = subs,
            remaining_callers = callers,
            remaining_callees = callees,
            "Handle closed"
        );
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        self.close();
    }
}

fn require_name(what: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(TetherError::InvalidArgument(format!("{what} must not be empty")));
    }
    Ok(())
}
