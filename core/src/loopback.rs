// In-process agent: a tiny bus whose deliveries run on worker threads
//
// Stands in for a real bus connection in the demo and the integration
// tests. Messages for one topic (and calls for one method) are always
// delivered by the same worker, so per-topic order is preserved.
use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use dashmap::DashMap;
use tether_caps::Caps;
use tracing::{debug, warn};

use crate::agent::{
    status, Agent, AgentConfig, ConnectionContext, ConnectionType, DeliveryClass, MessageHandler,
    MethodHandler, Reply, Response, ReturnHandler, Status,
};

type Job = Box<dyn FnOnce() + Send>;

struct Subscriber {
    agent: u64,
    handler: Arc<MessageHandler>,
}

struct Method {
    agent: u64,
    handler: Arc<MethodHandler>,
}

struct BusInner {
    subscribers: DashMap<String, Vec<Subscriber>>,
    // (agent name, method name)
    methods: DashMap<(String, String), Method>,
    workers: Vec<Sender<Job>>,
    timer: Sender<(Instant, Arc<PendingCall>)>,
    agent_seq: AtomicU64,
}

impl BusInner {
    fn submit(&self, route: &str, job: Job) {
        let mut hasher = DefaultHasher::new();
        route.hash(&mut hasher);
        let idx = (hasher.finish() % self.workers.len() as u64) as usize;
        if self.workers[idx].send(job).is_err() {
            warn!(route, "Loopback worker gone, delivery lost");
        }
    }
}

/// Shared in-process bus. Agents created from the same bus see each other.
#[derive(Clone)]
pub struct LoopbackBus {
    inner: Arc<BusInner>,
}

impl LoopbackBus {
    /// Start a bus with `workers` delivery threads (at least one).
    pub fn new(workers: usize) -> std::io::Result<Self> {
        let mut senders = Vec::new();
        for i in 0..workers.max(1) {
            let (tx, rx) = channel::unbounded::<Job>();
            thread::Builder::new()
                .name(format!("tether-loopback-{i}"))
                .spawn(move || {
                    for job in rx {
                        job();
                    }
                })?;
            senders.push(tx);
        }
        let (timer_tx, timer_rx) = channel::unbounded();
        thread::Builder::new()
            .name("tether-loopback-timer".into())
            .spawn(move || run_timer(timer_rx))?;

        Ok(Self {
            inner: Arc::new(BusInner {
                subscribers: DashMap::new(),
                methods: DashMap::new(),
                workers: senders,
                timer: timer_tx,
                agent_seq: AtomicU64::new(0),
            }),
        })
    }

    /// New agent on this bus; `name` is the target other agents call it by.
    pub fn agent(&self, name: impl Into<String>) -> Arc<LoopbackAgent> {
        Arc::new(LoopbackAgent {
            bus: Arc::clone(&self.inner),
            id: self.inner.agent_seq.fetch_add(1, Ordering::Relaxed) + 1,
            name: name.into(),
            started: AtomicBool::new(false),
            config: Mutex::new(None),
        })
    }
}

// Fires the timeout of calls whose deadline passed before they were answered.
fn run_timer(rx: Receiver<(Instant, Arc<PendingCall>)>) {
    let mut deadlines: BTreeMap<(Instant, u64), Arc<PendingCall>> = BTreeMap::new();
    let mut seq = 0u64;
    loop {
        let next = match deadlines.keys().next() {
            Some((at, _)) => rx.recv_deadline(*at),
            None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };
        match next {
            Ok((at, call)) => {
                seq += 1;
                deadlines.insert((at, seq), call);
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
        let now = Instant::now();
        while let Some(entry) = deadlines.first_entry() {
            if entry.key().0 > now {
                break;
            }
            entry.remove().complete(status::TIMEOUT, Response::default());
        }
    }
}

/// Outstanding call whose reply handler must fire exactly once.
struct PendingCall {
    on_reply: Mutex<Option<ReturnHandler>>,
}

impl PendingCall {
    fn complete(&self, status: Status, resp: Response) {
        let handler = self
            .on_reply
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handler) = handler {
            handler(status, resp);
        }
    }
}

struct LoopbackReply {
    call: Arc<PendingCall>,
    code: Mutex<i32>,
    data: Mutex<Option<Arc<Caps>>>,
}

impl Reply for LoopbackReply {
    fn write_code(&self, code: i32) {
        *self.code.lock().unwrap_or_else(PoisonError::into_inner) = code;
    }

    fn write_data(&self, data: Option<Arc<Caps>>) {
        *self.data.lock().unwrap_or_else(PoisonError::into_inner) = data;
    }

    fn end(&self, code: i32, data: Option<Arc<Caps>>) {
        let data = data.or_else(|| {
            self.data
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take()
        });
        self.call.complete(
            status::SUCCESS,
            Response {
                ret_code: code,
                data,
            },
        );
    }
}

impl Drop for LoopbackReply {
    // Dropped unanswered: the callee vanished before it could reply.
    fn drop(&mut self) {
        self.call.complete(status::CLOSED, Response::default());
    }
}

struct LocalContext<'a> {
    name: &'a str,
}

impl ConnectionContext for LocalContext<'_> {
    fn connection_type(&self) -> ConnectionType {
        ConnectionType::Local
    }

    fn pid(&self) -> u32 {
        std::process::id()
    }

    fn ipaddr(&self) -> String {
        String::new()
    }

    fn port(&self) -> u16 {
        0
    }

    fn name(&self) -> String {
        self.name.to_string()
    }
}

/// [`Agent`] backed by a [`LoopbackBus`].
pub struct LoopbackAgent {
    bus: Arc<BusInner>,
    id: u64,
    name: String,
    started: AtomicBool,
    config: Mutex<Option<AgentConfig>>,
}

impl LoopbackAgent {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Last configuration received from the handle.
    pub fn config(&self) -> Option<AgentConfig> {
        self.config
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }
}

impl Agent for LoopbackAgent {
    fn configure(&self, config: &AgentConfig) {
        *self.config.lock().unwrap_or_else(PoisonError::into_inner) = Some(config.clone());
    }

    fn start(&self) {
        self.started.store(true, Ordering::Release);
        debug!(agent = %self.name, "Loopback agent started");
    }

    fn subscribe(&self, topic: &str, on_message: MessageHandler) {
        self.bus
            .subscribers
            .entry(topic.to_string())
            .or_default()
            .push(Subscriber {
                agent: self.id,
                handler: Arc::new(on_message),
            });
    }

    fn unsubscribe(&self, topic: &str) {
        if let Some(mut subs) = self.bus.subscribers.get_mut(topic) {
            subs.retain(|s| s.agent != self.id);
        }
    }

    fn post(&self, topic: &str, msg: Option<Arc<Caps>>, delivery: DeliveryClass) -> Status {
        if !self.is_started() {
            return status::NOT_CONNECTED;
        }
        let handlers: Vec<Arc<MessageHandler>> = self
            .bus
            .subscribers
            .get(topic)
            .map(|subs| subs.iter().map(|s| Arc::clone(&s.handler)).collect())
            .unwrap_or_default();
        for handler in handlers {
            let topic_owned = topic.to_string();
            let sender = self.name.clone();
            let msg = msg.clone();
            self.bus.submit(
                topic,
                Box::new(move || {
                    handler(
                        &topic_owned,
                        msg,
                        delivery,
                        &LocalContext { name: &sender },
                    )
                }),
            );
        }
        status::SUCCESS
    }

    fn call(
        &self,
        method: &str,
        msg: Option<Arc<Caps>>,
        target: &str,
        on_reply: ReturnHandler,
        timeout_ms: u32,
    ) -> Status {
        if !self.is_started() {
            return status::NOT_CONNECTED;
        }
        let key = (target.to_string(), method.to_string());
        let Some(handler) = self.bus.methods.get(&key).map(|m| Arc::clone(&m.handler)) else {
            return status::NOT_FOUND;
        };
        let call = Arc::new(PendingCall {
            on_reply: Mutex::new(Some(on_reply)),
        });
        if timeout_ms > 0 {
            let deadline = Instant::now() + Duration::from_millis(u64::from(timeout_ms));
            let _ = self.bus.timer.send((deadline, Arc::clone(&call)));
        }
        let method_owned = method.to_string();
        let sender = self.name.clone();
        self.bus.submit(
            method,
            Box::new(move || {
                let reply: Arc<dyn Reply> = Arc::new(LoopbackReply {
                    call,
                    code: Mutex::new(0),
                    data: Mutex::new(None),
                });
                handler(
                    &method_owned,
                    msg,
                    reply,
                    &LocalContext { name: &sender },
                )
            }),
        );
        status::SUCCESS
    }

    fn declare_method(&self, name: &str, on_call: MethodHandler) {
        self.bus.methods.insert(
            (self.name.clone(), name.to_string()),
            Method {
                agent: self.id,
                handler: Arc::new(on_call),
            },
        );
    }

    fn remove_method(&self, name: &str) {
        self.bus
            .methods
            .remove_if(&(self.name.clone(), name.to_string()), |_, m| {
                m.agent == self.id
            });
    }

    fn close(&self) {
        self.started.store(false, Ordering::Release);
        for mut subs in self.bus.subscribers.iter_mut() {
            subs.retain(|s| s.agent != self.id);
        }
        self.bus.methods.retain(|_, m| m.agent != self.id);
        debug!(agent = %self.name, "Loopback agent closed");
    }
}
