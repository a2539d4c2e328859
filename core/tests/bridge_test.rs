use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use tether_core::agent::{
    status, Agent, AgentConfig, ConnectionContext, ConnectionType, DeliveryClass, MessageHandler,
    MethodHandler, Reply, Response, ReturnHandler, Status,
};
use tether_core::bridge::ReturnEvent;
use tether_core::caps::{decode_opt, encode, Caps};
use tether_core::{
    Bridge, CallerId, Handle, HandleOptions, HostValue, Message, Payload, ReplyProxy, Result,
    ReturnValue, SenderIdentity, SubscriptionKey,
};

// Agent double that keeps every handler so tests can fire them from any thread.
#[derive(Default)]
struct RecordingAgent {
    subscribers: Mutex<HashMap<String, Vec<Arc<MessageHandler>>>>,
    methods: Mutex<HashMap<String, Arc<MethodHandler>>>,
    replies: Mutex<Vec<ReturnHandler>>,
    calls: Mutex<Vec<(String, String, u32)>>,
    posted: Mutex<Vec<(String, Option<Arc<Caps>>)>>,
    closes: AtomicUsize,
}

impl RecordingAgent {
    fn subscriber(&self, topic: &str) -> Arc<MessageHandler> {
        Arc::clone(&self.subscribers.lock().unwrap()[topic][0])
    }

    // What the bus does for a post: every registered handler sees it.
    fn publish(&self, topic: &str, msg: Option<Arc<Caps>>) {
        let handlers = self.subscribers.lock().unwrap()[topic].clone();
        for handler in handlers {
            handler(topic, msg.clone(), DeliveryClass::INSTANT, &RemotePeer);
        }
    }

    fn method(&self, name: &str) -> Arc<MethodHandler> {
        Arc::clone(&self.methods.lock().unwrap()[name])
    }

    fn take_reply(&self) -> ReturnHandler {
        self.replies.lock().unwrap().remove(0)
    }
}

impl Agent for RecordingAgent {
    fn configure(&self, _config: &AgentConfig) {}

    fn start(&self) {}

    fn subscribe(&self, topic: &str, on_message: MessageHandler) {
        self.subscribers
            .lock()
            .unwrap()
            .entry(topic.to_string())
            .or_default()
            .push(Arc::new(on_message));
    }

    fn unsubscribe(&self, topic: &str) {
        self.subscribers.lock().unwrap().remove(topic);
    }

    fn post(&self, topic: &str, msg: Option<Arc<Caps>>, _delivery: DeliveryClass) -> Status {
        self.posted.lock().unwrap().push((topic.to_string(), msg));
        status::SUCCESS
    }

    fn call(
        &self,
        method: &str,
        _msg: Option<Arc<Caps>>,
        target: &str,
        on_reply: ReturnHandler,
        timeout_ms: u32,
    ) -> Status {
        self.calls
            .lock()
            .unwrap()
            .push((method.to_string(), target.to_string(), timeout_ms));
        self.replies.lock().unwrap().push(on_reply);
        status::SUCCESS
    }

    fn declare_method(&self, name: &str, on_call: MethodHandler) {
        self.methods
            .lock()
            .unwrap()
            .insert(name.to_string(), Arc::new(on_call));
    }

    fn remove_method(&self, name: &str) {
        self.methods.lock().unwrap().remove(name);
    }

    fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

struct RemotePeer;

impl ConnectionContext for RemotePeer {
    fn connection_type(&self) -> ConnectionType {
        ConnectionType::Remote
    }
    fn pid(&self) -> u32 {
        0
    }
    fn ipaddr(&self) -> String {
        "192.168.1.20".into()
    }
    fn port(&self) -> u16 {
        30001
    }
    fn name(&self) -> String {
        "sensor".into()
    }
}

#[derive(Default)]
struct RecordingReply {
    ended: Mutex<Option<(i32, Option<Arc<Caps>>)>>,
}

impl Reply for RecordingReply {
    fn write_code(&self, _code: i32) {}
    fn write_data(&self, _data: Option<Arc<Caps>>) {}
    fn end(&self, code: i32, data: Option<Arc<Caps>>) {
        *self.ended.lock().unwrap() = Some((code, data));
    }
}

fn open(bridge: &Arc<Bridge>) -> (Arc<RecordingAgent>, Handle) {
    let agent = Arc::new(RecordingAgent::default());
    let handle = Handle::new(
        "unix:/tmp/tether.sock",
        HandleOptions::default(),
        Arc::clone(&agent) as Arc<dyn Agent>,
        Arc::clone(bridge),
    )
    .unwrap();
    handle.start().unwrap();
    (agent, handle)
}

fn caps(values: &[HostValue]) -> Option<Arc<Caps>> {
    Some(Arc::new(encode(values).unwrap()))
}

type Seen<T> = Arc<Mutex<Vec<T>>>;

#[test]
fn post_is_delivered_with_decoded_payload_and_sender() -> Result<()> {
    let bridge = Bridge::new();
    let (agent, handle) = open(&bridge);

    let seen: Seen<(Vec<HostValue>, DeliveryClass, SenderIdentity)> = Arc::default();
    let sink = Arc::clone(&seen);
    let key = handle.subscribe(
        "topic.A",
        Arc::new(
            move |msg: Message, delivery: DeliveryClass, sender: &SenderIdentity| {
                sink.lock()
                    .unwrap()
                    .push((msg.into_values(), delivery, sender.clone()));
            },
        ),
        None,
    )?;
    assert_eq!(key, SubscriptionKey(1));

    let handler = agent.subscriber("topic.A");
    thread::spawn(move || {
        handler(
            "topic.A",
            caps(&[HostValue::Number(1.0), HostValue::from("x")]),
            DeliveryClass::INSTANT,
            &RemotePeer,
        )
    })
    .join()
    .unwrap();

    assert_eq!(bridge.pending(), (1, 0, 0));
    assert_eq!(bridge.dispatch_pending().delivered, 1);
    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(
        seen[0].0,
        vec![HostValue::Number(1.0), HostValue::from("x")]
    );
    assert_eq!(seen[0].1, DeliveryClass::INSTANT);
    assert_eq!(
        seen[0].2,
        SenderIdentity::Remote {
            ipaddr: "192.168.1.20".into(),
            port: 30001,
            name: "sensor".into(),
        }
    );
    Ok(())
}

#[test]
fn received_message_is_forwarded_without_reencoding() -> Result<()> {
    let bridge = Bridge::new();
    let (agent, handle) = open(&bridge);

    let inbox: Seen<Message> = Arc::default();
    let sink = Arc::clone(&inbox);
    handle.subscribe(
        "sensor.raw",
        Arc::new(move |msg: Message, _: DeliveryClass, _: &SenderIdentity| {
            sink.lock().unwrap().push(msg)
        }),
        None,
    )?;

    let original = caps(&[HostValue::Int(5), HostValue::Buffer(vec![1, 2, 3])]).unwrap();
    agent.publish("sensor.raw", Some(Arc::clone(&original)));
    bridge.dispatch_pending();

    let msg = inbox.lock().unwrap().remove(0);
    assert!(Arc::ptr_eq(msg.encoded().unwrap(), &original));
    let st = handle.post("sensor.forwarded", Some(msg.to_payload()), DeliveryClass::INSTANT)?;
    assert_eq!(st, status::SUCCESS);

    let posted = agent.posted.lock().unwrap();
    assert_eq!(posted.len(), 1);
    assert_eq!(posted[0].0, "sensor.forwarded");
    assert!(Arc::ptr_eq(posted[0].1.as_ref().unwrap(), &original));
    Ok(())
}

#[test]
fn concurrent_producers_keep_per_subscription_order() -> Result<()> {
    const TOPICS: usize = 4;
    const PER_TOPIC: i32 = 500;

    let bridge = Bridge::new();
    let (agent, handle) = open(&bridge);

    let seen: Arc<Mutex<HashMap<usize, Vec<i32>>>> = Arc::default();
    for t in 0..TOPICS {
        let sink = Arc::clone(&seen);
        handle.subscribe(
            &format!("topic.{t}"),
            Arc::new(move |msg: Message, _: DeliveryClass, _: &SenderIdentity| {
                if let Some(HostValue::Int(n)) = msg.values().first() {
                    sink.lock().unwrap().entry(t).or_default().push(*n);
                }
            }),
            None,
        )?;
    }

    let producers: Vec<_> = (0..TOPICS)
        .map(|t| {
            let handler = agent.subscriber(&format!("topic.{t}"));
            thread::spawn(move || {
                for i in 0..PER_TOPIC {
                    handler(
                        "ignored",
                        caps(&[HostValue::Int(i)]),
                        DeliveryClass::INSTANT,
                        &RemotePeer,
                    );
                }
            })
        })
        .collect();

    // Drain while producers are still pushing.
    let total = TOPICS * PER_TOPIC as usize;
    let mut delivered = 0;
    while delivered < total {
        delivered += bridge.dispatch_pending().delivered;
        thread::yield_now();
    }
    for p in producers {
        p.join().unwrap();
    }

    let seen = seen.lock().unwrap();
    let expected: Vec<i32> = (0..PER_TOPIC).collect();
    for t in 0..TOPICS {
        assert_eq!(seen[&t], expected, "topic.{t} out of order");
    }
    Ok(())
}

#[test]
fn accepted_call_returns_exactly_once() -> Result<()> {
    let bridge = Bridge::new();
    let (agent, handle) = open(&bridge);

    let seen: Seen<(Status, i32, Vec<HostValue>)> = Arc::default();
    let sink = Arc::clone(&seen);
    let st = handle.call(
        "method.B",
        Some(Payload::Raw(vec![HostValue::Number(42.0)])),
        "target1",
        Box::new(move |status: Status, ret: ReturnValue| {
            sink.lock()
                .unwrap()
                .push((status, ret.ret_code, ret.msg.into_values()));
        }),
        5000,
    )?;
    assert_eq!(st, status::SUCCESS);
    assert_eq!(
        agent.calls.lock().unwrap()[0],
        ("method.B".to_string(), "target1".to_string(), 5000)
    );

    let on_reply = agent.take_reply();
    thread::spawn(move || {
        on_reply(
            status::SUCCESS,
            Response {
                ret_code: 7,
                data: caps(&[HostValue::Int(1)]),
            },
        )
    })
    .join()
    .unwrap();
    assert_eq!(bridge.dispatch_pending().delivered, 1);

    // a second return for the same caller has nobody left to reach
    bridge.enqueue_return(ReturnEvent {
        caller_id: CallerId(1),
        status: status::SUCCESS,
        ret_code: 0,
        msg: None,
    });
    assert_eq!(bridge.dispatch_pending().dropped, 1);

    assert_eq!(
        *seen.lock().unwrap(),
        vec![(status::SUCCESS, 7, vec![HostValue::Int(1)])]
    );
    Ok(())
}

#[test]
fn incoming_call_is_answered_through_proxy() -> Result<()> {
    let bridge = Bridge::new();
    let (agent, handle) = open(&bridge);

    let callers: Seen<String> = Arc::default();
    let sink = Arc::clone(&callers);
    handle.declare_method(
        "math.double",
        Arc::new(move |msg: Message, reply: ReplyProxy, sender: &SenderIdentity| {
            sink.lock().unwrap().push(sender.name().to_string());
            let doubled: Vec<HostValue> = msg
                .values()
                .iter()
                .map(|v| match v {
                    HostValue::Number(n) => HostValue::Number(n * 2.0),
                    other => other.clone(),
                })
                .collect();
            reply.end(0, Some(Payload::Raw(doubled))).unwrap();
            assert!(reply.end(0, None).is_err());
        }),
    )?;

    let reply = Arc::new(RecordingReply::default());
    let method = agent.method("math.double");
    let agent_reply: Arc<dyn Reply> = Arc::clone(&reply) as Arc<dyn Reply>;
    thread::spawn(move || {
        method(
            "math.double",
            caps(&[HostValue::Number(21.0)]),
            agent_reply,
            &RemotePeer,
        )
    })
    .join()
    .unwrap();

    assert_eq!(bridge.dispatch_pending().delivered, 1);
    let ended = reply.ended.lock().unwrap().take().unwrap();
    assert_eq!(ended.0, 0);
    assert_eq!(
        decode_opt(ended.1.as_deref()).unwrap(),
        vec![HostValue::Number(42.0)]
    );
    assert_eq!(*callers.lock().unwrap(), vec!["sensor".to_string()]);
    Ok(())
}

#[test]
fn close_is_idempotent_and_leaves_other_handles_alone() -> Result<()> {
    let bridge = Bridge::new();
    let (agent_a, a) = open(&bridge);
    let (agent_b, b) = open(&bridge);
    assert_eq!(bridge.keep_alive().count(), 2);

    let hits: Seen<&'static str> = Arc::default();
    for (handle, name) in [(&a, "a"), (&b, "b")] {
        let sink = Arc::clone(&hits);
        handle.subscribe(
            "shared",
            Arc::new(move |_: Message, _: DeliveryClass, _: &SenderIdentity| {
                sink.lock().unwrap().push(name)
            }),
            None,
        )?;
    }
    let to_a = agent_a.subscriber("shared");
    let to_b = agent_b.subscriber("shared");
    to_a("shared", None, DeliveryClass::INSTANT, &RemotePeer);

    a.close();
    a.close();
    assert_eq!(agent_a.closes.load(Ordering::SeqCst), 1);
    assert_eq!(bridge.keep_alive().count(), 1);

    to_b("shared", None, DeliveryClass::INSTANT, &RemotePeer);
    let stats = bridge.dispatch_pending();
    assert_eq!(stats.delivered, 1);
    assert_eq!(stats.dropped, 1);
    assert_eq!(*hits.lock().unwrap(), vec!["b"]);
    assert_eq!(bridge.registries().counts(), (1, 0, 0));

    drop(b);
    assert_eq!(agent_b.closes.load(Ordering::SeqCst), 1);
    assert_eq!(bridge.registries().counts(), (0, 0, 0));
    assert!(!bridge.keep_alive().is_held());
    Ok(())
}

#[test]
fn later_declaration_wins() -> Result<()> {
    let bridge = Bridge::new();
    let (agent, handle) = open(&bridge);

    let hits: Seen<&'static str> = Arc::default();
    for name in ["first", "second"] {
        let sink = Arc::clone(&hits);
        handle.declare_method(
            "svc",
            Arc::new(move |_: Message, reply: ReplyProxy, _: &SenderIdentity| {
                sink.lock().unwrap().push(name);
                reply.end(0, None).unwrap();
            }),
        )?;
    }
    assert_eq!(bridge.registries().counts(), (0, 0, 1));

    let method = agent.method("svc");
    let reply: Arc<dyn Reply> = Arc::new(RecordingReply::default());
    method("svc", None, reply, &RemotePeer);
    bridge.dispatch_pending();
    assert_eq!(*hits.lock().unwrap(), vec!["second"]);
    Ok(())
}

#[test]
fn unsubscribe_by_callback_keeps_the_others() -> Result<()> {
    let bridge = Bridge::new();
    let (agent, handle) = open(&bridge);

    let hits = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&hits);
    let keep: tether_core::PostCallback =
        Arc::new(move |_: Message, _: DeliveryClass, _: &SenderIdentity| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
    let gone: tether_core::PostCallback =
        Arc::new(|_: Message, _: DeliveryClass, _: &SenderIdentity| {
            panic!("unsubscribed callback invoked");
        });
    handle.subscribe("t", Arc::clone(&keep), Some(Arc::clone(&keep)))?;
    handle.subscribe("t", Arc::clone(&gone), Some(Arc::clone(&gone)))?;

    assert_eq!(handle.unsubscribe("t", Some(&gone))?, 1);
    assert!(agent.subscribers.lock().unwrap().contains_key("t"));

    agent.publish("t", None);
    let stats = bridge.dispatch_pending();
    assert_eq!((stats.delivered, stats.dropped), (1, 1));
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    assert_eq!(handle.unsubscribe("t", None)?, 1);
    assert!(!agent.subscribers.lock().unwrap().contains_key("t"));
    Ok(())
}

#[tokio::test]
async fn daemon_handles_do_not_hold_the_loop() {
    let bridge = Bridge::new();
    let agent: Arc<dyn Agent> = Arc::new(RecordingAgent::default());
    let daemon = Handle::new(
        "unix:/tmp/tether.sock",
        HandleOptions {
            daemon: true,
            ..HandleOptions::default()
        },
        agent,
        Arc::clone(&bridge),
    )
    .unwrap();
    daemon.start().unwrap();

    tokio::time::timeout(Duration::from_secs(1), bridge.run())
        .await
        .expect("loop should not wait on daemon handles");
}
