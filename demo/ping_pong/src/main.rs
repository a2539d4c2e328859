// Ping/pong over the bridge
//
// server: subscribes to `demo.ping` and serves `math.add`
// client: posts pings, then calls `math.add` once every ping arrived
// The loop exits when the return callback closes both handles.
mod config;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tether_core::loopback::LoopbackBus;
use tether_core::{
    status, telemetry, Bridge, DeliveryClass, Handle, HostValue, Message, Payload, ReplyProxy,
    ReturnValue, SenderIdentity, Status,
};
use tracing::{info, warn};

use crate::config::DemoConfig;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    telemetry::init_tracing();

    let cfg = DemoConfig::from_env();
    info!(uri = %cfg.uri, rounds = cfg.rounds, workers = cfg.workers, "Starting ping/pong demo");

    let bridge = Bridge::global();
    let bus = LoopbackBus::new(cfg.workers)?;

    let server = Arc::new(Handle::new(
        cfg.uri.clone(),
        cfg.options.clone(),
        bus.agent("server"),
        Arc::clone(&bridge),
    )?);
    let client = Arc::new(Handle::new(
        cfg.uri.clone(),
        cfg.options.clone(),
        bus.agent("client"),
        Arc::clone(&bridge),
    )?);
    server.start()?;
    client.start()?;

    server.declare_method(
        "math.add",
        Arc::new(|msg: Message, reply: ReplyProxy, sender: &SenderIdentity| {
            let sum: f64 = msg
                .values()
                .iter()
                .map(|v| match v {
                    HostValue::Number(n) => *n,
                    HostValue::Int(n) => f64::from(*n),
                    _ => 0.0,
                })
                .sum();
            info!(%sender, sum, "math.add called");
            if let Err(err) = reply.end(0, Some(Payload::Raw(vec![HostValue::Number(sum)]))) {
                warn!(error = %err, "Failed to answer math.add");
            }
        }),
    )?;

    let seen = Arc::new(AtomicU32::new(0));
    let rounds = cfg.rounds;
    let timeout_ms = cfg.call_timeout_ms;
    let (srv, cli) = (Arc::clone(&server), Arc::clone(&client));
    server.subscribe(
        "demo.ping",
        Arc::new(
            move |msg: Message, delivery: DeliveryClass, sender: &SenderIdentity| {
                let n = seen.fetch_add(1, Ordering::Relaxed) + 1;
                info!(%sender, %delivery, payload = ?msg.values(), n, "ping");
                if n < rounds {
                    return;
                }
                let (srv_done, done) = (Arc::clone(&srv), Arc::clone(&cli));
                let on_reply = Box::new(move |status: Status, ret: ReturnValue| {
                    info!(status, ret_code = ret.ret_code, result = ?ret.msg.values(), "math.add returned");
                    done.close();
                    srv_done.close();
                });
                let payload = Payload::Raw(vec![HostValue::Int(2), HostValue::Number(3.5)]);
                match cli.call("math.add", Some(payload), "server", on_reply, timeout_ms) {
                    Ok(status::SUCCESS) => {}
                    Ok(st) => {
                        warn!(status = st, "math.add rejected");
                        cli.close();
                        srv.close();
                    }
                    Err(err) => {
                        warn!(error = %err, "math.add failed");
                        cli.close();
                        srv.close();
                    }
                }
            },
        ),
        None,
    )?;

    for i in 0..cfg.rounds {
        let payload = Payload::Raw(vec![HostValue::from("ping"), HostValue::Int(i as i32)]);
        let st = client.post("demo.ping", Some(payload), DeliveryClass::INSTANT)?;
        if st != status::SUCCESS {
            warn!(status = st, "Post rejected");
        }
    }

    bridge.run_blocking()?;
    info!("Demo finished");
    Ok(())
}
