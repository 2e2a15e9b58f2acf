//! Acceptance tests driving the real `ChannelRegistry` over a live ZMQ
//! ROUTER socket (§8 end-to-end scenarios 5-6), exercised from both sides
//! through `dxhub_core::Messenger` exactly as a producer/consumer process
//! would use it.

use dxhub_broker::registry::ChannelRegistry;
use dxhub_core::channel::ChannelPattern;
use dxhub_core::messenger::Messenger;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Binds a ROUTER socket on an OS-assigned loopback port and runs
/// `ChannelRegistry::handle_request`/`sweep` on it, mirroring
/// `dxhub_broker`'s own main loop. Returns the bound endpoint and a stop
/// handle; drop the returned guard (or call `stop()`) to join the thread.
struct TestBroker {
    endpoint: String,
    running: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl TestBroker {
    fn spawn(heartbeat_timeout: Duration) -> Self {
        let ctx = zmq::Context::new();
        let socket = ctx.socket(zmq::ROUTER).expect("router socket");
        socket.bind("tcp://127.0.0.1:0").expect("bind");
        let endpoint = socket.get_last_endpoint().expect("endpoint").expect("endpoint utf8");

        let running = Arc::new(AtomicBool::new(true));
        let loop_flag = running.clone();
        let join = std::thread::spawn(move || {
            let mut registry = ChannelRegistry::new(heartbeat_timeout);
            while loop_flag.load(Ordering::SeqCst) {
                let mut items = [socket.as_poll_item(zmq::POLLIN)];
                if zmq::poll(&mut items, 20).unwrap_or(0) > 0 && items[0].is_readable() {
                    if let Ok(parts) = socket.recv_multipart(0) {
                        if parts.len() >= 3 && parts[1] == dxhub_core::channel::FRAME_CONTROL {
                            let identity = parts[0].clone();
                            let frame_type = String::from_utf8_lossy(&parts[2]).into_owned();
                            let body = parts
                                .get(3)
                                .and_then(|b| serde_json::from_slice(b).ok())
                                .unwrap_or(serde_json::Value::Null);
                            for out in registry.handle_request(identity, &frame_type, body) {
                                send_reply(&socket, out);
                            }
                        }
                    }
                }
                for out in registry.sweep() {
                    send_reply(&socket, out);
                }
            }
        });

        TestBroker { endpoint, running, join: Some(join) }
    }

    fn stop(mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }
}

fn send_reply(socket: &zmq::Socket, out: dxhub_broker::registry::Outgoing) {
    if let Ok(bytes) = serde_json::to_vec(&out.body) {
        let _ = dxhub_core::channel::send_ctrl(socket, out.frame_type, &bytes, Some(&out.identity));
    }
}

#[test]
fn scenario_5_channel_close_notifies_both_consumers_exactly_once() {
    let broker = TestBroker::spawn(Duration::from_secs(30));

    let producer = Messenger::connect(&broker.endpoint, "").expect("producer connect");
    producer
        .create_channel("t.close.broker", ChannelPattern::PubSub, false, "schema", 1, Duration::from_millis(500))
        .expect("create_channel");

    let consumer_a = Messenger::connect(&broker.endpoint, "").expect("consumer a connect");
    let consumer_b = Messenger::connect(&broker.endpoint, "").expect("consumer b connect");
    consumer_a.connect_channel("t.close.broker", Duration::from_millis(3000), "schema").expect("consumer a connect_channel");
    consumer_b.connect_channel("t.close.broker", Duration::from_millis(3000), "schema").expect("consumer b connect_channel");

    let hits_a = Arc::new(AtomicUsize::new(0));
    let hits_b = Arc::new(AtomicUsize::new(0));
    let cb_a = hits_a.clone();
    let cb_b = hits_b.clone();
    consumer_a.on_channel_closing_for("t.close.broker", move || {
        cb_a.fetch_add(1, Ordering::SeqCst);
    });
    consumer_b.on_channel_closing_for("t.close.broker", move || {
        cb_b.fetch_add(1, Ordering::SeqCst);
    });

    producer.unregister_channel("t.close.broker");
    std::thread::sleep(Duration::from_millis(500));

    assert_eq!(hits_a.load(Ordering::SeqCst), 1, "consumer a's close callback must fire exactly once");
    assert_eq!(hits_b.load(Ordering::SeqCst), 1, "consumer b's close callback must fire exactly once");

    producer.disconnect();
    consumer_a.disconnect();
    consumer_b.disconnect();
    broker.stop();
}

#[test]
fn discovery_with_zero_timeout_performs_exactly_one_attempt() {
    let broker = TestBroker::spawn(Duration::from_secs(30));
    let consumer = Messenger::connect(&broker.endpoint, "").expect("consumer connect");

    let started = Instant::now();
    let result = consumer.connect_channel("t.zero-timeout.broker", Duration::from_millis(0), "");
    let elapsed = started.elapsed();

    assert!(result.is_err(), "no producer is registered, so discovery must fail");
    assert!(elapsed < Duration::from_millis(300), "a zero-timeout discovery must not retry: took {elapsed:?}");

    consumer.disconnect();
    broker.stop();
}

#[test]
fn scenario_6_discovery_retries_until_a_late_producer_registers() {
    let broker = TestBroker::spawn(Duration::from_secs(30));
    let endpoint = broker.endpoint.clone();

    let consumer_thread = std::thread::spawn(move || {
        let consumer = Messenger::connect(&endpoint, "").expect("consumer connect");
        let started = Instant::now();
        let result = consumer.connect_channel("t.late.broker", Duration::from_millis(2000), "");
        (result.is_ok(), started.elapsed())
    });

    std::thread::sleep(Duration::from_millis(800));
    let producer = Messenger::connect(&broker.endpoint, "").expect("producer connect");
    producer
        .create_channel("t.late.broker", ChannelPattern::PubSub, false, "", 1, Duration::from_millis(500))
        .expect("create_channel");

    let (discovered, elapsed) = consumer_thread.join().expect("consumer thread");
    assert!(discovered, "consumer must eventually discover the late-registering producer");
    assert!(elapsed < Duration::from_millis(2000), "discovery should succeed well before the retry deadline");

    producer.disconnect();
    broker.stop();
}
