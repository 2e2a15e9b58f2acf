//! Singleton broker client: one worker thread owns the broker DEALER socket
//! exclusively, all public methods hand work to it over a bounded queue.
//!
//! Grounded on the teacher's model of a dedicated I/O thread behind a
//! channel, generalized to the broker's REG/HEARTBEAT/DISC/DEREG protocol
//! and its pushed `*_NOTIFY` messages.

use crate::channel::{ChannelHandle, ChannelPattern, ConsumerInfo, ProducerInfo};
use crate::error::{HubError, HubResult};
use crate::memory::DataBlock;
use crate::metrics::{MetricsCounters, MetricsPublisher, MetricsSink, MetricsSnapshot};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, Sender, SyncSender};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Process-wide slot for the singleton [`Messenger`] (§9: "Messenger
/// singleton, referenced by both producer and consumer"). Populated by
/// [`Messenger::connect`]; [`Messenger::instance`] hands out cheap clones of
/// the underlying handle rather than a second owning connection.
static INSTANCE: OnceLock<Mutex<Option<MessengerHandle>>> = OnceLock::new();

const POLL_TIMEOUT_MS: i64 = 100;
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(2);
const METRICS_PUBLISH_INTERVAL: Duration = Duration::from_secs(5);

enum Command {
    RegisterProducer(String, ProducerInfo),
    RegisterConsumer(String, ConsumerInfo),
    DeregisterConsumer(String),
    UnregisterChannel(String),
    ReportChecksumError(String, i32, String),
    Discover(String, u64, SyncSender<HubResult<ConsumerInfo>>),
    RegisterForHeartbeat(String),
}

type ClosingCb = Box<dyn Fn(&str) + Send>;
type ConsumerDiedCb = Box<dyn Fn(u64, &str) + Send>;
type ChannelErrorCb = Box<dyn Fn(&str, &Value) + Send>;

#[derive(Default)]
struct Callbacks {
    global_closing: Option<ClosingCb>,
    per_channel_closing: HashMap<String, Box<dyn Fn() + Send>>,
    consumer_died: HashMap<String, ConsumerDiedCb>,
    channel_error: HashMap<String, ChannelErrorCb>,
}

struct Shared {
    cmd_tx: Sender<Command>,
    callbacks: Mutex<Callbacks>,
    connected: AtomicBool,
    metrics: Arc<MetricsCounters>,
}

/// Cheap, `Clone`-able handle to a connected [`Messenger`]'s worker. This is
/// the non-owning reference DESIGN NOTES §9 calls for: services store one of
/// these (obtained via [`Messenger::handle`] or [`Messenger::instance`])
/// rather than borrowing the owning `Messenger` itself, so a spawned worker
/// thread can carry it past the stack frame that created the connection.
#[derive(Clone)]
pub struct MessengerHandle {
    shared: Arc<Shared>,
}

impl MessengerHandle {
    pub fn register_producer(&self, channel: &str, info: ProducerInfo) {
        let _ = self.shared.cmd_tx.send(Command::RegisterProducer(channel.to_string(), info));
    }

    pub fn register_consumer(&self, channel: &str, info: ConsumerInfo) {
        let _ = self.shared.cmd_tx.send(Command::RegisterConsumer(channel.to_string(), info));
    }

    pub fn deregister_consumer(&self, channel: &str) {
        let _ = self.shared.cmd_tx.send(Command::DeregisterConsumer(channel.to_string()));
    }

    pub fn unregister_channel(&self, channel: &str) {
        let _ = self.shared.cmd_tx.send(Command::UnregisterChannel(channel.to_string()));
    }

    pub fn report_checksum_error(&self, channel: &str, slot_index: i32, description: &str) {
        let _ = self.shared.cmd_tx.send(Command::ReportChecksumError(
            channel.to_string(),
            slot_index,
            description.to_string(),
        ));
    }

    /// Discover a producer via the broker, retrying on `CHANNEL_NOT_READY`
    /// with geometric backoff until `timeout` elapses.
    pub fn discover_producer(&self, channel: &str, timeout: Duration) -> HubResult<ConsumerInfo> {
        let deadline = Instant::now() + timeout;
        let mut backoff = Duration::from_millis(50);
        loop {
            let (reply_tx, reply_rx) = sync_channel(1);
            let remaining = deadline.saturating_duration_since(Instant::now());
            self.shared
                .cmd_tx
                .send(Command::Discover(channel.to_string(), remaining.as_millis() as u64, reply_tx))
                .map_err(|_| HubError::Fatal("messenger worker is gone".into()))?;

            match reply_rx.recv_timeout(remaining + Duration::from_millis(200)) {
                Ok(Ok(info)) => return Ok(info),
                Ok(Err(HubError::Transient(_))) => {
                    if Instant::now() >= deadline {
                        return Err(HubError::Timeout);
                    }
                    self.shared.metrics.record_discovery_retry();
                    std::thread::sleep(backoff.min(deadline.saturating_duration_since(Instant::now())));
                    backoff = (backoff * 2).min(Duration::from_millis(500));
                }
                Ok(Err(e)) => return Err(e),
                Err(_) => return Err(HubError::Timeout),
            }
        }
    }

    /// Producer side of the high-level channel API: bind sockets, register
    /// with the broker, optionally create a DataBlock segment.
    pub fn create_channel(
        &self,
        channel_name: &str,
        pattern: ChannelPattern,
        has_shared_memory: bool,
        schema_hash: &str,
        schema_version: u32,
        timeout: Duration,
    ) -> HubResult<(ChannelHandle, Option<DataBlock>)> {
        let ctx = zmq::Context::new();
        let ctrl = ctx.socket(zmq::ROUTER)?;
        ctrl.bind("tcp://*:0")?;
        let ctrl_endpoint = ctrl.get_last_endpoint()?.map_err(|_| HubError::Fatal("bad ctrl endpoint".into()))?;

        let data_socket = match pattern {
            ChannelPattern::PubSub => Some(ctx.socket(zmq::XPUB)?),
            ChannelPattern::Pipeline => Some(ctx.socket(zmq::PUSH)?),
            ChannelPattern::Bidir => None,
        };
        let data_endpoint = if let Some(sock) = &data_socket {
            sock.bind("tcp://*:0")?;
            sock.get_last_endpoint()?.map_err(|_| HubError::Fatal("bad data endpoint".into()))?
        } else {
            String::new()
        };

        let data_block = if has_shared_memory {
            Some(DataBlock::create(channel_name, crate::memory::DataBlockConfig::default())?)
        } else {
            None
        };
        let shm_name = data_block.as_ref().map(|_| channel_name.to_string());

        let info = ProducerInfo {
            shm_name: shm_name.clone().unwrap_or_default(),
            producer_pid: std::process::id() as u64,
            schema_hash: schema_hash.to_string(),
            schema_version,
            has_shared_memory,
            pattern,
            zmq_ctrl_endpoint: ctrl_endpoint,
            zmq_data_endpoint: data_endpoint,
            zmq_pubkey: String::new(),
        };
        self.register_producer(channel_name, info);
        let _ = self.shared.cmd_tx.send(Command::RegisterForHeartbeat(channel_name.to_string()));
        let _ = timeout;

        Ok((ChannelHandle::new(channel_name.to_string(), pattern, shm_name, ctrl, data_socket), data_block))
    }

    /// Consumer side: discover (retrying until Ready), connect P2C sockets,
    /// register with the broker, attach to DataBlock if present.
    pub fn connect_channel(
        &self,
        channel_name: &str,
        timeout: Duration,
        schema_hash: &str,
    ) -> HubResult<(ChannelHandle, Option<DataBlock>)> {
        let discovered = self.discover_producer(channel_name, timeout)?;
        if !schema_hash.is_empty() && schema_hash != discovered.schema_hash {
            return Err(HubError::Protocol(format!(
                "schema mismatch on channel '{channel_name}': expected {schema_hash}, got {}",
                discovered.schema_hash
            )));
        }

        let ctx = zmq::Context::new();
        let ctrl = ctx.socket(zmq::DEALER)?;
        ctrl.connect(&discovered.zmq_ctrl_endpoint)?;

        let data_socket = match discovered.pattern {
            ChannelPattern::PubSub => {
                let sock = ctx.socket(zmq::SUB)?;
                sock.connect(&discovered.zmq_data_endpoint)?;
                sock.set_subscribe(b"")?;
                Some(sock)
            }
            ChannelPattern::Pipeline => {
                let sock = ctx.socket(zmq::PULL)?;
                sock.connect(&discovered.zmq_data_endpoint)?;
                Some(sock)
            }
            ChannelPattern::Bidir => None,
        };

        let data_block = if discovered.has_shared_memory {
            Some(DataBlock::attach(channel_name)?)
        } else {
            None
        };
        let shm_name = if discovered.has_shared_memory { Some(discovered.shm_name.clone()) } else { None };

        let info = ConsumerInfo {
            shm_name: discovered.shm_name,
            schema_hash: discovered.schema_hash,
            schema_version: discovered.schema_version,
            has_shared_memory: discovered.has_shared_memory,
            pattern: discovered.pattern,
            zmq_ctrl_endpoint: discovered.zmq_ctrl_endpoint,
            zmq_data_endpoint: discovered.zmq_data_endpoint,
            zmq_pubkey: discovered.zmq_pubkey,
            consumer_count: discovered.consumer_count,
        };
        self.register_consumer(channel_name, info.clone());

        // §4.3: every consumer performs the HELLO/HELLO_ACK handshake on
        // `start()`, regardless of pattern — PubSub/Pipeline producers also
        // record consumer identities off this frame (producer.rs's peer
        // thread), not just Bidir ones.
        ctrl.send_multipart([b"C".as_ref(), b"HELLO", b""], 0)?;
        match crate::channel::recv_ctrl(&ctrl, Duration::from_millis(POLL_TIMEOUT_MS as u64)) {
            Ok(Some(msg)) if msg.frame_type == "HELLO_ACK" => {}
            Ok(Some(msg)) => log::warn!(
                "dxhub: consumer ctrl handshake on '{channel_name}': expected HELLO_ACK, got '{}'",
                msg.frame_type
            ),
            Ok(None) => log::warn!(
                "dxhub: consumer ctrl handshake on '{channel_name}': no HELLO_ACK within {POLL_TIMEOUT_MS}ms"
            ),
            Err(e) => log::warn!("dxhub: consumer ctrl handshake on '{channel_name}' failed: {e}"),
        }

        Ok((ChannelHandle::new(channel_name.to_string(), discovered.pattern, shm_name, ctrl, data_socket), data_block))
    }

    pub fn on_channel_closing(&self, cb: impl Fn(&str) + Send + 'static) {
        self.shared.callbacks.lock().unwrap().global_closing = Some(Box::new(cb));
    }

    pub fn on_channel_closing_for(&self, channel: &str, cb: impl Fn() + Send + 'static) {
        self.shared
            .callbacks
            .lock()
            .unwrap()
            .per_channel_closing
            .insert(channel.to_string(), Box::new(cb));
    }

    pub fn on_consumer_died(&self, channel: &str, cb: impl Fn(u64, &str) + Send + 'static) {
        self.shared.callbacks.lock().unwrap().consumer_died.insert(channel.to_string(), Box::new(cb));
    }

    pub fn on_channel_error(&self, channel: &str, cb: impl Fn(&str, &Value) + Send + 'static) {
        self.shared.callbacks.lock().unwrap().channel_error.insert(channel.to_string(), Box::new(cb));
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    /// Point-in-time snapshot of this connection's hot-path counters (§5
    /// "Background maintenance threads").
    pub fn metrics(&self) -> MetricsSnapshot {
        self.shared.metrics.snapshot()
    }
}

/// Broker client: one worker thread owns the DEALER socket exclusively.
/// Owns the connection; [`MessengerHandle`]s (via [`Messenger::handle`]) are
/// what services actually hold onto, since those outlive the stack frame
/// that called `connect`.
pub struct Messenger {
    handle: MessengerHandle,
    _worker: JoinHandle<()>,
    _metrics_sink: MetricsSink,
}

impl Deref for Messenger {
    type Target = MessengerHandle;

    fn deref(&self) -> &MessengerHandle {
        &self.handle
    }
}

impl Messenger {
    /// Connect to the broker and start the worker thread. Registers itself
    /// as the process-wide singleton ([`Messenger::instance`]).
    pub fn connect(endpoint: &str, server_key: &str) -> HubResult<Self> {
        let ctx = zmq::Context::new();
        let socket = ctx.socket(zmq::DEALER)?;
        if !server_key.is_empty() {
            let (client_pub, client_sec) = zmq::curve_keypair()?;
            socket.set_curve_serverkey(server_key.as_bytes())?;
            socket.set_curve_publickey(&client_pub)?;
            socket.set_curve_secretkey(&client_sec)?;
        }
        socket.connect(endpoint)?;

        let (cmd_tx, cmd_rx) = std::sync::mpsc::channel();
        let metrics = Arc::new(MetricsCounters::default());
        let (metrics_sink, metrics_publisher) = MetricsSink::spawn();
        let shared = Arc::new(Shared {
            cmd_tx,
            callbacks: Mutex::new(Callbacks::default()),
            connected: AtomicBool::new(true),
            metrics,
        });

        let worker_shared = shared.clone();
        let worker = std::thread::Builder::new()
            .name("dxhub-messenger".into())
            .spawn(move || worker_loop(socket, cmd_rx, worker_shared, metrics_publisher))
            .map_err(|e| HubError::Fatal(format!("failed to spawn messenger worker: {e}")))?;

        let handle = MessengerHandle { shared };
        let instance = Self { handle: handle.clone(), _worker: worker, _metrics_sink: metrics_sink };

        let lock = INSTANCE.get_or_init(|| Mutex::new(None));
        *lock.lock().unwrap() = Some(handle);

        Ok(instance)
    }

    /// A cheap, `Clone`-able, `'static` handle to this connection.
    pub fn handle(&self) -> MessengerHandle {
        self.handle.clone()
    }

    /// Returns the process-wide singleton handle, if [`Messenger::connect`]
    /// has already been called successfully by this process.
    pub fn instance() -> Option<MessengerHandle> {
        INSTANCE.get().and_then(|lock| lock.lock().unwrap().clone())
    }

    pub fn disconnect(&self) {
        self.handle.shared.connected.store(false, Ordering::Release);
    }
}

fn worker_loop(socket: zmq::Socket, cmd_rx: Receiver<Command>, shared: Arc<Shared>, metrics_publisher: MetricsPublisher) {
    let mut pending_discover: HashMap<String, Vec<SyncSender<HubResult<ConsumerInfo>>>> = HashMap::new();
    let mut heartbeat_channels: Vec<String> = Vec::new();
    let mut last_heartbeat = Instant::now();
    let mut last_metrics_publish = Instant::now();

    while shared.connected.load(Ordering::Acquire) {
        while let Ok(cmd) = cmd_rx.try_recv() {
            if let Err(e) = handle_command(&socket, cmd, &mut pending_discover, &mut heartbeat_channels, &shared.metrics) {
                log::warn!("dxhub: messenger command failed: {e}");
            }
        }

        let mut items = [socket.as_poll_item(zmq::POLLIN)];
        if zmq::poll(&mut items, POLL_TIMEOUT_MS).unwrap_or(0) > 0 && items[0].is_readable() {
            if let Ok(parts) = socket.recv_multipart(0) {
                shared.metrics.record_message_received();
                dispatch_reply(parts, &mut pending_discover, &shared);
            }
        }

        if last_heartbeat.elapsed() >= HEARTBEAT_INTERVAL {
            for channel in &heartbeat_channels {
                let body = json!({ "channel": channel });
                let _ = send_request(&socket, "HEARTBEAT_REQ", &body);
            }
            last_heartbeat = Instant::now();
        }

        if last_metrics_publish.elapsed() >= METRICS_PUBLISH_INTERVAL {
            metrics_publisher.publish("messenger", shared.metrics.snapshot());
            last_metrics_publish = Instant::now();
        }
    }
}

fn handle_command(
    socket: &zmq::Socket,
    cmd: Command,
    pending_discover: &mut HashMap<String, Vec<SyncSender<HubResult<ConsumerInfo>>>>,
    heartbeat_channels: &mut Vec<String>,
    metrics: &MetricsCounters,
) -> HubResult<()> {
    let result = handle_command_inner(socket, cmd, pending_discover, heartbeat_channels);
    if result.is_ok() {
        metrics.record_message_sent();
    }
    result
}

fn handle_command_inner(
    socket: &zmq::Socket,
    cmd: Command,
    pending_discover: &mut HashMap<String, Vec<SyncSender<HubResult<ConsumerInfo>>>>,
    heartbeat_channels: &mut Vec<String>,
) -> HubResult<()> {
    match cmd {
        Command::RegisterProducer(channel, info) => {
            send_request(socket, "REG_REQ", &json!({ "channel": channel, "info": info }))
        }
        Command::RegisterConsumer(channel, info) => send_request(
            socket,
            "REGCON_REQ",
            &json!({ "channel": channel, "consumer_pid": std::process::id(), "info": info }),
        ),
        Command::DeregisterConsumer(channel) => {
            send_request(socket, "DEREGCON_REQ", &json!({ "channel": channel }))
        }
        Command::UnregisterChannel(channel) => {
            heartbeat_channels.retain(|c| c != &channel);
            send_request(socket, "DEREG_REQ", &json!({ "channel": channel }))
        }
        Command::ReportChecksumError(channel, slot_index, description) => send_request(
            socket,
            "REPORT_CSUM_ERROR",
            &json!({ "channel": channel, "slot_index": slot_index, "description": description }),
        ),
        Command::RegisterForHeartbeat(channel) => {
            if !heartbeat_channels.contains(&channel) {
                heartbeat_channels.push(channel.clone());
            }
            // Send the first heartbeat immediately rather than waiting for the
            // next periodic tick, so a freshly registered channel can clear
            // PendingReady before a consumer's discovery deadline expires.
            send_request(socket, "HEARTBEAT_REQ", &json!({ "channel": channel }))
        }
        Command::Discover(channel, timeout_ms, reply) => {
            send_request(socket, "DISC_REQ", &json!({ "channel": channel, "timeout_ms": timeout_ms }))?;
            pending_discover.entry(channel).or_default().push(reply);
            Ok(())
        }
    }
}

fn send_request(socket: &zmq::Socket, frame_type: &str, body: &Value) -> HubResult<()> {
    let bytes = serde_json::to_vec(body)?;
    crate::channel::send_ctrl(socket, frame_type, &bytes, None)
}

fn dispatch_reply(
    parts: Vec<Vec<u8>>,
    pending_discover: &mut HashMap<String, Vec<SyncSender<HubResult<ConsumerInfo>>>>,
    shared: &Arc<Shared>,
) {
    if parts.len() < 3 || parts[0] != crate::channel::FRAME_CONTROL {
        return;
    }
    let frame_type = String::from_utf8_lossy(&parts[1]).into_owned();
    let body: Value = match serde_json::from_slice(&parts[2]) {
        Ok(v) => v,
        Err(_) => return,
    };

    match frame_type.as_str() {
        "DISC_ACK" => {
            if let Some(channel) = body.get("channel").and_then(Value::as_str) {
                if let Some(waiters) = pending_discover.remove(channel) {
                    if let Ok(info) = serde_json::from_value::<ConsumerInfo>(body.clone()) {
                        for waiter in waiters {
                            let _ = waiter.send(Ok(info.clone()));
                        }
                    }
                }
            }
        }
        "CHANNEL_NOT_READY" | "NOT_FOUND" => {
            if let Some(channel) = body.get("channel").and_then(Value::as_str) {
                if let Some(waiters) = pending_discover.remove(channel) {
                    let err = if frame_type == "NOT_FOUND" {
                        HubError::NotFound(channel.to_string())
                    } else {
                        HubError::Transient(format!("channel '{channel}' not ready"))
                    };
                    for waiter in waiters {
                        let _ = waiter.send(Err(match &err {
                            HubError::NotFound(c) => HubError::NotFound(c.clone()),
                            _ => HubError::Transient(format!("channel '{channel}' not ready")),
                        }));
                    }
                }
            }
        }
        "CHANNEL_CLOSING_NOTIFY" => {
            if let Some(channel) = body.get("channel").and_then(Value::as_str) {
                let callbacks = shared.callbacks.lock().unwrap();
                if let Some(cb) = callbacks.per_channel_closing.get(channel) {
                    cb();
                } else if let Some(cb) = &callbacks.global_closing {
                    cb(channel);
                }
            }
        }
        "CONSUMER_DIED_NOTIFY" => {
            if let Some(channel) = body.get("channel").and_then(Value::as_str) {
                let pid = body.get("consumer_pid").and_then(Value::as_u64).unwrap_or(0);
                let reason = body.get("reason").and_then(Value::as_str).unwrap_or("");
                if let Some(cb) = shared.callbacks.lock().unwrap().consumer_died.get(channel) {
                    cb(pid, reason);
                }
            }
        }
        "CHANNEL_ERROR_NOTIFY" | "CHANNEL_EVENT_NOTIFY" => {
            if let Some(channel) = body.get("channel").and_then(Value::as_str) {
                if let Some(cb) = shared.callbacks.lock().unwrap().channel_error.get(channel) {
                    cb(&frame_type, &body);
                }
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_discover_resolves_newest_waiters_first_is_irrelevant() {
        let mut map: HashMap<String, Vec<SyncSender<HubResult<ConsumerInfo>>>> = HashMap::new();
        let (tx, rx) = sync_channel(1);
        map.entry("chan".into()).or_default().push(tx);
        assert_eq!(map.get("chan").unwrap().len(), 1);
        drop(rx);
    }
}
