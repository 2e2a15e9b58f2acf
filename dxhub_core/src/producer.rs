//! Producer service: owns a DataBlock and its P2C sockets, presenting Queue
//! or Real-time write modes (§4.2).
//!
//! Grounded on the messenger worker's "one thread owns the socket" rule,
//! generalized to two roles instead of one: a *peer thread* that is the
//! sole owner of the ctrl ROUTER after `start()`, and a *write thread* that
//! drives slot acquisition and owns the data socket (when the pattern has
//! one). Cross-thread traffic into the peer thread goes through a
//! lock-free queue rather than a shared socket handle.

use crate::channel::{send_ctrl, send_data, send_data_to, recv_ctrl, ChannelPattern};
use crate::error::{HubError, HubResult};
use crate::memory::{DataBlock, DataBlockConfig};
use crate::messenger::MessengerHandle;
use crate::metrics::{MetricsCounters, MetricsPublisher, MetricsSink, MetricsSnapshot};
use crossbeam::queue::SegQueue;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, RecvTimeoutError, Sender, SyncSender};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const METRICS_PUBLISH_INTERVAL: Duration = Duration::from_secs(5);

/// What happens to the service when a job/handler invocation returns `Err`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OnErrorPolicy {
    /// Log and keep looping.
    Continue,
    /// Shut the service down cleanly, as if `stop()` had been called.
    Stop,
}

impl Default for OnErrorPolicy {
    fn default() -> Self {
        OnErrorPolicy::Continue
    }
}

/// Channel-creation plus service configuration for a [`Producer`].
#[derive(Clone, Debug)]
pub struct ProducerConfig {
    pub pattern: ChannelPattern,
    pub has_shared_memory: bool,
    pub datablock: DataBlockConfig,
    pub schema_hash: String,
    pub schema_version: u32,
    pub on_error: OnErrorPolicy,
    /// Real-time cadence in milliseconds; `-1` means event-triggered via
    /// [`Producer::trigger_write`] instead of a fixed period. Ignored in
    /// Queue mode.
    pub interval_ms: i64,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            pattern: ChannelPattern::PubSub,
            has_shared_memory: true,
            datablock: DataBlockConfig::default(),
            schema_hash: String::new(),
            schema_version: 1,
            on_error: OnErrorPolicy::Continue,
            interval_ms: 0,
        }
    }
}

/// Context handed to a write job or real-time write handler: the slot
/// buffer to fill, flex-zone access, a way to post ctrl/data frames through
/// the peer thread, and the service's shutdown flag.
pub struct WriteCtx<'a> {
    pub slot: &'a mut [u8],
    flex: &'a DataBlock,
    peer_queue: &'a SegQueue<PeerPost>,
    shutdown: &'a AtomicBool,
}

impl<'a> WriteCtx<'a> {
    pub fn flex_zone_write(&self, bytes: &[u8]) -> HubResult<()> {
        self.flex.flex_zone_write(bytes)
    }

    pub fn flex_zone_read(&self) -> Vec<u8> {
        self.flex.flex_zone_read()
    }

    /// Queue a user-typed ctrl frame for the peer thread to send, addressed
    /// to `identity` or broadcast to every known peer if `None`.
    pub fn post_ctrl(&self, frame_type: &str, body: &[u8], identity: Option<&[u8]>) {
        self.peer_queue.push(PeerPost::Ctrl(frame_type.to_string(), body.to_vec(), identity.map(<[u8]>::to_vec)));
    }

    /// Queue a Bidir data frame addressed to a specific peer identity.
    pub fn post_data_to(&self, identity: &[u8], data: &[u8]) {
        self.peer_queue.push(PeerPost::Data(Some(identity.to_vec()), data.to_vec()));
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}

/// Job handed to `push`/`synced_write`. Returns `Ok(Some(len))` to commit
/// the written `len` bytes, `Ok(None)` to discard the slot without
/// publishing, or `Err` to trigger the channel's `on_error` policy.
pub type WriteJob = Box<dyn FnOnce(&mut WriteCtx) -> HubResult<Option<usize>> + Send>;

/// Handler installed for Real-time mode; same return contract as [`WriteJob`]
/// but invoked repeatedly at the configured cadence.
pub type WriteHandler = Box<dyn FnMut(&mut WriteCtx) -> HubResult<Option<usize>> + Send>;

type OnMessageCb = Box<dyn Fn(&[u8], &[u8]) + Send + Sync>;

enum JobMsg {
    Job(WriteJob, Option<SyncSender<HubResult<()>>>),
}

/// Work posted to the peer thread's internal lock-free queue by the write
/// thread or by user code through [`WriteCtx`].
pub(crate) enum PeerPost {
    Ctrl(String, Vec<u8>, Option<Vec<u8>>),
    /// `None` identity means broadcast to every peer that has said `HELLO`.
    Data(Option<Vec<u8>>, Vec<u8>),
}

/// Owns one DataBlock and its P2C sockets; presents Queue or Real-time
/// write modes over them (§4.2).
pub struct Producer {
    channel_name: String,
    block: Arc<DataBlock>,
    shutdown: Arc<AtomicBool>,
    job_tx: Sender<JobMsg>,
    handler: Arc<Mutex<Option<WriteHandler>>>,
    trigger: Arc<(Mutex<bool>, Condvar)>,
    on_message: Arc<Mutex<Option<OnMessageCb>>>,
    messenger: MessengerHandle,
    peer_thread: Option<JoinHandle<()>>,
    write_thread: Option<JoinHandle<()>>,
    fault: Arc<AtomicBool>,
    metrics: Arc<MetricsCounters>,
    _metrics_sink: MetricsSink,
}

impl Producer {
    /// Bind sockets, register with the broker, and spawn the peer and write
    /// threads (§4.2 "Lifecycle").
    pub fn start(
        messenger: &MessengerHandle,
        channel_name: &str,
        config: ProducerConfig,
        timeout: Duration,
    ) -> HubResult<Self> {
        let (handle, data_block) = messenger.create_channel(
            channel_name,
            config.pattern,
            config.has_shared_memory,
            &config.schema_hash,
            config.schema_version,
            timeout,
        )?;
        let block = Arc::new(
            data_block.ok_or_else(|| HubError::Fatal("producer requires a shared-memory DataBlock".into()))?,
        );

        let (_name, pattern, _shm_name, ctrl_socket, data_socket) = handle.split();

        let shutdown = Arc::new(AtomicBool::new(false));
        let peer_queue = Arc::new(SegQueue::new());
        let on_message: Arc<Mutex<Option<OnMessageCb>>> = Arc::new(Mutex::new(None));
        let handler: Arc<Mutex<Option<WriteHandler>>> = Arc::new(Mutex::new(None));
        let trigger = Arc::new((Mutex::new(false), Condvar::new()));
        let fault = Arc::new(AtomicBool::new(false));
        let metrics = Arc::new(MetricsCounters::default());
        let (metrics_sink, metrics_publisher) = MetricsSink::spawn();
        let (job_tx, job_rx) = std::sync::mpsc::channel::<JobMsg>();

        let peer_thread = {
            let shutdown = shutdown.clone();
            let peer_queue = peer_queue.clone();
            let on_message = on_message.clone();
            let name = channel_name.to_string();
            thread::Builder::new()
                .name(format!("dxhub-producer-peer-{name}"))
                .spawn(move || peer_thread_loop(ctrl_socket, peer_queue, shutdown, on_message))
                .map_err(|e| HubError::Fatal(format!("failed to spawn producer peer thread: {e}")))?
        };

        let write_thread = {
            let block = block.clone();
            let shutdown = shutdown.clone();
            let peer_queue = peer_queue.clone();
            let handler = handler.clone();
            let trigger = trigger.clone();
            let fault = fault.clone();
            let metrics = metrics.clone();
            let metrics_publisher = metrics_publisher.clone();
            let on_error = config.on_error;
            let interval_ms = config.interval_ms;
            let name = channel_name.to_string();
            thread::Builder::new()
                .name(format!("dxhub-producer-write-{name}"))
                .spawn(move || {
                    write_thread_loop(
                        block, pattern, data_socket, peer_queue, shutdown, job_rx, handler, trigger, on_error,
                        interval_ms, fault, metrics, metrics_publisher,
                    )
                })
                .map_err(|e| HubError::Fatal(format!("failed to spawn producer write thread: {e}")))?
        };

        Ok(Self {
            channel_name: channel_name.to_string(),
            block,
            shutdown,
            job_tx,
            handler,
            trigger,
            on_message,
            messenger: messenger.clone(),
            peer_thread: Some(peer_thread),
            write_thread: Some(write_thread),
            fault,
            metrics,
            _metrics_sink: metrics_sink,
        })
    }

    /// Point-in-time snapshot of this producer's hot-path counters (§5
    /// "Background maintenance threads").
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn channel_name(&self) -> &str {
        &self.channel_name
    }

    /// Whether a thread has hit an unrecoverable error and set the fault
    /// flag (§7 "per-service fault flag visible to subsequent public calls").
    pub fn has_fault(&self) -> bool {
        self.fault.load(Ordering::Acquire)
    }

    /// Submit a write job asynchronously. Queue mode only; has no effect
    /// while a real-time write handler is installed.
    pub fn push(&self, job: WriteJob) -> HubResult<()> {
        self.job_tx
            .send(JobMsg::Job(job, None))
            .map_err(|_| HubError::Fatal("producer write thread is gone".into()))
    }

    /// Submit a write job and block until it has been committed or
    /// discarded.
    pub fn synced_write(&self, job: WriteJob) -> HubResult<()> {
        let (reply_tx, reply_rx) = sync_channel(1);
        self.job_tx
            .send(JobMsg::Job(job, Some(reply_tx)))
            .map_err(|_| HubError::Fatal("producer write thread is gone".into()))?;
        reply_rx.recv().map_err(|_| HubError::Fatal("producer write thread dropped the reply channel".into()))?
    }

    /// Install a real-time write handler, switching the service out of
    /// Queue mode. The handler runs on the write thread at the configured
    /// cadence until [`Producer::clear_write_handler`] is called.
    pub fn set_write_handler(&self, handler: WriteHandler) {
        *self.handler.lock().unwrap() = Some(handler);
    }

    /// Remove the real-time write handler, returning the service to Queue
    /// mode. In-flight handler invocations finish before the next tick
    /// observes the change.
    pub fn clear_write_handler(&self) {
        *self.handler.lock().unwrap() = None;
    }

    /// Wake an event-triggered (`interval_ms == -1`) real-time write handler
    /// for one tick.
    pub fn trigger_write(&self) {
        let (lock, cvar) = &*self.trigger;
        *lock.lock().unwrap() = true;
        cvar.notify_one();
    }

    /// Register the hook invoked on the peer thread for every user-typed
    /// ctrl frame (anything other than `HELLO`/`BYE`).
    pub fn on_message(&self, cb: impl Fn(&[u8], &[u8]) + Send + Sync + 'static) {
        *self.on_message.lock().unwrap() = Some(Box::new(cb));
    }

    /// Snapshot of consumer liveness as last reported into the DataBlock
    /// header (§4.3's "producer's broker-facing side reports this slot up
    /// on demand").
    pub fn consumer_heartbeats(&self) -> Vec<(u32, u64)> {
        self.block.consumer_heartbeats()
    }

    /// Signal both threads, deregister with the broker, and join (§4.2).
    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        self.trigger.1.notify_all();
        self.messenger.unregister_channel(&self.channel_name);
        // Best-effort grace window for the broker to process DEREG_REQ and
        // flush CHANNEL_CLOSING_NOTIFY to consumers before sockets close.
        thread::sleep(Duration::from_millis(100));
        if let Some(t) = self.write_thread.take() {
            let _ = t.join();
        }
        if let Some(t) = self.peer_thread.take() {
            let _ = t.join();
        }
    }
}

impl Drop for Producer {
    fn drop(&mut self) {
        if self.write_thread.is_some() || self.peer_thread.is_some() {
            self.stop();
        }
    }
}

fn peer_thread_loop(
    ctrl_socket: zmq::Socket,
    peer_queue: Arc<SegQueue<PeerPost>>,
    shutdown: Arc<AtomicBool>,
    on_message: Arc<Mutex<Option<OnMessageCb>>>,
) {
    let mut peers: HashSet<Vec<u8>> = HashSet::new();

    while !shutdown.load(Ordering::Acquire) {
        while let Some(post) = peer_queue.pop() {
            let result = match &post {
                PeerPost::Ctrl(frame_type, body, identity) => {
                    send_ctrl(&ctrl_socket, frame_type, body, identity.as_deref())
                }
                PeerPost::Data(Some(identity), data) => send_data_to(&ctrl_socket, identity, data),
                PeerPost::Data(None, data) => {
                    let mut last = Ok(());
                    for id in &peers {
                        last = send_data_to(&ctrl_socket, id, data);
                    }
                    last
                }
            };
            if let Err(e) = result {
                log::warn!("dxhub: producer peer thread send failed: {e}");
            }
        }

        match recv_ctrl(&ctrl_socket, Duration::from_millis(50)) {
            Ok(Some(msg)) => match msg.frame_type.as_str() {
                "HELLO" => {
                    if let Some(id) = msg.identity.clone() {
                        peers.insert(id.clone());
                        let _ = send_ctrl(&ctrl_socket, "HELLO_ACK", b"", Some(&id));
                    }
                }
                "BYE" => {
                    if let Some(id) = &msg.identity {
                        peers.remove(id);
                    }
                }
                _ => {
                    if let (Some(cb), Some(id)) = (on_message.lock().unwrap().as_ref(), msg.identity.as_ref()) {
                        cb(id, &msg.body);
                    }
                }
            },
            Ok(None) => {}
            Err(e) => log::warn!("dxhub: producer peer thread recv failed: {e}"),
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn write_thread_loop(
    block: Arc<DataBlock>,
    pattern: ChannelPattern,
    data_socket: Option<zmq::Socket>,
    peer_queue: Arc<SegQueue<PeerPost>>,
    shutdown: Arc<AtomicBool>,
    job_rx: Receiver<JobMsg>,
    handler: Arc<Mutex<Option<WriteHandler>>>,
    trigger: Arc<(Mutex<bool>, Condvar)>,
    on_error: OnErrorPolicy,
    interval_ms: i64,
    fault: Arc<AtomicBool>,
    metrics: Arc<MetricsCounters>,
    metrics_publisher: MetricsPublisher,
) {
    let mut last_publish = Instant::now();

    while !shutdown.load(Ordering::Acquire) {
        let has_handler = handler.lock().unwrap().is_some();
        if has_handler {
            if interval_ms >= 0 {
                thread::sleep(Duration::from_millis(interval_ms as u64));
            } else {
                let (lock, cvar) = &*trigger;
                let guard = lock.lock().unwrap();
                let (mut fired, _timed_out) =
                    cvar.wait_timeout_while(guard, Duration::from_millis(100), |f| !*f).unwrap();
                if !*fired {
                    continue;
                }
                *fired = false;
            }
            if shutdown.load(Ordering::Acquire) {
                break;
            }
            run_realtime_tick(
                &block, pattern, &data_socket, &peer_queue, &shutdown, &handler, on_error, &fault, &metrics,
            );
        } else {
            match job_rx.recv_timeout(Duration::from_millis(100)) {
                Ok(JobMsg::Job(job, reply)) => {
                    let outcome = run_job(&block, pattern, &data_socket, &peer_queue, &shutdown, job, &metrics);
                    if let Err(e) = &outcome {
                        handle_write_error(e, on_error, &shutdown, &fault);
                    }
                    if let Some(reply) = reply {
                        let _ = reply.send(outcome);
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        if last_publish.elapsed() >= METRICS_PUBLISH_INTERVAL {
            metrics_publisher.publish("producer", metrics.snapshot());
            last_publish = Instant::now();
        }
    }
}

fn run_job(
    block: &DataBlock,
    pattern: ChannelPattern,
    data_socket: &Option<zmq::Socket>,
    peer_queue: &SegQueue<PeerPost>,
    shutdown: &AtomicBool,
    job: WriteJob,
    metrics: &MetricsCounters,
) -> HubResult<()> {
    let guard = block.acquire_write(Duration::from_secs(5))?;
    let slot = block.slot_bytes_mut(&guard);
    let mut ctx = WriteCtx { slot, flex: block, peer_queue, shutdown };
    let outcome = job(&mut ctx);
    match outcome {
        Ok(Some(len)) => {
            let payload = block.slot_bytes_mut(&guard)[..len].to_vec();
            block.commit(guard, len)?;
            let result = send_payload(pattern, data_socket, peer_queue, &payload);
            if result.is_ok() {
                metrics.record_message_sent();
            }
            result
        }
        Ok(None) => {
            block.discard_write(guard);
            Ok(())
        }
        Err(e) => {
            block.discard_write(guard);
            Err(e)
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn run_realtime_tick(
    block: &DataBlock,
    pattern: ChannelPattern,
    data_socket: &Option<zmq::Socket>,
    peer_queue: &SegQueue<PeerPost>,
    shutdown: &AtomicBool,
    handler: &Mutex<Option<WriteHandler>>,
    on_error: OnErrorPolicy,
    fault: &AtomicBool,
    metrics: &MetricsCounters,
) {
    let guard = match block.acquire_write(Duration::from_millis(200)) {
        Ok(g) => g,
        Err(_) => return,
    };
    let slot = block.slot_bytes_mut(&guard);
    let mut ctx = WriteCtx { slot, flex: block, peer_queue, shutdown };

    let mut handler_lock = handler.lock().unwrap();
    let outcome = match handler_lock.as_mut() {
        Some(h) => h(&mut ctx),
        None => Ok(None),
    };
    drop(handler_lock);

    let (result, sent) = match outcome {
        Ok(Some(len)) => {
            let payload = block.slot_bytes_mut(&guard)[..len].to_vec();
            let result = block
                .commit(guard, len)
                .map(|_| ())
                .and_then(|_| send_payload(pattern, data_socket, peer_queue, &payload));
            let sent = result.is_ok();
            (result, sent)
        }
        Ok(None) => {
            block.discard_write(guard);
            (Ok(()), false)
        }
        Err(e) => {
            block.discard_write(guard);
            (Err(e), false)
        }
    };
    if sent {
        metrics.record_message_sent();
    }
    if let Err(e) = result {
        log::warn!("dxhub: producer real-time write failed: {e}");
        handle_write_error(&e, on_error, shutdown, fault);
    }
}

fn send_payload(
    pattern: ChannelPattern,
    data_socket: &Option<zmq::Socket>,
    peer_queue: &SegQueue<PeerPost>,
    payload: &[u8],
) -> HubResult<()> {
    match pattern {
        ChannelPattern::Bidir => {
            peer_queue.push(PeerPost::Data(None, payload.to_vec()));
            Ok(())
        }
        ChannelPattern::PubSub | ChannelPattern::Pipeline => match data_socket {
            Some(sock) => send_data(sock, payload),
            None => Err(HubError::Internal("producer has no data socket for this pattern".into())),
        },
    }
}

fn handle_write_error(err: &HubError, policy: OnErrorPolicy, shutdown: &AtomicBool, fault: &AtomicBool) {
    log::error!("dxhub: producer write job failed: {err}");
    if policy == OnErrorPolicy::Stop {
        fault.store(true, Ordering::Release);
        shutdown.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn on_error_stop_sets_fault_and_shutdown() {
        let shutdown = AtomicBool::new(false);
        let fault = AtomicBool::new(false);
        handle_write_error(&HubError::Internal("boom".into()), OnErrorPolicy::Stop, &shutdown, &fault);
        assert!(shutdown.load(Ordering::Acquire));
        assert!(fault.load(Ordering::Acquire));
    }

    #[test]
    fn on_error_continue_leaves_flags_untouched() {
        let shutdown = AtomicBool::new(false);
        let fault = AtomicBool::new(false);
        handle_write_error(&HubError::Internal("boom".into()), OnErrorPolicy::Continue, &shutdown, &fault);
        assert!(!shutdown.load(Ordering::Acquire));
        assert!(!fault.load(Ordering::Acquire));
    }
}
