//! Consumer service: mirrors [`crate::producer::Producer`] on the read
//! side (§4.3). Owns a DataBlock attachment and the consumer-side P2C
//! sockets.

use crate::channel::recv_ctrl;
use crate::error::{HubError, HubResult};
use crate::memory::DataBlock;
use crate::messenger::MessengerHandle;
use crate::metrics::{MetricsCounters, MetricsPublisher, MetricsSink, MetricsSnapshot};
use crate::producer::OnErrorPolicy;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, RecvTimeoutError, Sender, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const METRICS_PUBLISH_INTERVAL: Duration = Duration::from_secs(5);

/// How a real-time read handler responds to a slot whose checksum failed
/// to validate (only reachable when the channel's `enforce_slot_checksum`
/// is `pass` rather than `strict`, since `strict` fails inside
/// [`DataBlock::acquire_read`] before a guard is ever produced).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChecksumFailPolicy {
    /// Release the slot and move on without delivering it (default).
    Skip,
    /// Deliver it anyway, with [`ReadCtx::valid`] set to `false`.
    Pass,
}

impl Default for ChecksumFailPolicy {
    fn default() -> Self {
        ChecksumFailPolicy::Skip
    }
}

/// Service configuration for a [`Consumer`].
#[derive(Clone, Debug, Default)]
pub struct ConsumerConfig {
    /// Expected producer schema hash; empty skips the check.
    pub schema_hash: String,
    pub on_checksum_fail: ChecksumFailPolicy,
    pub on_error: OnErrorPolicy,
}

/// Context handed to a read job or real-time read handler.
pub struct ReadCtx<'a> {
    pub data: &'a [u8],
    pub valid: bool,
    shutdown: &'a AtomicBool,
}

impl ReadCtx<'_> {
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}

pub type ReadJob = Box<dyn FnOnce(&ReadCtx) -> HubResult<()> + Send>;
pub type ReadHandler = Box<dyn FnMut(&ReadCtx) -> HubResult<()> + Send>;

type OnMessageCb = Box<dyn Fn(&[u8]) + Send + Sync>;

enum JobMsg {
    Job(ReadJob, Duration, Option<SyncSender<HubResult<()>>>),
}

/// Mirror of [`crate::producer::Producer`] on the read side (§4.3). Owns a
/// DataBlock attachment and the consumer-side ctrl (DEALER) and data
/// (SUB/PULL, or none for Bidir) sockets.
pub struct Consumer {
    channel_name: String,
    block: Arc<DataBlock>,
    shutdown: Arc<AtomicBool>,
    job_tx: Sender<JobMsg>,
    handler: Arc<Mutex<Option<ReadHandler>>>,
    on_message: Arc<Mutex<Option<OnMessageCb>>>,
    accepted_flex: Mutex<Option<Vec<u8>>>,
    messenger: MessengerHandle,
    ctrl_thread: Option<JoinHandle<()>>,
    data_thread: Option<JoinHandle<()>>,
    shm_thread: Option<JoinHandle<()>>,
    fault: Arc<AtomicBool>,
    metrics: Arc<MetricsCounters>,
    _metrics_sink: MetricsSink,
}

impl Consumer {
    /// Discover the producer, connect P2C sockets, register with the
    /// broker, and spawn the ctrl/data/shm threads (§4.3 "Lifecycle").
    pub fn start(
        messenger: &MessengerHandle,
        channel_name: &str,
        config: ConsumerConfig,
        timeout: Duration,
    ) -> HubResult<Self> {
        let (handle, data_block) = messenger.connect_channel(channel_name, timeout, &config.schema_hash)?;
        let block = Arc::new(
            data_block.ok_or_else(|| HubError::Fatal("consumer requires a shared-memory DataBlock".into()))?,
        );

        let (_name, pattern, _shm_name, ctrl_socket, data_socket) = handle.split();

        let shutdown = Arc::new(AtomicBool::new(false));
        let on_message: Arc<Mutex<Option<OnMessageCb>>> = Arc::new(Mutex::new(None));
        let handler: Arc<Mutex<Option<ReadHandler>>> = Arc::new(Mutex::new(None));
        let fault = Arc::new(AtomicBool::new(false));
        let metrics = Arc::new(MetricsCounters::default());
        let (metrics_sink, metrics_publisher) = MetricsSink::spawn();
        let (job_tx, job_rx) = std::sync::mpsc::channel::<JobMsg>();

        let ctrl_thread = {
            let shutdown = shutdown.clone();
            let on_message = on_message.clone();
            let name = channel_name.to_string();
            thread::Builder::new()
                .name(format!("dxhub-consumer-ctrl-{name}"))
                .spawn(move || ctrl_thread_loop(ctrl_socket, shutdown, on_message))
                .map_err(|e| HubError::Fatal(format!("failed to spawn consumer ctrl thread: {e}")))?
        };

        // PubSub/Pipeline carry data on their own socket; Bidir reuses ctrl,
        // already drained above, so there is nothing for this thread to do.
        let data_thread = if let Some(sock) = data_socket {
            let shutdown = shutdown.clone();
            let block = block.clone();
            let name = channel_name.to_string();
            Some(
                thread::Builder::new()
                    .name(format!("dxhub-consumer-data-{name}"))
                    .spawn(move || data_thread_loop(sock, block, shutdown))
                    .map_err(|e| HubError::Fatal(format!("failed to spawn consumer data thread: {e}")))?,
            )
        } else {
            None
        };

        let shm_thread = {
            let block = block.clone();
            let shutdown = shutdown.clone();
            let handler = handler.clone();
            let fault = fault.clone();
            let on_checksum_fail = config.on_checksum_fail;
            let on_error = config.on_error;
            let metrics = metrics.clone();
            let metrics_publisher = metrics_publisher.clone();
            let name = channel_name.to_string();
            thread::Builder::new()
                .name(format!("dxhub-consumer-shm-{name}"))
                .spawn(move || {
                    shm_thread_loop(
                        block, shutdown, job_rx, handler, on_checksum_fail, on_error, fault, metrics,
                        metrics_publisher,
                    )
                })
                .map_err(|e| HubError::Fatal(format!("failed to spawn consumer shm thread: {e}")))?
        };

        let _ = pattern;
        Ok(Self {
            channel_name: channel_name.to_string(),
            block,
            shutdown,
            job_tx,
            handler,
            on_message,
            accepted_flex: Mutex::new(None),
            messenger: messenger.clone(),
            ctrl_thread: Some(ctrl_thread),
            data_thread,
            shm_thread: Some(shm_thread),
            fault,
            metrics,
            _metrics_sink: metrics_sink,
        })
    }

    /// Point-in-time snapshot of this consumer's hot-path counters (§5
    /// "Background maintenance threads").
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn channel_name(&self) -> &str {
        &self.channel_name
    }

    pub fn has_fault(&self) -> bool {
        self.fault.load(Ordering::Acquire)
    }

    /// Block until one slot is available (or `timeout` elapses) and run
    /// `job` against it. Queue mode only.
    pub fn pull(&self, timeout: Duration, job: ReadJob) -> HubResult<()> {
        let (reply_tx, reply_rx) = sync_channel(1);
        self.job_tx
            .send(JobMsg::Job(job, timeout, Some(reply_tx)))
            .map_err(|_| HubError::Fatal("consumer shm thread is gone".into()))?;
        reply_rx.recv().map_err(|_| HubError::Fatal("consumer shm thread dropped the reply channel".into()))?
    }

    /// Install a real-time read handler, switching the service out of
    /// Queue mode.
    pub fn set_read_handler(&self, handler: ReadHandler) {
        *self.handler.lock().unwrap() = Some(handler);
    }

    /// Return the service to Queue mode.
    pub fn clear_read_handler(&self) {
        *self.handler.lock().unwrap() = None;
    }

    /// Register the hook invoked on the ctrl thread for user-typed ctrl
    /// frames forwarded by the producer.
    pub fn on_message(&self, cb: impl Fn(&[u8]) + Send + Sync + 'static) {
        *self.on_message.lock().unwrap() = Some(Box::new(cb));
    }

    pub fn update_heartbeat(&self) {
        self.block.update_heartbeat();
    }

    /// Snapshot the flex zone's current bytes as the "accepted" baseline
    /// (§4.3 "Flex-zone acceptance").
    pub fn accept_flex_zone_state(&self) -> Vec<u8> {
        let bytes = self.block.flex_zone_read();
        *self.accepted_flex.lock().unwrap() = Some(bytes.clone());
        bytes
    }

    /// Whether `current_bytes` matches the last accepted snapshot
    /// (content equality, not digest equality, per §4.1).
    pub fn is_flex_zone_accepted(&self, current_bytes: &[u8]) -> bool {
        self.accepted_flex.lock().unwrap().as_deref() == Some(current_bytes)
    }

    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        self.messenger.deregister_consumer(&self.channel_name);
        thread::sleep(Duration::from_millis(100));
        if let Some(t) = self.shm_thread.take() {
            let _ = t.join();
        }
        if let Some(t) = self.data_thread.take() {
            let _ = t.join();
        }
        if let Some(t) = self.ctrl_thread.take() {
            let _ = t.join();
        }
    }
}

impl Drop for Consumer {
    fn drop(&mut self) {
        if self.shm_thread.is_some() || self.ctrl_thread.is_some() {
            self.stop();
        }
    }
}

fn ctrl_thread_loop(ctrl_socket: zmq::Socket, shutdown: Arc<AtomicBool>, on_message: Arc<Mutex<Option<OnMessageCb>>>) {
    while !shutdown.load(Ordering::Acquire) {
        match recv_ctrl(&ctrl_socket, Duration::from_millis(100)) {
            Ok(Some(msg)) => match msg.frame_type.as_str() {
                "HELLO_ACK" | "BYE" => {}
                _ => {
                    if let Some(cb) = on_message.lock().unwrap().as_ref() {
                        cb(&msg.body);
                    }
                }
            },
            Ok(None) => {}
            Err(e) => log::warn!("dxhub: consumer ctrl thread recv failed: {e}"),
        }
    }
}

/// Drains the data socket so ZMQ-level buffering never grows unbounded;
/// the DataBlock ring (via the shm thread) is the authoritative delivery
/// path when shared memory is in use.
fn data_thread_loop(data_socket: zmq::Socket, block: Arc<DataBlock>, shutdown: Arc<AtomicBool>) {
    while !shutdown.load(Ordering::Acquire) {
        match crate::channel::recv_data(&data_socket, Duration::from_millis(100)) {
            Ok(Some(_)) => block.update_heartbeat(),
            Ok(None) => {}
            Err(e) => log::warn!("dxhub: consumer data thread recv failed: {e}"),
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn shm_thread_loop(
    block: Arc<DataBlock>,
    shutdown: Arc<AtomicBool>,
    job_rx: Receiver<JobMsg>,
    handler: Arc<Mutex<Option<ReadHandler>>>,
    on_checksum_fail: ChecksumFailPolicy,
    on_error: OnErrorPolicy,
    fault: Arc<AtomicBool>,
    metrics: Arc<MetricsCounters>,
    metrics_publisher: MetricsPublisher,
) {
    let mut last_publish = Instant::now();

    while !shutdown.load(Ordering::Acquire) {
        let has_handler = handler.lock().unwrap().is_some();
        if has_handler {
            run_realtime_tick(&block, &shutdown, &handler, on_checksum_fail, on_error, &fault, &metrics);
        } else {
            match job_rx.recv_timeout(Duration::from_millis(100)) {
                Ok(JobMsg::Job(job, timeout, reply)) => {
                    let outcome = run_job(&block, &shutdown, on_checksum_fail, timeout, job, &metrics);
                    if let Err(e) = &outcome {
                        handle_read_error(e, on_error, &shutdown, &fault);
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
            metrics_publisher.publish("consumer", metrics.snapshot());
            last_publish = Instant::now();
        }
    }
}

fn run_job(
    block: &DataBlock,
    shutdown: &AtomicBool,
    on_checksum_fail: ChecksumFailPolicy,
    timeout: Duration,
    job: ReadJob,
    metrics: &MetricsCounters,
) -> HubResult<()> {
    let guard = block.acquire_read(timeout)?;
    if !guard.checksum_valid() {
        metrics.record_checksum_failure();
        if on_checksum_fail == ChecksumFailPolicy::Skip {
            return block.release_read(guard);
        }
    }
    let data = block.slot_bytes_of(&guard).to_vec();
    let valid = guard.checksum_valid();
    block.release_read(guard)?;
    metrics.record_message_received();
    let ctx = ReadCtx { data: &data, valid, shutdown };
    job(&ctx)
}

fn run_realtime_tick(
    block: &DataBlock,
    shutdown: &AtomicBool,
    handler: &Mutex<Option<ReadHandler>>,
    on_checksum_fail: ChecksumFailPolicy,
    on_error: OnErrorPolicy,
    fault: &AtomicBool,
    metrics: &MetricsCounters,
) {
    let guard = match block.acquire_read(Duration::from_millis(200)) {
        Ok(g) => g,
        Err(_) => return,
    };
    if !guard.checksum_valid() {
        metrics.record_checksum_failure();
        if on_checksum_fail == ChecksumFailPolicy::Skip {
            let _ = block.release_read(guard);
            return;
        }
    }
    let data = block.slot_bytes_of(&guard).to_vec();
    let valid = guard.checksum_valid();
    if let Err(e) = block.release_read(guard) {
        log::warn!("dxhub: consumer real-time release_read failed: {e}");
        return;
    }
    metrics.record_message_received();

    let ctx = ReadCtx { data: &data, valid, shutdown };
    let mut handler_lock = handler.lock().unwrap();
    let outcome = match handler_lock.as_mut() {
        Some(h) => h(&ctx),
        None => Ok(()),
    };
    drop(handler_lock);

    if let Err(e) = outcome {
        log::warn!("dxhub: consumer real-time read handler failed: {e}");
        handle_read_error(&e, on_error, shutdown, fault);
    }
}

fn handle_read_error(err: &HubError, policy: OnErrorPolicy, shutdown: &AtomicBool, fault: &AtomicBool) {
    log::error!("dxhub: consumer read job failed: {err}");
    if policy == OnErrorPolicy::Stop {
        fault.store(true, Ordering::Release);
        shutdown.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flex_zone_acceptance_is_content_equality() {
        let accepted: Mutex<Option<Vec<u8>>> = Mutex::new(Some(b"hello".to_vec()));
        assert_eq!(accepted.lock().unwrap().as_deref(), Some(b"hello".as_slice()));
        assert_ne!(accepted.lock().unwrap().as_deref(), Some(b"world".as_slice()));
    }

    #[test]
    fn on_error_stop_sets_fault_and_shutdown() {
        let shutdown = AtomicBool::new(false);
        let fault = AtomicBool::new(false);
        handle_read_error(&HubError::Internal("boom".into()), OnErrorPolicy::Stop, &shutdown, &fault);
        assert!(shutdown.load(Ordering::Acquire));
        assert!(fault.load(Ordering::Acquire));
    }
}
