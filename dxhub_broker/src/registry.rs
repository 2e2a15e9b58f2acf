//! In-memory channel registry (§4.4): the request/notify protocol handler
//! that backs the broker's ROUTER socket. Deliberately not thread-safe —
//! the single-threaded invariant in §4.4 means it is only ever touched from
//! the broker's main poll loop.

use dxhub_core::channel::{ConsumerInfo, ProducerInfo};
use dxhub_core::memory::is_process_running;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ChannelStatus {
    PendingReady,
    Ready,
}

struct ConsumerRecord {
    identity: Vec<u8>,
    pid: u32,
}

struct ChannelEntry {
    status: ChannelStatus,
    producer_identity: Vec<u8>,
    info: ProducerInfo,
    consumers: Vec<ConsumerRecord>,
    last_heartbeat: Instant,
}

/// A reply or pushed notification the caller must relay over the ROUTER
/// socket, addressed to `identity`.
pub struct Outgoing {
    pub identity: Vec<u8>,
    pub frame_type: &'static str,
    pub body: Value,
}

impl Outgoing {
    fn new(identity: Vec<u8>, frame_type: &'static str, body: Value) -> Self {
        Self { identity, frame_type, body }
    }
}

pub struct ChannelRegistry {
    channels: HashMap<String, ChannelEntry>,
    heartbeat_timeout: Duration,
}

impl ChannelRegistry {
    pub fn new(heartbeat_timeout: Duration) -> Self {
        Self { channels: HashMap::new(), heartbeat_timeout }
    }

    /// Dispatch one parsed request to its handler. `identity` is the ROUTER
    /// frame identity of the socket that sent it.
    pub fn handle_request(&mut self, identity: Vec<u8>, frame_type: &str, body: Value) -> Vec<Outgoing> {
        match frame_type {
            "REG_REQ" => self.register_producer(identity, body),
            "HEARTBEAT_REQ" => self.heartbeat(identity, body),
            "DISC_REQ" => self.discover(identity, body),
            "REGCON_REQ" => self.register_consumer(identity, body),
            "DEREGCON_REQ" => self.deregister_consumer(identity, body),
            "DEREG_REQ" => self.deregister_channel(identity, body),
            "REPORT_CSUM_ERROR" => self.report_checksum_error(body),
            other => {
                tracing::warn!("dxhub_broker: unknown request type '{other}'");
                Vec::new()
            }
        }
    }

    /// Run once per poll tick: heartbeat timeouts close channels, and a
    /// consumer liveness pass drops dead consumer identities.
    pub fn sweep(&mut self) -> Vec<Outgoing> {
        let mut out = Vec::new();

        let timed_out: Vec<String> = self
            .channels
            .iter()
            .filter(|(_, entry)| entry.last_heartbeat.elapsed() > self.heartbeat_timeout)
            .map(|(name, _)| name.clone())
            .collect();
        for name in timed_out {
            if let Some(entry) = self.channels.remove(&name) {
                tracing::info!("dxhub_broker: channel '{name}' heartbeat timed out, closing");
                for consumer in &entry.consumers {
                    out.push(Outgoing::new(
                        consumer.identity.clone(),
                        "CHANNEL_CLOSING_NOTIFY",
                        json!({ "channel": name }),
                    ));
                }
            }
        }

        for (name, entry) in self.channels.iter_mut() {
            let mut dead_pids = Vec::new();
            entry.consumers.retain(|consumer| {
                let alive = is_process_running(consumer.pid);
                if !alive {
                    dead_pids.push(consumer.pid);
                }
                alive
            });
            for pid in dead_pids {
                tracing::info!("dxhub_broker: consumer pid {pid} on channel '{name}' is no longer running");
                out.push(Outgoing::new(
                    entry.producer_identity.clone(),
                    "CONSUMER_DIED_NOTIFY",
                    json!({ "channel": name, "consumer_pid": pid, "reason": "process not running" }),
                ));
            }
        }

        out
    }

    fn register_producer(&mut self, identity: Vec<u8>, body: Value) -> Vec<Outgoing> {
        let Some(channel) = body.get("channel").and_then(Value::as_str).map(str::to_string) else {
            return vec![Outgoing::new(identity, "REG_ACK", json!({ "success": false, "error": "missing channel" }))];
        };
        let info: ProducerInfo = match serde_json::from_value(body.get("info").cloned().unwrap_or(Value::Null)) {
            Ok(info) => info,
            Err(e) => {
                return vec![Outgoing::new(identity, "REG_ACK", json!({ "success": false, "error": e.to_string() }))]
            }
        };

        if let Some(existing) = self.channels.get(&channel) {
            if existing.info.schema_hash != info.schema_hash {
                return vec![Outgoing::new(
                    identity,
                    "SCHEMA_MISMATCH",
                    json!({
                        "channel": channel,
                        "expected": existing.info.schema_hash,
                        "got": info.schema_hash,
                    }),
                )];
            }
        }

        // Same schema_hash re-registration keeps the consumer list so that a
        // producer restart is transparent to already-attached consumers.
        let consumers = self.channels.remove(&channel).map(|entry| entry.consumers).unwrap_or_default();
        self.channels.insert(
            channel.clone(),
            ChannelEntry {
                status: ChannelStatus::PendingReady,
                producer_identity: identity.clone(),
                info,
                consumers,
                last_heartbeat: Instant::now(),
            },
        );
        tracing::info!("dxhub_broker: registered producer for channel '{channel}'");
        vec![Outgoing::new(identity, "REG_ACK", json!({ "success": true, "channel": channel }))]
    }

    fn heartbeat(&mut self, identity: Vec<u8>, body: Value) -> Vec<Outgoing> {
        let Some(channel) = body.get("channel").and_then(Value::as_str).map(str::to_string) else {
            return Vec::new();
        };
        match self.channels.get_mut(&channel) {
            Some(entry) => {
                entry.last_heartbeat = Instant::now();
                if entry.status == ChannelStatus::PendingReady {
                    entry.status = ChannelStatus::Ready;
                    tracing::info!("dxhub_broker: channel '{channel}' is now Ready");
                }
                vec![Outgoing::new(identity, "HEARTBEAT_ACK", json!({ "channel": channel, "success": true }))]
            }
            None => {
                vec![Outgoing::new(identity, "HEARTBEAT_ACK", json!({ "channel": channel, "success": false }))]
            }
        }
    }

    fn discover(&mut self, identity: Vec<u8>, body: Value) -> Vec<Outgoing> {
        let Some(channel) = body.get("channel").and_then(Value::as_str).map(str::to_string) else {
            return Vec::new();
        };
        match self.channels.get(&channel) {
            None => vec![Outgoing::new(identity, "NOT_FOUND", json!({ "channel": channel }))],
            Some(entry) if entry.status != ChannelStatus::Ready => {
                vec![Outgoing::new(identity, "CHANNEL_NOT_READY", json!({ "channel": channel }))]
            }
            Some(entry) => {
                let info = &entry.info;
                let consumer_info = ConsumerInfo {
                    shm_name: info.shm_name.clone(),
                    schema_hash: info.schema_hash.clone(),
                    schema_version: info.schema_version,
                    has_shared_memory: info.has_shared_memory,
                    pattern: info.pattern,
                    zmq_ctrl_endpoint: info.zmq_ctrl_endpoint.clone(),
                    zmq_data_endpoint: info.zmq_data_endpoint.clone(),
                    zmq_pubkey: info.zmq_pubkey.clone(),
                    consumer_count: entry.consumers.len() as u32,
                };
                let mut reply = serde_json::to_value(&consumer_info).unwrap_or(Value::Null);
                if let Value::Object(map) = &mut reply {
                    map.insert("channel".to_string(), json!(channel));
                }
                vec![Outgoing::new(identity, "DISC_ACK", reply)]
            }
        }
    }

    fn register_consumer(&mut self, identity: Vec<u8>, body: Value) -> Vec<Outgoing> {
        let Some(channel) = body.get("channel").and_then(Value::as_str).map(str::to_string) else {
            return Vec::new();
        };
        let pid = body.get("consumer_pid").and_then(Value::as_u64).unwrap_or(0) as u32;
        match self.channels.get_mut(&channel) {
            Some(entry) => {
                if !entry.consumers.iter().any(|c| c.identity == identity) {
                    entry.consumers.push(ConsumerRecord { identity: identity.clone(), pid });
                }
                tracing::info!("dxhub_broker: consumer (pid {pid}) attached to channel '{channel}'");
                vec![Outgoing::new(identity, "REGCON_ACK", json!({ "channel": channel, "success": true }))]
            }
            None => vec![Outgoing::new(
                identity,
                "REGCON_ACK",
                json!({ "channel": channel, "success": false, "error": "channel not found" }),
            )],
        }
    }

    fn deregister_consumer(&mut self, identity: Vec<u8>, body: Value) -> Vec<Outgoing> {
        let Some(channel) = body.get("channel").and_then(Value::as_str).map(str::to_string) else {
            return Vec::new();
        };
        if let Some(entry) = self.channels.get_mut(&channel) {
            entry.consumers.retain(|c| c.identity != identity);
        }
        vec![Outgoing::new(identity, "DEREGCON_ACK", json!({ "channel": channel }))]
    }

    fn deregister_channel(&mut self, identity: Vec<u8>, body: Value) -> Vec<Outgoing> {
        let Some(channel) = body.get("channel").and_then(Value::as_str).map(str::to_string) else {
            return Vec::new();
        };

        // "Only if producer pid matches" (§4.4) is enforced by identity:
        // within one process the broker DEALER socket keeps a stable ROUTER
        // identity, so the registering producer and the one deregistering
        // are necessarily the same connection.
        let owned_by_requester = self.channels.get(&channel).map(|e| e.producer_identity == identity).unwrap_or(false);

        if !owned_by_requester {
            return vec![Outgoing::new(
                identity,
                "DEREG_ACK",
                json!({ "channel": channel, "success": false, "error": "not the registering producer" }),
            )];
        }

        let mut out = Vec::new();
        if let Some(entry) = self.channels.remove(&channel) {
            tracing::info!("dxhub_broker: channel '{channel}' deregistered");
            for consumer in &entry.consumers {
                out.push(Outgoing::new(
                    consumer.identity.clone(),
                    "CHANNEL_CLOSING_NOTIFY",
                    json!({ "channel": channel }),
                ));
            }
        }
        out.push(Outgoing::new(identity, "DEREG_ACK", json!({ "channel": channel, "success": true })));
        out
    }

    fn report_checksum_error(&mut self, body: Value) -> Vec<Outgoing> {
        let channel = body.get("channel").and_then(Value::as_str).unwrap_or("?").to_string();
        let slot_index = body.get("slot_index").and_then(Value::as_i64).unwrap_or(-1);
        let description = body.get("description").and_then(Value::as_str).unwrap_or("");
        tracing::warn!("dxhub_broker: checksum error on channel '{channel}' slot {slot_index}: {description}");

        match self.channels.get(&channel) {
            Some(entry) => entry
                .consumers
                .iter()
                .map(|consumer| {
                    Outgoing::new(
                        consumer.identity.clone(),
                        "CHANNEL_ERROR_NOTIFY",
                        json!({ "channel": channel, "slot_index": slot_index, "description": description }),
                    )
                })
                .collect(),
            None => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dxhub_core::channel::ChannelPattern;

    fn producer_info(schema_hash: &str) -> Value {
        json!({
            "shm_name": "chan",
            "producer_pid": 111,
            "schema_hash": schema_hash,
            "schema_version": 1,
            "has_shared_memory": true,
            "pattern": "PubSub",
            "zmq_ctrl_endpoint": "tcp://127.0.0.1:9000",
            "zmq_data_endpoint": "tcp://127.0.0.1:9001",
            "zmq_pubkey": "",
        })
    }

    #[test]
    fn discover_before_heartbeat_is_not_ready() {
        let mut reg = ChannelRegistry::new(Duration::from_secs(5));
        reg.register_producer(b"prod".to_vec(), json!({ "channel": "t.a", "info": producer_info("00") }));

        let out = reg.discover(b"cons".to_vec(), json!({ "channel": "t.a" }));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].frame_type, "CHANNEL_NOT_READY");
    }

    #[test]
    fn heartbeat_promotes_to_ready_and_discover_succeeds() {
        let mut reg = ChannelRegistry::new(Duration::from_secs(5));
        reg.register_producer(b"prod".to_vec(), json!({ "channel": "t.a", "info": producer_info("00") }));
        reg.heartbeat(b"prod".to_vec(), json!({ "channel": "t.a" }));

        let out = reg.discover(b"cons".to_vec(), json!({ "channel": "t.a" }));
        assert_eq!(out[0].frame_type, "DISC_ACK");
        assert_eq!(out[0].body["pattern"], json!(ChannelPattern::PubSub));
    }

    #[test]
    fn unknown_channel_discovery_is_not_found() {
        let mut reg = ChannelRegistry::new(Duration::from_secs(5));
        let out = reg.discover(b"cons".to_vec(), json!({ "channel": "t.missing" }));
        assert_eq!(out[0].frame_type, "NOT_FOUND");
    }

    #[test]
    fn schema_mismatch_on_reregistration_keeps_first_producer() {
        let mut reg = ChannelRegistry::new(Duration::from_secs(5));
        reg.register_producer(b"prod".to_vec(), json!({ "channel": "t.schema", "info": producer_info("00") }));
        let out = reg.register_producer(b"prod2".to_vec(), json!({ "channel": "t.schema", "info": producer_info("11") }));

        assert_eq!(out[0].frame_type, "SCHEMA_MISMATCH");
        assert_eq!(reg.channels.get("t.schema").unwrap().producer_identity, b"prod".to_vec());
    }

    #[test]
    fn same_schema_reregistration_preserves_consumers() {
        let mut reg = ChannelRegistry::new(Duration::from_secs(5));
        reg.register_producer(b"prod".to_vec(), json!({ "channel": "t.keep", "info": producer_info("00") }));
        reg.register_consumer(b"cons".to_vec(), json!({ "channel": "t.keep", "consumer_pid": std::process::id() }));

        reg.register_producer(b"prod".to_vec(), json!({ "channel": "t.keep", "info": producer_info("00") }));
        assert_eq!(reg.channels.get("t.keep").unwrap().consumers.len(), 1);
    }

    #[test]
    fn heartbeat_timeout_closes_channel_and_notifies_consumers() {
        let mut reg = ChannelRegistry::new(Duration::from_millis(0));
        reg.register_producer(b"prod".to_vec(), json!({ "channel": "t.close", "info": producer_info("00") }));
        reg.register_consumer(b"cons".to_vec(), json!({ "channel": "t.close", "consumer_pid": std::process::id() }));

        std::thread::sleep(Duration::from_millis(5));
        let out = reg.sweep();
        assert!(out.iter().any(|o| o.frame_type == "CHANNEL_CLOSING_NOTIFY" && o.identity == b"cons".to_vec()));
        assert!(!reg.channels.contains_key("t.close"));
    }

    #[test]
    fn deregister_rejects_non_owning_identity() {
        let mut reg = ChannelRegistry::new(Duration::from_secs(5));
        reg.register_producer(b"prod".to_vec(), json!({ "channel": "t.own", "info": producer_info("00") }));

        let out = reg.deregister_channel(b"impostor".to_vec(), json!({ "channel": "t.own" }));
        assert_eq!(out[0].body["success"], json!(false));
        assert!(reg.channels.contains_key("t.own"));
    }

    #[test]
    fn deregister_by_owner_notifies_consumers_and_removes_channel() {
        let mut reg = ChannelRegistry::new(Duration::from_secs(5));
        reg.register_producer(b"prod".to_vec(), json!({ "channel": "t.bye", "info": producer_info("00") }));
        reg.register_consumer(b"cons".to_vec(), json!({ "channel": "t.bye", "consumer_pid": std::process::id() }));

        let out = reg.deregister_channel(b"prod".to_vec(), json!({ "channel": "t.bye" }));
        assert!(out.iter().any(|o| o.frame_type == "CHANNEL_CLOSING_NOTIFY"));
        assert!(out.iter().any(|o| o.frame_type == "DEREG_ACK" && o.body["success"] == json!(true)));
        assert!(!reg.channels.contains_key("t.bye"));
    }
}
