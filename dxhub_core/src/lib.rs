//! # dxhub core
//!
//! The shared-memory DataBlock, producer/consumer transport, and broker
//! client that together make up the data-exchange hub's core engineering:
//! one producer publishing fixed-layout records to many consumers at
//! minimum latency, with a central broker mediating discovery and liveness.
//!
//! - **[`memory`]**: the cross-process `DataBlock` ring of fixed-stride
//!   slots plus a shared flex zone, guarded by a robust management mutex.
//! - **[`zone`]**: typed accessors ([`ZoneRef`]/[`ZoneRefMut`]) over a
//!   DataBlock's flex zone.
//! - **[`channel`]**: wire framing and the producer/consumer-side
//!   [`ChannelHandle`] over ZMQ P2C sockets.
//! - **[`producer`]**: the [`Producer`] service — owns a DataBlock and its
//!   P2C sockets, in queue or real-time write mode.
//! - **[`consumer`]**: the [`Consumer`] service — mirrors `Producer` on the
//!   read side.
//! - **[`messenger`]**: the broker client and channel-handle factory.
//! - **[`metrics`]**: cache-aligned atomic counters plus the background
//!   sink that persists periodic snapshots off the hot path.
//! - **[`error`]**: the [`HubError`]/[`HubResult`] taxonomy shared by all of
//!   the above.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use dxhub_core::channel::ChannelPattern;
//! use dxhub_core::messenger::Messenger;
//! use dxhub_core::producer::{Producer, ProducerConfig};
//! use std::time::Duration;
//!
//! # fn run() -> dxhub_core::error::HubResult<()> {
//! let messenger = Messenger::connect("tcp://localhost:5570", "")?;
//! let mut producer = Producer::start(
//!     &messenger,
//!     "demo.telemetry",
//!     ProducerConfig { pattern: ChannelPattern::PubSub, ..Default::default() },
//!     Duration::from_secs(5),
//! )?;
//! producer.push(Box::new(|ctx| {
//!     ctx.slot[..5].copy_from_slice(b"hello");
//!     Ok(Some(5))
//! }))?;
//! producer.stop();
//! # Ok(())
//! # }
//! ```

pub mod channel;
pub mod consumer;
pub mod error;
pub mod memory;
pub mod messenger;
pub mod metrics;
pub mod producer;
pub mod zone;

pub use channel::{ChannelHandle, ChannelPattern};
pub use consumer::Consumer;
pub use error::{HubError, HubResult};
pub use memory::{DataBlock, DataBlockConfig, DataBlockPolicy};
pub use messenger::Messenger;
pub use metrics::{MetricsCounters, MetricsPublisher, MetricsSnapshot};
pub use producer::Producer;
pub use zone::{ZoneRef, ZoneRefMut};
