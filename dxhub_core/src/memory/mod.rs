//! # Shared memory primitives
//!
//! - **ShmRegion**: raw cross-process memory region (platform-specific mapping)
//! - **DataBlock**: the ring-of-slots-plus-flex-zone segment built on top of it
//!
//! ## Memory Safety
//!
//! All memory operations maintain Rust's safety guarantees through careful
//! use of lifetime management and atomic operations.

pub mod datablock;
pub mod owner;
pub mod platform;
pub mod shm_region;

pub use datablock::{ChecksumPolicy, DataBlock, DataBlockConfig, DataBlockPolicy, SlotGuard};
pub use owner::{AtomicGuard, AtomicOwner};
pub use platform::{is_process_running, platform_name};
pub use shm_region::ShmRegion;
