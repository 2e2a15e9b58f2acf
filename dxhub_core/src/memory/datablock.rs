//! The shared-memory DataBlock: a single-producer / multi-consumer ring of
//! fixed-stride slots plus one shared flex zone, backed by [`ShmRegion`].
//!
//! Byte layout (see module-level constants for exact offsets):
//!
//! ```text
//! offset 0   : SharedMemoryHeader
//! offset H   : SlotHeader[0] .. SlotHeader[capacity-1]   (metadata, cache-line sized)
//! offset H'  : slot data[0]  .. slot data[capacity-1]    (stride = slot_bytes)
//! offset H'' : flex zone bytes
//! ```
//!
//! Crash tolerance rests entirely on the [`AtomicOwner`]/[`AtomicGuard`]
//! pair: both per-slot ownership and the segment-wide management lock use
//! the same owner-word mechanism, so there is exactly one recovery path to
//! reason about instead of two.

use crate::error::{HubError, HubResult};
use crate::memory::owner::{AtomicGuard, AtomicOwner};
use crate::memory::platform::is_process_running;
use crate::memory::shm_region::ShmRegion;
use blake2::{Blake2s256, Digest};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::thread;
use std::time::{Duration, Instant};

/// `"PLHDB01\0"` — also encodes the header version.
const MAGIC: u64 = u64::from_ne_bytes(*b"PLHDB01\0");

const INIT_ALLOCATED: u8 = 0;
const INIT_MUTEX_READY: u8 = 1;
const INIT_FULLY_INITIALIZED: u8 = 2;

const SLOT_FREE: u8 = 0;
const SLOT_WRITE_LOCKED: u8 = 1;
const SLOT_COMMITTED: u8 = 2;
const SLOT_READ_LOCKED: u8 = 3;

/// Backoff applied while spinning on slot/init-state conditions.
const SPIN_BACKOFF: Duration = Duration::from_micros(50);

/// Bound on the consumer-heartbeat table (§4.3: "consumer periodically
/// updates its heartbeat slot in the DataBlock header"). A fixed-size array
/// rather than a dynamic map, matching the rest of the header's
/// allocate-once-at-creation layout.
const MAX_TRACKED_CONSUMERS: usize = 32;

/// Ring behavior when a consumer falls behind the producer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataBlockPolicy {
    #[serde(rename = "Single_reader")]
    SingleReader,
    #[serde(rename = "Latest_only")]
    LatestOnly,
}

impl DataBlockPolicy {
    fn encode(self) -> u8 {
        match self {
            DataBlockPolicy::SingleReader => 0,
            DataBlockPolicy::LatestOnly => 1,
        }
    }

    fn decode(v: u8) -> Self {
        match v {
            1 => DataBlockPolicy::LatestOnly,
            _ => DataBlockPolicy::SingleReader,
        }
    }
}

/// How strictly slot/flex-zone checksums are enforced on read.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumPolicy {
    Strict,
    Pass,
    Off,
}

impl ChecksumPolicy {
    fn encode(self) -> u8 {
        match self {
            ChecksumPolicy::Strict => 0,
            ChecksumPolicy::Pass => 1,
            ChecksumPolicy::Off => 2,
        }
    }

    fn decode(v: u8) -> Self {
        match v {
            1 => ChecksumPolicy::Pass,
            2 => ChecksumPolicy::Off,
            _ => ChecksumPolicy::Strict,
        }
    }
}

/// Channel-creation configuration for a DataBlock segment.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct DataBlockConfig {
    pub capacity: u32,
    pub slot_bytes: u32,
    pub flex_zone_bytes: u32,
    pub consumer_sync_policy: DataBlockPolicy,
    pub enforce_slot_checksum: ChecksumPolicy,
    pub shared_secret: u64,
}

impl Default for DataBlockConfig {
    fn default() -> Self {
        Self {
            capacity: 8,
            slot_bytes: 256,
            flex_zone_bytes: 0,
            consumer_sync_policy: DataBlockPolicy::SingleReader,
            enforce_slot_checksum: ChecksumPolicy::Strict,
            shared_secret: 0,
        }
    }
}

#[repr(C, align(64))]
struct SharedMemoryHeader {
    magic_number: AtomicU64,
    shared_secret: AtomicU64,
    version: AtomicU32,
    init_state: AtomicU8,
    policy: AtomicU8,
    checksum_policy: AtomicU8,
    _pad0: u8,
    capacity: AtomicU32,
    slot_bytes: AtomicU32,
    flex_zone_bytes: AtomicU32,
    write_index: AtomicU64,
    commit_index: AtomicU64,
    active_consumer_count: AtomicU32,
    _pad1: u32,
    management_owner: AtomicOwner,
    flex_checksum_lock: AtomicOwner,
    flex_checksum: [std::cell::UnsafeCell<u8>; 32],
    flex_checksum_set: AtomicU8,
    consumer_heartbeats: [ConsumerHeartbeatSlot; MAX_TRACKED_CONSUMERS],
}

/// One entry in the header's consumer-heartbeat table: which pid last
/// touched the slot, and when (milliseconds since `UNIX_EPOCH`).
#[repr(C)]
struct ConsumerHeartbeatSlot {
    pid: AtomicU32,
    last_heartbeat_ms: AtomicU64,
}

// SharedMemoryHeader lives in shared memory and is only ever touched through
// atomics or under flex_checksum_lock; safe to share across threads.
unsafe impl Sync for SharedMemoryHeader {}

#[repr(C, align(64))]
struct SlotHeader {
    state: AtomicU8,
    _pad0: [u8; 7],
    owner: AtomicOwner,
    slot_id: AtomicU64,
    committed_len: AtomicU32,
    _pad1: u32,
    checksum: [std::cell::UnsafeCell<u8>; 32],
}

unsafe impl Sync for SlotHeader {}

fn pack_token(pid: u32, generation: u32) -> u64 {
    ((pid as u64) << 32) | generation as u64
}

fn unpack_pid(token: u64) -> u32 {
    (token >> 32) as u32
}

fn next_generation() -> u32 {
    static NEXT: AtomicU32 = AtomicU32::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn blake2_256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Blake2s256::new();
    hasher.update(data);
    let digest = hasher.finalize();
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    out
}

#[derive(Clone, Copy)]
struct Layout {
    slot_meta: usize,
    slot_data: usize,
    flex_zone: usize,
    total: usize,
}

fn align_up(x: usize, align: usize) -> usize {
    (x + align - 1) / align * align
}

fn compute_layout(config: &DataBlockConfig) -> Layout {
    let header = align_up(std::mem::size_of::<SharedMemoryHeader>(), 64);
    let slot_meta = header;
    let slot_meta_size = align_up(
        config.capacity as usize * std::mem::size_of::<SlotHeader>(),
        64,
    );
    let slot_data = slot_meta + slot_meta_size;
    let slot_data_size = align_up(config.capacity as usize * config.slot_bytes as usize, 64);
    let flex_zone = slot_data + slot_data_size;
    let flex_zone_size = align_up(config.flex_zone_bytes as usize, 64);
    let total = flex_zone + flex_zone_size;
    Layout { slot_meta, slot_data, flex_zone, total }
}

/// A cross-process shared-memory segment backing one channel's ring buffer.
///
/// A producer creates one with [`DataBlock::create`]; each consumer attaches
/// with its own [`DataBlock::attach`] call, which carries its own
/// `last_consumed_slot_id` bookkeeping local to that instance.
pub struct DataBlock {
    region: ShmRegion,
    channel: String,
    config: DataBlockConfig,
    layout: Layout,
    is_creator: bool,
    last_consumed: AtomicU64,
}

unsafe impl Send for DataBlock {}
unsafe impl Sync for DataBlock {}

/// Sentinel for "no slot consumed yet".
const NO_SLOT_CONSUMED: u64 = u64::MAX;

impl DataBlock {
    fn segment_name(channel: &str) -> String {
        format!("plh.{channel}.v1")
    }

    /// Run the five-step creation protocol (§4.1): allocate, construct the
    /// management lock in place, initialize slots/flex zone, then publish
    /// `FullyInitialized` last with release ordering.
    pub fn create(channel: &str, config: DataBlockConfig) -> HubResult<Self> {
        if config.capacity == 0 {
            return Err(HubError::Protocol("capacity must be nonzero".into()));
        }
        let layout = compute_layout(&config);
        let name = Self::segment_name(channel);
        let mut region = ShmRegion::create(&name, layout.total)?;

        let header = unsafe { &*(region.as_mut_ptr() as *const SharedMemoryHeader) };
        header.init_state.store(INIT_ALLOCATED, Ordering::Relaxed);

        // management_owner / flex_checksum_lock are zero-initialized by the
        // fresh mapping, which is exactly the "free" state for AtomicOwner.
        header.init_state.store(INIT_MUTEX_READY, Ordering::Relaxed);

        let block = Self {
            region,
            channel: channel.to_string(),
            config,
            layout,
            is_creator: true,
            last_consumed: AtomicU64::new(NO_SLOT_CONSUMED),
        };

        for idx in 0..config.capacity as usize {
            let slot = block.slot_header(idx);
            slot.state.store(SLOT_FREE, Ordering::Relaxed);
            slot.owner.force_clear();
            slot.slot_id.store(0, Ordering::Relaxed);
            slot.committed_len.store(0, Ordering::Relaxed);
        }
        block.flex_zone_mut().fill(0);

        let header = block.header();
        header.capacity.store(config.capacity, Ordering::Relaxed);
        header.slot_bytes.store(config.slot_bytes, Ordering::Relaxed);
        header.flex_zone_bytes.store(config.flex_zone_bytes, Ordering::Relaxed);
        header.policy.store(config.consumer_sync_policy.encode(), Ordering::Relaxed);
        header.checksum_policy.store(config.enforce_slot_checksum.encode(), Ordering::Relaxed);
        header.shared_secret.store(config.shared_secret, Ordering::Relaxed);
        header.version.store(1, Ordering::Relaxed);
        header.magic_number.store(MAGIC, Ordering::Relaxed);
        header.init_state.store(INIT_FULLY_INITIALIZED, Ordering::Release);

        Ok(block)
    }

    /// Attach to an existing segment: poll `init_state` until fully
    /// initialized, validate magic/secret, bump `active_consumer_count`.
    pub fn attach(channel: &str) -> HubResult<Self> {
        Self::attach_checked(channel, None)
    }

    /// Attach, additionally rejecting a segment whose `shared_secret` does
    /// not match `expected_secret`.
    pub fn attach_checked(channel: &str, expected_secret: Option<u64>) -> HubResult<Self> {
        let name = Self::segment_name(channel);
        // First pass: map just enough to read the header and learn capacity/
        // slot_bytes/flex_zone_bytes, then remap (via ShmRegion::open's
        // size_hint) to the full segment size once known.
        let probe_size = align_up(std::mem::size_of::<SharedMemoryHeader>(), 64);
        let mut region = ShmRegion::open(&name, probe_size)?;

        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let header = unsafe { &*(region.as_ptr() as *const SharedMemoryHeader) };
            if header.init_state.load(Ordering::Acquire) == INIT_FULLY_INITIALIZED {
                break;
            }
            if Instant::now() >= deadline {
                return Err(HubError::Timeout);
            }
            thread::sleep(SPIN_BACKOFF);
        }

        let header = unsafe { &*(region.as_ptr() as *const SharedMemoryHeader) };
        if header.magic_number.load(Ordering::Acquire) != MAGIC {
            return Err(HubError::Integrity("bad magic number".into()));
        }
        if let Some(expected) = expected_secret {
            if header.shared_secret.load(Ordering::Acquire) != expected {
                return Err(HubError::Integrity("shared_secret mismatch".into()));
            }
        }

        let config = DataBlockConfig {
            capacity: header.capacity.load(Ordering::Acquire),
            slot_bytes: header.slot_bytes.load(Ordering::Acquire),
            flex_zone_bytes: header.flex_zone_bytes.load(Ordering::Acquire),
            consumer_sync_policy: DataBlockPolicy::decode(header.policy.load(Ordering::Acquire)),
            enforce_slot_checksum: ChecksumPolicy::decode(header.checksum_policy.load(Ordering::Acquire)),
            shared_secret: header.shared_secret.load(Ordering::Acquire),
        };
        let layout = compute_layout(&config);

        // Remap to the full segment now that its true size is known.
        region = ShmRegion::open(&name, layout.total)?;

        let header = unsafe { &*(region.as_ptr() as *const SharedMemoryHeader) };
        header.active_consumer_count.fetch_add(1, Ordering::AcqRel);

        Ok(Self {
            region,
            channel: channel.to_string(),
            config,
            layout,
            is_creator: false,
            last_consumed: AtomicU64::new(NO_SLOT_CONSUMED),
        })
    }

    fn header(&self) -> &SharedMemoryHeader {
        unsafe { &*(self.region.as_ptr() as *const SharedMemoryHeader) }
    }

    fn slot_header(&self, idx: usize) -> &SlotHeader {
        debug_assert!(idx < self.config.capacity as usize);
        let offset = self.layout.slot_meta + idx * std::mem::size_of::<SlotHeader>();
        unsafe { &*(self.region.as_ptr().add(offset) as *const SlotHeader) }
    }

    fn slot_data(&self, idx: usize) -> &[u8] {
        let offset = self.layout.slot_data + idx * self.config.slot_bytes as usize;
        unsafe {
            std::slice::from_raw_parts(self.region.as_ptr().add(offset), self.config.slot_bytes as usize)
        }
    }

    #[allow(clippy::mut_from_ref)]
    fn slot_data_mut(&self, idx: usize) -> &mut [u8] {
        let offset = self.layout.slot_data + idx * self.config.slot_bytes as usize;
        unsafe {
            std::slice::from_raw_parts_mut(
                (self.region.as_ptr() as *mut u8).add(offset),
                self.config.slot_bytes as usize,
            )
        }
    }

    fn flex_zone(&self) -> &[u8] {
        unsafe {
            std::slice::from_raw_parts(
                self.region.as_ptr().add(self.layout.flex_zone),
                self.config.flex_zone_bytes as usize,
            )
        }
    }

    #[allow(clippy::mut_from_ref)]
    fn flex_zone_mut(&self) -> &mut [u8] {
        unsafe {
            std::slice::from_raw_parts_mut(
                (self.region.as_ptr() as *mut u8).add(self.layout.flex_zone),
                self.config.flex_zone_bytes as usize,
            )
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn config(&self) -> DataBlockConfig {
        self.config
    }

    pub fn capacity(&self) -> u32 {
        self.config.capacity
    }

    pub fn slot_bytes(&self) -> u32 {
        self.config.slot_bytes
    }

    pub fn flex_zone_len(&self) -> usize {
        self.config.flex_zone_bytes as usize
    }

    pub fn active_consumer_count(&self) -> u32 {
        self.header().active_consumer_count.load(Ordering::Acquire)
    }

    pub fn is_creator(&self) -> bool {
        self.is_creator
    }

    /// Best-effort recovery of a slot whose holder pid is confirmed dead.
    /// Runs under the management mutex, as required by §4.1.
    fn try_recover_slot(&self, idx: usize) -> bool {
        let mut guard = AtomicGuard::attached(&self.header().management_owner, true);
        if !guard.active() {
            return false; // someone else holds the management mutex; caller retries
        }
        let slot = self.slot_header(idx);
        let state = slot.state.load(Ordering::Acquire);
        let mut recovered = false;
        if state == SLOT_WRITE_LOCKED || state == SLOT_READ_LOCKED {
            let owner_word = slot.owner.load();
            if owner_word != 0 && !is_process_running(unpack_pid(owner_word)) {
                slot.owner.force_clear();
                slot.state.store(SLOT_FREE, Ordering::Release);
                log::warn!(
                    "dxhub: recovered abandoned slot {idx} on channel '{}' (dead pid {})",
                    self.channel,
                    unpack_pid(owner_word)
                );
                recovered = true;
            }
        }
        let _ = guard.release();
        recovered
    }

    /// Acquire the next write slot (§4.1 "Acquire-write").
    pub fn acquire_write(&self, timeout: Duration) -> HubResult<SlotGuard<'_>> {
        let deadline = Instant::now() + timeout;
        let pid = std::process::id();
        loop {
            let idx = (self.header().write_index.load(Ordering::Relaxed) % self.config.capacity as u64) as usize;
            let slot = self.slot_header(idx);
            let state = slot.state.load(Ordering::Acquire);

            if state == SLOT_FREE {
                if slot
                    .state
                    .compare_exchange(SLOT_FREE, SLOT_WRITE_LOCKED, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    let token = pack_token(pid, next_generation());
                    slot.owner_store(token);
                    self.header().write_index.fetch_add(1, Ordering::AcqRel);
                    return Ok(SlotGuard::new_write(self, idx, pid, token));
                }
                continue;
            }

            if state == SLOT_WRITE_LOCKED || state == SLOT_READ_LOCKED {
                let owner_word = slot.owner.load();
                if owner_word != 0 && !is_process_running(unpack_pid(owner_word)) {
                    self.try_recover_slot(idx);
                    continue;
                }
            }

            match self.config.consumer_sync_policy {
                DataBlockPolicy::LatestOnly => {
                    // Force-reclaim: readers are expected to skip forward.
                    let token = pack_token(pid, next_generation());
                    slot.state.store(SLOT_WRITE_LOCKED, Ordering::AcqRel);
                    slot.owner_store(token);
                    self.header().write_index.fetch_add(1, Ordering::AcqRel);
                    return Ok(SlotGuard::new_write(self, idx, pid, token));
                }
                DataBlockPolicy::SingleReader => {
                    if Instant::now() >= deadline {
                        return Err(HubError::Timeout);
                    }
                    thread::sleep(SPIN_BACKOFF);
                }
            }
        }
    }

    /// Commit a previously-acquired write slot: checksum, publish, advance
    /// `commit_index`. Consumes the guard.
    pub fn commit(&self, guard: SlotGuard<'_>, len: usize) -> HubResult<u64> {
        if len > self.config.slot_bytes as usize {
            return Err(HubError::SizeOverflow { slot_bytes: self.config.slot_bytes as usize, got: len });
        }
        let idx = guard.index;
        let slot = self.slot_header(idx);
        let checksum = blake2_256(&self.slot_data(idx)[..len]);
        slot.checksum_store(checksum);
        slot.committed_len.store(len as u32, Ordering::Relaxed);

        let slot_id = self.header().commit_index.fetch_add(1, Ordering::AcqRel);
        slot.slot_id.store(slot_id, Ordering::Relaxed);
        slot.owner.force_clear();
        slot.state.store(SLOT_COMMITTED, Ordering::Release);

        guard.disarm();
        Ok(slot_id)
    }

    /// Discard a previously-acquired write slot without committing it,
    /// returning it to Free.
    pub fn discard_write(&self, guard: SlotGuard<'_>) {
        let slot = self.slot_header(guard.index);
        slot.owner.force_clear();
        slot.state.store(SLOT_FREE, Ordering::Release);
        guard.disarm();
    }

    /// Acquire the next readable slot for this attach instance (§4.1
    /// "Acquire-read"), honoring the configured ring policy.
    pub fn acquire_read(&self, timeout: Duration) -> HubResult<SlotGuard<'_>> {
        let deadline = Instant::now() + timeout;
        let pid = std::process::id();
        let capacity = self.config.capacity as u64;

        loop {
            let last = self.last_consumed.load(Ordering::Acquire);
            let mut candidate = if last == NO_SLOT_CONSUMED { 0 } else { last + 1 };
            let commit_idx = self.header().commit_index.load(Ordering::Acquire);

            if self.config.consumer_sync_policy == DataBlockPolicy::LatestOnly
                && commit_idx.saturating_sub(candidate) > capacity
            {
                candidate = commit_idx.saturating_sub(1);
            }

            if candidate >= commit_idx {
                if Instant::now() >= deadline {
                    return Err(HubError::Timeout);
                }
                thread::sleep(SPIN_BACKOFF);
                continue;
            }

            let idx = (candidate % capacity) as usize;
            let slot = self.slot_header(idx);
            if slot.slot_id.load(Ordering::Acquire) != candidate || slot.state.load(Ordering::Acquire) != SLOT_COMMITTED {
                // Producer lapped us since we read commit_index; re-evaluate.
                continue;
            }

            if slot
                .state
                .compare_exchange(SLOT_COMMITTED, SLOT_READ_LOCKED, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                continue;
            }

            let token = pack_token(pid, next_generation());
            slot.owner_store(token);
            self.last_consumed.store(candidate, Ordering::Release);

            if self.config.enforce_slot_checksum != ChecksumPolicy::Off {
                let len = slot.committed_len.load(Ordering::Acquire) as usize;
                let expected = slot.checksum_load();
                let actual = blake2_256(&self.slot_data(idx)[..len]);
                if actual != expected {
                    let guard = SlotGuard::new_read(self, idx, pid, token, false);
                    if self.config.enforce_slot_checksum == ChecksumPolicy::Strict {
                        self.release_read(guard)?;
                        return Err(HubError::ChecksumMismatch { channel: self.channel.clone() });
                    }
                    return Ok(guard);
                }
            }

            return Ok(SlotGuard::new_read(self, idx, pid, token, true));
        }
    }

    /// Release a previously-acquired read slot back to Free.
    pub fn release_read(&self, guard: SlotGuard<'_>) -> HubResult<()> {
        let slot = self.slot_header(guard.index);
        let owner_word = slot.owner.load();
        if owner_word != pack_token(guard.pid, guard.generation()) {
            log::error!(
                "dxhub: release_read pid/token mismatch on channel '{}' slot {}",
                self.channel,
                guard.index
            );
            guard.disarm();
            return Err(HubError::Internal("slot release: holder mismatch".into()));
        }
        slot.owner.force_clear();
        slot.state.store(SLOT_FREE, Ordering::Release);
        guard.disarm();
        Ok(())
    }

    /// Read-only access to a previously-acquired slot's committed bytes.
    pub fn slot_bytes_of(&self, guard: &SlotGuard<'_>) -> &[u8] {
        let slot = self.slot_header(guard.index);
        let len = slot.committed_len.load(Ordering::Acquire) as usize;
        &self.slot_data(guard.index)[..len]
    }

    /// Mutable access to a write-locked slot's buffer, for the caller to
    /// fill before calling [`DataBlock::commit`].
    pub fn slot_bytes_mut(&self, guard: &SlotGuard<'_>) -> &mut [u8] {
        self.slot_data_mut(guard.index)
    }

    /// Overwrite the flex zone and recompute its stored digest.
    pub fn flex_zone_write(&self, bytes: &[u8]) -> HubResult<()> {
        if bytes.len() > self.config.flex_zone_bytes as usize {
            return Err(HubError::SizeOverflow {
                slot_bytes: self.config.flex_zone_bytes as usize,
                got: bytes.len(),
            });
        }
        self.flex_zone_mut()[..bytes.len()].copy_from_slice(bytes);
        let digest = blake2_256(self.flex_zone());

        let mut lock = AtomicGuard::attached(&self.header().flex_checksum_lock, false);
        while !lock.acquire() {
            thread::yield_now();
        }
        for (cell, byte) in self.header().flex_checksum.iter().zip(digest.iter()) {
            unsafe { *cell.get() = *byte };
        }
        self.header().flex_checksum_set.store(1, Ordering::Release);
        let _ = lock.release();
        Ok(())
    }

    /// Snapshot of the flex zone's current bytes.
    pub fn flex_zone_read(&self) -> Vec<u8> {
        self.flex_zone().to_vec()
    }

    /// Record a liveness heartbeat for the calling process in the header's
    /// consumer-heartbeat table (§4.3), reusing an existing entry for this
    /// pid if present, else claiming the first free (`pid == 0`) slot.
    /// Silently drops the heartbeat if the table is full — the table is a
    /// best-effort diagnostic surface, not a correctness dependency.
    pub fn update_heartbeat(&self) {
        let pid = std::process::id();
        let now = now_millis();
        let table = &self.header().consumer_heartbeats;
        for slot in table {
            let existing = slot.pid.load(Ordering::Acquire);
            if existing == pid {
                slot.last_heartbeat_ms.store(now, Ordering::Release);
                return;
            }
        }
        for slot in table {
            if slot.pid.compare_exchange(0, pid, Ordering::AcqRel, Ordering::Acquire).is_ok() {
                slot.last_heartbeat_ms.store(now, Ordering::Release);
                return;
            }
        }
        log::warn!("dxhub: consumer heartbeat table full on channel '{}'", self.channel);
    }

    /// Snapshot of `(pid, last_heartbeat_ms)` for every occupied heartbeat
    /// slot, for the producer's broker-facing side to report up on demand.
    pub fn consumer_heartbeats(&self) -> Vec<(u32, u64)> {
        self.header()
            .consumer_heartbeats
            .iter()
            .filter_map(|slot| {
                let pid = slot.pid.load(Ordering::Acquire);
                (pid != 0).then(|| (pid, slot.last_heartbeat_ms.load(Ordering::Acquire)))
            })
            .collect()
    }

    /// Stored BLAKE2s-256 digest of the flex zone at last write, if any.
    pub fn flex_zone_checksum(&self) -> Option<[u8; 32]> {
        if self.header().flex_checksum_set.load(Ordering::Acquire) == 0 {
            return None;
        }
        let mut lock = AtomicGuard::attached(&self.header().flex_checksum_lock, false);
        while !lock.acquire() {
            thread::yield_now();
        }
        let mut out = [0u8; 32];
        for (i, cell) in self.header().flex_checksum.iter().enumerate() {
            out[i] = unsafe { *cell.get() };
        }
        let _ = lock.release();
        Some(out)
    }
}

impl SlotHeader {
    fn owner_store(&self, token: u64) {
        // Only called by the thread that just won the Free->WriteLocked (or
        // Committed->ReadLocked) CAS, so this is the sole writer.
        self.owner.publish(token);
    }

    fn checksum_store(&self, bytes: [u8; 32]) {
        for (cell, byte) in self.checksum.iter().zip(bytes.iter()) {
            unsafe { *cell.get() = *byte };
        }
    }

    fn checksum_load(&self) -> [u8; 32] {
        let mut out = [0u8; 32];
        for (i, cell) in self.checksum.iter().enumerate() {
            out[i] = unsafe { *cell.get() };
        }
        out
    }
}

/// RAII handle to an acquired slot. Dropping without committing/releasing
/// is a best-effort no-op recovery point for the *next* acquirer — the slot
/// is left in its locked state and will be reclaimed once this process's
/// death is observed, exactly like any other abandoned slot.
pub struct SlotGuard<'a> {
    _block: &'a DataBlock,
    index: usize,
    pid: u32,
    token: u64,
    is_write: bool,
    checksum_valid: bool,
    armed: std::cell::Cell<bool>,
}

impl<'a> SlotGuard<'a> {
    fn new_write(block: &'a DataBlock, index: usize, pid: u32, token: u64) -> Self {
        Self { _block: block, index, pid, token, is_write: true, checksum_valid: true, armed: std::cell::Cell::new(true) }
    }

    fn new_read(block: &'a DataBlock, index: usize, pid: u32, token: u64, checksum_valid: bool) -> Self {
        Self { _block: block, index, pid, token, is_write: false, checksum_valid, armed: std::cell::Cell::new(true) }
    }

    fn generation(&self) -> u32 {
        (self.token & 0xffff_ffff) as u32
    }

    fn disarm(&self) {
        self.armed.set(false);
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn is_write(&self) -> bool {
        self.is_write
    }

    /// Whether the checksum validated when this was acquired for read
    /// (always `true` for write guards and when the channel's checksum
    /// policy is `Off`).
    pub fn checksum_valid(&self) -> bool {
        self.checksum_valid
    }
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        // Intentionally a no-op beyond logging: an undisarmed guard means
        // the caller neither committed/discarded nor released, which is
        // only safe because recovery treats a stuck slot as reclaimable
        // once the holder pid is confirmed dead. We do not force-release
        // here, since this thread may still be alive and legitimately
        // retain the slot elsewhere (e.g. guard moved into a job closure).
        if self.armed.get() {
            log::debug!(
                "dxhub: SlotGuard for slot {} dropped without commit/release (pid {})",
                self.index,
                self.pid
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_channel(tag: &str) -> String {
        format!("test.datablock.{tag}.{}", std::process::id())
    }

    #[test]
    fn create_then_attach_round_trips_config() {
        let channel = unique_channel("roundtrip");
        let config = DataBlockConfig { capacity: 4, slot_bytes: 64, flex_zone_bytes: 16, ..Default::default() };
        let producer = DataBlock::create(&channel, config).expect("create");
        let consumer = DataBlock::attach(&channel).expect("attach");
        assert_eq!(consumer.capacity(), 4);
        assert_eq!(consumer.slot_bytes(), 64);
        assert_eq!(consumer.flex_zone_len(), 16);
        assert_eq!(producer.active_consumer_count(), 1);
    }

    #[test]
    fn basic_write_then_read_round_trips_bytes() {
        let channel = unique_channel("basic");
        let config = DataBlockConfig { capacity: 4, slot_bytes: 64, ..Default::default() };
        let producer = DataBlock::create(&channel, config).expect("create");
        let consumer = DataBlock::attach(&channel).expect("attach");

        let guard = producer.acquire_write(Duration::from_millis(100)).expect("acquire_write");
        producer.slot_bytes_mut(&guard)[..5].copy_from_slice(b"msg-0");
        let slot_id = producer.commit(guard, 5).expect("commit");
        assert_eq!(slot_id, 0);

        let read = consumer.acquire_read(Duration::from_millis(100)).expect("acquire_read");
        assert!(read.checksum_valid());
        assert_eq!(consumer.slot_bytes_of(&read), b"msg-0");
        consumer.release_read(read).expect("release_read");
    }

    #[test]
    fn write_exceeding_slot_bytes_is_rejected() {
        let channel = unique_channel("overflow");
        let config = DataBlockConfig { capacity: 2, slot_bytes: 4, ..Default::default() };
        let producer = DataBlock::create(&channel, config).expect("create");
        let guard = producer.acquire_write(Duration::from_millis(100)).expect("acquire_write");
        let err = producer.commit(guard, 5).unwrap_err();
        assert!(matches!(err, HubError::SizeOverflow { slot_bytes: 4, got: 5 }));
    }

    #[test]
    fn write_of_exactly_slot_bytes_is_accepted() {
        let channel = unique_channel("exact_fit");
        let config = DataBlockConfig { capacity: 2, slot_bytes: 4, ..Default::default() };
        let producer = DataBlock::create(&channel, config).expect("create");
        let guard = producer.acquire_write(Duration::from_millis(100)).expect("acquire_write");
        producer.slot_bytes_mut(&guard).copy_from_slice(b"abcd");
        let slot_id = producer.commit(guard, 4).expect("commit exactly slot_bytes");
        assert_eq!(slot_id, 0);
    }

    #[test]
    fn capacity_one_latest_only_always_delivers_most_recent_commit() {
        let channel = unique_channel("cap1_latest");
        let config = DataBlockConfig {
            capacity: 1,
            slot_bytes: 4,
            consumer_sync_policy: DataBlockPolicy::LatestOnly,
            ..Default::default()
        };
        let producer = DataBlock::create(&channel, config).expect("create");
        let consumer = DataBlock::attach(&channel).expect("attach");

        for i in 0..10u32 {
            let guard = producer.acquire_write(Duration::from_millis(100)).expect("acquire_write");
            producer.slot_bytes_mut(&guard).copy_from_slice(&i.to_ne_bytes());
            producer.commit(guard, 4).expect("commit");
        }

        let read = consumer.acquire_read(Duration::from_millis(100)).expect("acquire_read");
        let value = u32::from_ne_bytes(consumer.slot_bytes_of(&read).try_into().unwrap());
        assert_eq!(value, 9, "a single-slot Latest-only ring must always surface the newest commit");
        consumer.release_read(read).expect("release_read");
    }

    #[test]
    fn latest_only_policy_skips_to_newest_commit() {
        let channel = unique_channel("latest");
        let config = DataBlockConfig {
            capacity: 4,
            slot_bytes: 16,
            consumer_sync_policy: DataBlockPolicy::LatestOnly,
            ..Default::default()
        };
        let producer = DataBlock::create(&channel, config).expect("create");
        let consumer = DataBlock::attach(&channel).expect("attach");

        for i in 0..20u32 {
            let guard = producer.acquire_write(Duration::from_millis(100)).expect("acquire_write");
            let bytes = i.to_ne_bytes();
            producer.slot_bytes_mut(&guard)[..4].copy_from_slice(&bytes);
            producer.commit(guard, 4).expect("commit");
        }

        let read = consumer.acquire_read(Duration::from_millis(100)).expect("acquire_read");
        let bytes = consumer.slot_bytes_of(&read);
        let value = u32::from_ne_bytes(bytes[..4].try_into().unwrap());
        assert_eq!(value, 19);
        consumer.release_read(read).expect("release_read");
    }

    #[test]
    fn flex_zone_write_updates_checksum() {
        let channel = unique_channel("flex");
        let config = DataBlockConfig { capacity: 2, slot_bytes: 8, flex_zone_bytes: 32, ..Default::default() };
        let producer = DataBlock::create(&channel, config).expect("create");
        assert!(producer.flex_zone_checksum().is_none());
        producer.flex_zone_write(b"hello").expect("flex_zone_write");
        let checksum = producer.flex_zone_checksum().expect("checksum set");
        assert_eq!(checksum, blake2_256(&producer.flex_zone_read()));
    }

    #[test]
    fn crashed_writer_slot_is_recovered() {
        let channel = unique_channel("recovery");
        let config = DataBlockConfig { capacity: 1, slot_bytes: 8, ..Default::default() };
        let producer = DataBlock::create(&channel, config).expect("create");

        // Simulate a writer that acquired the slot and then vanished
        // without committing or releasing, by forging a stale owner word
        // for a pid that cannot possibly be alive.
        let dead_pid = 999_999u32;
        let slot = producer.slot_header(0);
        slot.state.store(SLOT_WRITE_LOCKED, Ordering::Release);
        slot.owner_store(pack_token(dead_pid, 1));

        let guard = producer.acquire_write(Duration::from_millis(500)).expect("acquire_write after recovery");
        assert_eq!(guard.index(), 0);
    }

    #[test]
    fn heartbeat_updates_are_recorded_per_pid() {
        let channel = unique_channel("heartbeat");
        let config = DataBlockConfig { capacity: 1, slot_bytes: 8, ..Default::default() };
        let block = DataBlock::create(&channel, config).expect("create");

        assert!(block.consumer_heartbeats().is_empty());
        block.update_heartbeat();
        let heartbeats = block.consumer_heartbeats();
        assert_eq!(heartbeats.len(), 1);
        assert_eq!(heartbeats[0].0, std::process::id());

        let first_ts = heartbeats[0].1;
        block.update_heartbeat();
        let heartbeats = block.consumer_heartbeats();
        assert_eq!(heartbeats.len(), 1, "repeated heartbeats from the same pid reuse their slot");
        assert!(heartbeats[0].1 >= first_ts);
    }
}
