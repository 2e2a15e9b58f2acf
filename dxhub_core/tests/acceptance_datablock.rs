//! Acceptance tests for the DataBlock ring (§8 end-to-end scenarios 1-3).
//! Single-process: producer and consumer sides are two `DataBlock` handles
//! (create + attach) to the same segment, exercised directly without going
//! through the broker or ZMQ sockets.

use dxhub_core::memory::{DataBlock, DataBlockConfig, DataBlockPolicy};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[test]
fn scenario_1_basic_pipeline_delivers_messages_in_order_with_valid_checksums() {
    let channel = format!("acceptance.basic.{}", std::process::id());
    let config = DataBlockConfig { capacity: 4, slot_bytes: 64, ..Default::default() };
    let producer = Arc::new(DataBlock::create(&channel, config).expect("create"));
    let consumer = Arc::new(DataBlock::attach(&channel).expect("attach"));

    // Capacity 4 < 8 messages, so a Single-reader producer blocks once the
    // ring fills: the reader must run concurrently to drain it, matching
    // the spec's concurrent producer/consumer model rather than a
    // write-all-then-read-all sequence that would time out on message 5.
    let reader = {
        let consumer = Arc::clone(&consumer);
        thread::spawn(move || {
            let mut delivered = Vec::new();
            for _ in 0..8 {
                let guard = consumer.acquire_read(Duration::from_millis(500)).expect("acquire_read");
                assert!(guard.checksum_valid(), "checksum must validate under strict policy");
                delivered.push(String::from_utf8(consumer.slot_bytes_of(&guard).to_vec()).unwrap());
                consumer.release_read(guard).expect("release_read");
            }
            delivered
        })
    };

    for i in 0..8u32 {
        let guard = producer.acquire_write(Duration::from_millis(500)).expect("acquire_write");
        let body = format!("msg-{i}");
        producer.slot_bytes_mut(&guard)[..body.len()].copy_from_slice(body.as_bytes());
        producer.commit(guard, body.len()).expect("commit");
    }

    let delivered = reader.join().expect("reader thread");
    let expected: Vec<String> = (0..8).map(|i| format!("msg-{i}")).collect();
    assert_eq!(delivered, expected);
}

#[test]
fn scenario_2_latest_only_delivers_a_strictly_increasing_subset_ending_at_the_last_commit() {
    let channel = format!("acceptance.latest.{}", std::process::id());
    let config = DataBlockConfig {
        capacity: 4,
        slot_bytes: 16,
        consumer_sync_policy: DataBlockPolicy::LatestOnly,
        ..Default::default()
    };
    let producer = DataBlock::create(&channel, config).expect("create");
    let consumer = DataBlock::attach(&channel).expect("attach");

    for i in 0..100u32 {
        let guard = producer.acquire_write(Duration::from_millis(200)).expect("acquire_write");
        producer.slot_bytes_mut(&guard)[..4].copy_from_slice(&i.to_ne_bytes());
        producer.commit(guard, 4).expect("commit");
    }

    let mut seen = Vec::new();
    loop {
        match consumer.acquire_read(Duration::from_millis(20)) {
            Ok(guard) => {
                let bytes = consumer.slot_bytes_of(&guard);
                let value = u32::from_ne_bytes(bytes[..4].try_into().unwrap());
                seen.push(value);
                consumer.release_read(guard).expect("release_read");
            }
            Err(_) => break,
        }
    }

    assert!(!seen.is_empty(), "consumer should see at least the final commit");
    assert_eq!(*seen.last().unwrap(), 99, "last delivered id must be the final commit");
    for pair in seen.windows(2) {
        assert!(pair[1] > pair[0], "ids delivered to a Latest-only consumer must strictly increase");
    }
    let mut dedup = seen.clone();
    dedup.dedup();
    assert_eq!(seen, dedup, "no duplicate ids");
}

#[test]
fn scenario_3_crashed_writer_slot_is_recovered_and_next_commit_reuses_its_slot_id() {
    let channel = format!("acceptance.recovery.{}", std::process::id());
    let config = DataBlockConfig { capacity: 1, slot_bytes: 32, ..Default::default() };
    let producer = DataBlock::create(&channel, config).expect("create");

    // Fork a child that attaches, acquires the single slot, and crashes
    // without committing or releasing it.
    let child_channel = channel.clone();
    let pid = unsafe { libc::fork() };
    if pid == 0 {
        let child = DataBlock::attach(&child_channel).expect("child attach");
        let guard = child.acquire_write(Duration::from_millis(200)).expect("child acquire_write");
        std::mem::forget(guard); // crash without commit/release
        unsafe { libc::_exit(0) };
    }
    assert!(pid > 0, "fork failed");
    let mut status = 0;
    unsafe { libc::waitpid(pid, &mut status, 0) };

    // Parent: a second acquire must succeed within 500ms, recovering the
    // slot abandoned by the dead child, and the next commit must reuse the
    // slot id that would have come next (the prior commit_index, here 0
    // since nothing committed before the crash).
    let guard = producer.acquire_write(Duration::from_millis(500)).expect("recovered acquire_write");
    producer.slot_bytes_mut(&guard)[..6].copy_from_slice(b"second");
    let slot_id = producer.commit(guard, 6).expect("commit after recovery");
    assert_eq!(slot_id, 0, "commit after recovery reuses the pre-crash commit_index");
}
