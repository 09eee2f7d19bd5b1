/*
Copyright 2026  The Hyperlight Authors.

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

    http://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

use vring::{
    Features, MemOps, MemRegion, NoIndirect, QueueState, RingError, Segment, VirtqError,
    Virtqueue,
};

mod common;
use common::{Harness, KickCounter, config, guest_memory};

#[test]
fn request_response_round_trip() {
    let mut h = Harness::new(8, Features::empty());
    let req = h.request(0, b"ping");
    let resp = h.slot(1);

    let head = h.queue.add_buffer(&[req], &[resp], 42).unwrap();
    assert_eq!(h.queue.state(), QueueState::Active);
    assert!(h.queue.kick().unwrap());
    assert_eq!(h.kicks(), 1);

    let chain = h.device.pop().unwrap().unwrap();
    assert_eq!(chain.head, head);
    assert!(!chain.indirect);
    assert_eq!(h.device.read_chain(&chain).unwrap(), b"ping");
    assert_eq!(chain.writable, vec![resp]);

    assert_eq!(h.device.complete(&chain, b"pong!").unwrap(), 5);
    assert!(h.device.signal().unwrap());

    let done = h.queue.reclaim().unwrap().unwrap();
    assert_eq!(done.cookie, 42);
    assert_eq!(done.head, head);
    assert_eq!(done.written, 5);
    assert_eq!(h.mem.read_bytes(resp.addr, 5).unwrap(), b"pong!");

    assert!(h.queue.reclaim().unwrap().is_none());
    assert_eq!(h.queue.num_free(), 8);
    assert_eq!(h.queue.num_inflight(), 0);
}

#[test]
fn completions_follow_device_order() {
    let mut h = Harness::new(8, Features::empty());
    for cookie in 0..3u32 {
        let seg = h.slot(cookie as u64);
        h.queue.add_buffer(&[seg], &[], cookie).unwrap();
    }
    h.queue.kick().unwrap();

    let chains = h.device.pop_all().unwrap();
    assert_eq!(chains.len(), 3);
    for i in [2usize, 0, 1] {
        h.device.complete(&chains[i], &[]).unwrap();
    }

    assert_eq!(h.reclaim_all(), vec![2, 0, 1]);
}

#[test]
fn device_sees_segments_in_order() {
    let mut h = Harness::new(8, Features::empty());
    let out = [h.slot(0), h.slot(1)];
    let inp = [h.slot(2), h.slot(3), h.slot(4)];

    h.queue.add_buffer(&out, &inp, 7).unwrap();
    assert_eq!(h.queue.num_free(), 3);

    let chain = h.device.pop().unwrap().unwrap();
    assert_eq!(chain.readable, out);
    assert_eq!(chain.writable, inp);

    // reply spills across the first two writable segments
    let reply = vec![0xAB; 300];
    assert_eq!(h.device.complete(&chain, &reply).unwrap(), 300);
    assert_eq!(h.mem.read_bytes(inp[1].addr, 44).unwrap(), vec![0xAB; 44]);

    assert_eq!(h.queue.reclaim().unwrap().unwrap().written, 300);
    assert_eq!(h.queue.num_free(), 8);
}

#[test]
fn full_queue_is_reported_and_recovers() {
    let mut h = Harness::new(4, Features::empty());
    for cookie in 0..4u32 {
        let seg = h.slot(cookie as u64);
        h.queue.add_buffer(&[seg], &[], cookie).unwrap();
    }
    h.queue.kick().unwrap();

    let seg = h.slot(9);
    assert_eq!(
        h.queue.add_buffer(&[seg], &[], 9),
        Err(VirtqError::QueueFull)
    );
    assert_eq!(h.queue.num_free(), 0);
    assert_eq!(h.queue.num_inflight(), 4);

    // device finishes one, freeing a slot
    let chain = h.device.pop().unwrap().unwrap();
    h.device.complete(&chain, &[]).unwrap();
    assert_eq!(h.reclaim_all(), vec![0]);

    h.queue.add_buffer(&[seg], &[], 9).unwrap();
    assert_eq!(h.device.pending().unwrap(), 4);
}

#[test]
fn chain_longer_than_ring_is_rejected() {
    let mut h = Harness::new(4, Features::empty());
    let segs: Vec<Segment> = (0..5).map(|i| h.slot(i)).collect();

    assert_eq!(
        h.queue.add_buffer(&segs, &[], 0),
        Err(VirtqError::QueueFull)
    );
    assert_eq!(h.queue.num_free(), 4);
    assert_eq!(h.queue.state(), QueueState::Created);
}

#[test]
fn indirect_chain_takes_one_descriptor() {
    let mut h = Harness::indirect(4, Features::EVENT_IDX);
    let free_before = h.queue.pool().free_bytes();

    let out = [h.slot(0)];
    let inp = [h.slot(1), h.slot(2)];
    h.queue.add_buffer(&out, &inp, 5).unwrap();
    assert_eq!(h.queue.num_free(), 3);

    let chain = h.device.pop().unwrap().unwrap();
    assert!(chain.indirect);
    assert_eq!(chain.readable, out);
    assert_eq!(chain.writable, inp);

    h.device.complete(&chain, b"ok").unwrap();
    let done = h.queue.reclaim().unwrap().unwrap();
    assert_eq!(done.cookie, 5);
    assert_eq!(h.queue.num_free(), 4);
    assert_eq!(h.queue.pool().free_bytes(), free_before);
}

#[test]
fn indirect_lets_long_chains_fit_small_rings() {
    let mut h = Harness::indirect(2, Features::empty());
    let segs: Vec<Segment> = (0..6).map(|i| h.slot(i)).collect();

    h.queue.add_buffer(&segs[..3], &segs[3..], 1).unwrap();
    h.queue.add_buffer(&segs[..3], &segs[3..], 2).unwrap();
    assert_eq!(h.queue.num_free(), 0);

    assert_eq!(h.serve_all(b""), 2);
    assert_eq!(h.reclaim_all(), vec![1, 2]);
}

#[test]
fn single_segment_stays_direct_with_indirect_negotiated() {
    let mut h = Harness::indirect(4, Features::empty());
    let seg = h.slot(0);
    h.queue.add_buffer(&[seg], &[], 1).unwrap();

    let chain = h.device.pop().unwrap().unwrap();
    assert!(!chain.indirect);
}

#[test]
fn long_run_wraps_every_index() {
    const ROUNDS: u32 = 70_000;
    let mut h = Harness::new(8, Features::EVENT_IDX);

    for i in 0..ROUNDS {
        let seg = h.slot(i as u64);
        h.queue.add_buffer(&[], &[seg], i).unwrap();
        assert!(h.queue.kick().unwrap());

        let chain = h.device.pop().unwrap().unwrap();
        h.device.set_avail_event(h.device.last_avail()).unwrap();
        h.device.complete(&chain, &i.to_le_bytes()).unwrap();
        assert!(h.device.signal().unwrap());

        let done = h.queue.reclaim().unwrap().unwrap();
        assert_eq!(done.cookie, i);
        assert_eq!(h.mem.read_bytes(seg.addr, 4).unwrap(), i.to_le_bytes());
    }

    assert_eq!(h.kicks(), ROUNDS as usize);
    assert_eq!(h.device.interrupts(), ROUNDS as usize);
    assert_eq!(h.device.last_avail(), (ROUNDS % 65536) as u16);
    assert_eq!(h.queue.num_free(), 8);
}

#[test]
fn avail_event_limits_kicks() {
    let mut h = Harness::new(8, Features::EVENT_IDX);
    h.device.set_avail_event(5).unwrap();

    let mut fired = Vec::new();
    for i in 0..8u32 {
        let seg = h.slot(i as u64);
        h.queue.add_buffer(&[seg], &[], i).unwrap();
        fired.push(h.queue.kick().unwrap());
    }

    // only the kick publishing entry 5 crosses the event index
    let expected: Vec<bool> = (0..8).map(|i| i == 5).collect();
    assert_eq!(fired, expected);
    assert_eq!(h.kicks(), 1);
}

#[test]
fn batched_kick_covers_event_in_window() {
    let mut h = Harness::new(8, Features::EVENT_IDX);
    h.device.set_avail_event(2).unwrap();

    for i in 0..4u32 {
        let seg = h.slot(i as u64);
        h.queue.add_buffer(&[seg], &[], i).unwrap();
    }
    assert!(h.queue.kick().unwrap());
    assert!(!h.queue.kick().unwrap());
}

#[test]
fn no_notify_suppresses_kicks() {
    let mut h = Harness::new(8, Features::empty());
    h.device.set_no_notify(true).unwrap();

    let seg = h.slot(0);
    h.queue.add_buffer(&[seg], &[], 0).unwrap();
    assert!(!h.queue.kick().unwrap());

    h.device.set_no_notify(false).unwrap();
    h.queue.add_buffer(&[seg], &[], 1).unwrap();
    assert!(h.queue.kick().unwrap());
    assert_eq!(h.kicks(), 1);
}

#[test]
fn disabled_interrupts_are_not_raised() {
    let mut h = Harness::new(8, Features::empty());
    assert!(!h.queue.disable_interrupts().unwrap());
    assert!(h.device.interrupts_suppressed().unwrap());

    let seg = h.slot(0);
    h.queue.add_buffer(&[], &[seg], 0).unwrap();
    h.serve_all(b"x");
    assert!(!h.device.signal().unwrap());

    // completion raced the enable: caller must drain again
    assert!(h.queue.enable_interrupts().unwrap());
    assert!(!h.device.interrupts_suppressed().unwrap());
    assert_eq!(h.reclaim_all(), vec![0]);
    assert!(!h.queue.enable_interrupts().unwrap());
}

#[test]
fn interrupt_handler_loop_drains_everything() {
    let mut h = Harness::new(16, Features::EVENT_IDX);
    for i in 0..10u32 {
        let seg = h.slot(i as u64);
        h.queue.add_buffer(&[], &[seg], i).unwrap();
    }
    h.queue.kick().unwrap();

    let chains = h.device.pop_all().unwrap();
    for c in &chains[..6] {
        h.device.complete(c, &[]).unwrap();
    }

    h.queue.disable_interrupts().unwrap();
    let mut seen = Vec::new();
    let mut pass = 0;
    loop {
        while let Some(c) = h.queue.reclaim().unwrap() {
            seen.push(c.cookie);
        }
        // the device finishes the rest while the first pass runs
        if pass == 0 {
            for c in &chains[6..] {
                h.device.complete(c, &[]).unwrap();
            }
        }
        pass += 1;
        if !h.queue.enable_interrupts().unwrap() {
            break;
        }
        h.queue.disable_interrupts().unwrap();
    }

    assert_eq!(seen, (0..10).collect::<Vec<_>>());
    assert_eq!(pass, 2);
    assert_eq!(h.device.used_event().unwrap(), Some(10));
}

#[test]
fn delayed_interrupt_waits_for_most_buffers() {
    let mut h = Harness::new(8, Features::EVENT_IDX);
    for i in 0..8u32 {
        let seg = h.slot(i as u64);
        h.queue.add_buffer(&[], &[seg], i).unwrap();
    }
    h.queue.kick().unwrap();

    h.queue.disable_interrupts().unwrap();
    assert!(!h.queue.enable_interrupts_delayed().unwrap());
    assert_eq!(h.device.used_event().unwrap(), Some(6));

    let chains = h.device.pop_all().unwrap();
    for c in &chains[..6] {
        h.device.complete(c, &[]).unwrap();
        assert!(!h.device.signal().unwrap());
    }
    h.device.complete(&chains[6], &[]).unwrap();
    assert!(h.device.signal().unwrap());
    assert_eq!(h.device.interrupts(), 1);
}

#[test]
fn used_event_tracks_consumer() {
    let mut h = Harness::new(8, Features::EVENT_IDX);
    for i in 0..3u32 {
        let seg = h.slot(i as u64);
        h.queue.add_buffer(&[], &[seg], i).unwrap();
    }
    h.serve_all(&[]);
    h.reclaim_all();
    assert_eq!(h.device.used_event().unwrap(), Some(3));
}

#[test]
fn bad_used_id_breaks_queue_until_reset() {
    let mut h = Harness::new(4, Features::empty());
    for i in 0..2u32 {
        let seg = h.slot(i as u64);
        h.queue.add_buffer(&[seg], &[], i).unwrap();
    }
    h.device.pop_all().unwrap();

    // id 3 was never handed out
    h.device.push_used(3, 0).unwrap();
    assert_eq!(
        h.queue.reclaim(),
        Err(VirtqError::Ring(RingError::BadUsedEntry(3)))
    );
    assert!(h.queue.is_broken());
    assert_eq!(h.queue.reclaim(), Err(VirtqError::BrokenQueue));

    let seg = h.slot(5);
    assert_eq!(
        h.queue.add_buffer(&[seg], &[], 5),
        Err(VirtqError::BrokenQueue)
    );
    assert_eq!(h.queue.reset(), Err(VirtqError::ChainsOutstanding(2)));

    // device reset, then the driver takes its chains back
    h.device.reset();
    h.queue.begin_drain();
    let mut detached = Vec::new();
    while h.queue.state() == QueueState::Draining {
        detached.extend(h.queue.detach_unused().unwrap());
    }
    detached.sort();
    assert_eq!(detached, vec![0, 1]);
    assert_eq!(h.queue.state(), QueueState::Destroyed);

    h.queue.reset().unwrap();
    assert!(!h.queue.is_broken());
    assert_eq!(h.queue.state(), QueueState::Created);
    assert_eq!(h.queue.num_free(), 4);

    h.queue.add_buffer(&[seg], &[], 5).unwrap();
    h.serve_all(&[]);
    assert_eq!(h.reclaim_all(), vec![5]);
}

#[test]
fn runaway_used_index_breaks_queue() {
    let mut h = Harness::new(4, Features::empty());
    let seg = h.slot(0);
    h.queue.add_buffer(&[seg], &[], 0).unwrap();

    h.device.force_used_idx(3).unwrap();
    assert_eq!(
        h.queue.reclaim(),
        Err(VirtqError::Ring(RingError::BadUsedIndex(3)))
    );
    assert!(h.queue.is_broken());
}

#[test]
fn repeated_completion_of_same_head_breaks_queue() {
    let mut h = Harness::new(4, Features::empty());
    let seg = h.slot(0);
    let head = h.queue.add_buffer(&[seg], &[], 0).unwrap();
    h.queue.add_buffer(&[seg], &[], 1).unwrap();

    h.device.pop_all().unwrap();
    h.device.push_used(head as u32, 0).unwrap();
    h.device.push_used(head as u32, 0).unwrap();

    assert_eq!(h.queue.reclaim().unwrap().unwrap().cookie, 0);
    assert!(h.queue.reclaim().is_err());
    assert!(h.queue.is_broken());
}

#[test]
fn drain_finishes_when_last_chain_returns() {
    let mut h = Harness::new(8, Features::empty());
    for i in 0..3u32 {
        let seg = h.slot(i as u64);
        h.queue.add_buffer(&[seg], &[], i).unwrap();
    }

    h.queue.begin_drain();
    assert_eq!(h.queue.state(), QueueState::Draining);
    let seg = h.slot(4);
    assert_eq!(
        h.queue.add_buffer(&[seg], &[], 4),
        Err(VirtqError::BrokenQueue)
    );

    h.serve_all(&[]);
    for cookie in 0..3 {
        assert_eq!(h.queue.state(), QueueState::Draining);
        assert_eq!(h.queue.reclaim().unwrap().unwrap().cookie, cookie);
    }
    assert_eq!(h.queue.state(), QueueState::Destroyed);
    assert_eq!(h.queue.reclaim(), Err(VirtqError::BrokenQueue));
    h.queue.destroy().unwrap();
}

#[test]
fn destroy_refuses_outstanding_chains() {
    let mut h = Harness::new(8, Features::empty());
    let seg = h.slot(0);
    h.queue.add_buffer(&[seg], &[], 0).unwrap();

    assert_eq!(h.queue.destroy(), Err(VirtqError::ChainsOutstanding(1)));
    assert_eq!(h.queue.state(), QueueState::Active);

    h.serve_all(&[]);
    h.reclaim_all();
    h.queue.destroy().unwrap();
    h.queue.destroy().unwrap();
    assert_eq!(h.queue.kick(), Err(VirtqError::BrokenQueue));
}

#[test]
fn detach_needs_draining() {
    let mut h = Harness::new(8, Features::empty());
    assert_eq!(h.queue.detach_unused(), Err(VirtqError::NotDraining));
}

#[test]
fn create_rejects_bad_regions() {
    let (mem, region, _, _) = guest_memory(8, Features::empty());

    let short = MemRegion::new(region.base, region.len - 1);
    let r = Virtqueue::<u32, _, _, _>::create(
        config(8, Features::empty()),
        short,
        mem.clone(),
        KickCounter::default(),
        NoIndirect,
    );
    assert!(matches!(r, Err(VirtqError::ShortBuffer { .. })));

    let shifted = MemRegion::new(region.base + 16, region.len);
    let r = Virtqueue::<u32, _, _, _>::create(
        config(8, Features::empty()),
        shifted,
        mem,
        KickCounter::default(),
        NoIndirect,
    );
    assert!(matches!(r, Err(VirtqError::MisalignedRegion(_))));
}

#[test]
fn create_zeroes_stale_ring_memory() {
    let (mem, region, _, _) = guest_memory(8, Features::EVENT_IDX);
    mem.write_bytes(region.base, &vec![0xFF; region.len]).unwrap();

    let q = Virtqueue::<u32, _, _, _>::create(
        config(8, Features::EVENT_IDX),
        region,
        mem.clone(),
        KickCounter::default(),
        NoIndirect,
    )
    .unwrap();

    let layout = q.layout();
    assert_eq!(mem.load_acquire(layout.avail_idx_addr()).unwrap(), 0);
    assert_eq!(mem.load_acquire(layout.used_idx_addr()).unwrap(), 0);
    assert_eq!(mem.load_acquire(layout.avail_flags_addr()).unwrap(), 0);
}

#[test]
fn size_four_single_buffer_example() {
    let mut h = Harness::new(4, Features::empty());
    let out = h.request(0, &[1, 2, 3, 4, 5, 6, 7, 8]);

    let head = h.queue.add_buffer(&[out], &[], 77).unwrap();
    assert_eq!(head, 0);
    assert_eq!(h.queue.num_free(), 3);

    let chain = h.device.pop().unwrap().unwrap();
    assert_eq!(chain.head, 0);
    h.device.push_used(0, 8).unwrap();

    let done = h.queue.reclaim().unwrap().unwrap();
    assert_eq!((done.cookie, done.written), (77, 8));
    assert_eq!(h.queue.num_free(), 4);
}

#[test]
fn exact_fit_chain_uses_whole_ring() {
    let mut h = Harness::new(4, Features::empty());
    let out = [h.slot(0), h.slot(1)];
    let inp = [h.slot(2), h.slot(3)];

    h.queue.add_buffer(&out, &inp, 1).unwrap();
    assert_eq!(h.queue.num_free(), 0);

    let seg = h.slot(4);
    assert_eq!(
        h.queue.add_buffer(&[seg], &[], 2),
        Err(VirtqError::QueueFull)
    );

    let chain = h.device.pop().unwrap().unwrap();
    assert_eq!(chain.readable.len() + chain.writable.len(), 4);
}

#[test]
fn ten_segment_chain_on_four_entry_ring() {
    let mut h = Harness::indirect(4, Features::empty());
    let free_before = h.queue.pool().free_bytes();
    let out: Vec<Segment> = (0..4).map(|i| h.slot(i)).collect();
    let inp: Vec<Segment> = (4..10).map(|i| h.slot(i)).collect();

    h.queue.add_buffer(&out, &inp, 10).unwrap();
    assert_eq!(h.queue.num_free(), 3);
    assert!(h.queue.pool().free_bytes() < free_before);

    let head = h.device.pop().unwrap().unwrap();
    assert!(head.indirect);
    assert_eq!(head.readable, out);
    assert_eq!(head.writable, inp);

    let reply = vec![0x11; 6 * 256];
    assert_eq!(h.device.complete(&head, &reply).unwrap(), 6 * 256);

    let done = h.queue.reclaim().unwrap().unwrap();
    assert_eq!(done.written, 6 * 256);
    assert_eq!(h.queue.num_free(), 4);
    assert_eq!(h.queue.pool().free_bytes(), free_before);
}

#[test]
fn exhausted_pool_falls_back_to_direct() {
    let (mem, region, pool_base, _) = guest_memory(8, Features::INDIRECT_DESC);
    // room for exactly one 128-byte table
    let pool = vring::IndirectPool::<128>::new(pool_base, 128).unwrap();
    let mut q = Virtqueue::<u32, _, _, _>::create(
        config(8, Features::INDIRECT_DESC),
        region,
        mem.clone(),
        KickCounter::default(),
        pool,
    )
    .unwrap();
    let mut device = vring_testing::SimDevice::new(q.layout(), mem);

    let segs = [Segment::new(0x1000, 8), Segment::new(0x2000, 8)];
    q.add_buffer(&segs[..1], &segs[1..], 0).unwrap();
    q.add_buffer(&segs[..1], &segs[1..], 1).unwrap();
    assert_eq!(q.num_free(), 8 - 1 - 2);

    let chains = device.pop_all().unwrap();
    assert!(chains[0].indirect);
    assert!(!chains[1].indirect);
}
