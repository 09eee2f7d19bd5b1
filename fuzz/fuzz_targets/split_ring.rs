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
#![no_main]

use std::collections::BTreeSet;
use std::rc::Rc;

use libfuzzer_sys::arbitrary::{Arbitrary, Result as FuzzResult, Unstructured};
use libfuzzer_sys::fuzz_target;
use vring::{
    Features, IndirectPool, Layout, MemRegion, QueueConfig, QueueStats, Segment, VirtqError,
    Virtqueue,
};
use vring_testing::{DEFAULT_GPA_BASE, GuestMemory, SimDevice};

const MAX_OPS: usize = 256;
const MAX_SEGS: usize = 6;
const POOL_LEN: usize = 8 * 1024;
const DATA_BASE_OFF: u64 = 64 * 1024;

/// One step of driver or device activity. Device steps may lie.
#[derive(Debug)]
enum Op {
    Add { out: u8, inp: u8 },
    Kick,
    Serve { n: u8, reply: u16 },
    RawUsed { id: u32, len: u32 },
    ForceUsedIdx(u16),
    Reclaim,
    EnableInterrupts { delayed: bool },
    DisableInterrupts,
    AvailEvent(u16),
}

impl<'a> Arbitrary<'a> for Op {
    fn arbitrary(u: &mut Unstructured<'a>) -> FuzzResult<Self> {
        // honest steps dominate so that chains actually flow
        Ok(match u.int_in_range(0u8..=19)? {
            0..=5 => Op::Add {
                out: u.int_in_range(0..=MAX_SEGS as u8)?,
                inp: u.int_in_range(0..=MAX_SEGS as u8)?,
            },
            6..=7 => Op::Kick,
            8..=11 => Op::Serve {
                n: u.int_in_range(1..=8)?,
                reply: u.arbitrary()?,
            },
            12 => Op::RawUsed {
                id: u.arbitrary()?,
                len: u.arbitrary()?,
            },
            13 => Op::ForceUsedIdx(u.arbitrary()?),
            14..=16 => Op::Reclaim,
            17 => Op::EnableInterrupts {
                delayed: u.arbitrary()?,
            },
            18 => Op::DisableInterrupts,
            _ => Op::AvailEvent(u.arbitrary()?),
        })
    }
}

#[derive(Debug)]
struct Input {
    size_log2: u8,
    features: Features,
    ops: Vec<Op>,
}

impl<'a> Arbitrary<'a> for Input {
    fn arbitrary(u: &mut Unstructured<'a>) -> FuzzResult<Self> {
        let size_log2 = u.int_in_range(0..=6)?;
        let mut features = Features::empty();
        if u.arbitrary()? {
            features |= Features::EVENT_IDX;
        }
        if u.arbitrary()? {
            features |= Features::INDIRECT_DESC;
        }
        let n = u.int_in_range(0..=MAX_OPS)?;
        let ops = (0..n)
            .map(|_| Op::arbitrary(u))
            .collect::<FuzzResult<_>>()?;
        Ok(Input {
            size_log2,
            features,
            ops,
        })
    }
}

fn no_kick(_: QueueStats) {}

fuzz_target!(|input: Input| {
    let size = 1u16 << input.size_log2;
    let ring_len = Layout::query_size(size, 4096, input.features);
    let pool_base = (DEFAULT_GPA_BASE + ring_len as u64).next_multiple_of(4096);
    let data_base = DEFAULT_GPA_BASE + DATA_BASE_OFF;
    let total = DATA_BASE_OFF as usize + 4096;

    let mem = Rc::new(GuestMemory::new(DEFAULT_GPA_BASE, total));
    let config = QueueConfig::new(0, size)
        .with_max_size(size)
        .with_features(input.features);
    let Ok(pool) = IndirectPool::<128>::new(pool_base, POOL_LEN) else {
        return;
    };
    let mut queue: Virtqueue<u32, _, _, _> = Virtqueue::create(
        config,
        MemRegion::new(DEFAULT_GPA_BASE, ring_len),
        mem.clone(),
        no_kick as fn(QueueStats),
        pool,
    )
    .expect("valid queue config");
    let mut device = SimDevice::new(queue.layout(), mem);

    let mut next_cookie = 0u32;
    let mut outstanding = BTreeSet::new();

    for op in input.ops {
        match op {
            Op::Add { out, inp } => {
                let seg = |i: u8| Segment::new(data_base + (i as u64 % 16) * 256, 256);
                let out: Vec<_> = (0..out).map(seg).collect();
                let inp: Vec<_> = (0..inp).map(|i| seg(i + 8)).collect();
                match queue.add_buffer(&out, &inp, next_cookie) {
                    Ok(_) => {
                        outstanding.insert(next_cookie);
                        next_cookie += 1;
                    }
                    Err(
                        VirtqError::QueueFull
                        | VirtqError::BrokenQueue
                        | VirtqError::Ring(vring::RingError::EmptyChain),
                    ) => {}
                    Err(e) => panic!("unexpected add error {e:?}"),
                }
            }
            Op::Kick => {
                let _ = queue.kick();
            }
            Op::Serve { n, reply } => {
                for _ in 0..n {
                    // a device that lied before may see garbage; stop serving then
                    let Ok(Some(chain)) = device.pop() else { break };
                    let data = vec![0x5A; reply as usize];
                    if device.complete(&chain, &data).is_err() {
                        break;
                    }
                }
                let _ = device.signal();
            }
            Op::RawUsed { id, len } => {
                let _ = device.push_used(id, len);
            }
            Op::ForceUsedIdx(idx) => {
                let _ = device.force_used_idx(idx);
            }
            Op::Reclaim => {
                while let Ok(Some(done)) = queue.reclaim() {
                    assert!(
                        outstanding.remove(&done.cookie),
                        "cookie {} returned twice or never submitted",
                        done.cookie
                    );
                }
            }
            Op::EnableInterrupts { delayed } => {
                let _ = if delayed {
                    queue.enable_interrupts_delayed()
                } else {
                    queue.enable_interrupts()
                };
            }
            Op::DisableInterrupts => {
                let _ = queue.disable_interrupts();
            }
            Op::AvailEvent(idx) => {
                let _ = device.set_avail_event(idx);
            }
        }

        assert_eq!(queue.num_inflight(), outstanding.len());
        assert!(queue.num_free() <= size as usize);
    }

    // whatever the device did, the driver can always take its chains back
    queue.begin_drain();
    while let Ok(Some(cookie)) = queue.detach_unused() {
        assert!(outstanding.remove(&cookie));
    }
    assert!(outstanding.is_empty());
    assert_eq!(queue.num_free(), size as usize);
});
