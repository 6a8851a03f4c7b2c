//! FIFO 队列契约测试：乱序释放下的顺序、空洞回收与背压。

use std::collections::VecDeque;
use std::sync::Arc;

use proptest::prelude::*;

use spark_pdu_router::config::{
    BufferConfig, DestinationConfig, LockConfig, QueueConfig, RouteConfig,
};
use spark_pdu_router::fifo::{FifoError, FifoManager};
use spark_pdu_router::lock::LockManager;
use spark_pdu_router::platform::SingleContext;
use spark_pdu_router::test_stubs::RecordingReporter;
use spark_pdu_router::{BufferId, DestId, LockId, QueueId, RouteId, RouterConfig, SlotRef};

const Q: QueueId = QueueId::new(0);
const R: RouteId = RouteId::new(0);

fn fifo(depth: u16, capacities: &[usize]) -> FifoManager {
    let config = RouterConfig {
        core_count: 1,
        locks: vec![LockConfig::spinlock(16)],
        buffers: capacities.iter().map(|&c| BufferConfig::new(c)).collect(),
        queues: vec![QueueConfig::new(
            depth,
            LockId::new(0),
            (0..capacities.len() as u16)
                .map(BufferId::new)
                .collect::<Vec<_>>(),
        )],
        routes: vec![RouteConfig::new(Q, LockId::new(0), [DestId::new(0)])],
        destinations: vec![DestinationConfig::downstream(R)],
    };
    let reporter = Arc::new(RecordingReporter::default());
    let locks = Arc::new(LockManager::new(
        &config,
        Arc::new(SingleContext),
        reporter.clone(),
    ));
    FifoManager::new(&config, locks, reporter)
}

#[derive(Clone, Debug)]
enum Op {
    Allocate,
    /// 释放第 n 个仍存活的槽位（按存活数取模）。
    Release(usize),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![Just(Op::Allocate), (0usize..8).prop_map(Op::Release)]
}

/// 影子队列：按分配顺序记录槽位及其存活状态，队头处已释放的条目随即出队。
#[derive(Default)]
struct Shadow {
    entries: VecDeque<(SlotRef, bool)>,
}

impl Shadow {
    fn trim(&mut self) {
        while matches!(self.entries.front(), Some((_, false))) {
            self.entries.pop_front();
        }
    }

    fn live(&self) -> Vec<SlotRef> {
        self.entries
            .iter()
            .filter(|(_, live)| *live)
            .map(|(slot, _)| *slot)
            .collect()
    }
}

proptest! {
    #[test]
    fn peek_always_returns_the_earliest_live_slot(
        depth in 1u16..6,
        ops in prop::collection::vec(op_strategy(), 1..80),
    ) {
        let capacities = vec![16; usize::from(depth)];
        let fifo = fifo(depth, &capacities);
        let mut shadow = Shadow::default();

        for op in ops {
            match op {
                Op::Allocate => {
                    let result = fifo.allocate(Q, R, 8, 8);
                    if shadow.entries.len() < usize::from(depth) {
                        let allocation = result.expect("槽位与缓冲均有空闲");
                        shadow.entries.push_back((allocation.slot, true));
                    } else {
                        prop_assert_eq!(result, Err(FifoError::NoFreeSlot));
                    }
                }
                Op::Release(nth) => {
                    let live = shadow.live();
                    if live.is_empty() {
                        continue;
                    }
                    let victim = live[nth % live.len()];
                    prop_assert!(fifo.release(victim));
                    for entry in shadow.entries.iter_mut() {
                        if entry.0 == victim {
                            entry.1 = false;
                        }
                    }
                    shadow.trim();
                }
            }
            prop_assert_eq!(fifo.peek(Q), shadow.live().first().copied());
            prop_assert_eq!(fifo.stats(Q).fill, shadow.entries.len());
        }
    }
}

#[test]
fn exhausted_pool_is_backpressure_without_touching_in_flight_messages() {
    let fifo = fifo(4, &[16, 16]);
    let a = fifo.allocate(Q, R, 8, 8).expect("a");
    let b = fifo.allocate(Q, R, 8, 8).expect("b");
    fifo.segments().put(a.buffer, b"in flight").expect("写入 a");

    assert_eq!(
        fifo.allocate(Q, R, 8, 8),
        Err(FifoError::NoFittingBuffer { minimum: 8 })
    );
    assert_eq!(fifo.stats(Q).rejected, 1);
    assert_eq!(fifo.peek(Q), Some(a.slot));
    assert_eq!(fifo.slot_buffer(b.slot), Some(b.buffer));

    let reader = fifo
        .segments()
        .bind_reader(a.buffer, DestId::new(0))
        .expect("绑定读者");
    let mut out = [0u8; 9];
    fifo.segments().get(reader, &mut out).expect("a 的数据完好");
    assert_eq!(&out, b"in flight");
}

#[test]
fn released_head_slots_restore_capacity_of_a_full_queue() {
    let fifo = fifo(2, &[16, 16, 16]);
    let a = fifo.allocate(Q, R, 8, 8).expect("a");
    fifo.allocate(Q, R, 8, 8).expect("b");
    assert_eq!(fifo.allocate(Q, R, 8, 8), Err(FifoError::NoFreeSlot));

    fifo.release(a.slot);
    let c = fifo.allocate(Q, R, 8, 8).expect("队头释放后立即可分配");
    assert_eq!(c.slot, a.slot, "写下标回绕到被释放的槽位");
}
