//! 分段缓冲的性质验证。
//!
//! # 核心目标（Why）
//! - 以 `VecDeque` 作为影子模型，验证任意 put/get（含零拷贝路径）交错下：
//!   1. 读出的字节与写入的字节逐一相等、顺序一致，与回绕位置无关；
//!   2. `total_free + 最落后读者的 total_stored == capacity - 1` 始终成立；
//!   3. 写入被拒绝或读取忙时，缓冲状态不发生任何变化。
//!
//! # 结构（How）
//! - `Op`：随机生成的操作；`Shadow`：每个读者一条队列的影子模型；
//! - 单读者与双读者两个性质分开，双读者时快慢读者各自独立推进。

use std::collections::VecDeque;
use std::sync::Arc;

use proptest::prelude::*;

use spark_pdu_router::config::{
    BufferConfig, DestinationConfig, LockConfig, QueueConfig, RouteConfig,
};
use spark_pdu_router::segment::{SegmentBufferManager, SegmentError};
use spark_pdu_router::test_stubs::RecordingReporter;
use spark_pdu_router::{BufferId, DestId, LockId, QueueId, ReaderId, RouteId, RouterConfig};

const BUF: BufferId = BufferId::new(0);

#[derive(Clone, Debug)]
enum Op {
    Put(usize),
    Get(usize, usize),
    ZeroWrite(usize),
    ZeroRead(usize, usize),
}

fn op_strategy(readers: usize) -> impl Strategy<Value = Op> {
    prop_oneof![
        (0usize..40).prop_map(Op::Put),
        (0..readers, 0usize..40).prop_map(|(reader, len)| Op::Get(reader, len)),
        (0usize..40).prop_map(Op::ZeroWrite),
        (0..readers, 0usize..40).prop_map(|(reader, len)| Op::ZeroRead(reader, len)),
    ]
}

fn manager(capacity: usize, readers: u8) -> SegmentBufferManager {
    let config = RouterConfig {
        core_count: 1,
        locks: vec![LockConfig::exclusive_area()],
        buffers: vec![BufferConfig::new(capacity).with_readers(readers)],
        queues: vec![QueueConfig::new(1, LockId::new(0), [BUF])],
        routes: vec![RouteConfig::new(
            QueueId::new(0),
            LockId::new(0),
            [DestId::new(0)],
        )],
        destinations: vec![DestinationConfig::downstream(RouteId::new(0))],
    };
    SegmentBufferManager::new(&config, Arc::new(RecordingReporter::default()))
}

struct Shadow {
    capacity: usize,
    queues: Vec<VecDeque<u8>>,
    next: u8,
}

impl Shadow {
    fn laggard(&self) -> usize {
        self.queues.iter().map(VecDeque::len).max().unwrap_or(0)
    }

    fn free(&self) -> usize {
        self.capacity - 1 - self.laggard()
    }

    fn pattern(&mut self, len: usize) -> Vec<u8> {
        (0..len)
            .map(|_| {
                self.next = self.next.wrapping_add(1);
                self.next
            })
            .collect()
    }
}

fn apply(segments: &SegmentBufferManager, readers: &[ReaderId], shadow: &mut Shadow, op: &Op) {
    match *op {
        Op::Put(len) => {
            let bytes = shadow.pattern(len);
            let free = shadow.free();
            let result = segments.put(BUF, &bytes);
            if len <= free {
                assert_eq!(result, Ok(()));
                for queue in &mut shadow.queues {
                    queue.extend(bytes.iter().copied());
                }
            } else {
                assert_eq!(
                    result,
                    Err(SegmentError::Rejected {
                        requested: len,
                        free
                    })
                );
            }
        }
        Op::Get(reader, len) => {
            let mut out = vec![0u8; len];
            let stored = shadow.queues[reader].len();
            let result = segments.get(readers[reader], &mut out);
            if len <= stored {
                assert_eq!(result, Ok(()));
                let expected: Vec<u8> = shadow.queues[reader].drain(..len).collect();
                assert_eq!(out, expected);
            } else {
                assert_eq!(
                    result,
                    Err(SegmentError::Busy {
                        requested: len,
                        stored
                    })
                );
            }
        }
        Op::ZeroWrite(len) => {
            let bytes = shadow.pattern(len);
            let written = segments.write_pointer(BUF, |run| {
                let n = run.len().min(bytes.len());
                run[..n].copy_from_slice(&bytes[..n]);
                n
            });
            assert!(written <= shadow.free());
            segments
                .advance_write(BUF, written)
                .expect("提交长度不超过连续区间");
            for queue in &mut shadow.queues {
                queue.extend(bytes[..written].iter().copied());
            }
        }
        Op::ZeroRead(reader, len) => {
            let seen = segments.read_pointer(readers[reader], |run| run[..run.len().min(len)].to_vec());
            assert!(seen.len() <= shadow.queues[reader].len());
            segments
                .advance_read(readers[reader], seen.len())
                .expect("提交长度不超过连续区间");
            let expected: Vec<u8> = shadow.queues[reader].drain(..seen.len()).collect();
            assert_eq!(seen, expected);
        }
    }

    assert_eq!(segments.total_free(BUF), shadow.free());
    for (index, reader) in readers.iter().enumerate() {
        assert_eq!(segments.total_stored(*reader), shadow.queues[index].len());
    }
    assert_eq!(
        segments.total_free(BUF) + segments.laggard_stored(BUF),
        shadow.capacity - 1,
        "容量不变式"
    );
}

fn run(capacity: usize, reader_count: usize, ops: &[Op]) {
    let segments = manager(capacity, reader_count as u8);
    assert!(segments.claim(BUF));
    let readers: Vec<ReaderId> = (0..reader_count)
        .map(|index| {
            segments
                .bind_reader(BUF, DestId::new(index as u16))
                .expect("读者表足够")
        })
        .collect();
    segments.release_anchor(BUF);

    let mut shadow = Shadow {
        capacity,
        queues: vec![VecDeque::new(); reader_count],
        next: 0,
    };
    for op in ops {
        apply(&segments, &readers, &mut shadow, op);
    }
}

proptest! {
    #![proptest_config(ProptestConfig { cases: 256, ..ProptestConfig::default() })]

    #[test]
    fn single_reader_round_trip_holds_for_any_wrap_alignment(
        capacity in 2usize..48,
        ops in prop::collection::vec(op_strategy(1), 1..120),
    ) {
        run(capacity, 1, &ops);
    }

    #[test]
    fn laggard_reader_bounds_the_writer(
        capacity in 2usize..48,
        ops in prop::collection::vec(op_strategy(2), 1..160),
    ) {
        run(capacity, 2, &ops);
    }
}

#[test]
fn anchor_protects_message_start_until_late_reader_binds() {
    let segments = manager(16, 2);
    segments.claim(BUF);
    segments.put(BUF, b"hello").expect("写入元数据");
    let early = segments.bind_reader(BUF, DestId::new(0)).expect("早绑定");
    let mut drained = [0u8; 5];
    segments.get(early, &mut drained).expect("早读者读完");

    assert_eq!(segments.total_free(BUF), 10, "起点锚仍限制写者");
    let late = segments.bind_reader(BUF, DestId::new(1)).expect("晚绑定");
    segments.release_anchor(BUF);
    let mut seen = [0u8; 5];
    segments.get(late, &mut seen).expect("晚读者从消息起点开始读");
    assert_eq!(&seen, b"hello");
    assert_eq!(segments.total_free(BUF), 15);
}
