#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use spark_pdu_router::config::{
    BufferConfig, DestinationConfig, LockConfig, QueueConfig, RouteConfig,
};
use spark_pdu_router::segment::SegmentBufferManager;
use spark_pdu_router::test_stubs::RecordingReporter;
use spark_pdu_router::{BufferId, DestId, LockId, QueueId, ReaderId, RouteId, RouterConfig};
use std::collections::VecDeque;
use std::sync::Arc;

const BUF: BufferId = BufferId::new(0);

/// Fuzz 输入：一块环形缓冲与其上的读写指令流。
///
/// - **Why**：回绕分段、零拷贝提交与多读者最落后游标的组合空间远大于手写用例；
/// - **How**：以每个读者一条 `VecDeque` 作影子模型，逐条对照；
/// - **What**：任何字节错位、容量不变式破坏或被拒绝操作带来的副作用都会触发断言。
#[derive(Debug, Arbitrary)]
struct SegmentCase {
    capacity: u8,
    readers: u8,
    ops: Vec<SegmentOp>,
}

#[derive(Debug, Arbitrary)]
enum SegmentOp {
    Put { len: u8 },
    Get { reader: u8, len: u8 },
    ZeroWrite { len: u8 },
    ZeroRead { reader: u8, len: u8 },
}

fuzz_target!(|case: SegmentCase| {
    let capacity = usize::from(case.capacity.max(2));
    let reader_count = usize::from(case.readers % 3) + 1;
    let segments = manager(capacity, reader_count as u8);
    if !segments.claim(BUF) {
        return;
    }
    let readers: Vec<ReaderId> = (0..reader_count)
        .filter_map(|index| segments.bind_reader(BUF, DestId::new(index as u16)).ok())
        .collect();
    assert_eq!(readers.len(), reader_count);
    segments.release_anchor(BUF);

    let mut queues: Vec<VecDeque<u8>> = vec![VecDeque::new(); reader_count];
    let mut next = 0u8;
    let mut pattern = |len: usize| -> Vec<u8> {
        (0..len)
            .map(|_| {
                next = next.wrapping_add(1);
                next
            })
            .collect()
    };

    for op in case.ops {
        let laggard = queues.iter().map(VecDeque::len).max().unwrap_or(0);
        let free = capacity - 1 - laggard;
        match op {
            SegmentOp::Put { len } => {
                let bytes = pattern(usize::from(len));
                let accepted = segments.put(BUF, &bytes).is_ok();
                assert_eq!(accepted, bytes.len() <= free);
                if accepted {
                    queues.iter_mut().for_each(|queue| queue.extend(&bytes));
                }
            }
            SegmentOp::Get { reader, len } => {
                let index = usize::from(reader) % reader_count;
                let mut out = vec![0u8; usize::from(len)];
                let served = segments.get(readers[index], &mut out).is_ok();
                assert_eq!(served, out.len() <= queues[index].len());
                if served {
                    let expected: Vec<u8> = queues[index].drain(..out.len()).collect();
                    assert_eq!(out, expected);
                }
            }
            SegmentOp::ZeroWrite { len } => {
                let bytes = pattern(usize::from(len));
                let written = segments.write_pointer(BUF, |run| {
                    let n = run.len().min(bytes.len());
                    run[..n].copy_from_slice(&bytes[..n]);
                    n
                });
                assert!(written <= free);
                assert!(segments.advance_write(BUF, written).is_ok());
                queues
                    .iter_mut()
                    .for_each(|queue| queue.extend(&bytes[..written]));
            }
            SegmentOp::ZeroRead { reader, len } => {
                let index = usize::from(reader) % reader_count;
                let seen = segments.read_pointer(readers[index], |run| {
                    run[..run.len().min(usize::from(len))].to_vec()
                });
                assert!(segments.advance_read(readers[index], seen.len()).is_ok());
                let expected: Vec<u8> = queues[index].drain(..seen.len()).collect();
                assert_eq!(seen, expected);
            }
        }

        let laggard = queues.iter().map(VecDeque::len).max().unwrap_or(0);
        assert_eq!(segments.total_free(BUF), capacity - 1 - laggard);
        assert_eq!(segments.laggard_stored(BUF), laggard);
        for (index, reader) in readers.iter().enumerate() {
            assert_eq!(segments.total_stored(*reader), queues[index].len());
        }
    }
});

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
