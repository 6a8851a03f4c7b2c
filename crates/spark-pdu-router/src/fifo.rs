//! FIFO 队列管理器：槽位环 + 共享缓冲池。
//!
//! # 模块角色（Why）
//! - 每条在途消息占用队列中的一个槽位与池中的一个缓冲；只有队头消息允许开始发送，
//!   由此保证同一队列内的严格顺序；
//! - 多个队列可以共享同一个缓冲池，池搜索与占用必须在队列锁内完成。
//!
//! # 核心机制（How）
//! - 槽位数组按 `read`/`write` 下标环形使用，`fill` 统计从队头起已写入的槽位数（含空洞）；
//! - 乱序释放只清空槽位、不搬移，`peek` 与 `release` 都会跳过队头处已释放的槽位并递减 `fill`；
//! - 分配时先取可用容量不小于首选长度的最小缓冲（最佳适配），否则取可用容量不小于最小长度的
//!   最大缓冲（流式回退）。
//!
//! # 契约（What）
//! - 分配失败是背压而非错误，只计入 [`QueueStats::rejected`]；
//! - 释放不清零缓冲内容；释放一个空槽位上报 [`RuntimeError::DoubleRelease`]。

use alloc::{boxed::Box, sync::Arc};

#[cfg(not(feature = "std"))]
use core::fmt;

#[cfg(feature = "std")]
use thiserror::Error;

use spin::Mutex;

use crate::config::RouterConfig;
use crate::diagnostics::{ApiId, ErrorReporter, RuntimeError, clamp_index};
use crate::ids::{BufferId, LockId, QueueId, RouteId, SlotRef};
use crate::lock::LockManager;
use crate::segment::SegmentBufferManager;

/// 分配被拒绝的原因。
#[cfg_attr(feature = "std", derive(Error))]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FifoError {
    #[cfg_attr(feature = "std", error("no free slot in the queue"))]
    NoFreeSlot,
    #[cfg_attr(feature = "std", error("no free pool buffer offers {minimum} usable bytes"))]
    NoFittingBuffer { minimum: usize },
}

#[cfg(not(feature = "std"))]
impl fmt::Display for FifoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FifoError::NoFreeSlot => f.write_str("no free slot in the queue"),
            FifoError::NoFittingBuffer { minimum } => {
                write!(f, "no free pool buffer offers {minimum} usable bytes")
            }
        }
    }
}

/// 一次成功分配的结果。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Allocation {
    pub slot: SlotRef,
    pub buffer: BufferId,
}

/// 队列统计快照。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub depth: usize,
    /// 队头到写下标之间的槽位数（含已释放的空洞）。
    pub fill: usize,
    /// `fill` 的历史最大值。
    pub high_water: usize,
    /// 被拒绝的分配次数。
    pub rejected: usize,
}

#[derive(Clone, Copy, Debug, Default)]
struct Slot {
    buffer: Option<BufferId>,
    route: Option<RouteId>,
}

struct QueueState {
    slots: Box<[Slot]>,
    read: usize,
    write: usize,
    fill: usize,
    high_water: usize,
    rejected: usize,
}

impl QueueState {
    fn depth(&self) -> usize {
        self.slots.len()
    }

    /// 跳过队头处已释放的槽位。
    fn skip_released_head(&mut self) {
        while self.fill > 0 && self.slots[self.read].buffer.is_none() {
            self.read = (self.read + 1) % self.depth();
            self.fill -= 1;
        }
        if self.fill == 0 {
            self.read = self.write;
        }
    }
}

struct FifoQueue {
    lock: LockId,
    pool: Box<[BufferId]>,
    state: Mutex<QueueState>,
}

/// FIFO 队列管理器，持有全部分段缓冲。
pub struct FifoManager {
    queues: Box<[FifoQueue]>,
    segments: SegmentBufferManager,
    locks: Arc<LockManager>,
    reporter: Arc<dyn ErrorReporter>,
}

impl FifoManager {
    pub fn new(
        config: &RouterConfig,
        locks: Arc<LockManager>,
        reporter: Arc<dyn ErrorReporter>,
    ) -> Self {
        let queues = config
            .queues
            .iter()
            .map(|queue| FifoQueue {
                lock: queue.lock,
                pool: queue.pool.iter().copied().collect(),
                state: Mutex::new(QueueState {
                    slots: (0..queue.depth).map(|_| Slot::default()).collect(),
                    read: 0,
                    write: 0,
                    fill: 0,
                    high_water: 0,
                    rejected: 0,
                }),
            })
            .collect();
        Self {
            queues,
            segments: SegmentBufferManager::new(config, reporter.clone()),
            locks,
            reporter,
        }
    }

    /// 底层分段缓冲管理器。
    pub fn segments(&self) -> &SegmentBufferManager {
        &self.segments
    }

    /// 为路由分配槽位与缓冲；整个搜索与占用过程持有队列锁。
    pub fn allocate(
        &self,
        queue: QueueId,
        route: RouteId,
        preferred: usize,
        minimum: usize,
    ) -> Result<Allocation, FifoError> {
        let (queue, entry) = self.queue(queue, ApiId::FifoAllocate);
        let _guard = self.locks.guard(entry.lock);
        let mut state = entry.state.lock();

        if state.fill >= state.depth() {
            state.rejected += 1;
            return Err(FifoError::NoFreeSlot);
        }
        let Some(buffer) = self.pick_buffer(&entry.pool, preferred, minimum) else {
            state.rejected += 1;
            return Err(FifoError::NoFittingBuffer { minimum });
        };
        if !self.segments.claim(buffer) {
            state.rejected += 1;
            return Err(FifoError::NoFittingBuffer { minimum });
        }

        let index = state.write;
        state.slots[index] = Slot {
            buffer: Some(buffer),
            route: Some(route),
        };
        state.write = (index + 1) % state.depth();
        state.fill += 1;
        state.high_water = state.high_water.max(state.fill);
        Ok(Allocation {
            slot: SlotRef::new(queue, index as u16),
            buffer,
        })
    }

    /// 最早仍绑定缓冲的槽位。
    pub fn peek(&self, queue: QueueId) -> Option<SlotRef> {
        let (queue, entry) = self.queue(queue, ApiId::FifoRelease);
        let _guard = self.locks.guard(entry.lock);
        let mut state = entry.state.lock();
        state.skip_released_head();
        (state.fill > 0).then(|| SlotRef::new(queue, state.read as u16))
    }

    /// 槽位是否为队头。
    pub fn is_head(&self, slot: SlotRef) -> bool {
        self.peek(slot.queue()) == Some(slot)
    }

    /// 释放槽位并归还其缓冲；空槽位返回 `false` 并上报。
    pub fn release(&self, slot: SlotRef) -> bool {
        let (_, entry) = self.queue(slot.queue(), ApiId::FifoRelease);
        let _guard = self.locks.guard(entry.lock);
        let mut state = entry.state.lock();
        let index = clamp_index(
            &*self.reporter,
            ApiId::FifoRelease,
            slot.index(),
            state.depth(),
        );
        let Some(buffer) = state.slots[index].buffer.take() else {
            drop(state);
            self.reporter
                .runtime_error(ApiId::FifoRelease, RuntimeError::DoubleRelease);
            return false;
        };
        state.slots[index].route = None;
        state.skip_released_head();
        drop(state);
        self.segments.release(buffer);
        true
    }

    /// 释放队列中全部槽位并重置下标。
    pub fn flush(&self, queue: QueueId) {
        let (_, entry) = self.queue(queue, ApiId::FifoRelease);
        let _guard = self.locks.guard(entry.lock);
        let mut state = entry.state.lock();
        for slot in state.slots.iter_mut() {
            if let Some(buffer) = slot.buffer.take() {
                self.segments.release(buffer);
            }
            slot.route = None;
        }
        state.read = 0;
        state.write = 0;
        state.fill = 0;
    }

    /// 槽位绑定的缓冲。
    pub fn slot_buffer(&self, slot: SlotRef) -> Option<BufferId> {
        self.slot(slot).buffer
    }

    /// 槽位所属的路由。
    pub fn slot_route(&self, slot: SlotRef) -> Option<RouteId> {
        self.slot(slot).route
    }

    /// 队列深度。
    pub fn depth(&self, queue: QueueId) -> usize {
        let (_, entry) = self.queue(queue, ApiId::FifoRelease);
        let _guard = self.locks.guard(entry.lock);
        entry.state.lock().depth()
    }

    /// 统计快照；与其他队列操作一样先取队列锁。
    pub fn stats(&self, queue: QueueId) -> QueueStats {
        let (_, entry) = self.queue(queue, ApiId::FifoRelease);
        let _guard = self.locks.guard(entry.lock);
        let state = entry.state.lock();
        QueueStats {
            depth: state.depth(),
            fill: state.fill,
            high_water: state.high_water,
            rejected: state.rejected,
        }
    }

    /// 队列数量。
    pub fn len(&self) -> usize {
        self.queues.len()
    }

    /// 是否没有任何队列。
    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }

    fn pick_buffer(&self, pool: &[BufferId], preferred: usize, minimum: usize) -> Option<BufferId> {
        let free = || {
            pool.iter()
                .copied()
                .filter(|&buffer| !self.segments.is_allocated(buffer))
                .map(|buffer| (buffer, self.segments.capacity(buffer).saturating_sub(1)))
        };
        free()
            .filter(|&(_, usable)| usable >= preferred)
            .min_by_key(|&(_, usable)| usable)
            .or_else(|| {
                free()
                    .filter(|&(_, usable)| usable >= minimum)
                    .max_by_key(|&(_, usable)| usable)
            })
            .map(|(buffer, _)| buffer)
    }

    fn slot(&self, slot: SlotRef) -> Slot {
        let state = self.queue(slot.queue(), ApiId::FifoRelease).1.state.lock();
        let index = clamp_index(
            &*self.reporter,
            ApiId::FifoRelease,
            slot.index(),
            state.depth(),
        );
        state.slots[index]
    }

    fn queue(&self, queue: QueueId, api: ApiId) -> (QueueId, &FifoQueue) {
        let index = clamp_index(&*self.reporter, api, queue.index(), self.queues.len());
        (QueueId::new(index as u16), &self.queues[index])
    }
}

#[cfg(test)]
mod tests {
    use alloc::vec;

    use super::*;
    use crate::config::{
        BufferConfig, DestinationConfig, LockConfig, QueueConfig, RouteConfig, RouterConfig,
    };
    use crate::ids::DestId;
    use crate::platform::SingleContext;
    use crate::test_stubs::RecordingReporter;

    const Q: QueueId = QueueId::new(0);
    const R: RouteId = RouteId::new(0);

    fn manager(depth: u16, capacities: &[usize]) -> (FifoManager, Arc<RecordingReporter>) {
        let config = RouterConfig {
            core_count: 1,
            locks: vec![LockConfig::spinlock(8)],
            buffers: capacities.iter().map(|&c| BufferConfig::new(c)).collect(),
            queues: vec![QueueConfig::new(
                depth,
                LockId::new(0),
                (0..capacities.len() as u16)
                    .map(BufferId::new)
                    .collect::<alloc::vec::Vec<_>>(),
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
        (FifoManager::new(&config, locks, reporter.clone()), reporter)
    }

    #[test]
    fn best_fit_prefers_the_smallest_sufficient_buffer() {
        let (fifo, _) = manager(4, &[64, 16, 32]);
        let first = fifo.allocate(Q, R, 12, 8).expect("分配成功");
        assert_eq!(first.buffer, BufferId::new(1), "16 字节缓冲可用 15 字节");
        let second = fifo.allocate(Q, R, 12, 8).expect("分配成功");
        assert_eq!(second.buffer, BufferId::new(2));
    }

    #[test]
    fn streaming_fallback_takes_the_largest_above_minimum() {
        let (fifo, _) = manager(4, &[16, 64, 32]);
        let allocation = fifo.allocate(Q, R, 1000, 32).expect("回退分配");
        assert_eq!(allocation.buffer, BufferId::new(1));
        assert_eq!(
            fifo.allocate(Q, R, 1000, 40),
            Err(FifoError::NoFittingBuffer { minimum: 40 }),
            "剩余缓冲可用容量不足 40"
        );
    }

    #[test]
    fn minimum_compares_usable_capacity() {
        let (fifo, _) = manager(2, &[32]);
        assert_eq!(
            fifo.allocate(Q, R, 1000, 32),
            Err(FifoError::NoFittingBuffer { minimum: 32 }),
            "32 字节缓冲只能容纳 31 字节"
        );
        assert!(fifo.allocate(Q, R, 1000, 31).is_ok());
    }

    #[test]
    fn full_queue_rejects_and_counts() {
        let (fifo, _) = manager(1, &[16, 16]);
        fifo.allocate(Q, R, 4, 4).expect("第一条");
        assert_eq!(fifo.allocate(Q, R, 4, 4), Err(FifoError::NoFreeSlot));
        let stats = fifo.stats(Q);
        assert_eq!((stats.fill, stats.rejected, stats.high_water), (1, 1, 1));
    }

    #[test]
    fn gaps_are_skipped_without_reordering() {
        let (fifo, _) = manager(3, &[16, 16, 16]);
        let a = fifo.allocate(Q, R, 4, 4).expect("a");
        let b = fifo.allocate(Q, R, 4, 4).expect("b");
        let c = fifo.allocate(Q, R, 4, 4).expect("c");

        assert!(fifo.release(b.slot));
        assert_eq!(fifo.peek(Q), Some(a.slot), "释放中间槽位不影响队头");
        assert_eq!(fifo.stats(Q).fill, 3, "空洞仍计入 fill");

        assert!(fifo.release(a.slot));
        assert_eq!(fifo.peek(Q), Some(c.slot));
        assert_eq!(fifo.stats(Q).fill, 1);

        let d = fifo.allocate(Q, R, 4, 4).expect("空洞释放后重新获得容量");
        assert_eq!(d.slot.index(), 0);
        assert!(fifo.is_head(c.slot));
    }

    #[test]
    fn double_release_is_reported() {
        let (fifo, reporter) = manager(2, &[16]);
        let a = fifo.allocate(Q, R, 4, 4).expect("a");
        assert!(fifo.release(a.slot));
        assert!(!fifo.release(a.slot));
        assert_eq!(
            reporter.runtime_errors(),
            vec![(ApiId::FifoRelease, RuntimeError::DoubleRelease)]
        );
        assert_eq!(fifo.segments().stats().releases, 1);
    }

    #[test]
    fn flush_returns_every_buffer() {
        let (fifo, _) = manager(2, &[16, 16]);
        let a = fifo.allocate(Q, R, 4, 4).expect("a");
        fifo.allocate(Q, R, 4, 4).expect("b");
        assert_eq!(fifo.slot_route(a.slot), Some(R));
        fifo.flush(Q);
        assert_eq!(fifo.peek(Q), None);
        assert_eq!(fifo.slot_buffer(a.slot), None);
        assert_eq!(fifo.segments().stats().allocated, 0);
    }
}
