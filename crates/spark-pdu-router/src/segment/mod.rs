//! 分段缓冲管理器：一写多读的环形字节存储。
//!
//! # 模块角色（Why）
//! - 每条在途消息独占一个缓冲，接收侧唯一写者，0..N 个目的地各持一条读游标；
//! - 缓冲在构造时一次性分配，运行期只做占用/归还，内容在归还时不清零。
//!
//! # 核心机制（How）
//! - 空闲空间由“写游标向前走最先碰到的那条读游标”决定：对每条游标计算
//!   `(pos + capacity - write - 1) % capacity`，取最小值；
//! - 游标重合永远表示“空”；“满”表示写游标恰好落后限制游标一个字节，因此可用字节为 `capacity - 1`；
//! - 占用缓冲时在消息起点放置一个起点锚（不属于任何目的地的伪读者），在全部目的地绑定读实例之前，
//!   写者不能覆盖消息开头；路由层在绑定完全部读实例后调用 [`SegmentBufferManager::release_anchor`]；
//! - 所有跨边界拷贝都经由 [`span::split_at_boundary`]。
//!
//! # 契约说明（What）
//! - 每个缓冲的状态由一把 `spin::Mutex` 保护，只在单次操作期间持有；
//!   零拷贝闭包在持锁期间执行，闭包内不得回调本管理器；
//! - 对于任意读者 `r`：`total_free + total_stored(r_laggard) == capacity - 1`，其中 `r_laggard` 为最落后的游标。

use alloc::{boxed::Box, sync::Arc};
use core::ops::Range;
use core::sync::atomic::{AtomicUsize, Ordering};

#[cfg(not(feature = "std"))]
use core::fmt;

#[cfg(feature = "std")]
use thiserror::Error;

use spin::Mutex;

use crate::config::RouterConfig;
use crate::diagnostics::{ApiId, ErrorReporter, RuntimeError, clamp_index};
use crate::ids::{BufferId, DestId, ReaderId};

pub mod span;

pub use span::{WrapSplit, split_at_boundary};

/// 分段缓冲操作失败的原因。
#[cfg_attr(feature = "std", derive(Error))]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SegmentError {
    /// 写入长度超过当前空闲空间，缓冲未被修改。
    #[cfg_attr(feature = "std", error("put of {requested} bytes rejected, {free} free"))]
    Rejected { requested: usize, free: usize },
    /// 该读者可读字节不足，游标未移动。
    #[cfg_attr(feature = "std", error("get of {requested} bytes busy, {stored} stored"))]
    Busy { requested: usize, stored: usize },
    /// 提交长度超过零拷贝连续区间。
    #[cfg_attr(feature = "std", error("advance of {requested} bytes exceeds run of {run}"))]
    ExceedsRun { requested: usize, run: usize },
    /// 缓冲当前未被占用。
    #[cfg_attr(feature = "std", error("buffer is not allocated"))]
    NotAllocated,
    /// 读者表中没有该读实例。
    #[cfg_attr(feature = "std", error("reader instance is not bound"))]
    UnknownReader,
    /// 读者表已满。
    #[cfg_attr(feature = "std", error("reader table is full"))]
    ReaderTableFull,
}

#[cfg(not(feature = "std"))]
impl fmt::Display for SegmentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SegmentError::Rejected { requested, free } => {
                write!(f, "put of {requested} bytes rejected, {free} free")
            }
            SegmentError::Busy { requested, stored } => {
                write!(f, "get of {requested} bytes busy, {stored} stored")
            }
            SegmentError::ExceedsRun { requested, run } => {
                write!(f, "advance of {requested} bytes exceeds run of {run}")
            }
            SegmentError::NotAllocated => f.write_str("buffer is not allocated"),
            SegmentError::UnknownReader => f.write_str("reader instance is not bound"),
            SegmentError::ReaderTableFull => f.write_str("reader table is full"),
        }
    }
}

/// 管理器统计快照。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SegmentStats {
    pub claims: usize,
    pub releases: usize,
    pub rejected_puts: usize,
    /// 当前被占用的缓冲数。
    pub allocated: usize,
}

#[derive(Clone, Copy, Debug)]
struct Cursor {
    dest: DestId,
    position: usize,
}

struct SegmentState {
    storage: Box<[u8]>,
    allocated: bool,
    write: usize,
    anchor: Option<usize>,
    readers: Box<[Option<Cursor>]>,
}

impl SegmentState {
    fn new(capacity: usize, max_readers: u8) -> Self {
        Self {
            storage: alloc::vec![0u8; capacity].into_boxed_slice(),
            allocated: false,
            write: 0,
            anchor: None,
            readers: (0..max_readers).map(|_| None).collect(),
        }
    }

    fn capacity(&self) -> usize {
        self.storage.len()
    }

    fn cursors(&self) -> impl Iterator<Item = usize> + '_ {
        self.anchor.into_iter().chain(
            self.readers
                .iter()
                .flatten()
                .map(|cursor| cursor.position),
        )
    }

    fn free_before(&self, position: usize) -> usize {
        let capacity = self.capacity();
        (position + capacity - self.write - 1) % capacity
    }

    fn stored_after(&self, position: usize) -> usize {
        let capacity = self.capacity();
        (self.write + capacity - position) % capacity
    }

    fn total_free(&self) -> usize {
        self.cursors()
            .map(|position| self.free_before(position))
            .min()
            .unwrap_or(self.capacity() - 1)
    }

    /// 写游标处的连续空闲区间。
    fn write_run(&self) -> Range<usize> {
        span::split_at_boundary(self.capacity(), self.write, self.total_free()).head
    }

    /// 游标处的连续可读区间。
    fn read_run(&self, position: usize) -> Range<usize> {
        span::split_at_boundary(self.capacity(), position, self.stored_after(position)).head
    }

    fn reader(&self, index: usize) -> Result<Cursor, SegmentError> {
        self.readers
            .get(index)
            .copied()
            .flatten()
            .ok_or(SegmentError::UnknownReader)
    }

    fn reader_mut(&mut self, index: usize) -> Result<&mut Cursor, SegmentError> {
        self.readers
            .get_mut(index)
            .and_then(Option::as_mut)
            .ok_or(SegmentError::UnknownReader)
    }

    fn put(&mut self, bytes: &[u8]) -> Result<(), SegmentError> {
        if !self.allocated {
            return Err(SegmentError::NotAllocated);
        }
        let free = self.total_free();
        if bytes.len() > free {
            return Err(SegmentError::Rejected {
                requested: bytes.len(),
                free,
            });
        }
        self.write = span::copy_in(&mut self.storage, self.write, bytes);
        Ok(())
    }

    fn get(&mut self, index: usize, out: &mut [u8]) -> Result<(), SegmentError> {
        let cursor = self.reader(index)?;
        let stored = self.stored_after(cursor.position);
        if out.len() > stored {
            return Err(SegmentError::Busy {
                requested: out.len(),
                stored,
            });
        }
        let next = span::copy_out(&self.storage, cursor.position, out);
        self.reader_mut(index)?.position = next;
        Ok(())
    }

    /// 新读者的起点：起点锚，否则与最落后的读者对齐，否则从写游标开始。
    fn join_position(&self) -> usize {
        if let Some(anchor) = self.anchor {
            return anchor;
        }
        self.readers
            .iter()
            .flatten()
            .max_by_key(|cursor| self.stored_after(cursor.position))
            .map_or(self.write, |cursor| cursor.position)
    }
}

struct SegmentBuffer {
    state: Mutex<SegmentState>,
}

/// 分段缓冲管理器。
pub struct SegmentBufferManager {
    buffers: Box<[SegmentBuffer]>,
    reporter: Arc<dyn ErrorReporter>,
    claims: AtomicUsize,
    releases: AtomicUsize,
    rejected_puts: AtomicUsize,
    allocated: AtomicUsize,
}

impl SegmentBufferManager {
    /// 按配置一次性分配全部缓冲存储。
    pub fn new(config: &RouterConfig, reporter: Arc<dyn ErrorReporter>) -> Self {
        Self {
            buffers: config
                .buffers
                .iter()
                .map(|buffer| SegmentBuffer {
                    state: Mutex::new(SegmentState::new(buffer.capacity, buffer.max_readers)),
                })
                .collect(),
            reporter,
            claims: AtomicUsize::new(0),
            releases: AtomicUsize::new(0),
            rejected_puts: AtomicUsize::new(0),
            allocated: AtomicUsize::new(0),
        }
    }

    /// 缓冲数量。
    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    /// 是否没有任何缓冲。
    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// 环形存储字节数。
    pub fn capacity(&self, id: BufferId) -> usize {
        self.buffer(id).state.lock().capacity()
    }

    /// 是否已被占用。
    pub fn is_allocated(&self, id: BufferId) -> bool {
        self.buffer(id).state.lock().allocated
    }

    /// 占用一个空闲缓冲：写游标归零，清空读者表，放置起点锚。已占用时返回 `false`。
    pub fn claim(&self, id: BufferId) -> bool {
        let mut state = self.buffer(id).state.lock();
        if state.allocated {
            return false;
        }
        state.allocated = true;
        state.write = 0;
        state.anchor = Some(0);
        state.readers.iter_mut().for_each(|reader| *reader = None);
        self.claims.fetch_add(1, Ordering::Relaxed);
        self.allocated.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// 归还缓冲，不清理内容。归还未占用的缓冲会上报 [`RuntimeError::DoubleRelease`] 并返回 `false`。
    pub fn release(&self, id: BufferId) -> bool {
        let mut state = self.buffer(id).state.lock();
        if !state.allocated {
            drop(state);
            self.reporter
                .runtime_error(ApiId::SegmentAccess, RuntimeError::DoubleRelease);
            return false;
        }
        state.allocated = false;
        state.anchor = None;
        state.readers.iter_mut().for_each(|reader| *reader = None);
        self.releases.fetch_add(1, Ordering::Relaxed);
        self.allocated.fetch_sub(1, Ordering::Relaxed);
        true
    }

    /// 写入 `bytes`；超过空闲空间时整体拒绝。
    pub fn put(&self, id: BufferId, bytes: &[u8]) -> Result<(), SegmentError> {
        let result = self.buffer(id).state.lock().put(bytes);
        if let Err(SegmentError::Rejected { .. }) = result {
            self.rejected_puts.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    /// 为读者读出 `out.len()` 字节；可读不足时返回 `Busy`。
    pub fn get(&self, reader: ReaderId, out: &mut [u8]) -> Result<(), SegmentError> {
        self.buffer(reader.buffer()).state.lock().get(reader.index(), out)
    }

    /// 以闭包方式暴露写游标处最长的连续空闲区间（可能为空）。
    ///
    /// 闭包写入后需调用 [`advance_write`](Self::advance_write) 提交。
    pub fn write_pointer<R>(&self, id: BufferId, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut state = self.buffer(id).state.lock();
        let run = if state.allocated {
            state.write_run()
        } else {
            state.write..state.write
        };
        f(&mut state.storage[run])
    }

    /// 提交经由 [`write_pointer`](Self::write_pointer) 写入的 `n` 字节。
    pub fn advance_write(&self, id: BufferId, n: usize) -> Result<(), SegmentError> {
        let mut state = self.buffer(id).state.lock();
        if !state.allocated {
            return Err(SegmentError::NotAllocated);
        }
        let run = state.write_run().len();
        if n > run {
            return Err(SegmentError::ExceedsRun { requested: n, run });
        }
        state.write = span::advance(state.capacity(), state.write, n);
        Ok(())
    }

    /// 以闭包方式暴露读者游标处最长的连续可读区间（未绑定时为空）。
    pub fn read_pointer<R>(&self, reader: ReaderId, f: impl FnOnce(&[u8]) -> R) -> R {
        let state = self.buffer(reader.buffer()).state.lock();
        match state.reader(reader.index()) {
            Ok(cursor) => f(&state.storage[state.read_run(cursor.position)]),
            Err(_) => f(&[]),
        }
    }

    /// 提交经由 [`read_pointer`](Self::read_pointer) 消费的 `n` 字节。
    pub fn advance_read(&self, reader: ReaderId, n: usize) -> Result<(), SegmentError> {
        let mut state = self.buffer(reader.buffer()).state.lock();
        let cursor = state.reader(reader.index())?;
        let run = state.read_run(cursor.position).len();
        if n > run {
            return Err(SegmentError::ExceedsRun { requested: n, run });
        }
        let capacity = state.capacity();
        state.reader_mut(reader.index())?.position = span::advance(capacity, cursor.position, n);
        Ok(())
    }

    /// 写者视角的总空闲字节数，受最落后的游标限制。
    pub fn total_free(&self, id: BufferId) -> usize {
        let state = self.buffer(id).state.lock();
        if state.allocated { state.total_free() } else { 0 }
    }

    /// 写游标处连续空闲字节数。
    pub fn linear_free(&self, id: BufferId) -> usize {
        let state = self.buffer(id).state.lock();
        if state.allocated {
            state.write_run().len()
        } else {
            0
        }
    }

    /// 某个读者可读的总字节数；未绑定时为 0。
    pub fn total_stored(&self, reader: ReaderId) -> usize {
        let state = self.buffer(reader.buffer()).state.lock();
        state
            .reader(reader.index())
            .map_or(0, |cursor| state.stored_after(cursor.position))
    }

    /// 某个读者游标处连续可读字节数。
    pub fn linear_stored(&self, reader: ReaderId) -> usize {
        let state = self.buffer(reader.buffer()).state.lock();
        state
            .reader(reader.index())
            .map_or(0, |cursor| state.read_run(cursor.position).len())
    }

    /// 最落后的游标（含起点锚）所见的字节数；无游标时为 0。
    pub fn laggard_stored(&self, id: BufferId) -> usize {
        let state = self.buffer(id).state.lock();
        state
            .cursors()
            .map(|position| state.stored_after(position))
            .max()
            .unwrap_or(0)
    }

    /// 为目的地绑定读实例；同一目的地重复绑定返回已有实例。
    pub fn bind_reader(&self, id: BufferId, dest: DestId) -> Result<ReaderId, SegmentError> {
        let id = self.checked(id);
        let mut state = self.buffers[id.index()].state.lock();
        if !state.allocated {
            return Err(SegmentError::NotAllocated);
        }
        if let Some(index) = state
            .readers
            .iter()
            .position(|reader| reader.is_some_and(|cursor| cursor.dest == dest))
        {
            return Ok(ReaderId::new(id, index as u8));
        }
        let position = state.join_position();
        let Some(index) = state.readers.iter().position(Option::is_none) else {
            return Err(SegmentError::ReaderTableFull);
        };
        state.readers[index] = Some(Cursor { dest, position });
        Ok(ReaderId::new(id, index as u8))
    }

    /// 销毁读实例。
    pub fn unbind_reader(&self, reader: ReaderId) -> Result<(), SegmentError> {
        let mut state = self.buffer(reader.buffer()).state.lock();
        let slot = state
            .readers
            .get_mut(reader.index())
            .ok_or(SegmentError::UnknownReader)?;
        slot.take().map(|_| ()).ok_or(SegmentError::UnknownReader)
    }

    /// 移除起点锚；此后写者只受已绑定读实例限制。
    pub fn release_anchor(&self, id: BufferId) {
        self.buffer(id).state.lock().anchor = None;
    }

    /// 当前绑定的读实例数量。
    pub fn bound_readers(&self, id: BufferId) -> usize {
        self.buffer(id).state.lock().readers.iter().flatten().count()
    }

    /// 统计快照；只读原子计数，不触碰任何缓冲的互斥量，可在任意上下文调用。
    pub fn stats(&self) -> SegmentStats {
        SegmentStats {
            claims: self.claims.load(Ordering::Relaxed),
            releases: self.releases.load(Ordering::Relaxed),
            rejected_puts: self.rejected_puts.load(Ordering::Relaxed),
            allocated: self.allocated.load(Ordering::Relaxed),
        }
    }

    fn checked(&self, id: BufferId) -> BufferId {
        let index = clamp_index(
            &*self.reporter,
            ApiId::SegmentAccess,
            id.index(),
            self.buffers.len(),
        );
        BufferId::new(index as u16)
    }

    fn buffer(&self, id: BufferId) -> &SegmentBuffer {
        &self.buffers[self.checked(id).index()]
    }
}

#[cfg(test)]
mod tests {
    use alloc::vec;

    use super::*;
    use crate::config::{
        BufferConfig, DestinationConfig, LockConfig, QueueConfig, RouteConfig, RouterConfig,
    };
    use crate::ids::{LockId, QueueId, RouteId};
    use crate::test_stubs::RecordingReporter;

    fn manager(capacity: usize, readers: u8) -> (SegmentBufferManager, Arc<RecordingReporter>) {
        let config = RouterConfig {
            core_count: 1,
            locks: vec![LockConfig::exclusive_area()],
            buffers: vec![BufferConfig::new(capacity).with_readers(readers)],
            queues: vec![QueueConfig::new(1, LockId::new(0), [BufferId::new(0)])],
            routes: vec![RouteConfig::new(QueueId::new(0), LockId::new(0), [DestId::new(0)])],
            destinations: vec![DestinationConfig::downstream(RouteId::new(0))],
        };
        let reporter = Arc::new(RecordingReporter::default());
        (SegmentBufferManager::new(&config, reporter.clone()), reporter)
    }

    const BUF: BufferId = BufferId::new(0);

    #[test]
    fn anchor_limits_writer_until_released() {
        let (segments, _) = manager(8, 1);
        assert!(segments.claim(BUF));
        assert_eq!(segments.total_free(BUF), 7);
        segments.put(BUF, &[1; 7]).expect("7 字节正好写满");
        assert_eq!(
            segments.put(BUF, &[2]),
            Err(SegmentError::Rejected {
                requested: 1,
                free: 0
            })
        );

        let reader = segments.bind_reader(BUF, DestId::new(0)).expect("绑定读者");
        segments.release_anchor(BUF);
        assert_eq!(segments.total_stored(reader), 7);
        let mut out = [0u8; 3];
        segments.get(reader, &mut out).expect("读取 3 字节");
        assert_eq!(segments.total_free(BUF), 3);
    }

    #[test]
    fn coincident_cursors_mean_empty() {
        let (segments, _) = manager(8, 1);
        segments.claim(BUF);
        let reader = segments.bind_reader(BUF, DestId::new(0)).expect("绑定读者");
        segments.release_anchor(BUF);
        segments.put(BUF, &[1, 2, 3]).expect("写入");
        let mut out = [0u8; 3];
        segments.get(reader, &mut out).expect("读取");
        assert_eq!(segments.total_stored(reader), 0);
        assert_eq!(segments.total_free(BUF), 7);
        assert_eq!(
            segments.get(reader, &mut [0u8; 1]),
            Err(SegmentError::Busy {
                requested: 1,
                stored: 0
            })
        );
    }

    #[test]
    fn slowest_reader_governs_free_space() {
        let (segments, _) = manager(16, 2);
        segments.claim(BUF);
        let fast = segments.bind_reader(BUF, DestId::new(0)).expect("fast");
        let slow = segments.bind_reader(BUF, DestId::new(1)).expect("slow");
        segments.release_anchor(BUF);
        segments.put(BUF, &[7; 10]).expect("写入 10 字节");
        segments.get(fast, &mut [0u8; 10]).expect("fast 读完");
        segments.get(slow, &mut [0u8; 2]).expect("slow 读 2 字节");
        assert_eq!(segments.total_free(BUF), 15 - 8);
        assert_eq!(segments.laggard_stored(BUF), 8);
        assert_eq!(segments.total_free(BUF) + segments.laggard_stored(BUF), 15);
    }

    #[test]
    fn zero_copy_paths_wrap_at_the_end() {
        let (segments, _) = manager(8, 1);
        segments.claim(BUF);
        let reader = segments.bind_reader(BUF, DestId::new(0)).expect("绑定");
        segments.release_anchor(BUF);
        segments.put(BUF, &[0; 6]).expect("推进写游标");
        segments.get(reader, &mut [0u8; 6]).expect("推进读游标");

        let run = segments.write_pointer(BUF, |run| {
            run.copy_from_slice(&[0xAA, 0xBB][..run.len()]);
            run.len()
        });
        assert_eq!(run, 2, "写游标距末尾 2 字节");
        segments.advance_write(BUF, run).expect("提交");
        assert_eq!(segments.linear_free(BUF), 5);
        assert_eq!(
            segments.advance_write(BUF, 6),
            Err(SegmentError::ExceedsRun {
                requested: 6,
                run: 5
            })
        );

        let seen = segments.read_pointer(reader, |run| run.to_vec());
        assert_eq!(seen, vec![0xAA, 0xBB]);
        segments.advance_read(reader, 2).expect("提交读取");
        assert_eq!(segments.total_stored(reader), 0);
    }

    #[test]
    fn two_zero_copy_runs_cover_the_whole_free_span() {
        for offset in 0..8 {
            let (segments, _) = manager(8, 1);
            segments.claim(BUF);
            let reader = segments.bind_reader(BUF, DestId::new(0)).expect("绑定");
            segments.release_anchor(BUF);
            segments.put(BUF, &vec![0; offset]).expect("推进写游标");
            segments
                .get(reader, &mut vec![0u8; offset])
                .expect("推进读游标");

            let expected = split_at_boundary(8, offset, segments.total_free(BUF));
            let first = segments.write_pointer(BUF, |run| {
                run.fill(0x5A);
                run.len()
            });
            assert_eq!(first, expected.head.len(), "offset {offset}");
            segments.advance_write(BUF, first).expect("提交第一段");
            assert_eq!(segments.linear_free(BUF), expected.tail.len(), "offset {offset}");
            assert_eq!(
                segments.read_pointer(reader, |run| run.len()),
                first,
                "读侧连续区间与写入的第一段一致"
            );
        }
    }

    #[test]
    fn stats_do_not_wait_on_a_held_buffer() {
        let (segments, _) = manager(8, 1);
        segments.claim(BUF);
        let _held = segments.buffers[0].state.lock();
        let stats = segments.stats();
        assert_eq!((stats.claims, stats.allocated), (1, 1));
    }

    #[test]
    fn rebinding_returns_existing_instance_and_table_is_bounded() {
        let (segments, _) = manager(8, 1);
        segments.claim(BUF);
        let first = segments.bind_reader(BUF, DestId::new(0)).expect("绑定");
        assert_eq!(segments.bind_reader(BUF, DestId::new(0)), Ok(first));
        assert_eq!(
            segments.bind_reader(BUF, DestId::new(1)),
            Err(SegmentError::ReaderTableFull)
        );
        segments.unbind_reader(first).expect("解绑");
        assert_eq!(
            segments.unbind_reader(first),
            Err(SegmentError::UnknownReader)
        );
    }

    #[test]
    fn release_twice_is_reported_once_and_ignored() {
        let (segments, reporter) = manager(8, 1);
        segments.claim(BUF);
        assert!(segments.release(BUF));
        assert!(!segments.release(BUF));
        assert_eq!(
            reporter.runtime_errors(),
            vec![(ApiId::SegmentAccess, RuntimeError::DoubleRelease)]
        );
        let stats = segments.stats();
        assert_eq!((stats.claims, stats.releases, stats.allocated), (1, 1, 0));
    }

    #[test]
    fn free_buffers_reject_io() {
        let (segments, _) = manager(8, 1);
        assert_eq!(segments.put(BUF, &[1]), Err(SegmentError::NotAllocated));
        assert_eq!(
            segments.bind_reader(BUF, DestId::new(0)),
            Err(SegmentError::NotAllocated)
        );
        assert_eq!(segments.write_pointer(BUF, |run| run.len()), 0);
    }
}
