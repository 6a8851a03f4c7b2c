//! 可重入跨核锁。
//!
//! # 模块角色（Why）
//! - 路由状态、读写游标、FIFO 下标都必须在所属锁内变更；同一核心上的嵌套调用
//!   （例如发送入口在同一调用栈里回调 `copy_tx_data`）不能自锁；
//! - 调用方可能处在中断上下文，任何一次加锁都不允许无限等待。
//!
//! # 核心机制（How）
//! - 每把锁配置为独占区或自旋锁：
//!   - 独占区：只进出本核心独占区（见 [`Platform`]）；
//!   - 自旋锁：先进入本核心独占区串行化同核调用者，若本核心嵌套计数为 0，
//!     再以 `compare_exchange` 争抢共享自旋变量，最多重试 `retry_limit` 次；
//! - 每个核心一份嵌套计数器，加锁时无条件加一，解锁时减一，只有回到 0 时才释放自旋变量；
//! - 重试耗尽视为超时：上报 [`RuntimeError::LockTimeout`]，本次调用继续执行，且本核心不记为持有者，
//!   外层解锁时不会误释放其他核心持有的自旋变量。
//!
//! # 契约说明（What）
//! - 自旋变量被持有，当且仅当某个核心的嵌套计数大于 0 且该核心成功争抢过（超时路径除外）；
//! - 同核任意深度的嵌套只产生一次获取与一次释放，可通过 [`LockStats::acquisitions`] 观测；
//! - 多出来的 `unlock` 上报 [`RuntimeError::UnbalancedUnlock`] 并被忽略。

use alloc::{boxed::Box, sync::Arc};

// 模型检查时换成 Loom 的原子量。
#[cfg(not(all(feature = "loom-model", any(loom, spark_loom))))]
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
#[cfg(all(feature = "loom-model", any(loom, spark_loom)))]
use loom::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

use crate::config::{LockMechanism, RouterConfig};
use crate::diagnostics::{ApiId, ErrorReporter, RuntimeError, clamp_index};
use crate::ids::{CoreId, LockId};
use crate::platform::Platform;

/// 单把锁的统计快照。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LockStats {
    /// 自旋变量被成功争抢的次数（独占区锁恒为 0）。
    pub acquisitions: usize,
    /// 重试耗尽的次数。
    pub timeouts: usize,
}

struct LockCell {
    mechanism: LockMechanism,
    spin: AtomicBool,
    nesting: Box<[AtomicU32]>,
    owns_spin: Box<[AtomicBool]>,
    acquisitions: AtomicUsize,
    timeouts: AtomicUsize,
}

impl LockCell {
    fn new(mechanism: LockMechanism, core_count: usize) -> Self {
        Self {
            mechanism,
            spin: AtomicBool::new(false),
            nesting: (0..core_count).map(|_| AtomicU32::new(0)).collect(),
            owns_spin: (0..core_count).map(|_| AtomicBool::new(false)).collect(),
            acquisitions: AtomicUsize::new(0),
            timeouts: AtomicUsize::new(0),
        }
    }
}

/// 全部路由锁的管理器。
pub struct LockManager {
    locks: Box<[LockCell]>,
    platform: Arc<dyn Platform>,
    reporter: Arc<dyn ErrorReporter>,
}

impl LockManager {
    /// 按配置创建锁表。
    pub fn new(
        config: &RouterConfig,
        platform: Arc<dyn Platform>,
        reporter: Arc<dyn ErrorReporter>,
    ) -> Self {
        let core_count = usize::from(config.core_count.max(1));
        Self {
            locks: config
                .locks
                .iter()
                .map(|lock| LockCell::new(lock.mechanism, core_count))
                .collect(),
            platform,
            reporter,
        }
    }

    /// 加锁；同核可嵌套，永不无限等待。
    pub fn lock(&self, id: LockId) {
        let (id, cell) = self.cell(id, ApiId::Lock);
        self.platform.enter_exclusive(id);
        let core = self.core_index(cell, ApiId::Lock);

        if let LockMechanism::Spinlock { retry_limit } = cell.mechanism {
            if cell.nesting[core].load(Ordering::Relaxed) == 0 {
                self.claim_spin(id, cell, core, retry_limit);
            }
        }
        cell.nesting[core].fetch_add(1, Ordering::Relaxed);
    }

    /// 解锁；只有最外层解锁才释放自旋变量并离开独占区。
    pub fn unlock(&self, id: LockId) {
        let (id, cell) = self.cell(id, ApiId::Unlock);
        let core = self.core_index(cell, ApiId::Unlock);
        let depth = cell.nesting[core].load(Ordering::Relaxed);
        if depth == 0 {
            self.reporter
                .runtime_error(ApiId::Unlock, RuntimeError::UnbalancedUnlock);
            return;
        }
        cell.nesting[core].store(depth - 1, Ordering::Relaxed);
        if depth == 1 && cell.owns_spin[core].swap(false, Ordering::Relaxed) {
            cell.spin.store(false, Ordering::Release);
        }
        self.platform.exit_exclusive(id);
    }

    /// 加锁并返回守卫，守卫析构时解锁。
    pub fn guard(&self, id: LockId) -> LockGuard<'_> {
        self.lock(id);
        LockGuard { manager: self, id }
    }

    /// 共享自旋变量当前是否被持有。
    pub fn is_held(&self, id: LockId) -> bool {
        self.cell(id, ApiId::Lock).1.spin.load(Ordering::Acquire)
    }

    /// 指定核心对该锁的嵌套深度。
    pub fn nesting(&self, id: LockId, core: CoreId) -> u32 {
        let (_, cell) = self.cell(id, ApiId::Lock);
        cell.nesting
            .get(core.index())
            .map_or(0, |depth| depth.load(Ordering::Relaxed))
    }

    /// 统计快照。
    pub fn stats(&self, id: LockId) -> LockStats {
        let (_, cell) = self.cell(id, ApiId::Lock);
        LockStats {
            acquisitions: cell.acquisitions.load(Ordering::Relaxed),
            timeouts: cell.timeouts.load(Ordering::Relaxed),
        }
    }

    fn claim_spin(&self, id: LockId, cell: &LockCell, core: usize, retry_limit: u32) {
        let mut retries = 0u32;
        loop {
            if cell
                .spin
                .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                cell.owns_spin[core].store(true, Ordering::Relaxed);
                cell.acquisitions.fetch_add(1, Ordering::Relaxed);
                return;
            }
            retries += 1;
            if retries >= retry_limit {
                cell.timeouts.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(lock = id.raw(), core, retries, "spinlock retry bound exceeded");
                self.reporter
                    .runtime_error(ApiId::Lock, RuntimeError::LockTimeout);
                return;
            }
            backoff();
        }
    }

    fn cell(&self, id: LockId, api: ApiId) -> (LockId, &LockCell) {
        let index = clamp_index(&*self.reporter, api, id.index(), self.locks.len());
        (LockId::new(index as u16), &self.locks[index])
    }

    fn core_index(&self, cell: &LockCell, api: ApiId) -> usize {
        clamp_index(
            &*self.reporter,
            api,
            self.platform.current_core().index(),
            cell.nesting.len(),
        )
    }
}

#[cfg(not(all(feature = "loom-model", any(loom, spark_loom))))]
fn backoff() {
    core::hint::spin_loop();
}

/// Loom 下忙等必须让出调度。
#[cfg(all(feature = "loom-model", any(loom, spark_loom)))]
fn backoff() {
    loom::thread::yield_now();
}

/// 一次逻辑加锁/解锁配对。
#[must_use = "守卫析构即解锁"]
pub struct LockGuard<'a> {
    manager: &'a LockManager,
    id: LockId,
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        self.manager.unlock(self.id);
    }
}
