//! 并发分区与独占区抽象。
//!
//! # 设计背景（Why）
//! - 路由核心运行在“多个可抢占上下文 + 多个核心”的环境中：同核上的抢占靠独占区（典型为关中断）排除，
//!   跨核靠自旋变量排除；两者都由具体平台提供；
//! - 把“我在哪个核上”“如何进出本核独占区”抽成 [`Platform`]，锁管理器与发送状态机都只依赖该 trait。
//!
//! # 契约（What）
//! - `enter_exclusive`/`exit_exclusive` 必须支持同一上下文内嵌套，并严格配对；
//! - `current_core` 返回值必须小于配置中的 `core_count`，越界值会被锁管理器钳制并上报。
//!
//! # 提供的实现（How）
//! - [`SingleContext`]：单上下文目标，独占区为空操作，适合从不被抢占的调用环境；
//! - [`HostPlatform`]（`std`）：以线程模拟核心，线程通过 [`HostPlatform::pin_current_thread`] 绑定分区，
//!   每个核心的独占区是一个记录持有线程的可重入区段。

use crate::ids::{CoreId, LockId};

/// 平台钩子。
pub trait Platform: Send + Sync {
    /// 调用者所在的核心。
    fn current_core(&self) -> CoreId;

    /// 进入本核心独占区。
    fn enter_exclusive(&self, lock: LockId);

    /// 离开本核心独占区。
    fn exit_exclusive(&self, lock: LockId);
}

/// 单上下文平台：永远位于核心 0，独占区为空操作。
#[derive(Clone, Copy, Debug, Default)]
pub struct SingleContext;

impl Platform for SingleContext {
    fn current_core(&self) -> CoreId {
        CoreId::new(0)
    }

    fn enter_exclusive(&self, _lock: LockId) {}

    fn exit_exclusive(&self, _lock: LockId) {}
}

#[cfg(feature = "std")]
pub use host::HostPlatform;

#[cfg(feature = "std")]
mod host {
    use std::{
        boxed::Box,
        cell::Cell,
        sync::atomic::{AtomicUsize, Ordering},
        thread,
    };

    use super::Platform;
    use crate::ids::{CoreId, LockId};

    static NEXT_TOKEN: AtomicUsize = AtomicUsize::new(1);

    thread_local! {
        static PINNED_CORE: Cell<u16> = const { Cell::new(0) };
        static THREAD_TOKEN: usize = NEXT_TOKEN.fetch_add(1, Ordering::Relaxed);
    }

    /// 以宿主线程模拟核心的平台实现。
    ///
    /// - 未显式绑定的线程位于核心 0；
    /// - 同一核心上的线程通过该核心的独占区互斥，模拟同核抢占被屏蔽的效果；
    /// - 不同核心的独占区互不影响，跨核互斥交给锁管理器的自旋变量。
    #[derive(Debug)]
    pub struct HostPlatform {
        sections: Box<[ReentrantSection]>,
    }

    impl HostPlatform {
        /// 为 `core_count` 个核心各创建一个独占区。
        pub fn new(core_count: u16) -> Self {
            let count = usize::from(core_count.max(1));
            Self {
                sections: (0..count).map(|_| ReentrantSection::default()).collect(),
            }
        }

        /// 将当前线程绑定到指定核心。
        pub fn pin_current_thread(core: CoreId) {
            PINNED_CORE.with(|pinned| pinned.set(core.raw()));
        }

        /// 当前线程绑定的核心。
        pub fn current_thread_core() -> CoreId {
            CoreId::new(PINNED_CORE.with(Cell::get))
        }

        fn section(&self) -> &ReentrantSection {
            let index = Self::current_thread_core()
                .index()
                .min(self.sections.len() - 1);
            &self.sections[index]
        }
    }

    impl Platform for HostPlatform {
        fn current_core(&self) -> CoreId {
            Self::current_thread_core()
        }

        fn enter_exclusive(&self, _lock: LockId) {
            self.section().enter(THREAD_TOKEN.with(|token| *token));
        }

        fn exit_exclusive(&self, _lock: LockId) {
            self.section().exit(THREAD_TOKEN.with(|token| *token));
        }
    }

    /// 记录持有线程与嵌套深度的可重入区段。
    ///
    /// `owner == 0` 表示空闲；`depth` 只由持有线程修改。
    #[derive(Debug, Default)]
    struct ReentrantSection {
        owner: AtomicUsize,
        depth: AtomicUsize,
    }

    impl ReentrantSection {
        fn enter(&self, token: usize) {
            if self.owner.load(Ordering::Acquire) == token {
                self.depth.fetch_add(1, Ordering::Relaxed);
                return;
            }
            while self
                .owner
                .compare_exchange_weak(0, token, Ordering::Acquire, Ordering::Relaxed)
                .is_err()
            {
                thread::yield_now();
            }
            self.depth.store(1, Ordering::Relaxed);
        }

        fn exit(&self, token: usize) {
            if self.owner.load(Ordering::Relaxed) != token {
                return;
            }
            if self.depth.fetch_sub(1, Ordering::Relaxed) == 1 {
                self.owner.store(0, Ordering::Release);
            }
        }
    }

    #[cfg(test)]
    mod tests {
        use std::sync::{
            Arc,
            atomic::{AtomicBool, Ordering},
        };
        use std::thread;

        use super::*;

        #[test]
        fn pinning_is_per_thread() {
            let platform = HostPlatform::new(2);
            HostPlatform::pin_current_thread(CoreId::new(1));
            assert_eq!(platform.current_core(), CoreId::new(1));
            let other = thread::spawn(HostPlatform::current_thread_core)
                .join()
                .expect("子线程不应 panic");
            assert_eq!(other, CoreId::new(0), "未绑定的线程默认位于核心 0");
            HostPlatform::pin_current_thread(CoreId::new(0));
        }

        #[test]
        fn same_core_section_excludes_other_threads_and_nests() {
            let platform = Arc::new(HostPlatform::new(1));
            let lock = LockId::new(0);
            platform.enter_exclusive(lock);
            platform.enter_exclusive(lock);

            let entered = Arc::new(AtomicBool::new(false));
            let contender = {
                let platform = Arc::clone(&platform);
                let entered = Arc::clone(&entered);
                thread::spawn(move || {
                    platform.enter_exclusive(lock);
                    entered.store(true, Ordering::SeqCst);
                    platform.exit_exclusive(lock);
                })
            };

            platform.exit_exclusive(lock);
            thread::sleep(std::time::Duration::from_millis(20));
            assert!(
                !entered.load(Ordering::SeqCst),
                "内层退出后独占区仍由外层持有"
            );
            platform.exit_exclusive(lock);
            contender.join().expect("竞争线程不应 panic");
            assert!(entered.load(Ordering::SeqCst));
        }
    }
}
