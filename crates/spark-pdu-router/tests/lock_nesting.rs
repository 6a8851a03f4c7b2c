//! 可重入锁的嵌套与跨核互斥契约。

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use proptest::prelude::*;

use spark_pdu_router::config::{
    BufferConfig, DestinationConfig, LockConfig, QueueConfig, RouteConfig,
};
use spark_pdu_router::diagnostics::{ApiId, RuntimeError};
use spark_pdu_router::lock::LockManager;
use spark_pdu_router::platform::{HostPlatform, Platform, SingleContext};
use spark_pdu_router::test_stubs::RecordingReporter;
use spark_pdu_router::{BufferId, CoreId, DestId, LockId, QueueId, RouteId, RouterConfig};

const LOCK: LockId = LockId::new(0);

fn config(core_count: u16, lock: LockConfig) -> RouterConfig {
    RouterConfig {
        core_count,
        locks: vec![lock],
        buffers: vec![BufferConfig::new(8)],
        queues: vec![QueueConfig::new(1, LOCK, [BufferId::new(0)])],
        routes: vec![RouteConfig::new(QueueId::new(0), LOCK, [DestId::new(0)])],
        destinations: vec![DestinationConfig::downstream(RouteId::new(0))],
    }
}

fn manager(
    core_count: u16,
    lock: LockConfig,
    platform: Arc<dyn Platform>,
) -> (LockManager, Arc<RecordingReporter>) {
    let reporter = Arc::new(RecordingReporter::default());
    (
        LockManager::new(&config(core_count, lock), platform, reporter.clone()),
        reporter,
    )
}

proptest! {
    /// 任意同核嵌套序列：自旋变量在深度 > 0 时恰好被持有，且每段“0 → 正 → 0”只获取一次。
    #[test]
    fn same_core_nesting_holds_spin_exactly_once(
        steps in prop::collection::vec(any::<bool>(), 1..200),
    ) {
        let (locks, reporter) = manager(1, LockConfig::spinlock(4), Arc::new(SingleContext));
        let mut depth = 0u32;
        let mut episodes = 0usize;

        for lock in steps {
            if lock {
                if depth == 0 {
                    episodes += 1;
                }
                locks.lock(LOCK);
                depth += 1;
            } else if depth > 0 {
                locks.unlock(LOCK);
                depth -= 1;
            }
            prop_assert_eq!(locks.is_held(LOCK), depth > 0);
            prop_assert_eq!(locks.nesting(LOCK, CoreId::new(0)), depth);
        }
        while depth > 0 {
            locks.unlock(LOCK);
            depth -= 1;
        }
        prop_assert!(!locks.is_held(LOCK));
        prop_assert_eq!(locks.stats(LOCK).acquisitions, episodes);
        prop_assert!(reporter.runtime_errors().is_empty());
    }
}

fn hammer(locks: Arc<LockManager>, core: CoreId, inside: Arc<AtomicUsize>, rounds: usize) {
    HostPlatform::pin_current_thread(core);
    for _ in 0..rounds {
        let _outer = locks.guard(LOCK);
        let _inner = locks.guard(LOCK);
        assert_eq!(
            inside.fetch_add(1, Ordering::SeqCst),
            0,
            "临界区内不应有其他线程"
        );
        thread::yield_now();
        inside.fetch_sub(1, Ordering::SeqCst);
    }
}

#[test]
fn spinlock_excludes_threads_on_different_cores() {
    let (locks, reporter) = manager(
        2,
        LockConfig::spinlock(u32::MAX),
        Arc::new(HostPlatform::new(2)),
    );
    let locks = Arc::new(locks);
    let inside = Arc::new(AtomicUsize::new(0));

    let workers: Vec<_> = [CoreId::new(0), CoreId::new(1)]
        .into_iter()
        .map(|core| {
            let locks = Arc::clone(&locks);
            let inside = Arc::clone(&inside);
            thread::spawn(move || hammer(locks, core, inside, 500))
        })
        .collect();
    for worker in workers {
        worker.join().expect("工作线程不应 panic");
    }

    assert!(!locks.is_held(LOCK));
    assert_eq!(locks.stats(LOCK).timeouts, 0);
    assert!(reporter.runtime_errors().is_empty());
}

#[test]
fn exclusive_area_serialises_threads_on_the_same_core() {
    let (locks, _) = manager(
        1,
        LockConfig::exclusive_area(),
        Arc::new(HostPlatform::new(1)),
    );
    let locks = Arc::new(locks);
    let inside = Arc::new(AtomicUsize::new(0));

    let workers: Vec<_> = (0..3)
        .map(|_| {
            let locks = Arc::clone(&locks);
            let inside = Arc::clone(&inside);
            thread::spawn(move || hammer(locks, CoreId::new(0), inside, 300))
        })
        .collect();
    for worker in workers {
        worker.join().expect("工作线程不应 panic");
    }
    assert_eq!(locks.stats(LOCK).acquisitions, 0, "独占区锁不使用自旋变量");
}

#[test]
fn timeout_is_reported_and_the_caller_proceeds() {
    let (locks, reporter) = manager(
        2,
        LockConfig::spinlock(5),
        Arc::new(HostPlatform::new(2)),
    );
    let locks = Arc::new(locks);

    HostPlatform::pin_current_thread(CoreId::new(0));
    locks.lock(LOCK);

    let contender = {
        let locks = Arc::clone(&locks);
        thread::spawn(move || {
            HostPlatform::pin_current_thread(CoreId::new(1));
            locks.lock(LOCK);
            let depth = locks.nesting(LOCK, CoreId::new(1));
            locks.unlock(LOCK);
            depth
        })
    };
    assert_eq!(contender.join().expect("竞争线程不应 panic"), 1);
    assert!(locks.is_held(LOCK), "超时方的解锁不影响持有方");
    assert_eq!(
        reporter.runtime_errors(),
        vec![(ApiId::Lock, RuntimeError::LockTimeout)]
    );

    locks.unlock(LOCK);
    assert!(!locks.is_held(LOCK));
}
