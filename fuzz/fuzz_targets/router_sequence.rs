#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use spark_pdu_router::config::{
    BufferConfig, DestinationConfig, LockConfig, QueueConfig, RouteConfig,
};
use spark_pdu_router::diagnostics::RuntimeError;
use spark_pdu_router::platform::SingleContext;
use spark_pdu_router::test_stubs::{RecordingDispatch, RecordingReporter};
use spark_pdu_router::{
    BufferId, DestId, LockId, Outcome, QueueId, RouteId, Router, RouterConfig,
};
use std::sync::Arc;

/// Fuzz 指令：源模块、下层模块与上层窗口的任意交错调用。
///
/// - **Why**：取消、失败指示与流式触发的乱序组合最容易引出重复释放或永久占用；
/// - **How**：两条路由共享一个队列，扇出到下层与上层目的地，操作按下标映射到实例；
/// - **What**：任何序列都不得 panic、不得重复释放缓冲；`reset` 之后全部缓冲归还。
#[derive(Debug, Arbitrary)]
enum RouterOp {
    Start { route: u8, metadata: u8, total: u16 },
    CopyRx { route: u8, len: u8 },
    Indicate { route: u8, success: bool },
    CancelRx { route: u8 },
    CopyTx { dest: u8, len: u8 },
    Confirm { dest: u8, success: bool },
    CancelTx { dest: u8 },
    Window { dest: u8, window: u8 },
    Reject { dest: u8, rejected: bool },
    Main,
}

const ROUTES: u8 = 2;
const DESTS: u8 = 4;

fuzz_target!(|ops: Vec<RouterOp>| {
    let dispatch = Arc::new(RecordingDispatch::default());
    let reporter = Arc::new(RecordingReporter::default());
    let Ok(router) = Router::builder(config())
        .dispatch(dispatch.clone())
        .platform(Arc::new(SingleContext))
        .reporter(reporter.clone())
        .build()
    else {
        panic!("固定配置必须合法");
    };
    let payload = [0xA5u8; 255];
    let mut sink = [0u8; 255];

    for op in ops {
        match op {
            RouterOp::Start { route, metadata, total } => {
                let metadata = &payload[..usize::from(metadata % 5)];
                let _ = router.start_of_reception(route_id(route), metadata, usize::from(total));
            }
            RouterOp::CopyRx { route, len } => {
                let _ = router.copy_rx_data(route_id(route), &payload[..usize::from(len)]);
            }
            RouterOp::Indicate { route, success } => {
                let _ = router.rx_indication(route_id(route), outcome(success));
            }
            RouterOp::CancelRx { route } => {
                let _ = router.cancel_receive(route_id(route));
            }
            RouterOp::CopyTx { dest, len } => {
                let _ = router.copy_tx_data(dest_id(dest), &mut sink[..usize::from(len)]);
            }
            RouterOp::Confirm { dest, success } => {
                let _ = router.tx_confirmation(dest_id(dest), outcome(success));
            }
            RouterOp::CancelTx { dest } => {
                let _ = router.cancel_transmit(dest_id(dest));
            }
            RouterOp::Window { dest, window } => {
                dispatch.set_window(dest_id(dest), usize::from(window));
            }
            RouterOp::Reject { dest, rejected } => {
                if rejected {
                    dispatch.reject(dest_id(dest));
                } else {
                    dispatch.accept(dest_id(dest));
                }
            }
            RouterOp::Main => router.main_function(),
        }
        assert!(
            !reporter
                .runtime_errors()
                .iter()
                .any(|(_, error)| *error == RuntimeError::DoubleRelease),
            "缓冲或槽位被重复释放"
        );
        assert!(router.segment_stats().allocated <= 3);
    }

    router.reset();
    assert_eq!(router.segment_stats().allocated, 0);
});

fn route_id(raw: u8) -> RouteId {
    RouteId::new(u16::from(raw % ROUTES))
}

fn dest_id(raw: u8) -> DestId {
    DestId::new(u16::from(raw % DESTS))
}

fn outcome(success: bool) -> Outcome {
    if success {
        Outcome::Success
    } else {
        Outcome::Failure
    }
}

fn config() -> RouterConfig {
    let lock = LockId::new(0);
    let queue = QueueId::new(0);
    RouterConfig {
        core_count: 1,
        locks: vec![LockConfig::spinlock(32)],
        buffers: vec![
            BufferConfig::new(16).with_readers(2),
            BufferConfig::new(32).with_readers(2),
            BufferConfig::new(64).with_readers(2),
        ],
        queues: vec![QueueConfig::new(
            3,
            lock,
            [BufferId::new(0), BufferId::new(1), BufferId::new(2)],
        )],
        routes: vec![
            RouteConfig::new(queue, lock, [DestId::new(0), DestId::new(1)])
                .threshold(16)
                .metadata(4),
            RouteConfig::new(queue, lock, [DestId::new(2), DestId::new(3)])
                .threshold(8)
                .metadata(4),
        ],
        destinations: vec![
            DestinationConfig::downstream(RouteId::new(0)),
            DestinationConfig::upstream(RouteId::new(0)),
            DestinationConfig::downstream(RouteId::new(1)).deferred(),
            DestinationConfig::upstream(RouteId::new(1)),
        ],
    }
}
