//! 诊断与观察出口。
//!
//! # 模块定位（Why）
//! - 开发期错误（协议违例、非法编号）与运行期错误（越界钳制、锁超时、重复释放）
//!   都是“上报即走”的旁路信号，绝不改变控制流；
//! - 观察者钩子同理，供上层在发送前后、接收指示、发送确认时挂接统计或追踪。
//!
//! # 契约（What）
//! - [`ErrorReporter`] 与 [`RoutingObserver`] 的实现必须线程安全，且不得回调路由器入口；
//! - 默认实现 [`TracingReporter`] 通过 `tracing` 输出结构化日志，[`NoopObserver`] 什么都不做。

use crate::error::Outcome;
use crate::ids::{DestId, RouteId};

/// 触发上报的入口标识。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ApiId {
    StartOfReception,
    CopyRxData,
    RxIndication,
    CancelReceive,
    CopyTxData,
    TxConfirmation,
    CancelTransmit,
    TriggerTransmission,
    MainFunction,
    Lock,
    Unlock,
    FifoAllocate,
    FifoRelease,
    SegmentAccess,
}

impl ApiId {
    /// 日志中使用的稳定名称。
    pub const fn as_str(self) -> &'static str {
        match self {
            ApiId::StartOfReception => "start_of_reception",
            ApiId::CopyRxData => "copy_rx_data",
            ApiId::RxIndication => "rx_indication",
            ApiId::CancelReceive => "cancel_receive",
            ApiId::CopyTxData => "copy_tx_data",
            ApiId::TxConfirmation => "tx_confirmation",
            ApiId::CancelTransmit => "cancel_transmit",
            ApiId::TriggerTransmission => "trigger_transmission",
            ApiId::MainFunction => "main_function",
            ApiId::Lock => "lock",
            ApiId::Unlock => "unlock",
            ApiId::FifoAllocate => "fifo_allocate",
            ApiId::FifoRelease => "fifo_release",
            ApiId::SegmentAccess => "segment_access",
        }
    }
}

/// 开发期缺陷：调用方违反了入口契约。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DevError {
    /// 路由或目的地编号不在配置表内。
    InvalidId,
    /// 当前状态不允许该调用。
    InvalidState,
    /// 参数超出配置允许的范围（例如元数据长于配置值）。
    InvalidParameter,
}

/// 运行期异常：配置正确时本不应出现，出现后在本地恢复。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RuntimeError {
    /// 内部句柄越界，已钳制到最近的有效值。
    IndexOutOfBounds,
    /// 自旋锁重试次数耗尽，调用继续执行。
    LockTimeout,
    /// 解锁次数多于加锁次数。
    UnbalancedUnlock,
    /// 释放一个未被占用的缓冲。
    DoubleRelease,
    /// 缓冲读者表已满，无法为目的地创建读实例。
    ReaderExhausted,
}

/// 错误上报出口。
///
/// - **契约 (What)**：两个方法都是“发出即忘”，实现不得阻塞，也不得 panic。
pub trait ErrorReporter: Send + Sync {
    /// 上报开发期缺陷。
    fn development_error(&self, api: ApiId, error: DevError);

    /// 上报运行期异常。
    fn runtime_error(&self, api: ApiId, error: RuntimeError);
}

/// 以 `tracing` 事件输出的默认上报器。
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingReporter;

impl ErrorReporter for TracingReporter {
    fn development_error(&self, api: ApiId, error: DevError) {
        tracing::error!(api = api.as_str(), ?error, "pdu router development error");
    }

    fn runtime_error(&self, api: ApiId, error: RuntimeError) {
        tracing::warn!(api = api.as_str(), ?error, "pdu router runtime error");
    }
}

/// 路由事件观察者，所有方法默认空实现。
pub trait RoutingObserver: Send + Sync {
    /// 目的地即将开始发送（读实例已绑定）。
    fn pre_transmit(&self, _dest: DestId) {}

    /// 目的地的发送入口即将被调用。
    fn transmit(&self, _dest: DestId, _total_length: usize) {}

    /// 源路由的接收结束。
    fn rx_indication(&self, _route: RouteId, _outcome: Outcome) {}

    /// 目的地的发送结束。
    fn tx_confirmation(&self, _dest: DestId, _outcome: Outcome) {}
}

/// 不做任何事的观察者。
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopObserver;

impl RoutingObserver for NoopObserver {}

/// 将内部句柄钳制到 `0..len`，越界时上报 [`RuntimeError::IndexOutOfBounds`]。
///
/// 调用方保证 `len > 0`（配置校验拒绝空表）。
pub(crate) fn clamp_index(
    reporter: &dyn ErrorReporter,
    api: ApiId,
    index: usize,
    len: usize,
) -> usize {
    if index < len {
        index
    } else {
        reporter.runtime_error(api, RuntimeError::IndexOutOfBounds);
        len.saturating_sub(1)
    }
}
