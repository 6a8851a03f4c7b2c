//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 集中定义路由核心对调用方暴露的返回值语义：背压、协议违例、句柄越界、传输失败；
//! - 配置加载与校验失败单独归入 [`ConfigError`]，只在构造阶段出现，运行期不会再产生。
//!
//! ## 设计要求（What）
//! - 启用 `std` 时派生 `thiserror::Error`，关闭时提供等价的 `Display` 实现；
//! - 运行期错误全部为 `Copy`，不携带堆分配，可以在中断上下文中按值返回；
//! - 协议违例与越界只在本地恢复并上报（见 [`crate::diagnostics`]），返回值仅用于告知调用方“本次调用无效”。

#[cfg(not(feature = "std"))]
use core::fmt;

#[cfg(feature = "std")]
use thiserror::Error;

use alloc::string::String;

/// 路由入口的统一返回类型。
pub type Result<T, E = RoutingError> = core::result::Result<T, E>;

/// 协作方报告的传输结果。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// 传输完整完成。
    Success,
    /// 传输失败或被中止。
    Failure,
}

impl Outcome {
    /// 是否为成功结果。
    pub const fn is_success(self) -> bool {
        matches!(self, Outcome::Success)
    }
}

/// 路由运行期错误。
///
/// # 教案式说明
/// - **意图 (Why)**：把“暂时不行”“永远不行”“调用方写错了”区分开，调用方据此决定重试、丢弃或修复代码。
/// - **契约 (What)**：
///   - `Busy`：空间暂时不足，状态未改变，稍后重试同一调用；
///   - `Backpressure`：无空闲槽位或足够大的缓冲，本条消息此刻无法接收；
///   - `ProtocolViolation`：当前状态不允许该调用，调用无副作用；
///   - `TransferFailed`：路由已被放弃（协作方失败、取消或触发失败）；
///   - `InvalidHandle`：传入的路由/目的地编号不在配置表内。
#[cfg_attr(feature = "std", derive(Error))]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RoutingError {
    #[cfg_attr(feature = "std", error("insufficient buffer space, retry later"))]
    Busy,
    #[cfg_attr(feature = "std", error("no free FIFO slot or fitting buffer"))]
    Backpressure,
    #[cfg_attr(feature = "std", error("call not permitted in the current routing state"))]
    ProtocolViolation,
    #[cfg_attr(feature = "std", error("routing abandoned"))]
    TransferFailed,
    #[cfg_attr(feature = "std", error("handle outside the configured range"))]
    InvalidHandle,
}

impl RoutingError {
    /// 稳定错误码，供日志与指标维度使用。
    pub const fn code(self) -> &'static str {
        match self {
            RoutingError::Busy => "pdur.busy",
            RoutingError::Backpressure => "pdur.backpressure",
            RoutingError::ProtocolViolation => "pdur.protocol_violation",
            RoutingError::TransferFailed => "pdur.transfer_failed",
            RoutingError::InvalidHandle => "pdur.invalid_handle",
        }
    }

    /// 是否属于可重试的暂时性错误。
    pub const fn is_retryable(self) -> bool {
        matches!(self, RoutingError::Busy | RoutingError::Backpressure)
    }
}

/// 配置加载或校验失败。
///
/// - **意图 (Why)**：静态配置由离线生成步骤产出，任何悬空引用都必须在构造阶段被拦下，
///   运行期的越界检查只作为最后一道防线。
/// - **契约 (What)**：`owner` 为出错条目（如 `route#3`），`detail` 为可读说明。
#[cfg_attr(feature = "std", derive(Error))]
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConfigError {
    /// 必填表为空。
    #[cfg_attr(feature = "std", error("configuration table `{table}` must not be empty"))]
    EmptyTable { table: &'static str },

    /// 条目引用了不存在的编号。
    #[cfg_attr(
        feature = "std",
        error("{owner}: field `{field}` references missing {target}")
    )]
    DanglingReference {
        owner: String,
        field: &'static str,
        target: String,
    },

    /// 条目数值不合法。
    #[cfg_attr(feature = "std", error("{owner}: {detail}"))]
    InvalidValue { owner: String, detail: String },

    /// 共享资源的锁配置不一致。
    #[cfg_attr(feature = "std", error("lock sharing violation: {detail}"))]
    SharingViolation { detail: String },

    /// 配置文本无法解析。
    #[cfg_attr(feature = "std", error("failed to parse configuration: {detail}"))]
    Parse { detail: String },

    /// 构造路由器时缺少必需的协作方。
    #[cfg_attr(feature = "std", error("router collaborator `{name}` was not provided"))]
    MissingCollaborator { name: &'static str },
}

#[cfg(not(feature = "std"))]
impl fmt::Display for RoutingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            RoutingError::Busy => "insufficient buffer space, retry later",
            RoutingError::Backpressure => "no free FIFO slot or fitting buffer",
            RoutingError::ProtocolViolation => "call not permitted in the current routing state",
            RoutingError::TransferFailed => "routing abandoned",
            RoutingError::InvalidHandle => "handle outside the configured range",
        };
        f.write_str(text)
    }
}

#[cfg(not(feature = "std"))]
impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::EmptyTable { table } => {
                write!(f, "configuration table `{table}` must not be empty")
            }
            ConfigError::DanglingReference {
                owner,
                field,
                target,
            } => write!(f, "{owner}: field `{field}` references missing {target}"),
            ConfigError::InvalidValue { owner, detail } => write!(f, "{owner}: {detail}"),
            ConfigError::SharingViolation { detail } => {
                write!(f, "lock sharing violation: {detail}")
            }
            ConfigError::Parse { detail } => write!(f, "failed to parse configuration: {detail}"),
            ConfigError::MissingCollaborator { name } => {
                write!(f, "router collaborator `{name}` was not provided")
            }
        }
    }
}
