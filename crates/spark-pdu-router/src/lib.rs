#![cfg_attr(not(feature = "std"), no_std)]
#![forbid(unsafe_code)]

//! `spark-pdu-router` 是面向嵌入式网关的 PDU 路由核心。
//!
//! # 模块定位（Why）
//! - 在多个下层传输模块与多个上层消费模块之间转发不透明的负载单元（PDU）；
//! - 任意长度的消息经由一组静态大小的共享环形缓冲转发：运行期不分配内存，
//!   同一缓冲支持多个读者，同一队列内严格保序，多核并发安全。
//!
//! # 设计概要（How）
//! - 自底向上：[`lock`] → [`segment`] → [`fifo`] → [`routing`]（接收/发送状态机）→ [`router`]；
//! - 配置以 [`config::RouterConfig`] 注入并在构造前校验，句柄均为 [`ids`] 中的新类型；
//! - 外部协作方以 trait 表达：[`dispatch::ModuleDispatch`]、[`diagnostics::ErrorReporter`]、
//!   [`diagnostics::RoutingObserver`]、[`platform::Platform`]。
//!
//! # 特性（Features）
//! - `std`（默认）：`thiserror` 错误派生、TOML 配置加载、以线程模拟核心的 `HostPlatform`；
//! - 关闭 `std` 时仅依赖 `alloc`，全部存储仍在构造阶段一次性分配；
//! - `cli`：`pdur-config-check` 配置校验工具。

extern crate alloc;

pub mod config;
pub mod diagnostics;
pub mod dispatch;
pub mod error;
pub mod fifo;
pub mod ids;
pub mod lock;
pub mod platform;
pub mod router;
pub mod routing;
pub mod segment;
pub mod test_stubs;

pub use config::RouterConfig;
pub use dispatch::{ModuleDispatch, TransmitRequest};
pub use error::{ConfigError, Outcome, Result, RoutingError};
pub use ids::{BufferId, CoreId, DestId, LockId, QueueId, ReaderId, RouteId, SlotRef};
pub use router::{Router, RouterBuilder};
pub use routing::{RxState, TxState};
