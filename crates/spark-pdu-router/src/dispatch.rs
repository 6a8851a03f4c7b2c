//! 目的地模块分发接口。
//!
//! # 设计背景（Why）
//! - 路由核心不认识具体的传输或消费模块，只通过目的地编号把调用转发出去；
//! - 下层传输模块采用“拉”模型：路由器调用 [`ModuleDispatch::transmit`] 宣告一条消息，
//!   对端随后回调 `copy_tx_data` 拉取字节，最后以 `tx_confirmation` 结束；
//! - 上层消费模块采用“推”模型：路由器依次合成 `start_of_reception`、若干次 `copy_rx_data`
//!   与一次 `rx_indication`。
//!
//! # 契约（What）
//! - 所有方法都可能在持有路由逻辑锁的上下文中被调用；实现可以同步回调路由器入口
//!   （锁是同核可重入的），但不得在其他线程上等待路由器；
//! - 返回 `Err` 表示对端拒绝本次调用，对应目的地的本次发送视为失败。

use crate::error::{Outcome, Result};
use crate::ids::DestId;

/// 宣告给目的地的消息描述。
///
/// 只携带长度信息，负载字节通过读实例按需拉取或推送。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransmitRequest {
    /// 负载总长度，`0` 表示未知。
    pub total_length: usize,
    /// 负载之前的元数据长度，元数据与负载在缓冲中连续存放。
    pub metadata_length: usize,
    /// 宣告时该目的地已可读取的字节数（含元数据）。
    pub buffered: usize,
}

impl TransmitRequest {
    /// 目的地将会收到的总字节数；总长度未知时返回 `None`。
    pub const fn delivered_length(&self) -> Option<usize> {
        if self.total_length == 0 {
            None
        } else {
            Some(self.total_length + self.metadata_length)
        }
    }
}

/// 目的地编号到模块回调的映射。
pub trait ModuleDispatch: Send + Sync {
    /// 下层目的地：宣告一条待发送消息。
    fn transmit(&self, dest: DestId, request: TransmitRequest) -> Result<()>;

    /// 上层目的地：开始接收，返回对端当前可接收的字节数。
    fn start_of_reception(&self, dest: DestId, request: TransmitRequest) -> Result<usize>;

    /// 上层目的地：推送一段字节，返回对端剩余可接收字节数。
    ///
    /// `bytes` 为空时仅查询窗口。
    fn copy_rx_data(&self, dest: DestId, bytes: &[u8]) -> Result<usize>;

    /// 上层目的地：接收结束。
    fn rx_indication(&self, dest: DestId, outcome: Outcome);
}
