//! 静态路由配置。
//!
//! # 模块定位（Why）
//! - 容量、池成员、阈值等数据由离线生成步骤产出，运行期只读；
//! - 以 `serde` 派生的结构体承载，既可在代码中直接构造，也可从 TOML 文本加载（`std` 特性）。
//!
//! # 结构（How）
//! - [`RouterConfig`] 聚合六张表：核心数、锁、缓冲、队列、路由、目的地；
//! - [`validation`] 在构造路由器前校验全部交叉引用与共享规则；
//! - `loader` 子模块提供 TOML 入口。
//!
//! # 契约（What）
//! - 表下标即句柄编号：`buffers[3]` 对应 [`BufferId::new(3)`](crate::ids::BufferId::new)；
//! - 校验通过后配置不再改变，路由器内部以 `Arc<RouterConfig>` 共享。

use alloc::vec::Vec;

use serde::{Deserialize, Serialize};

use crate::ids::{BufferId, CoreId, DestId, LockId, QueueId, RouteId};

#[cfg(feature = "std")]
mod loader;
pub mod validation;

/// 路由器完整配置。
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RouterConfig {
    /// 并发分区（核心）数量，决定每把锁的嵌套计数器个数。
    #[serde(default = "default_core_count")]
    pub core_count: u16,
    pub locks: Vec<LockConfig>,
    pub buffers: Vec<BufferConfig>,
    pub queues: Vec<QueueConfig>,
    pub routes: Vec<RouteConfig>,
    pub destinations: Vec<DestinationConfig>,
}

fn default_core_count() -> u16 {
    1
}

impl RouterConfig {
    /// 查询锁配置。
    pub fn lock(&self, id: LockId) -> Option<&LockConfig> {
        self.locks.get(id.index())
    }

    /// 查询缓冲配置。
    pub fn buffer(&self, id: BufferId) -> Option<&BufferConfig> {
        self.buffers.get(id.index())
    }

    /// 查询队列配置。
    pub fn queue(&self, id: QueueId) -> Option<&QueueConfig> {
        self.queues.get(id.index())
    }

    /// 查询路由配置。
    pub fn route(&self, id: RouteId) -> Option<&RouteConfig> {
        self.routes.get(id.index())
    }

    /// 查询目的地配置。
    pub fn destination(&self, id: DestId) -> Option<&DestinationConfig> {
        self.destinations.get(id.index())
    }
}

/// 锁的实现机制。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LockMechanism {
    /// 仅进入本核心的独占区（关中断一类），适用于单核共享。
    ExclusiveArea,
    /// 先进入本核心独占区，再跨核争抢自旋变量；`retry_limit` 为最大重试次数。
    Spinlock { retry_limit: u32 },
}

/// 单把锁的配置。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LockConfig {
    pub mechanism: LockMechanism,
}

impl LockConfig {
    /// 独占区锁。
    pub const fn exclusive_area() -> Self {
        Self {
            mechanism: LockMechanism::ExclusiveArea,
        }
    }

    /// 带重试上限的自旋锁。
    pub const fn spinlock(retry_limit: u32) -> Self {
        Self {
            mechanism: LockMechanism::Spinlock { retry_limit },
        }
    }
}

/// 单个分段缓冲的配置。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BufferConfig {
    /// 环形存储字节数，可用字节为 `capacity - 1`。
    pub capacity: usize,
    /// 读者表长度，即同一缓冲允许的最大扇出数。
    #[serde(default = "default_max_readers")]
    pub max_readers: u8,
}

fn default_max_readers() -> u8 {
    1
}

impl BufferConfig {
    /// 单读者缓冲。
    pub const fn new(capacity: usize) -> Self {
        Self {
            capacity,
            max_readers: 1,
        }
    }

    /// 设置读者表长度。
    pub const fn with_readers(mut self, max_readers: u8) -> Self {
        self.max_readers = max_readers;
        self
    }

    /// 可写入的最大字节数。
    pub const fn usable(&self) -> usize {
        self.capacity.saturating_sub(1)
    }
}

/// FIFO 队列配置。
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QueueConfig {
    /// 槽位数。
    pub depth: u16,
    /// 队列可以分配的缓冲池。
    pub pool: Vec<BufferId>,
    /// 保护队列下标与池搜索的锁。
    pub lock: LockId,
}

impl QueueConfig {
    pub fn new(depth: u16, lock: LockId, pool: impl Into<Vec<BufferId>>) -> Self {
        Self {
            depth,
            pool: pool.into(),
            lock,
        }
    }
}

/// 触发提前发送的阈值比较方式。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerBoundary {
    /// 已缓冲负载 `>= threshold` 时触发。
    #[default]
    Inclusive,
    /// 已缓冲负载 `> threshold` 时触发。
    Exclusive,
}

impl TriggerBoundary {
    /// 满足阈值所需的最少负载字节数。
    pub const fn required_payload(self, threshold: usize) -> usize {
        match self {
            TriggerBoundary::Inclusive => threshold,
            TriggerBoundary::Exclusive => threshold.saturating_add(1),
        }
    }
}

/// 源路由配置，对应一个接收状态机实例。
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RouteConfig {
    pub queue: QueueId,
    pub lock: LockId,
    /// 流式发送阈值（负载字节，不含元数据）。
    #[serde(default)]
    pub threshold: usize,
    #[serde(default)]
    pub boundary: TriggerBoundary,
    /// 前导元数据长度上限，参与最小缓冲的计算。
    #[serde(default)]
    pub metadata_length: usize,
    pub destinations: Vec<DestId>,
}

impl RouteConfig {
    pub fn new(queue: QueueId, lock: LockId, destinations: impl Into<Vec<DestId>>) -> Self {
        Self {
            queue,
            lock,
            threshold: 0,
            boundary: TriggerBoundary::Inclusive,
            metadata_length: 0,
            destinations: destinations.into(),
        }
    }

    pub fn threshold(mut self, threshold: usize) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn boundary(mut self, boundary: TriggerBoundary) -> Self {
        self.boundary = boundary;
        self
    }

    pub fn metadata(mut self, metadata_length: usize) -> Self {
        self.metadata_length = metadata_length;
        self
    }

    /// 消息开始发送前必须缓冲的负载字节数。
    ///
    /// 总长度已知且小于阈值要求时，以总长度为准：整条消息到齐即触发。
    /// `total_length == 0` 表示长度未知。
    pub fn trigger_point(&self, total_length: usize) -> usize {
        let required = self.boundary.required_payload(self.threshold);
        if total_length > 0 {
            required.min(total_length)
        } else {
            required
        }
    }

    /// 流式接收时缓冲必须提供的最小可用字节数。
    pub fn minimum_buffer(&self) -> usize {
        self.boundary
            .required_payload(self.threshold)
            .saturating_add(self.metadata_length)
    }
}

/// 目的地方向。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DestinationKind {
    /// 下层传输模块：调用发送入口，由其回调 `copy_tx_data`/`tx_confirmation` 拉取数据。
    Downstream,
    /// 上层消费模块：由路由器合成 `start_of_reception`/`copy_rx_data`/`rx_indication` 推送数据。
    Upstream,
}

/// 目的地的处理方式。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Processing {
    /// 触发时立即投递。
    #[default]
    Immediate,
    /// 触发时只登记，等待下一次 `main_function` 投递。
    Deferred,
}

/// 目的地配置，对应一个发送状态机实例。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DestinationConfig {
    pub route: RouteId,
    pub kind: DestinationKind,
    #[serde(default)]
    pub processing: Processing,
    /// 拥有该目的地的并发分区。
    #[serde(default)]
    pub partition: CoreId,
}

impl DestinationConfig {
    pub const fn downstream(route: RouteId) -> Self {
        Self {
            route,
            kind: DestinationKind::Downstream,
            processing: Processing::Immediate,
            partition: CoreId::new(0),
        }
    }

    pub const fn upstream(route: RouteId) -> Self {
        Self {
            route,
            kind: DestinationKind::Upstream,
            processing: Processing::Immediate,
            partition: CoreId::new(0),
        }
    }

    pub const fn deferred(mut self) -> Self {
        self.processing = Processing::Deferred;
        self
    }

    pub const fn on_partition(mut self, partition: CoreId) -> Self {
        self.partition = partition;
        self
    }
}
