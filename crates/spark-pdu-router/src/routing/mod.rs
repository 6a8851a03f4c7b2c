//! 接收/发送状态机与路由簿记。
//!
//! # 模块角色（Why）
//! - 每条源路由一个接收状态机实例，每个目的地一个发送状态机实例；
//! - 两类实例共同维护 FIFO 槽位上的一条 [`MessageRecord`]，据此判断何时触发发送、何时结束路由。
//!
//! # 核心机制（How）
//! - 状态为封闭枚举，入口调用前先经过对枚举全覆盖的 `admit` 判定：
//!   不允许的组合返回错误，由调用方上报开发期缺陷且不产生副作用；
//! - 全部实例与簿记集中在 [`RoutingTable`] 中，由一把 `spin::Mutex` 保护，
//!   只在单次读写期间持有，跨入口的一致性由路由逻辑锁保证。
//!
//! # 契约（What）
//! - 路由与目的地实例只在所属路由锁内变更；
//! - 结束规则：接收已结束、全部扇出目的地均为 `Idle`、且没有正在进行的投递时，槽位与缓冲才被释放。

use alloc::{boxed::Box, vec::Vec};

use crate::config::RouterConfig;
use crate::error::RoutingError;
use crate::ids::{ReaderId, SlotRef};

mod rx;
mod tx;

pub use rx::RxEvent;
pub use tx::TxEvent;

/// 接收状态机状态。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum RxState {
    #[default]
    Idle,
    /// 正在接收，尚未开始发送。
    Active,
    /// 正在接收，且已触发发送（流式）。
    ActiveTxTriggered,
    /// 已取消或已被放弃，等待 `rx_indication` 完成清理。
    Aborted,
}

impl RxState {
    /// 判定入口在当前状态下是否允许。
    pub const fn admit(self, event: RxEvent) -> Result<(), RoutingError> {
        let allowed = match (self, event) {
            (RxState::Idle, RxEvent::Start) => true,
            (RxState::Active | RxState::ActiveTxTriggered, RxEvent::Copy) => true,
            (
                RxState::Active | RxState::ActiveTxTriggered | RxState::Aborted,
                RxEvent::Indicate,
            ) => true,
            (RxState::Active | RxState::ActiveTxTriggered, RxEvent::Cancel) => true,
            (RxState::Idle | RxState::Aborted, RxEvent::Copy | RxEvent::Cancel)
            | (RxState::Idle, RxEvent::Indicate)
            | (RxState::Active | RxState::ActiveTxTriggered | RxState::Aborted, RxEvent::Start) => {
                false
            }
        };
        if allowed {
            Ok(())
        } else {
            Err(RoutingError::ProtocolViolation)
        }
    }

    /// 是否处于一次接收之中。
    pub const fn is_receiving(self) -> bool {
        !matches!(self, RxState::Idle)
    }
}

/// 发送状态机状态。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum TxState {
    #[default]
    Idle,
    /// 正在投递。
    Active,
    /// 已登记，等待所属分区的 `main_function` 投递。
    Waiting,
    /// 已取消，等待下层的 `tx_confirmation` 完成清理。
    Aborted,
}

impl TxState {
    /// 判定入口在当前状态下是否允许。
    pub const fn admit(self, event: TxEvent) -> Result<(), RoutingError> {
        let allowed = match (self, event) {
            (TxState::Idle, TxEvent::Trigger) => true,
            (TxState::Active, TxEvent::Copy) => true,
            (TxState::Active | TxState::Aborted, TxEvent::Confirm) => true,
            (TxState::Active | TxState::Waiting, TxEvent::Cancel) => true,
            (TxState::Waiting, TxEvent::Poll) => true,
            (TxState::Active | TxState::Waiting | TxState::Aborted, TxEvent::Trigger)
            | (TxState::Idle | TxState::Waiting | TxState::Aborted, TxEvent::Copy)
            | (TxState::Idle | TxState::Waiting, TxEvent::Confirm)
            | (TxState::Idle | TxState::Aborted, TxEvent::Cancel)
            | (TxState::Idle | TxState::Active | TxState::Aborted, TxEvent::Poll) => false,
        };
        if allowed {
            Ok(())
        } else {
            Err(RoutingError::ProtocolViolation)
        }
    }
}

/// 接收进度。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum RxProgress {
    Receiving,
    Completed,
    Failed,
}

/// 发送阶段。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum TxPhase {
    /// 尚未触发。
    Pending,
    /// 已触发（无论各目的地结果如何）。
    Triggered,
    /// 接收仍在进行，但已没有任何目的地愿意继续读取。
    Abandoned,
}

/// 一个 FIFO 槽位上的消息簿记。
#[derive(Clone, Copy, Debug)]
pub(crate) struct MessageRecord {
    pub(crate) total_length: usize,
    pub(crate) metadata_length: usize,
    /// 已写入的负载字节数（不含元数据）。
    pub(crate) received: usize,
    pub(crate) rx: RxProgress,
    pub(crate) tx: TxPhase,
    /// 触发投递进行中，期间不允许结束路由。
    pub(crate) delivering: bool,
}

impl MessageRecord {
    pub(crate) fn new(total_length: usize, metadata_length: usize) -> Self {
        Self {
            total_length,
            metadata_length,
            received: 0,
            rx: RxProgress::Receiving,
            tx: TxPhase::Pending,
            delivering: false,
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct RouteInstance {
    pub(crate) state: RxState,
    /// 当前正在接收的槽位。
    pub(crate) slot: Option<SlotRef>,
}

#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct DestInstance {
    pub(crate) state: TxState,
    pub(crate) slot: Option<SlotRef>,
    pub(crate) reader: Option<ReaderId>,
    /// 上层目的地：是否已合成 `start_of_reception`。
    pub(crate) started: bool,
    /// 上层目的地最近一次报告的窗口。
    pub(crate) window: usize,
}

impl DestInstance {
    pub(crate) fn clear(&mut self) {
        *self = DestInstance::default();
    }
}

/// 全部路由实例、目的地实例与消息簿记。
pub(crate) struct RoutingTable {
    pub(crate) routes: Box<[RouteInstance]>,
    pub(crate) dests: Box<[DestInstance]>,
    records: Box<[Box<[Option<MessageRecord>]>]>,
}

impl RoutingTable {
    pub(crate) fn new(config: &RouterConfig) -> Self {
        Self {
            routes: alloc::vec![RouteInstance::default(); config.routes.len()].into_boxed_slice(),
            dests: alloc::vec![DestInstance::default(); config.destinations.len()]
                .into_boxed_slice(),
            records: config
                .queues
                .iter()
                .map(|queue| alloc::vec![None; usize::from(queue.depth)].into_boxed_slice())
                .collect::<Vec<_>>()
                .into_boxed_slice(),
        }
    }

    pub(crate) fn record(&self, slot: SlotRef) -> Option<&MessageRecord> {
        self.records
            .get(slot.queue().index())
            .and_then(|slots| slots.get(slot.index()))
            .and_then(Option::as_ref)
    }

    pub(crate) fn record_mut(&mut self, slot: SlotRef) -> Option<&mut MessageRecord> {
        self.records
            .get_mut(slot.queue().index())
            .and_then(|slots| slots.get_mut(slot.index()))
            .and_then(Option::as_mut)
    }

    pub(crate) fn insert_record(&mut self, slot: SlotRef, record: MessageRecord) {
        if let Some(entry) = self
            .records
            .get_mut(slot.queue().index())
            .and_then(|slots| slots.get_mut(slot.index()))
        {
            *entry = Some(record);
        }
    }

    pub(crate) fn remove_record(&mut self, slot: SlotRef) -> Option<MessageRecord> {
        self.records
            .get_mut(slot.queue().index())
            .and_then(|slots| slots.get_mut(slot.index()))
            .and_then(Option::take)
    }

    /// 清空一个队列的全部簿记，以及绑定在该队列上的实例。
    pub(crate) fn clear_queue(&mut self, queue: usize) {
        if let Some(slots) = self.records.get_mut(queue) {
            slots.iter_mut().for_each(|record| *record = None);
        }
        for route in self.routes.iter_mut() {
            if route.slot.is_some_and(|slot| slot.queue().index() == queue) {
                *route = RouteInstance::default();
            }
        }
        for dest in self.dests.iter_mut() {
            if dest.slot.is_some_and(|slot| slot.queue().index() == queue) {
                dest.clear();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RX_STATES: [RxState; 4] = [
        RxState::Idle,
        RxState::Active,
        RxState::ActiveTxTriggered,
        RxState::Aborted,
    ];

    #[test]
    fn rx_copy_is_refused_outside_active_states() {
        for state in RX_STATES {
            let expected = matches!(state, RxState::Active | RxState::ActiveTxTriggered);
            assert_eq!(state.admit(RxEvent::Copy).is_ok(), expected, "{state:?}");
        }
        assert_eq!(
            RxState::Idle.admit(RxEvent::Indicate),
            Err(RoutingError::ProtocolViolation)
        );
        assert!(RxState::Aborted.admit(RxEvent::Indicate).is_ok());
        assert!(RxState::Aborted.admit(RxEvent::Cancel).is_err());
    }

    #[test]
    fn tx_copy_is_only_admitted_while_active() {
        for state in [
            TxState::Idle,
            TxState::Active,
            TxState::Waiting,
            TxState::Aborted,
        ] {
            assert_eq!(
                state.admit(TxEvent::Copy).is_ok(),
                state == TxState::Active,
                "{state:?}"
            );
        }
        assert!(TxState::Aborted.admit(TxEvent::Confirm).is_ok());
        assert!(TxState::Waiting.admit(TxEvent::Confirm).is_err());
        assert!(TxState::Waiting.admit(TxEvent::Cancel).is_ok());
    }
}
