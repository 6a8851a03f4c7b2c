//! 接收侧入口：源模块向路由器写入一条消息。

use crate::config::RouteConfig;
use crate::diagnostics::{ApiId, DevError};
use crate::error::{Outcome, Result, RoutingError};
use crate::ids::{RouteId, SlotRef};
use crate::router::Router;

use super::{MessageRecord, RxProgress, RxState, TxPhase, TxState};

/// 接收状态机的入口事件。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RxEvent {
    Start,
    Copy,
    Indicate,
    Cancel,
}

impl Router {
    /// 开始接收一条消息。
    ///
    /// - `metadata` 为前导元数据，立即写入缓冲，长度不得超过路由配置；
    /// - `total_length` 为负载总长度，`0` 表示未知（只能走流式回退）；
    /// - 成功时返回缓冲剩余可写字节数。
    ///
    /// # Errors
    /// - `Backpressure`：没有空闲槽位或足够大的缓冲；
    /// - `TransferFailed`：阈值在开始时即满足，但全部目的地拒绝发送，路由已拆除；
    /// - `ProtocolViolation` / `InvalidHandle`：调用不合法，无副作用。
    pub fn start_of_reception(
        &self,
        route: RouteId,
        metadata: &[u8],
        total_length: usize,
    ) -> Result<usize> {
        let api = ApiId::StartOfReception;
        let route_cfg = self.route_entry(route, api)?;
        if metadata.len() > route_cfg.metadata_length {
            self.reporter
                .development_error(api, DevError::InvalidParameter);
            return Err(RoutingError::ProtocolViolation);
        }
        let _guard = self.locks.guard(route_cfg.lock);

        let state = self.table.lock().routes[route.index()].state;
        if state.admit(RxEvent::Start).is_err() {
            return Err(self.violation(api));
        }

        let preferred = if total_length == 0 {
            usize::MAX
        } else {
            metadata.len().saturating_add(total_length)
        };
        let allocation = self
            .fifo
            .allocate(route_cfg.queue, route, preferred, route_cfg.minimum_buffer())
            .map_err(|reason| {
                tracing::debug!(route = route.raw(), %reason, "reception refused");
                RoutingError::Backpressure
            })?;
        if self.fifo.segments().put(allocation.buffer, metadata).is_err() {
            self.fifo.release(allocation.slot);
            return Err(RoutingError::Backpressure);
        }

        {
            let mut table = self.table.lock();
            table.insert_record(
                allocation.slot,
                MessageRecord::new(total_length, metadata.len()),
            );
            let instance = &mut table.routes[route.index()];
            instance.state = RxState::Active;
            instance.slot = Some(allocation.slot);
        }
        tracing::trace!(route = route.raw(), slot = %allocation.slot, buffer = %allocation.buffer, "reception started");

        if self.fifo.is_head(allocation.slot) && route_cfg.trigger_point(total_length) == 0 {
            if !self.trigger_in_flight(allocation.slot, route) {
                let mut table = self.table.lock();
                table.remove_record(allocation.slot);
                table.routes[route.index()] = Default::default();
                drop(table);
                self.fifo.release(allocation.slot);
                return Err(RoutingError::TransferFailed);
            }
        }
        Ok(self.fifo.segments().total_free(allocation.buffer))
    }

    /// 追加负载字节，返回缓冲剩余可写字节数。
    ///
    /// # Errors
    /// - `Busy`：剩余空间不足，缓冲未被修改，稍后重试；
    /// - `TransferFailed`：已没有目的地继续读取，路由进入 `Aborted`，等待 `rx_indication`；
    /// - `ProtocolViolation`：当前不在接收中。
    pub fn copy_rx_data(&self, route: RouteId, bytes: &[u8]) -> Result<usize> {
        let api = ApiId::CopyRxData;
        let route_cfg = self.route_entry(route, api)?;
        let _guard = self.locks.guard(route_cfg.lock);

        let (state, slot) = {
            let table = self.table.lock();
            let instance = table.routes[route.index()];
            (instance.state, instance.slot)
        };
        if state.admit(RxEvent::Copy).is_err() {
            return Err(self.violation(api));
        }
        let Some(slot) = slot else {
            return Err(self.violation(api));
        };
        let Some(buffer) = self.fifo.slot_buffer(slot) else {
            return Err(self.violation(api));
        };

        let abandoned = self
            .table
            .lock()
            .record(slot)
            .is_some_and(|record| record.tx == TxPhase::Abandoned);
        if abandoned {
            self.table.lock().routes[route.index()].state = RxState::Aborted;
            return Err(RoutingError::TransferFailed);
        }

        if let Err(reason) = self.fifo.segments().put(buffer, bytes) {
            tracing::debug!(route = route.raw(), %reason, "copy_rx_data busy");
            return Err(RoutingError::Busy);
        }
        let record = {
            let mut table = self.table.lock();
            table.record_mut(slot).map(|record| {
                record.received += bytes.len();
                *record
            })
        };

        match state {
            RxState::Active => {
                let threshold_met = record.is_some_and(|record| {
                    record.received >= route_cfg.trigger_point(record.total_length)
                });
                if threshold_met
                    && self.fifo.is_head(slot)
                    && !self.trigger_in_flight(slot, route)
                {
                    self.table.lock().routes[route.index()].state = RxState::Aborted;
                    return Err(RoutingError::TransferFailed);
                }
            }
            _ => self.pump_slot(slot, route_cfg),
        }
        Ok(self.fifo.segments().total_free(buffer))
    }

    /// 接收结束。
    ///
    /// 队头消息：成功且尚未触发时立即触发；失败时撤销尚未开始的发送；随后尝试结束路由。
    /// 非队头消息：失败时提前释放槽位（留下空洞），成功时等待成为队头。
    pub fn rx_indication(&self, route: RouteId, outcome: Outcome) -> Result<()> {
        let api = ApiId::RxIndication;
        let route_cfg = self.route_entry(route, api)?;
        let _guard = self.locks.guard(route_cfg.lock);

        let (state, slot) = {
            let mut table = self.table.lock();
            let instance = table.routes[route.index()];
            if instance.state.admit(RxEvent::Indicate).is_ok() {
                table.routes[route.index()] = Default::default();
            }
            (instance.state, instance.slot)
        };
        if state.admit(RxEvent::Indicate).is_err() {
            return Err(self.violation(api));
        }
        self.observer.rx_indication(route, outcome);
        let Some(slot) = slot else {
            return Ok(());
        };

        let succeeded = outcome.is_success() && state != RxState::Aborted;
        let pending = {
            let mut table = self.table.lock();
            table.record_mut(slot).map(|record| {
                record.rx = if succeeded {
                    RxProgress::Completed
                } else {
                    RxProgress::Failed
                };
                record.tx == TxPhase::Pending
            })
        };
        tracing::trace!(route = route.raw(), %slot, succeeded, "reception finished");

        if self.fifo.is_head(slot) {
            if succeeded && pending == Some(true) {
                self.trigger(slot, route);
            }
            if !succeeded {
                self.withdraw_waiting(slot, route_cfg);
            }
            self.pump_slot(slot, route_cfg);
            self.finish_routing(route_cfg.queue);
        } else if !succeeded {
            self.table.lock().remove_record(slot);
            self.fifo.release(slot);
        }
        Ok(())
    }

    /// 取消接收：进入 `Aborted`，由随后的 `rx_indication` 完成清理。
    pub fn cancel_receive(&self, route: RouteId) -> Result<()> {
        let api = ApiId::CancelReceive;
        let route_cfg = self.route_entry(route, api)?;
        let _guard = self.locks.guard(route_cfg.lock);

        let mut table = self.table.lock();
        let instance = &mut table.routes[route.index()];
        if instance.state.admit(RxEvent::Cancel).is_err() {
            drop(table);
            return Err(self.violation(api));
        }
        instance.state = RxState::Aborted;
        Ok(())
    }

    /// 接收失败时撤销仍在等待投递的目的地。
    fn withdraw_waiting(&self, slot: SlotRef, route_cfg: &RouteConfig) {
        for &dest in &route_cfg.destinations {
            let reader = {
                let mut table = self.table.lock();
                let Some(instance) = table.dests.get_mut(dest.index()) else {
                    continue;
                };
                if instance.slot != Some(slot) || instance.state != TxState::Waiting {
                    continue;
                }
                let reader = instance.reader;
                instance.clear();
                reader
            };
            if let Some(reader) = reader {
                let _ = self.fifo.segments().unbind_reader(reader);
            }
        }
    }
}
