//! 发送侧：触发、投递、下层回调与周期任务。
//!
//! - 触发时先为全部目的地绑定读实例，再移除起点锚，最后逐个投递；
//! - 下层目的地只收到长度宣告，字节由其回调 [`Router::copy_tx_data`] 拉取；
//! - 上层目的地由路由器推送：经固定大小的栈上中转区，把读实例中新到的字节按对端窗口分段送出。

use crate::config::{DestinationConfig, DestinationKind, Processing, RouteConfig};
use crate::diagnostics::{ApiId, RuntimeError};
use crate::dispatch::TransmitRequest;
use crate::error::{Outcome, Result, RoutingError};
use crate::ids::{BufferId, CoreId, DestId, ReaderId, RouteId, SlotRef};
use crate::router::Router;

use super::{RxProgress, TxPhase, TxState};

/// 上层推送时单次中转的最大字节数。
const BOUNCE_LEN: usize = 64;

/// 发送状态机的入口事件。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TxEvent {
    Trigger,
    Copy,
    Confirm,
    Cancel,
    Poll,
}

impl Router {
    /// 下层目的地拉取字节，返回拉取后该目的地仍可读取的字节数。
    ///
    /// `out` 为空时仅查询可读字节数。
    ///
    /// # Errors
    /// - `Busy`：可读字节不足，读游标未移动；
    /// - `TransferFailed`：源接收已失败，剩余字节不足以满足本次请求；
    /// - `ProtocolViolation`：目的地不处于 `Active`，或是由路由器推送的上层目的地。
    pub fn copy_tx_data(&self, dest: DestId, out: &mut [u8]) -> Result<usize> {
        let api = ApiId::CopyTxData;
        let (dest_cfg, route_cfg) = self.dest_entry(dest, api)?;
        if dest_cfg.kind == DestinationKind::Upstream {
            return Err(self.violation(api));
        }
        let _guard = self.locks.guard(route_cfg.lock);

        let instance = self.table.lock().dests[dest.index()];
        if instance.state.admit(TxEvent::Copy).is_err() {
            return Err(self.violation(api));
        }
        let (Some(reader), Some(slot)) = (instance.reader, instance.slot) else {
            return Err(self.violation(api));
        };

        let segments = self.fifo.segments();
        let stored = segments.total_stored(reader);
        if out.len() > stored {
            let failed = self
                .table
                .lock()
                .record(slot)
                .is_some_and(|record| record.rx == RxProgress::Failed);
            return Err(if failed {
                RoutingError::TransferFailed
            } else {
                RoutingError::Busy
            });
        }
        segments.get(reader, out).map_err(|_| RoutingError::Busy)?;
        Ok(stored - out.len())
    }

    /// 下层目的地发送结束：释放读实例，回到 `Idle`，尝试结束路由。
    pub fn tx_confirmation(&self, dest: DestId, outcome: Outcome) -> Result<()> {
        let api = ApiId::TxConfirmation;
        let (_, route_cfg) = self.dest_entry(dest, api)?;
        let _guard = self.locks.guard(route_cfg.lock);

        let instance = self.table.lock().dests[dest.index()];
        if instance.state.admit(TxEvent::Confirm).is_err() {
            return Err(self.violation(api));
        }
        self.release_dest(dest, instance.slot);
        self.observer.tx_confirmation(dest, outcome);
        tracing::trace!(dest = dest.raw(), ?outcome, "transmission confirmed");

        let failed = !outcome.is_success() || instance.state == TxState::Aborted;
        if let (Some(slot), true) = (instance.slot, failed) {
            self.abandon_if_orphaned(slot, route_cfg);
        }
        self.finish_routing(route_cfg.queue);
        Ok(())
    }

    /// 取消发送。
    ///
    /// - `Active` 的下层目的地进入 `Aborted`，清理推迟到 `tx_confirmation`；
    /// - `Active` 的上层目的地立即收到失败指示并被拆除；
    /// - `Waiting` 立即回到 `Idle`。
    pub fn cancel_transmit(&self, dest: DestId) -> Result<()> {
        let api = ApiId::CancelTransmit;
        let (dest_cfg, route_cfg) = self.dest_entry(dest, api)?;
        let _guard = self.locks.guard(route_cfg.lock);

        let instance = self.table.lock().dests[dest.index()];
        if instance.state.admit(TxEvent::Cancel).is_err() {
            return Err(self.violation(api));
        }
        match (instance.state, dest_cfg.kind) {
            (TxState::Active, DestinationKind::Downstream) => {
                self.table.lock().dests[dest.index()].state = TxState::Aborted;
                return Ok(());
            }
            (TxState::Active, DestinationKind::Upstream) => {
                self.fail_upstream(dest, instance.slot);
            }
            _ => self.release_dest(dest, instance.slot),
        }
        if let Some(slot) = instance.slot {
            self.abandon_if_orphaned(slot, route_cfg);
        }
        self.finish_routing(route_cfg.queue);
        Ok(())
    }

    /// 周期任务：投递本分区内等待中的目的地，并继续向上层推送。
    pub fn main_function(&self) {
        let core = self.platform.current_core();
        for (index, dest_cfg) in self.config.destinations.iter().enumerate() {
            if dest_cfg.partition != core {
                continue;
            }
            let dest = DestId::new(index as u16);
            let Some(route_cfg) = self.config.route(dest_cfg.route) else {
                continue;
            };
            let _guard = self.locks.guard(route_cfg.lock);

            let instance = self.table.lock().dests[dest.index()];
            let Some(slot) = instance.slot else {
                continue;
            };
            if instance.state.admit(TxEvent::Poll).is_ok() {
                self.table.lock().dests[dest.index()].state = TxState::Active;
                let delivered = self.with_delivery(slot, || self.deliver(dest, dest_cfg, slot));
                if !delivered {
                    self.abandon_if_orphaned(slot, route_cfg);
                }
            } else if instance.state == TxState::Active
                && dest_cfg.kind == DestinationKind::Upstream
            {
                self.pump(dest, route_cfg);
            }
            self.finish_routing(route_cfg.queue);
        }
    }

    /// 触发一条消息的全部目的地；只有全部目的地都失败时返回 `false`。
    ///
    /// 调用后消息的发送阶段不再是 `Pending`。
    pub(crate) fn trigger(&self, slot: SlotRef, route: RouteId) -> bool {
        let Some(route_cfg) = self.config.route(route) else {
            return false;
        };
        let Some(buffer) = self.fifo.slot_buffer(slot) else {
            return false;
        };
        let core = self.platform.current_core();
        let mut failures = 0usize;

        for &dest in &route_cfg.destinations {
            if !self.trigger_transmission(dest, slot, buffer, core) {
                failures += 1;
            }
        }
        self.fifo.segments().release_anchor(buffer);
        if let Some(record) = self.table.lock().record_mut(slot) {
            record.tx = TxPhase::Triggered;
        }
        tracing::trace!(route = route.raw(), %slot, "transmission triggered");

        self.with_delivery(slot, || {
            for &dest in &route_cfg.destinations {
                let Some(dest_cfg) = self.config.destination(dest) else {
                    continue;
                };
                let instance = self.table.lock().dests[dest.index()];
                if instance.state == TxState::Active
                    && instance.slot == Some(slot)
                    && !self.deliver(dest, dest_cfg, slot)
                {
                    failures += 1;
                }
            }
        });
        failures < route_cfg.destinations.len()
    }

    /// 单个目的地的触发：绑定读实例，按处理方式与所属分区进入 `Active` 或 `Waiting`。
    ///
    /// 这里只登记，不投递；投递由调用方在起点锚移除之后进行。
    fn trigger_transmission(
        &self,
        dest: DestId,
        slot: SlotRef,
        buffer: BufferId,
        core: CoreId,
    ) -> bool {
        let Some(dest_cfg) = self.config.destination(dest) else {
            return false;
        };
        if self.table.lock().dests[dest.index()]
            .state
            .admit(TxEvent::Trigger)
            .is_err()
        {
            self.violation(ApiId::TriggerTransmission);
            return false;
        }
        let reader = match self.fifo.segments().bind_reader(buffer, dest) {
            Ok(reader) => reader,
            Err(reason) => {
                tracing::warn!(dest = dest.raw(), %reason, "read instance unavailable");
                self.reporter
                    .runtime_error(ApiId::TriggerTransmission, RuntimeError::ReaderExhausted);
                return false;
            }
        };
        let deferred = dest_cfg.processing == Processing::Deferred || dest_cfg.partition != core;
        {
            let mut table = self.table.lock();
            let instance = &mut table.dests[dest.index()];
            instance.clear();
            instance.state = if deferred {
                TxState::Waiting
            } else {
                TxState::Active
            };
            instance.slot = Some(slot);
            instance.reader = Some(reader);
        }
        self.observer.pre_transmit(dest);
        true
    }

    /// 把已绑定读实例的目的地交给对端；对端拒绝时拆除并返回 `false`。
    fn deliver(&self, dest: DestId, dest_cfg: &DestinationConfig, slot: SlotRef) -> bool {
        let Some(reader) = self.table.lock().dests[dest.index()].reader else {
            return false;
        };
        let Some(record) = self.table.lock().record(slot).copied() else {
            return false;
        };
        let request = TransmitRequest {
            total_length: record.total_length,
            metadata_length: record.metadata_length,
            buffered: self.fifo.segments().total_stored(reader),
        };
        self.observer.transmit(dest, record.total_length);

        match dest_cfg.kind {
            DestinationKind::Downstream => match self.dispatch.transmit(dest, request) {
                Ok(()) => true,
                Err(reason) => {
                    tracing::debug!(dest = dest.raw(), %reason, "transmit refused");
                    self.release_dest(dest, Some(slot));
                    self.observer.tx_confirmation(dest, Outcome::Failure);
                    false
                }
            },
            DestinationKind::Upstream => match self.dispatch.start_of_reception(dest, request) {
                Ok(window) => {
                    {
                        let mut table = self.table.lock();
                        let instance = &mut table.dests[dest.index()];
                        instance.started = true;
                        instance.window = window;
                    }
                    if let Some(route_cfg) = self.config.route(dest_cfg.route) {
                        self.pump(dest, route_cfg);
                    }
                    true
                }
                Err(reason) => {
                    tracing::debug!(dest = dest.raw(), %reason, "upstream refused reception");
                    self.release_dest(dest, Some(slot));
                    self.observer.tx_confirmation(dest, Outcome::Failure);
                    false
                }
            },
        }
    }

    /// 向一条消息在本核心上的全部活跃上层目的地推送。
    ///
    /// 其他分区的目的地只由其所属核心的 [`Router::main_function`] 推送。
    pub(crate) fn pump_slot(&self, slot: SlotRef, route_cfg: &RouteConfig) {
        let core = self.platform.current_core();
        for &dest in &route_cfg.destinations {
            let Some(dest_cfg) = self.config.destination(dest) else {
                continue;
            };
            if dest_cfg.kind != DestinationKind::Upstream || dest_cfg.partition != core {
                continue;
            }
            let instance = self.table.lock().dests[dest.index()];
            if instance.state == TxState::Active && instance.slot == Some(slot) {
                self.pump(dest, route_cfg);
            }
        }
    }

    /// 把读实例中已缓冲的字节推送给上层目的地；接收结束且读空后合成接收指示。
    fn pump(&self, dest: DestId, route_cfg: &RouteConfig) {
        let mut bounce = [0u8; BOUNCE_LEN];
        let segments = self.fifo.segments();
        let instance = self.table.lock().dests[dest.index()];
        let (Some(reader), Some(slot), true) = (instance.reader, instance.slot, instance.started)
        else {
            return;
        };
        let mut window = instance.window;

        loop {
            let stored = segments.total_stored(reader);
            if stored == 0 {
                break;
            }
            if window == 0 {
                match self.dispatch.copy_rx_data(dest, &[]) {
                    Ok(refreshed) => window = refreshed,
                    Err(_) => return self.fail_pumped(dest, slot, route_cfg),
                }
                if window == 0 {
                    break;
                }
            }
            let chunk = stored.min(window).min(BOUNCE_LEN);
            if segments.get(reader, &mut bounce[..chunk]).is_err() {
                break;
            }
            match self.dispatch.copy_rx_data(dest, &bounce[..chunk]) {
                Ok(remaining) => window = remaining,
                Err(reason) => {
                    tracing::debug!(dest = dest.raw(), %reason, "upstream copy refused");
                    return self.fail_pumped(dest, slot, route_cfg);
                }
            }
        }
        self.table.lock().dests[dest.index()].window = window;

        let progress = self.table.lock().record(slot).map(|record| record.rx);
        match progress {
            Some(RxProgress::Completed) if segments.total_stored(reader) == 0 => {
                self.dispatch.rx_indication(dest, Outcome::Success);
                self.release_dest(dest, Some(slot));
                self.observer.tx_confirmation(dest, Outcome::Success);
            }
            Some(RxProgress::Failed) | None => self.fail_upstream(dest, Some(slot)),
            _ => {}
        }
    }

    fn fail_pumped(&self, dest: DestId, slot: SlotRef, route_cfg: &RouteConfig) {
        self.fail_upstream(dest, Some(slot));
        self.abandon_if_orphaned(slot, route_cfg);
    }

    /// 以失败结束一个上层目的地。
    fn fail_upstream(&self, dest: DestId, slot: Option<SlotRef>) {
        self.dispatch.rx_indication(dest, Outcome::Failure);
        self.release_dest(dest, slot);
        self.observer.tx_confirmation(dest, Outcome::Failure);
    }

    /// 解绑读实例并把目的地恢复为 `Idle`；目的地已转向其他槽位时不做任何事。
    fn release_dest(&self, dest: DestId, slot: Option<SlotRef>) {
        let reader: Option<ReaderId> = {
            let mut table = self.table.lock();
            let instance = &mut table.dests[dest.index()];
            if instance.slot != slot {
                return;
            }
            let reader = instance.reader;
            instance.clear();
            reader
        };
        if let Some(reader) = reader {
            let _ = self.fifo.segments().unbind_reader(reader);
        }
    }

    /// 投递期间禁止结束路由，避免同步回调在投递循环中途释放槽位。
    fn with_delivery<R>(&self, slot: SlotRef, f: impl FnOnce() -> R) -> R {
        let mark = |delivering: bool| {
            if let Some(record) = self.table.lock().record_mut(slot) {
                record.delivering = delivering;
            }
        };
        mark(true);
        let result = f();
        mark(false);
        result
    }
}
