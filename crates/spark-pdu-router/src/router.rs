//! 路由器：装配锁、缓冲、队列与状态机，并对外提供全部入口。
//!
//! # 模块角色（Why）
//! - 把静态配置与协作方（分发、平台、上报、观察）组合成一个可共享的 [`Router`]；
//! - 接收侧入口见 `routing::rx`，发送侧入口与周期任务见 `routing::tx`，本文件只负责装配、
//!   结束规则与自省接口。
//!
//! # 契约（What）
//! - 构造完成后不再分配存储；
//! - 全部入口都可以在多个线程/核心上并发调用，同核嵌套调用安全；
//! - [`Router::reset`] 与 [`Router::flush_queue`] 不与正在进行的流量同步，调用方需确保静默。

use alloc::sync::Arc;

use spin::Mutex;

use crate::config::{DestinationConfig, RouteConfig, RouterConfig};
use crate::diagnostics::{
    ApiId, DevError, ErrorReporter, NoopObserver, RoutingObserver, TracingReporter,
};
use crate::dispatch::ModuleDispatch;
use crate::error::{ConfigError, Result, RoutingError};
use crate::fifo::{FifoManager, QueueStats};
use crate::ids::{DestId, LockId, QueueId, RouteId, SlotRef};
use crate::lock::{LockManager, LockStats};
use crate::platform::Platform;
use crate::routing::{RoutingTable, RxProgress, RxState, TxPhase, TxState};
use crate::segment::SegmentStats;

/// PDU 路由器。
pub struct Router {
    pub(crate) config: Arc<RouterConfig>,
    pub(crate) locks: Arc<LockManager>,
    pub(crate) fifo: FifoManager,
    pub(crate) table: Mutex<RoutingTable>,
    pub(crate) platform: Arc<dyn Platform>,
    pub(crate) dispatch: Arc<dyn ModuleDispatch>,
    pub(crate) reporter: Arc<dyn ErrorReporter>,
    pub(crate) observer: Arc<dyn RoutingObserver>,
}

impl Router {
    /// 以配置创建构建器。
    pub fn builder(config: RouterConfig) -> RouterBuilder {
        RouterBuilder::new(config)
    }

    /// 只读配置。
    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    /// 源路由的接收状态。
    ///
    /// 与状态变更入口一样先取路由锁，同核中断嵌套调用时不会在路由表上自旋。
    pub fn rx_state(&self, route: RouteId) -> Result<RxState> {
        let route_cfg = self.route_entry(route, ApiId::StartOfReception)?;
        let _guard = self.locks.guard(route_cfg.lock);
        Ok(self.table.lock().routes[route.index()].state)
    }

    /// 目的地的发送状态。
    pub fn tx_state(&self, dest: DestId) -> Result<TxState> {
        let (_, route_cfg) = self.dest_entry(dest, ApiId::TriggerTransmission)?;
        let _guard = self.locks.guard(route_cfg.lock);
        Ok(self.table.lock().dests[dest.index()].state)
    }

    /// 队列统计。
    pub fn queue_stats(&self, queue: QueueId) -> Result<QueueStats> {
        self.queue_entry(queue)?;
        Ok(self.fifo.stats(queue))
    }

    /// 锁统计。
    pub fn lock_stats(&self, lock: LockId) -> Result<LockStats> {
        if self.config.lock(lock).is_none() {
            self.reporter.development_error(ApiId::Lock, DevError::InvalidId);
            return Err(RoutingError::InvalidHandle);
        }
        Ok(self.locks.stats(lock))
    }

    /// 分段缓冲统计；只读原子计数，无需任何锁。
    pub fn segment_stats(&self) -> SegmentStats {
        self.fifo.segments().stats()
    }

    /// 丢弃队列中的全部消息，并把绑定在该队列上的实例恢复为空闲。
    pub fn flush_queue(&self, queue: QueueId) -> Result<()> {
        self.queue_entry(queue)?;
        self.fifo.flush(queue);
        self.table.lock().clear_queue(queue.index());
        tracing::debug!(queue = queue.raw(), "queue flushed");
        Ok(())
    }

    /// 清空全部队列，所有状态机回到 `Idle`。
    pub fn reset(&self) {
        for index in 0..self.fifo.len() {
            let queue = QueueId::new(index as u16);
            self.fifo.flush(queue);
            self.table.lock().clear_queue(index);
        }
        let mut table = self.table.lock();
        table.routes.iter_mut().for_each(|route| *route = Default::default());
        table.dests.iter_mut().for_each(|dest| dest.clear());
    }

    /// 结束规则：从队头开始释放已结束的消息，并在新队头满足条件时触发发送。
    ///
    /// 调用方持有队列所属路由的逻辑锁。
    pub(crate) fn finish_routing(&self, queue: QueueId) {
        loop {
            let Some(head) = self.fifo.peek(queue) else {
                return;
            };
            let Some(route) = self.fifo.slot_route(head) else {
                return;
            };
            let Some(route_cfg) = self.config.route(route) else {
                return;
            };

            let (record, idle) = {
                let table = self.table.lock();
                let idle = self.destinations_idle(&table, route_cfg, head);
                (table.record(head).copied(), idle)
            };
            let Some(record) = record else {
                self.fifo.release(head);
                continue;
            };
            if record.delivering || !idle {
                return;
            }

            match (record.rx, record.tx) {
                (RxProgress::Receiving, TxPhase::Pending) => {
                    if record.received >= route_cfg.trigger_point(record.total_length) {
                        self.trigger_in_flight(head, route);
                    }
                    return;
                }
                (RxProgress::Receiving, _) => return,
                (RxProgress::Completed, TxPhase::Pending) => {
                    self.trigger(head, route);
                }
                _ => {
                    self.table.lock().remove_record(head);
                    self.fifo.release(head);
                    tracing::trace!(slot = %head, "routing finished");
                }
            }
        }
    }

    /// 队头消息仍在接收时的触发：成功则接收实例进入 `ActiveTxTriggered`，全部失败则标记放弃。
    pub(crate) fn trigger_in_flight(&self, slot: SlotRef, route: RouteId) -> bool {
        let accepted = self.trigger(slot, route);
        let mut table = self.table.lock();
        if accepted {
            let instance = &mut table.routes[route.index()];
            if instance.slot == Some(slot) && instance.state == RxState::Active {
                instance.state = RxState::ActiveTxTriggered;
            }
        } else if let Some(record) = table.record_mut(slot) {
            record.tx = TxPhase::Abandoned;
        }
        accepted
    }

    /// 接收仍在进行、但已没有目的地继续读取时，标记消息被放弃。
    pub(crate) fn abandon_if_orphaned(&self, slot: SlotRef, route_cfg: &RouteConfig) {
        let mut table = self.table.lock();
        let idle = self.destinations_idle(&table, route_cfg, slot);
        if let Some(record) = table.record_mut(slot) {
            if idle && record.rx == RxProgress::Receiving && record.tx == TxPhase::Triggered {
                record.tx = TxPhase::Abandoned;
                tracing::debug!(%slot, "all destinations gave up, reception abandoned");
            }
        }
    }

    pub(crate) fn destinations_idle(
        &self,
        table: &RoutingTable,
        route_cfg: &RouteConfig,
        slot: SlotRef,
    ) -> bool {
        route_cfg.destinations.iter().all(|dest| {
            table
                .dests
                .get(dest.index())
                .is_none_or(|instance| instance.state == TxState::Idle || instance.slot != Some(slot))
        })
    }

    pub(crate) fn route_entry(&self, route: RouteId, api: ApiId) -> Result<&RouteConfig> {
        self.config.route(route).ok_or_else(|| {
            self.reporter.development_error(api, DevError::InvalidId);
            RoutingError::InvalidHandle
        })
    }

    pub(crate) fn dest_entry(
        &self,
        dest: DestId,
        api: ApiId,
    ) -> Result<(&DestinationConfig, &RouteConfig)> {
        let dest_cfg = self.config.destination(dest).ok_or_else(|| {
            self.reporter.development_error(api, DevError::InvalidId);
            RoutingError::InvalidHandle
        })?;
        let route_cfg = self.route_entry(dest_cfg.route, api)?;
        Ok((dest_cfg, route_cfg))
    }

    fn queue_entry(&self, queue: QueueId) -> Result<()> {
        if self.config.queue(queue).is_none() {
            self.reporter
                .development_error(ApiId::FifoRelease, DevError::InvalidId);
            return Err(RoutingError::InvalidHandle);
        }
        Ok(())
    }

    /// 上报状态违例并返回对应错误。
    pub(crate) fn violation(&self, api: ApiId) -> RoutingError {
        self.reporter.development_error(api, DevError::InvalidState);
        RoutingError::ProtocolViolation
    }
}

/// [`Router`] 构建器。
///
/// - 分发器必填；
/// - 平台在 `std` 下默认为 [`HostPlatform`](crate::platform::HostPlatform)，`no_std` 下必填；
/// - 上报器默认为 [`TracingReporter`]，观察者默认为 [`NoopObserver`]。
pub struct RouterBuilder {
    config: RouterConfig,
    dispatch: Option<Arc<dyn ModuleDispatch>>,
    platform: Option<Arc<dyn Platform>>,
    reporter: Option<Arc<dyn ErrorReporter>>,
    observer: Option<Arc<dyn RoutingObserver>>,
}

impl RouterBuilder {
    pub fn new(config: RouterConfig) -> Self {
        Self {
            config,
            dispatch: None,
            platform: None,
            reporter: None,
            observer: None,
        }
    }

    pub fn dispatch(mut self, dispatch: Arc<dyn ModuleDispatch>) -> Self {
        self.dispatch = Some(dispatch);
        self
    }

    pub fn platform(mut self, platform: Arc<dyn Platform>) -> Self {
        self.platform = Some(platform);
        self
    }

    pub fn reporter(mut self, reporter: Arc<dyn ErrorReporter>) -> Self {
        self.reporter = Some(reporter);
        self
    }

    pub fn observer(mut self, observer: Arc<dyn RoutingObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// 校验配置并一次性分配全部存储。
    pub fn build(self) -> core::result::Result<Router, ConfigError> {
        self.config.validate()?;
        let dispatch = self
            .dispatch
            .ok_or(ConfigError::MissingCollaborator { name: "dispatch" })?;
        let platform = match self.platform {
            Some(platform) => platform,
            None => default_platform(self.config.core_count)?,
        };
        let reporter: Arc<dyn ErrorReporter> = match self.reporter {
            Some(reporter) => reporter,
            None => Arc::new(TracingReporter),
        };
        let observer: Arc<dyn RoutingObserver> = match self.observer {
            Some(observer) => observer,
            None => Arc::new(NoopObserver),
        };

        let config = Arc::new(self.config);
        let locks = Arc::new(LockManager::new(&config, platform.clone(), reporter.clone()));
        let fifo = FifoManager::new(&config, locks.clone(), reporter.clone());
        let table = Mutex::new(RoutingTable::new(&config));
        tracing::debug!(
            routes = config.routes.len(),
            destinations = config.destinations.len(),
            buffers = config.buffers.len(),
            "pdu router built"
        );
        Ok(Router {
            config,
            locks,
            fifo,
            table,
            platform,
            dispatch,
            reporter,
            observer,
        })
    }
}

#[cfg(feature = "std")]
fn default_platform(core_count: u16) -> core::result::Result<Arc<dyn Platform>, ConfigError> {
    Ok(Arc::new(crate::platform::HostPlatform::new(core_count)))
}

#[cfg(not(feature = "std"))]
fn default_platform(_core_count: u16) -> core::result::Result<Arc<dyn Platform>, ConfigError> {
    Err(ConfigError::MissingCollaborator { name: "platform" })
}
