//! 记录型协作方桩件，供单元测试、集成测试、基准与模糊测试共用。
//!
//! - [`RecordingReporter`] 记录全部上报；
//! - [`RecordingObserver`] 记录全部观察事件；
//! - [`RecordingDispatch`] 记录全部分发调用，可按目的地配置拒绝发送或限制上层窗口。

use alloc::{collections::BTreeMap, collections::BTreeSet, vec::Vec};

use spin::Mutex;

use crate::diagnostics::{ApiId, DevError, ErrorReporter, RoutingObserver, RuntimeError};
use crate::dispatch::{ModuleDispatch, TransmitRequest};
use crate::error::{Outcome, Result, RoutingError};
use crate::ids::{DestId, RouteId};

/// 记录型错误上报器。
#[derive(Debug, Default)]
pub struct RecordingReporter {
    development: Mutex<Vec<(ApiId, DevError)>>,
    runtime: Mutex<Vec<(ApiId, RuntimeError)>>,
}

impl RecordingReporter {
    pub fn development_errors(&self) -> Vec<(ApiId, DevError)> {
        self.development.lock().clone()
    }

    pub fn runtime_errors(&self) -> Vec<(ApiId, RuntimeError)> {
        self.runtime.lock().clone()
    }
}

impl ErrorReporter for RecordingReporter {
    fn development_error(&self, api: ApiId, error: DevError) {
        self.development.lock().push((api, error));
    }

    fn runtime_error(&self, api: ApiId, error: RuntimeError) {
        self.runtime.lock().push((api, error));
    }
}

/// 观察事件。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ObservedEvent {
    PreTransmit(DestId),
    Transmit(DestId, usize),
    RxIndication(RouteId, Outcome),
    TxConfirmation(DestId, Outcome),
}

/// 记录型观察者。
#[derive(Debug, Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<ObservedEvent>>,
}

impl RecordingObserver {
    pub fn events(&self) -> Vec<ObservedEvent> {
        self.events.lock().clone()
    }
}

impl RoutingObserver for RecordingObserver {
    fn pre_transmit(&self, dest: DestId) {
        self.events.lock().push(ObservedEvent::PreTransmit(dest));
    }

    fn transmit(&self, dest: DestId, total_length: usize) {
        self.events
            .lock()
            .push(ObservedEvent::Transmit(dest, total_length));
    }

    fn rx_indication(&self, route: RouteId, outcome: Outcome) {
        self.events
            .lock()
            .push(ObservedEvent::RxIndication(route, outcome));
    }

    fn tx_confirmation(&self, dest: DestId, outcome: Outcome) {
        self.events
            .lock()
            .push(ObservedEvent::TxConfirmation(dest, outcome));
    }
}

/// 分发调用记录。
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DispatchEvent {
    Transmit(DestId, TransmitRequest),
    UpstreamStart(DestId, TransmitRequest),
    UpstreamCopy(DestId, Vec<u8>),
    UpstreamIndication(DestId, Outcome),
}

/// 记录型分发器。
///
/// 默认接受全部调用，上层窗口不受限。
#[derive(Debug, Default)]
pub struct RecordingDispatch {
    events: Mutex<Vec<DispatchEvent>>,
    rejected: Mutex<BTreeSet<DestId>>,
    windows: Mutex<BTreeMap<DestId, usize>>,
}

impl RecordingDispatch {
    /// 此后对 `dest` 的发送或开始接收一律拒绝。
    pub fn reject(&self, dest: DestId) {
        self.rejected.lock().insert(dest);
    }

    /// 恢复接受 `dest`。
    pub fn accept(&self, dest: DestId) {
        self.rejected.lock().remove(&dest);
    }

    /// 设置上层目的地的剩余窗口；每次推送后按推送字节数递减。
    pub fn set_window(&self, dest: DestId, window: usize) {
        self.windows.lock().insert(dest, window);
    }

    pub fn events(&self) -> Vec<DispatchEvent> {
        self.events.lock().clone()
    }

    /// 宣告给下层目的地的请求。
    pub fn transmits(&self, dest: DestId) -> Vec<TransmitRequest> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                DispatchEvent::Transmit(target, request) if *target == dest => Some(*request),
                _ => None,
            })
            .collect()
    }

    /// 推送给上层目的地的全部字节（按顺序拼接）。
    pub fn upstream_bytes(&self, dest: DestId) -> Vec<u8> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                DispatchEvent::UpstreamCopy(target, bytes) if *target == dest => {
                    Some(bytes.as_slice())
                }
                _ => None,
            })
            .flatten()
            .copied()
            .collect()
    }

    /// 上层目的地收到的接收结束指示。
    pub fn indications(&self, dest: DestId) -> Vec<Outcome> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                DispatchEvent::UpstreamIndication(target, outcome) if *target == dest => {
                    Some(*outcome)
                }
                _ => None,
            })
            .collect()
    }

    fn is_rejected(&self, dest: DestId) -> bool {
        self.rejected.lock().contains(&dest)
    }

    fn window(&self, dest: DestId) -> usize {
        self.windows.lock().get(&dest).copied().unwrap_or(usize::MAX)
    }
}

impl ModuleDispatch for RecordingDispatch {
    fn transmit(&self, dest: DestId, request: TransmitRequest) -> Result<()> {
        self.events
            .lock()
            .push(DispatchEvent::Transmit(dest, request));
        if self.is_rejected(dest) {
            return Err(RoutingError::TransferFailed);
        }
        Ok(())
    }

    fn start_of_reception(&self, dest: DestId, request: TransmitRequest) -> Result<usize> {
        self.events
            .lock()
            .push(DispatchEvent::UpstreamStart(dest, request));
        if self.is_rejected(dest) {
            return Err(RoutingError::Backpressure);
        }
        Ok(self.window(dest))
    }

    fn copy_rx_data(&self, dest: DestId, bytes: &[u8]) -> Result<usize> {
        if self.is_rejected(dest) {
            return Err(RoutingError::TransferFailed);
        }
        let window = self.window(dest);
        if bytes.len() > window {
            return Err(RoutingError::Busy);
        }
        if !bytes.is_empty() {
            self.events
                .lock()
                .push(DispatchEvent::UpstreamCopy(dest, bytes.to_vec()));
            if window != usize::MAX {
                self.windows.lock().insert(dest, window - bytes.len());
            }
        }
        Ok(self.window(dest))
    }

    fn rx_indication(&self, dest: DestId, outcome: Outcome) {
        self.events
            .lock()
            .push(DispatchEvent::UpstreamIndication(dest, outcome));
    }
}
