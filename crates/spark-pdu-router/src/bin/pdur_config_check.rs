//! 路由配置校验工具：加载 TOML 路由表，执行完整校验并打印缓冲池概览。
//!
//! # 使用方法
//! ```bash
//! cargo run -p spark-pdu-router --features cli --bin pdur-config-check -- gateway.toml --build
//! ```
//! - `gateway.toml`：路由配置文件；
//! - `--build`：可选，校验通过后再实际构造一次路由器，确认全部存储可以分配。
//!
//! 日志级别通过 `RUST_LOG` 控制，默认 `info`。

use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use spark_pdu_router::config::DestinationKind;
use spark_pdu_router::{
    DestId, ModuleDispatch, Outcome, QueueId, Router, RouterConfig, TransmitRequest,
};

/// 校验工具只构造路由器、不转发流量，分发回调全部为空操作。
struct NullDispatch;

impl ModuleDispatch for NullDispatch {
    fn transmit(&self, _dest: DestId, _request: TransmitRequest) -> spark_pdu_router::Result<()> {
        Ok(())
    }

    fn start_of_reception(
        &self,
        _dest: DestId,
        _request: TransmitRequest,
    ) -> spark_pdu_router::Result<usize> {
        Ok(0)
    }

    fn copy_rx_data(&self, _dest: DestId, _bytes: &[u8]) -> spark_pdu_router::Result<usize> {
        Ok(0)
    }

    fn rx_indication(&self, _dest: DestId, _outcome: Outcome) {}
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(error) = run() {
        eprintln!("配置校验失败: {error}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), String> {
    let mut args = env::args().skip(1);
    let path = args
        .next()
        .map(PathBuf::from)
        .ok_or_else(|| usage("缺少配置文件路径"))?;
    let mut build = false;
    for flag in args {
        match flag.as_str() {
            "--build" => build = true,
            unknown => return Err(usage(&format!("未知参数: {unknown}"))),
        }
    }

    let config = RouterConfig::from_toml_file(&path).map_err(|error| error.to_string())?;
    tracing::info!(path = %path.display(), "configuration is valid");
    print_summary(&config);

    if build {
        Router::builder(config)
            .dispatch(Arc::new(NullDispatch))
            .build()
            .map_err(|error| error.to_string())?;
        tracing::info!("router constructed");
    }
    Ok(())
}

fn print_summary(config: &RouterConfig) {
    println!(
        "cores={} locks={} buffers={} queues={} routes={} destinations={}",
        config.core_count,
        config.locks.len(),
        config.buffers.len(),
        config.queues.len(),
        config.routes.len(),
        config.destinations.len()
    );
    for (index, queue) in config.queues.iter().enumerate() {
        let capacities: Vec<usize> = queue
            .pool
            .iter()
            .filter_map(|id| config.buffer(*id).map(|buffer| buffer.capacity))
            .collect();
        let total: usize = capacities.iter().sum();
        println!(
            "{} depth={} pool={:?} bytes={total}",
            QueueId::new(index as u16),
            queue.depth,
            capacities
        );
    }
    for (index, route) in config.routes.iter().enumerate() {
        let (downstream, upstream) = route
            .destinations
            .iter()
            .filter_map(|id| config.destination(*id))
            .fold((0, 0), |(down, up), dest| match dest.kind {
                DestinationKind::Downstream => (down + 1, up),
                DestinationKind::Upstream => (down, up + 1),
            });
        println!(
            "route#{index} {} threshold={} minimum_buffer={} downstream={downstream} upstream={upstream}",
            route.queue,
            route.threshold,
            route.minimum_buffer()
        );
    }
}

fn usage(reason: &str) -> String {
    format!("{reason}\n用法: pdur-config-check <config.toml> [--build]")
}
