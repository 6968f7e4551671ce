//! 可观测性：tracing 订阅器初始化
//!
//! hive 本身只通过 `tracing` 打日志；嵌入方通常有自己的订阅器，这里的
//! init 仅供独立运行（示例、压测）时使用。

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// 初始化全局订阅器，默认级别 info，可用 RUST_LOG 覆盖
pub fn init() {
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive("info".parse().unwrap()))
        .with(fmt::layer())
        .init();
}

/// 测试用：重复初始化时静默失败
pub fn try_init() -> bool {
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(fmt::layer())
        .try_init()
        .is_ok()
}
