//! Hive - Rust 进程内编排与自监控运行时
//!
//! 单进程、尽力而为的协调层：跟踪外部系统的组件，在它们之间传递事件与消息，
//! 监控资源并在反复的严重失败后进入降级模式。不做分布式、不做持久化日志、
//! 不做加密保证。
//!
//! 模块划分：
//! - **bus**: 类型化事件总线（高优先级同步派发 + 延迟队列）
//! - **channel**: 点对点消息通道（惰性创建、有界信箱、拉取式派发）
//! - **config**: 运行时配置加载（TOML + 环境变量）
//! - **error**: 错误类型、错误管理器与降级模式
//! - **feedback**: 自适应反馈（经验环、滚动性能分、策略调度）
//! - **monitor**: 资源监控（后台采样、阈值告警）
//! - **observability**: tracing 订阅器初始化
//! - **orchestrator**: 根编排器（tick 循环、对外 API、快照）
//! - **registry**: 组件注册表（RAII 句柄、状态快照）
//! - **shutdown**: 停止信号与有界 join
//! - **sync**: 组件连接图与活性同步

pub mod bus;
pub mod channel;
pub mod config;
pub mod error;
pub mod feedback;
pub mod monitor;
pub mod observability;
pub mod orchestrator;
pub mod registry;
pub mod shutdown;
pub mod sync;

pub use bus::{Event, EventBus, EventHandler, EventType, PayloadMap, SubscriptionId};
pub use channel::{ChannelManager, DrainStats, Message, MessageHandler};
pub use config::{load_config, HiveConfig};
pub use error::{ErrorManager, ErrorRecord, ErrorReport, HiveError, RecoveryStrategy};
pub use feedback::{FeedbackLoop, FeedbackMetrics, StrategyAction};
pub use monitor::{Alert, MetricSample, MetricSource, ProcessMetricSource, ResourceMonitor};
pub use orchestrator::{FullReport, Orchestrator, Snapshot, TickStats};
pub use registry::{ComponentHandle, ComponentRegistry, ComponentSnapshot, StateMap};
pub use shutdown::ShutdownManager;
pub use sync::{Connection, ConnectionState, SyncManager, SyncReport};
