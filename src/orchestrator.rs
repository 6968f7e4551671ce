//! 编排器：主控循环与对外 API
//!
//! 负责：按配置构建全部子系统（显式依赖注入，无全局单例），对外暴露注册/
//! 发布/发送/错误/快照接口；`tick` 按固定顺序推进一轮（总线延迟队列 -> 消息
//! 通道 -> 活性同步 -> 策略调度闸门），`start` 启动 tick 循环、资源监控与
//! 反馈调度三个后台任务，`shutdown` 幂等地请求退出并有界等待。

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::task::JoinHandle;

use crate::bus::{Event, EventBus, EventHandler, EventType, SubscriptionId};
use crate::channel::{ChannelManager, Message};
use crate::config::HiveConfig;
use crate::error::{ErrorManager, ErrorReport, RecoveryStrategy};
use crate::feedback::{FeedbackLoop, FeedbackMetrics};
use crate::monitor::{MetricSource, ProcessMetricSource, ResourceMonitor};
use crate::registry::{ComponentHandle, ComponentRegistry, StateMap};
use crate::shutdown::{join_with_timeout, ShutdownManager};
use crate::sync::{SyncManager, SyncReport};

/// 对外健康快照
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    /// 降级标志：由 ErrorManager 独占写入
    pub degraded: bool,
    /// 滚动性能分：由 FeedbackLoop 独占写入
    pub performance_score: f64,
    pub alerts: Vec<String>,
    pub components: usize,
    pub connections: usize,
}

/// 一轮 tick 的执行统计
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct TickStats {
    pub drained_events: usize,
    pub delivered_messages: usize,
    pub dropped_messages: usize,
    pub synced_connections: usize,
    pub strategies_executed: usize,
}

/// 全量状态报告（诊断用）
#[derive(Debug, Clone, Serialize)]
pub struct FullReport {
    pub running: bool,
    pub ticks: u64,
    pub recent_events: usize,
    pub pending_events: usize,
    pub channels: usize,
    pub pending_messages: usize,
    pub sync: SyncReport,
    pub errors: ErrorReport,
    pub feedback: FeedbackMetrics,
}

/// 编排器根对象
pub struct Orchestrator {
    registry: Arc<ComponentRegistry>,
    bus: Arc<EventBus>,
    channels: Arc<ChannelManager>,
    sync: Arc<SyncManager>,
    monitor: Arc<ResourceMonitor>,
    errors: Arc<ErrorManager>,
    feedback: Arc<FeedbackLoop>,
    shutdown: ShutdownManager,
    tick_interval: Duration,
    join_timeout: Duration,
    started: AtomicBool,
    ticks: AtomicU64,
    tasks: tokio::sync::Mutex<Vec<(JoinHandle<()>, &'static str)>>,
}

impl Orchestrator {
    /// 按配置构建，资源监控使用默认的进程指标源
    pub fn new(config: HiveConfig) -> Self {
        Self::with_metric_source(config, Arc::new(ProcessMetricSource))
    }

    /// 按配置构建并注入自定义指标源（测试与嵌入方使用）
    pub fn with_metric_source(config: HiveConfig, source: Arc<dyn MetricSource>) -> Self {
        let errors = Arc::new(ErrorManager::new(
            config.errors.critical_threshold,
            config.errors.recent_capacity,
        ));
        let bus = Arc::new(EventBus::new(errors.clone(), config.bus.recent_capacity));
        let channels = Arc::new(ChannelManager::new(
            errors.clone(),
            config.channels.mailbox_capacity,
        ));
        let registry = Arc::new(ComponentRegistry::new());
        let sync = Arc::new(SyncManager::new());
        let monitor = Arc::new(ResourceMonitor::new(
            source,
            bus.clone(),
            errors.clone(),
            &config.monitor,
        ));
        let feedback = Arc::new(FeedbackLoop::new(errors.clone(), &config.feedback));

        // 生命周期事件的内置观察者，对应外部订阅者完全透明
        bus.subscribe(
            EventType::ComponentActivated,
            Arc::new(|event| {
                tracing::info!("Component activated: {}", event.source);
                Ok(())
            }),
        );
        bus.subscribe(
            EventType::ComponentDeactivated,
            Arc::new(|event| {
                tracing::info!("Component deactivated: {}", event.source);
                Ok(())
            }),
        );
        bus.subscribe(
            EventType::CriticalError,
            Arc::new(|event| {
                tracing::error!("Critical error event from {}", event.source);
                Ok(())
            }),
        );

        Self {
            registry,
            bus,
            channels,
            sync,
            monitor,
            errors,
            feedback,
            shutdown: ShutdownManager::new(),
            tick_interval: Duration::from_secs(config.runtime.tick_interval_secs.max(1)),
            join_timeout: Duration::from_secs(config.monitor.stop_timeout_secs.max(1)),
            started: AtomicBool::new(false),
            ticks: AtomicU64::new(0),
            tasks: tokio::sync::Mutex::new(Vec::new()),
        }
    }

    // ---- 注册 API ----

    /// 注册组件：进注册表与同步图，并发布 ComponentActivated（延迟优先级，
    /// 下一个 tick 派发）。返回的句柄析构时自动从注册表注销。
    pub fn register_component(&self, name: &str, initial_state: StateMap) -> ComponentHandle {
        let handle = self.registry.register(name, initial_state.clone());
        self.sync.register_component(name, initial_state.clone());
        self.bus.publish(
            Event::new(EventType::ComponentActivated, name)
                .with_payload(Value::Object(initial_state)),
        );
        handle
    }

    /// 注销组件。未知名字为 no-op，重复调用安全；只有真正移除时才发事件。
    pub fn unregister_component(&self, name: &str) {
        let was_registered = self.registry.get(name).is_some();
        self.registry.unregister(name);
        self.sync.unregister_component(name);
        if was_registered {
            self.bus
                .publish(Event::new(EventType::ComponentDeactivated, name));
        }
    }

    /// 合并组件状态快照（注册表与同步图各自推进时间戳/版本）
    pub fn update_component(&self, name: &str, partial_state: StateMap) {
        self.registry.update(name, partial_state.clone());
        self.sync.update_state(name, partial_state);
    }

    // ---- 连接 API ----

    pub fn connect(&self, a: &str, b: &str, kind: &str, strength: f64) {
        self.sync.connect(a, b, kind, strength);
        self.bus.publish(
            Event::new(EventType::ConnectionEstablished, a)
                .with_destination(b)
                .with_payload(serde_json::json!({
                    "kind": kind,
                    "strength": strength.clamp(0.0, 1.0),
                })),
        );
    }

    pub fn disconnect(&self, a: &str, b: &str) {
        if self.sync.disconnect(a, b) {
            self.bus
                .publish(Event::new(EventType::ConnectionBroken, a).with_destination(b));
        }
    }

    // ---- 发布/订阅 API ----

    pub fn subscribe(&self, event_type: EventType, handler: EventHandler) -> SubscriptionId {
        self.bus.subscribe(event_type, handler)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.bus.unsubscribe(id);
    }

    pub fn publish(&self, event_type: EventType, source: &str, payload: Value, priority: u8) {
        self.bus.publish(
            Event::new(event_type, source)
                .with_payload(payload)
                .with_priority(priority),
        );
    }

    // ---- 消息 API ----

    pub fn send(
        &self,
        sender: &str,
        recipient: &str,
        kind: &str,
        body: Value,
        priority: u8,
        response_required: bool,
    ) {
        self.channels.send(
            Message::new(sender, recipient, kind, body)
                .with_priority(priority)
                .with_response_required(response_required),
        );
    }

    pub fn subscribe_channel(
        &self,
        sender: &str,
        recipient: &str,
        handler: crate::channel::MessageHandler,
    ) {
        self.channels.subscribe_channel(sender, recipient, handler);
    }

    // ---- 错误 API ----

    /// 上报错误；critical=true 同时以优先级 3 发布 CriticalError 事件
    pub fn report_error(&self, kind: &str, message: &str, context: &str, critical: bool) {
        self.errors.report(kind, message, context, critical);
        if critical {
            self.bus.publish(
                Event::new(EventType::CriticalError, context)
                    .with_priority(3)
                    .with_payload(serde_json::json!({ "kind": kind, "message": message })),
            );
        }
    }

    pub fn register_recovery_strategy(&self, kind: &str, strategy: RecoveryStrategy) {
        self.errors.register_recovery_strategy(kind, strategy);
    }

    pub fn reset_degraded_mode(&self) {
        self.errors.reset_degraded();
    }

    // ---- 主循环 ----

    /// 推进一轮：总线延迟队列 -> 全部消息通道 -> 活性同步 -> 策略调度闸门。
    /// 监控采样不在 tick 内，由它自己的定时任务驱动。
    pub fn tick(&self) -> TickStats {
        let drained_events = self.bus.drain_pending();
        let message_stats = self.channels.drain();
        let synced_connections = self.sync.sync_all(None);
        let strategies_executed = self.feedback.strategy_pass_if_due();

        self.ticks.fetch_add(1, Ordering::SeqCst);
        TickStats {
            drained_events,
            delivered_messages: message_stats.delivered,
            dropped_messages: message_stats.dropped,
            synced_connections,
            strategies_executed,
        }
    }

    /// 启动三个后台任务：tick 循环、监控采样、反馈调度。重复调用为 no-op。
    /// shutdown 之后不可重启（关闭信号不可逆），再次 start 只记告警。
    pub async fn start(self: &Arc<Self>) {
        if self.shutdown.is_shutdown() {
            tracing::warn!("Orchestrator already shut down, start ignored");
            return;
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }

        self.monitor.start().await;

        let orchestrator = Arc::clone(self);
        let token = self.shutdown.token();
        let interval = self.tick_interval;
        let tick_handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        orchestrator.tick();
                    }
                }
            }
        });

        let feedback_handle = self.feedback.spawn_scheduler(self.shutdown.token());

        let mut tasks = self.tasks.lock().await;
        tasks.push((tick_handle, "orchestrator_tick"));
        tasks.push((feedback_handle, "feedback_scheduler"));
        tracing::info!("Orchestrator started (tick interval {:?})", interval);
    }

    /// 请求全部后台任务退出并有界等待。幂等，重复调用安全。
    pub async fn shutdown(&self) {
        self.shutdown.shutdown();
        self.monitor.stop().await;

        let drained: Vec<(JoinHandle<()>, &'static str)> =
            self.tasks.lock().await.drain(..).collect();
        for (handle, name) in drained {
            join_with_timeout(handle, self.join_timeout, name).await;
        }
        self.started.store(false, Ordering::SeqCst);
        tracing::info!("Orchestrator shut down");
    }

    // ---- 读取 API ----

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            degraded: self.errors.is_degraded(),
            performance_score: self.feedback.performance_score(),
            alerts: self.monitor.alert_names(),
            components: self.registry.len(),
            connections: self.sync.active_connection_count(),
        }
    }

    pub fn full_report(&self) -> FullReport {
        FullReport {
            running: self.started.load(Ordering::SeqCst),
            ticks: self.ticks.load(Ordering::SeqCst),
            recent_events: self.bus.recent_events(None).len(),
            pending_events: self.bus.pending_len(),
            channels: self.channels.channels().len(),
            pending_messages: self.channels.pending_total(),
            sync: self.sync.report(),
            errors: self.errors.report_summary(),
            feedback: self.feedback.metrics(),
        }
    }

    // ---- 子系统访问（嵌入方组合使用） ----

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn channels(&self) -> &Arc<ChannelManager> {
        &self.channels
    }

    pub fn registry(&self) -> &Arc<ComponentRegistry> {
        &self.registry
    }

    pub fn sync(&self) -> &Arc<SyncManager> {
        &self.sync
    }

    pub fn monitor(&self) -> &Arc<ResourceMonitor> {
        &self.monitor
    }

    pub fn errors(&self) -> &Arc<ErrorManager> {
        &self.errors
    }

    pub fn feedback(&self) -> &Arc<FeedbackLoop> {
        &self.feedback
    }
}
