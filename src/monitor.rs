//! 资源监控：后台采样、阈值告警、降速失败
//!
//! 状态机只有 STOPPED / RUNNING 两态。`start` 启动一个周期采样任务（默认 30 秒），
//! 每轮从 `MetricSource` 取一组仪表值，与配置阈值比较；新突破的指标进入活跃
//! 告警表（按指标名去重）并以优先级 3 通过事件总线发布 ThresholdExceeded，
//! 指标回落后下一轮自动清除。采样失败上报为非严重资源错误，保留最近一次成功值。

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::bus::{Event, EventBus, EventType};
use crate::config::MonitorSection;
use crate::error::{ErrorManager, HiveError};
use crate::shutdown::join_with_timeout;

/// 单个指标样本
#[derive(Debug, Clone, Serialize)]
pub struct MetricSample {
    pub name: String,
    pub value: f64,
    pub unit: String,
    pub timestamp: DateTime<Utc>,
}

impl MetricSample {
    pub fn new(name: &str, value: f64, unit: &str) -> Self {
        Self {
            name: name.to_string(),
            value,
            unit: unit.to_string(),
            timestamp: Utc::now(),
        }
    }
}

/// 指标来源。进程内默认实现读 /proc，测试与嵌入方可注入自己的源。
#[async_trait]
pub trait MetricSource: Send + Sync {
    async fn sample(&self) -> Result<Vec<MetricSample>, HiveError>;
}

/// 默认指标源：内存占用百分比、可用内存、负载折算的 CPU 占用近似值
pub struct ProcessMetricSource;

#[async_trait]
impl MetricSource for ProcessMetricSource {
    async fn sample(&self) -> Result<Vec<MetricSample>, HiveError> {
        sample_proc()
    }
}

#[cfg(target_os = "linux")]
fn sample_proc() -> Result<Vec<MetricSample>, HiveError> {
    let meminfo = std::fs::read_to_string("/proc/meminfo")
        .map_err(|e| HiveError::MetricSource(format!("/proc/meminfo: {}", e)))?;
    let total_kb = meminfo_kb(&meminfo, "MemTotal")
        .ok_or_else(|| HiveError::MetricSource("MemTotal missing".into()))?;
    let available_kb = meminfo_kb(&meminfo, "MemAvailable")
        .ok_or_else(|| HiveError::MetricSource("MemAvailable missing".into()))?;

    let loadavg = std::fs::read_to_string("/proc/loadavg")
        .map_err(|e| HiveError::MetricSource(format!("/proc/loadavg: {}", e)))?;
    let load1: f64 = loadavg
        .split_whitespace()
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| HiveError::MetricSource("loadavg parse failed".into()))?;

    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1) as f64;

    let memory_usage = if total_kb > 0.0 {
        (1.0 - available_kb / total_kb) * 100.0
    } else {
        0.0
    };

    Ok(vec![
        MetricSample::new("memory_usage", memory_usage, "%"),
        MetricSample::new("memory_available_mb", available_kb / 1024.0, "MB"),
        // 1 分钟负载按核数折算，作为 CPU 占用的近似
        MetricSample::new("cpu_usage", (load1 / cpus * 100.0).min(100.0), "%"),
    ])
}

#[cfg(not(target_os = "linux"))]
fn sample_proc() -> Result<Vec<MetricSample>, HiveError> {
    Err(HiveError::MetricSource(
        "process metrics only available on linux".into(),
    ))
}

#[cfg(target_os = "linux")]
fn meminfo_kb(meminfo: &str, key: &str) -> Option<f64> {
    meminfo
        .lines()
        .find(|line| line.starts_with(key))
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|s| s.parse().ok())
}

/// 活跃告警，按指标名去重
#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub metric: String,
    pub value: f64,
    pub limit: f64,
    pub raised_at: DateTime<Utc>,
}

/// 单轮采样的报告，保留最近 N 轮
#[derive(Debug, Clone, Serialize)]
pub struct MetricsReport {
    pub timestamp: DateTime<Utc>,
    pub samples: Vec<MetricSample>,
    pub alerts: Vec<String>,
}

struct MonitorState {
    latest: HashMap<String, MetricSample>,
    alerts: Vec<Alert>,
    reports: VecDeque<MetricsReport>,
}

/// 资源监控器
pub struct ResourceMonitor {
    source: Arc<dyn MetricSource>,
    bus: Arc<EventBus>,
    errors: Arc<ErrorManager>,
    thresholds: HashMap<String, f64>,
    sampling_interval: Duration,
    stop_timeout: Duration,
    report_capacity: usize,
    running: AtomicBool,
    inner: Mutex<MonitorState>,
    runner: tokio::sync::Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl ResourceMonitor {
    pub fn new(
        source: Arc<dyn MetricSource>,
        bus: Arc<EventBus>,
        errors: Arc<ErrorManager>,
        cfg: &MonitorSection,
    ) -> Self {
        Self {
            source,
            bus,
            errors,
            thresholds: cfg.thresholds.clone(),
            sampling_interval: Duration::from_secs(cfg.sampling_interval_secs.max(1)),
            stop_timeout: Duration::from_secs(cfg.stop_timeout_secs.max(1)),
            report_capacity: cfg.report_capacity.max(1),
            running: AtomicBool::new(false),
            inner: Mutex::new(MonitorState {
                latest: HashMap::new(),
                alerts: Vec::new(),
                reports: VecDeque::new(),
            }),
            runner: tokio::sync::Mutex::new(None),
        }
    }

    fn state(&self) -> MutexGuard<'_, MonitorState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// STOPPED -> RUNNING：启动周期采样任务。已在运行则为 no-op。
    pub async fn start(self: &Arc<Self>) {
        let mut runner = self.runner.lock().await;
        if runner.is_some() {
            return;
        }

        let token = CancellationToken::new();
        let task_token = token.clone();
        let monitor = Arc::clone(self);
        let interval = self.sampling_interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = task_token.cancelled() => break,
                    _ = ticker.tick() => monitor.sample_once().await,
                }
            }
        });

        *runner = Some((token, handle));
        self.running.store(true, Ordering::SeqCst);
        tracing::info!("Resource monitor started (interval {:?})", interval);
    }

    /// RUNNING -> STOPPED：通知采样任务退出并有界等待。重复调用安全。
    pub async fn stop(&self) {
        let taken = self.runner.lock().await.take();
        let Some((token, handle)) = taken else {
            return;
        };

        token.cancel();
        join_with_timeout(handle, self.stop_timeout, "resource_monitor_sampler").await;
        self.running.store(false, Ordering::SeqCst);
        tracing::info!("Resource monitor stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// 执行一轮采样与阈值比对。后台任务每个周期调用；也可手动触发。
    pub async fn sample_once(&self) {
        let samples = match self.source.sample().await {
            Ok(samples) => samples,
            Err(e) => {
                // 采样失败保留最近一次成功值
                self.errors
                    .report("resource", &e.to_string(), "resource monitor sampling", false);
                return;
            }
        };

        let new_alerts = {
            let mut state = self.state();
            for sample in &samples {
                state.latest.insert(sample.name.clone(), sample.clone());
            }

            let mut breached: Vec<Alert> = Vec::new();
            for sample in &samples {
                if let Some(&limit) = self.thresholds.get(&sample.name) {
                    if sample.value > limit {
                        breached.push(Alert {
                            metric: sample.name.clone(),
                            value: sample.value,
                            limit,
                            raised_at: Utc::now(),
                        });
                    }
                }
            }

            // 新突破的指标才发事件；已在表中的沿用原 raised_at，回落的被清除
            let new_alerts: Vec<Alert> = breached
                .iter()
                .filter(|alert| !state.alerts.iter().any(|a| a.metric == alert.metric))
                .cloned()
                .collect();

            let previous = std::mem::take(&mut state.alerts);
            state.alerts = breached
                .into_iter()
                .map(|alert| {
                    previous
                        .iter()
                        .find(|a| a.metric == alert.metric)
                        .cloned()
                        .unwrap_or(alert)
                })
                .collect();

            let report = MetricsReport {
                timestamp: Utc::now(),
                samples,
                alerts: state.alerts.iter().map(|a| a.metric.clone()).collect(),
            };
            if state.reports.len() >= self.report_capacity {
                state.reports.pop_front();
            }
            state.reports.push_back(report);

            new_alerts
        };

        for alert in new_alerts {
            tracing::warn!(
                "Threshold exceeded: {} = {:.1} (limit {:.1})",
                alert.metric,
                alert.value,
                alert.limit
            );
            self.bus.publish(
                Event::new(EventType::ThresholdExceeded, "resource_monitor")
                    .with_priority(3)
                    .with_payload(serde_json::json!({
                        "metric": alert.metric,
                        "value": alert.value,
                        "limit": alert.limit,
                    })),
            );
        }
    }

    pub fn active_alerts(&self) -> Vec<Alert> {
        self.state().alerts.clone()
    }

    pub fn alert_names(&self) -> Vec<String> {
        self.state().alerts.iter().map(|a| a.metric.clone()).collect()
    }

    pub fn latest_metrics(&self) -> HashMap<String, MetricSample> {
        self.state().latest.clone()
    }

    pub fn recent_reports(&self) -> Vec<MetricsReport> {
        self.state().reports.iter().cloned().collect()
    }
}
