//! 错误类型与错误管理器
//!
//! 与总线/通道/监控/反馈配合：处理器与策略返回 `Result<(), HiveError>`，
//! 派发循环检查结果并上报 ErrorManager；累计严重错误达到阈值后进入降级模式，
//! 需显式 reset 才能退出。

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

/// 运行时内部可能出现的错误（处理器、恢复策略、指标源、反馈策略）
#[derive(Error, Debug)]
pub enum HiveError {
    #[error("Handler failed: {0}")]
    Handler(String),

    #[error("Recovery strategy failed: {0}")]
    Recovery(String),

    #[error("Metric source unavailable: {0}")]
    MetricSource(String),

    #[error("Strategy execution failed: {0}")]
    Strategy(String),
}

/// 单条错误记录
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    /// 错误类别，恢复策略按此键查找
    pub kind: String,
    pub message: String,
    /// 上报方描述的发生位置（如 "event_bus dispatch"）
    pub context: String,
    pub timestamp: DateTime<Utc>,
    pub critical: bool,
    /// 上报时捕获的调用栈（RUST_BACKTRACE 未开启时为占位文本）
    pub stack_context: String,
}

impl ErrorRecord {
    pub fn new(kind: &str, message: &str, context: &str, critical: bool) -> Self {
        Self {
            kind: kind.to_string(),
            message: message.to_string(),
            context: context.to_string(),
            timestamp: Utc::now(),
            critical,
            stack_context: std::backtrace::Backtrace::capture().to_string(),
        }
    }
}

/// 错误概览（供快照/诊断读取）
#[derive(Debug, Clone, Serialize)]
pub struct ErrorReport {
    pub recent_count: usize,
    pub critical_count: usize,
    pub degraded: bool,
    /// 最近 10 条记录
    pub last_errors: Vec<ErrorRecord>,
}

/// 恢复策略：按错误 kind 注册，返回 Err 时由 attempt_recovery 上报为非严重错误
pub type RecoveryStrategy = Arc<dyn Fn(&ErrorRecord) -> Result<(), HiveError> + Send + Sync>;

struct ErrorState {
    recent: VecDeque<ErrorRecord>,
    criticals: Vec<ErrorRecord>,
    strategies: HashMap<String, RecoveryStrategy>,
    last_noncritical_at: Option<DateTime<Utc>>,
}

/// 错误管理器：近期错误环形缓冲 + 严重错误累计 + 降级模式开关 + 恢复策略注册表
pub struct ErrorManager {
    critical_threshold: usize,
    recent_capacity: usize,
    /// 降级标志：只由本管理器置位，到达阈值后保持，直到 reset_degraded()
    degraded: AtomicBool,
    inner: Mutex<ErrorState>,
}

impl ErrorManager {
    pub fn new(critical_threshold: usize, recent_capacity: usize) -> Self {
        Self {
            critical_threshold: critical_threshold.max(1),
            recent_capacity: recent_capacity.max(1),
            degraded: AtomicBool::new(false),
            inner: Mutex::new(ErrorState {
                recent: VecDeque::new(),
                criticals: Vec::new(),
                strategies: HashMap::new(),
                last_noncritical_at: None,
            }),
        }
    }

    /// 锁中毒时继续使用内部状态，上报路径绝不向调用方抛出
    fn state(&self) -> MutexGuard<'_, ErrorState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 上报一次失败。critical=true 计入降级判定；非严重错误 1 秒内连续出现记一次风暴告警。
    pub fn report(&self, kind: &str, message: &str, context: &str, critical: bool) {
        let record = ErrorRecord::new(kind, message, context, critical);
        let mut state = self.state();

        if !critical {
            if let Some(prev) = state.last_noncritical_at {
                let elapsed = record.timestamp.signed_duration_since(prev);
                if elapsed < chrono::Duration::seconds(1) {
                    tracing::warn!("Error storm detected: repeated non-critical errors within 1s");
                }
            }
            state.last_noncritical_at = Some(record.timestamp);
        }

        if state.recent.len() >= self.recent_capacity {
            state.recent.pop_front();
        }
        state.recent.push_back(record.clone());

        if critical {
            state.criticals.push(record.clone());
            tracing::error!("Critical error in {}: [{}] {}", context, kind, message);
            if state.criticals.len() >= self.critical_threshold
                && !self.degraded.swap(true, Ordering::SeqCst)
            {
                tracing::error!(
                    "Degraded mode activated after {} critical errors",
                    state.criticals.len()
                );
            }
        } else {
            tracing::warn!("Error in {}: [{}] {}", context, kind, message);
        }
    }

    /// 注册针对某个错误 kind 的恢复策略；同 kind 重复注册覆盖旧策略
    pub fn register_recovery_strategy(&self, kind: &str, strategy: RecoveryStrategy) {
        self.state().strategies.insert(kind.to_string(), strategy);
    }

    /// 按错误 kind 查找并执行恢复策略。无策略返回 false；
    /// 策略本身失败时上报一条非严重错误，不自动重试。
    pub fn attempt_recovery(&self, error: &ErrorRecord) -> bool {
        let strategy = self.state().strategies.get(&error.kind).cloned();

        let Some(strategy) = strategy else {
            return false;
        };

        match strategy(error) {
            Ok(()) => {
                tracing::info!("Recovery succeeded for kind '{}'", error.kind);
                true
            }
            Err(e) => {
                self.report(
                    "recovery",
                    &e.to_string(),
                    &format!("recovery attempt for '{}'", error.kind),
                    false,
                );
                false
            }
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    /// 显式退出降级模式，并清空累计的严重错误，让阈值从零重新计数
    pub fn reset_degraded(&self) {
        self.state().criticals.clear();
        if self.degraded.swap(false, Ordering::SeqCst) {
            tracing::info!("Degraded mode reset");
        }
    }

    pub fn critical_count(&self) -> usize {
        self.state().criticals.len()
    }

    pub fn report_summary(&self) -> ErrorReport {
        let state = self.state();
        let last_errors = state
            .recent
            .iter()
            .rev()
            .take(10)
            .rev()
            .cloned()
            .collect();
        ErrorReport {
            recent_count: state.recent.len(),
            critical_count: state.criticals.len(),
            degraded: self.is_degraded(),
            last_errors,
        }
    }
}
