//! 自适应反馈：经验累积、滚动性能分与策略调度
//!
//! 经验 (context, action, score) 进有界环形缓冲；每记录 batch_size 条做一次
//! 重算，最近 window 条的平均分成为滚动性能分，与上一次的差值即改进率。
//! 策略带优先级与成功/失败计数，调度轮按优先级从高到低执行「到期」策略：
//! 从未运行、距上次运行超过过期时长、或历史成功率超过 80% 的策略视为到期。
//! 策略执行失败上报 ErrorManager（非严重），不自动重试。

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::bus::PayloadMap;
use crate::config::FeedbackSection;
use crate::error::{ErrorManager, HiveError};

/// 一条结果反馈经验
#[derive(Debug, Clone, Serialize)]
pub struct Experience {
    pub context: PayloadMap,
    pub action: String,
    /// 结果评分，记录时钳制到 [-1, 1]
    pub score: f64,
    pub timestamp: DateTime<Utc>,
}

/// 策略动作：返回 Err 计一次失败并上报
pub type StrategyAction = Arc<dyn Fn() -> Result<(), HiveError> + Send + Sync>;

struct StrategyRecord {
    name: String,
    action: StrategyAction,
    priority: i32,
    last_run: Option<DateTime<Utc>>,
    success: u64,
    failure: u64,
}

impl StrategyRecord {
    fn success_ratio(&self) -> f64 {
        let total = self.success + self.failure;
        if total == 0 {
            0.0
        } else {
            self.success as f64 / total as f64
        }
    }

    /// 到期条件：从未运行 / 距上次运行超过 stale / 成功率 > 0.8
    fn is_due(&self, now: DateTime<Utc>, stale: chrono::Duration) -> bool {
        match self.last_run {
            None => true,
            Some(last) => now.signed_duration_since(last) > stale || self.success_ratio() > 0.8,
        }
    }
}

/// 策略概况（供报告读取）
#[derive(Debug, Clone, Serialize)]
pub struct StrategySummary {
    pub name: String,
    pub priority: i32,
    pub success: u64,
    pub failure: u64,
    pub success_ratio: f64,
}

/// 反馈层指标汇总
#[derive(Debug, Clone, Serialize)]
pub struct FeedbackMetrics {
    pub performance_score: f64,
    pub improvement_rate: f64,
    pub experience_count: usize,
    pub strategies: Vec<StrategySummary>,
    pub last_pass: Option<DateTime<Utc>>,
}

struct FeedbackState {
    experiences: VecDeque<Experience>,
    strategies: Vec<StrategyRecord>,
    performance: f64,
    improvement_rate: f64,
    recorded_total: u64,
    last_pass: Option<DateTime<Utc>>,
}

/// 自适应反馈环
pub struct FeedbackLoop {
    errors: Arc<ErrorManager>,
    batch_size: usize,
    window: usize,
    experience_capacity: usize,
    stale: chrono::Duration,
    pass_interval: chrono::Duration,
    inner: Mutex<FeedbackState>,
}

impl FeedbackLoop {
    pub fn new(errors: Arc<ErrorManager>, cfg: &FeedbackSection) -> Self {
        Self {
            errors,
            batch_size: cfg.batch_size.max(1),
            window: cfg.window.max(1),
            experience_capacity: cfg.experience_capacity.max(1),
            stale: chrono::Duration::hours(cfg.strategy_stale_hours.max(1) as i64),
            pass_interval: chrono::Duration::seconds(cfg.pass_interval_secs as i64),
            inner: Mutex::new(FeedbackState {
                experiences: VecDeque::new(),
                strategies: Vec::new(),
                performance: 0.0,
                improvement_rate: 0.0,
                recorded_total: 0,
                last_pass: None,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, FeedbackState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 记录一条经验。每满 batch_size 条就地重算滚动性能分（O(window) 的算术，
    /// 无需等待点，保证触发时机对调用方可见且确定）。
    pub fn record_experience(&self, context: PayloadMap, action: &str, score: f64) {
        let experience = Experience {
            context,
            action: action.to_string(),
            score: score.clamp(-1.0, 1.0),
            timestamp: Utc::now(),
        };

        let mut state = self.state();
        if state.experiences.len() >= self.experience_capacity {
            state.experiences.pop_front();
        }
        state.experiences.push_back(experience);
        state.recorded_total += 1;

        if state.recorded_total % self.batch_size as u64 == 0 {
            let window: Vec<f64> = state
                .experiences
                .iter()
                .rev()
                .take(self.window)
                .map(|e| e.score)
                .collect();
            let average = if window.is_empty() {
                0.0
            } else {
                window.iter().sum::<f64>() / window.len() as f64
            };

            state.improvement_rate = average - state.performance;
            state.performance = average;
            tracing::debug!(
                "Performance recomputed: {:.3} (delta {:+.3})",
                state.performance,
                state.improvement_rate
            );
        }
    }

    /// 滚动性能分：最近 window 条经验的平均分，按批重算
    pub fn performance_score(&self) -> f64 {
        self.state().performance
    }

    /// 最近一次重算相对上一次的分数差
    pub fn improvement_rate(&self) -> f64 {
        self.state().improvement_rate
    }

    pub fn experience_count(&self) -> usize {
        self.state().experiences.len()
    }

    /// 注册一个策略。不会自动删除，由成功/失败计数驱动后续调度。
    pub fn register_strategy(&self, name: &str, action: StrategyAction, priority: i32) {
        self.state().strategies.push(StrategyRecord {
            name: name.to_string(),
            action,
            priority,
            last_run: None,
            success: 0,
            failure: 0,
        });
        tracing::debug!("Strategy registered: {} (priority {})", name, priority);
    }

    /// 执行一轮策略调度：按优先级从高到低执行全部到期策略，返回执行条数。
    /// 动作在锁外运行，策略内部可以安全地回调 record_experience。
    pub fn strategy_pass(&self) -> usize {
        let now = Utc::now();
        let due: Vec<(usize, String, StrategyAction)> = {
            let mut state = self.state();
            state.last_pass = Some(now);

            let mut indices: Vec<usize> = (0..state.strategies.len())
                .filter(|&i| state.strategies[i].is_due(now, self.stale))
                .collect();
            indices.sort_by_key(|&i| std::cmp::Reverse(state.strategies[i].priority));

            for &i in &indices {
                state.strategies[i].last_run = Some(now);
            }
            indices
                .into_iter()
                .map(|i| {
                    let s = &state.strategies[i];
                    (i, s.name.clone(), s.action.clone())
                })
                .collect()
        };

        let mut executed = 0;
        for (index, name, action) in due {
            let result = action();
            executed += 1;

            let mut state = self.state();
            match result {
                Ok(()) => {
                    state.strategies[index].success += 1;
                    tracing::debug!("Strategy succeeded: {}", name);
                }
                Err(e) => {
                    state.strategies[index].failure += 1;
                    drop(state);
                    self.errors.report(
                        "strategy",
                        &e.to_string(),
                        &format!("strategy '{}'", name),
                        false,
                    );
                }
            }
        }
        executed
    }

    /// 距上一轮不足 pass_interval 时跳过。编排 tick 与后台调度器共用这道闸门，
    /// 实际节奏始终是 pass_interval。
    pub fn strategy_pass_if_due(&self) -> usize {
        let due = {
            let state = self.state();
            match state.last_pass {
                None => true,
                Some(last) => Utc::now().signed_duration_since(last) >= self.pass_interval,
            }
        };
        if due {
            self.strategy_pass()
        } else {
            0
        }
    }

    /// 启动独立的调度循环，随取消 token 退出
    pub fn spawn_scheduler(self: &Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        let feedback = Arc::clone(self);
        let interval = Duration::from_secs(self.pass_interval.num_seconds().max(1) as u64);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        feedback.strategy_pass_if_due();
                    }
                }
            }
        })
    }

    pub fn metrics(&self) -> FeedbackMetrics {
        let state = self.state();
        FeedbackMetrics {
            performance_score: state.performance,
            improvement_rate: state.improvement_rate,
            experience_count: state.experiences.len(),
            strategies: state
                .strategies
                .iter()
                .map(|s| StrategySummary {
                    name: s.name.clone(),
                    priority: s.priority,
                    success: s.success,
                    failure: s.failure,
                    success_ratio: s.success_ratio(),
                })
                .collect(),
            last_pass: state.last_pass,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn feedback() -> (Arc<ErrorManager>, FeedbackLoop) {
        let errors = Arc::new(ErrorManager::new(5, 100));
        let feedback = FeedbackLoop::new(errors.clone(), &FeedbackSection::default());
        (errors, feedback)
    }

    #[test]
    fn test_rolling_score_after_batch_trigger() {
        let (_errors, feedback) = feedback();

        for _ in 0..5 {
            feedback.record_experience(PayloadMap::new(), "act", 0.8);
        }
        // 批次未满，分数尚未重算
        assert_eq!(feedback.performance_score(), 0.0);

        for _ in 0..5 {
            feedback.record_experience(PayloadMap::new(), "act", 0.2);
        }

        assert!((feedback.performance_score() - 0.5).abs() < 1e-9);
        assert!((feedback.improvement_rate() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_score_clamped_on_record() {
        let (_errors, feedback) = feedback();
        for _ in 0..10 {
            feedback.record_experience(PayloadMap::new(), "act", 7.5);
        }
        assert!((feedback.performance_score() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_experience_ring_is_bounded() {
        let errors = Arc::new(ErrorManager::new(5, 100));
        let cfg = FeedbackSection {
            experience_capacity: 20,
            ..FeedbackSection::default()
        };
        let feedback = FeedbackLoop::new(errors, &cfg);

        for _ in 0..50 {
            feedback.record_experience(PayloadMap::new(), "act", 0.1);
        }
        assert_eq!(feedback.experience_count(), 20);
    }

    #[test]
    fn test_never_run_strategy_is_due() {
        let (_errors, feedback) = feedback();
        let runs = Arc::new(AtomicUsize::new(0));

        let counter = runs.clone();
        feedback.register_strategy(
            "warmup",
            Arc::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
            1,
        );

        assert_eq!(feedback.strategy_pass(), 1);
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        let summary = &feedback.metrics().strategies[0];
        assert_eq!(summary.success, 1);
        assert_eq!(summary.failure, 0);
    }

    #[test]
    fn test_high_success_ratio_keeps_strategy_due() {
        let (_errors, feedback) = feedback();
        feedback.register_strategy("winner", Arc::new(|| Ok(())), 1);

        // 第一轮：从未运行；之后成功率 1.0 > 0.8，始终到期
        for _ in 0..3 {
            assert_eq!(feedback.strategy_pass(), 1);
        }
        assert_eq!(feedback.metrics().strategies[0].success, 3);
    }

    #[test]
    fn test_failed_strategy_not_rerun_until_stale() {
        let (errors, feedback) = feedback();
        feedback.register_strategy(
            "flaky",
            Arc::new(|| Err(HiveError::Strategy("nope".into()))),
            1,
        );

        assert_eq!(feedback.strategy_pass(), 1);
        // 失败上报为非严重错误
        assert_eq!(errors.report_summary().recent_count, 1);
        assert!(!errors.is_degraded());

        // 成功率 0，又刚刚跑过：下一轮不到期
        assert_eq!(feedback.strategy_pass(), 0);
        let summary = &feedback.metrics().strategies[0];
        assert_eq!(summary.failure, 1);
        assert_eq!(summary.success, 0);
    }

    #[test]
    fn test_due_strategies_execute_in_priority_order() {
        let (_errors, feedback) = feedback();
        let order = Arc::new(Mutex::new(Vec::new()));

        for (name, priority) in [("low", 1), ("high", 9), ("mid", 5)] {
            let log = order.clone();
            feedback.register_strategy(
                name,
                Arc::new(move || {
                    log.lock().unwrap().push(name.to_string());
                    Ok(())
                }),
                priority,
            );
        }

        assert_eq!(feedback.strategy_pass(), 3);
        assert_eq!(*order.lock().unwrap(), vec!["high", "mid", "low"]);
    }

    #[test]
    fn test_pass_if_due_respects_interval() {
        let (_errors, feedback) = feedback();
        feedback.register_strategy("s", Arc::new(|| Ok(())), 1);

        assert_eq!(feedback.strategy_pass_if_due(), 1);
        // 默认间隔 300 秒，紧接着的调用被闸门挡下
        assert_eq!(feedback.strategy_pass_if_due(), 0);
    }
}
