//! 运行时配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `HIVE__*` 覆盖（双下划线表示嵌套，如 `HIVE__RUNTIME__TICK_INTERVAL_SECS=1`）。

use std::collections::HashMap;
use std::path::PathBuf;

use serde::Deserialize;

/// 运行时配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct HiveConfig {
    #[serde(default)]
    pub runtime: RuntimeSection,
    #[serde(default)]
    pub bus: BusSection,
    #[serde(default)]
    pub channels: ChannelsSection,
    #[serde(default)]
    pub monitor: MonitorSection,
    #[serde(default)]
    pub errors: ErrorsSection,
    #[serde(default)]
    pub feedback: FeedbackSection,
}

/// [runtime] 段：编排器主循环
#[derive(Debug, Clone, Deserialize)]
pub struct RuntimeSection {
    /// tick 间隔（秒）
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,
}

impl Default for RuntimeSection {
    fn default() -> Self {
        Self {
            tick_interval_secs: default_tick_interval_secs(),
        }
    }
}

fn default_tick_interval_secs() -> u64 {
    5
}

/// [bus] 段：事件总线
#[derive(Debug, Clone, Deserialize)]
pub struct BusSection {
    /// 近期事件环形缓冲容量
    #[serde(default = "default_recent_capacity")]
    pub recent_capacity: usize,
}

impl Default for BusSection {
    fn default() -> Self {
        Self {
            recent_capacity: default_recent_capacity(),
        }
    }
}

fn default_recent_capacity() -> usize {
    1000
}

/// [channels] 段：点对点消息通道
#[derive(Debug, Clone, Deserialize)]
pub struct ChannelsSection {
    /// 单通道信箱容量，超出时淘汰最旧消息
    #[serde(default = "default_mailbox_capacity")]
    pub mailbox_capacity: usize,
}

impl Default for ChannelsSection {
    fn default() -> Self {
        Self {
            mailbox_capacity: default_mailbox_capacity(),
        }
    }
}

fn default_mailbox_capacity() -> usize {
    1024
}

/// [monitor] 段：资源监控采样与阈值
#[derive(Debug, Clone, Deserialize)]
pub struct MonitorSection {
    /// 采样间隔（秒）
    #[serde(default = "default_sampling_interval_secs")]
    pub sampling_interval_secs: u64,
    /// 指标名 -> 告警阈值
    #[serde(default = "default_thresholds")]
    pub thresholds: HashMap<String, f64>,
    /// stop() 等待采样任务退出的上限（秒），超时则记日志继续
    #[serde(default = "default_stop_timeout_secs")]
    pub stop_timeout_secs: u64,
    /// 指标报告环形缓冲容量
    #[serde(default = "default_report_capacity")]
    pub report_capacity: usize,
}

impl Default for MonitorSection {
    fn default() -> Self {
        Self {
            sampling_interval_secs: default_sampling_interval_secs(),
            thresholds: default_thresholds(),
            stop_timeout_secs: default_stop_timeout_secs(),
            report_capacity: default_report_capacity(),
        }
    }
}

fn default_sampling_interval_secs() -> u64 {
    30
}

fn default_thresholds() -> HashMap<String, f64> {
    let mut t = HashMap::new();
    t.insert("memory_usage".to_string(), 80.0);
    t.insert("cpu_usage".to_string(), 90.0);
    t
}

fn default_stop_timeout_secs() -> u64 {
    5
}

fn default_report_capacity() -> usize {
    50
}

/// [errors] 段：错误管理与降级
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorsSection {
    /// 累计严重错误达到该值即进入降级模式
    #[serde(default = "default_critical_threshold")]
    pub critical_threshold: usize,
    /// 近期错误环形缓冲容量
    #[serde(default = "default_recent_errors_capacity")]
    pub recent_capacity: usize,
}

impl Default for ErrorsSection {
    fn default() -> Self {
        Self {
            critical_threshold: default_critical_threshold(),
            recent_capacity: default_recent_errors_capacity(),
        }
    }
}

fn default_critical_threshold() -> usize {
    5
}

fn default_recent_errors_capacity() -> usize {
    100
}

/// [feedback] 段：自适应反馈
#[derive(Debug, Clone, Deserialize)]
pub struct FeedbackSection {
    /// 每记录 batch_size 条经验触发一次性能分重算
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// 重算时统计最近 window 条经验
    #[serde(default = "default_window")]
    pub window: usize,
    /// 经验环形缓冲容量
    #[serde(default = "default_experience_capacity")]
    pub experience_capacity: usize,
    /// 策略视为「过期需重跑」的时长（小时）
    #[serde(default = "default_strategy_stale_hours")]
    pub strategy_stale_hours: u64,
    /// 策略执行轮的最小间隔（秒）
    #[serde(default = "default_pass_interval_secs")]
    pub pass_interval_secs: u64,
}

impl Default for FeedbackSection {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            window: default_window(),
            experience_capacity: default_experience_capacity(),
            strategy_stale_hours: default_strategy_stale_hours(),
            pass_interval_secs: default_pass_interval_secs(),
        }
    }
}

fn default_batch_size() -> usize {
    10
}

fn default_window() -> usize {
    100
}

fn default_experience_capacity() -> usize {
    10_000
}

fn default_strategy_stale_hours() -> u64 {
    1
}

fn default_pass_interval_secs() -> u64 {
    300
}

/// 加载配置：默认路径（config/default.toml 及上级）+ 可选显式路径 + HIVE__ 环境变量覆盖
pub fn load_config(config_path: Option<PathBuf>) -> Result<HiveConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("HIVE")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
