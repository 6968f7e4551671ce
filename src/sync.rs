//! 同步管理器：组件连接图与周期性活性同步
//!
//! 设计上的简化：同步传播的是「活性」而不是「负载」。一次 sync 只刷新连接的
//! last_activity 与 metrics["last_sync"]，从不在组件状态快照之间复制数据，
//! 因此更新是幂等的时间戳推进，不需要环路检测。连接只能显式删除，不会因
//! 同步失败或闲置而自动消失。

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::registry::StateMap;

/// 连接状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Active,
    Dormant,
}

/// 两个组件之间的带权连接
#[derive(Debug, Clone, Serialize)]
pub struct Connection {
    pub a: String,
    pub b: String,
    pub kind: String,
    /// 连接强度，始终钳制在 [0, 1]
    pub strength: f64,
    pub state: ConnectionState,
    pub last_activity: DateTime<Utc>,
    pub metrics: HashMap<String, f64>,
}

struct SyncedComponent {
    state: StateMap,
    version: u64,
    updated_at: DateTime<Utc>,
}

struct SyncState {
    components: HashMap<String, SyncedComponent>,
    connections: HashMap<(String, String), Connection>,
    last_sync: HashMap<String, DateTime<Utc>>,
}

/// 同步状态总览
#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub registered: Vec<String>,
    pub active_connections: usize,
    pub last_sync: HashMap<String, DateTime<Utc>>,
}

/// 同步管理器。连接图整体由一把锁保护，connect 与并发 sync_all 互不相扰。
pub struct SyncManager {
    inner: Mutex<SyncState>,
}

impl SyncManager {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(SyncState {
                components: HashMap::new(),
                connections: HashMap::new(),
                last_sync: HashMap::new(),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, SyncState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 注册组件参与同步
    pub fn register_component(&self, name: &str, initial_state: StateMap) {
        self.state().components.insert(
            name.to_string(),
            SyncedComponent {
                state: initial_state,
                version: 1,
                updated_at: Utc::now(),
            },
        );
        tracing::debug!("Sync component registered: {}", name);
    }

    /// 移除组件。已建立的连接保持不动，需调用方显式 disconnect。
    pub fn unregister_component(&self, name: &str) {
        let mut state = self.state();
        state.components.remove(name);
        state.last_sync.remove(name);
    }

    /// 合并组件状态并推进版本号。未注册的名字为 no-op。
    pub fn update_state(&self, name: &str, new_state: StateMap) {
        let mut state = self.state();
        if let Some(component) = state.components.get_mut(name) {
            for (key, value) in new_state {
                component.state.insert(key, value);
            }
            component.version += 1;
            component.updated_at = Utc::now();
        }
    }

    /// 建立 a -> b 连接；strength 钳制到 [0, 1]，同键重复 connect 覆盖旧连接
    pub fn connect(&self, a: &str, b: &str, kind: &str, strength: f64) {
        let connection = Connection {
            a: a.to_string(),
            b: b.to_string(),
            kind: kind.to_string(),
            strength: strength.clamp(0.0, 1.0),
            state: ConnectionState::Active,
            last_activity: Utc::now(),
            metrics: HashMap::new(),
        };
        self.state()
            .connections
            .insert((a.to_string(), b.to_string()), connection);
        tracing::debug!("Connection established: {} -> {}", a, b);
    }

    /// 显式移除连接，返回是否存在
    pub fn disconnect(&self, a: &str, b: &str) -> bool {
        self.state()
            .connections
            .remove(&(a.to_string(), b.to_string()))
            .is_some()
    }

    /// 同步指定子集（None 表示全部已注册组件）：刷新所有触及子集成员的连接的
    /// last_activity 与 metrics["last_sync"]，并记录每个组件的最近同步时间。
    /// 只做账目更新，不阻塞在任何订阅方逻辑上。
    pub fn sync_all(&self, subset: Option<&[String]>) -> usize {
        let mut state = self.state();
        let scope: HashSet<String> = match subset {
            Some(names) => names.iter().cloned().collect(),
            None => state.components.keys().cloned().collect(),
        };

        let now = Utc::now();
        let mut touched = 0;
        for connection in state.connections.values_mut() {
            if scope.contains(&connection.a) || scope.contains(&connection.b) {
                connection.last_activity = now;
                connection
                    .metrics
                    .insert("last_sync".to_string(), now.timestamp_millis() as f64 / 1000.0);
                touched += 1;
            }
        }

        for name in scope {
            if state.components.contains_key(&name) {
                state.last_sync.insert(name, now);
            }
        }

        tracing::debug!("Sync pass touched {} connections", touched);
        touched
    }

    /// 从 name 出发向外一跳：只刷新直接触及 name 的连接
    pub fn sync_component(&self, name: &str) -> usize {
        self.sync_all(Some(&[name.to_string()]))
    }

    pub fn connection(&self, a: &str, b: &str) -> Option<Connection> {
        self.state()
            .connections
            .get(&(a.to_string(), b.to_string()))
            .cloned()
    }

    pub fn connections(&self) -> Vec<Connection> {
        self.state().connections.values().cloned().collect()
    }

    /// 处于 Active 状态的连接数
    pub fn active_connection_count(&self) -> usize {
        self.state()
            .connections
            .values()
            .filter(|c| c.state == ConnectionState::Active)
            .count()
    }

    pub fn component_state(&self, name: &str) -> Option<StateMap> {
        self.state().components.get(name).map(|c| c.state.clone())
    }

    pub fn component_version(&self, name: &str) -> Option<u64> {
        self.state().components.get(name).map(|c| c.version)
    }

    pub fn report(&self) -> SyncReport {
        let state = self.state();
        let mut registered: Vec<String> = state.components.keys().cloned().collect();
        registered.sort();
        SyncReport {
            registered,
            active_connections: state
                .connections
                .values()
                .filter(|c| c.state == ConnectionState::Active)
                .count(),
            last_sync: state.last_sync.clone(),
        }
    }
}

impl Default for SyncManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn state_of(pairs: &[(&str, serde_json::Value)]) -> StateMap {
        let mut map = StateMap::new();
        for (k, v) in pairs {
            map.insert(k.to_string(), v.clone());
        }
        map
    }

    #[test]
    fn test_strength_clamped_to_unit_interval() {
        let sync = SyncManager::new();
        sync.connect("x", "y", "standard", 1.5);
        assert_eq!(sync.connection("x", "y").unwrap().strength, 1.0);

        sync.connect("x", "z", "standard", -0.5);
        assert_eq!(sync.connection("x", "z").unwrap().strength, 0.0);
    }

    #[test]
    fn test_sync_all_bumps_activity_without_copying_state() {
        let sync = SyncManager::new();
        sync.register_component("x", state_of(&[("secret", json!(41))]));
        sync.register_component("y", StateMap::new());
        sync.connect("x", "y", "standard", 0.5);

        let before = sync.connection("x", "y").unwrap().last_activity;
        std::thread::sleep(std::time::Duration::from_millis(5));

        let touched = sync.sync_all(None);
        assert_eq!(touched, 1);

        let connection = sync.connection("x", "y").unwrap();
        assert!(connection.last_activity > before);
        assert!(connection.metrics.contains_key("last_sync"));

        // 同步只传播活性，y 的快照保持为空
        assert!(sync.component_state("y").unwrap().is_empty());
        assert_eq!(sync.component_state("x").unwrap()["secret"], json!(41));
    }

    #[test]
    fn test_sync_subset_only_touches_members() {
        let sync = SyncManager::new();
        for name in ["a", "b", "c", "d"] {
            sync.register_component(name, StateMap::new());
        }
        sync.connect("a", "b", "standard", 1.0);
        sync.connect("c", "d", "standard", 1.0);

        let touched = sync.sync_all(Some(&["a".to_string()]));
        assert_eq!(touched, 1);

        let report = sync.report();
        assert!(report.last_sync.contains_key("a"));
        assert!(!report.last_sync.contains_key("c"));
    }

    #[test]
    fn test_sync_component_is_one_hop() {
        let sync = SyncManager::new();
        for name in ["x", "y", "z"] {
            sync.register_component(name, StateMap::new());
        }
        sync.connect("x", "y", "standard", 1.0);
        sync.connect("y", "z", "standard", 1.0);

        // 与 x 相邻的只有 (x, y)；(y, z) 不在一跳范围内
        let touched = sync.sync_component("x");
        assert_eq!(touched, 1);
        assert!(sync.connection("x", "y").unwrap().metrics.contains_key("last_sync"));
        assert!(sync.connection("y", "z").unwrap().metrics.is_empty());
    }

    #[test]
    fn test_update_state_bumps_version() {
        let sync = SyncManager::new();
        sync.register_component("x", state_of(&[("a", json!(1))]));
        assert_eq!(sync.component_version("x"), Some(1));

        sync.update_state("x", state_of(&[("b", json!(2))]));
        assert_eq!(sync.component_version("x"), Some(2));
        assert_eq!(sync.component_state("x").unwrap()["a"], json!(1));
        assert_eq!(sync.component_state("x").unwrap()["b"], json!(2));
    }

    #[test]
    fn test_connections_require_explicit_removal() {
        let sync = SyncManager::new();
        sync.connect("x", "y", "standard", 1.0);

        // 任意多次同步都不会清理连接
        for _ in 0..3 {
            sync.sync_all(None);
        }
        assert_eq!(sync.active_connection_count(), 1);

        assert!(sync.disconnect("x", "y"));
        assert!(!sync.disconnect("x", "y"));
        assert_eq!(sync.active_connection_count(), 0);
    }
}
