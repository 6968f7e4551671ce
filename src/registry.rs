//! 组件注册表：活跃组件与其最近一次状态快照
//!
//! 注册表不拥有组件：`register` 返回的 `ComponentHandle` 由组件持有，
//! 句柄析构时自动注销（RAII），注册表侧只保留快照数据，绝不反向保活。
//! 快照只由拥有方通过 `update` 修改，注册表本身只读。

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

/// 组件状态快照的键值映射
pub type StateMap = serde_json::Map<String, Value>;

/// 对外返回的组件快照（克隆件，调用方可自由持有）
#[derive(Debug, Clone, Serialize)]
pub struct ComponentSnapshot {
    pub name: String,
    pub state: StateMap,
    pub registered_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: u64,
}

struct ComponentRecord {
    state: StateMap,
    registered_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    version: u64,
    /// 注册代次：同名重复注册会换代，旧句柄析构时不得误删新记录
    generation: u64,
}

struct RegistryInner {
    components: HashMap<String, ComponentRecord>,
    next_generation: u64,
}

/// 组件注册表
pub struct ComponentRegistry {
    inner: Arc<Mutex<RegistryInner>>,
}

impl ComponentRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(RegistryInner {
                components: HashMap::new(),
                next_generation: 0,
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 注册组件。同名重复注册原地覆盖（不报错），返回新句柄。
    pub fn register(&self, name: &str, initial_state: StateMap) -> ComponentHandle {
        let mut inner = self.state();
        let generation = inner.next_generation;
        inner.next_generation += 1;

        let now = Utc::now();
        inner.components.insert(
            name.to_string(),
            ComponentRecord {
                state: initial_state,
                registered_at: now,
                updated_at: now,
                version: 1,
                generation,
            },
        );
        tracing::debug!("Component registered: {}", name);

        ComponentHandle {
            name: name.to_string(),
            generation,
            registry: Arc::downgrade(&self.inner),
        }
    }

    /// 合并部分状态（逐键覆盖），并推进时间戳与版本号。未注册的名字为 no-op。
    pub fn update(&self, name: &str, partial_state: StateMap) {
        let mut inner = self.state();
        if let Some(record) = inner.components.get_mut(name) {
            for (key, value) in partial_state {
                record.state.insert(key, value);
            }
            record.updated_at = Utc::now();
            record.version += 1;
            tracing::debug!("Component state updated: {}", name);
        }
    }

    /// 注销组件。未知名字为 no-op，重复调用安全。
    pub fn unregister(&self, name: &str) {
        if self.state().components.remove(name).is_some() {
            tracing::debug!("Component unregistered: {}", name);
        }
    }

    pub fn get(&self, name: &str) -> Option<ComponentSnapshot> {
        let inner = self.state();
        inner.components.get(name).map(|record| ComponentSnapshot {
            name: name.to_string(),
            state: record.state.clone(),
            registered_at: record.registered_at,
            updated_at: record.updated_at,
            version: record.version,
        })
    }

    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state().components.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.state().components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn unregister_generation(inner: &Weak<Mutex<RegistryInner>>, name: &str, generation: u64) {
        if let Some(registry) = inner.upgrade() {
            let mut guard = registry.lock().unwrap_or_else(|e| e.into_inner());
            let matches = guard
                .components
                .get(name)
                .map(|r| r.generation == generation)
                .unwrap_or(false);
            if matches {
                guard.components.remove(name);
                tracing::debug!("Component unregistered on handle drop: {}", name);
            }
        }
    }
}

impl Default for ComponentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// 组件句柄：组件侧持有，析构时从注册表移除自己的记录。
/// 只持有注册表的弱引用，组件存活不会延长注册表生命周期，反之亦然。
pub struct ComponentHandle {
    name: String,
    generation: u64,
    registry: Weak<Mutex<RegistryInner>>,
}

impl ComponentHandle {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for ComponentHandle {
    fn drop(&mut self) {
        ComponentRegistry::unregister_generation(&self.registry, &self.name, self.generation);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn state_of(pairs: &[(&str, Value)]) -> StateMap {
        let mut map = StateMap::new();
        for (k, v) in pairs {
            map.insert(k.to_string(), v.clone());
        }
        map
    }

    #[test]
    fn test_register_and_get() {
        let registry = ComponentRegistry::new();
        let _handle = registry.register("alpha", state_of(&[("status", json!("active"))]));

        let snapshot = registry.get("alpha").unwrap();
        assert_eq!(snapshot.state["status"], json!("active"));
        assert_eq!(snapshot.version, 1);
        assert_eq!(registry.list(), vec!["alpha".to_string()]);
    }

    #[test]
    fn test_reregister_overwrites_in_place() {
        let registry = ComponentRegistry::new();
        let _first = registry.register("alpha", state_of(&[("v", json!(1))]));
        let _second = registry.register("alpha", state_of(&[("v", json!(2))]));

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("alpha").unwrap().state["v"], json!(2));
    }

    #[test]
    fn test_update_merges_and_bumps_version() {
        let registry = ComponentRegistry::new();
        let _handle = registry.register("alpha", state_of(&[("a", json!(1)), ("b", json!(2))]));

        registry.update("alpha", state_of(&[("b", json!(20)), ("c", json!(3))]));

        let snapshot = registry.get("alpha").unwrap();
        assert_eq!(snapshot.state["a"], json!(1));
        assert_eq!(snapshot.state["b"], json!(20));
        assert_eq!(snapshot.state["c"], json!(3));
        assert_eq!(snapshot.version, 2);
    }

    #[test]
    fn test_update_unknown_is_noop() {
        let registry = ComponentRegistry::new();
        registry.update("ghost", state_of(&[("a", json!(1))]));
        assert!(registry.get("ghost").is_none());
    }

    #[test]
    fn test_unregister_is_idempotent() {
        let registry = ComponentRegistry::new();
        let handle = registry.register("alpha", StateMap::new());
        std::mem::forget(handle);

        registry.unregister("alpha");
        registry.unregister("alpha");
        assert!(registry.is_empty());
    }

    #[test]
    fn test_handle_drop_unregisters() {
        let registry = ComponentRegistry::new();
        {
            let _handle = registry.register("alpha", StateMap::new());
            assert_eq!(registry.len(), 1);
        }
        assert!(registry.is_empty());
    }

    #[test]
    fn test_stale_handle_does_not_clobber_new_registration() {
        let registry = ComponentRegistry::new();
        let first = registry.register("alpha", state_of(&[("v", json!(1))]));
        let _second = registry.register("alpha", state_of(&[("v", json!(2))]));

        drop(first);

        // 旧句柄析构不影响新代次的记录
        assert_eq!(registry.get("alpha").unwrap().state["v"], json!(2));
    }
}
