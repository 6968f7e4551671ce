//! 事件总线：类型化发布/订阅
//!
//! 优先级 >=3 的事件在 `publish` 返回前按订阅顺序同步派发给当前全部订阅者；
//! 低优先级事件进入延迟队列，由编排器每个 tick 调用一次 `drain_pending` 统一处理。
//! 处理器返回 Err 时被就地捕获并上报 ErrorManager（非严重），不会中断对其余
//! 订阅者的派发。

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::error::{ErrorManager, HiveError};

/// 事件负载的键值映射
pub type PayloadMap = serde_json::Map<String, Value>;

/// 系统事件类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// 组件注册进入编排层
    ComponentActivated,
    /// 组件注销
    ComponentDeactivated,
    ConnectionEstablished,
    ConnectionBroken,
    CriticalError,
    OptimizationApplied,
    Synchronization,
    /// 组件间点对点消息相关
    ComponentMessage,
    /// 资源监控阈值突破（监控器以优先级 3 发布）
    ThresholdExceeded,
}

/// 系统事件。发布后不可变，存入近期历史环形缓冲。
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub event_type: EventType,
    pub source: String,
    pub destination: Option<String>,
    pub payload: PayloadMap,
    pub timestamp: DateTime<Utc>,
    /// 1=普通，2=重要，3=关键（发布时钳制到 1..=3）
    pub priority: u8,
}

impl Event {
    pub fn new(event_type: EventType, source: &str) -> Self {
        Self {
            event_type,
            source: source.to_string(),
            destination: None,
            payload: PayloadMap::new(),
            timestamp: Utc::now(),
            priority: 1,
        }
    }

    pub fn with_destination(mut self, destination: &str) -> Self {
        self.destination = Some(destination.to_string());
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    /// 负载要求是对象；其它 JSON 值在发布边界被包进 "value" 键下
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = match payload {
            Value::Object(map) => map,
            other => {
                let mut map = PayloadMap::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        self
    }
}

/// 事件处理器：返回 Err 的处理器由总线上报 ErrorManager，派发继续
pub type EventHandler = Arc<dyn Fn(&Event) -> Result<(), HiveError> + Send + Sync>;

/// 订阅凭据，退订时使用
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(Uuid);

struct Subscription {
    id: SubscriptionId,
    handler: EventHandler,
}

struct BusState {
    subscribers: HashMap<EventType, Vec<Subscription>>,
    recent: VecDeque<Event>,
    pending: VecDeque<Event>,
}

/// 事件总线
pub struct EventBus {
    errors: Arc<ErrorManager>,
    recent_capacity: usize,
    /// drain 重入保护：处理器内再触发 drain 时直接返回
    draining: AtomicBool,
    inner: Mutex<BusState>,
}

impl EventBus {
    pub fn new(errors: Arc<ErrorManager>, recent_capacity: usize) -> Self {
        Self {
            errors,
            recent_capacity: recent_capacity.max(1),
            draining: AtomicBool::new(false),
            inner: Mutex::new(BusState {
                subscribers: HashMap::new(),
                recent: VecDeque::new(),
                pending: VecDeque::new(),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, BusState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 订阅一个事件类型，返回退订凭据
    pub fn subscribe(&self, event_type: EventType, handler: EventHandler) -> SubscriptionId {
        let id = SubscriptionId(Uuid::new_v4());
        self.state()
            .subscribers
            .entry(event_type)
            .or_default()
            .push(Subscription { id, handler });
        tracing::debug!("Subscription added for {:?}", event_type);
        id
    }

    /// 退订。未知凭据（或已退订）为 no-op。
    pub fn unsubscribe(&self, id: SubscriptionId) {
        let mut state = self.state();
        for subs in state.subscribers.values_mut() {
            subs.retain(|s| s.id != id);
        }
    }

    /// 发布事件。优先级 >=3 在返回前同步派发；其余入延迟队列等待 drain_pending。
    pub fn publish(&self, mut event: Event) {
        event.priority = event.priority.clamp(1, 3);

        let immediate = {
            let mut state = self.state();
            if state.recent.len() >= self.recent_capacity {
                state.recent.pop_front();
            }
            state.recent.push_back(event.clone());

            if event.priority >= 3 {
                Some(Self::handlers_for(&state, event.event_type))
            } else {
                state.pending.push_back(event.clone());
                None
            }
        };

        tracing::debug!(
            "Event published: {:?} from {} (priority {})",
            event.event_type,
            event.source,
            event.priority
        );

        if let Some(handlers) = immediate {
            self.dispatch(&event, &handlers);
        }
    }

    /// 处理延迟队列中的全部事件（FIFO），返回派发条数。每个编排 tick 调用一次。
    pub fn drain_pending(&self) -> usize {
        if self.draining.swap(true, Ordering::SeqCst) {
            return 0;
        }

        let mut drained = 0;
        loop {
            let next = {
                let mut state = self.state();
                match state.pending.pop_front() {
                    Some(event) => {
                        let handlers = Self::handlers_for(&state, event.event_type);
                        Some((event, handlers))
                    }
                    None => None,
                }
            };

            let Some((event, handlers)) = next else {
                break;
            };
            self.dispatch(&event, &handlers);
            drained += 1;
        }

        self.draining.store(false, Ordering::SeqCst);
        drained
    }

    /// 近期事件历史（可按类型过滤），最旧在前
    pub fn recent_events(&self, filter: Option<EventType>) -> Vec<Event> {
        let state = self.state();
        state
            .recent
            .iter()
            .filter(|e| filter.map(|t| e.event_type == t).unwrap_or(true))
            .cloned()
            .collect()
    }

    pub fn pending_len(&self) -> usize {
        self.state().pending.len()
    }

    fn handlers_for(state: &BusState, event_type: EventType) -> Vec<EventHandler> {
        state
            .subscribers
            .get(&event_type)
            .map(|subs| subs.iter().map(|s| s.handler.clone()).collect())
            .unwrap_or_default()
    }

    /// 按订阅顺序派发；锁已释放，处理器可以安全地再发布/再订阅
    fn dispatch(&self, event: &Event, handlers: &[EventHandler]) {
        for handler in handlers {
            if let Err(e) = handler(event) {
                self.errors.report(
                    "handler",
                    &e.to_string(),
                    &format!("event dispatch {:?}", event.event_type),
                    false,
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn bus() -> EventBus {
        EventBus::new(Arc::new(ErrorManager::new(5, 100)), 1000)
    }

    fn recording_handler(log: Arc<Mutex<Vec<String>>>, tag: &str) -> EventHandler {
        let tag = tag.to_string();
        Arc::new(move |_event| {
            log.lock().unwrap().push(tag.clone());
            Ok(())
        })
    }

    #[test]
    fn test_priority_3_dispatches_synchronously_in_order() {
        let bus = bus();
        let log = Arc::new(Mutex::new(Vec::new()));

        bus.subscribe(EventType::ThresholdExceeded, recording_handler(log.clone(), "first"));
        bus.subscribe(EventType::ThresholdExceeded, recording_handler(log.clone(), "second"));

        bus.publish(Event::new(EventType::ThresholdExceeded, "monitor").with_priority(3));

        // publish 返回时两个处理器都已按订阅顺序执行完
        assert_eq!(*log.lock().unwrap(), vec!["first", "second"]);
        assert_eq!(bus.pending_len(), 0);
    }

    #[test]
    fn test_fanout_count_equals_subscribers_times_events() {
        let bus = bus();
        let log = Arc::new(Mutex::new(Vec::new()));

        bus.subscribe(EventType::CriticalError, recording_handler(log.clone(), "a"));
        bus.subscribe(EventType::CriticalError, recording_handler(log.clone(), "b"));

        for _ in 0..3 {
            bus.publish(Event::new(EventType::CriticalError, "x").with_priority(3));
        }

        assert_eq!(log.lock().unwrap().len(), 6);
    }

    #[test]
    fn test_low_priority_deferred_until_drain() {
        let bus = bus();
        let log = Arc::new(Mutex::new(Vec::new()));

        bus.subscribe(EventType::Synchronization, recording_handler(log.clone(), "h"));

        bus.publish(Event::new(EventType::Synchronization, "x"));
        bus.publish(Event::new(EventType::Synchronization, "y").with_priority(2));
        assert!(log.lock().unwrap().is_empty());
        assert_eq!(bus.pending_len(), 2);

        let drained = bus.drain_pending();
        assert_eq!(drained, 2);
        assert_eq!(log.lock().unwrap().len(), 2);
        assert_eq!(bus.pending_len(), 0);
    }

    #[test]
    fn test_handler_error_does_not_interrupt_dispatch() {
        let errors = Arc::new(ErrorManager::new(5, 100));
        let bus = EventBus::new(errors.clone(), 1000);
        let log = Arc::new(Mutex::new(Vec::new()));

        bus.subscribe(
            EventType::ComponentActivated,
            Arc::new(|_e| Err(HiveError::Handler("broken".into()))),
        );
        bus.subscribe(EventType::ComponentActivated, recording_handler(log.clone(), "ok"));

        bus.publish(Event::new(EventType::ComponentActivated, "x").with_priority(3));

        assert_eq!(*log.lock().unwrap(), vec!["ok"]);
        let report = errors.report_summary();
        assert_eq!(report.recent_count, 1);
        assert!(!report.degraded);
    }

    #[test]
    fn test_unsubscribe_is_noop_when_unknown() {
        let bus = bus();
        let log = Arc::new(Mutex::new(Vec::new()));

        let id = bus.subscribe(EventType::Synchronization, recording_handler(log.clone(), "h"));
        bus.unsubscribe(id);
        bus.unsubscribe(id); // 再次退订为 no-op

        bus.publish(Event::new(EventType::Synchronization, "x").with_priority(3));
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn test_recent_ring_bounded_and_filterable() {
        let errors = Arc::new(ErrorManager::new(5, 100));
        let bus = EventBus::new(errors, 5);

        for i in 0..8 {
            let event_type = if i % 2 == 0 {
                EventType::Synchronization
            } else {
                EventType::ComponentMessage
            };
            bus.publish(Event::new(event_type, "x"));
        }

        assert_eq!(bus.recent_events(None).len(), 5);
        for event in bus.recent_events(Some(EventType::ComponentMessage)) {
            assert_eq!(event.event_type, EventType::ComponentMessage);
        }
    }

    #[test]
    fn test_non_object_payload_wrapped() {
        let event = Event::new(EventType::ComponentMessage, "x").with_payload(json!(42));
        assert_eq!(event.payload["value"], json!(42));

        let event = Event::new(EventType::ComponentMessage, "x")
            .with_payload(json!({"k": "v"}));
        assert_eq!(event.payload["k"], json!("v"));
    }

    #[test]
    fn test_priority_clamped_on_publish() {
        let bus = bus();
        bus.publish(Event::new(EventType::Synchronization, "x").with_priority(9));
        let events = bus.recent_events(None);
        assert_eq!(events[0].priority, 3);
    }
}
