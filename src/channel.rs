//! 点对点消息通道：(发送方, 接收方) 命名信箱
//!
//! 通道在首次 send 时惰性创建；每个通道一个有界 FIFO 信箱，满时淘汰最旧消息。
//! 投递语义是 at-least-once-if-drained：只有 `drain` 被调用且通道上有订阅者时
//! 才会投递；drain 时没有订阅者的通道，其消息被丢弃（计入统计，不视为错误）。

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::error::{ErrorManager, HiveError};

/// 组件间消息。body 对通道层不透明。
#[derive(Debug, Clone, Serialize)]
pub struct Message {
    pub sender: String,
    pub recipient: String,
    pub kind: String,
    pub body: Value,
    pub timestamp: DateTime<Utc>,
    pub priority: u8,
    pub response_required: bool,
}

impl Message {
    pub fn new(sender: &str, recipient: &str, kind: &str, body: Value) -> Self {
        Self {
            sender: sender.to_string(),
            recipient: recipient.to_string(),
            kind: kind.to_string(),
            body,
            timestamp: Utc::now(),
            priority: 1,
            response_required: false,
        }
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority.clamp(1, 3);
        self
    }

    pub fn with_response_required(mut self, required: bool) -> Self {
        self.response_required = required;
        self
    }
}

/// 通道处理器：返回 Err 时上报 ErrorManager，派发继续
pub type MessageHandler = Arc<dyn Fn(&Message) -> Result<(), HiveError> + Send + Sync>;

/// 一次 drain 的结果统计
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct DrainStats {
    /// 投递给至少一个处理器的消息数
    pub delivered: usize,
    /// 因通道无订阅者而丢弃的消息数
    pub dropped: usize,
}

type ChannelKey = (String, String);

struct ChannelState {
    mailboxes: HashMap<ChannelKey, VecDeque<Message>>,
    handlers: HashMap<ChannelKey, Vec<MessageHandler>>,
}

/// 通道管理器
pub struct ChannelManager {
    errors: Arc<ErrorManager>,
    mailbox_capacity: usize,
    inner: Mutex<ChannelState>,
}

impl ChannelManager {
    pub fn new(errors: Arc<ErrorManager>, mailbox_capacity: usize) -> Self {
        Self {
            errors,
            mailbox_capacity: mailbox_capacity.max(1),
            inner: Mutex::new(ChannelState {
                mailboxes: HashMap::new(),
                handlers: HashMap::new(),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, ChannelState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 入队一条消息。通道不存在则创建；信箱满时淘汰最旧一条并告警。
    pub fn send(&self, message: Message) {
        let key = (message.sender.clone(), message.recipient.clone());
        let mut state = self.state();
        let mailbox = state.mailboxes.entry(key).or_default();

        if mailbox.len() >= self.mailbox_capacity {
            mailbox.pop_front();
            tracing::warn!(
                "Mailbox {} -> {} full, evicting oldest message",
                message.sender,
                message.recipient
            );
        }

        tracing::debug!(
            "Message queued: {} from {} to {}",
            message.kind,
            message.sender,
            message.recipient
        );
        mailbox.push_back(message);
    }

    /// 订阅某个通道。同一通道可挂多个处理器，按订阅顺序调用。
    pub fn subscribe_channel(&self, sender: &str, recipient: &str, handler: MessageHandler) {
        self.state()
            .handlers
            .entry((sender.to_string(), recipient.to_string()))
            .or_default()
            .push(handler);
    }

    /// 清空全部信箱并按通道内 FIFO 顺序派发。通道之间没有顺序保证。
    /// drain 期间入队的消息留到下一次 drain。
    pub fn drain(&self) -> DrainStats {
        let batches: Vec<(Vec<Message>, Vec<MessageHandler>)> = {
            let mut state = self.state();
            let keys: Vec<ChannelKey> = state.mailboxes.keys().cloned().collect();
            keys.into_iter()
                .filter_map(|key| {
                    let messages: Vec<Message> = state
                        .mailboxes
                        .get_mut(&key)
                        .map(|mailbox| mailbox.drain(..).collect())
                        .unwrap_or_default();
                    if messages.is_empty() {
                        return None;
                    }
                    let handlers = state.handlers.get(&key).cloned().unwrap_or_default();
                    Some((messages, handlers))
                })
                .collect()
        };

        let mut stats = DrainStats::default();
        for (messages, handlers) in batches {
            for message in messages {
                if handlers.is_empty() {
                    stats.dropped += 1;
                    tracing::debug!(
                        "Dropping message {} from {} to {}: no subscriber",
                        message.kind,
                        message.sender,
                        message.recipient
                    );
                    continue;
                }
                for handler in &handlers {
                    if let Err(e) = handler(&message) {
                        self.errors.report(
                            "handler",
                            &e.to_string(),
                            &format!("message dispatch {} -> {}", message.sender, message.recipient),
                            false,
                        );
                    }
                }
                stats.delivered += 1;
            }
        }
        stats
    }

    /// 某通道当前排队未派发的消息（克隆件）
    pub fn queued_messages(&self, sender: &str, recipient: &str) -> Vec<Message> {
        self.state()
            .mailboxes
            .get(&(sender.to_string(), recipient.to_string()))
            .map(|mailbox| mailbox.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// 已创建的通道列表
    pub fn channels(&self) -> Vec<(String, String)> {
        let mut keys: Vec<ChannelKey> = self.state().mailboxes.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// 全部通道排队中的消息总数
    pub fn pending_total(&self) -> usize {
        self.state().mailboxes.values().map(|m| m.len()).sum()
    }
}
