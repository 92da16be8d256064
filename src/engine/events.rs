//! 引擎生命周期事件：用于外部订阅（日志面板、SSE 推送等）
//!
//! 发送是 fire-and-forget：没有订阅者或订阅者落后都不影响主循环。

use serde::Serialize;
use tokio::sync::broadcast;

use crate::engine::Interrupt;

/// 单个生命周期事件（可序列化为 JSON 供前端展示）
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    /// State 有新消息追加
    StateUpdated { agent_id: String, message_count: usize },
    /// 执行暂停，等待人工决策
    InterruptRaised {
        agent_id: String,
        interrupt: Interrupt,
    },
    SubAgentSpawned {
        agent_id: String,
        sub_agent_id: String,
        subagent_type: String,
    },
    /// outcome: completed / interrupted / failed
    SubAgentFinished {
        agent_id: String,
        sub_agent_id: String,
        outcome: String,
    },
    ToolExecuted {
        agent_id: String,
        tool: String,
        call_id: String,
        is_error: bool,
    },
    /// 流式回复的一小段
    TextDelta { agent_id: String, text: String },
}

/// 带时间戳的事件
#[derive(Debug, Clone, Serialize)]
pub struct EventEnvelope {
    /// Unix 毫秒
    pub at_ms: i64,
    #[serde(flatten)]
    pub event: EngineEvent,
}

/// 事件总线
#[derive(Clone, Debug)]
pub struct EventBus {
    tx: Option<broadcast::Sender<EventEnvelope>>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx: Some(tx) }
    }

    /// 不发送任何事件
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn subscribe(&self) -> Option<broadcast::Receiver<EventEnvelope>> {
        self.tx.as_ref().map(|tx| tx.subscribe())
    }

    pub fn emit(&self, event: EngineEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(EventEnvelope {
                at_ms: chrono::Utc::now().timestamp_millis(),
                event,
            });
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe().unwrap();
        bus.emit(EngineEvent::TextDelta {
            agent_id: "a".into(),
            text: "hi".into(),
        });
        let envelope = rx.recv().await.unwrap();
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["type"], "text_delta");
        assert_eq!(json["text"], "hi");
        assert!(json["at_ms"].as_i64().unwrap() > 0);
    }

    #[test]
    fn test_disabled_bus_is_silent() {
        let bus = EventBus::disabled();
        assert!(bus.subscribe().is_none());
        bus.emit(EngineEvent::StateUpdated {
            agent_id: "a".into(),
            message_count: 1,
        });
    }
}
