//! 运行中 agent 的登记表（按 agent_id 查找句柄）

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::agent::AgentHandle;

#[derive(Clone, Default)]
pub struct AgentRegistry {
    agents: Arc<RwLock<HashMap<String, AgentHandle>>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 同 id 的旧句柄被替换并返回
    pub async fn insert(&self, handle: AgentHandle) -> Option<AgentHandle> {
        self.agents
            .write()
            .await
            .insert(handle.agent_id().to_string(), handle)
    }

    pub async fn get(&self, agent_id: &str) -> Option<AgentHandle> {
        self.agents.read().await.get(agent_id).cloned()
    }

    pub async fn remove(&self, agent_id: &str) -> Option<AgentHandle> {
        self.agents.write().await.remove(agent_id)
    }

    /// 仍在运行的 agent id（已停止的顺带清理）
    pub async fn running(&self) -> Vec<String> {
        let mut agents = self.agents.write().await;
        agents.retain(|_, handle| handle.is_running());
        let mut ids: Vec<String> = agents.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// 停止全部 agent
    pub async fn stop_all(&self) {
        let handles: Vec<AgentHandle> = self.agents.write().await.drain().map(|(_, h)| h).collect();
        for handle in handles {
            handle.stop().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{AgentConfig, AgentSupervisor};
    use crate::core::State;
    use crate::llm::ScriptedModel;

    async fn start(id: &str) -> AgentHandle {
        let config = AgentConfig::new(id, Arc::new(ScriptedModel::replies(vec![])));
        AgentSupervisor::start(config, State::new()).await.unwrap()
    }

    #[tokio::test]
    async fn test_running_drops_stopped_agents() {
        let registry = AgentRegistry::new();
        registry.insert(start("a").await).await;
        let b = start("b").await;
        registry.insert(b.clone()).await;
        assert_eq!(registry.running().await, vec!["a", "b"]);

        b.stop().await;
        assert_eq!(registry.running().await, vec!["a"]);
        assert!(registry.get("b").await.is_none());

        registry.stop_all().await;
        assert!(registry.running().await.is_empty());
    }
}
