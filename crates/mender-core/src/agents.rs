//! Fix agents and the capability registry the scheduler dispatches through.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::domain::{AgentId, AgentSpec, Category, FixOutcome, Issue};
use crate::error::{EngineError, EngineResult};

/// The code-mutation collaborator.
///
/// An agent may only touch the files declared on the issue; the engine
/// holds their locks and backups for the duration of the call.
#[async_trait]
pub trait FixAgent: Send + Sync {
    async fn attempt_fix(&self, issue: &Issue) -> FixOutcome;
}

#[derive(Clone)]
pub struct RegisteredAgent {
    pub spec: AgentSpec,
    agent: Arc<dyn FixAgent>,
    permits: Arc<Semaphore>,
}

impl RegisteredAgent {
    pub fn id(&self) -> &AgentId {
        &self.spec.id
    }

    pub fn agent(&self) -> Arc<dyn FixAgent> {
        Arc::clone(&self.agent)
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}

impl std::fmt::Debug for RegisteredAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredAgent")
            .field("spec", &self.spec)
            .field("available", &self.available())
            .finish()
    }
}

/// Result of asking the registry for an agent.
#[derive(Debug)]
pub enum Selection {
    /// A capable agent with a free slot; the permit holds the slot.
    Assigned(RegisteredAgent, OwnedSemaphorePermit),
    /// Capable agents exist but none has a free slot right now.
    Busy,
    /// Every capable agent is suspended.
    Suspended,
    /// No registered agent lists the category.
    NoCapableAgent,
}

/// Agents in registration order.
#[derive(Debug, Clone, Default)]
pub struct AgentRegistry {
    agents: Vec<RegisteredAgent>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, spec: AgentSpec, agent: Arc<dyn FixAgent>) -> EngineResult<()> {
        if spec.concurrency_limit == 0 {
            return Err(EngineError::Registry(format!(
                "agent {} has a zero concurrency limit",
                spec.id
            )));
        }
        if self.agents.iter().any(|a| a.spec.id == spec.id) {
            return Err(EngineError::Registry(format!("duplicate agent id {}", spec.id)));
        }
        let permits = Arc::new(Semaphore::new(spec.concurrency_limit));
        self.agents.push(RegisteredAgent { spec, agent, permits });
        Ok(())
    }

    /// Builder form of [`register`](Self::register).
    pub fn with_agent(mut self, spec: AgentSpec, agent: Arc<dyn FixAgent>) -> EngineResult<Self> {
        self.register(spec, agent)?;
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    pub fn get(&self, id: &AgentId) -> Option<&RegisteredAgent> {
        self.agents.iter().find(|a| &a.spec.id == id)
    }

    pub fn capable(&self, category: &Category) -> impl Iterator<Item = &RegisteredAgent> {
        let category = category.clone();
        self.agents.iter().filter(move |a| a.spec.can_fix(&category))
    }

    /// Pick the capable, non-suspended agent with the most free slots.
    /// Ties go to the earliest registered.
    pub fn select(&self, category: &Category, suspended: impl Fn(&AgentId) -> bool) -> Selection {
        let capable: Vec<&RegisteredAgent> = self.capable(category).collect();
        if capable.is_empty() {
            return Selection::NoCapableAgent;
        }
        let active: Vec<&RegisteredAgent> = capable.into_iter().filter(|a| !suspended(a.id())).collect();
        if active.is_empty() {
            return Selection::Suspended;
        }

        let mut best: Option<&RegisteredAgent> = None;
        for agent in active {
            if agent.available() == 0 {
                continue;
            }
            if best.map_or(true, |b| agent.available() > b.available()) {
                best = Some(agent);
            }
        }
        let Some(agent) = best else {
            return Selection::Busy;
        };
        match Arc::clone(&agent.permits).try_acquire_owned() {
            Ok(permit) => Selection::Assigned(agent.clone(), permit),
            Err(_) => Selection::Busy,
        }
    }
}
