//! Registry of agent factories and live agent instances.
//!
//! The `AgentRegistry` maps an agent type key to a factory and to at most one
//! live instance. Instances are created lazily on first dispatch and dropped
//! on shutdown.

use std::collections::HashMap;
use std::sync::Arc;

use super::Agent;
use crate::{dlog, dlog_debug, dlog_warn, Error, Result};

/// Builds agents of a single type.
pub trait AgentFactory: Send + Sync {
    /// The agent type this factory produces.
    fn agent_type(&self) -> &str;

    fn create(&self) -> Arc<dyn Agent>;
}

/// Factory backed by a closure.
pub struct FnFactory<F> {
    agent_type: String,
    build: F,
}

impl<F> FnFactory<F>
where
    F: Fn() -> Arc<dyn Agent> + Send + Sync,
{
    pub fn new(agent_type: &str, build: F) -> Self {
        Self {
            agent_type: agent_type.to_string(),
            build,
        }
    }
}

impl<F> AgentFactory for FnFactory<F>
where
    F: Fn() -> Arc<dyn Agent> + Send + Sync,
{
    fn agent_type(&self) -> &str {
        &self.agent_type
    }

    fn create(&self) -> Arc<dyn Agent> {
        (self.build)()
    }
}

/// Maps agent type keys to factories and live singleton instances.
#[derive(Default)]
pub struct AgentRegistry {
    factories: HashMap<String, Arc<dyn AgentFactory>>,
    agents: HashMap<String, Arc<dyn Agent>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a factory under the agent type it reports.
    ///
    /// A later registration for the same type replaces the earlier factory;
    /// an already live instance is kept until it is recreated.
    pub fn register_agent_class(&mut self, factory: Arc<dyn AgentFactory>) {
        let agent_type = factory.agent_type().to_string();
        dlog_debug!("AgentRegistry: registered factory for {}", agent_type);
        self.factories.insert(agent_type, factory);
    }

    /// Instantiate and initialize an agent, making it the live instance.
    ///
    /// Any prior live instance for the type is replaced without being shut
    /// down.
    ///
    /// # Errors
    /// [`Error::AgentTypeNotFound`] when no factory is registered, and
    /// [`Error::AgentInit`] when `initialize()` returns false. Neither case
    /// changes the live instance map.
    pub fn create_agent(&mut self, agent_type: &str) -> Result<Arc<dyn Agent>> {
        let factory = self
            .factories
            .get(agent_type)
            .ok_or_else(|| Error::AgentTypeNotFound(agent_type.to_string()))?;

        let agent = factory.create();
        if !agent.initialize() {
            dlog_warn!("AgentRegistry: {} failed to initialize", agent_type);
            return Err(Error::AgentInit(agent_type.to_string()));
        }

        dlog!("AgentRegistry: created {} ({})", agent_type, agent.name());
        self.agents.insert(agent_type.to_string(), agent.clone());
        Ok(agent)
    }

    /// The live instance for `agent_type`, without creating one.
    pub fn get_agent(&self, agent_type: &str) -> Option<Arc<dyn Agent>> {
        self.agents.get(agent_type).cloned()
    }

    /// The live instance, created on first use.
    pub fn get_or_create(&mut self, agent_type: &str) -> Result<Arc<dyn Agent>> {
        match self.get_agent(agent_type) {
            Some(agent) => Ok(agent),
            None => self.create_agent(agent_type),
        }
    }

    /// Shut down every live instance.
    ///
    /// Every agent is asked to shut down even after one refuses. The live map
    /// is cleared only if all of them succeeded, so a later call asks every
    /// agent again.
    pub fn shutdown_agents(&mut self) -> bool {
        let mut all_ok = true;
        for (agent_type, agent) in &self.agents {
            if !agent.shutdown() {
                dlog_warn!("AgentRegistry: {} failed to shut down", agent_type);
                all_ok = false;
            }
        }

        if all_ok {
            dlog!("AgentRegistry: shut down {} agent(s)", self.agents.len());
            self.agents.clear();
        }
        all_ok
    }

    pub fn has_factory(&self, agent_type: &str) -> bool {
        self.factories.contains_key(agent_type)
    }

    /// Registered agent types, sorted.
    pub fn agent_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.factories.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn live_count(&self) -> usize {
        self.agents.len()
    }
}

impl std::fmt::Debug for AgentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRegistry")
            .field("factories", &self.agent_types())
            .field("live", &self.agents.len())
            .finish()
    }
}
