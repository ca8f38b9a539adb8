//! Orchestration layer: task intake, agent dispatch and workflow driving.
//!
//! The [`Orchestrator`] owns the shared state. [`Orchestrator::start`] spawns
//! the two background loops, the [`TaskProcessor`] and the
//! [`WorkflowProcessor`], and returns a handle that stops them.

pub mod dispatch;
pub mod orchestrator;
pub mod task_processor;
pub mod workflow_processor;

pub use dispatch::Dispatcher;
pub use orchestrator::{Cancellation, Orchestrator};
pub use task_processor::TaskProcessor;
pub use workflow_processor::{PassReport, WorkflowProcessor};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{dlog, dlog_error, Error, Result};

/// Running background loops of an [`Orchestrator`].
pub struct OrchestratorHandle {
    cancel: CancellationToken,
    loops: Vec<JoinHandle<()>>,
    orchestrator: Orchestrator,
}

impl OrchestratorHandle {
    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Stop both loops, wait for in-flight steps, then shut down agents.
    ///
    /// Returns whether every live agent shut down cleanly.
    pub async fn shutdown(self) -> Result<bool> {
        dlog!("Orchestrator shutting down");
        self.cancel.cancel();

        let mut joined = Ok(());
        for handle in self.loops {
            if let Err(e) = handle.await {
                dlog_error!("Orchestrator: loop ended abnormally: {}", e);
                joined = Err(Error::TaskJoin(e.to_string()));
            }
        }
        joined?;

        let clean = self
            .orchestrator
            .shared
            .registry
            .write()
            .await
            .shutdown_agents();
        Ok(clean)
    }
}

impl Orchestrator {
    fn dispatcher(&self) -> Dispatcher {
        Dispatcher::new(
            self.shared.registry.clone(),
            self.shared.events.clone(),
            self.shared.config.step_timeout(),
        )
    }

    /// A task processor over this orchestrator's state, for driving by hand.
    pub fn task_processor(&self) -> TaskProcessor {
        TaskProcessor::new(self.shared.clone(), self.dispatcher())
    }

    /// A workflow processor over this orchestrator's state, for driving by hand.
    pub fn workflow_processor(&self) -> WorkflowProcessor {
        WorkflowProcessor::new(self.shared.clone(), self.dispatcher())
    }

    /// Spawn both processing loops on the current runtime.
    pub fn start(&self) -> OrchestratorHandle {
        let cancel = CancellationToken::new();
        let loops = vec![
            tokio::spawn(self.task_processor().run(cancel.clone())),
            tokio::spawn(self.workflow_processor().run(cancel.clone())),
        ];
        dlog!("Orchestrator started");
        OrchestratorHandle {
            cancel,
            loops,
            orchestrator: self.clone(),
        }
    }
}
