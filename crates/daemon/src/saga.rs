//! Ordered compensations for multi-step workflows

use futures::future::BoxFuture;
use kvmdeck_common::{Error, Result};
use std::future::Future;
use tracing::{error, info, warn};

struct Compensation {
    step: String,
    action: BoxFuture<'static, Result<()>>,
    always: bool,
}

/// Collects undo actions as a workflow makes progress. Actions are lazy and
/// only run from [`Saga::abort`] or [`Saga::complete`].
pub struct Saga {
    name: String,
    compensations: Vec<Compensation>,
}

impl Saga {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            compensations: Vec::new(),
        }
    }

    /// Undo `step` if a later step fails
    pub fn on_failure<F>(&mut self, step: &str, action: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        self.push(step, action, false);
    }

    /// Run after the workflow either way
    pub fn always<F>(&mut self, step: &str, action: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        self.push(step, action, true);
    }

    fn push<F>(&mut self, step: &str, action: F, always: bool)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        self.compensations.push(Compensation {
            step: step.to_string(),
            action: Box::pin(action),
            always,
        });
    }

    /// Run every compensation in reverse order, then report the failed step
    pub async fn abort(self, failed_step: &str, cause: Error) -> Error {
        warn!("{}: step '{}' failed: {}", self.name, failed_step, cause);
        let mut compensated = true;
        for c in self.compensations.into_iter().rev() {
            match c.action.await {
                Ok(()) => info!("{}: compensated '{}'", self.name, c.step),
                Err(e) => {
                    error!("{}: compensation '{}' failed: {}", self.name, c.step, e);
                    compensated = false;
                }
            }
        }
        Error::PartialFailure {
            step: failed_step.to_string(),
            compensated,
            cause: Box::new(cause),
        }
    }

    /// Finish successfully, running only the unconditional actions. Their
    /// failures are logged.
    pub async fn complete(self) {
        for c in self.compensations.into_iter().rev().filter(|c| c.always) {
            if let Err(e) = c.action.await {
                warn!("{}: '{}' failed after success: {}", self.name, c.step, e);
            }
        }
    }
}
