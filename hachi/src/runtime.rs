//! Shared runtime registries.
//!
//! The [`CoreRuntime`] owns the state shared between concurrent runs in a
//! process — today, the approval broker. A process-wide default instance
//! is provided as a convenience and can be overridden per run for test
//! isolation via [`RunConfig::runtime`](crate::agent::RunConfig::runtime).

use std::sync::{Arc, OnceLock};

use crate::approval::ApprovalBroker;

static GLOBAL: OnceLock<Arc<CoreRuntime>> = OnceLock::new();

/// Registries shared across concurrent runs.
#[derive(Debug)]
pub struct CoreRuntime {
    approvals: Arc<ApprovalBroker>,
}

impl Default for CoreRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl CoreRuntime {
    /// Create a runtime with default-configured registries.
    #[must_use]
    pub fn new() -> Self {
        Self {
            approvals: Arc::new(ApprovalBroker::new()),
        }
    }

    /// Create a runtime with an explicit approval broker.
    #[must_use]
    pub fn with_approvals(approvals: Arc<ApprovalBroker>) -> Self {
        Self { approvals }
    }

    /// The process-wide default runtime.
    #[must_use]
    pub fn global() -> Arc<Self> {
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(Self::new())))
    }

    /// The approval broker owned by this runtime.
    #[must_use]
    pub fn approvals(&self) -> &Arc<ApprovalBroker> {
        &self.approvals
    }
}
