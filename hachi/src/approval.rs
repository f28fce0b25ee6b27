//! Human-in-the-loop approval for gated tools.
//!
//! Tools registered with `requires_approval` are dispatched only after a
//! decision resolves. Decisions come from three places, in order:
//!
//! 1. Pre-supplied decisions on the run options, keyed by
//!    `{tool name, argument digest}`.
//! 2. A configured [`ApprovalHandler`] — synchronous policy code, a UI
//!    prompt, or anything else that can answer.
//! 3. Out-of-band approvers going through the [`ApprovalBroker`]: the
//!    broker parks the request, someone enumerates `pending()` and calls
//!    `submit` with the token. [`ApprovalBroker::handler`] packages this
//!    path as a regular handler.
//!
//! A timed-out request resolves as a rejection with reason `"timeout"` —
//! it is a tool-level outcome, never a run failure. The broker is shared
//! by all concurrent runs in a process; see
//! [`CoreRuntime`](crate::runtime::CoreRuntime).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::oneshot;
use uuid::Uuid;

/// Default time to wait for an approval decision.
pub const DEFAULT_DECISION_TIMEOUT: Duration = Duration::from_secs(300);

/// Default age after which records are evicted.
pub const DEFAULT_REAP_AFTER: Duration = Duration::from_secs(600);

/// Hex-encoded SHA-256 digest of a tool's arguments, used to key
/// pre-supplied approval decisions.
#[must_use]
pub fn args_digest(args: &Value) -> String {
    use sha2::{Digest, Sha256};

    let canonical = serde_json::to_string(args).unwrap_or_default();
    let digest = Sha256::digest(canonical.as_bytes());
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        use std::fmt::Write as _;
        let _ = write!(out, "{byte:02x}");
    }
    out
}

/// Lifecycle state of an approval request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalStatus {
    /// Waiting for a decision.
    Pending,
    /// Execution was approved.
    Approved,
    /// Execution was rejected.
    Rejected,
    /// No decision arrived within the timeout.
    TimedOut,
}

impl ApprovalStatus {
    /// Returns `true` if a decision (or timeout) has been reached.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// A tracked approval request.
#[derive(Debug, Clone)]
pub struct ApprovalRecord {
    /// Token identifying this request.
    pub token: Uuid,
    /// The gated tool.
    pub tool_name: String,
    /// The call arguments as requested by the model.
    pub arguments: Value,
    /// When the request was created.
    pub requested_at: Instant,
    /// Current state.
    pub status: ApprovalStatus,
}

/// The decision for a gated tool call.
#[derive(Debug, Clone, Default)]
pub struct ApprovalDecision {
    /// Whether execution may proceed.
    pub approved: bool,
    /// Optional reason, surfaced in the tool result on rejection.
    pub reason: Option<String>,
    /// Replacement arguments to execute with instead of the originals.
    pub modified_args: Option<Value>,
}

impl ApprovalDecision {
    /// Approve execution with the original arguments.
    #[must_use]
    pub fn approve() -> Self {
        Self {
            approved: true,
            reason: None,
            modified_args: None,
        }
    }

    /// Approve execution with replacement arguments.
    #[must_use]
    pub fn approve_with_args(args: Value) -> Self {
        Self {
            approved: true,
            reason: None,
            modified_args: Some(args),
        }
    }

    /// Reject execution.
    #[must_use]
    pub fn reject(reason: impl Into<String>) -> Self {
        Self {
            approved: false,
            reason: Some(reason.into()),
            modified_args: None,
        }
    }

    /// The decision produced when a request times out.
    #[must_use]
    pub fn timeout() -> Self {
        Self::reject("timeout")
    }
}

/// An approval request as seen by a handler.
#[derive(Debug, Clone)]
pub struct ApprovalRequest {
    /// Broker token for this request.
    pub token: Uuid,
    /// The gated tool.
    pub tool_name: String,
    /// The call arguments.
    pub arguments: Value,
}

/// Decides whether a gated tool call may execute.
#[async_trait]
pub trait ApprovalHandler: Send + Sync {
    /// Decide on the request.
    async fn decide(&self, request: &ApprovalRequest) -> ApprovalDecision;
}

/// Handler that approves every request.
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoApproveHandler;

#[async_trait]
impl ApprovalHandler for AutoApproveHandler {
    async fn decide(&self, _request: &ApprovalRequest) -> ApprovalDecision {
        ApprovalDecision::approve()
    }
}

/// Handler that rejects every request.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysRejectHandler;

#[async_trait]
impl ApprovalHandler for AlwaysRejectHandler {
    async fn decide(&self, _request: &ApprovalRequest) -> ApprovalDecision {
        ApprovalDecision::reject("rejected by policy")
    }
}

struct PendingEntry {
    record: ApprovalRecord,
    respond: Option<oneshot::Sender<ApprovalDecision>>,
}

/// Process-wide registry of approval requests.
///
/// Safe for concurrent runs: the pending map is the only shared mutable
/// state and every access is serialised behind one mutex. Decisions are
/// matched strictly by token.
pub struct ApprovalBroker {
    entries: Mutex<HashMap<Uuid, PendingEntry>>,
    decision_timeout: Duration,
    reap_after: Duration,
}

impl Default for ApprovalBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl ApprovalBroker {
    /// Create a broker with the default timeouts.
    #[must_use]
    pub fn new() -> Self {
        Self::with_timeouts(DEFAULT_DECISION_TIMEOUT, DEFAULT_REAP_AFTER)
    }

    /// Create a broker with explicit decision and reaping timeouts.
    #[must_use]
    pub fn with_timeouts(decision_timeout: Duration, reap_after: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            decision_timeout,
            reap_after,
        }
    }

    /// The configured decision timeout.
    #[must_use]
    pub const fn decision_timeout(&self) -> Duration {
        self.decision_timeout
    }

    /// Allocate a pending record with a fresh token.
    ///
    /// Also evicts records past the reaping threshold.
    pub fn allocate(&self, tool_name: impl Into<String>, arguments: Value) -> ApprovalRecord {
        let record = ApprovalRecord {
            token: Uuid::new_v4(),
            tool_name: tool_name.into(),
            arguments,
            requested_at: Instant::now(),
            status: ApprovalStatus::Pending,
        };

        let mut entries = self.entries.lock().expect("approval map poisoned");
        Self::reap_locked(&mut entries, self.reap_after);
        entries.insert(
            record.token,
            PendingEntry {
                record: record.clone(),
                respond: None,
            },
        );
        record
    }

    /// Submit a decision by token (for out-of-band approvers).
    ///
    /// Returns `false` if the token is unknown or already decided.
    pub fn submit(&self, token: Uuid, decision: ApprovalDecision) -> bool {
        let mut entries = self.entries.lock().expect("approval map poisoned");
        let Some(entry) = entries.get_mut(&token) else {
            return false;
        };
        if entry.record.status.is_terminal() {
            return false;
        }

        entry.record.status = if decision.approved {
            ApprovalStatus::Approved
        } else {
            ApprovalStatus::Rejected
        };
        if let Some(sender) = entry.respond.take() {
            let _ = sender.send(decision);
        }
        true
    }

    /// Await the decision for an allocated token.
    ///
    /// Resolves to a rejection with reason `"timeout"` if no decision
    /// arrives within the broker's decision timeout.
    pub async fn await_decision(&self, token: Uuid) -> ApprovalDecision {
        let receiver = {
            let mut entries = self.entries.lock().expect("approval map poisoned");
            let Some(entry) = entries.get_mut(&token) else {
                return ApprovalDecision::timeout();
            };
            if entry.record.status.is_terminal() {
                // Decided before anyone started waiting.
                return match entry.record.status {
                    ApprovalStatus::Approved => ApprovalDecision::approve(),
                    _ => ApprovalDecision::reject("rejected"),
                };
            }
            let (tx, rx) = oneshot::channel();
            entry.respond = Some(tx);
            rx
        };

        match tokio::time::timeout(self.decision_timeout, receiver).await {
            Ok(Ok(decision)) => decision,
            _ => {
                self.mark_timed_out(token);
                ApprovalDecision::timeout()
            }
        }
    }

    /// Record a decision made outside the broker (e.g. by a run-level
    /// handler), keeping the registry consistent for observers.
    pub fn resolve(&self, token: Uuid, approved: bool) {
        let mut entries = self.entries.lock().expect("approval map poisoned");
        if let Some(entry) = entries.get_mut(&token) {
            if !entry.record.status.is_terminal() {
                entry.record.status = if approved {
                    ApprovalStatus::Approved
                } else {
                    ApprovalStatus::Rejected
                };
            }
        }
    }

    /// Snapshot all currently pending records.
    #[must_use]
    pub fn pending(&self) -> Vec<ApprovalRecord> {
        self.entries
            .lock()
            .expect("approval map poisoned")
            .values()
            .filter(|e| e.record.status == ApprovalStatus::Pending)
            .map(|e| e.record.clone())
            .collect()
    }

    /// Look up a record by token.
    #[must_use]
    pub fn record(&self, token: Uuid) -> Option<ApprovalRecord> {
        self.entries
            .lock()
            .expect("approval map poisoned")
            .get(&token)
            .map(|e| e.record.clone())
    }

    /// Evict records older than the reaping threshold.
    pub fn reap(&self) {
        let mut entries = self.entries.lock().expect("approval map poisoned");
        Self::reap_locked(&mut entries, self.reap_after);
    }

    /// A handler that parks requests in this broker and waits for an
    /// out-of-band `submit` (or times out).
    #[must_use]
    pub fn handler(self: &Arc<Self>) -> Arc<dyn ApprovalHandler> {
        Arc::new(BrokerHandler {
            broker: Arc::clone(self),
        })
    }

    fn mark_timed_out(&self, token: Uuid) {
        let mut entries = self.entries.lock().expect("approval map poisoned");
        if let Some(entry) = entries.get_mut(&token) {
            if entry.record.status == ApprovalStatus::Pending {
                entry.record.status = ApprovalStatus::TimedOut;
                entry.respond = None;
            }
        }
    }

    fn reap_locked(entries: &mut HashMap<Uuid, PendingEntry>, reap_after: Duration) {
        let now = Instant::now();
        entries.retain(|_, entry| {
            now.saturating_duration_since(entry.record.requested_at) < reap_after
        });
    }
}

impl std::fmt::Debug for ApprovalBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApprovalBroker")
            .field("decision_timeout", &self.decision_timeout)
            .field("reap_after", &self.reap_after)
            .finish_non_exhaustive()
    }
}

struct BrokerHandler {
    broker: Arc<ApprovalBroker>,
}

#[async_trait]
impl ApprovalHandler for BrokerHandler {
    async fn decide(&self, request: &ApprovalRequest) -> ApprovalDecision {
        self.broker.await_decision(request.token).await
    }
}
