//! Failure taxonomy and the process-wide critical error channel.
//!
//! The engine distinguishes *whose fault* a failure is (user, infrastructure,
//! engine) because the answer decides retries, worker reassignment, and the
//! exit code the build surfaces to CI.

use std::time::Duration;

use color_eyre::{Report, Result};
use derive_more::Display;
use enum_assoc::Assoc;
use serde::{Deserialize, Serialize};
use strum::Display as StrumDisplay;
use tracing::{debug, warn};

/// How the build process exits, mapped to a stable code for logs and CI.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Display, Assoc, Serialize, Deserialize)]
#[func(pub const fn code(&self) -> i32)]
#[display("{:?}", self)]
pub enum ExitKind {
    #[assoc(code = 0)]
    Success,
    #[assoc(code = 1)]
    UserError,
    #[assoc(code = 2)]
    InfrastructureError,
    #[assoc(code = 3)]
    InternalError,
    #[assoc(code = 4)]
    InvalidCommandLine,
    #[assoc(code = 5)]
    BuildNotRequested,
    #[assoc(code = 6)]
    Canceled,
}

/// The broad class of a failure, deciding retry and propagation policy.
#[derive(
    Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, StrumDisplay, Serialize, Deserialize,
)]
pub enum FailureKind {
    /// Spec-level violations the user must fix. Never retried.
    User,
    /// Storage or network trouble. Retried within a budget; the pip may be
    /// retried on another worker when it is location-agnostic.
    Infrastructure,
    /// Invariant violations inside the engine. Never retried.
    Internal,
    /// External cancellation.
    Canceled,
}

impl FailureKind {
    /// The exit kind a build ends with when this is its worst failure.
    pub fn exit_kind(&self) -> ExitKind {
        match self {
            FailureKind::User => ExitKind::UserError,
            FailureKind::Infrastructure => ExitKind::InfrastructureError,
            FailureKind::Internal => ExitKind::InternalError,
            FailureKind::Canceled => ExitKind::Canceled,
        }
    }
}

/// Stable identifiers for pip-level failures.
#[derive(
    Copy, Clone, Eq, PartialEq, Hash, Debug, StrumDisplay, Serialize, Deserialize,
)]
pub enum FailureCode {
    /// Two pips wrote the same output path.
    InvalidOutputDueToSimpleDoubleWrite,
    /// The pip wrote a path it never declared.
    UndeclaredOutput,
    /// The pip read a path outside its declared and allowed scopes.
    DisallowedRead,
    /// A declared input was missing at materialization time.
    MissingDeclaredInput,
    /// The tool exited non-zero.
    ToolFailed,
    /// A cache or content store backend stayed unavailable past its retry
    /// budget.
    StoreUnavailable,
    /// The worker executing the pip was lost and no other worker could take
    /// it.
    WorkerLost,
    /// An upstream dependency failed, so this pip never ran.
    UpstreamFailed,
    Canceled,
    Internal,
}

/// A pip-level failure: class, stable code, human-readable detail.
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct PipFailure {
    pub kind: FailureKind,
    pub code: FailureCode,
    pub message: String,
}

impl PipFailure {
    pub fn user(code: FailureCode, message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::User,
            code,
            message: message.into(),
        }
    }

    pub fn infrastructure(code: FailureCode, message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Infrastructure,
            code,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Internal,
            code: FailureCode::Internal,
            message: message.into(),
        }
    }

    pub fn canceled() -> Self {
        Self {
            kind: FailureKind::Canceled,
            code: FailureCode::Canceled,
            message: "canceled".into(),
        }
    }
}

impl std::fmt::Display for PipFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({}): {}", self.code, self.kind, self.message)
    }
}

impl std::error::Error for PipFailure {}

/// Why a cache lookup did not produce a usable descriptor.
#[derive(
    Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, StrumDisplay, Serialize, Deserialize,
)]
pub enum MissReason {
    /// The weak fingerprint differs from every prior run (an input or the
    /// declaration changed).
    FingerprintChanged,
    /// No prior run of this pip is recorded at all.
    NoPreviousRunToCheck,
    /// The pip's specification changed since the recorded runs.
    SpecFileChanges,
    /// A worker executed the pip without receiving a fingerprint from the
    /// orchestrator.
    NoFingerprintFromOrchestrator,
    /// The cache backend failed; treated as a miss, never a build failure.
    CacheFailure,
    /// Not a miss.
    NoMiss,
}

/// A process-wide observer channel for critical errors (memory exhaustion,
/// fatal native faults). Every subscriber sees every raised error and may
/// fast-fail the build; a subscriber unsubscribes by dropping its receiver.
#[derive(Clone, Debug)]
pub struct CriticalErrorChannel {
    sender: tokio::sync::broadcast::Sender<String>,
}

impl Default for CriticalErrorChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl CriticalErrorChannel {
    pub fn new() -> Self {
        let (sender, _) = tokio::sync::broadcast::channel(64);
        Self { sender }
    }

    /// Raise a critical error to all current subscribers.
    pub fn raise(&self, message: impl Into<String>) {
        let message = message.into();
        warn!(%message, "critical error raised");
        // Send only fails when no receiver exists, which is fine: there is
        // nobody left to fast-fail.
        let _ = self.sender.send(message);
    }

    /// Subscribe to critical errors raised after this call.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<String> {
        self.sender.subscribe()
    }
}

/// Retry an infrastructure-prone operation with exponential backoff.
///
/// The operation is retried only while `is_transient` classifies its error
/// as transient and the attempt budget is not exhausted. Delays double from
/// `initial_delay` each attempt.
pub async fn retry_transient<T, F, Fut>(
    attempts: u32,
    initial_delay: Duration,
    is_transient: impl Fn(&Report) -> bool,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut delay = initial_delay;
    let mut attempt = 0;
    loop {
        attempt += 1;
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < attempts && is_transient(&err) => {
                debug!(attempt, ?delay, error = ?err, "transient failure, backing off");
                tokio::time::sleep(delay).await;
                delay = delay.saturating_mul(2);
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq as pretty_assert_eq;
    use std::sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    };

    #[test]
    fn exit_codes_are_stable() {
        pretty_assert_eq!(ExitKind::Success.code(), 0);
        pretty_assert_eq!(ExitKind::UserError.code(), 1);
        pretty_assert_eq!(ExitKind::Canceled.code(), 6);
    }

    #[test]
    fn failure_kind_maps_to_exit_kind() {
        pretty_assert_eq!(FailureKind::User.exit_kind(), ExitKind::UserError);
        pretty_assert_eq!(
            FailureKind::Infrastructure.exit_kind(),
            ExitKind::InfrastructureError
        );
    }

    #[tokio::test]
    async fn retry_stops_on_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();
        let result = retry_transient(
            5,
            Duration::from_millis(1),
            |_| true,
            move || {
                let calls = calls2.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(color_eyre::eyre::eyre!("transient"))
                    } else {
                        Ok(42)
                    }
                }
            },
        )
        .await
        .unwrap();

        pretty_assert_eq!(result, 42);
        pretty_assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_budget_is_bounded() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();
        let result: Result<()> = retry_transient(
            3,
            Duration::from_millis(1),
            |_| true,
            move || {
                let calls = calls2.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(color_eyre::eyre::eyre!("still broken"))
                }
            },
        )
        .await;

        assert!(result.is_err());
        pretty_assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn critical_channel_delivers_to_all_subscribers() {
        let channel = CriticalErrorChannel::new();
        let mut first = channel.subscribe();
        let mut second = channel.subscribe();
        channel.raise("out of memory");
        pretty_assert_eq!(first.recv().await.unwrap(), "out of memory");
        pretty_assert_eq!(second.recv().await.unwrap(), "out of memory");
    }
}
