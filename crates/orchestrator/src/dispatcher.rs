//! Fans an event out to its subscribers and reduces the answers.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use events::{Event, EventBus, HookResultData};
use futures::future::join_all;
use integrations_core::{FailurePolicy, HookAction, HookResult, HookStatus};
use serde_json::{json, Value};
use tokio::sync::Semaphore;
use tokio::task::JoinError;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::OrchestratorError;
use crate::process::IntegrationProcess;
use crate::registry::IntegrationRegistry;

pub const DEFAULT_HOOK_TIMEOUT: Duration = Duration::from_secs(30);

/// What actually happened when one integration was called.
#[derive(Debug, Clone, PartialEq)]
pub enum CallOutcome {
    Responded(HookResult),
    TimedOut { after: Duration },
    Rpc { code: i64, message: String },
    Crashed { reason: String },
    Malformed { reason: String },
    /// The host-side call task failed; says nothing about the integration.
    Internal { reason: String },
}

impl CallOutcome {
    /// Short machine-readable cause, recorded in synthesized verdicts.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Responded(_) => "responded",
            Self::TimedOut { .. } => "timeout",
            Self::Rpc { .. } => "rpc_error",
            Self::Crashed { .. } => "crashed",
            Self::Malformed { .. } => "malformed",
            Self::Internal { .. } => "internal",
        }
    }

    pub fn is_synthesized(&self) -> bool {
        !matches!(self, Self::Responded(_))
    }

    /// Effective verdict after applying `policy` to a missing answer.
    pub fn verdict(&self, policy: FailurePolicy) -> HookResult {
        match self {
            Self::Responded(result) => result.clone(),
            other => HookResult {
                status: policy.synthesized_status(),
                message: other.to_string(),
                metadata: Default::default(),
            }
            .with_metadata("cause", json!(other.kind())),
        }
    }
}

impl std::fmt::Display for CallOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Responded(result) => write!(f, "responded {}", result.status),
            Self::TimedOut { after } => write!(f, "timed out after {}ms", after.as_millis()),
            Self::Rpc { code, message } => write!(f, "rpc error {}: {}", code, message),
            Self::Crashed { reason } => write!(f, "crashed: {}", reason),
            Self::Malformed { reason } => write!(f, "malformed result: {}", reason),
            Self::Internal { reason } => write!(f, "internal error: {}", reason),
        }
    }
}

impl From<OrchestratorError> for CallOutcome {
    fn from(err: OrchestratorError) -> Self {
        match err {
            OrchestratorError::Timeout { after, .. } => Self::TimedOut { after },
            OrchestratorError::Rpc { code, message } => Self::Rpc { code, message },
            OrchestratorError::Protocol(e) => Self::Malformed {
                reason: e.to_string(),
            },
            OrchestratorError::ChannelClosed => Self::Crashed {
                reason: "channel closed during call".to_string(),
            },
            other => Self::Internal {
                reason: other.to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct IntegrationResult {
    pub integration_name: String,
    pub outcome: CallOutcome,
    pub verdict: HookResult,
}

/// Everything one dispatch produced.
#[derive(Debug, Clone)]
pub struct AggregatedOutcome {
    pub dispatch_id: Uuid,
    pub event: String,
    pub action: HookAction,
    /// One entry per subscriber, in registry (name) order.
    pub results: Vec<IntegrationResult>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl AggregatedOutcome {
    pub fn is_halt(&self) -> bool {
        self.action.is_halt()
    }

    pub fn result_for(&self, integration: &str) -> Option<&IntegrationResult> {
        self.results
            .iter()
            .find(|r| r.integration_name == integration)
    }

    pub fn failures(&self) -> impl Iterator<Item = &IntegrationResult> {
        self.results.iter().filter(|r| r.verdict.is_fail())
    }
}

#[derive(Clone)]
pub struct Dispatcher {
    registry: IntegrationRegistry,
    events: Option<EventBus>,
    max_consecutive_timeouts: Option<u32>,
    limiter: Option<Arc<Semaphore>>,
}

impl Dispatcher {
    pub fn new(registry: IntegrationRegistry) -> Self {
        Self {
            registry,
            events: None,
            max_consecutive_timeouts: None,
            limiter: None,
        }
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    /// Fail an integration after `limit` timeouts in a row.
    pub fn with_max_consecutive_timeouts(mut self, limit: u32) -> Self {
        self.max_consecutive_timeouts = Some(limit.max(1));
        self
    }

    /// Cap the number of calls in flight across all dispatches.
    pub fn with_concurrency_limit(mut self, limit: usize) -> Self {
        self.limiter = Some(Arc::new(Semaphore::new(limit.max(1))));
        self
    }

    fn publish(&self, event: Event) {
        if let Some(bus) = &self.events {
            bus.publish(event);
        }
    }

    /// Call every ready subscriber of `event` and reduce their verdicts.
    ///
    /// Waits for all calls. Each call is bounded by `timeout`; an integration
    /// that does not answer gets a verdict from its failure policy.
    pub async fn dispatch(&self, event: &str, payload: Value, timeout: Duration) -> AggregatedOutcome {
        let dispatch_id = Uuid::new_v4();
        let started_at = Utc::now();
        let subscribers = self.registry.subscribers(event).await;

        if subscribers.is_empty() {
            debug!(event = %event, "No integrations subscribed");
            return AggregatedOutcome {
                dispatch_id,
                event: event.to_string(),
                action: HookAction::Continue,
                results: Vec::new(),
                started_at,
                finished_at: Utc::now(),
            };
        }

        debug!(
            event = %event,
            dispatch_id = %dispatch_id,
            subscribers = subscribers.len(),
            "Dispatching event"
        );
        self.publish(Event::HookDispatched {
            dispatch_id,
            event: event.to_string(),
            integrations: subscribers.iter().map(|p| p.name().to_string()).collect(),
        });

        let payload = Arc::new(payload);
        let handles: Vec<_> = subscribers
            .iter()
            .map(|process| {
                let process = process.clone();
                let payload = payload.clone();
                let event = event.to_string();
                let limiter = self.limiter.clone();
                tokio::spawn(async move {
                    // The deadline starts once a permit is held.
                    let _permit = match limiter {
                        Some(limiter) => limiter.acquire_owned().await.ok(),
                        None => None,
                    };
                    call_one(&process, &event, (*payload).clone(), timeout).await
                })
            })
            .collect();

        let joined = join_all(handles).await;

        let mut results = Vec::with_capacity(subscribers.len());
        for (process, joined) in subscribers.iter().zip(joined) {
            let outcome = task_outcome(joined);
            self.after_call(process, &outcome).await;

            let verdict = outcome.verdict(process.failure_policy());
            log_result(event, process.name(), &outcome, &verdict);

            results.push(IntegrationResult {
                integration_name: process.name().to_string(),
                outcome,
                verdict,
            });
        }

        let action = HookAction::from_statuses(results.iter().map(|r| r.verdict.status));
        let finished_at = Utc::now();

        info!(
            event = %event,
            dispatch_id = %dispatch_id,
            action = action.as_str(),
            results = results.len(),
            elapsed_ms = (finished_at - started_at).num_milliseconds(),
            "Dispatch complete"
        );
        self.publish(Event::HookCompleted {
            dispatch_id,
            event: event.to_string(),
            action,
            results: results
                .iter()
                .map(|r| HookResultData {
                    integration: r.integration_name.clone(),
                    status: r.verdict.status,
                    message: r.verdict.message.clone(),
                    synthesized: r.outcome.is_synthesized(),
                })
                .collect(),
        });

        AggregatedOutcome {
            dispatch_id,
            event: event.to_string(),
            action,
            results,
            started_at,
            finished_at,
        }
    }

    /// Apply crash and repeated-timeout handling for one finished call.
    async fn after_call(&self, process: &IntegrationProcess, outcome: &CallOutcome) {
        match outcome {
            CallOutcome::Crashed { reason } => {
                process.fail_if_ready(reason).await;
            }
            CallOutcome::TimedOut { .. } => {
                let Some(limit) = self.max_consecutive_timeouts else {
                    return;
                };
                let count = process.consecutive_timeouts();
                if count >= limit {
                    process
                        .fail_if_ready(&format!("{} consecutive timeouts", count))
                        .await;
                }
            }
            _ => {}
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("max_consecutive_timeouts", &self.max_consecutive_timeouts)
            .field("concurrency_limit", &self.limiter.is_some())
            .finish_non_exhaustive()
    }
}

/// Outcome of a joined call task. A panicked or cancelled task is a host
/// problem, so it is never reported as a crash of the integration.
fn task_outcome(joined: std::result::Result<CallOutcome, JoinError>) -> CallOutcome {
    joined.unwrap_or_else(|e| {
        error!(error = %e, "Dispatch task failed");
        CallOutcome::Internal {
            reason: format!("dispatch task failed: {}", e),
        }
    })
}

async fn call_one(
    process: &IntegrationProcess,
    event: &str,
    payload: Value,
    timeout: Duration,
) -> CallOutcome {
    match process.call_event(event, payload, timeout).await {
        Ok(value) => match serde_json::from_value::<HookResult>(value) {
            Ok(result) => CallOutcome::Responded(result),
            Err(e) => CallOutcome::Malformed {
                reason: format!("invalid hook result: {}", e),
            },
        },
        Err(e) => e.into(),
    }
}

fn log_result(event: &str, integration: &str, outcome: &CallOutcome, verdict: &HookResult) {
    let message = if verdict.message.is_empty() {
        "no details provided"
    } else {
        verdict.message.as_str()
    };

    match verdict.status {
        HookStatus::Fail => error!(
            event = %event,
            integration = %integration,
            outcome = outcome.kind(),
            "Integration failed: {}",
            message
        ),
        HookStatus::Warn => warn!(
            event = %event,
            integration = %integration,
            outcome = outcome.kind(),
            "Integration warning: {}",
            message
        ),
        HookStatus::Success => info!(
            event = %event,
            integration = %integration,
            "Integration passed"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ready, status, Behavior};
    use integrations_core::IntegrationState;

    const EVENT: &str = "post-plan-resource";
    const SHORT: Duration = Duration::from_millis(200);

    async fn registry_of(fakes: &[&crate::testing::FakeIntegration]) -> IntegrationRegistry {
        let registry = IntegrationRegistry::new();
        for fake in fakes {
            registry.insert(fake.process.clone()).await;
        }
        registry
    }

    #[tokio::test]
    async fn test_no_subscribers_continues_with_no_results() {
        let idle = ready("idle", &[], FailurePolicy::Strict, status("fail")).await;
        let dispatcher = Dispatcher::new(registry_of(&[&idle]).await);

        let outcome = dispatcher.dispatch(EVENT, json!({}), SHORT).await;

        assert_eq!(outcome.action, HookAction::Continue);
        assert!(outcome.results.is_empty());
        assert!(idle.received.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_fan_out_reaches_only_subscribers() {
        let a = ready("a", &[EVENT], FailurePolicy::Strict, status("success")).await;
        let b = ready("b", &[EVENT], FailurePolicy::Strict, status("success")).await;
        let c = ready("c", &["pre-apply-resource"], FailurePolicy::Strict, status("success")).await;
        let dispatcher = Dispatcher::new(registry_of(&[&c, &b, &a]).await);

        let outcome = dispatcher
            .dispatch(EVENT, json!({"address": "aws_instance.web"}), SHORT)
            .await;

        let names: Vec<_> = outcome
            .results
            .iter()
            .map(|r| r.integration_name.as_str())
            .collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(outcome.action, HookAction::Continue);

        let received = a.received.lock().unwrap().clone();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].0, "event:post-plan-resource");
        assert_eq!(received[0].1["address"], "aws_instance.web");
        assert!(c.received.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_fail_is_never_outvoted() {
        let a = ready("a", &[EVENT], FailurePolicy::Strict, status("success")).await;
        let b = ready("b", &[EVENT], FailurePolicy::Strict, status("warn")).await;
        let c = ready(
            "c",
            &[EVENT],
            FailurePolicy::Strict,
            Behavior::Reply(json!({"status": "fail", "message": "denied"})),
        )
        .await;
        let dispatcher = Dispatcher::new(registry_of(&[&a, &b, &c]).await);

        let outcome = dispatcher.dispatch(EVENT, json!({}), SHORT).await;

        assert!(outcome.is_halt());
        let failures: Vec<_> = outcome.failures().collect();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].verdict.message, "denied");
    }

    async fn timeout_scenario(policy: FailurePolicy) -> AggregatedOutcome {
        let a = ready("a", &[EVENT], policy, status("success")).await;
        let b = ready(
            "b",
            &[EVENT],
            policy,
            Behavior::Reply(json!({"status": "warn", "message": "m"})),
        )
        .await;
        let c = ready("c", &[EVENT], policy, Behavior::Silent).await;
        let dispatcher = Dispatcher::new(registry_of(&[&a, &b, &c]).await);

        dispatcher.dispatch(EVENT, json!({}), SHORT).await
    }

    #[tokio::test]
    async fn test_timeout_scenario_lenient_continues() {
        let outcome = timeout_scenario(FailurePolicy::Lenient).await;

        assert_eq!(outcome.action, HookAction::Continue);
        assert_eq!(outcome.results.len(), 3);
        assert_eq!(outcome.result_for("b").unwrap().verdict.message, "m");

        let c = outcome.result_for("c").unwrap();
        assert_eq!(c.outcome, CallOutcome::TimedOut { after: SHORT });
        assert_eq!(c.verdict.status, HookStatus::Warn);
        assert_eq!(c.verdict.metadata["cause"], "timeout");
    }

    #[tokio::test]
    async fn test_timeout_scenario_strict_halts() {
        let outcome = timeout_scenario(FailurePolicy::Strict).await;

        assert_eq!(outcome.action, HookAction::Halt);
        let names: Vec<_> = outcome
            .results
            .iter()
            .map(|r| r.integration_name.as_str())
            .collect();
        assert_eq!(names, vec!["a", "b", "c"]);
        assert_eq!(
            outcome.result_for("c").unwrap().verdict.status,
            HookStatus::Fail
        );
    }

    #[tokio::test]
    async fn test_timeout_does_not_delay_others() {
        let fast = ready("fast", &[EVENT], FailurePolicy::Lenient, status("success")).await;
        let slow = ready("slow", &[EVENT], FailurePolicy::Lenient, Behavior::Silent).await;
        let dispatcher = Dispatcher::new(registry_of(&[&fast, &slow]).await);

        let started = std::time::Instant::now();
        let outcome = dispatcher.dispatch(EVENT, json!({}), SHORT).await;

        assert!(started.elapsed() < SHORT * 5);
        assert_eq!(outcome.results.len(), 2);
        // A timeout leaves the integration running.
        assert_eq!(slow.process.state(), IntegrationState::Ready);
    }

    #[tokio::test]
    async fn test_crash_fails_integration_and_excludes_it() {
        let ok = ready("ok", &[EVENT], FailurePolicy::Lenient, status("success")).await;
        let dead = ready("dead", &[EVENT], FailurePolicy::Lenient, Behavior::HangUp).await;
        let dispatcher = Dispatcher::new(registry_of(&[&ok, &dead]).await);

        let outcome = dispatcher
            .dispatch(EVENT, json!({}), Duration::from_secs(5))
            .await;

        let result = outcome.result_for("dead").unwrap();
        assert!(matches!(result.outcome, CallOutcome::Crashed { .. }));
        assert_eq!(result.verdict.status, HookStatus::Warn);
        assert_eq!(dead.process.state(), IntegrationState::Failed);

        let next = dispatcher.dispatch(EVENT, json!({}), SHORT).await;
        assert_eq!(next.results.len(), 1);
        assert_eq!(next.results[0].integration_name, "ok");
    }

    async fn panicking_call() -> CallOutcome {
        panic!("call task blew up")
    }

    #[tokio::test]
    async fn test_task_failure_is_internal() {
        let joined = tokio::spawn(panicking_call()).await;
        assert!(joined.is_err());

        let outcome = task_outcome(joined);
        assert_eq!(outcome.kind(), "internal");
        assert!(outcome.is_synthesized());
        assert_eq!(outcome.verdict(FailurePolicy::Lenient).status, HookStatus::Warn);
        assert_eq!(outcome.verdict(FailurePolicy::Strict).status, HookStatus::Fail);
    }

    #[tokio::test]
    async fn test_internal_outcome_leaves_integration_ready() {
        let ok = ready("ok", &[EVENT], FailurePolicy::Strict, status("success")).await;
        let dispatcher = Dispatcher::new(registry_of(&[&ok]).await);

        dispatcher
            .after_call(
                &ok.process,
                &CallOutcome::Internal {
                    reason: "dispatch task failed".to_string(),
                },
            )
            .await;

        assert_eq!(ok.process.state(), IntegrationState::Ready);
        assert!(!ok.process.channel().is_closed());
    }

    #[tokio::test]
    async fn test_huge_timeout_dispatches_normally() {
        let ok = ready("ok", &[EVENT], FailurePolicy::Strict, status("success")).await;
        let dispatcher = Dispatcher::new(registry_of(&[&ok]).await);

        let outcome = dispatcher
            .dispatch(EVENT, json!({}), Duration::from_secs(u64::MAX))
            .await;

        assert_eq!(outcome.action, HookAction::Continue);
        assert_eq!(
            outcome.results[0].outcome,
            CallOutcome::Responded(HookResult::success())
        );
        assert_eq!(ok.process.state(), IntegrationState::Ready);
    }

    #[tokio::test]
    async fn test_null_optional_fields_are_accepted() {
        let ok = ready(
            "ok",
            &[EVENT],
            FailurePolicy::Strict,
            Behavior::Reply(json!({"status": "success", "message": null, "metadata": null})),
        )
        .await;
        let dispatcher = Dispatcher::new(registry_of(&[&ok]).await);

        let outcome = dispatcher.dispatch(EVENT, json!({}), SHORT).await;

        assert_eq!(outcome.action, HookAction::Continue);
        assert_eq!(
            outcome.results[0].outcome,
            CallOutcome::Responded(HookResult::success())
        );
    }

    #[tokio::test]
    async fn test_rpc_error_is_synthesized() {
        let bad = ready(
            "bad",
            &[EVENT],
            FailurePolicy::Strict,
            Behavior::RpcError(-32601, "unknown method"),
        )
        .await;
        let dispatcher = Dispatcher::new(registry_of(&[&bad]).await);

        let outcome = dispatcher.dispatch(EVENT, json!({}), SHORT).await;

        let result = &outcome.results[0];
        assert_eq!(
            result.outcome,
            CallOutcome::Rpc {
                code: -32601,
                message: "unknown method".to_string()
            }
        );
        assert_eq!(result.verdict.status, HookStatus::Fail);
        assert_eq!(result.verdict.message, "rpc error -32601: unknown method");
        assert!(outcome.is_halt());
    }

    #[tokio::test]
    async fn test_malformed_result_is_synthesized() {
        let odd = ready(
            "odd",
            &[EVENT],
            FailurePolicy::Lenient,
            Behavior::Raw(r#"{"jsonrpc":"2.0","id":{id},"result":{"status":"maybe"}}"#),
        )
        .await;
        let garbled = ready(
            "garbled",
            &[EVENT],
            FailurePolicy::Lenient,
            Behavior::Raw(r#"{"jsonrpc":"2.0","id":{id},"result":1,"error":{"code":1,"message":"x"}}"#),
        )
        .await;
        let dispatcher = Dispatcher::new(registry_of(&[&odd, &garbled]).await);

        let outcome = dispatcher.dispatch(EVENT, json!({}), SHORT).await;

        for result in &outcome.results {
            assert!(
                matches!(result.outcome, CallOutcome::Malformed { .. }),
                "{}: {:?}",
                result.integration_name,
                result.outcome
            );
            assert_eq!(result.verdict.status, HookStatus::Warn);
        }
        assert_eq!(outcome.action, HookAction::Continue);
    }

    #[tokio::test]
    async fn test_repeated_timeouts_fail_integration() {
        let slow = ready("slow", &[EVENT], FailurePolicy::Lenient, Behavior::Silent).await;
        let dispatcher =
            Dispatcher::new(registry_of(&[&slow]).await).with_max_consecutive_timeouts(2);

        dispatcher
            .dispatch(EVENT, json!({}), Duration::from_millis(50))
            .await;
        assert_eq!(slow.process.state(), IntegrationState::Ready);

        dispatcher
            .dispatch(EVENT, json!({}), Duration::from_millis(50))
            .await;
        assert_eq!(slow.process.state(), IntegrationState::Failed);
    }

    #[tokio::test]
    async fn test_concurrency_limit_still_waits_for_all() {
        let a = ready("a", &[EVENT], FailurePolicy::Strict, status("success")).await;
        let b = ready("b", &[EVENT], FailurePolicy::Strict, status("warn")).await;
        let c = ready("c", &[EVENT], FailurePolicy::Strict, status("success")).await;
        let dispatcher =
            Dispatcher::new(registry_of(&[&a, &b, &c]).await).with_concurrency_limit(1);

        let outcome = dispatcher.dispatch(EVENT, json!({}), SHORT).await;

        assert_eq!(outcome.results.len(), 3);
        assert_eq!(outcome.action, HookAction::Continue);
    }

    #[tokio::test]
    async fn test_dispatch_publishes_events() {
        let a = ready("a", &[EVENT], FailurePolicy::Strict, status("success")).await;
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let dispatcher = Dispatcher::new(registry_of(&[&a]).await).with_events(bus);

        let outcome = dispatcher.dispatch(EVENT, json!({}), SHORT).await;

        match rx.recv().await.unwrap().event {
            Event::HookDispatched {
                dispatch_id,
                integrations,
                ..
            } => {
                assert_eq!(dispatch_id, outcome.dispatch_id);
                assert_eq!(integrations, vec!["a".to_string()]);
            }
            other => panic!("unexpected event: {other:?}"),
        }
        match rx.recv().await.unwrap().event {
            Event::HookCompleted { action, results, .. } => {
                assert_eq!(action, HookAction::Continue);
                assert_eq!(results.len(), 1);
                assert!(!results[0].synthesized);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_verdict_for_responded_is_unchanged() {
        let result = HookResult::warn("close to budget");
        let outcome = CallOutcome::Responded(result.clone());
        assert_eq!(outcome.verdict(FailurePolicy::Strict), result);
        assert!(!outcome.is_synthesized());
    }
}
