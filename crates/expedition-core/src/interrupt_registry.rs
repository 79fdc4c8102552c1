use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, Mutex};

use expedition_types::{now_ms, AllowedDecision, Decision};

/// Outcome of a parked `wait` call other than a delivered decision (§4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitError {
    /// A second waiter tried to register for a thread that already has one (I7).
    Busy,
    /// The deadline elapsed with no decision delivered.
    Timeout,
    /// `cancel` was called (or the sender was dropped) before a decision arrived.
    Cancelled,
}

/// Outcome of a `deliver` call other than success.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliverError {
    /// No waiter is registered for this thread; decisions are not buffered.
    NoWaiter,
    /// The decision's tag is not a member of the waiter's `allowed_decisions`.
    Malformed,
}

enum Resolution {
    Decision(Decision),
    Cancelled,
}

struct Slot {
    tx: oneshot::Sender<Resolution>,
    allowed: Vec<AllowedDecision>,
}

/// Per-thread rendezvous: one side parks in `wait` for a human decision, the other side
/// wakes it via `deliver` or `cancel`. Enforces at-most-one pending interrupt per thread
/// (I1) and surfaces a synthetic timeout reject via the caller, matching the
/// ask/reply/wait_for_reply rendezvous in `tandem-core::permissions::PermissionManager`
/// but keyed on thread id and backed by a one-shot channel instead of a watch channel,
/// since a registry slot is consumed exactly once.
#[derive(Clone)]
pub struct InterruptRegistry {
    slots: Arc<Mutex<HashMap<String, Slot>>>,
}

impl InterruptRegistry {
    pub fn new() -> Self {
        Self {
            slots: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Parks the caller until a decision for `thread_id` is delivered, `deadline_ms`
    /// (absolute epoch milliseconds) passes, or the registration is cancelled.
    /// `allowed_decisions` is carried alongside the waiter so `deliver` can reject
    /// malformed decisions without disturbing the parked waiter (B1).
    pub async fn wait(
        &self,
        thread_id: &str,
        allowed_decisions: &[AllowedDecision],
        deadline_ms: u64,
    ) -> Result<Decision, WaitError> {
        let (tx, rx) = oneshot::channel();
        {
            let mut slots = self.slots.lock().await;
            if slots.contains_key(thread_id) {
                return Err(WaitError::Busy);
            }
            slots.insert(
                thread_id.to_string(),
                Slot {
                    tx,
                    allowed: allowed_decisions.to_vec(),
                },
            );
        }
        tracing::debug!(thread_id, "interrupt registered, waiting for decision");

        let now = now_ms();
        let remaining = Duration::from_millis(deadline_ms.saturating_sub(now));
        let outcome = tokio::time::timeout(remaining, rx).await;
        match outcome {
            Ok(Ok(Resolution::Decision(decision))) => Ok(decision),
            Ok(Ok(Resolution::Cancelled)) => Err(WaitError::Cancelled),
            Ok(Err(_recv_dropped)) => Err(WaitError::Cancelled),
            Err(_elapsed) => {
                self.slots.lock().await.remove(thread_id);
                tracing::info!(thread_id, "interrupt deadline elapsed, synthesizing reject");
                Err(WaitError::Timeout)
            }
        }
    }

    /// Wakes the parked waiter for `thread_id` with `decision`, if one exists.
    /// Decisions are never buffered: if nobody is waiting this returns `NoWaiter`.
    pub async fn deliver(&self, thread_id: &str, decision: Decision) -> Result<(), DeliverError> {
        let mut slots = self.slots.lock().await;
        let Some(slot) = slots.remove(thread_id) else {
            return Err(DeliverError::NoWaiter);
        };
        if !slot.allowed.contains(&decision.kind()) {
            // Malformed: leave the waiter registered untouched (B1 — no state change).
            slots.insert(thread_id.to_string(), slot);
            return Err(DeliverError::Malformed);
        }
        drop(slots);
        let _ = slot.tx.send(Resolution::Decision(decision));
        Ok(())
    }

    /// Wakes the waiter (if any) with a cancellation. Idempotent — calling `cancel` on a
    /// thread with no registered waiter is a no-op.
    pub async fn cancel(&self, thread_id: &str) {
        if let Some(slot) = self.slots.lock().await.remove(thread_id) {
            let _ = slot.tx.send(Resolution::Cancelled);
        }
    }

    /// Number of threads with a live waiter — used by tests to check P1 (≤ 1 per thread
    /// trivially holds by construction, this is the aggregate count across threads).
    pub async fn waiter_count(&self) -> usize {
        self.slots.lock().await.len()
    }
}

impl Default for InterruptRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use expedition_types::now_ms;

    fn approve_only() -> Vec<AllowedDecision> {
        vec![AllowedDecision::Approve, AllowedDecision::Edit, AllowedDecision::Reject]
    }

    #[tokio::test]
    async fn deliver_wakes_the_waiter_with_the_decision() {
        let registry = InterruptRegistry::new();
        let registry_clone = registry.clone();
        let deadline = now_ms() + 5_000;
        let handle = tokio::spawn(async move {
            registry_clone.wait("t1", &approve_only(), deadline).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        registry.deliver("t1", Decision::Approve).await.unwrap();
        let decision = handle.await.unwrap().unwrap();
        assert!(matches!(decision, Decision::Approve));
    }

    #[tokio::test]
    async fn deliver_without_a_waiter_returns_no_waiter() {
        let registry = InterruptRegistry::new();
        let err = registry.deliver("unknown", Decision::Approve).await;
        assert_eq!(err, Err(DeliverError::NoWaiter));
    }

    #[tokio::test]
    async fn second_registration_on_same_thread_is_busy() {
        let registry = InterruptRegistry::new();
        let registry_clone = registry.clone();
        let deadline = now_ms() + 5_000;
        let _first = tokio::spawn(async move {
            registry_clone.wait("t1", &approve_only(), deadline).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        let err = registry.wait("t1", &approve_only(), deadline).await;
        assert_eq!(err, Err(WaitError::Busy));
    }

    #[tokio::test]
    async fn cancel_wakes_the_waiter_with_cancelled() {
        let registry = InterruptRegistry::new();
        let registry_clone = registry.clone();
        let deadline = now_ms() + 5_000;
        let handle = tokio::spawn(async move {
            registry_clone.wait("t1", &approve_only(), deadline).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        registry.cancel("t1").await;
        let err = handle.await.unwrap();
        assert_eq!(err, Err(WaitError::Cancelled));
    }

    #[tokio::test]
    async fn cancel_on_idle_thread_is_a_no_op() {
        let registry = InterruptRegistry::new();
        registry.cancel("never-registered").await;
        assert_eq!(registry.waiter_count().await, 0);
    }

    #[tokio::test]
    async fn deadline_elapses_into_timeout_and_frees_the_slot() {
        let registry = InterruptRegistry::new();
        let deadline = now_ms() + 30;
        let err = registry.wait("t1", &approve_only(), deadline).await;
        assert_eq!(err, Err(WaitError::Timeout));
        assert_eq!(registry.waiter_count().await, 0);
    }

    #[tokio::test]
    async fn malformed_decision_leaves_waiter_registered_for_a_retry() {
        let registry = InterruptRegistry::new();
        let registry_clone = registry.clone();
        let deadline = now_ms() + 5_000;
        let handle = tokio::spawn(async move {
            registry_clone
                .wait("t1", &[AllowedDecision::Approve], deadline)
                .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        let err = registry
            .deliver(
                "t1",
                Decision::Reject {
                    message: "no".to_string(),
                },
            )
            .await;
        assert_eq!(err, Err(DeliverError::Malformed));
        // The waiter is still parked — a correctly-typed decision still wakes it (R2-adjacent).
        registry.deliver("t1", Decision::Approve).await.unwrap();
        let decision = handle.await.unwrap().unwrap();
        assert!(matches!(decision, Decision::Approve));
    }

    #[tokio::test]
    async fn redelivering_after_success_returns_no_waiter() {
        let registry = InterruptRegistry::new();
        let registry_clone = registry.clone();
        let deadline = now_ms() + 5_000;
        let handle = tokio::spawn(async move {
            registry_clone.wait("t1", &approve_only(), deadline).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        registry.deliver("t1", Decision::Approve).await.unwrap();
        handle.await.unwrap().unwrap();
        let second = registry.deliver("t1", Decision::Approve).await;
        assert_eq!(second, Err(DeliverError::NoWaiter));
    }
}
