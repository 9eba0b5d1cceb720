//! Layer-3: periodic re-evaluation and event-driven emergency review.
//!
//! Advisory calls run as detached tasks so the engine loop never blocks on
//! the oracle; completions are consumed on a later loop iteration. A call
//! that fails or times out resolves to the layer's safe default: `continue`
//! for the periodic review, `close_all` for an emergency already flagged by
//! the anomaly layer.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use kawase_core::{Escalation, PositionId, PositionSnapshot, Severity, Verdict};

use crate::advisory::{Advisory, AdvisoryError};

/// Where a completed review came from.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ReviewOrigin {
    Periodic,
    Emergency { trigger: String },
}

/// A review whose verdict is ready to be applied.
#[derive(Clone, Debug)]
pub struct CompletedReview {
    pub position_id: PositionId,
    pub origin: ReviewOrigin,
    pub verdict: Verdict,
    /// True when the verdict is the safe default after a failure or timeout.
    pub defaulted: bool,
}

struct PendingReview {
    position_id: PositionId,
    origin: ReviewOrigin,
    rx: oneshot::Receiver<Result<Verdict, AdvisoryError>>,
}

/// Owns the advisory request lifecycle for both cadences.
pub struct Layer3Coordinator {
    advisory: Arc<dyn Advisory>,
    periodic_timeout: std::time::Duration,
    emergency_timeout: std::time::Duration,
    coalesce_window: Duration,
    recent_triggers: HashMap<(Option<PositionId>, &'static str), DateTime<Utc>>,
    pending: Vec<PendingReview>,
}

impl Layer3Coordinator {
    pub fn new(
        advisory: Arc<dyn Advisory>,
        periodic_timeout: std::time::Duration,
        emergency_timeout: std::time::Duration,
        coalesce_window: Duration,
    ) -> Self {
        Self {
            advisory,
            periodic_timeout,
            emergency_timeout,
            coalesce_window,
            recent_triggers: HashMap::new(),
            pending: Vec::new(),
        }
    }

    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Launch a periodic review for one position.
    pub fn request_periodic(&mut self, snapshot: PositionSnapshot) {
        let position_id = snapshot.position_id;
        let (tx, rx) = oneshot::channel();
        let advisory = self.advisory.clone();
        let budget = self.periodic_timeout;
        tokio::spawn(async move {
            let result = match tokio::time::timeout(budget, advisory.periodic(snapshot)).await {
                Ok(result) => result,
                Err(_) => Err(AdvisoryError::Timeout),
            };
            let _ = tx.send(result);
        });
        self.pending.push(PendingReview {
            position_id,
            origin: ReviewOrigin::Periodic,
            rx,
        });
    }

    /// Launch an emergency review for an escalation. Identical consecutive
    /// triggers inside the coalescing window are dropped; returns whether
    /// the request was actually dispatched.
    pub fn submit_escalation(
        &mut self,
        escalation: Escalation,
        snapshot: PositionSnapshot,
        now: DateTime<Utc>,
    ) -> bool {
        let key = (escalation.position_id, escalation.trigger.key());
        if let Some(last) = self.recent_triggers.get(&key) {
            if now - *last < self.coalesce_window {
                debug!(trigger = escalation.trigger.key(), "escalation coalesced");
                return false;
            }
        }
        self.recent_triggers.insert(key, now);

        let position_id = snapshot.position_id;
        let trigger_label = escalation.trigger.key().to_string();
        let (tx, rx) = oneshot::channel();
        let advisory = self.advisory.clone();
        let budget = self.emergency_timeout;
        tokio::spawn(async move {
            let result =
                match tokio::time::timeout(budget, advisory.emergency(snapshot, escalation)).await {
                    Ok(result) => result,
                    Err(_) => Err(AdvisoryError::Timeout),
                };
            let _ = tx.send(result);
        });
        self.pending.push(PendingReview {
            position_id,
            origin: ReviewOrigin::Emergency {
                trigger: trigger_label,
            },
            rx,
        });
        true
    }

    /// Collect every finished review, substituting the safe default where
    /// the oracle failed. Non-blocking.
    pub fn poll(&mut self) -> Vec<CompletedReview> {
        let mut completed = Vec::new();
        let mut still_pending = Vec::new();
        for mut review in self.pending.drain(..) {
            match review.rx.try_recv() {
                Ok(Ok(verdict)) => completed.push(CompletedReview {
                    position_id: review.position_id,
                    origin: review.origin,
                    verdict,
                    defaulted: false,
                }),
                Ok(Err(err)) => {
                    warn!(position = %review.position_id, %err, "advisory failed; applying safe default");
                    completed.push(Self::defaulted(review.position_id, review.origin));
                }
                Err(oneshot::error::TryRecvError::Empty) => still_pending.push(review),
                Err(oneshot::error::TryRecvError::Closed) => {
                    warn!(position = %review.position_id, "advisory task vanished; applying safe default");
                    completed.push(Self::defaulted(review.position_id, review.origin));
                }
            }
        }
        self.pending = still_pending;
        completed
    }

    /// Unknown risk on an already-flagged anomaly resolves to protection of
    /// capital; an unremarkable periodic review just carries on.
    fn defaulted(position_id: PositionId, origin: ReviewOrigin) -> CompletedReview {
        let verdict = match &origin {
            ReviewOrigin::Periodic => Verdict::continue_with("advisory unavailable"),
            ReviewOrigin::Emergency { .. } => {
                Verdict::close_all("advisory timeout", Severity::Critical)
            }
        };
        CompletedReview {
            position_id,
            origin,
            verdict,
            defaulted: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use kawase_core::{Direction, EscalationTrigger, VerdictAction};

    struct CannedAdvisory {
        verdict: Verdict,
    }

    #[async_trait]
    impl Advisory for CannedAdvisory {
        async fn periodic(&self, _snapshot: PositionSnapshot) -> Result<Verdict, AdvisoryError> {
            Ok(self.verdict.clone())
        }

        async fn emergency(
            &self,
            _snapshot: PositionSnapshot,
            _escalation: Escalation,
        ) -> Result<Verdict, AdvisoryError> {
            Ok(self.verdict.clone())
        }
    }

    struct SilentAdvisory;

    #[async_trait]
    impl Advisory for SilentAdvisory {
        async fn periodic(&self, _snapshot: PositionSnapshot) -> Result<Verdict, AdvisoryError> {
            std::future::pending().await
        }

        async fn emergency(
            &self,
            _snapshot: PositionSnapshot,
            _escalation: Escalation,
        ) -> Result<Verdict, AdvisoryError> {
            std::future::pending().await
        }
    }

    fn snapshot(id: u64) -> PositionSnapshot {
        PositionSnapshot {
            position_id: PositionId(id),
            symbol: "USDJPY".into(),
            direction: Direction::Buy,
            open_price: "149.60".parse().unwrap(),
            open_time: Utc::now(),
            current_price: "149.62".parse().unwrap(),
            unrealized_pips: "2".parse().unwrap(),
            unrealized_pct: "0.01".parse().unwrap(),
            holding_minutes: 12,
            recent_indicators: kawase_core::RecentIndicators {
                rsi_h1: None,
                ema_h1_alignment: kawase_core::EmaAlignment::Unknown,
                macd_h1_histogram: None,
            },
            last_bars_m15: Vec::new(),
        }
    }

    fn escalation(at: DateTime<Utc>) -> Escalation {
        Escalation {
            at,
            severity: Severity::High,
            trigger: EscalationTrigger::CriticalSupportBroken {
                level: "149.40".parse().unwrap(),
            },
            position_id: Some(PositionId(1)),
        }
    }

    fn coordinator(advisory: Arc<dyn Advisory>) -> Layer3Coordinator {
        Layer3Coordinator::new(
            advisory,
            std::time::Duration::from_secs(3),
            std::time::Duration::from_secs(10),
            Duration::seconds(60),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_verdict_flows_through() {
        let mut coordinator = coordinator(Arc::new(CannedAdvisory {
            verdict: Verdict::continue_with("healthy"),
        }));
        coordinator.request_periodic(snapshot(1));
        tokio::task::yield_now().await;
        let completed = coordinator.poll();
        assert_eq!(completed.len(), 1);
        assert!(!completed[0].defaulted);
        assert_eq!(completed[0].verdict.action, VerdictAction::Continue);
    }

    #[tokio::test(start_paused = true)]
    async fn emergency_timeout_defaults_to_close_all() {
        let mut coordinator = coordinator(Arc::new(SilentAdvisory));
        let now = Utc::now();
        assert!(coordinator.submit_escalation(escalation(now), snapshot(1), now));
        // Let the detached call register its timeout before advancing time.
        tokio::task::yield_now().await;
        tokio::time::advance(std::time::Duration::from_secs(11)).await;
        tokio::task::yield_now().await;
        let completed = coordinator.poll();
        assert_eq!(completed.len(), 1);
        assert!(completed[0].defaulted);
        assert_eq!(completed[0].verdict.action, VerdictAction::CloseAll);
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_timeout_defaults_to_continue() {
        let mut coordinator = coordinator(Arc::new(SilentAdvisory));
        coordinator.request_periodic(snapshot(1));
        tokio::task::yield_now().await;
        tokio::time::advance(std::time::Duration::from_secs(4)).await;
        tokio::task::yield_now().await;
        let completed = coordinator.poll();
        assert_eq!(completed.len(), 1);
        assert!(completed[0].defaulted);
        assert_eq!(completed[0].verdict.action, VerdictAction::Continue);
    }

    #[tokio::test(start_paused = true)]
    async fn identical_triggers_coalesce_inside_the_window() {
        let mut coordinator = coordinator(Arc::new(CannedAdvisory {
            verdict: Verdict::continue_with("noted"),
        }));
        let now = Utc::now();
        assert!(coordinator.submit_escalation(escalation(now), snapshot(1), now));
        assert!(!coordinator.submit_escalation(
            escalation(now + Duration::seconds(30)),
            snapshot(1),
            now + Duration::seconds(30),
        ));
        assert!(coordinator.submit_escalation(
            escalation(now + Duration::seconds(90)),
            snapshot(1),
            now + Duration::seconds(90),
        ));
    }
}
