//! The single-threaded cooperative decision loop.
//!
//! One task owns every piece of mutable state. Per consumed tick the order
//! is fixed: market-view update, Layer-1 checks, scheduled jobs by priority,
//! exit management, entry evaluation, then advisory completions. Advisory
//! calls themselves run detached and are only ever consumed here.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use kawase_broker::{BrokerGateway, CloseRequest, OpenRequest};
use kawase_core::{
    CloseReason, Escalation, EscalationTrigger, EventPayload, IndicatorVector, OhlcBar,
    PositionId, Price, Severity, SymbolInfo, Tick, Timeframe, VerdictAction, Volume,
};
use kawase_market::{MarketView, TickOutcome};
use kawase_rules::{ExitAction, RuleStore, StructuredRule};

use crate::advisory::{position_snapshot, Advisory};
use crate::book::{BookError, CloseOutcome, OpenParams, PositionBook};
use crate::clock::{broker_time, in_weekend, BrokerTime, EngineClock};
use crate::evaluator::{
    evaluate_entry, evaluate_exits, EntryContext, EntryRejection, ExitContext, ExitStep,
};
use crate::metrics::{EngineMetrics, MetricsSnapshot};
use crate::monitor::{scan_emergencies, CompletedReview, Layer2Monitor, Layer3Coordinator, ReviewOrigin};
use crate::sched::{JobKind, Scheduler};
use crate::settings::EngineSettings;
use crate::sink::{EventJournal, EventSink, SinkError};
use crate::ExitCode;

/// Inputs fed to the engine loop by the embedder.
#[derive(Debug)]
pub enum EngineInput {
    Tick(Tick),
    BarClose {
        timeframe: Timeframe,
        bar: OhlcBar,
        indicators: IndicatorVector,
    },
    Rule(Box<StructuredRule>),
    Shutdown,
}

/// Cheap point-in-time status surface.
#[derive(Clone, Debug)]
pub struct EngineStatus {
    pub open_positions: usize,
    pub realized_pnl: Price,
    pub degraded: bool,
    pub entries_blocked: Option<String>,
    pub last_tick_at: Option<DateTime<Utc>>,
    pub metrics: MetricsSnapshot,
}

/// Process-wide engine value owning the market view, rule history and
/// position book. Everything mutates through `&mut self` on one task.
pub struct Engine {
    settings: EngineSettings,
    clock: EngineClock,
    view: MarketView,
    rules: RuleStore,
    book: PositionBook,
    gateway: Arc<dyn BrokerGateway>,
    symbol_info: SymbolInfo,
    journal: EventJournal,
    sched: Scheduler,
    layer2: Layer2Monitor,
    layer3: Layer3Coordinator,
    metrics: Arc<EngineMetrics>,
    degraded: bool,
    sink_closed: bool,
    entries_blocked: Option<String>,
    prev_mid: Option<Price>,
}

impl Engine {
    pub fn new(
        settings: EngineSettings,
        gateway: Arc<dyn BrokerGateway>,
        advisory: Arc<dyn Advisory>,
        sink: Box<dyn EventSink>,
        clock: EngineClock,
    ) -> Self {
        let symbol_info = gateway.symbol_info();
        let view = MarketView::new(
            settings.symbol.clone(),
            settings.pip_scale,
            settings.staleness_threshold,
        );
        let mut sched = Scheduler::new(settings.broker_offset);
        sched.register_periodic(JobKind::Layer1, settings.layer1_period, chrono::Duration::zero());
        sched.register_periodic(
            JobKind::Layer2Minute,
            settings.layer2a_period,
            chrono::Duration::zero(),
        );
        sched.register_periodic(
            JobKind::Layer2FiveMinute,
            settings.layer2b_period,
            chrono::Duration::zero(),
        );
        sched.register_periodic(
            JobKind::Layer3Periodic,
            settings.layer3a_period,
            chrono::Duration::zero(),
        );
        sched.register_daily(JobKind::DailyForceClose, settings.daily_close);
        for checkpoint in &settings.checkpoints {
            sched.register_daily(JobKind::DailyCheckpoint(*checkpoint), *checkpoint);
        }
        let layer2 = Layer2Monitor::new(&settings.safety);
        let layer3 = Layer3Coordinator::new(
            advisory,
            settings.advisory_periodic_timeout,
            settings.advisory_emergency_timeout,
            settings.coalesce_window,
        );
        Self {
            rules: RuleStore::new(settings.symbol.clone()),
            view,
            sched,
            layer2,
            layer3,
            settings,
            clock,
            book: PositionBook::new(),
            gateway,
            symbol_info,
            journal: EventJournal::new(sink),
            metrics: Arc::new(EngineMetrics::default()),
            degraded: false,
            sink_closed: false,
            entries_blocked: None,
            prev_mid: None,
        }
    }

    #[must_use]
    pub fn metrics(&self) -> Arc<EngineMetrics> {
        self.metrics.clone()
    }

    #[must_use]
    pub fn book(&self) -> &PositionBook {
        &self.book
    }

    #[must_use]
    pub fn status(&self) -> EngineStatus {
        EngineStatus {
            open_positions: self.book.count(),
            realized_pnl: self.book.realized_pnl(),
            degraded: self.degraded,
            entries_blocked: self.entries_blocked.clone(),
            last_tick_at: self.view.tick().map(|tick| tick.time),
            metrics: self.metrics.snapshot(),
        }
    }

    /// Clear an operator-level entry suppression after manual review.
    pub fn acknowledge_operator(&mut self) {
        if self.entries_blocked.take().is_some() {
            info!("operator acknowledgement received; entries re-enabled");
        }
        if !self.sink_closed {
            self.degraded = self.journal.is_backlogged();
        }
    }

    /// Drive the engine from an input channel until shutdown.
    pub async fn run(&mut self, mut inputs: mpsc::Receiver<EngineInput>) -> ExitCode {
        info!(symbol = %self.settings.symbol, gateway = %self.gateway.name(), "engine loop started");
        while let Some(input) = inputs.recv().await {
            match input {
                EngineInput::Tick(tick) => self.on_tick(tick).await,
                EngineInput::BarClose {
                    timeframe,
                    bar,
                    indicators,
                } => self.on_bar_close(timeframe, bar, indicators).await,
                EngineInput::Rule(rule) => self.install_rule(*rule),
                EngineInput::Shutdown => break,
            }
        }
        self.shutdown().await
    }

    /// Install a structured rule, emitting the acceptance or rejection.
    pub fn install_rule(&mut self, rule: StructuredRule) {
        let version = rule.version;
        let at = self.clock.now();
        match self.rules.install(rule) {
            Ok(active) => {
                info!(version = active.version, valid_until = %active.valid_until, "rule activated");
                self.record(
                    at,
                    EventPayload::RuleActivated {
                        version,
                        accepted: true,
                        reason: None,
                    },
                );
            }
            Err(err) => {
                warn!(version, %err, "rule rejected");
                self.record(
                    at,
                    EventPayload::RuleActivated {
                        version,
                        accepted: false,
                        reason: Some(err.to_string()),
                    },
                );
            }
        }
    }

    /// Per-tick pipeline; the fixed intra-step order lives here.
    pub async fn on_tick(&mut self, tick: Tick) {
        self.clock.observe(tick.time);
        self.gateway.on_quote(&tick);
        match self.view.update_tick(tick) {
            Ok(TickOutcome::Applied) => EngineMetrics::bump(&self.metrics.ticks_consumed),
            Ok(TickOutcome::Duplicate) => {
                EngineMetrics::bump(&self.metrics.ticks_duplicate);
                return;
            }
            Ok(TickOutcome::OutOfOrder) => {
                EngineMetrics::bump(&self.metrics.ticks_out_of_order);
                return;
            }
            Err(err) => {
                warn!(%err, "rejected tick at the boundary");
                return;
            }
        }
        let now = self.clock.now();
        if let Some(mid) = self.view.mid() {
            self.book.observe_price(mid, self.settings.pip_scale);
        }
        self.layer1_pass().await;
        self.run_due_jobs(now).await;
        self.manage_exits(false).await;
        self.maybe_enter_on_zone_cross().await;
        self.consume_advisory().await;
        self.prev_mid = self.view.mid();
    }

    /// Bar-close pipeline: refresh the view, then run the bar-scoped
    /// evaluations for M15.
    pub async fn on_bar_close(
        &mut self,
        timeframe: Timeframe,
        bar: OhlcBar,
        indicators: IndicatorVector,
    ) {
        self.clock.observe(bar.time + timeframe.as_duration());
        if let Err(err) = self.view.update_bars(timeframe, bar) {
            warn!(%err, %timeframe, "rejected bar at the boundary");
            return;
        }
        self.view.update_indicators(indicators);
        let now = self.clock.now();
        self.run_due_jobs(now).await;
        if timeframe == Timeframe::M15 {
            self.manage_exits(true).await;
            self.try_enter().await;
        }
        self.consume_advisory().await;
    }

    // -----------------------------------------------------------------------
    // Layer-1
    // -----------------------------------------------------------------------

    async fn layer1_pass(&mut self) {
        EngineMetrics::bump(&self.metrics.layer1_runs);
        let hits = scan_emergencies(
            &self.view,
            self.book.iter(),
            &self.settings.safety,
            self.symbol_info.contract_size,
        );
        for hit in hits {
            EngineMetrics::bump(&self.metrics.layer1_closes);
            error!(position = %hit.position_id, reason = %hit.reason, "emergency close");
            self.close_remaining(hit.position_id, hit.reason, false).await;
        }
    }

    // -----------------------------------------------------------------------
    // Scheduled jobs
    // -----------------------------------------------------------------------

    async fn run_due_jobs(&mut self, now: DateTime<Utc>) {
        for kind in self.sched.due(now) {
            if let Err(err) = self.run_job(kind, now).await {
                EngineMetrics::bump(&self.metrics.jobs_failed);
                warn!(job = %kind.label(), %err, "scheduled job failed");
                self.record(
                    now,
                    EventPayload::JobFailed {
                        job: kind.label(),
                        error: err.to_string(),
                    },
                );
            }
        }
    }

    async fn run_job(&mut self, kind: JobKind, now: DateTime<Utc>) -> anyhow::Result<()> {
        match kind {
            JobKind::Layer1 => {
                // Emergency checks run on every tick ingest; the cadence job
                // only accounts for the windows with no usable data.
                let too_old = self
                    .view
                    .last_tick_age(now)
                    .map_or(true, |age| age > self.settings.safety.layer1_max_tick_age);
                if too_old {
                    EngineMetrics::bump(&self.metrics.layer1_skipped);
                }
            }
            JobKind::Layer2Minute => {
                let escalations = self.layer2.minute_checks(&self.view, self.book.iter(), now);
                self.dispatch_escalations(escalations, now);
            }
            JobKind::Layer2FiveMinute => {
                let escalations = self
                    .layer2
                    .five_minute_checks(&self.view, self.book.iter(), now);
                self.dispatch_escalations(escalations, now);
            }
            JobKind::Layer3Periodic => {
                for position in self.book.iter() {
                    let snapshot = position_snapshot(
                        position,
                        &self.view,
                        now,
                        self.symbol_info.contract_size,
                    );
                    self.layer3.request_periodic(snapshot);
                }
            }
            JobKind::DailyForceClose => {
                let local = self.broker_local(now);
                let reason = if in_weekend(local, self.settings.weekend_start, self.settings.weekend_end)
                {
                    CloseReason::WeekendClose
                } else {
                    CloseReason::ForceCloseTime
                };
                self.force_close_all(reason).await;
            }
            JobKind::DailyCheckpoint(at) => {
                self.record(
                    now,
                    EventPayload::DailyCheckpoint {
                        label: at.format("%H:%M").to_string(),
                    },
                );
            }
        }
        Ok(())
    }

    fn dispatch_escalations(&mut self, escalations: Vec<Escalation>, now: DateTime<Utc>) {
        for escalation in escalations {
            EngineMetrics::bump(&self.metrics.escalations);
            info!(trigger = %escalation.trigger, position = ?escalation.position_id, "anomaly escalation");
            self.record(
                now,
                EventPayload::Layer2Trigger {
                    escalation: escalation.clone(),
                },
            );
            let Some(position_id) = escalation.position_id else {
                continue;
            };
            let Some(position) = self.book.get(position_id) else {
                continue;
            };
            let snapshot =
                position_snapshot(position, &self.view, now, self.symbol_info.contract_size);
            self.layer3.submit_escalation(escalation, snapshot, now);
        }
    }

    // -----------------------------------------------------------------------
    // Advisory completions
    // -----------------------------------------------------------------------

    async fn consume_advisory(&mut self) {
        let completed = self.layer3.poll();
        if completed.is_empty() {
            return;
        }
        let now = self.clock.now();
        // Emit every verdict, then apply at most the most protective action
        // per position.
        let mut chosen: BTreeMap<PositionId, CompletedReview> = BTreeMap::new();
        for review in completed {
            if review.defaulted {
                EngineMetrics::bump(&self.metrics.advisory_timeouts);
            }
            let payload = match &review.origin {
                ReviewOrigin::Periodic => EventPayload::Layer3aVerdict {
                    position_id: review.position_id,
                    verdict: review.verdict.clone(),
                },
                ReviewOrigin::Emergency { trigger } => EventPayload::Layer3bVerdict {
                    position_id: review.position_id,
                    trigger: trigger.clone(),
                    verdict: review.verdict.clone(),
                },
            };
            self.record(now, payload);
            match chosen.entry(review.position_id) {
                std::collections::btree_map::Entry::Vacant(slot) => {
                    slot.insert(review);
                }
                std::collections::btree_map::Entry::Occupied(mut slot) => {
                    if review.verdict.action.severity_rank()
                        > slot.get().verdict.action.severity_rank()
                    {
                        slot.insert(review);
                    }
                }
            }
        }
        for (position_id, review) in chosen {
            self.apply_verdict(position_id, review, now).await;
        }
    }

    async fn apply_verdict(
        &mut self,
        position_id: PositionId,
        review: CompletedReview,
        now: DateTime<Utc>,
    ) {
        if self.book.get(position_id).is_none() {
            return;
        }
        match review.verdict.action {
            VerdictAction::Continue => {}
            VerdictAction::ClosePartial { partial_close_pct } => {
                let Some(position) = self.book.get(position_id) else {
                    return;
                };
                let requested =
                    position.volume_remaining * partial_close_pct / Decimal::from(100);
                let volume = self
                    .symbol_info
                    .normalize_volume(requested)
                    .min(position.volume_remaining);
                if volume > Decimal::ZERO {
                    self.close_volume(position_id, volume, CloseReason::AdvisoryClose, None, false)
                        .await;
                }
            }
            VerdictAction::CloseAll => {
                let reason = if review.defaulted {
                    CloseReason::AdvisoryTimeout
                } else {
                    CloseReason::AdvisoryClose
                };
                self.close_remaining(position_id, reason, false).await;
            }
            VerdictAction::TightenStop { new_stop_pips } => {
                let Some(position) = self.book.get(position_id) else {
                    return;
                };
                let Some(mid) = self.view.mid() else {
                    return;
                };
                let distance =
                    kawase_core::pips_to_price(new_stop_pips, self.settings.pip_scale);
                let stop = match position.direction {
                    kawase_core::Direction::Buy => mid - distance,
                    kawase_core::Direction::Sell => mid + distance,
                };
                match self.book.tighten_placed_stop(position_id, stop) {
                    Ok(true) => {
                        if let Err(err) = self.gateway.modify_stop(position_id, stop).await {
                            warn!(position = %position_id, %err, "failed to push tightened stop");
                        }
                    }
                    Ok(false) => {}
                    Err(err) => self.abort_on_invariant(err).await,
                }
            }
            VerdictAction::Escalate => {
                let escalation = Escalation {
                    at: now,
                    severity: review.verdict.severity.unwrap_or(Severity::High),
                    trigger: EscalationTrigger::AdvisoryEscalate,
                    position_id: Some(position_id),
                };
                if let Some(position) = self.book.get(position_id) {
                    let snapshot =
                        position_snapshot(position, &self.view, now, self.symbol_info.contract_size);
                    self.layer3.submit_escalation(escalation, snapshot, now);
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Entries
    // -----------------------------------------------------------------------

    async fn maybe_enter_on_zone_cross(&mut self) {
        let Some(mid) = self.view.mid() else {
            return;
        };
        let now = self.clock.now();
        let Some(rule) = self.rules.current(now) else {
            return;
        };
        let Some(zone) = rule.entry_conditions.price_zone else {
            return;
        };
        let was_inside = self.prev_mid.is_some_and(|prev| zone.contains(prev));
        if zone.contains(mid) && !was_inside {
            self.try_enter().await;
        }
    }

    async fn try_enter(&mut self) {
        if self.degraded {
            return;
        }
        if let Some(reason) = &self.entries_blocked {
            debug!(%reason, "entries suppressed");
            return;
        }
        let now = self.clock.now();
        let local = self.broker_local(now);
        if in_weekend(local, self.settings.weekend_start, self.settings.weekend_end) {
            return;
        }
        // Rule-expired mode: no new entries, everything else keeps running.
        let Some(rule) = self.rules.current(now) else {
            return;
        };
        let account = match self.gateway.account_info().await {
            Ok(account) => account,
            Err(err) => {
                warn!(%err, "account info unavailable; skipping entry");
                return;
            }
        };
        let plan = {
            let ctx = EntryContext {
                rule: &rule,
                view: &self.view,
                staleness: self.view.staleness(now),
                open_positions: self.book.count(),
                broker_local: local.time,
                account: &account,
                symbol_info: &self.symbol_info,
                base_lot: self.settings.base_lot,
                insurance_equity_pct: self.settings.safety.insurance_equity_pct,
            };
            match evaluate_entry(&ctx) {
                Ok(plan) => plan,
                Err(rejection) => {
                    EngineMetrics::bump(&self.metrics.entries_rejected);
                    debug!(%rejection, "entry rejected");
                    return;
                }
            }
        };
        match self.gateway.can_afford(plan.direction, plan.volume).await {
            Ok(true) => {}
            Ok(false) => {
                EngineMetrics::bump(&self.metrics.entries_rejected);
                debug!("{}", EntryRejection::InsufficientMargin);
                return;
            }
            Err(err) => {
                warn!(%err, "margin dry-run failed; skipping entry");
                return;
            }
        }
        let Some(tick) = self.view.tick() else {
            return;
        };
        let estimate = match plan.direction {
            kawase_core::Direction::Buy => tick.ask,
            kawase_core::Direction::Sell => tick.bid,
        };
        let request = OpenRequest {
            symbol: self.settings.symbol.clone(),
            direction: plan.direction,
            volume: plan.volume,
            stop_loss: Some(plan.placed_stop(estimate)),
        };
        match self.gateway.market_open(request).await {
            Ok(fill) => {
                let placed_sl = plan.placed_stop(fill.price);
                let insurance_sl = plan.insurance_stop(fill.price);
                let id = self
                    .book
                    .open_position(OpenParams {
                        symbol: self.settings.symbol.clone(),
                        direction: plan.direction,
                        opened_at: fill.executed_at,
                        open_price: fill.price,
                        volume: fill.volume,
                        insurance_sl,
                        placed_sl,
                        equity_at_open: account.equity,
                        rule_snapshot: rule.clone(),
                    })
                    .id;
                EngineMetrics::bump(&self.metrics.entries_executed);
                info!(position = %id, direction = %plan.direction, price = %fill.price, volume = %fill.volume, "entry executed");
                self.record(
                    fill.executed_at,
                    EventPayload::EntryExecuted {
                        position_id: id,
                        direction: plan.direction,
                        price: fill.price,
                        volume: fill.volume,
                    },
                );
                // Re-anchor the resting stop on the actual fill price.
                if let Err(err) = self.gateway.modify_stop(id, placed_sl).await {
                    warn!(position = %id, %err, "failed to place protective stop");
                }
            }
            Err(err) if err.is_fatal_for_entries() => {
                error!(%err, "fatal gateway rejection; suppressing further entries");
                self.entries_blocked = Some(err.to_string());
            }
            Err(err) => {
                warn!(%err, "entry order failed");
                EngineMetrics::bump(&self.metrics.entries_rejected);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Exits
    // -----------------------------------------------------------------------

    async fn manage_exits(&mut self, bar_closed: bool) {
        let now = self.clock.now();
        let local = self.broker_local(now);
        for id in self.book.ids() {
            let steps = {
                let Some(position) = self.book.get(id) else {
                    continue;
                };
                evaluate_exits(&ExitContext {
                    position,
                    view: &self.view,
                    now,
                    broker_local: local.time,
                    bar_closed,
                })
            };
            for step in steps {
                if self.book.get(id).is_none() {
                    break;
                }
                match step {
                    ExitStep::AdvanceTrailing { stop } => match self.book.advance_trailing(id, stop)
                    {
                        Ok(true) => {
                            if let Err(err) = self.gateway.modify_stop(id, stop).await {
                                warn!(position = %id, %err, "failed to push trailing stop");
                            }
                        }
                        Ok(false) => {}
                        Err(err) => self.abort_on_invariant(err).await,
                    },
                    ExitStep::LadderClose { level, fraction } => {
                        let Some(position) = self.book.get(id) else {
                            break;
                        };
                        let requested = position.volume_initial * fraction;
                        let volume = self
                            .symbol_info
                            .normalize_volume(requested)
                            .min(position.volume_remaining);
                        if volume.is_zero() {
                            debug!(position = %id, level, "ladder volume rounds to zero");
                            continue;
                        }
                        self.close_volume(id, volume, CloseReason::TakeProfit, Some(level), false)
                            .await;
                    }
                    ExitStep::IndicatorClose { action } => {
                        let Some(position) = self.book.get(id) else {
                            break;
                        };
                        match action {
                            ExitAction::CloseAll => {
                                self.close_remaining(id, CloseReason::IndicatorExit, false).await;
                            }
                            partial => {
                                let requested = position.volume_initial * partial.fraction();
                                let volume = self
                                    .symbol_info
                                    .normalize_volume(requested)
                                    .min(position.volume_remaining);
                                if volume > Decimal::ZERO {
                                    self.close_volume(
                                        id,
                                        volume,
                                        CloseReason::IndicatorExit,
                                        None,
                                        false,
                                    )
                                    .await;
                                }
                            }
                        }
                    }
                    ExitStep::FullClose { reason } => {
                        self.close_remaining(id, reason, false).await;
                    }
                }
            }
        }
    }

    /// Close all open positions unconditionally (daily or weekend boundary).
    async fn force_close_all(&mut self, reason: CloseReason) {
        for id in self.book.ids() {
            self.close_remaining(id, reason, true).await;
        }
    }

    /// Close the full remaining volume of one position.
    async fn close_remaining(&mut self, id: PositionId, reason: CloseReason, forced: bool) -> bool {
        let Some(position) = self.book.get(id) else {
            return false;
        };
        let volume = position.volume_remaining;
        self.close_volume(id, volume, reason, None, forced).await
    }

    /// Route a close through the gateway and the book, emitting exactly one
    /// event for the order result. Returns true when the position is gone.
    async fn close_volume(
        &mut self,
        id: PositionId,
        volume: Volume,
        reason: CloseReason,
        level: Option<usize>,
        forced: bool,
    ) -> bool {
        let Some(position) = self.book.get(id) else {
            return false;
        };
        let request = CloseRequest {
            position_id: id,
            symbol: position.symbol.clone(),
            direction: position.direction,
            volume,
            open_price: position.open_price,
            opened_at: position.opened_at,
        };
        match self.gateway.close(request).await {
            Ok(fill) => {
                let outcome =
                    self.book
                        .apply_close(id, fill.volume, fill.price, self.symbol_info.contract_size);
                match outcome {
                    Ok(CloseOutcome::Closed) => {
                        self.layer2.forget(id);
                        let now = fill.executed_at;
                        let payload = if forced {
                            EventPayload::ForceClose {
                                position_id: id,
                                price: fill.price,
                                volume: fill.volume,
                                reason,
                            }
                        } else {
                            EventPayload::FullClose {
                                position_id: id,
                                price: fill.price,
                                volume: fill.volume,
                                reason,
                            }
                        };
                        self.record(now, payload);
                        true
                    }
                    Ok(CloseOutcome::Reduced) => {
                        self.record(
                            fill.executed_at,
                            EventPayload::PartialClose {
                                position_id: id,
                                price: fill.price,
                                volume: fill.volume,
                                reason,
                                level,
                            },
                        );
                        if let Some(level) = level {
                            if let Err(err) = self.book.mark_tp_executed(id, level) {
                                self.note_invariant(&err);
                            }
                        }
                        false
                    }
                    Err(err) => {
                        // No flatten from here: the outer pipeline observes
                        // the degradation and stops issuing new work.
                        self.note_invariant(&err);
                        false
                    }
                }
            }
            Err(err) => {
                // A failed close is catastrophic: degrade and wait for the
                // operator.
                error!(position = %id, %err, "close order failed");
                let now = self.clock.now();
                self.record(
                    now,
                    EventPayload::EmergencyStop {
                        reason: format!("close_failed: {err}"),
                    },
                );
                self.entries_blocked = Some("close_failed".to_string());
                self.degraded = true;
                false
            }
        }
    }

    /// Record a state-corruption emergency stop and degrade the engine.
    fn note_invariant(&mut self, err: &BookError) {
        error!(%err, "position-state invariant violated");
        let now = self.clock.now();
        self.record(
            now,
            EventPayload::EmergencyStop {
                reason: format!("invariant: {err}"),
            },
        );
        self.degraded = true;
        self.entries_blocked = Some("invariant_violation".to_string());
    }

    /// Corrupted position state: emit the emergency stop and flatten
    /// best-effort.
    async fn abort_on_invariant(&mut self, err: BookError) {
        self.note_invariant(&err);
        for id in self.book.ids() {
            let _ = self
                .close_remaining(id, CloseReason::InvariantViolation, false)
                .await;
        }
    }

    // -----------------------------------------------------------------------
    // Shutdown
    // -----------------------------------------------------------------------

    /// Finish the current step, drain due work within a bounded budget and
    /// report the exit code.
    pub async fn shutdown(&mut self) -> ExitCode {
        info!("engine shutting down");
        let now = self.clock.now();
        let drained = tokio::time::timeout(std::time::Duration::from_secs(5), async {
            self.run_due_jobs(now).await;
            self.consume_advisory().await;
        })
        .await;
        if drained.is_err() {
            warn!("job drain budget exhausted during shutdown");
        }
        // Reviews still in flight have unknown outcomes and need external
        // reconciliation.
        if self.layer3.pending_count() > 0 {
            for _ in 0..self.layer3.pending_count() {
                self.record(
                    now,
                    EventPayload::UnknownOutcome {
                        position_id: None,
                        detail: "advisory review in flight at shutdown".to_string(),
                    },
                );
            }
        }
        self.journal.flush_backlog();
        if self.sink_closed {
            ExitCode::BrokerFailure
        } else if self.degraded || self.entries_blocked.is_some() {
            ExitCode::DegradedShutdown
        } else {
            ExitCode::Normal
        }
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn broker_local(&self, at: DateTime<Utc>) -> BrokerTime {
        broker_time(at, self.settings.broker_offset)
    }

    fn record(&mut self, at: DateTime<Utc>, payload: EventPayload) {
        match self.journal.record(at, payload) {
            Ok(_) => {}
            Err(SinkError::Overflow) => {
                EngineMetrics::bump(&self.metrics.sink_overflows);
                if !self.degraded {
                    warn!("event sink exhausted; engine degraded (no new entries)");
                }
                self.degraded = true;
            }
            Err(SinkError::Closed) => {
                error!("event sink closed; engine cannot persist decisions");
                self.sink_closed = true;
                self.degraded = true;
            }
        }
    }
}
