//! The data coordinator: the actor that owns all alarm mutation.
//!
//! Every create/update/delete and every recalculation decision runs on this
//! single task, so the per-alarm bookkeeping (`processing`, `deleting`, the
//! task registry) is never read mid-interleave. Calculations themselves run
//! in spawned tasks, concurrent across alarms but never for the same alarm
//! id, and post their result back as an internal message; all store writes
//! happen here.
//!
//! Two guards break the feedback loop between write-backs and
//! recalculation: updates flagged `skip_adjustment_calculation` never
//! launch a calculation, and the store event they emit carries
//! `skip_weather_refresh` so the refresh loop ignores it too.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local, Utc};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::alarm::{Alarm, AlarmAdjustment, Coordinate, ValidationError};
use crate::calc::{CalcError, CalculationOutcome, CalculationService};
use crate::error::{Error, Result};
use crate::limiter::RateLimiter;
use crate::notify::NotificationScheduler;
use crate::profile::UserProfile;
use crate::store::{AlarmStore, StoreEvent, UpdateMeta};
use crate::tracing::prelude::*;

/// How long a deleted id stays marked so late async callbacks see it as
/// gone without the mark leaking forever.
const DELETING_GRACE: Duration = Duration::from_secs(5);

/// A result computed for an occurrence this far from the alarm's current
/// one raced an edit and is discarded.
const STALE_RESULT_SLOP_SECS: i64 = 60;

const COMMAND_CHANNEL_CAPACITY: usize = 32;

/// Why a recalculation was declined without running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The alarm id is not in the store.
    Missing,
    /// The alarm is inside its post-deletion grace window.
    Deleting,
    /// A calculation for this alarm is already in flight.
    AlreadyProcessing,
    NotSmart,
    Disabled,
    RateLimited,
    NoFutureOccurrence,
    /// The result arrived for an occurrence the alarm no longer has.
    StaleResult,
}

/// Terminal state of one recalculation request.
#[derive(Debug, Clone)]
pub enum RecalcOutcome {
    /// A fresh adjustment was attached to the alarm.
    Adjusted(AlarmAdjustment),
    /// The calculation succeeded but the delta was under the noise floor.
    NoAdjustment,
    Skipped(SkipReason),
    /// The service call failed; the alarm was left untouched.
    Failed(String),
    Cancelled,
}

enum Command {
    CreateAlarm {
        alarm: Alarm,
        reply: oneshot::Sender<std::result::Result<Alarm, ValidationError>>,
    },
    UpdateAlarm {
        alarm: Alarm,
        skip_adjustment_calculation: bool,
        reply: oneshot::Sender<std::result::Result<(), ValidationError>>,
    },
    DeleteAlarm {
        alarm_id: Uuid,
        reply: oneshot::Sender<()>,
    },
    DeleteAll {
        reply: oneshot::Sender<usize>,
    },
    RecalculateAlarm {
        alarm_id: Uuid,
        force: bool,
        reply: oneshot::Sender<RecalcOutcome>,
    },
    RecalculateAll {
        reply: oneshot::Sender<usize>,
    },
    UpdateLocation {
        location: Option<Coordinate>,
        reply: oneshot::Sender<()>,
    },
}

enum Internal {
    CalcDone {
        alarm_id: Uuid,
        termination: Termination,
    },
    CleanupDeleting {
        alarm_id: Uuid,
    },
}

enum Termination {
    Finished(std::result::Result<CalculationOutcome, CalcError>),
    Cancelled,
}

struct TrackedTask {
    token: CancellationToken,
    /// Present when a caller is awaiting this calculation's outcome.
    reply: Option<oneshot::Sender<RecalcOutcome>>,
}

/// Cloneable handle the API, CLI wiring and refresh loop talk through.
#[derive(Clone)]
pub struct CoordinatorHandle {
    cmd_tx: mpsc::Sender<Command>,
}

impl CoordinatorHandle {
    async fn send<T>(
        &self,
        cmd: Command,
        rx: oneshot::Receiver<T>,
    ) -> Result<T> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|_| Error::Unavailable("coordinator is gone".into()))?;
        rx.await
            .map_err(|_| Error::Unavailable("coordinator dropped the reply".into()))
    }

    pub async fn create_alarm(&self, alarm: Alarm) -> Result<Alarm> {
        let (tx, rx) = oneshot::channel();
        let created = self.send(Command::CreateAlarm { alarm, reply: tx }, rx).await?;
        Ok(created?)
    }

    pub async fn update_alarm(
        &self,
        alarm: Alarm,
        skip_adjustment_calculation: bool,
    ) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        let updated = self
            .send(
                Command::UpdateAlarm {
                    alarm,
                    skip_adjustment_calculation,
                    reply: tx,
                },
                rx,
            )
            .await?;
        Ok(updated?)
    }

    pub async fn delete_alarm(&self, alarm_id: Uuid) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::DeleteAlarm { alarm_id, reply: tx }, rx).await
    }

    pub async fn delete_all(&self) -> Result<usize> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::DeleteAll { reply: tx }, rx).await
    }

    /// Request a recalculation; resolves when the calculation finishes
    /// (or is declined, failed or cancelled).
    pub async fn recalculate_alarm(&self, alarm_id: Uuid, force: bool) -> Result<RecalcOutcome> {
        let (tx, rx) = oneshot::channel();
        self.send(
            Command::RecalculateAlarm {
                alarm_id,
                force,
                reply: tx,
            },
            rx,
        )
        .await
    }

    pub async fn recalculate_all(&self) -> Result<usize> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::RecalculateAll { reply: tx }, rx).await
    }

    pub async fn update_location(&self, location: Option<Coordinate>) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::UpdateLocation { location, reply: tx }, rx).await
    }
}

pub struct Coordinator {
    store: Arc<AlarmStore>,
    limiter: Arc<RateLimiter>,
    calc: Arc<dyn CalculationService>,
    notifier: Arc<dyn NotificationScheduler>,
    profile: UserProfile,
    location: Option<Coordinate>,

    processing: HashSet<Uuid>,
    deleting: HashSet<Uuid>,
    tasks: HashMap<Uuid, TrackedTask>,

    cmd_tx: mpsc::Sender<Command>,
    cmd_rx: mpsc::Receiver<Command>,
    internal_tx: mpsc::Sender<Internal>,
    internal_rx: mpsc::Receiver<Internal>,
    batch_rx: mpsc::Receiver<Vec<Uuid>>,
    store_events: broadcast::Receiver<StoreEvent>,
}

impl Coordinator {
    pub fn new(
        store: Arc<AlarmStore>,
        limiter: Arc<RateLimiter>,
        calc: Arc<dyn CalculationService>,
        notifier: Arc<dyn NotificationScheduler>,
        profile: UserProfile,
        batch_rx: mpsc::Receiver<Vec<Uuid>>,
    ) -> (Self, CoordinatorHandle) {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (internal_tx, internal_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let store_events = store.subscribe();
        let handle = CoordinatorHandle {
            cmd_tx: cmd_tx.clone(),
        };
        let coordinator = Self {
            store,
            limiter,
            calc,
            notifier,
            profile,
            location: None,
            processing: HashSet::new(),
            deleting: HashSet::new(),
            tasks: HashMap::new(),
            cmd_tx,
            cmd_rx,
            internal_tx,
            internal_rx,
            batch_rx,
            store_events,
        };
        (coordinator, handle)
    }

    /// Run the actor until cancelled.
    pub async fn run(mut self, cancellation: CancellationToken) {
        // Restore notifications for whatever the store loaded; the daemon
        // may have restarted with alarms still pending.
        for alarm in self.store.list() {
            self.notifier.schedule_alarm(&alarm).await;
        }

        loop {
            tokio::select! {
                _ = cancellation.cancelled() => {
                    break;
                }

                Some(cmd) = self.cmd_rx.recv() => {
                    self.handle_command(cmd).await;
                }

                Some(msg) = self.internal_rx.recv() => {
                    self.handle_internal(msg).await;
                }

                Some(batch) = self.batch_rx.recv() => {
                    debug!(count = batch.len(), "Processing calculation batch");
                    for alarm_id in batch {
                        match self.store.get(alarm_id) {
                            // Slot already reserved by the limiter queue.
                            Some(alarm) => {
                                self.launch_calculation(alarm, false, true, None).await;
                            }
                            None => debug!(alarm_id = %alarm_id, "Batched alarm no longer exists"),
                        }
                    }
                }

                event = self.store_events.recv() => {
                    match event {
                        Ok(StoreEvent::OperationsCancelled { alarm_id }) => {
                            self.cancel_tracked(alarm_id);
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!(missed = n, "Coordinator lagged on store events");
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            warn!("Store event channel closed");
                            break;
                        }
                    }
                }
            }
        }

        for (alarm_id, task) in self.tasks.drain() {
            trace!(alarm_id = %alarm_id, "Cancelling calculation at shutdown");
            task.token.cancel();
        }
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::CreateAlarm { alarm, reply } => {
                let result = self.create_alarm(alarm).await;
                let _ = reply.send(result);
            }
            Command::UpdateAlarm {
                alarm,
                skip_adjustment_calculation,
                reply,
            } => {
                let result = self.update_alarm(alarm, skip_adjustment_calculation).await;
                let _ = reply.send(result);
            }
            Command::DeleteAlarm { alarm_id, reply } => {
                self.delete_alarm(alarm_id).await;
                let _ = reply.send(());
            }
            Command::DeleteAll { reply } => {
                let ids: Vec<Uuid> = self.store.list().into_iter().map(|a| a.id).collect();
                let handle = CoordinatorHandle {
                    cmd_tx: self.cmd_tx.clone(),
                };
                // One at a time, so notification cancellation and store
                // mutation stay observably sequential.
                tokio::spawn(async move {
                    let mut count = 0;
                    for alarm_id in ids {
                        if handle.delete_alarm(alarm_id).await.is_err() {
                            break;
                        }
                        count += 1;
                    }
                    let _ = reply.send(count);
                });
            }
            Command::RecalculateAlarm {
                alarm_id,
                force,
                reply,
            } => match self.store.get(alarm_id) {
                Some(alarm) => {
                    self.launch_calculation(alarm, force, false, Some(reply)).await;
                }
                None => {
                    debug!(alarm_id = %alarm_id, "Recalculate for missing alarm");
                    let _ = reply.send(RecalcOutcome::Skipped(SkipReason::Missing));
                }
            },
            Command::RecalculateAll { reply } => {
                let ids: Vec<Uuid> = self
                    .store
                    .list()
                    .into_iter()
                    .filter(|a| a.enabled && a.smart_enabled)
                    .map(|a| a.id)
                    .collect();
                let handle = CoordinatorHandle {
                    cmd_tx: self.cmd_tx.clone(),
                };
                tokio::spawn(async move {
                    let mut count = 0;
                    for alarm_id in ids {
                        if handle.recalculate_alarm(alarm_id, false).await.is_err() {
                            break;
                        }
                        count += 1;
                    }
                    let _ = reply.send(count);
                });
            }
            Command::UpdateLocation { location, reply } => {
                self.location = location;
                let _ = reply.send(());
            }
        }
    }

    async fn handle_internal(&mut self, msg: Internal) {
        match msg {
            Internal::CalcDone {
                alarm_id,
                termination,
            } => {
                self.processing.remove(&alarm_id);
                let reply = self.tasks.remove(&alarm_id).and_then(|t| t.reply);
                match termination {
                    Termination::Cancelled => {
                        debug!(alarm_id = %alarm_id, "Calculation cancelled");
                        if let Some(reply) = reply {
                            let _ = reply.send(RecalcOutcome::Cancelled);
                        }
                    }
                    Termination::Finished(Err(e)) => {
                        // Fail-safe: the previous adjustment (if any) stays,
                        // and the nominal notification already stands.
                        warn!(alarm_id = %alarm_id, error = %e, "Calculation failed");
                        if let Some(reply) = reply {
                            let _ = reply.send(RecalcOutcome::Failed(e.to_string()));
                        }
                    }
                    Termination::Finished(Ok(outcome)) => {
                        self.write_back(alarm_id, outcome, reply).await;
                    }
                }
            }
            Internal::CleanupDeleting { alarm_id } => {
                self.deleting.remove(&alarm_id);
            }
        }
    }

    async fn create_alarm(
        &mut self,
        alarm: Alarm,
    ) -> std::result::Result<Alarm, ValidationError> {
        alarm.validate()?;
        info!(alarm_id = %alarm.id, name = %alarm.name, "Creating alarm");
        self.store.add(alarm.clone());
        self.notifier.schedule_alarm(&alarm).await;
        if alarm.smart_enabled && alarm.enabled {
            self.launch_calculation(alarm.clone(), true, false, None).await;
        }
        Ok(alarm)
    }

    async fn update_alarm(
        &mut self,
        mut alarm: Alarm,
        skip_adjustment_calculation: bool,
    ) -> std::result::Result<(), ValidationError> {
        if !self.store.contains(alarm.id) {
            // Races a concurrent deletion; benign.
            debug!(alarm_id = %alarm.id, "Update for missing alarm, ignoring");
            return Ok(());
        }
        alarm.validate()?;

        // An adjustment only makes sense while the smart layer is on.
        if !alarm.enabled || !alarm.smart_enabled || !alarm.smart.adjust_for_weather {
            alarm.current_adjustment = None;
        }

        self.notifier.cancel_alarm(alarm.id).await;
        self.store.update(
            alarm.clone(),
            UpdateMeta {
                skip_weather_refresh: skip_adjustment_calculation,
                from_creation: false,
            },
        );
        self.reschedule(&alarm).await;

        if !skip_adjustment_calculation && alarm.smart_enabled && alarm.enabled {
            self.launch_calculation(alarm, true, false, None).await;
        }
        Ok(())
    }

    async fn delete_alarm(&mut self, alarm_id: Uuid) {
        if !self.store.contains(alarm_id) {
            debug!(alarm_id = %alarm_id, "Delete for missing alarm, ignoring");
            return;
        }
        info!(alarm_id = %alarm_id, "Deleting alarm");
        self.deleting.insert(alarm_id);
        self.cancel_tracked(alarm_id);
        self.notifier.cancel_alarm(alarm_id).await;
        // Deleted + OperationsCancelled go out on the bus here; observers
        // holding per-alarm state (the refresh loop) drop it on Deleted.
        self.store.delete(alarm_id);

        let internal_tx = self.internal_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(DELETING_GRACE).await;
            let _ = internal_tx.send(Internal::CleanupDeleting { alarm_id }).await;
        });
    }

    /// Launch one cancellable calculation task for `alarm`, if every guard
    /// passes. `reserved` marks batch-originated requests whose limiter
    /// slot was taken at queue time.
    async fn launch_calculation(
        &mut self,
        alarm: Alarm,
        force: bool,
        reserved: bool,
        reply: Option<oneshot::Sender<RecalcOutcome>>,
    ) {
        let alarm_id = alarm.id;

        let skip = |reason: SkipReason, reply: Option<oneshot::Sender<RecalcOutcome>>| {
            debug!(alarm_id = %alarm_id, reason = ?reason, "Declining calculation");
            if let Some(reply) = reply {
                let _ = reply.send(RecalcOutcome::Skipped(reason));
            }
        };

        if self.deleting.contains(&alarm_id) {
            return skip(SkipReason::Deleting, reply);
        }
        if self.processing.contains(&alarm_id) {
            return skip(SkipReason::AlreadyProcessing, reply);
        }
        if !alarm.smart_enabled {
            return skip(SkipReason::NotSmart, reply);
        }
        if !alarm.enabled {
            return skip(SkipReason::Disabled, reply);
        }

        let now_local = Local::now();
        let Some(occurrence) = alarm.next_occurrence(now_local) else {
            return skip(SkipReason::NoFutureOccurrence, reply);
        };
        if occurrence <= now_local {
            return skip(SkipReason::NoFutureOccurrence, reply);
        }
        let Some(arrival) = alarm.next_arrival(&occurrence) else {
            return skip(SkipReason::NoFutureOccurrence, reply);
        };
        let arrival = arrival.with_timezone(&Utc);

        if !reserved {
            if !force && !self.limiter.can_make_request(alarm_id) {
                return skip(SkipReason::RateLimited, reply);
            }
            self.limiter.record_request(alarm_id);
        }

        debug!(alarm_id = %alarm_id, force, "Launching calculation");
        self.processing.insert(alarm_id);

        let token = CancellationToken::new();
        let task_token = token.clone();
        let calc = Arc::clone(&self.calc);
        let profile = self.profile.clone();
        let location = self.location;
        let internal_tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let termination = tokio::select! {
                _ = task_token.cancelled() => Termination::Cancelled,
                result = calc.calculate(&alarm, &profile, arrival, location, force) => {
                    Termination::Finished(result)
                }
            };
            let _ = internal_tx
                .send(Internal::CalcDone {
                    alarm_id,
                    termination,
                })
                .await;
        });
        self.tasks.insert(alarm_id, TrackedTask { token, reply });
    }

    /// Apply a finished calculation to its alarm.
    async fn write_back(
        &mut self,
        alarm_id: Uuid,
        outcome: CalculationOutcome,
        reply: Option<oneshot::Sender<RecalcOutcome>>,
    ) {
        let respond = |outcome: RecalcOutcome, reply: Option<oneshot::Sender<RecalcOutcome>>| {
            if let Some(reply) = reply {
                let _ = reply.send(outcome);
            }
        };

        if self.deleting.contains(&alarm_id) {
            debug!(alarm_id = %alarm_id, "Result for deleting alarm, dropping");
            return respond(RecalcOutcome::Cancelled, reply);
        }
        let Some(mut alarm) = self.store.get(alarm_id) else {
            debug!(alarm_id = %alarm_id, "Result for missing alarm, dropping");
            return respond(RecalcOutcome::Cancelled, reply);
        };

        // The alarm may have been edited while the calculation ran; a
        // result for a superseded occurrence must not be attached.
        let current = alarm
            .next_occurrence(Local::now())
            .map(|dt| dt.with_timezone(&Utc));
        if !matches!(current, Some(occ) if occurrence_matches(occ, outcome.occurrence)) {
            debug!(alarm_id = %alarm_id, "Result is stale, dropping");
            return respond(RecalcOutcome::Skipped(SkipReason::StaleResult), reply);
        }

        // Superseded wholesale: a trivial result clears any previous
        // adjustment (conditions returned to nominal).
        alarm.current_adjustment = outcome.adjustment.clone();

        self.store.update(
            alarm.clone(),
            UpdateMeta {
                skip_weather_refresh: true,
                from_creation: false,
            },
        );
        self.notifier.cancel_alarm(alarm_id).await;
        self.reschedule(&alarm).await;

        match outcome.adjustment {
            Some(adjustment) => {
                info!(
                    alarm_id = %alarm_id,
                    adjustment_minutes = adjustment.adjustment_minutes,
                    confidence = adjustment.confidence,
                    "Adjustment applied"
                );
                respond(RecalcOutcome::Adjusted(adjustment), reply);
            }
            None => {
                debug!(alarm_id = %alarm_id, "Calculation produced no adjustment");
                respond(RecalcOutcome::NoAdjustment, reply);
            }
        }
    }

    async fn reschedule(&self, alarm: &Alarm) {
        let occurrence = alarm
            .next_occurrence(Local::now())
            .map(|dt| dt.with_timezone(&Utc));
        match occurrence.and_then(|occ| alarm.fresh_adjustment(occ)) {
            Some(adjustment) => {
                let adjustment = adjustment.clone();
                self.notifier.schedule_adjusted_alarm(alarm, &adjustment).await;
            }
            None => self.notifier.schedule_alarm(alarm).await,
        }
    }

    fn cancel_tracked(&mut self, alarm_id: Uuid) {
        if let Some(task) = self.tasks.remove(&alarm_id) {
            debug!(alarm_id = %alarm_id, "Cancelling in-flight calculation");
            task.token.cancel();
            self.processing.remove(&alarm_id);
            if let Some(reply) = task.reply {
                let _ = reply.send(RecalcOutcome::Cancelled);
            }
        }
    }
}

fn occurrence_matches(a: DateTime<Utc>, b: DateTime<Utc>) -> bool {
    (a - b).num_seconds().abs() <= STALE_RESULT_SLOP_SECS
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alarm::{AdjustmentBreakdown, Address};
    use crate::limiter::LimiterConfig;
    use crate::notify::LocalNotificationScheduler;
    use async_trait::async_trait;
    use chrono::NaiveTime;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    /// Scripted calculation service: counts calls, optionally blocks on a
    /// gate, and answers with a fixed minutes-earlier delta.
    struct MockCalc {
        calls: AtomicUsize,
        gate: Option<Arc<Notify>>,
        minutes_earlier: i64,
        fail: bool,
    }

    impl MockCalc {
        fn immediate(minutes_earlier: i64) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                gate: None,
                minutes_earlier,
                fail: false,
            })
        }

        fn gated(minutes_earlier: i64) -> (Arc<Self>, Arc<Notify>) {
            let gate = Arc::new(Notify::new());
            let calc = Arc::new(Self {
                calls: AtomicUsize::new(0),
                gate: Some(Arc::clone(&gate)),
                minutes_earlier,
                fail: false,
            });
            (calc, gate)
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                gate: None,
                minutes_earlier: 0,
                fail: true,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl CalculationService for MockCalc {
        async fn calculate(
            &self,
            alarm: &Alarm,
            _profile: &UserProfile,
            _arrival: DateTime<Utc>,
            _location: Option<Coordinate>,
            _force: bool,
        ) -> std::result::Result<CalculationOutcome, CalcError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            if self.fail {
                return Err(CalcError::NetworkError("mock outage".into()));
            }
            let occurrence = alarm
                .next_occurrence(Local::now())
                .unwrap()
                .with_timezone(&Utc);
            let adjustment = (self.minutes_earlier.abs() >= 2).then(|| AlarmAdjustment {
                adjusted_wake_time: occurrence - chrono::Duration::minutes(self.minutes_earlier),
                adjustment_minutes: self.minutes_earlier,
                reason: "mock".into(),
                calculated_at: Utc::now(),
                confidence: 0.9,
                breakdown: AdjustmentBreakdown::default(),
            });
            Ok(CalculationOutcome {
                occurrence,
                adjustment,
            })
        }
    }

    struct Harness {
        handle: CoordinatorHandle,
        store: Arc<AlarmStore>,
        notifier: Arc<LocalNotificationScheduler>,
        limiter: Arc<RateLimiter>,
        cancellation: CancellationToken,
    }

    fn spawn_engine(calc: Arc<dyn CalculationService>) -> Harness {
        let store = Arc::new(AlarmStore::in_memory());
        let (limiter, batch_rx) = RateLimiter::new(LimiterConfig::default());
        let notifier = Arc::new(LocalNotificationScheduler::new());
        let (coordinator, handle) = Coordinator::new(
            Arc::clone(&store),
            Arc::clone(&limiter),
            calc,
            Arc::clone(&notifier) as Arc<dyn NotificationScheduler>,
            UserProfile::default(),
            batch_rx,
        );
        let cancellation = CancellationToken::new();
        tokio::spawn(coordinator.run(cancellation.clone()));
        Harness {
            handle,
            store,
            notifier,
            limiter,
            cancellation,
        }
    }

    fn valid_address() -> Address {
        Address {
            street: "100 Main St".into(),
            city: "Springfield".into(),
            state: "IL".into(),
            zip: "62701".into(),
            latitude: Some(39.8),
            longitude: Some(-89.6),
            valid: true,
        }
    }

    fn smart_alarm(name: &str) -> Alarm {
        let mut alarm = Alarm::new(name, NaiveTime::from_hms_opt(7, 0, 0).unwrap());
        alarm.smart_enabled = true;
        alarm.smart.start_address = valid_address();
        alarm.smart.destination_address = valid_address();
        alarm.smart.arrival_time = NaiveTime::from_hms_opt(8, 30, 0).unwrap();
        alarm
    }

    async fn wait_for_adjustment(store: &AlarmStore, alarm_id: Uuid) -> Alarm {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if let Some(alarm) = store.get(alarm_id) {
                    if alarm.current_adjustment.is_some() {
                        return alarm;
                    }
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("adjustment never arrived")
    }

    #[tokio::test]
    async fn create_validates_before_mutating() {
        let calc = MockCalc::immediate(18);
        let h = spawn_engine(calc);

        let bad = Alarm::new("", NaiveTime::from_hms_opt(7, 0, 0).unwrap());
        let err = h.handle.create_alarm(bad).await.unwrap_err();
        assert!(matches!(err, Error::Validation(ValidationError::EmptyName)));
        assert!(h.store.is_empty());
        h.cancellation.cancel();
    }

    #[tokio::test]
    async fn create_smart_alarm_attaches_adjustment_and_reschedules() {
        let calc = MockCalc::immediate(18);
        let h = spawn_engine(Arc::clone(&calc) as Arc<dyn CalculationService>);

        let created = h.handle.create_alarm(smart_alarm("Work")).await.unwrap();
        let alarm = wait_for_adjustment(&h.store, created.id).await;

        let adjustment = alarm.current_adjustment.unwrap();
        assert_eq!(adjustment.adjustment_minutes, 18);
        assert_eq!(calc.calls(), 1);

        let pending = h.notifier.pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].fire_at, adjustment.adjusted_wake_time);
        h.cancellation.cancel();
    }

    #[tokio::test]
    async fn tiny_adjustment_is_never_attached() {
        let calc = MockCalc::immediate(1);
        let h = spawn_engine(Arc::clone(&calc) as Arc<dyn CalculationService>);

        // Created plain, then flipped smart without a launch, so the
        // recalculation below is the only calculation in play.
        let mut alarm = smart_alarm("Work");
        alarm.smart_enabled = false;
        let created = h.handle.create_alarm(alarm).await.unwrap();
        let mut smart = created.clone();
        smart.smart_enabled = true;
        h.handle.update_alarm(smart, true).await.unwrap();

        let outcome = h.handle.recalculate_alarm(created.id, true).await.unwrap();
        assert!(matches!(outcome, RecalcOutcome::NoAdjustment));
        assert!(h.store.get(created.id).unwrap().current_adjustment.is_none());

        // The nominal notification still stands.
        let pending = h.notifier.pending();
        assert_eq!(pending.len(), 1);
        h.cancellation.cancel();
    }

    #[tokio::test]
    async fn sleep_in_surfaces_as_negative_minutes() {
        let calc = MockCalc::immediate(-10);
        let h = spawn_engine(Arc::clone(&calc) as Arc<dyn CalculationService>);

        let created = h.handle.create_alarm(smart_alarm("Work")).await.unwrap();
        // Let the creation calculation settle first.
        wait_for_adjustment(&h.store, created.id).await;

        let outcome = h.handle.recalculate_alarm(created.id, true).await.unwrap();
        match outcome {
            RecalcOutcome::Adjusted(adjustment) => {
                assert_eq!(adjustment.adjustment_minutes, -10);
                assert!(adjustment.is_sleep_in());
            }
            other => panic!("expected adjustment, got {other:?}"),
        }
        h.cancellation.cancel();
    }

    #[tokio::test]
    async fn no_duplicate_concurrent_calculation() {
        let (calc, gate) = MockCalc::gated(18);
        let h = spawn_engine(Arc::clone(&calc) as Arc<dyn CalculationService>);

        let created = h.handle.create_alarm(smart_alarm("Work")).await.unwrap();
        // The creation calculation is parked on the gate; further updates
        // must observe processing and decline.
        h.handle.update_alarm(created.clone(), false).await.unwrap();
        h.handle.update_alarm(created.clone(), false).await.unwrap();
        assert_eq!(calc.calls(), 1);

        gate.notify_one();
        wait_for_adjustment(&h.store, created.id).await;
        assert_eq!(calc.calls(), 1);
        h.cancellation.cancel();
    }

    #[tokio::test]
    async fn write_back_does_not_retrigger_calculation() {
        let calc = MockCalc::immediate(18);
        let h = spawn_engine(Arc::clone(&calc) as Arc<dyn CalculationService>);

        let created = h.handle.create_alarm(smart_alarm("Work")).await.unwrap();
        let alarm = wait_for_adjustment(&h.store, created.id).await;
        assert_eq!(calc.calls(), 1);

        // Simulate N write-backs through the guarded update path.
        for _ in 0..3 {
            h.handle.update_alarm(alarm.clone(), true).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(calc.calls(), 1);
        h.cancellation.cancel();
    }

    #[tokio::test]
    async fn deletion_wins_the_race_against_a_calculation() {
        let (calc, _gate) = MockCalc::gated(18);
        let h = spawn_engine(Arc::clone(&calc) as Arc<dyn CalculationService>);

        let created = h.handle.create_alarm(smart_alarm("Work")).await.unwrap();
        assert_eq!(calc.calls(), 1);

        // Delete while the calculation is parked on the gate.
        h.handle.delete_alarm(created.id).await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!h.store.contains(created.id));
        assert!(h.notifier.pending().is_empty());

        // During the grace window the id is still treated as deleting.
        let outcome = h.handle.recalculate_alarm(created.id, true).await.unwrap();
        assert!(matches!(
            outcome,
            RecalcOutcome::Skipped(SkipReason::Missing | SkipReason::Deleting)
        ));
        h.cancellation.cancel();
    }

    #[tokio::test]
    async fn failed_calculation_leaves_previous_adjustment() {
        let calc = MockCalc::immediate(18);
        let h = spawn_engine(Arc::clone(&calc) as Arc<dyn CalculationService>);

        let created = h.handle.create_alarm(smart_alarm("Work")).await.unwrap();
        let alarm = wait_for_adjustment(&h.store, created.id).await;
        h.cancellation.cancel();

        // Re-wire the same store against a failing service.
        let failing = MockCalc::failing();
        let (limiter, batch_rx) = RateLimiter::new(LimiterConfig::default());
        let (coordinator, handle) = Coordinator::new(
            Arc::clone(&h.store),
            limiter,
            failing,
            Arc::clone(&h.notifier) as Arc<dyn NotificationScheduler>,
            UserProfile::default(),
            batch_rx,
        );
        let cancellation = CancellationToken::new();
        tokio::spawn(coordinator.run(cancellation.clone()));

        let outcome = handle.recalculate_alarm(alarm.id, true).await.unwrap();
        assert!(matches!(outcome, RecalcOutcome::Failed(_)));
        assert_eq!(
            h.store.get(alarm.id).unwrap().current_adjustment,
            alarm.current_adjustment
        );
        cancellation.cancel();
    }

    #[tokio::test]
    async fn disabling_smart_clears_the_adjustment() {
        let calc = MockCalc::immediate(18);
        let h = spawn_engine(Arc::clone(&calc) as Arc<dyn CalculationService>);

        let created = h.handle.create_alarm(smart_alarm("Work")).await.unwrap();
        let mut alarm = wait_for_adjustment(&h.store, created.id).await;

        alarm.smart_enabled = false;
        h.handle.update_alarm(alarm, false).await.unwrap();
        assert!(h.store.get(created.id).unwrap().current_adjustment.is_none());
        h.cancellation.cancel();
    }

    #[tokio::test]
    async fn background_recalculation_is_rate_limited() {
        let calc = MockCalc::immediate(18);
        let h = spawn_engine(Arc::clone(&calc) as Arc<dyn CalculationService>);

        // Create a plain alarm, then enable smart without forcing so the
        // launch path consults the limiter.
        let mut alarm = smart_alarm("Work");
        alarm.smart_enabled = false;
        let created = h.handle.create_alarm(alarm).await.unwrap();
        let mut smart = created.clone();
        smart.smart_enabled = true;
        smart.smart.start_address = valid_address();
        smart.smart.destination_address = valid_address();
        h.handle.update_alarm(smart, true).await.unwrap();

        let first = h.handle.recalculate_alarm(created.id, false).await.unwrap();
        assert!(matches!(
            first,
            RecalcOutcome::Adjusted(_) | RecalcOutcome::NoAdjustment
        ));

        let second = h.handle.recalculate_alarm(created.id, false).await.unwrap();
        assert!(matches!(
            second,
            RecalcOutcome::Skipped(SkipReason::RateLimited)
        ));
        assert!(h.limiter.time_until_next_request(created.id).is_some());
        h.cancellation.cancel();
    }

    #[tokio::test]
    async fn update_for_missing_alarm_is_benign() {
        let calc = MockCalc::immediate(18);
        let h = spawn_engine(calc);
        let ghost = smart_alarm("Ghost");
        assert!(h.handle.update_alarm(ghost, false).await.is_ok());
        h.cancellation.cancel();
    }

    #[tokio::test]
    async fn recalculate_all_covers_every_smart_alarm() {
        let calc = MockCalc::immediate(18);
        let h = spawn_engine(Arc::clone(&calc) as Arc<dyn CalculationService>);

        h.handle.create_alarm(smart_alarm("A")).await.unwrap();
        h.handle.create_alarm(smart_alarm("B")).await.unwrap();
        let mut plain = smart_alarm("C");
        plain.smart_enabled = false;
        h.handle.create_alarm(plain).await.unwrap();

        // Let the creation calculations drain first.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let count = h.handle.recalculate_all().await.unwrap();
        assert_eq!(count, 2);
        h.cancellation.cancel();
    }

    #[tokio::test]
    async fn delete_all_empties_the_store_sequentially() {
        let calc = MockCalc::immediate(18);
        let h = spawn_engine(calc);

        h.handle.create_alarm(smart_alarm("A")).await.unwrap();
        h.handle.create_alarm(smart_alarm("B")).await.unwrap();

        let count = h.handle.delete_all().await.unwrap();
        assert_eq!(count, 2);
        assert!(h.store.is_empty());
        assert!(h.notifier.pending().is_empty());
        h.cancellation.cancel();
    }
}
