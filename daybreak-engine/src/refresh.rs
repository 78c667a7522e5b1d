//! Weather adjustment refresh loop.
//!
//! Watches the store's event bus and re-requests wake-time calculations
//! when conditions may have shifted: immediately (rate limited, batched)
//! after a relevant alarm edit, and on a periodic sweep for alarms whose
//! occurrence is coming up. The loop never mutates alarms itself; all
//! writes go through the coordinator.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local};
use tokio::sync::{broadcast, mpsc};
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::alarm::Alarm;
use crate::coordinator::{CoordinatorHandle, RecalcOutcome};
use crate::limiter::RateLimiter;
use crate::store::{AlarmStore, StoreEvent};
use crate::tracing::prelude::*;

#[derive(Debug, Clone, Copy)]
pub struct RefreshConfig {
    /// Period of the background sweep.
    pub sweep_interval: Duration,
    /// Only alarms occurring within this horizon are refreshed.
    pub lookahead: Duration,
    /// Minimum gap between successful refreshes of one alarm.
    pub min_success_gap: Duration,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(15 * 60),
            lookahead: Duration::from_secs(24 * 60 * 60),
            min_success_gap: Duration::from_secs(60),
        }
    }
}

/// Handle for poking the loop into an immediate sweep.
#[derive(Clone)]
pub struct RefreshHandle {
    poke_tx: mpsc::Sender<()>,
}

impl RefreshHandle {
    /// Request a sweep now. A sweep already pending absorbs the request.
    pub fn trigger(&self) {
        if self.poke_tx.try_send(()).is_err() {
            trace!("Refresh already pending");
        }
    }
}

pub struct RefreshLoop {
    store: Arc<AlarmStore>,
    limiter: Arc<RateLimiter>,
    coordinator: CoordinatorHandle,
    config: RefreshConfig,
    /// Instant of the last successful calculation per alarm.
    last_success: HashMap<Uuid, Instant>,
    poke_rx: mpsc::Receiver<()>,
}

impl RefreshLoop {
    pub fn new(
        store: Arc<AlarmStore>,
        limiter: Arc<RateLimiter>,
        coordinator: CoordinatorHandle,
        config: RefreshConfig,
    ) -> (Self, RefreshHandle) {
        let (poke_tx, poke_rx) = mpsc::channel(1);
        let handle = RefreshHandle { poke_tx };
        let refresh = Self {
            store,
            limiter,
            coordinator,
            config,
            last_success: HashMap::new(),
            poke_rx,
        };
        (refresh, handle)
    }

    /// Whether this alarm is a candidate for a weather refresh at `now`.
    pub fn is_eligible(alarm: &Alarm, now: DateTime<Local>, lookahead: Duration) -> bool {
        if !alarm.enabled || !alarm.smart_enabled || !alarm.smart.adjust_for_weather {
            return false;
        }
        if !alarm.smart.start_address.is_structurally_valid()
            || !alarm.smart.destination_address.is_structurally_valid()
        {
            return false;
        }
        let Some(occurrence) = alarm.next_occurrence(now) else {
            return false;
        };
        let until = occurrence - now;
        until > chrono::Duration::zero()
            && until <= chrono::Duration::from_std(lookahead).unwrap_or(chrono::Duration::hours(24))
    }

    /// Run until cancelled.
    pub async fn run(mut self, cancellation: CancellationToken) {
        let mut events = self.store.subscribe();
        // No sweep at startup; the coordinator already calculates on
        // creation, and a restart should not burn every alarm's slot.
        let start = Instant::now() + self.config.sweep_interval;
        let mut ticker = time::interval_at(start, self.config.sweep_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            sweep_interval_secs = self.config.sweep_interval.as_secs(),
            "Weather refresh loop running"
        );

        loop {
            tokio::select! {
                _ = cancellation.cancelled() => {
                    break;
                }

                _ = ticker.tick() => {
                    self.sweep().await;
                }

                Some(()) = self.poke_rx.recv() => {
                    debug!("Manual refresh requested");
                    self.sweep().await;
                }

                event = events.recv() => {
                    match event {
                        Ok(event) => self.handle_event(event),
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!(missed = n, "Refresh loop lagged on store events");
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            warn!("Store event channel closed");
                            break;
                        }
                    }
                }
            }
        }
    }

    fn handle_event(&mut self, event: StoreEvent) {
        match event {
            StoreEvent::Updated {
                alarm_id,
                skip_weather_refresh,
                from_creation,
            } => {
                if skip_weather_refresh {
                    // Our own write-backs come through here; reacting would
                    // loop forever.
                    trace!(alarm_id = %alarm_id, "Update flagged skip, ignoring");
                    return;
                }
                if from_creation {
                    // The coordinator already ran the creation calculation.
                    trace!(alarm_id = %alarm_id, "Creation echo, ignoring");
                    return;
                }
                let Some(alarm) = self.store.get(alarm_id) else {
                    debug!(alarm_id = %alarm_id, "Update event for missing alarm");
                    return;
                };
                if !Self::is_eligible(&alarm, Local::now(), self.config.lookahead) {
                    trace!(alarm_id = %alarm_id, "Alarm not eligible for refresh");
                    return;
                }
                if self.limiter.queue_request(alarm_id) {
                    debug!(alarm_id = %alarm_id, "Queued refresh after update");
                }
            }
            StoreEvent::Deleted { alarm_id } => {
                self.last_success.remove(&alarm_id);
            }
            StoreEvent::Created { .. } | StoreEvent::OperationsCancelled { .. } => {}
        }
    }

    /// One pass over every eligible alarm, sequentially.
    async fn sweep(&mut self) {
        let now = Local::now();
        let candidates: Vec<Uuid> = self
            .store
            .list()
            .iter()
            .filter(|alarm| Self::is_eligible(alarm, now, self.config.lookahead))
            .filter(|alarm| {
                self.last_success
                    .get(&alarm.id)
                    .map_or(true, |t| t.elapsed() >= self.config.min_success_gap)
            })
            .map(|alarm| alarm.id)
            .collect();

        if candidates.is_empty() {
            trace!("No alarms eligible for refresh");
            return;
        }
        debug!(count = candidates.len(), "Sweeping alarms for refresh");

        for alarm_id in candidates {
            match self.coordinator.recalculate_alarm(alarm_id, false).await {
                Ok(RecalcOutcome::Adjusted(_) | RecalcOutcome::NoAdjustment) => {
                    self.last_success.insert(alarm_id, Instant::now());
                }
                Ok(outcome) => {
                    trace!(alarm_id = %alarm_id, outcome = ?outcome, "Refresh did not complete");
                }
                Err(e) => {
                    warn!(error = %e, "Coordinator unavailable, abandoning sweep");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alarm::{
        AdjustmentBreakdown, Address, AlarmAdjustment, Coordinate, Schedule,
    };
    use crate::calc::{CalcError, CalculationOutcome, CalculationService};
    use crate::coordinator::Coordinator;
    use crate::limiter::LimiterConfig;
    use crate::notify::{LocalNotificationScheduler, NotificationScheduler};
    use crate::profile::UserProfile;
    use crate::store::UpdateMeta;
    use async_trait::async_trait;
    use chrono::{NaiveDate, NaiveTime, TimeZone, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingCalc {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CalculationService for CountingCalc {
        async fn calculate(
            &self,
            alarm: &Alarm,
            _profile: &UserProfile,
            _arrival: chrono::DateTime<Utc>,
            _location: Option<Coordinate>,
            _force: bool,
        ) -> Result<CalculationOutcome, CalcError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let occurrence = alarm
                .next_occurrence(Local::now())
                .unwrap()
                .with_timezone(&Utc);
            Ok(CalculationOutcome {
                occurrence,
                adjustment: Some(AlarmAdjustment {
                    adjusted_wake_time: occurrence - chrono::Duration::minutes(10),
                    adjustment_minutes: 10,
                    reason: "test".into(),
                    calculated_at: Utc::now(),
                    confidence: 0.9,
                    breakdown: AdjustmentBreakdown::default(),
                }),
            })
        }
    }

    struct Rig {
        store: Arc<AlarmStore>,
        calc: Arc<CountingCalc>,
        handle: RefreshHandle,
        cancellation: CancellationToken,
    }

    fn spawn_rig() -> Rig {
        spawn_rig_with(RefreshConfig::default())
    }

    fn spawn_rig_with(config: RefreshConfig) -> Rig {
        let store = Arc::new(AlarmStore::in_memory());
        let (limiter, batch_rx) = RateLimiter::new(LimiterConfig::default());
        let calc = Arc::new(CountingCalc {
            calls: AtomicUsize::new(0),
        });
        let notifier = Arc::new(LocalNotificationScheduler::new());
        let (coordinator, coordinator_handle) = Coordinator::new(
            Arc::clone(&store),
            Arc::clone(&limiter),
            Arc::clone(&calc) as Arc<dyn CalculationService>,
            notifier as Arc<dyn NotificationScheduler>,
            UserProfile::default(),
            batch_rx,
        );
        let (refresh, handle) =
            RefreshLoop::new(Arc::clone(&store), limiter, coordinator_handle, config);
        let cancellation = CancellationToken::new();
        tokio::spawn(coordinator.run(cancellation.clone()));
        tokio::spawn(refresh.run(cancellation.clone()));
        Rig {
            store,
            calc,
            handle,
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

    fn smart_alarm() -> Alarm {
        let mut alarm = Alarm::new("Work", NaiveTime::from_hms_opt(7, 0, 0).unwrap());
        alarm.smart_enabled = true;
        alarm.smart.start_address = valid_address();
        alarm.smart.destination_address = valid_address();
        alarm
    }

    #[test]
    fn eligibility_requires_the_full_smart_setup() {
        let now = Local::now();
        let lookahead = Duration::from_secs(24 * 60 * 60);

        assert!(RefreshLoop::is_eligible(&smart_alarm(), now, lookahead));

        let mut disabled = smart_alarm();
        disabled.enabled = false;
        assert!(!RefreshLoop::is_eligible(&disabled, now, lookahead));

        let mut plain = smart_alarm();
        plain.smart_enabled = false;
        assert!(!RefreshLoop::is_eligible(&plain, now, lookahead));

        let mut no_weather = smart_alarm();
        no_weather.smart.adjust_for_weather = false;
        assert!(!RefreshLoop::is_eligible(&no_weather, now, lookahead));

        let mut bad_address = smart_alarm();
        bad_address.smart.start_address = Address::unset();
        assert!(!RefreshLoop::is_eligible(&bad_address, now, lookahead));
    }

    #[test]
    fn eligibility_requires_an_upcoming_occurrence() {
        let lookahead = Duration::from_secs(24 * 60 * 60);
        // Fixed reference: Monday 2026-03-02, noon local.
        let now = Local
            .with_ymd_and_hms(2026, 3, 2, 12, 0, 0)
            .single()
            .expect("unambiguous local time");

        // Past specific date: no future occurrence.
        let mut past = smart_alarm();
        past.schedule = Schedule::SpecificDate {
            date: NaiveDate::from_ymd_opt(2020, 1, 1).unwrap(),
        };
        assert!(!RefreshLoop::is_eligible(&past, now, lookahead));

        // A date two days out is beyond the lookahead horizon.
        let mut distant = smart_alarm();
        distant.schedule = Schedule::SpecificDate {
            date: NaiveDate::from_ymd_opt(2026, 3, 4).unwrap(),
        };
        assert!(!RefreshLoop::is_eligible(&distant, now, lookahead));

        // Tomorrow morning is inside it.
        let mut tomorrow = smart_alarm();
        tomorrow.schedule = Schedule::SpecificDate {
            date: NaiveDate::from_ymd_opt(2026, 3, 3).unwrap(),
        };
        assert!(RefreshLoop::is_eligible(&tomorrow, now, lookahead));
    }

    #[tokio::test(start_paused = true)]
    async fn relevant_update_queues_a_batched_refresh() {
        let rig = spawn_rig();
        let alarm = smart_alarm();
        let id = alarm.id;
        rig.store.add(alarm.clone());

        // Let the creation echo drain, then issue a real edit.
        tokio::time::sleep(Duration::from_millis(10)).await;
        let before = rig.calc.calls.load(Ordering::SeqCst);
        rig.store.update(alarm, UpdateMeta::default());

        // Inside the batch window nothing has fired yet.
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(rig.calc.calls.load(Ordering::SeqCst), before);

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(rig.calc.calls.load(Ordering::SeqCst), before + 1);
        assert!(rig.store.get(id).unwrap().current_adjustment.is_some());
        rig.cancellation.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn flagged_updates_do_not_requeue() {
        let rig = spawn_rig();
        let alarm = smart_alarm();
        rig.store.add(alarm.clone());
        tokio::time::sleep(Duration::from_millis(10)).await;
        let before = rig.calc.calls.load(Ordering::SeqCst);

        // Write-back shaped event.
        rig.store.update(
            alarm.clone(),
            UpdateMeta {
                skip_weather_refresh: true,
                from_creation: false,
            },
        );
        // Creation echo shaped event.
        rig.store.update(
            alarm,
            UpdateMeta {
                skip_weather_refresh: false,
                from_creation: true,
            },
        );

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(rig.calc.calls.load(Ordering::SeqCst), before);
        rig.cancellation.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn ineligible_alarm_is_not_queued() {
        let rig = spawn_rig();
        let mut alarm = smart_alarm();
        alarm.smart.adjust_for_weather = false;
        rig.store.add(alarm.clone());
        tokio::time::sleep(Duration::from_millis(10)).await;
        let before = rig.calc.calls.load(Ordering::SeqCst);

        rig.store.update(alarm, UpdateMeta::default());
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(rig.calc.calls.load(Ordering::SeqCst), before);
        rig.cancellation.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn manual_trigger_sweeps_immediately() {
        // Long sweep interval so only the manual trigger drives sweeps.
        let rig = spawn_rig_with(RefreshConfig {
            sweep_interval: Duration::from_secs(2 * 60 * 60),
            ..RefreshConfig::default()
        });
        let alarm = smart_alarm();
        rig.store.add(alarm);
        // Let the creation calculation finish and its limiter slot expire.
        tokio::time::sleep(Duration::from_secs(16 * 60)).await;
        let before = rig.calc.calls.load(Ordering::SeqCst);

        rig.handle.trigger();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(rig.calc.calls.load(Ordering::SeqCst), before + 1);
        rig.cancellation.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_holds_across_trigger_bursts() {
        let rig = spawn_rig_with(RefreshConfig {
            sweep_interval: Duration::from_secs(2 * 60 * 60),
            ..RefreshConfig::default()
        });
        let alarm = smart_alarm();
        rig.store.add(alarm);
        tokio::time::sleep(Duration::from_secs(16 * 60)).await;
        let before = rig.calc.calls.load(Ordering::SeqCst);

        rig.handle.trigger();
        tokio::time::sleep(Duration::from_secs(2 * 60)).await;
        rig.handle.trigger();
        tokio::time::sleep(Duration::from_secs(2 * 60)).await;

        // The second sweep hit the limiter.
        assert_eq!(rig.calc.calls.load(Ordering::SeqCst), before + 1);
        rig.cancellation.cancel();
    }
}
