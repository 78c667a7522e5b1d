//! The alarm store: single source of truth for the alarm collection.
//!
//! Every mutation persists the full collection and then notifies observers
//! through a broadcast channel. Only the coordinator actor calls the
//! mutation methods in the intended design; everything else subscribes.

use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::alarm::Alarm;
use crate::tracing::prelude::*;

/// Versioned persistence key. Bump the suffix on breaking format changes;
/// old files are simply not read.
pub const STORE_FILE: &str = "alarms_v2.json";

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Change notifications emitted after each mutation.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StoreEvent {
    Created {
        alarm_id: Uuid,
    },
    Updated {
        alarm_id: Uuid,
        /// Set on write-backs of computed adjustments so the refresh loop
        /// does not re-trigger a calculation from its own write.
        skip_weather_refresh: bool,
        /// Set when the update event mirrors a creation; the coordinator
        /// already ran the initial calculation in that case.
        from_creation: bool,
    },
    Deleted {
        alarm_id: Uuid,
    },
    /// Broadcast on deletion: any component holding work for this alarm
    /// must cancel it.
    OperationsCancelled {
        alarm_id: Uuid,
    },
}

/// Flags that travel with an update so they reach the event bus.
#[derive(Debug, Clone, Copy, Default)]
pub struct UpdateMeta {
    pub skip_weather_refresh: bool,
    pub from_creation: bool,
}

pub struct AlarmStore {
    alarms: RwLock<Vec<Alarm>>,
    /// Data directory; `None` keeps the store purely in memory (tests).
    dir: Option<PathBuf>,
    events: broadcast::Sender<StoreEvent>,
}

impl AlarmStore {
    /// Open the store backed by `dir`, loading any persisted collection.
    ///
    /// A missing file yields an empty collection. Corrupt data is discarded
    /// with a warning rather than crashing the engine.
    pub fn open(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        let alarms = load(&dir.join(STORE_FILE));
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            alarms: RwLock::new(alarms),
            dir: Some(dir),
            events,
        }
    }

    /// A store with no backing file, for tests and ephemeral runs.
    pub fn in_memory() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            alarms: RwLock::new(Vec::new()),
            dir: None,
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    /// All alarms, ordered for display: ascending by time-of-day (hour and
    /// minute only), stable on ties.
    pub fn list(&self) -> Vec<Alarm> {
        use chrono::Timelike;
        let mut alarms = self.alarms.read().clone();
        alarms.sort_by_key(|a| (a.alarm_time.hour(), a.alarm_time.minute()));
        alarms
    }

    pub fn get(&self, id: Uuid) -> Option<Alarm> {
        self.alarms.read().iter().find(|a| a.id == id).cloned()
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.alarms.read().iter().any(|a| a.id == id)
    }

    pub fn len(&self) -> usize {
        self.alarms.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.alarms.read().is_empty()
    }

    /// Add a new alarm and notify observers.
    ///
    /// Emits `Created`, then an `Updated` flagged `from_creation` so
    /// update-stream observers see creations too.
    pub fn add(&self, alarm: Alarm) {
        let id = alarm.id;
        {
            let mut alarms = self.alarms.write();
            alarms.push(alarm);
            self.persist(&alarms);
        }
        self.emit(StoreEvent::Created { alarm_id: id });
        self.emit(StoreEvent::Updated {
            alarm_id: id,
            skip_weather_refresh: false,
            from_creation: true,
        });
    }

    /// Replace the alarm with the same id. Returns `false` (and logs) when
    /// the id is already gone; deletion and update race from different
    /// triggers, so "already gone" is benign.
    pub fn update(&self, alarm: Alarm, meta: UpdateMeta) -> bool {
        let id = alarm.id;
        {
            let mut alarms = self.alarms.write();
            let Some(slot) = alarms.iter_mut().find(|a| a.id == id) else {
                debug!(alarm_id = %id, "Update for missing alarm, ignoring");
                return false;
            };
            *slot = alarm;
            self.persist(&alarms);
        }
        self.emit(StoreEvent::Updated {
            alarm_id: id,
            skip_weather_refresh: meta.skip_weather_refresh,
            from_creation: meta.from_creation,
        });
        true
    }

    /// Remove the alarm. Emits `Deleted` then `OperationsCancelled` so
    /// in-flight work for this id gets torn down wherever it lives.
    pub fn delete(&self, id: Uuid) -> bool {
        let removed = {
            let mut alarms = self.alarms.write();
            let before = alarms.len();
            alarms.retain(|a| a.id != id);
            let removed = alarms.len() != before;
            if removed {
                self.persist(&alarms);
            }
            removed
        };
        if removed {
            self.emit(StoreEvent::Deleted { alarm_id: id });
            self.emit(StoreEvent::OperationsCancelled { alarm_id: id });
        } else {
            debug!(alarm_id = %id, "Delete for missing alarm, ignoring");
        }
        removed
    }

    fn emit(&self, event: StoreEvent) {
        if self.events.send(event).is_err() {
            debug!("No store event subscribers");
        }
    }

    fn persist(&self, alarms: &[Alarm]) {
        let Some(dir) = &self.dir else {
            return;
        };
        if let Err(e) = write_atomically(dir, alarms) {
            warn!(error = %e, path = %dir.display(), "Failed to persist alarms");
        }
    }
}

fn load(path: &Path) -> Vec<Alarm> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
        Err(e) => {
            warn!(error = %e, path = %path.display(), "Failed to read alarm store");
            return Vec::new();
        }
    };
    match serde_json::from_str(&text) {
        Ok(alarms) => alarms,
        Err(e) => {
            warn!(error = %e, path = %path.display(), "Corrupt alarm store, resetting");
            Vec::new()
        }
    }
}

fn write_atomically(dir: &Path, alarms: &[Alarm]) -> std::io::Result<()> {
    fs::create_dir_all(dir)?;
    let path = dir.join(STORE_FILE);
    let tmp = dir.join(format!("{STORE_FILE}.tmp"));
    let text = serde_json::to_string_pretty(alarms)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    fs::write(&tmp, text)?;
    fs::rename(&tmp, path)?;
    Ok(())
}
