//! Append-only profiling sink. Events are buffered under one mutex and
//! written out as a JSON array to `<prefix>_<timestamp>.json`.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use serde::Serialize;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    Session,
    Node,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProfileEvent {
    pub category: EventCategory,
    pub name: String,
    /// Microseconds since the profiler was created.
    pub timestamp_us: u128,
    pub duration_us: u128,
    pub args: BTreeMap<String, String>,
}

pub struct Profiler {
    enabled: bool,
    prefix: String,
    origin: Instant,
    events: Mutex<Vec<ProfileEvent>>,
}

impl Profiler {
    pub fn new(enabled: bool, prefix: impl Into<String>) -> Self {
        Self {
            enabled,
            prefix: prefix.into(),
            origin: Instant::now(),
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Start-of-interval marker; pair with `record`.
    pub fn start(&self) -> Instant {
        Instant::now()
    }

    pub fn record(
        &self,
        category: EventCategory,
        name: impl Into<String>,
        start: Instant,
        args: BTreeMap<String, String>,
    ) {
        if !self.enabled {
            return;
        }
        let event = ProfileEvent {
            category,
            name: name.into(),
            timestamp_us: start.duration_since(self.origin).as_micros(),
            duration_us: start.elapsed().as_micros(),
            args,
        };
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }

    /// Write the collected events and return the file path.
    pub fn flush(&self) -> Result<PathBuf> {
        if !self.enabled {
            return Err(Error::invalid_argument("profiling is not enabled"));
        }
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let path = PathBuf::from(format!("{}_{}.json", self.prefix, timestamp));
        let events = self
            .events
            .lock()
            .map_err(|_| Error::internal("profiler mutex poisoned"))?;
        let json = serde_json::to_string_pretty(&*events)
            .map_err(|err| Error::internal(format!("profiler serialization failed: {}", err)))?;
        std::fs::write(&path, json)
            .map_err(|err| Error::internal(format!("profiler write failed: {}", err)))?;
        Ok(path)
    }

    #[cfg(test)]
    pub(crate) fn event_count(&self) -> usize {
        self.events.lock().map(|e| e.len()).unwrap_or(0)
    }
}

/// Convenience map builder for event args.
pub fn event_args(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_profiler_drops_events() {
        let profiler = Profiler::new(false, "p");
        let start = profiler.start();
        profiler.record(EventCategory::Session, "x", start, BTreeMap::new());
        assert_eq!(profiler.event_count(), 0);
        assert!(profiler.flush().is_err());
    }

    #[test]
    fn enabled_profiler_buffers_events() {
        let profiler = Profiler::new(true, "p");
        let start = profiler.start();
        profiler.record(
            EventCategory::Node,
            "n_kernel_time",
            start,
            event_args(&[("op_name", "Abs")]),
        );
        assert_eq!(profiler.event_count(), 1);
    }
}
