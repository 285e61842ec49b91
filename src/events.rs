//! Events pair every user visible state change with a stable, machine readable reason.
use crate::resource::ObjectId;

use std::fmt::{self, Display};
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Normal,
    Warning,
}

impl Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            EventType::Normal => f.write_str("Normal"),
            EventType::Warning => f.write_str("Warning"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    /// kind of the involved object, e.g. `ServiceInstance`
    pub kind: &'static str,
    pub object: ObjectId,
    pub event_type: EventType,
    pub reason: String,
    pub message: String,
}

impl Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} {} {}: {} {}",
            self.event_type, self.kind, self.object, self.reason, self.message
        )
    }
}

pub trait EventRecorder: Send + Sync + 'static {
    fn record(&self, event: Event);
}

/// Writes events to the log. Warnings go to `warn`, everything else to `info`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingRecorder;

impl EventRecorder for LoggingRecorder {
    fn record(&self, event: Event) {
        log_event(&event);
    }
}

fn log_event(event: &Event) {
    match event.event_type {
        EventType::Normal => log::info!("Event: {}", event),
        EventType::Warning => log::warn!("Event: {}", event),
    }
}

/// Keeps every event in memory, and logs them too
#[derive(Debug, Default)]
pub struct MemoryRecorder {
    events: Mutex<Vec<Event>>,
}

impl MemoryRecorder {
    pub fn new() -> MemoryRecorder {
        MemoryRecorder::default()
    }

    pub fn events(&self) -> Vec<Event> {
        match self.events.lock() {
            Ok(events) => events.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Reasons of all events recorded for the object, oldest first
    pub fn reasons_for(&self, object: &ObjectId) -> Vec<String> {
        self.events()
            .into_iter()
            .filter(|e| &e.object == object)
            .map(|e| e.reason)
            .collect()
    }

    pub fn clear(&self) {
        if let Ok(mut events) = self.events.lock() {
            events.clear();
        }
    }
}

impl EventRecorder for MemoryRecorder {
    fn record(&self, event: Event) {
        log_event(&event);
        match self.events.lock() {
            Ok(mut events) => events.push(event),
            Err(poisoned) => poisoned.into_inner().push(event),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn memory_recorder_filters_by_object() {
        let recorder = MemoryRecorder::new();
        let a = ObjectId::new("ns", "a");
        let b = ObjectId::new("ns", "b");
        for (object, reason) in &[(&a, "Provisioning"), (&b, "Binding"), (&a, "ProvisionedSuccessfully")] {
            recorder.record(Event {
                kind: "ServiceInstance",
                object: (*object).clone(),
                event_type: EventType::Normal,
                reason: (*reason).to_owned(),
                message: String::new(),
            });
        }
        assert_eq!(vec!["Provisioning", "ProvisionedSuccessfully"], recorder.reasons_for(&a));
        recorder.clear();
        assert!(recorder.events().is_empty());
    }
}
