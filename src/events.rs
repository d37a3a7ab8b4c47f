//! Classifies unsolicited panel messages and fans them out to
//! registered observers. One router per connection, shared through
//! the same `Arc` as the rest of the panel state.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::RiscoError;
use crate::partition::Partition;
use crate::zone::Zone;

/// Opaque token returned by every `add_*_handler` call; pass it to
/// [`EventRouter::remove_handler`] to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

type ZoneHandler = Box<dyn Fn(Zone) + Send + Sync>;
type PartitionHandler = Box<dyn Fn(Partition) + Send + Sync>;
type EventHandler = Box<dyn Fn(&str) + Send + Sync>;
type DefaultHandler = Box<dyn Fn(&str, &str, &[String]) + Send + Sync>;
type ErrorHandler = Box<dyn Fn(&RiscoError) + Send + Sync>;

#[derive(Default)]
struct Handlers {
    zone: Vec<(HandlerId, ZoneHandler)>,
    partition: Vec<(HandlerId, PartitionHandler)>,
    event: Vec<(HandlerId, EventHandler)>,
    default: Vec<(HandlerId, DefaultHandler)>,
    error: Vec<(HandlerId, ErrorHandler)>,
}

/// Dispatches classified panel messages to whichever observer lists
/// are registered. Cheap to clone (wraps an `Arc`); every registration
/// method takes `&self`.
#[derive(Clone, Default)]
pub struct EventRouter {
    handlers: Arc<RwLock<Handlers>>,
    next_id: Arc<AtomicU64>,
}

impl EventRouter {
    pub fn new() -> Self {
        Self::default()
    }

    fn allocate_id(&self) -> HandlerId {
        HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub fn add_zone_handler(&self, handler: impl Fn(Zone) + Send + Sync + 'static) -> HandlerId {
        let id = self.allocate_id();
        self.handlers.write().zone.push((id, Box::new(handler)));
        id
    }

    pub fn add_partition_handler(
        &self,
        handler: impl Fn(Partition) + Send + Sync + 'static,
    ) -> HandlerId {
        let id = self.allocate_id();
        self.handlers
            .write()
            .partition
            .push((id, Box::new(handler)));
        id
    }

    pub fn add_event_handler(&self, handler: impl Fn(&str) + Send + Sync + 'static) -> HandlerId {
        let id = self.allocate_id();
        self.handlers.write().event.push((id, Box::new(handler)));
        id
    }

    pub fn add_default_handler(
        &self,
        handler: impl Fn(&str, &str, &[String]) + Send + Sync + 'static,
    ) -> HandlerId {
        let id = self.allocate_id();
        self.handlers.write().default.push((id, Box::new(handler)));
        id
    }

    pub fn add_error_handler(
        &self,
        handler: impl Fn(&RiscoError) + Send + Sync + 'static,
    ) -> HandlerId {
        let id = self.allocate_id();
        self.handlers.write().error.push((id, Box::new(handler)));
        id
    }

    /// Remove a previously-registered handler of any kind. A no-op if
    /// `id` has already been removed.
    pub fn remove_handler(&self, id: HandlerId) {
        let mut handlers = self.handlers.write();
        handlers.zone.retain(|(h, _)| *h != id);
        handlers.partition.retain(|(h, _)| *h != id);
        handlers.event.retain(|(h, _)| *h != id);
        handlers.default.retain(|(h, _)| *h != id);
        handlers.error.retain(|(h, _)| *h != id);
    }

    pub(crate) fn dispatch_zone(&self, zone: Zone) {
        let handlers = self.handlers.read();
        for (_, handler) in &handlers.zone {
            invoke(|| handler(zone.clone()));
        }
    }

    pub(crate) fn dispatch_partition(&self, partition: Partition) {
        let handlers = self.handlers.read();
        for (_, handler) in &handlers.partition {
            invoke(|| handler(partition.clone()));
        }
    }

    pub(crate) fn dispatch_event(&self, text: &str) {
        let handlers = self.handlers.read();
        for (_, handler) in &handlers.event {
            invoke(|| handler(text));
        }
    }

    pub(crate) fn dispatch_default(&self, command: &str, result: &str, params: &[String]) {
        let handlers = self.handlers.read();
        for (_, handler) in &handlers.default {
            invoke(|| handler(command, result, params));
        }
    }

    pub(crate) fn dispatch_error(&self, error: &RiscoError) {
        let handlers = self.handlers.read();
        for (_, handler) in &handlers.error {
            invoke(|| handler(error));
        }
    }
}

/// Run a single observer, isolating a panic so it can't stop the rest
/// of the dispatch list from running.
fn invoke(f: impl FnOnce()) {
    if std::panic::catch_unwind(std::panic::AssertUnwindSafe(f)).is_err() {
        tracing::warn!("event observer panicked");
    }
}

/// Classify a raw unsolicited payload (already id-stripped by the
/// codec) and report which kind of command it was, for callers that
/// want to update panel inventory before dispatching to observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Classified {
    Clock,
    Event(String),
    ZoneStatus { zone_id: u16, status: String },
    PartitionStatus { partition_id: u16, status: String },
    Default {
        command: String,
        result: String,
        params: Vec<String>,
    },
}

pub(crate) fn classify(payload: &str) -> Classified {
    if payload.starts_with("CLOCK") {
        return Classified::Clock;
    }
    if let Some(rest) = payload.strip_prefix("EVENT=") {
        return Classified::Event(rest.to_string());
    }
    if let Some((zone_id, status)) = numbered_status(payload, "ZSTT") {
        return Classified::ZoneStatus { zone_id, status };
    }
    if let Some((partition_id, status)) = numbered_status(payload, "PSTT") {
        return Classified::PartitionStatus {
            partition_id,
            status,
        };
    }

    let (command, rest) = payload.split_once('=').unwrap_or((payload, ""));
    let mut fields = rest.split('=');
    let result = fields.next().unwrap_or_default().to_string();
    let params: Vec<String> = fields.map(str::to_string).collect();
    Classified::Default {
        command: command.to_string(),
        result,
        params,
    }
}

fn numbered_status(payload: &str, prefix: &str) -> Option<(u16, String)> {
    let rest = payload.strip_prefix(prefix)?;
    let (number, value) = rest.split_once('=')?;
    let id = number.parse::<u16>().ok()?;
    Some((id, value.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn classifies_clock_as_clock() {
        assert_eq!(classify("CLOCK=12:00"), Classified::Clock);
    }

    #[test]
    fn classifies_event() {
        assert_eq!(
            classify("EVENT=armed"),
            Classified::Event("armed".to_string())
        );
    }

    #[test]
    fn classifies_partition_status() {
        assert_eq!(
            classify("PSTT2=ERAH"),
            Classified::PartitionStatus {
                partition_id: 2,
                status: "ERAH".to_string(),
            }
        );
    }

    #[test]
    fn classifies_zone_status() {
        assert_eq!(
            classify("ZSTT10=OA"),
            Classified::ZoneStatus {
                zone_id: 10,
                status: "OA".to_string(),
            }
        );
    }

    #[test]
    fn falls_back_to_default_with_params() {
        match classify("FOO=bar=baz=qux") {
            Classified::Default {
                command,
                result,
                params,
            } => {
                assert_eq!(command, "FOO");
                assert_eq!(result, "bar");
                assert_eq!(params, vec!["baz".to_string(), "qux".to_string()]);
            }
            other => panic!("unexpected classification: {other:?}"),
        }
    }

    #[test]
    fn observer_hygiene_add_then_remove_leaves_set_unchanged() {
        let router = EventRouter::new();
        let count = Arc::new(AtomicUsize::new(0));
        let counted = count.clone();
        let id = router.add_event_handler(move |_| {
            counted.fetch_add(1, Ordering::Relaxed);
        });
        router.remove_handler(id);
        router.dispatch_event("armed");
        assert_eq!(count.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn one_observer_failing_does_not_suppress_others() {
        let router = EventRouter::new();
        let count = Arc::new(AtomicUsize::new(0));
        router.add_event_handler(|_| panic!("boom"));
        let counted = count.clone();
        router.add_event_handler(move |_| {
            counted.fetch_add(1, Ordering::Relaxed);
        });
        let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            router.dispatch_event("armed");
        }));
        // the second handler still ran before the first unwound past it
        assert_eq!(count.load(Ordering::Relaxed), 1);
    }
}
