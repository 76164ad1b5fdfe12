use std::collections::VecDeque;

use berth_instance::{LogLevel, LogRecord, LogSource};
use parking_lot::Mutex;
use tokio::sync::mpsc;

pub const DEFAULT_MAX_RECORDS: usize = 10_000;

struct Subscriber {
    /// When set, only records for this instance id are delivered.
    instance_id: Option<String>,
    tx: mpsc::UnboundedSender<LogRecord>,
}

struct Inner {
    records: VecDeque<LogRecord>,
    subscribers: Vec<Subscriber>,
}

/// Bounded in-memory ring of structured log records with fan-out to
/// WebSocket subscribers. Delivery is best-effort: a subscriber whose
/// channel is gone is dropped on the next emit, never blocked on.
pub struct LogBus {
    max_records: usize,
    inner: Mutex<Inner>,
}

impl LogBus {
    pub fn new(max_records: usize) -> Self {
        Self {
            max_records,
            inner: Mutex::new(Inner {
                records: VecDeque::with_capacity(max_records.min(1024)),
                subscribers: Vec::new(),
            }),
        }
    }

    /// Append a record, evicting exactly one oldest record when full, and
    /// broadcast it to every matching subscriber.
    pub fn emit(&self, record: LogRecord) {
        let mut inner = self.inner.lock();
        if inner.records.len() >= self.max_records {
            inner.records.pop_front();
        }
        inner.records.push_back(record.clone());

        inner.subscribers.retain(|sub| {
            let matches = sub
                .instance_id
                .as_deref()
                .is_none_or(|want| record.instance_id.as_deref() == Some(want));
            if !matches {
                return true;
            }
            sub.tx.send(record.clone()).is_ok()
        });
    }

    /// Register a subscriber and return its initial snapshot (optionally
    /// filtered by instance id) plus the live receiver. Dropping the receiver
    /// is a clean unsubscribe.
    pub fn subscribe(
        &self,
        instance_id: Option<String>,
    ) -> (Vec<LogRecord>, mpsc::UnboundedReceiver<LogRecord>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock();
        let snapshot = inner
            .records
            .iter()
            .filter(|r| {
                instance_id
                    .as_deref()
                    .is_none_or(|want| r.instance_id.as_deref() == Some(want))
            })
            .cloned()
            .collect();
        inner.subscribers.push(Subscriber { instance_id, tx });
        (snapshot, rx)
    }

    pub fn system(&self, level: LogLevel, message: impl Into<String>) {
        self.emit(LogRecord::system(level, message));
    }

    pub fn lifecycle(
        &self,
        instance_id: &str,
        instance_name: &str,
        level: LogLevel,
        message: impl Into<String>,
    ) {
        self.emit(LogRecord::lifecycle(instance_id, instance_name, level, message));
    }

    pub fn output(
        &self,
        instance_id: &str,
        instance_name: &str,
        source: LogSource,
        level: LogLevel,
        line: impl Into<String>,
    ) {
        self.emit(LogRecord::output(instance_id, instance_name, source, level, line));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_is_bounded_and_evicts_one_oldest() {
        let bus = LogBus::new(3);
        for i in 0..5 {
            bus.system(LogLevel::Info, format!("m{i}"));
        }

        let (snapshot, _rx) = bus.subscribe(None);
        let messages: Vec<_> = snapshot.iter().map(|r| r.message.as_str()).collect();
        assert_eq!(messages, vec!["m2", "m3", "m4"]);
    }

    #[tokio::test]
    async fn subscribers_see_records_emitted_after_their_snapshot() {
        let bus = LogBus::new(16);
        bus.system(LogLevel::Info, "before");

        let (snapshot, mut rx) = bus.subscribe(None);
        assert_eq!(snapshot.len(), 1);

        bus.system(LogLevel::Warn, "after");
        let live = rx.recv().await.unwrap();
        assert_eq!(live.message, "after");
    }

    #[tokio::test]
    async fn instance_filter_applies_to_snapshot_and_stream() {
        let bus = LogBus::new(16);
        bus.lifecycle("a", "alpha", LogLevel::Info, "created");
        bus.lifecycle("b", "beta", LogLevel::Info, "created");

        let (snapshot, mut rx) = bus.subscribe(Some("a".to_string()));
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].instance_id.as_deref(), Some("a"));

        bus.lifecycle("b", "beta", LogLevel::Info, "started");
        bus.lifecycle("a", "alpha", LogLevel::Info, "started");
        let live = rx.recv().await.unwrap();
        assert_eq!(live.instance_id.as_deref(), Some("a"));
        assert_eq!(live.message, "started");
    }

    #[test]
    fn dead_subscribers_are_dropped_on_emit() {
        let bus = LogBus::new(16);
        let (_snapshot, rx) = bus.subscribe(None);
        drop(rx);

        bus.system(LogLevel::Info, "ping");
        assert_eq!(bus.inner.lock().subscribers.len(), 0);
    }
}
