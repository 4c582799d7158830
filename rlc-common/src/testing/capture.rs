//! In-memory capture of tracing events, for tests that assert on logging.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::field::{Field, Visit};
use tracing::subscriber::DefaultGuard;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedEvent {
    pub level: Level,
    pub message: String,
}

/// Layer collecting every event it sees. Clones share the same buffer.
#[derive(Debug, Clone, Default)]
pub struct LogCapture {
    events: Arc<Mutex<Vec<CapturedEvent>>>,
}

impl LogCapture {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route the current thread's events into this capture until the guard drops.
    pub fn install(&self) -> DefaultGuard {
        tracing::subscriber::set_default(tracing_subscriber::registry().with(self.clone()))
    }

    fn buffer(&self) -> MutexGuard<'_, Vec<CapturedEvent>> {
        self.events.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn events(&self) -> Vec<CapturedEvent> {
        self.buffer().clone()
    }

    pub fn messages(&self) -> Vec<String> {
        self.buffer().iter().map(|e| e.message.clone()).collect()
    }

    pub fn clear(&self) {
        self.buffer().clear();
    }
}

impl<S: Subscriber> Layer<S> for LogCapture {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = MessageVisitor(String::new());
        event.record(&mut visitor);
        self.buffer().push(CapturedEvent {
            level: *event.metadata().level(),
            message: visitor.0,
        });
    }
}

struct MessageVisitor(String);

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.0 = format!("{value:?}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_records_level_and_message() {
        let logs = LogCapture::new();
        {
            let _capture = logs.install();
            tracing::warn!(run = "U1", "Run {} is late", "U1");
        }
        tracing::info!("outside the capture");

        assert_eq!(
            logs.events(),
            vec![CapturedEvent {
                level: Level::WARN,
                message: "Run U1 is late".to_string(),
            }]
        );
        logs.clear();
        assert!(logs.messages().is_empty());
    }
}
