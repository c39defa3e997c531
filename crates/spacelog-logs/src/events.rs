use tokio::sync::mpsc;

use spacelog_types::{Severity, StreamKind};

/// Notifications from the engine to its host
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EngineEvent {
    /// Operator-visible status or diagnostic text
    Status { message: String, severity: Severity },
    /// The module log snapshot changed
    ModuleLogUpdated,
    /// The database log snapshot changed
    DatabaseLogUpdated,
}

impl EngineEvent {
    pub fn log_updated(stream: StreamKind) -> Self {
        match stream {
            StreamKind::ModuleLog => Self::ModuleLogUpdated,
            StreamKind::DatabaseLog => Self::DatabaseLogUpdated,
        }
    }
}

/// Callback-style consumer of engine events
pub trait EngineObserver: Send {
    fn on_status(&mut self, message: &str, severity: Severity);

    fn on_module_log_updated(&mut self) {}

    fn on_database_log_updated(&mut self) {}
}

/// Deliver every event to `observer` from a single task until the engine
/// is dropped. Returns the observer.
pub async fn dispatch_events<O>(mut events: mpsc::UnboundedReceiver<EngineEvent>, mut observer: O) -> O
where
    O: EngineObserver,
{
    while let Some(event) = events.recv().await {
        match event {
            EngineEvent::Status { message, severity } => observer.on_status(&message, severity),
            EngineEvent::ModuleLogUpdated => observer.on_module_log_updated(),
            EngineEvent::DatabaseLogUpdated => observer.on_database_log_updated(),
        }
    }
    observer
}
