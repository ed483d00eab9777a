use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// Notification from the engine to whoever hosts it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// Percentage complete, 0..=100.
    Progress(u8),
    Status { message: String, severity: Severity },
}

/// Per-run transfer counters.
///
/// The total is whatever the caller estimated up front; nothing scans the
/// card ahead of time, so without an estimate the percentage stays at 0.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferCounters {
    pub total: u64,
    pub processed: u64,
}

impl TransferCounters {
    pub fn new(total: Option<u64>) -> Self {
        Self {
            total: total.unwrap_or(0),
            processed: 0,
        }
    }

    pub fn percent(&self) -> u8 {
        percent_of(self.processed, self.total)
    }

    /// Percentage the run will be at once the next file is done.
    pub fn next_percent(&self) -> u8 {
        percent_of(self.processed + 1, self.total)
    }
}

fn percent_of(done: u64, total: u64) -> u8 {
    if total == 0 {
        return 0;
    }
    let pct = u128::from(done) * 100 / u128::from(total);
    u8::try_from(pct.min(100)).unwrap_or(100)
}

/// Fire-and-forget sender; a host that stopped listening is not an error.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: Option<mpsc::UnboundedSender<SyncEvent>>,
}

impl EventSink {
    pub fn new(tx: mpsc::UnboundedSender<SyncEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn progress(&self, percent: u8) {
        self.send(SyncEvent::Progress(percent.min(100)));
    }

    pub fn info(&self, message: impl Into<String>) {
        self.status(message.into(), Severity::Info);
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.status(message.into(), Severity::Warning);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.status(message.into(), Severity::Error);
    }

    fn status(&self, message: String, severity: Severity) {
        self.send(SyncEvent::Status { message, severity });
    }

    fn send(&self, event: SyncEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }
}
