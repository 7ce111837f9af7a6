use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStatus {
    GeneratingPrompt,
    GeneratingImage,
    Generating,
}

/// Lifecycle events of the generation session, pushed to every observer.
///
/// Serialized as `{"event": "<kind>", "data": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum GenerationEvent {
    Progress {
        current: u64,
        total: u64,
        status: ProgressStatus,
    },
    Log {
        message: String,
    },
    NewImage {
        path: String,
        current: u64,
        total: u64,
    },
    GenerationComplete {
        total: u64,
    },
    Error {
        message: String,
    },
}

impl GenerationEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Progress { .. } => "progress",
            Self::Log { .. } => "log",
            Self::NewImage { .. } => "new_image",
            Self::GenerationComplete { .. } => "generation_complete",
            Self::Error { .. } => "error",
        }
    }

    /// Streamed expander tokens are broadcast but never journaled.
    pub fn is_journaled(&self) -> bool {
        !matches!(self, Self::Log { .. })
    }
}

/// Fan-out broadcaster for the single "generation" topic.
///
/// Delivery is best effort: subscribers that went away are pruned on the next
/// emit, and a subscriber only sees events emitted after it subscribed.
#[derive(Debug, Clone, Default)]
pub struct EventHub {
    inner: Arc<EventHubInner>,
}

#[derive(Debug, Default)]
struct EventHubInner {
    subscribers: Mutex<Vec<Sender<GenerationEvent>>>,
    journal: Option<EventJournal>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hub that also appends every emitted event to `journal`.
    pub fn with_journal(journal: EventJournal) -> Self {
        Self {
            inner: Arc::new(EventHubInner {
                subscribers: Mutex::new(Vec::new()),
                journal: Some(journal),
            }),
        }
    }

    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::channel();
        match self.inner.subscribers.lock() {
            Ok(mut subscribers) => subscribers.push(tx),
            Err(_) => tracing::warn!("event hub lock poisoned; subscriber will receive nothing"),
        }
        Subscription { rx }
    }

    /// Broadcasts `event` and returns how many subscribers received it.
    pub fn emit(&self, event: GenerationEvent) -> usize {
        if let Some(journal) = self.inner.journal.as_ref().filter(|_| event.is_journaled()) {
            if let Err(err) = journal.append(&event) {
                tracing::warn!(error = %err, "failed to journal generation event");
            }
        }
        let Ok(mut subscribers) = self.inner.subscribers.lock() else {
            return 0;
        };
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        subscribers.len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner
            .subscribers
            .lock()
            .map(|subscribers| subscribers.len())
            .unwrap_or(0)
    }
}

/// Receiving end of an [`EventHub`] subscription. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    rx: Receiver<GenerationEvent>,
}

impl Subscription {
    /// Blocks until the next event; `None` once the hub is gone.
    pub fn recv(&self) -> Option<GenerationEvent> {
        self.rx.recv().ok()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Option<GenerationEvent> {
        match self.rx.recv_timeout(timeout) {
            Ok(event) => Some(event),
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => None,
        }
    }

    pub fn try_recv(&self) -> Option<GenerationEvent> {
        match self.rx.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }

    /// Everything already queued, without blocking.
    pub fn drain(&self) -> Vec<GenerationEvent> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }
}

/// Append-only `events.jsonl` writer.
///
/// Each line is the serialized event merged with a `ts` field, one compact
/// JSON object per line.
#[derive(Debug, Clone)]
pub struct EventJournal {
    inner: Arc<EventJournalInner>,
}

#[derive(Debug)]
struct EventJournalInner {
    path: PathBuf,
    lock: Mutex<()>,
}

impl EventJournal {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            inner: Arc::new(EventJournalInner {
                path: path.into(),
                lock: Mutex::new(()),
            }),
        }
    }

    pub fn append(&self, event: &GenerationEvent) -> anyhow::Result<Value> {
        let mut row = Map::new();
        row.insert("ts".to_string(), Value::String(now_utc_iso()));
        if let Value::Object(fields) = serde_json::to_value(event)? {
            for (key, value) in fields {
                row.insert(key, value);
            }
        }

        if let Some(parent) = self.inner.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let line = serde_json::to_string(&row)?;
        let _guard = self
            .inner
            .lock
            .lock()
            .map_err(|_| anyhow::anyhow!("event journal lock poisoned"))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.inner.path)?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;

        Ok(Value::Object(row))
    }
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}
