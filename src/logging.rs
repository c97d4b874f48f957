//! Log delivery to an embedding application
//!
//! A [`CallbackLayer`] turns `tracing` events into [`LogRecord`]s and pushes
//! them onto a bounded queue without blocking the emitting thread. One
//! dispatcher thread drains the queue and hands each record to the registered
//! sink. When the queue is full the event is dropped and counted.

use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::thread::JoinHandle;
use tokio::sync::mpsc;
use tracing::Level;
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;

pub const LOG_ERROR: i32 = 0;
pub const LOG_WARN: i32 = 1;
pub const LOG_INFO: i32 = 2;
pub const LOG_DEBUG: i32 = 3;

/// Receives `(level, message)` on the dispatcher thread
pub type LogSink = Box<dyn Fn(i32, &str) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub level: i32,
    pub message: String,
}

/// Numeric level of the callback ABI; `TRACE` is not forwarded.
pub fn level_code(level: &Level) -> Option<i32> {
    match *level {
        Level::ERROR => Some(LOG_ERROR),
        Level::WARN => Some(LOG_WARN),
        Level::INFO => Some(LOG_INFO),
        Level::DEBUG => Some(LOG_DEBUG),
        Level::TRACE => None,
    }
}

/// `tracing` layer feeding the dispatcher queue
pub struct CallbackLayer {
    tx: mpsc::Sender<LogRecord>,
    dropped: Arc<AtomicU64>,
}

impl CallbackLayer {
    fn new(tx: mpsc::Sender<LogRecord>, dropped: Arc<AtomicU64>) -> Self {
        Self { tx, dropped }
    }
}

impl<S> tracing_subscriber::Layer<S> for CallbackLayer
where
    S: tracing::Subscriber,
{
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        let Some(level) = level_code(metadata.level()) else {
            return;
        };

        let mut visitor = LogVisitor::default();
        event.record(&mut visitor);

        let record = LogRecord {
            level,
            message: visitor.message,
        };
        if self.tx.try_send(record).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[derive(Default)]
struct LogVisitor {
    message: String,
}

impl tracing::field::Visit for LogVisitor {
    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == "message" {
            self.message.insert_str(0, value);
        } else {
            let _ = write!(self.message, " {}={}", field.name(), value);
        }
    }

    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message.insert_str(0, &format!("{value:?}"));
        } else {
            let _ = write!(self.message, " {}={:?}", field.name(), value);
        }
    }
}

/// Owns the dispatcher thread and the currently registered sink
pub struct LogDispatcher {
    sink: Arc<Mutex<Option<LogSink>>>,
    dropped: Arc<AtomicU64>,
    handle: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for LogDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogDispatcher")
            .field("dropped", &self.dropped())
            .finish_non_exhaustive()
    }
}

impl LogDispatcher {
    /// Starts the dispatcher thread and returns the layer feeding it.
    ///
    /// The thread exits once every clone of the layer is gone.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the thread cannot be spawned.
    pub fn spawn(capacity: usize) -> std::io::Result<(Self, CallbackLayer)> {
        let (tx, mut rx) = mpsc::channel::<LogRecord>(capacity.max(1));
        let sink: Arc<Mutex<Option<LogSink>>> = Arc::new(Mutex::new(None));
        let dropped = Arc::new(AtomicU64::new(0));

        let thread_sink = Arc::clone(&sink);
        let handle = std::thread::Builder::new()
            .name("phantom-fw-log".into())
            .spawn(move || {
                while let Some(record) = rx.blocking_recv() {
                    let guard = thread_sink.lock().unwrap_or_else(PoisonError::into_inner);
                    if let Some(sink) = guard.as_ref() {
                        sink(record.level, &record.message);
                    }
                }
            })?;

        let layer = CallbackLayer::new(tx, Arc::clone(&dropped));
        Ok((
            Self {
                sink,
                dropped,
                handle: Some(handle),
            },
            layer,
        ))
    }

    /// Replaces the sink; `None` discards records from now on.
    pub fn set_sink(&self, sink: Option<LogSink>) {
        *self.sink.lock().unwrap_or_else(PoisonError::into_inner) = sink;
    }

    /// Events lost to a full queue
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Waits for the thread to drain the queue and exit (after the layer is gone)
    pub fn join(mut self) {
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            eprintln!("phantom-fw: log dispatcher thread panicked");
        }
    }
}

static GLOBAL: OnceLock<Option<LogDispatcher>> = OnceLock::new();

/// Process-wide dispatcher, installed as the global `tracing` subscriber on
/// first use. Returns `None` if the thread could not be started.
pub fn global(capacity: usize) -> Option<&'static LogDispatcher> {
    GLOBAL
        .get_or_init(|| match LogDispatcher::spawn(capacity) {
            Ok((dispatcher, layer)) => {
                let installed = tracing_subscriber::registry()
                    .with(layer)
                    .with(tracing_subscriber::filter::LevelFilter::DEBUG)
                    .try_init();
                if installed.is_err() {
                    eprintln!("phantom-fw: a tracing subscriber is already installed");
                }
                Some(dispatcher)
            }
            Err(e) => {
                eprintln!("phantom-fw: failed to start log dispatcher: {e}");
                None
            }
        })
        .as_ref()
}
