//! Result log writer.
//!
//! Connection handlers submit entries through a cloneable `LogSink`
//! handle. A single `log-writer` thread drains the channel and writes
//! every entry to each destination as one `write_all` + `flush`, so
//! lines from concurrent connections never interleave and entries from
//! one handler keep their submission order.
//!
//! Line format: `[<timestamp>] <marker><message><reset>`. Console
//! destinations get ANSI colour markers, files get plain text.

use chrono::{DateTime, Local};
use std::fs::File;
use std::io::{self, Write};
use std::thread;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error};

use crate::config::Config;

const RESET: &str = "\x1b[0m";

/// Severity of a result log entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Success,
    Warn,
    Error,
}

impl Severity {
    /// ANSI colour marker: white, green, orange, red
    pub fn marker(self) -> &'static str {
        match self {
            Severity::Info => "\x1b[37m",
            Severity::Success => "\x1b[32m",
            Severity::Warn => "\x1b[38;5;208m",
            Severity::Error => "\x1b[31m",
        }
    }
}

/// One timestamped log line
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub timestamp: DateTime<Local>,
    pub severity: Severity,
    pub message: String,
}

impl LogEntry {
    /// Render the entry as a newline-terminated line
    pub fn format(&self, colored: bool) -> String {
        let timestamp = self.timestamp.format("%Y-%m-%dT%H:%M:%S%.6f");
        if colored {
            format!(
                "[{}] {}{}{}\n",
                timestamp,
                self.severity.marker(),
                self.message,
                RESET
            )
        } else {
            format!("[{}] {}\n", timestamp, self.message)
        }
    }
}

/// A place log lines are written to
pub struct Destination {
    name: String,
    writer: Box<dyn Write + Send>,
    colored: bool,
}

impl Destination {
    /// Standard output, coloured
    pub fn console() -> Self {
        Self::writer("console", io::stdout(), true)
    }

    /// A log file, plain text
    pub fn file(file: File) -> Self {
        Self::writer("file", file, false)
    }

    pub fn writer(name: &str, writer: impl Write + Send + 'static, colored: bool) -> Self {
        Destination {
            name: name.to_string(),
            writer: Box::new(writer),
            colored,
        }
    }

    fn write_entry(&mut self, entry: &LogEntry) -> io::Result<()> {
        self.writer.write_all(entry.format(self.colored).as_bytes())?;
        self.writer.flush()
    }
}

enum Message {
    Entry(LogEntry),
    Flush(oneshot::Sender<()>),
}

/// Handle to the log writer thread
#[derive(Clone)]
pub struct LogSink {
    tx: mpsc::UnboundedSender<Message>,
}

impl LogSink {
    /// Start a writer thread for the given destinations.
    ///
    /// The thread exits once every `LogSink` clone is dropped.
    pub fn spawn(destinations: Vec<Destination>) -> io::Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel();

        thread::Builder::new()
            .name("log-writer".to_string())
            .spawn(move || writer_loop(rx, destinations))?;

        Ok(LogSink { tx })
    }

    /// Build the sink described by the configuration
    pub fn from_config(config: &Config) -> io::Result<Self> {
        Self::spawn(destinations(config)?)
    }

    /// Submit a message. The timestamp is taken now.
    pub fn write(&self, severity: Severity, message: impl Into<String>) {
        let entry = LogEntry {
            timestamp: Local::now(),
            severity,
            message: message.into(),
        };
        if self.tx.send(Message::Entry(entry)).is_err() {
            debug!("Log writer stopped; entry dropped");
        }
    }

    pub fn info(&self, message: impl Into<String>) {
        self.write(Severity::Info, message);
    }

    pub fn success(&self, message: impl Into<String>) {
        self.write(Severity::Success, message);
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.write(Severity::Warn, message);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.write(Severity::Error, message);
    }

    /// Wait until every entry submitted before this call is written
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(Message::Flush(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }
}

/// The log file (created or truncated) plus the console unless quiet
pub fn destinations(config: &Config) -> io::Result<Vec<Destination>> {
    let mut destinations = Vec::with_capacity(2);
    if let Some(ref path) = config.log_file {
        destinations.push(Destination::file(File::create(path)?));
    }
    if !config.quiet {
        destinations.push(Destination::console());
    }
    Ok(destinations)
}

fn writer_loop(mut rx: mpsc::UnboundedReceiver<Message>, mut destinations: Vec<Destination>) {
    while let Some(message) = rx.blocking_recv() {
        match message {
            Message::Entry(entry) => {
                // A destination that fails once is dropped; the rest keep going
                destinations.retain_mut(|dest| match dest.write_entry(&entry) {
                    Ok(()) => true,
                    Err(e) => {
                        error!(destination = %dest.name, error = %e, "Log write failed; destination disabled");
                        false
                    }
                });
            }
            Message::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
}
