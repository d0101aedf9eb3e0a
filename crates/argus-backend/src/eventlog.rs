//! Buffered JSON-lines event log.
//!
//! Every event leaving eventd is appended to the log file as one JSON
//! line. Producers go through a bounded buffer: when it is full they wait
//! `buffer_wait` for the writer to catch up, then drop the event and
//! count the loss rather than stall ingest.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::fs::OpenOptions;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use argus_core::event::Event;

/// Producer handle to the event log.
///
/// Cloneable; dropping every handle closes the buffer and lets the
/// writer task drain and exit.
#[derive(Clone)]
pub struct EventLogWriter {
    tx: mpsc::Sender<Arc<Event>>,
    buffer_wait: Duration,
    dropped: Arc<AtomicU64>,
}

impl EventLogWriter {
    /// Appends an event, waiting at most `buffer_wait` on a full buffer.
    pub async fn log(&self, event: Arc<Event>) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                match tokio::time::timeout(self.buffer_wait, self.tx.send(event)).await {
                    Ok(Ok(())) => {}
                    _ => {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Events lost to a full or closed buffer.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// The background writer owning the log file.
pub struct EventLog {
    writer: EventLogWriter,
    task: JoinHandle<()>,
}

impl EventLog {
    /// Opens (appending) the log file and starts the writer task.
    ///
    /// # Errors
    ///
    /// Returns the I/O error if the file cannot be opened.
    pub async fn open(
        path: impl Into<PathBuf>,
        buffer_size: usize,
        buffer_wait: Duration,
    ) -> std::io::Result<Self> {
        let path = path.into();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        let (tx, mut rx) = mpsc::channel::<Arc<Event>>(buffer_size.max(1));
        let dropped = Arc::new(AtomicU64::new(0));

        let task = tokio::spawn(async move {
            let mut out = BufWriter::new(file);
            while let Some(event) = rx.recv().await {
                let line = match serde_json::to_vec(&*event) {
                    Ok(line) => line,
                    Err(err) => {
                        debug!(error = %err, "skipping unencodable event");
                        continue;
                    }
                };
                if let Err(err) = write_line(&mut out, &line).await {
                    error!(error = %err, "event log write failed");
                    break;
                }
                // Opportunistically drain whatever else is buffered before
                // flushing once.
                while let Ok(event) = rx.try_recv() {
                    match serde_json::to_vec(&*event) {
                        Ok(line) => {
                            if let Err(err) = write_line(&mut out, &line).await {
                                error!(error = %err, "event log write failed");
                                return;
                            }
                        }
                        Err(err) => debug!(error = %err, "skipping unencodable event"),
                    }
                }
                if let Err(err) = out.flush().await {
                    error!(error = %err, "event log flush failed");
                    break;
                }
            }
            let _ = out.flush().await;
            info!(path = %path.display(), "event log writer stopped");
        });

        Ok(Self {
            writer: EventLogWriter {
                tx,
                buffer_wait,
                dropped,
            },
            task,
        })
    }

    /// The producer handle.
    #[must_use]
    pub fn writer(&self) -> EventLogWriter {
        self.writer.clone()
    }

    /// Closes the buffer and waits for the writer to drain.
    pub async fn shutdown(self) {
        let Self { writer, task } = self;
        drop(writer);
        let _ = task.await;
    }
}

async fn write_line(
    out: &mut BufWriter<tokio::fs::File>,
    line: &[u8],
) -> std::io::Result<()> {
    out.write_all(line).await?;
    out.write_all(b"\n").await
}
