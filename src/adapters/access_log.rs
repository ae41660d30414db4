use std::{
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use eyre::{Result, WrapErr};
use tokio::{
    fs::{File, OpenOptions},
    io::{AsyncWriteExt, BufWriter},
    sync::mpsc::{self, error::TrySendError},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use crate::{
    metrics,
    ports::access_log::{AccessLog, AccessRecord},
};

pub const ACCESS_LOG_FILE: &str = "access.log";
const FLUSH_INTERVAL: Duration = Duration::from_millis(500);
const FLUSH_EVERY: usize = 64;

/// Access log appending one JSON object per line to `<log_dir>/access.log`.
///
/// Records go through a bounded queue to a single writer task, so the
/// number of log writes in flight does not grow with request concurrency.
pub struct FileAccessLog {
    sender: mpsc::Sender<AccessRecord>,
    dropped: Arc<AtomicU64>,
}

/// Handle on the writer task, used to flush on shutdown.
pub struct AccessLogWriter {
    stop: CancellationToken,
    handle: JoinHandle<()>,
    path: PathBuf,
}

impl FileAccessLog {
    /// Open (or create) the log file and start the writer task.
    pub async fn open(log_dir: impl AsRef<Path>, capacity: usize) -> Result<(Self, AccessLogWriter)> {
        let log_dir = log_dir.as_ref();
        tokio::fs::create_dir_all(log_dir)
            .await
            .wrap_err_with(|| format!("Failed to create log directory {}", log_dir.display()))?;

        let path = log_dir.join(ACCESS_LOG_FILE);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .wrap_err_with(|| format!("Failed to open access log {}", path.display()))?;

        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let stop = CancellationToken::new();
        let handle = tokio::spawn(run_writer(
            receiver,
            BufWriter::with_capacity(8192, file),
            stop.clone(),
        ));
        tracing::info!("Access log writing to {}", path.display());

        Ok((
            Self {
                sender,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            AccessLogWriter { stop, handle, path },
        ))
    }

    /// Records dropped so far because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl AccessLog for FileAccessLog {
    fn submit(&self, record: AccessRecord) {
        match self.sender.try_send(record) {
            Ok(()) => {}
            Err(TrySendError::Full(record)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                metrics::increment_access_log_dropped();
                tracing::debug!("Access log queue full, dropping record {}", record.request_id);
            }
            Err(TrySendError::Closed(record)) => {
                tracing::debug!("Access log closed, dropping record {}", record.request_id);
            }
        }
    }
}

impl AccessLogWriter {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write out queued records, flush and stop the writer.
    pub async fn shutdown(self, timeout: Duration) {
        self.stop.cancel();
        match tokio::time::timeout(timeout, self.handle).await {
            Ok(Ok(())) => tracing::info!("Access log flushed"),
            Ok(Err(e)) => tracing::error!("Access log writer task failed: {}", e),
            Err(_) => tracing::warn!("Access log flush did not finish within {:?}", timeout),
        }
    }
}

async fn run_writer(
    mut receiver: mpsc::Receiver<AccessRecord>,
    mut writer: BufWriter<File>,
    stop: CancellationToken,
) {
    let mut ticker = tokio::time::interval(FLUSH_INTERVAL);
    let mut pending = 0usize;

    loop {
        tokio::select! {
            record = receiver.recv() => {
                let Some(record) = record else { break };
                write_record(&mut writer, &record).await;
                pending += 1;
                if pending >= FLUSH_EVERY {
                    flush(&mut writer).await;
                    pending = 0;
                }
            }
            _ = ticker.tick() => {
                if pending > 0 {
                    flush(&mut writer).await;
                    pending = 0;
                }
            }
            _ = stop.cancelled() => {
                // Drain what was accepted before the stop
                receiver.close();
                while let Some(record) = receiver.recv().await {
                    write_record(&mut writer, &record).await;
                }
                break;
            }
        }
    }

    flush(&mut writer).await;
}

async fn write_record(writer: &mut BufWriter<File>, record: &AccessRecord) {
    let mut line = match serde_json::to_vec(record) {
        Ok(line) => line,
        Err(e) => {
            tracing::error!("Failed to serialize access record: {}", e);
            return;
        }
    };
    line.push(b'\n');
    if let Err(e) = writer.write_all(&line).await {
        tracing::error!("Failed to write access record: {}", e);
    }
}

async fn flush(writer: &mut BufWriter<File>) {
    if let Err(e) = writer.flush().await {
        tracing::error!("Failed to flush access log: {}", e);
    }
}
