//! Processing ledger sink and the ClickHouse mirror worker.
//!
//! Every stage execution appends one entry. A failed ledger write is logged
//! and counted but never fails the stage that produced it.

use std::time::Duration;

use clickhouse_client::{insert_ledger_entries, ClickHouseClient};
use pipeline_core::LedgerEntry;
use store::Store;
use telemetry::metrics;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

/// Ledger entries buffered for the mirror before new ones are dropped.
const MIRROR_CHANNEL_CAPACITY: usize = 10_000;

/// Append-only ledger writer shared by all stages.
#[derive(Clone)]
pub struct LedgerSink {
    store: Store,
    mirror: Option<mpsc::Sender<LedgerEntry>>,
}

impl LedgerSink {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            mirror: None,
        }
    }

    /// Also forward every entry to a mirror channel.
    pub fn with_mirror(mut self, mirror: mpsc::Sender<LedgerEntry>) -> Self {
        self.mirror = Some(mirror);
        self
    }

    /// Append an entry.
    pub async fn record(&self, entry: LedgerEntry) {
        debug!(
            operation = %entry.operation,
            scope = %entry.scope,
            status = entry.status.as_str(),
            processed = entry.records_processed,
            failed = entry.records_failed,
            duration_ms = entry.duration_ms,
            "Ledger entry"
        );

        if let Err(e) = self.store.append_ledger(&entry).await {
            metrics().ledger_write_errors.inc();
            error!(
                operation = %entry.operation,
                scope = %entry.scope,
                error = %e,
                "Failed to append ledger entry"
            );
        }

        if let Some(ref mirror) = self.mirror {
            if mirror.try_send(entry).is_err() {
                warn!("Ledger mirror channel full or closed, dropping entry");
            }
        }
    }
}

/// Channel pair connecting a [`LedgerSink`] to a [`LedgerMirror`].
pub fn mirror_channel() -> (mpsc::Sender<LedgerEntry>, mpsc::Receiver<LedgerEntry>) {
    mpsc::channel(MIRROR_CHANNEL_CAPACITY)
}

/// Mirror worker configuration.
#[derive(Debug, Clone)]
pub struct LedgerMirrorConfig {
    /// Entries per ClickHouse insert
    pub batch_size: usize,
    /// Flush a partial batch after this long
    pub flush_interval: Duration,
    /// Maximum retries for a failed insert
    pub max_retries: u32,
    /// Backoff between retries
    pub retry_backoff: Duration,
}

impl Default for LedgerMirrorConfig {
    fn default() -> Self {
        Self {
            batch_size: 500,
            flush_interval: Duration::from_secs(10),
            max_retries: 3,
            retry_backoff: Duration::from_millis(100),
        }
    }
}

/// Batches ledger entries into ClickHouse.
pub struct LedgerMirror {
    receiver: mpsc::Receiver<LedgerEntry>,
    clickhouse: ClickHouseClient,
    config: LedgerMirrorConfig,
}

impl LedgerMirror {
    pub fn new(
        receiver: mpsc::Receiver<LedgerEntry>,
        clickhouse: ClickHouseClient,
        config: LedgerMirrorConfig,
    ) -> Self {
        Self {
            receiver,
            clickhouse,
            config,
        }
    }

    /// Runs until every sender is dropped, then flushes what is left.
    pub async fn run(mut self) {
        let mut buffer: Vec<LedgerEntry> = Vec::with_capacity(self.config.batch_size);
        let mut ticker = tokio::time::interval(self.config.flush_interval);

        loop {
            tokio::select! {
                received = self.receiver.recv() => match received {
                    Some(entry) => {
                        buffer.push(entry);
                        if buffer.len() >= self.config.batch_size {
                            self.flush(&mut buffer).await;
                        }
                    }
                    None => {
                        self.flush(&mut buffer).await;
                        debug!("Ledger mirror stopped");
                        return;
                    }
                },
                _ = ticker.tick() => {
                    self.flush(&mut buffer).await;
                }
            }
        }
    }

    async fn flush(&self, buffer: &mut Vec<LedgerEntry>) {
        if buffer.is_empty() {
            return;
        }

        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                let backoff = self.config.retry_backoff * attempt;
                warn!(
                    attempt = attempt,
                    backoff_ms = %backoff.as_millis(),
                    "Retrying ledger mirror insert"
                );
                tokio::time::sleep(backoff).await;
            }

            match insert_ledger_entries(&self.clickhouse, buffer).await {
                Ok(_) => {
                    buffer.clear();
                    return;
                }
                Err(e) if attempt == self.config.max_retries => {
                    error!(
                        count = buffer.len(),
                        error = %e,
                        "Dropping ledger batch after retries"
                    );
                }
                Err(_) => {}
            }
        }

        buffer.clear();
    }
}
