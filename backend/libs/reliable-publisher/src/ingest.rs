//! Record ingestion: delimited fields → [`Transaction`] → job queue.

use pipeline_metrics::PipelineContext;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};
use transaction_schema::Transaction;

use crate::error::JobQueueClosed;
use crate::jobs::JobSender;

/// Progress is logged once per this many records
pub const PROGRESS_EVERY: u64 = 1000;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestSummary {
    /// Records seen, valid or not
    pub records: u64,
    /// Records parsed and queued for publishing
    pub accepted: u64,
    /// Records that failed to parse
    pub rejected: u64,
}

/// Outcome of submitting one record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submitted {
    Queued,
    Rejected,
}

/// Feeds parsed records into the job queue.
///
/// Records that fail to parse are counted as `error`, logged and dropped;
/// they never reach the broker.
pub struct Ingestor {
    sender: JobSender,
    pipeline: Arc<PipelineContext>,
    summary: IngestSummary,
    started: Instant,
}

impl Ingestor {
    pub fn new(sender: JobSender, pipeline: Arc<PipelineContext>) -> Self {
        Self {
            sender,
            pipeline,
            summary: IngestSummary::default(),
            started: Instant::now(),
        }
    }

    /// Parse and enqueue one record, waiting while the queue is full
    pub async fn submit<S: AsRef<str>>(
        &mut self,
        fields: &[S],
    ) -> Result<Submitted, JobQueueClosed> {
        match self.admit(fields) {
            Some(transaction) => {
                self.sender.send(transaction).await?;
                Ok(Submitted::Queued)
            }
            None => Ok(Submitted::Rejected),
        }
    }

    /// Blocking variant of [`Ingestor::submit`] for readers running on a blocking thread
    pub fn submit_blocking<S: AsRef<str>>(
        &mut self,
        fields: &[S],
    ) -> Result<Submitted, JobQueueClosed> {
        match self.admit(fields) {
            Some(transaction) => {
                self.sender.blocking_send(transaction)?;
                Ok(Submitted::Queued)
            }
            None => Ok(Submitted::Rejected),
        }
    }

    pub fn summary(&self) -> IngestSummary {
        self.summary
    }

    /// Close the sending side and return the totals
    pub fn finish(self) -> IngestSummary {
        info!(
            records = self.summary.records,
            accepted = self.summary.accepted,
            rejected = self.summary.rejected,
            elapsed_ms = self.started.elapsed().as_millis() as u64,
            "Ingest finished"
        );
        self.summary
    }

    fn admit<S: AsRef<str>>(&mut self, fields: &[S]) -> Option<Transaction> {
        self.summary.records += 1;
        if self.summary.records % PROGRESS_EVERY == 0 {
            info!(
                records = self.summary.records,
                accepted = self.summary.accepted,
                rejected = self.summary.rejected,
                "Ingest progress"
            );
        }

        match Transaction::parse(fields) {
            Ok(transaction) => {
                self.summary.accepted += 1;
                Some(transaction)
            }
            Err(e) => {
                self.summary.rejected += 1;
                self.pipeline.counters.inc_error();
                warn!(
                    record = self.summary.records,
                    reason = ?e.reason(),
                    error = %e,
                    "Rejected unparseable record"
                );
                None
            }
        }
    }
}
