//! Dispatches segment attempts under a concurrency bound.
//!
//! All attempts are futures polled by the scheduler's own task, so the job's
//! segment list and the inflight set are only ever touched from here.
//! Attempts work on a copy of their segment and return it on completion;
//! byte-level progress comes back over a channel tagged with the request id
//! so ticks from a finished attempt can be told apart and dropped.

use crate::errors::{UploadError, UploadResult};
use crate::models::job::{ProgressUpdate, UploadJob};
use crate::services::segment_uploader::{AttemptOutcome, SegmentUploader};
use crate::services::source::ByteSource;
use crate::services::transport::{ProgressFn, Transport};
use futures::{
    FutureExt, StreamExt,
    future::BoxFuture,
    stream::FuturesUnordered,
};
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedSender};
use tracing::{debug, info};

/// A segment currently owned by a running attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InflightEntry {
    pub request_id: u64,
    pub segment_index: usize,
}

#[derive(Debug)]
struct ProgressEvent {
    request_id: u64,
    index: usize,
    bytes_sent: u64,
}

/// Counters collected while the scheduler runs.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub attempts: u64,
    pub failures: u64,
    pub max_inflight: usize,
}

pub struct ChunkScheduler<'j> {
    job: &'j mut UploadJob,
    /// Segments waiting for an attempt. Popped from the back, so a segment
    /// that just failed is the next one retried.
    unsent: Vec<usize>,
    inflight: Vec<InflightEntry>,
    failures: Vec<u32>,
    next_request_id: u64,
    max_segment_attempts: Option<u32>,
    stats: SchedulerStats,
}

impl<'j> ChunkScheduler<'j> {
    pub fn new(job: &'j mut UploadJob, max_segment_attempts: Option<u32>) -> Self {
        let unsent = job
            .segments
            .iter()
            .filter(|segment| !segment.done)
            .map(|segment| segment.index)
            .collect();
        let failures = vec![0; job.segments.len()];
        Self {
            job,
            unsent,
            inflight: Vec::new(),
            failures,
            next_request_id: 0,
            max_segment_attempts,
            stats: SchedulerStats::default(),
        }
    }

    pub fn inflight(&self) -> &[InflightEntry] {
        &self.inflight
    }

    pub fn stats(&self) -> &SchedulerStats {
        &self.stats
    }

    /// Upload every pending segment and return the byte count of the
    /// completed job.
    ///
    /// Segment failures are retried until they succeed (or the optional
    /// attempt ceiling is hit); only the ceiling surfaces as an error.
    pub async fn run<'u, 'a: 'u, T, S, P>(
        &mut self,
        uploader: &'u SegmentUploader<'a, T, S>,
        on_progress: &mut P,
    ) -> UploadResult<u64>
    where
        T: Transport + 'u,
        S: ByteSource + 'u,
        P: FnMut(ProgressUpdate),
    {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut pending: FuturesUnordered<BoxFuture<'u, AttemptOutcome>> =
            FuturesUnordered::new();

        loop {
            if self.job.is_complete() {
                if self.job.completion.fire() {
                    info!(
                        "all {} segments stored after {} attempts",
                        self.job.segments.len(),
                        self.stats.attempts
                    );
                }
                return Ok(self.job.completed_bytes());
            }

            self.dispatch(uploader, &tx, &mut pending);
            debug_assert!(!pending.is_empty(), "incomplete job with nothing in flight");

            tokio::select! {
                biased;
                Some(event) = rx.recv() => self.apply_progress(event, on_progress),
                Some(outcome) = pending.next() => self.complete(outcome, on_progress)?,
            }
        }
    }

    /// Start attempts until the inflight set is full or nothing is waiting.
    fn dispatch<'u, 'a: 'u, T, S>(
        &mut self,
        uploader: &'u SegmentUploader<'a, T, S>,
        tx: &UnboundedSender<ProgressEvent>,
        pending: &mut FuturesUnordered<BoxFuture<'u, AttemptOutcome>>,
    ) where
        T: Transport + 'u,
        S: ByteSource + 'u,
    {
        while self.inflight.len() < self.job.concurrency {
            let Some(index) = self.unsent.pop() else {
                break;
            };
            let request_id = self.next_request_id;
            self.next_request_id += 1;

            self.inflight.push(InflightEntry {
                request_id,
                segment_index: index,
            });
            self.stats.attempts += 1;
            self.stats.max_inflight = self.stats.max_inflight.max(self.inflight.len());
            debug!(
                "dispatching segment {} as request {} ({} in flight)",
                index,
                request_id,
                self.inflight.len()
            );

            let segment = self.job.segments[index].clone();
            let progress = progress_sender(tx.clone(), request_id, index);
            pending.push(uploader.run(request_id, segment, progress).boxed());
        }
    }

    fn apply_progress<P: FnMut(ProgressUpdate)>(&mut self, event: ProgressEvent, on_progress: &mut P) {
        if !self
            .inflight
            .iter()
            .any(|entry| entry.request_id == event.request_id)
        {
            return;
        }
        let segment = &mut self.job.segments[event.index];
        let previous = segment.bytes_sent;
        segment.bytes_sent = event.bytes_sent;
        self.report(event.bytes_sent as i64 - previous as i64, on_progress);
    }

    fn complete<P: FnMut(ProgressUpdate)>(
        &mut self,
        outcome: AttemptOutcome,
        on_progress: &mut P,
    ) -> UploadResult<()> {
        let state = outcome.state();
        let AttemptOutcome {
            request_id,
            segment,
            result,
        } = outcome;
        let index = segment.index;
        self.inflight.retain(|entry| entry.request_id != request_id);

        let previous = self.job.segments[index].bytes_sent;
        self.job.segments[index] = segment;
        let current = self.job.segments[index].bytes_sent;
        if current != previous {
            self.report(current as i64 - previous as i64, on_progress);
        }

        if self.job.segments[index].done {
            debug!(
                "segment {} finished as {:?} (request {})",
                index, state, request_id
            );
            return Ok(());
        }

        self.failures[index] += 1;
        self.stats.failures += 1;
        if let Some(max) = self.max_segment_attempts {
            if self.failures[index] >= max {
                let source = match result {
                    Err(err) => err,
                    Ok(state) => UploadError::Transport(format!(
                        "attempt ended in {:?} without storing the segment",
                        state
                    )),
                };
                return Err(UploadError::SegmentRetriesExhausted {
                    index,
                    attempts: self.failures[index],
                    source: Box::new(source),
                });
            }
        }
        self.unsent.push(index);
        Ok(())
    }

    fn report<P: FnMut(ProgressUpdate)>(&self, delta: i64, on_progress: &mut P) {
        on_progress(ProgressUpdate {
            fraction: self.job.progress_fraction(),
            delta,
            total_bytes_sent: self.job.bytes_sent(),
        });
    }
}

fn progress_sender(
    tx: UnboundedSender<ProgressEvent>,
    request_id: u64,
    index: usize,
) -> ProgressFn {
    Arc::new(move |bytes_sent| {
        // The receiver only goes away once the scheduler has returned.
        let _ = tx.send(ProgressEvent {
            request_id,
            index,
            bytes_sent,
        });
    })
}
