//! Host-side contract for long enumerations.
//!
//! A chunked command reports its lifecycle as progress frames sharing one
//! `commandId`: `started` (0%), a collecting `in_progress` (5%) once the item
//! count is known, one `in_progress` per processed chunk (interpolated between
//! 5% and 95%), then `completed` (100%) carrying the aggregated result. The
//! terminal response frame is sent separately by the host after `completed`.

use std::fmt;
use std::ops::Range;

use serde_json::{Value, json};
use thiserror::Error;

use crate::{COMMAND_PROGRESS, ProgressPayload, ProgressStatus, RequestId, now_ms};

pub const DEFAULT_CHUNK_SIZE: usize = 10;

/// Progress reported once the item count is known.
pub const COLLECTED_PROGRESS: u32 = 5;

/// Share of the progress bar spent on chunk processing (5% -> 95%).
const PROCESSING_SPAN: f64 = 90.0;

/// How a known number of items is split into chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPlan {
    total_items: usize,
    chunk_size: usize,
}

impl ChunkPlan {
    /// `chunk_size` is clamped to at least 1.
    pub fn new(total_items: usize, chunk_size: usize) -> Self {
        Self {
            total_items,
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn total_items(&self) -> usize {
        self.total_items
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn total_chunks(&self) -> usize {
        self.total_items.div_ceil(self.chunk_size)
    }

    /// Item range covered by chunk `index` (0-based).
    pub fn bounds(&self, index: usize) -> Option<Range<usize>> {
        let start = index.checked_mul(self.chunk_size)?;
        if start >= self.total_items {
            return None;
        }
        Some(start..(start + self.chunk_size).min(self.total_items))
    }

    /// Progress percentage after `chunks_done` chunks.
    pub fn progress_after(&self, chunks_done: usize) -> u32 {
        let total = self.total_chunks();
        if total == 0 {
            return COLLECTED_PROGRESS;
        }
        let done = chunks_done.min(total) as f64;
        (f64::from(COLLECTED_PROGRESS) + done / total as f64 * PROCESSING_SPAN).round() as u32
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanPhase {
    Idle,
    Started,
    Collected,
    Completed,
    Failed,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScanError {
    #[error("cannot {action} while scan is {phase:?}")]
    OutOfOrder {
        action: &'static str,
        phase: ScanPhase,
    },
    #[error("all {total} chunks already reported")]
    ChunksExhausted { total: usize },
}

/// Produces the progress payloads of one chunked command, enforcing the
/// `started -> collected -> chunk* -> completed` order.
#[derive(Debug, Clone)]
pub struct ChunkedScan {
    command_id: RequestId,
    command_type: String,
    chunk_size: usize,
    phase: ScanPhase,
    plan: Option<ChunkPlan>,
    chunks_done: usize,
    processed_items: usize,
    last_progress: u32,
}

impl ChunkedScan {
    pub fn new(
        command_id: impl Into<RequestId>,
        command_type: impl Into<String>,
        chunk_size: usize,
    ) -> Self {
        Self {
            command_id: command_id.into(),
            command_type: command_type.into(),
            chunk_size: chunk_size.max(1),
            phase: ScanPhase::Idle,
            plan: None,
            chunks_done: 0,
            processed_items: 0,
            last_progress: 0,
        }
    }

    pub fn phase(&self) -> ScanPhase {
        self.phase
    }

    pub fn plan(&self) -> Option<ChunkPlan> {
        self.plan
    }

    pub fn chunks_done(&self) -> usize {
        self.chunks_done
    }

    pub fn processed_items(&self) -> usize {
        self.processed_items
    }

    /// Command accepted; item count not known yet.
    pub fn start(&mut self, message: impl Into<String>) -> Result<ProgressPayload, ScanError> {
        self.require_phase(&[ScanPhase::Idle], "start")?;
        self.phase = ScanPhase::Started;
        let mut update = self.update(ProgressStatus::Started, 0, message);
        update.chunk_size = Some(self.chunk_size as u64);
        update.payload = Some(json!({ "chunkSize": self.chunk_size }));
        Ok(update)
    }

    /// Item count known; fixes the chunk plan.
    pub fn collected(
        &mut self,
        total_items: usize,
        message: impl Into<String>,
    ) -> Result<ProgressPayload, ScanError> {
        self.require_phase(&[ScanPhase::Started], "collect")?;
        let plan = ChunkPlan::new(total_items, self.chunk_size);
        self.plan = Some(plan);
        self.phase = ScanPhase::Collected;

        let mut update = self.update(ProgressStatus::InProgress, COLLECTED_PROGRESS, message);
        update.total_items = total_items as u64;
        update.total_chunks = Some(plan.total_chunks() as u64);
        update.chunk_size = Some(plan.chunk_size() as u64);
        update.payload = Some(json!({
            "totalNodes": total_items,
            "totalChunks": plan.total_chunks(),
            "chunkSize": plan.chunk_size(),
        }));
        Ok(update)
    }

    /// One chunk of `items_in_chunk` items finished; `chunk_result` is the
    /// partial result for that chunk only.
    pub fn chunk_done(
        &mut self,
        items_in_chunk: usize,
        found_so_far: usize,
        chunk_result: Value,
    ) -> Result<ProgressPayload, ScanError> {
        self.require_phase(&[ScanPhase::Collected], "report a chunk")?;
        let Some(plan) = self.plan else {
            return Err(ScanError::OutOfOrder {
                action: "report a chunk",
                phase: self.phase,
            });
        };
        let total_chunks = plan.total_chunks();
        if self.chunks_done >= total_chunks {
            return Err(ScanError::ChunksExhausted {
                total: total_chunks,
            });
        }

        self.chunks_done += 1;
        self.processed_items = (self.processed_items + items_in_chunk).min(plan.total_items());

        let message = format!(
            "Processed chunk {}/{}. Found {found_so_far} items so far.",
            self.chunks_done, total_chunks
        );
        let progress = plan.progress_after(self.chunks_done);
        let mut update = self.update(ProgressStatus::InProgress, progress, message);
        update.total_items = plan.total_items() as u64;
        update.current_chunk = Some(self.chunks_done as u64);
        update.total_chunks = Some(total_chunks as u64);
        update.chunk_size = Some(plan.chunk_size() as u64);
        update.payload = Some(json!({
            "currentChunk": self.chunks_done,
            "totalChunks": total_chunks,
            "processedNodes": self.processed_items,
            "textNodesFound": found_so_far,
            "chunkResult": chunk_result,
        }));
        Ok(update)
    }

    /// Final update carrying the aggregated result. Without a prior
    /// [`collected`](Self::collected) call (non-chunked mode) `found` is used
    /// for both item counts.
    pub fn complete(
        &mut self,
        message: impl Into<String>,
        found: usize,
        result: Value,
    ) -> Result<ProgressPayload, ScanError> {
        self.require_phase(&[ScanPhase::Started, ScanPhase::Collected], "complete")?;
        let (total, processed) = match self.plan {
            Some(plan) => (plan.total_items(), self.processed_items),
            None => (found, found),
        };
        self.phase = ScanPhase::Completed;

        let mut update = self.update(ProgressStatus::Completed, 100, message);
        update.total_items = total as u64;
        update.processed_items = processed as u64;
        update.payload = Some(result);
        Ok(update)
    }

    /// Failure report; allowed from any phase.
    pub fn fail(&mut self, message: impl Into<String>, context: Value) -> ProgressPayload {
        self.phase = ScanPhase::Failed;
        let progress = self.last_progress;
        let mut update = self.update(ProgressStatus::Error, progress, message);
        update.payload = Some(context);
        update
    }

    fn require_phase(&self, allowed: &[ScanPhase], action: &'static str) -> Result<(), ScanError> {
        if allowed.contains(&self.phase) {
            Ok(())
        } else {
            Err(ScanError::OutOfOrder {
                action,
                phase: self.phase,
            })
        }
    }

    fn update(
        &mut self,
        status: ProgressStatus,
        progress: u32,
        message: impl Into<String>,
    ) -> ProgressPayload {
        self.last_progress = progress;
        ProgressPayload {
            kind: COMMAND_PROGRESS.to_string(),
            command_id: self.command_id.clone(),
            command_type: self.command_type.clone(),
            status,
            progress,
            total_items: self.plan.map(|p| p.total_items() as u64).unwrap_or(0),
            processed_items: self.processed_items as u64,
            current_chunk: None,
            total_chunks: None,
            chunk_size: None,
            message: message.into(),
            payload: None,
            timestamp: now_ms(),
        }
    }
}

/// Run `process` over one chunk, skipping items that fail.
pub fn collect_chunk<T, R, E: fmt::Display>(
    items: &[T],
    mut process: impl FnMut(&T) -> Result<Option<R>, E>,
) -> Vec<R> {
    let mut found = Vec::new();
    for item in items {
        match process(item) {
            Ok(Some(value)) => found.push(value),
            Ok(None) => {}
            Err(e) => tracing::warn!(err = %e, "skipping item that failed to process"),
        }
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_counts_chunks() {
        assert_eq!(ChunkPlan::new(25, 10).total_chunks(), 3);
        assert_eq!(ChunkPlan::new(30, 10).total_chunks(), 3);
        assert_eq!(ChunkPlan::new(0, 10).total_chunks(), 0);
        assert_eq!(ChunkPlan::new(5, 0).chunk_size(), 1);
        assert_eq!(ChunkPlan::new(5, 0).total_chunks(), 5);
    }

    #[test]
    fn plan_bounds_cover_every_item_once() {
        let plan = ChunkPlan::new(25, 10);
        assert_eq!(plan.bounds(0), Some(0..10));
        assert_eq!(plan.bounds(2), Some(20..25));
        assert_eq!(plan.bounds(3), None);
    }

    #[test]
    fn progress_interpolates_between_five_and_ninety_five() {
        let plan = ChunkPlan::new(25, 10);
        assert_eq!(plan.progress_after(0), 5);
        assert_eq!(plan.progress_after(1), 35);
        assert_eq!(plan.progress_after(2), 65);
        assert_eq!(plan.progress_after(3), 95);
        assert_eq!(plan.progress_after(9), 95);
        assert_eq!(ChunkPlan::new(0, 10).progress_after(0), 5);
    }

    #[test]
    fn full_lifecycle_emits_ordered_updates() {
        let mut scan = ChunkedScan::new("c1", "scan_text_nodes", 10);

        let started = scan.start("Starting").unwrap();
        assert_eq!(started.status, ProgressStatus::Started);
        assert_eq!(started.progress, 0);
        assert_eq!(started.command_id, "c1");

        let collected = scan.collected(25, "Found 25").unwrap();
        assert_eq!(collected.progress, 5);
        assert_eq!(collected.total_items, 25);
        assert_eq!(collected.total_chunks, Some(3));

        let mut last = collected.progress;
        for (i, size) in [10, 10, 5].into_iter().enumerate() {
            let update = scan.chunk_done(size, 0, json!([])).unwrap();
            assert_eq!(update.current_chunk, Some(i as u64 + 1));
            assert_eq!(update.total_chunks, Some(3));
            assert!(update.progress > last);
            last = update.progress;
        }
        assert_eq!(scan.processed_items(), 25);
        assert!(matches!(
            scan.chunk_done(1, 0, json!([])),
            Err(ScanError::ChunksExhausted { total: 3 })
        ));

        let done = scan.complete("done", 25, json!({"n": 25})).unwrap();
        assert!(done.is_finished());
        assert_eq!(done.processed_items, 25);
        assert_eq!(scan.phase(), ScanPhase::Completed);
    }

    #[test]
    fn rejects_out_of_order_transitions() {
        let mut scan = ChunkedScan::new("c1", "scan_text_nodes", 10);
        assert!(matches!(
            scan.collected(3, "too early"),
            Err(ScanError::OutOfOrder { phase: ScanPhase::Idle, .. })
        ));
        scan.start("go").unwrap();
        assert!(scan.start("again").is_err());
        assert!(scan.chunk_done(1, 0, json!([])).is_err());
    }

    #[test]
    fn non_chunked_scan_goes_straight_to_completed() {
        let mut scan = ChunkedScan::new("c2", "scan_text_nodes", 10);
        scan.start("go").unwrap();
        let done = scan.complete("done", 4, json!({"textNodes": []})).unwrap();
        assert_eq!(done.total_items, 4);
        assert_eq!(done.processed_items, 4);
    }

    #[test]
    fn failure_keeps_last_progress() {
        let mut scan = ChunkedScan::new("c3", "scan_text_nodes", 10);
        scan.start("go").unwrap();
        scan.collected(20, "found").unwrap();
        scan.chunk_done(10, 2, json!([])).unwrap();
        let failed = scan.fail("boom", json!({"error": "boom"}));
        assert_eq!(failed.status, ProgressStatus::Error);
        assert_eq!(failed.progress, 50);
        assert_eq!(scan.phase(), ScanPhase::Failed);
    }

    #[test]
    fn collect_chunk_skips_failed_items() {
        let items = [1, 2, 3, 4];
        let found = collect_chunk(&items, |n| match *n {
            2 => Err("corrupt item"),
            3 => Ok(None),
            n => Ok(Some(n * 10)),
        });
        assert_eq!(found, vec![10, 40]);
    }
}
