//! Result materialization
//!
//! A fill drains the source iterator into a [`RowBuffer`]. Readers attach to
//! the buffer and consume batches as they arrive; they block only while the
//! buffer has nothing new and the fill is still running. Once the drain
//! completes the buffer yields an immutable [`MaterializedRows`] snapshot.

use crate::directive::CacheDirective;
use crate::error::{CacheError, CacheResult};
use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;
use parking_lot::{Condvar, Mutex};
use query_core::{count_rows, QueryError, Result, RowStream};
use std::sync::Arc;

/// Estimate the size of record batches in bytes
pub(crate) fn estimate_batch_size(batches: &[RecordBatch]) -> usize {
    batches.iter().map(batch_size).sum()
}

fn batch_size(batch: &RecordBatch) -> usize {
    batch
        .columns()
        .iter()
        .map(|col| col.get_array_memory_size())
        .sum::<usize>()
}

/// Immutable, cheaply clonable snapshot of a result set
#[derive(Debug, Clone)]
pub struct MaterializedRows {
    batches: Arc<[RecordBatch]>,
    size_bytes: usize,
    num_rows: usize,
}

impl MaterializedRows {
    pub fn new(batches: Vec<RecordBatch>) -> Self {
        let size_bytes = estimate_batch_size(&batches);
        let num_rows = count_rows(&batches);
        Self {
            batches: batches.into(),
            size_bytes,
            num_rows,
        }
    }

    pub fn batches(&self) -> &[RecordBatch] {
        &self.batches
    }

    /// Approximate in-memory payload size
    pub fn size_bytes(&self) -> usize {
        self.size_bytes
    }

    pub fn num_rows(&self) -> usize {
        self.num_rows
    }

    pub fn is_empty(&self) -> bool {
        self.num_rows == 0
    }

    /// Schema of the first batch, if any
    pub fn schema(&self) -> Option<SchemaRef> {
        self.batches.first().map(|batch| batch.schema())
    }

    /// Whether both snapshots share the same storage
    pub fn ptr_eq(&self, other: &MaterializedRows) -> bool {
        Arc::ptr_eq(&self.batches, &other.batches)
    }
}

#[derive(Debug)]
enum FillStatus {
    Filling,
    Complete,
    Failed(Arc<QueryError>),
    Cancelled,
}

#[derive(Debug)]
struct BufferState {
    batches: Vec<RecordBatch>,
    size_bytes: usize,
    status: FillStatus,
}

/// Append-only batch buffer shared between a fill and its readers
#[derive(Debug)]
pub struct RowBuffer {
    state: Mutex<BufferState>,
    appended: Condvar,
    /// Bytes past which the rows can no longer be stored
    limit: usize,
}

impl Default for RowBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl RowBuffer {
    pub fn new() -> Self {
        Self::with_limit(usize::MAX)
    }

    /// Create a buffer whose rows are storable only up to `limit` bytes.
    ///
    /// Appending never stops at the limit; readers still get every batch.
    pub fn with_limit(limit: usize) -> Self {
        Self {
            state: Mutex::new(BufferState {
                batches: Vec::new(),
                size_bytes: 0,
                status: FillStatus::Filling,
            }),
            appended: Condvar::new(),
            limit,
        }
    }

    /// Append a batch; returns `false` once the fill has ended
    pub fn push(&self, batch: RecordBatch) -> bool {
        let mut state = self.state.lock();
        if !matches!(state.status, FillStatus::Filling) {
            return false;
        }
        state.size_bytes += batch_size(&batch);
        state.batches.push(batch);
        drop(state);
        self.appended.notify_all();
        true
    }

    /// Mark the fill complete and return the final snapshot
    pub fn complete(&self) -> MaterializedRows {
        let mut state = self.state.lock();
        if matches!(state.status, FillStatus::Filling) {
            state.status = FillStatus::Complete;
        }
        let rows = MaterializedRows::new(state.batches.clone());
        drop(state);
        self.appended.notify_all();
        rows
    }

    /// Fail the fill; every reader observes the same error
    pub fn fail(&self, error: Arc<QueryError>) {
        self.finish_with(FillStatus::Failed(error));
    }

    /// Abandon the fill without a source error
    pub fn cancel(&self) {
        self.finish_with(FillStatus::Cancelled);
    }

    fn finish_with(&self, status: FillStatus) {
        let mut state = self.state.lock();
        if matches!(state.status, FillStatus::Filling) {
            state.status = status;
        }
        drop(state);
        self.appended.notify_all();
    }

    /// Bytes appended so far
    pub fn size_bytes(&self) -> usize {
        self.state.lock().size_bytes
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Whether the rows appended so far outgrew every place they could be stored
    pub fn exceeds_limit(&self) -> bool {
        self.size_bytes() > self.limit
    }

    /// Batches appended so far
    pub fn len(&self) -> usize {
        self.state.lock().batches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_filling(&self) -> bool {
        matches!(self.state.lock().status, FillStatus::Filling)
    }

    /// Attach a reader starting at the first batch
    pub fn reader(self: &Arc<Self>) -> BufferReader {
        BufferReader {
            buffer: Arc::clone(self),
            position: 0,
            done: false,
        }
    }
}

/// Iterator over a possibly still-growing [`RowBuffer`]
#[derive(Debug)]
pub struct BufferReader {
    buffer: Arc<RowBuffer>,
    position: usize,
    done: bool,
}

impl Iterator for BufferReader {
    type Item = Result<RecordBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let mut state = self.buffer.state.lock();
        while state.batches.len() <= self.position && matches!(state.status, FillStatus::Filling) {
            self.buffer.appended.wait(&mut state);
        }

        if let Some(batch) = state.batches.get(self.position) {
            self.position += 1;
            return Some(Ok(batch.clone()));
        }

        self.done = true;
        match &state.status {
            FillStatus::Filling | FillStatus::Complete => None,
            FillStatus::Failed(error) => Some(Err(QueryError::shared(Arc::clone(error)))),
            FillStatus::Cancelled => Some(Err(CacheError::Cancelled.into())),
        }
    }
}

/// Drains source iterators into row buffers according to a directive
#[derive(Debug, Clone, Copy)]
pub struct Materializer {
    read_all: bool,
}

impl Materializer {
    pub fn new(directive: &CacheDirective) -> Self {
        Self {
            read_all: directive.read_all,
        }
    }

    /// Whether readers may attach before the drain completes
    pub fn streams(&self) -> bool {
        !self.read_all
    }

    /// Drain `source` into `buffer`.
    ///
    /// A source error fails the buffer, so attached readers see it too, and is
    /// returned as [`CacheError::Materialization`].
    pub fn materialize(&self, source: RowStream, buffer: &RowBuffer) -> CacheResult<MaterializedRows> {
        for item in source {
            match item {
                Ok(batch) => {
                    if !buffer.push(batch) {
                        return Err(CacheError::Cancelled);
                    }
                }
                Err(err) => {
                    let shared = Arc::new(err);
                    buffer.fail(Arc::clone(&shared));
                    return Err(CacheError::Materialization(shared));
                }
            }
        }
        Ok(buffer.complete())
    }
}
