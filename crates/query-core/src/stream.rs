//! Pull-based result iteration

use crate::error::Result;
use arrow::record_batch::RecordBatch;

/// A pull-based iterator over result batches, in source order
pub type RowStream = Box<dyn Iterator<Item = Result<RecordBatch>> + Send>;

/// Wrap already-materialized batches as a row stream
pub fn stream_from_batches(batches: Vec<RecordBatch>) -> RowStream {
    Box::new(batches.into_iter().map(Ok))
}

/// Total row count across batches
pub fn count_rows(batches: &[RecordBatch]) -> usize {
    batches.iter().map(|batch| batch.num_rows()).sum()
}
