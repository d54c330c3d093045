pub mod command;
pub mod context;
pub mod error;
pub mod stream;
pub mod types;

pub use command::{Command, CommandKind};
pub use context::{ExecutionContext, VdbId};
pub use error::{QueryError, Result};
pub use stream::{count_rows, stream_from_batches, RowStream};
pub use types::ScalarValue;
