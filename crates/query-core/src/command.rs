//! Commands as handed over by the planner

use crate::types::ScalarValue;
use serde::{Deserialize, Serialize};

/// Kind of command, as classified by the planner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommandKind {
    Query,
    Insert,
    Update,
    Delete,
    Procedure,
    Ddl,
}

impl CommandKind {
    /// Whether the command only reads data
    pub fn is_read_only(&self) -> bool {
        matches!(self, CommandKind::Query)
    }

    /// Stable tag used when hashing a command
    pub fn tag(&self) -> &'static str {
        match self {
            CommandKind::Query => "query",
            CommandKind::Insert => "insert",
            CommandKind::Update => "update",
            CommandKind::Delete => "delete",
            CommandKind::Procedure => "procedure",
            CommandKind::Ddl => "ddl",
        }
    }
}

/// A planned command pushed down to a backing source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    /// Source-level SQL produced by the planner
    pub sql: String,
    /// Command classification
    pub kind: CommandKind,
    /// Literal values bound to the command's placeholders, in order
    pub parameters: Vec<ScalarValue>,
    /// Name of the backing source the command runs against
    pub source: String,
    /// Tables the command reads or writes
    pub tables: Vec<String>,
}

impl Command {
    /// Create a read-only query command
    pub fn query(sql: impl Into<String>) -> Self {
        Self::new(sql, CommandKind::Query)
    }

    /// Create a command of the given kind
    pub fn new(sql: impl Into<String>, kind: CommandKind) -> Self {
        Self {
            sql: sql.into(),
            kind,
            parameters: Vec::new(),
            source: String::new(),
            tables: Vec::new(),
        }
    }

    /// Bind literal parameter values
    pub fn with_parameters<I, V>(mut self, parameters: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<ScalarValue>,
    {
        self.parameters = parameters.into_iter().map(Into::into).collect();
        self
    }

    /// Set the backing source name
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    /// Set the tables touched by the command
    pub fn with_tables<I, S>(mut self, tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tables = tables.into_iter().map(Into::into).collect();
        self
    }

    pub fn is_read_only(&self) -> bool {
        self.kind.is_read_only()
    }
}
