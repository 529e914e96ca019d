//! Change events carried by the redo log.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Table identity inside the source store.
pub type TableId = i64;

/// Kind of redo segment file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogKind {
    Row,
    Ddl,
}

impl LogKind {
    /// File-kind tag used in segment names.
    pub fn as_str(&self) -> &'static str {
        match self {
            LogKind::Row => "row",
            LogKind::Ddl => "ddl",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "row" => Some(LogKind::Row),
            "ddl" => Some(LogKind::Ddl),
            _ => None,
        }
    }
}

impl fmt::Display for LogKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fully qualified table name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableName {
    pub schema: String,
    pub table: String,
    pub table_id: TableId,
}

impl TableName {
    pub fn new(schema: impl Into<String>, table: impl Into<String>, table_id: TableId) -> Self {
        Self {
            schema: schema.into(),
            table: table.into(),
            table_id,
        }
    }
}

/// A single column value of a changed row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    /// Source-store column type code.
    #[serde(default)]
    pub type_code: u8,
    /// Column flags (primary key, unique, nullable, ...).
    #[serde(default)]
    pub flag: u64,
    #[serde(default)]
    pub value: serde_json::Value,
}

impl Column {
    pub fn new(name: impl Into<String>, value: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            type_code: 0,
            flag: 0,
            value,
        }
    }
}

/// A committed row change.
///
/// `columns` is empty for deletes, `pre_columns` is empty for inserts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowChangedEvent {
    pub start_ts: u64,
    pub commit_ts: u64,
    pub row_id: i64,
    pub table: TableName,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub columns: Vec<Column>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pre_columns: Vec<Column>,
}

impl RowChangedEvent {
    pub fn new(table: TableName, row_id: i64, start_ts: u64, commit_ts: u64) -> Self {
        Self {
            start_ts,
            commit_ts,
            row_id,
            table,
            columns: Vec::new(),
            pre_columns: Vec::new(),
        }
    }

    pub fn with_columns(mut self, columns: Vec<Column>) -> Self {
        self.columns = columns;
        self
    }

    pub fn with_pre_columns(mut self, pre_columns: Vec<Column>) -> Self {
        self.pre_columns = pre_columns;
        self
    }

    pub fn is_delete(&self) -> bool {
        self.columns.is_empty() && !self.pre_columns.is_empty()
    }
}

/// Schema change statement kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DdlType {
    CreateSchema,
    DropSchema,
    CreateTable,
    DropTable,
    TruncateTable,
    RenameTable,
    AddColumn,
    DropColumn,
    ModifyColumn,
    AddIndex,
    DropIndex,
    Other,
}

/// A committed schema change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DdlEvent {
    pub start_ts: u64,
    pub commit_ts: u64,
    pub query: String,
    pub ddl_type: DdlType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table: Option<TableName>,
}

impl DdlEvent {
    pub fn new(query: impl Into<String>, ddl_type: DdlType, start_ts: u64, commit_ts: u64) -> Self {
        Self {
            start_ts,
            commit_ts,
            query: query.into(),
            ddl_type,
            table: None,
        }
    }

    pub fn with_table(mut self, table: TableName) -> Self {
        self.table = Some(table);
        self
    }
}

/// One redo log record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RedoLog {
    Row(RowChangedEvent),
    Ddl(DdlEvent),
}

impl RedoLog {
    pub fn commit_ts(&self) -> u64 {
        match self {
            RedoLog::Row(row) => row.commit_ts,
            RedoLog::Ddl(ddl) => ddl.commit_ts,
        }
    }

    pub fn kind(&self) -> LogKind {
        match self {
            RedoLog::Row(_) => LogKind::Row,
            RedoLog::Ddl(_) => LogKind::Ddl,
        }
    }

    pub fn into_row(self) -> Option<RowChangedEvent> {
        match self {
            RedoLog::Row(row) => Some(row),
            RedoLog::Ddl(_) => None,
        }
    }

    pub fn into_ddl(self) -> Option<DdlEvent> {
        match self {
            RedoLog::Ddl(ddl) => Some(ddl),
            RedoLog::Row(_) => None,
        }
    }
}

impl From<RowChangedEvent> for RedoLog {
    fn from(row: RowChangedEvent) -> Self {
        RedoLog::Row(row)
    }
}

impl From<DdlEvent> for RedoLog {
    fn from(ddl: DdlEvent) -> Self {
        RedoLog::Ddl(ddl)
    }
}
