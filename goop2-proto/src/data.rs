//! Wire types for the `data/1.0` protocol: one JSON request, one JSON
//! response, per stream.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Per-table insert policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InsertPolicy {
    Owner,
    Email,
    Open,
    Group,
}

impl Default for InsertPolicy {
    fn default() -> Self {
        InsertPolicy::Owner
    }
}

impl InsertPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            InsertPolicy::Owner => "owner",
            InsertPolicy::Email => "email",
            InsertPolicy::Open => "open",
            InsertPolicy::Group => "group",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "owner" => Some(InsertPolicy::Owner),
            "email" => Some(InsertPolicy::Email),
            "open" => Some(InsertPolicy::Open),
            "group" => Some(InsertPolicy::Group),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "kebab-case")]
pub enum DataRequest {
    Tables,
    Describe { table: String },
    CreateTable { name: String, columns: Vec<String> },
    Insert { table: String, data: Value },
    Query {
        table: String,
        #[serde(default)]
        columns: Vec<String>,
        #[serde(default)]
        r#where: Option<String>,
        #[serde(default)]
        args: Vec<Value>,
        #[serde(default)]
        limit: Option<u32>,
        #[serde(default)]
        offset: Option<u32>,
    },
    Update { table: String, id: i64, data: Value },
    Delete { table: String, id: i64 },
    AddColumn { table: String, column: String },
    DropColumn { table: String, column: String },
    SetPolicy { table: String, policy: String },
    RenameTable { table: String, new_name: String },
    DeleteTable { table: String },
    LuaList,
    LuaCall { function: String, #[serde(default)] params: Value },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataResponse {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DataResponse {
    pub fn ok(result: Value) -> Self {
        Self { ok: true, result: Some(result), error: None }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self { ok: false, result: None, error: Some(message.into()) }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableDescriptor {
    pub name: String,
    pub policy: InsertPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnDescriptor {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: String,
    pub policy: InsertPolicy,
    pub columns: Vec<String>,
}
