//! Storage (C3): a SQLite-backed table/row API with per-table insert
//! policy and server-side identity stamping.
//!
//! User tables are arbitrary-column SQLite tables prefixed `ut_` so they
//! never collide with the catalog tables below. Every row carries system
//! columns (`_id`, `_owner`, `_owner_email`, `_created_at`, `_updated_at`)
//! that the caller can never set directly — `insert` always stamps them
//! server-side.

use goop2_proto::data::InsertPolicy;
use goop2_proto::{GoopError, GoopResult};
use parking_lot::Mutex;
use rusqlite::{params, params_from_iter, Connection, Row};
use serde_json::{Map, Value};

/// Hard cap on rows returned by a single `select`.
pub const MAX_ROWS: usize = 1000;
/// Hard cap on the serialized size of a single `select` result.
pub const MAX_RESULT_BYTES: usize = 1024 * 1024;

const SYSTEM_COLUMNS: &[&str] = &["_id", "_owner", "_owner_email", "_created_at", "_updated_at"];

pub struct Storage {
    conn: Mutex<Connection>,
}

#[derive(Debug, Clone)]
pub struct TableInfo {
    pub name: String,
    pub policy: InsertPolicy,
    pub columns: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct SelectOptions {
    pub columns: Vec<String>,
    pub where_clause: Option<String>,
    pub args: Vec<Value>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

impl Storage {
    pub fn open(path: &std::path::Path) -> GoopResult<Self> {
        let conn = Connection::open(path)?;
        let storage = Self { conn: Mutex::new(conn) };
        storage.init()?;
        Ok(storage)
    }

    pub fn open_memory() -> GoopResult<Self> {
        let conn = Connection::open_in_memory()?;
        let storage = Self { conn: Mutex::new(conn) };
        storage.init()?;
        Ok(storage)
    }

    fn init(&self) -> GoopResult<()> {
        let conn = self.conn.lock();
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS _tables (
                name    TEXT PRIMARY KEY,
                policy  TEXT NOT NULL DEFAULT 'owner'
             );",
        )?;
        Ok(())
    }

    fn table_exists(conn: &Connection, name: &str) -> GoopResult<bool> {
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM _tables WHERE name = ?1", params![name], |r| r.get(0))?;
        Ok(count > 0)
    }

    fn require_table(conn: &Connection, name: &str) -> GoopResult<()> {
        if !Self::table_exists(conn, name)? {
            return Err(GoopError::NotFound(format!("no such table: {name}")));
        }
        Ok(())
    }

    fn sql_name(name: &str) -> GoopResult<String> {
        if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') || name.starts_with('_') {
            return Err(GoopError::BadRequest(format!("invalid table/column name: {name}")));
        }
        Ok(format!("ut_{name}"))
    }

    fn sql_col(name: &str) -> GoopResult<&str> {
        if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') || name.starts_with('_') {
            return Err(GoopError::BadRequest(format!("invalid column name: {name}")));
        }
        Ok(name)
    }

    pub fn tables(&self) -> GoopResult<Vec<TableInfo>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT name, policy FROM _tables ORDER BY name")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?;
        let mut out = Vec::new();
        for r in rows {
            let (name, policy) = r?;
            let columns = Self::columns_of(&conn, &name)?;
            out.push(TableInfo { policy: InsertPolicy::parse(&policy).unwrap_or_default(), name, columns });
        }
        Ok(out)
    }

    fn columns_of(conn: &Connection, name: &str) -> GoopResult<Vec<String>> {
        let sql_table = Self::sql_name(name)?;
        let mut stmt = conn.prepare(&format!("PRAGMA table_info({sql_table})"))?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(1))?;
        let mut cols = Vec::new();
        for r in rows {
            let c = r?;
            if !SYSTEM_COLUMNS.contains(&c.as_str()) {
                cols.push(c);
            }
        }
        Ok(cols)
    }

    pub fn describe(&self, table: &str) -> GoopResult<TableInfo> {
        let conn = self.conn.lock();
        Self::require_table(&conn, table)?;
        let policy: String = conn.query_row("SELECT policy FROM _tables WHERE name = ?1", params![table], |r| r.get(0))?;
        let columns = Self::columns_of(&conn, table)?;
        Ok(TableInfo { name: table.to_string(), policy: InsertPolicy::parse(&policy).unwrap_or_default(), columns })
    }

    pub fn create_table(&self, name: &str, columns: &[String]) -> GoopResult<()> {
        let conn = self.conn.lock();
        if Self::table_exists(&conn, name)? {
            return Err(GoopError::Conflict(format!("table already exists: {name}")));
        }
        let sql_table = Self::sql_name(name)?;
        let mut col_defs = String::new();
        for c in columns {
            let col = Self::sql_col(c)?;
            col_defs.push_str(&format!(", {col} TEXT"));
        }
        conn.execute(
            &format!(
                "CREATE TABLE {sql_table} (
                    _id INTEGER PRIMARY KEY AUTOINCREMENT,
                    _owner TEXT NOT NULL,
                    _owner_email TEXT,
                    _created_at INTEGER NOT NULL,
                    _updated_at INTEGER NOT NULL
                    {col_defs}
                )"
            ),
            [],
        )?;
        conn.execute(
            "INSERT INTO _tables (name, policy) VALUES (?1, 'owner')",
            params![name],
        )?;
        Ok(())
    }

    pub fn delete_table(&self, name: &str) -> GoopResult<()> {
        let conn = self.conn.lock();
        Self::require_table(&conn, name)?;
        let sql_table = Self::sql_name(name)?;
        conn.execute(&format!("DROP TABLE {sql_table}"), [])?;
        conn.execute("DELETE FROM _tables WHERE name = ?1", params![name])?;
        Ok(())
    }

    pub fn rename_table(&self, name: &str, new_name: &str) -> GoopResult<()> {
        let conn = self.conn.lock();
        Self::require_table(&conn, name)?;
        if Self::table_exists(&conn, new_name)? {
            return Err(GoopError::Conflict(format!("table already exists: {new_name}")));
        }
        let old_sql = Self::sql_name(name)?;
        let new_sql = Self::sql_name(new_name)?;
        conn.execute(&format!("ALTER TABLE {old_sql} RENAME TO {new_sql}"), [])?;
        conn.execute("UPDATE _tables SET name = ?1 WHERE name = ?2", params![new_name, name])?;
        Ok(())
    }

    pub fn add_column(&self, table: &str, column: &str) -> GoopResult<()> {
        let conn = self.conn.lock();
        Self::require_table(&conn, table)?;
        let sql_table = Self::sql_name(table)?;
        let col = Self::sql_col(column)?;
        conn.execute(&format!("ALTER TABLE {sql_table} ADD COLUMN {col} TEXT"), [])?;
        Ok(())
    }

    pub fn drop_column(&self, table: &str, column: &str) -> GoopResult<()> {
        let conn = self.conn.lock();
        Self::require_table(&conn, table)?;
        let sql_table = Self::sql_name(table)?;
        let col = Self::sql_col(column)?;
        conn.execute(&format!("ALTER TABLE {sql_table} DROP COLUMN {col}"), [])?;
        Ok(())
    }

    pub fn set_policy(&self, table: &str, policy: InsertPolicy) -> GoopResult<()> {
        let conn = self.conn.lock();
        Self::require_table(&conn, table)?;
        conn.execute("UPDATE _tables SET policy = ?1 WHERE name = ?2", params![policy.as_str(), table])?;
        Ok(())
    }

    /// Insert a row, enforcing the table's insert policy and stamping
    /// `_owner`/`_owner_email` server-side. `caller_peer_id` is always the
    /// authenticated remote peer id for remote calls, or the local self id
    /// otherwise — callers must never read it from the request body.
    pub fn insert(
        &self,
        table: &str,
        caller_peer_id: &str,
        caller_email: Option<&str>,
        is_group_member: impl FnOnce() -> bool,
        is_self: bool,
        verified_emails: &[String],
        values: &Map<String, Value>,
    ) -> GoopResult<i64> {
        let conn = self.conn.lock();
        Self::require_table(&conn, table)?;
        let policy_str: String = conn.query_row("SELECT policy FROM _tables WHERE name = ?1", params![table], |r| r.get(0))?;
        let policy = InsertPolicy::parse(&policy_str).unwrap_or_default();

        let allowed = match policy {
            InsertPolicy::Owner => is_self,
            InsertPolicy::Email => caller_email.map(|e| verified_emails.iter().any(|v| v == e)).unwrap_or(false),
            InsertPolicy::Open => true,
            InsertPolicy::Group => is_group_member(),
        };
        if !allowed {
            return Err(GoopError::Forbidden(format!("insert policy {} rejects this caller", policy.as_str())));
        }

        let columns = Self::columns_of(&conn, table)?;
        let sql_table = Self::sql_name(table)?;
        let now = chrono::Utc::now().timestamp_millis();

        let mut col_names = vec!["_owner".to_string(), "_owner_email".to_string(), "_created_at".to_string(), "_updated_at".to_string()];
        let mut placeholders = vec!["?1".to_string(), "?2".to_string(), "?3".to_string(), "?4".to_string()];
        let mut bind: Vec<Value> = vec![
            Value::String(caller_peer_id.to_string()),
            caller_email.map(|e| Value::String(e.to_string())).unwrap_or(Value::Null),
            Value::Number(now.into()),
            Value::Number(now.into()),
        ];
        let mut idx = 5;
        for col in &columns {
            if let Some(v) = values.get(col) {
                col_names.push(col.clone());
                placeholders.push(format!("?{idx}"));
                bind.push(v.clone());
                idx += 1;
            }
        }

        let sql = format!(
            "INSERT INTO {sql_table} ({}) VALUES ({})",
            col_names.join(", "),
            placeholders.join(", ")
        );
        let params: Vec<Box<dyn rusqlite::ToSql>> = bind.iter().map(value_to_sql).collect();
        conn.execute(&sql, params_from_iter(params.iter().map(|b| b.as_ref())))?;
        Ok(conn.last_insert_rowid())
    }

    /// Restricted update: only rows where `_owner == caller_peer_id`, unless
    /// `is_self` (the local peer may update any row).
    pub fn update(&self, table: &str, id: i64, caller_peer_id: &str, is_self: bool, values: &Map<String, Value>) -> GoopResult<()> {
        let conn = self.conn.lock();
        Self::require_table(&conn, table)?;
        let sql_table = Self::sql_name(table)?;
        let owner = Self::owner_of(&conn, &sql_table, id)?;
        if !is_self && owner.as_deref() != Some(caller_peer_id) {
            return Err(GoopError::Forbidden("can only update rows you own".to_string()));
        }
        let columns = Self::columns_of(&conn, table)?;
        let now = chrono::Utc::now().timestamp_millis();
        let mut sets = vec!["_updated_at = ?1".to_string()];
        let mut bind: Vec<Value> = vec![Value::Number(now.into())];
        let mut idx = 2;
        for col in &columns {
            if let Some(v) = values.get(col) {
                sets.push(format!("{col} = ?{idx}"));
                bind.push(v.clone());
                idx += 1;
            }
        }
        bind.push(Value::Number(id.into()));
        let sql = format!("UPDATE {sql_table} SET {} WHERE _id = ?{idx}", sets.join(", "));
        let params: Vec<Box<dyn rusqlite::ToSql>> = bind.iter().map(value_to_sql).collect();
        let changed = conn.execute(&sql, params_from_iter(params.iter().map(|b| b.as_ref())))?;
        if changed == 0 {
            return Err(GoopError::NotFound(format!("no such row: {id}")));
        }
        Ok(())
    }

    pub fn delete(&self, table: &str, id: i64, caller_peer_id: &str, is_self: bool) -> GoopResult<()> {
        let conn = self.conn.lock();
        Self::require_table(&conn, table)?;
        let sql_table = Self::sql_name(table)?;
        let owner = Self::owner_of(&conn, &sql_table, id)?;
        if !is_self && owner.as_deref() != Some(caller_peer_id) {
            return Err(GoopError::Forbidden("can only delete rows you own".to_string()));
        }
        let changed = conn.execute(&format!("DELETE FROM {sql_table} WHERE _id = ?1"), params![id])?;
        if changed == 0 {
            return Err(GoopError::NotFound(format!("no such row: {id}")));
        }
        Ok(())
    }

    fn owner_of(conn: &Connection, sql_table: &str, id: i64) -> GoopResult<Option<String>> {
        conn.query_row(&format!("SELECT _owner FROM {sql_table} WHERE _id = ?1"), params![id], |r| r.get(0))
            .map(Some)
            .or_else(|e| if matches!(e, rusqlite::Error::QueryReturnedNoRows) { Ok(None) } else { Err(e.into()) })
    }

    pub fn select(&self, table: &str, opts: &SelectOptions) -> GoopResult<Vec<Map<String, Value>>> {
        let conn = self.conn.lock();
        Self::require_table(&conn, table)?;
        let sql_table = Self::sql_name(table)?;
        let all_columns = Self::columns_of(&conn, table)?;

        let selected: Vec<String> = if opts.columns.is_empty() {
            SYSTEM_COLUMNS.iter().map(|s| s.to_string()).chain(all_columns.iter().cloned()).collect()
        } else {
            for c in &opts.columns {
                if !SYSTEM_COLUMNS.contains(&c.as_str()) && !all_columns.contains(c) {
                    return Err(GoopError::BadRequest(format!("unknown column: {c}")));
                }
            }
            opts.columns.clone()
        };

        let limit = opts.limit.unwrap_or(MAX_ROWS as u32).min(MAX_ROWS as u32);
        let offset = opts.offset.unwrap_or(0);

        let mut sql = format!("SELECT {} FROM {sql_table}", selected.join(", "));
        if let Some(w) = &opts.where_clause {
            let allowed: Vec<&str> = SYSTEM_COLUMNS.iter().copied().chain(all_columns.iter().map(|s| s.as_str())).collect();
            validate_where(w, &allowed)?;
            sql.push_str(" WHERE ");
            sql.push_str(w);
        }
        sql.push_str(&format!(" LIMIT {limit} OFFSET {offset}"));

        let params: Vec<Box<dyn rusqlite::ToSql>> = opts.args.iter().map(value_to_sql).collect();
        let mut stmt = conn.prepare(&sql)?;
        let col_names = selected.clone();
        let rows = stmt.query_map(params_from_iter(params.iter().map(|b| b.as_ref())), move |row| row_to_map(row, &col_names))?;

        let mut out = Vec::new();
        let mut total_bytes = 0usize;
        for r in rows {
            let row = r?;
            total_bytes += serde_json::to_vec(&row).map(|v| v.len()).unwrap_or(0);
            if total_bytes > MAX_RESULT_BYTES {
                return Err(GoopError::ResourceExceeded("query result exceeds 1 MiB cap".to_string()));
            }
            out.push(row);
        }
        Ok(out)
    }
}

const WHERE_KEYWORDS: &[&str] = &["AND", "OR", "NOT", "IS", "NULL", "IN", "LIKE", "TRUE", "FALSE"];
const WHERE_OPERATORS: &[&str] = &["=", "!=", "<>", "<", ">", "<=", ">="];

/// Tokenizes `w` and rejects anything outside a small allow-listed grammar:
/// known column names, `?N` bind placeholders, comparison operators,
/// AND/OR/NOT/IS/NULL/IN/LIKE, and parens/commas for grouping and `IN`
/// lists. No string or numeric literal is accepted — bind parameters are
/// the only way to pass a value — so neither a `UNION SELECT`, a subquery,
/// nor a quoted/commented injection can appear; every identifier-shaped
/// token must match a real column of the table being queried.
fn validate_where(w: &str, allowed_columns: &[&str]) -> GoopResult<()> {
    let tokens = tokenize_where(w)?;
    if tokens.is_empty() {
        return Err(GoopError::BadRequest("where clause must not be empty".to_string()));
    }
    for tok in &tokens {
        if tok == "(" || tok == ")" || tok == "," {
            continue;
        }
        if let Some(rest) = tok.strip_prefix('?') {
            if !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit()) {
                continue;
            }
            return Err(GoopError::BadRequest(format!("invalid bind placeholder in where clause: {tok}")));
        }
        if WHERE_OPERATORS.contains(&tok.as_str()) {
            continue;
        }
        let first = tok.chars().next().unwrap();
        if first.is_ascii_alphabetic() || first == '_' {
            let upper = tok.to_ascii_uppercase();
            if WHERE_KEYWORDS.contains(&upper.as_str()) || allowed_columns.contains(&tok.as_str()) {
                continue;
            }
            return Err(GoopError::BadRequest(format!("unknown identifier in where clause: {tok}")));
        }
        return Err(GoopError::BadRequest(format!("disallowed token in where clause: {tok}")));
    }
    Ok(())
}

/// Splits a where clause into identifier/keyword, `?N` placeholder,
/// operator, and punctuation tokens. Any character that doesn't belong to
/// one of those shapes (quotes, semicolons, `-`, `/`, `*`, ...) is rejected
/// outright rather than passed through, so comments and string literals
/// never reach the tokens the grammar check above accepts.
fn tokenize_where(w: &str) -> GoopResult<Vec<String>> {
    let chars: Vec<char> = w.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        if c.is_ascii_alphanumeric() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            tokens.push(chars[start..i].iter().collect());
            continue;
        }
        if c == '?' {
            let start = i;
            i += 1;
            while i < chars.len() && chars[i].is_ascii_digit() {
                i += 1;
            }
            tokens.push(chars[start..i].iter().collect());
            continue;
        }
        if c == '(' || c == ')' || c == ',' {
            tokens.push(c.to_string());
            i += 1;
            continue;
        }
        if c == '=' || c == '!' || c == '<' || c == '>' {
            let start = i;
            while i < chars.len() && matches!(chars[i], '=' | '!' | '<' | '>') {
                i += 1;
            }
            tokens.push(chars[start..i].iter().collect());
            continue;
        }
        return Err(GoopError::BadRequest(format!("disallowed character in where clause: {c}")));
    }
    Ok(tokens)
}

fn value_to_sql(v: &Value) -> Box<dyn rusqlite::ToSql> {
    match v {
        Value::Null => Box::new(Option::<String>::None),
        Value::Bool(b) => Box::new(*b as i64),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Box::new(i)
            } else {
                Box::new(n.as_f64().unwrap_or(0.0))
            }
        }
        Value::String(s) => Box::new(s.clone()),
        other => Box::new(other.to_string()),
    }
}

fn row_to_map(row: &Row, columns: &[String]) -> rusqlite::Result<Map<String, Value>> {
    let mut map = Map::new();
    for (i, col) in columns.iter().enumerate() {
        let v: Option<String> = row.get(i)?;
        let value = match col.as_str() {
            "_id" | "_created_at" | "_updated_at" => {
                let n: Option<i64> = row.get(i)?;
                n.map(|n| Value::Number(n.into())).unwrap_or(Value::Null)
            }
            _ => v.map(Value::String).unwrap_or(Value::Null),
        };
        map.insert(col.clone(), value);
    }
    Ok(map)
}

pub fn values_as_map(v: &Value) -> GoopResult<Map<String, Value>> {
    match v {
        Value::Object(m) => Ok(m.clone()),
        Value::Null => Ok(Map::new()),
        _ => Err(GoopError::BadRequest("expected a JSON object".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn values(pairs: &[(&str, &str)]) -> Map<String, Value> {
        let mut m = Map::new();
        for (k, v) in pairs {
            m.insert(k.to_string(), Value::String(v.to_string()));
        }
        m
    }

    #[test]
    fn insert_stamps_owner_and_respects_policy() {
        let s = Storage::open_memory().unwrap();
        s.create_table("posts", &["title".to_string()]).unwrap();
        s.set_policy("posts", InsertPolicy::Owner).unwrap();

        let err = s
            .insert("posts", "peer-v", None, || false, false, &[], &values(&[("title", "x")]))
            .unwrap_err();
        assert!(matches!(err, GoopError::Forbidden(_)));

        s.set_policy("posts", InsertPolicy::Open).unwrap();
        let id = s
            .insert("posts", "peer-v", None, || false, false, &[], &values(&[("title", "x")]))
            .unwrap();

        let rows = s
            .select(
                "posts",
                &SelectOptions { columns: vec![], where_clause: Some("_id = ?1".to_string()), args: vec![json!(id)], limit: None, offset: None },
            )
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("_owner").unwrap(), "peer-v");
    }

    #[test]
    fn where_clause_rejects_injection_and_unknown_columns() {
        let s = Storage::open_memory().unwrap();
        s.create_table("posts", &["title".to_string()]).unwrap();
        s.set_policy("posts", InsertPolicy::Open).unwrap();
        s.insert("posts", "peer-a", None, || false, false, &[], &values(&[("title", "x")])).unwrap();

        let union = s.select(
            "posts",
            &SelectOptions { columns: vec![], where_clause: Some("_id = ?1 UNION SELECT * FROM sqlite_master".to_string()), args: vec![json!(1)], limit: None, offset: None },
        );
        assert!(union.is_err());

        let bad_column = s.select(
            "posts",
            &SelectOptions { columns: vec![], where_clause: Some("_owner = secret_column".to_string()), args: vec![], limit: None, offset: None },
        );
        assert!(bad_column.is_err());

        let literal = s.select(
            "posts",
            &SelectOptions { columns: vec![], where_clause: Some("title = 'x'".to_string()), args: vec![], limit: None, offset: None },
        );
        assert!(literal.is_err());

        let ok = s.select(
            "posts",
            &SelectOptions { columns: vec![], where_clause: Some("title = ?1 AND (_id > ?2 OR _id IS NOT NULL)".to_string()), args: vec![json!("x"), json!(0)], limit: None, offset: None },
        );
        assert!(ok.is_ok());
    }

    #[test]
    fn update_restricted_to_owner() {
        let s = Storage::open_memory().unwrap();
        s.create_table("posts", &["title".to_string()]).unwrap();
        s.set_policy("posts", InsertPolicy::Open).unwrap();
        let id = s.insert("posts", "peer-a", None, || false, false, &[], &values(&[("title", "x")])).unwrap();

        let err = s.update("posts", id, "peer-b", false, &values(&[("title", "y")])).unwrap_err();
        assert!(matches!(err, GoopError::Forbidden(_)));

        s.update("posts", id, "peer-a", false, &values(&[("title", "y")])).unwrap();
    }
}
