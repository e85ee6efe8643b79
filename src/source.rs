use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};

use rusqlite::Connection;

use crate::error::{Result, SyncError};
use crate::integrity::fingerprint_cells;
use crate::types::{CellValue, ColumnDescriptor, RowBatch, TableDescriptor};

const RESERVED_PREFIXES: &[&str] = &["sqlite_", "_cf_"];

/// Streams rows from a local SQLite-compatible database in deterministic
/// batches and exposes schema, row counts, and a dependency-sorted table
/// list. Read-only by default; write operations are rejected unless the
/// connection was opened for writing (used only on the pull path).
pub struct SqliteSource {
    conn: Connection,
    read_only: bool,
}

impl SqliteSource {
    /// Opens `path`. When `read_only` is true the connection is opened in
    /// SQLite's own read-only mode and every mutating method returns
    /// [`SyncError::ReadOnly`]; pragma tuning is still attempted (and
    /// silently ignored by SQLite on a read-only handle, matching the
    /// original connector's behavior of setting pragmas unconditionally).
    pub fn open(path: &str, read_only: bool) -> Result<Self> {
        let conn = if read_only {
            let uri = format!("file:{path}?mode=ro");
            Connection::open_with_flags(
                uri,
                rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY | rusqlite::OpenFlags::SQLITE_OPEN_URI,
            )?
        } else {
            Connection::open(path)?
        };
        let _ = conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;
             PRAGMA cache_size=-64000;
             PRAGMA temp_store=MEMORY;",
        );
        Ok(SqliteSource { conn, read_only })
    }

    fn require_writable(&self, what: &'static str) -> Result<()> {
        if self.read_only {
            Err(SyncError::ReadOnly(what))
        } else {
            Ok(())
        }
    }

    /// Table descriptors in topological order (leaves — no unresolved
    /// foreign-key dependency — first), excluding reserved-prefix tables.
    pub fn list_tables(&self) -> Result<Vec<TableDescriptor>> {
        let mut stmt = self.conn.prepare(
            "SELECT name, sql FROM sqlite_master WHERE type = 'table' ORDER BY name",
        )?;
        let rows: Vec<(String, String)> = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get::<_, Option<String>>(1)?.unwrap_or_default())))?
            .collect::<std::result::Result<_, _>>()?;
        drop(stmt);

        let mut descriptors: BTreeMap<String, TableDescriptor> = BTreeMap::new();
        let mut dependencies: HashMap<String, HashSet<String>> = HashMap::new();

        for (name, create_sql) in &rows {
            if is_reserved(name) {
                continue;
            }
            let columns = self.column_info(name)?;
            let index_names = self.index_names(name)?;
            let row_count = self.get_row_count(name)?;
            descriptors.insert(
                name.clone(),
                TableDescriptor {
                    name: name.clone(),
                    columns,
                    row_count,
                    index_names,
                    create_statement: create_sql.clone(),
                },
            );
            let refs = referenced_tables(create_sql)
                .into_iter()
                .filter(|t| t != name && descriptors_will_contain(&rows, t))
                .collect();
            dependencies.insert(name.clone(), refs);
        }

        Ok(topological_order(descriptors, dependencies))
    }

    fn column_info(&self, table: &str) -> Result<Vec<ColumnDescriptor>> {
        let mut stmt = self
            .conn
            .prepare(&format!("PRAGMA table_info(\"{}\")", escape_ident(table)))?;
        let columns = stmt
            .query_map([], |row| {
                let not_null: i64 = row.get(3)?;
                let pk: i64 = row.get(5)?;
                Ok(ColumnDescriptor {
                    name: row.get(1)?,
                    declared_type: row.get(2)?,
                    not_null: not_null != 0,
                    default_value: row.get(4)?,
                    primary_key: pk != 0,
                })
            })?
            .collect::<std::result::Result<_, _>>()?;
        Ok(columns)
    }

    fn index_names(&self, table: &str) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare(&format!("PRAGMA index_list(\"{}\")", escape_ident(table)))?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(1))?
            .collect::<std::result::Result<_, _>>()?;
        Ok(names)
    }

    pub fn get_row_count(&self, table: &str) -> Result<u64> {
        let count: i64 = self.conn.query_row(
            &format!("SELECT COUNT(*) FROM \"{}\"", escape_ident(table)),
            [],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    pub fn get_create_statement(&self, table: &str) -> Result<String> {
        self.conn
            .query_row(
                "SELECT sql FROM sqlite_master WHERE type = 'table' AND name = ?1",
                [table],
                |row| row.get(0),
            )
            .map_err(SyncError::from)
    }

    pub fn get_index_statements(&self, table: &str) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT sql FROM sqlite_master WHERE type = 'index' AND tbl_name = ?1 AND sql IS NOT NULL",
        )?;
        let stmts = stmt
            .query_map([table], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<_, _>>()?;
        Ok(stmts)
    }

    /// Reads rows of `table` starting at `offset`, in pages of at most
    /// `batch_size`, up to `limit` rows total if given. Ordering is by
    /// primary key when one exists and no explicit `order_by` is given,
    /// else `rowid` — a fixed pagination strategy either way. Returns a
    /// lazy iterator: each page is queried only when the caller asks for
    /// the next batch, so a table with more rows than fit in memory never
    /// has to be materialized in full before chunking/upload can start.
    pub fn iter_rows<'a>(
        &'a self,
        table: &str,
        columns: &[String],
        batch_size: u64,
        offset: u64,
        limit: Option<u64>,
        order_by: Option<&str>,
        algorithm: crate::integrity::ChecksumAlg,
    ) -> Result<RowBatchIter<'a>> {
        let order_clause = match order_by {
            Some(col) => format!("ORDER BY \"{}\"", escape_ident(col)),
            None => match self.primary_key_column(table)? {
                Some(pk) => format!("ORDER BY \"{}\"", escape_ident(&pk)),
                None => "ORDER BY rowid".to_string(),
            },
        };
        let column_list = if columns.is_empty() {
            "*".to_string()
        } else {
            columns
                .iter()
                .map(|c| format!("\"{}\"", escape_ident(c)))
                .collect::<Vec<_>>()
                .join(", ")
        };

        Ok(RowBatchIter {
            source: self,
            table: table.to_string(),
            column_list,
            order_clause,
            batch_size,
            offset,
            remaining: limit,
            algorithm,
            done: false,
        })
    }

    fn primary_key_column(&self, table: &str) -> Result<Option<String>> {
        let columns = self.column_info(table)?;
        let pk_columns: Vec<&ColumnDescriptor> = columns.iter().filter(|c| c.primary_key).collect();
        if pk_columns.len() == 1 {
            Ok(Some(pk_columns[0].name.clone()))
        } else {
            Ok(None)
        }
    }

    pub fn execute_sql(&self, sql: &str) -> Result<usize> {
        self.require_writable("execute_sql")?;
        Ok(self.conn.execute_batch(sql).map(|_| 0)?)
    }

    pub fn insert_rows(
        &self,
        table: &str,
        columns: &[String],
        rows: &[Vec<CellValue>],
        replace: bool,
    ) -> Result<usize> {
        self.require_writable("insert_rows")?;
        if rows.is_empty() {
            return Ok(0);
        }
        let verb = if replace { "INSERT OR REPLACE" } else { "INSERT OR IGNORE" };
        let column_list = columns
            .iter()
            .map(|c| format!("\"{}\"", escape_ident(c)))
            .collect::<Vec<_>>()
            .join(", ");
        let placeholders = (1..=columns.len())
            .map(|i| format!("?{i}"))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "{verb} INTO \"{}\" ({column_list}) VALUES ({placeholders})",
            escape_ident(table)
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let mut written = 0;
        for row in rows {
            let params: Vec<rusqlite::types::Value> = row
                .iter()
                .map(|c| match c {
                    CellValue::Null => rusqlite::types::Value::Null,
                    CellValue::Int(i) => rusqlite::types::Value::Integer(*i),
                    CellValue::Float(f) => rusqlite::types::Value::Real(*f),
                    CellValue::Bool(b) => rusqlite::types::Value::Integer(*b as i64),
                    CellValue::Text(s) => rusqlite::types::Value::Text(s.clone()),
                    CellValue::Blob(b) => rusqlite::types::Value::Blob(b.clone()),
                })
                .collect();
            written += stmt.execute(rusqlite::params_from_iter(params))?;
        }
        Ok(written)
    }

    pub fn create_table(&self, create_statement: &str) -> Result<()> {
        self.require_writable("create_table")?;
        self.conn.execute_batch(create_statement)?;
        Ok(())
    }

    pub fn drop_table(&self, table: &str) -> Result<()> {
        self.require_writable("drop_table")?;
        self.conn
            .execute_batch(&format!("DROP TABLE IF EXISTS \"{}\"", escape_ident(table)))?;
        Ok(())
    }
}

/// Pages through a table one `LIMIT/OFFSET` query at a time, yielding a
/// [`RowBatch`] per call to `next`. Holds a reference to the source rather
/// than a live `rusqlite::Statement`, so each page is its own query —
/// simpler than threading a cursor's lifetime through the caller, and no
/// slower, since the eager version this replaced re-prepared a statement
/// per page anyway.
pub struct RowBatchIter<'a> {
    source: &'a SqliteSource,
    table: String,
    column_list: String,
    order_clause: String,
    batch_size: u64,
    offset: u64,
    remaining: Option<u64>,
    algorithm: crate::integrity::ChecksumAlg,
    done: bool,
}

impl<'a> Iterator for RowBatchIter<'a> {
    type Item = Result<RowBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let page = match self.remaining {
            Some(r) if r < self.batch_size => r,
            _ => self.batch_size,
        };
        if page == 0 {
            self.done = true;
            return None;
        }

        let sql = format!(
            "SELECT {} FROM \"{}\" {} LIMIT {page} OFFSET {}",
            self.column_list,
            escape_ident(&self.table),
            self.order_clause,
            self.offset
        );
        let fetch = || -> Result<(Vec<String>, Vec<Vec<CellValue>>)> {
            let mut stmt = self.source.conn.prepare(&sql)?;
            let col_names: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();
            let n_cols = col_names.len();
            let rows: Vec<Vec<CellValue>> = stmt
                .query_map([], |row| {
                    let mut cells = Vec::with_capacity(n_cols);
                    for i in 0..n_cols {
                        let value: rusqlite::types::Value = row.get(i)?;
                        cells.push(CellValue::from(value));
                    }
                    Ok(cells)
                })?
                .collect::<std::result::Result<_, _>>()?;
            Ok((col_names, rows))
        };

        let (col_names, rows) = match fetch() {
            Ok(page) => page,
            Err(err) => {
                self.done = true;
                return Some(Err(err));
            }
        };

        if rows.is_empty() {
            self.done = true;
            return None;
        }

        let row_count = rows.len() as u64;
        let fingerprint = fingerprint_cells(&rows, self.algorithm);
        let batch = RowBatch {
            table: self.table.clone(),
            columns: col_names,
            rows,
            start_offset: self.offset,
            fingerprint,
        };

        self.offset += row_count;
        if let Some(r) = self.remaining {
            self.remaining = Some(r.saturating_sub(row_count));
            if self.remaining == Some(0) {
                self.done = true;
            }
        }
        if row_count < page {
            self.done = true;
        }

        Some(Ok(batch))
    }
}

fn is_reserved(name: &str) -> bool {
    RESERVED_PREFIXES.iter().any(|p| name.starts_with(p))
}

fn escape_ident(ident: &str) -> String {
    ident.replace('"', "\"\"")
}

fn descriptors_will_contain(rows: &[(String, String)], table: &str) -> bool {
    rows.iter().any(|(n, _)| n == table) && !is_reserved(table)
}

/// A small tokenizer over `CREATE TABLE` text that extracts the tables
/// named in `FOREIGN KEY (...) REFERENCES <table>` clauses. Deliberately
/// not a regex (malformed or unusual schema text just yields fewer
/// references rather than failing).
fn referenced_tables(create_sql: &str) -> Vec<String> {
    let mut refs = Vec::new();
    let tokens: Vec<String> = tokenize(create_sql);
    let mut i = 0;
    while i < tokens.len() {
        if tokens[i].eq_ignore_ascii_case("REFERENCES") && i + 1 < tokens.len() {
            let candidate = tokens[i + 1].trim_matches(|c| c == '"' || c == '`' || c == '\'' || c == '[' || c == ']');
            if is_identifier(candidate) {
                refs.push(candidate.to_string());
            }
        }
        i += 1;
    }
    refs
}

fn tokenize(sql: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut chars = sql.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '"' | '`' | '\'' => {
                let quote = c;
                current.push(c);
                for next in chars.by_ref() {
                    current.push(next);
                    if next == quote {
                        break;
                    }
                }
            }
            c if c.is_whitespace() => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            '(' | ')' | ',' => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
                tokens.push(c.to_string());
            }
            _ => current.push(c),
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Kahn's algorithm; ready set ordered alphabetically at each step.
/// Residual cycles are appended alphabetically and the run proceeds,
/// since the edge database does not enforce foreign keys by default.
fn topological_order(
    descriptors: BTreeMap<String, TableDescriptor>,
    dependencies: HashMap<String, HashSet<String>>,
) -> Vec<TableDescriptor> {
    let mut in_degree: HashMap<String, usize> = HashMap::new();
    let mut dependents: HashMap<String, Vec<String>> = HashMap::new();

    for name in descriptors.keys() {
        in_degree.entry(name.clone()).or_insert(0);
    }
    for (table, deps) in &dependencies {
        in_degree.insert(table.clone(), deps.len());
        for dep in deps {
            dependents.entry(dep.clone()).or_default().push(table.clone());
        }
    }

    let mut ready: BTreeSet<String> = in_degree
        .iter()
        .filter(|(_, deg)| **deg == 0)
        .map(|(name, _)| name.clone())
        .collect();

    let mut order = Vec::new();
    let mut visited: HashSet<String> = HashSet::new();
    let mut queue: VecDeque<String> = VecDeque::new();

    while !ready.is_empty() {
        let next = ready.iter().next().cloned().unwrap();
        ready.remove(&next);
        queue.push_back(next);

        while let Some(name) = queue.pop_front() {
            if visited.contains(&name) {
                continue;
            }
            visited.insert(name.clone());
            order.push(name.clone());
            if let Some(dependents_of_name) = dependents.get(&name) {
                let mut newly_ready = Vec::new();
                for dependent in dependents_of_name {
                    if let Some(deg) = in_degree.get_mut(dependent) {
                        *deg = deg.saturating_sub(1);
                        if *deg == 0 && !visited.contains(dependent) {
                            newly_ready.push(dependent.clone());
                        }
                    }
                }
                newly_ready.sort();
                for n in newly_ready {
                    ready.insert(n);
                }
            }
        }
    }

    let mut residual: Vec<String> = descriptors
        .keys()
        .filter(|name| !visited.contains(*name))
        .cloned()
        .collect();
    residual.sort();
    order.extend(residual);

    let mut descriptors = descriptors;
    order
        .into_iter()
        .filter_map(|name| descriptors.remove(&name))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup(sql: &str) -> SqliteSource {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(sql).unwrap();
        SqliteSource { conn, read_only: false }
    }

    #[test]
    fn topological_order_respects_foreign_keys() {
        let source = setup(
            "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT);
             CREATE TABLE orders (id INTEGER PRIMARY KEY, user_id INTEGER REFERENCES users(id));",
        );
        let tables = source.list_tables().unwrap();
        let names: Vec<&str> = tables.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["users", "orders"]);
    }

    #[test]
    fn reserved_prefixes_are_excluded() {
        let source = setup("CREATE TABLE users (id INTEGER PRIMARY KEY);");
        let tables = source.list_tables().unwrap();
        assert!(!tables.iter().any(|t| t.name.starts_with("sqlite_")));
    }

    #[test]
    fn iter_rows_pages_through_all_rows() {
        let source = setup(
            "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT);
             INSERT INTO users VALUES (1, 'Alice'), (2, 'Bob'), (3, 'Eve');",
        );
        let batches: Vec<_> = source
            .iter_rows(
                "users",
                &[],
                2,
                0,
                None,
                None,
                crate::integrity::ChecksumAlg::Md5,
            )
            .unwrap()
            .collect::<std::result::Result<_, _>>()
            .unwrap();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].len(), 2);
        assert_eq!(batches[1].len(), 1);
        assert_eq!(batches[1].start_offset, 2);
    }

    #[test]
    fn iter_rows_is_lazy_and_fetches_pages_on_demand() {
        let source = setup(
            "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT);
             INSERT INTO users VALUES (1, 'Alice'), (2, 'Bob'), (3, 'Eve');",
        );
        let mut iter = source
            .iter_rows("users", &[], 1, 0, None, None, crate::integrity::ChecksumAlg::Md5)
            .unwrap();
        let first = iter.next().unwrap().unwrap();
        assert_eq!(first.start_offset, 0);
        assert_eq!(first.len(), 1);
        let second = iter.next().unwrap().unwrap();
        assert_eq!(second.start_offset, 1);
        assert!(iter.next().is_some());
        assert!(iter.next().is_none());
    }

    #[test]
    fn empty_table_yields_no_batches() {
        let source = setup("CREATE TABLE users (id INTEGER PRIMARY KEY);");
        let mut iter = source
            .iter_rows("users", &[], 10, 0, None, None, crate::integrity::ChecksumAlg::Md5)
            .unwrap();
        assert!(iter.next().is_none());
    }

    #[test]
    fn read_only_rejects_writes() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE users (id INTEGER PRIMARY KEY);").unwrap();
        let source = SqliteSource { conn, read_only: true };
        let err = source.insert_rows("users", &["id".into()], &[vec![CellValue::Int(1)]], false);
        assert!(matches!(err, Err(SyncError::ReadOnly(_))));
    }

    #[test]
    fn self_reference_and_cycles_do_not_panic() {
        let source = setup(
            "CREATE TABLE a (id INTEGER PRIMARY KEY, parent_id INTEGER REFERENCES a(id));
             CREATE TABLE b (id INTEGER PRIMARY KEY, c_id INTEGER REFERENCES c(id));
             CREATE TABLE c (id INTEGER PRIMARY KEY, b_id INTEGER REFERENCES b(id));",
        );
        let tables = source.list_tables().unwrap();
        let mut names: Vec<&str> = tables.iter().map(|t| t.name.as_str()).collect();
        names.sort();
        assert_eq!(names, vec!["a", "b", "c"]);
    }
}
