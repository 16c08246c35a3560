//! SQLite adapter

use super::{
    Catalog, ColumnInfo, DatabaseInfo, DbError, ForeignKeyInfo, ForeignKeys, IndexInfo,
    PoolHealth, PoolOptions, QueryOutput, Row, SqlExecutor, SqlitePool, TableInfo, TableKind,
    TableStats,
};
use crate::config::Settings;
use crate::safety::{quote_ident, LimitSyntax, TableRef};
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params, params_from_iter, Connection};
use serde_json::Value;
use std::path::Path;

/// Pooled SQLite database implementing [`SqlExecutor`] and [`Catalog`]
pub struct SqliteDatabase {
    pool: SqlitePool,
}

impl SqliteDatabase {
    /// Open the database and verify that one connection can be established
    pub async fn open(path: &Path, options: &PoolOptions) -> Result<Self, DbError> {
        let pool = SqlitePool::open(path, options).await?;
        tracing::info!(
            "Opened {:?} ({}, pool size {})",
            path,
            if options.read_only { "read-only" } else { "read-write" },
            options.max_size
        );
        Ok(Self { pool })
    }

    pub async fn from_settings(settings: &Settings) -> Result<Self, DbError> {
        Self::open(&settings.database.path, &PoolOptions::from_settings(settings)).await
    }

    pub fn health(&self) -> PoolHealth {
        self.pool.health()
    }

    /// Actual spelling of a schema name, if it exists
    async fn find_schema(&self, schema: &str) -> Result<Option<String>, DbError> {
        Ok(self
            .schemas()
            .await?
            .into_iter()
            .find(|name| name.eq_ignore_ascii_case(schema)))
    }

    fn primary_key_columns(
        conn: &Connection,
        table: &str,
        schema: &str,
    ) -> rusqlite::Result<Vec<String>> {
        let mut stmt =
            conn.prepare("SELECT name FROM pragma_table_info(?1, ?2) WHERE pk > 0 ORDER BY pk")?;
        let rows = stmt.query_map(params![table, schema], |row| row.get(0))?;
        rows.collect()
    }
}

fn json_to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or(0.0)),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

fn sql_to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => Value::String(hex::encode(bytes)),
    }
}

#[async_trait::async_trait]
impl SqlExecutor for SqliteDatabase {
    fn limit_syntax(&self) -> LimitSyntax {
        LimitSyntax::Limit
    }

    fn pool_health(&self) -> Option<PoolHealth> {
        Some(self.health())
    }

    async fn query(
        &self,
        sql: &str,
        params: &[Value],
        max_rows: Option<usize>,
    ) -> Result<QueryOutput, DbError> {
        tracing::debug!("Executing: {}", sql);
        let sql = sql.to_string();
        let bound: Vec<SqlValue> = params.iter().map(json_to_sql).collect();

        self.pool
            .interact(move |conn| {
                let mut stmt = conn.prepare(&sql)?;
                let columns: Vec<String> = stmt
                    .column_names()
                    .into_iter()
                    .map(String::from)
                    .collect();

                let mut rows = stmt.query(params_from_iter(bound.iter()))?;
                let mut output = QueryOutput {
                    columns: columns.clone(),
                    ..Default::default()
                };

                while let Some(row) = rows.next()? {
                    if max_rows.is_some_and(|max| output.rows.len() >= max) {
                        output.truncated = true;
                        break;
                    }
                    let mut record = Row::new();
                    for (idx, name) in columns.iter().enumerate() {
                        record.insert(name.clone(), sql_to_json(row.get_ref(idx)?));
                    }
                    output.rows.push(record);
                }

                Ok(output)
            })
            .await
    }
}

#[async_trait::async_trait]
impl Catalog for SqliteDatabase {
    async fn schemas(&self) -> Result<Vec<String>, DbError> {
        self.pool
            .interact(|conn| {
                let mut stmt =
                    conn.prepare("SELECT name FROM pragma_database_list ORDER BY seq")?;
                let rows = stmt.query_map([], |row| row.get(0))?;
                rows.collect()
            })
            .await
    }

    async fn list_tables(
        &self,
        schema: Option<&str>,
        include_views: bool,
    ) -> Result<Vec<TableInfo>, DbError> {
        let schemas: Vec<String> = match schema {
            Some(requested) => self.find_schema(requested).await?.into_iter().collect(),
            None => self.schemas().await?,
        };

        self.pool
            .interact(move |conn| {
                let mut tables = Vec::new();
                for schema in &schemas {
                    let sql = format!(
                        r#"
                        SELECT m.name, m.type,
                               (SELECT COUNT(*) FROM pragma_table_info(m.name, ?1))
                        FROM {}.sqlite_master AS m
                        WHERE m.type IN ('table', 'view') AND m.name NOT LIKE 'sqlite_%'
                        ORDER BY m.name
                        "#,
                        quote_ident(schema)
                    );
                    let mut stmt = conn.prepare(&sql)?;
                    let rows = stmt.query_map(params![schema], |row| {
                        let kind: String = row.get(1)?;
                        let column_count: i64 = row.get(2)?;
                        Ok(TableInfo {
                            schema: schema.clone(),
                            name: row.get(0)?,
                            kind: if kind == "view" {
                                TableKind::View
                            } else {
                                TableKind::Table
                            },
                            column_count: column_count as usize,
                        })
                    })?;

                    for table in rows {
                        let table = table?;
                        if include_views || table.kind == TableKind::Table {
                            tables.push(table);
                        }
                    }
                }
                Ok(tables)
            })
            .await
    }

    async fn table_exists(&self, table: &TableRef) -> Result<bool, DbError> {
        let Some(schema) = self.find_schema(&table.schema).await? else {
            return Ok(false);
        };

        let sql = format!(
            "SELECT COUNT(*) FROM {}.sqlite_master \
             WHERE type IN ('table', 'view') AND name = ?1 COLLATE NOCASE",
            quote_ident(&schema)
        );
        let name = table.name.clone();
        self.pool
            .interact(move |conn| {
                let count: i64 = conn.query_row(&sql, params![name], |row| row.get(0))?;
                Ok(count > 0)
            })
            .await
    }

    async fn columns(&self, table: &TableRef) -> Result<Vec<ColumnInfo>, DbError> {
        let table = table.clone();
        self.pool
            .interact(move |conn| {
                let mut stmt = conn.prepare(
                    r#"
                    SELECT cid, name, type, "notnull", dflt_value, pk
                    FROM pragma_table_info(?1, ?2)
                    ORDER BY cid
                    "#,
                )?;
                let rows = stmt.query_map(params![table.name, table.schema], |row| {
                    let position: i64 = row.get(0)?;
                    let not_null: bool = row.get(3)?;
                    let pk: i64 = row.get(5)?;
                    Ok(ColumnInfo {
                        position: position as usize,
                        name: row.get(1)?,
                        data_type: row.get(2)?,
                        nullable: !not_null,
                        default: row.get(4)?,
                        primary_key: (pk > 0).then_some(pk as usize),
                    })
                })?;
                rows.collect()
            })
            .await
    }

    async fn foreign_keys(&self, table: &TableRef) -> Result<ForeignKeys, DbError> {
        let Some(schema) = self.find_schema(&table.schema).await? else {
            return Ok(ForeignKeys::default());
        };
        let table = table.clone();

        self.pool
            .interact(move |conn| {
                let mut keys = ForeignKeys::default();

                // Outgoing: declared on this table
                let mut stmt = conn.prepare(
                    r#"
                    SELECT id, seq, "table", "from", "to"
                    FROM pragma_foreign_key_list(?1, ?2)
                    ORDER BY id, seq
                    "#,
                )?;
                let rows = stmt.query_map(params![table.name, schema], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, Option<String>>(4)?,
                    ))
                })?;

                for row in rows {
                    let (id, seq, target, from, to) = row?;
                    // A missing target column means the referenced primary key
                    let to = match to {
                        Some(col) => col,
                        None => Self::primary_key_columns(conn, &target, &schema)?
                            .into_iter()
                            .nth(seq as usize)
                            .unwrap_or_else(|| "rowid".to_string()),
                    };
                    keys.outgoing.push(ForeignKeyInfo {
                        constraint_id: id,
                        fk_table: TableRef::new(schema.clone(), table.name.clone()),
                        fk_column: from,
                        pk_table: TableRef::new(schema.clone(), target),
                        pk_column: to,
                    });
                }

                // Incoming: declared on other tables of the same schema
                let sql = format!(
                    r#"
                    SELECT m.name, f.id, f.seq, f."from", f."to"
                    FROM {}.sqlite_master AS m
                    JOIN pragma_foreign_key_list(m.name, ?2) AS f
                    WHERE m.type = 'table' AND f."table" = ?1 COLLATE NOCASE
                    ORDER BY m.name, f.id, f.seq
                    "#,
                    quote_ident(&schema)
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map(params![table.name, schema], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, Option<String>>(4)?,
                    ))
                })?;

                let mut pk_columns: Option<Vec<String>> = None;
                for row in rows {
                    let (source, id, seq, from, to) = row?;
                    let to = match to {
                        Some(col) => col,
                        None => {
                            if pk_columns.is_none() {
                                pk_columns =
                                    Some(Self::primary_key_columns(conn, &table.name, &schema)?);
                            }
                            pk_columns
                                .as_ref()
                                .and_then(|cols| cols.get(seq as usize).cloned())
                                .unwrap_or_else(|| "rowid".to_string())
                        }
                    };
                    keys.incoming.push(ForeignKeyInfo {
                        constraint_id: id,
                        fk_table: TableRef::new(schema.clone(), source),
                        fk_column: from,
                        pk_table: TableRef::new(schema.clone(), table.name.clone()),
                        pk_column: to,
                    });
                }

                Ok(keys)
            })
            .await
    }

    async fn indexes(&self, table: &TableRef) -> Result<Vec<IndexInfo>, DbError> {
        let table = table.clone();
        self.pool
            .interact(move |conn| {
                let mut stmt = conn.prepare(
                    r#"SELECT name, "unique", origin FROM pragma_index_list(?1, ?2) ORDER BY name"#,
                )?;
                let rows = stmt.query_map(params![table.name, table.schema], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, bool>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                })?;
                let listed: Vec<_> = rows.collect::<rusqlite::Result<_>>()?;

                let mut col_stmt =
                    conn.prepare("SELECT name FROM pragma_index_info(?1, ?2) ORDER BY seqno")?;
                let mut indexes = Vec::with_capacity(listed.len());
                for (name, unique, origin) in listed {
                    let columns = col_stmt
                        .query_map(params![name, table.schema], |row| {
                            row.get::<_, Option<String>>(0)
                        })?
                        .collect::<rusqlite::Result<Vec<_>>>()?
                        .into_iter()
                        .map(|col| col.unwrap_or_else(|| "<expression>".to_string()))
                        .collect();
                    indexes.push(IndexInfo {
                        name,
                        unique,
                        origin,
                        columns,
                    });
                }
                Ok(indexes)
            })
            .await
    }

    async fn table_stats(&self, table: &TableRef) -> Result<Option<TableStats>, DbError> {
        if !self.table_exists(table).await? {
            return Ok(None);
        }

        let column_count = self.columns(table).await?.len();
        let sql = format!("SELECT COUNT(*) FROM {}", table.quoted());
        let row_count: i64 = self
            .pool
            .interact(move |conn| conn.query_row(&sql, [], |row| row.get(0)))
            .await?;

        Ok(Some(TableStats {
            row_count: row_count.max(0) as u64,
            column_count,
        }))
    }

    async fn database_info(&self) -> Result<DatabaseInfo, DbError> {
        let schemas = self.schemas().await?;
        self.pool
            .interact(move |conn| {
                let version: String =
                    conn.query_row("SELECT sqlite_version()", [], |row| row.get(0))?;
                let page_size: i64 = conn.query_row("PRAGMA page_size", [], |row| row.get(0))?;
                let page_count: i64 = conn.query_row("PRAGMA page_count", [], |row| row.get(0))?;
                let journal_mode: String =
                    conn.query_row("PRAGMA journal_mode", [], |row| row.get(0))?;
                let encoding: String = conn.query_row("PRAGMA encoding", [], |row| row.get(0))?;
                let file: String = conn.query_row(
                    "SELECT file FROM pragma_database_list WHERE name = 'main'",
                    [],
                    |row| row.get(0),
                )?;

                Ok(DatabaseInfo {
                    engine: "sqlite".to_string(),
                    version,
                    file: (!file.is_empty()).then_some(file),
                    page_size,
                    page_count,
                    journal_mode,
                    encoding,
                    schemas,
                })
            })
            .await
    }
}
