//! Uniform view over a relational source or target database.
//!
//! One sea-orm implementation covers postgres, mysql, and sqlite; the
//! backend is chosen by the connection descriptor's driver hint, else its
//! syntax. Dynamic rows travel as JSON objects so the engine never needs
//! compile-time knowledge of user schemas.

use std::future::Future;
use std::time::Instant;

use async_trait::async_trait;
use sea_orm::{ConnectionTrait, Database, DatabaseConnection, DbBackend, FromQueryResult, JsonValue, Statement, TransactionTrait};
use serde::{Deserialize, Serialize};

use crate::catalog::rebind;
use crate::errors::AdapterError;
use crate::model::ConnectionDescriptor;

const RETRY_ATTEMPTS: u32 = 3;
const RETRY_BASE_MS: u64 = 100;

/// A pk range to scan, delete, or count. Half-open unless `end_inclusive`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PkRange {
    pub start: i64,
    pub end: i64,
    pub end_inclusive: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: String,
    pub not_null: bool,
    pub has_default: bool,
}

#[derive(Debug, Clone)]
pub struct TableDescription {
    pub table_name: String,
    pub pk_columns: Vec<String>,
    pub columns: Vec<ColumnInfo>,
    pub row_count_estimate: i64,
}

impl TableDescription {
    /// The single integer-orderable pk column the planner requires, if the
    /// table has one.
    pub fn chunkable_pk(&self) -> Option<&str> {
        if self.pk_columns.len() != 1 {
            return None;
        }
        let pk = &self.pk_columns[0];
        let info = self.columns.iter().find(|c| &c.name == pk)?;
        let ty = info.data_type.to_lowercase();
        if ty.contains("int") || ty.contains("serial") {
            Some(pk.as_str())
        } else {
            None
        }
    }
}

#[derive(Debug, Clone)]
pub struct BatchReport {
    pub rows_inserted: u64,
    pub latency_ms: i64,
    pub bytes: i64,
}

/// Restoration document for a dropped index or foreign key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConstraintDef {
    pub name: String,
    pub kind: ConstraintKind,
    /// Verbatim CREATE statement (postgres, sqlite indexes)
    #[serde(default)]
    pub create_sql: Option<String>,
    #[serde(default)]
    pub unique: bool,
    /// Indexed columns (mysql indexes)
    #[serde(default)]
    pub columns: Vec<String>,
    /// FK fields
    #[serde(default)]
    pub column: Option<String>,
    #[serde(default)]
    pub ref_table: Option<String>,
    #[serde(default)]
    pub ref_column: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConstraintKind {
    Index,
    ForeignKey,
}

#[async_trait]
pub trait Adapter: Send + Sync {
    async fn discover_tables(&self) -> Result<Vec<String>, AdapterError>;
    async fn describe_table(&self, table: &str) -> Result<TableDescription, AdapterError>;
    async fn pk_bounds(&self, table: &str, pk: &str) -> Result<Option<(i64, i64)>, AdapterError>;
    async fn count_range(&self, table: &str, pk: &str, range: PkRange) -> Result<i64, AdapterError>;
    async fn delete_range(&self, table: &str, pk: &str, range: PkRange) -> Result<u64, AdapterError>;
    async fn fetch_batch(
        &self,
        table: &str,
        pk: &str,
        range: PkRange,
        cursor: Option<i64>,
        limit: i64,
    ) -> Result<Vec<serde_json::Map<String, JsonValue>>, AdapterError>;
    async fn bulk_insert(
        &self,
        table: &str,
        columns: &[String],
        rows: &[Vec<JsonValue>],
    ) -> Result<BatchReport, AdapterError>;
    async fn list_constraints(&self, table: &str) -> Result<Vec<ConstraintDef>, AdapterError>;
    async fn drop_constraint(&self, table: &str, def: &ConstraintDef) -> Result<(), AdapterError>;
    async fn restore_constraint(&self, table: &str, def: &ConstraintDef) -> Result<(), AdapterError>;
}

pub struct SqlAdapter {
    db: DatabaseConnection,
    backend: DbBackend,
}

impl SqlAdapter {
    pub async fn connect(descriptor: &ConnectionDescriptor) -> Result<Self, AdapterError> {
        let url = descriptor
            .url()
            .map_err(|e| AdapterError::Unknown(e.to_string()))?;
        let db = retrying(|| async {
            Database::connect(url.as_str())
                .await
                .map_err(|e| AdapterError::classify(&e))
        })
        .await?;
        let backend = db.get_database_backend();
        Ok(Self { db, backend })
    }

    /// Wrap an existing connection; used by tests and the catalog-backed
    /// fixtures.
    pub fn from_connection(db: DatabaseConnection) -> Self {
        let backend = db.get_database_backend();
        Self { db, backend }
    }

    pub fn backend(&self) -> DbBackend {
        self.backend
    }

    fn quote(&self, ident: &str) -> String {
        match self.backend {
            DbBackend::MySql => format!("`{}`", ident.replace('`', "``")),
            _ => format!("\"{}\"", ident.replace('"', "\"\"")),
        }
    }

    fn range_predicate(&self, pk: &str, range: PkRange) -> String {
        let pk = self.quote(pk);
        if range.end_inclusive {
            format!("{pk} >= ? AND {pk} <= ?")
        } else {
            format!("{pk} >= ? AND {pk} < ?")
        }
    }

    fn stmt(&self, sql: &str, values: Vec<sea_orm::Value>) -> Statement {
        Statement::from_sql_and_values(self.backend, rebind(self.backend, sql), values)
    }

    async fn exact_count(&self, table: &str) -> Result<i64, AdapterError> {
        let sql = format!("SELECT COUNT(*) AS cnt FROM {}", self.quote(table));
        let row = retrying(|| async {
            self.db
                .query_one(self.stmt(&sql, vec![]))
                .await
                .map_err(|e| AdapterError::classify(&e))
        })
        .await?
        .ok_or_else(|| AdapterError::Unknown("count returned no row".into()))?;
        row.try_get::<i64>("", "cnt")
            .map_err(|e| AdapterError::classify(&e))
    }

    async fn estimate_rows(&self, table: &str) -> Result<i64, AdapterError> {
        let estimate = match self.backend {
            DbBackend::Postgres => {
                let row = self
                    .db
                    .query_one(self.stmt(
                        "SELECT reltuples::BIGINT AS estimate FROM pg_class WHERE relname = ?",
                        vec![table.into()],
                    ))
                    .await
                    .map_err(|e| AdapterError::classify(&e))?;
                row.and_then(|r| r.try_get::<i64>("", "estimate").ok()).unwrap_or(-1)
            }
            DbBackend::MySql => {
                let row = self
                    .db
                    .query_one(self.stmt(
                        "SELECT TABLE_ROWS AS estimate FROM information_schema.TABLES \
                         WHERE TABLE_SCHEMA = DATABASE() AND TABLE_NAME = ?",
                        vec![table.into()],
                    ))
                    .await
                    .map_err(|e| AdapterError::classify(&e))?;
                row.and_then(|r| r.try_get::<i64>("", "estimate").ok()).unwrap_or(-1)
            }
            _ => -1,
        };
        // Stale or missing statistics fall back to a real count
        if estimate > 0 {
            Ok(estimate)
        } else {
            self.exact_count(table).await
        }
    }
}

#[async_trait]
impl Adapter for SqlAdapter {
    async fn discover_tables(&self) -> Result<Vec<String>, AdapterError> {
        let sql = match self.backend {
            DbBackend::Postgres => {
                "SELECT tablename AS name FROM pg_tables WHERE schemaname = 'public' ORDER BY tablename"
            }
            DbBackend::MySql => {
                "SELECT TABLE_NAME AS name FROM information_schema.TABLES \
                 WHERE TABLE_SCHEMA = DATABASE() AND TABLE_TYPE = 'BASE TABLE' ORDER BY TABLE_NAME"
            }
            _ => {
                "SELECT name FROM sqlite_master WHERE type = 'table' \
                 AND name NOT LIKE 'sqlite_%' AND name NOT LIKE 'seaql_%' ORDER BY name"
            }
        };
        let rows = retrying(|| async {
            self.db
                .query_all(self.stmt(sql, vec![]))
                .await
                .map_err(|e| AdapterError::classify(&e))
        })
        .await?;
        rows.iter()
            .map(|r| r.try_get::<String>("", "name").map_err(|e| AdapterError::classify(&e)))
            .collect()
    }

    async fn describe_table(&self, table: &str) -> Result<TableDescription, AdapterError> {
        let (columns, pk_columns) = match self.backend {
            DbBackend::Sqlite => {
                let sql = format!("PRAGMA table_info({})", self.quote(table));
                let rows = self
                    .db
                    .query_all(self.stmt(&sql, vec![]))
                    .await
                    .map_err(|e| AdapterError::classify(&e))?;
                if rows.is_empty() {
                    return Err(AdapterError::NotFound(format!("table {table}")));
                }
                let mut columns = Vec::with_capacity(rows.len());
                let mut pk_columns = Vec::new();
                for row in rows {
                    let name: String = row.try_get("", "name").map_err(|e| AdapterError::classify(&e))?;
                    let data_type: String = row.try_get("", "type").unwrap_or_default();
                    let not_null: i64 = row.try_get("", "notnull").unwrap_or(0);
                    let has_default = row.try_get::<Option<String>>("", "dflt_value").ok().flatten().is_some();
                    let pk: i64 = row.try_get("", "pk").unwrap_or(0);
                    if pk > 0 {
                        pk_columns.push(name.clone());
                    }
                    columns.push(ColumnInfo { name, data_type, not_null: not_null != 0, has_default });
                }
                (columns, pk_columns)
            }
            DbBackend::Postgres => {
                let rows = self
                    .db
                    .query_all(self.stmt(
                        "SELECT column_name, data_type, is_nullable, column_default \
                         FROM information_schema.columns \
                         WHERE table_schema = 'public' AND table_name = ? \
                         ORDER BY ordinal_position",
                        vec![table.into()],
                    ))
                    .await
                    .map_err(|e| AdapterError::classify(&e))?;
                if rows.is_empty() {
                    return Err(AdapterError::NotFound(format!("table {table}")));
                }
                let mut columns = Vec::with_capacity(rows.len());
                for row in rows {
                    let name: String = row.try_get("", "column_name").map_err(|e| AdapterError::classify(&e))?;
                    let data_type: String = row.try_get("", "data_type").unwrap_or_default();
                    let nullable: String = row.try_get("", "is_nullable").unwrap_or_default();
                    let has_default =
                        row.try_get::<Option<String>>("", "column_default").ok().flatten().is_some();
                    columns.push(ColumnInfo {
                        name,
                        data_type,
                        not_null: nullable == "NO",
                        has_default,
                    });
                }
                let pk_rows = self
                    .db
                    .query_all(self.stmt(
                        "SELECT kcu.column_name FROM information_schema.table_constraints tc \
                         JOIN information_schema.key_column_usage kcu \
                           ON tc.constraint_name = kcu.constraint_name \
                         WHERE tc.constraint_type = 'PRIMARY KEY' AND tc.table_name = ? \
                         ORDER BY kcu.ordinal_position",
                        vec![table.into()],
                    ))
                    .await
                    .map_err(|e| AdapterError::classify(&e))?;
                let pk_columns = pk_rows
                    .iter()
                    .filter_map(|r| r.try_get::<String>("", "column_name").ok())
                    .collect();
                (columns, pk_columns)
            }
            _ => {
                let rows = self
                    .db
                    .query_all(self.stmt(
                        "SELECT COLUMN_NAME, DATA_TYPE, IS_NULLABLE, COLUMN_DEFAULT, COLUMN_KEY \
                         FROM information_schema.COLUMNS \
                         WHERE TABLE_SCHEMA = DATABASE() AND TABLE_NAME = ? \
                         ORDER BY ORDINAL_POSITION",
                        vec![table.into()],
                    ))
                    .await
                    .map_err(|e| AdapterError::classify(&e))?;
                if rows.is_empty() {
                    return Err(AdapterError::NotFound(format!("table {table}")));
                }
                let mut columns = Vec::with_capacity(rows.len());
                let mut pk_columns = Vec::new();
                for row in rows {
                    let name: String =
                        row.try_get("", "COLUMN_NAME").map_err(|e| AdapterError::classify(&e))?;
                    let data_type: String = row.try_get("", "DATA_TYPE").unwrap_or_default();
                    let nullable: String = row.try_get("", "IS_NULLABLE").unwrap_or_default();
                    let has_default =
                        row.try_get::<Option<String>>("", "COLUMN_DEFAULT").ok().flatten().is_some();
                    let key: String = row.try_get("", "COLUMN_KEY").unwrap_or_default();
                    if key == "PRI" {
                        pk_columns.push(name.clone());
                    }
                    columns.push(ColumnInfo {
                        name,
                        data_type,
                        not_null: nullable == "NO",
                        has_default,
                    });
                }
                (columns, pk_columns)
            }
        };

        let row_count_estimate = self.estimate_rows(table).await?;
        Ok(TableDescription {
            table_name: table.to_string(),
            pk_columns,
            columns,
            row_count_estimate,
        })
    }

    async fn pk_bounds(&self, table: &str, pk: &str) -> Result<Option<(i64, i64)>, AdapterError> {
        let sql = format!(
            "SELECT MIN({pk}) AS min_pk, MAX({pk}) AS max_pk FROM {table}",
            pk = self.quote(pk),
            table = self.quote(table)
        );
        let row = retrying(|| async {
            self.db
                .query_one(self.stmt(&sql, vec![]))
                .await
                .map_err(|e| AdapterError::classify(&e))
        })
        .await?;
        let Some(row) = row else { return Ok(None) };
        let min_pk: Option<i64> = row.try_get("", "min_pk").ok();
        let max_pk: Option<i64> = row.try_get("", "max_pk").ok();
        match (min_pk, max_pk) {
            (Some(min), Some(max)) => Ok(Some((min, max))),
            _ => Ok(None),
        }
    }

    async fn count_range(&self, table: &str, pk: &str, range: PkRange) -> Result<i64, AdapterError> {
        let sql = format!(
            "SELECT COUNT(*) AS cnt FROM {} WHERE {}",
            self.quote(table),
            self.range_predicate(pk, range)
        );
        let row = retrying(|| async {
            self.db
                .query_one(self.stmt(&sql, vec![range.start.into(), range.end.into()]))
                .await
                .map_err(|e| AdapterError::classify(&e))
        })
        .await?
        .ok_or_else(|| AdapterError::Unknown("count returned no row".into()))?;
        row.try_get::<i64>("", "cnt").map_err(|e| AdapterError::classify(&e))
    }

    async fn delete_range(&self, table: &str, pk: &str, range: PkRange) -> Result<u64, AdapterError> {
        let sql = format!(
            "DELETE FROM {} WHERE {}",
            self.quote(table),
            self.range_predicate(pk, range)
        );
        let result = retrying(|| async {
            self.db
                .execute(self.stmt(&sql, vec![range.start.into(), range.end.into()]))
                .await
                .map_err(|e| AdapterError::classify(&e))
        })
        .await?;
        Ok(result.rows_affected())
    }

    async fn fetch_batch(
        &self,
        table: &str,
        pk: &str,
        range: PkRange,
        cursor: Option<i64>,
        limit: i64,
    ) -> Result<Vec<serde_json::Map<String, JsonValue>>, AdapterError> {
        let lower = match cursor {
            Some(_) => format!("{} > ?", self.quote(pk)),
            None => format!("{} >= ?", self.quote(pk)),
        };
        let upper = if range.end_inclusive {
            format!("{} <= ?", self.quote(pk))
        } else {
            format!("{} < ?", self.quote(pk))
        };
        let sql = format!(
            "SELECT * FROM {table} WHERE {lower} AND {upper} ORDER BY {pk} ASC LIMIT {limit}",
            table = self.quote(table),
            pk = self.quote(pk),
        );
        let lower_bound = cursor.unwrap_or(range.start);
        let rows = retrying(|| async {
            JsonValue::find_by_statement(self.stmt(&sql, vec![lower_bound.into(), range.end.into()]))
                .all(&self.db)
                .await
                .map_err(|e| AdapterError::classify(&e))
        })
        .await?;
        rows.into_iter()
            .map(|v| match v {
                JsonValue::Object(map) => Ok(map),
                other => Err(AdapterError::TypeMismatch(format!(
                    "expected row object, got {other}"
                ))),
            })
            .collect()
    }

    async fn bulk_insert(
        &self,
        table: &str,
        columns: &[String],
        rows: &[Vec<JsonValue>],
    ) -> Result<BatchReport, AdapterError> {
        if rows.is_empty() {
            return Ok(BatchReport { rows_inserted: 0, latency_ms: 0, bytes: 0 });
        }
        let column_list = columns
            .iter()
            .map(|c| self.quote(c))
            .collect::<Vec<_>>()
            .join(", ");
        let row_placeholder = format!(
            "({})",
            std::iter::repeat("?")
                .take(columns.len())
                .collect::<Vec<_>>()
                .join(", ")
        );
        let values_clause = std::iter::repeat(row_placeholder.as_str())
            .take(rows.len())
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "INSERT INTO {} ({}) VALUES {}",
            self.quote(table),
            column_list,
            values_clause
        );

        let mut bytes = 0i64;
        let mut values = Vec::with_capacity(rows.len() * columns.len());
        for row in rows {
            if row.len() != columns.len() {
                return Err(AdapterError::TypeMismatch(format!(
                    "row has {} values, expected {}",
                    row.len(),
                    columns.len()
                )));
            }
            for value in row {
                bytes += approximate_size(value);
                values.push(json_to_value(value));
            }
        }

        // One target transaction per batch: a mid-chunk failure leaves a
        // clean prefix of the chunk applied.
        let start = Instant::now();
        let txn = self
            .db
            .begin()
            .await
            .map_err(|e| AdapterError::classify(&e))?;
        txn.execute(self.stmt(&sql, values))
            .await
            .map_err(|e| AdapterError::classify(&e))?;
        txn.commit().await.map_err(|e| AdapterError::classify(&e))?;
        let latency_ms = start.elapsed().as_millis() as i64;

        Ok(BatchReport {
            rows_inserted: rows.len() as u64,
            latency_ms,
            bytes,
        })
    }

    async fn list_constraints(&self, table: &str) -> Result<Vec<ConstraintDef>, AdapterError> {
        let mut defs = Vec::new();
        match self.backend {
            DbBackend::Postgres => {
                let rows = self
                    .db
                    .query_all(self.stmt(
                        "SELECT indexname, indexdef FROM pg_indexes \
                         WHERE schemaname = 'public' AND tablename = ? \
                           AND indexname NOT LIKE '%_pkey'",
                        vec![table.into()],
                    ))
                    .await
                    .map_err(|e| AdapterError::classify(&e))?;
                for row in rows {
                    let name: String = row.try_get("", "indexname").map_err(|e| AdapterError::classify(&e))?;
                    let create_sql: String = row.try_get("", "indexdef").unwrap_or_default();
                    defs.push(ConstraintDef {
                        name,
                        kind: ConstraintKind::Index,
                        create_sql: Some(create_sql),
                        unique: false,
                        columns: vec![],
                        column: None,
                        ref_table: None,
                        ref_column: None,
                    });
                }
                let fk_rows = self
                    .db
                    .query_all(self.stmt(
                        "SELECT tc.constraint_name AS name, kcu.column_name, \
                                ccu.table_name AS ref_table, ccu.column_name AS ref_column \
                         FROM information_schema.table_constraints tc \
                         JOIN information_schema.key_column_usage kcu \
                           ON tc.constraint_name = kcu.constraint_name \
                         JOIN information_schema.constraint_column_usage ccu \
                           ON ccu.constraint_name = tc.constraint_name \
                         WHERE tc.constraint_type = 'FOREIGN KEY' AND tc.table_name = ?",
                        vec![table.into()],
                    ))
                    .await
                    .map_err(|e| AdapterError::classify(&e))?;
                for row in fk_rows {
                    defs.push(ConstraintDef {
                        name: row.try_get("", "name").map_err(|e| AdapterError::classify(&e))?,
                        kind: ConstraintKind::ForeignKey,
                        create_sql: None,
                        unique: false,
                        columns: vec![],
                        column: row.try_get("", "column_name").ok(),
                        ref_table: row.try_get("", "ref_table").ok(),
                        ref_column: row.try_get("", "ref_column").ok(),
                    });
                }
            }
            DbBackend::MySql => {
                let rows = self
                    .db
                    .query_all(self.stmt(
                        "SELECT INDEX_NAME, NON_UNIQUE, COLUMN_NAME \
                         FROM information_schema.STATISTICS \
                         WHERE TABLE_SCHEMA = DATABASE() AND TABLE_NAME = ? \
                           AND INDEX_NAME <> 'PRIMARY' \
                         ORDER BY INDEX_NAME, SEQ_IN_INDEX",
                        vec![table.into()],
                    ))
                    .await
                    .map_err(|e| AdapterError::classify(&e))?;
                for row in rows {
                    let name: String =
                        row.try_get("", "INDEX_NAME").map_err(|e| AdapterError::classify(&e))?;
                    let non_unique: i64 = row.try_get("", "NON_UNIQUE").unwrap_or(1);
                    let column: String = row.try_get("", "COLUMN_NAME").unwrap_or_default();
                    match defs.iter_mut().find(|d| d.name == name) {
                        Some(def) => def.columns.push(column),
                        None => defs.push(ConstraintDef {
                            name,
                            kind: ConstraintKind::Index,
                            create_sql: None,
                            unique: non_unique == 0,
                            columns: vec![column],
                            column: None,
                            ref_table: None,
                            ref_column: None,
                        }),
                    }
                }
                let fk_rows = self
                    .db
                    .query_all(self.stmt(
                        "SELECT CONSTRAINT_NAME AS name, COLUMN_NAME, \
                                REFERENCED_TABLE_NAME AS ref_table, REFERENCED_COLUMN_NAME AS ref_column \
                         FROM information_schema.KEY_COLUMN_USAGE \
                         WHERE TABLE_SCHEMA = DATABASE() AND TABLE_NAME = ? \
                           AND REFERENCED_TABLE_NAME IS NOT NULL",
                        vec![table.into()],
                    ))
                    .await
                    .map_err(|e| AdapterError::classify(&e))?;
                for row in fk_rows {
                    defs.push(ConstraintDef {
                        name: row.try_get("", "name").map_err(|e| AdapterError::classify(&e))?,
                        kind: ConstraintKind::ForeignKey,
                        create_sql: None,
                        unique: false,
                        columns: vec![],
                        column: row.try_get("", "COLUMN_NAME").ok(),
                        ref_table: row.try_get("", "ref_table").ok(),
                        ref_column: row.try_get("", "ref_column").ok(),
                    });
                }
            }
            _ => {
                // sqlite: indexes with stored DDL; FKs are table-level and
                // cannot be dropped independently
                let rows = self
                    .db
                    .query_all(self.stmt(
                        "SELECT name, sql FROM sqlite_master \
                         WHERE type = 'index' AND tbl_name = ? AND sql IS NOT NULL",
                        vec![table.into()],
                    ))
                    .await
                    .map_err(|e| AdapterError::classify(&e))?;
                for row in rows {
                    defs.push(ConstraintDef {
                        name: row.try_get("", "name").map_err(|e| AdapterError::classify(&e))?,
                        kind: ConstraintKind::Index,
                        create_sql: row.try_get("", "sql").ok(),
                        unique: false,
                        columns: vec![],
                        column: None,
                        ref_table: None,
                        ref_column: None,
                    });
                }
            }
        }
        Ok(defs)
    }

    async fn drop_constraint(&self, table: &str, def: &ConstraintDef) -> Result<(), AdapterError> {
        let sql = match (def.kind, self.backend) {
            (ConstraintKind::Index, DbBackend::MySql) => {
                format!("DROP INDEX {} ON {}", self.quote(&def.name), self.quote(table))
            }
            (ConstraintKind::Index, _) => format!("DROP INDEX IF EXISTS {}", self.quote(&def.name)),
            (ConstraintKind::ForeignKey, DbBackend::MySql) => format!(
                "ALTER TABLE {} DROP FOREIGN KEY {}",
                self.quote(table),
                self.quote(&def.name)
            ),
            (ConstraintKind::ForeignKey, _) => format!(
                "ALTER TABLE {} DROP CONSTRAINT IF EXISTS {}",
                self.quote(table),
                self.quote(&def.name)
            ),
        };
        self.db
            .execute(Statement::from_string(self.backend, sql))
            .await
            .map_err(|e| AdapterError::classify(&e))?;
        Ok(())
    }

    async fn restore_constraint(&self, table: &str, def: &ConstraintDef) -> Result<(), AdapterError> {
        let sql = match def.kind {
            ConstraintKind::Index => match &def.create_sql {
                Some(create_sql) => create_sql.clone(),
                None => {
                    let unique = if def.unique { "UNIQUE " } else { "" };
                    let columns = def
                        .columns
                        .iter()
                        .map(|c| self.quote(c))
                        .collect::<Vec<_>>()
                        .join(", ");
                    format!(
                        "CREATE {unique}INDEX {} ON {} ({columns})",
                        self.quote(&def.name),
                        self.quote(table)
                    )
                }
            },
            ConstraintKind::ForeignKey => {
                let (Some(column), Some(ref_table), Some(ref_column)) =
                    (&def.column, &def.ref_table, &def.ref_column)
                else {
                    return Err(AdapterError::TypeMismatch(format!(
                        "foreign key {} has no restoration definition",
                        def.name
                    )));
                };
                format!(
                    "ALTER TABLE {} ADD CONSTRAINT {} FOREIGN KEY ({}) REFERENCES {} ({})",
                    self.quote(table),
                    self.quote(&def.name),
                    self.quote(column),
                    self.quote(ref_table),
                    self.quote(ref_column)
                )
            }
        };
        // Restore is idempotent: an already-present object is not an error
        match self.db.execute(Statement::from_string(self.backend, sql)).await {
            Ok(_) => Ok(()),
            Err(e) => {
                let msg = e.to_string().to_lowercase();
                if msg.contains("already exists") || msg.contains("duplicate") {
                    Ok(())
                } else {
                    Err(AdapterError::classify(&e))
                }
            }
        }
    }
}

/// Streaming pk-ordered reader over one chunk range. Memory is bounded by
/// the batch size, never the chunk size.
pub struct RangeScanner<'a> {
    adapter: &'a SqlAdapter,
    table: String,
    pk: String,
    range: PkRange,
    cursor: Option<i64>,
    done: bool,
}

impl<'a> RangeScanner<'a> {
    pub fn new(adapter: &'a SqlAdapter, table: &str, pk: &str, range: PkRange) -> Self {
        Self {
            adapter,
            table: table.to_string(),
            pk: pk.to_string(),
            range,
            cursor: None,
            done: false,
        }
    }

    pub async fn next_batch(
        &mut self,
        limit: i64,
    ) -> Result<Option<Vec<serde_json::Map<String, JsonValue>>>, AdapterError> {
        if self.done {
            return Ok(None);
        }
        let rows = self
            .adapter
            .fetch_batch(&self.table, &self.pk, self.range, self.cursor, limit.max(1))
            .await?;
        if rows.is_empty() {
            self.done = true;
            return Ok(None);
        }
        if (rows.len() as i64) < limit.max(1) {
            self.done = true;
        }
        if let Some(last) = rows.last() {
            self.cursor = last
                .get(&self.pk)
                .and_then(|v| v.as_i64())
                .or(self.cursor);
        }
        Ok(Some(rows))
    }
}

fn json_to_value(value: &JsonValue) -> sea_orm::Value {
    match value {
        JsonValue::Null => sea_orm::Value::String(None),
        JsonValue::Bool(b) => (*b).into(),
        JsonValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                i.into()
            } else {
                n.as_f64().unwrap_or(0.0).into()
            }
        }
        JsonValue::String(s) => s.clone().into(),
        other => sea_orm::Value::String(Some(Box::new(other.to_string()))),
    }
}

fn approximate_size(value: &JsonValue) -> i64 {
    match value {
        JsonValue::Null => 1,
        JsonValue::Bool(_) => 1,
        JsonValue::Number(_) => 8,
        JsonValue::String(s) => s.len() as i64,
        other => other.to_string().len() as i64,
    }
}

/// Bounded retry with exponential back-off, applied only to retryable kinds.
async fn retrying<T, Fut>(mut op: impl FnMut() -> Fut) -> Result<T, AdapterError>
where
    Fut: Future<Output = Result<T, AdapterError>>,
{
    let mut delay = RETRY_BASE_MS;
    let mut attempt = 0;
    loop {
        match op().await {
            Err(err) if err.is_retryable() && attempt + 1 < RETRY_ATTEMPTS => {
                attempt += 1;
                tracing::debug!(kind = err.kind(), attempt, "Retrying adapter operation");
                tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
                delay *= 2;
            }
            other => return other,
        }
    }
}
