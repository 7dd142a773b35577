//! SQLite order store.
//!
//! Accounts and conditional orders live in two tables. Queries run on the
//! blocking thread pool so the scheduler's runtime never waits on disk.

use crate::domain::error::{EngineError, StoreError};
use crate::domain::order::{Account, ConditionalOrder, OrderStatus};
use crate::ports::config_port::ConfigPort;
use crate::ports::order_store_port::OrderStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, OptionalExtension, Row, params};
use std::str::FromStr;
use tracing::{debug, warn};

const ORDER_COLUMNS: &str = "id, account_id, symbol, side, position_side, margin_type, price, size,
     size_type, order_type, condition_expression, exchange_order_id, action, status, message,
     created_at, updated_at";

const ACCOUNT_COLUMNS: &str = "id, name, exchange, api_key, api_secret, passphrase, testnet";

#[derive(Clone)]
pub struct SqliteOrderStore {
    pool: Pool<SqliteConnectionManager>,
}

fn db_err(e: r2d2::Error) -> StoreError {
    StoreError::Database {
        reason: e.to_string(),
    }
}

fn query_err(e: rusqlite::Error) -> StoreError {
    StoreError::Query {
        reason: e.to_string(),
    }
}

impl SqliteOrderStore {
    pub fn from_config(config: &dyn ConfigPort) -> Result<Self, EngineError> {
        let db_path = config.require_string("sqlite", "path")?;

        let pool_size = config.get_int("sqlite", "pool_size", 4).max(1) as u32;

        let manager = SqliteConnectionManager::file(&db_path);
        let pool = Pool::builder()
            .max_size(pool_size)
            .build(manager)
            .map_err(db_err)?;

        let store = Self { pool };
        store.initialize_schema()?;
        Ok(store)
    }

    /// Single-connection in-memory store with the schema in place.
    pub fn in_memory() -> Result<Self, StoreError> {
        let manager = SqliteConnectionManager::memory();
        let pool = Pool::builder().max_size(1).build(manager).map_err(db_err)?;
        let store = Self { pool };
        store.initialize_schema()?;
        Ok(store)
    }

    pub fn initialize_schema(&self) -> Result<(), StoreError> {
        let conn = self.pool.get().map_err(db_err)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS accounts (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                exchange TEXT NOT NULL,
                api_key TEXT NOT NULL DEFAULT '',
                api_secret TEXT NOT NULL DEFAULT '',
                passphrase TEXT NOT NULL DEFAULT '',
                testnet INTEGER NOT NULL DEFAULT 0
            );
            CREATE TABLE IF NOT EXISTS conditional_orders (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                account_id INTEGER NOT NULL,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                position_side TEXT NOT NULL,
                margin_type TEXT NOT NULL,
                price REAL NOT NULL,
                size REAL NOT NULL,
                size_type TEXT NOT NULL,
                order_type TEXT NOT NULL,
                condition_expression TEXT NOT NULL DEFAULT '',
                exchange_order_id TEXT,
                action TEXT NOT NULL,
                status TEXT NOT NULL,
                message TEXT NOT NULL DEFAULT '',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_orders_status ON conditional_orders(status);",
        )
        .map_err(query_err)?;
        Ok(())
    }

    /// Run `f` with a pooled connection on the blocking thread pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get().map_err(db_err)?;
            f(&mut conn)
        })
        .await
        .map_err(|e| StoreError::Database {
            reason: format!("store task failed: {e}"),
        })?
    }
}

fn parse_column<T>(row: &Row<'_>, index: usize, name: &str) -> Result<T, StoreError>
where
    T: FromStr<Err = String>,
{
    let raw: String = row.get(index).map_err(query_err)?;
    raw.parse().map_err(|reason| StoreError::CorruptRow {
        table: "conditional_orders",
        reason: format!("{name}: {reason}"),
    })
}

fn parse_time(row: &Row<'_>, index: usize, name: &str) -> Result<DateTime<Utc>, StoreError> {
    let raw: String = row.get(index).map_err(query_err)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::CorruptRow {
            table: "conditional_orders",
            reason: format!("{name}: {e}"),
        })
}

fn order_from_row(row: &Row<'_>) -> Result<ConditionalOrder, StoreError> {
    Ok(ConditionalOrder {
        id: row.get(0).map_err(query_err)?,
        account_id: row.get(1).map_err(query_err)?,
        symbol: row.get(2).map_err(query_err)?,
        side: parse_column(row, 3, "side")?,
        position_side: parse_column(row, 4, "position_side")?,
        margin_type: parse_column(row, 5, "margin_type")?,
        price: row.get(6).map_err(query_err)?,
        size: row.get(7).map_err(query_err)?,
        size_type: parse_column(row, 8, "size_type")?,
        order_type: parse_column(row, 9, "order_type")?,
        condition: row.get(10).map_err(query_err)?,
        exchange_order_id: row.get(11).map_err(query_err)?,
        action: parse_column(row, 12, "action")?,
        status: parse_column(row, 13, "status")?,
        message: row.get(14).map_err(query_err)?,
        created_at: parse_time(row, 15, "created_at")?,
        updated_at: parse_time(row, 16, "updated_at")?,
    })
}

fn account_from_row(row: &Row<'_>) -> rusqlite::Result<Account> {
    Ok(Account {
        id: row.get(0)?,
        name: row.get(1)?,
        exchange: row.get(2)?,
        api_key: row.get(3)?,
        api_secret: row.get(4)?,
        passphrase: row.get(5)?,
        testnet: row.get(6)?,
    })
}

/// Matching rows, each decoded on its own so one bad row does not hide the rest.
fn query_rows(
    conn: &Connection,
    filter: &str,
    args: &[&dyn rusqlite::ToSql],
) -> Result<Vec<Result<ConditionalOrder, StoreError>>, StoreError> {
    let sql = format!("SELECT {ORDER_COLUMNS} FROM conditional_orders {filter} ORDER BY id");
    let mut stmt = conn.prepare(&sql).map_err(query_err)?;
    let mut rows = stmt.query(args).map_err(query_err)?;
    let mut orders = Vec::new();
    while let Some(row) = rows.next().map_err(query_err)? {
        orders.push(order_from_row(row));
    }
    Ok(orders)
}

fn query_orders(
    conn: &Connection,
    filter: &str,
    args: &[&dyn rusqlite::ToSql],
) -> Result<Vec<ConditionalOrder>, StoreError> {
    query_rows(conn, filter, args)?.into_iter().collect()
}

#[async_trait]
impl OrderStore for SqliteOrderStore {
    async fn list_waiting(&self) -> Result<Vec<ConditionalOrder>, StoreError> {
        self.with_conn(|conn| {
            let rows = query_rows(conn, "WHERE status = ?1", params![OrderStatus::Waiting.as_str()])?;
            Ok(rows
                .into_iter()
                .filter_map(|row| {
                    row.inspect_err(|e| warn!(error = %e, "skipping unreadable waiting order"))
                        .ok()
                })
                .collect())
        })
        .await
    }

    async fn save(&self, order: &ConditionalOrder) -> Result<(), StoreError> {
        let order = order.clone();
        self.with_conn(move |conn| {
            let changed = conn
                .execute(
                    "UPDATE conditional_orders
                     SET status = ?1, message = ?2, exchange_order_id = ?3, updated_at = ?4
                     WHERE id = ?5 AND status = ?6",
                    params![
                        order.status.as_str(),
                        order.message,
                        order.exchange_order_id,
                        order.updated_at.to_rfc3339(),
                        order.id,
                        OrderStatus::Waiting.as_str()
                    ],
                )
                .map_err(query_err)?;
            if changed == 0 {
                let stored: Option<String> = conn
                    .query_row(
                        "SELECT status FROM conditional_orders WHERE id = ?1",
                        params![order.id],
                        |row| row.get(0),
                    )
                    .optional()
                    .map_err(query_err)?;
                let Some(raw) = stored else {
                    return Err(StoreError::OrderNotFound(order.id));
                };
                let from = raw.parse::<OrderStatus>().map_err(|reason| StoreError::CorruptRow {
                    table: "conditional_orders",
                    reason: format!("status: {reason}"),
                })?;
                return Err(StoreError::InvalidTransition {
                    id: order.id,
                    from,
                    to: order.status,
                });
            }
            debug!(order_id = order.id, status = %order.status, "order saved");
            Ok(())
        })
        .await
    }

    async fn get(&self, id: i64) -> Result<ConditionalOrder, StoreError> {
        self.with_conn(move |conn| {
            query_orders(conn, "WHERE id = ?1", params![id])?
                .into_iter()
                .next()
                .ok_or(StoreError::OrderNotFound(id))
        })
        .await
    }

    async fn list(&self) -> Result<Vec<ConditionalOrder>, StoreError> {
        self.with_conn(|conn| query_orders(conn, "", params![])).await
    }

    async fn insert(&self, order: &ConditionalOrder) -> Result<i64, StoreError> {
        let order = order.clone();
        self.with_conn(move |conn| {
            let now = Utc::now().to_rfc3339();
            conn.execute(
                "INSERT INTO conditional_orders (account_id, symbol, side, position_side,
                    margin_type, price, size, size_type, order_type, condition_expression,
                    exchange_order_id, action, status, message, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, NULL, ?11, ?12, '', ?13, ?13)",
                params![
                    order.account_id,
                    order.symbol,
                    order.side.as_str(),
                    order.position_side.as_str(),
                    order.margin_type.as_str(),
                    order.price,
                    order.size,
                    order.size_type.as_str(),
                    order.order_type.as_str(),
                    order.condition,
                    order.action.as_str(),
                    OrderStatus::Waiting.as_str(),
                    now
                ],
            )
            .map_err(query_err)?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    async fn get_account(&self, id: i64) -> Result<Account, StoreError> {
        self.with_conn(move |conn| {
            conn.query_row(
                &format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = ?1"),
                params![id],
                account_from_row,
            )
            .optional()
            .map_err(query_err)?
            .ok_or(StoreError::AccountNotFound(id))
        })
        .await
    }

    async fn upsert_account(&self, account: &Account) -> Result<(), StoreError> {
        let account = account.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO accounts (id, name, exchange, api_key, api_secret, passphrase, testnet)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(id) DO UPDATE SET name = excluded.name,
                    exchange = excluded.exchange, api_key = excluded.api_key,
                    api_secret = excluded.api_secret, passphrase = excluded.passphrase,
                    testnet = excluded.testnet",
                params![
                    account.id,
                    account.name,
                    account.exchange,
                    account.api_key,
                    account.api_secret,
                    account.passphrase,
                    account.testnet
                ],
            )
            .map_err(query_err)?;
            Ok(())
        })
        .await
    }
}
