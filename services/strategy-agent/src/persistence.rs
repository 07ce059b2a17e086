//! Strategy persistence on SQLite
//!
//! Strategies, holdings snapshots, trade details and portfolio snapshots.
//! Decimals are stored as TEXT and timestamps as epoch milliseconds.
//! Writes for one strategy are serialized through [`StrategyLocks`];
//! different strategies never wait on each other.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{FromRow, SqliteConnection};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info};

use crate::config::UserRequest;
use crate::history::sharpe_ratio;
use crate::types::{
    DecisionCycleResult, PortfolioView, StopReason, StrategyStatus, TradeHistoryEntry, TradeSide,
    TradeType,
};

#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Corrupt value in column {column}: {value}")]
    Corrupt { column: &'static str, value: String },

    #[error("Strategy not found: {0}")]
    NotFound(String),
}

pub type Result<T> = std::result::Result<T, PersistenceError>;

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn parse_decimal(column: &'static str, raw: &str) -> Result<Decimal> {
    Decimal::from_str(raw).map_err(|_| PersistenceError::Corrupt {
        column,
        value: raw.to_string(),
    })
}

fn parse_opt_decimal(column: &'static str, raw: Option<&str>) -> Result<Option<Decimal>> {
    raw.map(|r| parse_decimal(column, r)).transpose()
}

fn parse_trade_type(raw: &str) -> Result<TradeType> {
    match raw {
        "LONG" => Ok(TradeType::Long),
        "SHORT" => Ok(TradeType::Short),
        other => Err(PersistenceError::Corrupt {
            column: "type",
            value: other.to_string(),
        }),
    }
}

fn parse_side(raw: &str) -> Result<TradeSide> {
    match raw {
        "BUY" => Ok(TradeSide::Buy),
        "SELL" => Ok(TradeSide::Sell),
        other => Err(PersistenceError::Corrupt {
            column: "side",
            value: other.to_string(),
        }),
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// A persisted strategy
#[derive(Debug, Clone, PartialEq)]
pub struct StrategyRecord {
    pub strategy_id: String,
    pub name: String,
    pub status: StrategyStatus,
    pub stop_reason: Option<StopReason>,
    pub config: serde_json::Value,
    pub metadata: serde_json::Value,
    pub created_at: i64,
    pub updated_at: i64,
}

impl StrategyRecord {
    /// The request this strategy was started with
    pub fn request(&self) -> Result<UserRequest> {
        Ok(serde_json::from_value(self.config.clone())?)
    }
}

#[derive(Debug, FromRow)]
struct StrategyRow {
    id: String,
    name: String,
    status: String,
    stop_reason: Option<String>,
    config: String,
    metadata: String,
    created_at: i64,
    updated_at: i64,
}

impl TryFrom<StrategyRow> for StrategyRecord {
    type Error = PersistenceError;

    fn try_from(row: StrategyRow) -> Result<Self> {
        let status = StrategyStatus::parse(&row.status).ok_or_else(|| PersistenceError::Corrupt {
            column: "status",
            value: row.status.clone(),
        })?;
        let stop_reason = match row.stop_reason.as_deref() {
            Some(raw) => Some(StopReason::parse(raw).ok_or_else(|| PersistenceError::Corrupt {
                column: "stop_reason",
                value: raw.to_string(),
            })?),
            None => None,
        };
        Ok(Self {
            strategy_id: row.id,
            name: row.name,
            status,
            stop_reason,
            config: serde_json::from_str(&row.config)?,
            metadata: serde_json::from_str(&row.metadata)?,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// One position in the latest holdings snapshot
#[derive(Debug, Clone, PartialEq)]
pub struct HoldingRecord {
    pub symbol: String,
    pub trade_type: Option<TradeType>,
    pub quantity: Decimal,
    pub avg_price: Option<Decimal>,
    pub snapshot_ts: i64,
}

#[derive(Debug, FromRow)]
struct HoldingRow {
    symbol: String,
    #[sqlx(rename = "type")]
    trade_type: Option<String>,
    quantity: String,
    avg_price: Option<String>,
    snapshot_ts: i64,
}

impl TryFrom<HoldingRow> for HoldingRecord {
    type Error = PersistenceError;

    fn try_from(row: HoldingRow) -> Result<Self> {
        Ok(Self {
            symbol: row.symbol,
            trade_type: row.trade_type.as_deref().map(parse_trade_type).transpose()?,
            quantity: parse_decimal("quantity", &row.quantity)?,
            avg_price: parse_opt_decimal("avg_price", row.avg_price.as_deref())?,
            snapshot_ts: row.snapshot_ts,
        })
    }
}

/// One persisted fill
#[derive(Debug, Clone, PartialEq)]
pub struct TradeDetail {
    pub trade_id: String,
    pub compose_id: String,
    pub instruction_id: String,
    pub symbol: String,
    pub trade_type: TradeType,
    pub side: TradeSide,
    pub quantity: Decimal,
    pub entry_price: Option<Decimal>,
    pub exit_price: Option<Decimal>,
    pub realized_pnl: Option<Decimal>,
    pub fee_cost: Option<Decimal>,
    pub trade_ts: Option<i64>,
    pub note: Option<String>,
}

#[derive(Debug, FromRow)]
struct TradeDetailRow {
    trade_id: String,
    compose_id: String,
    instruction_id: String,
    symbol: String,
    #[sqlx(rename = "type")]
    trade_type: String,
    side: String,
    quantity: String,
    entry_price: Option<String>,
    exit_price: Option<String>,
    realized_pnl: Option<String>,
    fee_cost: Option<String>,
    trade_ts: Option<i64>,
    note: Option<String>,
}

impl TryFrom<TradeDetailRow> for TradeDetail {
    type Error = PersistenceError;

    fn try_from(row: TradeDetailRow) -> Result<Self> {
        Ok(Self {
            trade_type: parse_trade_type(&row.trade_type)?,
            side: parse_side(&row.side)?,
            quantity: parse_decimal("quantity", &row.quantity)?,
            entry_price: parse_opt_decimal("entry_price", row.entry_price.as_deref())?,
            exit_price: parse_opt_decimal("exit_price", row.exit_price.as_deref())?,
            realized_pnl: parse_opt_decimal("realized_pnl", row.realized_pnl.as_deref())?,
            fee_cost: parse_opt_decimal("fee_cost", row.fee_cost.as_deref())?,
            trade_id: row.trade_id,
            compose_id: row.compose_id,
            instruction_id: row.instruction_id,
            symbol: row.symbol,
            trade_ts: row.trade_ts,
            note: row.note,
        })
    }
}

/// Account totals at one point in time
#[derive(Debug, Clone, PartialEq)]
pub struct PortfolioSnapshotRecord {
    pub snapshot_ts: i64,
    pub cash: Decimal,
    pub total_value: Option<Decimal>,
    pub unrealized_pnl: Option<Decimal>,
    pub realized_pnl: Option<Decimal>,
}

#[derive(Debug, FromRow)]
struct SnapshotRow {
    snapshot_ts: i64,
    cash: String,
    total_value: Option<String>,
    unrealized_pnl: Option<String>,
    realized_pnl: Option<String>,
}

impl TryFrom<SnapshotRow> for PortfolioSnapshotRecord {
    type Error = PersistenceError;

    fn try_from(row: SnapshotRow) -> Result<Self> {
        Ok(Self {
            snapshot_ts: row.snapshot_ts,
            cash: parse_decimal("cash", &row.cash)?,
            total_value: parse_opt_decimal("total_value", row.total_value.as_deref())?,
            unrealized_pnl: parse_opt_decimal("unrealized_pnl", row.unrealized_pnl.as_deref())?,
            realized_pnl: parse_opt_decimal("realized_pnl", row.realized_pnl.as_deref())?,
        })
    }
}

impl PortfolioSnapshotRecord {
    /// Equity at this snapshot, falling back to cash
    pub fn equity(&self) -> Decimal {
        self.total_value.unwrap_or(self.cash)
    }
}

// ---------------------------------------------------------------------------
// Locks
// ---------------------------------------------------------------------------

/// Keyed async mutex: one lock per strategy id
#[derive(Debug, Default)]
pub struct StrategyLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl StrategyLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive write access to `strategy_id`
    pub async fn acquire(&self, strategy_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks
                .entry(strategy_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    /// Forget the lock of a deleted strategy
    async fn remove(&self, strategy_id: &str) {
        self.locks.lock().await.remove(strategy_id);
    }
}

// ---------------------------------------------------------------------------
// Repository
// ---------------------------------------------------------------------------

/// SQLite-backed store for strategies and their cycle results
#[derive(Clone)]
pub struct StrategyRepository {
    pool: SqlitePool,
    locks: Arc<StrategyLocks>,
}

impl StrategyRepository {
    /// Open a pool for `database_url`, creating the file when missing.
    /// In-memory databases get a single long-lived connection.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true);

        let in_memory = database_url.contains(":memory:");
        let pool = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(options)
                .await?
        } else {
            SqlitePoolOptions::new()
                .max_connections(5)
                .acquire_timeout(Duration::from_secs(3))
                .connect_with(options)
                .await?
        };

        info!("Strategy repository connected: {}", database_url);
        Ok(Self {
            pool,
            locks: Arc::new(StrategyLocks::new()),
        })
    }

    pub async fn migrate(&self) -> Result<()> {
        info!("Running migrations...");
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub fn locks(&self) -> &StrategyLocks {
        &self.locks
    }

    /// Insert a strategy or replace its name, status, config and metadata.
    /// Any previous stop reason is cleared.
    pub async fn upsert_strategy(
        &self,
        strategy_id: &str,
        name: &str,
        status: StrategyStatus,
        config: &UserRequest,
        metadata: &serde_json::Value,
    ) -> Result<()> {
        let _guard = self.locks.acquire(strategy_id).await;
        let now = now_ms();
        sqlx::query(
            r#"
            INSERT INTO strategies (id, name, status, stop_reason, config, metadata, created_at, updated_at)
            VALUES (?, ?, ?, NULL, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                status = excluded.status,
                stop_reason = NULL,
                config = excluded.config,
                metadata = excluded.metadata,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(strategy_id)
        .bind(name)
        .bind(status.as_str())
        .bind(serde_json::to_string(config)?)
        .bind(serde_json::to_string(metadata)?)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        debug!("Upserted strategy {} ({})", strategy_id, status.as_str());
        Ok(())
    }

    pub async fn get_strategy(&self, strategy_id: &str) -> Result<Option<StrategyRecord>> {
        let row = sqlx::query_as::<_, StrategyRow>("SELECT * FROM strategies WHERE id = ?")
            .bind(strategy_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(StrategyRecord::try_from).transpose()
    }

    /// Strategies, optionally filtered by status, oldest first
    pub async fn list_strategies(&self, status: Option<StrategyStatus>) -> Result<Vec<StrategyRecord>> {
        let rows = match status {
            Some(status) => {
                sqlx::query_as::<_, StrategyRow>(
                    "SELECT * FROM strategies WHERE status = ? ORDER BY created_at ASC, id ASC",
                )
                .bind(status.as_str())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, StrategyRow>(
                    "SELECT * FROM strategies ORDER BY created_at ASC, id ASC",
                )
                .fetch_all(&self.pool)
                .await?
            }
        };
        rows.into_iter().map(StrategyRecord::try_from).collect()
    }

    pub async fn set_status(
        &self,
        strategy_id: &str,
        status: StrategyStatus,
        stop_reason: Option<StopReason>,
    ) -> Result<()> {
        let _guard = self.locks.acquire(strategy_id).await;
        let result = sqlx::query(
            "UPDATE strategies SET status = ?, stop_reason = ?, updated_at = ? WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(stop_reason.map(|r| r.as_str()))
        .bind(now_ms())
        .bind(strategy_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(PersistenceError::NotFound(strategy_id.to_string()));
        }
        info!(
            "Strategy {} status -> {} ({})",
            strategy_id,
            status.as_str(),
            stop_reason.map(|r| r.as_str()).unwrap_or("-")
        );
        Ok(())
    }

    /// Replace the holdings snapshot with the positions in `view`
    pub async fn record_holdings(&self, strategy_id: &str, view: &PortfolioView) -> Result<()> {
        let _guard = self.locks.acquire(strategy_id).await;
        let mut tx = self.pool.begin().await?;
        replace_holdings(&mut tx, strategy_id, view).await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn latest_holdings(&self, strategy_id: &str) -> Result<Vec<HoldingRecord>> {
        let rows = sqlx::query_as::<_, HoldingRow>(
            "SELECT symbol, type, quantity, avg_price, snapshot_ts FROM strategy_holdings WHERE strategy_id = ? ORDER BY symbol",
        )
        .bind(strategy_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(HoldingRecord::try_from).collect()
    }

    /// Insert trades; a trade id seen before is updated in place
    pub async fn append_trade_details(
        &self,
        strategy_id: &str,
        trades: &[TradeHistoryEntry],
    ) -> Result<()> {
        let _guard = self.locks.acquire(strategy_id).await;
        let mut tx = self.pool.begin().await?;
        for trade in trades {
            upsert_trade(&mut tx, strategy_id, trade).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Most recent trades first
    pub async fn list_trade_details(&self, strategy_id: &str, limit: u32) -> Result<Vec<TradeDetail>> {
        let rows = sqlx::query_as::<_, TradeDetailRow>(
            r#"
            SELECT trade_id, compose_id, instruction_id, symbol, type, side, quantity,
                   entry_price, exit_price, realized_pnl, fee_cost, trade_ts, note
            FROM strategy_trade_details
            WHERE strategy_id = ?
            ORDER BY trade_ts DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(strategy_id)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TradeDetail::try_from).collect()
    }

    pub async fn record_portfolio_snapshot(&self, strategy_id: &str, view: &PortfolioView) -> Result<()> {
        let _guard = self.locks.acquire(strategy_id).await;
        let mut conn = self.pool.acquire().await?;
        insert_snapshot(&mut conn, strategy_id, view).await
    }

    pub async fn latest_portfolio_snapshot(
        &self,
        strategy_id: &str,
    ) -> Result<Option<PortfolioSnapshotRecord>> {
        let row = sqlx::query_as::<_, SnapshotRow>(
            r#"
            SELECT snapshot_ts, cash, total_value, unrealized_pnl, realized_pnl
            FROM strategy_portfolio_snapshots
            WHERE strategy_id = ?
            ORDER BY snapshot_ts DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(strategy_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(PortfolioSnapshotRecord::try_from).transpose()
    }

    /// `(snapshot_ts, equity)` in time order
    pub async fn equity_series(&self, strategy_id: &str) -> Result<Vec<(i64, f64)>> {
        let rows = sqlx::query_as::<_, SnapshotRow>(
            r#"
            SELECT snapshot_ts, cash, total_value, unrealized_pnl, realized_pnl
            FROM strategy_portfolio_snapshots
            WHERE strategy_id = ?
            ORDER BY snapshot_ts ASC, id ASC
            "#,
        )
        .bind(strategy_id)
        .fetch_all(&self.pool)
        .await?;

        let mut series = Vec::with_capacity(rows.len());
        for row in rows {
            let snapshot = PortfolioSnapshotRecord::try_from(row)?;
            if let Some(equity) = snapshot.equity().to_f64() {
                series.push((snapshot.snapshot_ts, equity));
            }
        }
        Ok(series)
    }

    /// Sharpe ratio over the persisted equity series
    pub async fn equity_sharpe(&self, strategy_id: &str) -> Result<Option<f64>> {
        Ok(sharpe_ratio(&self.equity_series(strategy_id).await?))
    }

    /// Holdings, trades and portfolio snapshot of one cycle in a single
    /// transaction
    pub async fn record_cycle(&self, strategy_id: &str, result: &DecisionCycleResult) -> Result<()> {
        let _guard = self.locks.acquire(strategy_id).await;
        let mut tx = self.pool.begin().await?;
        replace_holdings(&mut tx, strategy_id, &result.portfolio_view).await?;
        for trade in &result.trades {
            upsert_trade(&mut tx, strategy_id, trade).await?;
        }
        insert_snapshot(&mut tx, strategy_id, &result.portfolio_view).await?;
        sqlx::query("UPDATE strategies SET updated_at = ? WHERE id = ?")
            .bind(now_ms())
            .bind(strategy_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        debug!(
            "Recorded cycle {} for {}: {} trades",
            result.cycle_index,
            strategy_id,
            result.trades.len()
        );
        Ok(())
    }

    /// Remove a strategy and everything recorded for it. Returns whether it
    /// existed.
    pub async fn delete_strategy(&self, strategy_id: &str) -> Result<bool> {
        let deleted = {
            let _guard = self.locks.acquire(strategy_id).await;
            let mut tx = self.pool.begin().await?;
            for table in [
                "strategy_holdings",
                "strategy_trade_details",
                "strategy_portfolio_snapshots",
            ] {
                sqlx::query(&format!("DELETE FROM {} WHERE strategy_id = ?", table))
                    .bind(strategy_id)
                    .execute(&mut *tx)
                    .await?;
            }
            let result = sqlx::query("DELETE FROM strategies WHERE id = ?")
                .bind(strategy_id)
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            result.rows_affected() > 0
        };
        self.locks.remove(strategy_id).await;
        info!("Deleted strategy {} (existed={})", strategy_id, deleted);
        Ok(deleted)
    }
}

async fn replace_holdings(
    conn: &mut SqliteConnection,
    strategy_id: &str,
    view: &PortfolioView,
) -> Result<()> {
    sqlx::query("DELETE FROM strategy_holdings WHERE strategy_id = ?")
        .bind(strategy_id)
        .execute(&mut *conn)
        .await?;

    for (symbol, position) in &view.positions {
        if position.quantity.is_zero() {
            continue;
        }
        let trade_type = position.trade_type.unwrap_or(if position.quantity > Decimal::ZERO {
            TradeType::Long
        } else {
            TradeType::Short
        });
        sqlx::query(
            r#"
            INSERT INTO strategy_holdings (strategy_id, symbol, type, quantity, avg_price, snapshot_ts)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(strategy_id)
        .bind(symbol)
        .bind(trade_type.to_string())
        .bind(position.quantity.to_string())
        .bind(position.avg_price.map(|p| p.to_string()))
        .bind(view.ts)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

async fn upsert_trade(
    conn: &mut SqliteConnection,
    strategy_id: &str,
    trade: &TradeHistoryEntry,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO strategy_trade_details (
            strategy_id, trade_id, compose_id, instruction_id, symbol, type, side, quantity,
            entry_price, exit_price, realized_pnl, fee_cost, trade_ts, note
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(strategy_id, trade_id) DO UPDATE SET
            exit_price = excluded.exit_price,
            realized_pnl = excluded.realized_pnl,
            fee_cost = excluded.fee_cost,
            note = excluded.note
        "#,
    )
    .bind(strategy_id)
    .bind(&trade.trade_id)
    .bind(&trade.compose_id)
    .bind(&trade.instruction_id)
    .bind(&trade.instrument.symbol)
    .bind(trade.trade_type.to_string())
    .bind(trade.side.to_string())
    .bind(trade.quantity.to_string())
    .bind(trade.entry_price.map(|p| p.to_string()))
    .bind(trade.exit_price.map(|p| p.to_string()))
    .bind(trade.realized_pnl.map(|p| p.to_string()))
    .bind(trade.fee_cost.map(|p| p.to_string()))
    .bind(trade.trade_ts)
    .bind(trade.note.as_deref())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn insert_snapshot(
    conn: &mut SqliteConnection,
    strategy_id: &str,
    view: &PortfolioView,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO strategy_portfolio_snapshots (
            strategy_id, snapshot_ts, cash, total_value, unrealized_pnl, realized_pnl
        ) VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(strategy_id)
    .bind(view.ts)
    .bind(view.account_balance.to_string())
    .bind(view.total_value.map(|v| v.to_string()))
    .bind(view.total_unrealized_pnl.map(|v| v.to_string()))
    .bind(view.total_realized_pnl.map(|v| v.to_string()))
    .execute(&mut *conn)
    .await?;
    Ok(())
}
