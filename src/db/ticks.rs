use rusqlite::{params, Connection, OptionalExtension};
use rust_decimal::Decimal;
use serde::Serialize;
use std::str::FromStr;

use crate::db::bars::BarKind;
use crate::error::HubError;

/// One raw (timestamp, value) sample from the audit journal.
#[derive(Debug, Clone, Serialize)]
pub struct TickRow {
    pub ts_ms: i64,
    pub value: Decimal,
}

/// A registered-but-unfinalized trade settlement.
#[derive(Debug, Clone, Serialize)]
pub struct PendingTrade {
    pub tx_id: String,
    pub series_id: String,
    pub wallet: String,
    pub side: String,
    pub created_ms: i64,
}

/// Journal a raw tick value for the audit read path.
pub fn insert_tick(
    conn: &Connection,
    series_id: &str,
    kind: BarKind,
    ts_ms: i64,
    value: Decimal,
) -> Result<(), HubError> {
    conn.execute(
        "INSERT INTO ticks (series_id, kind, ts_ms, value) VALUES (?1, ?2, ?3, ?4)",
        params![series_id, kind.as_str(), ts_ms, value.to_string()],
    )?;
    Ok(())
}

/// Raw ticks in `[from_ms, to_ms]`, ascending.  No aggregation.
pub fn tick_range(
    conn: &Connection,
    series_id: &str,
    kind: BarKind,
    from_ms: i64,
    to_ms: i64,
) -> Result<Vec<TickRow>, HubError> {
    let mut stmt = conn.prepare(
        "SELECT ts_ms, value FROM ticks
         WHERE series_id = ?1 AND kind = ?2 AND ts_ms >= ?3 AND ts_ms <= ?4
         ORDER BY ts_ms ASC",
    )?;
    let rows = stmt
        .query_map(params![series_id, kind.as_str(), from_ms, to_ms], |row| {
            let raw: String = row.get(1)?;
            let value = Decimal::from_str(&raw).map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(
                    1,
                    rusqlite::types::Type::Text,
                    Box::new(e),
                )
            })?;
            Ok(TickRow {
                ts_ms: row.get(0)?,
                value,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Register a settlement before it finalizes.  Replaces any stale record
/// with the same transaction id (retried registration).
pub fn register_pending(
    conn: &Connection,
    tx_id: &str,
    series_id: &str,
    wallet: &str,
    side: &str,
    created_ms: i64,
) -> Result<(), HubError> {
    conn.execute(
        "INSERT OR REPLACE INTO pending_trades (tx_id, series_id, wallet, side, created_ms)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![tx_id, series_id, wallet, side, created_ms],
    )?;
    Ok(())
}

/// Remove and return the pending record for `tx_id`, if any.
pub fn take_pending(conn: &Connection, tx_id: &str) -> Result<Option<PendingTrade>, HubError> {
    let found = conn
        .query_row(
            "SELECT tx_id, series_id, wallet, side, created_ms
             FROM pending_trades WHERE tx_id = ?1",
            params![tx_id],
            |row| {
                Ok(PendingTrade {
                    tx_id: row.get(0)?,
                    series_id: row.get(1)?,
                    wallet: row.get(2)?,
                    side: row.get(3)?,
                    created_ms: row.get(4)?,
                })
            },
        )
        .optional()?;
    if found.is_some() {
        conn.execute("DELETE FROM pending_trades WHERE tx_id = ?1", params![tx_id])?;
    }
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::bars::tests::tmp_db_path;
    use crate::db::pool::open_pool;

    #[test]
    fn tick_journal_round_trip() {
        let pool = open_pool(&tmp_db_path("ticks"), 2).unwrap();
        let conn = pool.get().unwrap();
        insert_tick(&conn, "s", BarKind::Price, 2_000, Decimal::from(11)).unwrap();
        insert_tick(&conn, "s", BarKind::Price, 1_000, Decimal::from(10)).unwrap();
        insert_tick(&conn, "s", BarKind::Mcap, 1_000, Decimal::from(900)).unwrap();

        let rows = tick_range(&conn, "s", BarKind::Price, 0, 5_000).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].ts_ms, 1_000);
        assert_eq!(rows[1].value, Decimal::from(11));
    }

    #[test]
    fn pending_take_removes_record() {
        let pool = open_pool(&tmp_db_path("pending"), 2).unwrap();
        let conn = pool.get().unwrap();
        register_pending(&conn, "0xabc", "0xlaunch", "0xwallet", "buy", 1).unwrap();

        let taken = take_pending(&conn, "0xabc").unwrap().unwrap();
        assert_eq!(taken.series_id, "0xlaunch");
        assert_eq!(taken.wallet, "0xwallet");
        assert!(take_pending(&conn, "0xabc").unwrap().is_none());
    }
}
