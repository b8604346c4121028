use anyhow::Result;
use chrono::{DateTime, Utc};
use tokio_rusqlite::rusqlite::{self, OptionalExtension};
use tokio_rusqlite::{Connection, params};

use super::{parse_ts, ts};
use crate::core::Setting;

/// `(key, value, description)`
pub type SettingRow = (String, String, String);

fn map_setting(row: &rusqlite::Row<'_>) -> rusqlite::Result<Setting> {
    Ok(Setting {
        key: row.get(0)?,
        value: row.get(1)?,
        description: row.get(2)?,
        updated_at: parse_ts(&row.get::<_, String>(3)?, 3)?,
    })
}

pub async fn get(conn: &Connection, key: String) -> Result<Option<Setting>> {
    let setting = conn
        .call(move |c| {
            c.query_row(
                "SELECT key, value, description, updated_at FROM settings WHERE key = ?1",
                params![key],
                map_setting,
            )
            .optional()
        })
        .await?;

    Ok(setting)
}

pub async fn list(conn: &Connection) -> Result<Vec<Setting>> {
    let settings = conn
        .call(|c| {
            let mut stmt =
                c.prepare("SELECT key, value, description, updated_at FROM settings ORDER BY key")?;
            let rows = stmt.query_map([], map_setting)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
        })
        .await?;

    Ok(settings)
}

/// Insert rows whose key is absent. Returns how many were inserted.
pub async fn insert_missing(conn: &Connection, rows: Vec<SettingRow>, at: DateTime<Utc>) -> Result<usize> {
    let inserted = conn
        .call(move |c| {
            let tx = c.transaction()?;
            let mut inserted = 0;
            for (key, value, description) in &rows {
                inserted += tx.execute(
                    "INSERT INTO settings (key, value, description, updated_at)
                     VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT(key) DO NOTHING",
                    params![key, value, description, ts(at)],
                )?;
            }
            tx.commit()?;
            Ok::<_, rusqlite::Error>(inserted)
        })
        .await?;

    Ok(inserted)
}

/// Write all rows in one transaction, stamping each with `at`.
pub async fn upsert(conn: &Connection, rows: Vec<SettingRow>, at: DateTime<Utc>) -> Result<()> {
    conn.call(move |c| {
        let tx = c.transaction()?;
        for (key, value, description) in &rows {
            tx.execute(
                "INSERT INTO settings (key, value, description, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(key) DO UPDATE SET
                    value = excluded.value,
                    updated_at = excluded.updated_at",
                params![key, value, description, ts(at)],
            )?;
        }
        tx.commit()?;
        Ok::<_, rusqlite::Error>(())
    })
    .await?;

    Ok(())
}
