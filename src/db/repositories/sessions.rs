use std::collections::BTreeMap;

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::db::{
    connection::Database,
    helpers::{format_datetime, parse_datetime, parse_optional_datetime, to_i64},
};
use crate::readings::SensorReading;
use crate::session::Session;

const SESSION_COLUMNS: &str = "id, started_at, ended_at, comment";

fn row_to_session(row: &Row) -> Result<Session> {
    let started_at: String = row.get("started_at")?;
    let ended_at: Option<String> = row.get("ended_at")?;

    Ok(Session {
        id: row.get("id")?,
        start_time: parse_datetime(&started_at, "started_at")?,
        end_time: parse_optional_datetime(ended_at, "ended_at")?,
        comment: row.get("comment")?,
        readings: Vec::new(),
    })
}

fn load_readings(conn: &Connection, owner_key: &str, session_id: &str) -> Result<Vec<SensorReading>> {
    let mut stmt = conn.prepare_cached(
        "SELECT timestamp, channels_json
         FROM readings
         WHERE owner_key = ?1 AND session_id = ?2
         ORDER BY seq ASC",
    )?;

    let mut rows = stmt.query(params![owner_key, session_id])?;
    let mut readings = Vec::new();
    while let Some(row) = rows.next()? {
        let timestamp: String = row.get(0)?;
        let channels_json: String = row.get(1)?;
        let channels: BTreeMap<String, f64> = serde_json::from_str(&channels_json)
            .with_context(|| format!("corrupt channels for session {session_id}"))?;
        readings.push(SensorReading::new(
            parse_datetime(&timestamp, "readings.timestamp")?,
            channels,
        ));
    }
    Ok(readings)
}

fn with_readings(conn: &Connection, owner_key: &str, mut session: Session) -> Result<Session> {
    session.readings = load_readings(conn, owner_key, &session.id)?;
    Ok(session)
}

impl Database {
    /// Writes the session and all its readings in one transaction. Saving an
    /// id the owner already has replaces it; ids are scoped per owner.
    pub async fn insert_session(&self, owner_key: &str, session: &Session) -> Result<()> {
        let owner_key = owner_key.to_string();
        let record = session.clone();
        self.execute(move |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "DELETE FROM sessions WHERE owner_key = ?1 AND id = ?2",
                params![owner_key, record.id],
            )?;
            tx.execute(
                "INSERT INTO sessions (id, owner_key, started_at, ended_at, comment, saved_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    record.id,
                    owner_key,
                    format_datetime(&record.start_time),
                    record.end_time.as_ref().map(format_datetime),
                    record.comment,
                    format_datetime(&Utc::now()),
                ],
            )
            .context("failed to insert session")?;

            {
                let mut stmt = tx.prepare(
                    "INSERT INTO readings (owner_key, session_id, seq, timestamp, channels_json)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                )?;
                for (seq, reading) in record.readings.iter().enumerate() {
                    stmt.execute(params![
                        owner_key,
                        record.id,
                        to_i64(seq)?,
                        format_datetime(&reading.timestamp),
                        serde_json::to_string(&reading.channels)?,
                    ])
                    .with_context(|| format!("failed to insert reading {seq}"))?;
                }
            }

            tx.commit().context("failed to commit session")?;
            Ok(())
        })
        .await
    }

    /// Newest first; sessions with equal start times come back newest save
    /// first.
    pub async fn list_sessions(&self, owner_key: &str) -> Result<Vec<Session>> {
        let owner_key = owner_key.to_string();
        self.execute(move |conn| {
            let sql = format!(
                "SELECT {SESSION_COLUMNS}
                 FROM sessions
                 WHERE owner_key = ?1
                 ORDER BY started_at DESC, rowid DESC"
            );
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query(params![owner_key])?;

            let mut sessions = Vec::new();
            while let Some(row) = rows.next()? {
                sessions.push(row_to_session(row)?);
            }
            drop(rows);

            let mut loaded = Vec::with_capacity(sessions.len());
            for session in sessions {
                loaded.push(with_readings(conn, &owner_key, session)?);
            }
            Ok(loaded)
        })
        .await
    }

    pub async fn get_session(&self, owner_key: &str, session_id: &str) -> Result<Option<Session>> {
        let owner_key = owner_key.to_string();
        let session_id = session_id.to_string();
        self.execute(move |conn| {
            let sql = format!(
                "SELECT {SESSION_COLUMNS}
                 FROM sessions
                 WHERE owner_key = ?1 AND id = ?2"
            );
            let session = conn
                .query_row(&sql, params![owner_key, session_id], |row| {
                    Ok(row_to_session(row))
                })
                .optional()?
                .transpose()?;

            match session {
                Some(session) => Ok(Some(with_readings(conn, &owner_key, session)?)),
                None => Ok(None),
            }
        })
        .await
    }

    pub async fn delete_session(&self, owner_key: &str, session_id: &str) -> Result<bool> {
        let owner_key = owner_key.to_string();
        let session_id = session_id.to_string();
        self.execute(move |conn| {
            let deleted = conn.execute(
                "DELETE FROM sessions WHERE owner_key = ?1 AND id = ?2",
                params![owner_key, session_id],
            )?;
            Ok(deleted > 0)
        })
        .await
    }

    pub async fn clear_sessions(&self, owner_key: &str) -> Result<usize> {
        let owner_key = owner_key.to_string();
        self.execute(move |conn| {
            let deleted = conn
                .execute("DELETE FROM sessions WHERE owner_key = ?1", params![owner_key])
                .context("failed to clear sessions")?;
            Ok(deleted)
        })
        .await
    }
}
