//! Database operations for the audit trail.
//!
//! This module stores audit records in the SQLite table `dns_requests`,
//! the same table the dashboard reads from.

use std::net::IpAddr;

use chrono::{DateTime, SecondsFormat, Utc};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, params_from_iter, types::Type, types::Value, Row};

use crate::audit::{AuditFilter, AuditRecord, AuditSink, Pagination};
use crate::errors::DnsError;

/// Connections kept open for the writer plus concurrent readers.
const POOL_SIZE: u32 = 4;

/// SQLite-backed audit store.
pub struct AuditStore {
    pool: Pool<SqliteConnectionManager>,
}

/// Initialize the audit database.
///
/// Creates the schema if it doesn't exist.
///
/// # Arguments
/// * `db_path` - Path to the SQLite database file.
///
/// # Returns
/// The opened store, or the error that prevented opening it.
pub fn init_db(db_path: &str) -> Result<AuditStore, DnsError> {
    let manager = SqliteConnectionManager::file(db_path)
        .with_init(|conn| conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA busy_timeout = 5000;"));
    let pool = Pool::builder().max_size(POOL_SIZE).build(manager)?;

    let conn = pool.get()?;
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS dns_requests (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            client_ip TEXT NOT NULL,
            domain TEXT NOT NULL,
            blocked INTEGER NOT NULL,
            success INTEGER NOT NULL,
            timestamp TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS dns_requests_timestamp ON dns_requests (timestamp);",
    )?;

    Ok(AuditStore { pool })
}

impl AuditStore {
    /// Total number of stored records.
    pub fn count(&self) -> Result<u64, DnsError> {
        let conn = self.pool.get()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM dns_requests", [], |row| row.get(0))?;
        Ok(count as u64)
    }
}

fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<AuditRecord> {
    let client_ip: String = row.get(0)?;
    let client_ip: IpAddr = client_ip
        .parse()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(e)))?;
    let timestamp: String = row.get(4)?;
    let timestamp = DateTime::parse_from_rfc3339(&timestamp)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(4, Type::Text, Box::new(e)))?
        .with_timezone(&Utc);

    Ok(AuditRecord {
        client_ip,
        domain: row.get(1)?,
        blocked: row.get(2)?,
        success: row.get(3)?,
        timestamp,
    })
}

const INSERT_SQL: &str =
    "INSERT INTO dns_requests (client_ip, domain, blocked, success, timestamp) VALUES (?, ?, ?, ?, ?)";

impl AuditSink for AuditStore {
    fn append(&self, record: &AuditRecord) -> Result<(), DnsError> {
        self.append_batch(std::slice::from_ref(record))
    }

    fn append_batch(&self, records: &[AuditRecord]) -> Result<(), DnsError> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(INSERT_SQL)?;
            for record in records {
                stmt.execute(params![
                    record.client_ip.to_string(),
                    record.domain,
                    record.blocked,
                    record.success,
                    format_timestamp(&record.timestamp),
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn query(&self, filter: &AuditFilter, page: Pagination) -> Result<Vec<AuditRecord>, DnsError> {
        let mut sql = String::from(
            "SELECT client_ip, domain, blocked, success, timestamp FROM dns_requests WHERE 1 = 1",
        );
        let mut values: Vec<Value> = Vec::new();

        if let Some(ip) = filter.client_ip {
            sql.push_str(" AND client_ip = ?");
            values.push(Value::Text(ip.to_string()));
        }
        if let Some(domain) = &filter.domain {
            sql.push_str(" AND instr(domain, ?) > 0");
            values.push(Value::Text(domain.clone()));
        }
        if let Some(blocked) = filter.blocked {
            sql.push_str(" AND blocked = ?");
            values.push(Value::Integer(blocked as i64));
        }
        if let Some(success) = filter.success {
            sql.push_str(" AND success = ?");
            values.push(Value::Integer(success as i64));
        }
        if let Some(since) = filter.since {
            sql.push_str(" AND timestamp >= ?");
            values.push(Value::Text(format_timestamp(&since)));
        }
        sql.push_str(" ORDER BY id DESC LIMIT ? OFFSET ?");
        values.push(Value::Integer(page.limit as i64));
        values.push(Value::Integer(page.offset as i64));

        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(values), record_from_row)?;
        let records = rows.collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tempfile::tempdir;

    fn record(ip: &str, domain: &str, blocked: bool, success: bool) -> AuditRecord {
        AuditRecord::now(ip.parse().unwrap(), domain, blocked, success)
    }

    fn open() -> (tempfile::TempDir, AuditStore) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dns_logs.db");
        let store = init_db(path.to_str().unwrap()).unwrap();
        (dir, store)
    }

    #[test]
    fn appended_records_read_back_newest_first() {
        let (_dir, store) = open();
        let first = record("192.168.1.10", "ads.example.com", true, true);
        let second = record("::1", "example.org", false, false);

        store.append(&first).unwrap();
        store.append(&second).unwrap();

        let records = store.query(&AuditFilter::default(), Pagination::default()).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].domain, "example.org");
        assert_eq!(records[0].client_ip, "::1".parse::<IpAddr>().unwrap());
        assert!(!records[0].success);
        assert_eq!(records[1], AuditRecord {
            timestamp: records[1].timestamp,
            ..first.clone()
        });
        assert!((records[1].timestamp - first.timestamp).num_milliseconds().abs() < 1);
    }

    #[test]
    fn batches_are_written_together() {
        let (_dir, store) = open();
        let batch: Vec<_> = (0..300)
            .map(|i| record("10.0.0.1", &format!("host{i}.example.com"), i % 3 == 0, true))
            .collect();

        store.append_batch(&batch).unwrap();

        assert_eq!(store.count().unwrap(), 300);
    }

    #[test]
    fn filters_and_pagination_narrow_results() {
        let (_dir, store) = open();
        store.append(&record("10.0.0.1", "ads.example.com", true, true)).unwrap();
        store.append(&record("10.0.0.2", "example.com", false, true)).unwrap();
        store.append(&record("10.0.0.1", "tracker.net", true, true)).unwrap();
        store.append(&record("10.0.0.1", "down.example.com", false, false)).unwrap();

        let blocked = AuditFilter {
            blocked: Some(true),
            ..Default::default()
        };
        assert_eq!(store.query(&blocked, Pagination::default()).unwrap().len(), 2);

        let by_client = AuditFilter {
            client_ip: Some("10.0.0.1".parse().unwrap()),
            domain: Some("example".into()),
            ..Default::default()
        };
        let hits = store.query(&by_client, Pagination::default()).unwrap();
        let domains: Vec<&str> = hits.iter().map(|r| r.domain.as_str()).collect();
        assert_eq!(domains, vec!["down.example.com", "ads.example.com"]);

        let failures = AuditFilter {
            success: Some(false),
            ..Default::default()
        };
        assert_eq!(store.query(&failures, Pagination::default()).unwrap()[0].domain, "down.example.com");

        let page = store
            .query(&AuditFilter::default(), Pagination { limit: 2, offset: 1 })
            .unwrap();
        let domains: Vec<&str> = page.iter().map(|r| r.domain.as_str()).collect();
        assert_eq!(domains, vec!["tracker.net", "example.com"]);
    }

    #[test]
    fn since_excludes_older_records() {
        let (_dir, store) = open();
        let mut old = record("10.0.0.1", "old.example.com", false, true);
        old.timestamp = Utc::now() - Duration::hours(2);
        store.append(&old).unwrap();
        store.append(&record("10.0.0.1", "new.example.com", false, true)).unwrap();

        let recent = AuditFilter {
            since: Some(Utc::now() - Duration::hours(1)),
            ..Default::default()
        };
        let records = store.query(&recent, Pagination::default()).unwrap();

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].domain, "new.example.com");
    }

    #[test]
    fn reopening_keeps_existing_records() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dns_logs.db");
        let path = path.to_str().unwrap();

        init_db(path).unwrap().append(&record("10.0.0.1", "a.example.com", false, true)).unwrap();
        let store = init_db(path).unwrap();

        assert_eq!(store.count().unwrap(), 1);
    }
}
