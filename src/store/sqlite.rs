use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use rusqlite_migration::{Migrations, M};

use crate::app::{Result, TributaryError};
use crate::domain::{FeedId, HashKind, HashOutcome, Header, MediaHash, Signature, Subscription};
use crate::store::Store;

const SUBSCRIPTION_COLUMNS: &str = "sub_id, vendor, feed_id, name, data, updated_at, error";

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.run_migrations()?;
        Ok(store)
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.run_migrations()?;
        Ok(store)
    }

    fn run_migrations(&self) -> Result<()> {
        let migrations = Migrations::new(vec![M::up(include_str!(
            "../../migrations/001-initial/up.sql"
        ))]);

        let mut conn = self.conn()?;
        migrations
            .to_latest(&mut conn)
            .map_err(|e| TributaryError::Other(format!("Migration failed: {}", e)))?;

        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|e| {
            TributaryError::Database(rusqlite::Error::SqliteFailure(
                rusqlite::ffi::Error::new(1),
                Some(e.to_string()),
            ))
        })
    }

    /// Fixed-width RFC 3339 so that text ordering matches time ordering.
    fn timestamp(dt: DateTime<Utc>) -> String {
        dt.to_rfc3339_opts(SecondsFormat::Micros, true)
    }

    fn parse_datetime(s: &str) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
    }

    fn row_to_subscription(row: &Row<'_>) -> rusqlite::Result<Subscription> {
        let data: String = row.get(4)?;
        let data = serde_json::from_str(&data)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(4, Type::Text, Box::new(e)))?;
        Ok(Subscription {
            header: Header {
                sub_id: row.get(0)?,
                vendor: row.get(1)?,
                feed_id: FeedId(row.get(2)?),
            },
            name: row.get(3)?,
            data,
            updated_at: row
                .get::<_, String>(5)
                .ok()
                .and_then(|s| Self::parse_datetime(&s))
                .unwrap_or_else(Utc::now),
            error: row.get(6)?,
        })
    }

    fn row_to_media_hash(row: &Row<'_>) -> rusqlite::Result<MediaHash> {
        let kind: String = row.get(2)?;
        let kind = kind.parse::<HashKind>().map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(2, Type::Text, e.into())
        })?;
        Ok(MediaHash {
            feed_id: FeedId(row.get(0)?),
            url: row.get(1)?,
            kind,
            digest: row.get(3)?,
            first_seen: row
                .get::<_, String>(4)
                .ok()
                .and_then(|s| Self::parse_datetime(&s))
                .unwrap_or_else(Utc::now),
            last_seen: row
                .get::<_, String>(5)
                .ok()
                .and_then(|s| Self::parse_datetime(&s))
                .unwrap_or_else(Utc::now),
            collisions: row.get(6)?,
        })
    }
}

impl Store for SqliteStore {
    fn create_subscription(
        &self,
        header: &Header,
        name: &str,
        data: &serde_json::Value,
    ) -> Result<Subscription> {
        let conn = self.conn()?;
        let now = Utc::now();

        let inserted = conn.execute(
            "INSERT INTO subscriptions (sub_id, vendor, feed_id, name, data, updated_at, error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, NULL)
             ON CONFLICT DO NOTHING",
            params![
                header.sub_id,
                header.vendor,
                header.feed_id.0,
                name,
                serde_json::to_string(data)?,
                Self::timestamp(now)
            ],
        )?;

        if inserted == 0 {
            return Err(TributaryError::Exists(header.to_string()));
        }

        Ok(Subscription {
            header: header.clone(),
            name: name.to_string(),
            data: data.clone(),
            updated_at: now,
            error: None,
        })
    }

    fn get_subscription(&self, header: &Header) -> Result<Option<Subscription>> {
        let conn = self.conn()?;

        let result = conn
            .query_row(
                &format!(
                    "SELECT {} FROM subscriptions
                     WHERE sub_id = ?1 AND vendor = ?2 AND feed_id = ?3",
                    SUBSCRIPTION_COLUMNS
                ),
                params![header.sub_id, header.vendor, header.feed_id.0],
                Self::row_to_subscription,
            )
            .optional()?;

        Ok(result)
    }

    fn shift(&self, feed_id: FeedId) -> Result<Option<Subscription>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let next = tx
            .query_row(
                &format!(
                    "SELECT {} FROM subscriptions
                     WHERE feed_id = ?1 AND error IS NULL
                     ORDER BY updated_at, sub_id, vendor
                     LIMIT 1",
                    SUBSCRIPTION_COLUMNS
                ),
                params![feed_id.0],
                Self::row_to_subscription,
            )
            .optional()?;

        let next = match next {
            Some(mut subscription) => {
                let now = Utc::now();
                tx.execute(
                    "UPDATE subscriptions SET updated_at = ?1
                     WHERE sub_id = ?2 AND vendor = ?3 AND feed_id = ?4",
                    params![
                        Self::timestamp(now),
                        subscription.header.sub_id,
                        subscription.header.vendor,
                        feed_id.0
                    ],
                )?;
                subscription.updated_at = now;
                Some(subscription)
            }
            None => None,
        };

        tx.commit()?;
        Ok(next)
    }

    fn has_active(&self, feed_id: FeedId) -> Result<bool> {
        let conn = self.conn()?;

        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM subscriptions WHERE feed_id = ?1 AND error IS NULL",
            params![feed_id.0],
            |row| row.get(0),
        )?;

        Ok(count > 0)
    }

    fn active_feeds(&self) -> Result<Vec<FeedId>> {
        let conn = self.conn()?;

        let mut stmt = conn.prepare(
            "SELECT DISTINCT feed_id FROM subscriptions WHERE error IS NULL ORDER BY feed_id",
        )?;

        let feeds = stmt
            .query_map([], |row| Ok(FeedId(row.get(0)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(feeds)
    }

    fn update_subscription(&self, header: &Header, data: &serde_json::Value) -> Result<()> {
        let conn = self.conn()?;

        let updated = conn.execute(
            "UPDATE subscriptions SET data = ?1, updated_at = ?2
             WHERE sub_id = ?3 AND vendor = ?4 AND feed_id = ?5 AND error IS NULL",
            params![
                serde_json::to_string(data)?,
                Self::timestamp(Utc::now()),
                header.sub_id,
                header.vendor,
                header.feed_id.0
            ],
        )?;

        if updated == 0 {
            return Err(TributaryError::NotFound(header.to_string()));
        }
        Ok(())
    }

    fn suspend_subscription(&self, header: &Header, reason: &str) -> Result<()> {
        let conn = self.conn()?;

        let updated = conn.execute(
            "UPDATE subscriptions SET error = ?1
             WHERE sub_id = ?2 AND vendor = ?3 AND feed_id = ?4",
            params![reason, header.sub_id, header.vendor, header.feed_id.0],
        )?;

        if updated == 0 {
            return Err(TributaryError::NotFound(header.to_string()));
        }
        Ok(())
    }

    fn resume_subscription(&self, header: &Header) -> Result<()> {
        let conn = self.conn()?;

        let updated = conn.execute(
            "UPDATE subscriptions SET error = NULL
             WHERE sub_id = ?1 AND vendor = ?2 AND feed_id = ?3",
            params![header.sub_id, header.vendor, header.feed_id.0],
        )?;

        if updated == 0 {
            return Err(TributaryError::NotFound(header.to_string()));
        }
        Ok(())
    }

    fn delete_subscription(&self, header: &Header) -> Result<()> {
        let conn = self.conn()?;

        let deleted = conn.execute(
            "DELETE FROM subscriptions WHERE sub_id = ?1 AND vendor = ?2 AND feed_id = ?3",
            params![header.sub_id, header.vendor, header.feed_id.0],
        )?;

        if deleted == 0 {
            return Err(TributaryError::NotFound(header.to_string()));
        }
        Ok(())
    }

    fn clear_subscriptions(&self, feed_id: FeedId, pattern: &str) -> Result<usize> {
        let conn = self.conn()?;

        let deleted = conn.execute(
            "DELETE FROM subscriptions
             WHERE feed_id = ?1 AND error IS NOT NULL AND error LIKE ?2",
            params![feed_id.0, pattern],
        )?;

        Ok(deleted)
    }

    fn list_subscriptions(&self, feed_id: FeedId, active: bool) -> Result<Vec<Subscription>> {
        let conn = self.conn()?;

        let filter = if active {
            "error IS NULL"
        } else {
            "error IS NOT NULL"
        };
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM subscriptions WHERE feed_id = ?1 AND {} ORDER BY name, sub_id",
            SUBSCRIPTION_COLUMNS, filter
        ))?;

        let subscriptions = stmt
            .query_map(params![feed_id.0], Self::row_to_subscription)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(subscriptions)
    }

    fn record_media_hash(
        &self,
        feed_id: FeedId,
        url: &str,
        signature: &Signature,
    ) -> Result<HashOutcome> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let now = Self::timestamp(Utc::now());
        let kind = signature.kind.as_str();

        let seen_under: Option<String> = tx
            .query_row(
                "SELECT url FROM media_hashes WHERE feed_id = ?1 AND hash_kind = ?2 AND hash = ?3",
                params![feed_id.0, kind, signature.digest],
                |row| row.get(0),
            )
            .optional()?;

        let outcome = match seen_under {
            Some(seen_url) if seen_url == url => {
                tx.execute(
                    "UPDATE media_hashes SET last_seen = ?1 WHERE feed_id = ?2 AND url = ?3",
                    params![now, feed_id.0, url],
                )?;
                HashOutcome::Duplicate
            }
            Some(_) => {
                tx.execute(
                    "UPDATE media_hashes SET collisions = collisions + 1, last_seen = ?1
                     WHERE feed_id = ?2 AND hash_kind = ?3 AND hash = ?4",
                    params![now, feed_id.0, kind, signature.digest],
                )?;
                HashOutcome::Duplicate
            }
            None => {
                // Same URL with new content replaces the old signature.
                tx.execute(
                    "INSERT INTO media_hashes (feed_id, url, hash_kind, hash, first_seen, last_seen)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?5)
                     ON CONFLICT(feed_id, url) DO UPDATE SET
                        hash_kind = excluded.hash_kind,
                        hash = excluded.hash,
                        last_seen = excluded.last_seen",
                    params![feed_id.0, url, kind, signature.digest, now],
                )?;
                HashOutcome::New
            }
        };

        tx.commit()?;
        Ok(outcome)
    }

    fn get_media_hash(&self, feed_id: FeedId, url: &str) -> Result<Option<MediaHash>> {
        let conn = self.conn()?;

        let result = conn
            .query_row(
                "SELECT feed_id, url, hash_kind, hash, first_seen, last_seen, collisions
                 FROM media_hashes WHERE feed_id = ?1 AND url = ?2",
                params![feed_id.0, url],
                Self::row_to_media_hash,
            )
            .optional()?;

        Ok(result)
    }

    fn prune_media_hashes(&self, last_seen_before: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn()?;

        let deleted = conn.execute(
            "DELETE FROM media_hashes WHERE last_seen < ?1",
            params![Self::timestamp(last_seen_before)],
        )?;

        Ok(deleted)
    }
}
