use rusqlite::{params, OptionalExtension};
use serde_json::Value;
use tokio_rusqlite::Connection;

use crate::error::Result;

use super::schema::{PRAGMAS, SCHEMA};

/// One buffered write: `Some(value)` puts, `None` deletes.
pub type KvWrite = (String, Option<Value>);

/// Durable key/value adapter. Every namespace lives in one SQLite table and
/// all statements run on the single `tokio-rusqlite` connection thread, so
/// writes are applied in the order they were issued.
#[derive(Clone)]
pub struct KvStore {
    conn: Connection,
}

impl KvStore {
    pub async fn open(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path).await?;

        conn.call(|conn| {
            conn.execute_batch(PRAGMAS)?;
            conn.execute_batch(SCHEMA)?;
            Ok(())
        })
        .await?;

        Ok(Self { conn })
    }

    pub async fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().await?;

        conn.call(|conn| {
            conn.execute_batch(SCHEMA)?;
            Ok(())
        })
        .await?;

        Ok(Self { conn })
    }

    pub async fn get(&self, namespace: &str, key: &str) -> Result<Option<Value>> {
        let namespace = namespace.to_string();
        let key = key.to_string();
        let raw = self
            .conn
            .call(move |conn| {
                let value = conn
                    .query_row(
                        "SELECT value FROM kv WHERE namespace = ?1 AND key = ?2",
                        params![namespace, key],
                        |row| row.get::<_, String>(0),
                    )
                    .optional()?;
                Ok(value)
            })
            .await?;

        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    pub async fn has(&self, namespace: &str, key: &str) -> Result<bool> {
        let namespace = namespace.to_string();
        let key = key.to_string();
        let exists = self
            .conn
            .call(move |conn| {
                let count: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM kv WHERE namespace = ?1 AND key = ?2",
                    params![namespace, key],
                    |row| row.get(0),
                )?;
                Ok(count > 0)
            })
            .await?;
        Ok(exists)
    }

    pub async fn put(&self, namespace: &str, key: &str, value: &Value) -> Result<()> {
        self.apply(namespace, vec![(key.to_string(), Some(value.clone()))])
            .await?;
        Ok(())
    }

    /// Returns whether the key existed before the delete.
    pub async fn delete(&self, namespace: &str, key: &str) -> Result<bool> {
        let namespace = namespace.to_string();
        let key = key.to_string();
        let deleted = self
            .conn
            .call(move |conn| {
                let n = conn.execute(
                    "DELETE FROM kv WHERE namespace = ?1 AND key = ?2",
                    params![namespace, key],
                )?;
                Ok(n > 0)
            })
            .await?;
        Ok(deleted)
    }

    /// All entries of a namespace in ascending key order, optionally
    /// restricted to keys starting with `prefix`.
    pub async fn entries(&self, namespace: &str, prefix: Option<&str>) -> Result<Vec<(String, Value)>> {
        let namespace = namespace.to_string();
        let prefix = prefix.unwrap_or_default().to_string();
        let rows = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    r#"SELECT key, value FROM kv
                       WHERE namespace = ?1 AND substr(key, 1, length(?2)) = ?2
                       ORDER BY key ASC"#,
                )?;
                let rows = stmt
                    .query_map(params![namespace, prefix], |row| {
                        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                    })?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

        rows.into_iter()
            .map(|(key, raw)| Ok((key, serde_json::from_str(&raw)?)))
            .collect()
    }

    pub async fn keys(&self, namespace: &str) -> Result<Vec<String>> {
        let namespace = namespace.to_string();
        let keys = self
            .conn
            .call(move |conn| {
                let mut stmt =
                    conn.prepare("SELECT key FROM kv WHERE namespace = ?1 ORDER BY key ASC")?;
                let keys = stmt
                    .query_map(params![namespace], |row| row.get::<_, String>(0))?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(keys)
            })
            .await?;
        Ok(keys)
    }

    /// Apply a batch of puts and deletes inside one SQLite transaction.
    /// Either every write lands or none does.
    pub async fn apply(&self, namespace: &str, writes: Vec<KvWrite>) -> Result<()> {
        if writes.is_empty() {
            return Ok(());
        }
        let namespace = namespace.to_string();
        let encoded = writes
            .into_iter()
            .map(|(key, value)| match value {
                Some(v) => serde_json::to_string(&v).map(|raw| (key, Some(raw))),
                None => Ok((key, None)),
            })
            .collect::<std::result::Result<Vec<_>, _>>()?;

        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                {
                    let mut upsert = tx.prepare(
                        r#"INSERT INTO kv (namespace, key, value) VALUES (?1, ?2, ?3)
                           ON CONFLICT(namespace, key) DO UPDATE SET
                               value = excluded.value,
                               updated_at = datetime('now')"#,
                    )?;
                    let mut remove =
                        tx.prepare("DELETE FROM kv WHERE namespace = ?1 AND key = ?2")?;
                    for (key, raw) in &encoded {
                        match raw {
                            Some(raw) => {
                                upsert.execute(params![namespace, key, raw])?;
                            }
                            None => {
                                remove.execute(params![namespace, key])?;
                            }
                        }
                    }
                }
                tx.commit()?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn count(&self, namespace: &str) -> Result<usize> {
        let namespace = namespace.to_string();
        let count = self
            .conn
            .call(move |conn| {
                let count: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM kv WHERE namespace = ?1",
                    params![namespace],
                    |row| row.get(0),
                )?;
                Ok(count)
            })
            .await?;
        Ok(count as usize)
    }

    pub async fn clear_namespace(&self, namespace: &str) -> Result<usize> {
        let namespace = namespace.to_string();
        let removed = self
            .conn
            .call(move |conn| {
                let n = conn.execute("DELETE FROM kv WHERE namespace = ?1", params![namespace])?;
                Ok(n)
            })
            .await?;
        Ok(removed)
    }
}
