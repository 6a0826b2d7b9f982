/// Settings, per-client settings, annotations, and strategies: simple
/// key/JSON stores with CRUD plus fan-out on strategy annotation save/delete
/// (spec's out-of-scope collaborators, implemented only to the depth needed
/// to exercise the core subsystems). Behind a small trait so the core never
/// depends on the persistence technology, per the "ancillary collaborators"
/// design note.
use crate::error::Result;
use rusqlite::{params, Connection};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};

#[derive(Debug, Clone)]
pub struct Annotation {
    pub client_id: String,
    pub unique_id: String,
    pub instrument: String,
    pub timeframe: String,
    pub annotype: String,
    pub object: Value,
}

#[derive(Debug, Clone)]
pub struct Strategy {
    pub client_id: String,
    pub strategy_name: String,
    pub description: String,
    pub parameters: Value,
    pub subscribers: Vec<String>,
}

/// Fan-out event published on strategy annotation save/delete; subscribers
/// consult the strategy's `subscribers` list at dispatch time, not a cached
/// snapshot.
#[derive(Debug, Clone)]
pub enum StrategyEvent {
    AnnotationSaved { strategy_client_id: String, annotation: Annotation },
    AnnotationDeleted { strategy_client_id: String, unique_id: String },
}

#[async_trait::async_trait]
pub trait AncillaryStore: Send + Sync {
    async fn get_setting(&self, name: &str) -> Result<Option<Value>>;
    async fn set_setting(&self, name: &str, value: Value) -> Result<()>;

    async fn get_client_setting(&self, client_id: &str) -> Result<Option<Value>>;
    async fn set_client_setting(&self, client_id: &str, value: Value) -> Result<()>;

    async fn save_annotation(&self, annotation: Annotation) -> Result<()>;
    async fn delete_annotation(&self, client_id: &str, unique_id: &str) -> Result<()>;
    async fn list_annotations(&self, client_id: &str) -> Result<Vec<Annotation>>;

    async fn save_strategy(&self, strategy: Strategy) -> Result<()>;
    async fn get_strategy(&self, client_id: &str) -> Result<Option<Strategy>>;
}

pub struct SqliteAncillaryStore {
    conn: Arc<Mutex<Connection>>,
    events: broadcast::Sender<StrategyEvent>,
}

impl SqliteAncillaryStore {
    /// Takes ownership of a fresh connection so schema init can run
    /// synchronously before the connection is shared behind a mutex.
    pub fn new(conn: Connection) -> Result<Self> {
        init_schema(&conn)?;
        let (events, _) = broadcast::channel(256);
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            events,
        })
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<StrategyEvent> {
        self.events.subscribe()
    }
}

fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS settings (name TEXT PRIMARY KEY, value TEXT NOT NULL);
         CREATE TABLE IF NOT EXISTS client_settings (client_id TEXT PRIMARY KEY, value TEXT NOT NULL);
         CREATE TABLE IF NOT EXISTS annotations (
             client_id TEXT NOT NULL,
             unique_id TEXT NOT NULL,
             instrument TEXT NOT NULL,
             timeframe TEXT NOT NULL,
             annotype TEXT NOT NULL,
             object TEXT NOT NULL,
             PRIMARY KEY (client_id, unique_id)
         );
         CREATE TABLE IF NOT EXISTS strategies (
             client_id TEXT PRIMARY KEY,
             strategy_name TEXT NOT NULL,
             description TEXT NOT NULL,
             parameters TEXT NOT NULL,
             subscribers TEXT NOT NULL
         );",
    )?;
    Ok(())
}

#[async_trait::async_trait]
impl AncillaryStore for SqliteAncillaryStore {
    async fn get_setting(&self, name: &str) -> Result<Option<Value>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare("SELECT value FROM settings WHERE name = ?1")?;
        let mut rows = stmt.query(params![name])?;
        if let Some(row) = rows.next()? {
            let raw: String = row.get(0)?;
            Ok(Some(serde_json::from_str(&raw)?))
        } else {
            Ok(None)
        }
    }

    async fn set_setting(&self, name: &str, value: Value) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO settings (name, value) VALUES (?1, ?2)
             ON CONFLICT(name) DO UPDATE SET value = excluded.value",
            params![name, value.to_string()],
        )?;
        Ok(())
    }

    async fn get_client_setting(&self, client_id: &str) -> Result<Option<Value>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare("SELECT value FROM client_settings WHERE client_id = ?1")?;
        let mut rows = stmt.query(params![client_id])?;
        if let Some(row) = rows.next()? {
            let raw: String = row.get(0)?;
            Ok(Some(serde_json::from_str(&raw)?))
        } else {
            Ok(None)
        }
    }

    async fn set_client_setting(&self, client_id: &str, value: Value) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO client_settings (client_id, value) VALUES (?1, ?2)
             ON CONFLICT(client_id) DO UPDATE SET value = excluded.value",
            params![client_id, value.to_string()],
        )?;
        Ok(())
    }

    async fn save_annotation(&self, annotation: Annotation) -> Result<()> {
        {
            let conn = self.conn.lock().await;
            conn.execute(
                "INSERT INTO annotations (client_id, unique_id, instrument, timeframe, annotype, object)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(client_id, unique_id) DO UPDATE SET
                    instrument = excluded.instrument,
                    timeframe = excluded.timeframe,
                    annotype = excluded.annotype,
                    object = excluded.object",
                params![
                    annotation.client_id,
                    annotation.unique_id,
                    annotation.instrument,
                    annotation.timeframe,
                    annotation.annotype,
                    annotation.object.to_string(),
                ],
            )?;
        }
        let _ = self.events.send(StrategyEvent::AnnotationSaved {
            strategy_client_id: annotation.client_id.clone(),
            annotation,
        });
        Ok(())
    }

    async fn delete_annotation(&self, client_id: &str, unique_id: &str) -> Result<()> {
        {
            let conn = self.conn.lock().await;
            conn.execute(
                "DELETE FROM annotations WHERE client_id = ?1 AND unique_id = ?2",
                params![client_id, unique_id],
            )?;
        }
        let _ = self.events.send(StrategyEvent::AnnotationDeleted {
            strategy_client_id: client_id.to_string(),
            unique_id: unique_id.to_string(),
        });
        Ok(())
    }

    async fn list_annotations(&self, client_id: &str) -> Result<Vec<Annotation>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT client_id, unique_id, instrument, timeframe, annotype, object
             FROM annotations WHERE client_id = ?1",
        )?;
        let rows = stmt
            .query_map(params![client_id], |row| {
                let object_raw: String = row.get(5)?;
                Ok(Annotation {
                    client_id: row.get(0)?,
                    unique_id: row.get(1)?,
                    instrument: row.get(2)?,
                    timeframe: row.get(3)?,
                    annotype: row.get(4)?,
                    object: serde_json::from_str(&object_raw).unwrap_or(Value::Null),
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    async fn save_strategy(&self, strategy: Strategy) -> Result<()> {
        let conn = self.conn.lock().await;
        let subscribers = serde_json::json!({ "subscribers": strategy.subscribers }).to_string();
        conn.execute(
            "INSERT INTO strategies (client_id, strategy_name, description, parameters, subscribers)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(client_id) DO UPDATE SET
                strategy_name = excluded.strategy_name,
                description = excluded.description,
                parameters = excluded.parameters,
                subscribers = excluded.subscribers",
            params![
                strategy.client_id,
                strategy.strategy_name,
                strategy.description,
                strategy.parameters.to_string(),
                subscribers,
            ],
        )?;
        Ok(())
    }

    async fn get_strategy(&self, client_id: &str) -> Result<Option<Strategy>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT client_id, strategy_name, description, parameters, subscribers
             FROM strategies WHERE client_id = ?1",
        )?;
        let mut rows = stmt.query(params![client_id])?;
        if let Some(row) = rows.next()? {
            let params_raw: String = row.get(3)?;
            let subs_raw: String = row.get(4)?;
            let subs_json: Value = serde_json::from_str(&subs_raw)?;
            let subscribers = subs_json
                .get("subscribers")
                .and_then(|v| v.as_array())
                .map(|a| {
                    a.iter()
                        .filter_map(|v| v.as_str().map(str::to_string))
                        .collect()
                })
                .unwrap_or_default();
            Ok(Some(Strategy {
                client_id: row.get(0)?,
                strategy_name: row.get(1)?,
                description: row.get(2)?,
                parameters: serde_json::from_str(&params_raw)?,
                subscribers,
            }))
        } else {
            Ok(None)
        }
    }
}

/// Returns whether `client_id` is currently a subscriber of `strategy`,
/// consulted at dispatch time rather than cached at subscribe time.
pub fn is_subscribed(strategy: &Strategy, client_id: &str) -> bool {
    strategy.subscribers.iter().any(|s| s == client_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscriber_membership_checked_live() {
        let strategy = Strategy {
            client_id: "owner".into(),
            strategy_name: "s1".into(),
            description: "".into(),
            parameters: Value::Null,
            subscribers: vec!["a".into(), "b".into()],
        };
        assert!(is_subscribed(&strategy, "a"));
        assert!(!is_subscribed(&strategy, "c"));
    }
}
