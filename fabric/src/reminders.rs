//! Durable scheduled callbacks.
//!
//! A reminder belongs to an entity key, carries an opaque JSON payload, and
//! fires into the installed [`ReminderHandler`] after `due`, then every
//! `period`. Reminders are persisted through the [`StateStore`] (one table
//! document per entity key) and re-armed by [`ReminderService::resume`] after
//! a restart, so a tick can arrive for an entity that is not currently
//! activated; the handler is expected to route the tick through the
//! single-activation catalog, reactivating the entity if needed.
//!
//! A `period` of zero registers a one-shot reminder that unregisters itself
//! after firing.

use crate::state_store::StateStore;
use crate::FabricError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;

/// Storage kind under which reminder tables are persisted.
const REMINDER_KIND: &str = "reminders";
/// Slot name of the per-entity reminder table document.
const TABLE_SLOT: &str = "table";

/// One durable reminder registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReminderEntry {
    pub name: String,
    /// Opaque payload handed back to the handler on every tick.
    pub payload: Value,
    /// Delay before the first tick, in milliseconds.
    pub due_ms: u64,
    /// Tick period in milliseconds; zero means fire once and unregister.
    pub period_ms: u64,
    pub registered_at: DateTime<Utc>,
}

/// Receives reminder ticks. Installed once per service.
#[async_trait]
pub trait ReminderHandler: Send + Sync {
    async fn on_reminder(&self, entity_key: &str, name: &str, payload: &Value);
}

struct ArmedReminder {
    entry: ReminderEntry,
    task: JoinHandle<()>,
}

/// Durable reminder scheduler backed by a [`StateStore`].
pub struct ReminderService {
    store: Arc<dyn StateStore>,
    handler: RwLock<Option<Arc<dyn ReminderHandler>>>,
    tables: Mutex<HashMap<String, HashMap<String, ArmedReminder>>>,
    /// Handed to timer tasks so they never keep the service alive.
    weak_self: Weak<ReminderService>,
}

impl ReminderService {
    pub fn new(store: Arc<dyn StateStore>) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            store,
            handler: RwLock::new(None),
            tables: Mutex::new(HashMap::new()),
            weak_self: weak_self.clone(),
        })
    }

    /// Install the tick handler. Ticks that fire before a handler is
    /// installed are dropped with a warning.
    pub async fn set_handler(&self, handler: Arc<dyn ReminderHandler>) {
        *self.handler.write().await = Some(handler);
    }

    /// Register `name` for `entity_key`, replacing any existing registration
    /// with the same name, and persist the entity's reminder table.
    pub async fn register_or_update(
        &self,
        entity_key: &str,
        name: &str,
        payload: Value,
        due: Duration,
        period: Duration,
    ) -> Result<(), FabricError> {
        let entry = ReminderEntry {
            name: name.to_string(),
            payload,
            due_ms: due.as_millis() as u64,
            period_ms: period.as_millis() as u64,
            registered_at: Utc::now(),
        };

        {
            let mut tables = self.tables.lock().await;
            let table = tables.entry(entity_key.to_string()).or_default();
            if let Some(existing) = table.remove(name) {
                existing.task.abort();
            }
            let task = self.arm(entity_key, &entry);
            table.insert(
                name.to_string(),
                ArmedReminder {
                    entry: entry.clone(),
                    task,
                },
            );
        }

        self.persist_table(entity_key).await
    }

    /// Remove `name` for `entity_key`. Unknown names are a no-op.
    pub async fn unregister(&self, entity_key: &str, name: &str) -> Result<(), FabricError> {
        let removed = {
            let mut tables = self.tables.lock().await;
            match tables.get_mut(entity_key) {
                Some(table) => match table.remove(name) {
                    Some(armed) => {
                        armed.task.abort();
                        if table.is_empty() {
                            tables.remove(entity_key);
                        }
                        true
                    }
                    None => false,
                },
                None => false,
            }
        };
        if removed {
            self.persist_table(entity_key).await?;
        }
        Ok(())
    }

    /// Current registrations for `entity_key`.
    pub async fn entries(&self, entity_key: &str) -> Vec<ReminderEntry> {
        let tables = self.tables.lock().await;
        tables
            .get(entity_key)
            .map(|table| table.values().map(|armed| armed.entry.clone()).collect())
            .unwrap_or_default()
    }

    /// Number of registrations for `entity_key`.
    pub async fn count(&self, entity_key: &str) -> usize {
        let tables = self.tables.lock().await;
        tables.get(entity_key).map(|table| table.len()).unwrap_or(0)
    }

    /// Re-arm every persisted reminder table. Call once at cluster startup,
    /// after [`set_handler`](Self::set_handler).
    pub async fn resume(&self) -> Result<usize, FabricError> {
        let keys = self.store.list_keys(REMINDER_KIND).await?;
        let mut resumed = 0;
        for entity_key in keys {
            let Some(doc) = self.store.read(REMINDER_KIND, &entity_key, TABLE_SLOT).await? else {
                continue;
            };
            let entries: HashMap<String, ReminderEntry> = match serde_json::from_value(doc) {
                Ok(entries) => entries,
                Err(err) => {
                    log::error!("reminder table for '{}' is unreadable: {}", entity_key, err);
                    continue;
                }
            };

            let mut tables = self.tables.lock().await;
            let table = tables.entry(entity_key.clone()).or_default();
            for (name, entry) in entries {
                if table.contains_key(&name) {
                    continue;
                }
                let task = self.arm(&entity_key, &entry);
                table.insert(name, ArmedReminder { entry, task });
                resumed += 1;
            }
        }
        Ok(resumed)
    }

    /// Abort every armed timer task. Registrations stay persisted and come
    /// back via [`resume`](Self::resume).
    pub async fn shutdown(&self) {
        let mut tables = self.tables.lock().await;
        for (_, table) in tables.drain() {
            for (_, armed) in table {
                armed.task.abort();
            }
        }
    }

    fn arm(&self, entity_key: &str, entry: &ReminderEntry) -> JoinHandle<()> {
        let service = self.weak_self.clone();
        let entity_key = entity_key.to_string();
        let name = entry.name.clone();
        let payload = entry.payload.clone();
        let due = Duration::from_millis(entry.due_ms);
        let period = Duration::from_millis(entry.period_ms);

        tokio::spawn(async move {
            tokio::time::sleep(due).await;
            loop {
                let Some(service) = service.upgrade() else {
                    return;
                };
                let handler = service.handler.read().await.clone();
                match handler {
                    Some(handler) => handler.on_reminder(&entity_key, &name, &payload).await,
                    None => log::warn!(
                        "reminder '{}' for '{}' fired with no handler installed",
                        name,
                        entity_key
                    ),
                }

                if period.is_zero() {
                    // Remove ourselves without abort(): this IS the armed task.
                    {
                        let mut tables = service.tables.lock().await;
                        if let Some(table) = tables.get_mut(&entity_key) {
                            table.remove(&name);
                            if table.is_empty() {
                                tables.remove(&entity_key);
                            }
                        }
                    }
                    if let Err(err) = service.persist_table(&entity_key).await {
                        log::error!(
                            "one-shot reminder '{}' for '{}' could not unregister: {}",
                            name,
                            entity_key,
                            err
                        );
                    }
                    return;
                }
                drop(service);
                tokio::time::sleep(period).await;
            }
        })
    }

    async fn persist_table(&self, entity_key: &str) -> Result<(), FabricError> {
        let snapshot: HashMap<String, ReminderEntry> = {
            let tables = self.tables.lock().await;
            match tables.get(entity_key) {
                Some(table) => table
                    .iter()
                    .map(|(name, armed)| (name.clone(), armed.entry.clone()))
                    .collect(),
                None => HashMap::new(),
            }
        };

        if snapshot.is_empty() {
            self.store.clear(REMINDER_KIND, entity_key, TABLE_SLOT).await
        } else {
            let doc = serde_json::to_value(&snapshot)
                .map_err(|e| FabricError::Persistence(format!("reminder table: {}", e)))?;
            self.store
                .write(REMINDER_KIND, entity_key, TABLE_SLOT, &doc)
                .await
        }
    }
}
