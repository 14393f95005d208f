// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Live table subscriptions.
//!
//! A [`SubscriptionService`] pushes [`ChangeNotification`]s for subscribed
//! tables through an mpsc channel. The receiving half is handed out once by
//! [`SubscriptionService::notifications`]; dropping it ends delivery.
//!
//! [`LiveQueryManager`] keeps track of which (table, user, case)
//! subscriptions are open so a tenant switch can stop exactly the old
//! tenant's subscriptions and start the new ones.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::storage::{CacheKey, StorageError};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionId(pub String);

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeAction {
    Create,
    Update,
    Delete,
}

/// A pushed change to one record of a subscribed table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeNotification {
    pub table: String,
    pub action: ChangeAction,
    pub record: Value,
}

#[async_trait]
pub trait SubscriptionService: Send + Sync {
    async fn subscribe_to_table(
        &self,
        table: &str,
        user_id: Option<&str>,
        case_id: Option<&str>,
    ) -> Result<SubscriptionId, StorageError>;

    async fn unsubscribe(&self, id: &SubscriptionId) -> Result<(), StorageError>;

    /// Notification stream. `None` once it has been taken.
    fn notifications(&self) -> Option<mpsc::Receiver<ChangeNotification>>;
}

/// In-process subscription service. Notifications are injected with
/// [`InMemorySubscriptions::notify`].
pub struct InMemorySubscriptions {
    active: Mutex<HashMap<SubscriptionId, CacheKey>>,
    tx: mpsc::Sender<ChangeNotification>,
    rx: Mutex<Option<mpsc::Receiver<ChangeNotification>>>,
    failing: AtomicBool,
}

impl InMemorySubscriptions {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            active: Mutex::new(HashMap::new()),
            tx,
            rx: Mutex::new(Some(rx)),
            failing: AtomicBool::new(false),
        }
    }

    /// Make subscribe/unsubscribe fail.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Push a notification; dropped if nobody listens or the buffer is full.
    pub fn notify(&self, notification: ChangeNotification) -> bool {
        self.tx.try_send(notification).is_ok()
    }

    #[must_use]
    pub fn active(&self) -> Vec<CacheKey> {
        self.active.lock().values().cloned().collect()
    }

    #[must_use]
    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }

    fn check(&self) -> Result<(), StorageError> {
        if self.failing.load(Ordering::SeqCst) {
            Err(StorageError::Unavailable("subscription service unavailable".into()))
        } else {
            Ok(())
        }
    }
}

impl Default for InMemorySubscriptions {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl SubscriptionService for InMemorySubscriptions {
    async fn subscribe_to_table(
        &self,
        table: &str,
        user_id: Option<&str>,
        case_id: Option<&str>,
    ) -> Result<SubscriptionId, StorageError> {
        self.check()?;
        let id = SubscriptionId(Uuid::new_v4().to_string());
        self.active.lock().insert(id.clone(), CacheKey::new(table, user_id, case_id));
        Ok(id)
    }

    async fn unsubscribe(&self, id: &SubscriptionId) -> Result<(), StorageError> {
        self.check()?;
        self.active
            .lock()
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| StorageError::NotFound(format!("subscription {}", id)))
    }

    fn notifications(&self) -> Option<mpsc::Receiver<ChangeNotification>> {
        self.rx.lock().take()
    }
}

/// Open live subscriptions keyed by (table, user, case).
pub struct LiveQueryManager {
    service: Arc<dyn SubscriptionService>,
    live: Mutex<HashMap<CacheKey, SubscriptionId>>,
}

impl LiveQueryManager {
    #[must_use]
    pub fn new(service: Arc<dyn SubscriptionService>) -> Self {
        Self {
            service,
            live: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn service(&self) -> &Arc<dyn SubscriptionService> {
        &self.service
    }

    /// Subscribe to a table unless a subscription for the scope is open.
    pub async fn ensure(
        &self,
        table: &str,
        user_id: Option<&str>,
        case_id: Option<&str>,
    ) -> Result<bool, StorageError> {
        let key = CacheKey::new(table, user_id, case_id);
        if self.live.lock().contains_key(&key) {
            return Ok(false);
        }
        let id = self.service.subscribe_to_table(&key.table, user_id, case_id).await?;
        let duplicate = {
            let mut live = self.live.lock();
            if live.contains_key(&key) {
                Some(id)
            } else {
                live.insert(key.clone(), id);
                None
            }
        };
        if let Some(id) = duplicate {
            // Lost a race with a concurrent ensure for the same scope
            let _ = self.service.unsubscribe(&id).await;
            return Ok(false);
        }
        debug!(subscription = %key, "Live query started");
        crate::metrics::set_live_subscriptions(self.len());
        Ok(true)
    }

    /// Subscribe to every table for one tenant scope. Stops at the first
    /// failure; already opened subscriptions stay open.
    pub async fn start_tenant(
        &self,
        tables: &[String],
        user_id: Option<&str>,
        case_id: Option<&str>,
    ) -> Result<usize, StorageError> {
        let mut started = 0;
        for table in tables {
            if self.ensure(table, user_id, case_id).await? {
                started += 1;
            }
        }
        info!(started, case_id = ?case_id, "Tenant live queries started");
        Ok(started)
    }

    /// Unsubscribe everything for a case (`None` = every scope). Returns
    /// the number stopped; the first unsubscribe error is returned after
    /// all were attempted.
    pub async fn stop_tenant(&self, case_id: Option<&str>) -> Result<usize, StorageError> {
        let targets: Vec<(CacheKey, SubscriptionId)> = {
            let mut live = self.live.lock();
            let keys: Vec<CacheKey> = live.keys().filter(|k| k.in_scope(None, case_id)).cloned().collect();
            keys.into_iter()
                .filter_map(|k| live.remove(&k).map(|id| (k, id)))
                .collect()
        };

        let mut first_error = None;
        let mut stopped = 0;
        for (key, id) in targets {
            match self.service.unsubscribe(&id).await {
                Ok(()) => stopped += 1,
                Err(e) => {
                    warn!(subscription = %key, error = %e, "Failed to stop live query");
                    first_error.get_or_insert(e);
                }
            }
        }
        crate::metrics::set_live_subscriptions(self.len());
        match first_error {
            Some(e) => Err(e),
            None => Ok(stopped),
        }
    }

    #[must_use]
    pub fn is_live(&self, table: &str, user_id: Option<&str>, case_id: Option<&str>) -> bool {
        self.live.lock().contains_key(&CacheKey::new(table, user_id, case_id))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.live.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.live.lock().is_empty()
    }
}
