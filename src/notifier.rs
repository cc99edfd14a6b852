//! Cross-process schema change notifications
//!
//! Every adapter instance gets a random sender id. Schema-mutating operations
//! publish `{"senderId": ..}` on a notification channel; a listener task on a
//! dedicated connection runs the registered callbacks for messages sent by
//! other instances only.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use sqlx::postgres::PgListener;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::Result;

/// Pause between reconnect attempts of the listener
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Payload carried on the schema change channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaChangeMessage {
    #[serde(rename = "senderId")]
    pub sender_id: String,
}

/// Callback run when another instance changed a schema
pub type WatchCallback = Arc<dyn Fn() + Send + Sync>;

/// Publisher and listener for one channel
pub struct SchemaChangeNotifier {
    sender_id: String,
    channel: String,
    callbacks: Arc<RwLock<Vec<WatchCallback>>>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for SchemaChangeNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchemaChangeNotifier")
            .field("sender_id", &self.sender_id)
            .field("channel", &self.channel)
            .finish()
    }
}

impl SchemaChangeNotifier {
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            sender_id: Uuid::new_v4().to_string(),
            channel: channel.into(),
            callbacks: Arc::new(RwLock::new(Vec::new())),
            listener: Mutex::new(None),
        }
    }

    pub fn sender_id(&self) -> &str {
        &self.sender_id
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Message this instance publishes
    pub fn message(&self) -> SchemaChangeMessage {
        SchemaChangeMessage {
            sender_id: self.sender_id.clone(),
        }
    }

    /// Register a callback for schema changes made elsewhere
    pub async fn watch(&self, callback: WatchCallback) {
        self.callbacks.write().await.push(callback);
    }

    /// Number of registered callbacks
    pub async fn watch_count(&self) -> usize {
        self.callbacks.read().await.len()
    }

    /// Whether a received payload came from another instance
    ///
    /// Payloads that do not parse are treated as foreign.
    pub fn is_foreign(sender_id: &str, payload: &str) -> bool {
        match serde_json::from_str::<SchemaChangeMessage>(payload) {
            Ok(message) => message.sender_id != sender_id,
            Err(_) => true,
        }
    }

    /// Start the listener task on a dedicated connection
    ///
    /// Calling it again while a listener is running does nothing. The task
    /// reconnects after connection errors and runs until [`Self::shutdown`]
    /// or until the pool is closed.
    pub async fn listen(&self, pool: &PgPool) -> Result<()> {
        let mut slot = self.listener.lock().await;
        if slot.is_some() {
            return Ok(());
        }

        let mut listener = PgListener::connect_with(pool).await?;
        listener.listen(&self.channel).await?;
        info!(channel = %self.channel, sender = %self.sender_id, "listening for schema changes");

        let sender_id = self.sender_id.clone();
        let callbacks = Arc::clone(&self.callbacks);
        let pool = pool.clone();
        *slot = Some(tokio::spawn(async move {
            loop {
                match listener.recv().await {
                    Ok(notification) => {
                        if !Self::is_foreign(&sender_id, notification.payload()) {
                            continue;
                        }
                        debug!(payload = notification.payload(), "schema change received");
                        for callback in callbacks.read().await.iter() {
                            callback();
                        }
                    }
                    Err(err) if pool.is_closed() => {
                        debug!(error = %err, "pool closed, schema change listener stopped");
                        break;
                    }
                    Err(err) => {
                        warn!(error = %err, "schema change listener lost its connection, reconnecting");
                        tokio::time::sleep(RECONNECT_DELAY).await;
                    }
                }
            }
        }));
        Ok(())
    }

    /// Announce a schema change
    ///
    /// Failures are logged and swallowed.
    pub async fn publish(&self, pool: &PgPool) {
        let payload = match serde_json::to_string(&self.message()) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(error = %err, "failed to encode schema change message");
                return;
            }
        };
        let result = sqlx::query("SELECT pg_notify($1, $2)")
            .bind(&self.channel)
            .bind(payload)
            .execute(pool)
            .await;
        if let Err(err) = result {
            warn!(channel = %self.channel, error = %err, "failed to publish schema change");
        }
    }

    /// Stop the listener task, if any
    pub async fn shutdown(&self) {
        if let Some(handle) = self.listener.lock().await.take() {
            handle.abort();
            debug!(channel = %self.channel, "schema change listener shut down");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_message_shape() {
        let notifier = SchemaChangeNotifier::new("schema.change");
        let payload = serde_json::to_value(notifier.message()).unwrap();
        assert_eq!(
            payload,
            serde_json::json!({"senderId": notifier.sender_id()})
        );
    }

    #[test]
    fn test_own_messages_are_ignored() {
        let notifier = SchemaChangeNotifier::new("schema.change");
        let own = serde_json::to_string(&notifier.message()).unwrap();
        assert!(!SchemaChangeNotifier::is_foreign(notifier.sender_id(), &own));
        assert!(SchemaChangeNotifier::is_foreign(
            notifier.sender_id(),
            r#"{"senderId": "someone-else"}"#
        ));
        assert!(SchemaChangeNotifier::is_foreign(notifier.sender_id(), "garbage"));
    }

    #[test]
    fn test_sender_ids_are_unique() {
        let a = SchemaChangeNotifier::new("c");
        let b = SchemaChangeNotifier::new("c");
        assert_ne!(a.sender_id(), b.sender_id());
    }

    #[tokio::test]
    async fn test_watch_registers_callbacks() {
        let notifier = SchemaChangeNotifier::new("c");
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        notifier
            .watch(Arc::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }))
            .await;

        assert_eq!(notifier.watch_count().await, 1);
        for callback in notifier.callbacks.read().await.iter() {
            callback();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
