//! Typed replicated-event listeners.
//!
//! A listener is one watch task reading the store's event stream for a key
//! or prefix. Events are decoded to the caller's record type and handed to
//! the handler on independent tasks, so one slow handler cannot stall the
//! stream. A decode failure discards the event and keeps the listener; a
//! handler failure is persisted as an [`EventError`] for operator review
//! and is not retried.

use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use etcd_client::{GetOptions, SortOrder, SortTarget, WatchOptions};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{Store, NODE_ERRORS_PREFIX};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Created,
    Modified,
    Deleted,
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::Modified => "modified",
            Self::Deleted => "deleted",
        };
        f.write_str(name)
    }
}

/// A replicated-event handler failure, persisted until an operator
/// resolves it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventError {
    pub node_id: String,
    pub error_id: String,
    pub failed_event_data: String,
    pub error: String,
    pub time: DateTime<Utc>,
}

impl Store {
    /// Watch a key (or prefix) and deliver decoded events to `handler`.
    ///
    /// Returns an opaque key for
    /// [`deregister_event_listener`](Store::deregister_event_listener).
    ///
    /// # Errors
    ///
    /// Returns an error when the watch cannot be established.
    pub async fn register_event_listener<T, F, Fut>(
        &self,
        path: impl Into<String>,
        is_prefix: bool,
        handler: F,
    ) -> Result<String>
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(String, T, Option<T>, EventType) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let path = path.into();

        let mut options = WatchOptions::new().with_prev_key();
        if is_prefix {
            options = options.with_prefix();
        }

        let mut client = self.client();
        let (mut watcher, mut stream) = client
            .watch(path.clone(), Some(options))
            .await
            .with_context(|| format!("watching {path}"))?;

        let key = Uuid::new_v4().simple().to_string();
        let (cancel_tx, mut cancel_rx) = watch::channel(false);
        self.listeners().insert(key.clone(), cancel_tx);

        let store = self.clone();
        let handler = Arc::new(handler);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel_rx.changed() => {
                        if let Err(err) = watcher.cancel().await {
                            debug!("cancelling watch on {path}: {err}");
                        }
                        break;
                    }
                    message = stream.message() => match message {
                        Ok(Some(response)) => {
                            for event in response.events() {
                                dispatch(&store, &handler, event);
                            }
                        }
                        Ok(None) => {
                            warn!("watch stream for {path} closed");
                            break;
                        }
                        Err(err) => {
                            warn!("watch stream for {path} failed: {err}");
                            break;
                        }
                    }
                }
            }
        });

        Ok(key)
    }

    /// Cancel a listener's watch; unknown keys are ignored.
    pub fn deregister_event_listener(&self, key: &str) {
        if let Some(cancel) = self.listeners().remove(key) {
            let _ = cancel.send(true);
        }
    }

    /// Persist a handler failure for operator review.
    ///
    /// # Errors
    ///
    /// Returns an error when the write fails.
    pub async fn raise_error(&self, raised: &anyhow::Error, payload: &[u8]) -> Result<()> {
        let record = EventError {
            node_id: self.node_id().to_string(),
            error_id: Uuid::new_v4().simple().to_string(),
            failed_event_data: String::from_utf8_lossy(payload).into_owned(),
            error: format!("{raised:#}"),
            time: Utc::now(),
        };

        self.put_json(format!("{NODE_ERRORS_PREFIX}{}", record.error_id), &record)
            .await
    }

    /// All unresolved event errors, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error when the range read fails.
    pub async fn all_errors(&self) -> Result<Vec<EventError>> {
        let mut client = self.client();
        let options = GetOptions::new()
            .with_prefix()
            .with_sort(SortTarget::Key, SortOrder::Descend);
        let response = client
            .get(NODE_ERRORS_PREFIX, Some(options))
            .await
            .context("reading event errors")?;

        let mut out = Vec::with_capacity(response.kvs().len());
        for kv in response.kvs() {
            let record: EventError =
                serde_json::from_slice(kv.value()).context("decoding event error")?;
            out.push(record);
        }
        Ok(out)
    }

    /// # Errors
    ///
    /// Returns an error when the delete fails.
    pub async fn resolve_error(&self, error_id: &str) -> Result<bool> {
        self.delete(format!("{NODE_ERRORS_PREFIX}{error_id}")).await
    }
}

fn dispatch<T, F, Fut>(store: &Store, handler: &Arc<F>, event: &etcd_client::Event)
where
    T: DeserializeOwned + Send + 'static,
    F: Fn(String, T, Option<T>, EventType) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let Some(kv) = event.kv() else {
        return;
    };
    let Ok(key) = kv.key_str() else {
        warn!("discarding event with non-UTF-8 key");
        return;
    };
    let key = key.to_string();

    let (event_type, current_bytes) = match event.event_type() {
        // A delete carries no current value; the handler sees the record
        // that was removed.
        etcd_client::EventType::Delete => {
            let Some(previous) = event.prev_kv() else {
                warn!("discarding delete event without previous value for {key}");
                return;
            };
            (EventType::Deleted, previous.value().to_vec())
        }
        etcd_client::EventType::Put if event.prev_kv().is_none() => {
            (EventType::Created, kv.value().to_vec())
        }
        etcd_client::EventType::Put => (EventType::Modified, kv.value().to_vec()),
    };

    let current: T = match serde_json::from_slice(&current_bytes) {
        Ok(value) => value,
        Err(err) => {
            warn!("unable to decode current value for {key}: {err}");
            return;
        }
    };

    let previous: Option<T> = match event.prev_kv() {
        Some(previous) => match serde_json::from_slice(previous.value()) {
            Ok(value) => Some(value),
            Err(err) => {
                warn!("unable to decode previous value for {key}: {err}");
                return;
            }
        },
        None => None,
    };

    let store = store.clone();
    let handler = Arc::clone(handler);
    tokio::spawn(async move {
        if let Err(err) = handler(key.clone(), current, previous, event_type).await {
            warn!("applying {event_type} event for {key} failed: {err:#}");
            if let Err(raise) = store.raise_error(&err, &current_bytes).await {
                warn!("failed to raise error with cluster: {raise:#}");
            }
        }
    });
}
