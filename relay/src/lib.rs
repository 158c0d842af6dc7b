//! Rendezvous relay for wormhole clients.
//!
//! The relay brokers numbered channels inside per-application namespaces:
//! clients allocate a channel (or pick one by number), post opaque messages
//! to it, and read them back either by polling or over a server-sent event
//! stream. Message bodies are hex strings the relay never parses, so it
//! learns nothing about the shared secret the clients derive.
//!
//! All durable state lives in SQLite; the in-memory registry only tracks the
//! event stream subscribers of each channel. Every mutation runs under one
//! lock and writes commit before any fan-out, so each subscriber observes
//! the welcome, the full history, and all later messages in order, with no
//! gap in between.

mod http;
mod registry;
mod store;

use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use serde_derive::{Deserialize, Serialize};
use tokio::sync::mpsc;

pub use crate::registry::Subscription;
use crate::{registry::AppNamespace, store::Store};

/// Channels whose newest message is older than this are swept.
pub const CHANNEL_EXPIRATION_TIME: Duration = Duration::from_secs(3 * 24 * 60 * 60);
/// How often the sweep runs.
pub const EXPIRATION_CHECK_PERIOD: Duration = Duration::from_secs(2 * 60 * 60);

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum RelayError {
    /// Every id in the digit ranges and 1000 random draws were taken
    #[error("unable to find a free channel id")]
    ChannelsExhausted,
    /// Database error
    #[error("database error")]
    Db(
        #[from]
        #[source]
        rusqlite::Error,
    ),
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// SQLite database path; `None` keeps all state in memory.
    pub database: Option<PathBuf>,
    /// Client version advertised in the welcome.
    pub advertised_version: Option<String>,
    /// Message of the day shown to clients once.
    pub motd: Option<String>,
    /// Fatal error pushed to every client; set this to turn clients away.
    pub error: Option<String>,
    /// Age of the newest message beyond which a channel expires.
    pub channel_expiration: Duration,
    /// Period of the expiration sweep.
    pub expiration_check_period: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        RelayConfig {
            database: None,
            advertised_version: None,
            motd: None,
            error: None,
            channel_expiration: CHANNEL_EXPIRATION_TIME,
            expiration_check_period: EXPIRATION_CHECK_PERIOD,
        }
    }
}

/// Metadata sent with every response and pushed as the first stream event.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct Welcome {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub motd: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// One relayed message as clients see it. `phase` is preserved verbatim and
/// `body` stays the opaque hex string the sender posted.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub phase: String,
    pub body: String,
}

/// Outcome of releasing one side's claim on a channel.
#[derive(Serialize, Debug, Copy, Clone, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DeallocateStatus {
    /// Other sides still claim the channel
    Waiting,
    /// The last claim is gone; the channel and its messages were deleted
    Deleted,
}

/// The relay service: owns the database and the live registries. There is no
/// ambient state; embed it by constructing one and serving its router.
pub struct Relay {
    welcome: Welcome,
    config: RelayConfig,
    inner: Mutex<Inner>,
}

struct Inner {
    store: Store,
    apps: HashMap<String, AppNamespace>,
    next_subscriber_id: u64,
}

impl Relay {
    pub fn new(config: RelayConfig) -> Result<Arc<Self>, RelayError> {
        let store = Store::open(config.database.as_deref())?;
        let welcome = Welcome {
            current_version: config.advertised_version.clone(),
            motd: config.motd.clone(),
            error: config.error.clone(),
        };
        Ok(Arc::new(Relay {
            welcome,
            config,
            inner: Mutex::new(Inner {
                store,
                apps: HashMap::new(),
                next_subscriber_id: 0,
            }),
        }))
    }

    pub fn welcome(&self) -> &Welcome {
        &self.welcome
    }

    /// The axum router serving the relay protocol.
    pub fn router(self: Arc<Self>) -> axum::Router {
        http::router(self)
    }

    /// Serve the relay on an already-bound listener.
    pub async fn serve(
        self: Arc<Self>,
        listener: tokio::net::TcpListener,
    ) -> std::io::Result<()> {
        axum::serve(listener, self.router()).await
    }

    /// Claim a fresh channel id for `side`.
    pub fn allocate(&self, app_id: &str, side: &str) -> Result<u32, RelayError> {
        let mut inner = self.lock();
        let allocated = inner.store.allocated_channels(app_id)?.into_iter().collect();
        let channel_id = registry::choose_channel_id(&allocated)?;
        inner.store.insert_allocation(app_id, channel_id, side)?;
        tracing::info!(app_id, channel_id, "allocated channel");
        Ok(channel_id)
    }

    /// All channel ids with at least one claim in the app, ascending.
    pub fn list(&self, app_id: &str) -> Result<Vec<u32>, RelayError> {
        Ok(self.lock().store.allocated_channels(app_id)?)
    }

    /// Append a message, re-assert the sender's claim, and fan the message
    /// out to the channel's subscribers. Returns the full history, the new
    /// message included.
    pub fn add_message(
        &self,
        app_id: &str,
        channel_id: u32,
        side: &str,
        phase: &str,
        body: &str,
    ) -> Result<Vec<Message>, RelayError> {
        let mut inner = self.lock();
        inner
            .store
            .insert_message(app_id, channel_id, side, phase, body, unix_now())?;
        inner.store.insert_allocation(app_id, channel_id, side)?;
        let history = inner.store.messages(app_id, channel_id)?;
        // the write is committed; subscribers may hear about it now
        inner.broadcast(
            app_id,
            channel_id,
            &Message {
                phase: phase.to_owned(),
                body: body.to_owned(),
            },
        );
        Ok(history)
    }

    /// The channel history for polling readers. Same read the event stream
    /// replay uses.
    pub fn channel_messages(
        &self,
        app_id: &str,
        channel_id: u32,
    ) -> Result<Vec<Message>, RelayError> {
        Ok(self.lock().store.messages(app_id, channel_id)?)
    }

    /// Register an event stream subscriber. The returned history snapshot
    /// and the subscription are taken under one lock acquisition, so no
    /// message can fall between replay and live delivery.
    pub fn subscribe(
        self: Arc<Self>,
        app_id: &str,
        channel_id: u32,
    ) -> Result<(Vec<Message>, Subscription), RelayError> {
        let mut inner = self.lock();
        let history = inner.store.messages(app_id, channel_id)?;
        let (tx, rx) = mpsc::unbounded_channel();
        let subscriber_id = inner.next_subscriber_id;
        inner.next_subscriber_id += 1;
        inner
            .apps
            .entry(app_id.to_owned())
            .or_default()
            .channels
            .entry(channel_id)
            .or_default()
            .subscribers
            .insert(subscriber_id, tx);
        drop(inner);
        tracing::debug!(app_id, channel_id, subscriber_id, "subscribed");
        let subscription =
            Subscription::new(rx, Arc::clone(&self), app_id.to_owned(), channel_id, subscriber_id);
        Ok((history, subscription))
    }

    pub(crate) fn unsubscribe(&self, app_id: &str, channel_id: u32, subscriber_id: u64) {
        let mut inner = self.lock();
        if let Some(app) = inner.apps.get_mut(app_id) {
            if let Some(channel) = app.channels.get_mut(&channel_id) {
                channel.subscribers.remove(&subscriber_id);
            }
        }
        tracing::debug!(app_id, channel_id, subscriber_id, "unsubscribed");
    }

    /// Release `side`'s claim; deletes the channel outright when it was the
    /// last one.
    pub fn deallocate(
        &self,
        app_id: &str,
        channel_id: u32,
        side: &str,
    ) -> Result<DeallocateStatus, RelayError> {
        let mut inner = self.lock();
        let remaining = inner.store.remove_allocation(app_id, channel_id, side)?;
        if remaining > 0 {
            return Ok(DeallocateStatus::Waiting);
        }
        inner.free_channel(app_id, channel_id)?;
        Ok(DeallocateStatus::Deleted)
    }

    /// One expiration sweep, with `now` injected for testability: frees every
    /// allocated channel whose newest message is older than the expiration
    /// window or which has no messages at all, then forgets apps without
    /// live channels.
    pub fn prune_at(&self, now: f64) -> Result<(), RelayError> {
        let cutoff = now - self.config.channel_expiration.as_secs_f64();
        let mut inner = self.lock();
        // snapshot ids before mutating the maps under them
        let app_ids = inner.store.app_ids()?;
        for app_id in app_ids {
            for channel_id in inner.store.allocated_channels(&app_id)? {
                let expired = match inner.store.newest_message(&app_id, channel_id)? {
                    Some(newest) => newest < cutoff,
                    None => true,
                };
                if expired {
                    tracing::info!(%app_id, channel_id, "expiring channel");
                    inner.free_channel(&app_id, channel_id)?;
                }
            }
        }
        inner.apps.retain(|_, app| !app.channels.is_empty());
        Ok(())
    }

    /// Run the expiration sweep forever on its configured period.
    pub fn spawn_pruner(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let period = self.config.expiration_check_period;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await; // the first tick fires immediately
            loop {
                ticker.tick().await;
                if let Err(err) = self.prune_at(unix_now()) {
                    tracing::error!("expiration sweep failed: {err}");
                }
            }
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Inner {
    /// Delete the channel's rows and live state. Dropping the subscriber
    /// senders ends their event streams.
    fn free_channel(&mut self, app_id: &str, channel_id: u32) -> Result<(), RelayError> {
        self.store.delete_channel(app_id, channel_id)?;
        if let Some(app) = self.apps.get_mut(app_id) {
            app.channels.remove(&channel_id);
        }
        tracing::info!(app_id, channel_id, "freed channel");
        Ok(())
    }

    fn broadcast(&mut self, app_id: &str, channel_id: u32, message: &Message) {
        let Some(channel) = self
            .apps
            .get_mut(app_id)
            .and_then(|app| app.channels.get_mut(&channel_id))
        else {
            return;
        };
        // a subscriber whose receiver is gone is silently dropped here
        channel
            .subscribers
            .retain(|_, tx| tx.send(message.clone()).is_ok());
    }
}

fn unix_now() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs_f64())
        .unwrap_or_default()
}
