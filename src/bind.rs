//! Bind registry (C6, server only): one shared listener per `host:port`,
//! fanned out round-robin across whichever clients currently participate
//! in it (§4.6).
//!
//! A bind entry's accept loop runs as its own task and hands each accepted
//! [`TcpStream`] to the chosen participant through an unbounded channel —
//! the participant's own connection task owns turning that socket into a
//! registered [`crate::link::Link`] and an `OPEN` frame, which keeps this
//! module free of any dependency on the control channel or TLS types.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Identifies one client's control channel to the bind registry. The
/// server assigns these; bind.rs only ever treats them as opaque keys.
pub type ClientId = u64;

/// Errors from [`BindRegistry::bind`].
#[derive(Debug, thiserror::Error)]
pub enum BindError {
    /// The listening socket could not be opened on `host:port`.
    #[error("could not bind {key}: {source}")]
    Listen {
        /// The `host:port` that was requested.
        key: String,
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },
}

struct BindEntry {
    participants: Vec<(ClientId, mpsc::UnboundedSender<TcpStream>)>,
    cursor: usize,
    accept_task: JoinHandle<()>,
}

impl Drop for BindEntry {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

/// The shared table of public bind entries, keyed by `"host:port"`.
#[derive(Default)]
pub struct BindRegistry {
    entries: Mutex<HashMap<String, BindEntry>>,
}

impl BindRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `client_id` as a participant of the bind entry for `key`,
    /// opening a fresh listener if none exists yet.
    ///
    /// `new_connection` receives every [`TcpStream`] this registry's
    /// round-robin dispatch routes to `client_id` for this `key`, for as
    /// long as the client remains a participant.
    ///
    /// # Errors
    ///
    /// Returns [`BindError::Listen`] if opening a new listener fails (an
    /// existing entry is always joinable regardless of whether the
    /// original bind attempt could succeed again today).
    pub async fn bind(
        self: &Arc<Self>,
        key: String,
        client_id: ClientId,
        new_connection: mpsc::UnboundedSender<TcpStream>,
    ) -> Result<(), BindError> {
        {
            let mut entries = self.entries.lock();
            if let Some(entry) = entries.get_mut(&key) {
                entry.participants.push((client_id, new_connection));
                info!(%key, client_id, "joined existing bind entry");
                return Ok(());
            }
        }

        let listener = TcpListener::bind(&key)
            .await
            .map_err(|source| BindError::Listen {
                key: key.clone(),
                source,
            })?;

        let registry = Arc::clone(self);
        let accept_key = key.clone();
        let accept_task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((socket, peer)) => {
                        if !registry.dispatch(&accept_key, socket) {
                            warn!(key = %accept_key, %peer, "accepted connection with no participants left");
                        }
                    }
                    Err(e) => {
                        warn!(key = %accept_key, error = %e, "bind listener accept failed");
                    }
                }
            }
        });

        self.entries.lock().insert(
            key.clone(),
            BindEntry {
                participants: vec![(client_id, new_connection)],
                cursor: 0,
                accept_task,
            },
        );
        info!(%key, client_id, "opened new bind entry");
        Ok(())
    }

    /// Routes `socket` to the next participant of `key`'s entry in
    /// round-robin order. Returns `false` if the entry has no
    /// participants (it should not normally be possible to observe this,
    /// since the entry is removed the instant it empties).
    fn dispatch(&self, key: &str, socket: TcpStream) -> bool {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(key) else {
            return false;
        };
        if entry.participants.is_empty() {
            return false;
        }
        entry.cursor %= entry.participants.len();
        let (client_id, sender) = &entry.participants[entry.cursor];
        entry.cursor = (entry.cursor + 1) % entry.participants.len();
        if sender.send(socket).is_err() {
            warn!(key, client_id, "participant's connection channel is closed");
            false
        } else {
            true
        }
    }

    /// Removes `client_id` from `key`'s participant set. If that empties
    /// the set, the listener is aborted and the entry removed (§4.6).
    pub fn leave(&self, key: &str, client_id: ClientId) {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(key) else {
            return;
        };
        entry.participants.retain(|(id, _)| *id != client_id);
        if entry.participants.is_empty() {
            entries.remove(key);
            info!(key, "bind entry emptied, listener closed");
        }
    }

    /// Number of currently open bind entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether the registry currently holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
