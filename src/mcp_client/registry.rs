//! Client registry: the single owner of connection membership.
//!
//! A name is claimed with a `Reserved` placeholder before any I/O starts, so
//! a second `add` fails with `DuplicateName` for the whole time the first is
//! connecting, and again while the entry is closing. Lookups only ever see
//! `Live` entries whose connection is `Connected`.
//!
//! The map lock is never held across an await. Every operation looks up,
//! clones the `Arc<Connection>`, releases, and only then talks to the worker.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use super::config::HostSettings;
use super::connection::Connection;
use super::errors::HostError;
use super::transport::TransportConnector;
use super::types::ConnectionConfig;

enum Entry {
    /// Name claimed by an `add` still connecting or negotiating.
    Reserved,
    Live(Arc<Connection>),
}

type EntryMap = RwLock<HashMap<String, Entry>>;

/// Removes a registry entry when dropped, unless disarmed.
///
/// Covers every exit path of `add` and `remove`, including the caller
/// dropping the future mid-handshake.
struct SlotGuard<'a> {
    entries: &'a EntryMap,
    name: &'a str,
    armed: bool,
}

impl<'a> SlotGuard<'a> {
    fn new(entries: &'a EntryMap, name: &'a str) -> Self {
        Self {
            entries,
            name,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.entries
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(self.name);
        }
    }
}

// ─── ClientRegistry ──────────────────────────────────────────────────────────

/// Named, mutually exclusive set of worker connections.
pub struct ClientRegistry {
    entries: EntryMap,
    settings: HostSettings,
}

impl ClientRegistry {
    pub fn new(settings: HostSettings) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            settings,
        }
    }

    pub fn settings(&self) -> &HostSettings {
        &self.settings
    }

    /// Open, negotiate and register a connection.
    ///
    /// Nothing is left behind on failure: the reservation is released and
    /// the half-open transport is closed.
    pub async fn add(
        &self,
        config: ConnectionConfig,
        connector: &dyn TransportConnector,
    ) -> Result<Arc<Connection>, HostError> {
        if config.name.trim().is_empty() {
            return Err(HostError::Config {
                reason: "connection name must not be empty".into(),
            });
        }
        let name = config.name.clone();

        {
            let mut entries = self.write();
            if entries.contains_key(&name) {
                return Err(HostError::DuplicateName { name });
            }
            entries.insert(name.clone(), Entry::Reserved);
        }
        let guard = SlotGuard::new(&self.entries, &name);

        tracing::info!(connection = %name, command = %config.command, "connecting");
        let transport = connector.connect(&config).await?;
        let conn = Connection::new(config, transport, self.settings.request_timeout);

        if let Err(e) = conn
            .negotiate(
                &self.settings.client_info,
                &self.settings.capabilities,
                self.settings.init_timeout,
            )
            .await
        {
            tracing::warn!(connection = %name, error = %e, "negotiation failed");
            conn.abandon().await;
            return Err(e);
        }

        let conn = Arc::new(conn);
        self.write()
            .insert(name.clone(), Entry::Live(Arc::clone(&conn)));
        guard.disarm();

        tracing::info!(connection = %name, "connected");
        Ok(conn)
    }

    /// The named connection, if it is currently `Connected`.
    pub fn get(&self, name: &str) -> Option<Arc<Connection>> {
        match self.read().get(name) {
            Some(Entry::Live(conn)) if conn.is_connected() => Some(Arc::clone(conn)),
            _ => None,
        }
    }

    /// Like [`ClientRegistry::get`], but absent maps to `NotFound`.
    pub fn require(&self, name: &str) -> Result<Arc<Connection>, HostError> {
        self.get(name).ok_or_else(|| HostError::not_found(name))
    }

    /// Names of all `Connected` entries, sorted.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .read()
            .iter()
            .filter_map(|(name, entry)| match entry {
                Entry::Live(conn) if conn.is_connected() => Some(name.clone()),
                _ => None,
            })
            .collect();
        names.sort();
        names
    }

    /// Snapshot of every `Connected` entry, sorted by name.
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        let mut conns: Vec<Arc<Connection>> = self
            .read()
            .values()
            .filter_map(|entry| match entry {
                Entry::Live(conn) if conn.is_connected() => Some(Arc::clone(conn)),
                _ => None,
            })
            .collect();
        conns.sort_by(|a, b| a.name().cmp(b.name()));
        conns
    }

    /// Close and unregister a connection.
    ///
    /// Fails with `NotFound` if the name is absent or another caller is
    /// already closing it. The entry is deleted whether or not the close
    /// itself succeeds; a close failure is still returned to the caller.
    pub async fn remove(&self, name: &str) -> Result<(), HostError> {
        let conn = self.require(name)?;
        if !conn.begin_closing() {
            return Err(HostError::not_found(name));
        }
        let _guard = SlotGuard::new(&self.entries, name);

        tracing::info!(connection = name, "closing");
        let result = conn.close(self.settings.close_timeout()).await;
        match &result {
            Ok(()) => tracing::info!(connection = name, "closed"),
            Err(e) => tracing::warn!(connection = name, error = %e, "closed with error"),
        }
        result
    }

    /// Number of entries in any state, reservations included.
    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Entry>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Entry>> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for ClientRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientRegistry")
            .field("connected", &self.list())
            .finish_non_exhaustive()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
