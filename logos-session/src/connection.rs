//! Connection state machine and reconnection loop.
//!
//! ```text
//! NOT_CONNECTED ──connect──► CONNECTING ──ok──► CONNECTED
//!       ▲                        │ err               │ link lost
//!       │                        ▼                   ▼
//!  DISCONNECTING ◄──disconnect── ERROR ◄──── retry every backoff
//! ```
//!
//! On an unexpected link loss the expected-sequence snapshot is taken before
//! the first retry and handed back through [`SessionHandoff::on_reconnect`]
//! once the link is back, whether the retry loop or a manual `connect` gets
//! there first. An identity conflict is terminal: no retry.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::SessionConfig;
use crate::listeners::{ListenerId, Listeners};
use crate::protocol::UserId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    NotConnected,
    Connecting,
    Connected,
    Disconnecting,
    /// First attempt failed, or retrying after a link loss
    Error,
}

/// Failure reported by the link.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LinkError {
    #[error("Another instance is logged in with the same identity")]
    Conflict,
    #[error("{0}")]
    Io(String),
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ConnectionError {
    #[error("Connection failed: {0}")]
    Link(LinkError),
    #[error("Identity conflict; reconnect manually")]
    Conflict,
    #[error("Connection attempt was cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    StateChanged {
        state: ConnectionState,
        error: Option<String>,
    },
    /// The link is back; `expected` is the snapshot taken when it was lost
    Reconnected { expected: HashMap<UserId, u64> },
    /// Terminal identity conflict
    Conflict,
}

pub type ConnectFuture<'a> = Pin<Box<dyn Future<Output = Result<(), LinkError>> + Send + 'a>>;

/// Establishes and tears down the underlying link.
pub trait Connector: Send + Sync {
    fn connect(&self) -> ConnectFuture<'_>;
    fn disconnect(&self);
}

/// Session side of a reconnect.
pub trait SessionHandoff: Send + Sync {
    fn snapshot_expected(&self) -> HashMap<UserId, u64>;
    fn on_reconnect(&self, expected: &HashMap<UserId, u64>);
}

#[derive(Default)]
struct Reconnect {
    /// Token of the running reconnect loop
    task: Option<CancellationToken>,
    /// Expectations saved at the last link loss, not yet handed back
    snapshot: Option<HashMap<UserId, u64>>,
    /// The last loop was cancelled by a manual connect, which owns the link
    superseded: bool,
}

pub struct ConnectionLifecycle {
    connector: Arc<dyn Connector>,
    handoff: Arc<dyn SessionHandoff>,
    state: Mutex<ConnectionState>,
    reconnect: Mutex<Reconnect>,
    listeners: Listeners<ConnectionEvent>,
    backoff: Duration,
    shutdown: CancellationToken,
}

impl ConnectionLifecycle {
    pub fn new(connector: Arc<dyn Connector>, handoff: Arc<dyn SessionHandoff>, config: &SessionConfig) -> Arc<Self> {
        Arc::new(Self {
            connector,
            handoff,
            state: Mutex::new(ConnectionState::NotConnected),
            reconnect: Mutex::new(Reconnect::default()),
            listeners: Listeners::new(),
            backoff: config.reconnect_backoff,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn subscribe(&self, listener: impl Fn(&ConnectionEvent) + Send + Sync + 'static) -> ListenerId {
        self.listeners.add(listener)
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }

    pub fn state(&self) -> ConnectionState {
        *self.lock_state()
    }

    pub fn is_reconnecting(&self) -> bool {
        self.lock_reconnect().task.is_some()
    }

    fn lock_state(&self) -> MutexGuard<'_, ConnectionState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_reconnect(&self) -> MutexGuard<'_, Reconnect> {
        self.reconnect.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: ConnectionState, error: Option<String>) {
        let previous = std::mem::replace(&mut *self.lock_state(), state);
        match &error {
            Some(e) => log::warn!("Connection {previous:?} -> {state:?}: {e}"),
            None => log::debug!("Connection {previous:?} -> {state:?}"),
        }
        self.listeners.notify(&ConnectionEvent::StateChanged { state, error });
    }

    /// Connect, disconnecting first if already connected.
    ///
    /// Supersedes a running reconnect loop. Expectations saved at the last
    /// link loss are still handed back once this connect succeeds.
    pub async fn connect(&self, cancel: &CancellationToken) -> Result<(), ConnectionError> {
        if self.state() == ConnectionState::Connected {
            self.disconnect();
        }
        self.stop_reconnect_loop(true);
        self.set_state(ConnectionState::Connecting, None);

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = self.connector.connect() => Some(result),
        };

        match result {
            None => {
                self.connector.disconnect();
                self.set_state(ConnectionState::NotConnected, None);
                Err(ConnectionError::Cancelled)
            }
            Some(Ok(())) => {
                let pending = self.lock_reconnect().snapshot.take();
                match pending {
                    Some(snapshot) => {
                        log::info!("Connected; resuming from expectations saved at link loss");
                        self.resume(snapshot);
                    }
                    None => {
                        log::info!("Connected");
                        self.set_state(ConnectionState::Connected, None);
                    }
                }
                Ok(())
            }
            Some(Err(LinkError::Conflict)) => {
                self.conflict();
                Err(ConnectionError::Conflict)
            }
            Some(Err(e)) => {
                self.set_state(ConnectionState::Error, Some(e.to_string()));
                Err(ConnectionError::Link(e))
            }
        }
    }

    /// Explicit disconnect. Also stops a running reconnect loop.
    pub fn disconnect(&self) {
        self.stop_reconnect_loop(false);
        if self.state() == ConnectionState::NotConnected {
            return;
        }
        self.set_state(ConnectionState::Disconnecting, None);
        self.connector.disconnect();
        self.set_state(ConnectionState::NotConnected, None);
    }

    /// Report an unexpected link failure.
    ///
    /// While connected this captures the sequence snapshot, tears the link
    /// down and spawns the retry loop. A conflict disconnects without
    /// retrying.
    pub fn link_lost(self: &Arc<Self>, error: LinkError) {
        if error == LinkError::Conflict {
            self.conflict();
            return;
        }
        if self.state() != ConnectionState::Connected {
            log::debug!("Ignoring link error while {:?}: {error}", self.state());
            return;
        }

        let snapshot = self.handoff.snapshot_expected();
        log::warn!("Link lost ({error}); saved expectations for {} peer(s)", snapshot.len());
        self.set_state(ConnectionState::Error, Some(error.to_string()));
        self.connector.disconnect();

        let token = self.shutdown.child_token();
        {
            let mut reconnect = self.lock_reconnect();
            if let Some(previous) = reconnect.task.replace(token.clone()) {
                previous.cancel();
            }
            reconnect.snapshot = Some(snapshot);
            reconnect.superseded = false;
        }
        let lifecycle = self.clone();
        tokio::spawn(async move { lifecycle.reconnect_loop(token).await });
    }

    async fn reconnect_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut attempt: u32 = 0;
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.backoff) => {}
            }
            attempt += 1;
            log::debug!("Reconnect attempt {attempt}");

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                result = self.connector.connect() => result,
            };
            match result {
                Ok(()) => match self.finish_reconnect(&cancel) {
                    Ok(snapshot) => {
                        log::info!("Reconnected after {attempt} attempt(s)");
                        self.resume(snapshot.unwrap_or_default());
                        return;
                    }
                    Err(superseded) => {
                        if !superseded {
                            self.connector.disconnect();
                        }
                        break;
                    }
                },
                Err(LinkError::Conflict) => {
                    self.conflict();
                    return;
                }
                Err(e) => log::warn!("Reconnect attempt {attempt} failed: {e}"),
            }
        }
        log::info!("Reconnect loop cancelled after {attempt} attempt(s)");
    }

    /// Clear the loop slot and take the saved expectations. Fails with
    /// whether a manual connect took over if the loop was cancelled in the
    /// meantime.
    fn finish_reconnect(&self, token: &CancellationToken) -> Result<Option<HashMap<UserId, u64>>, bool> {
        let mut reconnect = self.lock_reconnect();
        if token.is_cancelled() {
            return Err(reconnect.superseded);
        }
        reconnect.task = None;
        Ok(reconnect.snapshot.take())
    }

    fn stop_reconnect_loop(&self, superseded: bool) {
        let mut reconnect = self.lock_reconnect();
        if let Some(token) = reconnect.task.take() {
            token.cancel();
        }
        reconnect.superseded = superseded;
    }

    fn resume(&self, snapshot: HashMap<UserId, u64>) {
        self.handoff.on_reconnect(&snapshot);
        self.set_state(ConnectionState::Connected, None);
        self.listeners.notify(&ConnectionEvent::Reconnected { expected: snapshot });
    }

    fn conflict(&self) {
        log::error!("Identity conflict; disconnecting without retry");
        self.stop_reconnect_loop(false);
        self.set_state(ConnectionState::Disconnecting, Some(LinkError::Conflict.to_string()));
        self.connector.disconnect();
        self.set_state(ConnectionState::NotConnected, None);
        self.listeners.notify(&ConnectionEvent::Conflict);
    }

    /// Cancel any reconnect loop, now and for good.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        let mut reconnect = self.lock_reconnect();
        reconnect.task = None;
        reconnect.snapshot = None;
    }
}
