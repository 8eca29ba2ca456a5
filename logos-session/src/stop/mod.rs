//! Stop-the-world coordination for a subset of participants.
//!
//! `StopManager::stop` freezes users and hands back one [`StartHandle`] per
//! user. Freezes on the same user are counted, never overwritten: the user
//! runs again only after every handle issued for it has been started.
//!
//! ```text
//! stop([B], "repair") ──► issue handle h1 ──StopRequest(h1)──► B: gate.block()
//!        ◄────────────────────────────────────── StopAck(h1)
//! h1.start() ──────────────────────────StartRequest(h1)──────► B: gate.unblock()
//! h1.await_ack() ◄──────────────────────────────── StartAck(h1)
//! ```
//!
//! Both roles live here: the initiator side (handles, pending stop acks)
//! and the target side (freezes applied to the local user).

mod handle;

pub use handle::StartHandle;

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::listeners::{ListenerId, Listeners};
use crate::protocol::{SessionMessage, UserId};
use crate::transport::{Transport, TransportError};

#[derive(Debug, Clone, thiserror::Error)]
pub enum StopError {
    #[error("start() called twice on handle {id} for {user}")]
    AlreadyStarted { user: UserId, id: Uuid },
    #[error("Waiting was cancelled")]
    Cancelled,
    #[error("Timed out waiting for stop acknowledgements")]
    Timeout,
    #[error("{0} left the session before acknowledging the stop")]
    UserLeft(UserId),
    #[error("{0} left the session while frozen; handle force-acknowledged")]
    Abandoned(UserId),
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Observable stop/resume events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopEvent {
    /// A remote or local user acknowledged a freeze we requested
    Frozen { user: UserId, handle_id: Uuid, reason: String },
    /// A handle was started; `last` means the user is runnable again
    Resumed { user: UserId, handle_id: Uuid, last: bool },
    /// The user left before acknowledging a resume
    Abandoned { user: UserId, handle_id: Uuid },
    /// The local user was frozen by `initiator`
    LocalFrozen { initiator: UserId, reason: String },
    /// The last freeze on the local user was released
    LocalResumed,
}

/// Blocks and unblocks local editing.
///
/// Called once when the first freeze lands on the local user and once when
/// the last one is released, never while the manager holds its lock.
pub trait ActivityGate: Send + Sync {
    fn block(&self);
    fn unblock(&self);
}

/// Gate that only records whether editing is currently blocked.
#[derive(Debug, Default)]
pub struct FlagGate {
    blocked: AtomicBool,
}

impl FlagGate {
    pub fn is_blocked(&self) -> bool {
        self.blocked.load(Ordering::SeqCst)
    }
}

impl ActivityGate for FlagGate {
    fn block(&self) {
        self.blocked.store(true, Ordering::SeqCst);
    }

    fn unblock(&self) {
        self.blocked.store(false, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AckState {
    Pending,
    Acknowledged,
    Abandoned,
}

/// State shared between a handle and the manager that issued it.
pub(crate) struct HandleShared {
    pub(crate) id: Uuid,
    pub(crate) user: UserId,
    pub(crate) started: AtomicBool,
    pub(crate) ack: watch::Sender<AckState>,
}

impl HandleShared {
    fn new(user: UserId) -> Arc<Self> {
        let (ack, _) = watch::channel(AckState::Pending);
        Arc::new(Self {
            id: Uuid::new_v4(),
            user,
            started: AtomicBool::new(false),
            ack,
        })
    }

    /// Returns false if the handle was already settled.
    fn settle(&self, state: AckState) -> bool {
        self.ack.send_if_modified(|current| {
            if *current == AckState::Pending {
                *current = state;
                true
            } else {
                false
            }
        })
    }
}

enum StopReply {
    Acked,
    Left,
}

#[derive(Default)]
struct StopState {
    /// Issued handles not yet started, per target
    unstarted: HashMap<UserId, HashSet<Uuid>>,
    /// Issued handles awaiting a start acknowledgement
    issued: HashMap<Uuid, Arc<HandleShared>>,
    /// Stop requests waiting for the target's acknowledgement
    pending_stops: HashMap<Uuid, oneshot::Sender<StopReply>>,
    /// Freezes currently applied to the local user: request id → initiator
    local_freezes: HashMap<Uuid, UserId>,
}

/// Issues and tracks start handles; applies freezes requested by peers.
pub struct StopManager {
    transport: Arc<dyn Transport>,
    gate: Arc<dyn ActivityGate>,
    state: Mutex<StopState>,
    listeners: Listeners<StopEvent>,
    poll_quantum: Duration,
    stop_timeout: Duration,
}

impl StopManager {
    pub fn new(transport: Arc<dyn Transport>, gate: Arc<dyn ActivityGate>, config: &SessionConfig) -> Arc<Self> {
        Arc::new(Self {
            transport,
            gate,
            state: Mutex::new(StopState::default()),
            listeners: Listeners::new(),
            poll_quantum: config.poll_quantum,
            stop_timeout: config.stop_timeout,
        })
    }

    fn lock(&self) -> MutexGuard<'_, StopState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn local_id(&self) -> UserId {
        self.transport.local_id()
    }

    pub(crate) fn poll_quantum(&self) -> Duration {
        self.poll_quantum
    }

    pub fn subscribe(&self, listener: impl Fn(&StopEvent) + Send + Sync + 'static) -> ListenerId {
        self.listeners.add(listener)
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }

    /// Freeze `users` and wait until each one acknowledged.
    ///
    /// Returns one handle per distinct user. Waits at most `timeout`
    /// (default: the configured stop timeout). On cancellation, timeout or a
    /// target leaving, every handle issued by this call is started again and
    /// the error is returned.
    pub async fn stop(
        self: &Arc<Self>,
        users: &[UserId],
        reason: &str,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<Vec<StartHandle>, StopError> {
        let targets: BTreeSet<UserId> = users.iter().copied().collect();
        let local = self.local_id();
        let mut handles = Vec::with_capacity(targets.len());
        let mut waits = Vec::new();

        for user in targets {
            let shared = HandleShared::new(user);
            let handle = StartHandle::new(shared.clone(), self.clone());
            let reply = {
                let mut state = self.lock();
                state.unstarted.entry(user).or_default().insert(shared.id);
                state.issued.insert(shared.id, shared.clone());
                if user == local {
                    None
                } else {
                    let (tx, rx) = oneshot::channel();
                    state.pending_stops.insert(shared.id, tx);
                    Some(rx)
                }
            };
            handles.push(handle);

            match reply {
                None => self.freeze_local(shared.id, local, reason),
                Some(rx) => {
                    let request = SessionMessage::StopRequest {
                        handle_id: shared.id,
                        reason: reason.to_string(),
                    };
                    if let Err(e) = self.transport.send(user, request) {
                        log::warn!("Could not send stop request to {user}: {e}");
                        self.abort_stop(&handles);
                        return Err(e.into());
                    }
                    waits.push((user, rx));
                }
            }
        }

        let deadline = tokio::time::Instant::now() + timeout.unwrap_or(self.stop_timeout);
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(StopError::Cancelled),
            result = Self::collect_acks(waits) => result,
            _ = tokio::time::sleep_until(deadline) => Err(StopError::Timeout),
        };

        match outcome {
            Ok(()) => {
                for handle in &handles {
                    log::info!("{} is stopped ({reason})", handle.user());
                    self.listeners.notify(&StopEvent::Frozen {
                        user: handle.user(),
                        handle_id: handle.id(),
                        reason: reason.to_string(),
                    });
                }
                Ok(handles)
            }
            Err(e) => {
                log::warn!("Stop '{reason}' failed: {e}; releasing {} handle(s)", handles.len());
                self.abort_stop(&handles);
                Err(e)
            }
        }
    }

    async fn collect_acks(waits: Vec<(UserId, oneshot::Receiver<StopReply>)>) -> Result<(), StopError> {
        for (user, rx) in waits {
            match rx.await {
                Ok(StopReply::Acked) => {}
                Ok(StopReply::Left) | Err(_) => return Err(StopError::UserLeft(user)),
            }
        }
        Ok(())
    }

    /// Undo a partially completed `stop`.
    fn abort_stop(&self, handles: &[StartHandle]) {
        {
            let mut state = self.lock();
            for handle in handles {
                state.pending_stops.remove(&handle.id());
            }
        }
        for handle in handles {
            if let Err(e) = handle.start() {
                log::error!("Releasing {handle} after failed stop: {e}");
            }
        }
    }

    /// Called by [`StartHandle::start`]. Returns whether this was the
    /// user's last unstarted handle.
    pub(crate) fn resume_start_handle(&self, shared: &Arc<HandleShared>) -> bool {
        let user = shared.user;
        let last = {
            let mut state = self.lock();
            match state.unstarted.get_mut(&user) {
                Some(ids) => {
                    ids.remove(&shared.id);
                    if ids.is_empty() {
                        state.unstarted.remove(&user);
                        true
                    } else {
                        false
                    }
                }
                // The user left; nothing is holding it anymore.
                None => true,
            }
        };

        if user == self.local_id() {
            self.release_local(shared.id);
            self.acknowledge(shared.id);
        } else if let Err(e) = self.transport.send(user, SessionMessage::StartRequest { handle_id: shared.id }) {
            log::warn!("Could not send start request to {user}: {e}; will resend after reconnect");
        }

        log::debug!("Started handle {} for {user} (last: {last})", shared.id);
        self.listeners.notify(&StopEvent::Resumed {
            user,
            handle_id: shared.id,
            last,
        });
        last
    }

    /// Resend start requests that were issued but never acknowledged.
    ///
    /// Returns how many were resent.
    pub fn resend_pending_starts(&self) -> usize {
        let local = self.local_id();
        let pending: Vec<(UserId, Uuid)> = self
            .lock()
            .issued
            .values()
            .filter(|h| h.user != local && h.started.load(Ordering::SeqCst))
            .map(|h| (h.user, h.id))
            .collect();

        let mut resent = 0;
        for (user, handle_id) in pending {
            match self.transport.send(user, SessionMessage::StartRequest { handle_id }) {
                Ok(()) => resent += 1,
                Err(e) => log::warn!("Resending start request to {user} failed: {e}"),
            }
        }
        resent
    }

    fn acknowledge(&self, handle_id: Uuid) {
        let shared = self.lock().issued.remove(&handle_id);
        match shared {
            Some(shared) => {
                if !shared.settle(AckState::Acknowledged) {
                    log::warn!("Handle {handle_id} acknowledged more than once");
                }
            }
            None => log::debug!("Ignoring acknowledgement for unknown or settled handle {handle_id}"),
        }
    }

    // ── target side ────────────────────────────────────────────────

    fn freeze_local(&self, request_id: Uuid, initiator: UserId, reason: &str) {
        let first = {
            let mut state = self.lock();
            let was_empty = state.local_freezes.is_empty();
            state.local_freezes.insert(request_id, initiator);
            was_empty
        };
        if first {
            self.gate.block();
            log::info!("Local user frozen by {initiator} ({reason})");
            self.listeners.notify(&StopEvent::LocalFrozen {
                initiator,
                reason: reason.to_string(),
            });
        }
    }

    fn release_local(&self, request_id: Uuid) {
        let now_empty = {
            let mut state = self.lock();
            state.local_freezes.remove(&request_id).is_some() && state.local_freezes.is_empty()
        };
        if now_empty {
            self.gate.unblock();
            log::info!("Local user resumed");
            self.listeners.notify(&StopEvent::LocalResumed);
        }
    }

    /// Process stop/start traffic. Returns false for unrelated messages.
    ///
    /// Runs on the inbound dispatch task and never waits.
    pub fn handle_message(&self, from: UserId, message: &SessionMessage) -> bool {
        match message {
            SessionMessage::StopRequest { handle_id, reason } => {
                self.freeze_local(*handle_id, from, reason);
                if let Err(e) = self.transport.send(from, SessionMessage::StopAck { handle_id: *handle_id }) {
                    log::warn!("Could not acknowledge stop from {from}: {e}");
                }
            }
            SessionMessage::StartRequest { handle_id } => {
                self.release_local(*handle_id);
                // Duplicate or unknown start requests are acknowledged too.
                if let Err(e) = self.transport.send(from, SessionMessage::StartAck { handle_id: *handle_id }) {
                    log::warn!("Could not acknowledge start from {from}: {e}");
                }
            }
            SessionMessage::StopAck { handle_id } => {
                let reply = {
                    let mut state = self.lock();
                    let owner = state.issued.get(handle_id).map(|h| h.user);
                    if owner == Some(from) {
                        state.pending_stops.remove(handle_id)
                    } else {
                        None
                    }
                };
                match reply {
                    Some(tx) => {
                        let _ = tx.send(StopReply::Acked);
                    }
                    None => log::debug!("Ignoring stop ack {handle_id} from {from}"),
                }
            }
            SessionMessage::StartAck { handle_id } => self.acknowledge(*handle_id),
            _ => return false,
        }
        true
    }

    /// A participant left: abandon its handles and drop freezes it requested.
    pub fn user_left(&self, user: UserId) {
        let (abandoned, replies, release) = {
            let mut state = self.lock();
            state.unstarted.remove(&user);
            let ids: Vec<Uuid> = state
                .issued
                .values()
                .filter(|h| h.user == user)
                .map(|h| h.id)
                .collect();
            let abandoned: Vec<Arc<HandleShared>> =
                ids.iter().filter_map(|id| state.issued.remove(id)).collect();
            let replies: Vec<oneshot::Sender<StopReply>> =
                ids.iter().filter_map(|id| state.pending_stops.remove(id)).collect();
            let release: Vec<Uuid> = state
                .local_freezes
                .iter()
                .filter(|(_, initiator)| **initiator == user)
                .map(|(id, _)| *id)
                .collect();
            (abandoned, replies, release)
        };

        for tx in replies {
            let _ = tx.send(StopReply::Left);
        }
        for shared in abandoned {
            if shared.settle(AckState::Abandoned) {
                log::warn!("{user} left while frozen; abandoning handle {}", shared.id);
                self.listeners.notify(&StopEvent::Abandoned {
                    user,
                    handle_id: shared.id,
                });
            }
        }
        for request_id in release {
            log::info!("Dropping freeze {request_id} requested by departed {user}");
            self.release_local(request_id);
        }
    }

    /// Whether the local user is currently frozen.
    pub fn is_frozen(&self) -> bool {
        !self.lock().local_freezes.is_empty()
    }

    /// Handles issued for `user` that have not been started yet.
    pub fn outstanding(&self, user: &UserId) -> usize {
        self.lock().unstarted.get(user).map_or(0, HashSet::len)
    }

    /// Whether any unstarted handle holds `user`.
    pub fn is_stopped(&self, user: &UserId) -> bool {
        self.outstanding(user) > 0
    }
}
