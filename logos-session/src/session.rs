//! Session bootstrap: explicit construction and wiring of the core.
//!
//! ```text
//!                 ┌──────────────► StopManager ◄──────────────┐
//! inbox ── run ──►├── Activity ──► SequenceTracker ──► sink    │ freeze/resume
//!                 └── checksums ─► WatchdogClient / Server ───┘
//!
//! ConnectionLifecycle ── snapshot / on_reconnect ──► Delivery (tracker)
//! ```
//!
//! The participant with the authority id runs the [`WatchdogServer`];
//! everyone else runs a [`WatchdogClient`] against it.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::SessionConfig;
use crate::connection::{ConnectionError, ConnectionLifecycle, Connector, SessionHandoff};
use crate::document::{Activity, ActivitySink, ContentHasher, Document, DocumentError};
use crate::listeners::{ListenerId, Listeners};
use crate::protocol::{Envelope, SessionMessage, UnitId, User, UserId};
use crate::sequencer::{SequenceError, SequenceTracker};
use crate::stop::{ActivityGate, StartHandle, StopError, StopManager};
use crate::transport::{Transport, TransportError};
use crate::watchdog::{WatchdogClient, WatchdogError, WatchdogServer};

#[derive(Debug, Clone, thiserror::Error)]
pub enum SessionError {
    #[error("Local user is frozen; activity refused")]
    Frozen,
    #[error("{0} is not a participant")]
    UnknownParticipant(UserId),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Stop(#[from] StopError),
    #[error(transparent)]
    Watchdog(#[from] WatchdogError),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    Sequence(#[from] SequenceError),
    #[error(transparent)]
    Document(#[from] DocumentError),
}

/// Delivery anomalies worth surfacing beyond the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Refused because the peer's reorder buffer was full. The activity is
    /// lost and its unit is handed to the watchdog.
    ActivityDropped {
        peer: UserId,
        sequence: u64,
        unit: Option<UnitId>,
    },
    /// A gap stayed open past the gap timeout and was skipped
    GapSkipped { peer: UserId, from: u64, resumed_at: u64 },
}

/// External collaborators a session is built from.
pub struct Collaborators {
    pub transport: Arc<dyn Transport>,
    pub connector: Arc<dyn Connector>,
    pub document: Arc<dyn Document>,
    pub sink: Arc<dyn ActivitySink>,
    pub gate: Arc<dyn ActivityGate>,
    pub hasher: Arc<dyn ContentHasher>,
}

/// Ordered delivery into the replica, and the reconnect hand-off point.
struct Delivery {
    tracker: SequenceTracker<Activity>,
    sink: Arc<dyn ActivitySink>,
    stop_manager: Arc<StopManager>,
    events: Listeners<SessionEvent>,
}

impl Delivery {
    fn deliver(&self, from: UserId, activities: Vec<Activity>) {
        for activity in activities {
            if let Err(e) = self.sink.apply(from, activity) {
                log::error!("Replica rejected activity from {from}: {e}");
            }
        }
    }

    fn release_stale(&self) {
        for skip in self.tracker.release_stale() {
            self.events.notify(&SessionEvent::GapSkipped {
                peer: skip.peer,
                from: skip.skipped_from,
                resumed_at: skip.resumed_at,
            });
            self.deliver(skip.peer, skip.delivered);
        }
    }
}

impl SessionHandoff for Delivery {
    fn snapshot_expected(&self) -> HashMap<UserId, u64> {
        self.tracker.snapshot_expected()
    }

    fn on_reconnect(&self, expected: &HashMap<UserId, u64>) {
        for (peer, number) in expected {
            let released = self.tracker.reset_after_reconnect(*peer, *number);
            self.deliver(*peer, released);
        }
        let resent = self.stop_manager.resend_pending_starts();
        if resent > 0 {
            log::info!("Resent {resent} start request(s) after reconnect");
        }
    }
}

pub struct Session {
    local: User,
    authority: UserId,
    transport: Arc<dyn Transport>,
    participants: RwLock<HashMap<UserId, User>>,
    delivery: Arc<Delivery>,
    stop_manager: Arc<StopManager>,
    watchdog_client: Option<Arc<WatchdogClient>>,
    watchdog_server: Option<Arc<WatchdogServer>>,
    connection: Arc<ConnectionLifecycle>,
    config: SessionConfig,
    shutdown: CancellationToken,
}

impl Session {
    pub fn new(local: User, authority: UserId, parts: Collaborators, config: SessionConfig) -> Arc<Self> {
        let stop_manager = StopManager::new(parts.transport.clone(), parts.gate, &config);
        let delivery = Arc::new(Delivery {
            tracker: SequenceTracker::new(config.max_out_of_order, config.gap_timeout),
            sink: parts.sink,
            stop_manager: stop_manager.clone(),
            events: Listeners::new(),
        });
        let connection = ConnectionLifecycle::new(parts.connector, delivery.clone(), &config);

        let (watchdog_client, watchdog_server) = if local.id == authority {
            let server = WatchdogServer::new(
                parts.transport.clone(),
                parts.document,
                parts.hasher,
                config.checksum_interval,
            );
            (None, Some(server))
        } else {
            let client = WatchdogClient::new(
                authority,
                parts.transport.clone(),
                parts.document,
                parts.hasher,
                stop_manager.clone(),
                &config,
            );
            (Some(client), None)
        };

        log::info!(
            "Session for {} ({}) created; authority {authority}",
            local.name,
            local.id
        );
        Arc::new(Self {
            participants: RwLock::new(HashMap::from([(local.id, local.clone())])),
            local,
            authority,
            transport: parts.transport,
            delivery,
            stop_manager,
            watchdog_client,
            watchdog_server,
            connection,
            config,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn subscribe(&self, listener: impl Fn(&SessionEvent) + Send + Sync + 'static) -> ListenerId {
        self.delivery.events.add(listener)
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.delivery.events.remove(id)
    }

    pub fn local_user(&self) -> &User {
        &self.local
    }

    pub fn authority(&self) -> UserId {
        self.authority
    }

    pub fn is_authority(&self) -> bool {
        self.local.id == self.authority
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn stop_manager(&self) -> &Arc<StopManager> {
        &self.stop_manager
    }

    pub fn tracker(&self) -> &SequenceTracker<Activity> {
        &self.delivery.tracker
    }

    pub fn watchdog_client(&self) -> Option<&Arc<WatchdogClient>> {
        self.watchdog_client.as_ref()
    }

    pub fn watchdog_server(&self) -> Option<&Arc<WatchdogServer>> {
        self.watchdog_server.as_ref()
    }

    pub fn connection(&self) -> &Arc<ConnectionLifecycle> {
        &self.connection
    }

    /// Every participant, the local user included.
    pub fn participants(&self) -> Vec<User> {
        let mut users: Vec<User> = self
            .participants
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        users.sort_by(|a, b| a.name.cmp(&b.name));
        users
    }

    pub fn is_participant(&self, user: &UserId) -> bool {
        self.participants
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(user)
    }

    fn remote_ids(&self) -> Vec<UserId> {
        self.participants
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .filter(|id| **id != self.local.id)
            .copied()
            .collect()
    }

    pub fn participant_joined(&self, user: User) {
        log::info!("{} ({}) joined as {:?}", user.name, user.id, user.role);
        if let Some(server) = &self.watchdog_server {
            server.add_client(user.id);
        }
        self.participants
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(user.id, user);
    }

    /// Abandon handles held for the user, drop freezes it requested and
    /// forget its sequence state.
    pub fn participant_left(&self, user: &UserId) {
        let removed = self
            .participants
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(user);
        if removed.is_none() {
            log::debug!("Ignoring departure of unknown user {user}");
            return;
        }
        log::info!("{user} left the session");
        self.stop_manager.user_left(*user);
        self.delivery.tracker.remove_peer(user);
        if let Some(server) = &self.watchdog_server {
            server.remove_client(user);
        }
    }

    /// Stamp and send one activity to `to`.
    ///
    /// Refused while the local user is frozen. Returns the sequence number
    /// used.
    pub fn send_activity(&self, to: UserId, unit: Option<UnitId>, payload: Vec<u8>) -> Result<u64, SessionError> {
        if self.stop_manager.is_frozen() {
            return Err(SessionError::Frozen);
        }
        if !self.is_participant(&to) {
            return Err(SessionError::UnknownParticipant(to));
        }
        let sequence = self.delivery.tracker.next_outgoing(to);
        self.transport.send(
            to,
            SessionMessage::Activity {
                sequence,
                unit,
                payload,
            },
        )?;
        Ok(sequence)
    }

    /// Send one activity to every remote participant. Returns how many sends
    /// succeeded.
    pub fn broadcast_activity(&self, unit: Option<UnitId>, payload: &[u8]) -> Result<usize, SessionError> {
        if self.stop_manager.is_frozen() {
            return Err(SessionError::Frozen);
        }
        let mut sent = 0;
        for peer in self.remote_ids() {
            match self.send_activity(peer, unit.clone(), payload.to_vec()) {
                Ok(_) => sent += 1,
                Err(e) => log::warn!("Activity to {peer} not sent: {e}"),
            }
        }
        Ok(sent)
    }

    /// Freeze remote participants, e.g. before a structural change.
    pub async fn stop_participants(
        &self,
        users: &[UserId],
        reason: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<StartHandle>, SessionError> {
        Ok(self.stop_manager.stop(users, reason, None, cancel).await?)
    }

    pub async fn connect(&self, cancel: &CancellationToken) -> Result<(), SessionError> {
        Ok(self.connection.connect(cancel).await?)
    }

    /// Route one inbound envelope.
    pub fn dispatch(&self, envelope: Envelope) {
        let Envelope { from, message } = envelope;
        if !self.is_participant(&from) {
            log::warn!("Dropping {} from non-participant {from}", message.kind());
            return;
        }

        match message {
            SessionMessage::Activity {
                sequence,
                unit,
                payload,
            } => {
                let activity = Activity {
                    unit: unit.clone(),
                    payload,
                };
                match self.delivery.tracker.accept(from, sequence, activity) {
                    Ok(ready) => self.delivery.deliver(from, ready),
                    Err(e) => self.activity_dropped(from, sequence, unit, e),
                }
            }
            control => self.route_control(from, &control),
        }
    }

    fn activity_dropped(&self, from: UserId, sequence: u64, unit: Option<UnitId>, error: SequenceError) {
        log::error!("Activity #{sequence} from {from} lost: {error}");
        if let (Some(client), Some(unit)) = (&self.watchdog_client, &unit) {
            client.suspect(unit);
        }
        self.delivery.events.notify(&SessionEvent::ActivityDropped {
            peer: from,
            sequence,
            unit,
        });
    }

    fn route_control(&self, from: UserId, message: &SessionMessage) {
        if self.stop_manager.handle_message(from, message) {
            return;
        }
        let handled = match (&self.watchdog_client, &self.watchdog_server) {
            (Some(client), _) => client.handle_message(from, message),
            (None, Some(server)) => server.handle_message(from, message),
            (None, None) => false,
        };
        if !handled {
            log::debug!("Unhandled {} from {from}", message.kind());
        }
    }

    /// Inbound loop. Also drives stale-gap release and, on the authority,
    /// the checksum broadcast. Returns when `cancel` fires, the session shuts
    /// down or the inbox closes.
    pub async fn run(self: Arc<Self>, mut inbox: mpsc::UnboundedReceiver<Envelope>, cancel: CancellationToken) {
        let background = self.shutdown.child_token();
        if let Some(server) = &self.watchdog_server {
            tokio::spawn(server.clone().run(background.clone()));
        }

        let period = (self.config.gap_timeout / 2).max(Duration::from_millis(1));
        let mut stale = tokio::time::interval(period);
        stale.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = background.cancelled() => break,
                envelope = inbox.recv() => match envelope {
                    Some(envelope) => self.dispatch(envelope),
                    None => {
                        log::info!("Inbox closed");
                        break;
                    }
                },
                _ = stale.tick() => self.delivery.release_stale(),
            }
        }
        background.cancel();
        log::debug!("Session loop for {} stopped", self.local.id);
    }

    /// Tear down background work: dispatch loop, reconnect loop, recoveries.
    pub fn shutdown(&self) {
        log::info!("Shutting down session for {}", self.local.id);
        self.shutdown.cancel();
        self.connection.shutdown();
        if let Some(client) = &self.watchdog_client {
            client.shutdown();
        }
    }
}
