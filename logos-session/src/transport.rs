//! Transport seam plus an in-process loopback network.
//!
//! The core only needs a non-blocking `send`; inbound traffic arrives as
//! [`Envelope`]s on whatever channel the transport feeds into
//! `Session::run`. The loopback network routes messages between peers of
//! one process, round-tripping every message through the wire codec, and
//! can cut individual links to simulate outages.
//!
//! ```text
//! LoopbackTransport(A) ──send──┐
//!                              ├── LoopbackNetwork ── inbox(B): mpsc
//! LoopbackTransport(C) ──send──┘         │
//!                                   cut / restore
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;

use crate::connection::{ConnectFuture, Connector, LinkError};
use crate::protocol::{Envelope, ProtocolError, SessionMessage, UserId};

/// Outbound side of the link as seen by the core.
pub trait Transport: Send + Sync {
    fn local_id(&self) -> UserId;

    /// Queue `message` for `to`. Never blocks.
    fn send(&self, to: UserId, message: SessionMessage) -> Result<(), TransportError>;
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("Peer not reachable: {0}")]
    Unreachable(UserId),
    #[error("Link down")]
    LinkDown,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Loopback delivery statistics.
#[derive(Debug, Clone, Default)]
pub struct LoopbackStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_peers: usize,
}

struct PeerSlot {
    inbox: mpsc::UnboundedSender<Envelope>,
    link_up: bool,
}

/// In-process hub connecting any number of peers.
pub struct LoopbackNetwork {
    peers: RwLock<HashMap<UserId, PeerSlot>>,
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

impl LoopbackNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            peers: RwLock::new(HashMap::new()),
            messages_sent: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
        })
    }

    /// Register a peer. Returns its transport and inbox.
    pub fn join(self: &Arc<Self>, id: UserId) -> (LoopbackTransport, mpsc::UnboundedReceiver<Envelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.peers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, PeerSlot { inbox: tx, link_up: true });
        log::debug!("Loopback peer {id} joined");
        (
            LoopbackTransport {
                network: self.clone(),
                local: id,
            },
            rx,
        )
    }

    pub fn leave(&self, id: &UserId) -> bool {
        self.peers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id)
            .is_some()
    }

    /// Take a peer's link down; traffic to or from it is dropped.
    pub fn cut(&self, id: &UserId) {
        self.set_link(id, false);
    }

    pub fn restore(&self, id: &UserId) {
        self.set_link(id, true);
    }

    pub fn is_registered(&self, id: &UserId) -> bool {
        self.peers.read().unwrap_or_else(|e| e.into_inner()).contains_key(id)
    }

    pub fn is_link_up(&self, id: &UserId) -> bool {
        self.peers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .is_some_and(|slot| slot.link_up)
    }

    pub fn stats(&self) -> LoopbackStats {
        LoopbackStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
            active_peers: self.peers.read().unwrap_or_else(|e| e.into_inner()).len(),
        }
    }

    fn set_link(&self, id: &UserId, up: bool) {
        if let Some(slot) = self
            .peers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .get_mut(id)
        {
            slot.link_up = up;
            log::debug!("Loopback link for {id} is now {}", if up { "up" } else { "down" });
        }
    }

    fn route(&self, from: UserId, to: UserId, message: &SessionMessage) -> Result<(), TransportError> {
        // Exercise the codec so loopback traffic matches the wire.
        let message = SessionMessage::decode(&message.encode()?)?;

        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
        let sender_up = peers.get(&from).is_some_and(|slot| slot.link_up);
        let result = match peers.get(&to) {
            _ if !sender_up => Err(TransportError::LinkDown),
            Some(slot) if !slot.link_up => Err(TransportError::LinkDown),
            Some(slot) => slot
                .inbox
                .send(Envelope { from, message })
                .map_err(|_| TransportError::Unreachable(to)),
            None => Err(TransportError::Unreachable(to)),
        };

        match result {
            Ok(()) => self.messages_sent.fetch_add(1, Ordering::Relaxed),
            Err(_) => self.messages_dropped.fetch_add(1, Ordering::Relaxed),
        };
        result
    }
}

/// One peer's handle onto a [`LoopbackNetwork`].
#[derive(Clone)]
pub struct LoopbackTransport {
    network: Arc<LoopbackNetwork>,
    local: UserId,
}

impl LoopbackTransport {
    pub fn network(&self) -> &Arc<LoopbackNetwork> {
        &self.network
    }
}

impl Transport for LoopbackTransport {
    fn local_id(&self) -> UserId {
        self.local
    }

    fn send(&self, to: UserId, message: SessionMessage) -> Result<(), TransportError> {
        self.network.route(self.local, to, &message)
    }
}

/// Connecting restores the peer's link; disconnecting cuts it.
impl Connector for LoopbackTransport {
    fn connect(&self) -> ConnectFuture<'_> {
        Box::pin(async move {
            if !self.network.is_registered(&self.local) {
                return Err(LinkError::Io(format!("{} is not on the loopback network", self.local)));
            }
            self.network.restore(&self.local);
            Ok(())
        })
    }

    fn disconnect(&self) {
        self.network.cut(&self.local);
    }
}
