use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{AckState, HandleShared, StopError, StopManager};
use crate::protocol::UserId;

/// Single-use token releasing one freeze of one user.
///
/// Clones share state: starting any clone counts as starting the handle.
/// Two handles are equal iff they belong to the same user and carry the
/// same id.
#[derive(Clone)]
pub struct StartHandle {
    shared: Arc<HandleShared>,
    manager: Arc<StopManager>,
}

impl StartHandle {
    pub(super) fn new(shared: Arc<HandleShared>, manager: Arc<StopManager>) -> Self {
        Self { shared, manager }
    }

    /// The stopped user.
    pub fn user(&self) -> UserId {
        self.shared.user
    }

    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    pub fn is_started(&self) -> bool {
        self.shared.started.load(Ordering::SeqCst)
    }

    pub fn is_acknowledged(&self) -> bool {
        *self.shared.ack.borrow() == AckState::Acknowledged
    }

    /// Release this freeze without waiting.
    ///
    /// Returns `true` if this was the user's last unstarted handle, i.e. the
    /// user is runnable again. A second call fails with
    /// [`StopError::AlreadyStarted`].
    pub fn start(&self) -> Result<bool, StopError> {
        log::debug!("Called start on {self}");
        if self
            .shared
            .started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(StopError::AlreadyStarted {
                user: self.shared.user,
                id: self.shared.id,
            });
        }
        Ok(self.manager.resume_start_handle(&self.shared))
    }

    /// [`start`](Self::start) followed by [`await_ack`](Self::await_ack).
    pub async fn start_and_await(
        &self,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<bool, StopError> {
        self.start()?;
        self.await_ack(timeout, cancel).await
    }

    /// Wait until the stopped user confirms it resumed.
    ///
    /// - `Ok(true)`: acknowledged
    /// - `Ok(false)`: `timeout` elapsed first
    /// - `Err(Cancelled)`: `cancel` fired; the handle stays started and a
    ///   later acknowledgement is still recorded
    /// - `Err(Abandoned)`: the user left the session
    pub async fn await_ack(&self, timeout: Option<Duration>, cancel: &CancellationToken) -> Result<bool, StopError> {
        let quantum = self.manager.poll_quantum();
        let mut rx = self.shared.ack.subscribe();

        let wait = async {
            loop {
                match *rx.borrow_and_update() {
                    AckState::Acknowledged => return Ok(true),
                    AckState::Abandoned => return Err(StopError::Abandoned(self.shared.user)),
                    AckState::Pending => {}
                }
                // Re-check at least every quantum even without a signal.
                let _ = tokio::time::timeout(quantum, rx.changed()).await;
            }
        };

        let expired = async {
            match timeout {
                Some(t) => tokio::time::sleep(t).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(StopError::Cancelled),
            result = wait => result,
            _ = expired => Ok(false),
        }
    }
}

impl PartialEq for StartHandle {
    fn eq(&self, other: &Self) -> bool {
        self.shared.id == other.shared.id && self.shared.user == other.shared.user
    }
}

impl Eq for StartHandle {}

impl Hash for StartHandle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.shared.id.hash(state);
        self.shared.user.hash(state);
    }
}

impl fmt::Display for StartHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let startable = if self.is_started() { "not startable" } else { "startable" };
        write!(f, "StartHandle ({}, {}, {startable})", self.shared.user, self.shared.id)
    }
}

impl fmt::Debug for StartHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StartHandle")
            .field("user", &self.shared.user)
            .field("id", &self.shared.id)
            .field("started", &self.is_started())
            .field("ack", &*self.shared.ack.borrow())
            .finish()
    }
}
