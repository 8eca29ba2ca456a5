//! Client side: compare authority checksums and drive recovery.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{ConsistencyEvent, ConsistencyState, WatchdogError};
use crate::config::SessionConfig;
use crate::document::{ContentHasher, Document};
use crate::listeners::{ListenerId, Listeners};
use crate::protocol::{ChecksumRecord, SessionMessage, UnitId, UserId};
use crate::stop::StopManager;
use crate::transport::Transport;

#[derive(Debug, Default)]
struct UnitStatus {
    state: ConsistencyState,
    recovering: bool,
    /// A new mismatch arrived while recovering
    restart: bool,
    /// Consecutive cycles skipped for a revision difference
    deferred: u32,
}

enum FetchReply {
    Content { content: Vec<u8>, revision: u64 },
    Unavailable,
}

pub struct WatchdogClient {
    authority: UserId,
    transport: Arc<dyn Transport>,
    document: Arc<dyn Document>,
    hasher: Arc<dyn ContentHasher>,
    stop_manager: Arc<StopManager>,
    units: Mutex<HashMap<UnitId, UnitStatus>>,
    pending_fetches: Mutex<HashMap<Uuid, oneshot::Sender<FetchReply>>>,
    listeners: Listeners<ConsistencyEvent>,
    fetch_timeout: Duration,
    grace_cycles: u32,
    auto_recover: bool,
    shutdown: CancellationToken,
}

impl WatchdogClient {
    pub fn new(
        authority: UserId,
        transport: Arc<dyn Transport>,
        document: Arc<dyn Document>,
        hasher: Arc<dyn ContentHasher>,
        stop_manager: Arc<StopManager>,
        config: &SessionConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            authority,
            transport,
            document,
            hasher,
            stop_manager,
            units: Mutex::new(HashMap::new()),
            pending_fetches: Mutex::new(HashMap::new()),
            listeners: Listeners::new(),
            fetch_timeout: config.content_fetch_timeout,
            grace_cycles: config.checksum_grace_cycles,
            auto_recover: config.auto_recover,
            shutdown: CancellationToken::new(),
        })
    }

    fn units(&self) -> MutexGuard<'_, HashMap<UnitId, UnitStatus>> {
        self.units.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn subscribe(&self, listener: impl Fn(&ConsistencyEvent) + Send + Sync + 'static) -> ListenerId {
        self.listeners.add(listener)
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }

    pub fn state(&self, unit: &UnitId) -> ConsistencyState {
        self.units().get(unit).map_or(ConsistencyState::Consistent, |s| s.state)
    }

    pub fn is_recovering(&self, unit: &UnitId) -> bool {
        self.units().get(unit).is_some_and(|s| s.recovering)
    }

    /// Units not currently known to be consistent.
    pub fn inconsistent_units(&self) -> Vec<UnitId> {
        let mut units: Vec<UnitId> = self
            .units()
            .iter()
            .filter(|(_, s)| s.state != ConsistencyState::Consistent)
            .map(|(unit, _)| unit.clone())
            .collect();
        units.sort();
        units
    }

    /// Compare authority checksums against the local replica.
    ///
    /// Returns the units that need recovery. A unit missing locally is a
    /// mismatch. A record taken at a different revision is skipped while
    /// activities may still be in flight, for at most the configured grace
    /// cycles in a row, and compared after that.
    pub fn check(&self, records: &[ChecksumRecord]) -> Vec<UnitId> {
        let mut suspects = Vec::new();
        let mut events = Vec::new();

        for record in records {
            let local_revision = self.document.revision(&record.unit);
            let content = self.document.content(&record.unit);

            let mut units = self.units();
            let status = units.entry(record.unit.clone()).or_default();
            let matches = match content {
                None => {
                    log::debug!("{} is missing locally", record.unit);
                    false
                }
                Some(_) if local_revision != record.revision && status.deferred < self.grace_cycles => {
                    status.deferred += 1;
                    log::trace!(
                        "Deferring {} (local revision {local_revision}, authority {}, cycle {})",
                        record.unit,
                        record.revision,
                        status.deferred
                    );
                    continue;
                }
                Some(content) => self.hasher.hash(&content) == record.hash,
            };
            status.deferred = 0;

            if matches {
                if status.state != ConsistencyState::Consistent && !status.recovering {
                    status.state = ConsistencyState::Consistent;
                    events.push(ConsistencyEvent::Resolved {
                        unit: record.unit.clone(),
                    });
                }
                continue;
            }

            if status.recovering {
                log::info!("{} still differs during recovery; restarting repair", record.unit);
                status.restart = true;
                continue;
            }
            if status.state == ConsistencyState::Consistent {
                log::warn!("Checksum mismatch for {}", record.unit);
                status.state = ConsistencyState::Suspected;
                events.push(ConsistencyEvent::InconsistencyDetected {
                    unit: record.unit.clone(),
                });
            }
            suspects.push(record.unit.clone());
        }

        for event in &events {
            self.listeners.notify(event);
        }

        if !suspects.is_empty() {
            let report = SessionMessage::InconsistencyReport {
                units: suspects.clone(),
            };
            if let Err(e) = self.transport.send(self.authority, report) {
                log::debug!("Could not report inconsistency to authority: {e}");
            }
        }
        suspects
    }

    /// Handle checksum and content traffic from the authority.
    ///
    /// Recovery is spawned, never awaited here, so the inbound path stays
    /// free to process the acknowledgements recovery waits for.
    pub fn handle_message(self: &Arc<Self>, from: UserId, message: &SessionMessage) -> bool {
        match message {
            SessionMessage::Checksums { records } => {
                if from != self.authority {
                    log::warn!("Ignoring checksums from non-authority {from}");
                    return true;
                }
                for unit in self.check(records) {
                    self.spawn_recovery(unit);
                }
            }
            SessionMessage::ContentResponse {
                request_id,
                content,
                revision,
                ..
            } => self.complete_fetch(
                *request_id,
                FetchReply::Content {
                    content: content.clone(),
                    revision: *revision,
                },
            ),
            SessionMessage::ContentUnavailable { request_id, .. } => {
                self.complete_fetch(*request_id, FetchReply::Unavailable)
            }
            _ => return false,
        }
        true
    }

    /// Flag `unit` as diverged without waiting for the next checksum cycle,
    /// e.g. after one of its activities was lost locally.
    pub fn suspect(self: &Arc<Self>, unit: &UnitId) {
        let detected = {
            let mut units = self.units();
            let status = units.entry(unit.clone()).or_default();
            let detected = status.state == ConsistencyState::Consistent && !status.recovering;
            if detected {
                status.state = ConsistencyState::Suspected;
            }
            detected
        };
        if detected {
            log::warn!("{unit} suspected after a local delivery failure");
            self.listeners
                .notify(&ConsistencyEvent::InconsistencyDetected { unit: unit.clone() });
        }
        self.spawn_recovery(unit.clone());
    }

    fn spawn_recovery(self: &Arc<Self>, unit: UnitId) {
        if !self.auto_recover {
            return;
        }
        let client = self.clone();
        tokio::spawn(async move {
            let cancel = client.shutdown.child_token();
            if let Err(e) = client.recover(&unit, &cancel).await {
                log::warn!("Recovery of {unit} failed: {e}");
            }
        });
    }

    fn complete_fetch(&self, request_id: Uuid, reply: FetchReply) {
        let sender = self
            .pending_fetches
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&request_id);
        match sender {
            Some(tx) => {
                let _ = tx.send(reply);
            }
            None => log::debug!("Dropping late content reply {request_id}"),
        }
    }

    /// Repair `unit`: freeze the local user, fetch and restore the
    /// authoritative snapshot, resume with the same handle.
    ///
    /// A call for a unit already under repair makes the running repair fetch
    /// again instead of starting a second one. The freeze is always released,
    /// also when the repair fails.
    pub async fn recover(&self, unit: &UnitId, cancel: &CancellationToken) -> Result<(), WatchdogError> {
        {
            let mut units = self.units();
            let status = units.entry(unit.clone()).or_default();
            if status.recovering {
                status.restart = true;
                return Ok(());
            }
            status.recovering = true;
            status.restart = false;
            if status.state == ConsistencyState::Consistent {
                status.state = ConsistencyState::Suspected;
            }
        }

        let local = self.stop_manager.local_id();
        let reason = format!("consistency recovery of {unit}");
        let handles = match self.stop_manager.stop(&[local], &reason, None, cancel).await {
            Ok(handles) => handles,
            Err(e) => {
                self.finish(unit, ConsistencyState::Suspected, Some(e.to_string()));
                return Err(e.into());
            }
        };

        self.units().entry(unit.clone()).or_default().state = ConsistencyState::Inconsistent;
        self.listeners.notify(&ConsistencyEvent::RecoveryStarted { unit: unit.clone() });

        let repaired = self.repair(unit, cancel).await;

        for handle in &handles {
            if let Err(e) = handle.start() {
                log::error!("Could not release recovery freeze {handle}: {e}");
            }
        }

        match repaired {
            Ok(()) => {
                log::info!("{unit} repaired from authority");
                self.finish(unit, ConsistencyState::Consistent, None);
                Ok(())
            }
            Err(e) => {
                self.finish(unit, ConsistencyState::Inconsistent, Some(e.to_string()));
                Err(e)
            }
        }
    }

    async fn repair(&self, unit: &UnitId, cancel: &CancellationToken) -> Result<(), WatchdogError> {
        loop {
            let (content, revision) = self.fetch(unit, cancel).await?;
            self.document.restore(unit, &content, revision)?;

            let mut units = self.units();
            let status = units.entry(unit.clone()).or_default();
            if !status.restart {
                return Ok(());
            }
            status.restart = false;
            log::debug!("Re-fetching {unit} after a mismatch during repair");
        }
    }

    async fn fetch(&self, unit: &UnitId, cancel: &CancellationToken) -> Result<(Vec<u8>, u64), WatchdogError> {
        let request_id = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();
        self.pending_fetches
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(request_id, tx);

        let request = SessionMessage::ContentRequest {
            request_id,
            unit: unit.clone(),
        };
        if let Err(e) = self.transport.send(self.authority, request) {
            self.forget_fetch(&request_id);
            return Err(e.into());
        }

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(WatchdogError::Cancelled),
            reply = tokio::time::timeout(self.fetch_timeout, rx) => match reply {
                Ok(Ok(FetchReply::Content { content, revision })) => Ok((content, revision)),
                Ok(Ok(FetchReply::Unavailable)) => Err(WatchdogError::ContentUnavailable(unit.clone())),
                Ok(Err(_)) | Err(_) => Err(WatchdogError::FetchTimeout(unit.clone())),
            },
        };
        if result.is_err() {
            self.forget_fetch(&request_id);
        }
        result
    }

    fn forget_fetch(&self, request_id: &Uuid) {
        self.pending_fetches
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(request_id);
    }

    fn finish(&self, unit: &UnitId, state: ConsistencyState, error: Option<String>) {
        {
            let mut units = self.units();
            let status = units.entry(unit.clone()).or_default();
            status.state = state;
            status.recovering = false;
            status.restart = false;
            status.deferred = 0;
        }
        let event = match error {
            None => ConsistencyEvent::Resolved { unit: unit.clone() },
            Some(error) => ConsistencyEvent::RecoveryFailed {
                unit: unit.clone(),
                error,
            },
        };
        self.listeners.notify(&event);
    }

    /// Cancel every recovery spawned by `handle_message`.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{DocumentError, MemoryDocument, Sha256Hasher};
    use crate::stop::{FlagGate, StopEvent};
    use crate::transport::{LoopbackNetwork, LoopbackTransport};
    use crate::watchdog::WatchdogServer;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fixture {
        network: Arc<LoopbackNetwork>,
        client: Arc<WatchdogClient>,
        client_doc: Arc<MemoryDocument>,
        server: Arc<WatchdogServer>,
        server_doc: Arc<MemoryDocument>,
        gate: Arc<FlagGate>,
        events: Arc<Mutex<Vec<ConsistencyEvent>>>,
    }

    impl Fixture {
        fn server_id(&self) -> UserId {
            self.client.authority
        }
    }

    /// Byte replica whose first restore runs a hook before applying.
    struct HookedDocument {
        inner: Arc<MemoryDocument>,
        restores: AtomicUsize,
        on_first_restore: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    }

    impl Document for HookedDocument {
        fn units(&self) -> Vec<UnitId> {
            self.inner.units()
        }

        fn content(&self, unit: &UnitId) -> Option<Vec<u8>> {
            self.inner.content(unit)
        }

        fn revision(&self, unit: &UnitId) -> u64 {
            self.inner.revision(unit)
        }

        fn restore(&self, unit: &UnitId, snapshot: &[u8], revision: u64) -> Result<(), DocumentError> {
            self.restores.fetch_add(1, Ordering::SeqCst);
            let hook = self.on_first_restore.lock().unwrap().take();
            if let Some(hook) = hook {
                hook();
            }
            self.inner.restore(unit, snapshot, revision)
        }
    }

    fn fixture(config: SessionConfig) -> Fixture {
        fixture_with(config, |doc| doc as Arc<dyn Document>)
    }

    fn fixture_with(config: SessionConfig, wrap: impl FnOnce(Arc<MemoryDocument>) -> Arc<dyn Document>) -> Fixture {
        let network = LoopbackNetwork::new();
        let (host, mut host_inbox) = network.join(UserId::new());
        let (guest, mut guest_inbox) = network.join(UserId::new());
        let host_id = host.local_id();

        let server_doc = Arc::new(MemoryDocument::new());
        let server = WatchdogServer::new(
            Arc::new(host),
            server_doc.clone(),
            Arc::new(Sha256Hasher),
            config.checksum_interval,
        );
        server.add_client(guest.local_id());

        let client_doc = Arc::new(MemoryDocument::new());
        let gate = Arc::new(FlagGate::default());
        let guest: Arc<LoopbackTransport> = Arc::new(guest);
        let stop_manager = StopManager::new(guest.clone(), gate.clone(), &config);
        let client = WatchdogClient::new(
            host_id,
            guest,
            wrap(client_doc.clone()),
            Arc::new(Sha256Hasher),
            stop_manager.clone(),
            &config,
        );

        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        client.subscribe(move |e| sink.lock().unwrap().push(e.clone()));

        let srv = server.clone();
        tokio::spawn(async move {
            while let Some(env) = host_inbox.recv().await {
                srv.handle_message(env.from, &env.message);
            }
        });
        let cli = client.clone();
        tokio::spawn(async move {
            while let Some(env) = guest_inbox.recv().await {
                if !stop_manager.handle_message(env.from, &env.message) {
                    cli.handle_message(env.from, &env.message);
                }
            }
        });

        Fixture {
            network,
            client,
            client_doc,
            server,
            server_doc,
            gate,
            events,
        }
    }

    fn manual() -> SessionConfig {
        SessionConfig {
            auto_recover: false,
            content_fetch_timeout: Duration::from_millis(200),
            ..SessionConfig::default()
        }
    }

    #[tokio::test]
    async fn test_matching_checksums_stay_consistent() {
        let f = fixture(manual());
        let unit = UnitId::new("a.txt");
        f.server_doc.set(unit.clone(), "same");
        f.client_doc.set(unit.clone(), "same");

        assert!(f.client.check(&f.server.checksums()).is_empty());
        assert_eq!(f.client.state(&unit), ConsistencyState::Consistent);
        assert!(f.events.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_revision_mismatch_is_skipped() {
        let f = fixture(manual());
        let unit = UnitId::new("a.txt");
        f.server_doc.set(unit.clone(), "one");
        f.server_doc.set(unit.clone(), "two");
        f.client_doc.set(unit.clone(), "one");

        assert!(f.client.check(&f.server.checksums()).is_empty());
        assert_eq!(f.client.state(&unit), ConsistencyState::Consistent);
    }

    #[tokio::test]
    async fn test_lagging_unit_compared_after_grace() {
        let f = fixture(manual());
        let unit = UnitId::new("a.txt");
        for text in ["x", "xz", "xyz"] {
            f.server_doc.set(unit.clone(), text);
        }
        // One activity never arrived: the guest stays a revision behind.
        for text in ["x", "xz"] {
            f.client_doc.set(unit.clone(), text);
        }

        let records = f.server.checksums();
        assert!(f.client.check(&records).is_empty());
        assert!(f.client.check(&records).is_empty());
        assert_eq!(f.client.check(&records), vec![unit.clone()]);
        assert_eq!(f.client.state(&unit), ConsistencyState::Suspected);
        assert_eq!(
            *f.events.lock().unwrap(),
            vec![ConsistencyEvent::InconsistencyDetected { unit: unit.clone() }]
        );
    }

    #[tokio::test]
    async fn test_catching_up_resets_grace() {
        let f = fixture(manual());
        let unit = UnitId::new("a.txt");
        f.server_doc.set(unit.clone(), "one");
        f.server_doc.set(unit.clone(), "two");
        f.client_doc.set(unit.clone(), "one");

        assert!(f.client.check(&f.server.checksums()).is_empty());
        assert!(f.client.check(&f.server.checksums()).is_empty());
        f.client_doc.set(unit.clone(), "two");
        assert!(f.client.check(&f.server.checksums()).is_empty());

        f.server_doc.set(unit.clone(), "three");
        assert!(f.client.check(&f.server.checksums()).is_empty());
        assert_eq!(f.client.state(&unit), ConsistencyState::Consistent);
    }

    #[tokio::test]
    async fn test_missing_unit_is_a_mismatch() {
        let f = fixture(manual());
        let unit = UnitId::new("b.txt");
        f.server_doc.set(unit.clone(), "only on the authority");

        assert_eq!(f.client.check(&f.server.checksums()), vec![unit.clone()]);
        assert_eq!(f.client.state(&unit), ConsistencyState::Suspected);

        f.client.recover(&unit, &CancellationToken::new()).await.unwrap();
        assert_eq!(f.client_doc.content(&unit).unwrap(), b"only on the authority");
        assert_eq!(f.client.state(&unit), ConsistencyState::Consistent);
        assert_eq!(f.server.inconsistency_reports(&unit), 1);
    }

    #[tokio::test]
    async fn test_suspect_flags_unit_once() {
        let f = fixture(manual());
        let unit = UnitId::new("a.txt");
        f.client.suspect(&unit);
        f.client.suspect(&unit);

        assert_eq!(f.client.state(&unit), ConsistencyState::Suspected);
        assert_eq!(f.client.inconsistent_units(), vec![unit.clone()]);
        assert_eq!(
            *f.events.lock().unwrap(),
            vec![ConsistencyEvent::InconsistencyDetected { unit: unit.clone() }]
        );
    }

    #[tokio::test]
    async fn test_mismatch_then_recover() {
        let f = fixture(manual());
        let unit = UnitId::new("a.txt");
        f.server_doc.set(unit.clone(), "authoritative");
        f.client_doc.set(unit.clone(), "diverged");

        assert_eq!(f.client.check(&f.server.checksums()), vec![unit.clone()]);
        assert_eq!(f.client.state(&unit), ConsistencyState::Suspected);

        f.client.recover(&unit, &CancellationToken::new()).await.unwrap();
        assert_eq!(f.client.state(&unit), ConsistencyState::Consistent);
        assert_eq!(f.client_doc.content(&unit).unwrap(), b"authoritative");
        assert!(!f.gate.is_blocked());

        let events = f.events.lock().unwrap().clone();
        assert_eq!(
            events,
            vec![
                ConsistencyEvent::InconsistencyDetected { unit: unit.clone() },
                ConsistencyEvent::RecoveryStarted { unit: unit.clone() },
                ConsistencyEvent::Resolved { unit: unit.clone() },
            ]
        );
    }

    #[tokio::test]
    async fn test_failed_fetch_releases_freeze() {
        let f = fixture(manual());
        let unit = UnitId::new("gone.txt");
        f.client_doc.set(unit.clone(), "local only");

        let err = f.client.recover(&unit, &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, WatchdogError::ContentUnavailable(_)));
        assert_eq!(f.client.state(&unit), ConsistencyState::Inconsistent);
        assert!(!f.client.is_recovering(&unit));
        assert!(!f.gate.is_blocked());
        assert_eq!(f.client.inconsistent_units(), vec![unit.clone()]);
        assert!(matches!(
            f.events.lock().unwrap().last(),
            Some(ConsistencyEvent::RecoveryFailed { .. })
        ));
    }

    #[tokio::test]
    async fn test_fetch_timeout_when_authority_unreachable() {
        let f = fixture(manual());
        let unit = UnitId::new("a.txt");
        f.client_doc.set(unit.clone(), "x");
        // The authority is unreachable, so the content request cannot go out.
        f.network.cut(&f.server_id());

        let err = f.client.recover(&unit, &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, WatchdogError::Transport(_) | WatchdogError::FetchTimeout(_)));
        assert!(!f.gate.is_blocked());
    }

    #[tokio::test]
    async fn test_auto_recovery_from_broadcast() {
        let f = fixture(SessionConfig::default());
        let unit = UnitId::new("a.txt");
        f.server_doc.set(unit.clone(), "authoritative");
        f.client_doc.set(unit.clone(), "diverged");

        f.server.broadcast_checksums();
        tokio::time::timeout(Duration::from_secs(2), async {
            while f.client.state(&unit) != ConsistencyState::Consistent
                || f.client_doc.content(&unit).unwrap() != b"authoritative"
            {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(f.server.inconsistency_reports(&unit), 1);
    }

    #[tokio::test]
    async fn test_recover_while_recovering_requests_restart() {
        let f = fixture(manual());
        let unit = UnitId::new("a.txt");
        f.client.units().entry(unit.clone()).or_default().recovering = true;

        f.client.recover(&unit, &CancellationToken::new()).await.unwrap();
        assert!(f.client.units().get(&unit).unwrap().restart);
        assert!(!f.gate.is_blocked(), "no second freeze was stacked");
    }

    #[tokio::test]
    async fn test_mismatch_during_repair_fetches_again() {
        let mut hooked = None;
        let f = fixture_with(manual(), |inner| {
            let doc = Arc::new(HookedDocument {
                inner,
                restores: AtomicUsize::new(0),
                on_first_restore: Mutex::new(None),
            });
            hooked = Some(doc.clone());
            doc as Arc<dyn Document>
        });
        let hooked = hooked.unwrap();
        let unit = UnitId::new("a.txt");
        f.server_doc.set(unit.clone(), "authoritative");
        f.client_doc.set(unit.clone(), "diverged");

        let frozen = Arc::new(AtomicUsize::new(0));
        let counter = frozen.clone();
        f.client.stop_manager.subscribe(move |e| {
            if matches!(e, StopEvent::Frozen { .. }) {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        // A checksum cycle lands between the first fetch and its restore.
        let client = f.client.clone();
        let stale = ChecksumRecord {
            unit: unit.clone(),
            hash: vec![0; 32],
            revision: f.client_doc.revision(&unit),
        };
        *hooked.on_first_restore.lock().unwrap() = Some(Box::new(move || {
            assert!(client.check(&[stale]).is_empty());
        }));

        f.client.recover(&unit, &CancellationToken::new()).await.unwrap();
        assert_eq!(hooked.restores.load(Ordering::SeqCst), 2, "content fetched and restored twice");
        assert_eq!(frozen.load(Ordering::SeqCst), 1, "one freeze for the whole repair");
        assert_eq!(f.client.state(&unit), ConsistencyState::Consistent);
        assert_eq!(f.client_doc.content(&unit).unwrap(), b"authoritative");
        assert!(!f.client.is_recovering(&unit));
        assert!(!f.gate.is_blocked());
    }
}
