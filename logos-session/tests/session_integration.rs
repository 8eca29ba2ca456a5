//! End-to-end session tests over the loopback network.
//!
//! Each peer runs a full `Session` with its own inbox loop, so freezes,
//! acknowledgements and repairs travel through the wire codec exactly as
//! they would between processes.

use logos_session::connection::{ConnectionState, LinkError};
use logos_session::document::{Document, MemoryDocument, Sha256Hasher};
use logos_session::protocol::{Envelope, SessionMessage, UnitId, User, UserId, UserRole};
use logos_session::session::{Collaborators, Session};
use logos_session::stop::{FlagGate, StopError, StopEvent};
use logos_session::transport::LoopbackNetwork;
use logos_session::watchdog::{ConsistencyEvent, ConsistencyState};
use logos_session::SessionConfig;
use std::sync::{Arc, Mutex};
use tokio::time::{timeout, Duration};
use tokio_util::sync::CancellationToken;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

struct Peer {
    user: User,
    session: Arc<Session>,
    document: Arc<MemoryDocument>,
    gate: Arc<FlagGate>,
}

fn fast_config() -> SessionConfig {
    SessionConfig {
        poll_quantum: Duration::from_millis(10),
        reconnect_backoff: Duration::from_millis(20),
        stop_timeout: Duration::from_secs(2),
        content_fetch_timeout: Duration::from_secs(2),
        ..SessionConfig::default()
    }
}

/// Join the network and start the peer's inbox loop.
fn spawn_peer(network: &Arc<LoopbackNetwork>, user: User, authority: UserId, cancel: &CancellationToken) -> Peer {
    let (transport, inbox) = network.join(user.id);
    let transport = Arc::new(transport);
    let document = Arc::new(MemoryDocument::new());
    let gate = Arc::new(FlagGate::default());
    let session = Session::new(
        user.clone(),
        authority,
        Collaborators {
            transport: transport.clone(),
            connector: transport,
            document: document.clone(),
            sink: document.clone(),
            gate: gate.clone(),
            hasher: Arc::new(Sha256Hasher),
        },
        fast_config(),
    );
    tokio::spawn(session.clone().run(inbox, cancel.clone()));
    Peer {
        user,
        session,
        document,
        gate,
    }
}

/// Host (authority) plus one guest, each knowing the other.
fn host_and_guest(network: &Arc<LoopbackNetwork>, cancel: &CancellationToken) -> (Peer, Peer) {
    let host_user = User::new("host", UserRole::Driver);
    let guest_user = User::new("guest", UserRole::Driver);
    let host = spawn_peer(network, host_user.clone(), host_user.id, cancel);
    let guest = spawn_peer(network, guest_user.clone(), host_user.id, cancel);
    host.session.participant_joined(guest_user);
    guest.session.participant_joined(host_user);
    (host, guest)
}

async fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
    timeout(Duration::from_secs(3), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
}

#[tokio::test]
async fn test_overlapping_stops_on_same_user() {
    init_logging();
    let network = LoopbackNetwork::new();
    let cancel = CancellationToken::new();
    let (host, guest) = host_and_guest(&network, &cancel);
    let stop_manager = host.session.stop_manager().clone();
    let target = [guest.user.id];

    let (first, second) = tokio::join!(
        stop_manager.stop(&target, "save all", None, &cancel),
        stop_manager.stop(&target, "rename file", None, &cancel),
    );
    let (first, second) = (first.unwrap(), second.unwrap());
    assert_ne!(first[0], second[0]);
    assert!(guest.gate.is_blocked());

    assert!(!first[0].start().unwrap());
    assert!(first[0].await_ack(Some(Duration::from_secs(2)), &cancel).await.unwrap());
    assert!(guest.gate.is_blocked(), "second freeze still holds the guest");
    assert!(guest.session.stop_manager().is_frozen());

    assert!(second[0].start().unwrap());
    assert!(second[0].await_ack(Some(Duration::from_secs(2)), &cancel).await.unwrap());
    assert!(!guest.gate.is_blocked());
    assert!(matches!(second[0].start(), Err(StopError::AlreadyStarted { .. })));
    cancel.cancel();
}

#[tokio::test]
async fn test_frozen_guest_cannot_send() {
    init_logging();
    let network = LoopbackNetwork::new();
    let cancel = CancellationToken::new();
    let (host, guest) = host_and_guest(&network, &cancel);
    let unit = UnitId::new("main.rs");

    guest
        .session
        .send_activity(host.user.id, Some(unit.clone()), b"fn".to_vec())
        .unwrap();
    let handles = host
        .session
        .stop_participants(&[guest.user.id], "structural change", &cancel)
        .await
        .unwrap();
    assert!(guest
        .session
        .send_activity(host.user.id, Some(unit.clone()), b" main".to_vec())
        .is_err());

    handles[0].start_and_await(Some(Duration::from_secs(2)), &cancel).await.unwrap();
    guest
        .session
        .send_activity(host.user.id, Some(unit.clone()), b"()".to_vec())
        .unwrap();

    eventually("both activities applied", || {
        host.document.content(&unit).as_deref() == Some(b"fn()".as_slice())
    })
    .await;
    cancel.cancel();
}

#[tokio::test]
async fn test_recovery_uses_one_symmetric_handle() {
    init_logging();
    let network = LoopbackNetwork::new();
    let cancel = CancellationToken::new();
    let (host, guest) = host_and_guest(&network, &cancel);
    let unit = UnitId::new("README.md");

    host.document.set(unit.clone(), "authoritative text");
    guest.document.set(unit.clone(), "authoritative text");
    guest.document.corrupt(&unit, "diverged text");

    let client = guest.session.watchdog_client().unwrap().clone();
    let consistency = Arc::new(Mutex::new(Vec::new()));
    let sink = consistency.clone();
    client.subscribe(move |e| sink.lock().unwrap().push(e.clone()));
    let stops = Arc::new(Mutex::new(Vec::new()));
    let sink = stops.clone();
    guest.session.stop_manager().subscribe(move |e| sink.lock().unwrap().push(e.clone()));

    let server = host.session.watchdog_server().unwrap().clone();
    assert_eq!(server.broadcast_checksums(), 1);

    eventually("guest repaired", || {
        guest.document.content(&unit).as_deref() == Some(b"authoritative text".as_slice())
            && client.state(&unit) == ConsistencyState::Consistent
    })
    .await;
    assert!(!guest.gate.is_blocked());

    let consistency = consistency.lock().unwrap().clone();
    assert_eq!(
        consistency,
        vec![
            ConsistencyEvent::InconsistencyDetected { unit: unit.clone() },
            ConsistencyEvent::RecoveryStarted { unit: unit.clone() },
            ConsistencyEvent::Resolved { unit: unit.clone() },
        ]
    );

    let stops = stops.lock().unwrap().clone();
    let frozen = stops.iter().find_map(|e| match e {
        StopEvent::Frozen { handle_id, .. } => Some(*handle_id),
        _ => None,
    });
    let resumed = stops.iter().find_map(|e| match e {
        StopEvent::Resumed { handle_id, last, .. } => Some((*handle_id, *last)),
        _ => None,
    });
    assert!(frozen.is_some());
    assert_eq!(resumed, frozen.map(|id| (id, true)));

    eventually("authority saw the report", || server.inconsistency_reports(&unit) == 1).await;
    cancel.cancel();
}

#[tokio::test]
async fn test_recovery_failure_still_unfreezes() {
    init_logging();
    let network = LoopbackNetwork::new();
    let cancel = CancellationToken::new();
    let (_host, guest) = host_and_guest(&network, &cancel);
    let unit = UnitId::new("deleted.txt");
    guest.document.set(unit.clone(), "only here");

    let client = guest.session.watchdog_client().unwrap().clone();
    let result = client.recover(&unit, &cancel).await;
    assert!(result.is_err());
    assert_eq!(client.state(&unit), ConsistencyState::Inconsistent);
    assert!(!guest.gate.is_blocked());
    assert!(!guest.session.stop_manager().is_frozen());
    cancel.cancel();
}

#[tokio::test]
async fn test_departing_user_abandons_handle() {
    init_logging();
    let network = LoopbackNetwork::new();
    let cancel = CancellationToken::new();
    let (host, guest) = host_and_guest(&network, &cancel);

    let handles = host
        .session
        .stop_participants(&[guest.user.id], "review", &cancel)
        .await
        .unwrap();
    network.cut(&guest.user.id);
    assert!(handles[0].start().unwrap());

    let waiter = {
        let handle = handles[0].clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { handle.await_ack(None, &cancel).await })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;
    host.session.participant_left(&guest.user.id);

    let result = timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
    assert!(matches!(result, Err(StopError::Abandoned(user)) if user == guest.user.id));
    cancel.cancel();
}

#[tokio::test]
async fn test_reconnect_resumes_from_snapshot() {
    init_logging();
    let network = LoopbackNetwork::new();
    let cancel = CancellationToken::new();
    let host_user = User::new("host", UserRole::Driver);
    let guest_user = User::new("guest", UserRole::Driver);
    let host = spawn_peer(&network, host_user.clone(), host_user.id, &cancel);

    // The guest's inbox is fed by hand to control arrival order.
    let (transport, _inbox) = network.join(guest_user.id);
    let transport = Arc::new(transport);
    let document = Arc::new(MemoryDocument::new());
    let guest = Session::new(
        guest_user.clone(),
        host_user.id,
        Collaborators {
            transport: transport.clone(),
            connector: transport,
            document: document.clone(),
            sink: document.clone(),
            gate: Arc::new(FlagGate::default()),
            hasher: Arc::new(Sha256Hasher),
        },
        fast_config(),
    );
    guest.participant_joined(host_user.clone());
    host.session.participant_joined(guest_user.clone());

    let unit = UnitId::new("log.txt");
    let activity = |sequence: u64| Envelope {
        from: host_user.id,
        message: SessionMessage::Activity {
            sequence,
            unit: Some(unit.clone()),
            payload: sequence.to_string().into_bytes(),
        },
    };

    guest.connect(&cancel).await.unwrap();
    for n in 1..=4 {
        guest.dispatch(activity(n));
    }
    assert_eq!(guest.tracker().snapshot_expected().get(&host_user.id), Some(&5));

    network.cut(&guest_user.id);
    guest.connection().link_lost(LinkError::Io("connection reset".into()));
    assert_eq!(guest.connection().state(), ConnectionState::Error);

    eventually("reconnected", || guest.connection().state() == ConnectionState::Connected).await;
    assert!(network.is_link_up(&guest_user.id));

    // Pre-outage numbers are duplicates, the rest flows on.
    guest.dispatch(activity(3));
    guest.dispatch(activity(4));
    guest.dispatch(activity(6));
    guest.dispatch(activity(5));
    assert_eq!(document.content(&unit).unwrap(), b"123456");
    assert_eq!(guest.tracker().expected(&host_user.id), Some(7));
    cancel.cancel();
}

#[tokio::test]
async fn test_manual_reconnect_resends_lost_start() {
    init_logging();
    let network = LoopbackNetwork::new();
    let cancel = CancellationToken::new();
    let (host, guest) = host_and_guest(&network, &cancel);
    host.session.connect(&cancel).await.unwrap();

    let handles = host
        .session
        .stop_participants(&[guest.user.id], "refactor", &cancel)
        .await
        .unwrap();
    assert!(guest.gate.is_blocked());

    // The start request goes out while the host's link is down.
    network.cut(&host.user.id);
    assert!(handles[0].start().unwrap());
    host.session
        .connection()
        .link_lost(LinkError::Io("connection reset".into()));
    assert_eq!(host.session.connection().state(), ConnectionState::Error);

    host.session.connect(&cancel).await.unwrap();
    assert_eq!(host.session.connection().state(), ConnectionState::Connected);
    assert!(handles[0].await_ack(Some(Duration::from_secs(2)), &cancel).await.unwrap());
    assert!(!guest.gate.is_blocked());
    cancel.cancel();
}
