//! Authority side: periodic checksum broadcast and content service.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::document::{ContentHasher, Document};
use crate::protocol::{ChecksumRecord, SessionMessage, UnitId, UserId};
use crate::transport::Transport;

pub struct WatchdogServer {
    transport: Arc<dyn Transport>,
    document: Arc<dyn Document>,
    hasher: Arc<dyn ContentHasher>,
    clients: RwLock<BTreeSet<UserId>>,
    /// Inconsistency reports received per unit
    reports: Mutex<HashMap<UnitId, u64>>,
    interval: Duration,
}

impl WatchdogServer {
    pub fn new(
        transport: Arc<dyn Transport>,
        document: Arc<dyn Document>,
        hasher: Arc<dyn ContentHasher>,
        interval: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            transport,
            document,
            hasher,
            clients: RwLock::new(BTreeSet::new()),
            reports: Mutex::new(HashMap::new()),
            interval,
        })
    }

    pub fn add_client(&self, client: UserId) {
        self.clients.write().unwrap_or_else(|e| e.into_inner()).insert(client);
    }

    pub fn remove_client(&self, client: &UserId) {
        self.clients.write().unwrap_or_else(|e| e.into_inner()).remove(client);
    }

    /// Checksum of every unit at its current revision.
    pub fn checksums(&self) -> Vec<ChecksumRecord> {
        self.document
            .units()
            .into_iter()
            .filter_map(|unit| {
                let content = self.document.content(&unit)?;
                Some(ChecksumRecord {
                    hash: self.hasher.hash(&content),
                    revision: self.document.revision(&unit),
                    unit,
                })
            })
            .collect()
    }

    /// Send the current checksums to every client. Returns how many sends
    /// succeeded.
    pub fn broadcast_checksums(&self) -> usize {
        let records = self.checksums();
        if records.is_empty() {
            return 0;
        }
        let clients: Vec<UserId> = self
            .clients
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .copied()
            .collect();

        let mut delivered = 0;
        for client in clients {
            let msg = SessionMessage::Checksums {
                records: records.clone(),
            };
            match self.transport.send(client, msg) {
                Ok(()) => delivered += 1,
                Err(e) => log::debug!("Checksum broadcast to {client} failed: {e}"),
            }
        }
        log::trace!("Broadcast {} checksum(s) to {delivered} client(s)", records.len());
        delivered
    }

    /// Broadcast on a fixed period until `cancel` fires.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        // First broadcast one full period after start.
        let start = tokio::time::Instant::now() + self.interval;
        let mut ticker = tokio::time::interval_at(start, self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.broadcast_checksums();
                }
            }
        }
        log::debug!("Checksum broadcast loop stopped");
    }

    /// Serve content requests and record inconsistency reports.
    pub fn handle_message(&self, from: UserId, message: &SessionMessage) -> bool {
        match message {
            SessionMessage::ContentRequest { request_id, unit } => {
                let reply = match self.document.snapshot(unit) {
                    Some(content) => SessionMessage::ContentResponse {
                        request_id: *request_id,
                        unit: unit.clone(),
                        content,
                        revision: self.document.revision(unit),
                    },
                    None => SessionMessage::ContentUnavailable {
                        request_id: *request_id,
                        unit: unit.clone(),
                    },
                };
                log::info!("Sending authoritative {unit} to {from}");
                if let Err(e) = self.transport.send(from, reply) {
                    log::warn!("Could not send content for {unit} to {from}: {e}");
                }
            }
            SessionMessage::InconsistencyReport { units } => {
                let mut reports = self.reports.lock().unwrap_or_else(|e| e.into_inner());
                for unit in units {
                    log::warn!("{from} reports {unit} as inconsistent");
                    *reports.entry(unit.clone()).or_default() += 1;
                }
            }
            _ => return false,
        }
        true
    }

    pub fn inconsistency_reports(&self, unit: &UnitId) -> u64 {
        self.reports
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(unit)
            .copied()
            .unwrap_or(0)
    }
}
