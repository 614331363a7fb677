//! Source Manager (C6): re-hosts partitions when a leader changes and drives
//! `BrokerSource` lifecycle.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::assignment::AssignmentSet;
use crate::buffer::BufferSet;
use crate::config::Config;
use crate::metadata::MetadataHandle;
use crate::purge::PurgeCoordinator;
use crate::scheduler::{run_broker_loop, BrokerEvent};
use crate::subscription::GroupCoordinator;
use crate::transport::Transport;

struct BrokerHandle {
    mailbox_tx: mpsc::UnboundedSender<BrokerEvent>,
    join: JoinHandle<()>,
    empty_since: Option<Instant>,
}

pub struct SourceManager {
    assignment: Arc<AssignmentSet>,
    metadata: MetadataHandle,
    buffer: Arc<BufferSet>,
    transport: Arc<dyn Transport>,
    config: Arc<Config>,
    group: Option<Arc<dyn GroupCoordinator>>,
    purge: Mutex<Option<Arc<PurgeCoordinator>>>,
    brokers: Mutex<HashMap<i32, BrokerHandle>>,
}

impl SourceManager {
    pub fn new(
        assignment: Arc<AssignmentSet>,
        metadata: MetadataHandle,
        buffer: Arc<BufferSet>,
        transport: Arc<dyn Transport>,
        config: Arc<Config>,
        group: Option<Arc<dyn GroupCoordinator>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            assignment,
            metadata,
            buffer,
            transport,
            config,
            group,
            purge: Mutex::new(None),
            brokers: Mutex::new(HashMap::new()),
        })
    }

    /// `PurgeCoordinator` depends on `SourceManager` (to tear down brokers),
    /// so it's wired in after construction to break the cycle.
    pub fn set_purge_coordinator(&self, purge: Arc<PurgeCoordinator>) {
        *self.purge.lock().unwrap() = Some(purge);
    }

    fn purge(&self) -> Arc<PurgeCoordinator> {
        self.purge.lock().unwrap().clone().expect("purge coordinator wired before use")
    }

    fn get_or_create_broker(self: &Arc<Self>, broker_id: i32) -> mpsc::UnboundedSender<BrokerEvent> {
        let mut brokers = self.brokers.lock().unwrap();
        if let Some(existing) = brokers.get_mut(&broker_id) {
            existing.empty_since = None;
            return existing.mailbox_tx.clone();
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let join = tokio::spawn(run_broker_loop(
            broker_id,
            Arc::clone(&self.transport),
            Arc::clone(&self.assignment),
            Arc::clone(&self.buffer),
            Arc::clone(&self.config),
            self.purge(),
            self.group.clone(),
            rx,
        ));
        info!(broker_id, "spawned broker source worker");
        brokers.insert(broker_id, BrokerHandle { mailbox_tx: tx.clone(), join, empty_since: None });
        tx
    }

    pub fn wake_all(&self) {
        for b in self.brokers.lock().unwrap().values() {
            let _ = b.mailbox_tx.send(BrokerEvent::Wake);
        }
    }

    pub fn wake_broker(&self, broker_id: i32) {
        if let Some(b) = self.brokers.lock().unwrap().get(&broker_id) {
            let _ = b.mailbox_tx.send(BrokerEvent::Wake);
        }
    }

    /// Reconciles assignment against the latest metadata snapshot: attaches
    /// new/reassigned partitions, parks partitions with unknown leaders, and
    /// ignores stale (lower) epochs.
    fn reconcile(self: &Arc<Self>) {
        let snapshot = self.metadata.current();
        for p in self.assignment.snapshot() {
            let Some(topic_meta) = snapshot.topics.get(&p.tp.topic) else { continue };
            let Some(part_meta) =
                topic_meta.partitions.iter().find(|pm| pm.partition == p.tp.partition)
            else {
                continue;
            };

            if part_meta.leader_epoch < p.leader_epoch {
                continue; // stale snapshot, ignore
            }

            let changed = self.assignment.update_leader(&p.tp, part_meta.leader_id, part_meta.leader_epoch);
            if !changed && p.source_broker == part_meta.leader_id {
                continue;
            }

            match part_meta.leader_id {
                None => {
                    // Leader unknown: detach, park, retried next metadata pass.
                    if let Some(old) = p.source_broker {
                        self.send_unassign(old, &p.tp);
                    }
                    self.assignment.set_source_broker(&p.tp, None);
                },
                Some(new_broker) => {
                    if p.source_broker != Some(new_broker) {
                        if let Some(old) = p.source_broker {
                            self.send_unassign(old, &p.tp);
                        }
                        self.assignment.set_source_broker(&p.tp, Some(new_broker));
                        let tx = self.get_or_create_broker(new_broker);
                        let _ = tx.send(BrokerEvent::Assign(p.tp.clone()));
                    } else {
                        self.wake_broker(new_broker);
                    }
                },
            }
        }

        self.sweep_empty_brokers();
    }

    fn send_unassign(&self, broker_id: i32, tp: &crate::topic_partition::TopicPartition) {
        if let Some(b) = self.brokers.lock().unwrap().get(&broker_id) {
            let _ = b.mailbox_tx.send(BrokerEvent::Unassign(tp.clone()));
        }
    }

    fn sweep_empty_brokers(&self) {
        let now = Instant::now();
        let owned_counts: HashMap<i32, usize> = {
            let mut counts = HashMap::new();
            for p in self.assignment.snapshot() {
                if let Some(b) = p.source_broker {
                    *counts.entry(b).or_insert(0) += 1;
                }
            }
            counts
        };

        let mut brokers = self.brokers.lock().unwrap();
        let grace = self.config.broker_source_grace_window;
        let mut doomed = Vec::new();
        for (id, handle) in brokers.iter_mut() {
            let owned = owned_counts.get(id).copied().unwrap_or(0);
            if owned == 0 {
                match handle.empty_since {
                    None => handle.empty_since = Some(now),
                    Some(since) if now.duration_since(since) >= grace => doomed.push(*id),
                    Some(_) => {},
                }
            } else {
                handle.empty_since = None;
            }
        }
        for id in doomed {
            if let Some(handle) = brokers.remove(&id) {
                debug!(broker_id = id, "tearing down idle broker source");
                handle.join.abort();
            }
        }
    }

    /// Background task: reconciles on every metadata refresh, on every
    /// Assignment Set change (spec.md: "C2 change events wake C4 via C6"),
    /// and on a sweep tick for broker teardown.
    pub async fn run(
        self: Arc<Self>,
        mut assignment_changes: mpsc::UnboundedReceiver<crate::assignment::AssignmentChange>,
    ) {
        let mut snapshot_rx = self.metadata.snapshot_rx.clone();
        let mut sweep = tokio::time::interval(Duration::from_secs(1));
        loop {
            tokio::select! {
                changed = snapshot_rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    self.reconcile();
                },
                change = assignment_changes.recv() => {
                    match change {
                        Some(change) => self.handle_assignment_change(change),
                        None => return,
                    }
                },
                _ = sweep.tick() => {
                    self.sweep_empty_brokers();
                },
            }
        }
    }

    fn handle_assignment_change(self: &Arc<Self>, change: crate::assignment::AssignmentChange) {
        use crate::assignment::AssignmentChange;
        match change {
            AssignmentChange::Assigned(_) => self.reconcile(),
            AssignmentChange::Unassigned(_) => self.sweep_empty_brokers(),
            AssignmentChange::PauseChanged(tps)
            | AssignmentChange::OffsetsSeeded(tps)
            | AssignmentChange::LeaderChanged(tps) => {
                for tp in tps {
                    if let Some(p) = self.assignment.get(&tp) {
                        if let Some(broker) = p.source_broker {
                            self.wake_broker(broker);
                        }
                    }
                }
            },
        }
    }

    pub fn force_reconcile(self: &Arc<Self>) {
        self.reconcile();
    }

    /// Aborts every broker worker task. Called from `Client::drop` so a
    /// dropped client doesn't leak broker loops running forever in the
    /// background.
    pub fn shutdown(&self) {
        for (_, handle) in self.brokers.lock().unwrap().drain() {
            handle.join.abort();
        }
    }
}
