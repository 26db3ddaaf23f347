//! Identity-addressed transport between the coordinator and named workers
//!
//! Every worker owns an unbounded inbox, so a signal sent while the worker is busy is
//! buffered and observed on its next receive.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::mpsc;

use super::protocol::{Envelope, Signal, WorkerId, WorkerMessage};
use crate::error::{Error, Result};

type Peers = Arc<Mutex<HashMap<WorkerId, mpsc::UnboundedSender<Signal>>>>;

/// Coordinator endpoint before it is split into its sending and receiving halves
pub struct Router {
    peers: Peers,
    outbound: mpsc::UnboundedSender<Envelope>,
    inbound: mpsc::UnboundedReceiver<Envelope>,
}

impl Router {
    pub fn new() -> Self {
        let (outbound, inbound) = mpsc::unbounded_channel();
        Self {
            peers: Arc::new(Mutex::new(HashMap::new())),
            outbound,
            inbound,
        }
    }

    /// Factory for worker endpoints attached to this router
    pub fn connector(&self) -> Connector {
        Connector {
            peers: self.peers.clone(),
            outbound: self.outbound.clone(),
        }
    }

    /// Split into a cloneable sender and the single receiver
    pub fn split(self) -> (RouterHandle, RouterInbox) {
        (
            RouterHandle { peers: self.peers },
            RouterInbox {
                inbound: self.inbound,
                pending: VecDeque::new(),
            },
        )
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

/// Attaches workers to a router
#[derive(Clone)]
pub struct Connector {
    peers: Peers,
    outbound: mpsc::UnboundedSender<Envelope>,
}

impl Connector {
    /// Install an inbox for `identity` and announce it with a registration message
    pub fn connect(&self, identity: WorkerId) -> Result<WorkerEndpoint> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.peers.lock().insert(identity.clone(), tx);

        let outbox = Outbox {
            from: identity,
            outbound: self.outbound.clone(),
        };
        outbox.send(WorkerMessage::Registration)?;

        Ok(WorkerEndpoint { outbox, inbox: rx })
    }
}

/// Sending half of the coordinator endpoint
#[derive(Clone)]
pub struct RouterHandle {
    peers: Peers,
}

impl RouterHandle {
    /// Send a signal to every connected worker. Returns how many accepted it.
    pub fn broadcast(&self, signal: Signal) -> usize {
        let peers = self.peers.lock();
        let mut delivered = 0;
        for (identity, tx) in peers.iter() {
            if tx.send(signal).is_ok() {
                delivered += 1;
            } else {
                tracing::warn!("Worker {} is gone, dropping {:?}", identity, signal);
            }
        }
        delivered
    }

    /// Send a signal to one worker
    pub fn send(&self, identity: &WorkerId, signal: Signal) -> Result<()> {
        let peers = self.peers.lock();
        let tx = peers
            .get(identity)
            .ok_or_else(|| Error::channel(format!("Unknown worker {}", identity)))?;
        tx.send(signal)
            .map_err(|_| Error::channel(format!("Worker {} is gone", identity)))
    }
}

/// Receiving half of the coordinator endpoint
pub struct RouterInbox {
    inbound: mpsc::UnboundedReceiver<Envelope>,
    pending: VecDeque<Envelope>,
}

impl RouterInbox {
    /// Wait until `expected` distinct workers have registered.
    ///
    /// Anything else that arrives meanwhile is kept and handed out by [`Self::recv`].
    pub async fn collect_registrations(&mut self, expected: usize) -> Result<Vec<WorkerId>> {
        let mut registered = HashSet::new();
        let mut order = Vec::new();

        while registered.len() < expected {
            let envelope = self.inbound.recv().await.ok_or_else(|| {
                Error::channel(format!(
                    "Channel closed after {} of {} registrations",
                    registered.len(),
                    expected
                ))
            })?;

            match envelope.message {
                WorkerMessage::Registration => {
                    if registered.insert(envelope.from.clone()) {
                        tracing::info!("Worker {} registered", envelope.from);
                        order.push(envelope.from);
                    }
                }
                _ => self.pending.push_back(envelope),
            }
        }

        Ok(order)
    }

    /// Next worker message in arrival order. `None` once every sender is gone.
    pub async fn recv(&mut self) -> Option<Envelope> {
        if let Some(envelope) = self.pending.pop_front() {
            return Some(envelope);
        }
        self.inbound.recv().await
    }
}

/// Cloneable sender half of a worker endpoint
#[derive(Clone)]
pub struct Outbox {
    from: WorkerId,
    outbound: mpsc::UnboundedSender<Envelope>,
}

impl Outbox {
    pub fn send(&self, message: WorkerMessage) -> Result<()> {
        self.outbound
            .send(Envelope {
                from: self.from.clone(),
                message,
            })
            .map_err(|_| Error::channel("Coordinator is gone"))
    }

    pub fn identity(&self) -> &WorkerId {
        &self.from
    }
}

/// A worker's connection to the coordinator
pub struct WorkerEndpoint {
    outbox: Outbox,
    inbox: mpsc::UnboundedReceiver<Signal>,
}

impl WorkerEndpoint {
    pub fn identity(&self) -> &WorkerId {
        self.outbox.identity()
    }

    pub fn outbox(&self) -> Outbox {
        self.outbox.clone()
    }

    pub fn send(&self, message: WorkerMessage) -> Result<()> {
        self.outbox.send(message)
    }

    /// Block until the coordinator signals. `None` when the router is gone.
    pub async fn recv(&mut self) -> Option<Signal> {
        self.inbox.recv().await
    }
}
