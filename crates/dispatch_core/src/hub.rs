//! Per-ride live update fan-out.
//!
//! One actor task owns the subscriber table. Subscribing, unsubscribing,
//! publishing and counting are all messages on a single command channel, so
//! the table is never shared and per-ride ordering follows publish order.
//!
//! Each subscriber gets its own bounded buffer. Delivery never waits: a
//! subscriber whose buffer is full, or whose receiver is gone, is dropped
//! from the table and the broadcast carries on to everyone else.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::types::{DriverState, Ride, RideId};

pub const DEFAULT_SUBSCRIBER_BUFFER: usize = 64;

/// Message delivered to ride subscribers.
///
/// Ride snapshots serialize flat with `"type": "ride"`; driver positions as
/// `{"type": "driver_location", "driver": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RideUpdate {
    Ride(Ride),
    DriverLocation { driver: DriverState },
}

type SubscriberId = u64;

enum Command {
    Subscribe {
        ride: RideId,
        id: SubscriberId,
        tx: mpsc::Sender<RideUpdate>,
    },
    Unsubscribe {
        ride: RideId,
        id: SubscriberId,
    },
    Publish {
        ride: RideId,
        revision: Option<u64>,
        update: RideUpdate,
    },
    Count {
        ride: RideId,
        reply: oneshot::Sender<usize>,
    },
}

/// A ride's subscribers and the newest snapshot revision sent to them.
///
/// The channel outlives its last subscriber until a terminal snapshot went
/// through, so a late subscriber is still protected by the revision gate.
#[derive(Default)]
struct RideChannel {
    subscribers: HashMap<SubscriberId, mpsc::Sender<RideUpdate>>,
    last_revision: u64,
    finished: bool,
}

/// Subscriber table, owned by the actor task.
#[derive(Default)]
struct HubState {
    rides: HashMap<RideId, RideChannel>,
}

impl HubState {
    fn handle(&mut self, command: Command) {
        match command {
            Command::Subscribe { ride, id, tx } => {
                debug!(ride = %ride, subscriber = id, "subscribe");
                self.rides
                    .entry(ride)
                    .or_default()
                    .subscribers
                    .insert(id, tx);
            }
            Command::Unsubscribe { ride, id } => self.unsubscribe(&ride, id),
            Command::Publish {
                ride,
                revision,
                update,
            } => self.broadcast(&ride, revision, update),
            Command::Count { ride, reply } => {
                let count = self.rides.get(&ride).map_or(0, |c| c.subscribers.len());
                let _ = reply.send(count);
            }
        }
    }

    fn unsubscribe(&mut self, ride: &RideId, id: SubscriberId) {
        let Some(channel) = self.rides.get_mut(ride) else {
            return;
        };
        if channel.subscribers.remove(&id).is_some() {
            debug!(ride = %ride, subscriber = id, "unsubscribe");
        }
        if channel.subscribers.is_empty() && channel.finished {
            self.rides.remove(ride);
        }
    }

    fn broadcast(&mut self, ride: &RideId, revision: Option<u64>, update: RideUpdate) {
        let Some(channel) = self.rides.get_mut(ride) else {
            return;
        };
        if let Some(revision) = revision {
            if revision < channel.last_revision {
                debug!(ride = %ride, revision, latest = channel.last_revision, "stale snapshot dropped");
                return;
            }
            channel.last_revision = revision;
        }
        if let RideUpdate::Ride(snapshot) = &update {
            channel.finished |= snapshot.status.is_terminal();
        }

        let mut dropped = Vec::new();
        for (id, tx) in &channel.subscribers {
            match tx.try_send(update.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!(ride = %ride, subscriber = id, "subscriber lagging, dropped");
                    dropped.push(*id);
                }
                Err(TrySendError::Closed(_)) => dropped.push(*id),
            }
        }
        for id in dropped {
            self.unsubscribe(ride, id);
        }
    }
}

/// Handle to the hub actor. Cheap to clone.
#[derive(Clone)]
pub struct UpdateHub {
    commands: mpsc::UnboundedSender<Command>,
    next_id: Arc<AtomicU64>,
    buffer: usize,
}

impl UpdateHub {
    /// Start the actor on the current Tokio runtime. It runs until `shutdown`
    /// fires or every handle and subscription is dropped.
    pub fn spawn(buffer: usize, shutdown: CancellationToken) -> (Self, JoinHandle<()>) {
        let (commands, mut rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(async move {
            let mut state = HubState::default();
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    command = rx.recv() => match command {
                        Some(command) => state.handle(command),
                        None => break,
                    },
                }
            }
            info!(rides = state.rides.len(), "update hub stopped");
        });
        let hub = Self {
            commands,
            next_id: Arc::new(AtomicU64::new(1)),
            buffer: buffer.max(1),
        };
        (hub, task)
    }

    /// Register for updates on `ride`. Dropping the subscription unregisters it.
    pub fn subscribe(&self, ride: &RideId) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.buffer);
        let _ = self.commands.send(Command::Subscribe {
            ride: ride.clone(),
            id,
            tx,
        });
        Subscription {
            ride: ride.clone(),
            id,
            rx,
            commands: self.commands.clone(),
        }
    }

    /// Broadcast a ride snapshot to that ride's subscribers.
    pub fn publish_ride_update(&self, ride: &Ride) {
        let _ = self.commands.send(Command::Publish {
            ride: ride.id.clone(),
            revision: Some(ride.revision),
            update: RideUpdate::Ride(ride.clone()),
        });
    }

    /// Broadcast a driver position to the driver's current ride. Drivers
    /// without a ride have no audience and are skipped.
    pub fn publish_driver_update(&self, driver: &DriverState) {
        let Some(ride) = &driver.ride_id else {
            return;
        };
        let _ = self.commands.send(Command::Publish {
            ride: ride.clone(),
            revision: None,
            update: RideUpdate::DriverLocation {
                driver: driver.clone(),
            },
        });
    }

    /// Live subscribers on `ride`; zero once the hub has stopped.
    pub async fn subscriber_count(&self, ride: &RideId) -> usize {
        let (reply, rx) = oneshot::channel();
        let sent = self.commands.send(Command::Count {
            ride: ride.clone(),
            reply,
        });
        if sent.is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    pub fn is_running(&self) -> bool {
        !self.commands.is_closed()
    }
}

impl std::fmt::Debug for UpdateHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdateHub")
            .field("buffer", &self.buffer)
            .field("running", &self.is_running())
            .finish()
    }
}

/// One live connection's view of a ride.
#[derive(Debug)]
pub struct Subscription {
    ride: RideId,
    id: SubscriberId,
    rx: mpsc::Receiver<RideUpdate>,
    commands: mpsc::UnboundedSender<Command>,
}

impl Subscription {
    pub fn ride_id(&self) -> &RideId {
        &self.ride
    }

    /// Next update, or `None` once the hub dropped this subscriber or stopped.
    pub async fn recv(&mut self) -> Option<RideUpdate> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<RideUpdate> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Unsubscribe {
            ride: self.ride.clone(),
            id: self.id,
        });
    }
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Subscribe { ride, id, .. } => write!(f, "Subscribe({ride}, {id})"),
            Self::Unsubscribe { ride, id } => write!(f, "Unsubscribe({ride}, {id})"),
            Self::Publish { ride, revision, .. } => write!(f, "Publish({ride}, {revision:?})"),
            Self::Count { ride, .. } => write!(f, "Count({ride})"),
        }
    }
}
