//! Executes a parsed script against a running [`DispatchService`].

use std::collections::HashMap;
use std::time::Duration;

use dispatch_core::clock::Clock;
use dispatch_core::error::DispatchError;
use dispatch_core::service::DispatchService;
use dispatch_core::types::{Coordinate, DriverId, PassengerId, RideId};
use serde::Serialize;
use serde_json::json;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::script::{Command, Step};

#[derive(Debug, thiserror::Error)]
enum StepError {
    #[error("unknown ride alias {0:?}")]
    UnknownAlias(String),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

/// What happened over a whole script.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct ReplaySummary {
    pub steps: usize,
    pub failed: usize,
}

pub struct Replay<'a> {
    service: &'a DispatchService,
    aliases: HashMap<String, RideId>,
    printers: JoinSet<()>,
}

impl<'a> Replay<'a> {
    pub fn new(service: &'a DispatchService) -> Self {
        Self {
            service,
            aliases: HashMap::new(),
            printers: JoinSet::new(),
        }
    }

    pub fn ride_id(&self, alias: &str) -> Option<&RideId> {
        self.aliases.get(alias)
    }

    /// Run every step in order. Failed commands are logged and counted, never fatal.
    pub async fn run(&mut self, steps: &[Step]) -> ReplaySummary {
        let mut summary = ReplaySummary::default();
        for step in steps {
            summary.steps += 1;
            if let Err(error) = self.execute(&step.command).await {
                summary.failed += 1;
                warn!(line = step.line, %error, "command failed");
            }
        }
        summary
    }

    /// Stop listening. Subscribers still waiting on the hub are aborted.
    pub async fn finish(mut self) {
        self.printers.abort_all();
        while self.printers.join_next().await.is_some() {}
    }

    fn resolve(&self, alias: &str) -> Result<RideId, StepError> {
        self.aliases
            .get(alias)
            .cloned()
            .ok_or_else(|| StepError::UnknownAlias(alias.to_string()))
    }

    fn here(&self, lat: f64, lon: f64) -> Coordinate {
        Coordinate::new(lat, lon, self.service.store().clock().now())
    }

    async fn execute(&mut self, command: &Command) -> Result<(), StepError> {
        match command {
            Command::Heartbeat {
                driver,
                lat,
                lon,
                accuracy,
            } => {
                let mut location = self.here(*lat, *lon);
                if let Some(accuracy) = accuracy {
                    location = location.with_accuracy(*accuracy);
                }
                self.service.heartbeat(&DriverId::new(driver.as_str()), location)?;
            }
            Command::Request {
                passenger,
                lat,
                lon,
                alias,
                key,
            } => {
                let ride = self.service.request_ride(
                    &PassengerId::new(passenger.as_str()),
                    self.here(*lat, *lon),
                    key,
                )?;
                info!(alias = %alias, ride = %ride.id, driver = ?ride.driver_id, "requested");
                emit(&json!({ "alias": alias, "ride": ride }));
                self.aliases.insert(alias.clone(), ride.id);
            }
            Command::Accept { ride, driver } => {
                let id = self.resolve(ride)?;
                self.service.accept_ride(&id, &DriverId::new(driver.as_str()))?;
            }
            Command::Start { ride } => {
                let id = self.resolve(ride)?;
                self.service.mark_en_route(&id)?;
            }
            Command::Cancel { ride } => {
                let id = self.resolve(ride)?;
                self.service.cancel_ride(&id)?;
            }
            Command::Complete { ride } => {
                let id = self.resolve(ride)?;
                self.service.complete_ride(&id)?;
            }
            Command::Subscribe { ride } => {
                let id = self.resolve(ride)?;
                let mut subscription = self.service.subscribe(&id)?;
                let alias = ride.clone();
                self.printers.spawn(async move {
                    while let Some(update) = subscription.recv().await {
                        emit(&json!({ "alias": alias, "update": update }));
                    }
                });
            }
            Command::Show { ride } => {
                let id = self.resolve(ride)?;
                let snapshot = self
                    .service
                    .ride(&id)
                    .ok_or(DispatchError::RideNotFound(id))?;
                emit(&json!({ "alias": ride, "ride": snapshot }));
            }
            Command::Wait { secs } => {
                tokio::time::sleep(Duration::from_secs_f64(secs.max(0.0))).await;
            }
            Command::Prune => {
                let counts = self.service.prune_cycle();
                emit(&json!({ "drivers": counts }));
            }
            Command::Telemetry => {
                emit(&json!({ "telemetry": self.service.telemetry() }));
            }
        }
        Ok(())
    }
}

/// One JSON document per stdout line.
fn emit(value: &serde_json::Value) {
    println!("{value}");
}
