use std::sync::Arc;

use dispatch_core::clock::ManualClock;
use dispatch_core::config::DispatchConfig;
use dispatch_core::geo::GeoBackend;
use dispatch_core::persistence::MemoryMirror;
use dispatch_core::service::{DispatchService, Ports};
use dispatch_core::test_helpers::manual_clock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Builder configuration for reproducible engines.
#[derive(Clone, Debug)]
pub struct TestEngineConfig {
    pub geo_backend: GeoBackend,
    pub with_mirror: bool,
    pub acceptance_window_secs: u64,
    pub enforce_fresh_heartbeat: bool,
    pub subscriber_buffer: usize,
}

impl Default for TestEngineConfig {
    fn default() -> Self {
        Self {
            geo_backend: GeoBackend::Scan,
            with_mirror: true,
            acceptance_window_secs: 15,
            enforce_fresh_heartbeat: true,
            subscriber_buffer: 16,
        }
    }
}

impl TestEngineConfig {
    pub fn with_geo_backend(mut self, backend: GeoBackend) -> Self {
        self.geo_backend = backend;
        self
    }

    pub fn without_mirror(mut self) -> Self {
        self.with_mirror = false;
        self
    }

    pub fn with_subscriber_buffer(mut self, buffer: usize) -> Self {
        self.subscriber_buffer = buffer;
        self
    }

    /// Start the engine on the current Tokio runtime.
    pub fn build(self) -> TestEngine {
        let config = DispatchConfig {
            geo_backend: self.geo_backend,
            acceptance_window_secs: self.acceptance_window_secs,
            enforce_fresh_heartbeat: self.enforce_fresh_heartbeat,
            subscriber_buffer: self.subscriber_buffer,
            ..DispatchConfig::default()
        };
        let clock = manual_clock();
        let mirror = Arc::new(MemoryMirror::with_clock(clock.clone(), config.idempotency_ttl()));
        let ports = if self.with_mirror {
            Ports::memory(mirror.clone())
        } else {
            Ports::default()
        }
        .with_clock(clock.clone());

        let shutdown = CancellationToken::new();
        let (service, hub_task) = DispatchService::start(&config, ports, shutdown.clone());
        TestEngine {
            service,
            mirror,
            clock,
            shutdown,
            hub_task,
        }
    }
}

/// A running engine plus the handles tests poke at.
pub struct TestEngine {
    pub service: DispatchService,
    pub mirror: Arc<MemoryMirror>,
    pub clock: Arc<ManualClock>,
    pub shutdown: CancellationToken,
    pub hub_task: JoinHandle<()>,
}

impl TestEngine {
    pub fn new() -> Self {
        TestEngineConfig::default().build()
    }

    pub async fn stop(self) {
        self.shutdown.cancel();
        let _ = self.hub_task.await;
    }
}
