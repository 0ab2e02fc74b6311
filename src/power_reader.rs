use crate::mackerel::MackerelClient;
use crate::presentation::PresentationAdapter;
use crate::reading::MeterReading;
use crate::transport::MeterTransport;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{error, info, warn};

/// Polls instantaneous power, then refreshes the accessory and forwards metrics
pub struct PowerCycle {
    transport: Arc<dyn MeterTransport>,
    state: Arc<watch::Sender<MeterReading>>,
    presentation: PresentationAdapter,
    forwarder: Arc<MackerelClient>,
    interval: Duration,
}

impl PowerCycle {
    pub fn new(
        transport: Arc<dyn MeterTransport>,
        state: Arc<watch::Sender<MeterReading>>,
        presentation: PresentationAdapter,
        forwarder: Arc<MackerelClient>,
        interval: Duration,
    ) -> Self {
        Self {
            transport,
            state,
            presentation,
            forwarder,
            interval,
        }
    }

    /// Spawns the power cycle as its own task
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    /// Polls forever, waiting the fixed interval after every attempt
    pub async fn run(&self) {
        info!(
            "Starting instantaneous power cycle every {:?}",
            self.interval
        );
        loop {
            self.poll_once().await;
            sleep(self.interval).await;
        }
    }

    /// One read/update/emit step. Returns whether a new reading was stored.
    pub async fn poll_once(&self) -> bool {
        info!("Fetching instantaneous electric power...");
        let watts = match self.transport.read_instantaneous_power().await {
            Ok(watts) => watts,
            Err(e) => {
                error!("Failed to fetch instantaneous electric power: {e}");
                return false;
            }
        };
        info!("Instantaneous electric power: {watts}W");

        let captured_at = Utc::now();
        self.state
            .send_modify(|reading| reading.record_power(watts, captured_at));
        let snapshot = self.state.borrow().clone();

        self.presentation.update(&snapshot).await;

        // Forwarder failures must not disturb the cycle
        if let Err(e) = self.forwarder.send_reading(&snapshot).await {
            warn!("Failed to send readings to Mackerel: {e}");
        }
        true
    }
}
