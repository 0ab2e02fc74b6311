use crate::reading::{CumulativeUpdate, MeterReading};
use crate::transport::MeterTransport;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{error, info};

/// Polls the meter's 30 minute cumulative energy and tracks the per-interval delta
pub struct EnergyCycle {
    transport: Arc<dyn MeterTransport>,
    state: Arc<watch::Sender<MeterReading>>,
    interval: Duration,
}

impl EnergyCycle {
    pub fn new(
        transport: Arc<dyn MeterTransport>,
        state: Arc<watch::Sender<MeterReading>>,
        interval: Duration,
    ) -> Self {
        Self {
            transport,
            state,
            interval,
        }
    }

    /// Spawns the energy cycle as its own task
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    /// Polls forever. A repeated sample is skipped and polling carries on.
    pub async fn run(&self) {
        info!("Starting cumulative energy cycle every {:?}", self.interval);
        loop {
            self.poll_once().await;
            sleep(self.interval).await;
        }
    }

    /// One read/update step. `None` when the read failed.
    pub async fn poll_once(&self) -> Option<CumulativeUpdate> {
        let energy = match self.transport.read_cumulative_energy().await {
            Ok(energy) => energy,
            Err(e) => {
                error!("Failed to fetch normal direction cumulative electric energy: {e}");
                return None;
            }
        };
        info!(
            "Normal direction cumulative electric energy {}kWh at {}",
            energy.kwh, energy.date_and_time
        );

        let mut update = CumulativeUpdate::Duplicate;
        self.state.send_if_modified(|reading| {
            update = reading.record_cumulative(&energy);
            update != CumulativeUpdate::Duplicate
        });

        match update {
            CumulativeUpdate::Duplicate => {
                info!("No new 30 minute sample since {}", energy.date_and_time)
            }
            CumulativeUpdate::First => info!("Waiting for a second sample to derive energy use"),
            CumulativeUpdate::Delta(delta) => {
                info!("Energy used until {}: {}kWh", delta.timestamp, delta.value)
            }
        }
        Some(update)
    }
}
