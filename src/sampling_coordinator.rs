use crate::energy_reader::EnergyCycle;
use crate::mackerel::MackerelClient;
use crate::power_reader::PowerCycle;
use crate::presentation::PresentationAdapter;
use crate::reading::MeterReading;
use crate::transport::MeterTransport;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplingIntervals {
    pub power: Duration,
    pub energy: Duration,
}

impl Default for SamplingIntervals {
    fn default() -> Self {
        Self {
            power: Duration::from_secs(10),
            energy: Duration::from_secs(5 * 60),
        }
    }
}

/// Owns the meter reading and runs the power and energy cycles as independent tasks.
///
/// Once started there is no control surface beyond read-only snapshots; the cycles
/// run for the lifetime of the runtime.
pub struct SamplingCoordinator {
    readings: watch::Receiver<MeterReading>,
}

impl SamplingCoordinator {
    /// Creates the shared reading and starts both cycles
    pub fn start(
        transport: Arc<dyn MeterTransport>,
        presentation: PresentationAdapter,
        forwarder: MackerelClient,
        intervals: SamplingIntervals,
    ) -> Self {
        info!(
            "Starting sampling cycles, power every {:?}, energy every {:?}",
            intervals.power, intervals.energy
        );
        let (state, readings) = watch::channel(MeterReading::default());
        let state = Arc::new(state);

        PowerCycle::new(
            transport.clone(),
            state.clone(),
            presentation,
            Arc::new(forwarder),
            intervals.power,
        )
        .spawn();
        EnergyCycle::new(transport, state, intervals.energy).spawn();

        Self { readings }
    }

    /// Copy of the latest reading
    pub fn snapshot(&self) -> MeterReading {
        self.readings.borrow().clone()
    }

    /// Receiver notified whenever either cycle stores new data
    pub fn subscribe(&self) -> watch::Receiver<MeterReading> {
        self.readings.clone()
    }
}
