use crate::error::TransportError;
use crate::reading::CumulativeEnergy;
use async_trait::async_trait;

/// An established session with the smart meter.
///
/// Both sampling cycles share one session, implementations serialize requests internally.
#[async_trait]
pub trait MeterTransport: Send + Sync {
    /// Instantaneous power in watts
    async fn read_instantaneous_power(&self) -> Result<f64, TransportError>;

    /// The meter's most recent 30 minute normal-direction cumulative energy sample
    async fn read_cumulative_energy(&self) -> Result<CumulativeEnergy, TransportError>;
}
