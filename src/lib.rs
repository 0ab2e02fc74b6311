//! Wi-SUN Smart Meter Bridge Library
//!
//! Polls a low-voltage smart meter over ECHONET Lite, republishes instantaneous power as
//! a humidity percentage and a threshold leak alert on a Modbus accessory, and forwards
//! power and energy readings to Mackerel.

pub mod accessory;
pub mod config;
pub mod echonet;
pub mod energy_reader;
pub mod error;
pub mod mackerel;
pub mod power_reader;
pub mod presentation;
pub mod reading;
pub mod sampling_coordinator;
pub mod transport;

// Re-export commonly used types for easier access
pub use accessory::{Characteristic, SensorAccessory};
pub use config::Config;
pub use echonet::EchonetTransport;
pub use mackerel::MackerelClient;
pub use presentation::PresentationAdapter;
pub use reading::{CumulativeEnergy, MeterReading};
pub use sampling_coordinator::{SamplingCoordinator, SamplingIntervals};
pub use transport::MeterTransport;
