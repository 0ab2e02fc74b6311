use crate::accessory::Characteristic;
use crate::reading::MeterReading;
use tokio::sync::mpsc::Sender;
use tracing::{info, warn};

/// Power treated as 100% of capacity
pub const FULL_SCALE_WATTS: f64 = 4000.0;

/// Maps instantaneous power onto the 0-100 humidity scale
pub fn humidity_percent(power_watts: Option<f64>) -> u8 {
    match power_watts {
        Some(watts) => (watts / FULL_SCALE_WATTS * 100.0).floor().clamp(0.0, 100.0) as u8,
        None => 0,
    }
}

/// The alert fires at or above the threshold
pub fn leak_detected(percent: u8, alert_threshold: u8) -> bool {
    percent >= alert_threshold
}

/// Pushes the power cycle's latest reading to the accessory
#[derive(Clone)]
pub struct PresentationAdapter {
    updates: Sender<Characteristic>,
    alert_threshold: u8,
}

impl PresentationAdapter {
    pub fn new(updates: Sender<Characteristic>, alert_threshold: u8) -> Self {
        Self {
            updates,
            alert_threshold,
        }
    }

    pub async fn update(&self, reading: &MeterReading) {
        let value = humidity_percent(reading.power.map(|sample| sample.value));
        let alert = leak_detected(value, self.alert_threshold);
        info!("Accessory value: {value}, alert: {alert}");

        for characteristic in [
            Characteristic::CurrentRelativeHumidity(value),
            Characteristic::LeakDetected(alert),
        ] {
            if let Err(e) = self.updates.send(characteristic).await {
                warn!("Failed to push {characteristic:?} to accessory: {e}");
            }
        }
    }
}
