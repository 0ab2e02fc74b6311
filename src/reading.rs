//! Cached meter state and the cumulative-energy delta tracker.

use chrono::{DateTime, Duration, NaiveDateTime, Utc};

/// Smart meters report local time in JST without an offset
const METER_UTC_OFFSET_HOURS: i64 = 9;

/// A value and the instant it belongs to
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub value: f64,
    pub timestamp: DateTime<Utc>,
}

impl Sample {
    pub fn new(value: f64, timestamp: DateTime<Utc>) -> Self {
        Self { value, timestamp }
    }
}

/// Normal-direction cumulative energy as reported by the meter at its last 30 minute boundary
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CumulativeEnergy {
    /// Meter local time, no offset attached
    pub date_and_time: NaiveDateTime,
    pub kwh: f64,
}

impl CumulativeEnergy {
    /// Interprets the meter's local timestamp at the fixed +09:00 offset
    pub fn to_sample(&self) -> Sample {
        let utc = self.date_and_time - Duration::hours(METER_UTC_OFFSET_HOURS);
        Sample::new(self.kwh, utc.and_utc())
    }
}

/// Result of feeding a cumulative sample into the tracker
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CumulativeUpdate {
    /// Same meter timestamp as the cached sample, nothing changed
    Duplicate,
    /// Stored, but there is no previous sample to diff against yet
    First,
    /// Stored, and the energy used since the previous sample was derived
    Delta(Sample),
}

/// Latest readings for the lifetime of the process.
///
/// `power` is written only by the power cycle and the cumulative fields only by
/// the energy cycle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MeterReading {
    pub power: Option<Sample>,
    pub cumulative_energy: Option<Sample>,
    pub previous_cumulative_energy: Option<Sample>,
    pub energy_delta: Option<Sample>,
}

impl MeterReading {
    pub fn record_power(&mut self, watts: f64, captured_at: DateTime<Utc>) {
        self.power = Some(Sample::new(watts, captured_at));
    }

    /// Shifts the current cumulative sample into the previous slot and recomputes the delta.
    pub fn record_cumulative(&mut self, energy: &CumulativeEnergy) -> CumulativeUpdate {
        let sample = energy.to_sample();
        if self
            .cumulative_energy
            .is_some_and(|current| current.timestamp == sample.timestamp)
        {
            return CumulativeUpdate::Duplicate;
        }

        self.previous_cumulative_energy = self.cumulative_energy.replace(sample);

        match (self.cumulative_energy, self.previous_cumulative_energy) {
            (Some(current), Some(previous)) => {
                let delta = Sample::new(current.value - previous.value, current.timestamp);
                self.energy_delta = Some(delta);
                CumulativeUpdate::Delta(delta)
            }
            _ => CumulativeUpdate::First,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone};

    fn at(hour: u32, minute: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, 15)
            .unwrap()
            .and_hms_opt(hour, minute, 0)
            .unwrap()
    }

    fn energy(hour: u32, minute: u32, kwh: f64) -> CumulativeEnergy {
        CumulativeEnergy {
            date_and_time: at(hour, minute),
            kwh,
        }
    }

    #[test]
    fn test_meter_time_is_jst() {
        let sample = energy(12, 30, 10.0).to_sample();
        assert_eq!(
            sample.timestamp,
            Utc.with_ymd_and_hms(2024, 1, 15, 3, 30, 0).unwrap()
        );
    }

    #[test]
    fn test_meter_time_crosses_date_boundary() {
        let sample = energy(8, 0, 1.0).to_sample();
        assert_eq!(
            sample.timestamp,
            Utc.with_ymd_and_hms(2024, 1, 14, 23, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_starts_empty() {
        let reading = MeterReading::default();
        assert!(reading.power.is_none());
        assert!(reading.cumulative_energy.is_none());
        assert!(reading.previous_cumulative_energy.is_none());
        assert!(reading.energy_delta.is_none());
    }

    #[test]
    fn test_record_power() {
        let mut reading = MeterReading::default();
        let now = Utc::now();
        reading.record_power(2000.0, now);
        assert_eq!(reading.power, Some(Sample::new(2000.0, now)));
        assert!(reading.cumulative_energy.is_none());
    }

    #[test]
    fn test_first_cumulative_sample_has_no_delta() {
        let mut reading = MeterReading::default();
        let update = reading.record_cumulative(&energy(12, 0, 10.0));

        assert_eq!(update, CumulativeUpdate::First);
        assert_eq!(reading.cumulative_energy.unwrap().value, 10.0);
        assert!(reading.previous_cumulative_energy.is_none());
        assert!(reading.energy_delta.is_none());
    }

    #[test]
    fn test_delta_between_successive_samples() {
        let mut reading = MeterReading::default();
        reading.record_cumulative(&energy(12, 0, 10.0));
        let update = reading.record_cumulative(&energy(12, 30, 10.5));

        let t1 = energy(12, 30, 10.5).to_sample().timestamp;
        match update {
            CumulativeUpdate::Delta(delta) => {
                assert!((delta.value - 0.5).abs() < 1e-9);
                assert_eq!(delta.timestamp, t1);
            }
            other => panic!("Expected a delta, got {other:?}"),
        }
        assert_eq!(reading.energy_delta.unwrap().timestamp, t1);
        assert_eq!(reading.previous_cumulative_energy.unwrap().value, 10.0);
        assert_eq!(reading.cumulative_energy.unwrap().value, 10.5);
    }

    #[test]
    fn test_duplicate_sample_leaves_state_unchanged() {
        let mut reading = MeterReading::default();
        reading.record_cumulative(&energy(12, 0, 10.0));
        reading.record_cumulative(&energy(12, 30, 10.5));
        let before = reading.clone();

        let update = reading.record_cumulative(&energy(12, 30, 10.5));

        assert_eq!(update, CumulativeUpdate::Duplicate);
        assert_eq!(reading, before);
    }

    #[test]
    fn test_zero_values_count_as_defined() {
        let mut reading = MeterReading::default();
        reading.record_cumulative(&energy(0, 0, 0.0));
        let update = reading.record_cumulative(&energy(0, 30, 0.0));

        match update {
            CumulativeUpdate::Delta(delta) => assert_eq!(delta.value, 0.0),
            other => panic!("Expected a zero delta, got {other:?}"),
        }
        assert_eq!(reading.energy_delta.unwrap().value, 0.0);
    }

    #[test]
    fn test_cumulative_updates_do_not_touch_power() {
        let mut reading = MeterReading::default();
        let now = Utc::now();
        reading.record_power(150.0, now);
        reading.record_cumulative(&energy(12, 0, 10.0));
        reading.record_cumulative(&energy(12, 30, 11.0));
        assert_eq!(reading.power, Some(Sample::new(150.0, now)));
    }
}
