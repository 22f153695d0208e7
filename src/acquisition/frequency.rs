//! Sweep frequency tables.
//!
//! Three ways to build one:
//! - [`FrequencyTable::standard`]: the fixed list of standard LCR test points
//! - [`FrequencyTable::doubling`]: repeated doubling from a minimum, with the
//!   last step clamped to the maximum
//! - [`FrequencyTable::from_values`]: an explicit list
//!
//! Every table is non-decreasing and lies within
//! [`FLOOR_HZ`]..=[`CEILING_HZ`], the meter's frequency range.

use crate::error::{AppResult, DaqError};
use crate::instrument::Hp4284a;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Lowest test frequency of the meter.
pub const FLOOR_HZ: f64 = 20.0;

/// Highest test frequency of the meter.
pub const CEILING_HZ: f64 = 1.0e6;

/// Standard test points, 20 Hz to 1 MHz.
pub const STANDARD_POINTS: [f64; 48] = [
    20.0, 25.0, 30.0, 40.0, 50.0, 60.0, 80.0, 100.0, 120.0, 150.0, 200.0, 250.0, 300.0, 400.0,
    500.0, 600.0, 800.0, 1.0e3, 1.2e3, 1.5e3, 2.0e3, 2.5e3, 3.0e3, 4.0e3, 5.0e3, 6.0e3, 8.0e3,
    1.0e4, 1.2e4, 1.5e4, 2.0e4, 2.5e4, 3.0e4, 4.0e4, 5.0e4, 6.0e4, 8.0e4, 1.0e5, 1.2e5, 1.5e5,
    2.0e5, 2.5e5, 3.0e5, 4.0e5, 5.0e5, 6.0e5, 8.0e5, 1.0e6,
];

/// How the sweep table is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrequencyPlan {
    /// [`STANDARD_POINTS`] restricted to the configured range.
    #[default]
    Standard,
    /// Doubling from the configured minimum.
    Doubling,
    /// The configured list.
    Explicit,
}

/// Ordered sweep frequencies in Hz.
#[derive(Debug, Clone, PartialEq)]
pub struct FrequencyTable {
    values: Vec<f64>,
    calibrate: bool,
}

fn check_range(min_hz: f64, max_hz: f64) -> AppResult<()> {
    if !(FLOOR_HZ..=CEILING_HZ).contains(&min_hz)
        || !(FLOOR_HZ..=CEILING_HZ).contains(&max_hz)
        || min_hz > max_hz
    {
        return Err(DaqError::Configuration(format!(
            "frequency range {} - {} Hz must satisfy {} <= min <= max <= {}",
            min_hz, max_hz, FLOOR_HZ, CEILING_HZ
        )));
    }
    Ok(())
}

impl FrequencyTable {
    /// The full standard table.
    pub fn standard() -> Self {
        Self {
            values: STANDARD_POINTS.to_vec(),
            calibrate: false,
        }
    }

    /// Standard points within `min_hz..=max_hz`, ending exactly at `max_hz`.
    pub fn standard_within(min_hz: f64, max_hz: f64) -> AppResult<Self> {
        check_range(min_hz, max_hz)?;
        let mut values: Vec<f64> = STANDARD_POINTS
            .iter()
            .copied()
            .filter(|f| (min_hz..=max_hz).contains(f))
            .collect();
        if values.last() != Some(&max_hz) {
            values.push(max_hz);
        }
        Ok(Self {
            values,
            calibrate: false,
        })
    }

    /// `min_hz`, `2*min_hz`, `4*min_hz`, ... with the final entry clamped to
    /// `max_hz`.
    ///
    /// The meter cannot synthesise every doubled value exactly, so a doubling
    /// table is calibrated against the meter before the sweep (see
    /// [`FrequencyTable::calibrate`]).
    pub fn doubling(min_hz: f64, max_hz: f64) -> AppResult<Self> {
        check_range(min_hz, max_hz)?;
        let mut values = Vec::new();
        let mut f = min_hz;
        while f < max_hz {
            values.push(f);
            f *= 2.0;
        }
        values.push(max_hz);
        Ok(Self {
            values,
            calibrate: true,
        })
    }

    /// An explicit list, which must be non-empty, in range and non-decreasing.
    pub fn from_values(values: Vec<f64>) -> AppResult<Self> {
        if values.is_empty() {
            return Err(DaqError::Configuration(
                "frequency list is empty".to_string(),
            ));
        }
        if let Some(bad) = values
            .iter()
            .find(|f| !f.is_finite() || !(FLOOR_HZ..=CEILING_HZ).contains(*f))
        {
            return Err(DaqError::Configuration(format!(
                "frequency {} Hz outside {} - {} Hz",
                bad, FLOOR_HZ, CEILING_HZ
            )));
        }
        if values.windows(2).any(|pair| pair[1] < pair[0]) {
            return Err(DaqError::Configuration(
                "frequency list must be non-decreasing".to_string(),
            ));
        }
        Ok(Self {
            values,
            calibrate: false,
        })
    }

    /// Builds the table a [`FrequencyPlan`] describes.
    pub fn from_plan(
        plan: FrequencyPlan,
        min_hz: f64,
        max_hz: f64,
        explicit: &[f64],
    ) -> AppResult<Self> {
        match plan {
            FrequencyPlan::Standard => Self::standard_within(min_hz, max_hz),
            FrequencyPlan::Doubling => Self::doubling(min_hz, max_hz),
            FrequencyPlan::Explicit => Self::from_values(explicit.to_vec()),
        }
    }

    /// Marks whether the table is replaced by the meter's actual frequencies
    /// before a sweep.
    pub fn with_calibration(mut self, calibrate: bool) -> Self {
        self.calibrate = calibrate;
        self
    }

    /// True until [`FrequencyTable::calibrate`] has run on a table that asked for it.
    pub fn needs_calibration(&self) -> bool {
        self.calibrate
    }

    /// Frequencies in Hz, ascending.
    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// Number of points.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// True for a table without points.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Frequency at `index`.
    pub fn get(&self, index: usize) -> Option<f64> {
        self.values.get(index).copied()
    }

    /// Programs each entry into the meter and replaces it with the frequency
    /// the meter reports back.
    pub async fn calibrate(&mut self, meter: &mut Hp4284a) -> AppResult<()> {
        for value in self.values.iter_mut() {
            meter.set_frequency(*value).await?;
            let actual = meter.frequency().await?;
            debug!("Frequency {} Hz -> {} Hz", value, actual);
            *value = actual;
        }
        self.calibrate = false;
        Ok(())
    }
}
