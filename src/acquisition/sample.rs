//! Measurement samples and their conversion to relative permittivity.

use crate::error::{AppResult, DaqError};
use serde::Serialize;

/// Vacuum permittivity in F/m.
pub const EPSILON_0: f64 = 8.854e-12;

/// Vacuum capacitance of a parallel-plate fixture.
///
/// `area_mm2` and `thickness_mm` are in mm^2 and mm; the 1e-3 factor brings
/// the mm-based ratio to metres.
///
/// ```
/// use dielectric_daq::acquisition::sample::reference_capacitance;
///
/// let c0 = reference_capacitance(10.0, 1.0);
/// assert!((c0 - 8.854e-14).abs() < 1e-27);
/// ```
pub fn reference_capacitance(area_mm2: f64, thickness_mm: f64) -> f64 {
    EPSILON_0 * area_mm2 / thickness_mm * 1.0e-3
}

/// One `FETCH?` result at a known frequency.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MeasurementSample {
    /// Frequency the sample was taken at, in Hz.
    pub frequency: f64,
    /// Parallel capacitance Cp in F.
    pub primary: f64,
    /// Dissipation factor D.
    pub secondary: f64,
    /// Measurement status code; 0 means a valid reading.
    pub status: i32,
}

impl MeasurementSample {
    /// Parses `<primary>,<secondary>,<status>`.
    pub fn parse(frequency: f64, line: &str) -> AppResult<Self> {
        let invalid = || DaqError::parse("FETCH?", line.trim());
        let mut fields = line.trim().split(',').map(str::trim);

        let primary = fields
            .next()
            .and_then(|f| f.parse::<f64>().ok())
            .ok_or_else(invalid)?;
        let secondary = fields
            .next()
            .and_then(|f| f.parse::<f64>().ok())
            .ok_or_else(invalid)?;
        let status = fields
            .next()
            .and_then(|f| {
                f.parse::<i32>()
                    .ok()
                    .or_else(|| f.parse::<f64>().ok().map(|v| v as i32))
            })
            .ok_or_else(invalid)?;

        Ok(Self {
            frequency,
            primary,
            secondary,
            status,
        })
    }

    /// The meter reports status 0 for a good measurement.
    pub fn is_valid(&self) -> bool {
        self.status == 0
    }
}

/// Relative permittivity derived from a Cp-D sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Permittivity {
    /// Frequency in Hz.
    pub frequency: f64,
    /// Real part, Cp / C0.
    pub e1: f64,
    /// Imaginary part, D * E1.
    pub e2: f64,
    /// Loss tangent as measured.
    pub tan_d: f64,
    /// Measured parallel capacitance.
    pub cp: f64,
}

impl Permittivity {
    /// Converts a Cp-D sample using the reference capacitance `c0` in F.
    pub fn from_sample(sample: &MeasurementSample, c0: f64) -> Self {
        let e1 = sample.primary / c0;
        Self {
            frequency: sample.frequency,
            e1,
            e2: sample.secondary * e1,
            tan_d: sample.secondary,
            cp: sample.primary,
        }
    }
}
