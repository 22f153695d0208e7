//! Bench configuration using Figment.
//!
//! Loaded from a TOML file (default `config/default.toml`) merged with
//! environment variables prefixed `DIELECTRIC_`. Nested keys are separated by
//! a double underscore:
//!
//! ```text
//! DIELECTRIC_GPIB__LCR_ADDRESS=17
//! DIELECTRIC_LCR__TEST_VOLTAGE=0.5
//! DIELECTRIC_APPLICATION__LOG_LEVEL=debug
//! ```
//!
//! Every section has defaults, so an empty file is a valid configuration.

use crate::acquisition::{AcquisitionSettings, FrequencyPlan, FrequencyTable, SampleGeometry};
use crate::error::{AppResult, DaqError};
use crate::instrument::discovery::PRIMARY_ADDRESSES;
use crate::instrument::ImpedanceMode;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file, relative to the working directory.
pub const DEFAULT_PATH: &str = "config/default.toml";

/// Prefix of overriding environment variables.
pub const ENV_PREFIX: &str = "DIELECTRIC_";

const POLL_INTERVAL_RANGE: RangeInclusive<Duration> =
    Duration::from_millis(100)..=Duration::from_millis(1000);
const TEST_VOLTAGE_RANGE: RangeInclusive<f64> = 0.1..=2.0;
const AVERAGES_RANGE: RangeInclusive<u32> = 1..=64;
const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];
const LOG_FORMATS: [&str; 2] = ["text", "json"];

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Logging.
    pub application: ApplicationConfig,
    /// Bus and instrument addresses.
    pub gpib: GpibConfig,
    /// Meter settings for sweeps.
    pub lcr: LcrConfig,
    /// Sample geometry.
    pub sample: SampleConfig,
    /// Output files.
    pub output: OutputConfig,
    /// Frequency table.
    pub sweep: SweepConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log line format (text, json)
    pub log_format: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "text".to_string(),
        }
    }
}

/// Bus and instrument addresses
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GpibConfig {
    /// Interface board index
    pub board: u32,
    /// Primary address of the LCR meter
    pub lcr_address: u8,
    /// Primary address of the temperature controller, if fitted
    pub thermostat_address: Option<u8>,
    /// Bus I/O timeout of the LCR meter session
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Wait after the device clear on open
    #[serde(with = "humantime_serde")]
    pub settle: Duration,
}

impl Default for GpibConfig {
    fn default() -> Self {
        Self {
            board: 0,
            lcr_address: 17,
            thermostat_address: None,
            timeout: crate::instrument::hp4284a::DEFAULT_TIMEOUT,
            settle: crate::gpib::device::DEFAULT_SETTLE,
        }
    }
}

/// LCR meter measurement settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LcrConfig {
    /// Service-request poll interval, 100 ms to 1 s.
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Test signal level in volts
    pub test_voltage: f64,
    /// Averaging factor, 1 to 64.
    pub averages: u32,
    /// Apply open compensation during sweeps.
    pub open_correction: bool,
    /// Apply short compensation during sweeps.
    pub short_correction: bool,
    /// Impedance parameter pair, by mnemonic. Sweeps accept `CPD` only.
    pub mode: ImpedanceMode,
    /// Wait after each frequency change
    #[serde(with = "humantime_serde")]
    pub stabilization: Duration,
}

impl Default for LcrConfig {
    fn default() -> Self {
        let settings = AcquisitionSettings::default();
        Self {
            poll_interval: settings.poll_interval,
            test_voltage: settings.test_voltage,
            averages: settings.averages,
            open_correction: settings.open_correction,
            short_correction: settings.short_correction,
            mode: settings.mode,
            stabilization: settings.stabilization,
        }
    }
}

/// Sample under test
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SampleConfig {
    /// Electrode area in mm^2
    pub area_mm2: f64,
    /// Sample thickness in mm
    pub thickness_mm: f64,
    /// Free text copied into the output header
    pub description: String,
}

impl Default for SampleConfig {
    fn default() -> Self {
        Self {
            area_mm2: 10.0,
            thickness_mm: 1.0,
            description: String::new(),
        }
    }
}

/// Where sweep files go
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Directory for sweep files, created when missing.
    pub directory: PathBuf,
    /// Fixed file name; a timestamped one is generated when absent
    pub file_name: Option<String>,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("data"),
            file_name: None,
        }
    }
}

/// Frequency table of a sweep
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepConfig {
    /// How the table is built.
    pub plan: FrequencyPlan,
    /// Lowest frequency in Hz.
    pub min_hz: f64,
    /// Highest frequency in Hz.
    pub max_hz: f64,
    /// Used by the `explicit` plan
    pub frequencies: Vec<f64>,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            plan: FrequencyPlan::Standard,
            min_hz: crate::acquisition::frequency::FLOOR_HZ,
            max_hz: crate::acquisition::frequency::CEILING_HZ,
            frequencies: Vec::new(),
        }
    }
}

fn invalid(message: String) -> DaqError {
    DaqError::Configuration(message)
}

impl AppConfig {
    /// Load configuration from [`DEFAULT_PATH`] and the environment.
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_PATH)
    }

    /// Load configuration from `path` and the environment, then validate it.
    ///
    /// A missing file is not an error; defaults and the environment apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let config: Self = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;

        config.validate()?;
        Ok(config)
    }

    /// Checks value ranges and the frequency table.
    pub fn validate(&self) -> AppResult<()> {
        if !LOG_LEVELS.contains(&self.application.log_level.as_str()) {
            return Err(invalid(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                LOG_LEVELS.join(", ")
            )));
        }
        if !LOG_FORMATS.contains(&self.application.log_format.as_str()) {
            return Err(invalid(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                LOG_FORMATS.join(", ")
            )));
        }

        if !PRIMARY_ADDRESSES.contains(&self.gpib.lcr_address) {
            return Err(invalid(format!(
                "lcr_address {} outside 1-30",
                self.gpib.lcr_address
            )));
        }
        if let Some(address) = self.gpib.thermostat_address {
            if !PRIMARY_ADDRESSES.contains(&address) {
                return Err(invalid(format!(
                    "thermostat_address {} outside 1-30",
                    address
                )));
            }
            if address == self.gpib.lcr_address {
                return Err(invalid(format!(
                    "thermostat_address {} is also the LCR meter address",
                    address
                )));
            }
        }

        if !POLL_INTERVAL_RANGE.contains(&self.lcr.poll_interval) {
            return Err(invalid(format!(
                "poll_interval {:?} outside 100 ms - 1000 ms",
                self.lcr.poll_interval
            )));
        }
        if !TEST_VOLTAGE_RANGE.contains(&self.lcr.test_voltage) {
            return Err(invalid(format!(
                "test_voltage {} V outside 0.1 - 2.0 V",
                self.lcr.test_voltage
            )));
        }
        if !AVERAGES_RANGE.contains(&self.lcr.averages) {
            return Err(invalid(format!(
                "averages {} outside 1 - 64",
                self.lcr.averages
            )));
        }
        if !self.lcr.mode.gives_permittivity() {
            return Err(invalid(format!(
                "mode '{}' cannot be converted to permittivity, use CPD",
                self.lcr.mode.mnemonic()
            )));
        }

        self.geometry()?;
        self.frequency_table()?;
        Ok(())
    }

    /// Settings handed to the acquisition controller.
    pub fn acquisition_settings(&self) -> AcquisitionSettings {
        AcquisitionSettings {
            poll_interval: self.lcr.poll_interval,
            test_voltage: self.lcr.test_voltage,
            averages: self.lcr.averages,
            open_correction: self.lcr.open_correction,
            short_correction: self.lcr.short_correction,
            mode: self.lcr.mode,
            stabilization: self.lcr.stabilization,
        }
    }

    /// Builds the sweep table from the `[sweep]` section.
    pub fn frequency_table(&self) -> AppResult<FrequencyTable> {
        FrequencyTable::from_plan(
            self.sweep.plan,
            self.sweep.min_hz,
            self.sweep.max_hz,
            &self.sweep.frequencies,
        )
    }

    /// Sample geometry from the `[sample]` section.
    pub fn geometry(&self) -> AppResult<SampleGeometry> {
        SampleGeometry::new(
            self.sample.area_mm2,
            self.sample.thickness_mm,
            self.sample.description.clone(),
        )
    }

    /// Output file for a sweep started now.
    pub fn output_path(&self) -> PathBuf {
        let name = match &self.output.file_name {
            Some(name) => name.clone(),
            None => chrono::Local::now()
                .format("sweep_%Y%m%d_%H%M%S.dat")
                .to_string(),
        };
        self.output.directory.join(name)
    }

    /// The effective configuration as TOML.
    pub fn to_toml(&self) -> AppResult<String> {
        toml::to_string_pretty(self)
            .map_err(|e| invalid(format!("cannot serialise configuration: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_config(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = AppConfig::default();
        config.validate().unwrap();
        assert_eq!(config.gpib.lcr_address, 17);
        assert_eq!(config.lcr.mode, ImpedanceMode::CpD);
        assert_eq!(config.frequency_table().unwrap().len(), 48);
    }

    #[test]
    fn test_load_from_file() {
        let file = write_config(
            r#"
            [gpib]
            lcr_address = 5
            timeout = "10s"

            [lcr]
            poll_interval = "250ms"
            test_voltage = 0.5
            mode = "cpd"

            [sample]
            area_mm2 = 20.0
            thickness_mm = 0.5
            description = "PVDF"

            [sweep]
            plan = "doubling"
            min_hz = 100.0
            max_hz = 1000.0
            "#,
        );
        let config = AppConfig::load_from(file.path()).unwrap();

        assert_eq!(config.gpib.lcr_address, 5);
        assert_eq!(config.gpib.timeout, Duration::from_secs(10));
        assert_eq!(config.lcr.poll_interval, Duration::from_millis(250));
        assert_eq!(config.lcr.mode, ImpedanceMode::CpD);
        assert_eq!(config.lcr.averages, 7);
        let table = config.frequency_table().unwrap();
        assert_eq!(table.values(), &[100.0, 200.0, 400.0, 800.0, 1000.0]);
        assert!(table.needs_calibration());
        let c0 = config.geometry().unwrap().c0();
        assert!((c0 - 8.854e-12 * 20.0 / 0.5 * 1.0e-3).abs() < 1e-25);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let config = AppConfig::load_from("does/not/exist.toml").unwrap();
        assert_eq!(config.sample.area_mm2, 10.0);
    }

    #[test]
    fn test_validation_ranges() {
        let mut config = AppConfig::default();
        config.lcr.poll_interval = Duration::from_millis(50);
        assert!(matches!(config.validate(), Err(DaqError::Configuration(_))));

        let mut config = AppConfig::default();
        config.lcr.test_voltage = 2.5;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.lcr.averages = 65;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.sample.thickness_mm = 0.0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.gpib.lcr_address = 31;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.gpib.thermostat_address = Some(17);
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.application.log_level = "verbose".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_mode_without_permittivity_is_rejected() {
        let file = write_config("[lcr]\nmode = \"LSQ\"\n");
        match AppConfig::load_from(file.path()) {
            Err(DaqError::Configuration(message)) => assert!(message.contains("LSQ")),
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[test]
    fn test_bad_mode_is_load_error() {
        let file = write_config("[lcr]\nmode = \"XYZ\"\n");
        assert!(matches!(
            AppConfig::load_from(file.path()),
            Err(DaqError::Config(_))
        ));
    }

    #[test]
    fn test_output_path() {
        let mut config = AppConfig::default();
        config.output.directory = PathBuf::from("/tmp/runs");
        config.output.file_name = Some("film.dat".into());
        assert_eq!(config.output_path(), PathBuf::from("/tmp/runs/film.dat"));

        config.output.file_name = None;
        let generated = config.output_path();
        let name = generated.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("sweep_") && name.ends_with(".dat"));
    }

    #[test]
    fn test_toml_round_trip() {
        let mut config = AppConfig::default();
        config.gpib.thermostat_address = Some(12);
        let text = config.to_toml().unwrap();
        let file = write_config(&text);
        assert_eq!(AppConfig::load_from(file.path()).unwrap(), config);
    }
}
