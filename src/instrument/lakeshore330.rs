//! LakeShore 330 autotuning temperature controller.
//!
//! Used to hold or ramp the sample temperature between sweeps. Temperatures are
//! in Kelvin on both the control and the sample channel.

use super::parse_numeric;
use crate::error::{AppResult, DaqError};
use crate::gpib::{GpibBus, GpibDevice};
use bitflags::bitflags;
use std::fmt;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Default I/O timeout for the controller (`T3s`).
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);

/// Highest setpoint the controller accepts.
pub const MAX_SETPOINT_K: f64 = 900.0;

/// Ramp rates the controller accepts, in K/min.
pub const RAMP_RATE_RANGE: std::ops::RangeInclusive<f64> = 0.1..=99.9;

bitflags! {
    /// Serial poll status byte.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SerialStatus: u8 {
        /// Service request.
        const SRQ = 64;
        /// Standard event status summary.
        const ESB = 32;
        /// Overload indicator.
        const OVI = 16;
        /// Control limit error.
        const CLE = 4;
        /// Control data ready.
        const CDR = 2;
        /// Sample data ready.
        const SDR = 1;
    }
}

bitflags! {
    /// Standard event status register (`*ESR?`).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct EventStatus: u8 {
        /// Power on.
        const PON = 128;
        /// Command error.
        const CME = 32;
        /// Execution error.
        const EXE = 16;
        /// Device dependent error.
        const DDE = 8;
        /// Query error.
        const QYE = 4;
        /// Operation complete.
        const OPC = 1;
    }
}

/// Decoded serial poll of the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThermostatStatus {
    /// Status byte.
    pub status: SerialStatus,
    /// Standard event status register, read only when ESB was set.
    pub events: Option<EventStatus>,
}

impl ThermostatStatus {
    /// Heater output overloaded.
    pub fn overload(&self) -> bool {
        self.status.contains(SerialStatus::OVI)
    }

    /// The control loop hit its limit.
    pub fn control_limit_error(&self) -> bool {
        self.status.contains(SerialStatus::CLE)
    }

    /// A new control channel reading is available.
    pub fn control_data_ready(&self) -> bool {
        self.status.contains(SerialStatus::CDR)
    }

    /// A new sample channel reading is available.
    pub fn sample_data_ready(&self) -> bool {
        self.status.contains(SerialStatus::SDR)
    }

    /// True when a command, execution, device or query error was latched.
    pub fn has_error(&self) -> bool {
        let errors = EventStatus::CME | EventStatus::EXE | EventStatus::DDE | EventStatus::QYE;
        self.overload()
            || self.control_limit_error()
            || self.events.is_some_and(|esr| esr.intersects(errors))
    }

    /// Mnemonics of every set bit, status byte first.
    pub fn flags(&self) -> Vec<&'static str> {
        let mut flags: Vec<&'static str> = self.status.iter_names().map(|(name, _)| name).collect();
        if let Some(esr) = self.events {
            flags.extend(esr.iter_names().map(|(name, _)| name));
        }
        flags
    }
}

impl fmt::Display for ThermostatStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:02x} <{}>", self.status.bits(), self.flags().join(" "))
    }
}

/// A LakeShore 330 session.
pub struct LakeShore330 {
    device: GpibDevice,
    ramp_delay: Duration,
}

impl LakeShore330 {
    /// Creates a closed session for the controller at `board`/`address`.
    pub fn new(bus: Box<dyn GpibBus>, board: u32, address: u8) -> Self {
        Self {
            device: GpibDevice::new(bus, board, address, "LakeShore 330")
                .with_timeout(DEFAULT_TIMEOUT),
            ramp_delay: Duration::from_secs(1),
        }
    }

    /// I/O timeout of the session.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.device = self.device.with_timeout(timeout);
        self
    }

    /// Delay after the device clear in [`LakeShore330::open`].
    pub fn with_settle_delay(mut self, settle: Duration) -> Self {
        self.device = self.device.with_settle_delay(settle);
        self
    }

    /// Pause after starting a ramp before the controller is queried again.
    pub fn with_ramp_delay(mut self, delay: Duration) -> Self {
        self.ramp_delay = delay;
        self
    }

    /// True while the session is open.
    pub fn is_open(&self) -> bool {
        self.device.is_open()
    }

    /// Commands sent by [`LakeShore330::open`] after the device clear.
    pub fn init_sequence() -> Vec<String> {
        ["*SRE 0", "RANG 0", "CUNI K", "SUNI K", "RAMP 0", "TUNE 4"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    /// Opens the controller with the heater off, Kelvin units, no ramp and
    /// zone autotuning.
    pub async fn open(&mut self) -> AppResult<()> {
        self.device.open().await?;
        self.device.run_sequence(&Self::init_sequence()).await?;
        info!("LakeShore 330 at address {} initialised", self.device.address());
        Ok(())
    }

    /// Sample sensor reading in Kelvin.
    pub async fn temperature(&mut self) -> AppResult<f64> {
        let response = self.device.query("SDAT?").await?;
        parse_numeric("SDAT?", &response)
    }

    /// Sets the control setpoint (0-900 K).
    pub async fn set_temperature(&mut self, kelvin: f64) -> AppResult<()> {
        if !(0.0..=MAX_SETPOINT_K).contains(&kelvin) {
            return Err(DaqError::Configuration(format!(
                "setpoint {} K outside 0-{} K",
                kelvin, MAX_SETPOINT_K
            )));
        }
        self.device.write(&format!("SETP {:.2}", kelvin)).await?;
        Ok(())
    }

    /// Switches the heater on in range 1 (low), 2 (medium) or 3 (high).
    ///
    /// The range is read back; a mismatch is logged but not treated as a
    /// failure.
    pub async fn switch_power_on(&mut self, range: u8) -> AppResult<()> {
        if !(1..=3).contains(&range) {
            return Err(DaqError::Configuration(format!(
                "heater range {} outside 1-3",
                range
            )));
        }
        self.device.write(&format!("RANG {}", range)).await?;
        let response = self.device.query("RANG?").await?;
        match parse_numeric("RANG?", &response) {
            Ok(actual) if actual as u8 == range => debug!("Heater range {}", range),
            Ok(actual) => error!("Heater range set to {} but reads back {}", range, actual),
            Err(e) => error!("Heater range read back failed: {}", e),
        }
        Ok(())
    }

    /// Heater off with service requests disabled.
    pub async fn switch_power_off(&mut self) -> AppResult<()> {
        self.device
            .run_sequence(&["*SRE 0".to_string(), "RANG 0".to_string()])
            .await
    }

    /// Ramps the setpoint to `target` K at `rate` K/min.
    ///
    /// Both values are checked before anything is sent.
    pub async fn start_ramp(&mut self, target: f64, rate: f64) -> AppResult<()> {
        if !RAMP_RATE_RANGE.contains(&rate) {
            return Err(DaqError::Configuration(format!(
                "ramp rate {} K/min outside {:?}",
                rate, RAMP_RATE_RANGE
            )));
        }
        if !(0.0..=MAX_SETPOINT_K).contains(&target) {
            return Err(DaqError::Configuration(format!(
                "setpoint {} K outside 0-{} K",
                target, MAX_SETPOINT_K
            )));
        }
        self.device.write(&format!("RAMPR {}", rate)).await?;
        self.set_temperature(target).await?;
        self.device.write("RAMP 1").await?;
        tokio::time::sleep(self.ramp_delay).await;
        info!("Ramping to {:.2} K at {} K/min", target, rate);
        Ok(())
    }

    /// True while a setpoint ramp is in progress (`RAMPS?`).
    pub async fn is_ramping(&mut self) -> AppResult<bool> {
        let response = self.device.query("RAMPS?").await?;
        Ok(parse_numeric("RAMPS?", &response)? as i64 == 1)
    }

    /// Serial-polls the controller and decodes its status.
    pub async fn check_status(&mut self) -> AppResult<ThermostatStatus> {
        let status_byte = self.device.serial_poll().await?;
        let mut status = ThermostatStatus {
            status: SerialStatus::from_bits_retain(status_byte),
            events: None,
        };
        if status.status.contains(SerialStatus::ESB) {
            let response = self.device.query("*ESR?").await?;
            let esr = parse_numeric("*ESR?", &response)?;
            if !(0.0..=255.0).contains(&esr) {
                return Err(DaqError::parse("*ESR?", response.trim()));
            }
            status.events = Some(EventStatus::from_bits_retain(esr as u8));
        }
        if status.has_error() {
            warn!("LakeShore 330 status {}", status);
        } else {
            debug!("LakeShore 330 status {}", status);
        }
        Ok(status)
    }

    /// Takes the controller offline and leaves the heater as it is, so a
    /// setpoint or ramp keeps running after the program exits.
    pub async fn release(&mut self) -> AppResult<()> {
        self.device.close().await
    }

    /// Switches the heater off and takes the controller offline. Safe to call
    /// repeatedly.
    pub async fn close(&mut self) -> AppResult<()> {
        if !self.device.is_open() {
            return Ok(());
        }
        if let Err(e) = self.switch_power_off().await {
            warn!("LakeShore 330: heater off failed: {}", e);
        }
        self.device.close().await
    }
}
