//! HP/Agilent 4284A precision LCR meter session.
//!
//! The session owns one [`GpibDevice`] and knows the meter's command
//! vocabulary. Opening it runs the initialisation sequence that puts the
//! meter into a known state:
//!
//! | Step | Command |
//! |------|---------|
//! | disable service requests | `*SRE 0` |
//! | clear status | `*CLS` |
//! | measurement function | `FUNC:IMP:TYPE CPRP` |
//! | auto ranging | `FUNC:IMP:RANG:AUTO ON` |
//! | automatic level control | `AMPL:ALC ON` |
//! | display page | `DISP:PAGE MEAS` |
//! | integration time | `APER LONG,<n>` |
//! | no DC bias | `BIAS:STAT OFF` |
//! | internal trigger | `TRIG:SOUR INT` |
//! | continuous initiation | `INIT:CONT ON` |
//! | ASCII data | `FORM:DATA ASC` |
//! | corrections off | `CORR:OPEN:STATE OFF`, `CORR:SHORT:STATE OFF`, `CORR:LOAD:STATE OFF` |
//! | cable length | `CORR:LENG 0` |
//!
//! Measurements are triggered over the bus: [`Hp4284a::enable_query`] switches
//! to bus triggering and arms the measurement-complete bit for a service
//! request, [`Hp4284a::query_values`] triggers once, and the completion is
//! picked up by the [`NotificationSource`] implementation.

mod correction;
mod mode;

pub use correction::CorrectionKind;
pub use mode::ImpedanceMode;

use super::parse_numeric;
use crate::error::{AppResult, DaqError};
use crate::gpib::{GpibBus, GpibDevice};
use crate::notification::{decode_operation_status, InstrumentEvent, NotificationSource};
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Request-service bit of the serial poll status byte.
pub const RQS_BIT: u8 = 0x40;

/// Service request enable mask selecting the operation status summary.
pub const OPERATION_SUMMARY_SRE: u8 = 128;

/// Averaging factor programmed by the initialisation sequence.
pub const DEFAULT_AVERAGES: u32 = 7;

/// Range of `APER LONG,<n>` averaging factors the meter accepts.
pub const AVERAGES_RANGE: std::ops::RangeInclusive<u32> = 1..=128;

/// Default I/O timeout for the meter (`T30s`).
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

fn on_off(enabled: bool) -> &'static str {
    if enabled {
        "ON"
    } else {
        "OFF"
    }
}

/// An open (or openable) HP4284A.
pub struct Hp4284a {
    device: GpibDevice,
    averages: u32,
    mode: Option<ImpedanceMode>,
    correction: Option<CorrectionKind>,
    query_enabled: bool,
}

impl Hp4284a {
    /// Creates a closed session for the meter at `board`/`address`.
    pub fn new(bus: Box<dyn GpibBus>, board: u32, address: u8) -> Self {
        Self {
            device: GpibDevice::new(bus, board, address, "HP4284A").with_timeout(DEFAULT_TIMEOUT),
            averages: DEFAULT_AVERAGES,
            mode: None,
            correction: None,
            query_enabled: false,
        }
    }

    /// I/O timeout of the session.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.device = self.device.with_timeout(timeout);
        self
    }

    /// Delay after the device clear in [`Hp4284a::open`].
    pub fn with_settle_delay(mut self, settle: Duration) -> Self {
        self.device = self.device.with_settle_delay(settle);
        self
    }

    /// Averaging factor used by the initialisation sequence.
    pub fn with_averages(mut self, averages: u32) -> Self {
        self.averages = averages;
        self
    }

    /// True while the session is open.
    pub fn is_open(&self) -> bool {
        self.device.is_open()
    }

    /// Primary address of the meter.
    pub fn address(&self) -> u8 {
        self.device.address()
    }

    /// Mode last programmed through this session.
    pub fn mode(&self) -> Option<ImpedanceMode> {
        self.mode
    }

    /// Correction currently armed, if any.
    pub fn active_correction(&self) -> Option<CorrectionKind> {
        self.correction
    }

    /// True while bus triggering is enabled.
    pub fn is_query_enabled(&self) -> bool {
        self.query_enabled
    }

    /// Commands sent by [`Hp4284a::open`] after the device clear.
    pub fn init_sequence(averages: u32) -> Vec<String> {
        vec![
            "*SRE 0".to_string(),
            "*CLS".to_string(),
            ImpedanceMode::CpRp.command(),
            "FUNC:IMP:RANG:AUTO ON".to_string(),
            "AMPL:ALC ON".to_string(),
            "DISP:PAGE MEAS".to_string(),
            format!("APER LONG,{}", averages),
            "BIAS:STAT OFF".to_string(),
            "TRIG:SOUR INT".to_string(),
            "INIT:CONT ON".to_string(),
            "FORM:DATA ASC".to_string(),
            "CORR:OPEN:STATE OFF".to_string(),
            "CORR:SHORT:STATE OFF".to_string(),
            "CORR:LOAD:STATE OFF".to_string(),
            "CORR:LENG 0".to_string(),
        ]
    }

    /// Opens the device and runs the initialisation sequence.
    ///
    /// A failed initialisation step returns
    /// [`DaqError::ConfigurationAbort`]; the session stays open and the steps
    /// already accepted remain in effect, so the caller may retry or close.
    pub async fn open(&mut self) -> AppResult<()> {
        if !AVERAGES_RANGE.contains(&self.averages) {
            return Err(DaqError::Configuration(format!(
                "averages {} outside {:?}",
                self.averages, AVERAGES_RANGE
            )));
        }

        self.device.open().await?;
        self.device
            .run_sequence(&Self::init_sequence(self.averages))
            .await?;
        self.mode = Some(ImpedanceMode::CpRp);
        self.correction = None;
        self.query_enabled = false;
        info!("HP4284A at address {} initialised", self.device.address());
        Ok(())
    }

    /// Selects an impedance parameter pair by numeric code (0-19).
    ///
    /// An unknown code is rejected with [`DaqError::InvalidMode`] before
    /// anything is written to the bus.
    pub async fn set_mode(&mut self, code: i32) -> AppResult<()> {
        let mode = ImpedanceMode::try_from(code)?;
        self.set_impedance_mode(mode).await
    }

    /// Selects an impedance parameter pair.
    pub async fn set_impedance_mode(&mut self, mode: ImpedanceMode) -> AppResult<()> {
        self.device.write(&mode.command()).await?;
        self.mode = Some(mode);
        debug!("Impedance mode set to {}", mode);
        Ok(())
    }

    /// Programs the test frequency in Hz. The meter rounds it to a frequency
    /// it can generate; [`Hp4284a::frequency`] reads that back.
    pub async fn set_frequency(&mut self, hz: f64) -> AppResult<()> {
        self.device.write(&format!("FREQ {} HZ", hz)).await?;
        Ok(())
    }

    /// Frequency the meter is actually using, which may differ from the one
    /// programmed.
    pub async fn frequency(&mut self) -> AppResult<f64> {
        let response = self.device.query("FREQ?").await?;
        parse_numeric("FREQ?", &response)
    }

    /// Sets the test signal level in volts.
    pub async fn set_amplitude(&mut self, volts: f64) -> AppResult<()> {
        self.device.write(&format!("VOLT {} V", volts)).await?;
        Ok(())
    }

    /// Test signal level in volts.
    pub async fn amplitude(&mut self) -> AppResult<f64> {
        let response = self.device.query("VOLT?").await?;
        parse_numeric("VOLT?", &response)
    }

    /// Sets the long-integration averaging factor.
    pub async fn set_averages(&mut self, averages: u32) -> AppResult<()> {
        if !AVERAGES_RANGE.contains(&averages) {
            return Err(DaqError::Configuration(format!(
                "averages {} outside {:?}",
                averages, AVERAGES_RANGE
            )));
        }
        self.device
            .write(&format!("APER LONG,{}", averages))
            .await?;
        self.averages = averages;
        Ok(())
    }

    /// Reads the averaging factor back (`APER?` answers `LONG,<n>`).
    pub async fn averages(&mut self) -> AppResult<u32> {
        let response = self.device.query("APER?").await?;
        let value = response
            .trim()
            .rsplit(',')
            .next()
            .and_then(|n| n.trim().parse::<u32>().ok());
        match value {
            Some(n) => Ok(n),
            None => Ok(parse_numeric("APER?", &response)? as u32),
        }
    }

    /// Switches previously measured open/short compensation on or off.
    pub async fn set_correction_state(&mut self, open: bool, short: bool) -> AppResult<()> {
        self.device
            .run_sequence(&[
                format!("CORR:OPEN:STATE {}", on_off(open)),
                format!("CORR:SHORT:STATE {}", on_off(short)),
            ])
            .await
    }

    /// Raw `FETCH?` response: `<primary>,<secondary>,<status>`.
    pub async fn fetch(&mut self) -> AppResult<String> {
        self.device.query("FETCH?").await
    }

    /// Switches to bus triggering with a service request on measurement end.
    ///
    /// Bus triggering counts as enabled from the first step on, so
    /// [`Hp4284a::disable_query`] restores internal triggering even after a
    /// partial failure.
    pub async fn enable_query(&mut self) -> AppResult<()> {
        self.query_enabled = true;
        self.device
            .run_sequence(&[
                "*CLS".to_string(),
                "TRIG:SOUR BUS".to_string(),
                "INIT:CONT OFF".to_string(),
                "STAT:OPER:ENAB 16".to_string(),
                format!("*SRE {}", OPERATION_SUMMARY_SRE),
            ])
            .await
    }

    /// Triggers one measurement.
    pub async fn query_values(&mut self) -> AppResult<()> {
        self.device.write("TRIG").await?;
        Ok(())
    }

    /// Returns to internal, continuous triggering with service requests off.
    ///
    /// Bus triggering stays flagged as enabled until the whole sequence has
    /// been accepted.
    pub async fn disable_query(&mut self) -> AppResult<()> {
        self.device
            .run_sequence(&[
                "STAT:OPER:ENAB 0".to_string(),
                "*SRE 0".to_string(),
                "*CLS".to_string(),
                "TRIG:SOUR INT".to_string(),
                "INIT:CONT ON".to_string(),
            ])
            .await?;
        self.query_enabled = false;
        Ok(())
    }

    /// Reads and clears the operation status event register.
    pub async fn operation_status(&mut self) -> AppResult<u16> {
        let response = self.device.query("STAT:OPER?").await?;
        let value = parse_numeric("STAT:OPER?", &response)?;
        if !(0.0..=f64::from(u16::MAX)).contains(&value) {
            return Err(DaqError::parse("STAT:OPER?", response.trim()));
        }
        Ok(value as u16)
    }

    /// Takes the meter offline. Safe to call repeatedly.
    pub async fn close(&mut self) -> AppResult<()> {
        if !self.device.is_open() {
            return Ok(());
        }
        if self.correction.is_some() || self.query_enabled {
            if let Err(e) = self.device.write("*SRE 0").await {
                warn!("HP4284A: could not disable service requests: {}", e);
            }
        }
        self.correction = None;
        self.query_enabled = false;
        self.device.close().await?;
        info!("HP4284A at address {} closed", self.device.address());
        Ok(())
    }
}

#[async_trait]
impl NotificationSource for Hp4284a {
    async fn check_notify(&mut self) -> AppResult<Option<InstrumentEvent>> {
        let status = self.device.serial_poll().await?;
        if status & RQS_BIT == 0 {
            return Ok(None);
        }
        let register = self.operation_status().await?;
        debug!(
            "Service request: status byte 0x{:02x}, operation status {}",
            status, register
        );
        Ok(decode_operation_status(register))
    }
}

impl std::fmt::Debug for Hp4284a {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hp4284a")
            .field("device", &self.device)
            .field("mode", &self.mode)
            .field("correction", &self.correction)
            .field("query_enabled", &self.query_enabled)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpib::{IbErr, MockBus, MockDevice};

    const ADDRESS: u8 = 17;

    async fn open_meter() -> (Hp4284a, MockBus, MockDevice) {
        let bus = MockBus::new();
        let mock = bus.attach(ADDRESS, "HEWLETT-PACKARD,4284A,0,REV01.20");
        let mut meter =
            Hp4284a::new(Box::new(bus.clone()), 0, ADDRESS).with_settle_delay(Duration::ZERO);
        meter.open().await.unwrap();
        mock.clear_log();
        (meter, bus, mock)
    }

    #[tokio::test]
    async fn test_open_runs_init_sequence() {
        let bus = MockBus::new();
        let mock = bus.attach(ADDRESS, "HEWLETT-PACKARD,4284A,0,REV01.20");
        let mut meter = Hp4284a::new(Box::new(bus.clone()), 0, ADDRESS)
            .with_settle_delay(Duration::ZERO)
            .with_averages(12);
        meter.open().await.unwrap();

        assert_eq!(mock.commands(), Hp4284a::init_sequence(12));
        assert!(mock.raw_writes().iter().all(|w| w.ends_with("\r\n")));
        assert_eq!(meter.mode(), Some(ImpedanceMode::CpRp));
    }

    #[tokio::test]
    async fn test_init_failure_names_step() {
        let bus = MockBus::new();
        let mock = bus.attach(ADDRESS, "HEWLETT-PACKARD,4284A,0,REV01.20");
        mock.fail_on("BIAS:STAT", IbErr::Ebus);
        let mut meter =
            Hp4284a::new(Box::new(bus.clone()), 0, ADDRESS).with_settle_delay(Duration::ZERO);

        match meter.open().await.unwrap_err() {
            DaqError::ConfigurationAbort { step, .. } => assert_eq!(step, "BIAS:STAT OFF"),
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(mock.commands().len(), 7);
        assert!(meter.is_open());
    }

    #[tokio::test]
    async fn test_invalid_mode_touches_nothing() {
        let (mut meter, _bus, mock) = open_meter().await;
        assert!(matches!(
            meter.set_mode(42).await,
            Err(DaqError::InvalidMode(42))
        ));
        assert!(mock.commands().is_empty());
    }

    #[tokio::test]
    async fn test_set_mode_by_code() {
        let (mut meter, _bus, mock) = open_meter().await;
        meter.set_mode(8).await.unwrap();
        assert_eq!(mock.commands(), vec!["FUNC:IMP:TYPE CSD".to_string()]);
        assert_eq!(meter.mode(), Some(ImpedanceMode::CsD));
    }

    #[tokio::test]
    async fn test_frequency_and_amplitude_commands() {
        let (mut meter, _bus, mock) = open_meter().await;
        mock.reply_to("FREQ?", "+1.00000E+03\n");
        mock.reply_to("VOLT?", "+2.00000E+00\n");

        meter.set_frequency(1000.0).await.unwrap();
        meter.set_amplitude(2.0).await.unwrap();
        assert_eq!(meter.frequency().await.unwrap(), 1000.0);
        assert_eq!(meter.amplitude().await.unwrap(), 2.0);
        assert_eq!(
            mock.commands(),
            vec!["FREQ 1000 HZ", "VOLT 2 V", "FREQ?", "VOLT?"]
        );
    }

    #[tokio::test]
    async fn test_averages_round_trip() {
        let (mut meter, _bus, mock) = open_meter().await;
        mock.reply_to("APER?", "LONG,32\n");
        meter.set_averages(32).await.unwrap();
        assert_eq!(meter.averages().await.unwrap(), 32);
        assert!(meter.set_averages(0).await.is_err());
        assert_eq!(mock.commands(), vec!["APER LONG,32", "APER?"]);
    }

    #[tokio::test]
    async fn test_trigger_mode_sequences() {
        let (mut meter, _bus, mock) = open_meter().await;
        meter.enable_query().await.unwrap();
        assert!(meter.is_query_enabled());
        meter.query_values().await.unwrap();
        meter.disable_query().await.unwrap();
        assert!(!meter.is_query_enabled());

        assert_eq!(
            mock.commands(),
            vec![
                "*CLS",
                "TRIG:SOUR BUS",
                "INIT:CONT OFF",
                "STAT:OPER:ENAB 16",
                "*SRE 128",
                "TRIG",
                "STAT:OPER:ENAB 0",
                "*SRE 0",
                "*CLS",
                "TRIG:SOUR INT",
                "INIT:CONT ON",
            ]
        );
    }

    #[tokio::test]
    async fn test_failed_disable_keeps_bus_triggering_flagged() {
        let (mut meter, _bus, mock) = open_meter().await;
        meter.enable_query().await.unwrap();
        mock.fail_once("*SRE 0", IbErr::Eabo);

        assert!(meter.disable_query().await.is_err());
        assert!(meter.is_query_enabled());

        mock.clear_log();
        meter.disable_query().await.unwrap();
        assert!(!meter.is_query_enabled());
        assert_eq!(mock.commands().first().map(String::as_str), Some("STAT:OPER:ENAB 0"));
        assert_eq!(mock.commands().len(), 5);
    }

    #[tokio::test]
    async fn test_partial_enable_still_counts_as_enabled() {
        let (mut meter, _bus, mock) = open_meter().await;
        mock.fail_once("STAT:OPER:ENAB 16", IbErr::Ebus);

        assert!(meter.enable_query().await.is_err());
        assert!(meter.is_query_enabled());
    }

    #[tokio::test]
    async fn test_correction_state_commands() {
        let (mut meter, _bus, mock) = open_meter().await;
        meter.set_correction_state(true, false).await.unwrap();
        assert_eq!(
            mock.commands(),
            vec!["CORR:OPEN:STATE ON", "CORR:SHORT:STATE OFF"]
        );
    }

    #[tokio::test]
    async fn test_check_notify_without_request() {
        let (mut meter, _bus, mock) = open_meter().await;
        mock.queue_status_byte(0x00);
        assert_eq!(meter.check_notify().await.unwrap(), None);
        assert!(mock.commands().is_empty());
    }

    #[tokio::test]
    async fn test_check_notify_measurement_complete() {
        let (mut meter, _bus, mock) = open_meter().await;
        mock.queue_status_byte(0xC0);
        mock.reply_to("STAT:OPER?", "+16\n");
        assert_eq!(
            meter.check_notify().await.unwrap(),
            Some(InstrumentEvent::MeasurementComplete)
        );
        assert_eq!(mock.commands(), vec!["STAT:OPER?"]);
    }

    #[tokio::test]
    async fn test_check_notify_serial_poll_error() {
        let (mut meter, _bus, mock) = open_meter().await;
        mock.fail_next_serial_poll(IbErr::Estb);
        let err = meter.check_notify().await.unwrap_err();
        assert_eq!(err.bus_error().map(|e| e.error), Some(IbErr::Estb));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (mut meter, bus, _mock) = open_meter().await;
        meter.close().await.unwrap();
        meter.close().await.unwrap();
        assert!(!meter.is_open());
        assert_eq!(bus.offline_calls(), 1);
    }

    #[tokio::test]
    async fn test_commands_require_open_session() {
        let bus = MockBus::new();
        bus.attach(ADDRESS, "HEWLETT-PACKARD,4284A,0,REV01.20");
        let mut meter = Hp4284a::new(Box::new(bus), 0, ADDRESS);
        assert!(matches!(meter.fetch().await, Err(DaqError::NotConnected)));
    }
}
