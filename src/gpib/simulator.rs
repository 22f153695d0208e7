//! Simulated instrument bench.
//!
//! Builds a [`MockBus`] whose devices behave like an HP4284A LCR meter and a
//! LakeShore 330 temperature controller closely enough to run discovery,
//! corrections and full frequency sweeps without hardware.
//!
//! The LCR model measures a Debye relaxator: the relative permittivity of the
//! simulated sample is
//!
//! ```text
//! eps(w) = eps_inf + (eps_s - eps_inf) / (1 + i w tau)
//! ```
//!
//! and the reported Cp/D pair is derived from it for a fixed fixture
//! geometry, with a small amount of multiplicative noise.

use super::mock::MockBus;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::f64::consts::PI;
use std::sync::{Arc, Mutex, PoisonError};

/// Identity string of the simulated LCR meter.
pub const LCR_IDENTITY: &str = "HEWLETT-PACKARD,4284A,0,REV01.20";

/// Identity string of the simulated temperature controller.
pub const THERMOSTAT_IDENTITY: &str = "LSCI,MODEL330,0,032301";

/// Reference capacitance of the simulated fixture (100 mm^2, 1 mm).
pub const SIMULATED_C0: f64 = 8.854e-13;

const EPS_STATIC: f64 = 12.0;
const EPS_INFINITY: f64 = 3.0;
const RELAXATION_TIME: f64 = 1.0e-4;
const NOISE: f64 = 0.002;
const CORRECTION_POLLS: u32 = 3;

/// Operation status bits the simulated meter latches.
const OPER_CORRECTION: u16 = 1;
const OPER_MEASUREMENT: u16 = 16;

fn split_command(command: &str) -> (String, &str) {
    match command.trim().split_once(' ') {
        Some((head, arg)) => (head.to_ascii_uppercase(), arg.trim()),
        None => (command.trim().to_ascii_uppercase(), ""),
    }
}

/// Rounds to three significant digits, like the meter's frequency synthesiser.
fn quantize_frequency(hz: f64) -> f64 {
    if hz <= 0.0 {
        return 0.0;
    }
    let digits = 2 - hz.log10().floor() as i32;
    if digits >= 0 {
        let factor = 10f64.powi(digits);
        (hz * factor).round() / factor
    } else {
        let factor = 10f64.powi(-digits);
        (hz / factor).round() * factor
    }
}

struct LcrModel {
    frequency: f64,
    voltage: f64,
    aperture: u32,
    oper_enable: u16,
    oper_event: u16,
    service_enable: u8,
    correction_polls: Option<u32>,
    rng: StdRng,
}

impl LcrModel {
    fn new() -> Self {
        Self {
            frequency: 1000.0,
            voltage: 1.0,
            aperture: 1,
            oper_enable: 0,
            oper_event: 0,
            service_enable: 0,
            correction_polls: None,
            rng: StdRng::from_entropy(),
        }
    }

    fn reading(&mut self) -> (f64, f64) {
        let wt = 2.0 * PI * self.frequency * RELAXATION_TIME;
        let denominator = 1.0 + wt * wt;
        let eps_real = EPS_INFINITY + (EPS_STATIC - EPS_INFINITY) / denominator;
        let eps_imag = (EPS_STATIC - EPS_INFINITY) * wt / denominator;

        let jitter = 1.0 + self.rng.gen_range(-NOISE..NOISE);
        let cp = eps_real * SIMULATED_C0 * jitter;
        let d = eps_imag / eps_real * (1.0 + self.rng.gen_range(-NOISE..NOISE));
        (cp, d)
    }

    fn respond(&mut self, command: &str) -> Option<String> {
        let (head, arg) = split_command(command);
        match head.as_str() {
            "*CLS" => {
                self.oper_event = 0;
                None
            }
            "*SRE" => {
                self.service_enable = arg.parse().unwrap_or(0);
                None
            }
            "STAT:OPER:ENAB" => {
                self.oper_enable = arg.parse().unwrap_or(0);
                None
            }
            "STAT:OPER?" => {
                let event = self.oper_event;
                self.oper_event = 0;
                Some(format!("{}\n", event))
            }
            "FREQ" => {
                let hz = arg
                    .split_whitespace()
                    .next()
                    .and_then(|v| v.parse::<f64>().ok())
                    .unwrap_or(self.frequency);
                self.frequency = quantize_frequency(hz);
                None
            }
            "FREQ?" => Some(format!("{:+.5E}\n", self.frequency)),
            "VOLT" => {
                if let Some(v) = arg.split_whitespace().next().and_then(|v| v.parse().ok()) {
                    self.voltage = v;
                }
                None
            }
            "VOLT?" => Some(format!("{:+.5E}\n", self.voltage)),
            "APER" => {
                if let Some(n) = arg.rsplit(',').next().and_then(|v| v.trim().parse().ok()) {
                    self.aperture = n;
                }
                None
            }
            "APER?" => Some(format!("LONG,{}\n", self.aperture)),
            "TRIG" => {
                self.oper_event |= OPER_MEASUREMENT;
                None
            }
            "CORR:OPEN" | "CORR:SHORT" => {
                self.correction_polls = Some(CORRECTION_POLLS);
                None
            }
            "FETCH?" => {
                let (cp, d) = self.reading();
                Some(format!("{:+.5E},{:+.5E},+0\n", cp, d))
            }
            _ => None,
        }
    }

    fn status_byte(&mut self) -> u8 {
        if let Some(polls) = self.correction_polls {
            if polls == 0 {
                self.correction_polls = None;
                self.oper_event |= OPER_CORRECTION;
            } else {
                self.correction_polls = Some(polls - 1);
            }
        }

        let mut byte = 0u8;
        if self.oper_event & self.oper_enable != 0 {
            byte |= 0x80;
        }
        if byte & self.service_enable != 0 {
            byte |= 0x40;
        }
        byte
    }
}

struct ThermostatModel {
    temperature: f64,
    setpoint: f64,
    range: u8,
    ramping: bool,
    ramp_rate: f64,
    rng: StdRng,
}

impl ThermostatModel {
    fn new() -> Self {
        Self {
            temperature: 295.0,
            setpoint: 295.0,
            range: 0,
            ramping: false,
            ramp_rate: 1.0,
            rng: StdRng::from_entropy(),
        }
    }

    fn advance(&mut self) {
        if self.range == 0 {
            return;
        }
        let step = self.ramp_rate.max(0.1);
        let delta = self.setpoint - self.temperature;
        if delta.abs() <= step {
            self.temperature = self.setpoint;
            self.ramping = false;
        } else {
            self.temperature += step * delta.signum();
        }
    }

    fn respond(&mut self, command: &str) -> Option<String> {
        let (head, arg) = split_command(command);
        match head.as_str() {
            "SDAT?" => {
                self.advance();
                let reading = self.temperature + self.rng.gen_range(-0.01..0.01);
                Some(format!("{:+.2}\n", reading))
            }
            "SETP" => {
                if let Ok(k) = arg.parse() {
                    self.setpoint = k;
                }
                None
            }
            "SETP?" => Some(format!("{:+.2}\n", self.setpoint)),
            "RANG" => {
                self.range = arg.parse().unwrap_or(0);
                None
            }
            "RANG?" => Some(format!("{}\n", self.range)),
            "RAMPR" => {
                if let Ok(rate) = arg.parse() {
                    self.ramp_rate = rate;
                }
                None
            }
            "RAMP" => {
                self.ramping = arg == "1";
                None
            }
            "RAMPS?" => Some(format!("{}\n", u8::from(self.ramping))),
            "*ESR?" => Some("0\n".to_string()),
            _ => None,
        }
    }
}

/// Builds a bench with a simulated LCR meter at `lcr_address` and, when
/// given, a simulated LakeShore 330 at `thermostat_address`.
pub fn simulated_bench(lcr_address: u8, thermostat_address: Option<u8>) -> MockBus {
    let bus = MockBus::new();

    let lcr = bus.attach(lcr_address, LCR_IDENTITY);
    let model = Arc::new(Mutex::new(LcrModel::new()));
    let responder = Arc::clone(&model);
    lcr.respond_with(move |command| {
        responder
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .respond(command)
    });
    lcr.status_with(move || {
        model
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .status_byte()
    });

    if let Some(address) = thermostat_address {
        let thermostat = bus.attach(address, THERMOSTAT_IDENTITY);
        let mut model = ThermostatModel::new();
        thermostat.respond_with(move |command| model.respond(command));
    }

    bus
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpib::GpibBus;
    use std::time::Duration;

    async fn query(bus: &mut MockBus, address: u8, command: &str) -> String {
        bus.send(0, address, format!("{}\r\n", command).as_bytes())
            .await
            .unwrap();
        let mut buffer = [0u8; 256];
        let count = bus.receive(0, address, &mut buffer).await.unwrap();
        String::from_utf8_lossy(&buffer[..count]).trim().to_string()
    }

    #[test]
    fn test_quantize_frequency() {
        assert_eq!(quantize_frequency(20.0), 20.0);
        assert_eq!(quantize_frequency(1280.0), 1280.0);
        assert_eq!(quantize_frequency(10240.0), 10200.0);
        assert_eq!(quantize_frequency(163_840.0), 164_000.0);
    }

    #[tokio::test]
    async fn test_frequency_echo_is_quantized() {
        let mut bus = simulated_bench(17, None);
        bus.send(0, 17, b"FREQ 10240 HZ\r\n").await.unwrap();
        let reply = query(&mut bus, 17, "FREQ?").await;
        let hz: f64 = reply.parse().unwrap();
        assert!((hz - 10200.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_trigger_raises_service_request_when_armed() {
        let mut bus = simulated_bench(17, None);
        let handle = bus
            .open_device(0, 17, Duration::from_secs(1))
            .await
            .unwrap();

        bus.send(0, 17, b"TRIG\r\n").await.unwrap();
        assert_eq!(bus.serial_poll(handle).await.unwrap() & 0x40, 0);

        for command in ["*CLS", "STAT:OPER:ENAB 16", "*SRE 128", "TRIG"] {
            bus.send(0, 17, format!("{}\r\n", command).as_bytes())
                .await
                .unwrap();
        }
        assert_eq!(bus.serial_poll(handle).await.unwrap() & 0x40, 0x40);
        assert_eq!(query(&mut bus, 17, "STAT:OPER?").await, "16");
        assert_eq!(bus.serial_poll(handle).await.unwrap() & 0x40, 0);
    }

    #[tokio::test]
    async fn test_fetch_reports_valid_reading() {
        let mut bus = simulated_bench(17, None);
        let reply = query(&mut bus, 17, "FETCH?").await;
        let fields: Vec<&str> = reply.split(',').collect();
        assert_eq!(fields.len(), 3);
        let cp: f64 = fields[0].parse().unwrap();
        assert!(cp > EPS_INFINITY * SIMULATED_C0 * 0.9);
        assert_eq!(fields[2].parse::<i32>().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_thermostat_follows_setpoint() {
        let mut bus = simulated_bench(17, Some(12));
        assert_eq!(query(&mut bus, 12, "*IDN?").await, THERMOSTAT_IDENTITY);
        bus.send(0, 12, b"SETP 296.00\r\n").await.unwrap();
        bus.send(0, 12, b"RANG 2\r\n").await.unwrap();
        for _ in 0..5 {
            query(&mut bus, 12, "SDAT?").await;
        }
        let t: f64 = query(&mut bus, 12, "SDAT?").await.parse().unwrap();
        assert!((t - 296.0).abs() < 0.05);
    }
}
