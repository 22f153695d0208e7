//! Bench discovery.
//!
//! Resets the bus, finds every listener at primary addresses 1-30 and asks
//! each one for its identity. Only the two instrument types this crate drives
//! are recognised; anything else is reported as [`InstrumentKind::Unknown`].

use crate::error::{AppResult, DaqError};
use crate::gpib::GpibBus;
use serde::Serialize;
use std::fmt;
use tracing::{debug, info};

/// Primary addresses probed for listeners.
pub const PRIMARY_ADDRESSES: std::ops::RangeInclusive<u8> = 1..=30;

const IDN_BUFFER: usize = 256;

/// What was found at an address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum InstrumentKind {
    /// HP/Agilent 4284A LCR meter.
    LcrMeter,
    /// LakeShore 330 temperature controller.
    Thermostat,
    /// A listener this crate does not drive.
    Unknown,
}

impl fmt::Display for InstrumentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::LcrMeter => "HP4284A LCR meter",
            Self::Thermostat => "LakeShore 330 temperature controller",
            Self::Unknown => "unrecognised instrument",
        };
        f.write_str(name)
    }
}

/// A listener found on the bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiscoveredInstrument {
    /// Primary address.
    pub address: u8,
    /// `*IDN?` reply, trimmed.
    pub identity: String,
    /// Classification of `identity`.
    pub kind: InstrumentKind,
}

/// Classifies an `*IDN?` response.
pub fn classify(identity: &str) -> InstrumentKind {
    let upper = identity.to_ascii_uppercase();
    if upper.contains("MODEL330") {
        InstrumentKind::Thermostat
    } else if upper.contains("4284A") {
        InstrumentKind::LcrMeter
    } else {
        InstrumentKind::Unknown
    }
}

/// First instrument of `kind` in a discovery result.
pub fn first_of(
    instruments: &[DiscoveredInstrument],
    kind: InstrumentKind,
) -> Option<&DiscoveredInstrument> {
    instruments.iter().find(|instrument| instrument.kind == kind)
}

/// Identifies every listener on `board`.
///
/// Any bus error aborts discovery.
pub async fn discover(bus: &mut dyn GpibBus, board: u32) -> AppResult<Vec<DiscoveredInstrument>> {
    bus.interface_clear(board)
        .await
        .map_err(|e| e.within("SendIFC"))?;
    bus.clear_all(board)
        .await
        .map_err(|e| e.within("DevClearList"))?;

    let candidates: Vec<u8> = PRIMARY_ADDRESSES.collect();
    let listeners = bus
        .find_listeners(board, &candidates)
        .await
        .map_err(|e| e.within("FindLstn"))?;
    info!("Found {} instruments on GPIB{}", listeners.len(), board);

    let mut found = Vec::with_capacity(listeners.len());
    for address in listeners {
        bus.send(board, address, b"*IDN?")
            .await
            .map_err(|e| e.within(format!("*IDN? to address {}", address)))?;

        let mut buffer = [0u8; IDN_BUFFER];
        let count = bus
            .receive(board, address, &mut buffer)
            .await
            .map_err(|e| e.within(format!("Receive from address {}", address)))?;
        let identity = String::from_utf8_lossy(&buffer[..count.min(IDN_BUFFER)])
            .trim()
            .to_string();

        let kind = classify(&identity);
        debug!("Address {}: '{}' ({})", address, identity, kind);
        found.push(DiscoveredInstrument {
            address,
            identity,
            kind,
        });
    }

    Ok(found)
}

/// Address of the LCR meter in a discovery result, or the error the boundary
/// layer reports when it is missing.
pub fn require_lcr_meter(instruments: &[DiscoveredInstrument], board: u32) -> AppResult<u8> {
    first_of(instruments, InstrumentKind::LcrMeter)
        .map(|instrument| instrument.address)
        .ok_or(DaqError::DeviceNotPresent { board, address: 0 })
}
