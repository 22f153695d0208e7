//! Instrument sessions on the GPIB bench.
//!
//! - [`hp4284a`] - HP/Agilent 4284A precision LCR meter (the measuring device)
//! - [`lakeshore330`] - LakeShore 330 temperature controller (optional)
//! - [`discovery`] - finds and identifies both on a board

pub mod discovery;
pub mod hp4284a;
pub mod lakeshore330;

pub use discovery::{discover, DiscoveredInstrument, InstrumentKind};
pub use hp4284a::{CorrectionKind, Hp4284a, ImpedanceMode};
pub use lakeshore330::{LakeShore330, ThermostatStatus};

use crate::error::{AppResult, DaqError};

/// Extracts the numeric payload of a query response.
///
/// Responses may carry a keyword prefix (`LONG,7`) or a trailing echo, so the
/// first comma- or whitespace-separated token that parses as a number wins.
pub fn parse_numeric(what: &str, response: &str) -> AppResult<f64> {
    response
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|token| !token.is_empty())
        .find_map(|token| token.parse::<f64>().ok())
        .ok_or_else(|| DaqError::parse(what, response.trim()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_numeric_plain() {
        assert_eq!(parse_numeric("FREQ?", "+1.00000E+03\n").unwrap(), 1000.0);
    }

    #[test]
    fn test_parse_numeric_skips_keyword() {
        assert_eq!(parse_numeric("APER?", "LONG,7\n").unwrap(), 7.0);
    }

    #[test]
    fn test_parse_numeric_trailing_echo() {
        assert_eq!(parse_numeric("VOLT?", "2.0 VOLT?\r\n").unwrap(), 2.0);
    }

    #[test]
    fn test_parse_numeric_rejects_garbage() {
        assert!(matches!(
            parse_numeric("SDAT?", "ERR\n"),
            Err(DaqError::Parse { .. })
        ));
    }
}
