//! Impedance parameter pairs selectable with `FUNC:IMP:TYPE`.

use crate::error::DaqError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// One of the 20 primary/secondary parameter pairs the meter can display.
///
/// The discriminant is the numeric mode code used by callers that select a
/// mode by index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ImpedanceMode {
    /// Cp-D
    CpD = 0,
    /// Lp-Rp
    LpRp = 1,
    /// Cp-Q
    CpQ = 2,
    /// Ls-D
    LsD = 3,
    /// Cp-G
    CpG = 4,
    /// Ls-Q
    LsQ = 5,
    /// Cp-Rp
    CpRp = 6,
    /// Ls-Rs
    LsRs = 7,
    /// Cs-D
    CsD = 8,
    /// R-X
    Rx = 9,
    /// Cs-Q
    CsQ = 10,
    /// Z-theta (degrees)
    ZThetaDeg = 11,
    /// Cs-Rs
    CsRs = 12,
    /// Z-theta (radians)
    ZThetaRad = 13,
    /// Lp-Q
    LpQ = 14,
    /// G-B
    Gb = 15,
    /// Lp-D
    LpD = 16,
    /// Y-theta (degrees)
    YThetaDeg = 17,
    /// Lp-G
    LpG = 18,
    /// Y-theta (radians)
    YThetaRad = 19,
}

impl ImpedanceMode {
    /// All modes in code order.
    pub const ALL: [Self; 20] = [
        Self::CpD,
        Self::LpRp,
        Self::CpQ,
        Self::LsD,
        Self::CpG,
        Self::LsQ,
        Self::CpRp,
        Self::LsRs,
        Self::CsD,
        Self::Rx,
        Self::CsQ,
        Self::ZThetaDeg,
        Self::CsRs,
        Self::ZThetaRad,
        Self::LpQ,
        Self::Gb,
        Self::LpD,
        Self::YThetaDeg,
        Self::LpG,
        Self::YThetaRad,
    ];

    /// Numeric mode code (0-19).
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Parameter keyword sent after `FUNC:IMP:TYPE`.
    pub fn mnemonic(self) -> &'static str {
        match self {
            Self::CpD => "CPD",
            Self::LpRp => "LPRP",
            Self::CpQ => "CPQ",
            Self::LsD => "LSD",
            Self::CpG => "CPG",
            Self::LsQ => "LSQ",
            Self::CpRp => "CPRP",
            Self::LsRs => "LSRS",
            Self::CsD => "CSD",
            Self::Rx => "RX",
            Self::CsQ => "CSQ",
            Self::ZThetaDeg => "ZTD",
            Self::CsRs => "CSRS",
            Self::ZThetaRad => "ZTR",
            Self::LpQ => "LPQ",
            Self::Gb => "GB",
            Self::LpD => "LPD",
            Self::YThetaDeg => "YTD",
            Self::LpG => "LPG",
            Self::YThetaRad => "YTR",
        }
    }

    /// Full command selecting this mode.
    pub fn command(self) -> String {
        format!("FUNC:IMP:TYPE {}", self.mnemonic())
    }

    /// True for the one pair permittivity can be computed from: parallel
    /// capacitance and dissipation factor.
    pub fn gives_permittivity(self) -> bool {
        self == Self::CpD
    }
}

impl TryFrom<i32> for ImpedanceMode {
    type Error = DaqError;

    fn try_from(code: i32) -> Result<Self, Self::Error> {
        usize::try_from(code)
            .ok()
            .and_then(|index| Self::ALL.get(index).copied())
            .ok_or(DaqError::InvalidMode(code))
    }
}

impl FromStr for ImpedanceMode {
    type Err = DaqError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        if let Some(mode) = Self::ALL
            .iter()
            .find(|mode| mode.mnemonic().eq_ignore_ascii_case(wanted))
        {
            return Ok(*mode);
        }
        match wanted.parse::<i32>() {
            Ok(code) => Self::try_from(code),
            Err(_) => Err(DaqError::Configuration(format!(
                "Unknown impedance mode '{}'",
                wanted
            ))),
        }
    }
}

impl TryFrom<String> for ImpedanceMode {
    type Error = DaqError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ImpedanceMode> for String {
    fn from(mode: ImpedanceMode) -> Self {
        mode.mnemonic().to_string()
    }
}

impl fmt::Display for ImpedanceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mnemonic())
    }
}
