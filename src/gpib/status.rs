//! GPIB status word and driver error codes.
//!
//! Every driver call reports three registers: the status word (`ibsta`), an
//! error code (`iberr`, meaningful only when the ERR bit is set) and the byte
//! count of the last transfer (`ibcnt`). The bit values and error numbers are
//! the ones shared by NI-488.2 and linux-gpib.

use bitflags::bitflags;
use std::fmt;

bitflags! {
    /// The `ibsta` status word.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct StatusWord: u16 {
        /// Error detected.
        const ERR = 0x8000;
        /// Timeout.
        const TIMO = 0x4000;
        /// EOI or EOS detected.
        const END = 0x2000;
        /// SRQ detected by the controller.
        const SRQI = 0x1000;
        /// Device requesting service.
        const RQS = 0x0800;
        /// I/O completed.
        const CMPL = 0x0100;
        /// Lockout state.
        const LOK = 0x0080;
        /// Remote state.
        const REM = 0x0040;
        /// Controller-in-charge.
        const CIC = 0x0020;
        /// Attention asserted.
        const ATN = 0x0010;
        /// Talker active.
        const TACS = 0x0008;
        /// Listener active.
        const LACS = 0x0004;
        /// Device trigger state.
        const DTAS = 0x0002;
        /// Device clear state.
        const DCAS = 0x0001;
    }
}

impl StatusWord {
    /// True iff the ERR bit is set.
    pub const fn is_error(self) -> bool {
        self.contains(Self::ERR)
    }
}

/// Driver error codes (`iberr`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IbErr {
    /// System error.
    Edvr,
    /// Function requires GPIB board to be CIC.
    Ecic,
    /// No listeners on the bus.
    Enol,
    /// Board not addressed correctly.
    Eadr,
    /// Invalid argument.
    Earg,
    /// Board is not system controller.
    Esac,
    /// I/O operation aborted (timeout).
    Eabo,
    /// Non-existent board.
    Eneb,
    /// DMA error.
    Edma,
    /// Asynchronous I/O in progress.
    Eoip,
    /// No capability for operation.
    Ecap,
    /// File system error.
    Efso,
    /// Command error during device call.
    Ebus,
    /// Serial poll status byte lost.
    Estb,
    /// SRQ stuck on.
    Esrq,
    /// Table overflow.
    Etab,
    /// Code not known to this crate.
    Other(i32),
}

impl IbErr {
    /// Maps a raw `iberr` value.
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => Self::Edvr,
            1 => Self::Ecic,
            2 => Self::Enol,
            3 => Self::Eadr,
            4 => Self::Earg,
            5 => Self::Esac,
            6 => Self::Eabo,
            7 => Self::Eneb,
            8 => Self::Edma,
            10 => Self::Eoip,
            11 => Self::Ecap,
            12 => Self::Efso,
            14 => Self::Ebus,
            15 => Self::Estb,
            16 => Self::Esrq,
            20 => Self::Etab,
            other => Self::Other(other),
        }
    }

    /// Raw `iberr` value.
    pub fn code(self) -> i32 {
        match self {
            Self::Edvr => 0,
            Self::Ecic => 1,
            Self::Enol => 2,
            Self::Eadr => 3,
            Self::Earg => 4,
            Self::Esac => 5,
            Self::Eabo => 6,
            Self::Eneb => 7,
            Self::Edma => 8,
            Self::Eoip => 10,
            Self::Ecap => 11,
            Self::Efso => 12,
            Self::Ebus => 14,
            Self::Estb => 15,
            Self::Esrq => 16,
            Self::Etab => 20,
            Self::Other(code) => code,
        }
    }

    /// Short mnemonic with its meaning, e.g. `ENOL <No Listener>`.
    pub fn describe(self) -> Option<&'static str> {
        Some(match self {
            Self::Edvr => "EDVR <DOS Error>",
            Self::Ecic => "ECIC <Not CIC>",
            Self::Enol => "ENOL <No Listener>",
            Self::Eadr => "EADR <Address error>",
            Self::Earg => "EARG <Invalid argument>",
            Self::Esac => "ESAC <Not Sys Ctrlr>",
            Self::Eabo => "EABO <Op. aborted>",
            Self::Eneb => "ENEB <No GPIB board>",
            Self::Edma => "EDMA <DMA error>",
            Self::Eoip => "EOIP <Async I/O in prg>",
            Self::Ecap => "ECAP <No capability>",
            Self::Efso => "EFSO <File sys. error>",
            Self::Ebus => "EBUS <Command error>",
            Self::Estb => "ESTB <Status byte lost>",
            Self::Esrq => "ESRQ <SRQ stuck on>",
            Self::Etab => "ETAB <Table Overflow>",
            Self::Other(_) => return None,
        })
    }
}

impl fmt::Display for IbErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.describe() {
            Some(text) => f.write_str(text),
            None => write!(f, "error {}", self.code()),
        }
    }
}

/// Decodes the three driver registers into a diagnostic line.
///
/// ```
/// use dielectric_daq::gpib::status::{err_msg, IbErr, StatusWord};
///
/// let text = err_msg(StatusWord::ERR | StatusWord::CMPL, IbErr::Enol, 0);
/// assert_eq!(
///     text,
///     "status = 0x8100 < ERR CMPL> error = 0x0002 ENOL <No Listener> count = 0x0000"
/// );
/// ```
pub fn err_msg(status: StatusWord, error: IbErr, count: usize) -> String {
    let mut text = format!("status = 0x{:04x} <", status.bits());
    for (name, _) in status.iter_names() {
        text.push(' ');
        text.push_str(name);
    }
    text.push('>');

    if status.is_error() {
        text.push_str(&format!(" error = 0x{:04x}", error.code()));
        if let Some(description) = error.describe() {
            text.push(' ');
            text.push_str(description);
        }
    }

    text.push_str(&format!(" count = 0x{:04x}", count));
    text
}
