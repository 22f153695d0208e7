//! GPIB (IEEE-488) bus access.
//!
//! The [`GpibBus`] trait mirrors the small set of driver calls the instruments
//! need (`ibdev`, `ibln`, `ibclr`, `ibwrt`, `ibrd`, `ibrsp`, `ibonl` and the
//! board-level discovery calls). Each call either succeeds or yields a
//! [`BusError`] carrying the raw status, error and count registers.
//!
//! Implementations:
//! - [`mock::MockBus`] - scripted in-memory bus for tests and simulation
//! - `visa::VisaBus` - VISA library backend (feature `instrument_visa`)
//!
//! Higher layers never call the trait directly for command traffic; they go
//! through [`transport`] (terminator handling, multi-chunk reads, logging)
//! and [`device::GpibDevice`] (open/probe/clear/close life cycle).

pub mod device;
pub mod mock;
pub mod simulator;
pub mod status;
pub mod transport;
#[cfg(feature = "instrument_visa")]
pub mod visa;

pub use device::GpibDevice;
pub use mock::{MockBus, MockDevice};
pub use status::{IbErr, StatusWord};

use crate::error::BusError;
use async_trait::async_trait;
use std::fmt;
use std::time::Duration;

/// Result of a raw driver call.
pub type IbResult<T> = std::result::Result<T, BusError>;

/// Driver-assigned unit descriptor for one device on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceHandle(i32);

impl DeviceHandle {
    /// Wraps a unit descriptor returned by the driver.
    pub const fn new(ud: i32) -> Self {
        Self(ud)
    }

    /// Raw unit descriptor.
    pub const fn raw(self) -> i32 {
        self.0
    }
}

impl fmt::Display for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ud{}", self.0)
    }
}

/// Raw GPIB driver primitives.
///
/// The bus is half-duplex and has no command queue: callers must never issue a
/// second call on the same device before the first one has returned. The
/// instrument layer guarantees this by owning the bus exclusively.
#[async_trait]
pub trait GpibBus: Send {
    /// Opens a device descriptor (`ibdev`). Succeeds even when nothing is
    /// connected at `address`; use [`GpibBus::find_listener`] to probe.
    async fn open_device(
        &mut self,
        board: u32,
        address: u8,
        timeout: Duration,
    ) -> IbResult<DeviceHandle>;

    /// Checks whether a listener answers at `address` (`ibln`).
    async fn find_listener(&mut self, board: u32, address: u8) -> IbResult<bool>;

    /// Sends Selected Device Clear (`ibclr`).
    async fn clear(&mut self, device: DeviceHandle) -> IbResult<()>;

    /// Writes raw bytes (`ibwrt`) and returns the resulting status word.
    async fn write(&mut self, device: DeviceHandle, data: &[u8]) -> IbResult<StatusWord>;

    /// Reads at most `buffer.len()` bytes (`ibrd`).
    ///
    /// Returns the byte count and the status word; END is set when the
    /// talker finished the message with this transfer.
    async fn read(
        &mut self,
        device: DeviceHandle,
        buffer: &mut [u8],
    ) -> IbResult<(usize, StatusWord)>;

    /// Serial-polls the device (`ibrsp`) and returns its status byte.
    async fn serial_poll(&mut self, device: DeviceHandle) -> IbResult<u8>;

    /// Takes the descriptor offline (`ibonl(ud, 0)`).
    async fn go_offline(&mut self, device: DeviceHandle) -> IbResult<()>;

    /// Pulses Interface Clear on the board (`SendIFC`).
    async fn interface_clear(&mut self, board: u32) -> IbResult<()>;

    /// Sends Universal Device Clear to every device (`DevClearList(NOADDR)`).
    async fn clear_all(&mut self, board: u32) -> IbResult<()>;

    /// Returns the subset of `addresses` that have a listener (`FindLstn`).
    async fn find_listeners(&mut self, board: u32, addresses: &[u8]) -> IbResult<Vec<u8>>;

    /// Sends bytes to a primary address with EOI on the last byte (`Send`).
    async fn send(&mut self, board: u32, address: u8, data: &[u8]) -> IbResult<()>;

    /// Receives up to `buffer.len()` bytes from a primary address (`Receive`).
    async fn receive(&mut self, board: u32, address: u8, buffer: &mut [u8]) -> IbResult<usize>;

    /// Short backend description for logs.
    fn describe(&self) -> String;
}
