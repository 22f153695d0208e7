//! One addressed device on the bus.
//!
//! `GpibDevice` owns a boxed [`GpibBus`] and the unit descriptor obtained from
//! it, and implements the life cycle shared by every instrument on the bench:
//!
//! 1. `ibdev` opens a descriptor (this succeeds even with nothing connected)
//! 2. `ibln` probes for a listener; when none answers the descriptor is taken
//!    offline again and [`DaqError::DeviceNotPresent`] is returned
//! 3. `ibclr` clears the device
//! 4. a fixed settle delay lets the instrument finish its clear
//!
//! Commands are written with the `\r\n` terminator appended here, so the
//! instrument layers deal in bare command strings.

use super::transport::{gpib_query, gpib_read, gpib_write, TERMINATOR};
use super::{DeviceHandle, GpibBus, StatusWord};
use crate::error::{AppResult, DaqError};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default I/O timeout (`T30s`).
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Delay after the device clear before the first command.
pub const DEFAULT_SETTLE: Duration = Duration::from_secs(1);

/// An addressed device and its (optional) open descriptor.
pub struct GpibDevice {
    bus: Box<dyn GpibBus>,
    board: u32,
    address: u8,
    handle: Option<DeviceHandle>,
    timeout: Duration,
    settle: Duration,
    label: &'static str,
}

impl GpibDevice {
    /// Creates a closed device at `board`/`address`.
    pub fn new(bus: Box<dyn GpibBus>, board: u32, address: u8, label: &'static str) -> Self {
        Self {
            bus,
            board,
            address,
            handle: None,
            timeout: DEFAULT_TIMEOUT,
            settle: DEFAULT_SETTLE,
            label,
        }
    }

    /// Sets the I/O timeout used when the descriptor is opened.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the delay between the device clear and the first command.
    pub fn with_settle_delay(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    /// Board index.
    pub fn board(&self) -> u32 {
        self.board
    }

    /// Primary address.
    pub fn address(&self) -> u8 {
        self.address
    }

    /// Name used in log lines.
    pub fn label(&self) -> &'static str {
        self.label
    }

    /// True between a successful `open` and `close`.
    pub fn is_open(&self) -> bool {
        self.handle.is_some()
    }

    /// The open descriptor, or [`DaqError::NotConnected`].
    pub fn handle(&self) -> AppResult<DeviceHandle> {
        self.handle.ok_or(DaqError::NotConnected)
    }

    /// Opens, probes and clears the device, then waits for it to settle.
    ///
    /// Opening an already open device is a no-op.
    pub async fn open(&mut self) -> AppResult<()> {
        if self.handle.is_some() {
            return Ok(());
        }

        info!(
            "Opening {} at GPIB{}::{} via {}",
            self.label,
            self.board,
            self.address,
            self.bus.describe()
        );

        let handle = self
            .bus
            .open_device(self.board, self.address, self.timeout)
            .await?;

        let present = match self.bus.find_listener(self.board, self.address).await {
            Ok(present) => present,
            Err(e) => {
                self.offline(handle).await;
                return Err(e.within("ibln").into());
            }
        };
        if !present {
            warn!(
                "No listener for {} at GPIB{}::{}",
                self.label, self.board, self.address
            );
            self.offline(handle).await;
            return Err(DaqError::DeviceNotPresent {
                board: self.board,
                address: self.address,
            });
        }

        if let Err(e) = self.bus.clear(handle).await {
            self.offline(handle).await;
            return Err(e.within("ibclr").into());
        }

        tokio::time::sleep(self.settle).await;
        self.handle = Some(handle);
        debug!("{} open as {}", self.label, handle);
        Ok(())
    }

    async fn offline(&mut self, handle: DeviceHandle) {
        if let Err(e) = self.bus.go_offline(handle).await {
            warn!("{}: ibonl failed: {}", self.label, e);
        }
    }

    /// Writes one command, appending the line terminator.
    pub async fn write(&mut self, command: &str) -> AppResult<StatusWord> {
        let handle = self.handle()?;
        let line = format!("{}{}", command, TERMINATOR);
        gpib_write(self.bus.as_mut(), handle, &line).await
    }

    /// Reads one complete response.
    pub async fn read(&mut self) -> AppResult<String> {
        let handle = self.handle()?;
        gpib_read(self.bus.as_mut(), handle).await
    }

    /// Writes a command and reads its response.
    pub async fn query(&mut self, command: &str) -> AppResult<String> {
        let handle = self.handle()?;
        let line = format!("{}{}", command, TERMINATOR);
        gpib_query(self.bus.as_mut(), handle, &line).await
    }

    /// Serial-polls the device.
    pub async fn serial_poll(&mut self) -> AppResult<u8> {
        let handle = self.handle()?;
        self.bus
            .serial_poll(handle)
            .await
            .map_err(|e| e.within("ibrsp").into())
    }

    /// Writes each command in order, stopping at the first failure.
    ///
    /// A failed step is reported as [`DaqError::ConfigurationAbort`] naming the
    /// command; earlier commands stay in effect on the instrument.
    pub async fn run_sequence(&mut self, commands: &[String]) -> AppResult<()> {
        for command in commands {
            match self.write(command).await {
                Ok(_) => {}
                Err(DaqError::Bus(source)) => {
                    return Err(DaqError::ConfigurationAbort {
                        step: command.clone(),
                        source,
                    });
                }
                Err(other) => return Err(other),
            }
        }
        Ok(())
    }

    /// Takes the descriptor offline. Safe to call on a closed device.
    pub async fn close(&mut self) -> AppResult<()> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        self.bus
            .go_offline(handle)
            .await
            .map_err(|e| e.within("ibonl"))?;
        debug!("{} ({}) offline", self.label, handle);
        Ok(())
    }
}

impl std::fmt::Debug for GpibDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpibDevice")
            .field("label", &self.label)
            .field("board", &self.board)
            .field("address", &self.address)
            .field("handle", &self.handle)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpib::{IbErr, MockBus};

    fn device(bus: &MockBus, address: u8) -> GpibDevice {
        GpibDevice::new(Box::new(bus.clone()), 0, address, "test")
            .with_settle_delay(Duration::ZERO)
    }

    #[tokio::test]
    async fn test_open_absent_device_goes_offline() {
        let bus = MockBus::new();
        let mut dev = device(&bus, 9);

        let err = dev.open().await.unwrap_err();
        assert!(matches!(
            err,
            DaqError::DeviceNotPresent {
                board: 0,
                address: 9
            }
        ));
        assert!(!dev.is_open());
        assert_eq!(bus.offline_calls(), 1);
        assert_eq!(bus.open_handles(), 0);
    }

    #[tokio::test]
    async fn test_open_failure_is_bus_error() {
        let bus = MockBus::new();
        bus.attach(9, "X");
        bus.fail_next_open(IbErr::Eneb);
        let mut dev = device(&bus, 9);

        let err = dev.open().await.unwrap_err();
        assert_eq!(err.bus_error().map(|e| e.error), Some(IbErr::Eneb));
        assert_eq!(bus.offline_calls(), 0);
    }

    #[tokio::test]
    async fn test_open_clears_device() {
        let bus = MockBus::new();
        let mock = bus.attach(9, "X");
        let mut dev = device(&bus, 9);
        dev.open().await.unwrap();
        assert_eq!(mock.clears(), 1);
        assert!(dev.is_open());
    }

    #[tokio::test]
    async fn test_write_appends_terminator() {
        let bus = MockBus::new();
        let mock = bus.attach(9, "X");
        let mut dev = device(&bus, 9);
        dev.open().await.unwrap();
        dev.write("*CLS").await.unwrap();
        assert_eq!(mock.raw_writes(), vec!["*CLS\r\n".to_string()]);
    }

    #[tokio::test]
    async fn test_write_requires_open_session() {
        let bus = MockBus::new();
        bus.attach(9, "X");
        let mut dev = device(&bus, 9);
        assert!(matches!(
            dev.write("*CLS").await,
            Err(DaqError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_run_sequence_stops_at_failed_step() {
        let bus = MockBus::new();
        let mock = bus.attach(9, "X");
        mock.fail_on("B", IbErr::Ebus);
        let mut dev = device(&bus, 9);
        dev.open().await.unwrap();

        let steps: Vec<String> = ["A", "B", "C"].iter().map(|s| s.to_string()).collect();
        let err = dev.run_sequence(&steps).await.unwrap_err();
        match err {
            DaqError::ConfigurationAbort { step, source } => {
                assert_eq!(step, "B");
                assert_eq!(source.error, IbErr::Ebus);
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(mock.commands(), vec!["A".to_string()]);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let bus = MockBus::new();
        bus.attach(9, "X");
        let mut dev = device(&bus, 9);
        dev.open().await.unwrap();
        dev.close().await.unwrap();
        dev.close().await.unwrap();
        assert_eq!(bus.offline_calls(), 1);
    }
}
