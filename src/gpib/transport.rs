//! Command/response transport over a [`GpibBus`].
//!
//! Commands are ASCII strings. The caller supplies the terminator the
//! instrument expects (the HP4284A and the LakeShore 330 both use `\r\n`);
//! nothing is appended here. Responses are reassembled from fixed-size reads
//! until the talker signals END or a read comes back short.

use super::{DeviceHandle, GpibBus, StatusWord};
use crate::error::AppResult;
use tracing::{debug, error};

/// Line terminator used by both instruments on the bench.
pub const TERMINATOR: &str = "\r\n";

/// Size of one `ibrd` chunk.
pub const READ_CHUNK: usize = 2000;

/// True iff the status word has the ERR bit set.
pub fn is_error(status: StatusWord) -> bool {
    status.is_error()
}

/// Writes `command` verbatim and returns the driver status word.
///
/// A failed write is logged with its decoded registers and returned as
/// [`crate::error::DaqError::Bus`]; it is never retried.
pub async fn gpib_write(
    bus: &mut dyn GpibBus,
    device: DeviceHandle,
    command: &str,
) -> AppResult<StatusWord> {
    let shown = command.trim_end();
    debug!("[{}] write: {}", device, shown);

    match bus.write(device, command.as_bytes()).await {
        Ok(status) => Ok(status),
        Err(e) => {
            let e = e.within(format!("write '{}'", shown));
            error!("[{}] {}", device, e);
            Err(e.into())
        }
    }
}

/// Reads a complete response, concatenating chunks until END or a short read.
pub async fn gpib_read(bus: &mut dyn GpibBus, device: DeviceHandle) -> AppResult<String> {
    let mut response = String::new();
    let mut buffer = [0u8; READ_CHUNK];

    loop {
        let (count, status) = match bus.read(device, &mut buffer).await {
            Ok((count, status)) => (count.min(READ_CHUNK), status),
            Err(e) => {
                let e = e.within("read");
                error!("[{}] {}", device, e);
                return Err(e.into());
            }
        };
        response.push_str(&String::from_utf8_lossy(&buffer[..count]));
        if count < READ_CHUNK || status.contains(StatusWord::END) {
            break;
        }
    }

    debug!("[{}] read: {}", device, response.trim_end());
    Ok(response)
}

/// Writes `command` and reads the full response.
pub async fn gpib_query(
    bus: &mut dyn GpibBus,
    device: DeviceHandle,
    command: &str,
) -> AppResult<String> {
    gpib_write(bus, device, command).await?;
    gpib_read(bus, device).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DaqError;
    use crate::gpib::{IbErr, MockBus};
    use std::time::Duration;

    async fn open(bus: &mut MockBus, address: u8) -> DeviceHandle {
        bus.open_device(0, address, Duration::from_secs(1))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_read_reassembles_long_response() {
        let mut bus = MockBus::new();
        let device = bus.attach(5, "LONG");
        let long = "x".repeat(READ_CHUNK * 2 + 17);
        device.reply_to("DUMP?", &long);

        let handle = open(&mut bus, 5).await;
        let response = gpib_query(&mut bus, handle, "DUMP?\r\n").await.unwrap();
        assert_eq!(response.len(), READ_CHUNK * 2 + 17);
        assert_eq!(bus.read_calls(), 3);
    }

    #[tokio::test]
    async fn test_read_of_exactly_one_chunk_stops_on_end() {
        let mut bus = MockBus::new();
        let device = bus.attach(5, "LONG");
        let full = "y".repeat(READ_CHUNK);
        device.reply_to("DUMP?", &full);

        let handle = open(&mut bus, 5).await;
        let response = gpib_query(&mut bus, handle, "DUMP?\r\n").await.unwrap();
        assert_eq!(response, full);
        assert_eq!(bus.read_calls(), 1);
    }

    #[tokio::test]
    async fn test_write_error_is_decoded() {
        let mut bus = MockBus::new();
        let device = bus.attach(5, "FAIL");
        device.fail_on("TRIG", IbErr::Eabo);

        let handle = open(&mut bus, 5).await;
        let err = gpib_write(&mut bus, handle, "TRIG\r\n").await.unwrap_err();
        match err {
            DaqError::Bus(bus_err) => {
                assert!(is_error(bus_err.status));
                assert_eq!(bus_err.error, IbErr::Eabo);
                assert!(bus_err.context.contains("TRIG"));
                assert!(bus_err.message.contains("EABO"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_write_passes_terminator_through() {
        let mut bus = MockBus::new();
        let device = bus.attach(5, "RAW");
        let handle = open(&mut bus, 5).await;
        gpib_write(&mut bus, handle, "*CLS\r\n").await.unwrap();
        assert_eq!(device.raw_writes(), vec!["*CLS\r\n".to_string()]);
        assert_eq!(device.commands(), vec!["*CLS".to_string()]);
    }
}
