//! VISA-backed GPIB bus.
//!
//! Talks to real hardware through an installed VISA library (NI-VISA,
//! Keysight IO Libraries, ...) using the `visa-rs` crate. Every device gets its
//! own `GPIB<board>::<address>::INSTR` session; the resource manager is kept
//! alive for as long as the bus exists since closing it closes every session
//! opened from it.
//!
//! VISA calls are blocking, so each one runs on Tokio's blocking pool.
//!
//! VISA has no direct `FindLstn`; listener probes open a session and issue a
//! Selected Device Clear. Most VISA libraries already refuse the open for an
//! empty address, others fail the clear; either way the address counts as
//! having no listener. Universal Device Clear is likewise approximated by
//! clearing every session this bus has open.

use super::status::{IbErr, StatusWord};
use super::{DeviceHandle, GpibBus, IbResult};
use crate::error::{AppResult, BusError, DaqError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::ffi::CString;
use std::io::{Read, Write};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::debug;
use visa_rs::prelude::*;

type Session = Arc<Mutex<Instrument>>;

/// One descriptor. The VISA session is opened on first use when the
/// instrument was not reachable at `open_device` time.
struct Slot {
    board: u32,
    address: u8,
    timeout: Duration,
    session: Option<Session>,
}

/// GPIB bus over a VISA resource manager.
pub struct VisaBus {
    rm: Arc<DefaultRM>,
    sessions: HashMap<DeviceHandle, Slot>,
    next_handle: i32,
    probe_timeout: Duration,
}

fn resource_name(board: u32, address: u8) -> String {
    format!("GPIB{}::{}::INSTR", board, address)
}

fn visa_error(context: &str, err: impl std::fmt::Display) -> BusError {
    BusError::new(format!("{}: {}", context, err), StatusWord::empty(), IbErr::Edvr, 0)
}

fn io_error(context: &str, err: std::io::Error) -> BusError {
    match err.kind() {
        std::io::ErrorKind::TimedOut => {
            BusError::new(format!("{}: {}", context, err), StatusWord::TIMO, IbErr::Eabo, 0)
        }
        _ => visa_error(context, err),
    }
}

/// Status of a completed `viRead`. The VISA `Read` impl only reports the
/// count, so END is inferred from a short read or a trailing line feed.
fn read_status(chunk: &[u8], capacity: usize) -> StatusWord {
    if chunk.len() < capacity || chunk.last() == Some(&b'\n') {
        StatusWord::CMPL | StatusWord::END
    } else {
        StatusWord::CMPL
    }
}

/// Turns a failed probe step into "no listener".
fn answered<T>(address: u8, step: IbResult<T>) -> Option<T> {
    match step {
        Ok(value) => Some(value),
        Err(e) => {
            debug!("No listener at address {}: {}", address, e);
            None
        }
    }
}

fn lock(session: &Session) -> std::sync::MutexGuard<'_, Instrument> {
    session.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn blocking<T, F>(context: &'static str, f: F) -> IbResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> IbResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| visa_error(context, e))?
}

impl VisaBus {
    /// Opens the default VISA resource manager.
    pub fn new() -> AppResult<Self> {
        let rm = DefaultRM::new().map_err(|e| DaqError::Bus(visa_error("viOpenDefaultRM", e)))?;
        Ok(Self {
            rm: Arc::new(rm),
            sessions: HashMap::new(),
            next_handle: 0,
            probe_timeout: Duration::from_millis(500),
        })
    }

    async fn session(&mut self, device: DeviceHandle, call: &str) -> IbResult<Session> {
        let slot = self
            .sessions
            .get(&device)
            .ok_or_else(|| BusError::new(call, StatusWord::empty(), IbErr::Earg, 0))?;
        if let Some(session) = &slot.session {
            return Ok(Arc::clone(session));
        }
        let (board, address, timeout) = (slot.board, slot.address, slot.timeout);
        let session = self.open_session(board, address, timeout).await?;
        if let Some(slot) = self.sessions.get_mut(&device) {
            slot.session = Some(Arc::clone(&session));
        }
        Ok(session)
    }

    async fn open_session(&self, board: u32, address: u8, timeout: Duration) -> IbResult<Session> {
        let rm = Arc::clone(&self.rm);
        let name = resource_name(board, address);
        blocking("viOpen", move || {
            let c_string = CString::new(name.clone()).map_err(|e| visa_error("viOpen", e))?;
            let resource = VisaString::from(c_string);
            let instrument = rm
                .open(&resource, AccessMode::NO_LOCK, timeout)
                .map_err(|e| visa_error(&format!("viOpen({})", name), e))?;
            Ok(Arc::new(Mutex::new(instrument)))
        })
        .await
    }

    async fn probe(&self, board: u32, address: u8) -> bool {
        let opened = self.open_session(board, address, self.probe_timeout).await;
        let Some(session) = answered(address, opened) else {
            return false;
        };
        let cleared = blocking("viClear", move || {
            lock(&session).clear().map_err(|e| visa_error("viClear", e))
        })
        .await;
        answered(address, cleared).is_some()
    }
}

#[async_trait]
impl GpibBus for VisaBus {
    async fn open_device(
        &mut self,
        board: u32,
        address: u8,
        timeout: Duration,
    ) -> IbResult<DeviceHandle> {
        let session = answered(address, self.open_session(board, address, timeout).await);
        self.next_handle += 1;
        let handle = DeviceHandle::new(self.next_handle);
        debug!(
            "{} {} as {}",
            resource_name(board, address),
            if session.is_some() { "opened" } else { "deferred" },
            handle
        );
        self.sessions.insert(
            handle,
            Slot {
                board,
                address,
                timeout,
                session,
            },
        );
        Ok(handle)
    }

    async fn find_listener(&mut self, board: u32, address: u8) -> IbResult<bool> {
        Ok(self.probe(board, address).await)
    }

    async fn clear(&mut self, device: DeviceHandle) -> IbResult<()> {
        let session = self.session(device, "ibclr").await?;
        blocking("viClear", move || {
            lock(&session).clear().map_err(|e| visa_error("viClear", e))
        })
        .await
    }

    async fn write(&mut self, device: DeviceHandle, data: &[u8]) -> IbResult<StatusWord> {
        let session = self.session(device, "ibwrt").await?;
        let data = data.to_vec();
        blocking("viWrite", move || {
            let mut instrument = lock(&session);
            instrument
                .write_all(&data)
                .map_err(|e| io_error("viWrite", e))?;
            Ok(StatusWord::CMPL | StatusWord::END)
        })
        .await
    }

    async fn read(
        &mut self,
        device: DeviceHandle,
        buffer: &mut [u8],
    ) -> IbResult<(usize, StatusWord)> {
        let session = self.session(device, "ibrd").await?;
        let capacity = buffer.len();
        let chunk = blocking("viRead", move || {
            let mut chunk = vec![0u8; capacity];
            let count = lock(&session)
                .read(&mut chunk)
                .map_err(|e| io_error("viRead", e))?;
            chunk.truncate(count);
            Ok(chunk)
        })
        .await?;
        buffer[..chunk.len()].copy_from_slice(&chunk);
        Ok((chunk.len(), read_status(&chunk, capacity)))
    }

    async fn serial_poll(&mut self, device: DeviceHandle) -> IbResult<u8> {
        let session = self.session(device, "ibrsp").await?;
        blocking("viReadSTB", move || {
            lock(&session)
                .read_stb()
                .map(|stb| (stb & 0xff) as u8)
                .map_err(|e| visa_error("viReadSTB", e))
        })
        .await
    }

    async fn go_offline(&mut self, device: DeviceHandle) -> IbResult<()> {
        // Dropping the last reference closes the VISA session.
        self.sessions.remove(&device);
        Ok(())
    }

    async fn interface_clear(&mut self, board: u32) -> IbResult<()> {
        debug!("GPIB{}: interface clear is issued by the VISA library on open", board);
        Ok(())
    }

    async fn clear_all(&mut self, board: u32) -> IbResult<()> {
        let sessions: Vec<(DeviceHandle, Session)> = self
            .sessions
            .iter()
            .filter_map(|(handle, slot)| slot.session.as_ref().map(|s| (*handle, Arc::clone(s))))
            .collect();
        for (handle, session) in sessions {
            blocking("viClear", move || {
                lock(&session).clear().map_err(|e| visa_error("viClear", e))
            })
            .await?;
            debug!("GPIB{}: {} cleared", board, handle);
        }
        Ok(())
    }

    async fn find_listeners(&mut self, board: u32, addresses: &[u8]) -> IbResult<Vec<u8>> {
        let mut found = Vec::new();
        for &address in addresses {
            if self.probe(board, address).await {
                found.push(address);
            }
        }
        Ok(found)
    }

    async fn send(&mut self, board: u32, address: u8, data: &[u8]) -> IbResult<()> {
        let handle = self.open_device(board, address, self.probe_timeout).await?;
        let result = self.write(handle, data).await.map(|_| ());
        self.go_offline(handle).await?;
        result
    }

    async fn receive(&mut self, board: u32, address: u8, buffer: &mut [u8]) -> IbResult<usize> {
        let handle = self.open_device(board, address, self.probe_timeout).await?;
        let result = self.read(handle, buffer).await.map(|(count, _)| count);
        self.go_offline(handle).await?;
        result
    }

    fn describe(&self) -> String {
        let open = self.sessions.values().filter(|slot| slot.session.is_some()).count();
        format!("VISA ({} open sessions)", open)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failed_probe_step_means_no_listener() {
        let refused: IbResult<()> = Err(visa_error(
            "viOpen(GPIB0::4::INSTR)",
            "VI_ERROR_RSRC_NFOUND",
        ));
        assert_eq!(answered(4, refused), None);
        assert_eq!(answered(4, Ok(7)), Some(7));
    }

    #[test]
    fn test_read_status_end_detection() {
        assert!(read_status(b"+1.0\n", 2000).contains(StatusWord::END));
        assert!(read_status(b"abc\n", 4).contains(StatusWord::END));
        assert!(!read_status(b"abcd", 4).contains(StatusWord::END));
    }
}
