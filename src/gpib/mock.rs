//! Mock GPIB bus for testing
//!
//! This bus provides a simulated instrument bench for exercising instrument
//! sessions without physical hardware. It provides:
//! - Devices attached at primary addresses, each with an `*IDN?` identity
//! - Prefix-matched canned replies and dynamic responder closures
//! - Scripted serial-poll status bytes
//! - Failure injection per command prefix
//! - A log of every command written, for test verification
//!
//! `MockBus` is cheap to clone; clones share the same bench, so a test can
//! hand one clone to a session and keep another to inspect traffic.

use super::status::{IbErr, StatusWord};
use super::{DeviceHandle, GpibBus, IbResult};
use crate::error::BusError;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

type Responder = Box<dyn FnMut(&str) -> Option<String> + Send>;
type StatusSource = Box<dyn FnMut() -> u8 + Send>;

struct FailRule {
    prefix: String,
    error: IbErr,
    once: bool,
}

#[derive(Default)]
struct DeviceState {
    identity: String,
    replies: Vec<(String, String)>,
    responder: Option<Responder>,
    status_source: Option<StatusSource>,
    status_bytes: VecDeque<u8>,
    fail_rules: Vec<FailRule>,
    serial_poll_failure: Option<IbErr>,
    pending: VecDeque<u8>,
    writes: Vec<String>,
    clears: usize,
}

impl DeviceState {
    fn take_failure(&mut self, command: &str) -> Option<IbErr> {
        let index = self
            .fail_rules
            .iter()
            .position(|rule| starts_with_ignore_case(command, &rule.prefix))?;
        let error = self.fail_rules[index].error;
        if self.fail_rules[index].once {
            self.fail_rules.remove(index);
        }
        Some(error)
    }

    fn accept(&mut self, raw: &str) {
        self.writes.push(raw.to_string());
        let command = raw.trim_end();

        let reply = match self.responder.as_mut().and_then(|respond| respond(command)) {
            Some(reply) => Some(reply),
            None => self
                .replies
                .iter()
                .find(|(prefix, _)| starts_with_ignore_case(command, prefix))
                .map(|(_, reply)| reply.clone()),
        };

        if let Some(reply) = reply {
            self.pending.extend(reply.into_bytes());
        }
    }

    fn drain_into(&mut self, buffer: &mut [u8]) -> usize {
        let count = buffer.len().min(self.pending.len());
        for (slot, byte) in buffer.iter_mut().zip(self.pending.drain(..count)) {
            *slot = byte;
        }
        count
    }

    fn status_byte(&mut self) -> u8 {
        if let Some(byte) = self.status_bytes.pop_front() {
            return byte;
        }
        self.status_source.as_mut().map_or(0, |source| source())
    }
}

#[derive(Default)]
struct BenchState {
    devices: BTreeMap<u8, DeviceState>,
    handles: HashMap<DeviceHandle, u8>,
    next_handle: i32,
    open_failure: Option<IbErr>,
    offline_calls: usize,
    read_calls: usize,
    board_calls: Vec<String>,
}

impl BenchState {
    fn device_for(&mut self, handle: DeviceHandle, call: &str) -> IbResult<&mut DeviceState> {
        let address = *self
            .handles
            .get(&handle)
            .ok_or_else(|| BusError::new(call, StatusWord::empty(), IbErr::Earg, 0))?;
        self.devices
            .get_mut(&address)
            .ok_or_else(|| BusError::new(call, StatusWord::empty(), IbErr::Enol, 0))
    }

    fn device_at(&mut self, address: u8, call: &str) -> IbResult<&mut DeviceState> {
        self.devices
            .get_mut(&address)
            .ok_or_else(|| BusError::new(call, StatusWord::empty(), IbErr::Enol, 0))
    }
}

fn starts_with_ignore_case(command: &str, prefix: &str) -> bool {
    command.len() >= prefix.len()
        && command.as_bytes()[..prefix.len()].eq_ignore_ascii_case(prefix.as_bytes())
}

fn write_to(device: &mut DeviceState, call: &str, data: &[u8]) -> IbResult<StatusWord> {
    let raw = String::from_utf8_lossy(data).into_owned();
    if let Some(error) = device.take_failure(raw.trim_end()) {
        return Err(BusError::new(call, StatusWord::empty(), error, 0));
    }
    device.accept(&raw);
    Ok(StatusWord::CMPL | StatusWord::END)
}

fn read_from(
    device: &mut DeviceState,
    call: &str,
    buffer: &mut [u8],
) -> IbResult<(usize, StatusWord)> {
    if device.pending.is_empty() {
        return Err(BusError::new(call, StatusWord::TIMO, IbErr::Eabo, 0));
    }
    let count = device.drain_into(buffer);
    let status = if device.pending.is_empty() {
        StatusWord::CMPL | StatusWord::END
    } else {
        StatusWord::CMPL
    };
    Ok((count, status))
}

/// Scripted in-memory GPIB bench.
///
/// # Example
///
/// ```
/// use dielectric_daq::gpib::MockBus;
///
/// let bus = MockBus::new();
/// let lcr = bus.attach(17, "HEWLETT-PACKARD,4284A,0,REV01.20");
/// lcr.reply_to("FREQ?", "+1.00000E+03\n");
/// assert!(lcr.commands().is_empty());
/// ```
#[derive(Clone, Default)]
pub struct MockBus {
    state: Arc<Mutex<BenchState>>,
}

impl MockBus {
    /// Create an empty bench with no devices attached.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BenchState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Attach a device at `address` that answers `*IDN?` with `identity`.
    pub fn attach(&self, address: u8, identity: &str) -> MockDevice {
        let mut device = DeviceState {
            identity: identity.to_string(),
            ..DeviceState::default()
        };
        device
            .replies
            .push(("*IDN?".to_string(), format!("{}\n", identity)));
        self.lock().devices.insert(address, device);
        MockDevice {
            bus: self.clone(),
            address,
        }
    }

    /// Handle to an already attached device.
    pub fn device(&self, address: u8) -> Option<MockDevice> {
        self.lock().devices.contains_key(&address).then(|| MockDevice {
            bus: self.clone(),
            address,
        })
    }

    /// Make the next `open_device` call fail with `error`.
    pub fn fail_next_open(&self, error: IbErr) {
        self.lock().open_failure = Some(error);
    }

    /// Number of `go_offline` calls seen so far.
    pub fn offline_calls(&self) -> usize {
        self.lock().offline_calls
    }

    /// Number of `read` calls seen so far (all devices).
    pub fn read_calls(&self) -> usize {
        self.lock().read_calls
    }

    /// Number of descriptors currently online.
    pub fn open_handles(&self) -> usize {
        self.lock().handles.len()
    }

    /// Board-level calls (`SendIFC`, `DevClearList`, `FindLstn`) in order.
    pub fn board_calls(&self) -> Vec<String> {
        self.lock().board_calls.clone()
    }
}

#[async_trait]
impl GpibBus for MockBus {
    async fn open_device(
        &mut self,
        board: u32,
        address: u8,
        _timeout: Duration,
    ) -> IbResult<DeviceHandle> {
        let mut state = self.lock();
        if let Some(error) = state.open_failure.take() {
            return Err(BusError::new(
                format!("ibdev(GPIB{}, {})", board, address),
                StatusWord::empty(),
                error,
                0,
            ));
        }
        state.next_handle += 1;
        let handle = DeviceHandle::new(state.next_handle);
        state.handles.insert(handle, address);
        Ok(handle)
    }

    async fn find_listener(&mut self, _board: u32, address: u8) -> IbResult<bool> {
        Ok(self.lock().devices.contains_key(&address))
    }

    async fn clear(&mut self, device: DeviceHandle) -> IbResult<()> {
        let mut state = self.lock();
        let device = state.device_for(device, "ibclr")?;
        device.pending.clear();
        device.clears += 1;
        Ok(())
    }

    async fn write(&mut self, device: DeviceHandle, data: &[u8]) -> IbResult<StatusWord> {
        let mut state = self.lock();
        let device = state.device_for(device, "ibwrt")?;
        write_to(device, "ibwrt", data)
    }

    async fn read(
        &mut self,
        device: DeviceHandle,
        buffer: &mut [u8],
    ) -> IbResult<(usize, StatusWord)> {
        let mut state = self.lock();
        state.read_calls += 1;
        let device = state.device_for(device, "ibrd")?;
        read_from(device, "ibrd", buffer)
    }

    async fn serial_poll(&mut self, device: DeviceHandle) -> IbResult<u8> {
        let mut state = self.lock();
        let device = state.device_for(device, "ibrsp")?;
        if let Some(error) = device.serial_poll_failure.take() {
            return Err(BusError::new("ibrsp", StatusWord::empty(), error, 0));
        }
        Ok(device.status_byte())
    }

    async fn go_offline(&mut self, device: DeviceHandle) -> IbResult<()> {
        let mut state = self.lock();
        state.offline_calls += 1;
        state.handles.remove(&device);
        Ok(())
    }

    async fn interface_clear(&mut self, board: u32) -> IbResult<()> {
        self.lock().board_calls.push(format!("SendIFC({})", board));
        Ok(())
    }

    async fn clear_all(&mut self, board: u32) -> IbResult<()> {
        let mut state = self.lock();
        state.board_calls.push(format!("DevClearList({})", board));
        for device in state.devices.values_mut() {
            device.pending.clear();
            device.clears += 1;
        }
        Ok(())
    }

    async fn find_listeners(&mut self, board: u32, addresses: &[u8]) -> IbResult<Vec<u8>> {
        let mut state = self.lock();
        state.board_calls.push(format!("FindLstn({})", board));
        Ok(addresses
            .iter()
            .copied()
            .filter(|address| state.devices.contains_key(address))
            .collect())
    }

    async fn send(&mut self, _board: u32, address: u8, data: &[u8]) -> IbResult<()> {
        let mut state = self.lock();
        let device = state.device_at(address, "Send")?;
        write_to(device, "Send", data).map(|_| ())
    }

    async fn receive(&mut self, _board: u32, address: u8, buffer: &mut [u8]) -> IbResult<usize> {
        let mut state = self.lock();
        state.read_calls += 1;
        let device = state.device_at(address, "Receive")?;
        read_from(device, "Receive", buffer).map(|(count, _)| count)
    }

    fn describe(&self) -> String {
        let state = self.lock();
        let addresses: Vec<String> = state.devices.keys().map(u8::to_string).collect();
        format!("MockBus(devices at [{}])", addresses.join(", "))
    }
}

/// Handle for scripting and inspecting one device on a [`MockBus`].
#[derive(Clone)]
pub struct MockDevice {
    bus: MockBus,
    address: u8,
}

impl MockDevice {
    fn with<R>(&self, f: impl FnOnce(&mut DeviceState) -> R) -> R {
        let mut state = self.bus.lock();
        let device = state.devices.entry(self.address).or_default();
        f(device)
    }

    /// Primary address of this device.
    pub fn address(&self) -> u8 {
        self.address
    }

    /// Identity string returned for `*IDN?`.
    pub fn identity(&self) -> String {
        self.with(|device| device.identity.clone())
    }

    /// Reply with `reply` whenever a command starting with `prefix` is written.
    ///
    /// Later rules take precedence over earlier ones for the same prefix.
    pub fn reply_to(&self, prefix: &str, reply: &str) {
        self.with(|device| {
            device
                .replies
                .insert(0, (prefix.to_string(), reply.to_string()))
        });
    }

    /// Compute replies dynamically. The closure sees every command (without
    /// terminator) and takes precedence over [`MockDevice::reply_to`] rules.
    pub fn respond_with<F>(&self, responder: F)
    where
        F: FnMut(&str) -> Option<String> + Send + 'static,
    {
        self.with(|device| device.responder = Some(Box::new(responder)));
    }

    /// Queue one status byte for the next serial poll.
    pub fn queue_status_byte(&self, byte: u8) {
        self.with(|device| device.status_bytes.push_back(byte));
    }

    /// Compute status bytes dynamically once the queue is empty.
    pub fn status_with<F>(&self, source: F)
    where
        F: FnMut() -> u8 + Send + 'static,
    {
        self.with(|device| device.status_source = Some(Box::new(source)));
    }

    /// Fail every write starting with `prefix` until cleared.
    pub fn fail_on(&self, prefix: &str, error: IbErr) {
        self.with(|device| {
            device.fail_rules.push(FailRule {
                prefix: prefix.to_string(),
                error,
                once: false,
            })
        });
    }

    /// Fail only the next write starting with `prefix`.
    pub fn fail_once(&self, prefix: &str, error: IbErr) {
        self.with(|device| {
            device.fail_rules.push(FailRule {
                prefix: prefix.to_string(),
                error,
                once: true,
            })
        });
    }

    /// Remove all injected write failures.
    pub fn clear_failures(&self) {
        self.with(|device| device.fail_rules.clear());
    }

    /// Fail the next serial poll with `error`.
    pub fn fail_next_serial_poll(&self, error: IbErr) {
        self.with(|device| device.serial_poll_failure = Some(error));
    }

    /// Every write as received, terminators included.
    pub fn raw_writes(&self) -> Vec<String> {
        self.with(|device| device.writes.clone())
    }

    /// Every accepted command with its terminator stripped.
    pub fn commands(&self) -> Vec<String> {
        self.with(|device| {
            device
                .writes
                .iter()
                .map(|raw| raw.trim_end().to_string())
                .collect()
        })
    }

    /// Forget the command log.
    pub fn clear_log(&self) {
        self.with(|device| device.writes.clear());
    }

    /// Number of Selected/Universal Device Clear messages received.
    pub fn clears(&self) -> usize {
        self.with(|device| device.clears)
    }
}
