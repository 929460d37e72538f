//! Simulated Modbus device
//!
//! An in-memory slave with coil, discrete input, holding and input banks
//! that answers real TCP, RTU or ASCII frames over an in-process duplex
//! stream. `MockConnector` hands out transports wired to it, so the whole
//! client stack runs byte-for-byte without hardware.
//!
//! Failure injection: refuse opens, drop the link on the next N exchanges,
//! answer every request with an exception code, delay responses, send a
//! reply twice, or damage a reply's framing.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{duplex, AsyncWriteExt, DuplexStream};
use tracing::{debug, trace};
use voltage_comlink::error::{ComLinkError, Result};

use super::codec::ModbusCodec;
use super::config::TransportSettings;
use super::connection::{read_request, Connector, StreamTransport, Transport};
use super::pdu::ModbusPdu;
use super::transport::{assemble_frame, split_frame, ModbusMode};
use super::types::{RawData, Region};

const DUPLEX_BUFFER: usize = 1024;

const EXCEPTION_ILLEGAL_FUNCTION: u8 = 0x01;
const EXCEPTION_ILLEGAL_ADDRESS: u8 = 0x02;
const EXCEPTION_ILLEGAL_VALUE: u8 = 0x03;

/// One request as seen by the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordedRequest {
    pub function: u8,
    pub address: u16,
    pub quantity: u16,
}

#[derive(Debug, Default)]
struct Banks {
    coils: BTreeMap<u16, bool>,
    discrete_inputs: BTreeMap<u16, bool>,
    holding: BTreeMap<u16, u16>,
    input: BTreeMap<u16, u16>,
}

#[derive(Debug, Default)]
struct DeviceState {
    banks: Banks,
    requests: Vec<RecordedRequest>,
    refuse_opens: bool,
    fail_exchanges: u32,
    duplicate_responses: u32,
    corrupt_responses: u32,
    exception: Option<u8>,
    response_delay: Option<Duration>,
    address_limit: Option<u32>,
    opens: u32,
}

/// In-memory Modbus slave; clones share the same state
#[derive(Debug, Clone)]
pub struct SimulatedDevice {
    mode: ModbusMode,
    unit_id: u8,
    state: Arc<Mutex<DeviceState>>,
}

impl SimulatedDevice {
    pub fn new(mode: ModbusMode, unit_id: u8) -> Self {
        Self {
            mode,
            unit_id,
            state: Arc::new(Mutex::new(DeviceState::default())),
        }
    }

    pub fn mode(&self) -> ModbusMode {
        self.mode
    }

    pub fn set_holding(&self, address: u16, values: &[u16]) {
        store(&mut self.state.lock().banks.holding, address, values);
    }

    pub fn set_input(&self, address: u16, values: &[u16]) {
        store(&mut self.state.lock().banks.input, address, values);
    }

    pub fn set_coils(&self, address: u16, values: &[bool]) {
        store(&mut self.state.lock().banks.coils, address, values);
    }

    pub fn set_discrete_inputs(&self, address: u16, values: &[bool]) {
        store(&mut self.state.lock().banks.discrete_inputs, address, values);
    }

    pub fn holding(&self, address: u16) -> u16 {
        self.state
            .lock()
            .banks
            .holding
            .get(&address)
            .copied()
            .unwrap_or(0)
    }

    pub fn coil(&self, address: u16) -> bool {
        self.state
            .lock()
            .banks
            .coils
            .get(&address)
            .copied()
            .unwrap_or(false)
    }

    /// Requests received so far, in arrival order
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state.lock().requests.clone()
    }

    pub fn clear_requests(&self) {
        self.state.lock().requests.clear();
    }

    /// Number of transports opened against this device
    pub fn open_count(&self) -> u32 {
        self.state.lock().opens
    }

    pub fn refuse_opens(&self, refuse: bool) {
        self.state.lock().refuse_opens = refuse;
    }

    /// Drop the link instead of answering the next `count` requests
    pub fn fail_next_exchanges(&self, count: u32) {
        self.state.lock().fail_exchanges = count;
    }

    /// Send the reply to each of the next `count` requests twice
    pub fn duplicate_next_responses(&self, count: u32) {
        self.state.lock().duplicate_responses = count;
    }

    /// Break the length field (TCP) or checksum (RTU, ASCII) of the next
    /// `count` replies
    pub fn corrupt_next_responses(&self, count: u32) {
        self.state.lock().corrupt_responses = count;
    }

    /// Answer every request with exception `code` (None restores normal
    /// operation)
    pub fn respond_with_exception(&self, code: Option<u8>) {
        self.state.lock().exception = code;
    }

    pub fn set_response_delay(&self, delay: Option<Duration>) {
        self.state.lock().response_delay = delay;
    }

    /// Answer Illegal Data Address for anything at or beyond `limit`
    pub fn limit_addresses(&self, limit: u16) {
        self.state.lock().address_limit = Some(u32::from(limit));
    }

    /// Serve one client stream until it closes or a failure is injected
    async fn serve(self, mut stream: DuplexStream) {
        loop {
            let frame = match read_request(&mut stream, self.mode).await {
                Ok(frame) => frame,
                Err(e) => {
                    trace!("Simulated device: stream ended: {}", e);
                    return;
                },
            };

            let (response, delay, copies) = {
                let mut state = self.state.lock();
                if state.fail_exchanges > 0 {
                    state.fail_exchanges -= 1;
                    debug!("Simulated device: dropping link");
                    return;
                }
                let mut response = self.answer(&mut state, &frame);
                if let Some(response) = response.as_mut() {
                    if state.corrupt_responses > 0 {
                        state.corrupt_responses -= 1;
                        corrupt(self.mode, response);
                    }
                }
                let copies = if state.duplicate_responses > 0 {
                    state.duplicate_responses -= 1;
                    2
                } else {
                    1
                };
                (response, state.response_delay, copies)
            };

            let Some(response) = response else {
                continue;
            };
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            for _ in 0..copies {
                if stream.write_all(&response).await.is_err() {
                    return;
                }
            }
        }
    }

    /// Build the response frame, or None when the request is not for us
    fn answer(&self, state: &mut DeviceState, frame: &[u8]) -> Option<Vec<u8>> {
        let parts = match split_frame(self.mode, frame) {
            Ok(parts) => parts,
            Err(e) => {
                debug!("Simulated device: bad frame: {}", e);
                return None;
            },
        };
        if parts.unit_id != self.unit_id {
            return None;
        }

        let request = &parts.pdu;
        let payload = request.payload();
        let function = request.function_code().unwrap_or(0);
        let recorded = RecordedRequest {
            function,
            address: word(payload, 0),
            quantity: word(payload, 2),
        };
        state.requests.push(recorded);

        let span = match function {
            0x05 | 0x06 => 1,
            _ => u32::from(recorded.quantity),
        };
        let out_of_range = state
            .address_limit
            .is_some_and(|limit| u32::from(recorded.address) + span > limit);

        let pdu = match state.exception {
            Some(code) => ModbusCodec::build_exception_pdu(function, code),
            None if out_of_range => {
                ModbusCodec::build_exception_pdu(function, EXCEPTION_ILLEGAL_ADDRESS)
            },
            None => handle(&mut state.banks, request).or_else(|code| {
                ModbusCodec::build_exception_pdu(function, code)
            }),
        }
        .ok()?;

        Some(assemble_frame(
            self.mode,
            parts.transaction_id.unwrap_or(0),
            self.unit_id,
            &pdu,
        ))
    }
}

/// Apply one request to the banks; the error is a Modbus exception code
fn handle(banks: &mut Banks, request: &ModbusPdu) -> std::result::Result<ModbusPdu, u8> {
    let payload = request.payload();
    if payload.len() < 4 {
        return Err(EXCEPTION_ILLEGAL_VALUE);
    }
    let address = word(payload, 0);
    let value = word(payload, 2);

    let read = |region: Region| -> std::result::Result<ModbusPdu, u8> {
        if value == 0 || value > region.max_read_quantity() {
            return Err(EXCEPTION_ILLEGAL_VALUE);
        }
        let addresses = (0..value).map(|i| address.wrapping_add(i));
        let data = match region {
            Region::Coil => RawData::Bits(addresses.map(|a| load(&banks.coils, a)).collect()),
            Region::DiscreteInput => {
                RawData::Bits(addresses.map(|a| load(&banks.discrete_inputs, a)).collect())
            },
            Region::HoldingRegister => {
                RawData::Words(addresses.map(|a| load(&banks.holding, a)).collect())
            },
            Region::InputRegister => {
                RawData::Words(addresses.map(|a| load(&banks.input, a)).collect())
            },
        };
        ModbusCodec::build_read_response(region, &data).map_err(|_| EXCEPTION_ILLEGAL_VALUE)
    };

    match request.function_code().unwrap_or(0) {
        0x01 => read(Region::Coil),
        0x02 => read(Region::DiscreteInput),
        0x03 => read(Region::HoldingRegister),
        0x04 => read(Region::InputRegister),
        0x05 => {
            let on = match value {
                0xFF00 => true,
                0x0000 => false,
                _ => return Err(EXCEPTION_ILLEGAL_VALUE),
            };
            banks.coils.insert(address, on);
            Ok(request.clone())
        },
        0x06 => {
            banks.holding.insert(address, value);
            Ok(request.clone())
        },
        0x0F => {
            let bytes = payload.get(5..).ok_or(EXCEPTION_ILLEGAL_VALUE)?;
            if bytes.len() * 8 < value as usize {
                return Err(EXCEPTION_ILLEGAL_VALUE);
            }
            for i in 0..value {
                let bit = (bytes[(i / 8) as usize] >> (i % 8)) & 1 == 1;
                banks.coils.insert(address.wrapping_add(i), bit);
            }
            ModbusPdu::from_slice(&request.as_slice()[..5]).map_err(|_| EXCEPTION_ILLEGAL_VALUE)
        },
        0x10 => {
            let bytes = payload.get(5..).ok_or(EXCEPTION_ILLEGAL_VALUE)?;
            if bytes.len() != value as usize * 2 {
                return Err(EXCEPTION_ILLEGAL_VALUE);
            }
            for (i, pair) in bytes.chunks_exact(2).enumerate() {
                banks
                    .holding
                    .insert(address.wrapping_add(i as u16), u16::from_be_bytes([pair[0], pair[1]]));
            }
            ModbusPdu::from_slice(&request.as_slice()[..5]).map_err(|_| EXCEPTION_ILLEGAL_VALUE)
        },
        _ => Err(EXCEPTION_ILLEGAL_FUNCTION),
    }
}

/// Damage a frame so the client can no longer trust the stream
fn corrupt(mode: ModbusMode, frame: &mut [u8]) {
    match mode {
        // zero MBAP length
        ModbusMode::Tcp => {
            if let Some(len) = frame.get_mut(4..6) {
                len.fill(0);
            }
        },
        ModbusMode::Rtu => {
            if let Some(crc) = frame.last_mut() {
                *crc ^= 0xFF;
            }
        },
        // first LRC digit, just before CR LF
        ModbusMode::Ascii => {
            if let Some(at) = frame.len().checked_sub(4) {
                frame[at] = if frame[at] == b'0' { b'1' } else { b'0' };
            }
        },
    }
}

fn word(payload: &[u8], at: usize) -> u16 {
    match payload.get(at..at + 2) {
        Some(&[hi, lo]) => u16::from_be_bytes([hi, lo]),
        _ => 0,
    }
}

fn store<T: Copy>(bank: &mut BTreeMap<u16, T>, address: u16, values: &[T]) {
    for (i, value) in values.iter().enumerate() {
        bank.insert(address.wrapping_add(i as u16), *value);
    }
}

fn load<T: Copy + Default>(bank: &BTreeMap<u16, T>, address: u16) -> T {
    bank.get(&address).copied().unwrap_or_default()
}

/// Connector whose transports talk to a [`SimulatedDevice`]
#[derive(Debug, Clone)]
pub struct MockConnector {
    device: SimulatedDevice,
}

impl MockConnector {
    pub fn new(device: SimulatedDevice) -> Self {
        Self { device }
    }

    pub fn device(&self) -> &SimulatedDevice {
        &self.device
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn open(
        &self,
        settings: &TransportSettings,
        _limit: Duration,
    ) -> Result<Box<dyn Transport>> {
        {
            let mut state = self.device.state.lock();
            state.opens += 1;
            if state.refuse_opens {
                return Err(ComLinkError::transport(format!(
                    "Connection refused by {}",
                    settings.target()
                )));
            }
        }

        let (client, server) = duplex(DUPLEX_BUFFER);
        tokio::spawn(self.device.clone().serve(server));
        debug!("Simulated device: opened for {}", settings.target());
        Ok(Box::new(StreamTransport::new(
            client,
            self.device.mode,
            format!("sim://{}", settings.target()),
        )))
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;
    use crate::modbus::connection::ResponseShape;

    async fn open(device: &SimulatedDevice) -> Box<dyn Transport> {
        let settings = TransportSettings::Tcp {
            host: "127.0.0.1".into(),
            port: 502,
        };
        MockConnector::new(device.clone())
            .open(&settings, Duration::from_secs(1))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_answers_rtu_read() {
        let device = SimulatedDevice::new(ModbusMode::Rtu, 1);
        device.set_holding(0, &[0x1234]);
        let mut link = open(&device).await;

        let pdu = ModbusCodec::build_read_pdu(Region::HoldingRegister, 0, 1).unwrap();
        let frame = assemble_frame(ModbusMode::Rtu, 0, 1, &pdu);
        let response = link
            .exchange(&frame, ResponseShape::for_request(&pdu), Duration::from_secs(1))
            .await
            .unwrap();
        let parts = split_frame(ModbusMode::Rtu, &response).unwrap();
        assert_eq!(parts.pdu.as_slice(), &[0x03, 0x02, 0x12, 0x34]);
        assert_eq!(
            device.requests(),
            vec![RecordedRequest {
                function: 0x03,
                address: 0,
                quantity: 1
            }]
        );
    }

    #[test]
    fn test_handle_writes() {
        let mut banks = Banks::default();
        let fc16 = ModbusCodec::build_write_fc16_multiple_registers_pdu(5, &[7, 8]).unwrap();
        let echo = handle(&mut banks, &fc16).unwrap();
        assert_eq!(echo.as_slice(), &fc16.as_slice()[..5]);
        assert_eq!(banks.holding.get(&6), Some(&8));

        let fc15 =
            ModbusCodec::build_write_fc15_multiple_coils_pdu(0, &[true, false, true]).unwrap();
        handle(&mut banks, &fc15).unwrap();
        assert_eq!(banks.coils.get(&2), Some(&true));
        assert_eq!(banks.coils.get(&1), Some(&false));
    }

    #[test]
    fn test_handle_rejects_unknown_function() {
        let mut banks = Banks::default();
        let pdu = ModbusPdu::from_slice(&[0x2B, 0x0E, 0x01, 0x00]).unwrap();
        assert_eq!(handle(&mut banks, &pdu), Err(EXCEPTION_ILLEGAL_FUNCTION));
    }

    #[tokio::test]
    async fn test_refused_open() {
        let device = SimulatedDevice::new(ModbusMode::Tcp, 1);
        device.refuse_opens(true);
        let settings = TransportSettings::Tcp {
            host: "10.0.0.9".into(),
            port: 502,
        };
        let err = MockConnector::new(device.clone())
            .open(&settings, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(err.is_transport());
        assert_eq!(device.open_count(), 1);
    }
}
