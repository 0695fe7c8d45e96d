use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Deref;

pub const START_BYTE: u8 = 0xdd;
pub const END_BYTE: u8 = 0x77;
const READ_MARKER: u8 = 0xa5;

/// Offset of the declared payload length inside a frame.
pub const LENGTH_OFFSET: usize = 3;
pub const PAYLOAD_OFFSET: usize = 4;
/// Header, length, checksum and end byte around the payload.
pub const FRAME_OVERHEAD: usize = 7;

pub const BATTERY_INFO_REQUEST: [u8; 7] = [0xdd, 0xa5, 0x03, 0x00, 0xff, 0xfd, 0x77];
pub const CELL_INFO_REQUEST: [u8; 7] = [0xdd, 0xa5, 0x04, 0x00, 0xff, 0xfc, 0x77];

// Battery info field offsets, counted from the start of the frame
const TOTAL_VOLTAGE: usize = 4;
const CURRENT: usize = 6;
const REMAINING_CAPACITY: usize = 8;
const NOMINAL_CAPACITY: usize = 10;
const CYCLES: usize = 12;
const BALANCE_LOW: usize = 16;
const BALANCE_HIGH: usize = 18;
const SOC: usize = 23;
const FET_STATUS: usize = 24;
const CELL_COUNT: usize = 25;
const NTC_COUNT: usize = 26;
const NTC_FIRST: usize = 27;

// Temperatures are reported in 0.1K
const KELVIN_OFFSET_DECI: i32 = 2731;

macro_rules! read_bit {
    ($byte:expr,$position:expr) => {
        ($byte >> $position) & 1 != 0
    };
}

fn validate_len(buffer: &[u8], required: usize) -> Result<()> {
    if buffer.len() < required {
        log::warn!(
            "Invalid buffer size - required={} received={}",
            required,
            buffer.len()
        );
        return Err(Error::ReplySize {
            required,
            received: buffer.len(),
        });
    }
    Ok(())
}

/// Limits `rx_buffer` to header and declared payload, so no field is read from the trailer.
fn bounded_to_payload(rx_buffer: &[u8]) -> Result<&[u8]> {
    validate_len(rx_buffer, PAYLOAD_OFFSET)?;
    let end = PAYLOAD_OFFSET + rx_buffer[LENGTH_OFFSET] as usize;
    validate_len(rx_buffer, end)?;
    Ok(&rx_buffer[..end])
}

fn be_u16(buffer: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([buffer[offset], buffer[offset + 1]])
}

/// Checksum over command/status, length and payload: 0x10000 minus their sum.
fn calc_checksum(body: &[u8]) -> u16 {
    body.iter()
        .fold(0u16, |checksum, b| checksum.wrapping_sub(u16::from(*b)))
}

fn calc_checksum_and_set(buffer: &mut [u8]) {
    let len = buffer.len();
    let checksum = calc_checksum(&buffer[2..len - 3]).to_be_bytes();
    buffer[len - 3] = checksum[0];
    buffer[len - 2] = checksum[1];
}

/// The two read commands the polling cycle alternates between.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum Command {
    BatteryInfo = 0x03,
    CellInfo = 0x04,
}

impl Command {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn request(self) -> Vec<u8> {
        let mut tx_buffer = vec![START_BYTE, READ_MARKER, self.code(), 0x00, 0, 0, END_BYTE];
        calc_checksum_and_set(&mut tx_buffer);
        tx_buffer
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Command::BatteryInfo => write!(f, "battery-info"),
            Command::CellInfo => write!(f, "cell-info"),
        }
    }
}

/// One complete response frame.
///
/// ```text
/// 0     | 1       | 2      | 3 | 4..4+N  | 4+N..6+N | 6+N
/// 0xDD  | command | status | N | payload | checksum | 0x77
/// ```
///
/// Checksum and end byte are carried but not verified.
#[derive(Clone, PartialEq, Eq)]
pub struct Frame(Vec<u8>);

impl Frame {
    /// Wraps `bytes` after checking the header and that the length matches N + 7.
    pub fn new(bytes: Vec<u8>) -> Result<Self> {
        validate_len(&bytes, FRAME_OVERHEAD)?;
        if bytes[0] != START_BYTE {
            return Err(Error::InvalidHeader { found: bytes[0] });
        }
        let required = bytes[LENGTH_OFFSET] as usize + FRAME_OVERHEAD;
        if bytes.len() != required {
            return Err(Error::ReplySize {
                required,
                received: bytes.len(),
            });
        }
        Ok(Self(bytes))
    }

    /// Encodes a response frame the way the BMS sends it.
    pub fn build(command: u8, status: u8, payload: &[u8]) -> Result<Self> {
        let length = u8::try_from(payload.len()).map_err(|_| Error::ReplySize {
            required: u8::MAX as usize,
            received: payload.len(),
        })?;
        let mut bytes = Vec::with_capacity(payload.len() + FRAME_OVERHEAD);
        bytes.extend_from_slice(&[START_BYTE, command, status, length]);
        bytes.extend_from_slice(payload);
        bytes.extend_from_slice(&[0, 0, END_BYTE]);
        calc_checksum_and_set(&mut bytes);
        Ok(Self(bytes))
    }

    pub fn command(&self) -> u8 {
        self.0[1]
    }

    /// 0x00 on success, anything else is an error reported by the device.
    pub fn status(&self) -> u8 {
        self.0[2]
    }

    pub fn payload_len(&self) -> usize {
        self.0[LENGTH_OFFSET] as usize
    }

    pub fn payload(&self) -> &[u8] {
        &self.0[PAYLOAD_OFFSET..PAYLOAD_OFFSET + self.payload_len()]
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }
}

impl TryFrom<Vec<u8>> for Frame {
    type Error = Error;

    fn try_from(bytes: Vec<u8>) -> Result<Self> {
        Self::new(bytes)
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Frame({:02X?})", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChargeState {
    Charging,
    Discharging,
    Idle,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatteryInfo {
    /// Display name of the device, attached once a reading is complete.
    pub name: String,
    pub total_volts: f32,
    pub current: f32, // positive=charging, negative=discharging
    pub remaining_capacity_ah: f32,
    pub nominal_capacity_ah: f32,
    pub total_cycles: u16,
    pub remaining_percent_soc: u8,
    pub mosfet_charge: bool,
    pub mosfet_discharge: bool,
    pub cell_count: u8,
    /// `true` for every cell whose balancing circuit is active, in cell order.
    pub balance_status: Vec<bool>,
    /// Degrees Celsius, one per sensor.
    pub temperatures: Vec<f32>,
    pub charging: bool,
    pub discharging: bool,
    /// `None` while idle (current is exactly zero).
    pub seconds_remaining: Option<f32>,
    pub hhmm_remaining: Option<String>,
}

impl BatteryInfo {
    pub fn request() -> Vec<u8> {
        Command::BatteryInfo.request()
    }

    pub fn decode(rx_buffer: &[u8]) -> Result<Self> {
        let frame = bounded_to_payload(rx_buffer)?;
        validate_len(frame, NTC_FIRST)?;
        let n_sensors = frame[NTC_COUNT] as usize;
        validate_len(frame, NTC_FIRST + 2 * n_sensors)?;

        // Only signed field. Byte order matches the unsigned fields on the packs captured so far.
        let current = i16::from_be_bytes([frame[CURRENT], frame[CURRENT + 1]]) as f32 / 100.0;
        let remaining_capacity_ah = be_u16(frame, REMAINING_CAPACITY) as f32 / 100.0;
        let nominal_capacity_ah = be_u16(frame, NOMINAL_CAPACITY) as f32 / 100.0;
        let cell_count = frame[CELL_COUNT];

        let temperatures = frame[NTC_FIRST..NTC_FIRST + 2 * n_sensors]
            .chunks_exact(2)
            .enumerate()
            .map(|(n_sensor, raw)| {
                let raw = u16::from_be_bytes([raw[0], raw[1]]) as i32;
                let celsius = (raw - KELVIN_OFFSET_DECI) as f32 / 10.0;
                log::trace!("sensor #{} °C={}", n_sensor + 1, celsius);
                celsius
            })
            .collect();

        let seconds_remaining =
            seconds_remaining(current, remaining_capacity_ah, nominal_capacity_ah);

        Ok(Self {
            name: String::new(),
            total_volts: be_u16(frame, TOTAL_VOLTAGE) as f32 / 100.0,
            current,
            remaining_capacity_ah,
            nominal_capacity_ah,
            total_cycles: be_u16(frame, CYCLES),
            remaining_percent_soc: frame[SOC],
            mosfet_charge: read_bit!(frame[FET_STATUS], 0),
            mosfet_discharge: read_bit!(frame[FET_STATUS], 1),
            cell_count,
            balance_status: balance_status(frame, cell_count),
            temperatures,
            charging: current > 0.0,
            discharging: current < 0.0,
            seconds_remaining,
            hhmm_remaining: seconds_remaining.map(format_hhmm),
        })
    }

    pub fn state(&self) -> ChargeState {
        if self.charging {
            ChargeState::Charging
        } else if self.discharging {
            ChargeState::Discharging
        } else {
            ChargeState::Idle
        }
    }

    /// Instantaneous power in watts, positive while charging.
    pub fn power_watts(&self) -> f32 {
        self.current * self.total_volts
    }
}

/// Bit n of the balance word belongs to cell n + 1; the high word covers cells 17 to 32.
fn balance_status(frame: &[u8], n_cells: u8) -> Vec<bool> {
    let bits = (be_u16(frame, BALANCE_HIGH) as u32) << 16 | be_u16(frame, BALANCE_LOW) as u32;
    (0..n_cells.min(32))
        .map(|n_cell| read_bit!(bits, n_cell))
        .collect()
}

/// Time until full while charging, until empty while discharging, `None` when idle.
pub fn seconds_remaining(current: f32, remaining_ah: f32, nominal_ah: f32) -> Option<f32> {
    if current > 0.0 {
        Some(((nominal_ah - remaining_ah) / current.abs() * 3600.0).max(0.0))
    } else if current < 0.0 {
        Some(remaining_ah / current.abs() * 3600.0)
    } else {
        None
    }
}

pub fn format_hhmm(total_seconds: f32) -> String {
    let hours = (total_seconds / 3600.0).floor() as i64;
    let minutes = ((total_seconds % 3600.0) / 60.0).floor() as i64;
    format!("{hours}h {minutes}m")
}

/// Per-cell voltages in volts, in ascending cell order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CellVoltages(pub Vec<f32>);

impl CellVoltages {
    pub fn request() -> Vec<u8> {
        Command::CellInfo.request()
    }

    pub fn decode(rx_buffer: &[u8]) -> Result<Self> {
        validate_len(rx_buffer, PAYLOAD_OFFSET)?;
        let n_cells = rx_buffer[LENGTH_OFFSET] as usize / 2;
        validate_len(rx_buffer, PAYLOAD_OFFSET + 2 * n_cells)?;

        let volts = rx_buffer[PAYLOAD_OFFSET..PAYLOAD_OFFSET + 2 * n_cells]
            .chunks_exact(2)
            .enumerate()
            .map(|(n_cell, raw)| {
                let volt = u16::from_be_bytes([raw[0], raw[1]]) as f32 / 1000.0;
                log::trace!("cell #{} volt={}", n_cell + 1, volt);
                volt
            })
            .collect();
        Ok(Self(volts))
    }
}

impl Deref for CellVoltages {
    type Target = [f32];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}
