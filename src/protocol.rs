// Wire formats of the 3-byte signal characteristics.
//
// Every payload is packed big-endian in "natural" bit order and then has its
// first and last byte swapped before it goes on the air:
//
//   power:    000000 AAAAAAAAAAA BBBBBBBBBBB
//   waveform: 0000 ZZZZZ YYYYYYYYYY XXXXX
//   config:   MMMMMMMMMMMMMMMM SSSSSSSS  (max power, power step)
//
// Field values are masked to their width, so out-of-range inputs wrap around
// instead of saturating.

use crate::firmware::{BATTERY_PAYLOAD_LEN, PAYLOAD_LEN};
use std::fmt;
use thiserror::Error;

const POWER_MASK: u32 = 0x7FF;
const WAVEFORM_XZ_MASK: u32 = 0x1F;
const WAVEFORM_Y_MASK: u32 = 0x3FF;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("expected a {expected}-byte payload, got {actual} bytes")]
pub struct DecodeError {
    pub expected: usize,
    pub actual: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Channel {
    A,
    B,
}

impl Channel {
    pub const ALL: [Channel; 2] = [Channel::A, Channel::B];

    pub fn opposite(self) -> Channel {
        match self {
            Channel::A => Channel::B,
            Channel::B => Channel::A,
        }
    }

    pub(crate) fn index(self) -> usize {
        match self {
            Channel::A => 0,
            Channel::B => 1,
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Channel::A => f.write_str("A"),
            Channel::B => f.write_str("B"),
        }
    }
}

/// Power level of both output channels. The device only accepts both values
/// together, so a change to one channel is always sent as a whole state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ChannelPowerState {
    pub a: u16,
    pub b: u16,
}

impl ChannelPowerState {
    pub fn get(&self, channel: Channel) -> u16 {
        match channel {
            Channel::A => self.a,
            Channel::B => self.b,
        }
    }

    /// Copy of this state with one channel replaced.
    pub fn with(mut self, channel: Channel, value: u16) -> Self {
        match channel {
            Channel::A => self.a = value,
            Channel::B => self.b = value,
        }
        self
    }
}

/// One periodic stimulation pattern. `x` and `z` are 5 bits wide, `y` 10 bits.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WaveformParams {
    pub x: u8,
    pub y: u16,
    pub z: u8,
}

/// Limits reported by the device. Advisory only, the wire format does not
/// enforce them.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeviceConfig {
    pub max_power: u16,
    pub power_step: u8,
}

/// Swap the first and last byte. Applying it twice gives back the input.
pub fn reorder_bytes(bytes: [u8; 3]) -> [u8; 3] {
    [bytes[2], bytes[1], bytes[0]]
}

fn pack(word: u32) -> [u8; 3] {
    let [_, hi, mid, lo] = word.to_be_bytes();
    reorder_bytes([hi, mid, lo])
}

fn unpack(payload: &[u8]) -> Result<u32, DecodeError> {
    let bytes = payload_bytes(payload)?;
    let [hi, mid, lo] = reorder_bytes(bytes);
    Ok(u32::from_be_bytes([0, hi, mid, lo]))
}

fn payload_bytes(payload: &[u8]) -> Result<[u8; 3], DecodeError> {
    payload.try_into().map_err(|_| DecodeError {
        expected: PAYLOAD_LEN,
        actual: payload.len(),
    })
}

pub fn encode_power(power_a: u16, power_b: u16) -> [u8; 3] {
    let a = u32::from(power_a) & POWER_MASK;
    let b = u32::from(power_b) & POWER_MASK;
    pack((a << 11) | b)
}

pub fn decode_power(payload: &[u8]) -> Result<ChannelPowerState, DecodeError> {
    let word = unpack(payload)?;
    Ok(ChannelPowerState {
        a: ((word >> 11) & POWER_MASK) as u16,
        b: (word & POWER_MASK) as u16,
    })
}

pub fn encode_power_state(state: ChannelPowerState) -> [u8; 3] {
    encode_power(state.a, state.b)
}

pub fn encode_waveform(x: u8, y: u16, z: u8) -> [u8; 3] {
    let x = u32::from(x) & WAVEFORM_XZ_MASK;
    let y = u32::from(y) & WAVEFORM_Y_MASK;
    let z = u32::from(z) & WAVEFORM_XZ_MASK;
    pack((z << 15) | (y << 5) | x)
}

pub fn encode_waveform_params(params: WaveformParams) -> [u8; 3] {
    encode_waveform(params.x, params.y, params.z)
}

pub fn decode_waveform(payload: &[u8]) -> Result<WaveformParams, DecodeError> {
    let word = unpack(payload)?;
    Ok(WaveformParams {
        x: (word & WAVEFORM_XZ_MASK) as u8,
        y: ((word >> 5) & WAVEFORM_Y_MASK) as u16,
        z: ((word >> 15) & WAVEFORM_XZ_MASK) as u8,
    })
}

pub fn decode_config(payload: &[u8]) -> Result<DeviceConfig, DecodeError> {
    let [hi, lo, step] = reorder_bytes(payload_bytes(payload)?);
    Ok(DeviceConfig {
        max_power: u16::from_be_bytes([hi, lo]),
        power_step: step,
    })
}

/// Battery level is a single raw percentage byte, no reordering.
pub fn decode_battery(payload: &[u8]) -> Result<u8, DecodeError> {
    match payload {
        [level] => Ok(*level),
        _ => Err(DecodeError {
            expected: BATTERY_PAYLOAD_LEN,
            actual: payload.len(),
        }),
    }
}

#[test]
fn test_reorder_is_self_inverse() {
    for a in [0u8, 1, 0x7F, 0x80, 0xFF] {
        for b in [0u8, 0x55, 0xAA, 0xFF] {
            for c in [0u8, 3, 0xC0, 0xFE] {
                let bytes = [a, b, c];
                assert_eq!(reorder_bytes(reorder_bytes(bytes)), bytes);
                assert_eq!(reorder_bytes(bytes), [c, b, a]);
            }
        }
    }
}

#[test]
fn test_power_vectors() {
    assert_eq!(encode_power(0, 0), [0x00, 0x00, 0x00]);
    assert_eq!(encode_power(2047, 2047), [0xFF, 0xFF, 0x3F]);
    // A sits in the high field, B in the low field, then the swap.
    assert_eq!(encode_power(1, 0), [0x00, 0x08, 0x00]);
    assert_eq!(encode_power(0, 1), [0x01, 0x00, 0x00]);
    assert_eq!(
        decode_power(&[0xFF, 0xFF, 0x3F]).unwrap(),
        ChannelPowerState { a: 2047, b: 2047 }
    );
}

#[test]
fn test_power_round_trip_exhaustive() {
    for a in 0..=2047u16 {
        for b in 0..=2047u16 {
            let state = decode_power(&encode_power(a, b)).unwrap();
            assert_eq!((state.a, state.b), (a, b));
        }
    }
}

#[test]
fn test_power_wraps_instead_of_clamping() {
    for k in 0..16u16 {
        assert_eq!(encode_power(2048 + k, 0), encode_power(k, 0));
        assert_eq!(encode_power(0, 2048 + k), encode_power(0, k));
    }
    assert_eq!(encode_power(u16::MAX, 0), encode_power(2047, 0));
}

#[test]
fn test_power_ignores_reserved_bits() {
    // Reserved bits live in the top of the natural word, i.e. the last wire byte.
    let state = decode_power(&[0x00, 0x00, 0xC0]).unwrap();
    assert_eq!(state, ChannelPowerState { a: 0, b: 0 });
}

#[test]
fn test_waveform_vectors() {
    assert_eq!(encode_waveform(5, 95, 20), [0xE5, 0x0B, 0x0A]);
    assert_eq!(
        decode_waveform(&encode_waveform(5, 95, 20)).unwrap(),
        WaveformParams { x: 5, y: 95, z: 20 }
    );
    assert_eq!(encode_waveform(31, 0, 0), [0x1F, 0x00, 0x00]);
    assert_eq!(encode_waveform(0, 1023, 0), [0xE0, 0x7F, 0x00]);
    assert_eq!(encode_waveform(0, 0, 31), [0x00, 0x80, 0x0F]);
}

#[test]
fn test_waveform_round_trip_exhaustive() {
    for x in 0..=31u8 {
        for y in 0..=1023u16 {
            for z in 0..=31u8 {
                let params = decode_waveform(&encode_waveform(x, y, z)).unwrap();
                assert_eq!(params, WaveformParams { x, y, z });
            }
        }
    }
}

#[test]
fn test_waveform_masks_fields() {
    assert_eq!(encode_waveform(32 + 3, 1024 + 7, 32 + 9), encode_waveform(3, 7, 9));
}

#[test]
fn test_random_payloads_decode_within_range() {
    use rand::Rng;

    let mut rng = rand::thread_rng();
    for _ in 0..10_000 {
        let bytes: [u8; 3] = rng.gen();
        let power = decode_power(&bytes).unwrap();
        assert!(power.a <= 2047 && power.b <= 2047);
        let params = decode_waveform(&bytes).unwrap();
        assert!(params.x <= 31 && params.y <= 1023 && params.z <= 31);
        // Re-encoding only loses the reserved bits.
        assert_eq!(encode_power_state(power)[..2], bytes[..2]);
        assert_eq!(encode_power_state(power)[2], bytes[2] & 0x3F);
        assert_eq!(encode_waveform_params(params)[2], bytes[2] & 0x0F);
    }
}

#[test]
fn test_config() {
    assert_eq!(
        decode_config(&[0x0A, 0xD0, 0x07]).unwrap(),
        DeviceConfig {
            max_power: 2000,
            power_step: 10
        }
    );
}

#[test]
fn test_battery() {
    assert_eq!(decode_battery(&[87]).unwrap(), 87);
    assert_eq!(
        decode_battery(&[]),
        Err(DecodeError {
            expected: 1,
            actual: 0
        })
    );
}

#[test]
fn test_wrong_length_is_an_error() {
    let err = decode_power(&[0, 0]).unwrap_err();
    assert_eq!(
        err,
        DecodeError {
            expected: 3,
            actual: 2
        }
    );
    assert!(decode_waveform(&[0, 0, 0, 0]).is_err());
    assert!(decode_config(&[]).is_err());
}

#[test]
fn test_channel_state_merge() {
    let state = ChannelPowerState { a: 10, b: 20 };
    assert_eq!(state.with(Channel::A, 99), ChannelPowerState { a: 99, b: 20 });
    assert_eq!(state.with(Channel::B, 99).get(Channel::A), 10);
    assert_eq!(Channel::A.opposite(), Channel::B);
}
