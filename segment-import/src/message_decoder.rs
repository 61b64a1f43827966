//! Message Decoding Engine
//!
//! Extracts signal values from raw CAN frames based on message layouts from
//! the bus definition set. Handles bit extraction, endianness, multiplexing,
//! and physical value conversion. Decoding is pure: the same frame and
//! definition always give the same signals.

use crate::signals::database::{ByteOrder, MessageDefinition, SignalDefinition, ValueType};
use crate::types::DecodedSignal;

/// Message decoder - extracts signals from CAN frames
pub struct MessageDecoder;

impl MessageDecoder {
    /// Decode every applicable signal of `message_def` from `data`
    ///
    /// Signals whose bits extend past the payload are skipped, as are
    /// multiplexed signals whose multiplexer value does not match.
    pub fn decode_message(data: &[u8], message_def: &MessageDefinition) -> Vec<DecodedSignal> {
        let mut multiplexer_value: Option<u64> = None;

        // For multiplexed messages, first extract the multiplexer signal value
        if message_def.is_multiplexed {
            if let Some(ref mux_signal_name) = message_def.multiplexer_signal {
                if let Some(mux_signal) = message_def.signals.iter().find(|s| s.name == *mux_signal_name) {
                    if let Some(value) = Self::extract_signal_value(data, mux_signal) {
                        multiplexer_value = Some(value as u64);
                    }
                }
            }
        }

        let mut decoded_signals = Vec::with_capacity(message_def.signals.len());
        for signal in &message_def.signals {
            if let Some(ref mux_info) = signal.multiplexer_info {
                match multiplexer_value {
                    Some(current) if mux_info.multiplexer_values.contains(&current) => {}
                    _ => continue,
                }
            }

            if let Some(decoded) = Self::decode_signal(data, signal) {
                decoded_signals.push(decoded);
            }
        }

        decoded_signals
    }

    /// Decode a single signal from CAN frame data
    pub fn decode_signal(data: &[u8], signal: &SignalDefinition) -> Option<DecodedSignal> {
        let raw_value = Self::extract_signal_value(data, signal)?;

        Some(DecodedSignal {
            name: signal.name.clone(),
            value: signal.offset + signal.factor * (raw_value as f64),
            unit: signal.unit.clone(),
            raw_value,
        })
    }

    /// Extract raw signal value from CAN frame data
    fn extract_signal_value(data: &[u8], signal: &SignalDefinition) -> Option<i64> {
        let start_bit = signal.start_bit as usize;
        let length = signal.length as usize;

        // Both numberings place the signal's last bit at start + length - 1
        let required_bytes = signal.required_bytes();
        if length == 0 || required_bytes > data.len() {
            log::debug!(
                "Signal '{}' requires {} bytes but frame only has {} bytes",
                signal.name,
                required_bytes,
                data.len()
            );
            return None;
        }

        let raw_value = match signal.byte_order {
            ByteOrder::LittleEndian => Self::extract_little_endian(data, start_bit, length),
            ByteOrder::BigEndian => Self::extract_big_endian(data, start_bit, length),
        };

        let signed_value = match signal.value_type {
            ValueType::Unsigned => raw_value as i64,
            ValueType::Signed => Self::sign_extend(raw_value, length),
        };

        Some(signed_value)
    }

    /// Extract signal with little-endian (Intel) byte order
    ///
    /// Little-endian format:
    /// - Start bit points to the LSB (least significant bit)
    /// - Bits are numbered from LSB to MSB within each byte
    /// - Byte 0 is the first byte in the CAN frame
    fn extract_little_endian(data: &[u8], start_bit: usize, length: usize) -> u64 {
        let mut result: u64 = 0;

        for i in 0..length {
            let bit_pos = start_bit + i;
            let byte_idx = bit_pos / 8;
            let bit_in_byte = bit_pos % 8;

            if byte_idx < data.len() {
                let bit_value = (data[byte_idx] >> bit_in_byte) & 0x01;
                result |= (bit_value as u64) << i;
            }
        }

        result
    }

    /// Extract signal with big-endian (Motorola) byte order
    ///
    /// Start bit is the MSB in MSB-first linear numbering: position 0 is
    /// bit 7 of byte 0, position 8 is bit 7 of byte 1. The signal runs
    /// towards higher positions.
    fn extract_big_endian(data: &[u8], start_bit: usize, length: usize) -> u64 {
        let mut result: u64 = 0;

        for i in 0..length {
            let bit_pos = start_bit + i;
            let byte_idx = bit_pos / 8;
            let bit_in_byte = 7 - (bit_pos % 8);

            if byte_idx < data.len() {
                let bit_value = (data[byte_idx] >> bit_in_byte) & 0x01;
                result |= (bit_value as u64) << (length - 1 - i);
            }
        }

        result
    }

    /// Sign-extend a value from N bits to 64 bits
    fn sign_extend(value: u64, bit_length: usize) -> i64 {
        if bit_length >= 64 {
            return value as i64;
        }

        let sign_bit = 1u64 << (bit_length - 1);
        if (value & sign_bit) != 0 {
            let mask = !0u64 << bit_length;
            (value | mask) as i64
        } else {
            value as i64
        }
    }
}
