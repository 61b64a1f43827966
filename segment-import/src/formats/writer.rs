//! Writer producing the same framing the reader consumes

use super::rlog::{FrameHeader, FrameType};
use crate::types::{FieldValue, LogMessage, MessagePayload};
use byteorder::{LittleEndian, WriteBytesExt};
use std::io::{self, Write};

/// Encodes messages as log frames
pub struct LogWriter<W: Write> {
    writer: W,
    frames_written: u64,
}

impl<W: Write> LogWriter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            frames_written: 0,
        }
    }

    /// Write a frame with an arbitrary type and payload
    pub fn write_frame(&mut self, frame_type: u16, mono_time_ns: u64, payload: &[u8]) -> io::Result<()> {
        let payload_len = u32::try_from(payload.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "payload too large"))?;
        let header = FrameHeader {
            payload_len,
            frame_type,
            flags: 0,
            mono_time_ns,
        };
        self.writer.write_all(&header.to_bytes())?;
        self.writer.write_all(payload)?;
        self.frames_written += 1;
        Ok(())
    }

    pub fn write_payload(&mut self, mono_time_ns: u64, payload: &MessagePayload) -> io::Result<()> {
        let (frame_type, bytes) = encode_payload(payload)?;
        self.write_frame(frame_type.as_u16(), mono_time_ns, &bytes)
    }

    pub fn write_message(&mut self, message: &LogMessage) -> io::Result<()> {
        self.write_payload(message.mono_time_ns, &message.payload)
    }

    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

fn write_str(buf: &mut Vec<u8>, value: &str) -> io::Result<()> {
    let len = u16::try_from(value.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "string longer than 65535 bytes"))?;
    buf.write_u16::<LittleEndian>(len)?;
    buf.extend_from_slice(value.as_bytes());
    Ok(())
}

fn count_u16(count: usize) -> io::Result<u16> {
    u16::try_from(count).map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "too many entries"))
}

/// Encode a payload into its frame type and bytes
pub fn encode_payload(payload: &MessagePayload) -> io::Result<(FrameType, Vec<u8>)> {
    let mut buf = Vec::new();

    let frame_type = match payload {
        MessagePayload::InitData {
            wall_time_ns,
            dongle_id,
            version,
        } => {
            buf.write_u64::<LittleEndian>(*wall_time_ns)?;
            write_str(&mut buf, dongle_id)?;
            write_str(&mut buf, version)?;
            FrameType::InitData
        }
        MessagePayload::GpsLocation(fix) => {
            buf.write_i64::<LittleEndian>(fix.unix_timestamp_ms)?;
            buf.write_f64::<LittleEndian>(fix.latitude)?;
            buf.write_f64::<LittleEndian>(fix.longitude)?;
            buf.write_f64::<LittleEndian>(fix.altitude)?;
            buf.write_f32::<LittleEndian>(fix.speed)?;
            buf.write_u8(u8::from(fix.has_fix))?;
            FrameType::GpsLocation
        }
        MessagePayload::VehicleState {
            message_type,
            fields,
        } => {
            write_str(&mut buf, message_type)?;
            buf.write_u16::<LittleEndian>(count_u16(fields.len())?)?;
            for field in fields {
                write_str(&mut buf, &field.name)?;
                match field.value {
                    FieldValue::Float(v) => {
                        buf.write_u8(0)?;
                        buf.write_f64::<LittleEndian>(v)?;
                    }
                    FieldValue::Integer(v) => {
                        buf.write_u8(1)?;
                        buf.write_i64::<LittleEndian>(v)?;
                    }
                    FieldValue::Boolean(v) => {
                        buf.write_u8(2)?;
                        buf.write_u8(u8::from(v))?;
                    }
                    FieldValue::Enum(v) => {
                        buf.write_u8(3)?;
                        buf.write_u16::<LittleEndian>(v)?;
                    }
                }
            }
            FrameType::VehicleState
        }
        MessagePayload::Can(frames) => {
            buf.write_u16::<LittleEndian>(count_u16(frames.len())?)?;
            for frame in frames {
                let len = u8::try_from(frame.data.len()).map_err(|_| {
                    io::Error::new(io::ErrorKind::InvalidInput, "CAN entry longer than 255 bytes")
                })?;
                buf.write_u32::<LittleEndian>(frame.address)?;
                buf.write_u8(frame.bus)?;
                buf.write_u8(len)?;
                buf.extend_from_slice(&frame.data);
            }
            FrameType::Can
        }
        MessagePayload::EncodeIndex {
            camera,
            frame_id,
            timestamp_sof,
        } => {
            buf.write_u8(camera.index())?;
            buf.write_u32::<LittleEndian>(*frame_id)?;
            buf.write_u64::<LittleEndian>(*timestamp_sof)?;
            FrameType::EncodeIndex
        }
        MessagePayload::Text { kind, text } => {
            buf.extend_from_slice(text.as_bytes());
            match kind {
                crate::types::LogKind::Info => FrameType::LogText,
                crate::types::LogKind::Error => FrameType::ErrorLogText,
            }
        }
    };

    Ok((frame_type, buf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formats::RlogReader;
    use crate::types::{Camera, GpsFix};

    #[test]
    fn test_writer_counts_frames() {
        let mut writer = LogWriter::new(Vec::new());
        writer.write_frame(42, 1, &[]).unwrap();
        writer
            .write_payload(
                2,
                &MessagePayload::EncodeIndex {
                    camera: Camera::Ecamera,
                    frame_id: 7,
                    timestamp_sof: 1_999,
                },
            )
            .unwrap();
        assert_eq!(writer.frames_written(), 2);
        // 16 byte header + empty payload, 16 byte header + 13 byte payload
        assert_eq!(writer.into_inner().len(), 16 + 16 + 13);
    }

    #[test]
    fn test_gps_fix_survives_framing() {
        let fix = GpsFix {
            unix_timestamp_ms: 1_700_000_000_123,
            latitude: 48.1,
            longitude: 11.5,
            altitude: 520.0,
            speed: 13.5,
            has_fix: true,
        };
        let mut writer = LogWriter::new(Vec::new());
        writer.write_payload(55, &MessagePayload::GpsLocation(fix)).unwrap();
        let bytes = writer.into_inner();

        let message = RlogReader::new(&bytes[..]).next().unwrap().unwrap();
        assert_eq!(message.payload, MessagePayload::GpsLocation(fix));
    }

    #[test]
    fn test_rejects_oversized_string() {
        let long = "x".repeat(70_000);
        let err = encode_payload(&MessagePayload::VehicleState {
            message_type: long,
            fields: vec![],
        })
        .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
