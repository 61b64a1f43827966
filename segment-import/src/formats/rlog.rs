//! Reader for the segmented binary event log
//!
//! The log is a concatenation of self-delimiting frames:
//!
//! ```text
//! header := payload_len:u32 frame_type:u16 flags:u16 mono_time_ns:u64   (16 bytes, LE)
//! frame  := header payload
//! ```
//!
//! Strategy: read one header, then either decode the payload of a known frame
//! type or stream past an unknown one. Only a bad header is fatal; a payload
//! that does not parse is skipped and counted.

use super::sniff_compression;
use crate::types::{
    Camera, FieldValue, GpsFix, ImportError, LogKind, LogMessage, MessagePayload, RawCanFrame,
    Result, StateField,
};
use byteorder::{LittleEndian, ReadBytesExt};
use serde::Serialize;
use std::collections::HashSet;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Cursor, Read};
use std::path::Path;

/// Size of a frame header in bytes
pub const FRAME_HEADER_LEN: usize = 16;

/// Largest payload a well-formed header may declare
pub const MAX_PAYLOAD_LEN: u32 = 64 * 1024 * 1024;

/// Classic CAN payload limit
pub const MAX_CAN_DATA_LEN: usize = 8;

/// Frame types understood by the decoder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum FrameType {
    InitData = 1,
    GpsLocation = 2,
    VehicleState = 3,
    Can = 4,
    EncodeIndex = 5,
    LogText = 6,
    ErrorLogText = 7,
}

impl FrameType {
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            1 => Some(FrameType::InitData),
            2 => Some(FrameType::GpsLocation),
            3 => Some(FrameType::VehicleState),
            4 => Some(FrameType::Can),
            5 => Some(FrameType::EncodeIndex),
            6 => Some(FrameType::LogText),
            7 => Some(FrameType::ErrorLogText),
            _ => None,
        }
    }

    pub fn as_u16(self) -> u16 {
        self as u16
    }
}

/// Frame header (16 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub payload_len: u32,
    pub frame_type: u16,
    pub flags: u16,
    pub mono_time_ns: u64,
}

impl FrameHeader {
    pub fn parse(buf: &[u8; FRAME_HEADER_LEN]) -> Self {
        Self {
            payload_len: u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
            frame_type: u16::from_le_bytes([buf[4], buf[5]]),
            flags: u16::from_le_bytes([buf[6], buf[7]]),
            mono_time_ns: u64::from_le_bytes([
                buf[8], buf[9], buf[10], buf[11], buf[12], buf[13], buf[14], buf[15],
            ]),
        }
    }

    pub fn to_bytes(&self) -> [u8; FRAME_HEADER_LEN] {
        let mut buf = [0u8; FRAME_HEADER_LEN];
        buf[0..4].copy_from_slice(&self.payload_len.to_le_bytes());
        buf[4..6].copy_from_slice(&self.frame_type.to_le_bytes());
        buf[6..8].copy_from_slice(&self.flags.to_le_bytes());
        buf[8..16].copy_from_slice(&self.mono_time_ns.to_le_bytes());
        buf
    }
}

/// Counters for everything the reader skipped or consumed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DecodeStats {
    /// Frames read, including skipped ones
    pub frames: u64,
    pub bytes_consumed: u64,
    pub unknown_frame_types: u64,
    pub malformed_payloads: u64,
    pub malformed_can_entries: u64,
}

impl DecodeStats {
    /// Total number of recoverable warnings
    pub fn warnings(&self) -> u64 {
        self.unknown_frame_types + self.malformed_payloads + self.malformed_can_entries
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum WarningKind {
    UnknownType,
    MalformedPayload,
    MalformedCan,
}

/// Iterator over the typed messages of a log
pub struct RlogReader<R: Read> {
    reader: R,
    offset: u64,
    finished: bool,
    stats: DecodeStats,
    warned: HashSet<(WarningKind, u16)>,
    payload: Vec<u8>,
}

impl RlogReader<BufReader<File>> {
    /// Open a log file, rejecting compressed input up front
    pub fn open(path: &Path) -> Result<Self> {
        log::info!("Opening log file: {:?}", path);
        super::check_extension(path)?;

        let file = File::open(path)?;
        let mut reader = BufReader::new(file);
        if let Some(format) = sniff_compression(reader.fill_buf()?) {
            return Err(ImportError::CompressedInput { format });
        }

        Ok(Self::new(reader))
    }
}

impl<R: Read> RlogReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            offset: 0,
            finished: false,
            stats: DecodeStats::default(),
            warned: HashSet::new(),
            payload: Vec::new(),
        }
    }

    /// Bytes consumed so far
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn stats(&self) -> &DecodeStats {
        &self.stats
    }

    pub fn into_stats(self) -> DecodeStats {
        self.stats
    }

    fn read_header(&mut self) -> Result<Option<FrameHeader>> {
        let mut buf = [0u8; FRAME_HEADER_LEN];
        let available = read_full(&mut self.reader, &mut buf)?;
        if available == 0 {
            return Ok(None);
        }

        if self.offset == 0 {
            if let Some(format) = sniff_compression(&buf[..available]) {
                return Err(ImportError::CompressedInput { format });
            }
        }

        if available < FRAME_HEADER_LEN {
            return Err(ImportError::TruncatedHeader {
                offset: self.offset,
                expected: FRAME_HEADER_LEN,
                available,
            });
        }

        let header = FrameHeader::parse(&buf);
        if header.payload_len > MAX_PAYLOAD_LEN {
            return Err(ImportError::CorruptHeader {
                offset: self.offset,
                reason: format!(
                    "payload length {} exceeds the {} byte limit",
                    header.payload_len, MAX_PAYLOAD_LEN
                ),
            });
        }

        Ok(Some(header))
    }

    fn read_payload(&mut self, frame_offset: u64, len: usize) -> Result<()> {
        self.payload.resize(len, 0);
        let available = read_full(&mut self.reader, &mut self.payload)?;
        if available < len {
            return Err(ImportError::TruncatedFrame {
                offset: frame_offset,
                declared: len,
                available,
            });
        }
        Ok(())
    }

    fn skip_payload(&mut self, frame_offset: u64, len: usize) -> Result<()> {
        let skipped = io::copy(&mut (&mut self.reader).take(len as u64), &mut io::sink())?;
        if skipped < len as u64 {
            return Err(ImportError::TruncatedFrame {
                offset: frame_offset,
                declared: len,
                available: skipped as usize,
            });
        }
        Ok(())
    }

    fn warn_once(&mut self, kind: WarningKind, frame_type: u16, message: impl FnOnce() -> String) {
        if self.warned.insert((kind, frame_type)) {
            log::warn!("{}", message());
        } else {
            log::trace!("{}", message());
        }
    }

    fn next_message(&mut self) -> Result<Option<LogMessage>> {
        loop {
            let frame_offset = self.offset;
            let header = match self.read_header()? {
                Some(header) => header,
                None => return Ok(None),
            };
            let len = header.payload_len as usize;
            self.stats.frames += 1;

            let frame_type = match FrameType::from_u16(header.frame_type) {
                Some(frame_type) => frame_type,
                None => {
                    self.skip_payload(frame_offset, len)?;
                    self.advance(len);
                    self.stats.unknown_frame_types += 1;
                    self.warn_once(WarningKind::UnknownType, header.frame_type, || {
                        format!(
                            "Skipping unknown frame type {} at byte offset {}",
                            header.frame_type, frame_offset
                        )
                    });
                    continue;
                }
            };

            self.read_payload(frame_offset, len)?;
            self.advance(len);

            let mut malformed_can = 0u64;
            let decoded = decode_payload(frame_type, &self.payload, &mut malformed_can);

            if malformed_can > 0 {
                self.stats.malformed_can_entries += malformed_can;
                self.warn_once(WarningKind::MalformedCan, header.frame_type, || {
                    format!(
                        "Skipped {} malformed CAN entries in frame at byte offset {}",
                        malformed_can, frame_offset
                    )
                });
            }

            match decoded {
                Ok(payload) => {
                    log::trace!(
                        "Frame type {} at offset {} ({} bytes, t={})",
                        header.frame_type,
                        frame_offset,
                        len,
                        header.mono_time_ns
                    );
                    return Ok(Some(LogMessage {
                        offset: frame_offset,
                        mono_time_ns: header.mono_time_ns,
                        payload,
                    }));
                }
                Err(e) => {
                    self.stats.malformed_payloads += 1;
                    self.warn_once(WarningKind::MalformedPayload, header.frame_type, || {
                        format!(
                            "Skipping malformed {:?} payload at byte offset {}: {}",
                            frame_type, frame_offset, e
                        )
                    });
                }
            }
        }
    }

    fn advance(&mut self, payload_len: usize) {
        self.offset += (FRAME_HEADER_LEN + payload_len) as u64;
        self.stats.bytes_consumed = self.offset;
    }
}

impl<R: Read> Iterator for RlogReader<R> {
    type Item = Result<LogMessage>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }

        match self.next_message() {
            Ok(Some(message)) => Some(Ok(message)),
            Ok(None) => {
                self.finished = true;
                log::debug!(
                    "Reached end of log after {} frames ({} bytes, {} warnings)",
                    self.stats.frames,
                    self.offset,
                    self.stats.warnings()
                );
                None
            }
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}

/// Read until `buf` is full or the stream ends, returning the bytes read
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

fn invalid_data(message: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message)
}

fn read_str(cursor: &mut Cursor<&[u8]>) -> io::Result<String> {
    let len = cursor.read_u16::<LittleEndian>()? as usize;
    let mut bytes = vec![0u8; len];
    cursor.read_exact(&mut bytes)?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

fn decode_payload(
    frame_type: FrameType,
    payload: &[u8],
    malformed_can: &mut u64,
) -> io::Result<MessagePayload> {
    let mut cursor = Cursor::new(payload);

    match frame_type {
        FrameType::InitData => {
            let wall_time_ns = cursor.read_u64::<LittleEndian>()?;
            let dongle_id = read_str(&mut cursor)?;
            let version = read_str(&mut cursor)?;
            Ok(MessagePayload::InitData {
                wall_time_ns,
                dongle_id,
                version,
            })
        }
        FrameType::GpsLocation => Ok(MessagePayload::GpsLocation(GpsFix {
            unix_timestamp_ms: cursor.read_i64::<LittleEndian>()?,
            latitude: cursor.read_f64::<LittleEndian>()?,
            longitude: cursor.read_f64::<LittleEndian>()?,
            altitude: cursor.read_f64::<LittleEndian>()?,
            speed: cursor.read_f32::<LittleEndian>()?,
            has_fix: cursor.read_u8()? != 0,
        })),
        FrameType::VehicleState => {
            let message_type = read_str(&mut cursor)?;
            let count = cursor.read_u16::<LittleEndian>()?;
            let mut fields = Vec::with_capacity(usize::from(count).min(256));
            for _ in 0..count {
                let name = read_str(&mut cursor)?;
                let value = match cursor.read_u8()? {
                    0 => FieldValue::Float(cursor.read_f64::<LittleEndian>()?),
                    1 => FieldValue::Integer(cursor.read_i64::<LittleEndian>()?),
                    2 => FieldValue::Boolean(cursor.read_u8()? != 0),
                    3 => FieldValue::Enum(cursor.read_u16::<LittleEndian>()?),
                    other => {
                        return Err(invalid_data(format!(
                            "unknown value kind {} for field '{}'",
                            other, name
                        )))
                    }
                };
                fields.push(StateField { name, value });
            }
            Ok(MessagePayload::VehicleState {
                message_type,
                fields,
            })
        }
        FrameType::Can => {
            let count = cursor.read_u16::<LittleEndian>()?;
            let mut frames = Vec::with_capacity(usize::from(count).min(256));
            for _ in 0..count {
                match read_can_entry(&mut cursor) {
                    Ok(Some(frame)) => frames.push(frame),
                    Ok(None) => *malformed_can += 1,
                    Err(_) => {
                        // Entry cut short: nothing after it can be located
                        *malformed_can += 1;
                        break;
                    }
                }
            }
            Ok(MessagePayload::Can(frames))
        }
        FrameType::EncodeIndex => {
            let index = cursor.read_u8()?;
            let camera = Camera::from_index(index)
                .ok_or_else(|| invalid_data(format!("unknown camera index {}", index)))?;
            Ok(MessagePayload::EncodeIndex {
                camera,
                frame_id: cursor.read_u32::<LittleEndian>()?,
                timestamp_sof: cursor.read_u64::<LittleEndian>()?,
            })
        }
        FrameType::LogText => Ok(MessagePayload::Text {
            kind: LogKind::Info,
            text: String::from_utf8_lossy(payload).into_owned(),
        }),
        FrameType::ErrorLogText => Ok(MessagePayload::Text {
            kind: LogKind::Error,
            text: String::from_utf8_lossy(payload).into_owned(),
        }),
    }
}

/// Read one CAN entry; `Ok(None)` for an entry longer than 8 data bytes
fn read_can_entry(cursor: &mut Cursor<&[u8]>) -> io::Result<Option<RawCanFrame>> {
    let address = cursor.read_u32::<LittleEndian>()?;
    let bus = cursor.read_u8()?;
    let len = cursor.read_u8()? as usize;

    let mut data = vec![0u8; len];
    cursor.read_exact(&mut data)?;

    if len > MAX_CAN_DATA_LEN {
        return Ok(None);
    }
    Ok(Some(RawCanFrame { address, bus, data }))
}
