//! Binary event log format
//!
//! This module contains the reader and writer for the segmented message log.
//! The reader is an iterator over typed [`LogMessage`](crate::types::LogMessage)
//! values; the writer produces the same framing.

use crate::types::{ImportError, Result};
use std::path::Path;

pub mod rlog;
pub mod writer;

pub use rlog::{DecodeStats, FrameHeader, FrameType, RlogReader, FRAME_HEADER_LEN, MAX_PAYLOAD_LEN};
pub use writer::LogWriter;

const BZIP2_MAGIC: &[u8] = b"BZh";
const ZSTD_MAGIC: &[u8] = &[0x28, 0xB5, 0x2F, 0xFD];

/// Identify a compressed stream by its leading bytes
pub fn sniff_compression(prefix: &[u8]) -> Option<&'static str> {
    if prefix.len() >= 4 && prefix.starts_with(BZIP2_MAGIC) && (b'1'..=b'9').contains(&prefix[3]) {
        return Some("bzip2");
    }
    if prefix.starts_with(ZSTD_MAGIC) {
        return Some("zstd");
    }
    None
}

/// Reject paths whose extension marks them as compressed
pub fn check_extension(path: &Path) -> Result<()> {
    let format = match path.extension().and_then(|e| e.to_str()) {
        Some(ext) if ext.eq_ignore_ascii_case("bz2") => "bzip2",
        Some(ext) if ext.eq_ignore_ascii_case("zst") => "zstd",
        _ => return Ok(()),
    };
    Err(ImportError::CompressedInput { format })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sniff_compression() {
        assert_eq!(sniff_compression(b"BZh91AY&SY"), Some("bzip2"));
        assert_eq!(sniff_compression(&[0x28, 0xB5, 0x2F, 0xFD, 0x00]), Some("zstd"));
        assert_eq!(sniff_compression(b"BZhx"), None);
        assert_eq!(sniff_compression(&[16, 0, 0, 0, 1, 0]), None);
        assert_eq!(sniff_compression(&[]), None);
    }

    #[test]
    fn test_check_extension() {
        assert!(check_extension(Path::new("/data/a--b--0/rlog")).is_ok());
        assert!(matches!(
            check_extension(Path::new("/data/a--b--0/rlog.bz2")),
            Err(ImportError::CompressedInput { format: "bzip2" })
        ));
        assert!(matches!(
            check_extension(Path::new("rlog.ZST")),
            Err(ImportError::CompressedInput { format: "zstd" })
        ));
    }
}
