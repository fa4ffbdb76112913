//! Minimal DDS header reader.
//!
//! Reads only the fixed-size header: magic, dimensions and pixel format. No
//! pixel data is touched, so this is cheap enough to run on every merged asset.
//!
//! ```text
//! offset  size  field
//! 0       4     magic "DDS "
//! 4       4     header size (always 124)
//! 12      4     height (LE)
//! 16      4     width (LE)
//! 84      4     pixel format FourCC
//! 128     4     dxgiFormat (only when FourCC == "DX10")
//! ```

use std::fs::File;
use std::io::Read;
use std::path::Path;
use thiserror::Error;

const MAGIC: &[u8; 4] = b"DDS ";
const HEADER_SIZE: u32 = 124;
/// Magic + header.
const BASE_LEN: usize = 4 + HEADER_SIZE as usize;
/// Magic + header + DX10 extension header.
const DX10_LEN: usize = BASE_LEN + 20;

#[derive(Error, Debug)]
pub enum DdsError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("not a DDS file (bad magic)")]
    BadMagic,
    #[error("truncated header ({0} bytes)")]
    Truncated(usize),
    #[error("unexpected header size {0}")]
    BadHeaderSize(u32),
    #[error("zero dimension {0}x{1}")]
    ZeroDimension(u32, u32),
}

/// Parsed DDS header fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DdsInfo {
    pub width: u32,
    pub height: u32,
    /// FourCC or DXGI format name, when recognizable.
    pub format: Option<String>,
}

fn le_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}

/// Map the DXGI formats texture mods actually ship to their names.
fn dxgi_format_name(code: u32) -> Option<&'static str> {
    Some(match code {
        28 => "R8G8B8A8_UNORM",
        29 => "R8G8B8A8_UNORM_SRGB",
        71 => "BC1_UNORM",
        72 => "BC1_UNORM_SRGB",
        74 => "BC2_UNORM",
        77 => "BC3_UNORM",
        78 => "BC3_UNORM_SRGB",
        80 => "BC4_UNORM",
        83 => "BC5_UNORM",
        84 => "BC5_SNORM",
        87 => "B8G8R8A8_UNORM",
        95 => "BC6H_UF16",
        98 => "BC7_UNORM",
        99 => "BC7_UNORM_SRGB",
        _ => return None,
    })
}

/// Parse a DDS header from the first bytes of a file.
pub fn parse_header(bytes: &[u8]) -> Result<DdsInfo, DdsError> {
    if bytes.len() < 4 || &bytes[..4] != MAGIC {
        return Err(DdsError::BadMagic);
    }
    if bytes.len() < BASE_LEN {
        return Err(DdsError::Truncated(bytes.len()));
    }
    let header_size = le_u32(bytes, 4);
    if header_size != HEADER_SIZE {
        return Err(DdsError::BadHeaderSize(header_size));
    }

    let height = le_u32(bytes, 12);
    let width = le_u32(bytes, 16);
    if width == 0 || height == 0 {
        return Err(DdsError::ZeroDimension(width, height));
    }

    let fourcc = &bytes[84..88];
    let format = if fourcc == b"DX10" {
        if bytes.len() >= DX10_LEN {
            dxgi_format_name(le_u32(bytes, 128)).map(str::to_string)
        } else {
            None
        }
    } else if fourcc.iter().all(|b| b.is_ascii_alphanumeric()) {
        Some(String::from_utf8_lossy(fourcc).into_owned())
    } else {
        // Uncompressed formats leave FourCC zeroed
        None
    };

    Ok(DdsInfo {
        width,
        height,
        format,
    })
}

/// Read and parse the header of a DDS file on disk.
pub fn read_header(path: &Path) -> Result<DdsInfo, DdsError> {
    let mut file = File::open(path)?;
    let mut buf = Vec::with_capacity(DX10_LEN);
    file.by_ref().take(DX10_LEN as u64).read_to_end(&mut buf)?;
    parse_header(&buf)
}

/// Build a minimal, valid DDS header. Used by tests and the recording mocks
/// to stand in for real codec output.
#[cfg(test)]
pub fn synth_header(width: u32, height: u32, fourcc: &[u8; 4]) -> Vec<u8> {
    let mut bytes = vec![0u8; BASE_LEN];
    bytes[..4].copy_from_slice(MAGIC);
    bytes[4..8].copy_from_slice(&HEADER_SIZE.to_le_bytes());
    bytes[12..16].copy_from_slice(&height.to_le_bytes());
    bytes[16..20].copy_from_slice(&width.to_le_bytes());
    bytes[84..88].copy_from_slice(fourcc);
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn parses_dimensions() {
        let info = parse_header(&synth_header(1024, 512, b"DXT5")).unwrap();
        assert_eq!(info.width, 1024);
        assert_eq!(info.height, 512);
        assert_eq!(info.format.as_deref(), Some("DXT5"));
    }

    #[test]
    fn parses_dx10_format() {
        let mut bytes = synth_header(2048, 2048, b"DX10");
        bytes.extend_from_slice(&[0u8; 20]);
        bytes[128..132].copy_from_slice(&98u32.to_le_bytes());
        let info = parse_header(&bytes).unwrap();
        assert_eq!(info.format.as_deref(), Some("BC7_UNORM"));
    }

    #[test]
    fn dx10_without_extension_has_no_format() {
        let info = parse_header(&synth_header(64, 64, b"DX10")).unwrap();
        assert_eq!(info.format, None);
    }

    #[test]
    fn uncompressed_has_no_format() {
        let info = parse_header(&synth_header(64, 64, &[0, 0, 0, 0])).unwrap();
        assert_eq!(info.format, None);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut bytes = synth_header(64, 64, b"DXT1");
        bytes[0] = b'X';
        assert!(matches!(parse_header(&bytes), Err(DdsError::BadMagic)));
        assert!(matches!(parse_header(b""), Err(DdsError::BadMagic)));
    }

    #[test]
    fn rejects_truncated() {
        let bytes = synth_header(64, 64, b"DXT1");
        assert!(matches!(
            parse_header(&bytes[..40]),
            Err(DdsError::Truncated(40))
        ));
    }

    #[test]
    fn rejects_zero_dimension() {
        let bytes = synth_header(0, 64, b"DXT1");
        assert!(matches!(
            parse_header(&bytes),
            Err(DdsError::ZeroDimension(0, 64))
        ));
    }

    #[test]
    fn reads_from_disk() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("a.dds");
        let mut bytes = synth_header(300, 200, b"ATI2");
        bytes.extend_from_slice(&[7u8; 4096]);
        fs::write(&path, bytes).unwrap();

        let info = read_header(&path).unwrap();
        assert_eq!((info.width, info.height), (300, 200));
        assert_eq!(info.format.as_deref(), Some("ATI2"));
    }
}
