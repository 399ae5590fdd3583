//! Firmware image loading.
//!
//! A format registry maps names and file extensions to loaders; callers can
//! force a format by name or let the extension decide. Two formats ship:
//! `intel-hex` for the `.hex` files the usual toolchains emit, and `raw`
//! for plain binary dumps (the fallback for unknown extensions).

use std::path::Path;

use crate::error::{Error, Result};

/// A loaded firmware image.
#[derive(Debug, Clone)]
pub struct Firmware {
    name: String,
    image: Vec<u8>,
}

impl Firmware {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn image(&self) -> &[u8] {
        &self.image
    }

    pub fn size(&self) -> usize {
        self.image.len()
    }

    /// Load a firmware file.
    ///
    /// With `format: None`, the loader is picked by file extension and
    /// unknown extensions fall back to `raw`. An explicit unknown format
    /// name is an error.
    pub fn load(path: &Path, format: Option<&str>) -> Result<Firmware> {
        let fmt = match format {
            Some(name) => find_format(name).ok_or_else(|| {
                Error::Unsupported(format!("Unknown firmware format '{name}'"))
            })?,
            None => detect_format(path),
        };

        let contents = std::fs::read(path).map_err(|e| match Error::from(e) {
            Error::NotFound(_) => {
                Error::NotFound(format!("Firmware file '{}' not found", path.display()))
            }
            other => other,
        })?;

        let image = (fmt.load)(&contents)?;

        Ok(Firmware {
            name: path.display().to_string(),
            image,
        })
    }
}

/// One entry in the format registry.
pub struct FirmwareFormat {
    pub name: &'static str,
    pub extensions: &'static [&'static str],
    load: fn(&[u8]) -> Result<Vec<u8>>,
}

/// Registered formats, tried in order for extension detection.
pub const FORMATS: &[FirmwareFormat] = &[
    FirmwareFormat {
        name: "intel-hex",
        extensions: &["hex", "ihex"],
        load: load_intel_hex,
    },
    FirmwareFormat {
        name: "raw",
        extensions: &["bin"],
        load: load_raw,
    },
];

fn find_format(name: &str) -> Option<&'static FirmwareFormat> {
    FORMATS.iter().find(|f| f.name == name)
}

fn detect_format(path: &Path) -> &'static FirmwareFormat {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);

    if let Some(ext) = ext {
        for fmt in FORMATS {
            if fmt.extensions.contains(&ext.as_str()) {
                return fmt;
            }
        }
    }

    // Anything unrecognized is treated as a raw dump.
    find_format("raw").unwrap()
}

fn load_raw(contents: &[u8]) -> Result<Vec<u8>> {
    Ok(contents.to_vec())
}

/// Largest image the HEX loader will assemble. Guards against corrupt
/// extended-address records allocating gigabytes.
const MAX_IMAGE_SIZE: usize = 8 * 1024 * 1024;

/// Intel HEX loader.
///
/// Supports record types 00 (data), 01 (EOF), 02 (extended segment
/// address), and 04 (extended linear address); the start-address records
/// 03 and 05 are ignored. Every record's checksum is verified and gaps
/// between records are filled with `0xFF` (erased flash).
fn load_intel_hex(contents: &[u8]) -> Result<Vec<u8>> {
    let text = std::str::from_utf8(contents)
        .map_err(|_| Error::Firmware("HEX file contains invalid UTF-8".into()))?;

    let mut image: Vec<u8> = Vec::new();
    let mut base: usize = 0;
    let mut seen_eof = false;

    for (lineno, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if seen_eof {
            return Err(hex_error(lineno, "data after end-of-file record"));
        }

        let record = parse_hex_record(line).map_err(|msg| hex_error(lineno, msg))?;

        match record.kind {
            0x00 => {
                let start = base + record.address as usize;
                let end = start + record.data.len();
                if end > MAX_IMAGE_SIZE {
                    return Err(hex_error(lineno, "image exceeds the size limit"));
                }
                if end > image.len() {
                    image.resize(end, 0xFF);
                }
                image[start..end].copy_from_slice(&record.data);
            }
            0x01 => seen_eof = true,
            0x02 => {
                base = record_address_field(&record, lineno)? << 4;
            }
            0x04 => {
                base = record_address_field(&record, lineno)? << 16;
            }
            0x03 | 0x05 => {}
            other => {
                return Err(hex_error(lineno, &format!("unknown record type {other:#04x}")));
            }
        }
    }

    if !seen_eof {
        return Err(Error::Firmware("HEX file is missing its end-of-file record".into()));
    }

    Ok(image)
}

struct HexRecord {
    address: u16,
    kind: u8,
    data: Vec<u8>,
}

fn hex_error(lineno: usize, msg: &str) -> Error {
    Error::Firmware(format!("Invalid HEX file (line {}): {msg}", lineno + 1))
}

fn record_address_field(record: &HexRecord, lineno: usize) -> Result<usize> {
    if record.data.len() != 2 {
        return Err(hex_error(lineno, "extended address record must carry 2 bytes"));
    }
    Ok(usize::from(u16::from_be_bytes([record.data[0], record.data[1]])))
}

fn parse_hex_record(line: &str) -> std::result::Result<HexRecord, &'static str> {
    let body = line.strip_prefix(':').ok_or("record does not start with ':'")?;
    if body.len() % 2 != 0 {
        return Err("odd number of hex digits");
    }

    let mut bytes = Vec::with_capacity(body.len() / 2);
    for i in (0..body.len()).step_by(2) {
        let byte = u8::from_str_radix(&body[i..i + 2], 16).map_err(|_| "invalid hex digit")?;
        bytes.push(byte);
    }

    if bytes.len() < 5 {
        return Err("record too short");
    }

    let length = bytes[0] as usize;
    if bytes.len() != length + 5 {
        return Err("record length mismatch");
    }

    let sum: u8 = bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
    if sum != 0 {
        return Err("checksum mismatch");
    }

    Ok(HexRecord {
        address: u16::from_be_bytes([bytes[1], bytes[2]]),
        kind: bytes[3],
        data: bytes[4..4 + length].to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_file(dir: &tempfile::TempDir, name: &str, contents: &[u8]) -> std::path::PathBuf {
        let path = dir.path().join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(contents).unwrap();
        path
    }

    #[test]
    fn raw_load_round_trips_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, "blink.bin", &[1, 2, 3, 4]);
        let fw = Firmware::load(&path, None).unwrap();
        assert_eq!(fw.image(), &[1, 2, 3, 4]);
        assert_eq!(fw.size(), 4);
    }

    #[test]
    fn unknown_extension_falls_back_to_raw() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, "blink.firmware", &[0xAA, 0xBB]);
        let fw = Firmware::load(&path, None).unwrap();
        assert_eq!(fw.image(), &[0xAA, 0xBB]);
    }

    #[test]
    fn explicit_unknown_format_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, "blink.bin", &[0]);
        let err = Firmware::load(&path, Some("elf")).unwrap_err();
        assert_eq!(err.kind(), "unsupported");
    }

    #[test]
    fn missing_file_is_not_found() {
        let err = Firmware::load(Path::new("/nonexistent/blink.hex"), None).unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }

    // ── Intel HEX ──────────────────────────────────────────────

    #[test]
    fn hex_simple_data_record() {
        // 4 bytes 01 02 03 04 at address 0.
        let hex = ":0400000001020304F2\n:00000001FF\n";
        let image = load_intel_hex(hex.as_bytes()).unwrap();
        assert_eq!(image, vec![1, 2, 3, 4]);
    }

    #[test]
    fn hex_gaps_are_filled_with_ff() {
        let hex = ":0100000011EE\n:0100040022D9\n:00000001FF\n";
        let image = load_intel_hex(hex.as_bytes()).unwrap();
        assert_eq!(image, vec![0x11, 0xFF, 0xFF, 0xFF, 0x22]);
    }

    #[test]
    fn hex_odd_digit_count_is_rejected() {
        let hex = ":01000400228D9\n:00000001FF\n";
        let err = load_intel_hex(hex.as_bytes()).unwrap_err();
        assert!(err.to_string().contains("odd number"));
    }

    #[test]
    fn hex_extended_linear_address_offsets_data() {
        // Base 0x0001_0000 is far past the size guard? No: 64 KiB, fine.
        let hex = ":020000040001F9\n:0100000033CC\n:00000001FF\n";
        let image = load_intel_hex(hex.as_bytes()).unwrap();
        assert_eq!(image.len(), 0x1_0001);
        assert_eq!(image[0x1_0000], 0x33);
        assert_eq!(image[0], 0xFF);
    }

    #[test]
    fn hex_extended_segment_address_offsets_data() {
        // Segment 0x1000 << 4 = 0x10000.
        let hex = ":020000021000EC\n:0100000044BB\n:00000001FF\n";
        let image = load_intel_hex(hex.as_bytes()).unwrap();
        assert_eq!(image.len(), 0x1_0001);
        assert_eq!(image[0x1_0000], 0x44);
    }

    #[test]
    fn hex_checksum_mismatch_is_rejected() {
        let hex = ":0400000001020304F3\n:00000001FF\n";
        let err = load_intel_hex(hex.as_bytes()).unwrap_err();
        assert_eq!(err.kind(), "firmware");
        assert!(err.to_string().contains("checksum"));
    }

    #[test]
    fn hex_missing_eof_is_rejected() {
        let hex = ":0400000001020304F2\n";
        let err = load_intel_hex(hex.as_bytes()).unwrap_err();
        assert!(err.to_string().contains("end-of-file"));
    }

    #[test]
    fn hex_data_after_eof_is_rejected() {
        let hex = ":00000001FF\n:0400000001020304F2\n";
        let err = load_intel_hex(hex.as_bytes()).unwrap_err();
        assert!(err.to_string().contains("after end-of-file"));
    }

    #[test]
    fn hex_start_address_records_are_ignored() {
        let hex = ":0400000501020304ED\n:0100000055AA\n:00000001FF\n";
        let image = load_intel_hex(hex.as_bytes()).unwrap();
        assert_eq!(image, vec![0x55]);
    }

    #[test]
    fn hex_file_loads_through_firmware_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, "blink.hex", b":020000001234B8\n:00000001FF\n");
        let fw = Firmware::load(&path, None).unwrap();
        assert_eq!(fw.image(), &[0x12, 0x34]);
    }
}
