//! Intel HEX to binary conversion.
//!
//! Only contiguous images are produced: conversion stops at the first
//! address gap. Bytes below the MBR size are dropped.

use tracing::warn;

use super::error::FileFormatError;

const RECORD_DATA: u8 = 0x00;
const RECORD_END_OF_FILE: u8 = 0x01;
const RECORD_EXTENDED_SEGMENT_ADDRESS: u8 = 0x02;
const RECORD_START_SEGMENT_ADDRESS: u8 = 0x03;
const RECORD_EXTENDED_LINEAR_ADDRESS: u8 = 0x04;
const RECORD_START_LINEAR_ADDRESS: u8 = 0x05;

/// One decoded line: `:LLAAAATT<data>CC`.
struct Record {
    kind: u8,
    offset: u16,
    data: Vec<u8>,
}

/// Convert an Intel HEX file into a flat binary image.
///
/// # Arguments
/// * `hex` - Contents of the .hex file
/// * `mbr_size` - Bytes at addresses below this are skipped
///
/// # Returns
/// The image from its first byte up to the first gap or end of file
pub fn hex_to_bin(hex: &[u8], mbr_size: u32) -> Result<Vec<u8>, FileFormatError> {
    let mut bin = Vec::new();
    let mut base = 0u32;
    let mut next_address = 0u32;

    for (index, line) in hex.split(|&b| b == b'\n').enumerate() {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if line.is_empty() {
            continue;
        }
        let record = parse_record(line).map_err(|reason| FileFormatError::InvalidHex {
            line: index + 1,
            reason,
        })?;

        match record.kind {
            RECORD_DATA => {
                let address = base.wrapping_add(u32::from(record.offset));
                if !bin.is_empty() && address != next_address {
                    warn!("HEX file has a gap at 0x{:08X}, image ends there", next_address);
                    return Ok(bin);
                }
                for (i, byte) in record.data.iter().enumerate() {
                    if address.wrapping_add(i as u32) >= mbr_size {
                        bin.push(*byte);
                    }
                }
                next_address = address.wrapping_add(record.data.len() as u32);
            }
            RECORD_END_OF_FILE => return finish(bin),
            RECORD_EXTENDED_SEGMENT_ADDRESS | RECORD_EXTENDED_LINEAR_ADDRESS => {
                let value = address_value(&record, index)?;
                let address = if record.kind == RECORD_EXTENDED_LINEAR_ADDRESS {
                    value << 16
                } else {
                    value << 4
                };
                if !bin.is_empty() && address != next_address {
                    warn!("HEX file has a gap at 0x{:08X}, image ends there", next_address);
                    return Ok(bin);
                }
                base = address;
                next_address = address;
            }
            RECORD_START_SEGMENT_ADDRESS | RECORD_START_LINEAR_ADDRESS => {}
            other => {
                return Err(FileFormatError::InvalidHex {
                    line: index + 1,
                    reason: format!("unsupported record type 0x{:02X}", other),
                })
            }
        }
    }

    finish(bin)
}

fn finish(bin: Vec<u8>) -> Result<Vec<u8>, FileFormatError> {
    if bin.is_empty() {
        return Err(FileFormatError::EmptyImage);
    }
    Ok(bin)
}

fn address_value(record: &Record, index: usize) -> Result<u32, FileFormatError> {
    match record.data.as_slice() {
        [msb, lsb] => Ok(u32::from(u16::from_be_bytes([*msb, *lsb]))),
        _ => Err(FileFormatError::InvalidHex {
            line: index + 1,
            reason: "address record must carry 2 bytes".to_string(),
        }),
    }
}

fn parse_record(line: &[u8]) -> Result<Record, String> {
    let digits = line
        .strip_prefix(b":")
        .ok_or_else(|| "record does not start with ':'".to_string())?;
    if digits.len() % 2 != 0 {
        return Err("odd number of hex digits".to_string());
    }

    let bytes = digits
        .chunks(2)
        .map(|pair| {
            std::str::from_utf8(pair)
                .ok()
                .and_then(|s| u8::from_str_radix(s, 16).ok())
                .ok_or_else(|| format!("'{}' is not a hex byte", String::from_utf8_lossy(pair)))
        })
        .collect::<Result<Vec<u8>, String>>()?;

    // length, offset (2), type, checksum
    if bytes.len() < 5 {
        return Err("record too short".to_string());
    }
    let length = bytes[0] as usize;
    if bytes.len() != length + 5 {
        return Err(format!(
            "record announces {} data bytes but carries {}",
            length,
            bytes.len() - 5
        ));
    }
    let sum = bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
    if sum != 0 {
        return Err("checksum mismatch".to_string());
    }

    Ok(Record {
        kind: bytes[3],
        offset: u16::from_be_bytes([bytes[1], bytes[2]]),
        data: bytes[4..4 + length].to_vec(),
    })
}
