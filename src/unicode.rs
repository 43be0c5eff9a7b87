//! UTF-8 and UTF-16 conversions for string descriptors
//!
//! The UTF-8 decoder follows the original six-row sequence table, so it
//! recognizes lead bytes of up to six byte sequences, then rejects anything
//! that isn't a valid Unicode scalar value: overlong forms, surrogates and
//! code points above U+10FFFF.

use crate::descriptor::descriptor_type;
use crate::error::{Error, Result};
use alloc::{string::String, vec::Vec};

/// Maximum size of any descriptor, including string descriptors
const DESCRIPTOR_MAX: usize = 255;

/// `(lead mask, lead value, payload mask, smallest code point)` per sequence
/// length
const UTF8_TABLE: [(u8, u8, u32, u32); 6] = [
    (0x80, 0x00, 0x7F, 0),
    (0xE0, 0xC0, 0x1F, 0x80),
    (0xF0, 0xE0, 0x0F, 0x800),
    (0xF8, 0xF0, 0x07, 0x1_0000),
    (0xFC, 0xF8, 0x03, 0x20_0000),
    (0xFE, 0xFC, 0x01, 0x400_0000),
];

const SURROGATE_HIGH: core::ops::RangeInclusive<u32> = 0xD800..=0xDBFF;
const SURROGATE_LOW: core::ops::RangeInclusive<u32> = 0xDC00..=0xDFFF;
const UNICODE_MAX: u32 = 0x10_FFFF;

/// Decode one code point from the front of `src`
///
/// Returns the code point and the number of bytes consumed.
fn utf8_decode(src: &[u8]) -> Result<(u32, usize)> {
    let lead = *src.first().ok_or(Error::Inval)?;
    let (len, &(_, _, payload, min)) = UTF8_TABLE
        .iter()
        .enumerate()
        .find(|(_, (mask, value, _, _))| lead & mask == *value)
        .ok_or(Error::Inval)?;
    let len = len + 1;
    let tail = src.get(1..len).ok_or(Error::Inval)?;

    let mut code = u32::from(lead) & payload;
    for &byte in tail {
        if byte & 0xC0 != 0x80 {
            return Err(Error::Inval);
        }
        code = (code << 6) | u32::from(byte & 0x3F);
    }
    if code < min
        || code > UNICODE_MAX
        || SURROGATE_HIGH.contains(&code)
        || SURROGATE_LOW.contains(&code)
    {
        return Err(Error::Inval);
    }
    Ok((code, len))
}

fn utf8_encode(code: u32, dst: &mut Vec<u8>) {
    match code {
        0..=0x7F => dst.push(code as u8),
        0x80..=0x7FF => {
            dst.extend_from_slice(&[0xC0 | (code >> 6) as u8, 0x80 | (code & 0x3F) as u8])
        }
        0x800..=0xFFFF => dst.extend_from_slice(&[
            0xE0 | (code >> 12) as u8,
            0x80 | ((code >> 6) & 0x3F) as u8,
            0x80 | (code & 0x3F) as u8,
        ]),
        _ => dst.extend_from_slice(&[
            0xF0 | (code >> 18) as u8,
            0x80 | ((code >> 12) & 0x3F) as u8,
            0x80 | ((code >> 6) & 0x3F) as u8,
            0x80 | (code & 0x3F) as u8,
        ]),
    }
}

/// Convert UTF-8 bytes to UTF-16 code units
///
/// Fails with [`Error::Inval`] on any invalid sequence.
pub fn utf8s_to_utf16s(src: &[u8]) -> Result<Vec<u16>> {
    let mut dst = Vec::with_capacity(src.len());
    let mut rest = src;
    while !rest.is_empty() {
        let (code, used) = utf8_decode(rest)?;
        rest = &rest[used..];
        if code > 0xFFFF {
            let code = code - 0x1_0000;
            dst.push(0xD800 | (code >> 10) as u16);
            dst.push(0xDC00 | (code & 0x3FF) as u16);
        } else {
            dst.push(code as u16);
        }
    }
    Ok(dst)
}

/// Convert UTF-16 code units to UTF-8 bytes
///
/// Fails with [`Error::Inval`] on unpaired surrogates.
pub fn utf16s_to_utf8s(src: &[u16]) -> Result<Vec<u8>> {
    let mut dst = Vec::with_capacity(src.len());
    let mut units = src.iter().map(|&unit| u32::from(unit));
    while let Some(unit) = units.next() {
        let code = if SURROGATE_HIGH.contains(&unit) {
            let low = units.next().ok_or(Error::Inval)?;
            if !SURROGATE_LOW.contains(&low) {
                return Err(Error::Inval);
            }
            0x1_0000 + ((unit - 0xD800) << 10) + (low - 0xDC00)
        } else if SURROGATE_LOW.contains(&unit) {
            return Err(Error::Inval);
        } else {
            unit
        };
        utf8_encode(code, &mut dst);
    }
    Ok(dst)
}

/// Build a string descriptor from UTF-8 text
///
/// Text that doesn't fit the 255 byte descriptor is truncated without
/// splitting a surrogate pair.
pub fn string_descriptor(utf8: &[u8]) -> Result<Vec<u8>> {
    let units = utf8s_to_utf16s(utf8)?;
    let mut count = units.len().min((DESCRIPTOR_MAX - 2) / 2);
    if count > 0
        && count < units.len()
        && SURROGATE_HIGH.contains(&u32::from(units[count - 1]))
    {
        count -= 1;
    }
    let mut desc = Vec::with_capacity(2 + count * 2);
    desc.push((2 + count * 2) as u8);
    desc.push(descriptor_type::STRING);
    for unit in &units[..count] {
        desc.extend_from_slice(&unit.to_le_bytes());
    }
    Ok(desc)
}

/// Build string descriptor zero, the list of supported language IDs
pub fn langid_descriptor(lang_ids: &[u16]) -> Vec<u8> {
    let count = lang_ids.len().min((DESCRIPTOR_MAX - 2) / 2);
    let mut desc = Vec::with_capacity(2 + count * 2);
    desc.push((2 + count * 2) as u8);
    desc.push(descriptor_type::STRING);
    for id in &lang_ids[..count] {
        desc.extend_from_slice(&id.to_le_bytes());
    }
    desc
}

/// Decode the UTF-16 payload of a string descriptor
pub fn parse_string_descriptor(desc: &[u8]) -> Result<String> {
    if desc.len() < 2 || desc[1] != descriptor_type::STRING {
        return Err(Error::BadF);
    }
    let len = usize::from(desc[0]);
    if len < 2 || len > desc.len() || len % 2 != 0 {
        return Err(Error::BadF);
    }
    let units: Vec<u16> = desc[2..len]
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    let utf8 = utf16s_to_utf8s(&units)?;
    String::from_utf8(utf8).map_err(|_| Error::BadF)
}
