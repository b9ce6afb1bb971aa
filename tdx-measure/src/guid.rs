// Copyright (c) 2025 Intel Corporation
//
// SPDX-License-Identifier: BSD-2-Clause-Patent

//! EFI GUID codec.
//!
//! GUIDs are stored on the wire in mixed endianness: the first three fields
//! little-endian, the final eight bytes in string order. The layout is part
//! of the measurement preimages, so it is encoded explicitly instead of
//! through a library UUID type.

use core::fmt;
use core::str::FromStr;

const GUID_STRING_LEN: usize = 36;
const GUID_SPLITTER: u8 = b'-';

/// A GUID is a 128-bit integer (16 bytes) that can be
/// used as a unique identifier.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Guid {
    f0: u32,
    f1: u16,
    f2: u16,
    f3: [u8; 8],
}

#[derive(Debug, PartialEq, Eq)]
pub enum GuidParseError {
    InvalidInput,
}

impl fmt::Display for GuidParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid GUID string")
    }
}

impl std::error::Error for GuidParseError {}

impl Guid {
    // Create a GUID instance from several fields
    pub const fn from_fields(f0: u32, f1: u16, f2: u16, f3: [u8; 8]) -> Guid {
        Self { f0, f1, f2, f3 }
    }

    /// Encode into the 16-byte wire layout: `u32 LE | u16 LE | u16 LE | 8B`.
    pub fn to_bytes(&self) -> [u8; 16] {
        let mut bytes = [0u8; 16];
        bytes[0..4].copy_from_slice(&self.f0.to_le_bytes());
        bytes[4..6].copy_from_slice(&self.f1.to_le_bytes());
        bytes[6..8].copy_from_slice(&self.f2.to_le_bytes());
        bytes[8..16].copy_from_slice(&self.f3);
        bytes
    }

    pub fn from_bytes(buffer: &[u8; 16]) -> Guid {
        let f0 = u32::from_le_bytes(buffer[0..4].try_into().unwrap());
        let f1 = u16::from_le_bytes(buffer[4..6].try_into().unwrap());
        let f2 = u16::from_le_bytes(buffer[6..8].try_into().unwrap());
        let mut f3: [u8; 8] = [0; 8];
        f3.copy_from_slice(&buffer[8..]);

        Self { f0, f1, f2, f3 }
    }
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:08x}-{:04x}-{:04x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
            self.f0,
            self.f1,
            self.f2,
            self.f3[0],
            self.f3[1],
            self.f3[2],
            self.f3[3],
            self.f3[4],
            self.f3[5],
            self.f3[6],
            self.f3[7],
        )
    }
}

impl FromStr for Guid {
    type Err = GuidParseError;

    // Create a GUID instance from a string slice
    // Input should follow format strictly: "XXXXXXXX-XXXX-XXXX-XXXX-XXXXXXXXXXXX"
    // For example: "F9168C5E-CEB2-4faa-B6BF-329BF39FA1E4"
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let b = s.as_bytes();
        if b.len() != GUID_STRING_LEN
            || b[8] != GUID_SPLITTER
            || b[13] != GUID_SPLITTER
            || b[18] != GUID_SPLITTER
            || b[23] != GUID_SPLITTER
        {
            return Err(GuidParseError::InvalidInput);
        }

        let parse_hex = |s: &str| -> Option<u64> {
            for c in s.as_bytes() {
                if !c.is_ascii_hexdigit() {
                    return None;
                }
            }
            u64::from_str_radix(s, 16).ok()
        };

        // Parse the string into fields
        let f0 = parse_hex(&s[0..8]).ok_or(GuidParseError::InvalidInput)? as u32;
        let f1 = parse_hex(&s[9..13]).ok_or(GuidParseError::InvalidInput)? as u16;
        let f2 = parse_hex(&s[14..18]).ok_or(GuidParseError::InvalidInput)? as u16;
        let mut f3 = parse_hex(&s[19..23]).ok_or(GuidParseError::InvalidInput)? << 48;
        f3 |= parse_hex(&s[24..36]).ok_or(GuidParseError::InvalidInput)?;

        // f3 is decoded from string so use big endian to encode into bytes
        Ok(Self {
            f0,
            f1,
            f2,
            f3: u64::to_be_bytes(f3),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guid_wire_layout() {
        // f9168c5e-ceb2-4faa-b6bf-329bf39fa1e4
        let guid_bytes = [
            0x5E, 0x8C, 0x16, 0xF9, 0xB2, 0xCE, 0xaa, 0x4f, 0xB6, 0xBF, 0x32, 0x9B, 0xF3, 0x9F,
            0xA1, 0xE4,
        ];
        let guid_field = Guid::from_fields(
            0xF9168C5E,
            0xCEB2,
            0x4faa,
            [0xB6, 0xBF, 0x32, 0x9B, 0xF3, 0x9F, 0xA1, 0xE4],
        );

        assert_eq!(guid_bytes, guid_field.to_bytes());
        assert_eq!(Guid::from_bytes(&guid_bytes), guid_field);

        let guid_str = Guid::from_str("F9168C5E-CEB2-4faa-B6BF-329BF39FA1E4").unwrap();
        assert_eq!(guid_bytes, guid_str.to_bytes());
    }

    #[test]
    fn test_guid_string_round_trip() {
        for canonical in [
            "96b582de-1fb2-45f7-baea-a366c55a082d",
            "e47a6535-984a-4798-865e-4685a7bf8ec2",
            "e9eaf9f3-168e-44d5-a8eb-7f4d8738f6ae",
            "8be4df61-93ca-11d2-aa0d-00e098032b8c",
            "d719b2cb-3d3a-4596-a3bc-dad00e67656f",
            "00000000-0000-0000-0000-000000000000",
            "ffffffff-ffff-ffff-ffff-ffffffffffff",
        ] {
            let guid = Guid::from_str(canonical).unwrap();
            assert_eq!(guid.to_string(), canonical);
            assert_eq!(Guid::from_bytes(&guid.to_bytes()), guid);
        }
    }

    #[test]
    fn test_guid_from_str_rejects_malformed() {
        assert!(Guid::from_str("F9168C5E").is_err());
        assert!(Guid::from_str("F9168C5E-CEB2-4faa-B6BF-329").is_err());
        assert!(Guid::from_str("F9168C5E-CEB2-4faaB6-BF-329BF39FA1E4").is_err());
        assert!(Guid::from_str("+9168C5E-CEB2-4faa-B6BF-329BF39FA1E4").is_err());
        assert!(Guid::from_str("F9168C5ECCEB2C4faaCB6BFC329BF39FA1E4").is_err());
    }
}
