// Copyright (c) 2025 Intel Corporation
//
// SPDX-License-Identifier: BSD-2-Clause-Patent

//! Byte-level helpers shared by the measurement modules.

use sha2::{Digest, Sha384};

use crate::SHA384_DIGEST_SIZE;

/// Compute the SHA-384 digest of a byte slice.
pub fn sha384(data: &[u8]) -> [u8; SHA384_DIGEST_SIZE] {
    let mut hasher = Sha384::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Encode a string as UTF-16LE, two bytes per code unit.
///
/// Code points outside the BMP are emitted as surrogate pairs.
pub fn utf16_encode(s: &str) -> Vec<u8> {
    s.encode_utf16().flat_map(u16::to_le_bytes).collect()
}

/// Render bytes as a lowercase hex string.
pub fn bytes_to_hex(bytes: &[u8]) -> String {
    hex::encode(bytes)
}
