// Copyright (c) 2025 Intel Corporation
//
// SPDX-License-Identifier: BSD-2-Clause-Patent

//! MRTD reproduction.
//!
//! The TDX module measures the initial guest memory while the VMM builds
//! the TD: every added page contributes a `TDH.MEM.PAGE.ADD` extension
//! block, and pages of measured sections additionally contribute
//! `TDH.MR.EXTEND` blocks carrying their contents in 256-byte chunks.
//! Replaying those extension blocks over the firmware image yields the
//! MRTD a quote would report.

use sha2::{Digest, Sha384};

use crate::metadata::TdFirmware;
use crate::SHA384_DIGEST_SIZE;

const MRTD_EXTENSION_BUFFER_SIZE: usize = 0x80;
const TDH_MR_EXTEND_GRANULARITY: u64 = 0x100;
const PAGE_SIZE: u64 = 0x1000;

const MEM_PAGE_ADD_ASCII: &[u8] = b"MEM.PAGE.ADD";
const MR_EXTEND_ASCII: &[u8] = b"MR.EXTEND";
const GPA_OFFSET: usize = 0x10;

/// Compute the MRTD of a parsed firmware image.
///
/// Pure function of the image bytes; the section order of the metadata
/// table defines the extension order.
pub fn reproduce_mrtd(firmware: &TdFirmware) -> [u8; SHA384_DIGEST_SIZE] {
    let mut hasher = Sha384::new();
    let mut buffer = [0u8; MRTD_EXTENSION_BUFFER_SIZE];

    for section in firmware.sections() {
        let nr_pages = section.mem_size / PAGE_SIZE;
        for page in 0..nr_pages {
            let gpa = section.mem_base + page * PAGE_SIZE;

            // TDCALL [TDH.MEM.PAGE.ADD]
            fill_buffer_with_mem_page_add(&mut buffer, gpa);
            hasher.update(buffer);

            if !section.extend_mr {
                continue;
            }

            // TDCALL [TDH.MR.EXTEND], 256 bytes at a time
            for chunk in 0..PAGE_SIZE / TDH_MR_EXTEND_GRANULARITY {
                let chunk_gpa = gpa + chunk * TDH_MR_EXTEND_GRANULARITY;
                fill_buffer_with_mr_extend(&mut buffer, chunk_gpa);
                hasher.update(buffer);

                let raw = section.raw_offset as usize
                    + (page * PAGE_SIZE + chunk * TDH_MR_EXTEND_GRANULARITY) as usize;
                let half = MRTD_EXTENSION_BUFFER_SIZE;
                hasher.update(&firmware.bytes()[raw..raw + half]);
                hasher.update(&firmware.bytes()[raw + half..raw + 2 * half]);
            }
        }
    }

    hasher.finalize().into()
}

// Byte 0 through 11 contain the ASCII string 'MEM.PAGE.ADD'.
// Byte 16 through 23 contain the GPA (in little-endian format).
// All the other bytes contain 0.
fn fill_buffer_with_mem_page_add(buf: &mut [u8; MRTD_EXTENSION_BUFFER_SIZE], gpa: u64) {
    buf.fill(0);
    buf[..MEM_PAGE_ADD_ASCII.len()].copy_from_slice(MEM_PAGE_ADD_ASCII);
    buf[GPA_OFFSET..GPA_OFFSET + 8].copy_from_slice(&gpa.to_le_bytes());
}

// Byte 0 through 8 contain the ASCII string 'MR.EXTEND'.
// Byte 16 through 23 contain the GPA (in little-endian format).
// The two following extension buffers carry the chunk's contents.
fn fill_buffer_with_mr_extend(buf: &mut [u8; MRTD_EXTENSION_BUFFER_SIZE], gpa: u64) {
    buf.fill(0);
    buf[..MR_EXTEND_ASCII.len()].copy_from_slice(MR_EXTEND_ASCII);
    buf[GPA_OFFSET..GPA_OFFSET + 8].copy_from_slice(&gpa.to_le_bytes());
}
