// Copyright (c) 2025 Intel Corporation
//
// SPDX-License-Identifier: BSD-2-Clause-Patent

//! Portable Executable parsing and measurement.
//!
//! The firmware measures every loaded EFI application over its Authenticode
//! byte range: the headers minus the Checksum field and the certificate
//! directory entry, the section raw data in file order, and any trailing
//! bytes that are not the attribute certificate table. UKI payloads are
//! plain PE files whose `.linux`/`.initrd`/`.cmdline` sections carry the
//! bundled kernel, so the same parser also drives payload extraction.

use core::fmt;
use scroll::Pread;
use sha2::{Digest, Sha384};

use crate::SHA384_DIGEST_SIZE;

const DOS_SIGNATURE: u16 = 0x5a4d;
const PE_SIGNATURE: u32 = 0x0000_4550;
const OPTIONAL_HDR32_MAGIC: u16 = 0x10b;
const OPTIONAL_HDR64_MAGIC: u16 = 0x20b;

// DOS header is 64 bytes.
const DOS_HEADER_SIZE: usize = 0x40;
// PE signature plus COFF file header is 24 bytes.
const COFF_HEADER_SIZE: usize = 24;
// COFF section header is 40 bytes.
const COFF_SECTION_SIZE: usize = 40;
// Fixed optional-header size up to the data directories.
const OPTIONAL_HDR32_FIXED_SIZE: usize = 96;
const OPTIONAL_HDR64_FIXED_SIZE: usize = 112;

const CHECKSUM_FIELD_OFFSET: usize = 0x40;
const SIZE_OF_HEADERS_OFFSET: usize = 60;
// The certificate table is data directory entry 4.
const CERT_DIRECTORY_INDEX: usize = 4;

#[derive(Debug, PartialEq, Eq)]
pub enum PeDecodeError {
    /// Missing or undersized DOS header.
    BadDosHeader,
    /// The bytes at `e_lfanew` are not `PE\0\0`.
    BadPeSignature,
    /// The optional-header magic is neither PE32 nor PE32+.
    UnknownOptionalMagic(u16),
    /// A header or section offset points outside the image.
    OutOfBounds,
    /// The image is smaller than the hashed range plus the certificate.
    TruncatedImage {
        image_size: usize,
        expected: usize,
    },
}

impl fmt::Display for PeDecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadDosHeader => write!(f, "bad DOS header"),
            Self::BadPeSignature => write!(f, "bad PE signature"),
            Self::UnknownOptionalMagic(magic) => {
                write!(f, "unknown optional-header magic {:#06x}", magic)
            }
            Self::OutOfBounds => write!(f, "header offsets exceed the image size"),
            Self::TruncatedImage {
                image_size,
                expected,
            } => write!(
                f,
                "image size {} below hashed range plus certificate {}",
                image_size, expected
            ),
        }
    }
}

impl std::error::Error for PeDecodeError {}

/// COFF section header.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pread)]
pub struct Section {
    pub name: [u8; 8],
    pub virtual_size: u32,
    pub virtual_address: u32,
    pub size_of_raw_data: u32,
    pub pointer_to_raw_data: u32,
    pub pointer_to_relocations: u32,
    pub pointer_to_line_numbers: u32,
    pub number_of_relocations: u16,
    pub number_of_line_numbers: u16,
    pub characteristics: u32,
}

/// A parsed PE/COFF image borrowing its backing bytes.
#[derive(Debug)]
pub struct PortableExecutable<'a> {
    image: &'a [u8],
    optional_header_offset: usize,
    optional_header_fixed_size: usize,
    size_of_headers: usize,
    number_of_rva_and_sizes: u32,
    sections: Vec<Section>,
}

impl<'a> PortableExecutable<'a> {
    pub fn parse(image: &'a [u8]) -> Result<Self, PeDecodeError> {
        if image.len() < DOS_HEADER_SIZE {
            return Err(PeDecodeError::BadDosHeader);
        }
        if image
            .pread::<u16>(0)
            .map_err(|_| PeDecodeError::BadDosHeader)?
            != DOS_SIGNATURE
        {
            return Err(PeDecodeError::BadDosHeader);
        }

        let pe_offset = image
            .pread::<u32>(0x3c)
            .map_err(|_| PeDecodeError::BadDosHeader)? as usize;
        let coff_end = pe_offset
            .checked_add(COFF_HEADER_SIZE)
            .ok_or(PeDecodeError::OutOfBounds)?;
        if coff_end > image.len() {
            return Err(PeDecodeError::OutOfBounds);
        }
        if image
            .pread::<u32>(pe_offset)
            .map_err(|_| PeDecodeError::OutOfBounds)?
            != PE_SIGNATURE
        {
            return Err(PeDecodeError::BadPeSignature);
        }

        let number_of_sections = image
            .pread::<u16>(pe_offset + 6)
            .map_err(|_| PeDecodeError::OutOfBounds)? as usize;
        let optional_header_size = image
            .pread::<u16>(pe_offset + 20)
            .map_err(|_| PeDecodeError::OutOfBounds)? as usize;

        let optional_header_offset = coff_end;
        let optional_header_fixed_size = match image
            .pread::<u16>(optional_header_offset)
            .map_err(|_| PeDecodeError::OutOfBounds)?
        {
            OPTIONAL_HDR32_MAGIC => OPTIONAL_HDR32_FIXED_SIZE,
            OPTIONAL_HDR64_MAGIC => OPTIONAL_HDR64_FIXED_SIZE,
            magic => return Err(PeDecodeError::UnknownOptionalMagic(magic)),
        };

        let size_of_headers = image
            .pread::<u32>(optional_header_offset + SIZE_OF_HEADERS_OFFSET)
            .map_err(|_| PeDecodeError::OutOfBounds)? as usize;
        let number_of_rva_and_sizes = image
            .pread::<u32>(optional_header_offset + optional_header_fixed_size - 4)
            .map_err(|_| PeDecodeError::OutOfBounds)?;
        if size_of_headers > image.len() {
            return Err(PeDecodeError::OutOfBounds);
        }

        let section_table_offset = optional_header_offset
            .checked_add(optional_header_size)
            .ok_or(PeDecodeError::OutOfBounds)?;
        let mut sections = Vec::with_capacity(number_of_sections);
        for index in 0..number_of_sections {
            let section: Section = image
                .pread(section_table_offset + index * COFF_SECTION_SIZE)
                .map_err(|_| PeDecodeError::OutOfBounds)?;
            sections.push(section);
        }

        Ok(PortableExecutable {
            image,
            optional_header_offset,
            optional_header_fixed_size,
            size_of_headers,
            number_of_rva_and_sizes,
            sections,
        })
    }

    pub fn sections(&self) -> &[Section] {
        &self.sections
    }

    pub fn section_by_name(&self, name: &[u8; 8]) -> Option<&Section> {
        self.sections.iter().find(|s| &s.name == name)
    }

    /// Section contents as loaded, capped at the virtual size.
    pub fn section_body(&self, section: &Section) -> &'a [u8] {
        let start = section.pointer_to_raw_data as usize;
        let size = section.virtual_size.min(section.size_of_raw_data) as usize;
        self.image.get(start..start + size).unwrap_or(&[])
    }

    fn checksum_offset(&self) -> usize {
        self.optional_header_offset + CHECKSUM_FIELD_OFFSET
    }

    fn cert_directory_offset(&self) -> Option<usize> {
        if self.number_of_rva_and_sizes as usize > CERT_DIRECTORY_INDEX {
            Some(
                self.optional_header_offset
                    + self.optional_header_fixed_size
                    + CERT_DIRECTORY_INDEX * 8,
            )
        } else {
            None
        }
    }

    /// The Authenticode byte ranges of the image, in hash order.
    ///
    /// The 4-byte Checksum field and the 8-byte certificate directory
    /// entry are skipped; the attribute certificate table at the end of
    /// the image is excluded via its directory size.
    pub fn authenticode_regions(&self) -> Result<Vec<&'a [u8]>, PeDecodeError> {
        let checksum_offset = self.checksum_offset();
        if checksum_offset + 4 > self.size_of_headers {
            return Err(PeDecodeError::OutOfBounds);
        }

        let mut regions = Vec::with_capacity(self.sections.len() + 4);
        regions.push(&self.image[..checksum_offset]);
        match self.cert_directory_offset() {
            Some(cert_offset) => {
                if cert_offset + 8 > self.size_of_headers {
                    return Err(PeDecodeError::OutOfBounds);
                }
                regions.push(&self.image[checksum_offset + 4..cert_offset]);
                regions.push(&self.image[cert_offset + 8..self.size_of_headers]);
            }
            None => {
                regions.push(&self.image[checksum_offset + 4..self.size_of_headers]);
            }
        }

        let mut raw_sections: Vec<&Section> = self
            .sections
            .iter()
            .filter(|s| s.size_of_raw_data > 0)
            .collect();
        raw_sections.sort_by_key(|s| s.pointer_to_raw_data);

        let mut sum_of_bytes_hashed = self.size_of_headers;
        for section in raw_sections {
            let start = section.pointer_to_raw_data as usize;
            let end = start
                .checked_add(section.size_of_raw_data as usize)
                .ok_or(PeDecodeError::OutOfBounds)?;
            let raw_body = self.image.get(start..end).ok_or(PeDecodeError::OutOfBounds)?;
            regions.push(raw_body);
            sum_of_bytes_hashed += raw_body.len();
        }

        let cert_size = match self.cert_directory_offset() {
            Some(cert_offset) => self
                .image
                .pread::<u32>(cert_offset + 4)
                .map_err(|_| PeDecodeError::OutOfBounds)? as usize,
            None => 0,
        };
        let image_size = self.image.len();
        if image_size < sum_of_bytes_hashed + cert_size {
            return Err(PeDecodeError::TruncatedImage {
                image_size,
                expected: sum_of_bytes_hashed + cert_size,
            });
        }
        if image_size > sum_of_bytes_hashed + cert_size {
            regions.push(&self.image[sum_of_bytes_hashed..image_size - cert_size]);
        }

        Ok(regions)
    }

    /// SHA-384 over the Authenticode byte ranges.
    pub fn authenticode_digest(&self) -> Result<[u8; SHA384_DIGEST_SIZE], PeDecodeError> {
        let mut hasher = Sha384::new();
        for region in self.authenticode_regions()? {
            hasher.update(region);
        }
        Ok(hasher.finalize().into())
    }
}
