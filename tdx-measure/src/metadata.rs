// Copyright (c) 2025 Intel Corporation
//
// SPDX-License-Identifier: BSD-2-Clause-Patent

//! TDVF metadata decoder.
//!
//! A TDX-capable firmware image carries a metadata table describing how its
//! regions are placed into guest memory and which of them are folded into
//! the build-time measurement. The table is located through the GUID table
//! that OVMF appends just below the reset vector at the end of the image.

use core::fmt;
use scroll::Pread;

use crate::guid::Guid;

/// 'TDVF' signature of the metadata descriptor.
pub const TDX_METADATA_SIGNATURE: u32 = 0x4656_4454;
pub const TDX_METADATA_VERSION: u32 = 1;

/// Attribute flag: fold the section contents into MRTD with TDH.MR.EXTEND.
pub const TDX_METADATA_ATTRIBUTES_EXTENDMR: u32 = 0x0000_0001;

/// Footer entry of the OVMF GUID table, 0x30 bytes from the end of the image.
pub const OVMF_TABLE_FOOTER_GUID: Guid = Guid::from_fields(
    0x96b5_82de,
    0x1fb2,
    0x45f7,
    [0xba, 0xea, 0xa3, 0x66, 0xc5, 0x5a, 0x08, 0x2d],
);

/// GUID-table entry whose content is the offset-from-EOF of the metadata table.
pub const OVMF_TABLE_TDX_METADATA_GUID: Guid = Guid::from_fields(
    0xe47a_6535,
    0x984a,
    0x4798,
    [0x86, 0x5e, 0x46, 0x85, 0xa7, 0xbf, 0x8e, 0xc2],
);

/// GUID heading the metadata table itself.
pub const TDX_METADATA_GUID: Guid = Guid::from_fields(
    0xe9ea_f9f3,
    0x168e,
    0x44d5,
    [0xa8, 0xeb, 0x7f, 0x4d, 0x87, 0x38, 0xf6, 0xae],
);

// The GUID table footer sits right below the 32-byte reset vector tail, so
// its GUID starts 0x30 bytes from EOF with the table length just before it.
const FOOTER_GUID_EOF_OFFSET: usize = 0x30;
// Each GUID table entry ends with a 2-byte length and a 16-byte GUID.
const GUID_ENTRY_TRAILER_SIZE: usize = 18;

#[derive(Debug, PartialEq, Eq)]
pub enum FirmwareDecodeError {
    /// The image is too short for the structure being decoded.
    TruncatedImage,
    /// The GUID table footer does not carry the expected GUID.
    BadFooterGuid,
    /// No GUID table entry points at the metadata table.
    MissingMetadataOffset,
    /// The metadata table is not headed by the TDX metadata GUID.
    BadMetadataGuid,
    /// The metadata descriptor signature is not 'TDVF'.
    BadSignature(u32),
    /// The metadata descriptor version is not supported.
    UnsupportedVersion(u32),
    /// A section record carries an out-of-range type index.
    UnknownSectionType(u32),
}

impl fmt::Display for FirmwareDecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TruncatedImage => write!(f, "firmware image is truncated"),
            Self::BadFooterGuid => write!(f, "GUID table footer not found"),
            Self::MissingMetadataOffset => {
                write!(f, "GUID table has no TDX metadata offset entry")
            }
            Self::BadMetadataGuid => write!(f, "TDX metadata GUID mismatch"),
            Self::BadSignature(sig) => {
                write!(f, "bad metadata signature {:#010x}, expected 'TDVF'", sig)
            }
            Self::UnsupportedVersion(version) => {
                write!(f, "unsupported metadata version {}", version)
            }
            Self::UnknownSectionType(index) => {
                write!(f, "unknown metadata section type {}", index)
            }
        }
    }
}

impl std::error::Error for FirmwareDecodeError {}

/// Section type of a TDVF_SECTION record.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SectionType {
    Bfv = 0,
    Cfv = 1,
    TdHob = 2,
    TempMem = 3,
    PermMem = 4,
    Payload = 5,
    PayloadParam = 6,
    TdInfo = 7,
    TdParams = 8,
}

impl SectionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bfv => "BFV",
            Self::Cfv => "CFV",
            Self::TdHob => "TD_HOB",
            Self::TempMem => "TempMem",
            Self::PermMem => "PermMem",
            Self::Payload => "Payload",
            Self::PayloadParam => "PayloadParam",
            Self::TdInfo => "TD_INFO",
            Self::TdParams => "TD_PARAMS",
        }
    }
}

impl TryFrom<u32> for SectionType {
    type Error = FirmwareDecodeError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Bfv),
            1 => Ok(Self::Cfv),
            2 => Ok(Self::TdHob),
            3 => Ok(Self::TempMem),
            4 => Ok(Self::PermMem),
            5 => Ok(Self::Payload),
            6 => Ok(Self::PayloadParam),
            7 => Ok(Self::TdInfo),
            8 => Ok(Self::TdParams),
            other => Err(FirmwareDecodeError::UnknownSectionType(other)),
        }
    }
}

/// Metadata descriptor following the metadata GUID.
///
/// Signature            0  CHAR8[4]  'TDVF'
/// Length               4  UINT32    size of the structure
/// Version              8  UINT32    must be 1
/// NumberOfSectionEntry 12 UINT32    number of section entries
#[repr(C)]
#[derive(Debug, Pread)]
pub struct TdxMetadataDescriptor {
    pub signature: u32,
    pub length: u32,
    pub version: u32,
    pub number_of_section_entry: u32,
}

// On-disk TDVF_SECTION record, 32 bytes.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pread)]
struct RawSection {
    data_offset: u32,
    raw_data_size: u32,
    memory_address: u64,
    memory_data_size: u64,
    r#type: u32,
    attributes: u32,
}

const RAW_SECTION_SIZE: usize = 32;
const DESCRIPTOR_SIZE: usize = 16;

/// One region of the firmware image and its placement in guest memory.
#[derive(Clone, Debug)]
pub struct TdxMetadataSection {
    /// Byte offset of the raw section data in the image.
    pub raw_offset: u32,
    /// Size of the raw section data in the image.
    pub raw_size: u32,
    /// Guest-physical base address the section is loaded at.
    pub mem_base: u64,
    /// Size of the loaded section, a multiple of 4 KiB.
    pub mem_size: u64,
    pub section_type: SectionType,
    /// Fold the section contents into MRTD with TDH.MR.EXTEND.
    pub extend_mr: bool,
}

/// A parsed firmware image: the raw bytes plus the decoded metadata
/// sections, immutable after parse.
#[derive(Clone, Debug)]
pub struct TdFirmware {
    bytes: Vec<u8>,
    sections: Vec<TdxMetadataSection>,
}

impl TdFirmware {
    pub fn parse(bytes: Vec<u8>) -> Result<Self, FirmwareDecodeError> {
        let metadata_offset = locate_metadata(&bytes)?;
        let sections = parse_sections(&bytes, metadata_offset)?;

        for section in &sections {
            log::debug!(
                "metadata section {}: raw {:#x}+{:#x}, mem {:#x}+{:#x}, extend_mr {}",
                section.section_type.as_str(),
                section.raw_offset,
                section.raw_size,
                section.mem_base,
                section.mem_size,
                section.extend_mr,
            );
        }

        Ok(TdFirmware { bytes, sections })
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn sections(&self) -> &[TdxMetadataSection] {
        &self.sections
    }

    /// Raw image bytes backing a section.
    pub fn section_data(&self, section: &TdxMetadataSection) -> &[u8] {
        let start = section.raw_offset as usize;
        let end = start + section.raw_size as usize;
        &self.bytes[start..end]
    }
}

/// Decode the TDX metadata table of a firmware image.
pub fn parse_firmware(bytes: Vec<u8>) -> Result<TdFirmware, FirmwareDecodeError> {
    TdFirmware::parse(bytes)
}

fn read_guid(image: &[u8], offset: usize) -> Result<Guid, FirmwareDecodeError> {
    let bytes: &[u8; 16] = image
        .get(offset..offset + 16)
        .and_then(|s| s.try_into().ok())
        .ok_or(FirmwareDecodeError::TruncatedImage)?;
    Ok(Guid::from_bytes(bytes))
}

/// Walk the OVMF GUID table backward and return the absolute offset of the
/// metadata table (its heading GUID).
fn locate_metadata(image: &[u8]) -> Result<usize, FirmwareDecodeError> {
    let len = image.len();
    if len < FOOTER_GUID_EOF_OFFSET + 2 {
        return Err(FirmwareDecodeError::TruncatedImage);
    }

    let footer_guid_offset = len - FOOTER_GUID_EOF_OFFSET;
    if read_guid(image, footer_guid_offset)? != OVMF_TABLE_FOOTER_GUID {
        return Err(FirmwareDecodeError::BadFooterGuid);
    }

    let table_len = image
        .pread::<u16>(footer_guid_offset - 2)
        .map_err(|_| FirmwareDecodeError::TruncatedImage)? as usize;
    // The footer's length covers the whole table including itself.
    let entries_len = table_len
        .checked_sub(GUID_ENTRY_TRAILER_SIZE)
        .ok_or(FirmwareDecodeError::MissingMetadataOffset)?;

    // `cursor` sits just past the entry currently being inspected; each
    // entry ends with its length field followed by its GUID.
    let mut cursor = footer_guid_offset - 2;
    let mut consumed = 0;
    while consumed < entries_len {
        let guid_offset = cursor
            .checked_sub(16)
            .ok_or(FirmwareDecodeError::TruncatedImage)?;
        let entry_guid = read_guid(image, guid_offset)?;
        let entry_len_offset = guid_offset
            .checked_sub(2)
            .ok_or(FirmwareDecodeError::TruncatedImage)?;
        let entry_len = image
            .pread::<u16>(entry_len_offset)
            .map_err(|_| FirmwareDecodeError::TruncatedImage)? as usize;

        if entry_guid == OVMF_TABLE_TDX_METADATA_GUID {
            let tail_offset = image
                .pread::<u32>(
                    entry_len_offset
                        .checked_sub(4)
                        .ok_or(FirmwareDecodeError::TruncatedImage)?,
                )
                .map_err(|_| FirmwareDecodeError::TruncatedImage)?
                as usize;
            // The stored value is an offset from EOF; step back over the
            // heading GUID to land on the table start.
            return len
                .checked_sub(tail_offset + 16)
                .ok_or(FirmwareDecodeError::TruncatedImage);
        }

        if entry_len < GUID_ENTRY_TRAILER_SIZE {
            return Err(FirmwareDecodeError::MissingMetadataOffset);
        }
        cursor = cursor
            .checked_sub(entry_len)
            .ok_or(FirmwareDecodeError::TruncatedImage)?;
        consumed += entry_len;
    }

    Err(FirmwareDecodeError::MissingMetadataOffset)
}

fn parse_sections(
    image: &[u8],
    metadata_offset: usize,
) -> Result<Vec<TdxMetadataSection>, FirmwareDecodeError> {
    if read_guid(image, metadata_offset)? != TDX_METADATA_GUID {
        return Err(FirmwareDecodeError::BadMetadataGuid);
    }

    let descriptor_offset = metadata_offset + 16;
    let descriptor: TdxMetadataDescriptor = image
        .pread(descriptor_offset)
        .map_err(|_| FirmwareDecodeError::TruncatedImage)?;
    if descriptor.signature != TDX_METADATA_SIGNATURE {
        return Err(FirmwareDecodeError::BadSignature(descriptor.signature));
    }
    if descriptor.version != TDX_METADATA_VERSION {
        return Err(FirmwareDecodeError::UnsupportedVersion(descriptor.version));
    }

    let mut sections = Vec::new();
    let mut offset = descriptor_offset + DESCRIPTOR_SIZE;
    for _ in 0..descriptor.number_of_section_entry {
        let raw: RawSection = image
            .pread(offset)
            .map_err(|_| FirmwareDecodeError::TruncatedImage)?;
        offset += RAW_SECTION_SIZE;

        let section_type = SectionType::try_from(raw.r#type)?;
        let raw_end = raw.data_offset as u64 + raw.raw_data_size as u64;
        if raw_end > image.len() as u64 {
            return Err(FirmwareDecodeError::TruncatedImage);
        }
        // MR.EXTEND reads every measured page back from the raw image.
        if raw.attributes & TDX_METADATA_ATTRIBUTES_EXTENDMR != 0
            && (raw.raw_data_size as u64) < raw.memory_data_size
        {
            return Err(FirmwareDecodeError::TruncatedImage);
        }

        sections.push(TdxMetadataSection {
            raw_offset: raw.data_offset,
            raw_size: raw.raw_data_size,
            mem_base: raw.memory_address,
            mem_size: raw.memory_data_size,
            section_type,
            extend_mr: raw.attributes & TDX_METADATA_ATTRIBUTES_EXTENDMR != 0,
        });
    }

    Ok(sections)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) struct FirmwareImageBuilder {
        pub image_size: usize,
        pub metadata_offset: usize,
        pub sections: Vec<(u32, u32, u64, u64, u32, u32)>,
        pub signature: u32,
        pub version: u32,
        pub metadata_guid: Guid,
        pub footer_guid: Guid,
    }

    impl FirmwareImageBuilder {
        pub fn new() -> Self {
            FirmwareImageBuilder {
                image_size: 0x8000,
                metadata_offset: 0x1000,
                sections: Vec::new(),
                signature: TDX_METADATA_SIGNATURE,
                version: TDX_METADATA_VERSION,
                metadata_guid: TDX_METADATA_GUID,
                footer_guid: OVMF_TABLE_FOOTER_GUID,
            }
        }

        pub fn section(
            mut self,
            raw_offset: u32,
            raw_size: u32,
            mem_base: u64,
            mem_size: u64,
            r#type: u32,
            attributes: u32,
        ) -> Self {
            self.sections
                .push((raw_offset, raw_size, mem_base, mem_size, r#type, attributes));
            self
        }

        pub fn build(self) -> Vec<u8> {
            let mut image = vec![0u8; self.image_size];
            let len = image.len();

            // Metadata table: GUID, descriptor, section records.
            let mut at = self.metadata_offset;
            image[at..at + 16].copy_from_slice(&self.metadata_guid.to_bytes());
            at += 16;
            image[at..at + 4].copy_from_slice(&self.signature.to_le_bytes());
            let table_len = (DESCRIPTOR_SIZE + self.sections.len() * RAW_SECTION_SIZE) as u32;
            image[at + 4..at + 8].copy_from_slice(&table_len.to_le_bytes());
            image[at + 8..at + 12].copy_from_slice(&self.version.to_le_bytes());
            image[at + 12..at + 16]
                .copy_from_slice(&(self.sections.len() as u32).to_le_bytes());
            at += 16;
            for (raw_offset, raw_size, mem_base, mem_size, r#type, attributes) in &self.sections {
                image[at..at + 4].copy_from_slice(&raw_offset.to_le_bytes());
                image[at + 4..at + 8].copy_from_slice(&raw_size.to_le_bytes());
                image[at + 8..at + 16].copy_from_slice(&mem_base.to_le_bytes());
                image[at + 16..at + 24].copy_from_slice(&mem_size.to_le_bytes());
                image[at + 24..at + 28].copy_from_slice(&r#type.to_le_bytes());
                image[at + 28..at + 32].copy_from_slice(&attributes.to_le_bytes());
                at += 32;
            }

            // GUID table, built upward from the footer: one entry holding
            // the offset-from-EOF of the metadata table, then the footer.
            let footer_guid_offset = len - FOOTER_GUID_EOF_OFFSET;
            image[footer_guid_offset..footer_guid_offset + 16]
                .copy_from_slice(&self.footer_guid.to_bytes());
            let entry_len = 4 + GUID_ENTRY_TRAILER_SIZE;
            let table_len = (entry_len + GUID_ENTRY_TRAILER_SIZE) as u16;
            image[footer_guid_offset - 2..footer_guid_offset]
                .copy_from_slice(&table_len.to_le_bytes());

            let entry_guid_offset = footer_guid_offset - 2 - 16;
            image[entry_guid_offset..entry_guid_offset + 16]
                .copy_from_slice(&OVMF_TABLE_TDX_METADATA_GUID.to_bytes());
            image[entry_guid_offset - 2..entry_guid_offset]
                .copy_from_slice(&(entry_len as u16).to_le_bytes());
            let tail_offset = (len - self.metadata_offset - 16) as u32;
            image[entry_guid_offset - 6..entry_guid_offset - 2]
                .copy_from_slice(&tail_offset.to_le_bytes());

            image
        }
    }

    #[test]
    fn test_parse_firmware() {
        let image = FirmwareImageBuilder::new()
            .section(0x0, 0x2000, 0xff000000, 0x2000, 0, TDX_METADATA_ATTRIBUTES_EXTENDMR)
            .section(0x2000, 0x1000, 0xff800000, 0x1000, 1, 0)
            .section(0, 0, 0x800000, 0x2000, 2, 0)
            .build();

        let firmware = parse_firmware(image).unwrap();
        assert_eq!(firmware.sections().len(), 3);

        let bfv = &firmware.sections()[0];
        assert_eq!(bfv.section_type, SectionType::Bfv);
        assert!(bfv.extend_mr);
        assert_eq!(bfv.mem_base, 0xff000000);

        let cfv = &firmware.sections()[1];
        assert_eq!(cfv.section_type, SectionType::Cfv);
        assert!(!cfv.extend_mr);
        assert_eq!(firmware.section_data(cfv).len(), 0x1000);

        assert_eq!(firmware.sections()[2].section_type, SectionType::TdHob);
    }

    #[test]
    fn test_parse_firmware_metadata_entry_first_in_table() {
        // The metadata entry is the only (and thus first) non-footer entry;
        // the 16-byte step back from the stored offset must still land on
        // the metadata GUID.
        let image = FirmwareImageBuilder::new()
            .section(0, 0, 0x800000, 0x1000, 2, 0)
            .build();
        assert!(parse_firmware(image).is_ok());
    }

    #[test]
    fn test_parse_firmware_bad_footer() {
        let mut builder = FirmwareImageBuilder::new().section(0, 0, 0x800000, 0x1000, 2, 0);
        builder.footer_guid = TDX_METADATA_GUID;
        assert_eq!(
            parse_firmware(builder.build()).unwrap_err(),
            FirmwareDecodeError::BadFooterGuid
        );
    }

    #[test]
    fn test_parse_firmware_bad_metadata_guid() {
        let mut builder = FirmwareImageBuilder::new().section(0, 0, 0x800000, 0x1000, 2, 0);
        builder.metadata_guid = OVMF_TABLE_FOOTER_GUID;
        assert_eq!(
            parse_firmware(builder.build()).unwrap_err(),
            FirmwareDecodeError::BadMetadataGuid
        );
    }

    #[test]
    fn test_parse_firmware_bad_signature() {
        let mut builder = FirmwareImageBuilder::new().section(0, 0, 0x800000, 0x1000, 2, 0);
        builder.signature = 0x4656_4455;
        assert!(matches!(
            parse_firmware(builder.build()).unwrap_err(),
            FirmwareDecodeError::BadSignature(_)
        ));
    }

    #[test]
    fn test_parse_firmware_bad_version() {
        let mut builder = FirmwareImageBuilder::new().section(0, 0, 0x800000, 0x1000, 2, 0);
        builder.version = 2;
        assert_eq!(
            parse_firmware(builder.build()).unwrap_err(),
            FirmwareDecodeError::UnsupportedVersion(2)
        );
    }

    #[test]
    fn test_parse_firmware_bad_section_type() {
        let image = FirmwareImageBuilder::new()
            .section(0, 0, 0x800000, 0x1000, 9, 0)
            .build();
        assert_eq!(
            parse_firmware(image).unwrap_err(),
            FirmwareDecodeError::UnknownSectionType(9)
        );
    }

    #[test]
    fn test_parse_firmware_short_image() {
        assert_eq!(
            parse_firmware(vec![0u8; 0x20]).unwrap_err(),
            FirmwareDecodeError::TruncatedImage
        );
    }
}
