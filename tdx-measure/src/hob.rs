// Copyright (c) 2025 Intel Corporation
//
// SPDX-License-Identifier: BSD-2-Clause-Patent

//! TD Hand-Off Block reproduction.
//!
//! QEMU hands the firmware a HOB list describing the guest memory map:
//! one resource descriptor per physical range, with the ranges backing the
//! HOB itself and the temporary memory already accepted and everything
//! else left unaccepted. The firmware measures that list (up to, but not
//! including, the end-of-list HOB) into RTMR0.

use core::fmt;
use core::mem::size_of;
use zerocopy::AsBytes;

use crate::metadata::{SectionType, TdxMetadataSection};

pub const HOB_TYPE_HANDOFF: u16 = 0x0001;
pub const HOB_TYPE_RESOURCE_DESCRIPTOR: u16 = 0x0003;
pub const HOB_TYPE_END_OF_HOB_LIST: u16 = 0xffff;

pub const HOB_HANDOFF_TABLE_VERSION: u32 = 0x0009;
pub const BOOT_WITH_FULL_CONFIGURATION: u32 = 0;

/// Resource types defined in [UEFI-PI Spec], section 5.5.
pub const RESOURCE_SYSTEM_MEMORY: u32 = 0x0000_0000;
pub const RESOURCE_MEMORY_UNACCEPTED: u32 = 0x0000_0007;

pub const RESOURCE_ATTRIBUTE_PRESENT: u32 = 0x0000_0001;
pub const RESOURCE_ATTRIBUTE_INITIALIZED: u32 = 0x0000_0002;
pub const RESOURCE_ATTRIBUTE_TESTED: u32 = 0x0000_0004;

/// HOB Generic Header, defined in [UEFI-PI Spec], section 5.2.
#[repr(C)]
#[derive(AsBytes, Clone, Copy, Debug)]
pub struct Header {
    pub r#type: u16,
    pub length: u16,
    pub reserved: u32,
}

/// HOB Hand Off Information Table, defined in [UEFI-PI Spec], section 5.3.
///
/// Must be the first entry of the list. QEMU leaves the memory layout
/// fields zero and only fills the end-of-list pointer.
#[repr(C)]
#[derive(AsBytes, Clone, Copy, Debug)]
pub struct HandoffInfoTable {
    pub header: Header,
    pub version: u32,
    pub boot_mode: u32,
    pub efi_memory_top: u64,
    pub efi_memory_bottom: u64,
    pub efi_free_memory_top: u64,
    pub efi_free_memory_bottom: u64,
    pub efi_end_of_hob_list: u64,
}

/// Resource Descriptor HOB, defined in [UEFI-PI Spec], section 5.5.
#[repr(C)]
#[derive(AsBytes, Clone, Copy, Debug)]
pub struct ResourceDescription {
    pub header: Header,
    pub owner: [u8; 16],
    pub resource_type: u32,
    pub resource_attribute: u32,
    pub physical_start: u64,
    pub resource_length: u64,
}

#[derive(Debug, PartialEq, Eq)]
pub enum HobError {
    /// The metadata table carries no TD_HOB section.
    MissingTdHob,
    /// The memory map does not fit the TD_HOB region.
    OutOfResource,
}

impl fmt::Display for HobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingTdHob => write!(f, "firmware metadata has no TD_HOB section"),
            Self::OutOfResource => write!(f, "TD_HOB region too small for the memory map"),
        }
    }
}

impl std::error::Error for HobError {}

struct TdHobBuilder {
    buffer: Vec<u8>,
    end: usize,
}

impl TdHobBuilder {
    fn new(size: usize) -> Result<Self, HobError> {
        if size < size_of::<HandoffInfoTable>() {
            return Err(HobError::OutOfResource);
        }
        Ok(TdHobBuilder {
            buffer: vec![0u8; size],
            // Leave a margin to hold the handoff info table.
            end: size_of::<HandoffInfoTable>(),
        })
    }

    fn append(&mut self, data: &[u8]) -> Result<(), HobError> {
        if self.end + data.len() > self.buffer.len() {
            return Err(HobError::OutOfResource);
        }
        self.buffer[self.end..self.end + data.len()].copy_from_slice(data);
        self.end += data.len();
        Ok(())
    }

    fn add_memory_resource(
        &mut self,
        start: u64,
        length: u64,
        resource_type: u32,
    ) -> Result<(), HobError> {
        let hob = ResourceDescription {
            header: Header {
                r#type: HOB_TYPE_RESOURCE_DESCRIPTOR,
                length: size_of::<ResourceDescription>() as u16,
                reserved: 0,
            },
            owner: [0u8; 16],
            resource_type,
            resource_attribute: RESOURCE_ATTRIBUTE_PRESENT
                | RESOURCE_ATTRIBUTE_INITIALIZED
                | RESOURCE_ATTRIBUTE_TESTED,
            physical_start: start,
            resource_length: length,
        };
        self.append(hob.as_bytes())
    }

    /// Append the END HOB, fill in the handoff table, and return the
    /// measured prefix (everything before the END HOB).
    fn finish(mut self, mem_base: u64) -> Result<Vec<u8>, HobError> {
        let measured_end = self.end;

        let end_hob = Header {
            r#type: HOB_TYPE_END_OF_HOB_LIST,
            length: size_of::<Header>() as u16,
            reserved: 0,
        };
        self.append(end_hob.as_bytes())?;

        let handoff_info_table = HandoffInfoTable {
            header: Header {
                r#type: HOB_TYPE_HANDOFF,
                length: size_of::<HandoffInfoTable>() as u16,
                reserved: 0,
            },
            version: HOB_HANDOFF_TABLE_VERSION,
            boot_mode: BOOT_WITH_FULL_CONFIGURATION,
            efi_memory_top: 0,
            efi_memory_bottom: 0,
            efi_free_memory_top: 0,
            efi_free_memory_bottom: 0,
            efi_end_of_hob_list: mem_base + self.end as u64,
        };
        self.buffer[..size_of::<HandoffInfoTable>()]
            .copy_from_slice(handoff_info_table.as_bytes());

        self.buffer.truncate(measured_end);
        Ok(self.buffer)
    }
}

/// Build the measured TD_HOB prefix for a guest with `memory_size` bytes of
/// RAM and the given metadata sections.
pub fn build_td_hob(
    sections: &[TdxMetadataSection],
    memory_size: u64,
) -> Result<Vec<u8>, HobError> {
    let td_hob = sections
        .iter()
        .find(|s| s.section_type == SectionType::TdHob)
        .ok_or(HobError::MissingTdHob)?;

    // The TD_HOB and TempMem regions are accepted by the VMM before launch;
    // the rest of RAM stays unaccepted.
    let mut accepted: Vec<&TdxMetadataSection> = sections
        .iter()
        .filter(|s| matches!(s.section_type, SectionType::TdHob | SectionType::TempMem))
        .collect();
    accepted.sort_by_key(|s| s.mem_base);

    let mut builder = TdHobBuilder::new(td_hob.mem_size as usize)?;
    let mut cursor = 0u64;
    for section in &accepted {
        if section.mem_base > cursor {
            builder.add_memory_resource(
                cursor,
                section.mem_base - cursor,
                RESOURCE_MEMORY_UNACCEPTED,
            )?;
        }
        builder.add_memory_resource(section.mem_base, section.mem_size, RESOURCE_SYSTEM_MEMORY)?;
        cursor = section.mem_base + section.mem_size;
    }
    if cursor < memory_size {
        builder.add_memory_resource(cursor, memory_size - cursor, RESOURCE_MEMORY_UNACCEPTED)?;
    }

    builder.finish(td_hob.mem_base)
}
