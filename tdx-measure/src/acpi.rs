// Copyright (c) 2025 Intel Corporation
//
// SPDX-License-Identifier: BSD-2-Clause-Patent

//! ACPI blob parsing and QEMU fw_cfg file reproduction.
//!
//! QEMU ships the guest its ACPI tables as one concatenated blob
//! (`etc/acpi/tables`) together with a command stream (`etc/table-loader`)
//! telling the firmware how to allocate, patch and checksum them, and a
//! seed RSDP (`etc/acpi/rsdp`). All three files are measured into RTMR0,
//! so their exact byte layout is reproduced here.

use core::mem::size_of;
use zerocopy::AsBytes;

/// fw_cfg file names measured by the firmware.
pub const TABLE_LOADER_FILE: &str = "etc/table-loader";
pub const ACPI_RSDP_FILE: &str = "etc/acpi/rsdp";
pub const ACPI_TABLES_FILE: &str = "etc/acpi/tables";

pub const LOADER_COMMAND_ALLOCATE: u32 = 1;
pub const LOADER_COMMAND_ADD_POINTER: u32 = 2;
pub const LOADER_COMMAND_ADD_CHECKSUM: u32 = 3;

pub const LOADER_ALLOC_ZONE_HIGH: u8 = 1;
pub const LOADER_ALLOC_ZONE_FSEG: u8 = 2;

const LOADER_FILE_NAME_SIZE: usize = 56;
const LOADER_COMMAND_SIZE: usize = 128;
/// The loader file is padded to a fixed fw_cfg item size.
const TABLE_LOADER_IMAGE_SIZE: usize = 4096;

const ACPI_TABLE_HEADER_SIZE: usize = 8;
const ACPI_CHECKSUM_OFFSET: usize = 9;

// FADT pointer slots patched by the loader: FIRMWARE_CTRL, DSDT, X_DSDT.
const FADT_FIRMWARE_CTRL_OFFSET: u32 = 36;
const FADT_DSDT_OFFSET: u32 = 40;
const FADT_X_DSDT_OFFSET: u32 = 140;

/// One table discovered in the ACPI blob.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AcpiTable {
    pub signature: [u8; 4],
    /// Absolute byte offset of the table within the blob.
    pub offset: usize,
    pub length: u32,
}

/// Walk the blob from offset 0, collecting `{signature, length}` headers.
/// A run of four NUL bytes at a table start terminates the blob.
pub fn parse_tables(blob: &[u8]) -> Vec<AcpiTable> {
    let mut tables = Vec::new();
    let mut offset = 0usize;

    while offset + ACPI_TABLE_HEADER_SIZE <= blob.len() {
        let signature: [u8; 4] = blob[offset..offset + 4].try_into().unwrap();
        if signature == [0u8; 4] {
            break;
        }
        let length = u32::from_le_bytes(blob[offset + 4..offset + 8].try_into().unwrap());
        tables.push(AcpiTable {
            signature,
            offset,
            length,
        });
        if length == 0 {
            break;
        }
        offset += length as usize;
    }

    log::debug!("discovered {} ACPI tables", tables.len());
    tables
}

/// Seed RSDP handed to the firmware via fw_cfg. QEMU fills only the legacy
/// revision-0 fields; the RSDT address slot initially holds the table's
/// offset within `etc/acpi/tables`.
#[repr(C)]
#[derive(AsBytes, Clone, Copy, Debug)]
pub struct Rsdp {
    pub signature: [u8; 8],
    pub checksum: u8,
    pub oem_id: [u8; 6],
    pub revision: u8,
    pub rsdt_addr: u32,
}

pub fn build_rsdp(tables: &[AcpiTable]) -> Rsdp {
    let rsdt_addr = tables
        .iter()
        .find(|t| &t.signature == b"RSDT")
        .map(|t| t.offset as u32)
        .unwrap_or(0);

    Rsdp {
        signature: *b"RSD PTR ",
        checksum: 0,
        oem_id: *b"BOCHS ",
        revision: 0,
        rsdt_addr,
    }
}

#[repr(C)]
#[derive(AsBytes)]
struct AllocateCommand {
    command: u32,
    file: [u8; LOADER_FILE_NAME_SIZE],
    align: u32,
    zone: u8,
    padding: [u8; 63],
}

#[repr(C)]
#[derive(AsBytes)]
struct AddPointerCommand {
    command: u32,
    dest_file: [u8; LOADER_FILE_NAME_SIZE],
    src_file: [u8; LOADER_FILE_NAME_SIZE],
    offset: u32,
    size: u8,
    padding: [u8; 7],
}

#[repr(C)]
#[derive(AsBytes)]
struct AddChecksumCommand {
    command: u32,
    file: [u8; LOADER_FILE_NAME_SIZE],
    result_offset: u32,
    start: u32,
    length: u32,
    padding: [u8; 56],
}

fn loader_file_name(name: &str) -> [u8; LOADER_FILE_NAME_SIZE] {
    let mut file = [0u8; LOADER_FILE_NAME_SIZE];
    file[..name.len()].copy_from_slice(name.as_bytes());
    file
}

fn allocate(name: &str, align: u32, zone: u8) -> AllocateCommand {
    AllocateCommand {
        command: LOADER_COMMAND_ALLOCATE,
        file: loader_file_name(name),
        align,
        zone,
        padding: [0u8; 63],
    }
}

fn add_pointer(dest: &str, src: &str, offset: u32, size: u8) -> AddPointerCommand {
    AddPointerCommand {
        command: LOADER_COMMAND_ADD_POINTER,
        dest_file: loader_file_name(dest),
        src_file: loader_file_name(src),
        offset,
        size,
        padding: [0u8; 7],
    }
}

fn add_checksum(name: &str, result_offset: u32, start: u32, length: u32) -> AddChecksumCommand {
    AddChecksumCommand {
        command: LOADER_COMMAND_ADD_CHECKSUM,
        file: loader_file_name(name),
        result_offset,
        start,
        length,
        padding: [0u8; 56],
    }
}

/// Build the `etc/table-loader` command stream for the discovered tables,
/// zero-padded to the fixed file size.
pub fn build_table_loader(tables: &[AcpiTable]) -> Vec<u8> {
    let mut image = Vec::with_capacity(TABLE_LOADER_IMAGE_SIZE);

    image.extend_from_slice(allocate(ACPI_RSDP_FILE, 16, LOADER_ALLOC_ZONE_FSEG).as_bytes());
    image.extend_from_slice(allocate(ACPI_TABLES_FILE, 64, LOADER_ALLOC_ZONE_HIGH).as_bytes());

    for table in tables {
        let offset = table.offset as u32;
        match &table.signature {
            b"FACP" => {
                for (slot, size) in [
                    (FADT_FIRMWARE_CTRL_OFFSET, 4u8),
                    (FADT_DSDT_OFFSET, 4),
                    (FADT_X_DSDT_OFFSET, 8),
                ] {
                    image.extend_from_slice(
                        add_pointer(ACPI_TABLES_FILE, ACPI_TABLES_FILE, offset + slot, size)
                            .as_bytes(),
                    );
                }
            }
            b"RSDT" => {
                // Pointer slots of the four table entries after the header.
                for slot in [36u32, 40, 44, 48] {
                    image.extend_from_slice(
                        add_pointer(ACPI_TABLES_FILE, ACPI_TABLES_FILE, offset + slot, 4)
                            .as_bytes(),
                    );
                }
            }
            _ => {}
        }
        if &table.signature != b"FACS" {
            image.extend_from_slice(
                add_checksum(
                    ACPI_TABLES_FILE,
                    offset + ACPI_CHECKSUM_OFFSET as u32,
                    offset,
                    table.length,
                )
                .as_bytes(),
            );
        }
    }

    image.extend_from_slice(add_pointer(ACPI_RSDP_FILE, ACPI_TABLES_FILE, 16, 4).as_bytes());
    image.extend_from_slice(
        add_checksum(ACPI_RSDP_FILE, 8, 0, size_of::<Rsdp>() as u32).as_bytes(),
    );

    image.resize(TABLE_LOADER_IMAGE_SIZE, 0);
    image
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(signature: &[u8; 4], length: u32) -> Vec<u8> {
        let mut bytes = vec![0u8; length as usize];
        bytes[..4].copy_from_slice(signature);
        bytes[4..8].copy_from_slice(&length.to_le_bytes());
        bytes
    }

    fn blob(tables: &[(&[u8; 4], u32)]) -> Vec<u8> {
        let mut out = Vec::new();
        for (signature, length) in tables {
            out.extend_from_slice(&table(signature, *length));
        }
        out
    }

    #[test]
    fn test_command_sizes() {
        assert_eq!(size_of::<AllocateCommand>(), LOADER_COMMAND_SIZE);
        assert_eq!(size_of::<AddPointerCommand>(), LOADER_COMMAND_SIZE);
        assert_eq!(size_of::<AddChecksumCommand>(), LOADER_COMMAND_SIZE);
        assert_eq!(size_of::<Rsdp>(), 20);
    }

    #[test]
    fn test_parse_tables() {
        let blob = blob(&[(b"RSDT", 40), (b"FACP", 276), (b"APIC", 120)]);
        let tables = parse_tables(&blob);
        assert_eq!(
            tables,
            [
                AcpiTable {
                    signature: *b"RSDT",
                    offset: 0,
                    length: 40
                },
                AcpiTable {
                    signature: *b"FACP",
                    offset: 40,
                    length: 276
                },
                AcpiTable {
                    signature: *b"APIC",
                    offset: 316,
                    length: 120
                },
            ]
        );
    }

    #[test]
    fn test_parse_tables_stops_at_nul_signature() {
        let mut bytes = blob(&[(b"RSDT", 40)]);
        bytes.extend_from_slice(&[0u8; 64]);
        assert_eq!(parse_tables(&bytes).len(), 1);
        assert!(parse_tables(&[]).is_empty());
    }

    #[test]
    fn test_rsdp_shape() {
        let tables = parse_tables(&blob(&[(b"RSDT", 40)]));
        let rsdp = build_rsdp(&tables);
        let bytes = rsdp.as_bytes();
        assert_eq!(&bytes[0..8], b"RSD PTR ");
        assert_eq!(bytes[8], 0);
        assert_eq!(&bytes[9..15], b"BOCHS ");
        assert_eq!(bytes[15], 0);
        assert_eq!(&bytes[16..20], &[0u8; 4]);
    }

    #[test]
    fn test_rsdp_points_at_rsdt_offset() {
        let tables = parse_tables(&blob(&[(b"APIC", 120), (b"RSDT", 40)]));
        let rsdp = build_rsdp(&tables);
        assert_eq!(rsdp.rsdt_addr, 120);
    }

    #[test]
    fn test_table_loader_stream() {
        let tables = parse_tables(&blob(&[(b"FACP", 276), (b"FACS", 64), (b"RSDT", 40)]));
        let image = build_table_loader(&tables);
        assert_eq!(image.len(), TABLE_LOADER_IMAGE_SIZE);

        let commands: Vec<u32> = image
            .chunks(LOADER_COMMAND_SIZE)
            .map(|c| u32::from_le_bytes(c[..4].try_into().unwrap()))
            .collect();
        // Two allocations, FACP pointers + checksum, FACS (nothing),
        // RSDT pointers + checksum, RSDP pointer + checksum, zero padding.
        assert_eq!(
            &commands[..13],
            &[1, 1, 2, 2, 2, 3, 2, 2, 2, 2, 3, 2, 3][..]
        );
        assert!(commands[13..].iter().all(|&c| c == 0));

        // First command allocates the RSDP seed in the FSEG zone.
        let first = &image[..LOADER_COMMAND_SIZE];
        assert_eq!(&first[4..4 + ACPI_RSDP_FILE.len()], ACPI_RSDP_FILE.as_bytes());
        assert_eq!(&first[60..64], &16u32.to_le_bytes());
        assert_eq!(first[64], LOADER_ALLOC_ZONE_FSEG);

        // The FACP X_DSDT pointer is 8 bytes wide at table offset 140.
        let x_dsdt = &image[4 * LOADER_COMMAND_SIZE..5 * LOADER_COMMAND_SIZE];
        assert_eq!(&x_dsdt[116..120], &140u32.to_le_bytes());
        assert_eq!(x_dsdt[120], 8);

        // The FACP checksum covers the whole table with the result at +9.
        let facp_checksum = &image[5 * LOADER_COMMAND_SIZE..6 * LOADER_COMMAND_SIZE];
        assert_eq!(&facp_checksum[60..64], &9u32.to_le_bytes());
        assert_eq!(&facp_checksum[64..68], &0u32.to_le_bytes());
        assert_eq!(&facp_checksum[68..72], &276u32.to_le_bytes());
    }
}
