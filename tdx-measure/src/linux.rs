// Copyright (c) 2025 Intel Corporation
//
// SPDX-License-Identifier: BSD-2-Clause-Patent

//! Linux boot-protocol header patching.
//!
//! Before the firmware measures the kernel image, QEMU's `x86_load_linux`
//! has already rewritten parts of the boot-protocol header (loader type,
//! heap, command-line and initrd placement). The same writes are replayed
//! here so the Authenticode hash covers the bytes an honest launch hashes.

use core::fmt;

const MIN_KERNEL_SIZE: usize = 0x1000;

// Boot-protocol header fields, offsets into the kernel image.
const HDRS_MAGIC_OFFSET: usize = 0x202;
const PROTOCOL_OFFSET: usize = 0x206;
const TYPE_OF_LOADER_OFFSET: usize = 0x210;
const LOADFLAGS_OFFSET: usize = 0x211;
const RAMDISK_IMAGE_OFFSET: usize = 0x218;
const RAMDISK_SIZE_OFFSET: usize = 0x21c;
const HEAP_END_PTR_OFFSET: usize = 0x224;
const CMD_LINE_PTR_OFFSET: usize = 0x228;
const INITRD_ADDR_MAX_OFFSET: usize = 0x22c;
const XLOADFLAGS_OFFSET: usize = 0x236;

const LOADFLAGS_LOADED_HIGH: u8 = 0x01;
const LOADFLAGS_CAN_USE_HEAP: u8 = 0x80;
const XLF_CAN_BE_LOADED_ABOVE_4G: u16 = 0x02;

// QEMU reserves this much below-4G space for fw_cfg ACPI data.
const ACPI_DATA_SIZE: u64 = 0x28000;

#[derive(Debug, PartialEq, Eq)]
pub enum KernelPatchError {
    /// The image is too small to carry a boot-protocol header.
    UndersizedImage(usize),
    /// The boot protocol predates initrd support.
    InitrdNotSupported,
    /// The initrd does not fit below the protocol's load ceiling.
    InitrdTooLarge { size: usize, max: u64 },
}

impl fmt::Display for KernelPatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UndersizedImage(size) => {
                write!(f, "kernel image of {} bytes has no boot header", size)
            }
            Self::InitrdNotSupported => {
                write!(f, "kernel too old for initrd (protocol < 0x200)")
            }
            Self::InitrdTooLarge { size, max } => {
                write!(f, "initrd of {} bytes exceeds the {:#x} limit", size, max)
            }
        }
    }
}

impl std::error::Error for KernelPatchError {}

fn read_u16(kernel: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes(kernel[offset..offset + 2].try_into().unwrap())
}

fn write_u16(kernel: &mut [u8], offset: usize, value: u16) {
    kernel[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

fn write_u32(kernel: &mut [u8], offset: usize, value: u32) {
    kernel[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

/// Patch the boot-protocol header in place, mirroring QEMU's
/// `x86_load_linux` for a guest with `memory_size` bytes of RAM.
pub fn patch_kernel(
    kernel: &mut [u8],
    memory_size: u64,
    cmdline: &str,
    initrd_size: Option<usize>,
) -> Result<(), KernelPatchError> {
    if kernel.len() < MIN_KERNEL_SIZE {
        return Err(KernelPatchError::UndersizedImage(kernel.len()));
    }

    let protocol = if &kernel[HDRS_MAGIC_OFFSET..HDRS_MAGIC_OFFSET + 4] == b"HdrS" {
        read_u16(kernel, PROTOCOL_OFFSET)
    } else {
        0
    };

    let cmdline_size = (cmdline.len() as u64 + 16) & !15;
    let lowmem: u64 = if memory_size >= 0xb000_0000 {
        0x8000_0000
    } else {
        0xb000_0000
    };
    let below_4g_mem_size = memory_size.min(lowmem);

    let (real_addr, cmdline_addr) =
        if protocol < 0x202 || kernel[LOADFLAGS_OFFSET] & LOADFLAGS_LOADED_HIGH == 0 {
            (0x90000u64, 0x9a000 - cmdline_size)
        } else {
            (0x10000u64, 0x20000u64)
        };

    let mut initrd_max: u64 = if protocol >= 0x20c
        && read_u16(kernel, XLOADFLAGS_OFFSET) & XLF_CAN_BE_LOADED_ABOVE_4G != 0
    {
        0xffff_ffff
    } else if protocol >= 0x203 {
        u32::from_le_bytes(
            kernel[INITRD_ADDR_MAX_OFFSET..INITRD_ADDR_MAX_OFFSET + 4]
                .try_into()
                .unwrap(),
        ) as u64
    } else {
        0x37ff_ffff
    };
    initrd_max = initrd_max.min(below_4g_mem_size - ACPI_DATA_SIZE - 1);

    if protocol >= 0x202 {
        write_u32(kernel, CMD_LINE_PTR_OFFSET, cmdline_addr as u32);
    } else {
        write_u16(kernel, 0x20, 0xa33f);
        write_u16(kernel, 0x22, (cmdline_addr - real_addr) as u16);
    }

    if protocol >= 0x200 {
        // type_of_loader = QEMU
        kernel[TYPE_OF_LOADER_OFFSET] = 0xb0;
    }
    if protocol >= 0x201 {
        kernel[LOADFLAGS_OFFSET] |= LOADFLAGS_CAN_USE_HEAP;
        write_u16(
            kernel,
            HEAP_END_PTR_OFFSET,
            (cmdline_addr - real_addr - 0x200) as u16,
        );
    }

    if let Some(size) = initrd_size {
        if protocol < 0x200 {
            return Err(KernelPatchError::InitrdNotSupported);
        }
        if size as u64 >= initrd_max {
            return Err(KernelPatchError::InitrdTooLarge {
                size,
                max: initrd_max,
            });
        }
        let initrd_addr = (initrd_max - size as u64) & !4095;
        write_u32(kernel, RAMDISK_IMAGE_OFFSET, initrd_addr as u32);
        write_u32(kernel, RAMDISK_SIZE_OFFSET, size as u32);
    }

    log::debug!(
        "patched kernel header: protocol {:#x}, cmdline_addr {:#x}, initrd_max {:#x}",
        protocol,
        cmdline_addr,
        initrd_max
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const GIB: u64 = 0x4000_0000;

    fn kernel_with_protocol(protocol: u16) -> Vec<u8> {
        let mut kernel = vec![0u8; 0x2000];
        kernel[HDRS_MAGIC_OFFSET..HDRS_MAGIC_OFFSET + 4].copy_from_slice(b"HdrS");
        kernel[PROTOCOL_OFFSET..PROTOCOL_OFFSET + 2].copy_from_slice(&protocol.to_le_bytes());
        kernel[LOADFLAGS_OFFSET] = LOADFLAGS_LOADED_HIGH;
        kernel
    }

    #[test]
    fn test_modern_protocol_fields() {
        let mut kernel = kernel_with_protocol(0x20c);
        kernel[XLOADFLAGS_OFFSET..XLOADFLAGS_OFFSET + 2]
            .copy_from_slice(&XLF_CAN_BE_LOADED_ABOVE_4G.to_le_bytes());

        patch_kernel(&mut kernel, GIB, "console=ttyS0", Some(0x100000)).unwrap();

        assert_eq!(kernel[TYPE_OF_LOADER_OFFSET], 0xb0);
        assert_eq!(
            kernel[LOADFLAGS_OFFSET],
            LOADFLAGS_LOADED_HIGH | LOADFLAGS_CAN_USE_HEAP
        );
        assert_eq!(read_u16(&kernel, HEAP_END_PTR_OFFSET), 0xfe00);
        assert_eq!(
            &kernel[CMD_LINE_PTR_OFFSET..CMD_LINE_PTR_OFFSET + 4],
            &0x20000u32.to_le_bytes()
        );

        // initrd_max capped at ram - ACPI area - 1, initrd placed below it.
        let initrd_max = GIB - 0x28000 - 1;
        let initrd_addr = (initrd_max - 0x100000) & !4095;
        assert_eq!(
            &kernel[RAMDISK_IMAGE_OFFSET..RAMDISK_IMAGE_OFFSET + 4],
            &(initrd_addr as u32).to_le_bytes()
        );
        assert_eq!(
            &kernel[RAMDISK_SIZE_OFFSET..RAMDISK_SIZE_OFFSET + 4],
            &0x100000u32.to_le_bytes()
        );
    }

    #[test]
    fn test_legacy_protocol_cmdline_fields() {
        let mut kernel = vec![0u8; 0x2000];
        // No HdrS magic: protocol 0, zero-page style command line fields.
        patch_kernel(&mut kernel, GIB, "root=/dev/vda", None).unwrap();

        assert_eq!(read_u16(&kernel, 0x20), 0xa33f);
        let cmdline_size = (13u64 + 16) & !15;
        let expected = (0x9a000 - cmdline_size - 0x90000) as u16;
        assert_eq!(read_u16(&kernel, 0x22), expected);
        assert_eq!(kernel[TYPE_OF_LOADER_OFFSET], 0);
    }

    #[test]
    fn test_ram_size_independence_above_threshold() {
        let mut a = kernel_with_protocol(0x20c);
        let mut b = kernel_with_protocol(0x20c);
        patch_kernel(&mut a, 0xb000_0000, "quiet", Some(0x1000)).unwrap();
        patch_kernel(&mut b, 0x2_0000_0000, "quiet", Some(0x1000)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_initrd_requires_protocol() {
        let mut kernel = vec![0u8; 0x2000];
        assert_eq!(
            patch_kernel(&mut kernel, GIB, "", Some(0x1000)),
            Err(KernelPatchError::InitrdNotSupported)
        );
    }

    #[test]
    fn test_initrd_too_large() {
        let mut kernel = kernel_with_protocol(0x203);
        kernel[INITRD_ADDR_MAX_OFFSET..INITRD_ADDR_MAX_OFFSET + 4]
            .copy_from_slice(&0x1000000u32.to_le_bytes());
        assert!(matches!(
            patch_kernel(&mut kernel, GIB, "", Some(0x1000000)),
            Err(KernelPatchError::InitrdTooLarge { .. })
        ));
    }

    #[test]
    fn test_undersized_image() {
        let mut kernel = vec![0u8; 0x800];
        assert_eq!(
            patch_kernel(&mut kernel, GIB, "", None),
            Err(KernelPatchError::UndersizedImage(0x800))
        );
    }
}
