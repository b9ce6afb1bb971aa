// Copyright (c) 2025 Intel Corporation
//
// SPDX-License-Identifier: BSD-2-Clause-Patent

//! RTMR event-log reproduction.
//!
//! An honest QEMU/OVMF TDX boot measures a fixed sequence of objects into
//! the runtime registers: the hand-off block, the configuration firmware
//! volume, the (empty) Secure Boot variables, the fw_cfg ACPI files, the
//! kernel image as patched by QEMU, the boot options, and finally the
//! kernel payloads and boot-service transitions. This module replays that
//! sequence, producing one digest per event.

use serde::{Serialize, Serializer};
use std::collections::BTreeMap;

use crate::guid::Guid;
use crate::metadata::SectionType;
use crate::pe::PortableExecutable;
use crate::rtmr::RtmrState;
use crate::util::{sha384, utf16_encode};
use crate::{acpi, hob, linux, MeasureError, TrustDomain, SHA384_DIGEST_SIZE};
use zerocopy::AsBytes;

pub const EV_SEPARATOR: u32 = 0x0000_0004;
pub const EV_EVENT_TAG: u32 = 0x0000_0006;
pub const EV_PLATFORM_CONFIG_FLAGS: u32 = 0x0000_000A;
pub const EV_EFI_EVENT_BASE: u32 = 0x8000_0000;
pub const EV_EFI_VARIABLE_DRIVER_CONFIG: u32 = EV_EFI_EVENT_BASE + 0x1;
pub const EV_EFI_VARIABLE_BOOT: u32 = EV_EFI_EVENT_BASE + 0x2;
pub const EV_EFI_BOOT_SERVICES_APPLICATION: u32 = EV_EFI_EVENT_BASE + 0x3;
pub const EV_EFI_ACTION: u32 = EV_EFI_EVENT_BASE + 0x7;
pub const EV_EFI_PLATFORM_FIRMWARE_BLOB2: u32 = EV_EFI_EVENT_BASE + 0xA;
pub const EV_EFI_HANDOFF_TABLES2: u32 = EV_EFI_EVENT_BASE + 0xB;

pub fn event_type_name(event_type: u32) -> &'static str {
    match event_type {
        EV_SEPARATOR => "EV_SEPARATOR",
        EV_EVENT_TAG => "EV_EVENT_TAG",
        EV_PLATFORM_CONFIG_FLAGS => "EV_PLATFORM_CONFIG_FLAGS",
        EV_EFI_VARIABLE_DRIVER_CONFIG => "EV_EFI_VARIABLE_DRIVER_CONFIG",
        EV_EFI_VARIABLE_BOOT => "EV_EFI_VARIABLE_BOOT",
        EV_EFI_BOOT_SERVICES_APPLICATION => "EV_EFI_BOOT_SERVICES_APPLICATION",
        EV_EFI_ACTION => "EV_EFI_ACTION",
        EV_EFI_PLATFORM_FIRMWARE_BLOB2 => "EV_EFI_PLATFORM_FIRMWARE_BLOB2",
        EV_EFI_HANDOFF_TABLES2 => "EV_EFI_HANDOFF_TABLES2",
        _ => "EV_UNKNOWN",
    }
}

/// Vendor GUID of the global EFI variables (SecureBoot, PK, KEK).
pub const EFI_GLOBAL_VARIABLE_GUID: Guid = Guid::from_fields(
    0x8be4_df61,
    0x93ca,
    0x11d2,
    [0xaa, 0x0d, 0x00, 0xe0, 0x98, 0x03, 0x2b, 0x8c],
);

/// Vendor GUID of the image security database variables (db, dbx).
pub const EFI_IMAGE_SECURITY_DATABASE_GUID: Guid = Guid::from_fields(
    0xd719_b2cb,
    0x3d3a,
    0x4596,
    [0xa3, 0xbc, 0xda, 0xd0, 0x0e, 0x67, 0x65, 0x6f],
);

// Firmware-volume device path of the UiApp boot option.
const UIAPP_FV_NAME_GUID: Guid = Guid::from_fields(
    0x7cb8_bdc9,
    0xf8eb,
    0x4f34,
    [0xaa, 0xea, 0x3e, 0xe4, 0xaf, 0x65, 0x16, 0xa1],
);
const UIAPP_FILE_GUID: Guid = Guid::from_fields(
    0x462c_aa21,
    0x7614,
    0x4503,
    [0x83, 0x6e, 0x8a, 0xb6, 0xf4, 0x66, 0x23, 0x31],
);

pub const EFI_CALLING_EFI_APPLICATION: &str = "Calling EFI Application from Boot Option";
pub const EFI_EXIT_BOOT_SERVICES_INVOCATION: &str = "Exit Boot Services Invocation";
pub const EFI_EXIT_BOOT_SERVICES_SUCCEEDED: &str = "Exit Boot Services Returned with Success";

const UKI_LINUX_SECTION: &[u8; 8] = b".linux\0\0";
const UKI_INITRD_SECTION: &[u8; 8] = b".initrd\0";
const UKI_CMDLINE_SECTION: &[u8; 8] = b".cmdline";

/// One reproduced log entry: the digest extended into `mr_index` plus
/// informative labels for display.
#[derive(Clone, Debug, Serialize)]
pub struct TdEvent {
    pub name: String,
    #[serde(rename = "type", serialize_with = "serialize_event_type")]
    pub event_type: u32,
    pub mr_index: u32,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
    #[serde(with = "hex::serde")]
    pub digest: [u8; SHA384_DIGEST_SIZE],
}

fn serialize_event_type<S: Serializer>(event_type: &u32, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(event_type_name(*event_type))
}

impl TdEvent {
    fn measure(name: &str, event_type: u32, mr_index: u32, preimage: &[u8]) -> Self {
        TdEvent {
            name: name.to_string(),
            event_type,
            mr_index,
            metadata: BTreeMap::new(),
            digest: sha384(preimage),
        }
    }

    fn with_metadata(mut self, entries: &[(&str, String)]) -> Self {
        for (key, value) in entries {
            self.metadata.insert(key.to_string(), value.clone());
        }
        self
    }
}

/// The reproduced register set together with the event list behind it.
#[derive(Clone, Debug)]
pub struct RtmrReproduction {
    pub registers: [[u8; SHA384_DIGEST_SIZE]; 4],
    pub events: Vec<TdEvent>,
}

/// TCG UEFI_VARIABLE_DATA preimage of a variable with empty contents.
fn variable_preimage(vendor_guid: &Guid, name: &str) -> Vec<u8> {
    let unicode_name = utf16_encode(name);
    let mut preimage = Vec::with_capacity(32 + unicode_name.len());
    preimage.extend_from_slice(&vendor_guid.to_bytes());
    preimage.extend_from_slice(&((unicode_name.len() / 2) as u64).to_le_bytes());
    preimage.extend_from_slice(&0u64.to_le_bytes());
    preimage.extend_from_slice(&unicode_name);
    preimage
}

/// The EFI_LOAD_OPTION bytes of the canonical `Boot0000` (UiApp) entry:
/// attributes, file-path-list length, description, a firmware-volume
/// device path, and the end-of-path node.
fn uiapp_load_option() -> Vec<u8> {
    let mut option = Vec::with_capacity(62);
    option.extend_from_slice(&0x0000_0109u32.to_le_bytes());
    option.extend_from_slice(&44u16.to_le_bytes());
    option.extend_from_slice(&utf16_encode("UiApp\0"));
    option.extend_from_slice(&[0x04, 0x07, 0x14, 0x00]);
    option.extend_from_slice(&UIAPP_FV_NAME_GUID.to_bytes());
    option.extend_from_slice(&[0x04, 0x06, 0x14, 0x00]);
    option.extend_from_slice(&UIAPP_FILE_GUID.to_bytes());
    option.extend_from_slice(&[0x7f, 0xff, 0x04, 0x00]);
    option
}

fn separator_event() -> TdEvent {
    TdEvent::measure("Separator", EV_SEPARATOR, 0, &[0u8; 4])
}

fn action_event(action: &str) -> TdEvent {
    TdEvent::measure("EFI action", EV_EFI_ACTION, 1, action.as_bytes())
        .with_metadata(&[("action", action.to_string())])
}

/// Reproduce the four RTMRs and their event log for a trust domain.
///
/// The kernel buffer is patched in place (see [`linux::patch_kernel`]);
/// callers that need the original bytes must copy them first.
pub fn reproduce_rtmr(td: &mut TrustDomain) -> Result<RtmrReproduction, MeasureError> {
    let events = generate_event_log(td)?;
    let registers = RtmrState::fold(&events);
    Ok(RtmrReproduction { registers, events })
}

fn generate_event_log(td: &mut TrustDomain) -> Result<Vec<TdEvent>, MeasureError> {
    let mut events = Vec::new();

    // Hand-off block describing the guest memory map.
    let td_hob = hob::build_td_hob(td.firmware.sections(), td.hardware.memory_size)?;
    events.push(
        TdEvent::measure("HOB", EV_EFI_HANDOFF_TABLES2, 0, &td_hob).with_metadata(&[(
            "memory_size",
            format!("{:#x}", td.hardware.memory_size),
        )]),
    );

    // Configuration firmware volume contents, one event per CFV section.
    for section in td
        .firmware
        .sections()
        .iter()
        .filter(|s| s.section_type == SectionType::Cfv)
    {
        events.push(
            TdEvent::measure(
                "CFV",
                EV_EFI_PLATFORM_FIRMWARE_BLOB2,
                0,
                td.firmware.section_data(section),
            )
            .with_metadata(&[
                ("base", format!("{:#x}", section.mem_base)),
                ("length", format!("{:#x}", section.raw_size)),
            ]),
        );
    }

    // Secure Boot configuration, all variables empty.
    for (vendor_guid, name) in [
        (EFI_GLOBAL_VARIABLE_GUID, "SecureBoot"),
        (EFI_GLOBAL_VARIABLE_GUID, "PK"),
        (EFI_GLOBAL_VARIABLE_GUID, "KEK"),
        (EFI_IMAGE_SECURITY_DATABASE_GUID, "db"),
        (EFI_IMAGE_SECURITY_DATABASE_GUID, "dbx"),
    ] {
        events.push(
            TdEvent::measure(
                name,
                EV_EFI_VARIABLE_DRIVER_CONFIG,
                0,
                &variable_preimage(&vendor_guid, name),
            )
            .with_metadata(&[
                ("variable_name", name.to_string()),
                ("vendor_guid", vendor_guid.to_string()),
            ]),
        );
    }

    events.push(separator_event());

    // QEMU fw_cfg ACPI files.
    let tables = acpi::parse_tables(&td.hardware.acpi_tables);
    events.push(
        TdEvent::measure(
            "ACPI table loader",
            EV_PLATFORM_CONFIG_FLAGS,
            0,
            &acpi::build_table_loader(&tables),
        )
        .with_metadata(&[("file_name", acpi::TABLE_LOADER_FILE.to_string())]),
    );
    events.push(
        TdEvent::measure(
            "RSDP",
            EV_PLATFORM_CONFIG_FLAGS,
            0,
            acpi::build_rsdp(&tables).as_bytes(),
        )
        .with_metadata(&[("file_name", acpi::ACPI_RSDP_FILE.to_string())]),
    );
    events.push(
        TdEvent::measure(
            "ACPI tables",
            EV_PLATFORM_CONFIG_FLAGS,
            0,
            &td.hardware.acpi_tables,
        )
        .with_metadata(&[("file_name", acpi::ACPI_TABLES_FILE.to_string())]),
    );

    // QEMU patches the boot-protocol header before the firmware ever sees
    // the kernel, so the patched bytes are what the PE hash covers.
    linux::patch_kernel(
        &mut td.software.kernel,
        td.hardware.memory_size,
        td.software.cmdline.as_deref().unwrap_or(""),
        td.software.initrd.as_ref().map(|i| i.len()),
    )?;

    let kernel = PortableExecutable::parse(&td.software.kernel)?;
    let linux_section = kernel.section_by_name(UKI_LINUX_SECTION);
    let kernel_name = if linux_section.is_some() {
        "Linux unified kernel image"
    } else {
        "Linux kernel"
    };
    events.push(TdEvent {
        name: kernel_name.to_string(),
        event_type: EV_EFI_BOOT_SERVICES_APPLICATION,
        mr_index: 1,
        metadata: BTreeMap::new(),
        digest: kernel.authenticode_digest()?,
    });

    // Boot variables: an empty BootOrder and the built-in UiApp entry.
    events.push(
        TdEvent::measure("BootOrder", EV_EFI_VARIABLE_BOOT, 0, &[0u8; 2])
            .with_metadata(&[("variable_name", "BootOrder".to_string())]),
    );
    events.push(
        TdEvent::measure("Boot0000", EV_EFI_VARIABLE_BOOT, 0, &uiapp_load_option())
            .with_metadata(&[
                ("variable_name", "Boot0000".to_string()),
                ("description", "UiApp".to_string()),
            ]),
    );

    events.push(action_event(EFI_CALLING_EFI_APPLICATION));
    events.push(separator_event());

    // Payloads: a UKI carries its kernel, initrd and cmdline in sections;
    // a plain kernel uses the ones supplied alongside it.
    let measured_initrd;
    let measured_cmdline;
    if let Some(section) = linux_section {
        let inner = PortableExecutable::parse(kernel.section_body(section))?;
        events.push(TdEvent {
            name: "Linux kernel".to_string(),
            event_type: EV_EFI_BOOT_SERVICES_APPLICATION,
            mr_index: 1,
            metadata: BTreeMap::new(),
            digest: inner.authenticode_digest()?,
        });

        measured_initrd = kernel
            .section_by_name(UKI_INITRD_SECTION)
            .map(|s| kernel.section_body(s).to_vec());
        measured_cmdline = kernel.section_by_name(UKI_CMDLINE_SECTION).map(|s| {
            String::from_utf8_lossy(kernel.section_body(s))
                .trim_end_matches('\0')
                .to_string()
        });
    } else {
        measured_initrd = td.software.initrd.clone();
        measured_cmdline = td.software.cmdline.clone().map(|cmdline| {
            if td.software.initrd.is_some() {
                // The firmware loads the initrd over fw_cfg and tells the
                // kernel where to find it.
                cmdline + " initrd=initrd"
            } else {
                cmdline
            }
        });
    }

    if let Some(cmdline) = &measured_cmdline {
        let mut preimage = utf16_encode(cmdline);
        preimage.extend_from_slice(&[0u8; 2]);
        events.push(
            TdEvent::measure("cmdline", EV_EVENT_TAG, 2, &preimage)
                .with_metadata(&[("cmdline", cmdline.clone())]),
        );
    }
    if let Some(initrd) = &measured_initrd {
        events.push(
            TdEvent::measure("initrd", EV_EVENT_TAG, 2, initrd)
                .with_metadata(&[("length", format!("{:#x}", initrd.len()))]),
        );
    }

    events.push(action_event(EFI_EXIT_BOOT_SERVICES_INVOCATION));
    events.push(action_event(EFI_EXIT_BOOT_SERVICES_SUCCEEDED));

    Ok(events)
}
