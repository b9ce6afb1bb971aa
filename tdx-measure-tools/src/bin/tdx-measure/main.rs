// Copyright (c) 2025 Intel Corporation
//
// SPDX-License-Identifier: BSD-2-Clause-Patent

//! Compute the reference MRTD and RTMRs of a QEMU/OVMF TDX guest and
//! print them, together with the event log, as a JSON report.

#[macro_use]
extern crate clap;

use anyhow::{Context, Result};
use log::{error, LevelFilter};
use serde::Serialize;
use std::str::FromStr;
use tdx_measure::{
    parse_firmware, reproduce_mrtd, reproduce_rtmr, Hardware, Software, TdEvent, TrustDomain,
    SHA384_DIGEST_SIZE,
};
use tdx_measure_tools::InputData;

const MAX_FIRMWARE_SIZE: u64 = 0x1000_0000;
const MAX_ACPI_SIZE: u64 = 0x10_0000;
const MAX_KERNEL_SIZE: u64 = 0x1000_0000;
const MAX_INITRD_SIZE: u64 = 0x4000_0000;

struct Config {
    // TDVF firmware image file path
    pub firmware: String,
    // ACPI tables blob file path
    pub acpi: String,
    // Kernel image or UKI file path
    pub kernel: String,
    // Optional initrd file path
    pub initrd: Option<String>,
    // Optional kernel command line
    pub cmdline: Option<String>,
    // Guest RAM size in bytes
    pub memory: u64,
    // Log level
    pub log_level: String,
}

#[derive(Debug)]
pub enum ConfigParseError {
    InvalidMemorySize,
    InvalidLogLevel,
}

impl Config {
    pub fn new() -> Result<Self, ConfigParseError> {
        let matches = command!()
            .arg(
                arg!(-f --firmware "TDVF firmware image (e.g. OVMF.fd)")
                    .required(true)
                    .takes_value(true)
                    .allow_invalid_utf8(false),
            )
            .arg(
                arg!(-a --acpi "concatenated raw ACPI tables blob")
                    .required(true)
                    .takes_value(true)
                    .allow_invalid_utf8(false),
            )
            .arg(
                arg!(-k --kernel "kernel image or UKI")
                    .required(true)
                    .takes_value(true)
                    .allow_invalid_utf8(false),
            )
            .arg(
                arg!(-i --initrd "initrd image")
                    .required(false)
                    .takes_value(true)
                    .allow_invalid_utf8(false),
            )
            .arg(
                arg!(-c --cmdline "kernel command line")
                    .required(false)
                    .takes_value(true)
                    .allow_invalid_utf8(false),
            )
            .arg(
                arg!(-m --memory "guest RAM size in bytes, decimal or 0x-hex")
                    .required(true)
                    .takes_value(true)
                    .allow_invalid_utf8(false),
            )
            .arg(
                arg!(-l --"log-level" "logging level: [off, error, warn, info, debug, trace]")
                    .required(false)
                    .default_value("info"),
            )
            .get_matches();

        // Safe to unwrap() because they are mandatory or have default values.
        let firmware = matches.value_of("firmware").unwrap().to_string();
        let acpi = matches.value_of("acpi").unwrap().to_string();
        let kernel = matches.value_of("kernel").unwrap().to_string();
        let initrd = matches.value_of("initrd").map(|v| v.to_string());
        let cmdline = matches.value_of("cmdline").map(|v| v.to_string());
        let memory = parse_int::parse::<u64>(matches.value_of("memory").unwrap())
            .map_err(|_| ConfigParseError::InvalidMemorySize)?;
        let log_level = String::from_str(matches.value_of("log-level").unwrap())
            .map_err(|_| ConfigParseError::InvalidLogLevel)?;

        Ok(Self {
            firmware,
            acpi,
            kernel,
            initrd,
            cmdline,
            memory,
            log_level,
        })
    }
}

#[derive(Serialize)]
struct MeasurementReport {
    #[serde(with = "hex::serde")]
    mrtd: [u8; SHA384_DIGEST_SIZE],
    #[serde(with = "hex::serde")]
    rtmr0: [u8; SHA384_DIGEST_SIZE],
    #[serde(with = "hex::serde")]
    rtmr1: [u8; SHA384_DIGEST_SIZE],
    #[serde(with = "hex::serde")]
    rtmr2: [u8; SHA384_DIGEST_SIZE],
    #[serde(with = "hex::serde")]
    rtmr3: [u8; SHA384_DIGEST_SIZE],
    events: Vec<TdEvent>,
}

fn main() -> Result<()> {
    use env_logger::Env;
    let env = Env::default()
        .filter_or("TDX_MEASURE_LOG_LEVEL", "info")
        .write_style_or("TDX_MEASURE_LOG_STYLE", "always");
    env_logger::init_from_env(env);

    let config = Config::new().map_err(|e| {
        error!("Parse command line error: {:?}", e);
        anyhow::anyhow!("invalid command line parameter")
    })?;
    if let Ok(lvl) = LevelFilter::from_str(config.log_level.as_str()) {
        log::set_max_level(lvl);
    }

    let firmware_data = InputData::new(&config.firmware, MAX_FIRMWARE_SIZE, "firmware")?;
    let firmware = parse_firmware(firmware_data.into_vec())
        .with_context(|| format!("failed to decode firmware {}", config.firmware))?;
    let mrtd = reproduce_mrtd(&firmware);

    let acpi_tables = InputData::new(&config.acpi, MAX_ACPI_SIZE, "ACPI tables")?.into_vec();
    let kernel = InputData::new(&config.kernel, MAX_KERNEL_SIZE, "kernel")?.into_vec();
    let initrd = config
        .initrd
        .as_deref()
        .map(|name| InputData::new(name, MAX_INITRD_SIZE, "initrd").map(InputData::into_vec))
        .transpose()?;

    let mut td = TrustDomain {
        hardware: Hardware {
            memory_size: config.memory,
            acpi_tables,
        },
        firmware,
        software: Software {
            kernel,
            initrd,
            cmdline: config.cmdline,
        },
    };
    let reproduction = reproduce_rtmr(&mut td).context("failed to reproduce RTMRs")?;

    let report = MeasurementReport {
        mrtd,
        rtmr0: reproduction.registers[0],
        rtmr1: reproduction.registers[1],
        rtmr2: reproduction.registers[2],
        rtmr3: reproduction.registers[3],
        events: reproduction.events,
    };
    println!("{}", serde_json::to_string_pretty(&report)?);

    Ok(())
}
