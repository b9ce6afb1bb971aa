// Copyright (c) 2025 Intel Corporation
//
// SPDX-License-Identifier: BSD-2-Clause-Patent

//! Helpers for the host-side measurement tools.

use std::io;
use std::{fs, io::ErrorKind};

use log::error;

/// Struct to read input data from a file.
pub struct InputData {
    data: Vec<u8>,
}

impl InputData {
    /// Read data from file into the internal buffer.
    pub fn new(name: &str, max_size: u64, desc: &str) -> io::Result<Self> {
        // Check file size first to avoid allocating too much memory.
        let md = fs::metadata(name).map_err(|e| {
            error!("Can not get metadata of file {}: {}", name, e);
            e
        })?;
        if md.len() > max_size {
            error!(
                "Size of {} file ({}) is invalid, should be at most {}",
                desc,
                md.len(),
                max_size
            );
            return Err(io::Error::new(ErrorKind::Other, "invalid file size"));
        }

        let data = fs::read(name).map_err(|e| {
            error!("Can not read data from file {}: {}", name, e);
            e
        })?;

        Ok(InputData { data })
    }

    /// Get the input data.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Consume the reader and take the buffer.
    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_input_data() {
        let mut path = std::env::temp_dir();
        path.push("tdx-measure-tools-input-data-test");
        let mut file = fs::File::create(&path).unwrap();
        file.write_all(&[1, 2, 3, 4]).unwrap();
        drop(file);
        let name = path.to_str().unwrap();

        let input = InputData::new(name, 16, "test").unwrap();
        assert_eq!(input.as_bytes(), &[1, 2, 3, 4]);
        assert_eq!(input.into_vec(), vec![1, 2, 3, 4]);

        assert!(InputData::new(name, 3, "test").is_err());
        assert!(InputData::new("/nonexistent/input", 16, "test").is_err());

        fs::remove_file(&path).unwrap();
    }
}
