// Copyright (c) 2025 Intel Corporation
//
// SPDX-License-Identifier: BSD-2-Clause-Patent

//! Runtime measurement registers.
//!
//! Each RTMR is an extend-only 48-byte register: extending replaces the
//! register with `SHA-384(old_value || event_digest)`. Registers never
//! touched by an event stay all-zero.

use sha2::{Digest, Sha384};

use crate::event_log::TdEvent;
use crate::SHA384_DIGEST_SIZE;

pub const RTMR_COUNT: usize = 4;

#[derive(Clone, Debug)]
pub struct RtmrState {
    registers: [[u8; SHA384_DIGEST_SIZE]; RTMR_COUNT],
}

impl RtmrState {
    pub fn new() -> Self {
        RtmrState {
            registers: [[0u8; SHA384_DIGEST_SIZE]; RTMR_COUNT],
        }
    }

    pub fn extend(&mut self, mr_index: usize, digest: &[u8; SHA384_DIGEST_SIZE]) {
        let mut concat = [0u8; SHA384_DIGEST_SIZE * 2];
        concat[..SHA384_DIGEST_SIZE].copy_from_slice(&self.registers[mr_index]);
        concat[SHA384_DIGEST_SIZE..].copy_from_slice(digest);

        let mut hasher = Sha384::new();
        hasher.update(concat);
        self.registers[mr_index].copy_from_slice(&hasher.finalize());
    }

    pub fn registers(&self) -> &[[u8; SHA384_DIGEST_SIZE]; RTMR_COUNT] {
        &self.registers
    }

    /// Chain all events into their target registers, in emission order.
    pub fn fold(events: &[TdEvent]) -> [[u8; SHA384_DIGEST_SIZE]; RTMR_COUNT] {
        let mut state = RtmrState::new();
        for event in events {
            state.extend(event.mr_index as usize, &event.digest);
        }
        state.registers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::sha384;

    #[test]
    fn test_extend_chains_previous_value() {
        let mut state = RtmrState::new();
        let digest = sha384(b"event");

        state.extend(1, &digest);
        let mut concat = [0u8; 96];
        concat[48..].copy_from_slice(&digest);
        let first = sha384(&concat);
        assert_eq!(state.registers()[1], first);

        state.extend(1, &digest);
        concat[..48].copy_from_slice(&first);
        assert_eq!(state.registers()[1], sha384(&concat));

        // Untouched registers stay zero.
        assert_eq!(state.registers()[0], [0u8; 48]);
        assert_eq!(state.registers()[3], [0u8; 48]);
    }
}
