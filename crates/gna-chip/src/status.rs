// SPDX-License-Identifier: AGPL-3.0-only

//! Hardware status register.
//!
//! The driver returns the raw status word of a completed submission. Fault
//! bits are checked in a fixed priority order so one word always decodes to
//! the same fault.

use std::fmt;

/// Scoring completed.
pub const COMPLETED: u32 = 1 << 0;
/// At least one output saturated.
pub const SATURATION: u32 = 1 << 1;
/// MMU request error.
pub const MMU_REQUEST_ERROR: u32 = 1 << 2;
/// DMA request error.
pub const DMA_REQUEST_ERROR: u32 = 1 << 3;
/// Completion raised without a pending request.
pub const UNEXPECTED_COMPLETION: u32 = 1 << 4;
/// Virtual address outside the mapped range.
pub const VA_OUT_OF_RANGE: u32 = 1 << 5;
/// Descriptor parameter outside its legal range.
pub const PARAM_OUT_OF_RANGE: u32 = 1 << 6;

/// All fault bits.
pub const FAULT_MASK: u32 =
    MMU_REQUEST_ERROR | DMA_REQUEST_ERROR | UNEXPECTED_COMPLETION | VA_OUT_OF_RANGE | PARAM_OUT_OF_RANGE;

/// Fault reported by the hardware status register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HardwareFault {
    /// MMU request error.
    Mmu,
    /// DMA request error.
    Dma,
    /// Unexpected completion.
    UnexpectedCompletion,
    /// Virtual address out of range.
    VirtualAddressOutOfRange,
    /// Parameter out of range.
    ParameterOutOfRange,
}

impl fmt::Display for HardwareFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Mmu => "MMU request error",
            Self::Dma => "DMA request error",
            Self::UnexpectedCompletion => "unexpected completion",
            Self::VirtualAddressOutOfRange => "virtual address out of range",
            Self::ParameterOutOfRange => "parameter out of range",
        })
    }
}

/// Decoded status of a submission that did not fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatusFlags {
    /// Completion bit was set.
    pub completed: bool,
    /// Saturation bit was set.
    pub saturated: bool,
}

/// Decode a raw status word.
///
/// # Errors
///
/// Returns the highest-priority fault when any fault bit is set.
pub const fn decode(status: u32) -> Result<StatusFlags, HardwareFault> {
    if status & MMU_REQUEST_ERROR != 0 {
        return Err(HardwareFault::Mmu);
    }
    if status & DMA_REQUEST_ERROR != 0 {
        return Err(HardwareFault::Dma);
    }
    if status & VA_OUT_OF_RANGE != 0 {
        return Err(HardwareFault::VirtualAddressOutOfRange);
    }
    if status & PARAM_OUT_OF_RANGE != 0 {
        return Err(HardwareFault::ParameterOutOfRange);
    }
    if status & UNEXPECTED_COMPLETION != 0 {
        return Err(HardwareFault::UnexpectedCompletion);
    }
    Ok(StatusFlags {
        completed: status & COMPLETED != 0,
        saturated: status & SATURATION != 0,
    })
}

/// Status word for a fault, as a device would report it.
pub const fn fault_bits(fault: HardwareFault) -> u32 {
    match fault {
        HardwareFault::Mmu => MMU_REQUEST_ERROR,
        HardwareFault::Dma => DMA_REQUEST_ERROR,
        HardwareFault::UnexpectedCompletion => UNEXPECTED_COMPLETION,
        HardwareFault::VirtualAddressOutOfRange => VA_OUT_OF_RANGE,
        HardwareFault::ParameterOutOfRange => PARAM_OUT_OF_RANGE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_completion() {
        let flags = decode(COMPLETED | SATURATION).unwrap();
        assert!(flags.completed);
        assert!(flags.saturated);
    }

    #[test]
    fn mmu_fault_wins_over_dma() {
        assert_eq!(
            decode(COMPLETED | DMA_REQUEST_ERROR | MMU_REQUEST_ERROR),
            Err(HardwareFault::Mmu)
        );
    }

    #[test]
    fn every_fault_round_trips() {
        for fault in [
            HardwareFault::Mmu,
            HardwareFault::Dma,
            HardwareFault::UnexpectedCompletion,
            HardwareFault::VirtualAddressOutOfRange,
            HardwareFault::ParameterOutOfRange,
        ] {
            assert_eq!(decode(fault_bits(fault)), Err(fault));
            assert_ne!(fault_bits(fault) & FAULT_MASK, 0);
        }
    }
}
