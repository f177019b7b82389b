// DLPatch - Preloader Download Handler Patcher
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

#![cfg_attr(not(feature = "std"), no_std)]

#[macro_use]
mod macros;

pub mod cache;
pub mod console;
pub mod memory;
pub mod patcher;
pub mod platform;
pub mod scanner;
pub mod sequencer;
#[cfg(feature = "std")]
pub mod sim;
pub mod thumb;


pub use cache::{CacheMaintenance, CoherenceManager};
pub use patcher::{PatchOp, PatchRecord, Patcher};
pub use platform::Platform;
pub use scanner::search;
pub use sequencer::{Boot, Handoff, PatchReport, Sequencer, Stage, StageOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PatchError {
    #[error("Memory access violation at {0:#x}")]
    MemoryViolation(u32),
    #[error("Misaligned halfword access at {0:#x}")]
    Misaligned(u32),
    #[error("usbdl_handler signature not found")]
    HandlerNotFound,
    #[error("Unsupported instruction {opcode:#06x} at {addr:#x}")]
    UnsupportedInstruction { addr: u32, opcode: u16 },
    #[error("Step limit reached at {0:#x}")]
    StepLimit(u32),
}

pub type PatchResult<T> = Result<T, PatchError>;

/// Halfword view of the firmware's executable memory.
///
/// Instructions are fetched as 16-bit units, so this is the only access width
/// the scanner and patcher need. Word accesses are little-endian pairs.
pub trait CodeMemory {
    fn read_u16(&self, addr: u32) -> PatchResult<u16>;
    fn write_u16(&mut self, addr: u32, value: u16) -> PatchResult<()>;

    fn read_u32(&self, addr: u32) -> PatchResult<u32> {
        let lo = self.read_u16(addr)? as u32;
        let hi = self.read_u16(addr.wrapping_add(2))? as u32;
        Ok(lo | (hi << 16))
    }

    fn write_u32(&mut self, addr: u32, value: u32) -> PatchResult<()> {
        self.write_u16(addr, (value & 0xFFFF) as u16)?;
        self.write_u16(addr.wrapping_add(2), (value >> 16) as u16)?;
        Ok(())
    }
}

impl<M: CodeMemory + ?Sized> CodeMemory for &mut M {
    fn read_u16(&self, addr: u32) -> PatchResult<u16> {
        (**self).read_u16(addr)
    }

    fn write_u16(&mut self, addr: u32, value: u16) -> PatchResult<()> {
        (**self).write_u16(addr, value)
    }

    fn read_u32(&self, addr: u32) -> PatchResult<u32> {
        (**self).read_u32(addr)
    }

    fn write_u32(&mut self, addr: u32, value: u32) -> PatchResult<()> {
        (**self).write_u32(addr, value)
    }
}
