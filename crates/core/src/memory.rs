// DLPatch - Preloader Download Handler Patcher
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use crate::{CodeMemory, PatchError, PatchResult};

/// Direct volatile access to the physical address space.
///
/// Used by the on-device payload, where the preloader image is mapped at its
/// link address and nothing else runs while it is being patched.
#[derive(Debug)]
pub struct VolatileMemory {
    _private: (),
}

impl VolatileMemory {
    /// # Safety
    ///
    /// Every address later passed to this accessor must be mapped, readable
    /// and writable, and not concurrently modified by anything else.
    pub const unsafe fn new() -> Self {
        Self { _private: () }
    }
}

impl CodeMemory for VolatileMemory {
    fn read_u16(&self, addr: u32) -> PatchResult<u16> {
        if addr & 1 != 0 {
            return Err(PatchError::Misaligned(addr));
        }
        // SAFETY: upheld by the contract of `VolatileMemory::new`.
        Ok(unsafe { core::ptr::read_volatile(addr as usize as *const u16) })
    }

    fn write_u16(&mut self, addr: u32, value: u16) -> PatchResult<()> {
        if addr & 1 != 0 {
            return Err(PatchError::Misaligned(addr));
        }
        // SAFETY: upheld by the contract of `VolatileMemory::new`.
        unsafe { core::ptr::write_volatile(addr as usize as *mut u16, value) };
        Ok(())
    }

    // Literal pool slots are only guaranteed halfword alignment, so word
    // accesses fall back to two halfwords when the address is not 4-aligned.
    fn read_u32(&self, addr: u32) -> PatchResult<u32> {
        if addr & 3 != 0 {
            let lo = self.read_u16(addr)? as u32;
            let hi = self.read_u16(addr.wrapping_add(2))? as u32;
            return Ok(lo | (hi << 16));
        }
        // SAFETY: upheld by the contract of `VolatileMemory::new`.
        Ok(unsafe { core::ptr::read_volatile(addr as usize as *const u32) })
    }

    fn write_u32(&mut self, addr: u32, value: u32) -> PatchResult<()> {
        if addr & 3 != 0 {
            self.write_u16(addr, (value & 0xFFFF) as u16)?;
            return self.write_u16(addr.wrapping_add(2), (value >> 16) as u16);
        }
        // SAFETY: upheld by the contract of `VolatileMemory::new`.
        unsafe { core::ptr::write_volatile(addr as usize as *mut u32, value) };
        Ok(())
    }
}
