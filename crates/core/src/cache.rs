// DLPatch - Preloader Download Handler Patcher
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

/// Line size assumed when the platform profile does not override it.
pub const DEFAULT_CACHE_LINE: u32 = 32;

/// Raw cache maintenance operations of the CPU running the payload.
pub trait CacheMaintenance {
    /// Clean and invalidate the data cache line holding `addr`.
    fn clean_invalidate_line(&mut self, addr: u32);

    /// Invalidate the instruction cache and wait until every maintenance
    /// operation issued so far has completed.
    fn complete(&mut self);

    /// Data and instruction synchronization barrier.
    fn synchronize(&mut self);
}

impl<C: CacheMaintenance + ?Sized> CacheMaintenance for &mut C {
    fn clean_invalidate_line(&mut self, addr: u32) {
        (**self).clean_invalidate_line(addr)
    }

    fn complete(&mut self) {
        (**self).complete()
    }

    fn synchronize(&mut self) {
        (**self).synchronize()
    }
}

/// Keeps instruction fetch coherent with the patcher's data-side writes.
///
/// Patched bytes sit in the data cache until cleaned, and the instruction
/// cache may still hold the old encodings, so every write to executable memory
/// goes through [`CoherenceManager::invalidate`] before it can be fetched.
#[derive(Debug)]
pub struct CoherenceManager<C> {
    cache: C,
    line: u32,
}

impl<C: CacheMaintenance> CoherenceManager<C> {
    pub fn new(cache: C) -> Self {
        Self::with_line_size(cache, DEFAULT_CACHE_LINE)
    }

    /// `line` must be a power of two.
    pub fn with_line_size(cache: C, line: u32) -> Self {
        debug_assert!(line.is_power_of_two());
        Self { cache, line }
    }

    pub fn line_size(&self) -> u32 {
        self.line
    }

    /// Cleans and invalidates every line overlapping `[addr, addr + size)`.
    pub fn invalidate(&mut self, addr: u32, size: u32) {
        let end = addr.saturating_add(size);
        let mut line = addr & !(self.line - 1);

        while line < end {
            self.cache.clean_invalidate_line(line);
            line = match line.checked_add(self.line) {
                Some(next) => next,
                None => break,
            };
        }

        self.cache.complete();
        trace_debug!("Invalidated {:#x}..{:#x}", addr, end);
    }

    /// Barrier issued right before branching into patched code.
    pub fn synchronize(&mut self) {
        self.cache.synchronize();
    }

    pub fn cache(&self) -> &C {
        &self.cache
    }

    pub fn into_inner(self) -> C {
        self.cache
    }
}
