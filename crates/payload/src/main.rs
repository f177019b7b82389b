// DLPatch - Preloader Download Handler Patcher
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

#![no_std]
#![no_main]
#![allow(clippy::empty_loop)]

use core::fmt::Write;
use core::panic::PanicInfo;

use dlpatch_core::console::{Console, MmioUart};
use dlpatch_core::memory::VolatileMemory;
use dlpatch_core::{CacheMaintenance, Platform, Sequencer};

#[cfg(not(feature = "cortex-a7"))]
const PLATFORM: Platform = Platform::MT6572;
#[cfg(feature = "cortex-a7")]
const PLATFORM: Platform = Platform {
    cache_line: 64,
    ..Platform::MT6572
};

/// ARMv7-A CP15 cache maintenance.
struct Cp15Cache;

#[cfg(target_arch = "arm")]
impl CacheMaintenance for Cp15Cache {
    fn clean_invalidate_line(&mut self, addr: u32) {
        // DCCIMVAC
        unsafe {
            core::arch::asm!(
                "mcr p15, 0, {}, c7, c14, 1",
                in(reg) addr,
                options(nostack, preserves_flags),
            );
        }
    }

    fn complete(&mut self) {
        // ICIALLU, then BPIALL so no stale branch prediction points into
        // rewritten code.
        unsafe {
            core::arch::asm!(
                "dsb",
                "mcr p15, 0, {zero}, c7, c5, 0",
                "mcr p15, 0, {zero}, c7, c5, 6",
                "dsb",
                "isb",
                zero = in(reg) 0u32,
                options(nostack, preserves_flags),
            );
        }
    }

    fn synchronize(&mut self) {
        unsafe {
            core::arch::asm!("dsb", "isb", options(nostack, preserves_flags));
        }
    }
}

// Lets `cargo check --workspace` run on the host; never executed there.
#[cfg(not(target_arch = "arm"))]
impl CacheMaintenance for Cp15Cache {
    fn clean_invalidate_line(&mut self, _addr: u32) {}

    fn complete(&mut self) {
        core::sync::atomic::fence(core::sync::atomic::Ordering::SeqCst);
    }

    fn synchronize(&mut self) {
        core::sync::atomic::fence(core::sync::atomic::Ordering::SeqCst);
    }
}

#[no_mangle]
#[link_section = ".text.start"]
pub extern "C" fn main() -> ! {
    // SAFETY: the payload runs with the MMU off (or identity mapped) on the
    // preloader's own core, with interrupts masked by the boot ROM transport.
    let mem = unsafe { VolatileMemory::new() };
    // SAFETY: UART0 is initialised by the preloader before it accepts a
    // download.
    let uart = unsafe { MmioUart::new(PLATFORM.uart_base) };

    let mut sequencer = Sequencer::new(PLATFORM, mem, Cp15Cache, Console::new(uart));
    match sequencer.run() {
        // SAFETY: `run` only returns a handoff for a located handler, after
        // every patch was invalidated and the final barrier was issued.
        Ok(boot) => unsafe { boot.handoff.enter() },
        Err(_) => loop {},
    }
}

#[panic_handler]
fn panic(_info: &PanicInfo) -> ! {
    // SAFETY: same UART as `main`; nothing else touches it once we panic.
    let mut console = Console::new(unsafe { MmioUart::new(PLATFORM.uart_base) });
    let _ = writeln!(console, "Panic :(");
    loop {}
}
