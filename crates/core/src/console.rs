// DLPatch - Preloader Download Handler Patcher
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use core::fmt;

/// Line status register offset from the UART base.
pub const UART_LSR: u32 = 0x14;
/// Transmit holding register offset from the UART base.
pub const UART_THR: u32 = 0x00;
/// LSR: transmit holding register empty.
pub const LSR_THRE: u32 = 0x20;

/// Transmit side of a serial peripheral.
pub trait SerialPort {
    fn tx_ready(&self) -> bool;
    fn write_byte(&mut self, byte: u8);
}

/// 16550-style UART as found on MediaTek SoCs.
#[derive(Debug)]
pub struct MmioUart {
    base: u32,
}

impl MmioUart {
    /// # Safety
    ///
    /// `base` must be the address of a mapped 16550-compatible register block.
    pub const unsafe fn new(base: u32) -> Self {
        Self { base }
    }
}

impl SerialPort for MmioUart {
    fn tx_ready(&self) -> bool {
        let lsr = (self.base + UART_LSR) as usize as *const u32;
        // SAFETY: the register block is mapped, see `MmioUart::new`.
        unsafe { core::ptr::read_volatile(lsr) & LSR_THRE != 0 }
    }

    fn write_byte(&mut self, byte: u8) {
        let thr = (self.base + UART_THR) as usize as *mut u32;
        // SAFETY: the register block is mapped, see `MmioUart::new`.
        unsafe { core::ptr::write_volatile(thr, byte as u32) };
    }
}

/// Blocking text console on top of a [`SerialPort`].
///
/// `\n` is sent as `\r\n`.
#[derive(Debug)]
pub struct Console<P> {
    port: P,
}

impl<P: SerialPort> Console<P> {
    pub fn new(port: P) -> Self {
        Self { port }
    }

    pub fn putc(&mut self, byte: u8) {
        while !self.port.tx_ready() {
            core::hint::spin_loop();
        }
        self.port.write_byte(byte);
    }

    pub fn port(&self) -> &P {
        &self.port
    }
}

impl<P: SerialPort> fmt::Write for Console<P> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for byte in s.bytes() {
            if byte == b'\n' {
                self.putc(b'\r');
            }
            self.putc(byte);
        }
        Ok(())
    }
}
