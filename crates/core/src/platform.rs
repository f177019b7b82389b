// DLPatch - Preloader Download Handler Patcher
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use crate::cache::DEFAULT_CACHE_LINE;

/// Fixed addresses and constants of one SoC/preloader family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "std", derive(serde::Serialize))]
pub struct Platform {
    /// First byte of the preloader image.
    pub code_base: u32,
    /// One past the last byte scanned.
    pub code_end: u32,
    /// Bytes after the handler entry searched for the `send_da` anchor.
    pub handler_window: u32,
    /// Cell holding the handler's first argument (the download COM port).
    pub boot_arg_cell: u32,
    /// Second argument passed to the handler.
    pub handler_arg: u32,
    /// Literal written into `jump_da` so it boots the downloaded agent.
    pub boot_flag: u32,
    /// UART0 register block used for the console.
    pub uart_base: u32,
    pub cache_line: u32,
}

impl Platform {
    pub const MT6572: Platform = Platform {
        code_base: 0x0200_7500,
        code_end: 0x0210_7500,
        handler_window: 0x200,
        boot_arg_cell: 0x0200_0828,
        handler_arg: 300,
        boot_flag: 0x800D_0000,
        uart_base: 0x1100_5000,
        cache_line: DEFAULT_CACHE_LINE,
    };

    /// End of the `send_da` search window, clamped to the code region.
    pub fn handler_window_end(&self, handler: u32) -> u32 {
        handler
            .saturating_add(self.handler_window)
            .min(self.code_end)
    }
}

impl Default for Platform {
    fn default() -> Self {
        Self::MT6572
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_mt6572() {
        let p = Platform::default();
        assert_eq!(p, Platform::MT6572);
        assert_eq!(p.code_end - p.code_base, 0x10_0000);
        assert_eq!(p.cache_line, 32);
    }

    #[test]
    fn test_handler_window_is_clamped() {
        let p = Platform::MT6572;
        assert_eq!(p.handler_window_end(0x0200_8000), 0x0200_8200);
        assert_eq!(p.handler_window_end(p.code_end - 0x10), p.code_end);
    }
}
