// DLPatch - Preloader Download Handler Patcher
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

//! The fixed patch sequence run against the preloader's `usbdl_handler`.
//!
//! ```text
//! locate usbdl_handler --(not found)--> halt
//!        |
//!     send_da -> jump_da -> sec_region_check -> jump to usbdl_handler
//! ```
//!
//! The three stages are independent and best effort: a stage whose signature
//! is missing is reported and skipped. Their order is fixed because later
//! scans cover code that earlier stages may have rewritten.

use core::fmt;

use crate::cache::{CacheMaintenance, CoherenceManager};
use crate::patcher::{PatchOp, PatchRecord, Patcher};
use crate::platform::Platform;
use crate::scanner::search;
use crate::thumb::{self, Instruction};
use crate::{CodeMemory, PatchError, PatchResult};

/// Halfword signatures. None of them contain wildcards.
pub mod signatures {
    /// `push.w {r4-r7, r9-r11, lr}; mov r6, r1`: entry of `usbdl_handler`.
    pub const USBDL_HANDLER: &[u16] = &[0xE92D, 0x4EF0, 0x460E];

    /// `mov r3, r0`, right after the download length is stored in `send_da`.
    pub const SEND_DA: &[u16] = &[0x4603];

    /// `movs r6, #0; mov r0, r6`, ahead of the boot argument setup in `jump_da`.
    pub const JUMP_DA: &[u16] = &[0x2600, 0x4630];

    /// `push {r0-r2, r4, r5, lr}; mov r4, r0; mov r5, r1`: `sec_region_check`.
    pub const SEC_REGION_CHECK: &[u16] = &[0xB537, 0x4604, 0x460D];
}

// Up to two 32-bit instructions sit between the length store and `mov r3, r0`.
const SEND_DA_SKIP: u32 = 8;

const JUMP_DA_LDR_OFFSET: u32 = 40;
const JUMP_DA_FILL_HINT_OFFSET: u32 = 6;
// Builds that also copy the boot argument over the downloaded agent carry
// six more halfwords of setup.
const JUMP_DA_LONG_FILL: usize = 13;
const JUMP_DA_SHORT_FILL: usize = 7;

// Addresses derived from a match may run past the top of the address space.
fn offset(addr: u32, by: u32) -> PatchResult<u32> {
    addr.checked_add(by).ok_or(PatchError::MemoryViolation(addr))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "std", derive(serde::Serialize))]
#[cfg_attr(feature = "std", serde(rename_all = "snake_case"))]
pub enum Stage {
    SendDa,
    JumpDa,
    SecRegionCheck,
}

impl Stage {
    pub const ALL: [Stage; 3] = [Stage::SendDa, Stage::JumpDa, Stage::SecRegionCheck];

    pub fn name(self) -> &'static str {
        match self {
            Stage::SendDa => "send_da",
            Stage::JumpDa => "jump_da",
            Stage::SecRegionCheck => "sec_region_check",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// What one stage found and wrote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "std", derive(serde::Serialize))]
pub struct StageOutcome {
    pub stage: Stage,
    /// Address where the stage signature matched.
    pub found_at: Option<u32>,
    /// Writes made by the stage, in order.
    pub patches: [Option<PatchRecord>; 2],
    pub patched: bool,
}

impl StageOutcome {
    pub fn not_patched(stage: Stage) -> Self {
        Self {
            stage,
            found_at: None,
            patches: [None; 2],
            patched: false,
        }
    }

    pub fn is_patched(&self) -> bool {
        self.patched
    }

    pub fn records(&self) -> impl Iterator<Item = &PatchRecord> {
        self.patches.iter().flatten()
    }

    fn push(&mut self, record: PatchRecord) {
        if let Some(slot) = self.patches.iter_mut().find(|slot| slot.is_none()) {
            *slot = Some(record);
        }
    }
}

/// Per-stage outcomes, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "std", derive(serde::Serialize))]
pub struct PatchReport {
    pub stages: [StageOutcome; 3],
}

impl PatchReport {
    pub fn get(&self, stage: Stage) -> &StageOutcome {
        // `stages` is built from `Stage::ALL`, one entry per variant.
        &self.stages[stage as usize]
    }

    pub fn patched_count(&self) -> usize {
        self.stages.iter().filter(|s| s.is_patched()).count()
    }
}

/// Transfer of control back into `usbdl_handler`.
///
/// The handler is Thumb code taking `(u32, u32)` and never returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "std", derive(serde::Serialize))]
pub struct Handoff {
    pub entry: u32,
    pub arg0: u32,
    pub arg1: u32,
}

impl Handoff {
    /// Interworking bit: branch targets with bit 0 set execute as Thumb.
    pub const THUMB_BIT: u32 = 1;

    pub fn target(&self) -> u32 {
        self.entry | Self::THUMB_BIT
    }

    /// Calls the handler. Control does not come back.
    ///
    /// # Safety
    ///
    /// `target()` must be executable Thumb code following the AAPCS
    /// `(u32, u32)` convention, and every patch must already have been made
    /// visible to instruction fetch.
    pub unsafe fn enter(&self) -> ! {
        let handler: extern "C" fn(u32, u32) = core::mem::transmute(self.target() as usize);
        handler(self.arg0, self.arg1);

        loop {
            core::hint::spin_loop();
        }
    }
}

/// Result of a complete run: where to go next and what was patched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "std", derive(serde::Serialize))]
pub struct Boot {
    pub handoff: Handoff,
    pub report: PatchReport,
}

pub struct Sequencer<M, C, W> {
    platform: Platform,
    mem: M,
    coherence: CoherenceManager<C>,
    console: W,
}

impl<M, C, W> Sequencer<M, C, W>
where
    M: CodeMemory,
    C: CacheMaintenance,
    W: fmt::Write,
{
    pub fn new(platform: Platform, mem: M, cache: C, console: W) -> Self {
        Self {
            platform,
            mem,
            coherence: CoherenceManager::with_line_size(cache, platform.cache_line),
            console,
        }
    }

    /// Runs every stage and prepares the handoff.
    ///
    /// `Err` only when `usbdl_handler` cannot be located (or its memory
    /// cannot be read); the caller must then halt.
    pub fn run(&mut self) -> PatchResult<Boot> {
        self.say(format_args!(""));

        let handler = match self.locate_handler() {
            Ok(handler) => handler,
            Err(e) => {
                self.say(format_args!("usbdl_handler not found :("));
                trace_error!("Cannot continue: {}", e);
                return Err(e);
            }
        };
        self.say(format_args!("usbdl_handler found at {:#x}", handler));

        let report = PatchReport {
            stages: [
                self.patch_guard_check(handler),
                self.patch_boot_argument(),
                self.patch_region_check(handler),
            ],
        };

        let handoff = self.prepare_handoff(handler)?;
        Ok(Boot { handoff, report })
    }

    pub fn locate_handler(&mut self) -> PatchResult<u32> {
        let Platform {
            code_base,
            code_end,
            ..
        } = self.platform;
        search(&self.mem, code_base, code_end, signatures::USBDL_HANDLER)?
            .ok_or(PatchError::HandlerNotFound)
    }

    /// `send_da`: turn the store of the trusted download length into a load,
    /// so the length check reads a caller-controlled stack slot instead.
    pub fn patch_guard_check(&mut self, handler: u32) -> StageOutcome {
        self.stage(Stage::SendDa, |seq, outcome| {
            let window_end = seq.platform.handler_window_end(handler);
            let Some(anchor) = search(&seq.mem, handler, window_end, signatures::SEND_DA)? else {
                return Ok(());
            };
            outcome.found_at = Some(anchor);

            let Some(store) = seq.find_store_before(handler, anchor)? else {
                trace_warn!("No SP-relative store between {:#x} and {:#x}", handler, anchor);
                return Ok(());
            };

            outcome.push(seq.patcher().apply(store, PatchOp::FlipStoreToLoad)?);
            outcome.patched = true;
            Ok(())
        })
    }

    /// `jump_da`: drop the boot argument setup and point the literal it
    /// loaded at the downloaded-agent boot flag.
    pub fn patch_boot_argument(&mut self) -> StageOutcome {
        self.stage(Stage::JumpDa, |seq, outcome| {
            let Platform {
                code_base,
                code_end,
                boot_flag,
                ..
            } = seq.platform;
            let Some(anchor) = search(&seq.mem, code_base, code_end, signatures::JUMP_DA)? else {
                return Ok(());
            };
            outcome.found_at = Some(anchor);

            let ldr = offset(anchor, JUMP_DA_LDR_OFFSET)?;
            let ldr_opcode = seq.mem.read_u16(ldr)?;
            if !matches!(thumb::decode(ldr_opcode), Instruction::LdrLit { .. }) {
                trace_warn!("Expected a literal load at {:#x}, found {:#06x}", ldr, ldr_opcode);
            }

            let fill_hint = seq.mem.read_u16(offset(ldr, JUMP_DA_FILL_HINT_OFFSET)?)?;
            let count = if thumb::is_movs_imm(fill_hint) {
                JUMP_DA_LONG_FILL
            } else {
                JUMP_DA_SHORT_FILL
            };
            outcome.push(seq.patcher().apply(offset(ldr, 2)?, PatchOp::Fill(count))?);

            let literal = offset(ldr, thumb::ldr_literal_offset(ldr_opcode) + 2)?;
            outcome.push(seq.patcher().write_word(literal, boot_flag)?);
            outcome.patched = true;
            Ok(())
        })
    }

    /// `sec_region_check`: make the bounds check always succeed.
    pub fn patch_region_check(&mut self, handler: u32) -> StageOutcome {
        self.stage(Stage::SecRegionCheck, |seq, outcome| {
            let code_end = seq.platform.code_end;
            let Some(addr) = search(&seq.mem, handler, code_end, signatures::SEC_REGION_CHECK)?
            else {
                return Ok(());
            };
            outcome.found_at = Some(addr);

            outcome.push(seq.patcher().apply(addr, PatchOp::ForceReturn(0))?);
            outcome.patched = true;
            Ok(())
        })
    }

    /// Last step before the jump: barrier, then read the handler arguments.
    pub fn prepare_handoff(&mut self, handler: u32) -> PatchResult<Handoff> {
        self.say(format_args!("Jumping back to usbdl_handler..."));
        self.coherence.synchronize();

        Ok(Handoff {
            entry: handler,
            arg0: self.mem.read_u32(self.platform.boot_arg_cell)?,
            arg1: self.platform.handler_arg,
        })
    }

    pub fn platform(&self) -> &Platform {
        &self.platform
    }

    pub fn memory(&self) -> &M {
        &self.mem
    }

    pub fn cache(&self) -> &C {
        self.coherence.cache()
    }

    pub fn console(&self) -> &W {
        &self.console
    }

    pub fn into_parts(self) -> (M, C, W) {
        (self.mem, self.coherence.into_inner(), self.console)
    }

    fn patcher(&mut self) -> Patcher<'_, M, C> {
        Patcher::new(&mut self.mem, &mut self.coherence)
    }

    /// Walks back from `anchor - SEND_DA_SKIP` to the closest
    /// `str rt, [sp, #imm]`, never below `floor`.
    fn find_store_before(&self, floor: u32, anchor: u32) -> PatchResult<Option<u32>> {
        let mut addr = anchor.saturating_sub(SEND_DA_SKIP);
        while addr >= floor.saturating_add(2) {
            addr -= 2;
            if thumb::is_str_sp_rel(self.mem.read_u16(addr)?) {
                return Ok(Some(addr));
            }
        }
        Ok(None)
    }

    fn stage<F>(&mut self, stage: Stage, body: F) -> StageOutcome
    where
        F: FnOnce(&mut Self, &mut StageOutcome) -> PatchResult<()>,
    {
        let mut outcome = StageOutcome::not_patched(stage);
        if let Err(e) = body(self, &mut outcome) {
            trace_warn!("{} aborted: {}", stage, e);
            outcome.patched = false;
        }

        if outcome.patched {
            trace_info!("{} is patched", stage);
            self.say(format_args!("{} is patched", stage));
        } else {
            trace_warn!("{} is NOT patched", stage);
            self.say(format_args!("{} is NOT patched", stage));
        }
        outcome
    }

    /// Console output is best effort; a failing console must not stop the
    /// sequence.
    fn say(&mut self, args: fmt::Arguments<'_>) {
        let _ = self.console.write_fmt(args);
        let _ = self.console.write_char('\n');
    }
}
