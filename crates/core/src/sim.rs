// DLPatch - Preloader Download Handler Patcher
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

//! Host-side stand-ins for the device: flat memory, a cache that records
//! maintenance operations, a captured UART and a tiny Thumb interpreter.

use crate::cache::CacheMaintenance;
use crate::console::SerialPort;
use crate::thumb::{self, Instruction};
use crate::{CodeMemory, PatchError, PatchResult};
use std::cell::Cell;
use std::sync::{Arc, Mutex};

/// Something that happened on the simulated bus or cache, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusEvent {
    Write { addr: u32, len: u32 },
    CleanLine(u32),
    Complete,
    Synchronize,
}

/// Shared, ordered log of [`BusEvent`]s.
#[derive(Debug, Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<BusEvent>>>);

impl Journal {
    pub fn record(&self, event: BusEvent) {
        if let Ok(mut guard) = self.0.lock() {
            guard.push(event);
        }
    }

    pub fn events(&self) -> Vec<BusEvent> {
        self.0.lock().map(|guard| guard.clone()).unwrap_or_default()
    }

    /// Writes that were not cleaned line by line before the next
    /// maintenance completion, as `(addr, len)`.
    pub fn uncovered_writes(&self, line: u32) -> Vec<(u32, u32)> {
        let mut uncovered = Vec::new();
        let mut pending: Vec<(usize, u32, u32)> = Vec::new();
        let mut cleaned: Vec<(usize, u32)> = Vec::new();

        for (idx, event) in self.events().into_iter().enumerate() {
            match event {
                BusEvent::Write { addr, len } => pending.push((idx, addr, len)),
                BusEvent::CleanLine(l) => cleaned.push((idx, l)),
                BusEvent::Complete => {
                    for (widx, addr, len) in pending.drain(..) {
                        if !lines_cleaned_after(&cleaned, widx, addr, len, line) {
                            uncovered.push((addr, len));
                        }
                    }
                    cleaned.clear();
                }
                BusEvent::Synchronize => {}
            }
        }

        uncovered.extend(pending.into_iter().map(|(_, addr, len)| (addr, len)));
        uncovered
    }
}

fn lines_cleaned_after(
    cleaned: &[(usize, u32)],
    widx: usize,
    addr: u32,
    len: u32,
    line: u32,
) -> bool {
    let end = addr + len;
    let mut l = addr & !(line - 1);
    while l < end {
        if !cleaned.iter().any(|&(cidx, c)| cidx > widx && c == l) {
            return false;
        }
        l += line;
    }
    true
}

/// A simple flat memory storage
#[derive(Debug, Clone)]
pub struct LinearMemory {
    pub data: Vec<u8>,
    pub base_addr: u32,
    journal: Option<Journal>,
}

impl LinearMemory {
    pub fn new(size: usize, base_addr: u32) -> Self {
        Self::from_bytes(base_addr, vec![0; size])
    }

    pub fn from_bytes(base_addr: u32, data: Vec<u8>) -> Self {
        Self {
            data,
            base_addr,
            journal: None,
        }
    }

    pub fn from_halfwords(base_addr: u32, words: &[u16]) -> Self {
        let data = words.iter().flat_map(|w| w.to_le_bytes()).collect();
        Self::from_bytes(base_addr, data)
    }

    pub fn with_journal(mut self, journal: Journal) -> Self {
        self.journal = Some(journal);
        self
    }

    /// One past the last mapped byte.
    pub fn end(&self) -> u32 {
        self.base_addr + self.data.len() as u32
    }

    pub fn contains(&self, addr: u32, len: u32) -> bool {
        addr >= self.base_addr
            && (addr as u64 + len as u64) <= self.base_addr as u64 + self.data.len() as u64
    }

    pub fn read_u8(&self, addr: u32) -> Option<u8> {
        if self.contains(addr, 1) {
            Some(self.data[(addr - self.base_addr) as usize])
        } else {
            None
        }
    }

    pub fn write_u8(&mut self, addr: u32, value: u8) -> bool {
        if self.contains(addr, 1) {
            self.data[(addr - self.base_addr) as usize] = value;
            true
        } else {
            false
        }
    }

    pub fn halfwords(&self, addr: u32, count: usize) -> Option<Vec<u16>> {
        (0..count as u32)
            .map(|i| self.read_u16(addr + i * 2).ok())
            .collect()
    }

    pub fn load(&mut self, addr: u32, bytes: &[u8]) -> bool {
        if !self.contains(addr, bytes.len() as u32) {
            return false;
        }
        let offset = (addr - self.base_addr) as usize;
        self.data[offset..offset + bytes.len()].copy_from_slice(bytes);
        true
    }

    pub fn load_halfwords(&mut self, addr: u32, words: &[u16]) -> bool {
        let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
        self.load(addr, &bytes)
    }

    fn check(&self, addr: u32, len: u32) -> PatchResult<usize> {
        if addr & 1 != 0 {
            return Err(PatchError::Misaligned(addr));
        }
        if !self.contains(addr, len) {
            return Err(PatchError::MemoryViolation(addr));
        }
        Ok((addr - self.base_addr) as usize)
    }
}

impl CodeMemory for LinearMemory {
    fn read_u16(&self, addr: u32) -> PatchResult<u16> {
        let offset = self.check(addr, 2)?;
        Ok(u16::from_le_bytes([self.data[offset], self.data[offset + 1]]))
    }

    fn write_u16(&mut self, addr: u32, value: u16) -> PatchResult<()> {
        let offset = self.check(addr, 2)?;
        self.data[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
        if let Some(journal) = &self.journal {
            journal.record(BusEvent::Write { addr, len: 2 });
        }
        Ok(())
    }
}

/// The preloader image plus the SRAM cell read at handoff.
#[derive(Debug, Clone)]
pub struct SimBus {
    pub code: LinearMemory,
    pub sram: LinearMemory,
}

impl SimBus {
    pub fn new(code: LinearMemory) -> Self {
        Self {
            code,
            sram: LinearMemory::new(0, 0),
        }
    }

    /// Maps a 4-byte cell at `addr` holding `value`.
    pub fn with_boot_arg(mut self, addr: u32, value: u32) -> Self {
        self.sram = LinearMemory::from_bytes(addr, value.to_le_bytes().to_vec());
        self
    }

    pub fn with_journal(mut self, journal: Journal) -> Self {
        self.code.journal = Some(journal.clone());
        self.sram.journal = Some(journal);
        self
    }

    fn region(&self, addr: u32) -> PatchResult<&LinearMemory> {
        if self.code.contains(addr, 2) {
            Ok(&self.code)
        } else if self.sram.contains(addr, 2) {
            Ok(&self.sram)
        } else {
            Err(PatchError::MemoryViolation(addr))
        }
    }

    fn region_mut(&mut self, addr: u32) -> PatchResult<&mut LinearMemory> {
        if self.code.contains(addr, 2) {
            Ok(&mut self.code)
        } else if self.sram.contains(addr, 2) {
            Ok(&mut self.sram)
        } else {
            Err(PatchError::MemoryViolation(addr))
        }
    }
}

impl CodeMemory for SimBus {
    fn read_u16(&self, addr: u32) -> PatchResult<u16> {
        self.region(addr)?.read_u16(addr)
    }

    fn write_u16(&mut self, addr: u32, value: u16) -> PatchResult<()> {
        self.region_mut(addr)?.write_u16(addr, value)
    }
}

/// Cache model that only records what it was asked to do.
#[derive(Debug, Clone, Default)]
pub struct RecordingCache {
    journal: Journal,
}

impl RecordingCache {
    pub fn with_journal(journal: Journal) -> Self {
        Self { journal }
    }

    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    pub fn lines(&self) -> Vec<u32> {
        self.journal
            .events()
            .into_iter()
            .filter_map(|e| match e {
                BusEvent::CleanLine(l) => Some(l),
                _ => None,
            })
            .collect()
    }

    pub fn completions(&self) -> usize {
        self.count(BusEvent::Complete)
    }

    pub fn synchronizations(&self) -> usize {
        self.count(BusEvent::Synchronize)
    }

    fn count(&self, wanted: BusEvent) -> usize {
        self.journal
            .events()
            .into_iter()
            .filter(|e| *e == wanted)
            .count()
    }
}

impl CacheMaintenance for RecordingCache {
    fn clean_invalidate_line(&mut self, addr: u32) {
        self.journal.record(BusEvent::CleanLine(addr));
    }

    fn complete(&mut self) {
        self.journal.record(BusEvent::Complete);
    }

    fn synchronize(&mut self) {
        self.journal.record(BusEvent::Synchronize);
    }
}

/// UART transmitter that captures bytes instead of driving a line.
#[derive(Debug, Default)]
pub struct SimUart {
    sink: Vec<u8>,
    busy_polls: Cell<usize>,
    status_polls: Cell<usize>,
}

impl SimUart {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reports "not ready" for the first `polls` status reads.
    pub fn with_busy_polls(polls: usize) -> Self {
        Self {
            busy_polls: Cell::new(polls),
            ..Self::default()
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.sink
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.sink).into_owned()
    }

    pub fn status_polls(&self) -> usize {
        self.status_polls.get()
    }
}

impl SerialPort for SimUart {
    fn tx_ready(&self) -> bool {
        self.status_polls.set(self.status_polls.get() + 1);
        let busy = self.busy_polls.get();
        if busy > 0 {
            self.busy_polls.set(busy - 1);
            return false;
        }
        true
    }

    fn write_byte(&mut self, byte: u8) {
        self.sink.push(byte);
    }
}

/// `lr` value that marks a return from [`call`].
const RETURN_SENTINEL: u32 = 0xFFFF_FFFE;

/// Calls the Thumb function at `target` and returns `r0`.
///
/// Only straight-line register moves are interpreted, which is enough to run
/// patched stubs; anything else is reported as unsupported.
pub fn call<M: CodeMemory + ?Sized>(
    mem: &M,
    target: u32,
    args: [u32; 2],
    max_steps: usize,
) -> PatchResult<u32> {
    let mut regs = [0u32; 16];
    regs[0] = args[0];
    regs[1] = args[1];
    regs[14] = RETURN_SENTINEL;
    let mut pc = target & !1;

    for _ in 0..max_steps {
        let opcode = mem.read_u16(pc)?;
        match thumb::decode(opcode) {
            Instruction::Nop => {}
            Instruction::MovImm { rd, imm } => regs[rd as usize] = imm as u32,
            Instruction::AddImm8 { rd, imm } => {
                regs[rd as usize] = regs[rd as usize].wrapping_add(imm as u32)
            }
            Instruction::SubImm8 { rd, imm } => {
                regs[rd as usize] = regs[rd as usize].wrapping_sub(imm as u32)
            }
            Instruction::MovReg { rd, rm } if rd != 15 && rm != 15 => {
                regs[rd as usize] = regs[rm as usize]
            }
            Instruction::Bx { rm } => {
                let dest = regs[rm as usize];
                if dest & !1 == RETURN_SENTINEL {
                    return Ok(regs[0]);
                }
                pc = dest & !1;
                continue;
            }
            _ => return Err(PatchError::UnsupportedInstruction { addr: pc, opcode }),
        }
        pc += 2;
    }

    Err(PatchError::StepLimit(pc))
}
