// DLPatch - Preloader Download Handler Patcher
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use crate::cache::{CacheMaintenance, CoherenceManager};
use crate::thumb;
use crate::{CodeMemory, PatchResult};

/// A single in-place modification of executable memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchOp<'a> {
    /// Write these halfwords verbatim.
    Overwrite(&'a [u16]),
    /// `movs r0, #value; bx lr`: the function returns `value` unconditionally.
    ForceReturn(u8),
    /// `count` consecutive `nop`s. Later code keeps its address.
    Fill(usize),
    /// Turn `str rt, [sp, #imm]` into `ldr rt, [sp, #imm]`.
    ///
    /// The halfword at the target address must already be known to belong to
    /// the SP-relative store family; this operation does not check it.
    FlipStoreToLoad,
}

impl PatchOp<'_> {
    /// Number of bytes the operation writes.
    pub fn len_bytes(&self) -> u32 {
        match self {
            PatchOp::Overwrite(halfwords) => halfwords.len() as u32 * 2,
            PatchOp::ForceReturn(_) => 4,
            PatchOp::Fill(count) => *count as u32 * 2,
            PatchOp::FlipStoreToLoad => 2,
        }
    }
}

/// Where a patch landed and how many bytes it covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "std", derive(serde::Serialize))]
pub struct PatchRecord {
    pub addr: u32,
    pub len: u32,
}

/// Applies [`PatchOp`]s and keeps the caches coherent after each one.
pub struct Patcher<'a, M: ?Sized, C> {
    mem: &'a mut M,
    coherence: &'a mut CoherenceManager<C>,
}

impl<'a, M, C> Patcher<'a, M, C>
where
    M: CodeMemory + ?Sized,
    C: CacheMaintenance,
{
    pub fn new(mem: &'a mut M, coherence: &'a mut CoherenceManager<C>) -> Self {
        Self { mem, coherence }
    }

    pub fn apply(&mut self, addr: u32, op: PatchOp<'_>) -> PatchResult<PatchRecord> {
        trace_debug!("Applying {:?} at {:#x} ({} bytes)", op, addr, op.len_bytes());
        match op {
            PatchOp::Overwrite(halfwords) => {
                self.write_halfwords(addr, halfwords.iter().copied())
            }
            PatchOp::ForceReturn(value) => {
                self.write_halfwords(addr, [thumb::movs_imm(0, value), thumb::BX_LR])
            }
            PatchOp::Fill(count) => {
                self.write_halfwords(addr, core::iter::repeat(thumb::NOP).take(count))
            }
            PatchOp::FlipStoreToLoad => {
                let original = self.mem.read_u16(addr)?;
                self.write_halfwords(addr, [thumb::str_sp_to_ldr_sp(original)])
            }
        }
    }

    /// Writes a 32-bit literal, e.g. a constant pool slot referenced by an
    /// `ldr rt, [pc, #imm]`.
    pub fn write_word(&mut self, addr: u32, value: u32) -> PatchResult<PatchRecord> {
        trace_debug!("Writing literal {:#010x} at {:#x}", value, addr);
        let result = self.mem.write_u32(addr, value);
        // The slot may share a line with code, and a partial write still has
        // to be made visible.
        self.coherence.invalidate(addr, 4);
        result.map(|()| PatchRecord { addr, len: 4 })
    }

    fn write_halfwords<I>(&mut self, addr: u32, halfwords: I) -> PatchResult<PatchRecord>
    where
        I: IntoIterator<Item = u16>,
    {
        let mut len = 0u32;
        for value in halfwords {
            if let Err(e) = self.mem.write_u16(addr.wrapping_add(len), value) {
                self.coherence.invalidate(addr, len);
                return Err(e);
            }
            len += 2;
        }

        self.coherence.invalidate(addr, len);
        Ok(PatchRecord { addr, len })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{call, BusEvent, Journal, LinearMemory, RecordingCache};
    use crate::thumb::{decode, Instruction};

    const BASE: u32 = 0x0200_0000;

    fn setup(words: &[u16]) -> (LinearMemory, CoherenceManager<RecordingCache>) {
        (
            LinearMemory::from_halfwords(BASE, words),
            CoherenceManager::new(RecordingCache::default()),
        )
    }

    #[test]
    fn test_overwrite() {
        let (mut mem, mut cm) = setup(&[0xFFFF; 8]);
        let record = Patcher::new(&mut mem, &mut cm)
            .apply(BASE + 4, PatchOp::Overwrite(&[0x1234, 0x5678]))
            .unwrap();

        assert_eq!(record, PatchRecord { addr: BASE + 4, len: 4 });
        assert_eq!(
            mem.halfwords(BASE, 8).unwrap(),
            vec![0xFFFF, 0xFFFF, 0x1234, 0x5678, 0xFFFF, 0xFFFF, 0xFFFF, 0xFFFF]
        );
        assert_eq!(cm.cache().lines(), vec![BASE]);
        assert_eq!(cm.cache().completions(), 1);
    }

    #[test]
    fn test_force_return_encoding() {
        for value in [0u8, 1, 0x7F, 0xFF] {
            let (mut mem, mut cm) = setup(&[0xB537, 0x4604, 0x460D, 0x0000]);
            Patcher::new(&mut mem, &mut cm)
                .apply(BASE, PatchOp::ForceReturn(value))
                .unwrap();

            let words = mem.halfwords(BASE, 4).unwrap();
            assert_eq!(words[0], 0x2000 | value as u16);
            assert_eq!(words[1], 0x4770);
            assert_eq!(words[2..], [0x460Du16, 0x0000]);
            assert_eq!(decode(words[0]), Instruction::MovImm { rd: 0, imm: value });
        }
    }

    #[test]
    fn test_force_return_executes() {
        for value in [0u8, 42, 255] {
            let (mut mem, mut cm) = setup(&[0xB537, 0x4604, 0x460D, 0xE92D]);
            Patcher::new(&mut mem, &mut cm)
                .apply(BASE, PatchOp::ForceReturn(value))
                .unwrap();

            // Arguments land in r0/r1 and must not leak into the result.
            let ret = call(&mem, BASE | 1, [0xDEAD_BEEF, 7], 16).unwrap();
            assert_eq!(ret, value as u32);
        }
    }

    #[test]
    fn test_fill_touches_exactly_count_halfwords() {
        let (mut mem, mut cm) = setup(&[0xAAAA; 16]);
        let record = Patcher::new(&mut mem, &mut cm)
            .apply(BASE + 6, PatchOp::Fill(7))
            .unwrap();

        assert_eq!(record.len, 14);
        let words = mem.halfwords(BASE, 16).unwrap();
        assert_eq!(words[..3], [0xAAAAu16; 3]);
        assert_eq!(words[3..10], [thumb::NOP; 7]);
        assert_eq!(words[10..], [0xAAAAu16; 6]);
    }

    #[test]
    fn test_fill_zero_writes_nothing() {
        let (mut mem, mut cm) = setup(&[0xAAAA; 4]);
        let record = Patcher::new(&mut mem, &mut cm)
            .apply(BASE, PatchOp::Fill(0))
            .unwrap();

        assert_eq!(record.len, 0);
        assert_eq!(mem.halfwords(BASE, 4).unwrap(), vec![0xAAAA; 4]);
    }

    #[test]
    fn test_flip_store_to_load() {
        let (mut mem, mut cm) = setup(&[0x9305, 0x4603]);
        Patcher::new(&mut mem, &mut cm)
            .apply(BASE, PatchOp::FlipStoreToLoad)
            .unwrap();

        let flipped = mem.read_u16(BASE).unwrap();
        assert_eq!(flipped, 0x9B05);
        assert_eq!((flipped ^ 0x9305).count_ones(), 1);
        assert_eq!(decode(flipped), Instruction::LdrSp { rt: 3, imm: 0x14 });
        assert_eq!(mem.read_u16(BASE + 2).unwrap(), 0x4603);
    }

    #[test]
    fn test_flip_only_toggles_load_bit() {
        // Clearing the bit again gives back the store; register and offset
        // fields never move.
        for store in [0x9000u16, 0x9123, 0x97FF] {
            let (mut mem, mut cm) = setup(&[store]);
            Patcher::new(&mut mem, &mut cm)
                .apply(BASE, PatchOp::FlipStoreToLoad)
                .unwrap();
            let load = mem.read_u16(BASE).unwrap();
            assert_eq!(load & 0x07FF, store & 0x07FF);
            assert_eq!(load & !thumb::STR_TO_LDR_BIT, store);
        }
    }

    #[test]
    fn test_flip_twice_restores_store() {
        let (mut mem, mut cm) = setup(&[0x9305]);
        let mut patcher = Patcher::new(&mut mem, &mut cm);
        patcher.apply(BASE, PatchOp::FlipStoreToLoad).unwrap();
        patcher.apply(BASE, PatchOp::FlipStoreToLoad).unwrap();

        assert_eq!(mem.read_u16(BASE).unwrap(), 0x9305);
        assert_eq!(cm.cache().completions(), 2);
    }

    #[test]
    fn test_write_word() {
        let (mut mem, mut cm) = setup(&[0; 8]);
        let record = Patcher::new(&mut mem, &mut cm)
            .write_word(BASE + 6, 0x800D_0000)
            .unwrap();

        assert_eq!(record, PatchRecord { addr: BASE + 6, len: 4 });
        assert_eq!(mem.read_u32(BASE + 6).unwrap(), 0x800D_0000);
        assert_eq!(mem.halfwords(BASE + 6, 2).unwrap(), vec![0x0000, 0x800D]);
        assert_eq!(cm.cache().completions(), 1);
    }

    #[test]
    fn test_every_write_is_invalidated() {
        let journal = Journal::default();
        let mut mem =
            LinearMemory::from_halfwords(BASE, &[0x9000; 64]).with_journal(journal.clone());
        let mut cm = CoherenceManager::new(RecordingCache::with_journal(journal.clone()));

        let mut patcher = Patcher::new(&mut mem, &mut cm);
        patcher.apply(BASE + 0x1E, PatchOp::Fill(13)).unwrap();
        patcher.apply(BASE + 0x40, PatchOp::ForceReturn(0)).unwrap();
        patcher.apply(BASE + 0x7E, PatchOp::FlipStoreToLoad).unwrap();
        patcher.write_word(BASE + 0x22, 0x800D_0000).unwrap();

        assert!(journal.uncovered_writes(32).is_empty());
        assert!(matches!(journal.events().last(), Some(BusEvent::Complete)));
    }

    #[test]
    fn test_failed_write_still_invalidates_written_part() {
        let journal = Journal::default();
        let mut mem = LinearMemory::from_halfwords(BASE, &[0; 4]).with_journal(journal.clone());
        let mut cm = CoherenceManager::new(RecordingCache::with_journal(journal.clone()));

        let result = Patcher::new(&mut mem, &mut cm).apply(BASE + 4, PatchOp::Fill(4));
        assert!(result.is_err());
        assert_eq!(mem.halfwords(BASE + 4, 2).unwrap(), vec![thumb::NOP; 2]);
        assert!(journal.uncovered_writes(32).is_empty());
    }
}
