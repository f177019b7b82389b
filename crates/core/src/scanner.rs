// DLPatch - Preloader Download Handler Patcher
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use crate::{CodeMemory, PatchResult};

/// Finds the lowest halfword-aligned address in `[start, end)` where
/// `pattern` occurs in full.
///
/// Candidates are `start, start + 2, ...` up to and including
/// `end - pattern.len() * 2`, so a match never extends past `end`. An empty
/// pattern or a range shorter than the pattern never matches.
pub fn search<M: CodeMemory + ?Sized>(
    mem: &M,
    start: u32,
    end: u32,
    pattern: &[u16],
) -> PatchResult<Option<u32>> {
    let Some((&first, rest)) = pattern.split_first() else {
        return Ok(None);
    };
    let span = match u32::try_from(pattern.len()) {
        Ok(n) => n.saturating_mul(2),
        Err(_) => return Ok(None),
    };
    let last = match end.checked_sub(span) {
        Some(last) if last >= start => last,
        _ => return Ok(None),
    };

    let mut offset = start;
    loop {
        if mem.read_u16(offset)? == first && matches_at(mem, offset + 2, rest)? {
            trace_debug!("Pattern {:04x?} found at {:#x}", pattern, offset);
            return Ok(Some(offset));
        }

        offset = match offset.checked_add(2) {
            Some(next) if next <= last => next,
            _ => break,
        };
    }

    trace_debug!(
        "Pattern {:04x?} not found in {:#x}..{:#x}",
        pattern,
        start,
        end
    );
    Ok(None)
}

fn matches_at<M: CodeMemory + ?Sized>(mem: &M, addr: u32, rest: &[u16]) -> PatchResult<bool> {
    let mut check_addr = addr;
    for &expected in rest {
        if mem.read_u16(check_addr)? != expected {
            return Ok(false);
        }
        check_addr += 2;
    }
    Ok(true)
}
