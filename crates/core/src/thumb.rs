// DLPatch - Preloader Download Handler Patcher
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

//! Thumb-2 encodings the patch stages read and write.
//!
//! Only the 16-bit families that appear around the patch sites are decoded.
//! Everything else is reported as [`Instruction::Unknown`] or, for the first
//! halfword of a 32-bit encoding, [`Instruction::Wide`].

/// `nop` (T1)
pub const NOP: u16 = 0xBF00;

/// `bx lr`
pub const BX_LR: u16 = 0x4770;

/// The L bit of `1001 Lttt iiii iiii`. Set: `ldr rt, [sp, #imm]`, clear: `str`.
pub const STR_TO_LDR_BIT: u16 = 1 << 11;

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Instruction {
    Nop,
    MovImm {
        rd: u8,
        imm: u8,
    }, // MOVS Rd, #imm8
    CmpImm {
        rn: u8,
        imm: u8,
    }, // CMP Rn, #imm8
    AddImm8 {
        rd: u8,
        imm: u8,
    }, // ADDS Rd, #imm8
    SubImm8 {
        rd: u8,
        imm: u8,
    }, // SUBS Rd, #imm8
    MovReg {
        rd: u8,
        rm: u8,
    }, // MOV Rd, Rm
    Bx {
        rm: u8,
    }, // BX Rm
    LdrLit {
        rt: u8,
        imm: u16,
    }, // LDR Rt, [PC, #imm]
    StrSp {
        rt: u8,
        imm: u16,
    }, // STR Rt, [SP, #imm]
    LdrSp {
        rt: u8,
        imm: u16,
    }, // LDR Rt, [SP, #imm]
    Push {
        registers: u8,
        m: bool,
    }, // PUSH {Rlist, LR?}
    Pop {
        registers: u8,
        p: bool,
    }, // POP {Rlist, PC?}

    /// First halfword of a 32-bit encoding.
    Wide(u16),
    Unknown(u16),
}

/// Decodes a 16-bit Thumb instruction
pub fn decode(opcode: u16) -> Instruction {
    // Move/compare/add/subtract immediate (T1): 001o oddd iiii iiii
    if (opcode & 0xE000) == 0x2000 {
        let op = (opcode >> 11) & 0x3;
        let rd = ((opcode >> 8) & 0x7) as u8;
        let imm = (opcode & 0xFF) as u8;

        return match op {
            0 => Instruction::MovImm { rd, imm },
            1 => Instruction::CmpImm { rn: rd, imm },
            2 => Instruction::AddImm8 { rd, imm },
            _ => Instruction::SubImm8 { rd, imm },
        };
    }

    // Special data / branch exchange: 0100 01oo ...
    if (opcode & 0xFC00) == 0x4400 {
        match (opcode >> 8) & 0x3 {
            2 => {
                let d = ((opcode >> 7) & 0x1) << 3;
                let rd = (d | (opcode & 0x7)) as u8;
                let rm = ((opcode >> 3) & 0xF) as u8;
                return Instruction::MovReg { rd, rm };
            }
            3 if (opcode & 0x0080) == 0 => {
                let rm = ((opcode >> 3) & 0xF) as u8;
                return Instruction::Bx { rm };
            }
            _ => return Instruction::Unknown(opcode),
        }
    }

    // LDR literal (T1): 0100 1ttt iiii iiii
    if (opcode & 0xF800) == 0x4800 {
        let rt = ((opcode >> 8) & 0x7) as u8;
        return Instruction::LdrLit {
            rt,
            imm: (opcode & 0xFF) << 2,
        };
    }

    // SP-relative load/store (T1): 1001 Lttt iiii iiii
    if (opcode & 0xF000) == 0x9000 {
        let rt = ((opcode >> 8) & 0x7) as u8;
        let imm = (opcode & 0xFF) << 2;

        if (opcode & STR_TO_LDR_BIT) != 0 {
            return Instruction::LdrSp { rt, imm };
        }
        return Instruction::StrSp { rt, imm };
    }

    // PUSH: 1011 010M rrrr rrrr
    if (opcode & 0xFE00) == 0xB400 {
        return Instruction::Push {
            registers: (opcode & 0xFF) as u8,
            m: (opcode & 0x0100) != 0,
        };
    }

    // POP: 1011 110P rrrr rrrr
    if (opcode & 0xFE00) == 0xBC00 {
        return Instruction::Pop {
            registers: (opcode & 0xFF) as u8,
            p: (opcode & 0x0100) != 0,
        };
    }

    if opcode == NOP {
        return Instruction::Nop;
    }

    if is_wide(opcode) {
        return Instruction::Wide(opcode);
    }

    Instruction::Unknown(opcode)
}

/// 32-bit Thumb encodings start with 111 and bits [12:11] != 00.
pub fn is_wide(halfword: u16) -> bool {
    (halfword & 0xE000) == 0xE000 && (halfword & 0x1800) != 0
}

/// `movs rd, #imm8`
pub fn is_movs_imm(halfword: u16) -> bool {
    (halfword & 0xF800) == 0x2000
}

/// `str rt, [sp, #imm8 * 4]`
pub fn is_str_sp_rel(halfword: u16) -> bool {
    (halfword & 0xF800) == 0x9000
}

/// Encodes `movs rd, #imm`. Only r0-r7 are encodable.
pub fn movs_imm(rd: u8, imm: u8) -> u16 {
    0x2000 | (((rd & 0x7) as u16) << 8) | imm as u16
}

/// Byte offset embedded in an `ldr rt, [pc, #imm]` encoding.
pub fn ldr_literal_offset(halfword: u16) -> u32 {
    (halfword & 0xFF) as u32 * 4
}

/// Reinterprets `str rt, [sp, #imm]` as `ldr rt, [sp, #imm]`.
///
/// Only bit 11 toggles, so applying it twice gives back the store. Register
/// and offset fields are left untouched. The caller must have checked the
/// halfword with [`is_str_sp_rel`].
pub fn str_sp_to_ldr_sp(halfword: u16) -> u16 {
    halfword ^ STR_TO_LDR_BIT
}
