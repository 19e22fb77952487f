//! Thin `iced-x86`-backed assembler for stub bytes whose encoding varies
//! with registers/operands (SPEC_FULL §1: "the published assembler is used
//! for anything whose encoding varies with registers/operands, hand-emission
//! is used for fixed control bytes").

use iced_x86::{Code, Encoder, Instruction, MemoryOperand, Register};

/// Encode one instruction at `ip`, returning its bytes.
pub fn encode_one(bitness: u32, ip: u64, instr: &Instruction) -> Vec<u8> {
    let mut encoder = Encoder::new(bitness);
    encoder
        .encode(instr, ip)
        .expect("fixed-shape stub instruction must always encode");
    encoder.take_buffer()
}

/// `push reg` (64-bit GPR).
pub fn push_reg(reg: Register) -> Instruction {
    Instruction::with1(Code::Push_r64, reg).expect("push encodes")
}

/// `pop reg` (64-bit GPR).
pub fn pop_reg(reg: Register) -> Instruction {
    Instruction::with1(Code::Pop_r64, reg).expect("pop encodes")
}

/// `mov reg, imm64`.
pub fn mov_reg_imm64(reg: Register, imm: u64) -> Instruction {
    Instruction::with2(Code::Mov_r64_imm64, reg, imm).expect("mov r64, imm64 encodes")
}

/// `mov dst, src` (both 64-bit GPRs).
pub fn mov_reg_reg(dst: Register, src: Register) -> Instruction {
    Instruction::with2(Code::Mov_r64_rm64, dst, src).expect("mov r64, r64 encodes")
}

/// `cmp reg, imm32` (sign-extended).
pub fn cmp_reg_imm32(reg: Register, imm: i32) -> Instruction {
    Instruction::with2(Code::Cmp_rm64_imm32, reg, imm).expect("cmp r64, imm32 encodes")
}

/// `cmp dst, src`.
pub fn cmp_reg_reg(dst: Register, src: Register) -> Instruction {
    Instruction::with2(Code::Cmp_rm64_r64, dst, src).expect("cmp r64, r64 encodes")
}

/// `add reg, imm32` (used for the engine stack-delta bookkeeping, §4.2).
pub fn add_reg_imm32(reg: Register, imm: i32) -> Instruction {
    Instruction::with2(Code::Add_rm64_imm32, reg, imm).expect("add r64, imm32 encodes")
}

/// `sub reg, imm32`.
pub fn sub_reg_imm32(reg: Register, imm: i32) -> Instruction {
    Instruction::with2(Code::Sub_rm64_imm32, reg, imm).expect("sub r64, imm32 encodes")
}

/// `pushfq`.
pub fn pushfq() -> Instruction {
    Instruction::with(Code::Pushfq)
}

/// `popfq`.
pub fn popfq() -> Instruction {
    Instruction::with(Code::Popfq)
}

/// Unconditional near jump through a register (`jmp reg`), used to dispatch
/// through a resolved scratch-register target (§4.6 IC dispatch, entry-gate
/// landing).
pub fn jmp_reg(reg: Register) -> Instruction {
    Instruction::with1(Code::Jmp_rm64, reg).expect("jmp r64 encodes")
}

/// `call reg`.
pub fn call_reg(reg: Register) -> Instruction {
    Instruction::with1(Code::Call_rm64, reg).expect("call r64 encodes")
}

/// A direct near jump to an absolute 64-bit address. `iced-x86`'s
/// `with_branch` constructor takes the absolute target and the encoder
/// computes the `rel32` displacement against the instruction's own `ip`,
/// exactly as `BlockEncoder` does for relocated branches (§4.2).
pub fn jmp_rel32(target: u64) -> Instruction {
    Instruction::with_branch(Code::Jmp_rel32_64, target).expect("jmp rel32 encodes")
}

/// A direct near call to an absolute 64-bit address.
pub fn call_rel32(target: u64) -> Instruction {
    Instruction::with_branch(Code::Call_rel32_64, target).expect("call rel32 encodes")
}

/// Conditional near jump (`Jcc rel32`) for one of the 16 x86 condition
/// codes, addressed by `iced-x86`'s `Code` enum member for that `cc`.
pub fn jcc_rel32(code: Code, target: u64) -> Instruction {
    Instruction::with_branch(code, target).expect("jcc rel32 encodes")
}

/// The smallest displacement-size class (bytes) `mem` needs: 0 for a bare
/// `[base]`/`[base+index*scale]`, 1 if it fits `disp8`, 4 otherwise.
fn displ_size_for(displacement: i64) -> u32 {
    if displacement == 0 {
        0
    } else if i8::try_from(displacement).is_ok() {
        1
    } else {
        4
    }
}

/// `mov dst, [base + index*scale + displacement]` — a 64-bit load through an
/// arbitrary addressing mode, used to reconstruct an indirect branch's
/// original operand (§4.6 IC dispatch).
pub fn mov_reg_mem(dst: Register, base: Register, index: Register, scale: u32, displacement: i64) -> Instruction {
    let mem = MemoryOperand::new(base, index, scale, displacement, displ_size_for(displacement), false, Register::None);
    Instruction::with2(Code::Mov_r64_rm64, dst, mem).expect("mov r64, [mem] encodes")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_pop_round_trip_encodes() {
        let push = encode_one(64, 0x1000, &push_reg(Register::RAX));
        let pop = encode_one(64, 0x1000, &pop_reg(Register::RAX));
        assert!(!push.is_empty());
        assert!(!pop.is_empty());
        assert_ne!(push, pop);
    }

    #[test]
    fn jmp_rel32_targets_forward_address() {
        let bytes = encode_one(64, 0x1000, &jmp_rel32(0x2000));
        assert_eq!(bytes[0], 0xe9, "near jmp rel32 opcode");
    }
}
