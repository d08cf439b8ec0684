use super::MacroAssembler;
use crate::asm::{CodeBuffer, FixupKind, Label};
use crate::error::{StubError, StubResult};
use crate::hierarchy::{CidRange, ClassId};
use crate::linker::{Island, RelocKind};
use crate::object::InstanceHeader;
use crate::slow_path::ThreadSlots;
use crate::types::RawType;

const RAX: u8 = 0;
const RCX: u8 = 1;
const RDX: u8 = 2;
const RDI: u8 = 7;
const R8: u8 = 8;
const R9: u8 = 9;
const R10: u8 = 10;
const R11: u8 = 11;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CallConv {
    SysV,
    Win64,
}

impl CallConv {
    pub fn host() -> Self {
        if cfg!(target_os = "windows") {
            CallConv::Win64
        } else {
            CallConv::SysV
        }
    }

    fn instance_reg(self) -> u8 {
        match self {
            CallConv::SysV => RDI,
            CallConv::Win64 => RCX,
        }
    }

    fn slots_reg(self) -> u8 {
        match self {
            CallConv::SysV => RDX,
            CallConv::Win64 => R8,
        }
    }

    /// Caller-saved registers that are not argument registers of the stub.
    fn subject_regs(self) -> &'static [u8] {
        match self {
            CallConv::SysV => &[R8, R9, R10, RCX],
            CallConv::Win64 => &[R9, R10],
        }
    }
}

#[derive(Clone, Copy)]
enum Cc {
    E = 0x4,
    Ne = 0x5,
    Be = 0x6,
    A = 0x7,
}

pub struct X64Assembler {
    buf: CodeBuffer,
    conv: CallConv,
}

impl X64Assembler {
    pub fn new(conv: CallConv) -> Self {
        Self {
            buf: CodeBuffer::new(),
            conv,
        }
    }

    pub fn finish(self) -> StubResult<Vec<u8>> {
        self.buf.finish()
    }

    fn subject(&self, depth: usize) -> StubResult<u8> {
        depth
            .checked_sub(1)
            .and_then(|index| self.conv.subject_regs().get(index))
            .copied()
            .ok_or_else(|| StubError::Emit(format!("no x86_64 subject register for depth {depth}")))
    }

    fn jcc(&mut self, cc: Cc, target: Label) {
        self.buf.emit_bytes(&[0x0F, 0x80 | cc as u8]);
        let at = self.buf.len();
        self.buf.emit_u32(0);
        self.buf.use_label(at, target, FixupKind::X64Rel32);
    }
}

impl MacroAssembler for X64Assembler {
    fn buffer(&mut self) -> &mut CodeBuffer {
        &mut self.buf
    }

    fn max_subject_depth(&self) -> usize {
        self.conv.subject_regs().len()
    }

    fn branch_if_null(&mut self, depth: usize, target: Label) -> StubResult<()> {
        if depth == 0 {
            emit_test_r64(&mut self.buf, self.conv.instance_reg());
            self.jcc(Cc::E, target);
        } else {
            let subject = self.subject(depth)?;
            emit_cmp_m8_zero(&mut self.buf, subject, RawType::NULLABLE_OFFSET);
            self.jcc(Cc::Ne, target);
        }
        Ok(())
    }

    fn branch_if_identical(
        &mut self,
        depth: usize,
        type_address: u64,
        target: Label,
    ) -> StubResult<()> {
        emit_mov_r64_imm64(&mut self.buf, R11, type_address);
        if depth == 0 {
            emit_cmp_r64_m64(
                &mut self.buf,
                R11,
                self.conv.instance_reg(),
                InstanceHeader::RUNTIME_TYPE_OFFSET,
            );
        } else {
            let subject = self.subject(depth)?;
            emit_cmp_r64_r64(&mut self.buf, subject, R11);
        }
        self.jcc(Cc::E, target);
        Ok(())
    }

    fn load_class_id(&mut self, depth: usize) -> StubResult<()> {
        if depth == 0 {
            emit_mov_r32_m32(
                &mut self.buf,
                RAX,
                self.conv.instance_reg(),
                InstanceHeader::CLASS_ID_OFFSET,
            );
        } else {
            let subject = self.subject(depth)?;
            emit_mov_r32_m32(&mut self.buf, RAX, subject, RawType::CLASS_ID_OFFSET);
        }
        Ok(())
    }

    fn branch_on_class_id(
        &mut self,
        id: ClassId,
        when_equal: bool,
        target: Label,
    ) -> StubResult<()> {
        emit_cmp_eax_imm32(&mut self.buf, id.0);
        self.jcc(if when_equal { Cc::E } else { Cc::Ne }, target);
        Ok(())
    }

    fn branch_on_class_range(
        &mut self,
        range: CidRange,
        when_inside: bool,
        target: Label,
    ) -> StubResult<()> {
        if range.lo.0 == 0 {
            emit_cmp_eax_imm32(&mut self.buf, range.hi.0);
        } else {
            let bias = i32::try_from(-i64::from(range.lo.0))
                .map_err(|_| StubError::Emit(format!("class id {} too large", range.lo.0)))?;
            emit_lea_r32(&mut self.buf, R11, RAX, bias);
            emit_cmp_r32_imm32(&mut self.buf, R11, range.span());
        }
        self.jcc(if when_inside { Cc::Be } else { Cc::A }, target);
        Ok(())
    }

    fn load_type_argument(&mut self, depth: usize, index: usize) -> StubResult<()> {
        let slot = i32::try_from(index * 8)
            .map_err(|_| StubError::Emit(format!("type argument index {index} too large")))?;
        let dst = self.subject(depth + 1)?;
        if depth == 0 {
            emit_mov_r64_m64(
                &mut self.buf,
                dst,
                self.conv.instance_reg(),
                InstanceHeader::RUNTIME_TYPE_OFFSET,
            );
            emit_mov_r64_m64(&mut self.buf, dst, dst, RawType::ARGS_OFFSET);
        } else {
            let src = self.subject(depth)?;
            emit_mov_r64_m64(&mut self.buf, dst, src, RawType::ARGS_OFFSET);
        }
        emit_mov_r64_m64(&mut self.buf, dst, dst, slot);
        Ok(())
    }

    fn jump(&mut self, target: Label) {
        self.buf.emit_u8(0xE9);
        let at = self.buf.len();
        self.buf.emit_u32(0);
        self.buf.use_label(at, target, FixupKind::X64Rel32);
    }

    fn return_accept(&mut self) {
        self.buf.emit_bytes(&[0xB8, 0x01, 0x00, 0x00, 0x00, 0xC3]); // mov eax, 1; ret
    }

    fn return_reject(&mut self) {
        self.buf.emit_bytes(&[0x31, 0xC0, 0xC3]); // xor eax, eax; ret
    }

    fn tail_jump_thread_slot(&mut self) -> StubResult<()> {
        emit_jmp_m64(
            &mut self.buf,
            self.conv.slots_reg(),
            ThreadSlots::SLOW_TYPE_TEST_ENTRY_OFFSET,
        );
        Ok(())
    }

    fn tail_jump_direct(&mut self) -> (usize, RelocKind) {
        self.buf.emit_u8(0xE9);
        let at = self.buf.len();
        self.buf.emit_u32(0);
        (at, RelocKind::X64Rel32)
    }

    fn emit_island(&mut self) -> Island {
        let start = self.buf.len();
        self.buf.emit_bytes(&[0xFF, 0x25, 0x00, 0x00, 0x00, 0x00]); // jmp [rip+0]
        let literal = self.buf.len();
        self.buf.emit_u64(0);
        Island { start, literal }
    }
}

fn rex(w: bool, reg: u8, base: u8) -> u8 {
    0x40 | (u8::from(w) << 3) | (((reg >> 3) & 1) << 2) | ((base >> 3) & 1)
}

fn emit_rex_opt(buf: &mut CodeBuffer, reg: u8, base: u8) {
    let prefix = rex(false, reg, base);
    if prefix != 0x40 {
        buf.emit_u8(prefix);
    }
}

fn emit_modrm_disp(buf: &mut CodeBuffer, reg: u8, base: u8, disp: i32) {
    let reg = (reg & 7) << 3;
    let rm = base & 7;
    let sib = rm == 4;
    if disp == 0 && rm != 5 {
        buf.emit_u8(reg | rm);
        if sib {
            buf.emit_u8(0x24);
        }
    } else if let Ok(disp8) = i8::try_from(disp) {
        buf.emit_u8(0x40 | reg | rm);
        if sib {
            buf.emit_u8(0x24);
        }
        buf.emit_u8(disp8 as u8);
    } else {
        buf.emit_u8(0x80 | reg | rm);
        if sib {
            buf.emit_u8(0x24);
        }
        buf.emit_i32(disp);
    }
}

fn emit_mov_r32_m32(buf: &mut CodeBuffer, dst: u8, base: u8, disp: i32) {
    emit_rex_opt(buf, dst, base);
    buf.emit_u8(0x8B);
    emit_modrm_disp(buf, dst, base, disp);
}

fn emit_mov_r64_m64(buf: &mut CodeBuffer, dst: u8, base: u8, disp: i32) {
    buf.emit_u8(rex(true, dst, base));
    buf.emit_u8(0x8B);
    emit_modrm_disp(buf, dst, base, disp);
}

fn emit_test_r64(buf: &mut CodeBuffer, reg: u8) {
    buf.emit_u8(rex(true, reg, reg));
    buf.emit_u8(0x85);
    buf.emit_u8(0xC0 | ((reg & 7) << 3) | (reg & 7));
}

fn emit_cmp_m8_zero(buf: &mut CodeBuffer, base: u8, disp: i32) {
    emit_rex_opt(buf, 0, base);
    buf.emit_u8(0x80);
    emit_modrm_disp(buf, 7, base, disp);
    buf.emit_u8(0x00);
}

fn emit_mov_r64_imm64(buf: &mut CodeBuffer, dst: u8, value: u64) {
    buf.emit_u8(rex(true, 0, dst));
    buf.emit_u8(0xB8 + (dst & 7));
    buf.emit_u64(value);
}

fn emit_cmp_r64_m64(buf: &mut CodeBuffer, reg: u8, base: u8, disp: i32) {
    buf.emit_u8(rex(true, reg, base));
    buf.emit_u8(0x3B);
    emit_modrm_disp(buf, reg, base, disp);
}

fn emit_cmp_r64_r64(buf: &mut CodeBuffer, lhs: u8, rhs: u8) {
    buf.emit_u8(rex(true, rhs, lhs));
    buf.emit_u8(0x39);
    buf.emit_u8(0xC0 | ((rhs & 7) << 3) | (lhs & 7));
}

fn emit_cmp_eax_imm32(buf: &mut CodeBuffer, imm: u32) {
    buf.emit_u8(0x3D);
    buf.emit_u32(imm);
}

fn emit_lea_r32(buf: &mut CodeBuffer, dst: u8, base: u8, disp: i32) {
    emit_rex_opt(buf, dst, base);
    buf.emit_u8(0x8D);
    emit_modrm_disp(buf, dst, base, disp);
}

fn emit_cmp_r32_imm32(buf: &mut CodeBuffer, reg: u8, imm: u32) {
    emit_rex_opt(buf, 0, reg);
    buf.emit_u8(0x81);
    buf.emit_u8(0xF8 | (reg & 7));
    buf.emit_u32(imm);
}

fn emit_jmp_m64(buf: &mut CodeBuffer, base: u8, disp: i32) {
    emit_rex_opt(buf, 0, base);
    buf.emit_u8(0xFF);
    emit_modrm_disp(buf, 4, base, disp);
}
