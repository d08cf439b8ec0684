use super::MacroAssembler;
use crate::asm::{CodeBuffer, FixupKind, Label};
use crate::error::{StubError, StubResult};
use crate::hierarchy::{CidRange, ClassId};
use crate::linker::{Island, RelocKind};
use crate::object::InstanceHeader;
use crate::slow_path::ThreadSlots;
use crate::types::RawType;

const INSTANCE_REG: u8 = 0;
const SLOTS_REG: u8 = 2;
const CID_REG: u8 = 9;
const TMP_REG: u8 = 10;
const BRANCH_REG: u8 = 16;
const TMP2_REG: u8 = 17;
const SUBJECT_REGS: [u8; 5] = [11, 12, 13, 14, 15];

const NOP: u32 = 0xD503201F;
const RET: u32 = 0xD65F03C0;

#[derive(Clone, Copy)]
enum Cond {
    Eq = 0,
    Ne = 1,
    Hi = 8,
    Ls = 9,
}

pub struct A64Assembler {
    buf: CodeBuffer,
}

impl Default for A64Assembler {
    fn default() -> Self {
        Self::new()
    }
}

impl A64Assembler {
    pub fn new() -> Self {
        Self {
            buf: CodeBuffer::new(),
        }
    }

    pub fn finish(self) -> StubResult<Vec<u8>> {
        self.buf.finish()
    }

    fn subject(&self, depth: usize) -> StubResult<u8> {
        depth
            .checked_sub(1)
            .and_then(|index| SUBJECT_REGS.get(index))
            .copied()
            .ok_or_else(|| StubError::Emit(format!("no aarch64 subject register for depth {depth}")))
    }

    fn b_cond(&mut self, cond: Cond, target: Label) {
        let at = self.buf.len();
        self.buf.emit_u32(0x54000000 | cond as u32);
        self.buf.use_label(at, target, FixupKind::A64Imm19);
    }
}

impl MacroAssembler for A64Assembler {
    fn buffer(&mut self) -> &mut CodeBuffer {
        &mut self.buf
    }

    fn max_subject_depth(&self) -> usize {
        SUBJECT_REGS.len()
    }

    fn branch_if_null(&mut self, depth: usize, target: Label) -> StubResult<()> {
        let at;
        if depth == 0 {
            at = self.buf.len();
            self.buf.emit_u32(0xB4000000 | INSTANCE_REG as u32); // cbz x0
        } else {
            let subject = self.subject(depth)?;
            emit_ldrb_imm12(&mut self.buf, TMP_REG, subject, RawType::NULLABLE_OFFSET)?;
            at = self.buf.len();
            self.buf.emit_u32(0x35000000 | TMP_REG as u32); // cbnz w10
        }
        self.buf.use_label(at, target, FixupKind::A64Imm19);
        Ok(())
    }

    fn branch_if_identical(
        &mut self,
        depth: usize,
        type_address: u64,
        target: Label,
    ) -> StubResult<()> {
        emit_mov_imm64(&mut self.buf, TMP_REG, type_address);
        if depth == 0 {
            emit_ldr_x_imm12(
                &mut self.buf,
                TMP2_REG,
                INSTANCE_REG,
                InstanceHeader::RUNTIME_TYPE_OFFSET,
            )?;
            emit_cmp_reg(&mut self.buf, TMP2_REG, TMP_REG);
        } else {
            let subject = self.subject(depth)?;
            emit_cmp_reg(&mut self.buf, subject, TMP_REG);
        }
        self.b_cond(Cond::Eq, target);
        Ok(())
    }

    fn load_class_id(&mut self, depth: usize) -> StubResult<()> {
        if depth == 0 {
            emit_ldr_w_imm12(
                &mut self.buf,
                CID_REG,
                INSTANCE_REG,
                InstanceHeader::CLASS_ID_OFFSET,
            )
        } else {
            let subject = self.subject(depth)?;
            emit_ldr_w_imm12(&mut self.buf, CID_REG, subject, RawType::CLASS_ID_OFFSET)
        }
    }

    fn branch_on_class_id(
        &mut self,
        id: ClassId,
        when_equal: bool,
        target: Label,
    ) -> StubResult<()> {
        emit_cmp_w_imm(&mut self.buf, CID_REG, id.0, TMP_REG);
        self.b_cond(if when_equal { Cond::Eq } else { Cond::Ne }, target);
        Ok(())
    }

    fn branch_on_class_range(
        &mut self,
        range: CidRange,
        when_inside: bool,
        target: Label,
    ) -> StubResult<()> {
        if range.lo.0 == 0 {
            emit_cmp_w_imm(&mut self.buf, CID_REG, range.hi.0, TMP_REG);
        } else {
            emit_sub_w_imm(&mut self.buf, TMP_REG, CID_REG, range.lo.0, TMP2_REG);
            emit_cmp_w_imm(&mut self.buf, TMP_REG, range.span(), TMP2_REG);
        }
        self.b_cond(if when_inside { Cond::Ls } else { Cond::Hi }, target);
        Ok(())
    }

    fn load_type_argument(&mut self, depth: usize, index: usize) -> StubResult<()> {
        let slot = i32::try_from(index * 8)
            .map_err(|_| StubError::Emit(format!("type argument index {index} too large")))?;
        let dst = self.subject(depth + 1)?;
        if depth == 0 {
            emit_ldr_x_imm12(
                &mut self.buf,
                dst,
                INSTANCE_REG,
                InstanceHeader::RUNTIME_TYPE_OFFSET,
            )?;
            emit_ldr_x_imm12(&mut self.buf, dst, dst, RawType::ARGS_OFFSET)?;
        } else {
            let src = self.subject(depth)?;
            emit_ldr_x_imm12(&mut self.buf, dst, src, RawType::ARGS_OFFSET)?;
        }
        emit_ldr_x_imm12(&mut self.buf, dst, dst, slot)
    }

    fn jump(&mut self, target: Label) {
        let at = self.buf.len();
        self.buf.emit_u32(0x14000000);
        self.buf.use_label(at, target, FixupKind::A64Imm26);
    }

    fn return_accept(&mut self) {
        self.buf.emit_u32(0x52800020); // mov w0, #1
        self.buf.emit_u32(RET);
    }

    fn return_reject(&mut self) {
        self.buf.emit_u32(0x52800000); // mov w0, #0
        self.buf.emit_u32(RET);
    }

    fn tail_jump_thread_slot(&mut self) -> StubResult<()> {
        emit_ldr_x_imm12(
            &mut self.buf,
            BRANCH_REG,
            SLOTS_REG,
            ThreadSlots::SLOW_TYPE_TEST_ENTRY_OFFSET,
        )?;
        self.buf.emit_u32(0xD61F0000 | ((BRANCH_REG as u32) << 5)); // br x16
        Ok(())
    }

    fn tail_jump_direct(&mut self) -> (usize, RelocKind) {
        let at = self.buf.len();
        self.buf.emit_u32(0x14000000);
        (at, RelocKind::A64Branch26)
    }

    fn emit_island(&mut self) -> Island {
        self.buf.align_with(8, &NOP.to_le_bytes());
        let start = self.buf.len();
        self.buf.emit_u32(0x58000000 | (2 << 5) | BRANCH_REG as u32); // ldr x16, #8
        self.buf.emit_u32(0xD61F0000 | ((BRANCH_REG as u32) << 5));
        let literal = self.buf.len();
        self.buf.emit_u64(0);
        Island { start, literal }
    }
}

fn encode_imm12_scaled(offset: i32, scale: i32, label: &str) -> StubResult<u32> {
    if offset < 0 {
        return Err(StubError::Emit(format!(
            "{label} negative offset {offset} unsupported"
        )));
    }
    let unit = 1_i32 << scale;
    if offset % unit != 0 {
        return Err(StubError::Emit(format!(
            "{label} offset {offset} misaligned for scale {unit}"
        )));
    }
    let imm = offset / unit;
    if imm > 4095 {
        return Err(StubError::Emit(format!(
            "{label} offset {offset} exceeds immediate range"
        )));
    }
    Ok((imm as u32) << 10)
}

fn emit_ldr_x_imm12(buf: &mut CodeBuffer, rt: u8, rn: u8, offset: i32) -> StubResult<()> {
    let insn = 0xF9400000_u32
        | encode_imm12_scaled(offset, 3, "ldr x")?
        | ((rn as u32) << 5)
        | (rt as u32);
    buf.emit_u32(insn);
    Ok(())
}

fn emit_ldr_w_imm12(buf: &mut CodeBuffer, rt: u8, rn: u8, offset: i32) -> StubResult<()> {
    let insn = 0xB9400000_u32
        | encode_imm12_scaled(offset, 2, "ldr w")?
        | ((rn as u32) << 5)
        | (rt as u32);
    buf.emit_u32(insn);
    Ok(())
}

fn emit_ldrb_imm12(buf: &mut CodeBuffer, rt: u8, rn: u8, offset: i32) -> StubResult<()> {
    let insn = 0x39400000_u32
        | encode_imm12_scaled(offset, 0, "ldrb")?
        | ((rn as u32) << 5)
        | (rt as u32);
    buf.emit_u32(insn);
    Ok(())
}

fn emit_mov_imm64(buf: &mut CodeBuffer, dst: u8, value: u64) {
    let parts = [
        (value & 0xFFFF) as u16,
        ((value >> 16) & 0xFFFF) as u16,
        ((value >> 32) & 0xFFFF) as u16,
        ((value >> 48) & 0xFFFF) as u16,
    ];
    let Some(first) = parts.iter().position(|part| *part != 0) else {
        buf.emit_u32(0xD2800000_u32 | (dst as u32));
        return;
    };
    buf.emit_u32(
        0xD2800000_u32 | ((first as u32) << 21) | ((parts[first] as u32) << 5) | (dst as u32),
    );
    for (i, part) in parts.iter().enumerate().skip(first + 1) {
        if *part == 0 {
            continue;
        }
        buf.emit_u32(0xF2800000_u32 | ((i as u32) << 21) | ((*part as u32) << 5) | (dst as u32));
    }
}

fn emit_mov_w_imm32(buf: &mut CodeBuffer, dst: u8, value: u32) {
    let low = value & 0xFFFF;
    let high = value >> 16;
    buf.emit_u32(0x52800000_u32 | (low << 5) | (dst as u32)); // movz
    if high != 0 {
        buf.emit_u32(0x72A00000_u32 | (high << 5) | (dst as u32)); // movk lsl 16
    }
}

fn emit_cmp_reg(buf: &mut CodeBuffer, lhs: u8, rhs: u8) {
    buf.emit_u32(0xEB00001F_u32 | ((rhs as u32) << 16) | ((lhs as u32) << 5));
}

fn emit_cmp_w_imm(buf: &mut CodeBuffer, lhs: u8, imm: u32, scratch: u8) {
    if imm <= 4095 {
        buf.emit_u32(0x7100001F_u32 | (imm << 10) | ((lhs as u32) << 5));
    } else {
        emit_mov_w_imm32(buf, scratch, imm);
        buf.emit_u32(0x6B00001F_u32 | ((scratch as u32) << 16) | ((lhs as u32) << 5));
    }
}

fn emit_sub_w_imm(buf: &mut CodeBuffer, dst: u8, src: u8, imm: u32, scratch: u8) {
    if imm <= 4095 {
        buf.emit_u32(0x51000000_u32 | (imm << 10) | ((src as u32) << 5) | (dst as u32));
    } else {
        emit_mov_w_imm32(buf, scratch, imm);
        buf.emit_u32(
            0x4B000000_u32 | ((scratch as u32) << 16) | ((src as u32) << 5) | (dst as u32),
        );
    }
}
