//! Byte-level code buffer shared by the backends.
//!
//! Branches inside one stub go through [`Label`]s and are patched when the
//! buffer is finished. Displacement helpers are also used by the linker for
//! cross-stub sites.

use crate::error::{StubError, StubResult};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Label(usize);

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FixupKind {
    /// x86-64 rel32 field; the displacement is taken from the end of the field.
    X64Rel32,
    /// AArch64 imm19 at bits 5..24 (`b.cond`, `cbz`, `cbnz`).
    A64Imm19,
    /// AArch64 imm26 (`b`, `bl`).
    A64Imm26,
}

#[derive(Clone, Debug)]
struct Fixup {
    at: usize,
    label: Label,
    kind: FixupKind,
}

#[derive(Default, Debug)]
pub struct CodeBuffer {
    code: Vec<u8>,
    labels: Vec<Option<usize>>,
    fixups: Vec<Fixup>,
}

impl CodeBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.code
    }

    pub fn emit_u8(&mut self, byte: u8) {
        self.code.push(byte);
    }

    pub fn emit_bytes(&mut self, bytes: &[u8]) {
        self.code.extend_from_slice(bytes);
    }

    pub fn emit_u32(&mut self, value: u32) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    pub fn emit_i32(&mut self, value: i32) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    pub fn emit_u64(&mut self, value: u64) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    /// Pads with copies of `filler` until the length is a multiple of `align`.
    pub fn align_with(&mut self, align: usize, filler: &[u8]) {
        while self.code.len() % align != 0 {
            let remaining = align - self.code.len() % align;
            let take = remaining.min(filler.len());
            self.code.extend_from_slice(&filler[..take]);
        }
    }

    pub fn new_label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    pub fn bind(&mut self, label: Label) -> StubResult<()> {
        let slot = self
            .labels
            .get_mut(label.0)
            .ok_or_else(|| StubError::Emit(format!("unknown label {}", label.0)))?;
        if slot.is_some() {
            return Err(StubError::Emit(format!("label {} bound twice", label.0)));
        }
        *slot = Some(self.code.len());
        Ok(())
    }

    pub fn is_bound(&self, label: Label) -> bool {
        self.labels.get(label.0).is_some_and(Option::is_some)
    }

    /// True when some branch targets `label`.
    pub fn is_referenced(&self, label: Label) -> bool {
        self.fixups.iter().any(|fixup| fixup.label == label)
    }

    /// Records that the branch field at `at` must reach `label`.
    pub fn use_label(&mut self, at: usize, label: Label, kind: FixupKind) {
        self.fixups.push(Fixup { at, label, kind });
    }

    /// Resolves every label reference and returns the bytes.
    pub fn finish(mut self) -> StubResult<Vec<u8>> {
        let fixups = std::mem::take(&mut self.fixups);
        for fixup in fixups {
            let target = self
                .labels
                .get(fixup.label.0)
                .copied()
                .flatten()
                .ok_or_else(|| StubError::Emit(format!("label {} never bound", fixup.label.0)))?;
            let target = target as i64;
            match fixup.kind {
                FixupKind::X64Rel32 => {
                    patch_rel32(&mut self.code, fixup.at, target - (fixup.at as i64 + 4))?
                }
                FixupKind::A64Imm19 => {
                    patch_imm19(&mut self.code, fixup.at, target - fixup.at as i64)?
                }
                FixupKind::A64Imm26 => {
                    patch_imm26(&mut self.code, fixup.at, target - fixup.at as i64)?
                }
            }
        }
        Ok(self.code)
    }
}

pub(crate) fn rel32_fits(displacement: i64) -> bool {
    i32::try_from(displacement).is_ok()
}

pub(crate) fn imm26_fits(displacement: i64) -> bool {
    displacement % 4 == 0 && (-(1 << 27)..(1 << 27)).contains(&displacement)
}

fn read_u32(code: &[u8], at: usize, what: &str) -> StubResult<u32> {
    let bytes = code
        .get(at..at + 4)
        .ok_or_else(|| StubError::Emit(format!("{what} patch offset {at} out of bounds")))?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

pub(crate) fn patch_rel32(code: &mut [u8], disp_offset: usize, displacement: i64) -> StubResult<()> {
    if disp_offset + 4 > code.len() {
        return Err(StubError::Emit(format!(
            "rel32 patch offset {disp_offset} out of bounds"
        )));
    }
    let rel = i32::try_from(displacement)
        .map_err(|_| StubError::Emit(format!("rel32 displacement {displacement} overflow")))?;
    code[disp_offset..disp_offset + 4].copy_from_slice(&rel.to_le_bytes());
    Ok(())
}

pub(crate) fn patch_imm19(code: &mut [u8], at: usize, displacement: i64) -> StubResult<()> {
    let original = read_u32(code, at, "imm19")?;
    if displacement % 4 != 0 {
        return Err(StubError::Emit(
            "imm19 branch displacement is unaligned".to_string(),
        ));
    }
    let imm19 = displacement / 4;
    if !(-(1 << 18)..(1 << 18)).contains(&imm19) {
        return Err(StubError::Emit(format!(
            "imm19 branch displacement {displacement} out of range"
        )));
    }
    let imm19 = (imm19 as i32 as u32) & 0x7FFFF;
    let insn = (original & !(0x7FFFF << 5)) | (imm19 << 5);
    code[at..at + 4].copy_from_slice(&insn.to_le_bytes());
    Ok(())
}

pub(crate) fn patch_imm26(code: &mut [u8], at: usize, displacement: i64) -> StubResult<()> {
    let original = read_u32(code, at, "imm26")?;
    if !imm26_fits(displacement) {
        return Err(StubError::Emit(format!(
            "imm26 branch displacement {displacement} out of range"
        )));
    }
    let imm26 = ((displacement / 4) as i32 as u32) & 0x03FF_FFFF;
    let insn = (original & 0xFC00_0000) | imm26;
    code[at..at + 4].copy_from_slice(&insn.to_le_bytes());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_rel32_label_is_patched_from_field_end() {
        let mut buf = CodeBuffer::new();
        let done = buf.new_label();
        buf.emit_u8(0xE9);
        let at = buf.len();
        buf.emit_u32(0);
        buf.use_label(at, done, FixupKind::X64Rel32);
        buf.emit_bytes(&[0x90, 0x90]);
        buf.bind(done).expect("bind");
        buf.emit_u8(0xC3);
        let code = buf.finish().expect("finish");
        assert_eq!(code, vec![0xE9, 2, 0, 0, 0, 0x90, 0x90, 0xC3]);
    }

    #[test]
    fn imm19_patch_keeps_condition_and_register_bits() {
        let mut buf = CodeBuffer::new();
        let back = buf.new_label();
        buf.bind(back).expect("bind");
        buf.emit_u32(0xD503201F);
        let at = buf.len();
        buf.emit_u32(0x54000001); // b.ne
        buf.use_label(at, back, FixupKind::A64Imm19);
        let code = buf.finish().expect("finish");
        let insn = u32::from_le_bytes([code[4], code[5], code[6], code[7]]);
        assert_eq!(insn & 0xF, 1);
        assert_eq!((insn >> 5) & 0x7FFFF, 0x7FFFF);
    }

    #[test]
    fn imm26_range_is_enforced() {
        let mut code = 0x14000000_u32.to_le_bytes().to_vec();
        patch_imm26(&mut code, 0, 8).expect("in range");
        assert_eq!(u32::from_le_bytes([code[0], code[1], code[2], code[3]]), 0x14000002);
        assert!(patch_imm26(&mut code, 0, 1 << 27).is_err());
        assert!(patch_imm26(&mut code, 0, 6).is_err());
        assert!(imm26_fits(-(1 << 27)));
    }

    #[test]
    fn unbound_label_fails_to_finish() {
        let mut buf = CodeBuffer::new();
        let never = buf.new_label();
        buf.emit_u32(0x14000000);
        buf.use_label(0, never, FixupKind::A64Imm26);
        assert!(buf.is_referenced(never));
        assert!(buf.finish().is_err());
    }

    #[test]
    fn double_bind_is_an_error() {
        let mut buf = CodeBuffer::new();
        let label = buf.new_label();
        buf.bind(label).expect("bind");
        assert!(buf.bind(label).is_err());
    }
}
