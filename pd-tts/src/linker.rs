//! Deferred relocation of cross-stub jumps.
//!
//! Emission runs before any stub has an address. Backends record each site
//! that targets another code object; once every unit has been placed the
//! linker patches them all in one pass.

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::asm::{imm26_fits, patch_imm26, patch_rel32, rel32_fits};
use crate::error::{StubError, StubResult};
use crate::types::TypeId;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum SymbolicTarget {
    /// The shared slow-path stub.
    SlowPath,
    /// The stub of another type.
    Stub(TypeId),
}

impl std::fmt::Display for SymbolicTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SymbolicTarget::SlowPath => f.write_str("slow-path stub"),
            SymbolicTarget::Stub(id) => write!(f, "stub of type #{}", id.0),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RelocKind {
    /// rel32 field of `jmp`/`jcc`; `offset` is the field.
    X64Rel32,
    /// `b` instruction; `offset` is the instruction.
    A64Branch26,
}

/// Absolute-address jump appended to a unit. `literal` is the offset of its
/// 8-byte target slot.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Island {
    pub start: usize,
    pub literal: usize,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnresolvedCallSite {
    pub unit: usize,
    pub offset: usize,
    pub kind: RelocKind,
    pub island: Option<Island>,
    pub target: SymbolicTarget,
}

/// A placed, still writable code unit.
#[derive(Debug)]
pub struct LinkUnit {
    pub base: u64,
    pub code: Vec<u8>,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct LinkReport {
    pub patched: usize,
    pub trampolines: usize,
}

#[derive(Default, Debug)]
pub struct DeferredCallLinker {
    pending: Vec<UnresolvedCallSite>,
    defined: HashMap<SymbolicTarget, u64>,
}

impl DeferredCallLinker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, site: UnresolvedCallSite) {
        debug!(unit = site.unit, offset = site.offset, target = %site.target, "recorded call site");
        self.pending.push(site);
    }

    pub fn define(&mut self, target: SymbolicTarget, address: u64) {
        self.defined.insert(target, address);
    }

    pub fn address_of(&self, target: SymbolicTarget) -> Option<u64> {
        self.defined.get(&target).copied()
    }

    pub fn pending(&self) -> &[UnresolvedCallSite] {
        &self.pending
    }

    /// Patches every recorded site. Nothing is written unless every target is
    /// defined and every unit exists.
    pub fn resolve_all(&mut self, units: &mut [LinkUnit]) -> StubResult<LinkReport> {
        for site in &self.pending {
            if !self.defined.contains_key(&site.target) {
                return Err(StubError::UnresolvedTarget(site.target));
            }
            if site.unit >= units.len() {
                return Err(StubError::Link(format!(
                    "call site refers to missing unit {}",
                    site.unit
                )));
            }
        }

        let mut report = LinkReport::default();
        for site in std::mem::take(&mut self.pending) {
            let target = self.defined[&site.target];
            let unit = &mut units[site.unit];
            if patch_site(unit, &site, target)? {
                report.trampolines += 1;
            }
            report.patched += 1;
        }
        if report.patched > 0 {
            debug!(
                patched = report.patched,
                trampolines = report.trampolines,
                "resolved call sites"
            );
        }
        Ok(report)
    }
}

/// Returns true when the site had to be routed through its island.
fn patch_site(unit: &mut LinkUnit, site: &UnresolvedCallSite, target: u64) -> StubResult<bool> {
    let site_address = unit.base as i64 + site.offset as i64;
    let direct = match site.kind {
        RelocKind::X64Rel32 => target as i64 - (site_address + 4),
        RelocKind::A64Branch26 => target as i64 - site_address,
    };
    let in_range = match site.kind {
        RelocKind::X64Rel32 => rel32_fits(direct),
        RelocKind::A64Branch26 => imm26_fits(direct),
    };
    if in_range {
        write_displacement(unit, site, direct)?;
        return Ok(false);
    }

    let Some(island) = site.island else {
        return Err(StubError::Link(format!(
            "{} is out of direct range of unit {} and no island was emitted",
            site.target, site.unit
        )));
    };
    let slot = unit
        .code
        .get_mut(island.literal..island.literal + 8)
        .ok_or_else(|| StubError::Link("island literal out of bounds".to_string()))?;
    slot.copy_from_slice(&target.to_le_bytes());
    let island_address = unit.base as i64 + island.start as i64;
    let via_island = match site.kind {
        RelocKind::X64Rel32 => island_address - (site_address + 4),
        RelocKind::A64Branch26 => island_address - site_address,
    };
    write_displacement(unit, site, via_island)?;
    warn!(
        target = %site.target,
        unit = site.unit,
        "call target out of direct range, routed through island"
    );
    Ok(true)
}

fn write_displacement(unit: &mut LinkUnit, site: &UnresolvedCallSite, displacement: i64) -> StubResult<()> {
    let patched = match site.kind {
        RelocKind::X64Rel32 => patch_rel32(&mut unit.code, site.offset, displacement),
        RelocKind::A64Branch26 => patch_imm26(&mut unit.code, site.offset, displacement),
    };
    patched.map_err(|err| StubError::Link(err.to_string()))
}
