//! Display gamma ramp (DC LUT) side effects.
use bitos::integer::UnsignedInt;

use crate::reg::{DcLut30Color, DcLutPwlData, DcLutRwIndex, Reg};
use crate::regfile::RegisterFile;

/// Which of the two gamma ramps was modified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GammaRampKind {
    /// The 256-entry table.
    Table,
    /// The 128-entry piecewise linear ramp.
    PiecewiseLinear,
}

/// A 10:10:10 entry of the 256-entry table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TableEntry {
    pub red: u16,
    pub green: u16,
    pub blue: u16,
}

/// One channel of a piecewise linear ramp entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PwlEntry {
    pub base: u16,
    pub delta: u16,
}

/// Gamma ramp state, written through the `DC_LUT_*` registers.
#[derive(Debug, Clone)]
pub struct GammaRamp {
    pub table: [TableEntry; 256],
    /// Red, green and blue channels of each entry.
    pub pwl: [[PwlEntry; 3]; 128],
    /// Sequential write cursor: 0 is red, 1 is green, 2 is blue.
    component: u8,
}

impl Default for GammaRamp {
    fn default() -> Self {
        Self {
            table: [TableEntry::default(); 256],
            pwl: [[PwlEntry::default(); 3]; 128],
            component: 0,
        }
    }
}

impl GammaRamp {
    /// Whether the current sequential component is enabled by `DC_LUT_WRITE_EN_MASK`. The mask
    /// is in blue, green, red order while sequential writes are red, green, blue.
    fn component_enabled(&self, regs: &RegisterFile) -> bool {
        regs.get(Reg::DcLutWriteEnMask) & (1 << (2 - self.component)) != 0
    }

    fn advance(&mut self, regs: &mut RegisterFile) {
        self.component += 1;
        if self.component >= 3 {
            self.component = 0;
            bump_index(regs);
        }
    }

    /// Applies the side effect of a write to a gamma ramp register whose value is already in the
    /// register file. Returns the ramp that was modified, if any.
    pub fn write(&mut self, regs: &mut RegisterFile, reg: Reg) -> Option<GammaRampKind> {
        match reg {
            Reg::DcLutRwIndex => {
                self.component = 0;
                None
            }
            Reg::DcLutSeqColor => {
                debug_assert_eq!(regs.get(Reg::DcLutRwMode) & 1, 0);

                let enabled = self.component_enabled(regs);
                if enabled {
                    let index = regs.view::<DcLutRwIndex>().rw_index() as usize;
                    // bits 0:5 are hardwired to zero
                    let value = ((regs.get(Reg::DcLutSeqColor) & 0xFFFF) >> 6) as u16;
                    let entry = &mut self.table[index];
                    match self.component {
                        0 => entry.red = value,
                        1 => entry.green = value,
                        _ => entry.blue = value,
                    }
                }

                self.advance(regs);
                enabled.then_some(GammaRampKind::Table)
            }
            Reg::DcLutPwlData => {
                debug_assert_ne!(regs.get(Reg::DcLutRwMode) & 1, 0);

                let enabled = self.component_enabled(regs);
                if enabled {
                    // bit 7 of the index is ignored here
                    let index = (regs.view::<DcLutRwIndex>().rw_index() & 0x7F) as usize;
                    let value = regs.view::<DcLutPwlData>();
                    self.pwl[index][self.component as usize] = PwlEntry {
                        base: value.base() & !0x3F,
                        delta: value.delta() & !0x3F,
                    };
                }

                self.advance(regs);
                enabled.then_some(GammaRampKind::PiecewiseLinear)
            }
            Reg::DcLut30Color => {
                debug_assert_eq!(regs.get(Reg::DcLutRwMode) & 1, 0);

                let mask = regs.get(Reg::DcLutWriteEnMask) & 0b111;
                if mask != 0 {
                    let index = regs.view::<DcLutRwIndex>().rw_index() as usize;
                    let value = regs.view::<DcLut30Color>();
                    let entry = &mut self.table[index];
                    if mask & 0b001 != 0 {
                        entry.blue = value.blue().value();
                    }
                    if mask & 0b010 != 0 {
                        entry.green = value.green().value();
                    }
                    if mask & 0b100 != 0 {
                        entry.red = value.red().value();
                    }
                }

                bump_index(regs);
                self.component = 0;
                (mask != 0).then_some(GammaRampKind::Table)
            }
            _ => None,
        }
    }
}

fn bump_index(regs: &mut RegisterFile) {
    let index = regs.view::<DcLutRwIndex>();
    let index = index.with_rw_index(index.rw_index().wrapping_add(1));
    regs.set(Reg::DcLutRwIndex, index.to_bits());
}
