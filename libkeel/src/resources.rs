//! The scan environment: one handle bundling everything the scanner reads and mutates. The
//! driver initialises these before scanning and tears them down after the writer finishes; the
//! core neither creates nor destroys them.

use crate::config::Config;
use crate::error::Diagnostics;
use crate::input_data::FileTable;
use crate::sections::OutputSection;
use crate::sections::SectionRef;
use crate::sections::SectionTable;
use crate::symbol_db::SymbolDb;
use crate::symbol_db::SymbolId;
use crate::symbol_db::SymbolValue;
use crate::synthetic::SyntheticKind;
use crate::synthetic::SyntheticSections;
use crate::target::Target;
use crate::undefined::UndefinedDiag;

pub struct ScanResources<'data, 'a> {
    pub config: &'a Config,
    pub target: &'a dyn Target,

    /// Arena for names synthesised during scanning (thunk target symbols). Owned by the driver
    /// alongside the input data so the borrowed name bytes stay valid for the whole link.
    pub names: &'data bumpalo::Bump,

    pub symbols: &'a mut SymbolDb<'data>,
    pub files: &'a mut FileTable<'data>,
    pub sections: &'a mut SectionTable<'data>,
    pub output_sections: &'a mut Vec<OutputSection>,
    pub synthetic: &'a mut SyntheticSections,
    pub diagnostics: &'a mut Diagnostics,

    /// Undefined-symbol diagnostics collected during scanning, reported in one batch once all
    /// sections have been scanned.
    pub undefs: &'a mut Vec<UndefinedDiag>,

    /// PPC64 TOC entries that must not be relaxed (`R_PPC64_TOC16_LO` against `.toc`).
    pub ppc64_no_toc_relax: &'a mut hashbrown::HashSet<(SymbolId, i64)>,
}

impl ScanResources<'_, '_> {
    /// The link-time virtual address of a symbol plus addend, as far as this layer knows it.
    /// Undefined symbols resolve to zero; shared symbols have no link-time address.
    pub fn symbol_va(&self, sym_id: SymbolId, addend: i64) -> u64 {
        let sym = self.symbols.symbol(sym_id);
        let base = match sym.value {
            SymbolValue::Defined { section, value, .. } => match section {
                None => value,
                Some(SectionRef::Input(id)) => {
                    let sec = self.sections.section(id);
                    let parent_addr = sec
                        .parent
                        .map_or(0, |os| self.output_sections[os.as_usize()].addr);
                    parent_addr + sec.out_sec_off + value
                }
                Some(SectionRef::Synthetic(kind)) => self.synthetic_address(kind) + value,
                Some(SectionRef::Thunk(_)) => {
                    // Thunk target symbols are resolved by the thunk creator, which owns the
                    // thunk sections; nothing else should ask for their address.
                    value
                }
            },
            SymbolValue::Undefined | SymbolValue::Lazy => 0,
            SymbolValue::Shared { .. } => 0,
        };
        base.wrapping_add(addend as u64)
    }

    pub fn synthetic_address(&self, kind: SyntheticKind) -> u64 {
        match kind {
            SyntheticKind::Got => self.synthetic.got.address,
            SyntheticKind::GotPlt => self.synthetic.got_plt.address,
            SyntheticKind::Plt => self.synthetic.plt.address,
            SyntheticKind::Iplt => self.synthetic.iplt.address,
            SyntheticKind::IgotPlt => self.synthetic.igot_plt.address,
            SyntheticKind::MipsGot => self.synthetic.mips_got.address,
            SyntheticKind::CheriCapTable => self.synthetic.cheri_cap_table.address,
            SyntheticKind::Bss | SyntheticKind::BssRelRo => 0,
        }
    }
}
