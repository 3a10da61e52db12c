//! Synthetic sections the scanner grows on demand, plus the uniform "effector" operations that
//! add entries and record the static or dynamic relocation bookkeeping that goes with them.
//!
//! Allocation order is deterministic and a function of scan order; the offsets handed out here
//! are final. The actual bytes are written later by the writer, which walks the entry lists and
//! relocation records collected here.

use crate::config::Config;
use crate::resources::ScanResources;
use crate::sections::Relocation;
use crate::sections::SectionRef;
use crate::symbol_db::SymbolFlags;
use crate::symbol_db::SymbolId;
use indexmap::IndexMap;
use linker_utils::elf::RelExpr;
use linker_utils::elf::RelType;

/// Identifies one of the process-wide synthetic sections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyntheticKind {
    Got,
    GotPlt,
    Plt,
    Iplt,
    IgotPlt,
    MipsGot,
    CheriCapTable,
    Bss,
    BssRelRo,
}

/// Whether the dynamic loader needs the symbol to apply a dynamic relocation, or just the
/// addend (plus the target's link-time address).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DynamicRelocKind {
    AgainstSymbol,
    AddendOnly,
}

#[derive(Debug, Clone, Copy)]
pub struct DynamicReloc {
    pub r_type: RelType,
    pub target: SectionRef,
    pub offset: u64,
    pub sym: SymbolId,
    pub addend: i64,
    pub kind: DynamicRelocKind,
}

/// `.rela.dyn`, `.rela.plt` and `.rela.iplt` all share this shape.
pub struct RelocSection {
    pub name: &'static str,
    pub relocations: Vec<DynamicReloc>,
}

impl RelocSection {
    fn new(name: &'static str) -> Self {
        RelocSection {
            name,
            relocations: Vec::new(),
        }
    }

    pub fn add_reloc(&mut self, reloc: DynamicReloc) {
        self.relocations.push(reloc);
    }

    pub fn add_symbol_reloc(
        &mut self,
        r_type: RelType,
        target: SectionRef,
        offset: u64,
        sym: SymbolId,
        addend: i64,
    ) {
        self.add_reloc(DynamicReloc {
            r_type,
            target,
            offset,
            sym,
            addend,
            kind: DynamicRelocKind::AgainstSymbol,
        });
    }

    pub fn add_relative_reloc(
        &mut self,
        r_type: RelType,
        target: SectionRef,
        offset: u64,
        sym: SymbolId,
        addend: i64,
    ) {
        self.add_reloc(DynamicReloc {
            r_type,
            target,
            offset,
            sym,
            addend,
            kind: DynamicRelocKind::AddendOnly,
        });
    }

    pub fn add_addend_only_reloc_if_non_preemptible(
        &mut self,
        r_type: RelType,
        target: SectionRef,
        offset: u64,
        sym: SymbolId,
        preemptible: bool,
    ) {
        let kind = if preemptible {
            DynamicRelocKind::AgainstSymbol
        } else {
            DynamicRelocKind::AddendOnly
        };
        self.add_reloc(DynamicReloc {
            r_type,
            target,
            offset,
            sym,
            addend: 0,
            kind,
        });
    }

    pub fn len(&self) -> usize {
        self.relocations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.relocations.is_empty()
    }
}

/// The packed relative-relocation section. Only stores locations; addends live at the relocated
/// addresses, which is why only even offsets in sufficiently aligned sections qualify.
#[derive(Default)]
pub struct RelrDynSection {
    pub relocs: Vec<(SectionRef, u64)>,
}

pub struct GotSection {
    pub address: u64,
    entry_size: u64,
    num_entries: u64,
    entries: hashbrown::HashMap<SymbolId, u64>,
    global_dyn: hashbrown::HashMap<SymbolId, u64>,
    tls_index: Option<u64>,

    /// Static records that fill GOT slots whose values are link-time constants.
    pub relocations: Vec<Relocation>,

    /// Some relocation computes an offset relative to the GOT base, so the GOT must exist even
    /// if it has no entries.
    pub has_got_off_rel: bool,
}

impl GotSection {
    fn new(entry_size: u64) -> Self {
        GotSection {
            address: 0,
            entry_size,
            num_entries: 0,
            entries: hashbrown::HashMap::new(),
            global_dyn: hashbrown::HashMap::new(),
            tls_index: None,
            relocations: Vec::new(),
            has_got_off_rel: false,
        }
    }

    /// Allocates a plain entry for the symbol. Returns whether the entry was fresh.
    pub fn add_entry(&mut self, sym: SymbolId) -> bool {
        if self.entries.contains_key(&sym) {
            return false;
        }
        let index = self.num_entries;
        self.num_entries += 1;
        self.entries.insert(sym, index);
        true
    }

    pub fn has_entry(&self, sym: SymbolId) -> bool {
        self.entries.contains_key(&sym)
    }

    pub fn offset_of(&self, sym: SymbolId) -> u64 {
        self.entries[&sym] * self.entry_size
    }

    /// Allocates the {module index, offset} pair used by general-dynamic TLS and TLS
    /// descriptors. Returns whether the pair was fresh.
    pub fn add_dyn_tls_entry(&mut self, sym: SymbolId) -> bool {
        if self.global_dyn.contains_key(&sym) {
            return false;
        }
        let index = self.num_entries;
        self.num_entries += 2;
        self.global_dyn.insert(sym, index);
        true
    }

    pub fn global_dyn_offset(&self, sym: SymbolId) -> u64 {
        self.global_dyn[&sym] * self.entry_size
    }

    /// Allocates the single module-index slot shared by all local-dynamic accesses. Returns
    /// whether this call allocated it.
    pub fn add_tls_index(&mut self) -> bool {
        if self.tls_index.is_some() {
            return false;
        }
        let index = self.num_entries;
        // The pair layout matches general-dynamic; the offset word is unused.
        self.num_entries += 2;
        self.tls_index = Some(index);
        true
    }

    pub fn tls_index_offset(&self) -> u64 {
        self.tls_index.expect("TLS index slot not allocated") * self.entry_size
    }

    pub fn num_entries(&self) -> u64 {
        self.num_entries
    }

    pub fn alignment(&self) -> u64 {
        self.entry_size
    }
}

pub struct GotPltSection {
    pub address: u64,
    entry_size: u64,
    header_entries: u64,
    entries: Vec<SymbolId>,

    /// Some relocation computes an offset relative to the GOT.PLT base.
    pub has_got_plt_off_rel: bool,
}

impl GotPltSection {
    fn new(entry_size: u64, header_entries: u64) -> Self {
        GotPltSection {
            address: 0,
            entry_size,
            header_entries,
            entries: Vec::new(),
            has_got_plt_off_rel: false,
        }
    }

    pub fn add_entry(&mut self, sym: SymbolId) {
        self.entries.push(sym);
    }

    pub fn num_entries(&self) -> u64 {
        self.entries.len() as u64
    }

    /// Offset of the slot backing PLT entry `plt_index`.
    pub fn offset_of_plt_index(&self, plt_index: u32) -> u64 {
        (self.header_entries + u64::from(plt_index)) * self.entry_size
    }
}

pub struct PltSection {
    pub address: u64,
    pub header_size: u64,
    entries: Vec<SymbolId>,
}

impl PltSection {
    fn new(header_size: u64) -> Self {
        PltSection {
            address: 0,
            header_size,
            entries: Vec::new(),
        }
    }

    pub fn add_entry(&mut self, sym: SymbolId) -> u32 {
        let index = u32::try_from(self.entries.len()).expect("PLT overflowed 32 bits");
        self.entries.push(sym);
        index
    }

    pub fn has_entry(&self, sym: SymbolId) -> bool {
        self.entries.contains(&sym)
    }

    pub fn num_entries(&self) -> u64 {
        self.entries.len() as u64
    }

    pub fn entries(&self) -> &[SymbolId] {
        &self.entries
    }
}

/// The MIPS GOT. MIPS turns GOT handling inside out: the dynamic loader fills entries from a
/// specially sorted dynamic symbol table instead of from dynamic relocations, and local entries
/// are keyed by (symbol, addend) because they hold page addresses.
pub struct MipsGotSection {
    pub address: u64,
    entry_size: u64,
    num_entries: u64,
    local_entries: IndexMap<(SymbolId, i64), u64>,
    global_entries: IndexMap<SymbolId, u64>,
    dyn_tls_entries: IndexMap<SymbolId, u64>,
    tls_index: Option<u64>,
}

impl MipsGotSection {
    fn new(entry_size: u64) -> Self {
        MipsGotSection {
            address: 0,
            entry_size,
            // Entry 0 is the lazy-resolver slot, entry 1 the module pointer.
            num_entries: 2,
            local_entries: IndexMap::new(),
            global_entries: IndexMap::new(),
            dyn_tls_entries: IndexMap::new(),
            tls_index: None,
        }
    }

    pub fn add_entry(&mut self, sym: SymbolId, addend: i64, preemptible: bool) -> bool {
        if preemptible {
            if self.global_entries.contains_key(&sym) {
                return false;
            }
            let index = self.num_entries;
            self.num_entries += 1;
            self.global_entries.insert(sym, index);
        } else {
            if self.local_entries.contains_key(&(sym, addend)) {
                return false;
            }
            let index = self.num_entries;
            self.num_entries += 1;
            self.local_entries.insert((sym, addend), index);
        }
        true
    }

    pub fn add_dyn_tls_entry(&mut self, sym: SymbolId) -> bool {
        if self.dyn_tls_entries.contains_key(&sym) {
            return false;
        }
        let index = self.num_entries;
        self.num_entries += 2;
        self.dyn_tls_entries.insert(sym, index);
        true
    }

    pub fn add_tls_index(&mut self) -> bool {
        if self.tls_index.is_some() {
            return false;
        }
        self.tls_index = Some(self.num_entries);
        self.num_entries += 2;
        true
    }

    pub fn num_entries(&self) -> u64 {
        self.num_entries
    }

    pub fn size(&self) -> u64 {
        self.num_entries * self.entry_size
    }
}

#[derive(Debug, Clone, Copy)]
struct CapTableEntry {
    index: u64,

    /// The entry has only ever been referenced by call expressions. Such entries could use the
    /// call-only relocation once the runtime linker understands it.
    used_in_call_expr: bool,

    /// Referenced through a small-immediate form, constraining where the entry may be placed.
    needs_small_imm: bool,
}

/// The CHERI capability table: the GOT-analogue that holds tagged capabilities.
pub struct CheriCapTableSection {
    pub address: u64,
    entry_size: u64,
    entries: IndexMap<SymbolId, CapTableEntry>,
    dyn_tls_entries: IndexMap<SymbolId, u64>,
    tls_entries: IndexMap<SymbolId, u64>,
    tls_index: Option<u64>,
    num_tls_slots: u64,
}

impl CheriCapTableSection {
    fn new(entry_size: u64) -> Self {
        CheriCapTableSection {
            address: 0,
            entry_size,
            entries: IndexMap::new(),
            dyn_tls_entries: IndexMap::new(),
            tls_entries: IndexMap::new(),
            tls_index: None,
            num_tls_slots: 0,
        }
    }

    /// Registers a use of the symbol's capability-table entry. Returns whether a new entry was
    /// allocated.
    pub fn add_entry(&mut self, sym: SymbolId, expr: RelExpr) -> bool {
        let is_call = matches!(
            expr,
            RelExpr::CheriCapTableIndexCall | RelExpr::CheriCapTableIndexCallSmallImm
        );
        let is_small_imm = matches!(
            expr,
            RelExpr::CheriCapTableIndexSmallImm | RelExpr::CheriCapTableIndexCallSmallImm
        );
        match self.entries.entry(sym) {
            indexmap::map::Entry::Occupied(mut e) => {
                let entry = e.get_mut();
                entry.used_in_call_expr &= is_call;
                entry.needs_small_imm |= is_small_imm;
                false
            }
            indexmap::map::Entry::Vacant(e) => {
                let index = e.index() as u64;
                e.insert(CapTableEntry {
                    index,
                    used_in_call_expr: is_call,
                    needs_small_imm: is_small_imm,
                });
                true
            }
        }
    }

    pub fn has_entry(&self, sym: SymbolId) -> bool {
        self.entries.contains_key(&sym)
    }

    pub fn index_of(&self, sym: SymbolId) -> u64 {
        self.entries[&sym].index
    }

    pub fn offset_of(&self, sym: SymbolId) -> u64 {
        self.index_of(sym) * self.entry_size
    }

    pub fn add_dyn_tls_entry(&mut self, sym: SymbolId) -> bool {
        if self.dyn_tls_entries.contains_key(&sym) {
            return false;
        }
        let slot = self.num_tls_slots;
        self.num_tls_slots += 2;
        self.dyn_tls_entries.insert(sym, slot);
        true
    }

    pub fn add_tls_entry(&mut self, sym: SymbolId) -> bool {
        if self.tls_entries.contains_key(&sym) {
            return false;
        }
        let slot = self.num_tls_slots;
        self.num_tls_slots += 1;
        self.tls_entries.insert(sym, slot);
        true
    }

    pub fn add_tls_index(&mut self) -> bool {
        if self.tls_index.is_some() {
            return false;
        }
        self.tls_index = Some(self.num_tls_slots);
        self.num_tls_slots += 2;
        true
    }

    pub fn num_entries(&self) -> u64 {
        self.entries.len() as u64
    }
}

/// A `__cap_relocs`-style record telling the runtime to materialise a capability at `location`.
#[derive(Debug, Clone, Copy)]
pub struct CapReloc {
    pub location: (SectionRef, u64),
    pub target: SymbolId,
    pub addend: i64,
}

#[derive(Default)]
pub struct CapRelocsSection {
    pub relocs: Vec<CapReloc>,
}

impl CapRelocsSection {
    pub fn add(&mut self, location: (SectionRef, u64), target: SymbolId, addend: i64) {
        self.relocs.push(CapReloc {
            location,
            target,
            addend,
        });
    }
}

/// Space reserved in `.bss` / `.bss.rel.ro` for copy relocations.
pub struct BssSection {
    pub name: &'static str,
    size: u64,
    alignment: u64,
}

impl BssSection {
    fn new(name: &'static str) -> Self {
        BssSection {
            name,
            size: 0,
            alignment: 1,
        }
    }

    /// Reserves `size` bytes aligned to `alignment` and returns the offset of the reservation.
    pub fn reserve(&mut self, size: u64, alignment: u64) -> u64 {
        debug_assert!(alignment.is_power_of_two());
        let offset = self.size.next_multiple_of(alignment);
        self.size = offset + size;
        self.alignment = self.alignment.max(alignment);
        offset
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn alignment(&self) -> u64 {
        self.alignment
    }
}

/// The process-wide synthetic section set, driver-initialised before scanning starts and torn
/// down after the writer is done.
pub struct SyntheticSections {
    pub got: GotSection,
    pub got_plt: GotPltSection,
    pub plt: PltSection,
    pub iplt: PltSection,
    pub igot_plt: GotPltSection,
    pub mips_got: MipsGotSection,
    pub cheri_cap_table: CheriCapTableSection,
    pub cap_relocs: CapRelocsSection,
    pub bss: BssSection,
    pub bss_rel_ro: BssSection,
    pub rela_dyn: RelocSection,
    pub rela_plt: RelocSection,
    pub rela_iplt: RelocSection,
    pub relr_dyn: Option<RelrDynSection>,
}

impl SyntheticSections {
    pub fn new(config: &Config) -> Self {
        let wordsize = config.wordsize;
        let cap_size = if config.is_cheri_abi { wordsize * 2 } else { wordsize };
        SyntheticSections {
            got: GotSection::new(wordsize),
            got_plt: GotPltSection::new(wordsize, 3),
            plt: PltSection::new(16),
            iplt: PltSection::new(0),
            igot_plt: GotPltSection::new(wordsize, 0),
            mips_got: MipsGotSection::new(wordsize),
            cheri_cap_table: CheriCapTableSection::new(cap_size),
            cap_relocs: CapRelocsSection::default(),
            bss: BssSection::new(".bss"),
            bss_rel_ro: BssSection::new(".bss.rel.ro"),
            rela_dyn: RelocSection::new(".rela.dyn"),
            rela_plt: RelocSection::new(".rela.plt"),
            rela_iplt: RelocSection::new(".rela.iplt"),
            relr_dyn: config.pack_dyn_relocs_relr.then(RelrDynSection::default),
        }
    }
}

/// Allocates a GOT slot for the symbol and records how the slot gets its value: a static record
/// when the value is a link-time constant, a relative dynamic relocation when only the load base
/// moves it, and a symbol-naming dynamic relocation otherwise.
pub(crate) fn add_got_entry(res: &mut ScanResources, sym_id: SymbolId) {
    if !res.synthetic.got.add_entry(sym_id) {
        return;
    }
    res.symbols.symbol_mut(sym_id).flags |= SymbolFlags::IN_GOT;
    let sym = res.symbols.symbol(sym_id);

    let expr = if sym.is_tls() {
        RelExpr::TpRel
    } else {
        RelExpr::Abs
    };
    let off = res.synthetic.got.offset_of(sym_id);
    let info = res.target.info();

    // If the GOT slot's value can be calculated now, record a static fill for the writer.
    let is_link_time_constant =
        !sym.is_preemptible && (!res.config.is_pic() || sym.is_absolute());
    if is_link_time_constant {
        res.synthetic.got.relocations.push(Relocation {
            expr,
            r_type: info.symbolic_rel,
            offset: off,
            addend: 0,
            sym: sym_id,
        });
        return;
    }

    if !sym.is_tls() && !sym.is_preemptible && res.config.is_pic() {
        add_relative_reloc(
            res,
            SectionRef::Synthetic(SyntheticKind::Got),
            off,
            sym_id,
            0,
            RelExpr::Abs,
            info.symbolic_rel,
        );
        return;
    }

    let r_type = if sym.is_tls() {
        info.tls_got_rel
    } else {
        info.got_rel
    };
    let preemptible = sym.is_preemptible;
    res.synthetic.rela_dyn.add_addend_only_reloc_if_non_preemptible(
        r_type,
        SectionRef::Synthetic(SyntheticKind::Got),
        off,
        sym_id,
        preemptible,
    );
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PltFlavor {
    /// The ordinary PLT, backed by GOT.PLT and `.rela.plt` JUMP_SLOT-style relocations.
    Plt,

    /// The ifunc PLT, backed by IGOT.PLT and eagerly-evaluated IRELATIVE relocations in
    /// `.rela.iplt`.
    Iplt,
}

/// Allocates a PLT entry for the symbol. In CHERI mode the indirection goes through the
/// capability table instead of GOT.PLT; the table's plain INDEX relocation is used rather than
/// the call-only one so that the dynamic relocations land in `.rela.dyn` and no runtime-linker
/// changes are needed.
pub(crate) fn add_plt_entry(res: &mut ScanResources, sym_id: SymbolId, flavor: PltFlavor) {
    let plt_index = match flavor {
        PltFlavor::Plt => res.synthetic.plt.add_entry(sym_id),
        PltFlavor::Iplt => res.synthetic.iplt.add_entry(sym_id),
    };
    {
        let sym = res.symbols.symbol_mut(sym_id);
        sym.plt_index = Some(plt_index);
        sym.flags |= SymbolFlags::IN_PLT;
        if flavor == PltFlavor::Iplt {
            sym.flags |= SymbolFlags::IN_IPLT;
        }
    }

    if res.config.is_cheri_abi {
        res.synthetic
            .cheri_cap_table
            .add_entry(sym_id, RelExpr::CheriCapTableIndex);
        return;
    }

    let sym = res.symbols.symbol(sym_id);
    let preemptible = sym.is_preemptible;
    let info = res.target.info();
    match flavor {
        PltFlavor::Plt => {
            res.synthetic.got_plt.add_entry(sym_id);
            let offset = res.synthetic.got_plt.offset_of_plt_index(plt_index);
            res.synthetic.rela_plt.add_addend_only_reloc_if_non_preemptible(
                info.plt_rel,
                SectionRef::Synthetic(SyntheticKind::GotPlt),
                offset,
                sym_id,
                preemptible,
            );
        }
        PltFlavor::Iplt => {
            res.synthetic.igot_plt.add_entry(sym_id);
            let offset = res.synthetic.igot_plt.offset_of_plt_index(plt_index);
            res.synthetic.rela_iplt.add_addend_only_reloc_if_non_preemptible(
                info.irelative_rel,
                SectionRef::Synthetic(SyntheticKind::IgotPlt),
                offset,
                sym_id,
                preemptible,
            );
        }
    }
}

/// Records a relative relocation against `target` + `offset`. If the packed `.relr.dyn` section
/// is enabled and the offset qualifies (even offset, alignment >= 2), the relocation is packed:
/// a static record computes the value in place and only the location goes into RELR. Otherwise a
/// regular relative dynamic relocation is emitted.
pub(crate) fn add_relative_reloc(
    res: &mut ScanResources,
    target: SectionRef,
    offset_in_sec: u64,
    sym_id: SymbolId,
    addend: i64,
    expr: RelExpr,
    r_type: RelType,
) {
    let alignment = match target {
        SectionRef::Input(id) => res.sections.section(id).alignment,
        SectionRef::Synthetic(SyntheticKind::Got) => res.synthetic.got.alignment(),
        _ => 1,
    };

    if res.synthetic.relr_dyn.is_some() && alignment >= 2 && offset_in_sec % 2 == 0 {
        let record = Relocation {
            expr,
            r_type,
            offset: offset_in_sec,
            addend,
            sym: sym_id,
        };
        match target {
            SectionRef::Input(id) => res.sections.section_mut(id).relocations.push(record),
            SectionRef::Synthetic(SyntheticKind::Got) => {
                res.synthetic.got.relocations.push(record);
            }
            _ => unreachable!("relative relocation against unexpected section"),
        }
        res.synthetic
            .relr_dyn
            .as_mut()
            .expect("checked above")
            .relocs
            .push((target, offset_in_sec));
        return;
    }

    let relative_rel = res.target.info().relative_rel;
    res.synthetic
        .rela_dyn
        .add_relative_reloc(relative_rel, target, offset_in_sec, sym_id, addend);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_got_entry_idempotent() {
        let mut got = GotSection::new(8);
        let sym = SymbolId::from_usize(1);
        assert!(got.add_entry(sym));
        assert!(!got.add_entry(sym));
        assert_eq!(got.num_entries(), 1);
        assert_eq!(got.offset_of(sym), 0);
    }

    #[test]
    fn test_got_dyn_tls_pair_layout() {
        let mut got = GotSection::new(8);
        let a = SymbolId::from_usize(1);
        let b = SymbolId::from_usize(2);
        assert!(got.add_dyn_tls_entry(a));
        assert!(!got.add_dyn_tls_entry(a));
        assert!(got.add_dyn_tls_entry(b));
        assert_eq!(got.global_dyn_offset(a), 0);
        assert_eq!(got.global_dyn_offset(b), 16);
        assert_eq!(got.num_entries(), 4);
    }

    #[test]
    fn test_ld_module_index_slot_is_shared() {
        let mut got = GotSection::new(8);
        assert!(got.add_tls_index());
        assert!(!got.add_tls_index());
        assert_eq!(got.tls_index_offset(), 0);
    }

    #[test]
    fn test_bss_reservation_alignment() {
        let mut bss = BssSection::new(".bss");
        assert_eq!(bss.reserve(1, 1), 0);
        assert_eq!(bss.reserve(8, 8), 8);
        assert_eq!(bss.size(), 16);
        assert_eq!(bss.alignment(), 8);
    }

    #[test]
    fn test_cap_table_call_tracking() {
        let mut table = CheriCapTableSection::new(16);
        let sym = SymbolId::from_usize(1);
        assert!(table.add_entry(sym, RelExpr::CheriCapTableIndexCall));
        assert!(!table.add_entry(sym, RelExpr::CheriCapTableIndex));
        // A non-call use clears the call-only property.
        assert!(!table.entries[&sym].used_in_call_expr);
        assert_eq!(table.num_entries(), 1);
    }

    #[test]
    fn test_mips_got_local_entries_keyed_by_addend() {
        let mut got = MipsGotSection::new(8);
        let sym = SymbolId::from_usize(1);
        assert!(got.add_entry(sym, 0, false));
        assert!(got.add_entry(sym, 0x10000, false));
        assert!(!got.add_entry(sym, 0, false));
        // Two header entries plus the two page entries.
        assert_eq!(got.num_entries(), 4);
    }
}
