//! Thunk (branch island) creation.
//!
//! Thunks are small pieces of code inserted between a caller and a callee when the branch can't
//! reach, or can't switch mode, on its own. Placing them is iterative: inserting a thunk moves
//! everything after it, which can push other branches out of range. The driver calls
//! [`ThunkCreator::create_thunks`] until it returns `false`.
//!
//! Each pass walks every relocation in every executable section. Relocations already pointing
//! at a thunk are checked to still be in range; when one has fallen out of range it is reverted
//! to its original destination so a closer thunk can be picked, which is how the rare
//! non-monotone case repairs itself. Thunks live in thunk sections, pre-seeded at
//! target-spacing intervals on the first pass and merged into the layout order afterwards.

use crate::bail;
use crate::error::Result;
use crate::relocations;
use crate::resources::ScanResources;
use crate::sections::IsdEntry;
use crate::sections::Relocation;
use crate::sections::SectionId;
use crate::sections::SectionRef;
use crate::symbol_db::Binding;
use crate::symbol_db::Symbol;
use crate::symbol_db::SymbolId;
use crate::symbol_db::SymbolKind;
use crate::symbol_db::SymbolValue;
use crate::synthetic::PltFlavor;
use hashbrown::HashMap;
use indexmap::IndexMap;
use itertools::Itertools;
use linker_utils::elf::arm;
use linker_utils::elf::RelExpr;
use linker_utils::elf::RelType;
use linker_utils::one_of;
use smallvec::SmallVec;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThunkSectionId(u32);

impl ThunkSectionId {
    fn from_usize(raw: usize) -> Self {
        ThunkSectionId(u32::try_from(raw).expect("Thunk section IDs overflowed 32 bits"))
    }

    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct ThunkId(u32);

impl ThunkId {
    fn from_usize(raw: usize) -> Self {
        ThunkId(u32::try_from(raw).expect("Thunk IDs overflowed 32 bits"))
    }

    fn as_usize(self) -> usize {
        self.0 as usize
    }
}

struct Thunk {
    /// The symbol the branch originally targeted. Kept so a relocation can be reverted when its
    /// thunk falls out of range.
    destination: SymbolId,
    addend: i64,

    /// The symbol relocations get redirected to. Defined inside the owning thunk section.
    target_sym: SymbolId,

    /// For thunks that must be placed immediately before their callee's section (MIPS LA25
    /// style).
    target_input_section: Option<SectionId>,

    size: u64,
    offset: u64,
}

struct ThunkSection {
    output_section: usize,
    out_sec_off: u64,
    partition: u16,
    thunks: Vec<ThunkId>,
    size: u64,

    /// Round the section size up to 4 KiB so that inserting thunks doesn't move code modulo
    /// 4 KiB and invalidate AArch64 errata patches.
    round_up_size_for_errata: bool,
}

impl ThunkSection {
    fn get_size(&self) -> u64 {
        if self.round_up_size_for_errata {
            self.size.next_multiple_of(4096)
        } else {
            self.size
        }
    }
}

/// Compensate for the ARM/Thumb PC bias (8 and 4 respectively) so that an ARM and a Thumb
/// branch to the same destination share a thunk key.
fn get_pc_bias(emachine: u16, r_type: RelType) -> i64 {
    if emachine != object::elf::EM_ARM {
        return 0;
    }
    match r_type {
        arm::R_ARM_THM_JUMP19 | arm::R_ARM_THM_JUMP24 | arm::R_ARM_THM_CALL => 4,
        _ => 8,
    }
}

/// Thunks in another loadable partition may not be loaded when the caller is; only the main
/// partition is always there.
fn is_thunk_section_compatible(source_partition: u16, thunk_partition: u16) -> bool {
    if source_partition != thunk_partition {
        return thunk_partition == 1;
    }
    true
}

pub struct ThunkCreator {
    pass: u32,
    thunks: Vec<Thunk>,
    thunk_sections: Vec<ThunkSection>,

    /// Thunk reuse for symbols with a section identity: one thunk can serve aliased symbols and
    /// folded sections. The addend stays separate from the section offset because a relocation
    /// may later be reverted to its original destination.
    thunked_by_section_and_addend: HashMap<((SectionId, u64), i64), SmallVec<[ThunkId; 1]>>,

    /// Thunk reuse for symbols without a section (PLT entries, absolute symbols).
    thunked_symbols: HashMap<(SymbolId, i64), SmallVec<[ThunkId; 1]>>,

    /// Thunk target symbol -> its thunk, for re-checking range on later passes.
    active_thunks: HashMap<SymbolId, ThunkId>,

    /// Callee section -> the thunk section placed immediately before it.
    thunked_sections: IndexMap<SectionId, ThunkSectionId>,
}

impl Default for ThunkCreator {
    fn default() -> Self {
        Self::new()
    }
}

impl ThunkCreator {
    pub fn new() -> Self {
        ThunkCreator {
            pass: 0,
            thunks: Vec::new(),
            thunk_sections: Vec::new(),
            thunked_by_section_and_addend: HashMap::new(),
            thunked_symbols: HashMap::new(),
            active_thunks: HashMap::new(),
            thunked_sections: IndexMap::new(),
        }
    }

    /// The link-time address of a symbol, resolving thunk-resident symbols against the thunk
    /// sections this creator owns.
    fn symbol_va(&self, res: &ScanResources, sym_id: SymbolId, addend: i64) -> u64 {
        let sym = res.symbols.symbol(sym_id);
        if let SymbolValue::Defined {
            section: Some(SectionRef::Thunk(tsid)),
            value,
            ..
        } = sym.value
        {
            let ts = &self.thunk_sections[tsid.as_usize()];
            let os_addr = res.output_sections[ts.output_section].addr;
            return (os_addr + ts.out_sec_off + value).wrapping_add(addend as u64);
        }
        res.symbol_va(sym_id, addend)
    }

    fn plt_va(&self, res: &ScanResources, sym: &Symbol) -> u64 {
        let info = res.target.info();
        let index = u64::from(sym.plt_index.unwrap_or(0));
        if sym.is_in_iplt() {
            res.synthetic.iplt.address + index * info.iplt_entry_size
        } else {
            res.synthetic.plt.address + info.plt_header_size + index * info.plt_entry_size
        }
    }

    /// The address a branch through this relocation lands at.
    fn destination_va(&self, res: &ScanResources, rel: &Relocation) -> u64 {
        let sym = res.symbols.symbol(rel.sym);
        if one_of!(rel.expr, PltPc, Ppc32PltRel, Ppc64CallPlt, Plt) && sym.is_in_plt() {
            return self.plt_va(res, sym);
        }
        self.symbol_va(res, rel.sym, rel.addend)
    }

    /// Returns true if the relocation already targets a thunk that is still in range. If the
    /// thunk has fallen out of range, the relocation is reverted to its original destination so
    /// a new thunk can be chosen.
    fn normalize_existing_thunk(
        &self,
        res: &mut ScanResources,
        rel: &mut Relocation,
        src: u64,
    ) -> bool {
        if let Some(&t) = self.active_thunks.get(&rel.sym) {
            let va = self.symbol_va(res, rel.sym, rel.addend);
            if res.target.in_branch_range(rel.r_type, src, va) {
                return true;
            }
            let thunk = &self.thunks[t.as_usize()];
            rel.sym = thunk.destination;
            rel.addend = thunk.addend;
            if res.symbols.symbol(rel.sym).is_in_plt() {
                rel.expr = relocations::to_plt(rel.expr);
            }
        }
        false
    }

    fn add_thunk(&mut self, res: &mut ScanResources, rel: &Relocation) -> ThunkId {
        let dest = res.symbols.symbol(rel.sym);

        // MIPS position-dependent callers reach PIC callees through an LA25 stub that must sit
        // immediately before the callee.
        let target_input_section = if res.config.emachine == object::elf::EM_MIPS {
            match dest.value {
                SymbolValue::Defined {
                    section: Some(SectionRef::Input(sec)),
                    ..
                } => Some(sec),
                _ => None,
            }
        } else {
            None
        };

        let mut name = Vec::with_capacity(dest.name.bytes().len() + 8);
        name.extend_from_slice(b"__thunk_");
        name.extend_from_slice(dest.name.bytes());
        let name: &[u8] = res.names.alloc_slice_copy(&name);

        let target_sym = res.symbols.add(Symbol::new(
            name,
            Binding::Local,
            SymbolKind::Func,
            SymbolValue::Defined {
                section: None,
                value: 0,
                size: 0,
            },
        ));

        let id = ThunkId::from_usize(self.thunks.len());
        self.thunks.push(Thunk {
            destination: rel.sym,
            addend: rel.addend,
            target_sym,
            target_input_section,
            size: res.target.info().thunk_size,
            offset: 0,
        });
        id
    }

    /// Finds a reusable thunk for the relocation or creates a new one. Returns the thunk and
    /// whether it is new.
    fn get_thunk(
        &mut self,
        res: &mut ScanResources,
        source_partition: u16,
        rel: &Relocation,
        src: u64,
    ) -> (ThunkId, bool) {
        let key_addend = rel.addend + get_pc_bias(res.config.emachine, rel.r_type);

        // Key on (section, offset) when we can, so aliased symbols and folded sections share
        // one thunk.
        let sym = res.symbols.symbol(rel.sym);
        let section_key = match sym.value {
            SymbolValue::Defined {
                section: Some(SectionRef::Input(sec)),
                value,
                ..
            } if !sym.is_in_plt() => Some((sec, value)),
            _ => None,
        };

        let candidates: &[ThunkId] = match section_key {
            Some(key) => self
                .thunked_by_section_and_addend
                .get(&(key, key_addend))
                .map_or(&[], |v| v.as_slice()),
            None => self
                .thunked_symbols
                .get(&(rel.sym, key_addend))
                .map_or(&[], |v| v.as_slice()),
        };

        for &t in candidates {
            let thunk = &self.thunks[t.as_usize()];
            let target_sym = res.symbols.symbol(thunk.target_sym);
            let thunk_partition = match target_sym.value {
                SymbolValue::Defined {
                    section: Some(SectionRef::Thunk(tsid)),
                    ..
                } => self.thunk_sections[tsid.as_usize()].partition,
                _ => 1,
            };
            if is_thunk_section_compatible(source_partition, thunk_partition)
                && res.target.in_branch_range(
                    rel.r_type,
                    src,
                    self.symbol_va(res, thunk.target_sym, rel.addend),
                )
            {
                return (t, false);
            }
        }

        let t = self.add_thunk(res, rel);
        match section_key {
            Some(key) => self
                .thunked_by_section_and_addend
                .entry((key, key_addend))
                .or_default()
                .push(t),
            None => self
                .thunked_symbols
                .entry((rel.sym, key_addend))
                .or_default()
                .push(t),
        }
        (t, true)
    }

    fn add_thunk_section(
        &mut self,
        res: &ScanResources,
        os_idx: usize,
        isd_entries: &[IsdEntry],
        off: u64,
    ) -> ThunkSectionId {
        let os = &res.output_sections[os_idx];
        let mut round_up = false;
        if (res.config.fix_cortex_a53_843419 || res.config.fix_cortex_a8)
            && !isd_entries.is_empty()
        {
            // Only round in layouts big enough that the rounding can't trip small-section
            // assertions: the output section must exceed the thunk spacing and the ISD must
            // exceed 4 KiB.
            let first = self.entry_off(res, isd_entries[0]);
            let last_entry = *isd_entries.last().expect("checked non-empty");
            let isd_size =
                self.entry_off(res, last_entry) + self.entry_size(res, last_entry) - first;
            let spacing = res.target.thunk_section_spacing().unwrap_or(u32::MAX);
            if os.size > u64::from(spacing) && isd_size > 4096 {
                round_up = true;
            }
        }

        let id = ThunkSectionId::from_usize(self.thunk_sections.len());
        self.thunk_sections.push(ThunkSection {
            output_section: os_idx,
            out_sec_off: off,
            partition: os.partition,
            thunks: Vec::new(),
            size: 0,
            round_up_size_for_errata: round_up,
        });
        id
    }

    fn entry_off(&self, res: &ScanResources, entry: IsdEntry) -> u64 {
        match entry {
            IsdEntry::Input(id) => res.sections.section(id).out_sec_off,
            IsdEntry::Thunk(id) => self.thunk_sections[id.as_usize()].out_sec_off,
        }
    }

    fn entry_size(&self, res: &ScanResources, entry: IsdEntry) -> u64 {
        match entry {
            IsdEntry::Input(id) => res.sections.section(id).size,
            IsdEntry::Thunk(id) => self.thunk_sections[id.as_usize()].get_size(),
        }
    }

    /// Finds or creates a thunk section within the caller's ISD that is in branch range of
    /// `src`.
    fn get_isd_thunk_sec(
        &mut self,
        res: &mut ScanResources,
        os_idx: usize,
        isd_idx: usize,
        isec: SectionId,
        rel: &Relocation,
        src: u64,
    ) -> Result<ThunkSectionId> {
        let os_addr = res.output_sections[os_idx].addr;
        let existing: Vec<ThunkSectionId> = res.output_sections[os_idx].isds[isd_idx]
            .thunk_sections
            .iter()
            .map(|&(ts, _)| ts)
            .collect();
        for tsid in existing {
            let ts = &self.thunk_sections[tsid.as_usize()];
            let ts_base = (os_addr + ts.out_sec_off).wrapping_add(rel.addend as u64);
            let ts_limit = ts_base + ts.get_size();
            let probe = if src > ts_limit { ts_base } else { ts_limit };
            if res.target.in_branch_range(rel.r_type, src, probe) {
                return Ok(tsid);
            }
        }

        // No pre-created thunk section is reachable: the branch has less range than the spacing
        // or the existing sections filled up. Place a new one as close to the caller as
        // possible.
        let section = res.sections.section(isec);
        let mut thunk_sec_off = section.out_sec_off;
        if !res.target.in_branch_range(
            rel.r_type,
            src,
            (os_addr + thunk_sec_off).wrapping_add(rel.addend as u64),
        ) {
            thunk_sec_off = section.out_sec_off + section.size;
            if !res.target.in_branch_range(
                rel.r_type,
                src,
                (os_addr + thunk_sec_off).wrapping_add(rel.addend as u64),
            ) {
                bail!(
                    "InputSection too large for range extension thunk: {}",
                    String::from_utf8_lossy(section.name)
                );
            }
        }

        let entries = res.output_sections[os_idx].isds[isd_idx].sections.clone();
        let tsid = self.add_thunk_section(res, os_idx, &entries, thunk_sec_off);
        let pass = self.pass;
        res.output_sections[os_idx].isds[isd_idx]
            .thunk_sections
            .push((tsid, pass));
        Ok(tsid)
    }

    /// Finds or creates the thunk section that must immediately precede the given callee
    /// section (LA25-style placement).
    fn get_is_thunk_sec(
        &mut self,
        res: &mut ScanResources,
        isec: SectionId,
    ) -> Option<ThunkSectionId> {
        if let Some(&ts) = self.thunked_sections.get(&isec) {
            return Some(ts);
        }

        let section = res.sections.section(isec);
        let os_id = section.parent?;
        let os_idx = os_id.as_usize();
        let target_off = section.out_sec_off;

        let num_isds = res.output_sections[os_idx].isds.len();
        for isd_idx in 0..num_isds {
            let entries = res.output_sections[os_idx].isds[isd_idx].sections.clone();
            let Some(&first) = entries.first() else {
                continue;
            };
            let last = *entries.last().expect("non-empty");
            if target_off < self.entry_off(res, first) || self.entry_off(res, last) < target_off {
                continue;
            }

            let tsid = self.add_thunk_section(res, os_idx, &entries, target_off);
            let pass = self.pass;
            res.output_sections[os_idx].isds[isd_idx]
                .thunk_sections
                .push((tsid, pass));
            self.thunked_sections.insert(isec, tsid);
            return Some(tsid);
        }
        None
    }

    /// Pre-seed thunk sections at target-spacing intervals so that most thunks land in a
    /// section that plenty of callers can reach. The last section sits one spacing from the ISD
    /// end when the ISD is large, maximising short-thunk opportunities near the tail.
    fn create_initial_thunk_sections(&mut self, res: &mut ScanResources) {
        let Some(spacing) = res.target.thunk_section_spacing() else {
            return;
        };
        let spacing = u64::from(spacing);

        for os_idx in 0..res.output_sections.len() {
            if !res.output_sections[os_idx].is_executable() {
                continue;
            }
            let num_isds = res.output_sections[os_idx].isds.len();
            for isd_idx in 0..num_isds {
                let entries = res.output_sections[os_idx].isds[isd_idx].sections.clone();
                if entries.is_empty() {
                    continue;
                }

                let isd_begin = self.entry_off(res, entries[0]);
                let last = *entries.last().expect("non-empty");
                let isd_end = self.entry_off(res, last) + self.entry_size(res, last);

                let last_thunk_lower_bound = if isd_end - isd_begin > spacing * 2 {
                    isd_end - spacing
                } else {
                    u64::MAX
                };

                let mut isec_limit = isd_begin;
                let mut prev_isec_limit = isd_begin;
                let mut thunk_upper_bound = isd_begin + spacing;
                let mut new_sections = Vec::new();

                for &entry in &entries {
                    isec_limit = self.entry_off(res, entry) + self.entry_size(res, entry);
                    if isec_limit > thunk_upper_bound {
                        new_sections.push(self.add_thunk_section(
                            res,
                            os_idx,
                            &entries,
                            prev_isec_limit,
                        ));
                        thunk_upper_bound = prev_isec_limit + spacing;
                    }
                    if isec_limit > last_thunk_lower_bound {
                        break;
                    }
                    prev_isec_limit = isec_limit;
                }
                new_sections.push(self.add_thunk_section(res, os_idx, &entries, isec_limit));

                let pass = self.pass;
                res.output_sections[os_idx].isds[isd_idx]
                    .thunk_sections
                    .extend(new_sections.into_iter().map(|ts| (ts, pass)));
            }
        }
    }

    /// Recomputes thunk offsets within the section and the section size. Returns whether
    /// anything moved.
    fn assign_offsets(&mut self, res: &mut ScanResources, tsid: ThunkSectionId) -> bool {
        let ts = &self.thunk_sections[tsid.as_usize()];
        let thunk_ids = ts.thunks.clone();
        let old_size = ts.size;

        let mut off = 0u64;
        let mut changed = false;
        for t in thunk_ids {
            let thunk = &mut self.thunks[t.as_usize()];
            if thunk.offset != off {
                thunk.offset = off;
                changed = true;
            }
            let target_sym = thunk.target_sym;
            let size = thunk.size;
            let sym = res.symbols.symbol_mut(target_sym);
            sym.value = SymbolValue::Defined {
                section: Some(SectionRef::Thunk(tsid)),
                value: off,
                size: 0,
            };
            off += size;
        }

        let ts = &mut self.thunk_sections[tsid.as_usize()];
        if ts.size != off {
            ts.size = off;
            changed = true;
        }
        changed || old_size != off
    }

    /// Merges the thunk sections created this pass into their ISD's ordered section list,
    /// keeping everything sorted by output-section offset, with callee-anchored thunks placed
    /// immediately before their target.
    fn merge_thunks(&mut self, res: &mut ScanResources) {
        for os_idx in 0..res.output_sections.len() {
            if !res.output_sections[os_idx].is_executable() {
                continue;
            }
            let num_isds = res.output_sections[os_idx].isds.len();
            for isd_idx in 0..num_isds {
                if res.output_sections[os_idx].isds[isd_idx]
                    .thunk_sections
                    .is_empty()
                {
                    continue;
                }

                // Drop the empty pre-created sections.
                {
                    let thunk_sections = std::mem::take(
                        &mut res.output_sections[os_idx].isds[isd_idx].thunk_sections,
                    );
                    let kept: Vec<_> = thunk_sections
                        .into_iter()
                        .filter(|&(ts, _)| self.thunk_sections[ts.as_usize()].get_size() != 0)
                        .collect();
                    res.output_sections[os_idx].isds[isd_idx].thunk_sections = kept;
                }

                let mut new_thunks: Vec<ThunkSectionId> = res.output_sections[os_idx].isds
                    [isd_idx]
                    .thunk_sections
                    .iter()
                    .filter(|&&(_, pass)| pass == self.pass)
                    .map(|&(ts, _)| ts)
                    .collect();
                new_thunks
                    .sort_by_key(|&ts| self.thunk_sections[ts.as_usize()].out_sec_off);

                let old =
                    std::mem::take(&mut res.output_sections[os_idx].isds[isd_idx].sections);
                let merged = self.merge_sorted(res, old, new_thunks);
                res.output_sections[os_idx].isds[isd_idx].sections = merged;
            }
        }
    }

    /// The input section an anchored thunk section must precede, if any.
    fn target_input_section(&self, tsid: ThunkSectionId) -> Option<SectionId> {
        let ts = &self.thunk_sections[tsid.as_usize()];
        let &first = ts.thunks.first()?;
        self.thunks[first.as_usize()].target_input_section
    }

    fn merge_sorted(
        &self,
        res: &ScanResources,
        old: Vec<IsdEntry>,
        new_thunks: Vec<ThunkSectionId>,
    ) -> Vec<IsdEntry> {
        // A thunk section sorts before an entry at the same offset when it is anchored to that
        // entry, or when it is unanchored and the entry is an input section.
        let thunk_goes_first = |ts: ThunkSectionId, entry: IsdEntry| -> bool {
            let ts_off = self.thunk_sections[ts.as_usize()].out_sec_off;
            let entry_off = self.entry_off(res, entry);
            if ts_off < entry_off {
                return true;
            }
            if ts_off == entry_off {
                match self.target_input_section(ts) {
                    Some(anchor) => return entry == IsdEntry::Input(anchor),
                    None => return matches!(entry, IsdEntry::Input(_)),
                }
            }
            false
        };

        old.into_iter()
            .merge_by(
                new_thunks.into_iter().map(IsdEntry::Thunk),
                |&entry, &thunk_entry| {
                    let IsdEntry::Thunk(ts) = thunk_entry else {
                        return true;
                    };
                    !thunk_goes_first(ts, entry)
                },
            )
            .collect()
    }

    /// One thunk-placement pass over every executable section. Returns whether any addresses
    /// changed; the driver iterates until this settles at `false`.
    #[tracing::instrument(skip_all, fields(pass = self.pass))]
    pub fn create_thunks(&mut self, res: &mut ScanResources) -> Result<bool> {
        let mut addresses_changed = false;

        if self.pass == 0 && res.target.thunk_section_spacing().is_some() {
            self.create_initial_thunk_sections(res);
        }

        for os_idx in 0..res.output_sections.len() {
            if !res.output_sections[os_idx].is_executable() {
                continue;
            }
            let num_isds = res.output_sections[os_idx].isds.len();
            for isd_idx in 0..num_isds {
                let entries = res.output_sections[os_idx].isds[isd_idx].sections.clone();
                for entry in entries {
                    let IsdEntry::Input(isec) = entry else {
                        continue;
                    };
                    let (section_va, source_partition, num_rels) = {
                        let section = res.sections.section(isec);
                        let os_addr = section
                            .parent
                            .map_or(0, |os| res.output_sections[os.as_usize()].addr);
                        (
                            os_addr + section.out_sec_off,
                            section.partition,
                            section.relocations.len(),
                        )
                    };

                    for rel_idx in 0..num_rels {
                        let mut rel = res.sections.section(isec).relocations[rel_idx];
                        let src = section_va + rel.offset;

                        // A relocation that already went through a thunk only needs a range
                        // check; reverting it on failure lets a new thunk be picked below.
                        if self.pass > 0 && self.normalize_existing_thunk(res, &mut rel, src) {
                            res.sections.section_mut(isec).relocations[rel_idx] = rel;
                            continue;
                        }

                        let dst = self.destination_va(res, &rel);
                        let needs = {
                            let sym = res.symbols.symbol(rel.sym);
                            res.target.needs_thunk(
                                rel.expr,
                                rel.r_type,
                                Some(res.sections.section(isec).file),
                                src,
                                sym,
                                dst,
                                rel.addend,
                            )
                        };
                        if !needs {
                            res.sections.section_mut(isec).relocations[rel_idx] = rel;
                            continue;
                        }

                        let (t, is_new) = self.get_thunk(res, source_partition, &rel, src);

                        if is_new {
                            // Find or create a thunk section to hold the new thunk.
                            let tsid = match self.thunks[t.as_usize()].target_input_section {
                                Some(callee_sec) => {
                                    match self.get_is_thunk_sec(res, callee_sec) {
                                        Some(ts) => ts,
                                        None => self.get_isd_thunk_sec(
                                            res, os_idx, isd_idx, isec, &rel, src,
                                        )?,
                                    }
                                }
                                None => self
                                    .get_isd_thunk_sec(res, os_idx, isd_idx, isec, &rel, src)?,
                            };
                            self.thunk_sections[tsid.as_usize()].thunks.push(t);
                            let target_sym = self.thunks[t.as_usize()].target_sym;
                            res.symbols.symbol_mut(target_sym).value = SymbolValue::Defined {
                                section: Some(SectionRef::Thunk(tsid)),
                                value: 0,
                                size: 0,
                            };
                            self.active_thunks.insert(target_sym, t);
                        }

                        // Redirect the relocation to the thunk; we never go via the PLT to a
                        // thunk. A jump may be encoded as section-symbol + addend; clear the
                        // addend after redirection (MIPS keeps it for LA25 stubs).
                        rel.sym = self.thunks[t.as_usize()].target_sym;
                        rel.expr = relocations::from_plt(rel.expr);
                        if res.config.emachine != object::elf::EM_MIPS {
                            rel.addend = -get_pc_bias(res.config.emachine, rel.r_type);
                        }
                        res.sections.section_mut(isec).relocations[rel_idx] = rel;
                    }
                }

                let thunk_section_ids: Vec<ThunkSectionId> = res.output_sections[os_idx].isds
                    [isd_idx]
                    .thunk_sections
                    .iter()
                    .map(|&(ts, _)| ts)
                    .collect();
                for tsid in thunk_section_ids {
                    addresses_changed |= self.assign_offsets(res, tsid);
                }
            }
        }

        let anchored: Vec<ThunkSectionId> = self.thunked_sections.values().copied().collect();
        for tsid in anchored {
            addresses_changed |= self.assign_offsets(res, tsid);
        }

        self.merge_thunks(res);
        self.pass += 1;
        Ok(addresses_changed)
    }
}

/// Scans for relocations that will require a call to `__tls_get_addr`. Hexagon GD sequences
/// call it through a PLT-generating relocation against the TLS symbol itself.
pub fn hexagon_needs_tls_symbol(res: &ScanResources) -> bool {
    for os in res.output_sections.iter() {
        if !os.is_executable() {
            continue;
        }
        for isd in &os.isds {
            for &entry in &isd.sections {
                let IsdEntry::Input(isec) = entry else {
                    continue;
                };
                for rel in &res.sections.section(isec).relocations {
                    if res.symbols.symbol(rel.sym).is_tls() && rel.expr == RelExpr::PltPc {
                        return true;
                    }
                }
            }
        }
    }
    false
}

/// Rebinds Hexagon GD-PLT relocations to `__tls_get_addr` and gives it a PLT entry.
pub fn hexagon_tls_symbol_update(res: &mut ScanResources) {
    let Some(tls_get_addr) = res.symbols.find(b"__tls_get_addr") else {
        return;
    };
    let mut needs_entry = true;
    for os_idx in 0..res.output_sections.len() {
        if !res.output_sections[os_idx].is_executable() {
            continue;
        }
        let num_isds = res.output_sections[os_idx].isds.len();
        for isd_idx in 0..num_isds {
            let entries = res.output_sections[os_idx].isds[isd_idx].sections.clone();
            for entry in entries {
                let IsdEntry::Input(isec) = entry else {
                    continue;
                };
                let num_rels = res.sections.section(isec).relocations.len();
                for rel_idx in 0..num_rels {
                    let rel = res.sections.section(isec).relocations[rel_idx];
                    if res.symbols.symbol(rel.sym).is_tls() && rel.expr == RelExpr::PltPc {
                        if needs_entry {
                            crate::synthetic::add_plt_entry(res, tls_get_addr, PltFlavor::Plt);
                            needs_entry = false;
                        }
                        res.sections.section_mut(isec).relocations[rel_idx].sym = tls_get_addr;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aarch64::AArch64;
    use crate::config::Config;
    use crate::input_data::FileId;
    use crate::input_data::FileKind;
    use crate::mips::Mips;
    use crate::sections::InputSectionDescription;
    use crate::symbol_db::SymbolFlags;
    use crate::target::Target;
    use crate::target::TargetInfo;
    use crate::testing::TestEnv;
    use linker_utils::elf::shf;
    use object::elf;

    fn exec_flags() -> linker_utils::elf::SectionFlags {
        shf::ALLOC.with(shf::EXECINSTR)
    }

    /// Builds a caller section with one already-scanned branch relocation.
    fn add_caller<'data>(
        env: &mut TestEnv<'data>,
        file: FileId,
        out_sec_off: u64,
        rel: Relocation,
    ) -> SectionId {
        let sec = env.add_section(file, b".text.caller", exec_flags(), &[0; 8]);
        let section = env.sections.section_mut(sec);
        section.out_sec_off = out_sec_off;
        section.relocations.push(rel);
        sec
    }

    #[test]
    fn test_aarch64_thunk_reuse_and_convergence() {
        crate::testing::init_logging();
        let bump = bumpalo::Bump::new();
        let mut env = TestEnv::new(Config {
            emachine: elf::EM_AARCH64,
            ..Config::default()
        });
        let file = env.add_file("main.o", FileKind::Object);

        let far_os = env.add_output_section(".text.far", 0x900_0000, exec_flags());
        let far_sec = env.add_section(file, b".text.far", exec_flags(), &[0; 16]);
        env.sections.section_mut(far_sec).parent = Some(far_os);
        let (far_func, _) = env.add_symbol(
            file,
            TestEnv::defined_symbol(
                b"far_func",
                crate::symbol_db::SymbolKind::Func,
                far_sec,
                0,
                16,
            ),
        );

        let text_os = env.add_output_section(".text", 0x10000, exec_flags());
        let rel = Relocation {
            expr: RelExpr::Pc,
            r_type: elf::R_AARCH64_CALL26,
            offset: 0,
            addend: 0,
            sym: far_func,
        };
        let caller1 = add_caller(&mut env, file, 0, rel);
        let caller2 = add_caller(&mut env, file, 0x100, rel);
        env.sections.section_mut(caller1).parent = Some(text_os);
        env.sections.section_mut(caller2).parent = Some(text_os);

        env.output_sections[text_os.as_usize()]
            .isds
            .push(InputSectionDescription::from_sections([caller1, caller2]));
        env.output_sections[text_os.as_usize()].size = 0x108;
        env.output_sections[far_os.as_usize()]
            .isds
            .push(InputSectionDescription::from_sections([far_sec]));
        env.output_sections[far_os.as_usize()].size = 16;

        let target = AArch64;
        let mut creator = ThunkCreator::new();
        {
            let mut res = env.resources(&bump, &target);
            assert!(creator.create_thunks(&mut res).unwrap());
            assert!(!creator.create_thunks(&mut res).unwrap());
        }

        // Both callers were redirected to the same thunk target symbol.
        let sym1 = env.sections.section(caller1).relocations[0].sym;
        let sym2 = env.sections.section(caller2).relocations[0].sym;
        assert_eq!(sym1, sym2);
        assert_ne!(sym1, far_func);
        assert_eq!(
            env.symbols.symbol(sym1).name.bytes(),
            b"__thunk_far_func".as_slice()
        );
        assert_eq!(creator.thunks.len(), 1);

        // The thunk landed in a section merged into the ISD after the callers.
        let isd = &env.output_sections[text_os.as_usize()].isds[0];
        assert_eq!(isd.sections.len(), 3);
        assert!(matches!(isd.sections[2], IsdEntry::Thunk(_)));
    }

    #[test]
    fn test_thunk_reverts_when_out_of_range() {
        let bump = bumpalo::Bump::new();
        let mut env = TestEnv::new(Config {
            emachine: elf::EM_AARCH64,
            ..Config::default()
        });
        let file = env.add_file("main.o", FileKind::Object);

        let far_os = env.add_output_section(".text.far", 0x900_0000, exec_flags());
        let far_sec = env.add_section(file, b".text.far", exec_flags(), &[0; 16]);
        env.sections.section_mut(far_sec).parent = Some(far_os);
        let (far_func, _) = env.add_symbol(
            file,
            TestEnv::defined_symbol(
                b"far_func",
                crate::symbol_db::SymbolKind::Func,
                far_sec,
                0,
                16,
            ),
        );

        let text_os = env.add_output_section(".text", 0x10000, exec_flags());
        let rel = Relocation {
            expr: RelExpr::Pc,
            r_type: elf::R_AARCH64_CALL26,
            offset: 0,
            addend: 0,
            sym: far_func,
        };
        let caller = add_caller(&mut env, file, 0, rel);
        env.sections.section_mut(caller).parent = Some(text_os);
        env.output_sections[text_os.as_usize()]
            .isds
            .push(InputSectionDescription::from_sections([caller]));
        env.output_sections[far_os.as_usize()]
            .isds
            .push(InputSectionDescription::from_sections([far_sec]));

        let target = AArch64;
        let mut creator = ThunkCreator::new();
        {
            let mut res = env.resources(&bump, &target);
            assert!(creator.create_thunks(&mut res).unwrap());
        }
        let thunk_sym = env.sections.section(caller).relocations[0].sym;
        assert_ne!(thunk_sym, far_func);

        // Simulate a layout shift that moves the caller far away from its thunk but close to
        // the original callee.
        env.sections.section_mut(caller).out_sec_off = 0x810_0000;
        {
            let mut res = env.resources(&bump, &target);
            creator.create_thunks(&mut res).unwrap();
        }

        // The relocation was reverted to its original destination, which is now reachable.
        assert_eq!(env.sections.section(caller).relocations[0].sym, far_func);
        assert_eq!(env.sections.section(caller).relocations[0].addend, 0);
    }

    #[test]
    fn test_thunks_not_reused_across_partitions() {
        let bump = bumpalo::Bump::new();
        let mut env = TestEnv::new(Config {
            emachine: elf::EM_AARCH64,
            ..Config::default()
        });
        let file = env.add_file("main.o", FileKind::Object);

        let far_os = env.add_output_section(".text.far", 0x900_0000, exec_flags());
        let far_sec = env.add_section(file, b".text.far", exec_flags(), &[0; 16]);
        env.sections.section_mut(far_sec).parent = Some(far_os);
        let (far_func, _) = env.add_symbol(
            file,
            TestEnv::defined_symbol(
                b"far_func",
                crate::symbol_db::SymbolKind::Func,
                far_sec,
                0,
                16,
            ),
        );
        env.output_sections[far_os.as_usize()]
            .isds
            .push(InputSectionDescription::from_sections([far_sec]));

        let rel = Relocation {
            expr: RelExpr::Pc,
            r_type: elf::R_AARCH64_CALL26,
            offset: 0,
            addend: 0,
            sym: far_func,
        };

        // The partition-2 caller is processed first and creates a partition-2 thunk; the main
        // partition caller must not reuse it.
        let os2 = env.add_output_section(".text.p2", 0x10000, exec_flags());
        env.output_sections[os2.as_usize()].partition = 2;
        let caller2 = add_caller(&mut env, file, 0, rel);
        env.sections.section_mut(caller2).partition = 2;
        env.sections.section_mut(caller2).parent = Some(os2);
        env.output_sections[os2.as_usize()]
            .isds
            .push(InputSectionDescription::from_sections([caller2]));

        let os1 = env.add_output_section(".text", 0x20000, exec_flags());
        let caller1 = add_caller(&mut env, file, 0, rel);
        env.sections.section_mut(caller1).parent = Some(os1);
        env.output_sections[os1.as_usize()]
            .isds
            .push(InputSectionDescription::from_sections([caller1]));

        let target = AArch64;
        let mut creator = ThunkCreator::new();
        {
            let mut res = env.resources(&bump, &target);
            creator.create_thunks(&mut res).unwrap();
        }

        let sym2 = env.sections.section(caller2).relocations[0].sym;
        let sym1 = env.sections.section(caller1).relocations[0].sym;
        assert_ne!(sym1, sym2);
        assert_eq!(creator.thunks.len(), 2);
    }

    /// MIPS-style target whose branches always need a thunk anchored to the callee.
    struct La25Target;

    impl Target for La25Target {
        fn info(&self) -> &TargetInfo {
            Mips.info()
        }

        fn get_rel_expr(
            &self,
            r_type: RelType,
            sym: &Symbol,
            loc: &[u8],
        ) -> crate::error::Result<RelExpr> {
            Mips.get_rel_expr(r_type, sym, loc)
        }

        fn needs_thunk(
            &self,
            _expr: RelExpr,
            r_type: RelType,
            _file: Option<FileId>,
            _src: u64,
            _sym: &Symbol,
            _sym_va: u64,
            _addend: i64,
        ) -> bool {
            r_type == elf::R_MIPS_26
        }
    }

    #[test]
    fn test_mips_la25_thunk_precedes_callee() {
        let bump = bumpalo::Bump::new();
        let mut env = TestEnv::new(Config {
            emachine: elf::EM_MIPS,
            ..Config::default()
        });
        let file = env.add_file("main.o", FileKind::Object);

        let text_os = env.add_output_section(".text", 0x10000, exec_flags());
        let callee_sec = env.add_section(file, b".text.pic", exec_flags(), &[0; 16]);
        {
            let section = env.sections.section_mut(callee_sec);
            section.out_sec_off = 0x40;
            section.parent = Some(text_os);
        }
        let (callee, _) = env.add_symbol(
            file,
            TestEnv::defined_symbol(
                b"pic_func",
                crate::symbol_db::SymbolKind::Func,
                callee_sec,
                0,
                16,
            ),
        );

        let caller = add_caller(
            &mut env,
            file,
            0,
            Relocation {
                expr: RelExpr::Abs,
                r_type: elf::R_MIPS_26,
                offset: 0,
                addend: 8,
                sym: callee,
            },
        );
        env.sections.section_mut(caller).parent = Some(text_os);
        env.output_sections[text_os.as_usize()]
            .isds
            .push(InputSectionDescription::from_sections([caller, callee_sec]));

        let target = La25Target;
        let mut creator = ThunkCreator::new();
        {
            let mut res = env.resources(&bump, &target);
            assert!(creator.create_thunks(&mut res).unwrap());
            assert!(!creator.create_thunks(&mut res).unwrap());
        }

        // The thunk section is anchored immediately before the callee, and the MIPS addend is
        // preserved for the stub.
        let isd = &env.output_sections[text_os.as_usize()].isds[0];
        let thunk_pos = isd
            .sections
            .iter()
            .position(|e| matches!(e, IsdEntry::Thunk(_)))
            .unwrap();
        assert_eq!(isd.sections[thunk_pos + 1], IsdEntry::Input(callee_sec));
        assert_eq!(env.sections.section(caller).relocations[0].addend, 8);
        assert_ne!(env.sections.section(caller).relocations[0].sym, callee);
    }

    #[test]
    fn test_hexagon_tls_symbol_update() {
        let bump = bumpalo::Bump::new();
        let mut env = TestEnv::new(Config::default());
        let file = env.add_file("main.o", FileKind::Object);

        let libc_text = env.add_section(file, b".text.libc", exec_flags(), &[0; 8]);
        let (tga, _) = env.add_symbol(
            file,
            TestEnv::defined_symbol(
                b"__tls_get_addr",
                crate::symbol_db::SymbolKind::Func,
                libc_text,
                0,
                8,
            ),
        );

        let tdata = env.add_section(
            file,
            b".tdata",
            shf::ALLOC.with(shf::WRITE).with(shf::TLS),
            &[0; 8],
        );
        let (tls_var, _) = env.add_symbol(
            file,
            TestEnv::defined_symbol(b"tls_var", crate::symbol_db::SymbolKind::Tls, tdata, 0, 4),
        );

        let text_os = env.add_output_section(".text", 0x10000, exec_flags());
        let caller = add_caller(
            &mut env,
            file,
            0,
            Relocation {
                expr: RelExpr::PltPc,
                r_type: 0,
                offset: 0,
                addend: 0,
                sym: tls_var,
            },
        );
        env.sections.section_mut(caller).parent = Some(text_os);
        env.output_sections[text_os.as_usize()]
            .isds
            .push(InputSectionDescription::from_sections([caller]));

        let target = crate::x86_64::X86_64;
        {
            let mut res = env.resources(&bump, &target);
            assert!(hexagon_needs_tls_symbol(&res));
            hexagon_tls_symbol_update(&mut res);
            assert!(!hexagon_needs_tls_symbol(&res));
        }

        assert_eq!(env.sections.section(caller).relocations[0].sym, tga);
        assert_eq!(env.synthetic.plt.num_entries(), 1);
        assert!(env.symbols.symbol(tga).flags.contains(SymbolFlags::IN_PLT));
    }
}
