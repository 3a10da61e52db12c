//! The per-relocation scanner.
//!
//! `scan_relocations` walks the raw relocation records of one input section and decides, for
//! each, whether it resolves at link time or needs help from the dynamic loader. Along the way
//! it grows the synthetic sections, applies TLS and PIC relaxations, reserves copy-relocation
//! space and collects undefined-symbol diagnostics. Every relocation ends up as either a record
//! on the section's relocation list, an entry in a synthetic section (possibly with bookkeeping
//! relocations of its own), or a diagnostic; none are silently dropped.

use crate::bail;
use crate::copy_relocations;
use crate::error::Result;
use crate::input_data::FileId;
use crate::resources::ScanResources;
use crate::sections::DEAD_PIECE;
use crate::sections::EhSectionPiece;
use crate::sections::RawRelocation;
use crate::sections::RelFormat;
use crate::sections::Relocation;
use crate::sections::SectionId;
use crate::sections::SectionKind;
use crate::sections::SectionRef;
use crate::symbol_db::SymbolFlags;
use crate::symbol_db::SymbolId;
use crate::symbol_db::SymbolKind;
use crate::symbol_db::SymbolValue;
use crate::synthetic;
use crate::synthetic::PltFlavor;
use crate::synthetic::SyntheticKind;
use crate::tls;
use crate::undefined;
use linker_utils::elf::hexagon;
use linker_utils::elf::ppc64;
use linker_utils::elf::rel_type_to_string;
use linker_utils::elf::RelExpr;
use linker_utils::elf::RelType;
use linker_utils::one_of;

/// Translates offsets in an input section to offsets in its output section.
///
/// `.eh_frame` sections are mergeable, so their input offsets don't map linearly; each offset
/// must be located in its piece. Relocations are presented in non-decreasing offset order, so a
/// cursor over the sorted pieces does the job in linear time overall.
pub(crate) struct OffsetGetter {
    pieces: Vec<EhSectionPiece>,
    i: usize,
}

impl OffsetGetter {
    pub(crate) fn new(pieces: Vec<EhSectionPiece>) -> Self {
        OffsetGetter { pieces, i: 0 }
    }

    /// Returns `DEAD_PIECE` when the offset lands in a garbage-collected piece. Offsets must
    /// not decrease between calls.
    pub(crate) fn get(&mut self, off: u64) -> Result<u64> {
        if self.pieces.is_empty() {
            return Ok(off);
        }

        while self.i != self.pieces.len()
            && self.pieces[self.i].input_off + self.pieces[self.i].size <= off
        {
            self.i += 1;
        }
        if self.i == self.pieces.len() {
            bail!(".eh_frame: relocation is not in any piece");
        }

        // Pieces are contiguous, so a backwards offset is the only way to miss.
        let piece = &self.pieces[self.i];
        if piece.input_off > off {
            bail!(".eh_frame: relocation offsets went backwards");
        }

        if piece.output_off == DEAD_PIECE {
            return Ok(DEAD_PIECE);
        }
        Ok(piece.output_off + (off - piece.input_off))
    }

    fn into_pieces(self) -> Vec<EhSectionPiece> {
        self.pieces
    }
}

/// Returns true if the expression refers to a PLT entry.
pub(crate) fn needs_plt(expr: RelExpr) -> bool {
    one_of!(expr, PltPc, Ppc32PltRel, Ppc64CallPlt, Plt)
}

/// Returns true if the expression refers to a GOT entry. TLS variables use the GOT differently
/// and are deliberately not in this set.
pub(crate) fn needs_got(expr: RelExpr) -> bool {
    one_of!(
        expr,
        Got,
        GotOff,
        MipsGotLocalPage,
        MipsGotOff,
        MipsGotOff32,
        AArch64GotPagePc,
        GotPc,
        GotPlt,
        AArch64GotPage
    )
}

/// True for expressions of the form Sym - X, where X is a position in the file (the place, the
/// GOT base, ...).
pub(crate) fn is_rel_expr(expr: RelExpr) -> bool {
    one_of!(
        expr,
        Pc,
        GotRel,
        GotPltRel,
        MipsGotRel,
        Ppc64Call,
        Ppc64RelaxToc,
        AArch64PagePc,
        RelaxGotPc,
        RiscvPcIndirect,
        Ppc64RelaxGotPc,
        CheriCapTableRel
    )
}

fn is_absolute_value(res: &ScanResources, sym_id: SymbolId) -> bool {
    let sym = res.symbols.symbol(sym_id);
    sym.is_absolute() || sym.is_tls()
}

pub(crate) fn to_plt(expr: RelExpr) -> RelExpr {
    match expr {
        RelExpr::Ppc64Call => RelExpr::Ppc64CallPlt,
        RelExpr::Pc => RelExpr::PltPc,
        RelExpr::Abs => RelExpr::Plt,
        _ => expr,
    }
}

/// We decided not to use a PLT. Optimise a reference to the PLT into a reference to the symbol
/// itself.
pub(crate) fn from_plt(expr: RelExpr) -> RelExpr {
    match expr {
        RelExpr::PltPc | RelExpr::Ppc32PltRel => RelExpr::Pc,
        RelExpr::Ppc64CallPlt => RelExpr::Ppc64Call,
        RelExpr::Plt => RelExpr::Abs,
        _ => expr,
    }
}

fn defined_location(res: &ScanResources, sym_id: SymbolId) -> String {
    let sym = res.symbols.symbol(sym_id);
    match sym.file {
        Some(file) => format!("\n>>> defined in {}", res.files.file(file).name),
        None => String::new(),
    }
}

/// Builds the ">>> defined in ... >>> referenced by ..." trailer for diagnostics.
pub(crate) fn get_location(
    res: &ScanResources,
    section_id: SectionId,
    sym_id: SymbolId,
    offset: u64,
) -> String {
    let section = res.sections.section(section_id);
    let file = res.files.file(section.file);
    format!(
        "{}\n>>> referenced by {}:({}+0x{offset:x})",
        defined_location(res, sym_id),
        file.name,
        String::from_utf8_lossy(section.name),
    )
}

fn symbol_for_message(res: &ScanResources, sym_id: SymbolId) -> String {
    let sym = res.symbols.symbol(sym_id);
    if sym.name.bytes().is_empty() {
        "local symbol".to_string()
    } else {
        format!("symbol: {}", sym.name_for_display())
    }
}

/// Decides whether a (expression, symbol, section) combination can be computed now, at link
/// time. When this returns false, a dynamic relocation is needed so the value gets fixed at
/// load time.
fn is_static_link_time_constant(
    res: &mut ScanResources,
    expr: RelExpr,
    r_type: RelType,
    sym_id: SymbolId,
    section_id: SectionId,
    rel_off: u64,
) -> bool {
    // These expressions always compute a constant: offsets within synthetic tables the linker
    // itself lays out, PC-relative references to linker-allocated entries, and hints.
    if one_of!(
        expr,
        DtpRel,
        GotPlt,
        GotOff,
        TlsLdGotOff,
        CheriCapTableIndex,
        CheriCapTableIndexSmallImm,
        CheriCapTableIndexCall,
        CheriCapTableIndexCallSmallImm,
        CheriCapTableEntryPc,
        CheriCapTableRel,
        MipsGotLocalPage,
        MipsGotRel,
        MipsGotOff,
        MipsGotOff32,
        MipsGotGpPc,
        MipsTlsGd,
        AArch64GotPagePc,
        AArch64GotPage,
        GotPc,
        GotOnlyPc,
        GotPltOnlyPc,
        PltPc,
        TlsGdGot,
        TlsGdGotPlt,
        TlsGdPc,
        Ppc32PltRel,
        Ppc64CallPlt,
        Ppc64RelaxToc,
        RiscvAdd,
        TlsDescCall,
        TlsDescPc,
        AArch64TlsDescPage,
        TlsLdHint,
        TlsIeHint
    ) {
        return true;
    }

    // Capability relocations are never constants: even when the value is known, the tag bit
    // cannot be written statically.
    if expr == RelExpr::CheriCapability {
        return false;
    }

    // These never are, except if the entire output is position dependent or only the low page
    // bits of the value are used.
    if one_of!(expr, Got, Plt, TlsDesc) {
        return res.target.uses_only_low_page_bits(r_type) || !res.config.is_pic();
    }

    if res.symbols.symbol(sym_id).is_preemptible {
        return false;
    }
    if !res.config.is_pic() {
        return true;
    }

    // The size of a non-preemptible symbol is a constant.
    if expr == RelExpr::Size {
        return true;
    }

    let abs_val = is_absolute_value(res, sym_id);
    let rel_e = is_rel_expr(expr);
    if abs_val && !rel_e {
        return true;
    }
    if !abs_val && rel_e {
        return true;
    }
    if !abs_val && !rel_e {
        return res.target.uses_only_low_page_bits(r_type);
    }

    // absolute value in a position-relative expression. A hidden undefined weak still works: the
    // call will be guarded by a comparison against a zero loaded from the GOT.
    let sym = res.symbols.symbol(sym_id);
    if sym.is_undef_weak() {
        return true;
    }

    // Linker-script symbols get their final values late but they are still constants.
    if sym.script_defined {
        return true;
    }

    let message = format!(
        "relocation {} cannot refer to absolute symbol: {}{}",
        rel_type_to_string(res.config.emachine, r_type),
        res.symbols.symbol(sym_id).name_for_display(),
        get_location(res, section_id, sym_id, rel_off),
    );
    res.diagnostics.error(message);
    true
}

fn get_mips_pair_type(r_type: RelType, is_local: bool) -> RelType {
    use linker_utils::elf::mips;
    match r_type {
        object::elf::R_MIPS_HI16 => object::elf::R_MIPS_LO16,
        // A global GOT16 has its own GOT entry and no pair. A local GOT16 holds the high 16
        // bits of the value and pairs with a LO16, which lets one GOT entry serve 64 KiB of
        // local data.
        object::elf::R_MIPS_GOT16 => {
            if is_local {
                object::elf::R_MIPS_LO16
            } else {
                object::elf::R_MIPS_NONE
            }
        }
        mips::R_MICROMIPS_GOT16 => {
            if is_local {
                mips::R_MICROMIPS_LO16
            } else {
                object::elf::R_MIPS_NONE
            }
        }
        mips::R_MIPS_PCHI16 => mips::R_MIPS_PCLO16,
        mips::R_MICROMIPS_HI16 => mips::R_MICROMIPS_LO16,
        _ => object::elf::R_MIPS_NONE,
    }
}

/// MIPS computes addends from "paired" relocations: a HI16 must be combined with the implicit
/// addend of the matching LO16 further along in the relocation array.
fn compute_mips_addend(
    res: &mut ScanResources,
    rels: &[RawRelocation],
    index: usize,
    data: &[u8],
    format: RelFormat,
    expr: RelExpr,
    is_local: bool,
    file_id: FileId,
) -> i64 {
    if expr == RelExpr::MipsGotRel && is_local {
        return res.files.file(file_id).mips_gp0;
    }

    // The ABI only uses pairing for REL.
    if format == RelFormat::Rela {
        return 0;
    }

    let rel = &rels[index];
    let pair_type = get_mips_pair_type(rel.r_type, is_local);
    if pair_type == object::elf::R_MIPS_NONE {
        return 0;
    }

    // Paired relocations aren't necessarily contiguous in the table, so scan forward.
    for candidate in &rels[index..] {
        if candidate.r_type == pair_type && candidate.sym_index == rel.sym_index {
            let buf = data.get(candidate.r_offset as usize..).unwrap_or(&[]);
            return res.target.get_implicit_addend(buf, pair_type);
        }
    }

    res.diagnostics.warn(format!(
        "can't find matching {} relocation for {}",
        rel_type_to_string(res.config.emachine, pair_type),
        rel_type_to_string(res.config.emachine, rel.r_type),
    ));
    0
}

/// Returns the addend of a relocation: explicit for RELA inputs, read from the relocated
/// location for REL inputs, with the MIPS pairing and PPC64 TOC adjustments applied.
fn compute_addend(
    res: &mut ScanResources,
    rels: &[RawRelocation],
    index: usize,
    data: &[u8],
    format: RelFormat,
    expr: RelExpr,
    is_local: bool,
    file_id: FileId,
) -> i64 {
    let rel = &rels[index];
    let mut addend = match format {
        RelFormat::Rela => rel.addend,
        RelFormat::Rel => {
            let buf = data.get(rel.r_offset as usize..).unwrap_or(&[]);
            res.target.get_implicit_addend(buf, rel.r_type)
        }
    };

    if res.config.emachine == object::elf::EM_PPC64
        && res.config.is_pic()
        && rel.r_type == ppc64::R_PPC64_TOC
    {
        // The TOC base sits 0x8000 past the start of the GOT so that 16-bit signed offsets can
        // address all of the first 64 KiB.
        addend += (res.synthetic.got.address + 0x8000) as i64;
    }
    if res.config.emachine == object::elf::EM_MIPS {
        addend += compute_mips_addend(res, rels, index, data, format, expr, is_local, file_id);
    }

    addend
}

fn is_ppc64_small_code_model_toc_reloc(r_type: RelType) -> bool {
    r_type == ppc64::R_PPC64_TOC16 || r_type == ppc64::R_PPC64_TOC16_DS
}

/// The PPC64 marker relocations `R_PPC64_TLSGD`/`R_PPC64_TLSLD` identify relaxable
/// `__tls_get_addr` call sequences. GD/LD GOT relocations without markers come from very old
/// IBM XL compilers; relaxing those sequences would corrupt them, so the whole file opts out.
fn check_ppc64_tls_relax(res: &mut ScanResources, file_id: FileId, rels: &[RawRelocation]) {
    if res.files.file(file_id).ppc64_disable_tls_relax {
        return;
    }
    let mut has_gdld = false;
    for rel in rels {
        match rel.r_type {
            ppc64::R_PPC64_TLSGD | ppc64::R_PPC64_TLSLD => return,
            ppc64::R_PPC64_GOT_TLSGD16
            | ppc64::R_PPC64_GOT_TLSGD16_HA
            | ppc64::R_PPC64_GOT_TLSGD16_HI
            | ppc64::R_PPC64_GOT_TLSGD16_LO
            | ppc64::R_PPC64_GOT_TLSLD16
            | ppc64::R_PPC64_GOT_TLSLD16_HA
            | ppc64::R_PPC64_GOT_TLSLD16_HI
            | ppc64::R_PPC64_GOT_TLSLD16_LO => has_gdld = true,
            _ => {}
        }
    }
    if has_gdld {
        let file = res.files.file_mut(file_id);
        file.ppc64_disable_tls_relax = true;
        let name = file.name.clone();
        res.diagnostics.warn(format!(
            "{name}: disable TLS relaxation due to R_PPC64_GOT_TLS* relocations without \
             R_PPC64_TLSGD/R_PPC64_TLSLD relocations"
        ));
    }
}

/// MIPS N32 treats a run of relocations at the same offset as one compound relocation; pack the
/// types into a single value, one per byte. Returns the compound type and the number of records
/// consumed.
fn get_mips_n32_rel_type(rels: &[RawRelocation], index: usize) -> (RelType, usize) {
    let offset = rels[index].r_offset;
    let mut r_type: RelType = 0;
    let mut n = 0;
    while index + n < rels.len() && rels[index + n].r_offset == offset {
        if n < 4 {
            r_type |= rels[index + n].r_type << (8 * n);
        }
        n += 1;
    }
    (r_type, n.max(1))
}

/// The tail of per-relocation processing: given the final expression, decide between a verbatim
/// record, a relative or symbolic dynamic relocation, a copy relocation, a canonical PLT entry,
/// or a diagnostic.
fn process_reloc_aux(
    res: &mut ScanResources,
    section_id: SectionId,
    expr: RelExpr,
    r_type: RelType,
    offset: u64,
    sym_id: SymbolId,
    addend: i64,
) -> Result {
    // Undefined weak references have implementation-defined behaviour: for -no-pie we resolve
    // them statically (to zero), for -pie and -shared we produce dynamic relocations, matching
    // the handling of GOT-generating relocations.
    if is_static_link_time_constant(res, expr, r_type, sym_id, section_id, offset)
        || (!res.config.is_pic()
            && res.symbols.symbol(sym_id).is_undef_weak()
            && expr != RelExpr::CheriCapability)
    {
        res.sections.section_mut(section_id).relocations.push(Relocation {
            expr,
            r_type,
            offset,
            addend,
            sym: sym_id,
        });
        return Ok(());
    }

    let can_write = res.sections.section(section_id).is_writable() || !res.config.z_text;

    if expr == RelExpr::CheriCapability {
        if !can_write {
            let message = format!(
                "attempting to add a capability relocation against {}{} in a read-only section; \
                 pass -Wl,-z,notext if you really want to do this",
                symbol_for_message(res, sym_id),
                get_location(res, section_id, sym_id, offset),
            );
            res.diagnostics.error_or_warn(message);
            return Ok(());
        }
        res.synthetic.cap_relocs.add(
            (SectionRef::Input(section_id), offset),
            sym_id,
            addend,
        );
        return Ok(());
    }

    if can_write {
        let info = *res.target.info();
        let mut dyn_rel = res.target.get_dyn_rel(r_type);
        let preemptible = res.symbols.symbol(sym_id).is_preemptible;
        if expr == RelExpr::Got || (dyn_rel == info.symbolic_rel && !preemptible) {
            synthetic::add_relative_reloc(
                res,
                SectionRef::Input(section_id),
                offset,
                sym_id,
                addend,
                expr,
                r_type,
            );
            return Ok(());
        } else if dyn_rel != 0 {
            // The MIPS ABI fills GOT entries from a sorted dynamic symbol table instead of from
            // dynamic relocations, and any symbol with a dynamic relocation needs a GOT entry
            // so the loader has somewhere to resolve it through.
            if res.config.emachine == object::elf::EM_MIPS && dyn_rel == info.symbolic_rel {
                dyn_rel = info.relative_rel;
            }
            res.synthetic.rela_dyn.add_symbol_reloc(
                dyn_rel,
                SectionRef::Input(section_id),
                offset,
                sym_id,
                addend,
            );

            if res.config.emachine == object::elf::EM_MIPS {
                res.synthetic.mips_got.add_entry(sym_id, addend, preemptible);
            }
            return Ok(());
        }
    }

    // When producing an executable we can still rescue the reference with a copy relocation
    // (data) or a canonical PLT entry (functions).
    if !res.config.shared {
        if !copy_relocations::can_define_symbol_in_executable(res, sym_id) {
            let message = format!(
                "cannot preempt symbol: {}{}",
                res.symbols.symbol(sym_id).name_for_display(),
                get_location(res, section_id, sym_id, offset),
            );
            res.diagnostics.error_or_warn(message);
            return Ok(());
        }

        if res.symbols.symbol(sym_id).is_object() {
            if res.symbols.symbol(sym_id).is_shared() {
                if !res.config.z_copyreloc {
                    let message = format!(
                        "unresolvable relocation {} against symbol '{}'; recompile with -fPIC \
                         or remove '-z nocopyreloc'{}",
                        rel_type_to_string(res.config.emachine, r_type),
                        res.symbols.symbol(sym_id).name_for_display(),
                        get_location(res, section_id, sym_id, offset),
                    );
                    res.diagnostics.error(message);
                }
                copy_relocations::add_copy_rel_symbol(res, sym_id)?;
            }
            res.sections.section_mut(section_id).relocations.push(Relocation {
                expr,
                r_type,
                offset,
                addend,
                sym: sym_id,
            });
            return Ok(());
        }

        // A non-PIC call into a shared library. Create a PLT entry and use it as the function's
        // value everywhere; the loader sees the non-zero st_value of the undefined symbol and
        // resolves every module to the same address, keeping pointer equality.
        if res.symbols.symbol(sym_id).is_func() {
            if res.config.pie && res.config.emachine == object::elf::EM_386 {
                let message = format!(
                    "symbol '{}' cannot be preempted; recompile with -fPIE{}",
                    res.symbols.symbol(sym_id).name_for_display(),
                    get_location(res, section_id, sym_id, offset),
                );
                res.diagnostics.error_or_warn(message);
            }
            if !res.symbols.symbol(sym_id).is_in_plt() {
                synthetic::add_plt_entry(res, sym_id, PltFlavor::Plt);
            }
            if !res.symbols.symbol(sym_id).is_defined() {
                let info = res.target.info();
                let plt_index = res.symbols.symbol(sym_id).plt_index.expect("just added");
                let value = info.plt_header_size + info.plt_entry_size * u64::from(plt_index);
                copy_relocations::replace_with_defined(
                    res,
                    sym_id,
                    SectionRef::Synthetic(SyntheticKind::Plt),
                    value,
                    0,
                );
            }
            res.symbols.symbol_mut(sym_id).flags |= SymbolFlags::NEEDS_PLT_ADDR;
            res.sections.section_mut(section_id).relocations.push(Relocation {
                expr,
                r_type,
                offset,
                addend,
                sym: sym_id,
            });
            return Ok(());
        }
    }

    if res.config.is_pic() {
        let message = if !can_write && !is_rel_expr(expr) {
            format!(
                "can't create dynamic relocation {} against {} in readonly segment; recompile \
                 object files with -fPIC or pass '-Wl,-z,notext' to allow text relocations in \
                 the output{}",
                rel_type_to_string(res.config.emachine, r_type),
                symbol_for_message(res, sym_id),
                get_location(res, section_id, sym_id, offset),
            )
        } else {
            format!(
                "relocation {} cannot be used against {}; recompile with -fPIC{}",
                rel_type_to_string(res.config.emachine, r_type),
                symbol_for_message(res, sym_id),
                get_location(res, section_id, sym_id, offset),
            )
        };
        res.diagnostics.error_or_warn(message);
        return Ok(());
    }

    let message = format!(
        "symbol '{}' has no type{}",
        res.symbols.symbol(sym_id).name_for_display(),
        get_location(res, section_id, sym_id, offset),
    );
    res.diagnostics.error_or_warn(message);
    Ok(())
}

struct SectionView<'data> {
    file_id: FileId,
    data: &'data [u8],
    format: RelFormat,
}

/// Processes the relocation at `rels[index]`. Returns how many records were consumed (at least
/// one; MIPS N32 compounds and relaxed TLS sequences consume more).
fn scan_reloc(
    res: &mut ScanResources,
    section_id: SectionId,
    view: &SectionView,
    getter: &mut OffsetGetter,
    rels: &[RawRelocation],
    index: usize,
) -> Result<usize> {
    let rel = rels[index];
    let mut consumed = 1;

    let r_type = if res.config.mips_n32_abi {
        let (compound, n) = get_mips_n32_rel_type(rels, index);
        consumed = n;
        compound
    } else {
        rel.r_type
    };

    let file = res.files.file(view.file_id);
    let Some(&sym_id) = file.symbols.get(rel.sym_index as usize) else {
        bail!(
            "invalid symbol index {} in relocation in {}",
            rel.sym_index,
            file.name
        );
    };

    let offset = getter.get(rel.r_offset)?;
    if offset == DEAD_PIECE {
        return Ok(consumed);
    }

    // Index 0 may be used by marker relocations; don't report those as undefined.
    if rel.sym_index != 0
        && undefined::maybe_report_undefined(res, sym_id, section_id, rel.r_offset)
    {
        return Ok(consumed);
    }

    let loc = view.data.get(rel.r_offset as usize..).unwrap_or(&[]);
    let expr = match res.target.get_rel_expr(r_type, res.symbols.symbol(sym_id), loc) {
        Ok(expr) => expr,
        Err(e) => {
            let message = format!("{e}{}", get_location(res, section_id, sym_id, offset));
            res.diagnostics.error_or_warn(message);
            return Ok(consumed);
        }
    };

    // Ignore R_*_NONE and other marker relocations.
    if expr == RelExpr::None {
        return Ok(consumed);
    }

    let is_local = res.symbols.symbol(sym_id).is_local();
    let mut addend = compute_addend(
        res,
        rels,
        index,
        view.data,
        view.format,
        expr,
        is_local,
        view.file_id,
    );
    let mut offset = offset;

    if res.config.emachine == object::elf::EM_PPC64 {
        // Small-code-model relocations address the compiler's .toc directly; those sections
        // must sort before the linker-allocated GOT entries, so remember that this file has
        // them.
        if is_ppc64_small_code_model_toc_reloc(r_type) {
            res.files.file_mut(view.file_id).ppc64_small_code_model_toc_relocs = true;
        }

        // Record the TOC entry (.toc + addend) as not relaxable.
        if r_type == ppc64::R_PPC64_TOC16_LO {
            let sym = res.symbols.symbol(sym_id);
            if sym.kind == SymbolKind::Section {
                if let SymbolValue::Defined {
                    section: Some(SectionRef::Input(def_sec)),
                    ..
                } = sym.value
                {
                    if res.sections.section(def_sec).name == b".toc" {
                        res.ppc64_no_toc_relax.insert((sym_id, addend));
                    }
                }
            }
        }

        if (r_type == ppc64::R_PPC64_TLSGD && expr == RelExpr::TlsDescCall)
            || (r_type == ppc64::R_PPC64_TLSLD && expr == RelExpr::TlsLdHint)
        {
            if index + 1 == rels.len() {
                let message = format!(
                    "R_PPC64_TLSGD/R_PPC64_TLSLD may not be the last relocation{}",
                    get_location(res, section_id, sym_id, offset),
                );
                res.diagnostics.error_or_warn(message);
                return Ok(consumed);
            }

            // Offset the 4-byte aligned marker by one byte in the NOTOC case so the writer can
            // tell the two call-sequence shapes apart.
            if rels[index + 1].r_type == ppc64::R_PPC64_REL24_NOTOC {
                offset += 1;
            }
        }
    }

    // If a PLT entry would resolve within this module anyway, skip the PLT and jump straight to
    // the destination.
    let mut expr = expr;
    {
        let sym = res.symbols.symbol(sym_id);
        if !sym.is_preemptible && (!sym.is_ifunc() || res.config.z_ifunc_noplt) {
            if expr != RelExpr::GotPc {
                // The 0x8000 bit of the PPC32 PLTREL addend selects the call-stub type; once
                // optimised to a plain PC-relative reference it must be dropped.
                if res.config.emachine == object::elf::EM_PPC && expr == RelExpr::Ppc32PltRel {
                    addend &= !0x8000;
                }
                // A Hexagon GDPLT call becomes a call to __tls_get_addr even when the symbol is
                // non-preemptible; leave those alone.
                let is_hexagon_gd_plt = res.config.emachine == linker_utils::elf::EM_HEXAGON
                    && matches!(
                        r_type,
                        hexagon::R_HEX_GD_PLT_B22_PCREL
                            | hexagon::R_HEX_GD_PLT_B22_PCREL_X
                            | hexagon::R_HEX_GD_PLT_B32_PCREL_X
                    );
                if !is_hexagon_gd_plt {
                    expr = from_plt(expr);
                }
            } else if !is_absolute_value(res, sym_id) {
                expr = res.target.adjust_got_pc_expr(r_type, addend, loc);
            }
        }
    }

    // Relocations that don't create a GOT or GOT.PLT entry but compute against their base
    // addresses still force the sections to exist.
    if one_of!(expr, GotPltOnlyPc, GotPltRel, GotPlt, TlsGdGotPlt) {
        res.synthetic.got_plt.has_got_plt_off_rel = true;
    } else if one_of!(expr, GotOnlyPc, GotRel, Ppc64TocBase, Ppc64RelaxToc) {
        res.synthetic.got.has_got_off_rel = true;
    }

    // TPREL-style accesses only make sense when the TLS layout is final, i.e. not in a shared
    // object. (They resolve in process_reloc_aux; everything else TLS goes through the TLS
    // handler.)
    if expr == RelExpr::TpRel || expr == RelExpr::TpRelNeg {
        if res.config.shared {
            let message = format!(
                "relocation {} against {} cannot be used with -shared{}",
                rel_type_to_string(res.config.emachine, r_type),
                res.symbols.symbol(sym_id).name_for_display(),
                get_location(res, section_id, sym_id, offset),
            );
            res.diagnostics.error_or_warn(message);
            return Ok(consumed);
        }
    } else {
        let processed = tls::handle_tls_relocation(
            res,
            r_type,
            sym_id,
            section_id,
            view.file_id,
            offset,
            addend,
            expr,
        );
        if processed > 0 {
            return Ok(consumed.max(processed));
        }
    }

    // We were asked not to generate PLT entries for ifuncs; pass the relocation through to the
    // dynamic loader unchanged.
    if res.symbols.symbol(sym_id).is_ifunc() && res.config.z_ifunc_noplt {
        res.symbols.symbol_mut(sym_id).flags |= SymbolFlags::EXPORT_DYNAMIC;
        res.synthetic.rela_dyn.add_symbol_reloc(
            r_type,
            SectionRef::Input(section_id),
            offset,
            sym_id,
            addend,
        );
        return Ok(consumed);
    }

    // Capability-table-index expressions encode the entry's index into the instruction; record
    // both the entry and the residual relocation.
    if one_of!(
        expr,
        CheriCapTableIndex,
        CheriCapTableIndexSmallImm,
        CheriCapTableIndexCall,
        CheriCapTableIndexCallSmallImm,
        CheriCapTableEntryPc
    ) {
        res.synthetic.cheri_cap_table.add_entry(sym_id, expr);
        res.sections.section_mut(section_id).relocations.push(Relocation {
            expr,
            r_type,
            offset,
            addend,
            sym: sym_id,
        });
        return Ok(consumed);
    }

    let sym = res.symbols.symbol(sym_id);
    if !sym.is_ifunc() || sym.is_preemptible {
        if needs_plt(expr) && !sym.is_in_plt() {
            synthetic::add_plt_entry(res, sym_id, PltFlavor::Plt);
        }

        if needs_got(expr) {
            if res.config.emachine == object::elf::EM_MIPS {
                // The MIPS GOT is filled without relocation entries (TLS aside); route through
                // the dedicated section.
                let preemptible = res.symbols.symbol(sym_id).is_preemptible;
                res.synthetic.mips_got.add_entry(sym_id, addend, preemptible);
            } else if !res.symbols.symbol(sym_id).is_in_got() {
                synthetic::add_got_entry(res, sym_id);
            }
        }
    } else {
        // A non-preemptible ifunc doesn't have a fixed value: its address comes out of its
        // resolver at runtime. GOT- and PLT-generating references route through an Iplt entry
        // whose IGOT.PLT slot is fixed up by an eagerly-evaluated IRELATIVE relocation. The
        // IRELATIVE targets a clone of the symbol so that canonicalisation below can't change
        // what the resolver call means.
        if !res.symbols.symbol(sym_id).is_in_plt() {
            let direct = res.symbols.clone_unnamed(sym_id);
            synthetic::add_plt_entry(res, direct, PltFlavor::Iplt);
            let direct_index = res.symbols.symbol(direct).plt_index;
            let sym = res.symbols.symbol_mut(sym_id);
            sym.plt_index = direct_index;
            sym.flags |= SymbolFlags::IN_PLT | SymbolFlags::IN_IPLT;
        }
        if needs_got(expr) {
            // Redirect GOT accesses to the IGOT.PLT slot. Also remembers that a GOT entry was
            // ever wanted, in case the PLT entry becomes canonical later.
            res.symbols.symbol_mut(sym_id).flags |= SymbolFlags::GOT_IN_IGOT;
        } else if !needs_plt(expr) {
            // A direct reference demands a fixed address: make the PLT entry canonical by
            // redefining the symbol on top of it.
            let info = *res.target.info();
            let had_igot_entry = {
                let sym = res.symbols.symbol_mut(sym_id);
                let plt_index = sym.plt_index.expect("ifunc has a PLT entry by now");
                sym.value = SymbolValue::Defined {
                    section: Some(SectionRef::Synthetic(SyntheticKind::Iplt)),
                    value: u64::from(plt_index) * info.iplt_entry_size,
                    size: 0,
                };
                // Make sure dynamic loaders don't call the PLT entry as if it were a resolver.
                sym.kind = SymbolKind::Func;
                let had = sym.got_in_igot();
                sym.flags.remove(SymbolFlags::GOT_IN_IGOT);
                had
            };

            if had_igot_entry {
                // GOT-generating references were being served by the IGOT.PLT slot, but the
                // canonical address must be consistent for address-taking too. Give the symbol
                // a real GOT entry; since its type is now a plain function, it gets a normal
                // slot pointing at the canonical PLT entry.
                synthetic::add_got_entry(res, sym_id);
            }
        }
    }

    process_reloc_aux(res, section_id, expr, r_type, offset, sym_id, addend)?;
    Ok(consumed)
}

/// Scans all relocation records of one input section. Call once per allocated section; drain
/// [`crate::undefined::report_undefined_symbols`] when every section has been scanned.
#[tracing::instrument(skip_all, fields(section = %section_id))]
pub fn scan_relocations(section_id: SectionId, res: &mut ScanResources) -> Result {
    let (mut rels, pieces, view) = {
        let section = res.sections.section_mut(section_id);
        let rels = std::mem::take(&mut section.raw_relocations);
        let pieces = match &mut section.kind {
            SectionKind::EhFrame { pieces } => std::mem::take(pieces),
            SectionKind::Regular => Vec::new(),
        };
        let view = SectionView {
            file_id: section.file,
            data: section.data,
            format: section.rel_format,
        };
        section.relocations.reserve(rels.len());
        (rels, pieces, view)
    };
    let is_eh = matches!(
        res.sections.section(section_id).kind,
        SectionKind::EhFrame { .. }
    );

    if res.config.emachine == object::elf::EM_PPC64 {
        check_ppc64_tls_relax(res, view.file_id, &rels);
    }

    // The offset cursor needs the relocations sorted by offset. They almost always are, but a
    // linker script can reorder .eh_frame pieces.
    if is_eh {
        rels.sort_by_key(|rel| rel.r_offset);
    }

    let mut getter = OffsetGetter::new(pieces);
    let mut index = 0;
    let mut result = Ok(());
    while index < rels.len() {
        match scan_reloc(res, section_id, &view, &mut getter, &rels, index) {
            Ok(consumed) => index += consumed,
            Err(e) => {
                result = Err(e);
                break;
            }
        }
    }

    // Put the raw state back so the writer can use it.
    {
        let section = res.sections.section_mut(section_id);
        section.raw_relocations = rels;
        if let SectionKind::EhFrame { pieces } = &mut section.kind {
            *pieces = getter.into_pieces();
        }
    }
    result?;

    // RISC-V searches for paired HI20 relocations by offset; PPC64 does the same for .toc.
    if res.config.emachine == object::elf::EM_RISCV
        || (res.config.emachine == object::elf::EM_PPC64
            && res.sections.section(section_id).name == b".toc")
    {
        res.sections
            .section_mut(section_id)
            .relocations
            .sort_by_key(|rel| rel.offset);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::input_data::FileKind;
    use crate::sections::EhSectionPiece;
    use crate::sections::SectionKind;
    use crate::symbol_db::Binding;
    use crate::symbol_db::Symbol;
    use crate::symbol_db::Visibility;
    use crate::synthetic::DynamicRelocKind;
    use crate::testing::TestEnv;
    use crate::undefined::report_undefined_symbols;
    use crate::x86_64::X86_64;
    use linker_utils::elf::shf;
    use object::elf;

    #[test]
    fn test_offset_getter_pieces() {
        let pieces = vec![
            EhSectionPiece {
                input_off: 0,
                size: 16,
                output_off: 0x100,
            },
            EhSectionPiece {
                input_off: 16,
                size: 16,
                output_off: DEAD_PIECE,
            },
            EhSectionPiece {
                input_off: 32,
                size: 16,
                output_off: 0x110,
            },
        ];
        let mut getter = OffsetGetter::new(pieces);
        assert_eq!(getter.get(4).unwrap(), 0x104);
        assert_eq!(getter.get(20).unwrap(), DEAD_PIECE);
        assert_eq!(getter.get(33).unwrap(), 0x111);
        // Offsets must not go backwards once the cursor has advanced.
        assert!(getter.get(4).is_err());
        assert!(getter.get(100).is_err());
    }

    #[test]
    fn test_static_got_entry_in_pic_output() {
        crate::testing::init_logging();
        let bump = bumpalo::Bump::new();
        let mut env = TestEnv::new(Config {
            pie: true,
            ..Config::default()
        });
        let file = env.add_file("main.o", FileKind::Object);
        let data_sec = env.add_section(file, b".data", shf::ALLOC.with(shf::WRITE), &[0; 16]);
        let (foo, foo_idx) = env.add_symbol(
            file,
            TestEnv::defined_symbol(b"foo", crate::symbol_db::SymbolKind::Object, data_sec, 0, 8),
        );
        let text = env.add_text_section(file, &[0; 16]);
        env.sections
            .section_mut(text)
            .raw_relocations
            .push(RawRelocation {
                r_offset: 3,
                r_type: elf::R_X86_64_GOTPCREL,
                sym_index: foo_idx,
                addend: -4,
            });

        let target = X86_64;
        {
            let mut res = env.resources(&bump, &target);
            scan_relocations(text, &mut res).unwrap();
        }

        // One GOT slot, filled at load time by a RELATIVE dynamic relocation, plus the
        // residual GOT-relative record for the instruction itself.
        assert_eq!(env.synthetic.got.num_entries(), 1);
        assert_eq!(env.synthetic.rela_dyn.len(), 1);
        let dynrel = &env.synthetic.rela_dyn.relocations[0];
        assert_eq!(dynrel.r_type, elf::R_X86_64_RELATIVE);
        assert_eq!(dynrel.kind, DynamicRelocKind::AddendOnly);
        assert_eq!(
            env.sections.section(text).relocations,
            vec![Relocation {
                expr: RelExpr::GotPc,
                r_type: elf::R_X86_64_GOTPCREL,
                offset: 3,
                addend: -4,
                sym: foo,
            }]
        );
        assert!(env.diagnostics.errors().is_empty());
    }

    #[test]
    fn test_copy_relocation_promotes_aliases() {
        let bump = bumpalo::Bump::new();
        let mut env = TestEnv::new(Config::default());

        let libc = env.add_file("libc.so", FileKind::Shared);
        env.files.file_mut(libc).ro_segments.push(0x1000..0x2000);
        let mut stdout_sym = Symbol::new(
            b"stdout",
            Binding::Global,
            crate::symbol_db::SymbolKind::Object,
            crate::symbol_db::SymbolValue::Shared {
                value: 0x1100,
                size: 8,
                alignment: 8,
            },
        );
        stdout_sym.is_preemptible = true;
        let (stdout, _) = env.add_symbol(libc, stdout_sym);
        let mut alias_sym = Symbol::new(
            b"__stdoutp",
            Binding::Weak,
            crate::symbol_db::SymbolKind::Object,
            crate::symbol_db::SymbolValue::Shared {
                value: 0x1100,
                size: 8,
                alignment: 8,
            },
        );
        alias_sym.is_preemptible = true;
        let (alias, _) = env.add_symbol(libc, alias_sym);

        let main = env.add_file("main.o", FileKind::Object);
        let text = env.add_text_section(main, &[0; 8]);
        env.files.file_mut(main).symbols.push(stdout);
        let stdout_idx = (env.files.file(main).symbols.len() - 1) as u32;
        env.sections
            .section_mut(text)
            .raw_relocations
            .push(RawRelocation {
                r_offset: 0,
                r_type: elf::R_X86_64_PC32,
                sym_index: stdout_idx,
                addend: -4,
            });

        let target = X86_64;
        {
            let mut res = env.resources(&bump, &target);
            scan_relocations(text, &mut res).unwrap();
        }

        // The symbol was in a read-only segment of the DSO, so the reservation goes to
        // .bss.rel.ro; the alias at the same address moves with it.
        assert_eq!(env.synthetic.bss_rel_ro.size(), 8);
        assert_eq!(env.synthetic.bss.size(), 0);
        assert_eq!(env.synthetic.rela_dyn.len(), 1);
        let copy = &env.synthetic.rela_dyn.relocations[0];
        assert_eq!(copy.r_type, elf::R_X86_64_COPY);
        assert_eq!(copy.kind, DynamicRelocKind::AgainstSymbol);
        assert_eq!(copy.sym, stdout);
        for sym in [stdout, alias] {
            assert!(matches!(
                env.symbols.symbol(sym).value,
                crate::symbol_db::SymbolValue::Defined {
                    section: Some(SectionRef::Synthetic(SyntheticKind::BssRelRo)),
                    value: 0,
                    ..
                }
            ));
        }
        assert_eq!(env.sections.section(text).relocations.len(), 1);
        assert!(env.diagnostics.errors().is_empty());
    }

    #[test]
    fn test_tls_gd_relaxed_to_le_consumes_pair() {
        let bump = bumpalo::Bump::new();
        let mut env = TestEnv::new(Config::default());
        let file = env.add_file("main.o", FileKind::Object);
        let tdata = env.add_section(
            file,
            b".tdata",
            shf::ALLOC.with(shf::WRITE).with(shf::TLS),
            &[0; 8],
        );
        let (tls_var, tls_idx) = env.add_symbol(
            file,
            TestEnv::defined_symbol(b"tls_var", crate::symbol_db::SymbolKind::Tls, tdata, 0, 4),
        );
        let text = env.add_text_section(file, &[0; 16]);
        {
            let section = env.sections.section_mut(text);
            section.raw_relocations.push(RawRelocation {
                r_offset: 0,
                r_type: elf::R_X86_64_TLSGD,
                sym_index: tls_idx,
                addend: -4,
            });
            section.raw_relocations.push(RawRelocation {
                r_offset: 8,
                r_type: elf::R_X86_64_PLT32,
                sym_index: tls_idx,
                addend: -4,
            });
        }

        let target = X86_64;
        {
            let mut res = env.resources(&bump, &target);
            scan_relocations(text, &mut res).unwrap();
        }

        // Both records of the GD sequence are consumed, no GOT slots appear, and the single
        // residual record asks the writer to rewrite to local-exec.
        assert_eq!(
            env.sections.section(text).relocations,
            vec![Relocation {
                expr: RelExpr::RelaxTlsGdToLe,
                r_type: elf::R_X86_64_TLSGD,
                offset: 0,
                addend: -4,
                sym: tls_var,
            }]
        );
        assert_eq!(env.synthetic.got.num_entries(), 0);
        assert!(env.synthetic.rela_dyn.is_empty());
    }

    #[test]
    fn test_tls_gd_in_shared_object_allocates_pair() {
        let bump = bumpalo::Bump::new();
        let mut env = TestEnv::new(Config {
            shared: true,
            ..Config::default()
        });
        let file = env.add_file("lib.o", FileKind::Object);
        let tdata = env.add_section(
            file,
            b".tdata",
            shf::ALLOC.with(shf::WRITE).with(shf::TLS),
            &[0; 8],
        );
        let mut sym = TestEnv::defined_symbol(
            b"tls_var",
            crate::symbol_db::SymbolKind::Tls,
            tdata,
            0,
            4,
        );
        sym.is_preemptible = true;
        let (tls_var, tls_idx) = env.add_symbol(file, sym);
        let text = env.add_text_section(file, &[0; 16]);
        env.sections
            .section_mut(text)
            .raw_relocations
            .push(RawRelocation {
                r_offset: 0,
                r_type: elf::R_X86_64_TLSGD,
                sym_index: tls_idx,
                addend: -4,
            });

        let target = X86_64;
        {
            let mut res = env.resources(&bump, &target);
            scan_relocations(text, &mut res).unwrap();
        }

        // Module index and offset both come from the loader for a preemptible symbol.
        assert_eq!(env.synthetic.got.num_entries(), 2);
        assert_eq!(env.synthetic.rela_dyn.len(), 2);
        assert_eq!(
            env.synthetic.rela_dyn.relocations[0].r_type,
            elf::R_X86_64_DTPMOD64
        );
        assert_eq!(
            env.synthetic.rela_dyn.relocations[1].r_type,
            elf::R_X86_64_DTPOFF64
        );
        assert_eq!(env.sections.section(text).relocations.len(), 1);
        assert_eq!(
            env.sections.section(text).relocations[0].expr,
            RelExpr::TlsGdPc
        );
        // A second access reuses the same pair.
        let (got, relas) = (
            env.synthetic.got.num_entries(),
            env.synthetic.rela_dyn.len(),
        );
        env.sections
            .section_mut(text)
            .raw_relocations
            .push(RawRelocation {
                r_offset: 8,
                r_type: elf::R_X86_64_TLSGD,
                sym_index: tls_idx,
                addend: -4,
            });
        {
            let mut res = env.resources(&bump, &target);
            let _ = tls_var;
            scan_relocations(text, &mut res).unwrap();
        }
        assert_eq!(env.synthetic.got.num_entries(), got);
        assert_eq!(env.synthetic.rela_dyn.len(), relas);
    }

    #[test]
    fn test_nonpreemptible_ifunc_canonicalisation() {
        crate::testing::init_logging();
        let bump = bumpalo::Bump::new();
        let mut env = TestEnv::new(Config::default());
        let file = env.add_file("main.o", FileKind::Object);
        let text_data: &[u8] = &[0; 32];
        let text = env.add_text_section(file, text_data);
        let (resolver, resolver_idx) = env.add_symbol(
            file,
            TestEnv::defined_symbol(b"fast_memcpy", crate::symbol_db::SymbolKind::IFunc, text, 0, 0),
        );
        let data = env.add_section(file, b".data", shf::ALLOC.with(shf::WRITE), &[0; 16]);
        {
            let section = env.sections.section_mut(text);
            // A call and a GOT-generating reference.
            section.raw_relocations.push(RawRelocation {
                r_offset: 8,
                r_type: elf::R_X86_64_PLT32,
                sym_index: resolver_idx,
                addend: -4,
            });
            section.raw_relocations.push(RawRelocation {
                r_offset: 16,
                r_type: elf::R_X86_64_GOTPCREL,
                sym_index: resolver_idx,
                addend: -4,
            });
        }

        let target = X86_64;
        {
            let mut res = env.resources(&bump, &target);
            scan_relocations(text, &mut res).unwrap();
        }

        // An Iplt entry with an IRELATIVE against the cloned symbol; GOT accesses ride the
        // IGOT.PLT slot.
        assert_eq!(env.synthetic.iplt.num_entries(), 1);
        assert_eq!(env.synthetic.igot_plt.num_entries(), 1);
        assert_eq!(env.synthetic.rela_iplt.len(), 1);
        assert_eq!(
            env.synthetic.rela_iplt.relocations[0].r_type,
            elf::R_X86_64_IRELATIVE
        );
        assert_ne!(env.synthetic.rela_iplt.relocations[0].sym, resolver);
        assert!(env.symbols.symbol(resolver).got_in_igot());
        assert_eq!(env.synthetic.got.num_entries(), 0);

        // Now a direct address-taking reference arrives from .data.
        env.files.file_mut(file).symbols.push(resolver);
        let resolver_idx2 = (env.files.file(file).symbols.len() - 1) as u32;
        env.sections
            .section_mut(data)
            .raw_relocations
            .push(RawRelocation {
                r_offset: 0,
                r_type: elf::R_X86_64_64,
                sym_index: resolver_idx2,
                addend: 0,
            });
        {
            let mut res = env.resources(&bump, &target);
            scan_relocations(data, &mut res).unwrap();
        }

        // The PLT entry became canonical: the symbol now lives in the Iplt, its type is a plain
        // function, and a real GOT entry (statically filled with the canonical address) exists.
        let sym = env.symbols.symbol(resolver);
        assert!(matches!(
            sym.value,
            crate::symbol_db::SymbolValue::Defined {
                section: Some(SectionRef::Synthetic(SyntheticKind::Iplt)),
                value: 0,
                ..
            }
        ));
        assert_eq!(sym.kind, crate::symbol_db::SymbolKind::Func);
        assert!(!sym.got_in_igot());
        assert_eq!(env.synthetic.got.num_entries(), 1);
        assert_eq!(env.synthetic.got.relocations.len(), 1);
        assert!(env.diagnostics.errors().is_empty());
    }

    #[test]
    fn test_undefined_symbol_spelling_suggestion() {
        let bump = bumpalo::Bump::new();
        let mut env = TestEnv::new(Config::default());

        let libc = env.add_file("libc.o", FileKind::Object);
        let libc_text = env.add_text_section(libc, &[0; 8]);
        env.add_symbol(
            libc,
            TestEnv::defined_symbol(b"printf", crate::symbol_db::SymbolKind::Func, libc_text, 0, 8),
        );

        let main = env.add_file("main.o", FileKind::Object);
        let (_, bad_idx) = env.add_symbol(
            main,
            Symbol::new(
                b"prnitf",
                Binding::Global,
                crate::symbol_db::SymbolKind::Func,
                crate::symbol_db::SymbolValue::Undefined,
            ),
        );
        let text = env.add_text_section(main, &[0; 8]);
        env.sections
            .section_mut(text)
            .raw_relocations
            .push(RawRelocation {
                r_offset: 0,
                r_type: elf::R_X86_64_PLT32,
                sym_index: bad_idx,
                addend: -4,
            });

        let target = X86_64;
        {
            let mut res = env.resources(&bump, &target);
            scan_relocations(text, &mut res).unwrap();
            report_undefined_symbols(&mut res);
        }

        assert_eq!(env.diagnostics.errors().len(), 1);
        let message = &env.diagnostics.errors()[0];
        assert!(message.contains("undefined symbol: prnitf"), "{message}");
        assert!(message.contains("did you mean: printf"), "{message}");
        assert!(message.contains("defined in: libc.o"), "{message}");
        // The skipped relocation produced no record and no synthetic growth.
        assert!(env.sections.section(text).relocations.is_empty());
        assert_eq!(env.synthetic.plt.num_entries(), 0);
    }

    #[test]
    fn test_relr_packs_even_offsets() {
        let bump = bumpalo::Bump::new();
        let mut env = TestEnv::new(Config {
            pie: true,
            pack_dyn_relocs_relr: true,
            ..Config::default()
        });
        let file = env.add_file("main.o", FileKind::Object);
        let data = env.add_section(file, b".data", shf::ALLOC.with(shf::WRITE), &[0; 32]);
        env.sections.section_mut(data).alignment = 8;
        let (ptr_target, idx) = env.add_symbol(
            file,
            TestEnv::defined_symbol(b"target", crate::symbol_db::SymbolKind::Object, data, 16, 8),
        );
        {
            let section = env.sections.section_mut(data);
            section.raw_relocations.push(RawRelocation {
                r_offset: 0,
                r_type: elf::R_X86_64_64,
                sym_index: idx,
                addend: 0,
            });
            section.raw_relocations.push(RawRelocation {
                r_offset: 9,
                r_type: elf::R_X86_64_64,
                sym_index: idx,
                addend: 0,
            });
        }

        let target = X86_64;
        {
            let mut res = env.resources(&bump, &target);
            scan_relocations(data, &mut res).unwrap();
        }

        // The even offset packs into RELR with a static record; the odd one falls back to a
        // regular relative dynamic relocation.
        let relr = env.synthetic.relr_dyn.as_ref().unwrap();
        assert_eq!(relr.relocs.len(), 1);
        assert_eq!(relr.relocs[0], (SectionRef::Input(data), 0));
        assert_eq!(env.synthetic.rela_dyn.len(), 1);
        assert_eq!(env.synthetic.rela_dyn.relocations[0].offset, 9);
        let records = &env.sections.section(data).relocations;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].offset, 0);
        assert_eq!(records[0].sym, ptr_target);
    }

    #[test]
    fn test_cannot_preempt_protected_shared_symbol() {
        let bump = bumpalo::Bump::new();
        let mut env = TestEnv::new(Config::default());

        let dso = env.add_file("libfoo.so", FileKind::Shared);
        let mut sym = Symbol::new(
            b"prot",
            Binding::Global,
            crate::symbol_db::SymbolKind::Object,
            crate::symbol_db::SymbolValue::Shared {
                value: 0x100,
                size: 8,
                alignment: 8,
            },
        );
        sym.is_preemptible = true;
        sym.visibility = Visibility::Protected;
        let (prot, _) = env.add_symbol(dso, sym);

        let main = env.add_file("main.o", FileKind::Object);
        let text = env.add_text_section(main, &[0; 8]);
        env.files.file_mut(main).symbols.push(prot);
        let idx = (env.files.file(main).symbols.len() - 1) as u32;
        env.sections
            .section_mut(text)
            .raw_relocations
            .push(RawRelocation {
                r_offset: 0,
                r_type: elf::R_X86_64_PC32,
                sym_index: idx,
                addend: -4,
            });

        let target = X86_64;
        {
            let mut res = env.resources(&bump, &target);
            scan_relocations(text, &mut res).unwrap();
        }

        assert_eq!(env.diagnostics.errors().len(), 1);
        assert!(env.diagnostics.errors()[0].contains("cannot preempt symbol: prot"));
    }

    #[test]
    fn test_tprel_rejected_in_shared_output() {
        let bump = bumpalo::Bump::new();
        let mut env = TestEnv::new(Config {
            shared: true,
            ..Config::default()
        });
        let file = env.add_file("lib.o", FileKind::Object);
        let tdata = env.add_section(
            file,
            b".tdata",
            shf::ALLOC.with(shf::WRITE).with(shf::TLS),
            &[0; 8],
        );
        let (_, idx) = env.add_symbol(
            file,
            TestEnv::defined_symbol(b"tls_var", crate::symbol_db::SymbolKind::Tls, tdata, 0, 4),
        );
        let text = env.add_text_section(file, &[0; 8]);
        env.sections
            .section_mut(text)
            .raw_relocations
            .push(RawRelocation {
                r_offset: 0,
                r_type: elf::R_X86_64_TPOFF32,
                sym_index: idx,
                addend: 0,
            });

        let target = X86_64;
        {
            let mut res = env.resources(&bump, &target);
            scan_relocations(text, &mut res).unwrap();
        }

        assert_eq!(env.diagnostics.errors().len(), 1);
        assert!(env.diagnostics.errors()[0].contains("cannot be used with -shared"));
        assert!(env.sections.section(text).relocations.is_empty());
    }

    #[test]
    fn test_mips_paired_addend() {
        let bump = bumpalo::Bump::new();
        let mut env = TestEnv::new(Config {
            emachine: elf::EM_MIPS,
            ..Config::default()
        });
        let file = env.add_file("main.o", FileKind::Object);
        // lui immediate 0x0001 at offset 0, addiu immediate 0x8000 at offset 8.
        let text_data: &[u8] = &[
            0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, //
            0x00, 0x80, 0x00, 0x00,
        ];
        let data_sec = env.add_section(file, b".data", shf::ALLOC.with(shf::WRITE), &[0; 8]);
        let (sym, idx) = env.add_symbol(
            file,
            TestEnv::defined_symbol(b"lsym", crate::symbol_db::SymbolKind::Object, data_sec, 0, 4),
        );
        let text = env.add_text_section(file, text_data);
        {
            let section = env.sections.section_mut(text);
            section.rel_format = RelFormat::Rel;
            section.raw_relocations.push(RawRelocation {
                r_offset: 0,
                r_type: elf::R_MIPS_HI16,
                sym_index: idx,
                addend: 0,
            });
            section.raw_relocations.push(RawRelocation {
                r_offset: 8,
                r_type: elf::R_MIPS_LO16,
                sym_index: idx,
                addend: 0,
            });
        }

        let target = crate::mips::Mips;
        {
            let mut res = env.resources(&bump, &target);
            scan_relocations(text, &mut res).unwrap();
        }

        let records = &env.sections.section(text).relocations;
        assert_eq!(records.len(), 2);
        // HI16 combines its own implicit high part with the paired LO16's implicit addend.
        assert_eq!(records[0].addend, 0x10000 - 0x8000);
        assert_eq!(records[1].addend, -0x8000);
        assert_eq!(records[0].sym, sym);
        assert!(env.diagnostics.warnings().is_empty());
    }

    #[test]
    fn test_mips_missing_pair_warns() {
        let bump = bumpalo::Bump::new();
        let mut env = TestEnv::new(Config {
            emachine: elf::EM_MIPS,
            ..Config::default()
        });
        let file = env.add_file("main.o", FileKind::Object);
        let data_sec = env.add_section(file, b".data", shf::ALLOC.with(shf::WRITE), &[0; 8]);
        let (_, idx) = env.add_symbol(
            file,
            TestEnv::defined_symbol(b"lsym", crate::symbol_db::SymbolKind::Object, data_sec, 0, 4),
        );
        let text = env.add_text_section(file, &[0; 8]);
        {
            let section = env.sections.section_mut(text);
            section.rel_format = RelFormat::Rel;
            section.raw_relocations.push(RawRelocation {
                r_offset: 0,
                r_type: elf::R_MIPS_HI16,
                sym_index: idx,
                addend: 0,
            });
        }

        let target = crate::mips::Mips;
        {
            let mut res = env.resources(&bump, &target);
            scan_relocations(text, &mut res).unwrap();
        }

        assert_eq!(env.diagnostics.warnings().len(), 1);
        assert!(env.diagnostics.warnings()[0].contains("can't find matching"));
    }

    #[test]
    fn test_eh_frame_dead_piece_skips_relocation() {
        let bump = bumpalo::Bump::new();
        let mut env = TestEnv::new(Config::default());
        let file = env.add_file("main.o", FileKind::Object);
        let data_sec = env.add_section(file, b".text", shf::ALLOC.with(shf::EXECINSTR), &[0; 8]);
        let (_, idx) = env.add_symbol(
            file,
            TestEnv::defined_symbol(b"fn1", crate::symbol_db::SymbolKind::Func, data_sec, 0, 8),
        );
        let eh = env.add_section(file, b".eh_frame", shf::ALLOC, &[0; 64]);
        {
            let section = env.sections.section_mut(eh);
            section.kind = SectionKind::EhFrame {
                pieces: vec![
                    EhSectionPiece {
                        input_off: 0,
                        size: 32,
                        output_off: 0,
                    },
                    EhSectionPiece {
                        input_off: 32,
                        size: 32,
                        output_off: DEAD_PIECE,
                    },
                ],
            };
            // Deliberately unsorted: the scanner sorts .eh_frame relocations by offset.
            section.raw_relocations.push(RawRelocation {
                r_offset: 40,
                r_type: elf::R_X86_64_PC32,
                sym_index: idx,
                addend: -4,
            });
            section.raw_relocations.push(RawRelocation {
                r_offset: 8,
                r_type: elf::R_X86_64_PC32,
                sym_index: idx,
                addend: -4,
            });
        }

        let target = X86_64;
        {
            let mut res = env.resources(&bump, &target);
            scan_relocations(eh, &mut res).unwrap();
        }

        // The live piece keeps its record at the translated offset, the dead one is dropped.
        let records = &env.sections.section(eh).relocations;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].offset, 8);
    }
}
