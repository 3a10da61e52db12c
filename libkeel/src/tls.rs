//! TLS relocation handling: per-model GOT slot allocation and the GD->IE, GD->LE, LD->LE and
//! IE->LE relaxations. General-dynamic and local-dynamic accesses allocate a pair of GOT slots,
//! `GOT[e0]` holding the module index and `GOT[e1]` the offset of the symbol within that
//! module's TLS block.

use crate::input_data::FileId;
use crate::resources::ScanResources;
use crate::sections::Relocation;
use crate::sections::SectionId;
use crate::sections::SectionRef;
use crate::symbol_db::SymbolFlags;
use crate::symbol_db::SymbolId;
use crate::synthetic::SyntheticKind;
use linker_utils::elf::RelExpr;
use linker_utils::elf::RelType;
use linker_utils::one_of;

fn push_record(
    res: &mut ScanResources,
    section_id: SectionId,
    expr: RelExpr,
    r_type: RelType,
    offset: u64,
    addend: i64,
    sym: SymbolId,
) {
    res.sections.section_mut(section_id).relocations.push(Relocation {
        expr,
        r_type,
        offset,
        addend,
        sym,
    });
}

/// MIPS never relaxes TLS and writes its GOT entries without dynamic relocations, so it gets its
/// own handler rather than if-laddering the generic one.
fn handle_mips_tls_relocation(
    res: &mut ScanResources,
    r_type: RelType,
    sym_id: SymbolId,
    section_id: SectionId,
    offset: u64,
    addend: i64,
    expr: RelExpr,
) -> usize {
    match expr {
        RelExpr::MipsTlsLd => {
            res.synthetic.mips_got.add_tls_index();
        }
        RelExpr::MipsTlsGd => {
            res.synthetic.mips_got.add_dyn_tls_entry(sym_id);
        }
        RelExpr::MipsCheriCapTabTlsLd => {
            res.synthetic.cheri_cap_table.add_tls_index();
        }
        RelExpr::MipsCheriCapTabTlsGd => {
            res.synthetic.cheri_cap_table.add_dyn_tls_entry(sym_id);
        }
        RelExpr::MipsCheriCapTabTpRel => {
            res.synthetic.cheri_cap_table.add_tls_entry(sym_id);
        }
        _ => return 0,
    }
    push_record(res, section_id, expr, r_type, offset, addend, sym_id);
    1
}

/// Handles a TLS relocation, allocating GOT slots and applying relaxations as the
/// (expression, output mode, preemptibility, machine) combination dictates.
///
/// Returns the number of relocation records consumed: 0 when the relocation wasn't a TLS access
/// this function is responsible for, otherwise at least 1 (GD/LD relaxation sequences consume
/// `Target::get_tls_gd_relax_skip` records).
pub(crate) fn handle_tls_relocation(
    res: &mut ScanResources,
    r_type: RelType,
    sym_id: SymbolId,
    section_id: SectionId,
    file_id: FileId,
    offset: u64,
    addend: i64,
    expr: RelExpr,
) -> usize {
    if !res.symbols.symbol(sym_id).is_tls() {
        return 0;
    }

    if res.config.emachine == object::elf::EM_MIPS {
        return handle_mips_tls_relocation(res, r_type, sym_id, section_id, offset, addend, expr);
    }

    let info = *res.target.info();
    let preemptible = res.symbols.symbol(sym_id).is_preemptible;

    if one_of!(expr, AArch64TlsDescPage, TlsDesc, TlsDescCall, TlsDescPc) && res.config.shared {
        if res.synthetic.got.add_dyn_tls_entry(sym_id) {
            let off = res.synthetic.got.global_dyn_offset(sym_id);
            res.synthetic.rela_dyn.add_addend_only_reloc_if_non_preemptible(
                info.tls_desc_rel,
                SectionRef::Synthetic(SyntheticKind::Got),
                off,
                sym_id,
                preemptible,
            );
        }
        if expr != RelExpr::TlsDescCall {
            push_record(res, section_id, expr, r_type, offset, addend, sym_id);
        }
        return 1;
    }

    // ARM, Hexagon and RISC-V do not support GD/LD to IE/LE relaxation. Neither do PPC64 files
    // that carry GD/LD GOT relocations without the marker relocations.
    let to_exec_relax = !res.config.shared
        && res.config.emachine != object::elf::EM_ARM
        && res.config.emachine != linker_utils::elf::EM_HEXAGON
        && res.config.emachine != object::elf::EM_RISCV
        && !res.files.file(file_id).ppc64_disable_tls_relax;

    // No target currently relaxes capability-table TLS sequences.
    if expr == RelExpr::CheriCapTableTlsGdEntryPc {
        res.synthetic.cheri_cap_table.add_dyn_tls_entry(sym_id);
        push_record(res, section_id, expr, r_type, offset, addend, sym_id);
        return 1;
    }
    if expr == RelExpr::CheriCapTableTlsIeEntryPc {
        res.synthetic.cheri_cap_table.add_tls_entry(sym_id);
        push_record(res, section_id, expr, r_type, offset, addend, sym_id);
        return 1;
    }

    let is_local_in_executable = !preemptible && !res.config.shared;

    // Local-dynamic: one module-index slot shared by every LD access in the module.
    if one_of!(expr, TlsLdGot, TlsLdGotPlt, TlsLdPc, TlsLdHint) {
        if to_exec_relax {
            let relaxed = res.target.adjust_tls_expr(r_type, RelExpr::RelaxTlsLdToLe);
            push_record(res, section_id, relaxed, r_type, offset, addend, sym_id);
            return res.target.get_tls_gd_relax_skip(r_type);
        }
        if expr == RelExpr::TlsLdHint {
            return 1;
        }
        if res.synthetic.got.add_tls_index() {
            let off = res.synthetic.got.tls_index_offset();
            if is_local_in_executable {
                // The module index of the executable is always 1; write it now.
                res.synthetic.got.relocations.push(Relocation {
                    expr: RelExpr::Addend,
                    r_type: info.symbolic_rel,
                    offset: off,
                    addend: 1,
                    sym: sym_id,
                });
            } else {
                res.synthetic.rela_dyn.add_relative_reloc(
                    info.tls_module_index_rel,
                    SectionRef::Synthetic(SyntheticKind::Got),
                    off,
                    sym_id,
                    0,
                );
            }
        }
        push_record(res, section_id, expr, r_type, offset, addend, sym_id);
        return 1;
    }

    if expr == RelExpr::DtpRel && to_exec_relax {
        let relaxed = res.target.adjust_tls_expr(r_type, RelExpr::RelaxTlsLdToLe);
        push_record(res, section_id, relaxed, r_type, offset, addend, sym_id);
        return 1;
    }

    // Local-dynamic with the DTP offset stored in the GOT. Cannot be relaxed.
    if expr == RelExpr::TlsLdGotOff {
        if !res.symbols.symbol(sym_id).is_in_got() {
            res.synthetic.got.add_entry(sym_id);
            res.symbols.symbol_mut(sym_id).flags |= SymbolFlags::IN_GOT;
            let off = res.synthetic.got.offset_of(sym_id);
            res.synthetic.got.relocations.push(Relocation {
                expr: RelExpr::Abs,
                r_type: info.tls_offset_rel,
                offset: off,
                addend: 0,
                sym: sym_id,
            });
        }
        push_record(res, section_id, expr, r_type, offset, addend, sym_id);
        return 1;
    }

    if one_of!(
        expr,
        AArch64TlsDescPage,
        TlsDesc,
        TlsDescCall,
        TlsDescPc,
        TlsGdGot,
        TlsGdGotPlt,
        TlsGdPc
    ) {
        if !to_exec_relax {
            if res.synthetic.got.add_dyn_tls_entry(sym_id) {
                let off = res.synthetic.got.global_dyn_offset(sym_id);

                if is_local_in_executable {
                    res.synthetic.got.relocations.push(Relocation {
                        expr: RelExpr::Addend,
                        r_type: info.symbolic_rel,
                        offset: off,
                        addend: 1,
                        sym: sym_id,
                    });
                } else {
                    res.synthetic.rela_dyn.add_symbol_reloc(
                        info.tls_module_index_rel,
                        SectionRef::Synthetic(SyntheticKind::Got),
                        off,
                        sym_id,
                        0,
                    );
                }

                // If the symbol is preemptible the loader writes the offset too.
                let offset_off = off + res.config.wordsize;
                if preemptible {
                    res.synthetic.rela_dyn.add_symbol_reloc(
                        info.tls_offset_rel,
                        SectionRef::Synthetic(SyntheticKind::Got),
                        offset_off,
                        sym_id,
                        0,
                    );
                } else {
                    res.synthetic.got.relocations.push(Relocation {
                        expr: RelExpr::Abs,
                        r_type: info.tls_offset_rel,
                        offset: offset_off,
                        addend: 0,
                        sym: sym_id,
                    });
                }
            }
            push_record(res, section_id, expr, r_type, offset, addend, sym_id);
            return 1;
        }

        // General-dynamic relaxes to initial-exec or local-exec depending on whether the symbol
        // can be preempted.
        if preemptible {
            let relaxed = res.target.adjust_tls_expr(r_type, RelExpr::RelaxTlsGdToIe);
            push_record(res, section_id, relaxed, r_type, offset, addend, sym_id);
            if !res.symbols.symbol(sym_id).is_in_got() {
                res.synthetic.got.add_entry(sym_id);
                res.symbols.symbol_mut(sym_id).flags |= SymbolFlags::IN_GOT;
                let off = res.synthetic.got.offset_of(sym_id);
                res.synthetic.rela_dyn.add_symbol_reloc(
                    info.tls_got_rel,
                    SectionRef::Synthetic(SyntheticKind::Got),
                    off,
                    sym_id,
                    0,
                );
            }
        } else {
            let relaxed = res.target.adjust_tls_expr(r_type, RelExpr::RelaxTlsGdToLe);
            push_record(res, section_id, relaxed, r_type, offset, addend, sym_id);
        }
        return res.target.get_tls_gd_relax_skip(r_type);
    }

    // Initial-exec accesses relax to local-exec when the symbol is locally defined.
    if one_of!(expr, Got, GotPlt, GotPc, AArch64GotPagePc, GotOff, TlsIeHint)
        && to_exec_relax
        && is_local_in_executable
    {
        push_record(
            res,
            section_id,
            RelExpr::RelaxTlsIeToLe,
            r_type,
            offset,
            addend,
            sym_id,
        );
        return 1;
    }

    if expr == RelExpr::TlsIeHint {
        return 1;
    }
    0
}
