//! Copy relocations and the symbol surgery they require.
//!
//! A direct data reference from non-PIC code to a shared-object symbol can't be fixed up in the
//! instruction stream, so the linker reserves space in `.bss` (or `.bss.rel.ro` when the symbol
//! lives in a read-only segment of the DSO), asks the loader to copy the data there at startup,
//! and redefines the symbol to point at the reservation. Every DSO symbol at the same address
//! must be redefined together, otherwise aliases would diverge at runtime.

use crate::bail;
use crate::error::Result;
use crate::resources::ScanResources;
use crate::sections::SectionRef;
use crate::symbol_db::SymbolFlags;
use crate::symbol_db::SymbolId;
use crate::symbol_db::SymbolValue;
use crate::synthetic::SyntheticKind;
use smallvec::SmallVec;

/// Returns whether the shared symbol lives in a read-only segment of its DSO.
fn is_read_only(res: &ScanResources, sym_id: SymbolId) -> bool {
    let sym = res.symbols.symbol(sym_id);
    let SymbolValue::Shared { value, .. } = sym.value else {
        return false;
    };
    let Some(file) = sym.file else {
        return false;
    };
    res.files
        .file(file)
        .ro_segments
        .iter()
        .any(|seg| seg.contains(&value))
}

/// Returns the shared symbols of the DSO that sit at the same value as `sym_id`, including
/// `sym_id` itself. If any of them is copy-relocated, all of them must be.
fn symbols_at(res: &ScanResources, sym_id: SymbolId) -> SmallVec<[SymbolId; 4]> {
    let sym = res.symbols.symbol(sym_id);
    let SymbolValue::Shared { value, .. } = sym.value else {
        return SmallVec::new();
    };
    let Some(file_id) = sym.file else {
        return SmallVec::from_elem(sym_id, 1);
    };

    let mut out = SmallVec::new();
    for &candidate in &res.files.file(file_id).symbols {
        let s = res.symbols.symbol(candidate);
        if s.is_tls() {
            continue;
        }
        if let SymbolValue::Shared { value: v, .. } = s.value {
            if v == value {
                out.push(candidate);
            }
        }
    }
    if !out.contains(&sym_id) {
        out.push(sym_id);
    }
    out
}

/// Replaces a symbol with a `Defined` pointing at the given location, preserving the PLT/GOT
/// bookkeeping accumulated so far. Used after copy relocation (the symbol moves into `.bss`) and
/// after canonical-PLT creation (the symbol's address becomes its PLT entry).
pub(crate) fn replace_with_defined(
    res: &mut ScanResources,
    sym_id: SymbolId,
    section: SectionRef,
    value: u64,
    size: u64,
) {
    let sym = res.symbols.symbol_mut(sym_id);
    sym.value = SymbolValue::Defined {
        section: Some(section),
        value,
        size,
    };
    sym.flags |= SymbolFlags::EXPORT_DYNAMIC | SymbolFlags::USED_IN_REGULAR_OBJ;
}

/// Reserves space for a copy relocation of the shared symbol, promotes it (and every alias at
/// the same DSO address) to a defined symbol in the reservation, and records the COPY dynamic
/// relocation.
pub(crate) fn add_copy_rel_symbol(res: &mut ScanResources, sym_id: SymbolId) -> Result {
    let (size, alignment) = {
        let sym = res.symbols.symbol(sym_id);
        let SymbolValue::Shared {
            size, alignment, ..
        } = sym.value
        else {
            bail!(
                "copy relocation requested for non-shared symbol {}",
                sym.name_for_display()
            );
        };
        (size, alignment)
    };

    // A copy relocation needs the symbol's size and alignment to reproduce its storage; zero for
    // either means the DSO didn't record them and the copy cannot be made.
    if size == 0 || alignment == 0 {
        bail!(
            "cannot create a copy relocation for symbol {}",
            res.symbols.symbol(sym_id).name_for_display()
        );
    }

    // Preserve the symbol's memory protection by reserving in .bss.rel.ro when the DSO keeps it
    // read-only.
    let kind = if is_read_only(res, sym_id) {
        SyntheticKind::BssRelRo
    } else {
        SyntheticKind::Bss
    };
    let offset = match kind {
        SyntheticKind::BssRelRo => res.synthetic.bss_rel_ro.reserve(size, alignment),
        _ => res.synthetic.bss.reserve(size, alignment),
    };

    for alias in symbols_at(res, sym_id) {
        let alias_size = match res.symbols.symbol(alias).value {
            SymbolValue::Shared { size, .. } => size,
            _ => 0,
        };
        replace_with_defined(res, alias, SectionRef::Synthetic(kind), offset, alias_size);
    }

    let copy_rel = res.target.info().copy_rel;
    res.synthetic.rela_dyn.add_symbol_reloc(
        copy_rel,
        SectionRef::Synthetic(kind),
        offset,
        sym_id,
        0,
    );
    Ok(())
}

/// Whether the executable may define a symbol that shadows this shared-object definition.
pub(crate) fn can_define_symbol_in_executable(res: &ScanResources, sym_id: SymbolId) -> bool {
    let sym = res.symbols.symbol(sym_id);

    // Default visibility means the executable's definition would preempt the DSO's.
    if sym.visibility == crate::symbol_db::Visibility::Default {
        return true;
    }

    // Otherwise we can only proceed if the user told us address equality doesn't matter.
    (sym.is_func() && res.config.ignore_function_address_equality)
        || (sym.is_object() && res.config.ignore_data_address_equality)
}
