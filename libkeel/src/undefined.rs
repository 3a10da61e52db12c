//! Deferred undefined-symbol diagnostics. References to undefined symbols are collected while
//! scanning and reported in one batch afterwards, so that duplicates merge and the worst
//! offenders can get spelling suggestions.

use crate::input_data::FileKind;
use crate::resources::ScanResources;
use crate::sections::SectionId;
use crate::symbol_db::SymbolId;
use crate::symbol_db::Visibility;
use hashbrown::HashMap;
use symbolic_demangle::Demangle;
use symbolic_demangle::DemangleOptions;

pub struct UndefinedDiag {
    pub sym: SymbolId,
    pub locs: Vec<(SectionId, u64)>,
    pub is_warning: bool,
}

/// Records a diagnostic for a reference to an undefined symbol, if one is warranted. Returns
/// true when the reference will produce an error, in which case the caller skips further
/// processing of the relocation.
pub(crate) fn maybe_report_undefined(
    res: &mut ScanResources,
    sym_id: SymbolId,
    section_id: SectionId,
    offset: u64,
) -> bool {
    let sym = res.symbols.symbol(sym_id);
    if !sym.is_undefined() {
        return false;
    }

    // A versioned undefined reference is an error even if weak: without the defining file we
    // can't construct the version-needs entry.
    if sym.version.is_some() {
        res.undefs.push(UndefinedDiag {
            sym: sym_id,
            locs: vec![(section_id, offset)],
            is_warning: false,
        });
        return true;
    }

    if sym.is_weak() {
        return false;
    }

    let can_be_external = !sym.is_local() && sym.visibility == Visibility::Default;
    if res.config.unresolved_symbols == crate::config::UnresolvedPolicy::Ignore && can_be_external
    {
        return false;
    }

    // clang and gcc on PPC may emit a .rela.toc / .got2 referencing a switch table in a
    // discarded section without putting the .toc in the comdat. Work around the compiler bug by
    // staying quiet.
    let section_name = res.sections.section(section_id).name;
    if sym.discarded_sec_idx != 0 && (section_name == b".got2" || section_name == b".toc") {
        return false;
    }

    let is_warning = (res.config.unresolved_symbols == crate::config::UnresolvedPolicy::Warn
        && can_be_external)
        || res.config.noinhibit_exec;
    res.undefs.push(UndefinedDiag {
        sym: sym_id,
        locs: vec![(section_id, offset)],
        is_warning,
    });
    !is_warning
}

/// Drains the collected diagnostics: merges duplicates by symbol (keeping first-encounter
/// order), then reports each with referencing locations and, for the first two, a spelling
/// suggestion.
pub fn report_undefined_symbols(res: &mut ScanResources) {
    let mut undefs = std::mem::take(res.undefs);

    // Find the first diagnostic for each symbol and collect every "referenced by" location
    // there.
    let mut first_ref: HashMap<SymbolId, usize> = HashMap::new();
    for i in 0..undefs.len() {
        let sym = undefs[i].sym;
        match first_ref.get(&sym) {
            Some(&canon) => {
                let locs = std::mem::take(&mut undefs[i].locs);
                undefs[canon].locs.extend(locs);
            }
            None => {
                first_ref.insert(sym, i);
            }
        }
    }

    let mut reported = 0usize;
    for undef in &undefs {
        if undef.locs.is_empty() {
            continue;
        }
        report_one(res, undef, reported < 2);
        reported += 1;
    }
}

const MAX_UNDEF_REFERENCES: usize = 3;

fn report_one(res: &mut ScanResources, undef: &UndefinedDiag, correct_spelling: bool) {
    let sym = res.symbols.symbol(undef.sym);
    let name = sym.name_for_display();

    let mut msg = maybe_report_discarded(res, undef.sym).unwrap_or_else(|| {
        format!("undefined {}symbol: {name}", sym.visibility.prefix())
    });

    for (section_id, offset) in undef.locs.iter().take(MAX_UNDEF_REFERENCES) {
        let section = res.sections.section(*section_id);
        let file = res.files.file(section.file);
        msg.push_str(&format!(
            "\n>>> referenced by {}:({}+0x{offset:x})",
            file.name,
            String::from_utf8_lossy(section.name),
        ));
    }
    if undef.locs.len() > MAX_UNDEF_REFERENCES {
        msg.push_str(&format!(
            "\n>>> referenced {} more times",
            undef.locs.len() - MAX_UNDEF_REFERENCES
        ));
    }

    if correct_spelling {
        let mut pre_hint = ": ".to_string();
        let mut post_hint = String::new();
        if let Some(corrected) =
            get_alternative_spelling(res, undef.sym, &mut pre_hint, &mut post_hint)
        {
            let corrected_sym = res.symbols.symbol(corrected);
            msg.push_str(&format!(
                "\n>>> did you mean{pre_hint}{}{post_hint}",
                corrected_sym.name_for_display()
            ));
            if let Some(file) = corrected_sym.file {
                msg.push_str(&format!("\n>>> defined in: {}", res.files.file(file).name));
            }
        }
    }

    if name.starts_with("_ZTV") {
        msg.push_str(
            "\n>>> the vtable symbol may be undefined because the class is missing its key \
             function: the first non-inline virtual member function defined outside the class",
        );
    }

    if undef.is_warning {
        res.diagnostics.warn(msg);
    } else {
        res.diagnostics.error(msg);
    }
}

/// When the undefined symbol was actually defined in a COMDAT section that lost deduplication,
/// explain that instead of claiming it is undefined.
fn maybe_report_discarded(res: &ScanResources, sym_id: SymbolId) -> Option<String> {
    let sym = res.symbols.symbol(sym_id);
    if sym.discarded_sec_idx == 0 {
        return None;
    }
    let file_id = sym.file?;
    let file = res.files.file(file_id);
    if file.kind != FileKind::Object {
        return None;
    }

    let mut msg = if sym.kind == crate::symbol_db::SymbolKind::Section {
        format!(
            "relocation refers to a discarded section: {}",
            String::from_utf8_lossy(file.section_name(sym.discarded_sec_idx))
        )
    } else {
        format!(
            "relocation refers to a symbol in a discarded section: {}",
            sym.name_for_display()
        )
    };
    msg.push_str(&format!("\n>>> defined in {}", file.name));

    if let Some(signature) = file.comdat_signatures.get(&sym.discarded_sec_idx) {
        msg.push_str(&format!(
            "\n>>> section group signature: {}",
            String::from_utf8_lossy(signature)
        ));
        if let Some(prevailing) = res.symbols.comdat_groups.get(signature) {
            msg.push_str(&format!(
                "\n>>> prevailing definition is in {}",
                res.files.file(*prevailing).name
            ));
        }
    }
    Some(msg)
}

fn demangled_function_name(name: &str) -> Option<String> {
    if !name.starts_with("_Z") {
        return None;
    }
    symbolic_common::Name::new(
        name,
        symbolic_common::NameMangling::Mangled,
        symbolic_common::Language::Cpp,
    )
    .demangle(DemangleOptions::name_only())
}

/// Check whether the definition name `def` is a mangled function name that matches the
/// reference name `r`.
fn can_suggest_extern_c_for_cxx(r: &str, def: &str) -> bool {
    demangled_function_name(def).is_some_and(|demangled| demangled == r)
}

/// Computes a suggested alternative spelling for an undefined symbol: a candidate at edit
/// distance one over `[0-9A-Za-z]`, a case-insensitive match, or a missing `extern "C"`.
fn get_alternative_spelling(
    res: &ScanResources,
    sym_id: SymbolId,
    pre_hint: &mut String,
    post_hint: &mut String,
) -> Option<SymbolId> {
    let sym = res.symbols.symbol(sym_id);

    // If the symbol was defined in a discarded section, the discarded-section report already
    // explains the situation; a spelling hint would just be confusing.
    if sym.discarded_sec_idx != 0 {
        return None;
    }

    // Candidate definitions local to the file that made the reference.
    let mut local_map: HashMap<&[u8], SymbolId> = HashMap::new();
    if let Some(file_id) = sym.file {
        for &local in &res.files.file(file_id).local_symbols {
            let s = res.symbols.symbol(local);
            if s.is_defined() && !s.name.bytes().is_empty() {
                local_map.entry(s.name.bytes()).or_insert(local);
            }
        }
    }

    let suggest = |new_name: &[u8]| -> Option<SymbolId> {
        if let Some(&s) = local_map.get(new_name) {
            return Some(s);
        }
        if let Some(s) = res.symbols.find(new_name) {
            if !res.symbols.symbol(s).is_undefined() {
                return Some(s);
            }
        }
        None
    };

    let alphabet = ('0'..='9').chain('A'..='Z').chain('a'..='z');
    let name = sym.name.bytes();

    // Enumerate all strings of Levenshtein distance 1 (plus adjacent transpositions, which are
    // edit distance 2 but common typos) as correction candidates.
    for i in 0..=name.len() {
        // Insert a character before name[i].
        let mut new_name = Vec::with_capacity(name.len() + 1);
        new_name.extend_from_slice(&name[..i]);
        new_name.push(b'0');
        new_name.extend_from_slice(&name[i..]);
        for c in alphabet.clone() {
            new_name[i] = c as u8;
            if let Some(s) = suggest(&new_name) {
                return Some(s);
            }
        }
        if i == name.len() {
            break;
        }

        // Substitute name[i].
        let mut new_name = name.to_vec();
        for c in alphabet.clone() {
            new_name[i] = c as u8;
            if let Some(s) = suggest(&new_name) {
                return Some(s);
            }
        }

        // Transpose name[i] and name[i+1].
        if i + 1 < name.len() {
            new_name[i] = name[i + 1];
            new_name[i + 1] = name[i];
            if let Some(s) = suggest(&new_name) {
                return Some(s);
            }
        }

        // Delete name[i].
        let mut new_name = Vec::with_capacity(name.len() - 1);
        new_name.extend_from_slice(&name[..i]);
        new_name.extend_from_slice(&name[i + 1..]);
        if let Some(s) = suggest(&new_name) {
            return Some(s);
        }
    }

    // Case mismatch, e.g. Foo vs FOO.
    for (&candidate_name, &candidate) in &local_map {
        if name.eq_ignore_ascii_case(candidate_name) {
            return Some(candidate);
        }
    }
    for candidate in res.symbols.symbol_ids() {
        let s = res.symbols.symbol(candidate);
        if !s.is_undefined() && name.eq_ignore_ascii_case(s.name.bytes()) {
            return Some(candidate);
        }
    }

    // The reference may be a mangled name while the definition is not, or the other way around.
    // Suggest a missing extern "C".
    let name_str = std::str::from_utf8(name).ok()?;
    if name_str.starts_with("_Z") {
        if let Some(demangled) = demangled_function_name(name_str) {
            if let Some(s) = suggest(demangled.as_bytes()) {
                *pre_hint = ": extern \"C\" ".to_string();
                return Some(s);
            }
        }
    } else {
        let mut found = None;
        for (&candidate_name, &candidate) in &local_map {
            if let Ok(candidate_str) = std::str::from_utf8(candidate_name) {
                if can_suggest_extern_c_for_cxx(name_str, candidate_str) {
                    found = Some(candidate);
                    break;
                }
            }
        }
        if found.is_none() {
            for candidate in res.symbols.symbol_ids() {
                let s = res.symbols.symbol(candidate);
                if s.is_undefined() {
                    continue;
                }
                if let Ok(candidate_str) = std::str::from_utf8(s.name.bytes()) {
                    if can_suggest_extern_c_for_cxx(name_str, candidate_str) {
                        found = Some(candidate);
                        break;
                    }
                }
            }
        }
        if let Some(s) = found {
            *pre_hint = " to declare ".to_string();
            *post_hint = " as extern \"C\"?".to_string();
            return Some(s);
        }
    }

    None
}
