//! The resolved symbol table. Symbol resolution happened upstream; what arrives here is one
//! `Symbol` per distinct name (plus file-local symbols), already bound to its defining file. The
//! scanner mutates symbols in place: it sets bookkeeping flags, assigns PLT indices and, for copy
//! relocations and canonical PLT entries, replaces `Shared` symbols with `Defined` ones.

use crate::input_data::FileId;
use crate::sections::SectionRef;
use crate::symbol::PassThroughHashMap;
use crate::symbol::PreHashed;
use crate::symbol::SymbolName;
use bitflags::bitflags;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SymbolId(u32);

impl SymbolId {
    pub fn from_usize(raw: usize) -> Self {
        SymbolId(u32::try_from(raw).expect("Symbol IDs overflowed 32 bits"))
    }

    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for SymbolId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

bitflags! {
    /// Bookkeeping state the scanner accumulates per symbol.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SymbolFlags: u16 {
        /// A GOT entry has been allocated.
        const IN_GOT = 1 << 0;

        /// A PLT (and GOT.PLT) entry has been allocated.
        const IN_PLT = 1 << 1;

        /// The symbol's PLT entry lives in the ifunc PLT.
        const IN_IPLT = 1 << 2;

        /// GOT-generating references to this non-preemptible ifunc are being served by its
        /// IGOT.PLT slot. If the PLT entry later becomes canonical, a real GOT entry replaces
        /// this arrangement.
        const GOT_IN_IGOT = 1 << 3;

        /// The symbol's address, as seen by other modules, is its PLT entry.
        const NEEDS_PLT_ADDR = 1 << 4;

        /// The symbol must appear in the dynamic symbol table.
        const EXPORT_DYNAMIC = 1 << 5;

        /// A regular object referenced the symbol.
        const USED_IN_REGULAR_OBJ = 1 << 6;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Binding {
    Local,
    Global,
    Weak,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Default,
    Internal,
    Hidden,
    Protected,
}

impl Visibility {
    pub fn prefix(self) -> &'static str {
        match self {
            Visibility::Default => "",
            Visibility::Internal => "internal ",
            Visibility::Hidden => "hidden ",
            Visibility::Protected => "protected ",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolKind {
    NoType,
    Object,
    Func,
    Tls,
    IFunc,
    Section,
}

/// The variant tag of a symbol. Mutated in place during scanning: copy relocations and canonical
/// PLT entries promote `Shared` symbols to `Defined`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolValue {
    Undefined,

    Defined {
        /// `None` means an absolute symbol.
        section: Option<SectionRef>,
        value: u64,
        size: u64,
    },

    Shared {
        value: u64,
        size: u64,
        alignment: u64,
    },

    Lazy,
}

pub struct Symbol<'data> {
    pub name: PreHashed<SymbolName<'data>>,

    /// The version suffix, when the reference carried one (`name@version`).
    pub version: Option<&'data [u8]>,

    pub binding: Binding,
    pub visibility: Visibility,
    pub kind: SymbolKind,
    pub file: Option<FileId>,

    /// Whether the definition may be replaced by another module at load time.
    pub is_preemptible: bool,

    /// Defined by a linker script assignment. Its final value is computed late but is still a
    /// link-time constant.
    pub script_defined: bool,

    /// Non-zero when the symbol was defined in a section that was discarded (COMDAT
    /// deduplication). Index of the discarded section in its file.
    pub discarded_sec_idx: usize,

    pub flags: SymbolFlags,

    /// Index of the symbol's PLT entry, within either the PLT or the ifunc PLT depending on
    /// `SymbolFlags::IN_IPLT`.
    pub plt_index: Option<u32>,

    pub value: SymbolValue,
}

impl<'data> Symbol<'data> {
    pub fn new(name: &'data [u8], binding: Binding, kind: SymbolKind, value: SymbolValue) -> Self {
        Symbol {
            name: SymbolName::prehashed(name),
            version: None,
            binding,
            visibility: Visibility::Default,
            kind,
            file: None,
            is_preemptible: false,
            script_defined: false,
            discarded_sec_idx: 0,
            flags: SymbolFlags::empty(),
            plt_index: None,
            value,
        }
    }

    pub fn is_local(&self) -> bool {
        self.binding == Binding::Local
    }

    pub fn is_weak(&self) -> bool {
        self.binding == Binding::Weak
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self.value, SymbolValue::Undefined)
    }

    pub fn is_undef_weak(&self) -> bool {
        self.is_weak() && self.is_undefined()
    }

    pub fn is_defined(&self) -> bool {
        matches!(self.value, SymbolValue::Defined { .. })
    }

    pub fn is_shared(&self) -> bool {
        matches!(self.value, SymbolValue::Shared { .. })
    }

    pub fn is_func(&self) -> bool {
        self.kind == SymbolKind::Func
    }

    pub fn is_object(&self) -> bool {
        self.kind == SymbolKind::Object
    }

    pub fn is_tls(&self) -> bool {
        self.kind == SymbolKind::Tls
    }

    pub fn is_ifunc(&self) -> bool {
        self.kind == SymbolKind::IFunc
    }

    pub fn is_in_got(&self) -> bool {
        self.flags.contains(SymbolFlags::IN_GOT)
    }

    pub fn is_in_plt(&self) -> bool {
        self.flags.contains(SymbolFlags::IN_PLT)
    }

    pub fn is_in_iplt(&self) -> bool {
        self.flags.contains(SymbolFlags::IN_IPLT)
    }

    pub fn got_in_igot(&self) -> bool {
        self.flags.contains(SymbolFlags::GOT_IN_IGOT)
    }

    /// True for a non-preemptible symbol whose value doesn't move with the load address: an
    /// undefined weak reference (always resolves to zero) or a section-less definition.
    pub fn is_absolute(&self) -> bool {
        if self.is_undef_weak() {
            return true;
        }
        matches!(
            self.value,
            SymbolValue::Defined { section: None, .. }
        )
    }

    pub fn name_for_display(&self) -> String {
        self.name.to_string()
    }
}

pub struct SymbolDb<'data> {
    symbols: Vec<Symbol<'data>>,
    global_names: PassThroughHashMap<SymbolName<'data>, SymbolId>,

    /// COMDAT group signature -> the file whose copy of the group prevailed.
    pub comdat_groups: hashbrown::HashMap<&'data [u8], FileId>,
}

impl<'data> SymbolDb<'data> {
    pub fn new() -> Self {
        SymbolDb {
            symbols: Vec::new(),
            global_names: PassThroughHashMap::default(),
            comdat_groups: hashbrown::HashMap::new(),
        }
    }

    /// Adds a symbol. Non-local symbols are registered for name lookup; the first registration
    /// of a name wins, matching resolution order upstream.
    pub fn add(&mut self, symbol: Symbol<'data>) -> SymbolId {
        let id = SymbolId::from_usize(self.symbols.len());
        if !symbol.is_local() {
            self.global_names.entry(symbol.name).or_insert(id);
        }
        self.symbols.push(symbol);
        id
    }

    /// Duplicates a symbol without registering the copy for name lookup. Used for the hidden
    /// alias that an IRELATIVE relocation targets when a non-preemptible ifunc's original symbol
    /// might later be redirected to a canonical PLT entry.
    pub fn clone_unnamed(&mut self, id: SymbolId) -> SymbolId {
        let copy = {
            let sym = self.symbol(id);
            Symbol {
                name: sym.name,
                version: sym.version,
                binding: sym.binding,
                visibility: sym.visibility,
                kind: sym.kind,
                file: sym.file,
                is_preemptible: sym.is_preemptible,
                script_defined: sym.script_defined,
                discarded_sec_idx: sym.discarded_sec_idx,
                flags: SymbolFlags::empty(),
                plt_index: None,
                value: sym.value,
            }
        };
        let new_id = SymbolId::from_usize(self.symbols.len());
        self.symbols.push(copy);
        new_id
    }

    pub fn find(&self, name: &[u8]) -> Option<SymbolId> {
        self.global_names
            .get(&SymbolName::prehashed(name))
            .copied()
    }

    pub fn symbol(&self, id: SymbolId) -> &Symbol<'data> {
        &self.symbols[id.as_usize()]
    }

    pub fn symbol_mut(&mut self, id: SymbolId) -> &mut Symbol<'data> {
        &mut self.symbols[id.as_usize()]
    }

    pub fn num_symbols(&self) -> usize {
        self.symbols.len()
    }

    pub fn symbol_ids(&self) -> impl Iterator<Item = SymbolId> {
        (0..self.symbols.len()).map(SymbolId::from_usize)
    }
}

impl Default for SymbolDb<'_> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_skips_locals() {
        let mut db = SymbolDb::new();
        let local = db.add(Symbol::new(
            b"foo",
            Binding::Local,
            SymbolKind::Func,
            SymbolValue::Undefined,
        ));
        let global = db.add(Symbol::new(
            b"foo",
            Binding::Global,
            SymbolKind::Func,
            SymbolValue::Undefined,
        ));
        assert_ne!(local, global);
        assert_eq!(db.find(b"foo"), Some(global));
        assert_eq!(db.find(b"bar"), None);
    }

    #[test]
    fn test_undef_weak_is_absolute() {
        let sym = Symbol::new(
            b"w",
            Binding::Weak,
            SymbolKind::NoType,
            SymbolValue::Undefined,
        );
        assert!(sym.is_undef_weak());
        assert!(sym.is_absolute());
    }
}
