//! Per-input-file state. Files arrive parsed and resolved; the scanner only reads a few
//! attributes and records a couple of per-file decisions (PPC64 TLS-relaxation opt-out, small
//! code model marker).

use hashbrown::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileId(u32);

impl FileId {
    pub fn from_usize(raw: usize) -> Self {
        FileId(u32::try_from(raw).expect("File IDs overflowed 32 bits"))
    }

    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for FileId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    /// A relocatable object that contributes sections.
    Object,

    /// A shared object. Contributes `Shared` symbols only.
    Shared,
}

pub struct InputFile<'data> {
    pub name: String,
    pub kind: FileKind,

    /// The GP0 value from a MIPS `.reginfo` / `.MIPS.options` section. Added to GOT-relative
    /// addends for local symbols.
    pub mips_gp0: i64,

    /// Set when the file contains PPC64 GOT_TLSGD/GOT_TLSLD relocations without the matching
    /// marker relocations. Old IBM XL output; relaxing it would corrupt the call sequences.
    pub ppc64_disable_tls_relax: bool,

    /// The file uses small-code-model relocations against `.toc`.
    pub ppc64_small_code_model_toc_relocs: bool,

    /// Symbols defined locally in this file, in symbol-table order. Feeds the spelling
    /// suggestions for undefined-symbol diagnostics.
    pub local_symbols: Vec<crate::symbol_db::SymbolId>,

    /// Every symbol this file contributed to the symbol table. For shared objects this is the
    /// dynamic symbol table, which the copy-relocation builder walks to find aliases.
    pub symbols: Vec<crate::symbol_db::SymbolId>,

    /// Read-only loadable spans (`PT_LOAD` / `PT_GNU_RELRO` without `PF_W`) of a shared object.
    /// Decides `.bss.rel.ro` vs `.bss` placement for copy relocations.
    pub ro_segments: Vec<std::ops::Range<u64>>,

    /// Input section names by section index, for "discarded section" diagnostics.
    pub section_names: Vec<&'data [u8]>,

    /// COMDAT group signature per member section index.
    pub comdat_signatures: HashMap<usize, &'data [u8]>,
}

impl<'data> InputFile<'data> {
    pub fn new(name: impl Into<String>, kind: FileKind) -> Self {
        InputFile {
            name: name.into(),
            kind,
            mips_gp0: 0,
            ppc64_disable_tls_relax: false,
            ppc64_small_code_model_toc_relocs: false,
            local_symbols: Vec::new(),
            symbols: Vec::new(),
            ro_segments: Vec::new(),
            section_names: Vec::new(),
            comdat_signatures: HashMap::new(),
        }
    }

    pub fn section_name(&self, index: usize) -> &'data [u8] {
        self.section_names.get(index).copied().unwrap_or(b"")
    }
}

#[derive(Default)]
pub struct FileTable<'data> {
    files: Vec<InputFile<'data>>,
}

impl<'data> FileTable<'data> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, file: InputFile<'data>) -> FileId {
        let id = FileId::from_usize(self.files.len());
        self.files.push(file);
        id
    }

    pub fn file(&self, id: FileId) -> &InputFile<'data> {
        &self.files[id.as_usize()]
    }

    pub fn file_mut(&mut self, id: FileId) -> &mut InputFile<'data> {
        &mut self.files[id.as_usize()]
    }
}
