//! Shared scaffolding for the scanner and thunk tests: a bundle owning all the driver-side
//! state, with helpers for building small fake link inputs.

use crate::config::Config;
use crate::error::Diagnostics;
use crate::input_data::FileId;
use crate::input_data::FileKind;
use crate::input_data::FileTable;
use crate::input_data::InputFile;
use crate::resources::ScanResources;
use crate::sections::InputSection;
use crate::sections::OutputSection;
use crate::sections::OutputSectionId;
use crate::sections::SectionId;
use crate::sections::SectionTable;
use crate::symbol_db::Binding;
use crate::symbol_db::Symbol;
use crate::symbol_db::SymbolDb;
use crate::symbol_db::SymbolId;
use crate::symbol_db::SymbolKind;
use crate::symbol_db::SymbolValue;
use crate::synthetic::SyntheticSections;
use crate::target::Target;
use crate::undefined::UndefinedDiag;
use linker_utils::elf::shf;
use linker_utils::elf::SectionFlags;

/// Installs a subscriber so failing tests come with the scanner's trace output. Safe to call
/// from every test.
pub(crate) fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub(crate) struct TestEnv<'data> {
    pub(crate) config: Config,
    pub(crate) symbols: SymbolDb<'data>,
    pub(crate) files: FileTable<'data>,
    pub(crate) sections: SectionTable<'data>,
    pub(crate) output_sections: Vec<OutputSection>,
    pub(crate) synthetic: SyntheticSections,
    pub(crate) diagnostics: Diagnostics,
    pub(crate) undefs: Vec<UndefinedDiag>,
    pub(crate) ppc64_no_toc_relax: hashbrown::HashSet<(SymbolId, i64)>,
}

impl<'data> TestEnv<'data> {
    pub(crate) fn new(config: Config) -> Self {
        let synthetic = SyntheticSections::new(&config);
        let diagnostics = Diagnostics::new(config.noinhibit_exec);
        TestEnv {
            config,
            symbols: SymbolDb::new(),
            files: FileTable::new(),
            sections: SectionTable::new(),
            output_sections: Vec::new(),
            synthetic,
            diagnostics,
            undefs: Vec::new(),
            ppc64_no_toc_relax: hashbrown::HashSet::new(),
        }
    }

    pub(crate) fn resources<'a>(
        &'a mut self,
        names: &'data bumpalo::Bump,
        target: &'a dyn Target,
    ) -> ScanResources<'data, 'a> {
        ScanResources {
            config: &self.config,
            target,
            names,
            symbols: &mut self.symbols,
            files: &mut self.files,
            sections: &mut self.sections,
            output_sections: &mut self.output_sections,
            synthetic: &mut self.synthetic,
            diagnostics: &mut self.diagnostics,
            undefs: &mut self.undefs,
            ppc64_no_toc_relax: &mut self.ppc64_no_toc_relax,
        }
    }

    /// Adds an input file whose symbol index 0 is the usual null symbol.
    pub(crate) fn add_file(&mut self, name: &str, kind: FileKind) -> FileId {
        let mut file = InputFile::new(name, kind);
        let null = self.symbols.add(Symbol::new(
            b"",
            Binding::Local,
            SymbolKind::NoType,
            SymbolValue::Defined {
                section: None,
                value: 0,
                size: 0,
            },
        ));
        file.symbols.push(null);
        self.files.add(file)
    }

    /// Adds a symbol to the table and registers it with the file; returns the id and the
    /// file-local symbol index relocations use.
    pub(crate) fn add_symbol(
        &mut self,
        file_id: FileId,
        mut symbol: Symbol<'data>,
    ) -> (SymbolId, u32) {
        symbol.file = Some(file_id);
        let is_local = symbol.is_local();
        let id = self.symbols.add(symbol);
        let file = self.files.file_mut(file_id);
        file.symbols.push(id);
        if is_local {
            file.local_symbols.push(id);
        }
        (id, (file.symbols.len() - 1) as u32)
    }

    pub(crate) fn add_section(
        &mut self,
        file_id: FileId,
        name: &'data [u8],
        flags: SectionFlags,
        data: &'data [u8],
    ) -> SectionId {
        self.sections
            .add(InputSection::new(file_id, name, flags, data))
    }

    pub(crate) fn add_text_section(&mut self, file_id: FileId, data: &'data [u8]) -> SectionId {
        self.add_section(
            file_id,
            b".text",
            shf::ALLOC.with(shf::EXECINSTR),
            data,
        )
    }

    pub(crate) fn add_output_section(
        &mut self,
        name: &str,
        addr: u64,
        flags: SectionFlags,
    ) -> OutputSectionId {
        let id = OutputSectionId::from_usize(self.output_sections.len());
        self.output_sections.push(OutputSection::new(name, addr, flags));
        id
    }

    /// A defined, non-preemptible symbol at `value` within the given section.
    pub(crate) fn defined_symbol(
        name: &'data [u8],
        kind: SymbolKind,
        section: SectionId,
        value: u64,
        size: u64,
    ) -> Symbol<'data> {
        Symbol::new(
            name,
            Binding::Global,
            kind,
            SymbolValue::Defined {
                section: Some(crate::sections::SectionRef::Input(section)),
                value,
                size,
            },
        )
    }
}
