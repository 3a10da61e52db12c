//! Link configuration. The driver owns a `Config` and passes it through the scan environment.
//! Only the switches the scanning core actually consults live here; command-line parsing happens
//! upstream.

/// What to do about references to symbols nobody defines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnresolvedPolicy {
    #[default]
    Error,
    Warn,
    Ignore,
}

#[derive(Debug, Clone)]
pub struct Config {
    /// The ELF machine number of the output (`object::elf::EM_*`).
    pub emachine: u16,

    /// True when producing a shared object.
    pub shared: bool,

    /// True when producing a position-independent executable.
    pub pie: bool,

    /// Size in bytes of a target word. GOT slot allocation depends on this.
    pub wordsize: u64,

    pub is_mips64_el: bool,
    pub mips_n32_abi: bool,
    pub is_cheri_abi: bool,

    /// `-z text` (the default): reject dynamic relocations in read-only sections.
    pub z_text: bool,

    /// `-z copyreloc` (the default): permit copy relocations for direct data references into
    /// shared objects.
    pub z_copyreloc: bool,

    /// `-z ifunc-noplt`: don't make PLT entries for ifuncs, emit the relocations as-is for the
    /// dynamic loader instead.
    pub z_ifunc_noplt: bool,

    /// `--noinhibit-exec`: downgrade recoverable errors to warnings.
    pub noinhibit_exec: bool,

    pub unresolved_symbols: UnresolvedPolicy,

    /// `-z ignore-function-address-equality` / the data equivalent. Permit preempting a
    /// protected-visibility shared definition even though addresses will disagree.
    pub ignore_function_address_equality: bool,
    pub ignore_data_address_equality: bool,

    /// `--pack-dyn-relocs=relr`: pack relative dynamic relocations into `.relr.dyn`.
    pub pack_dyn_relocs_relr: bool,

    /// AArch64 errata workarounds. These make thunk sections round their sizes up to 4 KiB in
    /// large layouts so that inserting thunks doesn't invalidate errata patches.
    pub fix_cortex_a53_843419: bool,
    pub fix_cortex_a8: bool,
}

impl Config {
    /// Position-independent output: a shared object or a PIE.
    pub fn is_pic(&self) -> bool {
        self.pie || self.shared
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            emachine: object::elf::EM_X86_64,
            shared: false,
            pie: false,
            wordsize: 8,
            is_mips64_el: false,
            mips_n32_abi: false,
            is_cheri_abi: false,
            z_text: true,
            z_copyreloc: true,
            z_ifunc_noplt: false,
            noinhibit_exec: false,
            unresolved_symbols: UnresolvedPolicy::Error,
            ignore_function_address_equality: false,
            ignore_data_address_equality: false,
            pack_dyn_relocs_relr: false,
            fix_cortex_a53_843419: false,
            fix_cortex_a8: false,
        }
    }
}
