//! The capability interface the scanner talks to instead of knowing machine encodings. One
//! implementation per supported machine; the scanner receives a `&dyn Target` through the scan
//! environment and never inspects instruction bytes itself.

use crate::error::Result;
use crate::input_data::FileId;
use crate::symbol_db::Symbol;
use linker_utils::elf::RelExpr;
use linker_utils::elf::RelType;

/// Per-machine constants. The relocation types name the machine's encoding of each dynamic
/// relocation class; zero means the machine has no such relocation.
#[derive(Debug, Clone, Copy)]
pub struct TargetInfo {
    /// Word-sized absolute relocation (e.g. `R_X86_64_64`).
    pub symbolic_rel: RelType,
    pub relative_rel: RelType,
    pub plt_rel: RelType,
    pub got_rel: RelType,
    pub tls_got_rel: RelType,
    pub tls_module_index_rel: RelType,
    pub tls_offset_rel: RelType,
    pub tls_desc_rel: RelType,
    pub irelative_rel: RelType,
    pub copy_rel: RelType,

    pub plt_header_size: u64,
    pub plt_entry_size: u64,
    pub iplt_entry_size: u64,

    /// Size of one range-extension thunk, for targets that need them.
    pub thunk_size: u64,
}

pub trait Target {
    fn info(&self) -> &TargetInfo;

    /// Maps a raw relocation type to its abstract expression kind. `loc` is the relocated
    /// location's bytes, for the few types whose classification depends on the instruction.
    fn get_rel_expr(&self, r_type: RelType, sym: &Symbol, loc: &[u8]) -> Result<RelExpr>;

    /// The dynamic relocation to emit when a relocation of type `r_type` lands in a writable
    /// section and cannot be resolved statically. Zero when there is none, which makes the
    /// relocation an error in PIC output.
    fn get_dyn_rel(&self, _r_type: RelType) -> RelType {
        0
    }

    /// Reads the addend stored at the relocated location (REL-format inputs).
    fn get_implicit_addend(&self, _buf: &[u8], _r_type: RelType) -> i64 {
        0
    }

    /// Rewrites a TLS expression for a relaxation decision. Targets with unusual relaxed forms
    /// (e.g. page-granular sequences) override this.
    fn adjust_tls_expr(&self, _r_type: RelType, expr: RelExpr) -> RelExpr {
        expr
    }

    /// Decides whether a GOT-load of a non-preemptible symbol can bypass the GOT. The default
    /// keeps the GOT access.
    fn adjust_got_pc_expr(&self, _r_type: RelType, _addend: i64, _loc: &[u8]) -> RelExpr {
        RelExpr::GotPc
    }

    /// How many relocation records a relaxed GD/LD sequence consumes.
    fn get_tls_gd_relax_skip(&self, _r_type: RelType) -> usize {
        1
    }

    /// True when the relocation only encodes the low, page-offset bits of the value, which makes
    /// it a link-time constant even for addresses that move at load time.
    fn uses_only_low_page_bits(&self, _r_type: RelType) -> bool {
        false
    }

    /// Whether a branch at `src` can reach `dst` with relocation type `r_type`.
    fn in_branch_range(&self, _r_type: RelType, _src: u64, _dst: u64) -> bool {
        true
    }

    /// Whether the branch at `src` needs to be routed through a thunk to reach the symbol at
    /// `sym_va`.
    fn needs_thunk(
        &self,
        _expr: RelExpr,
        _r_type: RelType,
        _file: Option<FileId>,
        _src: u64,
        _sym: &Symbol,
        _sym_va: u64,
        _addend: i64,
    ) -> bool {
        false
    }

    /// Interval at which thunk sections are pre-seeded within executable output sections.
    /// `None` when the target never needs thunks.
    fn thunk_section_spacing(&self) -> Option<u32> {
        None
    }
}
