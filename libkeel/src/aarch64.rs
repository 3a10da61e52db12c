//! AArch64 target hooks. The interesting parts are the page-granular expressions and branch
//! thunks: `bl`/`b` reach +/-128 MiB, so larger executable sections need pre-seeded thunk
//! sections at spaced intervals.

use crate::bail;
use crate::error::Result;
use crate::input_data::FileId;
use crate::symbol_db::Symbol;
use crate::target::Target;
use crate::target::TargetInfo;
use linker_utils::elf::aarch64_rel_type_to_string;
use linker_utils::elf::RelExpr;
use linker_utils::elf::RelType;
use object::elf;

pub struct AArch64;

const BRANCH_RANGE: i64 = 128 * 1024 * 1024;

const INFO: TargetInfo = TargetInfo {
    symbolic_rel: elf::R_AARCH64_ABS64,
    relative_rel: elf::R_AARCH64_RELATIVE,
    plt_rel: elf::R_AARCH64_JUMP_SLOT,
    got_rel: elf::R_AARCH64_GLOB_DAT,
    tls_got_rel: elf::R_AARCH64_TLS_TPREL,
    tls_module_index_rel: elf::R_AARCH64_TLS_DTPMOD,
    tls_offset_rel: elf::R_AARCH64_TLS_DTPREL,
    tls_desc_rel: elf::R_AARCH64_TLSDESC,
    irelative_rel: elf::R_AARCH64_IRELATIVE,
    copy_rel: elf::R_AARCH64_COPY,
    plt_header_size: 32,
    plt_entry_size: 16,
    iplt_entry_size: 16,
    // ldr x16, <literal>; br x16; the address literal.
    thunk_size: 16,
};

fn is_branch_reloc(r_type: RelType) -> bool {
    r_type == elf::R_AARCH64_CALL26 || r_type == elf::R_AARCH64_JUMP26
}

impl Target for AArch64 {
    fn info(&self) -> &TargetInfo {
        &INFO
    }

    fn get_rel_expr(&self, r_type: RelType, sym: &Symbol, _loc: &[u8]) -> Result<RelExpr> {
        let expr = match r_type {
            elf::R_AARCH64_ABS16 | elf::R_AARCH64_ABS32 | elf::R_AARCH64_ABS64 => RelExpr::Abs,
            elf::R_AARCH64_PREL16 | elf::R_AARCH64_PREL32 | elf::R_AARCH64_PREL64 => RelExpr::Pc,
            elf::R_AARCH64_ADR_PREL_PG_HI21 => RelExpr::AArch64PagePc,
            elf::R_AARCH64_ADD_ABS_LO12_NC
            | elf::R_AARCH64_LDST8_ABS_LO12_NC
            | elf::R_AARCH64_LDST16_ABS_LO12_NC
            | elf::R_AARCH64_LDST32_ABS_LO12_NC
            | elf::R_AARCH64_LDST64_ABS_LO12_NC
            | elf::R_AARCH64_LDST128_ABS_LO12_NC => RelExpr::Abs,
            elf::R_AARCH64_CALL26 | elf::R_AARCH64_JUMP26 => RelExpr::PltPc,
            elf::R_AARCH64_ADR_GOT_PAGE => RelExpr::AArch64GotPagePc,
            elf::R_AARCH64_LD64_GOT_LO12_NC => RelExpr::Got,
            elf::R_AARCH64_TLSIE_ADR_GOTTPREL_PAGE21 => RelExpr::AArch64GotPagePc,
            elf::R_AARCH64_TLSIE_LD64_GOTTPREL_LO12_NC => RelExpr::Got,
            elf::R_AARCH64_TLSLE_ADD_TPREL_HI12 | elf::R_AARCH64_TLSLE_ADD_TPREL_LO12_NC => {
                RelExpr::TpRel
            }
            elf::R_AARCH64_TLSDESC_ADR_PAGE21 => RelExpr::AArch64TlsDescPage,
            elf::R_AARCH64_TLSDESC_LD64_LO12 | elf::R_AARCH64_TLSDESC_ADD_LO12 => RelExpr::TlsDesc,
            elf::R_AARCH64_TLSDESC_CALL => RelExpr::TlsDescCall,
            elf::R_AARCH64_NONE => RelExpr::None,
            _ => bail!(
                "unknown relocation ({}) against symbol {}",
                aarch64_rel_type_to_string(r_type),
                sym.name_for_display()
            ),
        };
        Ok(expr)
    }

    fn get_dyn_rel(&self, r_type: RelType) -> RelType {
        if r_type == elf::R_AARCH64_ABS64 {
            return r_type;
        }
        0
    }

    fn get_implicit_addend(&self, buf: &[u8], r_type: RelType) -> i64 {
        match r_type {
            elf::R_AARCH64_ABS32 | elf::R_AARCH64_PREL32 => buf
                .get(..4)
                .map_or(0, |b| i64::from(i32::from_le_bytes(b.try_into().unwrap()))),
            elf::R_AARCH64_ABS64 | elf::R_AARCH64_PREL64 => buf
                .get(..8)
                .map_or(0, |b| i64::from_le_bytes(b.try_into().unwrap())),
            _ => 0,
        }
    }

    fn adjust_tls_expr(&self, r_type: RelType, expr: RelExpr) -> RelExpr {
        if expr == RelExpr::RelaxTlsGdToIe && r_type == elf::R_AARCH64_TLSDESC_ADR_PAGE21 {
            return RelExpr::AArch64RelaxTlsGdToIePagePc;
        }
        expr
    }

    fn uses_only_low_page_bits(&self, r_type: RelType) -> bool {
        matches!(
            r_type,
            elf::R_AARCH64_ADD_ABS_LO12_NC
                | elf::R_AARCH64_LDST8_ABS_LO12_NC
                | elf::R_AARCH64_LDST16_ABS_LO12_NC
                | elf::R_AARCH64_LDST32_ABS_LO12_NC
                | elf::R_AARCH64_LDST64_ABS_LO12_NC
                | elf::R_AARCH64_LDST128_ABS_LO12_NC
                | elf::R_AARCH64_LD64_GOT_LO12_NC
                | elf::R_AARCH64_TLSIE_LD64_GOTTPREL_LO12_NC
                | elf::R_AARCH64_TLSDESC_LD64_LO12
                | elf::R_AARCH64_TLSDESC_ADD_LO12
        )
    }

    fn in_branch_range(&self, r_type: RelType, src: u64, dst: u64) -> bool {
        if !is_branch_reloc(r_type) {
            return true;
        }
        let distance = dst.wrapping_sub(src) as i64;
        (-BRANCH_RANGE..BRANCH_RANGE).contains(&distance)
    }

    fn needs_thunk(
        &self,
        _expr: RelExpr,
        r_type: RelType,
        _file: Option<FileId>,
        src: u64,
        _sym: &Symbol,
        sym_va: u64,
        _addend: i64,
    ) -> bool {
        is_branch_reloc(r_type) && !self.in_branch_range(r_type, src, sym_va)
    }

    fn thunk_section_spacing(&self) -> Option<u32> {
        // Leave room below the full branch range so a thunk section stays reachable even after
        // thunks are added to it.
        Some((128 * 1024 * 1024) - 0x30000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_branch_range() {
        let t = AArch64;
        assert!(t.in_branch_range(elf::R_AARCH64_CALL26, 0x1000, 0x2000));
        assert!(!t.in_branch_range(elf::R_AARCH64_CALL26, 0x1000, 0x1000 + BRANCH_RANGE as u64));
        assert!(t.in_branch_range(
            elf::R_AARCH64_CALL26,
            0x1000 + BRANCH_RANGE as u64,
            0x2000
        ));
        // Non-branch relocations never need thunks.
        assert!(t.in_branch_range(elf::R_AARCH64_ABS64, 0, u64::MAX / 2));
    }
}
