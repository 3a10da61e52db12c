//! x86-64 target hooks for the scanner: classification of raw relocation types into abstract
//! expressions, the GOTPCRELX relaxation decision and the dynamic-relocation table.

use crate::bail;
use crate::error::Result;
use crate::symbol_db::Symbol;
use crate::target::Target;
use crate::target::TargetInfo;
use linker_utils::elf::x86_64_rel_type_to_string;
use linker_utils::elf::RelExpr;
use linker_utils::elf::RelType;
use object::elf;

pub struct X86_64;

const INFO: TargetInfo = TargetInfo {
    symbolic_rel: elf::R_X86_64_64,
    relative_rel: elf::R_X86_64_RELATIVE,
    plt_rel: elf::R_X86_64_JUMP_SLOT,
    got_rel: elf::R_X86_64_GLOB_DAT,
    tls_got_rel: elf::R_X86_64_TPOFF64,
    tls_module_index_rel: elf::R_X86_64_DTPMOD64,
    tls_offset_rel: elf::R_X86_64_DTPOFF64,
    tls_desc_rel: elf::R_X86_64_TLSDESC,
    irelative_rel: elf::R_X86_64_IRELATIVE,
    copy_rel: elf::R_X86_64_COPY,
    plt_header_size: 16,
    plt_entry_size: 16,
    iplt_entry_size: 16,
    thunk_size: 0,
};

impl Target for X86_64 {
    fn info(&self) -> &TargetInfo {
        &INFO
    }

    fn get_rel_expr(&self, r_type: RelType, sym: &Symbol, _loc: &[u8]) -> Result<RelExpr> {
        let expr = match r_type {
            elf::R_X86_64_8
            | elf::R_X86_64_16
            | elf::R_X86_64_32
            | elf::R_X86_64_32S
            | elf::R_X86_64_64 => RelExpr::Abs,
            elf::R_X86_64_DTPOFF32 | elf::R_X86_64_DTPOFF64 => RelExpr::DtpRel,
            elf::R_X86_64_TPOFF32 | elf::R_X86_64_TPOFF64 => RelExpr::TpRel,
            elf::R_X86_64_TLSDESC_CALL => RelExpr::TlsDescCall,
            elf::R_X86_64_TLSLD => RelExpr::TlsLdPc,
            elf::R_X86_64_TLSGD => RelExpr::TlsGdPc,
            elf::R_X86_64_GOTTPOFF => RelExpr::GotPc,
            elf::R_X86_64_GOTPC32_TLSDESC => RelExpr::TlsDescPc,
            elf::R_X86_64_PC8 | elf::R_X86_64_PC16 | elf::R_X86_64_PC32 | elf::R_X86_64_PC64 => {
                RelExpr::Pc
            }
            elf::R_X86_64_GOT32 | elf::R_X86_64_GOT64 => RelExpr::GotPlt,
            elf::R_X86_64_GOTPC32 | elf::R_X86_64_GOTPC64 => RelExpr::GotPltOnlyPc,
            elf::R_X86_64_GOTPCREL
            | elf::R_X86_64_GOTPCRELX
            | elf::R_X86_64_REX_GOTPCRELX
            | elf::R_X86_64_GOTPCREL64 => RelExpr::GotPc,
            elf::R_X86_64_GOTOFF64 => RelExpr::GotPltRel,
            elf::R_X86_64_PLTOFF64 => RelExpr::PltGotPlt,
            elf::R_X86_64_PLT32 => RelExpr::PltPc,
            elf::R_X86_64_SIZE32 | elf::R_X86_64_SIZE64 => RelExpr::Size,
            elf::R_X86_64_NONE => RelExpr::None,
            _ => bail!(
                "unknown relocation ({}) against symbol {}",
                x86_64_rel_type_to_string(r_type),
                sym.name_for_display()
            ),
        };
        Ok(expr)
    }

    fn get_dyn_rel(&self, r_type: RelType) -> RelType {
        if r_type == elf::R_X86_64_64
            || r_type == elf::R_X86_64_PC64
            || r_type == elf::R_X86_64_SIZE32
            || r_type == elf::R_X86_64_SIZE64
        {
            return r_type;
        }
        0
    }

    fn get_implicit_addend(&self, buf: &[u8], r_type: RelType) -> i64 {
        match r_type {
            elf::R_X86_64_8 | elf::R_X86_64_PC8 => {
                buf.first().map_or(0, |&b| i64::from(b as i8))
            }
            elf::R_X86_64_16 | elf::R_X86_64_PC16 => buf
                .get(..2)
                .map_or(0, |b| i64::from(i16::from_le_bytes(b.try_into().unwrap()))),
            elf::R_X86_64_32
            | elf::R_X86_64_32S
            | elf::R_X86_64_PC32
            | elf::R_X86_64_GOTPCREL
            | elf::R_X86_64_PLT32
            | elf::R_X86_64_TLSGD
            | elf::R_X86_64_TLSLD => buf
                .get(..4)
                .map_or(0, |b| i64::from(i32::from_le_bytes(b.try_into().unwrap()))),
            elf::R_X86_64_64 | elf::R_X86_64_PC64 => buf
                .get(..8)
                .map_or(0, |b| i64::from_le_bytes(b.try_into().unwrap())),
            _ => 0,
        }
    }

    fn adjust_got_pc_expr(&self, r_type: RelType, addend: i64, _loc: &[u8]) -> RelExpr {
        // Only GOTPCRELX-marked instructions may be rewritten to skip the GOT, and only when
        // they address the GOT entry itself (addend of -4).
        if (r_type == elf::R_X86_64_GOTPCRELX || r_type == elf::R_X86_64_REX_GOTPCRELX)
            && addend == -4
        {
            return RelExpr::RelaxGotPc;
        }
        RelExpr::GotPc
    }

    fn get_tls_gd_relax_skip(&self, _r_type: RelType) -> usize {
        // A relaxed GD/LD sequence consumes the marker relocation and the paired call to
        // __tls_get_addr.
        2
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbol_db::Binding;
    use crate::symbol_db::SymbolKind;
    use crate::symbol_db::SymbolValue;

    #[test]
    fn test_rel_expr_classification() {
        let sym = Symbol::new(b"x", Binding::Global, SymbolKind::Func, SymbolValue::Undefined);
        let t = X86_64;
        assert_eq!(
            t.get_rel_expr(elf::R_X86_64_GOTPCREL, &sym, &[]).unwrap(),
            RelExpr::GotPc
        );
        assert_eq!(
            t.get_rel_expr(elf::R_X86_64_PLT32, &sym, &[]).unwrap(),
            RelExpr::PltPc
        );
        assert_eq!(
            t.get_rel_expr(elf::R_X86_64_TLSGD, &sym, &[]).unwrap(),
            RelExpr::TlsGdPc
        );
        assert_eq!(
            t.get_rel_expr(elf::R_X86_64_NONE, &sym, &[]).unwrap(),
            RelExpr::None
        );
        assert!(t.get_rel_expr(0xffff, &sym, &[]).is_err());
    }

    #[test]
    fn test_gotpcrelx_relaxation_gate() {
        let t = X86_64;
        assert_eq!(
            t.adjust_got_pc_expr(elf::R_X86_64_GOTPCRELX, -4, &[]),
            RelExpr::RelaxGotPc
        );
        assert_eq!(
            t.adjust_got_pc_expr(elf::R_X86_64_GOTPCRELX, 0, &[]),
            RelExpr::GotPc
        );
        assert_eq!(
            t.adjust_got_pc_expr(elf::R_X86_64_GOTPCREL, -4, &[]),
            RelExpr::GotPc
        );
    }
}
