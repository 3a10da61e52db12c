//! MIPS target hooks: enough of the n64 classification table to drive the MIPS GOT, the paired
//! HI16/LO16 addend computation and the no-relaxation TLS paths.

use crate::bail;
use crate::error::Result;
use crate::symbol_db::Symbol;
use crate::target::Target;
use crate::target::TargetInfo;
use linker_utils::bit_misc::BitExtraction;
use linker_utils::elf::mips;
use linker_utils::elf::mips_rel_type_to_string;
use linker_utils::elf::RelExpr;
use linker_utils::elf::RelType;
use object::elf;

pub struct Mips;

const INFO: TargetInfo = TargetInfo {
    symbolic_rel: elf::R_MIPS_64,
    relative_rel: elf::R_MIPS_REL32,
    plt_rel: elf::R_MIPS_JUMP_SLOT,
    got_rel: elf::R_MIPS_64,
    tls_got_rel: elf::R_MIPS_TLS_TPREL64,
    tls_module_index_rel: elf::R_MIPS_TLS_DTPMOD64,
    tls_offset_rel: elf::R_MIPS_TLS_DTPREL64,
    tls_desc_rel: 0,
    irelative_rel: 0,
    copy_rel: elf::R_MIPS_COPY,
    plt_header_size: 32,
    plt_entry_size: 16,
    iplt_entry_size: 16,
    // An LA25 thunk: lui, addiu, jump.
    thunk_size: 16,
};

fn read32(buf: &[u8]) -> u64 {
    buf.get(..4)
        .map_or(0, |b| u64::from(u32::from_le_bytes(b.try_into().unwrap())))
}

impl Target for Mips {
    fn info(&self) -> &TargetInfo {
        &INFO
    }

    fn get_rel_expr(&self, r_type: RelType, sym: &Symbol, _loc: &[u8]) -> Result<RelExpr> {
        let expr = match r_type {
            elf::R_MIPS_NONE => RelExpr::None,
            elf::R_MIPS_16 | elf::R_MIPS_32 | elf::R_MIPS_64 => RelExpr::Abs,
            elf::R_MIPS_26 => RelExpr::Plt,
            elf::R_MIPS_HI16 | elf::R_MIPS_LO16 | mips::R_MICROMIPS_HI16
            | mips::R_MICROMIPS_LO16 => RelExpr::Abs,
            elf::R_MIPS_PC16 | mips::R_MIPS_PCHI16 | mips::R_MIPS_PCLO16 => RelExpr::Pc,
            elf::R_MIPS_GPREL16 | elf::R_MIPS_GPREL32 => RelExpr::MipsGotRel,
            elf::R_MIPS_GOT16 | mips::R_MICROMIPS_GOT16 => {
                if sym.is_local() {
                    RelExpr::MipsGotLocalPage
                } else {
                    RelExpr::MipsGotOff
                }
            }
            elf::R_MIPS_CALL16 => RelExpr::MipsGotOff,
            elf::R_MIPS_TLS_GD => RelExpr::MipsTlsGd,
            elf::R_MIPS_TLS_LDM => RelExpr::MipsTlsLd,
            elf::R_MIPS_TLS_GOTTPREL => RelExpr::MipsGotOff,
            elf::R_MIPS_TLS_TPREL_HI16 | elf::R_MIPS_TLS_TPREL_LO16 => RelExpr::TpRel,
            elf::R_MIPS_TLS_DTPREL_HI16 | elf::R_MIPS_TLS_DTPREL_LO16 => RelExpr::DtpRel,
            _ => bail!(
                "unknown relocation ({}) against symbol {}",
                mips_rel_type_to_string(r_type),
                sym.name_for_display()
            ),
        };
        Ok(expr)
    }

    fn get_dyn_rel(&self, r_type: RelType) -> RelType {
        if r_type == elf::R_MIPS_32 || r_type == elf::R_MIPS_64 {
            return INFO.symbolic_rel;
        }
        0
    }

    fn get_implicit_addend(&self, buf: &[u8], r_type: RelType) -> i64 {
        let v = read32(buf);
        match r_type {
            elf::R_MIPS_32 | elf::R_MIPS_GPREL32 => v.sign_extend(31) as i64,
            elf::R_MIPS_64 => buf
                .get(..8)
                .map_or(0, |b| i64::from_le_bytes(b.try_into().unwrap())),
            elf::R_MIPS_26 => ((v & 0x3ff_ffff) << 2) as i64,
            elf::R_MIPS_GOT16
            | elf::R_MIPS_HI16
            | mips::R_MIPS_PCHI16
            | mips::R_MICROMIPS_HI16 => (v.low_bits_signed(16) as i64) << 16,
            elf::R_MIPS_LO16
            | elf::R_MIPS_GPREL16
            | mips::R_MIPS_PCLO16
            | mips::R_MICROMIPS_LO16
            | elf::R_MIPS_TLS_TPREL_LO16
            | elf::R_MIPS_TLS_DTPREL_LO16 => v.low_bits_signed(16) as i64,
            elf::R_MIPS_PC16 => (v.low_bits_signed(16) as i64) << 2,
            _ => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_implicit_addends() {
        let t = Mips;
        // lui with 0x8000 in the immediate: high part of a negative pair.
        let hi = 0x8000u32.to_le_bytes();
        assert_eq!(
            t.get_implicit_addend(&hi, elf::R_MIPS_HI16),
            -0x8000i64 << 16
        );
        let lo = 0x0004u32.to_le_bytes();
        assert_eq!(t.get_implicit_addend(&lo, elf::R_MIPS_LO16), 4);
        let word = 0xffff_fffcu32.to_le_bytes();
        assert_eq!(t.get_implicit_addend(&word, elf::R_MIPS_32), -4);
    }
}
