//! Textual disassembly, driven by the same operand descriptors the
//! interpreter uses.

use crate::core::cpu::instruction::{eval_operand_val, insn_name, tables};

/// Render one instruction word. Unknown encodings come out as raw words.
pub fn disassemble(insn: u32) -> String {
    let t = tables();
    let Some(index) = t.decode(insn) else {
        return format!(".word  0x{insn:08x}");
    };

    let mut out = format!("{:<9}", insn_name(index));
    let fields = t.fields(index);

    let mut idx = 0;
    let mut first = true;
    while idx < fields.len() {
        let f = fields[idx];
        if !first {
            out.push(',');
        }
        first = false;

        if f.dis {
            // displacement + register pair
            let imm = eval_operand_val(insn, fields, idx);
            while !fields[idx].chunk_end {
                idx += 1;
            }
            idx += 1;
            let reg = eval_operand_val(insn, fields, idx);
            out.push_str(&format!("{:#x}(r{})", imm as i32, reg));
        } else if f.reg {
            out.push_str(&format!("r{}", eval_operand_val(insn, fields, idx)));
        } else {
            let val = eval_operand_val(insn, fields, idx);
            if f.sig {
                out.push_str(&format!("{:#x}", val as i32));
            } else {
                out.push_str(&format!("{val:#x}"));
            }
        }

        while !fields[idx].chunk_end {
            idx += 1;
        }
        idx += 1;
    }
    out.trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::cpu::instruction::{index_of, tables};

    #[test]
    fn formats_common_shapes() {
        let t = tables();
        let addi = t.encode(index_of("l.addi").unwrap(), &[('D', 3), ('A', 1), ('I', 8)]);
        assert_eq!(disassemble(addi), "l.addi   r3,r1,0x8");
        let lwz = t.encode(index_of("l.lwz").unwrap(), &[('D', 4), ('A', 2), ('I', 0x10)]);
        assert_eq!(disassemble(lwz), "l.lwz    r4,0x10(r2)");
        assert_eq!(disassemble(0x1500_0000), "l.nop    0x0");
        assert_eq!(disassemble(0xffff_ffff), ".word  0xffffffff");
    }
}
