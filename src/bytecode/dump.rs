//! Optional bytecode dumps, gated by the `DUMP_BYTECODE` environment
//! variable. Dumping never changes what the compiler produces.

use std::env;
use std::fmt::Write;

use crate::bytecode::opcode::*;
use crate::bytecode::{
    InstrReader, BR_TABLE_COND_AT, CALL_INDEX_AT, CALL_INDIRECT_CALLEE_AT, CALL_INDIRECT_TABLE_AT,
    CALL_INDIRECT_TYPE_AT, JUMP_OFFSET_AT,
};
use crate::module::ModuleFunction;

pub fn enabled() -> bool {
    env::var("DUMP_BYTECODE").map(|v| !v.is_empty()).unwrap_or(false)
}

pub fn print_function(func: &ModuleFunction) {
    print!("{}", render_function(func));
}

/// Render one compiled function: every instruction with its operand
/// offsets, the catch table, and local live ranges when recorded.
pub fn render_function(func: &ModuleFunction) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "=== function (type {}) stack_size={} ===",
        func.type_index(),
        func.required_stack_size()
    );

    for instr in InstrReader::new(func.bytecode()) {
        let op = instr.opcode();
        let _ = write!(out, "  {:4}: {}", instr.pos, instr.name());
        match op {
            OP_JUMP => {
                let _ = write!(out, " offset={:+}", instr.branch_offset());
            }
            OP_JUMP_IF_TRUE | OP_JUMP_IF_FALSE => {
                let _ = write!(
                    out,
                    " src={} offset={:+}",
                    instr.u16_at(2),
                    instr.i32_at(JUMP_OFFSET_AT)
                );
            }
            OP_BR_TABLE => {
                let (default, cases) = instr.br_table_targets();
                let _ = write!(
                    out,
                    " cond={} default={:+} cases={:?}",
                    instr.u16_at(BR_TABLE_COND_AT),
                    default,
                    cases
                );
            }
            OP_CALL => {
                let _ = write!(
                    out,
                    " func={} offsets={:?}",
                    instr.u32_at(CALL_INDEX_AT),
                    instr.offset_table()
                );
            }
            OP_CALL_INDIRECT => {
                let _ = write!(
                    out,
                    " callee={} table={} type={} offsets={:?}",
                    instr.u16_at(CALL_INDIRECT_CALLEE_AT),
                    instr.u32_at(CALL_INDIRECT_TABLE_AT),
                    instr.u32_at(CALL_INDIRECT_TYPE_AT),
                    instr.offset_table()
                );
            }
            OP_END | OP_THROW => {
                let _ = write!(out, " offsets={:?}", instr.offset_table());
            }
            OP_CONST32 => {
                let _ = write!(out, " dst={} value={:#x}", instr.u16_at(2), instr.u32_at(4));
            }
            OP_CONST64 => {
                let _ = write!(out, " dst={} value={:#x}", instr.u16_at(2), instr.u64_at(4));
            }
            OP_CONST128 => {
                let _ = write!(out, " dst={}", instr.u16_at(2));
            }
            _ => {
                if let Some(dst) = instr.dst() {
                    let _ = write!(out, " dst={dst}");
                }
                if let Some(src0) = instr.src0() {
                    let _ = write!(out, " src0={src0}");
                }
                if let Some(src1) = instr.src1() {
                    let _ = write!(out, " src1={src1}");
                }
                if let Some(extra) = instr.extra() {
                    let _ = write!(out, " extra={extra}");
                }
            }
        }
        let _ = writeln!(out);
    }

    for entry in func.catch_table() {
        let _ = writeln!(
            out,
            "  catch try={}..{} handler={} stack={} tag={:?}",
            entry.try_start,
            entry.try_end,
            entry.catch_start,
            entry.stack_size_to_be,
            entry.tag_index
        );
    }
    for (i, (start, end)) in func.local_ranges().iter().enumerate() {
        let _ = writeln!(out, "  range {i}: {start}..{end}");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::CodeBuffer;

    #[test]
    fn renders_instruction_lines() {
        let mut code = CodeBuffer::new();
        code.push_u16(OP_CONST32);
        code.push_u16(8);
        code.push_u32(7);
        code.push_u16(OP_I32_ADD);
        code.push_u16(0);
        code.push_u16(4);
        code.push_u16(8);
        let mut func = ModuleFunction::new(0);
        func.code = code;
        func.required_stack_size = 12;

        let text = render_function(&func);
        assert!(text.contains("const32 dst=8 value=0x7"));
        assert!(text.contains("i32.add dst=8 src0=0 src1=4"));
        assert!(text.contains("stack_size=12"));
    }
}
