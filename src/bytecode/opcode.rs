//! Internal bytecode opcodes.
//!
//! Families occupy contiguous ranges so the operand-layout table and
//! the allocator's rewriter can dispatch on a range instead of listing
//! every member.

// Control flow and variable-length records
pub const OP_UNREACHABLE: u16 = 0;
pub const OP_END: u16 = 1; // count + trailing result offsets
pub const OP_JUMP: u16 = 2; // relative i32 offset
pub const OP_JUMP_IF_TRUE: u16 = 3; // src + relative i32 offset
pub const OP_JUMP_IF_FALSE: u16 = 4;
pub const OP_BR_TABLE: u16 = 5; // cond + size + default + trailing i32 table
pub const OP_CALL: u16 = 6; // counts + index + trailing stack offsets
pub const OP_CALL_INDIRECT: u16 = 7; // counts + callee + table + type + offsets
pub const OP_THROW: u16 = 8; // count + tag + trailing stack offsets
pub const OP_SELECT: u16 = 9; // cond, src0, src1, dst, value size, float flag

// Constant materialization
pub const OP_CONST32: u16 = 10; // dst + 4-byte payload
pub const OP_CONST64: u16 = 11; // dst + 8-byte payload
pub const OP_CONST128: u16 = 12; // dst + 16-byte payload

// Stack-to-stack moves
pub const OP_MOVE32: u16 = 13;
pub const OP_MOVE64: u16 = 14;
pub const OP_MOVE128: u16 = 15;

// Globals, split by slot size
pub const OP_GLOBAL_GET32: u16 = 16; // dst + global index
pub const OP_GLOBAL_GET64: u16 = 17;
pub const OP_GLOBAL_GET128: u16 = 18;
pub const OP_GLOBAL_SET32: u16 = 19; // src + global index
pub const OP_GLOBAL_SET64: u16 = 20;
pub const OP_GLOBAL_SET128: u16 = 21;

// Offset-0 memory fast paths
pub const OP_LOAD32: u16 = 22;
pub const OP_LOAD64: u16 = 23;
pub const OP_STORE32: u16 = 24;
pub const OP_STORE64: u16 = 25;

// Memory management
pub const OP_MEMORY_SIZE: u16 = 26; // dst
pub const OP_MEMORY_GROW: u16 = 27; // src, dst
pub const OP_MEMORY_INIT: u16 = 28; // src0..src2 + segment index
pub const OP_MEMORY_COPY: u16 = 29; // src0..src2
pub const OP_MEMORY_FILL: u16 = 30; // src0..src2
pub const OP_DATA_DROP: u16 = 31; // segment index

// Tables
pub const OP_TABLE_GET: u16 = 32; // src, dst + table index
pub const OP_TABLE_SET: u16 = 33; // src0, src1 + table index
pub const OP_TABLE_GROW: u16 = 34; // src0, src1, dst + table index
pub const OP_TABLE_SIZE: u16 = 35; // dst + table index
pub const OP_TABLE_COPY: u16 = 36; // src0..src2 + dst/src table indices
pub const OP_TABLE_FILL: u16 = 37; // src0..src2 + table index
pub const OP_TABLE_INIT: u16 = 38; // src0..src2 + table + segment indices
pub const OP_ELEM_DROP: u16 = 39; // segment index

pub const OP_REF_FUNC: u16 = 40; // dst + function index

// General memory loads (u32 memarg offset), 41..=54
pub const OP_I32_LOAD: u16 = 41;
pub const OP_I64_LOAD: u16 = 42;
pub const OP_F32_LOAD: u16 = 43;
pub const OP_F64_LOAD: u16 = 44;
pub const OP_I32_LOAD8_S: u16 = 45;
pub const OP_I32_LOAD8_U: u16 = 46;
pub const OP_I32_LOAD16_S: u16 = 47;
pub const OP_I32_LOAD16_U: u16 = 48;
pub const OP_I64_LOAD8_S: u16 = 49;
pub const OP_I64_LOAD8_U: u16 = 50;
pub const OP_I64_LOAD16_S: u16 = 51;
pub const OP_I64_LOAD16_U: u16 = 52;
pub const OP_I64_LOAD32_S: u16 = 53;
pub const OP_I64_LOAD32_U: u16 = 54;
pub const OP_LOAD_FIRST: u16 = OP_I32_LOAD;
pub const OP_LOAD_LAST: u16 = OP_I64_LOAD32_U;

// General memory stores, 55..=63
pub const OP_I32_STORE: u16 = 55;
pub const OP_I64_STORE: u16 = 56;
pub const OP_F32_STORE: u16 = 57;
pub const OP_F64_STORE: u16 = 58;
pub const OP_I32_STORE8: u16 = 59;
pub const OP_I32_STORE16: u16 = 60;
pub const OP_I64_STORE8: u16 = 61;
pub const OP_I64_STORE16: u16 = 62;
pub const OP_I64_STORE32: u16 = 63;
pub const OP_STORE_FIRST: u16 = OP_I32_STORE;
pub const OP_STORE_LAST: u16 = OP_I64_STORE32;

// Binary operations, 64..=139
pub const OP_I32_EQ: u16 = 64;
pub const OP_I32_NE: u16 = 65;
pub const OP_I32_LT_S: u16 = 66;
pub const OP_I32_LT_U: u16 = 67;
pub const OP_I32_GT_S: u16 = 68;
pub const OP_I32_GT_U: u16 = 69;
pub const OP_I32_LE_S: u16 = 70;
pub const OP_I32_LE_U: u16 = 71;
pub const OP_I32_GE_S: u16 = 72;
pub const OP_I32_GE_U: u16 = 73;
pub const OP_I32_ADD: u16 = 74;
pub const OP_I32_SUB: u16 = 75;
pub const OP_I32_MUL: u16 = 76;
pub const OP_I32_DIV_S: u16 = 77;
pub const OP_I32_DIV_U: u16 = 78;
pub const OP_I32_REM_S: u16 = 79;
pub const OP_I32_REM_U: u16 = 80;
pub const OP_I32_AND: u16 = 81;
pub const OP_I32_OR: u16 = 82;
pub const OP_I32_XOR: u16 = 83;
pub const OP_I32_SHL: u16 = 84;
pub const OP_I32_SHR_S: u16 = 85;
pub const OP_I32_SHR_U: u16 = 86;
pub const OP_I32_ROTL: u16 = 87;
pub const OP_I32_ROTR: u16 = 88;
pub const OP_I64_EQ: u16 = 89;
pub const OP_I64_NE: u16 = 90;
pub const OP_I64_LT_S: u16 = 91;
pub const OP_I64_LT_U: u16 = 92;
pub const OP_I64_GT_S: u16 = 93;
pub const OP_I64_GT_U: u16 = 94;
pub const OP_I64_LE_S: u16 = 95;
pub const OP_I64_LE_U: u16 = 96;
pub const OP_I64_GE_S: u16 = 97;
pub const OP_I64_GE_U: u16 = 98;
pub const OP_I64_ADD: u16 = 99;
pub const OP_I64_SUB: u16 = 100;
pub const OP_I64_MUL: u16 = 101;
pub const OP_I64_DIV_S: u16 = 102;
pub const OP_I64_DIV_U: u16 = 103;
pub const OP_I64_REM_S: u16 = 104;
pub const OP_I64_REM_U: u16 = 105;
pub const OP_I64_AND: u16 = 106;
pub const OP_I64_OR: u16 = 107;
pub const OP_I64_XOR: u16 = 108;
pub const OP_I64_SHL: u16 = 109;
pub const OP_I64_SHR_S: u16 = 110;
pub const OP_I64_SHR_U: u16 = 111;
pub const OP_I64_ROTL: u16 = 112;
pub const OP_I64_ROTR: u16 = 113;
pub const OP_F32_EQ: u16 = 114;
pub const OP_F32_NE: u16 = 115;
pub const OP_F32_LT: u16 = 116;
pub const OP_F32_GT: u16 = 117;
pub const OP_F32_LE: u16 = 118;
pub const OP_F32_GE: u16 = 119;
pub const OP_F32_ADD: u16 = 120;
pub const OP_F32_SUB: u16 = 121;
pub const OP_F32_MUL: u16 = 122;
pub const OP_F32_DIV: u16 = 123;
pub const OP_F32_MIN: u16 = 124;
pub const OP_F32_MAX: u16 = 125;
pub const OP_F32_COPYSIGN: u16 = 126;
pub const OP_F64_EQ: u16 = 127;
pub const OP_F64_NE: u16 = 128;
pub const OP_F64_LT: u16 = 129;
pub const OP_F64_GT: u16 = 130;
pub const OP_F64_LE: u16 = 131;
pub const OP_F64_GE: u16 = 132;
pub const OP_F64_ADD: u16 = 133;
pub const OP_F64_SUB: u16 = 134;
pub const OP_F64_MUL: u16 = 135;
pub const OP_F64_DIV: u16 = 136;
pub const OP_F64_MIN: u16 = 137;
pub const OP_F64_MAX: u16 = 138;
pub const OP_F64_COPYSIGN: u16 = 139;
pub const OP_BINARY_FIRST: u16 = OP_I32_EQ;
pub const OP_BINARY_LAST: u16 = OP_F64_COPYSIGN;

// Unary operations, 140..=199
pub const OP_I32_EQZ: u16 = 140;
pub const OP_I32_CLZ: u16 = 141;
pub const OP_I32_CTZ: u16 = 142;
pub const OP_I32_POPCNT: u16 = 143;
pub const OP_I32_EXTEND8_S: u16 = 144;
pub const OP_I32_EXTEND16_S: u16 = 145;
pub const OP_I64_EQZ: u16 = 146;
pub const OP_I64_CLZ: u16 = 147;
pub const OP_I64_CTZ: u16 = 148;
pub const OP_I64_POPCNT: u16 = 149;
pub const OP_I64_EXTEND8_S: u16 = 150;
pub const OP_I64_EXTEND16_S: u16 = 151;
pub const OP_I64_EXTEND32_S: u16 = 152;
pub const OP_F32_ABS: u16 = 153;
pub const OP_F32_NEG: u16 = 154;
pub const OP_F32_CEIL: u16 = 155;
pub const OP_F32_FLOOR: u16 = 156;
pub const OP_F32_TRUNC: u16 = 157;
pub const OP_F32_NEAREST: u16 = 158;
pub const OP_F32_SQRT: u16 = 159;
pub const OP_F64_ABS: u16 = 160;
pub const OP_F64_NEG: u16 = 161;
pub const OP_F64_CEIL: u16 = 162;
pub const OP_F64_FLOOR: u16 = 163;
pub const OP_F64_TRUNC: u16 = 164;
pub const OP_F64_NEAREST: u16 = 165;
pub const OP_F64_SQRT: u16 = 166;
pub const OP_I32_WRAP_I64: u16 = 167;
pub const OP_I64_EXTEND_I32_S: u16 = 168;
pub const OP_I64_EXTEND_I32_U: u16 = 169;
pub const OP_I32_TRUNC_F32_S: u16 = 170;
pub const OP_I32_TRUNC_F32_U: u16 = 171;
pub const OP_I32_TRUNC_F64_S: u16 = 172;
pub const OP_I32_TRUNC_F64_U: u16 = 173;
pub const OP_I64_TRUNC_F32_S: u16 = 174;
pub const OP_I64_TRUNC_F32_U: u16 = 175;
pub const OP_I64_TRUNC_F64_S: u16 = 176;
pub const OP_I64_TRUNC_F64_U: u16 = 177;
pub const OP_I32_TRUNC_SAT_F32_S: u16 = 178;
pub const OP_I32_TRUNC_SAT_F32_U: u16 = 179;
pub const OP_I32_TRUNC_SAT_F64_S: u16 = 180;
pub const OP_I32_TRUNC_SAT_F64_U: u16 = 181;
pub const OP_I64_TRUNC_SAT_F32_S: u16 = 182;
pub const OP_I64_TRUNC_SAT_F32_U: u16 = 183;
pub const OP_I64_TRUNC_SAT_F64_S: u16 = 184;
pub const OP_I64_TRUNC_SAT_F64_U: u16 = 185;
pub const OP_F32_CONVERT_I32_S: u16 = 186;
pub const OP_F32_CONVERT_I32_U: u16 = 187;
pub const OP_F32_CONVERT_I64_S: u16 = 188;
pub const OP_F32_CONVERT_I64_U: u16 = 189;
pub const OP_F32_DEMOTE_F64: u16 = 190;
pub const OP_F64_CONVERT_I32_S: u16 = 191;
pub const OP_F64_CONVERT_I32_U: u16 = 192;
pub const OP_F64_CONVERT_I64_S: u16 = 193;
pub const OP_F64_CONVERT_I64_U: u16 = 194;
pub const OP_F64_PROMOTE_F32: u16 = 195;
pub const OP_I32_REINTERPRET_F32: u16 = 196;
pub const OP_I64_REINTERPRET_F64: u16 = 197;
pub const OP_F32_REINTERPRET_I32: u16 = 198;
pub const OP_F64_REINTERPRET_I64: u16 = 199;
pub const OP_UNARY_FIRST: u16 = OP_I32_EQZ;
pub const OP_UNARY_LAST: u16 = OP_F64_REINTERPRET_I64;

pub const OP_COUNT: u16 = 200;

/// Mnemonic for one opcode, in numbering order.
static NAMES: [&str; OP_COUNT as usize] = [
    "unreachable",
    "end",
    "jump",
    "jump_if_true",
    "jump_if_false",
    "br_table",
    "call",
    "call_indirect",
    "throw",
    "select",
    "const32",
    "const64",
    "const128",
    "move32",
    "move64",
    "move128",
    "global.get32",
    "global.get64",
    "global.get128",
    "global.set32",
    "global.set64",
    "global.set128",
    "load32",
    "load64",
    "store32",
    "store64",
    "memory.size",
    "memory.grow",
    "memory.init",
    "memory.copy",
    "memory.fill",
    "data.drop",
    "table.get",
    "table.set",
    "table.grow",
    "table.size",
    "table.copy",
    "table.fill",
    "table.init",
    "elem.drop",
    "ref.func",
    "i32.load",
    "i64.load",
    "f32.load",
    "f64.load",
    "i32.load8_s",
    "i32.load8_u",
    "i32.load16_s",
    "i32.load16_u",
    "i64.load8_s",
    "i64.load8_u",
    "i64.load16_s",
    "i64.load16_u",
    "i64.load32_s",
    "i64.load32_u",
    "i32.store",
    "i64.store",
    "f32.store",
    "f64.store",
    "i32.store8",
    "i32.store16",
    "i64.store8",
    "i64.store16",
    "i64.store32",
    "i32.eq",
    "i32.ne",
    "i32.lt_s",
    "i32.lt_u",
    "i32.gt_s",
    "i32.gt_u",
    "i32.le_s",
    "i32.le_u",
    "i32.ge_s",
    "i32.ge_u",
    "i32.add",
    "i32.sub",
    "i32.mul",
    "i32.div_s",
    "i32.div_u",
    "i32.rem_s",
    "i32.rem_u",
    "i32.and",
    "i32.or",
    "i32.xor",
    "i32.shl",
    "i32.shr_s",
    "i32.shr_u",
    "i32.rotl",
    "i32.rotr",
    "i64.eq",
    "i64.ne",
    "i64.lt_s",
    "i64.lt_u",
    "i64.gt_s",
    "i64.gt_u",
    "i64.le_s",
    "i64.le_u",
    "i64.ge_s",
    "i64.ge_u",
    "i64.add",
    "i64.sub",
    "i64.mul",
    "i64.div_s",
    "i64.div_u",
    "i64.rem_s",
    "i64.rem_u",
    "i64.and",
    "i64.or",
    "i64.xor",
    "i64.shl",
    "i64.shr_s",
    "i64.shr_u",
    "i64.rotl",
    "i64.rotr",
    "f32.eq",
    "f32.ne",
    "f32.lt",
    "f32.gt",
    "f32.le",
    "f32.ge",
    "f32.add",
    "f32.sub",
    "f32.mul",
    "f32.div",
    "f32.min",
    "f32.max",
    "f32.copysign",
    "f64.eq",
    "f64.ne",
    "f64.lt",
    "f64.gt",
    "f64.le",
    "f64.ge",
    "f64.add",
    "f64.sub",
    "f64.mul",
    "f64.div",
    "f64.min",
    "f64.max",
    "f64.copysign",
    "i32.eqz",
    "i32.clz",
    "i32.ctz",
    "i32.popcnt",
    "i32.extend8_s",
    "i32.extend16_s",
    "i64.eqz",
    "i64.clz",
    "i64.ctz",
    "i64.popcnt",
    "i64.extend8_s",
    "i64.extend16_s",
    "i64.extend32_s",
    "f32.abs",
    "f32.neg",
    "f32.ceil",
    "f32.floor",
    "f32.trunc",
    "f32.nearest",
    "f32.sqrt",
    "f64.abs",
    "f64.neg",
    "f64.ceil",
    "f64.floor",
    "f64.trunc",
    "f64.nearest",
    "f64.sqrt",
    "i32.wrap_i64",
    "i64.extend_i32_s",
    "i64.extend_i32_u",
    "i32.trunc_f32_s",
    "i32.trunc_f32_u",
    "i32.trunc_f64_s",
    "i32.trunc_f64_u",
    "i64.trunc_f32_s",
    "i64.trunc_f32_u",
    "i64.trunc_f64_s",
    "i64.trunc_f64_u",
    "i32.trunc_sat_f32_s",
    "i32.trunc_sat_f32_u",
    "i32.trunc_sat_f64_s",
    "i32.trunc_sat_f64_u",
    "i64.trunc_sat_f32_s",
    "i64.trunc_sat_f32_u",
    "i64.trunc_sat_f64_s",
    "i64.trunc_sat_f64_u",
    "f32.convert_i32_s",
    "f32.convert_i32_u",
    "f32.convert_i64_s",
    "f32.convert_i64_u",
    "f32.demote_f64",
    "f64.convert_i32_s",
    "f64.convert_i32_u",
    "f64.convert_i64_s",
    "f64.convert_i64_u",
    "f64.promote_f32",
    "i32.reinterpret_f32",
    "i64.reinterpret_f64",
    "f32.reinterpret_i32",
    "f64.reinterpret_i64",
];

pub fn name(op: u16) -> &'static str {
    NAMES.get(op as usize).copied().unwrap_or("<bad opcode>")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn family_ranges_are_consistent() {
        assert_eq!(OP_LOAD_LAST - OP_LOAD_FIRST + 1, 14);
        assert_eq!(OP_STORE_LAST - OP_STORE_FIRST + 1, 9);
        assert_eq!(OP_BINARY_LAST - OP_BINARY_FIRST + 1, 76);
        assert_eq!(OP_UNARY_LAST - OP_UNARY_FIRST + 1, 60);
        assert_eq!(OP_UNARY_LAST + 1, OP_COUNT);
    }

    #[test]
    fn names_line_up_with_constants() {
        assert_eq!(name(OP_I32_ADD), "i32.add");
        assert_eq!(name(OP_F64_COPYSIGN), "f64.copysign");
        assert_eq!(name(OP_I32_EQZ), "i32.eqz");
        assert_eq!(name(OP_F64_REINTERPRET_I64), "f64.reinterpret_i64");
        assert_eq!(name(OP_I64_LOAD32_U), "i64.load32_u");
        assert_eq!(name(OP_I64_STORE32), "i64.store32");
        assert_eq!(name(OP_REF_FUNC), "ref.func");
    }
}
