use anyhow::Result;
use limpet::opcode::*;
use limpet::{parse_module, InstrReader, ModuleFunction, ParsedModule};

fn compile_wat(wat: &str) -> Result<ParsedModule> {
    let bytes = wat::parse_str(wat)?;
    Ok(parse_module(&bytes)?)
}

fn opcodes(func: &ModuleFunction) -> Vec<u16> {
    InstrReader::new(func.bytecode()).map(|i| i.opcode()).collect()
}

fn instr_at(func: &ModuleFunction, index: usize) -> limpet::Instr<'_> {
    InstrReader::new(func.bytecode())
        .nth(index)
        .expect("instruction index out of range")
}

#[test]
fn params_alias_into_operands_without_moves() -> Result<()> {
    let module = compile_wat(
        r#"(module
            (func (export "add") (param i32 i32) (result i32)
                local.get 0
                local.get 1
                i32.add))"#,
    )?;
    let func = &module.functions[0];

    assert_eq!(opcodes(func), vec![OP_I32_ADD, OP_END]);
    let add = instr_at(func, 0);
    assert_eq!(add.src0(), Some(0));
    assert_eq!(add.src1(), Some(4));
    assert_eq!(add.dst(), Some(8));
    let end = instr_at(func, 1);
    assert_eq!(end.offset_table(), vec![8]);
    // Params occupy 8 bytes, the result slot 4 more.
    assert_eq!(func.required_stack_size(), 12);
    Ok(())
}

#[test]
fn repeated_constant_is_pooled_and_materialized_once() -> Result<()> {
    let module = compile_wat(
        r#"(module
            (func (result i32) (local i32)
                i32.const 7
                local.set 0
                local.get 0
                i32.const 7
                i32.add))"#,
    )?;
    let func = &module.functions[0];

    assert_eq!(
        opcodes(func),
        vec![OP_CONST32, OP_MOVE32, OP_I32_ADD, OP_END]
    );
    let prelude = instr_at(func, 0);
    assert_eq!(prelude.u32_at(4), 7);
    let const_slot = prelude.dst().unwrap();

    // The local.set reads the pooled slot; the add reuses it directly.
    let mv = instr_at(func, 1);
    assert_eq!(mv.src0(), Some(const_slot));
    let local_slot = mv.dst().unwrap();

    let add = instr_at(func, 2);
    assert_eq!(add.src0(), Some(local_slot));
    assert_eq!(add.src1(), Some(const_slot));

    let end = instr_at(func, 3);
    assert_eq!(end.offset_table(), vec![add.dst().unwrap()]);

    // The packed frame holds the constant, the local and the result.
    assert_eq!(func.required_stack_size(), 8);
    Ok(())
}

#[test]
fn branch_out_of_block_jumps_to_its_end() -> Result<()> {
    let module = compile_wat(
        r#"(module
            (func (result i32)
                (block (result i32)
                    i32.const 1
                    br 0
                    i32.const 2)))"#,
    )?;
    let func = &module.functions[0];

    // The unreachable `i32.const 2` produces no live instruction; the
    // block result travels through its canonical slot.
    assert_eq!(
        opcodes(func),
        vec![OP_CONST32, OP_MOVE32, OP_JUMP, OP_END]
    );
    let jump = instr_at(func, 2);
    let end = instr_at(func, 3);
    assert_eq!(jump.pos + jump.branch_offset() as usize, end.pos);

    let mv = instr_at(func, 1);
    assert_eq!(end.offset_table(), vec![mv.dst().unwrap()]);
    Ok(())
}

#[test]
fn eqz_fuses_into_an_inverted_conditional() -> Result<()> {
    let module = compile_wat(
        r#"(module
            (func (local i32 i32)
                i32.const 0
                i32.eqz
                (if (then nop))))"#,
    )?;
    let func = &module.functions[0];

    // The i32.eqz disappears; the `if` branches on the eqz's source
    // with the opposite sense.
    let ops = opcodes(func);
    assert!(!ops.contains(&OP_I32_EQZ));
    assert_eq!(ops, vec![OP_CONST32, OP_JUMP_IF_TRUE, OP_END]);

    let konst = instr_at(func, 0);
    let jump = instr_at(func, 1);
    assert_eq!(jump.src0(), konst.dst());
    let end = instr_at(func, 2);
    assert_eq!(jump.pos + jump.i32_at(4) as usize, end.pos);
    Ok(())
}

#[test]
fn try_catch_produces_one_catch_table_entry() -> Result<()> {
    // (module (tag) (func (try (do (throw 0)) (catch 0 nop))))
    // Assembled by hand; the text format for legacy exception handling
    // is not universally available.
    let bytes: Vec<u8> = vec![
        0x00, 0x61, 0x73, 0x6d, 0x01, 0x00, 0x00, 0x00, // magic + version
        0x01, 0x04, 0x01, 0x60, 0x00, 0x00, // type: [] -> []
        0x03, 0x02, 0x01, 0x00, // function section
        0x0d, 0x03, 0x01, 0x00, 0x00, // tag section: one tag, type 0
        0x0a, 0x0c, 0x01, 0x0a, 0x00, // code section, one body
        0x06, 0x40, // try (void)
        0x08, 0x00, // throw tag 0
        0x07, 0x00, // catch tag 0
        0x01, // nop
        0x0b, // end (try)
        0x0b, // end (function)
    ];
    let module = parse_module(&bytes)?;
    let func = &module.functions[0];

    assert_eq!(opcodes(func), vec![OP_THROW, OP_END]);
    assert_eq!(func.catch_table().len(), 1);
    let entry = &func.catch_table()[0];
    assert_eq!(entry.try_start, 0);
    assert_eq!(entry.try_end, 8);
    assert_eq!(entry.catch_start, 8);
    assert_eq!(entry.stack_size_to_be, 0);
    assert_eq!(entry.tag_index, Some(0));
    Ok(())
}

#[test]
fn four_disjoint_i32_locals_pack_into_one_slot() -> Result<()> {
    let module = compile_wat(
        r#"(module
            (func (param i32) (result i32) (local i32 i32 i32 i32)
                local.get 0
                local.set 1
                local.get 1
                local.set 2
                local.get 2
                local.set 3
                local.get 3
                local.set 4
                local.get 4))"#,
    )?;
    let func = &module.functions[0];

    let ops = opcodes(func);
    assert_eq!(
        ops,
        vec![OP_MOVE32, OP_MOVE32, OP_MOVE32, OP_MOVE32, OP_END]
    );
    // Every local collapses onto the same packed slot above the param.
    for i in 0..4 {
        assert_eq!(instr_at(func, i).dst(), Some(4));
    }
    assert_eq!(instr_at(func, 4).offset_table(), vec![4]);
    // One param slot + one shared local slot.
    assert_eq!(func.required_stack_size(), 8);
    Ok(())
}

#[test]
fn disjoint_f64_locals_share_one_aligned_slot() -> Result<()> {
    let module = compile_wat(
        r#"(module
            (func (param f64) (result f64) (local f64 f64)
                local.get 0
                local.set 1
                local.get 1
                local.set 2
                local.get 2))"#,
    )?;
    let func = &module.functions[0];

    assert_eq!(opcodes(func), vec![OP_MOVE64, OP_MOVE64, OP_END]);
    assert_eq!(instr_at(func, 0).dst(), Some(8));
    assert_eq!(instr_at(func, 1).dst(), Some(8));
    assert_eq!(instr_at(func, 2).offset_table(), vec![8]);
    assert_eq!(func.required_stack_size(), 16);
    Ok(())
}

#[test]
fn recompilation_is_deterministic() -> Result<()> {
    let wat = r#"(module
        (func (param i32 i32) (result i32) (local i32 f64)
            local.get 0
            local.set 2
            (f64.store (local.get 1) (f64.const 1.5))
            (i32.add (local.get 2) (i32.const 3)))
        (memory 1))"#;
    let bytes = wat::parse_str(wat)?;
    let first = parse_module(&bytes)?;
    let second = parse_module(&bytes)?;

    assert_eq!(first.functions.len(), second.functions.len());
    for (a, b) in first.functions.iter().zip(second.functions.iter()) {
        assert_eq!(a.bytecode(), b.bytecode());
        assert_eq!(a.required_stack_size(), b.required_stack_size());
        assert_eq!(a.catch_table(), b.catch_table());
    }
    Ok(())
}

#[test]
fn uniform_br_table_resolves_every_entry_to_one_target() -> Result<()> {
    let module = compile_wat(
        r#"(module
            (func (param i32)
                (block
                    (br_table 0 0 0 (local.get 0)))))"#,
    )?;
    let func = &module.functions[0];

    assert_eq!(opcodes(func), vec![OP_BR_TABLE, OP_END]);
    let table = instr_at(func, 0);
    let end = instr_at(func, 1);
    let (default, cases) = table.br_table_targets();
    let expected = (end.pos - table.pos) as i32;
    assert_eq!(default, expected);
    assert_eq!(cases, vec![expected, expected]);
    Ok(())
}

#[test]
fn local_read_without_dominating_write_gets_a_zero_prelude() -> Result<()> {
    let module = compile_wat(
        r#"(module
            (func (result i32) (local i32)
                (block
                    (br_if 0 (i32.const 1))
                    (local.set 0 (i32.const 7)))
                (local.get 0)))"#,
    )?;
    let func = &module.functions[0];

    // The branch makes the write conditional, so the local is
    // zero-materialized once at entry, before the constant prelude.
    let first = instr_at(func, 0);
    assert_eq!(first.opcode(), OP_CONST32);
    assert_eq!(first.u32_at(4), 0);
    let local_slot = first.dst().unwrap();

    let zero_inits = InstrReader::new(func.bytecode())
        .filter(|i| i.opcode() == OP_CONST32 && i.u32_at(4) == 0)
        .count();
    assert_eq!(zero_inits, 1);

    // The conditional write and the final read both use the same slot.
    let mv = InstrReader::new(func.bytecode())
        .find(|i| i.opcode() == OP_MOVE32)
        .unwrap();
    assert_eq!(mv.dst(), Some(local_slot));
    let end = InstrReader::new(func.bytecode())
        .find(|i| i.opcode() == OP_END)
        .unwrap();
    assert_eq!(end.offset_table(), vec![local_slot]);
    Ok(())
}

#[test]
fn call_carries_parameter_and_result_offsets() -> Result<()> {
    let module = compile_wat(
        r#"(module
            (func $f (param i32 i64) (result i64)
                local.get 1)
            (func (result i64)
                (call $f (i32.const 1) (i64.const 2))))"#,
    )?;
    let caller = &module.functions[1];

    assert_eq!(
        opcodes(caller),
        vec![OP_CONST32, OP_CONST64, OP_CALL, OP_END]
    );
    let call = instr_at(caller, 2);
    let i32_slot = instr_at(caller, 0).dst().unwrap();
    let i64_slot = instr_at(caller, 1).dst().unwrap();
    // Two parameter offsets in declaration order, then the result.
    assert_eq!(call.offset_table(), vec![i32_slot, i64_slot, 12]);
    assert_eq!(instr_at(caller, 3).offset_table(), vec![12]);
    assert_eq!(caller.required_stack_size(), 20);
    Ok(())
}

#[test]
fn expression_result_fuses_into_following_local_set() -> Result<()> {
    let module = compile_wat(
        r#"(module
            (func (param i32 i32) (result i32) (local i32)
                local.get 0
                local.get 1
                i32.add
                local.set 2
                local.get 2))"#,
    )?;
    let func = &module.functions[0];

    // The add writes the local's slot directly; no move is emitted.
    assert_eq!(opcodes(func), vec![OP_I32_ADD, OP_END]);
    let add = instr_at(func, 0);
    assert_eq!(add.src0(), Some(0));
    assert_eq!(add.src1(), Some(4));
    assert_eq!(add.dst(), Some(8));
    assert_eq!(instr_at(func, 1).offset_table(), vec![8]);
    Ok(())
}

#[test]
fn function_ending_in_unreachable_still_terminates() -> Result<()> {
    let module = compile_wat(r#"(module (func (result i32) unreachable))"#)?;
    let func = &module.functions[0];
    assert_eq!(opcodes(func), vec![OP_UNREACHABLE, OP_END]);
    Ok(())
}

#[test]
fn top_level_br_acts_as_return() -> Result<()> {
    let module = compile_wat(
        r#"(module
            (func (result i32)
                i32.const 3
                br 0))"#,
    )?;
    let func = &module.functions[0];

    assert_eq!(opcodes(func), vec![OP_CONST32, OP_END]);
    let konst = instr_at(func, 0);
    assert_eq!(konst.u32_at(4), 3);
    assert_eq!(
        instr_at(func, 1).offset_table(),
        vec![konst.dst().unwrap()]
    );
    Ok(())
}

#[test]
fn init_expressions_compile_to_miniature_functions() -> Result<()> {
    let module = compile_wat(
        r#"(module
            (global $g i32 (i32.const 5))
            (memory 1)
            (data (i32.const 16) "hi")
            (table 1 funcref)
            (elem (i32.const 0) func 0)
            (func))"#,
    )?;

    let global_init = module.globals[0].init.as_ref().unwrap();
    assert_eq!(opcodes(global_init), vec![OP_CONST32, OP_END]);
    let konst = instr_at(global_init, 0);
    assert_eq!(konst.u32_at(4), 5);
    assert_eq!(konst.dst(), Some(0));
    assert_eq!(instr_at(global_init, 1).offset_table(), vec![0]);

    let data_offset = module.datas[0].offset.as_ref().unwrap();
    assert_eq!(opcodes(data_offset), vec![OP_CONST32, OP_END]);
    assert_eq!(instr_at(data_offset, 0).u32_at(4), 16);

    assert_eq!(module.elements.len(), 1);
    assert!(matches!(
        module.elements[0].items[..],
        [limpet::ElemItem::Func(0)]
    ));
    Ok(())
}

#[test]
fn imported_functions_keep_index_spaces_aligned() -> Result<()> {
    let module = compile_wat(
        r#"(module
            (import "env" "host" (func $host (param i32)))
            (func (export "run")
                (call $host (i32.const 9))))"#,
    )?;

    assert_eq!(module.num_imported_functions, 1);
    assert_eq!(module.functions.len(), 2);
    assert!(module.functions[0].bytecode().is_empty());
    assert_eq!(module.export_func("run"), Some(1));

    let run = &module.functions[1];
    let call = InstrReader::new(run.bytecode())
        .find(|i| i.opcode() == OP_CALL)
        .unwrap();
    assert_eq!(call.u32_at(8), 0); // calls function index 0
    Ok(())
}

#[test]
fn loop_back_branch_targets_the_loop_start() -> Result<()> {
    let module = compile_wat(
        r#"(module
            (func (param i32) (local i32)
                (loop $l
                    local.get 0
                    local.set 1
                    (br_if $l (local.get 1)))))"#,
    )?;
    let func = &module.functions[0];

    let jump = InstrReader::new(func.bytecode())
        .find(|i| i.opcode() == OP_JUMP_IF_TRUE)
        .expect("conditional back branch");
    let offset = jump.i32_at(4);
    assert!(offset < 0, "loop branch must jump backwards, got {offset}");
    // The branch lands on the loop's first instruction.
    let target = (jump.pos as i64 + offset as i64) as usize;
    let first_in_loop = InstrReader::new(func.bytecode())
        .find(|i| i.opcode() == OP_MOVE32)
        .unwrap();
    assert_eq!(target, first_in_loop.pos);
    Ok(())
}

#[test]
fn operand_offsets_stay_within_the_reported_frame() -> Result<()> {
    let module = compile_wat(
        r#"(module
            (memory 1)
            (func (param i32 f64) (result f64) (local i32 f64)
                (local.set 2 (i32.add (local.get 0) (i32.const 4)))
                (local.set 3 (f64.add (local.get 1) (f64.const 2.0)))
                (f64.store (local.get 2) (local.get 3))
                (f64.load (local.get 2))))"#,
    )?;
    let func = &module.functions[0];
    let frame = func.required_stack_size();
    for instr in InstrReader::new(func.bytecode()) {
        for field in [instr.dst(), instr.src0(), instr.src1(), instr.extra()] {
            if let Some(off) = field {
                assert!(
                    (off as u32) < frame,
                    "operand {off} outside frame {frame} at {}",
                    instr.pos
                );
            }
        }
    }
    Ok(())
}
