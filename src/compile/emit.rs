use wasmparser::{BlockType, Operator};

use crate::bytecode::opcode::*;
use crate::bytecode::{
    pointer_aligned, BR_TABLE_DEFAULT_AT, BR_TABLE_ENTRIES_AT, CALL_INDIRECT_OFFSETS_AT,
    CALL_OFFSETS_AT, END_OFFSETS_AT, JUMP_OFFSET_AT, THROW_OFFSETS_AT,
};
use crate::compile::control::{BlockInfo, BlockKind, BlockSignature, CatchInfo, EndFixup};
use crate::compile::operand::StackEntry;
use crate::compile::{kind_of_valtype, FunctionCompiler};
use crate::error::CompileError;
use crate::value::{Value, ValueKind};

/// Record size of the unary shape; the peephole needs it to recognize
/// an `i32.eqz` as the most recent instruction.
const UNARY_SIZE: usize = 6;

impl FunctionCompiler<'_> {
    fn err(&self, message: impl Into<String>) -> CompileError {
        CompileError::parse(self.src_pos, message)
    }

    fn unsupported(&self, op: &Operator) -> CompileError {
        let debug = format!("{op:?}");
        let name = debug
            .split(|c: char| c == ' ' || c == '{')
            .next()
            .unwrap_or("?")
            .to_string();
        CompileError::Unsupported {
            position: self.src_pos,
            name,
        }
    }

    // ------------------------------------------------------------------
    // Operand-stack access with preprocess bookkeeping
    // ------------------------------------------------------------------

    pub(crate) fn push_fresh(&mut self, kind: ValueKind) -> Result<u32, CompileError> {
        self.stack
            .push_fresh(kind)
            .ok_or(CompileError::FrameTooLarge {
                position: self.src_pos,
            })
    }

    pub(crate) fn push_at(
        &mut self,
        kind: ValueKind,
        pos: u32,
        local: Option<u32>,
    ) -> Result<(), CompileError> {
        if let Some(l) = local {
            let push_count = self
                .stack
                .entries()
                .iter()
                .filter(|e| e.local == Some(l))
                .count();
            self.pre.add_usage(l, self.src_pos, push_count);
        }
        self.stack
            .push_at(kind, pos, local)
            .ok_or(CompileError::FrameTooLarge {
                position: self.src_pos,
            })
    }

    pub(crate) fn pop_entry(&mut self) -> Result<StackEntry, CompileError> {
        let entry = self
            .stack
            .pop()
            .ok_or_else(|| self.err("operand stack underflow"))?;
        if let Some(l) = entry.local {
            self.pre.close_usage(l, self.src_pos);
        }
        Ok(entry)
    }

    fn pop_kind(&mut self, kind: ValueKind) -> Result<StackEntry, CompileError> {
        let top = self.stack.peek().copied();
        match top {
            Some(e) if e.kind == kind => self.pop_entry(),
            Some(e) => Err(self.err(format!(
                "expected {:?} on the operand stack, found {:?}",
                kind, e.kind
            ))),
            None => Err(self.err("operand stack underflow")),
        }
    }

    fn peek_entry(&self) -> Result<&StackEntry, CompileError> {
        self.stack
            .peek()
            .ok_or_else(|| self.err("operand stack underflow"))
    }

    fn seen_branch(&mut self) {
        if self.pre.in_preprocess {
            if let Some(block) = self.blocks.last_mut() {
                block.seen_branch = true;
            }
            self.pre.clear_writes_since_branch();
        }
    }

    // ------------------------------------------------------------------
    // Emission primitives
    // ------------------------------------------------------------------

    fn emit_move(&mut self, src: u32, dst: u32, kind: ValueKind) {
        if src == dst {
            return;
        }
        let op = match kind {
            ValueKind::I32 | ValueKind::F32 => OP_MOVE32,
            ValueKind::V128 => OP_MOVE128,
            _ => OP_MOVE64,
        };
        self.func.code.push_u16(op);
        self.func.code.push_u16(src as u16);
        self.func.code.push_u16(dst as u16);
        self.stack.note_used(dst, kind);
    }

    pub(crate) fn emit_const(&mut self, dst: u32, value: Value) {
        match value {
            Value::I32(v) => {
                self.func.code.push_u16(OP_CONST32);
                self.func.code.push_u16(dst as u16);
                self.func.code.push_u32(v as u32);
            }
            Value::F32(bits) => {
                self.func.code.push_u16(OP_CONST32);
                self.func.code.push_u16(dst as u16);
                self.func.code.push_u32(bits);
            }
            Value::I64(v) => {
                self.func.code.push_u16(OP_CONST64);
                self.func.code.push_u16(dst as u16);
                self.func.code.push_u64(v as u64);
            }
            Value::F64(bits) => {
                self.func.code.push_u16(OP_CONST64);
                self.func.code.push_u16(dst as u16);
                self.func.code.push_u64(bits);
            }
            Value::V128(bytes) => {
                self.func.code.push_u16(OP_CONST128);
                self.func.code.push_u16(dst as u16);
                self.func.code.push_bytes(&bytes);
            }
        }
        self.stack.note_used(dst, value.kind());
    }

    fn emit_unary(&mut self, op: u16, src: u32, dst: u32) {
        if op == OP_I32_EQZ {
            self.last_eqz = Some(self.func.code.len());
        }
        self.func.code.push_u16(op);
        self.func.code.push_u16(src as u16);
        self.func.code.push_u16(dst as u16);
    }

    fn emit_binary(&mut self, op: u16, src0: u32, src1: u32, dst: u32) {
        self.func.code.push_u16(op);
        self.func.code.push_u16(src0 as u16);
        self.func.code.push_u16(src1 as u16);
        self.func.code.push_u16(dst as u16);
    }

    fn emit_jump_placeholder(&mut self) {
        self.func.code.push_u16(OP_JUMP);
        self.func.code.push_u16(0);
        self.func.code.push_i32(0);
    }

    fn emit_jump_to(&mut self, offset: i32) {
        self.func.code.push_u16(OP_JUMP);
        self.func.code.push_u16(0);
        self.func.code.push_i32(offset);
    }

    fn emit_jump_if(&mut self, op: u16, src: u32, offset: i32) {
        self.func.code.push_u16(op);
        self.func.code.push_u16(src as u16);
        self.func.code.push_i32(offset);
    }

    /// Materialize the pooled constants at the function entry.
    pub(crate) fn emit_constant_prelude(&mut self) {
        for i in 0..self.pre.constants.len() {
            let (value, off) = self.pre.constants[i];
            self.emit_const(off as u32, value);
        }
    }

    // ------------------------------------------------------------------
    // Result placement and the constant pool
    // ------------------------------------------------------------------

    /// Destination offset for an expression result. When the next
    /// source operator is a `local.set`, the local's slot is used
    /// directly and the `local.set` is consumed.
    fn compute_result_position(
        &mut self,
        kind: ValueKind,
        next: Option<&Operator>,
    ) -> Result<u32, CompileError> {
        if !self.pre.in_preprocess {
            if let Some(Operator::LocalSet { local_index }) = next {
                let pos = self.locals[*local_index as usize].pos;
                self.pending_fuse = true;
                self.stack.note_used(pos, kind);
                return Ok(pos);
            }
        }
        self.push_fresh(kind)
    }

    /// Offer a typed constant to the pool. Returns true when the value
    /// has a pooled slot, in which case no inline materialization is
    /// emitted and the slot is pushed instead.
    fn process_const(&mut self, value: Value) -> Result<bool, CompileError> {
        if self.in_init_expr {
            return Ok(false);
        }
        self.pre.add_constant(value);
        if !self.pre.in_preprocess {
            if let Some(off) = self.pre.pooled_offset(&value) {
                self.push_at(value.kind(), off, None)?;
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn const_op(&mut self, value: Value, next: Option<&Operator>) -> Result<(), CompileError> {
        if self.process_const(value)? {
            return Ok(());
        }
        let dst = self.compute_result_position(value.kind(), next)?;
        self.emit_const(dst, value);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Blocks and branches
    // ------------------------------------------------------------------

    fn block_signature(&self, blockty: &BlockType) -> Result<BlockSignature, CompileError> {
        match blockty {
            BlockType::Empty => Ok(BlockSignature::Void),
            BlockType::Type(ty) => kind_of_valtype(*ty)
                .map(BlockSignature::Single)
                .ok_or_else(|| self.err("unsupported block value type")),
            BlockType::FuncType(i) => Ok(BlockSignature::Type(*i)),
        }
    }

    /// Push a block record: canonicalize any block parameters so
    /// interior branches can target one layout, then snapshot the
    /// operand stack.
    fn begin_block(&mut self, kind: BlockKind, sig: BlockSignature) -> Result<(), CompileError> {
        let stack_size = self.stack.size_so_far;
        let should_restore = sig.has_results(&self.ctx.types);
        let param_count = sig.param_count(&self.ctx.types);
        if param_count > 0 {
            let len = self.stack.len();
            if len < param_count {
                return Err(self.err("operand stack underflow at block entry"));
            }
            for idx in len - param_count..len {
                let e = self.stack.entries()[idx];
                if e.pos != e.canonical {
                    self.emit_move(e.pos, e.canonical, e.kind);
                    if let Some(l) = e.local {
                        self.pre.close_usage(l, self.src_pos);
                    }
                    let entry = &mut self.stack.entries_mut()[idx];
                    entry.pos = entry.canonical;
                    entry.local = None;
                }
            }
        }
        let snapshot = self.stack.entries().to_vec();
        let position = self.func.code.len();
        self.blocks.push(BlockInfo {
            kind,
            signature: sig,
            stack_snapshot: snapshot,
            stack_size,
            position,
            should_restore_at_end: should_restore,
            generation_stopped: false,
            seen_branch: false,
            fixups: Vec::new(),
        });
        Ok(())
    }

    /// True when the most recently emitted instruction is an `i32.eqz`
    /// whose destination is `pos`; a following conditional branch may
    /// then drop it and branch on the opposite sense of its source.
    fn can_invert(&self, pos: u32) -> bool {
        match self.last_eqz {
            Some(p) => {
                p + UNARY_SIZE == self.func.code.len()
                    && self.func.code.read_u16_at(p + 4) as u32 == pos
            }
            None => false,
        }
    }

    /// Drop the fusable `i32.eqz` and return its source operand.
    fn take_inverted_source(&mut self) -> u32 {
        let p = self.last_eqz.take().expect("no i32.eqz to invert");
        let src = self.func.code.read_u16_at(p + 2) as u32;
        self.func.code.truncate(p);
        src
    }

    /// `(drop_bytes, parameter_bytes)` a branch to `depth` must shed
    /// and carry, per the target block's snapshot and signature.
    fn drop_sizes(&self, depth: u32) -> (u32, u32) {
        let mut drop = 0u32;
        let mut param = 0u32;
        let n = self.blocks.len();
        if (depth as usize) < n {
            let target = &self.blocks[n - 1 - depth as usize];
            if target.stack_snapshot.len() < self.stack.len() {
                for e in &self.stack.entries()[target.stack_snapshot.len()..] {
                    drop += e.kind.stack_allocated_size();
                }
                if target.kind == BlockKind::Loop {
                    if let BlockSignature::Type(i) = target.signature {
                        let ps = self.ctx.types[i as usize].param_stack_size();
                        drop += ps;
                        param += ps;
                    }
                } else {
                    param += target.signature.result_stack_size(&self.ctx.types);
                }
            }
        } else if n > 0 {
            let base = self.blocks[0].stack_snapshot.len().min(self.stack.len());
            for e in &self.stack.entries()[base..] {
                drop += e.kind.stack_allocated_size();
            }
        }
        (drop, param)
    }

    /// Move the top `param` bytes of the stack down to the canonical
    /// layout of the entries `drop` bytes below the top. A size
    /// mismatch means the branch is in unreachable, mistyped territory
    /// and no code is produced.
    fn move_values_for_drop(&mut self, drop: u32, param: u32) {
        let entries = self.stack.entries();
        let len = entries.len();

        let mut remain = param as i64;
        let mut s = len;
        while remain > 0 {
            if s == 0 {
                return;
            }
            s -= 1;
            remain -= entries[s].kind.stack_allocated_size() as i64;
        }
        if remain != 0 {
            return;
        }

        let mut remain = drop as i64;
        let mut d = len;
        while remain > 0 {
            if d == 0 {
                return;
            }
            d -= 1;
            remain -= entries[d].kind.stack_allocated_size() as i64;
        }
        if remain != 0 {
            return;
        }

        // Deepest first, so newer values are not clobbered.
        let moves: Vec<(u32, u32, ValueKind)> = (0..len - s)
            .filter_map(|j| {
                let src = entries.get(s + j)?;
                let dst = entries.get(d + j)?;
                Some((src.pos, dst.canonical, src.kind))
            })
            .collect();
        for (src, dst, kind) in moves {
            self.emit_move(src, dst, kind);
        }
    }

    /// Move a loop target's parameters from their effective offsets to
    /// the loop header's canonical layout.
    fn move_loop_params(&mut self, target_idx: usize) {
        let param_count = self.blocks[target_idx]
            .signature
            .param_count(&self.ctx.types);
        let len = self.stack.len();
        if len < param_count {
            return;
        }
        let moves: Vec<(usize, u32, u32, ValueKind)> = (len - param_count..len)
            .map(|idx| {
                let e = &self.stack.entries()[idx];
                (idx, e.pos, e.canonical, e.kind)
            })
            .collect();
        for (idx, pos, canonical, kind) in moves {
            self.emit_move(pos, canonical, kind);
            self.stack.entries_mut()[idx].pos = canonical;
        }
    }

    /// Emit the function's `end` record carrying the result offsets.
    fn generate_end_code(&mut self, clear_stack: bool) -> Result<(), CompileError> {
        let results: Vec<ValueKind> = self.func_type.results().to_vec();
        if results.len() > self.stack.len() {
            // Malformed init expression; nothing sensible to emit.
            return Ok(());
        }
        let pos = self.func.code.len();
        let count: u16 = results.iter().map(|k| k.copy_count()).sum();
        self.func.code.push_u16(OP_END);
        self.func.code.push_u16(count);
        self.func.code.push_zeroed(pointer_aligned(2 * count as usize));

        let base = self.stack.len() - results.len();
        let mut at = pos + END_OFFSETS_AT;
        for (ri, kind) in results.iter().enumerate() {
            let entry_pos = self.stack.entries()[base + ri].pos;
            let mut j = 0;
            while j < kind.slot_size() {
                self.func.code.write_u16_at(at, (entry_pos + j) as u16);
                at += 2;
                j += 8;
            }
        }

        if clear_stack {
            for _ in 0..results.len() {
                self.pop_entry()?;
            }
        }
        Ok(())
    }

    fn generate_function_return(&mut self, clear_stack: bool) -> Result<(), CompileError> {
        let results: Vec<ValueKind> = self.func_type.results().to_vec();
        for (i, kind) in results.iter().rev().enumerate() {
            let idx = self
                .stack
                .len()
                .checked_sub(1 + i)
                .ok_or_else(|| self.err("operand stack underflow at return"))?;
            let found = self.stack.entries()[idx].kind;
            if found != *kind {
                return Err(self.err(format!(
                    "function result expected {kind:?}, found {found:?}"
                )));
            }
        }
        self.generate_end_code(false)?;
        if clear_stack {
            let (mut drop, _) = self.drop_sizes(self.blocks.len() as u32);
            while drop > 0 {
                let size = self.pop_entry()?.kind.stack_allocated_size();
                drop = drop.saturating_sub(size);
            }
        } else {
            for _ in 0..results.len() {
                self.pop_entry()?;
            }
            self.stop_generation();
        }
        if self.blocks.is_empty() {
            self.generating = false;
            self.resume_depth = 0;
        }
        Ok(())
    }

    /// Move a block's results from their effective offsets to the
    /// canonical layout interior branches already targeted.
    fn keep_block_results(&mut self, block: &BlockInfo) -> Result<(), CompileError> {
        if !block.should_restore_at_end || block.generation_stopped {
            return Ok(());
        }
        match block.signature {
            BlockSignature::Void => {}
            BlockSignature::Single(kind) => self.keep_one_result(kind)?,
            BlockSignature::Type(i) => {
                let results: Vec<ValueKind> = self.ctx.types[i as usize].results().to_vec();
                for kind in results.iter().rev() {
                    self.keep_one_result(*kind)?;
                }
            }
        }
        Ok(())
    }

    fn keep_one_result(&mut self, kind: ValueKind) -> Result<(), CompileError> {
        let e = *self.peek_entry()?;
        if e.kind != kind {
            return Err(self.err(format!(
                "block result expected {:?}, found {:?}",
                kind, e.kind
            )));
        }
        self.emit_move(e.pos, e.canonical, e.kind);
        self.pop_entry()?;
        Ok(())
    }

    fn restore_stack(&mut self, block: &BlockInfo) -> Result<(), CompileError> {
        if block.stack_snapshot.len() <= self.stack.len() {
            let surplus = self.stack.len() - block.stack_snapshot.len();
            for _ in 0..surplus {
                self.pop_entry()?;
            }
        }
        self.stack
            .restore(block.stack_snapshot.clone(), block.stack_size);
        Ok(())
    }

    fn on_end(&mut self) -> Result<(), CompileError> {
        // A branch may land directly on the position after the eqz, so
        // the fusion cannot survive a block boundary.
        self.last_eqz = None;

        let Some(block) = self.blocks.pop() else {
            return self.generate_end_code(true);
        };

        if block.kind == BlockKind::TryCatch {
            let depth_after = self.blocks.len();
            let landing = self.initial_stack_size
                + block
                    .stack_snapshot
                    .iter()
                    .map(|e| e.kind.stack_allocated_size())
                    .sum::<u32>();
            let mut remaining = Vec::new();
            for info in self.catches.drain(..) {
                if info.block_depth - 1 == depth_after {
                    self.func.catch_table.push(crate::module::CatchEntry {
                        try_start: info.try_start,
                        try_end: info.try_end,
                        catch_start: info.catch_start,
                        stack_size_to_be: landing,
                        tag_index: info.tag_index,
                    });
                } else {
                    remaining.push(info);
                }
            }
            self.catches = remaining;
        }

        if block.generation_stopped && block.fixups.is_empty() {
            self.stop_generation();
            return Ok(());
        }

        self.keep_block_results(&block)?;

        if block.should_restore_at_end {
            self.restore_stack(&block)?;
            match block.signature {
                BlockSignature::Void => {}
                BlockSignature::Single(kind) => {
                    self.push_fresh(kind)?;
                }
                BlockSignature::Type(i) => {
                    let ft = self.ctx.types[i as usize].clone();
                    for kind in ft.params().iter().rev() {
                        self.pop_kind(*kind)?;
                    }
                    for kind in ft.results() {
                        self.push_fresh(*kind)?;
                    }
                }
            }
        }

        let end_pos = self.func.code.len();
        for fixup in &block.fixups {
            match *fixup {
                EndFixup::Jump { pos } | EndFixup::JumpIf { pos } => {
                    self.func
                        .code
                        .write_i32_at(pos + JUMP_OFFSET_AT, (end_pos - pos) as i32);
                }
                EndFixup::BrTableEntry { cell, instr } => {
                    self.func.code.write_i32_at(cell, (end_pos - instr) as i32);
                }
            }
        }
        Ok(())
    }

    fn on_else(&mut self) -> Result<(), CompileError> {
        self.seen_branch();
        let mut block = self
            .blocks
            .pop()
            .ok_or_else(|| self.err("else without enclosing if"))?;
        if block.kind != BlockKind::IfElse {
            return Err(self.err("else without enclosing if"));
        }
        self.keep_block_results(&block)?;

        if block.fixups.is_empty() {
            return Err(self.err("if block lost its conditional fixup"));
        }
        block.fixups.remove(0);

        if !block.generation_stopped {
            let pos = self.func.code.len();
            block.fixups.push(EndFixup::Jump { pos });
            self.emit_jump_placeholder();
        }
        block.generation_stopped = false;
        self.restore_stack(&block)?;

        // The if's conditional jump targets the else arm.
        let here = self.func.code.len();
        self.func
            .code
            .write_i32_at(block.position + JUMP_OFFSET_AT, (here - block.position) as i32);
        self.blocks.push(block);
        Ok(())
    }

    fn on_if(&mut self, blockty: &BlockType) -> Result<(), CompileError> {
        let cond = self.pop_kind(ValueKind::I32)?;
        let mut cond_pos = cond.pos;
        let inverted = self.can_invert(cond_pos);
        if inverted {
            cond_pos = self.take_inverted_source();
        }

        let sig = self.block_signature(blockty)?;
        self.begin_block(BlockKind::IfElse, sig)?;
        let position = self.blocks.last().map(|b| b.position).unwrap_or(0);
        if let Some(block) = self.blocks.last_mut() {
            block.fixups.push(EndFixup::JumpIf { pos: position });
        }
        let op = if inverted {
            OP_JUMP_IF_TRUE
        } else {
            OP_JUMP_IF_FALSE
        };
        self.emit_jump_if(op, cond_pos, 0);
        self.seen_branch();
        Ok(())
    }

    fn on_br(&mut self, depth: u32) -> Result<(), CompileError> {
        self.seen_branch();
        if self.blocks.len() == depth as usize {
            // Branching past every block is a function return.
            self.generate_function_return(true)?;
            self.stop_generation();
            return Ok(());
        }
        if depth as usize > self.blocks.len() {
            return Err(self.err("branch depth out of range"));
        }

        let target_idx = self.blocks.len() - 1 - depth as usize;
        let (drop, param) = self.drop_sizes(depth);
        let target_is_loop = self.blocks[target_idx].kind == BlockKind::Loop;
        let loop_params = target_is_loop
            && matches!(self.blocks[target_idx].signature, BlockSignature::Type(i)
                if !self.ctx.types[i as usize].params().is_empty());

        if param > 0 {
            self.move_values_for_drop(drop, param);
        } else if loop_params {
            self.move_loop_params(target_idx);
        }

        let jump_pos = self.func.code.len();
        if target_is_loop {
            let offset = self.blocks[target_idx].position as i64 - jump_pos as i64;
            self.emit_jump_to(offset as i32);
        } else {
            self.blocks[target_idx]
                .fixups
                .push(EndFixup::Jump { pos: jump_pos });
            self.emit_jump_placeholder();
        }
        self.stop_generation();
        Ok(())
    }

    fn on_br_if(&mut self, depth: u32) -> Result<(), CompileError> {
        self.seen_branch();
        let cond = self.pop_kind(ValueKind::I32)?;
        let mut cond_pos = cond.pos;
        let inverted = self.can_invert(cond_pos);
        if inverted {
            cond_pos = self.take_inverted_source();
        }

        if self.blocks.len() == depth as usize {
            // Conditional return: skip over an inline end record.
            let skip_pos = self.func.code.len();
            let op = if inverted {
                OP_JUMP_IF_TRUE
            } else {
                OP_JUMP_IF_FALSE
            };
            self.emit_jump_if(op, cond_pos, 0);
            self.generate_end_code(false)?;
            let here = self.func.code.len();
            self.func
                .code
                .write_i32_at(skip_pos + JUMP_OFFSET_AT, (here - skip_pos) as i32);
            return Ok(());
        }
        if depth as usize > self.blocks.len() {
            return Err(self.err("branch depth out of range"));
        }

        let target_idx = self.blocks.len() - 1 - depth as usize;
        let (drop, param) = self.drop_sizes(depth);
        let target_is_loop = self.blocks[target_idx].kind == BlockKind::Loop;
        let loop_params = target_is_loop
            && matches!(self.blocks[target_idx].signature, BlockSignature::Type(i)
                if !self.ctx.types[i as usize].params().is_empty());

        if param > 0 || loop_params {
            // The branch needs moves; guard them with the opposite
            // sense and jump over when not taken.
            let skip_pos = self.func.code.len();
            let skip_op = if inverted {
                OP_JUMP_IF_TRUE
            } else {
                OP_JUMP_IF_FALSE
            };
            self.emit_jump_if(skip_op, cond_pos, 0);

            if param > 0 {
                self.move_values_for_drop(drop, param);
            } else {
                self.move_loop_params(target_idx);
            }

            let jump_pos = self.func.code.len();
            if target_is_loop {
                let offset = self.blocks[target_idx].position as i64 - jump_pos as i64;
                self.emit_jump_to(offset as i32);
            } else {
                self.blocks[target_idx]
                    .fixups
                    .push(EndFixup::Jump { pos: jump_pos });
                self.emit_jump_placeholder();
            }
            let here = self.func.code.len();
            self.func
                .code
                .write_i32_at(skip_pos + JUMP_OFFSET_AT, (here - skip_pos) as i32);
        } else {
            let jump_pos = self.func.code.len();
            let op = if inverted {
                OP_JUMP_IF_FALSE
            } else {
                OP_JUMP_IF_TRUE
            };
            if target_is_loop {
                let offset = self.blocks[target_idx].position as i64 - jump_pos as i64;
                self.emit_jump_if(op, cond_pos, offset as i32);
            } else {
                self.blocks[target_idx]
                    .fixups
                    .push(EndFixup::JumpIf { pos: jump_pos });
                self.emit_jump_if(op, cond_pos, 0);
            }
        }
        Ok(())
    }

    fn on_br_table(&mut self, targets: &wasmparser::BrTable<'_>) -> Result<(), CompileError> {
        self.seen_branch();
        let cond = self.pop_kind(ValueKind::I32)?;
        let depths: Vec<u32> = targets.targets().collect::<Result<_, _>>()?;

        let table_pos = self.func.code.len();
        self.func.code.push_u16(OP_BR_TABLE);
        self.func.code.push_u16(cond.pos as u16);
        self.func.code.push_u32(depths.len() as u32);
        self.func.code.push_i32(0); // default, patched below
        self.func
            .code
            .push_zeroed(pointer_aligned(4 * depths.len()));

        for (j, depth) in depths.iter().enumerate() {
            self.emit_br_table_case(table_pos, *depth, BR_TABLE_ENTRIES_AT + 4 * j)?;
        }
        self.emit_br_table_case(table_pos, targets.default(), BR_TABLE_DEFAULT_AT)?;
        self.stop_generation();
        Ok(())
    }

    fn emit_br_table_case(
        &mut self,
        table_pos: usize,
        depth: u32,
        cell_rel: usize,
    ) -> Result<(), CompileError> {
        let cell = table_pos + cell_rel;
        if self.blocks.len() == depth as usize {
            let offset = (self.func.code.len() - table_pos) as i32;
            self.func.code.write_i32_at(cell, offset);
            self.generate_end_code(false)?;
            return Ok(());
        }
        if depth as usize > self.blocks.len() {
            return Err(self.err("branch depth out of range"));
        }

        let (_, param) = self.drop_sizes(depth);
        if param > 0 {
            // Fan out to a per-case move sequence emitted right here.
            let offset = (self.func.code.len() - table_pos) as i32;
            self.func.code.write_i32_at(cell, offset);
            self.on_br(depth)?;
            return Ok(());
        }

        let target_idx = self.blocks.len() - 1 - depth as usize;
        if self.blocks[target_idx].kind == BlockKind::Loop {
            let offset = (self.blocks[target_idx].position as i64 - table_pos as i64) as i32;
            self.func.code.write_i32_at(cell, offset);
        } else {
            self.blocks[target_idx].fixups.push(EndFixup::BrTableEntry {
                cell,
                instr: table_pos,
            });
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Calls, throw, try/catch
    // ------------------------------------------------------------------

    fn fill_call_offsets(
        &mut self,
        instr_pos: usize,
        offsets_at: usize,
        params: &[ValueKind],
        results: &[ValueKind],
        param_chunks: u16,
    ) -> Result<(), CompileError> {
        // Parameters pop in reverse; their chunks fill right to left so
        // the finished table lists parameters in declaration order.
        let mut chunk = param_chunks as usize;
        for kind in params.iter().rev() {
            let e = self.pop_kind(*kind)?;
            chunk -= kind.copy_count() as usize;
            let mut at = instr_pos + offsets_at + 2 * chunk;
            let mut j = 0;
            while j < kind.slot_size() {
                self.func.code.write_u16_at(at, (e.pos + j) as u16);
                at += 2;
                j += 8;
            }
        }
        let mut chunk = param_chunks as usize;
        for kind in results {
            let dst = self.push_fresh(*kind)?;
            let mut at = instr_pos + offsets_at + 2 * chunk;
            let mut j = 0;
            while j < kind.slot_size() {
                self.func.code.write_u16_at(at, (dst + j) as u16);
                at += 2;
                j += 8;
            }
            chunk += kind.copy_count() as usize;
        }
        Ok(())
    }

    fn on_call(&mut self, func_index: u32) -> Result<(), CompileError> {
        if func_index as usize >= self.ctx.func_type_indices.len() {
            return Err(self.err("call to unknown function"));
        }
        let ft = self.ctx.function_type(func_index).clone();
        let param_chunks: u16 = ft.params().iter().map(|k| k.copy_count()).sum();
        let result_chunks: u16 = ft.results().iter().map(|k| k.copy_count()).sum();

        let pos = self.func.code.len();
        self.func.code.push_u16(OP_CALL);
        self.func.code.push_u16(param_chunks);
        self.func.code.push_u16(result_chunks);
        self.func.code.push_u16(0);
        self.func.code.push_u32(func_index);
        self.func
            .code
            .push_zeroed(pointer_aligned(2 * (param_chunks + result_chunks) as usize));

        self.fill_call_offsets(pos, CALL_OFFSETS_AT, ft.params(), ft.results(), param_chunks)
    }

    fn on_call_indirect(&mut self, type_index: u32, table_index: u32) -> Result<(), CompileError> {
        let callee = self.pop_kind(ValueKind::I32)?;
        let ft = self
            .ctx
            .types
            .get(type_index as usize)
            .ok_or_else(|| self.err("call_indirect with unknown type"))?
            .clone();
        let param_chunks: u16 = ft.params().iter().map(|k| k.copy_count()).sum();
        let result_chunks: u16 = ft.results().iter().map(|k| k.copy_count()).sum();

        let pos = self.func.code.len();
        self.func.code.push_u16(OP_CALL_INDIRECT);
        self.func.code.push_u16(param_chunks);
        self.func.code.push_u16(result_chunks);
        self.func.code.push_u16(callee.pos as u16);
        self.func.code.push_u32(table_index);
        self.func.code.push_u32(type_index);
        self.func
            .code
            .push_zeroed(pointer_aligned(2 * (param_chunks + result_chunks) as usize));

        self.fill_call_offsets(
            pos,
            CALL_INDIRECT_OFFSETS_AT,
            ft.params(),
            ft.results(),
            param_chunks,
        )
    }

    fn on_throw(&mut self, tag_index: u32) -> Result<(), CompileError> {
        self.seen_branch();
        if tag_index as usize >= self.ctx.tags.len() {
            return Err(self.err("throw with unknown tag"));
        }
        let params: Vec<ValueKind> = self.ctx.tag_type(tag_index).params().to_vec();

        let pos = self.func.code.len();
        self.func.code.push_u16(OP_THROW);
        self.func.code.push_u16(params.len() as u16);
        self.func.code.push_u32(tag_index);
        self.func.code.push_zeroed(pointer_aligned(2 * params.len()));

        // One offset per tag parameter, in declaration order; values
        // are still on the stack while the table is written.
        for i in 0..params.len() {
            let e = self.stack.entries()[self.stack.len() - 1 - i];
            let at = pos + THROW_OFFSETS_AT + 2 * (params.len() - 1 - i);
            self.func.code.write_u16_at(at, e.pos as u16);
        }
        for kind in params.iter().rev() {
            self.pop_kind(*kind)?;
        }
        self.stop_generation();
        Ok(())
    }

    fn process_catch(&mut self, tag_index: Option<u32>) -> Result<(), CompileError> {
        match self.blocks.last() {
            Some(b) if b.kind == BlockKind::TryCatch => {}
            _ => return Err(self.err("catch outside try")),
        }
        self.seen_branch();
        let Some(mut block) = self.blocks.pop() else {
            return Err(self.err("catch outside try"));
        };
        self.keep_block_results(&block)?;
        self.restore_stack(&block)?;

        let mut try_end = self.func.code.len();
        if let Some(last) = self.catches.last() {
            // Later catches of the same try share the first one's range.
            if last.block_depth == self.blocks.len() + 1 {
                try_end = last.try_end;
            }
        }

        if !block.generation_stopped {
            let pos = self.func.code.len();
            block.fixups.push(EndFixup::Jump { pos });
            self.emit_jump_placeholder();
        }
        block.generation_stopped = false;

        let catch_start = self.func.code.len();
        self.catches.push(CatchInfo {
            block_depth: self.blocks.len() + 1,
            try_start: block.position,
            try_end,
            catch_start,
            tag_index,
        });

        if let Some(tag) = tag_index {
            if tag as usize >= self.ctx.tags.len() {
                return Err(self.err("catch with unknown tag"));
            }
            let params: Vec<ValueKind> = self.ctx.tag_type(tag).params().to_vec();
            for kind in params {
                self.push_fresh(kind)?;
            }
        }
        self.blocks.push(block);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Locals and globals
    // ------------------------------------------------------------------

    fn on_local_get(&mut self, local_index: u32) -> Result<(), CompileError> {
        let info = *self
            .locals
            .get(local_index as usize)
            .ok_or_else(|| self.err("local index out of range"))?;

        let direct = !self.pre.interval_write_covers(local_index, self.src_pos);
        if direct {
            self.push_at(info.kind, info.pos, Some(local_index))
        } else {
            let pos = self.stack.size_so_far;
            self.push_at(info.kind, pos, Some(local_index))?;
            self.emit_move(info.pos, pos, info.kind);
            Ok(())
        }
    }

    fn on_local_set(&mut self, local_index: u32) -> Result<(), CompileError> {
        let info = *self
            .locals
            .get(local_index as usize)
            .ok_or_else(|| self.err("local index out of range"))?;
        let src = self.pop_kind(info.kind)?;
        self.emit_move(src.pos, info.pos, src.kind);
        let definite = !self.blocks.iter().any(|b| b.seen_branch);
        self.pre.add_write(local_index, self.src_pos, definite);
        Ok(())
    }

    fn on_local_tee(&mut self, local_index: u32) -> Result<(), CompileError> {
        let info = *self
            .locals
            .get(local_index as usize)
            .ok_or_else(|| self.err("local index out of range"))?;
        let top = *self.peek_entry()?;
        if top.kind != info.kind {
            return Err(self.err(format!(
                "local.tee expected {:?}, found {:?}",
                info.kind, top.kind
            )));
        }
        self.emit_move(top.pos, info.pos, info.kind);
        let definite = !self.blocks.iter().any(|b| b.seen_branch);
        self.pre.add_write(local_index, self.src_pos, definite);
        Ok(())
    }

    fn on_global_get(
        &mut self,
        global_index: u32,
        next: Option<&Operator>,
    ) -> Result<(), CompileError> {
        let (kind, _) = *self
            .ctx
            .globals
            .get(global_index as usize)
            .ok_or_else(|| self.err("global index out of range"))?;
        let dst = self.compute_result_position(kind, next)?;
        let op = match kind.slot_size() {
            4 => OP_GLOBAL_GET32,
            8 => OP_GLOBAL_GET64,
            _ => OP_GLOBAL_GET128,
        };
        self.func.code.push_u16(op);
        self.func.code.push_u16(dst as u16);
        self.func.code.push_u32(global_index);
        Ok(())
    }

    fn on_global_set(&mut self, global_index: u32) -> Result<(), CompileError> {
        let (kind, _) = *self
            .ctx
            .globals
            .get(global_index as usize)
            .ok_or_else(|| self.err("global index out of range"))?;
        let src = *self.peek_entry()?;
        if src.kind != kind {
            return Err(self.err(format!(
                "global.set expected {:?}, found {:?}",
                kind, src.kind
            )));
        }
        let op = match kind.slot_size() {
            4 => OP_GLOBAL_SET32,
            8 => OP_GLOBAL_SET64,
            _ => OP_GLOBAL_SET128,
        };
        self.func.code.push_u16(op);
        self.func.code.push_u16(src.pos as u16);
        self.func.code.push_u32(global_index);
        self.pop_entry()?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Memory and tables
    // ------------------------------------------------------------------

    fn memarg_offset(&self, memarg: &wasmparser::MemArg) -> Result<u32, CompileError> {
        u32::try_from(memarg.offset).map_err(|_| self.err("memory offset out of range"))
    }

    fn on_load(
        &mut self,
        op: u16,
        result: ValueKind,
        memarg: &wasmparser::MemArg,
        next: Option<&Operator>,
    ) -> Result<(), CompileError> {
        let offset = self.memarg_offset(memarg)?;
        let src = self.pop_kind(ValueKind::I32)?;
        let dst = self.compute_result_position(result, next)?;
        if offset == 0 && (op == OP_I32_LOAD || op == OP_F32_LOAD) {
            self.emit_unary(OP_LOAD32, src.pos, dst);
        } else if offset == 0 && (op == OP_I64_LOAD || op == OP_F64_LOAD) {
            self.emit_unary(OP_LOAD64, src.pos, dst);
        } else {
            self.func.code.push_u16(op);
            self.func.code.push_u16(src.pos as u16);
            self.func.code.push_u16(dst as u16);
            self.func.code.push_u16(0);
            self.func.code.push_u32(offset);
        }
        Ok(())
    }

    fn on_store(
        &mut self,
        op: u16,
        value: ValueKind,
        memarg: &wasmparser::MemArg,
    ) -> Result<(), CompileError> {
        let offset = self.memarg_offset(memarg)?;
        let src1 = self.pop_kind(value)?;
        let src0 = self.pop_kind(ValueKind::I32)?;
        if offset == 0 && (op == OP_I32_STORE || op == OP_F32_STORE) {
            self.func.code.push_u16(OP_STORE32);
            self.func.code.push_u16(src0.pos as u16);
            self.func.code.push_u16(src1.pos as u16);
        } else if offset == 0 && (op == OP_I64_STORE || op == OP_F64_STORE) {
            self.func.code.push_u16(OP_STORE64);
            self.func.code.push_u16(src0.pos as u16);
            self.func.code.push_u16(src1.pos as u16);
        } else {
            self.func.code.push_u16(op);
            self.func.code.push_u16(src0.pos as u16);
            self.func.code.push_u16(src1.pos as u16);
            self.func.code.push_u16(0);
            self.func.code.push_u32(offset);
        }
        Ok(())
    }

    fn table_kind(&self, table: u32) -> Result<ValueKind, CompileError> {
        self.ctx
            .tables
            .get(table as usize)
            .copied()
            .ok_or_else(|| self.err("table index out of range"))
    }

    fn pop_three_i32(&mut self) -> Result<(u32, u32, u32), CompileError> {
        let src2 = self.pop_kind(ValueKind::I32)?;
        let src1 = self.pop_kind(ValueKind::I32)?;
        let src0 = self.pop_kind(ValueKind::I32)?;
        Ok((src0.pos, src1.pos, src2.pos))
    }

    // ------------------------------------------------------------------
    // The operator dispatch
    // ------------------------------------------------------------------

    pub(crate) fn process_operator(
        &mut self,
        op: &Operator<'_>,
        next: Option<&Operator<'_>>,
    ) -> Result<(), CompileError> {
        match op {
            Operator::Nop => {}
            Operator::Unreachable => {
                self.seen_branch();
                self.func.code.push_u16(OP_UNREACHABLE);
                self.stop_generation();
            }
            Operator::Return => {
                self.seen_branch();
                self.generate_function_return(false)?;
            }

            Operator::Block { blockty } => {
                let sig = self.block_signature(blockty)?;
                self.begin_block(BlockKind::Block, sig)?;
            }
            Operator::Loop { blockty } => {
                let sig = self.block_signature(blockty)?;
                self.begin_block(BlockKind::Loop, sig)?;
            }
            Operator::If { blockty } => self.on_if(blockty)?,
            Operator::Else => self.on_else()?,
            Operator::End => self.on_end()?,
            Operator::Br { relative_depth } => self.on_br(*relative_depth)?,
            Operator::BrIf { relative_depth } => self.on_br_if(*relative_depth)?,
            Operator::BrTable { targets } => self.on_br_table(targets)?,

            Operator::Call { function_index } => self.on_call(*function_index)?,
            Operator::CallIndirect {
                type_index,
                table_index,
            } => self.on_call_indirect(*type_index, *table_index)?,

            Operator::Try { blockty } => {
                let sig = self.block_signature(blockty)?;
                self.begin_block(BlockKind::TryCatch, sig)?;
            }
            Operator::Catch { tag_index } => self.process_catch(Some(*tag_index))?,
            Operator::CatchAll => self.process_catch(None)?,
            Operator::Throw { tag_index } => self.on_throw(*tag_index)?,

            Operator::Drop => {
                self.pop_entry()?;
            }
            Operator::Select | Operator::TypedSelect { .. } => {
                let cond = self.pop_kind(ValueKind::I32)?;
                let src1 = self.pop_entry()?;
                let src0 = self.pop_entry()?;
                if src0.kind != src1.kind {
                    return Err(self.err(format!(
                        "select arms disagree: {:?} vs {:?}",
                        src0.kind, src1.kind
                    )));
                }
                let kind = src1.kind;
                let dst = self.compute_result_position(kind, next)?;
                let is_float = matches!(kind, ValueKind::F32 | ValueKind::F64);
                self.func.code.push_u16(OP_SELECT);
                self.func.code.push_u16(cond.pos as u16);
                self.func.code.push_u16(src0.pos as u16);
                self.func.code.push_u16(src1.pos as u16);
                self.func.code.push_u16(dst as u16);
                self.func.code.push_u8(kind.slot_size() as u8);
                self.func.code.push_u8(is_float as u8);
            }

            Operator::LocalGet { local_index } => self.on_local_get(*local_index)?,
            Operator::LocalSet { local_index } => self.on_local_set(*local_index)?,
            Operator::LocalTee { local_index } => self.on_local_tee(*local_index)?,
            Operator::GlobalGet { global_index } => self.on_global_get(*global_index, next)?,
            Operator::GlobalSet { global_index } => self.on_global_set(*global_index)?,

            Operator::I32Const { value } => self.const_op(Value::I32(*value), next)?,
            Operator::I64Const { value } => self.const_op(Value::I64(*value), next)?,
            Operator::F32Const { value } => self.const_op(Value::F32(value.bits()), next)?,
            Operator::F64Const { value } => self.const_op(Value::F64(value.bits()), next)?,
            Operator::V128Const { value } => {
                self.const_op(Value::V128((value.i128() as u128).to_le_bytes()), next)?
            }

            Operator::RefNull { hty } => {
                let kind = match hty {
                    wasmparser::HeapType::Abstract {
                        ty: wasmparser::AbstractHeapType::Func,
                        ..
                    } => ValueKind::FuncRef,
                    wasmparser::HeapType::Abstract {
                        ty: wasmparser::AbstractHeapType::Extern,
                        ..
                    } => ValueKind::ExternRef,
                    _ => return Err(self.unsupported(op)),
                };
                let dst = self.compute_result_position(kind, next)?;
                self.emit_const(dst, Value::I64(0));
            }
            Operator::RefIsNull => {
                let src = self.pop_entry()?;
                if !src.kind.is_reference() {
                    return Err(self.err(format!(
                        "ref.is_null expects a reference, found {:?}",
                        src.kind
                    )));
                }
                let dst = self.compute_result_position(ValueKind::I32, next)?;
                self.emit_unary(OP_I64_EQZ, src.pos, dst);
            }
            Operator::RefFunc { function_index } => {
                let dst = self.compute_result_position(ValueKind::FuncRef, next)?;
                self.func.code.push_u16(OP_REF_FUNC);
                self.func.code.push_u16(dst as u16);
                self.func.code.push_u32(*function_index);
            }

            Operator::MemorySize { .. } => {
                let dst = self.compute_result_position(ValueKind::I32, next)?;
                self.func.code.push_u16(OP_MEMORY_SIZE);
                self.func.code.push_u16(dst as u16);
            }
            Operator::MemoryGrow { .. } => {
                let src = self.pop_kind(ValueKind::I32)?;
                let dst = self.compute_result_position(ValueKind::I32, next)?;
                self.func.code.push_u16(OP_MEMORY_GROW);
                self.func.code.push_u16(src.pos as u16);
                self.func.code.push_u16(dst as u16);
            }
            Operator::MemoryInit { data_index, .. } => {
                let (s0, s1, s2) = self.pop_three_i32()?;
                self.func.code.push_u16(OP_MEMORY_INIT);
                self.func.code.push_u16(s0 as u16);
                self.func.code.push_u16(s1 as u16);
                self.func.code.push_u16(s2 as u16);
                self.func.code.push_u32(*data_index);
            }
            Operator::MemoryCopy { .. } => {
                let (s0, s1, s2) = self.pop_three_i32()?;
                self.func.code.push_u16(OP_MEMORY_COPY);
                self.func.code.push_u16(s0 as u16);
                self.func.code.push_u16(s1 as u16);
                self.func.code.push_u16(s2 as u16);
            }
            Operator::MemoryFill { .. } => {
                let (s0, s1, s2) = self.pop_three_i32()?;
                self.func.code.push_u16(OP_MEMORY_FILL);
                self.func.code.push_u16(s0 as u16);
                self.func.code.push_u16(s1 as u16);
                self.func.code.push_u16(s2 as u16);
            }
            Operator::DataDrop { data_index } => {
                self.func.code.push_u16(OP_DATA_DROP);
                self.func.code.push_u16(0);
                self.func.code.push_u32(*data_index);
            }

            Operator::TableGet { table } => {
                let kind = self.table_kind(*table)?;
                let src = self.pop_kind(ValueKind::I32)?;
                let dst = self.compute_result_position(kind, next)?;
                self.func.code.push_u16(OP_TABLE_GET);
                self.func.code.push_u16(src.pos as u16);
                self.func.code.push_u16(dst as u16);
                self.func.code.push_u32(*table);
            }
            Operator::TableSet { table } => {
                let kind = self.table_kind(*table)?;
                let src1 = self.pop_kind(kind)?;
                let src0 = self.pop_kind(ValueKind::I32)?;
                self.func.code.push_u16(OP_TABLE_SET);
                self.func.code.push_u16(src0.pos as u16);
                self.func.code.push_u16(src1.pos as u16);
                self.func.code.push_u32(*table);
            }
            Operator::TableGrow { table } => {
                let kind = self.table_kind(*table)?;
                let src1 = self.pop_kind(ValueKind::I32)?;
                let src0 = self.pop_kind(kind)?;
                let dst = self.compute_result_position(ValueKind::I32, next)?;
                self.func.code.push_u16(OP_TABLE_GROW);
                self.func.code.push_u16(src0.pos as u16);
                self.func.code.push_u16(src1.pos as u16);
                self.func.code.push_u16(dst as u16);
                self.func.code.push_u32(*table);
            }
            Operator::TableSize { table } => {
                let dst = self.compute_result_position(ValueKind::I32, next)?;
                self.func.code.push_u16(OP_TABLE_SIZE);
                self.func.code.push_u16(dst as u16);
                self.func.code.push_u32(*table);
            }
            Operator::TableCopy {
                dst_table,
                src_table,
            } => {
                let (s0, s1, s2) = self.pop_three_i32()?;
                self.func.code.push_u16(OP_TABLE_COPY);
                self.func.code.push_u16(s0 as u16);
                self.func.code.push_u16(s1 as u16);
                self.func.code.push_u16(s2 as u16);
                self.func.code.push_u32(*dst_table);
                self.func.code.push_u32(*src_table);
            }
            Operator::TableFill { table } => {
                let kind = self.table_kind(*table)?;
                let src2 = self.pop_kind(ValueKind::I32)?;
                let src1 = self.pop_kind(kind)?;
                let src0 = self.pop_kind(ValueKind::I32)?;
                self.func.code.push_u16(OP_TABLE_FILL);
                self.func.code.push_u16(src0.pos as u16);
                self.func.code.push_u16(src1.pos as u16);
                self.func.code.push_u16(src2.pos as u16);
                self.func.code.push_u32(*table);
            }
            Operator::TableInit { elem_index, table } => {
                let (s0, s1, s2) = self.pop_three_i32()?;
                self.func.code.push_u16(OP_TABLE_INIT);
                self.func.code.push_u16(s0 as u16);
                self.func.code.push_u16(s1 as u16);
                self.func.code.push_u16(s2 as u16);
                self.func.code.push_u32(*table);
                self.func.code.push_u32(*elem_index);
            }
            Operator::ElemDrop { elem_index } => {
                self.func.code.push_u16(OP_ELEM_DROP);
                self.func.code.push_u16(0);
                self.func.code.push_u32(*elem_index);
            }

            _ => {
                if let Some((opcode, param, result)) = binary_info(op) {
                    let src1 = self.pop_kind(param)?;
                    let src0 = self.pop_kind(param)?;
                    let dst = self.compute_result_position(result, next)?;
                    self.emit_binary(opcode, src0.pos, src1.pos, dst);
                } else if let Some((opcode, src_kind, dst_kind)) = unary_info(op) {
                    let src = self.pop_kind(src_kind)?;
                    let dst = self.compute_result_position(dst_kind, next)?;
                    self.emit_unary(opcode, src.pos, dst);
                } else if let Some((opcode, result, memarg)) = load_info(op) {
                    self.on_load(opcode, result, memarg, next)?;
                } else if let Some((opcode, value, memarg)) = store_info(op) {
                    self.on_store(opcode, value, memarg)?;
                } else {
                    return Err(self.unsupported(op));
                }
            }
        }
        Ok(())
    }
}

/// Internal opcode, operand kind and result kind of a two-operand
/// source opcode. The first of the two tables the emitter runs on.
fn binary_info(op: &Operator) -> Option<(u16, ValueKind, ValueKind)> {
    use ValueKind::*;
    Some(match op {
        Operator::I32Eq => (OP_I32_EQ, I32, I32),
        Operator::I32Ne => (OP_I32_NE, I32, I32),
        Operator::I32LtS => (OP_I32_LT_S, I32, I32),
        Operator::I32LtU => (OP_I32_LT_U, I32, I32),
        Operator::I32GtS => (OP_I32_GT_S, I32, I32),
        Operator::I32GtU => (OP_I32_GT_U, I32, I32),
        Operator::I32LeS => (OP_I32_LE_S, I32, I32),
        Operator::I32LeU => (OP_I32_LE_U, I32, I32),
        Operator::I32GeS => (OP_I32_GE_S, I32, I32),
        Operator::I32GeU => (OP_I32_GE_U, I32, I32),
        Operator::I32Add => (OP_I32_ADD, I32, I32),
        Operator::I32Sub => (OP_I32_SUB, I32, I32),
        Operator::I32Mul => (OP_I32_MUL, I32, I32),
        Operator::I32DivS => (OP_I32_DIV_S, I32, I32),
        Operator::I32DivU => (OP_I32_DIV_U, I32, I32),
        Operator::I32RemS => (OP_I32_REM_S, I32, I32),
        Operator::I32RemU => (OP_I32_REM_U, I32, I32),
        Operator::I32And => (OP_I32_AND, I32, I32),
        Operator::I32Or => (OP_I32_OR, I32, I32),
        Operator::I32Xor => (OP_I32_XOR, I32, I32),
        Operator::I32Shl => (OP_I32_SHL, I32, I32),
        Operator::I32ShrS => (OP_I32_SHR_S, I32, I32),
        Operator::I32ShrU => (OP_I32_SHR_U, I32, I32),
        Operator::I32Rotl => (OP_I32_ROTL, I32, I32),
        Operator::I32Rotr => (OP_I32_ROTR, I32, I32),
        Operator::I64Eq => (OP_I64_EQ, I64, I32),
        Operator::I64Ne => (OP_I64_NE, I64, I32),
        Operator::I64LtS => (OP_I64_LT_S, I64, I32),
        Operator::I64LtU => (OP_I64_LT_U, I64, I32),
        Operator::I64GtS => (OP_I64_GT_S, I64, I32),
        Operator::I64GtU => (OP_I64_GT_U, I64, I32),
        Operator::I64LeS => (OP_I64_LE_S, I64, I32),
        Operator::I64LeU => (OP_I64_LE_U, I64, I32),
        Operator::I64GeS => (OP_I64_GE_S, I64, I32),
        Operator::I64GeU => (OP_I64_GE_U, I64, I32),
        Operator::I64Add => (OP_I64_ADD, I64, I64),
        Operator::I64Sub => (OP_I64_SUB, I64, I64),
        Operator::I64Mul => (OP_I64_MUL, I64, I64),
        Operator::I64DivS => (OP_I64_DIV_S, I64, I64),
        Operator::I64DivU => (OP_I64_DIV_U, I64, I64),
        Operator::I64RemS => (OP_I64_REM_S, I64, I64),
        Operator::I64RemU => (OP_I64_REM_U, I64, I64),
        Operator::I64And => (OP_I64_AND, I64, I64),
        Operator::I64Or => (OP_I64_OR, I64, I64),
        Operator::I64Xor => (OP_I64_XOR, I64, I64),
        Operator::I64Shl => (OP_I64_SHL, I64, I64),
        Operator::I64ShrS => (OP_I64_SHR_S, I64, I64),
        Operator::I64ShrU => (OP_I64_SHR_U, I64, I64),
        Operator::I64Rotl => (OP_I64_ROTL, I64, I64),
        Operator::I64Rotr => (OP_I64_ROTR, I64, I64),
        Operator::F32Eq => (OP_F32_EQ, F32, I32),
        Operator::F32Ne => (OP_F32_NE, F32, I32),
        Operator::F32Lt => (OP_F32_LT, F32, I32),
        Operator::F32Gt => (OP_F32_GT, F32, I32),
        Operator::F32Le => (OP_F32_LE, F32, I32),
        Operator::F32Ge => (OP_F32_GE, F32, I32),
        Operator::F32Add => (OP_F32_ADD, F32, F32),
        Operator::F32Sub => (OP_F32_SUB, F32, F32),
        Operator::F32Mul => (OP_F32_MUL, F32, F32),
        Operator::F32Div => (OP_F32_DIV, F32, F32),
        Operator::F32Min => (OP_F32_MIN, F32, F32),
        Operator::F32Max => (OP_F32_MAX, F32, F32),
        Operator::F32Copysign => (OP_F32_COPYSIGN, F32, F32),
        Operator::F64Eq => (OP_F64_EQ, F64, I32),
        Operator::F64Ne => (OP_F64_NE, F64, I32),
        Operator::F64Lt => (OP_F64_LT, F64, I32),
        Operator::F64Gt => (OP_F64_GT, F64, I32),
        Operator::F64Le => (OP_F64_LE, F64, I32),
        Operator::F64Ge => (OP_F64_GE, F64, I32),
        Operator::F64Add => (OP_F64_ADD, F64, F64),
        Operator::F64Sub => (OP_F64_SUB, F64, F64),
        Operator::F64Mul => (OP_F64_MUL, F64, F64),
        Operator::F64Div => (OP_F64_DIV, F64, F64),
        Operator::F64Min => (OP_F64_MIN, F64, F64),
        Operator::F64Max => (OP_F64_MAX, F64, F64),
        Operator::F64Copysign => (OP_F64_COPYSIGN, F64, F64),
        _ => return None,
    })
}

/// Internal opcode, source kind and destination kind of a one-operand
/// source opcode.
fn unary_info(op: &Operator) -> Option<(u16, ValueKind, ValueKind)> {
    use ValueKind::*;
    Some(match op {
        Operator::I32Eqz => (OP_I32_EQZ, I32, I32),
        Operator::I32Clz => (OP_I32_CLZ, I32, I32),
        Operator::I32Ctz => (OP_I32_CTZ, I32, I32),
        Operator::I32Popcnt => (OP_I32_POPCNT, I32, I32),
        Operator::I32Extend8S => (OP_I32_EXTEND8_S, I32, I32),
        Operator::I32Extend16S => (OP_I32_EXTEND16_S, I32, I32),
        Operator::I64Eqz => (OP_I64_EQZ, I64, I32),
        Operator::I64Clz => (OP_I64_CLZ, I64, I64),
        Operator::I64Ctz => (OP_I64_CTZ, I64, I64),
        Operator::I64Popcnt => (OP_I64_POPCNT, I64, I64),
        Operator::I64Extend8S => (OP_I64_EXTEND8_S, I64, I64),
        Operator::I64Extend16S => (OP_I64_EXTEND16_S, I64, I64),
        Operator::I64Extend32S => (OP_I64_EXTEND32_S, I64, I64),
        Operator::F32Abs => (OP_F32_ABS, F32, F32),
        Operator::F32Neg => (OP_F32_NEG, F32, F32),
        Operator::F32Ceil => (OP_F32_CEIL, F32, F32),
        Operator::F32Floor => (OP_F32_FLOOR, F32, F32),
        Operator::F32Trunc => (OP_F32_TRUNC, F32, F32),
        Operator::F32Nearest => (OP_F32_NEAREST, F32, F32),
        Operator::F32Sqrt => (OP_F32_SQRT, F32, F32),
        Operator::F64Abs => (OP_F64_ABS, F64, F64),
        Operator::F64Neg => (OP_F64_NEG, F64, F64),
        Operator::F64Ceil => (OP_F64_CEIL, F64, F64),
        Operator::F64Floor => (OP_F64_FLOOR, F64, F64),
        Operator::F64Trunc => (OP_F64_TRUNC, F64, F64),
        Operator::F64Nearest => (OP_F64_NEAREST, F64, F64),
        Operator::F64Sqrt => (OP_F64_SQRT, F64, F64),
        Operator::I32WrapI64 => (OP_I32_WRAP_I64, I64, I32),
        Operator::I64ExtendI32S => (OP_I64_EXTEND_I32_S, I32, I64),
        Operator::I64ExtendI32U => (OP_I64_EXTEND_I32_U, I32, I64),
        Operator::I32TruncF32S => (OP_I32_TRUNC_F32_S, F32, I32),
        Operator::I32TruncF32U => (OP_I32_TRUNC_F32_U, F32, I32),
        Operator::I32TruncF64S => (OP_I32_TRUNC_F64_S, F64, I32),
        Operator::I32TruncF64U => (OP_I32_TRUNC_F64_U, F64, I32),
        Operator::I64TruncF32S => (OP_I64_TRUNC_F32_S, F32, I64),
        Operator::I64TruncF32U => (OP_I64_TRUNC_F32_U, F32, I64),
        Operator::I64TruncF64S => (OP_I64_TRUNC_F64_S, F64, I64),
        Operator::I64TruncF64U => (OP_I64_TRUNC_F64_U, F64, I64),
        Operator::I32TruncSatF32S => (OP_I32_TRUNC_SAT_F32_S, F32, I32),
        Operator::I32TruncSatF32U => (OP_I32_TRUNC_SAT_F32_U, F32, I32),
        Operator::I32TruncSatF64S => (OP_I32_TRUNC_SAT_F64_S, F64, I32),
        Operator::I32TruncSatF64U => (OP_I32_TRUNC_SAT_F64_U, F64, I32),
        Operator::I64TruncSatF32S => (OP_I64_TRUNC_SAT_F32_S, F32, I64),
        Operator::I64TruncSatF32U => (OP_I64_TRUNC_SAT_F32_U, F32, I64),
        Operator::I64TruncSatF64S => (OP_I64_TRUNC_SAT_F64_S, F64, I64),
        Operator::I64TruncSatF64U => (OP_I64_TRUNC_SAT_F64_U, F64, I64),
        Operator::F32ConvertI32S => (OP_F32_CONVERT_I32_S, I32, F32),
        Operator::F32ConvertI32U => (OP_F32_CONVERT_I32_U, I32, F32),
        Operator::F32ConvertI64S => (OP_F32_CONVERT_I64_S, I64, F32),
        Operator::F32ConvertI64U => (OP_F32_CONVERT_I64_U, I64, F32),
        Operator::F32DemoteF64 => (OP_F32_DEMOTE_F64, F64, F32),
        Operator::F64ConvertI32S => (OP_F64_CONVERT_I32_S, I32, F64),
        Operator::F64ConvertI32U => (OP_F64_CONVERT_I32_U, I32, F64),
        Operator::F64ConvertI64S => (OP_F64_CONVERT_I64_S, I64, F64),
        Operator::F64ConvertI64U => (OP_F64_CONVERT_I64_U, I64, F64),
        Operator::F64PromoteF32 => (OP_F64_PROMOTE_F32, F32, F64),
        Operator::I32ReinterpretF32 => (OP_I32_REINTERPRET_F32, F32, I32),
        Operator::I64ReinterpretF64 => (OP_I64_REINTERPRET_F64, F64, I64),
        Operator::F32ReinterpretI32 => (OP_F32_REINTERPRET_I32, I32, F32),
        Operator::F64ReinterpretI64 => (OP_F64_REINTERPRET_I64, I64, F64),
        _ => return None,
    })
}

fn load_info<'a, 'op>(op: &'a Operator<'op>) -> Option<(u16, ValueKind, &'a wasmparser::MemArg)> {
    use ValueKind::*;
    Some(match op {
        Operator::I32Load { memarg } => (OP_I32_LOAD, I32, memarg),
        Operator::I64Load { memarg } => (OP_I64_LOAD, I64, memarg),
        Operator::F32Load { memarg } => (OP_F32_LOAD, F32, memarg),
        Operator::F64Load { memarg } => (OP_F64_LOAD, F64, memarg),
        Operator::I32Load8S { memarg } => (OP_I32_LOAD8_S, I32, memarg),
        Operator::I32Load8U { memarg } => (OP_I32_LOAD8_U, I32, memarg),
        Operator::I32Load16S { memarg } => (OP_I32_LOAD16_S, I32, memarg),
        Operator::I32Load16U { memarg } => (OP_I32_LOAD16_U, I32, memarg),
        Operator::I64Load8S { memarg } => (OP_I64_LOAD8_S, I64, memarg),
        Operator::I64Load8U { memarg } => (OP_I64_LOAD8_U, I64, memarg),
        Operator::I64Load16S { memarg } => (OP_I64_LOAD16_S, I64, memarg),
        Operator::I64Load16U { memarg } => (OP_I64_LOAD16_U, I64, memarg),
        Operator::I64Load32S { memarg } => (OP_I64_LOAD32_S, I64, memarg),
        Operator::I64Load32U { memarg } => (OP_I64_LOAD32_U, I64, memarg),
        _ => return None,
    })
}

fn store_info<'a, 'op>(op: &'a Operator<'op>) -> Option<(u16, ValueKind, &'a wasmparser::MemArg)> {
    use ValueKind::*;
    Some(match op {
        Operator::I32Store { memarg } => (OP_I32_STORE, I32, memarg),
        Operator::I64Store { memarg } => (OP_I64_STORE, I64, memarg),
        Operator::F32Store { memarg } => (OP_F32_STORE, F32, memarg),
        Operator::F64Store { memarg } => (OP_F64_STORE, F64, memarg),
        Operator::I32Store8 { memarg } => (OP_I32_STORE8, I32, memarg),
        Operator::I32Store16 { memarg } => (OP_I32_STORE16, I32, memarg),
        Operator::I64Store8 { memarg } => (OP_I64_STORE8, I64, memarg),
        Operator::I64Store16 { memarg } => (OP_I64_STORE16, I64, memarg),
        Operator::I64Store32 { memarg } => (OP_I64_STORE32, I64, memarg),
        _ => return None,
    })
}
