mod alloc;
mod control;
mod emit;
mod operand;
mod preprocess;

use wasmparser::Operator;

use crate::bytecode::dump;
use crate::compile::control::{BlockInfo, CatchInfo};
use crate::compile::operand::OperandStack;
use crate::compile::preprocess::PreprocessData;
use crate::error::CompileError;
use crate::module::{FunctionType, ModuleFunction};
use crate::value::ValueKind;

/// The module-level context a function body is compiled against. All
/// index sections precede the code section, so this is complete by the
/// time bodies arrive.
#[derive(Debug, Default)]
pub(crate) struct ModuleContext {
    pub types: Vec<FunctionType>,
    /// Type index of every function, imports included.
    pub func_type_indices: Vec<u32>,
    /// `(kind, mutable)` of every global, imports included.
    pub globals: Vec<(ValueKind, bool)>,
    /// Element kind of every table.
    pub tables: Vec<ValueKind>,
    /// Signature type index of every tag.
    pub tags: Vec<u32>,
}

impl ModuleContext {
    pub fn function_type(&self, func_index: u32) -> &FunctionType {
        &self.types[self.func_type_indices[func_index as usize] as usize]
    }

    pub fn tag_type(&self, tag_index: u32) -> &FunctionType {
        &self.types[self.tags[tag_index as usize] as usize]
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct LocalInfo {
    pub kind: ValueKind,
    pub pos: u32,
}

/// Per-function compilation state: the operand-stack simulator, the
/// block stack, preprocess data and the draft function being emitted.
/// One instance compiles one function; nothing is shared between
/// functions, so independent modules may compile concurrently.
pub(crate) struct FunctionCompiler<'m> {
    pub(crate) ctx: &'m ModuleContext,
    pub(crate) func: ModuleFunction,
    pub(crate) func_type: FunctionType,
    pub(crate) in_init_expr: bool,
    /// Bytes below the scratch region: parameters, declared locals and,
    /// after preprocess, the pooled constants.
    pub(crate) initial_stack_size: u32,
    pub(crate) stack: OperandStack,
    pub(crate) blocks: Vec<BlockInfo>,
    pub(crate) catches: Vec<CatchInfo>,
    pub(crate) locals: Vec<LocalInfo>,
    pub(crate) pre: PreprocessData,
    /// Byte position of the most recent `i32.eqz`, while it is still
    /// fusable into a following conditional branch.
    pub(crate) last_eqz: Option<usize>,
    /// False while consuming unreachable opcodes after a terminator.
    pub(crate) generating: bool,
    /// Block `end`s left before emission resumes.
    pub(crate) resume_depth: u32,
    /// Source byte offset of the operator being processed.
    pub(crate) src_pos: usize,
    /// Set when the current operator fused the following `local.set`.
    pub(crate) pending_fuse: bool,
}

impl<'m> FunctionCompiler<'m> {
    fn new(
        ctx: &'m ModuleContext,
        type_index: u32,
        func_type: FunctionType,
        in_init_expr: bool,
    ) -> Self {
        FunctionCompiler {
            ctx,
            func: ModuleFunction::new(type_index),
            func_type,
            in_init_expr,
            initial_stack_size: 0,
            stack: OperandStack::default(),
            blocks: Vec::new(),
            catches: Vec::new(),
            locals: Vec::new(),
            pre: PreprocessData::default(),
            last_eqz: None,
            generating: true,
            resume_depth: 0,
            src_pos: 0,
            pending_fuse: false,
        }
    }

    /// Reset all per-pass state; the constant pool and local usage data
    /// survive between the preprocess and emission passes.
    fn begin_pass(&mut self) {
        self.func.code.clear();
        self.func.catch_table.clear();
        self.blocks.clear();
        self.catches.clear();
        self.stack.clear();
        self.stack.size_so_far = self.initial_stack_size;
        self.stack.max_used = self.initial_stack_size;
        self.last_eqz = None;
        self.generating = true;
        self.resume_depth = 0;
    }

    fn run_pass(&mut self, ops: &[(usize, Operator)]) -> Result<(), CompileError> {
        let mut i = 0;
        while i < ops.len() {
            let (pos, op) = &ops[i];
            self.src_pos = *pos;
            if !self.generating && !self.should_resume_at(op) {
                i += 1;
                continue;
            }
            self.pending_fuse = false;
            let next = ops.get(i + 1).map(|(_, op)| op);
            self.process_operator(op, next)?;
            i += 1;
            if self.pending_fuse {
                // The following local.set was fused into the current
                // instruction's destination.
                i += 1;
            }
        }
        Ok(())
    }

    /// While suspended, decide whether `op` re-enables emission. Block
    /// openers deepen the skip; the matching `end` (or an `else`/`catch`
    /// of the suspended block) resumes.
    fn should_resume_at(&mut self, op: &Operator) -> bool {
        match op {
            Operator::Block { .. }
            | Operator::Loop { .. }
            | Operator::If { .. }
            | Operator::Try { .. } => {
                self.resume_depth += 1;
                false
            }
            Operator::End => {
                if self.resume_depth > 0 {
                    self.resume_depth -= 1;
                    if self.resume_depth == 0 {
                        self.generating = true;
                        return true;
                    }
                }
                false
            }
            Operator::Else | Operator::Catch { .. } | Operator::CatchAll => {
                if self.resume_depth == 1 {
                    self.resume_depth = 0;
                    self.generating = true;
                    true
                } else {
                    false
                }
            }
            _ => false,
        }
    }

    /// Suspend emission after a terminator. The innermost block will
    /// restore the snapshot at its `end`; with no enclosing block the
    /// rest of the body is dead.
    pub(crate) fn stop_generation(&mut self) {
        if self.resume_depth != 0 {
            return;
        }
        if let Some(block) = self.blocks.last_mut() {
            block.should_restore_at_end = true;
            block.generation_stopped = true;
            self.resume_depth = 1;
        } else {
            while !self.stack.is_empty() {
                let _ = self.pop_entry();
            }
        }
        self.generating = false;
    }

    /// Opcode of the last record in the emitted bytecode.
    fn last_opcode(&self) -> Option<u16> {
        crate::bytecode::InstrReader::new(self.func.code.bytes())
            .last()
            .map(|i| i.opcode())
    }
}

/// Compile one function body: a preprocess traversal that gathers local
/// liveness and constant frequencies, a reset, the real emission pass
/// with the constant pool fixed, and finally the liveness allocator.
pub(crate) fn compile_function(
    ctx: &ModuleContext,
    type_index: u32,
    declared_locals: &[ValueKind],
    ops: &[(usize, Operator)],
    body_offset: usize,
) -> Result<ModuleFunction, CompileError> {
    let func_type = ctx.types[type_index as usize].clone();
    let mut c = FunctionCompiler::new(ctx, type_index, func_type, false);
    c.func.locals = declared_locals.to_vec();

    let mut pos = 0u32;
    for &kind in c.func_type.params().iter().chain(declared_locals.iter()) {
        c.locals.push(LocalInfo { kind, pos });
        pos += kind.stack_allocated_size();
    }
    if pos > u16::MAX as u32 {
        return Err(CompileError::FrameTooLarge {
            position: body_offset,
        });
    }
    c.initial_stack_size = pos;

    // First traversal: liveness and constant frequencies.
    c.pre.reset(c.locals.len());
    c.pre.in_preprocess = true;
    c.begin_pass();
    c.run_pass(ops)?;
    c.pre.in_preprocess = false;

    // Fix the pool: survivors get stable offsets after the locals.
    c.pre.sort_by_count();
    for i in 0..c.pre.constants.len() {
        let kind = c.pre.constants[i].0.kind();
        c.pre.constants[i].1 = c.initial_stack_size as usize;
        c.initial_stack_size += kind.stack_allocated_size();
    }
    if c.initial_stack_size > u16::MAX as u32 {
        return Err(CompileError::FrameTooLarge {
            position: body_offset,
        });
    }

    // Second traversal: the real emission.
    c.begin_pass();
    c.emit_constant_prelude();
    c.run_pass(ops)?;

    // A body whose tail is unreachable still gets a terminator record.
    if c.last_opcode() != Some(crate::bytecode::opcode::OP_END) {
        c.func.code.push_u16(crate::bytecode::opcode::OP_END);
        c.func.code.push_u16(0);
    }

    c.func.required_stack_size = c.stack.max_used;

    alloc::pack_frame(&mut c);

    if dump::enabled() {
        dump::print_function(&c.func);
    }
    Ok(c.func)
}

/// Compile an init expression (global init, segment offset, element
/// expression) into a miniature function of type `[] -> [kind]`. Init
/// expressions skip the preprocess pass, the constant pool and the
/// allocator.
pub(crate) fn compile_init_expr(
    ctx: &ModuleContext,
    result: ValueKind,
    ops: &[(usize, Operator)],
) -> Result<ModuleFunction, CompileError> {
    let func_type = FunctionType::new(Vec::new(), vec![result]);
    let mut c = FunctionCompiler::new(ctx, u32::MAX, func_type, true);
    c.pre.reset(0);
    c.begin_pass();
    c.run_pass(ops)?;
    c.func.required_stack_size = c.stack.max_used;
    Ok(c.func)
}

/// Map a decoder value type onto ours. GC reference types beyond
/// funcref/externref are not supported.
pub(crate) fn kind_of_valtype(ty: wasmparser::ValType) -> Option<ValueKind> {
    match ty {
        wasmparser::ValType::I32 => Some(ValueKind::I32),
        wasmparser::ValType::I64 => Some(ValueKind::I64),
        wasmparser::ValType::F32 => Some(ValueKind::F32),
        wasmparser::ValType::F64 => Some(ValueKind::F64),
        wasmparser::ValType::V128 => Some(ValueKind::V128),
        wasmparser::ValType::Ref(r) => {
            if r.is_func_ref() {
                Some(ValueKind::FuncRef)
            } else if r.is_extern_ref() {
                Some(ValueKind::ExternRef)
            } else {
                None
            }
        }
    }
}
