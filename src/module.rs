use crate::bytecode::CodeBuffer;
use crate::value::ValueKind;

/// Signature of a function or block: parameter and result kinds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionType {
    params: Box<[ValueKind]>,
    results: Box<[ValueKind]>,
}

impl FunctionType {
    pub fn new(params: Vec<ValueKind>, results: Vec<ValueKind>) -> Self {
        FunctionType {
            params: params.into(),
            results: results.into(),
        }
    }

    pub fn params(&self) -> &[ValueKind] {
        &self.params
    }

    pub fn results(&self) -> &[ValueKind] {
        &self.results
    }

    /// Bytes the parameters occupy at the bottom of the frame.
    pub fn param_stack_size(&self) -> u32 {
        self.params.iter().map(|k| k.stack_allocated_size()).sum()
    }

    pub fn result_stack_size(&self) -> u32 {
        self.results.iter().map(|k| k.stack_allocated_size()).sum()
    }
}

/// One entry of a function's catch table.
///
/// `try_start..try_end` is the protected bytecode range, `catch_start`
/// the handler entry, `stack_size_to_be` the value-stack depth the
/// runtime restores before entering the handler. `tag_index` is `None`
/// for `catch_all`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatchEntry {
    pub try_start: usize,
    pub try_end: usize,
    pub catch_start: usize,
    pub stack_size_to_be: u32,
    pub tag_index: Option<u32>,
}

/// A compiled function: linear bytecode whose operands are byte offsets
/// into the activation's value stack.
#[derive(Debug, Default, Clone)]
pub struct ModuleFunction {
    pub(crate) type_index: u32,
    pub(crate) locals: Vec<ValueKind>,
    pub(crate) code: CodeBuffer,
    pub(crate) catch_table: Vec<CatchEntry>,
    pub(crate) required_stack_size: u32,
    /// Local live ranges over the final bytecode; populated only when
    /// bytecode dumping is enabled.
    pub(crate) local_ranges: Vec<(usize, usize)>,
}

impl ModuleFunction {
    pub(crate) fn new(type_index: u32) -> Self {
        ModuleFunction {
            type_index,
            ..ModuleFunction::default()
        }
    }

    pub fn type_index(&self) -> u32 {
        self.type_index
    }

    /// Locals declared in the body; parameters are not included.
    pub fn locals(&self) -> &[ValueKind] {
        &self.locals
    }

    pub fn bytecode(&self) -> &[u8] {
        self.code.bytes()
    }

    pub fn catch_table(&self) -> &[CatchEntry] {
        &self.catch_table
    }

    /// Frame bytes one activation of this function needs.
    pub fn required_stack_size(&self) -> u32 {
        self.required_stack_size
    }

    pub fn local_ranges(&self) -> &[(usize, usize)] {
        &self.local_ranges
    }
}

#[derive(Debug, Clone)]
pub struct Import {
    pub module: String,
    pub field: String,
    pub kind: ImportKind,
}

#[derive(Debug, Clone)]
pub enum ImportKind {
    Func { type_index: u32 },
    Global { kind: ValueKind, mutable: bool },
    Table { kind: ValueKind, initial: u64, maximum: Option<u64> },
    Memory { initial: u64, maximum: Option<u64>, shared: bool },
    Tag { sig_index: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportKind {
    Func,
    Table,
    Memory,
    Global,
    Tag,
}

#[derive(Debug, Clone)]
pub struct Export {
    pub name: String,
    pub kind: ExportKind,
    pub index: u32,
}

#[derive(Debug)]
pub struct GlobalType {
    pub kind: ValueKind,
    pub mutable: bool,
    /// Compiled init expression; `None` for imported globals.
    pub init: Option<ModuleFunction>,
}

#[derive(Debug)]
pub struct TableType {
    pub kind: ValueKind,
    pub initial: u64,
    pub maximum: Option<u64>,
    /// Compiled element init expression, if the table declares one.
    pub init: Option<ModuleFunction>,
}

#[derive(Debug, Clone)]
pub struct MemoryType {
    pub initial: u64,
    pub maximum: Option<u64>,
    pub shared: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct TagType {
    pub sig_index: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentMode {
    Active,
    Passive,
    Declared,
}

#[derive(Debug)]
pub enum ElemItem {
    /// Direct function reference.
    Func(u32),
    /// Null reference.
    Null,
    /// Expression evaluated at instantiation time.
    Expr(ModuleFunction),
}

#[derive(Debug)]
pub struct ElemSegment {
    pub mode: SegmentMode,
    pub table_index: u32,
    /// Compiled offset expression for active segments.
    pub offset: Option<ModuleFunction>,
    pub items: Vec<ElemItem>,
}

#[derive(Debug)]
pub struct DataSegment {
    /// Compiled offset expression for active segments.
    pub offset: Option<ModuleFunction>,
    pub data: Vec<u8>,
}

/// The compiled module: every index space the binary declares, with
/// function bodies lowered to internal bytecode. Imported functions
/// hold empty bodies so function indices line up with the binary.
#[derive(Debug, Default)]
pub struct ParsedModule {
    pub types: Vec<FunctionType>,
    pub functions: Vec<ModuleFunction>,
    pub num_imported_functions: u32,
    pub imports: Vec<Import>,
    pub exports: Vec<Export>,
    pub globals: Vec<GlobalType>,
    pub tables: Vec<TableType>,
    pub memories: Vec<MemoryType>,
    pub tags: Vec<TagType>,
    pub elements: Vec<ElemSegment>,
    pub datas: Vec<DataSegment>,
    pub start: Option<u32>,
}

impl ParsedModule {
    pub fn function_type(&self, func_index: u32) -> &FunctionType {
        &self.types[self.functions[func_index as usize].type_index as usize]
    }

    /// Look up an exported function's index by name.
    pub fn export_func(&self, name: &str) -> Option<u32> {
        self.exports
            .iter()
            .find(|e| e.kind == ExportKind::Func && e.name == name)
            .map(|e| e.index)
    }
}
