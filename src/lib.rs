mod bytecode;
mod compile;
mod error;
mod module;
mod parse;
mod value;

pub use bytecode::dump;
pub use bytecode::opcode;
pub use bytecode::{Instr, InstrReader};
pub use error::CompileError;
pub use module::{
    CatchEntry, DataSegment, ElemItem, ElemSegment, Export, ExportKind, FunctionType, GlobalType,
    Import, ImportKind, MemoryType, ModuleFunction, ParsedModule, SegmentMode, TableType, TagType,
};
pub use parse::parse_module;
pub use value::{Value, ValueKind};
