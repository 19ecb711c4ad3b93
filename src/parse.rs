use wasmparser::{
    ConstExpr, Element, ElementItems, ElementKind, FunctionBody, Operator, Parser, Payload,
    Validator, WasmFeatures,
};

use crate::compile::{compile_function, compile_init_expr, kind_of_valtype, ModuleContext};
use crate::error::CompileError;
use crate::module::{
    DataSegment, ElemItem, ElemSegment, Export, ExportKind, FunctionType, GlobalType, Import,
    ImportKind, MemoryType, ModuleFunction, ParsedModule, SegmentMode, TableType, TagType,
};
use crate::value::ValueKind;

/// Compile a WebAssembly binary into a module with register-bytecode
/// function bodies.
///
/// The module is validated up front; the single compilation pass then
/// only checks what it naturally observes while simulating operand
/// types. The first failure aborts the whole module.
pub fn parse_module(bytes: &[u8]) -> Result<ParsedModule, CompileError> {
    Validator::new_with_features(features()).validate_all(bytes)?;

    let mut builder = ModuleBuilder::default();
    for payload in Parser::new(0).parse_all(bytes) {
        builder.process_payload(payload?)?;
    }
    Ok(builder.finish())
}

fn features() -> WasmFeatures {
    WasmFeatures::default() | WasmFeatures::EXCEPTIONS | WasmFeatures::LEGACY_EXCEPTIONS
}

#[derive(Default)]
struct ModuleBuilder {
    ctx: ModuleContext,
    functions: Vec<ModuleFunction>,
    num_imported_functions: u32,
    imports: Vec<Import>,
    exports: Vec<Export>,
    globals: Vec<GlobalType>,
    tables: Vec<TableType>,
    memories: Vec<MemoryType>,
    tags: Vec<TagType>,
    elements: Vec<ElemSegment>,
    datas: Vec<DataSegment>,
    start: Option<u32>,
    code_index: u32,
}

impl ModuleBuilder {
    fn process_payload(&mut self, payload: Payload<'_>) -> Result<(), CompileError> {
        match payload {
            Payload::TypeSection(reader) => {
                for ty in reader.into_iter_err_on_gc_types() {
                    let ty = ty?;
                    let params = convert_kinds(ty.params())?;
                    let results = convert_kinds(ty.results())?;
                    self.ctx.types.push(FunctionType::new(params, results));
                }
            }
            Payload::ImportSection(reader) => {
                for import in reader {
                    self.parse_import(import?)?;
                }
            }
            Payload::FunctionSection(reader) => {
                for type_index in reader {
                    let type_index = type_index?;
                    self.ctx.func_type_indices.push(type_index);
                    self.functions.push(ModuleFunction::new(type_index));
                }
            }
            Payload::TableSection(reader) => {
                for table in reader {
                    let table = table?;
                    let kind = ref_kind(table.ty.element_type)?;
                    let init = match table.init {
                        wasmparser::TableInit::RefNull => None,
                        wasmparser::TableInit::Expr(expr) => {
                            Some(self.compile_const_expr(&expr, kind)?)
                        }
                    };
                    self.ctx.tables.push(kind);
                    self.tables.push(TableType {
                        kind,
                        initial: table.ty.initial,
                        maximum: table.ty.maximum,
                        init,
                    });
                }
            }
            Payload::MemorySection(reader) => {
                for memory in reader {
                    let memory = memory?;
                    self.memories.push(MemoryType {
                        initial: memory.initial,
                        maximum: memory.maximum,
                        shared: memory.shared,
                    });
                }
            }
            Payload::TagSection(reader) => {
                for tag in reader {
                    let tag = tag?;
                    self.ctx.tags.push(tag.func_type_idx);
                    self.tags.push(TagType {
                        sig_index: tag.func_type_idx,
                    });
                }
            }
            Payload::GlobalSection(reader) => {
                for global in reader {
                    let global = global?;
                    let kind = kind_of_valtype(global.ty.content_type)
                        .ok_or_else(|| CompileError::parse(0, "unsupported global type"))?;
                    let init = self.compile_const_expr(&global.init_expr, kind)?;
                    self.ctx.globals.push((kind, global.ty.mutable));
                    self.globals.push(GlobalType {
                        kind,
                        mutable: global.ty.mutable,
                        init: Some(init),
                    });
                }
            }
            Payload::ExportSection(reader) => {
                for export in reader {
                    let export = export?;
                    let kind = match export.kind {
                        wasmparser::ExternalKind::Func => ExportKind::Func,
                        wasmparser::ExternalKind::Table => ExportKind::Table,
                        wasmparser::ExternalKind::Memory => ExportKind::Memory,
                        wasmparser::ExternalKind::Global => ExportKind::Global,
                        wasmparser::ExternalKind::Tag => ExportKind::Tag,
                    };
                    self.exports.push(Export {
                        name: export.name.to_string(),
                        kind,
                        index: export.index,
                    });
                }
            }
            Payload::StartSection { func, .. } => {
                self.start = Some(func);
            }
            Payload::ElementSection(reader) => {
                for element in reader {
                    self.parse_element(element?)?;
                }
            }
            Payload::DataSection(reader) => {
                for data in reader {
                    self.parse_data(data?)?;
                }
            }
            Payload::CodeSectionEntry(body) => {
                self.parse_code_entry(body)?;
            }
            _ => {}
        }
        Ok(())
    }

    fn parse_import(&mut self, import: wasmparser::Import<'_>) -> Result<(), CompileError> {
        let kind = match import.ty {
            wasmparser::TypeRef::Func(type_index) => {
                self.ctx.func_type_indices.push(type_index);
                // Imported functions hold empty bodies so indices of
                // defined functions line up with the binary.
                self.functions.push(ModuleFunction::new(type_index));
                self.num_imported_functions += 1;
                ImportKind::Func { type_index }
            }
            wasmparser::TypeRef::Global(ty) => {
                let kind = kind_of_valtype(ty.content_type)
                    .ok_or_else(|| CompileError::parse(0, "unsupported global type"))?;
                self.ctx.globals.push((kind, ty.mutable));
                self.globals.push(GlobalType {
                    kind,
                    mutable: ty.mutable,
                    init: None,
                });
                ImportKind::Global {
                    kind,
                    mutable: ty.mutable,
                }
            }
            wasmparser::TypeRef::Table(ty) => {
                let kind = ref_kind(ty.element_type)?;
                self.ctx.tables.push(kind);
                self.tables.push(TableType {
                    kind,
                    initial: ty.initial,
                    maximum: ty.maximum,
                    init: None,
                });
                ImportKind::Table {
                    kind,
                    initial: ty.initial,
                    maximum: ty.maximum,
                }
            }
            wasmparser::TypeRef::Memory(ty) => {
                self.memories.push(MemoryType {
                    initial: ty.initial,
                    maximum: ty.maximum,
                    shared: ty.shared,
                });
                ImportKind::Memory {
                    initial: ty.initial,
                    maximum: ty.maximum,
                    shared: ty.shared,
                }
            }
            wasmparser::TypeRef::Tag(ty) => {
                self.ctx.tags.push(ty.func_type_idx);
                self.tags.push(TagType {
                    sig_index: ty.func_type_idx,
                });
                ImportKind::Tag {
                    sig_index: ty.func_type_idx,
                }
            }
        };
        self.imports.push(Import {
            module: import.module.to_string(),
            field: import.name.to_string(),
            kind,
        });
        Ok(())
    }

    fn parse_element(&mut self, element: Element<'_>) -> Result<(), CompileError> {
        let (mode, table_index, offset) = match element.kind {
            ElementKind::Active {
                table_index,
                offset_expr,
            } => {
                let offset = self.compile_const_expr(&offset_expr, ValueKind::I32)?;
                (SegmentMode::Active, table_index.unwrap_or(0), Some(offset))
            }
            ElementKind::Passive => (SegmentMode::Passive, 0, None),
            ElementKind::Declared => (SegmentMode::Declared, 0, None),
        };

        let mut items = Vec::new();
        match element.items {
            ElementItems::Functions(reader) => {
                for func in reader {
                    items.push(ElemItem::Func(func?));
                }
            }
            ElementItems::Expressions(ref_type, reader) => {
                let kind = ref_kind(ref_type)?;
                for expr in reader {
                    let expr = expr?;
                    items.push(self.parse_elem_expr(&expr, kind)?);
                }
            }
        }

        self.elements.push(ElemSegment {
            mode,
            table_index,
            offset,
            items,
        });
        Ok(())
    }

    /// Collapse trivial element expressions to direct entries; anything
    /// else is compiled for evaluation at instantiation time.
    fn parse_elem_expr(
        &self,
        expr: &ConstExpr<'_>,
        kind: ValueKind,
    ) -> Result<ElemItem, CompileError> {
        let ops = collect_const_expr_ops(expr)?;
        if ops.len() == 2 {
            match &ops[0].1 {
                Operator::RefFunc { function_index } => {
                    return Ok(ElemItem::Func(*function_index))
                }
                Operator::RefNull { .. } => return Ok(ElemItem::Null),
                _ => {}
            }
        }
        let func = compile_init_expr(&self.ctx, kind, &ops)?;
        Ok(ElemItem::Expr(func))
    }

    fn parse_data(&mut self, data: wasmparser::Data<'_>) -> Result<(), CompileError> {
        let offset = match data.kind {
            wasmparser::DataKind::Active { offset_expr, .. } => {
                Some(self.compile_const_expr(&offset_expr, ValueKind::I32)?)
            }
            wasmparser::DataKind::Passive => None,
        };
        self.datas.push(DataSegment {
            offset,
            data: data.data.to_vec(),
        });
        Ok(())
    }

    fn parse_code_entry(&mut self, body: FunctionBody<'_>) -> Result<(), CompileError> {
        let func_index = self.num_imported_functions + self.code_index;
        let type_index = self.ctx.func_type_indices[func_index as usize];
        let base = body.get_binary_reader().original_position();

        let mut declared = Vec::new();
        for local in body.get_locals_reader()? {
            let (count, ty) = local?;
            let kind = kind_of_valtype(ty)
                .ok_or_else(|| CompileError::parse(base, "unsupported local type"))?;
            for _ in 0..count {
                declared.push(kind);
            }
        }

        let mut reader = body.get_operators_reader()?;
        let mut ops = Vec::new();
        while !reader.eof() {
            let pos = reader.original_position();
            ops.push((pos, reader.read()?));
        }

        let compiled = compile_function(&self.ctx, type_index, &declared, &ops, base)?;
        self.functions[func_index as usize] = compiled;
        self.code_index += 1;
        Ok(())
    }

    fn compile_const_expr(
        &self,
        expr: &ConstExpr<'_>,
        result: ValueKind,
    ) -> Result<ModuleFunction, CompileError> {
        let ops = collect_const_expr_ops(expr)?;
        compile_init_expr(&self.ctx, result, &ops)
    }

    fn finish(self) -> ParsedModule {
        ParsedModule {
            types: self.ctx.types,
            functions: self.functions,
            num_imported_functions: self.num_imported_functions,
            imports: self.imports,
            exports: self.exports,
            globals: self.globals,
            tables: self.tables,
            memories: self.memories,
            tags: self.tags,
            elements: self.elements,
            datas: self.datas,
            start: self.start,
        }
    }
}

fn collect_const_expr_ops<'a>(
    expr: &ConstExpr<'a>,
) -> Result<Vec<(usize, Operator<'a>)>, CompileError> {
    let mut reader = expr.get_operators_reader();
    let mut ops = Vec::new();
    loop {
        let pos = reader.original_position();
        let op = reader.read()?;
        let is_end = matches!(op, Operator::End);
        ops.push((pos, op));
        if is_end {
            return Ok(ops);
        }
    }
}

fn convert_kinds(types: &[wasmparser::ValType]) -> Result<Vec<ValueKind>, CompileError> {
    types
        .iter()
        .map(|ty| {
            kind_of_valtype(*ty).ok_or_else(|| CompileError::parse(0, "unsupported value type"))
        })
        .collect()
}

fn ref_kind(ty: wasmparser::RefType) -> Result<ValueKind, CompileError> {
    if ty.is_func_ref() {
        Ok(ValueKind::FuncRef)
    } else if ty.is_extern_ref() {
        Ok(ValueKind::ExternRef)
    } else {
        Err(CompileError::parse(0, "unsupported reference type"))
    }
}
