// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Validates a binary module and feeds it section by section into a
//! [`ModuleGenerator`].

mod const_expr;

use wasmparser::{
    BinaryReader, CompositeInnerType, DataKind, DataSectionReader, ElementItems, ElementKind,
    ElementSectionReader, ExportSectionReader, ExternalKind, FuncValidatorAllocations,
    FunctionBody, FunctionSectionReader, GlobalSectionReader, ImportSectionReader,
    MemorySectionReader, Name, NameSectionReader, Parser, Payload, RefType, TableInit,
    TableSectionReader, TypeRef, TypeSectionReader, Validator, WasmFeatures,
};

use crate::generator::ModuleGenerator;
use crate::indices::{EntityIndex, FuncIndex, GlobalIndex, SigIndex, TableIndex};
use crate::module::Module;
use crate::types::{GlobalType, MemoryType, Sig, TableType, ValType};
use crate::{Engine, Error, Result, wasm_unsupported};

/// Translates the binary encoding of a module into a compiled [`Module`].
pub struct ModuleTranslator<'a> {
    generator: ModuleGenerator,
    validator: Validator,
    bytes: &'a [u8],
    num_func_imports: u32,
    num_defined_funcs: u32,
}

impl<'a> ModuleTranslator<'a> {
    pub fn new(engine: &Engine) -> Self {
        Self {
            generator: ModuleGenerator::new(engine),
            validator: Validator::new_with_features(WasmFeatures::default()),
            bytes: &[],
            num_func_imports: 0,
            num_defined_funcs: 0,
        }
    }

    /// Validates and compiles `bytes`.
    ///
    /// # Errors
    ///
    /// Fails if the module is malformed or invalid, uses a feature this crate
    /// does not support, exceeds the engine's limits, or a function fails to
    /// compile. One failing function fails the whole module.
    pub fn translate(mut self, bytes: &'a [u8]) -> Result<Module> {
        self.bytes = bytes;
        tracing::debug!(len = bytes.len(), "translating module");

        for payload in Parser::new(0).parse_all(bytes) {
            self.translate_payload(payload?)?;
        }

        // modules without a code section never started function definitions
        self.generator.start_func_defs()?;
        self.generator.finish_func_defs()?;
        self.generator.set_bytecode(bytes);
        let module = self.generator.finish()?;

        tracing::debug!(
            name = module.name(),
            code = module.code().len(),
            "module translated"
        );
        Ok(module)
    }

    /// Translates a single payload (essentially a section) of a WASM module.
    fn translate_payload(&mut self, payload: Payload<'a>) -> Result<()> {
        match payload {
            Payload::Version {
                num,
                encoding,
                range,
            } => {
                self.validator.version(num, encoding, &range)?;
            }
            Payload::TypeSection(types) => {
                self.validator.type_section(&types)?;
                self.translate_type_section(types)?;
            }
            Payload::ImportSection(imports) => {
                self.validator.import_section(&imports)?;
                self.translate_import_section(imports)?;
            }
            Payload::FunctionSection(functions) => {
                self.validator.function_section(&functions)?;
                self.translate_function_section(functions)?;
            }
            Payload::TableSection(tables) => {
                self.validator.table_section(&tables)?;
                self.translate_table_section(tables)?;
            }
            Payload::MemorySection(memories) => {
                self.validator.memory_section(&memories)?;
                self.translate_memory_section(memories)?;
            }
            Payload::TagSection(tags) => {
                self.validator.tag_section(&tags)?;
                return Err(wasm_unsupported!("exception handling"));
            }
            Payload::GlobalSection(globals) => {
                self.validator.global_section(&globals)?;
                self.translate_global_section(globals)?;
            }
            Payload::ExportSection(exports) => {
                self.validator.export_section(&exports)?;
                self.translate_export_section(exports)?;
            }
            Payload::StartSection { func, range } => {
                self.validator.start_section(func, &range)?;
                self.generator.declare_start(FuncIndex::from_u32(func))?;
            }
            Payload::ElementSection(elements) => {
                self.validator.element_section(&elements)?;
                self.translate_element_section(elements)?;
            }
            Payload::DataCountSection { count, range } => {
                self.validator.data_count_section(count, &range)?;
            }
            Payload::DataSection(data) => {
                self.validator.data_section(&data)?;
                self.translate_data_section(data)?;
            }
            Payload::CodeSectionStart { count, range, .. } => {
                self.validator.code_section_start(count, &range)?;
                tracing::trace!(count, "code section");
                self.generator.start_func_defs()?;
            }
            Payload::CodeSectionEntry(body) => {
                self.translate_function_body(&body)?;
            }
            Payload::CustomSection(section) => match section.name() {
                "name" => {
                    let reader = NameSectionReader::new(BinaryReader::new(
                        section.data(),
                        section.data_offset(),
                    ));
                    // a malformed name section does not invalidate the module
                    if let Err(err) = self.translate_name_section(reader) {
                        tracing::debug!("ignoring malformed name section: {err}");
                    }
                }
                name => tracing::trace!("skipping custom section {name}"),
            },
            Payload::End(offset) => {
                self.validator.end(offset)?;
            }
            p => tracing::warn!("unknown section {p:?}"),
        }
        Ok(())
    }

    fn translate_type_section(&mut self, types: TypeSectionReader<'a>) -> Result<()> {
        for rec_group in types {
            for sub_type in rec_group?.into_types() {
                let CompositeInnerType::Func(func_ty) = &sub_type.composite_type.inner else {
                    return Err(wasm_unsupported!("GC types"));
                };
                self.generator.declare_sig(Sig::try_from(func_ty)?)?;
            }
        }
        Ok(())
    }

    fn translate_import_section(&mut self, imports: ImportSectionReader<'a>) -> Result<()> {
        for import in imports {
            let import = import?;
            match import.ty {
                TypeRef::Func(index) => {
                    self.generator.declare_func_import(
                        import.module,
                        import.name,
                        SigIndex::from_u32(index),
                    )?;
                    self.num_func_imports += 1;
                }
                TypeRef::Table(ty) => {
                    self.generator
                        .declare_table_import(import.module, import.name, table_type(&ty)?)?;
                }
                TypeRef::Memory(ty) => {
                    self.generator
                        .declare_memory_import(import.module, import.name, memory_type(&ty)?)?;
                }
                TypeRef::Global(ty) => {
                    self.generator
                        .declare_global_import(import.module, import.name, global_type(&ty)?)?;
                }
                TypeRef::Tag(_) => return Err(wasm_unsupported!("exception handling")),
            }
        }
        Ok(())
    }

    fn translate_function_section(&mut self, functions: FunctionSectionReader<'a>) -> Result<()> {
        for sig in functions {
            self.generator.declare_func(SigIndex::from_u32(sig?))?;
        }
        Ok(())
    }

    fn translate_table_section(&mut self, tables: TableSectionReader<'a>) -> Result<()> {
        for table in tables {
            let table = table?;
            if let TableInit::Expr(_) = table.init {
                return Err(wasm_unsupported!("table initializer expressions"));
            }
            self.generator.declare_table(table_type(&table.ty)?)?;
        }
        Ok(())
    }

    fn translate_memory_section(&mut self, memories: MemorySectionReader<'a>) -> Result<()> {
        for ty in memories {
            self.generator.declare_memory(memory_type(&ty?)?)?;
        }
        Ok(())
    }

    fn translate_global_section(&mut self, globals: GlobalSectionReader<'a>) -> Result<()> {
        for global in globals {
            let global = global?;
            let init = const_expr::init_expr(&global.init_expr)?;
            self.generator.declare_global(global_type(&global.ty)?, init)?;
        }
        Ok(())
    }

    fn translate_export_section(&mut self, exports: ExportSectionReader<'a>) -> Result<()> {
        for export in exports {
            let export = export?;
            let index = match export.kind {
                ExternalKind::Func => EntityIndex::Function(FuncIndex::from_u32(export.index)),
                ExternalKind::Table => EntityIndex::Table(TableIndex::from_u32(export.index)),
                ExternalKind::Memory => EntityIndex::Memory,
                ExternalKind::Global => EntityIndex::Global(GlobalIndex::from_u32(export.index)),
                ExternalKind::Tag => return Err(wasm_unsupported!("exception handling")),
            };
            self.generator.declare_export(export.name, index)?;
        }
        Ok(())
    }

    fn translate_element_section(&mut self, elements: ElementSectionReader<'a>) -> Result<()> {
        for element in elements {
            let element = element?;
            let ElementKind::Active {
                table_index,
                offset_expr,
            } = element.kind
            else {
                return Err(wasm_unsupported!("passive and declared element segments"));
            };

            let funcs = match element.items {
                ElementItems::Functions(funcs) => funcs
                    .into_iter()
                    .map(|func| Ok(Some(FuncIndex::from_u32(func?))))
                    .collect::<Result<Vec<_>>>()?,
                ElementItems::Expressions(_, exprs) => exprs
                    .into_iter()
                    .map(|expr| const_expr::elem_expr(&expr?))
                    .collect::<Result<Vec<_>>>()?,
            };

            let offset = const_expr::init_expr(&offset_expr)?;
            let table = TableIndex::from_u32(table_index.unwrap_or(0));
            self.generator.declare_elem_segment(table, offset, funcs)?;
        }
        Ok(())
    }

    fn translate_data_section(&mut self, data: DataSectionReader<'a>) -> Result<()> {
        for segment in data {
            let segment = segment?;
            let DataKind::Active {
                memory_index: 0,
                offset_expr,
            } = segment.kind
            else {
                return Err(wasm_unsupported!("passive data segments and multiple memories"));
            };
            let offset = const_expr::init_expr(&offset_expr)?;
            self.generator.declare_data_segment(offset, segment.data)?;
        }
        Ok(())
    }

    fn translate_function_body(&mut self, body: &FunctionBody<'a>) -> Result<()> {
        self.validator
            .code_section_entry(body)?
            .into_validator(FuncValidatorAllocations::default())
            .validate(body)?;

        let range = body.range();
        let bytes = self
            .bytes
            .get(range.clone())
            .ok_or_else(|| Error::internal("function body outside of the module bytes"))?;

        let func_index = FuncIndex::from_u32(self.num_func_imports + self.num_defined_funcs);
        self.num_defined_funcs += 1;

        let mut fg = self.generator.start_func_def()?;
        fg.set_body(bytes, range.start)?;
        self.generator.finish_func_def(func_index, fg)
    }

    fn translate_name_section(&mut self, names: NameSectionReader<'a>) -> Result<()> {
        for subsection in names {
            match subsection? {
                Name::Module { name, .. } => self.generator.declare_module_name(name),
                Name::Function(names) => {
                    for naming in names {
                        let naming = naming?;
                        self.generator
                            .declare_func_name(FuncIndex::from_u32(naming.index), naming.name);
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }
}

fn table_type(ty: &wasmparser::TableType) -> Result<TableType> {
    if ty.table64 || ty.shared {
        return Err(wasm_unsupported!("64-bit and shared tables"));
    }
    if ty.element_type != RefType::FUNCREF {
        return Err(wasm_unsupported!("tables of {}", ty.element_type));
    }
    Ok(TableType {
        initial: limit_u32(ty.initial, "table size")?,
        maximum: ty.maximum.map(|max| limit_u32(max, "table size")).transpose()?,
    })
}

fn memory_type(ty: &wasmparser::MemoryType) -> Result<MemoryType> {
    if ty.memory64 {
        return Err(wasm_unsupported!("memory64"));
    }
    if ty.shared {
        return Err(wasm_unsupported!("shared memories (threads)"));
    }
    if ty.page_size_log2.is_some() {
        return Err(wasm_unsupported!("custom page sizes"));
    }
    Ok(MemoryType {
        initial: limit_u32(ty.initial, "memory size")?,
        maximum: ty.maximum.map(|max| limit_u32(max, "memory size")).transpose()?,
    })
}

fn global_type(ty: &wasmparser::GlobalType) -> Result<GlobalType> {
    if ty.shared {
        return Err(wasm_unsupported!("shared globals"));
    }
    Ok(GlobalType {
        content: ValType::try_from(ty.content_type)?,
        mutable: ty.mutable,
    })
}

fn limit_u32(value: u64, what: &str) -> Result<u32> {
    u32::try_from(value).map_err(|_| wasm_unsupported!("{what} {value} does not fit in 32 bits"))
}

#[cfg(test)]
mod tests {
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::util::SubscriberInitExt;

    use super::*;
    use crate::Config;

    fn translate(wat: &str) -> Result<Module> {
        let _guard = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_thread_ids(true)
            .set_default();

        let bytes = wat::parse_str(wat).unwrap();
        let engine = Engine::new(Config::new().parallel_compilation(false));
        ModuleTranslator::new(&engine).translate(&bytes)
    }

    #[test]
    fn declarations_reach_the_module() {
        let module = translate(
            r#"(module $m
                (import "env" "log" (func $log (param i32)))
                (memory 1)
                (func $f (export "f") (param i32) (result i32)
                    local.get 0
                    call $log
                    local.get 0)
                (export "mem" (memory 0)))"#,
        )
        .unwrap();

        assert_eq!(module.name(), Some("m"));
        assert_eq!(module.func_name(FuncIndex::from_u32(1)), Some("f"));
        assert_eq!(module.imports().len(), 1);
        assert!(module.get_export("f").is_some());
        assert!(module.get_export("mem").is_some());
        assert!(module.get_export("missing").is_none());
    }

    #[test]
    fn invalid_modules_are_rejected() {
        let err = translate(
            r#"(module (func (result i32) f32.const 1))"#,
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidWebAssembly { .. }), "{err}");
    }

    #[test]
    fn unsupported_features_are_reported() {
        for wat in [
            r#"(module (func (result i32 i32) i32.const 0 i32.const 1))"#,
            r#"(module (table 1 externref))"#,
            r#"(module (func (param externref)))"#,
            r#"(module (table 1 funcref) (elem func 0) (func))"#,
        ] {
            let err = translate(wat).unwrap_err();
            assert!(matches!(err, Error::Unsupported(_)), "{wat}: {err}");
        }
    }
}
