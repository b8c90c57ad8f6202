//! # Linking
//!
//! Modules are compiled as they are added; [`Linker::link`] then numbers
//! every function program-wide, interns signatures, patches call and
//! `call_indirect` placeholders, resolves function tables and plans the
//! linear memory. Only linked code is ever wrapped in
//! [`LinkedCode`](crate::bytecode::LinkedCode).

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use log::debug;

use crate::ast::{DataSegment, Module};
use crate::bytecode::LinkedCode;
use crate::error::CompileError;
use crate::function::{CompiledFunction, FunctionIndex};
use crate::FunctionSignature;

use super::{compile_function, UnlinkedFunction};

type SymbolTable = BTreeMap<String, BTreeMap<String, FunctionIndex>>;

/// Linear memory the program asks for.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryPlan {
    /// Largest initial size any module declares.
    pub initial_pages: u32,
    /// Smallest maximum any module declares.
    pub max_pages: Option<u32>,
    /// Data segments of every module, in load order.
    pub data: Vec<DataSegment>,
}

/// A fully linked set of modules.
#[derive(Debug, Clone)]
pub struct Program {
    functions: Vec<Arc<CompiledFunction>>,
    tables: Vec<Vec<Option<FunctionIndex>>>,
    memory: MemoryPlan,
    symbols: SymbolTable,
}

impl Program {
    pub fn functions(&self) -> &[Arc<CompiledFunction>] {
        &self.functions
    }

    pub fn function(&self, index: FunctionIndex) -> Option<&Arc<CompiledFunction>> {
        self.functions.get(index.as_usize())
    }

    /// Looks a function up by module and name.
    pub fn function_index(&self, module: &str, name: &str) -> Option<FunctionIndex> {
        self.symbols.get(module)?.get(name).copied()
    }

    /// Function tables, one per module in load order.
    pub fn tables(&self) -> &[Vec<Option<FunctionIndex>>] {
        &self.tables
    }

    pub fn memory(&self) -> &MemoryPlan {
        &self.memory
    }

    pub(crate) fn into_parts(
        self,
    ) -> (Vec<Arc<CompiledFunction>>, Vec<Vec<Option<FunctionIndex>>>, MemoryPlan, SymbolTable) {
        (self.functions, self.tables, self.memory, self.symbols)
    }
}

struct CompiledModule {
    module: Module,
    functions: Vec<UnlinkedFunction>,
}

/// Collects modules and links them into a [`Program`].
#[derive(Default)]
pub struct Linker {
    modules: Vec<CompiledModule>,
}

impl Linker {
    pub fn new() -> Self {
        Self { modules: Vec::new() }
    }

    /// Compiles every function of `module`.
    ///
    /// Calls stay unresolved until [`link`](Self::link), so modules may be
    /// added in any order.
    pub fn add_module(&mut self, module: &Module) -> Result<(), CompileError> {
        let table = self.modules.len() as u32;
        let functions = module
            .functions
            .iter()
            .map(|f| compile_function(f, &module.types, table))
            .collect::<Result<Vec<_>, _>>()?;
        debug!("compiled module {}: {} functions", module.name, functions.len());
        self.modules.push(CompiledModule {
            module: module.clone(),
            functions,
        });
        Ok(())
    }

    /// Resolves every cross-function reference.
    pub fn link(self) -> Result<Program, CompileError> {
        let mut symbols = SymbolTable::new();
        let mut declared = Vec::new();
        for compiled in &self.modules {
            let module = &compiled.module;
            let names = symbols.entry(module.name.clone()).or_default();
            for function in &module.functions {
                let index = FunctionIndex(declared.len() as u32);
                if names.insert(function.name.clone(), index).is_some() {
                    return Err(CompileError::DuplicateFunction {
                        module: module.name.clone(),
                        name: function.name.clone(),
                    });
                }
                declared.push(function.signature.clone());
            }
        }

        let mut signatures = Vec::new();
        let mut functions = Vec::with_capacity(declared.len());
        let mut tables = Vec::with_capacity(self.modules.len());
        let mut memory = MemoryPlan::default();
        let mut has_memory = false;

        for CompiledModule { module, functions: unlinked } in self.modules {
            for (source, mut code) in module.functions.into_iter().zip(unlinked) {
                link_globally(&mut code, &symbols, &declared, &mut signatures)?;
                let index = FunctionIndex(functions.len() as u32);
                let signature_id = intern(&mut signatures, &source.signature);
                functions.push(Arc::new(CompiledFunction::new(
                    index,
                    module.name.clone(),
                    source,
                    signature_id,
                    LinkedCode::new(code.code),
                    code.anchors,
                )));
            }

            let table = module
                .table
                .iter()
                .map(|entry| match entry {
                    Some(name) => resolve(&symbols, &module.name, name).map(Some),
                    None => Ok(None),
                })
                .collect::<Result<Vec<_>, _>>()?;
            tables.push(table);

            if let Some(limits) = module.memory {
                has_memory = true;
                memory.initial_pages = memory.initial_pages.max(limits.min_pages);
                memory.max_pages = match (memory.max_pages, limits.max_pages) {
                    (Some(a), Some(b)) => Some(a.min(b)),
                    (a, b) => a.or(b),
                };
            }
            memory.data.extend(module.data);
        }
        // no declared memory: nothing may grow one
        if !has_memory {
            memory.max_pages = Some(0);
        }

        debug!(
            "linked {} functions, {} signatures, {} tables",
            functions.len(),
            signatures.len(),
            tables.len()
        );
        Ok(Program {
            functions,
            tables,
            memory,
            symbols,
        })
    }
}

/// Patches call indices and indirect-call signature ids into `function`.
fn link_globally(
    function: &mut UnlinkedFunction,
    symbols: &SymbolTable,
    declared: &[FunctionSignature],
    signatures: &mut Vec<FunctionSignature>,
) -> Result<(), CompileError> {
    for site in &function.calls {
        let target = &site.target;
        let index = resolve(symbols, &target.module, &target.name)?;
        if declared.get(index.as_usize()) != Some(&target.signature) {
            return Err(CompileError::LinkSignatureMismatch {
                module: target.module.clone(),
                name: target.name.clone(),
            });
        }
        function.code.write(site.offset, index.0)?;
    }
    for site in &function.signatures {
        let id = intern(signatures, &site.signature);
        function.code.write(site.offset, id)?;
    }
    Ok(())
}

fn resolve(symbols: &SymbolTable, module: &str, name: &str) -> Result<FunctionIndex, CompileError> {
    symbols
        .get(module)
        .and_then(|names| names.get(name))
        .copied()
        .ok_or_else(|| CompileError::LinkTargetMissing {
            module: String::from(module),
            name: String::from(name),
        })
}

/// Program-wide id of `signature`, adding it if new.
fn intern(signatures: &mut Vec<FunctionSignature>, signature: &FunctionSignature) -> u32 {
    match signatures.iter().position(|s| s == signature) {
        Some(id) => id as u32,
        None => {
            signatures.push(signature.clone());
            (signatures.len() - 1) as u32
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{Function, FunctionRef, Instruction as I, MemoryLimits, Op};
    use crate::WasmType;
    use alloc::string::ToString;
    use alloc::vec;

    fn unary_i32() -> FunctionSignature {
        FunctionSignature::new(&[WasmType::I32], Some(WasmType::I32))
    }

    fn identity(name: &str) -> Function {
        Function::new(name, unary_i32(), vec![], vec![I::local_get(0)])
    }

    fn caller(target: FunctionRef) -> Function {
        Function::new(
            "main",
            FunctionSignature::new(&[], Some(WasmType::I32)),
            vec![],
            vec![I::new(Op::CallImport(target), vec![I::i32_const(5)])],
        )
    }

    #[test]
    fn test_cross_module_call() {
        let lib = Module::new("lib").with_function(identity("id"));
        let main = Module::new("main").with_function(caller(FunctionRef::new("lib", "id", unary_i32())));

        let mut linker = Linker::new();
        linker.add_module(&main).unwrap();
        linker.add_module(&lib).unwrap();
        let program = linker.link().unwrap();

        assert_eq!(program.function_index("main", "main"), Some(FunctionIndex(0)));
        assert_eq!(program.function_index("lib", "id"), Some(FunctionIndex(1)));
        let main = program.function(FunctionIndex(0)).unwrap();
        // const32 (6 bytes), call_import opcode, callee
        assert_eq!(main.code().get::<u32>(8), Ok(1));
    }

    #[test]
    fn test_missing_target() {
        let main = Module::new("main").with_function(caller(FunctionRef::new("lib", "nope", unary_i32())));
        let mut linker = Linker::new();
        linker.add_module(&main).unwrap();
        let err = linker.link().unwrap_err();
        assert_eq!(err.to_string(), "can't find link target lib.nope");
    }

    #[test]
    fn test_signature_mismatch() {
        let lib = Module::new("lib").with_function(Function::new(
            "id",
            FunctionSignature::new(&[WasmType::I32], Some(WasmType::I64)),
            vec![],
            vec![I::unary(crate::ops::NumericOp::I64ExtendI32S, I::local_get(0))],
        ));
        let main = Module::new("main").with_function(caller(FunctionRef::new("lib", "id", unary_i32())));
        let mut linker = Linker::new();
        linker.add_module(&lib).unwrap();
        linker.add_module(&main).unwrap();
        assert_eq!(
            linker.link().unwrap_err(),
            CompileError::LinkSignatureMismatch { module: "lib".to_string(), name: "id".to_string() }
        );
    }

    #[test]
    fn test_duplicate_function() {
        let lib = Module::new("lib").with_function(identity("id")).with_function(identity("id"));
        let mut linker = Linker::new();
        linker.add_module(&lib).unwrap();
        assert!(matches!(linker.link(), Err(CompileError::DuplicateFunction { .. })));
    }

    #[test]
    fn test_tables_signatures_and_memory() {
        let mut a = Module::new("a").with_function(identity("f")).with_function(identity("g"));
        a.table = vec![Some("g".to_string()), None, Some("f".to_string())];
        a.memory = Some(MemoryLimits { min_pages: 1, max_pages: Some(8) });
        let mut b = Module::new("b").with_function(identity("h"));
        b.memory = Some(MemoryLimits { min_pages: 2, max_pages: None });

        let mut linker = Linker::new();
        linker.add_module(&a).unwrap();
        linker.add_module(&b).unwrap();
        let program = linker.link().unwrap();

        assert_eq!(
            program.tables(),
            &[vec![Some(FunctionIndex(1)), None, Some(FunctionIndex(0))], vec![]]
        );
        assert!(program.functions().iter().all(|f| f.signature_id() == 0));
        assert_eq!(program.memory().initial_pages, 2);
        assert_eq!(program.memory().max_pages, Some(8));

        let mut linker = Linker::new();
        linker.add_module(&Module::new("d").with_function(identity("f"))).unwrap();
        let program = linker.link().unwrap();
        assert_eq!(program.memory().initial_pages, 0);
        assert_eq!(program.memory().max_pages, Some(0));

        let mut bad = Module::new("c");
        bad.table = vec![Some("missing".to_string())];
        let mut linker = Linker::new();
        linker.add_module(&bad).unwrap();
        assert!(matches!(linker.link(), Err(CompileError::LinkTargetMissing { .. })));
    }

    #[test]
    fn test_compile_errors_surface_on_add() {
        let module = Module::new("m").with_function(Function::new(
            "f",
            FunctionSignature::new(&[], None),
            vec![],
            vec![I::leaf(Op::Branch { depth: 3 })],
        ));
        let mut linker = Linker::new();
        assert_eq!(
            linker.add_module(&module),
            Err(CompileError::UnknownBranchTarget { depth: 3 })
        );
    }
}
