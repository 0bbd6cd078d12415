//! Shared fixtures for the integration tests

#![allow(dead_code)]

use typeflow::analysis::AnalysisResult;
use typeflow::interp::{InterpResult, Interpreter, Outcome, Value};
use typeflow::ir::Graph;
use typeflow::pipeline::{CompilationUnit, Optimized};
use typeflow::types::{FieldType, FunctionSignature, HeapType, StorageType};
use typeflow::{ModuleContext, PassConfig, TypeIndex, ValueType};

/// A small class hierarchy:
///
/// ```text
/// $0 Animal { i32 }
/// $1 Dog <: Animal { i32, i8 }
/// $2 Cat <: Animal { i32 }
/// $3 Bytes = array i8
/// $4 sig = () -> ()
/// ```
///
/// plus function 0 of type `sig`, a nullable `Animal` global (0) and a
/// non-null `Animal` global (1).
pub struct Zoo {
    pub module: ModuleContext,
    pub animal: TypeIndex,
    pub dog: TypeIndex,
    pub cat: TypeIndex,
    pub bytes: TypeIndex,
    pub sig: TypeIndex,
    pub nullable_global: u32,
    pub animal_global: u32,
}

pub fn zoo() -> Zoo {
    let mut module = ModuleContext::new();
    let word = FieldType::mutable(StorageType::Value(ValueType::I32));
    let byte = FieldType::mutable(StorageType::I8);
    let animal = module.add_struct("Animal", vec![word], None);
    let dog = module.add_struct("Dog", vec![word, byte], Some(animal));
    let cat = module.add_struct("Cat", vec![word], Some(animal));
    let bytes = module.add_array("Bytes", byte, None);
    let sig = module.add_signature("sig", FunctionSignature::default());
    module.add_function("f", sig);
    let nullable_global = module.add_global(ValueType::nullable(HeapType::Defined(animal)), true);
    let animal_global = module.add_global(ValueType::non_null(HeapType::Defined(animal)), false);
    Zoo {
        module,
        animal,
        dog,
        cat,
        bytes,
        sig,
        nullable_global,
        animal_global,
    }
}

pub fn any() -> ValueType {
    ValueType::nullable(HeapType::Any)
}

pub fn unit(zoo: &Zoo, params: Vec<ValueType>, graph: Graph) -> CompilationUnit {
    CompilationUnit {
        module: zoo.module.clone(),
        signature: FunctionSignature {
            params,
            results: vec![],
        },
        graph,
    }
}

pub fn optimize(unit: &CompilationUnit) -> Optimized {
    unit.optimize(PassConfig::default()).expect("optimization failed")
}

pub fn analyze(unit: &CompilationUnit) -> AnalysisResult {
    unit.analyze(&PassConfig::default()).expect("analysis failed")
}

/// Argument recipe, materialized against a fresh interpreter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arg {
    Int(i32),
    Null,
    Host(u32),
    New(TypeIndex),
}

/// Interpreter whose non-null globals hold a fresh object of their declared type
pub fn interpreter(module: &ModuleContext, fuel: usize) -> InterpResult<Interpreter<'_>> {
    let mut interpreter = Interpreter::new(module).with_fuel(fuel);
    for (global, decl) in module.globals.iter().enumerate() {
        if let ValueType::Ref {
            heap,
            nullable: false,
        } = decl.ty
        {
            if let Some(index) = heap.defined_index() {
                let value = interpreter.allocate_default(index)?;
                interpreter.set_global(global as u32, value)?;
            }
        }
    }
    Ok(interpreter)
}

pub fn run(unit: &CompilationUnit, graph: &Graph, args: &[Arg]) -> InterpResult<Outcome> {
    let mut interpreter = interpreter(&unit.module, 500)?;
    let values = materialize(&mut interpreter, args)?;
    interpreter.run(graph, &values)
}

pub fn materialize(interpreter: &mut Interpreter<'_>, args: &[Arg]) -> InterpResult<Vec<Value>> {
    args.iter()
        .map(|arg| match *arg {
            Arg::Int(n) => Ok(Value::I32(n)),
            Arg::Null => Ok(Value::NULL),
            Arg::Host(n) => Ok(Value::Ref(typeflow::interp::Reference::Host(n))),
            Arg::New(ty) => interpreter.allocate_default(ty),
        })
        .collect()
}

/// Original and reduced graphs behave the same for `args`
pub fn assert_equivalent(unit: &CompilationUnit, reduced: &Graph, args: &[Arg]) {
    let before = run(unit, &unit.graph, args).map_err(|e| e.kind);
    let after = run(unit, reduced, args).map_err(|e| e.kind);
    assert_eq!(before, after, "behavior changed for {args:?}");
}
