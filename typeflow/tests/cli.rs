//! Command-line driver tests
//!
//! Each test writes a compilation unit to a temporary JSON file and runs the
//! `typeflow` binary on it.

mod common;

use std::fs;
use std::path::PathBuf;
use std::process::{Command, Output};

use common::{any, unit, zoo};
use typeflow::ir::{GraphBuilder, NullCheck};
use typeflow::pipeline::CompilationUnit;
use typeflow::types::HeapType;
use typeflow::ValueType;

/// Write `unit` to a per-test file in the temp directory
fn fixture(name: &str, unit: &CompilationUnit) -> PathBuf {
    let path = std::env::temp_dir().join(format!("typeflow_cli_{name}.json"));
    fs::write(&path, unit.to_json().unwrap()).unwrap();
    path
}

fn typeflow(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_typeflow"))
        .args(args)
        .env_remove("RUST_LOG")
        .output()
        .expect("failed to run typeflow")
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

/// Check for `Dog`, cast to `Dog` on the true side and read its byte field
fn checked_cast_unit() -> CompilationUnit {
    let zoo = zoo();
    let dog = ValueType::non_null(HeapType::Defined(zoo.dog));
    let mut b = GraphBuilder::new();
    let then_block = b.new_block();
    let else_block = b.new_block();
    let p = b.parameter(0);
    let is_dog = b.check(p, any(), dog);
    b.branch(is_dog, then_block, else_block);
    b.bind(then_block);
    let cast = b.cast(p, any(), dog);
    let byte = b.struct_get(cast, zoo.dog, 1, NullCheck::WithNullCheck);
    b.ret(Some(byte));
    b.bind(else_block);
    let zero = b.word32_constant(0);
    b.ret(Some(zero));
    unit(&zoo, vec![any()], b.finish())
}

#[test]
fn test_reduce_prints_reduced_graph() {
    let path = fixture("reduce", &checked_cast_unit());
    let output = typeflow(&["reduce", path.to_str().unwrap()]);
    assert!(output.status.success(), "{}", stderr(&output));
    insta::assert_snapshot!(stdout(&output), @r"
B0:
  %0 = Parameter(0)
  %1 = TypeCheck(%0) (ref null any) -> (ref $1)
  branch %1 ? B1 : B2
B1: <- B0
  %2 = StructGet(%0) $1.1 unchecked
  return %2
B2: <- B0
  %3 = Word32Constant(0)
  return %3
");
    assert!(stderr(&output).contains("casts removed:           1"));
}

#[test]
fn test_reduce_json_round_trips() {
    let path = fixture("reduce_json", &checked_cast_unit());
    let output = typeflow(&["reduce", path.to_str().unwrap(), "--json"]);
    assert!(output.status.success(), "{}", stderr(&output));
    let reduced = CompilationUnit::from_json(&stdout(&output)).unwrap();
    assert!(reduced.validate().is_ok());
    assert_eq!(reduced.graph.count_opcode("TypeCast"), 0);
}

#[test]
fn test_analyze_prints_input_types() {
    let path = fixture("analyze", &checked_cast_unit());
    let output = typeflow(&["analyze", path.to_str().unwrap()]);
    assert!(output.status.success(), "{}", stderr(&output));
    insta::assert_snapshot!(stdout(&output), @r"
%1 TypeCheck: (ref null any)
%2 TypeCast: (ref $1)
%3 StructGet: (ref $1)
");
}

#[test]
fn test_run_original_and_reduced() {
    let path = fixture("run", &checked_cast_unit());
    let path = path.to_str().unwrap();
    for extra in [&[][..], &["--reduced"][..]] {
        let mut args = vec!["run", path];
        args.extend_from_slice(extra);
        args.extend_from_slice(&["--args", "new:1"]);
        let output = typeflow(&args);
        assert!(output.status.success(), "{}", stderr(&output));
        assert_eq!(stdout(&output), "returned 0\n");
    }
}

#[test]
fn test_run_reports_traps() {
    let zoo = zoo();
    let cat = ValueType::nullable(HeapType::Defined(zoo.cat));
    let dog = ValueType::nullable(HeapType::Defined(zoo.dog));
    let mut b = GraphBuilder::new();
    let p = b.parameter(0);
    let cast = b.cast(p, any(), dog);
    b.ret(Some(cast));
    let path = fixture("trap", &unit(&zoo, vec![cat], b.finish()));

    let output = typeflow(&["run", path.to_str().unwrap(), "--args", "new:2"]);
    assert!(output.status.success(), "{}", stderr(&output));
    assert_eq!(stdout(&output), "trapped: illegal_cast\n");
}

#[test]
fn test_run_needs_non_null_globals() {
    let zoo = zoo();
    let mut b = GraphBuilder::new();
    let value = b.global_get(zoo.animal_global);
    let test = b.is_null(value, ValueType::nullable(HeapType::Any));
    b.ret(Some(test));
    let path = fixture("global", &unit(&zoo, vec![], b.finish()));
    let path = path.to_str().unwrap();

    let output = typeflow(&["run", path]);
    assert!(!output.status.success());
    assert!(stderr(&output).contains("non-null global 1 read before it was set"));

    let output = typeflow(&["run", path, "--global", "1=new:0"]);
    assert!(output.status.success(), "{}", stderr(&output));
    assert_eq!(stdout(&output), "returned 0\n");
}

#[test]
fn test_bad_unit_is_reported() {
    let path = std::env::temp_dir().join("typeflow_cli_bad.json");
    fs::write(&path, "{ \"module\": 3 }").unwrap();
    let output = typeflow(&["analyze", path.to_str().unwrap()]);
    assert!(!output.status.success());
    assert!(stderr(&output).starts_with("Error:"));
}
