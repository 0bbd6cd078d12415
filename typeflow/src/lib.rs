//! Typeflow
//!
//! Forward type-flow analysis and type-based reduction for an SSA graph IR
//! of garbage-collected reference code. The analyzer records what is known
//! about the operand of every cast, type check, null test and field access;
//! the reducer uses those records to remove redundant checks, weaken casts
//! to null checks or traps, and fold round-trip boundary conversions.

pub mod analysis;
pub mod config;
pub mod error;
pub mod interp;
pub mod ir;
pub mod pipeline;
pub mod reduce;
pub mod types;

pub use analysis::{AnalysisResult, InputTypeMap, TypeAnalyzer};
pub use config::PassConfig;
pub use error::{PassError, Result};
pub use ir::{Graph, GraphBuilder};
pub use pipeline::{CompilationUnit, OptimizationPipeline, PassContext, TypeOptimizationPass};
pub use reduce::{ReductionStats, TypeReducer};
pub use types::{ModuleContext, ModuleLattice, TypeIndex, TypeOracle, ValueType};
