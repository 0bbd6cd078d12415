//! Pass driver
//!
//! Runs the type analysis and reduction as a pass in an optimization
//! pipeline, and loads compilation units from disk.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::analysis::{AnalysisResult, TypeAnalyzer};
use crate::config::PassConfig;
use crate::error::{PassError, Result};
use crate::ir::Graph;
use crate::reduce::{ReductionStats, TypeReducer, eliminate_dead_operations};
use crate::types::{FunctionSignature, ModuleContext, ModuleLattice, TypeOracle};

/// Everything a pass needs to know about the function being optimized
#[derive(Clone, Copy)]
pub struct PassContext<'a> {
    pub module: &'a ModuleContext,
    pub signature: &'a FunctionSignature,
    pub oracle: &'a dyn TypeOracle,
}

impl<'a> PassContext<'a> {
    pub fn new(
        module: &'a ModuleContext,
        signature: &'a FunctionSignature,
        oracle: &'a dyn TypeOracle,
    ) -> Self {
        Self {
            module,
            signature,
            oracle,
        }
    }
}

/// Graph optimization pass trait
pub trait OptimizationPass {
    /// Name of the optimization pass
    fn name(&self) -> &'static str;

    /// Run the pass on a graph
    /// Returns true if any changes were made
    fn run_on_graph(
        &self,
        graph: &mut Graph,
        ctx: PassContext<'_>,
        stats: &mut OptimizationStats,
    ) -> Result<bool>;
}

/// Statistics from optimization passes
#[derive(Debug, Default, Clone)]
pub struct OptimizationStats {
    /// Number of iterations run
    pub iterations: usize,
    /// Passes that changed the graph, by name
    pub pass_counts: HashMap<String, usize>,
    pub reductions: ReductionStats,
}

impl OptimizationStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_pass(&mut self, name: &str) {
        *self.pass_counts.entry(name.to_string()).or_insert(0) += 1;
    }

    pub fn merge(&mut self, other: &OptimizationStats) {
        self.iterations += other.iterations;
        for (name, count) in &other.pass_counts {
            *self.pass_counts.entry(name.clone()).or_insert(0) += count;
        }
        self.reductions.merge(&other.reductions);
    }
}

/// Output of [`TypeOptimizationPass::run`]
#[derive(Debug, Clone)]
pub struct Reduced {
    pub graph: Graph,
    pub analysis: AnalysisResult,
    pub stats: ReductionStats,
}

/// Type analysis followed by type-based reduction
#[derive(Debug, Clone, Default)]
pub struct TypeOptimizationPass {
    config: PassConfig,
}

impl TypeOptimizationPass {
    pub fn new(config: PassConfig) -> Self {
        Self { config }
    }

    /// Analyze `graph` and build its reduced replacement
    ///
    /// Any invariant violation aborts the whole graph; there is no partial
    /// result.
    pub fn run(&self, graph: &Graph, ctx: PassContext<'_>) -> Result<Reduced> {
        let analysis = TypeAnalyzer::new(graph, ctx)
            .with_branch_refinement(self.config.refine_branches)
            .run()?;
        let (mut reduced, mut stats) = TypeReducer::new(graph, &analysis, ctx)
            .with_conversion_folding(self.config.fold_conversions)
            .reduce()?;
        if self.config.remove_dead_operations {
            let (swept, removed) = eliminate_dead_operations(&reduced)?;
            reduced = swept;
            stats.dead_operations_removed += removed;
        }
        if self.config.verify {
            reduced.verify()?;
        }
        debug!(rewrites = stats.total(), "type optimization finished");
        Ok(Reduced {
            graph: reduced,
            analysis,
            stats,
        })
    }
}

impl OptimizationPass for TypeOptimizationPass {
    fn name(&self) -> &'static str {
        "type_optimization"
    }

    fn run_on_graph(
        &self,
        graph: &mut Graph,
        ctx: PassContext<'_>,
        stats: &mut OptimizationStats,
    ) -> Result<bool> {
        let reduced = self.run(graph, ctx)?;
        let changed = reduced.graph != *graph;
        stats.reductions.merge(&reduced.stats);
        *graph = reduced.graph;
        Ok(changed)
    }
}

/// Removes pure operations whose value is never used
pub struct DeadOperationElimination;

impl OptimizationPass for DeadOperationElimination {
    fn name(&self) -> &'static str {
        "dead_operation_elimination"
    }

    fn run_on_graph(
        &self,
        graph: &mut Graph,
        _ctx: PassContext<'_>,
        stats: &mut OptimizationStats,
    ) -> Result<bool> {
        let (swept, removed) = eliminate_dead_operations(graph)?;
        stats.reductions.dead_operations_removed += removed;
        *graph = swept;
        Ok(removed > 0)
    }
}

/// Optimized graph with the statistics of the run that produced it
#[derive(Debug, Clone)]
pub struct Optimized {
    pub graph: Graph,
    pub stats: OptimizationStats,
}

/// Optimization pipeline
pub struct OptimizationPipeline {
    passes: Vec<Box<dyn OptimizationPass>>,
    max_iterations: usize,
}

impl OptimizationPipeline {
    /// Create an empty pipeline that runs each pass once
    pub fn new() -> Self {
        Self {
            passes: Vec::new(),
            max_iterations: 1,
        }
    }

    /// Create the standard pipeline for a configuration
    pub fn from_config(config: PassConfig) -> Self {
        let mut pipeline = Self::new();
        pipeline.add_pass(Box::new(TypeOptimizationPass::new(config)));
        pipeline
    }

    pub fn add_pass(&mut self, pass: Box<dyn OptimizationPass>) {
        self.passes.push(pass);
    }

    /// Repeat the pass list until nothing changes, at most `max` times
    pub fn with_max_iterations(mut self, max: usize) -> Self {
        self.max_iterations = max.max(1);
        self
    }

    /// Run all passes on a copy of `graph`
    pub fn optimize(&self, graph: &Graph, ctx: PassContext<'_>) -> Result<Optimized> {
        let mut working = graph.clone();
        let mut stats = OptimizationStats::new();

        for _ in 0..self.max_iterations {
            stats.iterations += 1;
            let mut changed = false;
            for pass in &self.passes {
                if pass.run_on_graph(&mut working, ctx, &mut stats)? {
                    stats.record_pass(pass.name());
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }

        Ok(Optimized {
            graph: working,
            stats,
        })
    }
}

impl Default for OptimizationPipeline {
    fn default() -> Self {
        Self::new()
    }
}

/// One function together with the module it belongs to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompilationUnit {
    pub module: ModuleContext,
    pub signature: FunctionSignature,
    pub graph: Graph,
}

impl CompilationUnit {
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| PassError::io_error(format!("{}: {e}", path.display())))?;
        Self::from_json(&text)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Check the module, the signature and the graph
    pub fn validate(&self) -> Result<()> {
        self.module.validate()?;
        for (i, &param) in self.signature.params.iter().enumerate() {
            self.module
                .validate_value_type(param, &format!("parameter {i}"))?;
        }
        self.graph.verify()
    }

    /// Analyze the unit without rewriting it
    pub fn analyze(&self, config: &PassConfig) -> Result<AnalysisResult> {
        self.validate()?;
        let lattice = ModuleLattice::new(&self.module);
        let ctx = PassContext::new(&self.module, &self.signature, &lattice);
        TypeAnalyzer::new(&self.graph, ctx)
            .with_branch_refinement(config.refine_branches)
            .run()
    }

    /// Run the standard pipeline over the unit's graph
    pub fn optimize(&self, config: PassConfig) -> Result<Optimized> {
        self.validate()?;
        let lattice = ModuleLattice::new(&self.module);
        let ctx = PassContext::new(&self.module, &self.signature, &lattice);
        let optimized = OptimizationPipeline::from_config(config).optimize(&self.graph, ctx)?;
        info!(
            before = self.graph.op_count(),
            after = optimized.graph.op_count(),
            "optimized compilation unit"
        );
        Ok(optimized)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{GraphBuilder, NullCheck};
    use crate::types::{FieldType, HeapType, StorageType, ValueType};

    fn unit() -> CompilationUnit {
        let mut module = ModuleContext::new();
        let point = module.add_struct(
            "Point",
            vec![FieldType::mutable(StorageType::Value(ValueType::I32))],
            None,
        );
        let any = ValueType::nullable(HeapType::Any);
        let target = ValueType::nullable(HeapType::Defined(point));

        let mut b = GraphBuilder::new();
        let p = b.parameter(0);
        let first = b.cast(p, any, target);
        let second = b.cast(first, any, target);
        let x = b.struct_get(second, point, 0, NullCheck::WithNullCheck);
        b.ret(Some(x));
        CompilationUnit {
            module,
            signature: FunctionSignature {
                params: vec![any],
                results: vec![ValueType::I32],
            },
            graph: b.finish(),
        }
    }

    #[test]
    fn test_pipeline_removes_redundant_cast() {
        let unit = unit();
        let optimized = unit.optimize(PassConfig::default()).unwrap();
        assert_eq!(optimized.graph.count_opcode("TypeCast"), 1);
        assert_eq!(optimized.stats.reductions.casts_removed, 1);
        assert_eq!(optimized.stats.pass_counts.get("type_optimization"), Some(&1));
    }

    #[test]
    fn test_unit_json_round_trip() {
        let unit = unit();
        let json = unit.to_json().unwrap();
        assert_eq!(CompilationUnit::from_json(&json).unwrap(), unit);
    }

    #[test]
    fn test_malformed_graph_is_rejected_whole() {
        let mut unit = unit();
        unit.graph.blocks[0].predecessors.push(crate::ir::BlockIndex(0));
        let err = unit.optimize(PassConfig::default()).unwrap_err();
        assert!(matches!(err, PassError::MalformedGraph { .. }));
    }

    #[test]
    fn test_dangling_operand_is_rejected_without_verification() {
        let unit = unit();
        let mut b = GraphBuilder::new();
        let p = b.parameter(0);
        b.is_null(crate::ir::OpIndex(42), ValueType::nullable(HeapType::Any));
        b.ret(Some(p));
        let graph = b.finish();
        let lattice = ModuleLattice::new(&unit.module);
        let ctx = PassContext::new(&unit.module, &unit.signature, &lattice);

        let pass = TypeOptimizationPass::new(PassConfig::default().verify(false));
        let err = pass.run(&graph, ctx).unwrap_err();
        assert!(matches!(err, PassError::MalformedGraph { .. }));
        let err = TypeAnalyzer::new(&graph, ctx).run().unwrap_err();
        assert!(matches!(err, PassError::MalformedGraph { .. }));
    }

    #[test]
    fn test_missing_block_operation_is_rejected_without_verification() {
        let mut unit = unit();
        unit.graph.blocks[0].operations.push(crate::ir::OpIndex(99));
        let lattice = ModuleLattice::new(&unit.module);
        let ctx = PassContext::new(&unit.module, &unit.signature, &lattice);

        let pass = TypeOptimizationPass::new(PassConfig::default().verify(false));
        let err = pass.run(&unit.graph, ctx).unwrap_err();
        assert!(matches!(err, PassError::MalformedGraph { .. }));
    }

    #[test]
    fn test_reducer_rejects_analysis_of_another_graph() {
        let unit = unit();
        let lattice = ModuleLattice::new(&unit.module);
        let ctx = PassContext::new(&unit.module, &unit.signature, &lattice);
        let analysis = TypeAnalyzer::new(&unit.graph, ctx).run().unwrap();

        let mut b = GraphBuilder::new();
        let p = b.parameter(0);
        b.ret(Some(p));
        let other = b.finish();
        let err = TypeReducer::new(&other, &analysis, ctx).reduce().unwrap_err();
        assert!(matches!(err, PassError::MalformedGraph { .. }));
    }

    #[test]
    fn test_iterating_pipeline_reaches_fixpoint() {
        let unit = unit();
        let lattice = ModuleLattice::new(&unit.module);
        let ctx = PassContext::new(&unit.module, &unit.signature, &lattice);
        let mut pipeline = OptimizationPipeline::from_config(PassConfig::default()).with_max_iterations(4);
        pipeline.add_pass(Box::new(DeadOperationElimination));
        let optimized = pipeline.optimize(&unit.graph, ctx).unwrap();
        assert!(optimized.stats.iterations >= 2);
        assert!(optimized.stats.iterations <= 4);
        assert_eq!(optimized.graph.count_opcode("TypeCast"), 1);
    }
}
