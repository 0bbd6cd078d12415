//! Type-based reduction
//!
//! Rebuilds a graph operation by operation using the input types recorded
//! by the analysis. Casts, checks and null tests whose outcome is decided by
//! the recorded type are replaced by constants, null checks or traps; the
//! value of a removed cast or null assertion is its operand. Only blocks
//! reachable from the entry are kept, in reverse postorder.
//!
//! A recorded type of `Top` or an uninhabited type never licenses a rewrite.

mod dce;

pub use dce::eliminate_dead_operations;

use std::fmt;

use tracing::debug;

use crate::analysis::AnalysisResult;
use crate::error::{PassError, Result};
use crate::ir::{
    BlockIndex, Graph, GraphBuilder, NullCheck, OpIndex, Opcode, Terminator, TrapId,
    TypeCheckConfig,
};
use crate::pipeline::PassContext;
use crate::types::ValueType;

/// Counts of the rewrites one reduction performed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReductionStats {
    pub casts_removed: usize,
    pub casts_to_null_checks: usize,
    pub casts_to_traps: usize,
    pub casts_narrowed: usize,
    pub checks_folded: usize,
    pub checks_narrowed: usize,
    pub null_assertions_removed: usize,
    pub null_tests_folded: usize,
    pub null_checks_removed: usize,
    pub conversions_folded: usize,
    pub dead_operations_removed: usize,
}

impl ReductionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn merge(&mut self, other: &ReductionStats) {
        self.casts_removed += other.casts_removed;
        self.casts_to_null_checks += other.casts_to_null_checks;
        self.casts_to_traps += other.casts_to_traps;
        self.casts_narrowed += other.casts_narrowed;
        self.checks_folded += other.checks_folded;
        self.checks_narrowed += other.checks_narrowed;
        self.null_assertions_removed += other.null_assertions_removed;
        self.null_tests_folded += other.null_tests_folded;
        self.null_checks_removed += other.null_checks_removed;
        self.conversions_folded += other.conversions_folded;
        self.dead_operations_removed += other.dead_operations_removed;
    }

    /// Total number of rewrites
    pub fn total(&self) -> usize {
        self.casts_removed
            + self.casts_to_null_checks
            + self.casts_to_traps
            + self.casts_narrowed
            + self.checks_folded
            + self.checks_narrowed
            + self.null_assertions_removed
            + self.null_tests_folded
            + self.null_checks_removed
            + self.conversions_folded
            + self.dead_operations_removed
    }
}

impl fmt::Display for ReductionStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "casts removed:           {}", self.casts_removed)?;
        writeln!(f, "casts to null checks:    {}", self.casts_to_null_checks)?;
        writeln!(f, "casts to traps:          {}", self.casts_to_traps)?;
        writeln!(f, "casts narrowed:          {}", self.casts_narrowed)?;
        writeln!(f, "checks folded:           {}", self.checks_folded)?;
        writeln!(f, "checks narrowed:         {}", self.checks_narrowed)?;
        writeln!(f, "null assertions removed: {}", self.null_assertions_removed)?;
        writeln!(f, "null tests folded:       {}", self.null_tests_folded)?;
        writeln!(f, "null checks removed:     {}", self.null_checks_removed)?;
        writeln!(f, "conversions folded:      {}", self.conversions_folded)?;
        write!(f, "dead operations removed: {}", self.dead_operations_removed)
    }
}

/// Rewrites one graph using an analysis of that same graph
pub struct TypeReducer<'a> {
    graph: &'a Graph,
    analysis: &'a AnalysisResult,
    ctx: PassContext<'a>,
    fold_conversions: bool,
    builder: GraphBuilder,
    op_map: Vec<Option<OpIndex>>,
    block_map: Vec<Option<BlockIndex>>,
    stats: ReductionStats,
}

impl<'a> TypeReducer<'a> {
    pub fn new(graph: &'a Graph, analysis: &'a AnalysisResult, ctx: PassContext<'a>) -> Self {
        Self {
            graph,
            analysis,
            ctx,
            fold_conversions: true,
            builder: GraphBuilder::with_explicit_predecessors(),
            op_map: vec![None; graph.op_count()],
            block_map: vec![None; graph.block_count()],
            stats: ReductionStats::new(),
        }
    }

    pub fn with_conversion_folding(mut self, enable: bool) -> Self {
        self.fold_conversions = enable;
        self
    }

    pub fn reduce(mut self) -> Result<(Graph, ReductionStats)> {
        let graph = self.graph;
        let analysis = self.analysis;
        graph.verify()?;
        if analysis.input_types.op_count() != graph.op_count() {
            return Err(PassError::malformed(format!(
                "analysis covers {} operations but the graph has {}",
                analysis.input_types.op_count(),
                graph.op_count()
            )));
        }
        let order = &analysis.order;
        for (i, &block) in order.blocks().iter().enumerate() {
            let new_block = if i == 0 {
                self.builder.current_block()
            } else {
                self.builder.new_block()
            };
            self.block_map[block.index()] = Some(new_block);
        }

        let mut phis: Vec<(OpIndex, OpIndex)> = Vec::new();
        for &block in order.blocks() {
            let new_block = self.map_block(block)?;
            self.builder.bind(new_block);
            let predecessors = graph
                .block(block)
                .predecessors
                .iter()
                .filter(|&&pred| order.is_reachable(pred))
                .map(|&pred| self.map_block(pred))
                .collect::<Result<Vec<_>>>()?;
            self.builder.set_predecessors(new_block, predecessors);

            for &op in &graph.block(block).operations {
                let opcode = &graph.op(op).opcode;
                let new_op = if opcode.is_phi() {
                    let phi = self.builder.phi(Vec::new());
                    phis.push((op, phi));
                    phi
                } else {
                    self.reduce_operation(op, opcode)?
                };
                self.op_map[op.index()] = Some(new_op);
            }

            let terminator = match &graph.block(block).terminator {
                Terminator::Goto(target) => Terminator::Goto(self.map_block(*target)?),
                Terminator::Branch {
                    condition,
                    if_true,
                    if_false,
                } => Terminator::Branch {
                    condition: self.map_value(None, *condition)?,
                    if_true: self.map_block(*if_true)?,
                    if_false: self.map_block(*if_false)?,
                },
                Terminator::Return(value) => {
                    Terminator::Return(value.map(|v| self.map_value(None, v)).transpose()?)
                }
                Terminator::Unreachable => Terminator::Unreachable,
            };
            self.builder.terminate(terminator);
        }

        for (old_phi, new_phi) in phis {
            let Opcode::Phi { inputs } = &graph.op(old_phi).opcode else {
                continue;
            };
            let block = graph.op(old_phi).block;
            let mut new_inputs = Vec::with_capacity(inputs.len());
            for (&input, &pred) in inputs.iter().zip(&graph.block(block).predecessors) {
                if order.is_reachable(pred) {
                    new_inputs.push(self.map_value(Some(old_phi), input)?);
                }
            }
            self.builder.set_phi_inputs(new_phi, new_inputs);
        }

        debug!(rewrites = self.stats.total(), "type reduction finished");
        Ok((self.builder.finish(), self.stats))
    }

    fn map_block(&self, block: BlockIndex) -> Result<BlockIndex> {
        self.block_map
            .get(block.index())
            .copied()
            .flatten()
            .ok_or_else(|| PassError::malformed(format!("edge into unreachable block {block}")))
    }

    fn map_value(&self, user: Option<OpIndex>, value: OpIndex) -> Result<OpIndex> {
        match self.op_map.get(value.index()).copied().flatten() {
            Some(mapped) => Ok(mapped),
            None => Err(match user {
                Some(op) => PassError::undefined_value(op, value),
                None => PassError::malformed(format!("terminator uses undefined value {value}")),
            }),
        }
    }

    /// Recorded input type, or `None` when it carries no usable knowledge
    fn usable_input_type(&self, op: OpIndex) -> Result<Option<ValueType>> {
        let ty = self.analysis.input_types.get(op)?;
        if ty.is_top() || ty.is_uninhabited() || !ty.is_reference() {
            Ok(None)
        } else {
            Ok(Some(ty))
        }
    }

    fn copy_operation(&mut self, op: OpIndex, opcode: &Opcode) -> Result<OpIndex> {
        let mapped = opcode.try_map_inputs(|value| self.map_value(Some(op), value))?;
        Ok(self.builder.emit(mapped))
    }

    fn reduce_operation(&mut self, op: OpIndex, opcode: &Opcode) -> Result<OpIndex> {
        match opcode {
            Opcode::TypeCast { object, config } => self.reduce_cast(op, *object, *config),
            Opcode::TypeCheck { object, config } => self.reduce_check(op, *object, *config),
            Opcode::AssertNotNull { object, .. } => {
                match self.usable_input_type(op)? {
                    Some(ty) if ty.is_non_nullable() => {
                        debug!(%op, "null assertion removed");
                        self.stats.null_assertions_removed += 1;
                        self.map_value(Some(op), *object)
                    }
                    _ => self.copy_operation(op, opcode),
                }
            }
            Opcode::IsNull { .. } => match self.usable_input_type(op)? {
                Some(ty) if ty.is_non_nullable() => {
                    self.stats.null_tests_folded += 1;
                    Ok(self.builder.word32_constant(0))
                }
                Some(ty) if self.ctx.oracle.null_sentinel(ty) == ty => {
                    self.stats.null_tests_folded += 1;
                    Ok(self.builder.word32_constant(1))
                }
                _ => self.copy_operation(op, opcode),
            },
            Opcode::StructGet {
                object,
                type_index,
                field_index,
                is_signed,
                null_check: NullCheck::WithNullCheck,
            } if self.known_non_null(op)? => {
                self.stats.null_checks_removed += 1;
                let object = self.map_value(Some(op), *object)?;
                Ok(self.builder.emit(Opcode::StructGet {
                    object,
                    type_index: *type_index,
                    field_index: *field_index,
                    is_signed: *is_signed,
                    null_check: NullCheck::WithoutNullCheck,
                }))
            }
            Opcode::StructSet {
                object,
                value,
                type_index,
                field_index,
                null_check: NullCheck::WithNullCheck,
            } if self.known_non_null(op)? => {
                self.stats.null_checks_removed += 1;
                let object = self.map_value(Some(op), *object)?;
                let value = self.map_value(Some(op), *value)?;
                Ok(self.builder.struct_set(
                    object,
                    value,
                    *type_index,
                    *field_index,
                    NullCheck::WithoutNullCheck,
                ))
            }
            Opcode::ArrayLength {
                array,
                null_check: NullCheck::WithNullCheck,
            } if self.known_non_null(op)? => {
                self.stats.null_checks_removed += 1;
                let array = self.map_value(Some(op), *array)?;
                Ok(self.builder.array_length(array, NullCheck::WithoutNullCheck))
            }
            Opcode::AnyConvertExtern { object } if self.fold_conversions => {
                let mapped = self.map_value(Some(op), *object)?;
                match self.builder.get(mapped).map(|operation| &operation.opcode) {
                    Some(Opcode::ExternConvertAny { object: inner }) => {
                        self.stats.conversions_folded += 1;
                        Ok(*inner)
                    }
                    _ => Ok(self.builder.any_convert_extern(mapped)),
                }
            }
            Opcode::ExternConvertAny { object } if self.fold_conversions => {
                let mapped = self.map_value(Some(op), *object)?;
                match self.builder.get(mapped).map(|operation| &operation.opcode) {
                    Some(Opcode::AnyConvertExtern { object: inner }) => {
                        self.stats.conversions_folded += 1;
                        Ok(*inner)
                    }
                    _ => Ok(self.builder.extern_convert_any(mapped)),
                }
            }
            _ => self.copy_operation(op, opcode),
        }
    }

    fn known_non_null(&self, op: OpIndex) -> Result<bool> {
        Ok(self
            .usable_input_type(op)?
            .is_some_and(ValueType::is_non_nullable))
    }

    /// The target can be related to `ty` although their heaps look unrelated
    fn convertible(&self, ty: ValueType, to: ValueType) -> bool {
        self.ctx.oracle.is_implicitly_convertible(ty, to)
    }

    /// Source type narrowed by what is known, unless that would be uninhabited
    fn narrowed_from(&self, ty: ValueType, from: ValueType) -> ValueType {
        let narrowed = self.ctx.oracle.intersection(ty, from);
        if narrowed.is_uninhabited() || narrowed.is_top() {
            from
        } else {
            narrowed
        }
    }

    fn reduce_cast(&mut self, op: OpIndex, object: OpIndex, config: TypeCheckConfig) -> Result<OpIndex> {
        let Some(ty) = self.usable_input_type(op)? else {
            return self.copy_operation(op, &Opcode::TypeCast { object, config });
        };
        let (Some(heap), Some(to_heap)) = (ty.heap_type(), config.to.heap_type()) else {
            return self.copy_operation(op, &Opcode::TypeCast { object, config });
        };
        let oracle = self.ctx.oracle;
        let to_nullable = config.to.is_nullable();
        let mapped = self.map_value(Some(op), object)?;

        if oracle.is_heap_subtype(heap, to_heap) {
            if to_nullable || ty.is_non_nullable() {
                debug!(%op, %ty, to = %config.to, "cast removed");
                self.stats.casts_removed += 1;
                return Ok(mapped);
            }
            debug!(%op, %ty, to = %config.to, "cast reduced to null check");
            self.stats.casts_to_null_checks += 1;
            return Ok(self.builder.assert_not_null(mapped, ty, TrapId::IllegalCast));
        }

        if oracle.heap_types_unrelated(heap, to_heap) && !self.convertible(ty, config.to) {
            debug!(%op, %ty, to = %config.to, "cast always fails for non-null input");
            self.stats.casts_to_traps += 1;
            let passes = if ty.is_nullable() && to_nullable {
                self.builder.is_null(mapped, ty)
            } else {
                self.builder.word32_constant(0)
            };
            self.builder.trap_if_not(passes, TrapId::IllegalCast);
            return Ok(mapped);
        }

        let from = self.narrowed_from(ty, config.from);
        if from != config.from {
            self.stats.casts_narrowed += 1;
        }
        Ok(self.builder.cast(mapped, from, config.to))
    }

    fn reduce_check(&mut self, op: OpIndex, object: OpIndex, config: TypeCheckConfig) -> Result<OpIndex> {
        let Some(ty) = self.usable_input_type(op)? else {
            return self.copy_operation(op, &Opcode::TypeCheck { object, config });
        };
        let (Some(heap), Some(to_heap)) = (ty.heap_type(), config.to.heap_type()) else {
            return self.copy_operation(op, &Opcode::TypeCheck { object, config });
        };
        let oracle = self.ctx.oracle;
        let to_nullable = config.to.is_nullable();
        let mapped = self.map_value(Some(op), object)?;

        if oracle.is_heap_subtype(heap, to_heap) {
            self.stats.checks_folded += 1;
            if to_nullable || ty.is_non_nullable() {
                return Ok(self.builder.word32_constant(1));
            }
            let is_null = self.builder.is_null(mapped, ty);
            let zero = self.builder.word32_constant(0);
            return Ok(self.builder.word32_equal(is_null, zero));
        }

        if !self.convertible(ty, config.to) {
            if oracle.heap_types_unrelated(heap, to_heap) {
                self.stats.checks_folded += 1;
                if to_nullable && ty.is_nullable() {
                    return Ok(self.builder.is_null(mapped, ty));
                }
                return Ok(self.builder.word32_constant(0));
            }
            if oracle.intersection(ty, config.to).is_uninhabited() {
                self.stats.checks_folded += 1;
                return Ok(self.builder.word32_constant(0));
            }
        }

        let from = self.narrowed_from(ty, config.from);
        if from != config.from {
            self.stats.checks_narrowed += 1;
        }
        Ok(self.builder.check(mapped, from, config.to))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::TypeAnalyzer;
    use crate::types::{
        FieldType, FunctionSignature, HeapType, ModuleContext, ModuleLattice, StorageType,
        TypeIndex,
    };

    struct Fixture {
        module: ModuleContext,
        dog: TypeIndex,
        cat: TypeIndex,
    }

    fn fixture() -> Fixture {
        let mut module = ModuleContext::new();
        let field = FieldType::mutable(StorageType::Value(ValueType::I32));
        let animal = module.add_struct("Animal", vec![field], None);
        let dog = module.add_struct("Dog", vec![field], Some(animal));
        let cat = module.add_struct("Cat", vec![field], Some(animal));
        Fixture { module, dog, cat }
    }

    fn reduce(f: &Fixture, params: Vec<ValueType>, graph: &Graph) -> (Graph, ReductionStats) {
        let signature = FunctionSignature {
            params,
            results: vec![],
        };
        let lattice = ModuleLattice::new(&f.module);
        let ctx = PassContext::new(&f.module, &signature, &lattice);
        let analysis = TypeAnalyzer::new(graph, ctx).run().unwrap();
        TypeReducer::new(graph, &analysis, ctx).reduce().unwrap()
    }

    #[test]
    fn test_cast_to_supertype_is_removed() {
        let f = fixture();
        let dog = ValueType::non_null(HeapType::Defined(f.dog));
        let mut b = GraphBuilder::new();
        let p = b.parameter(0);
        let cast = b.cast(p, dog, ValueType::nullable(HeapType::Struct));
        b.ret(Some(cast));
        let (graph, stats) = reduce(&f, vec![dog], &b.finish());
        assert_eq!(stats.casts_removed, 1);
        assert_eq!(graph.count_opcode("TypeCast"), 0);
        assert_eq!(graph.block(BlockIndex::ENTRY).terminator, Terminator::Return(Some(OpIndex(0))));
    }

    #[test]
    fn test_nullable_input_becomes_null_check() {
        let f = fixture();
        let dog = ValueType::nullable(HeapType::Defined(f.dog));
        let mut b = GraphBuilder::new();
        let p = b.parameter(0);
        let cast = b.cast(p, dog, dog.as_non_null());
        b.ret(Some(cast));
        let (graph, stats) = reduce(&f, vec![dog], &b.finish());
        assert_eq!(stats.casts_to_null_checks, 1);
        assert_eq!(graph.count_opcode("AssertNotNull"), 1);
        assert!(matches!(
            graph.op(OpIndex(1)).opcode,
            Opcode::AssertNotNull {
                trap: TrapId::IllegalCast,
                ..
            }
        ));
    }

    #[test]
    fn test_unrelated_nullable_cast_traps_unless_null() {
        let f = fixture();
        let cat = ValueType::nullable(HeapType::Defined(f.cat));
        let dog = ValueType::nullable(HeapType::Defined(f.dog));
        let mut b = GraphBuilder::new();
        let p = b.parameter(0);
        let cast = b.cast(p, cat, dog);
        b.ret(Some(cast));
        let (graph, stats) = reduce(&f, vec![cat], &b.finish());
        assert_eq!(stats.casts_to_traps, 1);
        assert_eq!(graph.count_opcode("IsNull"), 1);
        assert!(matches!(
            graph.op(OpIndex(2)).opcode,
            Opcode::TrapIf {
                negated: true,
                trap: TrapId::IllegalCast,
                ..
            }
        ));
    }

    #[test]
    fn test_check_against_nullable_supertype_folds_to_one() {
        let f = fixture();
        let dog = ValueType::nullable(HeapType::Defined(f.dog));
        let mut b = GraphBuilder::new();
        let p = b.parameter(0);
        let check = b.check(p, dog, ValueType::nullable(HeapType::Eq));
        b.ret(Some(check));
        let (graph, stats) = reduce(&f, vec![dog], &b.finish());
        assert_eq!(stats.checks_folded, 1);
        assert_eq!(graph.op(OpIndex(1)).opcode, Opcode::Word32Constant { value: 1 });
    }

    #[test]
    fn test_check_of_nullable_against_non_null_target_tests_null() {
        let f = fixture();
        let dog = ValueType::nullable(HeapType::Defined(f.dog));
        let mut b = GraphBuilder::new();
        let p = b.parameter(0);
        let check = b.check(p, dog, dog.as_non_null());
        b.ret(Some(check));
        let (graph, _) = reduce(&f, vec![dog], &b.finish());
        assert_eq!(graph.count_opcode("IsNull"), 1);
        assert_eq!(graph.count_opcode("Word32Equal"), 1);
        assert_eq!(graph.count_opcode("TypeCheck"), 0);
    }

    #[test]
    fn test_undecided_cast_narrows_source() {
        let f = fixture();
        let any_struct = ValueType::nullable(HeapType::Struct);
        let dog = ValueType::non_null(HeapType::Defined(f.dog));
        let mut b = GraphBuilder::new();
        let p = b.parameter(0);
        let cast = b.cast(p, ValueType::nullable(HeapType::Any), dog);
        b.ret(Some(cast));
        let (graph, stats) = reduce(&f, vec![any_struct], &b.finish());
        assert_eq!(stats.casts_narrowed, 1);
        assert_eq!(
            graph.op(OpIndex(1)).opcode,
            Opcode::TypeCast {
                object: OpIndex(0),
                config: TypeCheckConfig {
                    from: any_struct,
                    to: dog
                }
            }
        );
    }

    #[test]
    fn test_is_null_of_null_constant_folds_to_one() {
        let f = fixture();
        let mut b = GraphBuilder::new();
        let null = b.null(ValueType::nullable(HeapType::Defined(f.dog)));
        let test = b.is_null(null, ValueType::nullable(HeapType::Any));
        b.ret(Some(test));
        let (graph, stats) = reduce(&f, vec![], &b.finish());
        assert_eq!(stats.null_tests_folded, 1);
        assert_eq!(graph.op(OpIndex(1)).opcode, Opcode::Word32Constant { value: 1 });
    }

    #[test]
    fn test_top_input_changes_nothing() {
        let f = fixture();
        let i32_param = ValueType::I32;
        let mut b = GraphBuilder::new();
        let p = b.parameter(0);
        let null = b.null(ValueType::nullable(HeapType::Any));
        let zero = b.word32_constant(0);
        let header = b.new_block();
        let exit = b.new_block();
        b.goto(header);
        b.bind(header);
        let phi = b.phi(vec![null]);
        let assert = b.assert_not_null(phi, ValueType::nullable(HeapType::Any), TrapId::NullDereference);
        b.branch(p, header, exit);
        b.add_phi_input(phi, assert);
        b.bind(exit);
        b.ret(Some(zero));
        let original = b.finish();
        let (graph, stats) = reduce(&f, vec![i32_param], &original);
        assert_eq!(stats.total(), 0);
        assert_eq!(graph.count_opcode("AssertNotNull"), 1);
    }
}
