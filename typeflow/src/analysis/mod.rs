//! Forward type-flow analysis
//!
//! One pass over the blocks in reverse postorder. Each block starts from the
//! merge of the snapshots on its incoming edges, then every operation either
//! introduces a value with a known type or refines what is known about an
//! existing one. The type of the operand an operation consumes is recorded
//! before the operation refines it; the reducer reads those records.
//!
//! Loops are not iterated: a loop header only merges its forward edges, and
//! loop phis are unknown, so knowledge established inside a loop body never
//! reaches the header.

pub mod snapshot;

use tracing::{debug, trace};

use crate::error::{PassError, Result};
use crate::ir::{BlockIndex, BlockOrder, Dominators, Graph, NullCheck, OpIndex, Opcode, Terminator};
use crate::pipeline::PassContext;
use crate::types::{HeapType, ValueType};

pub use snapshot::{Snapshot, SnapshotTable};

/// Type of the value each type-dependent operation consumes, just before it runs
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InputTypeMap {
    types: Vec<Option<ValueType>>,
}

impl InputTypeMap {
    pub fn new(op_count: usize) -> Self {
        Self {
            types: vec![None; op_count],
        }
    }

    /// Recorded input type of `op`
    ///
    /// Asking for an operation the analysis never recorded is an invariant
    /// violation.
    pub fn get(&self, op: OpIndex) -> Result<ValueType> {
        self.types
            .get(op.index())
            .copied()
            .flatten()
            .ok_or(PassError::unvisited(op))
    }

    /// Number of operations of the analyzed graph
    pub fn op_count(&self) -> usize {
        self.types.len()
    }

    pub fn contains(&self, op: OpIndex) -> bool {
        self.types.get(op.index()).is_some_and(Option::is_some)
    }

    fn record(&mut self, op: OpIndex, ty: ValueType) {
        if let Some(slot) = self.types.get_mut(op.index()) {
            *slot = Some(ty);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (OpIndex, ValueType)> + '_ {
        self.types
            .iter()
            .enumerate()
            .filter_map(|(i, ty)| ty.map(|ty| (OpIndex(i as u32), ty)))
    }

    pub fn len(&self) -> usize {
        self.types.iter().filter(|ty| ty.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Everything the analysis hands to the reducer
#[derive(Debug, Clone)]
pub struct AnalysisResult {
    pub input_types: InputTypeMap,
    pub order: BlockOrder,
    pub loop_headers: Vec<BlockIndex>,
    /// Blocks in the traversal whose every incoming edge was proven dead
    pub unreachable_blocks: Vec<BlockIndex>,
}

impl AnalysisResult {
    pub fn is_loop_header(&self, block: BlockIndex) -> bool {
        self.loop_headers.contains(&block)
    }

    /// Reached by the traversal and not proven dead
    pub fn is_reachable(&self, block: BlockIndex) -> bool {
        self.order.is_reachable(block) && !self.unreachable_blocks.contains(&block)
    }
}

/// Snapshot flowing over one incoming edge
#[derive(Debug, Clone, Copy)]
struct Edge {
    snapshot: Snapshot,
    reachable: bool,
}

/// Forward type analyzer for one graph
pub struct TypeAnalyzer<'a> {
    graph: &'a Graph,
    ctx: PassContext<'a>,
    refine_branches: bool,
    order: BlockOrder,
    dominators: Dominators,
    table: SnapshotTable<OpIndex, ValueType>,
    exit_snapshots: Vec<Option<Snapshot>>,
    block_reachable: Vec<bool>,
    aliases: Vec<Option<OpIndex>>,
    input_types: InputTypeMap,
    loop_headers: Vec<BlockIndex>,
    unreachable_blocks: Vec<BlockIndex>,
}

impl<'a> TypeAnalyzer<'a> {
    pub fn new(graph: &'a Graph, ctx: PassContext<'a>) -> Self {
        let order = BlockOrder::compute(graph);
        let dominators = Dominators::compute(graph, &order);
        Self {
            graph,
            ctx,
            refine_branches: true,
            order,
            dominators,
            table: SnapshotTable::new(),
            exit_snapshots: vec![None; graph.block_count()],
            block_reachable: vec![false; graph.block_count()],
            aliases: vec![None; graph.op_count()],
            input_types: InputTypeMap::new(graph.op_count()),
            loop_headers: Vec::new(),
            unreachable_blocks: Vec::new(),
        }
    }

    /// Enable or disable refinement along branch edges
    pub fn with_branch_refinement(mut self, enable: bool) -> Self {
        self.refine_branches = enable;
        self
    }

    /// Analyze the graph; a malformed graph is rejected before any block is visited
    pub fn run(mut self) -> Result<AnalysisResult> {
        self.graph.verify()?;
        let blocks = self.order.blocks().to_vec();
        for block in blocks {
            self.visit_block(block)?;
        }
        debug!(
            blocks = self.order.len(),
            records = self.input_types.len(),
            loops = self.loop_headers.len(),
            "type analysis finished"
        );
        Ok(AnalysisResult {
            input_types: self.input_types,
            order: self.order,
            loop_headers: self.loop_headers,
            unreachable_blocks: self.unreachable_blocks,
        })
    }

    fn visit_block(&mut self, block: BlockIndex) -> Result<()> {
        let graph = self.graph;
        let predecessors = &graph.block(block).predecessors;

        let mut edges: Vec<Option<Edge>> = Vec::with_capacity(predecessors.len());
        for &pred in predecessors {
            edges.push(self.edge_into(pred, block)?);
        }
        let is_loop_header = self.order.is_loop_header(graph, block);
        // A back edge from outside the header's dominance region can enter
        // the loop without passing any forward predecessor.
        let irreducible = is_loop_header
            && predecessors
                .iter()
                .filter(|&&pred| self.order.is_back_edge(pred, block))
                .any(|&pred| !self.dominators.dominates(block, pred));

        let any_reachable = edges.iter().flatten().any(|edge| edge.reachable);
        let reachable = block == BlockIndex::ENTRY || any_reachable || irreducible;
        self.block_reachable[block.index()] = reachable;
        if !reachable {
            self.unreachable_blocks.push(block);
        }
        // Dead edges only count when no live edge exists.
        let counts = |edge: &Edge| edge.reachable || !any_reachable;

        if is_loop_header {
            self.loop_headers.push(block);
        }
        if irreducible {
            debug!(%block, "irreducible loop header, starting without knowledge");
            self.table.start_new_snapshot(&[], |_, _| ValueType::Top);
        } else {
            self.start_block_snapshot(&edges, counts);
        }
        debug!(%block, reachable, loop_header = is_loop_header, "visiting block");

        for &op in &graph.block(block).operations {
            let opcode = &graph.op(op).opcode;
            match opcode {
                // Loop phis stay unknown: their back-edge inputs are not analyzed yet.
                Opcode::Phi { .. } if is_loop_header => {}
                Opcode::Phi { inputs } => {
                    let mut merged: Option<ValueType> = None;
                    for (input, edge) in inputs.iter().zip(&edges) {
                        let Some(edge) = edge.filter(|edge| counts(edge)) else {
                            continue;
                        };
                        let ty = self.table.get_in(edge.snapshot, self.resolve(*input));
                        merged = Some(match merged {
                            None => ty,
                            Some(acc) => self.ctx.oracle.union(acc, ty),
                        });
                    }
                    let ty = merged.unwrap_or_default();
                    trace!(%op, %ty, "phi");
                    self.table.set(op, ty);
                }
                _ => self.process_operation(op, opcode)?,
            }
        }

        self.exit_snapshots[block.index()] = Some(self.table.seal());
        Ok(())
    }

    fn start_block_snapshot(&mut self, edges: &[Option<Edge>], counts: impl Fn(&Edge) -> bool) {
        let parents: Vec<Snapshot> = edges
            .iter()
            .flatten()
            .filter(|&edge| counts(edge))
            .map(|edge| edge.snapshot)
            .collect();
        let oracle = self.ctx.oracle;
        self.table.start_new_snapshot(&parents, |_, values| {
            values
                .iter()
                .copied()
                .reduce(|a, b| oracle.union(a, b))
                .unwrap_or_default()
        });
    }

    /// Snapshot on the edge `pred -> block`, refined by the branch condition
    ///
    /// `None` when `pred` has not been visited (a back edge).
    fn edge_into(&mut self, pred: BlockIndex, block: BlockIndex) -> Result<Option<Edge>> {
        let Some(exit) = self.exit_snapshots.get(pred.index()).copied().flatten() else {
            return Ok(None);
        };
        let pred_reachable = self.block_reachable[pred.index()];
        let unrefined = Edge {
            snapshot: exit,
            reachable: pred_reachable,
        };
        if !self.refine_branches {
            return Ok(Some(unrefined));
        }
        let Terminator::Branch {
            condition,
            if_true,
            if_false,
        } = self.graph.block(pred).terminator
        else {
            return Ok(Some(unrefined));
        };
        if if_true == if_false {
            return Ok(Some(unrefined));
        }
        let on_true = block == if_true;
        let Some(condition_op) = self.graph.get(condition) else {
            return Err(PassError::malformed(format!(
                "branch of {pred} uses undefined value {condition}"
            )));
        };

        let refinement = match condition_op.opcode {
            Opcode::TypeCheck { object, config } if on_true => Some((object, config.to)),
            Opcode::IsNull { object, ty } if on_true => {
                // The operand's own hierarchy decides the sentinel, not the test's annotation
                let known = self.table.get_in(exit, self.resolve(object));
                let hierarchy = if known.is_reference() { known } else { ty };
                Some((object, self.ctx.oracle.null_sentinel(hierarchy)))
            }
            Opcode::IsNull { object, .. } => {
                let object = self.resolve(object);
                Some((object, self.table.get_in(exit, object).as_non_null()))
            }
            _ => None,
        };
        let Some((object, ty)) = refinement else {
            return Ok(Some(unrefined));
        };

        self.table.start_new_snapshot(&[exit], |_, values| values[0]);
        self.refine(object, ty);
        let refined = self.table.get(self.resolve(object));
        let snapshot = self.table.seal();
        let reachable = pred_reachable && !refined.is_uninhabited();
        trace!(%pred, %block, %object, %refined, reachable, "edge refinement");
        Ok(Some(Edge {
            snapshot,
            reachable,
        }))
    }

    fn process_operation(&mut self, op: OpIndex, opcode: &Opcode) -> Result<()> {
        match opcode {
            Opcode::Parameter { index } => {
                let Some(&ty) = self.ctx.signature.params.get(*index as usize) else {
                    return Err(PassError::malformed(format!(
                        "{op} reads missing parameter {index}"
                    )));
                };
                self.introduce(op, ty);
            }
            Opcode::GlobalGet { global } => {
                let Some(ty) = self.ctx.module.global_type(*global) else {
                    return Err(PassError::malformed(format!("{op} reads missing global {global}")));
                };
                self.introduce(op, ty);
            }
            Opcode::RefFunc { function } => {
                let Some(signature) = self.ctx.module.function_signature(*function) else {
                    return Err(PassError::malformed(format!(
                        "{op} references missing function {function}"
                    )));
                };
                self.introduce(op, ValueType::non_null(HeapType::Exact(signature)));
            }
            Opcode::AllocateStruct { type_index, .. } | Opcode::AllocateArray { type_index, .. } => {
                self.introduce(op, ValueType::non_null(HeapType::Exact(*type_index)));
            }
            Opcode::Null { ty } => {
                let sentinel = self.ctx.oracle.null_sentinel(*ty);
                self.introduce(op, sentinel);
            }
            Opcode::IsNull { object, .. } | Opcode::TypeCheck { object, .. } => {
                self.record(op, *object);
            }
            Opcode::AssertNotNull { object, .. } => {
                self.record(op, *object);
                self.refine_not_null(*object);
                self.alias(op, *object);
            }
            Opcode::TypeCast { object, config } => {
                self.record(op, *object);
                self.refine(*object, config.to);
                self.alias(op, *object);
            }
            Opcode::StructGet {
                object,
                type_index,
                field_index,
                null_check,
                ..
            } => {
                self.record(op, *object);
                if *null_check == NullCheck::WithNullCheck {
                    self.refine_not_null(*object);
                }
                let Some(field) = self.ctx.module.struct_field(*type_index, *field_index) else {
                    return Err(PassError::malformed(format!(
                        "{op} reads missing field {type_index}.{field_index}"
                    )));
                };
                self.introduce(op, field.storage.unpacked());
            }
            Opcode::StructSet {
                object, null_check, ..
            } => {
                self.record(op, *object);
                if *null_check == NullCheck::WithNullCheck {
                    self.refine_not_null(*object);
                }
            }
            Opcode::ArrayLength { array, null_check } => {
                self.record(op, *array);
                if *null_check == NullCheck::WithNullCheck {
                    self.refine_not_null(*array);
                }
            }
            Opcode::ExternConvertAny { object } => {
                let heap = HeapType::Extern;
                let ty = self.converted(*object, heap);
                self.introduce(op, ty);
            }
            Opcode::AnyConvertExtern { object } => {
                let heap = HeapType::Any;
                let ty = self.converted(*object, heap);
                self.introduce(op, ty);
            }
            Opcode::Word32Constant { .. } | Opcode::Word32Equal { .. } | Opcode::TrapIf { .. } => {}
            Opcode::Phi { .. } => {}
        }
        Ok(())
    }

    /// Follow casts and null assertions back to the value they forward
    fn resolve(&self, value: OpIndex) -> OpIndex {
        self.aliases
            .get(value.index())
            .copied()
            .flatten()
            .unwrap_or(value)
    }

    fn alias(&mut self, op: OpIndex, object: OpIndex) {
        let target = self.resolve(object);
        if let Some(slot) = self.aliases.get_mut(op.index()) {
            *slot = Some(target);
        }
    }

    fn record(&mut self, op: OpIndex, object: OpIndex) {
        let ty = self.table.get(self.resolve(object));
        trace!(%op, %ty, "input type");
        self.input_types.record(op, ty);
    }

    /// Knowledge of a freshly produced value; integers are not tracked
    fn introduce(&mut self, op: OpIndex, ty: ValueType) {
        if ty.is_reference() {
            self.table.set(op, ty);
        }
    }

    /// Result of a boundary conversion keeps the nullability of its input
    fn converted(&self, object: OpIndex, heap: HeapType) -> ValueType {
        if self.table.get(self.resolve(object)).is_non_nullable() {
            ValueType::non_null(heap)
        } else {
            ValueType::nullable(heap)
        }
    }

    /// Narrow `object` to what it is known to satisfy; returns the prior type
    fn refine(&mut self, object: OpIndex, ty: ValueType) -> ValueType {
        let object = self.resolve(object);
        let previous = self.table.get(object);
        if previous.is_known() && self.ctx.oracle.is_implicitly_convertible(previous, ty) {
            return previous;
        }
        let refined = if previous.is_top() {
            ty
        } else {
            self.ctx.oracle.intersection(previous, ty)
        };
        trace!(%object, %previous, %refined, "refine");
        self.table.set(object, refined)
    }

    fn refine_not_null(&mut self, object: OpIndex) -> ValueType {
        let object = self.resolve(object);
        let previous = self.table.get(object);
        self.table.set(object, previous.as_non_null())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::GraphBuilder;
    use crate::types::{FieldType, FunctionSignature, ModuleContext, ModuleLattice, StorageType, TypeIndex};

    struct Fixture {
        module: ModuleContext,
        animal: TypeIndex,
        dog: TypeIndex,
    }

    fn fixture() -> Fixture {
        let mut module = ModuleContext::new();
        let i32_field = FieldType::mutable(StorageType::Value(ValueType::I32));
        let animal = module.add_struct("Animal", vec![i32_field], None);
        let dog = module.add_struct("Dog", vec![i32_field], Some(animal));
        Fixture { module, animal, dog }
    }

    fn analyze(fixture: &Fixture, params: Vec<ValueType>, graph: &Graph) -> AnalysisResult {
        let signature = FunctionSignature {
            params,
            results: vec![],
        };
        let lattice = ModuleLattice::new(&fixture.module);
        let ctx = PassContext::new(&fixture.module, &signature, &lattice);
        TypeAnalyzer::new(graph, ctx).run().unwrap()
    }

    #[test]
    fn test_cast_refines_later_uses() {
        let f = fixture();
        let any = ValueType::nullable(HeapType::Any);
        let dog = ValueType::non_null(HeapType::Defined(f.dog));
        let mut b = GraphBuilder::new();
        let p = b.parameter(0);
        let cast = b.cast(p, any, dog);
        let get = b.struct_get(p, f.dog, 0, NullCheck::WithNullCheck);
        let get_through_alias = b.struct_get(cast, f.dog, 0, NullCheck::WithNullCheck);
        b.ret(None);
        let graph = b.finish();

        let result = analyze(&f, vec![any], &graph);
        assert_eq!(result.input_types.get(cast).unwrap(), any);
        assert_eq!(result.input_types.get(get).unwrap(), dog);
        assert_eq!(result.input_types.get(get_through_alias).unwrap(), dog);
    }

    #[test]
    fn test_allocation_is_exact_and_non_null() {
        let f = fixture();
        let mut b = GraphBuilder::new();
        let zero = b.word32_constant(0);
        let obj = b.allocate_struct(f.dog, vec![zero]);
        let check = b.is_null(obj, ValueType::nullable(HeapType::Any));
        b.ret(None);
        let graph = b.finish();

        let result = analyze(&f, vec![], &graph);
        assert_eq!(
            result.input_types.get(check).unwrap(),
            ValueType::non_null(HeapType::Exact(f.dog))
        );
    }

    #[test]
    fn test_unvisited_operation_is_an_error() {
        let f = fixture();
        let mut b = GraphBuilder::new();
        let dead = b.new_block();
        b.ret(None);
        b.bind(dead);
        let p = b.null(ValueType::nullable(HeapType::Any));
        let check = b.is_null(p, ValueType::nullable(HeapType::Any));
        b.ret(None);
        let graph = b.finish();

        let result = analyze(&f, vec![], &graph);
        assert!(matches!(
            result.input_types.get(check),
            Err(PassError::UnvisitedOperation { .. })
        ));
    }

    #[test]
    fn test_branch_on_check_refines_true_edge_only() {
        let f = fixture();
        let any = ValueType::nullable(HeapType::Any);
        let animal = ValueType::non_null(HeapType::Defined(f.animal));
        let mut b = GraphBuilder::new();
        let yes = b.new_block();
        let no = b.new_block();
        let p = b.parameter(0);
        let check = b.check(p, any, animal);
        b.branch(check, yes, no);
        b.bind(yes);
        let in_yes = b.is_null(p, any);
        b.ret(None);
        b.bind(no);
        let in_no = b.is_null(p, any);
        b.ret(None);
        let graph = b.finish();

        let result = analyze(&f, vec![any], &graph);
        assert_eq!(result.input_types.get(in_yes).unwrap(), animal);
        assert_eq!(result.input_types.get(in_no).unwrap(), any);
    }

    #[test]
    fn test_is_null_branch_refines_both_edges() {
        let f = fixture();
        let dog = ValueType::nullable(HeapType::Defined(f.dog));
        let mut b = GraphBuilder::new();
        let null_block = b.new_block();
        let value_block = b.new_block();
        let p = b.parameter(0);
        let is_null = b.is_null(p, dog);
        b.branch(is_null, null_block, value_block);
        b.bind(null_block);
        let in_null = b.is_null(p, dog);
        b.ret(None);
        b.bind(value_block);
        let in_value = b.is_null(p, dog);
        b.ret(None);
        let graph = b.finish();

        let result = analyze(&f, vec![dog], &graph);
        assert_eq!(result.input_types.get(in_null).unwrap(), ValueType::nullable(HeapType::None));
        assert_eq!(result.input_types.get(in_value).unwrap(), dog.as_non_null());
    }

    #[test]
    fn test_is_null_sentinel_follows_operand_hierarchy() {
        let f = fixture();
        let dog = ValueType::nullable(HeapType::Defined(f.dog));
        let mut b = GraphBuilder::new();
        let null_block = b.new_block();
        let value_block = b.new_block();
        let p = b.parameter(0);
        let is_null = b.is_null(p, ValueType::nullable(HeapType::Extern));
        b.branch(is_null, null_block, value_block);
        b.bind(null_block);
        let in_null = b.is_null(p, dog);
        b.ret(None);
        b.bind(value_block);
        b.ret(None);
        let graph = b.finish();

        let result = analyze(&f, vec![dog], &graph);
        assert!(!result.unreachable_blocks.contains(&null_block));
        assert_eq!(result.input_types.get(in_null).unwrap(), ValueType::nullable(HeapType::None));
    }

    #[test]
    fn test_dead_edge_is_ignored_by_merge() {
        let f = fixture();
        let dog = ValueType::non_null(HeapType::Defined(f.dog));
        let mut b = GraphBuilder::new();
        let null_block = b.new_block();
        let value_block = b.new_block();
        let join = b.new_block();
        let p = b.parameter(0);
        let is_null = b.is_null(p, dog);
        b.branch(is_null, null_block, value_block);
        b.bind(null_block);
        b.goto(join);
        b.bind(value_block);
        b.goto(join);
        b.bind(join);
        let after = b.is_null(p, dog);
        b.ret(None);
        let graph = b.finish();

        let result = analyze(&f, vec![dog], &graph);
        assert!(!result.is_reachable(null_block));
        assert!(result.is_reachable(join));
        assert_eq!(result.input_types.get(after).unwrap(), dog);
    }

    #[test]
    fn test_loop_phi_is_unknown() {
        let f = fixture();
        let dog = ValueType::non_null(HeapType::Defined(f.dog));
        let mut b = GraphBuilder::new();
        let header = b.new_block();
        let body = b.new_block();
        let exit = b.new_block();
        let zero = b.word32_constant(0);
        let obj = b.allocate_struct(f.dog, vec![zero]);
        b.goto(header);
        b.bind(header);
        let phi = b.phi(vec![obj]);
        let check = b.is_null(phi, dog);
        b.branch(check, exit, body);
        b.bind(body);
        b.goto(header);
        b.add_phi_input(phi, obj);
        b.bind(exit);
        b.ret(None);
        let graph = b.finish();

        let result = analyze(&f, vec![], &graph);
        assert!(result.is_loop_header(header));
        assert_eq!(result.input_types.get(check).unwrap(), ValueType::Top);
    }
}
