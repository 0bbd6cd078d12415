//! Graph construction helpers

use super::{
    Block, BlockIndex, Graph, NullCheck, OpIndex, Opcode, Operation, Terminator, TrapId,
    TypeCheckConfig,
};
use crate::types::{TypeIndex, ValueType};

/// Incremental graph builder
///
/// Operations are appended to the currently bound block. By default the
/// builder records predecessors as terminators are emitted, so phis must be
/// created after all incoming edges exist (use [`GraphBuilder::add_phi_input`]
/// for loop back edges). Rewrites that must keep the original predecessor
/// order use [`GraphBuilder::with_explicit_predecessors`] and set the lists
/// themselves.
#[derive(Debug)]
pub struct GraphBuilder {
    graph: Graph,
    current: BlockIndex,
    track_predecessors: bool,
}

impl GraphBuilder {
    /// Create a builder with the entry block bound
    pub fn new() -> Self {
        let mut graph = Graph::default();
        graph.blocks.push(Block::new());
        Self {
            graph,
            current: BlockIndex::ENTRY,
            track_predecessors: true,
        }
    }

    /// Create a builder that never infers predecessor lists
    pub fn with_explicit_predecessors() -> Self {
        Self {
            track_predecessors: false,
            ..Self::new()
        }
    }

    pub fn new_block(&mut self) -> BlockIndex {
        self.graph.blocks.push(Block::new());
        BlockIndex((self.graph.blocks.len() - 1) as u32)
    }

    pub fn bind(&mut self, block: BlockIndex) {
        self.current = block;
    }

    pub fn current_block(&self) -> BlockIndex {
        self.current
    }

    pub fn set_predecessors(&mut self, block: BlockIndex, predecessors: Vec<BlockIndex>) {
        self.graph.blocks[block.index()].predecessors = predecessors;
    }

    /// Look at an operation emitted so far
    pub fn get(&self, op: OpIndex) -> Option<&Operation> {
        self.graph.get(op)
    }

    pub fn emit(&mut self, opcode: Opcode) -> OpIndex {
        let index = OpIndex(self.graph.operations.len() as u32);
        self.graph.operations.push(Operation {
            opcode,
            block: self.current,
        });
        self.graph.blocks[self.current.index()].operations.push(index);
        index
    }

    pub fn parameter(&mut self, index: u32) -> OpIndex {
        self.emit(Opcode::Parameter { index })
    }

    pub fn global_get(&mut self, global: u32) -> OpIndex {
        self.emit(Opcode::GlobalGet { global })
    }

    pub fn ref_func(&mut self, function: u32) -> OpIndex {
        self.emit(Opcode::RefFunc { function })
    }

    pub fn allocate_struct(&mut self, type_index: TypeIndex, fields: Vec<OpIndex>) -> OpIndex {
        self.emit(Opcode::AllocateStruct { type_index, fields })
    }

    pub fn allocate_array(&mut self, type_index: TypeIndex, length: OpIndex) -> OpIndex {
        self.emit(Opcode::AllocateArray { type_index, length })
    }

    pub fn null(&mut self, ty: ValueType) -> OpIndex {
        self.emit(Opcode::Null { ty })
    }

    pub fn is_null(&mut self, object: OpIndex, ty: ValueType) -> OpIndex {
        self.emit(Opcode::IsNull { object, ty })
    }

    pub fn assert_not_null(&mut self, object: OpIndex, ty: ValueType, trap: TrapId) -> OpIndex {
        self.emit(Opcode::AssertNotNull { object, ty, trap })
    }

    pub fn cast(&mut self, object: OpIndex, from: ValueType, to: ValueType) -> OpIndex {
        self.emit(Opcode::TypeCast {
            object,
            config: TypeCheckConfig { from, to },
        })
    }

    pub fn check(&mut self, object: OpIndex, from: ValueType, to: ValueType) -> OpIndex {
        self.emit(Opcode::TypeCheck {
            object,
            config: TypeCheckConfig { from, to },
        })
    }

    pub fn struct_get(
        &mut self,
        object: OpIndex,
        type_index: TypeIndex,
        field_index: u32,
        null_check: NullCheck,
    ) -> OpIndex {
        self.emit(Opcode::StructGet {
            object,
            type_index,
            field_index,
            is_signed: true,
            null_check,
        })
    }

    pub fn struct_set(
        &mut self,
        object: OpIndex,
        value: OpIndex,
        type_index: TypeIndex,
        field_index: u32,
        null_check: NullCheck,
    ) -> OpIndex {
        self.emit(Opcode::StructSet {
            object,
            value,
            type_index,
            field_index,
            null_check,
        })
    }

    pub fn array_length(&mut self, array: OpIndex, null_check: NullCheck) -> OpIndex {
        self.emit(Opcode::ArrayLength { array, null_check })
    }

    pub fn word32_constant(&mut self, value: i32) -> OpIndex {
        self.emit(Opcode::Word32Constant { value })
    }

    pub fn word32_equal(&mut self, left: OpIndex, right: OpIndex) -> OpIndex {
        self.emit(Opcode::Word32Equal { left, right })
    }

    pub fn trap_if(&mut self, condition: OpIndex, trap: TrapId) -> OpIndex {
        self.emit(Opcode::TrapIf {
            condition,
            negated: false,
            trap,
        })
    }

    pub fn trap_if_not(&mut self, condition: OpIndex, trap: TrapId) -> OpIndex {
        self.emit(Opcode::TrapIf {
            condition,
            negated: true,
            trap,
        })
    }

    pub fn phi(&mut self, inputs: Vec<OpIndex>) -> OpIndex {
        self.emit(Opcode::Phi { inputs })
    }

    /// Append an input to a phi created before all its operands existed
    pub fn add_phi_input(&mut self, phi: OpIndex, input: OpIndex) {
        if let Some(Operation {
            opcode: Opcode::Phi { inputs },
            ..
        }) = self.graph.operations.get_mut(phi.index())
        {
            inputs.push(input);
        }
    }

    pub fn set_phi_inputs(&mut self, phi: OpIndex, new_inputs: Vec<OpIndex>) {
        if let Some(Operation {
            opcode: Opcode::Phi { inputs },
            ..
        }) = self.graph.operations.get_mut(phi.index())
        {
            *inputs = new_inputs;
        }
    }

    pub fn extern_convert_any(&mut self, object: OpIndex) -> OpIndex {
        self.emit(Opcode::ExternConvertAny { object })
    }

    pub fn any_convert_extern(&mut self, object: OpIndex) -> OpIndex {
        self.emit(Opcode::AnyConvertExtern { object })
    }

    pub fn goto(&mut self, target: BlockIndex) {
        self.terminate(Terminator::Goto(target));
    }

    pub fn branch(&mut self, condition: OpIndex, if_true: BlockIndex, if_false: BlockIndex) {
        self.terminate(Terminator::Branch {
            condition,
            if_true,
            if_false,
        });
    }

    pub fn ret(&mut self, value: Option<OpIndex>) {
        self.terminate(Terminator::Return(value));
    }

    pub fn unreachable(&mut self) {
        self.terminate(Terminator::Unreachable);
    }

    pub fn terminate(&mut self, terminator: Terminator) {
        if self.track_predecessors {
            for successor in terminator.successors() {
                if let Some(block) = self.graph.blocks.get_mut(successor.index()) {
                    block.predecessors.push(self.current);
                }
            }
        }
        self.graph.blocks[self.current.index()].terminator = terminator;
    }

    pub fn finish(self) -> Graph {
        self.graph
    }
}

impl Default for GraphBuilder {
    fn default() -> Self {
        Self::new()
    }
}
