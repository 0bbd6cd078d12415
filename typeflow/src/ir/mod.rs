//! SSA graph IR for GC reference code
//!
//! A [`Graph`] is a control-flow graph of [`Block`]s. Every block holds an
//! ordered list of operations and ends in a [`Terminator`]. Operations live
//! in one graph-wide arena and are addressed by [`OpIndex`]; an operation's
//! operands are indices of earlier operations, so every operation that
//! produces a value *is* that value.
//!
//! Phi operations sit at the start of a block and take one input per
//! predecessor, in the order of [`Block::predecessors`].

mod builder;
pub mod order;
mod printer;

pub use builder::GraphBuilder;
pub use order::{BlockOrder, Dominators};

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{PassError, Result};
use crate::types::{TypeIndex, ValueType};

/// Identity of an operation (and of the value it produces)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OpIndex(pub u32);

impl OpIndex {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for OpIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlockIndex(pub u32);

impl BlockIndex {
    pub const ENTRY: BlockIndex = BlockIndex(0);

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for BlockIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "B{}", self.0)
    }
}

/// Whether a memory access checks its receiver for null
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NullCheck {
    WithNullCheck,
    WithoutNullCheck,
}

/// Reason tag carried by trapping operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrapId {
    IllegalCast,
    NullDereference,
    ArrayTooLarge,
    Unreachable,
}

impl fmt::Display for TrapId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TrapId::IllegalCast => "illegal_cast",
            TrapId::NullDereference => "null_dereference",
            TrapId::ArrayTooLarge => "array_too_large",
            TrapId::Unreachable => "unreachable",
        };
        f.write_str(name)
    }
}

/// Declared source and target type of a cast or type check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TypeCheckConfig {
    pub from: ValueType,
    pub to: ValueType,
}

/// Operation kinds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Opcode {
    /// Function parameter `index`
    Parameter { index: u32 },
    GlobalGet { global: u32 },
    /// Reference to declared function `function`
    RefFunc { function: u32 },
    AllocateStruct {
        type_index: TypeIndex,
        fields: Vec<OpIndex>,
    },
    AllocateArray {
        type_index: TypeIndex,
        length: OpIndex,
    },
    /// Null constant of the hierarchy of `ty`
    Null { ty: ValueType },
    /// 1 if `object` is null, else 0
    IsNull { object: OpIndex, ty: ValueType },
    /// Traps with `trap` if `object` is null; the value is `object`
    AssertNotNull {
        object: OpIndex,
        ty: ValueType,
        trap: TrapId,
    },
    /// Traps unless `object` inhabits `config.to`; the value is `object`
    TypeCast {
        object: OpIndex,
        config: TypeCheckConfig,
    },
    /// 1 if `object` inhabits `config.to`, else 0
    TypeCheck {
        object: OpIndex,
        config: TypeCheckConfig,
    },
    StructGet {
        object: OpIndex,
        type_index: TypeIndex,
        field_index: u32,
        is_signed: bool,
        null_check: NullCheck,
    },
    StructSet {
        object: OpIndex,
        value: OpIndex,
        type_index: TypeIndex,
        field_index: u32,
        null_check: NullCheck,
    },
    ArrayLength {
        array: OpIndex,
        null_check: NullCheck,
    },
    Word32Constant { value: i32 },
    Word32Equal { left: OpIndex, right: OpIndex },
    /// Traps if `condition` is non-zero (zero when `negated`)
    TrapIf {
        condition: OpIndex,
        negated: bool,
        trap: TrapId,
    },
    Phi { inputs: Vec<OpIndex> },
    /// Outward boundary conversion (internal to external)
    ExternConvertAny { object: OpIndex },
    /// Inward boundary conversion (external to internal)
    AnyConvertExtern { object: OpIndex },
}

impl Opcode {
    /// Operand references, in order
    pub fn inputs(&self) -> Vec<OpIndex> {
        match self {
            Opcode::Parameter { .. }
            | Opcode::GlobalGet { .. }
            | Opcode::RefFunc { .. }
            | Opcode::Null { .. }
            | Opcode::Word32Constant { .. } => vec![],
            Opcode::AllocateStruct { fields, .. } => fields.clone(),
            Opcode::AllocateArray { length, .. } => vec![*length],
            Opcode::IsNull { object, .. }
            | Opcode::AssertNotNull { object, .. }
            | Opcode::TypeCast { object, .. }
            | Opcode::TypeCheck { object, .. }
            | Opcode::StructGet { object, .. }
            | Opcode::ExternConvertAny { object }
            | Opcode::AnyConvertExtern { object } => vec![*object],
            Opcode::StructSet { object, value, .. } => vec![*object, *value],
            Opcode::ArrayLength { array, .. } => vec![*array],
            Opcode::Word32Equal { left, right } => vec![*left, *right],
            Opcode::TrapIf { condition, .. } => vec![*condition],
            Opcode::Phi { inputs } => inputs.clone(),
        }
    }

    /// Rebuild this opcode with every operand passed through `f`
    pub fn try_map_inputs<F>(&self, mut f: F) -> Result<Opcode>
    where
        F: FnMut(OpIndex) -> Result<OpIndex>,
    {
        let mut opcode = self.clone();
        match &mut opcode {
            Opcode::Parameter { .. }
            | Opcode::GlobalGet { .. }
            | Opcode::RefFunc { .. }
            | Opcode::Null { .. }
            | Opcode::Word32Constant { .. } => {}
            Opcode::AllocateStruct { fields, .. } => {
                for field in fields.iter_mut() {
                    *field = f(*field)?;
                }
            }
            Opcode::AllocateArray { length, .. } => *length = f(*length)?,
            Opcode::IsNull { object, .. }
            | Opcode::AssertNotNull { object, .. }
            | Opcode::TypeCast { object, .. }
            | Opcode::TypeCheck { object, .. }
            | Opcode::StructGet { object, .. }
            | Opcode::ExternConvertAny { object }
            | Opcode::AnyConvertExtern { object } => *object = f(*object)?,
            Opcode::StructSet { object, value, .. } => {
                *object = f(*object)?;
                *value = f(*value)?;
            }
            Opcode::ArrayLength { array, .. } => *array = f(*array)?,
            Opcode::Word32Equal { left, right } => {
                *left = f(*left)?;
                *right = f(*right)?;
            }
            Opcode::TrapIf { condition, .. } => *condition = f(*condition)?,
            Opcode::Phi { inputs } => {
                for input in inputs.iter_mut() {
                    *input = f(*input)?;
                }
            }
        }
        Ok(opcode)
    }

    pub fn produces_value(&self) -> bool {
        !matches!(self, Opcode::StructSet { .. } | Opcode::TrapIf { .. })
    }

    pub fn is_phi(&self) -> bool {
        matches!(self, Opcode::Phi { .. })
    }

    /// Can be deleted when nothing uses its value: it neither traps,
    /// writes memory nor creates an object identity.
    pub fn is_removable_if_unused(&self) -> bool {
        matches!(
            self,
            Opcode::GlobalGet { .. }
                | Opcode::RefFunc { .. }
                | Opcode::Null { .. }
                | Opcode::IsNull { .. }
                | Opcode::TypeCheck { .. }
                | Opcode::Word32Constant { .. }
                | Opcode::Word32Equal { .. }
                | Opcode::Phi { .. }
                | Opcode::ExternConvertAny { .. }
                | Opcode::AnyConvertExtern { .. }
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            Opcode::Parameter { .. } => "Parameter",
            Opcode::GlobalGet { .. } => "GlobalGet",
            Opcode::RefFunc { .. } => "RefFunc",
            Opcode::AllocateStruct { .. } => "AllocateStruct",
            Opcode::AllocateArray { .. } => "AllocateArray",
            Opcode::Null { .. } => "Null",
            Opcode::IsNull { .. } => "IsNull",
            Opcode::AssertNotNull { .. } => "AssertNotNull",
            Opcode::TypeCast { .. } => "TypeCast",
            Opcode::TypeCheck { .. } => "TypeCheck",
            Opcode::StructGet { .. } => "StructGet",
            Opcode::StructSet { .. } => "StructSet",
            Opcode::ArrayLength { .. } => "ArrayLength",
            Opcode::Word32Constant { .. } => "Word32Constant",
            Opcode::Word32Equal { .. } => "Word32Equal",
            Opcode::TrapIf { .. } => "TrapIf",
            Opcode::Phi { .. } => "Phi",
            Opcode::ExternConvertAny { .. } => "ExternConvertAny",
            Opcode::AnyConvertExtern { .. } => "AnyConvertExtern",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    pub opcode: Opcode,
    pub block: BlockIndex,
}

/// Block terminator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Terminator {
    Goto(BlockIndex),
    /// Branch on a 0/1 word: non-zero goes to `if_true`
    Branch {
        condition: OpIndex,
        if_true: BlockIndex,
        if_false: BlockIndex,
    },
    Return(Option<OpIndex>),
    Unreachable,
}

impl Terminator {
    pub fn successors(&self) -> Vec<BlockIndex> {
        match self {
            Terminator::Goto(target) => vec![*target],
            Terminator::Branch {
                if_true, if_false, ..
            } => vec![*if_true, *if_false],
            Terminator::Return(_) | Terminator::Unreachable => vec![],
        }
    }

    pub fn inputs(&self) -> Vec<OpIndex> {
        match self {
            Terminator::Branch { condition, .. } => vec![*condition],
            Terminator::Return(Some(value)) => vec![*value],
            _ => vec![],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub operations: Vec<OpIndex>,
    pub predecessors: Vec<BlockIndex>,
    pub terminator: Terminator,
}

impl Block {
    pub fn new() -> Self {
        Self {
            operations: Vec::new(),
            predecessors: Vec::new(),
            terminator: Terminator::Unreachable,
        }
    }
}

impl Default for Block {
    fn default() -> Self {
        Self::new()
    }
}

/// A function body: the first block is the entry
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Graph {
    pub operations: Vec<Operation>,
    pub blocks: Vec<Block>,
}

impl Graph {
    pub fn op(&self, index: OpIndex) -> &Operation {
        &self.operations[index.index()]
    }

    pub fn get(&self, index: OpIndex) -> Option<&Operation> {
        self.operations.get(index.index())
    }

    pub fn block(&self, index: BlockIndex) -> &Block {
        &self.blocks[index.index()]
    }

    pub fn op_count(&self) -> usize {
        self.operations.len()
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn block_indices(&self) -> impl Iterator<Item = BlockIndex> {
        (0..self.blocks.len() as u32).map(BlockIndex)
    }

    /// Number of operations with the given opcode name
    pub fn count_opcode(&self, name: &str) -> usize {
        self.blocks
            .iter()
            .flat_map(|block| &block.operations)
            .filter(|&&op| self.op(op).opcode.name() == name)
            .count()
    }

    /// Structural validation of an SSA graph
    ///
    /// Checks operand ranges, block membership, phi placement and arity,
    /// predecessor lists against terminators, and that every use in a
    /// reachable block is dominated by its definition.
    pub fn verify(&self) -> Result<()> {
        if self.blocks.is_empty() {
            return Err(PassError::malformed("graph has no blocks"));
        }
        if !self.block(BlockIndex::ENTRY).predecessors.is_empty() {
            return Err(PassError::malformed("entry block has predecessors"));
        }

        let mut position: Vec<Option<(BlockIndex, usize)>> = vec![None; self.operations.len()];
        for block_index in self.block_indices() {
            let block = self.block(block_index);
            let mut seen_non_phi = false;
            for (slot, &op) in block.operations.iter().enumerate() {
                let Some(operation) = self.get(op) else {
                    return Err(PassError::malformed(format!(
                        "{block_index} lists missing operation {op}"
                    )));
                };
                if operation.block != block_index {
                    return Err(PassError::malformed(format!(
                        "{op} is listed in {block_index} but belongs to {}",
                        operation.block
                    )));
                }
                if position[op.index()].is_some() {
                    return Err(PassError::malformed(format!("{op} is listed twice")));
                }
                position[op.index()] = Some((block_index, slot));

                if let Opcode::Phi { inputs } = &operation.opcode {
                    if seen_non_phi {
                        return Err(PassError::malformed(format!(
                            "phi {op} follows a non-phi operation in {block_index}"
                        )));
                    }
                    if inputs.len() != block.predecessors.len() {
                        return Err(PassError::malformed(format!(
                            "phi {op} has {} inputs but {block_index} has {} predecessors",
                            inputs.len(),
                            block.predecessors.len()
                        )));
                    }
                } else {
                    seen_non_phi = true;
                }
            }
        }
        if let Some(orphan) = position.iter().position(Option::is_none) {
            return Err(PassError::malformed(format!(
                "operation %{orphan} is not placed in any block"
            )));
        }

        let mut expected_preds: Vec<Vec<BlockIndex>> = vec![Vec::new(); self.blocks.len()];
        for block_index in self.block_indices() {
            for successor in self.block(block_index).terminator.successors() {
                if successor.index() >= self.blocks.len() {
                    return Err(PassError::malformed(format!(
                        "{block_index} jumps to missing block {successor}"
                    )));
                }
                if successor == BlockIndex::ENTRY {
                    return Err(PassError::malformed("a block jumps back to the entry block"));
                }
                expected_preds[successor.index()].push(block_index);
            }
        }
        for block_index in self.block_indices() {
            let mut actual = self.block(block_index).predecessors.clone();
            let mut expected = expected_preds[block_index.index()].clone();
            actual.sort();
            expected.sort();
            if actual != expected {
                return Err(PassError::malformed(format!(
                    "predecessors of {block_index} do not match the incoming edges"
                )));
            }
        }

        let order = BlockOrder::compute(self);
        let dominators = Dominators::compute(self, &order);
        let defined_before = |value: OpIndex, block: BlockIndex, slot: usize| -> bool {
            let Some((def_block, def_slot)) = position.get(value.index()).copied().flatten() else {
                return false;
            };
            if def_block == block {
                def_slot < slot
            } else {
                dominators.dominates(def_block, block)
            }
        };

        for &block_index in order.blocks() {
            let block = self.block(block_index);
            for (slot, &op) in block.operations.iter().enumerate() {
                let opcode = &self.op(op).opcode;
                for value in opcode.inputs() {
                    let Some(def) = self.get(value) else {
                        return Err(PassError::malformed(format!(
                            "{op} uses {value}, which does not exist"
                        )));
                    };
                    if !def.opcode.produces_value() {
                        return Err(PassError::undefined_value(op, value));
                    }
                }
                match opcode {
                    Opcode::Phi { inputs } => {
                        for (&value, &pred) in inputs.iter().zip(&block.predecessors) {
                            if !order.is_reachable(pred) {
                                continue;
                            }
                            let pred_end = self.block(pred).operations.len();
                            if !defined_before(value, pred, pred_end) {
                                return Err(PassError::undefined_value(op, value));
                            }
                        }
                    }
                    _ => {
                        for value in opcode.inputs() {
                            if !defined_before(value, block_index, slot) {
                                return Err(PassError::undefined_value(op, value));
                            }
                        }
                    }
                }
            }
            let end = block.operations.len();
            for value in block.terminator.inputs() {
                if self.get(value).is_none_or(|def| !def.opcode.produces_value())
                    || !defined_before(value, block_index, end)
                {
                    return Err(PassError::malformed(format!(
                        "terminator of {block_index} uses undefined value {value}"
                    )));
                }
            }
        }
        Ok(())
    }
}
