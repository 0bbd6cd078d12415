//! Reference interpreter for graphs
//!
//! Executes a [`Graph`] against a module, with a heap of exactly-typed
//! objects. Traps are ordinary outcomes tagged with their [`TrapId`]. An
//! optional [`Observer`] sees the operand of every type-dependent operation
//! right before it runs, which is what the analysis records a type for.
//!
//! Boundary conversions model an embedder whose own values (`Host`) are
//! valid on both sides, while heap objects are wrapped when they cross into
//! the external hierarchy and unwrapped on the way back.

mod error;
mod value;

pub use error::{ErrorKind, InterpResult, RuntimeError};
pub use value::{Heap, Object, ObjectData, ObjectId, Reference, Value};

use tracing::trace;

use crate::ir::{BlockIndex, Graph, OpIndex, Opcode, Terminator, TrapId};
use crate::types::{ModuleContext, TypeIndex, ValueType};

/// How a run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Returned(Option<Value>),
    Trapped(TrapId),
}

/// Sees the operand of each type-dependent operation before it executes
pub trait Observer {
    fn observe(&mut self, op: OpIndex, operand: Value, heap: &Heap);
}

/// The operand whose type decides how `opcode` may be reduced
pub fn typed_operand(opcode: &Opcode) -> Option<OpIndex> {
    match opcode {
        Opcode::IsNull { object, .. }
        | Opcode::AssertNotNull { object, .. }
        | Opcode::TypeCast { object, .. }
        | Opcode::TypeCheck { object, .. }
        | Opcode::StructGet { object, .. }
        | Opcode::StructSet { object, .. } => Some(*object),
        Opcode::ArrayLength { array, .. } => Some(*array),
        _ => None,
    }
}

/// Result of executing one operation
enum Step {
    Value(Option<Value>),
    Trap(TrapId),
}

pub struct Interpreter<'a> {
    module: &'a ModuleContext,
    heap: Heap,
    globals: Vec<Option<Value>>,
    fuel: usize,
}

impl<'a> Interpreter<'a> {
    pub const DEFAULT_FUEL: usize = 10_000;
    /// Longest array an allocation may request
    pub const MAX_ARRAY_LENGTH: i32 = 1 << 16;

    /// Create an interpreter; globals start out as zero or null
    ///
    /// A non-null reference global has no default and must be given a
    /// value with [`Interpreter::set_global`] before the graph reads it.
    pub fn new(module: &'a ModuleContext) -> Self {
        let globals = module
            .globals
            .iter()
            .map(|global| match global.ty {
                ValueType::Ref { nullable: true, .. } => Some(Value::NULL),
                ValueType::Ref { nullable: false, .. } => None,
                _ => Some(Value::I32(0)),
            })
            .collect();
        Self {
            module,
            heap: Heap::new(),
            globals,
            fuel: Self::DEFAULT_FUEL,
        }
    }

    /// Limit the number of blocks a run may enter
    pub fn with_fuel(mut self, fuel: usize) -> Self {
        self.fuel = fuel;
        self
    }

    /// Store `value` in a global; it must have the global's declared type
    pub fn set_global(&mut self, global: u32, value: Value) -> InterpResult<()> {
        let ty = self
            .module
            .global_type(global)
            .ok_or_else(|| RuntimeError::bad_index("global"))?;
        if !self.heap.inhabits(self.module, value, ty) {
            return Err(RuntimeError::global_type_error(global, &ty.to_string(), value.type_name()));
        }
        let slot = self
            .globals
            .get_mut(global as usize)
            .ok_or_else(|| RuntimeError::bad_index("global"))?;
        *slot = Some(value);
        Ok(())
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    /// Allocate an object of `type_index` with zero or null contents
    pub fn allocate_default(&mut self, type_index: TypeIndex) -> InterpResult<Value> {
        let data = if let Some(fields) = value::struct_fields(self.module, type_index) {
            ObjectData::Struct(fields.into_iter().map(value::default_value).collect())
        } else if self.module.is_array(type_index) {
            ObjectData::Array { length: 0 }
        } else {
            return Err(RuntimeError::bad_index("struct or array type"));
        };
        let id = self.heap.allocate(Object { type_index, data });
        Ok(Value::Ref(Reference::Object(id)))
    }

    pub fn run(&mut self, graph: &Graph, args: &[Value]) -> InterpResult<Outcome> {
        self.execute(graph, args, None)
    }

    pub fn run_observed(
        &mut self,
        graph: &Graph,
        args: &[Value],
        observer: &mut dyn Observer,
    ) -> InterpResult<Outcome> {
        self.execute(graph, args, Some(observer))
    }

    fn execute(
        &mut self,
        graph: &Graph,
        args: &[Value],
        mut observer: Option<&mut dyn Observer>,
    ) -> InterpResult<Outcome> {
        let mut values: Vec<Option<Value>> = vec![None; graph.op_count()];
        let mut block = BlockIndex::ENTRY;
        // Position of the edge we arrived over in the block's predecessor list
        let mut incoming: Option<usize> = None;
        let mut steps = 0;

        loop {
            steps += 1;
            if steps > self.fuel {
                return Err(RuntimeError::out_of_fuel(self.fuel));
            }
            let current = graph
                .blocks
                .get(block.index())
                .ok_or_else(|| RuntimeError::bad_index("block"))?;

            // Phis read their inputs together, before any of them is written.
            let mut phi_values = Vec::new();
            for &op in &current.operations {
                let Opcode::Phi { inputs } = &graph.op(op).opcode else {
                    break;
                };
                let input = incoming
                    .and_then(|position| inputs.get(position))
                    .ok_or_else(|| RuntimeError::bad_index("phi input"))?;
                phi_values.push((op, read(&values, op, *input)?));
            }
            for (op, value) in phi_values {
                values[op.index()] = Some(value);
            }

            for &op in &current.operations {
                let opcode = &graph.op(op).opcode;
                if opcode.is_phi() {
                    continue;
                }
                if let (Some(observer), Some(operand)) = (observer.as_deref_mut(), typed_operand(opcode)) {
                    let operand = read(&values, op, operand)?;
                    observer.observe(op, operand, &self.heap);
                }
                match self.step(op, opcode, &values, args)? {
                    Step::Value(value) => values[op.index()] = value,
                    Step::Trap(trap) => {
                        trace!(%op, %trap, "trapped");
                        return Ok(Outcome::Trapped(trap));
                    }
                }
            }

            let (target, take_last) = match &current.terminator {
                Terminator::Goto(target) => (*target, false),
                Terminator::Branch {
                    condition,
                    if_true,
                    if_false,
                } => {
                    let taken = expect_i32(read(&values, *condition, *condition)?, *condition)? != 0;
                    if taken { (*if_true, false) } else { (*if_false, true) }
                }
                Terminator::Return(value) => {
                    let value = value.map(|v| read(&values, v, v)).transpose()?;
                    return Ok(Outcome::Returned(value));
                }
                Terminator::Unreachable => return Ok(Outcome::Trapped(TrapId::Unreachable)),
            };
            let predecessors = &graph
                .blocks
                .get(target.index())
                .ok_or_else(|| RuntimeError::bad_index("block"))?
                .predecessors;
            let position = if take_last {
                predecessors.iter().rposition(|&pred| pred == block)
            } else {
                predecessors.iter().position(|&pred| pred == block)
            };
            incoming = Some(position.ok_or_else(|| RuntimeError::bad_index("predecessor edge"))?);
            block = target;
        }
    }

    fn step(&mut self, op: OpIndex, opcode: &Opcode, values: &[Option<Value>], args: &[Value]) -> InterpResult<Step> {
        let read = |value: OpIndex| read(values, op, value);
        let value = match opcode {
            Opcode::Parameter { index } => *args
                .get(*index as usize)
                .ok_or_else(|| RuntimeError::arity_mismatch(*index as usize + 1, args.len()))?,
            Opcode::GlobalGet { global } => self
                .globals
                .get(*global as usize)
                .ok_or_else(|| RuntimeError::bad_index("global"))?
                .ok_or_else(|| RuntimeError::uninitialized_global(*global))?,
            Opcode::RefFunc { function } => {
                if self.module.function_signature(*function).is_none() {
                    return Err(RuntimeError::bad_index("function"));
                }
                Value::Ref(Reference::Func(*function))
            }
            Opcode::AllocateStruct { type_index, fields } => {
                let storage = value::struct_fields(self.module, *type_index)
                    .ok_or_else(|| RuntimeError::bad_index("struct type"))?;
                if storage.len() != fields.len() {
                    return Err(RuntimeError::type_error(
                        op,
                        &format!("{} fields", storage.len()),
                        &format!("{} fields", fields.len()),
                    ));
                }
                let mut contents = Vec::with_capacity(fields.len());
                for (&field, &storage) in fields.iter().zip(&storage) {
                    contents.push(value::truncate(storage, read(field)?));
                }
                let id = self.heap.allocate(Object {
                    type_index: *type_index,
                    data: ObjectData::Struct(contents),
                });
                Value::Ref(Reference::Object(id))
            }
            Opcode::AllocateArray { type_index, length } => {
                let length = expect_i32(read(*length)?, op)?;
                if !(0..=Self::MAX_ARRAY_LENGTH).contains(&length) {
                    return Ok(Step::Trap(TrapId::ArrayTooLarge));
                }
                let id = self.heap.allocate(Object {
                    type_index: *type_index,
                    data: ObjectData::Array {
                        length: length as u32,
                    },
                });
                Value::Ref(Reference::Object(id))
            }
            Opcode::Null { .. } => Value::NULL,
            Opcode::IsNull { object, .. } => {
                let object = expect_ref(read(*object)?, op)?;
                Value::I32((object == Reference::Null) as i32)
            }
            Opcode::AssertNotNull { object, trap, .. } => {
                let object = read(*object)?;
                if object.is_null() {
                    return Ok(Step::Trap(*trap));
                }
                object
            }
            Opcode::TypeCast { object, config } => {
                let object = read(*object)?;
                if !self.heap.inhabits(self.module, object, config.to) {
                    return Ok(Step::Trap(TrapId::IllegalCast));
                }
                object
            }
            Opcode::TypeCheck { object, config } => {
                let object = read(*object)?;
                Value::I32(self.heap.inhabits(self.module, object, config.to) as i32)
            }
            Opcode::StructGet {
                object,
                type_index,
                field_index,
                is_signed,
                ..
            } => {
                let Some(id) = Self::receiver(op, read(*object)?)? else {
                    return Ok(Step::Trap(TrapId::NullDereference));
                };
                let storage = self
                    .module
                    .struct_field(*type_index, *field_index)
                    .ok_or_else(|| RuntimeError::bad_index("field"))?
                    .storage;
                let stored = match self.heap.get(id).map(|object| &object.data) {
                    Some(ObjectData::Struct(fields)) => fields.get(*field_index as usize).copied(),
                    _ => None,
                }
                .ok_or_else(|| RuntimeError::type_error(op, "struct with field", "other object"))?;
                value::extend(storage, stored, *is_signed)
            }
            Opcode::StructSet {
                object,
                value,
                type_index,
                field_index,
                ..
            } => {
                let Some(id) = Self::receiver(op, read(*object)?)? else {
                    return Ok(Step::Trap(TrapId::NullDereference));
                };
                let storage = self
                    .module
                    .struct_field(*type_index, *field_index)
                    .ok_or_else(|| RuntimeError::bad_index("field"))?
                    .storage;
                let stored = value::truncate(storage, read(*value)?);
                let slot = match self.heap.get_mut(id).map(|object| &mut object.data) {
                    Some(ObjectData::Struct(fields)) => fields.get_mut(*field_index as usize),
                    _ => None,
                }
                .ok_or_else(|| RuntimeError::type_error(op, "struct with field", "other object"))?;
                *slot = stored;
                return Ok(Step::Value(None));
            }
            Opcode::ArrayLength { array, .. } => {
                let Some(id) = Self::receiver(op, read(*array)?)? else {
                    return Ok(Step::Trap(TrapId::NullDereference));
                };
                match self.heap.get(id).map(|object| &object.data) {
                    Some(ObjectData::Array { length }) => Value::I32(*length as i32),
                    _ => return Err(RuntimeError::type_error(op, "array", "other object")),
                }
            }
            Opcode::Word32Constant { value } => Value::I32(*value),
            Opcode::Word32Equal { left, right } => {
                let left = expect_i32(read(*left)?, op)?;
                let right = expect_i32(read(*right)?, op)?;
                Value::I32((left == right) as i32)
            }
            Opcode::TrapIf {
                condition,
                negated,
                trap,
            } => {
                let condition = expect_i32(read(*condition)?, op)? != 0;
                if condition != *negated {
                    return Ok(Step::Trap(*trap));
                }
                return Ok(Step::Value(None));
            }
            Opcode::ExternConvertAny { object } => match expect_ref(read(*object)?, op)? {
                Reference::Object(id) => Value::Ref(Reference::Wrapped(id)),
                other => Value::Ref(other),
            },
            Opcode::AnyConvertExtern { object } => match expect_ref(read(*object)?, op)? {
                Reference::Wrapped(id) => Value::Ref(Reference::Object(id)),
                other => Value::Ref(other),
            },
            Opcode::Phi { .. } => return Err(RuntimeError::type_error(op, "non-phi", "phi")),
        };
        Ok(Step::Value(Some(value)))
    }

    /// Object a memory access goes to; `None` means the access traps on null
    ///
    /// An unchecked access still faults on null, the way a hardware trap
    /// would catch it.
    fn receiver(op: OpIndex, value: Value) -> InterpResult<Option<ObjectId>> {
        match expect_ref(value, op)? {
            Reference::Null => Ok(None),
            Reference::Object(id) => Ok(Some(id)),
            other => Err(RuntimeError::type_error(op, "heap object", Value::Ref(other).type_name())),
        }
    }
}

fn read(values: &[Option<Value>], op: OpIndex, value: OpIndex) -> InterpResult<Value> {
    values
        .get(value.index())
        .copied()
        .flatten()
        .ok_or_else(|| RuntimeError::undefined_value(op, value))
}

fn expect_i32(value: Value, op: OpIndex) -> InterpResult<i32> {
    value
        .as_i32()
        .ok_or_else(|| RuntimeError::type_error(op, "i32", value.type_name()))
}

fn expect_ref(value: Value, op: OpIndex) -> InterpResult<Reference> {
    value
        .as_reference()
        .ok_or_else(|| RuntimeError::type_error(op, "reference", value.type_name()))
}
