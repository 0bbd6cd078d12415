//! Runtime values and the object heap

use std::fmt;

use crate::types::{HeapType, ModuleContext, StorageType, TypeIndex, TypeKind, ValueType};

/// Identity of a heap object, in allocation order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectId(pub u32);

/// Runtime reference
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reference {
    Null,
    /// A struct or array on the heap
    Object(ObjectId),
    /// Reference to a declared function
    Func(u32),
    /// Opaque value owned by the embedder; usable as `any` and as `extern`
    Host(u32),
    /// A heap object that crossed into the external hierarchy
    Wrapped(ObjectId),
}

/// Runtime value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Value {
    I32(i32),
    Ref(Reference),
}

impl Value {
    pub const NULL: Value = Value::Ref(Reference::Null);

    pub fn as_i32(self) -> Option<i32> {
        match self {
            Value::I32(n) => Some(n),
            Value::Ref(_) => None,
        }
    }

    pub fn as_reference(self) -> Option<Reference> {
        match self {
            Value::Ref(r) => Some(r),
            Value::I32(_) => None,
        }
    }

    pub fn is_null(self) -> bool {
        self == Value::NULL
    }

    pub fn type_name(self) -> &'static str {
        match self {
            Value::I32(_) => "i32",
            Value::Ref(Reference::Null) => "null",
            Value::Ref(Reference::Object(_)) => "object",
            Value::Ref(Reference::Func(_)) => "funcref",
            Value::Ref(Reference::Host(_)) => "host",
            Value::Ref(Reference::Wrapped(_)) => "wrapped",
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::I32(n) => write!(f, "{n}"),
            Value::Ref(Reference::Null) => write!(f, "null"),
            Value::Ref(Reference::Object(id)) => write!(f, "#{}", id.0),
            Value::Ref(Reference::Func(index)) => write!(f, "func {index}"),
            Value::Ref(Reference::Host(n)) => write!(f, "host {n}"),
            Value::Ref(Reference::Wrapped(id)) => write!(f, "extern #{}", id.0),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObjectData {
    Struct(Vec<Value>),
    Array { length: u32 },
}

/// Heap object with its exact allocated type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Object {
    pub type_index: TypeIndex,
    pub data: ObjectData,
}

/// All objects allocated by one run
#[derive(Debug, Clone, Default)]
pub struct Heap {
    objects: Vec<Object>,
}

impl Heap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate(&mut self, object: Object) -> ObjectId {
        self.objects.push(object);
        ObjectId((self.objects.len() - 1) as u32)
    }

    pub fn get(&self, id: ObjectId) -> Option<&Object> {
        self.objects.get(id.0 as usize)
    }

    pub fn get_mut(&mut self, id: ObjectId) -> Option<&mut Object> {
        self.objects.get_mut(id.0 as usize)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Does `value` have type `ty`?
    pub fn inhabits(&self, module: &ModuleContext, value: Value, ty: ValueType) -> bool {
        match (value, ty) {
            (_, ValueType::Top) => true,
            (_, ValueType::Bottom) => false,
            (Value::I32(_), ValueType::I32) => true,
            (Value::Ref(reference), ValueType::Ref { heap, nullable }) => match reference {
                Reference::Null => nullable,
                _ => self.matches_heap(module, reference, heap),
            },
            _ => false,
        }
    }

    fn matches_heap(&self, module: &ModuleContext, reference: Reference, heap: HeapType) -> bool {
        match reference {
            Reference::Null => false,
            Reference::Object(id) => {
                let Some(object) = self.get(id) else {
                    return false;
                };
                let actual = object.type_index;
                match heap {
                    HeapType::Any | HeapType::Eq => true,
                    HeapType::Struct => module.is_struct(actual),
                    HeapType::Array => module.is_array(actual),
                    HeapType::Defined(expected) => declared_subtype(module, actual, expected),
                    HeapType::Exact(expected) => actual == expected,
                    _ => false,
                }
            }
            Reference::Func(function) => {
                let Some(actual) = module.function_signature(function) else {
                    return false;
                };
                match heap {
                    HeapType::Func => true,
                    HeapType::Defined(expected) => declared_subtype(module, actual, expected),
                    HeapType::Exact(expected) => actual == expected,
                    _ => false,
                }
            }
            Reference::Host(_) => matches!(heap, HeapType::Any | HeapType::Extern),
            Reference::Wrapped(_) => heap == HeapType::Extern,
        }
    }
}

fn declared_subtype(module: &ModuleContext, mut actual: TypeIndex, expected: TypeIndex) -> bool {
    for _ in 0..=module.types.len() {
        if actual == expected {
            return true;
        }
        match module.supertype(actual) {
            Some(parent) => actual = parent,
            None => return false,
        }
    }
    false
}

/// Keep only the bits a packed storage type holds
pub fn truncate(storage: StorageType, value: Value) -> Value {
    match (storage, value) {
        (StorageType::I8, Value::I32(n)) => Value::I32(n as i8 as i32),
        (StorageType::I16, Value::I32(n)) => Value::I32(n as i16 as i32),
        _ => value,
    }
}

/// Widen a stored packed value back to 32 bits
pub fn extend(storage: StorageType, value: Value, is_signed: bool) -> Value {
    match (storage, value, is_signed) {
        (StorageType::I8, Value::I32(n), false) => Value::I32(n as u8 as i32),
        (StorageType::I16, Value::I32(n), false) => Value::I32(n as u16 as i32),
        _ => value,
    }
}

/// Zero value of a storage type; references start out null
pub fn default_value(storage: StorageType) -> Value {
    match storage.unpacked() {
        ValueType::Ref { .. } => Value::NULL,
        _ => Value::I32(0),
    }
}

/// Field storage of a struct type
pub fn struct_fields(module: &ModuleContext, index: TypeIndex) -> Option<Vec<StorageType>> {
    match &module.type_def(index)?.kind {
        TypeKind::Struct { fields } => Some(fields.iter().map(|f| f.storage).collect()),
        _ => None,
    }
}
