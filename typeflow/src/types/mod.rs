//! Reference types, module context and the subtyping oracle
//!
//! Values are either 32-bit integers or references. A reference type is a
//! heap type qualified by nullability. Heap types form three disjoint
//! hierarchies, related by nominal subtyping:
//!
//! ```text
//! internal:  any ⊇ eq ⊇ { i31, struct ⊇ $structs, array ⊇ $arrays } ⊇ none
//! functions: func ⊇ $signatures ⊇ nofunc
//! external:  extern ⊇ noextern
//! ```
//!
//! `Exact(i)` is inhabited only by values allocated with exactly type `i`.
//! Two lattice sentinels complete the picture: `Top` means "nothing is known"
//! and `Bottom` means "no value is consistent with what is known".

mod lattice;

pub use lattice::ModuleLattice;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{PassError, Result};

/// Index of a type definition in the module
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TypeIndex(pub u32);

impl TypeIndex {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for TypeIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "${}", self.0)
    }
}

/// Heap category of a reference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeapType {
    Any,
    Eq,
    /// Boxed 31-bit scalar
    I31,
    Struct,
    Array,
    Func,
    Extern,
    None,
    NoFunc,
    NoExtern,
    /// A declared struct, array or signature type (or any declared subtype)
    Defined(TypeIndex),
    /// Exactly the declared type, never one of its subtypes
    Exact(TypeIndex),
}

impl HeapType {
    /// Is this the bottom of its hierarchy (inhabited only by null)?
    pub fn is_bottom(self) -> bool {
        matches!(self, HeapType::None | HeapType::NoFunc | HeapType::NoExtern)
    }

    pub fn defined_index(self) -> Option<TypeIndex> {
        match self {
            HeapType::Defined(index) | HeapType::Exact(index) => Some(index),
            _ => None,
        }
    }
}

impl fmt::Display for HeapType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeapType::Any => write!(f, "any"),
            HeapType::Eq => write!(f, "eq"),
            HeapType::I31 => write!(f, "i31"),
            HeapType::Struct => write!(f, "struct"),
            HeapType::Array => write!(f, "array"),
            HeapType::Func => write!(f, "func"),
            HeapType::Extern => write!(f, "extern"),
            HeapType::None => write!(f, "none"),
            HeapType::NoFunc => write!(f, "nofunc"),
            HeapType::NoExtern => write!(f, "noextern"),
            HeapType::Defined(index) => write!(f, "{index}"),
            HeapType::Exact(index) => write!(f, "(exact {index})"),
        }
    }
}

/// Type of an SSA value, or a lattice sentinel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    /// No knowledge recorded
    #[default]
    Top,
    /// Contradictory knowledge: the program point is unreachable
    Bottom,
    I32,
    Ref { heap: HeapType, nullable: bool },
}

impl ValueType {
    pub const fn nullable(heap: HeapType) -> Self {
        ValueType::Ref {
            heap,
            nullable: true,
        }
    }

    pub const fn non_null(heap: HeapType) -> Self {
        ValueType::Ref {
            heap,
            nullable: false,
        }
    }

    pub fn is_reference(self) -> bool {
        matches!(self, ValueType::Ref { .. })
    }

    pub fn is_top(self) -> bool {
        self == ValueType::Top
    }

    pub fn is_bottom(self) -> bool {
        self == ValueType::Bottom
    }

    /// Neither sentinel: the type carries usable knowledge
    pub fn is_known(self) -> bool {
        !self.is_top() && !self.is_bottom()
    }

    pub fn is_nullable(self) -> bool {
        matches!(self, ValueType::Ref { nullable: true, .. })
    }

    /// Only a reference can be proven non-nullable; the sentinels never are.
    pub fn is_non_nullable(self) -> bool {
        matches!(self, ValueType::Ref { nullable: false, .. })
    }

    pub fn heap_type(self) -> Option<HeapType> {
        match self {
            ValueType::Ref { heap, .. } => Some(heap),
            _ => None,
        }
    }

    pub fn as_non_null(self) -> Self {
        match self {
            ValueType::Ref { heap, .. } => ValueType::non_null(heap),
            other => other,
        }
    }

    pub fn as_nullable(self) -> Self {
        match self {
            ValueType::Ref { heap, .. } => ValueType::nullable(heap),
            other => other,
        }
    }

    /// No runtime value can have this type
    pub fn is_uninhabited(self) -> bool {
        match self {
            ValueType::Bottom => true,
            ValueType::Ref { heap, nullable } => !nullable && heap.is_bottom(),
            _ => false,
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueType::Top => write!(f, "top"),
            ValueType::Bottom => write!(f, "bottom"),
            ValueType::I32 => write!(f, "i32"),
            ValueType::Ref {
                heap,
                nullable: true,
            } => write!(f, "(ref null {heap})"),
            ValueType::Ref {
                heap,
                nullable: false,
            } => write!(f, "(ref {heap})"),
        }
    }
}

/// Storage type of a struct field or array element
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageType {
    I8,
    I16,
    Value(ValueType),
}

impl StorageType {
    /// Type of the value produced when reading this storage
    pub fn unpacked(self) -> ValueType {
        match self {
            StorageType::I8 | StorageType::I16 => ValueType::I32,
            StorageType::Value(ty) => ty,
        }
    }

    pub fn is_packed(self) -> bool {
        matches!(self, StorageType::I8 | StorageType::I16)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldType {
    pub storage: StorageType,
    #[serde(default)]
    pub mutable: bool,
}

impl FieldType {
    pub fn mutable(storage: StorageType) -> Self {
        Self {
            storage,
            mutable: true,
        }
    }

    pub fn immutable(storage: StorageType) -> Self {
        Self {
            storage,
            mutable: false,
        }
    }
}

/// Declared signature of a function
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionSignature {
    pub params: Vec<ValueType>,
    #[serde(default)]
    pub results: Vec<ValueType>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TypeKind {
    Struct { fields: Vec<FieldType> },
    Array { element: FieldType },
    Func(FunctionSignature),
}

/// A declared type with its (optional) declared supertype
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeDefinition {
    pub kind: TypeKind,
    #[serde(default)]
    pub supertype: Option<TypeIndex>,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalDecl {
    pub ty: ValueType,
    #[serde(default)]
    pub mutable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionDecl {
    pub signature: TypeIndex,
    #[serde(default)]
    pub name: Option<String>,
}

/// Read-only description of the module a compilation unit belongs to
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleContext {
    #[serde(default)]
    pub types: Vec<TypeDefinition>,
    #[serde(default)]
    pub globals: Vec<GlobalDecl>,
    #[serde(default)]
    pub functions: Vec<FunctionDecl>,
}

impl ModuleContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a struct type and return its index
    pub fn add_struct(
        &mut self,
        name: &str,
        fields: Vec<FieldType>,
        supertype: Option<TypeIndex>,
    ) -> TypeIndex {
        self.add_type(name, TypeKind::Struct { fields }, supertype)
    }

    pub fn add_array(
        &mut self,
        name: &str,
        element: FieldType,
        supertype: Option<TypeIndex>,
    ) -> TypeIndex {
        self.add_type(name, TypeKind::Array { element }, supertype)
    }

    pub fn add_signature(&mut self, name: &str, signature: FunctionSignature) -> TypeIndex {
        self.add_type(name, TypeKind::Func(signature), None)
    }

    fn add_type(&mut self, name: &str, kind: TypeKind, supertype: Option<TypeIndex>) -> TypeIndex {
        let index = TypeIndex(self.types.len() as u32);
        self.types.push(TypeDefinition {
            kind,
            supertype,
            name: Some(name.to_string()),
        });
        index
    }

    pub fn add_global(&mut self, ty: ValueType, mutable: bool) -> u32 {
        self.globals.push(GlobalDecl { ty, mutable });
        (self.globals.len() - 1) as u32
    }

    pub fn add_function(&mut self, name: &str, signature: TypeIndex) -> u32 {
        self.functions.push(FunctionDecl {
            signature,
            name: Some(name.to_string()),
        });
        (self.functions.len() - 1) as u32
    }

    pub fn type_def(&self, index: TypeIndex) -> Option<&TypeDefinition> {
        self.types.get(index.index())
    }

    pub fn type_name(&self, index: TypeIndex) -> String {
        self.type_def(index)
            .and_then(|def| def.name.clone())
            .unwrap_or_else(|| index.to_string())
    }

    pub fn is_struct(&self, index: TypeIndex) -> bool {
        matches!(self.type_def(index), Some(TypeDefinition { kind: TypeKind::Struct { .. }, .. }))
    }

    pub fn is_array(&self, index: TypeIndex) -> bool {
        matches!(self.type_def(index), Some(TypeDefinition { kind: TypeKind::Array { .. }, .. }))
    }

    pub fn is_signature(&self, index: TypeIndex) -> bool {
        matches!(self.type_def(index), Some(TypeDefinition { kind: TypeKind::Func(_), .. }))
    }

    pub fn struct_field(&self, index: TypeIndex, field: u32) -> Option<FieldType> {
        match self.type_def(index)? {
            TypeDefinition {
                kind: TypeKind::Struct { fields },
                ..
            } => fields.get(field as usize).copied(),
            _ => None,
        }
    }

    pub fn struct_field_count(&self, index: TypeIndex) -> Option<usize> {
        match self.type_def(index)? {
            TypeDefinition {
                kind: TypeKind::Struct { fields },
                ..
            } => Some(fields.len()),
            _ => None,
        }
    }

    pub fn array_element(&self, index: TypeIndex) -> Option<FieldType> {
        match self.type_def(index)? {
            TypeDefinition {
                kind: TypeKind::Array { element },
                ..
            } => Some(*element),
            _ => None,
        }
    }

    pub fn global_type(&self, global: u32) -> Option<ValueType> {
        self.globals.get(global as usize).map(|g| g.ty)
    }

    pub fn function_signature(&self, function: u32) -> Option<TypeIndex> {
        self.functions.get(function as usize).map(|f| f.signature)
    }

    /// Declared supertype of `index`, if any
    pub fn supertype(&self, index: TypeIndex) -> Option<TypeIndex> {
        self.type_def(index).and_then(|def| def.supertype)
    }

    /// Check indices, supertype kinds and acyclicity of the declared hierarchy
    pub fn validate(&self) -> Result<()> {
        let count = self.types.len();
        for (i, def) in self.types.iter().enumerate() {
            if let Some(sup) = def.supertype {
                let Some(sup_def) = self.type_def(sup) else {
                    return Err(PassError::invalid_module(format!(
                        "type ${i} declares missing supertype {sup}"
                    )));
                };
                if std::mem::discriminant(&sup_def.kind) != std::mem::discriminant(&def.kind) {
                    return Err(PassError::invalid_module(format!(
                        "type ${i} and its supertype {sup} are of different kinds"
                    )));
                }
            }

            // A chain longer than the number of types must revisit a type.
            let mut steps = 0;
            let mut cursor = def.supertype;
            while let Some(sup) = cursor {
                steps += 1;
                if steps > count {
                    return Err(PassError::invalid_module(format!(
                        "supertype chain of type ${i} is cyclic"
                    )));
                }
                cursor = self.supertype(sup);
            }

            for ty in self.referenced_types(def) {
                self.validate_value_type(ty, &format!("type ${i}"))?;
            }
        }

        for (i, global) in self.globals.iter().enumerate() {
            self.validate_value_type(global.ty, &format!("global {i}"))?;
        }

        for (i, function) in self.functions.iter().enumerate() {
            if !self.is_signature(function.signature) {
                return Err(PassError::invalid_module(format!(
                    "function {i} has non-signature type {}",
                    function.signature
                )));
            }
        }
        Ok(())
    }

    fn referenced_types(&self, def: &TypeDefinition) -> Vec<ValueType> {
        match &def.kind {
            TypeKind::Struct { fields } => fields.iter().map(|f| f.storage.unpacked()).collect(),
            TypeKind::Array { element } => vec![element.storage.unpacked()],
            TypeKind::Func(sig) => sig.params.iter().chain(&sig.results).copied().collect(),
        }
    }

    pub fn validate_value_type(&self, ty: ValueType, context: &str) -> Result<()> {
        match ty {
            ValueType::Top | ValueType::Bottom => Err(PassError::invalid_module(format!(
                "{context} declares lattice sentinel {ty}"
            ))),
            ValueType::Ref { heap, .. } => match heap.defined_index() {
                Some(index) if self.type_def(index).is_none() => Err(PassError::invalid_module(
                    format!("{context} references missing type {index}"),
                )),
                _ => Ok(()),
            },
            ValueType::I32 => Ok(()),
        }
    }
}

/// Subtyping queries the type-flow pass consumes
///
/// Every query is pure. Nullability is ignored by the heap-level queries;
/// [`TypeOracle::is_subtype`] combines both.
pub trait TypeOracle {
    /// Nominal heap subtyping, `sub <: sup`
    fn is_heap_subtype(&self, sub: HeapType, sup: HeapType) -> bool;

    /// No non-null value inhabits both heap types
    fn heap_types_unrelated(&self, a: HeapType, b: HeapType) -> bool;

    /// Most precise type of a value known to satisfy both `a` and `b`
    fn intersection(&self, a: ValueType, b: ValueType) -> ValueType;

    /// Least upper bound: the narrowest type every value of `a` or `b` has
    fn union(&self, a: ValueType, b: ValueType) -> ValueType;

    /// Nullable, null-only type of the hierarchy `ty` belongs to
    fn null_sentinel(&self, ty: ValueType) -> ValueType;

    /// Values cross between the two types by an implicit boundary
    /// conversion and are observationally the same on both sides.
    fn is_implicitly_convertible(&self, from: ValueType, to: ValueType) -> bool;

    /// Full subtyping including nullability and the sentinels
    fn is_subtype(&self, sub: ValueType, sup: ValueType) -> bool {
        match (sub, sup) {
            (_, ValueType::Top) | (ValueType::Bottom, _) => true,
            (ValueType::Top, _) | (_, ValueType::Bottom) => false,
            (ValueType::I32, ValueType::I32) => true,
            (
                ValueType::Ref {
                    heap: sub_heap,
                    nullable: sub_nullable,
                },
                ValueType::Ref {
                    heap: sup_heap,
                    nullable: sup_nullable,
                },
            ) => (!sub_nullable || sup_nullable) && self.is_heap_subtype(sub_heap, sup_heap),
            _ => false,
        }
    }
}
