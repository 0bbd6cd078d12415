//! Nominal subtyping over a module's declared types

use super::{HeapType, ModuleContext, TypeIndex, TypeKind, TypeOracle, ValueType};

/// Which of the three disjoint heap hierarchies a heap type lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Hierarchy {
    Internal,
    Func,
    Extern,
}

/// [`TypeOracle`] backed by the declared types of a [`ModuleContext`]
///
/// Every declared type has at most one declared supertype, so the declared
/// hierarchy is a forest and least upper bounds are nearest common ancestors.
#[derive(Debug, Clone, Copy)]
pub struct ModuleLattice<'a> {
    module: &'a ModuleContext,
}

impl<'a> ModuleLattice<'a> {
    pub fn new(module: &'a ModuleContext) -> Self {
        Self { module }
    }

    pub fn module(&self) -> &'a ModuleContext {
        self.module
    }

    fn hierarchy(&self, heap: HeapType) -> Hierarchy {
        match heap {
            HeapType::Func | HeapType::NoFunc => Hierarchy::Func,
            HeapType::Extern | HeapType::NoExtern => Hierarchy::Extern,
            HeapType::Defined(index) | HeapType::Exact(index) if self.module.is_signature(index) => {
                Hierarchy::Func
            }
            _ => Hierarchy::Internal,
        }
    }

    fn hierarchy_bottom(hierarchy: Hierarchy) -> HeapType {
        match hierarchy {
            Hierarchy::Internal => HeapType::None,
            Hierarchy::Func => HeapType::NoFunc,
            Hierarchy::Extern => HeapType::NoExtern,
        }
    }

    /// Abstract category directly above a declared type
    fn abstract_kind(&self, index: TypeIndex) -> HeapType {
        match self.module.type_def(index).map(|def| &def.kind) {
            Some(TypeKind::Array { .. }) => HeapType::Array,
            Some(TypeKind::Func(_)) => HeapType::Func,
            _ => HeapType::Struct,
        }
    }

    /// Walk the declared supertype chain of `sub` looking for `sup`
    fn is_declared_subtype(&self, sub: TypeIndex, sup: TypeIndex) -> bool {
        let mut cursor = Some(sub);
        let mut steps = 0;
        while let Some(index) = cursor {
            if index == sup {
                return true;
            }
            steps += 1;
            if steps > self.module.types.len() {
                return false;
            }
            cursor = self.module.supertype(index);
        }
        false
    }

    /// Immediate parent in the combined declared/abstract hierarchy
    fn parent(&self, heap: HeapType) -> Option<HeapType> {
        match heap {
            HeapType::Exact(index) => Some(HeapType::Defined(index)),
            HeapType::Defined(index) => Some(
                self.module
                    .supertype(index)
                    .map(HeapType::Defined)
                    .unwrap_or_else(|| self.abstract_kind(index)),
            ),
            HeapType::I31 | HeapType::Struct | HeapType::Array => Some(HeapType::Eq),
            HeapType::Eq => Some(HeapType::Any),
            HeapType::None => Some(HeapType::Any),
            HeapType::NoFunc => Some(HeapType::Func),
            HeapType::NoExtern => Some(HeapType::Extern),
            HeapType::Any | HeapType::Func | HeapType::Extern => None,
        }
    }

    /// Least common supertype of two heap types, if they share a hierarchy
    fn common_supertype(&self, a: HeapType, b: HeapType) -> Option<HeapType> {
        if self.hierarchy(a) != self.hierarchy(b) {
            return None;
        }
        if self.is_heap_subtype(a, b) {
            return Some(b);
        }
        let mut cursor = Some(a);
        let mut steps = 0;
        while let Some(candidate) = cursor {
            if self.is_heap_subtype(b, candidate) {
                return Some(candidate);
            }
            steps += 1;
            if steps > self.module.types.len() + 6 {
                break;
            }
            cursor = self.parent(candidate);
        }
        None
    }
}

impl TypeOracle for ModuleLattice<'_> {
    fn is_heap_subtype(&self, sub: HeapType, sup: HeapType) -> bool {
        if sub == sup {
            return true;
        }
        if sub.is_bottom() {
            return self.hierarchy(sup) == self.hierarchy(sub);
        }
        match (sub, sup) {
            (_, HeapType::Any) => self.hierarchy(sub) == Hierarchy::Internal,
            (_, HeapType::Func) => self.hierarchy(sub) == Hierarchy::Func,
            (_, HeapType::Extern) => self.hierarchy(sub) == Hierarchy::Extern,
            (HeapType::I31 | HeapType::Struct | HeapType::Array, HeapType::Eq) => true,
            (HeapType::Defined(index) | HeapType::Exact(index), HeapType::Eq) => {
                !self.module.is_signature(index)
            }
            (HeapType::Defined(index) | HeapType::Exact(index), HeapType::Struct) => {
                self.module.is_struct(index)
            }
            (HeapType::Defined(index) | HeapType::Exact(index), HeapType::Array) => {
                self.module.is_array(index)
            }
            (HeapType::Defined(sub) | HeapType::Exact(sub), HeapType::Defined(sup)) => {
                self.is_declared_subtype(sub, sup)
            }
            _ => false,
        }
    }

    fn heap_types_unrelated(&self, a: HeapType, b: HeapType) -> bool {
        // Single declared supertypes: two types share a non-null instance
        // only if one is a subtype of the other.
        !self.is_heap_subtype(a, b) && !self.is_heap_subtype(b, a)
    }

    fn intersection(&self, a: ValueType, b: ValueType) -> ValueType {
        match (a, b) {
            (ValueType::Top, other) | (other, ValueType::Top) => other,
            (ValueType::Bottom, _) | (_, ValueType::Bottom) => ValueType::Bottom,
            (ValueType::I32, ValueType::I32) => ValueType::I32,
            (
                ValueType::Ref {
                    heap: a_heap,
                    nullable: a_nullable,
                },
                ValueType::Ref {
                    heap: b_heap,
                    nullable: b_nullable,
                },
            ) => {
                let nullable = a_nullable && b_nullable;
                if self.is_heap_subtype(a_heap, b_heap) {
                    ValueType::Ref { heap: a_heap, nullable }
                } else if self.is_heap_subtype(b_heap, a_heap) {
                    ValueType::Ref { heap: b_heap, nullable }
                } else if nullable && self.hierarchy(a_heap) == self.hierarchy(b_heap) {
                    // Only null satisfies both.
                    ValueType::nullable(Self::hierarchy_bottom(self.hierarchy(a_heap)))
                } else {
                    ValueType::Bottom
                }
            }
            _ => ValueType::Bottom,
        }
    }

    fn union(&self, a: ValueType, b: ValueType) -> ValueType {
        match (a, b) {
            (ValueType::Bottom, other) | (other, ValueType::Bottom) => other,
            (ValueType::Top, _) | (_, ValueType::Top) => ValueType::Top,
            (ValueType::I32, ValueType::I32) => ValueType::I32,
            (
                ValueType::Ref {
                    heap: a_heap,
                    nullable: a_nullable,
                },
                ValueType::Ref {
                    heap: b_heap,
                    nullable: b_nullable,
                },
            ) => match self.common_supertype(a_heap, b_heap) {
                Some(heap) => ValueType::Ref {
                    heap,
                    nullable: a_nullable || b_nullable,
                },
                None => ValueType::Top,
            },
            _ => ValueType::Top,
        }
    }

    fn null_sentinel(&self, ty: ValueType) -> ValueType {
        match ty {
            ValueType::Ref { heap, .. } => {
                ValueType::nullable(Self::hierarchy_bottom(self.hierarchy(heap)))
            }
            other => other,
        }
    }

    fn is_implicitly_convertible(&self, from: ValueType, to: ValueType) -> bool {
        matches!(
            (from.heap_type(), to.heap_type()),
            (Some(HeapType::Extern), Some(HeapType::Any)) | (Some(HeapType::Any), Some(HeapType::Extern))
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FieldType, FunctionSignature, StorageType};

    struct Zoo {
        module: ModuleContext,
        animal: TypeIndex,
        dog: TypeIndex,
        puppy: TypeIndex,
        cat: TypeIndex,
        bytes: TypeIndex,
        sig: TypeIndex,
    }

    fn zoo() -> Zoo {
        let mut module = ModuleContext::new();
        let field = FieldType::mutable(StorageType::Value(ValueType::I32));
        let animal = module.add_struct("Animal", vec![field], None);
        let dog = module.add_struct("Dog", vec![field, field], Some(animal));
        let puppy = module.add_struct("Puppy", vec![field, field], Some(dog));
        let cat = module.add_struct("Cat", vec![field], Some(animal));
        let bytes = module.add_array("Bytes", FieldType::mutable(StorageType::I8), None);
        let sig = module.add_signature("sig", FunctionSignature::default());
        Zoo {
            module,
            animal,
            dog,
            puppy,
            cat,
            bytes,
            sig,
        }
    }

    #[test]
    fn test_nominal_subtyping() {
        let z = zoo();
        let lattice = ModuleLattice::new(&z.module);
        let d = HeapType::Defined;
        assert!(lattice.is_heap_subtype(d(z.puppy), d(z.animal)));
        assert!(lattice.is_heap_subtype(d(z.dog), HeapType::Struct));
        assert!(lattice.is_heap_subtype(d(z.dog), HeapType::Any));
        assert!(!lattice.is_heap_subtype(d(z.animal), d(z.dog)));
        assert!(lattice.is_heap_subtype(d(z.bytes), HeapType::Array));
        assert!(!lattice.is_heap_subtype(d(z.sig), HeapType::Any));
        assert!(lattice.is_heap_subtype(HeapType::None, d(z.cat)));
        assert!(!lattice.is_heap_subtype(HeapType::None, HeapType::Extern));
    }

    #[test]
    fn test_exact_types() {
        let z = zoo();
        let lattice = ModuleLattice::new(&z.module);
        assert!(lattice.is_heap_subtype(HeapType::Exact(z.dog), HeapType::Defined(z.animal)));
        assert!(!lattice.is_heap_subtype(HeapType::Defined(z.dog), HeapType::Exact(z.dog)));
        // An exact Dog can never be a Puppy.
        assert!(lattice.heap_types_unrelated(HeapType::Exact(z.dog), HeapType::Defined(z.puppy)));
        assert!(!lattice.heap_types_unrelated(HeapType::Defined(z.dog), HeapType::Defined(z.puppy)));
    }

    #[test]
    fn test_unrelated() {
        let z = zoo();
        let lattice = ModuleLattice::new(&z.module);
        assert!(lattice.heap_types_unrelated(HeapType::Defined(z.cat), HeapType::Defined(z.dog)));
        assert!(lattice.heap_types_unrelated(HeapType::Struct, HeapType::Array));
        assert!(lattice.heap_types_unrelated(HeapType::Any, HeapType::Extern));
        assert!(!lattice.heap_types_unrelated(HeapType::Eq, HeapType::Defined(z.cat)));
    }

    #[test]
    fn test_union_is_nearest_common_ancestor() {
        let z = zoo();
        let lattice = ModuleLattice::new(&z.module);
        let dog = ValueType::non_null(HeapType::Exact(z.dog));
        let cat = ValueType::nullable(HeapType::Defined(z.cat));
        assert_eq!(
            lattice.union(dog, cat),
            ValueType::nullable(HeapType::Defined(z.animal))
        );
        let puppy = ValueType::non_null(HeapType::Defined(z.puppy));
        assert_eq!(
            lattice.union(puppy, ValueType::non_null(HeapType::Defined(z.dog))),
            ValueType::non_null(HeapType::Defined(z.dog))
        );
        let bytes = ValueType::non_null(HeapType::Defined(z.bytes));
        assert_eq!(lattice.union(dog, bytes), ValueType::non_null(HeapType::Eq));
        assert_eq!(
            lattice.union(dog, ValueType::non_null(HeapType::Extern)),
            ValueType::Top
        );
        assert_eq!(lattice.union(ValueType::Bottom, dog), dog);
        assert_eq!(lattice.union(ValueType::Top, dog), ValueType::Top);
    }

    #[test]
    fn test_union_of_exact_same_type() {
        let z = zoo();
        let lattice = ModuleLattice::new(&z.module);
        let exact = ValueType::non_null(HeapType::Exact(z.dog));
        assert_eq!(lattice.union(exact, exact), exact);
        assert_eq!(
            lattice.union(exact, ValueType::nullable(HeapType::Exact(z.puppy))),
            ValueType::nullable(HeapType::Defined(z.dog))
        );
    }

    #[test]
    fn test_intersection() {
        let z = zoo();
        let lattice = ModuleLattice::new(&z.module);
        let any = ValueType::nullable(HeapType::Any);
        let dog = ValueType::non_null(HeapType::Defined(z.dog));
        assert_eq!(lattice.intersection(any, dog), dog);
        assert_eq!(lattice.intersection(ValueType::Top, dog), dog);
        let cat = ValueType::nullable(HeapType::Defined(z.cat));
        assert_eq!(
            lattice.intersection(cat, dog.as_nullable()),
            ValueType::nullable(HeapType::None)
        );
        assert_eq!(lattice.intersection(cat, dog), ValueType::Bottom);
        assert_eq!(
            lattice.intersection(any, ValueType::nullable(HeapType::Extern)),
            ValueType::Bottom
        );
    }

    #[test]
    fn test_null_sentinel() {
        let z = zoo();
        let lattice = ModuleLattice::new(&z.module);
        assert_eq!(
            lattice.null_sentinel(ValueType::non_null(HeapType::Defined(z.dog))),
            ValueType::nullable(HeapType::None)
        );
        assert_eq!(
            lattice.null_sentinel(ValueType::nullable(HeapType::Defined(z.sig))),
            ValueType::nullable(HeapType::NoFunc)
        );
        assert_eq!(
            lattice.null_sentinel(ValueType::nullable(HeapType::Extern)),
            ValueType::nullable(HeapType::NoExtern)
        );
    }

    #[test]
    fn test_full_subtyping_respects_nullability() {
        let z = zoo();
        let lattice = ModuleLattice::new(&z.module);
        let dog = HeapType::Defined(z.dog);
        assert!(lattice.is_subtype(ValueType::non_null(dog), ValueType::nullable(dog)));
        assert!(!lattice.is_subtype(ValueType::nullable(dog), ValueType::non_null(dog)));
        assert!(lattice.is_subtype(ValueType::Bottom, ValueType::non_null(dog)));
        assert!(lattice.is_subtype(ValueType::non_null(dog), ValueType::Top));
    }

    #[test]
    fn test_implicit_conversion_between_tops() {
        let z = zoo();
        let lattice = ModuleLattice::new(&z.module);
        let ext = ValueType::nullable(HeapType::Extern);
        let any = ValueType::nullable(HeapType::Any);
        assert!(lattice.is_implicitly_convertible(ext, any));
        assert!(!lattice.is_implicitly_convertible(ext, ValueType::nullable(HeapType::Eq)));
    }
}
