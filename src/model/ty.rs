// Copyright (c) 2024 <Wei Li>.
//
// This source code is licensed under the GNU license found in the
// LICENSE file in the root directory of this source tree.

//! The type system of the analyzed program.
//!
//! Types are interned once by the model builder and referred to by
//! [`TypeId`] everywhere else. Subtype queries that depend on the class
//! hierarchy take it as an explicit collaborator; the convenience wrappers
//! live on [`crate::model::AnalysisContext`].

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::hierarchy::{ClassHierarchy, ClassId};

/// The unique identifier of an interned type.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TypeId(pub u32);

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TypeKind {
    /// `int`, `boolean`, ... Never tracked by the value model.
    Primitive,
    /// The type of the `null` literal.
    Null,
    Class(ClassId),
    Array { elem: TypeId },
}

#[derive(Default, Serialize, Deserialize)]
pub struct TypeSystem {
    names: Vec<String>,
    kinds: Vec<TypeKind>,
    #[serde(skip)]
    by_name: HashMap<String, TypeId>,
}

impl TypeSystem {
    pub fn new() -> Self {
        Self::default()
    }

    /// Interns a type under `name`. Re-interning an existing name returns
    /// the previously assigned id.
    pub fn intern(&mut self, name: &str, kind: TypeKind) -> TypeId {
        if let Some(id) = self.by_name.get(name) {
            return *id;
        }
        let id = TypeId(self.names.len() as u32);
        self.names.push(name.to_string());
        self.kinds.push(kind);
        self.by_name.insert(name.to_string(), id);
        id
    }

    /// Rebuilds the name index after deserialization.
    pub fn rebuild_index(&mut self) {
        self.by_name = self
            .names
            .iter()
            .enumerate()
            .map(|(i, n)| (n.clone(), TypeId(i as u32)))
            .collect();
    }

    pub fn kind(&self, ty: TypeId) -> &TypeKind {
        &self.kinds[ty.0 as usize]
    }

    pub fn name(&self, ty: TypeId) -> &str {
        &self.names[ty.0 as usize]
    }

    pub fn by_name(&self, name: &str) -> Option<TypeId> {
        self.by_name.get(name).copied()
    }

    pub fn is_primitive(&self, ty: TypeId) -> bool {
        matches!(self.kind(ty), TypeKind::Primitive)
    }

    pub fn array_elem(&self, ty: TypeId) -> Option<TypeId> {
        match self.kind(ty) {
            TypeKind::Array { elem } => Some(*elem),
            _ => None,
        }
    }

    pub fn is_array(&self, ty: TypeId) -> bool {
        matches!(self.kind(ty), TypeKind::Array { .. })
    }

    /// Returns true if `sub` is a subtype of `sup` (reflexive).
    ///
    /// `null` is a subtype of every reference type; arrays are covariant in
    /// their element type; class subtyping follows the hierarchy.
    pub fn is_subtype(&self, hierarchy: &ClassHierarchy, sup: TypeId, sub: TypeId) -> bool {
        if sup == sub {
            return true;
        }
        match (self.kind(sup), self.kind(sub)) {
            (_, TypeKind::Null) => !self.is_primitive(sup),
            (TypeKind::Class(sup_c), TypeKind::Class(sub_c)) => {
                hierarchy.is_subclass(*sup_c, *sub_c)
            }
            (TypeKind::Class(sup_c), TypeKind::Array { .. }) => {
                // Arrays are subtypes of the root object type only.
                hierarchy.is_root_class(*sup_c)
            }
            (TypeKind::Array { elem: sup_e }, TypeKind::Array { elem: sub_e }) => {
                self.is_subtype(hierarchy, *sup_e, *sub_e)
            }
            _ => false,
        }
    }

    /// Two types are compatible when either is a subtype of the other.
    pub fn compatible(&self, hierarchy: &ClassHierarchy, a: TypeId, b: TypeId) -> bool {
        self.is_subtype(hierarchy, a, b) || self.is_subtype(hierarchy, b, a)
    }

    /// The argument-compatibility test used by reflective method lookup.
    ///
    /// With an `expand` type (a single array-typed contribution standing for
    /// the whole argument list), every parameter must be compatible with the
    /// expanded element type. Otherwise the collected argument types must
    /// match the parameter list position by position.
    pub fn all_subtype(
        &self,
        hierarchy: &ClassHierarchy,
        expand: Option<TypeId>,
        args: &[TypeId],
        params: &[TypeId],
    ) -> bool {
        if let Some(expand_ty) = expand {
            return params
                .iter()
                .all(|p| self.compatible(hierarchy, *p, expand_ty));
        }
        if args.is_empty() {
            return true;
        }
        args.len() == params.len()
            && args
                .iter()
                .zip(params.iter())
                .all(|(a, p)| self.compatible(hierarchy, *p, *a))
    }
}

#[cfg(test)]
mod tests {
    use crate::model::testing::small_model;

    #[test]
    fn subtype_is_reflexive_and_follows_hierarchy() {
        let acx = small_model();
        let object = acx.types.by_name("java.lang.Object").unwrap();
        let string = acx.types.by_name("java.lang.String").unwrap();
        assert!(acx.is_subtype(object, object));
        assert!(acx.is_subtype(object, string));
        assert!(!acx.is_subtype(string, object));
    }

    #[test]
    fn null_is_subtype_of_reference_types_only() {
        let acx = small_model();
        let null_ty = acx.types.by_name("null-type").unwrap();
        let int_ty = acx.types.by_name("int").unwrap();
        let string = acx.types.by_name("java.lang.String").unwrap();
        assert!(acx.is_subtype(string, null_ty));
        assert!(!acx.is_subtype(int_ty, null_ty));
    }
}
