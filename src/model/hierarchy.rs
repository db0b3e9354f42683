// Copyright (c) 2024 <Wei Li>.
//
// This source code is licensed under the GNU license found in the
// LICENSE file in the root directory of this source tree.

//! Class hierarchy of the analyzed program: classes, fields, virtual
//! dispatch and subclass enumeration.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::method::{MethodId, Methods};
use super::ty::TypeId;

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClassId(pub u32);

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FieldId(pub u32);

#[derive(Clone, Serialize, Deserialize)]
pub struct Class {
    pub name: String,
    /// The class type in the type system, set when the type is interned.
    pub ty: TypeId,
    pub superclass: Option<ClassId>,
    pub interfaces: Vec<ClassId>,
    pub is_interface: bool,
    pub is_abstract: bool,
    pub is_serializable: bool,
    /// All methods of this class are excluded from tracking.
    pub methods_ignored: bool,
    pub fields: Vec<FieldId>,
    /// Declared methods keyed by subsignature, the dispatch table.
    pub methods: HashMap<String, MethodId>,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct Field {
    pub class: ClassId,
    pub name: String,
    pub ty: TypeId,
    pub is_static: bool,
    /// Raw generic signature, when one was declared (`Class<? extends T>`).
    pub generic_signature: Option<String>,
}

#[derive(Default, Serialize, Deserialize)]
pub struct ClassHierarchy {
    classes: Vec<Class>,
    fields: Vec<Field>,
    #[serde(skip)]
    by_name: HashMap<String, ClassId>,
}

impl ClassHierarchy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_class(&mut self, class: Class) -> ClassId {
        let id = ClassId(self.classes.len() as u32);
        self.by_name.insert(class.name.clone(), id);
        self.classes.push(class);
        id
    }

    pub fn add_field(&mut self, field: Field) -> FieldId {
        let id = FieldId(self.fields.len() as u32);
        let class = field.class;
        self.fields.push(field);
        self.classes[class.0 as usize].fields.push(id);
        id
    }

    pub fn rebuild_index(&mut self) {
        self.by_name = self
            .classes
            .iter()
            .enumerate()
            .map(|(i, c)| (c.name.clone(), ClassId(i as u32)))
            .collect();
    }

    pub fn class(&self, id: ClassId) -> &Class {
        &self.classes[id.0 as usize]
    }

    pub fn class_mut(&mut self, id: ClassId) -> &mut Class {
        &mut self.classes[id.0 as usize]
    }

    pub fn field(&self, id: FieldId) -> &Field {
        &self.fields[id.0 as usize]
    }

    pub fn by_name(&self, name: &str) -> Option<ClassId> {
        self.by_name.get(name).copied()
    }

    pub fn classes(&self) -> impl Iterator<Item = (ClassId, &Class)> {
        self.classes
            .iter()
            .enumerate()
            .map(|(i, c)| (ClassId(i as u32), c))
    }

    /// The root of the hierarchy has no superclass and no interfaces.
    pub fn is_root_class(&self, id: ClassId) -> bool {
        let c = self.class(id);
        c.superclass.is_none() && c.interfaces.is_empty() && !c.is_interface
    }

    /// Returns true if `sub` equals `sup` or transitively extends or
    /// implements it.
    pub fn is_subclass(&self, sup: ClassId, sub: ClassId) -> bool {
        if sup == sub {
            return true;
        }
        let c = self.class(sub);
        if let Some(s) = c.superclass {
            if self.is_subclass(sup, s) {
                return true;
            }
        }
        c.interfaces.iter().any(|i| self.is_subclass(sup, *i))
    }

    /// All classes at or below `id`, in declaration order.
    pub fn subclasses_of(&self, id: ClassId) -> Vec<ClassId> {
        self.classes
            .iter()
            .enumerate()
            .filter(|(i, _)| self.is_subclass(id, ClassId(*i as u32)))
            .map(|(i, _)| ClassId(i as u32))
            .collect()
    }

    /// Looks a field up by name, walking up the superclass chain.
    pub fn field_of(&self, class: ClassId, name: &str) -> Option<FieldId> {
        let mut cur = Some(class);
        while let Some(c) = cur {
            let class = self.class(c);
            for f in &class.fields {
                if self.field(*f).name == name {
                    return Some(*f);
                }
            }
            cur = class.superclass;
        }
        None
    }

    /// Virtual dispatch: resolves `subsig` starting from `class` and walking
    /// up the superclass chain, skipping abstract declarations.
    pub fn dispatch(&self, methods: &Methods, class: ClassId, subsig: &str) -> Option<MethodId> {
        let mut cur = Some(class);
        while let Some(c) = cur {
            let class = self.class(c);
            if let Some(m) = class.methods.get(subsig) {
                if !methods.method(*m).is_abstract {
                    return Some(*m);
                }
            }
            cur = class.superclass;
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use crate::model::testing::small_model;

    #[test]
    fn dispatch_walks_up_the_superclass_chain() {
        let acx = small_model();
        let string = acx.hierarchy.by_name("java.lang.String").unwrap();
        // String does not declare hashCode in the small model; Object does.
        let resolved = acx
            .hierarchy
            .dispatch(&acx.methods, string, "int hashCode()")
            .expect("dispatch reaches Object");
        assert_eq!(acx.methods.method(resolved).sig.name, "hashCode");
    }
}
