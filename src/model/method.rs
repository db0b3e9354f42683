// Copyright (c) 2024 <Wei Li>.
//
// This source code is licensed under the GNU license found in the
// LICENSE file in the root directory of this source tree.

//! Method table: signatures, declared metadata and bodies.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::hierarchy::ClassId;
use super::ir::MethodIr;
use super::knowledge::{Behavior, TaintTransfer};
use super::ty::TypeId;

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MethodId(pub u32);

#[derive(Clone, Serialize, Deserialize)]
pub struct MethodSig {
    pub class: ClassId,
    pub name: String,
    pub ret: TypeId,
    pub params: Vec<TypeId>,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct Method {
    pub sig: MethodSig,
    /// Cached `ret name(p0,p1)` form, the dispatch key.
    pub subsig: String,
    pub is_static: bool,
    pub is_abstract: bool,
    pub is_private: bool,
    pub body: Option<MethodIr>,

    // Declared metadata, applied from the knowledge configuration.
    pub is_source: bool,
    /// Required-taint vector of a sink, in call-key space
    /// (`-1` receiver, `k >= 0` argument k).
    pub sink: Option<Vec<i32>>,
    /// When set on a sink, skip calls whose receiver origin is a field with
    /// an `extends`-bounded generic signature (a frequent false positive of
    /// the dynamic-instantiation sink).
    pub sink_filter_extends_generic: bool,
    pub is_ignored: bool,
    pub transfers: Vec<TaintTransfer>,
    pub behavior: Option<Behavior>,
    /// A registered proxy invocation-handler method.
    pub is_invoke: bool,
}

impl Method {
    pub fn param_count(&self) -> usize {
        self.sig.params.len()
    }

    pub fn is_sink(&self) -> bool {
        self.sink.is_some()
    }

    pub fn is_transfer(&self) -> bool {
        !self.transfers.is_empty()
    }

    pub fn has_behavior(&self) -> bool {
        self.behavior.is_some()
    }
}

#[derive(Default, Serialize, Deserialize)]
pub struct Methods {
    methods: Vec<Method>,
    #[serde(skip)]
    by_subsig: HashMap<(ClassId, String), MethodId>,
}

impl Methods {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, method: Method) -> MethodId {
        let id = MethodId(self.methods.len() as u32);
        self.by_subsig
            .insert((method.sig.class, method.subsig.clone()), id);
        self.methods.push(method);
        id
    }

    pub fn rebuild_index(&mut self) {
        self.by_subsig = self
            .methods
            .iter()
            .enumerate()
            .map(|(i, m)| ((m.sig.class, m.subsig.clone()), MethodId(i as u32)))
            .collect();
    }

    pub fn method(&self, id: MethodId) -> &Method {
        &self.methods[id.0 as usize]
    }

    pub fn method_mut(&mut self, id: MethodId) -> &mut Method {
        &mut self.methods[id.0 as usize]
    }

    pub fn by_subsig(&self, class: ClassId, subsig: &str) -> Option<MethodId> {
        self.by_subsig.get(&(class, subsig.to_string())).copied()
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (MethodId, &Method)> {
        self.methods
            .iter()
            .enumerate()
            .map(|(i, m)| (MethodId(i as u32), m))
    }
}

/// Renders the `ret name(p0,p1)` subsignature, the per-class dispatch key.
pub fn render_subsig(ret: &str, name: &str, params: &[&str]) -> String {
    format!("{} {}({})", ret, name, params.join(","))
}
