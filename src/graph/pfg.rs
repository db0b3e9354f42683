// Copyright (c) 2024 <Wei Li>.
//
// This source code is licensed under the GNU license found in the
// LICENSE file in the root directory of this source tree.

//! Pointer flow graph.
//!
//! Pointers are structural and context-insensitive: a variable, a static
//! field, an instance field qualified by its base pointer, or the element
//! slot of an array pointer. Edges record how values move between pointers
//! and are only ever inserted; queries walk in-edges on demand.

use std::collections::{HashMap, HashSet};

use petgraph::graph::{EdgeIndex, NodeIndex};
use petgraph::stable_graph::StableDiGraph;
use petgraph::visit::EdgeRef;
use petgraph::Direction;

use crate::contr::ContrValue;
use crate::model::hierarchy::FieldId;
use crate::model::ir::VarId;
use crate::model::method::MethodId;
use crate::model::ty::TypeId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PointerId(pub u32);

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum PointerKind {
    Var(VarId),
    StaticField(FieldId),
    InstanceField { base: PointerId, field: FieldId },
    ArrayElem { base: PointerId },
}

struct PointerData {
    kind: PointerKind,
    ty: Option<TypeId>,
    method: Option<MethodId>,
}

/// Interner for pointers, the single source of pointer identity.
#[derive(Default)]
pub struct PointerTable {
    data: Vec<PointerData>,
    index: HashMap<PointerKind, PointerId>,
}

impl PointerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn intern(
        &mut self,
        kind: PointerKind,
        ty: Option<TypeId>,
        method: Option<MethodId>,
    ) -> PointerId {
        if let Some(id) = self.index.get(&kind) {
            return *id;
        }
        let id = PointerId(self.data.len() as u32);
        self.index.insert(kind.clone(), id);
        self.data.push(PointerData { kind, ty, method });
        id
    }

    pub fn get(&self, kind: &PointerKind) -> Option<PointerId> {
        self.index.get(kind).copied()
    }

    pub fn kind(&self, p: PointerId) -> &PointerKind {
        &self.data[p.0 as usize].kind
    }

    pub fn ty(&self, p: PointerId) -> Option<TypeId> {
        self.data[p.0 as usize].ty
    }

    pub fn method(&self, p: PointerId) -> Option<MethodId> {
        self.data[p.0 as usize].method
    }

    /// The variable behind a pointer, if it is variable-shaped.
    pub fn as_var(&self, p: PointerId) -> Option<VarId> {
        match self.kind(p) {
            PointerKind::Var(v) => Some(*v),
            _ => None,
        }
    }
}

/// The way a value reaches a pointer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FlowKind {
    /// Allocation site.
    New,
    /// Seeded descriptor (parameter, receiver, literal, behavior result).
    NewContr,
    LocalAssign,
    Cast,
    StaticLoad,
    StaticStore,
    InstanceLoad,
    InstanceStore,
    ElementStore,
    /// Callee summary applied at a call site.
    SummaryAssign,
    /// Declared taint transfer.
    Other,
}

/// What an allocation-shaped edge carries.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum AllocSource {
    /// A real `new T` site.
    Site { ty: TypeId },
    /// A class-literal constant.
    ClassLiteral { ty: TypeId },
    /// A mock object carrying a symbolic descriptor.
    ContrSeed { value: ContrValue, ty: Option<TypeId> },
}

/// A conditional window a store was recorded under. Stores inside a window
/// are invisible to queries outside `(start, end)` of the same method.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct IfRange {
    pub start: u32,
    pub end: u32,
    pub method: MethodId,
}

#[derive(Clone, Debug)]
pub struct PfgEdge {
    pub kind: FlowKind,
    pub src: Option<PointerId>,
    pub alloc: Option<AllocSource>,
    /// Cast target or declared transfer result type.
    pub special_ty: Option<TypeId>,
    /// Transfer edges that mint a fresh value rather than forwarding one.
    pub new_transfer: bool,
    pub line: u32,
    pub if_range: Option<IfRange>,
}

impl PfgEdge {
    pub fn flow(kind: FlowKind, src: PointerId, line: u32) -> Self {
        PfgEdge {
            kind,
            src: Some(src),
            alloc: None,
            special_ty: None,
            new_transfer: false,
            line,
            if_range: None,
        }
    }

    pub fn alloc(kind: FlowKind, alloc: AllocSource, line: u32) -> Self {
        PfgEdge {
            kind,
            src: None,
            alloc: Some(alloc),
            special_ty: None,
            new_transfer: false,
            line,
            if_range: None,
        }
    }
}

#[derive(Clone, PartialEq, Eq, Hash)]
struct EdgeKey {
    tgt: PointerId,
    kind: FlowKind,
    src: Option<PointerId>,
    alloc: Option<AllocSource>,
    special_ty: Option<TypeId>,
}

/// The pointer flow graph proper. Allocation edges are self-loops on their
/// target so that every edge has two endpoints.
#[derive(Default)]
pub struct Pfg {
    graph: StableDiGraph<PointerId, PfgEdge>,
    nodes: HashMap<PointerId, NodeIndex>,
    seen: HashSet<EdgeKey>,
    field_stores: HashMap<FieldId, Vec<EdgeIndex>>,
    array_stores: Vec<EdgeIndex>,
}

impl Pfg {
    pub fn new() -> Self {
        Self::default()
    }

    fn node(&mut self, p: PointerId) -> NodeIndex {
        if let Some(n) = self.nodes.get(&p) {
            return *n;
        }
        let n = self.graph.add_node(p);
        self.nodes.insert(p, n);
        n
    }

    /// Inserts an edge into `tgt`. Returns false if an identical edge is
    /// already present.
    pub fn add_edge(&mut self, tgt: PointerId, edge: PfgEdge) -> bool {
        let key = EdgeKey {
            tgt,
            kind: edge.kind,
            src: edge.src,
            alloc: edge.alloc.clone(),
            special_ty: edge.special_ty,
        };
        if !self.seen.insert(key) {
            return false;
        }
        let tgt_n = self.node(tgt);
        let src_n = match edge.src {
            Some(src) => self.node(src),
            None => tgt_n,
        };
        self.graph.add_edge(src_n, tgt_n, edge);
        true
    }

    /// Registers the latest store into `tgt` against its field for alias
    /// matching. Pointer kinds live in the interner, so the caller names
    /// the field.
    pub fn note_field_store(&mut self, field: FieldId, tgt: PointerId) {
        if let Some(idx) = self.last_in_edge_index(tgt) {
            self.field_stores.entry(field).or_default().push(idx);
        }
    }

    /// Registers the latest store into `tgt` as an array element store.
    pub fn note_array_store(&mut self, tgt: PointerId) {
        if let Some(idx) = self.last_in_edge_index(tgt) {
            self.array_stores.push(idx);
        }
    }

    fn last_in_edge_index(&self, tgt: PointerId) -> Option<EdgeIndex> {
        let n = *self.nodes.get(&tgt)?;
        self.graph
            .edges_directed(n, Direction::Incoming)
            .map(|e| e.id())
            .last()
    }

    /// In-edges of a pointer, most recent first.
    pub fn in_edges(&self, p: PointerId) -> Vec<PfgEdge> {
        match self.nodes.get(&p) {
            Some(n) => self
                .graph
                .edges_directed(*n, Direction::Incoming)
                .map(|e| e.weight().clone())
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn has_in_edges(&self, p: PointerId) -> bool {
        self.nodes
            .get(&p)
            .map_or(false, |n| {
                self.graph
                    .edges_directed(*n, Direction::Incoming)
                    .next()
                    .is_some()
            })
    }

    pub fn in_degree(&self, p: PointerId) -> usize {
        self.nodes.get(&p).map_or(0, |n| {
            self.graph.edges_directed(*n, Direction::Incoming).count()
        })
    }

    /// Flow successors of a pointer, excluding allocation self-loops.
    pub fn out_targets(&self, p: PointerId) -> Vec<PointerId> {
        match self.nodes.get(&p) {
            Some(n) => self
                .graph
                .edges_directed(*n, Direction::Outgoing)
                .filter(|e| e.source() != e.target())
                .map(|e| self.graph[e.target()])
                .collect(),
            None => Vec::new(),
        }
    }

    /// Drops every seeded-descriptor in-edge of `p`. Used when a parameter
    /// default must give way to observed call-site values.
    pub fn remove_contr_seeds(&mut self, p: PointerId) {
        let n = match self.nodes.get(&p) {
            Some(n) => *n,
            None => return,
        };
        let doomed: Vec<EdgeIndex> = self
            .graph
            .edges_directed(n, Direction::Incoming)
            .filter(|e| e.weight().kind == FlowKind::NewContr)
            .map(|e| e.id())
            .collect();
        for idx in doomed {
            if let Some(edge) = self.graph.edge_weight(idx) {
                self.seen.remove(&EdgeKey {
                    tgt: p,
                    kind: edge.kind,
                    src: edge.src,
                    alloc: edge.alloc.clone(),
                    special_ty: edge.special_ty,
                });
            }
            self.graph.remove_edge(idx);
        }
    }

    /// Store edges recorded against `field`, as (edge, target pointer).
    pub fn field_store_edges(&self, field: FieldId) -> Vec<(PfgEdge, PointerId)> {
        self.store_edges(self.field_stores.get(&field).map_or(&[][..], |v| v))
    }

    /// Every array element store recorded so far.
    pub fn array_store_edges(&self) -> Vec<(PfgEdge, PointerId)> {
        self.store_edges(&self.array_stores)
    }

    fn store_edges(&self, indices: &[EdgeIndex]) -> Vec<(PfgEdge, PointerId)> {
        indices
            .iter()
            .filter_map(|idx| {
                let edge = self.graph.edge_weight(*idx)?;
                let (_, tgt) = self.graph.edge_endpoints(*idx)?;
                Some((edge.clone(), self.graph[tgt]))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_edges_collapse() {
        let mut pfg = Pfg::new();
        let a = PointerId(0);
        let b = PointerId(1);
        assert!(pfg.add_edge(b, PfgEdge::flow(FlowKind::LocalAssign, a, 3)));
        assert!(!pfg.add_edge(b, PfgEdge::flow(FlowKind::LocalAssign, a, 7)));
        assert_eq!(pfg.in_edges(b).len(), 1);
        assert_eq!(pfg.out_targets(a), vec![b]);
    }

    #[test]
    fn seed_removal_allows_reinsertion() {
        let mut pfg = Pfg::new();
        let p = PointerId(0);
        let seed = PfgEdge::alloc(
            FlowKind::NewContr,
            AllocSource::ContrSeed {
                value: ContrValue::param(0),
                ty: None,
            },
            0,
        );
        assert!(pfg.add_edge(p, seed.clone()));
        pfg.remove_contr_seeds(p);
        assert!(!pfg.has_in_edges(p));
        assert!(pfg.add_edge(p, seed));
    }

    #[test]
    fn alloc_edges_are_not_flow_successors() {
        let mut pfg = Pfg::new();
        let p = PointerId(4);
        pfg.add_edge(
            p,
            PfgEdge::alloc(FlowKind::New, AllocSource::Site { ty: TypeId(0) }, 1),
        );
        assert!(pfg.out_targets(p).is_empty());
        assert_eq!(pfg.in_edges(p).len(), 1);
    }
}
