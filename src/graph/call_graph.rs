// Copyright (c) 2024 <Wei Li>.
//
// This source code is licensed under the GNU license found in the
// LICENSE file in the root directory of this source tree.

//! Taint-annotated call graph.
//!
//! Each edge records the symbolic value of every call-site slot (receiver
//! first, then arguments) next to its integer lattice projection. The
//! collector walks these edges backwards from sinks.

use std::collections::{BTreeSet, HashMap, HashSet};

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;

use crate::contr::ContrValue;
use crate::model::ir::CallKind;
use crate::model::method::MethodId;
use crate::model::ty::TypeId;

/// The call site an edge originates from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CallSiteRef {
    pub caller: MethodId,
    pub stmt_idx: usize,
    pub line: u32,
    pub kind: CallKind,
    /// Declared target of the invocation, before dispatch.
    pub ref_method: Option<MethodId>,
}

/// A caller-side verification constraint recorded while building an edge.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EdgeFilter {
    /// The dispatch name was compared against a constant: callers must pass
    /// a matching name through slot `param`.
    Name { name: String, param: usize },
    /// The dispatch name is rooted in a caller slot; callers must supply a
    /// name that matches the callee.
    Edge { key: ContrValue },
}

#[derive(Clone, Debug)]
pub struct CallEdge {
    pub callsite: CallSiteRef,
    pub callee: MethodId,
    /// Symbolic value per slot: receiver, then arguments.
    pub contr: Vec<ContrValue>,
    /// Integer projection of `contr`, the persisted form.
    pub int_contr: Vec<i32>,
    /// Declared type per slot, when known.
    pub types: Vec<Option<TypeId>>,
    /// Slots whose value went through an explicit cast.
    pub casted: BTreeSet<usize>,
    pub filter_by_caller: Option<EdgeFilter>,
}

impl CallEdge {
    pub fn new(
        callsite: CallSiteRef,
        callee: MethodId,
        contr: Vec<ContrValue>,
        types: Vec<Option<TypeId>>,
    ) -> Self {
        let int_contr = contr.iter().map(ContrValue::call_key).collect();
        CallEdge {
            callsite,
            callee,
            contr,
            int_contr,
            types,
            casted: BTreeSet::new(),
            filter_by_caller: None,
        }
    }

    pub fn set_casted(&mut self, slot: usize) {
        self.casted.insert(slot);
    }

    pub fn is_casted(&self, slot: usize) -> bool {
        self.casted.contains(&slot)
    }

    pub fn caller(&self) -> MethodId {
        self.callsite.caller
    }
}

#[derive(Default)]
pub struct CallGraph {
    graph: DiGraph<MethodId, CallEdge>,
    nodes: HashMap<MethodId, NodeIndex>,
    reachable: HashSet<MethodId>,
}

impl CallGraph {
    pub fn new() -> Self {
        Self::default()
    }

    fn node(&mut self, m: MethodId) -> NodeIndex {
        if let Some(n) = self.nodes.get(&m) {
            return *n;
        }
        let n = self.graph.add_node(m);
        self.nodes.insert(m, n);
        n
    }

    pub fn add_reachable(&mut self, m: MethodId) -> bool {
        self.node(m);
        self.reachable.insert(m)
    }

    pub fn reachable_count(&self) -> usize {
        self.reachable.len()
    }

    /// Adds a call edge. Self-calls are rejected, as is a duplicate of an
    /// existing edge with the same caller and integer taint vector.
    pub fn add_edge(&mut self, edge: CallEdge) -> bool {
        if edge.caller() == edge.callee {
            return false;
        }
        let callee_n = self.node(edge.callee);
        let duplicate = self
            .graph
            .edges_directed(callee_n, Direction::Incoming)
            .any(|e| {
                e.weight().caller() == edge.caller()
                    && e.weight().int_contr == edge.int_contr
            });
        if duplicate {
            return false;
        }
        let caller_n = self.node(edge.caller());
        self.graph.add_edge(caller_n, callee_n, edge);
        true
    }

    pub fn edges_in_to(&self, m: MethodId) -> Vec<&CallEdge> {
        match self.nodes.get(&m) {
            Some(n) => self
                .graph
                .edges_directed(*n, Direction::Incoming)
                .map(|e| e.weight())
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn edges_out_of(&self, m: MethodId) -> Vec<&CallEdge> {
        match self.nodes.get(&m) {
            Some(n) => self
                .graph
                .edges_directed(*n, Direction::Outgoing)
                .map(|e| e.weight())
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn edges(&self) -> impl Iterator<Item = &CallEdge> {
        self.graph.edge_weights()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn edge(caller: u32, callee: u32, contr: Vec<ContrValue>) -> CallEdge {
        let n = contr.len();
        CallEdge::new(
            CallSiteRef {
                caller: MethodId(caller),
                stmt_idx: 0,
                line: 1,
                kind: CallKind::Virtual,
                ref_method: None,
            },
            MethodId(callee),
            contr,
            vec![None; n],
        )
    }

    #[test]
    fn rejects_self_calls() {
        let mut cg = CallGraph::new();
        assert!(!cg.add_edge(edge(1, 1, vec![ContrValue::this()])));
        assert_eq!(cg.edge_count(), 0);
    }

    #[test]
    fn dedups_by_caller_and_taint_vector() {
        let mut cg = CallGraph::new();
        assert!(cg.add_edge(edge(1, 2, vec![ContrValue::this()])));
        // same caller, same integer vector
        assert!(!cg.add_edge(edge(1, 2, vec![ContrValue::this()])));
        // same caller, different vector
        assert!(cg.add_edge(edge(1, 2, vec![ContrValue::param(0)])));
        // different caller, same vector
        assert!(cg.add_edge(edge(3, 2, vec![ContrValue::this()])));
        assert_eq!(cg.edges_in_to(MethodId(2)).len(), 3);
    }
}
