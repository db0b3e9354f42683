// Copyright (c) 2024 <Wei Li>.
//
// This source code is licensed under the GNU license found in the
// LICENSE file in the root directory of this source tree.

//! Gadget-chain enumeration, verification and minimization.
//!
//! Candidate chains are walked backwards from each sink, keeping only
//! prefixes whose taint requirements stay satisfiable. Survivors are
//! checked against caller-side dispatch filters and a type pass, then
//! collapsed when a subsignature repeats along the chain.

use std::collections::HashSet;

use log::info;
use regex::Regex;

use crate::contr::{all_controllable, KEY_POLLUTED, KEY_THIS};
use crate::graph::call_graph::{CallEdge, CallGraph, EdgeFilter};
use crate::model::ir::CallKind;
use crate::model::method::MethodId;
use crate::model::ty::TypeId;
use crate::model::AnalysisContext;

/// Identity of a chain for deduplication.
type ChainKey = Vec<(MethodId, MethodId, Vec<i32>, u32)>;

pub struct GcCollector<'a> {
    acx: &'a AnalysisContext,
    sources: HashSet<MethodId>,
    max_len: usize,
    /// Remaining exploration budget for the current sink, when bounded.
    budget: Option<u64>,
    seen: HashSet<ChainKey>,
    chains: Vec<Vec<CallEdge>>,
}

impl<'a> GcCollector<'a> {
    pub fn new(acx: &'a AnalysisContext, sources: HashSet<MethodId>) -> Self {
        GcCollector {
            acx,
            sources,
            max_len: acx.options.max_len,
            budget: None,
            seen: HashSet::new(),
            chains: Vec::new(),
        }
    }

    /// Enumerates, verifies and minimizes chains for every declared sink.
    pub fn collect(mut self, cg: &mut CallGraph) -> Vec<Vec<CallEdge>> {
        for sink in self.acx.sinks.clone() {
            info!("start from {}", self.acx.method_str(sink));
            self.budget = self.acx.options.max_units_per_sink;
            let candidates = self.candidate_chains(cg, sink);
            for chain in candidates {
                if !self.filter_edge(&chain) && self.type_check(&chain) {
                    let gc = self.simplify(cg, chain);
                    let key = chain_key(&gc);
                    if self.seen.insert(key) {
                        self.chains.push(gc);
                    }
                }
            }
        }
        info!("total gadget chains : {}", self.chains.len());
        self.chains
    }

    /// Sink-first candidate chains reaching a source within the length
    /// bound.
    fn candidate_chains(&mut self, cg: &CallGraph, sink: MethodId) -> Vec<Vec<CallEdge>> {
        let tc: Vec<i32> = self
            .acx
            .methods
            .method(sink)
            .sink
            .clone()
            .unwrap_or_default();
        let mut result = Vec::new();
        let mut current = Vec::new();
        let mut visited = HashSet::new();
        let edges: Vec<CallEdge> = cg.edges_in_to(sink).into_iter().cloned().collect();
        for edge in edges {
            self.back_dfs(cg, sink, edge, &mut current, &mut result, &mut visited, &tc);
        }
        result
    }

    #[allow(clippy::too_many_arguments)]
    fn back_dfs(
        &mut self,
        cg: &CallGraph,
        callee: MethodId,
        cur_edge: CallEdge,
        cur_gc: &mut Vec<CallEdge>,
        result: &mut Vec<Vec<CallEdge>>,
        visited: &mut HashSet<MethodId>,
        tc_list: &[i32],
    ) {
        if let Some(budget) = self.budget.as_mut() {
            if *budget == 0 {
                return;
            }
            *budget -= 1;
        }
        if !visited.insert(callee) {
            return;
        }
        let caller = cur_edge.caller();
        let new_tc = new_tc_list(tc_list, &cur_edge.int_contr);
        if !all_controllable(&new_tc) {
            return;
        }
        cur_gc.push(cur_edge);
        if self.sources.contains(&caller) {
            result.push(cur_gc.clone());
        } else if cur_gc.len() == self.max_len {
            visited.remove(&callee);
            cur_gc.pop();
            return;
        } else {
            let edges: Vec<CallEdge> = cg.edges_in_to(caller).into_iter().cloned().collect();
            for edge in edges {
                self.back_dfs(cg, caller, edge, cur_gc, result, visited, &new_tc);
            }
        }
        visited.remove(&callee);
        cur_gc.pop();
    }

    // ---- verification ----

    /// The first filtered edge along the chain decides; its callers are the
    /// edges closer to the source.
    fn filter_edge(&self, chain: &[CallEdge]) -> bool {
        for (i, edge) in chain.iter().enumerate() {
            if edge.filter_by_caller.is_some() {
                return self.filter_by_caller(edge, &chain[i + 1..]);
            }
        }
        false
    }

    fn filter_by_caller(&self, edge: &CallEdge, callers: &[CallEdge]) -> bool {
        match edge.filter_by_caller.as_ref() {
            Some(EdgeFilter::Name { name, param }) => {
                if callers.is_empty() {
                    return true;
                }
                let mut idx = param + 1;
                for caller in callers {
                    let value = match caller.contr.get(idx) {
                        Some(v) => v,
                        None => return true,
                    };
                    if value.is_controllable_param() {
                        idx = value.call_key() as usize + 1;
                    } else if !value.is_controllable() {
                        // the name is pinned by this caller's declared
                        // target
                        let target_name = caller
                            .callsite
                            .ref_method
                            .map(|r| self.acx.methods.method(r).sig.name.clone());
                        return target_name.as_deref() != Some(name.as_str());
                    }
                }
                false
            }
            Some(EdgeFilter::Edge { key }) => {
                let mut idx = match key.call_key() {
                    KEY_THIS => 0,
                    i if i >= 0 => i as usize + 1,
                    _ => return false,
                };
                for caller in callers {
                    let value = match caller.contr.get(idx) {
                        Some(v) => v,
                        None => return true,
                    };
                    if value.has_const_str() || value.is_this() {
                        let name_reg = value.to_name_regex();
                        let callee_name = &self.acx.methods.method(edge.callee).sig.name;
                        let matched = if name_reg.contains('*') {
                            Regex::new(&name_reg)
                                .map(|re| re.is_match(callee_name))
                                .unwrap_or(false)
                        } else {
                            callee_name == &name_reg
                        };
                        return !matched;
                    } else if value.is_controllable_param() {
                        idx = value.call_key() as usize + 1;
                    } else {
                        return true;
                    }
                }
                false
            }
            None => false,
        }
    }

    /// Source-first propagation of slot types; every hop must keep the
    /// passed types compatible with the callee's expectations.
    fn type_check(&self, chain: &[CallEdge]) -> bool {
        let mut forward: Vec<&CallEdge> = chain.iter().collect();
        forward.reverse();
        let mut pass_type: Option<Vec<Option<TypeId>>> = None;
        for (i, edge) in forward.iter().enumerate() {
            let behavior_hop = edge
                .callsite
                .ref_method
                .map_or(false, |r| self.acx.methods.method(r).has_behavior());
            if behavior_hop {
                return true;
            }
            let callee = self.acx.methods.method(edge.callee);
            if callee.is_invoke {
                return self.filter_cast(&forward[..i + 1]);
            }
            let mut params_type = vec![Some(self.acx.hierarchy.class(callee.sig.class).ty)];
            params_type.extend(callee.sig.params.iter().map(|t| Some(*t)));
            let new_pass = new_pass_type(edge, pass_type.as_deref(), &params_type);
            if !self.has_sub_relation(&params_type, &new_pass) {
                return false;
            }
            pass_type = Some(new_pass);
        }
        true
    }

    /// A receiver flowing into a reflective invoke must reach it uncast.
    fn filter_cast(&self, prefix: &[&CallEdge]) -> bool {
        let mut tc = vec![KEY_THIS];
        for edge in prefix.iter().rev() {
            let idx = tc[0] + 1;
            if idx >= 0 && edge.is_casted(idx as usize) {
                return false;
            }
            tc = new_tc_list(&tc, &edge.int_contr);
        }
        true
    }

    fn has_sub_relation(
        &self,
        params: &[Option<TypeId>],
        pass: &[Option<TypeId>],
    ) -> bool {
        params.iter().zip(pass.iter()).all(|(p, v)| match (p, v) {
            (Some(p), Some(v)) => self.acx.compatible(*p, *v),
            _ => true,
        })
    }

    // ---- minimization ----

    /// Collapses a repeated subsignature: when the earlier occurrence can
    /// already be reached with the needed taint, the loop between the two
    /// occurrences is cut and a direct edge replaces it.
    fn simplify(&self, cg: &mut CallGraph, chain: Vec<CallEdge>) -> Vec<CallEdge> {
        let mut forward = chain.clone();
        forward.reverse();
        let source = forward[0].caller();
        let mut sub_sigs: Vec<String> = Vec::new();
        let mut out: Vec<CallEdge> = Vec::new();
        for edge in forward {
            let gadget = edge.caller();
            let sub_sig = self.acx.methods.method(gadget).subsig.clone();
            if let Some(from) = sub_sigs.iter().rposition(|s| *s == sub_sig) {
                if from > 0 {
                    let from_edge = out[from - 1].clone();
                    if from_edge.callsite.kind != CallKind::Static {
                        if let Some(tc) = self.tc_list_at(gadget, &chain) {
                            let mut source_edges: Vec<CallEdge> = out[..from].to_vec();
                            source_edges.reverse();
                            let tc_map = self.recovery_tc_map(&source_edges, &tc);
                            if tc_map.iter().any(|(m, _)| *m == source) {
                                sub_sigs.truncate(from);
                                out.truncate(from - 1);
                                let mut replace = from_edge;
                                replace.callee = gadget;
                                cg.add_edge(replace.clone());
                                out.push(replace);
                            }
                        }
                    }
                }
            }
            sub_sigs.push(sub_sig);
            out.push(edge);
        }
        out
    }

    /// The taint requirement at `gadget`, propagated sink-first up to its
    /// occurrence in the chain.
    fn tc_list_at(&self, gadget: MethodId, chain: &[CallEdge]) -> Option<Vec<i32>> {
        let sink = chain.first()?.callee;
        let mut prefix = Vec::new();
        for edge in chain {
            if edge.callee == gadget {
                break;
            }
            prefix.push(edge.clone());
        }
        let sink_tc = self.acx.methods.method(sink).sink.clone()?;
        self.recovery_tc_map(&prefix, &sink_tc)
            .into_iter()
            .find(|(m, _)| *m == gadget)
            .map(|(_, tc)| tc)
    }

    /// Per-caller taint requirements along a sink-first edge list, stopping
    /// at the first unsatisfiable hop.
    fn recovery_tc_map(&self, edges: &[CallEdge], tc_list: &[i32]) -> Vec<(MethodId, Vec<i32>)> {
        let mut out = Vec::new();
        let mut tc = tc_list.to_vec();
        for edge in edges {
            tc = new_tc_list(&tc, &edge.int_contr);
            if !all_controllable(&tc) {
                return out;
            }
            out.push((edge.caller(), tc.clone()));
        }
        out
    }
}

/// Translates a callee-side taint requirement through one edge: slot `tc`
/// maps to the caller-side key of that slot's value.
fn new_tc_list(tc_list: &[i32], int_contr: &[i32]) -> Vec<i32> {
    let mut out = Vec::new();
    for tc in tc_list {
        let new_tc = if *tc > KEY_POLLUTED {
            int_contr
                .get((*tc + 1) as usize)
                .copied()
                .unwrap_or(KEY_POLLUTED)
        } else {
            KEY_POLLUTED
        };
        if !out.contains(&new_tc) {
            out.push(new_tc);
        }
    }
    out
}

/// Per-slot pass types after one hop: parameter-rooted slots inherit from
/// the previous pass, receiver-rooted slots keep the edge type, everything
/// else falls back to the declared parameter type.
fn new_pass_type(
    edge: &CallEdge,
    pass_type: Option<&[Option<TypeId>]>,
    params_type: &[Option<TypeId>],
) -> Vec<Option<TypeId>> {
    let mut out = Vec::new();
    for (i, c) in edge.int_contr.iter().enumerate() {
        if *c > KEY_THIS {
            let inherited = match pass_type {
                Some(p) => p.get((*c + 1) as usize).copied().flatten(),
                None => edge.types.get(i).copied().flatten(),
            };
            out.push(inherited);
        } else if *c == KEY_THIS {
            out.push(edge.types.get(i).copied().flatten());
        } else {
            out.push(params_type.get(i).copied().flatten());
        }
    }
    out
}

fn chain_key(chain: &[CallEdge]) -> ChainKey {
    chain
        .iter()
        .map(|e| {
            (
                e.caller(),
                e.callee,
                e.int_contr.clone(),
                e.callsite.line,
            )
        })
        .collect()
}
