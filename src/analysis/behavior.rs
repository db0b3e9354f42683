// Copyright (c) 2024 <Wei Li>.
//
// This source code is licensed under the GNU license found in the
// LICENSE file in the root directory of this source tree.

//! Imitated reflective behaviors.
//!
//! Reflection, privileged actions and a few property idioms cannot be
//! resolved by dispatch; each modeled method carries a closed behavior tag
//! and the handlers here fan the call out to the concrete candidates.

use log::debug;

use crate::analysis::driver::SummaryAnalysis;
use crate::contr::{Contr, ContrValue};
use crate::graph::call_graph::EdgeFilter;
use crate::graph::pfg::{AllocSource, FlowKind, PfgEdge, PointerId};
use crate::model::ir::InvokeStmt;
use crate::model::knowledge::Behavior;
use crate::model::method::MethodId;
use crate::model::ty::TypeId;

impl SummaryAnalysis<'_> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn process_behavior(
        &mut self,
        m: MethodId,
        pc: usize,
        ref_m: MethodId,
        inv: &InvokeStmt,
        line: u32,
        cs_contr: &[Option<Contr>],
        cs_values: &[ContrValue],
        requests: &mut Vec<MethodId>,
    ) {
        let behavior = match &self.acx.methods.method(ref_m).behavior {
            Some(b) => b.clone(),
            None => return,
        };
        match behavior {
            Behavior::JumpConstructor { from, param } => {
                self.jump_constructor(m, pc, ref_m, inv, line, cs_contr, cs_values, from, param, requests)
            }
            Behavior::JumpInference { from, recv, param } => {
                self.jump_inference(m, pc, inv, line, cs_contr, cs_values, from, recv, param, requests)
            }
            Behavior::Get { from } => self.property_access(m, inv, cs_contr, from, "get"),
            Behavior::Set { from } => self.property_access(m, inv, cs_contr, from, "set"),
            Behavior::Run { from } => self.privileged_run(m, pc, inv, line, cs_contr, cs_values, from, requests),
            Behavior::Replace => self.concrete_replace(m, inv, cs_contr),
            Behavior::PolluteRec => self.pollute_receiver(m, inv, cs_contr, line),
        }
    }

    /// Dynamic instantiation: `Class.forName` pulls in static initializers,
    /// `newInstance` fans out over matching constructors.
    #[allow(clippy::too_many_arguments)]
    fn jump_constructor(
        &mut self,
        m: MethodId,
        pc: usize,
        ref_m: MethodId,
        inv: &InvokeStmt,
        line: u32,
        cs_contr: &[Option<Contr>],
        cs_values: &[ContrValue],
        from: i32,
        param: i32,
        requests: &mut Vec<MethodId>,
    ) {
        let fidx = match cs_index(from) {
            Some(i) => i,
            None => return,
        };
        let fc = match cs_contr.get(fidx).and_then(|c| c.as_ref()) {
            Some(c) => c.clone(),
            None => return,
        };
        if !fc.is_controllable() && !fc.value.has_const_str() {
            return;
        }
        // class loading through a controllable loader is itself a sink
        if self.acx.methods.method(ref_m).is_sink() {
            let loader_controllable = cs_values
                .get(cs_index_or_zero(param))
                .map_or(false, |v| v.is_controllable());
            if loader_controllable {
                self.add_wl(m, pc, inv, line, ref_m, cs_contr, cs_values.to_vec(), requests);
            }
        }
        let string_typed = fc.ty.map_or(false, |t| self.acx.is_string_type(t));
        let (pattern, name) = if string_typed {
            (fc.value.to_name_regex(), "<clinit>")
        } else {
            let ty = match fc.ty {
                Some(t) => t,
                None => return,
            };
            let mut cname = self.acx.types.name(ty).to_string();
            // a bare Class object constrains nothing
            if cname == "java.lang.Class" {
                cname = "java.lang.Object".to_string();
            }
            (cname, "<init>")
        };
        let (arg_types, expand) = self.expand_arg_types(param, cs_contr);
        let candidates = self.acx.filter_methods_by_class(
            &pattern,
            name,
            &arg_types,
            fc.is_controllable(),
            self.acx.options.filter_non_serializable,
            expand,
        );
        let pv = cs_values
            .get(cs_index_or_zero(param))
            .cloned()
            .unwrap_or(ContrValue::NotPolluted);
        for callee in candidates {
            let pcnt = self.acx.methods.method(callee).param_count();
            let mut values = vec![cs_values[0].clone()];
            values.extend(std::iter::repeat(pv.clone()).take(pcnt));
            if fc.is_controllable() {
                self.on_new_deser(callee);
            }
            self.add_wl(m, pc, inv, line, callee, cs_contr, values, requests);
        }
    }

    /// Dynamic member lookup: resolve by name pattern on the receiver's
    /// type, remembering caller-side name constraints on the edge.
    #[allow(clippy::too_many_arguments)]
    fn jump_inference(
        &mut self,
        m: MethodId,
        pc: usize,
        inv: &InvokeStmt,
        line: u32,
        cs_contr: &[Option<Contr>],
        cs_values: &[ContrValue],
        from: i32,
        recv: i32,
        param: i32,
        requests: &mut Vec<MethodId>,
    ) {
        let nidx = match cs_index(from) {
            Some(i) => i,
            None => return,
        };
        let nc = match cs_contr.get(nidx).and_then(|c| c.as_ref()) {
            Some(c) => c.clone(),
            None => return,
        };
        if !nc.is_controllable() && !nc.value.has_const_str() {
            return;
        }
        // a name variable with an empty upstream cannot be constrained and
        // would match everything; skip it
        if let Some(origin) = nc.origin {
            if self.is_one_in_edge(origin) {
                return;
            }
        }
        // name rooted in a caller slot: successors of this site must later
        // match the callee name against that slot
        if nc.value.is_controllable_param() || nc.value.is_this() {
            self.site_filters.insert(
                (m, pc),
                EdgeFilter::Edge {
                    key: nc.value.clone(),
                },
            );
        }
        let pattern = nc.value.to_name_regex();
        let rc = cs_index(recv).and_then(|i| cs_contr.get(i).cloned().flatten());
        let recv_ty = rc
            .as_ref()
            .and_then(|c| c.ty)
            .or_else(|| self.acx.types.by_name("java.lang.Object"));
        let recv_ty = match recv_ty {
            Some(t) => t,
            None => return,
        };
        let recv_controllable = rc.as_ref().map_or(false, |c| c.is_controllable());
        let (arg_types, expand) = self.expand_arg_types(param, cs_contr);
        let mut candidates = self.acx.filter_methods_by_name(
            &pattern,
            recv_ty,
            &arg_types,
            recv_controllable,
            self.acx.options.filter_non_serializable,
            expand,
        );
        // a fully wild name also reaches proxy invocation handlers
        if pattern == ".*" {
            for h in &self.acx.invocation_handlers {
                if !candidates.contains(h) {
                    candidates.push(*h);
                }
            }
        }
        let recv_v = cs_index(recv)
            .and_then(|i| cs_values.get(i).cloned())
            .unwrap_or(ContrValue::NotPolluted);
        let name_v = cs_values
            .get(nidx)
            .cloned()
            .unwrap_or(ContrValue::NotPolluted);
        let param_v = cs_values
            .get(cs_index_or_zero(param))
            .cloned()
            .unwrap_or(ContrValue::NotPolluted);
        for callee in candidates {
            let values = if self.acx.invocation_handlers.contains(&callee) {
                vec![recv_v.clone(), recv_v.clone(), name_v.clone(), param_v.clone()]
            } else {
                let pcnt = self.acx.methods.method(callee).param_count();
                let mut v = vec![recv_v.clone()];
                v.extend(std::iter::repeat(param_v.clone()).take(pcnt));
                v
            };
            if recv_controllable {
                self.on_new_deser(callee);
            }
            self.add_wl(m, pc, inv, line, callee, cs_contr, values, requests);
        }
    }

    /// Property read/write: the result carries the accessor name rooted in
    /// the property-name slot, which route filters match on later.
    fn property_access(
        &mut self,
        m: MethodId,
        inv: &InvokeStmt,
        cs_contr: &[Option<Contr>],
        from: i32,
        prefix: &str,
    ) {
        let fidx = match cs_index(from) {
            Some(i) => i,
            None => return,
        };
        let fv = match cs_contr.get(fidx).and_then(|c| c.as_ref()) {
            Some(c) if c.is_controllable() => c.value.clone(),
            _ => return,
        };
        let result = match inv.result {
            Some(r) => r,
            None => return,
        };
        let p = self.var_ptr(result);
        let mut rc = self
            .fact(m, p)
            .cloned()
            .unwrap_or_else(|| self.new_contr_for(p));
        rc.value = ContrValue::literal(prefix).concat(&fv);
        self.update_fact(m, p, rc);
    }

    /// Privileged-action idiom: dispatch straight to `run()`, shifting the
    /// action object into the receiver slot.
    #[allow(clippy::too_many_arguments)]
    fn privileged_run(
        &mut self,
        m: MethodId,
        pc: usize,
        inv: &InvokeStmt,
        line: u32,
        cs_contr: &[Option<Contr>],
        cs_values: &[ContrValue],
        from: i32,
        requests: &mut Vec<MethodId>,
    ) {
        let fidx = match cs_index(from) {
            Some(i) => i,
            None => return,
        };
        let fc = match cs_contr.get(fidx).and_then(|c| c.as_ref()) {
            Some(c) => c.clone(),
            None => return,
        };
        let ty = match fc.ty {
            Some(t) => t,
            None => return,
        };
        let callee = match self.acx.resolve_run_method(ty) {
            Some(c) => c,
            None => return,
        };
        let values: Vec<ContrValue> = cs_values[fidx..].to_vec();
        let contr_slice: Vec<Option<Contr>> = cs_contr[fidx..].to_vec();
        if fc.is_controllable() {
            self.on_new_deser(callee);
        }
        self.add_wl(m, pc, inv, line, callee, &contr_slice, values.clone(), requests);
        self.side_effects(m, inv, &[callee], &values);
    }

    /// `replace` over fully literal operands concretizes at analysis time.
    fn concrete_replace(&mut self, m: MethodId, inv: &InvokeStmt, cs_contr: &[Option<Contr>]) {
        let literal = |i: usize| -> Option<String> {
            cs_contr.get(i).and_then(|c| c.as_ref()).and_then(|c| c.value.const_str())
        };
        let (base, old, new) = match (literal(0), literal(1), literal(2)) {
            (Some(b), Some(o), Some(n)) => (b, o, n),
            _ => {
                debug!("[-] replace with non-literal operands, skipped");
                return;
            }
        };
        let result = match inv.result {
            Some(r) => r,
            None => return,
        };
        let p = self.var_ptr(result);
        let mut rc = self.new_contr_for(p);
        rc.value = ContrValue::literal(&base.replace(&old, &new));
        rc.pinned = true;
        self.update_fact(m, p, rc);
    }

    /// Self-mutating builder: any controllable argument pollutes the
    /// receiver and is tracked as element content.
    fn pollute_receiver(
        &mut self,
        m: MethodId,
        inv: &InvokeStmt,
        cs_contr: &[Option<Contr>],
        line: u32,
    ) {
        let arg_v = cs_contr
            .iter()
            .skip(1)
            .flatten()
            .find(|c| c.is_controllable())
            .map(|c| c.value.clone());
        let arg_v = match arg_v {
            Some(v) => v,
            None => return,
        };
        let recv = match inv.recv {
            Some(r) => r,
            None => return,
        };
        let p = self.var_ptr(recv);
        self.add_flow(
            m,
            p,
            PfgEdge::alloc(
                FlowKind::ElementStore,
                AllocSource::ContrSeed {
                    value: arg_v.clone(),
                    ty: None,
                },
                line,
            ),
        );
        let mut bc = self
            .fact(m, p)
            .cloned()
            .unwrap_or_else(|| self.new_contr_for(p));
        if !bc.is_controllable() {
            bc.value = arg_v;
            self.update_fact(m, p, bc);
        }
    }

    /// Candidate argument types at a call site, with the expansion type of
    /// an argument-array slot when its contents are known.
    fn expand_arg_types(
        &self,
        param: i32,
        cs_contr: &[Option<Contr>],
    ) -> (Vec<TypeId>, Option<TypeId>) {
        let pc = cs_index(param).and_then(|i| cs_contr.get(i).cloned().flatten());
        let pc = match pc {
            Some(c) => c,
            None => return (Vec::new(), None),
        };
        if !pc.elements.is_empty() {
            let types: Vec<TypeId> = pc.elements.iter().filter_map(|e| e.ty).collect();
            return (types, None);
        }
        // an opaque argument array constrains nothing beyond its element
        // type
        let expand = pc
            .ty
            .filter(|t| self.acx.types.is_array(*t))
            .and_then(|t| self.acx.types.array_elem(t));
        (Vec::new(), expand)
    }

    /// A pointer with a single in-edge whose source itself has no in-edges
    /// carries no usable information.
    pub(crate) fn is_one_in_edge(&self, p: PointerId) -> bool {
        let edges = self.pfg.in_edges(p);
        if edges.len() != 1 {
            return false;
        }
        match edges[0].src {
            Some(src) => self.pfg.in_degree(src) == 0,
            None => false,
        }
    }
}

/// Maps a knowledge slot index (receiver `-1`, argument `i`) to its position
/// in the call-site vectors.
fn cs_index(slot: i32) -> Option<usize> {
    match slot {
        -1 => Some(0),
        i if i >= 0 => Some(i as usize + 1),
        _ => None,
    }
}

fn cs_index_or_zero(slot: i32) -> usize {
    cs_index(slot).unwrap_or(0)
}
