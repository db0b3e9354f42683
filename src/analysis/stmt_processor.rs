// Copyright (c) 2024 <Wei Li>.
//
// This source code is licensed under the GNU license found in the
// LICENSE file in the root directory of this source tree.

//! Statement-level transfer functions.
//!
//! Every statement is idempotent: flow edges dedup on insertion and value
//! merges are monotone, so a frame can re-execute its body after a callee
//! summary arrives without corrupting state.

use log::warn;

use crate::analysis::driver::{Step, SummaryAnalysis};
use crate::analysis::stack::IfWindow;
use crate::analysis::summary::{SlotKey, SummaryValue};
use crate::contr::points_to::PointsTo;
use crate::contr::{Action, Contr, ContrValue, Frag};
use crate::graph::call_graph::{CallEdge, CallSiteRef, EdgeFilter};
use crate::graph::pfg::{AllocSource, FlowKind, IfRange, PfgEdge, PointerId, PointerKind};
use crate::model::hierarchy::FieldId;
use crate::model::ir::{CallKind, InvokeStmt, Literal, StmtKind, VarId};
use crate::model::knowledge::{SLOT_BASE, SLOT_RESULT};
use crate::model::method::MethodId;
use crate::model::ty::TypeId;

impl SummaryAnalysis<'_> {
    pub(crate) fn process_stmt(&mut self, m: MethodId, pc: usize) -> Step {
        let stmt = {
            let body = self
                .acx
                .methods
                .method(m)
                .body
                .as_ref()
                .expect("frame implies body");
            body.stmts[pc].clone()
        };
        let line = stmt.line;
        if self.stack.is_if_end(m, line) {
            self.stack.pop_if();
        }
        let step = match &stmt.kind {
            StmtKind::New { lhs, ty } => {
                let to = self.var_ptr(*lhs);
                self.add_flow(
                    m,
                    to,
                    PfgEdge::alloc(FlowKind::New, AllocSource::Site { ty: *ty }, line),
                );
                Step::Done
            }
            StmtKind::AssignLiteral { lhs, literal } => {
                let to = self.var_ptr(*lhs);
                self.assigned.insert(to);
                if let Literal::Class(ty) = literal {
                    self.add_flow(
                        m,
                        to,
                        PfgEdge::alloc(FlowKind::New, AllocSource::ClassLiteral { ty: *ty }, line),
                    );
                }
                Step::Done
            }
            StmtKind::Copy { lhs, rhs } => {
                if !self.ignored_var(*rhs) {
                    let from = self.var_ptr(*rhs);
                    let to = self.var_ptr(*lhs);
                    self.add_flow(m, to, PfgEdge::flow(FlowKind::LocalAssign, from, line));
                }
                Step::Done
            }
            StmtKind::Cast { lhs, rhs, ty } => {
                if !self.acx.is_ignored_type(*ty) && !self.ignored_var(*rhs) {
                    let from = self.var_ptr(*rhs);
                    let to = self.var_ptr(*lhs);
                    let mut edge = PfgEdge::flow(FlowKind::Cast, from, line);
                    edge.special_ty = Some(*ty);
                    self.add_flow(m, to, edge);
                }
                Step::Done
            }
            StmtKind::LoadStatic { lhs, field } => {
                if self.ignored_var(*lhs) {
                    return Step::Done;
                }
                // reading a static forces the owning class initializer
                let class = self.acx.hierarchy.field(*field).class;
                if let Some(clinit) = self.acx.clinit_of(class) {
                    if self.needs_analysis(clinit) {
                        return Step::Requests(vec![clinit]);
                    }
                }
                let from = self.static_field_ptr(*field);
                let to = self.var_ptr(*lhs);
                self.add_flow(m, to, PfgEdge::flow(FlowKind::StaticLoad, from, line));
                Step::Done
            }
            StmtKind::StoreStatic { field, rhs } => {
                if !self.ignored_var(*rhs) {
                    let from = self.var_ptr(*rhs);
                    let to = self.static_field_ptr(*field);
                    self.add_flow(m, to, PfgEdge::flow(FlowKind::StaticStore, from, line));
                }
                Step::Done
            }
            StmtKind::LoadField { lhs, base, field } => {
                if !self.ignored_var(*lhs) {
                    let base_p = self.var_ptr(*base);
                    let from = self.instance_field_ptr(base_p, *field);
                    let to = self.var_ptr(*lhs);
                    self.add_flow(m, to, PfgEdge::flow(FlowKind::InstanceLoad, from, line));
                }
                Step::Done
            }
            StmtKind::StoreField { base, field, rhs } => {
                if !self.ignored_var(*rhs) {
                    let base_p = self.var_ptr(*base);
                    let from = self.var_ptr(*rhs);
                    let to = self.instance_field_ptr(base_p, *field);
                    let mut edge = PfgEdge::flow(FlowKind::InstanceStore, from, line);
                    edge.if_range = self.stack.cur_if_of(m).map(|w| IfRange {
                        start: w.start_line,
                        end: w.end_line,
                        method: w.method,
                    });
                    if self.add_flow(m, to, edge) {
                        self.pfg.note_field_store(*field, to);
                    }
                }
                Step::Done
            }
            StmtKind::LoadArray { lhs, base } => {
                if !self.ignored_var(*lhs) {
                    let base_p = self.var_ptr(*base);
                    let from = self.array_elem_ptr(base_p);
                    let to = self.var_ptr(*lhs);
                    self.add_flow(m, to, PfgEdge::flow(FlowKind::InstanceLoad, from, line));
                }
                Step::Done
            }
            StmtKind::StoreArray { base, rhs } => {
                if !self.ignored_var(*rhs) {
                    let base_p = self.var_ptr(*base);
                    let from = self.var_ptr(*rhs);
                    let to = self.array_elem_ptr(base_p);
                    if self.add_flow(m, to, PfgEdge::flow(FlowKind::InstanceStore, from, line)) {
                        self.pfg.note_array_store(to);
                    }
                    // a controllable array base also tracks its elements
                    // on the pointer the base descriptor is rooted at
                    if let Some(bc) = self.get_contr(m, Some(base_p)) {
                        if bc.is_controllable() {
                            if let Some(origin) = bc.origin {
                                self.add_flow(
                                    m,
                                    origin,
                                    PfgEdge::flow(FlowKind::ElementStore, from, line),
                                );
                            }
                        }
                    }
                }
                Step::Done
            }
            StmtKind::If {
                op1,
                op2,
                target_line,
            } => {
                let p1 = self.var_ptr(*op1);
                let controllable = self
                    .get_contr(m, Some(p1))
                    .map_or(false, |c| c.is_controllable());
                if controllable || self.invoke_dispatch.contains_key(&(m, *op1)) {
                    self.stack.push_if(IfWindow {
                        start_line: line,
                        end_line: *target_line,
                        op1: *op1,
                        method: m,
                    });
                } else if let Some(checked) = self.stack.take_instanceof_ret(p1) {
                    let zero_test = op2.map_or(false, |v| {
                        matches!(self.acx.vars.var(v).constant, Some(Literal::Int(0)))
                    });
                    if zero_test {
                        self.stack.put_instanceof_end(m, *target_line, checked);
                    }
                }
                Step::Done
            }
            StmtKind::InstanceOf {
                lhs,
                value,
                check_ty,
            } => {
                let checked = self.var_ptr(*value);
                let controllable = self
                    .get_contr(m, Some(checked))
                    .map_or(false, |c| c.is_controllable());
                if controllable {
                    let ret = self.var_ptr(*lhs);
                    self.stack.put_instanceof(ret, checked, *check_ty);
                }
                Step::Done
            }
            StmtKind::Return { value } => {
                self.process_return(m, *value);
                Step::Done
            }
            StmtKind::Invoke(inv) => {
                let inv = inv.clone();
                let step = self.process_invoke(m, pc, &inv, line);
                self.stack.clear_instanceof_end(m, line);
                return step;
            }
        };
        self.stack.clear_instanceof_end(m, line);
        step
    }

    fn process_return(&mut self, m: MethodId, value: Option<VarId>) {
        let summary = self.summaries.entry(m).or_default();
        let slot_present = summary.get(&SlotKey::Return).is_some();
        let ret = match value {
            Some(v) if !self.acx.is_ignored_type(self.acx.vars.var(v).ty) => v,
            _ => {
                if !slot_present {
                    self.summaries
                        .entry(m)
                        .or_default()
                        .set(SlotKey::Return, SummaryValue::assign(ContrValue::NotPolluted));
                }
                return;
            }
        };
        let p = self.var_ptr(ret);
        let (value, ty) = match self.get_contr(m, Some(p)) {
            Some(c) => (c.value, c.ty),
            None => (ContrValue::NotPolluted, None),
        };
        self.summaries
            .entry(m)
            .or_default()
            .merge(SlotKey::Return, SummaryValue::with_ty(value, ty));
    }

    fn ignored_var(&self, v: VarId) -> bool {
        self.acx.is_ignored_type(self.acx.vars.var(v).ty)
    }

    // ---- descriptor queries ----

    /// A fresh bottom descriptor for a pointer.
    pub(crate) fn new_contr_for(&self, p: PointerId) -> Contr {
        let ty = self.ptrs.ty(p);
        let mut c = Contr::not_polluted(Some(p), ty);
        c.serializable = ty.map_or(false, |t| self.acx.is_serializable_type(t));
        c
    }

    /// Resolves the descriptor of a pointer, caching the result as a fact of
    /// the current method.
    pub(crate) fn get_contr(&mut self, m: MethodId, p: Option<PointerId>) -> Option<Contr> {
        let p = p?;
        if let Some(ty) = self.ptrs.ty(p) {
            if self.acx.is_ignored_type(ty) {
                return None;
            }
        }
        if let Some(cached) = self.fact(m, p) {
            let mut c = cached.clone();
            // an instanceof guard refines the type without touching the
            // cached fact
            if let Some(ty) = self.stack.instanceof_ty(p) {
                c.ty = Some(ty);
                return Some(c);
            }
            self.check_param_idx(m, &mut c);
            self.update_fact(m, p, c.clone());
            return Some(c);
        }
        if let Some(v) = self.ptrs.as_var(p) {
            if let Some(s) = self.acx.const_string(v).map(str::to_string) {
                let mut c = self.new_contr_for(p);
                c.value = ContrValue::literal(&s);
                c.pinned = true;
                self.update_fact(m, p, c.clone());
                return Some(c);
            }
        }
        let mut c = self.find_points_to(m, p).into_merged()?;
        if c.origin.is_none() {
            c.origin = Some(p);
        }
        self.check_param_idx(m, &mut c);
        self.update_fact(m, p, c.clone());
        if let Some(ty) = self.stack.instanceof_ty(p) {
            c.ty = Some(ty);
        }
        Some(c)
    }

    pub(crate) fn get_contr_value(&mut self, m: MethodId, p: Option<PointerId>) -> ContrValue {
        self.get_contr(m, p)
            .map(|c| c.value)
            .unwrap_or(ContrValue::NotPolluted)
    }

    /// A parameter index that fell out of the current signature renormalizes
    /// to the receiver; it can only come from summary application across a
    /// mismatched call shape.
    pub(crate) fn check_param_idx(&self, m: MethodId, c: &mut Contr) {
        if !c.value.is_controllable_param() {
            return;
        }
        let idx = c.value.call_key();
        let param_count = self.acx.methods.method(m).param_count() as i32;
        if idx < param_count {
            return;
        }
        warn!(
            "[-] renormalizing out-of-range slot {} in {}",
            idx,
            self.acx.method_str(m)
        );
        if let ContrValue::Frags(fs) = &mut c.value {
            for f in fs.iter_mut() {
                if let Frag::Param(i, path) = f {
                    if *i as i32 == idx {
                        *f = Frag::This(std::mem::take(path));
                    }
                }
            }
        }
    }

    // ---- pointer resolution ----

    /// Walks the flow edges behind a pointer and folds every contribution
    /// into one merged descriptor.
    pub(crate) fn find_points_to(&mut self, m: MethodId, p: PointerId) -> PointsTo {
        let mut pt = PointsTo::new();
        if self.stack.contains_query(p) {
            return pt;
        }
        self.stack.push_query(p);
        let mut worklist = vec![p];
        let mut seen = vec![p];
        while let Some(q) = worklist.pop() {
            if q != p {
                if let Some(f) = self.fact(m, q) {
                    let f = f.clone();
                    pt.add(self.acx, f);
                    continue;
                }
            }
            for edge in self.pfg.in_edges(q) {
                match edge.kind {
                    FlowKind::New | FlowKind::NewContr => {
                        let c = self.contr_of_alloc(q, &edge);
                        pt.add(self.acx, c);
                    }
                    FlowKind::LocalAssign | FlowKind::SummaryAssign => {
                        if let Some(src) = edge.src {
                            if !seen.contains(&src) {
                                seen.push(src);
                                worklist.push(src);
                            }
                        }
                    }
                    FlowKind::Cast => {
                        if let Some(from) = self.get_contr(m, edge.src) {
                            if from.is_controllable() || from.is_new {
                                let mut c = from;
                                c.casted = true;
                                if let Some(ty) = edge.special_ty {
                                    c.ty = Some(ty);
                                    if c.is_new {
                                        c.add_new_type(ty);
                                    }
                                }
                                pt.add(self.acx, c);
                            }
                        }
                    }
                    FlowKind::StaticLoad | FlowKind::StaticStore => {
                        if let Some(src) = edge.src {
                            let inner = self.find_points_to(m, src);
                            pt.add_pts(self.acx, inner);
                        }
                    }
                    FlowKind::InstanceLoad => {
                        if let Some(src) = edge.src {
                            self.resolve_heap_load(m, src, edge.line, &mut pt);
                        }
                    }
                    FlowKind::ElementStore => {
                        self.resolve_element_store(m, q, &edge, &mut pt);
                    }
                    FlowKind::InstanceStore | FlowKind::Other => {
                        if edge.special_ty.is_some() || edge.new_transfer {
                            self.resolve_transfer(m, q, &edge, &mut pt);
                        } else if let Some(src) = edge.src {
                            if !seen.contains(&src) {
                                seen.push(src);
                                worklist.push(src);
                            }
                        }
                    }
                }
            }
        }
        self.stack.pop_query();
        pt
    }

    fn contr_of_alloc(&mut self, q: PointerId, edge: &PfgEdge) -> Contr {
        let mut c = self.new_contr_for(q);
        match edge.alloc.clone() {
            Some(AllocSource::Site { ty }) => {
                c.ty = Some(ty);
                c.serializable = self.acx.is_serializable_type(ty);
                c.value = ContrValue::New;
                c.is_new = true;
            }
            Some(AllocSource::ClassLiteral { ty }) => {
                c.ty = Some(ty);
            }
            Some(AllocSource::ContrSeed { value, ty }) => {
                c.value = value;
                if let Some(ty) = ty {
                    c.ty = Some(ty);
                    c.serializable = self.acx.is_serializable_type(ty);
                }
            }
            None => {}
        }
        c
    }

    /// A load through an instance field or an array slot: match the stores
    /// that alias the loaded location, falling back to the base descriptor.
    fn resolve_heap_load(
        &mut self,
        m: MethodId,
        src: PointerId,
        load_line: u32,
        pt: &mut PointsTo,
    ) {
        let (base, field, stores) = match self.ptrs.kind(src).clone() {
            PointerKind::InstanceField { base, field } => {
                (base, Some(field), self.pfg.field_store_edges(field))
            }
            PointerKind::ArrayElem { base } => (base, None, self.pfg.array_store_edges()),
            _ => return,
        };
        if self.process_alias(m, src, &stores, load_line, field, pt) {
            return;
        }
        let mut c = self.new_contr_for(src);
        if let Some(bc) = self.get_contr(m, Some(base)) {
            if bc.is_controllable() {
                let name = match field {
                    Some(f) => self.acx.hierarchy.field(f).name.clone(),
                    None => "arr".to_string(),
                };
                // inner-class backlink: the synthetic outer-instance field
                // is transparent
                c.value = if name == "this$0" {
                    bc.value.clone()
                } else {
                    bc.value.append_field(&name)
                };
            }
        }
        pt.add(self.acx, c);
    }

    /// Store-to-load alias matching. A store guarded by a branch window only
    /// matches loads inside that window of the same method.
    fn process_alias(
        &mut self,
        m: MethodId,
        src: PointerId,
        stores: &[(PfgEdge, PointerId)],
        load_line: u32,
        field: Option<FieldId>,
        pt: &mut PointsTo,
    ) -> bool {
        let mut matched = false;
        for (sedge, stgt) in stores {
            if !self.same(src, *stgt) {
                continue;
            }
            let store_method = match self.ptrs.method(*stgt) {
                Some(sm) => sm,
                None => continue,
            };
            if let Some(r) = &sedge.if_range {
                if r.method == m && (load_line >= r.end || load_line <= r.start) {
                    continue;
                }
            }
            let from = match sedge.src {
                Some(f) => f,
                None => continue,
            };
            let mut alias = match self.find_points_to(m, from).into_merged() {
                Some(a) => a,
                None => continue,
            };
            // a matched store from another method re-roots parameter
            // descriptors into the caller's view
            if self.ptrs.method(src) != Some(store_method) && alias.is_controllable_param() {
                let replacement = match field {
                    Some(f) => {
                        let name = self.acx.hierarchy.field(f).name.clone();
                        ContrValue::this().append_field(&name)
                    }
                    None => ContrValue::polluted(),
                };
                alias.value = alias.value.replace_controllable(&replacement);
            }
            if alias.origin.is_none() {
                alias.origin = Some(src);
            }
            matched |= pt.add(self.acx, alias);
        }
        matched
    }

    fn resolve_element_store(
        &mut self,
        m: MethodId,
        q: PointerId,
        edge: &PfgEdge,
        pt: &mut PointsTo,
    ) {
        let mut arr = match self.fact(m, q) {
            Some(c) => c.clone(),
            None => self.new_contr_for(q),
        };
        match (&edge.alloc, edge.src) {
            (Some(AllocSource::ContrSeed { value, .. }), _) => {
                arr.value = value.clone();
            }
            (_, Some(src)) => {
                if let Some(e) = self.get_contr(m, Some(src)) {
                    if !arr.elements.iter().any(|c| c.value == e.value) {
                        arr.elements.push(e);
                    }
                }
            }
            _ => {}
        }
        self.update_fact(m, q, arr.clone());
        pt.add(self.acx, arr);
    }

    /// A declared taint transfer: the target inherits controllability (or a
    /// literal) from the source slot, with an optional result type.
    fn resolve_transfer(&mut self, m: MethodId, q: PointerId, edge: &PfgEdge, pt: &mut PointsTo) {
        let from = match self.get_contr(m, edge.src) {
            Some(f) => f,
            None => return,
        };
        if !from.is_controllable() && !from.is_new && !from.value.has_const_str() {
            return;
        }
        let mut c = from;
        c.ty = edge.special_ty.or_else(|| self.ptrs.ty(q));
        c.origin = Some(q);
        if edge.new_transfer {
            c.is_new = true;
        }
        pt.add(self.acx, c);
    }

    // equivalence of heap locations for alias matching
    fn same(&self, p1: PointerId, p2: PointerId) -> bool {
        if p1 == p2 {
            return true;
        }
        match (self.ptrs.kind(p1), self.ptrs.kind(p2)) {
            (
                PointerKind::InstanceField { base: b1, field: f1 },
                PointerKind::InstanceField { base: b2, field: f2 },
            ) => f1 == f2 && self.same_base(*b1, *b2),
            (PointerKind::ArrayElem { base: b1 }, PointerKind::ArrayElem { base: b2 }) => {
                self.same_base(*b1, *b2)
            }
            _ => false,
        }
    }

    /// Two receivers of the same declared type alias each other.
    fn same_base(&self, b1: PointerId, b2: PointerId) -> bool {
        if b1 == b2 {
            return true;
        }
        let v1 = self.ptrs.as_var(b1);
        let v2 = self.ptrs.as_var(b2);
        match (v1, v2) {
            (Some(v1), Some(v2)) => {
                let v1 = self.acx.vars.var(v1);
                let v2 = self.acx.vars.var(v2);
                v1.is_this() && v2.is_this() && v1.ty == v2.ty
            }
            _ => false,
        }
    }

    // ---- invocation ----

    fn process_invoke(
        &mut self,
        m: MethodId,
        pc: usize,
        inv: &InvokeStmt,
        line: u32,
    ) -> Step {
        if inv.kind == CallKind::Dynamic {
            return Step::Done;
        }
        let ref_m = match inv.target {
            Some(r) if !self.acx.is_ignored_method(r) => r,
            _ => return Step::Done,
        };
        let slots: Vec<Option<VarId>> = std::iter::once(inv.recv)
            .chain(inv.args.iter().map(|a| Some(*a)))
            .collect();
        let slot_ptrs: Vec<Option<PointerId>> =
            slots.iter().map(|s| s.map(|v| self.var_ptr(v))).collect();
        let cs_contr: Vec<Option<Contr>> = slot_ptrs
            .iter()
            .map(|p| self.get_contr(m, *p))
            .collect();
        let cs_values: Vec<ContrValue> = cs_contr
            .iter()
            .map(|c| c.as_ref().map_or(ContrValue::NotPolluted, |c| c.value.clone()))
            .collect();
        let mut requests = Vec::new();
        if inv.kind == CallKind::Interface {
            self.process_proxy(m, pc, inv, line, &cs_contr, &cs_values, &mut requests);
        }
        let rm = self.acx.methods.method(ref_m);
        if rm.is_transfer() {
            self.process_transfer_call(m, ref_m, inv, line);
            return self.finish_invoke(requests);
        }
        if rm.has_behavior() {
            self.process_behavior(m, pc, ref_m, inv, line, &cs_contr, &cs_values, &mut requests);
            return self.finish_invoke(requests);
        }
        if rm.is_sink() {
            if self.filter_sink(m, ref_m, slot_ptrs[0]) {
                self.add_wl(m, pc, inv, line, ref_m, &cs_contr, cs_values, &mut requests);
            }
            return self.finish_invoke(requests);
        }
        let callees = self.get_callees(inv, &cs_contr);
        let base_is_this = slots[0]
            .map_or(false, |v| self.acx.vars.var(v).is_this());
        for callee in &callees {
            if !base_is_this {
                self.on_new_deser(*callee);
            }
            self.add_wl(
                m,
                pc,
                inv,
                line,
                *callee,
                &cs_contr,
                cs_values.clone(),
                &mut requests,
            );
        }
        self.side_effects(m, inv, &callees, &cs_values);
        self.finish_invoke(requests)
    }

    fn finish_invoke(&mut self, requests: Vec<MethodId>) -> Step {
        if requests.is_empty() {
            Step::Done
        } else {
            Step::Requests(requests)
        }
    }

    /// Receiver-directed callee resolution. Precision comes from the base
    /// descriptor: known allocations dispatch on their recorded types, plain
    /// hierarchy fan-out is the fallback.
    pub(crate) fn get_callees(
        &mut self,
        inv: &InvokeStmt,
        cs_contr: &[Option<Contr>],
    ) -> Vec<MethodId> {
        let base = match &cs_contr[0] {
            Some(b) => b,
            None => return self.acx.resolve_callees_of(inv),
        };
        let base_is_this = base
            .origin
            .and_then(|p| self.ptrs.as_var(p))
            .map_or(false, |v| self.acx.vars.var(v).is_this());
        if base_is_this {
            return self.acx.resolve_callees_of(inv);
        }
        if base.is_new {
            let mut out = Vec::new();
            for ty in base.type_set() {
                if let Some(callee) = self.acx.resolve_callee(ty, inv) {
                    if !out.contains(&callee) {
                        out.push(callee);
                    }
                }
            }
            return out;
        }
        if !base.is_controllable() {
            return match base.ty.and_then(|ty| self.acx.resolve_callee(ty, inv)) {
                Some(c) => vec![c],
                None => Vec::new(),
            };
        }
        let candidates = self.acx.resolve_callees_of(inv);
        self.filter_cha(candidates, base, inv)
    }

    /// Over a controllable receiver, keep the hierarchy candidates that are
    /// type-compatible and constructible along a deserialization route.
    fn filter_cha(
        &self,
        candidates: Vec<MethodId>,
        base: &Contr,
        inv: &InvokeStmt,
    ) -> Vec<MethodId> {
        if candidates.len() <= 1 {
            return candidates;
        }
        let base_ty = base.ty;
        let ref_class_ty = inv
            .target
            .map(|t| self.acx.hierarchy.class(self.acx.methods.method(t).sig.class).ty);
        // an imprecise base type that is unrelated to the declared receiver
        // cannot constrain dispatch
        let unrelated = match (ref_class_ty, base_ty) {
            (Some(rt), Some(bt)) => !self.acx.is_subtype(rt, bt),
            _ => true,
        };
        let is_construct = base.serializable
            && base.is_controllable()
            && base
                .origin
                .map_or(false, |p| self.assigned.contains(&p));
        candidates
            .into_iter()
            .filter(|c| {
                let cm = self.acx.methods.method(*c);
                let class = self.acx.hierarchy.class(cm.sig.class);
                let ser_ok = !self.acx.options.filter_non_serializable
                    || class.is_serializable
                    || is_construct;
                let ty_ok = unrelated
                    || base_ty.map_or(true, |bt| self.acx.is_subtype(bt, class.ty));
                ser_ok && ty_ok && !cm.is_private
            })
            .collect()
    }

    /// Records a call edge and queues the callee for analysis.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn add_wl(
        &mut self,
        m: MethodId,
        pc: usize,
        inv: &InvokeStmt,
        line: u32,
        callee: MethodId,
        cs_contr: &[Option<Contr>],
        values: Vec<ContrValue>,
        requests: &mut Vec<MethodId>,
    ) {
        if self.acx.is_ignored_method(callee) {
            return;
        }
        let cm = self.acx.methods.method(callee);
        if !cm.is_sink() && (cm.is_transfer() || cm.has_behavior()) {
            return;
        }
        let types: Vec<Option<TypeId>> = cs_contr
            .iter()
            .map(|c| c.as_ref().and_then(|c| c.ty))
            .collect();
        let callsite = CallSiteRef {
            caller: m,
            stmt_idx: pc,
            line,
            kind: inv.kind,
            ref_method: inv.target,
        };
        let mut edge = CallEdge::new(callsite, callee, values, types);
        for (i, c) in cs_contr.iter().enumerate() {
            if c.as_ref().map_or(false, |c| c.casted) {
                edge.set_casted(i);
            }
        }
        self.record_edge_filters(m, pc, inv, &mut edge);
        self.cg.add_edge(edge);
        if self.needs_analysis(callee) {
            requests.push(callee);
        }
    }

    /// Caller-side dispatch constraints. A route-creating transfer followed
    /// by a name comparison inside a branch window pins the edge to that
    /// name; per-site filters recorded by dynamic lookup attach here too.
    fn record_edge_filters(
        &mut self,
        m: MethodId,
        pc: usize,
        inv: &InvokeStmt,
        edge: &mut CallEdge,
    ) {
        if self.frames.last().map_or(false, |f| f.may_create_route) {
            let window_filter = self.stack.cur_if_of(m).and_then(|w| {
                self.invoke_dispatch
                    .get(&(m, w.op1))
                    .map(|(name, param)| EdgeFilter::Name {
                        name: name.clone(),
                        param: *param,
                    })
            });
            if let Some(f) = window_filter {
                edge.filter_by_caller = Some(f);
                self.frame_mut().may_create_route = false;
            }
            // name.equals(const) via a single-arg call on a slot rooted in
            // a parameter: remember which parameter carries the name
            if inv.args.len() == 1 {
                if let (Some(result), Some(arg)) = (inv.result, inv.args.first()) {
                    let param_root = match edge.contr.first().and_then(|v| v.frags().first()) {
                        Some(Frag::Param(i, _)) => Some(*i),
                        _ => None,
                    };
                    let const_arg = self.acx.const_string(*arg).map(str::to_string);
                    if let (Some(i), Some(name)) = (param_root, const_arg) {
                        self.invoke_dispatch.insert((m, result), (name, i));
                    }
                }
            }
        }
        if let Some(f) = self.site_filters.get(&(m, pc)) {
            edge.filter_by_caller = Some(f.clone());
        }
    }

    /// A sink whose reflective target is declared with a bounded generic
    /// cannot be reached through that field.
    fn filter_sink(&mut self, m: MethodId, sink: MethodId, base: Option<PointerId>) -> bool {
        if !self.acx.methods.method(sink).sink_filter_extends_generic {
            return true;
        }
        let origin = match self.get_contr(m, base).and_then(|c| c.origin) {
            Some(o) => o,
            None => return true,
        };
        if let PointerKind::InstanceField { field, .. } = self.ptrs.kind(origin) {
            let f = self.acx.hierarchy.field(*field);
            if f.generic_signature
                .as_deref()
                .map_or(false, |sig| sig.contains("extends"))
            {
                return false;
            }
        }
        true
    }

    /// An interface call on an uncast call-site-rooted receiver may go
    /// through a dynamic proxy; fan out to every registered handler.
    fn process_proxy(
        &mut self,
        m: MethodId,
        pc: usize,
        inv: &InvokeStmt,
        line: u32,
        cs_contr: &[Option<Contr>],
        cs_values: &[ContrValue],
        requests: &mut Vec<MethodId>,
    ) {
        let base = match &cs_contr[0] {
            Some(b) => b,
            None => return,
        };
        if !base.value.is_call_site() || base.casted {
            return;
        }
        let proxy_values = dynamic_proxy_vector(cs_values);
        let controllable = base.is_controllable();
        for handler in self.acx.invocation_handlers.clone() {
            if controllable {
                self.on_new_deser(handler);
            }
            self.add_wl(
                m,
                pc,
                inv,
                line,
                handler,
                cs_contr,
                proxy_values.clone(),
                requests,
            );
        }
    }

    fn process_transfer_call(&mut self, m: MethodId, ref_m: MethodId, inv: &InvokeStmt, line: u32) {
        let transfers = self.acx.methods.method(ref_m).transfers.clone();
        for t in transfers {
            if t.route {
                self.frame_mut().may_create_route = true;
            }
            let from_v = slot_var(inv, t.from);
            let to_v = slot_var(inv, t.to);
            let (from_v, to_v) = match (from_v, to_v) {
                (Some(f), Some(t)) => (f, t),
                _ => continue,
            };
            let from = self.var_ptr(from_v);
            let to = self.var_ptr(to_v);
            let fc = match self.get_contr(m, Some(from)) {
                Some(c) => c,
                None => continue,
            };
            if !fc.is_controllable() && !fc.is_new && !fc.value.has_const_str() {
                continue;
            }
            let special_ty = if t.ty == "from" {
                fc.ty
            } else {
                self.acx.types.by_name(&t.ty)
            };
            let mut edge = PfgEdge::flow(FlowKind::Other, from, line);
            edge.special_ty = special_ty;
            edge.new_transfer = t.new;
            self.add_flow(m, to, edge);
        }
    }

    // ---- summary application ----

    /// Applies the summaries of the resolved callees at a call site,
    /// translating callee slots back into caller descriptors.
    pub(crate) fn side_effects(
        &mut self,
        m: MethodId,
        inv: &InvokeStmt,
        callees: &[MethodId],
        cs_values: &[ContrValue],
    ) {
        let ret_ptr = inv.result.and_then(|v| {
            if self.ignored_var(v) {
                None
            } else {
                Some(self.var_ptr(v))
            }
        });
        for callee in callees {
            if self.acx.is_ignored_method(*callee) {
                continue;
            }
            if self.stack.contains_method(*callee) {
                // recursion: approximate the result with the first
                // controllable call-site value
                if let Some(rp) = ret_ptr {
                    if let Some(v) = cs_values.iter().find(|v| v.is_controllable()) {
                        let mut rc = self
                            .fact(m, rp)
                            .cloned()
                            .unwrap_or_else(|| self.new_contr_for(rp));
                        rc.update_value(v, Action::Assign);
                        self.update_fact(m, rp, rc);
                    }
                }
                continue;
            }
            let summary = match self.summaries.get(callee) {
                Some(s) => s.clone(),
                None => continue,
            };
            for (key, sval) in summary.iter() {
                match key {
                    SlotKey::Return => self.apply_return_effect(m, inv, ret_ptr, sval),
                    _ => self.apply_slot_effect(m, inv, key, sval),
                }
            }
        }
    }

    fn apply_return_effect(
        &mut self,
        m: MethodId,
        inv: &InvokeStmt,
        ret_ptr: Option<PointerId>,
        sval: &SummaryValue,
    ) {
        let rp = match ret_ptr {
            Some(p) => p,
            None => return,
        };
        let mut rc = self
            .fact(m, rp)
            .cloned()
            .unwrap_or_else(|| self.new_contr_for(rp));
        if sval.ty.is_some() {
            rc.ty = sval.ty;
        }
        if sval.value.is_call_site() {
            if let Some(from) = self.call_site_correspond_contr(m, &sval.value, inv) {
                rc.update_value(&from.value, sval.action);
                // a returned array element keeps flowing from its backing
                // array variable
                if let Some(origin) = from.origin {
                    if let PointerKind::ArrayElem { base } = self.ptrs.kind(origin) {
                        let base = *base;
                        self.add_flow(
                            m,
                            rp,
                            PfgEdge::flow(FlowKind::SummaryAssign, base, 0),
                        );
                    }
                }
                self.assigned.insert(rp);
            }
        } else {
            rc.update_value(&sval.value, sval.action);
        }
        self.update_fact(m, rp, rc);
    }

    fn apply_slot_effect(
        &mut self,
        m: MethodId,
        inv: &InvokeStmt,
        key: &SlotKey,
        sval: &SummaryValue,
    ) {
        let key_value = match slot_key_value(key) {
            Some(v) => v,
            None => return,
        };
        let mut to = match self.call_site_correspond_contr(m, &key_value, inv) {
            Some(c) => c,
            None => return,
        };
        let target = to.value.clone();
        if sval.value.is_call_site() {
            let from = match self.call_site_correspond_contr(m, &sval.value, inv) {
                Some(f) => f,
                None => return,
            };
            to.update_value(&from.value, sval.action);
            self.pollute_base(m, &to);
            if target.is_call_site() && !to.intra {
                if self.use_field(m, &target) {
                    // the polluted slot is re-read by this method; link the
                    // flow instead of widening the summary
                    if let (Some(fo), Some(tdo)) = (from.origin, to.origin) {
                        self.add_flow(m, tdo, PfgEdge::flow(FlowKind::SummaryAssign, fo, 0));
                    }
                } else if let Some(up_key) = slot_key_of(&target) {
                    self.summaries
                        .entry(m)
                        .or_default()
                        .merge(up_key, SummaryValue::assign(from.value.clone()));
                }
            }
        } else {
            to.update_value(&sval.value, sval.action);
            if target.is_call_site() && !to.intra {
                if let Some(up_key) = slot_key_of(&target) {
                    self.summaries
                        .entry(m)
                        .or_default()
                        .merge(up_key, SummaryValue::assign(sval.value.clone()));
                }
            }
        }
        if let Some(origin) = to.origin {
            self.update_fact(m, origin, to);
        }
    }

    /// Translates a callee-side symbolic value into a caller-side
    /// descriptor at a call site.
    pub(crate) fn call_site_correspond_contr(
        &mut self,
        m: MethodId,
        value: &ContrValue,
        inv: &InvokeStmt,
    ) -> Option<Contr> {
        let frags = match value {
            ContrValue::Frags(fs) => fs.clone(),
            _ => return None,
        };
        if frags.len() > 1 {
            // composite values substitute every controllable root with its
            // call-site counterpart, keeping literal fragments in place
            let mut out = value.clone();
            for f in &frags {
                let root = match f {
                    Frag::This(_) => Frag::This(Vec::new()),
                    Frag::Param(i, _) => Frag::Param(*i, Vec::new()),
                    _ => continue,
                };
                let rep = match &root {
                    Frag::This(_) => self.slot_contr_value(m, inv, SLOT_BASE),
                    Frag::Param(i, _) => self.slot_contr_value(m, inv, *i as i32),
                    _ => unreachable!(),
                };
                out = out.substitute_prefix(&root, &rep);
            }
            return Some(Contr::new(None, None, out));
        }
        match frags.into_iter().next()? {
            Frag::Polluted => Some(Contr::new(None, None, ContrValue::polluted())),
            Frag::This(path) if path.is_empty() => {
                let recv = inv.recv?;
                let p = self.var_ptr(recv);
                self.get_contr(m, Some(p))
            }
            Frag::This(path) => {
                let recv = inv.recv?;
                let base_p = self.var_ptr(recv);
                let base_c = self.get_contr(m, Some(base_p))?;
                let mut value = base_c.value.clone();
                for f in &path {
                    value = value.append_field(f);
                }
                let field = base_c
                    .ty
                    .and_then(|t| self.acx.class_of_type(t))
                    .and_then(|c| self.acx.hierarchy.field_of(c, &path[0]));
                let mut c = match field {
                    Some(fid) => {
                        let p = self.instance_field_ptr(base_p, fid);
                        Contr::new(Some(p), self.ptrs.ty(p), value)
                    }
                    None => Contr::new(None, None, value),
                };
                c.intra = base_c.is_new;
                Some(c)
            }
            Frag::Param(i, path) => {
                let arg = inv.args.get(i).copied()?;
                let p = self.var_ptr(arg);
                let mut c = self.get_contr(m, Some(p))?;
                for f in &path {
                    c.value = c.value.append_field(f);
                }
                Some(c)
            }
            Frag::Str(_) => None,
        }
    }

    fn slot_contr_value(&mut self, m: MethodId, inv: &InvokeStmt, slot: i32) -> ContrValue {
        let var = slot_var(inv, slot);
        let p = var.map(|v| self.var_ptr(v));
        self.get_contr_value(m, p)
    }

    /// A controllable field descriptor taints the object it hangs off.
    fn pollute_base(&mut self, m: MethodId, contr: &Contr) {
        if !contr.is_controllable() {
            return;
        }
        let base = match contr.origin.map(|o| self.ptrs.kind(o).clone()) {
            Some(PointerKind::InstanceField { base, .. }) => base,
            _ => return,
        };
        let mut bc = match self.fact(m, base) {
            Some(c) => c.clone(),
            None => return,
        };
        if !bc.is_controllable() {
            bc.value = contr.value.clone();
            self.update_fact(m, base, bc);
        }
    }

    /// Whether the current method itself stores through the receiver field
    /// named by `target`.
    fn use_field(&mut self, m: MethodId, target: &ContrValue) -> bool {
        let field_name = match target.frags().first() {
            Some(Frag::This(path)) if !path.is_empty() => path[0].clone(),
            _ => return false,
        };
        let body = match &self.acx.methods.method(m).body {
            Some(b) => b.clone(),
            None => return false,
        };
        let this_var = match body.this_var {
            Some(v) => v,
            None => return false,
        };
        self.this_field_stores(&body, this_var)
            .iter()
            .any(|f| self.acx.hierarchy.field(*f).name == field_name)
    }
}

/// The edge vector a proxied interface call presents to an invocation
/// handler: receiver twice, a blank name slot, then the first controllable
/// argument.
fn dynamic_proxy_vector(cs_values: &[ContrValue]) -> Vec<ContrValue> {
    let base = cs_values
        .first()
        .cloned()
        .unwrap_or(ContrValue::NotPolluted);
    let arg = cs_values
        .iter()
        .skip(1)
        .find(|v| v.is_controllable())
        .cloned()
        .unwrap_or(ContrValue::NotPolluted);
    vec![base.clone(), base, ContrValue::NotPolluted, arg]
}

pub(crate) fn slot_var(inv: &InvokeStmt, slot: i32) -> Option<VarId> {
    match slot {
        SLOT_BASE => inv.recv,
        SLOT_RESULT => inv.result,
        i if i >= 0 => inv.args.get(i as usize).copied(),
        _ => None,
    }
}

fn slot_key_value(key: &SlotKey) -> Option<ContrValue> {
    match key {
        SlotKey::Return => None,
        SlotKey::Param(i) => Some(ContrValue::param(*i)),
        SlotKey::This => Some(ContrValue::this()),
        SlotKey::ThisField(name) => Some(ContrValue::this().append_field(name)),
    }
}

fn slot_key_of(value: &ContrValue) -> Option<SlotKey> {
    let frags = value.frags();
    if frags.len() != 1 {
        return None;
    }
    match &frags[0] {
        Frag::This(path) if path.is_empty() => Some(SlotKey::This),
        Frag::This(path) => Some(SlotKey::ThisField(path.join("-"))),
        Frag::Param(i, path) if path.is_empty() => Some(SlotKey::Param(*i)),
        _ => None,
    }
}
