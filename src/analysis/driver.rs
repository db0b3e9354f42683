// Copyright (c) 2024 <Wei Li>.
//
// This source code is licensed under the GNU license found in the
// LICENSE file in the root directory of this source tree.

//! The summary analysis driver.
//!
//! Methods are analyzed on demand with an explicit frame stack instead of
//! host-stack recursion: a statement that needs a callee summary parks its
//! frame, the callee frames run to completion, and the statement re-executes
//! with the summary available. Statement processing is idempotent, so the
//! re-execution is safe.

use std::collections::{HashMap, HashSet};

use log::info;

use crate::analysis::stack::StackManager;
use crate::analysis::summary::{SlotKey, Summary, SummaryValue};
use crate::contr::{Contr, ContrValue};
use crate::graph::call_graph::{CallGraph, EdgeFilter};
use crate::graph::pfg::{AllocSource, FlowKind, Pfg, PfgEdge, PointerId, PointerKind, PointerTable};
use crate::model::ir::VarId;
use crate::model::method::MethodId;
use crate::model::{matches_source_subsig, AnalysisContext};

/// Fixpoint cap on statement passes per method.
pub(crate) const MAX_PASSES: u32 = 8;

pub(crate) struct Frame {
    pub method: MethodId,
    pub pc: usize,
    pub pass: u32,
    /// Summary snapshot taken at the start of the pass, used to detect a
    /// reached fixpoint.
    pub baseline: Summary,
    pub may_create_route: bool,
}

/// What processing one statement asks of the driver.
pub(crate) enum Step {
    Done,
    /// Callee methods that must be analyzed before this statement can
    /// complete. The statement re-executes once they are.
    Requests(Vec<MethodId>),
}

pub struct SummaryAnalysis<'a> {
    pub acx: &'a AnalysisContext,
    pub ptrs: PointerTable,
    pub pfg: Pfg,
    pub cg: CallGraph,
    pub(crate) stack: StackManager,
    pub summaries: HashMap<MethodId, Summary>,
    /// Cached merged contribution per pointer, per in-flight method.
    pub(crate) facts: HashMap<MethodId, HashMap<PointerId, Contr>>,
    /// Result var of a single-arg dispatch-name call -> (name, taint slot).
    pub(crate) invoke_dispatch: HashMap<(MethodId, VarId), (String, usize)>,
    /// Per-call-site filters recorded by dynamic member lookup.
    pub(crate) site_filters: HashMap<(MethodId, usize), EdgeFilter>,
    /// Variables that saw a direct assignment, a constructability hint.
    pub(crate) assigned: HashSet<PointerId>,
    pub(crate) frames: Vec<Frame>,
    pub(crate) analyzed: HashSet<MethodId>,
    /// Deserialization callbacks discovered during analysis.
    pub dynamic_sources: HashSet<MethodId>,
    analyzed_count: u64,
}

impl<'a> SummaryAnalysis<'a> {
    pub fn new(acx: &'a AnalysisContext) -> Self {
        SummaryAnalysis {
            acx,
            ptrs: PointerTable::new(),
            pfg: Pfg::new(),
            cg: CallGraph::new(),
            stack: StackManager::new(),
            summaries: HashMap::new(),
            facts: HashMap::new(),
            invoke_dispatch: HashMap::new(),
            site_filters: HashMap::new(),
            assigned: HashSet::new(),
            frames: Vec::new(),
            analyzed: HashSet::new(),
            dynamic_sources: HashSet::new(),
            analyzed_count: 0,
        }
    }

    /// Analyzes every method with a body, on-demand callees included.
    pub fn run(&mut self) {
        let total = self.acx.methods.len();
        info!("[+] summary analysis over {} methods", total);
        let all: Vec<MethodId> = self
            .acx
            .methods
            .iter()
            .filter(|(_, m)| m.body.is_some())
            .map(|(id, _)| id)
            .collect();
        for m in all {
            self.schedule(m);
            self.drain();
        }
        info!(
            "[+] analyzed {} methods, {} call edges",
            self.analyzed_count,
            self.cg.edge_count()
        );
    }

    /// Runs a single method and everything it demands. Used by tests.
    pub fn run_method(&mut self, m: MethodId) {
        self.schedule(m);
        self.drain();
    }

    pub(crate) fn needs_analysis(&self, m: MethodId) -> bool {
        !self.analyzed.contains(&m)
            && !self.stack.contains_method(m)
            && self.acx.methods.method(m).body.is_some()
            && !self.acx.is_ignored_method(m)
    }

    /// Pushes a frame for `m` if it still needs one. The static initializer
    /// of the declaring class is stacked on top so it runs first.
    pub(crate) fn schedule(&mut self, m: MethodId) -> bool {
        if !self.needs_analysis(m) {
            return false;
        }
        self.stack.push_method(m);
        self.cg.add_reachable(m);
        self.seed_entry_facts(m);
        self.frames.push(Frame {
            method: m,
            pc: 0,
            pass: 0,
            baseline: Summary::new(),
            may_create_route: false,
        });
        let class = self.acx.methods.method(m).sig.class;
        if let Some(clinit) = self.acx.clinit_of(class) {
            if clinit != m {
                self.schedule(clinit);
            }
        }
        true
    }

    fn drain(&mut self) {
        while !self.frames.is_empty() {
            self.step();
        }
    }

    fn step(&mut self) {
        let frame = self.frames.last().expect("drain checked frames");
        let m = frame.method;
        let pc = frame.pc;
        let stmt_count = self
            .acx
            .methods
            .method(m)
            .body
            .as_ref()
            .map_or(0, |b| b.stmts.len());
        if pc >= stmt_count {
            self.end_of_pass(stmt_count);
            return;
        }
        match self.process_stmt(m, pc) {
            Step::Done => {
                if let Some(frame) = self.frames.last_mut() {
                    frame.pc += 1;
                }
            }
            Step::Requests(children) => {
                let mut pushed = false;
                for child in children {
                    pushed |= self.schedule(child);
                }
                if !pushed {
                    // nothing left to wait on; the re-execution already
                    // happened, move on
                    if let Some(frame) = self.frames.last_mut() {
                        frame.pc += 1;
                    }
                }
            }
        }
    }

    fn end_of_pass(&mut self, _stmt_count: usize) {
        let frame = self.frames.last_mut().expect("caller holds a frame");
        let m = frame.method;
        let summary_now = self.summaries.get(&m).cloned().unwrap_or_default();
        let changed = summary_now != frame.baseline;
        if changed && frame.pass + 1 < MAX_PASSES {
            frame.pass += 1;
            frame.pc = 0;
            frame.baseline = summary_now;
        } else {
            self.finish_frame();
        }
    }

    fn finish_frame(&mut self) {
        let frame = self.frames.pop().expect("caller holds a frame");
        let m = frame.method;
        self.complement_summary(m);
        let summary = self.summaries.entry(m).or_default();
        if summary.is_empty() {
            summary.set(SlotKey::Return, SummaryValue::assign(ContrValue::NotPolluted));
        }
        self.stack.pop_method();
        self.facts.remove(&m);
        self.analyzed.insert(m);
        self.analyzed_count += 1;
        if self.analyzed_count % 5000 == 0 {
            info!(
                "[+] have analyzed {} methods, {} methods in stack",
                self.analyzed_count,
                self.stack.depth()
            );
        }
    }

    /// Seeds the symbolic entry facts of a method: each parameter and the
    /// receiver flow in as controllable descriptors.
    fn seed_entry_facts(&mut self, m: MethodId) {
        let body = match &self.acx.methods.method(m).body {
            Some(b) => b,
            None => return,
        };
        let params = body.params.clone();
        let this_var = body.this_var;
        for (i, var) in params.iter().enumerate() {
            let ty = self.acx.vars.var(*var).ty;
            if self.acx.is_ignored_type(ty) {
                continue;
            }
            let p = self.var_ptr(*var);
            self.pfg.add_edge(
                p,
                PfgEdge::alloc(
                    FlowKind::NewContr,
                    AllocSource::ContrSeed {
                        value: ContrValue::param(i),
                        ty: Some(ty),
                    },
                    0,
                ),
            );
        }
        if let Some(tv) = this_var {
            let ty = self.acx.vars.var(tv).ty;
            let p = self.var_ptr(tv);
            self.pfg.add_edge(
                p,
                PfgEdge::alloc(
                    FlowKind::NewContr,
                    AllocSource::ContrSeed {
                        value: ContrValue::this(),
                        ty: Some(ty),
                    },
                    0,
                ),
            );
        }
    }

    /// Marks a callee reached through a controllable receiver as a fresh
    /// deserialization entry when its subsignature is a declared callback.
    pub(crate) fn on_new_deser(&mut self, m: MethodId) {
        if matches_source_subsig(self.acx, m) {
            self.dynamic_sources.insert(m);
        }
    }

    pub fn is_source(&self, m: MethodId) -> bool {
        self.acx.methods.method(m).is_source || self.dynamic_sources.contains(&m)
    }

    /// Declared sources plus the entries discovered during analysis.
    pub fn source_methods(&self) -> HashSet<MethodId> {
        let mut out: HashSet<MethodId> = self
            .acx
            .methods
            .iter()
            .filter(|(_, m)| m.is_source)
            .map(|(id, _)| id)
            .collect();
        out.extend(self.dynamic_sources.iter().copied());
        out
    }

    /// Hands the analysis results over to the collection phase.
    pub fn into_parts(self) -> (CallGraph, HashMap<MethodId, Summary>, HashSet<MethodId>) {
        let sources = self.source_methods();
        (self.cg, self.summaries, sources)
    }

    // ---- pointer helpers ----

    pub(crate) fn var_ptr(&mut self, v: VarId) -> PointerId {
        let var = self.acx.vars.var(v);
        self.ptrs
            .intern(PointerKind::Var(v), Some(var.ty), Some(var.method))
    }

    pub(crate) fn static_field_ptr(&mut self, field: crate::model::hierarchy::FieldId) -> PointerId {
        let ty = self.acx.hierarchy.field(field).ty;
        self.ptrs
            .intern(PointerKind::StaticField(field), Some(ty), None)
    }

    pub(crate) fn instance_field_ptr(
        &mut self,
        base: PointerId,
        field: crate::model::hierarchy::FieldId,
    ) -> PointerId {
        let ty = self.acx.hierarchy.field(field).ty;
        let method = self.ptrs.method(base);
        self.ptrs
            .intern(PointerKind::InstanceField { base, field }, Some(ty), method)
    }

    pub(crate) fn array_elem_ptr(&mut self, base: PointerId) -> PointerId {
        let elem_ty = self
            .ptrs
            .ty(base)
            .and_then(|t| self.acx.types.array_elem(t));
        let method = self.ptrs.method(base);
        self.ptrs
            .intern(PointerKind::ArrayElem { base }, elem_ty, method)
    }

    // ---- fact map ----

    pub(crate) fn fact(&self, m: MethodId, p: PointerId) -> Option<&Contr> {
        self.facts.get(&m).and_then(|f| f.get(&p))
    }

    /// Caches a fact, but only for pointers owned by the method being
    /// analyzed.
    pub(crate) fn update_fact(&mut self, m: MethodId, p: PointerId, contr: Contr) {
        if self.ptrs.method(p) == Some(m) {
            self.facts.entry(m).or_default().insert(p, contr);
        }
    }

    /// Invalidates the cached fact of `p` and everything downstream of it
    /// in the same method. A new in-edge makes previous merges stale.
    pub(crate) fn vars_to_requery(&mut self, m: MethodId, p: PointerId) {
        let mut visited = HashSet::new();
        let mut worklist = vec![p];
        while let Some(p) = worklist.pop() {
            if self.ptrs.method(p) != Some(m) || !visited.insert(p) {
                continue;
            }
            if let Some(facts) = self.facts.get_mut(&m) {
                facts.remove(&p);
            }
            worklist.extend(self.pfg.out_targets(p));
        }
    }

    /// Records a flow edge and invalidates stale caches behind its target.
    pub(crate) fn add_flow(&mut self, m: MethodId, tgt: PointerId, edge: PfgEdge) -> bool {
        let added = self.pfg.add_edge(tgt, edge);
        if added {
            self.vars_to_requery(m, tgt);
        }
        added
    }

    pub(crate) fn frame_mut(&mut self) -> &mut Frame {
        self.frames.last_mut().expect("active frame")
    }

    // ---- summary completion ----

    /// Folds leftover pointer state into the summary when a method's
    /// analysis ends: receiver fields written by the method, and parameter
    /// slots that accumulated real in-edges beyond their seed.
    fn complement_summary(&mut self, m: MethodId) {
        let body = match &self.acx.methods.method(m).body {
            Some(b) => b.clone(),
            None => return,
        };
        if let Some(tv) = body.this_var {
            let stores = self.this_field_stores(&body, tv);
            for field in stores {
                let field_ty = self.acx.hierarchy.field(field).ty;
                if self.acx.is_ignored_type(field_ty) {
                    continue;
                }
                let base = self.var_ptr(tv);
                let to = self.instance_field_ptr(base, field);
                if !self.pfg.has_in_edges(to) {
                    continue;
                }
                let name = self.acx.hierarchy.field(field).name.clone();
                let value = self.get_contr_value(m, Some(to));
                self.summaries
                    .entry(m)
                    .or_default()
                    .merge(SlotKey::ThisField(name), SummaryValue::assign(value));
            }
        }
        for (i, var) in body.params.iter().enumerate() {
            let p = self.var_ptr(*var);
            if self.pfg.in_degree(p) > 1 {
                self.pfg.remove_contr_seeds(p);
                if let Some(facts) = self.facts.get_mut(&m) {
                    facts.remove(&p);
                }
                let value = self.get_contr_value(m, Some(p));
                self.summaries
                    .entry(m)
                    .or_default()
                    .merge(SlotKey::Param(i), SummaryValue::assign(value));
            }
        }
    }

    /// Fields the method stores through its receiver.
    pub(crate) fn this_field_stores(
        &self,
        body: &crate::model::ir::MethodIr,
        this_var: VarId,
    ) -> Vec<crate::model::hierarchy::FieldId> {
        use crate::model::ir::StmtKind;
        let mut out = Vec::new();
        for stmt in &body.stmts {
            if let StmtKind::StoreField { base, field, .. } = &stmt.kind {
                if *base == this_var && !out.contains(field) {
                    out.push(*field);
                }
            }
        }
        out
    }
}
