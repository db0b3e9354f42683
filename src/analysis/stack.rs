// Copyright (c) 2024 <Wei Li>.
//
// This source code is licensed under the GNU license found in the
// LICENSE file in the root directory of this source tree.

//! Call-state bookkeeping for the on-demand analysis: the active method
//! stack, the pointer query stack, conditional windows and instanceof
//! refinements.

use std::collections::HashMap;

use crate::graph::pfg::PointerId;
use crate::model::ir::VarId;
use crate::model::method::MethodId;
use crate::model::ty::TypeId;

/// An open conditional window: stores recorded between `start_line` and
/// `end_line` are invisible outside the branch.
#[derive(Clone, Copy, Debug)]
pub struct IfWindow {
    pub start_line: u32,
    pub end_line: u32,
    /// Left operand of the comparison.
    pub op1: VarId,
    pub method: MethodId,
}

#[derive(Default)]
pub struct StackManager {
    method_stack: Vec<MethodId>,
    query_stack: Vec<PointerId>,
    if_stack: Vec<IfWindow>,
    /// Result var of an instanceof check -> checked pointer.
    instanceof_ret: HashMap<PointerId, PointerId>,
    /// Checked pointer -> refined type within the guarded region.
    instanceof_ty: HashMap<PointerId, TypeId>,
    /// Guarded-region end (method, line) -> checked pointer.
    instanceof_end: HashMap<(MethodId, u32), PointerId>,
}

impl StackManager {
    pub fn new() -> Self {
        Self::default()
    }

    // ---- method stack ----

    pub fn push_method(&mut self, m: MethodId) {
        self.method_stack.push(m);
    }

    pub fn pop_method(&mut self) -> Option<MethodId> {
        self.method_stack.pop()
    }

    pub fn contains_method(&self, m: MethodId) -> bool {
        self.method_stack.contains(&m)
    }

    pub fn depth(&self) -> usize {
        self.method_stack.len()
    }

    // ---- query stack ----

    pub fn push_query(&mut self, p: PointerId) {
        self.query_stack.push(p);
    }

    pub fn pop_query(&mut self) {
        self.query_stack.pop();
    }

    pub fn contains_query(&self, p: PointerId) -> bool {
        self.query_stack.contains(&p)
    }

    // ---- conditional windows ----

    pub fn push_if(&mut self, window: IfWindow) {
        self.if_stack.push(window);
    }

    /// The current window, if it was opened by `m`.
    pub fn cur_if_of(&self, m: MethodId) -> Option<&IfWindow> {
        self.if_stack.last().filter(|w| w.method == m)
    }

    pub fn is_if_end(&self, m: MethodId, line: u32) -> bool {
        self.if_stack
            .last()
            .map_or(false, |w| w.method == m && w.end_line == line)
    }

    pub fn pop_if(&mut self) {
        self.if_stack.pop();
    }

    // ---- instanceof refinement ----

    pub fn put_instanceof(&mut self, ret: PointerId, checked: PointerId, ty: TypeId) {
        self.instanceof_ret.insert(ret, checked);
        self.instanceof_ty.insert(checked, ty);
    }

    pub fn take_instanceof_ret(&mut self, ret: PointerId) -> Option<PointerId> {
        self.instanceof_ret.remove(&ret)
    }

    pub fn put_instanceof_end(&mut self, m: MethodId, line: u32, checked: PointerId) {
        self.instanceof_end.insert((m, line), checked);
    }

    pub fn instanceof_ty(&self, p: PointerId) -> Option<TypeId> {
        self.instanceof_ty.get(&p).copied()
    }

    /// Clears the refinement when the guarded region ends at this statement.
    pub fn clear_instanceof_end(&mut self, m: MethodId, line: u32) {
        if let Some(p) = self.instanceof_end.remove(&(m, line)) {
            self.instanceof_ty.remove(&p);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_stack_guards_reentry() {
        let mut stack = StackManager::new();
        let p = PointerId(7);
        assert!(!stack.contains_query(p));
        stack.push_query(p);
        assert!(stack.contains_query(p));
        stack.pop_query();
        assert!(!stack.contains_query(p));
    }

    #[test]
    fn instanceof_refinement_is_scoped() {
        let mut stack = StackManager::new();
        let m = MethodId(0);
        let ret = PointerId(1);
        let checked = PointerId(2);
        stack.put_instanceof(ret, checked, TypeId(3));
        assert_eq!(stack.take_instanceof_ret(ret), Some(checked));
        stack.put_instanceof_end(m, 20, checked);
        assert_eq!(stack.instanceof_ty(checked), Some(TypeId(3)));
        stack.clear_instanceof_end(m, 20);
        assert_eq!(stack.instanceof_ty(checked), None);
    }
}
