// Copyright (c) 2024 <Wei Li>.
//
// This source code is licensed under the GNU license found in the
// LICENSE file in the root directory of this source tree.

//! Per-method intermediate representation.
//!
//! A method body is an ordered statement sequence; every statement carries
//! its source line, which the analysis uses both for reporting and for
//! path-sensitivity windows.

use serde::{Deserialize, Serialize};

use super::hierarchy::FieldId;
use super::method::MethodId;
use super::ty::TypeId;

/// Globally unique identifier of a local-variable occurrence.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VarId(pub u32);

#[derive(Clone, Serialize, Deserialize)]
pub struct Var {
    pub method: MethodId,
    pub name: String,
    pub ty: TypeId,
    /// Set when the variable holds a compile-time constant.
    pub constant: Option<Literal>,
}

impl Var {
    /// The receiver variable of instance methods is spelled `%this`.
    pub fn is_this(&self) -> bool {
        self.name == "%this"
    }

    pub fn const_string(&self) -> Option<&str> {
        match &self.constant {
            Some(Literal::Str(s)) => Some(s),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Literal {
    Str(String),
    /// A class literal constant (`T.class`).
    Class(TypeId),
    Int(i64),
    Null,
}

#[derive(Default, Serialize, Deserialize)]
pub struct VarTable {
    vars: Vec<Var>,
}

impl VarTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, var: Var) -> VarId {
        let id = VarId(self.vars.len() as u32);
        self.vars.push(var);
        id
    }

    pub fn var(&self, id: VarId) -> &Var {
        &self.vars[id.0 as usize]
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CallKind {
    Virtual,
    Interface,
    Special,
    Static,
    /// Invokedynamic-like sites are skipped by the analysis.
    Dynamic,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct InvokeStmt {
    pub kind: CallKind,
    /// Receiver variable; `None` for static calls.
    pub recv: Option<VarId>,
    pub args: Vec<VarId>,
    /// The resolved declared target. `None` when the reference does not
    /// resolve; such calls contribute no facts.
    pub target: Option<MethodId>,
    pub result: Option<VarId>,
}

#[derive(Clone, Serialize, Deserialize)]
pub enum StmtKind {
    /// `x = new T`.
    New { lhs: VarId, ty: TypeId },
    /// `x = <literal>`.
    AssignLiteral { lhs: VarId, literal: Literal },
    /// `x = y`.
    Copy { lhs: VarId, rhs: VarId },
    /// `x = (T) y`.
    Cast { lhs: VarId, rhs: VarId, ty: TypeId },
    /// `x = C.f`.
    LoadStatic { lhs: VarId, field: FieldId },
    /// `C.f = x`.
    StoreStatic { field: FieldId, rhs: VarId },
    /// `x = base.f`.
    LoadField { lhs: VarId, base: VarId, field: FieldId },
    /// `base.f = x`.
    StoreField { base: VarId, field: FieldId, rhs: VarId },
    /// `x = base[*]`.
    LoadArray { lhs: VarId, base: VarId },
    /// `base[*] = x`.
    StoreArray { base: VarId, rhs: VarId },
    /// Conditional jump; `target_line` is the fall-out line of the branch.
    If {
        op1: VarId,
        op2: Option<VarId>,
        target_line: u32,
    },
    /// `x = value instanceof T`.
    InstanceOf {
        lhs: VarId,
        value: VarId,
        check_ty: TypeId,
    },
    Return { value: Option<VarId> },
    Invoke(InvokeStmt),
}

#[derive(Clone, Serialize, Deserialize)]
pub struct Stmt {
    pub kind: StmtKind,
    pub line: u32,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct MethodIr {
    /// The receiver variable, absent for static methods.
    pub this_var: Option<VarId>,
    /// Parameter variables in declaration order.
    pub params: Vec<VarId>,
    pub stmts: Vec<Stmt>,
}
