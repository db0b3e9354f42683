// Copyright (c) 2024 <Wei Li>.
//
// This source code is licensed under the GNU license found in the
// LICENSE file in the root directory of this source tree.

//! The program model: type system, class hierarchy, method table and IR,
//! plus the [`AnalysisContext`] that owns them.
//!
//! Loading compiled artifacts into this model is a collaborator's job; the
//! analysis only ever sees the interned arenas behind the context.

use log::warn;
use regex::Regex;
use serde::{Deserialize, Serialize};

pub mod hierarchy;
pub mod ir;
pub mod knowledge;
pub mod method;
pub mod ty;

use crate::util::options::AnalysisOptions;
use hierarchy::{Class, ClassHierarchy, ClassId, Field, FieldId};
use ir::{CallKind, InvokeStmt, Literal, MethodIr, Var, VarId, VarTable};
use knowledge::{parse_signature, Knowledge};
use method::{render_subsig, Method, MethodId, MethodSig, Methods};
use ty::{TypeId, TypeKind, TypeSystem};

/// Serializable bundle of the model arenas, the on-disk program form.
#[derive(Serialize, Deserialize)]
pub struct Program {
    pub types: TypeSystem,
    pub hierarchy: ClassHierarchy,
    pub methods: Methods,
    pub vars: VarTable,
}

/// Global information of the analysis.
///
/// Constructed once and passed by reference to every component; there is no
/// ambient global state anywhere in the crate.
pub struct AnalysisContext {
    pub options: AnalysisOptions,
    pub types: TypeSystem,
    pub hierarchy: ClassHierarchy,
    pub methods: Methods,
    pub vars: VarTable,
    pub knowledge: Knowledge,

    /// Declared entry methods, in declaration order.
    pub sources: Vec<MethodId>,
    /// Declared sink methods.
    pub sinks: Vec<MethodId>,
    /// Registered proxy invocation-handler methods.
    pub invocation_handlers: Vec<MethodId>,
}

impl AnalysisContext {
    pub fn from_program(
        program: Program,
        knowledge: Knowledge,
        options: AnalysisOptions,
    ) -> Self {
        let mut builder = ProgramBuilder {
            types: program.types,
            hierarchy: program.hierarchy,
            methods: program.methods,
            vars: program.vars,
        };
        builder.types.rebuild_index();
        builder.hierarchy.rebuild_index();
        builder.methods.rebuild_index();
        builder.finish(knowledge, options)
    }

    // ---- type system wrappers ----

    pub fn is_subtype(&self, sup: TypeId, sub: TypeId) -> bool {
        self.types.is_subtype(&self.hierarchy, sup, sub)
    }

    pub fn compatible(&self, a: TypeId, b: TypeId) -> bool {
        self.types.compatible(&self.hierarchy, a, b)
    }

    pub fn all_subtype(&self, expand: Option<TypeId>, args: &[TypeId], params: &[TypeId]) -> bool {
        self.types
            .all_subtype(&self.hierarchy, expand, args, params)
    }

    pub fn is_string_type(&self, ty: TypeId) -> bool {
        self.types.name(ty) == "java.lang.String"
    }

    pub fn is_serializable_type(&self, ty: TypeId) -> bool {
        match self.types.kind(ty) {
            TypeKind::Class(c) => self.hierarchy.class(*c).is_serializable,
            TypeKind::Array { elem } => self.is_serializable_type(*elem),
            TypeKind::Primitive => true,
            TypeKind::Null => false,
        }
    }

    /// Types the value model never tracks: primitives, null, and the
    /// configured ignore-list types.
    pub fn is_ignored_type(&self, ty: TypeId) -> bool {
        match self.types.kind(ty) {
            TypeKind::Primitive | TypeKind::Null => true,
            _ => self
                .knowledge
                .ignored_classes
                .iter()
                .any(|n| n == self.types.name(ty)),
        }
    }

    pub fn is_ignored_method(&self, id: MethodId) -> bool {
        let m = self.methods.method(id);
        m.is_ignored || self.hierarchy.class(m.sig.class).methods_ignored
    }

    // ---- method helpers ----

    /// Renders the full `<pkg.Class: ret name(args)>` signature, the form
    /// used in persisted chains.
    pub fn method_str(&self, id: MethodId) -> String {
        let m = self.methods.method(id);
        format!(
            "<{}: {}>",
            self.hierarchy.class(m.sig.class).name,
            m.subsig
        )
    }

    pub fn method_by_signature(&self, sig: &str) -> Option<MethodId> {
        let (class, subsig) = parse_signature(sig)?;
        let class = self.hierarchy.by_name(class)?;
        self.methods.by_subsig(class, subsig)
    }

    pub fn class_of_type(&self, ty: TypeId) -> Option<ClassId> {
        match self.types.kind(ty) {
            TypeKind::Class(c) => Some(*c),
            // Arrays dispatch through the root class.
            TypeKind::Array { .. } => self
                .hierarchy
                .classes()
                .find(|(c, _)| self.hierarchy.is_root_class(*c))
                .map(|(c, _)| c),
            _ => None,
        }
    }

    pub fn clinit_of(&self, class: ClassId) -> Option<MethodId> {
        self.methods.by_subsig(class, "void <clinit>()")
    }

    // ---- dispatch ----

    /// Resolves a call site against a concrete receiver type.
    pub fn resolve_callee(&self, ty: TypeId, invoke: &InvokeStmt) -> Option<MethodId> {
        let target = invoke.target?;
        let target_m = self.methods.method(target);
        match invoke.kind {
            CallKind::Virtual | CallKind::Interface => {
                let class = self.class_of_type(ty)?;
                self.hierarchy
                    .dispatch(&self.methods, class, &target_m.subsig)
            }
            CallKind::Special => {
                self.hierarchy
                    .dispatch(&self.methods, target_m.sig.class, &target_m.subsig)
            }
            CallKind::Static => Some(target),
            CallKind::Dynamic => None,
        }
    }

    /// Class-hierarchy resolution of all possible callees of an invocation.
    ///
    /// A call through `%this` dispatches precisely on the enclosing class
    /// instead of fanning out over the hierarchy.
    pub fn resolve_callees_of(&self, invoke: &InvokeStmt) -> Vec<MethodId> {
        let target = match invoke.target {
            Some(t) => t,
            None => return Vec::new(),
        };
        let target_m = self.methods.method(target);
        if invoke.kind == CallKind::Static {
            return vec![target];
        }
        if let Some(recv) = invoke.recv {
            if self.vars.var(recv).is_this() {
                let ty = self.hierarchy.class(target_m.sig.class).ty;
                if let Some(callee) = self.resolve_callee(ty, invoke) {
                    return vec![callee];
                }
            }
        }
        if invoke.kind == CallKind::Special {
            return self.resolve_callee(TypeId(0), invoke).into_iter().collect();
        }
        let mut callees = Vec::new();
        for sub in self.hierarchy.subclasses_of(target_m.sig.class) {
            if self.hierarchy.class(sub).is_abstract {
                continue;
            }
            if let Some(callee) = self
                .hierarchy
                .dispatch(&self.methods, sub, &target_m.subsig)
            {
                if !callees.contains(&callee) {
                    callees.push(callee);
                }
            }
        }
        callees
    }

    /// Resolves the single-abstract-method `run()` idiom on a class.
    pub fn resolve_run_method(&self, ty: TypeId) -> Option<MethodId> {
        let class = self.class_of_type(ty)?;
        self.hierarchy
            .dispatch(&self.methods, class, "java.lang.Object run()")
    }

    // ---- reflective method lookup ----

    /// Reflective candidate filtering for dynamic instantiation: class named
    /// by `class_pattern` (a literal name or a regex), method named `name`.
    pub fn filter_methods_by_class(
        &self,
        class_pattern: &str,
        name: &str,
        arg_types: &[TypeId],
        recv_controllable: bool,
        filter_non_serializable: bool,
        expand_arg: Option<TypeId>,
    ) -> Vec<MethodId> {
        let pattern = compile_pattern(class_pattern);
        self.filter_methods_impl(
            |acx, m| {
                let class_name = &acx.hierarchy.class(m.sig.class).name;
                let class_ok = match &pattern {
                    Some(re) => re.is_match(class_name),
                    None => class_name == class_pattern,
                };
                class_ok && m.sig.name == name
            },
            None,
            arg_types,
            recv_controllable,
            filter_non_serializable,
            expand_arg,
        )
    }

    /// Reflective candidate filtering for dynamic member lookup: method name
    /// matching `name_pattern` on a receiver of type `recv_ty`.
    pub fn filter_methods_by_name(
        &self,
        name_pattern: &str,
        recv_ty: TypeId,
        arg_types: &[TypeId],
        recv_controllable: bool,
        filter_non_serializable: bool,
        expand_arg: Option<TypeId>,
    ) -> Vec<MethodId> {
        let pattern = compile_pattern(name_pattern);
        self.filter_methods_impl(
            |_, m| match &pattern {
                Some(re) => re.is_match(&m.sig.name),
                None => m.sig.name == name_pattern,
            },
            Some(recv_ty),
            arg_types,
            recv_controllable,
            filter_non_serializable,
            expand_arg,
        )
    }

    fn filter_methods_impl(
        &self,
        name_match: impl Fn(&Self, &Method) -> bool,
        recv_ty: Option<TypeId>,
        arg_types: &[TypeId],
        recv_controllable: bool,
        filter_non_serializable: bool,
        expand_arg: Option<TypeId>,
    ) -> Vec<MethodId> {
        self.methods
            .iter()
            .filter(|(_, m)| name_match(self, m))
            .filter(|(_, m)| {
                let class = self.hierarchy.class(m.sig.class);
                !m.is_abstract
                    && !m.is_private
                    && recv_ty.map_or(true, |t| self.is_subtype(t, class.ty))
                    && (recv_controllable || class.is_serializable)
                    && (!filter_non_serializable
                        || m.sig.params.iter().all(|p| self.is_serializable_type(*p)))
            })
            .filter(|(_, m)| self.all_subtype(expand_arg, arg_types, &m.sig.params))
            .map(|(id, _)| id)
            .collect()
    }

    pub fn const_string(&self, var: VarId) -> Option<&str> {
        self.vars.var(var).const_string()
    }
}

/// Compiles a lookup pattern: names containing `*` are regexes, plain names
/// compare literally. A malformed pattern degrades to no match.
fn compile_pattern(pattern: &str) -> Option<Regex> {
    if !pattern.contains('*') {
        return None;
    }
    match Regex::new(pattern) {
        Ok(re) => Some(re),
        Err(e) => {
            warn!("[-] unusable lookup pattern {:?}: {}", pattern, e);
            Regex::new("$^").ok()
        }
    }
}

/// Incremental model construction, the collaborator-facing input API.
#[derive(Default)]
pub struct ProgramBuilder {
    pub types: TypeSystem,
    pub hierarchy: ClassHierarchy,
    pub methods: Methods,
    pub vars: VarTable,
}

impl ProgramBuilder {
    pub fn new() -> Self {
        let mut b = Self::default();
        for prim in ["void", "int", "boolean", "long", "char", "byte", "float", "double"] {
            b.types.intern(prim, TypeKind::Primitive);
        }
        b.types.intern("null-type", TypeKind::Null);
        b
    }

    pub fn add_class(
        &mut self,
        name: &str,
        superclass: Option<ClassId>,
        is_serializable: bool,
    ) -> ClassId {
        self.add_class_full(name, superclass, Vec::new(), false, false, is_serializable)
    }

    pub fn add_class_full(
        &mut self,
        name: &str,
        superclass: Option<ClassId>,
        interfaces: Vec<ClassId>,
        is_interface: bool,
        is_abstract: bool,
        is_serializable: bool,
    ) -> ClassId {
        let next_id = ClassId(self.hierarchy.classes().count() as u32);
        let ty = self.types.intern(name, TypeKind::Class(next_id));
        self.hierarchy.add_class(Class {
            name: name.to_string(),
            ty,
            superclass,
            interfaces,
            is_interface,
            is_abstract,
            is_serializable,
            methods_ignored: false,
            fields: Vec::new(),
            methods: Default::default(),
        })
    }

    pub fn array_of(&mut self, elem: TypeId) -> TypeId {
        let name = format!("{}[]", self.types.name(elem));
        self.types.intern(&name, TypeKind::Array { elem })
    }

    pub fn add_field(&mut self, class: ClassId, name: &str, ty: TypeId) -> FieldId {
        self.add_field_full(class, name, ty, false, None)
    }

    pub fn add_field_full(
        &mut self,
        class: ClassId,
        name: &str,
        ty: TypeId,
        is_static: bool,
        generic_signature: Option<String>,
    ) -> FieldId {
        self.hierarchy.add_field(Field {
            class,
            name: name.to_string(),
            ty,
            is_static,
            generic_signature,
        })
    }

    pub fn add_method(
        &mut self,
        class: ClassId,
        name: &str,
        ret: TypeId,
        params: Vec<TypeId>,
    ) -> MethodId {
        self.add_method_full(class, name, ret, params, false, false, false)
    }

    pub fn add_method_full(
        &mut self,
        class: ClassId,
        name: &str,
        ret: TypeId,
        params: Vec<TypeId>,
        is_static: bool,
        is_abstract: bool,
        is_private: bool,
    ) -> MethodId {
        let param_names: Vec<&str> = params.iter().map(|p| self.types.name(*p)).collect();
        let subsig = render_subsig(self.types.name(ret), name, &param_names);
        let id = self.methods.add(Method {
            sig: MethodSig {
                class,
                name: name.to_string(),
                ret,
                params,
            },
            subsig: subsig.clone(),
            is_static,
            is_abstract,
            is_private,
            body: None,
            is_source: false,
            sink: None,
            sink_filter_extends_generic: false,
            is_ignored: false,
            transfers: Vec::new(),
            behavior: None,
            is_invoke: false,
        });
        self.hierarchy.class_mut(class).methods.insert(subsig, id);
        id
    }

    pub fn add_var(&mut self, method: MethodId, name: &str, ty: TypeId) -> VarId {
        self.add_var_full(method, name, ty, None)
    }

    pub fn add_var_full(
        &mut self,
        method: MethodId,
        name: &str,
        ty: TypeId,
        constant: Option<Literal>,
    ) -> VarId {
        self.vars.add(Var {
            method,
            name: name.to_string(),
            ty,
            constant,
        })
    }

    pub fn set_body(&mut self, method: MethodId, body: MethodIr) {
        self.methods.method_mut(method).body = Some(body);
    }

    /// Applies the knowledge configuration and freezes the model.
    pub fn finish(mut self, knowledge: Knowledge, options: AnalysisOptions) -> AnalysisContext {
        let mut sources = Vec::new();
        let mut sinks = Vec::new();
        let mut invocation_handlers = Vec::new();

        let lookup = |methods: &Methods, hierarchy: &ClassHierarchy, sig: &str| -> Option<MethodId> {
            let (class, subsig) = parse_signature(sig)?;
            let class = hierarchy.by_name(class)?;
            methods.by_subsig(class, subsig)
        };

        for sig in &knowledge.sources {
            match lookup(&self.methods, &self.hierarchy, sig) {
                Some(id) => {
                    self.methods.method_mut(id).is_source = true;
                    sources.push(id);
                }
                None => warn!("[-] unknown source method {}", sig),
            }
        }
        for sink in &knowledge.sinks {
            match lookup(&self.methods, &self.hierarchy, &sink.method) {
                Some(id) => {
                    let m = self.methods.method_mut(id);
                    m.sink = Some(sink.taint.clone());
                    m.sink_filter_extends_generic = sink.filter_extends_generic;
                    sinks.push(id);
                }
                None => warn!("[-] unknown sink method {}", sink.method),
            }
        }
        for sig in &knowledge.ignored_methods {
            if let Some(id) = lookup(&self.methods, &self.hierarchy, sig) {
                self.methods.method_mut(id).is_ignored = true;
            }
        }
        for name in &knowledge.ignored_classes {
            if let Some(class) = self.hierarchy.by_name(name) {
                self.hierarchy.class_mut(class).methods_ignored = true;
            }
        }
        for spec in &knowledge.transfers {
            if let Some(id) = lookup(&self.methods, &self.hierarchy, &spec.method) {
                self.methods
                    .method_mut(id)
                    .transfers
                    .push(spec.transfer.clone());
            }
        }
        for spec in &knowledge.behaviors {
            match lookup(&self.methods, &self.hierarchy, &spec.method) {
                Some(id) => self.methods.method_mut(id).behavior = Some(spec.behavior.clone()),
                None => warn!("[-] unknown behavior method {}", spec.method),
            }
        }
        for sig in &knowledge.invocation_handlers {
            if let Some(id) = lookup(&self.methods, &self.hierarchy, sig) {
                let serializable = {
                    let m = self.methods.method(id);
                    self.hierarchy.class(m.sig.class).is_serializable
                };
                if serializable || !options.filter_non_serializable {
                    self.methods.method_mut(id).is_invoke = true;
                    invocation_handlers.push(id);
                }
            }
        }

        AnalysisContext {
            options,
            types: self.types,
            hierarchy: self.hierarchy,
            methods: self.methods,
            vars: self.vars,
            knowledge,
            sources,
            sinks,
            invocation_handlers,
        }
    }
}

/// Marks methods whose subsignature is a declared deserialization callback
/// as additional entry points once discovered.
pub fn matches_source_subsig(acx: &AnalysisContext, id: MethodId) -> bool {
    let subsig = &acx.methods.method(id).subsig;
    acx.knowledge
        .source_subsignatures
        .iter()
        .any(|s| s == subsig)
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// A tiny model with the core classes the unit tests lean on.
    pub fn small_model() -> AnalysisContext {
        let mut b = ProgramBuilder::new();
        let int_ty = b.types.by_name("int").unwrap();
        let object = b.add_class("java.lang.Object", None, false);
        b.add_method(object, "hashCode", int_ty, vec![]);
        let string = b.add_class("java.lang.String", Some(object), true);
        b.add_method(string, "length", int_ty, vec![]);
        b.finish(Knowledge::default(), AnalysisOptions::default())
    }
}
