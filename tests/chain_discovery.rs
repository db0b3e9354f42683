// Copyright (c) 2024 <Wei Li>.
//
// This source code is licensed under the GNU license found in the
// LICENSE file in the root directory of this source tree.

//! End-to-end checks: a small deserialization-style model analyzed from
//! source to sink, chain collection, and the persisted output format.

use rugc::analysis::summary::SlotKey;
use rugc::analysis::SummaryAnalysis;
use rugc::collector::GcCollector;
use rugc::model::ir::{CallKind, InvokeStmt, MethodIr, Stmt, StmtKind};
use rugc::model::knowledge::{Knowledge, SinkSpec};
use rugc::model::{AnalysisContext, ProgramBuilder};
use rugc::util::options::AnalysisOptions;
use rugc::util::results_dumper;

/// A readObject entry that hands a receiver-rooted command string to a
/// static process-execution sink through one gadget hop.
fn deser_model(max_len: usize) -> AnalysisContext {
    let mut b = ProgramBuilder::new();
    let void = b.types.by_name("void").unwrap();

    let object = b.add_class("java.lang.Object", None, false);
    let object_ty = b.hierarchy.class(object).ty;
    let string = b.add_class("java.lang.String", Some(object), true);
    let string_ty = b.hierarchy.class(string).ty;
    let runtime = b.add_class("java.lang.Runtime", Some(object), false);
    let exec = b.add_method_full(runtime, "exec", void, vec![string_ty], true, false, false);

    let gadget = b.add_class("demo.Gadget", Some(object), true);
    let gadget_ty = b.hierarchy.class(gadget).ty;
    let do_work = b.add_method(gadget, "doWork", void, vec![string_ty]);

    let evil = b.add_class("demo.Evil", Some(object), true);
    let evil_ty = b.hierarchy.class(evil).ty;
    let cmd = b.add_field(evil, "cmd", string_ty);
    let helper = b.add_field(evil, "helper", gadget_ty);
    let read_object = b.add_method(evil, "readObject", void, vec![object_ty]);

    let s = b.add_var(do_work, "s", string_ty);
    let this_g = b.add_var(do_work, "%this", gadget_ty);
    b.set_body(
        do_work,
        MethodIr {
            this_var: Some(this_g),
            params: vec![s],
            stmts: vec![
                Stmt {
                    kind: StmtKind::Invoke(InvokeStmt {
                        kind: CallKind::Static,
                        recv: None,
                        args: vec![s],
                        target: Some(exec),
                        result: None,
                    }),
                    line: 10,
                },
                Stmt {
                    kind: StmtKind::Return { value: None },
                    line: 11,
                },
            ],
        },
    );

    let this_e = b.add_var(read_object, "%this", evil_ty);
    let in_v = b.add_var(read_object, "in", object_ty);
    let h = b.add_var(read_object, "h", gadget_ty);
    let c = b.add_var(read_object, "c", string_ty);
    b.set_body(
        read_object,
        MethodIr {
            this_var: Some(this_e),
            params: vec![in_v],
            stmts: vec![
                Stmt {
                    kind: StmtKind::LoadField {
                        lhs: h,
                        base: this_e,
                        field: helper,
                    },
                    line: 20,
                },
                Stmt {
                    kind: StmtKind::LoadField {
                        lhs: c,
                        base: this_e,
                        field: cmd,
                    },
                    line: 21,
                },
                Stmt {
                    kind: StmtKind::Invoke(InvokeStmt {
                        kind: CallKind::Virtual,
                        recv: Some(h),
                        args: vec![c],
                        target: Some(do_work),
                        result: None,
                    }),
                    line: 22,
                },
                Stmt {
                    kind: StmtKind::Return { value: None },
                    line: 23,
                },
            ],
        },
    );

    let knowledge = Knowledge {
        sources: vec!["<demo.Evil: void readObject(java.lang.Object)>".to_string()],
        sinks: vec![SinkSpec {
            method: "<java.lang.Runtime: void exec(java.lang.String)>".to_string(),
            taint: vec![0],
            filter_extends_generic: false,
        }],
        ..Default::default()
    };
    let options = AnalysisOptions {
        max_len,
        ..Default::default()
    };
    b.finish(knowledge, options)
}

fn run_pipeline(acx: &AnalysisContext) -> Vec<Vec<rugc::graph::call_graph::CallEdge>> {
    let mut analysis = SummaryAnalysis::new(acx);
    analysis.run();
    let (mut cg, _summaries, sources) = analysis.into_parts();
    GcCollector::new(acx, sources).collect(&mut cg)
}

#[test]
fn discovers_chain_from_source_to_sink() {
    let acx = deser_model(8);
    let chains = run_pipeline(&acx);

    assert_eq!(chains.len(), 1);
    let chain = &chains[0];
    assert_eq!(chain.len(), 2);

    let read_object = acx
        .method_by_signature("<demo.Evil: void readObject(java.lang.Object)>")
        .unwrap();
    let do_work = acx
        .method_by_signature("<demo.Gadget: void doWork(java.lang.String)>")
        .unwrap();
    let exec = acx
        .method_by_signature("<java.lang.Runtime: void exec(java.lang.String)>")
        .unwrap();

    assert_eq!(chain[0].caller(), read_object);
    assert_eq!(chain[0].callee, do_work);
    assert_eq!(chain[1].caller(), do_work);
    assert_eq!(chain[1].callee, exec);

    assert_eq!(chain[0].int_contr, vec![-1, -1]);
    assert_eq!(chain[1].int_contr, vec![-3, 0]);
}

#[test]
fn chain_respects_length_bound() {
    let acx = deser_model(1);
    let chains = run_pipeline(&acx);
    assert!(chains.is_empty());
}

#[test]
fn chains_persist_in_line_format() {
    let acx = deser_model(8);
    let chains = run_pipeline(&acx);

    let mut out = Vec::new();
    results_dumper::write_chains(&acx, &chains, &mut out).unwrap();
    let text = String::from_utf8(out).unwrap();
    assert_eq!(
        text,
        "<demo.Evil: void readObject(java.lang.Object)>->[-1, -1]\n\
         <demo.Gadget: void doWork(java.lang.String)>->[-3, 0]\n\
         <java.lang.Runtime: void exec(java.lang.String)>\n\
         \n\
         total gadget chains : 1\n"
    );

    // parsing the persisted text reproduces the hops and the sink
    let parsed = results_dumper::parse_chains(&text).unwrap();
    assert_eq!(parsed.len(), chains.len());
    for (p, chain) in parsed.iter().zip(&chains) {
        assert_eq!(p.sink, acx.method_str(chain.last().unwrap().callee));
        for (hop, edge) in p.hops.iter().zip(chain) {
            assert_eq!(hop.0, acx.method_str(edge.caller()));
            assert_eq!(hop.1, edge.int_contr);
        }
    }
}

#[test]
fn receiver_field_store_summarizes_as_parameter() {
    let mut b = ProgramBuilder::new();
    let void = b.types.by_name("void").unwrap();
    let object = b.add_class("java.lang.Object", None, false);
    let string = b.add_class("java.lang.String", Some(object), true);
    let string_ty = b.hierarchy.class(string).ty;
    let holder = b.add_class("demo.Holder", Some(object), true);
    let holder_ty = b.hierarchy.class(holder).ty;
    let cmd = b.add_field(holder, "cmd", string_ty);
    let set_cmd = b.add_method(holder, "setCmd", void, vec![string_ty]);

    let p = b.add_var(set_cmd, "p", string_ty);
    let this_v = b.add_var(set_cmd, "%this", holder_ty);
    b.set_body(
        set_cmd,
        MethodIr {
            this_var: Some(this_v),
            params: vec![p],
            stmts: vec![
                Stmt {
                    kind: StmtKind::StoreField {
                        base: this_v,
                        field: cmd,
                        rhs: p,
                    },
                    line: 5,
                },
                Stmt {
                    kind: StmtKind::Return { value: None },
                    line: 6,
                },
            ],
        },
    );

    let acx = b.finish(Knowledge::default(), AnalysisOptions::default());
    let mut analysis = SummaryAnalysis::new(&acx);
    analysis.run();
    let (_cg, summaries, _sources) = analysis.into_parts();

    let set_cmd = acx
        .method_by_signature("<demo.Holder: void setCmd(java.lang.String)>")
        .unwrap();
    let summary = summaries.get(&set_cmd).expect("setter has a summary");
    let slot = summary
        .get(&SlotKey::ThisField("cmd".to_string()))
        .expect("field store escapes into the summary");
    assert_eq!(slot.value.to_string(), "param-0");
}

#[test]
fn copy_cycles_between_locals_terminate() {
    let mut b = ProgramBuilder::new();
    let void = b.types.by_name("void").unwrap();
    let object = b.add_class("java.lang.Object", None, false);
    let object_ty = b.hierarchy.class(object).ty;
    let string = b.add_class("java.lang.String", Some(object), true);
    let string_ty = b.hierarchy.class(string).ty;
    let runtime = b.add_class("java.lang.Runtime", Some(object), false);
    let exec = b.add_method_full(runtime, "exec", void, vec![string_ty], true, false, false);

    let evil = b.add_class("demo.Evil", Some(object), true);
    let evil_ty = b.hierarchy.class(evil).ty;
    let cmd = b.add_field(evil, "cmd", string_ty);
    let read_object = b.add_method(evil, "readObject", void, vec![object_ty]);

    let this_e = b.add_var(read_object, "%this", evil_ty);
    let in_v = b.add_var(read_object, "in", object_ty);
    let x = b.add_var(read_object, "x", string_ty);
    let y = b.add_var(read_object, "y", string_ty);
    b.set_body(
        read_object,
        MethodIr {
            this_var: Some(this_e),
            params: vec![in_v],
            stmts: vec![
                Stmt {
                    kind: StmtKind::LoadField {
                        lhs: x,
                        base: this_e,
                        field: cmd,
                    },
                    line: 30,
                },
                Stmt {
                    kind: StmtKind::Copy { lhs: y, rhs: x },
                    line: 31,
                },
                Stmt {
                    kind: StmtKind::Copy { lhs: x, rhs: y },
                    line: 32,
                },
                Stmt {
                    kind: StmtKind::Invoke(InvokeStmt {
                        kind: CallKind::Static,
                        recv: None,
                        args: vec![x],
                        target: Some(exec),
                        result: None,
                    }),
                    line: 33,
                },
                Stmt {
                    kind: StmtKind::Return { value: None },
                    line: 34,
                },
            ],
        },
    );

    let knowledge = Knowledge {
        sources: vec!["<demo.Evil: void readObject(java.lang.Object)>".to_string()],
        sinks: vec![SinkSpec {
            method: "<java.lang.Runtime: void exec(java.lang.String)>".to_string(),
            taint: vec![0],
            filter_extends_generic: false,
        }],
        ..Default::default()
    };
    let acx = b.finish(
        knowledge,
        AnalysisOptions {
            max_len: 8,
            ..Default::default()
        },
    );

    let chains = run_pipeline(&acx);
    assert_eq!(chains.len(), 1);
    assert_eq!(chains[0].len(), 1);
    assert_eq!(chains[0][0].int_contr, vec![-3, -1]);
}

/// A readObject that loads its tainted command, branches on it, and stores
/// it into a field of a fresh object inside the branch window; the load
/// back out of that field sits at `load_line`.
fn guarded_store_model(load_line: u32) -> AnalysisContext {
    let mut b = ProgramBuilder::new();
    let void = b.types.by_name("void").unwrap();
    let object = b.add_class("java.lang.Object", None, false);
    let object_ty = b.hierarchy.class(object).ty;
    let string = b.add_class("java.lang.String", Some(object), true);
    let string_ty = b.hierarchy.class(string).ty;
    let runtime = b.add_class("java.lang.Runtime", Some(object), false);
    let exec = b.add_method_full(runtime, "exec", void, vec![string_ty], true, false, false);

    let holder = b.add_class("demo.Holder", Some(object), true);
    let holder_ty = b.hierarchy.class(holder).ty;
    let f = b.add_field(holder, "f", string_ty);

    let evil = b.add_class("demo.Evil", Some(object), true);
    let evil_ty = b.hierarchy.class(evil).ty;
    let cmd = b.add_field(evil, "cmd", string_ty);
    let read_object = b.add_method(evil, "readObject", void, vec![object_ty]);

    let this_e = b.add_var(read_object, "%this", evil_ty);
    let in_v = b.add_var(read_object, "in", object_ty);
    let o = b.add_var(read_object, "o", holder_ty);
    let x = b.add_var(read_object, "x", string_ty);
    let y = b.add_var(read_object, "y", string_ty);
    b.set_body(
        read_object,
        MethodIr {
            this_var: Some(this_e),
            params: vec![in_v],
            stmts: vec![
                Stmt {
                    kind: StmtKind::New { lhs: o, ty: holder_ty },
                    line: 38,
                },
                Stmt {
                    kind: StmtKind::LoadField {
                        lhs: x,
                        base: this_e,
                        field: cmd,
                    },
                    line: 39,
                },
                Stmt {
                    kind: StmtKind::If {
                        op1: x,
                        op2: None,
                        target_line: 50,
                    },
                    line: 40,
                },
                Stmt {
                    kind: StmtKind::StoreField {
                        base: o,
                        field: f,
                        rhs: x,
                    },
                    line: 41,
                },
                Stmt {
                    kind: StmtKind::LoadField {
                        lhs: y,
                        base: o,
                        field: f,
                    },
                    line: load_line,
                },
                Stmt {
                    kind: StmtKind::Invoke(InvokeStmt {
                        kind: CallKind::Static,
                        recv: None,
                        args: vec![y],
                        target: Some(exec),
                        result: None,
                    }),
                    line: load_line + 1,
                },
                Stmt {
                    kind: StmtKind::Return { value: None },
                    line: 52,
                },
            ],
        },
    );

    let knowledge = Knowledge {
        sources: vec!["<demo.Evil: void readObject(java.lang.Object)>".to_string()],
        sinks: vec![SinkSpec {
            method: "<java.lang.Runtime: void exec(java.lang.String)>".to_string(),
            taint: vec![0],
            filter_extends_generic: false,
        }],
        ..Default::default()
    };
    b.finish(
        knowledge,
        AnalysisOptions {
            max_len: 8,
            ..Default::default()
        },
    )
}

#[test]
fn guarded_field_store_is_invisible_after_the_branch() {
    // the window closes at line 50, so the load sees nothing
    let acx = guarded_store_model(50);
    let chains = run_pipeline(&acx);
    assert!(chains.is_empty());
}

#[test]
fn guarded_field_store_is_visible_inside_the_branch() {
    let acx = guarded_store_model(45);
    let chains = run_pipeline(&acx);
    assert_eq!(chains.len(), 1);
    assert_eq!(chains[0].len(), 1);
    assert_eq!(chains[0][0].int_contr, vec![-3, -1]);
}
