// Copyright (c) 2024 <Wei Li>.
//
// This source code is licensed under the GNU license found in the
// LICENSE file in the root directory of this source tree.

//! End-to-end solver scenarios over small hand-built modules.

use specanders::graph::cg::ConstraintKind;
use specanders::graph::value_map::{ValueId, ValueMap};
use specanders::ir::analysis_context::AnalysisContext;
use specanders::ir::builder::ModuleBuilder;
use specanders::ir::function::Operand;
use specanders::ir::module::Module;
use specanders::pta::andersen::SpecAndersPTA;
use specanders::pta::{AliasResult, PointerAnalysis};
use specanders::util::bit_vec::Idx;
use specanders::util::options::AnalysisOptions;

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn pts_vec(pta: &mut SpecAndersPTA, op: &Operand) -> Vec<ValueId> {
    let mut v: Vec<ValueId> = pta.points_to_of(op).iter().collect();
    v.sort();
    v
}

/// Universally quantified solver invariants, checked at fixed point.
fn check_solver_invariants(pta: &SpecAndersPTA) {
    let graph = pta.graph();
    let cg = graph.cg();

    for cons in cg.constraints() {
        let src_pts = graph.node(cons.src()).ptsto();
        let dest_pts = graph.node(cons.dest()).ptsto();
        match cons.kind() {
            // Inclusion soundness of plain copies.
            ConstraintKind::Copy if cons.offs() == 0 => {
                for e in src_pts.iter() {
                    assert!(
                        e == ValueMap::NULL_VALUE
                            || e == ValueMap::INT_VALUE
                            || dest_pts.contains(e),
                        "copy inclusion violated for {:?}",
                        cons
                    );
                }
            }
            ConstraintKind::Copy => {}
            // Address-of completeness.
            ConstraintKind::AddressOf => {
                let bit = ValueId::new(cons.src().index() + cons.offs() as usize);
                assert!(dest_pts.contains(bit), "address-of bit missing for {:?}", cons);
            }
            // Load closure.
            ConstraintKind::Load => {
                for y in src_pts.iter() {
                    if y == ValueMap::NULL_VALUE || y == ValueMap::INT_VALUE {
                        continue;
                    }
                    for e in graph.node(y).ptsto().iter() {
                        assert!(dest_pts.contains(e), "load closure violated for {:?}", cons);
                    }
                }
            }
            // Store closure.
            ConstraintKind::Store => {
                for y in dest_pts.iter() {
                    if y == ValueMap::NULL_VALUE || y == ValueMap::INT_VALUE {
                        continue;
                    }
                    let y_pts = graph.node(y).ptsto();
                    for e in src_pts.iter() {
                        assert!(y_pts.contains(e), "store closure violated for {:?}", cons);
                    }
                }
            }
        }
    }

    // Rep canonicity: merged slots hold no state.
    for idx in 0..graph.size() {
        if !graph.is_rep(ValueId::new(idx)) {
            let node = graph.node_raw(idx);
            assert!(node.ptsto().is_empty());
            assert!(node.copy_succs().is_empty());
            assert!(node.gep_succs().is_empty());
        }
    }
}

#[test]
fn store_load_basic() {
    init_logger();
    let mut mb = ModuleBuilder::new();
    let i8t = mb.int(8);
    let p8 = mb.ptr(i8t);
    let void = mb.void();
    let main = mb.declare_fcn("main", vec![], void);
    let (p, q, r) = {
        let mut fb = mb.body(main);
        let p = fb.alloca(i8t);
        let q = fb.alloca(p8);
        fb.store(p.clone(), q.clone());
        let r = fb.load(q.clone());
        fb.ret(None);
        (p, q, r)
    };
    let module = mb.finish();

    let mut acx = AnalysisContext::new(&module, AnalysisOptions::default());
    let mut pta = SpecAndersPTA::new(&mut acx);
    pta.analyze();

    let p_pts = pts_vec(&mut pta, &p);
    assert_eq!(p_pts.len(), 1, "p points to exactly its allocation");
    assert_eq!(pts_vec(&mut pta, &r), p_pts);

    assert_eq!(pta.alias(&r, &p), AliasResult::MayAlias);
    assert_eq!(pta.alias(&q, &p), AliasResult::NoAlias);

    check_solver_invariants(&pta);
}

#[test]
fn function_pointer_through_global() {
    init_logger();
    let mut mb = ModuleBuilder::new();
    let i8t = mb.int(8);
    let p8 = mb.ptr(i8t);
    let void = mb.void();

    let f = mb.declare_fcn("f", vec![p8], p8);
    {
        let mut fb = mb.body(f);
        let a0 = fb.arg(0);
        fb.ret(Some(a0));
    }

    let fptr_ty = mb.fcn_val_ty(f);
    let null_init = mb.const_null(fptr_ty);
    let g = mb.add_global("g", fptr_ty, Some(null_init));

    let main = mb.declare_fcn("main", vec![], void);
    let (fp, a, r) = {
        let f_const = mb.const_fcn(f);
        let g_const = mb.const_global(g);
        let mut fb = mb.body(main);
        fb.store(f_const.into(), Operand::Const(g_const.clone()));
        let fp = fb.load(Operand::Const(g_const));
        let a = fb.alloca(i8t);
        let r = fb.call_ind(fp.clone(), vec![a.clone()], p8);
        fb.ret(None);
        (fp, a, r)
    };
    let module = mb.finish();

    let mut acx = AnalysisContext::new(&module, AnalysisOptions::default());
    let mut pta = SpecAndersPTA::new(&mut acx);
    pta.analyze();

    // The function pointer picked up f's address object.
    assert_eq!(pts_vec(&mut pta, &fp).len(), 1);
    // The call connected f's body: its return carries a's allocation.
    let a_pts = pts_vec(&mut pta, &a);
    assert_eq!(a_pts.len(), 1);
    let r_pts = pts_vec(&mut pta, &r);
    assert!(
        r_pts.contains(&a_pts[0]),
        "indirect call did not connect argument to return"
    );

    check_solver_invariants(&pta);
}

#[test]
fn recursive_function_terminates() {
    init_logger();
    let mut mb = ModuleBuilder::new();
    let i8t = mb.int(8);
    let p8 = mb.ptr(i8t);
    let void = mb.void();

    let rec = mb.declare_fcn("rec", vec![p8], p8);
    {
        let mut fb = mb.body(rec);
        let a0 = fb.arg(0);
        let _r = fb.call(rec, vec![a0.clone()]);
        fb.ret(Some(a0));
    }

    let main = mb.declare_fcn("main", vec![], void);
    let (x, y) = {
        let mut fb = mb.body(main);
        let x = fb.alloca(i8t);
        let y = fb.call(rec, vec![x.clone()]);
        fb.ret(None);
        (x, y)
    };
    let module = mb.finish();

    let mut acx = AnalysisContext::new(&module, AnalysisOptions::default());
    let mut pta = SpecAndersPTA::new(&mut acx);
    pta.analyze();

    let x_pts = pts_vec(&mut pta, &x);
    assert_eq!(x_pts.len(), 1);
    let y_pts = pts_vec(&mut pta, &y);
    assert!(y_pts.contains(&x_pts[0]));

    check_solver_invariants(&pta);
}

#[test]
fn gep_separates_struct_fields() {
    init_logger();
    let mut mb = ModuleBuilder::new();
    let i8t = mb.int(8);
    let p8 = mb.ptr(i8t);
    let s = mb.strct(vec![p8, p8]);
    let void = mb.void();

    let main = mb.declare_fcn("main", vec![], void);
    let (p0, q, x, y) = {
        let mut fb = mb.body(main);
        let p = fb.alloca(s);
        let q = fb.gep(p.clone(), vec![0, 1]);
        let x = fb.alloca(i8t);
        fb.store(x.clone(), q.clone());
        let y = fb.load(q.clone());
        let p0 = fb.gep(p, vec![0, 0]);
        fb.ret(None);
        (p0, q, x, y)
    };
    let module = mb.finish();

    let mut acx = AnalysisContext::new(&module, AnalysisOptions::default());
    let mut pta = SpecAndersPTA::new(&mut acx);
    pta.analyze();

    assert_eq!(pts_vec(&mut pta, &y), pts_vec(&mut pta, &x));

    // The two field pointers stay disjoint.
    let p0_pts = pts_vec(&mut pta, &p0);
    let q_pts = pts_vec(&mut pta, &q);
    assert!(!p0_pts.is_empty() && !q_pts.is_empty());
    assert!(p0_pts.iter().all(|e| !q_pts.contains(e)));
    assert_eq!(pta.alias(&p0, &q), AliasResult::NoAlias);

    check_solver_invariants(&pta);
}

#[test]
fn struct_to_array_cast_unions_fields() {
    init_logger();
    let mut mb = ModuleBuilder::new();
    let i8t = mb.int(8);
    let p8 = mb.ptr(i8t);
    let s = mb.strct(vec![p8, p8]);
    let arr = mb.array(p8, 2);
    let parr = mb.ptr(arr);
    let void = mb.void();

    let main = mb.declare_fcn("main", vec![], void);
    let (c, a, b, d) = {
        let mut fb = mb.body(main);
        let p = fb.alloca(s);
        let q0 = fb.gep(p.clone(), vec![0, 0]);
        let a = fb.alloca(i8t);
        fb.store(a.clone(), q0);
        let q1 = fb.gep(p.clone(), vec![0, 1]);
        let b = fb.alloca(i8t);
        fb.store(b.clone(), q1);
        let c = fb.bitcast(p, parr);
        let e = fb.gep(c.clone(), vec![0, 0]);
        let d = fb.load(e);
        fb.ret(None);
        (c, a, b, d)
    };
    let module = mb.finish();

    let mut acx = AnalysisContext::new(&module, AnalysisOptions::default());
    let mut pta = SpecAndersPTA::new(&mut acx);
    pta.analyze();

    // The casted pointer conservatively covers both field slots.
    assert_eq!(pts_vec(&mut pta, &c).len(), 2);

    let a_obj = pts_vec(&mut pta, &a)[0];
    let b_obj = pts_vec(&mut pta, &b)[0];
    let d_pts = pts_vec(&mut pta, &d);
    assert!(d_pts.contains(&a_obj));
    assert!(d_pts.contains(&b_obj));

    check_solver_invariants(&pta);
}

#[test]
fn hcd_pair_collapses_pointee() {
    init_logger();
    let mut mb = ModuleBuilder::new();
    let i8t = mb.int(8);
    let p8 = mb.ptr(i8t);
    let void = mb.void();

    let main = mb.declare_fcn("main", vec![], void);
    let (x, y) = {
        let mut fb = mb.body(main);
        let x = fb.alloca(p8);
        let a = fb.alloca(i8t);
        fb.store(a, x.clone());
        let y = fb.load(x.clone());
        fb.store(y.clone(), x.clone());
        fb.ret(None);
        (x, y)
    };
    let module = mb.finish();

    let mut acx = AnalysisContext::new(&module, AnalysisOptions::default());
    let mut pta = SpecAndersPTA::new(&mut acx);

    // The load/store cycle through x yields an offline pair for x.
    let x_ids = match &x {
        Operand::Value(v) => pta.value_to_ids(*v),
        _ => unreachable!(),
    };
    assert_eq!(x_ids.len(), 1);
    assert!(
        pta.graph().cg().hcd_pairs().contains_key(&x_ids[0]),
        "expected a hybrid-cycle pair for the loaded-and-stored pointer"
    );

    pta.analyze();

    // Online, x's pointee merged with the pair partner: y and what x points
    // to share one representative set.
    let y_ids = match &y {
        Operand::Value(v) => pta.value_to_ids(*v),
        _ => unreachable!(),
    };
    let x_obj = pts_vec(&mut pta, &x)[0];
    assert_eq!(pta.rep_of(x_obj), pta.rep_of(y_ids[0]));

    check_solver_invariants(&pta);
}

#[test]
fn malloc_creates_fresh_object() {
    init_logger();
    let mut mb = ModuleBuilder::new();
    let i8t = mb.int(8);
    let i64t = mb.int(64);
    let p8 = mb.ptr(i8t);
    let void = mb.void();

    let malloc = mb.declare_fcn("malloc", vec![i64t], p8);
    let unknown = mb.declare_fcn("frobnicate", vec![p8], p8);

    let main = mb.declare_fcn("main", vec![], void);
    let (r, p, u) = {
        let eight = mb.const_int(i64t, 8);
        let mut fb = mb.body(main);
        let r = fb.call(malloc, vec![eight.into()]);
        let p = fb.alloca(i8t);
        let u = fb.call(unknown, vec![p.clone()]);
        fb.ret(None);
        (r, p, u)
    };
    let module = mb.finish();

    let mut acx = AnalysisContext::new(&module, AnalysisOptions::default());
    let mut pta = SpecAndersPTA::new(&mut acx);
    pta.analyze();

    // The allocator produced exactly one fresh object, disjoint from the
    // stack allocation.
    assert_eq!(pts_vec(&mut pta, &r).len(), 1);
    assert_eq!(pta.alias(&r, &p), AliasResult::NoAlias);

    // The unknown external call is ignored.
    assert!(pts_vec(&mut pta, &u).is_empty());

    check_solver_invariants(&pta);
}

#[test]
fn solving_twice_is_deterministic() {
    init_logger();
    fn build() -> (Module, Vec<Operand>) {
        let mut mb = ModuleBuilder::new();
        let i8t = mb.int(8);
        let p8 = mb.ptr(i8t);
        let s = mb.strct(vec![p8, p8]);
        let void = mb.void();
        let main = mb.declare_fcn("main", vec![], void);
        let ops = {
            let mut fb = mb.body(main);
            let p = fb.alloca(s);
            let q = fb.gep(p.clone(), vec![0, 1]);
            let x = fb.alloca(i8t);
            fb.store(x.clone(), q.clone());
            let y = fb.load(q.clone());
            let z = fb.alloca(p8);
            fb.store(y.clone(), z.clone());
            let w = fb.load(z.clone());
            fb.ret(None);
            vec![p, q, x, y, z, w]
        };
        (mb.finish(), ops)
    }

    let (m1, ops1) = build();
    let mut acx1 = AnalysisContext::new(&m1, AnalysisOptions::default());
    let mut pta1 = SpecAndersPTA::new(&mut acx1);
    pta1.analyze();

    let (m2, ops2) = build();
    let mut acx2 = AnalysisContext::new(&m2, AnalysisOptions::default());
    let mut pta2 = SpecAndersPTA::new(&mut acx2);
    pta2.analyze();

    for (a, b) in ops1.iter().zip(ops2.iter()) {
        assert_eq!(pts_vec(&mut pta1, a), pts_vec(&mut pta2, b));
    }
}
