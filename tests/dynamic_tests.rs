// Copyright (c) 2024 <Wei Li>.
//
// This source code is licensed under the GNU license found in the
// LICENSE file in the root directory of this source tree.

//! Scenarios driven by the dynamic-profile oracles: speculative dead-code
//! pruning, forced indirect-call resolution, and context-stack validation.

use std::collections::{HashMap, HashSet};

use specanders::dynamic::{CallContextInfo, DynamicInfo, IndirInfo, UsedInfo};
use specanders::graph::cs_cfg::CsCFG;
use specanders::graph::value_map::ValueId;
use specanders::ir::analysis_context::AnalysisContext;
use specanders::ir::builder::ModuleBuilder;
use specanders::ir::function::{CallSite, FuncId, InstId, Operand, ValueRef};
use specanders::pta::andersen::SpecAndersPTA;
use specanders::pta::PointerAnalysis;
use specanders::util::options::AnalysisOptions;

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn pts_vec(pta: &mut SpecAndersPTA, op: &Operand) -> Vec<ValueId> {
    let mut v: Vec<ValueId> = pta.points_to_of(op).iter().collect();
    v.sort();
    v
}

fn inst_of(op: &Operand) -> (FuncId, InstId) {
    match op {
        Operand::Value(ValueRef::Inst(f, i)) => (*f, *i),
        _ => panic!("expected an instruction operand"),
    }
}

#[test]
fn dead_block_is_pruned_speculatively() {
    init_logger();
    fn build() -> (specanders::ir::module::Module, Operand, Operand) {
        let mut mb = ModuleBuilder::new();
        let i8t = mb.int(8);
        let p8 = mb.ptr(i8t);
        let void = mb.void();
        let main = mb.declare_fcn("main", vec![], void);
        let mut fb = mb.body(main);
        let p = fb.alloca(i8t);
        let q = fb.alloca(p8);
        let b1 = fb.new_block();
        fb.br(b1);
        fb.switch_to(b1);
        fb.store(p.clone(), q.clone());
        fb.ret(None);
        (mb.finish(), p, q)
    }

    // Profile: only the entry block ran.
    let (module, _p, q) = build();
    let main = module.fcn_by_name("main").unwrap();
    let used = UsedInfo::from_sets(
        HashSet::from([main]),
        HashMap::from([(main, HashSet::from([0u32]))]),
    );
    let mut acx = AnalysisContext::with_dyn_info(
        &module,
        AnalysisOptions::default(),
        DynamicInfo::new(used, IndirInfo::none(), CallContextInfo::none()),
    );
    {
        let mut pta = SpecAndersPTA::new(&mut acx);
        pta.analyze();
        // The store in the skipped block never happened.
        let q_obj = pts_vec(&mut pta, &q)[0];
        assert!(pta.points_to(q_obj).is_empty());
    }
    assert_eq!(acx.assumptions.dead_code_count(), 1);

    // With speculation disabled the same profile is ignored.
    let (module, p, q) = build();
    let main = module.fcn_by_name("main").unwrap();
    let used = UsedInfo::from_sets(
        HashSet::from([main]),
        HashMap::from([(main, HashSet::from([0u32]))]),
    );
    let mut opts = AnalysisOptions::default();
    opts.no_spec = true;
    let mut acx = AnalysisContext::with_dyn_info(
        &module,
        opts,
        DynamicInfo::new(used, IndirInfo::none(), CallContextInfo::none()),
    );
    let mut pta = SpecAndersPTA::new(&mut acx);
    pta.analyze();
    let q_obj = pts_vec(&mut pta, &q)[0];
    assert_eq!(
        pta.points_to(q_obj).iter().collect::<Vec<_>>(),
        pts_vec(&mut pta, &p)
    );
}

#[test]
fn indirect_targets_force_direct_resolution() {
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

    let main = mb.declare_fcn("main", vec![], void);
    let (a, r, call_op) = {
        let mut fb = mb.body(main);
        // An indirect call through an uninitialized slot: without the oracle
        // the callee set stays empty.
        let slot = fb.alloca(fptr_ty);
        let fp = fb.load(slot);
        let a = fb.alloca(i8t);
        let r = fb.call_ind(fp, vec![a.clone()], p8);
        fb.ret(None);
        (a, r.clone(), r)
    };
    let module = mb.finish();
    let main_id = module.fcn_by_name("main").unwrap();
    let f_id = module.fcn_by_name("f").unwrap();

    let (_, call_iid) = inst_of(&call_op);
    let indir = IndirInfo::from_map(HashMap::from([(
        CallSite::new(main_id, call_iid),
        vec![f_id],
    )]));

    let mut acx = AnalysisContext::with_dyn_info(
        &module,
        AnalysisOptions::default(),
        DynamicInfo::new(UsedInfo::none(), indir, CallContextInfo::none()),
    );
    {
        let mut pta = SpecAndersPTA::new(&mut acx);
        pta.analyze();
        let a_obj = pts_vec(&mut pta, &a)[0];
        assert!(
            pts_vec(&mut pta, &r).contains(&a_obj),
            "profiled target was not connected"
        );
    }
    assert_eq!(acx.assumptions.ptsto_count(), 1);
}

#[test]
fn invalid_context_stacks_prune_calls() {
    init_logger();
    let mut mb = ModuleBuilder::new();
    let i8t = mb.int(8);
    let p8 = mb.ptr(i8t);
    let void = mb.void();

    let null_init = mb.const_null(p8);
    let g = mb.add_global("g", p8, Some(null_init));

    let h = mb.declare_fcn("h", vec![p8], void);
    {
        let g_const = mb.const_global(g);
        let mut fb = mb.body(h);
        let a0 = fb.arg(0);
        fb.store(a0, Operand::Const(g_const));
        fb.ret(None);
    }

    let main = mb.declare_fcn("main", vec![], void);
    let (a1, a2, c1, c2) = {
        let mut fb = mb.body(main);
        let a1 = fb.alloca(i8t);
        let a2 = fb.alloca(i8t);
        let c1 = fb.call(h, vec![a1.clone()]);
        let c2 = fb.call(h, vec![a2.clone()]);
        fb.ret(None);
        (a1, a2, c1, c2)
    };
    let module = mb.finish();
    let main_id = module.fcn_by_name("main").unwrap();

    let cs_cfg = CsCFG::new(&module);
    let (_, c1_iid) = inst_of(&c1);
    let (_, c2_iid) = inst_of(&c2);
    let c1_id = cs_cfg.get_id(CallSite::new(main_id, c1_iid));
    let c2_id = cs_cfg.get_id(CallSite::new(main_id, c2_iid));

    // Only the first call site was ever observed.
    let contexts = CallContextInfo::from_stacks(vec![vec![CsCFG::MAIN_CONTEXT, c1_id]]);

    let mut acx = AnalysisContext::with_dyn_info(
        &module,
        AnalysisOptions::default(),
        DynamicInfo::new(UsedInfo::none(), IndirInfo::none(), contexts),
    );
    let mut pta = SpecAndersPTA::new(&mut acx);
    pta.analyze();

    // Only a1 reached the global through h.
    let g_val = Operand::Value(ValueRef::Global(g));
    let g_obj = pts_vec(&mut pta, &g_val)[0];
    let a1_obj = pts_vec(&mut pta, &a1)[0];
    let a2_obj = pts_vec(&mut pta, &a2)[0];
    let stored = pta.points_to(g_obj);
    assert!(stored.contains(a1_obj));
    assert!(!stored.contains(a2_obj));

    // The pruned path is reported.
    let invalid = pta.invalid_stacks();
    assert!(invalid.contains(&vec![CsCFG::MAIN_CONTEXT, c2_id]));
}
