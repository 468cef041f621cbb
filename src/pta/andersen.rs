// Copyright (c) 2024 <Wei Li>.
//
// This source code is licensed under the GNU license found in the
// LICENSE file in the root directory of this source tree.

//! Top-level driver of the inclusion-based analysis, plus the query API the
//! alias adapter is built on.

use std::collections::{HashMap, HashSet};
use std::time::Instant;

use log::*;

use super::propagator::Propagator;
use super::{hcd, AliasResult, PointerAnalysis, PointsTo};
use crate::builder::cg_builder;
use crate::graph::anders_graph::AndersGraph;
use crate::graph::cg::{Cg, CgCache};
use crate::graph::cs_cfg::{CsCFG, CsId};
use crate::graph::fcn_cfg::BasicFcnCFG;
use crate::graph::value_map::{ValueId, ValueMap};
use crate::ir::analysis_context::AnalysisContext;
use crate::ir::function::{Operand, ValueRef};
use crate::ir::module::{ConstExpr, ConstKind, Constant};
use crate::util::results_dumper;

pub struct SpecAndersPTA<'pta, 'm> {
    /// The analysis context
    pub(crate) acx: &'pta mut AnalysisContext<'m>,
    /// The live solver graph
    graph: AndersGraph,
    /// Per-value union of points-to sets, filled on demand by queries
    pts_cache: HashMap<Operand, PointsTo>,
}

impl<'pta, 'm> SpecAndersPTA<'pta, 'm> {
    pub fn new(acx: &'pta mut AnalysisContext<'m>) -> Self {
        let mut fcn_cfg = BasicFcnCFG::new(acx.module, &acx.dyn_info, acx.no_spec());
        let base_cgs = CgCache::build(acx, &mut fcn_cfg);
        let mut full_cgs = CgCache::new();

        let entry = acx
            .module
            .fcn_by_name(&acx.analysis_options.entry_func)
            .expect("entry function not found in module");
        let mut main_cg: Cg = base_cgs
            .try_get(entry)
            .expect("entry function has no body")
            .clone_with_stacks(vec![vec![CsCFG::MAIN_CONTEXT]]);

        cg_builder::add_global_constraints(acx, &mut main_cg, entry);
        main_cg.resolve_calls(acx, &base_cgs, &mut full_cgs);
        main_cg.constraint_stats();

        main_cg.lower_allocs();

        if !acx.analysis_options.no_opt {
            let pairs = hcd::compute_hcd_pairs(&main_cg);
            main_cg.set_hcd_pairs(pairs);
        }

        let mut graph = AndersGraph::new(main_cg, fcn_cfg, base_cgs, full_cgs);
        graph.fill();

        SpecAndersPTA {
            acx,
            graph,
            pts_cache: HashMap::new(),
        }
    }

    /// Solve the worklist problem.
    pub fn propagate(&mut self) {
        let mut propagator = Propagator::new(self.acx, &mut self.graph);
        propagator.solve_worklist();
    }

    /// Finalize the analysis: verification sweeps and result dumping.
    pub fn finalize(&self) {
        let opts = &self.acx.analysis_options;
        if opts.dump_stats {
            self.graph.verify_and_log_stats();
        }
        results_dumper::dump_results(self.acx, &self.graph);

        if opts.do_spec_diff {
            let mut total = 0u64;
            for idx in 0..self.graph.size() {
                total += self.graph.node_raw(idx).ptsto().count() as u64;
            }
            info!("speculative points-to accounting: {} total entries", total);
        }
        if opts.do_check_dyn {
            info!(
                "speculative assumptions: {} dead blocks, {} pointer target sets, {} invalid stacks",
                self.acx.assumptions.dead_code_count(),
                self.acx.assumptions.ptsto_count(),
                self.graph.cg().invalid_stacks().len()
            );
        }
    }

    #[inline]
    pub fn graph(&self) -> &AndersGraph {
        &self.graph
    }

    // Query API.

    #[inline]
    pub fn rep_of(&self, id: ValueId) -> ValueId {
        self.graph.rep(id)
    }

    /// The solved points-to set of an identifier's representative.
    #[inline]
    pub fn points_to(&self, id: ValueId) -> &PointsTo {
        self.graph.node(id).ptsto()
    }

    /// All identifiers a value maps to (one per clone it appears in).
    pub fn value_to_ids(&self, v: ValueRef) -> Vec<ValueId> {
        self.graph.cg().vals().get_ids(&v).to_vec()
    }

    /// The union of points-to sets over every identifier of an operand,
    /// cached per operand.
    pub fn points_to_of(&mut self, op: &Operand) -> &PointsTo {
        if !self.pts_cache.contains_key(op) {
            let mut pts = PointsTo::new();
            match op {
                Operand::Value(v) => {
                    for id in self.graph.cg().vals().get_ids(v) {
                        pts.union(self.graph.node(*id).ptsto());
                    }
                }
                Operand::Const(c) => {
                    if let Some(id) = self.graph.cg().vals().try_const(c) {
                        pts.union(self.graph.node(id).ptsto());
                    }
                }
            }
            self.pts_cache.insert(op.clone(), pts);
        }
        self.pts_cache.get(op).unwrap()
    }

    /// May the two locations refer to the same memory?
    pub fn alias(&mut self, a: &Operand, b: &Operand) -> AliasResult {
        // Constant int-to-ptr locations alias nothing we track.
        if is_const_int_to_ptr(a) || is_const_int_to_ptr(b) {
            return AliasResult::NoAlias;
        }

        let pts_a = self.points_to_of(a).clone();
        let pts_b = self.points_to_of(b);

        if pts_a.is_empty() || pts_b.is_empty() {
            return AliasResult::NoAlias;
        }
        if !pts_a.intersects_ignoring(pts_b, ValueMap::NULL_VALUE) {
            return AliasResult::NoAlias;
        }
        AliasResult::MayAlias
    }

    /// Calling-context stacks invalidated by the dynamic trace, for
    /// diagnostic clients.
    pub fn invalid_stacks(&self) -> &HashSet<Vec<CsId>> {
        self.graph.cg().invalid_stacks()
    }
}

fn is_const_int_to_ptr(op: &Operand) -> bool {
    matches!(
        op,
        Operand::Const(Constant {
            kind: ConstKind::Expr(e),
            ..
        }) if matches!(&**e, ConstExpr::IntToPtr { .. })
    )
}

impl<'pta, 'm> PointerAnalysis for SpecAndersPTA<'pta, 'm> {
    /// Run the analysis to its fixed point.
    fn analyze(&mut self) {
        let now = Instant::now();

        self.propagate();

        let elapsed = now.elapsed();
        info!("Andersen completed.");
        info!(
            "Analysis time: {}",
            humantime::format_duration(elapsed).to_string()
        );

        self.finalize();
    }
}
