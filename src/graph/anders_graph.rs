// Copyright (c) 2024 <Wei Li>.
//
// This source code is licensed under the GNU license found in the
// LICENSE file in the root directory of this source tree.

//! The live solver graph: one node per representative identifier, with
//! points-to sets, copy/GEP successor edges, pinned Load/Store constraints
//! and pending indirect-call entries.
//!
//! Nodes live in an arena indexed by dense id; merged (non-representative)
//! slots are emptied and reached only through the value map's union-find.

use std::collections::HashMap;

use log::*;

use super::cg::{CallInfo, Cg, CgCache, Constraint, ConstraintKind, IndirCall};
use super::cs_cfg::{CsCFG, CsFcnCFGNodeId};
use super::fcn_cfg::BasicFcnCFG;
use super::value_map::{ValueId, ValueMap};
use crate::ir::analysis_context::AnalysisContext;
use crate::ir::function::FuncId;
use crate::pts_set::points_to::HybridPointsToSet;
use crate::util::bit_vec::{BitVec, Idx};

pub type PtstoSet = HybridPointsToSet<ValueId>;

/// An indirect call pinned to a function-pointer node. `seen` remembers the
/// part of the node's points-to set already resolved into call edges.
#[derive(Clone, Debug)]
pub struct IndirCallEntry {
    pub ci: CallInfo,
    pub cfg_node: CsFcnCFGNodeId,
    pub seen: PtstoSet,
}

pub struct AndersNode {
    id: ValueId,
    pub(crate) ptsto: PtstoSet,
    /// Points-to content already handed to this node's constraints; the
    /// update set is `ptsto - old_ptsto`.
    pub(crate) old_ptsto: PtstoSet,
    pub(crate) copy_succs: BitVec<ValueId>,
    pub(crate) gep_succs: Vec<(ValueId, u32)>,
    /// Load/Store constraints re-evaluated when this node's set grows.
    pub(crate) cons: Vec<Constraint>,
    pub(crate) indir_calls: Vec<IndirCallEntry>,
}

impl AndersNode {
    fn new(id: ValueId) -> Self {
        AndersNode {
            id,
            ptsto: PtstoSet::new(),
            old_ptsto: PtstoSet::new(),
            copy_succs: BitVec::new_empty(),
            gep_succs: Vec::new(),
            cons: Vec::new(),
            indir_calls: Vec::new(),
        }
    }

    #[inline]
    pub fn id(&self) -> ValueId {
        self.id
    }

    #[inline]
    pub fn ptsto(&self) -> &PtstoSet {
        &self.ptsto
    }

    #[inline]
    pub fn ptsto_mut(&mut self) -> &mut PtstoSet {
        &mut self.ptsto
    }

    #[inline]
    pub fn copy_succs(&self) -> &BitVec<ValueId> {
        &self.copy_succs
    }

    #[inline]
    pub fn gep_succs(&self) -> &[(ValueId, u32)] {
        &self.gep_succs
    }

    pub fn add_copy_edge(&mut self, dest: ValueId) -> bool {
        self.copy_succs.insert(dest)
    }

    /// Returns the delta since the last visit and flushes it.
    pub fn take_update_set(&mut self) -> PtstoSet {
        let mut update = self.ptsto.clone();
        update.subtract(&self.old_ptsto);
        self.old_ptsto = self.ptsto.clone();
        update
    }

    /// Makes the whole points-to set count as unprocessed again.
    pub fn clear_old_ptsto(&mut self) {
        self.old_ptsto.clear();
    }

    fn is_empty(&self) -> bool {
        self.ptsto.is_empty()
            && self.copy_succs.is_empty()
            && self.gep_succs.is_empty()
            && self.cons.is_empty()
            && self.indir_calls.is_empty()
    }
}

pub struct AndersGraph {
    cg: Cg,
    nodes: Vec<AndersNode>,
    static_cfg: BasicFcnCFG,
    base_cgs: CgCache,
    full_cgs: CgCache,
}

impl AndersGraph {
    pub fn new(cg: Cg, static_cfg: BasicFcnCFG, base_cgs: CgCache, full_cgs: CgCache) -> Self {
        AndersGraph {
            cg,
            nodes: Vec::new(),
            static_cfg,
            base_cgs,
            full_cgs,
        }
    }

    #[inline]
    pub fn cg(&self) -> &Cg {
        &self.cg
    }

    #[inline]
    pub fn cg_mut(&mut self) -> &mut Cg {
        &mut self.cg
    }

    #[inline]
    pub fn static_cfg_mut(&mut self) -> &mut BasicFcnCFG {
        &mut self.static_cfg
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.nodes.len()
    }

    #[inline]
    pub fn rep(&self, id: ValueId) -> ValueId {
        self.cg.vals().get_rep(id)
    }

    #[inline]
    pub fn is_rep(&self, id: ValueId) -> bool {
        self.rep(id) == id
    }

    /// The node of `id`'s representative.
    #[inline]
    pub fn node(&self, id: ValueId) -> &AndersNode {
        &self.nodes[self.rep(id).index()]
    }

    #[inline]
    pub fn node_mut(&mut self, id: ValueId) -> &mut AndersNode {
        let rep = self.rep(id);
        &mut self.nodes[rep.index()]
    }

    /// Raw slot access without representative lookup (graph-wide sweeps).
    pub fn node_raw(&self, idx: usize) -> &AndersNode {
        &self.nodes[idx]
    }

    /// Populates the node arena from the fully resolved constraint graph.
    pub fn fill(&mut self) {
        assert!(self.nodes.is_empty());
        self.extend_nodes();
        self.add_cons_range(0);
        let indir = self.cg.take_indir_calls(0);
        self.attach_indir_calls(indir);
    }

    fn extend_nodes(&mut self) {
        while self.nodes.len() < self.cg.vals().len() {
            self.nodes.push(AndersNode::new(ValueId::new(self.nodes.len())));
        }
    }

    fn attach_indir_calls(&mut self, calls: Vec<IndirCall>) {
        for ic in calls {
            let rep = self.rep(ic.fcn_ptr);
            self.nodes[rep.index()].indir_calls.push(IndirCallEntry {
                ci: ic.ci,
                cfg_node: ic.cfg_node,
                seen: PtstoSet::new(),
            });
        }
    }

    /// Installs the constraints starting at index `start` into node state.
    /// Returns the ids whose points-to set or pinned state changed and that
    /// therefore need (re)visiting.
    fn add_cons_range(&mut self, start: usize) -> Vec<ValueId> {
        let mut touched = Vec::new();
        let cons_list: Vec<Constraint> = self.cg.constraints()[start..].to_vec();
        for cons in cons_list {
            let src = self.rep(cons.src());
            let dest = self.rep(cons.dest());
            match cons.kind() {
                ConstraintKind::AddressOf => {
                    // Objects enter sets under their original id.
                    let bit = ValueId::new(cons.src().index() + cons.offs() as usize);
                    if self.nodes[dest.index()].ptsto.insert(bit) {
                        touched.push(dest);
                    }
                }
                ConstraintKind::Copy => {
                    if cons.offs() == 0 {
                        let new_edge = self.nodes[src.index()].copy_succs.insert(dest);
                        if new_edge && !self.nodes[src.index()].ptsto.is_empty() {
                            let src_pts = self.nodes[src.index()].ptsto.clone();
                            if self.nodes[dest.index()].ptsto.union(&src_pts) {
                                touched.push(dest);
                            }
                        }
                    } else {
                        self.nodes[src.index()].gep_succs.push((dest, cons.offs()));
                        if !self.nodes[src.index()].ptsto.is_empty() {
                            let changed = self.gep_union_from(src, dest, cons.offs());
                            if changed {
                                touched.push(dest);
                            }
                        }
                    }
                }
                ConstraintKind::Load => {
                    self.nodes[src.index()].cons.push(cons);
                    if !self.nodes[src.index()].ptsto.is_empty() {
                        self.nodes[src.index()].clear_old_ptsto();
                        touched.push(src);
                    }
                }
                ConstraintKind::Store => {
                    self.nodes[dest.index()].cons.push(cons);
                    if !self.nodes[dest.index()].ptsto.is_empty() {
                        self.nodes[dest.index()].clear_old_ptsto();
                        touched.push(dest);
                    }
                }
            }
        }
        touched
    }

    /// `pts(succ) |= shift(pts(node) - {int, null}, offs)`, dropping shifts
    /// that leave their allocation.
    pub fn gep_union(&mut self, succ: ValueId, clean: &PtstoSet, offs: u32) -> bool {
        let AndersGraph { cg, nodes, .. } = self;
        let vals = cg.vals();
        let succ = vals.get_rep(succ);
        nodes[succ.index()]
            .ptsto
            .union_offs(clean, |o| vals.offset_object(o, offs))
    }

    fn gep_union_from(&mut self, src: ValueId, dest: ValueId, offs: u32) -> bool {
        let mut clean = self.nodes[src.index()].ptsto.clone();
        clean.remove(ValueMap::INT_VALUE);
        clean.remove(ValueMap::NULL_VALUE);
        self.gep_union(dest, &clean, offs)
    }

    /// Unions `b` into `a`. Both are resolved to representatives first; `a`'s
    /// representative survives. `b`'s slot is emptied.
    pub fn merge(&mut self, a: ValueId, b: ValueId) {
        let a = self.rep(a);
        let b = self.rep(b);
        if a == b {
            return;
        }
        self.cg.vals_mut().merge(a, b);

        let bn = std::mem::replace(&mut self.nodes[b.index()], AndersNode::new(b));
        let an = &mut self.nodes[a.index()];
        an.ptsto.union(&bn.ptsto);
        // Keep the merged update set conservative: anything unprocessed on
        // either side stays unprocessed.
        an.old_ptsto.intersect(&bn.old_ptsto);
        an.copy_succs.union(&bn.copy_succs);
        an.gep_succs.extend(bn.gep_succs);
        an.cons.extend(bn.cons);
        an.indir_calls.extend(bn.indir_calls);
    }

    /// Splices the resolved body of `fcn` into the live graph for an
    /// indirect call discovered during solving. Returns the ids needing a
    /// (re)visit plus the remapped call info of the spliced functions.
    pub fn map_in(
        &mut self,
        acx: &mut AnalysisContext,
        fcn: FuncId,
    ) -> Option<(Vec<ValueId>, HashMap<FuncId, (CallInfo, CsFcnCFGNodeId)>)> {
        if self.full_cgs.try_get(fcn).is_none() {
            let AndersGraph {
                base_cgs, full_cgs, ..
            } = self;
            let base = match base_cgs.try_get(fcn) {
                Some(base) => base,
                None => {
                    warn!("no base graph for indirect callee {:?}", fcn);
                    return None;
                }
            };
            let mut tmp = base.clone_with_stacks(vec![vec![CsCFG::MAIN_CONTEXT]]);
            tmp.resolve_calls(acx, base_cgs, full_cgs);
            full_cgs.add(fcn, tmp);
        }

        let cons_start = self.cg.constraints_len();
        let indir_start = self.cg.indir_calls_len();
        let calls = {
            let AndersGraph { cg, full_cgs, .. } = self;
            let dest = full_cgs.try_get(fcn).unwrap();
            cg.map_in(dest)
        };

        self.extend_nodes();
        let mut touched = self.add_cons_range(cons_start);

        let new_indir = self.cg.take_indir_calls(indir_start);
        for ic in &new_indir {
            let rep = self.rep(ic.fcn_ptr);
            if !self.nodes[rep.index()].ptsto.is_empty() {
                self.nodes[rep.index()].clear_old_ptsto();
                touched.push(rep);
            }
        }
        self.attach_indir_calls(new_indir);

        Some((touched, calls))
    }

    /// Extends the graph with the external model of a call discovered to
    /// target a declaration. Returns the ids needing a (re)visit.
    pub fn add_external_call(
        &mut self,
        acx: &mut AnalysisContext,
        caller_ci: &CallInfo,
        callee: FuncId,
    ) -> Vec<ValueId> {
        let cs = caller_ci
            .site()
            .expect("external calls are discovered at call sites");
        let cons_start = self.cg.constraints_len();
        self.cg
            .add_constraints_for_external_call(acx, cs, callee, caller_ci);
        self.extend_nodes();
        self.add_cons_range(cons_start)
    }

    /// Sanity sweep over the solved graph; logs aggregate statistics.
    pub fn verify_and_log_stats(&self) {
        let mut num_nodes = 0u32;
        let mut num_reps = 0u32;
        let mut num_node_pts = 0u32;
        let mut num_copy_edges = 0u64;
        let mut num_gep_edges = 0u64;
        let mut total_pts_size = 0u64;
        for (idx, node) in self.nodes.iter().enumerate() {
            num_nodes += 1;
            if !self.is_rep(ValueId::new(idx)) {
                debug_assert!(node.is_empty(), "merged nodes must be empty");
            } else {
                num_reps += 1;
                if !node.ptsto.is_empty() {
                    num_node_pts += 1;
                }
                total_pts_size += node.ptsto.count() as u64;
                num_copy_edges += node.copy_succs.count() as u64;
                num_gep_edges += node.gep_succs.len() as u64;
            }
        }
        info!(
            "graph: {} nodes, {} reps, {} non-empty, {} copy edges, {} gep edges, {} total pts",
            num_nodes, num_reps, num_node_pts, num_copy_edges, num_gep_edges, total_pts_size
        );
    }
}
