// Copyright (c) 2024 <Wei Li>.
//
// This source code is licensed under the GNU license found in the
// LICENSE file in the root directory of this source tree.

//! The worklist solver.
//!
//! Nodes are visited in "most recently stamped first" order. Each visit
//! merges hybrid-cycle partners, replays the pinned Load/Store constraints
//! against the node's delta, pushes the delta across GEP and copy edges, and
//! resolves indirect calls whose function-pointer set grew. Copy/GEP edges
//! whose endpoints end up with equal sets become lazy-cycle candidates; once
//! enough accumulate, a Tarjan pass collapses the cycles.

use std::collections::HashSet;

use log::*;

use super::PointsTo;
use crate::graph::anders_graph::AndersGraph;
use crate::graph::cg::{CallInfo, ConstraintKind};
use crate::graph::cs_cfg::CsFcnCFGNodeId;
use crate::graph::value_map::{ValueId, ValueMap};
use crate::ir::analysis_context::AnalysisContext;
use crate::ir::function::FuncId;
use crate::util::bit_vec::{BitVec, Idx};
use crate::util::worklist::Worklist;

/// Number of candidate nodes accumulated before a lazy cycle-detection pass.
const LCD_SIZE: usize = 600;

pub struct Propagator<'pta, 'm> {
    acx: &'pta mut AnalysisContext<'m>,
    graph: &'pta mut AndersGraph,

    work: Worklist<ValueId>,
    priority: Vec<u32>,
    vtime: u32,

    lcd_edges: HashSet<(ValueId, ValueId)>,
    lcd_nodes: HashSet<ValueId>,

    lcd_check_count: usize,
    lcd_merge_count: usize,
    hcd_merge_count: usize,
}

impl<'pta, 'm> Propagator<'pta, 'm> {
    pub fn new(acx: &'pta mut AnalysisContext<'m>, graph: &'pta mut AndersGraph) -> Self {
        Propagator {
            acx,
            graph,
            work: Worklist::new(),
            priority: Vec::new(),
            vtime: 1,
            lcd_edges: HashSet::new(),
            lcd_nodes: HashSet::new(),
            lcd_check_count: 0,
            lcd_merge_count: 0,
            hcd_merge_count: 0,
        }
    }

    /// Runs to fixed point.
    pub fn solve_worklist(&mut self) {
        self.priority = vec![0; self.graph.size()];
        for idx in 0..self.graph.size() {
            let id = ValueId::new(idx);
            if self.graph.is_rep(id) && !self.graph.node_raw(idx).ptsto().is_empty() {
                self.work.push(id, 0);
            }
        }

        loop {
            while let Some((id, prio)) = self.work.pop() {
                // Stale entries are dropped: the node was stamped since the
                // push.
                if prio < self.priority[id.index()] {
                    continue;
                }
                if !self.graph.is_rep(id) {
                    continue;
                }
                self.priority[id.index()] = self.vtime;
                self.vtime += 1;

                self.process_hcd(id);
                // The merges may have demoted this node.
                if !self.graph.is_rep(id) {
                    continue;
                }

                let update = self.graph.node_mut(id).take_update_set();
                if !update.is_empty() {
                    self.process_node_cons(id, &update);
                    self.process_gep_succs(id);
                    self.process_indir_calls(id, &update);
                }
                self.process_copy_succs(id, &update);

                if self.lcd_nodes.len() > LCD_SIZE {
                    self.run_lcd();
                }
            }

            // Collapse the remaining cycle candidates. The merges re-enter
            // their representatives, so keep going until nothing is pushed.
            if self.lcd_nodes.is_empty() {
                break;
            }
            self.run_lcd();
            if self.work.is_empty() {
                break;
            }
        }

        info!(
            "solve done: {} hcd merges, {} lcd checks, {} lcd merges",
            self.hcd_merge_count, self.lcd_check_count, self.lcd_merge_count
        );
    }

    fn push(&mut self, id: ValueId) {
        self.work.push(id, self.priority[id.index()]);
    }

    /// Hybrid cycle detection: if this node heads an offline pair, everything
    /// it points to collapses with the partner.
    fn process_hcd(&mut self, id: ValueId) {
        let Some(&pair) = self.graph.cg().hcd_pairs().get(&id) else {
            return;
        };
        let pts: Vec<ValueId> = self.graph.node(id).ptsto().iter().collect();
        let mut did_merge = false;
        for dest in pts {
            let dest_rep = self.graph.rep(dest);
            let pair_rep = self.graph.rep(pair);
            if dest_rep != pair_rep
                && dest_rep != ValueMap::INT_VALUE
                && dest_rep != ValueMap::NULL_VALUE
                && pair_rep != ValueMap::NULL_VALUE
            {
                self.graph.merge(pair_rep, dest_rep);
                self.hcd_merge_count += 1;
                did_merge = true;
            }
        }
        if did_merge {
            let pair_rep = self.graph.rep(pair);
            self.push(pair_rep);
        }
    }

    /// Replays the Load/Store constraints pinned to this node against the
    /// delta, deduplicating the constraint list in place.
    fn process_node_cons(&mut self, id: ValueId, update: &PointsTo) {
        let cons_list = std::mem::take(&mut self.graph.node_mut(id).cons);
        if cons_list.is_empty() {
            return;
        }

        let mut seen: HashSet<(ConstraintKind, ValueId, ValueId, u32)> = HashSet::new();
        let mut kept = Vec::with_capacity(cons_list.len());

        for cons in cons_list {
            let key = (
                cons.kind(),
                self.graph.rep(cons.src()),
                self.graph.rep(cons.dest()),
                cons.offs(),
            );
            if !seen.insert(key) {
                continue;
            }

            match cons.kind() {
                ConstraintKind::Load => {
                    // This node is the address: every pointee flows onward.
                    let dest = self.graph.rep(cons.dest());
                    for y in update.iter() {
                        if y == ValueMap::NULL_VALUE || y == ValueMap::INT_VALUE {
                            continue;
                        }
                        let yr = self.graph.rep(y);
                        let new_edge = self.graph.node_mut(yr).add_copy_edge(dest);
                        if new_edge && !self.graph.node(yr).ptsto().is_empty() {
                            let ypts = self.graph.node(yr).ptsto().clone();
                            if self.graph.node_mut(dest).ptsto_mut().union(&ypts) {
                                self.push(dest);
                            }
                        }
                    }
                }
                ConstraintKind::Store => {
                    // This node is the store's destination pointer.
                    let src = self.graph.rep(cons.src());
                    for y in update.iter() {
                        if y == ValueMap::NULL_VALUE || y == ValueMap::INT_VALUE {
                            continue;
                        }
                        let yr = self.graph.rep(y);
                        let new_edge = self.graph.node_mut(src).add_copy_edge(yr);
                        if new_edge {
                            let src_pts = self.graph.node(src).ptsto().clone();
                            if self.graph.node_mut(yr).ptsto_mut().union(&src_pts) {
                                self.push(yr);
                            }
                        }
                    }
                }
                _ => unreachable!("only load/store constraints are pinned to nodes"),
            }

            kept.push(cons);
        }

        self.graph.node_mut(id).cons = kept;
    }

    /// Pushes the shifted points-to set across GEP edges, deduplicating the
    /// edge list in place.
    fn process_gep_succs(&mut self, id: ValueId) {
        let gep_succs = std::mem::take(&mut self.graph.node_mut(id).gep_succs);
        if gep_succs.is_empty() {
            return;
        }

        let mut clean = self.graph.node(id).ptsto().clone();
        clean.remove(ValueMap::INT_VALUE);
        clean.remove(ValueMap::NULL_VALUE);

        let mut seen: HashSet<(ValueId, u32)> = HashSet::new();
        let mut kept = Vec::with_capacity(gep_succs.len());
        for (succ, offs) in gep_succs {
            let succ = self.graph.rep(succ);
            if !seen.insert((succ, offs)) {
                continue;
            }
            kept.push((succ, offs));

            let changed = self.graph.gep_union(succ, &clean, offs);

            let edge = (id, succ);
            if !self.lcd_edges.contains(&edge)
                && !self.graph.node(id).ptsto().is_empty()
                && self.graph.node(id).ptsto() == self.graph.node(succ).ptsto()
            {
                self.lcd_check_count += 1;
                self.lcd_nodes.insert(id);
                self.lcd_edges.insert(edge);
            }

            if changed {
                self.push(succ);
            }
        }
        self.graph.node_mut(id).gep_succs = kept;
    }

    /// Pushes the full points-to set across copy edges, deduplicating the
    /// successor bitmap in place.
    fn process_copy_succs(&mut self, id: ValueId, update: &PointsTo) {
        let succs: Vec<ValueId> = self.graph.node(id).copy_succs().iter().collect();
        let my_pts = self.graph.node(id).ptsto().clone();

        let mut new_edges: BitVec<ValueId> = BitVec::new_empty();
        for succ in succs {
            let succ = self.graph.rep(succ);
            assert_ne!(succ, ValueMap::NULL_VALUE, "nothing may flow into null");
            if !new_edges.insert(succ) {
                continue;
            }

            let changed = self.graph.node_mut(succ).ptsto_mut().union(&my_pts);

            let edge = (id, succ);
            if !self.lcd_edges.contains(&edge)
                && !update.is_empty()
                && self.graph.node(id).ptsto() == self.graph.node(succ).ptsto()
            {
                self.lcd_check_count += 1;
                self.lcd_nodes.insert(id);
                self.lcd_edges.insert(edge);
            }

            if changed {
                self.push(succ);
            }
        }
        self.graph.node_mut(id).copy_succs = new_edges;
    }

    /// Resolves the indirect calls pinned to this node against the newly
    /// discovered callees.
    fn process_indir_calls(&mut self, id: ValueId, update: &PointsTo) {
        let mut entries = std::mem::take(&mut self.graph.node_mut(id).indir_calls);
        if entries.is_empty() {
            return;
        }
        for entry in &mut entries {
            let mut diff = update.clone();
            diff.subtract(&entry.seen);
            if !diff.is_empty() {
                let ci = entry.ci.clone();
                self.add_indir_call(&diff, &ci, entry.cfg_node);
            }
            entry.seen.union(update);
        }
        // Resolution may have pinned fresh entries to this node; keep them.
        let node = self.graph.node_mut(id);
        let added = std::mem::take(&mut node.indir_calls);
        entries.extend(added);
        self.graph.node_mut(id).indir_calls = entries;
    }

    /// The ids in `fcn_pts` are objects of functions newly pointed to by a
    /// call's function pointer: splice their bodies in and connect the call.
    fn add_indir_call(
        &mut self,
        fcn_pts: &PointsTo,
        caller_ci: &CallInfo,
        cur_cfg_node: CsFcnCFGNodeId,
    ) {
        let caller_fcn = caller_ci.caller_fcn();

        // First pass: register the static call-graph edges.
        for oid in fcn_pts.iter() {
            let Some(callee) = self.graph.cg().vals().fcn_obj(oid) else {
                continue;
            };
            if !self.acx.dyn_info.used_info.is_used_fcn(callee) && !self.acx.no_spec() {
                continue;
            }
            if !self.acx.module.fcn(callee).is_declaration() {
                self.graph.static_cfg_mut().add_indir_edge(caller_fcn, callee);
            }
        }

        for oid in fcn_pts.iter() {
            let Some(callee) = self.graph.cg().vals().fcn_obj(oid) else {
                continue;
            };

            if self.acx.module.fcn(callee).is_declaration() {
                let old_size = self.graph.size();
                let touched = self.graph.add_external_call(self.acx, caller_ci, callee);
                for tid in touched {
                    self.graph.node_mut(tid).clear_old_ptsto();
                    self.push(tid);
                }
                self.handle_graph_change(old_size);
                continue;
            }

            if !self.acx.dyn_info.used_info.is_used_fcn(callee) && !self.acx.no_spec() {
                continue;
            }

            // If the callee's SCC already appears on the call chain above
            // this context, reuse that instance instead of cloning forever.
            let scc: HashSet<FuncId> = self
                .graph
                .static_cfg_mut()
                .get_scc(callee)
                .into_iter()
                .collect();
            let in_graph = self
                .graph
                .cg()
                .local_cfg()
                .find_direct_preds(cur_cfg_node, &scc);
            let matches: Vec<CsFcnCFGNodeId> = in_graph
                .into_iter()
                .filter(|(f, _)| *f == callee)
                .map(|(_, n)| n)
                .collect();

            if !matches.is_empty() {
                for node_id in matches {
                    let callee_ci = self.graph.cg().local_cfg().node(node_id).ci().clone();
                    self.add_indir_edges(caller_ci, &callee_ci);
                    self.graph
                        .cg_mut()
                        .local_cfg_mut()
                        .add_pred(node_id, cur_cfg_node);
                }
            } else {
                let old_size = self.graph.size();
                let Some((touched, calls)) = self.graph.map_in(self.acx, callee) else {
                    debug!("pruning indirect call to {:?}", callee);
                    continue;
                };
                self.handle_graph_change(old_size);
                for tid in touched {
                    self.graph.node_mut(tid).clear_old_ptsto();
                    self.push(tid);
                }

                let Some((callee_ci, callee_node)) = calls.get(&callee).cloned() else {
                    warn!("mapped-in graph misses callee {:?}", callee);
                    continue;
                };
                self.add_indir_edges(caller_ci, &callee_ci);
                self.graph
                    .cg_mut()
                    .local_cfg_mut()
                    .add_pred(callee_node, cur_cfg_node);
            }
        }
    }

    /// Argument and return copy edges for one resolved indirect call.
    fn add_indir_edges(&mut self, caller_ci: &CallInfo, callee_ci: &CallInfo) {
        for (&caller_arg, &callee_arg) in caller_ci.args().iter().zip(callee_ci.args().iter()) {
            let caller_rep = self.graph.rep(caller_arg);
            let callee_rep = self.graph.rep(callee_arg);
            if caller_rep == ValueMap::NULL_VALUE {
                if self
                    .graph
                    .node_mut(callee_rep)
                    .ptsto_mut()
                    .insert(ValueMap::NULL_VALUE)
                {
                    self.push(callee_rep);
                }
            } else if caller_rep == ValueMap::INT_VALUE {
                if self
                    .graph
                    .node_mut(callee_rep)
                    .ptsto_mut()
                    .insert(ValueMap::INT_VALUE)
                {
                    self.push(callee_rep);
                }
            } else if self.graph.node_mut(caller_rep).add_copy_edge(callee_rep) {
                self.push(caller_rep);
            }
        }

        let callee_ret = self.graph.rep(callee_ci.ret());
        let caller_ret = self.graph.rep(caller_ci.ret());
        assert_ne!(caller_ret, ValueMap::NULL_VALUE);
        if self.graph.node_mut(callee_ret).add_copy_edge(caller_ret) {
            self.push(callee_ret);
        }
    }

    /// Grows the priority table after the graph gained nodes, and schedules
    /// any new node that starts non-empty.
    fn handle_graph_change(&mut self, old_size: usize) {
        while self.priority.len() < self.graph.size() {
            self.priority.push(0);
        }
        for idx in old_size..self.graph.size() {
            let id = ValueId::new(idx);
            if self.graph.is_rep(id) && !self.graph.node_raw(idx).ptsto().is_empty() {
                self.work.push(id, 0);
            }
        }
    }

    /// Lazy cycle detection over the accumulated candidates (Nuutila's
    /// Tarjan variant); collapsed cycles are pushed for another visit.
    fn run_lcd(&mut self) {
        let nodes: Vec<ValueId> = self.lcd_nodes.drain().collect();
        let data_len = self.graph.size().max(1);
        let mut run = NuutilaRun {
            graph: &mut *self.graph,
            work: &mut self.work,
            priority: &self.priority,
            data: vec![INDEX_INVALID; data_len],
            stack: Vec::new(),
            merged: HashSet::new(),
            next_index: 1,
            merge_count: 0,
        };
        for id in nodes {
            let rep = run.graph.rep(id);
            if run.graph.is_rep(rep) && run.root(rep) == INDEX_INVALID {
                run.visit(rep);
            }
        }
        assert!(run.stack.is_empty());
        self.lcd_merge_count += run.merge_count;
    }
}

const INDEX_INVALID: i32 = -1;

struct NuutilaRun<'a> {
    graph: &'a mut AndersGraph,
    work: &'a mut Worklist<ValueId>,
    priority: &'a [u32],
    data: Vec<i32>,
    stack: Vec<ValueId>,
    merged: HashSet<ValueId>,
    next_index: i32,
    merge_count: usize,
}

impl<'a> NuutilaRun<'a> {
    fn root(&self, id: ValueId) -> i32 {
        let rep = self.graph.rep(id);
        self.data.get(rep.index()).copied().unwrap_or(INDEX_INVALID)
    }

    fn set_root(&mut self, id: ValueId, v: i32) {
        let rep = self.graph.rep(id);
        if rep.index() >= self.data.len() {
            self.data.resize(rep.index() + 1, INDEX_INVALID);
        }
        self.data[rep.index()] = v;
    }

    fn visit(&mut self, node_id: ValueId) {
        debug_assert!(self.graph.is_rep(node_id));

        let dfs_idx = self.next_index;
        self.next_index += 1;
        self.set_root(node_id, dfs_idx);

        let succs: Vec<ValueId> = self.graph.node(node_id).copy_succs().iter().collect();
        for succ in succs {
            let mut dest = self.graph.rep(succ);
            if self.merged.contains(&dest) {
                continue;
            }
            if self.root(dest) == INDEX_INVALID {
                self.visit(dest);
                // The recursion may have merged the successor.
                dest = self.graph.rep(dest);
            }
            let dest_root = self.root(dest);
            if dest_root != INDEX_INVALID && dest_root < self.root(node_id) {
                self.set_root(node_id, dest_root);
            }
        }

        if self.root(node_id) == dfs_idx {
            let mut collapsed = false;
            while let Some(&next_id) = self.stack.last() {
                if self.data[next_id.index()] < dfs_idx {
                    break;
                }
                self.stack.pop();

                let rep_next = self.graph.rep(next_id);
                let node_rep = self.graph.rep(node_id);
                // An earlier hybrid merge may have unified them already.
                if rep_next != node_rep {
                    self.merge_count += 1;
                    self.graph.merge(node_rep, rep_next);
                }
                collapsed = true;
            }

            let node_rep = self.graph.rep(node_id);
            self.merged.insert(node_rep);
            if collapsed {
                let prio = self
                    .priority
                    .get(node_rep.index())
                    .copied()
                    .unwrap_or(0);
                self.work.push(node_rep, prio);
            }
        } else {
            self.stack.push(node_id);
        }
    }
}
