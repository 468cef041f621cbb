// Copyright (c) 2024 <Wei Li>.
//
// This source code is licensed under the GNU license found in the
// LICENSE file in the root directory of this source tree.

//! Static call graph over the module's functions, with SCC identification.
//! Indirect edges discovered during solving are added online; SCCs are
//! recomputed lazily.

use std::collections::HashMap;

use petgraph::algo::tarjan_scc;
use petgraph::graph::{DefaultIx, NodeIndex};
use petgraph::Graph;

use crate::dynamic::DynamicInfo;
use crate::ir::function::{CallSite, FuncId, InstKind};
use crate::ir::module::Module;

pub type FcnNodeId = NodeIndex<DefaultIx>;

pub struct BasicFcnCFG {
    graph: Graph<FuncId, ()>,
    fcn_map: HashMap<FuncId, FcnNodeId>,
    scc_lists: Vec<Vec<FuncId>>,
    scc_of: HashMap<FuncId, usize>,
    dirty: bool,
}

impl BasicFcnCFG {
    pub fn new(m: &Module, dyn_info: &DynamicInfo, no_spec: bool) -> Self {
        let mut cfg = BasicFcnCFG {
            graph: Graph::new(),
            fcn_map: HashMap::new(),
            scc_lists: Vec::new(),
            scc_of: HashMap::new(),
            dirty: true,
        };

        let used = &dyn_info.used_info;
        for f in m.fcn_ids() {
            if !used.is_used_fcn(f) && !no_spec {
                continue;
            }
            cfg.get_or_insert(f);
        }

        for f in m.fcn_ids() {
            if !used.is_used_fcn(f) && !no_spec {
                continue;
            }
            let fcn = m.fcn(f);
            for b in fcn.block_ids() {
                if !used.is_used_block(f, b) && !no_spec {
                    continue;
                }
                for &iid in &fcn.block(b).insts {
                    match &fcn.inst(iid).kind {
                        InstKind::Call { .. } => {
                            let cs = CallSite::new(f, iid);
                            if let Some(dest) = m.callee_fcn(cs) {
                                // The callee may be absent when control flow
                                // never reached it dynamically.
                                if cfg.fcn_map.contains_key(&dest) {
                                    cfg.add_edge(f, dest);
                                }
                            } else if dyn_info.indir_info.has_info() {
                                for dest in dyn_info.indir_info.targets(cs) {
                                    if cfg.fcn_map.contains_key(&dest) {
                                        cfg.add_edge(f, dest);
                                    }
                                }
                            }
                        }
                        InstKind::Invoke { .. } => {
                            panic!("invoke instructions are not supported");
                        }
                        _ => {}
                    }
                }
            }
        }

        cfg.recompute();
        cfg
    }

    fn get_or_insert(&mut self, f: FuncId) -> FcnNodeId {
        if let Some(id) = self.fcn_map.get(&f) {
            return *id;
        }
        let id = self.graph.add_node(f);
        self.fcn_map.insert(f, id);
        self.dirty = true;
        id
    }

    fn add_edge(&mut self, caller: FuncId, callee: FuncId) {
        let a = self.get_or_insert(caller);
        let b = self.get_or_insert(callee);
        if self.graph.find_edge(a, b).is_none() {
            self.graph.add_edge(a, b, ());
            self.dirty = true;
        }
    }

    /// Adds a call edge discovered through a function pointer.
    pub fn add_indir_edge(&mut self, caller: FuncId, callee: FuncId) {
        self.add_edge(caller, callee);
    }

    fn recompute(&mut self) {
        self.scc_lists.clear();
        self.scc_of.clear();
        for comp in tarjan_scc(&self.graph) {
            let mut fcns: Vec<FuncId> = comp
                .into_iter()
                .map(|n| *self.graph.node_weight(n).unwrap())
                .collect();
            fcns.sort();
            let idx = self.scc_lists.len();
            for f in &fcns {
                self.scc_of.insert(*f, idx);
            }
            self.scc_lists.push(fcns);
        }
        self.dirty = false;
    }

    /// The members of the SCC containing `f`, in ascending id order.
    pub fn get_scc(&mut self, f: FuncId) -> Vec<FuncId> {
        if self.dirty {
            self.recompute();
        }
        match self.scc_of.get(&f) {
            Some(idx) => self.scc_lists[*idx].clone(),
            None => vec![f],
        }
    }

    /// The canonical member of `f`'s SCC.
    pub fn scc_rep(&mut self, f: FuncId) -> FuncId {
        if self.dirty {
            self.recompute();
        }
        match self.scc_of.get(&f) {
            Some(idx) => self.scc_lists[*idx][0],
            None => f,
        }
    }

    pub fn contains(&self, f: FuncId) -> bool {
        self.fcn_map.contains_key(&f)
    }
}
