// Copyright (c) 2024 <Wei Li>.
//
// This source code is licensed under the GNU license found in the
// LICENSE file in the root directory of this source tree.

//! Call-site identifier space (`CsCFG`) and the context-sensitive per-function
//! call CFG (`CsFcnCFG`) that records which context called into which clone.

use std::collections::{HashMap, HashSet, VecDeque};

use petgraph::graph::{DefaultIx, NodeIndex};
use petgraph::{Direction, Graph};

use super::cg::CallInfo;
use super::value_map::ValueId;
use crate::ir::function::{CallSite, FuncId, InstKind};
use crate::ir::module::Module;

/// The dense identifier of a call site (or of the synthetic main context).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub struct CsId(pub u32);

/// Assigns a stable identifier to every call instruction of the module.
/// Identifier 0 names the synthetic root context of the entry function.
#[derive(Clone, Debug)]
pub struct CsCFG {
    ids: HashMap<CallSite, CsId>,
    sites: Vec<Option<CallSite>>,
}

impl CsCFG {
    pub const MAIN_CONTEXT: CsId = CsId(0);

    pub fn new(m: &Module) -> Self {
        let mut ids = HashMap::new();
        let mut sites = vec![None];
        for f in m.fcn_ids() {
            let fcn = m.fcn(f);
            for i in fcn.inst_ids() {
                if matches!(
                    fcn.inst(i).kind,
                    InstKind::Call { .. } | InstKind::Invoke { .. }
                ) {
                    let cs = CallSite::new(f, i);
                    ids.insert(cs, CsId(sites.len() as u32));
                    sites.push(Some(cs));
                }
            }
        }
        CsCFG { ids, sites }
    }

    pub fn get_id(&self, cs: CallSite) -> CsId {
        *self.ids.get(&cs).expect("unregistered call site")
    }

    pub fn site(&self, id: CsId) -> Option<CallSite> {
        self.sites.get(id.0 as usize).copied().flatten()
    }

    pub fn len(&self) -> usize {
        self.sites.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sites.is_empty()
    }
}

pub type CsFcnCFGNodeId = NodeIndex<DefaultIx>;

#[derive(Clone, Debug)]
pub struct CsFcnCFGNode {
    fcn: FuncId,
    ci: CallInfo,
}

impl CsFcnCFGNode {
    pub fn fcn(&self) -> FuncId {
        self.fcn
    }

    pub fn ci(&self) -> &CallInfo {
        &self.ci
    }
}

/// One node per cloned function body; an edge from caller to callee for every
/// resolved call. Walking the caller side upward yields the call chain a
/// context was created under.
#[derive(Clone, Debug, Default)]
pub struct CsFcnCFG {
    graph: Graph<CsFcnCFGNode, ()>,
}

impl CsFcnCFG {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, fcn: FuncId, ci: CallInfo) -> CsFcnCFGNodeId {
        self.graph.add_node(CsFcnCFGNode { fcn, ci })
    }

    pub fn node(&self, id: CsFcnCFGNodeId) -> &CsFcnCFGNode {
        self.graph.node_weight(id).unwrap()
    }

    /// Records that `pred` called into `node`.
    pub fn add_pred(&mut self, node: CsFcnCFGNodeId, pred: CsFcnCFGNodeId) {
        self.graph.update_edge(pred, node, ());
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Copies all nodes and edges of `other` into `self`, translating the
    /// embedded call info through `val_remap`. Returns the node translation
    /// table, indexed by `other`'s node indices.
    pub fn copy_nodes(&mut self, other: &CsFcnCFG, val_remap: &[ValueId]) -> Vec<CsFcnCFGNodeId> {
        let mut node_remap = Vec::with_capacity(other.graph.node_count());
        for idx in other.graph.node_indices() {
            let w = other.graph.node_weight(idx).unwrap();
            let mut ci = w.ci.clone();
            ci.remap(val_remap);
            node_remap.push(self.add_node(w.fcn, ci));
        }
        for edge in other.graph.edge_indices() {
            let (a, b) = other.graph.edge_endpoints(edge).unwrap();
            self.graph
                .update_edge(node_remap[a.index()], node_remap[b.index()], ());
        }
        node_remap
    }

    /// Remaps the call info of every node (used after allocation lowering).
    pub fn update_nodes(&mut self, val_remap: &[ValueId]) {
        for w in self.graph.node_weights_mut() {
            w.ci.remap(val_remap);
        }
    }

    /// Searches the call-chain ancestors of `start` for nodes whose function
    /// belongs to `fcns`, returning them per function.
    pub fn find_direct_preds(
        &self,
        start: CsFcnCFGNodeId,
        fcns: &HashSet<FuncId>,
    ) -> Vec<(FuncId, CsFcnCFGNodeId)> {
        let mut found = Vec::new();
        let mut visited = HashSet::new();
        let mut queue = VecDeque::new();
        queue.push_back(start);
        visited.insert(start);
        while let Some(cur) = queue.pop_front() {
            for pred in self.graph.neighbors_directed(cur, Direction::Incoming) {
                if visited.insert(pred) {
                    let w = self.graph.node_weight(pred).unwrap();
                    if fcns.contains(&w.fcn) {
                        found.push((w.fcn, pred));
                    }
                    queue.push_back(pred);
                }
            }
        }
        found
    }
}
