// Copyright (c) 2024 <Wei Li>.
//
// This source code is licensed under the GNU license found in the
// LICENSE file in the root directory of this source tree.

//! Per-function constraint graphs and whole-program assembly.
//!
//! A `Cg` starts as the constraints of a single function. Statically detected
//! SCCs are merged into one `Cg`, pending calls are then resolved by cloning
//! callee graphs per calling context and mapping them in, and the final,
//! fully resolved graph of the entry function becomes the solver's input.

use std::collections::{HashMap, HashSet};

use log::*;

use super::cs_cfg::{CsFcnCFG, CsFcnCFGNodeId, CsId};
use super::fcn_cfg::BasicFcnCFG;
use super::value_map::{ValueId, ValueMap};
use crate::builder::cg_builder;
use crate::ir::analysis_context::AnalysisContext;
use crate::ir::function::{CallSite, FuncId, ValueRef};
use crate::util::bit_vec::Idx;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum ConstraintKind {
    AddressOf,
    Copy,
    Load,
    Store,
}

/// One inclusion constraint. `rep` names the constraint itself (a phony id
/// for stores and argument copies); `offs` turns a `Copy` into a
/// field-sensitive GEP edge.
#[derive(Clone, Copy, Debug)]
pub struct Constraint {
    kind: ConstraintKind,
    src: ValueId,
    dest: ValueId,
    rep: ValueId,
    offs: u32,
}

impl Constraint {
    pub fn new(kind: ConstraintKind, src: ValueId, dest: ValueId, rep: ValueId, offs: u32) -> Self {
        Constraint {
            kind,
            src,
            dest,
            rep,
            offs,
        }
    }

    #[inline]
    pub fn kind(&self) -> ConstraintKind {
        self.kind
    }

    #[inline]
    pub fn src(&self) -> ValueId {
        self.src
    }

    #[inline]
    pub fn dest(&self) -> ValueId {
        self.dest
    }

    #[inline]
    pub fn rep(&self) -> ValueId {
        self.rep
    }

    #[inline]
    pub fn offs(&self) -> u32 {
        self.offs
    }

    pub fn remap(&mut self, table: &[ValueId]) {
        self.src = table[self.src.index()];
        self.dest = table[self.dest.index()];
        self.rep = table[self.rep.index()];
    }
}

/// Where a `CallInfo` comes from: a function entry or a call site.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum CallOrigin {
    Fcn(FuncId),
    Site(CallSite),
}

/// The value-flow interface of one call site or function entry: argument ids,
/// return id and the optional vararg sink.
#[derive(Clone, Debug)]
pub struct CallInfo {
    origin: CallOrigin,
    args: Vec<ValueId>,
    ret: ValueId,
    var_arg: Option<ValueId>,
    /// For indirect call sites, the id of the called function pointer.
    callee_id: Option<ValueId>,
}

impl CallInfo {
    pub fn new(
        origin: CallOrigin,
        args: Vec<ValueId>,
        ret: ValueId,
        var_arg: Option<ValueId>,
        callee_id: Option<ValueId>,
    ) -> Self {
        CallInfo {
            origin,
            args,
            ret,
            var_arg,
            callee_id,
        }
    }

    #[inline]
    pub fn origin(&self) -> CallOrigin {
        self.origin
    }

    pub fn site(&self) -> Option<CallSite> {
        match self.origin {
            CallOrigin::Site(cs) => Some(cs),
            CallOrigin::Fcn(_) => None,
        }
    }

    /// The function whose body contains this call info.
    pub fn caller_fcn(&self) -> FuncId {
        match self.origin {
            CallOrigin::Site(cs) => cs.func,
            CallOrigin::Fcn(f) => f,
        }
    }

    #[inline]
    pub fn args(&self) -> &[ValueId] {
        &self.args
    }

    #[inline]
    pub fn ret(&self) -> ValueId {
        self.ret
    }

    #[inline]
    pub fn var_arg(&self) -> Option<ValueId> {
        self.var_arg
    }

    #[inline]
    pub fn callee_id(&self) -> Option<ValueId> {
        self.callee_id
    }

    pub fn remap(&mut self, table: &[ValueId]) {
        for arg in &mut self.args {
            *arg = table[arg.index()];
        }
        self.ret = table[self.ret.index()];
        if let Some(va) = self.var_arg {
            self.var_arg = Some(table[va.index()]);
        }
        if let Some(id) = self.callee_id {
            self.callee_id = Some(table[id.index()]);
        }
    }
}

/// An indirect call awaiting resolution by the solver.
#[derive(Clone, Debug)]
pub struct IndirCall {
    pub fcn_ptr: ValueId,
    pub ci: CallInfo,
    pub cfg_node: CsFcnCFGNodeId,
}

#[derive(Clone)]
pub struct Cg {
    vals: ValueMap,
    constraints: Vec<Constraint>,
    /// Pending call sites, consumed by `resolve_calls`.
    calls: Vec<CallInfo>,
    indir_calls: Vec<IndirCall>,
    /// The functions whose bodies live in this graph.
    call_info: HashMap<FuncId, (CallInfo, CsFcnCFGNodeId)>,
    local_cfg: CsFcnCFG,
    cfg_id: CsFcnCFGNodeId,
    cur_stacks: Vec<Vec<CsId>>,
    invalid_stacks: HashSet<Vec<CsId>>,
    hcd_pairs: HashMap<ValueId, ValueId>,
}

impl Cg {
    /// Builds the constraint graph of a single function.
    pub fn new(acx: &mut AnalysisContext, fcn: FuncId) -> Self {
        let mut vals = ValueMap::new();
        let module = acx.module;
        let f = module.fcn(fcn);

        let args = (0..f.params.len() as u32)
            .map(|i| vals.get_def(ValueRef::Arg(fcn, i)))
            .collect();
        let ret = vals.get_def(ValueRef::Ret(fcn));
        let var_arg = if f.var_arg {
            Some(vals.create_phony())
        } else {
            None
        };
        let ci = CallInfo::new(CallOrigin::Fcn(fcn), args, ret, var_arg, None);

        let mut local_cfg = CsFcnCFG::new();
        let cfg_id = local_cfg.add_node(fcn, ci.clone());
        let mut call_info = HashMap::new();
        call_info.insert(fcn, (ci, cfg_id));

        let mut cg = Cg {
            vals,
            constraints: Vec::new(),
            calls: Vec::new(),
            indir_calls: Vec::new(),
            call_info,
            local_cfg,
            cfg_id,
            cur_stacks: vec![vec![acx.dyn_info.call_info.main_context()]],
            invalid_stacks: HashSet::new(),
            hcd_pairs: HashMap::new(),
        };

        cg_builder::populate_constraints(acx, &mut cg, fcn);
        cg
    }

    // Accessors.

    #[inline]
    pub fn vals(&self) -> &ValueMap {
        &self.vals
    }

    #[inline]
    pub fn vals_mut(&mut self) -> &mut ValueMap {
        &mut self.vals
    }

    #[inline]
    pub fn constraints(&self) -> &[Constraint] {
        &self.constraints
    }

    #[inline]
    pub fn constraints_len(&self) -> usize {
        self.constraints.len()
    }

    #[inline]
    pub fn call_info(&self) -> &HashMap<FuncId, (CallInfo, CsFcnCFGNodeId)> {
        &self.call_info
    }

    #[inline]
    pub fn local_cfg(&self) -> &CsFcnCFG {
        &self.local_cfg
    }

    #[inline]
    pub fn local_cfg_mut(&mut self) -> &mut CsFcnCFG {
        &mut self.local_cfg
    }

    #[inline]
    pub fn cfg_id(&self) -> CsFcnCFGNodeId {
        self.cfg_id
    }

    #[inline]
    pub fn invalid_stacks(&self) -> &HashSet<Vec<CsId>> {
        &self.invalid_stacks
    }

    #[inline]
    pub fn hcd_pairs(&self) -> &HashMap<ValueId, ValueId> {
        &self.hcd_pairs
    }

    pub fn set_hcd_pairs(&mut self, pairs: HashMap<ValueId, ValueId>) {
        self.hcd_pairs = pairs;
    }

    #[inline]
    pub fn indir_calls_len(&self) -> usize {
        self.indir_calls.len()
    }

    /// Moves pending indirect calls out of the graph, starting at `from`.
    pub fn take_indir_calls(&mut self, from: usize) -> Vec<IndirCall> {
        self.indir_calls.split_off(from)
    }

    pub fn push_call(&mut self, ci: CallInfo) {
        self.calls.push(ci);
    }

    // Constraint insertion.

    fn add(&mut self, kind: ConstraintKind, src: ValueId, dest: ValueId, rep: ValueId, offs: u32) {
        debug_assert!(src.index() < self.vals.len());
        debug_assert!(dest.index() < self.vals.len());
        self.constraints.push(Constraint::new(kind, src, dest, rep, offs));
    }

    pub fn add_addr(&mut self, obj: ValueId, dest: ValueId) {
        debug_assert_ne!(dest, ValueMap::NULL_VALUE);
        self.add(ConstraintKind::AddressOf, obj, dest, dest, 0);
    }

    pub fn add_copy(&mut self, src: ValueId, dest: ValueId) {
        debug_assert_ne!(dest, ValueMap::NULL_VALUE);
        self.add(ConstraintKind::Copy, src, dest, dest, 0);
    }

    pub fn add_copy_offs(&mut self, src: ValueId, dest: ValueId, offs: u32) {
        debug_assert_ne!(dest, ValueMap::NULL_VALUE);
        self.add(ConstraintKind::Copy, src, dest, dest, offs);
    }

    fn add_copy_rep(&mut self, src: ValueId, dest: ValueId, rep: ValueId) {
        self.add(ConstraintKind::Copy, src, dest, rep, 0);
    }

    pub fn add_load(&mut self, src: ValueId, dest: ValueId) {
        self.add(ConstraintKind::Load, src, dest, dest, 0);
    }

    pub fn add_store_rep(&mut self, src: ValueId, dest: ValueId, rep: ValueId) {
        self.add(ConstraintKind::Store, src, dest, rep, 0);
    }

    /// A store whose identity is a fresh phony id (global initializers and
    /// external models).
    pub fn add_store(&mut self, src: ValueId, dest: ValueId) {
        let rep = self.vals.create_phony();
        self.add(ConstraintKind::Store, src, dest, rep, 0);
    }

    pub fn add_indir_call(&mut self, fcn_ptr: ValueId, ci: CallInfo, cfg_node: CsFcnCFGNodeId) {
        self.indir_calls.push(IndirCall {
            fcn_ptr,
            ci,
            cfg_node,
        });
    }

    // Whole-program assembly.

    /// A deep copy carrying the given calling-context stacks. Invalid stacks
    /// are dropped at clone time.
    pub fn clone_with_stacks(&self, stacks: Vec<Vec<CsId>>) -> Cg {
        let mut cg = self.clone();
        cg.cur_stacks = stacks;
        cg.invalid_stacks.clear();
        cg
    }

    /// Inserts the constraints from `rhs` into this graph. Returns the
    /// remapped call info of every function body carried by `rhs`.
    pub fn map_in(&mut self, rhs: &Cg) -> HashMap<FuncId, (CallInfo, CsFcnCFGNodeId)> {
        let remap = self.vals.import(&rhs.vals);
        let cfg_remap = self.local_cfg.copy_nodes(&rhs.local_cfg, &remap);

        self.constraints.reserve(rhs.constraints.len());
        for cons in &rhs.constraints {
            let mut c = *cons;
            c.remap(&remap);
            self.constraints.push(c);
        }

        self.calls.reserve(rhs.calls.len());
        for ci in &rhs.calls {
            let mut ci = ci.clone();
            ci.remap(&remap);
            self.calls.push(ci);
        }

        for ic in &rhs.indir_calls {
            let mut ci = ic.ci.clone();
            ci.remap(&remap);
            self.indir_calls.push(IndirCall {
                fcn_ptr: remap[ic.fcn_ptr.index()],
                ci,
                cfg_node: cfg_remap[ic.cfg_node.index()],
            });
        }

        let mut ret = HashMap::new();
        for (f, (ci, node)) in &rhs.call_info {
            let mut ci = ci.clone();
            ci.remap(&remap);
            ret.insert(*f, (ci, cfg_remap[node.index()]));
        }

        self.invalid_stacks
            .extend(rhs.invalid_stacks.iter().cloned());

        ret
    }

    /// Merges a statically detected SCC sibling into this graph, converting
    /// calls between the two sides into direct internal edges.
    pub fn merge_scc(&mut self, acx: &mut AnalysisContext, rhs: &Cg) {
        debug_assert!(rhs
            .call_info
            .keys()
            .all(|f| !self.call_info.contains_key(f)));
        assert!(self.indir_calls.is_empty());
        assert!(rhs.indir_calls.is_empty());

        let remap_fcns = self.map_in(rhs);
        for (f, pr) in remap_fcns {
            self.call_info.insert(f, pr);
        }

        let calls = std::mem::take(&mut self.calls);
        let mut new_calls = Vec::new();
        for ci in calls {
            let cs = ci.site().expect("pending calls always come from a site");
            let called = acx.module.callee_fcn(cs);
            if let Some(f) = called {
                if self.call_info.contains_key(&f) {
                    let (callee_info, callee_node) = self.call_info.get(&f).unwrap().clone();
                    self.add_constraints_for_direct_call(acx, cs, f, &ci, &callee_info);
                    let caller_node = self.call_info.get(&ci.caller_fcn()).unwrap().1;
                    self.local_cfg.add_pred(callee_node, caller_node);
                    continue;
                }
            }
            new_calls.push(ci);
        }
        self.calls = new_calls;
    }

    /// Connects argument, return and vararg value flow of a direct call.
    fn add_constraints_for_direct_call(
        &mut self,
        acx: &AnalysisContext,
        cs: CallSite,
        callee: FuncId,
        caller_info: &CallInfo,
        callee_info: &CallInfo,
    ) {
        let module = acx.module;
        let types = &module.types;

        let result_ty = module.inst(cs).ty;
        if types.is_ptr(result_ty) {
            self.add_copy(callee_info.ret(), caller_info.ret());
        } else if types.is_ptr(module.fcn(callee).ret_ty) {
            warn!(
                "ignoring pointer return flowing into non-pointer call result at {:?}",
                cs
            );
        }

        let callee_fcn = module.fcn(callee);
        let call_args = module.call_args(cs);
        let mut argno = 0;
        while argno < callee_fcn.params.len()
            && argno < caller_info.args().len()
            && argno < call_args.len()
        {
            let param_ty = callee_fcn.params[argno];
            if types.is_ptr(param_ty) {
                if types.is_ptr(module.operand_ty(&call_args[argno])) {
                    let rep = self.vals.create_phony();
                    let src = caller_info.args()[argno];
                    let dest = callee_info.args()[argno];
                    self.add_copy_rep(src, dest, rep);
                } else {
                    warn!("ignoring non-pointer argument flowing into pointer parameter");
                }
            }
            argno += 1;
        }

        if callee_fcn.var_arg {
            if let Some(va) = callee_info.var_arg() {
                while argno < caller_info.args().len() && argno < call_args.len() {
                    if types.is_ptr(module.operand_ty(&call_args[argno])) {
                        self.add_copy(caller_info.args()[argno], va);
                    }
                    argno += 1;
                }
            }
        }
    }

    /// Candidate context stacks for a call at `cs`: every current stack,
    /// extended by the call site unless it already tops the stack. Stacks
    /// rejected by the context oracle land in `invalid`.
    fn get_callee_stacks(
        &self,
        acx: &AnalysisContext,
        cs: CallSite,
        mut invalid: Option<&mut Vec<Vec<CsId>>>,
    ) -> Vec<Vec<CsId>> {
        let call_info = &acx.dyn_info.call_info;
        let mut new_stacks = Vec::new();
        if !call_info.has_dyn_data() || acx.no_spec() {
            return new_stacks;
        }

        let new_id = acx.cs_cfg.get_id(cs);
        for stack in &self.cur_stacks {
            if stack.last() == Some(&new_id) {
                continue;
            }
            let mut new_stack = Vec::with_capacity(stack.len() + 1);
            new_stack.extend_from_slice(stack);
            new_stack.push(new_id);
            if !call_info.is_valid(&new_stack) {
                if let Some(inv) = invalid.as_mut() {
                    inv.push(new_stack);
                }
                continue;
            }
            new_stacks.push(new_stack);
        }
        new_stacks
    }

    /// Resolves every pending call site, recursively cloning callees.
    pub fn resolve_calls(
        &mut self,
        acx: &mut AnalysisContext,
        base_cgs: &CgCache,
        full_cgs: &mut CgCache,
    ) {
        let calls = std::mem::take(&mut self.calls);
        let mut dir_calls: Vec<(CallSite, FuncId, CallInfo)> = Vec::new();

        for ci in calls {
            let cs = ci.site().expect("pending calls always come from a site");
            if let Some(f) = acx.module.callee_fcn(cs) {
                dir_calls.push((cs, f, ci));
            } else if acx.dyn_info.indir_info.has_info() && !acx.no_spec() {
                let targets = acx.dyn_info.indir_info.targets(cs);
                for t in &targets {
                    dir_calls.push((cs, *t, ci.clone()));
                }
                acx.assumptions.add_ptsto(cs, targets);
            } else {
                let fcn_ptr = ci
                    .callee_id()
                    .expect("indirect call sites record their function pointer");
                let cfg_node = self.cfg_id;
                self.add_indir_call(fcn_ptr, ci, cfg_node);
            }
        }

        // Cyclic and external calls first; acyclic clones afterwards.
        let mut acyc_calls = Vec::new();
        for (cs, f, ci) in dir_calls {
            if acx.module.fcn(f).is_declaration() {
                self.add_constraints_for_external_call(acx, cs, f, &ci);
            } else if self.call_info.contains_key(&f) {
                let new_stacks = self.get_callee_stacks(acx, cs, None);
                let (callee_info, callee_node) = self.call_info.get(&f).unwrap().clone();
                self.cur_stacks.extend(new_stacks);
                self.add_constraints_for_direct_call(acx, cs, f, &ci, &callee_info);
                self.local_cfg.add_pred(callee_node, self.cfg_id);
            } else {
                acyc_calls.push((cs, f, ci));
            }
        }

        for (cs, f, ci) in acyc_calls {
            let mut invalid = Vec::new();
            let new_stacks = self.get_callee_stacks(acx, cs, Some(&mut invalid));
            self.resolve_dir_acyclic_call(acx, base_cgs, full_cgs, cs, f, &ci, new_stacks, invalid);
        }
    }

    fn resolve_dir_acyclic_call(
        &mut self,
        acx: &mut AnalysisContext,
        base_cgs: &CgCache,
        full_cgs: &mut CgCache,
        cs: CallSite,
        callee: FuncId,
        caller_info: &CallInfo,
        new_stacks: Vec<Vec<CsId>>,
        invalid_stacks: Vec<Vec<CsId>>,
    ) {
        let has_dyn = acx.dyn_info.call_info.has_dyn_data();

        if has_dyn && !acx.no_spec() && new_stacks.is_empty() {
            debug!("skipping call at {:?}: no valid dynamic stack", cs);
            for stack in invalid_stacks {
                self.invalid_stacks.insert(stack);
            }
            return;
        }

        let Some(base_cg) = base_cgs.try_get(callee) else {
            warn!("pruning call to {:?}: callee has no base graph", callee);
            return;
        };

        let memoize = !has_dyn || acx.no_spec();
        let remap = if memoize {
            if full_cgs.try_get(callee).is_none() {
                let mut tmp = base_cg.clone_with_stacks(new_stacks);
                tmp.resolve_calls(acx, base_cgs, full_cgs);
                full_cgs.add(callee, tmp);
            }
            let dest = full_cgs.try_get(callee).unwrap();
            self.map_in(dest)
        } else {
            let mut tmp = base_cg.clone_with_stacks(new_stacks);
            tmp.resolve_calls(acx, base_cgs, full_cgs);
            self.map_in(&tmp)
        };

        let (callee_info, callee_node) = remap
            .get(&callee)
            .expect("mapped-in graph must carry its own function")
            .clone();
        self.add_constraints_for_direct_call(acx, cs, callee, caller_info, &callee_info);
        self.local_cfg.add_pred(callee_node, self.cfg_id);
    }

    /// Applies the external-function model of a declaration-only callee.
    pub fn add_constraints_for_external_call(
        &mut self,
        acx: &mut AnalysisContext,
        cs: CallSite,
        callee: FuncId,
        caller_info: &CallInfo,
    ) {
        let module = acx.module;
        if acx.ext_info.is_unknown(&module.fcn(callee).name) {
            warn!(
                "unknown external function: {} (treating the call as a no-op)",
                module.fcn(callee).name
            );
        }
        let AnalysisContext {
            ext_info, mod_info, ..
        } = acx;
        ext_info.insert_call_cons(module, mod_info, self, cs, callee, caller_info);
    }

    /// Packs object ids behind value ids and remaps all embedded state.
    pub fn lower_allocs(&mut self) {
        let remap = self.vals.lower_allocs();

        for (ci, _) in self.call_info.values_mut() {
            ci.remap(&remap);
        }
        for ci in &mut self.calls {
            ci.remap(&remap);
        }
        for ic in &mut self.indir_calls {
            ic.ci.remap(&remap);
            ic.fcn_ptr = remap[ic.fcn_ptr.index()];
        }
        for cons in &mut self.constraints {
            cons.remap(&remap);
        }
        self.local_cfg.update_nodes(&remap);
    }

    /// Logs constraint counts by kind.
    pub fn constraint_stats(&self) {
        let mut num_addr = 0;
        let mut num_load = 0;
        let mut num_store = 0;
        let mut num_copy = 0;
        let mut num_gep = 0;
        for cons in &self.constraints {
            match cons.kind() {
                ConstraintKind::AddressOf => num_addr += 1,
                ConstraintKind::Load => num_load += 1,
                ConstraintKind::Store => num_store += 1,
                ConstraintKind::Copy => {
                    if cons.offs() == 0 {
                        num_copy += 1;
                    } else {
                        num_gep += 1;
                    }
                }
            }
        }
        info!(
            "constraints: addr-of {}, load {}, store {}, copy {}, gep {}",
            num_addr, num_load, num_store, num_copy, num_gep
        );
    }
}

/// Memoized per-function constraint graphs. The base cache holds one graph
/// per static SCC (keyed by the SCC's canonical member); the full cache holds
/// call-resolved graphs keyed by function.
pub struct CgCache {
    map: HashMap<FuncId, Cg>,
    scc_rep: HashMap<FuncId, FuncId>,
}

impl CgCache {
    pub fn new() -> Self {
        CgCache {
            map: HashMap::new(),
            scc_rep: HashMap::new(),
        }
    }

    /// Builds the base cache: one SCC-merged graph per used, defined
    /// function.
    pub fn build(acx: &mut AnalysisContext, cfg: &mut BasicFcnCFG) -> Self {
        let mut cache = CgCache::new();
        let mut visited: HashSet<FuncId> = HashSet::new();

        let fcn_ids: Vec<FuncId> = acx.module.fcn_ids().collect();
        for f in fcn_ids {
            if acx.module.fcn(f).is_declaration() {
                continue;
            }
            if !acx.dyn_info.used_info.is_used_fcn(f) && !acx.no_spec() {
                continue;
            }

            let scc_fcns: Vec<FuncId> = cfg
                .get_scc(f)
                .into_iter()
                .filter(|m| !acx.module.fcn(*m).is_declaration())
                .collect();
            let first = scc_fcns[0];
            if !visited.insert(first) {
                continue;
            }

            debug!("building base graph rooted at {}", acx.module.fcn(first).name);
            let mut cg = Cg::new(acx, first);
            for &member in &scc_fcns[1..] {
                visited.insert(member);
                let to_merge = Cg::new(acx, member);
                cg.merge_scc(acx, &to_merge);
            }

            for &member in &scc_fcns {
                cache.scc_rep.insert(member, first);
            }
            cache.map.insert(first, cg);
        }
        cache
    }

    pub fn try_get(&self, f: FuncId) -> Option<&Cg> {
        let key = self.scc_rep.get(&f).copied().unwrap_or(f);
        self.map.get(&key)
    }

    pub fn add(&mut self, f: FuncId, cg: Cg) {
        self.map.insert(f, cg);
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl Default for CgCache {
    fn default() -> Self {
        Self::new()
    }
}
