// Copyright (c) 2024 <Wei Li>.
//
// This source code is licensed under the GNU license found in the
// LICENSE file in the root directory of this source tree.

//! Translates one function body into inclusion constraints.
//!
//! Instructions not listed here contribute no constraints. Blocks a dynamic
//! profile reports as never executed are skipped speculatively, each skip
//! recorded as a dead-code assumption.

use std::collections::{HashMap, HashSet};

use log::*;

use crate::graph::cg::{CallInfo, CallOrigin, Cg};
use crate::graph::value_map::{ValueId, ValueMap};
use crate::ir::analysis_context::AnalysisContext;
use crate::ir::function::{
    BlockId, Callee, CallSite, FuncId, InstId, InstKind, Operand, UnOp, ValueRef,
};
use crate::ir::module::{ConstExpr, ConstKind, Constant};

/// Emits the constraints of `fcn` into `cg`.
pub(crate) fn populate_constraints(acx: &mut AnalysisContext, cg: &mut Cg, fcn: FuncId) {
    let mut builder = CgBuilder { acx, cg, fcn };
    builder.build();
}

/// Emits the module-wide constraints (named singletons, globals and their
/// initializers, function address objects, and the entry function's argv and
/// envp arguments) into the entry graph.
pub fn add_global_constraints(acx: &mut AnalysisContext, cg: &mut Cg, main_fcn: FuncId) {
    // "Unknown may contain unknown": the universal value points to itself and
    // stores itself into itself. It deliberately has no other predecessors.
    cg.add_addr(ValueMap::UNIVERSAL_VALUE, ValueMap::UNIVERSAL_VALUE);
    cg.add_store(ValueMap::UNIVERSAL_VALUE, ValueMap::UNIVERSAL_VALUE);

    acx.ext_info.add_global_constraints(cg);

    let mut builder = CgBuilder { acx, cg, fcn: main_fcn };
    builder.add_globals();
}

struct CgBuilder<'a, 'm> {
    acx: &'a mut AnalysisContext<'m>,
    cg: &'a mut Cg,
    fcn: FuncId,
}

impl<'a, 'm> CgBuilder<'a, 'm> {
    fn build(&mut self) {
        let module = self.acx.module;
        let f = module.fcn(self.fcn);
        debug_assert!(!f.is_declaration());
        let mut seen = HashSet::new();
        self.scan_bb(f.entry_block(), &mut seen);
    }

    fn scan_bb(&mut self, bb: BlockId, seen: &mut HashSet<BlockId>) {
        let module = self.acx.module;

        if !self.acx.dyn_info.used_info.is_used_block(self.fcn, bb) && !self.acx.no_spec() {
            self.acx.assumptions.add_dead_code(self.fcn, bb);
            return;
        }
        if !seen.insert(bb) {
            return;
        }

        let block = module.fcn(self.fcn).block(bb);
        for &iid in &block.insts {
            self.visit_inst(iid);
        }
        // Successor blocks in DFS order.
        for &succ in &block.succs {
            self.scan_bb(succ, seen);
        }
    }

    fn visit_inst(&mut self, iid: InstId) {
        let module = self.acx.module;
        let inst = module.fcn(self.fcn).inst(iid);
        let is_ptr = module.types.is_ptr(inst.ty);

        match &inst.kind {
            InstKind::Ret { val } => {
                debug_assert!(!is_ptr);
                self.id_ret_inst(val);
            }
            InstKind::Call { .. } => {
                self.id_call_inst(iid);
            }
            InstKind::Invoke { .. } => {
                panic!("invoke instructions are not supported");
            }
            InstKind::Alloca { ty } => {
                debug_assert!(is_ptr);
                self.id_alloca_inst(iid, *ty);
            }
            InstKind::Load { addr } => {
                self.id_load_inst(iid, addr);
            }
            InstKind::Store { val, addr } => {
                debug_assert!(!is_ptr);
                self.id_store_inst(iid, val, addr);
            }
            InstKind::Gep { base, indices } => {
                debug_assert!(is_ptr);
                self.id_gep_inst(iid, base, indices);
            }
            // Consumes a pointer without defining or modifying one.
            InstKind::PtrToInt { .. } => {}
            InstKind::IntToPtr { src } => {
                debug_assert!(is_ptr);
                self.id_i2p_inst(iid, src);
            }
            InstKind::BitCast { src } => {
                if is_ptr {
                    self.id_bitcast_inst(iid, src);
                }
            }
            InstKind::Phi { incoming } => {
                if is_ptr {
                    self.id_phi_inst(iid, incoming);
                }
            }
            InstKind::Select { tval, fval, .. } => {
                self.id_select_inst(iid, tval, fval);
            }
            InstKind::VaArg => {
                if is_ptr {
                    panic!("vaarg instructions are not handled yet");
                }
            }
            InstKind::ExtractValue { .. } => {
                self.id_extract_inst(iid);
            }
            InstKind::InsertValue { val, .. } => {
                self.id_insert_inst(val);
            }
            InstKind::Br { .. }
            | InstKind::CondBr { .. }
            | InstKind::Unary { .. }
            | InstKind::Binary { .. }
            | InstKind::Cmp { .. } => {
                debug_assert!(!is_ptr, "unknown instruction has a pointer result type");
            }
        }
    }

    // Value ids.

    fn get_def(&mut self, op: &Operand) -> ValueId {
        match op {
            Operand::Value(vr) => self.cg.vals_mut().get_def(*vr),
            Operand::Const(c) => {
                let id = self.get_const_value(c);
                self.cg.vals().get_rep(id)
            }
        }
    }

    fn get_const_value(&mut self, c: &Constant) -> ValueId {
        let module = self.acx.module;
        match &c.kind {
            ConstKind::Null | ConstKind::Undef => ValueMap::NULL_VALUE,
            ConstKind::Global(g) => self.cg.vals_mut().get_def(ValueRef::Global(*g)),
            ConstKind::Function(f) => self.cg.vals_mut().get_def(ValueRef::Function(*f)),
            ConstKind::Int(_) | ConstKind::Float => ValueMap::INT_VALUE,
            ConstKind::Struct(_) | ConstKind::Array(_) => {
                panic!("constant aggregates only appear inside global initializers");
            }
            ConstKind::Expr(e) => match &**e {
                ConstExpr::Gep { base, indices } => {
                    let (created, obj_id) = self.cg.vals_mut().get_const(c);
                    if created {
                        let offs = self.acx.mod_info.gep_offs(module, base.ty, indices);
                        let src_id = self.get_def(&Operand::Const(base.clone()));
                        self.cg.add_copy_offs(src_id, obj_id, offs);
                    }
                    obj_id
                }
                ConstExpr::IntToPtr { .. } => ValueMap::INT_VALUE,
                ConstExpr::PtrToInt { .. } => {
                    debug!("constant pointer-to-int collapses to the int value");
                    ValueMap::INT_VALUE
                }
                ConstExpr::BitCast { src } => {
                    let (created, dest_id) = self.cg.vals_mut().get_const(c);
                    if created {
                        let src_id = self.get_def(&Operand::Const(src.clone()));
                        self.add_cast_copies(src.ty, c.ty, src_id, dest_id);
                    }
                    dest_id
                }
                ConstExpr::Add { lhs, rhs } => {
                    let (created, dest_id) = self.cg.vals_mut().get_const(c);
                    if created {
                        let lhs_ptr = module.types.is_ptr(lhs.ty);
                        let rhs_ptr = module.types.is_ptr(rhs.ty);
                        if !lhs_ptr && !rhs_ptr {
                            self.cg.add_copy(ValueMap::INT_VALUE, dest_id);
                        } else {
                            if lhs_ptr {
                                let id = self.get_def(&Operand::Const(lhs.clone()));
                                self.cg.add_copy(id, dest_id);
                            }
                            if rhs_ptr {
                                let id = self.get_def(&Operand::Const(rhs.clone()));
                                self.cg.add_copy(id, dest_id);
                            }
                        }
                    }
                    dest_id
                }
            },
        }
    }

    /// Copies for a pointer cast. A cast from a struct pointer to an array
    /// pointer fans out to every top-level field offset of the struct.
    fn add_cast_copies(&mut self, src_ty: crate::ir::types::TypeId, dest_ty: crate::ir::types::TypeId, src_id: ValueId, dest_id: ValueId) {
        let module = self.acx.module;
        let types = &module.types;
        let src_pointee = types.pointee(src_ty);
        let dest_pointee = types.pointee(dest_ty);
        if let (Some(sp), Some(dp)) = (src_pointee, dest_pointee) {
            if types.is_struct(sp) && types.is_array(dp) {
                let offsets = self.acx.mod_info.struct_info(module, sp).offsets().to_vec();
                for offs in offsets {
                    self.cg.add_copy_offs(src_id, dest_id, offs);
                }
                return;
            }
        }
        self.cg.add_copy(src_id, dest_id);
    }

    // Per-instruction rules.

    fn id_ret_inst(&mut self, val: &Option<Operand>) {
        let module = self.acx.module;
        let Some(src) = val else { return };
        if !module.types.is_ptr(module.operand_ty(src)) {
            return;
        }
        let returned_id = self.get_def(src);
        let ret_id = self.cg.call_info().get(&self.fcn).unwrap().0.ret();
        self.cg.add_copy(returned_id, ret_id);
    }

    fn id_call_inst(&mut self, iid: InstId) {
        let module = self.acx.module;
        let cs = CallSite::new(self.fcn, iid);
        let result = ValueRef::Inst(self.fcn, iid);

        if let Some(f) = module.callee_fcn(cs) {
            // Allocator declarations become address-of operations instead of
            // calls; the allocated type is inferred from the result's uses.
            if module.fcn(f).is_declaration() && self.acx.ext_info.is_alloc(&module.fcn(f).name) {
                let size = match self.acx.ext_info.infer_alloc_ty(module, cs) {
                    Some(ty) => self.acx.mod_info.size_of(module, ty),
                    None => 1,
                };
                let dest_id = self.cg.vals_mut().get_def(result);
                let obj_id = self.cg.vals_mut().create_alloc(result, size);
                debug!("allocation at {:?}: object {:?}, size {}", cs, obj_id, size);
                self.cg.add_addr(obj_id, dest_id);
                if let Some(arg0) = module.call_args(cs).first() {
                    if self.acx.ext_info.kind(&module.fcn(f).name)
                        == Some(super::ext_info::ExtFcnKind::AllocCopyArg0)
                        && module.types.is_ptr(module.operand_ty(arg0))
                    {
                        let arg0_id = self.get_def(arg0);
                        self.cg.add_copy(arg0_id, dest_id);
                    }
                }
                return;
            }
        }

        let mut args: Vec<ValueId> = Vec::new();
        for a in module.call_args(cs) {
            args.push(self.get_def(a));
        }
        let ret = self.cg.vals_mut().get_def(result);
        let callee_id = match &module.inst(cs).kind {
            InstKind::Call {
                callee: Callee::Indirect(op),
                ..
            } if module.callee_fcn(cs).is_none() => Some(self.get_def(op)),
            _ => None,
        };
        self.cg
            .push_call(CallInfo::new(CallOrigin::Site(cs), args, ret, None, callee_id));
    }

    fn id_alloca_inst(&mut self, iid: InstId, ty: crate::ir::types::TypeId) {
        let module = self.acx.module;
        let size = self.acx.mod_info.size_of(module, ty);
        let v = ValueRef::Inst(self.fcn, iid);
        let dest_id = self.cg.vals_mut().get_def(v);
        let obj_id = self.cg.vals_mut().create_alloc(v, size);
        self.cg.add_addr(obj_id, dest_id);
    }

    fn id_load_inst(&mut self, iid: InstId, addr: &Operand) {
        let module = self.acx.module;
        let types = &module.types;
        let addr_id = self.get_def(addr);
        let ld_ty = module.fcn(self.fcn).inst(iid).ty;

        if types.is_ptr(ld_ty) {
            let dest_id = self.cg.vals_mut().get_def(ValueRef::Inst(self.fcn, iid));
            self.cg.add_load(addr_id, dest_id);
        } else if let Some(pointee) = types.pointee(module.operand_ty(addr)) {
            if types.is_ptr(pointee) && types.is_int(ld_ty) {
                // Pointer bits observed through an integer load; they pool
                // into the int value so int-to-ptr can recover them.
                let _ld_id = self.cg.vals_mut().get_def(ValueRef::Inst(self.fcn, iid));
                debug!("load of pointer bits into an integer");
                self.cg.add_load(addr_id, ValueMap::INT_VALUE);
            } else if types.is_struct(ld_ty) {
                warn!("unhandled struct load");
            }
        }
    }

    fn id_store_inst(&mut self, iid: InstId, val: &Operand, addr: &Operand) {
        let module = self.acx.module;
        let types = &module.types;
        let st_id = self.cg.vals_mut().get_def(ValueRef::Inst(self.fcn, iid));
        let val_ty = module.operand_ty(val);
        let addr_ty = module.operand_ty(addr);

        if types.is_ptr(val_ty) {
            let dest = self.get_def(addr);
            let src = self.get_def(val);
            self.cg.add_store_rep(src, dest, st_id);
            return;
        }

        // A pointer cast to an int, then stored: keep the pointer flowing.
        if let Operand::Const(Constant {
            kind: ConstKind::Expr(e),
            ..
        }) = val
        {
            if let ConstExpr::PtrToInt { src } = &**e {
                let dest = self.get_def(addr);
                let src_id = self.get_def(&Operand::Const(src.clone()));
                self.cg.add_store_rep(src_id, dest, st_id);
                return;
            }
        }

        if types.is_int(val_ty) && types.is_ptr(addr_ty) {
            let pointee = types.pointee(addr_ty).unwrap();
            if !types.is_int(pointee) {
                let dest = self.get_def(addr);
                debug!("store of an integer through a pointer-typed location");
                self.cg.add_store_rep(ValueMap::INT_VALUE, dest, st_id);
            } else {
                // Int stored into an int slot: only the destination matters.
                let _ = self.get_def(addr);
            }
            return;
        }

        if types.is_struct(val_ty) {
            warn!("ignoring struct store");
            return;
        }

        if !types.is_float(val_ty) {
            warn!("store of unhandled value kind not added to the graph");
        }
    }

    fn id_gep_inst(&mut self, iid: InstId, base: &Operand, indices: &[u32]) {
        let module = self.acx.module;
        let base_ty = module.operand_ty(base);
        let offs = self.acx.mod_info.gep_offs(module, base_ty, indices);
        let src_id = self.get_def(base);
        let gep_id = self.cg.vals_mut().get_def(ValueRef::Inst(self.fcn, iid));
        self.cg.add_copy_offs(src_id, gep_id, offs);
    }

    fn id_bitcast_inst(&mut self, iid: InstId, src: &Operand) {
        let module = self.acx.module;
        debug_assert!(module.types.is_ptr(module.operand_ty(src)));
        let dest_ty = module.fcn(self.fcn).inst(iid).ty;
        let src_ty = module.operand_ty(src);
        let src_id = self.get_def(src);
        let dest_id = self.cg.vals_mut().get_def(ValueRef::Inst(self.fcn, iid));
        self.add_cast_copies(src_ty, dest_ty, src_id, dest_id);
    }

    fn id_phi_inst(&mut self, iid: InstId, incoming: &[(Operand, BlockId)]) {
        let phid = self.cg.vals_mut().get_def(ValueRef::Inst(self.fcn, iid));
        for (op, _) in incoming {
            let id = self.get_def(op);
            self.cg.add_copy(id, phid);
        }
    }

    fn id_select_inst(&mut self, iid: InstId, tval: &Operand, fval: &Operand) {
        let module = self.acx.module;
        let sel_ty = module.fcn(self.fcn).inst(iid).ty;
        if module.types.is_ptr(sel_ty) {
            let sid = self.cg.vals_mut().get_def(ValueRef::Inst(self.fcn, iid));
            let t = self.get_def(tval);
            self.cg.add_copy(t, sid);
            let f = self.get_def(fval);
            self.cg.add_copy(f, sid);
        } else if module.types.is_struct(sel_ty) {
            warn!("unsupported select on a struct value");
        }
    }

    /// Int-to-pointer: trace the integer back through arithmetic, loads and
    /// casts. Pointer sources found on the way flow directly; if any traced
    /// path ends in genuine integer bits, the int value flows in as well.
    fn id_i2p_inst(&mut self, iid: InstId, src: &Operand) {
        let dest_id = self.cg.vals_mut().get_def(ValueRef::Inst(self.fcn, iid));

        let mut srcs: Vec<Operand> = Vec::new();
        let mut seen: HashMap<Operand, bool> = HashMap::new();
        let has_i2p = self.trace_int(src, &mut srcs, &mut seen);

        for s in srcs {
            let id = self.get_def(&s);
            self.cg.add_copy(id, dest_id);
        }
        if has_i2p {
            self.cg.add_copy(ValueMap::INT_VALUE, dest_id);
        }
    }

    fn id_extract_inst(&mut self, iid: InstId) {
        let module = self.acx.module;
        let ty = module.fcn(self.fcn).inst(iid).ty;
        if module.types.is_ptr(ty) {
            let dest = self.cg.vals_mut().get_def(ValueRef::Inst(self.fcn, iid));
            self.cg.add_copy(ValueMap::AGGREGATE_VALUE, dest);
        } else if module.types.is_int(ty) {
            self.cg
                .add_copy(ValueMap::AGGREGATE_VALUE, ValueMap::INT_VALUE);
        }
    }

    fn id_insert_inst(&mut self, val: &Operand) {
        let module = self.acx.module;
        let ty = module.operand_ty(val);
        if module.types.is_ptr(ty) {
            let src = self.get_def(val);
            self.cg.add_copy(src, ValueMap::AGGREGATE_VALUE);
        } else if module.types.is_int(ty) {
            self.cg
                .add_copy(ValueMap::INT_VALUE, ValueMap::AGGREGATE_VALUE);
        }
    }

    /// Returns true if the traced value may carry genuine (non-pointer)
    /// integer bits. Pointers found along the trace are pushed into `srcs`.
    fn trace_int(
        &mut self,
        op: &Operand,
        srcs: &mut Vec<Operand>,
        seen: &mut HashMap<Operand, bool>,
    ) -> bool {
        if let Some(v) = seen.get(op) {
            return *v;
        }
        seen.insert(op.clone(), false);

        let module = self.acx.module;
        let types = &module.types;

        let ret = match op {
            Operand::Const(c) => match &c.kind {
                ConstKind::Int(_) | ConstKind::Float | ConstKind::Null | ConstKind::Undef => true,
                ConstKind::Global(_) | ConstKind::Function(_) => true,
                ConstKind::Struct(_) | ConstKind::Array(_) => true,
                ConstKind::Expr(e) => match &**e {
                    ConstExpr::PtrToInt { src } => {
                        push_src(srcs, Operand::Const(src.clone()));
                        false
                    }
                    ConstExpr::Add { lhs, rhs } => {
                        self.trace_int(&Operand::Const(lhs.clone()), srcs, seen)
                            && self.trace_int(&Operand::Const(rhs.clone()), srcs, seen)
                    }
                    ConstExpr::BitCast { src } => {
                        self.trace_int(&Operand::Const(src.clone()), srcs, seen)
                    }
                    ConstExpr::IntToPtr { .. } | ConstExpr::Gep { .. } => true,
                },
            },
            Operand::Value(ValueRef::Arg(..)) => true,
            Operand::Value(
                ValueRef::Global(_) | ValueRef::Function(_) | ValueRef::Ret(_),
            ) => true,
            Operand::Value(ValueRef::Inst(f, i)) => {
                let inst = module.fcn(*f).inst(*i);
                match &inst.kind {
                    InstKind::Call { .. }
                    | InstKind::Invoke { .. }
                    | InstKind::VaArg
                    | InstKind::ExtractValue { .. }
                    | InstKind::Cmp { .. } => true,
                    InstKind::PtrToInt { src } => {
                        push_src(srcs, src.clone());
                        false
                    }
                    InstKind::Load { addr } => self.trace_int_load(*f, *i, addr, srcs, seen),
                    InstKind::Unary { op, src } => match op {
                        UnOp::Trunc | UnOp::ZExt | UnOp::SExt => {
                            if types.is_int(module.operand_ty(src)) {
                                self.trace_int(src, srcs, seen)
                            } else {
                                true
                            }
                        }
                        UnOp::FpToInt => true,
                    },
                    InstKind::BitCast { src } => {
                        if types.is_int(module.operand_ty(src)) {
                            self.trace_int(src, srcs, seen)
                        } else {
                            true
                        }
                    }
                    InstKind::Binary { lhs, rhs, .. } => {
                        self.trace_int(lhs, srcs, seen) && self.trace_int(rhs, srcs, seen)
                    }
                    InstKind::Phi { incoming } => {
                        let mut ret = false;
                        for (op, _) in incoming {
                            let ty = module.operand_ty(op);
                            if types.is_int(ty) {
                                ret |= self.trace_int(op, srcs, seen);
                            } else if types.is_ptr(ty) {
                                push_src(srcs, op.clone());
                            } else {
                                ret = true;
                            }
                        }
                        ret
                    }
                    InstKind::Select { tval, fval, .. } => {
                        self.trace_int(tval, srcs, seen) && self.trace_int(fval, srcs, seen)
                    }
                    _ => true,
                }
            }
        };
        seen.insert(op.clone(), ret);
        ret
    }

    fn trace_int_load(
        &mut self,
        f: FuncId,
        load: InstId,
        addr: &Operand,
        srcs: &mut Vec<Operand>,
        seen: &mut HashMap<Operand, bool>,
    ) -> bool {
        let module = self.acx.module;

        // A load from a global traces through its initializer.
        if let Operand::Const(Constant {
            kind: ConstKind::Global(g),
            ..
        }) = addr
        {
            return match &module.global(*g).init {
                Some(init) => self.trace_int(&Operand::Const(init.clone()), srcs, seen),
                None => true,
            };
        }

        // Otherwise look for a store forwarded within the same block.
        let fcn = module.fcn(f);
        let mut source = None;
        if let Some(bb) = fcn.block_of(load) {
            for &jid in &fcn.block(bb).insts {
                if jid == load {
                    break;
                }
                if let InstKind::Store { val, addr: a } = &fcn.inst(jid).kind {
                    if a == addr {
                        source = Some(val.clone());
                    }
                }
            }
        }
        match source {
            Some(s) => self.trace_int(&s, srcs, seen),
            None => true,
        }
    }

    // Globals.

    fn add_globals(&mut self) {
        let module = self.acx.module;

        for g in module.global_ids() {
            let glbl = module.global(g);
            let size = self.acx.mod_info.size_of(module, glbl.ty);
            let val_id = self.cg.vals_mut().get_def(ValueRef::Global(g));
            let obj_id = self.cg.vals_mut().create_alloc(ValueRef::Global(g), size);
            self.cg.add_addr(obj_id, val_id);

            match &glbl.init {
                // A null initializer points to nothing.
                Some(Constant {
                    kind: ConstKind::Null,
                    ..
                }) => {}
                Some(init) => {
                    self.add_global_initializer_cons(val_id, init);
                }
                // A defined global without an initializer is zero-initialized
                // and points to nothing; externally linked globals get their
                // well-known contents.
                None if glbl.external_linkage => {
                    let fallback = self.get_global_initializer(g);
                    if fallback == ValueMap::UNIVERSAL_VALUE {
                        warn!(
                            "global {} without initializer falls back to the universal value",
                            module.global(g).name
                        );
                    }
                    self.cg.add_store(fallback, val_id);
                }
                None => {}
            }
        }

        // Every function address is an object.
        for f in module.fcn_ids() {
            let fcn_val = self.cg.vals_mut().get_def(ValueRef::Function(f));
            let fcn_alloc = self.cg.vals_mut().create_alloc(ValueRef::Function(f), 1);
            self.cg.add_addr(fcn_alloc, fcn_val);
        }

        // The entry function's second and third arguments come from the
        // well-known argv/envp objects.
        let main_args = self.cg.call_info().get(&self.fcn).unwrap().0.args().to_vec();
        if main_args.len() >= 2 {
            let argv_src = self.cg.vals_mut().get_named("argv");
            self.cg.add_copy(argv_src, main_args[1]);
        }
        if main_args.len() == 3 {
            let envp_src = self.cg.vals_mut().get_named("envp");
            self.cg.add_copy(envp_src, main_args[2]);
        }
    }

    /// The well-known object a library-defined global resolves to.
    fn get_global_initializer(&mut self, g: crate::ir::function::GlobalId) -> ValueId {
        let name = self.acx.module.global(g).name.clone();
        match name.as_str() {
            "stdout" | "stderr" | "stdin" => self.cg.vals_mut().get_named("stdio"),
            "environ" => self.cg.vals_mut().get_named("envp"),
            _ => ValueMap::UNIVERSAL_VALUE,
        }
    }

    /// Walks a global initializer, assigning constants field by field.
    /// Returns the number of slots the constant covered.
    fn add_global_initializer_cons(&mut self, dest: ValueId, c: &Constant) -> u32 {
        let module = self.acx.module;
        let types = &module.types;

        match &c.kind {
            ConstKind::Null | ConstKind::Undef => {
                let stripped = types.strip_arrays(c.ty);
                if types.is_struct(stripped) {
                    self.acx.mod_info.struct_info(module, stripped).size()
                } else {
                    1
                }
            }
            ConstKind::Struct(fields) => {
                let mut offset = 0;
                for field in fields {
                    let new_dest = self.cg.vals_mut().create_phony();
                    self.cg.add_copy_offs(dest, new_dest, offset);
                    offset += self.add_global_initializer_cons(new_dest, field);
                }
                offset
            }
            // Arrays collapse: every element assigns into offset zero.
            ConstKind::Array(elems) => {
                let mut offset = 1;
                for e in elems {
                    offset = self.add_global_initializer_cons(dest, e);
                }
                offset
            }
            _ => {
                if types.is_ptr(c.ty) {
                    let const_id = self.get_def(&Operand::Const(c.clone()));
                    // A synthetic "global init" store.
                    self.cg.add_store(const_id, dest);
                }
                1
            }
        }
    }
}

fn push_src(srcs: &mut Vec<Operand>, op: Operand) {
    if !srcs.contains(&op) {
        srcs.push(op);
    }
}

#[cfg(test)]
mod test {
    use crate::graph::cg::{Cg, ConstraintKind};
    use crate::graph::value_map::ValueMap;
    use crate::ir::analysis_context::AnalysisContext;
    use crate::ir::builder::ModuleBuilder;
    use crate::ir::function::{BinOp, Operand, ValueRef};
    use crate::util::options::AnalysisOptions;

    fn count(cg: &Cg, kind: ConstraintKind) -> usize {
        cg.constraints().iter().filter(|c| c.kind() == kind).count()
    }

    #[test]
    fn basic_constraint_shapes() {
        let mut mb = ModuleBuilder::new();
        let i8t = mb.int(8);
        let p8 = mb.ptr(i8t);
        let s = mb.strct(vec![p8, p8]);
        let f = mb.declare_fcn("f", vec![p8], p8);
        {
            let mut fb = mb.body(f);
            let p = fb.alloca(s);
            let q = fb.gep(p.clone(), vec![0, 1]);
            let a0 = fb.arg(0);
            fb.store(a0, q.clone());
            let y = fb.load(q);
            fb.ret(Some(y));
        }
        let module = mb.finish();

        let mut acx = AnalysisContext::new(&module, AnalysisOptions::default());
        let fid = module.fcn_by_name("f").unwrap();
        let cg = Cg::new(&mut acx, fid);

        assert_eq!(count(&cg, ConstraintKind::AddressOf), 1);
        assert_eq!(count(&cg, ConstraintKind::Store), 1);
        assert_eq!(count(&cg, ConstraintKind::Load), 1);
        let geps = cg
            .constraints()
            .iter()
            .filter(|c| c.kind() == ConstraintKind::Copy && c.offs() != 0)
            .count();
        assert_eq!(geps, 1, "the field access is the only gep");
        let copies = cg
            .constraints()
            .iter()
            .filter(|c| c.kind() == ConstraintKind::Copy && c.offs() == 0)
            .count();
        assert_eq!(copies, 1, "the return copy is the only plain copy");
    }

    #[test]
    fn int_to_ptr_traces_through_arithmetic() {
        let mut mb = ModuleBuilder::new();
        let i8t = mb.int(8);
        let i64t = mb.int(64);
        let p8 = mb.ptr(i8t);
        let void = mb.void();
        let f = mb.declare_fcn("f", vec![], void);
        let one = mb.const_int(i64t, 1);
        let (p, q) = {
            let mut fb = mb.body(f);
            let p = fb.alloca(i8t);
            let z = fb.ptr_to_int(p.clone(), i64t);
            let w = fb.binary(BinOp::Add, z, one.into());
            let q = fb.int_to_ptr(w, p8);
            fb.ret(None);
            (p, q)
        };
        let module = mb.finish();

        let mut acx = AnalysisContext::new(&module, AnalysisOptions::default());
        let fid = module.fcn_by_name("f").unwrap();
        let cg = Cg::new(&mut acx, fid);

        let p_vr = match &p {
            Operand::Value(v) => *v,
            _ => unreachable!(),
        };
        let q_vr = match &q {
            Operand::Value(v) => *v,
            _ => unreachable!(),
        };
        let p_id = cg.vals().try_def(&p_vr).unwrap();
        let q_id = cg.vals().try_def(&q_vr).unwrap();

        // The traced pointer flows directly; the constant on the other side
        // of the add is short-circuited away, so no int fallback appears.
        let into_q: Vec<_> = cg
            .constraints()
            .iter()
            .filter(|c| c.kind() == ConstraintKind::Copy && c.dest() == q_id)
            .collect();
        assert_eq!(into_q.len(), 1);
        assert_eq!(into_q[0].src(), p_id);
        assert!(into_q.iter().all(|c| c.src() != ValueMap::INT_VALUE));
    }
}
