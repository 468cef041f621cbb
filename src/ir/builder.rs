//! Programmatic construction of IR modules. There is no textual parser; test
//! programs and embedders assemble modules through these builders.

use super::function::{
    BinOp, Block, BlockId, Callee, FuncId, Function, GlobalId, Inst, InstId, InstKind, Operand,
    UnOp, ValueRef,
};
use super::module::{ConstExpr, ConstKind, Constant, Global, Module};
use super::types::{TypeId, TypeKind};

pub struct ModuleBuilder {
    module: Module,
}

impl ModuleBuilder {
    pub fn new() -> Self {
        ModuleBuilder {
            module: Module::new(),
        }
    }

    pub fn finish(self) -> Module {
        self.module
    }

    // Type constructors.

    pub fn void(&mut self) -> TypeId {
        self.module.types.intern(TypeKind::Void)
    }

    pub fn int(&mut self, width: u32) -> TypeId {
        self.module.types.intern(TypeKind::Int(width))
    }

    pub fn float(&mut self) -> TypeId {
        self.module.types.intern(TypeKind::Float)
    }

    pub fn ptr(&mut self, pointee: TypeId) -> TypeId {
        self.module.types.intern(TypeKind::Ptr(pointee))
    }

    pub fn array(&mut self, elem: TypeId, len: u32) -> TypeId {
        self.module.types.intern(TypeKind::Array(elem, len))
    }

    pub fn strct(&mut self, fields: Vec<TypeId>) -> TypeId {
        self.module.types.intern(TypeKind::Struct(fields))
    }

    pub fn fcn_ty(&mut self, params: Vec<TypeId>, ret: TypeId, var_arg: bool) -> TypeId {
        self.module.types.intern(TypeKind::Fcn { params, ret, var_arg })
    }

    // Globals and functions.

    pub fn add_global(&mut self, name: &str, ty: TypeId, init: Option<Constant>) -> GlobalId {
        let external_linkage = init.is_none();
        self.add_global_linkage(name, ty, init, external_linkage)
    }

    pub fn add_global_linkage(
        &mut self,
        name: &str,
        ty: TypeId,
        init: Option<Constant>,
        external_linkage: bool,
    ) -> GlobalId {
        let val_ty = self.ptr(ty);
        let id = GlobalId(self.module.globals.len() as u32);
        self.module.globals.push(Global {
            name: name.to_string(),
            ty,
            val_ty,
            init,
            external_linkage,
        });
        id
    }

    pub fn declare_fcn(&mut self, name: &str, params: Vec<TypeId>, ret: TypeId) -> FuncId {
        self.declare_fcn_vararg(name, params, ret, false)
    }

    pub fn declare_fcn_vararg(
        &mut self,
        name: &str,
        params: Vec<TypeId>,
        ret: TypeId,
        var_arg: bool,
    ) -> FuncId {
        let fcn_ty = self.fcn_ty(params.clone(), ret, var_arg);
        let val_ty = self.ptr(fcn_ty);
        let id = FuncId(self.module.functions.len() as u32);
        self.module.functions.push(Function {
            name: name.to_string(),
            params,
            ret_ty: ret,
            var_arg,
            val_ty,
            insts: Vec::new(),
            blocks: Vec::new(),
        });
        self.module.fcn_names.insert(name.to_string(), id);
        id
    }

    /// Opens a body builder for a previously declared function. The entry
    /// block is created on the first use.
    pub fn body(&mut self, fcn: FuncId) -> FunctionBuilder<'_> {
        if self.module.functions[fcn.0 as usize].blocks.is_empty() {
            self.module.functions[fcn.0 as usize].blocks.push(Block::default());
        }
        FunctionBuilder {
            module: &mut self.module,
            fcn,
            cur: BlockId(0),
        }
    }

    /// The pointer-to-function type of `f` when used as a value.
    pub fn fcn_val_ty(&self, f: FuncId) -> TypeId {
        self.module.fcn(f).val_ty
    }

    // Constant constructors.

    pub fn const_null(&mut self, ty: TypeId) -> Constant {
        Constant { kind: ConstKind::Null, ty }
    }

    pub fn const_undef(&mut self, ty: TypeId) -> Constant {
        Constant { kind: ConstKind::Undef, ty }
    }

    pub fn const_int(&mut self, ty: TypeId, v: i64) -> Constant {
        Constant { kind: ConstKind::Int(v), ty }
    }

    pub fn const_global(&mut self, g: GlobalId) -> Constant {
        let ty = self.module.global(g).val_ty;
        Constant { kind: ConstKind::Global(g), ty }
    }

    pub fn const_fcn(&mut self, f: FuncId) -> Constant {
        let ty = self.module.fcn(f).val_ty;
        Constant { kind: ConstKind::Function(f), ty }
    }

    pub fn const_struct(&mut self, ty: TypeId, fields: Vec<Constant>) -> Constant {
        Constant { kind: ConstKind::Struct(fields), ty }
    }

    pub fn const_array(&mut self, ty: TypeId, elems: Vec<Constant>) -> Constant {
        Constant { kind: ConstKind::Array(elems), ty }
    }

    pub fn const_bitcast(&mut self, ty: TypeId, src: Constant) -> Constant {
        Constant {
            kind: ConstKind::Expr(Box::new(ConstExpr::BitCast { src })),
            ty,
        }
    }

    pub fn const_gep(&mut self, ty: TypeId, base: Constant, indices: Vec<u32>) -> Constant {
        Constant {
            kind: ConstKind::Expr(Box::new(ConstExpr::Gep { base, indices })),
            ty,
        }
    }

    pub fn const_int_to_ptr(&mut self, ty: TypeId, src: Constant) -> Constant {
        Constant {
            kind: ConstKind::Expr(Box::new(ConstExpr::IntToPtr { src })),
            ty,
        }
    }

    pub fn const_ptr_to_int(&mut self, ty: TypeId, src: Constant) -> Constant {
        Constant {
            kind: ConstKind::Expr(Box::new(ConstExpr::PtrToInt { src })),
            ty,
        }
    }
}

impl Default for ModuleBuilder {
    fn default() -> Self {
        Self::new()
    }
}

pub struct FunctionBuilder<'a> {
    module: &'a mut Module,
    fcn: FuncId,
    cur: BlockId,
}

impl<'a> FunctionBuilder<'a> {
    pub fn fcn(&self) -> FuncId {
        self.fcn
    }

    pub fn arg(&self, i: u32) -> Operand {
        Operand::Value(ValueRef::Arg(self.fcn, i))
    }

    pub fn new_block(&mut self) -> BlockId {
        let f = self.fcn_mut();
        f.blocks.push(Block::default());
        BlockId(f.blocks.len() as u32 - 1)
    }

    pub fn switch_to(&mut self, b: BlockId) {
        self.cur = b;
    }

    fn fcn_mut(&mut self) -> &mut Function {
        &mut self.module.functions[self.fcn.0 as usize]
    }

    fn push(&mut self, kind: InstKind, ty: TypeId) -> Operand {
        let cur = self.cur;
        let f = self.fcn_mut();
        let id = InstId(f.insts.len() as u32);
        f.insts.push(Inst { kind, ty });
        f.blocks[cur.0 as usize].insts.push(id);
        Operand::Value(ValueRef::Inst(self.fcn, id))
    }

    pub fn alloca(&mut self, ty: TypeId) -> Operand {
        let res_ty = self.module.types.intern(TypeKind::Ptr(ty));
        self.push(InstKind::Alloca { ty }, res_ty)
    }

    pub fn load(&mut self, addr: Operand) -> Operand {
        let addr_ty = self.module.operand_ty(&addr);
        let res_ty = self
            .module
            .types
            .pointee(addr_ty)
            .expect("load address must have a pointer type");
        self.push(InstKind::Load { addr }, res_ty)
    }

    pub fn store(&mut self, val: Operand, addr: Operand) {
        let void = self.module.types.intern(TypeKind::Void);
        self.push(InstKind::Store { val, addr }, void);
    }

    pub fn gep(&mut self, base: Operand, indices: Vec<u32>) -> Operand {
        let base_ty = self.module.operand_ty(&base);
        let mut cur = self
            .module
            .types
            .pointee(base_ty)
            .expect("gep base must have a pointer type");
        for &idx in indices.iter().skip(1) {
            cur = match self.module.types.kind(cur) {
                TypeKind::Struct(fields) => fields[idx as usize],
                TypeKind::Array(elem, _) => *elem,
                _ => panic!("gep index into a non-aggregate type"),
            };
        }
        let res_ty = self.module.types.intern(TypeKind::Ptr(cur));
        self.push(InstKind::Gep { base, indices }, res_ty)
    }

    pub fn bitcast(&mut self, src: Operand, to_ty: TypeId) -> Operand {
        self.push(InstKind::BitCast { src }, to_ty)
    }

    pub fn int_to_ptr(&mut self, src: Operand, to_ty: TypeId) -> Operand {
        self.push(InstKind::IntToPtr { src }, to_ty)
    }

    pub fn ptr_to_int(&mut self, src: Operand, to_ty: TypeId) -> Operand {
        self.push(InstKind::PtrToInt { src }, to_ty)
    }

    pub fn phi(&mut self, ty: TypeId, incoming: Vec<(Operand, BlockId)>) -> Operand {
        self.push(InstKind::Phi { incoming }, ty)
    }

    pub fn select(&mut self, cond: Operand, tval: Operand, fval: Operand) -> Operand {
        let ty = self.module.operand_ty(&tval);
        self.push(InstKind::Select { cond, tval, fval }, ty)
    }

    pub fn call(&mut self, callee: FuncId, args: Vec<Operand>) -> Operand {
        let ret_ty = self.module.fcn(callee).ret_ty;
        self.push(
            InstKind::Call {
                callee: Callee::Direct(callee),
                args,
            },
            ret_ty,
        )
    }

    pub fn call_ind(&mut self, fcn_ptr: Operand, args: Vec<Operand>, ret_ty: TypeId) -> Operand {
        self.push(
            InstKind::Call {
                callee: Callee::Indirect(fcn_ptr),
                args,
            },
            ret_ty,
        )
    }

    pub fn ret(&mut self, val: Option<Operand>) {
        let void = self.module.types.intern(TypeKind::Void);
        self.push(InstKind::Ret { val }, void);
    }

    pub fn br(&mut self, dest: BlockId) {
        let void = self.module.types.intern(TypeKind::Void);
        let cur = self.cur;
        self.push(InstKind::Br { dest }, void);
        self.fcn_mut().blocks[cur.0 as usize].succs.push(dest);
    }

    pub fn cond_br(&mut self, cond: Operand, then_dest: BlockId, else_dest: BlockId) {
        let void = self.module.types.intern(TypeKind::Void);
        let cur = self.cur;
        self.push(InstKind::CondBr { cond, then_dest, else_dest }, void);
        let f = self.fcn_mut();
        f.blocks[cur.0 as usize].succs.push(then_dest);
        f.blocks[cur.0 as usize].succs.push(else_dest);
    }

    pub fn unary(&mut self, op: UnOp, src: Operand, ty: TypeId) -> Operand {
        self.push(InstKind::Unary { op, src }, ty)
    }

    pub fn binary(&mut self, op: BinOp, lhs: Operand, rhs: Operand) -> Operand {
        let ty = self.module.operand_ty(&lhs);
        self.push(InstKind::Binary { op, lhs, rhs }, ty)
    }

    pub fn cmp(&mut self, lhs: Operand, rhs: Operand) -> Operand {
        let ty = self.module.types.intern(TypeKind::Int(1));
        self.push(InstKind::Cmp { lhs, rhs }, ty)
    }

    pub fn extract_value(&mut self, base: Operand, ty: TypeId) -> Operand {
        self.push(InstKind::ExtractValue { base }, ty)
    }

    pub fn insert_value(&mut self, base: Operand, val: Operand) -> Operand {
        let ty = self.module.operand_ty(&base);
        self.push(InstKind::InsertValue { base, val }, ty)
    }

    pub fn va_arg(&mut self, ty: TypeId) -> Operand {
        self.push(InstKind::VaArg, ty)
    }
}
