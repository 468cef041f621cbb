//! The whole-program IR container: globals, functions and constants.

use std::collections::HashMap;

use super::function::{Callee, CallSite, FuncId, Function, GlobalId, Inst, InstKind, Operand, ValueRef};
use super::types::{TypeId, TypeTable};

#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct Constant {
    pub kind: ConstKind,
    pub ty: TypeId,
}

#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub enum ConstKind {
    Null,
    Undef,
    Int(i64),
    Float,
    Global(GlobalId),
    Function(FuncId),
    Struct(Vec<Constant>),
    Array(Vec<Constant>),
    Expr(Box<ConstExpr>),
}

#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub enum ConstExpr {
    Gep { base: Constant, indices: Vec<u32> },
    BitCast { src: Constant },
    IntToPtr { src: Constant },
    PtrToInt { src: Constant },
    Add { lhs: Constant, rhs: Constant },
}

#[derive(Clone, Debug)]
pub struct Global {
    pub name: String,
    /// The pointee type of the global.
    pub ty: TypeId,
    /// The pointer type of the global when used as a value.
    pub val_ty: TypeId,
    pub init: Option<Constant>,
    /// Globals without an initializer and with external linkage fall back to
    /// the well-known initializer objects.
    pub external_linkage: bool,
}

#[derive(Clone, Debug, Default)]
pub struct Module {
    pub types: TypeTable,
    pub functions: Vec<Function>,
    pub globals: Vec<Global>,
    pub(crate) fcn_names: HashMap<String, FuncId>,
}

impl Module {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn fcn(&self, id: FuncId) -> &Function {
        &self.functions[id.0 as usize]
    }

    #[inline]
    pub fn global(&self, id: GlobalId) -> &Global {
        &self.globals[id.0 as usize]
    }

    pub fn fcn_by_name(&self, name: &str) -> Option<FuncId> {
        self.fcn_names.get(name).copied()
    }

    pub fn fcn_ids(&self) -> impl Iterator<Item = FuncId> {
        (0..self.functions.len() as u32).map(FuncId)
    }

    pub fn global_ids(&self) -> impl Iterator<Item = GlobalId> {
        (0..self.globals.len() as u32).map(GlobalId)
    }

    #[inline]
    pub fn inst(&self, cs: CallSite) -> &Inst {
        self.fcn(cs.func).inst(cs.inst)
    }

    /// The type of a value reference.
    pub fn value_ty(&self, vr: ValueRef) -> TypeId {
        match vr {
            ValueRef::Inst(f, i) => self.fcn(f).inst(i).ty,
            ValueRef::Arg(f, i) => self.fcn(f).params[i as usize],
            ValueRef::Global(g) => self.global(g).val_ty,
            ValueRef::Function(f) => self.fcn(f).val_ty,
            ValueRef::Ret(f) => self.fcn(f).ret_ty,
        }
    }

    /// The type of an operand.
    pub fn operand_ty(&self, op: &Operand) -> TypeId {
        match op {
            Operand::Value(vr) => self.value_ty(*vr),
            Operand::Const(c) => c.ty,
        }
    }

    /// The statically known callee of a callsite, looking through constant
    /// function references and constant bitcasts of them.
    pub fn callee_fcn(&self, cs: CallSite) -> Option<FuncId> {
        let callee = match &self.inst(cs).kind {
            InstKind::Call { callee, .. } | InstKind::Invoke { callee, .. } => callee,
            _ => return None,
        };
        match callee {
            Callee::Direct(f) => Some(*f),
            Callee::Indirect(Operand::Const(c)) => const_fcn(c),
            Callee::Indirect(_) => None,
        }
    }

    /// The argument operands of a callsite.
    pub fn call_args(&self, cs: CallSite) -> &[Operand] {
        match &self.inst(cs).kind {
            InstKind::Call { args, .. } | InstKind::Invoke { args, .. } => args,
            _ => &[],
        }
    }
}

fn const_fcn(c: &Constant) -> Option<FuncId> {
    match &c.kind {
        ConstKind::Function(f) => Some(*f),
        ConstKind::Expr(e) => match &**e {
            ConstExpr::BitCast { src } => const_fcn(src),
            _ => None,
        },
        _ => None,
    }
}
