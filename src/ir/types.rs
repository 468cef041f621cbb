//! Interned type table for the low-level IR.

use std::collections::HashMap;

/// The unique identifier of an interned type.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub struct TypeId(pub u32);

#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub enum TypeKind {
    Void,
    Int(u32),
    Float,
    Ptr(TypeId),
    Array(TypeId, u32),
    Struct(Vec<TypeId>),
    Fcn {
        params: Vec<TypeId>,
        ret: TypeId,
        var_arg: bool,
    },
}

/// All types of a module, deduplicated structurally.
#[derive(Clone, Debug, Default)]
pub struct TypeTable {
    kinds: Vec<TypeKind>,
    cache: HashMap<TypeKind, TypeId>,
}

impl TypeTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn intern(&mut self, kind: TypeKind) -> TypeId {
        if let Some(id) = self.cache.get(&kind) {
            return *id;
        }
        let id = TypeId(self.kinds.len() as u32);
        self.kinds.push(kind.clone());
        self.cache.insert(kind, id);
        id
    }

    #[inline]
    pub fn kind(&self, ty: TypeId) -> &TypeKind {
        &self.kinds[ty.0 as usize]
    }

    pub fn is_ptr(&self, ty: TypeId) -> bool {
        matches!(self.kind(ty), TypeKind::Ptr(_))
    }

    pub fn is_int(&self, ty: TypeId) -> bool {
        matches!(self.kind(ty), TypeKind::Int(_))
    }

    pub fn is_float(&self, ty: TypeId) -> bool {
        matches!(self.kind(ty), TypeKind::Float)
    }

    pub fn is_struct(&self, ty: TypeId) -> bool {
        matches!(self.kind(ty), TypeKind::Struct(_))
    }

    pub fn is_array(&self, ty: TypeId) -> bool {
        matches!(self.kind(ty), TypeKind::Array(..))
    }

    /// The pointee of a pointer type.
    pub fn pointee(&self, ty: TypeId) -> Option<TypeId> {
        match self.kind(ty) {
            TypeKind::Ptr(inner) => Some(*inner),
            _ => None,
        }
    }

    /// Strips any wrapping arrays: `[n x [m x T]]` yields `T`.
    pub fn strip_arrays(&self, mut ty: TypeId) -> TypeId {
        while let TypeKind::Array(inner, _) = self.kind(ty) {
            ty = *inner;
        }
        ty
    }
}
