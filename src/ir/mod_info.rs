// Copyright (c) 2024 <Wei Li>.
//
// This source code is licensed under the GNU license found in the
// LICENSE file in the root directory of this source tree.

//! Field-layout oracle for aggregate types.
//!
//! Sizes are measured in abstract field slots, not bytes: every scalar and
//! pointer occupies one slot, a struct occupies the sum of its fields, and
//! arrays collapse to their element type.

use std::collections::HashMap;

use super::module::Module;
use super::types::{TypeId, TypeKind};

#[derive(Clone, Debug)]
pub struct StructInfo {
    /// Flattened slot size of each top-level field.
    field_sizes: Vec<u32>,
    /// Starting slot offset of each top-level field.
    field_offsets: Vec<u32>,
    size: u32,
}

impl StructInfo {
    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn num_fields(&self) -> usize {
        self.field_sizes.len()
    }

    pub fn offsets(&self) -> &[u32] {
        &self.field_offsets
    }

    pub fn field_sizes(&self) -> &[u32] {
        &self.field_sizes
    }
}

#[derive(Clone, Debug, Default)]
pub struct ModInfo {
    struct_infos: HashMap<TypeId, StructInfo>,
}

impl ModInfo {
    pub fn new() -> Self {
        Self::default()
    }

    /// The number of field slots a value of `ty` occupies.
    pub fn size_of(&mut self, m: &Module, ty: TypeId) -> u32 {
        match m.types.kind(ty) {
            TypeKind::Struct(_) => self.struct_info(m, ty).size(),
            // Arrays collapse to their element type.
            TypeKind::Array(elem, _) => self.size_of(m, *elem),
            _ => 1,
        }
    }

    /// Layout of a struct type. `ty` must name a struct.
    pub fn struct_info(&mut self, m: &Module, ty: TypeId) -> &StructInfo {
        if !self.struct_infos.contains_key(&ty) {
            let info = self.compute(m, ty);
            self.struct_infos.insert(ty, info);
        }
        self.struct_infos.get(&ty).unwrap()
    }

    fn compute(&mut self, m: &Module, ty: TypeId) -> StructInfo {
        let fields = match m.types.kind(ty) {
            TypeKind::Struct(fields) => fields.clone(),
            _ => panic!("struct_info on a non-struct type"),
        };
        let mut field_sizes = Vec::with_capacity(fields.len());
        let mut field_offsets = Vec::with_capacity(fields.len());
        let mut offs = 0;
        for field in fields {
            field_offsets.push(offs);
            let size = self.size_of(m, field);
            field_sizes.push(size);
            offs += size;
        }
        StructInfo {
            field_sizes,
            field_offsets,
            size: offs,
        }
    }

    /// The constant slot offset selected by a GEP's index list. The first
    /// index steps over the pointee as an array and contributes nothing.
    pub fn gep_offs(&mut self, m: &Module, base_ptr_ty: TypeId, indices: &[u32]) -> u32 {
        let mut cur = m
            .types
            .pointee(base_ptr_ty)
            .expect("gep base must have a pointer type");
        let mut offs = 0;
        for &idx in indices.iter().skip(1) {
            match m.types.kind(cur).clone() {
                TypeKind::Struct(fields) => {
                    offs += self.struct_info(m, cur).offsets()[idx as usize];
                    cur = fields[idx as usize];
                }
                // Array steps collapse to offset zero.
                TypeKind::Array(elem, _) => cur = elem,
                _ => {}
            }
        }
        offs
    }
}

#[cfg(test)]
mod test {
    use super::ModInfo;
    use crate::ir::builder::ModuleBuilder;

    #[test]
    fn slot_sizes() {
        let mut mb = ModuleBuilder::new();
        let i8t = mb.int(8);
        let p8 = mb.ptr(i8t);
        let inner = mb.strct(vec![p8, p8]);
        let arr = mb.array(inner, 10);
        let outer = mb.strct(vec![i8t, inner, arr]);
        let m = mb.finish();

        let mut mi = ModInfo::new();
        assert_eq!(mi.size_of(&m, i8t), 1);
        assert_eq!(mi.size_of(&m, p8), 1);
        assert_eq!(mi.size_of(&m, inner), 2);
        // The array collapses to a single element.
        assert_eq!(mi.size_of(&m, arr), 2);
        assert_eq!(mi.size_of(&m, outer), 5);

        let si = mi.struct_info(&m, outer);
        assert_eq!(si.offsets(), &[0, 1, 3]);
        assert_eq!(si.field_sizes(), &[1, 2, 2]);
    }

    #[test]
    fn gep_offsets() {
        let mut mb = ModuleBuilder::new();
        let i8t = mb.int(8);
        let p8 = mb.ptr(i8t);
        let inner = mb.strct(vec![p8, p8]);
        let outer = mb.strct(vec![i8t, inner]);
        let pouter = mb.ptr(outer);
        let m = mb.finish();

        let mut mi = ModInfo::new();
        // gep %outer* x, 0, 1, 1 selects the second pointer of the inner
        // struct: slot 1 (inner start) + 1.
        assert_eq!(mi.gep_offs(&m, pouter, &[0, 1, 1]), 2);
        assert_eq!(mi.gep_offs(&m, pouter, &[0, 0]), 0);
        // A lone array-style index never moves the offset.
        assert_eq!(mi.gep_offs(&m, pouter, &[3]), 0);
    }
}
