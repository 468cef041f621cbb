// Copyright (c) 2024 <Wei Li>.
//
// This source code is licensed under the GNU license found in the
// LICENSE file in the root directory of this source tree.

//! Dense identifier assignment for values, objects and phony intermediates,
//! with union-find over the identifiers.

use std::collections::HashMap;

use crate::ir::function::{FuncId, ValueRef};
use crate::ir::module::Constant;
use crate::util::bit_vec::Idx;

/// The dense identifier of one abstract value or memory object.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub struct ValueId(pub u32);

impl Idx for ValueId {
    #[inline]
    fn new(idx: usize) -> Self {
        assert!(idx <= u32::MAX as usize);
        ValueId(idx as u32)
    }

    #[inline]
    fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum ValKind {
    Special(&'static str),
    /// A named singleton value (`argv`, `envp`, `stdio`).
    Named(String),
    Value(ValueRef),
    Const(Constant),
    Object { alloc: u32, field: u32 },
    Phony,
}

#[derive(Clone, Debug)]
struct AllocInfo {
    start: ValueId,
    size: u32,
    val: Option<ValueRef>,
}

/// The value map of one constraint graph.
///
/// Reserved identifiers occupy the first slots of every map, so they keep
/// their identity across imports without translation.
#[derive(Clone, Debug)]
pub struct ValueMap {
    kinds: Vec<ValKind>,
    reps: Vec<ValueId>,
    defs: HashMap<ValueRef, ValueId>,
    rev_defs: HashMap<ValueRef, Vec<ValueId>>,
    consts: HashMap<Constant, ValueId>,
    named: HashMap<String, ValueId>,
    allocs: Vec<AllocInfo>,
    /// Identity lookup for allocations of globals and functions.
    alloc_by_val: HashMap<ValueRef, u32>,
}

impl ValueMap {
    pub const NULL_VALUE: ValueId = ValueId(0);
    pub const INT_VALUE: ValueId = ValueId(1);
    pub const UNIVERSAL_VALUE: ValueId = ValueId(2);
    pub const AGGREGATE_VALUE: ValueId = ValueId(3);

    pub fn new() -> Self {
        let kinds = vec![
            ValKind::Special("null"),
            ValKind::Special("int"),
            ValKind::Special("universal"),
            ValKind::Special("aggregate"),
        ];
        let reps = (0..kinds.len()).map(ValueId::new).collect();
        ValueMap {
            kinds,
            reps,
            defs: HashMap::new(),
            rev_defs: HashMap::new(),
            consts: HashMap::new(),
            named: HashMap::new(),
            allocs: Vec::new(),
            alloc_by_val: HashMap::new(),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.kinds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }

    fn fresh(&mut self, kind: ValKind) -> ValueId {
        let id = ValueId(self.kinds.len() as u32);
        self.kinds.push(kind);
        self.reps.push(id);
        id
    }

    /// The identifier of the SSA definition of `v`, created on first use.
    pub fn get_def(&mut self, v: ValueRef) -> ValueId {
        if let Some(id) = self.defs.get(&v) {
            return *id;
        }
        let id = self.fresh(ValKind::Value(v));
        self.defs.insert(v, id);
        self.rev_defs.entry(v).or_default().push(id);
        id
    }

    pub fn try_def(&self, v: &ValueRef) -> Option<ValueId> {
        self.defs.get(v).copied()
    }

    /// All identifiers that represent `v`, including clones created by
    /// imports.
    pub fn get_ids(&self, v: &ValueRef) -> &[ValueId] {
        self.rev_defs.get(v).map(|v| v.as_slice()).unwrap_or(&[])
    }

    /// The identifier of a constant, plus whether it was created by this
    /// call (callers add flow constraints only on first creation).
    pub fn get_const(&mut self, c: &Constant) -> (bool, ValueId) {
        if let Some(id) = self.consts.get(c) {
            return (false, *id);
        }
        let id = self.fresh(ValKind::Const(c.clone()));
        self.consts.insert(c.clone(), id);
        (true, id)
    }

    pub fn try_const(&self, c: &Constant) -> Option<ValueId> {
        self.consts.get(c).copied()
    }

    /// A named singleton value; merged by identity across imports.
    pub fn get_named(&mut self, name: &str) -> ValueId {
        if let Some(id) = self.named.get(name) {
            return *id;
        }
        let id = self.fresh(ValKind::Named(name.to_string()));
        self.named.insert(name.to_string(), id);
        id
    }

    /// A fresh identifier naming an intermediate, e.g. the edge of a store.
    pub fn create_phony(&mut self) -> ValueId {
        self.fresh(ValKind::Phony)
    }

    /// A fresh object range of `size` consecutive identifiers for an
    /// allocation made by `v`.
    pub fn create_alloc(&mut self, v: ValueRef, size: u32) -> ValueId {
        self.create_alloc_inner(Some(v), size)
    }

    /// An object range not tied to any IR value (well-known objects).
    pub fn create_anon_alloc(&mut self, size: u32) -> ValueId {
        self.create_alloc_inner(None, size)
    }

    fn create_alloc_inner(&mut self, v: Option<ValueRef>, size: u32) -> ValueId {
        assert!(size >= 1);
        let alloc_idx = self.allocs.len() as u32;
        let start = ValueId(self.kinds.len() as u32);
        for field in 0..size {
            self.fresh(ValKind::Object { alloc: alloc_idx, field });
        }
        self.allocs.push(AllocInfo { start, size, val: v });
        if let Some(v) = v {
            if v.is_global() {
                self.alloc_by_val.insert(v, alloc_idx);
            }
        }
        start
    }

    /// The canonical representative of `id`.
    pub fn get_rep(&self, id: ValueId) -> ValueId {
        let mut cur = id;
        loop {
            let parent = self.reps[cur.index()];
            if parent == cur {
                return cur;
            }
            cur = parent;
        }
    }

    /// Merges `other` into `rep`. Both must be representatives.
    pub fn merge(&mut self, rep: ValueId, other: ValueId) {
        debug_assert_eq!(self.get_rep(rep), rep);
        debug_assert_eq!(self.get_rep(other), other);
        debug_assert_ne!(rep, other);
        self.reps[other.index()] = rep;
    }

    /// The function an object identifier stands for, if its allocation was
    /// made for a function address.
    pub fn fcn_obj(&self, id: ValueId) -> Option<FuncId> {
        match self.kinds.get(id.index())? {
            ValKind::Object { alloc, .. } => match self.allocs[*alloc as usize].val {
                Some(ValueRef::Function(f)) => Some(f),
                _ => None,
            },
            _ => None,
        }
    }

    /// Shifts an object identifier by `offs` field slots, provided the result
    /// stays inside the same allocation. Identifiers outside any allocation
    /// only survive a zero shift.
    pub fn offset_object(&self, o: ValueId, offs: u32) -> Option<ValueId> {
        if offs == 0 {
            return Some(o);
        }
        // Allocation ranges are created in ascending id order.
        let idx = self.allocs.partition_point(|a| a.start <= o);
        if idx == 0 {
            return None;
        }
        let alloc = &self.allocs[idx - 1];
        if o.0 < alloc.start.0 + alloc.size && o.0 + offs < alloc.start.0 + alloc.size {
            Some(ValueId(o.0 + offs))
        } else {
            None
        }
    }

    /// Injects the identifiers of `other` into this map, returning a
    /// translation table indexed by `other`'s identifiers. Globals, functions,
    /// constants and named singletons merge by identity; locals, phonies and
    /// local objects become fresh.
    pub fn import(&mut self, other: &ValueMap) -> Vec<ValueId> {
        let mut table = Vec::with_capacity(other.kinds.len());
        // Translation of other's allocation indices into ours.
        let mut alloc_table: HashMap<u32, u32> = HashMap::new();

        for (i, kind) in other.kinds.iter().enumerate() {
            let new_id = match kind {
                ValKind::Special(_) => ValueId(i as u32),
                ValKind::Named(name) => self.get_named(name),
                ValKind::Const(c) => self.get_const(c).1,
                ValKind::Value(vr) if vr.is_global() => self.get_def(*vr),
                ValKind::Value(vr) => {
                    let id = self.fresh(ValKind::Value(*vr));
                    self.rev_defs.entry(*vr).or_default().push(id);
                    id
                }
                ValKind::Phony => self.fresh(ValKind::Phony),
                ValKind::Object { alloc, field } => {
                    let other_alloc = &other.allocs[*alloc as usize];
                    let global_identity = other_alloc
                        .val
                        .map(|v| v.is_global())
                        .unwrap_or(false);
                    if global_identity {
                        let v = other_alloc.val.unwrap();
                        let self_alloc = match self.alloc_by_val.get(&v) {
                            Some(idx) => *idx,
                            None => {
                                self.create_alloc(v, other_alloc.size);
                                self.alloc_by_val[&v]
                            }
                        };
                        ValueId(self.allocs[self_alloc as usize].start.0 + field)
                    } else {
                        // A local allocation: its fields arrive in order, so
                        // the fresh ids stay consecutive.
                        let self_alloc = match alloc_table.get(alloc) {
                            Some(idx) => *idx,
                            None => {
                                let idx = self.allocs.len() as u32;
                                self.allocs.push(AllocInfo {
                                    start: ValueId(self.kinds.len() as u32),
                                    size: other_alloc.size,
                                    val: other_alloc.val,
                                });
                                alloc_table.insert(*alloc, idx);
                                idx
                            }
                        };
                        let id = self.fresh(ValKind::Object {
                            alloc: self_alloc,
                            field: *field,
                        });
                        debug_assert_eq!(
                            id.0,
                            self.allocs[self_alloc as usize].start.0 + field
                        );
                        id
                    }
                }
            };
            table.push(new_id);
        }
        table
    }

    /// Packs object identifiers into a contiguous range following all other
    /// identifiers, returning the remap table. Keeps relative order within
    /// each class.
    pub fn lower_allocs(&mut self) -> Vec<ValueId> {
        let n = self.kinds.len();
        let mut remap = vec![ValueId(0); n];
        let mut next = 0u32;
        for i in 0..n {
            if !matches!(self.kinds[i], ValKind::Object { .. }) {
                remap[i] = ValueId(next);
                next += 1;
            }
        }
        for alloc in &self.allocs {
            for field in 0..alloc.size {
                remap[(alloc.start.0 + field) as usize] = ValueId(next);
                next += 1;
            }
        }
        debug_assert_eq!(next as usize, n);

        let mut new_kinds = vec![ValKind::Phony; n];
        let mut new_reps = vec![ValueId(0); n];
        for i in 0..n {
            new_kinds[remap[i].index()] = self.kinds[i].clone();
            new_reps[remap[i].index()] = remap[self.get_rep(ValueId(i as u32)).index()];
        }
        self.kinds = new_kinds;
        self.reps = new_reps;

        for id in self.defs.values_mut() {
            *id = remap[id.index()];
        }
        for ids in self.rev_defs.values_mut() {
            for id in ids {
                *id = remap[id.index()];
            }
        }
        for id in self.consts.values_mut() {
            *id = remap[id.index()];
        }
        for id in self.named.values_mut() {
            *id = remap[id.index()];
        }
        for alloc in &mut self.allocs {
            alloc.start = remap[alloc.start.index()];
        }
        debug_assert!(self
            .allocs
            .windows(2)
            .all(|w| w[0].start.0 + w[0].size == w[1].start.0));

        remap
    }

    /// Iterates the known SSA definitions (for result dumping).
    pub fn iter_defs(&self) -> impl Iterator<Item = (&ValueRef, ValueId)> {
        self.defs.iter().map(|(v, id)| (v, *id))
    }

    /// A short human-readable description of an identifier.
    pub fn describe(&self, id: ValueId) -> String {
        match self.kinds.get(id.index()) {
            Some(ValKind::Special(name)) => format!("<{}>", name),
            Some(ValKind::Named(name)) => format!("named({})", name),
            Some(ValKind::Value(vr)) => format!("{:?}", vr),
            Some(ValKind::Const(_)) => "const".to_string(),
            Some(ValKind::Object { alloc, field }) => {
                let a = &self.allocs[*alloc as usize];
                match a.val {
                    Some(vr) => format!("obj({:?}+{})", vr, field),
                    None => format!("obj(anon#{}+{})", alloc, field),
                }
            }
            Some(ValKind::Phony) => "phony".to_string(),
            None => "invalid".to_string(),
        }
    }
}

impl Default for ValueMap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::{ValueId, ValueMap};
    use crate::ir::function::{FuncId, GlobalId, InstId, ValueRef};
    use crate::util::bit_vec::Idx;

    #[test]
    fn defs_and_reps() {
        let mut vals = ValueMap::new();
        let a = vals.get_def(ValueRef::Inst(FuncId(0), InstId(0)));
        let b = vals.get_def(ValueRef::Inst(FuncId(0), InstId(1)));
        assert_ne!(a, b);
        assert_eq!(vals.get_def(ValueRef::Inst(FuncId(0), InstId(0))), a);
        assert_eq!(vals.get_rep(a), a);
        vals.merge(a, b);
        assert_eq!(vals.get_rep(b), a);
        assert_eq!(vals.get_rep(a), a);
    }

    #[test]
    fn alloc_ranges_and_offsets() {
        let mut vals = ValueMap::new();
        let v = ValueRef::Inst(FuncId(0), InstId(0));
        let obj = vals.create_alloc(v, 3);
        assert_eq!(vals.offset_object(obj, 0), Some(obj));
        assert_eq!(vals.offset_object(obj, 2), Some(ValueId(obj.0 + 2)));
        assert_eq!(vals.offset_object(obj, 3), None);
        // Specials never shift.
        assert_eq!(vals.offset_object(ValueMap::UNIVERSAL_VALUE, 1), None);
    }

    #[test]
    fn import_merges_globals_and_freshens_locals() {
        let mut a = ValueMap::new();
        let g = ValueRef::Global(GlobalId(0));
        let local = ValueRef::Inst(FuncId(1), InstId(7));
        let g_id = a.get_def(g);
        let l_id = a.get_def(local);
        let obj = a.create_alloc(local, 2);

        let mut b = ValueMap::new();
        let g_in_b = b.get_def(g);
        let table = b.import(&a);

        // Global identity is preserved.
        assert_eq!(table[g_id.index()], g_in_b);
        // Locals and their objects become fresh but well-formed.
        let new_local = table[l_id.index()];
        assert_ne!(new_local, l_id);
        assert!(b.get_ids(&local).contains(&new_local));
        let new_obj = table[obj.index()];
        assert_eq!(b.offset_object(new_obj, 1), Some(ValueId(new_obj.0 + 1)));
        assert_eq!(b.offset_object(new_obj, 2), None);

        // Importing twice yields distinct locals each time.
        let table2 = b.import(&a);
        assert_ne!(table2[l_id.index()], new_local);
        assert_eq!(b.get_ids(&local).len(), 2);
    }

    #[test]
    fn lower_allocs_packs_objects() {
        let mut vals = ValueMap::new();
        let v1 = ValueRef::Inst(FuncId(0), InstId(0));
        let v2 = ValueRef::Inst(FuncId(0), InstId(1));
        let d1 = vals.get_def(v1);
        let o1 = vals.create_alloc(v1, 2);
        let d2 = vals.get_def(v2);
        let o2 = vals.create_alloc(v2, 1);

        let n = vals.len();
        let remap = vals.lower_allocs();
        assert_eq!(vals.len(), n);

        // External queries stay consistent through the remap.
        assert_eq!(vals.get_def(v1), remap[d1.index()]);
        assert_eq!(vals.get_def(v2), remap[d2.index()]);

        // Objects now form one contiguous range ending at the last id.
        let o1_new = remap[o1.index()];
        let o2_new = remap[o2.index()];
        assert_eq!(o2_new.0, o1_new.0 + 2);
        assert_eq!(o2_new.0 as usize, n - 1);
        assert_eq!(vals.offset_object(o1_new, 1), Some(ValueId(o1_new.0 + 1)));
        assert_eq!(vals.offset_object(o1_new, 2), None);
    }
}
