// Copyright (c) 2024 <Wei Li>.
//
// This source code is licensed under the GNU license found in the
// LICENSE file in the root directory of this source tree.

//! Models for external (declaration-only) functions.
//!
//! Classification drives two behaviors: allocator calls synthesize fresh
//! objects at the call site, and every other known function injects a small
//! set of constraints describing its pointer flow. Unknown externals are
//! ignored with a warning.

use std::collections::HashMap;

use lazy_static::lazy_static;
use log::*;

use crate::graph::cg::{CallInfo, Cg};
use crate::ir::function::{CallSite, FuncId, InstKind, Operand, ValueRef};
use crate::ir::mod_info::ModInfo;
use crate::ir::module::Module;
use crate::ir::types::TypeId;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ExtFcnKind {
    /// Returns a fresh allocation (`malloc`, `calloc`, ...).
    Alloc,
    /// Returns a fresh allocation that may also alias its first argument
    /// (`realloc`).
    AllocCopyArg0,
    /// Returns (part of) its first argument (`strchr`, `strtok`, ...).
    RetArg0,
    /// Returns its first argument and copies the pointees of the second
    /// argument into the pointees of the first (`memcpy`, `strcpy`, ...).
    DeepCopy,
    /// Returns one of the process stdio streams (`fopen`, ...).
    RetStdio,
    /// Returns a pointer into the environment (`getenv`).
    RetEnv,
    /// No pointer flow worth modeling.
    Ignore,
}

lazy_static! {
    static ref EXT_FCN_TABLE: HashMap<&'static str, ExtFcnKind> = {
        use ExtFcnKind::*;
        let mut m = HashMap::new();
        for name in ["malloc", "calloc", "valloc", "strdup"] {
            m.insert(name, Alloc);
        }
        m.insert("realloc", AllocCopyArg0);
        for name in [
            "strchr", "strrchr", "strstr", "strtok", "strpbrk", "strcat", "strncat", "fgets",
            "gets", "memset",
        ] {
            m.insert(name, RetArg0);
        }
        for name in ["memcpy", "memmove", "strcpy", "strncpy"] {
            m.insert(name, DeepCopy);
        }
        for name in ["fopen", "fdopen", "freopen", "tmpfile"] {
            m.insert(name, RetStdio);
        }
        m.insert("getenv", RetEnv);
        for name in [
            "free", "exit", "abort", "printf", "fprintf", "sprintf", "snprintf", "puts", "fputs",
            "putchar", "scanf", "fscanf", "sscanf", "strlen", "strcmp", "strncmp", "strcasecmp",
            "memcmp", "atoi", "atol", "atof", "fclose", "fflush", "fread", "fwrite", "fseek",
            "ftell", "rewind", "open", "close", "read", "write", "lseek", "time", "clock", "rand",
            "srand", "qsort", "isatty", "getpid", "perror",
        ] {
            m.insert(name, Ignore);
        }
        m
    };
}

#[derive(Default)]
pub struct ExtLibInfo;

impl ExtLibInfo {
    pub fn new() -> Self {
        ExtLibInfo
    }

    pub fn kind(&self, name: &str) -> Option<ExtFcnKind> {
        if name.starts_with("llvm.") {
            return Some(ExtFcnKind::Ignore);
        }
        EXT_FCN_TABLE.get(name).copied()
    }

    pub fn is_unknown(&self, name: &str) -> bool {
        self.kind(name).is_none()
    }

    pub fn is_alloc(&self, name: &str) -> bool {
        matches!(
            self.kind(name),
            Some(ExtFcnKind::Alloc) | Some(ExtFcnKind::AllocCopyArg0)
        )
    }

    /// Infers the type allocated at `cs` from the first bitcast of the call
    /// result. `None` means no use gives a hint; callers fall back to a
    /// one-slot object.
    pub fn infer_alloc_ty(&self, m: &Module, cs: CallSite) -> Option<TypeId> {
        let fcn = m.fcn(cs.func);
        let result = Operand::Value(ValueRef::Inst(cs.func, cs.inst));
        for iid in fcn.inst_ids() {
            let inst = fcn.inst(iid);
            if let InstKind::BitCast { src } = &inst.kind {
                if *src == result {
                    return m.types.pointee(inst.ty);
                }
            }
        }
        None
    }

    /// Injects the constraint model for a call to `callee`. Returns true if
    /// any constraint was added.
    pub fn insert_call_cons(
        &self,
        m: &Module,
        mod_info: &mut ModInfo,
        cg: &mut Cg,
        cs: CallSite,
        callee: FuncId,
        ci: &CallInfo,
    ) -> bool {
        let name = m.fcn(callee).name.clone();
        let kind = match self.kind(&name) {
            Some(kind) => kind,
            // Unknown external functions default to an ignored call.
            None => return false,
        };
        match kind {
            ExtFcnKind::Alloc | ExtFcnKind::AllocCopyArg0 => {
                let size = match self.infer_alloc_ty(m, cs) {
                    Some(ty) => mod_info.size_of(m, ty),
                    None => 1,
                };
                let result = ValueRef::Inst(cs.func, cs.inst);
                let obj = cg.vals_mut().create_alloc(result, size);
                cg.add_addr(obj, ci.ret());
                if kind == ExtFcnKind::AllocCopyArg0 {
                    if let Some(&arg0) = ci.args().first() {
                        cg.add_copy(arg0, ci.ret());
                    }
                }
                true
            }
            ExtFcnKind::RetArg0 => {
                if let Some(&arg0) = ci.args().first() {
                    cg.add_copy(arg0, ci.ret());
                    true
                } else {
                    false
                }
            }
            ExtFcnKind::DeepCopy => {
                let mut added = false;
                if let Some(&arg0) = ci.args().first() {
                    cg.add_copy(arg0, ci.ret());
                    added = true;
                }
                if let (Some(&arg0), Some(&arg1)) = (ci.args().first(), ci.args().get(1)) {
                    // *arg0 |= *arg1, through a phony intermediate.
                    let tmp = cg.vals_mut().create_phony();
                    cg.add_load(arg1, tmp);
                    cg.add_store(tmp, arg0);
                    added = true;
                }
                added
            }
            ExtFcnKind::RetStdio => {
                let stdio = cg.vals_mut().get_named("stdio");
                cg.add_copy(stdio, ci.ret());
                true
            }
            ExtFcnKind::RetEnv => {
                let envp = cg.vals_mut().get_named("envp");
                let tmp = cg.vals_mut().create_phony();
                cg.add_load(envp, tmp);
                cg.add_copy(tmp, ci.ret());
                true
            }
            ExtFcnKind::Ignore => {
                debug!("ignoring call to external function {}", name);
                false
            }
        }
    }

    /// Creates the well-known objects every program can reach: the stdio
    /// streams, and the `argv`/`envp` arrays with their nested strings.
    pub fn add_global_constraints(&self, cg: &mut Cg) {
        let stdio = cg.vals_mut().get_named("stdio");
        let stdio_obj = cg.vals_mut().create_anon_alloc(1);
        cg.add_addr(stdio_obj, stdio);

        for name in ["argv", "envp"] {
            let val = cg.vals_mut().get_named(name);
            let obj = cg.vals_mut().create_anon_alloc(1);
            cg.add_addr(obj, val);
            // The array contains pointers to its strings.
            let strings = cg.vals_mut().create_anon_alloc(1);
            let tmp = cg.vals_mut().create_phony();
            cg.add_addr(strings, tmp);
            cg.add_store(tmp, val);
        }
    }
}
