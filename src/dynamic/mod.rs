//! Read-only dynamic-profile oracles.
//!
//! Profiles are optional JSON files; a missing or unreadable file means
//! "no data", which every oracle treats as fully permissive. Call sites are
//! written as `"<function>#<instruction index>"`, call stacks as sequences of
//! such labels rooted at the entry function.

use std::collections::{HashMap, HashSet};
use std::fs;

use anyhow::{anyhow, Context, Result};
use log::*;
use serde::Deserialize;

use crate::graph::cs_cfg::{CsCFG, CsId};
use crate::ir::function::{BlockId, CallSite, FuncId, InstId};
use crate::ir::module::Module;
use crate::util::options::AnalysisOptions;

#[derive(Deserialize)]
struct UsedProfile {
    functions: Vec<String>,
    #[serde(default)]
    blocks: HashMap<String, Vec<u32>>,
}

#[derive(Deserialize)]
struct IndirProfile {
    callsites: HashMap<String, Vec<String>>,
}

#[derive(Deserialize)]
struct ContextProfile {
    stacks: Vec<Vec<String>>,
}

/// Which functions and basic blocks were observed executing.
#[derive(Clone, Debug, Default)]
pub struct UsedInfo {
    data: Option<UsedData>,
}

#[derive(Clone, Debug)]
struct UsedData {
    fcns: HashSet<FuncId>,
    /// Used blocks, per function. A used function missing from this map has
    /// all of its blocks considered used.
    blocks: HashMap<FuncId, HashSet<u32>>,
}

impl UsedInfo {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn from_sets(fcns: HashSet<FuncId>, blocks: HashMap<FuncId, HashSet<u32>>) -> Self {
        UsedInfo {
            data: Some(UsedData { fcns, blocks }),
        }
    }

    pub fn has_data(&self) -> bool {
        self.data.is_some()
    }

    pub fn is_used_fcn(&self, f: FuncId) -> bool {
        match &self.data {
            Some(d) => d.fcns.contains(&f),
            None => true,
        }
    }

    pub fn is_used_block(&self, f: FuncId, b: BlockId) -> bool {
        match &self.data {
            Some(d) => {
                if !d.fcns.contains(&f) {
                    return false;
                }
                match d.blocks.get(&f) {
                    Some(used) => used.contains(&b.0),
                    None => true,
                }
            }
            None => true,
        }
    }
}

/// Observed targets of indirect call sites.
#[derive(Clone, Debug, Default)]
pub struct IndirInfo {
    data: Option<HashMap<CallSite, Vec<FuncId>>>,
}

impl IndirInfo {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn from_map(data: HashMap<CallSite, Vec<FuncId>>) -> Self {
        IndirInfo { data: Some(data) }
    }

    pub fn has_info(&self) -> bool {
        self.data.is_some()
    }

    pub fn targets(&self, cs: CallSite) -> Vec<FuncId> {
        self.data
            .as_ref()
            .and_then(|m| m.get(&cs).cloned())
            .unwrap_or_default()
    }
}

/// Observed calling-context stacks, as CsCFG id sequences rooted at the main
/// context. A candidate stack is valid iff it is a prefix of some observed
/// stack.
#[derive(Clone, Debug, Default)]
pub struct CallContextInfo {
    data: Option<Vec<Vec<CsId>>>,
}

impl CallContextInfo {
    pub fn none() -> Self {
        Self::default()
    }

    /// Stacks must start with `CsCFG::MAIN_CONTEXT`.
    pub fn from_stacks(stacks: Vec<Vec<CsId>>) -> Self {
        debug_assert!(stacks
            .iter()
            .all(|s| s.first() == Some(&CsCFG::MAIN_CONTEXT)));
        CallContextInfo { data: Some(stacks) }
    }

    pub fn has_dyn_data(&self) -> bool {
        self.data.is_some()
    }

    pub fn is_valid(&self, stack: &[CsId]) -> bool {
        match &self.data {
            Some(observed) => observed.iter().any(|o| o.starts_with(stack)),
            None => true,
        }
    }

    pub fn main_context(&self) -> CsId {
        CsCFG::MAIN_CONTEXT
    }
}

/// Bundle of the three oracles, loaded from the configured profile paths.
#[derive(Clone, Debug, Default)]
pub struct DynamicInfo {
    pub used_info: UsedInfo,
    pub indir_info: IndirInfo,
    pub call_info: CallContextInfo,
}

impl DynamicInfo {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn new(used_info: UsedInfo, indir_info: IndirInfo, call_info: CallContextInfo) -> Self {
        DynamicInfo {
            used_info,
            indir_info,
            call_info,
        }
    }

    pub fn load(opts: &AnalysisOptions, m: &Module, cs_cfg: &CsCFG) -> Self {
        let used_info = match &opts.used_info_path {
            Some(path) => match load_used(path, m) {
                Ok(info) => info,
                Err(e) => {
                    warn!("failed to load used-function profile {}: {:#}", path, e);
                    UsedInfo::none()
                }
            },
            None => UsedInfo::none(),
        };
        let indir_info = match &opts.indir_info_path {
            Some(path) => match load_indir(path, m) {
                Ok(info) => info,
                Err(e) => {
                    warn!("failed to load indirect-target profile {}: {:#}", path, e);
                    IndirInfo::none()
                }
            },
            None => IndirInfo::none(),
        };
        let call_info = match &opts.call_contexts_path {
            Some(path) => match load_contexts(path, m, cs_cfg) {
                Ok(info) => info,
                Err(e) => {
                    warn!("failed to load call-context profile {}: {:#}", path, e);
                    CallContextInfo::none()
                }
            },
            None => CallContextInfo::none(),
        };
        DynamicInfo {
            used_info,
            indir_info,
            call_info,
        }
    }
}

fn parse_callsite(label: &str, m: &Module) -> Result<CallSite> {
    let (name, idx) = label
        .split_once('#')
        .ok_or_else(|| anyhow!("malformed call-site label: {}", label))?;
    let func = m
        .fcn_by_name(name)
        .ok_or_else(|| anyhow!("unknown function in profile: {}", name))?;
    let inst = InstId(idx.parse::<u32>().context("bad instruction index")?);
    Ok(CallSite::new(func, inst))
}

fn load_used(path: &str, m: &Module) -> Result<UsedInfo> {
    let text = fs::read_to_string(path)?;
    let profile: UsedProfile = serde_json::from_str(&text)?;
    let mut fcns = HashSet::new();
    for name in &profile.functions {
        match m.fcn_by_name(name) {
            Some(f) => {
                fcns.insert(f);
            }
            None => warn!("unknown function in used profile: {}", name),
        }
    }
    let mut blocks = HashMap::new();
    for (name, used) in &profile.blocks {
        if let Some(f) = m.fcn_by_name(name) {
            blocks.insert(f, used.iter().copied().collect());
        }
    }
    Ok(UsedInfo::from_sets(fcns, blocks))
}

fn load_indir(path: &str, m: &Module) -> Result<IndirInfo> {
    let text = fs::read_to_string(path)?;
    let profile: IndirProfile = serde_json::from_str(&text)?;
    let mut map = HashMap::new();
    for (label, targets) in &profile.callsites {
        let cs = parse_callsite(label, m)?;
        let mut fcns = Vec::new();
        for t in targets {
            match m.fcn_by_name(t) {
                Some(f) => fcns.push(f),
                None => warn!("unknown target in indirect profile: {}", t),
            }
        }
        map.insert(cs, fcns);
    }
    Ok(IndirInfo::from_map(map))
}

fn load_contexts(path: &str, m: &Module, cs_cfg: &CsCFG) -> Result<CallContextInfo> {
    let text = fs::read_to_string(path)?;
    let profile: ContextProfile = serde_json::from_str(&text)?;
    let mut stacks = Vec::with_capacity(profile.stacks.len());
    for stack in &profile.stacks {
        let mut ids = Vec::with_capacity(stack.len() + 1);
        ids.push(CsCFG::MAIN_CONTEXT);
        for label in stack {
            ids.push(cs_cfg.get_id(parse_callsite(label, m)?));
        }
        stacks.push(ids);
    }
    Ok(CallContextInfo::from_stacks(stacks))
}
