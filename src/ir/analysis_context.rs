// Copyright (c) 2024 <Wei Li>.
//
// This source code is licensed under the GNU license found in the
// LICENSE file in the root directory of this source tree.

//! Analysis-wide context threaded through constraint generation, call
//! resolution and the solver.

use crate::builder::ext_info::ExtLibInfo;
use crate::dynamic::DynamicInfo;
use crate::graph::cs_cfg::CsCFG;
use crate::ir::mod_info::ModInfo;
use crate::ir::module::Module;
use crate::pta::assumptions::AssumptionSet;
use crate::util::options::AnalysisOptions;

pub struct AnalysisContext<'m> {
    pub module: &'m Module,
    pub analysis_options: AnalysisOptions,
    pub mod_info: ModInfo,
    pub ext_info: ExtLibInfo,
    pub dyn_info: DynamicInfo,
    pub cs_cfg: CsCFG,
    pub assumptions: AssumptionSet,
}

impl<'m> AnalysisContext<'m> {
    pub fn new(module: &'m Module, options: AnalysisOptions) -> Self {
        let cs_cfg = CsCFG::new(module);
        let dyn_info = DynamicInfo::load(&options, module, &cs_cfg);
        AnalysisContext {
            module,
            analysis_options: options,
            mod_info: ModInfo::new(),
            ext_info: ExtLibInfo::new(),
            dyn_info,
            cs_cfg,
            assumptions: AssumptionSet::new(),
        }
    }

    /// Builds a context around preloaded oracles (used by embedders and
    /// tests that construct profiles directly).
    pub fn with_dyn_info(
        module: &'m Module,
        options: AnalysisOptions,
        dyn_info: DynamicInfo,
    ) -> Self {
        let cs_cfg = CsCFG::new(module);
        AnalysisContext {
            module,
            analysis_options: options,
            mod_info: ModInfo::new(),
            ext_info: ExtLibInfo::new(),
            dyn_info,
            cs_cfg,
            assumptions: AssumptionSet::new(),
        }
    }

    #[inline]
    pub fn no_spec(&self) -> bool {
        self.analysis_options.no_spec
    }
}
