// Copyright (c) 2024 <Wei Li>.
//
// This source code is licensed under the GNU license found in the
// LICENSE file in the root directory of this source tree.

//! Post-solve dumping of points-to results.

use itertools::Itertools;
use log::*;
use serde_json::{json, Map, Value};

use crate::graph::anders_graph::AndersGraph;
use crate::graph::value_map::ValueId;
use crate::ir::analysis_context::AnalysisContext;
use crate::ir::function::ValueRef;

pub fn dump_results(acx: &AnalysisContext, graph: &AndersGraph) {
    let opts = &acx.analysis_options;

    if let Some(path) = &opts.pts_output {
        let output = render_pts_json(graph);
        match std::fs::write(path, output.to_string()) {
            Ok(_) => info!("points-to results dumped to {}", path),
            Err(e) => error!("failed to write points-to output {}: {}", path, e),
        }
    }

    for &raw in &opts.debug_ids {
        let id = ValueId(raw);
        let rep = graph.rep(id);
        info!(
            "node {:?} (rep {:?}, {}): {:?}",
            id,
            rep,
            graph.cg().vals().describe(id),
            graph.node(id).ptsto()
        );
    }

    for name in &opts.debug_fcn_names {
        let Some(f) = acx.module.fcn_by_name(name) else {
            warn!("debug function {} not found", name);
            continue;
        };
        info!("points-to sets of {}:", name);
        let fcn = acx.module.fcn(f);
        for i in 0..fcn.params.len() as u32 {
            dump_value(graph, ValueRef::Arg(f, i));
        }
        for iid in fcn.inst_ids() {
            if acx.module.types.is_ptr(fcn.inst(iid).ty) {
                dump_value(graph, ValueRef::Inst(f, iid));
            }
        }
    }

    if let Some(name) = &opts.debug_global_name {
        let found = acx
            .module
            .global_ids()
            .find(|g| &acx.module.global(*g).name == name);
        match found {
            Some(g) => dump_value(graph, ValueRef::Global(g)),
            None => warn!("debug global {} not found", name),
        }
    }
}

fn dump_value(graph: &AndersGraph, v: ValueRef) {
    for &id in graph.cg().vals().get_ids(&v) {
        let rep = graph.rep(id);
        info!("  {:?}[{:?}]: {:?}", v, rep, graph.node(id).ptsto());
    }
}

fn render_pts_json(graph: &AndersGraph) -> Value {
    let vals = graph.cg().vals();
    let mut entries = Map::new();
    let defs = vals
        .iter_defs()
        .sorted_by_key(|(_, id)| *id)
        .collect::<Vec<_>>();
    for (v, id) in defs {
        let pts = graph.node(id).ptsto();
        if pts.is_empty() {
            continue;
        }
        let objs: Vec<Value> = pts
            .iter()
            .map(|o| json!({ "id": o.0, "desc": vals.describe(o) }))
            .collect();
        entries.insert(format!("{:?}#{}", v, id.0), Value::Array(objs));
    }
    Value::Object(entries)
}
