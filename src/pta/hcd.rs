// Copyright (c) 2024 <Wei Li>.
//
// This source code is licensed under the GNU license found in the
// LICENSE file in the root directory of this source tree.

//! Offline hybrid cycle detection.
//!
//! Builds the offline constraint graph with a reference node `*x` for every
//! pointer that is loaded from or stored through: `Copy a -> b` contributes
//! `a -> b`, `Load a -> b` contributes `*a -> b`, `Store a -> b` contributes
//! `a -> *b`. Any SCC mixing a reference node with ordinary nodes proves that
//! everything `x` points to collapses with the ordinary members, recorded as
//! the pair `x -> representative` and applied online by the solver.

use std::collections::HashMap;

use log::*;

use crate::graph::cg::{Cg, ConstraintKind};
use crate::graph::value_map::ValueId;
use crate::util::bit_vec::Idx;

pub fn compute_hcd_pairs(cg: &Cg) -> HashMap<ValueId, ValueId> {
    let n = cg.vals().len();
    // Offline node space: [0, n) are value ids, [n, 2n) their ref nodes.
    let mut succs: Vec<Vec<u32>> = vec![Vec::new(); 2 * n];

    for cons in cg.constraints() {
        let src = cg.vals().get_rep(cons.src()).index() as u32;
        let dest = cg.vals().get_rep(cons.dest()).index() as u32;
        match cons.kind() {
            ConstraintKind::Copy if cons.offs() == 0 => succs[src as usize].push(dest),
            ConstraintKind::Load => succs[(src as usize) + n].push(dest),
            ConstraintKind::Store => succs[src as usize].push(dest + n as u32),
            _ => {}
        }
    }

    let sccs = tarjan_sccs(&succs);

    let mut pairs = HashMap::new();
    for scc in sccs {
        if scc.len() < 2 {
            continue;
        }
        let mut normals: Vec<u32> = scc.iter().copied().filter(|v| (*v as usize) < n).collect();
        let refs: Vec<u32> = scc.iter().copied().filter(|v| (*v as usize) >= n).collect();
        if normals.is_empty() || refs.is_empty() {
            continue;
        }
        normals.sort_unstable();
        let rep = ValueId(normals[0]);
        for r in refs {
            pairs.insert(ValueId(r - n as u32), rep);
        }
    }
    if !pairs.is_empty() {
        debug!("hybrid cycle detection found {} pairs", pairs.len());
    }
    pairs
}

/// Iterative Tarjan over the offline graph.
fn tarjan_sccs(succs: &[Vec<u32>]) -> Vec<Vec<u32>> {
    const UNVISITED: u32 = u32::MAX;

    let n = succs.len();
    let mut index = vec![UNVISITED; n];
    let mut lowlink = vec![0u32; n];
    let mut on_stack = vec![false; n];
    let mut stack: Vec<u32> = Vec::new();
    let mut next_index = 0u32;
    let mut sccs = Vec::new();

    // (node, next successor position)
    let mut work: Vec<(u32, usize)> = Vec::new();

    for start in 0..n as u32 {
        if index[start as usize] != UNVISITED {
            continue;
        }
        work.push((start, 0));
        while let Some(&mut (v, ref mut pos)) = work.last_mut() {
            let vi = v as usize;
            if *pos == 0 {
                index[vi] = next_index;
                lowlink[vi] = next_index;
                next_index += 1;
                stack.push(v);
                on_stack[vi] = true;
            }
            if let Some(&w) = succs[vi].get(*pos) {
                *pos += 1;
                let wi = w as usize;
                if index[wi] == UNVISITED {
                    work.push((w, 0));
                } else if on_stack[wi] {
                    lowlink[vi] = lowlink[vi].min(index[wi]);
                }
            } else {
                work.pop();
                if let Some(&(parent, _)) = work.last() {
                    let pi = parent as usize;
                    lowlink[pi] = lowlink[pi].min(lowlink[vi]);
                }
                if lowlink[vi] == index[vi] {
                    let mut comp = Vec::new();
                    loop {
                        let w = stack.pop().unwrap();
                        on_stack[w as usize] = false;
                        comp.push(w);
                        if w == v {
                            break;
                        }
                    }
                    sccs.push(comp);
                }
            }
        }
    }
    sccs
}

#[cfg(test)]
mod test {
    use super::tarjan_sccs;

    #[test]
    fn finds_cycles() {
        // 0 -> 1 -> 2 -> 0, 3 -> 1.
        let succs = vec![vec![1], vec![2], vec![0], vec![1]];
        let sccs = tarjan_sccs(&succs);
        let cycle = sccs.iter().find(|s| s.len() == 3).expect("one 3-cycle");
        let mut cycle = cycle.clone();
        cycle.sort_unstable();
        assert_eq!(cycle, vec![0, 1, 2]);
        assert_eq!(sccs.iter().filter(|s| s.len() == 1).count(), 1);
    }
}
