//! Pattern-driven peephole rewrites over a graph.
//!
//! Two rewrites run in sequence, each as a single pass over the operator
//! list: elimination of inverse transpose pairs, and fusion of a
//! matrix-axes transpose into a downstream MatMul's `trans_a`/`trans_b`
//! flags. Both only redirect consumers; a final worklist sweep removes
//! whatever lost its last consumer. Successor lists are snapshotted before
//! each splice so structural mutation never invalidates the walk.

use std::collections::HashSet;

use crate::env;
use crate::error::Result;
use crate::graph::Graph;
use crate::op::{OpId, OpKind};
use crate::tensor::TensorId;

/// Aggregate effect of one `optimize` run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct OptimizeStats {
    pub transpose_pairs_removed: usize,
    pub matmul_fusions: usize,
    pub erased_ops: usize,
    pub erased_tensors: usize,
}

pub(crate) fn run(graph: &mut Graph) -> Result<OptimizeStats> {
    graph.topo_sort()?;

    let mut stats = OptimizeStats::default();
    let mut dead: Vec<TensorId> = Vec::new();
    eliminate_inverse_transposes(graph, &mut dead, &mut stats)?;
    fuse_transpose_into_matmul(graph, &mut dead, &mut stats)?;
    sweep_dead_nodes(graph, dead, &mut stats)?;

    // Rewrites reorder nothing, but attribute changes can shift shapes, so
    // downstream passes must re-sort and re-infer.
    graph.invalidate_sort();

    if env::opt_stats_enabled() {
        println!(
            "[optimizer] transpose_pairs={} matmul_fusions={} erased_ops={} erased_tensors={} ops_len={}",
            stats.transpose_pairs_removed,
            stats.matmul_fusions,
            stats.erased_ops,
            stats.erased_tensors,
            graph.ops().len()
        );
    }
    Ok(stats)
}

/// Splices `Transpose -> Transpose` pairs whose permutations cancel.
///
/// Consumers of the second transpose's output are redirected onto the first
/// transpose's input; the orphaned intermediates are handed to the sweep.
fn eliminate_inverse_transposes(
    graph: &mut Graph,
    dead: &mut Vec<TensorId>,
    stats: &mut OptimizeStats,
) -> Result<()> {
    let op_ids: Vec<OpId> = graph.ops().iter().map(|op| op.guid()).collect();
    for curr_id in op_ids {
        let (curr_spec, successors) = {
            let Some(curr) = graph.op(curr_id) else { continue };
            let OpKind::Transpose(spec) = curr.kind() else {
                continue;
            };
            (spec.clone(), curr.successors().to_vec())
        };
        for succ_id in successors {
            let matched = {
                let Some(succ) = graph.op(succ_id) else { continue };
                match succ.kind() {
                    OpKind::Transpose(succ_spec) => curr_spec.is_inverse_of(succ_spec),
                    _ => false,
                }
            };
            if !matched {
                continue;
            }
            // A previous splice may have already detached this successor.
            if !graph.op_entry(curr_id)?.successors().contains(&succ_id) {
                continue;
            }
            let curr_input = graph.op_entry(curr_id)?.inputs()[0];
            let succ_output = graph.op_entry(succ_id)?.outputs()[0];
            redirect_consumers(graph, succ_output, curr_input)?;
            dead.push(succ_output);
            stats.transpose_pairs_removed += 1;
        }
    }
    Ok(())
}

/// Folds a last-two-axes transpose into each MatMul consuming its output by
/// flipping the matching `trans_a`/`trans_b` flag.
fn fuse_transpose_into_matmul(
    graph: &mut Graph,
    dead: &mut Vec<TensorId>,
    stats: &mut OptimizeStats,
) -> Result<()> {
    let op_ids: Vec<OpId> = graph.ops().iter().map(|op| op.guid()).collect();
    for trans_id in op_ids {
        let (trans_input, trans_output, successors) = {
            let Some(op) = graph.op(trans_id) else { continue };
            let OpKind::Transpose(spec) = op.kind() else {
                continue;
            };
            if spec.matrix_axes_swap() != Some(true) {
                continue;
            }
            (op.inputs()[0], op.outputs()[0], op.successors().to_vec())
        };
        let mut fused = false;
        for matmul_id in successors {
            let slots = {
                let Some(op) = graph.op(matmul_id) else { continue };
                let OpKind::MatMul(_) = op.kind() else {
                    continue;
                };
                op.inputs()
                    .iter()
                    .enumerate()
                    .filter(|(_, &input)| input == trans_output)
                    .map(|(slot, _)| slot)
                    .collect::<Vec<_>>()
            };
            if slots.is_empty() {
                continue;
            }
            for slot in slots {
                let matmul = graph.op_entry_mut(matmul_id)?;
                if let OpKind::MatMul(spec) = matmul.kind_mut() {
                    match slot {
                        0 => spec.trans_a = !spec.trans_a,
                        _ => spec.trans_b = !spec.trans_b,
                    }
                }
                matmul.replace_input_at(slot, trans_input);
                matmul.remove_predecessor(trans_id);
                graph.op_entry_mut(trans_id)?.remove_successor(matmul_id);
                graph.tensor_entry_mut(trans_output)?.remove_target(matmul_id);
                graph.tensor_entry_mut(trans_input)?.add_target(matmul_id);
                if let Some(producer) = graph.tensor_entry(trans_input)?.source() {
                    graph.op_entry_mut(matmul_id)?.add_predecessor(producer);
                    graph.op_entry_mut(producer)?.add_successor(matmul_id);
                }
                stats.matmul_fusions += 1;
                fused = true;
            }
        }
        if fused && graph.tensor_entry(trans_output)?.targets().is_empty() {
            dead.push(trans_output);
        }
    }
    Ok(())
}

/// Points every consumer of `from` at `to`, keeping target lists and
/// predecessor/successor multisets pairwise consistent.
fn redirect_consumers(graph: &mut Graph, from: TensorId, to: TensorId) -> Result<()> {
    // One entry per consuming input slot, so each pass moves one edge.
    let consumers = graph.tensor_entry(from)?.targets().to_vec();
    let from_source = graph.tensor_entry(from)?.source();
    let to_source = graph.tensor_entry(to)?.source();
    for consumer in consumers {
        graph.op_entry_mut(consumer)?.replace_one_input(from, to);
        if let Some(source) = from_source {
            graph.op_entry_mut(consumer)?.remove_predecessor(source);
            graph.op_entry_mut(source)?.remove_successor(consumer);
        }
        if let Some(source) = to_source {
            graph.op_entry_mut(consumer)?.add_predecessor(source);
            graph.op_entry_mut(source)?.add_successor(consumer);
        }
        graph.tensor_entry_mut(from)?.remove_target(consumer);
        graph.tensor_entry_mut(to)?.add_target(consumer);
    }
    Ok(())
}

/// Tears down producers of consumer-less tensors until the worklist dries
/// up, then removes everything marked in one shot.
fn sweep_dead_nodes(
    graph: &mut Graph,
    mut worklist: Vec<TensorId>,
    stats: &mut OptimizeStats,
) -> Result<()> {
    let mut removed_ops: HashSet<OpId> = HashSet::new();
    let mut removed_tensors: HashSet<TensorId> = HashSet::new();

    while let Some(tensor_id) = worklist.pop() {
        if removed_tensors.contains(&tensor_id) {
            continue;
        }
        let Some(tensor) = graph.tensor(tensor_id) else {
            continue;
        };
        if !tensor.targets().is_empty() {
            continue;
        }
        let Some(producer) = tensor.source() else {
            // Neither source nor targets: the node must not survive.
            removed_tensors.insert(tensor_id);
            continue;
        };
        removed_tensors.insert(tensor_id);
        if removed_ops.contains(&producer) {
            continue;
        }
        removed_ops.insert(producer);

        let predecessors = graph.op_entry(producer)?.predecessors().to_vec();
        for pred in predecessors {
            graph.op_entry_mut(pred)?.remove_successor(producer);
            graph.op_entry_mut(producer)?.remove_predecessor(pred);
        }
        let inputs = graph.op_entry(producer)?.inputs().to_vec();
        for input in inputs {
            let tensor = graph.tensor_entry_mut(input)?;
            tensor.remove_target(producer);
            if tensor.targets().is_empty() {
                worklist.push(input);
            }
        }
    }

    stats.erased_ops += removed_ops.len();
    stats.erased_tensors += removed_tensors.len();
    graph.remove_entries(&removed_ops, &removed_tensors);
    Ok(())
}
