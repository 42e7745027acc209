//! Builds a small graph, optimizes it, re-infers shapes, and plans memory.
//!
//! Run with `MINFER_OPT_STATS=1` to see the per-pass rewrite summary.

use std::sync::Arc;

use anyhow::Result;
use minfer::{CpuRuntime, DataType, Graph, Shape, UnaryKind};

fn main() -> Result<()> {
    let runtime = Arc::new(CpuRuntime::new());
    let mut graph = Graph::new(runtime);

    let x = graph.add_tensor(Shape::new(vec![2, 3, 4]), DataType::F32);
    let y = graph.add_tensor(Shape::new(vec![2, 4, 3]), DataType::F32);
    let z = graph.add_tensor(Shape::new(vec![2, 3, 4]), DataType::F32);
    let out = graph.add_tensor(Shape::new(vec![2, 3, 4]), DataType::F32);
    graph.add_transpose(x, y, vec![0, 2, 1])?;
    graph.add_transpose(y, z, vec![0, 2, 1])?;
    graph.add_unary(UnaryKind::Relu, z, out)?;

    let stats = graph.optimize()?;
    println!(
        "optimize removed {} op(s) and {} tensor(s)",
        stats.erased_ops, stats.erased_tensors
    );

    graph.topo_sort()?;
    graph.shape_infer()?;
    graph.check_valid()?;
    graph.data_malloc()?;

    print!("{graph}");
    Ok(())
}
