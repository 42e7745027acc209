use std::sync::Arc;

use minfer::{CpuRuntime, DataType, Graph, OpKind, Shape, TensorId, UnaryKind};

fn new_graph() -> Graph {
    Graph::new(Arc::new(CpuRuntime::new()))
}

fn placeholder(graph: &mut Graph) -> TensorId {
    graph.add_tensor(Shape::scalar(), DataType::F32)
}

#[test]
fn inverse_transpose_pair_is_spliced_out() {
    let mut graph = new_graph();
    let x = graph.add_tensor(Shape::new(vec![2, 3, 4]), DataType::F32);
    let y = placeholder(&mut graph);
    let z = placeholder(&mut graph);
    let out = placeholder(&mut graph);
    graph.add_transpose(x, y, vec![0, 2, 1]).expect("first transpose");
    graph.add_transpose(y, z, vec![0, 2, 1]).expect("second transpose");
    let relu = graph.add_unary(UnaryKind::Relu, z, out).expect("relu");

    let stats = graph.optimize().expect("optimize");
    assert_eq!(stats.transpose_pairs_removed, 1);
    assert_eq!(stats.erased_ops, 2);
    assert_eq!(stats.erased_tensors, 2);

    assert_eq!(graph.ops().len(), 1, "only the relu survives");
    assert_eq!(graph.tensors().len(), 2, "only x and out survive");
    assert!(graph.tensor(y).is_none());
    assert!(graph.tensor(z).is_none());

    let relu_op = graph.op(relu).expect("relu survives");
    assert_eq!(relu_op.inputs(), &[x], "relu consumes x directly");
    assert!(relu_op.predecessors().is_empty());
    assert_eq!(graph.tensor(x).expect("x").targets(), &[relu]);

    graph.check_valid().expect("valid after optimize");
    graph.topo_sort().expect("sorts");
    graph.shape_infer().expect("infers");
    assert_eq!(graph.tensor(out).expect("out").dims(), &[2, 3, 4]);
}

#[test]
fn non_inverse_transposes_are_left_alone() {
    let mut graph = new_graph();
    let x = graph.add_tensor(Shape::new(vec![2, 3, 4]), DataType::F32);
    let y = placeholder(&mut graph);
    let z = placeholder(&mut graph);
    let out = placeholder(&mut graph);
    graph.add_transpose(x, y, vec![0, 2, 1]).expect("first transpose");
    graph.add_transpose(y, z, vec![1, 0, 2]).expect("second transpose");
    graph.add_unary(UnaryKind::Relu, z, out).expect("relu");

    let stats = graph.optimize().expect("optimize");
    assert_eq!(stats.transpose_pairs_removed, 0);
    assert_eq!(stats.matmul_fusions, 0);
    assert_eq!(stats.erased_ops, 0);
    assert_eq!(stats.erased_tensors, 0);
    assert_eq!(graph.ops().len(), 3);
    assert_eq!(graph.tensors().len(), 4);
    graph.check_valid().expect("still valid");
}

#[test]
fn transpose_folds_into_matmul_lhs() {
    let mut graph = new_graph();
    let a = graph.add_tensor(Shape::new(vec![4, 8]), DataType::F32);
    let a_t = placeholder(&mut graph);
    let b = graph.add_tensor(Shape::new(vec![8, 5]), DataType::F32);
    let c = placeholder(&mut graph);
    graph.add_transpose(a, a_t, vec![1, 0]).expect("transpose");
    let matmul = graph.add_matmul(a_t, b, c, false, false).expect("matmul");

    let stats = graph.optimize().expect("optimize");
    assert_eq!(stats.matmul_fusions, 1);
    assert_eq!(stats.erased_ops, 1, "transpose removed");
    assert_eq!(stats.erased_tensors, 1, "its output removed");

    let matmul_op = graph.op(matmul).expect("matmul survives");
    assert_eq!(matmul_op.inputs(), &[a, b]);
    match matmul_op.kind() {
        OpKind::MatMul(spec) => {
            assert!(spec.trans_a, "transpose folded into trans_a");
            assert!(!spec.trans_b);
        }
        other => panic!("expected MatMul, got {other:?}"),
    }

    graph.check_valid().expect("valid after fusion");
    graph.topo_sort().expect("sorts");
    graph.shape_infer().expect("infers");
    assert_eq!(graph.tensor(c).expect("c").dims(), &[8, 5]);
    match graph.op(matmul).expect("matmul").kind() {
        OpKind::MatMul(spec) => assert_eq!((spec.m, spec.k, spec.n), (8, 4, 5)),
        other => panic!("expected MatMul, got {other:?}"),
    }
}

#[test]
fn transpose_folds_into_matmul_rhs() {
    let mut graph = new_graph();
    let a = graph.add_tensor(Shape::new(vec![2, 8]), DataType::F32);
    let b = graph.add_tensor(Shape::new(vec![5, 8]), DataType::F32);
    let b_t = placeholder(&mut graph);
    let c = placeholder(&mut graph);
    graph.add_transpose(b, b_t, vec![1, 0]).expect("transpose");
    let matmul = graph.add_matmul(a, b_t, c, false, false).expect("matmul");

    let stats = graph.optimize().expect("optimize");
    assert_eq!(stats.matmul_fusions, 1);

    let matmul_op = graph.op(matmul).expect("matmul survives");
    assert_eq!(matmul_op.inputs(), &[a, b]);
    match matmul_op.kind() {
        OpKind::MatMul(spec) => {
            assert!(!spec.trans_a);
            assert!(spec.trans_b, "transpose folded into trans_b");
        }
        other => panic!("expected MatMul, got {other:?}"),
    }

    graph.check_valid().expect("valid after fusion");
    graph.topo_sort().expect("sorts");
    graph.shape_infer().expect("infers");
    assert_eq!(graph.tensor(c).expect("c").dims(), &[2, 5]);
}

#[test]
fn batch_axis_transpose_does_not_fuse() {
    let mut graph = new_graph();
    let a = graph.add_tensor(Shape::new(vec![2, 4, 8]), DataType::F32);
    let a_t = placeholder(&mut graph);
    let b = graph.add_tensor(Shape::new(vec![2, 5]), DataType::F32);
    let c = placeholder(&mut graph);
    // [2,1,0] moves a batch axis; it is not a matrix transpose.
    graph.add_transpose(a, a_t, vec![2, 1, 0]).expect("transpose");
    graph.add_matmul(a_t, b, c, false, false).expect("matmul");

    let stats = graph.optimize().expect("optimize");
    assert_eq!(stats.matmul_fusions, 0);
    assert_eq!(stats.erased_ops, 0);
    assert_eq!(graph.ops().len(), 2, "both operators survive");
    graph.check_valid().expect("still valid");
}

#[test]
fn last_axis_preserving_transpose_does_not_fuse() {
    let mut graph = new_graph();
    let a = graph.add_tensor(Shape::new(vec![3, 4, 8]), DataType::F32);
    let a_t = placeholder(&mut graph);
    let b = graph.add_tensor(Shape::new(vec![8, 5]), DataType::F32);
    let c = placeholder(&mut graph);
    // Identity permute keeps the last axis in place; nothing to fold.
    graph.add_transpose(a, a_t, vec![0, 1, 2]).expect("transpose");
    graph.add_matmul(a_t, b, c, false, false).expect("matmul");

    let stats = graph.optimize().expect("optimize");
    assert_eq!(stats.matmul_fusions, 0);
    assert_eq!(graph.ops().len(), 2);
}

#[test]
fn shared_intermediate_keeps_the_first_transpose_alive() {
    let mut graph = new_graph();
    let x = graph.add_tensor(Shape::new(vec![2, 3, 4]), DataType::F32);
    let y = placeholder(&mut graph);
    let z = placeholder(&mut graph);
    let out = placeholder(&mut graph);
    let side = placeholder(&mut graph);
    let first = graph.add_transpose(x, y, vec![0, 2, 1]).expect("first transpose");
    graph.add_transpose(y, z, vec![0, 2, 1]).expect("second transpose");
    let relu = graph.add_unary(UnaryKind::Relu, z, out).expect("relu");
    let side_op = graph.add_unary(UnaryKind::Sigmoid, y, side).expect("sigmoid");

    let stats = graph.optimize().expect("optimize");
    assert_eq!(stats.transpose_pairs_removed, 1);
    assert_eq!(stats.erased_ops, 1, "only the second transpose dies");
    assert_eq!(stats.erased_tensors, 1, "only its output dies");

    assert!(graph.op(first).is_some(), "shared producer survives");
    assert!(graph.tensor(y).is_some(), "shared intermediate survives");
    assert!(graph.tensor(z).is_none());
    assert_eq!(graph.op(relu).expect("relu").inputs(), &[x]);
    assert_eq!(graph.op(side_op).expect("sigmoid").inputs(), &[y]);

    graph.check_valid().expect("valid after partial splice");
    graph.topo_sort().expect("sorts");
    graph.shape_infer().expect("infers");
    assert_eq!(graph.tensor(out).expect("out").dims(), &[2, 3, 4]);
    assert_eq!(graph.tensor(side).expect("side").dims(), &[2, 4, 3]);
}

#[test]
fn shared_transpose_output_survives_fusion() {
    let mut graph = new_graph();
    let a = graph.add_tensor(Shape::new(vec![4, 8]), DataType::F32);
    let a_t = placeholder(&mut graph);
    let b = graph.add_tensor(Shape::new(vec![8, 5]), DataType::F32);
    let c = placeholder(&mut graph);
    let side = placeholder(&mut graph);
    let trans = graph.add_transpose(a, a_t, vec![1, 0]).expect("transpose");
    let matmul = graph.add_matmul(a_t, b, c, false, false).expect("matmul");
    graph.add_unary(UnaryKind::Relu, a_t, side).expect("relu");

    let stats = graph.optimize().expect("optimize");
    assert_eq!(stats.matmul_fusions, 1);
    assert_eq!(stats.erased_ops, 0, "transpose still feeds the relu");

    assert!(graph.op(trans).is_some());
    assert_eq!(graph.op(matmul).expect("matmul").inputs(), &[a, b]);
    graph.check_valid().expect("valid with shared transpose output");
}

#[test]
fn optimize_resets_the_sort_flag() {
    let mut graph = new_graph();
    let x = graph.add_tensor(Shape::new(vec![2, 2]), DataType::F32);
    let y = placeholder(&mut graph);
    graph.add_unary(UnaryKind::Relu, x, y).expect("relu");
    graph.topo_sort().expect("sorts");
    assert!(graph.is_sorted());

    graph.optimize().expect("optimize");
    assert!(!graph.is_sorted(), "optimize conservatively clears the cache");
}
