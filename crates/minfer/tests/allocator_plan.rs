use std::sync::Arc;

use minfer::{Allocator, CpuRuntime, DataType, Graph, GraphError, Shape, UnaryKind};

fn new_allocator() -> Allocator {
    Allocator::new(Arc::new(CpuRuntime::new()))
}

fn assert_coalesced(allocator: &Allocator) {
    let blocks: Vec<(usize, usize)> = allocator
        .free_blocks()
        .iter()
        .map(|(&offset, &size)| (offset, size))
        .collect();
    for pair in blocks.windows(2) {
        let (first_offset, first_size) = pair[0];
        let (second_offset, _) = pair[1];
        assert!(
            first_offset + first_size < second_offset,
            "adjacent free blocks {pair:?} were not coalesced"
        );
    }
}

#[test]
fn first_fit_reuses_freed_blocks_and_coalesces() {
    let mut allocator = new_allocator();
    assert_eq!(allocator.alloc(8).expect("first"), 0);
    assert_eq!(allocator.alloc(16).expect("second"), 8);
    assert_eq!(allocator.alloc(8).expect("third"), 24);

    allocator.free(8, 16).expect("free middle");
    allocator.free(24, 8).expect("free tail");

    let blocks: Vec<(usize, usize)> = allocator
        .free_blocks()
        .iter()
        .map(|(&offset, &size)| (offset, size))
        .collect();
    assert_eq!(blocks, vec![(8, 24)], "neighbours merge into one block");

    assert_eq!(allocator.alloc(24).expect("refit"), 8, "first fit reuses the hole");
    assert_eq!(allocator.used(), 32);
    assert_eq!(allocator.peak(), 32);
    assert_coalesced(&allocator);
}

#[test]
fn freed_prefix_is_reused_before_the_frontier() {
    let mut allocator = new_allocator();
    assert_eq!(allocator.alloc(8).expect("a"), 0);
    assert_eq!(allocator.alloc(8).expect("b"), 8);
    allocator.free(0, 8).expect("free a");
    // The hole at 0 borders nothing usable for 16 bytes, but 8 fits exactly.
    assert_eq!(allocator.alloc(8).expect("refit"), 0);
    assert_coalesced(&allocator);
}

#[test]
fn hole_bordering_untouched_space_extends_instead_of_stranding() {
    let mut allocator = new_allocator();
    assert_eq!(allocator.alloc(8).expect("a"), 0);
    allocator.free(0, 8).expect("free a");
    // Everything is free again, so a larger request starts back at 0.
    assert_eq!(allocator.alloc(64).expect("bigger"), 0);
    assert_eq!(allocator.used(), 64);
    assert_eq!(allocator.peak(), 64);
    assert!(allocator.free_blocks().is_empty());
}

#[test]
fn sizes_round_up_to_alignment_on_both_paths() {
    let mut allocator = new_allocator();
    let alignment = allocator.alignment();
    assert_eq!(alignment, 8);

    assert_eq!(allocator.alloc(5).expect("alloc"), 0);
    assert_eq!(allocator.used(), 8, "5 bytes round up to one alignment unit");
    assert_eq!(allocator.alloc(1).expect("alloc"), 8);

    allocator.free(0, 5).expect("free rounds symmetrically");
    assert_eq!(allocator.used(), 8);
    assert_eq!(
        allocator.free_blocks().get(&0).copied(),
        Some(8),
        "freed size is aligned"
    );
    assert_eq!(allocator.aligned_size(0), 0);
    assert_eq!(allocator.aligned_size(8), 8);
    assert_eq!(allocator.aligned_size(9), 16);
}

#[test]
fn planned_bytes_are_conserved() {
    let mut allocator = new_allocator();
    let offsets = [
        allocator.alloc(24).expect("a"),
        allocator.alloc(8).expect("b"),
        allocator.alloc(40).expect("c"),
    ];
    allocator.free(offsets[1], 8).expect("free b");

    let free_total: usize = allocator.free_blocks().values().sum();
    assert_eq!(
        free_total + allocator.used(),
        allocator.frontier(),
        "free and used space partition everything ever planned"
    );
    assert_coalesced(&allocator);
}

#[test]
fn freeing_everything_leaves_one_block_and_zero_used() {
    let mut allocator = new_allocator();
    let a = allocator.alloc(8).expect("a");
    let b = allocator.alloc(16).expect("b");
    let c = allocator.alloc(8).expect("c");
    allocator.free(a, 8).expect("free a");
    allocator.free(c, 8).expect("free c");
    allocator.free(b, 16).expect("free b");

    assert_eq!(allocator.used(), 0);
    let blocks: Vec<(usize, usize)> = allocator
        .free_blocks()
        .iter()
        .map(|(&offset, &size)| (offset, size))
        .collect();
    assert_eq!(
        blocks,
        vec![(0, 32)],
        "all frees merge back into the full planned range"
    );
}

#[test]
fn planning_is_frozen_after_materialization() {
    let mut allocator = new_allocator();
    allocator.alloc(16).expect("alloc");
    let ptr = allocator.get_ptr().expect("materialize");
    assert_eq!(allocator.get_ptr().expect("stable"), ptr);

    let err = allocator.alloc(8).expect_err("alloc after get_ptr");
    assert!(matches!(err, GraphError::InvalidState(_)), "got {err}");
    let err = allocator.free(0, 16).expect_err("free after get_ptr");
    assert!(matches!(err, GraphError::InvalidState(_)), "got {err}");
}

#[test]
fn capacity_bound_turns_into_out_of_budget() {
    let mut allocator = Allocator::with_capacity(Arc::new(CpuRuntime::new()), 16);
    assert_eq!(allocator.alloc(8).expect("fits"), 0);
    let err = allocator.alloc(16).expect_err("over budget");
    assert!(matches!(err, GraphError::OutOfBudget { .. }), "got {err}");
    // The failed request must leave no partial state behind.
    assert_eq!(allocator.used(), 8);
    assert_eq!(allocator.alloc(8).expect("remaining space"), 8);
}

#[test]
fn data_malloc_binds_every_tensor_to_one_buffer() {
    let runtime = Arc::new(CpuRuntime::new());
    let mut graph = Graph::new(runtime);
    let x = graph.add_tensor(Shape::new(vec![2, 3]), DataType::F32);
    let y = graph.add_tensor(Shape::new(vec![2, 3]), DataType::F32);
    graph.add_unary(UnaryKind::Relu, x, y).expect("relu");

    graph.data_malloc().expect("plan");

    let base = graph
        .tensor(x)
        .expect("x")
        .blob()
        .expect("x blob bound")
        .as_ptr()
        .as_ptr() as usize;
    let next = graph
        .tensor(y)
        .expect("y")
        .blob()
        .expect("y blob bound")
        .as_ptr()
        .as_ptr() as usize;
    assert_eq!(next - base, 24, "second tensor sits behind the first");
    assert_eq!(graph.allocator().peak(), 48);
    assert_eq!(graph.allocator().used(), 48);

    let err = graph.data_malloc().expect_err("plans at most once");
    assert!(matches!(err, GraphError::InvalidState(_)), "got {err}");
}

#[test]
fn graph_memory_budget_propagates_out_of_budget() {
    let runtime = Arc::new(CpuRuntime::new());
    let mut graph = Graph::with_memory_budget(runtime, 16);
    let x = graph.add_tensor(Shape::new(vec![64]), DataType::F32);
    let y = graph.add_tensor(Shape::new(vec![64]), DataType::F32);
    graph.add_unary(UnaryKind::Relu, x, y).expect("relu");

    let err = graph.data_malloc().expect_err("256-byte tensors exceed 16 bytes");
    assert!(matches!(err, GraphError::OutOfBudget { .. }), "got {err}");
}
