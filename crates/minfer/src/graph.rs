use std::collections::{HashMap, HashSet};
use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;

use serde::Serialize;

use crate::allocator::Allocator;
use crate::dtype::DataType;
use crate::error::{GraphError, Result};
use crate::op::{
    matmul_mnk, BinaryKind, ConcatSpec, MatMulSpec, OpId, OpKind, Operator, TransposeSpec,
    UnaryKind,
};
use crate::optimizer::{self, OptimizeStats};
use crate::runtime::Runtime;
use crate::shape::{normalize_axis, Shape};
use crate::tensor::{DataBlob, Fuid, Tensor, TensorId};

/// Owner of a computation DAG: tensors, operators, their wiring, one offset
/// planner, and one runtime handle shared by every tensor.
///
/// Removal from the owned vectors is the destruction event for a node; all
/// edges (source, targets, predecessors, successors) are non-owning id
/// references resolved through the graph.
pub struct Graph {
    runtime: Arc<dyn Runtime>,
    tensors: Vec<Tensor>,
    ops: Vec<Operator>,
    sorted: bool,
    allocator: Allocator,
    next_guid: u64,
    next_fuid: u64,
}

impl Graph {
    pub fn new(runtime: Arc<dyn Runtime>) -> Self {
        let allocator = Allocator::new(Arc::clone(&runtime));
        Self::with_allocator(runtime, allocator)
    }

    /// Graph whose memory plan is bounded to `capacity` bytes.
    pub fn with_memory_budget(runtime: Arc<dyn Runtime>, capacity: usize) -> Self {
        let allocator = Allocator::with_capacity(Arc::clone(&runtime), capacity);
        Self::with_allocator(runtime, allocator)
    }

    fn with_allocator(runtime: Arc<dyn Runtime>, allocator: Allocator) -> Self {
        Self {
            runtime,
            tensors: Vec::new(),
            ops: Vec::new(),
            sorted: false,
            allocator,
            next_guid: 0,
            next_fuid: 0,
        }
    }

    pub fn runtime(&self) -> &Arc<dyn Runtime> {
        &self.runtime
    }

    pub fn tensors(&self) -> &[Tensor] {
        &self.tensors
    }

    pub fn ops(&self) -> &[Operator] {
        &self.ops
    }

    pub fn is_sorted(&self) -> bool {
        self.sorted
    }

    pub fn allocator(&self) -> &Allocator {
        &self.allocator
    }

    pub fn tensor(&self, id: TensorId) -> Option<&Tensor> {
        self.tensors.iter().find(|t| t.guid() == id)
    }

    pub fn op(&self, id: OpId) -> Option<&Operator> {
        self.ops.iter().find(|o| o.guid() == id)
    }

    pub fn tensor_by_fuid(&self, fuid: Fuid) -> Option<&Tensor> {
        self.tensors.iter().find(|t| t.fuid() == fuid)
    }

    fn alloc_guid(&mut self) -> u64 {
        let guid = self.next_guid;
        self.next_guid += 1;
        guid
    }

    /// Creates a tensor owned by this graph.
    pub fn add_tensor(&mut self, shape: Shape, dtype: DataType) -> TensorId {
        let guid = TensorId(self.alloc_guid());
        let fuid = Fuid(self.next_fuid);
        self.next_fuid += 1;
        self.tensors.push(Tensor::new(guid, fuid, shape, dtype));
        guid
    }

    pub fn add_transpose(
        &mut self,
        input: TensorId,
        output: TensorId,
        permute: Vec<usize>,
    ) -> Result<OpId> {
        let spec = TransposeSpec::new(permute)?;
        self.add_operator(OpKind::Transpose(spec), vec![input], vec![output])
    }

    pub fn add_matmul(
        &mut self,
        a: TensorId,
        b: TensorId,
        output: TensorId,
        trans_a: bool,
        trans_b: bool,
    ) -> Result<OpId> {
        self.add_operator(
            OpKind::MatMul(MatMulSpec::new(trans_a, trans_b)),
            vec![a, b],
            vec![output],
        )
    }

    pub fn add_concat(
        &mut self,
        inputs: Vec<TensorId>,
        output: TensorId,
        axis: isize,
    ) -> Result<OpId> {
        let first = inputs
            .first()
            .copied()
            .ok_or_else(|| GraphError::BadAttribute("Concat needs at least one input".into()))?;
        let rank = self.tensor_entry(first)?.rank();
        let axis = normalize_axis(axis, rank)?;
        self.add_operator(OpKind::Concat(ConcatSpec { axis }), inputs, vec![output])
    }

    pub fn add_unary(&mut self, kind: UnaryKind, input: TensorId, output: TensorId) -> Result<OpId> {
        self.add_operator(OpKind::Unary(kind), vec![input], vec![output])
    }

    pub fn add_binary(
        &mut self,
        kind: BinaryKind,
        lhs: TensorId,
        rhs: TensorId,
        output: TensorId,
    ) -> Result<OpId> {
        self.add_operator(OpKind::Binary(kind), vec![lhs, rhs], vec![output])
    }

    /// Registers an operator and wires every producer/consumer edge.
    ///
    /// Inference runs once at construction so malformed operators are
    /// rejected before they enter the DAG; output tensors take the inferred
    /// shapes immediately.
    pub fn add_operator(
        &mut self,
        kind: OpKind,
        inputs: Vec<TensorId>,
        outputs: Vec<TensorId>,
    ) -> Result<OpId> {
        let shapes = {
            let mut input_refs = Vec::with_capacity(inputs.len());
            for &input in &inputs {
                input_refs.push(self.tensor_entry(input)?);
            }
            kind.infer_shape(&input_refs)?
        };
        if shapes.len() != outputs.len() {
            return Err(GraphError::InvariantViolation(format!(
                "{} inferred {} output shape(s) for {} output tensor(s)",
                kind.name(),
                shapes.len(),
                outputs.len()
            )));
        }
        for (&output, shape) in outputs.iter().zip(shapes) {
            self.tensor_entry_mut(output)?.set_shape(shape);
        }

        self.sorted = false;
        let op_id = OpId(self.alloc_guid());
        let mut op = Operator::new(op_id, kind, inputs.clone(), outputs.clone());

        for &input in &inputs {
            let source = {
                let tensor = self.tensor_entry_mut(input)?;
                tensor.add_target(op_id);
                tensor.source()
            };
            if let Some(pred) = source {
                self.op_entry_mut(pred)?.add_successor(op_id);
                op.add_predecessor(pred);
            }
        }
        for &output in &outputs {
            let existing_targets = {
                let tensor = self.tensor_entry_mut(output)?;
                tensor.set_source(Some(op_id));
                tensor.targets().to_vec()
            };
            for succ in existing_targets {
                self.op_entry_mut(succ)?.add_predecessor(op_id);
                op.add_successor(succ);
            }
        }
        self.ops.push(op);
        self.refresh_matmul_dims(self.ops.len() - 1)?;
        Ok(op_id)
    }

    /// Orders `ops` so every operator appears after the producers of its
    /// inputs. Stable for ties, idempotent, and a no-op when already sorted.
    pub fn topo_sort(&mut self) -> Result<()> {
        if self.sorted {
            return Ok(());
        }
        let mut emit_pos: HashMap<OpId, usize> = HashMap::with_capacity(self.ops.len());
        while emit_pos.len() < self.ops.len() {
            let mut modified = false;
            for op in &self.ops {
                if emit_pos.contains_key(&op.guid()) {
                    continue;
                }
                let ready = op.inputs().iter().all(|&input| {
                    match self.tensor(input).and_then(|t| t.source()) {
                        None => true,
                        Some(source) => emit_pos.contains_key(&source),
                    }
                });
                if ready {
                    modified = true;
                    emit_pos.insert(op.guid(), emit_pos.len());
                }
            }
            if !modified {
                return Err(GraphError::CycleDetected);
            }
        }
        self.ops
            .sort_by_key(|op| emit_pos.get(&op.guid()).copied().unwrap_or(usize::MAX));
        self.sorted = true;
        Ok(())
    }

    /// Propagates shapes through the sorted graph, updating any output whose
    /// inferred shape changed (looked up by fuid) and refreshing MatMul's
    /// cached extents. Idempotent.
    pub fn shape_infer(&mut self) -> Result<()> {
        if !self.sorted {
            return Err(GraphError::InvalidState(
                "shape inference requires a topologically sorted graph",
            ));
        }
        for idx in 0..self.ops.len() {
            let (shapes, outputs) = {
                let op = &self.ops[idx];
                let mut input_refs = Vec::with_capacity(op.inputs().len());
                for &input in op.inputs() {
                    input_refs.push(self.tensor_entry(input)?);
                }
                let shapes = op.kind().infer_shape(&input_refs)?;
                if shapes.len() != op.outputs().len() {
                    return Err(GraphError::InvariantViolation(format!(
                        "{} inferred {} output shape(s) for {} output tensor(s)",
                        op.kind().name(),
                        shapes.len(),
                        op.outputs().len()
                    )));
                }
                (shapes, op.outputs().to_vec())
            };
            for (shape, output) in shapes.into_iter().zip(outputs) {
                let fuid = self.tensor_entry(output)?.fuid();
                let guid = self.tensor_by_fuid(fuid).map(|t| t.guid()).ok_or_else(|| {
                    GraphError::InvariantViolation(format!("no tensor with fuid {fuid}"))
                })?;
                let tensor = self.tensor_entry_mut(guid)?;
                if tensor.shape() != &shape {
                    tensor.set_shape(shape);
                }
            }
            self.refresh_matmul_dims(idx)?;
        }
        Ok(())
    }

    /// Applies the peephole rewrites and sweeps unreachable nodes.
    pub fn optimize(&mut self) -> Result<OptimizeStats> {
        optimizer::run(self)
    }

    /// Plans an offset for every tensor, materializes one buffer of `peak`
    /// bytes, and binds each tensor's blob to `base + offset`. At most once
    /// per graph.
    pub fn data_malloc(&mut self) -> Result<()> {
        if self.allocator.is_materialized() {
            return Err(GraphError::InvalidState(
                "graph memory has already been planned",
            ));
        }
        self.topo_sort()?;

        let mut offsets = Vec::with_capacity(self.tensors.len());
        for tensor in &self.tensors {
            let bytes = tensor.bytes().ok_or_else(|| {
                GraphError::InvariantViolation(format!(
                    "tensor {} byte size overflows",
                    tensor.guid()
                ))
            })?;
            offsets.push(self.allocator.alloc(bytes)?);
        }

        let base = self.allocator.get_ptr()?;
        for (tensor, offset) in self.tensors.iter_mut().zip(offsets) {
            // SAFETY: without frees every planned offset lies below `peak`,
            // the size of the buffer behind `base`.
            let ptr = unsafe { NonNull::new_unchecked(base.as_ptr().add(offset)) };
            tensor.set_data_blob(DataBlob::new(Arc::clone(&self.runtime), ptr))?;
        }
        self.allocator.info();
        Ok(())
    }

    /// Enforces the cross-entity invariants of the data model.
    pub fn check_valid(&self) -> Result<()> {
        let op_ids: HashSet<OpId> = self.ops.iter().map(|o| o.guid()).collect();
        let tensor_ids: HashSet<TensorId> = self.tensors.iter().map(|t| t.guid()).collect();

        // Successors must mirror the target relation of the produced
        // tensors; collect the expectation up front so each operator can be
        // compared with multiplicity.
        let mut expected_successors: HashMap<OpId, Vec<OpId>> = HashMap::new();
        for tensor in &self.tensors {
            if let Some(source) = tensor.source() {
                expected_successors
                    .entry(source)
                    .or_default()
                    .extend(tensor.targets().iter().copied());
            }
        }

        for tensor in &self.tensors {
            if tensor.source().is_none() && tensor.targets().is_empty() {
                return Err(GraphError::InvariantViolation(format!(
                    "tensor {} has neither source nor targets",
                    tensor.guid()
                )));
            }
            if let Some(source) = tensor.source() {
                if !op_ids.contains(&source) {
                    return Err(GraphError::InvariantViolation(format!(
                        "tensor {} names source {source} outside the graph",
                        tensor.guid()
                    )));
                }
            }
            for &target in tensor.targets() {
                if !op_ids.contains(&target) {
                    return Err(GraphError::InvariantViolation(format!(
                        "tensor {} names target {target} outside the graph",
                        tensor.guid()
                    )));
                }
            }
        }

        for op in &self.ops {
            for &tensor in op.inputs().iter().chain(op.outputs()) {
                if !tensor_ids.contains(&tensor) {
                    return Err(GraphError::InvariantViolation(format!(
                        "operator {} references tensor {tensor} outside the graph",
                        op.guid()
                    )));
                }
            }
            for &other in op.predecessors().iter().chain(op.successors()) {
                if !op_ids.contains(&other) {
                    return Err(GraphError::InvariantViolation(format!(
                        "operator {} references operator {other} outside the graph",
                        op.guid()
                    )));
                }
            }
            // Predecessors must mirror the source relation of the inputs,
            // counted with multiplicity.
            let mut expected: Vec<OpId> = op
                .inputs()
                .iter()
                .filter_map(|&input| self.tensor(input).and_then(|t| t.source()))
                .collect();
            let mut actual = op.predecessors().to_vec();
            expected.sort_unstable();
            actual.sort_unstable();
            if expected != actual {
                return Err(GraphError::InvariantViolation(format!(
                    "operator {} predecessors {actual:?} do not match input sources {expected:?}",
                    op.guid()
                )));
            }
            // The dual direction: every target of every tensor this
            // operator produces, and nothing else.
            let mut expected = expected_successors
                .get(&op.guid())
                .cloned()
                .unwrap_or_default();
            let mut actual = op.successors().to_vec();
            expected.sort_unstable();
            actual.sort_unstable();
            if expected != actual {
                return Err(GraphError::InvariantViolation(format!(
                    "operator {} successors {actual:?} do not match output targets {expected:?}",
                    op.guid()
                )));
            }
        }

        let mut seen = HashSet::with_capacity(self.tensors.len());
        for tensor in &self.tensors {
            if !seen.insert(tensor.fuid()) {
                return Err(GraphError::InvariantViolation(format!(
                    "duplicate fuid {} in graph tensors",
                    tensor.fuid()
                )));
            }
        }
        Ok(())
    }

    /// Serializable snapshot of the graph structure.
    pub fn dump(&self) -> GraphDump {
        GraphDump {
            tensors: self
                .tensors
                .iter()
                .map(|t| TensorDump {
                    guid: t.guid().0,
                    fuid: t.fuid().0,
                    shape: t.dims().to_vec(),
                    dtype: t.dtype(),
                    source: t.source().map(|s| s.0),
                    targets: t.targets().iter().map(|s| s.0).collect(),
                })
                .collect(),
            ops: self
                .ops
                .iter()
                .map(|o| OpDump {
                    guid: o.guid().0,
                    kind: o.kind().clone(),
                    inputs: o.inputs().iter().map(|t| t.0).collect(),
                    outputs: o.outputs().iter().map(|t| t.0).collect(),
                    predecessors: o.predecessors().iter().map(|p| p.0).collect(),
                    successors: o.successors().iter().map(|s| s.0).collect(),
                })
                .collect(),
        }
    }

    pub(crate) fn tensor_entry(&self, id: TensorId) -> Result<&Tensor> {
        self.tensor(id).ok_or_else(|| {
            GraphError::InvariantViolation(format!("no tensor {id} in this graph"))
        })
    }

    pub(crate) fn tensor_entry_mut(&mut self, id: TensorId) -> Result<&mut Tensor> {
        self.tensors
            .iter_mut()
            .find(|t| t.guid() == id)
            .ok_or_else(|| {
                GraphError::InvariantViolation(format!("no tensor {id} in this graph"))
            })
    }

    pub(crate) fn op_entry(&self, id: OpId) -> Result<&Operator> {
        self.op(id)
            .ok_or_else(|| GraphError::InvariantViolation(format!("no operator {id} in this graph")))
    }

    pub(crate) fn op_entry_mut(&mut self, id: OpId) -> Result<&mut Operator> {
        self.ops
            .iter_mut()
            .find(|o| o.guid() == id)
            .ok_or_else(|| {
                GraphError::InvariantViolation(format!("no operator {id} in this graph"))
            })
    }

    pub(crate) fn invalidate_sort(&mut self) {
        self.sorted = false;
    }

    /// Physically removes the marked nodes; ids never get reused.
    pub(crate) fn remove_entries(
        &mut self,
        ops: &HashSet<OpId>,
        tensors: &HashSet<TensorId>,
    ) {
        if !ops.is_empty() {
            self.ops.retain(|op| !ops.contains(&op.guid()));
        }
        if !tensors.is_empty() {
            self.tensors.retain(|t| !tensors.contains(&t.guid()));
        }
    }

    fn refresh_matmul_dims(&mut self, idx: usize) -> Result<()> {
        let (a_id, b_id, trans_a, trans_b) = match self.ops[idx].kind() {
            OpKind::MatMul(spec) => (
                self.ops[idx].inputs()[0],
                self.ops[idx].inputs()[1],
                spec.trans_a,
                spec.trans_b,
            ),
            _ => return Ok(()),
        };
        let a = self.tensor_entry(a_id)?.shape().clone();
        let b = self.tensor_entry(b_id)?.shape().clone();
        let (m, k, n) = matmul_mnk(&a, &b, trans_a, trans_b)?;
        if let OpKind::MatMul(spec) = self.ops[idx].kind_mut() {
            spec.m = m;
            spec.k = k;
            spec.n = n;
        }
        Ok(())
    }
}

impl fmt::Display for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Graph Tensors:")?;
        for tensor in &self.tensors {
            writeln!(f, "{tensor}")?;
        }
        writeln!(f, "Graph operators:")?;
        for op in &self.ops {
            write!(f, "OP {}, pred [", op.guid())?;
            for (i, p) in op.predecessors().iter().enumerate() {
                if i > 0 {
                    f.write_str(",")?;
                }
                write!(f, "{p}")?;
            }
            write!(f, "], succ [")?;
            for (i, s) in op.successors().iter().enumerate() {
                if i > 0 {
                    f.write_str(",")?;
                }
                write!(f, "{s}")?;
            }
            writeln!(f, "], {op}")?;
        }
        Ok(())
    }
}

/// Serializable snapshot of a graph's structure.
#[derive(Debug, Clone, Serialize)]
pub struct GraphDump {
    pub tensors: Vec<TensorDump>,
    pub ops: Vec<OpDump>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TensorDump {
    pub guid: u64,
    pub fuid: u64,
    pub shape: Vec<usize>,
    pub dtype: DataType,
    pub source: Option<u64>,
    pub targets: Vec<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OpDump {
    pub guid: u64,
    pub kind: OpKind,
    pub inputs: Vec<u64>,
    pub outputs: Vec<u64>,
    pub predecessors: Vec<u64>,
    pub successors: Vec<u64>,
}

impl GraphDump {
    pub fn to_json_string(&self) -> std::result::Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}
