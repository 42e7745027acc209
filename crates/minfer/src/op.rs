use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{GraphError, Result};
use crate::shape::{infer_broadcast, Shape};
use crate::tensor::{Tensor, TensorId};

/// Global identifier of an operator, unique within its graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OpId(pub u64);

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Elementwise unary kinds. Shape-preserving; the optimizer passes them
/// through untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnaryKind {
    Relu,
    Sigmoid,
    Abs,
    Neg,
}

impl UnaryKind {
    pub fn name(self) -> &'static str {
        match self {
            UnaryKind::Relu => "Relu",
            UnaryKind::Sigmoid => "Sigmoid",
            UnaryKind::Abs => "Abs",
            UnaryKind::Neg => "Neg",
        }
    }
}

/// Elementwise binary kinds with broadcast semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinaryKind {
    Add,
    Sub,
    Mul,
    Div,
}

impl BinaryKind {
    pub fn name(self) -> &'static str {
        match self {
            BinaryKind::Add => "Add",
            BinaryKind::Sub => "Sub",
            BinaryKind::Mul => "Mul",
            BinaryKind::Div => "Div",
        }
    }
}

/// Permutation payload for `Transpose`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransposeSpec {
    permute: Vec<usize>,
}

impl TransposeSpec {
    /// Validates that `permute` is a bijection of `[0, rank)`.
    pub fn new(permute: Vec<usize>) -> Result<Self> {
        let rank = permute.len();
        let mut seen = vec![false; rank];
        for &axis in &permute {
            if axis >= rank || seen[axis] {
                return Err(GraphError::BadAttribute(format!(
                    "permute {permute:?} is not a permutation of 0..{rank}"
                )));
            }
            seen[axis] = true;
        }
        Ok(Self { permute })
    }

    pub fn permute(&self) -> &[usize] {
        &self.permute
    }

    /// True iff `self ∘ other` is the identity permutation.
    pub fn is_inverse_of(&self, other: &TransposeSpec) -> bool {
        if self.permute.len() != other.permute.len() {
            return false;
        }
        (0..self.permute.len()).all(|i| self.permute[other.permute[i]] == i)
    }

    /// Classifies the permutation with respect to the trailing matrix axes.
    ///
    /// Returns `None` when rank ≤ 1 or any leading axis moves, `Some(false)`
    /// when the last axis stays in place, and `Some(true)` when the last two
    /// axes swap. Only the `Some(true)` form folds into a MatMul.
    pub fn matrix_axes_swap(&self) -> Option<bool> {
        let rank = self.permute.len();
        if rank <= 1 {
            return None;
        }
        for i in 0..rank - 2 {
            if self.permute[i] != i {
                return None;
            }
        }
        Some(self.permute[rank - 1] != rank - 1)
    }
}

/// Attribute payload for `MatMul`.
///
/// `m`/`n`/`k` are caches of the operand matrix extents, refreshed by shape
/// inference after the transpose flags settle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatMulSpec {
    pub trans_a: bool,
    pub trans_b: bool,
    pub m: usize,
    pub n: usize,
    pub k: usize,
}

impl MatMulSpec {
    pub fn new(trans_a: bool, trans_b: bool) -> Self {
        Self {
            trans_a,
            trans_b,
            m: 0,
            n: 0,
            k: 0,
        }
    }
}

/// Computes the `(m, k, n)` extents of a MatMul over `a` and `b` once the
/// transpose flags are applied.
pub(crate) fn matmul_mnk(
    a: &Shape,
    b: &Shape,
    trans_a: bool,
    trans_b: bool,
) -> Result<(usize, usize, usize)> {
    if a.rank() < 2 || b.rank() < 2 {
        return Err(GraphError::ShapeMismatch(format!(
            "MatMul operands must have rank >= 2, got {a} and {b}"
        )));
    }
    let (a_rows, a_cols) = (a.dims()[a.rank() - 2], a.dims()[a.rank() - 1]);
    let (b_rows, b_cols) = (b.dims()[b.rank() - 2], b.dims()[b.rank() - 1]);
    let (m, k) = if trans_a { (a_cols, a_rows) } else { (a_rows, a_cols) };
    let n = if trans_b { b_rows } else { b_cols };
    Ok((m, k, n))
}

/// Attribute payload for `Concat`; the axis is already normalized into
/// `[0, rank)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConcatSpec {
    pub axis: usize,
}

/// Closed sum of the operator kinds the graph understands.
///
/// The optimizer dispatches on the tag; kinds it has no rewrite for pass
/// through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OpKind {
    MatMul(MatMulSpec),
    Transpose(TransposeSpec),
    Concat(ConcatSpec),
    Unary(UnaryKind),
    Binary(BinaryKind),
}

impl OpKind {
    pub fn name(&self) -> &'static str {
        match self {
            OpKind::MatMul(_) => "MatMul",
            OpKind::Transpose(_) => "Transpose",
            OpKind::Concat(_) => "Concat",
            OpKind::Unary(kind) => kind.name(),
            OpKind::Binary(kind) => kind.name(),
        }
    }

    /// Infers one output shape per output from the current input tensors.
    ///
    /// Pure: reads input shapes/dtypes and operator attributes only.
    pub fn infer_shape(&self, inputs: &[&Tensor]) -> Result<Vec<Shape>> {
        match self {
            OpKind::Transpose(spec) => {
                let [input] = inputs else {
                    return Err(arity_mismatch("Transpose", 1, inputs.len()));
                };
                if spec.permute().len() != input.rank() {
                    return Err(GraphError::ShapeMismatch(format!(
                        "Transpose permute {:?} does not cover rank {}",
                        spec.permute(),
                        input.rank()
                    )));
                }
                let dims = spec
                    .permute()
                    .iter()
                    .map(|&axis| input.dims()[axis])
                    .collect::<Vec<_>>();
                Ok(vec![Shape::new(dims)])
            }
            OpKind::MatMul(spec) => {
                let [a, b] = inputs else {
                    return Err(arity_mismatch("MatMul", 2, inputs.len()));
                };
                let (mut shape_a, mut shape_b) = (a.dims().to_vec(), b.dims().to_vec());
                if shape_a.len() < 2 || shape_b.len() < 2 {
                    return Err(GraphError::ShapeMismatch(format!(
                        "MatMul operands must have rank >= 2, got {} and {}",
                        a.shape(),
                        b.shape()
                    )));
                }
                let (a_rank, b_rank) = (shape_a.len(), shape_b.len());
                if spec.trans_a {
                    shape_a.swap(a_rank - 1, a_rank - 2);
                }
                if spec.trans_b {
                    shape_b.swap(b_rank - 1, b_rank - 2);
                }
                // Mask the contracted axes so broadcasting yields [.., m, n].
                shape_a[a_rank - 1] = 1;
                shape_b[b_rank - 2] = 1;
                let out = infer_broadcast(&Shape::new(shape_a), &Shape::new(shape_b))?;
                Ok(vec![out])
            }
            OpKind::Concat(spec) => {
                let Some((first, rest)) = inputs.split_first() else {
                    return Err(arity_mismatch("Concat", 1, 0));
                };
                let rank = first.rank();
                if spec.axis >= rank {
                    return Err(GraphError::BadAttribute(format!(
                        "Concat axis {} out of range for rank {rank}",
                        spec.axis
                    )));
                }
                let mut dims = first.dims().to_vec();
                for input in rest {
                    if input.rank() != rank || input.dtype() != first.dtype() {
                        return Err(GraphError::ShapeMismatch(format!(
                            "Concat inputs disagree on rank or dtype: {} {:?} vs {} {:?}",
                            first.shape(),
                            first.dtype(),
                            input.shape(),
                            input.dtype()
                        )));
                    }
                    for (axis, (&lhs, &rhs)) in
                        first.dims().iter().zip(input.dims()).enumerate()
                    {
                        if axis != spec.axis && lhs != rhs {
                            return Err(GraphError::ShapeMismatch(format!(
                                "Concat inputs disagree on non-axis extent {axis}: {} vs {}",
                                first.shape(),
                                input.shape()
                            )));
                        }
                    }
                    dims[spec.axis] += input.dims()[spec.axis];
                }
                Ok(vec![Shape::new(dims)])
            }
            OpKind::Unary(_) => {
                let [input] = inputs else {
                    return Err(arity_mismatch(self.name(), 1, inputs.len()));
                };
                Ok(vec![input.shape().clone()])
            }
            OpKind::Binary(_) => {
                let [lhs, rhs] = inputs else {
                    return Err(arity_mismatch(self.name(), 2, inputs.len()));
                };
                Ok(vec![infer_broadcast(lhs.shape(), rhs.shape())?])
            }
        }
    }
}

fn arity_mismatch(op: &str, expected: usize, got: usize) -> GraphError {
    GraphError::InvariantViolation(format!("{op} expects {expected} input(s), got {got}"))
}

/// A computation node of the graph.
///
/// Inputs and outputs are ordered tensor references; predecessors and
/// successors are multisets of operator references kept pairwise consistent
/// with the input/output source relations.
#[derive(Debug)]
pub struct Operator {
    guid: OpId,
    kind: OpKind,
    inputs: Vec<TensorId>,
    outputs: Vec<TensorId>,
    predecessors: Vec<OpId>,
    successors: Vec<OpId>,
}

impl Operator {
    pub(crate) fn new(guid: OpId, kind: OpKind, inputs: Vec<TensorId>, outputs: Vec<TensorId>) -> Self {
        Self {
            guid,
            kind,
            inputs,
            outputs,
            predecessors: Vec::new(),
            successors: Vec::new(),
        }
    }

    pub fn guid(&self) -> OpId {
        self.guid
    }

    pub fn kind(&self) -> &OpKind {
        &self.kind
    }

    pub(crate) fn kind_mut(&mut self) -> &mut OpKind {
        &mut self.kind
    }

    pub fn inputs(&self) -> &[TensorId] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[TensorId] {
        &self.outputs
    }

    pub fn predecessors(&self) -> &[OpId] {
        &self.predecessors
    }

    pub fn successors(&self) -> &[OpId] {
        &self.successors
    }

    /// Replaces the first occurrence of `from` in the input list.
    pub(crate) fn replace_one_input(&mut self, from: TensorId, to: TensorId) {
        if let Some(slot) = self.inputs.iter().position(|&input| input == from) {
            self.inputs[slot] = to;
        }
    }

    pub(crate) fn replace_input_at(&mut self, slot: usize, to: TensorId) {
        self.inputs[slot] = to;
    }

    pub(crate) fn add_predecessor(&mut self, op: OpId) {
        self.predecessors.push(op);
    }

    pub(crate) fn remove_predecessor(&mut self, op: OpId) {
        if let Some(pos) = self.predecessors.iter().position(|&p| p == op) {
            self.predecessors.remove(pos);
        }
    }

    pub(crate) fn add_successor(&mut self, op: OpId) {
        self.successors.push(op);
    }

    pub(crate) fn remove_successor(&mut self, op: OpId) {
        if let Some(pos) = self.successors.iter().position(|&s| s == op) {
            self.successors.remove(pos);
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            OpKind::MatMul(spec) => write!(
                f,
                "MatMul[{}]([{},{}],A={},B={},C={},mnk=[{},{},{}])",
                self.guid,
                if spec.trans_a { "A^T" } else { "A" },
                if spec.trans_b { "B^T" } else { "B" },
                self.inputs[0],
                self.inputs[1],
                self.outputs[0],
                spec.m,
                spec.n,
                spec.k
            ),
            OpKind::Transpose(spec) => write!(
                f,
                "Transpose[{}](in={},out={},permute={:?})",
                self.guid, self.inputs[0], self.outputs[0], spec.permute()
            ),
            OpKind::Concat(spec) => {
                write!(f, "Concat[{}](axis={},in=[", self.guid, spec.axis)?;
                for (i, input) in self.inputs.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{input}")?;
                }
                write!(f, "],out={})", self.outputs[0])
            }
            OpKind::Unary(_) | OpKind::Binary(_) => {
                write!(f, "{}[{}](in=[", self.kind.name(), self.guid)?;
                for (i, input) in self.inputs.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{input}")?;
                }
                write!(f, "],out={})", self.outputs[0])
            }
        }
    }
}
