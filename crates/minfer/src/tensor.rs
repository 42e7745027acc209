use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::dtype::DataType;
use crate::error::{GraphError, Result};
use crate::op::OpId;
use crate::runtime::Runtime;
use crate::shape::Shape;

/// Global identifier of a tensor, unique within its graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TensorId(pub u64);

impl fmt::Display for TensorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Functional identifier; stable across shape-only mutations of a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Fuid(pub u64);

impl fmt::Display for Fuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque handle to a region of a runtime-owned buffer.
///
/// The core never dereferences the pointer; kernels receive it as-is. Blobs
/// are views into the graph's single backing buffer and must not outlive the
/// graph.
#[derive(Clone)]
pub struct DataBlob {
    runtime: Arc<dyn Runtime>,
    ptr: NonNull<u8>,
}

impl DataBlob {
    pub fn new(runtime: Arc<dyn Runtime>, ptr: NonNull<u8>) -> Self {
        Self { runtime, ptr }
    }

    pub fn as_ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    pub fn runtime(&self) -> &Arc<dyn Runtime> {
        &self.runtime
    }
}

impl fmt::Debug for DataBlob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataBlob")
            .field("runtime", &self.runtime.name())
            .field("ptr", &self.ptr)
            .finish()
    }
}

/// A value node of the computation graph.
///
/// Tensors hold their shape and dtype plus non-owning back-references to the
/// operator producing them (`source`, 0 or 1) and the operators consuming
/// them (`targets`, one entry per consuming input). The graph owns the node;
/// edges never extend lifetime.
#[derive(Debug)]
pub struct Tensor {
    guid: TensorId,
    fuid: Fuid,
    shape: Shape,
    dtype: DataType,
    source: Option<OpId>,
    targets: Vec<OpId>,
    blob: Option<DataBlob>,
}

impl Tensor {
    pub(crate) fn new(guid: TensorId, fuid: Fuid, shape: Shape, dtype: DataType) -> Self {
        Self {
            guid,
            fuid,
            shape,
            dtype,
            source: None,
            targets: Vec::new(),
            blob: None,
        }
    }

    pub fn guid(&self) -> TensorId {
        self.guid
    }

    pub fn fuid(&self) -> Fuid {
        self.fuid
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn dims(&self) -> &[usize] {
        self.shape.dims()
    }

    pub fn rank(&self) -> usize {
        self.shape.rank()
    }

    pub fn dtype(&self) -> DataType {
        self.dtype
    }

    /// Total byte footprint, or `None` when the product overflows.
    pub fn bytes(&self) -> Option<usize> {
        self.shape
            .num_elements()?
            .checked_mul(self.dtype.size_bytes())
    }

    pub(crate) fn set_shape(&mut self, shape: Shape) {
        self.shape = shape;
    }

    pub fn source(&self) -> Option<OpId> {
        self.source
    }

    pub(crate) fn set_source(&mut self, source: Option<OpId>) {
        self.source = source;
    }

    /// Consumers, one entry per consuming input slot.
    pub fn targets(&self) -> &[OpId] {
        &self.targets
    }

    pub(crate) fn add_target(&mut self, op: OpId) {
        self.targets.push(op);
    }

    /// Removes one occurrence of `op` from the consumer list.
    pub(crate) fn remove_target(&mut self, op: OpId) {
        if let Some(pos) = self.targets.iter().position(|&t| t == op) {
            self.targets.remove(pos);
        }
    }

    pub fn blob(&self) -> Option<&DataBlob> {
        self.blob.as_ref()
    }

    /// Binds the tensor to its slice of the planned buffer. One-shot.
    pub fn set_data_blob(&mut self, blob: DataBlob) -> Result<()> {
        if self.blob.is_some() {
            return Err(GraphError::InvalidState(
                "tensor already has a data blob bound",
            ));
        }
        self.blob = Some(blob);
        Ok(())
    }
}

impl fmt::Display for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Tensor {}, Fuid {}, shape {}, dtype {:?}",
            self.guid, self.fuid, self.shape, self.dtype
        )?;
        if let Some(src) = self.source {
            write!(f, ", source {src}")?;
        }
        if !self.targets.is_empty() {
            write!(f, ", targets [")?;
            for (i, t) in self.targets.iter().enumerate() {
                if i > 0 {
                    f.write_str(",")?;
                }
                write!(f, "{t}")?;
            }
            write!(f, "]")?;
        }
        Ok(())
    }
}
