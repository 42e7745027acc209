//! Computation-graph core for a small neural-network inference framework.
//!
//! Three tightly coupled subsystems live here: a DAG IR of tensors and
//! operators with bidirectional producer/consumer links, a pattern-driven
//! peephole optimizer over that DAG (inverse-transpose elimination,
//! transpose-into-MatMul fusion), and a first-fit/coalescing byte-offset
//! planner that lays every tensor of a sorted graph into one contiguous
//! runtime buffer.
//!
//! Kernels, drivers, and bindings are external collaborators; the crate
//! only defines the contracts it exposes to them (the [`Runtime`] seam and
//! opaque [`DataBlob`] handles).

mod env;

pub mod allocator;
pub mod dtype;
pub mod error;
pub mod graph;
pub mod op;
pub mod optimizer;
pub mod runtime;
pub mod shape;
pub mod tensor;

pub use allocator::Allocator;
pub use dtype::DataType;
pub use error::{GraphError, Result};
pub use graph::{Graph, GraphDump};
pub use op::{BinaryKind, ConcatSpec, MatMulSpec, OpId, OpKind, Operator, TransposeSpec, UnaryKind};
pub use optimizer::OptimizeStats;
pub use runtime::{CpuRuntime, Runtime};
pub use shape::{infer_broadcast, normalize_axis, Shape};
pub use tensor::{DataBlob, Fuid, Tensor, TensorId};
