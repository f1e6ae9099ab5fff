mod dtype;
pub mod shape;
mod tensor;
mod value;

pub use dtype::{DType, F16};
pub use tensor::{MemKind, MemoryInfo, Tensor};
pub use value::{TensorElement, TensorValue, Value};
