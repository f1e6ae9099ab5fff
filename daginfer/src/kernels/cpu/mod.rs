//! Built-in CPU kernels and their registry entries.

mod activation;
mod control_flow;
mod conv;
mod elementwise;
mod reverse_sequence;
mod shape_ops;

pub use activation::ActivationKind;
pub(crate) use shape_ops::unsqueezed_shape;

use crate::tensor::DType;

use super::{KernelDef, KernelRegistry};

const NUMERIC: &[DType] = &[DType::F32, DType::F64, DType::I32, DType::I64];
const FLOATS: &[DType] = &[DType::F32, DType::F64];
const ALL: &[DType] = &[
    DType::F16,
    DType::F32,
    DType::F64,
    DType::I32,
    DType::I64,
    DType::U8,
    DType::Bool,
];

pub fn register_all(registry: &mut KernelRegistry) {
    registry.register_fn(
        KernelDef::build("Add")
            .type_constraint("T", NUMERIC)
            .input_bindings(&["T", "T"])
            .finish(),
        elementwise::add,
    );
    registry.register_fn(
        KernelDef::build("Sub")
            .type_constraint("T", NUMERIC)
            .input_bindings(&["T", "T"])
            .finish(),
        elementwise::sub,
    );
    registry.register_fn(
        KernelDef::build("Mul")
            .type_constraint("T", NUMERIC)
            .input_bindings(&["T", "T"])
            .finish(),
        elementwise::mul,
    );
    registry.register_fn(
        KernelDef::build("Abs")
            .type_constraint("T", NUMERIC)
            .input_bindings(&["T"])
            .finish(),
        elementwise::abs,
    );
    registry.register_fn(
        KernelDef::build("Max")
            .type_constraint("T", NUMERIC)
            .input_bindings(&["T"])
            .finish(),
        elementwise::max,
    );
    registry.register_fn(
        KernelDef::build("Identity")
            .type_constraint("T", ALL)
            .input_bindings(&["T"])
            .finish(),
        shape_ops::identity,
    );

    for op in ["Relu", "Sigmoid", "Softsign", "Tanh", "LeakyRelu"] {
        registry.register(
            KernelDef::build(op)
                .type_constraint("T", FLOATS)
                .input_bindings(&["T"])
                .finish(),
            Box::new(|node| Ok(Box::new(activation::ActivationKernel::try_new(node)?))),
        );
    }

    registry.register(
        KernelDef::build("Cast")
            .type_constraint("T", ALL)
            .input_bindings(&["T"])
            .finish(),
        Box::new(|node| Ok(Box::new(shape_ops::CastKernel::try_new(node)?))),
    );
    registry.register(
        KernelDef::build("Unsqueeze")
            .type_constraint("T", ALL)
            .input_bindings(&["T"])
            .finish(),
        Box::new(|node| Ok(Box::new(shape_ops::UnsqueezeKernel::try_new(node)?))),
    );
    registry.register(
        KernelDef::build("Slice")
            .type_constraint("T", ALL)
            .input_bindings(&["T"])
            .finish(),
        Box::new(|node| Ok(Box::new(shape_ops::SliceKernel::try_new(node)?))),
    );

    registry.register(
        KernelDef::build("Conv")
            .type_constraint("T", FLOATS)
            .input_bindings(&["T", "T", "T"])
            .finish(),
        Box::new(|node| Ok(Box::new(conv::ConvKernel::try_new(node)?))),
    );
    registry.register(
        KernelDef::build("FusedConv")
            .type_constraint("T", FLOATS)
            .input_bindings(&["T", "T", "T"])
            .finish(),
        Box::new(|node| Ok(Box::new(conv::ConvKernel::try_new(node)?))),
    );
    registry.register(
        KernelDef::build("BatchNormalization")
            .versions(1, i64::MAX)
            .type_constraint("T", FLOATS)
            .input_bindings(&["T", "T", "T", "T", "T"])
            .finish(),
        Box::new(|node| Ok(Box::new(conv::BatchNormKernel::try_new(node)?))),
    );

    registry.register(
        KernelDef::build("ReverseSequence")
            .domain("ext")
            .type_constraint(
                "T",
                &[DType::F32, DType::F64, DType::I32, DType::I64, DType::U8],
            )
            .type_constraint("TIndex", &[DType::I32, DType::I64])
            .input_bindings(&["T", "TIndex"])
            .finish(),
        Box::new(|node| Ok(Box::new(reverse_sequence::ReverseSequenceKernel::try_new(node)?))),
    );

    registry.register(
        KernelDef::build("If")
            .type_constraint("B", &[DType::Bool])
            .input_bindings(&["B"])
            .finish(),
        Box::new(control_flow::make_if),
    );
}
