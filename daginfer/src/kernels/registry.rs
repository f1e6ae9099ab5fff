//! Kernel definitions and the per-provider registry.

use std::collections::HashMap;

use crate::error::Result;
use crate::graph::Node;
use crate::tensor::DType;

use super::{Kernel, KernelContext};

/// Describes one kernel implementation: the op it serves, the version
/// range, the provider, its execution queue, and the element types it
/// accepts per input position (named constraints in the ONNX style, so two
/// inputs bound to the same name must agree on dtype).
pub struct KernelDef {
    op_type: String,
    domain: String,
    version_range: (i64, i64),
    provider_type: String,
    queue_id: usize,
    type_constraints: HashMap<String, Vec<DType>>,
    input_bindings: Vec<String>,
}

impl KernelDef {
    pub fn build(op_type: impl Into<String>) -> KernelDefBuilder {
        KernelDefBuilder {
            def: KernelDef {
                op_type: op_type.into(),
                domain: String::new(),
                version_range: (1, i64::MAX),
                provider_type: "cpu".to_string(),
                queue_id: 0,
                type_constraints: HashMap::new(),
                input_bindings: Vec::new(),
            },
        }
    }

    pub fn op_type(&self) -> &str {
        &self.op_type
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn provider_type(&self) -> &str {
        &self.provider_type
    }

    pub fn queue_id(&self) -> usize {
        self.queue_id
    }

    /// Version and per-input dtype match against a node. `dtype_of` maps a
    /// value name to its resolved dtype; unresolved names do not veto.
    pub fn matches(&self, node: &Node, dtype_of: &dyn Fn(&str) -> Option<DType>) -> bool {
        if node.since_version < self.version_range.0 || node.since_version > self.version_range.1 {
            return false;
        }
        let mut bound: HashMap<&str, DType> = HashMap::new();
        for (index, name) in node.inputs.iter().enumerate() {
            if name.is_empty() {
                continue;
            }
            let Some(dtype) = dtype_of(name) else { continue };
            let binding = self
                .input_bindings
                .get(index)
                .or_else(|| self.input_bindings.last());
            let Some(binding) = binding else { continue };
            if let Some(allowed) = self.type_constraints.get(binding) {
                if !allowed.contains(&dtype) {
                    return false;
                }
            }
            match bound.get(binding.as_str()) {
                Some(&prev) if prev != dtype => return false,
                _ => {
                    bound.insert(binding.as_str(), dtype);
                }
            }
        }
        true
    }
}

pub struct KernelDefBuilder {
    def: KernelDef,
}

impl KernelDefBuilder {
    pub fn domain(mut self, domain: impl Into<String>) -> Self {
        self.def.domain = domain.into();
        self
    }

    pub fn versions(mut self, since: i64, until: i64) -> Self {
        self.def.version_range = (since, until);
        self
    }

    pub fn provider(mut self, provider_type: impl Into<String>) -> Self {
        self.def.provider_type = provider_type.into();
        self
    }

    pub fn queue(mut self, queue_id: usize) -> Self {
        self.def.queue_id = queue_id;
        self
    }

    pub fn type_constraint(mut self, name: &str, allowed: &[DType]) -> Self {
        self.def
            .type_constraints
            .insert(name.to_string(), allowed.to_vec());
        self
    }

    /// Constraint name per input position; the last entry repeats for
    /// variadic inputs.
    pub fn input_bindings(mut self, bindings: &[&str]) -> Self {
        self.def.input_bindings = bindings.iter().map(|b| b.to_string()).collect();
        self
    }

    pub fn finish(self) -> KernelDef {
        self.def
    }
}

pub type KernelFactory = Box<dyn Fn(&Node) -> Result<Box<dyn Kernel>> + Send + Sync>;

pub struct KernelEntry {
    pub def: KernelDef,
    factory: KernelFactory,
}

impl KernelEntry {
    pub fn create(&self, node: &Node) -> Result<Box<dyn Kernel>> {
        (self.factory)(node)
    }
}

/// Registry mapping `(op_type, domain)` to candidate kernels.
#[derive(Default)]
pub struct KernelRegistry {
    entries: HashMap<(String, String), Vec<KernelEntry>>,
}

impl KernelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, def: KernelDef, factory: KernelFactory) {
        let key = (def.op_type.clone(), def.domain.clone());
        self.entries
            .entry(key)
            .or_default()
            .push(KernelEntry { def, factory });
    }

    /// Register a stateless compute function under the given definition.
    pub fn register_fn<F>(&mut self, def: KernelDef, compute: F)
    where
        F: Fn(&mut KernelContext<'_>) -> Result<()> + Send + Sync + Copy + 'static,
    {
        struct FnKernel<F>(F);
        impl<F> Kernel for FnKernel<F>
        where
            F: Fn(&mut KernelContext<'_>) -> Result<()> + Send + Sync,
        {
            fn compute(&self, ctx: &mut KernelContext<'_>) -> Result<()> {
                (self.0)(ctx)
            }
        }
        self.register(def, Box::new(move |_node| Ok(Box::new(FnKernel(compute)))));
    }

    /// First registered kernel matching the node, or `None`.
    pub fn find(
        &self,
        node: &Node,
        dtype_of: &dyn Fn(&str) -> Option<DType>,
    ) -> Option<&KernelEntry> {
        let key = (node.op_type.clone(), node.domain.clone());
        self.entries
            .get(&key)?
            .iter()
            .find(|entry| entry.def.matches(node, dtype_of))
    }
}
