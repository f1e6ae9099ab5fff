//! Graph-rewrite engine: transformers, per-node rules, and the
//! fixed-point manager.

mod constant_folding;
mod conv_activation_fusion;
mod conv_add_fusion;
mod conv_bn_fusion;
mod conv_mul_fusion;
mod identity_elimination;
mod initializer;
mod slice_elimination;
mod unsqueeze_elimination;

use std::collections::HashMap;

pub use constant_folding::ConstantFolding;
pub use conv_activation_fusion::ConvActivationFusion;
pub use conv_add_fusion::ConvAddFusion;
pub use conv_bn_fusion::ConvBnFusion;
pub use conv_mul_fusion::ConvMulFusion;
pub use identity_elimination::EliminateIdentity;
pub use slice_elimination::EliminateSlice;
pub use unsqueeze_elimination::UnsqueezeElimination;

pub(crate) use initializer::Initializer;

use crate::error::Result;
use crate::graph::{Graph, NodeIndex};

/// A whole-graph rewrite. Returns whether the graph was modified; a
/// modifying pass must leave the graph resolvable.
pub trait GraphTransformer: Send + Sync {
    fn name(&self) -> &str;
    fn apply(&self, graph: &mut Graph) -> Result<bool>;
}

/// A single-node rewrite: a predicate plus an action. Rules never abort a
/// pass; a violated precondition just skips the node.
pub trait RewriteRule: Send + Sync {
    fn name(&self) -> &str;
    fn satisfies(&self, graph: &Graph, index: NodeIndex) -> bool;
    fn apply(&self, graph: &mut Graph, index: NodeIndex) -> Result<bool>;
}

/// Applies registered rules to matching nodes in topological order.
/// Rules are expected to be confluent; there is no backtracking.
pub struct RuleBasedTransformer {
    name: String,
    by_op: HashMap<String, Vec<Box<dyn RewriteRule>>>,
    any_op: Vec<Box<dyn RewriteRule>>,
}

impl RuleBasedTransformer {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            by_op: HashMap::new(),
            any_op: Vec::new(),
        }
    }

    /// Register a rule triggered only for the given op type.
    pub fn register_for(&mut self, op_type: impl Into<String>, rule: Box<dyn RewriteRule>) {
        self.by_op.entry(op_type.into()).or_default().push(rule);
    }

    /// Register a rule evaluated against every node.
    pub fn register_any(&mut self, rule: Box<dyn RewriteRule>) {
        self.any_op.push(rule);
    }
}

impl GraphTransformer for RuleBasedTransformer {
    fn name(&self) -> &str {
        &self.name
    }

    fn apply(&self, graph: &mut Graph) -> Result<bool> {
        if !graph.is_resolved() {
            graph.resolve()?;
        }
        let order = graph.topo_order()?.to_vec();
        let mut modified = false;
        for index in order {
            let Some(node) = graph.node(index) else {
                continue; // removed by an earlier rule this pass
            };
            let op_rules = self.by_op.get(&node.op_type);
            let rules = self
                .any_op
                .iter()
                .chain(op_rules.into_iter().flatten());
            for rule in rules {
                if graph.node(index).is_none() {
                    break;
                }
                if rule.satisfies(graph, index) {
                    modified |= rule.apply(graph, index)?;
                }
            }
        }
        if modified {
            graph.resolve()?;
        }
        Ok(modified)
    }
}

/// Ordered list of transformers applied to a fixed point.
///
/// Each pass runs every transformer once; passes repeat while any
/// transformer reports a modification, up to `max_steps` passes. This is
/// the only way rewrites are applied.
pub struct GraphTransformerManager {
    transformers: Vec<Box<dyn GraphTransformer>>,
    max_steps: u32,
}

impl GraphTransformerManager {
    pub fn new(max_steps: u32) -> Self {
        Self {
            transformers: Vec::new(),
            max_steps: max_steps.max(1),
        }
    }

    pub fn register(&mut self, transformer: Box<dyn GraphTransformer>) {
        self.transformers.push(transformer);
    }

    pub fn is_empty(&self) -> bool {
        self.transformers.is_empty()
    }

    pub fn apply_all(&self, graph: &mut Graph) -> Result<()> {
        if !graph.is_resolved() {
            graph.resolve()?;
        }
        for step in 0..self.max_steps {
            let mut modified = false;
            for transformer in &self.transformers {
                let changed = transformer.apply(graph)?;
                if changed {
                    crate::trace!("rewrite pass {}: {} modified the graph", step, transformer.name());
                }
                modified |= changed;
            }
            if !modified {
                break;
            }
        }
        if !graph.is_resolved() {
            graph.resolve()?;
        }
        Ok(())
    }
}
