//! The context a kernel computes against: lent inputs, accepted outputs,
//! node attributes, the cancellation flag, and subgraph plan handles.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::executor::ExecutionFrame;
use crate::graph::{Node, NodeIndex};
use crate::logging::RunLogger;
use crate::session::SessionState;
use crate::tensor::{TensorValue, Value};

pub struct KernelContext<'a> {
    state: &'a SessionState,
    frame: &'a ExecutionFrame,
    node_index: NodeIndex,
    node: &'a Node,
    terminate: Option<&'a AtomicBool>,
    logger: &'a RunLogger,
}

impl<'a> KernelContext<'a> {
    pub(crate) fn new(
        state: &'a SessionState,
        frame: &'a ExecutionFrame,
        node_index: NodeIndex,
        node: &'a Node,
        terminate: Option<&'a AtomicBool>,
        logger: &'a RunLogger,
    ) -> Self {
        Self {
            state,
            frame,
            node_index,
            node,
            terminate,
            logger,
        }
    }

    pub fn node(&self) -> &Node {
        self.node
    }

    pub fn node_index(&self) -> NodeIndex {
        self.node_index
    }

    pub fn logger(&self) -> &RunLogger {
        self.logger
    }

    pub fn input_count(&self) -> usize {
        self.node.inputs.len()
    }

    pub fn output_count(&self) -> usize {
        self.node.outputs.len()
    }

    /// Borrow input `index`. Optional inputs left unbound are an error
    /// here; use `opt_input` for those.
    pub fn input(&self, index: usize) -> Result<&TensorValue> {
        self.opt_input(index)?.ok_or_else(|| {
            Error::invalid_argument(format!(
                "node '{}' input {} is not bound",
                self.node.name, index
            ))
        })
    }

    pub fn opt_input(&self, index: usize) -> Result<Option<&TensorValue>> {
        let Some(name) = self.node.inputs.get(index) else {
            return Ok(None);
        };
        if name.is_empty() {
            return Ok(None);
        }
        let slot = self.state.slot_of(name)?;
        match self.frame.value(slot) {
            Some(value) => value.as_tensor().map(Some),
            None => Err(Error::internal(format!(
                "node '{}' fired before input '{}' was written",
                self.node.name, name
            ))),
        }
    }

    /// Shared handle to input `index` for zero-copy pass-through.
    pub fn input_value(&self, index: usize) -> Result<Value> {
        let name = self.node.inputs.get(index).ok_or_else(|| {
            Error::invalid_argument(format!(
                "node '{}' has no input {}",
                self.node.name, index
            ))
        })?;
        let slot = self.state.slot_of(name)?;
        self.frame
            .value(slot)
            .cloned()
            .ok_or_else(|| Error::internal(format!("input '{}' not written", name)))
    }

    /// A value visible to this node's subgraphs from the enclosing scope.
    pub fn implicit_value(&self, name: &str) -> Result<Value> {
        let slot = self.state.slot_of(name)?;
        self.frame
            .value(slot)
            .cloned()
            .ok_or_else(|| Error::internal(format!("implicit input '{}' not written", name)))
    }

    /// Publish output `index`. The value's allocator identity is stamped
    /// from the plan. Each output slot accepts exactly one write per run.
    pub fn set_output(&mut self, index: usize, mut tensor: TensorValue) -> Result<()> {
        let slot = self.output_slot(index)?;
        tensor.set_location(self.state.slot_location(slot).clone());
        self.frame.set_value(slot, Value::from_tensor(tensor))
    }

    /// Publish an already-shared value (identity-style pass-through).
    pub fn set_output_value(&mut self, index: usize, value: Value) -> Result<()> {
        let slot = self.output_slot(index)?;
        self.frame.set_value(slot, value)
    }

    fn output_slot(&self, index: usize) -> Result<usize> {
        let name = self.node.outputs.get(index).ok_or_else(|| {
            Error::invalid_argument(format!(
                "node '{}' has no output {}",
                self.node.name, index
            ))
        })?;
        self.state.slot_of(name)
    }

    /// Cooperative-cancellation flag, checked by long-running kernels.
    pub fn is_cancelled(&self) -> bool {
        self.terminate
            .map(|flag| flag.load(Ordering::Relaxed))
            .unwrap_or(false)
    }

    /// Plan of the subgraph stored under `(this node, attr_name)`.
    pub fn subgraph_state(&self, attr_name: &str) -> Result<&Arc<SessionState>> {
        self.state.subgraph_state(self.node_index, attr_name)
    }

    /// Run the named subgraph to completion on the current thread, feeding
    /// its outer-scope names from this frame, and return its outputs.
    pub fn execute_subgraph(&self, attr_name: &str) -> Result<Vec<Value>> {
        let sub_state = self.subgraph_state(attr_name)?.clone();
        let mut outer = Vec::new();
        for info in sub_state.graph().outer_inputs() {
            outer.push((info.name.clone(), self.implicit_value(&info.name)?));
        }
        crate::executor::run_nested(&sub_state, outer, self.terminate, self.logger)
    }
}
