//! Per-run value store.
//!
//! One `OnceLock` cell per slot: initializers and feeds are installed at
//! frame construction, activations are written exactly once by their
//! producing node, and readers get the release/acquire edge from the cell
//! itself. The whole frame is dropped at end of run, which releases every
//! activation buffer.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use crate::error::{Error, Result};
use crate::graph::NodeIndex;
use crate::provider::Fence;
use crate::session::{SessionState, SlotId};
use crate::tensor::{MemKind, TensorValue, Value};

pub struct ExecutionFrame {
    state: Arc<SessionState>,
    slots: Vec<OnceLock<Value>>,
    fences: Vec<Option<Arc<dyn Fence>>>,
    /// Nodes in the sub-DAG feeding the requested outputs.
    reachable: Vec<bool>,
}

impl ExecutionFrame {
    /// Validate and stage the feeds, mark the sub-DAG feeding the
    /// requested outputs, and install per-slot fences.
    pub fn new(
        state: Arc<SessionState>,
        feeds: HashMap<String, Value>,
        output_names: &[String],
    ) -> Result<Self> {
        let num_slots = state.num_slots();
        let mut slots = Vec::with_capacity(num_slots);
        slots.resize_with(num_slots, OnceLock::new);

        let mut fences: Vec<Option<Arc<dyn Fence>>> = vec![None; num_slots];
        for slot in 0..num_slots {
            if let Some(provider) = state.fence_provider(slot) {
                fences[slot] = provider.create_fence();
            }
        }

        // Initializer slots are shared with the plan, never copied.
        for slot in 0..num_slots {
            if let Some(value) = state.initializer_value(slot) {
                let _ = slots[slot].set(Value::Tensor(value.clone()));
            }
        }

        let mut fed: Vec<bool> = vec![false; num_slots];
        for (name, value) in feeds {
            let info = state.input_info(&name).ok_or_else(|| {
                Error::invalid_argument(format!("'{}' is not a graph input", name))
            })?;
            let slot = state.slot_of(&name)?;
            let staged = stage_feed(&state, slot, &name, value, info)?;
            fed[slot] = true;
            slots[slot].set(staged).map_err(|_| {
                Error::invalid_argument(format!("feed '{}' supplied twice", name))
            })?;
        }

        let reachable = mark_reachable(&state, output_names)?;

        // Every graph input consumed by a reachable node must be fed.
        for info in state.input_infos() {
            let slot = state.slot_of(&info.name)?;
            if fed[slot] || state.initializer_value(slot).is_some() {
                continue;
            }
            let consumed = state
                .topo()
                .iter()
                .filter(|&&index| reachable[index])
                .any(|&index| {
                    state.node_io(index).map_or(false, |io| {
                        io.inputs.iter().flatten().any(|&s| s == slot)
                            || io.implicit.contains(&slot)
                    })
                });
            let requested = output_names.iter().any(|n| n == &info.name);
            if consumed || requested {
                return Err(Error::invalid_argument(format!(
                    "missing feed for graph input '{}'",
                    info.name
                )));
            }
        }

        Ok(Self {
            state,
            slots,
            fences,
            reachable,
        })
    }

    /// Frame for a nested subgraph run: outer-scope values are installed
    /// directly and every node is in scope.
    pub(crate) fn nested(
        state: Arc<SessionState>,
        outer: Vec<(String, Value)>,
    ) -> Result<Self> {
        let num_slots = state.num_slots();
        let mut slots = Vec::with_capacity(num_slots);
        slots.resize_with(num_slots, OnceLock::new);
        for slot in 0..num_slots {
            if let Some(value) = state.initializer_value(slot) {
                let _ = slots[slot].set(Value::Tensor(value.clone()));
            }
        }
        for (name, value) in outer {
            let slot = state.slot_of(&name)?;
            slots[slot].set(value).map_err(|_| {
                Error::internal(format!("outer value '{}' installed twice", name))
            })?;
        }
        let fences = vec![None; num_slots];
        let reachable = vec![true; state.in_degree().len()];
        Ok(Self {
            state,
            slots,
            fences,
            reachable,
        })
    }

    pub fn state(&self) -> &Arc<SessionState> {
        &self.state
    }

    pub fn value(&self, slot: SlotId) -> Option<&Value> {
        self.slots.get(slot).and_then(OnceLock::get)
    }

    /// Write-once slot store; a second write is an invariant violation.
    pub fn set_value(&self, slot: SlotId, value: Value) -> Result<()> {
        self.slots
            .get(slot)
            .ok_or_else(|| Error::internal(format!("slot {} out of range", slot)))?
            .set(value)
            .map_err(|_| {
                Error::internal(format!(
                    "slot '{}' written twice in one run",
                    self.state.slot_name(slot)
                ))
            })
    }

    pub fn fence(&self, slot: SlotId) -> Option<&Arc<dyn Fence>> {
        self.fences.get(slot).and_then(Option::as_ref)
    }

    pub fn is_reachable(&self, index: NodeIndex) -> bool {
        self.reachable.get(index).copied().unwrap_or(false)
    }

    /// Fetch a requested output after the run drained.
    pub fn fetch(&self, name: &str) -> Result<Value> {
        let slot = self.state.slot_of(name).map_err(|_| {
            Error::invalid_argument(format!("unknown output name '{}'", name))
        })?;
        self.value(slot).cloned().ok_or_else(|| {
            Error::internal(format!("output '{}' was not produced", name))
        })
    }
}

/// Validate a feed against the declared graph input and copy it to the
/// consuming provider's allocator when it lives elsewhere.
fn stage_feed(
    state: &SessionState,
    slot: SlotId,
    name: &str,
    value: Value,
    info: &crate::graph::ValueInfo,
) -> Result<Value> {
    let tensor = value.as_tensor()?;
    if tensor.dtype() != info.dtype {
        return Err(Error::invalid_argument(format!(
            "feed '{}' has dtype {}, graph input declares {}",
            name,
            tensor.dtype(),
            info.dtype
        )));
    }
    if let Some(declared) = &info.shape {
        let actual = tensor.shape();
        let matches = declared.len() == actual.len()
            && declared
                .iter()
                .zip(actual.iter())
                .all(|(&d, &a)| d < 0 || d as usize == a);
        if !matches {
            return Err(Error::invalid_argument(format!(
                "feed '{}' has shape {:?}, graph input declares {:?}",
                name,
                tensor.shape(),
                declared
            )));
        }
    }

    let target = state.slot_location(slot);
    if tensor.location() == target {
        return Ok(value);
    }
    let provider = state
        .provider_by_type(&target.provider)
        .ok_or_else(|| {
            Error::internal(format!("no provider '{}' for feed staging", target.provider))
        })?;
    let allocator = provider.allocator(target.device_id, MemKind::Default);
    let bytes = allocator.allocate(tensor.nbytes())?;
    let mut dst = TensorValue::from_bytes(tensor.dtype(), tensor.shape().to_vec(), &bytes)?;
    dst.set_location(allocator.info().clone());
    provider.copy_tensor(tensor, &mut dst)?;
    Ok(Value::from_tensor(dst))
}

/// Reverse reachability from the requested outputs over the plan.
fn mark_reachable(state: &SessionState, output_names: &[String]) -> Result<Vec<bool>> {
    let mut reachable = vec![false; state.in_degree().len()];
    let mut stack: Vec<NodeIndex> = Vec::new();
    for name in output_names {
        // Unknown names surface as invalid-argument before any node fires.
        state.slot_of(name).map_err(|_| {
            Error::invalid_argument(format!("unknown output name '{}'", name))
        })?;
        if let Some(producer) = state.producer_of(name) {
            if !reachable[producer] {
                reachable[producer] = true;
                stack.push(producer);
            }
        }
    }
    while let Some(index) = stack.pop() {
        let node = state.node(index)?;
        for input in node.all_inputs() {
            if let Some(producer) = state.producer_of(input) {
                if !reachable[producer] {
                    reachable[producer] = true;
                    stack.push(producer);
                }
            }
        }
    }
    Ok(reachable)
}
