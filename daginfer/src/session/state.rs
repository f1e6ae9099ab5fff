//! The execution plan: everything `initialize` derives from the rewritten
//! graph, immutable afterwards and shared by every run.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::graph::{AttrValue, Graph, Node, NodeIndex, ValueInfo};
use crate::kernels::Kernel;
use crate::provider::ExecutionProvider;
use crate::tensor::{DType, MemKind, MemoryInfo, TensorValue};

pub type SlotId = usize;

/// Pre-resolved slot ids for one node's reads and writes.
#[derive(Debug, Clone)]
pub struct NodeIo {
    /// `None` marks an optional input left unbound.
    pub inputs: Vec<Option<SlotId>>,
    pub implicit: Vec<SlotId>,
    pub outputs: Vec<SlotId>,
}

pub struct SessionState {
    graph: Graph,
    providers: Vec<Arc<dyn ExecutionProvider>>,

    slot_names: Vec<String>,
    name_to_slot: HashMap<String, SlotId>,
    initializer_values: Vec<Option<Arc<TensorValue>>>,
    slot_locations: Vec<MemoryInfo>,
    /// Provider (by index) asked to create the slot's fence at run time.
    slot_fence_provider: Vec<Option<usize>>,

    topo: Vec<NodeIndex>,
    in_degree: Vec<i32>,
    successors: Vec<Vec<NodeIndex>>,
    node_provider: Vec<Option<usize>>,
    node_queue: Vec<usize>,
    node_io: Vec<Option<NodeIo>>,
    kernels: Vec<Option<Box<dyn Kernel>>>,

    input_infos: HashMap<String, ValueInfo>,
    subgraph_states: HashMap<(NodeIndex, String), Arc<SessionState>>,
}

impl SessionState {
    /// Build the plan for a resolved graph: assign providers (inserting
    /// casts where an f16 path feeds an f32-only kernel), allocate slots,
    /// compute topological order and in-degrees, install fences on
    /// cross-provider edges, instantiate kernels, and recurse into
    /// subgraphs.
    pub fn build(mut graph: Graph, providers: Vec<Arc<dyn ExecutionProvider>>) -> Result<Self> {
        if providers.is_empty() {
            return Err(Error::invalid_argument("no execution providers registered"));
        }
        graph.resolve()?;

        let node_provider = assign_providers(&mut graph, &providers)?;
        let arena = graph.max_node_index();

        // Dense slot ids, in a deterministic first-sight order.
        let mut slot_names: Vec<String> = Vec::new();
        let mut name_to_slot: HashMap<String, SlotId> = HashMap::new();
        let intern = |name: &str, slot_names: &mut Vec<String>,
                          name_to_slot: &mut HashMap<String, SlotId>|
         -> SlotId {
            if let Some(&slot) = name_to_slot.get(name) {
                return slot;
            }
            let slot = slot_names.len();
            slot_names.push(name.to_string());
            name_to_slot.insert(name.to_string(), slot);
            slot
        };
        for info in graph.inputs().iter().chain(graph.outer_inputs().iter()) {
            intern(&info.name, &mut slot_names, &mut name_to_slot);
        }
        let mut initializer_names: Vec<String> =
            graph.initializers().map(|(name, _)| name.clone()).collect();
        initializer_names.sort_unstable();
        for name in &initializer_names {
            intern(name, &mut slot_names, &mut name_to_slot);
        }
        let topo: Vec<NodeIndex> = graph.topo_order()?.to_vec();
        for &index in &topo {
            let node = graph
                .node(index)
                .ok_or_else(|| Error::internal("topo order references removed node"))?;
            for name in node.all_inputs() {
                if !name.is_empty() {
                    intern(name, &mut slot_names, &mut name_to_slot);
                }
            }
            for name in &node.outputs {
                intern(name, &mut slot_names, &mut name_to_slot);
            }
        }

        // Per-node io resolution.
        let mut node_io: Vec<Option<NodeIo>> = vec![None; arena];
        for &index in &topo {
            let node = graph.node(index).ok_or_else(|| {
                Error::internal("topo order references removed node")
            })?;
            let inputs = node
                .inputs
                .iter()
                .map(|name| {
                    if name.is_empty() {
                        None
                    } else {
                        name_to_slot.get(name).copied()
                    }
                })
                .collect();
            let implicit = node
                .implicit_inputs
                .iter()
                .filter_map(|name| name_to_slot.get(name).copied())
                .collect();
            let outputs = node
                .outputs
                .iter()
                .filter_map(|name| name_to_slot.get(name).copied())
                .collect();
            node_io[index] = Some(NodeIo {
                inputs,
                implicit,
                outputs,
            });
        }

        // In-degree counts one per consumed producer edge; the successor
        // list mirrors it so the executor's decrements line up.
        let mut in_degree = vec![0i32; arena];
        let mut successors: Vec<Vec<NodeIndex>> = vec![Vec::new(); arena];
        for &index in &topo {
            let node = graph
                .node(index)
                .ok_or_else(|| Error::internal("topo order references removed node"))?;
            for name in node.all_inputs() {
                if let Some(producer) = graph.producer_of(name) {
                    in_degree[index] += 1;
                    successors[producer].push(index);
                }
            }
        }

        // Slot allocator identities: a produced slot lives on its
        // producer's allocator, a graph input on its first consumer's.
        let num_slots = slot_names.len();
        let mut slot_locations = vec![MemoryInfo::cpu(); num_slots];
        for &index in &topo {
            let node = graph
                .node(index)
                .ok_or_else(|| Error::internal("topo order references removed node"))?;
            let provider = &providers[node_provider[index]
                .ok_or_else(|| Error::internal("unassigned node survived planning"))?];
            let info = provider.allocator(0, MemKind::Default).info().clone();
            let io = node_io[index]
                .as_ref()
                .ok_or_else(|| Error::internal("missing node io"))?;
            for &slot in &io.outputs {
                slot_locations[slot] = info.clone();
            }
        }
        for info in graph.inputs() {
            if let Some(&slot) = name_to_slot.get(&info.name) {
                if let Some(&consumer) = graph.consumers_of(&info.name).first() {
                    if let Some(provider_index) = node_provider[consumer] {
                        slot_locations[slot] = providers[provider_index]
                            .allocator(0, MemKind::Default)
                            .info()
                            .clone();
                    }
                }
            }
        }

        // Fences on cross-provider edges: prefer the producing provider's
        // fence factory, fall back to the consumer's.
        let mut slot_fence_provider = vec![None; num_slots];
        for &index in &topo {
            let node = graph
                .node(index)
                .ok_or_else(|| Error::internal("topo order references removed node"))?;
            let consumer_provider = node_provider[index]
                .ok_or_else(|| Error::internal("unassigned node survived planning"))?;
            for name in node.all_inputs() {
                let Some(producer) = graph.producer_of(name) else { continue };
                let producer_provider = node_provider[producer]
                    .ok_or_else(|| Error::internal("unassigned node survived planning"))?;
                if producer_provider == consumer_provider {
                    continue;
                }
                let slot = name_to_slot[name.as_str()];
                let chosen = if providers[producer_provider].create_fence().is_some() {
                    producer_provider
                } else {
                    consumer_provider
                };
                slot_fence_provider[slot] = Some(chosen);
            }
        }

        // Kernel instantiation and queue lookup.
        let mut kernels: Vec<Option<Box<dyn Kernel>>> = Vec::with_capacity(arena);
        kernels.resize_with(arena, || None);
        let mut node_queue = vec![0usize; arena];
        for &index in &topo {
            let node = graph
                .node(index)
                .ok_or_else(|| Error::internal("topo order references removed node"))?;
            let provider = &providers[node_provider[index]
                .ok_or_else(|| Error::internal("unassigned node survived planning"))?];
            let registry = provider.kernel_registry();
            let dtype_of = |name: &str| graph.dtype_of(name);
            let entry = registry.find(node, &dtype_of).ok_or_else(|| {
                Error::invalid_model(format!(
                    "no kernel for node '{}' ({}) on provider '{}'",
                    node.name,
                    node.op_type,
                    provider.provider_type()
                ))
            })?;
            node_queue[index] = entry.def.queue_id();
            kernels[index] = Some(entry.create(node)?);
        }

        // Prepack initializer inputs into the kernels that want them.
        for &index in &topo {
            let node = graph
                .node(index)
                .ok_or_else(|| Error::internal("topo order references removed node"))?;
            let packs: Vec<(usize, String)> = node
                .inputs
                .iter()
                .enumerate()
                .filter(|(_, name)| graph.is_initializer(name))
                .map(|(i, name)| (i, name.clone()))
                .collect();
            if packs.is_empty() {
                continue;
            }
            let kernel = kernels[index]
                .as_mut()
                .ok_or_else(|| Error::internal("kernel missing after instantiation"))?;
            for (input_index, name) in packs {
                let value = graph
                    .initializer(&name)
                    .ok_or_else(|| Error::internal("initializer disappeared"))?;
                kernel.prepack(input_index, value)?;
            }
        }

        // Subgraph plans, keyed (node index, attribute name).
        let mut subgraph_states: HashMap<(NodeIndex, String), Arc<SessionState>> = HashMap::new();
        for &index in &topo {
            let node = graph
                .node(index)
                .ok_or_else(|| Error::internal("topo order references removed node"))?;
            let implicit: HashSet<&str> =
                node.implicit_inputs.iter().map(String::as_str).collect();
            let subgraphs: Vec<(String, Graph)> = node
                .subgraph_attrs()
                .map(|(name, sub)| (name.clone(), sub.clone()))
                .collect();
            for (attr_name, sub) in subgraphs {
                for outer in sub.outer_inputs() {
                    if !implicit.contains(outer.name.as_str()) {
                        return Err(Error::invalid_model(format!(
                            "subgraph '{}' of node '{}' reads '{}' which is not an implicit input",
                            attr_name, node.name, outer.name
                        )));
                    }
                }
                let sub_state = SessionState::build(sub, providers.clone())?;
                subgraph_states.insert((index, attr_name), Arc::new(sub_state));
            }
        }

        // Initializer values move into the shared slot table; runs clone
        // the Arc, never the buffer.
        let mut initializer_values: Vec<Option<Arc<TensorValue>>> = vec![None; num_slots];
        for (name, value) in graph.take_initializers() {
            let slot = name_to_slot[name.as_str()];
            initializer_values[slot] = Some(Arc::new(value));
        }

        let input_infos = graph
            .inputs()
            .iter()
            .map(|info| (info.name.clone(), info.clone()))
            .collect();

        Ok(Self {
            graph,
            providers,
            slot_names,
            name_to_slot,
            initializer_values,
            slot_locations,
            slot_fence_provider,
            topo,
            in_degree,
            successors,
            node_provider,
            node_queue,
            node_io,
            kernels,
            input_infos,
            subgraph_states,
        })
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn num_slots(&self) -> usize {
        self.slot_names.len()
    }

    pub fn slot_of(&self, name: &str) -> Result<SlotId> {
        self.name_to_slot
            .get(name)
            .copied()
            .ok_or_else(|| Error::invalid_argument(format!("unknown value name '{}'", name)))
    }

    pub fn slot_name(&self, slot: SlotId) -> &str {
        &self.slot_names[slot]
    }

    pub fn slot_location(&self, slot: SlotId) -> &MemoryInfo {
        &self.slot_locations[slot]
    }

    pub fn initializer_value(&self, slot: SlotId) -> Option<&Arc<TensorValue>> {
        self.initializer_values.get(slot).and_then(Option::as_ref)
    }

    pub fn topo(&self) -> &[NodeIndex] {
        &self.topo
    }

    pub fn in_degree(&self) -> &[i32] {
        &self.in_degree
    }

    pub fn successors(&self, index: NodeIndex) -> &[NodeIndex] {
        &self.successors[index]
    }

    pub fn node(&self, index: NodeIndex) -> Result<&Node> {
        self.graph
            .node(index)
            .ok_or_else(|| Error::internal(format!("no node at index {}", index)))
    }

    pub fn node_io(&self, index: NodeIndex) -> Result<&NodeIo> {
        self.node_io
            .get(index)
            .and_then(Option::as_ref)
            .ok_or_else(|| Error::internal(format!("no io for node {}", index)))
    }

    pub fn kernel(&self, index: NodeIndex) -> Result<&dyn Kernel> {
        self.kernels
            .get(index)
            .and_then(Option::as_ref)
            .map(Box::as_ref)
            .ok_or_else(|| Error::internal(format!("no kernel for node {}", index)))
    }

    pub fn provider_of_node(&self, index: NodeIndex) -> Result<&Arc<dyn ExecutionProvider>> {
        let provider = self
            .node_provider
            .get(index)
            .and_then(|p| *p)
            .ok_or_else(|| Error::internal(format!("no provider for node {}", index)))?;
        Ok(&self.providers[provider])
    }

    pub fn queue_of_node(&self, index: NodeIndex) -> usize {
        self.node_queue[index]
    }

    pub fn fence_provider(&self, slot: SlotId) -> Option<&Arc<dyn ExecutionProvider>> {
        self.slot_fence_provider[slot].map(|p| &self.providers[p])
    }

    pub fn providers(&self) -> &[Arc<dyn ExecutionProvider>] {
        &self.providers
    }

    pub fn provider_by_type(&self, provider_type: &str) -> Option<&Arc<dyn ExecutionProvider>> {
        self.providers
            .iter()
            .find(|p| p.provider_type() == provider_type)
    }

    pub fn input_info(&self, name: &str) -> Option<&ValueInfo> {
        self.input_infos.get(name)
    }

    pub fn input_infos(&self) -> impl Iterator<Item = &ValueInfo> {
        self.input_infos.values()
    }

    pub fn subgraph_state(
        &self,
        index: NodeIndex,
        attr_name: &str,
    ) -> Result<&Arc<SessionState>> {
        self.subgraph_states
            .get(&(index, attr_name.to_string()))
            .ok_or_else(|| {
                Error::internal(format!(
                    "no subgraph plan for node {} attribute '{}'",
                    index, attr_name
                ))
            })
    }

    /// Node producing the named value, if any.
    pub fn producer_of(&self, name: &str) -> Option<NodeIndex> {
        self.graph.producer_of(name)
    }
}

/// Assign each node a provider in registration order. A node whose f16
/// signature matches nothing but whose f32 signature does gets `Cast`
/// nodes spliced around it and assignment restarts.
fn assign_providers(
    graph: &mut Graph,
    providers: &[Arc<dyn ExecutionProvider>],
) -> Result<Vec<Option<usize>>> {
    loop {
        let mut assignment: Vec<Option<usize>> = vec![None; graph.max_node_index()];
        let mut cast_candidates: Vec<NodeIndex> = Vec::new();

        let topo: Vec<NodeIndex> = graph.topo_order()?.to_vec();
        for &index in &topo {
            let node = graph
                .node(index)
                .ok_or_else(|| Error::internal("topo order references removed node"))?;
            let dtype_of = |name: &str| graph.dtype_of(name);
            let found = providers.iter().position(|provider| {
                provider.kernel_registry().find(node, &dtype_of).is_some()
            });
            match found {
                Some(provider) => assignment[index] = Some(provider),
                None => {
                    // Retry the match with f16 inputs widened to f32.
                    let widened = |name: &str| match graph.dtype_of(name) {
                        Some(DType::F16) => Some(DType::F32),
                        other => other,
                    };
                    let widens = providers.iter().any(|provider| {
                        provider.kernel_registry().find(node, &widened).is_some()
                    });
                    if widens {
                        cast_candidates.push(index);
                    } else {
                        return Err(Error::invalid_model(format!(
                            "no kernel for node '{}' ({}) on any registered provider",
                            node.name, node.op_type
                        )));
                    }
                }
            }
        }

        if cast_candidates.is_empty() {
            // Record the assignment on the nodes for observability.
            for &index in &topo {
                if let (Some(provider), Some(node)) =
                    (assignment[index], graph.node_mut(index))
                {
                    node.provider = Some(providers[provider].provider_type().to_string());
                }
            }
            graph.resolve()?;
            return Ok(assignment);
        }

        for index in cast_candidates {
            insert_casts_around(graph, index)?;
        }
        graph.resolve()?;
    }
}

/// Wrap an f16-fed node with `Cast` nodes so an f32 kernel can serve it.
fn insert_casts_around(graph: &mut Graph, index: NodeIndex) -> Result<()> {
    let node = graph
        .node(index)
        .ok_or_else(|| Error::internal(format!("no node at index {}", index)))?;
    let node_name = node.name.clone();
    let f16_inputs: Vec<(usize, String)> = node
        .inputs
        .iter()
        .enumerate()
        .filter(|(_, name)| graph.dtype_of(name) == Some(DType::F16))
        .map(|(i, name)| (i, name.clone()))
        .collect();
    let outputs: Vec<String> = node.outputs.clone();

    for (input_index, input_name) in f16_inputs {
        let cast_output = format!("{}_in{}_f32", node_name, input_index);
        graph.add_node(
            Node::new(
                format!("{}_cast_in{}", node_name, input_index),
                "Cast",
                vec![input_name],
                vec![cast_output.clone()],
            )
            .with_attr("to", AttrValue::DType(DType::F32)),
        );
        let node = graph
            .node_mut(index)
            .ok_or_else(|| Error::internal("node disappeared during cast insertion"))?;
        node.inputs[input_index] = cast_output;
    }

    for (output_index, output_name) in outputs.iter().enumerate() {
        if graph.dtype_of(output_name) != Some(DType::F16) {
            continue;
        }
        let wide_name = format!("{}_out{}_f32", node_name, output_index);
        {
            let node = graph
                .node_mut(index)
                .ok_or_else(|| Error::internal("node disappeared during cast insertion"))?;
            node.outputs[output_index] = wide_name.clone();
        }
        graph.add_node(
            Node::new(
                format!("{}_cast_out{}", node_name, output_index),
                "Cast",
                vec![wide_name],
                vec![output_name.clone()],
            )
            .with_attr("to", AttrValue::DType(DType::F16)),
        );
    }
    Ok(())
}
