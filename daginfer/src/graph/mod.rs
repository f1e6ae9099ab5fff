//! Computation graph: node arena, initializers, resolution.
//!
//! Nodes live in an arena owned by the graph and are referred to by dense
//! indices everywhere, including rewrites. `resolve()` re-establishes the
//! structural invariants after any mutation and recomputes the topological
//! order and per-name dtypes.

mod attr;
mod infer;

use std::collections::{HashMap, HashSet, VecDeque};

pub use attr::{AttrLookup, AttrMap, AttrValue};

use crate::error::{Error, Result};
use crate::tensor::{DType, TensorValue};

pub type NodeIndex = usize;

/// Declared graph input (or outer-scope input of a subgraph).
#[derive(Debug, Clone)]
pub struct ValueInfo {
    pub name: String,
    pub dtype: DType,
    /// Expected shape; `-1` marks a dynamic extent. `None` = unconstrained.
    pub shape: Option<Vec<i64>>,
}

impl ValueInfo {
    pub fn new(name: impl Into<String>, dtype: DType) -> Self {
        Self {
            name: name.into(),
            dtype,
            shape: None,
        }
    }

    pub fn with_shape(name: impl Into<String>, dtype: DType, shape: Vec<i64>) -> Self {
        Self {
            name: name.into(),
            dtype,
            shape: Some(shape),
        }
    }
}

/// A named operator invocation.
#[derive(Debug, Clone)]
pub struct Node {
    pub name: String,
    pub op_type: String,
    pub domain: String,
    pub since_version: i64,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    /// Names read by attached subgraphs, resolved in the enclosing scope.
    pub implicit_inputs: Vec<String>,
    pub attrs: AttrMap,
    /// Execution provider assigned at plan time.
    pub provider: Option<String>,
}

impl Node {
    pub fn new(
        name: impl Into<String>,
        op_type: impl Into<String>,
        inputs: Vec<String>,
        outputs: Vec<String>,
    ) -> Self {
        Self {
            name: name.into(),
            op_type: op_type.into(),
            domain: String::new(),
            since_version: 1,
            inputs,
            outputs,
            implicit_inputs: Vec::new(),
            attrs: AttrMap::new(),
            provider: None,
        }
    }

    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = domain.into();
        self
    }

    pub fn with_version(mut self, version: i64) -> Self {
        self.since_version = version;
        self
    }

    pub fn with_attr(mut self, name: impl Into<String>, value: AttrValue) -> Self {
        self.attrs.insert(name.into(), value);
        self
    }

    pub fn with_implicit_inputs(mut self, names: Vec<String>) -> Self {
        self.implicit_inputs = names;
        self
    }

    /// All names the node reads, explicit then implicit.
    pub fn all_inputs(&self) -> impl Iterator<Item = &String> {
        self.inputs.iter().chain(self.implicit_inputs.iter())
    }

    pub fn subgraph_attrs(&self) -> impl Iterator<Item = (&String, &Graph)> {
        self.attrs.iter().filter_map(|(name, value)| match value {
            AttrValue::Graph(graph) => Some((name, graph.as_ref())),
            _ => None,
        })
    }
}

impl AttrLookup for Node {
    fn attr(&self, name: &str) -> Option<&AttrValue> {
        self.attrs.get(name)
    }
}

/// The graph: arena of nodes plus initializers and the input/output lists.
#[derive(Debug, Clone, Default)]
pub struct Graph {
    name: String,
    nodes: Vec<Option<Node>>,
    initializers: HashMap<String, TensorValue>,
    inputs: Vec<ValueInfo>,
    /// Names a subgraph resolves from its enclosing scope.
    outer_inputs: Vec<ValueInfo>,
    outputs: Vec<String>,

    resolved: bool,
    topo: Vec<NodeIndex>,
    producer: HashMap<String, NodeIndex>,
    dtypes: HashMap<String, DType>,
}

impl Graph {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn add_input(&mut self, info: ValueInfo) {
        self.resolved = false;
        self.inputs.push(info);
    }

    pub fn add_outer_input(&mut self, info: ValueInfo) {
        self.resolved = false;
        self.outer_inputs.push(info);
    }

    pub fn add_output(&mut self, name: impl Into<String>) {
        self.resolved = false;
        self.outputs.push(name.into());
    }

    pub fn inputs(&self) -> &[ValueInfo] {
        &self.inputs
    }

    pub fn outer_inputs(&self) -> &[ValueInfo] {
        &self.outer_inputs
    }

    pub fn outputs(&self) -> &[String] {
        &self.outputs
    }

    pub fn add_initializer(&mut self, name: impl Into<String>, value: TensorValue) {
        self.resolved = false;
        self.initializers.insert(name.into(), value);
    }

    pub fn remove_initializer(&mut self, name: &str) -> Option<TensorValue> {
        self.resolved = false;
        self.initializers.remove(name)
    }

    pub fn initializer(&self, name: &str) -> Option<&TensorValue> {
        self.initializers.get(name)
    }

    pub fn is_initializer(&self, name: &str) -> bool {
        self.initializers.contains_key(name)
    }

    pub fn initializers(&self) -> impl Iterator<Item = (&String, &TensorValue)> {
        self.initializers.iter()
    }

    pub fn take_initializers(&mut self) -> HashMap<String, TensorValue> {
        self.resolved = false;
        std::mem::take(&mut self.initializers)
    }

    pub fn add_node(&mut self, node: Node) -> NodeIndex {
        self.resolved = false;
        let index = self.nodes.len();
        self.nodes.push(Some(node));
        index
    }

    pub fn remove_node(&mut self, index: NodeIndex) -> Result<Node> {
        self.resolved = false;
        self.nodes
            .get_mut(index)
            .and_then(Option::take)
            .ok_or_else(|| Error::internal(format!("no node at index {}", index)))
    }

    pub fn node(&self, index: NodeIndex) -> Option<&Node> {
        self.nodes.get(index).and_then(Option::as_ref)
    }

    pub fn node_mut(&mut self, index: NodeIndex) -> Option<&mut Node> {
        self.resolved = false;
        self.nodes.get_mut(index).and_then(Option::as_mut)
    }

    pub fn nodes(&self) -> impl Iterator<Item = (NodeIndex, &Node)> {
        self.nodes
            .iter()
            .enumerate()
            .filter_map(|(index, node)| node.as_ref().map(|n| (index, n)))
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.iter().filter(|n| n.is_some()).count()
    }

    pub fn max_node_index(&self) -> usize {
        self.nodes.len()
    }

    /// The node producing `name`, if any. Requires a resolved graph.
    pub fn producer_of(&self, name: &str) -> Option<NodeIndex> {
        self.producer.get(name).copied()
    }

    /// Indices of nodes reading `name` (explicitly or implicitly), with one
    /// entry per use.
    pub fn consumers_of(&self, name: &str) -> Vec<NodeIndex> {
        let mut out = Vec::new();
        for (index, node) in self.nodes() {
            for input in node.all_inputs() {
                if input == name {
                    out.push(index);
                }
            }
        }
        out
    }

    pub fn consumer_count(&self, name: &str) -> usize {
        self.consumers_of(name).len()
    }

    /// Resolved dtype of a name, if known.
    pub fn dtype_of(&self, name: &str) -> Option<DType> {
        self.dtypes.get(name).copied()
    }

    pub fn is_resolved(&self) -> bool {
        self.resolved
    }

    /// Topological order over the node arena. Requires a resolved graph.
    pub fn topo_order(&self) -> Result<&[NodeIndex]> {
        if !self.resolved {
            return Err(Error::internal("graph not resolved"));
        }
        Ok(&self.topo)
    }

    /// True when the node matches the given op type, domain, and version.
    pub fn is_supported_op(node: &Node, op_type: &str, domain: &str, version: i64) -> bool {
        node.op_type == op_type && node.domain == domain && node.since_version == version
    }

    /// True when any output of the node is a graph output.
    pub fn node_output_is_graph_output(&self, node: &Node) -> bool {
        node.outputs.iter().any(|o| self.outputs.contains(o))
    }

    /// Repoint every use of `old` (inputs and implicit inputs of all nodes)
    /// at `new`.
    pub fn replace_uses(&mut self, old: &str, new: &str) {
        self.resolved = false;
        for node in self.nodes.iter_mut().flatten() {
            for input in node.inputs.iter_mut() {
                if input == old {
                    *input = new.to_string();
                }
            }
            for input in node.implicit_inputs.iter_mut() {
                if input == old {
                    *input = new.to_string();
                }
            }
        }
    }

    /// Remove a single-input single-output node, splicing its consumers
    /// onto its input. Fails if the node's output is a graph output.
    pub fn remove_single_in_single_out(&mut self, index: NodeIndex) -> Result<()> {
        let (input, output) = {
            let node = self
                .node(index)
                .ok_or_else(|| Error::internal(format!("no node at index {}", index)))?;
            if node.inputs.len() != 1 || node.outputs.len() != 1 {
                return Err(Error::internal(format!(
                    "node '{}' is not single-in single-out",
                    node.name
                )));
            }
            if self.node_output_is_graph_output(node) {
                return Err(Error::internal(format!(
                    "node '{}' produces a graph output",
                    node.name
                )));
            }
            (node.inputs[0].clone(), node.outputs[0].clone())
        };
        self.replace_uses(&output, &input);
        self.remove_node(index)?;
        Ok(())
    }

    /// Re-establish the structural invariants and recompute topological
    /// order and dtype assignments. Called after every rewrite pass; a
    /// failure here is a hard `InvalidModel` error.
    pub fn resolve(&mut self) -> Result<()> {
        let mut producer: HashMap<String, NodeIndex> = HashMap::new();
        let mut declared: HashSet<&str> = HashSet::new();
        let mut dtypes: HashMap<String, DType> = HashMap::new();

        for info in self.inputs.iter().chain(self.outer_inputs.iter()) {
            if !declared.insert(info.name.as_str()) {
                return Err(Error::invalid_model(format!(
                    "duplicate graph input '{}'",
                    info.name
                )));
            }
            dtypes.insert(info.name.clone(), info.dtype);
        }
        for (name, value) in &self.initializers {
            dtypes.insert(name.clone(), value.dtype());
        }

        // Single-writer check over node outputs.
        for (index, node) in self.nodes.iter().enumerate() {
            let Some(node) = node else { continue };
            for output in &node.outputs {
                if declared.contains(output.as_str()) || self.initializers.contains_key(output) {
                    return Err(Error::invalid_model(format!(
                        "'{}' is written by node '{}' but already declared",
                        output, node.name
                    )));
                }
                if producer.insert(output.clone(), index).is_some() {
                    return Err(Error::invalid_model(format!(
                        "'{}' is written by more than one node",
                        output
                    )));
                }
            }
        }

        // Every read must have a source.
        for node in self.nodes.iter().flatten() {
            for input in node.all_inputs() {
                if input.is_empty() {
                    continue; // optional input left unbound
                }
                let known = producer.contains_key(input)
                    || self.initializers.contains_key(input)
                    || declared.contains(input.as_str());
                if !known {
                    return Err(Error::invalid_model(format!(
                        "node '{}' reads undefined value '{}'",
                        node.name, input
                    )));
                }
            }
        }
        for output in &self.outputs {
            let known = producer.contains_key(output)
                || self.initializers.contains_key(output)
                || declared.contains(output.as_str());
            if !known {
                return Err(Error::invalid_model(format!(
                    "graph output '{}' is not produced",
                    output
                )));
            }
        }

        // Kahn topological sort; any remainder is a cycle.
        let mut in_degree: HashMap<NodeIndex, usize> = HashMap::new();
        let mut successors: HashMap<NodeIndex, Vec<NodeIndex>> = HashMap::new();
        for (index, node) in self.nodes.iter().enumerate() {
            let Some(node) = node else { continue };
            let mut degree = 0usize;
            for input in node.all_inputs() {
                if let Some(&src) = producer.get(input) {
                    degree += 1;
                    successors.entry(src).or_default().push(index);
                }
            }
            in_degree.insert(index, degree);
        }
        let mut ready: Vec<NodeIndex> = in_degree
            .iter()
            .filter(|(_, &d)| d == 0)
            .map(|(&i, _)| i)
            .collect();
        ready.sort_unstable();
        let mut queue: VecDeque<NodeIndex> = ready.into_iter().collect();

        let mut topo = Vec::with_capacity(in_degree.len());
        while let Some(index) = queue.pop_front() {
            topo.push(index);
            if let Some(next) = successors.get(&index) {
                for &succ in next {
                    let entry = in_degree.get_mut(&succ).ok_or_else(|| {
                        Error::internal(format!("missing in-degree for node {}", succ))
                    })?;
                    *entry -= 1;
                    if *entry == 0 {
                        queue.push_back(succ);
                    }
                }
            }
        }
        if topo.len() != in_degree.len() {
            return Err(Error::invalid_model("graph contains a cycle"));
        }

        // Dtype propagation in topological order, recursing into subgraphs.
        for &index in &topo {
            // Subgraphs re-resolve against their declared outer scope first
            // so the node's own inference can read their output dtypes.
            let node = self.nodes[index]
                .as_mut()
                .ok_or_else(|| Error::internal("topo order references removed node"))?;
            for value in node.attrs.values_mut() {
                if let AttrValue::Graph(subgraph) = value {
                    subgraph.resolve()?;
                }
            }
            let node = self.nodes[index]
                .as_ref()
                .ok_or_else(|| Error::internal("topo order references removed node"))?;
            let output_dtypes = infer::infer_node_dtypes(node, &dtypes)?;
            if output_dtypes.len() != node.outputs.len() {
                return Err(Error::invalid_model(format!(
                    "node '{}' inferred {} output dtypes for {} outputs",
                    node.name,
                    output_dtypes.len(),
                    node.outputs.len()
                )));
            }
            for (name, dtype) in node.outputs.iter().zip(output_dtypes.into_iter()) {
                dtypes.insert(name.clone(), dtype);
            }
        }

        self.producer = producer;
        self.dtypes = dtypes;
        self.topo = topo;
        self.resolved = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::Tensor;

    fn abs_node(name: &str, input: &str, output: &str) -> Node {
        Node::new(name, "Abs", vec![input.to_string()], vec![output.to_string()])
    }

    #[test]
    fn resolve_orders_nodes_topologically() {
        let mut graph = Graph::new("g");
        graph.add_input(ValueInfo::new("x", DType::F32));
        graph.add_output("z");
        let b = graph.add_node(abs_node("b", "y", "z"));
        let a = graph.add_node(abs_node("a", "x", "y"));
        graph.resolve().unwrap();
        let topo = graph.topo_order().unwrap();
        let pos = |i| topo.iter().position(|&n| n == i).unwrap();
        assert!(pos(a) < pos(b));
        assert_eq!(graph.dtype_of("z"), Some(DType::F32));
    }

    #[test]
    fn resolve_rejects_cycles() {
        let mut graph = Graph::new("g");
        graph.add_node(abs_node("a", "y", "x"));
        graph.add_node(abs_node("b", "x", "y"));
        let err = graph.resolve().unwrap_err();
        assert!(matches!(err, Error::InvalidModel(_)));
    }

    #[test]
    fn resolve_rejects_double_writes() {
        let mut graph = Graph::new("g");
        graph.add_input(ValueInfo::new("x", DType::F32));
        graph.add_node(abs_node("a", "x", "y"));
        graph.add_node(abs_node("b", "x", "y"));
        assert!(graph.resolve().is_err());
    }

    #[test]
    fn resolve_rejects_undefined_reads() {
        let mut graph = Graph::new("g");
        graph.add_node(abs_node("a", "ghost", "y"));
        assert!(graph.resolve().is_err());
    }

    #[test]
    fn initializers_satisfy_reads() {
        let mut graph = Graph::new("g");
        graph.add_initializer(
            "w",
            TensorValue::F32(Tensor::from_vec(vec![1.0], vec![1]).unwrap()),
        );
        graph.add_output("y");
        graph.add_node(abs_node("a", "w", "y"));
        graph.resolve().unwrap();
    }

    #[test]
    fn single_in_single_out_removal_splices_consumers() {
        let mut graph = Graph::new("g");
        graph.add_input(ValueInfo::new("x", DType::F32));
        graph.add_output("z");
        let id = graph.add_node(Node::new(
            "id",
            "Identity",
            vec!["x".into()],
            vec!["y".into()],
        ));
        graph.add_node(abs_node("a", "y", "z"));
        graph.resolve().unwrap();
        graph.remove_single_in_single_out(id).unwrap();
        graph.resolve().unwrap();
        let (_, a) = graph.nodes().next().unwrap();
        assert_eq!(a.inputs[0], "x");
        assert_eq!(graph.num_nodes(), 1);
    }
}
