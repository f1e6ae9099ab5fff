//! The `DGIR` model container.
//!
//! Layout: a fixed header (magic, version, section sizes), a JSON graph
//! document, then an 8-byte-aligned raw weight section referenced by
//! offset from the document. Files are read through a memory map and
//! validated (magic, version, bounds, alignment) before any tensor is
//! materialised.

use std::collections::BTreeMap;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use memmap2::Mmap;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::graph::{AttrValue, Graph, Node, ValueInfo};
use crate::tensor::{DType, TensorValue};

const MAGIC: &[u8; 4] = b"DGIR";
const VERSION: u32 = 1;
const HEADER_SIZE: usize = 4 + 4 + 8 + 8 + 8;

#[derive(Debug, Serialize, Deserialize)]
struct ValueInfoDoc {
    name: String,
    dtype: DType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    shape: Option<Vec<i64>>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
enum AttrDoc {
    Float(f32),
    Int(i64),
    Str(String),
    Floats(Vec<f32>),
    Ints(Vec<i64>),
    DType(DType),
    Graph(GraphDoc),
}

#[derive(Debug, Serialize, Deserialize)]
struct NodeDoc {
    name: String,
    op_type: String,
    #[serde(default)]
    domain: String,
    since_version: i64,
    inputs: Vec<String>,
    outputs: Vec<String>,
    #[serde(default)]
    implicit_inputs: Vec<String>,
    #[serde(default)]
    attrs: BTreeMap<String, AttrDoc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct InitializerDoc {
    name: String,
    dtype: DType,
    dims: Vec<u64>,
    offset: u64,
    nbytes: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct GraphDoc {
    name: String,
    inputs: Vec<ValueInfoDoc>,
    #[serde(default)]
    outer_inputs: Vec<ValueInfoDoc>,
    outputs: Vec<String>,
    nodes: Vec<NodeDoc>,
    #[serde(default)]
    initializers: Vec<InitializerDoc>,
}

/// A loaded model: the graph plus nothing else; weights are already
/// materialised as graph initializers.
#[derive(Debug, Clone)]
pub struct Model {
    graph: Graph,
}

impl Model {
    pub fn from_graph(graph: Graph) -> Self {
        Self { graph }
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn into_graph(self) -> Graph {
        self.graph
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path.as_ref())
            .map_err(|err| Error::invalid_argument(format!("open model file: {}", err)))?;
        let mmap = unsafe {
            Mmap::map(&file)
                .map_err(|err| Error::invalid_argument(format!("map model file: {}", err)))?
        };
        let mmap = Arc::new(mmap);
        Self::parse(&mmap[..])
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Self::parse(bytes)
    }

    fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_SIZE {
            return Err(Error::invalid_model("file too small for DGIR header"));
        }
        if &data[0..4] != MAGIC {
            return Err(Error::invalid_model("invalid DGIR magic"));
        }
        let version = u32::from_le_bytes(data[4..8].try_into().unwrap_or([0; 4]));
        if version != VERSION {
            return Err(Error::invalid_model(format!(
                "unsupported DGIR version {}",
                version
            )));
        }
        let json_len = read_u64(data, 8)? as usize;
        let data_offset = read_u64(data, 16)? as usize;
        let file_size = read_u64(data, 24)? as usize;
        if file_size != data.len() {
            return Err(Error::invalid_model("DGIR file size mismatch"));
        }
        if data_offset % 8 != 0 {
            return Err(Error::invalid_model("DGIR data section not aligned"));
        }
        let json_end = HEADER_SIZE
            .checked_add(json_len)
            .ok_or_else(|| Error::invalid_model("DGIR json length overflow"))?;
        if json_end > data_offset || data_offset > file_size {
            return Err(Error::invalid_model("DGIR section offsets out of order"));
        }
        let doc: GraphDoc = serde_json::from_slice(&data[HEADER_SIZE..json_end])
            .map_err(|err| Error::invalid_model(format!("DGIR graph document: {}", err)))?;
        let weights = &data[data_offset..];
        let graph = graph_from_doc(doc, weights)?;
        Ok(Self { graph })
    }

    /// Write the container. Weights land in the aligned data section; the
    /// rest of the graph is the JSON document.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut weights: Vec<u8> = Vec::new();
        let doc = graph_to_doc(&self.graph, &mut weights);
        let json = serde_json::to_vec(&doc)
            .map_err(|err| Error::internal(format!("DGIR serialization: {}", err)))?;

        let data_offset = align_up(HEADER_SIZE + json.len(), 8);
        let file_size = data_offset + weights.len();
        let mut out = Vec::with_capacity(file_size);
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&VERSION.to_le_bytes());
        out.extend_from_slice(&(json.len() as u64).to_le_bytes());
        out.extend_from_slice(&(data_offset as u64).to_le_bytes());
        out.extend_from_slice(&(file_size as u64).to_le_bytes());
        out.extend_from_slice(&json);
        out.resize(data_offset, 0);
        out.extend_from_slice(&weights);
        std::fs::write(path.as_ref(), out)
            .map_err(|err| Error::internal(format!("write model file: {}", err)))?;
        Ok(())
    }
}

fn read_u64(data: &[u8], offset: usize) -> Result<u64> {
    let end = offset
        .checked_add(8)
        .ok_or_else(|| Error::invalid_model("DGIR header overflow"))?;
    if end > data.len() {
        return Err(Error::invalid_model("unexpected EOF in DGIR header"));
    }
    let bytes: [u8; 8] = data[offset..end]
        .try_into()
        .map_err(|_| Error::invalid_model("unexpected EOF in DGIR header"))?;
    Ok(u64::from_le_bytes(bytes))
}

fn align_up(value: usize, alignment: usize) -> usize {
    (value + alignment - 1) / alignment * alignment
}

fn graph_from_doc(doc: GraphDoc, weights: &[u8]) -> Result<Graph> {
    let mut graph = Graph::new(doc.name);
    for info in doc.inputs {
        graph.add_input(value_info_from_doc(info));
    }
    for info in doc.outer_inputs {
        graph.add_outer_input(value_info_from_doc(info));
    }
    for output in doc.outputs {
        graph.add_output(output);
    }
    for init in doc.initializers {
        let start = init.offset as usize;
        let end = start
            .checked_add(init.nbytes as usize)
            .ok_or_else(|| Error::invalid_model("initializer extent overflow"))?;
        if init.offset % 8 != 0 {
            return Err(Error::invalid_model(format!(
                "initializer '{}' is not aligned",
                init.name
            )));
        }
        if end > weights.len() {
            return Err(Error::invalid_model(format!(
                "initializer '{}' is out of bounds",
                init.name
            )));
        }
        let shape: Vec<usize> = init.dims.iter().map(|&d| d as usize).collect();
        let value = TensorValue::from_bytes(init.dtype, shape, &weights[start..end])?;
        graph.add_initializer(init.name, value);
    }
    for node in doc.nodes {
        let mut built = Node::new(node.name, node.op_type, node.inputs, node.outputs)
            .with_domain(node.domain)
            .with_version(node.since_version)
            .with_implicit_inputs(node.implicit_inputs);
        for (name, attr) in node.attrs {
            built.attrs.insert(name, attr_from_doc(attr, weights)?);
        }
        graph.add_node(built);
    }
    Ok(graph)
}

fn value_info_from_doc(doc: ValueInfoDoc) -> ValueInfo {
    ValueInfo {
        name: doc.name,
        dtype: doc.dtype,
        shape: doc.shape,
    }
}

fn attr_from_doc(doc: AttrDoc, weights: &[u8]) -> Result<AttrValue> {
    Ok(match doc {
        AttrDoc::Float(v) => AttrValue::Float(v),
        AttrDoc::Int(v) => AttrValue::Int(v),
        AttrDoc::Str(v) => AttrValue::Str(v),
        AttrDoc::Floats(v) => AttrValue::Floats(v),
        AttrDoc::Ints(v) => AttrValue::Ints(v),
        AttrDoc::DType(v) => AttrValue::DType(v),
        AttrDoc::Graph(sub) => AttrValue::Graph(Box::new(graph_from_doc(sub, weights)?)),
    })
}

fn graph_to_doc(graph: &Graph, weights: &mut Vec<u8>) -> GraphDoc {
    let mut initializers: Vec<InitializerDoc> = Vec::new();
    let mut names: Vec<&String> = graph.initializers().map(|(name, _)| name).collect();
    names.sort_unstable();
    for name in names {
        let value = match graph.initializer(name) {
            Some(value) => value,
            None => continue,
        };
        let bytes = value.to_bytes();
        let offset = align_up(weights.len(), 8);
        weights.resize(offset, 0);
        weights.extend_from_slice(&bytes);
        initializers.push(InitializerDoc {
            name: name.clone(),
            dtype: value.dtype(),
            dims: value.shape().iter().map(|&d| d as u64).collect(),
            offset: offset as u64,
            nbytes: bytes.len() as u64,
        });
    }

    GraphDoc {
        name: graph.name().to_string(),
        inputs: graph.inputs().iter().map(value_info_to_doc).collect(),
        outer_inputs: graph.outer_inputs().iter().map(value_info_to_doc).collect(),
        outputs: graph.outputs().to_vec(),
        nodes: graph
            .nodes()
            .map(|(_, node)| NodeDoc {
                name: node.name.clone(),
                op_type: node.op_type.clone(),
                domain: node.domain.clone(),
                since_version: node.since_version,
                inputs: node.inputs.clone(),
                outputs: node.outputs.clone(),
                implicit_inputs: node.implicit_inputs.clone(),
                attrs: node
                    .attrs
                    .iter()
                    .map(|(name, attr)| (name.clone(), attr_to_doc(attr, weights)))
                    .collect(),
            })
            .collect(),
        initializers,
    }
}

fn value_info_to_doc(info: &ValueInfo) -> ValueInfoDoc {
    ValueInfoDoc {
        name: info.name.clone(),
        dtype: info.dtype,
        shape: info.shape.clone(),
    }
}

fn attr_to_doc(attr: &AttrValue, weights: &mut Vec<u8>) -> AttrDoc {
    match attr {
        AttrValue::Float(v) => AttrDoc::Float(*v),
        AttrValue::Int(v) => AttrDoc::Int(*v),
        AttrValue::Str(v) => AttrDoc::Str(v.clone()),
        AttrValue::Floats(v) => AttrDoc::Floats(v.clone()),
        AttrValue::Ints(v) => AttrDoc::Ints(v.clone()),
        AttrValue::DType(v) => AttrDoc::DType(*v),
        AttrValue::Graph(sub) => AttrDoc::Graph(graph_to_doc(sub, weights)),
    }
}
