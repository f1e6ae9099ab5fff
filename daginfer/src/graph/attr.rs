use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::tensor::DType;

use super::Graph;

/// Node attribute payloads.
#[derive(Debug, Clone)]
pub enum AttrValue {
    Float(f32),
    Int(i64),
    Str(String),
    Floats(Vec<f32>),
    Ints(Vec<i64>),
    DType(DType),
    /// Control-flow subgraph.
    Graph(Box<Graph>),
}

pub type AttrMap = BTreeMap<String, AttrValue>;

/// Typed attribute lookups shared by kernels and rewrites.
pub trait AttrLookup {
    fn attr(&self, name: &str) -> Option<&AttrValue>;

    fn attr_i64(&self, name: &str) -> Option<i64> {
        match self.attr(name)? {
            AttrValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    fn attr_f32(&self, name: &str) -> Option<f32> {
        match self.attr(name)? {
            AttrValue::Float(v) => Some(*v),
            _ => None,
        }
    }

    fn attr_str(&self, name: &str) -> Option<&str> {
        match self.attr(name)? {
            AttrValue::Str(v) => Some(v.as_str()),
            _ => None,
        }
    }

    fn attr_ints(&self, name: &str) -> Option<&[i64]> {
        match self.attr(name)? {
            AttrValue::Ints(v) => Some(v.as_slice()),
            _ => None,
        }
    }

    fn attr_dtype(&self, name: &str) -> Option<DType> {
        match self.attr(name)? {
            AttrValue::DType(v) => Some(*v),
            _ => None,
        }
    }

    fn attr_graph(&self, name: &str) -> Option<&Graph> {
        match self.attr(name)? {
            AttrValue::Graph(g) => Some(g),
            _ => None,
        }
    }

    fn require_i64(&self, name: &str) -> Result<i64> {
        self.attr_i64(name)
            .ok_or_else(|| Error::invalid_model(format!("missing int attribute '{}'", name)))
    }

    fn require_f32(&self, name: &str) -> Result<f32> {
        self.attr_f32(name)
            .ok_or_else(|| Error::invalid_model(format!("missing float attribute '{}'", name)))
    }

    fn require_dtype(&self, name: &str) -> Result<DType> {
        self.attr_dtype(name)
            .ok_or_else(|| Error::invalid_model(format!("missing dtype attribute '{}'", name)))
    }
}
