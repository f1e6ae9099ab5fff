//! Drops `Slice` nodes that provably take the whole input: every axis in
//! the (possibly implicit) axes list has `starts == 0` and an end of
//! `i64::MAX` or `-1`.

use crate::error::Result;
use crate::graph::{AttrLookup, Graph, NodeIndex};

use super::RewriteRule;

pub struct EliminateSlice;

/// The predicate alone, exposed for the rewrite tests.
pub(crate) fn is_noop_slice(starts: &[i64], ends: &[i64], axes: Option<&[i64]>) -> bool {
    if starts.len() != ends.len() {
        return false;
    }
    if let Some(axes) = axes {
        if axes.len() != starts.len() {
            return false;
        }
    }
    starts
        .iter()
        .zip(ends.iter())
        .all(|(&start, &end)| start == 0 && (end == i64::MAX || end == -1))
}

impl RewriteRule for EliminateSlice {
    fn name(&self) -> &str {
        "eliminate-slice"
    }

    fn satisfies(&self, graph: &Graph, index: NodeIndex) -> bool {
        let Some(node) = graph.node(index) else {
            return false;
        };
        if node.inputs.len() != 1 || node.outputs.len() != 1 || node.inputs[0].is_empty() {
            return false;
        }
        if graph.node_output_is_graph_output(node) {
            return false;
        }
        let (Some(starts), Some(ends)) = (node.attr_ints("starts"), node.attr_ints("ends"))
        else {
            return false;
        };
        is_noop_slice(starts, ends, node.attr_ints("axes"))
    }

    fn apply(&self, graph: &mut Graph, index: NodeIndex) -> Result<bool> {
        graph.remove_single_in_single_out(index)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn predicate_accepts_full_range_slices() {
        for end in [i64::MAX, -1] {
            assert!(is_noop_slice(&[0, 0], &[end, end], None));
            assert!(is_noop_slice(&[0], &[end], Some(&[1])));
        }
        assert!(is_noop_slice(&[0, 0], &[i64::MAX, -1], Some(&[0, 2])));
    }

    #[test]
    fn predicate_rejects_real_slices() {
        assert!(!is_noop_slice(&[1], &[i64::MAX], None));
        assert!(!is_noop_slice(&[0], &[5], None));
        assert!(!is_noop_slice(&[0], &[-2], None));
        assert!(!is_noop_slice(&[0, 0], &[i64::MAX], None));
        assert!(!is_noop_slice(&[0], &[i64::MAX], Some(&[0, 1])));
    }
}
