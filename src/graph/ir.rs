//! Graph intermediate representation
//!
//! The IR is a directed graph of operations over named tensor values:
//!
//! - **GraphNode**: one operation with its kind, attributes, and the names of
//!   the values it reads and defines
//! - **Dependency**: an edge recording which result slot feeds which operand
//!   slot
//! - **TensorGraph**: the graph plus side tables mapping value names to their
//!   producers and declared types
//!
//! Value names are the unit of connectivity. Every value has exactly one
//! definition (a boundary input or one operation result), and every stamped
//! type comes from shape inference at construction time, so a well-formed
//! graph stays type-consistent through arbitrary rewiring done with the
//! primitives here.

use crate::error::{LowerError, Result};
use crate::ops::{Dialect, OpKind};
use crate::shape_inference;
use crate::types::{Attribute, TensorType, ValueInfo};
use petgraph::algo::toposort;
use petgraph::stable_graph::{NodeIndex, StableGraph};
use petgraph::visit::{EdgeRef, IntoEdgeReferences};
use petgraph::Direction;
use rustc_hash::FxHashMap;
use std::collections::HashMap;
use std::fmt;

/// Stable identifier of an operation in the graph
pub type NodeId = NodeIndex;

/// Edge payload: which result slot of the source feeds which operand slot of
/// the target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dependency {
    pub output_slot: u8,
    pub input_slot: u8,
}

/// One operation in the graph
#[derive(Debug, Clone)]
pub struct GraphNode {
    /// Optional label, distinct from the value names
    pub name: String,
    pub kind: OpKind,
    pub attributes: Vec<(String, Attribute)>,
    /// Names of the values read, in operand order
    pub input_names: Vec<String>,
    /// Names of the values defined, in result order
    pub output_names: Vec<String>,
}

impl GraphNode {
    /// Look up an attribute by name
    pub fn get_attribute(&self, name: &str) -> Option<&Attribute> {
        self.attributes
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, a)| a)
    }
}

/// A tensor computation graph with typed, single-definition values
pub struct TensorGraph {
    graph: StableGraph<GraphNode, Dependency>,
    /// Value name to (producing node, result slot)
    tensor_producers: FxHashMap<String, (NodeId, u8)>,
    /// Node label to node, for labelled operations
    name_to_id: FxHashMap<String, NodeId>,
    /// Declared type of every operation result
    types: FxHashMap<(NodeId, u8), TensorType>,
    /// Boundary inputs with their declared types
    inputs: Vec<ValueInfo>,
    /// Names of the values the graph exposes as results
    outputs: Vec<String>,
    next_value_id: u64,
}

impl TensorGraph {
    pub fn new() -> Self {
        Self {
            graph: StableGraph::new(),
            tensor_producers: FxHashMap::default(),
            name_to_id: FxHashMap::default(),
            types: FxHashMap::default(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            next_value_id: 0,
        }
    }

    // -- boundary ----------------------------------------------------------

    /// Declare a boundary input value
    pub fn add_input(&mut self, info: ValueInfo) -> Result<()> {
        if self.value_type(&info.name).is_some() {
            return Err(LowerError::DuplicateValue(info.name));
        }
        self.inputs.push(info);
        Ok(())
    }

    /// Expose an existing value as a graph result
    pub fn mark_output(&mut self, name: impl Into<String>) -> Result<()> {
        let name = name.into();
        if self.value_type(&name).is_none() {
            return Err(LowerError::UnknownValue(name));
        }
        if self.outputs.contains(&name) {
            return Err(LowerError::DuplicateValue(name));
        }
        self.outputs.push(name);
        Ok(())
    }

    pub fn graph_inputs(&self) -> &[ValueInfo] {
        &self.inputs
    }

    pub fn graph_outputs(&self) -> &[String] {
        &self.outputs
    }

    /// Whether any result of this node is exposed as a graph output
    pub fn is_graph_output(&self, id: NodeId) -> bool {
        match self.graph.node_weight(id) {
            Some(node) => node.output_names.iter().any(|n| self.outputs.contains(n)),
            None => false,
        }
    }

    // -- lookup ------------------------------------------------------------

    pub fn node(&self, id: NodeId) -> Option<&GraphNode> {
        self.graph.node_weight(id)
    }

    /// Find a labelled operation by its label
    pub fn node_by_name(&self, name: &str) -> Option<NodeId> {
        self.name_to_id.get(name).copied()
    }

    /// Declared type of a value, whether boundary input or operation result
    pub fn value_type(&self, name: &str) -> Option<&TensorType> {
        if let Some(&(id, slot)) = self.tensor_producers.get(name) {
            return self.types.get(&(id, slot));
        }
        self.inputs.iter().find(|i| i.name == name).map(|i| &i.ty)
    }

    /// Producing node and result slot of a value, if it is operation-defined
    pub fn producer_of(&self, name: &str) -> Option<(NodeId, u8)> {
        self.tensor_producers.get(name).copied()
    }

    /// Every (node, operand slot) currently reading a value, in ascending
    /// node order
    pub fn consumers_of(&self, name: &str) -> Vec<(NodeId, usize)> {
        let mut found = Vec::new();
        for id in self.graph.node_indices() {
            for (slot, input) in self.graph[id].input_names.iter().enumerate() {
                if input == name {
                    found.push((id, slot));
                }
            }
        }
        found
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        self.graph.node_indices().collect()
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Whether every remaining operation belongs to the target dialect
    pub fn is_lowered(&self) -> bool {
        self.graph
            .node_indices()
            .all(|id| self.graph[id].kind.dialect() == Dialect::Tosa)
    }

    // -- construction ------------------------------------------------------

    /// Start building an operation of the given kind
    pub fn add_op(&mut self, kind: OpKind) -> NewOp<'_> {
        NewOp::new(self, kind)
    }

    /// Mint a value name that is unused in this graph
    pub fn fresh_name(&mut self, stem: &str) -> String {
        loop {
            let candidate = format!("{}_{}", stem, self.next_value_id);
            self.next_value_id += 1;
            if self.value_type(&candidate).is_none() {
                return candidate;
            }
        }
    }

    // -- rewiring ----------------------------------------------------------

    /// Redirect every read of `old` (and any graph-output listing) to `new`.
    ///
    /// The definition of `old` is left in place; only its uses move. Both
    /// names must already be defined, which keeps the graph closed at every
    /// step.
    ///
    /// # Returns
    /// The number of operand slots rewired.
    pub fn replace_value(&mut self, old: &str, new: &str) -> Result<usize> {
        if old == new {
            return Ok(0);
        }
        if self.value_type(new).is_none() {
            return Err(LowerError::UnknownValue(new.to_string()));
        }
        if self.value_type(old).is_none() {
            return Err(LowerError::UnknownValue(old.to_string()));
        }
        let mut rewired = 0;
        for (id, slot) in self.consumers_of(old) {
            self.rewire_slot(id, slot, new)?;
            rewired += 1;
        }
        for out in &mut self.outputs {
            if out == old {
                *out = new.to_string();
            }
        }
        Ok(rewired)
    }

    /// Redirect reads of `old` to `new` within a single consumer only
    pub fn replace_value_in(&mut self, consumer: NodeId, old: &str, new: &str) -> Result<usize> {
        if self.value_type(new).is_none() {
            return Err(LowerError::UnknownValue(new.to_string()));
        }
        let node = self
            .graph
            .node_weight(consumer)
            .ok_or_else(|| LowerError::InvalidGraph(format!("no node {:?}", consumer)))?;
        let slots: Vec<usize> = node
            .input_names
            .iter()
            .enumerate()
            .filter(|(_, n)| *n == old)
            .map(|(i, _)| i)
            .collect();
        for &slot in &slots {
            self.rewire_slot(consumer, slot, new)?;
        }
        Ok(slots.len())
    }

    fn rewire_slot(&mut self, consumer: NodeId, slot: usize, new: &str) -> Result<()> {
        {
            let node = self
                .graph
                .node_weight_mut(consumer)
                .ok_or_else(|| LowerError::InvalidGraph(format!("no node {:?}", consumer)))?;
            node.input_names[slot] = new.to_string();
        }
        let stale = self
            .graph
            .edges_directed(consumer, Direction::Incoming)
            .find(|e| e.weight().input_slot == slot as u8)
            .map(|e| e.id());
        if let Some(edge) = stale {
            self.graph.remove_edge(edge);
        }
        if let Some(&(src, output_slot)) = self.tensor_producers.get(new) {
            self.graph.add_edge(
                src,
                consumer,
                Dependency {
                    output_slot,
                    input_slot: slot as u8,
                },
            );
        }
        Ok(())
    }

    /// Exchange two operand slots of an operation, names and edges together
    pub fn swap_operands(&mut self, id: NodeId, a: usize, b: usize) -> Result<()> {
        let node = self
            .graph
            .node_weight_mut(id)
            .ok_or_else(|| LowerError::InvalidGraph(format!("no node {:?}", id)))?;
        if a >= node.input_names.len() || b >= node.input_names.len() {
            return Err(LowerError::InvalidGraph(format!(
                "operand index out of range for {}",
                node.kind
            )));
        }
        node.input_names.swap(a, b);
        let edges: Vec<_> = self
            .graph
            .edges_directed(id, Direction::Incoming)
            .map(|e| e.id())
            .collect();
        for edge in edges {
            if let Some(dep) = self.graph.edge_weight_mut(edge) {
                if dep.input_slot == a as u8 {
                    dep.input_slot = b as u8;
                } else if dep.input_slot == b as u8 {
                    dep.input_slot = a as u8;
                }
            }
        }
        Ok(())
    }

    /// Remove an operation that has no remaining consumers and is not a graph
    /// output
    pub fn remove_node(&mut self, id: NodeId) -> Result<()> {
        let node = self
            .graph
            .node_weight(id)
            .ok_or_else(|| LowerError::InvalidGraph(format!("no node {:?}", id)))?;
        if self.is_graph_output(id) {
            return Err(LowerError::InvalidGraph(format!(
                "cannot remove {}: result is a graph output",
                node.kind
            )));
        }
        let outputs = node.output_names.clone();
        let label = node.name.clone();
        for out in &outputs {
            if !self.consumers_of(out).is_empty() {
                return Err(LowerError::InvalidGraph(format!(
                    "cannot remove {}: '{}' still has consumers",
                    self.graph[id].kind, out
                )));
            }
        }
        for (slot, out) in outputs.iter().enumerate() {
            self.tensor_producers.remove(out);
            self.types.remove(&(id, slot as u8));
        }
        if !label.is_empty() {
            self.name_to_id.remove(&label);
        }
        self.graph.remove_node(id);
        Ok(())
    }

    // -- analysis ----------------------------------------------------------

    /// Operation order in which every value is defined before it is read
    pub fn topological_sort(&self) -> Result<Vec<NodeId>> {
        toposort(&self.graph, None)
            .map_err(|_| LowerError::InvalidGraph("graph contains a cycle".into()))
    }

    pub fn statistics(&self) -> GraphStatistics {
        let mut kind_counts: HashMap<String, usize> = HashMap::new();
        let mut source_ops = 0;
        let mut target_ops = 0;
        for id in self.graph.node_indices() {
            let kind = self.graph[id].kind;
            *kind_counts.entry(kind.name().to_string()).or_insert(0) += 1;
            match kind.dialect() {
                Dialect::Graph => source_ops += 1,
                Dialect::Tosa => target_ops += 1,
            }
        }
        GraphStatistics {
            total_nodes: self.graph.node_count(),
            total_edges: self.graph.edge_count(),
            num_inputs: self.inputs.len(),
            num_outputs: self.outputs.len(),
            source_ops,
            target_ops,
            kind_counts,
        }
    }

    /// Render the graph in Graphviz DOT format, colored by dialect
    pub fn visualize_dot(&self) -> String {
        use std::fmt::Write;

        let mut dot = String::from("digraph tensor_graph {\n");
        dot.push_str("  rankdir=TB;\n");
        dot.push_str("  node [shape=box, style=filled];\n\n");

        for id in self.graph.node_indices() {
            let node = &self.graph[id];
            let color = match node.kind {
                OpKind::TosaConst => "lightgray",
                _ => match node.kind.dialect() {
                    Dialect::Graph => "lightyellow",
                    Dialect::Tosa => "lightblue",
                },
            };
            let value = node.output_names.first().map(String::as_str).unwrap_or("");
            writeln!(
                dot,
                "  n{} [label=\"{}\\n{}\", fillcolor={}];",
                id.index(),
                node.kind,
                value,
                color
            )
            .unwrap();
        }
        dot.push('\n');
        for edge in self.graph.edge_references() {
            writeln!(
                dot,
                "  n{} -> n{} [label=\"{}\"];",
                edge.source().index(),
                edge.target().index(),
                edge.weight().input_slot
            )
            .unwrap();
        }
        dot.push_str("}\n");
        dot
    }
}

impl Default for TensorGraph {
    fn default() -> Self {
        Self::new()
    }
}

/// Fluent builder for one operation.
///
/// Created through [`TensorGraph::add_op`]; [`NewOp::finish`] resolves the
/// named operands, runs shape inference, and stamps the declared result type.
pub struct NewOp<'a> {
    graph: &'a mut TensorGraph,
    node: GraphNode,
}

impl<'a> NewOp<'a> {
    fn new(graph: &'a mut TensorGraph, kind: OpKind) -> Self {
        Self {
            graph,
            node: GraphNode {
                name: String::new(),
                kind,
                attributes: Vec::new(),
                input_names: Vec::new(),
                output_names: Vec::new(),
            },
        }
    }

    /// Attach an optional label
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.node.name = name.into();
        self
    }

    /// Append an operand by value name
    pub fn input(mut self, value: impl Into<String>) -> Self {
        self.node.input_names.push(value.into());
        self
    }

    /// Attach a named attribute
    pub fn attribute(mut self, name: impl Into<String>, value: Attribute) -> Self {
        self.node.attributes.push((name.into(), value));
        self
    }

    /// Name the result value
    pub fn output(mut self, value: impl Into<String>) -> Self {
        self.node.output_names.push(value.into());
        self
    }

    /// Resolve operands, infer the result type, and insert the operation.
    ///
    /// # Returns
    /// The id of the inserted node. Fails when an operand name is undefined,
    /// the result name is already taken, or inference rejects the operation.
    pub fn finish(self) -> Result<NodeId> {
        let NewOp { graph, node } = self;

        if node.output_names.len() != 1 {
            return Err(LowerError::InvalidGraph(format!(
                "{} must declare exactly one result, got {}",
                node.kind,
                node.output_names.len()
            )));
        }
        for out in &node.output_names {
            if graph.value_type(out).is_some() {
                return Err(LowerError::DuplicateValue(out.clone()));
            }
        }

        let mut input_types = Vec::with_capacity(node.input_names.len());
        let mut edges = Vec::with_capacity(node.input_names.len());
        for (slot, input) in node.input_names.iter().enumerate() {
            if let Some(&(src, output_slot)) = graph.tensor_producers.get(input) {
                let ty = graph
                    .types
                    .get(&(src, output_slot))
                    .cloned()
                    .ok_or_else(|| LowerError::UnknownValue(input.clone()))?;
                input_types.push(ty);
                edges.push((src, output_slot, slot as u8));
            } else if let Some(info) = graph.inputs.iter().find(|i| i.name == *input) {
                input_types.push(info.ty.clone());
            } else {
                return Err(LowerError::UnknownValue(input.clone()));
            }
        }

        let result_ty = shape_inference::infer_op(node.kind, &node.attributes, &input_types)?;

        let label = node.name.clone();
        let out_name = node.output_names[0].clone();
        let id = graph.graph.add_node(node);
        for (src, output_slot, input_slot) in edges {
            graph.graph.add_edge(
                src,
                id,
                Dependency {
                    output_slot,
                    input_slot,
                },
            );
        }
        graph.tensor_producers.insert(out_name, (id, 0));
        graph.types.insert((id, 0), result_ty);
        if !label.is_empty() {
            graph.name_to_id.insert(label, id);
        }
        Ok(id)
    }
}

/// Summary counts over a graph
#[derive(Debug, Clone)]
pub struct GraphStatistics {
    pub total_nodes: usize,
    pub total_edges: usize,
    pub num_inputs: usize,
    pub num_outputs: usize,
    pub source_ops: usize,
    pub target_ops: usize,
    pub kind_counts: HashMap<String, usize>,
}

impl fmt::Display for GraphStatistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Graph statistics:")?;
        writeln!(f, "  Nodes:   {}", self.total_nodes)?;
        writeln!(f, "  Edges:   {}", self.total_edges)?;
        writeln!(f, "  Inputs:  {}", self.num_inputs)?;
        writeln!(f, "  Outputs: {}", self.num_outputs)?;
        writeln!(
            f,
            "  Dialects: {} source, {} target",
            self.source_ops, self.target_ops
        )?;
        let mut kinds: Vec<_> = self.kind_counts.iter().collect();
        kinds.sort();
        for (kind, count) in kinds {
            writeln!(f, "    {}: {}", kind, count)?;
        }
        Ok(())
    }
}
