// Broadcast elimination.
//
// Neither broadcast form survives lowering as an operation. Both rules
// validate every consumer up front, then bypass the broadcast by rewiring
// consumers straight to the (possibly reshaped) input and erasing the
// original op. Consumers must be elementwise binary ops reading the value in
// the broadcasting operand slot, swapping operands where commutativity
// allows; anything else is a reportable failure and the graph is left
// untouched.

use crate::error::{LowerError, Result};
use crate::graph::ir::{NodeId, TensorGraph};
use crate::graph::rules::{helpers, RewriteMatch, RewriteOutcome, RewriteRule};
use crate::ops::OpKind;
use tracing::debug;

/// Single-axis explicit broadcast: one shared reshape serves every consumer
pub struct BroadcastLowering;

impl RewriteRule for BroadcastLowering {
    fn name(&self) -> &str {
        "lower-broadcast"
    }

    fn source_kind(&self) -> OpKind {
        OpKind::Broadcast
    }

    fn try_rewrite(&self, graph: &mut TensorGraph, op: NodeId) -> Result<RewriteOutcome> {
        let node = match graph.node(op) {
            Some(node) if node.kind == OpKind::Broadcast => node,
            _ => return Ok(RewriteOutcome::NotApplicable),
        };

        let input = helpers::operand(node, 0)?.to_string();
        let out_name = helpers::result_name(node)?.to_string();
        let axis = helpers::require_int_attr(node, "axis")?;

        if graph.is_graph_output(op) {
            return Err(LowerError::unsupported(
                self.name(),
                "broadcast result is a graph output and cannot be bypassed",
            ));
        }

        let in_ty = helpers::value_ty(graph, &input)?;
        let out_ty = helpers::value_ty(graph, &out_name)?;
        let consumers = graph.consumers_of(&out_name);
        let mut swaps = Vec::with_capacity(consumers.len());
        for (consumer, _) in &consumers {
            let consumer = graph
                .node(*consumer)
                .ok_or_else(|| LowerError::InvalidGraph(format!("dangling node {:?}", consumer)))?;
            swaps.push(helpers::rhs_position(self.name(), consumer, &out_name)?);
        }

        debug!(
            value = out_name.as_str(),
            consumers = consumers.len(),
            "bypassing broadcast"
        );

        let mut new_ops = Vec::new();
        let replacement = if consumers.is_empty() || in_ty.rank() == out_ty.rank() {
            input
        } else {
            let aligned = usize::try_from(axis)
                .ok()
                .and_then(|axis| helpers::align_broadcast_shape(&in_ty.dims, out_ty.rank(), axis))
                .ok_or_else(|| LowerError::InvalidAttribute {
                    kind: OpKind::Broadcast,
                    name: "axis",
                    reason: format!(
                        "axis {} cannot place a rank-{} input in a rank-{} result",
                        axis,
                        in_ty.rank(),
                        out_ty.rank()
                    ),
                })?;
            let (reshape, reshape_name) = helpers::reshape_to(graph, &input, &aligned)?;
            new_ops.push(reshape);
            reshape_name
        };

        for ((consumer, _), needs_swap) in consumers.iter().zip(&swaps) {
            if *needs_swap {
                graph.swap_operands(*consumer, 0, 1)?;
            }
            graph.replace_value_in(*consumer, &out_name, &replacement)?;
        }
        graph.remove_node(op)?;

        Ok(RewriteOutcome::Replaced(RewriteMatch {
            new_ops,
            output_mapping: vec![(out_name, replacement)],
        }))
    }
}

/// Multi-axis broadcast: each consumer gets its own reshape sized by that
/// consumer's result rank
pub struct MultiBroadcastLowering;

impl RewriteRule for MultiBroadcastLowering {
    fn name(&self) -> &str {
        "lower-multibroadcast"
    }

    fn source_kind(&self) -> OpKind {
        OpKind::MultiBroadcast
    }

    fn try_rewrite(&self, graph: &mut TensorGraph, op: NodeId) -> Result<RewriteOutcome> {
        let node = match graph.node(op) {
            Some(node) if node.kind == OpKind::MultiBroadcast => node,
            _ => return Ok(RewriteOutcome::NotApplicable),
        };

        let input = helpers::operand(node, 0)?.to_string();
        let out_name = helpers::result_name(node)?.to_string();

        if graph.is_graph_output(op) {
            return Err(LowerError::unsupported(
                self.name(),
                "broadcast result is a graph output and cannot be bypassed",
            ));
        }

        let in_ty = helpers::value_ty(graph, &input)?;
        let consumers = graph.consumers_of(&out_name);

        // Validate everything and size each consumer's reshape before any
        // mutation. Batch extents are copied literally from the consumer's
        // result shape; the inner dimensions collapse to 1 and rely on the
        // implicit second-operand broadcast.
        let mut plans = Vec::with_capacity(consumers.len());
        for (consumer, _) in &consumers {
            let consumer = graph
                .node(*consumer)
                .ok_or_else(|| LowerError::InvalidGraph(format!("dangling node {:?}", consumer)))?;
            let needs_swap = helpers::rhs_position(self.name(), consumer, &out_name)?;
            let consumer_out = helpers::result_name(consumer)?.to_string();
            let consumer_ty = helpers::value_ty(graph, &consumer_out)?;
            let shape = if consumer_ty.rank() == in_ty.rank() {
                None
            } else {
                if consumer_ty.rank() < in_ty.rank() {
                    return Err(LowerError::unsupported(
                        self.name(),
                        format!(
                            "consumer result rank {} is below the input rank {}",
                            consumer_ty.rank(),
                            in_ty.rank()
                        ),
                    ));
                }
                let gap = consumer_ty.rank() - in_ty.rank();
                let mut shape: Vec<i64> = consumer_ty.dims[..gap].to_vec();
                shape.extend(std::iter::repeat(1).take(in_ty.rank()));
                let elements: i64 = shape.iter().product();
                if elements != in_ty.num_elements() {
                    return Err(LowerError::unsupported(
                        self.name(),
                        format!(
                            "reshape to {:?} cannot carry {} input elements",
                            shape,
                            in_ty.num_elements()
                        ),
                    ));
                }
                Some(shape)
            };
            plans.push((needs_swap, shape));
        }

        debug!(
            value = out_name.as_str(),
            consumers = consumers.len(),
            "bypassing multibroadcast"
        );

        let mut new_ops = Vec::new();
        for ((consumer, _), (needs_swap, shape)) in consumers.iter().zip(plans) {
            let replacement = match shape {
                None => input.clone(),
                Some(shape) => {
                    let (reshape, reshape_name) = helpers::reshape_to(graph, &input, &shape)?;
                    new_ops.push(reshape);
                    reshape_name
                }
            };
            if needs_swap {
                graph.swap_operands(*consumer, 0, 1)?;
            }
            graph.replace_value_in(*consumer, &out_name, &replacement)?;
        }
        graph.remove_node(op)?;

        Ok(RewriteOutcome::Replaced(RewriteMatch {
            new_ops,
            output_mapping: vec![(out_name, input)],
        }))
    }
}
