//! Lowering Tests for Explicit Broadcasts
//!
//! Both broadcast forms disappear: consumers are rewired onto the raw or
//! reshaped input and lean on the implicit second-operand broadcast of the
//! elementwise target ops. Consumers that cannot take the value in their
//! second slot make the whole rewrite a reported failure with the graph left
//! untouched.

use crate::lowering::*;
use tosa_lowering::graph::rules::{BroadcastLowering, MultiBroadcastLowering};
use tosa_lowering::{Attribute, NodeId, OpKind, TensorGraph};

/// Bias-vector pattern: `b: [4]` broadcast at axis 1 into `[1,4,6,6]`,
/// consumed by one elementwise op over `x`
fn bias_pattern(consumer: OpKind, broadcast_first: bool) -> (TensorGraph, NodeId, NodeId) {
    let mut graph = TensorGraph::new();
    f32_input(&mut graph, "x", &[1, 4, 6, 6]);
    f32_input(&mut graph, "b", &[4]);
    let bc = graph
        .add_op(OpKind::Broadcast)
        .input("b")
        .attribute("axis", Attribute::Int(1))
        .attribute("out_lens", Attribute::Ints(vec![1, 4, 6, 6]))
        .output("bc")
        .finish()
        .unwrap();
    let mut builder = graph.add_op(consumer);
    builder = if broadcast_first {
        builder.input("bc").input("x")
    } else {
        builder.input("x").input("bc")
    };
    if consumer == OpKind::TosaMul {
        builder = builder.attribute("shift", Attribute::Int(0));
    }
    let op = builder.output("y").finish().unwrap();
    graph.mark_output("y").unwrap();
    (graph, bc, op)
}

#[test]
fn test_broadcast_aligns_vector_into_rank4() {
    let (mut graph, bc, add) = bias_pattern(OpKind::TosaAdd, false);
    let rewrite = apply(&BroadcastLowering, &mut graph, bc);

    assert_eq!(kinds_of(&graph, &rewrite), vec![OpKind::TosaReshape]);
    let reshape = graph.node(rewrite.new_ops[0]).unwrap();
    assert_eq!(
        reshape.get_attribute("new_shape").unwrap().as_ints(),
        Some(&[1, 4, 1, 1][..])
    );
    let reshaped = reshape.output_names[0].clone();
    assert_dims(&graph, &reshaped, &[1, 4, 1, 1]);

    assert_eq!(graph.node(add).unwrap().input_names, vec!["x", &reshaped]);
    assert_eq!(count_kind(&graph, OpKind::Broadcast), 0);
    assert_dims(&graph, "y", &[1, 4, 6, 6]);
    assert!(graph.is_lowered());
    assert_verifies(&graph);
}

#[test]
fn test_broadcast_swaps_commutative_consumer() {
    let (mut graph, bc, add) = bias_pattern(OpKind::TosaAdd, true);
    let rewrite = apply(&BroadcastLowering, &mut graph, bc);

    let reshaped = graph.node(rewrite.new_ops[0]).unwrap().output_names[0].clone();
    // the broadcast operand moved to the second slot
    assert_eq!(graph.node(add).unwrap().input_names, vec!["x", &reshaped]);
    assert_verifies(&graph);
}

#[test]
fn test_broadcast_into_second_slot_of_sub() {
    let (mut graph, bc, sub) = bias_pattern(OpKind::TosaSub, false);
    let rewrite = apply(&BroadcastLowering, &mut graph, bc);

    let reshaped = graph.node(rewrite.new_ops[0]).unwrap().output_names[0].clone();
    assert_eq!(graph.node(sub).unwrap().input_names, vec!["x", &reshaped]);
    assert_verifies(&graph);
}

#[test]
fn test_broadcast_into_first_slot_of_sub_reported() {
    let (mut graph, bc, _) = bias_pattern(OpKind::TosaSub, true);
    let before = wiring(&graph);

    let err = apply_err(&BroadcastLowering, &mut graph, bc);
    assert!(err.is_unsupported(), "got {}", err);
    assert_eq!(wiring(&graph), before);
}

#[test]
fn test_broadcast_rejects_non_elementwise_consumer() {
    let mut graph = TensorGraph::new();
    f32_input(&mut graph, "b", &[4]);
    let bc = graph
        .add_op(OpKind::Broadcast)
        .input("b")
        .attribute("axis", Attribute::Int(1))
        .attribute("out_lens", Attribute::Ints(vec![1, 4, 6, 6]))
        .output("bc")
        .finish()
        .unwrap();
    graph
        .add_op(OpKind::TosaExp)
        .input("bc")
        .output("e")
        .finish()
        .unwrap();
    graph.mark_output("e").unwrap();
    let before = wiring(&graph);

    let err = apply_err(&BroadcastLowering, &mut graph, bc);
    assert!(err.is_unsupported());
    assert_eq!(wiring(&graph), before);
}

#[test]
fn test_broadcast_shares_one_reshape_across_consumers() {
    let mut graph = TensorGraph::new();
    f32_input(&mut graph, "x1", &[1, 4, 6, 6]);
    f32_input(&mut graph, "x2", &[1, 4, 6, 6]);
    f32_input(&mut graph, "b", &[4]);
    let bc = graph
        .add_op(OpKind::Broadcast)
        .input("b")
        .attribute("axis", Attribute::Int(1))
        .attribute("out_lens", Attribute::Ints(vec![1, 4, 6, 6]))
        .output("bc")
        .finish()
        .unwrap();
    let a1 = graph
        .add_op(OpKind::TosaAdd)
        .input("x1")
        .input("bc")
        .output("y1")
        .finish()
        .unwrap();
    let a2 = graph
        .add_op(OpKind::TosaMul)
        .input("bc")
        .input("x2")
        .attribute("shift", Attribute::Int(0))
        .output("y2")
        .finish()
        .unwrap();
    graph.mark_output("y1").unwrap();
    graph.mark_output("y2").unwrap();

    let rewrite = apply(&BroadcastLowering, &mut graph, bc);
    assert_eq!(rewrite.new_ops.len(), 1);
    assert_eq!(count_kind(&graph, OpKind::TosaReshape), 1);

    let reshaped = graph.node(rewrite.new_ops[0]).unwrap().output_names[0].clone();
    assert_eq!(graph.node(a1).unwrap().input_names, vec!["x1", &reshaped]);
    // the multiply was commutative, so its operands were swapped
    assert_eq!(graph.node(a2).unwrap().input_names, vec!["x2", &reshaped]);
    assert_verifies(&graph);
}

#[test]
fn test_broadcast_equal_rank_rewires_raw_input() {
    let mut graph = TensorGraph::new();
    f32_input(&mut graph, "x", &[1, 4, 6, 6]);
    f32_input(&mut graph, "b", &[1, 4, 6, 6]);
    let bc = graph
        .add_op(OpKind::Broadcast)
        .input("b")
        .attribute("axis", Attribute::Int(0))
        .attribute("out_lens", Attribute::Ints(vec![1, 4, 6, 6]))
        .output("bc")
        .finish()
        .unwrap();
    let add = graph
        .add_op(OpKind::TosaAdd)
        .input("x")
        .input("bc")
        .output("y")
        .finish()
        .unwrap();
    graph.mark_output("y").unwrap();

    let rewrite = apply(&BroadcastLowering, &mut graph, bc);
    assert!(rewrite.new_ops.is_empty());
    assert_eq!(count_kind(&graph, OpKind::TosaReshape), 0);
    assert_eq!(graph.node(add).unwrap().input_names, vec!["x", "b"]);
    assert_verifies(&graph);
}

#[test]
fn test_broadcast_as_graph_output_reported() {
    let mut graph = TensorGraph::new();
    f32_input(&mut graph, "b", &[4]);
    let bc = graph
        .add_op(OpKind::Broadcast)
        .input("b")
        .attribute("axis", Attribute::Int(1))
        .attribute("out_lens", Attribute::Ints(vec![1, 4, 6, 6]))
        .output("bc")
        .finish()
        .unwrap();
    graph.mark_output("bc").unwrap();
    let before = wiring(&graph);

    let err = apply_err(&BroadcastLowering, &mut graph, bc);
    assert!(err.is_unsupported());
    assert_eq!(wiring(&graph), before);
}

#[test]
fn test_broadcast_without_consumers_is_erased() {
    let mut graph = TensorGraph::new();
    f32_input(&mut graph, "b", &[4]);
    let bc = graph
        .add_op(OpKind::Broadcast)
        .input("b")
        .attribute("axis", Attribute::Int(1))
        .attribute("out_lens", Attribute::Ints(vec![1, 4, 6, 6]))
        .output("bc")
        .finish()
        .unwrap();

    let rewrite = apply(&BroadcastLowering, &mut graph, bc);
    assert!(rewrite.new_ops.is_empty());
    assert_eq!(rewrite.output_mapping, vec![("bc".to_string(), "b".to_string())]);
    assert_eq!(graph.node_count(), 0);
}

// ----------------------------------------------------------------------------
// MultiBroadcast
// ----------------------------------------------------------------------------

#[test]
fn test_multibroadcast_same_rank_uses_raw_input() {
    let mut graph = TensorGraph::new();
    f32_input(&mut graph, "x", &[1, 4, 6, 6]);
    f32_input(&mut graph, "b", &[1, 4, 1, 1]);
    let mb = graph
        .add_op(OpKind::MultiBroadcast)
        .input("b")
        .attribute("out_lens", Attribute::Ints(vec![1, 4, 6, 6]))
        .output("mb")
        .finish()
        .unwrap();
    let add = graph
        .add_op(OpKind::TosaAdd)
        .input("x")
        .input("mb")
        .output("y")
        .finish()
        .unwrap();
    graph.mark_output("y").unwrap();

    let rewrite = apply(&MultiBroadcastLowering, &mut graph, mb);
    assert!(rewrite.new_ops.is_empty());
    assert_eq!(graph.node(add).unwrap().input_names, vec!["x", "b"]);
    assert_eq!(rewrite.output_mapping, vec![("mb".to_string(), "b".to_string())]);
    assert_verifies(&graph);
}

#[test]
fn test_multibroadcast_reshapes_to_consumer_rank() {
    let mut graph = TensorGraph::new();
    f32_input(&mut graph, "x", &[2, 3, 6]);
    f32_input(&mut graph, "b", &[6]);
    let mb = graph
        .add_op(OpKind::MultiBroadcast)
        .input("b")
        .attribute("out_lens", Attribute::Ints(vec![2, 3, 6]))
        .output("mb")
        .finish()
        .unwrap();
    let add = graph
        .add_op(OpKind::TosaAdd)
        .input("x")
        .input("mb")
        .output("y")
        .finish()
        .unwrap();
    graph.mark_output("y").unwrap();

    let rewrite = apply(&MultiBroadcastLowering, &mut graph, mb);
    assert_eq!(kinds_of(&graph, &rewrite), vec![OpKind::TosaReshape]);
    // batch extents come from the consumer result, inner extents collapse to 1
    let reshape = graph.node(rewrite.new_ops[0]).unwrap();
    assert_eq!(
        reshape.get_attribute("new_shape").unwrap().as_ints(),
        Some(&[2, 3, 1][..])
    );
    let reshaped = reshape.output_names[0].clone();
    assert_eq!(graph.node(add).unwrap().input_names, vec!["x", &reshaped]);
    assert_verifies(&graph);
}

#[test]
fn test_multibroadcast_each_consumer_gets_its_own_reshape() {
    let mut graph = TensorGraph::new();
    f32_input(&mut graph, "x1", &[2, 3, 6]);
    f32_input(&mut graph, "x2", &[2, 3, 6]);
    f32_input(&mut graph, "b", &[6]);
    let mb = graph
        .add_op(OpKind::MultiBroadcast)
        .input("b")
        .attribute("out_lens", Attribute::Ints(vec![2, 3, 6]))
        .output("mb")
        .finish()
        .unwrap();
    graph
        .add_op(OpKind::TosaAdd)
        .input("x1")
        .input("mb")
        .output("y1")
        .finish()
        .unwrap();
    graph
        .add_op(OpKind::TosaAdd)
        .input("x2")
        .input("mb")
        .output("y2")
        .finish()
        .unwrap();
    graph.mark_output("y1").unwrap();
    graph.mark_output("y2").unwrap();

    let rewrite = apply(&MultiBroadcastLowering, &mut graph, mb);
    assert_eq!(rewrite.new_ops.len(), 2);
    assert_eq!(count_kind(&graph, OpKind::TosaReshape), 2);
    assert_verifies(&graph);
}

#[test]
fn test_multibroadcast_count_mismatch_reported() {
    let mut graph = TensorGraph::new();
    f32_input(&mut graph, "x", &[2, 3, 6]);
    f32_input(&mut graph, "b", &[3, 1]);
    let mb = graph
        .add_op(OpKind::MultiBroadcast)
        .input("b")
        .attribute("out_lens", Attribute::Ints(vec![2, 3, 6]))
        .output("mb")
        .finish()
        .unwrap();
    graph
        .add_op(OpKind::TosaAdd)
        .input("x")
        .input("mb")
        .output("y")
        .finish()
        .unwrap();
    graph.mark_output("y").unwrap();
    let before = wiring(&graph);

    // the [2,1,1] stand-in cannot carry three input elements
    let err = apply_err(&MultiBroadcastLowering, &mut graph, mb);
    assert!(err.is_unsupported(), "got {}", err);
    assert_eq!(wiring(&graph), before);
}

#[test]
fn test_multibroadcast_noncommutative_first_slot_reported() {
    let mut graph = TensorGraph::new();
    f32_input(&mut graph, "x", &[1, 4, 6, 6]);
    f32_input(&mut graph, "b", &[1, 4, 1, 1]);
    let mb = graph
        .add_op(OpKind::MultiBroadcast)
        .input("b")
        .attribute("out_lens", Attribute::Ints(vec![1, 4, 6, 6]))
        .output("mb")
        .finish()
        .unwrap();
    graph
        .add_op(OpKind::TosaSub)
        .input("mb")
        .input("x")
        .output("y")
        .finish()
        .unwrap();
    graph.mark_output("y").unwrap();
    let before = wiring(&graph);

    let err = apply_err(&MultiBroadcastLowering, &mut graph, mb);
    assert!(err.is_unsupported());
    assert_eq!(wiring(&graph), before);
}

#[test]
fn test_multibroadcast_as_graph_output_reported() {
    let mut graph = TensorGraph::new();
    f32_input(&mut graph, "b", &[1, 4, 1, 1]);
    let mb = graph
        .add_op(OpKind::MultiBroadcast)
        .input("b")
        .attribute("out_lens", Attribute::Ints(vec![1, 4, 6, 6]))
        .output("mb")
        .finish()
        .unwrap();
    graph.mark_output("mb").unwrap();

    let err = apply_err(&MultiBroadcastLowering, &mut graph, mb);
    assert!(err.is_unsupported());
    assert_eq!(graph.node_count(), 1);
}
