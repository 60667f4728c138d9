//! Lowering Tests for Convolution
//!
//! The channel-first convolution becomes a channel-last conv2d bracketed by
//! layout transposes, with a synthesized all-zero bias when the source op
//! carries none and a zero-point annotation for i8 operands.

use crate::lowering::*;
use tosa_lowering::graph::rules::ConvolutionLowering;
use tosa_lowering::{Attribute, ConstData, DType, GraphLowerer, LowerError, NodeId, OpKind, TensorGraph};

/// [1,3,8,8] input against a [4,3,3,3] filter, no padding, unit stride
fn simple_conv(dtype: DType) -> (TensorGraph, NodeId) {
    let mut graph = TensorGraph::new();
    input(&mut graph, "x", &[1, 3, 8, 8], dtype);
    input(&mut graph, "w", &[4, 3, 3, 3], dtype);
    let op = graph
        .add_op(OpKind::Convolution)
        .input("x")
        .input("w")
        .attribute("padding", Attribute::Ints(vec![0, 0, 0, 0]))
        .attribute("stride", Attribute::Ints(vec![1, 1]))
        .attribute("dilation", Attribute::Ints(vec![1, 1]))
        .output("y")
        .finish()
        .unwrap();
    graph.mark_output("y").unwrap();
    (graph, op)
}

#[test]
fn test_conv_declared_output_extents() {
    let (graph, _) = simple_conv(DType::F32);
    // (8 - (3-1) - 1) / 1 + 1 = 6 in both spatial dimensions
    assert_dims(&graph, "y", &[1, 4, 6, 6]);
}

#[test]
fn test_conv_lowers_to_channel_last_chain() {
    let (mut graph, op) = simple_conv(DType::F32);
    let rewrite = apply(&ConvolutionLowering, &mut graph, op);

    assert_eq!(
        kinds_of(&graph, &rewrite),
        vec![
            OpKind::TosaTranspose,
            OpKind::TosaTranspose,
            OpKind::TosaConst,
            OpKind::TosaConv2d,
            OpKind::TosaTranspose,
        ]
    );

    // the conv itself runs channel-last; the closing transpose restores NCHW
    let conv2d = graph.node(rewrite.new_ops[3]).unwrap();
    assert_dims(&graph, &conv2d.output_names[0], &[1, 6, 6, 4]);
    let (old, replacement) = &rewrite.output_mapping[0];
    assert_eq!(old, "y");
    assert_eq!(producer_kind(&graph, replacement), OpKind::TosaTranspose);
    assert_dims(&graph, replacement, &[1, 4, 6, 6]);
    assert_eq!(graph.graph_outputs(), &[replacement.clone()]);

    assert!(graph.is_lowered());
    assert_verifies(&graph);
}

#[test]
fn test_conv_transposes_use_inverse_permutations() {
    let (mut graph, op) = simple_conv(DType::F32);
    let rewrite = apply(&ConvolutionLowering, &mut graph, op);

    let opening = graph.node(rewrite.new_ops[0]).unwrap();
    let closing = graph.node(rewrite.new_ops[4]).unwrap();
    assert_eq!(
        opening.get_attribute("perm").unwrap().as_ints(),
        Some(&[0, 2, 3, 1][..])
    );
    assert_eq!(
        closing.get_attribute("perm").unwrap().as_ints(),
        Some(&[0, 3, 1, 2][..])
    );
}

#[test]
fn test_conv_full_pipeline_via_driver() {
    let (mut graph, _) = simple_conv(DType::F32);
    let stats = GraphLowerer::new().lower(&mut graph).unwrap();

    assert_eq!(stats.lowered, 1);
    assert_eq!(stats.ops_created, 5);
    assert_eq!(graph.node_count(), 5);
    assert!(graph.is_lowered());
    assert_verifies(&graph);
}

#[test]
fn test_conv_padded_strided_extents() {
    let mut graph = TensorGraph::new();
    f32_input(&mut graph, "x", &[1, 3, 8, 8]);
    f32_input(&mut graph, "w", &[4, 3, 3, 3]);
    let op = graph
        .add_op(OpKind::Convolution)
        .input("x")
        .input("w")
        .attribute("padding", Attribute::Ints(vec![1, 1, 2, 2]))
        .attribute("stride", Attribute::Ints(vec![2, 2]))
        .attribute("dilation", Attribute::Ints(vec![1, 1]))
        .output("y")
        .finish()
        .unwrap();
    graph.mark_output("y").unwrap();

    // height: (8+1+1-2-1)/2 + 1 = 4, width: (8+2+2-2-1)/2 + 1 = 5
    assert_dims(&graph, "y", &[1, 4, 4, 5]);

    apply(&ConvolutionLowering, &mut graph, op);
    assert_verifies(&graph);
    assert_dims(&graph, &graph.graph_outputs()[0].clone(), &[1, 4, 4, 5]);
}

#[test]
fn test_conv_synthesized_bias_is_zero() {
    let (mut graph, op) = simple_conv(DType::F32);
    apply(&ConvolutionLowering, &mut graph, op);

    let bias = find_kind(&graph, OpKind::TosaConst);
    let (dims, data) = graph
        .node(bias)
        .unwrap()
        .get_attribute("value")
        .unwrap()
        .as_tensor()
        .unwrap();
    assert_eq!(dims, &[4]);
    match data {
        ConstData::F32(values) => assert!(values.iter().all(|&v| v == 0.0)),
        other => panic!("expected f32 bias payload, got {:?}", other),
    }
}

#[test]
fn test_conv_consumes_existing_bias() {
    let mut graph = TensorGraph::new();
    f32_input(&mut graph, "x", &[1, 3, 8, 8]);
    f32_input(&mut graph, "w", &[4, 3, 3, 3]);
    f32_input(&mut graph, "b", &[4]);
    let op = graph
        .add_op(OpKind::Convolution)
        .input("x")
        .input("w")
        .input("b")
        .attribute("padding", Attribute::Ints(vec![0, 0, 0, 0]))
        .attribute("stride", Attribute::Ints(vec![1, 1]))
        .attribute("dilation", Attribute::Ints(vec![1, 1]))
        .output("y")
        .finish()
        .unwrap();
    graph.mark_output("y").unwrap();

    let rewrite = apply(&ConvolutionLowering, &mut graph, op);
    // no constant synthesized, the source bias feeds the conv directly
    assert_eq!(rewrite.new_ops.len(), 4);
    assert_eq!(count_kind(&graph, OpKind::TosaConst), 0);
    let conv2d = find_kind(&graph, OpKind::TosaConv2d);
    assert_eq!(graph.node(conv2d).unwrap().input_names[2], "b");
    assert_verifies(&graph);
}

#[test]
fn test_conv_i8_carries_zero_points() {
    let (mut graph, op) = simple_conv(DType::I8);
    apply(&ConvolutionLowering, &mut graph, op);

    let conv2d = find_kind(&graph, OpKind::TosaConv2d);
    let info = graph
        .node(conv2d)
        .unwrap()
        .get_attribute("quantization_info")
        .unwrap()
        .as_quantization()
        .unwrap();
    assert_eq!(info.input_zp, 0);
    assert_eq!(info.weight_zp, 0);
    assert_verifies(&graph);
}

#[test]
fn test_conv_f32_has_no_quantization_info() {
    let (mut graph, op) = simple_conv(DType::F32);
    apply(&ConvolutionLowering, &mut graph, op);

    let conv2d = find_kind(&graph, OpKind::TosaConv2d);
    assert!(graph
        .node(conv2d)
        .unwrap()
        .get_attribute("quantization_info")
        .is_none());
}

#[test]
fn test_conv_f16_keeps_half_precision_throughout() {
    let (mut graph, op) = simple_conv(DType::F16);
    apply(&ConvolutionLowering, &mut graph, op);

    let out = graph.graph_outputs()[0].clone();
    assert_dims(&graph, &out, &[1, 4, 6, 6]);
    assert_dtype(&graph, &out, DType::F16);

    // the synthesized bias rides in the operands' precision
    let bias = find_kind(&graph, OpKind::TosaConst);
    let (_, data) = graph
        .node(bias)
        .unwrap()
        .get_attribute("value")
        .unwrap()
        .as_tensor()
        .unwrap();
    assert_eq!(data, &ConstData::splat(DType::F16, 4, 0.0).unwrap());

    let conv2d = find_kind(&graph, OpKind::TosaConv2d);
    assert!(graph
        .node(conv2d)
        .unwrap()
        .get_attribute("quantization_info")
        .is_none());
    assert_verifies(&graph);
}

#[test]
fn test_conv_forwards_tuning_attributes() {
    let mut graph = TensorGraph::new();
    f32_input(&mut graph, "x", &[1, 3, 8, 8]);
    f32_input(&mut graph, "w", &[4, 3, 3, 3]);
    let op = graph
        .add_op(OpKind::Convolution)
        .input("x")
        .input("w")
        .attribute("padding", Attribute::Ints(vec![0, 0, 0, 0]))
        .attribute("stride", Attribute::Ints(vec![1, 1]))
        .attribute("dilation", Attribute::Ints(vec![1, 1]))
        .attribute("xdlopsV2", Attribute::Bool(true))
        .attribute("perf_config", Attribute::Str("64,64,32".to_string()))
        .output("y")
        .finish()
        .unwrap();

    apply(&ConvolutionLowering, &mut graph, op);
    let conv2d = graph.node(find_kind(&graph, OpKind::TosaConv2d)).unwrap();
    assert_eq!(
        conv2d.get_attribute("xdlopsV2").unwrap().as_bool(),
        Some(true)
    );
    assert_eq!(
        conv2d.get_attribute("perf_config").unwrap().as_str(),
        Some("64,64,32")
    );
}

#[test]
fn test_conv_rejects_malformed_padding() {
    let mut graph = TensorGraph::new();
    f32_input(&mut graph, "x", &[1, 3, 8, 8]);
    f32_input(&mut graph, "w", &[4, 3, 3, 3]);
    let err = graph
        .add_op(OpKind::Convolution)
        .input("x")
        .input("w")
        .attribute("padding", Attribute::Ints(vec![0, 0, 0]))
        .attribute("stride", Attribute::Ints(vec![1, 1]))
        .attribute("dilation", Attribute::Ints(vec![1, 1]))
        .output("y")
        .finish()
        .unwrap_err();
    assert!(matches!(
        err,
        LowerError::InvalidAttribute { name: "padding", .. }
    ));
    assert_eq!(graph.node_count(), 0);
}

#[test]
fn test_conv_rejects_mismatched_channels() {
    let mut graph = TensorGraph::new();
    f32_input(&mut graph, "x", &[1, 3, 8, 8]);
    f32_input(&mut graph, "w", &[4, 5, 3, 3]);
    let err = graph
        .add_op(OpKind::Convolution)
        .input("x")
        .input("w")
        .attribute("padding", Attribute::Ints(vec![0, 0, 0, 0]))
        .attribute("stride", Attribute::Ints(vec![1, 1]))
        .attribute("dilation", Attribute::Ints(vec![1, 1]))
        .output("y")
        .finish()
        .unwrap_err();
    assert!(matches!(err, LowerError::ShapeMismatch { .. }));
}
