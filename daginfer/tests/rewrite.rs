//! Rewrite-engine behavior: the bundled rewrites, fusion arithmetic, and
//! fixed-point application.

mod common;

use std::collections::HashMap;

use anyhow::Result;

use daginfer::rewrite::{
    ConvActivationFusion, ConvAddFusion, ConvBnFusion, ConvMulFusion, UnsqueezeElimination,
};
use daginfer::{
    AttrValue, Graph, Model, Node, RunOptions, Session, SessionOptions, TensorValue, ValueInfo,
};
use daginfer::{DType, Value};

use common::{assert_close, f32_tensor, feeds, fetch_f32, names};

fn session_for(graph: Graph, transformers: Vec<Box<dyn daginfer::rewrite::GraphTransformer>>) -> Result<Session> {
    let mut session = Session::new(SessionOptions {
        parallel_execution: false,
        ..SessionOptions::default()
    });
    session.load_model(Model::from_graph(graph))?;
    for t in transformers {
        session.register_transformer(t)?;
    }
    session.initialize()?;
    Ok(session)
}

fn op_counts(session: &Session) -> Result<HashMap<String, usize>> {
    let state = session.session_state()?;
    let mut counts = HashMap::new();
    for (_, node) in state.graph().nodes() {
        *counts.entry(node.op_type.clone()).or_insert(0) += 1;
    }
    Ok(counts)
}

fn run_one(session: &Session, feeds_in: HashMap<String, Value>, output: &str) -> Result<Vec<f32>> {
    let outputs = session.run(&RunOptions::default(), feeds_in, &names(&[output]))?;
    fetch_f32(&outputs[0])
}

/// Abs -> Identity -> Max(abs, id): the identity disappears and the
/// elementwise max of the value with itself is unchanged.
#[test]
fn identity_elimination_splices_consumers() -> Result<()> {
    let mut graph = Graph::new("abs-id-max");
    graph.add_input(ValueInfo::new("x", DType::F32));
    graph.add_output("y");
    graph.add_node(Node::new("abs", "Abs", vec!["x".into()], vec!["a".into()]));
    graph.add_node(Node::new("id", "Identity", vec!["a".into()], vec!["i".into()]));
    graph.add_node(Node::new(
        "max",
        "Max",
        vec!["a".into(), "i".into()],
        vec!["y".into()],
    ));

    let session = session_for(graph, vec![])?;
    let counts = op_counts(&session)?;
    assert_eq!(counts.get("Identity"), None);
    assert_eq!(counts.get("Abs"), Some(&1));
    assert_eq!(counts.get("Max"), Some(&1));

    let out = run_one(
        &session,
        feeds(vec![("x", f32_tensor(vec![-1.0, 2.0], vec![2]))]),
        "y",
    )?;
    assert_eq!(out, vec![1.0, 2.0]);
    Ok(())
}

#[test]
fn slice_elimination_drops_full_range_slices() -> Result<()> {
    let build = || {
        let mut graph = Graph::new("slice");
        graph.add_input(ValueInfo::new("x", DType::F32));
        graph.add_output("y");
        graph.add_node(Node::new("abs", "Abs", vec!["x".into()], vec!["a".into()]));
        graph.add_node(
            Node::new("sl", "Slice", vec!["a".into()], vec!["s".into()])
                .with_attr("starts", AttrValue::Ints(vec![0, 0]))
                .with_attr("ends", AttrValue::Ints(vec![i64::MAX, -1])),
        );
        graph.add_node(Node::new("abs2", "Abs", vec!["s".into()], vec!["y".into()]));
        graph
    };

    let session = session_for(build(), vec![])?;
    assert_eq!(op_counts(&session)?.get("Slice"), None);

    // Bitwise equivalence against the unrewritten graph.
    let mut plain = Session::new(SessionOptions {
        parallel_execution: false,
        enable_default_rewrites: false,
        ..SessionOptions::default()
    });
    plain.load_model(Model::from_graph(build()))?;
    plain.initialize()?;

    let input = f32_tensor(vec![-1.5, 0.25, 3.0, -4.0], vec![2, 2]);
    let rewritten = run_one(&session, feeds(vec![("x", input.clone())]), "y")?;
    let reference = run_one(&plain, feeds(vec![("x", input)]), "y")?;
    assert_eq!(rewritten, reference);
    Ok(())
}

#[test]
fn real_slices_survive_elimination() -> Result<()> {
    let mut graph = Graph::new("slice-keep");
    graph.add_input(ValueInfo::new("x", DType::F32));
    graph.add_output("y");
    graph.add_node(Node::new("abs", "Abs", vec!["x".into()], vec!["a".into()]));
    graph.add_node(
        Node::new("sl", "Slice", vec!["a".into()], vec!["s".into()])
            .with_attr("starts", AttrValue::Ints(vec![1]))
            .with_attr("ends", AttrValue::Ints(vec![i64::MAX])),
    );
    graph.add_node(Node::new("abs2", "Abs", vec!["s".into()], vec!["y".into()]));

    let session = session_for(graph, vec![])?;
    assert_eq!(op_counts(&session)?.get("Slice"), Some(&1));
    let out = run_one(
        &session,
        feeds(vec![("x", f32_tensor(vec![5.0, -6.0, 7.0], vec![3]))]),
        "y",
    )?;
    assert_eq!(out, vec![6.0, 7.0]);
    Ok(())
}

#[test]
fn constant_folding_precomputes_initializer_nodes() -> Result<()> {
    let mut graph = Graph::new("fold");
    graph.add_input(ValueInfo::new("x", DType::F32));
    graph.add_output("y");
    graph.add_initializer("a", f32_tensor(vec![1.0, 2.0], vec![2]));
    graph.add_initializer("b", f32_tensor(vec![10.0, 20.0], vec![2]));
    graph.add_node(Node::new(
        "add",
        "Add",
        vec!["a".into(), "b".into()],
        vec!["c".into()],
    ));
    graph.add_node(Node::new(
        "mul",
        "Mul",
        vec!["x".into(), "c".into()],
        vec!["y".into()],
    ));

    let session = session_for(graph, vec![])?;
    let counts = op_counts(&session)?;
    assert_eq!(counts.get("Add"), None);
    assert_eq!(counts.get("Mul"), Some(&1));

    let out = run_one(
        &session,
        feeds(vec![("x", f32_tensor(vec![1.0, 1.0], vec![2]))]),
        "y",
    )?;
    assert_eq!(out, vec![11.0, 22.0]);
    Ok(())
}

#[test]
fn graph_of_constants_folds_to_empty_runtime_graph() -> Result<()> {
    let mut graph = Graph::new("all-const");
    graph.add_output("c");
    graph.add_initializer("a", f32_tensor(vec![1.0], vec![1]));
    graph.add_initializer("b", f32_tensor(vec![2.0], vec![1]));
    graph.add_node(Node::new(
        "add",
        "Add",
        vec!["a".into(), "b".into()],
        vec!["c".into()],
    ));

    let session = session_for(graph, vec![])?;
    assert_eq!(session.session_state()?.graph().num_nodes(), 0);
    let out = run_one(&session, HashMap::new(), "c")?;
    assert_eq!(out, vec![3.0]);
    Ok(())
}

/// The literal fold: γ=[2,2], β=[1,1], μ=[0,0], σ²=[3,3], ε=1 gives
/// s = 2/sqrt(4) = 1, so W is unchanged and the synthesised bias is β.
#[test]
fn conv_bn_fusion_literal_parameters() -> Result<()> {
    let mut graph = Graph::new("conv-bn");
    graph.add_input(ValueInfo::new("x", DType::F32));
    graph.add_output("y");
    graph.add_initializer("w", f32_tensor(vec![1.0, 2.0, 3.0, 4.0], vec![2, 2, 1, 1]));
    graph.add_initializer("gamma", f32_tensor(vec![2.0, 2.0], vec![2]));
    graph.add_initializer("beta", f32_tensor(vec![1.0, 1.0], vec![2]));
    graph.add_initializer("mean", f32_tensor(vec![0.0, 0.0], vec![2]));
    graph.add_initializer("var", f32_tensor(vec![3.0, 3.0], vec![2]));
    graph.add_node(Node::new(
        "conv",
        "Conv",
        vec!["x".into(), "w".into()],
        vec!["c".into()],
    ));
    graph.add_node(
        Node::new(
            "bn",
            "BatchNormalization",
            vec![
                "c".into(),
                "gamma".into(),
                "beta".into(),
                "mean".into(),
                "var".into(),
            ],
            vec!["b".into()],
        )
        .with_version(7)
        .with_attr("epsilon", AttrValue::Float(1.0)),
    );
    graph.add_node(Node::new("fin", "Abs", vec!["b".into()], vec!["y".into()]));

    let session = session_for(graph, vec![Box::new(ConvBnFusion)])?;
    let counts = op_counts(&session)?;
    assert_eq!(counts.get("BatchNormalization"), None);
    assert_eq!(counts.get("Conv"), Some(&1));

    let state = session.session_state()?;
    let (_, conv) = state
        .graph()
        .nodes()
        .next()
        .expect("fused conv node present");
    assert_eq!(conv.inputs.len(), 3);
    assert_eq!(conv.inputs[2], "beta");

    let w = state
        .initializer_value(state.slot_of("w").map_err(anyhow::Error::msg)?)
        .expect("w initializer");
    match w.as_ref() {
        daginfer::TensorValue::F32(t) => assert_eq!(t.as_slice(), &[1.0, 2.0, 3.0, 4.0]),
        other => panic!("unexpected dtype {}", other.dtype()),
    }
    let b = state
        .initializer_value(state.slot_of("beta").map_err(anyhow::Error::msg)?)
        .expect("bias initializer");
    match b.as_ref() {
        daginfer::TensorValue::F32(t) => assert_eq!(t.as_slice(), &[1.0, 1.0]),
        other => panic!("unexpected dtype {}", other.dtype()),
    }

    // 1x2x2x2 input through the 1x1 kernels: y[c] = x[c]*w diag + 1.
    let x = f32_tensor(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0], vec![1, 2, 2, 2]);
    let out = run_one(&session, feeds(vec![("x", x)]), "y")?;
    let expected = [
        1.0 + 1.0 * 1.0 + 2.0 * 5.0,
        1.0 + 1.0 * 2.0 + 2.0 * 6.0,
        1.0 + 1.0 * 3.0 + 2.0 * 7.0,
        1.0 + 1.0 * 4.0 + 2.0 * 8.0,
        1.0 + 3.0 * 1.0 + 4.0 * 5.0,
        1.0 + 3.0 * 2.0 + 4.0 * 6.0,
        1.0 + 3.0 * 3.0 + 4.0 * 7.0,
        1.0 + 3.0 * 4.0 + 4.0 * 8.0,
    ];
    assert_close(&out, &expected, 1e-5);
    Ok(())
}

fn conv_chain_graph(epilogue: Option<(&str, TensorValue)>, activation: Option<&str>) -> Graph {
    let mut graph = Graph::new("conv-chain");
    graph.add_input(ValueInfo::new("x", DType::F32));
    graph.add_output("y");
    graph.add_initializer(
        "w",
        f32_tensor(vec![0.5, -1.0, 2.0, 0.25], vec![2, 2, 1, 1]),
    );
    graph.add_initializer("bias", f32_tensor(vec![0.1, -0.2], vec![2]));
    let mut last = "c".to_string();
    graph.add_node(Node::new(
        "conv",
        "Conv",
        vec!["x".into(), "w".into(), "bias".into()],
        vec!["c".into()],
    ));
    if let Some((op, operand)) = epilogue {
        graph.add_initializer("k", operand);
        graph.add_node(Node::new(
            "epi",
            op,
            vec![last.clone(), "k".into()],
            vec!["e".into()],
        ));
        last = "e".to_string();
    }
    if let Some(act) = activation {
        graph.add_node(Node::new("act", act, vec![last.clone()], vec!["a".into()]));
        last = "a".to_string();
    }
    graph.add_node(Node::new(
        "fin",
        "Identity",
        vec![last],
        vec!["y".into()],
    ));
    graph
}

fn assert_equivalent(
    fused: &Session,
    reference: &Session,
    tol: f32,
) -> Result<()> {
    let x = f32_tensor(
        vec![0.5, -1.5, 2.0, 3.5, -0.25, 1.25, -2.0, 0.75],
        vec![1, 2, 2, 2],
    );
    let a = run_one(fused, feeds(vec![("x", x.clone())]), "y")?;
    let b = run_one(reference, feeds(vec![("x", x)]), "y")?;
    assert_close(&a, &b, tol);
    Ok(())
}

fn reference_session(graph: Graph) -> Result<Session> {
    let mut session = Session::new(SessionOptions {
        parallel_execution: false,
        enable_default_rewrites: false,
        ..SessionOptions::default()
    });
    session.load_model(Model::from_graph(graph))?;
    session.initialize()?;
    Ok(session)
}

#[test]
fn conv_mul_fusion_folds_per_channel_scale() -> Result<()> {
    let scale = f32_tensor(vec![3.0, -2.0], vec![2, 1, 1]);
    let fused = session_for(
        conv_chain_graph(Some(("Mul", scale.clone())), None),
        vec![Box::new(ConvMulFusion)],
    )?;
    assert_eq!(op_counts(&fused)?.get("Mul"), None);
    let reference = reference_session(conv_chain_graph(Some(("Mul", scale)), None))?;
    assert_equivalent(&fused, &reference, 1e-5)
}

#[test]
fn conv_mul_fusion_folds_scalar_scale() -> Result<()> {
    let scale = f32_tensor(vec![0.5], vec![]);
    let fused = session_for(
        conv_chain_graph(Some(("Mul", scale.clone())), None),
        vec![Box::new(ConvMulFusion)],
    )?;
    assert_eq!(op_counts(&fused)?.get("Mul"), None);
    let reference = reference_session(conv_chain_graph(Some(("Mul", scale)), None))?;
    assert_equivalent(&fused, &reference, 1e-5)
}

#[test]
fn conv_add_fusion_folds_additive_constant() -> Result<()> {
    let addend = f32_tensor(vec![1.0, -4.0], vec![2, 1, 1]);
    let fused = session_for(
        conv_chain_graph(Some(("Add", addend.clone())), None),
        vec![Box::new(ConvAddFusion)],
    )?;
    assert_eq!(op_counts(&fused)?.get("Add"), None);
    let reference = reference_session(conv_chain_graph(Some(("Add", addend)), None))?;
    assert_equivalent(&fused, &reference, 1e-5)
}

#[test]
fn conv_activation_fusion_creates_fused_node() -> Result<()> {
    for act in ["Relu", "Sigmoid", "Softsign", "Tanh", "LeakyRelu"] {
        let fused = session_for(
            conv_chain_graph(None, Some(act)),
            vec![Box::new(ConvActivationFusion)],
        )?;
        let counts = op_counts(&fused)?;
        assert_eq!(counts.get("FusedConv"), Some(&1), "activation {}", act);
        assert_eq!(counts.get("Conv"), None);
        assert_eq!(counts.get(act), None);
        let reference = reference_session(conv_chain_graph(None, Some(act)))?;
        assert_equivalent(&fused, &reference, 1e-5)?;
    }
    Ok(())
}

#[test]
fn unsqueeze_of_constant_folds_at_plan_time() -> Result<()> {
    let mut graph = Graph::new("unsqueeze");
    graph.add_input(ValueInfo::new("x", DType::F32));
    graph.add_output("y");
    graph.add_initializer("c", f32_tensor(vec![10.0, 20.0], vec![2]));
    graph.add_node(
        Node::new("un", "Unsqueeze", vec!["c".into()], vec!["cu".into()])
            .with_attr("axes", AttrValue::Ints(vec![1])),
    );
    graph.add_node(Node::new(
        "add",
        "Add",
        vec!["x".into(), "cu".into()],
        vec!["y".into()],
    ));

    let session = session_for(graph, vec![Box::new(UnsqueezeElimination)])?;
    assert_eq!(op_counts(&session)?.get("Unsqueeze"), None);

    let out = run_one(
        &session,
        feeds(vec![("x", f32_tensor(vec![1.0, 2.0, 3.0, 4.0], vec![2, 2]))]),
        "y",
    )?;
    assert_eq!(out, vec![11.0, 12.0, 23.0, 24.0]);
    Ok(())
}

/// The fold applies to every attribute-axes version of the op, not just
/// version 1.
#[test]
fn unsqueeze_fold_covers_attribute_axes_versions() -> Result<()> {
    let mut graph = Graph::new("unsqueeze-v11");
    graph.add_input(ValueInfo::new("x", DType::F32));
    graph.add_output("y");
    graph.add_initializer("c", f32_tensor(vec![10.0, 20.0], vec![2]));
    graph.add_node(
        Node::new("un", "Unsqueeze", vec!["c".into()], vec!["cu".into()])
            .with_version(11)
            .with_attr("axes", AttrValue::Ints(vec![1])),
    );
    graph.add_node(Node::new(
        "add",
        "Add",
        vec!["x".into(), "cu".into()],
        vec!["y".into()],
    ));

    // Default rewrites stay off so only the unsqueeze fold can act.
    let mut session = Session::new(SessionOptions {
        parallel_execution: false,
        enable_default_rewrites: false,
        ..SessionOptions::default()
    });
    session.load_model(Model::from_graph(graph))?;
    session.register_transformer(Box::new(UnsqueezeElimination))?;
    session.initialize()?;
    assert_eq!(op_counts(&session)?.get("Unsqueeze"), None);

    let out = run_one(
        &session,
        feeds(vec![("x", f32_tensor(vec![1.0, 2.0, 3.0, 4.0], vec![2, 2]))]),
        "y",
    )?;
    assert_eq!(out, vec![11.0, 12.0, 23.0, 24.0]);
    Ok(())
}

/// A second initialize of the same rewritten graph performs no further
/// modification: the rewrite set reaches a fixed point.
#[test]
fn rewrites_reach_a_fixed_point() -> Result<()> {
    use daginfer::rewrite::{
        EliminateIdentity, GraphTransformerManager, RuleBasedTransformer,
    };

    let mut graph = Graph::new("fp");
    graph.add_input(ValueInfo::new("x", DType::F32));
    graph.add_output("y");
    graph.add_node(Node::new("abs", "Abs", vec!["x".into()], vec!["a".into()]));
    graph.add_node(Node::new("i1", "Identity", vec!["a".into()], vec!["b".into()]));
    graph.add_node(Node::new("i2", "Identity", vec!["b".into()], vec!["c".into()]));
    graph.add_node(Node::new("abs2", "Abs", vec!["c".into()], vec!["y".into()]));

    let mut manager = GraphTransformerManager::new(5);
    let mut rules = RuleBasedTransformer::new("rules");
    rules.register_for("Identity", Box::new(EliminateIdentity));
    manager.register(Box::new(rules));

    manager.apply_all(&mut graph)?;
    assert_eq!(graph.num_nodes(), 2);

    manager.apply_all(&mut graph)?;
    assert_eq!(graph.num_nodes(), 2);
    Ok(())
}

/// A buggy rewrite that introduces a cycle is caught by resolve and
/// surfaces as invalid-model.
#[test]
fn cycle_introduced_by_rewrite_is_detected() -> Result<()> {
    use daginfer::rewrite::{GraphTransformer, GraphTransformerManager};

    struct CycleMaker;
    impl GraphTransformer for CycleMaker {
        fn name(&self) -> &str {
            "cycle-maker"
        }
        fn apply(&self, graph: &mut Graph) -> daginfer::Result<bool> {
            graph.add_node(Node::new("u", "Abs", vec!["v".into()], vec!["w".into()]));
            graph.add_node(Node::new("t", "Abs", vec!["w".into()], vec!["v".into()]));
            Ok(true)
        }
    }

    let mut graph = Graph::new("cyclic");
    graph.add_input(ValueInfo::new("x", DType::F32));
    graph.add_output("y");
    graph.add_node(Node::new("abs", "Abs", vec!["x".into()], vec!["y".into()]));

    let mut manager = GraphTransformerManager::new(2);
    manager.register(Box::new(CycleMaker));
    let err = manager.apply_all(&mut graph).unwrap_err();
    assert!(matches!(err, daginfer::Error::InvalidModel(_)));
    Ok(())
}
