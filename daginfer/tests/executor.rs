//! Parallel-executor behavior: concurrency, cancellation, failure
//! containment, and parity with the sequential walk.

mod common;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use rand::Rng;

use daginfer::{
    AttrValue, DType, Error, Graph, Model, Node, RunOptions, Session, SessionOptions, ValueInfo,
};

use common::{assert_close, f32_tensor, feeds, fetch_f32, names, TestOpsProvider};

fn parallel_session(graph: Graph, provider: Option<Arc<TestOpsProvider>>) -> Result<Session> {
    let mut session = Session::new(SessionOptions {
        intra_op_threads: Some(2),
        ..SessionOptions::default()
    });
    session.load_model(Model::from_graph(graph))?;
    if let Some(provider) = provider {
        session.register_provider(provider)?;
        session.register_provider(Arc::new(daginfer::CpuExecutionProvider::new()))?;
    }
    session.initialize()?;
    Ok(session)
}

/// Two independent branches must land on different worker threads when
/// the pool has at least two workers.
#[test]
fn independent_branches_run_on_distinct_threads() -> Result<()> {
    let mut graph = Graph::new("branches");
    graph.add_input(ValueInfo::new("x", DType::F32));
    graph.add_input(ValueInfo::new("z", DType::F32));
    graph.add_output("xb");
    graph.add_output("zb");
    graph.add_node(Node::new("a", "ThreadTag", vec!["x".into()], vec!["xa".into()]));
    graph.add_node(Node::new("b", "ThreadTag", vec!["xa".into()], vec!["xb".into()]));
    graph.add_node(Node::new("c", "ThreadTag", vec!["z".into()], vec!["za".into()]));
    graph.add_node(Node::new("d", "ThreadTag", vec!["za".into()], vec!["zb".into()]));

    let provider = Arc::new(TestOpsProvider::new());
    let session = parallel_session(graph, Some(provider.clone()))?;

    let outputs = session.run(
        &RunOptions::default(),
        feeds(vec![
            ("x", f32_tensor(vec![1.0], vec![1])),
            ("z", f32_tensor(vec![2.0], vec![1])),
        ]),
        &names(&["xb", "zb"]),
    )?;
    assert_eq!(fetch_f32(&outputs[0])?, vec![1.0]);
    assert_eq!(fetch_f32(&outputs[1])?, vec![2.0]);

    let seen = provider.seen_threads.lock().expect("seen threads");
    assert_eq!(seen.len(), 4);
    let tid = |name: &str| {
        seen.iter()
            .find(|(n, _)| n == name)
            .map(|(_, t)| *t)
            .expect("node ran")
    };
    assert_ne!(tid("b"), tid("d"), "branches shared a worker thread");
    let distinct: HashSet<_> = seen.iter().map(|(_, t)| *t).collect();
    assert!(distinct.len() >= 2);
    Ok(())
}

/// Setting the terminate flag mid-flight cancels the run; the scheduler
/// still drains and the session stays usable.
#[test]
fn cancellation_mid_flight_returns_cancelled() -> Result<()> {
    let mut graph = Graph::new("cancel");
    graph.add_input(ValueInfo::new("x", DType::F32));
    graph.add_output("y");
    graph.add_node(
        Node::new("s1", "Sleep", vec!["x".into()], vec!["a".into()])
            .with_attr("millis", AttrValue::Int(80)),
    );
    graph.add_node(
        Node::new("s2", "Sleep", vec!["a".into()], vec!["b".into()])
            .with_attr("millis", AttrValue::Int(80)),
    );
    graph.add_node(Node::new("abs", "Abs", vec!["b".into()], vec!["y".into()]));

    let provider = Arc::new(TestOpsProvider::new());
    let session = parallel_session(graph, Some(provider))?;

    let terminate = Arc::new(AtomicBool::new(false));
    let trigger = terminate.clone();
    let setter = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(20));
        trigger.store(true, Ordering::Relaxed);
    });

    let options = RunOptions {
        terminate: Some(terminate.clone()),
        ..RunOptions::default()
    };
    let err = session
        .run(
            &options,
            feeds(vec![("x", f32_tensor(vec![1.0], vec![1]))]),
            &names(&["y"]),
        )
        .unwrap_err();
    assert!(matches!(err, Error::Cancelled), "got {:?}", err);
    setter.join().expect("setter thread");

    // The drain completed; a fresh run on the same session succeeds.
    terminate.store(false, Ordering::Relaxed);
    let outputs = session.run(
        &RunOptions::default(),
        feeds(vec![("x", f32_tensor(vec![-3.0], vec![1]))]),
        &names(&["y"]),
    )?;
    assert_eq!(fetch_f32(&outputs[0])?, vec![3.0]);
    Ok(())
}

/// One failing kernel fails the whole run with its node name; the
/// independent branch still drains.
#[test]
fn kernel_failure_fails_the_run_and_drains() -> Result<()> {
    let mut graph = Graph::new("fail");
    graph.add_input(ValueInfo::new("x", DType::F32));
    graph.add_output("y");
    graph.add_output("ok");
    graph.add_node(Node::new("boom", "Fail", vec!["x".into()], vec!["f".into()]));
    graph.add_node(Node::new("after", "Abs", vec!["f".into()], vec!["y".into()]));
    graph.add_node(Node::new("other", "Abs", vec!["x".into()], vec!["ok".into()]));

    let provider = Arc::new(TestOpsProvider::new());
    let session = parallel_session(graph, Some(provider))?;

    let err = session
        .run(
            &RunOptions::default(),
            feeds(vec![("x", f32_tensor(vec![1.0], vec![1]))]),
            &names(&["y", "ok"]),
        )
        .unwrap_err();
    match err {
        Error::KernelFailed { node, .. } => assert_eq!(node, "boom"),
        other => panic!("expected KernelFailed, got {:?}", other),
    }

    // Partial outputs are never surfaced, but the session survives.
    let outputs = session.run(
        &RunOptions::default(),
        feeds(vec![("x", f32_tensor(vec![-2.0], vec![1]))]),
        &names(&["ok"]),
    )?;
    assert_eq!(fetch_f32(&outputs[0])?, vec![2.0]);
    Ok(())
}

#[test]
fn empty_graph_run_succeeds_with_no_outputs() -> Result<()> {
    let graph = Graph::new("empty");
    let session = parallel_session(graph, None)?;
    let outputs = session.run(&RunOptions::default(), HashMap::new(), &[])?;
    assert!(outputs.is_empty());
    Ok(())
}

/// Parallel and sequential execution agree on a fan-out/fan-in graph
/// with randomized inputs.
#[test]
fn parallel_matches_sequential_reference() -> Result<()> {
    let build = || {
        let mut graph = Graph::new("diamond");
        graph.add_input(ValueInfo::new("x", DType::F32));
        graph.add_output("y");
        graph.add_initializer("w", f32_tensor(vec![2.0; 16], vec![16]));
        graph.add_node(Node::new("abs", "Abs", vec!["x".into()], vec!["a".into()]));
        graph.add_node(Node::new(
            "mul",
            "Mul",
            vec!["a".into(), "w".into()],
            vec!["m".into()],
        ));
        graph.add_node(Node::new(
            "add",
            "Add",
            vec!["a".into(), "m".into()],
            vec!["s".into()],
        ));
        graph.add_node(Node::new(
            "max",
            "Max",
            vec!["s".into(), "m".into()],
            vec!["y".into()],
        ));
        graph
    };

    let parallel = parallel_session(build(), None)?;
    let mut sequential = Session::new(SessionOptions {
        parallel_execution: false,
        ..SessionOptions::default()
    });
    sequential.load_model(Model::from_graph(build()))?;
    sequential.initialize()?;

    let mut rng = rand::thread_rng();
    for _ in 0..5 {
        let data: Vec<f32> = (0..16).map(|_| rng.gen_range(-4.0..4.0)).collect();
        let x = f32_tensor(data, vec![16]);
        let a = parallel.run(
            &RunOptions::default(),
            feeds(vec![("x", x.clone())]),
            &names(&["y"]),
        )?;
        let b = sequential.run(
            &RunOptions::default(),
            feeds(vec![("x", x)]),
            &names(&["y"]),
        )?;
        assert_close(&fetch_f32(&a[0])?, &fetch_f32(&b[0])?, 0.0);
    }
    Ok(())
}

/// Concurrent runs on one session share the immutable plan.
#[test]
fn concurrent_runs_share_the_plan() -> Result<()> {
    let mut graph = Graph::new("shared");
    graph.add_input(ValueInfo::new("x", DType::F32));
    graph.add_output("y");
    graph.add_node(Node::new("abs", "Abs", vec!["x".into()], vec!["y".into()]));

    let session = Arc::new(parallel_session(graph, None)?);
    let mut handles = Vec::new();
    for i in 0..4 {
        let session = session.clone();
        handles.push(std::thread::spawn(move || -> Result<()> {
            let scale = (i + 1) as f32;
            let outputs = session.run(
                &RunOptions::default(),
                feeds(vec![("x", f32_tensor(vec![-scale], vec![1]))]),
                &names(&["y"]),
            )?;
            assert_eq!(fetch_f32(&outputs[0])?, vec![scale]);
            Ok(())
        }));
    }
    for handle in handles {
        handle.join().expect("run thread")?;
    }
    Ok(())
}

/// After initialize, every node input is either an initializer, a feed
/// slot, or the output of a topologically earlier node.
#[test]
fn plan_inputs_are_always_satisfiable() -> Result<()> {
    let mut graph = Graph::new("invariant");
    graph.add_input(ValueInfo::new("x", DType::F32));
    graph.add_output("y");
    graph.add_initializer("k", f32_tensor(vec![1.0], vec![1]));
    graph.add_node(Node::new("abs", "Abs", vec!["x".into()], vec!["a".into()]));
    graph.add_node(Node::new(
        "add",
        "Add",
        vec!["a".into(), "k".into()],
        vec!["y".into()],
    ));

    let session = parallel_session(graph, None)?;
    let state = session.session_state()?;
    let mut produced: HashSet<String> = HashSet::new();
    for info in state.graph().inputs() {
        produced.insert(info.name.clone());
    }
    for &index in state.topo() {
        let node = state.graph().node(index).expect("node in topo");
        for input in node.inputs.iter().filter(|n| !n.is_empty()) {
            let slot = state.slot_of(input).map_err(anyhow::Error::msg)?;
            let is_initializer = state.initializer_value(slot).is_some();
            assert!(
                is_initializer || produced.contains(input),
                "input '{}' of node '{}' has no source",
                input,
                node.name
            );
        }
        for output in &node.outputs {
            produced.insert(output.clone());
        }
    }
    Ok(())
}
