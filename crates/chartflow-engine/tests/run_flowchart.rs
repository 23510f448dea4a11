use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexMap;
use serde_json::json;

use chartflow_core::error::ChartflowError;
use chartflow_core::event::EventBus;
use chartflow_core::types::RunEvent;
use chartflow_engine::{Flowchart, FlowchartDocument, FlowchartRunner, Node, COMPLETE, HAS_MORE};
use chartflow_test_utils::MockGenerator;

fn flowchart(nodes: Vec<(&str, Node)>) -> Flowchart {
    let nodes: IndexMap<String, Node> =
        nodes.into_iter().map(|(id, n)| (id.to_string(), n)).collect();
    Flowchart::new(nodes).unwrap()
}

fn yes_no_chart() -> Flowchart {
    flowchart(vec![
        ("A", Node::basic("Should we proceed?").connect("Yes", "B").connect("No", "C")),
        ("B", Node::basic("Say go")),
        ("C", Node::basic("Say stop")),
    ])
}

fn fruit_chart() -> Flowchart {
    flowchart(vec![
        (
            "list",
            Node::basic("List the fruits")
                .with_schema(json!({
                    "type": "object",
                    "properties": {"fruits": {"type": "array", "items": {"type": "string"}}}
                }))
                .connect("next", "each"),
        ),
        ("each", Node::loop_start("fruit", "fruits").connect("body", "describe")),
        ("describe", Node::basic("Describe ${fruit}").connect("next", "more")),
        (
            "more",
            Node::loop_continue()
                .connect(HAS_MORE, "each")
                .connect(COMPLETE, "summary"),
        ),
        ("summary", Node::basic("Summarize the fruits")),
    ])
}

fn path_of(output: &chartflow_engine::RunOutput) -> Vec<String> {
    output.path.iter().map(ToString::to_string).collect()
}

#[tokio::test]
async fn test_decision_end_to_end() {
    let decision = json!({"reasoning": "the user agreed", "decision": "Yes"});
    let mock = Arc::new(
        MockGenerator::new()
            .structured("Should we proceed?", decision.clone())
            .text("Say go", "go")
            .text("Say stop", "stop"),
    );
    let runner = FlowchartRunner::new(yes_no_chart(), mock.clone());

    let output = runner.run("").await.unwrap();

    assert_eq!(output.text, "go");
    assert_eq!(output.extracted.len(), 1);
    assert_eq!(output.extracted["A_0"], decision);
    assert_eq!(output.decisions["A_0"].next, "B");
    assert!(!output.decisions["A_0"].fell_back);
    assert_eq!(path_of(&output), vec!["A_0", "B_0"]);
}

#[tokio::test]
async fn test_unknown_decision_takes_first_connection() {
    let mock = Arc::new(
        MockGenerator::new()
            .structured("Should we proceed?", json!({"reasoning": "unsure", "decision": "Maybe"}))
            .text("Say go", "go")
            .text("Say stop", "stop"),
    );
    let runner = FlowchartRunner::new(yes_no_chart(), mock).with_lookahead_depth(0);

    let output = runner.run("").await.unwrap();

    assert_eq!(output.text, "go");
    assert_eq!(output.decisions["A_0"].label, "Maybe");
    assert!(output.decisions["A_0"].fell_back);
}

#[tokio::test]
async fn test_loop_runs_body_once_per_item() {
    let mock = Arc::new(
        MockGenerator::new()
            .structured("List the fruits", json!({"fruits": ["apple", "banana", "cherry"]}))
            .text("Describe apple", "red")
            .text("Describe banana", "yellow")
            .text("Describe cherry", "dark red")
            .text("Summarize", "three fruits"),
    );
    let runner = FlowchartRunner::new(fruit_chart(), mock.clone());

    let output = runner.run("").await.unwrap();

    assert_eq!(output.text, "three fruits");
    assert_eq!(
        path_of(&output),
        vec![
            "list_0", "each_0", "describe_0", "more_0", "describe_1", "more_1", "describe_2",
            "more_2", "summary_0"
        ]
    );
    for fruit in ["apple", "banana", "cherry"] {
        assert_eq!(mock.calls_for(&format!("Describe {fruit}")), 1);
    }
    assert!(mock.prompts().iter().all(|p| !p.contains("${fruit}")));
    // Loop-control nodes never reach the collaborator.
    assert_eq!(mock.total_calls(), 5);
}

#[tokio::test]
async fn test_empty_collection_skips_loop() {
    let mock = Arc::new(
        MockGenerator::new()
            .structured("List the fruits", json!({"fruits": []}))
            .text("Summarize", "nothing to say"),
    );
    let runner = FlowchartRunner::new(fruit_chart(), mock.clone());

    let output = runner.run("").await.unwrap();

    assert_eq!(output.text, "nothing to say");
    assert_eq!(path_of(&output), vec!["list_0", "each_0", "summary_0"]);
    assert_eq!(mock.total_calls(), 2);
}

#[tokio::test]
async fn test_unresolved_placeholder_fails_run() {
    let chart = || {
        flowchart(vec![
            ("ask", Node::basic("Tell me about ${missing}").connect("next", "end")),
            ("end", Node::basic("Wrap up")),
        ])
    };
    let mock = Arc::new(MockGenerator::new().text("Tell me", "?").text("Wrap up", "bye"));

    let strict = FlowchartRunner::new(chart(), mock.clone()).with_lookahead_depth(0);
    let err = strict.run("").await.unwrap_err();
    assert!(err.is_configuration());
    assert!(err.to_string().contains("${missing}"));
    assert_eq!(mock.total_calls(), 0);

    let speculative = FlowchartRunner::new(chart(), mock.clone());
    assert!(matches!(
        speculative.run("").await,
        Err(ChartflowError::UnresolvedPlaceholder { .. })
    ));
    assert!(mock.prompts().iter().all(|p| !p.contains("${missing}")));
}

#[tokio::test]
async fn test_each_instance_executes_once() {
    let mock = Arc::new(
        MockGenerator::new()
            .text("Step one", "1")
            .delay("Step one", Duration::from_millis(40))
            .text("Step two", "2")
            .text("Step three", "3"),
    );
    let chart = flowchart(vec![
        ("a", Node::basic("Step one").connect("next", "b")),
        ("b", Node::basic("Step two").connect("next", "c")),
        ("c", Node::basic("Step three")),
    ]);
    let runner = FlowchartRunner::new(chart, mock.clone());

    let output = runner.run("").await.unwrap();

    assert_eq!(output.text, "3");
    assert_eq!(mock.calls_for("Step one"), 1);
    assert_eq!(mock.calls_for("Step two"), 1);
    assert_eq!(mock.calls_for("Step three"), 1);
    assert_eq!(output.stats.launched, 2);
    assert_eq!(output.stats.reused, 2);
}

#[tokio::test]
async fn test_independent_nodes_overlap() {
    let mock = Arc::new(
        MockGenerator::new()
            .text("Step one", "1")
            .delay("Step one", Duration::from_millis(50))
            .text("Step two", "2")
            .delay("Step two", Duration::from_millis(50))
            .text("Step three", "3"),
    );
    let chart = flowchart(vec![
        ("a", Node::basic("Step one").connect("next", "b")),
        ("b", Node::basic("Step two").connect("next", "c")),
        ("c", Node::basic("Step three")),
    ]);
    let runner = FlowchartRunner::new(chart, mock.clone());

    runner.run("").await.unwrap();

    assert!(mock.peak_in_flight() >= 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_each_instance_executes_once_on_worker_threads() {
    let mock = Arc::new(
        MockGenerator::new()
            .text("Step one", "1")
            .delay("Step one", Duration::from_millis(40))
            .text("Step two", "2")
            .text("Step three", "3"),
    );
    let chart = flowchart(vec![
        ("a", Node::basic("Step one").connect("next", "b")),
        ("b", Node::basic("Step two").connect("next", "c")),
        ("c", Node::basic("Step three")),
    ]);
    let runner = FlowchartRunner::new(chart, mock.clone());

    for _ in 0..10 {
        let output = runner.run("").await.unwrap();
        assert_eq!(output.text, "3");
        assert_eq!(output.stats.launched, 2);
        assert_eq!(output.stats.reused, 2);
    }
    assert_eq!(mock.calls_for("Step one"), 10);
    assert_eq!(mock.calls_for("Step two"), 10);
    assert_eq!(mock.calls_for("Step three"), 10);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_independent_nodes_overlap_on_worker_threads() {
    let mock = Arc::new(
        MockGenerator::new()
            .text("Step one", "1")
            .delay("Step one", Duration::from_millis(50))
            .text("Step two", "2")
            .delay("Step two", Duration::from_millis(50))
            .text("Step three", "3"),
    );
    let chart = flowchart(vec![
        ("a", Node::basic("Step one").connect("next", "b")),
        ("b", Node::basic("Step two").connect("next", "c")),
        ("c", Node::basic("Step three")),
    ]);
    let runner = FlowchartRunner::new(chart, mock.clone());

    let output = runner.run("").await.unwrap();

    assert_eq!(output.text, "3");
    assert!(mock.peak_in_flight() >= 2);
    assert_eq!(mock.total_calls(), 3);
}

fn rejoining_chart() -> Flowchart {
    flowchart(vec![
        (
            "s",
            Node::basic("Who is visiting?")
                .with_schema(json!({"type": "object", "properties": {"name": {"type": "string"}}}))
                .connect("next", "a"),
        ),
        ("a", Node::basic("Which way?").connect("Left", "c").connect("Right", "b")),
        ("c", Node::basic("Take the long way").connect("next", "d")),
        (
            "b",
            Node::basic("Ask the name again")
                .with_schema(json!({"type": "object", "properties": {"name": {"type": "string"}}}))
                .connect("next", "d"),
        ),
        ("d", Node::basic("Hello ${name}")),
    ])
}

fn rejoining_mock() -> Arc<MockGenerator> {
    Arc::new(
        MockGenerator::new()
            .structured("Who is visiting?", json!({"name": "stale"}))
            .structured("Which way?", json!({"reasoning": "shorter", "decision": "Right"}))
            .text("Take the long way", "walking")
            .structured("Ask the name again", json!({"name": "fresh"}))
            .text("Hello stale", "stale greeting")
            .text("Hello fresh", "fresh greeting"),
    )
}

#[tokio::test]
async fn test_rejoining_branch_uses_nearest_producer() {
    for depth in [0, 1, 6] {
        let mock = rejoining_mock();
        let runner = FlowchartRunner::new(rejoining_chart(), mock.clone()).with_lookahead_depth(depth);

        let output = runner.run("").await.unwrap();

        assert_eq!(output.text, "fresh greeting", "lookahead depth {depth}");
        assert_eq!(path_of(&output), vec!["s_0", "a_0", "b_0", "d_0"]);
        assert_eq!(mock.calls_for("Hello fresh"), 1);
        assert_eq!(mock.calls_for("Hello stale"), 0);
    }
}

#[tokio::test]
async fn test_no_background_work_outlives_run() {
    let mock = Arc::new(
        MockGenerator::new()
            .structured("Should we proceed?", json!({"reasoning": "", "decision": "Yes"}))
            .text("Say go", "go")
            .text("Say stop", "stop")
            .delay("Say stop", Duration::from_millis(100)),
    );
    let runner = FlowchartRunner::new(yes_no_chart(), mock.clone());

    let output = runner.run("").await.unwrap();

    assert_eq!(mock.in_flight(), 0);
    assert_eq!(mock.calls_for("Say stop"), 1);
    assert_eq!(output.stats.launched, 2);
    assert_eq!(output.stats.joined, output.stats.launched);
}

#[tokio::test]
async fn test_unneeded_background_failure_is_discarded() {
    let mock = Arc::new(
        MockGenerator::new()
            .structured("Should we proceed?", json!({"reasoning": "", "decision": "Yes"}))
            .text("Say go", "go")
            .fail("Say stop", "HTTP 500"),
    );
    let runner = FlowchartRunner::new(yes_no_chart(), mock);

    let output = runner.run("").await.unwrap();

    assert_eq!(output.text, "go");
    assert_eq!(output.stats.discarded_failures, 1);
}

#[tokio::test]
async fn test_needed_background_failure_is_reraised() {
    let mock = Arc::new(
        MockGenerator::new()
            .structured("Should we proceed?", json!({"reasoning": "", "decision": "No"}))
            .text("Say go", "go")
            .fail("Say stop", "HTTP 500"),
    );
    let runner = FlowchartRunner::new(yes_no_chart(), mock.clone());

    let err = runner.run("").await.unwrap_err();

    assert!(matches!(err, ChartflowError::GenerationRequest(m) if m == "HTTP 500"));
    assert_eq!(mock.calls_for("Say stop"), 1);
}

#[tokio::test]
async fn test_failed_run_still_joins_units() {
    let mock = Arc::new(
        MockGenerator::new()
            .text("first", "ok")
            .delay("first", Duration::from_millis(10))
            .fail("second", "HTTP 502")
            .text("third", "late")
            .delay("third", Duration::from_millis(80)),
    );
    let chart = flowchart(vec![
        ("a", Node::basic("first").connect("next", "b")),
        ("b", Node::basic("second").connect("next", "c")),
        ("c", Node::basic("third")),
    ]);
    let runner = FlowchartRunner::new(chart, mock.clone());

    assert!(runner.run("").await.is_err());
    assert_eq!(mock.in_flight(), 0);
    assert_eq!(mock.calls_for("third"), 1);
}

#[tokio::test]
async fn test_concurrent_runs_are_isolated() {
    let mock = Arc::new(
        MockGenerator::new()
            .text("Greet Ada", "Hi Ada")
            .text("Greet Bob", "Hi Bob")
            .structured("Customer: Ada", json!({"name": "Ada"}))
            .structured("Customer: Bob", json!({"name": "Bob"})),
    );
    let chart = flowchart(vec![
        (
            "extract",
            Node::basic("Extract the customer name")
                .with_schema(json!({"type": "object", "properties": {"name": {"type": "string"}}}))
                .connect("next", "greet"),
        ),
        ("greet", Node::basic("Greet ${name}")),
    ]);
    let runner = FlowchartRunner::new(chart, mock.clone());

    let (ada, bob) = tokio::join!(runner.run("Customer: Ada"), runner.run("Customer: Bob"));
    let (ada, bob) = (ada.unwrap(), bob.unwrap());

    assert_eq!(ada.text, "Hi Ada");
    assert_eq!(bob.text, "Hi Bob");
    assert_eq!(ada.extracted["extract_0"]["name"], "Ada");
    assert_eq!(bob.extracted["extract_0"]["name"], "Bob");
    assert_ne!(ada.run_id, bob.run_id);
}

#[tokio::test]
async fn test_single_terminal_returns_text_unchanged() {
    let reply = "  Exactly this, with spacing.\n";
    let mock = Arc::new(MockGenerator::new().text("Only step", reply));
    let runner = FlowchartRunner::new(flowchart(vec![("only", Node::basic("Only step"))]), mock);

    let output = runner.run("some context").await.unwrap();

    assert_eq!(output.text, reply);
    assert!(output.extracted.is_empty());
}

#[tokio::test]
async fn test_run_publishes_events() {
    let bus = Arc::new(EventBus::new(64));
    let mut rx = bus.subscribe();
    let mock = Arc::new(MockGenerator::new().text("Only step", "done"));
    let runner = FlowchartRunner::new(flowchart(vec![("only", Node::basic("Only step"))]), mock)
        .with_events(bus.clone());

    let output = runner.run("").await.unwrap();

    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    assert!(matches!(events.first(), Some(RunEvent::RunStarted { start_node, .. }) if start_node == "only"));
    assert!(matches!(events.last(), Some(RunEvent::RunFinished { succeeded: true, .. })));
    assert!(events.iter().all(|e| e.run_id() == output.run_id));
}

#[tokio::test]
async fn test_run_from_document_files() {
    let mut json_file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
    json_file
        .write_all(
            br#"{
                "system_prompt": "You are an intake assistant.",
                "nodes": {
                    "A": {"text": "Should we proceed?", "connections": {"Yes": "B", "No": "C"}},
                    "B": {"text": "Say go"},
                    "C": {"text": "Say stop"}
                }
            }"#,
        )
        .unwrap();

    let mut toml_file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    toml_file
        .write_all(
            br#"
system_prompt = "Be brief."

[nodes.greet]
text = "Greet the visitor"
"#,
        )
        .unwrap();

    let mock = Arc::new(
        MockGenerator::new()
            .structured("Should we proceed?", json!({"reasoning": "", "decision": "No"}))
            .text("Say go", "go")
            .text("Say stop", "stop")
            .text("Greet the visitor", "Welcome!"),
    );

    let document = FlowchartDocument::load(json_file.path()).unwrap();
    let runner = FlowchartRunner::from_document(&document, mock.clone()).unwrap();
    assert_eq!(runner.run("").await.unwrap().text, "stop");
    assert!(mock.system_prompts()[0].starts_with("You are an intake assistant."));

    let document = FlowchartDocument::load(toml_file.path()).unwrap();
    let runner = FlowchartRunner::from_document(&document, mock).unwrap();
    assert_eq!(runner.run("").await.unwrap().text, "Welcome!");
}
