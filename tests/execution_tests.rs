//! End-to-end tests: building trees, editing them and running them.

use serde_json::json;
use statecraft::builder::{StateBuilder, SELF};
use statecraft::core::{
    DataType, EventLog, IdAllocator, InMemoryLibrary, LibraryReference, PortDirection, State,
    StateChange, StateError, ABORTED, PREEMPTED, SUCCESS,
};
use statecraft::document::{decode, encode, DecodeContext, ScriptRegistry, StateDocument};
use statecraft::execution::{
    script_fn, EmptyScript, ExecutionConfig, ExecutionError, RunContext, Script, ScriptContext,
    ScriptError, StateMachineExecutor,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn sleeper(millis: u64) -> Arc<dyn Script> {
    script_fn(move |ctx: ScriptContext| async move {
        if ctx.sleep(Duration::from_millis(millis)).await {
            Ok(SUCCESS)
        } else {
            Ok(PREEMPTED)
        }
    })
}

fn counting(counter: Arc<AtomicUsize>) -> Arc<dyn Script> {
    script_fn(move |_ctx: ScriptContext| {
        let counter = Arc::clone(&counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(SUCCESS)
        }
    })
}

#[tokio::test]
async fn hierarchy_runs_children_in_transition_order() {
    let ids = IdAllocator::sequential();
    let runs = Arc::new(AtomicUsize::new(0));
    let root = StateBuilder::hierarchy("root")
        .child(StateBuilder::execution("A", counting(Arc::clone(&runs))))
        .child(StateBuilder::execution("B", counting(Arc::clone(&runs))))
        .transition("A", "success", "B")
        .exit("B", "success", "success")
        .build(&ids)
        .unwrap();

    let outcome = root.run(RunContext::default()).await;

    assert_eq!(outcome.id, SUCCESS);
    assert_eq!(runs.load(Ordering::SeqCst), 2);
    let names: Vec<String> = root
        .history()
        .visited()
        .iter()
        .map(|id| root.child(id).unwrap().name())
        .collect();
    assert_eq!(names, vec!["A", "B"]);
    assert!(!root.is_active());
}

#[tokio::test]
async fn preemptive_race_preempts_the_slow_branch() {
    let ids = IdAllocator::sequential();
    let race = StateBuilder::preemptive_concurrency("race")
        .child(StateBuilder::execution("fast", sleeper(10)))
        .child(StateBuilder::execution("slow", sleeper(60_000)))
        .exit("fast", "success", "success")
        .build(&ids)
        .unwrap();
    let slow = race
        .children()
        .into_iter()
        .find(|c| c.name() == "slow")
        .unwrap();

    let outcome = tokio::time::timeout(Duration::from_secs(10), race.run(RunContext::default()))
        .await
        .expect("race should finish once the fast branch wins");

    assert_eq!(outcome.id, SUCCESS);
    assert_eq!(slow.final_outcome().unwrap().id, PREEMPTED);
    assert!(!slow.is_active());
}

#[tokio::test]
async fn barrier_collects_outputs_from_every_branch() {
    let ids = IdAllocator::sequential();
    let producer = |value: i64| {
        script_fn(move |ctx: ScriptContext| async move {
            ctx.set_output("value", json!(value));
            Ok::<_, ScriptError>(SUCCESS)
        })
    };
    let barrier = StateBuilder::barrier_concurrency("all")
        .output("left", DataType::Int, None)
        .output("right", DataType::Int, None)
        .child(StateBuilder::execution("L", producer(1)).output("value", DataType::Int, None))
        .child(StateBuilder::execution("R", producer(2)).output("value", DataType::Int, None))
        .data_flow("L", "value", SELF, "left")
        .data_flow("R", "value", SELF, "right")
        .build(&ids)
        .unwrap();

    let outcome = barrier.run(RunContext::default()).await;

    assert_eq!(outcome.id, SUCCESS);
    let output = barrier.runtime_output();
    assert_eq!(output["left"], json!(1));
    assert_eq!(output["right"], json!(2));
    assert_eq!(barrier.history().steps().len(), 2);
}

#[tokio::test]
async fn executor_stop_preempts_the_whole_tree() {
    let ids = IdAllocator::sequential();
    let root = StateBuilder::hierarchy("root")
        .child(StateBuilder::execution("wait", sleeper(60_000)))
        .build(&ids)
        .unwrap();
    let executor = StateMachineExecutor::new(Arc::clone(&root), ExecutionConfig::default());

    executor.start().unwrap();
    assert!(matches!(
        executor.start(),
        Err(ExecutionError::AlreadyRunning(_))
    ));
    tokio::time::sleep(Duration::from_millis(20)).await;
    executor.stop().unwrap();

    let outcome = executor.join().await.unwrap();
    assert_eq!(outcome.id, PREEMPTED);
    assert!(!executor.is_running());
    assert!(matches!(executor.stop(), Err(ExecutionError::NotStarted(_))));
}

#[tokio::test]
async fn failing_script_aborts_its_container() {
    let ids = IdAllocator::sequential();
    let root = StateBuilder::hierarchy("root")
        .child(StateBuilder::execution(
            "boom",
            script_fn(|_ctx: ScriptContext| async move { Err(ScriptError::failed("no disk")) }),
        ))
        .build(&ids)
        .unwrap();

    let executor = StateMachineExecutor::new(root, ExecutionConfig::default());
    let outcome = executor.run_to_completion(None).await.unwrap();
    assert_eq!(outcome.id, ABORTED);
}

#[tokio::test]
async fn library_state_runs_its_copy() {
    let ids = IdAllocator::sequential();
    let library = Arc::new(InMemoryLibrary::new());
    let reference = LibraryReference::new("math", "double", "1.0");
    let template = StateBuilder::execution(
        "double",
        script_fn(|ctx: ScriptContext| async move {
            let x: i64 = ctx.input_as("x")?;
            ctx.set_output("y", json!(x * 2));
            Ok::<_, ScriptError>(SUCCESS)
        }),
    )
    .input("x", DataType::Int, None)
    .output("y", DataType::Int, None)
    .build(&ids)
    .unwrap();
    library.register(reference.clone(), template);

    let lib = State::library("twice", reference, library.as_ref(), &ids).unwrap();
    lib.set_runtime_input_value(json!({ "x": 4 })).unwrap();

    assert_eq!(lib.run(RunContext::default()).await.id, SUCCESS);
    assert_eq!(lib.runtime_output()["y"], json!(8));
}

#[test]
fn unresolvable_library_leaves_container_unchanged() {
    let ids = IdAllocator::sequential();
    let root = State::hierarchy("root", &ids).unwrap();
    let empty = InMemoryLibrary::new();
    let reference = LibraryReference::new("missing", "thing", "0");

    let result = State::library("lib", reference.clone(), &empty, &ids)
        .and_then(|lib| root.add_state(lib));

    assert_eq!(result, Err(StateError::LibraryNotFound(reference)));
    assert!(root.children().is_empty());
}

#[test]
fn terminal_outcomes_cannot_be_removed() {
    let ids = IdAllocator::sequential();
    let state = State::execution("leaf", Arc::new(EmptyScript), &ids).unwrap();
    for id in [ABORTED, PREEMPTED] {
        assert!(matches!(
            state.remove_outcome(id),
            Err(StateError::InvariantViolation(_))
        ));
    }
    assert!(state.remove_outcome(SUCCESS).is_ok());
}

#[test]
fn removing_a_port_removes_its_data_flows() {
    let ids = IdAllocator::sequential();
    let root = StateBuilder::hierarchy("root")
        .input("n", DataType::Int, None)
        .child(StateBuilder::execution("A", Arc::new(EmptyScript)).input("x", DataType::Int, None))
        .data_flow(SELF, "n", "A", "x")
        .build(&ids)
        .unwrap();
    let a = root.children().remove(0);
    assert_eq!(root.data_flows().len(), 1);

    let port = a.port_by_name("x", PortDirection::Input).unwrap();
    a.remove_input_port(port.id).unwrap();

    assert!(root.data_flows().is_empty());
}

#[test]
fn removing_a_child_output_removes_flows_to_siblings_and_container() {
    let ids = IdAllocator::sequential();
    let root = StateBuilder::hierarchy("root")
        .output("out", DataType::Int, None)
        .child(StateBuilder::execution("A", Arc::new(EmptyScript)).output("y", DataType::Int, None))
        .child(StateBuilder::execution("B", Arc::new(EmptyScript)).input("x", DataType::Int, None))
        .data_flow("A", "y", "B", "x")
        .data_flow("A", "y", SELF, "out")
        .build(&ids)
        .unwrap();
    let a = root.children().into_iter().find(|c| c.name() == "A").unwrap();
    assert_eq!(root.data_flows().len(), 2);

    let port = a.port_by_name("y", PortDirection::Output).unwrap();
    a.remove_output_port(port.id).unwrap();

    assert!(root.data_flows().is_empty());
}

#[test]
fn removing_container_ports_removes_inner_and_outer_flows() {
    let ids = IdAllocator::sequential();
    let outer = StateBuilder::hierarchy("outer")
        .input("n", DataType::Int, None)
        .output("result", DataType::Int, None)
        .child(
            StateBuilder::hierarchy("middle")
                .input("n", DataType::Int, None)
                .output("out", DataType::Int, None)
                .child(
                    StateBuilder::execution("A", Arc::new(EmptyScript))
                        .input("x", DataType::Int, None)
                        .output("y", DataType::Int, None),
                )
                .data_flow(SELF, "n", "A", "x")
                .data_flow("A", "y", SELF, "out"),
        )
        .data_flow(SELF, "n", "middle", "n")
        .data_flow("middle", "out", SELF, "result")
        .build(&ids)
        .unwrap();
    let middle = outer.children().remove(0);
    assert_eq!(outer.data_flows().len(), 2);
    assert_eq!(middle.data_flows().len(), 2);

    let input = middle.port_by_name("n", PortDirection::Input).unwrap();
    middle.remove_input_port(input.id).unwrap();
    assert_eq!(outer.data_flows().len(), 1);
    assert_eq!(middle.data_flows().len(), 1);

    let output = middle.port_by_name("out", PortDirection::Output).unwrap();
    middle.remove_output_port(output.id).unwrap();
    assert!(outer.data_flows().is_empty());
    assert!(middle.data_flows().is_empty());
}

#[test]
fn barrier_has_each_default_outcome_once() {
    let ids = IdAllocator::sequential();
    let barrier = State::barrier_concurrency("all", &ids).unwrap();
    let outcomes = barrier.outcomes();

    assert_eq!(outcomes.len(), 3);
    for (id, name) in [(SUCCESS, "success"), (ABORTED, "aborted"), (PREEMPTED, "preempted")] {
        assert_eq!(outcomes[&id].name, name);
        assert_eq!(outcomes.values().filter(|o| o.name == name).count(), 1);
    }
}

#[tokio::test]
async fn preemption_reaches_through_library_states() {
    let ids = IdAllocator::sequential();
    let library = Arc::new(InMemoryLibrary::new());
    let reference = LibraryReference::new("generic", "long wait", "1.0");
    let template = StateBuilder::hierarchy("long wait")
        .child(StateBuilder::execution("wait", sleeper(60_000)))
        .build(&ids)
        .unwrap();
    library.register(reference.clone(), template);

    let race = State::preemptive_concurrency("race", &ids).unwrap();
    let fast_id = race
        .add_state(State::execution("fast", sleeper(10), &ids).unwrap())
        .unwrap();
    let lib = State::library("lib", reference, library.as_ref(), &ids).unwrap();
    race.add_state(Arc::clone(&lib)).unwrap();
    race.add_transition(&fast_id, SUCCESS, &race.id(), Some(SUCCESS))
        .unwrap();
    let copy = lib.library_copy().unwrap();
    let inner = copy.children().remove(0);

    let outcome = tokio::time::timeout(Duration::from_secs(10), race.run(RunContext::default()))
        .await
        .expect("race should finish once the fast branch wins");

    assert_eq!(outcome.id, SUCCESS);
    assert_eq!(lib.final_outcome().unwrap().id, PREEMPTED);
    assert!(copy.is_preempted());
    assert!(inner.is_preempted());
    assert_eq!(inner.final_outcome().unwrap().id, PREEMPTED);
}

#[test]
fn nested_paths_and_lookup() {
    let ids = IdAllocator::sequential();
    let root = StateBuilder::hierarchy("root")
        .child(
            StateBuilder::hierarchy("middle")
                .child(StateBuilder::execution("leaf", Arc::new(EmptyScript))),
        )
        .build(&ids)
        .unwrap();
    let middle = root.children().remove(0);
    let leaf = middle.children().remove(0);

    assert_eq!(leaf.path(), format!("{}/{}/{}", root.id(), middle.id(), leaf.id()));
    assert!(Arc::ptr_eq(&root.get_state_by_path(&leaf.path()).unwrap(), &leaf));
    assert!(root.get_state_by_path("nowhere").is_none());
}

#[test]
fn colliding_outcome_names_get_a_suffix() {
    let ids = IdAllocator::sequential();
    let state = State::execution("leaf", Arc::new(EmptyScript), &ids).unwrap();
    let done = state.add_outcome("done", None).unwrap();
    let other = state.add_outcome("other", None).unwrap();

    let name = state.rename_outcome(other, "done").unwrap();

    assert_eq!(name, "done1");
    assert_eq!(state.outcome(done).unwrap().name, "done");
    assert_eq!(state.outcome(other).unwrap().name, "done1");
}

#[test]
fn adding_a_taken_outcome_name_suffixes_it() {
    let ids = IdAllocator::sequential();
    let state = State::execution("leaf", Arc::new(EmptyScript), &ids).unwrap();

    let first = state.add_outcome("done", None).unwrap();
    let second = state.add_outcome("done", None).unwrap();

    assert_ne!(first, second);
    assert_eq!(state.outcome(first).unwrap().name, "done");
    assert_eq!(state.outcome(second).unwrap().name, "done1");
}

#[test]
fn change_id_avoids_sibling_ids_and_follows_references() {
    let ids = IdAllocator::sequential();
    let root = StateBuilder::hierarchy("root")
        .child(StateBuilder::execution("A", Arc::new(EmptyScript)))
        .child(StateBuilder::execution("B", Arc::new(EmptyScript)))
        .transition("A", "success", "B")
        .build(&ids)
        .unwrap();
    let children = root.children();
    let a = children.iter().find(|c| c.name() == "A").unwrap();
    let b = children.iter().find(|c| c.name() == "B").unwrap();
    let log = Arc::new(EventLog::new());
    root.subscribe(log.clone());

    let new_id = a.change_id(Some(b.id())).unwrap();

    assert_ne!(new_id, b.id());
    assert_eq!(a.id(), new_id);
    assert!(root.child(&new_id).is_some());
    assert_eq!(root.start_state_id(), Some(new_id.clone()));
    assert!(root.transitions().values().all(|t| t.from_state == new_id));
    assert!(log
        .events()
        .iter()
        .any(|e| matches!(&e.change, StateChange::IdChanged { new, .. } if *new == new_id)));
}

#[tokio::test]
async fn decoded_tree_runs_like_the_original() {
    let ids = IdAllocator::sequential();
    let runs = Arc::new(AtomicUsize::new(0));
    let root = StateBuilder::hierarchy("root")
        .child(StateBuilder::execution("A", counting(Arc::clone(&runs))).script_key("count"))
        .child(StateBuilder::execution("B", counting(Arc::clone(&runs))).script_key("count"))
        .transition("A", "success", "B")
        .exit("B", "success", "success")
        .build(&ids)
        .unwrap();

    let json = encode(&root).to_json().unwrap();
    let scripts = ScriptRegistry::new().with("count", counting(Arc::clone(&runs)));
    let library = InMemoryLibrary::new();
    let ctx = DecodeContext::new(IdAllocator::sequential(), &scripts, &library);
    let restored = decode(&StateDocument::from_json(&json).unwrap(), &ctx).unwrap();

    assert_eq!(restored.run(RunContext::default()).await.id, SUCCESS);
    assert_eq!(runs.load(Ordering::SeqCst), 2);
}
