// tests/grid_escalation.rs

//! Grid submission, polling and resource-escalation behavior, driven
//! through a scripted fake queue.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;

use rundag::config::HooksSection;
use rundag::engine::core::CoreRunner;
use rundag::engine::{Runtime, RunnerEvent, TaskState};
use rundag::graph::{TaskGraph, TaskSpec};
use rundag::grid::resources::{ResourceRequest, ResourceSpec};
use rundag::grid::{GridExecutor, GridJobState, GridQueue};
use rundag::history::HistoryStore;
use rundag::hooks::HookRunner;
use rundag::report::{Reporter, RunSummary, StatusEvent};
use rundag::tracked::FingerprintPolicy;
use rundag_test_utils::builders::{all_runnable_plan, grid_options};
use rundag_test_utils::fake_executor::BlackHoleExecutor;
use rundag_test_utils::fake_grid::FakeGridQueue;
use rundag_test_utils::init_tracing;

/// Captures every status event for later inspection.
#[derive(Default)]
struct CollectingReporter {
    events: Arc<Mutex<Vec<StatusEvent>>>,
}

impl Reporter for CollectingReporter {
    fn started(&self, _total: usize) {}
    fn event(&self, ev: &StatusEvent) {
        self.events.lock().unwrap().push(ev.clone());
    }
    fn finished(&self, _summary: &RunSummary) {}
}

fn gridable_graph(resources: ResourceRequest) -> TaskGraph {
    let mut graph = TaskGraph::new();
    graph
        .add_task(
            TaskSpec::shell("compute things")
                .named("crunch")
                .gridable(resources),
        )
        .unwrap();
    graph
}

async fn run_grid(
    queue: Arc<FakeGridQueue>,
    graph: TaskGraph,
) -> (RunSummary, Vec<StatusEvent>) {
    let (event_tx, event_rx) = mpsc::channel::<RunnerEvent>(64);

    let queue: Arc<dyn GridQueue> = queue;
    let grid = GridExecutor::new(queue, event_tx.clone(), Duration::from_millis(5), true, None);

    let events = Arc::new(Mutex::new(Vec::new()));
    let reporter = CollectingReporter {
        events: events.clone(),
    };

    let plan = all_runnable_plan(&graph);
    let core = CoreRunner::new(graph, plan, grid_options(1, 2));
    let runtime = Runtime::new(
        core,
        event_rx,
        BlackHoleExecutor::new(),
        Some(grid),
        HistoryStore::in_memory(),
        Box::new(reporter),
        HookRunner::new(HooksSection::default(), PathBuf::from("rundag-test.log")),
        FingerprintPolicy::default(),
    );

    let summary = timeout(Duration::from_secs(5), runtime.run())
        .await
        .expect("grid run did not finish in time")
        .expect("runtime returned an error");

    let events = events.lock().unwrap().clone();
    (summary, events)
}

#[tokio::test]
async fn three_timeouts_fail_the_task_with_no_fourth_attempt() {
    init_tracing();
    let queue = Arc::new(FakeGridQueue::new(vec![
        GridJobState::Timeout,
        GridJobState::Timeout,
        GridJobState::Timeout,
    ]));

    let graph = gridable_graph(ResourceRequest::fixed(1000, 30, 2));
    let (summary, events) = run_grid(queue.clone(), graph).await;

    assert_eq!(summary.failed, 1);

    let submissions = queue.submissions();
    assert_eq!(submissions.len(), 3, "never a fourth submission");
    // Time doubles per escalation; memory stays put.
    assert_eq!(
        submissions.iter().map(|s| s.time_min).collect::<Vec<_>>(),
        vec![30, 60, 120]
    );
    assert!(submissions.iter().all(|s| s.mem_mb == 1000));

    let failure = events
        .iter()
        .rev()
        .find(|e| e.state == TaskState::Failed)
        .expect("a failure event");
    assert!(
        failure
            .extra
            .as_deref()
            .unwrap_or("")
            .contains("resources exhausted"),
        "exhaustion reason must be surfaced: {:?}",
        failure.extra
    );
}

#[tokio::test]
async fn completion_on_third_attempt_succeeds() {
    init_tracing();
    let queue = Arc::new(FakeGridQueue::new(vec![
        GridJobState::Timeout,
        GridJobState::Timeout,
        GridJobState::Completed,
    ]));

    let graph = gridable_graph(ResourceRequest::fixed(1000, 30, 2));
    let (summary, _events) = run_grid(queue.clone(), graph).await;

    assert_eq!(summary.completed, 1);
    assert_eq!(summary.failed, 0);

    let submissions = queue.submissions();
    assert_eq!(submissions.len(), 3);
    assert_eq!(submissions[2].time_min, 120);
    assert!(
        queue.benchmark_queries() >= 3,
        "usage is captured for every attempt, including the successful one"
    );
}

#[tokio::test]
async fn out_of_memory_doubles_memory_not_time() {
    init_tracing();
    let queue = Arc::new(FakeGridQueue::new(vec![
        GridJobState::OutOfMemory,
        GridJobState::Completed,
    ]));

    let graph = gridable_graph(ResourceRequest::fixed(500, 45, 1));
    let (summary, _events) = run_grid(queue.clone(), graph).await;

    assert_eq!(summary.completed, 1);

    let submissions = queue.submissions();
    assert_eq!(submissions.len(), 2);
    assert_eq!(submissions[0].mem_mb, 500);
    assert_eq!(submissions[1].mem_mb, 1000);
    assert_eq!(submissions[1].time_min, 45);
}

#[tokio::test]
async fn genuine_grid_failure_does_not_escalate() {
    init_tracing();
    let queue = Arc::new(FakeGridQueue::new(vec![GridJobState::Failed]));

    let graph = gridable_graph(ResourceRequest::fixed(500, 45, 1));
    let (summary, _events) = run_grid(queue.clone(), graph).await;

    assert_eq!(summary.failed, 1);
    assert_eq!(queue.submissions().len(), 1, "plain failures are not resubmitted");
}

#[tokio::test]
async fn broken_queue_surfaces_infrastructure_failure() {
    init_tracing();
    let queue = Arc::new(FakeGridQueue::broken());

    let graph = gridable_graph(ResourceRequest::fixed(500, 45, 1));
    let (summary, events) = run_grid(queue, graph).await;

    assert_eq!(summary.failed, 1);
    let failure = events
        .iter()
        .rev()
        .find(|e| e.state == TaskState::Failed)
        .expect("a failure event");
    assert!(
        failure
            .extra
            .as_deref()
            .unwrap_or("")
            .contains("infrastructure"),
        "infrastructure reason must be surfaced: {:?}",
        failure.extra
    );
}

#[tokio::test]
async fn resource_equations_evaluate_at_submission_time() {
    init_tracing();
    let queue = Arc::new(FakeGridQueue::new(vec![GridJobState::Completed]));

    let resources = ResourceRequest {
        mem: ResourceSpec::Equation("cores * 100".to_string()),
        time: ResourceSpec::Equation("15 + 15".to_string()),
        cores: 4,
        partition: None,
    };
    let graph = gridable_graph(resources);
    let (summary, _events) = run_grid(queue.clone(), graph).await;

    assert_eq!(summary.completed, 1);
    let submissions = queue.submissions();
    assert_eq!(submissions[0].mem_mb, 400);
    assert_eq!(submissions[0].time_min, 30);
    assert_eq!(submissions[0].cores, 4);
}

#[tokio::test]
async fn running_state_is_reported_while_job_is_on_a_node() {
    init_tracing();
    let queue = Arc::new(FakeGridQueue::new(vec![GridJobState::Completed]));

    let graph = gridable_graph(ResourceRequest::fixed(100, 10, 1));
    let (_summary, events) = run_grid(queue, graph).await;

    assert!(
        events.iter().any(|e| e.state == TaskState::Running),
        "the Pending→Running transition must surface as an event"
    );
}
