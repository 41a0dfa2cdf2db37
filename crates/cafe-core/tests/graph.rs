use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use cafe_core::driver::{self, TASK_LAYOUT};
use cafe_core::error::{FailureKind, PipelineError};
use cafe_core::graph::{plan_order, GraphError, TaskGraph, TaskStatus};
use tokio::sync::Barrier;

const NONE: &[&str] = &[];

#[test]
fn pipeline_layout_orders_cleanup_after_the_fact_merge() -> Result<()> {
    let order = driver::task_order()?;

    assert_eq!(order.len(), TASK_LAYOUT.len());
    let position = |id: &str| order.iter().position(|task| *task == id);
    assert_eq!(order.first().copied(), Some(driver::START));
    assert_eq!(order.last().copied(), Some(driver::END));
    assert!(position(driver::LOAD_RAW) > position(driver::STAGE_FILES));
    assert!(position(driver::UPSERT_SALES) > position(driver::UPSERT_PRODUCT));
    assert!(position(driver::UPSERT_SALES) > position(driver::UPSERT_STORE));
    assert!(position(driver::REMOVE_STAGED) > position(driver::UPSERT_SALES));
    assert!(position(driver::ARCHIVE_LOCAL) > position(driver::UPSERT_SALES));
    Ok(())
}

#[test]
fn invalid_layouts_are_rejected() {
    let cycle = plan_order([("a", &["c"][..]), ("b", &["a"][..]), ("c", &["b"][..])]);
    assert!(matches!(cycle, Err(GraphError::Cycle(ref tasks)) if tasks.len() == 3));

    let unknown = plan_order([("a", NONE), ("b", &["missing"][..])]);
    assert_eq!(
        unknown,
        Err(GraphError::UnknownDependency {
            task: "b".into(),
            dependency: "missing".into(),
        })
    );

    let duplicate = plan_order([("a", NONE), ("a", NONE)]);
    assert_eq!(duplicate, Err(GraphError::DuplicateTask("a".into())));
}

#[tokio::test]
async fn failure_skips_every_downstream_task() -> Result<()> {
    let ran = Arc::new(AtomicUsize::new(0));
    let mut graph: TaskGraph<'_, u32> = TaskGraph::new();

    graph.task("first", &[], || async { Ok(1) });
    graph.task("broken", &["first"], || async {
        Err(PipelineError::Config("boom".into()))
    });
    graph.task("sibling", &["first"], || async { Ok(2) });
    {
        let ran = ran.clone();
        graph.task("after_broken", &["broken", "sibling"], move || async move {
            ran.fetch_add(1, Ordering::SeqCst);
            Ok(3)
        });
    }
    graph.task("last", &["after_broken"], || async { Ok(4) });

    let records = graph.execute().await?;

    let status: Vec<(&str, TaskStatus)> = records.iter().map(|record| (record.id, record.status)).collect();
    assert_eq!(
        status,
        [
            ("first", TaskStatus::Succeeded),
            ("broken", TaskStatus::Failed),
            ("sibling", TaskStatus::Succeeded),
            ("after_broken", TaskStatus::Skipped),
            ("last", TaskStatus::Skipped),
        ]
    );
    assert_eq!(ran.load(Ordering::SeqCst), 0);

    let broken = &records[1];
    let failure = broken.error.as_ref().expect("recorded failure");
    assert_eq!(failure.kind, FailureKind::Internal);
    assert!(failure.message.contains("boom"));
    assert!(broken.output.is_none());
    assert_eq!(records[2].output, Some(2));
    Ok(())
}

#[tokio::test]
async fn independent_tasks_run_concurrently() -> Result<()> {
    // Both branches wait on the same barrier, so the graph only finishes if
    // they are in flight at the same time.
    let barrier = Arc::new(Barrier::new(2));
    let mut graph: TaskGraph<'_, ()> = TaskGraph::new();

    graph.task("root", &[], || async { Ok(()) });
    for id in ["left", "right"] {
        let barrier = barrier.clone();
        graph.task(id, &["root"], move || async move {
            barrier.wait().await;
            Ok(())
        });
    }
    graph.task("join", &["left", "right"], || async { Ok(()) });

    let records = tokio::time::timeout(Duration::from_secs(5), graph.execute()).await??;

    assert!(records.iter().all(|record| record.status == TaskStatus::Succeeded));
    assert_eq!(records.len(), 4);
    Ok(())
}
