mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ci_step::log::LineObserver;
use ci_step::{
    BuildStep, CommandUpdate, CoreConfig, LogType, MemoryStore, RemoteCommand, Result, ResultCode,
    Signal, StepBehavior, StepConfig, StepContext, StepError, Summary, TestResult,
};
use common::{core_config, harness, harness_with, FakeWorker, Script};
use serde_json::json;

#[tokio::test]
async fn log_names_are_unique_and_lookups_fail_cleanly() {
    struct Logs;

    #[async_trait]
    impl StepBehavior for Logs {
        async fn run(&self, ctx: &StepContext) -> Result<ResultCode> {
            let stdio = ctx.add_log("stdio", LogType::Stdio).await?;
            stdio.add_stdout("building\n").await?;
            stdio.add_stderr("warning: unused import\n").await?;

            assert!(matches!(
                ctx.add_log("stdio", LogType::Stdio).await,
                Err(StepError::DuplicateLog(name)) if name == "stdio"
            ));
            assert!(matches!(
                ctx.get_log("coverage").await,
                Err(StepError::LogNotFound(name)) if name == "coverage"
            ));

            let report = ctx.add_log("report.html", LogType::Html).await?;
            report.add_content("<h1>ok</h1>").await?;
            assert!(matches!(
                report.add_header("nope").await,
                Err(StepError::LogType(_, "header"))
            ));
            Ok(ResultCode::Warnings)
        }
    }

    let worker = FakeWorker::new();
    let (build, store) = harness(&worker);
    let step = BuildStep::new(StepConfig::new("compile"), Logs);
    build.add_step(step.clone()).unwrap();
    let outcome = build.run().await;
    assert_eq!(outcome.result, ResultCode::Success);
    assert_eq!(step.results().unwrap(), ResultCode::Warnings);

    let step_id = step.step_id().unwrap();
    let logs = store.logs(step_id);
    assert_eq!(logs.len(), 2);
    assert!(logs.iter().all(|l| l.complete));
    let stdio = store.log(step_id, "stdio").unwrap();
    assert_eq!(stdio.text(ci_step::Channel::Stdout), "building\n");
    assert_eq!(stdio.text(ci_step::Channel::Stderr), "warning: unused import\n");
}

#[tokio::test]
async fn logs_cannot_be_written_after_the_step_finishes() {
    struct Keep(std::sync::Mutex<Option<Arc<ci_step::Log>>>);

    #[async_trait]
    impl StepBehavior for Keep {
        async fn run(&self, ctx: &StepContext) -> Result<ResultCode> {
            let log = ctx.add_log("stdio", LogType::Stdio).await?;
            *self.0.lock().unwrap() = Some(log);
            Ok(ResultCode::Success)
        }
    }

    let worker = FakeWorker::new();
    let (build, _) = harness(&worker);
    let keep = Arc::new(Keep(std::sync::Mutex::new(None)));
    let step = BuildStep::with_behavior(StepConfig::new("leak"), keep.clone());
    build.add_step(step.clone()).unwrap();
    build.run().await;

    let log = keep.0.lock().unwrap().clone().unwrap();
    assert!(log.is_finished().await);
    assert!(matches!(
        log.add_stdout("late\n").await,
        Err(StepError::LogFinished(_))
    ));
    let ctx = step.context().unwrap();
    assert!(matches!(
        ctx.add_log("late", LogType::Text).await,
        Err(StepError::InvalidState { .. })
    ));
}

#[tokio::test]
async fn observer_failure_ends_the_step_with_exception() {
    struct Parse;

    #[async_trait]
    impl StepBehavior for Parse {
        async fn run(&self, ctx: &StepContext) -> Result<ResultCode> {
            ctx.logs()
                .add_observer(
                    "stdio",
                    Box::new(LineObserver::new(|_, line| {
                        if line.starts_with("FATAL") {
                            anyhow::bail!("unparseable line: {line}");
                        }
                        Ok(())
                    })),
                )
                .await;
            let stdio = ctx.add_log("stdio", LogType::Stdio).await?;
            stdio.add_stdout("ok 1\nFATAL disk full\n").await?;
            Ok(ResultCode::Success)
        }
    }

    let worker = FakeWorker::new();
    let (build, store) = harness(&worker);
    let step = BuildStep::new(StepConfig::new("parse"), Parse);
    build.add_step(step.clone()).unwrap();
    let outcome = build.run().await;

    let step_outcome = step.outcome().unwrap();
    assert_eq!(step_outcome.result, ResultCode::Exception);
    assert_eq!(step_outcome.summary.step.as_deref(), Some("finished (exception)"));
    assert_eq!(outcome.result, ResultCode::Exception);

    let err = store.log(step.step_id().unwrap(), "err.text").unwrap();
    assert!(err.full_text().contains("unparseable line: FATAL disk full"));
}

#[tokio::test]
async fn rejected_command_output_kills_the_remote_command() {
    struct Watch;

    #[async_trait]
    impl StepBehavior for Watch {
        async fn run(&self, ctx: &StepContext) -> Result<ResultCode> {
            ctx.logs()
                .add_observer(
                    "stdio",
                    Box::new(LineObserver::new(|_, line| {
                        if line.starts_with("FATAL") {
                            anyhow::bail!("unparseable line: {line}");
                        }
                        Ok(())
                    })),
                )
                .await;
            let outcome = ctx
                .run_command(RemoteCommand::new("shell", json!({"command": "tail -f app.log"})))
                .await?;
            Ok(if outcome.succeeded() { ResultCode::Success } else { ResultCode::Failure })
        }
    }

    let worker = FakeWorker::new();
    worker.expect(Script::UntilSignalled {
        updates: vec![CommandUpdate::Stdout(b"FATAL disk full\n".to_vec())],
    });
    let (build, store) = harness(&worker);
    let step = BuildStep::new(StepConfig::new("tail"), Watch);
    build.add_step(step.clone()).unwrap();
    build.run().await;

    assert_eq!(step.results().unwrap(), ResultCode::Exception);
    assert_eq!(worker.signals(), vec![Signal::Kill]);
    let err = store.log(step.step_id().unwrap(), "err.text").unwrap();
    assert!(err.full_text().contains("unparseable line: FATAL disk full"));
}

#[tokio::test]
async fn test_results_are_flushed_when_the_step_completes() {
    struct Tests;

    #[async_trait]
    impl StepBehavior for Tests {
        async fn run(&self, ctx: &StepContext) -> Result<ResultCode> {
            let set = ctx.add_test_result_set("unit tests", "code", "boolean").await?;
            set.add_test_result(
                TestResult::new("parses_empty_input", "true")
                    .with_location("src/parser.rs", Some(42))
                    .with_duration(Duration::from_millis(3)),
            )
            .await?;
            set.add_test_result(TestResult::new("rejects_garbage", "false")).await?;
            Ok(ResultCode::Failure)
        }
    }

    let worker = FakeWorker::new();
    let (build, store) = harness(&worker);
    let step = BuildStep::new(StepConfig::new("test"), Tests);
    build.add_step(step.clone()).unwrap();
    build.run().await;

    let sets = store.test_result_sets(step.step_id().unwrap());
    assert_eq!(sets.len(), 1);
    let set = &sets[0];
    assert!(set.complete);
    assert_eq!((set.category.as_str(), set.value_unit.as_str()), ("code", "boolean"));
    assert_eq!(set.results.len(), 2);
    assert_eq!(set.results[0].test_code_path.as_deref(), Some("src/parser.rs"));
    assert_eq!(set.results[0].line, Some(42));
    assert_eq!(set.results[0].duration_ns, Some(3_000_000));
    assert_eq!(set.results[1].value, "false");
}

#[tokio::test]
async fn test_results_flush_in_batches() {
    struct Batched {
        store: Arc<MemoryStore>,
    }

    #[async_trait]
    impl StepBehavior for Batched {
        async fn run(&self, ctx: &StepContext) -> Result<ResultCode> {
            let set = ctx.add_test_result_set("bench", "performance", "ms").await?;
            for (i, value) in ["12", "15", "11"].into_iter().enumerate() {
                set.add_test_result(TestResult::new(format!("bench_{i}"), value)).await?;
            }
            let persisted = self.store.test_result_sets(ctx.step_id())[0].results.len();
            assert_eq!(persisted, 2);
            Ok(ResultCode::Success)
        }
    }

    let worker = FakeWorker::new();
    let core = CoreConfig {
        test_result_batch_size: 2,
        ..core_config()
    };
    let (build, store) = harness_with(&worker, core);
    let step = BuildStep::new(
        StepConfig::new("bench"),
        Batched {
            store: store.clone(),
        },
    );
    build.add_step(step.clone()).unwrap();
    build.run().await;

    assert_eq!(step.results().unwrap(), ResultCode::Success);
    let sets = store.test_result_sets(step.step_id().unwrap());
    assert_eq!(sets[0].results.len(), 3);
    assert!(sets[0].complete);
}

#[tokio::test]
async fn stdout_volume_feeds_the_output_progress_metric() {
    struct Chatty;

    #[async_trait]
    impl StepBehavior for Chatty {
        async fn run(&self, ctx: &StepContext) -> Result<ResultCode> {
            let stdio = ctx.add_log("stdio", LogType::Stdio).await?;
            stdio.add_stdout("hello\n").await?;
            stdio.add_stderr("ignored\n").await?;
            stdio.add_stdout("world\n").await?;
            assert!(matches!(
                ctx.set_progress("tests", 3),
                Err(StepError::UndeclaredMetric(_))
            ));
            Ok(ResultCode::Success)
        }
    }

    let worker = FakeWorker::new();
    let (build, _) = harness(&worker);
    let step = BuildStep::new(
        StepConfig {
            progress_metrics: vec!["output".into()],
            ..StepConfig::new("chatty")
        },
        Chatty,
    );
    build.add_step(step.clone()).unwrap();
    build.run().await;

    assert_eq!(step.progress().unwrap().get("output"), Some(12));
}

#[tokio::test(start_paused = true)]
async fn summary_updates_are_debounced() {
    struct Busy {
        recomputed: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl StepBehavior for Busy {
        async fn run(&self, ctx: &StepContext) -> Result<ResultCode> {
            for _ in 0..50 {
                ctx.update_summary();
            }
            tokio::time::sleep(Duration::from_millis(350)).await;
            Ok(ResultCode::Success)
        }

        async fn current_summary(&self, _ctx: &StepContext) -> Result<Summary> {
            let n = self.recomputed.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(Summary::step(format!("pass {n}")))
        }
    }

    let recomputed = Arc::new(AtomicUsize::new(0));
    let worker = FakeWorker::new();
    let (build, store) = harness(&worker);
    let step = BuildStep::new(
        StepConfig::new("busy"),
        Busy {
            recomputed: recomputed.clone(),
        },
    );
    build.add_step(step.clone()).unwrap();
    build.run().await;

    assert_eq!(recomputed.load(Ordering::SeqCst), 1);
    let record = store.step(step.step_id().unwrap()).unwrap();
    assert_eq!(record.state_string, "finished");
}
