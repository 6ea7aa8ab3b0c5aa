mod common;

use async_trait::async_trait;
use ci_step::{
    BuildStep, Channel, CommandOutcome, Result, ResultCode, StepBehavior, StepConfig, StepContext,
};
use common::{harness, FakeWorker, Script};
use serde_json::json;

/// Prepares a release directory and records what it found.
struct Package;

#[async_trait]
impl StepBehavior for Package {
    async fn run(&self, ctx: &StepContext) -> Result<ResultCode> {
        let commands = ctx.commands();
        commands.rmdir("dist", false).await?;
        commands.mkdir("dist", true).await?;
        let locked = commands.path_exists("Cargo.lock").await?;
        let wheels = commands.glob("target/wheels/*.whl").await?;
        let version = commands
            .get_file_content("VERSION", true)
            .await?
            .unwrap_or_default();

        ctx.stats().set("locked", locked);
        ctx.stats().set("wheels", wheels.len());
        ctx.set_property("version", String::from_utf8_lossy(&version).trim(), "Package");
        Ok(ResultCode::Success)
    }
}

#[tokio::test]
async fn worker_primitives_compose_into_a_step() {
    let worker = FakeWorker::new();
    worker.expect(Script::exit(0));
    worker.expect(Script::exit(0));
    worker.expect(Script::exit(1));
    worker.expect(Script::payload(
        0,
        json!({"files": ["build/target/wheels/a.whl", "build/target/wheels/b.whl"]}),
    ));
    worker.expect(Script::Complete {
        updates: Vec::new(),
        outcome: CommandOutcome {
            content: Some(b"2.1.0\n".to_vec()),
            ..CommandOutcome::exited(0)
        },
    });
    let (build, store) = harness(&worker);
    let step = BuildStep::new(StepConfig::new("package"), Package);
    build.add_step(step.clone()).unwrap();
    build.run().await;

    assert_eq!(step.results().unwrap(), ResultCode::Success);
    let sent: Vec<(String, serde_json::Value)> = worker
        .commands()
        .into_iter()
        .map(|c| (c.name, c.args))
        .collect();
    assert_eq!(
        sent,
        vec![
            ("rmdir".to_string(), json!({"paths": ["build/dist"]})),
            ("mkdir".to_string(), json!({"paths": ["build/dist"]})),
            ("stat".to_string(), json!({"path": "build/Cargo.lock"})),
            ("glob".to_string(), json!({"path": "build/target/wheels/*.whl"})),
            ("upload_file".to_string(), json!({"path": "build/VERSION"})),
        ]
    );

    let ctx = step.context().unwrap();
    assert_eq!(ctx.stats().get("locked"), Some(json!(false)));
    assert_eq!(ctx.stats().get("wheels"), Some(json!(2)));
    assert_eq!(build.properties().get("version"), Some(&json!("2.1.0")));

    let headers = store
        .log(step.step_id().unwrap(), "stdio")
        .unwrap()
        .text(Channel::Header);
    assert!(headers.contains("mkdir build/dist\n"));
    assert!(headers.contains("glob build/target/wheels/*.whl\n"));
    assert!(!headers.contains("failed"));
}

#[tokio::test]
async fn failed_mkdir_abandons_with_failure_when_asked() {
    struct Mkdir {
        abandon: bool,
    }

    #[async_trait]
    impl StepBehavior for Mkdir {
        async fn run(&self, ctx: &StepContext) -> Result<ResultCode> {
            let created = ctx.commands().mkdir("/readonly/out", self.abandon).await?;
            Ok(if created { ResultCode::Success } else { ResultCode::Warnings })
        }
    }

    let worker = FakeWorker::new();
    worker.expect(Script::exit(1));
    worker.expect(Script::exit(1));
    let (build, store) = harness(&worker);
    let tolerant = BuildStep::new(StepConfig::new("tolerant"), Mkdir { abandon: false });
    let strict = BuildStep::new(StepConfig::new("strict"), Mkdir { abandon: true });
    build.add_step(tolerant.clone()).unwrap();
    build.add_step(strict.clone()).unwrap();
    build.run().await;

    assert_eq!(tolerant.results().unwrap(), ResultCode::Warnings);
    assert_eq!(strict.results().unwrap(), ResultCode::Failure);
    assert_eq!(worker.commands()[1].args, json!({"paths": ["/readonly/out"]}));

    let strict_id = strict.step_id().unwrap();
    let headers = store.log(strict_id, "stdio").unwrap().text(Channel::Header);
    assert!(headers.contains("mkdir /readonly/out failed (rc=1)"));
    assert!(store.log(strict_id, "err.text").is_none());
}

#[tokio::test]
async fn failed_glob_always_fails_the_step() {
    struct Glob;

    #[async_trait]
    impl StepBehavior for Glob {
        async fn run(&self, ctx: &StepContext) -> Result<ResultCode> {
            ctx.commands().glob("**/[").await?;
            Ok(ResultCode::Success)
        }
    }

    let worker = FakeWorker::new();
    worker.expect(Script::exit(2));
    let (build, store) = harness(&worker);
    let step = BuildStep::new(StepConfig::new("collect"), Glob);
    build.add_step(step.clone()).unwrap();
    let outcome = build.run().await;

    assert_eq!(step.results().unwrap(), ResultCode::Failure);
    assert_eq!(outcome.result, ResultCode::Failure);
    assert!(store.log(step.step_id().unwrap(), "err.text").is_none());
}

#[tokio::test]
async fn missing_files_are_reported_without_abandoning() {
    struct Fetch;

    #[async_trait]
    impl StepBehavior for Fetch {
        async fn run(&self, ctx: &StepContext) -> Result<ResultCode> {
            let content = ctx.commands().get_file_content("missing.txt", false).await?;
            let exists = ctx.commands().path_exists("missing.txt").await?;
            assert!(content.is_none());
            assert!(!exists);
            Ok(ResultCode::Success)
        }
    }

    let worker = FakeWorker::new();
    worker.expect(Script::exit(1));
    worker.expect(Script::exit(1));
    let (build, _) = harness(&worker);
    let step = BuildStep::new(StepConfig::new("fetch"), Fetch);
    build.add_step(step.clone()).unwrap();
    build.run().await;

    assert_eq!(step.results().unwrap(), ResultCode::Success);
}
