//! Filesystem-style worker primitives for step logic.
//!
//! Each primitive writes a diagnostic header to the `stdio` log (which it
//! never closes) and either reports failure as a value or, when asked to,
//! abandons the step with FAILURE. A failing glob always abandons, with
//! EXCEPTION: a pattern the worker cannot expand is a configuration defect.

use serde_json::json;

use crate::error::{Result, StepError};
use crate::log::LogType;
use crate::remote::{CommandOutcome, RemoteCommand};
use crate::step::StepContext;

pub struct WorkerCommands<'a> {
    ctx: &'a StepContext,
}

impl<'a> WorkerCommands<'a> {
    pub fn new(ctx: &'a StepContext) -> Self {
        Self { ctx }
    }

    async fn header(&self, text: &str) -> Result<()> {
        let log = self.ctx.logs().get_or_create("stdio", LogType::Stdio).await?;
        log.add_header(&format!("{text}\n")).await
    }

    async fn run(&self, command: &str, args: serde_json::Value, describe: &str) -> Result<CommandOutcome> {
        self.ctx.worker().require_command(command)?;
        self.header(describe).await?;
        self.ctx.run_command(RemoteCommand::new(command, args)).await
    }

    async fn check(&self, outcome: &CommandOutcome, describe: &str, abandon_on_failure: bool) -> Result<bool> {
        if outcome.succeeded() {
            return Ok(true);
        }
        self.header(&format!("{describe} failed (rc={})", rc_text(outcome))).await?;
        if abandon_on_failure {
            return Err(StepError::failed(format!("{describe} failed")));
        }
        Ok(false)
    }

    /// Create `dir` (relative to the workdir) with parents.
    pub async fn mkdir(&self, dir: &str, abandon_on_failure: bool) -> Result<bool> {
        let path = self.ctx.build_path(dir);
        let describe = format!("mkdir {path}");
        let outcome = self.run("mkdir", json!({ "paths": [path] }), &describe).await?;
        self.check(&outcome, &describe, abandon_on_failure).await
    }

    /// Remove `dir` recursively.
    pub async fn rmdir(&self, dir: &str, abandon_on_failure: bool) -> Result<bool> {
        let path = self.ctx.build_path(dir);
        let describe = format!("rmdir {path}");
        let outcome = self.run("rmdir", json!({ "paths": [path] }), &describe).await?;
        self.check(&outcome, &describe, abandon_on_failure).await
    }

    /// Whether `path` exists on the worker. Never abandons.
    pub async fn path_exists(&self, path: &str) -> Result<bool> {
        let path = self.ctx.build_path(path);
        let outcome = self
            .run("stat", json!({ "path": path }), &format!("stat {path}"))
            .await?;
        Ok(outcome.succeeded())
    }

    /// Expand `pattern` on the worker. A failed expansion always abandons.
    pub async fn glob(&self, pattern: &str) -> Result<Vec<String>> {
        let path = self.ctx.build_path(pattern);
        let describe = format!("glob {path}");
        let outcome = self.run("glob", json!({ "path": path }), &describe).await?;
        if !outcome.succeeded() {
            self.header(&format!("{describe} failed (rc={})", rc_text(&outcome))).await?;
            return Err(StepError::failed(format!("{describe} failed")));
        }
        serde_json::from_value(outcome.payload["files"].clone())
            .map_err(|e| StepError::abandon(format!("{describe} returned malformed file list: {e}")))
    }

    /// Fetch a file's content from the worker. `Ok(None)` when the fetch
    /// failed and `abandon_on_failure` is false.
    pub async fn get_file_content(&self, path: &str, abandon_on_failure: bool) -> Result<Option<Vec<u8>>> {
        let path = self.ctx.build_path(path);
        let describe = format!("upload_file {path}");
        let outcome = self
            .run("upload_file", json!({ "path": path }), &describe)
            .await?;
        if !self.check(&outcome, &describe, abandon_on_failure).await? {
            return Ok(None);
        }
        Ok(Some(outcome.content.unwrap_or_default()))
    }
}

fn rc_text(outcome: &CommandOutcome) -> String {
    match (outcome.rc, outcome.interrupted) {
        (_, true) => "interrupted".to_string(),
        (Some(rc), false) => rc.to_string(),
        (None, false) => "none".to_string(),
    }
}
