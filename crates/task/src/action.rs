//! Actions performed by work units

use crate::unit::WorkUnit;
use kiln_core::{
    ActionError, ContentHash, Implementation, InvocationId, OutputLocation, WorkUnitId,
};
use kiln_history::ChangeReason;
use std::collections::BTreeMap;
use std::future::Future;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

/// The work a unit performs.
///
/// The executor treats an action as a black box: it only relies on the
/// declared output locations being (re)produced when `execute` succeeds.
#[async_trait::async_trait]
pub trait WorkAction: Send + Sync {
    /// Identity and version of the action's implementation. A change
    /// invalidates every previous execution and every cache entry.
    fn implementation(&self) -> Implementation;

    async fn execute(&self, context: &ActionContext) -> Result<ActionOutput, ActionError>;
}

/// What an action reports back on success
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActionOutput {
    /// Paths the action wrote, for diagnostics
    pub produced: Vec<PathBuf>,
}

impl ActionOutput {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn produced(mut self, path: impl Into<PathBuf>) -> Self {
        self.produced.push(path.into());
        self
    }
}

/// Everything an action gets to see about the unit it runs for.
///
/// Cheap to clone.
#[derive(Debug, Clone)]
pub struct ActionContext {
    unit: Arc<WorkUnit>,
    changes: Arc<[ChangeReason]>,
    invocation_id: InvocationId,
}

impl ActionContext {
    pub(crate) fn new(
        unit: Arc<WorkUnit>,
        changes: Vec<ChangeReason>,
        invocation_id: InvocationId,
    ) -> Self {
        Self {
            unit,
            changes: changes.into(),
            invocation_id,
        }
    }

    pub fn unit_id(&self) -> &WorkUnitId {
        self.unit.id()
    }

    pub fn unit(&self) -> &WorkUnit {
        &self.unit
    }

    pub fn outputs(&self) -> &BTreeMap<String, OutputLocation> {
        self.unit.outputs()
    }

    pub fn output(&self, name: &str) -> Option<&OutputLocation> {
        self.unit.output(name)
    }

    /// Why the unit is being executed, in the order they were detected
    pub fn changes(&self) -> &[ChangeReason] {
        &self.changes
    }

    /// Whether only input files changed since the last successful execution,
    /// so an action may process just those files
    pub fn is_incremental(&self) -> bool {
        !self.changes.is_empty()
            && self
                .changes
                .iter()
                .all(|change| matches!(change, ChangeReason::InputFileChanged { .. }))
    }

    pub fn invocation_id(&self) -> InvocationId {
        self.invocation_id
    }
}

/// Action backed by an async closure
pub struct FnAction<F> {
    implementation: Implementation,
    f: F,
}

impl<F> FnAction<F> {
    pub fn new<Fut>(implementation: Implementation, f: F) -> Self
    where
        F: Fn(ActionContext) -> Fut + Send + Sync,
        Fut: Future<Output = Result<ActionOutput, ActionError>> + Send,
    {
        Self { implementation, f }
    }
}

#[async_trait::async_trait]
impl<F, Fut> WorkAction for FnAction<F>
where
    F: Fn(ActionContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<ActionOutput, ActionError>> + Send,
{
    fn implementation(&self) -> Implementation {
        self.implementation.clone()
    }

    async fn execute(&self, context: &ActionContext) -> Result<ActionOutput, ActionError> {
        (self.f)(context.clone()).await
    }
}

/// Action running a shell command through `sh -c`.
///
/// A non-zero exit status or an elapsed timeout fails the action. The
/// implementation version is a digest of the command line, its environment
/// and working directory, so editing any of them invalidates previous results.
#[derive(Debug, Clone)]
pub struct CommandAction {
    shell: String,
    script: String,
    working_dir: Option<PathBuf>,
    env: BTreeMap<String, String>,
    timeout: Option<Duration>,
}

impl CommandAction {
    pub fn new(script: impl Into<String>) -> Self {
        Self {
            shell: "sh".to_string(),
            script: script.into(),
            working_dir: None,
            env: BTreeMap::new(),
            timeout: None,
        }
    }

    #[must_use]
    pub fn shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = shell.into();
        self
    }

    #[must_use]
    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.shell);
        cmd.arg("-c")
            .arg(&self.script)
            .envs(&self.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        cmd
    }
}

#[async_trait::async_trait]
impl WorkAction for CommandAction {
    fn implementation(&self) -> Implementation {
        let identity = serde_json::json!({
            "shell": self.shell,
            "script": self.script,
            "working_dir": self.working_dir,
            "env": self.env,
        });
        Implementation::new("command", ContentHash::of(identity.to_string()).as_str())
    }

    async fn execute(&self, context: &ActionContext) -> Result<ActionOutput, ActionError> {
        let unit = context.unit_id();
        debug!(%unit, script = %self.script, "Running command");

        let output = self.command().output();
        let output = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, output).await.map_err(|_| {
                ActionError::new(format!("command timed out after {}ms", limit.as_millis()))
            })?,
            None => output.await,
        }
        .map_err(|e| ActionError::with_source(format!("failed to spawn '{}'", self.shell), e))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stdout.trim().is_empty() {
            debug!(%unit, output = %stdout.trim_end(), "Command stdout");
        }

        if output.status.success() {
            return Ok(ActionOutput::new());
        }
        if !stderr.trim().is_empty() {
            warn!(%unit, error = %stderr.trim_end(), "Command stderr");
        }
        let status = match output.status.code() {
            Some(code) => format!("exit code {code}"),
            None => "termination by signal".to_string(),
        };
        let detail = stderr.lines().last().map(str::trim).unwrap_or_default();
        Err(ActionError::new(if detail.is_empty() {
            format!("command failed with {status}")
        } else {
            format!("command failed with {status}: {detail}")
        }))
    }
}
