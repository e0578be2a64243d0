//! Subprocess execution for the provider adapters.
//!
//! `Runner` is what adapters depend on; `ProcessRunner` spawns real programs and
//! `MockRunner` (tests) records commands and replays canned output.

use anyhow::{anyhow, Context, Result};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Cmd {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub stdin: Option<Vec<u8>>,
}

impl Cmd {
    pub fn new(program: &str) -> Self {
        Self { program: program.to_string(), ..Default::default() }
    }

    pub fn arg(mut self, a: impl Into<String>) -> Self {
        self.args.push(a.into());
        self
    }

    pub fn args<I, S>(mut self, items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(items.into_iter().map(Into::into));
        self
    }

    pub fn envs(mut self, vars: &[(String, String)]) -> Self {
        self.env.extend(vars.iter().cloned());
        self
    }

    pub fn stdin(mut self, bytes: Vec<u8>) -> Self {
        self.stdin = Some(bytes);
        self
    }

    /// Program and arguments; environment values never appear here.
    pub fn line(&self) -> String {
        std::iter::once(self.program.as_str()).chain(self.args.iter().map(String::as_str)).collect::<Vec<_>>().join(" ")
    }
}

#[async_trait::async_trait]
pub trait Runner: Send + Sync {
    /// Stdout of a successful run; a non-zero exit is an error carrying stderr.
    async fn run(&self, cmd: &Cmd) -> Result<Vec<u8>>;
}

pub struct ProcessRunner;

#[async_trait::async_trait]
impl Runner for ProcessRunner {
    async fn run(&self, cmd: &Cmd) -> Result<Vec<u8>> {
        debug!(cmd = %cmd.line(), "exec");
        let mut c = Command::new(&cmd.program);
        c.args(&cmd.args).envs(cmd.env.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        c.stdin(if cmd.stdin.is_some() { std::process::Stdio::piped() } else { std::process::Stdio::null() });
        c.stdout(std::process::Stdio::piped()).stderr(std::process::Stdio::piped());
        let mut child = c.spawn().with_context(|| format!("spawning {}", cmd.program))?;
        if let (Some(bytes), Some(mut pipe)) = (cmd.stdin.as_ref(), child.stdin.take()) {
            pipe.write_all(bytes).await.context("writing stdin")?;
        }
        let out = child.wait_with_output().await.with_context(|| format!("waiting for {}", cmd.program))?;
        if !out.status.success() {
            return Err(anyhow!("{} failed ({}): {}", cmd.line(), out.status, String::from_utf8_lossy(&out.stderr).trim()));
        }
        Ok(out.stdout)
    }
}
