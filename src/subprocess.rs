use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};

use crate::error::ExitError;

/// Result of running a subprocess.
#[derive(Debug)]
pub struct RunOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl RunOutput {
    /// Returns true if the process exited successfully.
    pub const fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Builder for running external tools.
#[derive(Debug, Clone)]
pub struct Tool {
    program: String,
    args: Vec<String>,
    envs: Vec<(String, String)>,
    cwd: Option<PathBuf>,
    timeout: Option<Duration>,
}

impl Tool {
    /// Create a new tool invocation.
    pub fn new(program: &str) -> Self {
        Self {
            program: program.to_string(),
            args: Vec::new(),
            envs: Vec::new(),
            cwd: None,
            timeout: None,
        }
    }

    /// Add multiple arguments.
    pub fn args<S: AsRef<str>>(mut self, args: &[S]) -> Self {
        self.args.extend(args.iter().map(|s| s.as_ref().to_string()));
        self
    }

    /// Set several environment variables for the child.
    pub fn envs<I>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        self.envs.extend(vars);
        self
    }

    /// Run the child in `dir`.
    pub fn current_dir(mut self, dir: PathBuf) -> Self {
        self.cwd = Some(dir);
        self
    }

    /// Set a timeout for the subprocess.
    pub const fn timeout(mut self, duration: Duration) -> Self {
        self.timeout = Some(duration);
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Start the tool with piped stdout/stderr.
    pub fn spawn(&self) -> anyhow::Result<RunningTool> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .envs(self.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(ref dir) = self.cwd {
            cmd.current_dir(dir);
        }

        let child = cmd.spawn().map_err(|e| self.not_found_or_other(e))?;
        Ok(RunningTool {
            program: self.program.clone(),
            child,
            timeout: self.timeout,
        })
    }

    fn not_found_or_other(&self, e: std::io::Error) -> anyhow::Error {
        if e.kind() == std::io::ErrorKind::NotFound {
            ExitError::ToolNotFound {
                tool: self.program.clone(),
            }
            .into()
        } else {
            anyhow::Error::new(e).context(format!("spawning {}", self.program))
        }
    }
}

impl RunOutput {
    /// Turn a non-zero exit into `ExitError::ToolFailed`.
    pub fn into_ok(self, program: &str) -> anyhow::Result<Self> {
        if self.success() {
            Ok(self)
        } else {
            Err(ExitError::ToolFailed {
                tool: program.to_string(),
                code: self.exit_code,
                message: self.stderr.trim().to_string(),
            }
            .into())
        }
    }
}

/// A spawned tool. Dropping it kills the child.
#[derive(Debug)]
pub struct RunningTool {
    program: String,
    child: Child,
    timeout: Option<Duration>,
}

impl RunningTool {
    /// Feed each stdout line to `on_line` until the child exits.
    ///
    /// On timeout the child is killed and `ExitError::Timeout` is returned.
    pub async fn wait_streaming<F>(&mut self, mut on_line: F) -> anyhow::Result<RunOutput>
    where
        F: FnMut(&str) + Send,
    {
        let stdout = self.child.stdout.take().context("stdout was not captured")?;
        let stderr = self.child.stderr.take().context("stderr was not captured")?;

        let stderr_task = tokio::spawn(async move {
            let mut buf = String::new();
            let mut reader = stderr;
            let _ = reader.read_to_string(&mut buf).await;
            buf
        });

        let program = self.program.clone();
        let child = &mut self.child;
        let collect = async move {
            let mut lines = BufReader::new(stdout).lines();
            let mut collected = String::new();
            while let Some(line) = lines
                .next_line()
                .await
                .with_context(|| format!("reading {program} output"))?
            {
                on_line(&line);
                collected.push_str(&line);
                collected.push('\n');
            }
            let status = child
                .wait()
                .await
                .with_context(|| format!("waiting for {program}"))?;
            Ok::<(String, ExitStatus), anyhow::Error>((collected, status))
        };

        let outcome = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, collect).await.ok(),
            None => Some(collect.await),
        };

        let Some(result) = outcome else {
            let _ = self.kill().await;
            stderr_task.abort();
            return Err(ExitError::Timeout {
                tool: self.program.clone(),
                timeout_secs: self.timeout.map_or(0, |t| t.as_secs()),
            }
            .into());
        };
        let (stdout, status) = result?;
        let stderr = stderr_task.await.unwrap_or_default();

        Ok(RunOutput {
            stdout,
            stderr,
            exit_code: status.code().unwrap_or(-1),
        })
    }

    /// Kill the child if it is still running.
    pub async fn kill(&mut self) -> anyhow::Result<()> {
        if self.child.try_wait()?.is_some() {
            return Ok(());
        }
        self.child
            .kill()
            .await
            .with_context(|| format!("killing {}", self.program))
    }
}
