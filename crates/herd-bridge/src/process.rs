//! Child-process plumbing shared by the adb and ssh transports
//!
//! Both transports drive a host CLI (`adb`, `ssh`). This module spawns those
//! programs, streams their output into [`CommandResult`]s, pumps file bytes
//! through remote `cat` processes and maps failed exits onto the error
//! taxonomy via a transport-specific [`FailureClassifier`].

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Semaphore;

use herd_core::prelude::*;
use herd_core::TransferOptions;

use crate::connection::{CommandResult, CommandWriter};

/// Bytes moved per read/write during file transfers
const CHUNK_SIZE: usize = 64 * 1024;

/// Maps a failed exit (code, captured stderr) onto an [`Error`]
pub(crate) type FailureClassifier = fn(Option<i32>, &str) -> Error;

/// A host program invocation
#[derive(Debug, Clone)]
pub(crate) struct Invocation {
    program: String,
    args: Vec<String>,
}

impl Invocation {
    pub(crate) fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub(crate) fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub(crate) fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub(crate) fn program(&self) -> &str {
        &self.program
    }

    #[cfg(test)]
    pub(crate) fn arg_list(&self) -> &[String] {
        &self.args
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.args).kill_on_drop(true);
        command
    }

    fn spawn(&self, stdin: Stdio, stdout: Stdio) -> Result<Child> {
        trace!("Spawning {} {}", self.program, self.args.join(" "));
        self.command()
            .stdin(stdin)
            .stdout(stdout)
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| spawn_error(&self.program, e))
    }
}

fn spawn_error(program: &str, e: std::io::Error) -> Error {
    if e.kind() == std::io::ErrorKind::NotFound {
        Error::tool_not_found(program)
    } else {
        Error::process_spawn(program, e.to_string())
    }
}

/// Extract the path from a "No such file or directory" diagnostic.
///
/// `cat: /sdcard/x: No such file or directory` yields `/sdcard/x`.
pub(crate) fn missing_path(stderr: &str) -> Option<String> {
    const MARKER: &str = "No such file or directory";
    let line = stderr.lines().find(|l| l.contains(MARKER))?;
    let before = line[..line.find(MARKER)?].trim_end().trim_end_matches(':');
    let mut path = before.rsplit(": ").next().unwrap_or(before).trim();
    if let (Some(start), Some(end)) = (path.find('\''), path.rfind('\'')) {
        if end > start {
            path = &path[start + 1..end];
        }
    }
    Some(if path.is_empty() { line.trim() } else { path }.to_string())
}

/// Quote a word for the device's POSIX shell
pub(crate) fn shell_quote(word: &str) -> String {
    shell_escape::unix::escape(word.into()).into_owned()
}

/// First non-empty stderr line, for compact error messages
pub(crate) fn first_line(stderr: &str) -> &str {
    stderr
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("no diagnostic output")
}

/// Run to completion and return stdout
pub(crate) async fn run_captured(
    invocation: &Invocation,
    classify: FailureClassifier,
) -> Result<String> {
    let child = invocation.spawn(Stdio::null(), Stdio::piped())?;
    let output = child.wait_with_output().await?;
    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();

    if output.status.success() {
        Ok(stdout)
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        debug!(
            "{} exited with {:?}: {}",
            invocation.program(),
            output.status.code(),
            stderr.trim()
        );
        Err(classify(output.status.code(), &stderr))
    }
}

/// Start a shell command whose output streams into the returned handle.
///
/// When `limiter` is given a permit is held for the lifetime of the process.
pub(crate) fn spawn_shell(
    command: &str,
    invocation: Invocation,
    classify: FailureClassifier,
    limiter: Option<Arc<Semaphore>>,
) -> CommandResult {
    let (writer, result) = CommandResult::channel(command);

    tokio::spawn(async move {
        let _permit = match limiter {
            Some(limiter) => match limiter.acquire_owned().await {
                Ok(permit) => Some(permit),
                Err(_) => {
                    writer.finish(Err(Error::ChannelClosed));
                    return;
                }
            },
            None => None,
        };
        let outcome = run_shell(&invocation, &writer, classify).await;
        writer.finish(outcome);
    });

    result
}

/// Run a command, appending stdout and stderr lines to `writer` as they arrive
async fn run_shell(
    invocation: &Invocation,
    writer: &CommandWriter,
    classify: FailureClassifier,
) -> Result<String> {
    let mut child = invocation.spawn(Stdio::null(), Stdio::piped())?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| Error::operation("stdout was not captured"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| Error::operation("stderr was not captured"))?;

    let mut out_lines = BufReader::new(stdout).lines();
    let mut err_lines = BufReader::new(stderr).lines();
    let mut stderr_text = String::new();
    let (mut out_open, mut err_open) = (true, true);

    while out_open || err_open {
        tokio::select! {
            line = out_lines.next_line(), if out_open => match line {
                Ok(Some(line)) => writer.append(&format!("{}\n", line)),
                Ok(None) => out_open = false,
                Err(e) => {
                    debug!("stdout read failed: {}", e);
                    out_open = false;
                }
            },
            line = err_lines.next_line(), if err_open => match line {
                Ok(Some(line)) => {
                    writer.append(&format!("{}\n", line));
                    stderr_text.push_str(&line);
                    stderr_text.push('\n');
                }
                Ok(None) => err_open = false,
                Err(e) => {
                    debug!("stderr read failed: {}", e);
                    err_open = false;
                }
            },
        }
    }

    let status = child.wait().await?;
    if status.success() {
        Ok(writer.output())
    } else {
        Err(classify(status.code(), &stderr_text))
    }
}

async fn collect_stderr(stderr: Option<impl AsyncRead + Unpin>) -> String {
    let mut text = String::new();
    if let Some(mut stderr) = stderr {
        if let Err(e) = stderr.read_to_string(&mut text).await {
            debug!("Failed to read stderr: {}", e);
        }
    }
    text
}

async fn abort(child: &mut Child) {
    if let Err(e) = child.kill().await {
        debug!("Failed to kill transfer process: {}", e);
    }
}

/// Stream a local file into a remote `cat > PATH` process
pub(crate) async fn stream_to_remote(
    invocation: &Invocation,
    local_path: &Path,
    options: &TransferOptions,
    classify: FailureClassifier,
) -> Result<()> {
    if options.cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }

    let mut file = tokio::fs::File::open(local_path).await?;
    let total = file.metadata().await?.len();
    let mut tracker = options.tracker();
    tracker.report(0, Some(total));

    let mut child = invocation.spawn(Stdio::piped(), Stdio::null())?;
    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| Error::operation("stdin was not captured"))?;
    let stderr = tokio::spawn(collect_stderr(child.stderr.take()));

    let copy = async {
        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut sent = 0u64;
        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            stdin
                .write_all(&buf[..n])
                .await
                .map_err(|e| Error::connection(format!("transfer interrupted: {}", e)))?;
            sent += n as u64;
            tracker.report(sent, Some(total));
        }
        stdin
            .shutdown()
            .await
            .map_err(|e| Error::connection(format!("transfer interrupted: {}", e)))?;
        drop(stdin);
        Ok::<u64, Error>(sent)
    };

    let copied = tokio::select! {
        biased;
        _ = options.cancel.cancelled() => {
            info!("Push to {} cancelled", invocation.program());
            abort(&mut child).await;
            return Err(Error::Cancelled);
        }
        copied = copy => copied,
    };

    let status = child.wait().await?;
    let stderr_text = stderr.await.unwrap_or_default();
    if !status.success() {
        return Err(classify(status.code(), &stderr_text));
    }
    let sent = copied?;
    debug!("Pushed {} bytes from {}", sent, local_path.display());

    tracker.finish();
    Ok(())
}

/// Stream a remote `cat PATH` process into a local file.
///
/// A partially written local file is removed on failure or cancellation.
pub(crate) async fn stream_from_remote(
    invocation: &Invocation,
    local_path: &Path,
    total: Option<u64>,
    options: &TransferOptions,
    classify: FailureClassifier,
) -> Result<()> {
    if options.cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }

    let mut tracker = options.tracker();
    tracker.report(0, total);

    let mut child = invocation.spawn(Stdio::null(), Stdio::piped())?;
    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| Error::operation("stdout was not captured"))?;
    let stderr = tokio::spawn(collect_stderr(child.stderr.take()));
    let mut file = tokio::fs::File::create(local_path).await?;

    let copy = async {
        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut received = 0u64;
        loop {
            let n = stdout
                .read(&mut buf)
                .await
                .map_err(|e| Error::connection(format!("transfer interrupted: {}", e)))?;
            if n == 0 {
                break;
            }
            file.write_all(&buf[..n]).await?;
            received += n as u64;
            tracker.report(received, total);
        }
        file.flush().await?;
        Ok::<u64, Error>(received)
    };

    let copied = tokio::select! {
        biased;
        _ = options.cancel.cancelled() => {
            info!("Pull into {} cancelled", local_path.display());
            abort(&mut child).await;
            remove_partial(local_path).await;
            return Err(Error::Cancelled);
        }
        copied = copy => copied,
    };

    let status = child.wait().await?;
    let stderr_text = stderr.await.unwrap_or_default();
    let outcome = if status.success() {
        copied.map(|received| {
            debug!("Pulled {} bytes into {}", received, local_path.display());
        })
    } else {
        Err(classify(status.code(), &stderr_text))
    };

    match outcome {
        Ok(()) => {
            tracker.finish();
            Ok(())
        }
        Err(e) => {
            remove_partial(local_path).await;
            Err(e)
        }
    }
}

async fn remove_partial(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        debug!("Could not remove partial file {}: {}", path.display(), e);
    }
}
