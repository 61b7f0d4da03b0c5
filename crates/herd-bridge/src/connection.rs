//! The transport-agnostic connection contract
//!
//! A [`Connection`] is one transport session to one physical device at one
//! point in time. Connections are ephemeral: their ids are transport-scoped
//! and may change across reconnects.

use std::fmt;
use std::path::Path;

use async_trait::async_trait;
use tokio::sync::{oneshot, watch};

use herd_core::prelude::*;
use herd_core::{ScannerId, TransferOptions};

/// One live transport session to a device.
///
/// Failures are classified by [`Error`] kind: `Connection` means the
/// transport is gone, `Operation`/`NotFound` mean the remote side refused,
/// `Cancelled` means the caller's token fired.
#[async_trait]
pub trait Connection: Send + Sync + fmt::Debug {
    /// Transport-scoped id (adb serial, SSH address). Not stable across reconnects.
    fn connection_id(&self) -> &str;

    /// Scanner that produced this connection, used only for rediscovery.
    fn owner(&self) -> ScannerId;

    async fn reboot(&self) -> Result<()>;

    async fn push_file(
        &self,
        local_path: &Path,
        device_path: &str,
        options: TransferOptions,
    ) -> Result<()>;

    async fn pull_file(
        &self,
        device_path: &str,
        local_path: &Path,
        options: TransferOptions,
    ) -> Result<()>;

    /// Start a shell command. Returns immediately; output accumulates on the
    /// returned handle while the remote process runs.
    fn execute_shell_command(&self, command: &str) -> CommandResult;

    /// Release transport resources. Idempotent, never fails.
    async fn dispose(&self);
}

/// Live view of a running shell command.
///
/// [`CommandResult::subscribe`] yields a receiver that is notified each time
/// output is appended; [`CommandResult::complete`] resolves to the full output
/// once the remote process exits.
pub struct CommandResult {
    command: String,
    output: watch::Receiver<String>,
    completion: oneshot::Receiver<Result<String>>,
}

impl fmt::Debug for CommandResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandResult")
            .field("command", &self.command)
            .field("output_len", &self.output.borrow().len())
            .finish()
    }
}

impl CommandResult {
    /// Create a result handle and the writer that feeds it
    pub fn channel(command: impl Into<String>) -> (CommandWriter, CommandResult) {
        let (output_tx, output_rx) = watch::channel(String::new());
        let (completion_tx, completion_rx) = oneshot::channel();
        (
            CommandWriter {
                output: output_tx,
                completion: completion_tx,
            },
            CommandResult {
                command: command.into(),
                output: output_rx,
                completion: completion_rx,
            },
        )
    }

    /// A result that has already failed, for commands that cannot start
    pub fn failed(command: impl Into<String>, error: Error) -> Self {
        let (writer, result) = Self::channel(command);
        writer.finish(Err(error));
        result
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    /// Output received so far
    pub fn output(&self) -> String {
        self.output.borrow().clone()
    }

    /// Receiver that is marked changed whenever output is appended
    pub fn subscribe(&self) -> watch::Receiver<String> {
        self.output.clone()
    }

    /// Wait for the command to exit and return its full output
    pub async fn complete(self) -> Result<String> {
        self.completion.await.unwrap_or(Err(Error::ChannelClosed))
    }
}

/// Producer side of a [`CommandResult`]
pub struct CommandWriter {
    output: watch::Sender<String>,
    completion: oneshot::Sender<Result<String>>,
}

impl fmt::Debug for CommandWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandWriter")
            .field("output_len", &self.output.borrow().len())
            .finish()
    }
}

impl CommandWriter {
    /// Append text in receipt order and notify subscribers
    pub fn append(&self, text: &str) {
        self.output.send_modify(|output| output.push_str(text));
    }

    /// Replace the whole output, used when a retried command starts over
    pub fn replace(&self, text: String) {
        self.output.send_replace(text);
    }

    pub fn output(&self) -> String {
        self.output.borrow().clone()
    }

    /// Resolve the completion future
    pub fn finish(self, result: Result<String>) {
        // Nobody waiting on completion is fine
        let _ = self.completion.send(result);
    }

    /// Mirror another command's output into this one until it completes.
    ///
    /// The mirrored text replaces whatever this writer held before, so a
    /// handle re-pointed at a retried command shows that attempt's output.
    pub async fn forward(&self, inner: CommandResult) -> Result<String> {
        let CommandResult {
            mut output,
            mut completion,
            ..
        } = inner;

        self.replace(output.borrow_and_update().clone());
        let mut streaming = true;

        let result = loop {
            tokio::select! {
                biased;
                changed = output.changed(), if streaming => {
                    match changed {
                        Ok(()) => self.replace(output.borrow_and_update().clone()),
                        Err(_) => streaming = false,
                    }
                }
                result = &mut completion => {
                    break result.unwrap_or(Err(Error::ChannelClosed));
                }
            }
        };

        self.replace(output.borrow().clone());
        result
    }
}
