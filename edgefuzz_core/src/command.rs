use crate::config::CommandSettings;
use std::io::{Read, Write};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("No command configured")]
    EmptyCommand,
    #[error("Failed to spawn {program:?}: {message}")]
    Spawn { program: String, message: String },
    #[error("Timed out after {0} ms")]
    Timeout(u64),
    #[error("Exited with {status}: {stderr}")]
    Failed { status: String, stderr: String },
    #[error("Process I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for CommandError {
    fn from(err: std::io::Error) -> Self {
        CommandError::Io(err.to_string())
    }
}

/// Runs an external collaborator: request on stdin, answer on stdout.
#[derive(Debug, Clone)]
pub struct CommandRunner {
    settings: CommandSettings,
}

impl CommandRunner {
    pub fn new(settings: CommandSettings) -> Self {
        Self { settings }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.settings.timeout_ms)
    }

    /// Feeds `input` to the process and returns its stdout.
    ///
    /// Stdout and stderr are drained on their own threads so a chatty process
    /// cannot block on a full pipe. A non-zero exit is an error carrying the
    /// tail of stderr.
    pub fn run(&self, input: &[u8]) -> Result<Vec<u8>, CommandError> {
        let (program, args) = self
            .settings
            .command
            .split_first()
            .ok_or(CommandError::EmptyCommand)?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(cwd) = &self.settings.working_dir {
            cmd.current_dir(cwd);
        }

        let mut child = cmd.spawn().map_err(|e| CommandError::Spawn {
            program: program.clone(),
            message: e.to_string(),
        })?;

        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());
        if let Some(mut stdin) = child.stdin.take() {
            let payload = input.to_vec();
            // Closing stdin on drop tells the process the request is complete.
            thread::spawn(move || {
                let _ = stdin.write_all(&payload);
            });
        }

        let status = self.wait_with_timeout(&mut child)?;
        let stdout = join(stdout)?;
        let stderr = join(stderr)?;

        if !status.success() {
            let stderr = String::from_utf8_lossy(&stderr);
            return Err(CommandError::Failed {
                status: status.to_string(),
                stderr: tail(stderr.trim(), 512).to_string(),
            });
        }
        Ok(stdout)
    }

    fn wait_with_timeout(&self, child: &mut Child) -> Result<ExitStatus, CommandError> {
        let timeout = self.timeout();
        let start_time = Instant::now();
        loop {
            match child.try_wait()? {
                Some(status) => return Ok(status),
                None => {
                    if start_time.elapsed() > timeout {
                        tracing::warn!(
                            command = ?self.settings.command,
                            timeout_ms = self.settings.timeout_ms,
                            "Collaborator timed out, killing"
                        );
                        child.kill()?;
                        let _ = child.wait();
                        return Err(CommandError::Timeout(self.settings.timeout_ms));
                    }
                    thread::sleep(WAIT_POLL_INTERVAL);
                }
            }
        }
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Option<JoinHandle<std::io::Result<Vec<u8>>>> {
    pipe.map(|mut pipe| {
        thread::spawn(move || {
            let mut buffer = Vec::new();
            pipe.read_to_end(&mut buffer)?;
            Ok(buffer)
        })
    })
}

fn join(handle: Option<JoinHandle<std::io::Result<Vec<u8>>>>) -> Result<Vec<u8>, CommandError> {
    match handle {
        Some(handle) => handle
            .join()
            .map_err(|_| CommandError::Io("pipe reader panicked".to_string()))?
            .map_err(CommandError::from),
        None => Ok(Vec::new()),
    }
}

fn tail(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut start = text.len() - max;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}
