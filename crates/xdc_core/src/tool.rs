//! Typed invocation of external executables.
//!
//! Every external collaborator (extraction tool, `git`, `xdelta3`) is started through a
//! [`ToolRunner`] with an explicit argument list; nothing is ever joined into a shell
//! command line. Tests and embedders can substitute their own runner.

use crate::error::{Error, Result};
use camino::{Utf8Path, Utf8PathBuf};
use std::ffi::{OsStr, OsString};
use std::io::{self, Read};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

/// Interval between exit checks while waiting on a child with a timeout.
const WAIT_STEP: Duration = Duration::from_millis(25);

/// One process to run.
#[derive(Debug, Clone)]
pub struct ToolInvocation {
    pub program: OsString,
    pub args: Vec<OsString>,
    pub cwd: Option<Utf8PathBuf>,
    pub timeout: Option<Duration>,
}

impl ToolInvocation {
    pub fn new(program: impl AsRef<OsStr>) -> Self {
        Self {
            program: program.as_ref().to_os_string(),
            args: Vec::new(),
            cwd: None,
            timeout: None,
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    pub fn current_dir(mut self, dir: impl AsRef<Utf8Path>) -> Self {
        self.cwd = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn program_name(&self) -> String {
        self.program.to_string_lossy().into_owned()
    }
}

/// Captured result of a finished process.
#[derive(Debug, Clone, Default)]
pub struct ToolOutput {
    /// Exit code, `None` if the process was terminated by a signal.
    pub code: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl ToolOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    /// Turn a non-zero exit into [`Error::ToolFailed`].
    pub fn ensure_success(self, program: &str) -> Result<Self> {
        if self.success() {
            Ok(self)
        } else {
            Err(Error::ToolFailed {
                program: program.to_string(),
                code: self.code,
                stderr: self.stderr_lossy().trim().to_string(),
            })
        }
    }
}

/// Capability to run external processes.
pub trait ToolRunner: Send + Sync {
    /// Run the invocation to completion and capture its output.
    ///
    /// A missing executable is [`Error::ToolNotFound`], an elapsed timeout
    /// [`Error::ToolTimeout`]. A non-zero exit is *not* an error here; callers inspect
    /// [`ToolOutput::code`] or use [`ToolOutput::ensure_success`].
    fn run(&self, invocation: &ToolInvocation) -> Result<ToolOutput>;
}

/// [`ToolRunner`] backed by `std::process::Command`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemToolRunner;

impl ToolRunner for SystemToolRunner {
    fn run(&self, invocation: &ToolInvocation) -> Result<ToolOutput> {
        let program = invocation.program_name();
        let mut command = Command::new(&invocation.program);
        command
            .args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(cwd) = &invocation.cwd {
            command.current_dir(cwd.as_std_path());
        }

        tracing::trace!("Running {:?} {:?}", invocation.program, invocation.args);

        let mut child = command.spawn().map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => Error::ToolNotFound {
                program: program.clone(),
            },
            _ => Error::Io(e),
        })?;

        // Drain both pipes on helper threads so a chatty child never blocks on a full pipe.
        let stdout = child.stdout.take().map(spawn_drain);
        let stderr = child.stderr.take().map(spawn_drain);

        let status = match invocation.timeout {
            None => child.wait()?,
            Some(timeout) => {
                let started = Instant::now();
                loop {
                    if let Some(status) = child.try_wait()? {
                        break status;
                    }
                    if started.elapsed() >= timeout {
                        tracing::warn!("{} exceeded {:?}, killing it", program, timeout);
                        let _ = child.kill();
                        let _ = child.wait();
                        return Err(Error::ToolTimeout { program, timeout });
                    }
                    thread::sleep(WAIT_STEP);
                }
            }
        };

        Ok(ToolOutput {
            code: status.code(),
            stdout: stdout.map(join_drain).unwrap_or_default(),
            stderr: stderr.map(join_drain).unwrap_or_default(),
        })
    }
}

fn spawn_drain<R: Read + Send + 'static>(mut pipe: R) -> thread::JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        buf
    })
}

fn join_drain(handle: thread::JoinHandle<Vec<u8>>) -> Vec<u8> {
    handle.join().unwrap_or_default()
}
