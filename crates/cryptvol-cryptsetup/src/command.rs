//! Execution wrapper for invoking `cryptsetup`.
//!
//! Shell integration stays isolated here so the engine logic can be tested with
//! fake binaries. Every outcome is reduced to an engine [`Status`].

use cryptvol_provider::{Status, EBUSY, EINVAL, EIO, ENODEV, ENOMEM, EPERM, ETIMEDOUT};
use log::{debug, warn};
use std::ffi::OsStr;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStderr, ChildStdout, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub(crate) struct CryptsetupCommand {
    binary: PathBuf,
    timeout: Duration,
}

#[derive(Debug)]
pub(crate) struct Output {
    pub(crate) stdout: String,
    pub(crate) stderr: String,
    pub(crate) exit_code: i32,
}

impl Output {
    /// Engine status equivalent of the exit code.
    pub(crate) fn status(&self) -> Status {
        exit_code_status(self.exit_code)
    }

    pub(crate) fn diagnostic(&self) -> String {
        let stderr = self.stderr.trim();
        let stdout = self.stdout.trim();
        if !stderr.is_empty() {
            stderr.to_string()
        } else {
            stdout.to_string()
        }
    }

    /// Keyslot number from the last verbose `Key slot N ...` line.
    ///
    /// Keyslot updates first report the slot that unlocked (`Key slot 0
    /// unlocked.`) and then the slot written (`Key slot 3 created.`).
    pub(crate) fn keyslot(&self) -> Option<u32> {
        self.stdout
            .lines()
            .chain(self.stderr.lines())
            .filter_map(|line| line.trim().strip_prefix("Key slot "))
            .filter_map(|rest| rest.split_whitespace().next()?.parse().ok())
            .last()
    }
}

impl CryptsetupCommand {
    pub(crate) fn new(binary: PathBuf, timeout: Duration) -> Self {
        Self { binary, timeout }
    }

    pub(crate) fn binary(&self) -> &Path {
        &self.binary
    }

    /// Run one `cryptsetup` action and return only its status.
    pub(crate) fn status<I, S>(&self, args: I, input: Option<&[u8]>) -> Status
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        match self.run(args, input) {
            Ok(out) => out.status(),
            Err(code) => code,
        }
    }

    /// Run one `cryptsetup` action.
    ///
    /// `Err` carries the status for failures to run the binary at all (spawn
    /// errors, timeouts). A non-zero exit is still `Ok`; see [`Output::status`].
    pub(crate) fn run<I, S>(&self, args: I, input: Option<&[u8]>) -> Result<Output, Status>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut command = Command::new(&self.binary);
        command.args(args);
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());
        command.stdin(if input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        debug!("running {:?}", command);

        let output = self.spawn_and_wait(command, input).map_err(|err| {
            warn!("failed to run {}: {err}", self.binary.display());
            io_status(&err)
        })?;

        let Some(output) = output else {
            warn!(
                "{} timed out after {:?}",
                self.binary.display(),
                self.timeout
            );
            return Err(ETIMEDOUT);
        };

        if output.exit_code != 0 {
            debug!(
                "{} exited with code {}: {}",
                self.binary.display(),
                output.exit_code,
                output.diagnostic()
            );
        }
        Ok(output)
    }

    fn spawn_and_wait(
        &self,
        mut command: Command,
        input: Option<&[u8]>,
    ) -> io::Result<Option<Output>> {
        let mut child = command.spawn()?;

        if let Some(payload) = input {
            if let Some(mut stdin) = child.stdin.take() {
                // The child may exit without reading its input.
                match stdin.write_all(payload).and_then(|()| stdin.flush()) {
                    Err(err) if err.kind() != io::ErrorKind::BrokenPipe => {
                        let _ = child.kill();
                        let _ = child.wait();
                        return Err(err);
                    }
                    _ => {}
                }
            }
        }

        let stdout_pipe = child.stdout.take();
        let stderr_pipe = child.stderr.take();
        self.wait_with_timeout(child, stdout_pipe, stderr_pipe)
    }

    fn wait_with_timeout(
        &self,
        mut child: Child,
        stdout_pipe: Option<ChildStdout>,
        stderr_pipe: Option<ChildStderr>,
    ) -> io::Result<Option<Output>> {
        let start = Instant::now();
        let stdout_handle = spawn_output_reader(stdout_pipe);
        let stderr_handle = spawn_output_reader(stderr_pipe);
        let mut exit_status = None;

        while start.elapsed() <= self.timeout {
            if let Some(status) = child.try_wait()? {
                exit_status = Some(status);
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }

        let Some(exit_status) = exit_status else {
            let _ = child.kill();
            let _ = child.wait();
            return Ok(None);
        };

        let stdout = join_reader(stdout_handle, "stdout")?;
        let stderr = join_reader(stderr_handle, "stderr")?;

        Ok(Some(Output {
            stdout,
            stderr,
            exit_code: exit_status.code().unwrap_or(-1),
        }))
    }
}

/// Map `cryptsetup` return codes back onto the errno the library reported.
///
/// 1: wrong parameters, 2: no permission (bad passphrase), 3: out of memory,
/// 4: wrong device specified, 5: device already exists or is busy.
pub(crate) fn exit_code_status(code: i32) -> Status {
    match code {
        0 => 0,
        1 => EINVAL,
        2 => EPERM,
        3 => ENOMEM,
        4 => ENODEV,
        5 => EBUSY,
        _ => EIO,
    }
}

pub(crate) fn io_status(err: &io::Error) -> Status {
    err.raw_os_error().map(|errno| -errno).unwrap_or(EIO)
}

fn spawn_output_reader<R>(pipe: Option<R>) -> thread::JoinHandle<io::Result<String>>
where
    R: Read + Send + 'static,
{
    thread::spawn(move || -> io::Result<String> {
        if let Some(mut reader) = pipe {
            let mut buf = Vec::new();
            reader.read_to_end(&mut buf)?;
            Ok(String::from_utf8_lossy(&buf).to_string())
        } else {
            Ok(String::new())
        }
    })
}

fn join_reader(
    handle: thread::JoinHandle<io::Result<String>>,
    stream: &str,
) -> io::Result<String> {
    handle.join().map_err(|_| {
        io::Error::new(
            io::ErrorKind::Other,
            format!("{stream} reader thread panicked"),
        )
    })?
}
