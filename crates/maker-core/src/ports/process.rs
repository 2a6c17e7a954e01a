//! Running external tools so that an interrupt or timeout kills the child.

use std::io::Read;
use std::process::{Child, Command, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use super::PortError;
use crate::cancel::CancellationToken;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Captured output of a successful tool run.
#[derive(Debug, Default)]
pub struct ToolOutput {
    pub stdout: Vec<u8>,
    pub stderr: String,
}

/// Run `cmd` to completion, polling for cancellation and the optional timeout.
///
/// A non-zero exit is `PortError::Failed` carrying the tool's stderr.
pub fn run(mut cmd: Command, cancel: &CancellationToken, timeout: Option<Duration>) -> Result<ToolOutput, PortError> {
    let program = cmd.get_program().to_string_lossy().into_owned();
    debug!(command = ?cmd, "running external tool");

    let mut child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|source| PortError::Spawn {
            program: program.clone(),
            source,
        })?;

    let stdout = drain(child.stdout.take());
    let stderr = drain(child.stderr.take());
    let started = Instant::now();

    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) => {}
            Err(source) => {
                kill(&mut child, &program);
                return Err(PortError::Spawn { program, source });
            }
        }

        if cancel.is_cancelled() {
            warn!(program = %program, "cancelling running tool");
            kill(&mut child, &program);
            return Err(PortError::Cancelled);
        }
        if let Some(limit) = timeout {
            if started.elapsed() >= limit {
                warn!(program = %program, secs = limit.as_secs(), "tool timed out");
                kill(&mut child, &program);
                return Err(PortError::Timeout {
                    program,
                    secs: limit.as_secs(),
                });
            }
        }
        thread::sleep(POLL_INTERVAL);
    };

    let stdout = stdout.join().unwrap_or_default();
    let stderr = String::from_utf8_lossy(&stderr.join().unwrap_or_default()).into_owned();

    if !status.success() {
        return Err(PortError::Failed {
            program,
            status: status.code(),
            stderr,
        });
    }
    Ok(ToolOutput { stdout, stderr })
}

/// Read a child pipe to the end on its own thread so a chatty tool cannot block on a full pipe.
fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf);
        }
        buf
    })
}

fn kill(child: &mut Child, program: &str) {
    if let Err(e) = child.kill() {
        debug!(program = %program, error = %e, "kill failed, child likely already exited");
    }
    let _ = child.wait();
}
