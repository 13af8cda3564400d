//! Stopping the co-located browser when a client asks to exit.

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("Failed to run {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{command} exited with {status}")]
    Failed { command: String, status: String },
}

/// Something that can ask an external process to stop.
#[async_trait]
pub trait ProcessTerminator: Send + Sync {
    async fn terminate(&self) -> Result<(), ProcessError>;

    fn target(&self) -> &str;
}

/// Sends SIGTERM to every process with a matching name via `pkill`.
#[derive(Debug, Clone)]
pub struct Pkill {
    process_name: String,
}

impl Pkill {
    pub fn new(process_name: impl Into<String>) -> Self {
        Self {
            process_name: process_name.into(),
        }
    }
}

#[async_trait]
impl ProcessTerminator for Pkill {
    async fn terminate(&self) -> Result<(), ProcessError> {
        let command = format!("pkill {}", self.process_name);
        debug!("Running {}", command);

        let status = Command::new("pkill")
            .arg(&self.process_name)
            // A caller that gives up waiting must not leave pkill behind.
            .kill_on_drop(true)
            .status()
            .await
            .map_err(|source| ProcessError::Spawn {
                command: command.clone(),
                source,
            })?;

        match pkill_outcome(&command, status.code())? {
            PkillOutcome::Signalled => info!("pkill {} issued", self.process_name),
            PkillOutcome::NoMatch => info!("pkill {}: no matching process", self.process_name),
        }
        Ok(())
    }

    fn target(&self) -> &str {
        &self.process_name
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PkillOutcome {
    Signalled,
    NoMatch,
}

/// Interprets a `pkill` exit code. `None` means it was killed by a signal.
fn pkill_outcome(command: &str, code: Option<i32>) -> Result<PkillOutcome, ProcessError> {
    match code {
        Some(0) => Ok(PkillOutcome::Signalled),
        // pkill uses 1 for "nothing matched"
        Some(1) => Ok(PkillOutcome::NoMatch),
        Some(code) => Err(ProcessError::Failed {
            command: command.to_string(),
            status: format!("exit code {}", code),
        }),
        None => Err(ProcessError::Failed {
            command: command.to_string(),
            status: "termination by signal".to_string(),
        }),
    }
}

/// Used when no external process is configured.
#[derive(Debug, Clone, Default)]
pub struct NoopTerminator;

#[async_trait]
impl ProcessTerminator for NoopTerminator {
    async fn terminate(&self) -> Result<(), ProcessError> {
        warn!("EXIT received but no process to terminate is configured");
        Ok(())
    }

    fn target(&self) -> &str {
        ""
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn noop_terminator_succeeds() {
        assert!(NoopTerminator.terminate().await.is_ok());
        assert_eq!(NoopTerminator.target(), "");
    }

    #[test]
    fn pkill_reports_its_target() {
        let pkill = Pkill::new("chromium-browser");
        assert_eq!(pkill.target(), "chromium-browser");
    }

    #[test]
    fn pkill_exit_codes() {
        let cmd = "pkill chromium-browser";
        assert_eq!(pkill_outcome(cmd, Some(0)).unwrap(), PkillOutcome::Signalled);
        assert_eq!(pkill_outcome(cmd, Some(1)).unwrap(), PkillOutcome::NoMatch);

        // 2 is a syntax error, 3 a fatal error
        for code in [2, 3] {
            let err = pkill_outcome(cmd, Some(code)).unwrap_err();
            assert!(matches!(&err, ProcessError::Failed { command, .. } if command == cmd));
            assert_eq!(err.to_string(), format!("{} exited with exit code {}", cmd, code));
        }

        assert!(matches!(
            pkill_outcome(cmd, None),
            Err(ProcessError::Failed { .. })
        ));
    }
}
