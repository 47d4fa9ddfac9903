//! Node power control
//!
//! Power is switched by an external executable that receives one JSON
//! request on stdin, e.g. `{"piId":"pi-01","action":"poweron"}`, and answers
//! exactly `ok` on stdout, optionally followed by one newline. Anything
//! else (non-zero exit, other output, any stderr) is a failure.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::utils::process::run_command;

/// Power action sent to the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PowerAction {
    PowerOn,
    PowerOff,
}

impl PowerAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PowerOn => "poweron",
            Self::PowerOff => "poweroff",
        }
    }
}

impl std::fmt::Display for PowerAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PowerRequest<'a> {
    pi_id: &'a str,
    action: PowerAction,
}

/// Switches node power
#[async_trait]
pub trait PowerController: Send + Sync {
    async fn apply(&self, node_id: &str, action: PowerAction) -> Result<()>;

    async fn power_on(&self, node_id: &str) -> Result<()> {
        self.apply(node_id, PowerAction::PowerOn).await
    }

    async fn power_off(&self, node_id: &str) -> Result<()> {
        self.apply(node_id, PowerAction::PowerOff).await
    }

    /// Power off, wait `delay`, power on. The first failure aborts.
    async fn power_cycle(&self, node_id: &str, delay: Duration) -> Result<()> {
        self.power_off(node_id).await?;
        tokio::time::sleep(delay).await;
        self.power_on(node_id).await
    }
}

/// [`PowerController`] backed by an external executable
#[derive(Debug, Clone)]
pub struct ExecPowerController {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl ExecPowerController {
    pub fn new(program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            timeout,
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }
}

#[async_trait]
impl PowerController for ExecPowerController {
    async fn apply(&self, node_id: &str, action: PowerAction) -> Result<()> {
        let request = serde_json::to_vec(&PowerRequest {
            pi_id: node_id,
            action,
        })?;

        let failure = |reason: String| Error::PowerAction {
            node: node_id.to_string(),
            action: action.to_string(),
            reason,
        };

        debug!(node_id, %action, program = %self.program, "Sending power request");
        let output = run_command(&self.program, &self.args, Some(request.as_slice()), self.timeout)
            .await
            .map_err(|e| failure(e.to_string()))?;

        if !output.success() {
            return Err(failure(format!(
                "exited with {}: {}",
                output.status,
                output.diagnostic()
            )));
        }
        if !output.stderr.is_empty() {
            return Err(failure(format!("unexpected stderr: {}", output.stderr.trim())));
        }
        let response = output.stdout.strip_suffix('\n').unwrap_or(output.stdout.as_str());
        if response != "ok" {
            return Err(failure(format!("unexpected response: {:?}", output.stdout)));
        }

        info!(node_id, %action, "Power action applied");
        Ok(())
    }
}

/// In-process [`PowerController`] that records every request
#[derive(Debug, Default)]
pub struct MockPowerController {
    calls: Mutex<Vec<(String, PowerAction)>>,
    failing: Mutex<Option<PowerAction>>,
}

impl MockPowerController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every request for `action` fail; `None` clears the failure
    pub fn fail_on(&self, action: Option<PowerAction>) {
        if let Ok(mut failing) = self.failing.lock() {
            *failing = action;
        }
    }

    /// Requests received so far, in order
    pub fn calls(&self) -> Vec<(String, PowerAction)> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl PowerController for MockPowerController {
    async fn apply(&self, node_id: &str, action: PowerAction) -> Result<()> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push((node_id.to_string(), action));
        }

        let failing = self.failing.lock().map(|f| *f).unwrap_or(None);
        if failing == Some(action) {
            return Err(Error::PowerAction {
                node: node_id.to_string(),
                action: action.to_string(),
                reason: "injected failure".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_format() {
        let body = serde_json::to_string(&PowerRequest {
            pi_id: "pi-01",
            action: PowerAction::PowerOn,
        })
        .unwrap();
        assert_eq!(body, r#"{"piId":"pi-01","action":"poweron"}"#);
    }

    #[tokio::test]
    async fn test_mock_power_cycle_order() {
        let power = MockPowerController::new();
        power.power_cycle("pi-01", Duration::ZERO).await.unwrap();

        assert_eq!(
            power.calls(),
            vec![
                ("pi-01".to_string(), PowerAction::PowerOff),
                ("pi-01".to_string(), PowerAction::PowerOn),
            ]
        );
    }

    #[tokio::test]
    async fn test_mock_power_cycle_aborts_on_first_failure() {
        let power = MockPowerController::new();
        power.fail_on(Some(PowerAction::PowerOff));

        let result = power.power_cycle("pi-01", Duration::ZERO).await;
        assert!(matches!(result, Err(Error::PowerAction { .. })));
        assert_eq!(power.calls().len(), 1);
    }

    #[cfg(unix)]
    mod exec {
        use super::*;

        fn script(body: &str) -> ExecPowerController {
            ExecPowerController::new("sh", Duration::from_secs(5))
                .with_args(vec!["-c".to_string(), body.to_string()])
        }

        #[tokio::test]
        async fn test_ok_response() {
            let power = script(r#"read req; case "$req" in *'"piId":"pi-07"'*) echo ok;; *) echo no;; esac"#);
            power.power_on("pi-07").await.unwrap();
        }

        #[tokio::test]
        async fn test_ok_without_newline() {
            let power = script("cat >/dev/null; printf ok");
            power.power_off("pi-01").await.unwrap();
        }

        #[tokio::test]
        async fn test_padded_ok_is_rejected() {
            for body in ["cat >/dev/null; printf '  ok \\n'", "cat >/dev/null; printf 'ok\\n\\n'"] {
                let result = script(body).power_off("pi-01").await;
                assert!(matches!(result, Err(Error::PowerAction { .. })), "{body} was accepted");
            }
        }

        #[tokio::test]
        async fn test_unexpected_stdout() {
            let power = script("cat >/dev/null; echo done");
            let result = power.power_on("pi-01").await;
            assert!(matches!(result, Err(Error::PowerAction { .. })));
        }

        #[tokio::test]
        async fn test_stderr_is_failure() {
            let power = script("cat >/dev/null; echo ok; echo warning >&2");
            let result = power.power_on("pi-01").await;
            match result {
                Err(Error::PowerAction { reason, .. }) => assert!(reason.contains("stderr")),
                other => panic!("expected power failure, got {other:?}"),
            }
        }

        #[tokio::test]
        async fn test_non_zero_exit() {
            let power = script("cat >/dev/null; echo ok; exit 1");
            assert!(power.power_on("pi-01").await.is_err());
        }
    }
}
