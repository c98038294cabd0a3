//! Secret resolution for backend environments.
//!
//! Each configured secret is an argv run once per spawn; its trimmed stdout becomes an env var of
//! the backend process. Output is never logged.

use crate::error::{BridgeError, Result};
use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

pub const SECRET_COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

/// Run every secret command for `server`, in variable-name order.
///
/// The first failure aborts resolution; the backend must not start with a partial environment.
pub async fn resolve_secrets(
    server: &str,
    commands: &BTreeMap<String, Vec<String>>,
    timeout: Duration,
) -> Result<Vec<(String, String)>> {
    let mut resolved = Vec::with_capacity(commands.len());
    for (var, argv) in commands {
        let value = run_secret_command(server, var, argv, timeout).await?;
        tracing::debug!(server, var = %var, "resolved secret");
        resolved.push((var.clone(), value));
    }
    Ok(resolved)
}

async fn run_secret_command(
    server: &str,
    var: &str,
    argv: &[String],
    timeout: Duration,
) -> Result<String> {
    let fail = |reason: String| BridgeError::SecretResolution {
        server: server.to_string(),
        var: var.to_string(),
        reason,
    };

    let Some((program, args)) = argv.split_first() else {
        return Err(fail("empty command".to_string()));
    };

    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true);

    let output = match tokio::time::timeout(timeout, cmd.output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => return Err(fail(format!("failed to run '{program}': {e}"))),
        Err(_) => {
            return Err(fail(format!(
                "'{program}' timed out after {}s",
                timeout.as_secs()
            )));
        }
    };

    if !output.status.success() {
        return Err(fail(format!("'{program}' exited with {}", output.status)));
    }

    let value = String::from_utf8(output.stdout)
        .map_err(|_| fail(format!("'{program}' produced non-UTF-8 output")))?;
    let value = value.trim();
    if value.is_empty() {
        return Err(fail(format!("'{program}' produced no output")));
    }
    Ok(value.to_string())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| (*s).to_string()).collect()
    }

    #[tokio::test]
    async fn trims_command_output() {
        let mut commands = BTreeMap::new();
        commands.insert(
            "TOKEN".to_string(),
            argv(&["sh", "-c", "printf '  s3cret \\n'"]),
        );
        let resolved = resolve_secrets("git", &commands, SECRET_COMMAND_TIMEOUT)
            .await
            .expect("resolve");
        assert_eq!(resolved, vec![("TOKEN".to_string(), "s3cret".to_string())]);
    }

    #[tokio::test]
    async fn failures_are_secret_resolution_errors() {
        let cases = [
            argv(&["false"]),
            argv(&["/definitely/not/a/binary"]),
            argv(&["sh", "-c", "true"]),
        ];
        for command in cases {
            let mut commands = BTreeMap::new();
            commands.insert("TOKEN".to_string(), command.clone());
            let err = resolve_secrets("git", &commands, SECRET_COMMAND_TIMEOUT)
                .await
                .unwrap_err();
            assert_eq!(err.kind(), ErrorKind::SecretResolutionError, "{command:?}");
            assert!(err.to_string().contains("TOKEN"));
        }
    }

    #[tokio::test]
    async fn slow_commands_time_out() {
        let mut commands = BTreeMap::new();
        commands.insert("TOKEN".to_string(), argv(&["sleep", "5"]));
        let err = resolve_secrets("git", &commands, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"), "{err}");
    }
}
