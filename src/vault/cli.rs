use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use super::{VaultClient, VaultError};

// ---------------------------------------------------------------------------
// VaultCli
// ---------------------------------------------------------------------------

/// Drives the external vault binary over subprocess calls.
///
/// Every invocation is bounded by a wall-clock timeout, and the child is
/// killed and awaited on every failure path so no orphan processes linger.
pub struct VaultCli {
    binary_path: String,
    timeout: Duration,
}

struct CommandOutput {
    stdout: String,
    stderr: String,
    success: bool,
}

impl VaultCli {
    pub fn new(binary_path: &str, timeout_seconds: u64) -> Self {
        Self {
            binary_path: binary_path.to_string(),
            timeout: Duration::from_secs(timeout_seconds),
        }
    }

    async fn run(
        &self,
        args: &[&str],
        stdin_data: Option<&str>,
        extra_env: &[(&str, &str)],
    ) -> Result<CommandOutput, VaultError> {
        let mut cmd = Command::new(&self.binary_path);
        cmd.args(args)
            .stdin(if stdin_data.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in extra_env {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn()?;

        if let Some(data) = stdin_data {
            if let Some(mut stdin) = child.stdin.take() {
                // Write may fail if the binary exits early; surface the
                // child's stderr instead of the pipe error.
                let _ = stdin.write_all(data.as_bytes()).await;
                drop(stdin);
            }
        }

        // kill_on_drop reaps the child if the timeout fires while
        // wait_with_output still owns it.
        let result = tokio::time::timeout(self.timeout, child.wait_with_output()).await;

        match result {
            Ok(Ok(output)) => Ok(CommandOutput {
                stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
                success: output.status.success(),
            }),
            Ok(Err(e)) => Err(VaultError::Io(e)),
            Err(_) => Err(VaultError::Timeout),
        }
    }
}

#[async_trait]
impl VaultClient for VaultCli {
    async fn login_api_key(
        &self,
        client_id: &str,
        client_secret: &str,
    ) -> Result<(), VaultError> {
        // The binary reads both client credentials from the environment for
        // --apikey logins; neither may be omitted.
        let output = self
            .run(
                &["login", "--apikey"],
                None,
                &[
                    ("BW_CLIENTID", client_id),
                    ("BW_CLIENTSECRET", client_secret),
                ],
            )
            .await?;
        if !output.success {
            return Err(VaultError::LoginFailed(output.stderr));
        }
        Ok(())
    }

    async fn login_password(&self, email: &str, password: &str) -> Result<String, VaultError> {
        let output = self
            .run(&["login", email, "--raw"], Some(password), &[])
            .await?;
        if !output.success {
            return Err(VaultError::LoginFailed(output.stderr));
        }
        if output.stdout.is_empty() {
            return Err(VaultError::LoginFailed(
                "no unlock handle returned".to_string(),
            ));
        }
        Ok(output.stdout)
    }

    async fn unlock(&self, master_password: &str) -> Result<String, VaultError> {
        let output = self
            .run(&["unlock", "--raw"], Some(master_password), &[])
            .await?;
        if !output.success {
            return Err(VaultError::UnlockFailed(output.stderr));
        }
        if output.stdout.is_empty() {
            return Err(VaultError::UnlockFailed(
                "no unlock handle returned".to_string(),
            ));
        }
        Ok(output.stdout)
    }

    async fn verify(&self, handle: &str) -> Result<(), VaultError> {
        let output = self.run(&["sync", "--session", handle], None, &[]).await?;
        if !output.success {
            return Err(VaultError::CommandFailed(output.stderr));
        }
        Ok(())
    }

    async fn lock(&self, handle: &str) -> Result<(), VaultError> {
        let output = self.run(&["lock", "--session", handle], None, &[]).await?;
        if !output.success {
            return Err(VaultError::CommandFailed(output.stderr));
        }
        Ok(())
    }

    async fn get_item(&self, item_id: &str, handle: &str) -> Result<Value, VaultError> {
        let output = self
            .run(&["get", "item", item_id, "--session", handle], None, &[])
            .await?;
        if !output.success {
            return Err(VaultError::CommandFailed(output.stderr));
        }
        serde_json::from_str(&output.stdout).map_err(|e| VaultError::InvalidJson(e.to_string()))
    }

    async fn list_items(&self, query: &str, handle: &str) -> Result<Value, VaultError> {
        let output = self
            .run(
                &["list", "items", "--search", query, "--session", handle],
                None,
                &[],
            )
            .await?;
        if !output.success {
            return Err(VaultError::CommandFailed(output.stderr));
        }
        serde_json::from_str(&output.stdout).map_err(|e| VaultError::InvalidJson(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // /bin/sh stands in for the vault binary; each test drives it with -c.
    fn sh_vault() -> VaultCli {
        VaultCli::new("/bin/sh", 5)
    }

    #[tokio::test]
    async fn missing_binary_surfaces_io_error() {
        let cli = VaultCli::new("/nonexistent/vault-binary", 1);
        let result = cli.unlock("pw").await;
        assert!(matches!(result, Err(VaultError::Io(_))));
    }

    #[tokio::test]
    async fn failing_command_carries_stderr() {
        let cli = sh_vault();
        let output = cli
            .run(&["-c", "echo oops >&2; exit 1"], None, &[])
            .await
            .unwrap();
        assert!(!output.success);
        assert_eq!(output.stderr, "oops");
    }

    #[tokio::test]
    async fn stdin_is_delivered() {
        let cli = sh_vault();
        let output = cli.run(&["-c", "cat"], Some("secret-pw"), &[]).await.unwrap();
        assert!(output.success);
        assert_eq!(output.stdout, "secret-pw");
    }

    #[tokio::test]
    async fn timeout_kills_the_child() {
        let cli = VaultCli::new("/bin/sh", 1);
        let result = cli.run(&["-c", "sleep 30"], None, &[]).await;
        assert!(matches!(result, Err(VaultError::Timeout)));
    }

    #[tokio::test]
    async fn extra_env_is_visible() {
        let cli = sh_vault();
        let output = cli
            .run(&["-c", "printf %s \"$BW_CLIENTID\""], None, &[("BW_CLIENTID", "cid-1")])
            .await
            .unwrap();
        assert_eq!(output.stdout, "cid-1");
    }
}
