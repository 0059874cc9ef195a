//! WinRM (WS-Management) client for driving remote Windows shells.
//!
//! Covers the surface a build orchestrator needs: open a cmd shell over
//! HTTPS (port 5986, basic auth, self-signed certs accepted), execute a
//! command with stdout/stderr streamed to the local standard streams,
//! and copy a single file via base64 chunks appended through the shell.
//! Kerberos/NTLM transports and stdin streaming are out of scope.

mod protocol;

use std::io::Write as _;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;

pub const WINRM_PORT: u16 = 5986;

/// Base64 payload per appended chunk; keeps `echo` lines under the
/// cmd.exe 8191-character command-line limit.
const COPY_CHUNK_CHARS: usize = 7_500;

/// Commands executed per shell before it is recycled; stays under the
/// default WinRS per-shell operation quota.
const MAX_OPS_PER_SHELL: usize = 10;

const OPERATION_TIMEOUT_SECS: u64 = 60;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("winrm request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("winrm {endpoint} returned {status}: {body}")]
    Api {
        endpoint: &'static str,
        status: reqwest::StatusCode,
        body: String,
    },

    #[error("winrm protocol error: {0}")]
    Protocol(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Wrap a PowerShell script for the cmd shell: UTF-16LE, base64,
/// `-encodedcommand`, matching what the Windows side expects.
pub fn powershell(script: &str) -> String {
    let utf16: Vec<u8> = script
        .encode_utf16()
        .flat_map(|u| u.to_le_bytes())
        .collect();
    format!("powershell.exe -encodedcommand {}", BASE64.encode(utf16))
}

/// Client for one remote WinRM endpoint.
#[derive(Clone)]
pub struct WinRmClient {
    endpoint: String,
    username: String,
    password: String,
    http: reqwest::Client,
}

impl WinRmClient {
    /// Connect to `https://{host}:5986/wsman` with basic auth.
    ///
    /// Certificate validation is disabled: builder VMs present
    /// self-signed certificates on their WinRM listener.
    pub fn new(
        host: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .build()?;

        Ok(Self {
            endpoint: format!("https://{}:{WINRM_PORT}/wsman", host.into()),
            username: username.into(),
            password: password.into(),
            http,
        })
    }

    /// POST a SOAP envelope. Returns the body; non-success statuses other
    /// than a WS-Man operation-timeout fault are errors.
    async fn post(&self, envelope: String, endpoint: &'static str) -> Result<String> {
        let resp = self
            .http
            .post(&self.endpoint)
            .basic_auth(&self.username, Some(&self.password))
            .header("Content-Type", "application/soap+xml;charset=UTF-8")
            .body(envelope)
            .send()
            .await?;

        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        if !status.is_success() && !protocol::is_timeout_fault(&body) {
            return Err(Error::Api { endpoint, status, body });
        }
        Ok(body)
    }

    // ── Shells ───────────────────────────────────────────────────────

    pub async fn open_shell(&self) -> Result<Shell<'_>> {
        let env = protocol::envelope(
            &self.endpoint,
            protocol::ACTION_CREATE,
            None,
            &protocol::create_shell_options(),
            &protocol::create_shell_body(),
            OPERATION_TIMEOUT_SECS,
        );
        let body = self.post(env, "create shell").await?;
        let id = protocol::parse_shell_id(&body)
            .ok_or_else(|| Error::Protocol("create response carried no shell id".into()))?;
        Ok(Shell { client: self, id })
    }

    /// Open a shell, run one command streaming to the local standard
    /// streams, close the shell. Returns the remote exit code.
    pub async fn exec(&self, command: &str) -> Result<i32> {
        let shell = self.open_shell().await?;
        let result = shell.execute(command).await;
        shell.close().await;
        result
    }

    // ── File copy ────────────────────────────────────────────────────

    /// Copy `data` to `remote_path`, creating parent directories.
    ///
    /// The bytes travel as base64 chunks appended to a temp file through
    /// the shell, then a PowerShell stage decodes them in place. Slow,
    /// but needs nothing beyond the management port.
    pub async fn copy_file(&self, data: &[u8], remote_path: &str) -> Result<()> {
        let staged = format!("C:\\Windows\\Temp\\winrm-copy-{}.b64", uuid::Uuid::new_v4());
        let encoded = BASE64.encode(data);
        let chunks: Vec<&str> = encoded
            .as_bytes()
            .chunks(COPY_CHUNK_CHARS)
            // chunks of a valid base64 string are ASCII
            .map(|c| std::str::from_utf8(c).unwrap())
            .collect();

        tracing::debug!(
            remote_path,
            bytes = data.len(),
            chunks = chunks.len(),
            "winrm: copying file in chunks"
        );

        for batch in chunks.chunks(MAX_OPS_PER_SHELL) {
            let shell = self.open_shell().await?;
            for chunk in batch {
                let result = shell
                    .execute_discard_output(&format!("echo {chunk} >> \"{staged}\""))
                    .await;
                match result {
                    Ok(0) => {}
                    Ok(code) => {
                        shell.close().await;
                        return Err(Error::Protocol(format!(
                            "chunk append failed with exit-code:{code}"
                        )));
                    }
                    Err(e) => {
                        shell.close().await;
                        return Err(e);
                    }
                }
            }
            shell.close().await;
        }

        let decode_script = format!(
            r#"$ErrorActionPreference = "Stop"
$ProgressPreference = 'SilentlyContinue'
$dest = "{remote_path}"
$dir = [System.IO.Path]::GetDirectoryName($dest)
if (!(Test-Path $dir)) {{ New-Item -ItemType Directory -Force -Path $dir | Out-Null }}
$bytes = [Convert]::FromBase64String((Get-Content -Raw "{staged}"))
[System.IO.File]::WriteAllBytes($dest, $bytes)
Remove-Item -Path "{staged}" -Force
"#
        );
        let code = self.exec(&powershell(&decode_script)).await?;
        if code != 0 {
            return Err(Error::Protocol(format!(
                "copy decode stage failed with exit-code:{code}"
            )));
        }
        Ok(())
    }
}

/// An open remote cmd shell.
pub struct Shell<'a> {
    client: &'a WinRmClient,
    id: String,
}

impl Shell<'_> {
    /// Execute `command`, streaming stdout/stderr to the local standard
    /// streams as chunks arrive. Returns the remote exit code.
    pub async fn execute(&self, command: &str) -> Result<i32> {
        self.run(command, true).await
    }

    /// Execute without echoing remote output locally (copy plumbing).
    async fn execute_discard_output(&self, command: &str) -> Result<i32> {
        self.run(command, false).await
    }

    async fn run(&self, command: &str, stream_output: bool) -> Result<i32> {
        let env = protocol::envelope(
            &self.client.endpoint,
            protocol::ACTION_COMMAND,
            Some(&self.id),
            &protocol::command_options(),
            &protocol::command_body(command),
            OPERATION_TIMEOUT_SECS,
        );
        let body = self.client.post(env, "execute command").await?;
        let command_id = protocol::parse_command_id(&body)
            .ok_or_else(|| Error::Protocol("command response carried no command id".into()))?;

        let exit_code = loop {
            let env = protocol::envelope(
                &self.client.endpoint,
                protocol::ACTION_RECEIVE,
                Some(&self.id),
                "",
                &protocol::receive_body(&command_id),
                OPERATION_TIMEOUT_SECS,
            );
            let body = self.client.post(env, "receive output").await?;
            if protocol::is_timeout_fault(&body) {
                continue;
            }
            let out = protocol::parse_receive(&body);
            if stream_output {
                if !out.stdout.is_empty() {
                    let mut stdout = std::io::stdout();
                    let _ = stdout.write_all(&out.stdout);
                    let _ = stdout.flush();
                }
                if !out.stderr.is_empty() {
                    let mut stderr = std::io::stderr();
                    let _ = stderr.write_all(&out.stderr);
                    let _ = stderr.flush();
                }
            }
            if out.done {
                break out.exit_code.unwrap_or(-1);
            }
        };

        // Release server-side command state; best-effort.
        let env = protocol::envelope(
            &self.client.endpoint,
            protocol::ACTION_SIGNAL,
            Some(&self.id),
            "",
            &protocol::signal_terminate_body(&command_id),
            OPERATION_TIMEOUT_SECS,
        );
        let _ = self.client.post(env, "signal terminate").await;

        Ok(exit_code)
    }

    /// Delete the remote shell. Best-effort: a shell the server already
    /// reaped is not worth surfacing.
    pub async fn close(self) {
        let env = protocol::envelope(
            &self.client.endpoint,
            protocol::ACTION_DELETE,
            Some(&self.id),
            "",
            "",
            OPERATION_TIMEOUT_SECS,
        );
        if let Err(e) = self.client.post(env, "delete shell").await {
            tracing::debug!(error = %e, "winrm: shell delete failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn powershell_wraps_utf16le_base64() {
        let cmd = powershell("Write-Host hi");
        let encoded = cmd.strip_prefix("powershell.exe -encodedcommand ").unwrap();
        let bytes = BASE64.decode(encoded).unwrap();
        // UTF-16LE: every other byte of an ASCII script is NUL
        assert_eq!(&bytes[0..4], &[b'W', 0, b'r', 0]);
        assert_eq!(bytes.len(), "Write-Host hi".len() * 2);
    }

    #[test]
    fn copy_chunks_stay_under_cmd_line_limit() {
        // echo + redirect + quoted temp path must fit in 8191 chars
        let overhead = "echo  >> \"C:\\Windows\\Temp\\winrm-copy-00000000-0000-0000-0000-000000000000.b64\"".len();
        assert!(COPY_CHUNK_CHARS + overhead < 8191);
    }
}
