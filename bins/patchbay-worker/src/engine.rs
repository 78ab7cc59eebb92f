/// Container Runtime - Docker access for the evaluation pipeline
///
/// **Core Responsibility:**
/// Create, exec into, copy files in and out of, and destroy named
/// long-lived evaluation containers.
///
/// **Critical Architectural Boundary:**
/// - Runtime knows HOW to talk to Docker (bollard, tar archives, exec streams)
/// - Runtime does NOT know about patches, eval scripts or outcomes
/// - Deadlines are enforced on the output stream only; terminating the
///   in-container process is the bounded executor's job
///
/// The `ContainerRuntime` trait is the seam the pipeline is tested against.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, DownloadFromContainerOptions, LogOutput,
    RemoveContainerOptions, StartContainerOptions, StopContainerOptions, UploadToContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::Docker;
use futures_util::stream::{Stream, StreamExt};
use patchbay_common::types::ExecutionResult;
use std::io::Read;
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Keeps an evaluation container alive between execs
const KEEP_ALIVE_CMD: [&str; 3] = ["tail", "-f", "/dev/null"];

/// One command to run inside a container
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecRequest {
    pub cmd: Vec<String>,
    pub working_dir: Option<String>,
    pub user: Option<String>,
    /// Stop reading output after this long and report `timed_out`
    pub deadline: Option<Duration>,
}

impl ExecRequest {
    pub fn new<I, S>(cmd: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            cmd: cmd.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create and start a container, returning its id
    async fn start_container(&self, name: &str, image: &str, workdir: &str) -> Result<String>;

    async fn exec(&self, container_id: &str, request: &ExecRequest) -> Result<ExecutionResult>;

    async fn copy_in(&self, container_id: &str, host_path: &Path, container_path: &str) -> Result<()>;

    /// Returns `false` when `container_path` does not exist
    async fn copy_out(&self, container_id: &str, container_path: &str, host_path: &Path) -> Result<bool>;

    async fn delete_file(&self, container_id: &str, container_path: &str) -> Result<()>;

    async fn stop_and_remove(&self, container_id: &str) -> Result<()>;
}

/// bollard-backed runtime used in production
#[derive(Clone)]
pub struct DockerEngine {
    docker: Docker,
    stop_timeout_secs: i64,
}

impl DockerEngine {
    pub fn connect(stop_timeout_secs: i64) -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .context("Failed to connect to Docker daemon")?;

        Ok(Self::with_client(docker, stop_timeout_secs))
    }

    pub fn with_client(docker: Docker, stop_timeout_secs: i64) -> Self {
        DockerEngine {
            docker,
            stop_timeout_secs,
        }
    }

    pub fn client(&self) -> &Docker {
        &self.docker
    }

    /// Force-remove a container by name or id; a missing container is not an error
    async fn force_remove(&self, name: &str) -> Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };

        match self.docker.remove_container(name, Some(options)).await {
            Ok(()) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to remove container {}", name)),
        }
    }
}

#[async_trait]
impl ContainerRuntime for DockerEngine {
    async fn start_container(&self, name: &str, image: &str, workdir: &str) -> Result<String> {
        // A container left behind by a crashed run would hold the name
        self.force_remove(name)
            .await
            .context("Failed to clear stale container")?;

        let config = Config {
            image: Some(image.to_string()),
            cmd: Some(KEEP_ALIVE_CMD.iter().map(|s| s.to_string()).collect()),
            working_dir: Some(workdir.to_string()),
            tty: Some(false),
            ..Default::default()
        };

        let create_options = CreateContainerOptions {
            name,
            platform: None,
        };

        let container = self
            .docker
            .create_container(Some(create_options), config)
            .await
            .with_context(|| format!("Failed to create container {} from {}", name, image))?;

        if let Err(e) = self
            .docker
            .start_container(&container.id, None::<StartContainerOptions<String>>)
            .await
        {
            if let Err(cleanup) = self.force_remove(&container.id).await {
                warn!(container = %name, error = %cleanup, "Failed to remove container that did not start");
            }
            return Err(e).with_context(|| format!("Failed to start container {}", name));
        }

        info!(container = %name, id = %container.id, image = %image, "Container started");
        Ok(container.id)
    }

    async fn exec(&self, container_id: &str, request: &ExecRequest) -> Result<ExecutionResult> {
        if request.cmd.is_empty() {
            bail!("Refusing to exec an empty command");
        }

        let exec_config = CreateExecOptions {
            cmd: Some(request.cmd.clone()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            working_dir: request.working_dir.clone(),
            user: request.user.clone(),
            ..Default::default()
        };

        let exec = self
            .docker
            .create_exec(container_id, exec_config)
            .await
            .with_context(|| format!("Failed to create exec `{}`", request.cmd.join(" ")))?;

        let start_time = Instant::now();

        let started = self
            .docker
            .start_exec(&exec.id, None)
            .await
            .context("Failed to start exec")?;

        let StartExecResults::Attached { output: stream, .. } = started else {
            bail!("Exec started detached; no output to collect");
        };
        let (output, timed_out) = drain_output(stream, request.deadline).await;

        let elapsed_ms = start_time.elapsed().as_millis() as u64;

        let exit_code = if timed_out {
            None
        } else {
            let inspect = self
                .docker
                .inspect_exec(&exec.id)
                .await
                .context("Failed to inspect exec")?;
            inspect.exit_code
        };

        debug!(
            cmd = %request.cmd.join(" "),
            exit_code = ?exit_code,
            elapsed_ms = elapsed_ms,
            timed_out = timed_out,
            "Exec finished"
        );

        Ok(ExecutionResult {
            exit_code,
            output,
            elapsed_ms,
            timed_out,
        })
    }

    async fn copy_in(&self, container_id: &str, host_path: &Path, container_path: &str) -> Result<()> {
        let bytes = tokio::fs::read(host_path)
            .await
            .with_context(|| format!("Failed to read {}", host_path.display()))?;

        let (parent, file_name) = split_container_path(container_path)?;
        let archive = build_single_file_tar(file_name, &bytes)?;

        let options = UploadToContainerOptions {
            path: parent.to_string(),
            ..Default::default()
        };

        self.docker
            .upload_to_container(container_id, Some(options), archive.into())
            .await
            .with_context(|| format!("Failed to copy {} into container at {}", host_path.display(), container_path))?;

        debug!(host = %host_path.display(), container_path = container_path, bytes = bytes.len(), "Copied file into container");
        Ok(())
    }

    async fn copy_out(&self, container_id: &str, container_path: &str, host_path: &Path) -> Result<bool> {
        let options = DownloadFromContainerOptions {
            path: container_path.to_string(),
        };

        let mut stream = Box::pin(self.docker.download_from_container(container_id, Some(options)));
        let mut archive = Vec::new();

        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(bytes) => archive.extend_from_slice(&bytes),
                Err(e) if is_not_found(&e) => return Ok(false),
                Err(e) => {
                    return Err(e).with_context(|| format!("Failed to copy {} out of container", container_path))
                }
            }
        }

        let contents = extract_single_file_tar(&archive)
            .with_context(|| format!("Failed to unpack archive for {}", container_path))?;

        if let Some(parent) = host_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(host_path, &contents)
            .await
            .with_context(|| format!("Failed to write {}", host_path.display()))?;

        debug!(container_path = container_path, host = %host_path.display(), bytes = contents.len(), "Copied file out of container");
        Ok(true)
    }

    async fn delete_file(&self, container_id: &str, container_path: &str) -> Result<()> {
        let request = ExecRequest::new(["rm", "-f", container_path]).user("root");
        let result = self.exec(container_id, &request).await?;

        if result.exit_code != Some(0) {
            bail!(
                "Failed to delete {} in container (exit {:?}): {}",
                container_path,
                result.exit_code,
                result.output.trim()
            );
        }
        Ok(())
    }

    async fn stop_and_remove(&self, container_id: &str) -> Result<()> {
        let stop_options = StopContainerOptions {
            t: self.stop_timeout_secs,
        };

        // Removal is forced, so a failed stop only costs the grace period
        if let Err(e) = self.docker.stop_container(container_id, Some(stop_options)).await {
            if !is_not_found(&e) {
                warn!(container = %container_id, error = %e, "Failed to stop container, forcing removal");
            }
        }

        self.force_remove(container_id).await
    }
}

/// Read exec output until the stream ends or `deadline` passes.
///
/// Bytes are decoded once at the end so a character split across frames
/// survives intact. Returns the output and whether the deadline fired.
async fn drain_output<S>(mut stream: S, deadline: Option<Duration>) -> (String, bool)
where
    S: Stream<Item = Result<LogOutput, DockerError>> + Unpin,
{
    let mut bytes = Vec::new();
    let mut stream_error = None;
    let mut timed_out = false;

    let deadline = async {
        match deadline {
            Some(limit) => tokio::time::sleep(limit).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            chunk = stream.next() => match chunk {
                Some(Ok(LogOutput::StdOut { message }))
                | Some(Ok(LogOutput::StdErr { message }))
                | Some(Ok(LogOutput::Console { message })) => bytes.extend_from_slice(&message),
                Some(Ok(LogOutput::StdIn { .. })) => {}
                Some(Err(e)) => {
                    warn!(error = %e, "Error reading exec output");
                    stream_error = Some(e);
                    break;
                }
                None => break,
            },
            _ = &mut deadline => {
                timed_out = true;
                break;
            }
        }
    }

    let mut output = String::from_utf8_lossy(&bytes).into_owned();
    if let Some(e) = stream_error {
        output.push_str(&format!("\n[Exec stream error: {}]", e));
    }
    (output, timed_out)
}

pub(crate) fn is_not_found(error: &DockerError) -> bool {
    matches!(
        error,
        DockerError::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

/// `/testbed/report.json` -> (`/testbed`, `report.json`)
fn split_container_path(container_path: &str) -> Result<(&str, &str)> {
    let (parent, file_name) = container_path
        .rsplit_once('/')
        .with_context(|| format!("Container path must be absolute: {}", container_path))?;

    if file_name.is_empty() {
        bail!("Container path must name a file: {}", container_path);
    }

    let parent = if parent.is_empty() { "/" } else { parent };
    Ok((parent, file_name))
}

fn build_single_file_tar(file_name: &str, bytes: &[u8]) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    {
        let mut builder = tar::Builder::new(&mut buf);
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_size(bytes.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(0);
        header.set_uid(0);
        header.set_gid(0);
        header.set_cksum();
        builder
            .append_data(&mut header, file_name, std::io::Cursor::new(bytes))
            .with_context(|| format!("append tar entry: {}", file_name))?;
        builder.finish().context("finish tar")?;
    }
    Ok(buf)
}

/// Contents of the first regular file in a tar archive
fn extract_single_file_tar(archive_bytes: &[u8]) -> Result<Vec<u8>> {
    let mut archive = tar::Archive::new(std::io::Cursor::new(archive_bytes));
    for entry in archive.entries().context("read tar entries")? {
        let mut entry = entry.context("read tar entry")?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let mut buf = Vec::new();
        entry.read_to_end(&mut buf).context("read tar entry bytes")?;
        return Ok(buf);
    }
    bail!("archive contains no regular file")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_drain_output_joins_split_characters() {
        let frames: Vec<Result<LogOutput, DockerError>> = vec![
            Ok(LogOutput::StdOut { message: b"caf\xC3".to_vec().into() }),
            Ok(LogOutput::StdErr { message: b"\xA9 ok".to_vec().into() }),
        ];

        let (output, timed_out) = drain_output(futures_util::stream::iter(frames), None).await;

        assert_eq!(output, "café ok");
        assert!(!timed_out);
    }

    #[tokio::test]
    async fn test_drain_output_stops_at_deadline() {
        let frames: Vec<Result<LogOutput, DockerError>> =
            vec![Ok(LogOutput::StdOut { message: b"collected 3 items\n".to_vec().into() })];
        let stream = futures_util::stream::iter(frames).chain(futures_util::stream::pending());

        let (output, timed_out) = drain_output(stream, Some(Duration::from_millis(20))).await;

        assert_eq!(output, "collected 3 items\n");
        assert!(timed_out);
    }

    #[tokio::test]
    async fn test_drain_output_appends_stream_error() {
        let frames: Vec<Result<LogOutput, DockerError>> = vec![
            Ok(LogOutput::StdOut { message: b"partial".to_vec().into() }),
            Err(DockerError::DockerResponseServerError {
                status_code: 500,
                message: "connection reset".to_string(),
            }),
        ];

        let (output, timed_out) = drain_output(futures_util::stream::iter(frames), None).await;

        assert!(output.starts_with("partial\n[Exec stream error: "));
        assert!(output.contains("connection reset"));
        assert!(!timed_out);
    }

    #[test]
    fn test_split_container_path() {
        assert_eq!(split_container_path("/testbed/report.json").unwrap(), ("/testbed", "report.json"));
        assert_eq!(split_container_path("/eval.sh").unwrap(), ("/", "eval.sh"));
        assert!(split_container_path("eval.sh").is_err());
        assert!(split_container_path("/tmp/").is_err());
    }

    #[test]
    fn test_single_file_tar() {
        let archive = build_single_file_tar("patch.diff", b"--- a/x\n+++ b/x\n").unwrap();
        let contents = extract_single_file_tar(&archive).unwrap();
        assert_eq!(contents, b"--- a/x\n+++ b/x\n");

        let empty = build_single_file_tar("patch.diff", b"").unwrap();
        assert!(extract_single_file_tar(&empty).unwrap().is_empty());
    }

    #[test]
    fn test_extract_rejects_empty_archive() {
        let mut buf = Vec::new();
        tar::Builder::new(&mut buf).finish().unwrap();
        assert!(extract_single_file_tar(&buf).is_err());
    }

    #[test]
    fn test_exec_request_builder() {
        let request = ExecRequest::new(["git", "diff"])
            .working_dir("/testbed")
            .user("root")
            .deadline(Duration::from_secs(5));

        assert_eq!(request.cmd, vec!["git", "diff"]);
        assert_eq!(request.working_dir.as_deref(), Some("/testbed"));
        assert_eq!(request.user.as_deref(), Some("root"));
        assert_eq!(request.deadline, Some(Duration::from_secs(5)));
    }

    #[tokio::test]
    #[ignore] // Requires Docker and a local `debian:bookworm-slim` image
    async fn test_docker_exec_copy_roundtrip() {
        let engine = DockerEngine::connect(1).expect("Failed to connect to Docker");
        let id = engine
            .start_container("patchbay.test.engine", "debian:bookworm-slim", "/tmp")
            .await
            .expect("Failed to start container");

        let dir = tempfile::tempdir().unwrap();
        let host = dir.path().join("hello.txt");
        std::fs::write(&host, "hello").unwrap();
        engine.copy_in(&id, &host, "/tmp/hello.txt").await.unwrap();

        let out = engine.exec(&id, &ExecRequest::new(["cat", "/tmp/hello.txt"])).await.unwrap();
        assert_eq!(out.exit_code, Some(0));
        assert_eq!(out.output, "hello");

        let back = dir.path().join("back.txt");
        assert!(engine.copy_out(&id, "/tmp/hello.txt", &back).await.unwrap());
        engine.delete_file(&id, "/tmp/hello.txt").await.unwrap();
        assert!(!engine.copy_out(&id, "/tmp/hello.txt", &back).await.unwrap());

        let slow = ExecRequest::new(["sleep", "30"]).deadline(Duration::from_millis(500));
        let out = engine.exec(&id, &slow).await.unwrap();
        assert!(out.timed_out);
        assert_eq!(out.exit_code, None);

        engine.stop_and_remove(&id).await.unwrap();
    }
}
