/// Bounded Executor - deadline-enforced commands inside a container
///
/// The command runs as the leader of its own process group (via `setsid`),
/// with the group id written to a pidfile. When the deadline passes the
/// whole group is sent SIGTERM, then SIGKILL after a grace period. The
/// caller always gets an ExecutionResult back: on timeout it carries the
/// output captured so far and `timed_out = true`.
///
/// Deciding what a timeout means for the instance is the pipeline's job.

use crate::engine::{ContainerRuntime, ExecRequest};
use anyhow::Result;
use patchbay_common::types::ExecutionResult;
use std::time::Duration;
use tracing::{debug, warn};

/// Upper bound for the termination exec itself, on top of the grace period
const TERMINATE_SLACK: Duration = Duration::from_secs(30);

pub struct BoundedExecutor<'a> {
    runtime: &'a dyn ContainerRuntime,
    kill_grace: Duration,
}

impl<'a> BoundedExecutor<'a> {
    pub fn new(runtime: &'a dyn ContainerRuntime, kill_grace: Duration) -> Self {
        Self { runtime, kill_grace }
    }

    /// Run `command` through bash in `workdir`, bounded by `timeout`
    #[tracing::instrument(skip(self, command), fields(timeout_secs = timeout.as_secs()))]
    pub async fn run(
        &self,
        container_id: &str,
        command: &str,
        workdir: &str,
        timeout: Duration,
    ) -> Result<ExecutionResult> {
        let pidfile = format!("/tmp/.patchbay-exec-{}.pid", uuid::Uuid::new_v4().simple());
        let request = ExecRequest::new(wrap_in_process_group(command, &pidfile))
            .working_dir(workdir)
            .deadline(timeout);

        let result = self.runtime.exec(container_id, &request).await?;

        if result.timed_out {
            warn!(
                elapsed_ms = result.elapsed_ms,
                timeout_secs = timeout.as_secs(),
                "Command exceeded deadline, terminating process group"
            );
            self.terminate(container_id, &pidfile).await;
        } else {
            debug!(exit_code = ?result.exit_code, elapsed_ms = result.elapsed_ms, "Command finished within deadline");
            self.remove_pidfile(container_id, &pidfile).await;
        }

        Ok(result)
    }

    /// SIGTERM the group, wait the grace period, SIGKILL whatever is left
    async fn terminate(&self, container_id: &str, pidfile: &str) {
        let script = terminate_script(pidfile, self.kill_grace);
        let request = ExecRequest::new(["/bin/bash", "-c", script.as_str()])
            .user("root")
            .deadline(self.kill_grace + TERMINATE_SLACK);

        match self.runtime.exec(container_id, &request).await {
            Ok(result) if result.timed_out => {
                warn!("Termination of timed-out process group did not finish");
            }
            Ok(result) => {
                debug!(exit_code = ?result.exit_code, "Timed-out process group terminated");
            }
            Err(e) => {
                warn!(error = %e, "Failed to terminate timed-out process group");
            }
        }
    }

    async fn remove_pidfile(&self, container_id: &str, pidfile: &str) {
        if let Err(e) = self.runtime.delete_file(container_id, pidfile).await {
            debug!(error = %e, pidfile = pidfile, "Failed to remove pidfile");
        }
    }
}

/// `setsid -w` forks when needed so `$$` below is always a fresh group leader;
/// `exec` keeps that pid for the user command.
fn wrap_in_process_group(command: &str, pidfile: &str) -> Vec<String> {
    vec![
        "setsid".to_string(),
        "-w".to_string(),
        "/bin/bash".to_string(),
        "-c".to_string(),
        format!("echo $$ > {}; exec /bin/bash -c \"$1\"", pidfile),
        "bounded-exec".to_string(),
        command.to_string(),
    ]
}

fn terminate_script(pidfile: &str, grace: Duration) -> String {
    format!(
        "pgid=$(cat {pidfile} 2>/dev/null); \
         if [ -n \"$pgid\" ]; then \
         kill -TERM -- -$pgid 2>/dev/null; \
         sleep {grace}; \
         kill -KILL -- -$pgid 2>/dev/null; \
         fi; \
         rm -f {pidfile}; true",
        pidfile = pidfile,
        grace = grace.as_secs(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::MockContainerRuntime;
    use mockall::Sequence;

    #[test]
    fn test_wrap_in_process_group() {
        let argv = wrap_in_process_group("/bin/bash /eval.sh", "/tmp/x.pid");

        assert_eq!(&argv[..4], ["setsid", "-w", "/bin/bash", "-c"]);
        assert_eq!(argv[4], "echo $$ > /tmp/x.pid; exec /bin/bash -c \"$1\"");
        assert_eq!(argv[5], "bounded-exec");
        assert_eq!(argv[6], "/bin/bash /eval.sh");
    }

    #[test]
    fn test_terminate_script_targets_group() {
        let script = terminate_script("/tmp/x.pid", Duration::from_secs(5));

        assert!(script.contains("kill -TERM -- -$pgid"));
        assert!(script.contains("sleep 5;"));
        assert!(script.contains("kill -KILL -- -$pgid"));
        assert!(script.contains("rm -f /tmp/x.pid"));
    }

    #[tokio::test]
    async fn test_completed_command_cleans_pidfile() {
        let mut runtime = MockContainerRuntime::new();
        runtime
            .expect_exec()
            .withf(|id, req| {
                id == "cid"
                    && req.cmd[0] == "setsid"
                    && req.cmd[6] == "/bin/bash /eval.sh"
                    && req.working_dir.as_deref() == Some("/testbed")
                    && req.deadline == Some(Duration::from_secs(60))
            })
            .times(1)
            .returning(|_, _| {
                Ok(ExecutionResult {
                    exit_code: Some(0),
                    output: "3 passed".to_string(),
                    elapsed_ms: 1_200,
                    timed_out: false,
                })
            });
        runtime
            .expect_delete_file()
            .withf(|_, path| path.starts_with("/tmp/.patchbay-exec-") && path.ends_with(".pid"))
            .times(1)
            .returning(|_, _| Ok(()));

        let executor = BoundedExecutor::new(&runtime, Duration::from_secs(1));
        let result = executor
            .run("cid", "/bin/bash /eval.sh", "/testbed", Duration::from_secs(60))
            .await
            .unwrap();

        assert!(!result.timed_out);
        assert_eq!(result.exit_code, Some(0));
        assert_eq!(result.output, "3 passed");
    }

    #[tokio::test]
    async fn test_timeout_terminates_group_and_keeps_partial_output() {
        let mut runtime = MockContainerRuntime::new();
        let mut seq = Sequence::new();
        runtime
            .expect_exec()
            .withf(|_, req| req.cmd[0] == "setsid")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| {
                Ok(ExecutionResult {
                    exit_code: None,
                    output: "collecting ... test_slow.py::test_sleep ".to_string(),
                    elapsed_ms: 2_000,
                    timed_out: true,
                })
            });
        runtime
            .expect_exec()
            .withf(|_, req| {
                req.cmd[0] == "/bin/bash"
                    && req.cmd[2].contains("kill -TERM")
                    && req.user.as_deref() == Some("root")
            })
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| {
                Ok(ExecutionResult {
                    exit_code: Some(0),
                    output: String::new(),
                    elapsed_ms: 1_000,
                    timed_out: false,
                })
            });
        runtime.expect_delete_file().times(0);

        let executor = BoundedExecutor::new(&runtime, Duration::from_secs(1));
        let result = executor
            .run("cid", "sleep 100", "/testbed", Duration::from_secs(2))
            .await
            .unwrap();

        assert!(result.timed_out);
        assert_eq!(result.exit_code, None);
        assert_eq!(result.output, "collecting ... test_slow.py::test_sleep ");
    }

    #[tokio::test]
    async fn test_termination_failure_does_not_raise() {
        let mut runtime = MockContainerRuntime::new();
        runtime
            .expect_exec()
            .withf(|_, req| req.cmd[0] == "setsid")
            .returning(|_, _| {
                Ok(ExecutionResult {
                    exit_code: None,
                    output: String::new(),
                    elapsed_ms: 10,
                    timed_out: true,
                })
            });
        runtime
            .expect_exec()
            .withf(|_, req| req.cmd[0] == "/bin/bash")
            .returning(|_, _| Err(anyhow::anyhow!("container is not running")));

        let executor = BoundedExecutor::new(&runtime, Duration::from_secs(1));
        let result = executor
            .run("cid", "sleep 100", "/testbed", Duration::from_millis(10))
            .await
            .unwrap();

        assert!(result.timed_out);
    }
}
