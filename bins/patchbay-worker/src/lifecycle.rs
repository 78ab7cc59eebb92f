/// Container Lifecycle Manager
///
/// `acquire` turns a BuildSpec into a running container wrapped in a
/// `ContainerLease`. The lease is the only way to reach the container, and
/// `release` consumes it, so teardown happens at most once per acquire.
/// A lease dropped without `release` (e.g. the pipeline future was
/// cancelled) schedules a forced removal from `Drop`.

use crate::builder::ImageBuilder;
use crate::engine::ContainerRuntime;
use crate::error::BuildError;
use crate::instance_log::InstanceLog;
use patchbay_common::spec::BuildSpec;
use std::sync::Arc;
use tracing::warn;

pub struct LifecycleManager {
    runtime: Arc<dyn ContainerRuntime>,
    builder: Arc<dyn ImageBuilder>,
    workdir: String,
}

impl LifecycleManager {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        builder: Arc<dyn ImageBuilder>,
        workdir: impl Into<String>,
    ) -> Self {
        Self {
            runtime,
            builder,
            workdir: workdir.into(),
        }
    }

    /// Build (or reuse) the image and start the evaluation container
    pub async fn acquire(&self, spec: &BuildSpec, log: &InstanceLog) -> Result<ContainerLease, BuildError> {
        let image = self.builder.build(spec).await?;

        let container_id = self
            .runtime
            .start_container(&spec.container_name, &image, &self.workdir)
            .await
            .map_err(|e| BuildError::new(&spec.image_key, format!("{:#}", e)))?;

        log.info(format!(
            "Container for {} started: {}",
            spec.repo_name, container_id
        ));

        Ok(ContainerLease {
            runtime: Arc::clone(&self.runtime),
            id: container_id,
            name: spec.container_name.clone(),
            released: false,
        })
    }
}

/// Exclusive handle on one live evaluation container
pub struct ContainerLease {
    runtime: Arc<dyn ContainerRuntime>,
    id: String,
    name: String,
    released: bool,
}

impl ContainerLease {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn runtime(&self) -> &dyn ContainerRuntime {
        self.runtime.as_ref()
    }

    /// Stop and remove the container. Failures are logged, never returned,
    /// so teardown cannot mask the instance's primary outcome.
    pub async fn release(mut self, log: &InstanceLog) {
        self.released = true;

        match self.runtime.stop_and_remove(&self.id).await {
            Ok(()) => log.info(format!("Container {} removed", self.name)),
            Err(e) => log.error(format!(
                "Failed to remove container {} ({}): {:#}",
                self.name, self.id, e
            )),
        }
    }
}

impl Drop for ContainerLease {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        // Cannot await in Drop; hand removal to the runtime if one is still running
        let runtime = Arc::clone(&self.runtime);
        let id = self.id.clone();
        let name = self.name.clone();

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = runtime.stop_and_remove(&id).await {
                        warn!(container = %name, error = %e, "⚠ Failed to cleanup abandoned container");
                    }
                });
            }
            Err(_) => {
                warn!(container = %name, id = %id, "⚠ Container lease dropped outside a runtime; container may leak");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::MockContainerRuntime;
    use async_trait::async_trait;
    use patchbay_common::spec::make_spec;
    use patchbay_common::types::{Instance, TestSpec};

    struct StaticBuilder(Result<String, BuildError>);

    #[async_trait]
    impl ImageBuilder for StaticBuilder {
        async fn build(&self, _spec: &BuildSpec) -> Result<String, BuildError> {
            self.0.clone()
        }
    }

    fn make_test_spec() -> BuildSpec {
        make_spec(&Instance {
            repo: "org/repo".to_string(),
            base_commit: "abc123".to_string(),
            patch: None,
            test: TestSpec {
                test_cmd: "pytest".to_string(),
                test_dir: String::new(),
            },
        })
        .unwrap()
    }

    fn make_log(dir: &tempfile::TempDir) -> InstanceLog {
        InstanceLog::create("repo", &dir.path().join("run_repo.log")).unwrap()
    }

    #[tokio::test]
    async fn test_acquire_and_release_once() {
        let dir = tempfile::tempdir().unwrap();
        let log = make_log(&dir);
        let spec = make_test_spec();

        let mut runtime = MockContainerRuntime::new();
        let expected_name = spec.container_name.clone();
        runtime
            .expect_start_container()
            .withf(move |name, image, workdir| {
                name == expected_name && image == "prebuilt:latest" && workdir == "/testbed"
            })
            .times(1)
            .returning(|_, _, _| Ok("cid-1".to_string()));
        runtime
            .expect_stop_and_remove()
            .withf(|id| id == "cid-1")
            .times(1)
            .returning(|_| Ok(()));

        let manager = LifecycleManager::new(
            Arc::new(runtime),
            Arc::new(StaticBuilder(Ok("prebuilt:latest".to_string()))),
            "/testbed",
        );

        let lease = manager.acquire(&spec, &log).await.unwrap();
        assert_eq!(lease.id(), "cid-1");
        assert_eq!(lease.name(), spec.container_name);

        lease.release(&log).await;
    }

    #[tokio::test]
    async fn test_build_failure_never_starts_container() {
        let dir = tempfile::tempdir().unwrap();
        let log = make_log(&dir);

        let mut runtime = MockContainerRuntime::new();
        runtime.expect_start_container().times(0);
        runtime.expect_stop_and_remove().times(0);

        let manager = LifecycleManager::new(
            Arc::new(runtime),
            Arc::new(StaticBuilder(Err(BuildError::new("img:v0", "missing")))),
            "/testbed",
        );

        let err = manager.acquire(&make_test_spec(), &log).await.err().unwrap();
        assert_eq!(err.image_key, "img:v0");
    }

    #[tokio::test]
    async fn test_start_failure_is_build_error() {
        let dir = tempfile::tempdir().unwrap();
        let log = make_log(&dir);
        let spec = make_test_spec();

        let mut runtime = MockContainerRuntime::new();
        runtime
            .expect_start_container()
            .returning(|_, _, _| Err(anyhow::anyhow!("port already allocated")));
        runtime.expect_stop_and_remove().times(0);

        let manager = LifecycleManager::new(
            Arc::new(runtime),
            Arc::new(StaticBuilder(Ok(spec.image_key.clone()))),
            "/testbed",
        );

        let err = manager.acquire(&spec, &log).await.err().unwrap();
        assert_eq!(err.image_key, spec.image_key);
        assert!(err.message.contains("port already allocated"));
    }

    #[tokio::test]
    async fn test_release_swallows_teardown_errors() {
        let dir = tempfile::tempdir().unwrap();
        let log = make_log(&dir);

        let mut runtime = MockContainerRuntime::new();
        runtime
            .expect_start_container()
            .returning(|_, _, _| Ok("cid-2".to_string()));
        runtime
            .expect_stop_and_remove()
            .times(1)
            .returning(|_| Err(anyhow::anyhow!("daemon unavailable")));

        let manager = LifecycleManager::new(
            Arc::new(runtime),
            Arc::new(StaticBuilder(Ok("img".to_string()))),
            "/testbed",
        );

        let lease = manager.acquire(&make_test_spec(), &log).await.unwrap();
        lease.release(&log).await;

        let contents = std::fs::read_to_string(log.path()).unwrap();
        assert!(contents.contains("Failed to remove container"));
        assert!(contents.contains("daemon unavailable"));
    }

    #[tokio::test]
    async fn test_dropped_lease_schedules_removal() {
        let dir = tempfile::tempdir().unwrap();
        let log = make_log(&dir);
        let (tx, rx) = tokio::sync::oneshot::channel::<String>();
        let tx = std::sync::Mutex::new(Some(tx));

        let mut runtime = MockContainerRuntime::new();
        runtime
            .expect_start_container()
            .returning(|_, _, _| Ok("cid-3".to_string()));
        runtime.expect_stop_and_remove().times(1).returning(move |id| {
            if let Some(tx) = tx.lock().unwrap().take() {
                let _ = tx.send(id.to_string());
            }
            Ok(())
        });

        let manager = LifecycleManager::new(
            Arc::new(runtime),
            Arc::new(StaticBuilder(Ok("img".to_string()))),
            "/testbed",
        );

        let lease = manager.acquire(&make_test_spec(), &log).await.unwrap();
        drop(lease);

        assert_eq!(rx.await.unwrap(), "cid-3");
    }
}
