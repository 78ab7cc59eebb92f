/// Image build collaborator
///
/// Turns a BuildSpec into a usable image reference. Building repository
/// images from their setup scripts happens elsewhere; this side only checks
/// the local image cache (and optionally pulls) and memoizes by image key.

use crate::engine::is_not_found;
use crate::error::BuildError;
use async_trait::async_trait;
use bollard::errors::Error as DockerError;
use bollard::image::CreateImageOptions;
use bollard::Docker;
use futures_util::stream::StreamExt;
use patchbay_common::spec::BuildSpec;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::{debug, info, warn};

#[async_trait]
pub trait ImageBuilder: Send + Sync {
    /// Image reference for `spec`, built or fetched if necessary
    async fn build(&self, spec: &BuildSpec) -> Result<String, BuildError>;
}

pub struct DockerImageBuilder {
    docker: Docker,
    build_root: PathBuf,
    pull_missing: bool,
    ready: Mutex<HashSet<String>>,
}

impl DockerImageBuilder {
    pub fn new(docker: Docker, build_root: PathBuf, pull_missing: bool) -> Self {
        Self {
            docker,
            build_root,
            pull_missing,
            ready: Mutex::new(HashSet::new()),
        }
    }

    fn is_ready(&self, image_key: &str) -> bool {
        self.ready
            .lock()
            .map(|ready| ready.contains(image_key))
            .unwrap_or(false)
    }

    fn mark_ready(&self, image_key: &str) {
        if let Ok(mut ready) = self.ready.lock() {
            ready.insert(image_key.to_string());
        }
    }

    /// Keep the setup script next to the build logs so runs can link to it
    async fn record_build_inputs(&self, spec: &BuildSpec) {
        let dir = self.build_root.join(spec.build_dir_name());
        let result = async {
            tokio::fs::create_dir_all(&dir).await?;
            tokio::fs::write(dir.join("setup_repo.sh"), &spec.setup_script).await
        }
        .await;

        if let Err(e) = result {
            warn!(dir = %dir.display(), error = %e, "Failed to record build inputs");
        }
    }

    /// Image cache health check, pulling on a miss when allowed
    async fn ensure_image(&self, image: &str) -> Result<(), BuildError> {
        let inspected = self.docker.inspect_image(image).await.map(|_| ());
        if image_present(image, inspected)? {
            debug!("✓ Image cache hit: {}", image);
            return Ok(());
        }

        if !self.pull_missing {
            return Err(BuildError::new(
                image,
                "image not found locally; build it first or enable pull_missing_images",
            ));
        }

        warn!("⚠ Image cache miss: {} (pulling now)", image);

        let options = Some(CreateImageOptions {
            from_image: image,
            ..Default::default()
        });

        let mut stream = Box::pin(self.docker.create_image(options, None, None));

        while let Some(result) = stream.next().await {
            if let Err(e) = result {
                return Err(BuildError::new(image, format!("pull failed: {}", e)));
            }
        }

        info!("✓ Image pulled successfully: {}", image);
        Ok(())
    }
}

/// Only a 404 counts as a cache miss; any other inspect failure is a build error
fn image_present(image: &str, inspected: Result<(), DockerError>) -> Result<bool, BuildError> {
    match inspected {
        Ok(()) => Ok(true),
        Err(e) if is_not_found(&e) => Ok(false),
        Err(e) => Err(BuildError::new(image, format!("failed to inspect image: {}", e))),
    }
}

#[async_trait]
impl ImageBuilder for DockerImageBuilder {
    async fn build(&self, spec: &BuildSpec) -> Result<String, BuildError> {
        if self.is_ready(&spec.image_key) {
            debug!(image = %spec.image_key, "Image already prepared in this batch");
            return Ok(spec.image_key.clone());
        }

        self.record_build_inputs(spec).await;
        self.ensure_image(&spec.image_key).await?;
        self.mark_ready(&spec.image_key);

        Ok(spec.image_key.clone())
    }
}
