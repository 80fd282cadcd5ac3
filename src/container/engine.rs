use bollard::container::{RemoveContainerOptions, StatsOptions};
use bollard::image::CreateImageOptions;
use bollard::Docker;
use futures::{StreamExt, TryStreamExt};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::{CodeboxError, Result};
use crate::sandbox::UsageSample;

/// Engine-side container operations (image management, removal, stats).
/// Uses the Docker API when reachable and falls back to the CLI.
#[derive(Debug, Clone)]
pub struct ContainerEngine {
    docker: Option<Docker>,
    cli: String,
}

impl ContainerEngine {
    /// Connect to the local daemon using platform defaults.
    pub fn connect(cli: impl Into<String>) -> Self {
        let docker = Docker::connect_with_socket_defaults()
            .or_else(|_| Docker::connect_with_local_defaults())
            .map_err(|e| warn!("Docker API unavailable, using CLI only: {}", e))
            .ok();
        Self {
            docker,
            cli: cli.into(),
        }
    }

    /// CLI-only engine, used when no API socket is expected.
    pub fn cli_only(cli: impl Into<String>) -> Self {
        Self {
            docker: None,
            cli: cli.into(),
        }
    }

    pub fn cli(&self) -> &str {
        &self.cli
    }

    pub async fn is_available(&self) -> bool {
        match &self.docker {
            Some(docker) => docker.ping().await.is_ok(),
            None => Command::new(&self.cli)
                .arg("version")
                .output()
                .await
                .map(|o| o.status.success())
                .unwrap_or(false),
        }
    }

    /// Inspect `image` and pull it when missing.
    pub async fn ensure_image(&self, image: &str) -> Result<()> {
        if let Some(docker) = &self.docker {
            if docker.inspect_image(image).await.is_ok() {
                debug!("Image {} already present", image);
                return Ok(());
            }
            info!("📦 Pulling image {}", image);
            let options = CreateImageOptions {
                from_image: image,
                ..Default::default()
            };
            docker
                .create_image(Some(options), None, None)
                .try_collect::<Vec<_>>()
                .await
                .map_err(|e| CodeboxError::container(format!("pull {} failed: {}", image, e)))?;
            return Ok(());
        }

        let present = Command::new(&self.cli)
            .args(["inspect", "--type=image", image])
            .output()
            .await
            .map(|o| o.status.success())
            .unwrap_or(false);
        if present {
            return Ok(());
        }
        info!("📦 Pulling image {} via {}", image, self.cli);
        let status = Command::new(&self.cli)
            .args(["pull", image])
            .status()
            .await
            .map_err(|e| CodeboxError::container(format!("{} pull: {}", self.cli, e)))?;
        if !status.success() {
            return Err(CodeboxError::container(format!("{} pull {} failed", self.cli, image)));
        }
        Ok(())
    }

    /// Force-remove a container by name. Missing containers are ignored.
    pub async fn force_remove(&self, name: &str) {
        if let Some(docker) = &self.docker {
            let options = RemoveContainerOptions {
                force: true,
                ..Default::default()
            };
            match docker.remove_container(name, Some(options)).await {
                Ok(()) => debug!("Removed container {}", name),
                Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }) => {}
                Err(e) => warn!("Failed to remove container {}: {}", name, e),
            }
            return;
        }

        let result = Command::new(&self.cli)
            .args(["rm", "-f", name])
            .output()
            .await;
        if let Err(e) = result {
            warn!("{} rm -f {} failed: {}", self.cli, name, e);
        }
    }

    /// One-shot stats sample: cumulative CPU seconds and current memory.
    pub async fn stats(&self, name: &str) -> Option<UsageSample> {
        let docker = self.docker.as_ref()?;
        let options = StatsOptions {
            stream: false,
            one_shot: true,
        };
        match docker.stats(name, Some(options)).next().await {
            Some(Ok(stats)) => Some(UsageSample {
                cpu_seconds: stats.cpu_stats.cpu_usage.total_usage as f64 / 1e9,
                memory_bytes: stats
                    .memory_stats
                    .max_usage
                    .or(stats.memory_stats.usage)
                    .unwrap_or(0),
            }),
            Some(Err(e)) => {
                debug!("Stats for {} unavailable: {}", name, e);
                None
            }
            None => None,
        }
    }
}
