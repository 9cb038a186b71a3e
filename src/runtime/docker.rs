use std::path::PathBuf;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, RemoveContainerOptions,
    StartContainerOptions,
};
use bollard::errors::Error;
use bollard::image::CreateImageOptions;
use bollard::volume::CreateVolumeOptions;
use futures::TryStreamExt;
use tracing::debug;

use super::ContainerRuntime;

/// Talks to the local docker daemon through bollard.
pub struct DockerRuntime {
    docker: bollard::Docker,
}

impl DockerRuntime {
    pub fn connect() -> anyhow::Result<Self> {
        let docker = bollard::Docker::connect_with_local_defaults()?;
        Ok(Self { docker })
    }
}

/// The daemon answers "no such thing" with a plain 404.
fn is_missing(err: &Error) -> bool {
    matches!(
        err,
        Error::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn has_image(&self, reference: &str) -> anyhow::Result<bool> {
        match self.docker.inspect_image(reference).await {
            Ok(_) => Ok(true),
            Err(e) if is_missing(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn pull_image(&self, reference: &str) -> anyhow::Result<()> {
        let options = CreateImageOptions {
            from_image: reference.to_string(),
            ..Default::default()
        };

        // drain the progress stream, a pull error shows up as a stream item
        let progress = self
            .docker
            .create_image(Some(options), None, None)
            .try_collect::<Vec<_>>()
            .await?;

        for info in progress {
            if let Some(status) = info.status {
                debug!("pull: {}", status);
            }
        }

        Ok(())
    }

    async fn volume_mountpoint(&self, name: &str) -> anyhow::Result<Option<PathBuf>> {
        match self.docker.inspect_volume(name).await {
            Ok(volume) => Ok(Some(PathBuf::from(volume.mountpoint))),
            Err(e) if is_missing(&e) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn create_volume(&self, name: &str) -> anyhow::Result<PathBuf> {
        let options = CreateVolumeOptions {
            name: name.to_string(),
            driver: "local".to_string(),
            ..Default::default()
        };

        let volume = self.docker.create_volume(options).await?;
        Ok(PathBuf::from(volume.mountpoint))
    }

    async fn container_names(&self) -> anyhow::Result<Vec<String>> {
        let options = ListContainersOptions::<String> {
            all: true,
            ..Default::default()
        };

        let containers = self.docker.list_containers(Some(options)).await?;

        // the api reports names with a leading slash
        let names = containers
            .into_iter()
            .flat_map(|c| c.names.unwrap_or_default())
            .map(|n| n.trim_start_matches('/').to_string())
            .collect();

        Ok(names)
    }

    async fn remove_container(&self, name: &str) -> anyhow::Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };

        self.docker.remove_container(name, Some(options)).await?;
        Ok(())
    }

    async fn run_container(&self, name: &str, config: Config<String>) -> anyhow::Result<String> {
        let options = CreateContainerOptions {
            name: name.to_string(),
            platform: None,
        };

        let created = self.docker.create_container(Some(options), config).await?;

        self.docker
            .start_container(&created.id, None::<StartContainerOptions<String>>)
            .await?;

        Ok(created.id)
    }
}
