pub mod docker;

use std::path::PathBuf;

use async_trait::async_trait;
use bollard::container::Config;

/// The slice of the container runtime the launcher actually needs.
/// Everything goes through this so tests can swap in a recording fake.
#[async_trait]
pub trait ContainerRuntime {
    /// Whether `reference` resolves to a local image.
    async fn has_image(&self, reference: &str) -> anyhow::Result<bool>;

    /// Pull `reference` from its registry. A failed pull is fatal, no retries.
    async fn pull_image(&self, reference: &str) -> anyhow::Result<()>;

    /// Host mountpoint of the named volume, `None` if it doesn't exist.
    async fn volume_mountpoint(&self, name: &str) -> anyhow::Result<Option<PathBuf>>;

    /// Create the named volume and return its host mountpoint.
    async fn create_volume(&self, name: &str) -> anyhow::Result<PathBuf>;

    /// Names of all containers, running or not, without the leading slash.
    async fn container_names(&self) -> anyhow::Result<Vec<String>>;

    /// Force-remove a container, running state included.
    async fn remove_container(&self, name: &str) -> anyhow::Result<()>;

    /// Create and start a container in one go, returning its id.
    async fn run_container(&self, name: &str, config: Config<String>) -> anyhow::Result<String>;
}
