use std::{fs, os::unix::fs::PermissionsExt, path::Path};

use bollard::container::Config;
use bollard::service::{DeviceMapping, HostConfig};
use tracing::{debug, info};

use crate::runtime::ContainerRuntime;
use crate::x11::{self, GuiEnv};

pub const IMAGE_REGISTRY: &str = "ghcr.io";
pub const IMAGE_NAME: &str = "netlab-course/netlab";
pub const IMAGE_TAG: &str = "latest";

pub const VOLUME_NAME: &str = "netlab-data";
pub const CONTAINER_NAME: &str = "netlab";

/// Where the data volume lands inside the container.
const VOLUME_MOUNT: &str = "/netlab";
/// The shell drops you straight into the assignment tree.
const WORK_DIR: &str = "/netlab/assignments";
const SHELL: &str = "/bin/bash";

pub fn image_reference() -> String {
    format!("{}/{}:{}", IMAGE_REGISTRY, IMAGE_NAME, IMAGE_TAG)
}

#[derive(Clone, Copy, Default)]
pub struct LaunchFlags {
    pub privileged: bool,
    pub allow_gui: bool,
}

/// Drives the runtime through the fixed provisioning sequence and leaves
/// exactly one fresh container behind. Everything is idempotent except the
/// container itself, which is always replaced.
pub struct Session<'r, R: ContainerRuntime> {
    runtime: &'r R,
    // swappable so tests can fail it without an x server
    gui_prepare: fn() -> anyhow::Result<GuiEnv>,
}

impl<'r, R: ContainerRuntime> Session<'r, R> {
    pub fn new(runtime: &'r R) -> Self {
        Self {
            runtime,
            gui_prepare: x11::prepare,
        }
    }

    pub async fn launch(&self, flags: LaunchFlags) -> anyhow::Result<String> {
        self.ensure_image().await?;
        self.ensure_volume().await?;
        self.remove_stale().await?;

        // a gui failure aborts, we never silently fall back to tun mode
        let gui = match flags.allow_gui {
            true => Some((self.gui_prepare)()?),
            false => None,
        };

        let config = container_config(&image_reference(), flags.privileged, gui.as_ref());
        let id = self.runtime.run_container(CONTAINER_NAME, config).await?;

        info!("started container {}", id);
        info!("attach with: docker exec -it {} {}", CONTAINER_NAME, SHELL);

        Ok(id)
    }

    async fn ensure_image(&self) -> anyhow::Result<()> {
        let reference = image_reference();

        if self.runtime.has_image(&reference).await? {
            debug!("image {} already present", reference);
            return Ok(());
        }

        info!("pulling {}", reference);
        self.runtime.pull_image(&reference).await
    }

    /// Created once, reused forever. The host mountpoint is opened up so the
    /// unprivileged container user can write through the bind.
    async fn ensure_volume(&self) -> anyhow::Result<()> {
        if let Some(path) = self.runtime.volume_mountpoint(VOLUME_NAME).await? {
            debug!("volume {} already at {}", VOLUME_NAME, path.display());
            return Ok(());
        }

        info!("creating volume {}", VOLUME_NAME);
        let path = self.runtime.create_volume(VOLUME_NAME).await?;
        open_permissions(&path)?;

        Ok(())
    }

    /// Single-session design, any container wearing our name gets dropped.
    async fn remove_stale(&self) -> anyhow::Result<()> {
        let names = self.runtime.container_names().await?;

        if names.iter().any(|n| n == CONTAINER_NAME) {
            info!("removing stale container {}", CONTAINER_NAME);
            self.runtime.remove_container(CONTAINER_NAME).await?;
        }

        Ok(())
    }
}

/// chmod -R 777
fn open_permissions(path: &Path) -> anyhow::Result<()> {
    fs::set_permissions(path, fs::Permissions::from_mode(0o777))?;

    if path.is_dir() {
        for entry in fs::read_dir(path)? {
            open_permissions(&entry?.path())?;
        }
    }

    Ok(())
}

/// The whole run invocation as data: detached-interactive, fixed workdir,
/// volume bind, plus one of the two mutually exclusive environment setups.
pub fn container_config(image: &str, privileged: bool, gui: Option<&GuiEnv>) -> Config<String> {
    let mut binds = vec![format!("{}:{}", VOLUME_NAME, VOLUME_MOUNT)];
    let mut env = Vec::new();

    let mut host_config = HostConfig {
        privileged: privileged.then_some(true),
        ..Default::default()
    };

    match gui {
        Some(gui) => {
            // the x server sits on the host, so share its network namespace
            // and hand the cookie file over at the exact same path
            let auth = gui.auth_file.display();
            host_config.network_mode = Some("host".to_string());
            binds.push(format!("{}:{}", auth, auth));
            env.push(format!("DISPLAY={}", gui.display));
            env.push(format!("XAUTHORITY={}", auth));
        }
        None => {
            // tun interfaces for the kernel networking assignments
            host_config.cap_add = Some(vec!["NET_ADMIN".to_string()]);
            host_config.devices = Some(vec![DeviceMapping {
                path_on_host: Some("/dev/net/tun".to_string()),
                path_in_container: Some("/dev/net/tun".to_string()),
                cgroup_permissions: Some("rwm".to_string()),
            }]);
        }
    }

    host_config.binds = Some(binds);

    Config {
        image: Some(image.to_string()),
        tty: Some(true),
        open_stdin: Some(true),
        working_dir: Some(WORK_DIR.to_string()),
        entrypoint: Some(vec![SHELL.to_string()]),
        env: Some(env),
        host_config: Some(host_config),
        ..Default::default()
    }
}
