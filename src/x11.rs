use std::{
    fs,
    io::Write,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    process::{Command, Stdio},
};

use anyhow::{bail, Context};
use tracing::{debug, info};

/// Overwritten on every gui launch, never cleaned up.
pub const AUTH_FILE: &str = "/tmp/.netlab-xauth";

/// Kernel version substring that means we're under wsl, where the host
/// display is only reachable through the default gateway.
const COMPAT_MARKER: &str = "microsoft";

const DISPLAY_SUFFIX: &str = ":0";

/// Everything the container needs to reach the host display.
pub struct GuiEnv {
    pub display: String,
    pub auth_file: PathBuf,
}

/// Resolve the display, build the relaxed auth file, open up the server.
/// Any failure before the auth file is merged aborts the whole launch.
pub fn prepare() -> anyhow::Result<GuiEnv> {
    let env_display = std::env::var("DISPLAY").ok().filter(|d| !d.is_empty());
    let version = fs::read_to_string("/proc/version").unwrap_or_default();
    let gateway = fs::read_to_string("/proc/net/route")
        .ok()
        .and_then(|t| default_gateway(&t));

    let resolved = resolve_display(env_display, &version, gateway.as_deref())?;
    info!("forwarding display {}", resolved);

    let auth_file = PathBuf::from(AUTH_FILE);
    write_auth_file(&resolved, &auth_file)?;
    allow_local_root();

    Ok(GuiEnv {
        display: resolved,
        auth_file,
    })
}

/// Under the compatibility layer the display lives on the host side of the
/// virtual network, so derive it from the default route. Everywhere else
/// trust `DISPLAY`.
fn resolve_display(
    env_display: Option<String>,
    kernel_version: &str,
    gateway: Option<&str>,
) -> anyhow::Result<String> {
    if kernel_version.to_lowercase().contains(COMPAT_MARKER) {
        if let Some(gw) = gateway {
            return Ok(format!("{}{}", gw, DISPLAY_SUFFIX));
        }
    }

    match env_display {
        Some(display) => Ok(display),
        None => bail!("no display address resolved, set DISPLAY or run under X"),
    }
}

/// Default gateway from a /proc/net/route table (little-endian hex fields).
fn default_gateway(route_table: &str) -> Option<String> {
    for line in route_table.lines().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 3 || fields[1] != "00000000" {
            continue;
        }

        let raw = u32::from_str_radix(fields[2], 16).ok()?;
        let octets = raw.to_le_bytes();
        return Some(format!(
            "{}.{}.{}.{}",
            octets[0], octets[1], octets[2], octets[3]
        ));
    }

    None
}

/// Replace the access-family bytes of an `xauth nlist` entry with the ffff
/// wildcard, so the cookie matches no matter where the client connects from.
fn wildcard_family(entry: &str) -> String {
    if entry.len() < 4 {
        return entry.to_string();
    }
    format!("ffff{}", &entry[4..])
}

/// Fresh world-readable auth file holding the current session's cookie with
/// its family relaxed. Container users hit the same path, hence the fixed
/// location that gets bind-mounted verbatim.
fn write_auth_file(display: &str, path: &Path) -> anyhow::Result<()> {
    // start from scratch, stale cookies from older sessions are useless
    fs::remove_file(path).ok();
    fs::File::create(path).with_context(|| format!("creating {}", path.display()))?;

    let nlist = Command::new("xauth")
        .args(["nlist", display])
        .output()
        .context("running xauth nlist")?;
    if !nlist.status.success() {
        bail!(
            "xauth nlist failed: {}",
            String::from_utf8_lossy(&nlist.stderr).trim()
        );
    }

    let relaxed: String = String::from_utf8_lossy(&nlist.stdout)
        .lines()
        .filter(|l| !l.is_empty())
        .map(|l| wildcard_family(l) + "\n")
        .collect();

    let mut merge = Command::new("xauth")
        .args(["-f", path.to_str().unwrap(), "nmerge", "-"])
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .context("spawning xauth nmerge")?;
    merge
        .stdin
        .as_mut()
        .context("xauth nmerge stdin")?
        .write_all(relaxed.as_bytes())?;
    let status = merge.wait()?;
    if !status.success() {
        bail!("xauth nmerge failed");
    }

    fs::set_permissions(path, fs::Permissions::from_mode(0o644))?;

    Ok(())
}

/// Let local root clients at the display. Fire and forget, this is only a
/// fallback for setups where the cookie alone doesn't cut it.
fn allow_local_root() {
    match Command::new("xhost").arg("+local:root").output() {
        Ok(out) if out.status.success() => {}
        Ok(out) => debug!(
            "xhost +local:root failed: {}",
            String::from_utf8_lossy(&out.stderr).trim()
        ),
        Err(e) => debug!("xhost not available: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::{default_gateway, resolve_display, wildcard_family};

    const WSL_VERSION: &str =
        "Linux version 5.15.90.1-microsoft-standard-WSL2 (oe-user@oe-host) #1 SMP";
    const NATIVE_VERSION: &str = "Linux version 6.1.0-13-amd64 (debian-kernel@lists.debian.org)";

    const ROUTE_TABLE: &str = "\
Iface	Destination	Gateway 	Flags	RefCnt	Use	Metric	Mask		MTU	Window	IRTT
eth0	00000000	0100A8C0	0003	0	0	0	00000000	0	0	0
eth0	00A8C000	00000000	0001	0	0	0	00FFFFFF	0	0	0";

    #[test]
    fn gateway_parsing() {
        assert_eq!(default_gateway(ROUTE_TABLE), Some("192.168.0.1".to_string()));

        // no default route
        let no_default = "Iface	Destination	Gateway\neth0	00A8C000	00000000	0001	0	0	0	00FFFFFF	0	0	0";
        assert_eq!(default_gateway(no_default), None);

        assert_eq!(default_gateway(""), None);
    }

    #[test]
    fn display_from_env() {
        let display = resolve_display(
            Some("localhost:0.0".to_string()),
            NATIVE_VERSION,
            Some("192.168.0.1"),
        )
        .unwrap();
        assert_eq!(display, "localhost:0.0");
    }

    #[test]
    fn display_derived_under_compat_layer() {
        let display = resolve_display(None, WSL_VERSION, Some("172.17.64.1")).unwrap();
        assert_eq!(display, "172.17.64.1:0");

        // gateway wins over an inherited DISPLAY on wsl
        let display = resolve_display(
            Some("localhost:0.0".to_string()),
            WSL_VERSION,
            Some("172.17.64.1"),
        )
        .unwrap();
        assert_eq!(display, "172.17.64.1:0");
    }

    #[test]
    fn display_unresolvable_is_fatal() {
        assert!(resolve_display(None, NATIVE_VERSION, Some("192.168.0.1")).is_err());
        assert!(resolve_display(None, WSL_VERSION, None).is_err());
    }

    #[test]
    fn family_wildcard() {
        assert_eq!(
            wildcard_family("0100 0004 c0a80001 0001 30 0012 4d49542d4d414749432d434f4f4b49452d31"),
            "ffff 0004 c0a80001 0001 30 0012 4d49542d4d414749432d434f4f4b49452d31"
        );
        assert_eq!(wildcard_family(""), "");
    }
}
