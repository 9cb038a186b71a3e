use std::process::exit;

use tracing::error;
use tracing_subscriber::EnvFilter;

use netlab::runtime::docker::DockerRuntime;
use netlab::session::{LaunchFlags, Session};

#[derive(argh::FromArgs)]
/// provision and launch the netlab course container
struct Arguments {
    #[argh(subcommand)]
    command: TopCommand,
}

#[derive(argh::FromArgs)]
#[argh(subcommand)]
enum TopCommand {
    Docker(DockerArgs),
}

#[derive(argh::FromArgs)]
#[argh(subcommand, name = "docker")]
/// manage the dockerized lab environment
struct DockerArgs {
    #[argh(subcommand)]
    command: DockerCommand,
}

#[derive(argh::FromArgs)]
#[argh(subcommand)]
enum DockerCommand {
    Interactive(InteractiveArgs),
}

#[derive(argh::FromArgs)]
#[argh(subcommand, name = "interactive")]
/// start a fresh interactive session container
struct InteractiveArgs {
    #[argh(switch)]
    /// run the container with full privileges (kvm access)
    privileged: bool,

    #[argh(switch)]
    /// forward the host x11 display into the container
    allow_gui: bool,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let Arguments {
        command: TopCommand::Docker(docker),
    } = argh::from_env();

    // volume permissions and the relaxed auth file need root
    if unsafe { libc::geteuid() } != 0 {
        error!("must be run as root");
        exit(1);
    }

    let DockerCommand::Interactive(args) = docker.command;
    let flags = LaunchFlags {
        privileged: args.privileged,
        allow_gui: args.allow_gui,
    };

    let result = tokio::runtime::Runtime::new()
        .expect("tokio runtime")
        .block_on(async {
            let docker = DockerRuntime::connect()?;
            Session::new(&docker).launch(flags).await
        });

    if let Err(e) = result {
        error!("{:#}", e);
        exit(1);
    }
}
