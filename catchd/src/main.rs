use std::io::{self, IsTerminal, Write};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use log::{info, LevelFilter};

use catchd::authz::TailscaleAuthorizer;
use catchd::daemon::{server_info, Daemon};
use catchd::installer::{InstallRequest, Installer};
use catchd::registry::Registry;
use catchd::settings::Settings;
use catchd::store::Store;
use catchd::CATCH_SERVICE;

fn main() {
    if let Err(err) = try_main() {
        let _ = writeln!(io::stderr(), "{err:?}");
        std::process::exit(1);
    }
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.common)?;
    match cli.command {
        Command::Serve(cmd) => run_async(cli.common, cmd, handle_serve),
        Command::Install(cmd) => run_async(cli.common, cmd, handle_install),
        Command::Version { json } => {
            let info = server_info();
            if json {
                println!("{}", serde_json::to_string(&info)?);
            } else {
                println!("{}", info.version);
            }
            Ok(())
        }
    }
}

#[tokio::main]
async fn run_async<F, Fut>(common: CommonOpts, cmd: ServeCommand, f: F) -> Result<()>
where
    F: FnOnce(CommonOpts, ServeCommand) -> Fut,
    Fut: std::future::Future<Output = Result<()>>,
{
    f(common, cmd).await
}

#[derive(Debug, Parser)]
#[command(author, version, about = "Catch - push-to-deploy service manager daemon.")]
struct Cli {
    #[command(flatten)]
    common: CommonOpts,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Args)]
struct CommonOpts {
    /// Override the config file path
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,
    /// Reduce output to only errors
    #[arg(short, long, action = clap::ArgAction::SetTrue, global = true)]
    quiet: bool,
    /// Increase logging verbosity (stackable)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Enable debug logging (equivalent to -vv)
    #[arg(long, global = true)]
    debug: bool,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the daemon
    Serve(ServeCommand),
    /// Register this binary as the managed `catch` service
    Install(ServeCommand),
    /// Print the daemon version
    Version {
        #[arg(long)]
        json: bool,
    },
}

#[derive(Debug, Clone, Args)]
struct ServeCommand {
    /// Root of all daemon state
    #[arg(long, value_name = "PATH")]
    data_dir: Option<PathBuf>,
    /// Hostname on the mesh
    #[arg(long)]
    hostname: Option<String>,
    /// SSH listen port
    #[arg(long)]
    ssh_port: Option<u16>,
    /// HTTP listen port
    #[arg(long)]
    http_port: Option<u16>,
    /// Loopback bind address for the embedded registry
    #[arg(long, value_name = "ADDR")]
    registry_internal_addr: Option<String>,
    /// Directory of web UI assets
    #[arg(long, value_name = "PATH")]
    assets_dir: Option<PathBuf>,
}

impl ServeCommand {
    fn apply(&self, mut settings: Settings) -> Settings {
        if let Some(v) = &self.data_dir {
            settings.data_dir = v.clone();
        }
        if let Some(v) = &self.hostname {
            settings.hostname = v.clone();
        }
        if let Some(v) = self.ssh_port {
            settings.ssh_port = v;
        }
        if let Some(v) = self.http_port {
            settings.http_port = v;
        }
        if let Some(v) = &self.registry_internal_addr {
            settings.registry_internal_addr = v.clone();
        }
        if let Some(v) = &self.assets_dir {
            settings.assets_dir = Some(v.clone());
        }
        settings
    }
}

fn init_logging(common: &CommonOpts) -> Result<()> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let level = if common.quiet {
        LevelFilter::Error
    } else if common.verbose >= 2 {
        LevelFilter::Trace
    } else if common.debug || common.verbose == 1 {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    let filter_str = match level {
        LevelFilter::Error => "error",
        LevelFilter::Trace => "trace",
        LevelFilter::Debug => "debug",
        _ => "info",
    };
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("catchd={filter_str},tower_http={filter_str}")));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(io::stderr().is_terminal())
                .with_writer(io::stderr),
        )
        .try_init()
        .ok();

    // Bridge for modules using the log facade.
    let mut builder = env_logger::Builder::from_env(env_logger::Env::default());
    builder.filter_level(level);
    builder.try_init().ok();
    Ok(())
}

fn open_daemon(common: &CommonOpts, cmd: &ServeCommand) -> Result<Arc<Daemon>> {
    let settings = cmd.apply(Settings::load(common.config.as_deref())?);
    let paths = settings.paths();
    for dir in [
        paths.root().to_path_buf(),
        paths.services_root(),
        paths.mounts_root(),
        paths.registry_root(),
    ] {
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("creating {}", dir.display()))?;
    }
    let store = Store::open(paths.db_file()).context("opening state store")?;
    Ok(Daemon::new(settings, store, Arc::new(TailscaleAuthorizer)))
}

async fn handle_serve(common: CommonOpts, cmd: ServeCommand) -> Result<()> {
    let daemon = open_daemon(&common, &cmd)?;
    info!("data dir: {}", daemon.paths.root().display());
    daemon.start_background();

    let registry = Registry::new(daemon.clone())?;

    // The loopback registry gets whatever port the OS hands out; runners
    // learn it through the store snapshot.
    let internal_listener =
        tokio::net::TcpListener::bind(&daemon.settings.registry_internal_addr)
            .await
            .context("binding internal registry")?;
    let internal_addr = internal_listener.local_addr()?;
    daemon.store.mutate(|data| {
        data.registry_addr = internal_addr.to_string();
        Ok(())
    })?;
    info!("internal registry on {internal_addr}");
    {
        let registry = registry.clone();
        let cancel = daemon.cancel.clone();
        daemon.tracker.spawn(async move {
            let app = registry
                .router()
                .into_make_service_with_connect_info::<SocketAddr>();
            if let Err(err) = axum::serve(internal_listener, app)
                .with_graceful_shutdown(cancel.cancelled_owned())
                .await
            {
                log::error!("internal registry server: {err}");
            }
        });
    }

    let web_addr: SocketAddr = ([0, 0, 0, 0], daemon.settings.http_port).into();
    let web_listener = tokio::net::TcpListener::bind(web_addr)
        .await
        .with_context(|| format!("binding web listener on {web_addr}"))?;
    info!("web surface on {web_addr}");
    {
        let app = catchd::api::router(daemon.clone(), registry)
            .into_make_service_with_connect_info::<SocketAddr>();
        let cancel = daemon.cancel.clone();
        daemon.tracker.spawn(async move {
            if let Err(err) = axum::serve(web_listener, app)
                .with_graceful_shutdown(cancel.cancelled_owned())
                .await
            {
                log::error!("web server: {err}");
            }
        });
    }

    let ssh_addr: SocketAddr = ([0, 0, 0, 0], daemon.settings.ssh_port).into();
    {
        let daemon = daemon.clone();
        daemon.clone().tracker.spawn(async move {
            if let Err(err) = catchd::ssh::serve(daemon, ssh_addr).await {
                log::error!("ssh server: {err:#}");
            }
        });
    }

    tokio::signal::ctrl_c().await.context("waiting for signal")?;
    daemon.shutdown().await;
    Ok(())
}

/// Stream this executable through the installer so the daemon manages
/// itself like any other service.
async fn handle_install(common: CommonOpts, cmd: ServeCommand) -> Result<()> {
    let daemon = open_daemon(&common, &cmd)?;
    let exe = std::env::current_exe().context("resolving current executable")?;
    let mut reader = tokio::fs::File::open(&exe)
        .await
        .with_context(|| format!("opening {}", exe.display()))?;

    let mut args = vec![
        "serve".to_string(),
        format!("--data-dir={}", daemon.paths.root().display()),
    ];
    if let Some(hostname) = &cmd.hostname {
        args.push(format!("--hostname={hostname}"));
    }
    let req = InstallRequest {
        args: Some(args),
        ..InstallRequest::new(CATCH_SERVICE)
    };
    let installer = Installer::new(daemon.clone(), catchd::runner::quiet_commands());
    installer.install_stream(&req, &mut reader, None).await?;
    println!("installed {CATCH_SERVICE} service");
    Ok(())
}
