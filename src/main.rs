use anyhow::{Context, Result};
use clap::Parser;
use envd::cli::{Args, Commands, ConfigDiscovery, UpArgs};
use envd::config::EnvdConfig;
use envd::container::{DockerClient, LifecycleManager, free_port};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_tracing(args.debug);

    if let Err(e) = run(args).await {
        error!("{:#}", e);
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn init_tracing(debug: bool) {
    let filter = if debug {
        EnvFilter::new("envd=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("envd=info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(args: &Args) -> Result<EnvdConfig> {
    let config = match &args.config {
        Some(path) => {
            info!("Loading configuration override from: {:?}", path);
            EnvdConfig::from_toml_file(path)?
        }
        None => ConfigDiscovery::discover_config()?,
    };
    debug!(?config, "configuration loaded");
    Ok(config)
}

async fn manager(config: EnvdConfig) -> Result<LifecycleManager> {
    let client = DockerClient::new().await?;
    Ok(LifecycleManager::new(Arc::new(client), config))
}

async fn run(args: Args) -> Result<()> {
    if let Commands::ShowConfig { init } = &args.command {
        if *init {
            let path = ConfigDiscovery::create_default_user_config()?;
            println!("Wrote default configuration to {}", path.display());
        }
        ConfigDiscovery::show_discovery_info();
        return Ok(());
    }

    let config = load_config(&args)?;
    let manager = manager(config).await?;

    match args.command {
        Commands::Up(up) => run_up(&manager, &up).await,
        Commands::Buildkitd {
            name,
            image,
            mirror,
        } => {
            let image = image.unwrap_or_else(|| manager.config().buildkitd_image.clone());
            let name = manager
                .start_buildkitd(&image, &name, mirror.as_deref())
                .await?;
            println!("{}", name);
            Ok(())
        }
        Commands::Destroy { name } => {
            match manager.destroy(&name).await? {
                Some(name) => println!("Destroyed {}", name),
                None => println!("{} does not exist", name),
            }
            Ok(())
        }
        Commands::Pause { name } => {
            match manager.pause(&name).await? {
                Some(name) => println!("Paused {}", name),
                None => println!("{} is already paused", name),
            }
            Ok(())
        }
        Commands::Resume { name } => {
            match manager.resume(&name).await? {
                Some(name) => println!("Resumed {}", name),
                None => println!("{} is not paused", name),
            }
            Ok(())
        }
        Commands::Ls => {
            let containers = manager.list_containers().await?;
            println!("{:<24} {:<40} {:<10} STATUS", "NAME", "IMAGE", "STATE");
            for c in containers {
                let name = c
                    .names
                    .first()
                    .map(|n| n.trim_start_matches('/'))
                    .unwrap_or(c.id.as_str());
                println!("{:<24} {:<40} {:<10} {}", name, c.image, c.state, c.status);
            }
            Ok(())
        }
        Commands::Images => {
            let images = manager.list_images().await?;
            println!("{:<40} {:<20} SIZE", "TAG", "ID");
            for image in images {
                let tag = image
                    .repo_tags
                    .first()
                    .map(String::as_str)
                    .unwrap_or("<none>");
                let id = image.id.trim_start_matches("sha256:");
                println!("{:<40} {:<20} {}", tag, &id[..id.len().min(12)], image.size);
            }
            Ok(())
        }
        Commands::Info => {
            let info = manager.info().await?;
            println!("Name:            {}", info.name);
            println!("Server version:  {}", info.server_version);
            if let Some(runtime) = &info.default_runtime {
                println!("Default runtime: {}", runtime);
            }
            println!(
                "Runtimes:        {}",
                info.runtimes.keys().cloned().collect::<Vec<_>>().join(", ")
            );
            Ok(())
        }
        Commands::Gpu => {
            let enabled = manager.gpu_enabled().await?;
            println!("GPU enabled: {}", enabled);
            Ok(())
        }
        Commands::Exec { name, command } => {
            manager.exec(&name, &command).await?;
            Ok(())
        }
        Commands::Load { path, quiet } => {
            let file = tokio::fs::File::open(&path)
                .await
                .with_context(|| format!("failed to open {}", path.display()))?;
            manager.load_image(file, quiet).await?;
            Ok(())
        }
        Commands::ShowConfig { .. } => Ok(()),
    }
}

async fn run_up(manager: &LifecycleManager, up: &UpArgs) -> Result<()> {
    let ssh_port = match up.ssh_port {
        Some(port) => port,
        None => free_port().context("failed to allocate the ssh port")?,
    };
    let request = up.to_request(ssh_port)?;
    let timeout = up.timeout.map(Duration::from_secs);

    let env = manager.start_envd(&request, timeout).await?;
    println!("Environment {} is running", env.name);
    if let Some(address) = &env.address {
        println!("  address: {}", address);
    }
    if let Some(port) = env.ssh_port {
        println!("  ssh:     {}:{}", manager.config().host_ip, port);
    }
    if let Some(port) = env.jupyter_port {
        println!("  jupyter: http://{}:{}", manager.config().host_ip, port);
    }
    if let Some(port) = env.rstudio_port {
        println!("  rstudio: http://{}:{}", manager.config().host_ip, port);
    }
    Ok(())
}
