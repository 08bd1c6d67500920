use clap::{Parser, Subcommand};
use cirrus::{
    MigrationOrchestrator, MigrationRequest, MigrationSettings, Result,
    cloudstack::{CloudStackClient, ControlPlane},
    config::CirrusConfig,
    hostname::HostName,
    log_error, log_info, log_warn, logger,
    migrate::{EnvIdentity, SourceDisposition, TcpProbe, WaitPolicy},
    session::{PromptCredentials, SshSessionFactory},
};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "cirrus")]
#[command(about = "Relocate a VM's persistent disk between compute nodes")]
#[command(version = "0.1.0")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to the configuration file (default: ~/.cirrus.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Migrate a VM's disk image to another compute node
    Migrate {
        /// FQDN of the VM to migrate
        vm: String,
        /// Name of the destination compute node
        destination: String,
        /// Skip rsync compression during the transfer
        #[arg(long)]
        nocompress: bool,
        /// Deploy the copy under a new FQDN (possibly another environment)
        #[arg(long)]
        hostname: Option<String>,
        /// Restart the source VM instead of destroying it
        #[arg(long)]
        nodestroy: bool,
        /// Print the deploy parameters before submitting them
        #[arg(long)]
        debug: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if cli.verbose {
        unsafe {
            std::env::set_var("RUST_LOG", "cirrus=debug");
        }
    }
    logger::init_logger();

    if let Err(e) = run(cli).await {
        log_error!("{}", e);
        std::process::exit(e.exit_code());
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config_path = cli.config.unwrap_or_else(CirrusConfig::default_path);
    let config = CirrusConfig::from_file(&config_path)?;

    match cli.command {
        Commands::Migrate {
            vm,
            destination,
            nocompress,
            hostname,
            nodestroy,
            debug,
        } => {
            let request = MigrationRequest {
                vm_fqdn: vm,
                destination_host: destination,
                new_hostname: hostname,
                compress: !nocompress,
                keep_source: nodestroy,
                debug,
            };

            let source_name = HostName::new(&request.vm_fqdn);
            let source_env = config.env_for(&source_name)?;
            let cloud: Arc<dyn ControlPlane> = Arc::new(CloudStackClient::new(source_env));

            // A new hostname may land in another environment, with its own
            // API endpoint and identity material.
            let (target_cloud, target_env) = match &request.new_hostname {
                Some(new_fqdn) => {
                    let target_name = HostName::new(new_fqdn);
                    let env = config.env_for(&target_name)?;
                    let client: Arc<dyn ControlPlane> = Arc::new(CloudStackClient::new(env));
                    (Some(client), Some(EnvIdentity::from(env)))
                }
                None => (None, None),
            };

            let credentials = Arc::new(PromptCredentials::new(config.ssh.key_path.clone()));
            let sessions = Arc::new(SshSessionFactory::new(
                config.ssh.user.clone(),
                credentials,
                Duration::from_secs(config.ssh.connect_timeout_secs),
            ));

            let settings = MigrationSettings {
                source_env: EnvIdentity::from(source_env),
                target_env,
                formats: config.formats.clone(),
                image_dir: config.image.directory.clone(),
                transfer_key: config.ssh.transfer_key.clone(),
                waits: WaitPolicy::from(&config.waits),
                post_boot: config.post_boot.clone(),
            };

            let orchestrator = MigrationOrchestrator::new(
                request,
                cloud,
                target_cloud,
                sessions,
                Arc::new(TcpProbe),
                settings,
            )?;

            // First Ctrl-C finishes the current stage and stops; state on
            // the hosts stays as of the last completed stage.
            let cancel = orchestrator.cancel_flag();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    log_warn!("interrupt received, stopping after the current stage");
                    cancel.store(true, Ordering::SeqCst);
                }
            });

            let outcome = orchestrator.run().await?;
            match outcome.source {
                SourceDisposition::Destroyed => log_info!("source VM destroyed"),
                SourceDisposition::Restarted => log_info!("source VM restarted"),
            }
            if let Some(address) = &outcome.address {
                log_info!("migrated VM is up and answering on {}", address);
            }
            log_info!(
                "migration {} completed in {}s",
                outcome.run_id,
                (outcome.completed_at - outcome.started_at).num_seconds()
            );
        }
    }

    Ok(())
}
