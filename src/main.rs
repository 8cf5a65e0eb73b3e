// file: src/main.rs
// version: 2.0.0
// guid: h8i9j0k1-l2m3-4567-8901-234567hijklm

//! Debian cloud images - main entry point

use clap::Parser;
use debian_cloud_images::{
    cli::{
        args::{Cli, Commands},
        commands::*,
    },
    logging::{logger, with_async_operation_span},
    Result,
};
use tokio::signal;
use tracing::{error, warn};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let logging = if cli.log_json {
        logger::init_json_logger()
    } else {
        logger::init_logger(cli.verbose, cli.quiet)
    };
    if let Err(e) = logging {
        eprintln!("{}", e);
        std::process::exit(e.exit_code());
    }

    tokio::select! {
        result = with_async_operation_span(cli.command.name(), || run(cli)) => {
            if let Err(e) = result {
                error!("{}", e);
                std::process::exit(e.exit_code());
            }
        }
        _ = signal::ctrl_c() => {
            warn!("Interrupted");
            std::process::exit(130);
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    if let Commands::ListBuilds { manifests, json } = &cli.command {
        return list_builds_command(manifests, *json).await;
    }

    let ctx = AppContext::load(cli.config.as_deref(), cli.image_config.as_deref())?;

    match cli.command {
        Commands::ListBuilds { .. } => Ok(()),
        Commands::Build {
            release,
            vendor,
            arch,
            build_type,
            version,
            build_id,
            config_space,
            output,
            compress,
        } => {
            let args = BuildArgs {
                release,
                vendor,
                arch: arch.into(),
                build_type,
                version,
                build_id,
                config_space,
                output,
                compress,
            };
            build_command(&ctx, args).await
        }
        Commands::Convert {
            input,
            output,
            format,
        } => convert_command(&ctx, &input, &output, format.into()).await,
        Commands::Assemble {
            store,
            output,
            arch,
            size_gb,
        } => assemble_command(&ctx, &store, &output, arch.into(), size_gb).await,
        Commands::UploadAzure { manifests, partner } => {
            upload_azure_command(&ctx, &manifests, partner).await
        }
        Commands::UploadEc2 { manifests } => upload_ec2_command(&ctx, &manifests).await,
        Commands::UploadGce { manifests } => upload_gce_command(&ctx, &manifests).await,
        Commands::Publish {
            manifests,
            root,
            provider,
        } => publish_command(&ctx, &manifests, root, provider).await,
    }
}
