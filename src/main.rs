//! Keyserver Gateway - mutually-authenticated HTTPS front end for a cluster keyserver

use std::path::Path;
use std::process::ExitCode;

use clap::Parser;
use tokio::signal;
use tracing::{error, info, warn};

use keyserver_gateway::{
    Error,
    cli::{Cli, Command},
    config::Config,
    gateway,
    keyserver::ConfiguredKeyserverFactory,
    mtls::{CaParams, CertGenerator, LeafCertParams},
    setup_tracing,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    match cli.command {
        Some(Command::DevPki {
            out,
            hostnames,
            client_cn,
            days,
        }) => run_dev_pki(&out, &hostnames, &client_cn, days),
        Some(Command::Serve { listen }) => run_server(cli.config.as_deref(), listen).await,
        None => run_server(cli.config.as_deref(), None).await,
    }
}

/// Run the gateway until a signal or a fatal serving error
async fn run_server(config_path: Option<&Path>, listen: Option<String>) -> ExitCode {
    let mut config = match Config::load(config_path) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "Failed to load configuration");
            return ExitCode::FAILURE;
        }
    };
    if let Some(listen) = listen {
        config.server.listen = listen;
    }

    let listen = config.server.listen.clone();
    let mut handle = match gateway::start(&listen, ConfiguredKeyserverFactory::new(config)).await {
        Ok(h) => h,
        Err(e) => {
            error!(error = %e, "Gateway failed to start");
            return ExitCode::FAILURE;
        }
    };

    let terminal = tokio::select! {
        () = shutdown_signal() => {
            handle.shutdown();
            handle.terminated().await
        }
        err = handle.terminated() => err,
    };

    match terminal {
        Error::Shutdown => {
            info!("Gateway stopped");
            ExitCode::SUCCESS
        }
        e => {
            error!(error = %e, "Gateway stopped with error");
            ExitCode::FAILURE
        }
    }
}

/// Resolves on Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
}

/// Write a development CA, server and client certificate set
fn run_dev_pki(out: &Path, hostnames: &[String], client_cn: &str, days: u32) -> ExitCode {
    match write_dev_pki(out, hostnames, client_cn, days) {
        Ok(()) => {
            println!("Development PKI written to {}", out.display());
            println!();
            println!("authority:");
            println!("  client_ca: {}", out.join("ca.crt").display());
            println!("  server_cert: {}", out.join("server.crt").display());
            println!("  server_key: {}", out.join("server.key").display());
            println!();
            println!("Client credentials: client.crt / client.key");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Failed to write development PKI: {e}");
            ExitCode::FAILURE
        }
    }
}

fn write_dev_pki(
    out: &Path,
    hostnames: &[String],
    client_cn: &str,
    days: u32,
) -> keyserver_gateway::Result<()> {
    let ca = CertGenerator::init_ca(&CaParams {
        cn: "Keyserver Development CA",
        validity_days: days,
    })?;

    let server_cn = hostnames.first().map_or("localhost", String::as_str);
    let server = CertGenerator::issue_leaf(
        &LeafCertParams {
            cn: server_cn,
            ou: Some("keyserver"),
            san_dns: hostnames.to_vec(),
            san_uris: vec![],
            validity_days: days,
        },
        &ca.cert_pem,
        &ca.key_pem,
    )?;

    let client = CertGenerator::issue_leaf(
        &LeafCertParams {
            cn: client_cn,
            ou: Some("nodes"),
            san_dns: vec![],
            san_uris: vec![],
            validity_days: days,
        },
        &ca.cert_pem,
        &ca.key_pem,
    )?;

    CertGenerator::write_to_dir(&ca, out, "ca")?;
    CertGenerator::write_to_dir(&server, out, "server")?;
    CertGenerator::write_to_dir(&client, out, "client")?;
    info!(dir = %out.display(), "Development PKI written");
    Ok(())
}
