use anyhow::Context;
use clap::Parser;
use mailcove_lifecycle::Lifetime;
use std::path::PathBuf;
use std::sync::Arc;

mod address;
mod config;
mod diagnostic_logging;
mod http_server;
mod hub;
mod manager;
mod metrics_helper;
mod policy;
mod pop3_server;
mod smtp_server;
mod tls_helpers;

use crate::config::Config;
use crate::diagnostic_logging::{DiagnosticFormat, LoggingConfig};
use crate::hub::Hub;
use crate::manager::MessageManager;

/// Mailcove daemon: accepts mail for any recipient over SMTP and holds
/// it for inspection over POP3, a REST API and a live monitor socket.
///
/// All tunables come from INBUCKET_-prefixed environment variables.
#[derive(Clone, Debug, Parser)]
#[command(about, version)]
struct Opt {
    /// Directory where diagnostic log files will be placed.
    ///
    /// If omitted, diagnostics will be printed to stderr.
    #[arg(long)]
    diag_log_dir: Option<PathBuf>,

    /// How diagnostic logs render. full, compact and pretty are intended
    /// for human consumption.
    ///
    /// json outputs machine readable records.
    #[arg(long, default_value = "full")]
    diag_format: DiagnosticFormat,

    /// Print the effective configuration and exit.
    #[arg(long)]
    dump_config: bool,
}

fn main() -> anyhow::Result<()> {
    let opts = Opt::parse();

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap()
        .block_on(async move { run(opts).await })?;
    tracing::info!("application logic complete, returning from main");
    Ok(())
}

async fn run(opts: Opt) -> anyhow::Result<()> {
    LoggingConfig {
        log_dir: opts.diag_log_dir.clone(),
        diag_format: opts.diag_format,
        filter_env_var: "MAILCOVED_LOG",
        default_filter: "mailcoved=info,msgstore=info,mailcove_lifecycle=info",
    }
    .init()?;

    let config = Config::from_env().context("loading configuration")?;
    if opts.dump_config {
        println!("{config:#?}");
        return Ok(());
    }

    msgstore::register_builtin_stores();
    let store = msgstore::make_store(&config.storage.kind, &config.store_params())
        .with_context(|| format!("constructing {} storage", config.storage.kind))?;
    let hub = Arc::new(Hub::new(config.web.monitor_buffer));
    let manager = MessageManager::new(
        store.clone(),
        hub.clone(),
        config.address_policy(),
        config.storage.mailbox_msg_cap,
    );

    // Lifetime state must exist before the listeners start admitting
    // sessions.
    let lifetime = Lifetime::init();

    let tls = if config.smtp.tls_enabled {
        Some(tls_helpers::make_server_config(
            &config.smtp.domain,
            &config.smtp.tls_privkey,
            &config.smtp.tls_cert,
        )?)
    } else {
        None
    };

    smtp_server::start_smtp_listener(
        smtp_server::SmtpParams {
            listen: config.smtp.addr.clone(),
            hostname: config.smtp.domain.clone(),
            max_recipients: config.smtp.max_recipients,
            max_message_bytes: config.smtp.max_message_bytes,
            max_connections: config.smtp.max_connections,
            command_timeout: config.smtp.timeout,
            data_timeout: config.smtp.data_timeout,
            permissive_newlines: config.smtp.permissive_newlines,
            tls,
        },
        manager.clone(),
    )
    .await?;

    pop3_server::start_pop3_listener(
        pop3_server::Pop3Params {
            listen: config.pop3.addr.clone(),
            hostname: config.smtp.domain.clone(),
            max_connections: config.smtp.max_connections,
            command_timeout: config.pop3.timeout,
        },
        manager.clone(),
    )
    .await?;

    http_server::start_http_listener(
        http_server::HttpParams {
            listen: config.web.addr.clone(),
        },
        manager.clone(),
    )
    .await?;

    manager.start_retention_sweeper(config.storage.retention_sleep, config.storage.retention_period);

    lifetime.run_until_shutdown(config.smtp.shutdown_timeout).await;

    hub.close_all();
    if let Err(err) = store.shutdown().await {
        tracing::error!("error shutting down storage: {err:#}");
    }
    tracing::info!("shutdown complete");
    Ok(())
}
