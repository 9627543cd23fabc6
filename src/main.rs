use anyhow::{Context, Result};
use clap::Parser;
use std::path::Path;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tproxy_mitm::cert::{write_root, CertificateAuthority};
use tproxy_mitm::cli::{Cli, Commands};
use tproxy_mitm::config::AppConfig;
use tproxy_mitm::server;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // RUST_LOG 优先于 --log-level
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cli.log_level))
        .context("Invalid log level")?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    match cli.command {
        Commands::Run { config } => {
            info!("tproxy-mitm v{}", env!("CARGO_PKG_VERSION"));
            info!("Loading configuration from: {:?}", config);
            let config = AppConfig::load(&config)?;
            server::run(config).await?;
        }
        Commands::Check { config } => check_config(&config)?,
        Commands::Ca {
            cert_out,
            key_out,
            common_name,
            organization,
        } => {
            write_root(&common_name, &organization, &cert_out, &key_out)?;
            println!("Generated root certificate: {:?}", cert_out);
            println!("Generated private key: {:?}", key_out);
        }
    }

    Ok(())
}

/// 检查配置文件并打印摘要
fn check_config(path: &Path) -> Result<()> {
    if !path.exists() {
        anyhow::bail!("Configuration file not found: {:?}", path);
    }
    println!("Checking configuration file: {:?}\n", path);

    let config = AppConfig::load(path)?;
    println!("✓ Listen address: {}", config.proxy.listen_addr);
    println!("✓ Transparent: {}", config.proxy.transparent);
    println!(
        "✓ Timeouts: dial {}s, connection {}s, detection {}ms",
        config.proxy.dial_timeout_secs,
        config.proxy.connection_timeout_secs,
        config.detect.timeout_ms
    );
    if let Some(addr) = config.proxy.upstream_override {
        println!("⚠ Upstream override: {}", addr);
    }

    match CertificateAuthority::from_files(&config.ca.cert_path, &config.ca.key_path) {
        Ok(_) => println!("✓ Root CA loaded: {:?}", config.ca.cert_path),
        Err(e) => println!("⚠ Warning: Root CA not usable: {}", e),
    }

    if config.upstream.skip_verify {
        println!("⚠ Upstream certificate verification is disabled");
    }
    if let Some(ca) = &config.upstream.ca_cert_path {
        println!("✓ Extra upstream CA: {:?}", ca);
    }
    println!(
        "✓ Allow-list: {} IP entries, {} domain entries",
        config.allow_list.ips.len(),
        config.allow_list.domains.len()
    );

    println!("\n✓ Configuration is valid!");
    Ok(())
}
