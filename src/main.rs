//! Cipher - service identity and access control plane

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use tracing::{error, info};

use cipher_mesh::{
    audit::{AuditSink, JsonlAuditSink},
    ca::{CaClient, CertificateAuthority, server},
    certificate::CertificateInfo,
    cli::{Cli, Command},
    config::Config,
    demo::{self, DemoScenario},
    policy::PolicyEngine,
    setup_tracing,
    validator::CertificateValidator,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Command failed");
            eprintln!("❌ {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::load(cli.config.as_deref()).context("Failed to load configuration")?;

    match cli.command {
        Command::Init => run_init(&config),
        Command::Enroll { service, server } => {
            let server = server
                .map(|url| url.map_or_else(|| config.server.base_url(), Ok))
                .transpose()?;
            run_enroll(&config, &service, server.as_deref()).await
        }
        Command::Demo { requests } => run_demo(&config, requests).await,
        Command::CaServer { host, port } => run_ca_server(config, host, port).await,
        Command::Inspect { cert } => run_inspect(&cert),
        Command::Validate { cert, root } => run_validate(&config, &cert, root.as_deref()),
        Command::Config => {
            print!("{}", config.to_yaml()?);
            Ok(())
        }
    }
}

fn local_ca(config: &Config) -> Result<CertificateAuthority> {
    let settings = config.ca_settings().context("Invalid CA settings")?;
    Ok(CertificateAuthority::new(
        settings,
        Arc::new(config.key_store()),
    ))
}

fn run_init(config: &Config) -> Result<()> {
    let ca = local_ca(config)?;
    if ca.initialize().context("Failed to initialize root CA")? {
        println!("✅ Root CA created in {}", config.ca.dir.display());
    } else {
        println!("Root CA already exists in {}", config.ca.dir.display());
    }
    Ok(())
}

async fn run_enroll(config: &Config, service: &str, server: Option<&str>) -> Result<()> {
    if let Some(url) = server {
        let client = CaClient::new(url)?;
        let response = client
            .enroll(service)
            .await
            .with_context(|| format!("Enrollment of '{service}' via {} failed", client.base_url()))?;
        println!("✅ Issued certificate for {}", response.issued);
        return Ok(());
    }

    let ca = local_ca(config)?;
    let issued = ca
        .issue_service_certificate(service)
        .with_context(|| format!("Failed to issue certificate for '{service}'"))?;
    println!("✅ Issued certificate for {}", issued.identity);
    println!("   Path:        {}", config.key_store().service_cert_path(service).display());
    println!("   Valid until: {}", issued.not_after);
    println!("   Fingerprint: {}", issued.fingerprint);
    Ok(())
}

async fn run_demo(config: &Config, requests: usize) -> Result<()> {
    let settings = config.ca_settings().context("Invalid CA settings")?;
    let audit: Arc<dyn AuditSink> = Arc::new(
        JsonlAuditSink::open(&config.audit.path).context("Failed to open audit log")?,
    );
    let scenario = DemoScenario {
        requests,
        rotation_interval: config.rotation.interval,
        ..DemoScenario::default()
    };

    let policy = Arc::new(
        PolicyEngine::from_rules(&config.policy.allow).context("Invalid policy rules")?,
    );

    let report = demo::run(settings, config.key_store(), policy, audit, &scenario).await?;

    println!("\n--- Simulating {} requests ---\n", report.outcomes.len());
    println!("{} → {}\n", report.source, report.destination);
    for outcome in &report.outcomes {
        let verdict = if outcome.allowed { "ALLOW" } else { "DENY" };
        println!("Request #{:<3} {verdict}", outcome.request);
    }
    println!(
        "\n{} allowed, {} denied. Audit log: {}",
        report.allowed(),
        report.denied(),
        config.audit.path.display()
    );
    Ok(())
}

async fn run_ca_server(mut config: Config, host: Option<String>, port: Option<u16>) -> Result<()> {
    if let Some(host) = host {
        config.server.host = host;
    }
    if let Some(port) = port {
        config.server.port = port;
    }
    let addr = config.server.socket_addr()?;

    let ca = Arc::new(local_ca(&config)?);
    if ca.initialize().context("Failed to initialize root CA")? {
        info!("Root CA created");
    }

    server::serve(addr, ca).await.context("CA server failed")?;
    Ok(())
}

fn run_inspect(cert: &std::path::Path) -> Result<()> {
    let bytes = std::fs::read(cert).with_context(|| format!("Cannot read {}", cert.display()))?;
    let info = CertificateInfo::from_bytes(&bytes)?;
    let now = Utc::now();

    println!("Certificate: {}", cert.display());
    if let Some(cn) = &info.common_name {
        println!("  Subject CN:  {cn}");
    }
    if let Some(identity) = &info.uri_san {
        println!("  Identity:    {identity}");
    }
    println!("  Serial:      {}", info.serial);
    println!("  Fingerprint: {}", info.fingerprint);
    println!("  Not before:  {}", info.not_before);
    println!("  Not after:   {}", info.not_after);
    if info.is_valid_at(now) {
        println!("  Remaining:   {}m", info.remaining_at(now).num_minutes());
        if info.needs_rotation_at(now) {
            println!("  ⚠️  Past half-life, due for rotation");
        }
    } else {
        println!("  ❌ Outside validity window");
    }
    Ok(())
}

fn run_validate(config: &Config, cert: &std::path::Path, root: Option<&std::path::Path>) -> Result<()> {
    let root_path = root.map_or_else(|| config.key_store().root_cert_path(), std::path::Path::to_path_buf);
    let validator = CertificateValidator::from_file(&root_path)
        .with_context(|| format!("Cannot load root certificate {}", root_path.display()))?;
    let identity = validator
        .validate_file(cert)
        .with_context(|| format!("{} is not valid", cert.display()))?;
    println!("✅ {identity}");
    Ok(())
}
