use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

use kodegen_release::certificates::{Availability, BatchImportSummary, CertificateManager};
use kodegen_release::config::ApiKeyConfig;
use kodegen_release::keychain::EphemeralKeychain;
use kodegen_release::model::BumpType;
use kodegen_release::{
    DeploymentOrchestrator, ReleaseConfig, ReleaseContext, RunMode, StatusReport, error, success,
    warn,
};

// Console output (success!/warn!/error!) is decorative and ignores write
// errors. Audit events go through tracing; set RUST_LOG=kodegen_release=info
// to see them.

#[derive(Parser)]
#[command(name = "kodegen_release")]
#[command(version, about = "Sign, build and upload iOS releases to TestFlight")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run all six phases: certificates, profiles, version, build, upload, processing
    Deploy(ReleaseArgs),
    /// Make the required signing certificates available, creating them if needed
    Certificates(CertificatesArgs),
    /// Show certificates, profiles, API key rotation and the last deployment
    Status(ReleaseArgs),
    /// Dry run: certificate and profile validation only
    Validate(ReleaseArgs),
}

#[derive(Args)]
struct ReleaseArgs {
    /// Path to release config file (TOML)
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Bundle identifier, e.g. com.company.app
    #[arg(long)]
    app_id: Option<String>,

    /// 10-character Apple team identifier
    #[arg(long)]
    team_id: Option<String>,

    /// Xcode scheme to archive
    #[arg(long)]
    scheme: Option<String>,

    /// Path to the .xcodeproj / .xcworkspace or its directory
    #[arg(long)]
    project: Option<PathBuf>,

    /// App Store Connect Key ID
    #[arg(long, requires_all = ["api_issuer", "api_key_path"])]
    api_key_id: Option<String>,

    /// App Store Connect Issuer ID
    #[arg(long, requires_all = ["api_key_id", "api_key_path"])]
    api_issuer: Option<String>,

    /// Path to the .p8 private key file
    #[arg(long, requires_all = ["api_key_id", "api_issuer"])]
    api_key_path: Option<PathBuf>,

    /// Marketing version bump: none, patch, minor or major
    #[arg(long)]
    bump: Option<BumpType>,

    /// Return after upload without waiting for processing
    #[arg(long)]
    no_monitor: bool,
}

#[derive(Args)]
struct CertificatesArgs {
    #[command(flatten)]
    release: ReleaseArgs,

    /// Import every .p12/.pfx in this directory before checking availability
    #[arg(long)]
    import_dir: Option<PathBuf>,
}

impl ReleaseArgs {
    /// File config (if any), then flags, then environment.
    async fn into_config(self) -> Result<ReleaseConfig> {
        let mut config = match &self.config {
            Some(path) => ReleaseConfig::load(path)
                .await
                .with_context(|| format!("Failed to load config {}", path.display()))?,
            None => ReleaseConfig::new(
                self.app_id.clone().unwrap_or_default(),
                self.team_id.clone().unwrap_or_default(),
                self.scheme.clone().unwrap_or_default(),
                self.project.clone().unwrap_or_else(|| PathBuf::from(".")),
            ),
        };

        if let Some(app_id) = self.app_id {
            config.app_identifier = app_id;
        }
        if let Some(team_id) = self.team_id {
            config.team_id = team_id;
        }
        if let Some(scheme) = self.scheme {
            config.scheme = scheme;
        }
        if let Some(project) = self.project {
            config.project_path = project;
        }
        if let (Some(key_id), Some(issuer_id), Some(private_key_path)) =
            (self.api_key_id, self.api_issuer, self.api_key_path)
        {
            config.api_key = Some(ApiKeyConfig {
                key_id,
                issuer_id,
                private_key_path,
            });
        }
        if let Some(bump) = self.bump {
            config.bump = bump;
        }
        if self.no_monitor {
            config.monitor_processing = false;
        }

        config.apply_env();
        config.expand_paths()?;

        if config.app_identifier.is_empty() {
            anyhow::bail!("--app-id (or app_identifier in the config file) is required");
        }
        if config.team_id.is_empty() {
            anyhow::bail!("--team-id, APPLE_TEAM_ID or team_id in the config file is required");
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Deploy(args) => run_pipeline(args, RunMode::Full).await,
        Command::Validate(args) => run_pipeline(args, RunMode::ValidateOnly).await,
        Command::Certificates(args) => run_certificates(args).await,
        Command::Status(args) => run_status(args).await,
    }
}

async fn context(args: ReleaseArgs) -> Result<ReleaseContext> {
    let config = args.into_config().await?;
    Ok(ReleaseContext::for_host(config).await?)
}

async fn run_pipeline(args: ReleaseArgs, mode: RunMode) -> Result<()> {
    let ctx = context(args).await?;
    if mode == RunMode::Full && ctx.config().scheme.is_empty() {
        anyhow::bail!("--scheme (or scheme in the config file) is required to deploy");
    }

    let report = DeploymentOrchestrator::new(ctx).run(mode).await;
    report.print_summary();

    match &report.failure {
        None => Ok(()),
        Some(failure) => Err(anyhow::anyhow!(
            "deployment {} failed in phase {}",
            report.history.deployment_id(),
            failure.phase
        )),
    }
}

async fn run_certificates(args: CertificatesArgs) -> Result<()> {
    let ctx = context(args.release).await?;
    let keychain = EphemeralKeychain::create(ctx.store(), ctx.intermediates()).await?;

    let report = match CertificateManager::new(&ctx, keychain.scope()).await {
        Ok(manager) => match &args.import_dir {
            Some(dir) => match manager.importer().auto_import(dir).await {
                Ok(summary) => {
                    print_import_summary(dir, &summary);
                    manager.detector().invalidate();
                    Ok(manager.check_availability(&ctx.config().required_types).await)
                }
                Err(e) => Err(e),
            },
            None => Ok(manager.check_availability(&ctx.config().required_types).await),
        },
        Err(e) => Err(e),
    };
    keychain.teardown().await;
    let report = report?;

    for (cert_type, availability) in report.iter() {
        match availability {
            Availability::Available { certificate, source } => {
                success!("{}: {} ({:?})", cert_type, certificate.name(), source);
            }
            Availability::Unavailable {
                reason,
                suggestions,
            } => {
                error!("{}: {}", cert_type, reason);
                for hint in suggestions {
                    println!("   Suggestion: {hint}");
                }
            }
        }
    }

    if report.all_available() {
        Ok(())
    } else {
        Err(anyhow::anyhow!(
            "certificates unavailable: {}",
            report
                .missing()
                .iter()
                .map(|t| t.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        ))
    }
}

fn print_import_summary(dir: &Path, summary: &BatchImportSummary) {
    println!(
        "Imported {}/{} exports from {} ({} failed)",
        summary.successful,
        summary.total,
        dir.display(),
        summary.failed
    );
    for (path, outcome) in &summary.outcomes {
        match outcome {
            Ok(imported) if imported.already_present => {
                success!("{}: already in keychain", path.display());
            }
            Ok(imported) => success!("{}: {}", path.display(), imported.certificate.name()),
            Err(e) => warn!("{}: {}", path.display(), e),
        }
    }
}

async fn run_status(args: ReleaseArgs) -> Result<()> {
    let ctx = context(args).await?;
    StatusReport::collect(&ctx).await?.print();
    Ok(())
}
