//! WIF Agent - Standalone Binary
//!
//! Sets up and tears down Workload Identity Federation between GitHub
//! Actions and GCP, and lints/compiles trust conditions offline.
//!
//! ## Usage
//!
//! ```bash
//! # Check an expression before pasting it into a console
//! wif-agent lint "repository == 'acme/app' && ref == 'refs/heads/main'"
//!
//! # Show the condition a policy compiles to
//! wif-agent compile --repository acme/app --branch main --require-actor
//!
//! # Detect conflicts, then provision
//! wif-agent plan --project-id acme-prod --project-number 123456 --service-account deployer --repository acme/app
//! wif-agent setup --project-id acme-prod --project-number 123456 --service-account deployer --repository acme/app --branch main
//!
//! # Remove only the binding
//! wif-agent cleanup --project-id acme-prod --project-number 123456 --service-account deployer --repository acme/app --scope bindings
//! ```

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use wif_engine::agents::setup::{
    FederationConfig, Scope, SetupOptions, SetupReport, SetupRequest, WorkloadIdentitySetup,
};
use wif_engine::agents::trust::{compile, validate, TrustConditionSpec};
use wif_engine::tools::GcpIamClient;

/// WIF Agent - GitHub Actions to GCP Workload Identity Federation
#[derive(Parser, Debug)]
#[command(name = "wif-agent", version, about)]
struct Cli {
    /// Output format
    #[arg(long, value_enum, default_value = "text", global = true)]
    output: OutputFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Validate a conditional-access expression
    Lint {
        /// Expression to validate
        expression: String,
    },
    /// Compile a trust policy into a condition
    Compile {
        #[command(flatten)]
        trust: TrustArgs,
    },
    /// Detect conflicts with live IAM state
    Plan {
        #[command(flatten)]
        federation: FederationArgs,
        #[command(flatten)]
        trust: TrustArgs,
        #[command(flatten)]
        run: RunArgs,
    },
    /// Create or reconcile the federation
    Setup {
        #[command(flatten)]
        federation: FederationArgs,
        #[command(flatten)]
        trust: TrustArgs,
        #[command(flatten)]
        run: RunArgs,
    },
    /// Remove the federation
    Cleanup {
        #[command(flatten)]
        federation: FederationArgs,
        #[command(flatten)]
        trust: TrustArgs,
        #[command(flatten)]
        run: RunArgs,
    },
    /// List impersonation bindings for the repository
    Bindings {
        #[command(flatten)]
        federation: FederationArgs,
        #[command(flatten)]
        trust: TrustArgs,
    },
}

#[derive(Args, Debug)]
struct FederationArgs {
    /// GCP Project ID
    #[arg(long, env = "GCP_PROJECT_ID")]
    project_id: String,

    /// GCP Project number
    #[arg(long, env = "GCP_PROJECT_NUMBER")]
    project_number: String,

    /// Workload identity pool ID
    #[arg(long, default_value = "github-pool", env = "GCP_WORKLOAD_IDENTITY_POOL_ID")]
    pool_id: String,

    /// Workload identity provider ID
    #[arg(long, default_value = "github-provider", env = "GCP_WORKLOAD_IDENTITY_PROVIDER_ID")]
    provider_id: String,

    /// Service account ID or email
    #[arg(long, env = "WIF_SERVICE_ACCOUNT_ID")]
    service_account: String,

    /// Project roles for the service account (comma separated)
    #[arg(long, env = "WIF_ROLES", value_delimiter = ',')]
    roles: Vec<String>,
}

#[derive(Args, Debug)]
struct TrustArgs {
    /// GitHub repository (e.g., "acme/app")
    #[arg(long, env = "GITHUB_REPOSITORY")]
    repository: String,

    /// Allowed branch or prefix* pattern (repeatable)
    #[arg(long)]
    branch: Vec<String>,

    /// Allowed tag or prefix* pattern (repeatable)
    #[arg(long)]
    tag: Vec<String>,

    /// Additional trusted repository (repeatable)
    #[arg(long)]
    trusted_repo: Vec<String>,

    /// Let pull request refs through the branch/tag restriction
    #[arg(long, default_value = "false")]
    allow_pull_requests: bool,

    /// Reject tokens minted for forks
    #[arg(long, default_value = "false")]
    block_forks: bool,

    /// Require the actor claim
    #[arg(long, default_value = "false")]
    require_actor: bool,

    /// Restrict job_workflow_ref to the trusted repositories' workflows
    #[arg(long, default_value = "false")]
    validate_workflow_path: bool,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Proceed even when conflicts say not to
    #[arg(long, default_value = "false")]
    force: bool,

    /// Continue after failed steps
    #[arg(long, default_value = "false")]
    ignore_errors: bool,

    /// Show what would change without changing it
    #[arg(long, default_value = "false")]
    dry_run: bool,

    /// Update existing resources whose configuration differs
    #[arg(long, default_value = "false")]
    allow_update: bool,

    /// Only reconcile resources that already exist
    #[arg(long, default_value = "false")]
    no_create: bool,

    /// Provision one resource at a time
    #[arg(long, default_value = "false")]
    sequential: bool,

    /// Resources to remove on cleanup
    #[arg(long, value_enum, default_value = "all")]
    scope: Scope,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OutputFormat {
    /// Human-readable text output
    Text,
    /// JSON output
    Json,
}

impl TrustArgs {
    fn spec(&self) -> TrustConditionSpec {
        TrustConditionSpec {
            repository: self.repository.clone(),
            allowed_branches: self.branch.clone(),
            allowed_tags: self.tag.clone(),
            allow_pull_requests: self.allow_pull_requests,
            block_forked_repos: self.block_forks,
            require_actor: self.require_actor,
            validate_workflow_path: self.validate_workflow_path,
            trusted_repos: self.trusted_repo.clone(),
        }
    }
}

impl FederationArgs {
    fn request(&self, trust: &TrustArgs) -> SetupRequest {
        let config = FederationConfig::new(
            &self.project_id,
            &self.project_number,
            &self.service_account,
            &trust.repository,
        )
        .with_pool(&self.pool_id)
        .with_provider(&self.provider_id)
        .with_roles(self.roles.iter().filter(|r| !r.is_empty()));
        SetupRequest::new(config, trust.spec())
    }

    fn facade(&self, config: &FederationConfig) -> Result<WorkloadIdentitySetup> {
        let client = GcpIamClient::new(&config.project_id, &config.service_account_email())
            .context("Failed to initialize GCP IAM client")?
            .with_provider(&config.provider_id);
        Ok(WorkloadIdentitySetup::with_cloud(Arc::new(client)))
    }
}

impl RunArgs {
    fn options(&self) -> SetupOptions {
        SetupOptions {
            create_new: !self.no_create,
            allow_update: self.allow_update,
            force: self.force,
            ignore_errors: self.ignore_errors,
            dry_run: self.dry_run,
            parallel: !self.sequential,
            scope: self.scope,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_writer(std::io::stderr)
        .json()
        .init();

    let cli = Cli::parse();

    match &cli.command {
        Command::Lint { expression } => match validate(expression) {
            Ok(()) => {
                println!("ok");
                Ok(())
            }
            Err(e) => {
                println!("{}", e);
                anyhow::bail!("expression rejected");
            }
        },
        Command::Compile { trust } => {
            let condition = compile(&trust.spec()).context("Failed to compile trust policy")?;
            match cli.output {
                OutputFormat::Json => print_json(&condition)?,
                OutputFormat::Text => {
                    println!("title:      {}", condition.title);
                    println!("expression: {}", condition.expression);
                }
            }
            Ok(())
        }
        Command::Plan { federation, trust, run } => {
            let request = federation.request(trust);
            let facade = federation.facade(&request.config)?;

            info!(repository = %trust.repository, "Planning workload identity setup");
            let plan = facade.plan(&request, &run.options()).await?;

            match cli.output {
                OutputFormat::Json => print_json(&plan.detection)?,
                OutputFormat::Text => {
                    println!("condition: {}", plan.condition);
                    println!("{}", plan.detection.summary);
                    for conflict in &plan.detection.conflicts {
                        println!(
                            "  [{}] {} '{}': {}",
                            conflict.severity, conflict.resource_type, conflict.resource_name, conflict.conflict_type
                        );
                        for difference in &conflict.differences {
                            println!("      - {}", difference.description);
                        }
                        if let Some(suggestion) = conflict.recommended() {
                            println!("      recommended: {}", suggestion.title);
                            for command in &suggestion.commands {
                                println!("        $ {}", command);
                            }
                        }
                    }
                }
            }
            Ok(())
        }
        Command::Setup { federation, trust, run } => {
            let request = federation.request(trust);
            let facade = federation.facade(&request.config)?;

            info!(
                repository = %trust.repository,
                provider = %request.config.provider_resource(),
                dry_run = run.dry_run,
                "Starting workload identity setup"
            );
            let report = facade.setup(&request, &run.options()).await?;
            finish(&report, cli.output)
        }
        Command::Cleanup { federation, trust, run } => {
            let request = federation.request(trust);
            let facade = federation.facade(&request.config)?;

            info!(repository = %trust.repository, scope = ?run.scope, "Starting workload identity cleanup");
            let report = facade.cleanup(&request, &run.options()).await;
            finish(&report, cli.output)
        }
        Command::Bindings { federation, trust } => {
            let request = federation.request(trust);
            let facade = federation.facade(&request.config)?;

            let listed = facade.bindings().list(&request.config.principal(&trust.repository)).await;
            if let Some(e) = &listed.error {
                error!(error = %e, "Binding list is incomplete");
            }
            match cli.output {
                OutputFormat::Json => print_json(&listed.bindings)?,
                OutputFormat::Text => {
                    for binding in &listed.bindings {
                        let condition = binding
                            .condition
                            .as_ref()
                            .map(|c| c.to_string())
                            .unwrap_or_else(|| "(unconditional)".to_string());
                        println!("{} {}/{} {}", binding.role, binding.pool_id, binding.provider_id, condition);
                    }
                }
            }
            Ok(())
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Print a report and fail the process if any step failed
fn finish(report: &SetupReport, output: OutputFormat) -> Result<()> {
    match output {
        OutputFormat::Json => print_json(report)?,
        OutputFormat::Text => {
            println!("run {}{}", report.run_id, if report.dry_run { " (dry run)" } else { "" });
            for action in &report.actions {
                println!(
                    "  {:?} {} {} '{}'{}",
                    action.outcome,
                    action.operation,
                    action.target,
                    action.name,
                    action
                        .detail
                        .as_ref()
                        .map(|d| format!(": {}", d))
                        .unwrap_or_default()
                );
            }
        }
    }

    if !report.is_success() {
        anyhow::bail!("{} step(s) failed", report.failures().count());
    }
    Ok(())
}
