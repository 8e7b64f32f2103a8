use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use chrono::Utc;
use clap::{Args, CommandFactory, Parser, Subcommand};
use serde::Deserialize;
use sigprobs_core::api::{MediaWikiClient, MediaWikiClientConfig};
use sigprobs_core::batch::{ActivityWindow, BatchSettings, SignatureInput, run_report};
use sigprobs_core::config::{DEFAULT_CONFIG_PATH, SigprobsConfig, load_config};
use sigprobs_core::error::SigprobsError;
use sigprobs_core::model::Checks;
use sigprobs_core::replica::Replica;
use sigprobs_core::report::{
    ListFormat, default_max_age, errors_by_type, is_stale, list_report_sites, load_report,
    render_user_list, users_with_error, write_report,
};
use sigprobs_core::site::resolve_site;
use sigprobs_core::suite::CheckOptions;
use sigprobs_core::user_check::check_user;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "sigprobs",
    version,
    about = "Audit wiki user signatures for markup and policy problems"
)]
struct Cli {
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH", help = "Directory holding site reports")]
    data_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Audit signatures on one or more sites and write their reports")]
    Report(ReportArgs),
    #[command(about = "Check a single user's signature")]
    Check(CheckArgs),
    #[command(about = "Show a stored report grouped by error")]
    Show(ShowArgs),
    #[command(about = "List sites with a stored report")]
    Sites,
}

#[derive(Debug, Args)]
struct ReportArgs {
    #[arg(required = true, value_name = "HOST")]
    hosts: Vec<String>,
    #[arg(long, help = "Only users who edited in the last N days")]
    days: Option<u32>,
    #[arg(
        long,
        value_name = "YYYYMMDDHHMMSS",
        conflicts_with = "days",
        help = "Only users who edited after this time"
    )]
    since: Option<String>,
    #[arg(
        long,
        value_name = "FILE",
        conflicts_with_all = ["days", "since"],
        help = "JSON list of users or map of user to signature"
    )]
    input: Option<PathBuf>,
    #[arg(long, value_name = "NAME", help = "Checks to run, e.g. default, extended, images")]
    checks: Vec<String>,
    #[arg(long, value_name = "PATH", help = "Output file or directory per host, or - for stdout")]
    output: Vec<PathBuf>,
    #[arg(long, help = "Fail instead of replacing an existing report")]
    no_overwrite: bool,
    #[arg(long, help = "Skip sites whose stored report is less than a day old")]
    if_stale: bool,
}

#[derive(Debug, Args)]
struct CheckArgs {
    host: String,
    user: String,
    #[arg(long, help = "Check this signature instead of the stored one")]
    signature: Option<String>,
    #[arg(long, value_name = "NAME")]
    checks: Vec<String>,
}

#[derive(Debug, Args)]
struct ShowArgs {
    host: String,
    #[arg(long, value_name = "CODE", help = "Only users with this error")]
    error: Option<String>,
    #[arg(long, default_value = "json", help = "json, plain, massmessage or target")]
    format: ListFormat,
    #[arg(long, value_name = "USER")]
    exclude: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum InputFile {
    Users(Vec<String>),
    Signatures(BTreeMap<String, String>),
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();
    let cli = Cli::parse();
    let config = load_config(
        cli.config
            .as_deref()
            .unwrap_or_else(|| Path::new(DEFAULT_CONFIG_PATH)),
    )?;
    let data_dir = cli.data_dir.clone().unwrap_or_else(|| config.data_dir());

    match cli.command {
        Some(Commands::Report(args)) => run_report_command(&config, &data_dir, args),
        Some(Commands::Check(args)) => run_check(&config, args),
        Some(Commands::Show(args)) => run_show(&data_dir, args),
        Some(Commands::Sites) => run_sites(&data_dir),
        None => {
            let mut command = Cli::command();
            command.print_help()?;
            println!();
            Ok(())
        }
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn parse_checks(names: &[String]) -> Result<Checks> {
    if names.is_empty() {
        return Ok(Checks::DEFAULT);
    }
    Checks::parse_list(names)
}

fn read_input(path: &Path) -> Result<InputFile> {
    let content =
        fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| {
        format!(
            "failed to parse {} (expected a list of users or a map of user to signature)",
            path.display()
        )
    })
}

fn signature_input(
    input: Option<InputFile>,
    window: ActivityWindow,
    host_count: usize,
) -> Result<SignatureInput> {
    match input {
        None => Ok(SignatureInput::Active(window)),
        Some(InputFile::Users(users)) => Ok(SignatureInput::Users(users)),
        Some(InputFile::Signatures(_)) if host_count > 1 => {
            bail!("a signature map can only be used with a single host")
        }
        Some(InputFile::Signatures(signatures)) => Ok(SignatureInput::Signatures(signatures)),
    }
}

/// One output per host, a single shared directory, or the data directory.
fn plan_outputs(hosts: &[String], outputs: &[PathBuf], data_dir: &Path) -> Result<Vec<PathBuf>> {
    match outputs {
        [] => Ok(vec![data_dir.to_path_buf(); hosts.len()]),
        [single] if hosts.len() == 1 => Ok(vec![single.clone()]),
        [shared] => {
            let is_file = shared == Path::new("-")
                || shared.extension().is_some_and(|extension| extension == "json");
            if is_file {
                bail!("several hosts need one --output each or a single output directory");
            }
            Ok(vec![shared.clone(); hosts.len()])
        }
        many if many.len() == hosts.len() => Ok(many.to_vec()),
        many => bail!(
            "got {} outputs for {} hosts; pass one per host or a single directory",
            many.len(),
            hosts.len()
        ),
    }
}

fn run_report_command(config: &SigprobsConfig, data_dir: &Path, args: ReportArgs) -> Result<()> {
    let checks = parse_checks(&args.checks)?;
    let outputs = plan_outputs(&args.hosts, &args.output, data_dir)?;
    let input = args.input.as_deref().map(read_input).transpose()?;
    let since = args
        .since
        .as_deref()
        .map(ActivityWindow::parse_since)
        .transpose()?;

    for (host, output) in args.hosts.iter().zip(&outputs) {
        if args.if_stale {
            match load_report(data_dir, host) {
                Ok(existing) => {
                    let now = Utc::now().naive_utc();
                    if !is_stale(&existing, now, default_max_age())? {
                        info!(
                            host = %host,
                            last_update = %existing.meta.last_update,
                            "report is fresh, skipping"
                        );
                        continue;
                    }
                }
                Err(error)
                    if matches!(
                        error.downcast_ref::<SigprobsError>(),
                        Some(SigprobsError::ReportNotFound(_))
                    ) => {}
                Err(error) => return Err(error),
            }
        }

        let settings = config.site_settings(host);
        let window = since.unwrap_or(ActivityWindow::Days(args.days.unwrap_or(settings.days)));
        let host_input = signature_input(input.clone(), window, args.hosts.len())?;
        let batch = BatchSettings {
            options: CheckOptions::new(checks).with_limits(settings.limits.clone()),
            lint_batch_size: settings.lint_batch_size,
            replica_dir: config.replica_dir(),
        };
        let mut client = MediaWikiClient::new(MediaWikiClientConfig::from_config(config, host))?;
        let report = run_report(&mut client, host, host_input, &batch, Utc::now().naive_utc())?;
        if let Some(path) = write_report(output, host, &report, !args.no_overwrite)? {
            println!("{host}: {} signatures with problems -> {}", report.sigs.len(), path.display());
        }
    }
    Ok(())
}

fn run_check(config: &SigprobsConfig, args: CheckArgs) -> Result<()> {
    let checks = parse_checks(&args.checks)?;
    let settings = config.site_settings(&args.host);
    let mut client = MediaWikiClient::new(MediaWikiClientConfig::from_config(config, &args.host))?;
    let site = resolve_site(&mut client, &args.host)?;
    let replica_dir = config.replica_dir();
    let replica = Replica::open_optional(replica_dir.as_deref(), &site.database_id)?;
    let check = check_user(
        &mut client,
        replica.as_ref(),
        &site,
        &args.user,
        args.signature.as_deref(),
        &CheckOptions::new(checks).with_limits(settings.limits),
    )?;
    println!("{}", serde_json::to_string_pretty(&check)?);
    Ok(())
}

fn run_show(data_dir: &Path, args: ShowArgs) -> Result<()> {
    let report = load_report(data_dir, &args.host)?;
    let Some(code) = args.error.as_deref() else {
        if args.format != ListFormat::Json {
            bail!("--format {} needs --error", args.format);
        }
        let view = serde_json::json!({
            "errors": errors_by_type(&report),
            "meta": report.meta,
        });
        println!("{}", serde_json::to_string_pretty(&view)?);
        return Ok(());
    };
    let exclude = args.exclude.into_iter().collect::<BTreeSet<_>>();
    let users = users_with_error(&report, code, &exclude)?;
    println!("{}", render_user_list(&report, code, &users, args.format)?);
    Ok(())
}

fn run_sites(data_dir: &Path) -> Result<()> {
    for site in list_report_sites(data_dir)? {
        println!("{site}");
    }
    Ok(())
}
