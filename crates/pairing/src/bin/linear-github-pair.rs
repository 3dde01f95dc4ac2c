#![allow(clippy::print_stdout, clippy::print_stderr)]

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use linear_github_pairing::{
    CallbackOutcome, CallbackParams, PairingConfig, PairingSession, PlatformContext,
    WorkflowStateChoice,
};
use linear_github_platform::Platform;
use serde_json::{Value, json};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser)]
#[command(name = "linear-github-pair")]
#[command(about = "Link a Linear team with a GitHub repository for issue sync")]
struct Cli {
    /// Tracing filter, e.g. `linear_github_pairing=debug`.
    #[arg(long, default_value = "warn")]
    log_filter: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the authorize URL for a platform.
    Login(PlatformArgs),
    /// Complete an OAuth redirect by pasting the full callback URL.
    Callback(CallbackArgs),
    /// List Linear teams or GitHub repositories visible to the session.
    List(PlatformArgs),
    /// Show both pairing contexts.
    Status,
    /// Deploy webhooks and labels on both sides and save the pairing.
    Pair(PairArgs),
}

#[derive(Args)]
struct PlatformArgs {
    /// `linear` or `github`.
    platform: String,
}

#[derive(Args)]
struct CallbackArgs {
    url: String,
}

#[derive(Args)]
struct PairArgs {
    /// Linear team id or key.
    #[arg(long)]
    team: String,
    /// GitHub repository id or `owner/name`.
    #[arg(long)]
    repo: String,
    #[arg(long)]
    label: String,
    /// Workflow state (name or id) for newly synced issues.
    #[arg(long)]
    todo_state: Option<String>,
    #[arg(long)]
    done_state: Option<String>,
    #[arg(long)]
    canceled_state: Option<String>,
}

fn init_tracing(filter: &str) {
    let filter = EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_filter);

    let config = PairingConfig::from_env()?;
    let session = PairingSession::open(config)
        .await
        .context("failed to open pairing session")?;

    match cli.command {
        Commands::Login(args) => run_login(&session, &args).await,
        Commands::Callback(args) => run_callback(&session, &args).await,
        Commands::List(args) => run_list(&session, &args).await,
        Commands::Status => run_status(&session).await,
        Commands::Pair(args) => run_pair(&session, args).await,
    }
}

fn parse_platform(raw: &str) -> Result<Platform> {
    Platform::parse(raw)
        .with_context(|| format!("unknown platform '{raw}'; expected linear or github"))
}

async fn run_login(session: &PairingSession, args: &PlatformArgs) -> Result<()> {
    let platform = parse_platform(&args.platform)?;
    let url = session.authorize_url(platform).await?;
    println!("Open this URL to authorize {platform}:\n{url}");
    Ok(())
}

async fn run_callback(session: &PairingSession, args: &CallbackArgs) -> Result<()> {
    let params = CallbackParams::from_url(&args.url)?;
    match session.handle_callback(&params).await? {
        Some((platform, CallbackOutcome::Authorized)) => {
            let user_id = session.state().context(platform).user_id.clone().unwrap_or_default();
            println!("{platform} authorized as user {user_id}");
        }
        Some((platform, CallbackOutcome::TokenMissing)) => {
            bail!("{platform} returned no access token; run `login {}` again", platform.as_str());
        }
        Some((_, CallbackOutcome::NotForPlatform)) | None => {
            bail!("callback does not belong to a pending login");
        }
    }
    Ok(())
}

async fn run_list(session: &PairingSession, args: &PlatformArgs) -> Result<()> {
    let rows: Vec<Value> = match parse_platform(&args.platform)? {
        Platform::Linear => session
            .list_linear_teams()
            .await?
            .into_iter()
            .map(|team| {
                let states: Vec<&str> =
                    team.states.iter().map(|state| state.name.as_str()).collect();
                json!({
                    "id": team.id,
                    "key": team.key,
                    "name": team.name,
                    "states": states,
                })
            })
            .collect(),
        Platform::GitHub => session
            .list_github_repos()
            .await?
            .into_iter()
            .map(|repo| json!({ "id": repo.id, "fullName": repo.full_name }))
            .collect(),
    };
    print_json(&Value::Array(rows))
}

fn describe(context: &PlatformContext) -> Value {
    json!({
        "userId": context.user_id,
        "resourceId": context.resource_id,
        "resourceName": context.resource_name,
        "authorized": context.api_key().is_some(),
        "label": context.label,
        "labelId": context.platform_label_id,
        "missing": context.missing(),
    })
}

async fn run_status(session: &PairingSession) -> Result<()> {
    let state = session.state();
    let exists = session.pairing_exists().await?;
    print_json(&json!({
        "linear": describe(&state.linear),
        "github": describe(&state.github),
        "pairingExists": exists,
    }))
}

async fn run_pair(session: &PairingSession, args: PairArgs) -> Result<()> {
    session.choose_label(&args.label).await?;
    let team = session.select_linear_team(&args.team).await?;
    let repo = session.select_github_repo(&args.repo).await?;
    if session.pairing_exists().await? == Some(true) {
        println!(
            "{} and {} are already paired; saving will update the pairing",
            team.name, repo.full_name
        );
    }

    let states = WorkflowStateChoice {
        todo: args.todo_state,
        done: args.done_state,
        canceled: args.canceled_state,
    };
    session
        .deploy_linear(&states)
        .await
        .context("Linear deployment failed")?;
    println!("Linear webhook and label ready on {}", team.name);
    session.deploy_github().await.context("GitHub deployment failed")?;
    println!("GitHub webhook and label ready on {}", repo.full_name);

    let finalized = session.finalize().await?;
    println!("{}", finalized.message);
    finalized
        .reset
        .await
        .context("context reset task failed")??;
    Ok(())
}

fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
