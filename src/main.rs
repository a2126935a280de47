use anyhow::Result;
use clap::{Parser, Subcommand};
use gh_watchbot::discord::DiscordClient;
use gh_watchbot::github::GithubClient;
use gh_watchbot::{config, db, reconciler, scheduler};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the fixed-interval release poll loop
    Run,
    /// Track a GitHub account, mirroring its repositories under a category
    Track {
        #[arg(long)]
        guild: String,
        #[arg(long)]
        category: String,
        #[arg(long)]
        account: String,
    },
    /// Reconcile mirror channels with an account's current repository list
    Sync {
        #[arg(long)]
        guild: String,
        #[arg(long)]
        account: String,
    },
    /// Stop tracking an account and remove its mirror channels
    Untrack {
        #[arg(long)]
        guild: String,
        #[arg(long)]
        account: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let database_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| format!("sqlite://{}/watchbot.db", cfg.app.data_dir));

    let pool = db::init_pool(&database_url).await?;
    db::run_migrations(&pool).await?;

    let github = GithubClient::new(cfg.github.token.clone());
    let discord = DiscordClient::new(cfg.discord.bot_token.clone());

    match args.command {
        Command::Run => {
            let period = Duration::from_secs(cfg.app.poll_interval_secs);
            info!(period_secs = cfg.app.poll_interval_secs, "starting poll loop");
            scheduler::run(&pool, &github, &discord, period).await;
        }
        Command::Track {
            guild,
            category,
            account,
        } => {
            let report =
                reconciler::register_account(&pool, &github, &discord, &guild, &category, &account)
                    .await?;
            print_sync_report(&account, &report);
        }
        Command::Sync { guild, account } => {
            let report =
                reconciler::sync_account(&pool, &github, &discord, &guild, &account).await?;
            print_sync_report(&account, &report);
        }
        Command::Untrack { guild, account } => {
            let failed =
                reconciler::unregister_account(&pool, &discord, &guild, &account).await?;
            if failed.is_empty() {
                println!("untracked {}", account);
            } else {
                println!(
                    "{} still tracked; failed to remove channels for: {}",
                    account,
                    failed.join(", ")
                );
            }
        }
    }

    Ok(())
}

fn print_sync_report(account: &str, report: &reconciler::SyncReport) {
    if report.aborted {
        println!("{}: repository list unavailable or empty; nothing changed", account);
        return;
    }
    println!(
        "{}: {} mirror(s) created, {} removed, {} skipped",
        account,
        report.created.len(),
        report.deleted.len(),
        report.skipped.len()
    );
    for name in &report.skipped {
        println!("  skipped {} (will retry on next sync)", name);
    }
}
