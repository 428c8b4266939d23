//! cf-accounts - operator tool for CloseFriends account data
//!
//! Everything here works on the local data directory only. Nothing talks to
//! Instagram, so it is safe to run next to the web application.

use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use libclosefriends::logging::LoggingConfig;
use libclosefriends::service::{AccountDetail, AccountService};
use libclosefriends::types::validate_owner;
use libclosefriends::{CloseFriendsError, Config, FileQuotaStore, Quota};
use tracing::error;

#[derive(Parser)]
#[command(name = "cf-accounts")]
#[command(version, about = "Inspect and maintain CloseFriends account data")]
#[command(long_about = r#"Inspect and maintain CloseFriends account data.

EXAMPLES:
    # List connected accounts of a user
    cf-accounts --owner web-user list

    # Full detail, including checkpoint and lease
    cf-accounts --owner web-user show alice --format json

    # Start follower retrieval over after a bad run
    cf-accounts --owner web-user reset-followers alice

    # Grant a user a larger allocation
    cf-accounts --owner web-user quota set 1000

    # Recover an account whose worker died mid-run
    cf-accounts --owner web-user lease clear alice

EXIT CODES:
    0 - Success
    1 - Error (account not found, job running, storage failure, etc.)
    2 - Authentication error (login rejected or a code is required)
    3 - Invalid input (bad username or owner)
"#)]
struct Cli {
    /// Owning user whose accounts to operate on
    #[arg(short, long, env = "CLOSEFRIENDS_OWNER", global = true)]
    owner: Option<String>,

    /// Output format
    #[arg(short, long, default_value = "text", global = true)]
    #[arg(value_parser = ["text", "json"])]
    format: String,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List connected accounts
    List,

    /// Show everything stored for one account
    Show { username: String },

    /// Delete an account and all its files, releasing its allocation
    Delete { username: String },

    /// Drop the follower list and release the allocation; keeps the checkpoint
    ResetFollowers { username: String },

    /// Inspect or change the user's allocation
    Quota {
        #[command(subcommand)]
        action: QuotaAction,
    },

    /// Inspect or clear the resume checkpoint of a close-friends run
    Checkpoint {
        #[command(subcommand)]
        action: CheckpointAction,
    },

    /// Maintain the per-account run lease
    Lease {
        #[command(subcommand)]
        action: LeaseAction,
    },
}

#[derive(Subcommand)]
enum QuotaAction {
    /// Show current and maximum allocation
    Show,
    /// Set the maximum allocation
    Set { max: u32 },
}

#[derive(Subcommand)]
enum CheckpointAction {
    Show { username: String },
    Clear { username: String },
}

#[derive(Subcommand)]
enum LeaseAction {
    /// Remove an expired lease and clear the status flags it left behind
    Clear { username: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(e.exit_code());
        }
    };
    LoggingConfig::from_settings(&config.logging, cli.verbose).init();

    if let Err(e) = run(&cli, &config) {
        error!("{}", e);
        eprintln!("Error: {}", e);
        let code = e
            .downcast_ref::<CloseFriendsError>()
            .map(CloseFriendsError::exit_code)
            .unwrap_or(1);
        std::process::exit(code);
    }

    Ok(())
}

fn run(cli: &Cli, config: &Config) -> Result<()> {
    let owner = cli
        .owner
        .as_deref()
        .ok_or_else(|| CloseFriendsError::InvalidInput("--owner is required".to_string()))?;
    validate_owner(owner)?;

    let quotas = Arc::new(FileQuotaStore::new(config.data_path()));
    let accounts = AccountService::from_config(config, quotas);
    let json = cli.format == "json";

    match &cli.command {
        Commands::List => {
            let mut list = accounts.list(owner)?;
            list.sort_by(|a, b| a.username.cmp(&b.username));
            if json {
                println!("{}", serde_json::to_string_pretty(&list)?);
            } else if list.is_empty() {
                println!("No accounts for {}", owner);
            } else {
                for account in &list {
                    println!(
                        "{:<30} {:>6} followers{}",
                        account.username,
                        account.followers_count,
                        status_suffix(account.getting_followers, account.adding_to_close_friends)
                    );
                }
            }
        }
        Commands::Show { username } => {
            let detail = accounts.detail(owner, username)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&detail)?);
            } else {
                print_detail(&detail);
            }
        }
        Commands::Delete { username } => {
            accounts.delete(owner, username)?;
            println!("Account '{}' deleted successfully", username);
        }
        Commands::ResetFollowers { username } => {
            let released = accounts.reset_followers(owner, username)?;
            println!(
                "Account details reset successfully ({} released)",
                released
            );
        }
        Commands::Quota { action } => {
            let quota = match action {
                QuotaAction::Show => accounts.quota(owner)?,
                QuotaAction::Set { max } => accounts.set_allocation_limit(owner, *max)?,
            };
            print_quota(&quota, json)?;
        }
        Commands::Checkpoint { action } => match action {
            CheckpointAction::Show { username } => {
                let detail = accounts.detail(owner, username)?;
                if json {
                    let value = serde_json::json!({
                        "username": detail.username,
                        "checkpoint": detail.checkpoint,
                        "remaining": detail.remaining,
                    });
                    println!("{}", serde_json::to_string_pretty(&value)?);
                } else {
                    match &detail.checkpoint {
                        Some(id) => println!("{}", id),
                        None => println!("No checkpoint for {}", username),
                    }
                }
            }
            CheckpointAction::Clear { username } => {
                accounts.clear_checkpoint(owner, username)?;
                println!("Checkpoint cleared for {}", username);
            }
        },
        Commands::Lease { action } => match action {
            LeaseAction::Clear { username } => {
                if accounts.clear_stale_lease(owner, username)? {
                    println!("Stale lease cleared for {}", username);
                } else {
                    println!("No lease held for {}", username);
                }
            }
        },
    }

    Ok(())
}

fn status_label(getting_followers: bool, adding: bool) -> Option<&'static str> {
    if getting_followers {
        Some("getting followers")
    } else if adding {
        Some("adding to close friends")
    } else {
        None
    }
}

fn status_suffix(getting_followers: bool, adding: bool) -> String {
    status_label(getting_followers, adding)
        .map(|label| format!("  [{}]", label))
        .unwrap_or_default()
}

fn print_detail(detail: &AccountDetail) {
    println!("Username:        {}", detail.username);
    println!("Followers:       {}", detail.followers_count);
    println!("Stored list:     {}", detail.followers_stored);
    println!("Allocated:       {}", detail.allocated);
    println!(
        "Status:          {}",
        status_label(detail.getting_followers, detail.adding_to_close_friends).unwrap_or("idle")
    );
    match (&detail.checkpoint, detail.remaining) {
        (Some(id), Some(remaining)) => {
            println!("Checkpoint:      {} ({} remaining)", id, remaining)
        }
        (Some(id), None) => println!("Checkpoint:      {} (not in follower list)", id),
        (None, _) => println!("Checkpoint:      none"),
    }
    match &detail.lease {
        Some(lease) => println!(
            "Lease:           {} held until {}",
            lease.job,
            lease.expires_at.to_rfc3339()
        ),
        None => println!("Lease:           free"),
    }
    let c = &detail.config;
    println!(
        "Config:          max {} / batch {} / cooldown {}s / delay {}-{}s",
        c.max_followers,
        c.followers_batch_size,
        c.batch_cooldown,
        c.action_delay_min,
        c.action_delay_max
    );
}

fn print_quota(quota: &Quota, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(quota)?);
    } else {
        println!(
            "Allocated {} of {} ({} available)",
            quota.current_allocation,
            quota.max_close_friends_allocation,
            quota.available()
        );
    }
    Ok(())
}
