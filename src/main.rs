mod commands;
mod config;
mod logging;

use clap::{Parser, Subcommand};
use color_eyre::Result;
use std::path::PathBuf;

use commands::FeedArgs;

#[derive(Parser, Debug)]
#[command(name = "feedsync")]
#[command(about = "Local-first feed cache with background freshness checks")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/feedsync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Print a page of a feed, serving from the local cache when possible
  Feed {
    #[command(flatten)]
    feed: FeedArgs,

    /// Continue after this cursor (printed as `next:` by a previous page)
    #[arg(long)]
    after: Option<String>,

    /// Pull the newest posts into the cached head first
    #[arg(long)]
    refresh: bool,
  },
  /// Keep the posts and authors of a feed page fresh until interrupted
  Watch {
    #[command(flatten)]
    feed: FeedArgs,
  },
  /// Delete everything in the local cache
  Clear,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = config::Config::load(args.config.as_deref())?;

  // Keep the guard alive so buffered log lines are flushed on exit
  let _log_guard = logging::init(&config.logging)?;

  match args.command {
    Command::Feed {
      feed,
      after,
      refresh,
    } => {
      let after = after.as_deref().map(commands::parse_cursor).transpose()?;
      commands::feed(&config, &feed, after, refresh).await
    }
    Command::Watch { feed } => commands::watch(&config, &feed).await,
    Command::Clear => commands::clear(&config),
  }
}
