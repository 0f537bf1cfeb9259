use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use std::sync::Arc;

use precache::cache::{CacheStorage, GenerationStore, MemoryStorage, SqliteStorage};
use precache::config::Config;
use precache::lifecycle::Lifecycle;
use precache::logging;
use precache::net::HttpFetcher;
use precache::router::{ActivationReport, Router};

#[derive(Parser, Debug)]
#[command(name = "precache")]
#[command(about = "Generation-based, cache-first asset cache for web applications")]
#[command(version)]
struct Args {
  /// Path to config file (default: ./precache.yaml or $XDG_CONFIG_HOME/precache/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Generation name to install (overrides the config file)
  #[arg(short, long)]
  generation: Option<String>,

  /// Keep the cache in memory only, e.g. to check that a manifest installs
  #[arg(long)]
  ephemeral: bool,

  /// Increase log verbosity (-v debug, -vv trace)
  #[arg(short, long, action = clap::ArgAction::Count)]
  verbose: u8,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Populate the configured generation from its manifest and activate it
  Install,
  /// Re-run activation for the active generation, removing leftover generations
  Activate,
  /// Route requests through the cache
  Fetch {
    /// Paths or absolute URLs
    #[arg(required = true)]
    urls: Vec<String>,
    #[arg(short = 'X', long, default_value = "GET")]
    method: String,
  },
  /// List generations
  List,
  /// Show lifecycle state and per-generation details
  Status,
  /// Delete a generation that is not active
  Delete { name: String },
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;

  // Override generation if specified on command line
  let config = if let Some(generation) = args.generation {
    Config {
      generation,
      ..config
    }
  } else {
    config
  };

  let _log_guard = logging::init(args.verbose, config.log_file.as_deref())?;

  if args.ephemeral {
    run(MemoryStorage::new(), &config, args.command).await
  } else {
    let storage = SqliteStorage::open(config.cache.path.as_deref())?;
    run(storage, &config, args.command).await
  }
}

async fn run<S: CacheStorage + 'static>(storage: S, config: &Config, command: Command) -> Result<()> {
  let lifecycle = Arc::new(Lifecycle::restored(storage.active_generation()?));
  let store = GenerationStore::new(storage, lifecycle, config.origin.clone())
    .with_concurrency(config.network.install_concurrency);
  let fetcher = HttpFetcher::new(config.origin.clone(), config.network.timeout())?;
  let router = Router::new(store, Arc::new(fetcher));

  match command {
    Command::Install => {
      let manifest = config.manifest.build()?;
      let report = router
        .install_and_activate(&config.generation, &manifest)
        .await?;
      println!(
        "installed {} ({} assets)",
        config.generation,
        manifest.len()
      );
      print_report(&report);
    }
    Command::Activate => {
      let report = router.on_activate().await?;
      print_report(&report);
    }
    Command::Fetch { urls, method } => {
      let client = router.connect();
      for url in &urls {
        let request = router.request(&method, url)?.from_client(client);
        let result = router.on_request(&request).await?;
        println!(
          "{} {} {} bytes {} ({})",
          result.data.status,
          request.key,
          result.data.body.len(),
          result.data.header("content-type").unwrap_or("-"),
          result.source
        );
      }
      router.disconnect(client);
      router.flush().await;
    }
    Command::List => {
      let active = router.lifecycle().active();
      for name in router.store().list_generations()? {
        let marker = if active.as_deref() == Some(name.as_str()) {
          "*"
        } else {
          " "
        };
        println!("{marker} {name}");
      }
    }
    Command::Status => {
      println!("state: {}", router.lifecycle().state());
      println!("origin: {}", config.origin);
      println!("configured generation: {}", config.generation);
      for info in router.store().generations()? {
        println!(
          "{} {:<24} entries={:<5} ready={:<5} digest={} created={}",
          if info.active { "*" } else { " " },
          info.name,
          info.entries,
          info.ready,
          info.digest.as_deref().map(|d| &d[..d.len().min(12)]).unwrap_or("-"),
          info.created_at.format("%Y-%m-%d %H:%M:%S")
        );
      }
    }
    Command::Delete { name } => {
      if router.lifecycle().active().as_deref() == Some(name.as_str()) {
        return Err(eyre!("Refusing to delete the active generation {}", name));
      }
      if router.store().delete(&name)? {
        println!("deleted {name}");
      } else {
        println!("no generation named {name}");
      }
    }
  }

  Ok(())
}

fn print_report(report: &ActivationReport) {
  println!("active: {}", report.generation);
  for name in &report.deleted {
    println!("  removed {name}");
  }
  for name in &report.failed {
    println!("  could not remove {name} (will retry on next activation)");
  }
  println!("  claimed {} client(s)", report.claimed);
}
