//! Skillforge - Entry Point
//!
//! Commands:
//! - hydrate: rebuild the namespace's working tree from the store
//! - run <file>: execute a Python file, optionally saving it as a skill
//! - list [category]: stored skills
//! - stats: per-category counts

use skillforge::{Config, RunRequest, SaveRequest, SkillCoordinator, SkillIdentity};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

fn print_help() {
    println!("Skillforge v{}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("Usage: skillforge <COMMAND>");
    println!();
    println!("Commands:");
    println!("  hydrate                                   Rebuild the working tree");
    println!("  run <file> [--save cat/name] [--tags a,b] Execute a Python file");
    println!("  list [category]                           List stored skills");
    println!("  stats                                     Show skill counts");
    println!("  --help, -h                                Show this help");
    println!();
    println!("Environment variables:");
    println!("  SKILLFORGE_NAMESPACE     Owning agent (required)");
    println!("  SKILLFORGE_CONFIG        Optional TOML config file");
    println!("  SKILLFORGE_DB_PATH       Skill database");
    println!("  SKILLFORGE_SKILLS_DIR    Working tree base (default: ./skills)");
    println!("  SKILLFORGE_SERVERS_DIR   Generated API surface (default: ./servers)");
    println!("  SKILLFORGE_ISOLATION     auto | process | container");
    println!("  SKILLFORGE_LOG_FORMAT    json (default) | pretty");
}

fn flag_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .map(String::as_str)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    // Parse args
    let args: Vec<String> = std::env::args().skip(1).collect();
    let help_mode = args.is_empty() || args.iter().any(|a| a == "--help" || a == "-h");

    if help_mode {
        print_help();
        return Ok(());
    }

    let log_level = std::env::var("RUST_LOG")
        .map(|s| match s.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::INFO,
        })
        .unwrap_or(Level::INFO);

    let pretty = std::env::var("SKILLFORGE_LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("pretty"));
    if pretty {
        let subscriber = FmtSubscriber::builder()
            .with_max_level(log_level)
            .with_writer(std::io::stderr)
            .with_ansi(true)
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        // stdout carries command output, so logs go to stderr as JSON
        let subscriber = FmtSubscriber::builder()
            .with_max_level(log_level)
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .json()
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    }

    let config = Config::from_env()?;
    info!("Skillforge v{} for namespace {}", env!("CARGO_PKG_VERSION"), config.namespace);
    let coordinator = SkillCoordinator::from_config(&config).await?;

    match args[0].as_str() {
        "hydrate" => {
            let report = coordinator.hydrate()?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        "run" => {
            let path = args
                .get(1)
                .filter(|a| !a.starts_with("--"))
                .ok_or_else(|| anyhow::anyhow!("run needs a source file"))?;
            let source = std::fs::read_to_string(path)?;

            let mut request = RunRequest::new(source);
            if let Some(target) = flag_value(&args, "--save") {
                let identity = SkillIdentity::parse(target)?;
                let tags = flag_value(&args, "--tags")
                    .map(|t| t.split(',').map(str::to_string).collect::<Vec<_>>())
                    .unwrap_or_default();
                request = request.with_save(SaveRequest::new(identity.category, identity.name).with_tags(tags));
            }

            let outcome = coordinator.execute(request).await;
            println!("{}", serde_json::to_string_pretty(&outcome.result)?);

            match outcome.save {
                Some(Ok(receipt)) => {
                    if let Some(persist) = receipt.persist {
                        let record = persist.wait().await?;
                        info!("Persisted {}/{}", record.category, record.name);
                    }
                }
                Some(Err(e)) => return Err(e.into()),
                None => {}
            }
            if !outcome.result.success {
                std::process::exit(1);
            }
        }
        "list" => {
            let records = coordinator.list(args.get(1).map(String::as_str))?;
            for record in records {
                println!(
                    "{}/{}\t{}\t{}",
                    record.category, record.name, record.usage_count, record.description
                );
            }
        }
        "stats" => {
            let stats = coordinator.stats()?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        other => {
            anyhow::bail!("unknown command '{}' (see --help)", other);
        }
    }

    Ok(())
}
