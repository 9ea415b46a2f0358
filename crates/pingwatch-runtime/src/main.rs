//! pingwatch: concurrent network latency monitor.
//! Probes targets on a fixed interval, tracks session statistics and
//! records confirmed anomaly episodes to CSV.

use clap::Parser;

mod cli;
mod cmd_config;
mod cmd_run;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = cli::Cli::parse();

    let filter = std::env::var("PINGWATCH_LOG")
        .or_else(|_| std::env::var("RUST_LOG"))
        .unwrap_or_else(|_| "info".to_string());
    // stdout carries tick output; diagnostics go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
        .with_writer(std::io::stderr)
        .init();

    let config_path = args.config.unwrap_or_else(cli::default_config_path);

    match args.command {
        cli::Command::Run(opts) => {
            tracing::info!(config = %config_path.display(), "pingwatch starting");
            cmd_run::cmd_run(opts, &config_path).await?;
        }
        cli::Command::Consolidate(opts) => {
            let rows = pingwatch_runtime::persist::consolidate(&opts.log_dir, &opts.output)?;
            if rows == 0 {
                println!("no probe logs found in {}", opts.log_dir.display());
            } else {
                println!(
                    "{rows} records consolidated into {}",
                    opts.log_dir.join(&opts.output).display()
                );
            }
        }
        cli::Command::Config(opts) => {
            cmd_config::cmd_config(&config_path, opts.init)?;
        }
    }

    Ok(())
}
