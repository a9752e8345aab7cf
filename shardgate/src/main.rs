use clap::{Args, Parser};
use std::path::PathBuf;
use std::process;

mod config;
use config::{Config, MetricsConfig};
use metrics_exporter_statsd::StatsdBuilder;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser)]
enum CliCommand {
    /// Run the proxy
    Serve(ServeArgs),
    /// Show all metrics definitions as markdown table
    ShowMetrics,
}

#[derive(Args, Debug)]
struct ServeArgs {
    #[arg(long)]
    config_file_path: PathBuf,
}

#[derive(thiserror::Error, Debug)]
enum CliError {
    #[error("Failed to load config file: {0}")]
    ConfigLoadError(#[from] config::ConfigError),
    #[error("Failed to create runtime: {0}")]
    RuntimeError(#[from] std::io::Error),
}

fn main() {
    init_tracing();

    if let Err(e) = cli() {
        tracing::error!(error = %e, "Startup error");
        process::exit(1);
    }
}

fn cli() -> Result<(), CliError> {
    match CliCommand::parse() {
        CliCommand::Serve(args) => {
            let config = Config::from_file(&args.config_file_path)?;
            init_statsd_recorder("shardgate", config.common.metrics);

            run_async(proxy::run(config.proxy))
        }
        CliCommand::ShowMetrics => {
            println!("{}", generate_metrics_table());
            Ok(())
        }
    }
}

fn generate_metrics_table() -> String {
    let mut lines = vec![
        "| Metric | Type | Description |".to_string(),
        "|--------|------|-------------|".to_string(),
    ];
    for m in proxy::metrics_defs::ALL_METRICS
        .iter()
        .chain(credstore::metrics_defs::ALL_METRICS)
    {
        lines.push(format!(
            "| `{}` | {} | {} |",
            m.name,
            m.metric_type.as_str(),
            m.description
        ));
    }
    lines.join("\n")
}

fn run_async(
    fut: impl Future<Output = Result<(), impl std::error::Error>>,
) -> Result<(), CliError> {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    if let Err(e) = rt.block_on(fut) {
        tracing::error!(error = %e, "Runtime error");
        process::exit(1);
    }
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}

fn init_statsd_recorder(prefix: &str, metrics_config: Option<MetricsConfig>) {
    if let Some(MetricsConfig {
        statsd_host,
        statsd_port,
    }) = metrics_config
    {
        let recorder = StatsdBuilder::from(statsd_host, statsd_port)
            .build(Some(prefix))
            .expect("Could not create StatsdRecorder");

        metrics::set_global_recorder(recorder).expect("Could not set global metrics recorder")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_table_lists_every_defined_metric() {
        let table = generate_metrics_table();

        for m in proxy::metrics_defs::ALL_METRICS
            .iter()
            .chain(credstore::metrics_defs::ALL_METRICS)
        {
            assert!(table.contains(m.name), "table is missing {}", m.name);
        }
    }
}
