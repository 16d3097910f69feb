use std::env;
use std::io::Write;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use env_logger::Builder;
use log::{self, LevelFilter, debug, error, info};
use rnaseq_relay::cli::parse;
use rnaseq_relay::config::defs::{PipelineError, RunConfig};
use rnaseq_relay::pipelines::{rna_seq, server, submit};
use rnaseq_relay::utils::system::detect_cores;


#[tokio::main]
async fn main() -> Result<()> {
    let run_start = Instant::now();

    let args = parse();

    let log_level = if args.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    Builder::new()
        .filter_level(log_level)
        .format(|buf, record| {
            writeln!(
                buf,
                "[{}] {}: {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                record.level(),
                record.args()
            )
        })
        .init();

    println!("\n-------------\n rnaseq-relay\n-------------\n");

    let dir = env::current_dir()?;
    info!("The current directory is {:?}", dir);

    let threads = detect_cores(args.threads);
    debug!("Using up to {} threads per external tool", threads);

    let module = args.module.clone();
    let run_config = Arc::new(RunConfig::new(args, dir, threads));

    if let Err(e) = match module.as_str() {
        "submit" => submit::run(run_config).await,
        "serve" => server::run(run_config).await,
        "run" => rna_seq::run(run_config).await,
        _ => Err(PipelineError::InvalidConfig(format!("Invalid module: {}", module))),
    } {
        error!("Pipeline failed: {} at {} milliseconds.", e, run_start.elapsed().as_millis());
        std::process::exit(1);
    }

    println!("Run complete: {} milliseconds.", run_start.elapsed().as_millis());
    Ok(())
}
