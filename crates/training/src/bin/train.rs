use clap::Parser;
use training::{run, TrainArgs};

fn main() -> anyhow::Result<()> {
    let args = TrainArgs::parse();
    let level: tracing::Level = args.log_level.parse()?;
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .init();

    let cfg = args.resolve()?;
    let report = run(&cfg)?;
    tracing::info!(
        samples = report.dataset_len,
        writes = report.checkpoint_writes,
        "That's it! Weights at {}",
        report.checkpoint.display()
    );
    Ok(())
}
