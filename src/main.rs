use activity_harvester_app::{Args, Command};
use clap::Parser;
use harvester::api::Error;
use log::error;

#[tokio::main]
async fn main() -> Result<(), Error> {
    dotenv::dotenv().ok();
    env_logger::try_init().map_err(anyhow::Error::from)?;
    let args = Args::parse();

    let result = match args.command {
        Command::Contributors => activity_harvester_app::harvest_contributors(&args).await.map(|report| {
            println!(
                "{} repositories harvested, {} already done",
                report.processed.len(),
                report.skipped.len()
            );
            for line in activity_harvester_app::render_buckets(&report.record.state, args.bucket, args.detail) {
                println!("{}", line);
            }
        }),
        Command::Stats => activity_harvester_app::repository_stats(&args).await.map(|report| {
            println!("{}", report.totals);
            for line in report.history.lines() {
                println!("{}", line);
            }
        }),
    };
    if let Err(err) = &result {
        error!("Run aborted: {}", err);
    }
    result
}
