use std::sync::Arc;

use structopt::StructOpt;
use tokio_util::sync::CancellationToken;

use promgather::sink::LineProtocolSink;
use promgather::{Gatherer, PrometheusConfig};

#[derive(StructOpt, Debug)]
pub struct Command {
    #[structopt(flatten)]
    pub prometheus: PrometheusConfig,

    /// Time between gather cycles.
    #[structopt(long, default_value = "10s", parse(try_from_str = humantime::parse_duration))]
    pub interval: std::time::Duration,

    /// Gather once and exit.
    #[structopt(long)]
    pub once: bool,

    #[structopt(long, default_value = "info")]
    pub log_level: tracing::Level,
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    // parse the command line args
    let opt: Command = Command::from_args();

    // logs go to stderr, stdout carries the records
    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_max_level(opt.log_level)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let mut gatherer = Gatherer::from_config(&opt.prometheus)?;
    if let Err(e) = gatherer.start() {
        tracing::warn!("{}", e);
    }

    let sink = Arc::new(LineProtocolSink::new(std::io::stdout()));

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutting down");
            shutdown.cancel();
        }
    });

    let mut interval = tokio::time::interval(opt.interval);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }

        match gatherer.gather(sink.clone(), &cancel).await {
            Ok(report) => {
                if let Some(errors) = report.error() {
                    tracing::warn!("{}", errors);
                }
            }
            Err(e) => {
                tracing::error!("{}", e);
                if opt.once {
                    return Err(e.into());
                }
            }
        }

        if opt.once {
            break;
        }
    }

    Ok(())
}
