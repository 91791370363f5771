use std::io::{IsTerminal, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use argh::FromArgs;
use consul_sd::catalog::Client;
use consul_sd::config::Config;
use consul_sd::stats::RegistryMetrics;
use consul_sd::{Discovery, TargetGroup, trace};
use exitcode::ExitCode;
use metrics::{Attributes, Observation, Registry, Reporter};
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tripwire::Tripwire;

/// How many batches may wait for stdout before watchers block.
const OUTPUT_BUFFER: usize = 128;

#[derive(FromArgs)]
#[argh(
    description = "Watch the Consul catalog and print discovered targets as JSON lines",
    help_triggers("-h", "--help")
)]
struct RootCommand {
    #[argh(switch, short = 'v', description = "show version")]
    version: bool,

    #[argh(option, short = 'c', long = "config", description = "read configuration from file")]
    config: Option<PathBuf>,

    #[argh(
        option,
        short = 'l',
        default = "\"info\".to_string()",
        description = "log level"
    )]
    log_level: String,

    #[argh(switch, description = "output logs in JSON format")]
    json: bool,

    #[argh(
        option,
        short = 't',
        default = "2",
        description = "specify how many threads the Tokio runtime will use"
    )]
    threads: usize,
}

impl RootCommand {
    #![allow(clippy::print_stdout)]
    fn show_version(&self) {
        println!("consul-sd {}", env!("CARGO_PKG_VERSION"));
    }

    fn run(&self) -> Result<(), ExitCode> {
        if self.version {
            self.show_version();
            return Ok(());
        }

        let log_level =
            std::env::var("CONSUL_SD_LOG").unwrap_or_else(|_| trace::levels(&self.log_level));
        let color = std::io::stderr().is_terminal();
        trace::init(color, self.json, &log_level);

        let Some(path) = &self.config else {
            error!(message = "no config file specified, use --config");
            return Err(exitcode::USAGE);
        };
        let config = Config::load(path).map_err(|err| {
            error!(message = "load config failed", ?path, %err);
            exitcode::CONFIG
        })?;

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .thread_name("consul-sd-worker")
            .worker_threads(self.threads.max(1))
            .enable_io()
            .enable_time()
            .build()
            .map_err(|err| {
                error!(message = "build tokio runtime failed", %err);
                exitcode::OSERR
            })?;

        let result = runtime.block_on(serve(config));
        runtime.shutdown_timeout(Duration::from_secs(5));

        result
    }
}

async fn serve(config: Config) -> Result<(), ExitCode> {
    let client = Client::new(&config).map_err(|err| {
        error!(message = "build consul client failed", %err);
        exitcode::CONFIG
    })?;

    let mut sigint = signal(SignalKind::interrupt()).map_err(|err| {
        error!(message = "failed to set up SIGINT handler", %err);
        exitcode::OSERR
    })?;
    let mut sigterm = signal(SignalKind::terminate()).map_err(|err| {
        error!(message = "failed to set up SIGTERM handler", %err);
        exitcode::OSERR
    })?;

    info!(
        message = "start consul discovery",
        server = %client.endpoint(),
        services = ?config.services,
        tag = ?config.watched_tag(),
    );

    let registry = Registry::new();
    let (trigger, tripwire) = Tripwire::new("root");
    let (tx, mut rx) = mpsc::channel(OUTPUT_BUFFER);
    let discovery = Discovery::new(&config, client)
        .with_metrics(Arc::new(RegistryMetrics::new(&registry)));
    let handle = tokio::spawn(discovery.run(tripwire, tx));

    let result = loop {
        tokio::select! {
            batch = rx.recv() => match batch {
                Some(batch) => {
                    if let Err(err) = write_batch(&mut std::io::stdout().lock(), &batch) {
                        error!(message = "write targets to stdout failed", %err);
                        break Err(exitcode::IOERR);
                    }
                }
                None => break Ok(()),
            },

            _ = sigint.recv() => {
                info!(message = "Signal received", signal = "SIGINT");
                break Ok(());
            }

            _ = sigterm.recv() => {
                info!(message = "Signal received", signal = "SIGTERM");
                break Ok(());
            }
        }
    };

    trigger.cancel();
    drop(rx);
    if let Err(err) = handle.await {
        warn!(message = "discovery task failed", %err);
    }

    registry.report(&mut LogReporter::default());
    info!(message = "consul discovery stopped");

    result
}

fn write_batch(writer: &mut impl Write, batch: &[TargetGroup]) -> std::io::Result<()> {
    serde_json::to_writer(&mut *writer, batch)?;
    writer.write_all(b"\n")?;
    writer.flush()
}

/// Logs the final value of every series.
#[derive(Default)]
struct LogReporter {
    metric: &'static str,
}

impl Reporter for LogReporter {
    fn start_metric(&mut self, name: &'static str, _description: &'static str) {
        self.metric = name;
    }

    fn report(&mut self, attrs: &Attributes, observation: Observation) {
        let attrs = attrs
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect::<Vec<_>>()
            .join(",");

        match observation {
            Observation::Counter(value) => {
                info!(message = "rpc stats", metric = self.metric, %attrs, value)
            }
            Observation::Histogram(histogram) => info!(
                message = "rpc stats",
                metric = self.metric,
                %attrs,
                count = histogram.count(),
                sum = histogram.sum
            ),
        }
    }

    fn finish_metric(&mut self) {}
}

fn main() {
    let opts: RootCommand = argh::from_env();

    if let Err(code) = opts.run() {
        std::process::exit(code)
    }
}
