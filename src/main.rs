use anyhow::Context;
use clap::Parser;
use mirror::cli::Cli;
use mirror::output::{ErrorMessage, StatusMessage};
use mirror::{
    check_locations, default_jobs, install_signal_handler, open_client, progress_for, Clients,
    Config, DisplayConfig, Location, MirrorJob, MirrorOptions, MirrorSummary, OutputMode, Progress,
    Session, Shutdown, StorageClient, INTERRUPTED_EXIT_CODE,
};
use std::io::IsTerminal;
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let display = cli.display(std::io::stdout().is_terminal());
    init_tracing(display.debug);

    if let Err(message) = cli.validate() {
        report_fatal(&display, &anyhow::anyhow!(message));
        return ExitCode::from(1);
    }

    let progress = progress_for(&display);
    let shutdown = Shutdown::new();
    let _signals = install_signal_handler(shutdown.clone());

    let summary = match run(&cli, progress.clone(), shutdown).await {
        Ok(summary) => summary,
        Err(e) => {
            progress.finish();
            report_fatal(&display, &e);
            return ExitCode::from(1);
        }
    };

    let totals = progress.finish();
    match display.mode {
        OutputMode::Json => print_json_summary(&summary),
        OutputMode::Plain | OutputMode::Quiet => println!("{}", totals),
    }
    if let Some(dir) = &summary.session_dir {
        eprintln!(
            "mirror: session saved in {}; run the same command again to resume.",
            dir.display()
        );
    }

    if summary.interrupted {
        ExitCode::from(INTERRUPTED_EXIT_CODE)
    } else if summary.failed > 0 {
        ExitCode::from(1)
    } else {
        ExitCode::SUCCESS
    }
}

async fn run(cli: &Cli, progress: Arc<dyn Progress>, shutdown: Shutdown) -> anyhow::Result<MirrorSummary> {
    let config_path = cli.config.clone().or_else(Config::default_path);
    let config = match &config_path {
        Some(path) => Config::load(path).with_context(|| format!("cannot load {}", path.display()))?,
        None => Config::default(),
    };

    let cwd = std::env::current_dir().context("cannot determine current directory")?;
    let source = Location::resolve(&cli.source, &config, &cwd)?;
    let targets = cli
        .targets
        .iter()
        .map(|raw| Location::resolve(raw, &config, &cwd))
        .collect::<mirror::Result<Vec<_>>>()?;

    let source_client = open_client(&source).with_context(|| format!("cannot open '{}'", source))?;
    let target_clients = targets
        .iter()
        .map(|target| open_client(target).with_context(|| format!("cannot open '{}'", target)))
        .collect::<anyhow::Result<Vec<Arc<dyn StorageClient>>>>()?;
    let clients = Arc::new(Clients::new(source_client, target_clients));
    check_locations(&clients).await?;

    let options = MirrorOptions {
        policy: cli.policy(),
        watch: cli.watch,
        jobs: cli.jobs.unwrap_or_else(default_jobs),
    };
    let mut job = MirrorJob::new(clients, options, progress);
    if !cli.watch && !cli.fake {
        job = job.with_sessions(Session::state_dir()?);
    }
    job.run(shutdown).await
}

fn init_tracing(debug: bool) {
    let filter = if debug {
        EnvFilter::new("mirror=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .try_init();
}

fn report_fatal(display: &DisplayConfig, error: &anyhow::Error) {
    let cause = error.root_cause().to_string();
    let message = ErrorMessage::new(error.to_string(), cause);
    let message = StatusMessage::Error(message);
    match display.mode {
        OutputMode::Json => eprintln!("{}", message.json()),
        OutputMode::Plain | OutputMode::Quiet => eprintln!("{}", message.render(display.color)),
    }
}

fn print_json_summary(summary: &MirrorSummary) {
    let mut record = match serde_json::to_value(summary) {
        Ok(value) => value,
        Err(e) => {
            tracing::warn!("Cannot encode summary: {}", e);
            return;
        }
    };
    if let Some(fields) = record.as_object_mut() {
        fields.insert("status".to_string(), serde_json::Value::from("summary"));
    }
    println!("{}", record);
}
