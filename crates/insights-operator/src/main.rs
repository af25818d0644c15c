// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::{env, path::PathBuf, process::ExitCode, sync::Arc};

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use insights_agent::{
    anonymization::Anonymizer,
    archive::DiskStorage,
    cluster::MemoryCluster,
    config::{
        aggregator::ConfigAggregator, get_config, observer::ConfigObserver, Config,
        DEFAULT_CONFIG_PATH,
    },
    controllerstatus::StatusSource,
    datagather::{
        controller::OnDemandController,
        gather_job::GatherJob,
        job::{JobController, DATAGATHER_NAME_ENV},
    },
    gather::{clusterconfig::ClusterConfigGatherer, GatherSelection, Gatherer},
    insights::{
        report::ReportRetriever,
        uploader::{report_to_logs, ReportedTime, Uploader},
        InsightsClient,
    },
    ocm::{sca::ScaPuller, transfer::TransferPuller},
    periodic::PeriodicController,
    process::ProcessContext,
    receiver::{self, DEFAULT_LISTEN_ADDRESS},
    recorder::Recorder,
    status::StatusController,
};

const LOG_LEVEL_ENV: &str = "INSIGHTS_LOG_LEVEL";

#[derive(Parser, Debug)]
#[command(name = "insights-operator")]
#[command(version, about = "Gathers cluster health data and reports it upstream", long_about = None)]
struct Cli {
    /// Operator configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Cluster snapshot (YAML) the agent reads its resources from
    #[arg(long, global = true)]
    kubeconfig: Option<PathBuf>,

    /// Log verbosity, 4 enables debug and 6 trace
    #[arg(short = 'v', global = true, default_value_t = 0)]
    verbosity: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the operator until interrupted
    Start,

    /// Gather once and keep the archive on disk
    Gather,

    /// Gather once for the request named in DATAGATHER_NAME and upload the archive
    GatherAndUpload,

    /// Accept archive uploads and log their content
    StartReceiver {
        /// Address to listen on
        #[arg(long, default_value = DEFAULT_LISTEN_ADDRESS)]
        listen: String,
    },
}

#[tokio::main]
pub async fn main() -> ExitCode {
    let cli = Cli::parse();

    let log_level = env::var(LOG_LEVEL_ENV)
        .map(|val| val.to_lowercase())
        .unwrap_or("info".to_string());
    let env_filter = format!(
        "h2=off,hyper=off,rustls=off,{}",
        log_level_for(&log_level, cli.verbosity)
    );

    #[allow(clippy::expect_used)]
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(env_filter).expect("could not parse log level in configuration"),
        )
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .without_time()
        .finish();

    #[allow(clippy::expect_used)]
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    debug!("Logging subsystem enabled");

    let result = match cli.command {
        Commands::Start => start(&cli.config, cli.kubeconfig.as_deref()).await,
        Commands::Gather => gather(&cli.config, cli.kubeconfig.as_deref()).await,
        Commands::GatherAndUpload => {
            gather_and_upload(&cli.config, cli.kubeconfig.as_deref()).await
        }
        Commands::StartReceiver { listen } => start_receiver(&listen).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

/// `-v` wins over the environment once it asks for debug output.
fn log_level_for(configured: &str, verbosity: u8) -> String {
    match verbosity {
        v if v >= 6 => "trace".to_string(),
        v if v >= 4 => "debug".to_string(),
        _ => configured.to_string(),
    }
}

fn load_cluster(kubeconfig: Option<&std::path::Path>) -> Result<Arc<MemoryCluster>> {
    let cluster = match kubeconfig {
        Some(path) => MemoryCluster::from_snapshot_file(path)
            .with_context(|| format!("unable to load cluster from {}", path.display()))?,
        None => {
            info!("No --kubeconfig given, starting with an empty cluster");
            MemoryCluster::new()
        }
    };
    Ok(Arc::new(cluster))
}

/// Components shared by every gathering command.
struct Agent {
    config: Config,
    cluster: Arc<MemoryCluster>,
    configurator: Arc<ConfigAggregator>,
    observer: Arc<ConfigObserver>,
    client: Arc<InsightsClient>,
    storage: Arc<DiskStorage>,
    process: ProcessContext,
}

impl Agent {
    async fn new(config_path: &std::path::Path, kubeconfig: Option<&std::path::Path>) -> Result<Self> {
        let process = ProcessContext::init().context("unable to register metrics")?;
        let config = get_config(config_path);
        debug!("Operator configuration: {config:?}");
        let cluster = load_cluster(kubeconfig)?;

        let configurator = Arc::new(ConfigAggregator::new(config.to_insights_configuration()));
        let observer = Arc::new(ConfigObserver::new(
            Arc::clone(&configurator),
            cluster.clone(),
            cluster.clone(),
        ));
        observer.refresh_all().await;

        let client = Arc::new(
            InsightsClient::new(
                cluster.clone(),
                Arc::clone(&configurator),
                process.metrics().clone(),
            )
            .with_release_version(config.release_version.clone())
            .with_cluster_id(config.cluster_id.clone()),
        );
        let storage = Arc::new(DiskStorage::new(config.storage_path.clone()));

        Ok(Self {
            config,
            cluster,
            configurator,
            observer,
            client,
            storage,
            process,
        })
    }

    fn periodic(&self) -> Result<PeriodicController> {
        let anonymizer = Anonymizer::disabled().context("unable to build the anonymizer")?;
        let recorder = Recorder::new(
            self.storage.clone(),
            self.configurator.config().data_reporting.interval,
            Arc::new(anonymizer),
        );
        let gatherers: Vec<Arc<dyn Gatherer>> =
            vec![Arc::new(ClusterConfigGatherer::new(self.cluster.clone()))];
        let selection = GatherSelection {
            enabled: self.config.gatherers.clone(),
            disabled: Vec::new(),
        };
        Ok(PeriodicController::new(
            Arc::clone(&self.configurator),
            Arc::new(recorder),
            self.cluster.clone(),
            gatherers,
        )
        .with_selection(selection)
        .with_workers(self.config.workers)
        .with_secrets(self.cluster.clone()))
    }
}

async fn start(config_path: &std::path::Path, kubeconfig: Option<&std::path::Path>) -> Result<()> {
    let agent = Agent::new(config_path, kubeconfig).await?;
    info!("Starting insights-operator");

    let periodic = Arc::new(agent.periodic()?);
    let status = Arc::new(
        StatusController::new(
            agent.cluster.clone(),
            Arc::clone(&agent.configurator),
            &agent.config.namespace,
        )
        .with_release_version(agent.config.release_version.clone()),
    );
    let uploader = Arc::new(Uploader::new(
        agent.storage.clone(),
        Arc::clone(&agent.client),
        Arc::clone(&agent.configurator),
        status.clone(),
    ));
    let report = Arc::new(ReportRetriever::new(
        Arc::clone(&agent.client),
        Arc::clone(&agent.configurator),
    ));
    let sca = Arc::new(ScaPuller::new(
        agent.cluster.clone(),
        agent.cluster.clone(),
        Arc::clone(&agent.client),
        Arc::clone(&agent.configurator),
    ));
    let transfer = Arc::new(TransferPuller::new(
        agent.cluster.clone(),
        Arc::clone(&agent.client),
        Arc::clone(&agent.configurator),
    ));

    status.add_sources(periodic.sources());
    let sources: [Arc<dyn StatusSource>; 5] = [
        agent.observer.status(),
        uploader.status(),
        report.status(),
        sca.status(),
        transfer.status(),
    ];
    status.add_sources(sources);

    let initial_delay = status
        .start()
        .await
        .context("unable to write the initial operator status")?;

    let cancel = CancellationToken::new();
    let mut tasks = JoinSet::new();
    {
        let observer = Arc::clone(&agent.observer);
        let cancel = cancel.clone();
        tasks.spawn(async move { observer.run(cancel).await });
    }
    {
        let periodic = Arc::clone(&periodic);
        let cancel = cancel.clone();
        tasks.spawn(async move { periodic.run(cancel, initial_delay).await });
    }
    {
        let recorder = Arc::clone(periodic.recorder());
        let status = status.clone();
        let cancel = cancel.clone();
        tasks.spawn(async move { recorder.periodically_prune(cancel, status).await });
    }
    if let Some(archive_uploaded) = uploader.take_archive_uploaded() {
        let report = Arc::clone(&report);
        let cancel = cancel.clone();
        tasks.spawn(async move { report.run(cancel, archive_uploaded).await });
    }
    {
        let uploader = Arc::clone(&uploader);
        let cancel = cancel.clone();
        tasks.spawn(async move { uploader.run(cancel, initial_delay).await });
    }
    {
        let sca = Arc::clone(&sca);
        let cancel = cancel.clone();
        tasks.spawn(async move { sca.run(cancel).await });
    }
    {
        let transfer = Arc::clone(&transfer);
        let cancel = cancel.clone();
        tasks.spawn(async move { transfer.run(cancel).await });
    }
    {
        let status = status.clone();
        let cancel = cancel.clone();
        tasks.spawn(async move { status.run(cancel).await });
    }

    match agent.config.image.clone() {
        Some(image) => {
            let on_demand = Arc::new(OnDemandController::new(
                agent.cluster.clone(),
                JobController::new(agent.cluster.clone()),
                Arc::clone(&agent.configurator),
                image,
                uploader.status(),
            ));
            match on_demand.abort_in_progress().await {
                Ok(0) => {}
                Ok(aborted) => info!("Aborted {aborted} on-demand gatherings left by a previous run"),
                Err(e) => error!("Unable to abort the on-demand gatherings in progress: {e}"),
            }
            {
                let on_demand = Arc::clone(&on_demand);
                let cancel = cancel.clone();
                tasks.spawn(async move { on_demand.periodically_prune(cancel).await });
            }
            let cancel = cancel.clone();
            tasks.spawn(async move { on_demand.run(cancel).await });
        }
        None => info!("No gathering image configured, on-demand gathering is disabled"),
    }

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                error!("Unable to listen for the shutdown signal: {e}");
            }
            info!("Shutting down");
        }
        Some(finished) = tasks.join_next() => {
            if let Err(e) = finished {
                error!("A controller stopped unexpectedly: {e}");
            }
        }
    }
    cancel.cancel();
    shutdown(&mut tasks, periodic.recorder()).await;
    agent.process.teardown();
    Ok(())
}

/// Waits for every controller to stop, then writes whatever the recorder still holds.
async fn shutdown(tasks: &mut JoinSet<()>, recorder: &Recorder) {
    while let Some(finished) = tasks.join_next().await {
        if let Err(e) = finished {
            error!("A controller failed while stopping: {e}");
        }
    }
    match recorder.flush().await {
        Ok(Some(saved)) => info!("Flushed {} pending records on shutdown", saved.saved.len()),
        Ok(None) => {}
        Err(e) => error!("Unable to flush pending records on shutdown: {e}"),
    }
}

async fn gather(config_path: &std::path::Path, kubeconfig: Option<&std::path::Path>) -> Result<()> {
    let agent = Agent::new(config_path, kubeconfig).await?;
    let periodic = agent.periodic()?;
    let selection = GatherSelection {
        enabled: agent.config.gatherers.clone(),
        disabled: Vec::new(),
    };

    let report = periodic
        .run_cycle(&CancellationToken::new(), &selection)
        .await
        .context("unable to write the archive")?;
    for (gatherer, e) in &report.failed {
        error!("Gatherer {gatherer} failed: {e}");
    }
    match report.archive {
        Some(archive) => {
            info!(
                "Wrote {} records to {}",
                archive.saved.len(),
                archive.path.display()
            );
            report_to_logs(&archive.path).context("unable to read back the archive")?;
        }
        None => info!("Nothing was gathered"),
    }
    agent.process.teardown();
    Ok(())
}

async fn gather_and_upload(
    config_path: &std::path::Path,
    kubeconfig: Option<&std::path::Path>,
) -> Result<()> {
    let name = env::var(DATAGATHER_NAME_ENV)
        .ok()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| anyhow!("{DATAGATHER_NAME_ENV} is not set"))?;
    let agent = Agent::new(config_path, kubeconfig).await?;

    let uploader = Uploader::new(
        agent.storage.clone(),
        Arc::clone(&agent.client),
        Arc::clone(&agent.configurator),
        Arc::new(ReportedTime::default()),
    );
    let job = GatherJob::new(
        agent.cluster.clone(),
        agent.periodic()?,
        Arc::clone(&agent.storage),
        uploader,
        Arc::clone(&agent.client),
        Arc::clone(&agent.configurator),
    );

    let data_gather = job
        .gather_and_upload(&name, &CancellationToken::new())
        .await
        .with_context(|| format!("gathering for {name} failed"))?;
    info!(
        "Gathering for {name} finished, insights request id {}",
        data_gather.status.insights_request_id
    );
    agent.process.teardown();
    Ok(())
}

async fn start_receiver(listen: &str) -> Result<()> {
    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            shutdown.cancel();
        }
    });
    receiver::serve(listen, cancel)
        .await
        .with_context(|| format!("receiver on {listen} failed"))
}
