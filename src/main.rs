use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
};

use anyhow::Context;
use clap::Parser;
use crossbeam_channel::bounded;
use fft_slurper::{
    capture::{NetworkSource, SampleSource},
    exfil::DataLogger,
    monitoring::{api, ControlHandle, Snapshot, SnapshotCell, COMMAND_CAPACITY},
    orchestrator::Orchestrator,
};
use tokio::sync::watch;
use tracing::{info, warn};

mod args;

fn main() -> anyhow::Result<()> {
    let args = args::Args::parse();
    tracing_subscriber::fmt()
        .with_max_level(args::convert_filter(args.verbose.log_level_filter()))
        .init();

    let config = args.orchestrator_config();
    config.validate()?;

    // Setup the recording directory
    let mut logger = DataLogger::new(&args.log_dir).with_container_support(!args.no_container);
    std::fs::create_dir_all(logger.directory())
        .with_context(|| format!("Creating log directory {}", logger.directory().display()))?;
    if let Some(threshold) = args.auto_record {
        logger.set_auto_record(true, threshold);
    }

    // Connect to the sample source up front so a bad address fails fast
    let source = match args.source {
        Some(addr) => {
            let mut source = NetworkSource::new(addr, args.protocol, args.read_timeout());
            source
                .connect()
                .with_context(|| format!("Opening sample source {}", source.describe()))?;
            Some(Box::new(source) as Box<dyn SampleSource>)
        }
        None => {
            info!("No network source configured, Network Input will synthesize a test tone");
            None
        }
    };

    // Shared state between the acquisition loop and the control surface
    let snapshot = Arc::new(SnapshotCell::new(Snapshot::initial(
        config.fft_size,
        config.sample_rate,
    )));
    let (cmd_s, cmd_r) = bounded(COMMAND_CAPACITY);
    let control = ControlHandle::new(cmd_s, snapshot.clone());
    let mut orchestrator = Orchestrator::new(config, source, Some(logger), cmd_r, snapshot)?;

    // Stop everything on ctrl-c
    let running = Arc::new(AtomicBool::new(true));
    let (shutdown_s, mut shutdown_r) = watch::channel(false);
    {
        let running = running.clone();
        ctrlc::set_handler(move || {
            warn!("Received exit signal, shutting down");
            running.store(false, Ordering::Release);
            let _ = shutdown_s.send(true);
        })?;
    }

    // Spawn the acquisition loop on its own thread
    let acquisition = {
        let running = running.clone();
        thread::Builder::new()
            .name("acquisition".to_owned())
            .spawn(move || orchestrator.run(&running))?
    };

    // And serve the control surface from this one
    let addr = args.http_addr();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let served = runtime.block_on(async move {
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("Binding control surface to {}", addr))?;
        info!(%addr, "Control surface listening");
        axum::serve(listener, api::router(control))
            .with_graceful_shutdown(async move {
                let _ = shutdown_r.wait_for(|stop| *stop).await;
            })
            .await
            .context("Control surface failed")
    });

    // Whatever happened to the server, let the loop close its recording
    running.store(false, Ordering::Release);
    if acquisition.join().is_err() {
        warn!("Acquisition thread panicked");
    }
    served
}
