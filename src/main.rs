use std::{sync::Arc, time::Duration};

use clap::Parser;
use color_eyre::{eyre::WrapErr, Result};
use tokio::net::TcpListener;
use trellis::{
    access_log::{AccessLogSink, FileSink, StreamSink},
    adapters::RoutingApiAdapter,
    admin,
    config::{loader, RouterSettings},
    lifecycle::{ConnectionGauge, DrainSignal},
    metrics, net, tracing_setup, AccessLogger, ProxyEngine, ProxyServer, RouteRegistry,
};

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    #[clap(subcommand)]
    command: Option<Command>,

    /// Configuration file
    #[clap(short, long, default_value = "trellis.yml")]
    config: String,
}

#[derive(Parser, Debug)]
enum Command {
    /// Validate a configuration file and exit
    Validate {
        #[clap(short, long, default_value = "trellis.yml")]
        config: String,
    },
    /// Run the router (default)
    Serve {
        #[clap(short, long, default_value = "trellis.yml")]
        config: String,
    },
}

fn main() -> Result<()> {
    color_eyre::install()?;
    let args = Args::parse();

    match args.command {
        Some(Command::Validate { config }) => {
            loader::load_settings(&config)?;
            println!("{config}: ok");
            Ok(())
        }
        Some(Command::Serve { config }) => serve(&config),
        None => serve(&args.config),
    }
}

fn serve(config_path: &str) -> Result<()> {
    let settings = Arc::new(loader::load_settings(config_path)?);
    tracing_setup::init_tracing(&settings.logging)?;
    metrics::init_metrics();

    tracing::info!(config = config_path, "trellis starting");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .wrap_err("failed to build runtime")?
        .block_on(run(settings))
}

async fn run(settings: Arc<RouterSettings>) -> Result<()> {
    let registry = Arc::new(RouteRegistry::new(&settings));
    registry.clone().start_pruning_cycle();

    // Access-log pipeline: file sink and/or the structured log stream.
    let mut sinks: Vec<Box<dyn AccessLogSink>> = Vec::new();
    if !settings.access_log.file.is_empty() {
        sinks.push(Box::new(FileSink::open(&settings.access_log.file)?));
    }
    if settings.access_log.enable_streaming {
        sinks.push(Box::new(StreamSink));
    }
    let (access_logger, drainer) = AccessLogger::new(sinks);
    let drainer_task = tokio::spawn(drainer.run());

    let engine = Arc::new(ProxyEngine::new(
        registry.clone(),
        settings.clone(),
        access_logger.clone(),
    )?);

    let drain = Arc::new(DrainSignal::new());
    let gauge = ConnectionGauge::new();
    let server = Arc::new(ProxyServer::new(
        engine,
        registry.clone(),
        settings.clone(),
        drain.clone(),
        gauge.clone(),
    ));

    let listener = TcpListener::bind(("0.0.0.0", settings.port))
        .await
        .wrap_err_with(|| format!("failed to bind port {}", settings.port))?;
    let mut tasks = vec![tokio::spawn(server.clone().run(listener, None))];

    if let Some(tls) = &settings.tls {
        let acceptor = net::tls::build_acceptor(tls)?;
        let ssl_listener = TcpListener::bind(("0.0.0.0", settings.ssl_port))
            .await
            .wrap_err_with(|| format!("failed to bind ssl port {}", settings.ssl_port))?;
        tasks.push(tokio::spawn(
            server.clone().run(ssl_listener, Some(acceptor)),
        ));
    }

    let admin_listener = TcpListener::bind(("0.0.0.0", settings.status.port))
        .await
        .wrap_err_with(|| format!("failed to bind status port {}", settings.status.port))?;
    tokio::spawn(admin::serve(
        admin_listener,
        registry.clone(),
        settings.status.clone(),
    ));

    if settings.routing_api.enabled() {
        let adapter = RoutingApiAdapter::new(registry.clone(), &settings.routing_api);
        tokio::spawn(adapter.run());
    }

    // Periodically publish registry size for metrics.
    {
        let registry = registry.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(30));
            loop {
                ticker.tick().await;
                metrics::record_registry_size(registry.num_uris(), registry.num_endpoints());
            }
        });
    }

    wait_for_shutdown_signal().await;

    // Drain sequence: stop accepting, give the platform a moment to pull us
    // out of rotation, then wait (bounded) for in-flight requests.
    drain.drain();
    if !settings.drain_wait.is_zero() {
        tokio::time::sleep(settings.drain_wait).await;
    }
    if !gauge.wait_idle(settings.drain_timeout).await {
        tracing::warn!(
            active = gauge.active(),
            "drain timeout exceeded, closing remaining connections"
        );
    }

    registry.stop_pruning_cycle();
    access_logger.close();
    let _ = drainer_task.await;
    for task in tasks {
        task.abort();
    }

    tracing::info!("trellis stopped");
    Ok(())
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                tracing::error!(error = %e, "failed to register SIGTERM handler");
                let _ = ctrl_c.await;
                return;
            }
        };
        tokio::select! {
            _ = ctrl_c => tracing::info!("received SIGINT, draining"),
            _ = sigterm.recv() => tracing::info!("received SIGTERM, draining"),
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
        tracing::info!("received ctrl-c, draining");
    }
}
