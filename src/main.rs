//! Volume Failover Operator
//!
//! Runs the node-failure pod eviction controller against the cluster the
//! process is configured for (in-cluster service account or kubeconfig).

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim};
use kube::Api;
use volume_failover_operator::datastore::{spawn_mirror, spawn_pod_mirror};
use volume_failover_operator::{
    ConfigMapSettingsStore, ControllerMetrics, KubeNodeHealth, KubePodDeleter,
    KubernetesPodController, LoggingErrorSink, ObjectMirror, OperatorConfig, PodControllerDeps,
    Result,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Volume Failover Operator - force-deletes pods stuck on downed nodes
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Optional YAML configuration file
    #[arg(long, env = "CONFIG_FILE")]
    config: Option<PathBuf>,

    /// CSI driver whose volumes are watched
    #[arg(long, env = "DRIVER_NAME")]
    driver_name: Option<String>,

    /// Number of reconciliation workers
    #[arg(long, env = "WORKERS")]
    workers: Option<usize>,

    /// Namespace of the settings ConfigMap
    #[arg(long, env = "SETTINGS_NAMESPACE")]
    settings_namespace: Option<String>,

    /// Name of the settings ConfigMap
    #[arg(long, env = "SETTINGS_CONFIG_MAP")]
    settings_config_map: Option<String>,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR")]
    health_addr: Option<String>,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR")]
    metrics_addr: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

impl Args {
    /// File (or default) configuration with command-line overrides applied
    fn operator_config(&self) -> Result<OperatorConfig> {
        let mut config = match &self.config {
            Some(path) => OperatorConfig::from_yaml_file(path)?,
            None => OperatorConfig::default(),
        };

        if let Some(driver_name) = &self.driver_name {
            config.controller.driver_name = driver_name.clone();
        }
        if let Some(workers) = self.workers {
            config.controller.workers = workers;
        }
        if let Some(namespace) = &self.settings_namespace {
            config.settings.namespace = namespace.clone();
        }
        if let Some(config_map) = &self.settings_config_map {
            config.settings.config_map = config_map.clone();
        }
        if let Some(addr) = &self.health_addr {
            config.server.health_addr = addr.clone();
        }
        if let Some(addr) = &self.metrics_addr {
            config.server.metrics_addr = addr.clone();
        }

        config.validate()?;
        Ok(config)
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    init_logging(&args);

    let config = args.operator_config()?;

    info!("Starting Volume Failover Operator");
    info!("  Version: {}", volume_failover_operator::VERSION);
    info!("  Driver: {}", config.controller.driver_name);
    info!("  Workers: {}", config.controller.workers);
    info!(
        "  Settings: {}/{}",
        config.settings.namespace, config.settings.config_map
    );

    let metrics = ControllerMetrics::new()?;
    metrics.register(prometheus::default_registry())?;

    let client = kube::Client::try_default().await?;
    let shutdown = CancellationToken::new();

    // Mirrors
    let (pods, pod_events, pod_watch) = spawn_pod_mirror(client.clone(), shutdown.clone());
    let (pvs, pv_watch) = spawn_mirror(
        Api::<PersistentVolume>::all(client.clone()),
        "PersistentVolume",
        shutdown.clone(),
        |_| {},
    );
    let (pvcs, pvc_watch) = spawn_mirror(
        Api::<PersistentVolumeClaim>::all(client.clone()),
        "PersistentVolumeClaim",
        shutdown.clone(),
        |_| {},
    );

    let deps = PodControllerDeps {
        pods: pods.clone(),
        pvs: pvs.clone(),
        pvcs: pvcs.clone(),
        deleter: Arc::new(KubePodDeleter::new(client.clone())),
        settings: Arc::new(ConfigMapSettingsStore::new(
            client.clone(),
            &config.settings.namespace,
            config.settings.config_map.clone(),
        )),
        node_health: Arc::new(KubeNodeHealth::new(client.clone())),
        error_sink: Arc::new(LoggingErrorSink),
    };
    let controller = KubernetesPodController::new(config.controller.clone(), deps, metrics);

    // Start health server
    let health_addr = config.health_addr()?;
    let ready: ReadinessCheck =
        Arc::new(move || pods.has_synced() && pvs.has_synced() && pvcs.has_synced());
    tokio::spawn(async move {
        if let Err(e) = run_health_server(health_addr, ready).await {
            error!("Health server error: {}", e);
        }
    });

    // Start metrics server
    let metrics_addr = config.metrics_addr()?;
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(metrics_addr).await {
            error!("Metrics server error: {}", e);
        }
    });

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        signal_token.cancel();
    });

    controller.run(pod_events, shutdown.clone()).await?;

    for handle in [pod_watch, pv_watch, pvc_watch] {
        if let Err(e) = handle.await {
            warn!("Watcher task failed: {}", e);
        }
    }

    info!("Operator shutdown complete");
    Ok(())
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    info!("Received shutdown signal");
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "kube=info", "tower=warn"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}

// =============================================================================
// Health Server
// =============================================================================

type ReadinessCheck = Arc<dyn Fn() -> bool + Send + Sync>;

fn text_response(status: hyper::StatusCode, body: &'static str) -> hyper::Response<hyper::Body> {
    let mut response = hyper::Response::new(hyper::Body::from(body));
    *response.status_mut() = status;
    response
}

async fn run_health_server(addr: SocketAddr, ready: ReadinessCheck) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Server, StatusCode};

    let make_svc = make_service_fn(move |_conn| {
        let ready = ready.clone();
        async move {
            Ok::<_, std::convert::Infallible>(service_fn(move |req: Request<Body>| {
                let ready = ready.clone();
                async move {
                    let response = match req.uri().path() {
                        "/healthz" | "/livez" => text_response(StatusCode::OK, "ok"),
                        "/readyz" if ready() => text_response(StatusCode::OK, "ok"),
                        "/readyz" => {
                            text_response(StatusCode::SERVICE_UNAVAILABLE, "caches not synced")
                        }
                        _ => text_response(StatusCode::NOT_FOUND, "not found"),
                    };
                    Ok::<_, std::convert::Infallible>(response)
                }
            }))
        }
    });

    info!("Health server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| volume_failover_operator::Error::Internal(format!("Health server error: {}", e)))?;

    Ok(())
}

// =============================================================================
// Metrics Server
// =============================================================================

async fn run_metrics_server(addr: SocketAddr) -> Result<()> {
    use hyper::header::{HeaderValue, CONTENT_TYPE};
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Response, Server, StatusCode};
    use prometheus::{Encoder, TextEncoder};

    let make_svc = make_service_fn(|_conn| async {
        Ok::<_, std::convert::Infallible>(service_fn(|req: Request<Body>| async move {
            let response = match req.uri().path() {
                "/metrics" => {
                    let encoder = TextEncoder::new();
                    let metric_families = prometheus::gather();
                    let mut buffer = Vec::new();
                    match encoder.encode(&metric_families, &mut buffer) {
                        Ok(()) => {
                            let mut response = Response::new(Body::from(buffer));
                            if let Ok(content_type) = HeaderValue::from_str(encoder.format_type()) {
                                response.headers_mut().insert(CONTENT_TYPE, content_type);
                            }
                            response
                        }
                        Err(e) => {
                            warn!("Failed to encode metrics: {}", e);
                            text_response(StatusCode::INTERNAL_SERVER_ERROR, "encoding failed")
                        }
                    }
                }
                _ => text_response(StatusCode::NOT_FOUND, "not found"),
            };
            Ok::<_, std::convert::Infallible>(response)
        }))
    });

    info!("Metrics server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| volume_failover_operator::Error::Internal(format!("Metrics server error: {}", e)))?;

    Ok(())
}
