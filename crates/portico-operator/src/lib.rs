//! Portico operator
//!
//! Command-line configuration and wiring for the `portico` binary. Kept in a
//! library so the argument handling can be tested without a cluster.

#![deny(missing_docs)]

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use kube::Client;
use portico_common::retry::{retry_with_backoff, RetryConfig};
use portico_common::telemetry::TelemetryConfig;
use portico_common::{KubeEventPublisher, PathType, CONTROLLER_NAME};
use portico_ingress::{
    IngressReconciler, IngressSettings, IngressTemplate, KubeChangeFeed, KubeStoreClient,
};
use portico_runtime::{Controller, ControllerConfig};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Portico - creates an Ingress for every annotated Service
#[derive(Parser, Debug, Clone, PartialEq)]
#[command(name = "portico", version, about, long_about = None)]
pub struct Args {
    /// Only watch this namespace (all namespaces when unset)
    #[arg(long, env = "WATCH_NAMESPACE")]
    pub namespace: Option<String>,

    /// Number of concurrent reconcile workers
    #[arg(long, env = "WORKER_COUNT", default_value_t = 5)]
    pub workers: usize,

    /// Retries per key before it is dropped
    #[arg(long, env = "MAX_RETRY", default_value_t = 10)]
    pub max_retry: u32,

    /// Annotation whose presence on a Service requests an Ingress
    #[arg(long, env = "INGRESS_ANNOTATION", default_value = portico_ingress::DEFAULT_ANNOTATION)]
    pub annotation: String,

    /// IngressClass of generated Ingresses
    #[arg(long, env = "INGRESS_CLASS", default_value = "nginx")]
    pub ingress_class: String,

    /// Host of the generated rule
    #[arg(long, env = "INGRESS_HOST", default_value = "example.com")]
    pub host: String,

    /// Path of the generated rule (Prefix match)
    #[arg(long, env = "INGRESS_PATH", default_value = "/")]
    pub path: String,

    /// Service port the generated backend targets
    #[arg(long, env = "SERVICE_PORT", default_value_t = 80)]
    pub service_port: i32,

    /// Re-reconcile every Service this often (seconds); 0 disables resync
    #[arg(long, env = "RESYNC_SECONDS", default_value_t = 0)]
    pub resync_seconds: u64,

    /// Emit JSON log lines
    #[arg(long, env = "LOG_JSON")]
    pub log_json: bool,

    /// OTLP endpoint for traces and metrics
    #[arg(long, env = "OTEL_EXPORTER_OTLP_ENDPOINT")]
    pub otlp_endpoint: Option<String>,
}

impl Args {
    /// Controller tunables
    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            worker_count: self.workers,
            max_retry: self.max_retry,
            resync_period: (self.resync_seconds > 0)
                .then(|| Duration::from_secs(self.resync_seconds)),
            ..Default::default()
        }
    }

    /// Reconciler inputs
    pub fn ingress_settings(&self) -> IngressSettings {
        IngressSettings {
            annotation: self.annotation.clone(),
            template: IngressTemplate {
                ingress_class: self.ingress_class.clone(),
                host: self.host.clone(),
                path: self.path.clone(),
                path_type: PathType::Prefix,
                service_port: self.service_port,
            },
        }
    }

    /// Telemetry settings
    pub fn telemetry_config(&self) -> TelemetryConfig {
        TelemetryConfig {
            service_name: "portico".to_string(),
            otlp_endpoint: self.otlp_endpoint.clone(),
            json_logs: self.log_json,
        }
    }
}

/// Connect to the cluster and run the controller until `shutdown` fires
pub async fn run(args: Args, shutdown: CancellationToken) -> anyhow::Result<()> {
    let client = retry_with_backoff(
        &RetryConfig::with_max_attempts(10),
        "kube_client",
        || async { Client::try_default().await },
    )
    .await?;

    let namespace = args.namespace.as_deref();
    info!(
        namespace = namespace.unwrap_or("<all>"),
        workers = args.workers,
        annotation = %args.annotation,
        "Starting portico"
    );

    let controller = Controller::new(args.controller_config());
    let reconciler = Arc::new(IngressReconciler::new(
        controller.cache().clone(),
        Arc::new(KubeStoreClient::new(client.clone())),
        Arc::new(KubeEventPublisher::new(client.clone(), CONTROLLER_NAME)),
        args.ingress_settings(),
    ));

    controller
        .run(
            Arc::new(KubeChangeFeed::services(client.clone(), namespace)),
            Arc::new(KubeChangeFeed::ingresses(client, namespace)),
            reconciler,
            shutdown,
        )
        .await;

    Ok(())
}
