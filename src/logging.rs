//! # Structured Logging Module
//!
//! Environment-aware structured logging that writes human-readable output to the
//! console and JSON records to a per-process file, for following reconcile loops
//! across many concurrent workflows and deployments.

use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

static INSTALLED: OnceLock<Option<WorkerGuard>> = OnceLock::new();

/// Where and how verbosely the controller logs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSettings {
    pub environment: String,
    /// An `EnvFilter` directive such as `info` or `flowmill_core=debug,sqlx=warn`
    pub filter: String,
    /// JSON log files go here; `None` logs to the console only
    pub directory: Option<PathBuf>,
}

impl LogSettings {
    /// `FLOWMILL_ENV` / `APP_ENV` pick the environment, `RUST_LOG` overrides
    /// the filter, files go to `./log`.
    pub fn from_env() -> Self {
        let environment = std::env::var("FLOWMILL_ENV")
            .or_else(|_| std::env::var("APP_ENV"))
            .map(|env| env.to_lowercase())
            .unwrap_or_else(|_| "development".to_string());
        let filter = std::env::var("RUST_LOG")
            .unwrap_or_else(|_| default_filter(&environment).to_string());
        Self {
            environment,
            filter,
            directory: Some(PathBuf::from("log")),
        }
    }

    fn file_name(&self) -> String {
        format!(
            "{}.{}.{}.log",
            self.environment,
            std::process::id(),
            Utc::now().format("%Y%m%d_%H%M%S")
        )
    }
}

fn default_filter(environment: &str) -> &'static str {
    match environment {
        "production" => "info",
        _ => "debug",
    }
}

/// Console plus JSON file logging using [`LogSettings::from_env`]. Only the
/// first call in a process installs anything.
pub fn init_structured_logging() {
    init_logging(LogSettings::from_env());
}

pub fn init_logging(settings: LogSettings) {
    INSTALLED.get_or_init(|| install(&settings));
}

fn install(settings: &LogSettings) -> Option<WorkerGuard> {
    let console = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_filter(EnvFilter::new(&settings.filter));

    let file = settings.directory.as_deref().and_then(|dir| {
        if let Err(e) = std::fs::create_dir_all(dir) {
            eprintln!("flowmill: no file logging, cannot create {}: {e}", dir.display());
            return None;
        }
        let name = settings.file_name();
        let (writer, guard) =
            tracing_appender::non_blocking(tracing_appender::rolling::never(dir, &name));
        let layer = fmt::layer()
            .with_writer(writer)
            .with_target(true)
            .with_thread_ids(true)
            .with_ansi(false)
            .json()
            .with_filter(EnvFilter::new(&settings.filter));
        Some((layer, guard, dir.join(name)))
    });

    let (file_layer, guard, path) = match file {
        Some((layer, guard, path)) => (Some(layer), Some(guard), Some(path)),
        None => (None, None, None),
    };

    if tracing_subscriber::registry()
        .with(console)
        .with(file_layer)
        .try_init()
        .is_err()
    {
        tracing::debug!("a tracing subscriber is already installed, keeping it");
    }

    tracing::info!(
        pid = std::process::id(),
        environment = %settings.environment,
        log_file = path.as_deref().map(Path::display).map(tracing::field::display),
        "🔧 STRUCTURED LOGGING: controller logging ready"
    );
    guard
}

/// Log structured data for workflow operations
pub fn log_workflow_operation(
    operation: &str,
    workflow_uid: Option<&str>,
    workflow_name: Option<&str>,
    namespace: Option<&str>,
    phase: &str,
    details: Option<&str>,
) {
    tracing::info!(
        operation = %operation,
        workflow_uid = workflow_uid,
        workflow_name = workflow_name,
        namespace = namespace,
        phase = %phase,
        details = details,
        "📋 WORKFLOW_OPERATION"
    );
}

/// Log structured data for node operations
pub fn log_node_operation(
    operation: &str,
    workflow_uid: Option<&str>,
    node_id: Option<&str>,
    node_name: Option<&str>,
    phase: &str,
    details: Option<&str>,
) {
    tracing::info!(
        operation = %operation,
        workflow_uid = workflow_uid,
        node_id = node_id,
        node_name = node_name,
        phase = %phase,
        details = details,
        "🔧 NODE_OPERATION"
    );
}

/// Log structured data for deployment lifecycle operations
pub fn log_deployment_operation(
    operation: &str,
    deployment_key: &str,
    state: &str,
    details: Option<&str>,
) {
    tracing::info!(
        operation = %operation,
        deployment = %deployment_key,
        state = %state,
        details = details,
        "🚀 DEPLOYMENT_OPERATION"
    );
}

/// Log structured data for artifact transfers
pub fn log_artifact_operation(
    operation: &str,
    backend: &str,
    key: &str,
    status: &str,
    details: Option<&str>,
) {
    tracing::debug!(
        operation = %operation,
        backend = %backend,
        key = %key,
        status = %status,
        details = details,
        "📦 ARTIFACT_OPERATION"
    );
}

/// Log structured data for persistence operations
pub fn log_persistence_operation(
    operation: &str,
    backend: &str,
    uid: Option<&str>,
    status: &str,
    duration_ms: Option<u64>,
) {
    tracing::debug!(
        operation = %operation,
        backend = %backend,
        uid = uid,
        status = %status,
        duration_ms = duration_ms,
        "💾 PERSISTENCE_OPERATION"
    );
}

/// Log structured data for plugin RPC calls
pub fn log_plugin_operation(plugin: &str, method: &str, status: &str, details: Option<&str>) {
    tracing::debug!(
        plugin = %plugin,
        method = %method,
        status = %status,
        details = details,
        "🔌 PLUGIN_OPERATION"
    );
}

/// Log errors with structured context
pub fn log_error(component: &str, operation: &str, error: &str, context: Option<&str>) {
    tracing::error!(
        component = %component,
        operation = %operation,
        error = %error,
        context = context,
        "❌ ERROR"
    );
}
