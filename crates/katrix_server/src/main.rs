#![forbid(unsafe_code)]

mod config;
mod server;
mod util;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use katrix_platform::{ChatClient, MatrixClient, MatrixConfig};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::KatrixConfig;
use crate::server::dispatcher::Dispatcher;
use crate::server::health::{HealthState, spawn_health_server};
use crate::server::supervisor::{Credentials, Supervisor};
use crate::server::sync_loop::{RetryPolicy, SyncLoop};
use crate::server::transport::{Mailbox, TransportServer};

/// Time allowed for in-flight chat operations to finish on shutdown.
const SETTLE_GRACE: Duration = Duration::from_secs(5);

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: katrix_server [--config path]\n\
\n\
Options:\n\
\t--config  Config file (default: ~/.katrix/config.toml)\n\
\t--help    Show this help\n\
"
	);
	std::process::exit(2)
}

fn parse_args() -> Option<PathBuf> {
	let mut config_path = None;

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--config" | "-c" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--config must be non-empty");
					usage_and_exit();
				}
				config_path = Some(PathBuf::from(v));
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	config_path
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,katrix_server=debug".to_string());

	let otlp_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
		.ok()
		.map(|v| v.trim().to_string())
		.filter(|v| !v.is_empty());
	let base = tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(filter))
		.with(tracing_subscriber::fmt::layer().with_target(false));

	if let Some(endpoint) = otlp_endpoint {
		use opentelemetry::global;
		use opentelemetry::trace::TracerProvider as _;
		use opentelemetry_otlp::WithExportConfig;

		match opentelemetry_otlp::SpanExporter::builder()
			.with_tonic()
			.with_endpoint(endpoint.clone())
			.build()
		{
			Ok(exporter) => {
				let tracer_provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
					.with_batch_exporter(exporter)
					.build();
				let tracer = tracer_provider.tracer("katrix_server");
				global::set_tracer_provider(tracer_provider);

				let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
				base.with(otel_layer).init();
				info!(endpoint = %endpoint, "otlp tracing enabled");
			}
			Err(e) => {
				base.init();
				warn!(error = %e, "failed to initialize otlp tracing");
			}
		}
	} else {
		base.init();
	}
}

fn init_metrics(bind: Option<&str>) {
	let Some(bind) = bind else {
		return;
	};

	match bind.parse::<std::net::SocketAddr>() {
		Ok(addr) => {
			if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new()
				.with_http_listener(addr)
				.install()
			{
				warn!(error = %e, "failed to start metrics exporter");
			} else {
				info!(%addr, "metrics exporter listening");
			}
		}
		Err(e) => {
			warn!(error = %e, %bind, "invalid metrics bind address (expected host:port)");
		}
	}
}

fn init_health(bind: Option<&str>) -> HealthState {
	let health = HealthState::new();
	if let Some(bind) = bind {
		match bind.parse::<std::net::SocketAddr>() {
			Ok(addr) => {
				spawn_health_server(addr, health.clone());
				info!(%addr, "health server listening");
			}
			Err(e) => warn!(error = %e, %bind, "invalid health bind address (expected host:port)"),
		}
	}
	health
}

fn credentials(cfg: &KatrixConfig) -> anyhow::Result<Credentials> {
	let user = cfg
		.matrix
		.user
		.clone()
		.ok_or_else(|| anyhow!("matrix.user is not configured (or set KATRIX_USER)"))?;
	let password = cfg
		.matrix
		.password
		.clone()
		.filter(|p| !p.is_empty())
		.ok_or_else(|| anyhow!("matrix.password is not configured (or set KATRIX_PASSWORD)"))?;
	Ok(Credentials { user, password })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_tracing();

	let config_path = match parse_args() {
		Some(p) => p,
		None => crate::config::default_config_path()?,
	};
	let cfg = crate::config::load_config_from_path(&config_path)?;
	info!(path = %config_path.display(), "loaded config (toml + env overrides)");

	let creds = credentials(&cfg)?;
	init_metrics(cfg.server.metrics_bind.as_deref());
	let health = init_health(cfg.server.health_bind.as_deref());

	let client: Arc<dyn ChatClient> = Arc::new(
		MatrixClient::new(MatrixConfig {
			homeserver: cfg.matrix.homeserver.clone(),
			..MatrixConfig::default()
		})
		.context("matrix client")?,
	);

	let transport = Arc::new(TransportServer::start(&cfg.transport, &cfg.bridge.platform_name).await?);
	let mailbox: Arc<dyn Mailbox> = transport.clone();
	let dispatcher = Dispatcher::new(Arc::clone(&client), mailbox, cfg.bridge.clone());

	let mut sync = SyncLoop::new(Arc::clone(&client), Arc::clone(&dispatcher), cfg.sync.clone()).with_health(health.clone());
	let supervisor = Supervisor::new(
		client,
		creds,
		RetryPolicy {
			min_delay: cfg.sync.retry_min_delay,
			max_delay: cfg.sync.retry_max_delay,
		},
		health.clone(),
	);

	let (shutdown_tx, shutdown_rx) = watch::channel(false);
	let shutdown_tx = Arc::new(shutdown_tx);
	let signal_tx = Arc::clone(&shutdown_tx);
	tokio::spawn(async move {
		match tokio::signal::ctrl_c().await {
			Ok(()) => {
				info!("shutdown requested");
				let _ = signal_tx.send(true);
			}
			Err(e) => warn!(error = %e, "failed to listen for ctrl-c"),
		}
	});

	info!(
		homeserver = %cfg.matrix.homeserver,
		user = %cfg.matrix.user.as_deref().unwrap_or_default(),
		inbound = %transport.local_addr(),
		"katrix bridge starting"
	);
	let result = supervisor.run(&mut sync, shutdown_rx).await;
	health.mark_not_ready();

	let dropped = dispatcher.discard_queued();
	if dropped > 0 {
		warn!(dropped, "discarding queued commands");
	}
	if tokio::time::timeout(SETTLE_GRACE, dispatcher.settle()).await.is_err() {
		warn!("in-flight chat operations did not finish before shutdown");
	}
	drop(sync);
	drop(dispatcher);

	match Arc::try_unwrap(transport) {
		Ok(transport) => transport.shutdown().await,
		Err(transport) => {
			warn!("transport still in use; flushing replies only");
			if tokio::time::timeout(SETTLE_GRACE, transport.flush()).await.is_err() {
				warn!("outbound replies not delivered before shutdown");
			}
		}
	}

	result
}
