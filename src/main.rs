use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use inboxd::api::{ApiState, api_routes};
use inboxd::channels::email::EmailConfig;
use inboxd::channels::email_poller::{PollerDeps, spawn_email_poller};
use inboxd::config::AppConfig;
use inboxd::llm::{OllamaClient, OllamaConfig};
use inboxd::store::{LibSqlBackend, MessageStore};
use inboxd::templates::Templates;
use inboxd::threading::IngestionPipeline;

const LOG_FILE_NAME: &str = "inboxd.log";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    let config = AppConfig::from_env();

    // Tracing to stdout and to the log file the /logs endpoint serves
    std::fs::create_dir_all(&config.log_dir)?;
    let file_appender = tracing_appender::rolling::never(&config.log_dir, LOG_FILE_NAME);
    let (file_writer, _log_guard) = tracing_appender::non_blocking(file_appender);
    {
        use tracing_subscriber::layer::SubscriberExt;
        use tracing_subscriber::util::SubscriberInitExt;

        tracing_subscriber::registry()
            .with(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
            )
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(file_writer)
                    .with_ansi(false)
                    .with_target(false),
            )
            .init();
    }

    eprintln!("📬 inboxd v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Database: {}", config.db_path);
    eprintln!("   API: http://0.0.0.0:{}/emails", config.api_port);

    // ── Store ────────────────────────────────────────────────────────────
    // One handle for the whole process; migrations run once here.
    let store: Arc<dyn MessageStore> = Arc::new(
        LibSqlBackend::new_local(Path::new(&config.db_path))
            .await
            .unwrap_or_else(|e| {
                eprintln!("Error: Failed to open database at {}: {}", config.db_path, e);
                std::process::exit(1);
            }),
    );

    let pipeline = Arc::new(IngestionPipeline::new(
        Arc::clone(&store),
        config.merge_limit,
    ));

    // ── Reply generation ─────────────────────────────────────────────────
    let templates = Arc::new(Templates::load(&config.templates_path));
    let llm = Arc::new(OllamaClient::new(OllamaConfig::from_env())?);

    // ── Read API ─────────────────────────────────────────────────────────
    let api_state = ApiState {
        store: Arc::clone(&store),
        log_path: Path::new(&config.log_dir).join(LOG_FILE_NAME),
    };
    let app = api_routes(api_state);
    let api_port = config.api_port;
    tokio::spawn(async move {
        let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{api_port}"))
            .await
            .expect("Failed to bind API port");
        tracing::info!(port = api_port, "Read API started");
        axum::serve(listener, app).await.ok();
    });

    // ── Mail poller ──────────────────────────────────────────────────────
    let Some(email_config) = EmailConfig::from_env() else {
        eprintln!("Error: EMAIL_IMAP_HOST not set — nothing to poll");
        std::process::exit(1);
    };

    let senders = &email_config.allowed_senders;
    eprintln!(
        "   Email: IMAP {}, SMTP {}, allowed: {}",
        email_config.imap_host,
        email_config.smtp_host,
        if senders.iter().any(|s| s == "*") {
            "everyone".to_string()
        } else if senders.is_empty() {
            "none (deny all)".to_string()
        } else {
            senders.join(", ")
        }
    );

    let (poller_handle, shutdown) = spawn_email_poller(
        email_config,
        PollerDeps {
            store,
            pipeline,
            llm,
            templates,
        },
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown requested");
    shutdown.store(true, Ordering::Relaxed);
    poller_handle.abort();

    Ok(())
}
