use anyhow::{anyhow, Context, Result};
use db_pool::{create_pool, DbConfig};
use idempotent_consumer::PgTransactionStore;
use message_broker::amqp::AmqpBroker;
use message_broker::Broker;
use pipeline_metrics::PipelineContext;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use transaction_consumer::config::Config;

const SERVICE_NAME: &str = "transaction-consumer";

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("LOG_FORMAT").is_ok_and(|format| format.eq_ignore_ascii_case("json"));

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json().with_target(false))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    info!("Starting {}", SERVICE_NAME);

    let config = Config::from_env().context("Failed to load configuration")?;
    info!(config = ?config, "Configuration loaded");

    let db_config = DbConfig::from_env(SERVICE_NAME).context("Failed to load database configuration")?;
    db_config.log_config();
    let db = create_pool(db_config)
        .await
        .context("Failed to connect to PostgreSQL")?;
    let store = Arc::new(PgTransactionStore::new(db.clone()));

    let pipeline = PipelineContext::new(SERVICE_NAME);

    let server = pipeline_metrics::http::serve(pipeline.clone(), config.http_port)
        .context("Failed to bind HTTP server")?;
    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    let broker = Arc::new(
        AmqpBroker::connect(&config.rabbitmq_url, config.connect_attempts)
            .await
            .context("Failed to connect to RabbitMQ")?,
    );
    broker
        .declare_queue(&config.queue_name)
        .await
        .with_context(|| format!("Failed to declare queue {}", config.queue_name))?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown signal received, flushing buffered batches"),
            Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
        }
        let _ = shutdown_tx.send(true);
    });

    let summary =
        transaction_consumer::run(broker.clone(), store, pipeline.clone(), &config, shutdown_rx)
            .await;

    server_handle.stop(true).await;
    match server_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "HTTP server stopped with error"),
        Err(e) => error!(error = %e, "HTTP server task failed"),
    }
    if let Err(e) = broker.close().await {
        error!(error = %e, "Failed to close RabbitMQ connection");
    }
    db.close().await;

    if summary.workers_started == 0 {
        return Err(anyhow!(
            "no consumer worker ran ({} failed)",
            summary.workers_failed
        ));
    }
    info!("{} stopped", SERVICE_NAME);
    Ok(())
}
