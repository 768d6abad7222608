use anyhow::Result;
use rtls_ingest::anomaly::AnomalyEngine;
use rtls_ingest::buffer::IngestBuffer;
use rtls_ingest::config;
use rtls_ingest::pipeline::{spawn_background_tasks, Pipeline};
use rtls_ingest::sink::{DefaultRegistry, JetStreamSink, PersistenceSink};
use rtls_ingest::transform::Transformer;
use rtls_ingest::transport::{connect_with_backoff, TransportListener};
use rtls_ingest::zone::ZoneIndex;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rtls_ingest=info".into()),
        )
        .init();

    info!("RTLS ingest starting...");

    let config_path =
        std::env::var("RTLS_CONFIG").unwrap_or_else(|_| "config/rtls.toml".to_string());
    let config = if Path::new(&config_path).exists() {
        config::load_config(&config_path)?
    } else {
        warn!(path = %config_path, "Config file not found, using defaults");
        config::IngestConfig::default()
    };

    // Zone definitions; a missing file means an empty index until refresh
    let zones = match ZoneIndex::load_file(Path::new(&config.zones.definitions_path)) {
        Ok(defs) => {
            info!(zones = defs.len(), path = %config.zones.definitions_path, "Loaded zones");
            Arc::new(ZoneIndex::new(defs))
        }
        Err(e) => {
            warn!(error = %e, "No zone definitions loaded, starting with empty index");
            Arc::new(ZoneIndex::empty())
        }
    };

    let transformer = Transformer::from_config(&config.transform)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Shared broker connection for the listener and the sink
    let mut connect_shutdown = shutdown_rx.clone();
    let Some(client) = connect_with_backoff(&config.transport, &mut connect_shutdown).await else {
        info!("Shutdown before broker connection established");
        return Ok(());
    };

    let sink: Arc<dyn PersistenceSink> = Arc::new(JetStreamSink::new(
        async_nats::jetstream::new(client.clone()),
        config.sink.clone(),
    ));

    let pipeline = Arc::new(Pipeline::new(
        transformer,
        zones,
        AnomalyEngine::new(config.anomaly.clone()),
        IngestBuffer::new(&config.buffer),
        Arc::new(DefaultRegistry),
        sink.clone(),
    ));

    let task_handles = spawn_background_tasks(pipeline.clone(), &config, shutdown_rx.clone());

    let listener = Arc::new(TransportListener::new(client, config.transport.clone()).await);
    let listener_handle = tokio::spawn(
        listener
            .clone()
            .run(pipeline.clone(), shutdown_rx.clone()),
    );

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    // Stop accepting messages, then flush what is buffered before closing
    let _ = shutdown_tx.send(true);
    let _ = listener_handle.await;
    for handle in task_handles {
        let _ = handle.await;
    }

    pipeline.shutdown_flush().await;
    pipeline.log_stats();
    sink.close().await?;

    info!("RTLS ingest stopped");
    Ok(())
}
