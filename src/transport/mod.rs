use crate::pipeline::Pipeline;
use anyhow::{anyhow, Context, Result};
use async_nats::jetstream::{self, consumer, stream};
use futures::StreamExt;
use rand::Rng;
use serde::Deserialize;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Transport configuration
#[derive(Clone, Debug, Deserialize)]
pub struct TransportConfig {
    pub url: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_stream_name")]
    pub stream_name: String,
    /// Subject pattern; the second token is the vehicle id
    #[serde(default = "default_subject_pattern")]
    pub subject_pattern: String,
    #[serde(default = "default_durable_name")]
    pub durable_name: String,
    /// 0 = at-most-once (no acks), 1 = at-least-once (durable + explicit acks)
    #[serde(default = "default_qos")]
    pub qos: u8,
    /// Messages older than this are discarded on (re)subscription rather
    /// than replayed
    #[serde(default = "default_staleness_window")]
    pub staleness_window_secs: i64,
    #[serde(default = "default_reconnect_base_delay")]
    pub reconnect_base_delay_secs: u64,
    #[serde(default = "default_reconnect_max_delay")]
    pub reconnect_max_delay_secs: u64,
    #[serde(default = "default_max_age_days")]
    pub max_age_days: i64,
    #[serde(default = "default_max_bytes")]
    pub max_bytes: i64,
}

fn default_stream_name() -> String {
    "RTLS_POSITIONS".to_string()
}

fn default_subject_pattern() -> String {
    "rtls.*.position".to_string()
}

fn default_durable_name() -> String {
    "rtls-ingest".to_string()
}

fn default_qos() -> u8 {
    1
}

fn default_staleness_window() -> i64 {
    300
}

fn default_reconnect_base_delay() -> u64 {
    1
}

fn default_reconnect_max_delay() -> u64 {
    60
}

fn default_max_age_days() -> i64 {
    1
}

fn default_max_bytes() -> i64 {
    1024 * 1024 * 1024 // 1GB
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            url: std::env::var("NATS_URL").unwrap_or_else(|_| "nats://localhost:4222".to_string()),
            username: None,
            password: None,
            stream_name: default_stream_name(),
            subject_pattern: default_subject_pattern(),
            durable_name: default_durable_name(),
            qos: default_qos(),
            staleness_window_secs: default_staleness_window(),
            reconnect_base_delay_secs: default_reconnect_base_delay(),
            reconnect_max_delay_secs: default_reconnect_max_delay(),
            max_age_days: default_max_age_days(),
            max_bytes: default_max_bytes(),
        }
    }
}

/// Connect to the broker, retrying with backoff until connected or shut down.
///
/// A broker outage at startup is a ConnectionFailure like any other, never
/// fatal to the process.
pub async fn connect_with_backoff(
    config: &TransportConfig,
    shutdown: &mut watch::Receiver<bool>,
) -> Option<async_nats::Client> {
    let mut attempt: u32 = 0;
    loop {
        if *shutdown.borrow() {
            return None;
        }

        let options = match (&config.username, &config.password) {
            (Some(user), Some(pass)) => {
                async_nats::ConnectOptions::new().user_and_password(user.clone(), pass.clone())
            }
            _ => async_nats::ConnectOptions::new(),
        };

        match options.connect(&config.url).await {
            Ok(client) => {
                info!(url = %config.url, "Connected to broker");
                return Some(client);
            }
            Err(e) => {
                attempt = attempt.saturating_add(1);
                let delay = backoff_delay(
                    attempt,
                    config.reconnect_base_delay_secs,
                    config.reconnect_max_delay_secs,
                );
                warn!(
                    error = %e,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Broker connection failed, retrying"
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown.changed() => {}
                }
            }
        }
    }
}

/// Exponential backoff: base × 2^(attempt−1), capped, plus up to 500 ms of
/// jitter so a fleet of consumers does not reconnect in lockstep.
pub fn backoff_delay(attempt: u32, base_secs: u64, max_secs: u64) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    let secs = base_secs.saturating_mul(1u64 << exp).min(max_secs);
    let jitter_ms = rand::thread_rng().gen_range(0..500);
    Duration::from_secs(secs) + Duration::from_millis(jitter_ms)
}

/// Vehicle id derived from the routing subject (second token of
/// `rtls.<agv_id>.position`). The payload's own id takes precedence.
pub fn entity_from_subject(subject: &str) -> Option<&str> {
    let mut parts = subject.split('.');
    parts.next()?;
    parts.next().filter(|id| !id.is_empty())
}

/// Subscribes to the position stream and feeds raw messages into the
/// pipeline, managing the consumer lifecycle: subscribe, reconnect with
/// exponential backoff, resubscribe on success.
pub struct TransportListener {
    jetstream: jetstream::Context,
    config: TransportConfig,
    reconnect_attempts: AtomicU32,
}

impl TransportListener {
    /// Prepare the listener, ensuring the position stream exists.
    ///
    /// A broker that cannot set up the stream yet is treated like any other
    /// connection failure: the consume loop keeps retrying with backoff.
    pub async fn new(client: async_nats::Client, config: TransportConfig) -> Self {
        let jetstream = jetstream::new(client);
        let listener = Self {
            jetstream,
            config,
            reconnect_attempts: AtomicU32::new(0),
        };
        if let Err(e) = listener.ensure_stream().await {
            warn!(error = %e, "Could not ensure position stream, will retry on subscribe");
        }
        listener
    }

    async fn ensure_stream(&self) -> Result<()> {
        if self.jetstream.get_stream(&self.config.stream_name).await.is_ok() {
            info!(stream = %self.config.stream_name, "Position stream exists");
            return Ok(());
        }

        info!(stream = %self.config.stream_name, "Creating position stream");
        let stream_config = stream::Config {
            name: self.config.stream_name.clone(),
            subjects: vec![self.config.subject_pattern.clone()],
            max_age: Duration::from_secs((self.config.max_age_days * 86400) as u64),
            max_bytes: self.config.max_bytes,
            storage: stream::StorageType::File,
            retention: stream::RetentionPolicy::Limits,
            ..Default::default()
        };
        self.jetstream
            .create_stream(stream_config)
            .await
            .context("Failed to create position stream")?;
        Ok(())
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts.load(Ordering::Relaxed)
    }

    /// Run the listener until shutdown. Consume failures trigger a
    /// backoff-delayed resubscription; they are never fatal.
    pub async fn run(
        self: Arc<Self>,
        pipeline: Arc<Pipeline>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut attempt: u32 = 0;
        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.consume(&pipeline, &mut shutdown).await {
                Ok(()) => break, // clean shutdown
                Err(e) => {
                    if *shutdown.borrow() {
                        break;
                    }
                    attempt = attempt.saturating_add(1);
                    self.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
                    let delay = backoff_delay(
                        attempt,
                        self.config.reconnect_base_delay_secs,
                        self.config.reconnect_max_delay_secs,
                    );
                    warn!(
                        error = %e,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Consume loop failed, resubscribing after backoff"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.changed() => {}
                    }
                }
            }
        }
        info!("Transport listener stopped");
    }

    /// Create a consumer and process messages until shutdown (Ok) or a
    /// transport failure (Err, caller resubscribes).
    ///
    /// Delivery starts at now − staleness window: messages that queued up
    /// broker-side during an outage beyond that window are discarded rather
    /// than replayed.
    async fn consume(
        &self,
        pipeline: &Arc<Pipeline>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        let stream = self
            .jetstream
            .get_stream(&self.config.stream_name)
            .await
            .context("Failed to get position stream")?;

        let start_time = time::OffsetDateTime::now_utc()
            - time::Duration::seconds(self.config.staleness_window_secs);

        let (durable_name, ack_policy) = if self.config.qos == 0 {
            (None, consumer::AckPolicy::None)
        } else {
            (Some(self.config.durable_name.clone()), consumer::AckPolicy::Explicit)
        };

        let consumer = stream
            .create_consumer(consumer::pull::Config {
                durable_name,
                filter_subject: self.config.subject_pattern.clone(),
                deliver_policy: consumer::DeliverPolicy::ByStartTime { start_time },
                ack_policy,
                ..Default::default()
            })
            .await
            .context("Failed to create position consumer")?;

        info!(
            subject = %self.config.subject_pattern,
            qos = self.config.qos,
            "Subscribed to position stream"
        );

        let mut messages = consumer
            .messages()
            .await
            .context("Failed to open message stream")?;

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Shutdown signalled, listener stops accepting messages");
                        return Ok(());
                    }
                }
                next = messages.next() => {
                    match next {
                        Some(Ok(msg)) => {
                            pipeline.handle_message(msg.subject.as_str(), &msg.payload).await;
                            if self.config.qos > 0 {
                                if let Err(e) = msg.ack().await {
                                    error!(error = %e, "Failed to acknowledge message");
                                }
                            }
                        }
                        Some(Err(e)) => {
                            error!(error = %e, "Error receiving message");
                        }
                        None => {
                            return Err(anyhow!("message stream ended unexpectedly"));
                        }
                    }
                }
            }
        }
    }
}
