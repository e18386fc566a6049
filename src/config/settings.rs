use serde::Deserialize;

/// Top-level configuration settings for the application.
///
/// Covers the WebSocket server, the in-memory broker, the producer, the
/// consumer-side delivery loop and logging.
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub broker: BrokerSettings,
    pub producer: ProducerSettings,
    pub consumer: ConsumerSettings,
    pub logging: LoggingSettings,
}

/// Defines the host and port the broker's WebSocket server binds to.
#[derive(Debug, Deserialize, Clone)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

/// Configuration settings for the broker.
#[derive(Debug, Deserialize, Clone)]
pub struct BrokerSettings {
    /// Directory of the sled database holding dead-lettered messages.
    pub data_dir: String,
    /// How long a dead-lettered message is retained before it is purged.
    pub dead_letter_ttl_secs: u64,
    /// Whitespace separated delay ladder, e.g. `"1s 5s 10s 30s 1m"`.
    pub delay_levels: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProducerSettings {
    /// WebSocket URL of a remote broker.
    pub endpoint: String,
    pub send_timeout_ms: u64,
    /// Transport failures are retried this many times before a send gives up.
    pub retry_times_when_send_failed: u32,
    /// Number of ordered lanes that partition keys are hashed onto.
    pub ordered_lanes: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ConsumerSettings {
    pub max_redeliveries: u32,
    /// Upper bound on concurrently running listener invocations per subscription.
    pub consume_thread_max: usize,
    /// Fixed redelivery backoff. When unset the delay ladder is used.
    pub redelivery_backoff_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingSettings {
    pub level: String,
}

/// Partial configuration settings loaded from files or environment.
///
/// Allows partial specification of settings. Missing values can be filled using defaults.
#[derive(Debug, Default, Deserialize)]
pub struct PartialSettings {
    pub server: Option<PartialServerSettings>,
    pub broker: Option<PartialBrokerSettings>,
    pub producer: Option<PartialProducerSettings>,
    pub consumer: Option<PartialConsumerSettings>,
    pub logging: Option<PartialLoggingSettings>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PartialServerSettings {
    pub host: Option<String>,
    pub port: Option<u16>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PartialBrokerSettings {
    pub data_dir: Option<String>,
    pub dead_letter_ttl_secs: Option<u64>,
    pub delay_levels: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PartialProducerSettings {
    pub endpoint: Option<String>,
    pub send_timeout_ms: Option<u64>,
    pub retry_times_when_send_failed: Option<u32>,
    pub ordered_lanes: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PartialConsumerSettings {
    pub max_redeliveries: Option<u32>,
    pub consume_thread_max: Option<usize>,
    pub redelivery_backoff_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PartialLoggingSettings {
    pub level: Option<String>,
}

/// Default delay ladder: level 1 is 1s, level 4 is 30s,
/// level 18 is 2h.
pub const DEFAULT_DELAY_LEVELS: &str = "1s 5s 10s 30s 1m 2m 3m 4m 5m 6m 7m 8m 9m 10m 20m 30m 1h 2h";

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerSettings {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            broker: BrokerSettings {
                data_dir: "tidemq_db".to_string(),
                dead_letter_ttl_secs: 3 * 24 * 3600,
                delay_levels: DEFAULT_DELAY_LEVELS.to_string(),
            },
            producer: ProducerSettings {
                endpoint: "ws://127.0.0.1:8080".to_string(),
                send_timeout_ms: 3000,
                retry_times_when_send_failed: 2,
                ordered_lanes: 4,
            },
            consumer: ConsumerSettings {
                max_redeliveries: 16,
                consume_thread_max: 64,
                redelivery_backoff_ms: None,
            },
            logging: LoggingSettings {
                level: "info".to_string(),
            },
        }
    }
}

impl PartialSettings {
    /// Fills every missing value from `defaults`.
    pub fn merge(self, defaults: Settings) -> Settings {
        let server = self.server.unwrap_or_default();
        let broker = self.broker.unwrap_or_default();
        let producer = self.producer.unwrap_or_default();
        let consumer = self.consumer.unwrap_or_default();
        let logging = self.logging.unwrap_or_default();

        Settings {
            server: ServerSettings {
                host: server.host.unwrap_or(defaults.server.host),
                port: server.port.unwrap_or(defaults.server.port),
            },
            broker: BrokerSettings {
                data_dir: broker.data_dir.unwrap_or(defaults.broker.data_dir),
                dead_letter_ttl_secs: broker
                    .dead_letter_ttl_secs
                    .unwrap_or(defaults.broker.dead_letter_ttl_secs),
                delay_levels: broker.delay_levels.unwrap_or(defaults.broker.delay_levels),
            },
            producer: ProducerSettings {
                endpoint: producer.endpoint.unwrap_or(defaults.producer.endpoint),
                send_timeout_ms: producer
                    .send_timeout_ms
                    .unwrap_or(defaults.producer.send_timeout_ms),
                retry_times_when_send_failed: producer
                    .retry_times_when_send_failed
                    .unwrap_or(defaults.producer.retry_times_when_send_failed),
                ordered_lanes: producer
                    .ordered_lanes
                    .unwrap_or(defaults.producer.ordered_lanes),
            },
            consumer: ConsumerSettings {
                max_redeliveries: consumer
                    .max_redeliveries
                    .unwrap_or(defaults.consumer.max_redeliveries),
                consume_thread_max: consumer
                    .consume_thread_max
                    .unwrap_or(defaults.consumer.consume_thread_max),
                redelivery_backoff_ms: consumer
                    .redelivery_backoff_ms
                    .or(defaults.consumer.redelivery_backoff_ms),
            },
            logging: LoggingSettings {
                level: logging.level.unwrap_or(defaults.logging.level),
            },
        }
    }
}
