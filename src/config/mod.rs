mod settings;

use config::{Config, ConfigError, Environment, File};

pub use settings::{
    BrokerSettings, ConsumerSettings, DEFAULT_DELAY_LEVELS, LoggingSettings, PartialSettings,
    ProducerSettings, ServerSettings, Settings,
};

/// Prefix of environment overrides, e.g. `TIDEMQ__CONSUMER__MAX_REDELIVERIES=3`.
pub const ENV_PREFIX: &str = "TIDEMQ";

/// Loads the configuration from `config/default` and `TIDEMQ__*` environment variables,
/// then fills whatever is missing from `Settings::default()`.
pub fn load_config() -> Result<Settings, ConfigError> {
    load_config_from("config/default")
}

/// Same as [`load_config`] with an explicit base file name (extension optional).
pub fn load_config_from(file: &str) -> Result<Settings, ConfigError> {
    let builder = Config::builder()
        .add_source(File::with_name(file).required(false))
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

    let config = builder.build()?;

    // Try to deserialize what is available
    let partial: PartialSettings = config.try_deserialize()?;

    Ok(partial.merge(Settings::default()))
}

#[cfg(test)]
mod tests;
