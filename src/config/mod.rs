mod settings;

use config::{Config, ConfigError, Environment, File};

use settings::PartialSettings;

pub use settings::{
    AuthSettings, FanOutSettings, HubSettings, OverflowPolicy, ServerSettings, Settings,
    StoreSettings,
};

/// Prefix for environment overrides, e.g. `CHATCAST_HUB__OVERFLOW_POLICY`.
pub const ENV_PREFIX: &str = "CHATCAST";

/// Loads the configuration from `config/default` and environment variables,
/// merged over default values.
pub fn load_config() -> Result<Settings, ConfigError> {
    load_config_from("config/default")
}

/// Same as [`load_config`] with an explicit file stem.
pub fn load_config_from(path: &str) -> Result<Settings, ConfigError> {
    let builder = Config::builder()
        .add_source(File::with_name(path).required(false))
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

    let config = builder.build()?;
    let partial: PartialSettings = config.try_deserialize()?;
    let settings = partial.merge(Settings::default());

    if settings.hub.subscriber_buffer_capacity == 0 {
        return Err(ConfigError::Message(
            "hub.subscriber_buffer_capacity must be greater than zero".to_string(),
        ));
    }

    Ok(settings)
}
