use config::{Config, Environment, File};
use serde::Deserialize;
use std::{env, sync::OnceLock};

/// See §6 "Configuration" for the semantics of every field below.
#[derive(Deserialize, Debug, Clone)]
pub struct AppConfig {
    pub app_debug: bool,

    /// Service name used in tracing output.
    pub tracer_service_name: String,

    pub db_url: String,

    /// Tokens/sec for the global rate limiter (C1).
    pub max_sending_rate: f64,

    /// Capacity of the token bucket (C1) and the bound of the work queue
    /// (C3) is `2 * max_concurrent_senders`.
    pub max_concurrent_senders: usize,

    /// Connection reuse cap (C4).
    pub max_messages_per_connection: u32,

    /// Supervisor + queue poll period, in seconds (§5).
    pub polling_interval: u64,

    /// Base URL used for tracking-pixel and link rewriting (§4.5).
    pub public_url: String,

    /// `smtp` or `api` — selects the transport used by the connection
    /// manager (§4.4).
    pub email_backend: String,

    pub smtp_host: Option<String>,
    pub smtp_port: Option<u16>,
    pub smtp_username: Option<String>,
    pub smtp_password: Option<String>,

    pub aws_region: Option<String>,
    pub aws_ses_tracking_config_set: Option<String>,

    /// Shared secret expected on inbound webhook calls; when unset no
    /// validation is applied (mirrors `check_aws_sns_arn_middleware`).
    pub webhook_shared_secret: Option<String>,

    pub http_port: u16,

    /// §4.11 bounce policy parameters.
    pub bounce_consecutive: u32,
    pub bounce_duration_days: i64,
    pub bounce_limit: u32,
}

impl AppConfig {
    pub fn from_env() -> AppConfig {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());
        let base_path = env::var("CARGO_MANIFEST_DIR").unwrap_or_default();

        let yaml_config_file = File::with_name(&format!("{base_path}/env/{run_mode}.yaml"))
            .format(config::FileFormat::Yaml)
            .required(false);

        Config::builder()
            .set_default("app_debug", false)
            .unwrap()
            .set_default("tracer_service_name", "nuntius")
            .unwrap()
            .set_default("max_sending_rate", 50.0)
            .unwrap()
            .set_default("max_concurrent_senders", 4)
            .unwrap()
            .set_default("max_messages_per_connection", 500)
            .unwrap()
            .set_default("polling_interval", 2)
            .unwrap()
            .set_default("email_backend", "smtp")
            .unwrap()
            .set_default("http_port", 8080)
            .unwrap()
            .set_default("bounce_consecutive", 1)
            .unwrap()
            .set_default("bounce_duration_days", 7)
            .unwrap()
            .set_default("bounce_limit", 3)
            .unwrap()
            .add_source(yaml_config_file)
            .add_source(Environment::default())
            .build()
            .unwrap_or_else(|error| panic!("[CFG] error loading config, {:#?}", error))
            .try_deserialize::<AppConfig>()
            .unwrap_or_else(|error| panic!("[CFG] error deserializing config, {:#?}", error))
    }
}

/// Returns a global read-only reference to the app configuration.
pub fn app_config() -> &'static AppConfig {
    static INSTANCE: OnceLock<AppConfig> = OnceLock::new();
    INSTANCE.get_or_init(AppConfig::from_env)
}
