//! Shared configuration and build event model.

pub mod config;
pub mod models;

/// Process-wide environment variable names.
pub mod env {
    pub const CONFIG_PATH: &str = "BUILDRELAY_CONFIG";
    pub const GITHUB_TOKEN: &str = "GITHUB_TOKEN";
    pub const PUBSUB_EMULATOR_HOST: &str = "PUBSUB_EMULATOR_HOST";
    pub const SLACK_WEBHOOK_URL: &str = "SLACK_WEBHOOK_URL";
}
