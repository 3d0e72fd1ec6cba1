//! Operator configuration loaded from the environment

use std::time::Duration;

use envconfig::Envconfig;

use crate::error::{Error, Result};

#[derive(Envconfig, Clone, Debug)]
pub struct OperatorConfig {
    /// Budget for every store sub-operation, and for the bounded wait on them
    #[envconfig(from = "AGONES_LB_OPERATION_TIMEOUT_SECS", default = "10")]
    pub operation_timeout_secs: u64,

    #[envconfig(from = "AGONES_LB_GAMESERVER_REQUEUE_SECS", default = "10")]
    pub gameserver_requeue_secs: u64,

    #[envconfig(from = "AGONES_LB_SERVICE_REQUEUE_SECS", default = "15")]
    pub service_requeue_secs: u64,

    #[envconfig(from = "AGONES_LB_POLICY_REQUEUE_SECS", default = "10")]
    pub policy_requeue_secs: u64,

    /// Attempts per read-modify-write transaction. 0 retries until cancelled.
    #[envconfig(from = "AGONES_LB_RETRY_MAX_ATTEMPTS", default = "30")]
    pub retry_max_attempts: u32,

    #[envconfig(from = "AGONES_LB_HTTP_PORT", default = "8080")]
    pub http_port: u16,

    /// Filter directive used when RUST_LOG is unset
    #[envconfig(from = "AGONES_LB_LOG", default = "info")]
    pub log_directive: String,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            operation_timeout_secs: 10,
            gameserver_requeue_secs: 10,
            service_requeue_secs: 15,
            policy_requeue_secs: 10,
            retry_max_attempts: 30,
            http_port: 8080,
            log_directive: "info".to_string(),
        }
    }
}

impl OperatorConfig {
    /// Load from the environment and validate
    pub fn load() -> Result<Self> {
        let config =
            Self::init_from_env().map_err(|e| Error::ConfigError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let durations = [
            ("AGONES_LB_OPERATION_TIMEOUT_SECS", self.operation_timeout_secs),
            ("AGONES_LB_GAMESERVER_REQUEUE_SECS", self.gameserver_requeue_secs),
            ("AGONES_LB_SERVICE_REQUEUE_SECS", self.service_requeue_secs),
            ("AGONES_LB_POLICY_REQUEUE_SECS", self.policy_requeue_secs),
        ];
        for (name, value) in durations {
            if value == 0 {
                return Err(Error::ConfigError(format!("{} must be greater than 0", name)));
            }
        }
        if self.http_port == 0 {
            return Err(Error::ConfigError(
                "AGONES_LB_HTTP_PORT must be between 1 and 65535".to_string(),
            ));
        }
        Ok(())
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }

    pub fn gameserver_requeue(&self) -> Duration {
        Duration::from_secs(self.gameserver_requeue_secs)
    }

    pub fn service_requeue(&self) -> Duration {
        Duration::from_secs(self.service_requeue_secs)
    }

    pub fn policy_requeue(&self) -> Duration {
        Duration::from_secs(self.policy_requeue_secs)
    }

    pub fn max_attempts(&self) -> Option<u32> {
        (self.retry_max_attempts > 0).then_some(self.retry_max_attempts)
    }
}
