//! Per-process runtime context.
//!
//! Built once in `main` (or a test) and passed by reference to the
//! constructors that need it. Nothing in the crate reads process-wide
//! statics for identity or configuration.

use crate::config::{ConfigError, RuntimeConfig};
use crate::ipc::{EndpointName, Role};

/// Identity and configuration of this process.
#[derive(Debug, Clone)]
pub struct RuntimeContext {
    role: Role,
    endpoint: EndpointName,
    config: RuntimeConfig,
}

impl RuntimeContext {
    /// Context for `role` using the endpoint named in `config`.
    ///
    /// # Errors
    ///
    /// [`ConfigError::InvalidEndpoint`] if the configured name is unusable.
    pub fn new(role: Role, config: RuntimeConfig) -> Result<Self, ConfigError> {
        let endpoint = config.endpoint_name()?;
        Ok(Self {
            role,
            endpoint,
            config,
        })
    }

    #[must_use]
    pub const fn role(&self) -> Role {
        self.role
    }

    #[must_use]
    pub const fn endpoint(&self) -> &EndpointName {
        &self.endpoint
    }

    #[must_use]
    pub const fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Short label for log fields and thread names.
    #[must_use]
    pub const fn role_name(&self) -> &'static str {
        match self.role {
            Role::Server => "service",
            Role::Client => "control",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_comes_from_config() {
        let config = RuntimeConfig {
            endpoint: "tandem.ctx".to_owned(),
            ..RuntimeConfig::default()
        };
        let ctx = RuntimeContext::new(Role::Server, config).unwrap();
        assert_eq!(ctx.endpoint().as_str(), "tandem.ctx");
        assert_eq!(ctx.role_name(), "service");
    }

    #[test]
    fn invalid_endpoint_is_rejected() {
        let config = RuntimeConfig {
            endpoint: String::new(),
            ..RuntimeConfig::default()
        };
        assert!(matches!(
            RuntimeContext::new(Role::Client, config),
            Err(ConfigError::InvalidEndpoint(_))
        ));
    }
}
