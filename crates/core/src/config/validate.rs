use super::{types::Config, ConfigError, ServiceConfig};

/// Validate configuration
/// Currently validates:
/// - Server port is not 0
/// - Reconciler tick interval, lease TTL and scan limit are not 0
/// - Every stage has a non-zero timeout and retry budget
/// - Configured services have an http(s) URL and a non-zero timeout
pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
    // Server validation
    if config.server.port == 0 {
        return Err(ConfigError::ValidationError(
            "server.port cannot be 0".to_string(),
        ));
    }

    let reconciler = &config.reconciler;
    if reconciler.tick_interval_ms == 0 {
        return Err(ConfigError::ValidationError(
            "reconciler.tick_interval_ms cannot be 0".to_string(),
        ));
    }
    if reconciler.lease_ttl_secs == 0 {
        return Err(ConfigError::ValidationError(
            "reconciler.lease_ttl_secs cannot be 0".to_string(),
        ));
    }
    if reconciler.scan_limit <= 0 {
        return Err(ConfigError::ValidationError(
            "reconciler.scan_limit must be positive".to_string(),
        ));
    }

    for (name, limits) in [
        ("ingestion", &config.stages.ingestion),
        ("detection", &config.stages.detection),
        ("analysis", &config.stages.analysis),
    ] {
        if limits.timeout_secs == 0 {
            return Err(ConfigError::ValidationError(format!(
                "stages.{}.timeout_secs cannot be 0",
                name
            )));
        }
        if limits.max_retries == 0 {
            return Err(ConfigError::ValidationError(format!(
                "stages.{}.max_retries cannot be 0",
                name
            )));
        }
    }

    for (name, service) in [
        ("ingestion", &config.services.ingestion),
        ("detection", &config.services.detection),
        ("analysis", &config.services.analysis),
    ] {
        if let Some(service) = service {
            validate_service(name, service)?;
        }
    }

    if config.notifications.buffer_size == 0 {
        return Err(ConfigError::ValidationError(
            "notifications.buffer_size cannot be 0".to_string(),
        ));
    }

    Ok(())
}

fn validate_service(name: &str, service: &ServiceConfig) -> Result<(), ConfigError> {
    if !is_http_url(&service.url) {
        return Err(ConfigError::ValidationError(format!(
            "services.{}.url must start with http:// or https://",
            name
        )));
    }
    if service.timeout_secs == 0 {
        return Err(ConfigError::ValidationError(format!(
            "services.{}.timeout_secs cannot be 0",
            name
        )));
    }
    if let Some(callback) = &service.callback_url {
        if !is_http_url(callback) {
            return Err(ConfigError::ValidationError(format!(
                "services.{}.callback_url must start with http:// or https://",
                name
            )));
        }
    }
    Ok(())
}

fn is_http_url(url: &str) -> bool {
    let rest = url
        .strip_prefix("http://")
        .or_else(|| url.strip_prefix("https://"));
    rest.is_some_and(|host| !host.is_empty())
}
