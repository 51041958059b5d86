//! Cross-field configuration validation
//!
//! Shape errors (wrong types, unknown keys) are caught by serde during
//! parsing; everything that needs more than one field to judge lands here.
//! Violations are collected so the operator sees the whole list at once
//! instead of fixing one error per start attempt.

use tracing::warn;

use super::settings::Settings;
use super::ConfigError;
use crate::api::endpoint;
use crate::inventory::model::Mode;

/// Validate a parsed configuration. Returns all violations at once.
pub fn validate(settings: &Settings) -> Result<(), ConfigError> {
    let mut problems = Vec::new();

    validate_api(settings, &mut problems);
    validate_balancing(settings, &mut problems);
    validate_service(settings, &mut problems);

    if problems.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::Invalid(problems.join("; ")))
    }
}

fn validate_api(settings: &Settings, problems: &mut Vec<String>) {
    let api = &settings.proxmox_api;

    if api.hosts.is_empty() {
        problems.push("proxmox_api.hosts must not be empty".to_string());
    }
    for host in &api.hosts {
        if let Err(e) = endpoint::parse(host) {
            problems.push(format!("proxmox_api.hosts entry '{host}': {e}"));
        }
    }

    if api.user.is_empty() {
        problems.push("proxmox_api.user must not be empty".to_string());
    } else if !api.user.contains('@') {
        problems.push(format!(
            "proxmox_api.user '{}' must include a realm (user@realm)",
            api.user
        ));
    }

    let has_token = api.token_id.is_some() || api.token_secret.is_some();
    match (&api.token_id, &api.token_secret) {
        (Some(_), None) => {
            problems.push("proxmox_api.token_id set without token_secret".to_string())
        }
        (None, Some(_)) => {
            problems.push("proxmox_api.token_secret set without token_id".to_string())
        }
        _ => {}
    }

    if let Some(token_id) = &api.token_id {
        // A full Proxmox token reference is user@realm!name; the config
        // expects only the name part.
        if token_id.contains('!') || token_id.contains('@') {
            problems.push(format!(
                "proxmox_api.token_id '{token_id}' must be the bare token name, \
                 not the user@realm!name form"
            ));
        }
    }

    if !has_token && api.pass.is_none() {
        problems.push(
            "proxmox_api needs either pass or token_id + token_secret".to_string(),
        );
    }

    if has_token && api.pass.is_some() {
        warn!("Both token and password are configured; the token wins and the password is ignored");
    }

    if api.timeout == 0 {
        problems.push("proxmox_api.timeout must be at least 1 second".to_string());
    }
}

fn validate_balancing(settings: &Settings, problems: &mut Vec<String>) {
    let balancing = &settings.balancing;

    if balancing.parallel_jobs == 0 {
        problems.push("balancing.parallel_jobs must be at least 1".to_string());
    }

    if balancing.balance_types.is_empty() {
        problems.push("balancing.balance_types must not be empty".to_string());
    }

    if let Some(threshold) = balancing.memory_threshold {
        if threshold > 100 {
            problems.push(format!(
                "balancing.memory_threshold is a percentage, got {threshold}"
            ));
        }
    }

    if balancing.max_job_validation == 0 {
        problems.push("balancing.max_job_validation must be at least 1 second".to_string());
    }

    match (balancing.mode, &balancing.psi) {
        (Mode::Psi, None) => {
            problems.push("balancing.psi thresholds are required when mode is psi".to_string())
        }
        (Mode::Psi, Some(psi)) => {
            for (label, value) in
                [("some", psi.some), ("full", psi.full), ("spikes", psi.spikes)]
            {
                if !(0.0..=1.0).contains(&value) {
                    problems.push(format!(
                        "balancing.psi.{label} must be a fraction in [0, 1], got {value}"
                    ));
                }
            }
        }
        _ => {}
    }
}

fn validate_service(settings: &Settings, problems: &mut Vec<String>) {
    let service = &settings.service;

    if service.daemon && service.schedule.interval == 0 {
        problems.push("service.schedule.interval must be at least 1".to_string());
    }

    if let Some(delay) = &service.delay {
        if delay.enable && delay.time == 0 {
            problems.push("service.delay.time must be at least 1 when enabled".to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_settings() -> Settings {
        serde_yaml::from_str(
            r#"
proxmox_api:
  hosts: ["pve01.example.com"]
  user: proxlb@pve
  pass: secret
"#,
        )
        .unwrap()
    }

    #[test]
    fn test_minimal_config_is_valid() {
        assert!(validate(&base_settings()).is_ok());
    }

    #[test]
    fn test_missing_credentials() {
        let mut settings = base_settings();
        settings.proxmox_api.pass = None;
        let err = validate(&settings).unwrap_err().to_string();
        assert!(err.contains("pass or token_id"));
    }

    #[test]
    fn test_token_without_secret() {
        let mut settings = base_settings();
        settings.proxmox_api.pass = None;
        settings.proxmox_api.token_id = Some("proxlb".to_string());
        let err = validate(&settings).unwrap_err().to_string();
        assert!(err.contains("token_secret"));
    }

    #[test]
    fn test_token_id_with_embedded_user_is_rejected() {
        let mut settings = base_settings();
        settings.proxmox_api.token_id = Some("proxlb@pve!token".to_string());
        settings.proxmox_api.token_secret = Some("s3cret".to_string());
        let err = validate(&settings).unwrap_err().to_string();
        assert!(err.contains("bare token name"));
    }

    #[test]
    fn test_user_without_realm() {
        let mut settings = base_settings();
        settings.proxmox_api.user = "root".to_string();
        let err = validate(&settings).unwrap_err().to_string();
        assert!(err.contains("realm"));
    }

    #[test]
    fn test_zero_parallel_jobs() {
        let mut settings = base_settings();
        settings.balancing.parallel_jobs = 0;
        let err = validate(&settings).unwrap_err().to_string();
        assert!(err.contains("parallel_jobs"));
    }

    #[test]
    fn test_psi_mode_requires_thresholds() {
        let mut settings = base_settings();
        settings.balancing.mode = Mode::Psi;
        let err = validate(&settings).unwrap_err().to_string();
        assert!(err.contains("psi thresholds"));
    }

    #[test]
    fn test_psi_thresholds_must_be_fractions() {
        let mut settings = base_settings();
        settings.balancing.mode = Mode::Psi;
        settings.balancing.psi = Some(crate::inventory::model::PsiTriplet::new(0.1, 1.5, 0.2));
        let err = validate(&settings).unwrap_err().to_string();
        assert!(err.contains("psi.full"));
    }

    #[test]
    fn test_bad_endpoint_reported_with_host() {
        let mut settings = base_settings();
        settings.proxmox_api.hosts = vec!["pve01:notaport".to_string()];
        let err = validate(&settings).unwrap_err().to_string();
        assert!(err.contains("pve01:notaport"));
    }

    #[test]
    fn test_multiple_problems_collected() {
        let mut settings = base_settings();
        settings.proxmox_api.pass = None;
        settings.balancing.parallel_jobs = 0;
        let err = validate(&settings).unwrap_err().to_string();
        assert!(err.contains("parallel_jobs"));
        assert!(err.contains("pass or token_id"));
    }
}
