// Config validation
// Startup validation fails fast with every actionable error at once

use crate::config::loader::RenderboxConfig;
use crate::config::types::{RenderboxError, ReapPolicy, Result};
use log::warn;

/// Validation result with detailed errors
#[derive(Debug, Default)]
pub struct ValidationResult {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_error(&mut self, error: String) {
        self.errors.push(error);
    }

    pub fn add_warning(&mut self, warning: String) {
        self.warnings.push(warning);
    }

    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Validate config at startup. Errors are fatal, warnings are logged.
pub fn validate_config(config: &RenderboxConfig) -> Result<ValidationResult> {
    let mut result = ValidationResult::new();

    validate_paths(config, &mut result);
    validate_renderer(config, &mut result);
    validate_screening(config, &mut result);
    validate_locks(config, &mut result);

    if config.mirror.workers == 0 {
        result.add_error("mirror.workers must be at least 1".to_string());
    }
    if config.mirror.queue_capacity == 0 {
        result.add_error("mirror.queue_capacity must be at least 1".to_string());
    }

    for warning in &result.warnings {
        warn!("config: {}", warning);
    }

    if !result.is_valid() {
        return Err(RenderboxError::Config(format!(
            "config validation failed:\n{}",
            result.errors.join("\n")
        )));
    }

    Ok(result)
}

fn validate_paths(config: &RenderboxConfig, result: &mut ValidationResult) {
    let paths = &config.paths;
    let dirs = [
        ("upload_dir", paths.upload_dir()),
        ("output_dir", paths.output_dir()),
        ("lock_dir", paths.lock_dir()),
        ("incoming_dir", paths.incoming_dir()),
    ];

    for (i, (name, dir)) in dirs.iter().enumerate() {
        if dir.as_os_str().is_empty() {
            result.add_error(format!("paths.{} is empty", name));
        }
        for (other_name, other) in dirs.iter().skip(i + 1) {
            if dir == other {
                result.add_error(format!(
                    "paths.{} and paths.{} both point to {}",
                    name,
                    other_name,
                    dir.display()
                ));
            }
        }
    }

    if paths.work_dir.is_relative() {
        result.add_warning(format!(
            "paths.work_dir {} is relative; it resolves against the current directory",
            paths.work_dir.display()
        ));
    }
}

fn validate_renderer(config: &RenderboxConfig, result: &mut ValidationResult) {
    let renderer = &config.renderer;

    if renderer.binary.as_os_str().is_empty() {
        result.add_error("renderer.binary is empty".to_string());
    }
    if renderer.deadline_secs == 0 {
        result.add_error("renderer.deadline_secs cannot be zero".to_string());
    }
    if renderer.output_format.trim().is_empty() {
        result.add_error("renderer.output_format is empty".to_string());
    }
    if renderer.artifact_extension.trim().is_empty() || renderer.artifact_extension.contains('/')
    {
        result.add_error(format!(
            "renderer.artifact_extension {:?} is not a plain extension",
            renderer.artifact_extension
        ));
    }
    if renderer.error_markers.iter().any(|m| m.is_empty()) {
        result.add_error("renderer.error_markers may not contain empty markers".to_string());
    }
    if renderer.error_markers.is_empty() {
        result.add_warning(
            "renderer.error_markers is empty; failures will rely on exit code and artifact only"
                .to_string(),
        );
    }
    if renderer.output_limit_bytes < 4096 {
        result.add_warning(format!(
            "renderer.output_limit_bytes {} is very low; logged output will be mostly cut off",
            renderer.output_limit_bytes
        ));
    }
    if renderer
        .extra_args
        .iter()
        .any(|arg| arg == "-y" || arg == "--enable-autoexec")
    {
        result.add_error(
            "renderer.extra_args may not re-enable embedded script auto-execution".to_string(),
        );
    }
}

fn validate_screening(config: &RenderboxConfig, result: &mut ValidationResult) {
    let validation = &config.validation;

    if validation.magic.is_empty() {
        result.add_error("validation.magic cannot be empty".to_string());
    }
    if validation.max_asset_bytes == 0 {
        result.add_error("validation.max_asset_bytes cannot be zero".to_string());
    }
    if validation.banned_patterns.iter().any(|p| p.is_empty()) {
        result.add_error("validation.banned_patterns may not contain empty patterns".to_string());
    }
    if validation.banned_patterns.is_empty() {
        result.add_warning("validation.banned_patterns is empty; content scan disabled".to_string());
    }
}

fn validate_locks(config: &RenderboxConfig, result: &mut ValidationResult) {
    let locks = &config.locks;
    if locks.lease_ttl_secs == Some(0) {
        result.add_error("locks.lease_ttl_secs cannot be zero".to_string());
    }
    if locks.reap_policy == ReapPolicy::Expired && locks.lease_ttl_secs.is_none() {
        result.add_warning(
            "locks.reap_policy=expired without a lease only reaps markers of dead processes"
                .to_string(),
        );
    }
    if let Some(ttl) = locks.lease_ttl_secs {
        if ttl < config.renderer.deadline_secs {
            result.add_warning(format!(
                "locks.lease_ttl_secs {} is shorter than renderer.deadline_secs {}",
                ttl, config.renderer.deadline_secs
            ));
        }
    }
}
