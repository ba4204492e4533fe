use std::collections::BTreeSet;

use kube::ResourceExt;
use thiserror::Error;

use super::{CompositeApp, GatewaySpec, TrafficPolicySpec, VersionEntry, REMOVED};

/// A spec rejected before any child is generated.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{path}: {message}")]
pub struct ValidationError {
    pub path: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self { Self { path: path.into(), message: message.into() } }
}

type Result = std::result::Result<(), ValidationError>;

impl CompositeApp {
    /// Checks everything the generators rely on. The first violation wins.
    pub fn validate(&self) -> Result {
        dns_label("metadata.name", &self.name_any())?;
        if let Some(policy) = &self.spec.policy { validate_policy(policy)?; }
        if let Some(gateway) = &self.spec.gateway { validate_gateway(gateway, self)?; }
        let mut seen = BTreeSet::new();
        for (i, entry) in self.spec.apps.iter().enumerate() {
            validate_entry(&format!("spec.apps[{i}]"), entry)?;
            if !seen.insert(entry.version.as_str()) {
                return Err(ValidationError::new(format!("spec.apps[{i}].version"), format!("duplicate version {:?}", entry.version)));
            }
        }
        Ok(())
    }
}

fn dns_label(path: &str, value: &str) -> Result {
    let valid = !value.is_empty()
        && value.len() <= 63
        && value.bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
        && !value.starts_with('-')
        && !value.ends_with('-');
    if valid { Ok(()) } else { Err(ValidationError::new(path, format!("{value:?} is not a valid DNS-1123 label"))) }
}

fn duration(path: &str, value: &str) -> Result {
    humantime::parse_duration(value.trim()).map(|_| ()).map_err(|e| ValidationError::new(path, format!("invalid duration {value:?}: {e}")))
}

fn percent(path: &str, value: f64) -> Result {
    if (0.0..=100.0).contains(&value) { Ok(()) } else { Err(ValidationError::new(path, format!("percent {value} outside 0..=100"))) }
}

fn validate_entry(path: &str, entry: &VersionEntry) -> Result {
    if entry.version.is_empty() { return Err(ValidationError::new(format!("{path}.version"), "version must not be empty")); }
    dns_label(&format!("{path}.version"), &entry.version)?;
    if entry.image.trim().is_empty() { return Err(ValidationError::new(format!("{path}.image"), "image must not be empty")); }
    match entry.min_replicas {
        REMOVED => {}
        n if n <= 0 => return Err(ValidationError::new(format!("{path}.minReplicas"), format!("must be positive or {REMOVED}, got {n}"))),
        n if entry.max_replicas < n => {
            return Err(ValidationError::new(format!("{path}.maxReplicas"), format!("{} is less than minReplicas {n}", entry.max_replicas)))
        }
        _ => {}
    }
    if !(1..=65535).contains(&entry.port) {
        return Err(ValidationError::new(format!("{path}.port"), format!("{} is not a valid port", entry.port)));
    }
    Ok(())
}

fn validate_gateway(gateway: &GatewaySpec, app: &CompositeApp) -> Result {
    if gateway.hosts.is_empty() || gateway.hosts.iter().any(|h| h.trim().is_empty()) {
        return Err(ValidationError::new("spec.gateway.hosts", "at least one non-empty host is required"));
    }
    if gateway.weights.is_empty() { return Err(ValidationError::new("spec.gateway.weights", "weights must not be empty")); }
    let mut total = 0i64;
    for (version, weight) in &gateway.weights {
        let path = format!("spec.gateway.weights.{version}");
        if app.version(version).is_none() { return Err(ValidationError::new(path, "names no declared version")); }
        if *weight < 0 { return Err(ValidationError::new(path, format!("negative weight {weight}"))); }
        total += i64::from(*weight);
    }
    if total != 100 { return Err(ValidationError::new("spec.gateway.weights", format!("weights sum to {total}, expected 100"))); }
    for version in gateway.routes.keys() {
        if app.version(version).is_none() {
            return Err(ValidationError::new(format!("spec.gateway.routes.{version}"), "names no declared version"));
        }
    }
    Ok(())
}

fn validate_policy(policy: &TrafficPolicySpec) -> Result {
    if let Some(timeout) = &policy.timeout { duration("spec.policy.timeout", timeout)?; }
    if let Some(max) = policy.max_requests {
        if max <= 0 { return Err(ValidationError::new("spec.policy.maxRequests", format!("must be positive, got {max}"))); }
    }
    if let Some(retries) = &policy.retries {
        if retries.attempts <= 0 {
            return Err(ValidationError::new("spec.policy.retries.attempts", format!("must be positive, got {}", retries.attempts)));
        }
        if let Some(per_try) = &retries.per_try_timeout { duration("spec.policy.retries.perTryTimeout", per_try)?; }
    }
    if let Some(fault) = &policy.fault {
        if let Some(delay) = &fault.delay {
            duration("spec.policy.fault.delay.delay", &delay.delay)?;
            percent("spec.policy.fault.delay.percent", delay.percent)?;
        }
        if let Some(abort) = &fault.abort {
            percent("spec.policy.fault.abort.percent", abort.percent)?;
            if !(100..=599).contains(&abort.http_status) {
                return Err(ValidationError::new("spec.policy.fault.abort.httpStatus", format!("{} is not an HTTP status", abort.http_status)));
            }
        }
    }
    if let Some(outlier) = &policy.outlier_detection {
        if outlier.consecutive_errors == 0 {
            return Err(ValidationError::new("spec.policy.outlierDetection.consecutiveErrors", "must be positive"));
        }
        if let Some(interval) = &outlier.interval { duration("spec.policy.outlierDetection.interval", interval)?; }
        if let Some(ejection) = &outlier.ejection_time { duration("spec.policy.outlierDetection.ejectionTime", ejection)?; }
    }
    Ok(())
}
