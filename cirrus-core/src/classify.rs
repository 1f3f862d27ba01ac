//! Error classification
//!
//! One function decides what a failed call means. The cloud-specific parts
//! (busy codes, codes that mean "gone") live in a per-service [`ServiceRules`]
//! table so each service can extend them without touching the others.

use std::collections::HashSet;
use std::time::Duration;

use crate::error::{ApiError, Dependent, Verdict};

/// Classification table for one cloud service
#[derive(Debug, Clone)]
pub struct ServiceRules {
    pub service: String,
    busy_codes: HashSet<String>,
    absent_codes: HashSet<String>,
    pub busy_retry_after: Duration,
    pub rate_limit_retry_after: Duration,
    pub transport_retry_after: Duration,
    /// Delay for a 409 that names no dependents; `None` makes it terminal
    pub conflict_retry_after: Option<Duration>,
}

impl Default for ServiceRules {
    fn default() -> Self {
        Self::new("default")
    }
}

impl ServiceRules {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            busy_codes: HashSet::new(),
            absent_codes: HashSet::new(),
            busy_retry_after: Duration::from_secs(10),
            rate_limit_retry_after: Duration::from_secs(60),
            transport_retry_after: Duration::from_secs(5),
            conflict_retry_after: Some(Duration::from_secs(10)),
        }
    }

    /// Error codes meaning "another operation is in progress"
    pub fn with_busy_codes(mut self, codes: &[&str]) -> Self {
        self.busy_codes.extend(codes.iter().map(|c| c.to_string()));
        self
    }

    /// Error codes meaning the resource has been garbage-collected
    pub fn with_absent_codes(mut self, codes: &[&str]) -> Self {
        self.absent_codes.extend(codes.iter().map(|c| c.to_string()));
        self
    }

    pub fn with_busy_retry_after(mut self, d: Duration) -> Self {
        self.busy_retry_after = d;
        self
    }

    pub fn with_conflict_retry(mut self, d: Option<Duration>) -> Self {
        self.conflict_retry_after = d;
        self
    }

    pub fn is_busy_code(&self, code: &str) -> bool {
        self.busy_codes.contains(code)
    }

    /// Classify a failed call. Rules are evaluated in order.
    pub fn classify(&self, err: &ApiError) -> Verdict {
        match err {
            ApiError::Http { status, .. } => self.classify_http(*status, err),
            ApiError::Timeout(_) | ApiError::Connection(_) => {
                Verdict::Retry(self.transport_retry_after)
            }
            ApiError::Decode(msg) => Verdict::Internal(msg.clone()),
        }
    }

    fn classify_http(&self, status: u16, err: &ApiError) -> Verdict {
        let code = err.error_code();

        if status == 404 {
            return Verdict::Absent;
        }

        if status == 409 {
            let dependents = err.body_json().map(|b| parse_dependents(&b)).unwrap_or_default();
            if !dependents.is_empty() {
                return Verdict::DependencyConflict(dependents);
            }
            if let Some(after) = self.conflict_retry_after {
                return Verdict::Retry(after);
            }
        }

        if status == 429 {
            return Verdict::Retry(self.rate_limit_retry_after);
        }

        if let Some(code) = code.as_deref() {
            if status == 400 && self.busy_codes.contains(code) {
                return Verdict::Retry(self.busy_retry_after);
            }
            if self.absent_codes.contains(code) {
                return Verdict::Absent;
            }
        }

        if (400..500).contains(&status) {
            let message = err.error_message().unwrap_or_else(|| err.to_string());
            return Verdict::ValidationFailed(match code {
                Some(code) => format!("{} ({})", message, code),
                None => message,
            });
        }

        Verdict::Internal(err.to_string())
    }
}

/// Collect dependents from a 409 body: every `<kind>_ids` array of strings
fn parse_dependents(body: &serde_json::Value) -> Vec<Dependent> {
    let Some(object) = body.as_object() else {
        return Vec::new();
    };
    let mut out = Vec::new();
    for (key, value) in object {
        let kind = match key.strip_suffix("_ids") {
            Some(kind) if !kind.is_empty() => kind,
            _ if key == "ids" => "resource",
            _ => continue,
        };
        if let Some(ids) = value.as_array() {
            out.extend(
                ids.iter()
                    .filter_map(|v| v.as_str())
                    .map(|id| Dependent::new(kind, id)),
            );
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache_rules() -> ServiceRules {
        ServiceRules::new("dcs")
            .with_busy_codes(&["DCS.4026", "CBC.99003651"])
            .with_busy_retry_after(Duration::from_secs(5))
    }

    #[test]
    fn not_found_is_absent() {
        assert_eq!(cache_rules().classify(&ApiError::http(404, "")), Verdict::Absent);
    }

    #[test]
    fn conflict_with_listener_ids_names_dependents() {
        let err = ApiError::http(409, r#"{"listener_ids":["L1","L2"]}"#);
        assert_eq!(
            cache_rules().classify(&err),
            Verdict::DependencyConflict(vec![
                Dependent::new("listener", "L1"),
                Dependent::new("listener", "L2"),
            ])
        );
    }

    #[test]
    fn conflict_without_dependents_is_retried_unless_disabled() {
        let err = ApiError::http(409, r#"{"error_msg":"in progress"}"#);
        assert_eq!(
            cache_rules().classify(&err),
            Verdict::Retry(Duration::from_secs(10))
        );
        let strict = cache_rules().with_conflict_retry(None);
        assert!(matches!(strict.classify(&err), Verdict::ValidationFailed(_)));
    }

    #[test]
    fn rate_limit_waits_a_minute() {
        assert_eq!(
            cache_rules().classify(&ApiError::http(429, "")),
            Verdict::Retry(Duration::from_secs(60))
        );
    }

    #[test]
    fn busy_codes_are_service_scoped() {
        let err = ApiError::http(400, r#"{"error_code":"DCS.4026","error_msg":"busy"}"#);
        assert_eq!(
            cache_rules().classify(&err),
            Verdict::Retry(Duration::from_secs(5))
        );
        assert!(matches!(
            ServiceRules::new("elb").classify(&err),
            Verdict::ValidationFailed(_)
        ));
    }

    #[test]
    fn absent_codes_map_to_absent() {
        let rules = ServiceRules::new("drs").with_absent_codes(&["DRS.M00289"]);
        let err = ApiError::http(400, r#"{"error_code":"DRS.M00289"}"#);
        assert_eq!(rules.classify(&err), Verdict::Absent);
    }

    #[test]
    fn other_client_errors_are_validation_failures() {
        let err = ApiError::http(400, r#"{"error_code":"DCS.4001","error_msg":"bad flavor"}"#);
        assert_eq!(
            cache_rules().classify(&err),
            Verdict::ValidationFailed("bad flavor (DCS.4001)".to_string())
        );
    }

    #[test]
    fn transport_failures_are_retried() {
        assert_eq!(
            cache_rules().classify(&ApiError::Timeout("read".into())),
            Verdict::Retry(Duration::from_secs(5))
        );
        assert_eq!(
            cache_rules().classify(&ApiError::Connection("reset".into())),
            Verdict::Retry(Duration::from_secs(5))
        );
    }

    #[test]
    fn server_errors_are_internal() {
        assert!(matches!(
            cache_rules().classify(&ApiError::http(500, "oops")),
            Verdict::Internal(_)
        ));
    }
}
