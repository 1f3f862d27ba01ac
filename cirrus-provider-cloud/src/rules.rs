//! Per-service error classification tables

use std::sync::LazyLock;
use std::time::Duration;

use cirrus_core::classify::ServiceRules;

/// "Another operation is in progress" codes of the cache service, plus the
/// billing system's "order still processing"
pub const DCS_BUSY_CODES: &[&str] = &[
    "DCS.4026",
    "DCS.4049",
    "DCS.4111",
    "DCS.4113",
    "DCS.4114",
    "DCS.4115",
    "DCS.4116",
    "DCS.4117",
    "DCS.4118",
    "DCS.4120",
    "DCS.4975",
    "CBC.99003651",
];

/// Job lookups answering with these codes mean the job was garbage-collected
pub const DRS_ABSENT_CODES: &[&str] = &["DRS.M00289", "DRS.M05004"];

static DCS: LazyLock<ServiceRules> = LazyLock::new(|| {
    ServiceRules::new("dcs")
        .with_busy_codes(DCS_BUSY_CODES)
        .with_busy_retry_after(Duration::from_secs(5))
});

static DRS: LazyLock<ServiceRules> = LazyLock::new(|| ServiceRules::new("drs").with_absent_codes(DRS_ABSENT_CODES));

// A 409 naming no listeners means the load balancer is PENDING_UPDATE and
// falls through to the default conflict retry
static ELB: LazyLock<ServiceRules> = LazyLock::new(|| ServiceRules::new("elb"));

static ER: LazyLock<ServiceRules> = LazyLock::new(|| ServiceRules::new("er"));

pub fn dcs() -> &'static ServiceRules {
    &DCS
}

pub fn drs() -> &'static ServiceRules {
    &DRS
}

pub fn elb() -> &'static ServiceRules {
    &ELB
}

pub fn er() -> &'static ServiceRules {
    &ER
}

#[cfg(test)]
mod tests {
    use super::*;
    use cirrus_core::error::{ApiError, Verdict};

    fn coded(status: u16, code: &str) -> ApiError {
        ApiError::http(status, format!(r#"{{"error_code":"{}","error_msg":"m"}}"#, code))
    }

    #[test]
    fn every_cache_busy_code_retries_after_five_seconds() {
        for code in DCS_BUSY_CODES {
            assert_eq!(dcs().classify(&coded(400, code)), Verdict::Retry(Duration::from_secs(5)), "{}", code);
        }
    }

    #[test]
    fn busy_codes_do_not_leak_across_services() {
        assert!(matches!(elb().classify(&coded(400, "DCS.4026")), Verdict::ValidationFailed(_)));
        assert!(matches!(drs().classify(&coded(400, "DCS.4026")), Verdict::ValidationFailed(_)));
    }

    #[test]
    fn collected_jobs_are_absent() {
        for code in DRS_ABSENT_CODES {
            assert_eq!(drs().classify(&coded(400, code)), Verdict::Absent);
        }
        assert!(matches!(dcs().classify(&coded(400, "DRS.M00289")), Verdict::ValidationFailed(_)));
    }

    #[test]
    fn listener_conflicts_name_dependents() {
        let err = ApiError::http(409, r#"{"listener_ids":["L"]}"#);
        assert!(matches!(elb().classify(&err), Verdict::DependencyConflict(_)));
        assert!(matches!(er().classify(&ApiError::http(429, "")), Verdict::Retry(_)));
    }
}
