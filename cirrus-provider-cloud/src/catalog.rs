//! Service catalog
//!
//! Maps a service key to its regional endpoint. Endpoints come from the
//! configuration's `endpoints` overrides when present, otherwise from the
//! templates below. Some services are only offered in a subset of regions;
//! asking for one elsewhere fails with a `ServiceUnavailable` error naming
//! the service. That error must never be `Absent`, or a read would drop the
//! resource from state.
//!
//! ## Derived v3 endpoints
//!
//! A few v2 resources rely on a sub-operation that only exists in the v3 API
//! (the load balancer listener's `transparent_client_ip_enable` switch). The
//! catalog carries no entry for those v3 endpoints: they are synthesized from
//! the v2 endpoint by rewriting the version segment of the path. This
//! couples two API generations through a URL convention and breaks silently
//! if the cloud ever moves the v3 API elsewhere. Keep every use of it behind
//! [`Catalog::derived_v3`].

use std::collections::BTreeMap;

use cirrus_core::error::{ErrorKind, ProviderError};

/// Static description of one service
#[derive(Debug, Clone, Copy)]
pub struct ServiceEntry {
    pub key: &'static str,
    /// `{region}`, `{cloud}` and `{project_id}` are substituted
    pub template: &'static str,
    /// Regions the service is offered in; `None` means everywhere
    pub regions: Option<&'static [&'static str]>,
    /// Whether the endpoint path embeds the project ID
    pub project_scoped: bool,
}

pub const SERVICES: &[ServiceEntry] = &[
    ServiceEntry {
        key: "iam",
        template: "https://iam.{region}.{cloud}/v3",
        regions: None,
        project_scoped: false,
    },
    ServiceEntry {
        key: "dcs",
        template: "https://dcs.{region}.{cloud}/v2/{project_id}",
        regions: None,
        project_scoped: true,
    },
    ServiceEntry {
        key: "elb",
        template: "https://elb.{region}.{cloud}/v2/{project_id}",
        regions: None,
        project_scoped: true,
    },
    ServiceEntry {
        key: "er",
        template: "https://er.{region}.{cloud}/v3/{project_id}",
        regions: Some(&[
            "cn-north-4",
            "cn-east-3",
            "cn-south-1",
            "ap-southeast-1",
            "ap-southeast-2",
            "ap-southeast-3",
            "la-south-2",
        ]),
        project_scoped: true,
    },
    ServiceEntry {
        key: "drs",
        template: "https://drs.{region}.{cloud}/v3/{project_id}",
        regions: None,
        project_scoped: true,
    },
];

#[derive(Debug, Clone)]
pub struct Catalog {
    cloud: String,
    overrides: BTreeMap<String, String>,
}

impl Catalog {
    pub fn new(cloud: impl Into<String>, overrides: BTreeMap<String, String>) -> Self {
        Self {
            cloud: cloud.into(),
            overrides,
        }
    }

    pub fn entry(&self, service: &str) -> Result<&'static ServiceEntry, ProviderError> {
        SERVICES
            .iter()
            .find(|e| e.key == service)
            .ok_or_else(|| ProviderError::validation(format!("unknown service '{}'", service)))
    }

    /// Endpoint of `service` in `region`
    pub fn endpoint(
        &self,
        service: &str,
        region: &str,
        project_id: &str,
    ) -> Result<String, ProviderError> {
        let entry = self.entry(service)?;
        if let Some(url) = self.overrides.get(service) {
            return Ok(substitute(url, region, &self.cloud, project_id));
        }
        if entry.regions.is_some_and(|regions| !regions.contains(&region)) {
            return Err(ProviderError::new(format!(
                "service '{}' is not available in region '{}'",
                service, region
            ))
            .with_kind(ErrorKind::Validation)
            .with_code("ServiceUnavailable"));
        }
        Ok(substitute(entry.template, region, &self.cloud, project_id))
    }

    /// v3 endpoint synthesized from a v2 (or v2.0) endpoint
    pub fn derived_v3(
        &self,
        service: &str,
        region: &str,
        project_id: &str,
    ) -> Result<String, ProviderError> {
        let v2 = self.endpoint(service, region, project_id)?;
        rewrite_to_v3(&v2, project_id).ok_or_else(|| {
            ProviderError::new(format!(
                "cannot derive a v3 endpoint for '{}' from {}",
                service, v2
            ))
        })
    }
}

fn substitute(template: &str, region: &str, cloud: &str, project_id: &str) -> String {
    template
        .replace("{region}", region)
        .replace("{cloud}", cloud)
        .replace("{project_id}", project_id)
        .trim_end_matches('/')
        .to_string()
}

/// Replace the `/v1`, `/v2` or `/v2.0` path segment with `/v3/{project_id}`
/// (dropping a project ID that already follows it)
fn rewrite_to_v3(endpoint: &str, project_id: &str) -> Option<String> {
    let mut url = url::Url::parse(endpoint).ok()?;
    let segments: Vec<String> = url.path_segments()?.map(str::to_string).collect();
    let at = segments
        .iter()
        .position(|s| matches!(s.as_str(), "v1" | "v1.0" | "v2" | "v2.0"))?;

    let mut rewritten: Vec<String> = segments[..at].to_vec();
    rewritten.push("v3".to_string());
    rewritten.push(project_id.to_string());
    let rest = &segments[at + 1..];
    let rest = match rest.first() {
        Some(first) if first == project_id => &rest[1..],
        _ => rest,
    };
    rewritten.extend(rest.iter().cloned());

    url.set_path(&format!("/{}", rewritten.join("/")));
    Some(url.to_string().trim_end_matches('/').to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> Catalog {
        Catalog::new("example.com", BTreeMap::new())
    }

    #[test]
    fn templates_are_filled_in() {
        assert_eq!(
            catalog().endpoint("dcs", "cn-north-4", "p1").unwrap(),
            "https://dcs.cn-north-4.example.com/v2/p1"
        );
        assert_eq!(
            catalog().endpoint("iam", "cn-north-4", "p1").unwrap(),
            "https://iam.cn-north-4.example.com/v3"
        );
    }

    #[test]
    fn overrides_win() {
        let overrides = BTreeMap::from([("elb".to_string(), "https://lb.internal/v2/{project_id}/".to_string())]);
        let catalog = Catalog::new("example.com", overrides);
        assert_eq!(catalog.endpoint("elb", "r", "p").unwrap(), "https://lb.internal/v2/p");
    }

    #[test]
    fn regional_availability_is_enforced() {
        let err = catalog().endpoint("er", "eu-west-101", "p").unwrap_err();
        assert_eq!(err.code.as_deref(), Some("ServiceUnavailable"));
        assert!(!err.is_absent());
        assert!(err.message.contains("'er'"));
        assert!(catalog().endpoint("er", "cn-north-4", "p").is_ok());
    }

    #[test]
    fn unknown_service() {
        assert!(catalog().endpoint("nope", "r", "p").is_err());
    }

    #[test]
    fn v3_is_derived_from_v2() {
        assert_eq!(
            catalog().derived_v3("elb", "cn-north-4", "p1").unwrap(),
            "https://elb.cn-north-4.example.com/v3/p1"
        );
        assert_eq!(
            rewrite_to_v3("https://elb.r.example.com/v2.0", "p1").unwrap(),
            "https://elb.r.example.com/v3/p1"
        );
        assert!(rewrite_to_v3("https://elb.r.example.com/api", "p1").is_none());
    }
}
