// Phishing assessment: request validation and the default rule-based detector.
// The detector sits behind a trait so a model-backed implementation can
// replace it without touching the handlers.

use crate::errors::ValidationError;
use crate::models::{Assessment, PageSignals, Safety};
use chrono::Utc;
use std::net::IpAddr;
use url::{Host, Url};

const MAX_URL_LENGTH: usize = 2048;
const LONG_URL_THRESHOLD: usize = 100;
const SUSPICIOUS_THRESHOLD: u32 = 30;
const DANGEROUS_THRESHOLD: u32 = 60;

const LURE_KEYWORDS: &[&str] = &[
    "login", "signin", "verify", "account", "secure", "update", "banking", "wallet", "password",
];

/// Assesses a target URL and the page signals gathered for it
pub trait PhishingDetector: Send + Sync {
    fn assess(&self, target: &Url, signals: Option<&PageSignals>) -> Assessment;
}

/// Parse and validate the URL submitted for scanning
pub fn parse_target(raw: &str) -> Result<Url, ValidationError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(ValidationError::MissingField("url".to_string()));
    }
    if raw.len() > MAX_URL_LENGTH {
        return Err(ValidationError::InvalidFieldValue {
            field: "url".to_string(),
            reason: format!("longer than {} characters", MAX_URL_LENGTH),
        });
    }

    let url = Url::parse(raw).map_err(|e| ValidationError::InvalidFieldValue {
        field: "url".to_string(),
        reason: e.to_string(),
    })?;

    if !matches!(url.scheme(), "http" | "https") {
        return Err(ValidationError::InvalidFieldValue {
            field: "url".to_string(),
            reason: format!("unsupported scheme '{}'", url.scheme()),
        });
    }
    if url.host_str().is_none() {
        return Err(ValidationError::InvalidFieldValue {
            field: "url".to_string(),
            reason: "missing host".to_string(),
        });
    }
    Ok(url)
}

/// Weighted rule set over URL shape and page signals
#[derive(Debug, Clone, Default)]
pub struct HeuristicDetector;

impl HeuristicDetector {
    pub fn new() -> Self {
        Self
    }

    fn url_findings(&self, target: &Url, findings: &mut Findings) {
        if target.scheme() != "https" {
            findings.add(15, "Page is not served over HTTPS");
        }

        match target.host() {
            Some(Host::Ipv4(_)) | Some(Host::Ipv6(_)) => {
                findings.add(25, "URL uses a raw IP address instead of a domain name");
            }
            Some(Host::Domain(domain)) => {
                if domain.parse::<IpAddr>().is_ok() {
                    findings.add(25, "URL uses a raw IP address instead of a domain name");
                }
                if domain.split('.').any(|label| label.starts_with("xn--")) {
                    findings.add(20, "Domain contains internationalized (punycode) labels");
                }
                if domain.split('.').count() > 4 {
                    findings.add(10, "Domain has an unusually deep subdomain chain");
                }
                if domain.matches('-').count() >= 3 {
                    findings.add(10, "Domain contains many hyphens");
                }
            }
            None => {}
        }

        if !target.username().is_empty() || target.password().is_some() {
            findings.add(25, "URL embeds credentials before the host");
        }

        if target.as_str().len() > LONG_URL_THRESHOLD {
            findings.add(10, "URL is unusually long");
        }

        let haystack = format!(
            "{}{}",
            target.host_str().unwrap_or_default(),
            target.path()
        )
        .to_ascii_lowercase();
        if LURE_KEYWORDS.iter().any(|keyword| haystack.contains(keyword)) {
            findings.add(10, "URL contains credential-lure keywords");
        }
    }

    fn page_findings(&self, target: &Url, signals: &PageSignals, findings: &mut Findings) {
        let password_forms: Vec<_> = signals
            .forms
            .iter()
            .filter(|form| form.has_password_field)
            .collect();

        if !password_forms.is_empty() {
            findings.add(20, "Page contains a login form");

            let page_host = target.host_str().unwrap_or_default();
            let posts_elsewhere = password_forms.iter().any(|form| {
                Url::parse(&form.action)
                    .ok()
                    .and_then(|action| action.host_str().map(str::to_owned))
                    .is_some_and(|host| !host.eq_ignore_ascii_case(page_host))
            });
            if posts_elsewhere {
                findings.add(25, "Login form submits credentials to a different domain");
            }

            let insecure = signals
                .meta
                .as_ref()
                .map(|meta| !meta.is_https)
                .unwrap_or(target.scheme() != "https");
            if insecure {
                findings.add(25, "Password field on a page without HTTPS");
            }
        }

        let links = &signals.links;
        // Counts come from the client; widen before scaling
        let (external, total) = (u64::from(links.external), u64::from(links.total));
        if total >= 5 && external * 5 >= total * 4 {
            findings.add(10, "Multiple external links detected");
        }
    }
}

impl PhishingDetector for HeuristicDetector {
    fn assess(&self, target: &Url, signals: Option<&PageSignals>) -> Assessment {
        let mut findings = Findings::default();
        self.url_findings(target, &mut findings);
        if let Some(signals) = signals {
            self.page_findings(target, signals, &mut findings);
        }
        findings.into_assessment()
    }
}

#[derive(Debug, Default)]
struct Findings {
    score: u32,
    reasons: Vec<String>,
}

impl Findings {
    fn add(&mut self, weight: u32, reason: &str) {
        self.score += weight;
        self.reasons.push(reason.to_string());
    }

    fn into_assessment(self) -> Assessment {
        let score = self.score.min(100);
        let safety = if score >= DANGEROUS_THRESHOLD {
            Safety::Dangerous
        } else if score >= SUSPICIOUS_THRESHOLD {
            Safety::Suspicious
        } else {
            Safety::Safe
        };
        let confidence = match safety {
            Safety::Safe => 100 - score,
            Safety::Suspicious | Safety::Dangerous => score,
        };

        Assessment {
            safety,
            confidence: confidence as u8,
            reasons: self.reasons,
            assessed_at: Utc::now(),
        }
    }
}
