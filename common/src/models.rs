// Data models for scan requests, assessments and evaluation metrics

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Verdict returned to the extension
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Safety {
    Safe,
    Suspicious,
    Dangerous,
}

impl Safety {
    pub fn as_str(&self) -> &'static str {
        match self {
            Safety::Safe => "safe",
            Safety::Suspicious => "suspicious",
            Safety::Dangerous => "dangerous",
        }
    }
}

impl fmt::Display for Safety {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Safety {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "safe" => Ok(Safety::Safe),
            "suspicious" => Ok(Safety::Suspicious),
            "dangerous" => Ok(Safety::Dangerous),
            _ => Err(format!("Invalid safety verdict: {}", s)),
        }
    }
}

/// Body of `POST /api/scan`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanRequest {
    pub url: String,
    #[serde(default)]
    pub scan_data: Option<PageSignals>,
}

/// Page signals gathered by the extension's content script
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageSignals {
    #[serde(default)]
    pub forms: Vec<FormSignal>,
    #[serde(default)]
    pub links: LinkSignal,
    #[serde(default)]
    pub meta: Option<MetaSignal>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FormSignal {
    #[serde(default)]
    pub action: String,
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub has_password_field: bool,
    #[serde(default)]
    pub input_count: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LinkSignal {
    #[serde(default)]
    pub total: u32,
    #[serde(default)]
    pub external: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetaSignal {
    #[serde(default)]
    pub is_https: bool,
    #[serde(default)]
    pub title: String,
}

/// Detector output returned to the extension
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assessment {
    pub safety: Safety,
    /// 0-100
    pub confidence: u8,
    pub reasons: Vec<String>,
    pub assessed_at: DateTime<Utc>,
}

/// One persisted evaluation row. Only the URL host is stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationMetric {
    pub id: Uuid,
    pub url_host: String,
    pub safety: Safety,
    pub confidence: u8,
    pub reason_count: u32,
    pub detector_micros: u64,
    pub recorded_at: DateTime<Utc>,
}

impl EvaluationMetric {
    pub fn from_assessment(url_host: impl Into<String>, assessment: &Assessment, detector_micros: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            url_host: url_host.into(),
            safety: assessment.safety,
            confidence: assessment.confidence,
            reason_count: assessment.reasons.len() as u32,
            detector_micros,
            recorded_at: assessment.assessed_at,
        }
    }
}

/// Aggregate over all persisted evaluations
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvaluationSummary {
    pub total: i64,
    pub safe: i64,
    pub suspicious: i64,
    pub dangerous: i64,
    pub mean_confidence: Option<f64>,
    pub last_recorded_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_safety_round_trip_through_str() {
        for safety in [Safety::Safe, Safety::Suspicious, Safety::Dangerous] {
            assert_eq!(safety.as_str().parse::<Safety>().unwrap(), safety);
        }
        assert!("unknown".parse::<Safety>().is_err());
    }

    #[test]
    fn test_scan_request_accepts_extension_payload() {
        let payload = serde_json::json!({
            "url": "http://example.test/login",
            "scan_data": {
                "forms": [{
                    "action": "http://collector.test/post",
                    "method": "post",
                    "hasPasswordField": true,
                    "inputCount": 3
                }],
                "links": { "total": 12, "external": 9 },
                "meta": { "isHttps": false, "title": "Sign in" }
            }
        });

        let request: ScanRequest = serde_json::from_value(payload).unwrap();
        let signals = request.scan_data.unwrap();
        assert!(signals.forms[0].has_password_field);
        assert_eq!(signals.links.external, 9);
        assert!(!signals.meta.unwrap().is_https);
    }

    #[test]
    fn test_scan_request_without_scan_data() {
        let request: ScanRequest =
            serde_json::from_str(r#"{"url": "https://example.test"}"#).unwrap();
        assert!(request.scan_data.is_none());
    }

    #[test]
    fn test_metric_keeps_only_host() {
        let assessment = Assessment {
            safety: Safety::Suspicious,
            confidence: 60,
            reasons: vec!["a".to_string(), "b".to_string()],
            assessed_at: Utc::now(),
        };
        let metric = EvaluationMetric::from_assessment("example.test", &assessment, 42);
        assert_eq!(metric.url_host, "example.test");
        assert_eq!(metric.reason_count, 2);
        assert_eq!(metric.safety, Safety::Suspicious);
    }
}
