//! HTTP client for the hop annotation service.

use std::collections::HashMap;
use std::time::Instant;

use serde::Serialize;
use tracing::debug;

use crate::config::HopAnnotationConfig;
use crate::hopannotation::{AnnotateError, AnnotatorClient, ClientAnnotations};

/// JSON body sent to the annotation service.
#[derive(Serialize)]
struct AnnotateRequest<'a> {
    ips: &'a [String],
}

/// Annotation service client speaking JSON over HTTP.
pub struct HttpAnnotator {
    http: reqwest::Client,
    url: String,
}

impl HttpAnnotator {
    /// Build a client with the configured request timeout.
    pub fn new(cfg: &HopAnnotationConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(cfg.timeout)
            .build()
            .map_err(|e| anyhow::anyhow!("building annotation HTTP client: {e}"))?;

        Ok(Self {
            http,
            url: cfg.service_url.clone(),
        })
    }
}

impl AnnotatorClient for HttpAnnotator {
    async fn annotate(
        &self,
        ips: Vec<String>,
    ) -> Result<HashMap<String, ClientAnnotations>, AnnotateError> {
        let start = Instant::now();

        let response = self
            .http
            .post(&self.url)
            .json(&AnnotateRequest { ips: &ips })
            .send()
            .await
            .map_err(|e| AnnotateError::Service(format!("requesting {}: {e}", self.url)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AnnotateError::Service(format!(
                "unexpected status {status} from {}: {body}",
                self.url,
            )));
        }

        let annotations: HashMap<String, ClientAnnotations> = response
            .json()
            .await
            .map_err(|e| AnnotateError::Service(format!("decoding annotation response: {e}")))?;

        debug!(
            ips = ips.len(),
            annotated = annotations.len(),
            elapsed = ?start.elapsed(),
            "annotation request complete",
        );

        Ok(annotations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_request_body_shape() {
        let ips = vec!["10.0.0.1".to_string(), "2001:4860::1".to_string()];
        let body = serde_json::to_string(&AnnotateRequest { ips: &ips }).expect("serialize");
        assert_eq!(body, r#"{"ips":["10.0.0.1","2001:4860::1"]}"#);
    }

    #[test]
    fn test_response_decodes_into_annotations() {
        let raw = r#"{
            "10.0.0.1": {
                "Geo": {"ContinentCode": "EU", "CountryCode": "NL", "City": "Amsterdam"},
                "Network": {"ASNumber": 1136, "ASName": "example"}
            },
            "10.0.0.2": {}
        }"#;

        let decoded: HashMap<String, ClientAnnotations> =
            serde_json::from_str(raw).expect("decode");
        assert_eq!(decoded.len(), 2);

        let first = decoded.get("10.0.0.1").expect("entry");
        assert_eq!(first.geo.as_ref().expect("geo").country_code, "NL");
        assert_eq!(first.network.as_ref().expect("network").as_number, 1136);
        assert!(decoded.get("10.0.0.2").expect("entry").geo.is_none());
    }

    #[test]
    fn test_client_builds_from_config() {
        let cfg = HopAnnotationConfig {
            output_path: "/tmp/ann".into(),
            service_url: "http://localhost:8083/annotate".to_string(),
            timeout: Duration::from_secs(5),
        };
        assert!(HttpAnnotator::new(&cfg).is_ok());
    }
}
