//! Traffic scoring through an OpenAI-compatible chat completion API.
//!
//! The model receives the extracted feature vector together with a short
//! catalogue of attack patterns and must answer with a JSON assessment. The
//! assessment's confidence becomes the prediction probability, so alerts go
//! through the same threshold and storage path as the process predictor.

use crate::error::PredictorError;
use crate::ids_adapter::{Prediction, Predictor};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Duration;
use tracing::debug;

const SYSTEM_PROMPT: &str = "You are a network security analyst. Analyse network traffic data for \
     anomalous or malicious activity and answer with a single JSON object.";

const ATTACK_PATTERNS: [(&str, &str); 5] = [
    ("Port scanning", "many connections to different ports from one address in a short time"),
    ("DDoS", "a large number of connections to one address or port in a short time"),
    ("Brute force", "repeated failed connection attempts against authentication services"),
    ("Data exfiltration", "unusual upload volume from an internal address"),
    ("C2 communication", "regular connections to an unknown address on a fixed schedule"),
];

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 2],
    response_format: ResponseFormat,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Deserialize)]
struct ChatReply {
    content: Option<String>,
}

/// What the model is asked to return for one traffic sample.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TrafficAssessment {
    pub anomaly_detected: bool,
    pub confidence: f64,
    #[serde(default)]
    pub anomaly_type: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub severity: Option<String>,
    #[serde(default)]
    pub recommended_action: Option<String>,
}

impl TrafficAssessment {
    fn into_prediction(self) -> Prediction {
        Prediction {
            is_anomaly: self.anomaly_detected,
            probability: self.confidence,
            error: None,
        }
    }
}

pub fn analysis_prompt(features: &Value) -> String {
    let traffic = serde_json::to_string_pretty(features).unwrap_or_else(|_| features.to_string());
    let patterns: String = ATTACK_PATTERNS
        .iter()
        .map(|(name, description)| format!("- {}: {}\n", name, description))
        .collect();
    format!(
        "Analyse the following network traffic features for anomalous activity:\n\n{}\n\n\
         Common attack patterns to look for:\n{}\n\
         Answer with JSON of the form {{\"anomaly_detected\": boolean, \"confidence\": number between 0 and 1, \
         \"anomaly_type\": string, \"description\": string, \"severity\": string, \"recommended_action\": string}}",
        traffic, patterns
    )
}

/// Extracts the assessment from a chat completion response body. A
/// confidence above 1 is read as a percentage.
pub fn parse_chat_completion(body: &str) -> Result<TrafficAssessment, PredictorError> {
    let response: ChatResponse =
        serde_json::from_str(body).map_err(|e| PredictorError::Malformed(format!("completion: {}", e)))?;
    let content = response
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.message.content)
        .ok_or_else(|| PredictorError::Malformed("completion has no content".to_string()))?;

    let mut assessment: TrafficAssessment = serde_json::from_str(content.trim())
        .map_err(|e| PredictorError::Malformed(format!("{}: {}", e, content)))?;

    if assessment.confidence > 1.0 && assessment.confidence <= 100.0 {
        assessment.confidence /= 100.0;
    }
    if !assessment.confidence.is_finite() || !(0.0..=1.0).contains(&assessment.confidence) {
        return Err(PredictorError::Malformed(format!(
            "confidence {} outside [0, 1]",
            assessment.confidence
        )));
    }
    Ok(assessment)
}

pub struct LlmPredictor {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    timeout: Duration,
}

impl LlmPredictor {
    pub fn new(
        base_url: &str,
        api_key: impl Into<String>,
        model: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, PredictorError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PredictorError::Http(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            model: model.into(),
            timeout,
        })
    }
}

#[async_trait]
impl Predictor for LlmPredictor {
    async fn predict(&self, features: &Value) -> Result<Prediction, PredictorError> {
        let url = format!("{}/chat/completions", self.base_url);
        let prompt = analysis_prompt(features);
        let request = ChatRequest {
            model: &self.model,
            messages: [
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT,
                },
                ChatMessage {
                    role: "user",
                    content: &prompt,
                },
            ],
            response_format: ResponseFormat { kind: "json_object" },
        };

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    PredictorError::Timeout(self.timeout.as_millis() as u64)
                } else {
                    PredictorError::Http(e.to_string())
                }
            })?;

        let status = response.status();
        let body = response.text().await.map_err(|e| PredictorError::Http(e.to_string()))?;
        if !status.is_success() {
            return Err(PredictorError::Http(format!("HTTP {}: {}", status.as_u16(), body)));
        }

        let assessment = parse_chat_completion(&body)?;
        debug!(
            model = %self.model,
            anomaly = assessment.anomaly_detected,
            confidence = assessment.confidence,
            kind = assessment.anomaly_type.as_deref().unwrap_or("none"),
            severity = assessment.severity.as_deref().unwrap_or("unknown"),
            action = assessment.recommended_action.as_deref().unwrap_or("none"),
            description = assessment.description.as_deref().unwrap_or(""),
            "Language model assessment received"
        );
        Ok(assessment.into_prediction())
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::post;
    use axum::{Json, Router};
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    fn completion(content: &str) -> Value {
        json!({
            "id": "chatcmpl-1",
            "object": "chat.completion",
            "choices": [{"index": 0, "message": {"role": "assistant", "content": content}}]
        })
    }

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}/v1/", address)
    }

    #[test]
    fn parses_the_assessment_from_the_first_choice() {
        let body = completion(
            r#"{"anomaly_detected": true, "confidence": 0.91, "anomaly_type": "port_scan", "severity": "high"}"#,
        );

        let assessment = parse_chat_completion(&body.to_string()).unwrap();

        assert!(assessment.anomaly_detected);
        assert_eq!(assessment.confidence, 0.91);
        assert_eq!(assessment.anomaly_type.as_deref(), Some("port_scan"));
        assert_eq!(assessment.recommended_action, None);
    }

    #[test]
    fn percentage_confidence_is_scaled() {
        let body = completion(r#"{"anomaly_detected": false, "confidence": 35}"#);
        assert_eq!(parse_chat_completion(&body.to_string()).unwrap().confidence, 0.35);

        let body = completion(r#"{"anomaly_detected": false, "confidence": 350}"#);
        assert!(matches!(
            parse_chat_completion(&body.to_string()),
            Err(PredictorError::Malformed(_))
        ));
    }

    #[test]
    fn missing_or_unstructured_content_is_malformed() {
        assert!(parse_chat_completion(r#"{"choices": []}"#).is_err());
        assert!(parse_chat_completion(&completion("I think this looks fine.").to_string()).is_err());
        assert!(parse_chat_completion("<html>").is_err());
    }

    #[test]
    fn prompt_carries_features_and_patterns() {
        let prompt = analysis_prompt(&json!({"Destination Port": 22.0}));
        assert!(prompt.contains("Destination Port"));
        assert!(prompt.contains("Port scanning"));
        assert!(prompt.contains("anomaly_detected"));
    }

    #[tokio::test]
    async fn predicts_through_the_chat_endpoint() {
        let seen: Arc<Mutex<Option<(String, Value)>>> = Arc::new(Mutex::new(None));
        let captured = seen.clone();
        let app = Router::new().route(
            "/v1/chat/completions",
            post(move |headers: HeaderMap, Json(request): Json<Value>| {
                let captured = captured.clone();
                async move {
                    let auth = headers
                        .get("authorization")
                        .and_then(|value| value.to_str().ok())
                        .unwrap_or_default()
                        .to_string();
                    *captured.lock().unwrap() = Some((auth, request));
                    Json(completion(r#"{"anomaly_detected": true, "confidence": 0.82}"#))
                }
            }),
        );
        let base_url = serve(app).await;
        let predictor = LlmPredictor::new(&base_url, "sk-test", "gpt-4o", Duration::from_secs(5)).unwrap();

        let prediction = predictor.predict(&json!({"Flow Duration": 1.0})).await.unwrap();

        assert_eq!(
            prediction,
            Prediction {
                is_anomaly: true,
                probability: 0.82,
                error: None
            }
        );
        assert_eq!(predictor.model_name(), "gpt-4o");
        let (auth, request) = seen.lock().unwrap().clone().unwrap();
        assert_eq!(auth, "Bearer sk-test");
        assert_eq!(request["model"], "gpt-4o");
        assert_eq!(request["response_format"]["type"], "json_object");
        assert!(request["messages"][1]["content"].as_str().unwrap().contains("Flow Duration"));
    }

    #[tokio::test]
    async fn error_status_is_a_predictor_failure() {
        let app = Router::new().route(
            "/v1/chat/completions",
            post(|| async { (StatusCode::TOO_MANY_REQUESTS, "rate limited") }),
        );
        let base_url = serve(app).await;
        let predictor = LlmPredictor::new(&base_url, "sk-test", "gpt-4o", Duration::from_secs(5)).unwrap();

        let err = predictor.predict(&json!({})).await.unwrap_err();

        match err {
            PredictorError::Http(message) => assert!(message.contains("429")),
            other => panic!("unexpected error {:?}", other),
        }
    }
}
