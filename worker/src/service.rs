//! Handler bodies for the worker's remote interface.
//!
//! The transport is somebody else's problem: calls arrive as [`ServiceCall`]
//! values and leave as [`ServiceResponse`] values, both plain JSON.

use crate::error::{ErrorPayload, TestError};
use crate::gate::{Admission, WorkerGate};
use crate::request::TestRequest;
use model::{TestReport, ValidationResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum ServiceCall {
    Ping,
    TestModel {
        model_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model_url: Option<String>,
    },
    /// `descriptor` is either the parsed document or its YAML/JSON text.
    Validate { descriptor: Value },
}

impl ServiceCall {
    pub fn method(&self) -> &'static str {
        match self {
            ServiceCall::Ping => "ping",
            ServiceCall::TestModel { .. } => "test_model",
            ServiceCall::Validate { .. } => "validate",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorPayload>,
}

impl ServiceResponse {
    pub fn ok(result: Value) -> Self {
        Self {
            success: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(error: &TestError) -> Self {
        Self {
            success: false,
            result: None,
            error: Some(error.to_payload()),
        }
    }

    pub fn from_outcome(outcome: &Result<TestReport, TestError>) -> Self {
        match outcome {
            Ok(report) => Self::ok(report.clone().into_value()),
            Err(e) => Self::err(e),
        }
    }
}

/// What [`ModelTesterService::dispatch`] made of a call.
#[derive(Debug)]
pub enum Dispatch {
    /// Answered already.
    Done(ServiceResponse),
    /// A test with its queue place taken; run it to get the answer.
    Queued(Admission),
}

/// A call plus the caller's correlation id, as read off a line-based stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaggedCall {
    #[serde(default)]
    pub id: Value,
    #[serde(flatten)]
    pub call: ServiceCall,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaggedResponse {
    pub id: Value,
    #[serde(flatten)]
    pub response: ServiceResponse,
}

/// Parses descriptor text. YAML is accepted and, being a superset, so is JSON.
pub fn parse_descriptor(text: &str) -> Result<Value, serde_yaml::Error> {
    serde_yaml::from_str(text)
}

#[derive(Debug, Clone)]
pub struct ModelTesterService {
    gate: Arc<WorkerGate>,
}

impl ModelTesterService {
    pub fn new(gate: Arc<WorkerGate>) -> Self {
        Self { gate }
    }

    pub fn gate(&self) -> &WorkerGate {
        &self.gate
    }

    pub fn ping(&self) -> &'static str {
        "pong"
    }

    pub async fn test_model(
        &self,
        model_id: &str,
        model_url: Option<&str>,
    ) -> Result<TestReport, TestError> {
        self.admit_test(model_id, model_url).await?.run().await
    }

    /// Validates the request and takes its queue place without waiting.
    pub async fn admit_test(
        &self,
        model_id: &str,
        model_url: Option<&str>,
    ) -> Result<Admission, TestError> {
        let request = TestRequest::new(model_id, model_url)?;
        self.gate.enqueue(request).await
    }

    pub fn validate(&self, descriptor: &Value) -> ValidationResult {
        match descriptor {
            Value::String(text) => match parse_descriptor(text) {
                Ok(parsed) => self.gate.submit_validation(&parsed),
                Err(e) => ValidationResult {
                    success: false,
                    details: format!("descriptor is not valid YAML or JSON: {}", e),
                },
            },
            other => self.gate.submit_validation(other),
        }
    }

    pub async fn handle(&self, call: ServiceCall) -> ServiceResponse {
        debug!(method = call.method(), "Handling service call");
        match call {
            ServiceCall::Ping => ServiceResponse::ok(Value::from(self.ping())),
            ServiceCall::TestModel {
                model_id,
                model_url,
            } => ServiceResponse::from_outcome(
                &self.test_model(&model_id, model_url.as_deref()).await,
            ),
            ServiceCall::Validate { descriptor } => {
                let result = self.validate(&descriptor);
                match serde_json::to_value(&result) {
                    Ok(value) => ServiceResponse::ok(value),
                    Err(e) => ServiceResponse::err(&TestError::InvalidRequest {
                        reason: e.to_string(),
                    }),
                }
            }
        }
    }

    /// Answers everything except `test_model`, which is admitted and handed
    /// back so the caller decides where to wait for it.
    pub async fn dispatch(&self, call: ServiceCall) -> Dispatch {
        match call {
            ServiceCall::TestModel {
                model_id,
                model_url,
            } => match self.admit_test(&model_id, model_url.as_deref()).await {
                Ok(admission) => Dispatch::Queued(admission),
                Err(e) => Dispatch::Done(ServiceResponse::err(&e)),
            },
            other => Dispatch::Done(self.handle(other).await),
        }
    }

    pub async fn handle_tagged(&self, tagged: TaggedCall) -> TaggedResponse {
        TaggedResponse {
            id: tagged.id,
            response: self.handle(tagged.call).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkerConfig;
    use crate::error::ErrorKind;
    use async_trait::async_trait;
    use model::{BackendResult, ModelTestBackend};
    use package::LibraryExporter;
    use serde_json::json;
    use std::path::Path;

    struct FailingModelBackend;

    #[async_trait]
    impl ModelTestBackend for FailingModelBackend {
        async fn test(&self, _descriptor_path: &Path) -> BackendResult<TestReport> {
            Ok(TestReport::from_value(json!({"status": "failed", "details": []})).unwrap())
        }

        fn backend_name(&self) -> &'static str {
            "failing-model"
        }
    }

    fn service(library: &Path, scratch: &Path) -> ModelTesterService {
        let config = WorkerConfig::new().with_scratch_root(scratch.join("bioengine"));
        let gate = WorkerGate::from_config(
            &config,
            Arc::new(LibraryExporter::new(library)),
            Arc::new(FailingModelBackend),
        )
        .unwrap();
        ModelTesterService::new(Arc::new(gate))
    }

    fn valid_descriptor() -> Value {
        json!({
            "format_version": "0.5.3",
            "type": "model",
            "name": "demo",
            "inputs": [{"id": "raw"}],
            "outputs": [{"id": "mask"}],
            "weights": {"pytorch_state_dict": {"source": "weights.pt"}}
        })
    }

    #[test]
    fn test_call_parsing() {
        let call: ServiceCall = serde_json::from_str(r#"{"method": "ping"}"#).unwrap();
        assert_eq!(call, ServiceCall::Ping);

        let call: ServiceCall =
            serde_json::from_str(r#"{"method": "test_model", "model_id": "demo"}"#).unwrap();
        assert_eq!(
            call,
            ServiceCall::TestModel {
                model_id: "demo".to_string(),
                model_url: None
            }
        );

        let tagged: TaggedCall = serde_json::from_str(
            r#"{"id": 7, "method": "validate", "descriptor": {"type": "model"}}"#,
        )
        .unwrap();
        assert_eq!(tagged.id, json!(7));
        assert_eq!(tagged.call.method(), "validate");

        assert!(serde_json::from_str::<ServiceCall>(r#"{"method": "reboot"}"#).is_err());
    }

    #[tokio::test]
    async fn test_ping() {
        let library = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        let service = service(library.path(), scratch.path());

        assert_eq!(service.ping(), "pong");
        let response = service.handle(ServiceCall::Ping).await;
        assert_eq!(response, ServiceResponse::ok(json!("pong")));
    }

    #[tokio::test]
    async fn test_failing_model_is_still_a_successful_call() {
        let library = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        let model_dir = library.path().join("demo");
        std::fs::create_dir_all(&model_dir).unwrap();
        std::fs::write(model_dir.join("rdf.yaml"), "type: model\n").unwrap();
        let service = service(library.path(), scratch.path());

        let response = service
            .handle(ServiceCall::TestModel {
                model_id: "demo".to_string(),
                model_url: None,
            })
            .await;
        assert!(response.success);
        assert_eq!(response.result.unwrap()["status"], "failed");
    }

    #[tokio::test]
    async fn test_errors_carry_kind() {
        let library = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        let service = service(library.path(), scratch.path());

        let response = service
            .handle(ServiceCall::TestModel {
                model_id: "demo".to_string(),
                model_url: Some("not a url".to_string()),
            })
            .await;
        assert!(!response.success);
        assert_eq!(response.error.unwrap().kind, ErrorKind::InvalidRequest);

        let tagged = service
            .handle_tagged(TaggedCall {
                id: json!("req-1"),
                call: ServiceCall::TestModel {
                    model_id: "absent".to_string(),
                    model_url: None,
                },
            })
            .await;
        let json = serde_json::to_value(&tagged).unwrap();
        assert_eq!(json["id"], "req-1");
        assert_eq!(json["success"], false);
        assert_eq!(json["error"]["kind"], "resolution_error");
        assert!(json.get("result").is_none());
    }

    #[tokio::test]
    async fn test_validate_accepts_documents_and_text() {
        let library = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        let service = service(library.path(), scratch.path());

        assert!(service.validate(&valid_descriptor()).success);

        let yaml = serde_yaml::to_string(&valid_descriptor()).unwrap();
        assert!(service.validate(&Value::String(yaml)).success);

        let result = service.validate(&Value::String("type: [unclosed".to_string()));
        assert!(!result.success);

        let response = service
            .handle(ServiceCall::Validate {
                descriptor: json!({"type": "model"}),
            })
            .await;
        assert!(response.success);
        assert_eq!(response.result.unwrap()["success"], false);
    }

    #[tokio::test]
    async fn test_dispatch_queues_only_tests() {
        let library = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        let model_dir = library.path().join("demo");
        std::fs::create_dir_all(&model_dir).unwrap();
        std::fs::write(model_dir.join("rdf.yaml"), "type: model\n").unwrap();
        let service = service(library.path(), scratch.path());

        match service.dispatch(ServiceCall::Ping).await {
            Dispatch::Done(response) => assert_eq!(response.result, Some(json!("pong"))),
            Dispatch::Queued(_) => panic!("ping must be answered inline"),
        }

        let call = ServiceCall::TestModel {
            model_id: "demo".to_string(),
            model_url: None,
        };
        let admission = match service.dispatch(call).await {
            Dispatch::Queued(admission) => admission,
            Dispatch::Done(response) => panic!("unexpected answer: {:?}", response),
        };
        assert_eq!(admission.request().model_id(), "demo");
        assert_eq!(service.gate().stats().queued, 1);

        let response = ServiceResponse::from_outcome(&admission.run().await);
        assert!(response.success);
        assert_eq!(response.result.unwrap()["status"], "failed");

        let call = ServiceCall::TestModel {
            model_id: "demo".to_string(),
            model_url: Some("not a url".to_string()),
        };
        match service.dispatch(call).await {
            Dispatch::Done(response) => {
                assert_eq!(response.error.unwrap().kind, ErrorKind::InvalidRequest)
            }
            Dispatch::Queued(_) => panic!("invalid request must not be queued"),
        }
    }

    #[test]
    fn test_parse_descriptor() {
        let yaml = parse_descriptor("type: model\nname: demo\n").unwrap();
        assert_eq!(yaml, json!({"type": "model", "name": "demo"}));

        let json_text = parse_descriptor(r#"{"type": "model"}"#).unwrap();
        assert_eq!(json_text, json!({"type": "model"}));
    }
}
