//! External collaborator interfaces for the processing pipeline.
//!
//! Text extraction, de-identification and code analysis are delegated to
//! external services. Each is modeled as a fallible, potentially slow,
//! idempotent-on-retry call behind a trait, with an HTTP implementation
//! for production and scripted mocks in tests.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::Settings;

/// How a collaborator call failed. Transient failures are retried by the
/// orchestrator; fatal ones fail the job immediately.
///
/// The carried string is for logs only — it is never surfaced to callers,
/// since collaborator responses can echo submitted note content.
#[derive(Debug, thiserror::Error)]
pub enum CollaboratorError {
    #[error("transient collaborator failure: {0}")]
    Transient(String),
    #[error("fatal collaborator failure: {0}")]
    Fatal(String),
}

/// Output of the de-identification service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deidentified {
    pub clean_text: String,
    /// Labels of the entity classes that were detected and removed.
    pub detected_entities: Vec<String>,
}

/// Text-extraction service: raw submitted content to plain text.
#[async_trait]
pub trait TextExtractor: Send + Sync {
    async fn extract(&self, raw: &str) -> Result<String, CollaboratorError>;
}

/// De-identification service.
#[async_trait]
pub trait Deidentifier: Send + Sync {
    async fn deidentify(&self, text: &str) -> Result<Deidentified, CollaboratorError>;
}

/// Code-inference/analysis service. One collaborator, two calls: candidate
/// code inference over the clean text, then the full analysis against the
/// previously billed codes.
#[async_trait]
pub trait CodeAnalyzer: Send + Sync {
    async fn infer_codes(&self, clean_text: &str) -> Result<Vec<String>, CollaboratorError>;

    async fn analyze(
        &self,
        clean_text: &str,
        billed_codes: &[String],
        inferred_codes: &[String],
    ) -> Result<serde_json::Value, CollaboratorError>;
}

/// The full set of collaborators a pipeline run needs.
pub struct Collaborators {
    pub extractor: std::sync::Arc<dyn TextExtractor>,
    pub deidentifier: std::sync::Arc<dyn Deidentifier>,
    pub analyzer: std::sync::Arc<dyn CodeAnalyzer>,
}

impl Collaborators {
    /// HTTP clients against the configured service base URLs.
    pub fn from_settings(settings: &Settings) -> Self {
        let client = reqwest::Client::new();
        Self {
            extractor: std::sync::Arc::new(HttpCollaborator::new(
                client.clone(),
                settings.extractor_url.clone(),
            )),
            deidentifier: std::sync::Arc::new(HttpCollaborator::new(
                client.clone(),
                settings.deidentifier_url.clone(),
            )),
            analyzer: std::sync::Arc::new(HttpCollaborator::new(
                client,
                settings.analyzer_url.clone(),
            )),
        }
    }
}

// ═══════════════════════════════════════════════════════════
// HTTP implementation
// ═══════════════════════════════════════════════════════════

/// Generic HTTP client for a collaborator service. Each service exposes
/// JSON POST endpoints under its base URL.
pub struct HttpCollaborator {
    client: reqwest::Client,
    base_url: String,
}

impl HttpCollaborator {
    pub fn new(client: reqwest::Client, base_url: String) -> Self {
        Self { client, base_url }
    }

    async fn post_json<Req: Serialize, Resp: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        body: &Req,
    ) -> Result<Resp, CollaboratorError> {
        let url = format!("{}{path}", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| CollaboratorError::Transient(format!("request to {url}: {e}")))?;

        let status = response.status();
        if status.is_server_error() {
            return Err(CollaboratorError::Transient(format!(
                "{url} returned {status}"
            )));
        }
        if !status.is_success() {
            // 4xx: the service rejected this input; retrying won't help
            return Err(CollaboratorError::Fatal(format!("{url} returned {status}")));
        }

        response
            .json::<Resp>()
            .await
            .map_err(|e| CollaboratorError::Fatal(format!("decoding {url} response: {e}")))
    }
}

#[derive(Serialize)]
struct ExtractRequest<'a> {
    raw: &'a str,
}

#[derive(Deserialize)]
struct ExtractResponse {
    text: String,
}

#[derive(Serialize)]
struct DeidentifyRequest<'a> {
    text: &'a str,
}

#[derive(Serialize)]
struct InferRequest<'a> {
    clean_text: &'a str,
}

#[derive(Deserialize)]
struct InferResponse {
    codes: Vec<String>,
}

#[derive(Serialize)]
struct AnalyzeRequest<'a> {
    clean_text: &'a str,
    billed_codes: &'a [String],
    inferred_codes: &'a [String],
}

#[async_trait]
impl TextExtractor for HttpCollaborator {
    async fn extract(&self, raw: &str) -> Result<String, CollaboratorError> {
        let resp: ExtractResponse = self.post_json("/extract", &ExtractRequest { raw }).await?;
        Ok(resp.text)
    }
}

#[async_trait]
impl Deidentifier for HttpCollaborator {
    async fn deidentify(&self, text: &str) -> Result<Deidentified, CollaboratorError> {
        self.post_json("/deidentify", &DeidentifyRequest { text })
            .await
    }
}

#[async_trait]
impl CodeAnalyzer for HttpCollaborator {
    async fn infer_codes(&self, clean_text: &str) -> Result<Vec<String>, CollaboratorError> {
        let resp: InferResponse = self
            .post_json("/infer-codes", &InferRequest { clean_text })
            .await?;
        Ok(resp.codes)
    }

    async fn analyze(
        &self,
        clean_text: &str,
        billed_codes: &[String],
        inferred_codes: &[String],
    ) -> Result<serde_json::Value, CollaboratorError> {
        self.post_json(
            "/analyze",
            &AnalyzeRequest {
                clean_text,
                billed_codes,
                inferred_codes,
            },
        )
        .await
    }
}

// ═══════════════════════════════════════════════════════════
// Test doubles
// ═══════════════════════════════════════════════════════════

#[cfg(test)]
pub mod mock {
    //! Scripted collaborators for orchestrator tests. Each call pops the
    //! next scripted outcome; an empty script means unconditional success.

    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    use super::*;

    /// Outcome script shared by all three trait impls.
    pub struct MockCollaborator {
        outcomes: Mutex<Vec<MockOutcome>>,
        pub calls: AtomicU32,
    }

    #[derive(Clone)]
    pub enum MockOutcome {
        Ok,
        Transient,
        Fatal,
        /// Sleep longer than the caller's timeout.
        Hang,
    }

    impl MockCollaborator {
        pub fn ok() -> std::sync::Arc<Self> {
            Self::scripted(vec![])
        }

        pub fn scripted(outcomes: Vec<MockOutcome>) -> std::sync::Arc<Self> {
            std::sync::Arc::new(Self {
                outcomes: Mutex::new(outcomes),
                calls: AtomicU32::new(0),
            })
        }

        pub fn call_count(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }

        async fn next(&self) -> Result<(), CollaboratorError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let outcome = {
                let mut outcomes = self.outcomes.lock().unwrap();
                if outcomes.is_empty() {
                    MockOutcome::Ok
                } else {
                    outcomes.remove(0)
                }
            };
            match outcome {
                MockOutcome::Ok => Ok(()),
                MockOutcome::Transient => {
                    Err(CollaboratorError::Transient("scripted transient".into()))
                }
                MockOutcome::Fatal => Err(CollaboratorError::Fatal("scripted fatal".into())),
                MockOutcome::Hang => {
                    tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
                    Ok(())
                }
            }
        }
    }

    #[async_trait]
    impl TextExtractor for MockCollaborator {
        async fn extract(&self, raw: &str) -> Result<String, CollaboratorError> {
            self.next().await?;
            Ok(format!("extracted: {raw}"))
        }
    }

    #[async_trait]
    impl Deidentifier for MockCollaborator {
        async fn deidentify(&self, text: &str) -> Result<Deidentified, CollaboratorError> {
            self.next().await?;
            Ok(Deidentified {
                clean_text: format!("clean: {text}"),
                detected_entities: vec!["name".into(), "date".into()],
            })
        }
    }

    #[async_trait]
    impl CodeAnalyzer for MockCollaborator {
        async fn infer_codes(&self, _clean_text: &str) -> Result<Vec<String>, CollaboratorError> {
            self.next().await?;
            Ok(vec!["99213".into(), "J06.9".into()])
        }

        async fn analyze(
            &self,
            _clean_text: &str,
            billed_codes: &[String],
            inferred_codes: &[String],
        ) -> Result<serde_json::Value, CollaboratorError> {
            self.next().await?;
            Ok(serde_json::json!({
                "billed": billed_codes,
                "inferred": inferred_codes,
                "suggestions": [],
            }))
        }
    }

    /// Collaborators where every service succeeds immediately.
    pub fn all_ok() -> Collaborators {
        Collaborators {
            extractor: MockCollaborator::ok(),
            deidentifier: MockCollaborator::ok(),
            analyzer: MockCollaborator::ok(),
        }
    }
}
