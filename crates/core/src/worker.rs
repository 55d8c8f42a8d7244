use crate::chunking::count_units;
use crate::config::{ExtractionCaps, RetryConfig};
use crate::error::{ExtractionFailure, FailureCategory, FailureKind, ProviderError};
use crate::models::{ExtractionResult, UsageRecord};
use crate::prompt::{build_extraction_prompt, BookCategory, SYSTEM_PROMPT};
use crate::schema::validate_extraction;
use crate::traits::{Completion, CompletionRequest, ReasoningClient, UsageLedger};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Per-chunk outcome: the capped result or a categorized failure.
pub type ChunkOutcome = Result<ExtractionResult, ExtractionFailure>;

/// Calls the reasoning service for one chunk at a time, validating and
/// retrying until the attempt budget runs out.
pub struct ExtractionWorker {
    document_id: String,
    client: Arc<dyn ReasoningClient>,
    ledger: Arc<dyn UsageLedger>,
    retry: RetryConfig,
    caps: ExtractionCaps,
    category: BookCategory,
}

impl ExtractionWorker {
    pub fn new(
        document_id: impl Into<String>,
        client: Arc<dyn ReasoningClient>,
        ledger: Arc<dyn UsageLedger>,
        retry: RetryConfig,
        caps: ExtractionCaps,
        category: BookCategory,
    ) -> Self {
        Self {
            document_id: document_id.into(),
            client,
            ledger,
            retry,
            caps,
            category,
        }
    }

    pub async fn extract(&self, chunk_id: &str, text: &str) -> ChunkOutcome {
        let request = CompletionRequest {
            system: SYSTEM_PROMPT.to_string(),
            prompt: build_extraction_prompt(text, self.category, &self.caps),
            source_text: text.to_string(),
        };
        let max_attempts = self.retry.max_attempts.max(1);
        let mut last_failure = None;

        for attempt in 1..=max_attempts {
            match self.client.complete(&request).await {
                Ok(completion) => {
                    self.record_usage(chunk_id, &request, &completion).await;
                    match validate_extraction(&completion.content) {
                        Ok(mut result) => {
                            result.truncate(&self.caps);
                            debug!(chunk_id, attempt, entities = result.entities.len(), "chunk extracted");
                            return Ok(result);
                        }
                        Err(error) => {
                            warn!(chunk_id, attempt, error = %error, "provider output failed validation");
                            last_failure = Some(ExtractionFailure {
                                kind: FailureKind::Validation,
                                category: FailureCategory::ServiceError,
                                detail: error.to_string(),
                                attempts: attempt,
                            });
                        }
                    }
                }
                Err(error) => {
                    let delay = self.delay_for(&error, attempt);
                    warn!(
                        chunk_id,
                        attempt,
                        status = ?error.status(),
                        retryable = error.is_retryable(),
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "provider call failed"
                    );
                    last_failure = Some(ExtractionFailure {
                        kind: FailureKind::Provider,
                        category: error.category(),
                        detail: error.to_string(),
                        attempts: attempt,
                    });
                    if attempt < max_attempts && !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        let failure = last_failure.unwrap_or_else(|| ExtractionFailure {
            kind: FailureKind::Provider,
            category: FailureCategory::ServiceError,
            detail: "no attempt was made".to_string(),
            attempts: 0,
        });
        warn!(chunk_id, category = %failure.category, attempts = failure.attempts, "chunk extraction failed");
        Err(failure)
    }

    /// Rate limits honour a server supplied delay when there is one. Other
    /// retryable failures back off exponentially up to `max_delay`.
    fn delay_for(&self, error: &ProviderError, attempt: u32) -> Duration {
        if !error.is_retryable() {
            return Duration::ZERO;
        }
        if error.is_rate_limited() {
            if let Some(retry_after) = error.retry_after() {
                return retry_after.min(self.retry.max_retry_after);
            }
        }
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.retry
            .base_delay
            .checked_mul(factor)
            .unwrap_or(self.retry.max_delay)
            .min(self.retry.max_delay)
    }

    async fn record_usage(&self, chunk_id: &str, request: &CompletionRequest, completion: &Completion) {
        let (tokens_in, tokens_out) = match completion.usage {
            Some(usage) => (usage.input, usage.output),
            None => (
                count_units(&request.system) as u64 + count_units(&request.prompt) as u64,
                count_units(&completion.content) as u64,
            ),
        };
        let record = UsageRecord {
            document_id: self.document_id.clone(),
            chunk_id: chunk_id.to_string(),
            provider: self.client.provider().to_string(),
            model: self.client.model().to_string(),
            tokens_in,
            tokens_out,
        };
        if let Err(error) = self.ledger.record(record).await {
            warn!(chunk_id, error = %error, "failed to record usage");
        }
    }
}
