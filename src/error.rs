use thiserror::Error;

/// Terminal error of a pipeline run, tagged with the stage that failed.
///
/// No stage retries internally: by the time any of these surface, the run's
/// preconditions (nonce, gas quote, fee quote) are stale, so the only sound
/// retry is a fresh run from operation building.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Bad token metadata (no decimals accessor, reverting reads). Caller
    /// input error, not retryable.
    #[error("invalid token: {0}")]
    InvalidToken(String),

    /// Bundler gas estimation (or the chain reads feeding it) failed.
    #[error("gas estimation failed: {0:#}")]
    Estimation(anyhow::Error),

    /// Fee-quote negotiation with the paymaster failed, or token-fee mode
    /// ended with no usable quote.
    #[error("fee negotiation failed: {0:#}")]
    Negotiation(anyhow::Error),

    /// The paymaster declined or failed to countersign the operation.
    #[error("sponsorship failed: {0:#}")]
    Sponsorship(anyhow::Error),

    /// Relay-level rejection, or a failure while waiting on an accepted
    /// operation's receipt (the message says which).
    #[error("submission failed: {0:#}")]
    Submission(anyhow::Error),

    /// Malformed caller input (out-of-range quote index, bad amounts, a
    /// batch that cannot be expressed).
    #[error("{0}")]
    Client(String),
}
