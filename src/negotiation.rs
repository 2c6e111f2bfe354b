use crate::error::PipelineError;
use crate::paymaster::{PaymasterApi, QuoteResponse};
use crate::types::{FeeQuote, SponsorshipData, UserOperation};
use async_trait::async_trait;
use ethers::types::Address;
use std::sync::Arc;

/// Negotiates fee payment with the paymaster.
///
/// Quote results are never retried internally: a simulate-result goes stale
/// between attempts, so re-negotiation is the caller's call.
pub struct FeeNegotiator {
    paymaster: Arc<dyn PaymasterApi>,
}

impl FeeNegotiator {
    pub fn new(paymaster: Arc<dyn PaymasterApi>) -> Self {
        Self { paymaster }
    }

    /// Sponsored mode: one unconditional sponsorship request, no fee choice.
    /// The paymaster recalculates gas limits as part of countersigning.
    pub async fn sponsor_unconditional(
        &self,
        op: &UserOperation,
    ) -> Result<SponsorshipData, PipelineError> {
        self.paymaster
            .sponsor(op, None, true)
            .await
            .map_err(PipelineError::Sponsorship)
    }

    /// Token-fee mode: simulate and quote. An empty quote set is a valid
    /// outcome here; refusing to proceed on it is the caller's decision.
    pub async fn fee_quotes(
        &self,
        op: &UserOperation,
        token_list: &[Address],
        preferred_token: Option<Address>,
    ) -> Result<QuoteResponse, PipelineError> {
        let res = self
            .paymaster
            .fee_quotes(op, token_list, preferred_token)
            .await
            .map_err(PipelineError::Negotiation)?;
        tracing::info!(quotes = res.quotes.len(), "paymaster fee quotes received");
        Ok(res)
    }

    /// Resolve a chooser's pick against the quote set. An out-of-range index
    /// is the caller's fault, never the negotiator's.
    pub async fn select<'q>(
        &self,
        quotes: &'q [FeeQuote],
        chooser: &dyn QuoteChooser,
    ) -> Result<&'q FeeQuote, PipelineError> {
        let index = chooser.choose(quotes).await?;
        quotes.get(index).ok_or_else(|| {
            PipelineError::Client(format!(
                "fee quote index {index} out of range (have {} quotes)",
                quotes.len()
            ))
        })
    }
}

/// The fee-choice seam: given the quote set, pick one by index. The CLI has
/// an interactive implementation; automated runs use the policy ones below.
#[async_trait]
pub trait QuoteChooser: Send + Sync {
    async fn choose(&self, quotes: &[FeeQuote]) -> Result<usize, PipelineError>;
}

/// Deterministic policy: lowest max gas fee wins. Note the fees are in each
/// token's own smallest unit, so this is only a sensible default when the
/// quote set is narrowed to comparable tokens.
pub struct CheapestQuote;

#[async_trait]
impl QuoteChooser for CheapestQuote {
    async fn choose(&self, quotes: &[FeeQuote]) -> Result<usize, PipelineError> {
        quotes
            .iter()
            .enumerate()
            .min_by_key(|(_, q)| q.max_gas_fee)
            .map(|(i, _)| i)
            .ok_or_else(|| PipelineError::Client("no fee quotes to choose from".to_string()))
    }
}

/// Scripted selection of a fixed index. Bounds are checked at selection
/// time, so this just forwards the index.
pub struct FixedChoice(pub usize);

#[async_trait]
impl QuoteChooser for FixedChoice {
    async fn choose(&self, _quotes: &[FeeQuote]) -> Result<usize, PipelineError> {
        Ok(self.0)
    }
}
