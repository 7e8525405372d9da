// Pool Discovery Validator
//
// Decides whether an address seen in a pool event is a genuine pool pairing some token with the
// reference asset. The checks short-circuit in this order:
//
// 1. Pool tokens (and the fee tier for quoter-based pools) are readable
// 2. Exactly one side is the reference asset
// 3. The other token's decimals are readable
// 4. The address equals the factory's CREATE2 address for that pair
// 5. The other token has a non-empty symbol and name
//
// Any failure is final: the address is ignored for the rest of the process lifetime.

use ethers::types::{Address, H256};
use log::{debug, info};
use std::sync::Arc;

use crate::chain_client::ChainClient;
use crate::metrics;
use crate::pool_address::{v2_pair_address, v3_pool_address};
use crate::settings::PipelineKind;
use crate::types::{PoolRecord, TokenInfo};

/// Why a candidate was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    /// `token0()`/`token1()` could not be read
    TokensUnreadable,
    /// `fee()` could not be read
    FeeUnreadable,
    /// Neither or both sides are the reference asset
    NotReferencePair,
    /// `decimals()` of the non-reference token could not be read
    DecimalsUnreadable,
    /// The address is not the one the factory would deploy for this pair
    AddressMismatch,
    /// `symbol()` or `name()` failed or came back empty
    MetadataUnreadable,
}

impl IgnoreReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            IgnoreReason::TokensUnreadable => "tokens_unreadable",
            IgnoreReason::FeeUnreadable => "fee_unreadable",
            IgnoreReason::NotReferencePair => "not_reference_pair",
            IgnoreReason::DecimalsUnreadable => "decimals_unreadable",
            IgnoreReason::AddressMismatch => "address_mismatch",
            IgnoreReason::MetadataUnreadable => "metadata_unreadable",
        }
    }
}

/// Result of validating a discovery candidate. Exactly one of the two, always.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryOutcome {
    Admitted(PoolRecord),
    Ignored(IgnoreReason),
}

#[derive(Debug, Clone)]
pub struct FactoryConfig {
    pub factory: Address,
    pub init_code_hash: H256,
}

pub struct PoolDiscoveryValidator {
    client: Arc<dyn ChainClient>,
    kind: PipelineKind,
    chain_id: u64,
    reference: TokenInfo,
    factory: FactoryConfig,
}

impl PoolDiscoveryValidator {
    pub fn new(
        client: Arc<dyn ChainClient>,
        kind: PipelineKind,
        chain_id: u64,
        reference: TokenInfo,
        factory: FactoryConfig,
    ) -> Self {
        Self {
            client,
            kind,
            chain_id,
            reference,
            factory,
        }
    }

    /// Address the factory would have deployed for `token`/reference (and `fee` on V3).
    pub fn expected_address(&self, token: Address, fee: Option<u32>) -> Address {
        match (self.kind, fee) {
            (PipelineKind::V3, Some(fee)) => v3_pool_address(
                self.factory.factory,
                self.factory.init_code_hash,
                token,
                self.reference.address,
                fee,
            ),
            _ => v2_pair_address(
                self.factory.factory,
                self.factory.init_code_hash,
                token,
                self.reference.address,
            ),
        }
    }

    pub async fn validate(&self, candidate: Address) -> DiscoveryOutcome {
        let outcome = self.run_checks(candidate).await;
        match &outcome {
            DiscoveryOutcome::Admitted(record) => {
                info!(
                    "Pool {:?} admitted ({})",
                    candidate,
                    record.quote()
                );
                metrics::increment_pool_discoveries("admitted", "none");
            }
            DiscoveryOutcome::Ignored(reason) => {
                info!("Pool {:?} ignored: {}", candidate, reason.as_str());
                metrics::increment_pool_discoveries("ignored", reason.as_str());
            }
        }
        outcome
    }

    async fn run_checks(&self, candidate: Address) -> DiscoveryOutcome {
        use DiscoveryOutcome::Ignored;

        let (token0, token1) = match self.client.pool_tokens(candidate).await {
            Ok(tokens) => tokens,
            Err(e) => {
                debug!("token lookup failed for {:?}: {}", candidate, e);
                return Ignored(IgnoreReason::TokensUnreadable);
            }
        };

        let fee = match self.kind {
            PipelineKind::V2 => None,
            PipelineKind::V3 => match self.client.pool_fee(candidate).await {
                Ok(fee) => Some(fee),
                Err(e) => {
                    debug!("fee lookup failed for {:?}: {}", candidate, e);
                    return Ignored(IgnoreReason::FeeUnreadable);
                }
            },
        };

        let reference = self.reference.address;
        let token = match (token0 == reference, token1 == reference) {
            (true, false) => token1,
            (false, true) => token0,
            _ => return Ignored(IgnoreReason::NotReferencePair),
        };

        let decimals = match self.client.token_decimals(token).await {
            Ok(d) => d,
            Err(e) => {
                debug!("decimals lookup failed for {:?}: {}", token, e);
                return Ignored(IgnoreReason::DecimalsUnreadable);
            }
        };

        if self.expected_address(token, fee) != candidate {
            return Ignored(IgnoreReason::AddressMismatch);
        }

        let (symbol, name) = match futures::join!(
            self.client.token_symbol(token),
            self.client.token_name(token)
        ) {
            (Ok(symbol), Ok(name)) if !symbol.is_empty() && !name.is_empty() => (symbol, name),
            _ => return Ignored(IgnoreReason::MetadataUnreadable),
        };

        DiscoveryOutcome::Admitted(PoolRecord::new(
            self.chain_id,
            candidate,
            TokenInfo {
                address: token,
                symbol,
                name,
                decimals,
            },
            self.reference.clone(),
            fee,
        ))
    }
}
