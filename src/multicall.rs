use crate::metrics;
pub use anyhow::Result;
use ethers::abi::{Function, Param, ParamType, StateMutability, Token};
use ethers::prelude::*;
use ethers::types::transaction::eip2718::TypedTransaction;
use log::debug;
use std::sync::Arc;
use std::time::Duration;

/// A single contract read to be batched through Multicall3.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Call {
    pub target: Address,
    pub call_data: Bytes,
}

/// Batches contract reads into Multicall3 `aggregate3` requests.
///
/// Every call is sent with `allowFailure = true`, so a reverting pool only loses its own slot:
/// the result for that call is `None` and the rest of the batch still decodes.
#[derive(Clone)]
pub struct Multicall<M: Middleware> {
    provider: Arc<M>,
    multicall_address: Address,
    batch_size: usize,
    timeout: Duration,
}

impl<M: Middleware + 'static> Multicall<M> {
    pub fn new(provider: Arc<M>, multicall_address: Address, batch_size: usize) -> Self {
        Self {
            provider,
            multicall_address,
            batch_size: batch_size.max(1),
            timeout: Duration::from_secs(8),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Runs `calls` in chunks of `batch_size` and returns one slot per input call, in input order.
    pub async fn run(&self, calls: Vec<Call>, block: Option<BlockId>) -> Result<Vec<Option<Bytes>>> {
        if calls.is_empty() {
            return Ok(Vec::new());
        }

        // Coalesce identical calls
        let mut unique_calls = indexmap::IndexMap::new();
        let mut original_indices = vec![0; calls.len()];
        for (i, call) in calls.iter().enumerate() {
            let (index, _) = unique_calls.insert_full((call.target, call.call_data.clone()), ());
            original_indices[i] = index;
        }

        let unique_call_vec: Vec<_> = unique_calls
            .into_keys()
            .map(|(target, call_data)| Call { target, call_data })
            .collect();
        debug!(
            "Multicall coalesced {} calls into {}",
            calls.len(),
            unique_call_vec.len()
        );

        let mut all_results_unique: Vec<Option<Bytes>> = Vec::with_capacity(unique_call_vec.len());
        for call_chunk in unique_call_vec.chunks(self.batch_size) {
            metrics::record_multicall_batch_size(call_chunk.len() as f64);
            let return_data = self.execute_multicall3(call_chunk, block).await?;
            if return_data.len() != call_chunk.len() {
                anyhow::bail!(
                    "multicall returned {} results for {} calls",
                    return_data.len(),
                    call_chunk.len()
                );
            }
            all_results_unique.extend(return_data);
        }

        Ok(original_indices
            .into_iter()
            .map(|index| all_results_unique[index].clone())
            .collect())
    }

    async fn execute_multicall3(
        &self,
        calls: &[Call],
        block: Option<BlockId>,
    ) -> Result<Vec<Option<Bytes>>> {
        // Call3 struct: (address target, bool allowFailure, bytes callData)
        let call_tokens = calls
            .iter()
            .map(|call| {
                Token::Tuple(vec![
                    Token::Address(call.target),
                    Token::Bool(true),
                    Token::Bytes(call.call_data.to_vec()),
                ])
            })
            .collect();

        let result_type = ParamType::Array(Box::new(ParamType::Tuple(vec![
            ParamType::Bool,
            ParamType::Bytes,
        ])));

        #[allow(deprecated)]
        let function = Function {
            name: "aggregate3".to_string(),
            inputs: vec![Param {
                name: "calls".to_string(),
                kind: ParamType::Array(Box::new(ParamType::Tuple(vec![
                    ParamType::Address,
                    ParamType::Bool,
                    ParamType::Bytes,
                ]))),
                internal_type: None,
            }],
            outputs: vec![Param {
                name: "returnData".to_string(),
                kind: result_type.clone(),
                internal_type: None,
            }],
            constant: None,
            state_mutability: StateMutability::Payable,
        };

        let calldata = function.encode_input(&[Token::Array(call_tokens)])?;

        let tx: TypedTransaction = TransactionRequest::new()
            .to(self.multicall_address)
            .data(calldata)
            .into();

        let response = tokio::time::timeout(self.timeout, self.provider.call(&tx, block))
            .await
            .map_err(|_| anyhow::anyhow!("multicall timed out after {:?}", self.timeout))?
            .map_err(|e| anyhow::anyhow!("multicall failed: {}", e))?;

        let decoded = ethers::abi::decode(&[result_type], &response)?;
        let results_array = decoded
            .into_iter()
            .next()
            .and_then(|t| t.into_array())
            .ok_or_else(|| anyhow::anyhow!("Invalid multicall response format"))?;

        // Result struct: (bool success, bytes returnData)
        Ok(results_array
            .into_iter()
            .map(|result_token| match result_token {
                Token::Tuple(tuple) => match (tuple.first(), tuple.get(1)) {
                    (Some(Token::Bool(true)), Some(Token::Bytes(data))) => {
                        Some(Bytes::from(data.clone()))
                    }
                    _ => None,
                },
                _ => None,
            })
            .collect())
    }
}
