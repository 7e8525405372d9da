//! Pool discovery validation against a scripted chain.

mod common;

use common::*;
use dex_price_feed::settings::PipelineKind;
use dex_price_feed::validator::{DiscoveryOutcome, IgnoreReason, PoolDiscoveryValidator};
use ethers::types::Address;
use std::sync::Arc;

fn validator(kind: PipelineKind, chain: Arc<MockChain>) -> PoolDiscoveryValidator {
    PoolDiscoveryValidator::new(chain, kind, 1, weth(), factory())
}

#[tokio::test]
async fn test_admits_factory_pool_pairing_reference() {
    let chain = Arc::new(MockChain::new());
    let tkn = token(0xf0, "HIGH");
    let pool = v2_pool(&tkn);
    chain.add_token(&tkn);
    chain.add_pool(pool, weth().address, tkn.address);

    let outcome = validator(PipelineKind::V2, chain).validate(pool).await;
    let DiscoveryOutcome::Admitted(record) = outcome else {
        panic!("expected admission, got {:?}", outcome);
    };
    assert_eq!(record.address, pool);
    assert_eq!(record.chain_id, 1);
    assert_eq!(record.fee, None);
    // WETH (0xee..) sorts below HIGH (0xf0..)
    assert_eq!(record.quote(), "WETHHIGH");
    assert_eq!(record.token(weth().address).decimals, 18);
}

#[tokio::test]
async fn test_pool_without_reference_is_ignored() {
    let chain = Arc::new(MockChain::new());
    let a = token(0x10, "AAA");
    let b = token(0x20, "BBB");
    chain.add_token(&a);
    chain.add_token(&b);
    let f = factory();
    // a genuine factory pool, just not one pairing WETH
    let pool = dex_price_feed::pool_address::v2_pair_address(
        f.factory,
        f.init_code_hash,
        a.address,
        b.address,
    );
    chain.add_pool(pool, a.address, b.address);

    assert_eq!(
        validator(PipelineKind::V2, chain).validate(pool).await,
        DiscoveryOutcome::Ignored(IgnoreReason::NotReferencePair)
    );
}

#[tokio::test]
async fn test_reference_on_both_sides_is_ignored() {
    let chain = Arc::new(MockChain::new());
    let pool = Address::repeat_byte(0x31);
    chain.add_pool(pool, weth().address, weth().address);

    assert_eq!(
        validator(PipelineKind::V2, chain).validate(pool).await,
        DiscoveryOutcome::Ignored(IgnoreReason::NotReferencePair)
    );
}

#[tokio::test]
async fn test_address_mismatch_is_ignored() {
    let chain = Arc::new(MockChain::new());
    let tkn = token(0x10, "TKN");
    chain.add_token(&tkn);
    // right tokens, wrong deployer
    let impostor = Address::repeat_byte(0x99);
    chain.add_pool(impostor, tkn.address, weth().address);

    assert_eq!(
        validator(PipelineKind::V2, chain).validate(impostor).await,
        DiscoveryOutcome::Ignored(IgnoreReason::AddressMismatch)
    );
}

#[tokio::test]
async fn test_unreadable_contract_reads_are_ignored() {
    let chain = Arc::new(MockChain::new());

    let not_a_pool = Address::repeat_byte(0x01);
    assert_eq!(
        validator(PipelineKind::V2, chain.clone()).validate(not_a_pool).await,
        DiscoveryOutcome::Ignored(IgnoreReason::TokensUnreadable)
    );

    // token contract unknown to the chain: decimals() reverts
    let ghost = token(0x12, "GHOST");
    let pool = v2_pool(&ghost);
    chain.add_pool(pool, ghost.address, weth().address);
    assert_eq!(
        validator(PipelineKind::V2, chain.clone()).validate(pool).await,
        DiscoveryOutcome::Ignored(IgnoreReason::DecimalsUnreadable)
    );

    let mut blank = token(0x13, "");
    blank.name = "Blank".into();
    let pool = v2_pool(&blank);
    chain.add_token(&blank);
    chain.add_pool(pool, blank.address, weth().address);
    assert_eq!(
        validator(PipelineKind::V2, chain).validate(pool).await,
        DiscoveryOutcome::Ignored(IgnoreReason::MetadataUnreadable)
    );
}

#[tokio::test]
async fn test_quoter_pools_need_fee_and_matching_salt() {
    let chain = Arc::new(MockChain::new());
    let tkn = token(0x10, "TKN");
    chain.add_token(&tkn);

    let pool = v3_pool(&tkn, 500);
    chain.add_v3_pool(pool, tkn.address, weth().address, 500);
    let outcome = validator(PipelineKind::V3, chain.clone()).validate(pool).await;
    assert!(
        matches!(&outcome, DiscoveryOutcome::Admitted(r) if r.fee == Some(500)),
        "{:?}",
        outcome
    );

    // fee tier reported by the pool differs from the one its address encodes
    let wrong_tier = v3_pool(&tkn, 3000);
    chain.add_v3_pool(wrong_tier, tkn.address, weth().address, 10_000);
    assert_eq!(
        validator(PipelineKind::V3, chain.clone()).validate(wrong_tier).await,
        DiscoveryOutcome::Ignored(IgnoreReason::AddressMismatch)
    );

    let no_fee = v2_pool(&tkn);
    chain.add_pool(no_fee, tkn.address, weth().address);
    assert_eq!(
        validator(PipelineKind::V3, chain).validate(no_fee).await,
        DiscoveryOutcome::Ignored(IgnoreReason::FeeUnreadable)
    );
}
