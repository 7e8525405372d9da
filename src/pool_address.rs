//! Deterministic (CREATE2) pool addresses, used to prove a discovered pool was deployed by the
//! expected factory.

use ethers::abi::{encode, Token};
use ethers::types::{Address, H256, U256};
use ethers::utils::{get_create2_address_from_hash, keccak256};

fn sort(a: Address, b: Address) -> (Address, Address) {
    if a < b {
        (a, b)
    } else {
        (b, a)
    }
}

/// V2 pair: salt = keccak256(abi.encodePacked(token0, token1)).
pub fn v2_pair_address(factory: Address, init_code_hash: H256, a: Address, b: Address) -> Address {
    let (token0, token1) = sort(a, b);
    let mut packed = Vec::with_capacity(40);
    packed.extend_from_slice(token0.as_bytes());
    packed.extend_from_slice(token1.as_bytes());
    let salt = keccak256(packed);
    get_create2_address_from_hash(factory, salt, init_code_hash)
}

/// V3 pool: salt = keccak256(abi.encode(token0, token1, fee)).
pub fn v3_pool_address(
    factory: Address,
    init_code_hash: H256,
    a: Address,
    b: Address,
    fee: u32,
) -> Address {
    let (token0, token1) = sort(a, b);
    let encoded = encode(&[
        Token::Address(token0),
        Token::Address(token1),
        Token::Uint(U256::from(fee)),
    ]);
    let salt = keccak256(encoded);
    get_create2_address_from_hash(factory, salt, init_code_hash)
}
