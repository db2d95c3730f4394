//! Transaction broker for the reward escrow.
//!
//! - Build escrow calldata
//! - Wrap it in a Safe transaction and compute its EIP-712 hash
//! - Sign, propose and confirm through the Safe transaction service
//! - Execute with the collected signatures from the executor account

use alloy::primitives::{Address, Bytes, B256, U256};
use alloy::signers::local::PrivateKeySigner;
use alloy::signers::SignerSync;
use alloy::sol;
use alloy::sol_types::{Eip712Domain, Panic, Revert, SolCall, SolError, SolStruct};
use serde::{Deserialize, Serialize};

use kwil_relay_types::{RelayError, Result};

pub mod broker;
pub mod chain;
pub mod memory;
pub mod safe_client;

pub use broker::{Broker, BrokerConfig};
pub use chain::{AlloyChain, CallOutcome, ChainReceipt, ChainTransaction, DestinationChain};
pub use memory::{MemoryAuthService, MemoryChain};
pub use safe_client::{AuthorizationService, SafeMultisigTransaction, SafeServiceClient};

sol! {
    interface IRewardEscrow {
        function postReward(bytes32 rewardRoot, uint256 rewardAmount) external payable;
        function updatePosterFee(uint256 newFee) external;
        function rewardPoster(bytes32 rewardRoot) external view returns (address);
    }

    interface ISafe {
        function nonce() external view returns (uint256);
        function execTransaction(
            address to,
            uint256 value,
            bytes data,
            uint8 operation,
            uint256 safeTxGas,
            uint256 baseGas,
            uint256 gasPrice,
            address gasToken,
            address refundReceiver,
            bytes signatures
        ) external payable returns (bool success);
    }

    struct SafeTx {
        address to;
        uint256 value;
        bytes data;
        uint8 operation;
        uint256 safeTxGas;
        uint256 baseGas;
        uint256 gasPrice;
        address gasToken;
        address refundReceiver;
        uint256 nonce;
    }
}

/// Escrow functions the relay calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EscrowCall {
    PostReward { root: B256, amount: U256 },
    UpdatePosterFee { fee: U256 },
    RewardPoster { root: B256 },
}

/// ABI-encode an escrow call.
pub fn build_call_data(call: &EscrowCall) -> Bytes {
    let encoded = match call {
        EscrowCall::PostReward { root, amount } => IRewardEscrow::postRewardCall {
            rewardRoot: *root,
            rewardAmount: *amount,
        }
        .abi_encode(),
        EscrowCall::UpdatePosterFee { fee } => {
            IRewardEscrow::updatePosterFeeCall { newFee: *fee }.abi_encode()
        }
        EscrowCall::RewardPoster { root } => {
            IRewardEscrow::rewardPosterCall { rewardRoot: *root }.abi_encode()
        }
    };
    Bytes::from(encoded)
}

/// Fields of a Safe transaction, in the transaction service's wire shape.
///
/// Refunds are never used: gas fields stay zero and the executor pays.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SafeTransactionData {
    #[serde(with = "safe_client::checksum")]
    pub to: Address,
    #[serde(with = "safe_client::decimal")]
    pub value: U256,
    #[serde(default, deserialize_with = "safe_client::nullable")]
    pub data: Bytes,
    pub operation: u8,
    #[serde(with = "safe_client::decimal")]
    pub safe_tx_gas: U256,
    #[serde(with = "safe_client::decimal")]
    pub base_gas: U256,
    #[serde(with = "safe_client::decimal")]
    pub gas_price: U256,
    #[serde(default, with = "safe_client::checksum_nullable")]
    pub gas_token: Address,
    #[serde(default, with = "safe_client::checksum_nullable")]
    pub refund_receiver: Address,
    #[serde(with = "safe_client::decimal")]
    pub nonce: U256,
}

impl SafeTransactionData {
    /// A plain CALL from the wallet to `to` with no value and no refund.
    pub fn call(to: Address, data: Bytes, nonce: U256) -> Self {
        Self {
            to,
            value: U256::ZERO,
            data,
            operation: 0,
            safe_tx_gas: U256::ZERO,
            base_gas: U256::ZERO,
            gas_price: U256::ZERO,
            gas_token: Address::ZERO,
            refund_receiver: Address::ZERO,
            nonce,
        }
    }

    fn to_sol(&self) -> SafeTx {
        SafeTx {
            to: self.to,
            value: self.value,
            data: self.data.clone(),
            operation: self.operation,
            safeTxGas: self.safe_tx_gas,
            baseGas: self.base_gas,
            gasPrice: self.gas_price,
            gasToken: self.gas_token,
            refundReceiver: self.refund_receiver,
            nonce: self.nonce,
        }
    }
}

/// EIP-712 hash of a Safe transaction under the wallet's domain
/// `EIP712Domain(uint256 chainId,address verifyingContract)`.
pub fn safe_tx_hash(chain_id: u64, safe: Address, tx: &SafeTransactionData) -> B256 {
    let domain = Eip712Domain::new(None, None, Some(U256::from(chain_id)), Some(safe), None);
    tx.to_sol().eip712_signing_hash(&domain)
}

/// A Safe transaction ready to be signed and proposed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProposedTransaction {
    pub safe_tx_hash: B256,
    pub payload: SafeTransactionData,
}

/// EIP-1559 fee parameters, wei per gas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FeeParams {
    pub max_fee_per_gas: u128,
    pub max_priority_fee_per_gas: u128,
}

/// A destination-chain transaction to send from the executor account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitRequest {
    pub to: Address,
    pub input: Bytes,
    pub nonce: u64,
    pub fees: FeeParams,
    pub gas_limit: Option<u64>,
}

/// Result of `Broker::execute`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmittedTransaction {
    pub hash: B256,
    pub account_nonce: u64,
    pub fees: FeeParams,
}

/// Sign a 32-byte hash directly, without the personal-message prefix.
///
/// Returns `r || s || v` with `v` in {27, 28}, the form the Safe accepts
/// for owner signatures.
pub fn sign_transaction_hash(hash: B256, signer: &PrivateKeySigner) -> Result<Bytes> {
    let signature = signer
        .sign_hash_sync(&hash)
        .map_err(|e| RelayError::Other(format!("signing failed: {}", e)))?;
    Ok(Bytes::copy_from_slice(&signature.as_bytes()))
}

/// Recover the signer of a raw hash signature.
pub fn recover_signer(hash: B256, signature: &[u8]) -> Result<Address> {
    let signature = alloy::primitives::Signature::try_from(signature)
        .map_err(|e| RelayError::Decode(format!("invalid signature: {}", e)))?;
    signature
        .recover_address_from_prehash(&hash)
        .map_err(|e| RelayError::Decode(format!("signature recovery failed: {}", e)))
}

/// Decode an ABI `Error(string)` or `Panic(uint256)` revert payload.
pub fn decode_revert(data: &[u8]) -> Option<String> {
    if let Ok(revert) = Revert::abi_decode(data) {
        return Some(revert.reason);
    }
    if let Ok(panic) = Panic::abi_decode(data) {
        return Some(format!("panic code {}", panic.code));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use kwil_relay_types::{hex_to_b256, hex_to_bytes};

    fn vectors() -> serde_json::Value {
        let data = include_str!("../../../tests/vectors/rewards.json");
        serde_json::from_str(data).unwrap()
    }

    fn address(value: &serde_json::Value) -> Address {
        value.as_str().unwrap().parse().unwrap()
    }

    fn post_reward_payload(v: &serde_json::Value, nonce: u64) -> SafeTransactionData {
        let root = hex_to_b256(v["tree_with_3_leaves"]["root"].as_str().unwrap()).unwrap();
        let data = build_call_data(&EscrowCall::PostReward {
            root,
            amount: U256::from(100u64),
        });
        SafeTransactionData::call(address(&v["escrow"]), data, U256::from(nonce))
    }

    #[test]
    fn test_post_reward_calldata() {
        let v = vectors();
        let payload = post_reward_payload(&v, 0);

        assert_eq!(payload.data.len(), 68);
        assert_eq!(&payload.data[..4], &[0xeb, 0x63, 0x0d, 0xd3]);
        let expected = hex_to_bytes(v["safe_tx"]["post_reward_calldata"].as_str().unwrap()).unwrap();
        assert_eq!(payload.data.to_vec(), expected);
    }

    #[test]
    fn test_selectors() {
        assert_eq!(IRewardEscrow::updatePosterFeeCall::SELECTOR, [0xb1, 0x90, 0x50, 0xbd]);
        assert_eq!(IRewardEscrow::rewardPosterCall::SELECTOR, [0x75, 0xcb, 0xd8, 0x2d]);
        assert_eq!(ISafe::execTransactionCall::SELECTOR, [0x6a, 0x76, 0x12, 0x02]);
        assert_eq!(ISafe::nonceCall::SELECTOR, [0xaf, 0xfe, 0xd0, 0xe0]);
    }

    #[test]
    fn test_safe_tx_hash_vectors() {
        let v = vectors();
        let chain_id = v["chain_id"].as_u64().unwrap();
        let safe = address(&v["safe"]);

        let hash0 = safe_tx_hash(chain_id, safe, &post_reward_payload(&v, 0));
        let hash7 = safe_tx_hash(chain_id, safe, &post_reward_payload(&v, 7));

        assert_eq!(
            hash0,
            hex_to_b256(v["safe_tx"]["hash_nonce_0"].as_str().unwrap()).unwrap()
        );
        assert_eq!(
            hash7,
            hex_to_b256(v["safe_tx"]["hash_nonce_7"].as_str().unwrap()).unwrap()
        );
    }

    #[test]
    fn test_safe_tx_typehash() {
        let v = vectors();
        let expected = hex_to_b256(v["safe_tx"]["safe_tx_typehash"].as_str().unwrap()).unwrap();
        let payload = post_reward_payload(&v, 0);
        assert_eq!(payload.to_sol().eip712_type_hash(), expected);
    }

    #[test]
    fn test_sign_and_recover() {
        let signer: PrivateKeySigner =
            "0x59c6995e998f97a5a0044966f0945389dc9e86dae88c7a8412f4603b6b78690d"
                .parse()
                .unwrap();
        let hash = B256::repeat_byte(0x42);

        let signature = sign_transaction_hash(hash, &signer).unwrap();
        assert_eq!(signature.len(), 65);
        assert!(signature[64] == 27 || signature[64] == 28);
        let owner: Address = "0x70997970C51812dc3A010C7d01b50e0d17dc79C8".parse().unwrap();
        assert_eq!(signer.address(), owner);
        assert_eq!(recover_signer(hash, &signature).unwrap(), owner);
    }

    #[test]
    fn test_decode_revert() {
        // Error("GS013")
        let data = hex_to_bytes(concat!(
            "0x08c379a0",
            "0000000000000000000000000000000000000000000000000000000000000020",
            "0000000000000000000000000000000000000000000000000000000000000005",
            "4753303133000000000000000000000000000000000000000000000000000000",
        ))
        .unwrap();
        assert_eq!(decode_revert(&data).as_deref(), Some("GS013"));
    }

    #[test]
    fn test_payload_wire_shape() {
        let v = vectors();
        let payload = post_reward_payload(&v, 7);
        let json = serde_json::to_value(&payload).unwrap();

        assert_eq!(json["to"], "0xe7f1725E7734CE288F8367e1Bb143E90bb3F0512");
        assert_eq!(json["nonce"], "7");
        assert_eq!(json["safeTxGas"], "0");
        assert_eq!(json["operation"], 0);

        let back: SafeTransactionData = serde_json::from_value(json).unwrap();
        assert_eq!(back, payload);
    }
}
