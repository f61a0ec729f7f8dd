//! Confirmation depth for different L1/L2 networks
//!
//! Different chains have different finality models:
//! - Ethereum: Probabilistic (12 blocks is the usual exchange depth)
//! - BSC: 15 blocks
//! - Polygon: Probabilistic (128 blocks)
//! - Arbitrum / Optimism / Base: soft finality from the sequencer
//! - Avalanche: Instant finality (1 block)

/// Get recommended confirmation blocks for a chain
pub fn recommended_confirmations(chain_id: u64) -> u64 {
    match chain_id {
        // Ethereum mainnet
        1 => 12,
        // Ethereum testnets
        11155111 | 17000 => 6,
        // BNB Smart Chain
        56 | 97 => 15,
        // Polygon mainnet
        137 => 128,
        // Polygon testnets
        80002 => 32,
        // Arbitrum
        42161 | 421614 => 20,
        // Optimism
        10 | 11155420 => 20,
        // Base
        8453 | 84532 => 20,
        // Avalanche (instant finality)
        43114 | 43113 => 1,
        // Default conservative
        _ => 30,
    }
}

/// Confirmations of a transaction mined at `mined_at`, counting its own block
pub fn confirmations(latest: u64, mined_at: u64) -> u64 {
    if mined_at == 0 || latest < mined_at {
        0
    } else {
        latest - mined_at + 1
    }
}
