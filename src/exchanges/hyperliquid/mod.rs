pub mod codec;
pub mod types;

// Re-export main types for easier importing
pub use codec::HyperliquidCodec;
pub use types::{parse_l2_book, parse_trades, L2BookUpdate, L2Level, Side, WsTrade};

/// Public Hyperliquid WebSocket endpoint
pub const MAINNET_WS_URL: &str = "wss://api.hyperliquid.xyz/ws";
pub const TESTNET_WS_URL: &str = "wss://api.hyperliquid-testnet.xyz/ws";
