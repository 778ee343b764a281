//! Core types shared by every layer
//!
//! - SubscriptionKey / Provider: identity of one logical stream
//! - Tick, Bar, SymbolMetadata: provider-reported fields
//! - SymbolDataPackage: combined cold state for a symbol

pub mod key;
pub mod market_data;

pub use key::{Provider, SubscriptionKey};
pub use market_data::{Bar, PartPayload, PartType, SymbolDataPackage, SymbolMetadata, Tick};
