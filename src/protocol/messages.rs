//! Relay <-> client wire messages
//!
//! JSON objects over WebSocket, distinguished by a `type` tag.

use serde::{Deserialize, Serialize};

use crate::core::{PartType, Provider, SubscriptionKey, SymbolDataPackage, Tick};

/// Wire protocol errors
#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("Invalid message: {0}")]
    InvalidMessage(String),
    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

// ==================== client -> relay ====================

/// Message sent by a client to the relay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    Subscribe {
        symbol: String,
        provider: Provider,
        #[serde(default)]
        history_depth: u32,
    },
    Unsubscribe {
        symbol: String,
        provider: Provider,
    },
    GetSymbolDataPackage {
        symbol: String,
        provider: Provider,
        #[serde(default)]
        lookback_days: u32,
    },
}

impl ClientMessage {
    pub fn from_json(json: &str) -> Result<Self, MessageError> {
        serde_json::from_str(json).map_err(|e| MessageError::InvalidMessage(e.to_string()))
    }

    pub fn to_json(&self) -> Result<String, MessageError> {
        serde_json::to_string(self).map_err(MessageError::from)
    }

    pub fn key(&self) -> SubscriptionKey {
        match self {
            ClientMessage::Subscribe { symbol, provider, .. }
            | ClientMessage::Unsubscribe { symbol, provider }
            | ClientMessage::GetSymbolDataPackage { symbol, provider, .. } => {
                SubscriptionKey::new(symbol.clone(), *provider)
            }
        }
    }

    pub fn subscribe(key: &SubscriptionKey, history_depth: u32) -> Self {
        ClientMessage::Subscribe {
            symbol: key.symbol.clone(),
            provider: key.provider,
            history_depth,
        }
    }

    pub fn unsubscribe(key: &SubscriptionKey) -> Self {
        ClientMessage::Unsubscribe {
            symbol: key.symbol.clone(),
            provider: key.provider,
        }
    }
}

// ==================== relay -> client ====================

/// Connection or data-freshness state reported on the status stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusState {
    Connecting,
    Connected,
    Stale,
    Resumed,
    Error,
}

/// Message sent by the relay to a client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    SymbolDataPackage(SymbolDataPackage),
    Tick(Tick),
    Status {
        state: StatusState,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        symbol: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        provider: Option<Provider>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    /// Per-key failure: nothing usable arrived before the deadline
    Error {
        symbol: String,
        provider: Provider,
        message: String,
        #[serde(default)]
        missing_parts: Vec<PartType>,
    },
}

impl ServerMessage {
    pub fn from_json(json: &str) -> Result<Self, MessageError> {
        serde_json::from_str(json).map_err(|e| MessageError::InvalidMessage(e.to_string()))
    }

    pub fn to_json(&self) -> Result<String, MessageError> {
        serde_json::to_string(self).map_err(MessageError::from)
    }

    /// Connection-level status, not tied to a key
    pub fn status(state: StatusState) -> Self {
        ServerMessage::Status {
            state,
            symbol: None,
            provider: None,
            message: None,
        }
    }

    /// Status scoped to one key
    pub fn key_status(key: &SubscriptionKey, state: StatusState) -> Self {
        ServerMessage::Status {
            state,
            symbol: Some(key.symbol.clone()),
            provider: Some(key.provider),
            message: None,
        }
    }

    /// Key this message belongs to, if any
    pub fn key(&self) -> Option<SubscriptionKey> {
        match self {
            ServerMessage::SymbolDataPackage(package) => Some(package.key()),
            ServerMessage::Tick(tick) => Some(tick.key()),
            ServerMessage::Status {
                symbol: Some(symbol),
                provider: Some(provider),
                ..
            } => Some(SubscriptionKey::new(symbol.clone(), *provider)),
            ServerMessage::Status { .. } => None,
            ServerMessage::Error { symbol, provider, .. } => {
                Some(SubscriptionKey::new(symbol.clone(), *provider))
            }
        }
    }
}
