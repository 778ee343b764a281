//! Binary frame codec for the stream provider
//!
//! Frame layout (big endian):
//!
//! ```text
//! u16 payload_type | u32 request_id | body
//! ```
//!
//! Strings are `u16 length + UTF-8`. Prices travel as integers scaled by
//! `PRICE_SCALE`. Trendbars are relative: `low` absolute, the rest as deltas.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::core::Bar;

/// Raw price units per 1.0
pub const PRICE_SCALE: f64 = 100_000.0;

/// Frame header size in bytes
pub const HEADER_LEN: usize = 6;

pub mod payload_type {
    pub const HEARTBEAT_EVENT: u16 = 51;
    pub const APP_AUTH_REQ: u16 = 2100;
    pub const APP_AUTH_RES: u16 = 2101;
    pub const ACCOUNT_AUTH_REQ: u16 = 2102;
    pub const ACCOUNT_AUTH_RES: u16 = 2103;
    pub const SYMBOL_BY_NAME_REQ: u16 = 2114;
    pub const SYMBOL_BY_NAME_RES: u16 = 2115;
    pub const SUBSCRIBE_SPOTS_REQ: u16 = 2127;
    pub const SUBSCRIBE_SPOTS_RES: u16 = 2128;
    pub const UNSUBSCRIBE_SPOTS_REQ: u16 = 2129;
    pub const UNSUBSCRIBE_SPOTS_RES: u16 = 2130;
    pub const SPOT_EVENT: u16 = 2131;
    pub const GET_TRENDBARS_REQ: u16 = 2137;
    pub const GET_TRENDBARS_RES: u16 = 2138;
    pub const ERROR_RES: u16 = 2142;
}

/// Bar period for trendbar requests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TrendbarPeriod {
    M1 = 1,
    H1 = 9,
    D1 = 12,
}

impl TrendbarPeriod {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Self::M1),
            9 => Some(Self::H1),
            12 => Some(Self::D1),
            _ => None,
        }
    }
}

/// Relative-encoded trendbar
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawTrendbar {
    pub timestamp: u64,
    pub low: u64,
    pub delta_open: u64,
    pub delta_high: u64,
    pub delta_close: u64,
    pub volume: u64,
}

impl RawTrendbar {
    pub fn to_bar(&self) -> Bar {
        let low = self.low as f64;
        Bar {
            time: self.timestamp,
            open: (low + self.delta_open as f64) / PRICE_SCALE,
            high: (low + self.delta_high as f64) / PRICE_SCALE,
            low: low / PRICE_SCALE,
            close: (low + self.delta_close as f64) / PRICE_SCALE,
            volume: self.volume as f64,
        }
    }
}

/// Stream protocol message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamMessage {
    Heartbeat,
    AppAuthReq {
        client_id: String,
        client_secret: String,
    },
    AppAuthRes,
    AccountAuthReq {
        account_id: u64,
        access_token: String,
    },
    AccountAuthRes {
        account_id: u64,
    },
    SymbolByNameReq {
        account_id: u64,
        name: String,
    },
    SymbolByNameRes {
        symbol_id: u64,
        name: String,
        digits: u8,
        pip_position: u8,
    },
    SubscribeSpotsReq {
        account_id: u64,
        symbol_id: u64,
    },
    SubscribeSpotsRes,
    UnsubscribeSpotsReq {
        account_id: u64,
        symbol_id: u64,
    },
    UnsubscribeSpotsRes,
    /// Zero on either side means "unchanged"
    SpotEvent {
        symbol_id: u64,
        bid: u64,
        ask: u64,
        timestamp: u64,
    },
    GetTrendbarsReq {
        account_id: u64,
        symbol_id: u64,
        from_ms: u64,
        to_ms: u64,
        period: TrendbarPeriod,
    },
    GetTrendbarsRes {
        symbol_id: u64,
        period: TrendbarPeriod,
        bars: Vec<RawTrendbar>,
    },
    ErrorRes {
        code: String,
        description: String,
    },
}

impl StreamMessage {
    pub fn payload_type(&self) -> u16 {
        use payload_type::*;
        match self {
            StreamMessage::Heartbeat => HEARTBEAT_EVENT,
            StreamMessage::AppAuthReq { .. } => APP_AUTH_REQ,
            StreamMessage::AppAuthRes => APP_AUTH_RES,
            StreamMessage::AccountAuthReq { .. } => ACCOUNT_AUTH_REQ,
            StreamMessage::AccountAuthRes { .. } => ACCOUNT_AUTH_RES,
            StreamMessage::SymbolByNameReq { .. } => SYMBOL_BY_NAME_REQ,
            StreamMessage::SymbolByNameRes { .. } => SYMBOL_BY_NAME_RES,
            StreamMessage::SubscribeSpotsReq { .. } => SUBSCRIBE_SPOTS_REQ,
            StreamMessage::SubscribeSpotsRes => SUBSCRIBE_SPOTS_RES,
            StreamMessage::UnsubscribeSpotsReq { .. } => UNSUBSCRIBE_SPOTS_REQ,
            StreamMessage::UnsubscribeSpotsRes => UNSUBSCRIBE_SPOTS_RES,
            StreamMessage::SpotEvent { .. } => SPOT_EVENT,
            StreamMessage::GetTrendbarsReq { .. } => GET_TRENDBARS_REQ,
            StreamMessage::GetTrendbarsRes { .. } => GET_TRENDBARS_RES,
            StreamMessage::ErrorRes { .. } => ERROR_RES,
        }
    }
}

/// Decoded frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamFrame {
    /// Echoed by the provider on responses; 0 for events
    pub request_id: u32,
    pub message: StreamMessage,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("frame truncated: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },
    #[error("unknown payload type {0}")]
    UnknownPayload(u16),
    #[error("invalid utf-8 in string field")]
    InvalidUtf8,
    #[error("unknown trendbar period {0}")]
    UnknownPeriod(u8),
    #[error("{0} trailing bytes after payload")]
    TrailingBytes(usize),
}

fn put_str(buf: &mut BytesMut, s: &str) {
    let bytes = s.as_bytes();
    let len = bytes.len().min(u16::MAX as usize);
    buf.put_u16(len as u16);
    buf.put_slice(&bytes[..len]);
}

impl StreamFrame {
    pub fn new(request_id: u32, message: StreamMessage) -> Self {
        Self {
            request_id,
            message,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(64);
        buf.put_u16(self.message.payload_type());
        buf.put_u32(self.request_id);

        match &self.message {
            StreamMessage::Heartbeat
            | StreamMessage::AppAuthRes
            | StreamMessage::SubscribeSpotsRes
            | StreamMessage::UnsubscribeSpotsRes => {}
            StreamMessage::AppAuthReq {
                client_id,
                client_secret,
            } => {
                put_str(&mut buf, client_id);
                put_str(&mut buf, client_secret);
            }
            StreamMessage::AccountAuthReq {
                account_id,
                access_token,
            } => {
                buf.put_u64(*account_id);
                put_str(&mut buf, access_token);
            }
            StreamMessage::AccountAuthRes { account_id } => buf.put_u64(*account_id),
            StreamMessage::SymbolByNameReq { account_id, name } => {
                buf.put_u64(*account_id);
                put_str(&mut buf, name);
            }
            StreamMessage::SymbolByNameRes {
                symbol_id,
                name,
                digits,
                pip_position,
            } => {
                buf.put_u64(*symbol_id);
                put_str(&mut buf, name);
                buf.put_u8(*digits);
                buf.put_u8(*pip_position);
            }
            StreamMessage::SubscribeSpotsReq {
                account_id,
                symbol_id,
            }
            | StreamMessage::UnsubscribeSpotsReq {
                account_id,
                symbol_id,
            } => {
                buf.put_u64(*account_id);
                buf.put_u64(*symbol_id);
            }
            StreamMessage::SpotEvent {
                symbol_id,
                bid,
                ask,
                timestamp,
            } => {
                buf.put_u64(*symbol_id);
                buf.put_u64(*bid);
                buf.put_u64(*ask);
                buf.put_u64(*timestamp);
            }
            StreamMessage::GetTrendbarsReq {
                account_id,
                symbol_id,
                from_ms,
                to_ms,
                period,
            } => {
                buf.put_u64(*account_id);
                buf.put_u64(*symbol_id);
                buf.put_u64(*from_ms);
                buf.put_u64(*to_ms);
                buf.put_u8(*period as u8);
            }
            StreamMessage::GetTrendbarsRes {
                symbol_id,
                period,
                bars,
            } => {
                buf.put_u64(*symbol_id);
                buf.put_u8(*period as u8);
                buf.put_u32(bars.len() as u32);
                for bar in bars {
                    buf.put_u64(bar.timestamp);
                    buf.put_u64(bar.low);
                    buf.put_u64(bar.delta_open);
                    buf.put_u64(bar.delta_high);
                    buf.put_u64(bar.delta_close);
                    buf.put_u64(bar.volume);
                }
            }
            StreamMessage::ErrorRes { code, description } => {
                put_str(&mut buf, code);
                put_str(&mut buf, description);
            }
        }

        buf.freeze()
    }

    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        let mut r = Reader { buf: data };
        let payload = r.u16()?;
        let request_id = r.u32()?;

        use payload_type::*;
        let message = match payload {
            HEARTBEAT_EVENT => StreamMessage::Heartbeat,
            APP_AUTH_REQ => StreamMessage::AppAuthReq {
                client_id: r.string()?,
                client_secret: r.string()?,
            },
            APP_AUTH_RES => StreamMessage::AppAuthRes,
            ACCOUNT_AUTH_REQ => StreamMessage::AccountAuthReq {
                account_id: r.u64()?,
                access_token: r.string()?,
            },
            ACCOUNT_AUTH_RES => StreamMessage::AccountAuthRes {
                account_id: r.u64()?,
            },
            SYMBOL_BY_NAME_REQ => StreamMessage::SymbolByNameReq {
                account_id: r.u64()?,
                name: r.string()?,
            },
            SYMBOL_BY_NAME_RES => StreamMessage::SymbolByNameRes {
                symbol_id: r.u64()?,
                name: r.string()?,
                digits: r.u8()?,
                pip_position: r.u8()?,
            },
            SUBSCRIBE_SPOTS_REQ => StreamMessage::SubscribeSpotsReq {
                account_id: r.u64()?,
                symbol_id: r.u64()?,
            },
            SUBSCRIBE_SPOTS_RES => StreamMessage::SubscribeSpotsRes,
            UNSUBSCRIBE_SPOTS_REQ => StreamMessage::UnsubscribeSpotsReq {
                account_id: r.u64()?,
                symbol_id: r.u64()?,
            },
            UNSUBSCRIBE_SPOTS_RES => StreamMessage::UnsubscribeSpotsRes,
            SPOT_EVENT => StreamMessage::SpotEvent {
                symbol_id: r.u64()?,
                bid: r.u64()?,
                ask: r.u64()?,
                timestamp: r.u64()?,
            },
            GET_TRENDBARS_REQ => StreamMessage::GetTrendbarsReq {
                account_id: r.u64()?,
                symbol_id: r.u64()?,
                from_ms: r.u64()?,
                to_ms: r.u64()?,
                period: r.period()?,
            },
            GET_TRENDBARS_RES => {
                let symbol_id = r.u64()?;
                let period = r.period()?;
                let count = r.u32()? as usize;
                // 6 x u64 per bar; reject lying counts before allocating
                r.need(count.saturating_mul(48))?;
                let mut bars = Vec::with_capacity(count);
                for _ in 0..count {
                    bars.push(RawTrendbar {
                        timestamp: r.u64()?,
                        low: r.u64()?,
                        delta_open: r.u64()?,
                        delta_high: r.u64()?,
                        delta_close: r.u64()?,
                        volume: r.u64()?,
                    });
                }
                StreamMessage::GetTrendbarsRes {
                    symbol_id,
                    period,
                    bars,
                }
            }
            ERROR_RES => StreamMessage::ErrorRes {
                code: r.string()?,
                description: r.string()?,
            },
            other => return Err(CodecError::UnknownPayload(other)),
        };

        if !r.buf.is_empty() {
            return Err(CodecError::TrailingBytes(r.buf.len()));
        }
        Ok(Self {
            request_id,
            message,
        })
    }
}

/// Bounds-checked reader; `Buf` getters panic on short input
struct Reader<'a> {
    buf: &'a [u8],
}

impl Reader<'_> {
    #[inline]
    fn need(&self, n: usize) -> Result<(), CodecError> {
        if self.buf.remaining() < n {
            return Err(CodecError::Truncated {
                need: n,
                have: self.buf.remaining(),
            });
        }
        Ok(())
    }

    fn u8(&mut self) -> Result<u8, CodecError> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    fn u16(&mut self) -> Result<u16, CodecError> {
        self.need(2)?;
        Ok(self.buf.get_u16())
    }

    fn u32(&mut self) -> Result<u32, CodecError> {
        self.need(4)?;
        Ok(self.buf.get_u32())
    }

    fn u64(&mut self) -> Result<u64, CodecError> {
        self.need(8)?;
        Ok(self.buf.get_u64())
    }

    fn string(&mut self) -> Result<String, CodecError> {
        let len = self.u16()? as usize;
        self.need(len)?;
        let (head, tail) = self.buf.split_at(len);
        self.buf = tail;
        std::str::from_utf8(head)
            .map(str::to_owned)
            .map_err(|_| CodecError::InvalidUtf8)
    }

    fn period(&mut self) -> Result<TrendbarPeriod, CodecError> {
        let v = self.u8()?;
        TrendbarPeriod::from_u8(v).ok_or(CodecError::UnknownPeriod(v))
    }
}
