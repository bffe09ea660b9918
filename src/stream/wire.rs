//! Wire format for the real-time feed.
//!
//! Frames arrive as a JSON envelope `{"message": "<base64>"}` whose payload
//! is a compact protobuf record. The single message type is small enough that
//! we derive it by hand instead of running `prost-build` over a `.proto`
//! file; the field tags below are the vendor's.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::Utc;
use serde::Deserialize;

use crate::core::FeedError;

/// The vendor's pricing record. Unlisted tags are fields we don't consume.
#[derive(Clone, PartialEq, prost::Message)]
pub(crate) struct PricingData {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(float, tag = "2")]
    pub price: f32,
    #[prost(sint64, tag = "3")]
    pub time: i64,
    #[prost(string, tag = "4")]
    pub currency: String,
    #[prost(string, tag = "5")]
    pub exchange: String,
    #[prost(int32, tag = "6")]
    pub quote_type: i32,
    #[prost(int32, tag = "7")]
    pub market_hours: i32,
    #[prost(float, tag = "8")]
    pub change_percent: f32,
    #[prost(sint64, tag = "9")]
    pub day_volume: i64,
    #[prost(float, tag = "10")]
    pub day_high: f32,
    #[prost(float, tag = "11")]
    pub day_low: f32,
    #[prost(float, tag = "12")]
    pub change: f32,
    #[prost(string, tag = "13")]
    pub short_name: String,
    #[prost(float, tag = "15")]
    pub open_price: f32,
    #[prost(float, tag = "16")]
    pub previous_close: f32,
    #[prost(float, tag = "23")]
    pub bid: f32,
    #[prost(float, tag = "25")]
    pub ask: f32,
}

/// Asset class of a streamed instrument, mapped from the vendor's numeric
/// code. Unrecognized codes map to [`AssetClass::Unknown`] rather than
/// failing the frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum AssetClass {
    Equity,
    Etf,
    Option,
    MutualFund,
    Index,
    Cryptocurrency,
    Currency,
    Future,
    Unknown,
}

impl AssetClass {
    #[must_use]
    pub fn from_code(code: i32) -> Self {
        match code {
            1 => Self::Equity,
            2 => Self::Etf,
            5 => Self::Option,
            6 => Self::MutualFund,
            8 => Self::Index,
            11 => Self::Cryptocurrency,
            12 => Self::Currency,
            13 => Self::Future,
            _ => Self::Unknown,
        }
    }
}

/// Market session phase at the time of the tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum MarketHours {
    Closed,
    Regular,
    PreMarket,
    PostMarket,
    Unknown,
}

impl MarketHours {
    #[must_use]
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => Self::Closed,
            1 => Self::Regular,
            2 => Self::PreMarket,
            3 => Self::PostMarket,
            _ => Self::Unknown,
        }
    }
}

/// Lightweight per-tick update. Every successfully decoded frame yields one.
#[derive(Debug, Clone, PartialEq)]
pub struct PriceUpdate {
    pub symbol: String,
    pub price: f64,
    pub change: f64,
    pub change_percent: f64,
    /// Unix milliseconds; falls back to the client clock when the frame
    /// carries no timestamp.
    pub timestamp: i64,
    pub volume: Option<i64>,
    pub bid: Option<f64>,
    pub ask: Option<f64>,
    pub market_hours: MarketHours,
    pub asset_class: AssetClass,
}

/// Richer quote emitted only for frames that carry the full field set.
#[derive(Debug, Clone, PartialEq)]
pub struct DetailedQuote {
    pub symbol: String,
    pub name: String,
    pub currency: String,
    pub exchange: String,
    pub price: f64,
    pub change: f64,
    pub change_percent: f64,
    pub day_high: f64,
    pub day_low: f64,
    pub open: f64,
    pub previous_close: f64,
    /// Unix milliseconds.
    pub timestamp: i64,
    pub market_hours: MarketHours,
    pub asset_class: AssetClass,
}

#[derive(Deserialize)]
struct Envelope {
    message: String,
}

/// Decode one inbound frame.
///
/// Accepts either the JSON envelope or a bare base64 payload. Always
/// produces a [`PriceUpdate`]; the [`DetailedQuote`] is present only when the
/// frame carries currency, exchange, name and the full OHLC-adjacent set.
/// Unknown numeric codes never fail the frame.
pub fn decode_message(text: &str) -> Result<(PriceUpdate, Option<DetailedQuote>), FeedError> {
    let payload = match serde_json::from_str::<Envelope>(text) {
        Ok(env) => env.message,
        Err(_) => text.trim().to_string(),
    };
    let bytes = BASE64
        .decode(payload.as_bytes())
        .map_err(|e| FeedError::Data(format!("frame is not valid base64: {e}")))?;
    let data = <PricingData as prost::Message>::decode(bytes.as_slice())?;
    Ok(map_pricing_data(&data))
}

fn map_pricing_data(data: &PricingData) -> (PriceUpdate, Option<DetailedQuote>) {
    let market_hours = MarketHours::from_code(data.market_hours);
    let asset_class = AssetClass::from_code(data.quote_type);
    let timestamp = if data.time > 0 {
        data.time
    } else {
        Utc::now().timestamp_millis()
    };

    let update = PriceUpdate {
        symbol: data.id.clone(),
        price: f64::from(data.price),
        change: f64::from(data.change),
        change_percent: f64::from(data.change_percent),
        timestamp,
        volume: (data.day_volume > 0).then_some(data.day_volume),
        bid: positive(data.bid),
        ask: positive(data.ask),
        market_hours,
        asset_class,
    };

    let has_detail = !data.currency.is_empty()
        && !data.exchange.is_empty()
        && !data.short_name.is_empty()
        && data.day_high != 0.0
        && data.day_low != 0.0
        && data.open_price != 0.0
        && data.previous_close != 0.0;

    let detailed = has_detail.then(|| DetailedQuote {
        symbol: data.id.clone(),
        name: data.short_name.clone(),
        currency: data.currency.clone(),
        exchange: data.exchange.clone(),
        price: f64::from(data.price),
        change: f64::from(data.change),
        change_percent: f64::from(data.change_percent),
        day_high: f64::from(data.day_high),
        day_low: f64::from(data.day_low),
        open: f64::from(data.open_price),
        previous_close: f64::from(data.previous_close),
        timestamp,
        market_hours,
        asset_class,
    });

    (update, detailed)
}

fn positive(v: f32) -> Option<f64> {
    (v > 0.0).then_some(f64::from(v))
}
