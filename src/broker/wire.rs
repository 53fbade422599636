// =============================================================================
// Broker wire codec — binary tick frames and JSON control messages
// =============================================================================
//
// The ticker socket carries big-endian binary frames: a 2-byte packet
// count, then length-prefixed packets. Packet length determines the mode:
// 8 bytes LTP, 28/32 index quote/full, 44 quote, 184 full (quote + OI +
// timestamps + ten depth levels). Prices arrive as integer paise and are
// scaled by a per-segment divisor. Control messages (subscribe, mode,
// unsubscribe) are JSON text frames.
// =============================================================================

use chrono::{DateTime, TimeZone, Utc};
use serde_json::json;
use tracing::trace;

use crate::ticks::frames::{DepthLevel, MarketDepth, Ohlc, TickFrame};
use crate::types::TickMode;

/// Exchange segment code embedded in the low byte of the token.
const SEGMENT_CDS: u32 = 3;
const SEGMENT_BCD: u32 = 6;
const SEGMENT_INDICES: u32 = 9;

fn price_divisor(token: u32) -> f64 {
    match token & 0xff {
        SEGMENT_CDS => 10_000_000.0,
        SEGMENT_BCD => 10_000.0,
        _ => 100.0,
    }
}

fn read_u16(buf: &[u8], at: usize) -> Option<u16> {
    Some(u16::from_be_bytes([*buf.get(at)?, *buf.get(at + 1)?]))
}

fn read_u32(buf: &[u8], at: usize) -> Option<u32> {
    Some(u32::from_be_bytes([
        *buf.get(at)?,
        *buf.get(at + 1)?,
        *buf.get(at + 2)?,
        *buf.get(at + 3)?,
    ]))
}

fn read_i32(buf: &[u8], at: usize) -> Option<i32> {
    read_u32(buf, at).map(|v| v as i32)
}

/// Decode one binary message into tick frames.
///
/// Malformed packets are skipped; a frame is never partially decoded.
/// `received_at` stands in when a packet carries no exchange timestamp.
pub fn parse_binary(buf: &[u8], received_at: DateTime<Utc>) -> Vec<TickFrame> {
    let mut ticks = Vec::new();
    let count = match read_u16(buf, 0) {
        Some(c) => c as usize,
        None => return ticks,
    };

    let mut offset = 2;
    for _ in 0..count {
        let len = match read_u16(buf, offset) {
            Some(l) => l as usize,
            None => break,
        };
        offset += 2;
        let Some(packet) = buf.get(offset..offset + len) else {
            break;
        };
        offset += len;

        if let Some(tick) = parse_packet(packet, received_at) {
            ticks.push(tick);
        } else {
            trace!(len, "skipping malformed tick packet");
        }
    }

    ticks
}

fn parse_packet(packet: &[u8], received_at: DateTime<Utc>) -> Option<TickFrame> {
    let token = read_u32(packet, 0)?;
    let divisor = price_divisor(token);
    let is_index = token & 0xff == SEGMENT_INDICES;

    let price_at = |at: usize| -> Option<f64> { Some(read_i32(packet, at)? as f64 / divisor) };

    match packet.len() {
        // LTP mode: token + last price.
        8 => Some(TickFrame {
            instrument_token: token,
            last_price: price_at(4)?,
            volume: 0,
            timestamp: received_at,
            oi: None,
            ohlc: None,
            depth: None,
        }),

        // Index quote (28) / index full (32): ltp, H, L, O, C, change[, ts].
        28 | 32 if is_index => {
            let timestamp = if packet.len() == 32 {
                epoch_or(received_at, read_u32(packet, 28)?)
            } else {
                received_at
            };
            Some(TickFrame {
                instrument_token: token,
                last_price: price_at(4)?,
                volume: 0,
                timestamp,
                oi: None,
                ohlc: Some(Ohlc {
                    high: price_at(8)?,
                    low: price_at(12)?,
                    open: price_at(16)?,
                    close: price_at(20)?,
                }),
                depth: None,
            })
        }

        // Quote mode: ltp, last qty, avg price, volume, buy/sell qty, OHLC.
        44 => Some(TickFrame {
            instrument_token: token,
            last_price: price_at(4)?,
            volume: read_u32(packet, 16)? as u64,
            timestamp: received_at,
            oi: None,
            ohlc: Some(Ohlc {
                open: price_at(28)?,
                high: price_at(32)?,
                low: price_at(36)?,
                close: price_at(40)?,
            }),
            depth: None,
        }),

        // Full mode: quote + trade ts, OI, OI band, exchange ts, 10 depth
        // levels of (qty, price, orders, pad).
        184 => {
            let mut depth = MarketDepth::default();
            for level in 0..10 {
                let at = 64 + level * 12;
                let entry = DepthLevel {
                    quantity: read_u32(packet, at)?,
                    price: read_i32(packet, at + 4)? as f64 / divisor,
                    orders: read_u16(packet, at + 8)? as u32,
                };
                if level < 5 {
                    depth.buy.push(entry);
                } else {
                    depth.sell.push(entry);
                }
            }

            Some(TickFrame {
                instrument_token: token,
                last_price: price_at(4)?,
                volume: read_u32(packet, 16)? as u64,
                timestamp: epoch_or(received_at, read_u32(packet, 60)?),
                oi: Some(read_u32(packet, 48)? as u64),
                ohlc: Some(Ohlc {
                    open: price_at(28)?,
                    high: price_at(32)?,
                    low: price_at(36)?,
                    close: price_at(40)?,
                }),
                depth: Some(depth),
            })
        }

        _ => None,
    }
}

fn epoch_or(fallback: DateTime<Utc>, secs: u32) -> DateTime<Utc> {
    if secs == 0 {
        return fallback;
    }
    Utc.timestamp_opt(secs as i64, 0).single().unwrap_or(fallback)
}

// =============================================================================
// Control frames
// =============================================================================

pub fn subscribe_message(tokens: &[u32]) -> String {
    json!({"a": "subscribe", "v": tokens}).to_string()
}

pub fn unsubscribe_message(tokens: &[u32]) -> String {
    json!({"a": "unsubscribe", "v": tokens}).to_string()
}

pub fn mode_message(mode: TickMode, tokens: &[u32]) -> String {
    json!({"a": "mode", "v": [mode.wire_word(), tokens]}).to_string()
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    struct PacketBuilder {
        buf: Vec<u8>,
    }

    impl PacketBuilder {
        fn new() -> Self {
            Self { buf: Vec::new() }
        }

        fn u16(mut self, v: u16) -> Self {
            self.buf.extend_from_slice(&v.to_be_bytes());
            self
        }

        fn u32(mut self, v: u32) -> Self {
            self.buf.extend_from_slice(&v.to_be_bytes());
            self
        }
    }

    fn frame(packets: Vec<Vec<u8>>) -> Vec<u8> {
        let mut buf = (packets.len() as u16).to_be_bytes().to_vec();
        for p in packets {
            buf.extend_from_slice(&(p.len() as u16).to_be_bytes());
            buf.extend_from_slice(&p);
        }
        buf
    }

    // NFO token with segment code 2 in the low byte.
    const NFO_TOKEN: u32 = 12683010;

    #[test]
    fn ltp_packet_decodes() {
        let packet = PacketBuilder::new()
            .u32(NFO_TOKEN)
            .u32(18_240) // 182.40 in paise
            .buf;
        let ticks = parse_binary(&frame(vec![packet]), Utc::now());
        assert_eq!(ticks.len(), 1);
        assert_eq!(ticks[0].instrument_token, NFO_TOKEN);
        assert!((ticks[0].last_price - 182.40).abs() < 1e-9);
        assert!(ticks[0].depth.is_none());
    }

    #[test]
    fn quote_packet_carries_volume_and_ohlc() {
        let packet = PacketBuilder::new()
            .u32(NFO_TOKEN)
            .u32(18_240) // ltp
            .u32(50) // last qty
            .u32(18_100) // avg price
            .u32(1_250_000) // volume
            .u32(10_000) // buy qty
            .u32(12_000) // sell qty
            .u32(17_900) // open
            .u32(18_500) // high
            .u32(17_800) // low
            .u32(18_000) // close
            .buf;
        assert_eq!(packet.len(), 44);

        let ticks = parse_binary(&frame(vec![packet]), Utc::now());
        assert_eq!(ticks.len(), 1);
        let tick = &ticks[0];
        assert_eq!(tick.volume, 1_250_000);
        let ohlc = tick.ohlc.unwrap();
        assert!((ohlc.open - 179.0).abs() < 1e-9);
        assert!((ohlc.high - 185.0).abs() < 1e-9);
    }

    #[test]
    fn full_packet_carries_oi_timestamp_and_depth() {
        let mut b = PacketBuilder::new()
            .u32(NFO_TOKEN)
            .u32(18_240)
            .u32(50)
            .u32(18_100)
            .u32(1_250_000)
            .u32(10_000)
            .u32(12_000)
            .u32(17_900)
            .u32(18_500)
            .u32(17_800)
            .u32(18_000)
            .u32(1_763_960_000) // last trade ts
            .u32(3_400_000) // oi
            .u32(3_500_000) // oi high
            .u32(3_300_000) // oi low
            .u32(1_763_960_400); // exchange ts
        for level in 0..10u32 {
            b = b.u32(50 + level).u32(18_200 + level).u16(3).u16(0);
        }
        let packet = b.buf;
        assert_eq!(packet.len(), 184);

        let ticks = parse_binary(&frame(vec![packet]), Utc::now());
        assert_eq!(ticks.len(), 1);
        let tick = &ticks[0];
        assert_eq!(tick.oi, Some(3_400_000));
        assert_eq!(tick.timestamp.timestamp(), 1_763_960_400);

        let depth = tick.depth.as_ref().unwrap();
        assert_eq!(depth.buy.len(), 5);
        assert_eq!(depth.sell.len(), 5);
        assert_eq!(depth.buy[0].quantity, 50);
        assert_eq!(depth.buy[0].orders, 3);
        assert!((depth.sell[0].price - 182.05).abs() < 1e-9);
    }

    #[test]
    fn index_quote_uses_index_layout() {
        // NSE index token: low byte 9.
        let token = (1000 << 8) | 9;
        let packet = PacketBuilder::new()
            .u32(token)
            .u32(2_450_000) // ltp 24500.00
            .u32(2_460_000) // high
            .u32(2_440_000) // low
            .u32(2_445_000) // open
            .u32(2_448_000) // close
            .u32(5_000) // change
            .buf;
        assert_eq!(packet.len(), 28);

        let ticks = parse_binary(&frame(vec![packet]), Utc::now());
        assert_eq!(ticks.len(), 1);
        let ohlc = ticks[0].ohlc.unwrap();
        assert!((ticks[0].last_price - 24_500.0).abs() < 1e-9);
        assert!((ohlc.open - 24_450.0).abs() < 1e-9);
    }

    #[test]
    fn currency_divisor_applies() {
        // CDS token: low byte 3.
        let token = (77 << 8) | 3;
        let packet = PacketBuilder::new()
            .u32(token)
            .u32(845_525_000) // 84.5525 at 1e7 divisor
            .buf;
        let ticks = parse_binary(&frame(vec![packet]), Utc::now());
        assert!((ticks[0].last_price - 84.5525).abs() < 1e-9);
    }

    #[test]
    fn multiple_packets_in_one_frame() {
        let a = PacketBuilder::new().u32(NFO_TOKEN).u32(100).buf;
        let b = PacketBuilder::new().u32(NFO_TOKEN + 256).u32(200).buf;
        let ticks = parse_binary(&frame(vec![a, b]), Utc::now());
        assert_eq!(ticks.len(), 2);
    }

    #[test]
    fn truncated_frame_yields_what_fits() {
        let a = PacketBuilder::new().u32(NFO_TOKEN).u32(100).buf;
        let mut buf = frame(vec![a]);
        // Claim two packets but provide one.
        buf[1] = 2;
        let ticks = parse_binary(&buf, Utc::now());
        assert_eq!(ticks.len(), 1);
    }

    #[test]
    fn odd_length_packet_is_skipped() {
        let bad = vec![0u8; 13];
        let good = PacketBuilder::new().u32(NFO_TOKEN).u32(100).buf;
        let ticks = parse_binary(&frame(vec![bad, good]), Utc::now());
        assert_eq!(ticks.len(), 1);
    }

    #[test]
    fn control_messages_match_the_protocol() {
        assert_eq!(
            subscribe_message(&[408065, 256265]),
            r#"{"a":"subscribe","v":[408065,256265]}"#
        );
        assert_eq!(
            unsubscribe_message(&[408065]),
            r#"{"a":"unsubscribe","v":[408065]}"#
        );
        assert_eq!(
            mode_message(TickMode::Full, &[408065]),
            r#"{"a":"mode","v":["full",[408065]]}"#
        );
    }
}
