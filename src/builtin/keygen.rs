//! Standard key generators.

use std::cmp::Ordering;
use std::net::Ipv4Addr;

use super::math::parse_leading_i64;
use crate::record::{Record, RAW_IDX};
use crate::transform_registry::{KeyContext, TransformError};

/// The reader-assigned packet index.
pub fn pkt_default(ctx: &KeyContext, raw: &Record, _level: &str) -> Result<String, TransformError> {
    match raw.get(RAW_IDX) {
        Some(idx) => Ok(idx.to_string()),
        None => ctx.missing(RAW_IDX, format!("{}_invalid", ctx.file_index)),
    }
}

/// Bidirectional flow key `ip:port,ip:port`, larger port first.
pub fn flow_default(
    ctx: &KeyContext,
    raw: &Record,
    _level: &str,
) -> Result<String, TransformError> {
    let (sport, dport) = ports(ctx, raw)?;
    let Some((src, dst)) = addresses(raw) else {
        return Ok(format!("{}_IPv6", ctx.file_index));
    };

    let src_first = match parse_leading_i64(&sport).cmp(&parse_leading_i64(&dport)) {
        Ordering::Greater => true,
        Ordering::Less => false,
        Ordering::Equal => match (src.parse::<Ipv4Addr>(), dst.parse::<Ipv4Addr>()) {
            (Ok(s), Ok(d)) => s >= d,
            _ => return invalid_address(ctx, &src, &dst),
        },
    };

    Ok(if src_first {
        format!("{}:{},{}:{}", src, sport, dst, dport)
    } else {
        format!("{}:{},{}:{}", dst, dport, src, sport)
    })
}

/// Directional flow key `src:sport,dst:dport` as seen on the wire.
pub fn flow_directional(
    ctx: &KeyContext,
    raw: &Record,
    _level: &str,
) -> Result<String, TransformError> {
    let (sport, dport) = ports(ctx, raw)?;
    let Some((src, dst)) = addresses(raw) else {
        return Ok(format!("{}_IPv6", ctx.file_index));
    };
    Ok(format!("{}:{},{}:{}", src, sport, dst, dport))
}

/// Unordered IPv4 address pair, smaller address first.
pub fn flowset_default(
    ctx: &KeyContext,
    raw: &Record,
    _level: &str,
) -> Result<String, TransformError> {
    let Some((src, dst)) = addresses(raw) else {
        return Ok(format!("{}_IPv6", ctx.file_index));
    };
    match (src.parse::<Ipv4Addr>(), dst.parse::<Ipv4Addr>()) {
        (Ok(s), Ok(d)) if s >= d => Ok(format!("{},{}", dst, src)),
        (Ok(_), Ok(_)) => Ok(format!("{},{}", src, dst)),
        _ => invalid_address(ctx, &src, &dst),
    }
}

/// 802.11 frame key `idx_ra_ta`.
pub fn pkt_cbr(ctx: &KeyContext, raw: &Record, level: &str) -> Result<String, TransformError> {
    let idx = pkt_default(ctx, raw, level)?;
    let ra = required(ctx, raw, "wlan.ra")?;
    let ta = required(ctx, raw, "wlan.ta")?;
    Ok(format!("{}_{}_{}", idx, ra, ta))
}

/// Protocol column as reported by the dissector.
pub fn protocol_default(
    ctx: &KeyContext,
    raw: &Record,
    _level: &str,
) -> Result<String, TransformError> {
    required(ctx, raw, "_ws.col.protocol")
}

fn required(ctx: &KeyContext, raw: &Record, field: &str) -> Result<String, TransformError> {
    match raw.get(field) {
        Some(v) => Ok(v.to_string()),
        None => ctx.missing(field, ""),
    }
}

/// TCP ports, falling back to UDP ports, then to `0/0`.
fn ports(ctx: &KeyContext, raw: &Record) -> Result<(String, String), TransformError> {
    let tcp_src = raw.get_or_empty("tcp.srcport");
    let tcp_dst = raw.get_or_empty("tcp.dstport");
    if !tcp_src.is_empty() && !tcp_dst.is_empty() {
        return Ok((tcp_src.to_string(), tcp_dst.to_string()));
    }

    // The UDP columns must have been collected for non-TCP packets.
    let udp_src = match raw.get("udp.srcport") {
        Some(v) => v.to_string(),
        None => ctx.missing("udp.srcport", "0")?,
    };
    let udp_dst = match raw.get("udp.dstport") {
        Some(v) => v.to_string(),
        None => ctx.missing("udp.dstport", "0")?,
    };
    if udp_src.is_empty() || udp_dst.is_empty() {
        return Ok(("0".to_string(), "0".to_string()));
    }
    Ok((udp_src, udp_dst))
}

/// `ip.src`/`ip.dst` truncated at the first comma; `None` when both are empty.
fn addresses(raw: &Record) -> Option<(String, String)> {
    let src = first_address(raw.get_or_empty("ip.src"));
    let dst = first_address(raw.get_or_empty("ip.dst"));
    if src.is_empty() && dst.is_empty() {
        tracing::debug!("Packet {} has no IPv4 addresses", raw.get_or_empty(RAW_IDX));
        return None;
    }
    Some((src.to_string(), dst.to_string()))
}

// The dissector occasionally reports several comma-separated addresses.
fn first_address(value: &str) -> &str {
    value.split(',').next().unwrap_or("")
}

fn invalid_address(ctx: &KeyContext, src: &str, dst: &str) -> Result<String, TransformError> {
    if ctx.strict {
        return Err(TransformError::InvalidArgs(format!(
            "invalid IPv4 address pair '{}', '{}'",
            src, dst
        )));
    }
    tracing::debug!("Invalid IPv4 address pair '{}', '{}'", src, dst);
    Ok(format!("{}_invalid", ctx.file_index))
}
