//! Standard copy, fill, aggregation and direction transforms.

use regex::Regex;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::math::{join_general, parse_leading_f64, parse_leading_i64};
use super::{child_records, finest_descendants};
use crate::record::{key_field, Record};
use crate::runtime::context::DispatchContext;
use crate::transform_registry::{TransformArgs, TransformError, TransformFn};

/// Direction annotation written by `P_dir` and read by `P_saveDir`/`P_childsum_ll`.
pub const DIR_FIELD: &str = "__dir";

/// Value of `name` on the record itself, or on its raw record when unset there.
fn lookup(ctx: &DispatchContext, record: &Record, name: &str) -> String {
    match record.get(name) {
        Some(v) => v.to_string(),
        None => ctx
            .source_of(record)
            .map(|raw| raw.get_or_empty(name).to_string())
            .unwrap_or_default(),
    }
}

fn source_field<'a>(args: &TransformArgs<'a>) -> &'a str {
    if args.option.is_empty() {
        args.field
    } else {
        args.option
    }
}

/// Copy a raw field (option, default: the field id) into the record.
pub fn cpy(
    ctx: &DispatchContext,
    args: &TransformArgs<'_>,
    record: &mut Record,
) -> Result<(), TransformError> {
    let value = ctx
        .source_of(record)
        .map(|raw| raw.get_or_empty(source_field(args)).to_string())
        .unwrap_or_default();
    record.set(args.field, value);
    Ok(())
}

/// Fill the field from the raw field named by the option when it is empty.
pub fn fill1(
    ctx: &DispatchContext,
    args: &TransformArgs<'_>,
    record: &mut Record,
) -> Result<(), TransformError> {
    if !record.get_or_empty(args.field).is_empty() {
        return Ok(());
    }
    let value = ctx
        .source_of(record)
        .map(|raw| raw.get_or_empty(args.option).to_string())
        .unwrap_or_default();
    record.set(args.field, value);
    Ok(())
}

pub fn fill_opt(
    _ctx: &DispatchContext,
    args: &TransformArgs<'_>,
    record: &mut Record,
) -> Result<(), TransformError> {
    record.set(args.field, args.option);
    Ok(())
}

/// Store this record's key at the level named by the option.
pub fn save_key(
    _ctx: &DispatchContext,
    args: &TransformArgs<'_>,
    record: &mut Record,
) -> Result<(), TransformError> {
    let level = if args.option.is_empty() {
        args.level
    } else {
        args.option
    };
    let name = key_field(level);
    let key = record
        .get(&name)
        .ok_or_else(|| TransformError::MissingField(name.clone()))?
        .to_string();
    record.set(args.field, key);
    Ok(())
}

fn copy_level_key(record: &mut Record, field: &str, level: &str) {
    let key = record.get_or_empty(&key_field(level)).to_string();
    record.set(field, key);
}

/// `__flow_key` of this record; empty when the record has no flow link.
pub fn save_flow_key(
    _ctx: &DispatchContext,
    args: &TransformArgs<'_>,
    record: &mut Record,
) -> Result<(), TransformError> {
    copy_level_key(record, args.field, "flow");
    Ok(())
}

pub fn save_flowset_key(
    _ctx: &DispatchContext,
    args: &TransformArgs<'_>,
    record: &mut Record,
) -> Result<(), TransformError> {
    copy_level_key(record, args.field, "flowset");
    Ok(())
}

pub fn save_pkt_key(
    _ctx: &DispatchContext,
    args: &TransformArgs<'_>,
    record: &mut Record,
) -> Result<(), TransformError> {
    copy_level_key(record, args.field, "pkt");
    Ok(())
}

fn join_field(args: &TransformArgs<'_>, records: Vec<&Record>, skip_empty: bool) -> String {
    records
        .into_iter()
        .map(|r| r.get_or_empty(args.option))
        .filter(|v| !skip_empty || !v.is_empty())
        .collect::<Vec<_>>()
        .join(",")
}

/// Comma-join a field over the immediate children, keeping empty values.
pub fn childagg(
    ctx: &DispatchContext,
    args: &TransformArgs<'_>,
    record: &mut Record,
) -> Result<(), TransformError> {
    let value = join_field(args, child_records(ctx, args)?, false);
    record.set(args.field, value);
    Ok(())
}

/// Comma-join a field over the immediate children, skipping empty values.
pub fn skipchildagg(
    ctx: &DispatchContext,
    args: &TransformArgs<'_>,
    record: &mut Record,
) -> Result<(), TransformError> {
    let value = join_field(args, child_records(ctx, args)?, true);
    record.set(args.field, value);
    Ok(())
}

/// Comma-join a field over every finest-level descendant, keeping empty values.
pub fn pf_agg(
    ctx: &DispatchContext,
    args: &TransformArgs<'_>,
    record: &mut Record,
) -> Result<(), TransformError> {
    let value = join_field(args, finest_descendants(ctx, args)?, false);
    record.set(args.field, value);
    Ok(())
}

pub fn skip_pf_agg(
    ctx: &DispatchContext,
    args: &TransformArgs<'_>,
    record: &mut Record,
) -> Result<(), TransformError> {
    let value = join_field(args, finest_descendants(ctx, args)?, true);
    record.set(args.field, value);
    Ok(())
}

pub fn childcount(
    ctx: &DispatchContext,
    args: &TransformArgs<'_>,
    record: &mut Record,
) -> Result<(), TransformError> {
    let count = ctx.children(args.level, args.key)?.len();
    record.set(args.field, count.to_string());
    Ok(())
}

fn count_children_equal(
    ctx: &DispatchContext,
    args: &TransformArgs<'_>,
    expected: &str,
) -> Result<usize, TransformError> {
    Ok(child_records(ctx, args)?
        .into_iter()
        .filter(|c| c.get(args.option) == Some(expected))
        .count())
}

pub fn childcount_true(
    ctx: &DispatchContext,
    args: &TransformArgs<'_>,
    record: &mut Record,
) -> Result<(), TransformError> {
    let count = count_children_equal(ctx, args, "True")?;
    record.set(args.field, count.to_string());
    Ok(())
}

pub fn childcount_false(
    ctx: &DispatchContext,
    args: &TransformArgs<'_>,
    record: &mut Record,
) -> Result<(), TransformError> {
    let count = count_children_equal(ctx, args, "False")?;
    record.set(args.field, count.to_string());
    Ok(())
}

/// Copy a field from the first child.
pub fn firstcpy(
    ctx: &DispatchContext,
    args: &TransformArgs<'_>,
    record: &mut Record,
) -> Result<(), TransformError> {
    let value = child_records(ctx, args)?
        .first()
        .map(|c| c.get_or_empty(args.option).to_string())
        .unwrap_or_default();
    record.set(args.field, value);
    Ok(())
}

/// Number of finest-level records under this record.
pub fn pktcount(
    ctx: &DispatchContext,
    args: &TransformArgs<'_>,
    record: &mut Record,
) -> Result<(), TransformError> {
    let finest = ctx.chain().name(0).unwrap_or_default();
    let count = if finest == args.level {
        1
    } else {
        ctx.get_keys(args.key, args.level, finest)?.len()
    };
    record.set(args.field, count.to_string());
    Ok(())
}

fn differences(values: &[f64]) -> Vec<f64> {
    values.windows(2).map(|w| w[1] - w[0]).collect()
}

fn numeric_values(records: Vec<&Record>, field: &str) -> Result<Vec<f64>, TransformError> {
    records
        .into_iter()
        .map(|r| match r.get(field) {
            Some(v) if !v.is_empty() => Ok(parse_leading_f64(v)),
            _ => Err(TransformError::MissingField(field.to_string())),
        })
        .collect()
}

/// Inter-arrival times of the finest-level descendants' `option` field.
pub fn iat(
    ctx: &DispatchContext,
    args: &TransformArgs<'_>,
    record: &mut Record,
) -> Result<(), TransformError> {
    let times = numeric_values(finest_descendants(ctx, args)?, args.option)?;
    record.set(args.field, join_general(&differences(&times)));
    Ok(())
}

/// Gaps between the children's start times, led by `0`.
pub fn iat_cbseq(
    ctx: &DispatchContext,
    args: &TransformArgs<'_>,
    record: &mut Record,
) -> Result<(), TransformError> {
    let starts = numeric_values(child_records(ctx, args)?, args.option)?;
    let mut gaps = vec![0.0];
    gaps.extend(differences(&starts));
    record.set(args.field, join_general(&gaps));
    Ok(())
}

/// `+1` when the packet's source is the first endpoint of its flow key, `-1`
/// otherwise (including a source absent from the key), `0` when the source or
/// both destination ports are empty.
fn direction(raw: &Record, flow_key: &str, source: &str) -> &'static str {
    if source.is_empty() {
        return "0";
    }

    let first = flow_key.find(source);
    let last = flow_key.rfind(source);
    match (first, last) {
        (Some(f), Some(l)) if f != l => {
            // Both endpoints share the address; decide on the destination port.
            let udp = raw.get_or_empty("udp.dstport");
            let dport = if udp.is_empty() {
                raw.get_or_empty("tcp.dstport")
            } else {
                udp
            };
            if dport.is_empty() {
                "0"
            } else if flow_key.ends_with(&format!(":{}", dport)) {
                "+1"
            } else {
                "-1"
            }
        }
        (Some(0), _) => "+1",
        _ => "-1",
    }
}

fn flow_key_of(args: &TransformArgs<'_>, record: &Record) -> Result<String, TransformError> {
    let flow_level = if args.option.is_empty() {
        "flow"
    } else {
        args.option
    };
    let name = key_field(flow_level);
    record
        .get(&name)
        .map(|k| k.to_string())
        .ok_or(TransformError::MissingField(name))
}

/// Direction from the dissector's `_ws.col.def_src` column (first address
/// when it lists several), relative to the key of the flow level named by
/// the option (default `flow`).
pub fn dir(
    ctx: &DispatchContext,
    args: &TransformArgs<'_>,
    record: &mut Record,
) -> Result<(), TransformError> {
    let flow_key = flow_key_of(args, record)?;
    let dir = match ctx.source_of(record) {
        Some(raw) => {
            let source = raw.get_or_empty("_ws.col.def_src");
            let source = source.split(',').next().unwrap_or("");
            direction(raw, &flow_key, source)
        }
        None => "0",
    };
    record.set(DIR_FIELD, dir);
    Ok(())
}

/// Direction from `ip.src`; IPv6 flow keys are undecidable.
pub fn dir_ipv4(
    ctx: &DispatchContext,
    args: &TransformArgs<'_>,
    record: &mut Record,
) -> Result<(), TransformError> {
    let flow_key = flow_key_of(args, record)?;
    let dir = match ctx.source_of(record) {
        Some(_) if flow_key.ends_with("_IPv6") => "0",
        Some(raw) => direction(raw, &flow_key, raw.get_or_empty("ip.src")),
        None => "0",
    };
    record.set(DIR_FIELD, dir);
    Ok(())
}

pub fn save_dir(
    _ctx: &DispatchContext,
    args: &TransformArgs<'_>,
    record: &mut Record,
) -> Result<(), TransformError> {
    let dir = record.get_or_empty(DIR_FIELD).to_string();
    record.set(args.field, dir);
    Ok(())
}

fn parse_index(option: &str, part: &str, transform: &str) -> Result<i64, TransformError> {
    part.trim().parse().map_err(|_| {
        TransformError::InvalidArgs(format!(
            "{}: option '{}' has a non-numeric index '{}'",
            transform, option, part
        ))
    })
}

/// Bytes `start..=end` of a field, clipped to its length.
///
/// The option has the form `source_field,start,end`; the source is read like
/// `P_regex` reads it. An empty source or an empty range gives `""`.
pub fn getsubstr(
    ctx: &DispatchContext,
    args: &TransformArgs<'_>,
    record: &mut Record,
) -> Result<(), TransformError> {
    let mut parts = args.option.splitn(3, ',');
    let (Some(source), Some(start), Some(end)) = (parts.next(), parts.next(), parts.next()) else {
        return Err(TransformError::InvalidArgs(format!(
            "P_getsubstr: option '{}' must have the form source_field,start,end",
            args.option
        )));
    };
    let start = parse_index(args.option, start, "P_getsubstr")?.max(0);
    let end = parse_index(args.option, end, "P_getsubstr")?;

    let value = lookup(ctx, record, source);
    let bytes = value.as_bytes();
    let substr = if end < start || start as usize >= bytes.len() {
        String::new()
    } else {
        let stop = (end as usize).saturating_add(1).min(bytes.len());
        String::from_utf8_lossy(&bytes[start as usize..stop]).into_owned()
    };
    record.set(args.field, substr);
    Ok(())
}

/// Item `n` of a comma-separated field, option `source_field,n`; `""` when
/// the field has fewer items.
pub fn getsubstr_by_comma(
    ctx: &DispatchContext,
    args: &TransformArgs<'_>,
    record: &mut Record,
) -> Result<(), TransformError> {
    let (source, n) = args.option.split_once(',').ok_or_else(|| {
        TransformError::InvalidArgs(format!(
            "P_getsubstr_by_comma: option '{}' must have the form source_field,n",
            args.option
        ))
    })?;
    let n = parse_index(args.option, n, "P_getsubstr_by_comma")?;

    let value = lookup(ctx, record, source);
    let item = match usize::try_from(n) {
        Ok(n) if !value.is_empty() => value.split(',').nth(n).unwrap_or_default().to_string(),
        _ => String::new(),
    };
    record.set(args.field, item);
    Ok(())
}

/// Leading unsigned integer, wrapping negatives and saturating on overflow.
fn parse_unsigned(value: &str) -> u32 {
    let v = parse_leading_i64(value);
    u32::try_from(v).unwrap_or(if v < 0 { v as u32 } else { u32::MAX })
}

/// Reinterpret this field's hexadecimal value (optional `0x`) as decimal.
pub fn hex2dec(
    _ctx: &DispatchContext,
    args: &TransformArgs<'_>,
    record: &mut Record,
) -> Result<(), TransformError> {
    let value = record.get_or_empty(args.field).trim();
    let digits = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .unwrap_or(value);
    let end = digits
        .find(|c: char| !c.is_ascii_hexdigit())
        .unwrap_or(digits.len());
    let parsed = match &digits[..end] {
        "" => 0,
        hex => u32::from_str_radix(hex, 16).unwrap_or(u32::MAX),
    };
    record.set(args.field, parsed.to_string());
    Ok(())
}

/// Add the integer option to this field's unsigned value.
pub fn plus(
    _ctx: &DispatchContext,
    args: &TransformArgs<'_>,
    record: &mut Record,
) -> Result<(), TransformError> {
    let delta: i32 = args.option.trim().parse().map_err(|_| {
        TransformError::InvalidArgs(format!("P_plus: option '{}' is not an integer", args.option))
    })?;
    let value = parse_unsigned(record.get_or_empty(args.field));
    record.set(args.field, value.wrapping_add_signed(delta).to_string());
    Ok(())
}

/// Number of compressed beamforming angles for the VHT MIMO control's
/// `Nr x Nc` dimensions; the field stays unset for other dimensions.
pub fn cal_no_angles(
    ctx: &DispatchContext,
    args: &TransformArgs<'_>,
    record: &mut Record,
) -> Result<(), TransformError> {
    let nr = lookup(ctx, record, "wlan.vht.mimo_control.nr");
    let nc = lookup(ctx, record, "wlan.vht.mimo_control.nc");
    let angles = match (nr.trim(), nc.trim()) {
        ("2", "1") | ("2", "2") => "2",
        ("3", "1") => "4",
        ("3", "2") | ("3", "3") | ("4", "1") => "6",
        ("4", "2") => "10",
        ("4", "3") | ("4", "4") => "12",
        _ => return Ok(()),
    };
    record.set(args.field, angles);
    Ok(())
}

/// Turn every n-th comma of this field into `;`, n read from the field
/// named by the option (typically filled by `P_cal_no_angles`).
pub fn comma2semicol(
    ctx: &DispatchContext,
    args: &TransformArgs<'_>,
    record: &mut Record,
) -> Result<(), TransformError> {
    let every = parse_unsigned(&lookup(ctx, record, args.option)) as usize;
    let mut seen = 0;
    let grouped: String = record
        .get_or_empty(args.field)
        .chars()
        .map(|c| {
            if c != ',' {
                return c;
            }
            seen += 1;
            if seen == every {
                seen = 0;
                ';'
            } else {
                c
            }
        })
        .collect();
    record.set(args.field, grouped);
    Ok(())
}

pub fn debug(
    ctx: &DispatchContext,
    args: &TransformArgs<'_>,
    record: &mut Record,
) -> Result<(), TransformError> {
    tracing::debug!(
        "P_debug {}[{}].{} option={:?} record={} raw={}",
        args.level,
        args.key,
        args.field,
        args.option,
        record,
        ctx.source_of(record)
            .map(|r| r.to_string())
            .unwrap_or_default()
    );
    Ok(())
}

/// First capture group of a pattern applied to a field.
///
/// The option has the form `source_field/pattern/`. The source is read from
/// the record itself when set there, otherwise from its raw record. Compiled
/// patterns are cached per option string.
#[derive(Default)]
pub struct RegexExtract {
    cache: Mutex<HashMap<String, Arc<Regex>>>,
}

impl RegexExtract {
    fn pattern(&self, option: &str) -> Result<(String, Arc<Regex>), TransformError> {
        let (source, rest) = option.split_once('/').ok_or_else(|| {
            TransformError::InvalidArgs(format!(
                "option '{}' must have the form source_field/pattern/",
                option
            ))
        })?;
        let pattern = rest.strip_suffix('/').unwrap_or(rest);

        let mut cache = self
            .cache
            .lock()
            .map_err(|_| TransformError::ExecutionError("regex cache poisoned".to_string()))?;
        if let Some(regex) = cache.get(option) {
            return Ok((source.to_string(), Arc::clone(regex)));
        }
        let regex = Arc::new(Regex::new(pattern).map_err(|e| {
            TransformError::InvalidArgs(format!("invalid pattern '{}': {}", pattern, e))
        })?);
        cache.insert(option.to_string(), Arc::clone(&regex));
        Ok((source.to_string(), regex))
    }
}

impl TransformFn for RegexExtract {
    fn apply(
        &self,
        ctx: &DispatchContext,
        args: &TransformArgs<'_>,
        record: &mut Record,
    ) -> Result<(), TransformError> {
        let (source, regex) = self.pattern(args.option)?;
        let input = lookup(ctx, record, &source);
        let value = regex
            .captures(&input)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
            .unwrap_or_default();
        record.set(args.field, value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::context::GranularityChain;

    fn raw(fields: &[(&str, &str)]) -> Record {
        fields
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn pkt_context(fields: &[(&str, &str)]) -> DispatchContext {
        let chain = Arc::new(GranularityChain::parse("pkt,flow").unwrap());
        let mut ctx = DispatchContext::new(chain);
        ctx.push_raw(raw(fields));
        ctx
    }

    fn apply(
        f: fn(&DispatchContext, &TransformArgs<'_>, &mut Record) -> Result<(), TransformError>,
        ctx: &DispatchContext,
        record: &mut Record,
        field: &str,
        option: &str,
    ) -> Result<(), TransformError> {
        let args = TransformArgs {
            option,
            level: "pkt",
            key: "0",
            field,
        };
        f(ctx, &args, record)
    }

    #[test]
    fn test_direction_from_flow_key() {
        let key = "10.0.0.1:51000,10.0.0.2:443";
        let pkt = raw(&[]);
        assert_eq!(direction(&pkt, key, "10.0.0.1"), "+1");
        assert_eq!(direction(&pkt, key, "10.0.0.2"), "-1");
        assert_eq!(direction(&pkt, key, ""), "0");
        // A source missing from the key counts as the second endpoint.
        assert_eq!(direction(&pkt, key, "192.168.1.9"), "-1");
    }

    #[test]
    fn test_direction_within_one_host() {
        let key = "10.0.0.1:51000,10.0.0.1:443";
        let to_server = raw(&[("tcp.dstport", "443"), ("udp.dstport", "")]);
        let to_client = raw(&[("tcp.dstport", "51000"), ("udp.dstport", "")]);
        assert_eq!(direction(&to_server, key, "10.0.0.1"), "+1");
        assert_eq!(direction(&to_client, key, "10.0.0.1"), "-1");
        assert_eq!(direction(&raw(&[]), key, "10.0.0.1"), "0");
    }

    #[test]
    fn test_ipv6_keys_only_short_circuit_dir_ipv4() {
        let ctx = pkt_context(&[("ip.src", "fe80::1"), ("_ws.col.def_src", "fe80::1")]);
        let mut record = Record::with_in_idx(0);
        record.set("__flow_key", "3_IPv6");

        apply(dir_ipv4, &ctx, &mut record, "d", "").unwrap();
        assert_eq!(record.get(DIR_FIELD), Some("0"));

        apply(dir, &ctx, &mut record, "d", "").unwrap();
        assert_eq!(record.get(DIR_FIELD), Some("-1"));
    }

    #[test]
    fn test_dir_uses_first_listed_source() {
        let ctx = pkt_context(&[("_ws.col.def_src", "10.0.0.2,10.0.0.9")]);
        let mut record = Record::with_in_idx(0);
        record.set("__flow_key", "10.0.0.2:443,10.0.0.1:51000");
        apply(dir, &ctx, &mut record, "d", "").unwrap();
        assert_eq!(record.get(DIR_FIELD), Some("+1"));

        record.remove("__flow_key");
        assert!(matches!(
            apply(dir, &ctx, &mut record, "d", ""),
            Err(TransformError::MissingField(_))
        ));
    }

    #[test]
    fn test_level_key_aliases() {
        let ctx = pkt_context(&[]);
        let mut record = Record::with_in_idx(0);
        record.set("__pkt_key", "7");
        record.set("__flow_key", "A");

        apply(save_pkt_key, &ctx, &mut record, "pkt", "").unwrap();
        apply(save_flow_key, &ctx, &mut record, "flow", "").unwrap();
        apply(save_flowset_key, &ctx, &mut record, "flowset", "").unwrap();
        assert_eq!(record.get("pkt"), Some("7"));
        assert_eq!(record.get("flow"), Some("A"));
        assert_eq!(record.get("flowset"), Some(""));
    }

    #[test]
    fn test_getsubstr_clips_to_value() {
        let ctx = pkt_context(&[("tls.supported_group", "0x001d,0x0017,0x0018")]);
        let mut record = Record::with_in_idx(0);
        let opt = |range: &str| format!("tls.supported_group,{}", range);

        apply(getsubstr, &ctx, &mut record, "g", &opt("0,5")).unwrap();
        assert_eq!(record.get("g"), Some("0x001d"));
        apply(getsubstr, &ctx, &mut record, "g", &opt("14,99")).unwrap();
        assert_eq!(record.get("g"), Some("0x0018"));
        apply(getsubstr, &ctx, &mut record, "g", &opt("-3,1")).unwrap();
        assert_eq!(record.get("g"), Some("0x"));
        apply(getsubstr, &ctx, &mut record, "g", &opt("5,2")).unwrap();
        assert_eq!(record.get("g"), Some(""));
        apply(getsubstr, &ctx, &mut record, "g", &opt("40,50")).unwrap();
        assert_eq!(record.get("g"), Some(""));

        // The record's own value wins over the raw one.
        record.set("tls.supported_group", "abc");
        apply(getsubstr, &ctx, &mut record, "g", &opt("1,1")).unwrap();
        assert_eq!(record.get("g"), Some("b"));

        assert!(matches!(
            apply(getsubstr, &ctx, &mut record, "g", "tls.supported_group,1"),
            Err(TransformError::InvalidArgs(_))
        ));
        assert!(matches!(
            apply(getsubstr, &ctx, &mut record, "g", &opt("a,2")),
            Err(TransformError::InvalidArgs(_))
        ));
    }

    #[test]
    fn test_getsubstr_by_comma() {
        let ctx = pkt_context(&[("tls.handshake.type", "2,11,12,13,14")]);
        let mut record = Record::with_in_idx(0);

        apply(getsubstr_by_comma, &ctx, &mut record, "t", "tls.handshake.type,0").unwrap();
        assert_eq!(record.get("t"), Some("2"));
        apply(getsubstr_by_comma, &ctx, &mut record, "t", "tls.handshake.type,1").unwrap();
        assert_eq!(record.get("t"), Some("11"));
        apply(getsubstr_by_comma, &ctx, &mut record, "t", "tls.handshake.type,5").unwrap();
        assert_eq!(record.get("t"), Some(""));
        apply(getsubstr_by_comma, &ctx, &mut record, "t", "tls.handshake.type,-1").unwrap();
        assert_eq!(record.get("t"), Some(""));
        apply(getsubstr_by_comma, &ctx, &mut record, "t", "missing,0").unwrap();
        assert_eq!(record.get("t"), Some(""));
        assert!(apply(getsubstr_by_comma, &ctx, &mut record, "t", "tls.handshake.type").is_err());
    }

    #[test]
    fn test_hex2dec() {
        let ctx = pkt_context(&[]);
        let mut record = Record::with_in_idx(0);
        for (input, expected) in [("0x1a", "26"), ("ff", "255"), ("", "0"), ("zz", "0")] {
            record.set("v", input);
            apply(hex2dec, &ctx, &mut record, "v", "").unwrap();
            assert_eq!(record.get("v"), Some(expected), "input {:?}", input);
        }
    }

    #[test]
    fn test_plus() {
        let ctx = pkt_context(&[]);
        let mut record = Record::with_in_idx(0);
        record.set("n", "40");
        apply(plus, &ctx, &mut record, "n", "2").unwrap();
        assert_eq!(record.get("n"), Some("42"));
        apply(plus, &ctx, &mut record, "n", "-2").unwrap();
        assert_eq!(record.get("n"), Some("40"));

        record.set("n", "0");
        apply(plus, &ctx, &mut record, "n", "-1").unwrap();
        assert_eq!(record.get("n"), Some("4294967295"));

        assert!(matches!(
            apply(plus, &ctx, &mut record, "n", "x"),
            Err(TransformError::InvalidArgs(_))
        ));
    }

    #[test]
    fn test_cal_no_angles() {
        let cases = [
            ("2", "1", Some("2")),
            ("3", "1", Some("4")),
            ("4", "1", Some("6")),
            ("4", "2", Some("10")),
            ("4", "4", Some("12")),
            ("1", "1", None),
        ];
        for (nr, nc, expected) in cases {
            let ctx = pkt_context(&[
                ("wlan.vht.mimo_control.nr", nr),
                ("wlan.vht.mimo_control.nc", nc),
            ]);
            let mut record = Record::with_in_idx(0);
            apply(cal_no_angles, &ctx, &mut record, "angles", "").unwrap();
            assert_eq!(record.get("angles"), expected, "{}x{}", nr, nc);
        }
    }

    #[test]
    fn test_comma2semicol_groups_values() {
        let ctx = pkt_context(&[]);
        let mut record = Record::with_in_idx(0);
        record.set("angles", "2");
        record.set("bfm", "1,2,3,4,5,6");
        apply(comma2semicol, &ctx, &mut record, "bfm", "angles").unwrap();
        assert_eq!(record.get("bfm"), Some("1,2;3,4;5,6"));

        record.set("angles", "0");
        apply(comma2semicol, &ctx, &mut record, "bfm", "angles").unwrap();
        assert_eq!(record.get("bfm"), Some("1,2;3,4;5,6"));
    }

    #[test]
    fn test_differences() {
        assert_eq!(differences(&[1.0, 1.5, 3.0]), vec![0.5, 1.5]);
        assert!(differences(&[1.0]).is_empty());
    }

    #[test]
    fn test_regex_option_parsing() {
        let extract = RegexExtract::default();
        let (source, regex) = extract.pattern("http.host/^www\\.(.*)$/").unwrap();
        assert_eq!(source, "http.host");
        assert!(regex.is_match("www.example.com"));
        assert!(matches!(
            extract.pattern("no-separator"),
            Err(TransformError::InvalidArgs(_))
        ));
        assert!(matches!(
            extract.pattern("f/(unclosed/"),
            Err(TransformError::InvalidArgs(_))
        ));
    }
}
