//! Numeric transforms and the number formatting they share.
//!
//! Values are parsed leniently: a numeric prefix is used and anything
//! unparsable counts as zero. Aggregates are written with six decimals.

use super::{child_records, split_direction};
use crate::record::Record;
use crate::runtime::context::DispatchContext;
use crate::transform_registry::{TransformArgs, TransformError};

/// Leading integer of `value` (`"12.5"` → 12, `"x"` → 0).
pub fn parse_leading_i64(value: &str) -> i64 {
    let value = value.trim_start();
    let end = value
        .char_indices()
        .take_while(|(i, c)| c.is_ascii_digit() || (*i == 0 && (*c == '-' || *c == '+')))
        .map(|(i, c)| i + c.len_utf8())
        .last()
        .unwrap_or(0);
    value[..end].parse().unwrap_or(0)
}

/// Longest numeric prefix of `value` as a float (`"1.5ms"` → 1.5, `"x"` → 0).
pub fn parse_leading_f64(value: &str) -> f64 {
    let value = value.trim();
    if let Ok(v) = value.parse() {
        return v;
    }
    let mut end = value.len();
    while end > 0 {
        end -= 1;
        if !value.is_char_boundary(end) {
            continue;
        }
        if let Ok(v) = value[..end].parse() {
            return v;
        }
    }
    0.0
}

/// Parse a comma-separated list of floats, skipping items that do not parse.
pub fn parse_list(value: &str) -> Vec<f64> {
    if value.is_empty() {
        return Vec::new();
    }
    value
        .split(',')
        .filter_map(|item| match item.trim().parse::<f64>() {
            Ok(v) => Some(v),
            Err(_) => {
                tracing::debug!("Skipping non-numeric list item '{}'", item);
                None
            }
        })
        .collect()
}

/// Fixed notation with six decimals.
pub fn format_fixed(value: f64) -> String {
    format!("{:.6}", value)
}

/// Shortest notation after rounding to six significant digits.
pub fn format_general(value: f64) -> String {
    if value == 0.0 || !value.is_finite() {
        return format!("{}", value);
    }
    // Scientific notation rounds without scaling, so subnormals stay finite.
    let rounded = format!("{:.5e}", value).parse::<f64>().unwrap_or(value);
    format!("{}", rounded)
}

pub fn join_general(values: &[f64]) -> String {
    values
        .iter()
        .map(|v| format_general(*v))
        .collect::<Vec<_>>()
        .join(",")
}

/// Max of the comma-separated list held in this record's `option` field.
pub fn max_d(
    _ctx: &DispatchContext,
    args: &TransformArgs<'_>,
    record: &mut Record,
) -> Result<(), TransformError> {
    let values = parse_list(record.get_or_empty(args.option));
    let result = values.iter().copied().fold(None, |acc: Option<f64>, v| {
        Some(acc.map_or(v, |a| a.max(v)))
    });
    record.set(args.field, result.map(format_fixed).unwrap_or_default());
    Ok(())
}

/// Min of the comma-separated list held in this record's `option` field.
pub fn min_d(
    _ctx: &DispatchContext,
    args: &TransformArgs<'_>,
    record: &mut Record,
) -> Result<(), TransformError> {
    let values = parse_list(record.get_or_empty(args.option));
    let result = values.iter().copied().fold(None, |acc: Option<f64>, v| {
        Some(acc.map_or(v, |a| a.min(v)))
    });
    record.set(args.field, result.map(format_fixed).unwrap_or_default());
    Ok(())
}

/// Values of `field` over the children that have it set.
fn child_values<'a>(
    ctx: &'a DispatchContext,
    args: &TransformArgs<'_>,
    field: &str,
) -> Result<Vec<&'a str>, TransformError> {
    Ok(child_records(ctx, args)?
        .into_iter()
        .filter_map(|child| child.get(field))
        .collect())
}

/// Integer sum over the children; a trailing `+`/`-` on the option only
/// counts children whose `__dir` has that sign.
pub fn childsum_ll(
    ctx: &DispatchContext,
    args: &TransformArgs<'_>,
    record: &mut Record,
) -> Result<(), TransformError> {
    let (field, direction) = split_direction(args.option)?;
    let mut sum: i64 = 0;
    for child in child_records(ctx, args)? {
        let Some(value) = child.get(field) else {
            continue;
        };
        let include = match direction {
            Some(true) => parse_leading_i64(child.get_or_empty("__dir")) >= 0,
            Some(false) => parse_leading_i64(child.get_or_empty("__dir")) <= 0,
            None => true,
        };
        if include {
            sum = sum.saturating_add(parse_leading_i64(value));
        }
    }
    record.set(args.field, sum.to_string());
    Ok(())
}

pub fn childsum_d(
    ctx: &DispatchContext,
    args: &TransformArgs<'_>,
    record: &mut Record,
) -> Result<(), TransformError> {
    let sum: f64 = child_values(ctx, args, args.option)?
        .into_iter()
        .map(parse_leading_f64)
        .sum();
    record.set(args.field, format_fixed(sum));
    Ok(())
}

pub fn childmean(
    ctx: &DispatchContext,
    args: &TransformArgs<'_>,
    record: &mut Record,
) -> Result<(), TransformError> {
    let values: Vec<f64> = child_values(ctx, args, args.option)?
        .into_iter()
        .map(parse_leading_f64)
        .collect();
    let mean = if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    };
    record.set(args.field, format_fixed(mean));
    Ok(())
}

/// Sample standard deviation over the children; `-1` with fewer than two values.
pub fn childstdev(
    ctx: &DispatchContext,
    args: &TransformArgs<'_>,
    record: &mut Record,
) -> Result<(), TransformError> {
    let values: Vec<f64> = child_values(ctx, args, args.option)?
        .into_iter()
        .map(parse_leading_f64)
        .collect();
    if values.len() <= 1 {
        record.set(args.field, "-1");
        return Ok(());
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / (n - 1.0);
    record.set(args.field, format_fixed(variance.sqrt()));
    Ok(())
}

/// Fold the child values over `seed`; with no children the seed itself is
/// written, as `f64::MIN`/`f64::MAX` in fixed notation.
fn child_extreme(
    ctx: &DispatchContext,
    args: &TransformArgs<'_>,
    seed: f64,
    pick: fn(f64, f64) -> f64,
    keep: fn(f64) -> bool,
) -> Result<f64, TransformError> {
    Ok(child_values(ctx, args, args.option)?
        .into_iter()
        .map(parse_leading_f64)
        .filter(|v| keep(*v))
        .fold(seed, pick))
}

pub fn childmax_d(
    ctx: &DispatchContext,
    args: &TransformArgs<'_>,
    record: &mut Record,
) -> Result<(), TransformError> {
    let result = child_extreme(ctx, args, f64::MIN, f64::max, |_| true)?;
    record.set(args.field, format_fixed(result));
    Ok(())
}

pub fn childmin_d(
    ctx: &DispatchContext,
    args: &TransformArgs<'_>,
    record: &mut Record,
) -> Result<(), TransformError> {
    let result = child_extreme(ctx, args, f64::MAX, f64::min, |_| true)?;
    record.set(args.field, format_fixed(result));
    Ok(())
}

/// Smallest strictly positive child value.
pub fn childnzmin_d(
    ctx: &DispatchContext,
    args: &TransformArgs<'_>,
    record: &mut Record,
) -> Result<(), TransformError> {
    let result = child_extreme(ctx, args, f64::MAX, f64::min, |v| v > 0.0)?;
    record.set(args.field, format_fixed(result));
    Ok(())
}

/// Spread (max - min) of the child values.
pub fn childmaxdiff_d(
    ctx: &DispatchContext,
    args: &TransformArgs<'_>,
    record: &mut Record,
) -> Result<(), TransformError> {
    let max = child_extreme(ctx, args, f64::MIN, f64::max, |_| true)?;
    let min = child_extreme(ctx, args, f64::MAX, f64::min, |_| true)?;
    record.set(args.field, format_fixed(max - min));
    Ok(())
}

pub fn childmax_ll(
    ctx: &DispatchContext,
    args: &TransformArgs<'_>,
    record: &mut Record,
) -> Result<(), TransformError> {
    let result = child_values(ctx, args, args.option)?
        .into_iter()
        .map(parse_leading_i64)
        .fold(i64::MIN, i64::max);
    record.set(args.field, result.to_string());
    Ok(())
}

pub fn childmin_ll(
    ctx: &DispatchContext,
    args: &TransformArgs<'_>,
    record: &mut Record,
) -> Result<(), TransformError> {
    let result = child_values(ctx, args, args.option)?
        .into_iter()
        .map(parse_leading_i64)
        .fold(i64::MAX, i64::min);
    record.set(args.field, result.to_string());
    Ok(())
}

/// `end - start` for an option of the form `start_field:end_field`.
pub fn diff_d(
    _ctx: &DispatchContext,
    args: &TransformArgs<'_>,
    record: &mut Record,
) -> Result<(), TransformError> {
    let (start_field, end_field) = args.option.split_once(':').ok_or_else(|| {
        TransformError::InvalidArgs(format!(
            "option '{}' must have the form start_field:end_field",
            args.option
        ))
    })?;

    let parse = |name: &str| -> Result<f64, TransformError> {
        let value = record
            .get(name)
            .ok_or_else(|| TransformError::MissingField(name.to_string()))?;
        value.trim().parse::<f64>().map_err(|_| {
            TransformError::ExecutionError(format!(
                "field '{}' value '{}' is not a number",
                name, value
            ))
        })
    };
    let start = parse(start_field)?;
    let end = parse(end_field)?;

    record.set(args.field, format_fixed(end - start));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::context::GranularityChain;
    use std::sync::Arc;

    /// Flow "A" with one packet per value (field `v`), and an empty flow "B".
    fn flows(values: &[&str]) -> DispatchContext {
        let chain = Arc::new(GranularityChain::parse("pkt,flow").unwrap());
        let mut ctx = DispatchContext::new(chain);
        for (i, value) in values.iter().enumerate() {
            let mut pkt = Record::with_in_idx(i);
            pkt.set("v", *value);
            ctx.level_store_at_mut(0)
                .unwrap()
                .insert_new(i.to_string(), pkt);
            ctx.level_store_at_mut(1)
                .unwrap()
                .push_child("A", i.to_string());
        }
        for key in ["A", "B"] {
            ctx.level_store_at_mut(1)
                .unwrap()
                .insert_new(key.to_string(), Record::with_in_idx(0));
        }
        ctx
    }

    fn aggregate(
        f: fn(&DispatchContext, &TransformArgs<'_>, &mut Record) -> Result<(), TransformError>,
        ctx: &DispatchContext,
        key: &str,
    ) -> String {
        let args = TransformArgs {
            option: "v",
            level: "flow",
            key,
            field: "out",
        };
        let mut record = Record::new();
        f(ctx, &args, &mut record).unwrap();
        record.get_or_empty("out").to_string()
    }

    #[test]
    fn test_child_extremes() {
        let ctx = flows(&["3", "-1.5", "0", "7"]);
        assert_eq!(aggregate(childmax_d, &ctx, "A"), "7.000000");
        assert_eq!(aggregate(childmin_d, &ctx, "A"), "-1.500000");
        assert_eq!(aggregate(childnzmin_d, &ctx, "A"), "3.000000");
        assert_eq!(aggregate(childmaxdiff_d, &ctx, "A"), "8.500000");
        assert_eq!(aggregate(childmax_ll, &ctx, "A"), "7");
        assert_eq!(aggregate(childmin_ll, &ctx, "A"), "-1");
    }

    #[test]
    fn test_child_extremes_without_children_keep_their_seed() {
        let ctx = flows(&["1"]);
        assert_eq!(aggregate(childmax_d, &ctx, "B"), format!("{:.6}", f64::MIN));
        assert_eq!(aggregate(childmin_d, &ctx, "B"), format!("{:.6}", f64::MAX));
        assert_eq!(aggregate(childnzmin_d, &ctx, "B"), format!("{:.6}", f64::MAX));
        assert_eq!(aggregate(childmaxdiff_d, &ctx, "B"), "-inf");
        assert_eq!(aggregate(childmax_ll, &ctx, "B"), i64::MIN.to_string());
        assert_eq!(aggregate(childmin_ll, &ctx, "B"), i64::MAX.to_string());
        assert!(aggregate(childmax_d, &ctx, "B").starts_with("-17976931348623157"));
    }

    #[test]
    fn test_childsum_ll_saturates() {
        let big = i64::MAX.to_string();
        let ctx = flows(&[big.as_str(), big.as_str(), "5"]);
        assert_eq!(aggregate(childsum_ll, &ctx, "A"), big);
        assert_eq!(aggregate(childsum_ll, &ctx, "B"), "0");
    }

    #[test]
    fn test_lenient_parsing() {
        assert_eq!(parse_leading_i64("12.5"), 12);
        assert_eq!(parse_leading_i64("-7"), -7);
        assert_eq!(parse_leading_i64("+1"), 1);
        assert_eq!(parse_leading_i64("abc"), 0);
        assert_eq!(parse_leading_i64(""), 0);
        assert_eq!(parse_leading_f64("1.5ms"), 1.5);
        assert_eq!(parse_leading_f64(" 2 "), 2.0);
        assert_eq!(parse_leading_f64("x"), 0.0);
    }

    #[test]
    fn test_parse_list_skips_garbage() {
        assert_eq!(parse_list("1,x, 2.5"), vec![1.0, 2.5]);
        assert!(parse_list("").is_empty());
    }

    #[test]
    fn test_number_formatting() {
        assert_eq!(format_fixed(0.5), "0.500000");
        assert_eq!(format_general(0.1 + 0.2), "0.3");
        assert_eq!(format_general(1.0), "1");
        assert_eq!(format_general(0.0), "0");
        assert_eq!(format_general(-0.25), "-0.25");
        assert_eq!(join_general(&[0.0, 0.5, 1.25]), "0,0.5,1.25");
        assert_eq!(format_general(123456789.0), "123457000");
        let subnormal = format_general(f64::MIN_POSITIVE / 4.0);
        assert!(subnormal.parse::<f64>().unwrap() > 0.0, "{}", subnormal);
    }
}
