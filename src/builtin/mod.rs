//! Built-in plugin module.
//!
//! Registered ahead of any native module, so its names cannot be overridden.

pub mod keygen;
pub mod math;
pub mod transforms;

use std::sync::Arc;

use crate::record::Record;
use crate::runtime::context::DispatchContext;
use crate::transform_registry::{PluginRegistrar, TransformArgs, TransformError};

/// Register every built-in key generator and transform.
pub fn register(registrar: &mut dyn PluginRegistrar) {
    registrar.register_key_gen("genKey_pkt_default", Arc::new(keygen::pkt_default));
    registrar.register_key_gen("genKey_flow_default", Arc::new(keygen::flow_default));
    registrar.register_key_gen("genKey_flow_directional", Arc::new(keygen::flow_directional));
    registrar.register_key_gen("genKey_flowset_default", Arc::new(keygen::flowset_default));
    registrar.register_key_gen("genKey_pkt_cbr", Arc::new(keygen::pkt_cbr));
    registrar.register_key_gen("genKey_protocol_default", Arc::new(keygen::protocol_default));

    registrar.register_transform("P_cpy", Arc::new(transforms::cpy));
    // The context is shared read-only, so a move is a copy.
    registrar.register_transform("P_move", Arc::new(transforms::cpy));
    registrar.register_transform("P_fill1", Arc::new(transforms::fill1));
    registrar.register_transform("P_fillOpt", Arc::new(transforms::fill_opt));
    registrar.register_transform("P_saveKey", Arc::new(transforms::save_key));
    registrar.register_transform("P_saveFlowKey", Arc::new(transforms::save_flow_key));
    registrar.register_transform("P_saveFlowsetKey", Arc::new(transforms::save_flowset_key));
    registrar.register_transform("P_savePktKey", Arc::new(transforms::save_pkt_key));
    registrar.register_transform("P_childagg", Arc::new(transforms::childagg));
    registrar.register_transform("P_skipchildagg", Arc::new(transforms::skipchildagg));
    registrar.register_transform("P_pf_agg", Arc::new(transforms::pf_agg));
    registrar.register_transform("P_skip_pf_agg", Arc::new(transforms::skip_pf_agg));
    registrar.register_transform("P_childcount", Arc::new(transforms::childcount));
    registrar.register_transform("P_childcountTrue", Arc::new(transforms::childcount_true));
    registrar.register_transform("P_childcountFalse", Arc::new(transforms::childcount_false));
    registrar.register_transform("P_firstcpy", Arc::new(transforms::firstcpy));
    registrar.register_transform("P_pktcount", Arc::new(transforms::pktcount));
    registrar.register_transform("P_iat", Arc::new(transforms::iat));
    registrar.register_transform("P_iat_cbseq", Arc::new(transforms::iat_cbseq));
    registrar.register_transform("P_dir", Arc::new(transforms::dir));
    registrar.register_transform("P_dir_ipv4", Arc::new(transforms::dir_ipv4));
    registrar.register_transform("P_saveDir", Arc::new(transforms::save_dir));
    registrar.register_transform("P_regex", Arc::new(transforms::RegexExtract::default()));
    registrar.register_transform("P_debug", Arc::new(transforms::debug));
    registrar.register_transform("P_getsubstr", Arc::new(transforms::getsubstr));
    registrar.register_transform("P_getsubstr_by_comma", Arc::new(transforms::getsubstr_by_comma));

    // 802.11 beamforming report preprocessing, paired with genKey_pkt_cbr.
    registrar.register_transform("P_hex2dec", Arc::new(transforms::hex2dec));
    registrar.register_transform("P_plus", Arc::new(transforms::plus));
    registrar.register_transform("P_cal_no_angles", Arc::new(transforms::cal_no_angles));
    registrar.register_transform("P_comma2semicol", Arc::new(transforms::comma2semicol));

    registrar.register_transform("P_diff_d", Arc::new(math::diff_d));
    registrar.register_transform("P_max_d", Arc::new(math::max_d));
    registrar.register_transform("P_min_d", Arc::new(math::min_d));
    registrar.register_transform("P_childsum_ll", Arc::new(math::childsum_ll));
    registrar.register_transform("P_childsum_d", Arc::new(math::childsum_d));
    registrar.register_transform("P_childmean", Arc::new(math::childmean));
    registrar.register_transform("P_childstdev", Arc::new(math::childstdev));
    registrar.register_transform("P_childmax_d", Arc::new(math::childmax_d));
    registrar.register_transform("P_childmin_d", Arc::new(math::childmin_d));
    registrar.register_transform("P_childnzmin_d", Arc::new(math::childnzmin_d));
    registrar.register_transform("P_childmaxdiff_d", Arc::new(math::childmaxdiff_d));
    registrar.register_transform("P_childmax_ll", Arc::new(math::childmax_ll));
    registrar.register_transform("P_childmin_ll", Arc::new(math::childmin_ll));
}

/// Immediate children of the record being transformed, in creation order.
pub(crate) fn child_records<'a>(
    ctx: &'a DispatchContext,
    args: &TransformArgs<'_>,
) -> Result<Vec<&'a Record>, TransformError> {
    let child_level = ctx.child_level(args.level)?.ok_or_else(|| {
        TransformError::InvalidArgs(format!("level '{}' has no finer level", args.level))
    })?;
    let children = ctx.children(args.level, args.key)?;
    children
        .iter()
        .map(|key| ctx.record(child_level, key).map_err(TransformError::from))
        .collect()
}

/// Finest-level descendants of the record being transformed, in creation order.
pub(crate) fn finest_descendants<'a>(
    ctx: &'a DispatchContext,
    args: &TransformArgs<'_>,
) -> Result<Vec<&'a Record>, TransformError> {
    let finest = ctx.chain().name(0).unwrap_or_default();
    if finest == args.level {
        return Err(TransformError::InvalidArgs(format!(
            "level '{}' is the finest level",
            args.level
        )));
    }
    ctx.get_keys(args.key, args.level, finest)?
        .into_iter()
        .map(|key| ctx.record(finest, key).map_err(TransformError::from))
        .collect()
}

/// Split a trailing `+`/`-` direction filter off a field name.
pub(crate) fn split_direction(option: &str) -> Result<(&str, Option<bool>), TransformError> {
    if option.is_empty() {
        return Err(TransformError::InvalidArgs(
            "a child field name is required".to_string(),
        ));
    }
    Ok(if let Some(field) = option.strip_suffix('+') {
        (field, Some(true))
    } else if let Some(field) = option.strip_suffix('-') {
        (field, Some(false))
    } else {
        (option, None)
    })
}
