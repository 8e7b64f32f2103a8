use anyhow::Result;
use tracing::debug;

use crate::api::SiteApi;
use crate::model::{SiteData, SigError};
use crate::suite::CheckLimits;

/// Strips every `subst` alias and expands what remains once.
pub fn evaluate_subst<A: SiteApi + ?Sized>(
    api: &mut A,
    site: &SiteData,
    text: &str,
) -> Result<String> {
    if text.is_empty() {
        return Ok(String::new());
    }
    let mut stripped = text.to_string();
    for alias in &site.subst_aliases {
        stripped = stripped.replace(alias.as_str(), "");
    }
    api.expand_templates(&stripped)
}

/// Expands repeatedly to find signatures that substitute another signature
/// (`~~~`) or never settle.
pub fn check_tildes<A: SiteApi + ?Sized>(
    api: &mut A,
    site: &SiteData,
    signature: &str,
    limits: &CheckLimits,
) -> Result<Option<SigError>> {
    if !signature.contains('{') && !signature.contains('~') {
        return Ok(None);
    }

    let mut previous = signature.to_string();
    for round in 0..limits.max_subst_rounds {
        let expanded = evaluate_subst(api, site, &previous)?;
        if expanded.contains("~~~") {
            return Ok(Some(SigError::NestedSubst));
        }
        if expanded == previous {
            return Ok(None);
        }
        if expanded.is_empty() {
            // Usually a parser function with no default swallowed everything.
            let tildes = previous.matches('~').count();
            debug!(round, tildes, "expansion came back empty, counting tildes");
            return Ok((tildes >= limits.nested_tilde_threshold).then_some(SigError::NestedSubst));
        }
        previous = expanded;
    }
    Ok(Some(SigError::ComplexTemplate))
}

pub fn check_post_subst_length<A: SiteApi + ?Sized>(
    api: &mut A,
    site: &SiteData,
    signature: &str,
    limits: &CheckLimits,
) -> Result<Option<SigError>> {
    if signature.chars().count() > limits.max_length || !signature.contains('{') {
        return Ok(None);
    }
    let expanded = evaluate_subst(api, site, signature)?;
    if expanded.is_empty() || expanded == signature {
        return Ok(None);
    }
    Ok((expanded.chars().count() > limits.max_length).then_some(SigError::SigTooLongPostSubst))
}
