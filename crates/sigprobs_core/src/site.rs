use std::collections::{BTreeMap, BTreeSet};

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::debug;

use crate::api::SiteApi;
use crate::model::SiteData;

const NS_SPECIAL: i64 = -1;
const NS_USER: i64 = 2;
const NS_USER_TALK: i64 = 3;
const NS_FILE: i64 = 6;

/// The `query` object of a siteinfo response (formatversion 2).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SiteInfo {
    #[serde(default)]
    pub namespaces: BTreeMap<String, NamespaceInfo>,
    #[serde(default)]
    pub namespacealiases: Vec<NamespaceAlias>,
    #[serde(default)]
    pub specialpagealiases: Vec<SpecialPageAlias>,
    #[serde(default)]
    pub magicwords: Vec<MagicWord>,
    #[serde(default)]
    pub general: GeneralInfo,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NamespaceInfo {
    pub id: i64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub canonical: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NamespaceAlias {
    pub id: i64,
    #[serde(default)]
    pub alias: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SpecialPageAlias {
    pub realname: String,
    #[serde(default)]
    pub aliases: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MagicWord {
    pub name: String,
    #[serde(default)]
    pub aliases: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GeneralInfo {
    #[serde(default)]
    pub wikiid: String,
}

/// Uppercases the first letter and turns spaces into underscores.
pub fn normal_name(name: &str) -> String {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return String::new();
    };
    let mut out = String::with_capacity(name.len());
    out.extend(first.to_uppercase());
    out.push_str(chars.as_str());
    out.replace(' ', "_")
}

/// Namespace names compare case-insensitively apart from the first letter rule.
pub fn normal_namespace(name: &str) -> String {
    normal_name(&name.to_lowercase())
}

pub fn resolve_site<A: SiteApi + ?Sized>(api: &mut A, hostname: &str) -> Result<SiteData> {
    let info = api
        .site_info()
        .with_context(|| format!("failed to load site metadata for {hostname}"))?;
    let site = site_data_from_info(&info, hostname);
    debug!(
        host = hostname,
        dbname = %site.database_id,
        user_names = site.user_namespace_names.len(),
        subst_aliases = site.subst_aliases.len(),
        "resolved site metadata"
    );
    Ok(site)
}

pub fn site_data_from_info(info: &SiteInfo, hostname: &str) -> SiteData {
    let mut names = BTreeMap::<i64, BTreeSet<String>>::new();
    for namespace in info.namespaces.values() {
        let entry = names.entry(namespace.id).or_default();
        entry.insert(normal_namespace(namespace.name.trim()));
        if let Some(canonical) = &namespace.canonical {
            entry.insert(normal_namespace(canonical.trim()));
        }
    }
    for alias in &info.namespacealiases {
        names
            .entry(alias.id)
            .or_default()
            .insert(normal_namespace(alias.alias.trim()));
    }
    let mut take = |id: i64| {
        let mut set = names.remove(&id).unwrap_or_default();
        set.remove("");
        set
    };

    let mut contribs_page_aliases = info
        .specialpagealiases
        .iter()
        .find(|page| page.realname == "Contributions")
        .map(|page| {
            page.aliases
                .iter()
                .map(|alias| normal_name(alias.trim()))
                .filter(|alias| !alias.is_empty())
                .collect::<BTreeSet<_>>()
        })
        .unwrap_or_default();
    if contribs_page_aliases.is_empty() {
        contribs_page_aliases.insert("Contributions".to_string());
    }

    SiteData {
        user_namespace_names: take(NS_USER),
        user_talk_namespace_names: take(NS_USER_TALK),
        file_namespace_names: take(NS_FILE),
        special_namespace_names: take(NS_SPECIAL),
        contribs_page_aliases,
        subst_aliases: subst_variants(&info.magicwords),
        database_id: info.general.wikiid.clone(),
        hostname: hostname.to_string(),
    }
}

/// Every alias of the `subst` magic word as given, lowercased, and with only the
/// first letter kept in its original case.
fn subst_variants(magicwords: &[MagicWord]) -> Vec<String> {
    let aliases = magicwords
        .iter()
        .find(|word| word.name == "subst")
        .map(|word| word.aliases.clone())
        .filter(|aliases| !aliases.is_empty())
        .unwrap_or_else(|| vec!["SUBST".to_string()]);

    let mut variants = Vec::with_capacity(aliases.len() * 3);
    variants.extend(aliases.iter().cloned());
    variants.extend(aliases.iter().map(|alias| alias.to_lowercase()));
    variants.extend(aliases.iter().map(|alias| {
        let mut chars = alias.chars();
        match chars.next() {
            Some(first) => format!("{first}{}", chars.as_str().to_lowercase()),
            None => String::new(),
        }
    }));
    dedupe(variants)
}

fn dedupe(values: Vec<String>) -> Vec<String> {
    let mut seen = BTreeSet::new();
    let mut out = Vec::new();
    for value in values {
        if value.is_empty() {
            continue;
        }
        if seen.insert(value.clone()) {
            out.push(value);
        }
    }
    out
}
