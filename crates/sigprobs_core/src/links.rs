use std::collections::BTreeSet;

use crate::model::{SiteData, SigError};
use crate::site::{normal_name, normal_namespace};
use crate::wikitext::{self, WikiLink};

/// Outcome of looking for a link back to the signature's owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkVerdict {
    Match,
    /// Reasons no link matched. Empty when no user-related links were found.
    Mismatch(BTreeSet<SigError>),
}

impl LinkVerdict {
    pub fn is_match(&self) -> bool {
        matches!(self, Self::Match)
    }
}

/// What a single wikilink points at, relative to the owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkTarget {
    Owner,
    OtherUser,
    Interwiki,
    Unrelated,
}

pub fn links_resolve_to_owner(owner: &str, site: &SiteData, markup: &str) -> LinkVerdict {
    let owner = normal_name(owner);
    let code = wikitext::parse(markup);
    let mut reasons = BTreeSet::new();
    for link in code.wikilinks() {
        match classify_title(&owner, site, &link.title) {
            LinkTarget::Owner => return LinkVerdict::Match,
            LinkTarget::OtherUser => {
                reasons.insert(SigError::LinkUsernameMismatch);
            }
            LinkTarget::Interwiki => {
                reasons.insert(SigError::InterwikiUserLink);
            }
            LinkTarget::Unrelated => {}
        }
    }
    LinkVerdict::Mismatch(reasons)
}

pub fn link_points_to_owner(owner: &str, site: &SiteData, link: &WikiLink) -> bool {
    classify_title(&normal_name(owner), site, &link.title) == LinkTarget::Owner
}

/// `owner` must already be normalized.
pub fn classify_title(owner: &str, site: &SiteData, title: &str) -> LinkTarget {
    let title = title.split('#').next().unwrap_or_default();

    let (namespace, page) = if owner.contains(':') {
        // The owner's own colon would otherwise be taken as the namespace separator.
        let title = title.trim().replace(' ', "_");
        let colon_suffix = format!(":{owner}");
        let slash_suffix = format!("/{owner}");
        if let Some(namespace) = title.strip_suffix(&colon_suffix) {
            (namespace.to_string(), owner.to_string())
        } else if let Some(raw) = title.strip_suffix(&slash_suffix) {
            let Some((namespace, page)) = raw.rsplit_once(':') else {
                return LinkTarget::Unrelated;
            };
            (namespace.to_string(), format!("{page}/{owner}"))
        } else {
            return LinkTarget::Unrelated;
        }
    } else {
        let Some((namespace, page)) = title.rsplit_once(':') else {
            return LinkTarget::Unrelated;
        };
        (namespace.to_string(), page.to_string())
    };

    let namespace = namespace.trim();
    let namespace = normal_namespace(namespace.strip_prefix(':').unwrap_or(namespace));
    let page = page.trim();

    if namespace.contains(':') {
        return LinkTarget::Interwiki;
    }
    if site.user_namespace_names.contains(&namespace)
        || site.user_talk_namespace_names.contains(&namespace)
    {
        return if normal_name(page) == owner {
            LinkTarget::Owner
        } else {
            LinkTarget::OtherUser
        };
    }
    if site.special_namespace_names.contains(&namespace) {
        let (special_page, target) = page.split_once('/').unwrap_or((page, ""));
        if site
            .contribs_page_aliases
            .contains(&normal_name(special_page.trim()))
        {
            return if normal_name(target.trim()) == owner {
                LinkTarget::Owner
            } else {
                LinkTarget::OtherUser
            };
        }
    }
    LinkTarget::Unrelated
}
