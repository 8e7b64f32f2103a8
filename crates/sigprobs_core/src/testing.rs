use std::collections::{BTreeMap, BTreeSet};

use crate::api::SiteApi;
use crate::error::SigprobsError;
use crate::lint::LintDiagnostic;
use crate::model::SiteData;
use crate::site::SiteInfo;

/// In-memory site. Expansion is the identity unless a mapping was registered,
/// and lint reports one diagnostic per registered needle found in the text.
#[derive(Default)]
pub(crate) struct MockApi {
    pub site_info: SiteInfo,
    pub expansions: BTreeMap<String, String>,
    pub lint_rules: Vec<(String, String)>,
    pub existing_users: BTreeSet<String>,
    pub signature_template: String,
    pub fail_expansion: bool,
    pub fail_user_lookup: bool,
    pub expanded_inputs: Vec<String>,
    pub linted_inputs: Vec<String>,
    pub request_count: usize,
}

impl MockApi {
    pub fn expand(&mut self, from: &str, to: &str) {
        self.expansions.insert(from.to_string(), to.to_string());
    }

    pub fn lint_rule(&mut self, needle: &str, lint_type: &str) {
        self.lint_rules
            .push((needle.to_string(), lint_type.to_string()));
    }
}

impl SiteApi for MockApi {
    fn site_info(&mut self) -> anyhow::Result<SiteInfo> {
        self.request_count += 1;
        Ok(self.site_info.clone())
    }

    fn expand_templates(&mut self, wikitext: &str) -> anyhow::Result<String> {
        self.request_count += 1;
        self.expanded_inputs.push(wikitext.to_string());
        if self.fail_expansion {
            return Err(SigprobsError::UpstreamUnavailable {
                operation: "expandtemplates".to_string(),
                message: "connection refused".to_string(),
            }
            .into());
        }
        Ok(self
            .expansions
            .get(wikitext)
            .cloned()
            .unwrap_or_else(|| wikitext.to_string()))
    }

    fn lint(&mut self, wikitext: &str) -> anyhow::Result<Vec<LintDiagnostic>> {
        self.request_count += 1;
        self.linted_inputs.push(wikitext.to_string());
        Ok(self
            .lint_rules
            .iter()
            .filter(|(needle, _)| wikitext.contains(needle.as_str()))
            .map(|(_, lint_type)| LintDiagnostic::new(lint_type))
            .collect())
    }

    fn user_exists(&mut self, username: &str) -> anyhow::Result<bool> {
        self.request_count += 1;
        if self.fail_user_lookup {
            anyhow::bail!("user lookup failed");
        }
        Ok(self.existing_users.contains(username))
    }

    fn signature_template(&mut self) -> anyhow::Result<String> {
        self.request_count += 1;
        Ok(self.signature_template.clone())
    }

    fn request_count(&self) -> usize {
        self.request_count
    }
}

fn names(values: &[&str]) -> BTreeSet<String> {
    values.iter().map(|value| (*value).to_string()).collect()
}

pub(crate) fn en_site() -> SiteData {
    SiteData {
        user_namespace_names: names(&["User"]),
        user_talk_namespace_names: names(&["User_talk"]),
        file_namespace_names: names(&["File", "Image"]),
        special_namespace_names: names(&["Special"]),
        contribs_page_aliases: names(&["Contributions", "Contribs"]),
        subst_aliases: vec!["SUBST:".to_string(), "subst:".to_string(), "Subst:".to_string()],
        database_id: "enwiki".to_string(),
        hostname: "en.wikipedia.org".to_string(),
    }
}

pub(crate) fn de_site() -> SiteData {
    SiteData {
        user_namespace_names: names(&["Benutzer", "Benutzerin", "User"]),
        user_talk_namespace_names: names(&["Benutzer_diskussion", "Bd", "User_talk"]),
        file_namespace_names: names(&["Datei", "Bild", "File"]),
        special_namespace_names: names(&["Spezial", "Special"]),
        contribs_page_aliases: names(&["Beiträge", "Contributions"]),
        subst_aliases: ["ERSETZE:", "SUBST:", "ersetze:", "subst:", "Ersetze:", "Subst:"]
            .into_iter()
            .map(ToString::to_string)
            .collect(),
        database_id: "dewiki".to_string(),
        hostname: "de.wikipedia.org".to_string(),
    }
}

/// Siteinfo response that resolves to [`en_site`].
pub(crate) fn en_site_info() -> SiteInfo {
    serde_json::from_value(serde_json::json!({
        "namespaces": {
            "-1": {"id": -1, "name": "Special", "canonical": "Special"},
            "0": {"id": 0, "name": ""},
            "2": {"id": 2, "name": "User", "canonical": "User"},
            "3": {"id": 3, "name": "User talk", "canonical": "User talk"},
            "6": {"id": 6, "name": "File", "canonical": "File"}
        },
        "namespacealiases": [{"id": 6, "alias": "Image"}],
        "specialpagealiases": [
            {"realname": "Contributions", "aliases": ["Contributions", "Contribs"]}
        ],
        "magicwords": [{"name": "subst", "aliases": ["SUBST:"]}],
        "general": {"wikiid": "enwiki"}
    }))
    .expect("en siteinfo fixture")
}
