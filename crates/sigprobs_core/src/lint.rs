use std::collections::{BTreeMap, BTreeSet};

use anyhow::Result;
use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

use crate::api::SiteApi;
use crate::model::{Checks, SigError};

/// One entry of the lint endpoint's response array.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct LintDiagnostic {
    #[serde(rename = "type", default)]
    pub lint_type: String,
    #[serde(default)]
    pub params: BTreeMap<String, Value>,
}

impl LintDiagnostic {
    pub fn new(lint_type: &str) -> Self {
        Self {
            lint_type: lint_type.to_string(),
            params: BTreeMap::new(),
        }
    }

    fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(Value::as_str)
    }
}

/// Maps diagnostics onto errors. `obsolete-tag` is only reported when
/// [`Checks::OBSOLETE_TAG`] is selected, with `<font>` split out on its own.
pub fn lint_errors(diagnostics: &[LintDiagnostic], checks: Checks) -> BTreeSet<SigError> {
    let mut errors = BTreeSet::new();
    for diagnostic in diagnostics {
        if diagnostic.lint_type == "obsolete-tag" {
            if checks.contains(Checks::OBSOLETE_TAG) {
                errors.insert(if diagnostic.param("name") == Some("font") {
                    SigError::ObsoleteFontTag
                } else {
                    SigError::ObsoleteTag
                });
            }
            continue;
        }
        match SigError::from_lint_type(&diagnostic.lint_type) {
            Some(error) => {
                errors.insert(error);
            }
            None => warn!(lint_type = %diagnostic.lint_type, "dropping unknown lint type"),
        }
    }
    errors
}

/// Lints `wikitext` as given; callers expand substitutions first.
pub fn get_lint_errors<A: SiteApi + ?Sized>(
    api: &mut A,
    wikitext: &str,
    checks: Checks,
) -> Result<BTreeSet<SigError>> {
    let diagnostics = api.lint(wikitext)?;
    Ok(lint_errors(&diagnostics, checks))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use serde_json::json;

    use super::{LintDiagnostic, get_lint_errors, lint_errors};
    use crate::model::{Checks, SigError};
    use crate::testing::MockApi;

    fn parse_response(value: serde_json::Value) -> Vec<LintDiagnostic> {
        serde_json::from_value(value).expect("lint response")
    }

    #[test]
    fn diagnostics_map_onto_errors() {
        let diagnostics = parse_response(json!([
            {"type": "missing-end-tag", "params": {"name": "span"}, "dsr": [0, 6, 6, 0]},
            {"type": "multi-colon-escape", "params": {}},
            {"type": "night-mode-unaware-background-color", "params": {}}
        ]));
        assert_eq!(
            lint_errors(&diagnostics, Checks::DEFAULT),
            BTreeSet::from([SigError::MissingEndTag, SigError::MultiColonEscape])
        );
    }

    #[test]
    fn obsolete_tags_need_their_own_flag() {
        let diagnostics = parse_response(json!([
            {"type": "obsolete-tag", "params": {"name": "font"}},
            {"type": "obsolete-tag", "params": {"name": "center"}}
        ]));
        assert!(lint_errors(&diagnostics, Checks::DEFAULT).is_empty());
        assert_eq!(
            lint_errors(&diagnostics, Checks::DEFAULT | Checks::OBSOLETE_TAG),
            BTreeSet::from([SigError::ObsoleteFontTag, SigError::ObsoleteTag])
        );
    }

    #[test]
    fn get_lint_errors_uses_one_request() {
        let mut api = MockApi::default();
        api.lint_rule("<b>unclosed", "missing-end-tag");
        let errors =
            get_lint_errors(&mut api, "x <b>unclosed", Checks::DEFAULT).expect("lint");
        assert_eq!(errors, BTreeSet::from([SigError::MissingEndTag]));
        let clean = get_lint_errors(&mut api, "[[User:X]]", Checks::DEFAULT).expect("lint");
        assert!(clean.is_empty());
        assert_eq!(api.request_count, 2);
    }
}
