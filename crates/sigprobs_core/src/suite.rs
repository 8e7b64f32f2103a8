use std::collections::BTreeSet;

use anyhow::Result;

use crate::api::SiteApi;
use crate::html;
use crate::links::{LinkVerdict, link_points_to_owner, links_resolve_to_owner};
use crate::lint::get_lint_errors;
use crate::model::{Checks, SiteData, SigError};
use crate::site::{normal_name, normal_namespace};
use crate::subst::{check_post_subst_length, check_tildes, evaluate_subst};
use crate::wikitext::{self, Wikicode};

const FANCY_CHARS: [char; 4] = ['\'', '<', '[', '{'];
const BREAK_TAGS: [&str; 3] = ["br", "p", "div"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckLimits {
    pub max_length: usize,
    pub max_subst_rounds: usize,
    /// Tildes needed to call an emptied expansion a nested signature.
    pub nested_tilde_threshold: usize,
}

impl Default for CheckLimits {
    fn default() -> Self {
        Self {
            max_length: 255,
            max_subst_rounds: 5,
            nested_tilde_threshold: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckOptions {
    pub checks: Checks,
    pub limits: CheckLimits,
}

impl Default for CheckOptions {
    fn default() -> Self {
        Self::new(Checks::DEFAULT)
    }
}

impl CheckOptions {
    pub fn new(checks: Checks) -> Self {
        Self {
            checks,
            limits: CheckLimits::default(),
        }
    }

    pub fn with_limits(mut self, limits: CheckLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn without(&self, checks: Checks) -> Self {
        Self {
            checks: self.checks - checks,
            limits: self.limits.clone(),
        }
    }
}

/// Runs every selected check against one user's signature.
///
/// A signature without any formatting characters is reported as
/// `plain-fancy-sig` alone; no other check runs for it.
pub fn check_signature<A: SiteApi + ?Sized>(
    api: &mut A,
    site: &SiteData,
    user: &str,
    signature: &str,
    options: &CheckOptions,
) -> Result<BTreeSet<SigError>> {
    let checks = options.checks;
    let limits = &options.limits;
    let sig = html::unescape(signature);

    if checks.contains(Checks::FANCY)
        && let Some(error) = check_fanciness(&sig)
    {
        return Ok(BTreeSet::from([error]));
    }

    let code = wikitext::parse(&sig);
    let mut found = Vec::<Option<SigError>>::new();
    let mut errors = BTreeSet::new();

    if checks.contains(Checks::LINKS) {
        found.push(check_links(api, site, user, &sig)?);
    }
    if checks.contains(Checks::LENGTH) {
        found.push(check_length(&sig, limits));
    }
    if checks.contains(Checks::LINT) {
        let expanded = evaluate_subst(api, site, &sig)?;
        errors.extend(get_lint_errors(api, &expanded, checks)?);
    }
    if checks.contains(Checks::NESTED_SUBST) {
        found.push(check_tildes(api, site, &sig, limits)?);
    }
    if checks.contains(Checks::IMAGES) {
        found.push(check_images(site, &code));
    }
    if checks.contains(Checks::TRANSCLUSION) {
        found.push(check_transclusion(site, &code));
    }
    if checks.contains(Checks::SUBST_LENGTH) {
        found.push(check_post_subst_length(api, site, &sig, limits)?);
    }
    if checks.contains(Checks::LINK_NAME) {
        found.push(check_impersonation(api, site, user, &code)?);
    }
    if checks.contains(Checks::FREE_PIPES) {
        found.push(check_pipes(&code));
    }
    if checks.contains(Checks::EXTLINKS) {
        found.push(check_extlinks(&code));
    }
    if checks.contains(Checks::BREAKS) {
        found.push(check_line_breaks(&sig, &code));
    }
    if checks.contains(Checks::HRULE) {
        found.push(check_hrule(&sig, &code));
    }

    errors.extend(found.into_iter().flatten());
    Ok(errors)
}

/// Looks for a link to the owner in the raw markup, then in its expansion.
pub fn check_links<A: SiteApi + ?Sized>(
    api: &mut A,
    site: &SiteData,
    user: &str,
    signature: &str,
) -> Result<Option<SigError>> {
    let LinkVerdict::Mismatch(mut reasons) = links_resolve_to_owner(user, site, signature) else {
        return Ok(None);
    };
    let expanded = evaluate_subst(api, site, signature)?;
    match links_resolve_to_owner(user, site, &expanded) {
        LinkVerdict::Match => Ok(None),
        LinkVerdict::Mismatch(more) => {
            reasons.extend(more);
            Ok(Some(if reasons.contains(&SigError::LinkUsernameMismatch) {
                SigError::LinkUsernameMismatch
            } else if reasons.contains(&SigError::InterwikiUserLink) {
                SigError::InterwikiUserLink
            } else {
                SigError::NoUserLinks
            }))
        }
    }
}

pub fn check_length(signature: &str, limits: &CheckLimits) -> Option<SigError> {
    (signature.chars().count() > limits.max_length).then_some(SigError::SigTooLong)
}

pub fn check_fanciness(signature: &str) -> Option<SigError> {
    (!signature.contains(FANCY_CHARS)).then_some(SigError::PlainFancySig)
}

pub fn check_images(site: &SiteData, code: &Wikicode) -> Option<SigError> {
    code.wikilinks()
        .into_iter()
        .filter(|link| !link.title.trim_start().starts_with(':'))
        .filter_map(|link| link.title.split_once(':'))
        .any(|(namespace, _)| {
            site.file_namespace_names
                .contains(&normal_namespace(namespace.trim()))
        })
        .then_some(SigError::ImagesInSig)
}

pub fn check_transclusion(site: &SiteData, code: &Wikicode) -> Option<SigError> {
    code.templates()
        .into_iter()
        .any(|template| {
            template.name != "!"
                && !site
                    .subst_aliases
                    .iter()
                    .any(|alias| template.name.starts_with(alias.as_str()))
        })
        .then_some(SigError::TranscludedTemplates)
}

/// Flags links to the owner whose display text names some other existing user.
pub fn check_impersonation<A: SiteApi + ?Sized>(
    api: &mut A,
    site: &SiteData,
    user: &str,
    code: &Wikicode,
) -> Result<Option<SigError>> {
    let owner = normal_name(user);
    let mut problem = false;
    for link in code.wikilinks() {
        let Some(text) = link.text.as_deref().map(str::trim) else {
            continue;
        };
        if text.is_empty() || !link_points_to_owner(user, site, link) {
            continue;
        }
        let shown = normal_name(text);
        if shown == owner {
            break;
        }
        if api.user_exists(&shown)? {
            problem = true;
        }
    }
    Ok(problem.then_some(SigError::LinkNameImpersonation))
}

pub fn check_pipes(code: &Wikicode) -> Option<SigError> {
    code.text_nodes()
        .into_iter()
        .any(|text| text.contains('|'))
        .then_some(SigError::UnescapedPipes)
}

pub fn check_extlinks(code: &Wikicode) -> Option<SigError> {
    (!code.external_links().is_empty()).then_some(SigError::ExternalLinks)
}

pub fn check_line_breaks(signature: &str, code: &Wikicode) -> Option<SigError> {
    (signature.contains('\n') || has_tag(code, &BREAK_TAGS)).then_some(SigError::LineBreaks)
}

pub fn check_hrule(signature: &str, code: &Wikicode) -> Option<SigError> {
    (signature.contains("----") || has_tag(code, &["hr"])).then_some(SigError::HorizontalRule)
}

fn has_tag(code: &Wikicode, names: &[&str]) -> bool {
    code.tags()
        .into_iter()
        .any(|tag| names.contains(&tag.name.as_str()))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::{
        CheckLimits, CheckOptions, check_extlinks, check_fanciness, check_hrule, check_images,
        check_length, check_line_breaks, check_pipes, check_signature, check_transclusion,
    };
    use rusqlite::Connection;
    use tempfile::tempdir;

    use crate::api::SiteApi;
    use crate::model::{Checks, SigError};
    use crate::replica::tests::write_replica;
    use crate::replica::{Replica, ReplicaFirst};
    use crate::testing::{MockApi, en_site};
    use crate::wikitext::parse;

    fn run(api: &mut MockApi, user: &str, sig: &str, checks: Checks) -> BTreeSet<SigError> {
        check_signature(api, &en_site(), user, sig, &CheckOptions::new(checks)).expect("check")
    }

    #[test]
    fn plain_signatures_are_only_plain_fancy() {
        let long = "x".repeat(400);
        for sig in ["Example", "Example (talk)", "Ex | ample ---- ~~~~", long.as_str()] {
            let mut api = MockApi::default();
            assert_eq!(
                run(&mut api, "Example", sig, Checks::ALL),
                BTreeSet::from([SigError::PlainFancySig]),
                "{sig}"
            );
            assert_eq!(api.request_count, 0);
        }
    }

    #[test]
    fn length_boundary_is_inclusive() {
        let limits = CheckLimits::default();
        assert_eq!(check_length(&"é".repeat(255), &limits), None);
        assert_eq!(check_length(&"é".repeat(256), &limits), Some(SigError::SigTooLong));
    }

    #[test]
    fn fanciness_needs_one_formatting_character() {
        assert_eq!(check_fanciness("plain"), Some(SigError::PlainFancySig));
        for sig in ["''x''", "<b>x</b>", "[[User:X]]", "{{x}}"] {
            assert_eq!(check_fanciness(sig), None);
        }
    }

    #[test]
    fn scenario_correct_user_link_is_clean() {
        let mut api = MockApi::default();
        assert!(run(&mut api, "Example", "[[User:Example]]", Checks::DEFAULT).is_empty());
    }

    #[test]
    fn scenario_plain_text_signature() {
        let mut api = MockApi::default();
        assert_eq!(
            run(&mut api, "Example", "Example", Checks::DEFAULT),
            BTreeSet::from([SigError::PlainFancySig])
        );
    }

    #[test]
    fn scenario_link_to_other_user() {
        let mut api = MockApi::default();
        let errors = run(&mut api, "Example", "[[User:Example2|Example]]", Checks::DEFAULT);
        assert_eq!(errors, BTreeSet::from([SigError::LinkUsernameMismatch]));
    }

    #[test]
    fn links_found_after_expansion_are_accepted() {
        let mut api = MockApi::default();
        api.expand("{{Mysig}}", "[[User:Example|Ex]]");
        let errors = run(&mut api, "Example", "{{subst:Mysig}}", Checks::LINKS);
        assert!(errors.is_empty());
    }

    #[test]
    fn missing_links_prefer_mismatch_then_interwiki() {
        let mut api = MockApi::default();
        assert_eq!(
            run(&mut api, "Example", "[[meta:User:Example]]", Checks::LINKS),
            BTreeSet::from([SigError::InterwikiUserLink])
        );
        assert_eq!(
            run(&mut api, "Example", "[[meta:User:Example]] [[User:Other]]", Checks::LINKS),
            BTreeSet::from([SigError::LinkUsernameMismatch])
        );
        assert_eq!(
            run(&mut api, "Example", "'''Example'''", Checks::LINKS),
            BTreeSet::from([SigError::NoUserLinks])
        );
    }

    #[test]
    fn html_entities_are_decoded_before_checking() {
        let mut api = MockApi::default();
        let errors = run(
            &mut api,
            "Example",
            "[[User:Example|Ex]]&#124;[[User talk:Example|talk]]",
            Checks::FREE_PIPES | Checks::FANCY,
        );
        assert_eq!(errors, BTreeSet::from([SigError::UnescapedPipes]));
    }

    #[test]
    fn lint_runs_on_the_expanded_signature() {
        let mut api = MockApi::default();
        api.expand("{{Mysig}}", "[[User:Example]] <b>unclosed");
        api.lint_rule("<b>unclosed", "missing-end-tag");
        let errors = run(&mut api, "Example", "{{subst:Mysig}}", Checks::LINT);
        assert_eq!(errors, BTreeSet::from([SigError::MissingEndTag]));
        assert_eq!(api.linted_inputs, vec!["[[User:Example]] <b>unclosed"]);
    }

    #[test]
    fn images_ignore_escaped_links() {
        let site = en_site();
        assert_eq!(
            check_images(&site, &parse("[[File:Star.svg|10px]][[User:X]]")),
            Some(SigError::ImagesInSig)
        );
        assert_eq!(
            check_images(&site, &parse("[[image:Star.svg]]")),
            Some(SigError::ImagesInSig)
        );
        assert_eq!(check_images(&site, &parse("[[:File:Star.svg]]")), None);
    }

    #[test]
    fn transclusion_allows_subst_and_pipe_escape() {
        let site = en_site();
        assert_eq!(check_transclusion(&site, &parse("{{subst:Sig}}{{!}}")), None);
        assert_eq!(
            check_transclusion(&site, &parse("{{subst:Sig}}{{Userbox}}")),
            Some(SigError::TranscludedTemplates)
        );
    }

    #[test]
    fn impersonation_needs_another_existing_user() {
        let mut api = MockApi::default();
        api.existing_users.insert("Jimbo".to_string());
        assert_eq!(
            run(&mut api, "Example", "[[User:Example|Jimbo]]", Checks::LINK_NAME),
            BTreeSet::from([SigError::LinkNameImpersonation])
        );
        assert!(run(&mut api, "Example", "[[User:Example|Nobody]]", Checks::LINK_NAME).is_empty());
        assert!(run(&mut api, "Example", "[[User:Other|Jimbo]]", Checks::LINK_NAME).is_empty());

        let before = api.request_count;
        assert!(
            run(
                &mut api,
                "Example",
                "[[User:Example|Example]] [[User talk:Example|Jimbo]]",
                Checks::LINK_NAME
            )
            .is_empty()
        );
        assert_eq!(api.request_count, before);
    }

    #[test]
    fn impersonation_of_multi_word_user_is_found_in_replica() {
        let temp = tempdir().expect("tempdir");
        write_replica(temp.path(), "enwiki");
        Connection::open(Replica::path_for(temp.path(), "enwiki"))
            .expect("open sqlite")
            .execute(
                r#"INSERT INTO "user" (user_id, user_name) VALUES (7, 'Jimbo Wales')"#,
                [],
            )
            .expect("insert user");
        let replica = Replica::open(Some(temp.path()), "enwiki").expect("open replica");

        let mut api = MockApi::default();
        let mut strategy = ReplicaFirst::new(&mut api, Some(&replica));
        let errors = check_signature(
            &mut strategy,
            &en_site(),
            "Example",
            "[[User:Example|Jimbo Wales]]",
            &CheckOptions::new(Checks::LINK_NAME),
        )
        .expect("check");
        assert_eq!(errors, BTreeSet::from([SigError::LinkNameImpersonation]));
        assert_eq!(strategy.request_count(), 0);
    }

    #[test]
    fn pipes_written_as_any_character_reference_are_found() {
        let mut api = MockApi::default();
        assert_eq!(
            run(&mut api, "Example", "[[User:Example]] &verbar; talk", Checks::FREE_PIPES),
            BTreeSet::from([SigError::UnescapedPipes])
        );
        assert_eq!(
            run(&mut api, "Example", "[[User:Example]] &#124 talk", Checks::FREE_PIPES),
            BTreeSet::from([SigError::UnescapedPipes])
        );
    }

    #[test]
    fn markup_shape_checks() {
        assert_eq!(check_pipes(&parse("[[User:X|X]] | talk")), Some(SigError::UnescapedPipes));
        assert_eq!(check_pipes(&parse("[[User:X|X]] {{!}} talk")), None);
        assert_eq!(
            check_extlinks(&parse("[[User:X]] [https://example.org home]")),
            Some(SigError::ExternalLinks)
        );
        assert_eq!(check_extlinks(&parse("[[User:X]]")), None);
        assert_eq!(check_line_breaks("a\nb", &parse("a\nb")), Some(SigError::LineBreaks));
        assert_eq!(check_line_breaks("<br />", &parse("<br />")), Some(SigError::LineBreaks));
        assert_eq!(check_line_breaks("<span>", &parse("<span>")), None);
        assert_eq!(check_hrule("----", &parse("----")), Some(SigError::HorizontalRule));
        assert_eq!(check_hrule("<hr>", &parse("<hr>")), Some(SigError::HorizontalRule));
        assert_eq!(check_hrule("---", &parse("---")), None);
    }

    #[test]
    fn default_checks_skip_extended_ones() {
        let mut api = MockApi::default();
        let errors = run(
            &mut api,
            "Example",
            "[[User:Example]] [https://example.org x] | {{Userbox}}",
            Checks::DEFAULT,
        );
        assert!(!errors.contains(&SigError::ExternalLinks));
        assert!(!errors.contains(&SigError::UnescapedPipes));
        assert!(!errors.contains(&SigError::TranscludedTemplates));

        let errors = run(
            &mut api,
            "Example",
            "[[User:Example]] [https://example.org x] | {{Userbox}}",
            Checks::EXTENDED,
        );
        assert!(errors.contains(&SigError::ExternalLinks));
        assert!(errors.contains(&SigError::UnescapedPipes));
        assert!(errors.contains(&SigError::TranscludedTemplates));
    }
}
