use std::collections::BTreeSet;
use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign, BitXor, Sub};
use std::str::FromStr;

use anyhow::{Result, bail};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Set of signature checks, composable with `|`, `^` and `-`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Checks(u16);

impl Checks {
    pub const NONE: Self = Self(0);
    pub const LINT: Self = Self(1 << 0);
    pub const OBSOLETE_TAG: Self = Self(1 << 1);
    pub const NESTED_SUBST: Self = Self(1 << 2);
    pub const LINKS: Self = Self(1 << 3);
    pub const LENGTH: Self = Self(1 << 4);
    pub const FANCY: Self = Self(1 << 5);
    pub const BREAKS: Self = Self(1 << 6);
    pub const IMAGES: Self = Self(1 << 7);
    pub const TRANSCLUSION: Self = Self(1 << 8);
    pub const SUBST_LENGTH: Self = Self(1 << 9);
    pub const LINK_NAME: Self = Self(1 << 10);
    pub const FREE_PIPES: Self = Self(1 << 11);
    pub const EXTLINKS: Self = Self(1 << 12);
    pub const HRULE: Self = Self(1 << 13);

    pub const DEFAULT: Self = Self(
        Self::LINT.0
            | Self::NESTED_SUBST.0
            | Self::LINKS.0
            | Self::LENGTH.0
            | Self::FANCY.0
            | Self::BREAKS.0
            | Self::SUBST_LENGTH.0,
    );

    pub const EXTENDED: Self = Self(
        Self::IMAGES.0
            | Self::TRANSCLUSION.0
            | Self::SUBST_LENGTH.0
            | Self::LINK_NAME.0
            | Self::FREE_PIPES.0
            | Self::EXTLINKS.0
            | Self::HRULE.0,
    );

    pub const ALL: Self = Self((1 << 14) - 1);

    const NAMED: [(&'static str, Checks); 17] = [
        ("lint", Self::LINT),
        ("obsolete_tag", Self::OBSOLETE_TAG),
        ("nested_subst", Self::NESTED_SUBST),
        ("links", Self::LINKS),
        ("length", Self::LENGTH),
        ("fancy", Self::FANCY),
        ("breaks", Self::BREAKS),
        ("images", Self::IMAGES),
        ("transclusion", Self::TRANSCLUSION),
        ("subst_length", Self::SUBST_LENGTH),
        ("link_name", Self::LINK_NAME),
        ("free_pipes", Self::FREE_PIPES),
        ("extlinks", Self::EXTLINKS),
        ("hrule", Self::HRULE),
        ("default", Self::DEFAULT),
        ("extended", Self::EXTENDED),
        ("all", Self::ALL),
    ];

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Accepts flag and preset names case-insensitively; `-` and `_` are interchangeable.
    pub fn from_name(name: &str) -> Option<Self> {
        let key = name.trim().to_ascii_lowercase().replace('-', "_");
        Self::NAMED
            .iter()
            .find(|(candidate, _)| *candidate == key)
            .map(|(_, checks)| *checks)
    }

    pub fn parse_list<S: AsRef<str>>(names: &[S]) -> Result<Self> {
        let mut checks = Self::NONE;
        for name in names {
            let name = name.as_ref();
            match Self::from_name(name) {
                Some(flag) => checks |= flag,
                None => bail!(
                    "unknown check: {name} (expected one of {})",
                    Self::known_names().join(", ")
                ),
            }
        }
        Ok(checks)
    }

    pub fn known_names() -> Vec<&'static str> {
        Self::NAMED.iter().map(|(name, _)| *name).collect()
    }

    /// Names of the single flags in this set, presets excluded.
    pub fn flag_names(self) -> Vec<&'static str> {
        Self::NAMED
            .iter()
            .filter(|(_, flag)| flag.0.count_ones() == 1 && self.contains(*flag))
            .map(|(name, _)| *name)
            .collect()
    }
}

impl BitOr for Checks {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for Checks {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for Checks {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl BitXor for Checks {
    type Output = Self;

    fn bitxor(self, rhs: Self) -> Self {
        Self(self.0 ^ rhs.0)
    }
}

impl Sub for Checks {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        Self(self.0 & !rhs.0)
    }
}

/// Problems a signature can have. The code strings are the persisted wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SigError {
    Html5Misnesting,
    MiscTidyReplacementIssues,
    MisnestedTag,
    MissingEndTag,
    MultipleUnclosedFormattingTags,
    ObsoleteTag,
    ObsoleteFontTag,
    SelfClosedTag,
    StrippedTag,
    TidyFontBug,
    TidyWhitespaceBug,
    WikilinkInExtlink,
    MultiColonEscape,
    InlineMediaCaption,
    BogusImageOptions,
    InterwikiUserLink,
    LinkUsernameMismatch,
    NestedSubst,
    ComplexTemplate,
    NoUserLinks,
    PlainFancySig,
    SigTooLong,
    ImagesInSig,
    TranscludedTemplates,
    SigTooLongPostSubst,
    LinkNameImpersonation,
    UnescapedPipes,
    ExternalLinks,
    LineBreaks,
    HorizontalRule,
}

impl SigError {
    pub const ALL: [SigError; 30] = [
        Self::Html5Misnesting,
        Self::MiscTidyReplacementIssues,
        Self::MisnestedTag,
        Self::MissingEndTag,
        Self::MultipleUnclosedFormattingTags,
        Self::ObsoleteTag,
        Self::ObsoleteFontTag,
        Self::SelfClosedTag,
        Self::StrippedTag,
        Self::TidyFontBug,
        Self::TidyWhitespaceBug,
        Self::WikilinkInExtlink,
        Self::MultiColonEscape,
        Self::InlineMediaCaption,
        Self::BogusImageOptions,
        Self::InterwikiUserLink,
        Self::LinkUsernameMismatch,
        Self::NestedSubst,
        Self::ComplexTemplate,
        Self::NoUserLinks,
        Self::PlainFancySig,
        Self::SigTooLong,
        Self::ImagesInSig,
        Self::TranscludedTemplates,
        Self::SigTooLongPostSubst,
        Self::LinkNameImpersonation,
        Self::UnescapedPipes,
        Self::ExternalLinks,
        Self::LineBreaks,
        Self::HorizontalRule,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Html5Misnesting => "html5-misnesting",
            Self::MiscTidyReplacementIssues => "misc-tidy-replacement-issues",
            Self::MisnestedTag => "misnested-tag",
            Self::MissingEndTag => "missing-end-tag",
            Self::MultipleUnclosedFormattingTags => "multiple-unclosed-formatting-tags",
            Self::ObsoleteTag => "obsolete-tag",
            Self::ObsoleteFontTag => "obsolete-font-tag",
            Self::SelfClosedTag => "self-closed-tag",
            Self::StrippedTag => "stripped-tag",
            Self::TidyFontBug => "tidy-font-bug",
            Self::TidyWhitespaceBug => "tidy-whitespace-bug",
            Self::WikilinkInExtlink => "wikilink-in-extlink",
            Self::MultiColonEscape => "lint/multi-colon-escape",
            Self::InlineMediaCaption => "inline-media-caption",
            Self::BogusImageOptions => "bogus-image-options",
            Self::InterwikiUserLink => "interwiki-user-link",
            Self::LinkUsernameMismatch => "link-username-mismatch",
            Self::NestedSubst => "nested-subst",
            Self::ComplexTemplate => "complex-template",
            Self::NoUserLinks => "no-user-links",
            Self::PlainFancySig => "plain-fancy-sig",
            Self::SigTooLong => "sig-too-long",
            Self::ImagesInSig => "images-in-sig",
            Self::TranscludedTemplates => "transcluded-templates",
            Self::SigTooLongPostSubst => "sig-too-long-post-subst",
            Self::LinkNameImpersonation => "link-name-impersonation",
            Self::UnescapedPipes => "unescaped-pipes",
            Self::ExternalLinks => "external-links",
            Self::LineBreaks => "line-breaks",
            Self::HorizontalRule => "horizontal-rule",
        }
    }

    /// Message key for the long-form explanation shown next to the code.
    pub fn help_key(self) -> String {
        format!("{}-help", self.as_str())
    }

    /// The check group that produces this error.
    pub fn group(self) -> Checks {
        match self {
            Self::Html5Misnesting
            | Self::MiscTidyReplacementIssues
            | Self::MisnestedTag
            | Self::MissingEndTag
            | Self::MultipleUnclosedFormattingTags
            | Self::ObsoleteTag
            | Self::ObsoleteFontTag
            | Self::SelfClosedTag
            | Self::StrippedTag
            | Self::TidyFontBug
            | Self::TidyWhitespaceBug
            | Self::WikilinkInExtlink
            | Self::MultiColonEscape
            | Self::InlineMediaCaption
            | Self::BogusImageOptions => Checks::LINT,
            Self::InterwikiUserLink | Self::LinkUsernameMismatch | Self::NoUserLinks => {
                Checks::LINKS
            }
            Self::NestedSubst | Self::ComplexTemplate => Checks::NESTED_SUBST,
            Self::PlainFancySig => Checks::FANCY,
            Self::SigTooLong => Checks::LENGTH,
            Self::ImagesInSig => Checks::IMAGES,
            Self::TranscludedTemplates => Checks::TRANSCLUSION,
            Self::SigTooLongPostSubst => Checks::SUBST_LENGTH,
            Self::LinkNameImpersonation => Checks::LINK_NAME,
            Self::UnescapedPipes => Checks::FREE_PIPES,
            Self::ExternalLinks => Checks::EXTLINKS,
            Self::LineBreaks => Checks::BREAKS,
            Self::HorizontalRule => Checks::HRULE,
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|error| error.as_str() == code)
    }

    /// Maps a linter diagnostic type onto its error, if the type is one we report.
    pub fn from_lint_type(lint_type: &str) -> Option<Self> {
        if lint_type == "multi-colon-escape" {
            return Some(Self::MultiColonEscape);
        }
        Self::from_code(lint_type).filter(|error| error.group() == Checks::LINT)
    }
}

impl fmt::Display for SigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SigError {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match Self::from_code(value) {
            Some(error) => Ok(error),
            None => bail!("unknown signature error code: {value}"),
        }
    }
}

impl Serialize for SigError {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for SigError {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let code = String::deserialize(deserializer)?;
        Self::from_code(&code)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown signature error code: {code}")))
    }
}

/// Per-site names the checks need, already normalized.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SiteData {
    pub user_namespace_names: BTreeSet<String>,
    pub user_talk_namespace_names: BTreeSet<String>,
    pub file_namespace_names: BTreeSet<String>,
    pub special_namespace_names: BTreeSet<String>,
    pub contribs_page_aliases: BTreeSet<String>,
    pub subst_aliases: Vec<String>,
    pub database_id: String,
    pub hostname: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct UserProps {
    pub nickname: String,
    pub fancysig: bool,
}

#[cfg(test)]
mod tests {
    use super::{Checks, SigError};

    #[test]
    fn presets_cover_expected_flags() {
        assert!(Checks::DEFAULT.contains(Checks::LINT | Checks::LINKS | Checks::FANCY));
        assert!(!Checks::DEFAULT.contains(Checks::IMAGES));
        assert!(!Checks::DEFAULT.intersects(Checks::OBSOLETE_TAG));
        assert!(Checks::EXTENDED.contains(Checks::HRULE | Checks::EXTLINKS));
        assert!(Checks::ALL.contains(Checks::DEFAULT | Checks::EXTENDED | Checks::OBSOLETE_TAG));
    }

    #[test]
    fn xor_and_difference_toggle_flags() {
        let without_lint = Checks::DEFAULT ^ Checks::LINT;
        assert!(!without_lint.contains(Checks::LINT));
        assert_eq!(without_lint ^ Checks::LINT, Checks::DEFAULT);
        assert_eq!(Checks::EXTENDED - Checks::LINT, Checks::EXTENDED);
    }

    #[test]
    fn parse_list_unions_names() {
        let checks = Checks::parse_list(&["Default", "images", "free-pipes"]).expect("parse");
        assert!(checks.contains(Checks::DEFAULT | Checks::IMAGES | Checks::FREE_PIPES));
        assert!(!checks.contains(Checks::HRULE));
        let error = Checks::parse_list(&["sparkles"]).expect_err("must fail");
        assert!(error.to_string().contains("unknown check: sparkles"));
    }

    #[test]
    fn flag_names_skip_presets() {
        assert_eq!(
            (Checks::LINT | Checks::HRULE).flag_names(),
            vec!["lint", "hrule"]
        );
    }

    #[test]
    fn error_codes_are_unique_and_parse_back() {
        for error in SigError::ALL {
            assert_eq!(SigError::from_code(error.as_str()), Some(error));
        }
        let mut codes = SigError::ALL.map(SigError::as_str).to_vec();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), SigError::ALL.len());
    }

    #[test]
    fn lint_types_map_only_onto_lint_errors() {
        assert_eq!(
            SigError::from_lint_type("missing-end-tag"),
            Some(SigError::MissingEndTag)
        );
        assert_eq!(
            SigError::from_lint_type("multi-colon-escape"),
            Some(SigError::MultiColonEscape)
        );
        assert_eq!(SigError::from_lint_type("sig-too-long"), None);
        assert_eq!(SigError::from_lint_type("night-mode-unaware-background-color"), None);
    }

    #[test]
    fn errors_serialize_as_wire_codes() {
        let json = serde_json::to_string(&[SigError::NoUserLinks, SigError::MultiColonEscape])
            .expect("serialize");
        assert_eq!(json, r#"["no-user-links","lint/multi-colon-escape"]"#);
        let parsed: Vec<SigError> = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(parsed, vec![SigError::NoUserLinks, SigError::MultiColonEscape]);
        assert_eq!(SigError::SigTooLong.group(), Checks::LENGTH);
        assert_eq!(SigError::SigTooLong.help_key(), "sig-too-long-help");
    }
}
