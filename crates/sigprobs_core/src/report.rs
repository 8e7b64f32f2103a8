use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result, bail};
use chrono::{NaiveDateTime, TimeDelta};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tempfile::NamedTempFile;

use crate::error::SigprobsError;
use crate::model::SigError;

pub const TOTAL_KEY: &str = "total";
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserResult {
    pub signature: String,
    pub errors: BTreeSet<SigError>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportMeta {
    pub last_update: String,
    pub site: String,
    pub active_since: String,
}

/// One site's audit: users with at least one problem, and how many users have each.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Report {
    pub errors: BTreeMap<String, usize>,
    pub meta: ReportMeta,
    pub sigs: BTreeMap<String, UserResult>,
}

impl Report {
    pub fn new(meta: ReportMeta, sigs: BTreeMap<String, UserResult>) -> Self {
        let mut report = Self {
            errors: BTreeMap::new(),
            meta,
            sigs,
        };
        report.recount();
        report
    }

    /// Rebuilds `errors` from `sigs`: one count per affected user per code,
    /// plus `total` users with any problem.
    pub fn recount(&mut self) {
        self.errors = count_errors(&self.sigs);
    }

    pub fn last_update(&self) -> Result<NaiveDateTime> {
        parse_timestamp(&self.meta.last_update)
    }

    /// Codes present in the report, `total` excluded.
    pub fn error_codes(&self) -> Vec<&str> {
        self.errors
            .keys()
            .map(String::as_str)
            .filter(|code| *code != TOTAL_KEY)
            .collect()
    }
}

pub fn count_errors(sigs: &BTreeMap<String, UserResult>) -> BTreeMap<String, usize> {
    let mut counts = BTreeMap::new();
    counts.insert(TOTAL_KEY.to_string(), 0);
    for result in sigs.values() {
        if result.errors.is_empty() {
            continue;
        }
        *counts.entry(TOTAL_KEY.to_string()).or_insert(0) += 1;
        for error in &result.errors {
            *counts.entry(error.as_str().to_string()).or_insert(0) += 1;
        }
    }
    counts
}

pub fn format_timestamp(value: &NaiveDateTime) -> String {
    value.format(TIMESTAMP_FORMAT).to_string()
}

pub fn parse_timestamp(value: &str) -> Result<NaiveDateTime> {
    NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f")
        .with_context(|| format!("invalid report timestamp: {value}"))
}

/// Whether the report is at least `max_age` old at `now`.
pub fn is_stale(report: &Report, now: NaiveDateTime, max_age: TimeDelta) -> Result<bool> {
    Ok(now - report.last_update()? >= max_age)
}

pub fn default_max_age() -> TimeDelta {
    TimeDelta::days(1)
}

pub fn report_path(data_dir: &Path, site: &str) -> PathBuf {
    data_dir.join(format!("{site}.json"))
}

/// Writes the report to stdout (`-`), to `<dir>/<hostname>.json` when `output` is
/// a directory or has no `.json` extension, or else to `output` itself.
/// Returns the written path, if any.
pub fn write_report(
    output: &Path,
    hostname: &str,
    report: &Report,
    overwrite: bool,
) -> Result<Option<PathBuf>> {
    let body = serde_json::to_string_pretty(report).context("failed to serialize report")?;
    if output == Path::new("-") {
        let mut stdout = io::stdout().lock();
        writeln!(stdout, "{body}").context("failed to write report to stdout")?;
        return Ok(None);
    }

    let is_file_target =
        !output.is_dir() && output.extension().is_some_and(|extension| extension == "json");
    let path = if is_file_target {
        output.to_path_buf()
    } else {
        fs::create_dir_all(output)
            .with_context(|| format!("failed to create {}", output.display()))?;
        report_path(output, hostname)
    };
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent).with_context(|| format!("failed to create {}", parent.display()))?;

    // Same directory as the target, so persisting is a single rename.
    let mut staged = NamedTempFile::new_in(parent)
        .with_context(|| format!("failed to stage report in {}", parent.display()))?;
    staged
        .write_all(body.as_bytes())
        .and_then(|()| staged.as_file().sync_all())
        .with_context(|| format!("failed to write {}", staged.path().display()))?;
    let persisted = if overwrite {
        staged.persist(&path)
    } else {
        staged.persist_noclobber(&path)
    };
    persisted
        .map_err(|error| error.error)
        .with_context(|| format!("failed to create {}", path.display()))?;
    Ok(Some(path))
}

pub fn load_report(data_dir: &Path, site: &str) -> Result<Report> {
    let path = report_path(data_dir, site);
    if !path.is_file() {
        return Err(SigprobsError::ReportNotFound(site.to_string()).into());
    }
    let content =
        fs::read_to_string(&path).with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("failed to parse {}", path.display()))
}

pub fn list_report_sites(data_dir: &Path) -> Result<Vec<String>> {
    if !data_dir.exists() {
        return Ok(Vec::new());
    }
    let mut sites = Vec::new();
    for entry in fs::read_dir(data_dir)
        .with_context(|| format!("failed to read {}", data_dir.display()))?
    {
        let path = entry
            .with_context(|| format!("failed to read entry in {}", data_dir.display()))?
            .path();
        if path.extension().is_some_and(|extension| extension == "json")
            && let Some(stem) = path.file_stem().and_then(|stem| stem.to_str())
        {
            sites.push(stem.to_string());
        }
    }
    sites.sort();
    Ok(sites)
}

/// Users grouped under each code the report counts.
pub fn errors_by_type(report: &Report) -> BTreeMap<String, Vec<String>> {
    report
        .error_codes()
        .into_iter()
        .map(|code| {
            let users = report
                .sigs
                .iter()
                .filter(|(_, result)| result.errors.iter().any(|error| error.as_str() == code))
                .map(|(user, _)| user.clone())
                .collect();
            (code.to_string(), users)
        })
        .collect()
}

/// Users with `code`, sorted, minus `exclude`.
pub fn users_with_error(report: &Report, code: &str, exclude: &BTreeSet<String>) -> Result<Vec<String>> {
    let error = SigError::from_code(code)
        .ok_or_else(|| anyhow::anyhow!("unknown error code: {code}"))?;
    Ok(report
        .sigs
        .iter()
        .filter(|(user, result)| result.errors.contains(&error) && !exclude.contains(*user))
        .map(|(user, _)| user.clone())
        .collect())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ListFormat {
    #[default]
    Json,
    Plain,
    MassMessage,
    Target,
}

impl ListFormat {
    pub const NAMES: [&'static str; 4] = ["json", "plain", "massmessage", "target"];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Plain => "plain",
            Self::MassMessage => "massmessage",
            Self::Target => "target",
        }
    }
}

impl fmt::Display for ListFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ListFormat {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "plain" => Ok(Self::Plain),
            "massmessage" => Ok(Self::MassMessage),
            "target" => Ok(Self::Target),
            other => bail!(
                "unknown format: {other} (expected one of {})",
                Self::NAMES.join(", ")
            ),
        }
    }
}

/// Renders a single-error user list. `json` carries the report meta along.
pub fn render_user_list(
    report: &Report,
    code: &str,
    users: &[String],
    format: ListFormat,
) -> Result<String> {
    let site = &report.meta.site;
    let rendered = match format {
        ListFormat::Json => {
            let mut meta = serde_json::to_value(&report.meta).context("failed to encode meta")?;
            meta["error"] = json!(code);
            serde_json::to_string_pretty(&json!({ "errors": users, "meta": meta }))
                .context("failed to encode user list")?
        }
        ListFormat::Plain => users.join("\n"),
        ListFormat::MassMessage => users
            .iter()
            .map(|user| format!("User talk:{user}@{site}"))
            .collect::<Vec<_>>()
            .join("\n"),
        ListFormat::Target => users
            .iter()
            .map(|user| format!("# {{{{#target:User talk:{user}}}}}"))
            .collect::<Vec<_>>()
            .join("\n"),
    };
    Ok(rendered)
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, BTreeSet};
    use std::fs;

    use chrono::{NaiveDate, TimeDelta};
    use tempfile::tempdir;

    use super::*;
    use crate::error::SigprobsError;
    use crate::model::SigError;

    fn sample_report() -> Report {
        let mut sigs = BTreeMap::new();
        sigs.insert(
            "Zed".to_string(),
            UserResult {
                signature: "[[User:Other|Zed]]".to_string(),
                errors: BTreeSet::from([SigError::LinkUsernameMismatch]),
            },
        );
        sigs.insert(
            "Amy".to_string(),
            UserResult {
                signature: "Amy".to_string(),
                errors: BTreeSet::from([SigError::PlainFancySig]),
            },
        );
        sigs.insert(
            "Max".to_string(),
            UserResult {
                signature: "<b>[[User:Other|Max]]".to_string(),
                errors: BTreeSet::from([SigError::LinkUsernameMismatch, SigError::MissingEndTag]),
            },
        );
        Report::new(
            ReportMeta {
                last_update: "2026-10-01T12:00:00".to_string(),
                site: "en.wikipedia.org".to_string(),
                active_since: "2026-09-01T12:00:00".to_string(),
            },
            sigs,
        )
    }

    #[test]
    fn counts_are_per_user() {
        let report = sample_report();
        assert_eq!(report.errors.get(TOTAL_KEY), Some(&3));
        assert_eq!(report.errors.get("link-username-mismatch"), Some(&2));
        assert_eq!(report.errors.get("missing-end-tag"), Some(&1));
        assert_eq!(report.errors.get("plain-fancy-sig"), Some(&1));
        assert_eq!(report.errors.len(), 4);
    }

    #[test]
    fn report_json_reloads_with_the_same_counts() {
        let temp = tempdir().expect("tempdir");
        let report = sample_report();
        let path = write_report(temp.path(), "en.wikipedia.org", &report, true)
            .expect("write")
            .expect("path");
        assert_eq!(path, temp.path().join("en.wikipedia.org.json"));

        let raw = fs::read_to_string(&path).expect("read");
        let users = raw.find("\"Amy\"").expect("amy") < raw.find("\"Max\"").expect("max")
            && raw.find("\"Max\"").expect("max") < raw.find("\"Zed\"").expect("zed");
        assert!(users, "sigs must be sorted by username");

        let mut reloaded = load_report(temp.path(), "en.wikipedia.org").expect("load");
        assert_eq!(reloaded, report);
        let stored = reloaded.errors.clone();
        reloaded.recount();
        assert_eq!(reloaded.errors, stored);
    }

    #[test]
    fn wire_format_uses_error_codes() {
        let report = sample_report();
        let value = serde_json::to_value(&report).expect("encode");
        assert_eq!(value["sigs"]["Max"]["errors"][1], "link-username-mismatch");
        assert_eq!(value["sigs"]["Max"]["errors"][0], "missing-end-tag");
        assert_eq!(value["meta"]["site"], "en.wikipedia.org");
        assert_eq!(value["errors"]["total"], 3);
    }

    #[test]
    fn no_overwrite_refuses_existing_files() {
        let temp = tempdir().expect("tempdir");
        let target = temp.path().join("custom.json");
        let report = sample_report();
        write_report(&target, "en.wikipedia.org", &report, false).expect("first write");
        let error = write_report(&target, "en.wikipedia.org", &report, false)
            .expect_err("must fail");
        assert!(error.to_string().contains("failed to create"));
        write_report(&target, "en.wikipedia.org", &report, true).expect("overwrite");
    }

    #[test]
    fn overwrite_replaces_the_whole_artifact() {
        let temp = tempdir().expect("tempdir");
        let target = temp.path().join("en.wikipedia.org.json");
        fs::write(&target, "x".repeat(64 * 1024)).expect("seed old artifact");

        let report = sample_report();
        write_report(temp.path(), "en.wikipedia.org", &report, true).expect("overwrite");

        let raw = fs::read_to_string(&target).expect("read");
        let reloaded: Report = serde_json::from_str(&raw).expect("valid json");
        assert_eq!(reloaded, report);
        let entries = fs::read_dir(temp.path())
            .expect("list")
            .map(|entry| entry.expect("entry").file_name())
            .collect::<Vec<_>>();
        assert_eq!(entries, vec![std::ffi::OsString::from("en.wikipedia.org.json")]);
    }

    #[test]
    fn missing_directory_output_is_created() {
        let temp = tempdir().expect("tempdir");
        let dir = temp.path().join("reports");
        let path = write_report(&dir, "de.wikipedia.org", &sample_report(), true)
            .expect("write")
            .expect("path");
        assert_eq!(path, dir.join("de.wikipedia.org.json"));
        assert_eq!(
            list_report_sites(&dir).expect("list"),
            vec!["de.wikipedia.org".to_string()]
        );
    }

    #[test]
    fn missing_report_is_not_found() {
        let temp = tempdir().expect("tempdir");
        let error = load_report(temp.path(), "xx.wikipedia.org").expect_err("must fail");
        assert!(matches!(
            error.downcast_ref::<SigprobsError>(),
            Some(SigprobsError::ReportNotFound(site)) if site == "xx.wikipedia.org"
        ));
        assert!(list_report_sites(&temp.path().join("absent")).expect("list").is_empty());
    }

    #[test]
    fn grouping_by_error() {
        let grouped = errors_by_type(&sample_report());
        assert_eq!(grouped.len(), 3);
        assert_eq!(
            grouped.get("link-username-mismatch"),
            Some(&vec!["Max".to_string(), "Zed".to_string()])
        );
        assert!(!grouped.contains_key(TOTAL_KEY));
    }

    #[test]
    fn single_error_lists_and_formats() {
        let report = sample_report();
        let exclude = BTreeSet::from(["Zed".to_string()]);
        let users = users_with_error(&report, "link-username-mismatch", &exclude).expect("users");
        assert_eq!(users, vec!["Max".to_string()]);

        assert_eq!(
            render_user_list(&report, "link-username-mismatch", &users, ListFormat::MassMessage)
                .expect("render"),
            "User talk:Max@en.wikipedia.org"
        );
        assert_eq!(
            render_user_list(&report, "link-username-mismatch", &users, ListFormat::Target)
                .expect("render"),
            "# {{#target:User talk:Max}}"
        );
        let json = render_user_list(&report, "link-username-mismatch", &users, ListFormat::Json)
            .expect("render");
        let value: serde_json::Value = serde_json::from_str(&json).expect("json");
        assert_eq!(value["meta"]["error"], "link-username-mismatch");
        assert_eq!(value["errors"][0], "Max");

        let error = users_with_error(&report, "sparkles", &BTreeSet::new()).expect_err("must fail");
        assert!(error.to_string().contains("unknown error code"));
        assert_eq!("MassMessage".parse::<ListFormat>().expect("parse"), ListFormat::MassMessage);
        assert!("yaml".parse::<ListFormat>().is_err());
    }

    #[test]
    fn staleness_uses_last_update() {
        let report = sample_report();
        let fresh = NaiveDate::from_ymd_opt(2026, 10, 2)
            .and_then(|date| date.and_hms_opt(11, 0, 0))
            .expect("date");
        let stale = NaiveDate::from_ymd_opt(2026, 10, 2)
            .and_then(|date| date.and_hms_opt(12, 0, 0))
            .expect("date");
        assert!(!is_stale(&report, fresh, default_max_age()).expect("stale"));
        assert!(is_stale(&report, stale, default_max_age()).expect("stale"));
        assert!(is_stale(&report, fresh, TimeDelta::hours(1)).expect("stale"));

        let mut fractional = report.clone();
        fractional.meta.last_update = "2026-10-01T12:00:00.123456".to_string();
        assert!(!is_stale(&fractional, fresh, default_max_age()).expect("stale"));
    }
}
