use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{NaiveDateTime, TimeDelta};
use tracing::{debug, error, info};

use crate::api::SiteApi;
use crate::config::DEFAULT_LINT_BATCH_SIZE;
use crate::error::SigprobsError;
use crate::html;
use crate::lint::get_lint_errors;
use crate::model::{Checks, SigError, SiteData};
use crate::replica::{Replica, ReplicaFirst};
use crate::report::{Report, ReportMeta, TOTAL_KEY, UserResult, format_timestamp};
use crate::site::resolve_site;
use crate::subst::evaluate_subst;
use crate::suite::{CheckOptions, check_signature};

/// Timestamp layout of replica revision rows and `--since` arguments.
pub const REPLICA_TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M%S";

const LINT_SEPARATOR: &str = "\n\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityWindow {
    Days(u32),
    Since(NaiveDateTime),
}

impl ActivityWindow {
    pub fn start(&self, now: NaiveDateTime) -> NaiveDateTime {
        match self {
            Self::Days(days) => now - TimeDelta::days(i64::from(*days)),
            Self::Since(since) => *since,
        }
    }

    pub fn parse_since(value: &str) -> Result<Self> {
        let since = NaiveDateTime::parse_from_str(value.trim(), REPLICA_TIMESTAMP_FORMAT)
            .with_context(|| format!("invalid timestamp {value} (expected YYYYMMDDHHMMSS)"))?;
        Ok(Self::Since(since))
    }
}

/// Where the (user, signature) pairs of a report come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignatureInput {
    /// Every user with a custom signature who edited inside the window.
    Active(ActivityWindow),
    /// Named users; signatures are read from the replica.
    Users(Vec<String>),
    /// Signatures supplied directly.
    Signatures(BTreeMap<String, String>),
}

impl SignatureInput {
    fn needs_replica(&self) -> bool {
        !matches!(self, Self::Signatures(_))
    }
}

#[derive(Debug, Clone)]
pub struct BatchSettings {
    pub options: CheckOptions,
    pub lint_batch_size: usize,
    pub replica_dir: Option<PathBuf>,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            options: CheckOptions::default(),
            lint_batch_size: DEFAULT_LINT_BATCH_SIZE,
            replica_dir: None,
        }
    }
}

struct PendingLint {
    user: String,
    signature: String,
    expanded: String,
}

/// Queues expanded signatures and lints them together; only a batch with
/// findings is linted again one signature at a time.
pub struct LintBatch {
    pending: Vec<PendingLint>,
    size: usize,
    checks: Checks,
}

impl LintBatch {
    pub fn new(size: usize, checks: Checks) -> Self {
        let size = size.max(1);
        Self {
            pending: Vec::with_capacity(size),
            size,
            checks,
        }
    }

    pub fn push<A: SiteApi + ?Sized>(
        &mut self,
        api: &mut A,
        user: &str,
        signature: &str,
        expanded: String,
        results: &mut BTreeMap<String, UserResult>,
    ) -> Result<()> {
        self.pending.push(PendingLint {
            user: user.to_string(),
            signature: signature.to_string(),
            expanded,
        });
        if self.pending.len() >= self.size {
            self.flush(api, results)?;
        }
        Ok(())
    }

    pub fn flush<A: SiteApi + ?Sized>(
        &mut self,
        api: &mut A,
        results: &mut BTreeMap<String, UserResult>,
    ) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let pending = std::mem::take(&mut self.pending);
        let combined = pending
            .iter()
            .map(|item| item.expanded.as_str())
            .collect::<Vec<_>>()
            .join(LINT_SEPARATOR);
        let found = get_lint_errors(api, &combined, self.checks)?;
        info!(signatures = pending.len(), errors = found.len(), "linted signature batch");
        if found.is_empty() {
            return Ok(());
        }

        if let [only] = pending.as_slice() {
            merge(results, only, found);
            return Ok(());
        }
        for item in &pending {
            let errors = get_lint_errors(api, &item.expanded, self.checks)
                .inspect_err(|err| log_failure(&item.user, &item.signature, err))?;
            if !errors.is_empty() {
                debug!(user = %item.user, errors = errors.len(), "lint findings");
                merge(results, item, errors);
            }
        }
        Ok(())
    }
}

fn merge(
    results: &mut BTreeMap<String, UserResult>,
    item: &PendingLint,
    errors: impl IntoIterator<Item = SigError>,
) {
    results
        .entry(item.user.clone())
        .or_insert_with(|| UserResult {
            signature: item.signature.clone(),
            errors: Default::default(),
        })
        .errors
        .extend(errors);
}

fn log_failure(user: &str, signature: &str, err: &anyhow::Error) {
    error!(user, signature, error = %err, "signature check failed");
}

/// Checks every pair, deferring lint to batched calls. Users without any
/// problem are left out of the result.
pub fn audit_signatures<A, I>(
    api: &mut A,
    site: &SiteData,
    signatures: I,
    options: &CheckOptions,
    lint_batch_size: usize,
) -> Result<BTreeMap<String, UserResult>>
where
    A: SiteApi + ?Sized,
    I: IntoIterator<Item = Result<(String, String)>>,
{
    let lint = options.checks.contains(Checks::LINT);
    let deferred = options.without(Checks::LINT);
    let mut batch = LintBatch::new(lint_batch_size, options.checks);
    let mut results = BTreeMap::new();

    for pair in signatures {
        let (user, signature) = pair?;
        if signature.is_empty() {
            continue;
        }
        let errors = check_signature(api, site, &user, &signature, &deferred)
            .inspect_err(|err| log_failure(&user, &signature, err))?;
        let plain = errors.contains(&SigError::PlainFancySig);
        if !errors.is_empty() {
            results.insert(
                user.clone(),
                UserResult {
                    signature: signature.clone(),
                    errors,
                },
            );
        }
        if lint && !plain {
            let expanded = evaluate_subst(api, site, &html::unescape(&signature))
                .inspect_err(|err| log_failure(&user, &signature, err))?;
            batch.push(api, &user, &signature, expanded, &mut results)?;
        }
    }
    batch.flush(api, &mut results)?;
    Ok(results)
}

/// Audits one site and assembles its report.
pub fn run_report<A: SiteApi + ?Sized>(
    api: &mut A,
    hostname: &str,
    input: SignatureInput,
    settings: &BatchSettings,
    now: NaiveDateTime,
) -> Result<Report> {
    info!(host = hostname, "starting signature report");
    let site = resolve_site(api, hostname)?;
    let replica = Replica::open_optional(settings.replica_dir.as_deref(), &site.database_id)?;
    if input.needs_replica() && replica.is_none() {
        return Err(SigprobsError::ReplicaRequired.into());
    }

    let active_since = match &input {
        SignatureInput::Active(window) => window.start(now),
        _ => now,
    };
    let source: Box<dyn Iterator<Item = Result<(String, String)>> + '_> = match (input, &replica) {
        (SignatureInput::Active(window), Some(replica)) => {
            let since = window.start(now).format(REPLICA_TIMESTAMP_FORMAT).to_string();
            Box::new(
                replica
                    .active_signatures(&since)
                    .map(|row| row.map_err(anyhow::Error::from)),
            )
        }
        (SignatureInput::Users(users), Some(replica)) => Box::new(
            replica
                .listed_signatures(&users)?
                .into_iter()
                .map(Ok),
        ),
        (SignatureInput::Signatures(signatures), _) => Box::new(signatures.into_iter().map(Ok)),
        (_, None) => return Err(SigprobsError::ReplicaRequired.into()),
    };

    let mut api = ReplicaFirst::new(api, replica.as_ref());
    let sigs = audit_signatures(
        &mut api,
        &site,
        source,
        &settings.options,
        settings.lint_batch_size,
    )?;
    let report = Report::new(
        ReportMeta {
            last_update: format_timestamp(&now),
            site: hostname.to_string(),
            active_since: format_timestamp(&active_since),
        },
        sigs,
    );
    info!(
        host = hostname,
        total = report.errors.get(TOTAL_KEY).copied().unwrap_or(0),
        requests = api.request_count(),
        "signature report complete"
    );
    Ok(report)
}
