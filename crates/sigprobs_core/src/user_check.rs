use std::collections::BTreeSet;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::api::SiteApi;
use crate::error::SigprobsError;
use crate::model::{SigError, SiteData};
use crate::replica::{Replica, ReplicaFirst};
use crate::suite::{CheckOptions, check_signature};

const INVALID_USERNAME_CHARS: [char; 9] = ['#', '<', '>', '[', ']', '|', '{', '}', '/'];

pub fn validate_username(username: &str) -> Result<(), SigprobsError> {
    if username.trim().is_empty() || username.contains(INVALID_USERNAME_CHARS) {
        return Err(SigprobsError::InvalidUsername(username.to_string()));
    }
    Ok(())
}

/// How the checked signature was chosen, or why nothing was checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UserNotice {
    DefaultSig,
    NoErrors,
    SigNotFancy,
    UserDoesNotExist,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserCheck {
    pub site: String,
    pub username: String,
    pub signature: String,
    pub errors: BTreeSet<SigError>,
    pub notices: Vec<UserNotice>,
    /// Set when the user could not be checked at all.
    pub failure: bool,
}

/// The site's `MediaWiki:Signature` with `$1` and `$2` filled in.
pub fn default_signature<A: SiteApi + ?Sized>(
    api: &mut A,
    username: &str,
    nickname: &str,
) -> Result<String> {
    let template = api.signature_template()?;
    Ok(template.replace("$1", username).replace("$2", nickname))
}

/// Checks one user. Without an explicit signature the stored preference is
/// read from the replica, falling back to the site default where the user
/// has no custom signature.
pub fn check_user<A: SiteApi + ?Sized>(
    api: &mut A,
    replica: Option<&Replica>,
    site: &SiteData,
    username: &str,
    signature: Option<&str>,
    options: &CheckOptions,
) -> Result<UserCheck> {
    validate_username(username)?;
    let mut api = ReplicaFirst::new(api, replica);
    let mut check = UserCheck {
        site: site.hostname.clone(),
        username: username.to_string(),
        signature: String::new(),
        errors: BTreeSet::new(),
        notices: Vec::new(),
        failure: false,
    };

    check.signature = match signature.filter(|sig| !sig.is_empty()) {
        Some(sig) => sig.to_string(),
        None => {
            let replica = replica.ok_or(SigprobsError::ReplicaRequired)?;
            let props = replica.user_properties(username)?;
            if props.nickname.is_empty() {
                if !api.user_exists(username)? {
                    debug!(username, host = %site.hostname, "user does not exist");
                    check.notices.push(UserNotice::UserDoesNotExist);
                    check.failure = true;
                    return Ok(check);
                }
                check.notices.push(UserNotice::DefaultSig);
                default_signature(&mut api, username, username)?
            } else if !props.fancysig {
                check.notices.push(UserNotice::SigNotFancy);
                default_signature(&mut api, username, &props.nickname)?
            } else {
                props.nickname
            }
        }
    };

    check.errors = check_signature(&mut api, site, username, &check.signature, options)?;
    if check.errors.is_empty() {
        check.notices.push(UserNotice::NoErrors);
    }
    Ok(check)
}
