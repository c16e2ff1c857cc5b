//! resource patterns and abilities for session scoping

use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// abilities a session credential can grant
///
/// closed set: anything else on the wire is rejected at parse time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Ability {
    /// sign with a managed key
    PkpSigning,
    /// execute remote code on the node network
    ActionExecution,
}

impl Ability {
    /// uri scheme the resource pattern is matched under
    pub fn resource_scheme(&self) -> &'static str {
        match self {
            Ability::PkpSigning => "pkp",
            Ability::ActionExecution => "action",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Ability::PkpSigning => "pkp-signing",
            Ability::ActionExecution => "action-execution",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pkp-signing" => Ok(Ability::PkpSigning),
            "action-execution" => Ok(Ability::ActionExecution),
            other => Err(Error::InvalidScopeRequest(format!("unknown ability: {other}"))),
        }
    }
}

/// one (resource pattern, ability) pair requested for a session
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceAbilityRequest {
    /// resource pattern, `*` for all resources of the ability's scheme
    pub resource: String,
    pub ability: Ability,
}

impl ResourceAbilityRequest {
    pub fn new(resource: impl Into<String>, ability: Ability) -> Result<Self> {
        let resource = resource.into();
        if resource.is_empty() {
            return Err(Error::InvalidScopeRequest("empty resource pattern".into()));
        }
        Ok(Self { resource, ability })
    }

    /// wildcard request over every resource of the ability
    pub fn any(ability: Ability) -> Self {
        Self { resource: "*".into(), ability }
    }

    /// capability line embedded in the sign-in message recap
    pub fn recap_line(&self) -> String {
        format!(
            "{}://{}: {}",
            self.ability.resource_scheme(),
            self.resource,
            self.ability.as_str()
        )
    }
}

/// validate a requested scope set: non-empty, no duplicates
pub fn validate_requests(requests: &[ResourceAbilityRequest]) -> Result<()> {
    if requests.is_empty() {
        return Err(Error::InvalidScopeRequest("empty ability request set".into()));
    }
    for (i, req) in requests.iter().enumerate() {
        if req.resource.is_empty() {
            return Err(Error::InvalidScopeRequest("empty resource pattern".into()));
        }
        if requests[..i].contains(req) {
            return Err(Error::InvalidScopeRequest(format!(
                "duplicate request for {}",
                req.recap_line()
            )));
        }
    }
    Ok(())
}

/// true when every granted entry also appears in the requested set
pub fn is_subset(granted: &[ResourceAbilityRequest], requested: &[ResourceAbilityRequest]) -> bool {
    granted.iter().all(|g| requested.contains(g))
}
