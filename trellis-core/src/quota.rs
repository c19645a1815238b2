//! Per-org repository size limits

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{Error, Result};

const GIB: u64 = 1024 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Plan {
    FreeTrial,
    Small,
    Medium,
    Large,
}

impl Plan {
    pub fn max_repo_bytes(self) -> u64 {
        match self {
            Plan::FreeTrial => GIB,
            Plan::Small => 50 * GIB,
            Plan::Medium => 200 * GIB,
            Plan::Large => 1000 * GIB,
        }
    }
}

/// The size limit applied to one repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RepoQuota {
    pub max_bytes: u64,
}

impl RepoQuota {
    pub fn new(max_bytes: u64) -> Self {
        Self { max_bytes }
    }

    pub fn ensure_allowed(&self, size: u64) -> Result<()> {
        if size > self.max_bytes {
            return Err(Error::QuotaExceeded {
                max_bytes: self.max_bytes,
            });
        }
        Ok(())
    }
}

/// Which plan each org is on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaPolicy {
    pub default_plan: Plan,
    /// Overrides every plan when set
    pub max_repo_bytes: Option<u64>,
    pub org_plans: HashMap<String, Plan>,
}

impl Default for QuotaPolicy {
    fn default() -> Self {
        Self {
            default_plan: Plan::FreeTrial,
            max_repo_bytes: None,
            org_plans: HashMap::new(),
        }
    }
}

impl QuotaPolicy {
    /// Policy with a single fixed limit for everyone.
    pub fn fixed(max_bytes: u64) -> Self {
        Self {
            max_repo_bytes: Some(max_bytes),
            ..Self::default()
        }
    }

    pub fn quota_for(&self, org: &str) -> RepoQuota {
        if let Some(max) = self.max_repo_bytes {
            return RepoQuota::new(max);
        }
        let plan = self.org_plans.get(org).copied().unwrap_or(self.default_plan);
        RepoQuota::new(plan.max_repo_bytes())
    }
}
