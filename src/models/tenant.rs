use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Registry status of a tenant. Only `active` tenants may be connected to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum TenantStatus {
    Active,
    Inactive,
    Other(String),
}

impl TenantStatus {
    pub fn is_active(&self) -> bool {
        matches!(self, TenantStatus::Active)
    }

    pub fn as_str(&self) -> &str {
        match self {
            TenantStatus::Active => "active",
            TenantStatus::Inactive => "inactive",
            TenantStatus::Other(s) => s,
        }
    }
}

impl From<String> for TenantStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "active" => TenantStatus::Active,
            "inactive" => TenantStatus::Inactive,
            _ => TenantStatus::Other(s),
        }
    }
}

impl From<TenantStatus> for String {
    fn from(status: TenantStatus) -> Self {
        status.as_str().to_owned()
    }
}

impl fmt::Display for TenantStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of the control database's `tenants` registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct TenantRecord {
    pub id: String,
    pub name: String,
    pub slug: String,
    pub database_name: String,
    pub node_number: i32,
    #[sqlx(try_from = "String")]
    pub status: TenantStatus,
}

/// Step reached by a provisioning run, journaled in `tenant_provisioning`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProvisioningState {
    Creating,
    Migrating,
    Ready,
    Failed,
}

impl ProvisioningState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProvisioningState::Creating => "creating",
            ProvisioningState::Migrating => "migrating",
            ProvisioningState::Ready => "ready",
            ProvisioningState::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown provisioning state: {0}")]
pub struct UnknownProvisioningState(pub String);

impl TryFrom<String> for ProvisioningState {
    type Error = UnknownProvisioningState;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.as_str() {
            "creating" => Ok(ProvisioningState::Creating),
            "migrating" => Ok(ProvisioningState::Migrating),
            "ready" => Ok(ProvisioningState::Ready),
            "failed" => Ok(ProvisioningState::Failed),
            _ => Err(UnknownProvisioningState(s)),
        }
    }
}

impl fmt::Display for ProvisioningState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct ProvisioningRecord {
    pub tenant_id: String,
    pub database_name: String,
    #[sqlx(try_from = "String")]
    pub state: ProvisioningState,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl ProvisioningRecord {
    pub fn new(tenant_id: &str, database_name: &str, state: ProvisioningState) -> Self {
        Self {
            tenant_id: tenant_id.to_owned(),
            database_name: database_name.to_owned(),
            state,
            last_error: None,
            updated_at: Utc::now(),
        }
    }

    pub fn failed(mut self, error: impl fmt::Display) -> Self {
        self.state = ProvisioningState::Failed;
        self.with_error(error)
    }

    /// Records `error` without changing the state.
    pub fn with_error(mut self, error: impl fmt::Display) -> Self {
        self.last_error = Some(error.to_string());
        self.updated_at = Utc::now();
        self
    }
}
