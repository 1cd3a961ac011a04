//! Permissions and principals.
//!
//! Permissions are registered into a [`PermissionCatalog`] during startup and
//! the catalog is then sealed. Checks only ever run against a sealed catalog,
//! so there is no window in which a permission is consulted before it exists.

use crate::types::RunId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use tracing::warn;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Permission {
    /// Replay a run with edited scripts. Checked against the run.
    Replay,
    /// Run scripts outside the sandbox. Checked globally.
    RunScripts,
    /// Change a job's configuration. Implies [`Permission::Replay`].
    Configure,
}

impl Permission {
    pub fn name(&self) -> &'static str {
        match self {
            Permission::Replay => "Run.Replay",
            Permission::RunScripts => "Overall.RunScripts",
            Permission::Configure => "Job.Configure",
        }
    }

    /// The broader permission that grants this one as well.
    pub fn implied_by(&self) -> Option<Permission> {
        match self {
            Permission::Replay => Some(Permission::Configure),
            Permission::RunScripts | Permission::Configure => None,
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ─── Catalog & startup barrier ────────────────────────────────

/// Mutable registry used while the process starts up.
#[derive(Debug, Default)]
pub struct PermissionCatalog {
    registered: BTreeSet<Permission>,
}

impl PermissionCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog with every permission this crate checks.
    pub fn standard() -> Self {
        Self::new()
            .register(Permission::Configure)
            .register(Permission::Replay)
            .register(Permission::RunScripts)
    }

    pub fn register(mut self, permission: Permission) -> Self {
        self.registered.insert(permission);
        self
    }

    /// Close registration. Only sealed catalogs can back a permission check.
    pub fn seal(self) -> SealedPermissions {
        SealedPermissions {
            registered: self.registered,
        }
    }
}

/// Registration is complete; the permission set is fixed.
#[derive(Debug, Clone)]
pub struct SealedPermissions {
    registered: BTreeSet<Permission>,
}

impl SealedPermissions {
    pub fn contains(&self, permission: Permission) -> bool {
        self.registered.contains(&permission)
    }
}

// ─── Principal ────────────────────────────────────────────────

/// The caller a permission is checked for. Always passed explicitly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub actor_id: String,
    pub roles: Vec<String>,
}

impl Principal {
    pub fn new(actor_id: impl Into<String>, roles: Vec<String>) -> Self {
        Self {
            actor_id: actor_id.into(),
            roles,
        }
    }
}

// ─── Checks ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub enum PermissionTarget<'a> {
    Run(&'a RunId),
    Global,
}

pub trait PermissionCheck: Send + Sync {
    fn has_permission(
        &self,
        principal: &Principal,
        permission: Permission,
        target: PermissionTarget<'_>,
    ) -> bool;
}

/// Role-based grants held in memory.
///
/// A grant is either global or scoped to one job; a job-scoped grant covers
/// every run of that job. Holding the permission a check's permission is
/// implied by is as good as holding it directly.
pub struct MemoryPermissions {
    sealed: SealedPermissions,
    global: HashMap<String, HashSet<Permission>>,
    per_job: HashMap<(String, String), HashSet<Permission>>,
}

impl MemoryPermissions {
    pub fn new(sealed: SealedPermissions) -> Self {
        Self {
            sealed,
            global: HashMap::new(),
            per_job: HashMap::new(),
        }
    }

    pub fn grant(mut self, role: &str, permission: Permission) -> Self {
        self.global
            .entry(role.to_string())
            .or_default()
            .insert(permission);
        self
    }

    pub fn grant_on_job(mut self, role: &str, job: &str, permission: Permission) -> Self {
        self.per_job
            .entry((role.to_string(), job.to_string()))
            .or_default()
            .insert(permission);
        self
    }

    fn holds(
        &self,
        principal: &Principal,
        permission: Permission,
        target: PermissionTarget<'_>,
    ) -> bool {
        principal.roles.iter().any(|role| {
            let global = self
                .global
                .get(role)
                .is_some_and(|perms| perms.contains(&permission));
            let scoped = match target {
                PermissionTarget::Run(run) => self
                    .per_job
                    .get(&(role.clone(), run.job.clone()))
                    .is_some_and(|perms| perms.contains(&permission)),
                PermissionTarget::Global => false,
            };
            global || scoped
        })
    }
}

impl PermissionCheck for MemoryPermissions {
    fn has_permission(
        &self,
        principal: &Principal,
        permission: Permission,
        target: PermissionTarget<'_>,
    ) -> bool {
        if !self.sealed.contains(permission) {
            warn!(%permission, "check for unregistered permission denied");
            return false;
        }
        self.holds(principal, permission, target)
            || permission.implied_by().is_some_and(|broader| {
                self.sealed.contains(broader) && self.holds(principal, broader, target)
            })
    }
}
