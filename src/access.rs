//! Project-level authorization seam
//!
//! The bus never decides on its own who may address which project. Before a
//! device is registered or a command is dispatched it asks an
//! [`AccessPolicy`]; a `false` answer is a rejection, not a retryable failure.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Role {
    User,
    Admin,
    Operator,
    Researcher,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Role::User => "USER",
            Role::Admin => "ADMIN",
            Role::Operator => "OPERATOR",
            Role::Researcher => "RESEARCHER",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "USER" => Ok(Role::User),
            "ADMIN" => Ok(Role::Admin),
            "OPERATOR" => Ok(Role::Operator),
            "RESEARCHER" => Ok(Role::Researcher),
            other => Err(format!("unknown role '{}'", other)),
        }
    }
}

/// External permission check consumed by the bus
pub trait AccessPolicy: Send + Sync {
    fn has_project_access(&self, role: Role, project_code: &str) -> bool;
}

/// Grants everything. Meant for local tooling and tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl AccessPolicy for AllowAll {
    fn has_project_access(&self, _role: Role, _project_code: &str) -> bool {
        true
    }
}

/// Static role table per project code. Projects missing from the table are
/// denied for every role.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProjectPermissions {
    projects: HashMap<String, Vec<Role>>,
}

impl ProjectPermissions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allow(mut self, project_code: impl Into<String>, roles: &[Role]) -> Self {
        self.projects.insert(project_code.into(), roles.to_vec());
        self
    }

    /// Role table for the thirteen ventures of the ecosystem.
    pub fn ecosystem_defaults() -> Self {
        use Role::*;
        Self::new()
            .allow("P01_FOAM_HOMES", &[User, Admin, Operator])
            .allow("P02_SYMBIOSIS", &[User, Admin, Researcher])
            .allow("P03_FARM", &[User, Admin, Operator])
            .allow("P04_HEMP_LAB", &[Admin, Researcher])
            .allow("P05_GREENHOUSE", &[User, Admin, Researcher])
            .allow("P06_REACTOR", &[Admin, Researcher])
            .allow("P07_BIOREACTOR", &[Admin, Operator, Researcher])
            .allow("P08_BULB", &[User, Admin, Operator])
            .allow("P09_AWG", &[User, Admin, Operator])
            .allow("P10_GEOTHERMAL", &[User, Admin, Operator])
            .allow("P11_RESERVED", &[Admin])
            .allow("P12_SOLAR", &[User, Admin, Operator])
            .allow("P13_HYDRO", &[User, Admin, Operator])
    }

    pub fn project_codes(&self) -> impl Iterator<Item = &str> {
        self.projects.keys().map(String::as_str)
    }
}

impl AccessPolicy for ProjectPermissions {
    fn has_project_access(&self, role: Role, project_code: &str) -> bool {
        self.projects
            .get(project_code)
            .map(|roles| roles.contains(&role))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_cover_thirteen_projects() {
        assert_eq!(ProjectPermissions::ecosystem_defaults().project_codes().count(), 13);
    }

    #[test]
    fn test_role_table() {
        let perms = ProjectPermissions::ecosystem_defaults();
        assert!(perms.has_project_access(Role::Operator, "P08_BULB"));
        assert!(!perms.has_project_access(Role::Researcher, "P08_BULB"));
        assert!(perms.has_project_access(Role::Researcher, "P04_HEMP_LAB"));
        assert!(!perms.has_project_access(Role::User, "P11_RESERVED"));
        assert!(perms.has_project_access(Role::Admin, "P11_RESERVED"));
    }

    #[test]
    fn test_unknown_project_denied() {
        let perms = ProjectPermissions::ecosystem_defaults();
        assert!(!perms.has_project_access(Role::Admin, "P99_NOPE"));
    }

    #[test]
    fn test_role_parsing() {
        assert_eq!("operator".parse::<Role>(), Ok(Role::Operator));
        assert_eq!("ADMIN".parse::<Role>(), Ok(Role::Admin));
        assert!("root".parse::<Role>().is_err());
    }

    #[test]
    fn test_permissions_from_toml() {
        let perms: ProjectPermissions = toml::from_str(
            r#"
            [projects]
            P13_HYDRO = ["OPERATOR"]
            "#,
        )
        .unwrap();
        assert!(perms.has_project_access(Role::Operator, "P13_HYDRO"));
        assert!(!perms.has_project_access(Role::User, "P13_HYDRO"));
    }
}
