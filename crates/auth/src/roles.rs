use serde::{Deserialize, Serialize};

/// Organization role of a user, ordered from most to least privileged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    SuperAdmin,
    Admin,
    Manager,
    User,
    Viewer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    ManageTeam,
    ManageBilling,
    ManageApiKeys,
    ManageOrganization,
    ManageBudgets,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::SuperAdmin => "SUPER_ADMIN",
            Role::Admin => "ADMIN",
            Role::Manager => "MANAGER",
            Role::User => "USER",
            Role::Viewer => "VIEWER",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "SUPER_ADMIN" => Some(Role::SuperAdmin),
            "ADMIN" => Some(Role::Admin),
            "MANAGER" => Some(Role::Manager),
            "USER" => Some(Role::User),
            "VIEWER" => Some(Role::Viewer),
            _ => None,
        }
    }

    pub fn can(&self, permission: Permission) -> bool {
        match permission {
            Permission::ManageTeam => {
                matches!(self, Role::SuperAdmin | Role::Admin | Role::Manager)
            }
            Permission::ManageBilling | Permission::ManageOrganization => {
                matches!(self, Role::Admin)
            }
            Permission::ManageBudgets => matches!(self, Role::Admin | Role::Manager),
            Permission::ManageApiKeys => !matches!(self, Role::Viewer),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_round_trips_through_storage_form() {
        for role in [Role::SuperAdmin, Role::Admin, Role::Manager, Role::User, Role::Viewer] {
            assert_eq!(Role::parse(role.as_str()), Some(role));
        }
        assert_eq!(Role::parse("OWNER"), None);
    }

    #[test]
    fn permissions_follow_role_hierarchy() {
        assert!(Role::Manager.can(Permission::ManageTeam));
        assert!(!Role::User.can(Permission::ManageTeam));
        assert!(Role::Admin.can(Permission::ManageBilling));
        assert!(!Role::SuperAdmin.can(Permission::ManageBilling));
        assert!(Role::User.can(Permission::ManageApiKeys));
        assert!(!Role::Viewer.can(Permission::ManageApiKeys));
        assert!(!Role::Manager.can(Permission::ManageOrganization));
        assert!(Role::Manager.can(Permission::ManageBudgets));
        assert!(!Role::User.can(Permission::ManageBudgets));
        assert!(!Role::SuperAdmin.can(Permission::ManageBudgets));
    }
}
