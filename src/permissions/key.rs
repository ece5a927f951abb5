//! Permission check value types and the request key codec
//!
//! A [`PermissionCheck`] is the question "may the current actor perform
//! `permission` on `resource_type`/`resource_identifier` within `scope`?".
//! [`canonicalize`] turns it into a [`CanonicalKey`], the identity used for
//! deduplication, batching and caching.

use crate::error::{PermissionError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Authorization boundary a check is evaluated against.
///
/// Blank optional identifiers are normalized to `None` on construction, so a
/// scope built with `org_id: Some("")` and one built without an org are the
/// same scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "ScopeRepr", rename_all = "camelCase")]
pub struct Scope {
    account_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    org_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    project_id: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScopeRepr {
    account_id: String,
    #[serde(default)]
    org_id: Option<String>,
    #[serde(default)]
    project_id: Option<String>,
}

impl From<ScopeRepr> for Scope {
    fn from(repr: ScopeRepr) -> Self {
        Self::new(repr.account_id, repr.org_id, repr.project_id)
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

impl Scope {
    /// Create a scope from its three identifiers
    pub fn new<S: Into<String>>(account_id: S, org_id: Option<String>, project_id: Option<String>) -> Self {
        Self {
            account_id: account_id.into(),
            org_id: non_blank(org_id),
            project_id: non_blank(project_id),
        }
    }

    /// Account-level scope
    pub fn account<S: Into<String>>(account_id: S) -> Self {
        Self::new(account_id, None, None)
    }

    /// Narrow the scope to an organization
    pub fn with_org<S: Into<String>>(mut self, org_id: S) -> Self {
        self.org_id = non_blank(Some(org_id.into()));
        self
    }

    /// Narrow the scope to a project
    pub fn with_project<S: Into<String>>(mut self, project_id: S) -> Self {
        self.project_id = non_blank(Some(project_id.into()));
        self
    }

    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    pub fn org_id(&self) -> Option<&str> {
        self.org_id.as_deref()
    }

    pub fn project_id(&self) -> Option<&str> {
        self.project_id.as_deref()
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "account={}", self.account_id)?;
        if let Some(org) = &self.org_id {
            write!(f, "/org={}", org)?;
        }
        if let Some(project) = &self.project_id {
            write!(f, "/project={}", project)?;
        }
        Ok(())
    }
}

/// Kinds of resources a permission can be checked on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResourceType {
    Account,
    Organization,
    Project,
    Pipeline,
    Service,
    Environment,
    Connector,
    Secret,
    Template,
    User,
    UserGroup,
    Role,
    ResourceGroup,
    ServiceAccount,
    Dashboard,
}

impl ResourceType {
    pub const ALL: [ResourceType; 15] = [
        ResourceType::Account,
        ResourceType::Organization,
        ResourceType::Project,
        ResourceType::Pipeline,
        ResourceType::Service,
        ResourceType::Environment,
        ResourceType::Connector,
        ResourceType::Secret,
        ResourceType::Template,
        ResourceType::User,
        ResourceType::UserGroup,
        ResourceType::Role,
        ResourceType::ResourceGroup,
        ResourceType::ServiceAccount,
        ResourceType::Dashboard,
    ];

    /// Wire identifier
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::Account => "ACCOUNT",
            ResourceType::Organization => "ORGANIZATION",
            ResourceType::Project => "PROJECT",
            ResourceType::Pipeline => "PIPELINE",
            ResourceType::Service => "SERVICE",
            ResourceType::Environment => "ENVIRONMENT",
            ResourceType::Connector => "CONNECTOR",
            ResourceType::Secret => "SECRET",
            ResourceType::Template => "TEMPLATE",
            ResourceType::User => "USER",
            ResourceType::UserGroup => "USER_GROUP",
            ResourceType::Role => "ROLE",
            ResourceType::ResourceGroup => "RESOURCE_GROUP",
            ResourceType::ServiceAccount => "SERVICE_ACCOUNT",
            ResourceType::Dashboard => "DASHBOARD",
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceType {
    type Err = PermissionError;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim();
        ResourceType::ALL
            .iter()
            .copied()
            .find(|rt| rt.as_str().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| PermissionError::validation(format!("unknown resource type '{}'", s)))
    }
}

/// Permission identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    View,
    Create,
    Edit,
    Delete,
    Execute,
    Access,
    Invite,
    Manage,
}

impl Permission {
    pub const ALL: [Permission; 8] = [
        Permission::View,
        Permission::Create,
        Permission::Edit,
        Permission::Delete,
        Permission::Execute,
        Permission::Access,
        Permission::Invite,
        Permission::Manage,
    ];

    /// Wire identifier
    pub fn as_str(&self) -> &'static str {
        match self {
            Permission::View => "view",
            Permission::Create => "create",
            Permission::Edit => "edit",
            Permission::Delete => "delete",
            Permission::Execute => "execute",
            Permission::Access => "access",
            Permission::Invite => "invite",
            Permission::Manage => "manage",
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Permission {
    type Err = PermissionError;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim();
        Permission::ALL
            .iter()
            .copied()
            .find(|p| p.as_str().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| PermissionError::validation(format!("unknown permission '{}'", s)))
    }
}

/// One authorization question
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawPermissionCheck", rename_all = "camelCase")]
pub struct PermissionCheck {
    scope: Scope,
    resource_type: ResourceType,
    #[serde(skip_serializing_if = "Option::is_none")]
    resource_identifier: Option<String>,
    permission: Permission,
}

impl PermissionCheck {
    /// Check on a resource type as a whole (no specific identifier)
    pub fn new(scope: Scope, resource_type: ResourceType, permission: Permission) -> Self {
        Self {
            scope,
            resource_type,
            resource_identifier: None,
            permission,
        }
    }

    /// Target a specific resource
    pub fn with_identifier<S: Into<String>>(mut self, identifier: S) -> Self {
        self.resource_identifier = non_blank(Some(identifier.into()));
        self
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    pub fn resource_type(&self) -> ResourceType {
        self.resource_type
    }

    pub fn resource_identifier(&self) -> Option<&str> {
        self.resource_identifier.as_deref()
    }

    pub fn permission(&self) -> Permission {
        self.permission
    }
}

/// String-typed check as it arrives from untyped sources (JSON, CLI args).
///
/// Converting into [`PermissionCheck`] is where unknown resource types and
/// permissions are rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawPermissionCheck {
    pub scope: Scope,
    pub resource_type: String,
    #[serde(default)]
    pub resource_identifier: Option<String>,
    pub permission: String,
}

impl TryFrom<RawPermissionCheck> for PermissionCheck {
    type Error = PermissionError;

    fn try_from(raw: RawPermissionCheck) -> Result<Self> {
        let resource_type: ResourceType = raw.resource_type.parse()?;
        let permission: Permission = raw.permission.parse()?;
        let check = PermissionCheck::new(raw.scope, resource_type, permission);
        Ok(match raw.resource_identifier {
            Some(identifier) => check.with_identifier(identifier),
            None => check,
        })
    }
}

/// Canonical identity of a [`PermissionCheck`]
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct CanonicalKey(String);

impl CanonicalKey {
    /// Build a key from the individual components of a check.
    ///
    /// Free-form identifiers are length-prefixed so that no identifier content
    /// can collide with the separators; absent values encode as `-`.
    pub fn from_parts(
        scope: &Scope,
        resource_type: ResourceType,
        resource_identifier: Option<&str>,
        permission: Permission,
    ) -> Self {
        let mut key = String::with_capacity(64);
        push_segment(&mut key, Some(scope.account_id()));
        key.push('|');
        push_segment(&mut key, scope.org_id());
        key.push('|');
        push_segment(&mut key, scope.project_id());
        key.push('|');
        key.push_str(resource_type.as_str());
        key.push('|');
        push_segment(&mut key, resource_identifier.filter(|id| !id.trim().is_empty()));
        key.push('|');
        key.push_str(permission.as_str());
        CanonicalKey(key)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn push_segment(key: &mut String, value: Option<&str>) {
    match value {
        Some(v) => {
            key.push_str(&v.len().to_string());
            key.push(':');
            key.push_str(v);
        }
        None => key.push('-'),
    }
}

impl fmt::Display for CanonicalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Derive the canonical key of a check. Pure and total.
pub fn canonicalize(check: &PermissionCheck) -> CanonicalKey {
    CanonicalKey::from_parts(
        &check.scope,
        check.resource_type,
        check.resource_identifier.as_deref(),
        check.permission,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn project_edit() -> PermissionCheck {
        PermissionCheck::new(Scope::account("a1"), ResourceType::Project, Permission::Edit).with_identifier("p1")
    }

    #[test]
    fn test_equal_checks_share_a_key() {
        assert_eq!(canonicalize(&project_edit()), canonicalize(&project_edit()));
    }

    #[test]
    fn test_blank_and_missing_scope_fields_match() {
        let omitted = Scope::account("a1");
        let blank = Scope::new("a1", Some(String::new()), Some("  ".to_string()));
        assert_eq!(omitted, blank);

        let a = PermissionCheck::new(omitted, ResourceType::Project, Permission::View);
        let b = PermissionCheck::new(blank, ResourceType::Project, Permission::View).with_identifier("");
        assert_eq!(canonicalize(&a), canonicalize(&b));
    }

    #[test]
    fn test_json_property_order_does_not_matter() {
        let first: PermissionCheck = serde_json::from_str(
            r#"{"scope":{"accountId":"a1","orgId":"o1"},"resourceType":"PROJECT","resourceIdentifier":"p1","permission":"edit"}"#,
        )
        .unwrap();
        let second: PermissionCheck = serde_json::from_str(
            r#"{"permission":"edit","resourceIdentifier":"p1","scope":{"orgId":"o1","projectId":null,"accountId":"a1"},"resourceType":"PROJECT"}"#,
        )
        .unwrap();
        assert_eq!(canonicalize(&first), canonicalize(&second));
    }

    #[test]
    fn test_distinct_questions_get_distinct_keys() {
        let base = project_edit();
        let other_permission =
            PermissionCheck::new(Scope::account("a1"), ResourceType::Project, Permission::Delete).with_identifier("p1");
        let other_scope =
            PermissionCheck::new(Scope::account("a1").with_org("o1"), ResourceType::Project, Permission::Edit)
                .with_identifier("p1");
        let no_identifier = PermissionCheck::new(Scope::account("a1"), ResourceType::Project, Permission::Edit);

        let key = canonicalize(&base);
        assert_ne!(key, canonicalize(&other_permission));
        assert_ne!(key, canonicalize(&other_scope));
        assert_ne!(key, canonicalize(&no_identifier));
    }

    #[test]
    fn test_separator_in_identifier_cannot_collide() {
        // org "x|1:y" with no project vs org "x" with project "y"
        let tricky = Scope::account("a").with_org("x|1:y");
        let plain = Scope::account("a").with_org("x").with_project("y");
        let a = PermissionCheck::new(tricky, ResourceType::Project, Permission::View);
        let b = PermissionCheck::new(plain, ResourceType::Project, Permission::View);
        assert_ne!(canonicalize(&a), canonicalize(&b));
    }

    #[test]
    fn test_unknown_values_rejected_at_boundary() {
        let raw = RawPermissionCheck {
            scope: Scope::account("a1"),
            resource_type: "SPACESHIP".to_string(),
            resource_identifier: None,
            permission: "edit".to_string(),
        };
        let err = PermissionCheck::try_from(raw).unwrap_err();
        assert_eq!(err.category(), "validation");

        let json = r#"{"scope":{"accountId":"a1"},"resourceType":"PROJECT","permission":"fly"}"#;
        assert!(serde_json::from_str::<PermissionCheck>(json).is_err());
    }

    #[test]
    fn test_wire_forms_parse_case_insensitively() {
        assert_eq!("user_group".parse::<ResourceType>().unwrap(), ResourceType::UserGroup);
        assert_eq!("DELETE".parse::<Permission>().unwrap(), Permission::Delete);
        assert_eq!(ResourceType::ServiceAccount.to_string(), "SERVICE_ACCOUNT");
    }
}
