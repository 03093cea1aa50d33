//! Role hierarchy resolution and permission matching
//!
//! Resolution starts from a user's scoped role assignments, walks each
//! parent chain upward, and aggregates the permissions of every role
//! reached. Matching is allow-only: the lexicographically first allow
//! permission whose resource type and action match the request wins.

use std::collections::HashSet;
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

use crate::directory::{DirectoryStore, Permission, PermissionEffect, Role, UserRole};
use crate::error::Result;

/// Maximum role hierarchy depth (root is level 0)
pub const MAX_ROLE_DEPTH: u8 = 10;

/// A permission together with the role that granted it
#[derive(Debug, Clone)]
pub struct PermissionGrant {
    pub permission: Permission,
    pub via_role: String,
}

/// Resolves effective roles and permissions against the directory
pub struct RbacResolver {
    directory: Arc<dyn DirectoryStore>,
}

impl RbacResolver {
    pub fn new(directory: Arc<dyn DirectoryStore>) -> Self {
        Self { directory }
    }

    /// Resolve the full role set for a list of assignments.
    ///
    /// Each assignment's role and all its ancestors are collected once, in
    /// assignment order then discovery order. A chain longer than
    /// `MAX_ROLE_DEPTH + 1` hops, or one that loops back on itself, is
    /// logged and truncated; resolution still returns the roles collected
    /// so far. Soft-deleted roles and dangling parent references end their
    /// chain silently.
    pub async fn resolve_roles(&self, assignments: &[UserRole]) -> Result<Vec<Role>> {
        let mut resolved: Vec<Role> = Vec::new();
        let mut collected: HashSet<Uuid> = HashSet::new();

        for assignment in assignments {
            let mut chain: HashSet<Uuid> = HashSet::new();
            let mut current = Some(assignment.role_id);
            let mut hops: u8 = 0;

            while let Some(role_id) = current {
                hops += 1;
                if hops > MAX_ROLE_DEPTH + 1 {
                    warn!(
                        role_id = %role_id,
                        max_depth = MAX_ROLE_DEPTH,
                        "role chain exceeds maximum depth, truncating"
                    );
                    break;
                }
                if !chain.insert(role_id) {
                    warn!(role_id = %role_id, "cycle detected in role hierarchy");
                    break;
                }

                let role = match self.directory.find_role(role_id).await? {
                    Some(role) if !role.is_deleted() => role,
                    _ => break,
                };

                current = role.parent_role_id;
                if collected.insert(role.id) {
                    resolved.push(role);
                }
            }
        }

        Ok(resolved)
    }

    /// Aggregate the permissions of the given roles, deduplicated by
    /// permission ID. The first role to grant a permission names it.
    pub async fn collect_permissions(&self, roles: &[Role]) -> Result<Vec<PermissionGrant>> {
        let mut seen: HashSet<Uuid> = HashSet::new();
        let mut grants: Vec<PermissionGrant> = Vec::new();

        for role in roles {
            for permission in self.directory.find_permissions_for_role(role.id).await? {
                if seen.insert(permission.id) {
                    grants.push(PermissionGrant {
                        permission,
                        via_role: role.name.clone(),
                    });
                }
            }
        }

        Ok(grants)
    }
}

/// Find the allow permission matching `(resource_type, action)`.
///
/// Matching is case-insensitive on both fields. Candidates are ordered by
/// permission name so the same permission set always yields the same
/// match. Deny-effect permissions are not consulted.
pub fn find_allow_match<'a>(
    grants: &'a [PermissionGrant],
    resource_type: &str,
    action: &str,
) -> Option<&'a PermissionGrant> {
    let mut candidates: Vec<&PermissionGrant> = grants
        .iter()
        .filter(|g| {
            g.permission.effect == PermissionEffect::Allow
                && g.permission.resource_type.eq_ignore_ascii_case(resource_type)
                && g.permission.action.eq_ignore_ascii_case(action)
        })
        .collect();

    candidates.sort_by(|a, b| a.permission.name.cmp(&b.permission.name));
    candidates.first().copied()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::InMemoryDirectoryStore;

    async fn setup_chain(depth: u8) -> (RbacResolver, Uuid, Arc<InMemoryDirectoryStore>) {
        let store = Arc::new(InMemoryDirectoryStore::new());
        let mut roles = vec![Role::new("org-1", "role-0")];
        for i in 1..=depth {
            let child = Role::child_of(roles.last().unwrap(), format!("role-{}", i));
            roles.push(child);
        }
        let leaf_id = roles.last().unwrap().id;
        for role in roles {
            store.add_role(role).await;
        }
        let resolver = RbacResolver::new(store.clone() as Arc<dyn DirectoryStore>);
        (resolver, leaf_id, store)
    }

    #[tokio::test]
    async fn test_resolve_full_depth_chain() {
        let (resolver, leaf_id, _store) = setup_chain(MAX_ROLE_DEPTH).await;
        let assignment = UserRole::grant(Uuid::new_v4(), leaf_id);

        let roles = resolver.resolve_roles(&[assignment]).await.unwrap();
        assert_eq!(roles.len(), (MAX_ROLE_DEPTH as usize) + 1);
        assert_eq!(roles[0].name, format!("role-{}", MAX_ROLE_DEPTH));
        assert_eq!(roles.last().unwrap().name, "role-0");
    }

    #[tokio::test]
    async fn test_cyclic_hierarchy_terminates() {
        let store = Arc::new(InMemoryDirectoryStore::new());
        let mut a = Role::new("org-1", "a");
        let mut b = Role::new("org-1", "b");
        a.parent_role_id = Some(b.id);
        b.parent_role_id = Some(a.id);
        let a_id = a.id;
        store.add_role(a).await;
        store.add_role(b).await;

        let resolver = RbacResolver::new(store as Arc<dyn DirectoryStore>);
        let roles = resolver
            .resolve_roles(&[UserRole::grant(Uuid::new_v4(), a_id)])
            .await
            .unwrap();

        // Both roles collected once, then the walk stops
        assert_eq!(roles.len(), 2);
    }

    #[tokio::test]
    async fn test_overlong_chain_truncated() {
        let (resolver, leaf_id, _store) = setup_chain(MAX_ROLE_DEPTH + 5).await;
        let roles = resolver
            .resolve_roles(&[UserRole::grant(Uuid::new_v4(), leaf_id)])
            .await
            .unwrap();

        assert_eq!(roles.len(), (MAX_ROLE_DEPTH as usize) + 1);
    }

    #[tokio::test]
    async fn test_shared_ancestors_deduplicated() {
        let store = Arc::new(InMemoryDirectoryStore::new());
        let root = Role::new("org-1", "root");
        let left = Role::child_of(&root, "left");
        let right = Role::child_of(&root, "right");
        let left_id = left.id;
        let right_id = right.id;
        store.add_role(root).await;
        store.add_role(left).await;
        store.add_role(right).await;

        let resolver = RbacResolver::new(store as Arc<dyn DirectoryStore>);
        let user_id = Uuid::new_v4();
        let roles = resolver
            .resolve_roles(&[
                UserRole::grant(user_id, left_id),
                UserRole::grant(user_id, right_id),
            ])
            .await
            .unwrap();

        let names: Vec<&str> = roles.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["left", "root", "right"]);
    }

    #[tokio::test]
    async fn test_deleted_role_ends_chain() {
        let store = Arc::new(InMemoryDirectoryStore::new());
        let mut root = Role::new("org-1", "root");
        root.deleted_at = Some(chrono::Utc::now());
        let child = Role::child_of(&root, "child");
        let child_id = child.id;
        store.add_role(root).await;
        store.add_role(child).await;

        let resolver = RbacResolver::new(store as Arc<dyn DirectoryStore>);
        let roles = resolver
            .resolve_roles(&[UserRole::grant(Uuid::new_v4(), child_id)])
            .await
            .unwrap();

        assert_eq!(roles.len(), 1);
        assert_eq!(roles[0].name, "child");
    }

    #[tokio::test]
    async fn test_permission_aggregation_dedup() {
        let store = Arc::new(InMemoryDirectoryStore::new());
        let viewer = Role::new("org-1", "viewer");
        let editor = Role::new("org-1", "editor");
        let read = Permission::allow("org-1", "document.read", "document", "read");
        let write = Permission::allow("org-1", "document.write", "document", "write");

        store.add_role(viewer.clone()).await;
        store.add_role(editor.clone()).await;
        store.add_permission(read.clone()).await;
        store.add_permission(write.clone()).await;
        store.grant_permission(viewer.id, read.id).await;
        store.grant_permission(editor.id, read.id).await;
        store.grant_permission(editor.id, write.id).await;

        let resolver = RbacResolver::new(store as Arc<dyn DirectoryStore>);
        let grants = resolver
            .collect_permissions(&[viewer, editor])
            .await
            .unwrap();

        assert_eq!(grants.len(), 2);
        assert_eq!(grants[0].permission.name, "document.read");
        assert_eq!(grants[0].via_role, "viewer");
        assert_eq!(grants[1].permission.name, "document.write");
        assert_eq!(grants[1].via_role, "editor");
    }

    #[test]
    fn test_match_is_case_insensitive() {
        let grants = vec![PermissionGrant {
            permission: Permission::allow("org-1", "document.read", "Document", "Read"),
            via_role: "viewer".to_string(),
        }];

        assert!(find_allow_match(&grants, "document", "read").is_some());
        assert!(find_allow_match(&grants, "DOCUMENT", "READ").is_some());
        assert!(find_allow_match(&grants, "invoice", "read").is_none());
        assert!(find_allow_match(&grants, "document", "write").is_none());
    }

    #[test]
    fn test_match_ignores_deny_permissions() {
        let grants = vec![PermissionGrant {
            permission: Permission::deny("org-1", "document.read.deny", "document", "read"),
            via_role: "restricted".to_string(),
        }];

        assert!(find_allow_match(&grants, "document", "read").is_none());
    }

    #[test]
    fn test_match_is_deterministic_by_name() {
        let mut grants = vec![
            PermissionGrant {
                permission: Permission::allow("org-1", "zz.read", "document", "read"),
                via_role: "b".to_string(),
            },
            PermissionGrant {
                permission: Permission::allow("org-1", "aa.read", "document", "read"),
                via_role: "a".to_string(),
            },
        ];

        let first = find_allow_match(&grants, "document", "read").unwrap();
        assert_eq!(first.permission.name, "aa.read");

        // Same result regardless of input order
        grants.reverse();
        let first = find_allow_match(&grants, "document", "read").unwrap();
        assert_eq!(first.permission.name, "aa.read");
    }
}
