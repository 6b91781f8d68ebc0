//! Access control classification.
//!
//! Retrieval is deny-by-default: only ids classified accessible here are
//! ever passed into vector-store predicates, and everything else is
//! reported back to the caller as denied rather than silently dropped.
//!
//! Visibility comes from two sources, merged by union:
//!
//! - **individual** — an `object_access` row for the requesting user with
//!   any permission level (read, write, owner);
//! - **group** — an `object_access` row for a group principal **and** the
//!   user qualifying for that group (public, member, system user, or the
//!   external [`GroupMembership`] check). Both are required: an object
//!   without a group-level grant stays denied even for qualifying members.

use anyhow::Result;
use async_trait::async_trait;
use sqlx::SqlitePool;
use std::collections::BTreeMap;

use crate::models::Group;

/// Outcome of classification. `denied` is reported to the caller for
/// transparency; it never reaches query predicates.
#[derive(Debug, Clone, Default)]
pub struct Classification {
    pub accessible: Vec<String>,
    pub denied: Vec<String>,
}

/// External capability check for amplify groups (identity-provider backed).
#[async_trait]
pub trait GroupMembership: Send + Sync {
    async fn is_member_of_any(
        &self,
        user: &str,
        amplify_groups: &[String],
        token: &str,
    ) -> Result<bool>;
}

/// Membership resolver that denies everything; used when no identity
/// provider is wired in.
pub struct NoExternalGroups;

#[async_trait]
impl GroupMembership for NoExternalGroups {
    async fn is_member_of_any(&self, _: &str, _: &[String], _: &str) -> Result<bool> {
        Ok(false)
    }
}

#[derive(Clone)]
pub struct AccessClassifier {
    pool: SqlitePool,
}

impl AccessClassifier {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Ids directly granted to the user.
    pub async fn classify_individual(&self, ids: &[String], user: &str) -> Result<Classification> {
        let mut classification = Classification::default();
        for id in ids {
            if self.has_grant(id, "user", user).await? {
                classification.accessible.push(id.clone());
            } else {
                classification.denied.push(id.clone());
            }
        }
        Ok(classification)
    }

    /// Ids reachable through group grants. For each group the user must
    /// qualify, and each id must carry an object-level grant for the group
    /// principal.
    pub async fn classify_group(
        &self,
        group_to_ids: &BTreeMap<String, Vec<String>>,
        user: &str,
        token: &str,
        membership: &dyn GroupMembership,
    ) -> Result<Classification> {
        let mut classification = Classification::default();

        for (group_id, ids) in group_to_ids {
            let qualified = match self.load_group(group_id).await? {
                Some(group) => self.user_qualifies(&group, user, token, membership).await,
                None => false,
            };

            if !qualified {
                classification.denied.extend(ids.iter().cloned());
                continue;
            }

            for id in ids {
                if self.has_grant(id, "group", group_id).await? {
                    classification.accessible.push(id.clone());
                } else {
                    classification.denied.push(id.clone());
                }
            }
        }

        Ok(classification)
    }

    /// Full classification: individual ∪ qualifying-group, everything else
    /// denied.
    pub async fn classify(
        &self,
        individual_ids: &[String],
        group_to_ids: &BTreeMap<String, Vec<String>>,
        user: &str,
        token: &str,
        membership: &dyn GroupMembership,
    ) -> Result<Classification> {
        let individual = self.classify_individual(individual_ids, user).await?;
        let group = self
            .classify_group(group_to_ids, user, token, membership)
            .await?;

        let mut accessible = individual.accessible;
        for id in group.accessible {
            if !accessible.contains(&id) {
                accessible.push(id);
            }
        }

        let mut denied = Vec::new();
        for id in individual.denied.into_iter().chain(group.denied) {
            if !accessible.contains(&id) && !denied.contains(&id) {
                denied.push(id);
            }
        }

        Ok(Classification { accessible, denied })
    }

    async fn has_grant(&self, object_id: &str, principal_type: &str, principal_id: &str) -> Result<bool> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM object_access
            WHERE object_id = ? AND principal_type = ? AND principal_id = ?
              AND permission_level IN ('read', 'write', 'owner')
            "#,
        )
        .bind(object_id)
        .bind(principal_type)
        .bind(principal_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count > 0)
    }

    async fn load_group(&self, group_id: &str) -> Result<Option<Group>> {
        let row: Option<(String, i64, String, String, String)> = sqlx::query_as(
            "SELECT group_id, is_public, members_json, system_users_json, amplify_groups_json FROM groups WHERE group_id = ?",
        )
        .bind(group_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(group_id, is_public, members, system_users, amplify_groups)| Group {
            group_id,
            is_public: is_public != 0,
            members: serde_json::from_str(&members).unwrap_or_default(),
            system_users: serde_json::from_str(&system_users).unwrap_or_default(),
            amplify_groups: serde_json::from_str(&amplify_groups).unwrap_or_default(),
        }))
    }

    /// Public / member / system user / external amplify check, in that
    /// order. An external-check error denies (fail safe).
    async fn user_qualifies(
        &self,
        group: &Group,
        user: &str,
        token: &str,
        membership: &dyn GroupMembership,
    ) -> bool {
        if group.is_public {
            return true;
        }
        if group.members.iter().any(|m| m == user) {
            return true;
        }
        if group.system_users.iter().any(|m| m == user) {
            return true;
        }
        if group.amplify_groups.is_empty() {
            return false;
        }
        match membership
            .is_member_of_any(user, &group.amplify_groups, token)
            .await
        {
            Ok(ok) => ok,
            Err(e) => {
                tracing::warn!(group_id = %group.group_id, error = %e, "amplify group check failed; denying");
                false
            }
        }
    }
}

/// Record an access grant. Idempotent on the natural key.
pub async fn grant_access(
    pool: &SqlitePool,
    object_id: &str,
    principal_type: &str,
    principal_id: &str,
    permission_level: &str,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO object_access (object_id, object_type, principal_type, principal_id, permission_level)
        VALUES (?, 'datasource', ?, ?, ?)
        ON CONFLICT(object_id, principal_type, principal_id) DO UPDATE SET
            permission_level = excluded.permission_level
        "#,
    )
    .bind(object_id)
    .bind(principal_type)
    .bind(principal_id)
    .bind(permission_level)
    .execute(pool)
    .await?;
    Ok(())
}

/// Create or replace a group definition.
pub async fn upsert_group(pool: &SqlitePool, group: &Group) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO groups (group_id, is_public, members_json, system_users_json, amplify_groups_json)
        VALUES (?, ?, ?, ?, ?)
        ON CONFLICT(group_id) DO UPDATE SET
            is_public = excluded.is_public,
            members_json = excluded.members_json,
            system_users_json = excluded.system_users_json,
            amplify_groups_json = excluded.amplify_groups_json
        "#,
    )
    .bind(&group.group_id)
    .bind(group.is_public as i64)
    .bind(serde_json::to_string(&group.members)?)
    .bind(serde_json::to_string(&group.system_users)?)
    .bind(serde_json::to_string(&group.amplify_groups)?)
    .execute(pool)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{db, migrate};

    struct AlwaysMember;

    #[async_trait]
    impl GroupMembership for AlwaysMember {
        async fn is_member_of_any(&self, _: &str, _: &[String], _: &str) -> Result<bool> {
            Ok(true)
        }
    }

    struct BrokenResolver;

    #[async_trait]
    impl GroupMembership for BrokenResolver {
        async fn is_member_of_any(&self, _: &str, _: &[String], _: &str) -> Result<bool> {
            anyhow::bail!("identity provider unreachable")
        }
    }

    async fn classifier() -> AccessClassifier {
        let pool = db::connect_memory().await.unwrap();
        migrate::run_migrations(&pool).await.unwrap();
        AccessClassifier::new(pool)
    }

    fn ids(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    fn group_map(group: &str, object_ids: &[&str]) -> BTreeMap<String, Vec<String>> {
        BTreeMap::from([(group.to_string(), ids(object_ids))])
    }

    #[tokio::test]
    async fn sharing_grants_individual_access() {
        // U shares doc1 with V: classify_individual(["doc1"], V) is accessible.
        let classifier = classifier().await;
        grant_access(&classifier.pool, "doc1", "user", "user-u", "owner")
            .await
            .unwrap();
        grant_access(&classifier.pool, "doc1", "user", "user-v", "read")
            .await
            .unwrap();

        let result = classifier
            .classify_individual(&ids(&["doc1"]), "user-v")
            .await
            .unwrap();
        assert_eq!(result.accessible, ids(&["doc1"]));
        assert!(result.denied.is_empty());
    }

    #[tokio::test]
    async fn ungranted_ids_are_denied() {
        let classifier = classifier().await;
        grant_access(&classifier.pool, "doc1", "user", "user-u", "owner")
            .await
            .unwrap();

        let result = classifier
            .classify_individual(&ids(&["doc1", "doc2"]), "user-u")
            .await
            .unwrap();
        assert_eq!(result.accessible, ids(&["doc1"]));
        assert_eq!(result.denied, ids(&["doc2"]));
    }

    #[tokio::test]
    async fn disjoint_users_never_see_each_other() {
        let classifier = classifier().await;
        grant_access(&classifier.pool, "u-doc", "user", "user-u", "owner")
            .await
            .unwrap();
        grant_access(&classifier.pool, "v-doc", "user", "user-v", "owner")
            .await
            .unwrap();

        let for_v = classifier
            .classify_individual(&ids(&["u-doc", "v-doc"]), "user-v")
            .await
            .unwrap();
        assert_eq!(for_v.accessible, ids(&["v-doc"]));
        assert_eq!(for_v.denied, ids(&["u-doc"]));
    }

    #[tokio::test]
    async fn group_law_unqualified_user_gets_nothing() {
        // Not public, not a member, not a system user, external check fails:
        // zero accessible ids regardless of object-level grants.
        let classifier = classifier().await;
        upsert_group(
            &classifier.pool,
            &Group {
                group_id: "research".to_string(),
                is_public: false,
                members: vec!["someone-else".to_string()],
                system_users: vec![],
                amplify_groups: vec!["org-research".to_string()],
            },
        )
        .await
        .unwrap();
        grant_access(&classifier.pool, "doc1", "group", "research", "read")
            .await
            .unwrap();

        let result = classifier
            .classify_group(
                &group_map("research", &["doc1"]),
                "outsider",
                "token",
                &NoExternalGroups,
            )
            .await
            .unwrap();
        assert!(result.accessible.is_empty());
        assert_eq!(result.denied, ids(&["doc1"]));
    }

    #[tokio::test]
    async fn member_with_grant_is_accessible() {
        let classifier = classifier().await;
        upsert_group(
            &classifier.pool,
            &Group {
                group_id: "research".to_string(),
                members: vec!["alice".to_string()],
                ..Default::default()
            },
        )
        .await
        .unwrap();
        grant_access(&classifier.pool, "doc1", "group", "research", "read")
            .await
            .unwrap();

        let result = classifier
            .classify_group(
                &group_map("research", &["doc1", "doc2"]),
                "alice",
                "token",
                &NoExternalGroups,
            )
            .await
            .unwrap();
        assert_eq!(result.accessible, ids(&["doc1"]));
        // Deny-unless-granted: qualifying for the group is not enough.
        assert_eq!(result.denied, ids(&["doc2"]));
    }

    #[tokio::test]
    async fn public_group_qualifies_everyone() {
        let classifier = classifier().await;
        upsert_group(
            &classifier.pool,
            &Group {
                group_id: "announcements".to_string(),
                is_public: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
        grant_access(&classifier.pool, "doc1", "group", "announcements", "read")
            .await
            .unwrap();

        let result = classifier
            .classify_group(
                &group_map("announcements", &["doc1"]),
                "anyone",
                "token",
                &NoExternalGroups,
            )
            .await
            .unwrap();
        assert_eq!(result.accessible, ids(&["doc1"]));
    }

    #[tokio::test]
    async fn amplify_check_can_qualify() {
        let classifier = classifier().await;
        upsert_group(
            &classifier.pool,
            &Group {
                group_id: "external".to_string(),
                amplify_groups: vec!["idp-group".to_string()],
                ..Default::default()
            },
        )
        .await
        .unwrap();
        grant_access(&classifier.pool, "doc1", "group", "external", "read")
            .await
            .unwrap();

        let result = classifier
            .classify_group(
                &group_map("external", &["doc1"]),
                "federated-user",
                "token",
                &AlwaysMember,
            )
            .await
            .unwrap();
        assert_eq!(result.accessible, ids(&["doc1"]));
    }

    #[tokio::test]
    async fn broken_resolver_denies() {
        let classifier = classifier().await;
        upsert_group(
            &classifier.pool,
            &Group {
                group_id: "external".to_string(),
                amplify_groups: vec!["idp-group".to_string()],
                ..Default::default()
            },
        )
        .await
        .unwrap();
        grant_access(&classifier.pool, "doc1", "group", "external", "read")
            .await
            .unwrap();

        let result = classifier
            .classify_group(
                &group_map("external", &["doc1"]),
                "federated-user",
                "token",
                &BrokenResolver,
            )
            .await
            .unwrap();
        assert!(result.accessible.is_empty());
        assert_eq!(result.denied, ids(&["doc1"]));
    }

    #[tokio::test]
    async fn union_prefers_accessible_and_reports_the_rest() {
        let classifier = classifier().await;
        grant_access(&classifier.pool, "mine", "user", "me", "owner")
            .await
            .unwrap();
        upsert_group(
            &classifier.pool,
            &Group {
                group_id: "team".to_string(),
                members: vec!["me".to_string()],
                ..Default::default()
            },
        )
        .await
        .unwrap();
        grant_access(&classifier.pool, "shared", "group", "team", "read")
            .await
            .unwrap();

        let result = classifier
            .classify(
                &ids(&["mine", "private"]),
                &group_map("team", &["shared"]),
                "me",
                "token",
                &NoExternalGroups,
            )
            .await
            .unwrap();
        assert_eq!(result.accessible, ids(&["mine", "shared"]));
        assert_eq!(result.denied, ids(&["private"]));
    }
}
