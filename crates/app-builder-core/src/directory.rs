use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::ids::{DepartmentId, JobTitleId, UserId};
use crate::model::User;
use crate::EngineError;

/// Reference to a principal or group of principals inside ACL rules and
/// assignee specs. Unknown `entity_type` tags are rejected when decoded.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(try_from = "RawEntityRef", into = "RawEntityRef")]
pub enum EntityRef {
    User(UserId),
    Department(DepartmentId),
    JobTitle(JobTitleId),
    Creator,
    Everyone,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawEntityRef {
    entity_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    entity_id: Option<String>,
}

impl TryFrom<RawEntityRef> for EntityRef {
    type Error = EngineError;

    fn try_from(raw: RawEntityRef) -> Result<Self, Self::Error> {
        let entity_id = raw
            .entity_id
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty());
        let required_id = |entity_type: &str| {
            entity_id.ok_or_else(|| {
                EngineError::Validation(format!("entity_type={entity_type} requires entity_id"))
            })
        };

        match raw.entity_type.as_str() {
            "user" => Ok(Self::User(UserId::parse(required_id("user")?)?)),
            "department" => Ok(Self::Department(DepartmentId::parse(required_id(
                "department",
            )?)?)),
            "job_title" => Ok(Self::JobTitle(JobTitleId::parse(required_id(
                "job_title",
            )?)?)),
            "creator" => Ok(Self::Creator),
            "everyone" => Ok(Self::Everyone),
            other => Err(EngineError::Validation(format!(
                "unsupported entity_type: {other}"
            ))),
        }
    }
}

impl From<EntityRef> for RawEntityRef {
    fn from(entity: EntityRef) -> Self {
        let (entity_type, entity_id) = match entity {
            EntityRef::User(id) => ("user", Some(id.to_string())),
            EntityRef::Department(id) => ("department", Some(id.to_string())),
            EntityRef::JobTitle(id) => ("job_title", Some(id.to_string())),
            EntityRef::Creator => ("creator", None),
            EntityRef::Everyone => ("everyone", None),
        };
        Self {
            entity_type: entity_type.to_string(),
            entity_id,
        }
    }
}

impl EntityRef {
    #[must_use]
    pub fn entity_type(self) -> &'static str {
        match self {
            Self::User(_) => "user",
            Self::Department(_) => "department",
            Self::JobTitle(_) => "job_title",
            Self::Creator => "creator",
            Self::Everyone => "everyone",
        }
    }

    /// Membership test against a user's own affiliations. `creator` is the
    /// creator of whatever object the rule is attached to.
    #[must_use]
    pub fn matches_user(self, user: &User, creator: Option<UserId>) -> bool {
        match self {
            Self::User(id) => user.id == id,
            Self::Department(id) => user.department_id == Some(id),
            Self::JobTitle(id) => user.job_title_id == Some(id),
            Self::Creator => creator == Some(user.id),
            Self::Everyone => true,
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum EntitySet {
    Users(BTreeSet<UserId>),
    /// Never enumerated; callers decide what "everyone" means in context.
    Everyone,
}

impl EntitySet {
    #[must_use]
    pub fn empty() -> Self {
        Self::Users(BTreeSet::new())
    }

    #[must_use]
    pub fn contains(&self, user_id: UserId) -> bool {
        match self {
            Self::Users(ids) => ids.contains(&user_id),
            Self::Everyone => true,
        }
    }
}

/// Organizational lookups backing `department` and `job_title` references.
///
/// Implementations report lookup failures as [`EngineError::Directory`];
/// an empty set always means "nobody", never "could not ask".
pub trait OrgDirectory {
    /// # Errors
    /// Returns [`EngineError::Directory`] when the lookup cannot be served.
    fn users_in_department(&self, department_id: DepartmentId)
        -> Result<BTreeSet<UserId>, EngineError>;

    /// # Errors
    /// Returns [`EngineError::Directory`] when the lookup cannot be served.
    fn users_with_job_title(&self, job_title_id: JobTitleId)
        -> Result<BTreeSet<UserId>, EngineError>;
}

/// Resolves one entity reference into concrete users.
///
/// # Errors
/// Propagates directory failures unchanged.
pub fn resolve_entity<D: OrgDirectory + ?Sized>(
    entity: EntityRef,
    creator: Option<UserId>,
    directory: &D,
) -> Result<EntitySet, EngineError> {
    match entity {
        EntityRef::User(id) => Ok(EntitySet::Users(BTreeSet::from([id]))),
        EntityRef::Creator => Ok(EntitySet::Users(creator.into_iter().collect())),
        EntityRef::Everyone => Ok(EntitySet::Everyone),
        EntityRef::Department(id) => directory.users_in_department(id).map(EntitySet::Users),
        EntityRef::JobTitle(id) => directory.users_with_job_title(id).map(EntitySet::Users),
    }
}

/// Directory snapshot built from an in-memory user list.
#[derive(Debug, Clone, Default)]
pub struct StaticDirectory {
    departments: BTreeMap<DepartmentId, BTreeSet<UserId>>,
    job_titles: BTreeMap<JobTitleId, BTreeSet<UserId>>,
}

impl StaticDirectory {
    #[must_use]
    pub fn from_users(users: &[User]) -> Self {
        let mut directory = Self::default();
        for user in users {
            if let Some(department_id) = user.department_id {
                directory
                    .departments
                    .entry(department_id)
                    .or_default()
                    .insert(user.id);
            }
            if let Some(job_title_id) = user.job_title_id {
                directory
                    .job_titles
                    .entry(job_title_id)
                    .or_default()
                    .insert(user.id);
            }
        }
        directory
    }
}

impl OrgDirectory for StaticDirectory {
    fn users_in_department(
        &self,
        department_id: DepartmentId,
    ) -> Result<BTreeSet<UserId>, EngineError> {
        Ok(self
            .departments
            .get(&department_id)
            .cloned()
            .unwrap_or_default())
    }

    fn users_with_job_title(
        &self,
        job_title_id: JobTitleId,
    ) -> Result<BTreeSet<UserId>, EngineError> {
        Ok(self
            .job_titles
            .get(&job_title_id)
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn user(department_id: Option<DepartmentId>, job_title_id: Option<JobTitleId>) -> User {
        User {
            id: UserId::new(),
            email: "someone@example.com".to_string(),
            full_name: None,
            is_superuser: false,
            department_id,
            job_title_id,
        }
    }

    fn must_ok<T>(result: Result<T, EngineError>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("unexpected error: {err}"),
        }
    }

    #[test]
    fn unknown_entity_type_is_rejected_at_decode() {
        let decoded = serde_json::from_value::<EntityRef>(json!({"entity_type": "group"}));
        assert!(decoded.is_err());
    }

    #[test]
    fn group_references_require_an_id() {
        let decoded = serde_json::from_value::<EntityRef>(json!({"entity_type": "department"}));
        assert!(decoded.is_err());

        let creator = serde_json::from_value::<EntityRef>(
            json!({"entity_type": "creator", "entity_id": null}),
        );
        assert!(matches!(creator, Ok(EntityRef::Creator)));
    }

    #[test]
    fn creator_resolves_to_known_creator_only() {
        let directory = StaticDirectory::default();
        let creator = UserId::new();

        let known = must_ok(resolve_entity(EntityRef::Creator, Some(creator), &directory));
        assert_eq!(known, EntitySet::Users(BTreeSet::from([creator])));

        let unknown = must_ok(resolve_entity(EntityRef::Creator, None, &directory));
        assert_eq!(unknown, EntitySet::empty());
    }

    #[test]
    fn department_and_job_title_use_directory_membership() {
        let sales = DepartmentId::new();
        let manager = JobTitleId::new();
        let alice = user(Some(sales), Some(manager));
        let bob = user(Some(sales), None);
        let carol = user(None, Some(manager));
        let directory = StaticDirectory::from_users(&[alice.clone(), bob.clone(), carol.clone()]);

        let by_department = must_ok(resolve_entity(EntityRef::Department(sales), None, &directory));
        assert_eq!(by_department, EntitySet::Users(BTreeSet::from([alice.id, bob.id])));

        let by_title = must_ok(resolve_entity(EntityRef::JobTitle(manager), None, &directory));
        assert_eq!(by_title, EntitySet::Users(BTreeSet::from([alice.id, carol.id])));

        let empty = must_ok(resolve_entity(
            EntityRef::Department(DepartmentId::new()),
            None,
            &directory,
        ));
        assert_eq!(empty, EntitySet::empty());
    }

    #[test]
    fn everyone_is_a_sentinel() {
        let resolved = must_ok(resolve_entity(
            EntityRef::Everyone,
            None,
            &StaticDirectory::default(),
        ));
        assert_eq!(resolved, EntitySet::Everyone);
        assert!(resolved.contains(UserId::new()));
    }

    #[test]
    fn entity_refs_encode_with_entity_type_tag() {
        let id = UserId::new();
        let encoded = match serde_json::to_value(EntityRef::User(id)) {
            Ok(value) => value,
            Err(err) => panic!("encode: {err}"),
        };
        assert_eq!(encoded, json!({"entity_type": "user", "entity_id": id.to_string()}));

        let everyone = match serde_json::to_value(EntityRef::Everyone) {
            Ok(value) => value,
            Err(err) => panic!("encode: {err}"),
        };
        assert_eq!(everyone, json!({"entity_type": "everyone"}));
    }
}
