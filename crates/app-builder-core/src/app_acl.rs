use serde::{Deserialize, Serialize};

use crate::directory::EntityRef;
use crate::model::{App, User};

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct AppAclRule {
    #[serde(flatten)]
    pub entity: EntityRef,
    #[serde(default)]
    pub allow_view: bool,
    #[serde(default)]
    pub allow_edit: bool,
    #[serde(default)]
    pub allow_delete: bool,
    #[serde(default)]
    pub allow_manage: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Default)]
pub struct AppPermissions {
    pub view: bool,
    pub edit: bool,
    pub delete: bool,
    pub manage: bool,
}

impl AppPermissions {
    #[must_use]
    pub fn all() -> Self {
        Self {
            view: true,
            edit: true,
            delete: true,
            manage: true,
        }
    }

    fn grant(&mut self, rule: &AppAclRule) {
        self.view |= rule.allow_view;
        self.edit |= rule.allow_edit;
        self.delete |= rule.allow_delete;
        self.manage |= rule.allow_manage;
    }
}

/// Computes a user's rights on an app.
///
/// Every matching rule contributes its grants; there is no deny and no
/// ordering. Apps without rules are readable by everyone and writable by
/// their creator only.
#[must_use]
pub fn evaluate_app_permissions(app: &App, user: &User) -> AppPermissions {
    if user.is_superuser {
        return AppPermissions::all();
    }

    let is_creator = app.created_by == Some(user.id);
    if app.app_acl.is_empty() {
        return AppPermissions {
            view: true,
            edit: is_creator,
            delete: is_creator,
            manage: is_creator,
        };
    }

    let mut permissions = AppPermissions::default();
    for rule in &app.app_acl {
        if rule.entity.matches_user(user, app.created_by) {
            permissions.grant(rule);
        }
    }

    tracing::debug!(
        app = %app.id,
        user = %user.id,
        view = permissions.view,
        edit = permissions.edit,
        delete = permissions.delete,
        manage = permissions.manage,
        "evaluated app acl"
    );
    permissions
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{AppId, DepartmentId, JobTitleId, UserId};
    use crate::process::WorkflowDefinition;
    use serde_json::json;

    fn fixture_user() -> User {
        User {
            id: UserId::new(),
            email: "member@example.com".to_string(),
            full_name: Some("Member".to_string()),
            is_superuser: false,
            department_id: None,
            job_title_id: None,
        }
    }

    fn fixture_app(created_by: Option<UserId>, app_acl: Vec<AppAclRule>) -> App {
        App {
            id: AppId::new(),
            name: "Expenses".to_string(),
            description: None,
            created_by,
            app_acl,
            record_acl: Vec::new(),
            process_management: WorkflowDefinition::default(),
        }
    }

    fn rule(entity: EntityRef, view: bool, edit: bool, delete: bool, manage: bool) -> AppAclRule {
        AppAclRule {
            entity,
            allow_view: view,
            allow_edit: edit,
            allow_delete: delete,
            allow_manage: manage,
        }
    }

    #[test]
    fn empty_acl_gives_creator_full_rights_and_others_view() {
        let creator = fixture_user();
        let other = fixture_user();
        let app = fixture_app(Some(creator.id), Vec::new());

        assert_eq!(evaluate_app_permissions(&app, &creator), AppPermissions::all());
        assert_eq!(
            evaluate_app_permissions(&app, &other),
            AppPermissions {
                view: true,
                ..AppPermissions::default()
            }
        );
    }

    #[test]
    fn legacy_app_without_creator_is_view_only() {
        let app = fixture_app(None, Vec::new());
        let permissions = evaluate_app_permissions(&app, &fixture_user());
        assert!(permissions.view);
        assert!(!permissions.manage);
    }

    #[test]
    fn superuser_bypasses_even_an_empty_grant_set() {
        let mut admin = fixture_user();
        admin.is_superuser = true;
        let nobody = fixture_user();
        let app = fixture_app(
            None,
            vec![rule(EntityRef::User(nobody.id), true, false, false, false)],
        );
        assert_eq!(evaluate_app_permissions(&app, &admin), AppPermissions::all());
    }

    #[test]
    fn non_empty_acl_without_match_grants_nothing() {
        let creator = fixture_user();
        let app = fixture_app(
            Some(creator.id),
            vec![rule(EntityRef::User(UserId::new()), true, true, true, true)],
        );
        assert_eq!(
            evaluate_app_permissions(&app, &creator),
            AppPermissions::default()
        );
    }

    #[test]
    fn matching_rules_are_unioned() {
        let department = DepartmentId::new();
        let title = JobTitleId::new();
        let mut member = fixture_user();
        member.department_id = Some(department);
        member.job_title_id = Some(title);

        let app = fixture_app(
            None,
            vec![
                rule(EntityRef::Everyone, true, false, false, false),
                rule(EntityRef::Department(department), false, true, false, false),
                rule(EntityRef::JobTitle(title), false, false, true, false),
                rule(EntityRef::User(member.id), false, false, false, false),
            ],
        );

        assert_eq!(
            evaluate_app_permissions(&app, &member),
            AppPermissions {
                view: true,
                edit: true,
                delete: true,
                manage: false,
            }
        );
    }

    #[test]
    fn a_later_all_false_rule_does_not_revoke_earlier_grants() {
        let member = fixture_user();
        let app = fixture_app(
            None,
            vec![
                rule(EntityRef::User(member.id), true, true, false, false),
                rule(EntityRef::Everyone, false, false, false, false),
            ],
        );
        let permissions = evaluate_app_permissions(&app, &member);
        assert!(permissions.view);
        assert!(permissions.edit);
    }

    #[test]
    fn creator_rule_matches_app_creator() {
        let creator = fixture_user();
        let other = fixture_user();
        let app = fixture_app(
            Some(creator.id),
            vec![rule(EntityRef::Creator, true, true, true, true)],
        );
        assert_eq!(evaluate_app_permissions(&app, &creator), AppPermissions::all());
        assert_eq!(
            evaluate_app_permissions(&app, &other),
            AppPermissions::default()
        );
    }

    #[test]
    fn rules_decode_with_flattened_entity_and_default_flags() {
        let id = UserId::new();
        let decoded: AppAclRule = match serde_json::from_value(json!({
            "entity_type": "user",
            "entity_id": id.to_string(),
            "allow_view": true
        })) {
            Ok(value) => value,
            Err(err) => panic!("decode: {err}"),
        };
        assert_eq!(decoded, rule(EntityRef::User(id), true, false, false, false));
    }
}
