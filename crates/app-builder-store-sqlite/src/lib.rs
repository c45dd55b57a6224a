#![allow(clippy::missing_errors_doc)]
#![allow(clippy::uninlined_format_args)]

use std::collections::BTreeSet;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use app_builder_core::{
    can_view_record, evaluate_app_permissions, execute_action, filter_pending_for_user,
    format_rfc3339, initial_status, lint_process_definition, now_utc, parse_rfc3339_utc,
    preview_next_assignees, validate_process_definition, ActionDefinition, App, AppAclRule, AppId,
    AppPermissions, AssigneePreview, DefinitionWarning, DepartmentId, EngineError,
    ExecuteRequest, FieldDefinition, FieldType, JobTitleId, Notification, NotificationEvent,
    NotificationId, NotificationKind, NotificationSink, OrgDirectory, Record, RecordAclRule,
    RecordId, RecordViewFilter, Transition, User, UserId, WorkflowDefinition, WorkflowEvent,
};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, TransactionBehavior};
use serde_json::{Map, Value};
use ulid::Ulid;

mod filter;

pub use filter::{compile_search_filters, compile_view_filter};

const APP_BUILDER_MIGRATION_VERSION: i64 = 1;
const DEFAULT_LIST_LIMIT: usize = 100;

const SCHEMA_APP_BUILDER_V1: &str = r"
CREATE TABLE IF NOT EXISTS departments (
  id TEXT PRIMARY KEY,
  name TEXT NOT NULL,
  code TEXT NOT NULL UNIQUE,
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS job_titles (
  id TEXT PRIMARY KEY,
  name TEXT NOT NULL,
  rank INTEGER NOT NULL DEFAULT 0,
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS users (
  id TEXT PRIMARY KEY,
  email TEXT NOT NULL UNIQUE,
  full_name TEXT,
  is_superuser INTEGER NOT NULL DEFAULT 0 CHECK (is_superuser IN (0, 1)),
  department_id TEXT REFERENCES departments(id),
  job_title_id TEXT REFERENCES job_titles(id),
  created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_users_department ON users(department_id);
CREATE INDEX IF NOT EXISTS idx_users_job_title ON users(job_title_id);

CREATE TABLE IF NOT EXISTS apps (
  id TEXT PRIMARY KEY,
  name TEXT NOT NULL,
  description TEXT,
  created_by TEXT,
  app_acl_json TEXT NOT NULL DEFAULT '[]' CHECK (json_valid(app_acl_json)),
  record_acl_json TEXT NOT NULL DEFAULT '[]' CHECK (json_valid(record_acl_json)),
  process_json TEXT NOT NULL DEFAULT '{}' CHECK (json_valid(process_json)),
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS app_fields (
  app_id TEXT NOT NULL REFERENCES apps(id) ON DELETE CASCADE,
  code TEXT NOT NULL,
  label TEXT NOT NULL,
  field_type TEXT NOT NULL,
  required INTEGER NOT NULL DEFAULT 0 CHECK (required IN (0, 1)),
  config_json TEXT NOT NULL DEFAULT 'null',
  position INTEGER NOT NULL,
  PRIMARY KEY (app_id, code)
);

CREATE TABLE IF NOT EXISTS app_record_counters (
  app_id TEXT PRIMARY KEY REFERENCES apps(id) ON DELETE CASCADE,
  last_record_number INTEGER NOT NULL CHECK (last_record_number >= 1)
);

CREATE TABLE IF NOT EXISTS records (
  id TEXT PRIMARY KEY,
  app_id TEXT NOT NULL REFERENCES apps(id) ON DELETE CASCADE,
  record_number INTEGER NOT NULL CHECK (record_number >= 1),
  data_json TEXT NOT NULL CHECK (json_valid(data_json)),
  status TEXT NOT NULL,
  created_by TEXT,
  workflow_requester_id TEXT,
  workflow_approver_ids_json TEXT NOT NULL DEFAULT '[]',
  workflow_current_step INTEGER NOT NULL DEFAULT 0,
  workflow_submitted_at TEXT,
  workflow_decided_at TEXT,
  workflow_history_json TEXT NOT NULL DEFAULT '[]',
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  revision INTEGER NOT NULL DEFAULT 0,
  UNIQUE (app_id, record_number)
);

CREATE INDEX IF NOT EXISTS idx_records_app_number ON records(app_id, record_number DESC);

CREATE TABLE IF NOT EXISTS notifications (
  id TEXT PRIMARY KEY,
  user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
  app_id TEXT,
  record_id TEXT,
  kind TEXT NOT NULL CHECK (kind IN ('workflow_terminal')),
  title TEXT NOT NULL,
  message TEXT NOT NULL,
  created_at TEXT NOT NULL,
  read_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_notifications_user ON notifications(user_id, read_at);
";

const RECORD_COLUMNS: &str = "r.id, r.app_id, r.record_number, r.data_json, r.status, r.created_by,
    r.workflow_requester_id, r.workflow_approver_ids_json, r.workflow_current_step,
    r.workflow_submitted_at, r.workflow_decided_at, r.workflow_history_json,
    r.created_at, r.updated_at, r.revision";

const APP_COLUMNS: &str =
    "id, name, description, created_by, app_acl_json, record_acl_json, process_json";

const USER_COLUMNS: &str = "id, email, full_name, is_superuser, department_id, job_title_id";

const NOTIFICATION_COLUMNS: &str =
    "id, user_id, app_id, record_id, kind, title, message, created_at, read_at";

pub struct SqliteAppStore {
    conn: Connection,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct Department {
    pub id: DepartmentId,
    pub name: String,
    pub code: String,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct JobTitle {
    pub id: JobTitleId,
    pub name: String,
    pub rank: i64,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq, Default)]
pub struct NewUser {
    pub email: String,
    pub full_name: Option<String>,
    pub is_superuser: bool,
    pub department_id: Option<DepartmentId>,
    pub job_title_id: Option<JobTitleId>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Default)]
pub struct RecordQuery {
    /// Field code to expected value. Strings match as case-insensitive
    /// substrings, everything else by equality. Null and empty values are
    /// ignored.
    pub filters: Map<String, Value>,
    pub status: Option<String>,
    pub skip: usize,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Default)]
pub struct RecordUpdate {
    /// Shallow-merged into the stored data; top-level keys are replaced.
    pub data: Map<String, Value>,
    /// Direct status override outside the workflow.
    pub status: Option<String>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq, Default)]
pub struct NotificationQuery {
    pub unread_only: bool,
    pub skip: usize,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct ProcessUpdateReport {
    pub process_management: WorkflowDefinition,
    pub warnings: Vec<DefinitionWarning>,
}

impl SqliteAppStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;
        filter::register_functions(&conn).context("failed to register sqlite functions")?;

        Ok(Self { conn })
    }

    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_APP_BUILDER_V1)
            .context("failed to apply app builder schema")?;

        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![APP_BUILDER_MIGRATION_VERSION, timestamp(now_utc())?],
            )
            .context("failed to register app builder schema migration")?;

        Ok(())
    }

    // ---- organization -------------------------------------------------

    pub fn create_department(&self, actor: &User, name: &str, code: &str) -> Result<Department> {
        require_superuser(actor, "create departments")?;
        let department = Department {
            id: DepartmentId::new(),
            name: required_text("department name", name)?,
            code: required_text("department code", code)?,
        };
        self.conn
            .execute(
                "INSERT INTO departments(id, name, code, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![
                    department.id.to_string(),
                    department.name,
                    department.code,
                    timestamp(now_utc())?
                ],
            )
            .with_context(|| format!("failed to create department {}", department.code))?;
        Ok(department)
    }

    pub fn create_job_title(&self, actor: &User, name: &str, rank: i64) -> Result<JobTitle> {
        require_superuser(actor, "create job titles")?;
        let job_title = JobTitle {
            id: JobTitleId::new(),
            name: required_text("job title name", name)?,
            rank,
        };
        self.conn
            .execute(
                "INSERT INTO job_titles(id, name, rank, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![
                    job_title.id.to_string(),
                    job_title.name,
                    job_title.rank,
                    timestamp(now_utc())?
                ],
            )
            .context("failed to create job title")?;
        Ok(job_title)
    }

    /// Creates a user on behalf of a superuser. Without an actor only the
    /// first user of an empty directory can be created, and it becomes a
    /// superuser.
    pub fn create_user(&self, actor: Option<&User>, input: &NewUser) -> Result<User> {
        if let Some(actor) = actor {
            require_superuser(actor, "create users")?;
        }
        let user = User {
            id: UserId::new(),
            email: required_text("email", &input.email)?,
            full_name: input.full_name.clone(),
            is_superuser: input.is_superuser || actor.is_none(),
            department_id: input.department_id,
            job_title_id: input.job_title_id,
        };
        let guard = if actor.is_some() {
            ""
        } else {
            "WHERE NOT EXISTS (SELECT 1 FROM users)"
        };
        let changed = self
            .conn
            .execute(
                &format!(
                    "INSERT INTO users(id, email, full_name, is_superuser, department_id, job_title_id, created_at)
                     SELECT ?1, ?2, ?3, ?4, ?5, ?6, ?7 {guard}"
                ),
                params![
                    user.id.to_string(),
                    user.email,
                    user.full_name,
                    bool_to_sql(user.is_superuser),
                    user.department_id.map(|id| id.to_string()),
                    user.job_title_id.map(|id| id.to_string()),
                    timestamp(now_utc())?
                ],
            )
            .with_context(|| format!("failed to create user {}", user.email))?;
        if changed == 0 {
            return Err(EngineError::Forbidden(
                "only a superuser can create users once the directory has members".to_string(),
            )
            .into());
        }
        if actor.is_none() {
            tracing::info!(user = %user.id, "bootstrapped first superuser");
        }
        Ok(user)
    }

    pub fn set_user_affiliation(
        &self,
        actor: &User,
        user_id: UserId,
        department_id: Option<DepartmentId>,
        job_title_id: Option<JobTitleId>,
    ) -> Result<User> {
        require_superuser(actor, "change user affiliations")?;
        let changed = self
            .conn
            .execute(
                "UPDATE users SET department_id = ?2, job_title_id = ?3 WHERE id = ?1",
                params![
                    user_id.to_string(),
                    department_id.map(|id| id.to_string()),
                    job_title_id.map(|id| id.to_string())
                ],
            )
            .context("failed to update user affiliation")?;
        if changed == 0 {
            return Err(not_found("user", user_id));
        }
        self.get_user(user_id)
    }

    pub fn get_user(&self, user_id: UserId) -> Result<User> {
        self.conn
            .query_row(
                &format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1"),
                params![user_id.to_string()],
                parse_user_row,
            )
            .optional()
            .context("failed to load user")?
            .ok_or_else(|| not_found("user", user_id))
    }

    pub fn list_users(&self) -> Result<Vec<User>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {USER_COLUMNS} FROM users ORDER BY email ASC"))?;
        let rows = stmt.query_map([], parse_user_row)?;
        collect_rows(rows)
    }

    // ---- apps ----------------------------------------------------------

    pub fn create_app(&self, actor: &User, name: &str, description: Option<&str>) -> Result<App> {
        let app = App {
            id: AppId::new(),
            name: required_text("app name", name)?,
            description: description.map(str::to_string),
            created_by: Some(actor.id),
            app_acl: Vec::new(),
            record_acl: Vec::new(),
            process_management: WorkflowDefinition::disabled(),
        };
        let now = timestamp(now_utc())?;
        self.conn
            .execute(
                "INSERT INTO apps(id, name, description, created_by, app_acl_json, record_acl_json,
                                  process_json, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, '[]', '[]', ?5, ?6, ?6)",
                params![
                    app.id.to_string(),
                    app.name,
                    app.description,
                    actor.id.to_string(),
                    to_json_text(&app.process_management)?,
                    now
                ],
            )
            .context("failed to create app")?;
        tracing::info!(app = %app.id, creator = %actor.id, "created app");
        Ok(app)
    }

    /// Loads an app the actor is allowed to view.
    pub fn get_app(&self, actor: &User, app_id: AppId) -> Result<App> {
        let app = require_app(&self.conn, app_id)?;
        require_right(&app, actor, Right::View)?;
        Ok(app)
    }

    pub fn app_permissions(&self, actor: &User, app_id: AppId) -> Result<AppPermissions> {
        let app = require_app(&self.conn, app_id)?;
        Ok(evaluate_app_permissions(&app, actor))
    }

    pub fn replace_app_acl(
        &self,
        actor: &User,
        app_id: AppId,
        rules: Vec<AppAclRule>,
    ) -> Result<App> {
        let mut app = require_app(&self.conn, app_id)?;
        require_right(&app, actor, Right::Manage)?;
        app.app_acl = rules;
        self.touch_app_column(app_id, "app_acl_json", &to_json_text(&app.app_acl)?)?;
        tracing::info!(app = %app_id, rules = app.app_acl.len(), "replaced app acl");
        Ok(app)
    }

    pub fn replace_record_acl(
        &self,
        actor: &User,
        app_id: AppId,
        rules: Vec<RecordAclRule>,
    ) -> Result<App> {
        let mut app = require_app(&self.conn, app_id)?;
        require_right(&app, actor, Right::Manage)?;
        app.record_acl = rules;
        self.touch_app_column(app_id, "record_acl_json", &to_json_text(&app.record_acl)?)?;
        tracing::info!(app = %app_id, rules = app.record_acl.len(), "replaced record acl");
        Ok(app)
    }

    /// Validates and stores a new workflow definition, returning any
    /// non-blocking lint warnings alongside it.
    pub fn replace_process_definition(
        &self,
        actor: &User,
        app_id: AppId,
        definition: WorkflowDefinition,
    ) -> Result<ProcessUpdateReport> {
        let app = require_app(&self.conn, app_id)?;
        require_right(&app, actor, Right::Manage)?;
        let fields = self.list_fields(app_id)?;
        validate_process_definition(&definition, &fields)?;

        let warnings = lint_process_definition(&definition);
        for warning in &warnings {
            tracing::warn!(app = %app_id, ?warning, "process definition lint");
        }
        self.touch_app_column(app_id, "process_json", &to_json_text(&definition)?)?;
        tracing::info!(app = %app_id, enabled = definition.enabled(), "replaced process definition");

        Ok(ProcessUpdateReport {
            process_management: definition,
            warnings,
        })
    }

    fn touch_app_column(&self, app_id: AppId, column: &str, json: &str) -> Result<()> {
        self.conn
            .execute(
                &format!("UPDATE apps SET {column} = ?2, updated_at = ?3 WHERE id = ?1"),
                params![app_id.to_string(), json, timestamp(now_utc())?],
            )
            .with_context(|| format!("failed to update apps.{column}"))?;
        Ok(())
    }

    // ---- fields --------------------------------------------------------

    pub fn list_fields(&self, app_id: AppId) -> Result<Vec<FieldDefinition>> {
        let mut stmt = self.conn.prepare(
            "SELECT code, label, field_type, required, config_json
             FROM app_fields WHERE app_id = ?1 ORDER BY position ASC",
        )?;
        let rows = stmt.query_map(params![app_id.to_string()], parse_field_row)?;
        collect_rows(rows)
    }

    pub fn add_field(
        &mut self,
        actor: &User,
        app_id: AppId,
        field: FieldDefinition,
    ) -> Result<FieldDefinition> {
        let app = require_app(&self.conn, app_id)?;
        require_right(&app, actor, Right::Manage)?;
        validate_field_code(&field.code)?;

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start field transaction")?;
        let exists: bool = tx
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM app_fields WHERE app_id = ?1 AND code = ?2)",
                params![app_id.to_string(), field.code],
                |row| row.get(0),
            )
            .context("failed to check field code")?;
        if exists {
            return Err(EngineError::Validation(format!(
                "field code already exists: {}",
                field.code
            ))
            .into());
        }
        let position: i64 = tx
            .query_row(
                "SELECT COALESCE(MAX(position), -1) + 1 FROM app_fields WHERE app_id = ?1",
                params![app_id.to_string()],
                |row| row.get(0),
            )
            .context("failed to compute field position")?;
        insert_field(&tx, app_id, &field, position)?;
        tx.commit().context("failed to commit field transaction")?;
        Ok(field)
    }

    /// Replaces the whole field set. The stored workflow definition must
    /// still validate against the new fields.
    pub fn replace_fields(
        &mut self,
        actor: &User,
        app_id: AppId,
        fields: Vec<FieldDefinition>,
    ) -> Result<Vec<FieldDefinition>> {
        let app = require_app(&self.conn, app_id)?;
        require_right(&app, actor, Right::Manage)?;

        let mut codes = BTreeSet::new();
        for field in &fields {
            validate_field_code(&field.code)?;
            if !codes.insert(field.code.as_str()) {
                return Err(EngineError::Validation(format!(
                    "duplicate field code: {}",
                    field.code
                ))
                .into());
            }
        }
        validate_process_definition(&app.process_management, &fields)?;

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start field transaction")?;
        tx.execute(
            "DELETE FROM app_fields WHERE app_id = ?1",
            params![app_id.to_string()],
        )
        .context("failed to clear fields")?;
        for (position, field) in (0_i64..).zip(&fields) {
            insert_field(&tx, app_id, field, position)?;
        }
        tx.commit().context("failed to commit field transaction")?;
        Ok(fields)
    }

    // ---- records -------------------------------------------------------

    pub fn create_record(
        &mut self,
        actor: &User,
        app_id: AppId,
        data: Map<String, Value>,
        status: Option<&str>,
    ) -> Result<Record> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start record transaction")?;

        let app = require_app(&tx, app_id)?;
        require_right(&app, actor, Right::Edit)?;

        let record_number: i64 = tx
            .query_row(
                "INSERT INTO app_record_counters(app_id, last_record_number) VALUES (?1, 1)
                 ON CONFLICT(app_id) DO UPDATE SET last_record_number = last_record_number + 1
                 RETURNING last_record_number",
                params![app_id.to_string()],
                |row| row.get(0),
            )
            .context("failed to allocate record number")?;

        let record = Record::new(
            app_id,
            record_number,
            data,
            initial_status(&app.process_management, status),
            Some(actor.id),
            now_utc(),
        );
        insert_record(&tx, &record)?;
        tx.commit().context("failed to commit record transaction")?;

        tracing::info!(
            app = %app_id,
            record = %record.id,
            record_number,
            status = %record.status,
            "created record"
        );
        Ok(record)
    }

    /// Existence is checked before permissions, so a missing record is
    /// reported as not found even to users who could not see it.
    pub fn get_record(&self, actor: &User, record_id: RecordId) -> Result<Record> {
        let record = require_record(&self.conn, record_id)?;
        let app = require_app(&self.conn, record.app_id)?;
        require_right(&app, actor, Right::View)?;
        require_visible(&app, &record, actor)?;
        Ok(record)
    }

    pub fn list_records(
        &self,
        actor: &User,
        app_id: AppId,
        query: &RecordQuery,
    ) -> Result<Vec<Record>> {
        let app = require_app(&self.conn, app_id)?;
        require_right(&app, actor, Right::View)?;

        let mut sql = format!("SELECT {RECORD_COLUMNS} FROM records r WHERE r.app_id = ?");
        let mut values = vec![SqlValue::Text(app_id.to_string())];

        let view_filter = RecordViewFilter::for_user(&app.record_acl, actor);
        if let Some(clause) = compile_view_filter(&view_filter, &mut values) {
            sql.push_str(" AND ");
            sql.push_str(&clause);
        }
        for clause in compile_search_filters(&query.filters, &mut values)? {
            sql.push_str(" AND ");
            sql.push_str(&clause);
        }
        if let Some(status) = &query.status {
            sql.push_str(" AND r.status = ?");
            values.push(SqlValue::Text(status.clone()));
        }
        sql.push_str(" ORDER BY r.record_number DESC LIMIT ? OFFSET ?");
        values.push(SqlValue::Integer(sql_count(
            query.limit.unwrap_or(DEFAULT_LIST_LIMIT),
        )?));
        values.push(SqlValue::Integer(sql_count(query.skip)?));

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(values.iter()), parse_record_row)?;
        collect_rows(rows)
    }

    pub fn update_record(
        &mut self,
        actor: &User,
        record_id: RecordId,
        update: &RecordUpdate,
    ) -> Result<Record> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start record transaction")?;

        let record = require_record(&tx, record_id)?;
        let app = require_app(&tx, record.app_id)?;
        require_right(&app, actor, Right::Edit)?;
        require_visible(&app, &record, actor)?;

        let mut next = record.clone();
        for (key, value) in &update.data {
            next.data.insert(key.clone(), value.clone());
        }
        if let Some(status) = update
            .status
            .as_deref()
            .map(str::trim)
            .filter(|status| !status.is_empty() && *status != record.status)
        {
            tracing::warn!(
                record = %record_id,
                from = %record.status,
                to = %status,
                actor = %actor.id,
                "direct status override outside workflow"
            );
            next.status = status.to_string();
        }
        next.updated_at = now_utc();

        let next = write_record(&tx, &record, next)?;
        tx.commit().context("failed to commit record transaction")?;
        Ok(next)
    }

    pub fn delete_record(&mut self, actor: &User, record_id: RecordId) -> Result<()> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start record transaction")?;

        let record = require_record(&tx, record_id)?;
        let app = require_app(&tx, record.app_id)?;
        require_right(&app, actor, Right::Delete)?;
        require_visible(&app, &record, actor)?;

        tx.execute(
            "DELETE FROM records WHERE id = ?1",
            params![record_id.to_string()],
        )
        .context("failed to delete record")?;
        tx.commit().context("failed to commit record transaction")?;

        tracing::info!(record = %record_id, actor = %actor.id, "deleted record");
        Ok(())
    }

    // ---- workflow ------------------------------------------------------

    /// Runs one workflow transition as a single immediate transaction. The
    /// terminal notification, if any, is stored in the same transaction.
    pub fn execute_workflow_action(
        &mut self,
        actor: &User,
        record_id: RecordId,
        request: &ExecuteRequest,
    ) -> Result<Transition> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start workflow transaction")?;

        let record = require_record(&tx, record_id)?;
        let app = require_app(&tx, record.app_id)?;
        require_right(&app, actor, Right::View)?;

        let transition = execute_action(
            &app,
            &record,
            actor,
            request,
            &ConnDirectory(&tx),
            now_utc(),
        )?;
        ensure_history_appended(&record.workflow_history, &transition.record.workflow_history)?;

        let stored = write_record(&tx, &record, transition.record)?;
        if let Some(event) = &transition.notification {
            let mut sink = ConnSink(&tx);
            sink.deliver(event)?;
        }
        tx.commit().context("failed to commit workflow transaction")?;

        Ok(Transition {
            record: stored,
            notification: transition.notification,
        })
    }

    pub fn available_actions(
        &self,
        actor: &User,
        record_id: RecordId,
    ) -> Result<Vec<ActionDefinition>> {
        let record = self.get_record(actor, record_id)?;
        let app = require_app(&self.conn, record.app_id)?;
        Ok(
            app_builder_core::available_actions(&app.process_management, &record.status)
                .into_iter()
                .cloned()
                .collect(),
        )
    }

    pub fn preview_next_assignees(
        &self,
        actor: &User,
        record_id: RecordId,
        action_name: &str,
    ) -> Result<AssigneePreview> {
        let record = self.get_record(actor, record_id)?;
        let app = require_app(&self.conn, record.app_id)?;
        Ok(preview_next_assignees(
            &app,
            &record,
            action_name,
            &ConnDirectory(&self.conn),
        )?)
    }

    /// Records currently assigned to `actor`, newest first, limited to apps
    /// the actor can view.
    pub fn pending_approvals(&self, actor: &User, app_id: Option<AppId>) -> Result<Vec<Record>> {
        let mut sql = format!(
            "SELECT {RECORD_COLUMNS} FROM records r
             WHERE EXISTS (
               SELECT 1 FROM json_each(r.workflow_approver_ids_json) AS approver
               WHERE approver.value = ?
             )"
        );
        let mut values = vec![SqlValue::Text(actor.id.to_string())];
        if let Some(app_id) = app_id {
            sql.push_str(" AND r.app_id = ?");
            values.push(SqlValue::Text(app_id.to_string()));
        }
        sql.push_str(" ORDER BY r.rowid DESC");

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(values.iter()), parse_record_row)?;
        let records = collect_rows(rows)?;

        let app_ids: BTreeSet<AppId> = records.iter().map(|record| record.app_id).collect();
        let mut apps = Vec::with_capacity(app_ids.len());
        for app_id in app_ids {
            apps.push(require_app(&self.conn, app_id)?);
        }
        Ok(filter_pending_for_user(records, &apps, actor))
    }

    // ---- notifications -------------------------------------------------

    pub fn list_notifications(
        &self,
        user_id: UserId,
        query: &NotificationQuery,
    ) -> Result<Vec<Notification>> {
        let unread_clause = if query.unread_only {
            " AND read_at IS NULL"
        } else {
            ""
        };
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {NOTIFICATION_COLUMNS} FROM notifications
             WHERE user_id = ?1{unread_clause}
             ORDER BY rowid DESC LIMIT ?2 OFFSET ?3"
        ))?;
        let rows = stmt.query_map(
            params![
                user_id.to_string(),
                sql_count(query.limit.unwrap_or(DEFAULT_LIST_LIMIT))?,
                sql_count(query.skip)?
            ],
            parse_notification_row,
        )?;
        collect_rows(rows)
    }

    pub fn unread_notification_count(&self, user_id: UserId) -> Result<u64> {
        let count: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM notifications WHERE user_id = ?1 AND read_at IS NULL",
                params![user_id.to_string()],
                |row| row.get(0),
            )
            .context("failed to count unread notifications")?;
        u64::try_from(count).with_context(|| format!("invalid notification count: {count}"))
    }

    /// Marks one of the user's notifications as read. Other users'
    /// notifications are reported as not found.
    pub fn mark_notification_read(
        &self,
        user_id: UserId,
        notification_id: NotificationId,
    ) -> Result<Notification> {
        self.conn
            .execute(
                "UPDATE notifications SET read_at = COALESCE(read_at, ?3)
                 WHERE id = ?1 AND user_id = ?2",
                params![
                    notification_id.to_string(),
                    user_id.to_string(),
                    timestamp(now_utc())?
                ],
            )
            .context("failed to mark notification read")?;

        self.conn
            .query_row(
                &format!(
                    "SELECT {NOTIFICATION_COLUMNS} FROM notifications WHERE id = ?1 AND user_id = ?2"
                ),
                params![notification_id.to_string(), user_id.to_string()],
                parse_notification_row,
            )
            .optional()
            .context("failed to load notification")?
            .ok_or_else(|| not_found("notification", notification_id))
    }

    pub fn mark_all_notifications_read(&self, user_id: UserId) -> Result<usize> {
        self.conn
            .execute(
                "UPDATE notifications SET read_at = ?2 WHERE user_id = ?1 AND read_at IS NULL",
                params![user_id.to_string(), timestamp(now_utc())?],
            )
            .context("failed to mark notifications read")
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

impl OrgDirectory for SqliteAppStore {
    fn users_in_department(
        &self,
        department_id: DepartmentId,
    ) -> Result<BTreeSet<UserId>, EngineError> {
        ConnDirectory(&self.conn).users_in_department(department_id)
    }

    fn users_with_job_title(
        &self,
        job_title_id: JobTitleId,
    ) -> Result<BTreeSet<UserId>, EngineError> {
        ConnDirectory(&self.conn).users_with_job_title(job_title_id)
    }
}

struct ConnDirectory<'a>(&'a Connection);

impl ConnDirectory<'_> {
    fn user_ids(&self, sql: &str, key: String) -> Result<BTreeSet<UserId>, EngineError> {
        let lookup = || -> rusqlite::Result<BTreeSet<UserId>> {
            let mut stmt = self.0.prepare_cached(sql)?;
            let rows = stmt.query_map(params![key], |row| {
                let raw: String = row.get(0)?;
                parse_ulid_column(0, &raw).map(UserId)
            })?;
            rows.collect()
        };
        lookup().map_err(|err| EngineError::Directory(err.to_string()))
    }
}

impl OrgDirectory for ConnDirectory<'_> {
    fn users_in_department(
        &self,
        department_id: DepartmentId,
    ) -> Result<BTreeSet<UserId>, EngineError> {
        self.user_ids(
            "SELECT id FROM users WHERE department_id = ?1",
            department_id.to_string(),
        )
    }

    fn users_with_job_title(
        &self,
        job_title_id: JobTitleId,
    ) -> Result<BTreeSet<UserId>, EngineError> {
        self.user_ids(
            "SELECT id FROM users WHERE job_title_id = ?1",
            job_title_id.to_string(),
        )
    }
}

/// Stores engine notifications in the inbox table of the enclosing
/// transaction. Redelivery of the same event id is a no-op.
struct ConnSink<'a>(&'a Connection);

impl NotificationSink for ConnSink<'_> {
    fn deliver(&mut self, event: &NotificationEvent) -> Result<(), EngineError> {
        let created_at = format_rfc3339(now_utc())?;
        self.0
            .execute(
                "INSERT OR IGNORE INTO notifications(id, user_id, app_id, record_id, kind, title, message, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    event.event_id.to_string(),
                    event.user_id.to_string(),
                    event.app_id.to_string(),
                    event.record_id.to_string(),
                    event.kind.as_str(),
                    event.title,
                    event.message,
                    created_at
                ],
            )
            .map_err(|err| EngineError::Storage(format!("failed to store notification: {err}")))?;
        tracing::info!(
            notification = %event.event_id,
            user = %event.user_id,
            record = %event.record_id,
            "stored workflow notification"
        );
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
enum Right {
    View,
    Edit,
    Delete,
    Manage,
}

impl Right {
    fn as_str(self) -> &'static str {
        match self {
            Self::View => "view",
            Self::Edit => "edit",
            Self::Delete => "delete",
            Self::Manage => "manage",
        }
    }

    fn granted(self, permissions: AppPermissions) -> bool {
        match self {
            Self::View => permissions.view,
            Self::Edit => permissions.edit,
            Self::Delete => permissions.delete,
            Self::Manage => permissions.manage,
        }
    }
}

fn require_superuser(actor: &User, action: &str) -> Result<()> {
    if actor.is_superuser {
        return Ok(());
    }
    Err(EngineError::Forbidden(format!("only a superuser can {action}")).into())
}

fn require_right(app: &App, actor: &User, right: Right) -> Result<()> {
    if right.granted(evaluate_app_permissions(app, actor)) {
        return Ok(());
    }
    Err(EngineError::Forbidden(format!(
        "{} permission required on app {}",
        right.as_str(),
        app.id
    ))
    .into())
}

fn require_visible(app: &App, record: &Record, actor: &User) -> Result<()> {
    if can_view_record(record, actor, &app.record_acl) {
        return Ok(());
    }
    Err(EngineError::Forbidden(format!("record {} is not visible", record.id)).into())
}

fn require_app(conn: &Connection, app_id: AppId) -> Result<App> {
    conn.query_row(
        &format!("SELECT {APP_COLUMNS} FROM apps WHERE id = ?1"),
        params![app_id.to_string()],
        parse_app_row,
    )
    .optional()
    .context("failed to load app")?
    .ok_or_else(|| not_found("app", app_id))
}

fn require_record(conn: &Connection, record_id: RecordId) -> Result<Record> {
    conn.query_row(
        &format!("SELECT {RECORD_COLUMNS} FROM records r WHERE r.id = ?1"),
        params![record_id.to_string()],
        parse_record_row,
    )
    .optional()
    .context("failed to load record")?
    .ok_or_else(|| not_found("record", record_id))
}

fn not_found(kind: &str, id: impl std::fmt::Display) -> anyhow::Error {
    EngineError::NotFound(format!("{kind} not found: {id}")).into()
}

fn required_text(label: &str, value: &str) -> Result<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(EngineError::Validation(format!("{label} MUST be provided")).into());
    }
    Ok(trimmed.to_string())
}

fn validate_field_code(code: &str) -> Result<()> {
    if code.trim().is_empty() {
        return Err(EngineError::Validation("field code MUST be provided".to_string()).into());
    }
    if code.contains('"') {
        return Err(
            EngineError::Validation(format!("field code must not contain '\"': {code}")).into(),
        );
    }
    Ok(())
}

/// History is append-only: the stored history must be a prefix of the new one.
fn ensure_history_appended(stored: &[WorkflowEvent], next: &[WorkflowEvent]) -> Result<()> {
    if next.len() < stored.len() || next[..stored.len()] != *stored {
        return Err(anyhow!("workflow history may only be appended to"));
    }
    Ok(())
}

fn insert_field(
    conn: &Connection,
    app_id: AppId,
    field: &FieldDefinition,
    position: i64,
) -> Result<()> {
    conn.execute(
        "INSERT INTO app_fields(app_id, code, label, field_type, required, config_json, position)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            app_id.to_string(),
            field.code,
            field.label,
            field.field_type.as_str(),
            bool_to_sql(field.required),
            to_json_text(&field.config)?,
            position
        ],
    )
    .with_context(|| format!("failed to insert field {}", field.code))?;
    Ok(())
}

fn insert_record(conn: &Connection, record: &Record) -> Result<()> {
    conn.execute(
        "INSERT INTO records(
            id, app_id, record_number, data_json, status, created_by,
            workflow_requester_id, workflow_approver_ids_json, workflow_current_step,
            workflow_submitted_at, workflow_decided_at, workflow_history_json,
            created_at, updated_at, revision
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
        params![
            record.id.to_string(),
            record.app_id.to_string(),
            record.record_number,
            to_json_text(&record.data)?,
            record.status,
            record.created_by.map(|id| id.to_string()),
            record.workflow_requester_id.map(|id| id.to_string()),
            to_json_text(&record.workflow_approver_ids)?,
            i64::from(record.workflow_current_step),
            record.workflow_submitted_at.map(timestamp).transpose()?,
            record.workflow_decided_at.map(timestamp).transpose()?,
            to_json_text(&record.workflow_history)?,
            timestamp(record.created_at)?,
            timestamp(record.updated_at)?,
            record.revision
        ],
    )
    .context("failed to insert record")?;
    Ok(())
}

/// Writes `next` over `stored`, failing if someone else changed the row
/// since `stored` was read. Returns `next` with its bumped revision.
fn write_record(conn: &Connection, stored: &Record, mut next: Record) -> Result<Record> {
    next.revision = stored.revision + 1;
    let changed = conn
        .execute(
            "UPDATE records SET
                data_json = ?3, status = ?4,
                workflow_requester_id = ?5, workflow_approver_ids_json = ?6,
                workflow_current_step = ?7, workflow_submitted_at = ?8,
                workflow_decided_at = ?9, workflow_history_json = ?10,
                updated_at = ?11, revision = ?12
             WHERE id = ?1 AND revision = ?2",
            params![
                stored.id.to_string(),
                stored.revision,
                to_json_text(&next.data)?,
                next.status,
                next.workflow_requester_id.map(|id| id.to_string()),
                to_json_text(&next.workflow_approver_ids)?,
                i64::from(next.workflow_current_step),
                next.workflow_submitted_at.map(timestamp).transpose()?,
                next.workflow_decided_at.map(timestamp).transpose()?,
                to_json_text(&next.workflow_history)?,
                timestamp(next.updated_at)?,
                next.revision
            ],
        )
        .context("failed to write record")?;
    if changed == 0 {
        return Err(EngineError::Storage(format!(
            "record {} changed concurrently (expected revision {})",
            stored.id, stored.revision
        ))
        .into());
    }
    Ok(next)
}

fn parse_user_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    let id: String = row.get(0)?;
    let department_id: Option<String> = row.get(4)?;
    let job_title_id: Option<String> = row.get(5)?;
    Ok(User {
        id: UserId(parse_ulid_column(0, &id)?),
        email: row.get(1)?,
        full_name: row.get(2)?,
        is_superuser: row.get::<_, i64>(3)? != 0,
        department_id: department_id
            .map(|raw| parse_ulid_column(4, &raw).map(DepartmentId))
            .transpose()?,
        job_title_id: job_title_id
            .map(|raw| parse_ulid_column(5, &raw).map(JobTitleId))
            .transpose()?,
    })
}

fn parse_app_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<App> {
    let id: String = row.get(0)?;
    let created_by: Option<String> = row.get(3)?;
    let process_json: String = row.get(6)?;
    let process_value: Value = parse_json_column(6, &process_json)?;
    Ok(App {
        id: AppId(parse_ulid_column(0, &id)?),
        name: row.get(1)?,
        description: row.get(2)?,
        created_by: created_by
            .map(|raw| parse_ulid_column(3, &raw).map(UserId))
            .transpose()?,
        app_acl: parse_json_column(4, &row.get::<_, String>(4)?)?,
        record_acl: parse_json_column(5, &row.get::<_, String>(5)?)?,
        process_management: WorkflowDefinition::from_json(&process_value).map_err(to_sql_error)?,
    })
}

fn parse_field_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<FieldDefinition> {
    let field_type_raw: String = row.get(2)?;
    let field_type = FieldType::parse(&field_type_raw).ok_or_else(|| {
        invalid_column(
            2,
            rusqlite::types::Type::Text,
            format!("invalid field_type: {field_type_raw}"),
        )
    })?;
    Ok(FieldDefinition {
        code: row.get(0)?,
        label: row.get(1)?,
        field_type,
        required: row.get::<_, i64>(3)? != 0,
        config: parse_json_column(4, &row.get::<_, String>(4)?)?,
    })
}

fn parse_record_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Record> {
    let id: String = row.get(0)?;
    let app_id: String = row.get(1)?;
    let created_by: Option<String> = row.get(5)?;
    let requester: Option<String> = row.get(6)?;
    let current_step: i64 = row.get(8)?;
    let submitted_at: Option<String> = row.get(9)?;
    let decided_at: Option<String> = row.get(10)?;

    Ok(Record {
        id: RecordId(parse_ulid_column(0, &id)?),
        app_id: AppId(parse_ulid_column(1, &app_id)?),
        record_number: row.get(2)?,
        data: parse_json_column(3, &row.get::<_, String>(3)?)?,
        status: row.get(4)?,
        created_by: created_by
            .map(|raw| parse_ulid_column(5, &raw).map(UserId))
            .transpose()?,
        workflow_requester_id: requester
            .map(|raw| parse_ulid_column(6, &raw).map(UserId))
            .transpose()?,
        workflow_approver_ids: parse_json_column(7, &row.get::<_, String>(7)?)?,
        workflow_current_step: u32::try_from(current_step).map_err(|_| {
            invalid_column(
                8,
                rusqlite::types::Type::Integer,
                format!("invalid workflow_current_step: {current_step}"),
            )
        })?,
        workflow_submitted_at: submitted_at
            .as_deref()
            .map(parse_rfc3339_utc)
            .transpose()
            .map_err(to_sql_error)?,
        workflow_decided_at: decided_at
            .as_deref()
            .map(parse_rfc3339_utc)
            .transpose()
            .map_err(to_sql_error)?,
        workflow_history: parse_json_column(11, &row.get::<_, String>(11)?)?,
        created_at: parse_rfc3339_utc(&row.get::<_, String>(12)?).map_err(to_sql_error)?,
        updated_at: parse_rfc3339_utc(&row.get::<_, String>(13)?).map_err(to_sql_error)?,
        revision: row.get(14)?,
    })
}

fn parse_notification_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Notification> {
    let id: String = row.get(0)?;
    let user_id: String = row.get(1)?;
    let app_id: Option<String> = row.get(2)?;
    let record_id: Option<String> = row.get(3)?;
    let kind_raw: String = row.get(4)?;
    let read_at: Option<String> = row.get(8)?;

    let kind = NotificationKind::parse(&kind_raw).ok_or_else(|| {
        invalid_column(
            4,
            rusqlite::types::Type::Text,
            format!("invalid notification kind: {kind_raw}"),
        )
    })?;

    Ok(Notification {
        id: NotificationId(parse_ulid_column(0, &id)?),
        user_id: UserId(parse_ulid_column(1, &user_id)?),
        app_id: app_id
            .map(|raw| parse_ulid_column(2, &raw).map(AppId))
            .transpose()?,
        record_id: record_id
            .map(|raw| parse_ulid_column(3, &raw).map(RecordId))
            .transpose()?,
        kind,
        title: row.get(5)?,
        message: row.get(6)?,
        created_at: parse_rfc3339_utc(&row.get::<_, String>(7)?).map_err(to_sql_error)?,
        read_at: read_at
            .as_deref()
            .map(parse_rfc3339_utc)
            .transpose()
            .map_err(to_sql_error)?,
    })
}

fn parse_ulid_column(index: usize, raw: &str) -> rusqlite::Result<Ulid> {
    Ulid::from_string(raw).map_err(|_| {
        invalid_column(
            index,
            rusqlite::types::Type::Text,
            format!("invalid ULID: {raw}"),
        )
    })
}

fn parse_json_column<T: serde::de::DeserializeOwned>(
    index: usize,
    raw: &str,
) -> rusqlite::Result<T> {
    serde_json::from_str(raw).map_err(|err| {
        invalid_column(
            index,
            rusqlite::types::Type::Text,
            format!("invalid stored JSON: {err}"),
        )
    })
}

fn invalid_column(index: usize, ty: rusqlite::types::Type, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        index,
        ty,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

#[allow(clippy::needless_pass_by_value)]
fn to_sql_error(err: EngineError) -> rusqlite::Error {
    invalid_column(0, rusqlite::types::Type::Text, err.to_string())
}

fn to_json_text<T: serde::Serialize + ?Sized>(value: &T) -> Result<String> {
    serde_json::to_string(value).context("failed to serialize JSON column")
}

fn timestamp(value: time::OffsetDateTime) -> Result<String> {
    format_rfc3339(value).map_err(|err| anyhow!(err.to_string()))
}

fn bool_to_sql(value: bool) -> i64 {
    i64::from(value)
}

fn sql_count(value: usize) -> Result<i64> {
    i64::try_from(value).with_context(|| format!("count out of range: {value}"))
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row?);
    }
    Ok(values)
}
