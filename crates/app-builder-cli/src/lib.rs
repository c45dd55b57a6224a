//! Command surface for the app builder store.
//!
//! Every command prints pretty JSON on stdout. Failures are reported by the
//! binary as an [`ErrorEnvelope`] on stderr with an exit code per error kind.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use app_builder_core::{
    AppAclRule, AppId, DepartmentId, EngineError, ErrorKind, ExecuteRequest, FieldDefinition,
    FieldType, JobTitleId, NotificationId, RecordAclRule, RecordId, User, UserId,
    WorkflowDefinition,
};
use app_builder_store_sqlite::{
    NewUser, NotificationQuery, RecordQuery, RecordUpdate, SqliteAppStore,
};
use clap::{ArgAction, Args, Parser, Subcommand};
use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing_subscriber::EnvFilter;

pub const LOG_ENV: &str = "AB_LOG";

#[derive(Debug, Parser)]
#[command(name = "ab")]
#[command(about = "App builder access control and workflow CLI")]
pub struct Cli {
    #[arg(long, env = "AB_DB", default_value = "./app_builder.sqlite3", global = true)]
    db: PathBuf,

    /// Acting user id.
    #[arg(long = "as", value_name = "USER_ID", env = "AB_ACTOR", global = true)]
    actor: Option<String>,

    /// Raise log verbosity (`-v` info, `-vv` debug).
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    #[must_use]
    pub fn verbosity(&self) -> u8 {
        self.verbose
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    User {
        #[command(subcommand)]
        command: Box<UserCommand>,
    },
    Org {
        #[command(subcommand)]
        command: Box<OrgCommand>,
    },
    App {
        #[command(subcommand)]
        command: Box<AppCommand>,
    },
    Field {
        #[command(subcommand)]
        command: Box<FieldCommand>,
    },
    Record {
        #[command(subcommand)]
        command: Box<RecordCommand>,
    },
    Workflow {
        #[command(subcommand)]
        command: Box<WorkflowCommand>,
    },
    Notify {
        #[command(subcommand)]
        command: Box<NotifyCommand>,
    },
}

#[derive(Debug, Subcommand)]
pub enum UserCommand {
    /// Needs `--as` a superuser, except for the first user of a new database.
    Add(UserAddArgs),
    SetAffiliation(SetAffiliationArgs),
    Show(UserIdArgs),
    List,
}

#[derive(Debug, Args)]
pub struct UserAddArgs {
    #[arg(long)]
    email: String,
    #[arg(long)]
    full_name: Option<String>,
    #[arg(long)]
    superuser: bool,
    #[arg(long)]
    department_id: Option<String>,
    #[arg(long)]
    job_title_id: Option<String>,
}

#[derive(Debug, Args)]
pub struct SetAffiliationArgs {
    #[arg(long)]
    user_id: String,
    #[arg(long)]
    department_id: Option<String>,
    #[arg(long)]
    job_title_id: Option<String>,
}

#[derive(Debug, Args)]
pub struct UserIdArgs {
    #[arg(long)]
    user_id: String,
}

#[derive(Debug, Subcommand)]
pub enum OrgCommand {
    DepartmentAdd(DepartmentAddArgs),
    JobTitleAdd(JobTitleAddArgs),
}

#[derive(Debug, Args)]
pub struct DepartmentAddArgs {
    #[arg(long)]
    name: String,
    #[arg(long)]
    code: String,
}

#[derive(Debug, Args)]
pub struct JobTitleAddArgs {
    #[arg(long)]
    name: String,
    #[arg(long, default_value_t = 0)]
    rank: i64,
}

#[derive(Debug, Subcommand)]
pub enum AppCommand {
    Create(AppCreateArgs),
    Show(AppIdArgs),
    Permissions(AppIdArgs),
    SetAcl(AppDocumentArgs),
    SetRecordAcl(AppDocumentArgs),
    SetProcess(AppDocumentArgs),
}

#[derive(Debug, Args)]
pub struct AppCreateArgs {
    #[arg(long)]
    name: String,
    #[arg(long)]
    description: Option<String>,
}

#[derive(Debug, Args)]
pub struct AppIdArgs {
    #[arg(long)]
    app_id: String,
}

#[derive(Debug, Args)]
pub struct AppDocumentArgs {
    #[arg(long)]
    app_id: String,
    /// Inline JSON, or `@path` to read it from a file.
    #[arg(long)]
    json: String,
}

#[derive(Debug, Subcommand)]
pub enum FieldCommand {
    Add(FieldAddArgs),
    List(AppIdArgs),
    Replace(AppDocumentArgs),
}

#[derive(Debug, Args)]
pub struct FieldAddArgs {
    #[arg(long)]
    app_id: String,
    #[arg(long)]
    code: String,
    #[arg(long)]
    label: Option<String>,
    /// Field type, e.g. `SINGLE_LINE_TEXT` or `USER_SELECTION`.
    #[arg(long = "type")]
    field_type: String,
    #[arg(long)]
    required: bool,
    #[arg(long, default_value = "null")]
    config_json: String,
}

#[derive(Debug, Subcommand)]
pub enum RecordCommand {
    Create(RecordCreateArgs),
    Show(RecordIdArgs),
    List(RecordListArgs),
    Update(RecordUpdateArgs),
    Delete(RecordIdArgs),
}

#[derive(Debug, Args)]
pub struct RecordCreateArgs {
    #[arg(long)]
    app_id: String,
    #[arg(long, default_value = "{}")]
    data_json: String,
    #[arg(long)]
    status: Option<String>,
}

#[derive(Debug, Args)]
pub struct RecordIdArgs {
    #[arg(long)]
    record_id: String,
}

#[derive(Debug, Args)]
pub struct RecordListArgs {
    #[arg(long)]
    app_id: String,
    #[arg(long, default_value = "{}")]
    filter_json: String,
    #[arg(long)]
    status: Option<String>,
    #[arg(long, default_value_t = 0)]
    skip: usize,
    #[arg(long)]
    limit: Option<usize>,
}

#[derive(Debug, Args)]
pub struct RecordUpdateArgs {
    #[arg(long)]
    record_id: String,
    #[arg(long, default_value = "{}")]
    data_json: String,
    #[arg(long)]
    status: Option<String>,
}

#[derive(Debug, Subcommand)]
pub enum WorkflowCommand {
    Actions(RecordIdArgs),
    Preview(WorkflowPreviewArgs),
    Exec(WorkflowExecArgs),
    Pending(WorkflowPendingArgs),
}

#[derive(Debug, Args)]
pub struct WorkflowPreviewArgs {
    #[arg(long)]
    record_id: String,
    #[arg(long)]
    action: String,
}

#[derive(Debug, Args)]
pub struct WorkflowExecArgs {
    #[arg(long)]
    record_id: String,
    #[arg(long)]
    action: String,
    #[arg(long)]
    next_assignee_id: Option<String>,
    #[arg(long)]
    comment: Option<String>,
}

#[derive(Debug, Args)]
pub struct WorkflowPendingArgs {
    #[arg(long)]
    app_id: Option<String>,
}

#[derive(Debug, Subcommand)]
pub enum NotifyCommand {
    List(NotifyListArgs),
    Count,
    Read(NotifyReadArgs),
    ReadAll,
}

#[derive(Debug, Args)]
pub struct NotifyListArgs {
    #[arg(long)]
    unread_only: bool,
    #[arg(long, default_value_t = 0)]
    skip: usize,
    #[arg(long)]
    limit: Option<usize>,
}

#[derive(Debug, Args)]
pub struct NotifyReadArgs {
    #[arg(long)]
    notification_id: String,
}

/// Error body written to stderr by the `ab` binary.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ErrorEnvelope {
    pub error: ErrorPayload,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ErrorPayload {
    pub code: &'static str,
    pub message: String,
}

impl ErrorEnvelope {
    #[must_use]
    pub fn from_error(err: &anyhow::Error) -> Self {
        let (code, message) = match engine_error(err) {
            Some(engine) => (engine.kind().as_str(), engine.reason().to_string()),
            None => ("internal_error", format!("{err:#}")),
        };
        Self {
            error: ErrorPayload { code, message },
        }
    }
}

/// Process exit code for a failed command.
#[must_use]
pub fn exit_code(err: &anyhow::Error) -> u8 {
    match engine_error(err).map(EngineError::kind) {
        Some(ErrorKind::Forbidden) => 3,
        Some(ErrorKind::BadRequest) => 4,
        Some(ErrorKind::NotFound) => 5,
        Some(ErrorKind::Transient) => 6,
        None => 1,
    }
}

fn engine_error(err: &anyhow::Error) -> Option<&EngineError> {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<EngineError>())
}

fn default_log_filter(verbose: u8) -> &'static str {
    match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    }
}

/// Installs the stderr log subscriber. `AB_LOG` overrides the verbosity flags.
pub fn init_tracing(verbose: u8) {
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .unwrap_or_else(|_| EnvFilter::new(default_log_filter(verbose)));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Execute a parsed CLI command.
///
/// # Errors
/// Returns an error when the database cannot be opened or migrated, when an
/// argument does not parse, or when the store rejects the operation.
pub fn run_cli(cli: Cli) -> Result<()> {
    let mut store = open_store(&cli.db)?;
    let actor = cli.actor;
    match cli.command {
        Command::User { command } => run_user(*command, &store, actor.as_deref()),
        Command::Org { command } => {
            let actor = require_actor(&store, actor.as_deref())?;
            run_org(*command, &store, &actor)
        }
        Command::App { command } => {
            let actor = require_actor(&store, actor.as_deref())?;
            run_app(*command, &mut store, &actor)
        }
        Command::Field { command } => {
            let actor = require_actor(&store, actor.as_deref())?;
            run_field(*command, &mut store, &actor)
        }
        Command::Record { command } => {
            let actor = require_actor(&store, actor.as_deref())?;
            run_record(*command, &mut store, &actor)
        }
        Command::Workflow { command } => {
            let actor = require_actor(&store, actor.as_deref())?;
            run_workflow(*command, &mut store, &actor)
        }
        Command::Notify { command } => {
            let actor = require_actor(&store, actor.as_deref())?;
            run_notify(*command, &store, &actor)
        }
    }
}

fn open_store(db_path: &Path) -> Result<SqliteAppStore> {
    let store = SqliteAppStore::open(db_path)?;
    store.migrate()?;
    Ok(store)
}

fn require_actor(store: &SqliteAppStore, raw: Option<&str>) -> Result<User> {
    let raw = raw.ok_or_else(|| {
        EngineError::Validation("--as <USER_ID> is required for this command".to_string())
    })?;
    store.get_user(UserId::parse(raw)?)
}

fn run_user(command: UserCommand, store: &SqliteAppStore, actor: Option<&str>) -> Result<()> {
    match command {
        UserCommand::Add(args) => {
            let actor = actor.map(|raw| require_actor(store, Some(raw))).transpose()?;
            let user = store.create_user(
                actor.as_ref(),
                &NewUser {
                    email: args.email,
                    full_name: args.full_name,
                    is_superuser: args.superuser,
                    department_id: args.department_id.as_deref().map(DepartmentId::parse).transpose()?,
                    job_title_id: args.job_title_id.as_deref().map(JobTitleId::parse).transpose()?,
                },
            )?;
            print_json(&user)
        }
        UserCommand::SetAffiliation(args) => {
            let actor = require_actor(store, actor)?;
            let user = store.set_user_affiliation(
                &actor,
                UserId::parse(&args.user_id)?,
                args.department_id.as_deref().map(DepartmentId::parse).transpose()?,
                args.job_title_id.as_deref().map(JobTitleId::parse).transpose()?,
            )?;
            print_json(&user)
        }
        UserCommand::Show(args) => {
            require_actor(store, actor)?;
            print_json(&store.get_user(UserId::parse(&args.user_id)?)?)
        }
        UserCommand::List => {
            require_actor(store, actor)?;
            print_json(&store.list_users()?)
        }
    }
}

fn run_org(command: OrgCommand, store: &SqliteAppStore, actor: &User) -> Result<()> {
    match command {
        OrgCommand::DepartmentAdd(args) => {
            print_json(&store.create_department(actor, &args.name, &args.code)?)
        }
        OrgCommand::JobTitleAdd(args) => {
            print_json(&store.create_job_title(actor, &args.name, args.rank)?)
        }
    }
}

fn run_app(command: AppCommand, store: &mut SqliteAppStore, actor: &User) -> Result<()> {
    match command {
        AppCommand::Create(args) => {
            print_json(&store.create_app(actor, &args.name, args.description.as_deref())?)
        }
        AppCommand::Show(args) => print_json(&store.get_app(actor, AppId::parse(&args.app_id)?)?),
        AppCommand::Permissions(args) => {
            print_json(&store.app_permissions(actor, AppId::parse(&args.app_id)?)?)
        }
        AppCommand::SetAcl(args) => {
            let rules: Vec<AppAclRule> = parse_document(&args.json, "app acl")?;
            print_json(&store.replace_app_acl(actor, AppId::parse(&args.app_id)?, rules)?)
        }
        AppCommand::SetRecordAcl(args) => {
            let rules: Vec<RecordAclRule> = parse_document(&args.json, "record acl")?;
            print_json(&store.replace_record_acl(actor, AppId::parse(&args.app_id)?, rules)?)
        }
        AppCommand::SetProcess(args) => {
            let document: Value = parse_document(&args.json, "process definition")?;
            let definition = WorkflowDefinition::from_json(&document)?;
            print_json(&store.replace_process_definition(
                actor,
                AppId::parse(&args.app_id)?,
                definition,
            )?)
        }
    }
}

fn run_field(command: FieldCommand, store: &mut SqliteAppStore, actor: &User) -> Result<()> {
    match command {
        FieldCommand::Add(args) => {
            let field_type = FieldType::parse(&args.field_type).ok_or_else(|| {
                EngineError::Validation(format!("unsupported field type: {}", args.field_type))
            })?;
            let field = FieldDefinition {
                label: args.label.unwrap_or_else(|| args.code.clone()),
                code: args.code,
                field_type,
                required: args.required,
                config: parse_document(&args.config_json, "field config")?,
            };
            print_json(&store.add_field(actor, AppId::parse(&args.app_id)?, field)?)
        }
        FieldCommand::List(args) => {
            let app_id = AppId::parse(&args.app_id)?;
            store.get_app(actor, app_id)?;
            print_json(&store.list_fields(app_id)?)
        }
        FieldCommand::Replace(args) => {
            let fields: Vec<FieldDefinition> = parse_document(&args.json, "field list")?;
            print_json(&store.replace_fields(actor, AppId::parse(&args.app_id)?, fields)?)
        }
    }
}

fn run_record(command: RecordCommand, store: &mut SqliteAppStore, actor: &User) -> Result<()> {
    match command {
        RecordCommand::Create(args) => {
            let data: Map<String, Value> = parse_document(&args.data_json, "record data")?;
            print_json(&store.create_record(
                actor,
                AppId::parse(&args.app_id)?,
                data,
                args.status.as_deref(),
            )?)
        }
        RecordCommand::Show(args) => {
            print_json(&store.get_record(actor, RecordId::parse(&args.record_id)?)?)
        }
        RecordCommand::List(args) => {
            let query = RecordQuery {
                filters: parse_document(&args.filter_json, "record filter")?,
                status: args.status,
                skip: args.skip,
                limit: args.limit,
            };
            print_json(&store.list_records(actor, AppId::parse(&args.app_id)?, &query)?)
        }
        RecordCommand::Update(args) => {
            let update = RecordUpdate {
                data: parse_document(&args.data_json, "record data")?,
                status: args.status,
            };
            print_json(&store.update_record(actor, RecordId::parse(&args.record_id)?, &update)?)
        }
        RecordCommand::Delete(args) => {
            let record_id = RecordId::parse(&args.record_id)?;
            store.delete_record(actor, record_id)?;
            print_json(&json!({ "deleted": record_id }))
        }
    }
}

fn run_workflow(command: WorkflowCommand, store: &mut SqliteAppStore, actor: &User) -> Result<()> {
    match command {
        WorkflowCommand::Actions(args) => {
            print_json(&store.available_actions(actor, RecordId::parse(&args.record_id)?)?)
        }
        WorkflowCommand::Preview(args) => print_json(&store.preview_next_assignees(
            actor,
            RecordId::parse(&args.record_id)?,
            &args.action,
        )?),
        WorkflowCommand::Exec(args) => {
            let request = ExecuteRequest {
                action_name: args.action,
                next_assignee_id: args.next_assignee_id.as_deref().map(UserId::parse).transpose()?,
                comment: args.comment,
            };
            let transition =
                store.execute_workflow_action(actor, RecordId::parse(&args.record_id)?, &request)?;
            print_json(&json!({
                "record": transition.record,
                "notification": transition.notification,
            }))
        }
        WorkflowCommand::Pending(args) => {
            let app_id = args.app_id.as_deref().map(AppId::parse).transpose()?;
            print_json(&store.pending_approvals(actor, app_id)?)
        }
    }
}

fn run_notify(command: NotifyCommand, store: &SqliteAppStore, actor: &User) -> Result<()> {
    match command {
        NotifyCommand::List(args) => print_json(&store.list_notifications(
            actor.id,
            &NotificationQuery {
                unread_only: args.unread_only,
                skip: args.skip,
                limit: args.limit,
            },
        )?),
        NotifyCommand::Count => print_json(&json!({
            "unread": store.unread_notification_count(actor.id)?,
        })),
        NotifyCommand::Read(args) => print_json(&store.mark_notification_read(
            actor.id,
            NotificationId::parse(&args.notification_id)?,
        )?),
        NotifyCommand::ReadAll => print_json(&json!({
            "marked_read": store.mark_all_notifications_read(actor.id)?,
        })),
    }
}

/// Decodes an inline JSON argument, or the contents of a file for `@path`.
fn parse_document<T: serde::de::DeserializeOwned>(raw: &str, label: &str) -> Result<T> {
    let body = match raw.strip_prefix('@') {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {label} from {path}"))?,
        None => raw.to_string(),
    };
    serde_json::from_str(&body)
        .map_err(|err| EngineError::Validation(format!("invalid {label} JSON: {err}")).into())
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use ulid::Ulid;

    fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("unexpected error: {err:#}"),
        }
    }

    fn execute_cli(args: &[&str]) -> Result<()> {
        let cli = Cli::try_parse_from(args)?;
        run_cli(cli)
    }

    fn temp_db() -> PathBuf {
        std::env::temp_dir().join(format!("app-builder-cli-{}.sqlite3", Ulid::new()))
    }

    #[test]
    fn verbosity_raises_default_filter() {
        assert_eq!(default_log_filter(0), "warn");
        assert_eq!(default_log_filter(1), "info");
        assert_eq!(default_log_filter(4), "debug");
    }

    #[test]
    fn engine_errors_map_to_envelope_and_exit_code() {
        let err = anyhow::Error::from(EngineError::NotFound("record not found: x".to_string()))
            .context("while showing record");
        let envelope = ErrorEnvelope::from_error(&err);
        assert_eq!(envelope.error.code, "not_found");
        assert_eq!(envelope.error.message, "record not found: x");
        assert_eq!(exit_code(&err), 5);

        let forbidden = anyhow::Error::from(EngineError::Forbidden("nope".to_string()));
        assert_eq!(exit_code(&forbidden), 3);

        let other = anyhow::anyhow!("disk on fire");
        assert_eq!(ErrorEnvelope::from_error(&other).error.code, "internal_error");
        assert_eq!(exit_code(&other), 1);
    }

    #[test]
    fn documents_load_inline_or_from_file() {
        let inline: Vec<AppAclRule> =
            must(parse_document(r#"[{"entity_type": "everyone", "allow_view": true}]"#, "acl"));
        assert_eq!(inline.len(), 1);

        let path = std::env::temp_dir().join(format!("app-builder-doc-{}.json", Ulid::new()));
        must(fs::write(&path, r#"{"title": "Trip"}"#).map_err(anyhow::Error::from));
        let from_file: Map<String, Value> =
            must(parse_document(&format!("@{}", path.display()), "record data"));
        assert_eq!(from_file.get("title"), Some(&json!("Trip")));
        let _ = fs::remove_file(&path);

        let invalid = parse_document::<Value>("{not json", "record data");
        match invalid {
            Ok(value) => panic!("expected error, got {value}"),
            Err(err) => assert_eq!(exit_code(&err), 4),
        }
    }

    #[test]
    fn commands_needing_an_actor_reject_missing_as() {
        let db_path = temp_db();
        let db = db_path.display().to_string();
        let result = execute_cli(&["ab", "--db", &db, "app", "create", "--name", "Requests"]);
        match result {
            Ok(()) => panic!("expected missing actor to fail"),
            Err(err) => assert_eq!(exit_code(&err), 4),
        }

        let unknown = Ulid::new().to_string();
        let result = execute_cli(&[
            "ab", "--db", &db, "--as", &unknown, "app", "create", "--name", "Requests",
        ]);
        match result {
            Ok(()) => panic!("expected unknown actor to fail"),
            Err(err) => assert_eq!(exit_code(&err), 5),
        }
        let _ = fs::remove_file(&db_path);
    }

    #[test]
    fn user_and_app_commands_persist() {
        let db_path = temp_db();
        let db = db_path.display().to_string();
        must(execute_cli(&["ab", "--db", &db, "user", "add", "--email", "owner@example.com"]));

        let store = must(open_store(&db_path));
        let users = must(store.list_users());
        assert_eq!(users.len(), 1);
        let owner = users[0].id.to_string();
        drop(store);

        must(execute_cli(&[
            "ab", "--db", &db, "--as", &owner, "app", "create", "--name", "Requests",
        ]));
        let _ = fs::remove_file(&db_path);
    }

    #[test]
    fn directory_commands_need_a_superuser() {
        let db_path = temp_db();
        let db = db_path.display().to_string();
        must(execute_cli(&["ab", "--db", &db, "user", "add", "--email", "admin@example.com"]));
        let admin = must(must(open_store(&db_path)).list_users())[0].id.to_string();

        match execute_cli(&["ab", "--db", &db, "user", "add", "--email", "late@example.com"]) {
            Ok(()) => panic!("expected a second bootstrap to fail"),
            Err(err) => assert_eq!(exit_code(&err), 3),
        }

        must(execute_cli(&[
            "ab", "--db", &db, "--as", &admin, "user", "add", "--email", "member@example.com",
        ]));
        let member = match must(must(open_store(&db_path)).list_users())
            .into_iter()
            .find(|user| user.email == "member@example.com")
        {
            Some(user) => user,
            None => panic!("member was not stored"),
        };
        assert!(!member.is_superuser);
        let member = member.id.to_string();

        for args in [
            vec!["user", "add", "--email", "mallory@example.com", "--superuser"],
            vec!["org", "department-add", "--name", "Sales", "--code", "SAL"],
            vec!["org", "job-title-add", "--name", "Director"],
            vec!["user", "set-affiliation", "--user-id", member.as_str()],
        ] {
            let mut full = vec!["ab", "--db", db.as_str(), "--as", member.as_str()];
            full.extend(args.iter().copied());
            match execute_cli(&full) {
                Ok(()) => panic!("expected {args:?} to be forbidden"),
                Err(err) => assert_eq!(exit_code(&err), 3, "{args:?}"),
            }
        }

        must(execute_cli(&[
            "ab", "--db", &db, "--as", &admin, "org", "department-add", "--name", "Sales",
            "--code", "SAL",
        ]));
        let _ = fs::remove_file(&db_path);
    }
}
