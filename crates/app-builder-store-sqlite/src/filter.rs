//! Compiles record visibility and search predicates into SQL fragments over
//! the `records r` alias. Every fragment binds its values positionally, in
//! the order they are pushed onto `values`.

use anyhow::Result;
use app_builder_core::{
    coerce_condition_text, EngineError, FieldEquals, RecordViewFilter, ViewClause, ViewGrant,
};
use rusqlite::functions::FunctionFlags;
use rusqlite::types::Value as SqlValue;
use rusqlite::Connection;
use serde_json::{Map, Value};

/// SQL function returning the condition text of one data field, computed by
/// [`coerce_condition_text`] so listing and single-record checks agree.
pub(crate) const FIELD_TEXT_FUNCTION: &str = "ab_field_text";

/// Registers [`FIELD_TEXT_FUNCTION`] on a connection.
pub(crate) fn register_functions(conn: &Connection) -> rusqlite::Result<()> {
    conn.create_scalar_function(
        FIELD_TEXT_FUNCTION,
        2,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        |ctx| {
            let data: String = ctx.get(0)?;
            let field: String = ctx.get(1)?;
            let data: Map<String, Value> = serde_json::from_str(&data)
                .map_err(|err| rusqlite::Error::UserFunctionError(Box::new(err)))?;
            Ok(data.get(&field).and_then(coerce_condition_text))
        },
    )
}

fn coerced_field_sql(field: &str, values: &mut Vec<SqlValue>) -> String {
    values.push(SqlValue::Text(field.to_string()));
    format!("{FIELD_TEXT_FUNCTION}(r.data_json, ?)")
}

fn json_path(field: &str) -> String {
    format!("$.\"{field}\"")
}

fn field_equals_sql(test: &FieldEquals, values: &mut Vec<SqlValue>) -> String {
    let Some(expected) = &test.expected else {
        return "0".to_string();
    };
    let coerced = coerced_field_sql(&test.field, values);
    values.push(SqlValue::Text(expected.clone()));
    format!("COALESCE({coerced} = ?, 0)")
}

fn grant_sql(grant: ViewGrant, values: &mut Vec<SqlValue>) -> String {
    match grant {
        ViewGrant::Allow => "1".to_string(),
        ViewGrant::Deny => "0".to_string(),
        ViewGrant::Creator(user_id) => {
            values.push(SqlValue::Text(user_id.to_string()));
            "COALESCE(r.created_by = ?, 0)".to_string()
        }
    }
}

fn clause_sql(clause: &ViewClause, values: &mut Vec<SqlValue>) -> String {
    let mut parts = Vec::with_capacity(clause.unmatched.len() + 2);
    for test in &clause.unmatched {
        parts.push(format!("NOT {}", field_equals_sql(test, values)));
    }
    if let Some(test) = &clause.matched {
        parts.push(field_equals_sql(test, values));
    }
    parts.push(grant_sql(clause.grant, values));
    format!("({})", parts.join(" AND "))
}

/// Returns `None` when the filter admits every record.
#[must_use]
pub fn compile_view_filter(filter: &RecordViewFilter, values: &mut Vec<SqlValue>) -> Option<String> {
    match filter {
        RecordViewFilter::AllowAll => None,
        RecordViewFilter::AnyOf(clauses) if clauses.is_empty() => Some("0".to_string()),
        RecordViewFilter::AnyOf(clauses) => {
            let compiled: Vec<String> = clauses
                .iter()
                .map(|clause| clause_sql(clause, values))
                .collect();
            Some(format!("({})", compiled.join(" OR ")))
        }
    }
}

/// Search filters over record data. Strings match as case-insensitive
/// substrings and other values compare by their condition text. Null and
/// empty-string values are ignored.
///
/// # Errors
/// Returns [`EngineError::Validation`] for field codes that cannot be
/// addressed as a JSON path.
pub fn compile_search_filters(
    filters: &Map<String, Value>,
    values: &mut Vec<SqlValue>,
) -> Result<Vec<String>> {
    let mut clauses = Vec::with_capacity(filters.len());
    for (field, expected) in filters {
        if field.is_empty() || field.contains('"') {
            return Err(EngineError::Validation(format!("invalid filter field: {field}")).into());
        }
        match expected {
            Value::Null => {}
            Value::String(text) if text.is_empty() => {}
            Value::String(text) => {
                values.push(SqlValue::Text(json_path(field)));
                values.push(SqlValue::Text(format!("%{}%", escape_like(text))));
                clauses.push(
                    "CAST(json_extract(r.data_json, ?) AS TEXT) LIKE ? ESCAPE '\\'".to_string(),
                );
            }
            other => {
                let test = FieldEquals {
                    field: field.clone(),
                    expected: coerce_condition_text(other),
                };
                clauses.push(field_equals_sql(&test, values));
            }
        }
    }
    Ok(clauses)
}

fn escape_like(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for ch in text.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;
    use app_builder_core::UserId;

    #[test]
    fn allow_all_compiles_to_nothing() {
        let mut values = Vec::new();
        assert!(compile_view_filter(&RecordViewFilter::AllowAll, &mut values).is_none());
        assert!(values.is_empty());
    }

    #[test]
    fn null_expectation_never_matches() {
        let mut values = Vec::new();
        let sql = field_equals_sql(
            &FieldEquals {
                field: "category".to_string(),
                expected: None,
            },
            &mut values,
        );
        assert_eq!(sql, "0");
        assert!(values.is_empty());
    }

    #[test]
    fn placeholders_line_up_with_bound_values() {
        let viewer = UserId::new();
        let filter = RecordViewFilter::AnyOf(vec![
            ViewClause {
                unmatched: Vec::new(),
                matched: Some(FieldEquals {
                    field: "category".to_string(),
                    expected: Some("secret".to_string()),
                }),
                grant: ViewGrant::Creator(viewer),
            },
            ViewClause {
                unmatched: vec![FieldEquals {
                    field: "category".to_string(),
                    expected: Some("secret".to_string()),
                }],
                matched: None,
                grant: ViewGrant::Allow,
            },
        ]);
        let mut values = Vec::new();
        let sql = compile_view_filter(&filter, &mut values).unwrap_or_default();
        assert_eq!(sql.matches('?').count(), values.len());
        assert_eq!(values.len(), 5);
    }

    #[test]
    fn blank_search_values_are_ignored() {
        let mut filters = Map::new();
        filters.insert("title".to_string(), Value::String(String::new()));
        filters.insert("note".to_string(), Value::Null);
        let mut values = Vec::new();
        let clauses = match compile_search_filters(&filters, &mut values) {
            Ok(clauses) => clauses,
            Err(err) => panic!("compile: {err:#}"),
        };
        assert!(clauses.is_empty());
        assert!(values.is_empty());
    }

    #[test]
    fn field_text_function_uses_condition_coercion() {
        let conn = match Connection::open_in_memory() {
            Ok(conn) => conn,
            Err(err) => panic!("open: {err}"),
        };
        if let Err(err) = register_functions(&conn) {
            panic!("register: {err}");
        }
        let text = |data: &str, field: &str| -> Option<String> {
            match conn.query_row(
                &format!("SELECT {FIELD_TEXT_FUNCTION}(?1, ?2)"),
                rusqlite::params![data, field],
                |row| row.get(0),
            ) {
                Ok(value) => value,
                Err(err) => panic!("query: {err}"),
            }
        };
        assert_eq!(text(r#"{"amount": 1e20}"#, "amount").as_deref(), Some("1e20"));
        assert_eq!(text(r#"{"amount": 1e-7}"#, "amount").as_deref(), Some("1e-7"));
        assert_eq!(text(r#"{"amount": 12345.678}"#, "amount").as_deref(), Some("12345.678"));
        assert_eq!(text(r#"{"flag": true}"#, "flag").as_deref(), Some("true"));
        assert_eq!(text(r#"{"note": null}"#, "note"), None);
        assert_eq!(text("{}", "missing"), None);
    }

    #[test]
    fn like_patterns_escape_wildcards() {
        assert_eq!(escape_like("50%_off\\"), "50\\%\\_off\\\\");
    }

    #[test]
    fn quoted_filter_fields_are_rejected() {
        let mut filters = Map::new();
        filters.insert("bad\"field".to_string(), Value::Bool(true));
        let mut values = Vec::new();
        assert!(compile_search_filters(&filters, &mut values).is_err());
    }
}
