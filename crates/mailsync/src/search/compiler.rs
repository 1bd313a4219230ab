//! Compiles condition trees into SQL selections with bound parameters
//!
//! The selection is written against the store's message query, where `m` is
//! the messages table, `f` the folders table and `t` the threads table.
//! Values never appear in the SQL text; every value is a bound parameter.

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use rusqlite::ToSql;
use rusqlite::types::ToSqlOutput;

use super::condition::{Attribute, SearchCondition, SearchConditionNode, SearchField};
use crate::error::CompileError;
use crate::models::Flag;

/// A bound query parameter
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryParam {
    Text(String),
    Integer(i64),
}

impl ToSql for QueryParam {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        match self {
            QueryParam::Text(s) => s.to_sql(),
            QueryParam::Integer(i) => i.to_sql(),
        }
    }
}

/// SQL boolean expression plus its parameters in placeholder order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledQuery {
    pub selection: String,
    pub params: Vec<QueryParam>,
}

impl CompiledQuery {
    pub fn new(selection: impl Into<String>, params: Vec<QueryParam>) -> Self {
        Self {
            selection: selection.into(),
            params,
        }
    }

    /// Selection matching every message
    pub fn match_all() -> Self {
        Self::new("1", Vec::new())
    }

    /// Messages of one folder, by local folder id
    pub fn in_folder(folder: crate::models::FolderId) -> Self {
        Self::new("m.folder_id = ?", vec![QueryParam::Integer(folder.0)])
    }

    /// Conjunction of two compiled queries
    pub fn and(self, other: CompiledQuery) -> Self {
        let mut params = self.params;
        params.extend(other.params);
        Self {
            selection: format!("({} AND {})", self.selection, other.selection),
            params,
        }
    }
}

/// Compile an optional tree; `None` matches everything
pub fn compile(node: Option<&SearchConditionNode>) -> Result<CompiledQuery, CompileError> {
    match node {
        Some(node) => compile_node(node),
        None => Ok(CompiledQuery::match_all()),
    }
}

/// Compile a condition tree
pub fn compile_node(node: &SearchConditionNode) -> Result<CompiledQuery, CompileError> {
    match node {
        SearchConditionNode::And(l, r) => binary(l, r, "AND"),
        SearchConditionNode::Or(l, r) => binary(l, r, "OR"),
        SearchConditionNode::Not(inner) => {
            let inner = compile_node(inner)?;
            Ok(CompiledQuery {
                selection: format!("NOT ({})", inner.selection),
                params: inner.params,
            })
        }
        SearchConditionNode::Condition(condition) => compile_condition(condition),
    }
}

fn binary(
    left: &SearchConditionNode,
    right: &SearchConditionNode,
    op: &str,
) -> Result<CompiledQuery, CompileError> {
    let left = compile_node(left)?;
    let right = compile_node(right)?;
    let mut params = left.params;
    params.extend(right.params);
    Ok(CompiledQuery {
        selection: format!("({} {op} {})", left.selection, right.selection),
        params,
    })
}

enum Column {
    Text(&'static str),
    Numeric(&'static str),
    Flag(Flag),
}

fn column(field: &SearchField) -> Option<Column> {
    Some(match field {
        SearchField::Subject => Column::Text("m.subject"),
        SearchField::Sender => Column::Text("m.sender"),
        SearchField::Recipient => Column::Text("m.recipients"),
        SearchField::Folder => Column::Text("f.server_id"),
        SearchField::MessageContents => Column::Text("m.preview"),
        SearchField::Date => Column::Numeric("m.date"),
        SearchField::Size => Column::Numeric("m.size"),
        SearchField::Id => Column::Numeric("m.id"),
        SearchField::ThreadRoot => Column::Numeric("t.root"),
        SearchField::Read => Column::Flag(Flag::Read),
        SearchField::Flagged => Column::Flag(Flag::Flagged),
        SearchField::Answered => Column::Flag(Flag::Answered),
        SearchField::Forwarded => Column::Flag(Flag::Forwarded),
        SearchField::Custom(_) => return None,
    })
}

fn compile_condition(condition: &SearchCondition) -> Result<CompiledQuery, CompileError> {
    let SearchCondition {
        field,
        attribute,
        value,
    } = condition;

    let unsupported = || CompileError::UnsupportedPredicate {
        field: field.to_string(),
        attribute: attribute.to_string(),
    };

    if let SearchField::Custom(custom) = field {
        if *attribute != Attribute::Contains {
            return Err(unsupported());
        }
        if custom.template.matches('?').count() != 1 {
            return Err(CompileError::InvalidValue {
                field: field.to_string(),
                value: custom.template.clone(),
            });
        }
        return Ok(CompiledQuery::new(
            custom.template.clone(),
            vec![QueryParam::Text(like_pattern(*attribute, value))],
        ));
    }

    match column(field).ok_or_else(unsupported)? {
        Column::Text(col) => match attribute {
            Attribute::Contains | Attribute::StartsWith | Attribute::EndsWith => {
                Ok(free_text(col, *attribute, value))
            }
            Attribute::Equals => Ok(CompiledQuery::new(
                format!("{col} LIKE ?"),
                vec![QueryParam::Text(value.clone())],
            )),
            Attribute::NotEquals => Ok(CompiledQuery::new(
                format!("{col} NOT LIKE ?"),
                vec![QueryParam::Text(value.clone())],
            )),
            Attribute::LessThan | Attribute::GreaterThan => Err(unsupported()),
        },
        Column::Numeric(col) => {
            let op = match attribute {
                Attribute::Contains | Attribute::StartsWith | Attribute::EndsWith => {
                    return Ok(free_text(col, *attribute, value));
                }
                Attribute::Equals => "=",
                Attribute::NotEquals => "!=",
                Attribute::LessThan => "<",
                Attribute::GreaterThan => ">",
            };
            let number = numeric_value(field, value)?;
            Ok(CompiledQuery::new(
                format!("{col} {op} ?"),
                vec![QueryParam::Integer(number)],
            ))
        }
        Column::Flag(flag) => {
            let wanted = match attribute {
                Attribute::Equals => parse_bool(field, value)?,
                Attribute::NotEquals => !parse_bool(field, value)?,
                _ => return Err(unsupported()),
            };
            let exists = "EXISTS (SELECT 1 FROM message_flags mf WHERE mf.message_id = m.id AND mf.flag = ?)";
            let selection = if wanted {
                exists.to_string()
            } else {
                format!("NOT {exists}")
            };
            Ok(CompiledQuery::new(
                selection,
                vec![QueryParam::Text(flag.storage_name())],
            ))
        }
    }
}

fn free_text(col: &str, attribute: Attribute, value: &str) -> CompiledQuery {
    CompiledQuery::new(
        format!("{col} LIKE ? ESCAPE '\\'"),
        vec![QueryParam::Text(like_pattern(attribute, value))],
    )
}

/// Escape LIKE wildcards with backslashes so the value matches literally
pub(crate) fn escape_like(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '\\' | '%' | '_') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Escape a user value and add the attribute's wildcards
fn like_pattern(attribute: Attribute, value: &str) -> String {
    let escaped = escape_like(value);
    match attribute {
        Attribute::StartsWith => format!("{escaped}%"),
        Attribute::EndsWith => format!("%{escaped}"),
        _ => format!("%{escaped}%"),
    }
}

fn numeric_value(field: &SearchField, value: &str) -> Result<i64, CompileError> {
    let trimmed = value.trim();
    if let Ok(n) = trimmed.parse::<i64>() {
        return Ok(n);
    }
    if *field == SearchField::Date
        && let Some(date) = parse_date(trimmed)
    {
        return Ok(date.timestamp_millis());
    }
    Err(CompileError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
    })
}

fn parse_date(input: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(input) {
        return Some(dt.with_timezone(&Utc));
    }
    ["%Y-%m-%d", "%Y/%m/%d"].iter().find_map(|fmt| {
        NaiveDate::parse_from_str(input, fmt)
            .ok()
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(|dt| Utc.from_utc_datetime(&dt))
    })
}

fn parse_bool(field: &SearchField, value: &str) -> Result<bool, CompileError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(CompileError::InvalidValue {
            field: field.to_string(),
            value: value.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::condition::CustomField;

    fn cond(field: SearchField, attribute: Attribute, value: &str) -> SearchConditionNode {
        SearchConditionNode::condition(field, attribute, value)
    }

    #[test]
    fn test_folder_and_subject() {
        let tree = cond(SearchField::Folder, Attribute::Equals, "INBOX").and(cond(
            SearchField::Subject,
            Attribute::Contains,
            "invoice",
        ));
        let compiled = compile_node(&tree).unwrap();
        assert_eq!(
            compiled.selection,
            "(f.server_id LIKE ? AND m.subject LIKE ? ESCAPE '\\')"
        );
        assert_eq!(
            compiled.params,
            vec![
                QueryParam::Text("INBOX".to_string()),
                QueryParam::Text("%invoice%".to_string())
            ]
        );
    }

    #[test]
    fn test_wildcards_escaped() {
        let compiled = compile_node(&cond(SearchField::Subject, Attribute::StartsWith, "50%_off\\"))
            .unwrap();
        assert_eq!(
            compiled.params,
            vec![QueryParam::Text("50\\%\\_off\\\\%".to_string())]
        );

        let compiled =
            compile_node(&cond(SearchField::Sender, Attribute::EndsWith, "example.com")).unwrap();
        assert_eq!(
            compiled.params,
            vec![QueryParam::Text("%example.com".to_string())]
        );
    }

    #[test]
    fn test_numeric_equality() {
        let compiled = compile_node(&cond(SearchField::Size, Attribute::Equals, "1024")).unwrap();
        assert_eq!(compiled.selection, "m.size = ?");
        assert_eq!(compiled.params, vec![QueryParam::Integer(1024)]);

        let compiled = compile_node(&cond(SearchField::Id, Attribute::NotEquals, "7")).unwrap();
        assert_eq!(compiled.selection, "m.id != ?");
    }

    #[test]
    fn test_numeric_invalid_value() {
        let err = compile_node(&cond(SearchField::Size, Attribute::Equals, "big")).unwrap_err();
        assert!(matches!(err, CompileError::InvalidValue { .. }));
    }

    #[test]
    fn test_date_accepts_calendar_dates() {
        let compiled =
            compile_node(&cond(SearchField::Date, Attribute::LessThan, "2024-01-02")).unwrap();
        assert_eq!(compiled.selection, "m.date < ?");
        assert_eq!(compiled.params, vec![QueryParam::Integer(1_704_153_600_000)]);
    }

    #[test]
    fn test_text_not_equals() {
        let compiled =
            compile_node(&cond(SearchField::Folder, Attribute::NotEquals, "Trash")).unwrap();
        assert_eq!(compiled.selection, "f.server_id NOT LIKE ?");
    }

    #[test]
    fn test_not_and_or() {
        let tree = cond(SearchField::Read, Attribute::Equals, "true")
            .or(cond(SearchField::Flagged, Attribute::Equals, "false"))
            .negate();
        let compiled = compile_node(&tree).unwrap();
        assert!(compiled.selection.starts_with("NOT ((EXISTS"));
        assert!(compiled.selection.contains(" OR NOT EXISTS"));
        assert_eq!(
            compiled.params,
            vec![
                QueryParam::Text("read".to_string()),
                QueryParam::Text("flagged".to_string())
            ]
        );
    }

    #[test]
    fn test_custom_field_requires_contains() {
        let custom = SearchField::Custom(CustomField::new(
            "keyword",
            "EXISTS (SELECT 1 FROM message_flags mf WHERE mf.message_id = m.id AND mf.flag LIKE ? ESCAPE '\\')",
        ));
        let ok = compile_node(&cond(custom.clone(), Attribute::Contains, "work")).unwrap();
        assert_eq!(ok.params, vec![QueryParam::Text("%work%".to_string())]);

        let err = compile_node(&cond(custom, Attribute::Equals, "work")).unwrap_err();
        assert!(matches!(err, CompileError::UnsupportedPredicate { .. }));
    }

    #[test]
    fn test_ordering_on_text_unsupported() {
        let err =
            compile_node(&cond(SearchField::Subject, Attribute::GreaterThan, "m")).unwrap_err();
        assert!(matches!(err, CompileError::UnsupportedPredicate { .. }));
    }

    #[test]
    fn test_compile_none_matches_all() {
        assert_eq!(compile(None).unwrap(), CompiledQuery::match_all());
    }
}
