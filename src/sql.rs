use sqlparser::ast::{
    self, Expr, FromTable, LimitClause, ObjectNamePart, SetExpr, Statement, TableFactor,
    TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;

use crate::limits::*;
use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertCase {
        input: NewCaseInput,
    },
    ScheduleCase {
        case_id: String,
    },
    DeleteCase {
        id: String,
    },
    SelectCases {
        id: Option<String>,
    },
    SelectTasks {
        case_id: String,
    },
    SelectRooms,
    SelectNotifications {
        limit: usize,
    },
    SelectSnapshot,
    SelectAvailability {
        start: Ms,
        end: Ms,
    },
    Listen {
        channel: String,
    },
}

/// Positional column order for `INSERT INTO cases VALUES (...)` without a column list.
const CASE_COLUMNS: [&str; 4] = [
    "patient_name",
    "procedure_name",
    "priority",
    "requested_datetime",
];

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    if sql.len() > MAX_QUERY_LEN {
        return Err(SqlError::Parse("query too long".into()));
    }
    let trimmed = sql.trim();
    if trimmed.get(..7).is_some_and(|kw| kw.eq_ignore_ascii_case("LISTEN ")) {
        let channel = trimmed[7..].trim().trim_matches(';').trim().to_string();
        return Ok(Command::Listen { channel });
    }

    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }

    match &stmts[0] {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = extract_insert_values(insert)?;

    match table.as_str() {
        "cases" => parse_insert_case(insert, &values),
        "schedules" => {
            let case_id = match insert_columns(insert).iter().position(|c| c == "case_id") {
                Some(i) => values.get(i),
                None => values.first(),
            }
            .ok_or(SqlError::WrongArity("schedules", 1, 0))?;
            Ok(Command::ScheduleCase {
                case_id: parse_string(case_id)?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_insert_case(insert: &ast::Insert, values: &[Expr]) -> Result<Command, SqlError> {
    let mut columns = insert_columns(insert);
    if columns.is_empty() {
        columns = CASE_COLUMNS[..values.len().min(CASE_COLUMNS.len())]
            .iter()
            .map(|c| c.to_string())
            .collect();
    }
    if columns.len() != values.len() {
        return Err(SqlError::WrongArity("cases", columns.len(), values.len()));
    }

    let (mut patient_name, mut procedure_name, mut priority, mut requested_at) =
        (None, None, None, None);
    for (column, value) in columns.iter().zip(values) {
        match column.as_str() {
            "patient_name" => patient_name = Some(parse_string(value)?),
            "procedure_name" => procedure_name = Some(parse_string(value)?),
            "priority" => priority = parse_priority(value)?,
            "requested_datetime" => requested_at = Some(parse_timestamp_expr(value)?),
            other => return Err(SqlError::UnknownColumn(other.to_string())),
        }
    }

    Ok(Command::InsertCase {
        input: NewCaseInput {
            patient_name: patient_name.ok_or(SqlError::MissingColumn("patient_name"))?,
            procedure_name: procedure_name.ok_or(SqlError::MissingColumn("procedure_name"))?,
            priority: priority.unwrap_or_default(),
            requested_at: requested_at.ok_or(SqlError::MissingColumn("requested_datetime"))?,
        },
    })
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    match table.as_str() {
        "cases" => Ok(Command::DeleteCase {
            id: extract_where_eq(&delete.selection, "id")?
                .ok_or(SqlError::MissingFilter("id"))?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let table = table_factor_name(&select.from[0].relation)?;

    match table.as_str() {
        "cases" => Ok(Command::SelectCases {
            id: extract_where_eq(&select.selection, "id")?,
        }),
        "tasks" => Ok(Command::SelectTasks {
            case_id: extract_where_eq(&select.selection, "case_id")?
                .ok_or(SqlError::MissingFilter("case_id"))?,
        }),
        "rooms" => Ok(Command::SelectRooms),
        "snapshot" => Ok(Command::SelectSnapshot),
        "notifications" => {
            let limit = match extract_limit(query)? {
                Some(n) => usize::try_from(n)
                    .map_err(|_| SqlError::BadValue(format!("LIMIT {n}")))?,
                None => NOTIFICATION_LIMIT,
            };
            Ok(Command::SelectNotifications { limit })
        }
        "availability" => {
            let (mut start, mut end) = (None, None);
            if let Some(selection) = &select.selection {
                extract_window_filters(selection, &mut start, &mut end)?;
            }
            Ok(Command::SelectAvailability {
                start: start.ok_or(SqlError::MissingFilter("start"))?,
                end: end.ok_or(SqlError::MissingFilter("end"))?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn extract_window_filters(
    expr: &Expr,
    start: &mut Option<Ms>,
    end: &mut Option<Ms>,
) -> Result<(), SqlError> {
    if let Expr::BinaryOp { left, op, right } = expr {
        match op {
            ast::BinaryOperator::And => {
                extract_window_filters(left, start, end)?;
                extract_window_filters(right, start, end)?;
            }
            ast::BinaryOperator::GtEq => {
                if expr_column_name(left).as_deref() == Some("start") {
                    *start = Some(parse_timestamp_expr(right)?);
                }
            }
            ast::BinaryOperator::LtEq => {
                if expr_column_name(left).as_deref() == Some("end") {
                    *end = Some(parse_timestamp_expr(right)?);
                }
            }
            _ => {}
        }
    }
    Ok(())
}

fn extract_limit(query: &ast::Query) -> Result<Option<i64>, SqlError> {
    let limit = match &query.limit_clause {
        Some(LimitClause::LimitOffset { limit, .. }) => limit.as_ref(),
        Some(LimitClause::OffsetCommaLimit { limit, .. }) => Some(limit),
        None => None,
    };
    limit.map(parse_i64_expr).transpose()
}

// ── Helpers ───────────────────────────────────────────────────

fn object_name_last(name: &ast::ObjectName) -> Option<String> {
    name.0.last().and_then(|part| match part {
        ObjectNamePart::Identifier(ident) => Some(ident.value.to_lowercase()),
        _ => None,
    })
}

fn insert_table_name(insert: &ast::Insert) -> Result<String, SqlError> {
    match &insert.table {
        TableObject::TableName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("unsupported table object in INSERT".into())),
    }
}

/// Lowercased column list, quotes stripped.
fn insert_columns(insert: &ast::Insert) -> Vec<String> {
    insert
        .columns
        .iter()
        .map(|c| c.to_string().trim_matches('"').to_lowercase())
        .collect()
}

fn delete_table_name(delete: &ast::Delete) -> Result<String, SqlError> {
    let tables_with_joins = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    if let Some(first) = tables_with_joins.first() {
        table_factor_name(&first.relation)
    } else {
        Err(SqlError::Parse("DELETE without table".into()))
    }
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn extract_insert_values(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [] => Err(SqlError::Parse("empty VALUES".into())),
            [row] => Ok(row.clone()),
            _ => Err(SqlError::Unsupported("multi-row INSERT".into())),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

/// `WHERE <column> = <value>`. `Ok(None)` when there is no WHERE clause.
fn extract_where_eq(selection: &Option<Expr>, column: &'static str) -> Result<Option<String>, SqlError> {
    let Some(sel) = selection.as_ref() else {
        return Ok(None);
    };
    match sel {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } if expr_column_name(left).as_deref() == Some(column) => parse_string(right).map(Some),
        _ => Err(SqlError::MissingFilter(column)),
    }
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        _ => None,
    }
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) | Some(Value::Number(s, _)) => Ok(s.clone()),
        Some(value) => Err(SqlError::BadValue(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_priority(expr: &Expr) -> Result<Option<Priority>, SqlError> {
    if let Some(Value::Null) = extract_value(expr) {
        return Ok(None);
    }
    let s = parse_string(expr)?;
    Priority::parse(&s)
        .map(Some)
        .ok_or_else(|| SqlError::BadValue(format!("unknown priority: {s}")))
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::BadValue(format!("bad integer {s}: {e}"))),
            _ => Err(SqlError::BadValue(format!("expected number, got {value}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64_expr(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr}")))
    }
}

/// ISO-8601 text or Unix milliseconds.
fn parse_timestamp_expr(expr: &Expr) -> Result<Ms, SqlError> {
    if let Some(Value::SingleQuotedString(s)) = extract_value(expr) {
        if let Some(ms) = parse_iso(s) {
            return Ok(ms);
        }
    }
    parse_i64_expr(expr).map_err(|_| SqlError::BadValue(format!("bad timestamp: {expr}")))
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    UnknownColumn(String),
    WrongArity(&'static str, usize, usize),
    MissingFilter(&'static str),
    MissingColumn(&'static str),
    BadValue(String),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::UnknownColumn(c) => write!(f, "unknown column: {c}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
            SqlError::MissingColumn(col) => write!(f, "missing column: {col}"),
            SqlError::BadValue(s) => write!(f, "bad value: {s}"),
        }
    }
}

impl std::error::Error for SqlError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_insert_case_with_columns() {
        let sql = "INSERT INTO cases (patient_name, procedure_name, priority, requested_datetime) \
                   VALUES ('Ana Ruiz', 'Appendectomy', 'urgent', '2025-11-15T09:00:00Z')";
        match parse_sql(sql).unwrap() {
            Command::InsertCase { input } => {
                assert_eq!(input.patient_name, "Ana Ruiz");
                assert_eq!(input.procedure_name, "Appendectomy");
                assert_eq!(input.priority, Priority::Urgent);
                assert_eq!(input.requested_at, 1_763_197_200_000);
            }
            cmd => panic!("expected InsertCase, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_insert_case_reordered_and_defaulted() {
        let sql = "INSERT INTO cases (requested_datetime, procedure_name, patient_name) \
                   VALUES (1763197200000, 'Hernia repair', 'Bo')";
        match parse_sql(sql).unwrap() {
            Command::InsertCase { input } => {
                assert_eq!(input.patient_name, "Bo");
                assert_eq!(input.priority, Priority::Elective);
                assert_eq!(input.requested_at, 1_763_197_200_000);
            }
            cmd => panic!("expected InsertCase, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_insert_case_positional() {
        let sql = "INSERT INTO cases VALUES ('Ana', 'Appendectomy', NULL, '2025-11-15 09:00')";
        match parse_sql(sql).unwrap() {
            Command::InsertCase { input } => {
                assert_eq!(input.priority, Priority::Elective);
                assert_eq!(input.requested_at, 1_763_197_200_000);
            }
            cmd => panic!("expected InsertCase, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_insert_case_rejects_bad_values() {
        let bad_priority = "INSERT INTO cases (patient_name, procedure_name, priority, requested_datetime) \
                            VALUES ('Ana', 'X', 'whenever', '2025-11-15T09:00:00Z')";
        assert!(matches!(parse_sql(bad_priority), Err(SqlError::BadValue(_))));

        let bad_time = "INSERT INTO cases (patient_name, procedure_name, requested_datetime) \
                        VALUES ('Ana', 'X', 'next tuesday')";
        assert!(matches!(parse_sql(bad_time), Err(SqlError::BadValue(_))));

        let missing = "INSERT INTO cases (patient_name, procedure_name) VALUES ('Ana', 'X')";
        assert!(matches!(
            parse_sql(missing),
            Err(SqlError::MissingColumn("requested_datetime"))
        ));

        let unknown = "INSERT INTO cases (patient_name, surgeon) VALUES ('Ana', 'X')";
        assert!(matches!(parse_sql(unknown), Err(SqlError::UnknownColumn(_))));
    }

    #[test]
    fn parse_schedule() {
        let sql = "INSERT INTO schedules (case_id) VALUES ('CASE-01ABCDEF')";
        assert_eq!(
            parse_sql(sql).unwrap(),
            Command::ScheduleCase {
                case_id: "CASE-01ABCDEF".into()
            }
        );
    }

    #[test]
    fn parse_delete_case() {
        let sql = "DELETE FROM cases WHERE id = 'CASE-01ABCDEF'";
        assert_eq!(
            parse_sql(sql).unwrap(),
            Command::DeleteCase {
                id: "CASE-01ABCDEF".into()
            }
        );
        assert!(matches!(
            parse_sql("DELETE FROM cases"),
            Err(SqlError::MissingFilter("id"))
        ));
    }

    #[test]
    fn parse_select_cases() {
        assert_eq!(
            parse_sql("SELECT * FROM cases").unwrap(),
            Command::SelectCases { id: None }
        );
        assert_eq!(
            parse_sql("SELECT * FROM cases WHERE id = 'CASE-1'").unwrap(),
            Command::SelectCases {
                id: Some("CASE-1".into())
            }
        );
    }

    #[test]
    fn parse_select_tasks_requires_case_id() {
        assert_eq!(
            parse_sql("SELECT * FROM tasks WHERE case_id = 'CASE-1'").unwrap(),
            Command::SelectTasks {
                case_id: "CASE-1".into()
            }
        );
        assert!(matches!(
            parse_sql("SELECT * FROM tasks"),
            Err(SqlError::MissingFilter("case_id"))
        ));
    }

    #[test]
    fn parse_select_notifications_limit() {
        assert_eq!(
            parse_sql("SELECT * FROM notifications").unwrap(),
            Command::SelectNotifications {
                limit: NOTIFICATION_LIMIT
            }
        );
        assert_eq!(
            parse_sql("SELECT * FROM notifications LIMIT 5").unwrap(),
            Command::SelectNotifications { limit: 5 }
        );
    }

    #[test]
    fn parse_select_rooms_and_snapshot() {
        assert_eq!(parse_sql("SELECT * FROM rooms").unwrap(), Command::SelectRooms);
        assert_eq!(parse_sql("SELECT * FROM snapshot").unwrap(), Command::SelectSnapshot);
    }

    #[test]
    fn parse_select_availability() {
        let sql = "SELECT * FROM availability WHERE start >= '2025-11-15T08:00:00Z' AND \"end\" <= 1763208000000";
        assert_eq!(
            parse_sql(sql).unwrap(),
            Command::SelectAvailability {
                start: 1_763_193_600_000,
                end: 1_763_208_000_000,
            }
        );
        let missing = "SELECT * FROM availability WHERE start >= 0";
        assert!(matches!(parse_sql(missing), Err(SqlError::MissingFilter("end"))));
    }

    #[test]
    fn parse_listen() {
        assert_eq!(
            parse_sql("LISTEN notifications;").unwrap(),
            Command::Listen {
                channel: "notifications".into()
            }
        );
        assert_eq!(
            parse_sql("listen case_CASE-1").unwrap(),
            Command::Listen {
                channel: "case_CASE-1".into()
            }
        );
    }

    #[test]
    fn parse_unknown_table_errors() {
        assert!(matches!(
            parse_sql("SELECT * FROM bookings"),
            Err(SqlError::UnknownTable(_))
        ));
        assert!(matches!(
            parse_sql("INSERT INTO rooms (id) VALUES ('OR-9')"),
            Err(SqlError::UnknownTable(_))
        ));
    }

    #[test]
    fn parse_empty_errors() {
        assert!(matches!(parse_sql(""), Err(SqlError::Empty)));
    }
}
