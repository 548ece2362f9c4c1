use chrono::NaiveDate;
use sqlparser::ast::{self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use thiserror::Error;
use ulid::Ulid;

use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertResource(NewResource),
    SetResourceStatus {
        resource_id: Ulid,
        status: ResourceStatus,
    },
    DeleteResource {
        id: Ulid,
    },
    InsertCapacity {
        resource_id: Ulid,
        capacity: NewCapacity,
    },
    DeleteCapacity {
        id: Ulid,
    },
    InsertAllocation(AllocationRequest),
    DeleteAllocation {
        id: Ulid,
    },
    Transition {
        allocation_id: Ulid,
        status: AllocationStatus,
    },
    Optimize {
        project_id: String,
        requests: Vec<PendingRequest>,
    },
    SelectResources {
        search: Option<String>,
        kind: Option<ResourceKind>,
    },
    SelectCapacities {
        resource_id: Ulid,
    },
    SelectAllocations(AllocationFilter),
    SelectConflicts {
        scope: ConflictScope,
        start: NaiveDate,
        end: NaiveDate,
    },
    /// `resource_id: None` reports every resource.
    SelectUtilization {
        resource_id: Option<Ulid>,
        start: NaiveDate,
        end: NaiveDate,
    },
}

/// Every given field must match.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllocationFilter {
    pub resource_id: Option<Ulid>,
    pub project_id: Option<String>,
    pub status: Option<AllocationStatus>,
}

impl AllocationFilter {
    pub fn matches(&self, a: &ResourceAllocation) -> bool {
        self.resource_id.is_none_or(|id| id == a.resource_id)
            && self.project_id.as_ref().is_none_or(|p| *p == a.project_id)
            && self.status.is_none_or(|s| s == a.status)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictScope {
    Resource(Ulid),
    Project(String),
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
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

// ── INSERT ────────────────────────────────────────────────────

/// One VALUES tuple keyed by the INSERT column list.
struct Row<'a> {
    table: &'static str,
    columns: &'a [String],
    values: &'a [Expr],
}

impl<'a> Row<'a> {
    fn new(
        table: &'static str,
        columns: &'a [String],
        values: &'a [Expr],
        known: &[&str],
    ) -> Result<Self, SqlError> {
        if columns.len() != values.len() {
            return Err(SqlError::WrongArity(table, columns.len(), values.len()));
        }
        if let Some(unknown) = columns.iter().find(|c| !known.contains(&c.as_str())) {
            return Err(SqlError::UnknownColumn(table, unknown.clone()));
        }
        Ok(Self { table, columns, values })
    }

    /// The value for `column`, with NULL treated as absent.
    fn get(&self, column: &str) -> Option<&'a Expr> {
        let pos = self.columns.iter().position(|c| c == column)?;
        let values: &'a [Expr] = self.values;
        let expr = &values[pos];
        match extract_value(expr) {
            Some(Value::Null) => None,
            _ => Some(expr),
        }
    }

    fn required(&self, column: &'static str) -> Result<&'a Expr, SqlError> {
        self.get(column).ok_or(SqlError::MissingColumn(self.table, column))
    }
}

const RESOURCE_COLUMNS: &[&str] = &[
    "kind",
    "name",
    "code",
    "status",
    "skills",
    "certifications",
    "rate",
    "basis",
    "currency",
];
const RESOURCE_STATUS_COLUMNS: &[&str] = &["resource_id", "status"];
const CAPACITY_COLUMNS: &[&str] = &["resource_id", "start", "end", "quantity", "unit"];
const ALLOCATION_COLUMNS: &[&str] = &[
    "resource_id",
    "project_id",
    "start",
    "end",
    "quantity",
    "priority",
    "task_id",
    "notes",
];
const TRANSITION_COLUMNS: &[&str] = &["allocation_id", "status"];
const OPTIMIZE_COLUMNS: &[&str] = &[
    "project_id",
    "resource_id",
    "start",
    "end",
    "quantity",
    "priority",
    "task_id",
    "notes",
];

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let columns: Vec<String> = insert.columns.iter().map(|c| c.value.to_lowercase()).collect();
    if columns.is_empty() {
        return Err(SqlError::Parse(format!("INSERT INTO {table} needs a column list")));
    }
    let rows = extract_all_insert_rows(insert)?;

    if table == "optimize" {
        return parse_optimize(&columns, &rows);
    }
    let values = match rows.as_slice() {
        [single] => single,
        _ => return Err(SqlError::Unsupported(format!("multi-row INSERT into {table}"))),
    };

    match table.as_str() {
        "resources" => {
            let row = Row::new("resources", &columns, values, RESOURCE_COLUMNS)?;
            parse_resource_row(&row).map(Command::InsertResource)
        }
        "resource_status" => {
            let row = Row::new("resource_status", &columns, values, RESOURCE_STATUS_COLUMNS)?;
            Ok(Command::SetResourceStatus {
                resource_id: parse_ulid_expr(row.required("resource_id")?)?,
                status: parse_label(row.required("status")?)?,
            })
        }
        "capacities" => {
            let row = Row::new("capacities", &columns, values, CAPACITY_COLUMNS)?;
            let mut capacity = NewCapacity::new(
                parse_date_expr(row.required("start")?)?,
                parse_date_expr(row.required("end")?)?,
                parse_u64_expr(row.required("quantity")?)?,
            );
            if let Some(unit) = row.get("unit") {
                capacity = capacity.with_unit(parse_string_expr(unit)?);
            }
            Ok(Command::InsertCapacity {
                resource_id: parse_ulid_expr(row.required("resource_id")?)?,
                capacity,
            })
        }
        "allocations" => {
            let row = Row::new("allocations", &columns, values, ALLOCATION_COLUMNS)?;
            let mut request = AllocationRequest::new(
                parse_ulid_expr(row.required("resource_id")?)?,
                parse_string_expr(row.required("project_id")?)?,
                parse_date_expr(row.required("start")?)?,
                parse_date_expr(row.required("end")?)?,
                parse_u64_expr(row.required("quantity")?)?,
            );
            if let Some(priority) = row.get("priority") {
                request = request.with_priority(parse_label(priority)?);
            }
            if let Some(task) = row.get("task_id") {
                request = request.with_task(parse_string_expr(task)?);
            }
            if let Some(notes) = row.get("notes") {
                request = request.with_notes(parse_string_expr(notes)?);
            }
            Ok(Command::InsertAllocation(request))
        }
        "transitions" => {
            let row = Row::new("transitions", &columns, values, TRANSITION_COLUMNS)?;
            Ok(Command::Transition {
                allocation_id: parse_ulid_expr(row.required("allocation_id")?)?,
                status: parse_label(row.required("status")?)?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_resource_row(row: &Row<'_>) -> Result<NewResource, SqlError> {
    let mut new = NewResource::new(
        parse_label(row.required("kind")?)?,
        parse_string_expr(row.required("name")?)?,
        parse_string_expr(row.required("code")?)?,
    );
    if let Some(status) = row.get("status") {
        new = new.with_status(parse_label(status)?);
    }
    if let Some(skills) = row.get("skills") {
        new = new.with_skills(parse_list_expr(skills)?);
    }
    if let Some(certs) = row.get("certifications") {
        new = new.with_certifications(parse_list_expr(certs)?);
    }
    if let Some(rate) = row.get("rate") {
        new = new.with_cost(CostModel {
            rate: parse_f64_expr(rate)?,
            basis: parse_label(row.required("basis")?)?,
            currency: match row.get("currency") {
                Some(c) => parse_string_expr(c)?,
                None => "USD".into(),
            },
        });
    }
    Ok(new)
}

/// Every row carries the project; a run covers exactly one project.
fn parse_optimize(columns: &[String], rows: &[Vec<Expr>]) -> Result<Command, SqlError> {
    let mut project_id: Option<String> = None;
    let mut requests = Vec::with_capacity(rows.len());
    for (i, values) in rows.iter().enumerate() {
        let at_row = |e: SqlError| SqlError::Parse(format!("row {i}: {e}"));
        let row = Row::new("optimize", columns, values, OPTIMIZE_COLUMNS).map_err(at_row)?;

        let project = parse_string_expr(row.required("project_id").map_err(at_row)?).map_err(at_row)?;
        match &project_id {
            None => project_id = Some(project),
            Some(p) if *p == project => {}
            Some(p) => {
                return Err(SqlError::Parse(format!(
                    "row {i}: project_id {project:?} differs from {p:?}"
                )));
            }
        }

        let priority = match row.get("priority") {
            Some(p) => parse_label(p).map_err(at_row)?,
            None => Priority::default(),
        };
        let mut request = PendingRequest::new(
            parse_ulid_expr(row.required("resource_id").map_err(at_row)?).map_err(at_row)?,
            parse_date_expr(row.required("start").map_err(at_row)?).map_err(at_row)?,
            parse_date_expr(row.required("end").map_err(at_row)?).map_err(at_row)?,
            parse_u64_expr(row.required("quantity").map_err(at_row)?).map_err(at_row)?,
            priority,
        );
        if let Some(task) = row.get("task_id") {
            request = request.with_task(parse_string_expr(task).map_err(at_row)?);
        }
        if let Some(notes) = row.get("notes") {
            request.notes = Some(parse_string_expr(notes).map_err(at_row)?);
        }
        requests.push(request);
    }

    Ok(Command::Optimize {
        project_id: project_id.ok_or_else(|| SqlError::Parse("empty VALUES".into()))?,
        requests,
    })
}

// ── DELETE ────────────────────────────────────────────────────

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "resources" => Ok(Command::DeleteResource { id }),
        "capacities" => Ok(Command::DeleteCapacity { id }),
        "allocations" => Ok(Command::DeleteAllocation { id }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── SELECT ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cmp {
    Eq,
    GtEq,
    LtEq,
}

struct Filter {
    column: String,
    cmp: Cmp,
    value: Expr,
}

/// Pull the `column op value` conjuncts out of a WHERE clause.
fn collect_filters(expr: &Expr, out: &mut Vec<Filter>) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_filters(inner, out),
        Expr::BinaryOp { left, op, right } => {
            let cmp = match op {
                ast::BinaryOperator::And => {
                    collect_filters(left, out)?;
                    return collect_filters(right, out);
                }
                ast::BinaryOperator::Eq => Cmp::Eq,
                ast::BinaryOperator::GtEq => Cmp::GtEq,
                ast::BinaryOperator::LtEq => Cmp::LtEq,
                other => return Err(SqlError::Unsupported(format!("operator {other} in WHERE"))),
            };
            let column = expr_column_name(left)
                .ok_or_else(|| SqlError::Parse(format!("expected column, got {left}")))?;
            out.push(Filter {
                column,
                cmp,
                value: (**right).clone(),
            });
            Ok(())
        }
        other => Err(SqlError::Unsupported(format!("WHERE {other}"))),
    }
}

/// Checks that every filter names a known `(column, op)` pair for `table`.
fn check_filters(table: &'static str, filters: &[Filter], known: &[(&str, Cmp)]) -> Result<(), SqlError> {
    for f in filters {
        if !known.iter().any(|(c, op)| *c == f.column && *op == f.cmp) {
            return Err(SqlError::UnknownColumn(table, f.column.clone()));
        }
    }
    Ok(())
}

fn find<'f>(filters: &'f [Filter], column: &str, cmp: Cmp) -> Option<&'f Expr> {
    filters
        .iter()
        .find(|f| f.column == column && f.cmp == cmp)
        .map(|f| &f.value)
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

    let mut filters = Vec::new();
    if let Some(selection) = &select.selection {
        collect_filters(selection, &mut filters)?;
    }

    match table.as_str() {
        "resources" => {
            check_filters("resources", &filters, &[("search", Cmp::Eq), ("kind", Cmp::Eq)])?;
            Ok(Command::SelectResources {
                search: find(&filters, "search", Cmp::Eq).map(parse_string_expr).transpose()?,
                kind: find(&filters, "kind", Cmp::Eq).map(parse_label).transpose()?,
            })
        }
        "capacities" => {
            check_filters("capacities", &filters, &[("resource_id", Cmp::Eq)])?;
            let resource_id = find(&filters, "resource_id", Cmp::Eq).ok_or(SqlError::MissingFilter("resource_id"))?;
            Ok(Command::SelectCapacities {
                resource_id: parse_ulid_expr(resource_id)?,
            })
        }
        "allocations" => {
            check_filters(
                "allocations",
                &filters,
                &[("resource_id", Cmp::Eq), ("project_id", Cmp::Eq), ("status", Cmp::Eq)],
            )?;
            Ok(Command::SelectAllocations(AllocationFilter {
                resource_id: find(&filters, "resource_id", Cmp::Eq).map(parse_ulid_expr).transpose()?,
                project_id: find(&filters, "project_id", Cmp::Eq).map(parse_string_expr).transpose()?,
                status: find(&filters, "status", Cmp::Eq).map(parse_label).transpose()?,
            }))
        }
        "conflicts" => {
            check_filters(
                "conflicts",
                &filters,
                &[
                    ("resource_id", Cmp::Eq),
                    ("project_id", Cmp::Eq),
                    ("start", Cmp::GtEq),
                    ("end", Cmp::LtEq),
                ],
            )?;
            let resource = find(&filters, "resource_id", Cmp::Eq);
            let project = find(&filters, "project_id", Cmp::Eq);
            let scope = match (resource, project) {
                (Some(r), None) => ConflictScope::Resource(parse_ulid_expr(r)?),
                (None, Some(p)) => ConflictScope::Project(parse_string_expr(p)?),
                (None, None) => return Err(SqlError::MissingFilter("resource_id")),
                (Some(_), Some(_)) => {
                    return Err(SqlError::Unsupported("both resource_id and project_id".into()));
                }
            };
            let (start, end) = date_window(&filters)?;
            Ok(Command::SelectConflicts { scope, start, end })
        }
        "utilization" => {
            check_filters(
                "utilization",
                &filters,
                &[("resource_id", Cmp::Eq), ("start", Cmp::GtEq), ("end", Cmp::LtEq)],
            )?;
            let (start, end) = date_window(&filters)?;
            Ok(Command::SelectUtilization {
                resource_id: find(&filters, "resource_id", Cmp::Eq).map(parse_ulid_expr).transpose()?,
                start,
                end,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// `start >= .. AND "end" <= ..`, both required.
fn date_window(filters: &[Filter]) -> Result<(NaiveDate, NaiveDate), SqlError> {
    let start = find(filters, "start", Cmp::GtEq).ok_or(SqlError::MissingFilter("start"))?;
    let end = find(filters, "end", Cmp::LtEq).ok_or(SqlError::MissingFilter("end"))?;
    Ok((parse_date_expr(start)?, parse_date_expr(end)?))
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

fn extract_all_insert_rows(insert: &ast::Insert) -> Result<Vec<Vec<Expr>>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => {
            if values.rows.is_empty() {
                return Err(SqlError::Parse("empty VALUES".into()));
            }
            Ok(values.rows.clone())
        }
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    match sel {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } if expr_column_name(left).as_deref() == Some("id") => parse_ulid_expr(right),
        _ => Err(SqlError::MissingFilter("id")),
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

fn parse_string_expr(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = parse_string_expr(expr)?;
    Ulid::from_string(&s).map_err(|e| SqlError::Parse(format!("bad ULID {s:?}: {e}")))
}

/// Dates are `'YYYY-MM-DD'` literals.
fn parse_date_expr(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = parse_string_expr(expr)?;
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").map_err(|e| SqlError::Parse(format!("bad date {s:?}: {e}")))
}

fn parse_u64_expr(expr: &Expr) -> Result<u64, SqlError> {
    match extract_value(expr) {
        // Bound parameters arrive quoted.
        Some(Value::Number(s, _) | Value::SingleQuotedString(s)) => s
            .trim()
            .parse()
            .map_err(|e| SqlError::Parse(format!("bad quantity {s:?}: {e}"))),
        Some(value) => Err(SqlError::Parse(format!("expected number, got {value}"))),
        None => match expr {
            Expr::UnaryOp {
                op: ast::UnaryOperator::Minus,
                ..
            } => Err(SqlError::Parse(format!("expected non-negative number, got {expr}"))),
            _ => Err(SqlError::Parse(format!("expected value, got {expr}"))),
        },
    }
}

fn parse_f64_expr(expr: &Expr) -> Result<f64, SqlError> {
    match extract_value(expr) {
        Some(Value::Number(s, _) | Value::SingleQuotedString(s)) => s
            .trim()
            .parse()
            .map_err(|e| SqlError::Parse(format!("bad number {s:?}: {e}"))),
        Some(value) => Err(SqlError::Parse(format!("expected number, got {value}"))),
        None => match expr {
            Expr::UnaryOp {
                op: ast::UnaryOperator::Minus,
                expr,
            } => Ok(-parse_f64_expr(expr)?),
            _ => Err(SqlError::Parse(format!("expected value, got {expr}"))),
        },
    }
}

/// Any of the labelled domain enums, written as a string literal.
fn parse_label<T>(expr: &Expr) -> Result<T, SqlError>
where
    T: std::str::FromStr<Err = UnknownVariant>,
{
    let s = parse_string_expr(expr)?;
    s.parse().map_err(|e: UnknownVariant| SqlError::Parse(e.to_string()))
}

/// `'a, b ,c'` → `["a", "b", "c"]`; blanks are dropped.
fn parse_list_expr(expr: &Expr) -> Result<Vec<String>, SqlError> {
    Ok(parse_string_expr(expr)?
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect())
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum SqlError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("empty query")]
    Empty,
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("{0}: unknown column {1}")]
    UnknownColumn(&'static str, String),
    #[error("{0}: {1} columns but {2} values")]
    WrongArity(&'static str, usize, usize),
    #[error("{0}: missing column {1}")]
    MissingColumn(&'static str, &'static str),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
}
