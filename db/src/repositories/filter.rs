//! Common filter value shared by every `list-with-filter` operation in §6.2:
//! "Filters are a common value (column, operator, value, nullable flag)."

use sqlx::{QueryBuilder, Sqlite};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    IsNull,
}

impl FilterOp {
    fn as_sql(self) -> &'static str {
        match self {
            FilterOp::Eq => "=",
            FilterOp::Ne => "!=",
            FilterOp::Lt => "<",
            FilterOp::Le => "<=",
            FilterOp::Gt => ">",
            FilterOp::Ge => ">=",
            FilterOp::In => "IN",
            FilterOp::IsNull => "IS NULL",
        }
    }
}

#[derive(Debug, Clone)]
pub enum FilterValue {
    Text(String),
    Int(i64),
    Bool(bool),
    TextList(Vec<String>),
}

#[derive(Debug, Clone)]
pub struct Filter {
    pub column: &'static str,
    pub op: FilterOp,
    pub value: Option<FilterValue>,
    /// When true, a row with a SQL NULL in `column` still matches (used by filters over
    /// optional columns like `next_retry_time` where absence should not silently exclude it).
    pub nullable: bool,
}

impl Filter {
    pub fn eq(column: &'static str, value: FilterValue) -> Self {
        Self { column, op: FilterOp::Eq, value: Some(value), nullable: false }
    }

    pub fn le(column: &'static str, value: FilterValue) -> Self {
        Self { column, op: FilterOp::Le, value: Some(value), nullable: false }
    }

    pub fn ge(column: &'static str, value: FilterValue) -> Self {
        Self { column, op: FilterOp::Ge, value: Some(value), nullable: false }
    }

    pub fn lt(column: &'static str, value: FilterValue) -> Self {
        Self { column, op: FilterOp::Lt, value: Some(value), nullable: false }
    }

    pub fn is_null(column: &'static str) -> Self {
        Self { column, op: FilterOp::IsNull, value: None, nullable: false }
    }

    pub fn in_list(column: &'static str, values: Vec<String>) -> Self {
        Self { column, op: FilterOp::In, value: Some(FilterValue::TextList(values)), nullable: false }
    }
}

/// Appends `AND <clause>` for each filter onto an in-progress `WHERE` builder.
pub fn push_filters<'a>(builder: &mut QueryBuilder<'a, Sqlite>, filters: &'a [Filter]) {
    for filter in filters {
        builder.push(" AND (");
        if filter.nullable {
            builder.push(filter.column).push(" IS NULL OR ");
        }
        match (&filter.value, filter.op) {
            (None, FilterOp::IsNull) => {
                builder.push(filter.column).push(" IS NULL");
            }
            (Some(FilterValue::TextList(values)), FilterOp::In) => {
                builder.push(filter.column).push(" IN (");
                let mut separated = builder.separated(", ");
                for value in values {
                    separated.push_bind(value.clone());
                }
                separated.push_unseparated(")");
            }
            (Some(FilterValue::Text(v)), op) => {
                builder.push(filter.column).push(" ").push(op.as_sql()).push(" ").push_bind(v.clone());
            }
            (Some(FilterValue::Int(v)), op) => {
                builder.push(filter.column).push(" ").push(op.as_sql()).push(" ").push_bind(*v);
            }
            (Some(FilterValue::Bool(v)), op) => {
                builder.push(filter.column).push(" ").push(op.as_sql()).push(" ").push_bind(*v);
            }
            _ => unreachable!("unsupported filter value/operator combination"),
        }
        builder.push(")");
    }
}
