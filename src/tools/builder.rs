//! SQL-free SELECT construction for `query_table`
//!
//! Filters arrive as a JSON object whose keys may carry an operator suffix,
//! e.g. `{"status": "active", "total >=": 10, "id IN": [1, 2]}`. Values are
//! always bound as parameters; only validated identifiers reach the SQL text.

use super::ToolError;
use crate::safety::{quote_ident, validate_column_name, TableRef};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Eq,
    Ne,
    NotEqual,
    Gt,
    Lt,
    Ge,
    Le,
    Like,
    NotLike,
    In,
    NotIn,
    IsNull,
    IsNotNull,
}

/// Suffixes checked longest-first so ` NOT LIKE` wins over ` LIKE`
const SUFFIXES: [(&str, FilterOp); 13] = [
    (" NOT LIKE", FilterOp::NotLike),
    (" NOT IN", FilterOp::NotIn),
    (" IS NOT", FilterOp::IsNotNull),
    (" LIKE", FilterOp::Like),
    (" IN", FilterOp::In),
    (" IS", FilterOp::IsNull),
    (" >=", FilterOp::Ge),
    (" <=", FilterOp::Le),
    (" !=", FilterOp::Ne),
    (" <>", FilterOp::NotEqual),
    (" =", FilterOp::Eq),
    (" >", FilterOp::Gt),
    (" <", FilterOp::Lt),
];

impl FilterOp {
    pub fn sql(&self) -> &'static str {
        match self {
            FilterOp::Eq => "=",
            FilterOp::Ne => "!=",
            FilterOp::NotEqual => "<>",
            FilterOp::Gt => ">",
            FilterOp::Lt => "<",
            FilterOp::Ge => ">=",
            FilterOp::Le => "<=",
            FilterOp::Like => "LIKE",
            FilterOp::NotLike => "NOT LIKE",
            FilterOp::In => "IN",
            FilterOp::NotIn => "NOT IN",
            FilterOp::IsNull => "IS NULL",
            FilterOp::IsNotNull => "IS NOT NULL",
        }
    }

    /// Split `"total >="` into `("total", Ge)`; a bare key means equality
    pub fn split_key(key: &str) -> (&str, FilterOp) {
        let trimmed = key.trim_end();
        let upper = trimmed.to_ascii_uppercase();
        for (suffix, op) in SUFFIXES {
            if upper.ends_with(suffix) {
                let column = &trimmed[..trimmed.len() - suffix.len()];
                return (column.trim(), op);
            }
        }
        (trimmed.trim(), FilterOp::Eq)
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Filter {
    column: String,
    op: FilterOp,
    values: Vec<Value>,
}

/// Builds a parameterized SELECT against one table
#[derive(Debug, Clone)]
pub struct SelectBuilder {
    table: TableRef,
    columns: Vec<String>,
    filters: Vec<Filter>,
    order_by: Option<(String, bool)>,
    limit: usize,
    offset: usize,
}

fn checked_column(raw: &str) -> Result<String, ToolError> {
    let column = raw.trim();
    if validate_column_name(column) {
        Ok(column.to_string())
    } else {
        Err(ToolError::Validation(format!("invalid column name: {raw}")))
    }
}

fn scalar(column: &str, value: Value) -> Result<Value, ToolError> {
    match value {
        Value::Array(_) | Value::Object(_) => Err(ToolError::Validation(format!(
            "filter on '{column}' needs a scalar value"
        ))),
        other => Ok(other),
    }
}

impl SelectBuilder {
    pub fn new(table: TableRef) -> Self {
        Self {
            table,
            columns: Vec::new(),
            filters: Vec::new(),
            order_by: None,
            limit: 100,
            offset: 0,
        }
    }

    /// Restrict the projection; an empty list selects `*`
    pub fn columns<I, S>(mut self, columns: I) -> Result<Self, ToolError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for column in columns {
            self.columns.push(checked_column(column.as_ref())?);
        }
        Ok(self)
    }

    /// Add one filter from a possibly suffixed key
    pub fn filter(mut self, key: &str, value: Value) -> Result<Self, ToolError> {
        let (column, op) = FilterOp::split_key(key);
        let column = checked_column(column)?;

        let (op, values) = match (op, value) {
            (FilterOp::IsNull | FilterOp::IsNotNull, _) => (op, Vec::new()),
            (FilterOp::Eq, Value::Null) => (FilterOp::IsNull, Vec::new()),
            (FilterOp::Ne | FilterOp::NotEqual, Value::Null) => (FilterOp::IsNotNull, Vec::new()),
            (FilterOp::In | FilterOp::NotIn, Value::Array(items)) => {
                if items.is_empty() {
                    return Err(ToolError::Validation(format!(
                        "{} filter on '{}' needs at least one value",
                        op.sql(),
                        column
                    )));
                }
                let items = items
                    .into_iter()
                    .map(|item| scalar(&column, item))
                    .collect::<Result<Vec<_>, _>>()?;
                (op, items)
            }
            (_, Value::Null) => {
                return Err(ToolError::Validation(format!(
                    "{} filter on '{}' cannot compare with null",
                    op.sql(),
                    column
                )))
            }
            (op, value) => (op, vec![scalar(&column, value)?]),
        };

        self.filters.push(Filter { column, op, values });
        Ok(self)
    }

    /// Add every entry of a JSON filter object
    pub fn filters(self, filters: Map<String, Value>) -> Result<Self, ToolError> {
        filters
            .into_iter()
            .try_fold(self, |builder, (key, value)| builder.filter(&key, value))
    }

    pub fn order_by(mut self, column: &str, descending: bool) -> Result<Self, ToolError> {
        self.order_by = Some((checked_column(column)?, descending));
        Ok(self)
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    pub fn table(&self) -> &TableRef {
        &self.table
    }

    fn where_clause(&self) -> (String, Vec<Value>) {
        if self.filters.is_empty() {
            return (String::new(), Vec::new());
        }

        let mut clauses = Vec::with_capacity(self.filters.len());
        let mut params = Vec::new();
        for filter in &self.filters {
            let column = quote_ident(&filter.column);
            match filter.op {
                FilterOp::IsNull | FilterOp::IsNotNull => {
                    clauses.push(format!("{} {}", column, filter.op.sql()));
                }
                FilterOp::In | FilterOp::NotIn => {
                    let placeholders = vec!["?"; filter.values.len()].join(", ");
                    clauses.push(format!("{} {} ({})", column, filter.op.sql(), placeholders));
                }
                op => clauses.push(format!("{} {} ?", column, op.sql())),
            }
            params.extend(filter.values.iter().cloned());
        }

        (format!(" WHERE {}", clauses.join(" AND ")), params)
    }

    /// The page query and its parameters
    pub fn build(&self) -> (String, Vec<Value>) {
        let projection = if self.columns.is_empty() {
            "*".to_string()
        } else {
            self.columns
                .iter()
                .map(|c| quote_ident(c))
                .collect::<Vec<_>>()
                .join(", ")
        };
        let (where_sql, params) = self.where_clause();

        let mut sql = format!(
            "SELECT {} FROM {}{}",
            projection,
            self.table.quoted(),
            where_sql
        );
        if let Some((column, descending)) = &self.order_by {
            sql.push_str(&format!(
                " ORDER BY {} {}",
                quote_ident(column),
                if *descending { "DESC" } else { "ASC" }
            ));
        }
        sql.push_str(&format!(" LIMIT {} OFFSET {}", self.limit, self.offset));

        (sql, params)
    }

    /// Count of all rows matching the filters, ignoring paging
    pub fn build_count(&self) -> (String, Vec<Value>) {
        let (where_sql, params) = self.where_clause();
        (
            format!(
                "SELECT COUNT(*) AS total_count FROM {}{}",
                self.table.quoted(),
                where_sql
            ),
            params,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn orders() -> SelectBuilder {
        SelectBuilder::new(TableRef::new("main", "orders"))
    }

    #[test]
    fn test_split_key() {
        assert_eq!(FilterOp::split_key("status"), ("status", FilterOp::Eq));
        assert_eq!(FilterOp::split_key("total >="), ("total", FilterOp::Ge));
        assert_eq!(FilterOp::split_key("total >"), ("total", FilterOp::Gt));
        assert_eq!(FilterOp::split_key("name not like"), ("name", FilterOp::NotLike));
        assert_eq!(FilterOp::split_key("name LIKE"), ("name", FilterOp::Like));
        assert_eq!(FilterOp::split_key("id NOT IN"), ("id", FilterOp::NotIn));
        assert_eq!(FilterOp::split_key("note IS NOT"), ("note", FilterOp::IsNotNull));
        assert_eq!(FilterOp::split_key("a <>"), ("a", FilterOp::NotEqual));
    }

    #[test]
    fn test_default_select() {
        let (sql, params) = orders().build();
        assert_eq!(sql, "SELECT * FROM \"main\".\"orders\" LIMIT 100 OFFSET 0");
        assert!(params.is_empty());
    }

    #[test]
    fn test_filters_are_parameterized() {
        let (sql, params) = orders()
            .columns(["id", "total"])
            .unwrap()
            .filter("total >=", json!(10))
            .unwrap()
            .filter("customer_id IN", json!([1, 2]))
            .unwrap()
            .filter("note", Value::Null)
            .unwrap()
            .order_by("total", true)
            .unwrap()
            .limit(5)
            .offset(10)
            .build();

        assert_eq!(
            sql,
            "SELECT \"id\", \"total\" FROM \"main\".\"orders\" \
             WHERE \"total\" >= ? AND \"customer_id\" IN (?, ?) AND \"note\" IS NULL \
             ORDER BY \"total\" DESC LIMIT 5 OFFSET 10"
        );
        assert_eq!(params, vec![json!(10), json!(1), json!(2)]);
    }

    #[test]
    fn test_count_ignores_paging() {
        let builder = orders()
            .filter("customer_id", json!(1))
            .unwrap()
            .limit(1)
            .offset(3);
        let (sql, params) = builder.build_count();
        assert_eq!(
            sql,
            "SELECT COUNT(*) AS total_count FROM \"main\".\"orders\" WHERE \"customer_id\" = ?"
        );
        assert_eq!(params, vec![json!(1)]);
    }

    #[test]
    fn test_not_equal_null_becomes_is_not_null() {
        let (sql, _) = orders().filter("note !=", Value::Null).unwrap().build_count();
        assert!(sql.ends_with("WHERE \"note\" IS NOT NULL"));
    }

    #[test]
    fn test_rejects_bad_input() {
        assert!(orders().columns(["id; DROP TABLE orders"]).is_err());
        assert!(orders().filter("total\" OR 1=1 --", json!(1)).is_err());
        assert!(orders().filter("id IN", json!([])).is_err());
        assert!(orders().filter("total >", Value::Null).is_err());
        assert!(orders().filter("total", json!({"a": 1})).is_err());
        assert!(orders().order_by("1; --", false).is_err());
    }
}
