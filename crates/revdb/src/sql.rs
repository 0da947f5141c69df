//! Pure SQL string composition. Every function here returns a `String`;
//! none of them touch a connection. User-supplied values never appear
//! inlined — callers bind them as parameters against the SQL these
//! functions return.

use crate::value::Value;

/// Options for [`select`]. Matches spec.md §4.1 exactly: table, fields
/// (default `*`), where, field orders, `LIMIT loc,len`, group by,
/// distinct.
#[derive(Debug, Clone, Default)]
pub struct SelectOption {
    pub table: String,
    pub fields: Vec<String>,
    pub where_expr: Option<String>,
    pub field_orders: Vec<(String, Order)>,
    /// `(offset, length)`; absent entirely from the rendered SQL when
    /// `length == 0`.
    pub limit: Option<(u64, u64)>,
    pub group_by: Vec<String>,
    pub distinct: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    Asc,
    Desc,
}

impl Order {
    const fn as_sql(self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }
}

impl SelectOption {
    #[must_use]
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            fields: Vec::new(),
            where_expr: None,
            field_orders: Vec::new(),
            limit: None,
            group_by: Vec::new(),
            distinct: false,
        }
    }

    #[must_use]
    pub fn fields(mut self, fields: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.fields = fields.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn where_expr(mut self, expr: impl Into<String>) -> Self {
        self.where_expr = Some(expr.into());
        self
    }

    #[must_use]
    pub fn order_by(mut self, field: impl Into<String>, order: Order) -> Self {
        self.field_orders.push((field.into(), order));
        self
    }

    #[must_use]
    pub const fn limit(mut self, offset: u64, length: u64) -> Self {
        self.limit = Some((offset, length));
        self
    }

    #[must_use]
    pub fn group_by(mut self, fields: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.group_by = fields.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub const fn distinct(mut self) -> Self {
        self.distinct = true;
        self
    }
}

/// `CREATE TABLE t (f1 TYPE1 constraints, f2 TYPE2 constraints, ...)`.
/// `columns` are pre-rendered `"name TYPE constraints"` fragments so this
/// function stays a pure string joiner; the Model/schema layer is
/// responsible for rendering each column definition (including defaults,
/// which must be rendered from the attribute's typed [`Value`]).
#[must_use]
pub fn create_table(table: &str, columns: &[String]) -> String {
    format!("CREATE TABLE IF NOT EXISTS {table} ({})", columns.join(", "))
}

#[must_use]
pub fn drop_table(table: &str) -> String {
    format!("DROP TABLE IF EXISTS {table}")
}

#[must_use]
pub fn alter_table_add_column(table: &str, column_def: &str) -> String {
    format!("ALTER TABLE {table} ADD COLUMN {column_def}")
}

#[must_use]
pub fn create_index(index_name: &str, table: &str, fields: &[String]) -> String {
    format!(
        "CREATE INDEX IF NOT EXISTS {index_name} ON {table} ({})",
        fields.join(", ")
    )
}

#[must_use]
pub fn drop_index(index_name: &str) -> String {
    format!("DROP INDEX IF EXISTS {index_name}")
}

/// `INSERT INTO t(f1,f2,...) VALUES(:f1,:f2,...)`.
#[must_use]
pub fn insert(table: &str, fields: &[String]) -> String {
    let cols = fields.join(", ");
    let placeholders = fields
        .iter()
        .map(|f| format!(":{f}"))
        .collect::<Vec<_>>()
        .join(", ");
    format!("INSERT INTO {table}({cols}) VALUES({placeholders})")
}

/// `UPDATE t SET f=:f,... [WHERE ...]`.
#[must_use]
pub fn update(table: &str, fields: &[String], where_expr: Option<&str>) -> String {
    let assignments = fields
        .iter()
        .map(|f| format!("{f} = :{f}"))
        .collect::<Vec<_>>()
        .join(", ");
    let mut sql = format!("UPDATE {table} SET {assignments}");
    if let Some(w) = where_expr {
        sql.push_str(" WHERE ");
        sql.push_str(w);
    }
    sql
}

/// `DELETE FROM t [WHERE ...]`.
#[must_use]
pub fn delete(table: &str, where_expr: Option<&str>) -> String {
    let mut sql = format!("DELETE FROM {table}");
    if let Some(w) = where_expr {
        sql.push_str(" WHERE ");
        sql.push_str(w);
    }
    sql
}

#[must_use]
pub fn select(option: &SelectOption) -> String {
    let fields = if option.fields.is_empty() {
        "*".to_string()
    } else {
        option.fields.join(", ")
    };
    let distinct = if option.distinct { "DISTINCT " } else { "" };
    let mut sql = format!("SELECT {distinct}{fields} FROM {}", option.table);

    if let Some(w) = &option.where_expr {
        sql.push_str(" WHERE ");
        sql.push_str(w);
    }

    if !option.group_by.is_empty() {
        sql.push_str(" GROUP BY ");
        sql.push_str(&option.group_by.join(", "));
    }

    if !option.field_orders.is_empty() {
        let orders = option
            .field_orders
            .iter()
            .map(|(f, o)| format!("{f} {}", o.as_sql()))
            .collect::<Vec<_>>()
            .join(", ");
        sql.push_str(" ORDER BY ");
        sql.push_str(&orders);
    }

    if let Some((loc, len)) = option.limit {
        if len != 0 {
            sql.push_str(&format!(" LIMIT {loc},{len}"));
        }
    }

    sql
}

/// Right-hand side of an `IN` expression, built over a sub-select, an
/// explicit value list, or an integer set.
pub enum InSource<'a> {
    SubSelect(&'a SelectOption),
    Values(&'a [Value]),
    Integers(&'a [i64]),
}

/// `field IN (...)`. Blobs are rejected (see [`Value::sql_literal`]);
/// text values are single-quote-escaped, matching the rest of the module.
///
/// # Panics
///
/// Panics if any value in `InSource::Values` is a `Blob` — blobs must be
/// bound, never literalized into an `IN` list.
#[must_use]
pub fn in_expr(field: &str, source: InSource<'_>) -> String {
    match source {
        InSource::SubSelect(opt) => format!("{field} IN ({})", select(opt)),
        InSource::Values(values) => {
            if values.is_empty() {
                return format!("{field} IN (NULL)"); // always false, matches empty-IN semantics
            }
            let rendered = values
                .iter()
                .map(Value::sql_literal)
                .collect::<Vec<_>>()
                .join(", ");
            format!("{field} IN ({rendered})")
        }
        InSource::Integers(ints) => {
            if ints.is_empty() {
                return format!("{field} IN (NULL)");
            }
            let rendered = ints
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ");
            format!("{field} IN ({rendered})")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn select_renders_all_clauses() {
        let opt = SelectOption::new("a")
            .fields(["obj_id", "name"])
            .where_expr("obj_id = 1")
            .group_by(["obj_id"])
            .order_by("save_id", Order::Desc)
            .limit(0, 10)
            .distinct();
        assert_eq!(
            select(&opt),
            "SELECT DISTINCT obj_id, name FROM a WHERE obj_id = 1 GROUP BY obj_id ORDER BY save_id DESC LIMIT 0,10"
        );
    }

    #[test]
    fn select_omits_limit_when_length_zero() {
        let opt = SelectOption::new("a").limit(5, 0);
        assert_eq!(select(&opt), "SELECT * FROM a");
    }

    #[test]
    fn insert_and_update_use_named_placeholders() {
        let fields = vec!["name".to_string(), "age".to_string()];
        assert_eq!(
            insert("a", &fields),
            "INSERT INTO a(name, age) VALUES(:name, :age)"
        );
        assert_eq!(
            update("a", &fields, Some("obj_id = :obj_id")),
            "UPDATE a SET name = :name, age = :age WHERE obj_id = :obj_id"
        );
    }

    #[test]
    fn in_expr_over_integers_and_sub_select() {
        assert_eq!(in_expr("obj_id", InSource::Integers(&[1, 2, 3])), "obj_id IN (1, 2, 3)");
        assert_eq!(in_expr("obj_id", InSource::Integers(&[])), "obj_id IN (NULL)");

        let sub = SelectOption::new("rel_a_r").fields(["tgt_obj_id"]);
        assert_eq!(
            in_expr("obj_id", InSource::SubSelect(&sub)),
            "obj_id IN (SELECT tgt_obj_id FROM rel_a_r)"
        );
    }
}
