// Selection specs and their lowering to SQL
// A SelectionSpec is a typed predicate tree, a join mode and sort keys.
// `lower` is the only place that turns one into SQL; values are always
// bound as parameters and identifiers always quoted.

use rusqlite::types::Value;
use serde::{Deserialize, Serialize};

use crate::constants::*;
use crate::datetime::normalize_date_time;
use crate::db::quote_ident;
use crate::error::{Result, StoreError};
use crate::schema::definition::{parse_flag, FieldDescriptor, SchemaDefinition, ValueType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operator {
    Equal,
    NotEqual,
    Less,
    Greater,
    LessOrEqual,
    GreaterOrEqual,
    Glob,
    NotGlob,
}

impl Operator {
    fn sql(&self) -> &'static str {
        match self {
            Operator::Equal => "=",
            Operator::NotEqual => "<>",
            Operator::Less => "<",
            Operator::Greater => ">",
            Operator::LessOrEqual => "<=",
            Operator::GreaterOrEqual => ">=",
            Operator::Glob => "GLOB",
            Operator::NotGlob => "NOT GLOB",
        }
    }

    /// Symbol shown to users.
    pub fn symbol(&self) -> &'static str {
        match self {
            Operator::Equal => "=",
            Operator::NotEqual => "\u{2260}",
            Operator::Less => "<",
            Operator::Greater => ">",
            Operator::LessOrEqual => "\u{2264}",
            Operator::GreaterOrEqual => "\u{2265}",
            Operator::Glob => "GLOB",
            Operator::NotGlob => "NOT GLOB",
        }
    }

    fn is_glob(&self) -> bool {
        matches!(self, Operator::Glob | Operator::NotGlob)
    }
}

/// Boolean filter tree over field comparisons.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Predicate {
    Compare {
        data_label: String,
        op: Operator,
        value: String,
    },
    All(Vec<Predicate>),
    Any(Vec<Predicate>),
    Not(Box<Predicate>),
}

impl Predicate {
    pub fn compare(data_label: impl Into<String>, op: Operator, value: impl Into<String>) -> Self {
        Predicate::Compare {
            data_label: data_label.into(),
            op,
            value: value.into(),
        }
    }

    pub fn eq(data_label: impl Into<String>, value: impl Into<String>) -> Self {
        Self::compare(data_label, Operator::Equal, value)
    }

    pub fn and(self, other: Predicate) -> Self {
        match self {
            Predicate::All(mut terms) => {
                terms.push(other);
                Predicate::All(terms)
            }
            first => Predicate::All(vec![first, other]),
        }
    }

    pub fn or(self, other: Predicate) -> Self {
        match self {
            Predicate::Any(mut terms) => {
                terms.push(other);
                Predicate::Any(terms)
            }
            first => Predicate::Any(vec![first, other]),
        }
    }

    pub fn negate(self) -> Self {
        Predicate::Not(Box::new(self))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecognitionKind {
    Detection,
    Classification,
}

/// Rows having a detection (or classification) of `category` whose best
/// confidence lies in `[min_confidence, max_confidence]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecognitionFilter {
    pub kind: RecognitionKind,
    pub category: Option<String>,
    pub min_confidence: f64,
    pub max_confidence: f64,
}

impl RecognitionFilter {
    pub fn detections(category: Option<&str>, min_confidence: f64, max_confidence: f64) -> Self {
        Self {
            kind: RecognitionKind::Detection,
            category: category.map(str::to_string),
            min_confidence,
            max_confidence,
        }
    }

    pub fn classifications(category: Option<&str>, min_confidence: f64, max_confidence: f64) -> Self {
        Self {
            kind: RecognitionKind::Classification,
            ..Self::detections(category, min_confidence, max_confidence)
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum JoinMode {
    #[default]
    Plain,
    MissingDetections,
    Recognition(RecognitionFilter),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SortKey {
    pub data_label: String,
    pub descending: bool,
}

impl SortKey {
    pub fn asc(data_label: impl Into<String>) -> Self {
        Self {
            data_label: data_label.into(),
            descending: false,
        }
    }

    pub fn desc(data_label: impl Into<String>) -> Self {
        Self {
            data_label: data_label.into(),
            descending: true,
        }
    }
}

/// Immutable description of a view over DataTable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SelectionSpec {
    pub filter: Option<Predicate>,
    pub join: JoinMode,
    pub sort: Vec<SortKey>,
    /// Field holding episode tags (`25:1|8`). When set, a match on any
    /// member of an episode selects the whole episode.
    pub episode_field: Option<String>,
}

impl SelectionSpec {
    /// Every record, default sort.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn filtered(filter: Predicate) -> Self {
        Self {
            filter: Some(filter),
            ..Self::default()
        }
    }

    pub fn with_join(mut self, join: JoinMode) -> Self {
        self.join = join;
        self
    }

    pub fn sorted_by(mut self, key: SortKey) -> Self {
        self.sort.push(key);
        self
    }

    pub fn with_episodes(mut self, data_label: impl Into<String>) -> Self {
        self.episode_field = Some(data_label.into());
        self
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Terminal {
    Rows,
    Count,
    Exists,
}

#[derive(Debug)]
pub(crate) struct LoweredQuery {
    pub sql: String,
    pub params: Vec<Value>,
}

/// Which recognition tables exist; decides how join modes lower.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct RecognitionPresence {
    pub detections: bool,
    pub classifications: bool,
}

fn column(label: &str) -> String {
    format!("{}.{}", DATA_TABLE, quote_ident(label))
}

fn order_expr(field: &FieldDescriptor) -> String {
    if field.value_type.is_numeric() {
        format!("CAST({} AS REAL)", column(&field.data_label))
    } else {
        column(&field.data_label)
    }
}

struct Lowering<'a> {
    schema: &'a SchemaDefinition,
    params: Vec<Value>,
}

impl<'a> Lowering<'a> {
    fn bind(&mut self, value: Value) -> String {
        self.params.push(value);
        format!("?{}", self.params.len())
    }

    fn predicate(&mut self, p: &Predicate) -> Result<String> {
        Ok(match p {
            Predicate::Compare { data_label, op, value } => self.comparison(data_label, *op, value)?,
            Predicate::All(terms) if terms.is_empty() => "1 = 1".to_string(),
            Predicate::Any(terms) if terms.is_empty() => "1 = 0".to_string(),
            Predicate::All(terms) => self.join_terms(terms, " AND ")?,
            Predicate::Any(terms) => self.join_terms(terms, " OR ")?,
            Predicate::Not(inner) => format!("NOT ({})", self.predicate(inner)?),
        })
    }

    fn join_terms(&mut self, terms: &[Predicate], sep: &str) -> Result<String> {
        let parts = terms
            .iter()
            .map(|t| self.predicate(t).map(|s| format!("({})", s)))
            .collect::<Result<Vec<_>>>()?;
        Ok(parts.join(sep))
    }

    fn comparison(&mut self, data_label: &str, op: Operator, value: &str) -> Result<String> {
        let schema = self.schema;
        let field = schema.require(data_label)?;
        let col = column(data_label);
        if op.is_glob() {
            let p = self.bind(Value::Text(value.to_string()));
            return Ok(format!("{} {} {}", col, op.sql(), p));
        }
        let (lhs, param) = match field.value_type {
            ValueType::Counter => {
                let number: f64 = value.trim().parse().map_err(|_| StoreError::InvalidValue {
                    label: data_label.to_string(),
                    value: value.to_string(),
                })?;
                (format!("CAST({} AS REAL)", col), Value::Real(number))
            }
            ValueType::Flag | ValueType::DeleteFlag => {
                let flag = parse_flag(value).ok_or_else(|| StoreError::InvalidValue {
                    label: data_label.to_string(),
                    value: value.to_string(),
                })?;
                let text = if flag { FLAG_TRUE } else { FLAG_FALSE };
                (format!("lower({})", col), Value::Text(text.to_string()))
            }
            ValueType::DateTime => {
                let text = normalize_date_time(value).unwrap_or_else(|| value.to_string());
                (col, Value::Text(text))
            }
            _ => (col, Value::Text(value.to_string())),
        };
        let p = self.bind(param);
        Ok(format!("{} {} {}", lhs, op.sql(), p))
    }

    fn order_by(&self, sort: &[SortKey]) -> Result<String> {
        if sort.len() > MAX_SORT_KEYS {
            return Err(StoreError::InvalidValue {
                label: IMAGE_SET_SORT_TERMS.to_string(),
                value: format!("{} sort keys", sort.len()),
            });
        }
        let default_sort = [SortKey::asc(RELATIVE_PATH), SortKey::asc(DATE_TIME)];
        let keys: &[SortKey] = if sort.is_empty() { &default_sort } else { sort };

        let mut terms = Vec::new();
        for key in keys {
            let field = self.schema.require(&key.data_label)?;
            let dir = if key.descending { "DESC" } else { "ASC" };
            terms.push(format!("{} {}", order_expr(field), dir));
        }
        // Duplicates can share a timestamp; keep them in a stable order.
        if keys[0].data_label == DATE_TIME {
            terms.push(format!("{} ASC", column(FILE)));
        }
        terms.push(format!("{}.{} ASC", DATA_TABLE, ID));
        Ok(format!(" ORDER BY {}", terms.join(", ")))
    }
}

/// Lower a selection to SQL selecting `DataTable.*` rows (or their count / existence).
pub(crate) fn lower(
    spec: &SelectionSpec,
    schema: &SchemaDefinition,
    presence: RecognitionPresence,
    terminal: Terminal,
) -> Result<LoweredQuery> {
    let mut l = Lowering {
        schema,
        params: Vec::new(),
    };

    let filter = match &spec.filter {
        Some(p) => Some(l.predicate(p)?),
        None => None,
    };

    let mut conditions: Vec<String> = Vec::new();
    let mut from = DATA_TABLE.to_string();
    let mut group = String::new();

    match &spec.join {
        JoinMode::Plain => {}
        JoinMode::MissingDetections => {
            // Without a Detections table every file is missing detections.
            if presence.detections {
                from = format!(
                    "{dt} LEFT JOIN {d} ON {dt}.{id} = {d}.{id}",
                    dt = DATA_TABLE,
                    d = DETECTIONS_TABLE,
                    id = ID
                );
                conditions.push(format!("{}.{} IS NULL", DETECTIONS_TABLE, ID));
            }
        }
        JoinMode::Recognition(rf) => {
            let (table, present) = match rf.kind {
                RecognitionKind::Detection => (DETECTIONS_TABLE, presence.detections),
                RecognitionKind::Classification => (CLASSIFICATIONS_TABLE, presence.classifications),
            };
            if present {
                from = format!(
                    "{dt} INNER JOIN {t} ON {dt}.{id} = {t}.{id}",
                    dt = DATA_TABLE,
                    t = table,
                    id = ID
                );
                if let Some(category) = &rf.category {
                    let p = l.bind(Value::Text(category.clone()));
                    conditions.push(format!("{}.{} = {}", table, CATEGORY, p));
                }
                let lo = l.bind(Value::Real(rf.min_confidence));
                let hi = l.bind(Value::Real(rf.max_confidence));
                group = format!(
                    " GROUP BY {dt}.{id} HAVING MAX({t}.{conf}) BETWEEN {lo} AND {hi}",
                    dt = DATA_TABLE,
                    id = ID,
                    t = table,
                    conf = CONF,
                    lo = lo,
                    hi = hi
                );
            } else {
                conditions.push("1 = 0".to_string());
            }
        }
    }

    if let Some(f) = filter {
        conditions.push(format!("({})", f));
    }

    let where_clause = if conditions.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", conditions.join(" AND "))
    };
    let matched = format!("SELECT {}.* FROM {}{}{}", DATA_TABLE, from, where_clause, group);

    let (with, body) = match &spec.episode_field {
        Some(episode_label) => {
            schema.require(episode_label)?;
            let ep = column(episode_label);
            let key = |c: &str| format!("substr({c}, 1, instr({c}, '{sep}') - 1)", c = c, sep = EPISODE_KEY_SEPARATOR);
            let m_col = format!("matched.{}", quote_ident(episode_label));
            let body = format!(
                "SELECT {dt}.* FROM {dt} WHERE {dt}.{id} IN (SELECT {id} FROM matched) \
                 OR (instr({ep}, '{sep}') > 0 AND {ep_key} IN \
                 (SELECT {m_key} FROM matched WHERE instr({m}, '{sep}') > 0))",
                dt = DATA_TABLE,
                id = ID,
                ep = ep,
                sep = EPISODE_KEY_SEPARATOR,
                ep_key = key(&ep),
                m_key = key(&m_col),
                m = m_col
            );
            (format!("WITH matched AS ({}) ", matched), body)
        }
        None => (String::new(), matched),
    };

    let sql = match terminal {
        Terminal::Rows => format!("{}{}{}", with, body, l.order_by(&spec.sort)?),
        Terminal::Count => format!("{}SELECT COUNT(*) FROM ({})", with, body),
        Terminal::Exists => format!("{}SELECT EXISTS ({})", with, body),
    };
    log::debug!("Lowered selection: {}", sql);

    Ok(LoweredQuery { sql, params: l.params })
}
