//! Statement classification and result conversion.

use base64::{Engine as _, engine::general_purpose::STANDARD};
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime};
use serde::Serialize;
use serde_json::{Map, Number, Value};
use tiberius::{ColumnData, FromSql, Row};

/// Whether a batch produces a result set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    RowReturning,
    RowCount,
}

/// Statement leaders whose statement always yields rows.
const ROW_LEADERS: &[&str] = &["VALUES", "EXEC", "EXECUTE", "SHOW"];
/// Data modification leaders; they yield rows only through an `OUTPUT` clause.
const DML_LEADERS: &[&str] = &["INSERT", "UPDATE", "DELETE", "MERGE"];
/// Leaders whose statement runs to the next `;` whatever keywords it contains.
const GREEDY_LEADERS: &[&str] = &["MERGE", "CREATE", "ALTER", "GRANT", "REVOKE", "DENY"];
const STATEMENT_KEYWORDS: &[&str] = &[
    "SELECT", "WITH", "VALUES", "EXEC", "EXECUTE", "SHOW", "INSERT", "UPDATE", "DELETE", "MERGE",
    "SET", "DECLARE", "IF", "WHILE", "CREATE", "ALTER", "DROP", "TRUNCATE", "PRINT", "RETURN",
    "RAISERROR", "THROW", "USE", "GRANT", "REVOKE", "DENY", "OPEN", "CLOSE", "DEALLOCATE",
    "FETCH", "COMMIT", "ROLLBACK", "SAVE", "WAITFOR", "GOTO", "BREAK", "CONTINUE",
];
const BLOCK_KEYWORDS: &[&str] = &["BEGIN", "END", "ELSE"];
const MODULE_KINDS: &[&str] = &["PROC", "PROCEDURE", "FUNCTION", "VIEW", "TRIGGER"];
const SET_OPERATORS: &[&str] = &["UNION", "EXCEPT", "INTERSECT", "ALL"];

impl StatementKind {
    /// Classify a T-SQL batch by scanning every statement in it.
    ///
    /// The batch returns rows when any top-level statement does: a `SELECT`
    /// that neither assigns variables nor selects `INTO` a table, `VALUES`,
    /// `EXEC`, a `FETCH` without `INTO`, or a data modification with an
    /// `OUTPUT` clause not redirected `INTO` a table. Subqueries, string
    /// literals, comments and module bodies (`CREATE PROCEDURE ...`) are
    /// ignored.
    pub fn classify(sql: &str) -> Self {
        if scan_batch(&tokenize(sql)) {
            StatementKind::RowReturning
        } else {
            StatementKind::RowCount
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Word(String),
    Variable,
    Open,
    Close,
    Semi,
    Assign,
    Dot,
    Other,
}

fn tokenize(sql: &str) -> Vec<Token> {
    let chars: Vec<char> = sql.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    let word_char = |c: char| c.is_alphanumeric() || matches!(c, '_' | '#' | '$' | '@');

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        match c {
            c if c.is_whitespace() => i += 1,
            '-' if next == Some('-') => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
            }
            '/' if next == Some('*') => {
                let mut depth = 0;
                while i < chars.len() {
                    if chars[i] == '/' && chars.get(i + 1) == Some(&'*') {
                        depth += 1;
                        i += 2;
                    } else if chars[i] == '*' && chars.get(i + 1) == Some(&'/') {
                        depth -= 1;
                        i += 2;
                        if depth == 0 {
                            break;
                        }
                    } else {
                        i += 1;
                    }
                }
            }
            '\'' | '"' | '[' => {
                let close = if c == '[' { ']' } else { c };
                i += 1;
                while i < chars.len() {
                    if chars[i] == close {
                        // Doubled delimiter is an escaped literal character.
                        if chars.get(i + 1) == Some(&close) {
                            i += 2;
                            continue;
                        }
                        break;
                    }
                    i += 1;
                }
                i += 1;
                tokens.push(Token::Other);
            }
            '@' => {
                while i < chars.len() && word_char(chars[i]) {
                    i += 1;
                }
                tokens.push(Token::Variable);
            }
            '(' => {
                i += 1;
                tokens.push(Token::Open);
            }
            ')' => {
                i += 1;
                tokens.push(Token::Close);
            }
            ';' => {
                i += 1;
                tokens.push(Token::Semi);
            }
            '.' => {
                i += 1;
                tokens.push(Token::Dot);
            }
            '=' => {
                i += 1;
                tokens.push(Token::Assign);
            }
            '+' | '-' | '*' | '/' | '%' | '&' | '|' | '^' if next == Some('=') => {
                i += 2;
                tokens.push(Token::Assign);
            }
            c if c.is_alphabetic() || c == '_' || c == '#' => {
                let begin = i;
                while i < chars.len() && word_char(chars[i]) {
                    i += 1;
                }
                if tokens.last() == Some(&Token::Dot) {
                    tokens.push(Token::Other);
                } else {
                    let word: String = chars[begin..i].iter().collect();
                    tokens.push(Token::Word(word.to_uppercase()));
                }
            }
            _ => {
                i += 1;
                tokens.push(Token::Other);
            }
        }
    }
    tokens
}

/// One top-level statement while it is being scanned.
#[derive(Debug, Default)]
struct Statement {
    leader: Option<String>,
    assigns: bool,
    into: bool,
    output: bool,
    output_into: bool,
    case_depth: usize,
}

impl Statement {
    fn start(leader: &str, tokens: &[Token], at: usize) -> Self {
        let assigns = leader == "SELECT"
            && matches!(
                (tokens.get(at + 1), tokens.get(at + 2)),
                (Some(Token::Variable), Some(Token::Assign))
            );
        Self {
            leader: Some(leader.to_string()),
            assigns,
            ..Self::default()
        }
    }

    fn leader_is(&self, names: &[&str]) -> bool {
        self.leader.as_deref().is_some_and(|l| names.contains(&l))
    }

    fn returns_rows(&self) -> bool {
        match self.leader.as_deref() {
            Some("SELECT") | Some("FETCH") => !self.assigns && !self.into,
            Some(l) if ROW_LEADERS.contains(&l) => true,
            Some(l) if DML_LEADERS.contains(&l) => self.output && !self.output_into,
            _ => false,
        }
    }

    /// Whether `word` belongs to this statement rather than opening a new one.
    fn absorbs(&self, word: &str, prev: Option<&Token>, next: Option<&Token>) -> bool {
        let prev_word = match prev {
            Some(Token::Word(w)) => Some(w.as_str()),
            _ => None,
        };
        if self.leader_is(GREEDY_LEADERS) || prev_word == Some("FOR") {
            return true;
        }
        match word {
            // table hint
            "WITH" => next == Some(&Token::Open),
            "SELECT" if prev_word.is_some_and(|w| SET_OPERATORS.contains(&w)) => true,
            "SELECT" | "VALUES" | "EXEC" | "EXECUTE" => self.leader_is(&["INSERT"]),
            "SET" => self.leader_is(&["UPDATE"]),
            _ => false,
        }
    }
}

fn is_module_definition(tokens: &[Token], after: usize) -> bool {
    tokens[after..]
        .iter()
        .filter_map(|t| match t {
            Token::Word(w) => Some(w.as_str()),
            _ => None,
        })
        .find(|w| !matches!(*w, "OR" | "ALTER"))
        .is_some_and(|w| MODULE_KINDS.contains(&w))
}

fn scan_batch(tokens: &[Token]) -> bool {
    let mut returns = false;
    let mut statement = Statement::default();
    // One entry per open paren: `true` when it wraps a whole statement.
    let mut parens: Vec<bool> = Vec::new();
    let mut nested = 0usize;

    for (i, token) in tokens.iter().enumerate() {
        match token {
            Token::Open => {
                let wraps_statement = statement.leader.is_none() && nested == 0;
                if !wraps_statement {
                    nested += 1;
                }
                parens.push(wraps_statement);
            }
            Token::Close => {
                if parens.pop() == Some(false) {
                    nested = nested.saturating_sub(1);
                }
            }
            _ if nested > 0 => {}
            Token::Semi => {
                returns |= statement.returns_rows();
                statement = Statement::default();
            }
            Token::Word(word) => {
                let word = word.as_str();
                let prev = i.checked_sub(1).and_then(|p| tokens.get(p));
                let next = tokens.get(i + 1);

                if word == "CASE" {
                    statement.case_depth += 1;
                    continue;
                }
                if statement.case_depth > 0 && matches!(word, "END" | "ELSE" | "WHEN" | "THEN") {
                    if word == "END" {
                        statement.case_depth -= 1;
                    }
                    continue;
                }
                if BLOCK_KEYWORDS.contains(&word) {
                    returns |= statement.returns_rows();
                    statement = Statement::default();
                    continue;
                }

                if statement.leader_is(DML_LEADERS) && word == "OUTPUT" {
                    statement.output = true;
                    continue;
                }
                if word == "INTO" {
                    if statement.output {
                        statement.output_into = true;
                    } else if statement.leader_is(&["SELECT", "FETCH"]) {
                        statement.into = true;
                    }
                    continue;
                }

                if !STATEMENT_KEYWORDS.contains(&word) {
                    continue;
                }
                if statement.leader.is_none() {
                    statement = Statement::start(word, tokens, i);
                } else if statement.leader_is(&["WITH"])
                    && matches!(word, "SELECT" | "INSERT" | "UPDATE" | "DELETE" | "MERGE")
                {
                    // main statement of a common table expression
                    statement = Statement::start(word, tokens, i);
                } else if !statement.absorbs(word, prev, next) {
                    returns |= statement.returns_rows();
                    statement = Statement::start(word, tokens, i);
                } else {
                    continue;
                }

                if statement.leader_is(&["CREATE", "ALTER"]) && is_module_definition(tokens, i + 1) {
                    return returns;
                }
            }
            _ => {}
        }
    }

    returns || statement.returns_rows()
}

/// Result of [`DatabaseConnection::execute_query`](super::DatabaseConnection::execute_query).
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum QueryOutput {
    /// One positional vector per row
    Rows(Vec<Vec<Value>>),
    /// One column-name keyed map per row
    Records(Vec<Map<String, Value>>),
    RowsAffected(u64),
}

impl QueryOutput {
    pub fn len(&self) -> usize {
        match self {
            QueryOutput::Rows(rows) => rows.len(),
            QueryOutput::Records(records) => records.len(),
            QueryOutput::RowsAffected(n) => usize::try_from(*n).unwrap_or(usize::MAX),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub(crate) fn build_output(columns: &[String], rows: Vec<Row>, as_dict: bool) -> QueryOutput {
    if as_dict {
        QueryOutput::Records(
            rows.into_iter()
                .map(|row| {
                    columns
                        .iter()
                        .cloned()
                        .zip(row.into_iter().map(|cell| column_to_json(&cell)))
                        .collect()
                })
                .collect(),
        )
    } else {
        QueryOutput::Rows(
            rows.into_iter()
                .map(|row| row.into_iter().map(|cell| column_to_json(&cell)).collect())
                .collect(),
        )
    }
}

fn float(value: f64) -> Value {
    Number::from_f64(value).map(Value::Number).unwrap_or(Value::Null)
}

fn temporal<'a, T>(cell: &'a ColumnData<'static>, render: impl Fn(T) -> String) -> Value
where
    T: FromSql<'a>,
{
    match T::from_sql(cell) {
        Ok(Some(value)) => Value::String(render(value)),
        _ => Value::Null,
    }
}

/// Convert one cell to JSON.
///
/// Temporal types render as ISO-8601, binary as base64, and decimals and
/// GUIDs as strings so no precision is lost.
pub fn column_to_json(cell: &ColumnData<'static>) -> Value {
    match cell {
        ColumnData::U8(v) => v.map(Value::from).unwrap_or(Value::Null),
        ColumnData::I16(v) => v.map(Value::from).unwrap_or(Value::Null),
        ColumnData::I32(v) => v.map(Value::from).unwrap_or(Value::Null),
        ColumnData::I64(v) => v.map(Value::from).unwrap_or(Value::Null),
        ColumnData::F32(v) => v.map(|f| float(f as f64)).unwrap_or(Value::Null),
        ColumnData::F64(v) => v.map(float).unwrap_or(Value::Null),
        ColumnData::Bit(v) => v.map(Value::Bool).unwrap_or(Value::Null),
        ColumnData::String(v) => v
            .as_ref()
            .map(|s| Value::String(s.to_string()))
            .unwrap_or(Value::Null),
        ColumnData::Guid(v) => v.map(|g| Value::String(g.to_string())).unwrap_or(Value::Null),
        ColumnData::Binary(v) => v
            .as_ref()
            .map(|b| Value::String(STANDARD.encode(b)))
            .unwrap_or(Value::Null),
        ColumnData::Numeric(v) => v.map(|n| Value::String(n.to_string())).unwrap_or(Value::Null),
        ColumnData::Xml(v) => v
            .as_ref()
            .map(|xml| Value::String(xml.clone().into_owned().into_string()))
            .unwrap_or(Value::Null),
        ColumnData::DateTime(_) | ColumnData::SmallDateTime(_) | ColumnData::DateTime2(_) => {
            temporal::<NaiveDateTime>(cell, |dt| dt.format("%Y-%m-%dT%H:%M:%S%.f").to_string())
        }
        ColumnData::Date(_) => temporal::<NaiveDate>(cell, |d| d.format("%Y-%m-%d").to_string()),
        ColumnData::Time(_) => temporal::<NaiveTime>(cell, |t| t.format("%H:%M:%S%.f").to_string()),
        ColumnData::DateTimeOffset(_) => {
            temporal::<DateTime<FixedOffset>>(cell, |dt| dt.to_rfc3339())
        }
    }
}
