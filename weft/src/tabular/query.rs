//! Restricted query interpreter for the tabular tool.
//!
//! A small tokenizer + recursive-descent parser over the allowed expression
//! grammar, evaluated directly against [`Frame`]. No host-language eval is
//! involved anywhere: the allow-list of methods is the whole language.
//!
//! Supported shapes (after an optional leading `df.` is stripped):
//! - chained method calls with literal args: `head(10)`,
//!   `sort_values("score", ascending=False)`, `groupby("team").sum()`
//! - attribute access: `columns`, `shape`, `dtypes`
//! - column selection: `["score"]`, `[["name", "score"]]`
//! - boolean-mask filtering: `[df["score"] > 40]`, with `&` / `|` and parens
//! - pandas-style row queries: `query("score > 40 and team == 'red'")`
//! - positional indexing: `iloc[0]`, `iloc[1:3]`

use super::frame::{compare_cells, Cell, Frame, Series};
use super::TabularError;

// ---- tokens ----------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Int(i64),
    Float(f64),
    Sym(char),
    Cmp(CmpOp),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CmpOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

fn tokenize(input: &str) -> Result<Vec<Token>, TabularError> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0usize;

    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '(' | ')' | '[' | ']' | ',' | ':' | '.' | '&' | '|' => {
                tokens.push(Token::Sym(c));
                i += 1;
            }
            '=' | '!' | '>' | '<' => {
                let two = chars.get(i + 1) == Some(&'=');
                let op = match (c, two) {
                    ('=', true) => Some(CmpOp::Eq),
                    ('!', true) => Some(CmpOp::Ne),
                    ('>', true) => Some(CmpOp::Ge),
                    ('<', true) => Some(CmpOp::Le),
                    ('>', false) => Some(CmpOp::Gt),
                    ('<', false) => Some(CmpOp::Lt),
                    ('=', false) => None,
                    _ => return Err(TabularError::Parse(format!("unexpected `{c}`"))),
                };
                match op {
                    Some(op) => {
                        tokens.push(Token::Cmp(op));
                        i += if two { 2 } else { 1 };
                    }
                    None => {
                        tokens.push(Token::Sym('='));
                        i += 1;
                    }
                }
            }
            '"' | '\'' => {
                let quote = c;
                let mut value = String::new();
                i += 1;
                while i < chars.len() && chars[i] != quote {
                    value.push(chars[i]);
                    i += 1;
                }
                if i >= chars.len() {
                    return Err(TabularError::Parse("unterminated string".into()));
                }
                i += 1;
                tokens.push(Token::Str(value));
            }
            '-' | '0'..='9' => {
                let start = i;
                if c == '-' {
                    i += 1;
                }
                let mut is_float = false;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    if chars[i] == '.' {
                        // `1.head()` style chains do not exist; a dot after
                        // digits is only a decimal point when more digits follow.
                        if chars.get(i + 1).is_some_and(char::is_ascii_digit) {
                            is_float = true;
                        } else {
                            break;
                        }
                    }
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                if text == "-" {
                    return Err(TabularError::Parse("stray `-`".into()));
                }
                if is_float {
                    tokens.push(Token::Float(text.parse().map_err(|_| {
                        TabularError::Parse(format!("bad number {text:?}"))
                    })?));
                } else {
                    tokens.push(Token::Int(text.parse().map_err(|_| {
                        TabularError::Parse(format!("bad number {text:?}"))
                    })?));
                }
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            other => return Err(TabularError::Parse(format!("unexpected `{other}`"))),
        }
    }
    Ok(tokens)
}

// ---- AST -------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Lit {
    Int(i64),
    Float(f64),
    Str(String),
    Bool(bool),
}

impl Lit {
    fn to_cell(&self) -> Cell {
        match self {
            Lit::Int(i) => Cell::Int(*i),
            Lit::Float(f) => Cell::Float(*f),
            Lit::Str(s) => Cell::Str(s.clone()),
            Lit::Bool(b) => Cell::Bool(*b),
        }
    }
}

#[derive(Debug, Clone)]
enum Arg {
    Pos(Lit),
    Kw(String, Lit),
}

#[derive(Debug, Clone)]
enum Index {
    Column(String),
    Columns(Vec<String>),
    Mask(Box<Expr>),
    Row(i64),
    Slice(Option<i64>, Option<i64>),
}

#[derive(Debug, Clone)]
enum Expr {
    /// The bare dataframe.
    Df,
    /// Method call or attribute access; `recv: None` applies to `df`.
    Call {
        recv: Option<Box<Expr>>,
        name: String,
        args: Vec<Arg>,
    },
    Index {
        recv: Option<Box<Expr>>,
        index: Index,
    },
    Compare {
        lhs: Box<Expr>,
        op: CmpOp,
        rhs: Lit,
    },
    Logic {
        lhs: Box<Expr>,
        and: bool,
        rhs: Box<Expr>,
    },
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn new(tokens: Vec<Token>) -> Self {
        Self { tokens, pos: 0 }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn eat_sym(&mut self, sym: char) -> Result<(), TabularError> {
        match self.next() {
            Some(Token::Sym(c)) if c == sym => Ok(()),
            other => Err(TabularError::Parse(format!(
                "expected `{sym}`, found {other:?}"
            ))),
        }
    }

    fn parse_expression(&mut self) -> Result<Expr, TabularError> {
        self.parse_logic()
    }

    fn parse_logic(&mut self) -> Result<Expr, TabularError> {
        let mut lhs = self.parse_comparison()?;
        while let Some(Token::Sym(op @ ('&' | '|'))) = self.peek().cloned() {
            self.next();
            let rhs = self.parse_comparison()?;
            lhs = Expr::Logic {
                lhs: Box::new(lhs),
                and: op == '&',
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn parse_comparison(&mut self) -> Result<Expr, TabularError> {
        let lhs = self.parse_postfix()?;
        if let Some(Token::Cmp(op)) = self.peek().cloned() {
            self.next();
            let rhs = self.parse_literal()?;
            return Ok(Expr::Compare {
                lhs: Box::new(lhs),
                op,
                rhs,
            });
        }
        Ok(lhs)
    }

    fn parse_postfix(&mut self) -> Result<Expr, TabularError> {
        let mut expr = self.parse_primary()?;
        loop {
            match self.peek() {
                Some(Token::Sym('.')) => {
                    self.next();
                    let name = match self.next() {
                        Some(Token::Ident(name)) => name,
                        other => {
                            return Err(TabularError::Parse(format!(
                                "expected method name, found {other:?}"
                            )))
                        }
                    };
                    let args = if self.peek() == Some(&Token::Sym('(')) {
                        self.parse_args()?
                    } else {
                        Vec::new()
                    };
                    expr = Expr::Call {
                        recv: Some(Box::new(expr)),
                        name,
                        args,
                    };
                }
                Some(Token::Sym('[')) => {
                    let index = self.parse_index()?;
                    expr = Expr::Index {
                        recv: Some(Box::new(expr)),
                        index,
                    };
                }
                _ => break,
            }
        }
        Ok(expr)
    }

    fn parse_primary(&mut self) -> Result<Expr, TabularError> {
        match self.peek().cloned() {
            Some(Token::Ident(name)) if name == "df" => {
                self.next();
                Ok(Expr::Df)
            }
            Some(Token::Ident(name)) => {
                self.next();
                let args = if self.peek() == Some(&Token::Sym('(')) {
                    self.parse_args()?
                } else {
                    Vec::new()
                };
                Ok(Expr::Call {
                    recv: None,
                    name,
                    args,
                })
            }
            Some(Token::Sym('(')) => {
                self.next();
                let inner = self.parse_expression()?;
                self.eat_sym(')')?;
                Ok(inner)
            }
            Some(Token::Sym('[')) => {
                let index = self.parse_index()?;
                Ok(Expr::Index { recv: None, index })
            }
            other => Err(TabularError::Parse(format!(
                "unexpected start of expression: {other:?}"
            ))),
        }
    }

    fn parse_args(&mut self) -> Result<Vec<Arg>, TabularError> {
        self.eat_sym('(')?;
        let mut args = Vec::new();
        if self.peek() == Some(&Token::Sym(')')) {
            self.next();
            return Ok(args);
        }
        loop {
            // kwarg: IDENT '=' literal — but a bare True/False is positional.
            if let Some(Token::Ident(name)) = self.peek().cloned() {
                if self.tokens.get(self.pos + 1) == Some(&Token::Sym('=')) {
                    self.next();
                    self.next();
                    let value = self.parse_literal()?;
                    args.push(Arg::Kw(name, value));
                } else {
                    args.push(Arg::Pos(self.parse_literal()?));
                }
            } else {
                args.push(Arg::Pos(self.parse_literal()?));
            }
            match self.next() {
                Some(Token::Sym(',')) => continue,
                Some(Token::Sym(')')) => break,
                other => {
                    return Err(TabularError::Parse(format!(
                        "expected `,` or `)`, found {other:?}"
                    )))
                }
            }
        }
        Ok(args)
    }

    fn parse_literal(&mut self) -> Result<Lit, TabularError> {
        match self.next() {
            Some(Token::Int(i)) => Ok(Lit::Int(i)),
            Some(Token::Float(f)) => Ok(Lit::Float(f)),
            Some(Token::Str(s)) => Ok(Lit::Str(s)),
            Some(Token::Ident(word)) if word == "True" || word == "true" => Ok(Lit::Bool(true)),
            Some(Token::Ident(word)) if word == "False" || word == "false" => {
                Ok(Lit::Bool(false))
            }
            Some(Token::Ident(word)) if word == "None" => Ok(Lit::Str(String::new())),
            other => Err(TabularError::Parse(format!(
                "expected literal, found {other:?}"
            ))),
        }
    }

    fn parse_index(&mut self) -> Result<Index, TabularError> {
        self.eat_sym('[')?;
        let index = match self.peek().cloned() {
            Some(Token::Str(column)) => {
                self.next();
                Index::Column(column)
            }
            Some(Token::Sym('[')) => {
                self.next();
                let mut columns = Vec::new();
                loop {
                    match self.next() {
                        Some(Token::Str(name)) => columns.push(name),
                        other => {
                            return Err(TabularError::Parse(format!(
                                "expected column name, found {other:?}"
                            )))
                        }
                    }
                    match self.next() {
                        Some(Token::Sym(',')) => continue,
                        Some(Token::Sym(']')) => break,
                        other => {
                            return Err(TabularError::Parse(format!(
                                "expected `,` or `]`, found {other:?}"
                            )))
                        }
                    }
                }
                Index::Columns(columns)
            }
            Some(Token::Int(start)) => {
                self.next();
                if self.peek() == Some(&Token::Sym(':')) {
                    self.next();
                    let end = match self.peek() {
                        Some(Token::Int(end)) => {
                            let end = *end;
                            self.next();
                            Some(end)
                        }
                        _ => None,
                    };
                    Index::Slice(Some(start), end)
                } else {
                    Index::Row(start)
                }
            }
            Some(Token::Sym(':')) => {
                self.next();
                let end = match self.peek() {
                    Some(Token::Int(end)) => {
                        let end = *end;
                        self.next();
                        Some(end)
                    }
                    _ => None,
                };
                Index::Slice(None, end)
            }
            _ => Index::Mask(Box::new(self.parse_expression()?)),
        };
        self.eat_sym(']')?;
        Ok(index)
    }
}

// ---- evaluation ------------------------------------------------------------

/// Intermediate value flowing through a chained expression.
#[derive(Debug, Clone)]
pub enum EvalValue {
    Frame(Frame),
    Series(Series),
    Scalar(Cell),
    /// `groupby("col")` awaiting its aggregation method.
    Grouped { frame: Frame, by: String },
    /// `loc` / `iloc` awaiting its index.
    Indexer(Frame),
}

/// Parses and evaluates one restricted expression against `df`.
pub fn evaluate(df: &Frame, expression: &str) -> Result<EvalValue, TabularError> {
    let tokens = tokenize(expression)?;
    if tokens.is_empty() {
        return Err(TabularError::Parse("empty expression".into()));
    }
    let mut parser = Parser::new(tokens);
    let expr = parser.parse_expression()?;
    if parser.peek().is_some() {
        return Err(TabularError::Parse("trailing tokens after expression".into()));
    }
    let value = eval(&expr, df)?;
    match value {
        EvalValue::Grouped { .. } => Err(TabularError::Parse(
            "groupby(...) needs an aggregation such as .sum() or .count()".into(),
        )),
        EvalValue::Indexer(_) => Err(TabularError::Parse(
            "loc/iloc needs an index such as iloc[0] or iloc[1:3]".into(),
        )),
        other => Ok(other),
    }
}

fn eval(expr: &Expr, df: &Frame) -> Result<EvalValue, TabularError> {
    match expr {
        Expr::Df => Ok(EvalValue::Frame(df.clone())),
        Expr::Call { recv, name, args } => {
            let receiver = match recv {
                Some(inner) => eval(inner, df)?,
                None => EvalValue::Frame(df.clone()),
            };
            apply_method(receiver, name, args)
        }
        Expr::Index { recv, index } => {
            let receiver = match recv {
                Some(inner) => eval(inner, df)?,
                None => EvalValue::Frame(df.clone()),
            };
            apply_index(receiver, index, df)
        }
        Expr::Compare { lhs, op, rhs } => {
            let series = match eval(lhs, df)? {
                EvalValue::Series(series) => series,
                _ => {
                    return Err(TabularError::Parse(
                        "comparisons need a column on the left side".into(),
                    ))
                }
            };
            Ok(EvalValue::Series(compare_series(&series, *op, &rhs.to_cell())))
        }
        Expr::Logic { lhs, and, rhs } => {
            let left = mask_of(eval(lhs, df)?)?;
            let right = mask_of(eval(rhs, df)?)?;
            let combined: Vec<Cell> = left
                .iter()
                .zip(right.iter().chain(std::iter::repeat(&false)))
                .map(|(l, r)| Cell::Bool(if *and { *l && *r } else { *l || *r }))
                .collect();
            Ok(EvalValue::Series(Series {
                name: "mask".into(),
                labels: (0..combined.len()).map(|i| i.to_string()).collect(),
                values: combined,
            }))
        }
    }
}

fn compare_series(series: &Series, op: CmpOp, rhs: &Cell) -> Series {
    let values = series
        .values
        .iter()
        .map(|cell| {
            if cell.is_null() {
                return Cell::Bool(false);
            }
            let ord = compare_cells(Some(cell), Some(rhs));
            let result = match op {
                CmpOp::Eq => ord == std::cmp::Ordering::Equal,
                CmpOp::Ne => ord != std::cmp::Ordering::Equal,
                CmpOp::Gt => ord == std::cmp::Ordering::Greater,
                CmpOp::Ge => ord != std::cmp::Ordering::Less,
                CmpOp::Lt => ord == std::cmp::Ordering::Less,
                CmpOp::Le => ord != std::cmp::Ordering::Greater,
            };
            Cell::Bool(result)
        })
        .collect();
    Series {
        name: series.name.clone(),
        labels: series.labels.clone(),
        values,
    }
}

fn mask_of(value: EvalValue) -> Result<Vec<bool>, TabularError> {
    match value {
        EvalValue::Series(series) => Ok(series
            .values
            .iter()
            .map(|cell| matches!(cell, Cell::Bool(true)))
            .collect()),
        _ => Err(TabularError::Parse("expected a boolean mask".into())),
    }
}

fn pos_int(args: &[Arg], default: i64) -> i64 {
    args.iter()
        .find_map(|arg| match arg {
            Arg::Pos(Lit::Int(i)) => Some(*i),
            Arg::Kw(name, Lit::Int(i)) if name == "n" => Some(*i),
            _ => None,
        })
        .unwrap_or(default)
}

fn pos_str(args: &[Arg]) -> Option<String> {
    args.iter().find_map(|arg| match arg {
        Arg::Pos(Lit::Str(s)) => Some(s.clone()),
        Arg::Kw(name, Lit::Str(s)) if name == "by" => Some(s.clone()),
        _ => None,
    })
}

fn kw_bool(args: &[Arg], key: &str, default: bool) -> bool {
    args.iter()
        .find_map(|arg| match arg {
            Arg::Kw(name, Lit::Bool(b)) if name == key => Some(*b),
            _ => None,
        })
        .unwrap_or(default)
}

fn apply_method(receiver: EvalValue, name: &str, args: &[Arg]) -> Result<EvalValue, TabularError> {
    match receiver {
        EvalValue::Frame(frame) => apply_frame_method(frame, name, args),
        EvalValue::Series(series) => apply_series_method(series, name, args),
        EvalValue::Grouped { frame, by } => match name {
            "sum" | "mean" | "median" | "max" | "min" | "std" | "count" => {
                Ok(EvalValue::Frame(frame.groupby_aggregate(&by, name)?))
            }
            other => Err(TabularError::Parse(format!(
                "`{other}` is not a groupby aggregation"
            ))),
        },
        EvalValue::Scalar(_) | EvalValue::Indexer(_) => Err(TabularError::Parse(format!(
            "`{name}` cannot be applied here"
        ))),
    }
}

fn apply_frame_method(frame: Frame, name: &str, args: &[Arg]) -> Result<EvalValue, TabularError> {
    let value = match name {
        "head" => EvalValue::Frame(frame.head(pos_int(args, 5).max(0) as usize)),
        "tail" => EvalValue::Frame(frame.tail(pos_int(args, 5).max(0) as usize)),
        "describe" => EvalValue::Frame(frame.describe()),
        "info" => {
            let dtypes = frame
                .dtypes()
                .into_iter()
                .map(|(name, dtype)| format!("{name}: {dtype}"))
                .collect::<Vec<_>>()
                .join(", ");
            EvalValue::Scalar(Cell::Str(format!(
                "{} rows x {} columns [{dtypes}]",
                frame.n_rows(),
                frame.n_cols()
            )))
        }
        "columns" => EvalValue::Scalar(Cell::Str(format!(
            "[{}]",
            frame
                .columns
                .iter()
                .map(|c| format!("'{c}'"))
                .collect::<Vec<_>>()
                .join(", ")
        ))),
        "shape" => EvalValue::Scalar(Cell::Str(format!(
            "({}, {})",
            frame.n_rows(),
            frame.n_cols()
        ))),
        "dtypes" => {
            let pairs = frame.dtypes();
            EvalValue::Series(Series {
                name: "dtypes".into(),
                labels: pairs.iter().map(|(name, _)| name.clone()).collect(),
                values: pairs
                    .into_iter()
                    .map(|(_, dtype)| Cell::Str(dtype.to_string()))
                    .collect(),
            })
        }
        "isna" => EvalValue::Frame(frame.null_mask_frame(false)),
        "notna" => EvalValue::Frame(frame.null_mask_frame(true)),
        "sum" | "mean" | "median" | "max" | "min" | "std" => {
            EvalValue::Series(frame.aggregate_numeric(name)?)
        }
        "count" => EvalValue::Series(frame.count_series()),
        "nunique" => EvalValue::Series(frame.nunique_series()),
        "value_counts" => {
            let rendered: Vec<String> = frame
                .rows
                .iter()
                .map(|row| {
                    format!(
                        "({})",
                        row.iter().map(Cell::render).collect::<Vec<_>>().join(", ")
                    )
                })
                .collect();
            EvalValue::Series(count_values(&rendered))
        }
        "groupby" => {
            let by = pos_str(args).ok_or_else(|| {
                TabularError::Parse("groupby needs a column name".into())
            })?;
            if frame.column_index(&by).is_none() {
                return Err(TabularError::UnknownColumn(by));
            }
            EvalValue::Grouped { frame, by }
        }
        "sort_values" => {
            let by = pos_str(args).ok_or_else(|| {
                TabularError::Parse("sort_values needs a column name".into())
            })?;
            EvalValue::Frame(frame.sort_by(&by, kw_bool(args, "ascending", true))?)
        }
        "dropna" => EvalValue::Frame(frame.dropna()),
        "fillna" => {
            let fill = args
                .iter()
                .find_map(|arg| match arg {
                    Arg::Pos(lit) | Arg::Kw(_, lit) => Some(lit.to_cell()),
                })
                .unwrap_or(Cell::Null);
            EvalValue::Frame(frame.fillna(&fill))
        }
        "query" => {
            let condition = pos_str(args)
                .ok_or_else(|| TabularError::Parse("query needs a condition string".into()))?;
            let mask = evaluate_query_condition(&frame, &condition)?;
            EvalValue::Frame(frame.filter_rows(&mask))
        }
        "loc" | "iloc" => EvalValue::Indexer(frame),
        "select_dtypes" => EvalValue::Frame(frame.select_numeric()),
        "unique" => {
            return Err(TabularError::Parse(
                "unique applies to a single column, e.g. df[\"team\"].unique()".into(),
            ))
        }
        "sample" => EvalValue::Frame(frame.sample(pos_int(args, 1).max(0) as usize)),
        other => {
            return Err(TabularError::MethodNotAllowed(other.to_string()));
        }
    };
    Ok(value)
}

fn apply_series_method(
    series: Series,
    name: &str,
    args: &[Arg],
) -> Result<EvalValue, TabularError> {
    let numeric: Vec<f64> = series.values.iter().filter_map(Cell::as_f64).collect();
    let value = match name {
        "head" => {
            let n = pos_int(args, 5).max(0) as usize;
            EvalValue::Series(Series {
                name: series.name,
                labels: series.labels.into_iter().take(n).collect(),
                values: series.values.into_iter().take(n).collect(),
            })
        }
        "tail" => {
            let n = pos_int(args, 5).max(0) as usize;
            let skip = series.values.len().saturating_sub(n);
            EvalValue::Series(Series {
                name: series.name,
                labels: series.labels.into_iter().skip(skip).collect(),
                values: series.values.into_iter().skip(skip).collect(),
            })
        }
        "sum" => scalar_aggregate(&numeric, |d| d.iter().sum()),
        "mean" => scalar_aggregate(&numeric, |d| d.iter().sum::<f64>() / d.len() as f64),
        "median" => {
            let mut sorted = numeric.clone();
            sorted.sort_by(f64::total_cmp);
            scalar_aggregate(&sorted, |d| {
                let mid = d.len() / 2;
                if d.len() % 2 == 0 {
                    (d[mid - 1] + d[mid]) / 2.0
                } else {
                    d[mid]
                }
            })
        }
        "max" => scalar_aggregate(&numeric, |d| d.iter().copied().fold(f64::MIN, f64::max)),
        "min" => scalar_aggregate(&numeric, |d| d.iter().copied().fold(f64::MAX, f64::min)),
        "std" => scalar_aggregate(&numeric, |d| {
            if d.len() < 2 {
                return 0.0;
            }
            let mean = d.iter().sum::<f64>() / d.len() as f64;
            (d.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (d.len() - 1) as f64).sqrt()
        }),
        "count" => EvalValue::Scalar(Cell::Int(
            series.values.iter().filter(|c| !c.is_null()).count() as i64,
        )),
        "nunique" => {
            let mut rendered: Vec<String> = series
                .values
                .iter()
                .filter(|c| !c.is_null())
                .map(Cell::render)
                .collect();
            rendered.sort();
            rendered.dedup();
            EvalValue::Scalar(Cell::Int(rendered.len() as i64))
        }
        "value_counts" => {
            let rendered: Vec<String> = series
                .values
                .iter()
                .filter(|c| !c.is_null())
                .map(Cell::render)
                .collect();
            EvalValue::Series(count_values(&rendered))
        }
        "unique" => {
            let mut seen = Vec::new();
            for cell in &series.values {
                if !cell.is_null() && !seen.contains(cell) {
                    seen.push(cell.clone());
                }
            }
            EvalValue::Series(Series {
                name: series.name,
                labels: (0..seen.len()).map(|i| i.to_string()).collect(),
                values: seen,
            })
        }
        "isna" | "notna" => {
            let negate = name == "notna";
            EvalValue::Series(Series {
                name: series.name,
                labels: series.labels,
                values: series
                    .values
                    .iter()
                    .map(|c| Cell::Bool(c.is_null() != negate))
                    .collect(),
            })
        }
        "dropna" => {
            let kept: Vec<(String, Cell)> = series
                .labels
                .into_iter()
                .zip(series.values)
                .filter(|(_, cell)| !cell.is_null())
                .collect();
            EvalValue::Series(Series {
                name: series.name,
                labels: kept.iter().map(|(l, _)| l.clone()).collect(),
                values: kept.into_iter().map(|(_, v)| v).collect(),
            })
        }
        "fillna" => {
            let fill = args
                .iter()
                .find_map(|arg| match arg {
                    Arg::Pos(lit) | Arg::Kw(_, lit) => Some(lit.to_cell()),
                })
                .unwrap_or(Cell::Null);
            EvalValue::Series(Series {
                name: series.name,
                labels: series.labels,
                values: series
                    .values
                    .into_iter()
                    .map(|c| if c.is_null() { fill.clone() } else { c })
                    .collect(),
            })
        }
        "sort_values" => {
            let ascending = kw_bool(args, "ascending", true);
            let mut pairs: Vec<(String, Cell)> =
                series.labels.into_iter().zip(series.values).collect();
            pairs.sort_by(|a, b| {
                super::frame::directional_compare(Some(&a.1), Some(&b.1), ascending)
            });
            EvalValue::Series(Series {
                name: series.name,
                labels: pairs.iter().map(|(l, _)| l.clone()).collect(),
                values: pairs.into_iter().map(|(_, v)| v).collect(),
            })
        }
        "describe" => {
            let stats: Vec<(&str, Option<f64>)> = vec![
                ("count", Some(numeric.len() as f64)),
                (
                    "mean",
                    (!numeric.is_empty())
                        .then(|| numeric.iter().sum::<f64>() / numeric.len() as f64),
                ),
                (
                    "min",
                    numeric.iter().copied().reduce(f64::min),
                ),
                (
                    "max",
                    numeric.iter().copied().reduce(f64::max),
                ),
            ];
            EvalValue::Series(Series {
                name: series.name,
                labels: stats.iter().map(|(s, _)| (*s).to_string()).collect(),
                values: stats
                    .into_iter()
                    .map(|(_, v)| v.map_or(Cell::Null, Cell::Float))
                    .collect(),
            })
        }
        other => return Err(TabularError::MethodNotAllowed(other.to_string())),
    };
    Ok(value)
}

fn scalar_aggregate(data: &[f64], f: impl Fn(&[f64]) -> f64) -> EvalValue {
    if data.is_empty() {
        return EvalValue::Scalar(Cell::Null);
    }
    let v = f(data);
    if v.fract() == 0.0 && v.abs() < i64::MAX as f64 {
        EvalValue::Scalar(Cell::Int(v as i64))
    } else {
        EvalValue::Scalar(Cell::Float(v))
    }
}

fn count_values(rendered: &[String]) -> Series {
    let mut counts: Vec<(String, i64)> = Vec::new();
    for value in rendered {
        match counts.iter_mut().find(|(v, _)| v == value) {
            Some((_, n)) => *n += 1,
            None => counts.push((value.clone(), 1)),
        }
    }
    counts.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    Series {
        name: "count".into(),
        labels: counts.iter().map(|(v, _)| v.clone()).collect(),
        values: counts.into_iter().map(|(_, n)| Cell::Int(n)).collect(),
    }
}

fn apply_index(receiver: EvalValue, index: &Index, df: &Frame) -> Result<EvalValue, TabularError> {
    match receiver {
        EvalValue::Frame(frame) => match index {
            Index::Column(name) => Ok(EvalValue::Series(frame.column(name)?)),
            Index::Columns(names) => Ok(EvalValue::Frame(frame.select_columns(names)?)),
            Index::Mask(expr) => {
                let mask = mask_of(eval(expr, df)?)?;
                Ok(EvalValue::Frame(frame.filter_rows(&mask)))
            }
            Index::Slice(start, end) => {
                let (start, end) = resolve_slice(*start, *end, frame.n_rows());
                Ok(EvalValue::Frame(frame.slice(start, end)))
            }
            Index::Row(_) => Err(TabularError::Parse(
                "row indexing needs loc/iloc, e.g. iloc[0]".into(),
            )),
        },
        EvalValue::Indexer(frame) => match index {
            Index::Row(i) => {
                let n = frame.n_rows() as i64;
                let idx = if *i < 0 { n + i } else { *i };
                if idx < 0 || idx >= n {
                    return Err(TabularError::Parse(format!("row {i} is out of range")));
                }
                Ok(EvalValue::Frame(frame.slice(idx as usize, idx as usize + 1)))
            }
            Index::Slice(start, end) => {
                let (start, end) = resolve_slice(*start, *end, frame.n_rows());
                Ok(EvalValue::Frame(frame.slice(start, end)))
            }
            Index::Mask(expr) => {
                let mask = mask_of(eval(expr, df)?)?;
                Ok(EvalValue::Frame(frame.filter_rows(&mask)))
            }
            Index::Column(name) => Ok(EvalValue::Series(frame.column(name)?)),
            Index::Columns(names) => Ok(EvalValue::Frame(frame.select_columns(names)?)),
        },
        EvalValue::Series(series) => match index {
            Index::Row(i) => {
                let n = series.len() as i64;
                let idx = if *i < 0 { n + i } else { *i };
                series
                    .values
                    .get(idx.max(0) as usize)
                    .cloned()
                    .map(EvalValue::Scalar)
                    .ok_or_else(|| TabularError::Parse(format!("index {i} is out of range")))
            }
            _ => Err(TabularError::Parse(
                "only positional indexing is supported on a column".into(),
            )),
        },
        _ => Err(TabularError::Parse("cannot index this value".into())),
    }
}

fn resolve_slice(start: Option<i64>, end: Option<i64>, len: usize) -> (usize, usize) {
    let resolve = |v: i64| -> usize {
        if v < 0 {
            (len as i64 + v).max(0) as usize
        } else {
            (v as usize).min(len)
        }
    };
    (
        start.map_or(0, resolve),
        end.map_or(len, resolve),
    )
}

/// Evaluates a pandas-style `query("...")` condition string: bare column
/// names compared to literals, combined with `and` / `or` / `&` / `|`.
fn evaluate_query_condition(frame: &Frame, condition: &str) -> Result<Vec<bool>, TabularError> {
    // Rewrite word operators so the main tokenizer handles the rest.
    let rewritten = condition
        .split_whitespace()
        .map(|word| match word {
            "and" => "&",
            "or" => "|",
            other => other,
        })
        .collect::<Vec<_>>()
        .join(" ");
    let tokens = tokenize(&rewritten)?;
    let mut parser = Parser::new(tokens);
    let expr = parser.parse_expression()?;
    if parser.peek().is_some() {
        return Err(TabularError::Parse("trailing tokens in query condition".into()));
    }
    let expr = rewrite_bare_columns(expr);
    mask_of(eval(&expr, frame)?)
}

/// In `query("score > 10")` the bare `score` means `df["score"]`.
fn rewrite_bare_columns(expr: Expr) -> Expr {
    match expr {
        Expr::Compare { lhs, op, rhs } => {
            let lhs = match *lhs {
                Expr::Call {
                    recv: None,
                    ref name,
                    ref args,
                } if args.is_empty() => Expr::Index {
                    recv: None,
                    index: Index::Column(name.clone()),
                },
                other => rewrite_bare_columns(other),
            };
            Expr::Compare {
                lhs: Box::new(lhs),
                op,
                rhs,
            }
        }
        Expr::Logic { lhs, and, rhs } => Expr::Logic {
            lhs: Box::new(rewrite_bare_columns(*lhs)),
            and,
            rhs: Box::new(rewrite_bare_columns(*rhs)),
        },
        other => other,
    }
}
