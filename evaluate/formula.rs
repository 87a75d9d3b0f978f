//! # Model Formulas and Design Matrices
//!
//! A small formula language for logistic models:
//!
//! - `target ~ a + b` regresses `target` on `a` and `b` plus an intercept.
//! - `a:b` is the interaction (elementwise product) of `a` and `b`.
//! - `a*b` expands to `a + b + a:b`; longer products expand to every
//!   non-empty subset of their factors.
//! - `0` or `- 1` drops the intercept, `1` keeps it.
//!
//! Text columns are categorical and expand to treatment-coded indicator
//! columns named `col[T.level]`, with the alphabetically first level as the
//! reference. The level sets are learnt once, from the training rows, and the
//! same `DesignLayout` then builds the matrix for any other rows so that train
//! and test designs always line up column for column.

use ndarray::{Array1, Array2};
use polars::prelude::*;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub const INTERCEPT: &str = "Intercept";

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FormulaError {
    #[error("Formula '{0}' must contain exactly one '~' separating target and predictors.")]
    MissingTilde(String),
    #[error("Formula term '{0}' is not a valid column reference.")]
    InvalidTerm(String),
    #[error("Column '{0}' referenced by the formula was not found in the data.")]
    UnknownColumn(String),
    #[error("Column '{0}' could not be read: {1}")]
    UnreadableColumn(String, String),
    #[error("Column '{column}' has a missing value at row {row}.")]
    MissingValue { column: String, row: usize },
    #[error("Column '{column}' contains level '{level}' that was absent from the training rows.")]
    UnseenLevel { column: String, level: String },
    #[error("Target '{column}' must be binary (0/1) but row {row} holds {value}.")]
    NonBinaryTarget {
        column: String,
        row: usize,
        value: f64,
    },
    #[error("The formula produces an empty design matrix.")]
    EmptyDesign,
}

/// One additive term: a single column or an interaction of several.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Term {
    pub factors: Vec<String>,
}

impl Term {
    pub fn degree(&self) -> usize {
        self.factors.len()
    }

    fn key(&self) -> BTreeSet<&str> {
        self.factors.iter().map(String::as_str).collect()
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.factors.join(":"))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Formula {
    pub target: String,
    pub intercept: bool,
    pub terms: Vec<Term>,
}

impl Formula {
    /// Every column the formula touches, target first.
    pub fn columns(&self) -> Vec<&str> {
        let mut columns = vec![self.target.as_str()];
        for term in &self.terms {
            for factor in &term.factors {
                if !columns.contains(&factor.as_str()) {
                    columns.push(factor.as_str());
                }
            }
        }
        columns
    }

    fn push_term(&mut self, factors: Vec<String>) {
        let candidate = Term { factors };
        if !self.terms.iter().any(|t| t.key() == candidate.key()) {
            self.terms.push(candidate);
        }
    }
}

impl fmt::Display for Formula {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts: Vec<String> = self.terms.iter().map(Term::to_string).collect();
        if !self.intercept {
            parts.insert(0, "0".to_string());
        }
        write!(f, "{} ~ {}", self.target, parts.join(" + "))
    }
}

fn identifier(text: &str) -> Result<String, FormulaError> {
    let name = text.trim();
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    if valid_start && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.') {
        Ok(name.to_string())
    } else {
        Err(FormulaError::InvalidTerm(text.trim().to_string()))
    }
}

/// All non-empty subsets of `factors`, lower orders first, in factor order.
fn expand_product(factors: &[String]) -> Vec<Vec<String>> {
    let n = factors.len();
    let mut subsets: Vec<Vec<String>> = (1u32..(1 << n))
        .map(|mask| {
            (0..n)
                .filter(|bit| mask & (1 << bit) != 0)
                .map(|bit| factors[bit].clone())
                .collect()
        })
        .collect();
    subsets.sort_by_key(Vec::len);
    subsets
}

impl FromStr for Formula {
    type Err = FormulaError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let mut sides = text.split('~');
        let (Some(lhs), Some(rhs), None) = (sides.next(), sides.next(), sides.next()) else {
            return Err(FormulaError::MissingTilde(text.to_string()));
        };

        let mut formula = Formula {
            target: identifier(lhs)?,
            intercept: true,
            terms: Vec::new(),
        };

        // "- 1" is the only subtraction understood; rewrite it as "+ 0".
        let normalized = rhs.replace("- 1", "+ 0").replace("-1", "+ 0");
        for chunk in normalized.split('+') {
            let chunk = chunk.trim();
            match chunk {
                "" => return Err(FormulaError::InvalidTerm(rhs.trim().to_string())),
                "1" => formula.intercept = true,
                "0" => formula.intercept = false,
                _ if chunk.contains('*') => {
                    let factors = chunk
                        .split('*')
                        .map(identifier)
                        .collect::<Result<Vec<_>, _>>()?;
                    for subset in expand_product(&factors) {
                        formula.push_term(subset);
                    }
                }
                _ => {
                    let factors = chunk
                        .split(':')
                        .map(identifier)
                        .collect::<Result<Vec<_>, _>>()?;
                    formula.push_term(factors);
                }
            }
        }

        // Main effects before interactions; stable within a degree.
        formula.terms.sort_by_key(Term::degree);
        Ok(formula)
    }
}

/// Raw values of one referenced column.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameColumn {
    Numeric(Vec<Option<f64>>),
    Categorical(Vec<Option<String>>),
}

/// The columns a formula needs, pulled out of a DataFrame once so that fold
/// after fold can be assembled by row index without touching Polars again.
#[derive(Debug, Clone)]
pub struct ModelFrame {
    columns: HashMap<String, FrameColumn>,
    height: usize,
}

impl ModelFrame {
    pub fn from_dataframe(df: &DataFrame, formula: &Formula) -> Result<Self, FormulaError> {
        let mut columns = HashMap::new();
        for name in formula.columns() {
            let column = df
                .column(name)
                .map_err(|_| FormulaError::UnknownColumn(name.to_string()))?;
            let unreadable = |e: PolarsError| FormulaError::UnreadableColumn(name.to_string(), e.to_string());
            let values = if matches!(column.dtype(), DataType::String) {
                FrameColumn::Categorical(
                    column
                        .str()
                        .map_err(unreadable)?
                        .into_iter()
                        .map(|v| v.map(str::to_string))
                        .collect(),
                )
            } else {
                let casted = column.cast(&DataType::Float64).map_err(unreadable)?;
                FrameColumn::Numeric(casted.f64().map_err(unreadable)?.into_iter().collect())
            };
            columns.insert(name.to_string(), values);
        }
        Ok(Self {
            columns,
            height: df.height(),
        })
    }

    pub fn height(&self) -> usize {
        self.height
    }

    fn column(&self, name: &str) -> Result<&FrameColumn, FormulaError> {
        self.columns
            .get(name)
            .ok_or_else(|| FormulaError::UnknownColumn(name.to_string()))
    }

    fn numeric(&self, name: &str, row: usize) -> Result<f64, FormulaError> {
        match self.column(name)? {
            FrameColumn::Numeric(values) => values[row].ok_or_else(|| FormulaError::MissingValue {
                column: name.to_string(),
                row,
            }),
            FrameColumn::Categorical(_) => Err(FormulaError::UnknownColumn(name.to_string())),
        }
    }

    fn level(&self, name: &str, row: usize) -> Result<&str, FormulaError> {
        match self.column(name)? {
            FrameColumn::Categorical(values) => {
                values[row]
                    .as_deref()
                    .ok_or_else(|| FormulaError::MissingValue {
                        column: name.to_string(),
                        row,
                    })
            }
            FrameColumn::Numeric(_) => Err(FormulaError::UnknownColumn(name.to_string())),
        }
    }
}

/// How one factor turns into design columns.
#[derive(Debug, Clone, PartialEq)]
enum Coding {
    Numeric,
    /// `levels[0]` is the reference unless `full` is set.
    Categorical { levels: Vec<String>, full: bool },
}

impl Coding {
    fn encoded_levels(&self) -> &[String] {
        match self {
            Coding::Numeric => &[],
            Coding::Categorical { levels, full: true } => levels,
            Coding::Categorical { levels, full: false } => levels.get(1..).unwrap_or(&[]),
        }
    }
}

/// Column structure of a design matrix, fixed from the training rows.
#[derive(Debug, Clone)]
pub struct DesignLayout {
    formula: Formula,
    /// Per term, the coding of each of its factors.
    codings: Vec<Vec<Coding>>,
    column_names: Vec<String>,
}

impl DesignLayout {
    pub fn fit(formula: &Formula, frame: &ModelFrame, rows: &[usize]) -> Result<Self, FormulaError> {
        let mut levels: HashMap<&str, Vec<String>> = HashMap::new();
        for term in &formula.terms {
            for factor in &term.factors {
                if levels.contains_key(factor.as_str()) {
                    continue;
                }
                if let FrameColumn::Categorical(_) = frame.column(factor)? {
                    let mut seen = BTreeSet::new();
                    for &row in rows {
                        seen.insert(frame.level(factor, row)?.to_string());
                    }
                    levels.insert(factor.as_str(), seen.into_iter().collect());
                }
            }
        }

        // Without an intercept the first categorical main effect keeps all of
        // its levels so that the baseline is still represented.
        let mut full_coding_used = formula.intercept;
        let mut codings = Vec::with_capacity(formula.terms.len());
        let mut column_names = Vec::new();
        if formula.intercept {
            column_names.push(INTERCEPT.to_string());
        }

        for term in &formula.terms {
            let mut term_codings = Vec::with_capacity(term.factors.len());
            for factor in &term.factors {
                let coding = match levels.get(factor.as_str()) {
                    None => Coding::Numeric,
                    Some(factor_levels) => {
                        let full = !full_coding_used && term.degree() == 1;
                        full_coding_used |= full;
                        Coding::Categorical {
                            levels: factor_levels.clone(),
                            full,
                        }
                    }
                };
                term_codings.push(coding);
            }

            let mut names = vec![String::new()];
            for (factor, coding) in term.factors.iter().zip(&term_codings) {
                let labels: Vec<String> = match coding {
                    Coding::Numeric => vec![factor.clone()],
                    Coding::Categorical { .. } => coding
                        .encoded_levels()
                        .iter()
                        .map(|level| format!("{factor}[T.{level}]"))
                        .collect(),
                };
                names = names
                    .iter()
                    .flat_map(|prefix| {
                        labels.iter().map(move |label| {
                            if prefix.is_empty() {
                                label.clone()
                            } else {
                                format!("{prefix}:{label}")
                            }
                        })
                    })
                    .collect();
            }
            column_names.extend(names);
            codings.push(term_codings);
        }

        if column_names.is_empty() {
            return Err(FormulaError::EmptyDesign);
        }

        Ok(Self {
            formula: formula.clone(),
            codings,
            column_names,
        })
    }

    pub fn column_names(&self) -> &[String] {
        &self.column_names
    }

    pub fn n_columns(&self) -> usize {
        self.column_names.len()
    }

    /// Builds the design matrix for `rows` using the training level sets.
    pub fn design_matrix(&self, frame: &ModelFrame, rows: &[usize]) -> Result<Array2<f64>, FormulaError> {
        let mut x = Array2::zeros((rows.len(), self.n_columns()));
        for (i, &row) in rows.iter().enumerate() {
            let mut col = 0;
            if self.formula.intercept {
                x[[i, col]] = 1.0;
                col += 1;
            }
            for (term, codings) in self.formula.terms.iter().zip(&self.codings) {
                let mut block = vec![1.0];
                for (factor, coding) in term.factors.iter().zip(codings) {
                    let values = match coding {
                        Coding::Numeric => vec![frame.numeric(factor, row)?],
                        Coding::Categorical { levels, .. } => {
                            let level = frame.level(factor, row)?;
                            if !levels.iter().any(|known| known == level) {
                                return Err(FormulaError::UnseenLevel {
                                    column: factor.clone(),
                                    level: level.to_string(),
                                });
                            }
                            coding
                                .encoded_levels()
                                .iter()
                                .map(|known| if known == level { 1.0 } else { 0.0 })
                                .collect()
                        }
                    };
                    block = block
                        .iter()
                        .flat_map(|&prefix| values.iter().map(move |&v| prefix * v))
                        .collect();
                }
                for value in block {
                    x[[i, col]] = value;
                    col += 1;
                }
            }
        }
        Ok(x)
    }

    /// The 0/1 response for `rows`.
    pub fn response(&self, frame: &ModelFrame, rows: &[usize]) -> Result<Array1<f64>, FormulaError> {
        binary_column(frame, &self.formula.target, rows)
    }
}

/// Reads a numeric column as a 0/1 vector, rejecting anything else.
pub fn binary_column(frame: &ModelFrame, name: &str, rows: &[usize]) -> Result<Array1<f64>, FormulaError> {
    let mut y = Array1::zeros(rows.len());
    for (i, &row) in rows.iter().enumerate() {
        let value = frame.numeric(name, row)?;
        if value != 0.0 && value != 1.0 {
            return Err(FormulaError::NonBinaryTarget {
                column: name.to_string(),
                row,
                value,
            });
        }
        y[i] = value;
    }
    Ok(y)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame() -> ModelFrame {
        let df = DataFrame::new(vec![
            Column::new("y".into(), vec![0.0, 1.0, 1.0, 0.0]),
            Column::new("a".into(), vec![1.0, 2.0, 3.0, 4.0]),
            Column::new("g".into(), vec!["M", "F", "M", "X"]),
        ])
        .unwrap();
        let formula: Formula = "y ~ a + g + a:g".parse().unwrap();
        ModelFrame::from_dataframe(&df, &formula).unwrap()
    }

    #[test]
    fn star_expands_to_main_effects_and_interaction() {
        let formula: Formula = "target ~ a + b + a*b".parse().unwrap();
        let terms: Vec<String> = formula.terms.iter().map(Term::to_string).collect();
        assert_eq!(terms, vec!["a", "b", "a:b"]);
        assert!(formula.intercept);
        assert_eq!(formula.target, "target");
    }

    #[test]
    fn three_way_product_expands_every_subset() {
        let formula: Formula = "y ~ a*b*c".parse().unwrap();
        let terms: Vec<String> = formula.terms.iter().map(Term::to_string).collect();
        assert_eq!(terms, vec!["a", "b", "c", "a:b", "a:c", "b:c", "a:b:c"]);
    }

    #[test]
    fn intercept_can_be_removed() {
        let formula: Formula = "y ~ a - 1".parse().unwrap();
        assert!(!formula.intercept);
        assert_eq!(formula.to_string(), "y ~ 0 + a");
    }

    #[test]
    fn malformed_formulas_are_rejected() {
        assert!(matches!(
            "y = a".parse::<Formula>(),
            Err(FormulaError::MissingTilde(_))
        ));
        assert!(matches!(
            "y ~ a + 3b".parse::<Formula>(),
            Err(FormulaError::InvalidTerm(_))
        ));
        assert!(matches!(
            "y ~ a +".parse::<Formula>(),
            Err(FormulaError::InvalidTerm(_))
        ));
    }

    #[test]
    fn categorical_levels_come_from_training_rows() {
        let frame = frame();
        let formula: Formula = "y ~ a + g + a:g".parse().unwrap();
        let layout = DesignLayout::fit(&formula, &frame, &[0, 1, 2]).unwrap();
        assert_eq!(
            layout.column_names(),
            &["Intercept", "a", "g[T.M]", "a:g[T.M]"]
        );

        let x = layout.design_matrix(&frame, &[0, 1]).unwrap();
        assert_eq!(x.row(0).to_vec(), vec![1.0, 1.0, 1.0, 1.0]);
        assert_eq!(x.row(1).to_vec(), vec![1.0, 2.0, 0.0, 0.0]);

        let err = layout.design_matrix(&frame, &[3]).unwrap_err();
        assert_eq!(
            err,
            FormulaError::UnseenLevel {
                column: "g".to_string(),
                level: "X".to_string()
            }
        );
    }

    #[test]
    fn no_intercept_keeps_every_level_of_first_categorical() {
        let frame = frame();
        let formula: Formula = "y ~ 0 + g + a".parse().unwrap();
        let layout = DesignLayout::fit(&formula, &frame, &[0, 1, 2, 3]).unwrap();
        assert_eq!(layout.column_names(), &["g[T.F]", "g[T.M]", "g[T.X]", "a"]);
    }

    #[test]
    fn response_must_be_binary() {
        let formula: Formula = "a ~ g".parse().unwrap();
        let df = DataFrame::new(vec![
            Column::new("a".into(), vec![0.0, 2.0]),
            Column::new("g".into(), vec!["M", "F"]),
        ])
        .unwrap();
        let other = ModelFrame::from_dataframe(&df, &formula).unwrap();
        let layout = DesignLayout::fit(&formula, &other, &[0, 1]).unwrap();
        assert!(matches!(
            layout.response(&other, &[0, 1]),
            Err(FormulaError::NonBinaryTarget { row: 1, .. })
        ));
    }
}
