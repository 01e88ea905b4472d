//! Narrow expression interface.
//!
//! DML verbs need to evaluate predicates and projection maps over rows, but
//! the core is not a SQL engine: expressions are built programmatically as a
//! small tree and evaluated with SQL three-valued logic. Anything richer
//! (parsing, subqueries, functions) belongs to the external query runtime.
//!
//! Comparisons and arithmetic on NULL yield NULL; `AND`/`OR` follow Kleene
//! logic; the null-safe equality `<=>` always yields a boolean. A predicate
//! selects a row only when it evaluates to `true` — NULL does not select.

use std::collections::HashSet;
use std::fmt;

use snafu::prelude::*;

use crate::runtime::Row;

/// A runtime value.
#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    /// SQL NULL.
    Null,
    /// Boolean.
    Boolean(bool),
    /// 64-bit integer (covers byte/short/integer/long columns).
    Long(i64),
    /// 64-bit float (covers float/double columns).
    Double(f64),
    /// UTF-8 string.
    String(String),
}

impl Scalar {
    /// Whether this value is NULL.
    pub fn is_null(&self) -> bool {
        matches!(self, Scalar::Null)
    }

    /// Numeric view, coercing integers to floats.
    fn as_double(&self) -> Option<f64> {
        match self {
            Scalar::Long(v) => Some(*v as f64),
            Scalar::Double(v) => Some(*v),
            _ => None,
        }
    }

    /// Three-valued ordering: `None` when either side is NULL or the types
    /// are not comparable.
    pub fn compare(&self, other: &Scalar) -> Option<std::cmp::Ordering> {
        use Scalar::*;
        match (self, other) {
            (Null, _) | (_, Null) => None,
            (Boolean(a), Boolean(b)) => Some(a.cmp(b)),
            (Long(a), Long(b)) => Some(a.cmp(b)),
            (String(a), String(b)) => Some(a.cmp(b)),
            _ => {
                let (a, b) = (self.as_double()?, other.as_double()?);
                a.partial_cmp(&b)
            }
        }
    }

    /// Null-safe equality: NULL <=> NULL is true, NULL <=> x is false.
    pub fn null_safe_eq(&self, other: &Scalar) -> bool {
        match (self.is_null(), other.is_null()) {
            (true, true) => true,
            (true, false) | (false, true) => false,
            (false, false) => self.compare(other) == Some(std::cmp::Ordering::Equal),
        }
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Null => write!(f, "NULL"),
            Scalar::Boolean(v) => write!(f, "{v}"),
            Scalar::Long(v) => write!(f, "{v}"),
            Scalar::Double(v) => write!(f, "{v}"),
            Scalar::String(v) => write!(f, "'{v}'"),
        }
    }
}

impl From<i64> for Scalar {
    fn from(v: i64) -> Self {
        Scalar::Long(v)
    }
}

impl From<i32> for Scalar {
    fn from(v: i32) -> Self {
        Scalar::Long(v as i64)
    }
}

impl From<f64> for Scalar {
    fn from(v: f64) -> Self {
        Scalar::Double(v)
    }
}

impl From<bool> for Scalar {
    fn from(v: bool) -> Self {
        Scalar::Boolean(v)
    }
}

impl From<&str> for Scalar {
    fn from(v: &str) -> Self {
        Scalar::String(v.to_string())
    }
}

impl From<String> for Scalar {
    fn from(v: String) -> Self {
        Scalar::String(v)
    }
}

impl<T: Into<Scalar>> From<Option<T>> for Scalar {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(v) => v.into(),
            None => Scalar::Null,
        }
    }
}

/// Comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    /// `=`
    Eq,
    /// `<>`
    NotEq,
    /// `<`
    Lt,
    /// `<=`
    LtEq,
    /// `>`
    Gt,
    /// `>=`
    GtEq,
}

/// Arithmetic operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    /// `+`
    Add,
    /// `-`
    Sub,
    /// `*`
    Mul,
}

/// A bound-by-name expression tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// A constant.
    Literal(Scalar),
    /// A column reference, optionally qualified (`s.key`).
    Column(String),
    /// Comparison; NULL operands yield NULL.
    Cmp {
        /// Operator.
        op: CmpOp,
        /// Left operand.
        left: Box<Expr>,
        /// Right operand.
        right: Box<Expr>,
    },
    /// Null-safe equality (`<=>`); always yields a boolean.
    NullSafeEq(Box<Expr>, Box<Expr>),
    /// Arithmetic; NULL operands yield NULL.
    Arith {
        /// Operator.
        op: ArithOp,
        /// Left operand.
        left: Box<Expr>,
        /// Right operand.
        right: Box<Expr>,
    },
    /// Kleene AND.
    And(Box<Expr>, Box<Expr>),
    /// Kleene OR.
    Or(Box<Expr>, Box<Expr>),
    /// Kleene NOT.
    Not(Box<Expr>),
    /// `IS NULL`; always yields a boolean.
    IsNull(Box<Expr>),
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Literal(v) => write!(f, "{v}"),
            Expr::Column(name) => write!(f, "{name}"),
            Expr::Cmp { op, left, right } => {
                let symbol = match op {
                    CmpOp::Eq => "=",
                    CmpOp::NotEq => "<>",
                    CmpOp::Lt => "<",
                    CmpOp::LtEq => "<=",
                    CmpOp::Gt => ">",
                    CmpOp::GtEq => ">=",
                };
                write!(f, "({left} {symbol} {right})")
            }
            Expr::NullSafeEq(left, right) => write!(f, "({left} <=> {right})"),
            Expr::Arith { op, left, right } => {
                let symbol = match op {
                    ArithOp::Add => "+",
                    ArithOp::Sub => "-",
                    ArithOp::Mul => "*",
                };
                write!(f, "({left} {symbol} {right})")
            }
            Expr::And(left, right) => write!(f, "({left} AND {right})"),
            Expr::Or(left, right) => write!(f, "({left} OR {right})"),
            Expr::Not(inner) => write!(f, "(NOT {inner})"),
            Expr::IsNull(inner) => write!(f, "({inner} IS NULL)"),
        }
    }
}

/// Errors raised during expression evaluation.
#[derive(Debug, Snafu)]
pub enum ExprError {
    /// The expression references a column the row does not carry.
    #[snafu(display("Unknown column in expression: {name}"))]
    UnknownExprColumn {
        /// The missing column.
        name: String,
    },

    /// Operand types do not fit the operator.
    #[snafu(display("Cannot apply {op} to {left} and {right}"))]
    InvalidOperands {
        /// Operator description.
        op: String,
        /// Left operand rendering.
        left: String,
        /// Right operand rendering.
        right: String,
    },
}

impl Expr {
    /// A column reference.
    pub fn col(name: impl Into<String>) -> Expr {
        Expr::Column(name.into())
    }

    /// A literal.
    pub fn lit(value: impl Into<Scalar>) -> Expr {
        Expr::Literal(value.into())
    }

    fn cmp(self, op: CmpOp, other: Expr) -> Expr {
        Expr::Cmp {
            op,
            left: Box::new(self),
            right: Box::new(other),
        }
    }

    /// `self = other`
    pub fn eq(self, other: Expr) -> Expr {
        self.cmp(CmpOp::Eq, other)
    }

    /// `self <> other`
    pub fn not_eq(self, other: Expr) -> Expr {
        self.cmp(CmpOp::NotEq, other)
    }

    /// `self < other`
    pub fn lt(self, other: Expr) -> Expr {
        self.cmp(CmpOp::Lt, other)
    }

    /// `self <= other`
    pub fn lt_eq(self, other: Expr) -> Expr {
        self.cmp(CmpOp::LtEq, other)
    }

    /// `self > other`
    pub fn gt(self, other: Expr) -> Expr {
        self.cmp(CmpOp::Gt, other)
    }

    /// `self >= other`
    pub fn gt_eq(self, other: Expr) -> Expr {
        self.cmp(CmpOp::GtEq, other)
    }

    /// `self <=> other`
    pub fn null_safe_eq(self, other: Expr) -> Expr {
        Expr::NullSafeEq(Box::new(self), Box::new(other))
    }

    fn arith(self, op: ArithOp, other: Expr) -> Expr {
        Expr::Arith {
            op,
            left: Box::new(self),
            right: Box::new(other),
        }
    }

    /// `self + other`
    pub fn add(self, other: Expr) -> Expr {
        self.arith(ArithOp::Add, other)
    }

    /// `self - other`
    pub fn sub(self, other: Expr) -> Expr {
        self.arith(ArithOp::Sub, other)
    }

    /// `self * other`
    pub fn mul(self, other: Expr) -> Expr {
        self.arith(ArithOp::Mul, other)
    }

    /// `self AND other`
    pub fn and(self, other: Expr) -> Expr {
        Expr::And(Box::new(self), Box::new(other))
    }

    /// `self OR other`
    pub fn or(self, other: Expr) -> Expr {
        Expr::Or(Box::new(self), Box::new(other))
    }

    /// `NOT self`
    #[allow(clippy::should_implement_trait)]
    pub fn not(self) -> Expr {
        Expr::Not(Box::new(self))
    }

    /// `self IS NULL`
    pub fn is_null(self) -> Expr {
        Expr::IsNull(Box::new(self))
    }

    /// Evaluate against a row with three-valued logic.
    pub fn eval(&self, row: &Row) -> Result<Scalar, ExprError> {
        match self {
            Expr::Literal(v) => Ok(v.clone()),
            Expr::Column(name) => row
                .get(name)
                .cloned()
                .context(UnknownExprColumnSnafu { name }),
            Expr::Cmp { op, left, right } => {
                let (l, r) = (left.eval(row)?, right.eval(row)?);
                Ok(match l.compare(&r) {
                    None => Scalar::Null,
                    Some(ord) => {
                        use std::cmp::Ordering::*;
                        let holds = match op {
                            CmpOp::Eq => ord == Equal,
                            CmpOp::NotEq => ord != Equal,
                            CmpOp::Lt => ord == Less,
                            CmpOp::LtEq => ord != Greater,
                            CmpOp::Gt => ord == Greater,
                            CmpOp::GtEq => ord != Less,
                        };
                        Scalar::Boolean(holds)
                    }
                })
            }
            Expr::NullSafeEq(left, right) => {
                let (l, r) = (left.eval(row)?, right.eval(row)?);
                Ok(Scalar::Boolean(l.null_safe_eq(&r)))
            }
            Expr::Arith { op, left, right } => {
                let (l, r) = (left.eval(row)?, right.eval(row)?);
                if l.is_null() || r.is_null() {
                    return Ok(Scalar::Null);
                }
                match (&l, &r) {
                    (Scalar::Long(a), Scalar::Long(b)) => Ok(Scalar::Long(match op {
                        ArithOp::Add => a.wrapping_add(*b),
                        ArithOp::Sub => a.wrapping_sub(*b),
                        ArithOp::Mul => a.wrapping_mul(*b),
                    })),
                    _ => {
                        let (a, b) = match (l.as_double(), r.as_double()) {
                            (Some(a), Some(b)) => (a, b),
                            _ => {
                                return InvalidOperandsSnafu {
                                    op: format!("{op:?}"),
                                    left: l.to_string(),
                                    right: r.to_string(),
                                }
                                .fail();
                            }
                        };
                        Ok(Scalar::Double(match op {
                            ArithOp::Add => a + b,
                            ArithOp::Sub => a - b,
                            ArithOp::Mul => a * b,
                        }))
                    }
                }
            }
            Expr::And(left, right) => {
                let (l, r) = (left.eval(row)?, right.eval(row)?);
                Ok(kleene_and(&l, &r))
            }
            Expr::Or(left, right) => {
                let (l, r) = (left.eval(row)?, right.eval(row)?);
                Ok(kleene_or(&l, &r))
            }
            Expr::Not(inner) => Ok(match inner.eval(row)? {
                Scalar::Boolean(v) => Scalar::Boolean(!v),
                Scalar::Null => Scalar::Null,
                other => {
                    return InvalidOperandsSnafu {
                        op: "NOT".to_string(),
                        left: other.to_string(),
                        right: String::new(),
                    }
                    .fail();
                }
            }),
            Expr::IsNull(inner) => Ok(Scalar::Boolean(inner.eval(row)?.is_null())),
        }
    }

    /// Evaluate as a selection predicate: NULL does not select.
    pub fn eval_predicate(&self, row: &Row) -> Result<bool, ExprError> {
        Ok(matches!(self.eval(row)?, Scalar::Boolean(true)))
    }

    /// Split a conjunction into its conjuncts (flattening nested ANDs).
    pub fn split_conjuncts(&self) -> Vec<&Expr> {
        match self {
            Expr::And(left, right) => {
                let mut parts = left.split_conjuncts();
                parts.extend(right.split_conjuncts());
                parts
            }
            other => vec![other],
        }
    }

    /// The set of column names the expression references.
    pub fn references(&self) -> HashSet<&str> {
        fn walk<'a>(expr: &'a Expr, out: &mut HashSet<&'a str>) {
            match expr {
                Expr::Literal(_) => {}
                Expr::Column(name) => {
                    out.insert(name.as_str());
                }
                Expr::Cmp { left, right, .. }
                | Expr::NullSafeEq(left, right)
                | Expr::Arith { left, right, .. }
                | Expr::And(left, right)
                | Expr::Or(left, right) => {
                    walk(left, out);
                    walk(right, out);
                }
                Expr::Not(inner) | Expr::IsNull(inner) => walk(inner, out),
            }
        }
        let mut out = HashSet::new();
        walk(self, &mut out);
        out
    }

    /// Whether every referenced column satisfies `allowed`.
    pub fn references_only(&self, allowed: impl Fn(&str) -> bool) -> bool {
        self.references().into_iter().all(allowed)
    }
}

fn kleene_and(l: &Scalar, r: &Scalar) -> Scalar {
    use Scalar::*;
    match (l, r) {
        (Boolean(false), _) | (_, Boolean(false)) => Boolean(false),
        (Boolean(true), Boolean(true)) => Boolean(true),
        _ => Null,
    }
}

fn kleene_or(l: &Scalar, r: &Scalar) -> Scalar {
    use Scalar::*;
    match (l, r) {
        (Boolean(true), _) | (_, Boolean(true)) => Boolean(true),
        (Boolean(false), Boolean(false)) => Boolean(false),
        _ => Null,
    }
}
