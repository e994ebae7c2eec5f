//! Result-filter expressions.
//!
//! A test sub-command may be prefixed with `%%expr%%` tokens; each
//! expression is evaluated against the finished sub-command's result and
//! timing metrics, and its value becomes the new result. The grammar is
//! closed:
//!
//! ```text
//! expr := 'negate'                  deprecated builtin
//!       | 'max_time' '(' number ')' deprecated builtin
//!       | 'result' | 'not' 'result'
//!       | term cmp term
//! term := 'result' | 'user_time' | 'sys_time' | 'wall_time' | number
//! cmp  := '<' | '<=' | '>' | '>=' | '==' | '!='
//! ```

use log::warn;

/// Timing metrics collected for one executed sub-command, in seconds.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Metrics {
    pub user_time: f64,
    pub sys_time: f64,
    pub wall_time: f64,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Metric {
    UserTime,
    SysTime,
    WallTime,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Term {
    Metric(Metric),
    /// The current boolean result, read as 1.0/0.0 in comparisons.
    Result,
    Literal(f64),
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum CmpOp {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

#[derive(Clone, Debug, PartialEq)]
pub enum FilterExpr {
    /// Inverts the result. Deprecated in favor of `not result`.
    Negate,
    /// Fails the result when user time reaches the threshold. Deprecated
    /// in favor of a comparison over `user_time`.
    MaxTime(f64),
    Result,
    NotResult,
    Compare { lhs: Term, op: CmpOp, rhs: Term },
}

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum FilterParseError {
    #[error("unrecognized filter expression: {0:?}")]
    Unrecognized(String),
    #[error("invalid numeric literal {0:?} in filter expression")]
    BadNumber(String),
}

#[derive(Clone, Debug, PartialEq)]
enum Token {
    Ident(String),
    Number(f64),
    Op(CmpOp),
    LParen,
    RParen,
}

fn tokenize(spec: &str) -> Result<Vec<Token>, FilterParseError> {
    let mut tokens = Vec::new();
    let mut chars = spec.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            'a'..='z' | 'A'..='Z' | '_' => {
                let mut ident = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_alphanumeric() || c == '_' {
                        ident.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Ident(ident));
            }
            '0'..='9' | '.' => {
                let mut digits = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_digit() || c == '.' {
                        digits.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let value = digits
                    .parse()
                    .map_err(|_| FilterParseError::BadNumber(digits.clone()))?;
                tokens.push(Token::Number(value));
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            '<' | '>' | '=' | '!' => {
                chars.next();
                let eq = chars.peek() == Some(&'=');
                if eq {
                    chars.next();
                }
                let op = match (c, eq) {
                    ('<', false) => CmpOp::Lt,
                    ('<', true) => CmpOp::Le,
                    ('>', false) => CmpOp::Gt,
                    ('>', true) => CmpOp::Ge,
                    ('=', true) => CmpOp::Eq,
                    ('!', true) => CmpOp::Ne,
                    _ => return Err(FilterParseError::Unrecognized(spec.to_string())),
                };
                tokens.push(Token::Op(op));
            }
            _ => return Err(FilterParseError::Unrecognized(spec.to_string())),
        }
    }
    Ok(tokens)
}

fn term(token: &Token) -> Option<Term> {
    match token {
        Token::Ident(name) => match name.as_str() {
            "result" => Some(Term::Result),
            "user_time" => Some(Term::Metric(Metric::UserTime)),
            "sys_time" => Some(Term::Metric(Metric::SysTime)),
            "wall_time" => Some(Term::Metric(Metric::WallTime)),
            _ => None,
        },
        Token::Number(value) => Some(Term::Literal(*value)),
        _ => None,
    }
}

impl FilterExpr {
    pub fn parse(spec: &str) -> Result<FilterExpr, FilterParseError> {
        let unrecognized = || FilterParseError::Unrecognized(spec.to_string());
        let tokens = tokenize(spec)?;
        let expr = match tokens.as_slice() {
            [Token::Ident(name)] if name == "negate" => FilterExpr::Negate,
            [Token::Ident(name)] if name == "result" => FilterExpr::Result,
            [Token::Ident(not), Token::Ident(result)] if not == "not" && result == "result" => {
                FilterExpr::NotResult
            }
            [Token::Ident(name), Token::LParen, Token::Number(value), Token::RParen]
                if name == "max_time" =>
            {
                warn!(
                    "'max_time' filter is deprecated, use 'user_time < {:.4}' \
                     filter expression",
                    value
                );
                FilterExpr::MaxTime(*value)
            }
            [lhs, Token::Op(op), rhs] => FilterExpr::Compare {
                lhs: term(lhs).ok_or_else(unrecognized)?,
                op: *op,
                rhs: term(rhs).ok_or_else(unrecognized)?,
            },
            _ => return Err(unrecognized()),
        };
        Ok(expr)
    }

    /// Evaluates against a finished sub-command; the return value becomes
    /// the sub-command's new result.
    pub fn evaluate(&self, result: bool, metrics: &Metrics) -> bool {
        match self {
            FilterExpr::Negate => {
                warn!("'negate' filter is deprecated, use 'not result' filter expression");
                !result
            }
            FilterExpr::MaxTime(threshold) => {
                if metrics.user_time >= *threshold {
                    false
                } else {
                    result
                }
            }
            FilterExpr::Result => result,
            FilterExpr::NotResult => !result,
            FilterExpr::Compare { lhs, op, rhs } => {
                let lhs = lhs.value(result, metrics);
                let rhs = rhs.value(result, metrics);
                match op {
                    CmpOp::Lt => lhs < rhs,
                    CmpOp::Le => lhs <= rhs,
                    CmpOp::Gt => lhs > rhs,
                    CmpOp::Ge => lhs >= rhs,
                    CmpOp::Eq => lhs == rhs,
                    CmpOp::Ne => lhs != rhs,
                }
            }
        }
    }
}

impl Term {
    fn value(&self, result: bool, metrics: &Metrics) -> f64 {
        match self {
            Term::Literal(value) => *value,
            Term::Result => {
                if result {
                    1.0
                } else {
                    0.0
                }
            }
            Term::Metric(Metric::UserTime) => metrics.user_time,
            Term::Metric(Metric::SysTime) => metrics.sys_time,
            Term::Metric(Metric::WallTime) => metrics.wall_time,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics(user: f64) -> Metrics {
        Metrics {
            user_time: user,
            sys_time: 0.1,
            wall_time: user + 0.1,
        }
    }

    #[test]
    fn parse_builtins() {
        assert_eq!(FilterExpr::parse("negate"), Ok(FilterExpr::Negate));
        assert_eq!(FilterExpr::parse("max_time(10)"), Ok(FilterExpr::MaxTime(10.0)));
        assert_eq!(FilterExpr::parse("result"), Ok(FilterExpr::Result));
        assert_eq!(FilterExpr::parse("not result"), Ok(FilterExpr::NotResult));
    }

    #[test]
    fn parse_comparison() {
        assert_eq!(
            FilterExpr::parse("user_time < 2.0"),
            Ok(FilterExpr::Compare {
                lhs: Term::Metric(Metric::UserTime),
                op: CmpOp::Lt,
                rhs: Term::Literal(2.0),
            })
        );
        // Whitespace is optional.
        assert_eq!(
            FilterExpr::parse("wall_time>=0.5"),
            Ok(FilterExpr::Compare {
                lhs: Term::Metric(Metric::WallTime),
                op: CmpOp::Ge,
                rhs: Term::Literal(0.5),
            })
        );
    }

    #[test]
    fn parse_rejects_arbitrary_code() {
        assert!(FilterExpr::parse("__import__('os')").is_err());
        assert!(FilterExpr::parse("user_time < < 1").is_err());
        assert!(FilterExpr::parse("frobnicate").is_err());
        assert!(FilterExpr::parse("").is_err());
        assert!(FilterExpr::parse("max_time()").is_err());
    }

    #[test]
    fn slow_command_fails_time_limit() {
        let expr = FilterExpr::parse("user_time < 1.0").unwrap();
        // Exit status was success, but the command took too long.
        assert!(!expr.evaluate(true, &metrics(2.0)));
        assert!(expr.evaluate(true, &metrics(0.5)));
    }

    #[test]
    fn negate_inverts() {
        let expr = FilterExpr::parse("negate").unwrap();
        assert!(!expr.evaluate(true, &metrics(0.0)));
        assert!(expr.evaluate(false, &metrics(0.0)));
    }

    #[test]
    fn max_time_only_fails() {
        let expr = FilterExpr::parse("max_time(1.0)").unwrap();
        assert!(!expr.evaluate(true, &metrics(1.0)));
        // Below the threshold the previous result is passed through.
        assert!(expr.evaluate(true, &metrics(0.2)));
        assert!(!expr.evaluate(false, &metrics(0.2)));
    }

    #[test]
    fn result_participates_in_comparisons() {
        let expr = FilterExpr::parse("result == 0").unwrap();
        assert!(expr.evaluate(false, &metrics(0.0)));
        assert!(!expr.evaluate(true, &metrics(0.0)));
    }
}
