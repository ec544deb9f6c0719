//! Gradient sweep plan.
//!
//! A run executes the capture loop once per gradient, with a fresh set of
//! excitation parameters each time. Settings fields that may vary across
//! gradients are [`ParamSpec`]s: a plain number, an explicit list, or a
//! small arithmetic expression producing a number or list (`range`,
//! `linspace`, the basic operators). Expressions are evaluated by a
//! whitelisting recursive-descent evaluator, never a general interpreter.
//!
//! Before the sweep starts every field is broadcast to a common length N:
//! all lists must already have length N, single values are repeated. A
//! length mismatch makes the whole configuration invalid.

use serde::{Deserialize, Serialize};

use crate::config::LaserSettings;
use crate::error::{Result, RigError};

/// A settings field that may vary across gradients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamSpec {
    Scalar(f64),
    List(Vec<f64>),
    Expr(String),
}

impl ParamSpec {
    /// Resolve to a list of values. Scalars resolve to a single-element
    /// list; whether that means "constant across gradients" is decided by
    /// the broadcast step.
    pub fn values(&self) -> Result<Vec<f64>> {
        match self {
            Self::Scalar(v) => Ok(vec![*v]),
            Self::List(vs) => Ok(vs.clone()),
            Self::Expr(expr) => match eval_expression(expr)? {
                Value::Num(v) => Ok(vec![v]),
                Value::List(vs) => Ok(vs),
            },
        }
    }
}

impl From<f64> for ParamSpec {
    fn from(v: f64) -> Self {
        Self::Scalar(v)
    }
}

/// The excitation parameters of one gradient.
#[derive(Debug, Clone, PartialEq)]
pub struct GradientParams {
    pub pwm_freq_405: f64,
    pub pwm_res_bits_405: f64,
    pub pwm_duty_405: f64,
    pub pwm_freq_445: f64,
    pub pwm_res_bits_445: f64,
    pub pwm_duty_445: f64,
    /// CW-laser intensity as percent of its maximum pulse frequency.
    pub cw_intensity_percent: f64,
    /// Pulsed-laser HV supply percentage.
    pub hv_percent: f64,
    /// Pulsed-laser trigger rate driven by the firmware board, in hertz.
    pub pulse_rate_hz: f64,
}

/// The full sweep: one parameter set per gradient, in execution order.
#[derive(Debug, Clone)]
pub struct GradientPlan {
    sets: Vec<GradientParams>,
}

impl GradientPlan {
    /// Resolve and broadcast the variable settings fields into the sweep.
    pub fn from_settings(laser: &LaserSettings) -> Result<Self> {
        let fields: [(&str, Vec<f64>); 9] = [
            ("pwm_freq_405", laser.pwm_freq_405.values()?),
            ("pwm_res_bits_405", laser.pwm_res_bits_405.values()?),
            ("pwm_duty_405", laser.pwm_duty_405.values()?),
            ("pwm_freq_445", laser.pwm_freq_445.values()?),
            ("pwm_res_bits_445", laser.pwm_res_bits_445.values()?),
            ("pwm_duty_445", laser.pwm_duty_445.values()?),
            ("cw_intensity_percent", laser.cw_intensity_percent.values()?),
            ("hv_percent", laser.hv_percent.values()?),
            ("pulse_rate_hz", laser.pulse_rate_hz.values()?),
        ];

        let num_gradients = fields.iter().map(|(_, v)| v.len()).max().unwrap_or(1);
        for (name, values) in &fields {
            if values.len() != 1 && values.len() != num_gradients {
                return Err(RigError::Configuration(format!(
                    "{name} has {} values but the sweep has {num_gradients} gradients; \
                     all varying fields must agree in length",
                    values.len()
                )));
            }
            if values.is_empty() {
                return Err(RigError::Configuration(format!("{name} resolves to no values")));
            }
        }

        let pick = |values: &Vec<f64>, i: usize| -> f64 {
            if values.len() == 1 {
                values[0]
            } else {
                values[i]
            }
        };

        let sets = (0..num_gradients)
            .map(|i| GradientParams {
                pwm_freq_405: pick(&fields[0].1, i),
                pwm_res_bits_405: pick(&fields[1].1, i),
                pwm_duty_405: pick(&fields[2].1, i),
                pwm_freq_445: pick(&fields[3].1, i),
                pwm_res_bits_445: pick(&fields[4].1, i),
                pwm_duty_445: pick(&fields[5].1, i),
                cw_intensity_percent: pick(&fields[6].1, i),
                hv_percent: pick(&fields[7].1, i),
                pulse_rate_hz: pick(&fields[8].1, i),
            })
            .collect();

        Ok(Self { sets })
    }

    pub fn num_gradients(&self) -> usize {
        self.sets.len()
    }

    pub fn get(&self, index: usize) -> Option<&GradientParams> {
        self.sets.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &GradientParams> {
        self.sets.iter()
    }
}

/// Result of evaluating one expression.
#[derive(Debug, Clone, PartialEq)]
enum Value {
    Num(f64),
    List(Vec<f64>),
}

/// Evaluate a restricted arithmetic expression.
///
/// Grammar: numbers, unary `+`/`-`, binary `+ - * / % ^`, parentheses, and
/// the list constructors `range(start, stop[, step])` and
/// `linspace(start, stop, n)`. List constructors are only legal as the
/// whole expression; lists never take part in arithmetic.
fn eval_expression(expr: &str) -> Result<Value> {
    let mut parser = Parser::new(expr)?;
    if parser.tokens.is_empty() {
        return Err(invalid(expr, "empty expression"));
    }
    let value = parser.parse_root()?;
    if parser.pos != parser.tokens.len() {
        return Err(invalid(expr, "trailing input"));
    }
    Ok(value)
}

fn invalid(expr: &str, reason: &str) -> RigError {
    RigError::Configuration(format!("invalid expression {expr:?}: {reason}"))
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Num(f64),
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Caret,
    LParen,
    RParen,
    Comma,
}

struct Parser {
    source: String,
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn new(expr: &str) -> Result<Self> {
        let mut tokens = Vec::new();
        let chars: Vec<char> = expr.chars().collect();
        let mut i = 0;
        while i < chars.len() {
            let c = chars[i];
            match c {
                ' ' | '\t' => i += 1,
                '+' => {
                    tokens.push(Token::Plus);
                    i += 1;
                }
                '-' => {
                    tokens.push(Token::Minus);
                    i += 1;
                }
                '*' => {
                    tokens.push(Token::Star);
                    i += 1;
                }
                '/' => {
                    tokens.push(Token::Slash);
                    i += 1;
                }
                '%' => {
                    tokens.push(Token::Percent);
                    i += 1;
                }
                '^' => {
                    tokens.push(Token::Caret);
                    i += 1;
                }
                '(' => {
                    tokens.push(Token::LParen);
                    i += 1;
                }
                ')' => {
                    tokens.push(Token::RParen);
                    i += 1;
                }
                ',' => {
                    tokens.push(Token::Comma);
                    i += 1;
                }
                '0'..='9' | '.' => {
                    let start = i;
                    while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                        i += 1;
                    }
                    let literal: String = chars[start..i].iter().collect();
                    let value = literal
                        .parse::<f64>()
                        .map_err(|_| invalid(expr, &format!("bad number {literal:?}")))?;
                    tokens.push(Token::Num(value));
                }
                c if c.is_ascii_alphabetic() || c == '_' => {
                    let start = i;
                    while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                        i += 1;
                    }
                    tokens.push(Token::Ident(chars[start..i].iter().collect()));
                }
                other => return Err(invalid(expr, &format!("unexpected character {other:?}"))),
            }
        }
        Ok(Self {
            source: expr.to_string(),
            tokens,
            pos: 0,
        })
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expect(&mut self, token: &Token, what: &str) -> Result<()> {
        if self.peek() == Some(token) {
            self.pos += 1;
            Ok(())
        } else {
            Err(invalid(&self.source, &format!("expected {what}")))
        }
    }

    /// A list constructor is only legal here, as the entire expression.
    fn parse_root(&mut self) -> Result<Value> {
        if let Some(Token::Ident(name)) = self.peek() {
            let name = name.clone();
            if matches!(self.tokens.get(self.pos + 1), Some(Token::LParen)) {
                self.pos += 2;
                let args = self.parse_args()?;
                return self.call(&name, &args);
            }
        }
        self.parse_expr().map(Value::Num)
    }

    fn parse_args(&mut self) -> Result<Vec<f64>> {
        let mut args = Vec::new();
        if self.peek() == Some(&Token::RParen) {
            self.pos += 1;
            return Ok(args);
        }
        loop {
            args.push(self.parse_expr()?);
            match self.advance() {
                Some(Token::Comma) => {}
                Some(Token::RParen) => return Ok(args),
                _ => return Err(invalid(&self.source, "expected ',' or ')'")),
            }
        }
    }

    fn call(&self, name: &str, args: &[f64]) -> Result<Value> {
        match name {
            "range" => {
                let (start, stop, step) = match args {
                    [stop] => (0.0, *stop, 1.0),
                    [start, stop] => (*start, *stop, 1.0),
                    [start, stop, step] => (*start, *stop, *step),
                    _ => return Err(invalid(&self.source, "range takes 1..=3 arguments")),
                };
                if step == 0.0 {
                    return Err(invalid(&self.source, "range step must be non-zero"));
                }
                let mut values = Vec::new();
                let mut v = start;
                while (step > 0.0 && v < stop) || (step < 0.0 && v > stop) {
                    values.push(v);
                    v += step;
                }
                Ok(Value::List(values))
            }
            "linspace" => {
                let [start, stop, n] = args else {
                    return Err(invalid(&self.source, "linspace takes 3 arguments"));
                };
                let count = *n as usize;
                if count == 0 {
                    return Ok(Value::List(Vec::new()));
                }
                if count == 1 {
                    return Ok(Value::List(vec![*start]));
                }
                let step = (stop - start) / (count - 1) as f64;
                Ok(Value::List(
                    (0..count).map(|i| start + step * i as f64).collect(),
                ))
            }
            other => Err(invalid(&self.source, &format!("unknown function {other:?}"))),
        }
    }

    fn parse_expr(&mut self) -> Result<f64> {
        let mut value = self.parse_term()?;
        loop {
            match self.peek() {
                Some(Token::Plus) => {
                    self.pos += 1;
                    value += self.parse_term()?;
                }
                Some(Token::Minus) => {
                    self.pos += 1;
                    value -= self.parse_term()?;
                }
                _ => return Ok(value),
            }
        }
    }

    fn parse_term(&mut self) -> Result<f64> {
        let mut value = self.parse_power()?;
        loop {
            match self.peek() {
                Some(Token::Star) => {
                    self.pos += 1;
                    value *= self.parse_power()?;
                }
                Some(Token::Slash) => {
                    self.pos += 1;
                    value /= self.parse_power()?;
                }
                Some(Token::Percent) => {
                    self.pos += 1;
                    value %= self.parse_power()?;
                }
                _ => return Ok(value),
            }
        }
    }

    fn parse_power(&mut self) -> Result<f64> {
        let base = self.parse_unary()?;
        if self.peek() == Some(&Token::Caret) {
            self.pos += 1;
            // Right-associative.
            let exponent = self.parse_power()?;
            return Ok(base.powf(exponent));
        }
        Ok(base)
    }

    fn parse_unary(&mut self) -> Result<f64> {
        match self.peek() {
            Some(Token::Minus) => {
                self.pos += 1;
                Ok(-self.parse_unary()?)
            }
            Some(Token::Plus) => {
                self.pos += 1;
                self.parse_unary()
            }
            _ => self.parse_primary(),
        }
    }

    fn parse_primary(&mut self) -> Result<f64> {
        match self.advance() {
            Some(Token::Num(v)) => Ok(v),
            Some(Token::LParen) => {
                let value = self.parse_expr()?;
                self.expect(&Token::RParen, "')'")?;
                Ok(value)
            }
            Some(Token::Ident(name)) => Err(invalid(
                &self.source,
                &format!("function {name:?} is only allowed as the whole expression"),
            )),
            _ => Err(invalid(&self.source, "expected a number")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LaserSettings;

    fn scalar_settings() -> LaserSettings {
        LaserSettings {
            repetitions: 10,
            measurement_delay_ms: 100,
            irradiation_time_ms: 5,
            serial_delay_ms: 3,
            continuous: false,
            pwm_freq_405: 1000.0.into(),
            pwm_res_bits_405: 10.0.into(),
            pwm_duty_405: 0.5.into(),
            pwm_freq_445: 1000.0.into(),
            pwm_res_bits_445: 10.0.into(),
            pwm_duty_445: 0.5.into(),
            cw_intensity_percent: 50.0.into(),
            hv_percent: 60.0.into(),
            pulse_rate_hz: 15.0.into(),
        }
    }

    #[test]
    fn scalar_arithmetic() {
        assert_eq!(eval_expression("2 + 3 * 4").unwrap(), Value::Num(14.0));
        assert_eq!(eval_expression("(2 + 3) * 4").unwrap(), Value::Num(20.0));
        assert_eq!(eval_expression("2 ^ 10").unwrap(), Value::Num(1024.0));
        assert_eq!(eval_expression("2 ^ 3 ^ 2").unwrap(), Value::Num(512.0));
        assert_eq!(eval_expression("10 % 4").unwrap(), Value::Num(2.0));
        assert_eq!(eval_expression("-5 + 1").unwrap(), Value::Num(-4.0));
    }

    #[test]
    fn range_matches_half_open_semantics() {
        assert_eq!(
            eval_expression("range(0, 200, 50)").unwrap(),
            Value::List(vec![0.0, 50.0, 100.0, 150.0])
        );
        assert_eq!(
            eval_expression("range(3)").unwrap(),
            Value::List(vec![0.0, 1.0, 2.0])
        );
        assert_eq!(
            eval_expression("range(5, 2, -1)").unwrap(),
            Value::List(vec![5.0, 4.0, 3.0])
        );
    }

    #[test]
    fn linspace_includes_endpoints() {
        assert_eq!(
            eval_expression("linspace(0, 1, 5)").unwrap(),
            Value::List(vec![0.0, 0.25, 0.5, 0.75, 1.0])
        );
    }

    #[test]
    fn rejects_anything_outside_the_whitelist() {
        assert!(eval_expression("__import__('os')").is_err());
        assert!(eval_expression("exec(1)").is_err());
        assert!(eval_expression("x + 1").is_err());
        assert!(eval_expression("1 + range(3)").is_err());
        assert!(eval_expression("").is_err());
        assert!(eval_expression("1 2").is_err());
    }

    #[test]
    fn broadcast_scalars_against_one_list() {
        let mut settings = scalar_settings();
        settings.hv_percent = ParamSpec::List(vec![20.0, 40.0, 60.0]);
        let plan = GradientPlan::from_settings(&settings).unwrap();

        assert_eq!(plan.num_gradients(), 3);
        let hv: Vec<f64> = plan.iter().map(|p| p.hv_percent).collect();
        assert_eq!(hv, vec![20.0, 40.0, 60.0]);
        // Every scalar field is broadcast to 3 equal entries.
        assert!(plan.iter().all(|p| p.cw_intensity_percent == 50.0));
        assert!(plan.iter().all(|p| p.pwm_freq_405 == 1000.0));
    }

    #[test]
    fn expression_fields_resolve_before_broadcast() {
        let mut settings = scalar_settings();
        settings.cw_intensity_percent = ParamSpec::Expr("range(0, 100, 25)".to_string());
        let plan = GradientPlan::from_settings(&settings).unwrap();
        assert_eq!(plan.num_gradients(), 4);
        let cw: Vec<f64> = plan.iter().map(|p| p.cw_intensity_percent).collect();
        assert_eq!(cw, vec![0.0, 25.0, 50.0, 75.0]);
    }

    #[test]
    fn mismatched_list_lengths_are_invalid() {
        let mut settings = scalar_settings();
        settings.hv_percent = ParamSpec::List(vec![20.0, 40.0, 60.0]);
        settings.cw_intensity_percent = ParamSpec::List(vec![10.0, 20.0]);
        assert!(matches!(
            GradientPlan::from_settings(&settings),
            Err(RigError::Configuration(_))
        ));
    }

    #[test]
    fn all_scalars_is_a_single_gradient() {
        let plan = GradientPlan::from_settings(&scalar_settings()).unwrap();
        assert_eq!(plan.num_gradients(), 1);
    }
}
