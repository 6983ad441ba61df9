//! Formula evaluator with cross-solution reference resolution.

use super::error::VariableError;
use super::parser::{parse_expression, BinaryOperator, Expr, UnaryOperator};
use super::registry::Scope;
use super::statement::LEGACY_RE;
use super::types::{RawValue, Value, Variable};
use regex::Captures;
use std::collections::HashSet;
use tracing::warn;

/// Evaluation context
pub struct EvalContext<'a> {
    scope: Scope<'a>,
    /// Read-ids of formulas being evaluated, to detect cycles
    evaluating: HashSet<String>,
    /// Path of read-ids for error reporting
    eval_path: Vec<String>,
}

impl<'a> EvalContext<'a> {
    pub fn new(scope: Scope<'a>) -> Self {
        Self {
            scope,
            evaluating: HashSet::new(),
            eval_path: Vec::new(),
        }
    }

    /// Evaluate formula text written inside solution `home`.
    fn eval_formula(&mut self, text: &str, home: Option<&str>) -> Result<f64, VariableError> {
        let expr = if self.scope.legacy_syntax() {
            parse_expression(&translate_legacy_in(text, &self.scope, home))?
        } else {
            parse_expression(text)?
        };
        self.eval_expr(&expr, home)
    }

    fn eval_expr(&mut self, expr: &Expr, home: Option<&str>) -> Result<f64, VariableError> {
        match expr {
            Expr::Number(n) => Ok(*n),

            Expr::Reference { variable, solution } => {
                self.eval_reference(variable, solution, home)
            }

            Expr::BinaryOp { op, left, right } => {
                let l = self.eval_expr(left, home)?;
                let r = self.eval_expr(right, home)?;
                apply_binary(*op, l, r).and_then(finite)
            }

            Expr::UnaryOp { op, operand } => {
                let val = self.eval_expr(operand, home)?;
                Ok(apply_unary(*op, val))
            }

            Expr::FnCall { name, args } => {
                let values = args
                    .iter()
                    .map(|arg| self.eval_expr(arg, home))
                    .collect::<Result<Vec<_>, _>>()?;
                call_function(name, &values).and_then(finite)
            }
        }
    }

    fn eval_reference(
        &mut self,
        variable: &str,
        solution: &str,
        home: Option<&str>,
    ) -> Result<f64, VariableError> {
        let target = self
            .scope
            .find(solution)
            .ok_or_else(|| VariableError::UnknownSolution(solution.to_string()))?;

        // Aliases are local: only a formula living in `solution` may use them.
        let var = if home == Some(solution) {
            target.lookup(variable)
        } else {
            target.variable(variable)
        }
        .ok_or_else(|| VariableError::UnknownVariable {
            variable: variable.to_string(),
            solution: solution.to_string(),
        })?;

        self.eval_variable(var)
    }

    /// Numeric value of a variable, evaluating its formula if it has one.
    fn eval_variable(&mut self, var: &'a Variable) -> Result<f64, VariableError> {
        let text = match &var.raw {
            RawValue::Literal(Value::Number(n)) => return Ok(*n),
            RawValue::Literal(Value::Text(t)) => {
                return Err(VariableError::NotNumeric {
                    reference: var.read_id(),
                    value: t.clone(),
                })
            }
            RawValue::Formula(text) => text,
        };

        let read_id = var.read_id();
        if self.evaluating.contains(&read_id) {
            self.eval_path.push(read_id);
            return Err(VariableError::CircularDependency(self.eval_path.clone()));
        }
        if self.eval_path.len() >= self.scope.max_depth() {
            return Err(VariableError::DepthExceeded(self.scope.max_depth()));
        }

        // Mark as being evaluated
        self.evaluating.insert(read_id.clone());
        self.eval_path.push(read_id.clone());

        let result = self.eval_formula(text, Some(&var.solution));

        // Unmark
        self.evaluating.remove(&read_id);
        self.eval_path.pop();

        result
    }
}

/// Evaluate formula text against `scope`.
///
/// The scope's current solution (if any) decides which aliases and legacy
/// ids are visible first.
pub fn evaluate(formula: &str, scope: &Scope<'_>) -> Result<f64, VariableError> {
    let mut ctx = EvalContext::new(*scope);
    ctx.eval_formula(formula, scope.home())
}

/// Evaluate a variable's own formula (or read its literal) with the variable
/// already marked in progress, so a formula that reaches itself is reported
/// as a cycle.
pub fn evaluate_variable(var: &Variable, scope: &Scope<'_>) -> Result<f64, VariableError> {
    match &var.raw {
        RawValue::Literal(Value::Number(n)) => Ok(*n),
        RawValue::Literal(Value::Text(t)) => Err(VariableError::NotNumeric {
            reference: var.read_id(),
            value: t.clone(),
        }),
        RawValue::Formula(text) => evaluate_as(&var.read_id(), text, &scope.for_solution(&var.solution)),
    }
}

/// Evaluate `formula` as the formula of `read_id`, which is marked in
/// progress for the duration.
pub fn evaluate_as(read_id: &str, formula: &str, scope: &Scope<'_>) -> Result<f64, VariableError> {
    let mut ctx = EvalContext::new(*scope);
    ctx.evaluating.insert(read_id.to_string());
    ctx.eval_path.push(read_id.to_string());
    ctx.eval_formula(formula, scope.home())
}

/// Rewrite every `#id.name` token into `name.solution`.
///
/// Lookup order is the scope's current solution, then every other solution.
/// Tokens that cannot be resolved are logged and left as they are.
pub fn translate_legacy(text: &str, scope: &Scope<'_>) -> String {
    translate_legacy_in(text, scope, scope.home())
}

fn translate_legacy_in(text: &str, scope: &Scope<'_>, home: Option<&str>) -> String {
    LEGACY_RE
        .replace_all(text, |caps: &Captures| {
            let token = &caps[0];
            let name = &caps[2];
            let found = caps[1].parse::<u32>().ok().and_then(|id| {
                home.and_then(|h| scope.find(h))
                    .and_then(|s| s.by_legacy_id(id))
                    .or_else(|| scope.solutions().find_map(|s| s.by_legacy_id(id)))
            });

            match found {
                Some(var) if var.name == name || scope.is_alias_of(var, name) => {
                    var.read_id()
                }
                Some(var) => {
                    warn!(
                        "Legacy reference {} names '{}' but id belongs to {}",
                        token,
                        name,
                        var.read_id()
                    );
                    token.to_string()
                }
                None => {
                    warn!("Legacy reference {} not found", token);
                    token.to_string()
                }
            }
        })
        .into_owned()
}

/// Evaluate a reference-free expression.
pub fn fold_constant(expr: &Expr) -> Result<f64, VariableError> {
    match expr {
        Expr::Number(n) => Ok(*n),
        Expr::Reference { solution, .. } => Err(VariableError::UnknownSolution(solution.clone())),
        Expr::BinaryOp { op, left, right } => {
            apply_binary(*op, fold_constant(left)?, fold_constant(right)?).and_then(finite)
        }
        Expr::UnaryOp { op, operand } => Ok(apply_unary(*op, fold_constant(operand)?)),
        Expr::FnCall { name, args } => {
            let values = args.iter().map(fold_constant).collect::<Result<Vec<_>, _>>()?;
            call_function(name, &values).and_then(finite)
        }
    }
}

/// Reject results that left the real numbers.
fn finite(value: f64) -> Result<f64, VariableError> {
    if value.is_nan() {
        Err(VariableError::InvalidArgument("result is not a number".to_string()))
    } else if value.is_infinite() {
        Err(VariableError::InvalidArgument("result overflows".to_string()))
    } else {
        Ok(value)
    }
}

fn apply_unary(op: UnaryOperator, val: f64) -> f64 {
    match op {
        UnaryOperator::Neg => -val,
        UnaryOperator::Plus => val,
    }
}

fn apply_binary(op: BinaryOperator, l: f64, r: f64) -> Result<f64, VariableError> {
    match op {
        BinaryOperator::Add => Ok(l + r),
        BinaryOperator::Sub => Ok(l - r),
        BinaryOperator::Mul => Ok(l * r),
        BinaryOperator::Div => {
            if r == 0.0 {
                Err(VariableError::DivisionByZero)
            } else {
                Ok(l / r)
            }
        }
        BinaryOperator::FloorDiv => {
            if r == 0.0 {
                Err(VariableError::DivisionByZero)
            } else {
                Ok((l / r).floor())
            }
        }
        // Result takes the sign of the divisor
        BinaryOperator::Mod => {
            if r == 0.0 {
                Err(VariableError::DivisionByZero)
            } else {
                Ok(l - r * (l / r).floor())
            }
        }
        BinaryOperator::Pow => power(l, r),
    }
}

fn power(base: f64, exp: f64) -> Result<f64, VariableError> {
    if base == 0.0 && exp < 0.0 {
        return Err(VariableError::DivisionByZero);
    }
    let result = base.powf(exp);
    if result.is_nan() {
        Err(VariableError::InvalidArgument(format!(
            "{}^{} has no real result",
            base, exp
        )))
    } else if result.is_infinite() && base.is_finite() && exp.is_finite() {
        Err(VariableError::InvalidArgument(format!("{}^{} overflows", base, exp)))
    } else {
        Ok(result)
    }
}

fn arity_error(name: &str, expected: &str, given: usize) -> VariableError {
    VariableError::InvalidArgument(format!(
        "{}() takes {} ({} given)",
        name, expected, given
    ))
}

fn single(name: &str, args: &[f64]) -> Result<f64, VariableError> {
    match args {
        [x] => Ok(*x),
        _ => Err(arity_error(name, "exactly one argument", args.len())),
    }
}

fn call_function(name: &str, args: &[f64]) -> Result<f64, VariableError> {
    match name {
        "sin" => Ok(single(name, args)?.sin()),
        "cos" => Ok(single(name, args)?.cos()),
        "tan" => Ok(single(name, args)?.tan()),
        "abs" => Ok(single(name, args)?.abs()),
        "ceil" => Ok(single(name, args)?.ceil()),
        "floor" => Ok(single(name, args)?.floor()),
        "sqrt" => {
            let val = single(name, args)?;
            if val < 0.0 {
                Err(VariableError::InvalidArgument("sqrt of negative number".to_string()))
            } else {
                Ok(val.sqrt())
            }
        }
        "exp" => {
            let val = single(name, args)?;
            let result = val.exp();
            if result.is_infinite() && val.is_finite() {
                Err(VariableError::InvalidArgument(format!("exp({}) overflows", val)))
            } else {
                Ok(result)
            }
        }
        "log10" => {
            let val = single(name, args)?;
            if val <= 0.0 {
                Err(VariableError::InvalidArgument("log10 of non-positive number".to_string()))
            } else {
                Ok(val.log10())
            }
        }
        "log" => {
            let (val, base) = match args {
                [x] => (*x, None),
                [x, b] => (*x, Some(*b)),
                _ => return Err(arity_error(name, "one or two arguments", args.len())),
            };
            if val <= 0.0 {
                return Err(VariableError::InvalidArgument("log of non-positive number".to_string()));
            }
            match base {
                None => Ok(val.ln()),
                Some(b) if b <= 0.0 || b == 1.0 => Err(VariableError::InvalidArgument(format!(
                    "invalid logarithm base {}",
                    b
                ))),
                Some(b) => Ok(val.ln() / b.ln()),
            }
        }
        "pow" => match args {
            [base, exp] => power(*base, *exp),
            _ => Err(arity_error(name, "exactly two arguments", args.len())),
        },
        "min" | "max" => {
            let (first, rest) = args
                .split_first()
                .ok_or_else(|| arity_error(name, "at least one argument", 0))?;
            Ok(rest.iter().fold(*first, |acc, &x| {
                if name == "min" {
                    acc.min(x)
                } else {
                    acc.max(x)
                }
            }))
        }
        // Ties go to the even neighbour: round(2.5) == 2
        "round" => match args {
            [x] => Ok(x.round_ties_even()),
            [x, digits] => {
                if digits.fract() != 0.0 {
                    return Err(VariableError::InvalidArgument(
                        "round() digits must be an integer".to_string(),
                    ));
                }
                // Beyond ±400 digits every finite double rounds the same way.
                let digits = (*digits).clamp(-400.0, 400.0) as i32;
                if digits < 0 {
                    let factor = 10f64.powi(-digits);
                    if factor.is_infinite() {
                        return Ok(0.0);
                    }
                    return Ok((x / factor).round_ties_even() * factor);
                }
                let factor = 10f64.powi(digits);
                let scaled = x * factor;
                if scaled.is_finite() {
                    Ok(scaled.round_ties_even() / factor)
                } else {
                    Ok(*x)
                }
            }
            _ => Err(arity_error(name, "one or two arguments", args.len())),
        },
        _ => Err(VariableError::UnknownFunction(name.to_string())),
    }
}
