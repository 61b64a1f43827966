//! Calculated signals
//!
//! A formula combines stored signals by name, for example
//! `carState.vEgo * 3.6` or `sqrt(CAN_0x3E8_Speed ^ 2 + gpsLocation.speed ^ 2)`.
//! Stored names are either dotted (`<message_type>.<field>`) or CAN
//! identities (`CAN_0x<hex>_<signal>`); every other identifier must be one of
//! the math functions or constants below. Expressions are parsed and
//! evaluated with `evalexpr`.
//!
//! Functions: `sqrt abs sin cos tan asin acos atan atan2 exp log log10 pow`
//! plus `min max floor ceil round if`. Constants: `pi e`.

use crate::storage::SamplePoint;
use crate::types::{ImportError, Result};
use evalexpr::{
    build_operator_tree, ContextWithMutableFunctions, ContextWithMutableVariables, EvalexprError,
    Function, HashMapContext, Node, Value,
};
use std::collections::BTreeMap;
use std::fmt;

/// Dependencies are bound to these names inside the expression
const PLACEHOLDER_PREFIX: &str = "__dep";

const CONSTANTS: [&str; 2] = ["pi", "e"];

const FUNCTIONS: [&str; 13] = [
    "sqrt", "abs", "sin", "cos", "tan", "asin", "acos", "atan", "atan2", "exp", "log", "log10",
    "pow",
];

/// evalexpr builtins that are safe on numbers
const BUILTIN_FUNCTIONS: [&str; 6] = ["min", "max", "floor", "ceil", "round", "if"];

/// True for names that refer to stored samples rather than a formula
pub fn is_stored_signal_name(name: &str) -> bool {
    name.contains('.') || is_can_identity(name)
}

fn is_can_identity(name: &str) -> bool {
    let Some(rest) = name.strip_prefix("CAN_0x") else {
        return false;
    };
    match rest.split_once('_') {
        Some((hex, signal)) => {
            !hex.is_empty() && hex.chars().all(|c| c.is_ascii_hexdigit()) && !signal.is_empty()
        }
        None => false,
    }
}

fn is_identifier_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

fn placeholder(index: usize) -> String {
    format!("{PLACEHOLDER_PREFIX}{index}")
}

/// Replace stored signal names with placeholders
///
/// Returns the rewritten expression and the distinct names in order of first
/// appearance.
fn rewrite(source: &str) -> Result<(String, Vec<String>)> {
    let bytes = source.as_bytes();
    let mut out = String::with_capacity(source.len());
    let mut dependencies: Vec<String> = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let b = bytes[i];
        if b.is_ascii_digit() || (b == b'.' && bytes.get(i + 1).is_some_and(u8::is_ascii_digit)) {
            // Numeric literal, exponent included
            let start = i;
            while i < bytes.len() {
                if matches!(bytes[i], b'e' | b'E') && matches!(bytes.get(i + 1), Some(b'+' | b'-')) {
                    i += 2;
                } else if is_identifier_byte(bytes[i]) || bytes[i] == b'.' {
                    i += 1;
                } else {
                    break;
                }
            }
            out.push_str(&source[start..i]);
        } else if b.is_ascii_alphabetic() || b == b'_' {
            let start = i;
            while i < bytes.len() {
                let continues_path = bytes[i] == b'.'
                    && bytes
                        .get(i + 1)
                        .is_some_and(|c| c.is_ascii_alphabetic() || *c == b'_');
                if is_identifier_byte(bytes[i]) || continues_path {
                    i += 1;
                } else {
                    break;
                }
            }
            let token = &source[start..i];
            if is_stored_signal_name(token) {
                let index = match dependencies.iter().position(|d| d == token) {
                    Some(index) => index,
                    None => {
                        dependencies.push(token.to_string());
                        dependencies.len() - 1
                    }
                };
                out.push_str(&placeholder(index));
            } else if token.starts_with(PLACEHOLDER_PREFIX) {
                return Err(ImportError::InvalidFormula(format!(
                    "'{source}': identifier '{token}' is reserved"
                )));
            } else {
                out.push_str(token);
            }
        } else {
            match source[i..].chars().next() {
                Some(ch) => {
                    out.push(ch);
                    i += ch.len_utf8();
                }
                None => break,
            }
        }
    }

    Ok((out, dependencies))
}

fn unary(f: fn(f64) -> f64) -> Function {
    Function::new(move |argument| Ok(Value::Float(f(argument.as_number()?))))
}

fn binary(f: fn(f64, f64) -> f64) -> Function {
    Function::new(move |argument| {
        let arguments = argument.as_fixed_len_tuple(2)?;
        Ok(Value::Float(f(arguments[0].as_number()?, arguments[1].as_number()?)))
    })
}

fn formula_context() -> std::result::Result<HashMapContext, EvalexprError> {
    let mut context = HashMapContext::new();
    context.set_function("sqrt".into(), unary(f64::sqrt))?;
    context.set_function("abs".into(), unary(f64::abs))?;
    context.set_function("sin".into(), unary(f64::sin))?;
    context.set_function("cos".into(), unary(f64::cos))?;
    context.set_function("tan".into(), unary(f64::tan))?;
    context.set_function("asin".into(), unary(f64::asin))?;
    context.set_function("acos".into(), unary(f64::acos))?;
    context.set_function("atan".into(), unary(f64::atan))?;
    context.set_function("atan2".into(), binary(f64::atan2))?;
    context.set_function("exp".into(), unary(f64::exp))?;
    context.set_function("log10".into(), unary(f64::log10))?;
    context.set_function("pow".into(), binary(f64::powf))?;
    // log(x) is natural, log(x, base) takes an explicit base
    context.set_function(
        "log".into(),
        Function::new(|argument| match argument {
            Value::Tuple(arguments) if arguments.len() == 2 => Ok(Value::Float(
                arguments[0].as_number()?.log(arguments[1].as_number()?),
            )),
            other => Ok(Value::Float(other.as_number()?.ln())),
        }),
    )?;
    context.set_value("pi".into(), Value::Float(std::f64::consts::PI))?;
    context.set_value("e".into(), Value::Float(std::f64::consts::E))?;
    Ok(context)
}

/// A parsed, validated formula over stored signals
pub struct Formula {
    source: String,
    dependencies: Vec<String>,
    tree: Node,
}

impl fmt::Debug for Formula {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Formula")
            .field("source", &self.source)
            .field("dependencies", &self.dependencies)
            .finish()
    }
}

impl Formula {
    /// Parse and validate a formula
    ///
    /// Fails on syntax errors, on formulas without any stored signal, and on
    /// identifiers that are neither stored signal names nor known functions
    /// or constants.
    pub fn parse(source: &str) -> Result<Self> {
        let (rewritten, dependencies) = rewrite(source)?;
        if dependencies.is_empty() {
            return Err(ImportError::InvalidFormula(format!(
                "'{source}' references no stored signal"
            )));
        }

        let tree = build_operator_tree(&rewritten)
            .map_err(|e| ImportError::InvalidFormula(format!("'{source}': {e}")))?;

        for identifier in tree.iter_variable_identifiers() {
            if !identifier.starts_with(PLACEHOLDER_PREFIX) && !CONSTANTS.contains(&identifier) {
                return Err(ImportError::InvalidFormula(format!(
                    "'{source}': unknown name '{identifier}'"
                )));
            }
        }
        for identifier in tree.iter_function_identifiers() {
            if !FUNCTIONS.contains(&identifier) && !BUILTIN_FUNCTIONS.contains(&identifier) {
                return Err(ImportError::InvalidFormula(format!(
                    "'{source}': unknown function '{identifier}'"
                )));
            }
        }

        let formula = Self {
            source: source.to_string(),
            dependencies,
            tree,
        };
        // Operator arity and result type only show up on evaluation
        formula.evaluate(&vec![1.0; formula.dependencies.len()])?;
        Ok(formula)
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Stored signal names in order of first appearance
    pub fn dependencies(&self) -> &[String] {
        &self.dependencies
    }

    /// Evaluate with one value per dependency
    pub fn evaluate(&self, values: &[f64]) -> Result<f64> {
        let mut context = formula_context().map_err(|e| ImportError::InvalidFormula(e.to_string()))?;
        self.evaluate_in(&mut context, values)
            .map_err(|e| ImportError::InvalidFormula(format!("'{}': {e}", self.source)))
    }

    fn evaluate_in(
        &self,
        context: &mut HashMapContext,
        values: &[f64],
    ) -> std::result::Result<f64, EvalexprError> {
        for (index, value) in values.iter().enumerate() {
            context.set_value(placeholder(index), Value::Float(*value))?;
        }
        self.tree.eval_number_with_context(&*context)
    }

    /// Evaluate over one series per dependency, in `dependencies()` order
    ///
    /// A point is produced at every timestamp where each dependency has a
    /// sample; when a series holds several samples at one timestamp the last
    /// one counts. Points that fail to evaluate or are not finite are skipped.
    pub fn evaluate_series(&self, series: &[Vec<SamplePoint>]) -> Result<Vec<SamplePoint>> {
        if series.len() != self.dependencies.len() {
            return Err(ImportError::InvalidFormula(format!(
                "'{}' needs {} series, got {}",
                self.source,
                self.dependencies.len(),
                series.len()
            )));
        }

        let by_time: Vec<BTreeMap<u64, f64>> = series
            .iter()
            .map(|points| points.iter().map(|p| (p.time_ns, p.value)).collect())
            .collect();
        let Some((first, rest)) = by_time.split_first() else {
            return Ok(Vec::new());
        };

        let mut context = formula_context().map_err(|e| ImportError::InvalidFormula(e.to_string()))?;
        let mut values = vec![0.0; by_time.len()];
        let mut points = Vec::new();
        let mut skipped = 0u64;

        'time: for (&time_ns, &value) in first {
            values[0] = value;
            for (slot, samples) in values[1..].iter_mut().zip(rest) {
                match samples.get(&time_ns) {
                    Some(v) => *slot = *v,
                    None => continue 'time,
                }
            }
            match self.evaluate_in(&mut context, &values) {
                Ok(result) if result.is_finite() => points.push(SamplePoint { time_ns, value: result }),
                Ok(_) => skipped += 1,
                Err(e) => {
                    log::trace!("{} at t={}: {}", self.source, time_ns, e);
                    skipped += 1;
                }
            }
        }

        if skipped > 0 {
            log::debug!("{}: {} points skipped", self.source, skipped);
        }
        Ok(points)
    }
}
