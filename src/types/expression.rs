//! Arithmetic expressions for symbolic matrix cells
//!
//! A cell such as `"sigma_a_sq*dt^3/2"` is tokenized and parsed once into an
//! [`Expr`] tree when the configuration is loaded, then evaluated against a
//! [`Binding`] every time the system matrices are refreshed.
//!
//! # Grammar
//!
//! ```text
//! expr    := term (('+' | '-') term)*
//! term    := unary (('*' | '/') unary)*
//! unary   := ('+' | '-') unary | power
//! power   := primary (('^' | '**') unary)?
//! primary := number | ident | ident '(' expr ')' | '(' expr ')'
//! ```
//!
//! Only whole identifiers are ever looked up, so `vx` never matches inside
//! `vx_m` or any other longer name.

use core::fmt;

use super::binding::Binding;

/// Errors raised while parsing or evaluating an expression.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EvaluationError {
    /// A variable is referenced that the binding does not provide
    #[error("unknown variable '{0}'")]
    UnknownVariable(String),
    /// A function outside the whitelist is called
    #[error("unknown function '{0}'")]
    UnknownFunction(String),
    /// The expression text is not well formed
    #[error("cannot parse '{expression}': {reason}")]
    Parse { expression: String, reason: String },
    /// A non-zero numerator is divided by zero
    #[error("division by zero in '{0}'")]
    DivisionByZero(String),
}

/// Whitelisted functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Function {
    Cos,
    Sin,
    Arctan,
}

impl Function {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "cos" => Some(Function::Cos),
            "sin" => Some(Function::Sin),
            "arctan" | "atan" => Some(Function::Arctan),
            _ => None,
        }
    }

    fn apply(self, arg: f64) -> f64 {
        match self {
            Function::Cos => arg.cos(),
            Function::Sin => arg.sin(),
            Function::Arctan => arg.atan(),
        }
    }

    fn name(self) -> &'static str {
        match self {
            Function::Cos => "cos",
            Function::Sin => "sin",
            Function::Arctan => "arctan",
        }
    }
}

/// Binary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
}

impl BinaryOp {
    fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Pow => "^",
        }
    }
}

/// Parsed expression tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    Variable(String),
    Neg(Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Call(Function, Box<Expr>),
}

impl Expr {
    /// Parses an expression from its textual form.
    pub fn parse(source: &str) -> Result<Self, EvaluationError> {
        let tokens = tokenize(source)?;
        let mut parser = Parser {
            source,
            tokens: &tokens,
            pos: 0,
        };
        let expr = parser.expression()?;
        if parser.pos != tokens.len() {
            return Err(parser.error("unexpected trailing input"));
        }
        Ok(expr)
    }

    /// Evaluates the expression with the given variable values.
    ///
    /// `0/0` evaluates to `0`: a zero noise scale makes terms like
    /// `sigma_a_sq/sigma_a_sq` vanish instead of failing.
    pub fn evaluate(&self, binding: &Binding) -> Result<f64, EvaluationError> {
        match self {
            Expr::Number(value) => Ok(*value),
            Expr::Variable(name) => binding
                .get(name)
                .ok_or_else(|| EvaluationError::UnknownVariable(name.clone())),
            Expr::Neg(inner) => Ok(-inner.evaluate(binding)?),
            Expr::Call(function, arg) => Ok(function.apply(arg.evaluate(binding)?)),
            Expr::Binary(op, lhs, rhs) => {
                let a = lhs.evaluate(binding)?;
                let b = rhs.evaluate(binding)?;
                match op {
                    BinaryOp::Add => Ok(a + b),
                    BinaryOp::Sub => Ok(a - b),
                    BinaryOp::Mul => Ok(a * b),
                    BinaryOp::Pow => Ok(a.powf(b)),
                    BinaryOp::Div => {
                        if b != 0.0 {
                            Ok(a / b)
                        } else if a == 0.0 {
                            Ok(0.0)
                        } else {
                            Err(EvaluationError::DivisionByZero(self.to_string()))
                        }
                    }
                }
            }
        }
    }

    /// Collects the names of all variables referenced by the expression.
    pub fn variables(&self, out: &mut Vec<String>) {
        match self {
            Expr::Number(_) => {}
            Expr::Variable(name) => {
                if !out.iter().any(|v| v == name) {
                    out.push(name.clone());
                }
            }
            Expr::Neg(inner) | Expr::Call(_, inner) => inner.variables(out),
            Expr::Binary(_, lhs, rhs) => {
                lhs.variables(out);
                rhs.variables(out);
            }
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Number(value) => write!(f, "{value}"),
            Expr::Variable(name) => write!(f, "{name}"),
            Expr::Neg(inner) => write!(f, "-({inner})"),
            Expr::Call(function, arg) => write!(f, "{}({arg})", function.name()),
            Expr::Binary(op, lhs, rhs) => write!(f, "({lhs}{}{rhs})", op.symbol()),
        }
    }
}

// ============================================================================
// Tokenizer
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Ident(String),
    Op(BinaryOp),
    LParen,
    RParen,
}

fn tokenize(source: &str) -> Result<Vec<Token>, EvaluationError> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    let parse_error = |reason: String| EvaluationError::Parse {
        expression: source.to_string(),
        reason,
    };

    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '+' => {
                tokens.push(Token::Op(BinaryOp::Add));
                i += 1;
            }
            '-' => {
                tokens.push(Token::Op(BinaryOp::Sub));
                i += 1;
            }
            '*' if chars.get(i + 1) == Some(&'*') => {
                tokens.push(Token::Op(BinaryOp::Pow));
                i += 2;
            }
            '*' => {
                tokens.push(Token::Op(BinaryOp::Mul));
                i += 1;
            }
            '/' => {
                tokens.push(Token::Op(BinaryOp::Div));
                i += 1;
            }
            '^' => {
                tokens.push(Token::Op(BinaryOp::Pow));
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
            c if c.is_ascii_digit() || c == '.' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                // Exponent part, only when followed by digits (`2e-3`, `1E5`)
                if i < chars.len() && (chars[i] == 'e' || chars[i] == 'E') {
                    let mut j = i + 1;
                    if j < chars.len() && (chars[j] == '+' || chars[j] == '-') {
                        j += 1;
                    }
                    if j < chars.len() && chars[j].is_ascii_digit() {
                        i = j;
                        while i < chars.len() && chars[i].is_ascii_digit() {
                            i += 1;
                        }
                    }
                }
                let text: String = chars[start..i].iter().collect();
                let value = text
                    .parse::<f64>()
                    .map_err(|_| parse_error(format!("invalid number '{text}'")))?;
                tokens.push(Token::Number(value));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            other => return Err(parse_error(format!("unexpected character '{other}'"))),
        }
    }

    Ok(tokens)
}

// ============================================================================
// Recursive-descent parser
// ============================================================================

struct Parser<'a> {
    source: &'a str,
    tokens: &'a [Token],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn error(&self, reason: &str) -> EvaluationError {
        EvaluationError::Parse {
            expression: self.source.to_string(),
            reason: reason.to_string(),
        }
    }

    fn peek(&self) -> Option<&'a Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<&'a Token> {
        let token = self.tokens.get(self.pos);
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expression(&mut self) -> Result<Expr, EvaluationError> {
        let mut lhs = self.term()?;
        while let Some(Token::Op(op @ (BinaryOp::Add | BinaryOp::Sub))) = self.peek() {
            self.pos += 1;
            let rhs = self.term()?;
            lhs = Expr::Binary(*op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn term(&mut self) -> Result<Expr, EvaluationError> {
        let mut lhs = self.unary()?;
        while let Some(Token::Op(op @ (BinaryOp::Mul | BinaryOp::Div))) = self.peek() {
            self.pos += 1;
            let rhs = self.unary()?;
            lhs = Expr::Binary(*op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Expr, EvaluationError> {
        match self.peek() {
            Some(Token::Op(BinaryOp::Sub)) => {
                self.pos += 1;
                Ok(Expr::Neg(Box::new(self.unary()?)))
            }
            Some(Token::Op(BinaryOp::Add)) => {
                self.pos += 1;
                self.unary()
            }
            _ => self.power(),
        }
    }

    fn power(&mut self) -> Result<Expr, EvaluationError> {
        let base = self.primary()?;
        if let Some(Token::Op(BinaryOp::Pow)) = self.peek() {
            self.pos += 1;
            let exponent = self.unary()?;
            return Ok(Expr::Binary(
                BinaryOp::Pow,
                Box::new(base),
                Box::new(exponent),
            ));
        }
        Ok(base)
    }

    fn primary(&mut self) -> Result<Expr, EvaluationError> {
        match self.next() {
            Some(Token::Number(value)) => Ok(Expr::Number(*value)),
            Some(Token::Ident(name)) => {
                if let Some(Token::LParen) = self.peek() {
                    let function = Function::from_name(name)
                        .ok_or_else(|| EvaluationError::UnknownFunction(name.clone()))?;
                    self.pos += 1;
                    let arg = self.expression()?;
                    match self.next() {
                        Some(Token::RParen) => Ok(Expr::Call(function, Box::new(arg))),
                        _ => Err(self.error("missing ')' after function argument")),
                    }
                } else {
                    Ok(Expr::Variable(name.clone()))
                }
            }
            Some(Token::LParen) => {
                let inner = self.expression()?;
                match self.next() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(self.error("missing ')'")),
                }
            }
            Some(_) => Err(self.error("unexpected operator")),
            None => Err(self.error("unexpected end of expression")),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn eval(source: &str, binding: &Binding) -> f64 {
        Expr::parse(source).unwrap().evaluate(binding).unwrap()
    }

    #[test]
    fn test_precedence_and_power() {
        let b = Binding::new().with("dt", 2.0);
        assert!((eval("1 + 2 * 3", &b) - 7.0).abs() < 1e-12);
        assert!((eval("dt^2/2", &b) - 2.0).abs() < 1e-12);
        assert!((eval("dt**3", &b) - 8.0).abs() < 1e-12);
        assert!((eval("2^3^2", &b) - 512.0).abs() < 1e-9);
        assert!((eval("-dt^2", &b) + 4.0).abs() < 1e-12);
        assert!((eval("(1 + dt) * 3", &b) - 9.0).abs() < 1e-12);
    }

    #[test]
    fn test_scientific_notation() {
        let b = Binding::new();
        assert!((eval("1e-3 * 2", &b) - 0.002).abs() < 1e-15);
        assert!((eval("2.5E2", &b) - 250.0).abs() < 1e-12);
    }

    #[test]
    fn test_functions() {
        let b = Binding::new().with("vx", 1.0).with("vy", 1.0);
        assert!((eval("cos(0)", &b) - 1.0).abs() < 1e-12);
        assert!(eval("sin(0)", &b).abs() < 1e-12);
        let angle = eval("arctan(vy/vx)", &b);
        assert!((angle - core::f64::consts::FRAC_PI_4).abs() < 1e-12);
    }

    #[test]
    fn test_whole_word_lookup() {
        // `vx` must not be substituted inside `vx_m`
        let b = Binding::new().with("vx", 3.0);
        let err = Expr::parse("vx_m + vx").unwrap().evaluate(&b).unwrap_err();
        assert_eq!(err, EvaluationError::UnknownVariable("vx_m".into()));
    }

    #[test]
    fn test_zero_over_zero_is_zero() {
        let b = Binding::new().with("sigma_a_sq", 0.0);
        let value = eval("sigma_a_sq / sigma_a_sq", &b);
        assert_eq!(value, 0.0);
        assert!(!value.is_nan());
    }

    #[test]
    fn test_nonzero_over_zero_fails() {
        let b = Binding::new().with("dt", 0.0);
        let err = Expr::parse("1/dt").unwrap().evaluate(&b).unwrap_err();
        assert!(matches!(err, EvaluationError::DivisionByZero(_)));
    }

    #[test]
    fn test_unknown_function_rejected_at_parse() {
        let err = Expr::parse("exp(dt)").unwrap_err();
        assert_eq!(err, EvaluationError::UnknownFunction("exp".into()));
    }

    #[test]
    fn test_malformed_expressions() {
        assert!(matches!(Expr::parse("1 +"), Err(EvaluationError::Parse { .. })));
        assert!(matches!(Expr::parse("(dt"), Err(EvaluationError::Parse { .. })));
        assert!(matches!(Expr::parse("dt dt"), Err(EvaluationError::Parse { .. })));
        assert!(matches!(Expr::parse("dt $ 2"), Err(EvaluationError::Parse { .. })));
    }

    #[test]
    fn test_variables_collected_once() {
        let expr = Expr::parse("sigma_a_sq*dt^4/4 + sigma_a_sq*dt").unwrap();
        let mut vars = Vec::new();
        expr.variables(&mut vars);
        assert_eq!(vars, vec!["sigma_a_sq".to_string(), "dt".to_string()]);
    }
}
