//! Arithmetic grammar for formula text.
//!
//! Supports:
//! - Numbers (integers, floats, scientific notation)
//! - Cross-solution references (`variable.solution`)
//! - Arithmetic operators (`+`, `-`, `*`, `/`, `//`, `%`, `^`, `**`)
//! - Parentheses for grouping
//! - Calls into a closed function table (see [`FUNCTIONS`])
//!
//! Nothing outside this grammar is accepted: unknown identifiers and
//! functions are rejected while parsing, before any evaluation happens.

use super::error::VariableError;

/// The only callable names a formula may use.
pub const FUNCTIONS: &[&str] = &[
    "sqrt", "sin", "cos", "tan", "abs", "min", "max", "pow", "exp", "log", "log10", "ceil",
    "floor", "round",
];

/// Deepest nesting of parentheses, calls and signs a formula may use.
pub const MAX_NESTING: usize = 100;

/// Expression AST node
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Numeric literal
    Number(f64),
    /// `variable.solution`
    Reference { variable: String, solution: String },
    /// Binary operation
    BinaryOp {
        op: BinaryOperator,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    /// Unary operation
    UnaryOp {
        op: UnaryOperator,
        operand: Box<Expr>,
    },
    /// Function call
    FnCall { name: String, args: Vec<Expr> },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BinaryOperator {
    Add,
    Sub,
    Mul,
    Div,
    FloorDiv,
    Mod,
    Pow,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UnaryOperator {
    Neg,
    Plus,
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Identifier(String),
    Reference(String, String),
    Plus,
    Minus,
    Star,
    DoubleStar,
    Slash,
    DoubleSlash,
    Percent,
    Caret,
    LParen,
    RParen,
    Comma,
    Eof,
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

struct Lexer {
    chars: Vec<char>,
    position: usize,
}

impl Lexer {
    fn new(input: &str) -> Self {
        Self {
            chars: input.chars().collect(),
            position: 0,
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.position).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.position + offset).copied()
    }

    fn advance(&mut self) -> Option<char> {
        let c = self.peek();
        if c.is_some() {
            self.position += 1;
        }
        c
    }

    fn error(&self, message: String, position: usize) -> VariableError {
        VariableError::Syntax { message, position }
    }

    fn next_token(&mut self) -> Result<Token, VariableError> {
        while self.peek().is_some_and(char::is_whitespace) {
            self.advance();
        }

        let pos = self.position;
        let Some(c) = self.peek() else {
            return Ok(Token::Eof);
        };

        let token = match c {
            '+' => Token::Plus,
            '-' => Token::Minus,
            '*' if self.peek_at(1) == Some('*') => {
                self.advance();
                Token::DoubleStar
            }
            '*' => Token::Star,
            '/' if self.peek_at(1) == Some('/') => {
                self.advance();
                Token::DoubleSlash
            }
            '/' => Token::Slash,
            '%' => Token::Percent,
            '^' => Token::Caret,
            '(' => Token::LParen,
            ')' => Token::RParen,
            ',' => Token::Comma,
            '#' => {
                let mut token = String::new();
                while self.peek().is_some_and(|c| is_ident_char(c) || c == '.' || c == '#') {
                    token.extend(self.advance());
                }
                return Err(self.error(format!("Unresolved legacy reference '{}'", token), pos));
            }
            c if c.is_ascii_digit() || c == '.' => return self.read_number(),
            c if is_ident_start(c) => return Ok(self.read_word()),
            _ => return Err(self.error(format!("Unexpected character: '{}'", c), pos)),
        };
        self.advance();
        Ok(token)
    }

    fn read_number(&mut self) -> Result<Token, VariableError> {
        let pos = self.position;
        let mut num_str = String::new();
        let mut has_dot = false;

        while let Some(c) = self.peek() {
            if c.is_ascii_digit() {
                num_str.push(c);
            } else if c == '.' && !has_dot {
                has_dot = true;
                num_str.push(c);
            } else {
                break;
            }
            self.advance();
        }

        // Scientific notation (1e10, 1.5e-3)
        if matches!(self.peek(), Some('e' | 'E')) {
            let digits_follow = match self.peek_at(1) {
                Some('+' | '-') => self.peek_at(2).is_some_and(|c| c.is_ascii_digit()),
                Some(c) => c.is_ascii_digit(),
                None => false,
            };
            if digits_follow {
                num_str.extend(self.advance());
                if matches!(self.peek(), Some('+' | '-')) {
                    num_str.extend(self.advance());
                }
                while self.peek().is_some_and(|c| c.is_ascii_digit()) {
                    num_str.extend(self.advance());
                }
            }
        }

        match num_str.parse::<f64>() {
            Ok(n) if n.is_finite() => Ok(Token::Number(n)),
            Ok(_) => Err(self.error(format!("Number out of range: '{}'", num_str), pos)),
            Err(_) => Err(self.error(format!("Invalid number: '{}'", num_str), pos)),
        }
    }

    fn read_identifier(&mut self) -> String {
        let mut name = String::new();
        while self.peek().is_some_and(is_ident_char) {
            name.extend(self.advance());
        }
        name
    }

    /// An identifier, or `identifier.identifier` as a single reference token.
    fn read_word(&mut self) -> Token {
        let name = self.read_identifier();
        if self.peek() == Some('.') && self.peek_at(1).is_some_and(is_ident_start) {
            self.advance();
            let solution = self.read_identifier();
            Token::Reference(name, solution)
        } else {
            Token::Identifier(name)
        }
    }
}

struct Parser {
    lexer: Lexer,
    current: Token,
    token_start: usize,
    depth: usize,
}

impl Parser {
    fn new(input: &str) -> Result<Self, VariableError> {
        let mut lexer = Lexer::new(input);
        let current = lexer.next_token()?;
        Ok(Self {
            lexer,
            current,
            token_start: 0,
            depth: 0,
        })
    }

    fn advance(&mut self) -> Result<(), VariableError> {
        self.token_start = self.lexer.position;
        self.current = self.lexer.next_token()?;
        Ok(())
    }

    fn error(&self, message: String) -> VariableError {
        VariableError::Syntax {
            message,
            position: self.token_start,
        }
    }

    fn expect(&mut self, token: Token, what: &str) -> Result<(), VariableError> {
        if self.current != token {
            return Err(self.error(format!("Expected {}", what)));
        }
        self.advance()
    }

    fn parse(&mut self) -> Result<Expr, VariableError> {
        let expr = self.parse_additive()?;
        if self.current != Token::Eof {
            return Err(self.error(format!(
                "Unexpected token after expression: {:?}",
                self.current
            )));
        }
        Ok(expr)
    }

    // Additive: multiplicative (('+' | '-') multiplicative)*
    fn parse_additive(&mut self) -> Result<Expr, VariableError> {
        let mut left = self.parse_multiplicative()?;

        loop {
            let op = match &self.current {
                Token::Plus => BinaryOperator::Add,
                Token::Minus => BinaryOperator::Sub,
                _ => break,
            };
            self.advance()?;
            let right = self.parse_multiplicative()?;
            left = Expr::BinaryOp {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }

        Ok(left)
    }

    // Multiplicative: unary (('*' | '/' | '//' | '%') unary)*
    fn parse_multiplicative(&mut self) -> Result<Expr, VariableError> {
        let mut left = self.parse_unary()?;

        loop {
            let op = match &self.current {
                Token::Star => BinaryOperator::Mul,
                Token::Slash => BinaryOperator::Div,
                Token::DoubleSlash => BinaryOperator::FloorDiv,
                Token::Percent => BinaryOperator::Mod,
                _ => break,
            };
            self.advance()?;
            let right = self.parse_unary()?;
            left = Expr::BinaryOp {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }

        Ok(left)
    }

    // Every nested construct passes through here, so this is where depth is counted.
    fn parse_unary(&mut self) -> Result<Expr, VariableError> {
        if self.depth >= MAX_NESTING {
            return Err(self.error(format!(
                "Expression nested more than {} levels deep",
                MAX_NESTING
            )));
        }
        self.depth += 1;
        let expr = self.parse_signed();
        self.depth -= 1;
        expr
    }

    // Unary: ('-' | '+') unary | power
    // `-2^2` is `-(2^2)`: the power binds tighter than the sign.
    fn parse_signed(&mut self) -> Result<Expr, VariableError> {
        let op = match self.current {
            Token::Minus => UnaryOperator::Neg,
            Token::Plus => UnaryOperator::Plus,
            _ => return self.parse_power(),
        };
        self.advance()?;
        let operand = self.parse_unary()?;
        Ok(Expr::UnaryOp {
            op,
            operand: Box::new(operand),
        })
    }

    // Power: primary (('^' | '**') unary)?  (right associative)
    fn parse_power(&mut self) -> Result<Expr, VariableError> {
        let base = self.parse_primary()?;

        if matches!(self.current, Token::Caret | Token::DoubleStar) {
            self.advance()?;
            let exp = self.parse_unary()?;
            Ok(Expr::BinaryOp {
                op: BinaryOperator::Pow,
                left: Box::new(base),
                right: Box::new(exp),
            })
        } else {
            Ok(base)
        }
    }

    // Primary: number | reference | function_call | '(' expr ')'
    fn parse_primary(&mut self) -> Result<Expr, VariableError> {
        match &self.current {
            Token::Number(n) => {
                let val = *n;
                self.advance()?;
                Ok(Expr::Number(val))
            }
            Token::Reference(variable, solution) => {
                let expr = Expr::Reference {
                    variable: variable.clone(),
                    solution: solution.clone(),
                };
                self.advance()?;
                Ok(expr)
            }
            Token::Identifier(name) => {
                let name = name.clone();
                self.advance()?;
                if self.current != Token::LParen {
                    return Err(VariableError::UnknownIdentifier(name));
                }
                if !FUNCTIONS.contains(&name.as_str()) {
                    return Err(VariableError::UnknownFunction(name));
                }
                self.advance()?; // consume '('
                let args = self.parse_arguments()?;
                Ok(Expr::FnCall { name, args })
            }
            Token::LParen => {
                self.advance()?;
                let expr = self.parse_additive()?;
                self.expect(Token::RParen, "')'")?;
                Ok(expr)
            }
            _ => Err(self.error(format!("Unexpected token: {:?}", self.current))),
        }
    }

    fn parse_arguments(&mut self) -> Result<Vec<Expr>, VariableError> {
        let mut args = Vec::new();
        if self.current == Token::RParen {
            self.advance()?;
            return Ok(args);
        }
        loop {
            args.push(self.parse_additive()?);
            match self.current {
                Token::Comma => self.advance()?,
                Token::RParen => {
                    self.advance()?;
                    return Ok(args);
                }
                _ => return Err(self.error("Expected ',' or ')' in argument list".to_string())),
            }
        }
    }
}

/// Parse formula text into an AST.
pub fn parse_expression(input: &str) -> Result<Expr, VariableError> {
    if input.trim().is_empty() {
        return Err(VariableError::Syntax {
            message: "Empty expression".to_string(),
            position: 0,
        });
    }
    let mut parser = Parser::new(input)?;
    parser.parse()
}

#[cfg(test)]
mod parser_tests {
    use super::*;

    fn reference(variable: &str, solution: &str) -> Expr {
        Expr::Reference {
            variable: variable.to_string(),
            solution: solution.to_string(),
        }
    }

    #[test]
    fn test_parse_simple_number() {
        assert_eq!(parse_expression("42").unwrap(), Expr::Number(42.0));
    }

    #[test]
    fn test_parse_scientific_notation() {
        let expr = parse_expression("1.5e-3").unwrap();
        if let Expr::Number(n) = expr {
            assert!((n - 0.0015).abs() < 1e-12);
        } else {
            panic!("Expected number");
        }
    }

    #[test]
    fn test_parse_reference() {
        assert_eq!(
            parse_expression("width.panel").unwrap(),
            reference("width", "panel")
        );
    }

    #[test]
    fn test_overflowing_number_rejected() {
        assert!(parse_expression("1e400").is_err());
    }

    #[test]
    fn test_decimal_is_not_a_reference() {
        assert_eq!(parse_expression("2.5").unwrap(), Expr::Number(2.5));
    }

    #[test]
    fn test_parse_precedence() {
        // width.panel - 2 * thickness.edge
        let expr = parse_expression("width.panel - 2*thickness.edge").unwrap();
        match expr {
            Expr::BinaryOp { op, left, right } => {
                assert_eq!(op, BinaryOperator::Sub);
                assert_eq!(*left, reference("width", "panel"));
                match *right {
                    Expr::BinaryOp { op, left, right } => {
                        assert_eq!(op, BinaryOperator::Mul);
                        assert_eq!(*left, Expr::Number(2.0));
                        assert_eq!(*right, reference("thickness", "edge"));
                    }
                    _ => panic!("Expected binary op for right"),
                }
            }
            _ => panic!("Expected binary op"),
        }
    }

    #[test]
    fn test_power_binds_tighter_than_negation() {
        let expr = parse_expression("-2^2").unwrap();
        match expr {
            Expr::UnaryOp { op, operand } => {
                assert_eq!(op, UnaryOperator::Neg);
                assert!(matches!(*operand, Expr::BinaryOp { op: BinaryOperator::Pow, .. }));
            }
            _ => panic!("Expected unary op"),
        }
    }

    #[test]
    fn test_double_star_is_power() {
        assert_eq!(parse_expression("2**3").unwrap(), parse_expression("2^3").unwrap());
    }

    #[test]
    fn test_parse_variadic_function() {
        let expr = parse_expression("max(height.box, height.panel, 18)").unwrap();
        match expr {
            Expr::FnCall { name, args } => {
                assert_eq!(name, "max");
                assert_eq!(args.len(), 3);
                assert_eq!(args[2], Expr::Number(18.0));
            }
            _ => panic!("Expected function call"),
        }
    }

    #[test]
    fn test_unknown_function_rejected_at_parse() {
        assert!(matches!(
            parse_expression("system(1)"),
            Err(VariableError::UnknownFunction(_))
        ));
    }

    #[test]
    fn test_bare_identifier_rejected() {
        assert!(matches!(
            parse_expression("pi * 2"),
            Err(VariableError::UnknownIdentifier(_))
        ));
    }

    #[test]
    fn test_attribute_chain_rejected() {
        // `a.b.c` lexes as a reference followed by a stray number-like '.c'
        assert!(parse_expression("a.b.c").is_err());
    }

    #[test]
    fn test_legacy_token_rejected() {
        let err = parse_expression("#3.length * 2").unwrap_err();
        assert!(err.to_string().contains("#3.length"));
    }

    #[test]
    fn test_blank_formula_rejected() {
        assert!(matches!(
            parse_expression("  "),
            Err(VariableError::Syntax { position: 0, .. })
        ));
    }

    #[test]
    fn test_nesting_limit() {
        let nested = |levels: usize| format!("{}1{}", "(".repeat(levels), ")".repeat(levels));
        assert_eq!(parse_expression(&nested(50)).unwrap(), Expr::Number(1.0));

        let err = parse_expression(&nested(5000)).unwrap_err();
        assert!(matches!(err, VariableError::Syntax { .. }));
        assert!(err.to_string().contains("nested"));

        assert!(parse_expression(&format!("{}1", "-".repeat(5000))).is_err());
        assert!(parse_expression(&format!("{}1", "sqrt(".repeat(5000))).is_err());
    }

    #[test]
    fn test_parse_missing_paren_error() {
        assert!(parse_expression("(1 + 2").is_err());
    }

    #[test]
    fn test_parse_invalid_token_error() {
        assert!(parse_expression("1 $ 2").is_err());
    }
}
