//! Minimal boolean expression evaluator for service placement
//! constraints: a boolean expression over node property equality
//! tests, e.g. `NodeType == "Blue" && (Rack != "r3" || Ssd == "true")`.

use std::collections::HashMap;
use std::iter::Peekable;
use std::str::Chars;

/// Parse and evaluate `expr` against `properties`. A malformed
/// expression evaluates to `false` rather than panicking — an
/// unsatisfiable placement constraint behaves the same as one that
/// rejects every node.
pub fn evaluate(expr: &str, properties: &HashMap<String, String>) -> bool {
    if expr.trim().is_empty() {
        return true;
    }
    let mut parser = Parser::new(expr);
    match parser.parse_or() {
        Some(result) if parser.at_end() => result.eval(properties),
        _ => false,
    }
}

#[derive(Debug)]
enum Node {
    And(Box<Node>, Box<Node>),
    Or(Box<Node>, Box<Node>),
    Not(Box<Node>),
    Eq(String, String),
    Neq(String, String),
}

impl Node {
    fn eval(&self, properties: &HashMap<String, String>) -> bool {
        match self {
            Node::And(l, r) => l.eval(properties) && r.eval(properties),
            Node::Or(l, r) => l.eval(properties) || r.eval(properties),
            Node::Not(n) => !n.eval(properties),
            Node::Eq(k, v) => properties.get(k).map(|actual| actual == v).unwrap_or(false),
            Node::Neq(k, v) => properties.get(k).map(|actual| actual != v).unwrap_or(true),
        }
    }
}

struct Parser<'a> {
    chars: Peekable<Chars<'a>>,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Self {
        Self {
            chars: input.chars().peekable(),
        }
    }

    fn at_end(&mut self) -> bool {
        self.skip_ws();
        self.chars.peek().is_none()
    }

    fn skip_ws(&mut self) {
        while matches!(self.chars.peek(), Some(c) if c.is_whitespace()) {
            self.chars.next();
        }
    }

    fn peek_char(&mut self) -> Option<char> {
        self.skip_ws();
        self.chars.peek().copied()
    }

    fn consume(&mut self, c: char) -> bool {
        if self.peek_char() == Some(c) {
            self.chars.next();
            true
        } else {
            false
        }
    }

    fn parse_or(&mut self) -> Option<Node> {
        let mut left = self.parse_and()?;
        loop {
            self.skip_ws();
            if self.try_match("||") {
                let right = self.parse_and()?;
                left = Node::Or(Box::new(left), Box::new(right));
            } else {
                break;
            }
        }
        Some(left)
    }

    fn parse_and(&mut self) -> Option<Node> {
        let mut left = self.parse_unary()?;
        loop {
            self.skip_ws();
            if self.try_match("&&") {
                let right = self.parse_unary()?;
                left = Node::And(Box::new(left), Box::new(right));
            } else {
                break;
            }
        }
        Some(left)
    }

    fn parse_unary(&mut self) -> Option<Node> {
        if self.consume('!') {
            return Some(Node::Not(Box::new(self.parse_unary()?)));
        }
        self.parse_atom()
    }

    fn parse_atom(&mut self) -> Option<Node> {
        if self.consume('(') {
            let inner = self.parse_or()?;
            self.consume(')');
            return Some(inner);
        }
        let key = self.parse_ident()?;
        self.skip_ws();
        let negated = if self.try_match("!=") {
            true
        } else if self.try_match("==") {
            false
        } else {
            return None;
        };
        self.skip_ws();
        let value = self.parse_value()?;
        Some(if negated {
            Node::Neq(key, value)
        } else {
            Node::Eq(key, value)
        })
    }

    fn try_match(&mut self, token: &str) -> bool {
        self.skip_ws();
        let mut clone = self.chars.clone();
        for expected in token.chars() {
            if clone.next() != Some(expected) {
                return false;
            }
        }
        self.chars = clone;
        true
    }

    fn parse_ident(&mut self) -> Option<String> {
        self.skip_ws();
        let mut out = String::new();
        while matches!(self.chars.peek(), Some(c) if c.is_alphanumeric() || *c == '_' || *c == '.') {
            out.push(self.chars.next().unwrap());
        }
        if out.is_empty() {
            None
        } else {
            Some(out)
        }
    }

    fn parse_value(&mut self) -> Option<String> {
        self.skip_ws();
        if self.consume('"') {
            let mut out = String::new();
            loop {
                match self.chars.next() {
                    Some('"') | None => break,
                    Some(c) => out.push(c),
                }
            }
            Some(out)
        } else {
            self.parse_ident()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn simple_equality() {
        let p = props(&[("NodeType", "Blue")]);
        assert!(evaluate("NodeType == \"Blue\"", &p));
        assert!(!evaluate("NodeType == \"Red\"", &p));
    }

    #[test]
    fn negation_and_inequality() {
        let p = props(&[("Rack", "r1")]);
        assert!(evaluate("Rack != \"r3\"", &p));
        assert!(evaluate("!(Rack == \"r3\")", &p));
    }

    #[test]
    fn conjunction_and_disjunction_with_parens() {
        let p = props(&[("NodeType", "Blue"), ("Ssd", "true")]);
        assert!(evaluate("NodeType == \"Blue\" && (Ssd == \"true\" || Ssd == \"false\")", &p));
        assert!(!evaluate("NodeType == \"Green\" && Ssd == \"true\"", &p));
    }

    #[test]
    fn missing_property_fails_equality_and_passes_inequality() {
        let p = props(&[]);
        assert!(!evaluate("NodeType == \"Blue\"", &p));
        assert!(evaluate("NodeType != \"Blue\"", &p));
    }

    #[test]
    fn empty_expression_is_unconstrained() {
        assert!(evaluate("", &HashMap::new()));
    }

    #[test]
    fn malformed_expression_is_not_satisfiable() {
        let p = props(&[("NodeType", "Blue")]);
        assert!(!evaluate("NodeType ==", &p));
    }
}
