//! Connection rules: a small boolean language over the server topology
//!
//! Rules like `connected(*.hub.example) && !directcon(*.leaf.example)`
//! gate whether a configured link may be brought up.

use crate::{Error, Result};

/// Which connection attempts a rule applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CRuleKind {
    /// Automatic connects only
    Auto,
    /// Automatic and operator-requested connects
    All,
}

/// What the rule language can ask about the live network
pub trait NetworkView {
    /// Any server matching `mask` is linked, anywhere in the tree
    fn connected(&self, mask: &str) -> bool;
    /// A server matching `mask` is a direct neighbor
    fn directcon(&self, mask: &str) -> bool;
}

/// Parsed rule expression
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CRuleNode {
    Connected(String),
    Directcon(String),
    And(Box<CRuleNode>, Box<CRuleNode>),
    Or(Box<CRuleNode>, Box<CRuleNode>),
    Not(Box<CRuleNode>),
}

impl CRuleNode {
    pub fn eval(&self, view: &dyn NetworkView) -> bool {
        match self {
            CRuleNode::Connected(mask) => view.connected(mask),
            CRuleNode::Directcon(mask) => view.directcon(mask),
            CRuleNode::And(a, b) => a.eval(view) && b.eval(view),
            CRuleNode::Or(a, b) => a.eval(view) || b.eval(view),
            CRuleNode::Not(a) => !a.eval(view),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Ident(String),
    LParen,
    RParen,
    And,
    Or,
    Not,
}

fn tokenize(input: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            '!' => {
                chars.next();
                tokens.push(Token::Not);
            }
            '&' => {
                chars.next();
                if chars.next() != Some('&') {
                    return Err(Error::CRule("expected &&".to_string()));
                }
                tokens.push(Token::And);
            }
            '|' => {
                chars.next();
                if chars.next() != Some('|') {
                    return Err(Error::CRule("expected ||".to_string()));
                }
                tokens.push(Token::Or);
            }
            _ => {
                let mut ident = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_alphanumeric() || "*?.-_[]".contains(c) {
                        ident.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                if ident.is_empty() {
                    return Err(Error::CRule(format!("unexpected character {:?}", c)));
                }
                tokens.push(Token::Ident(ident));
            }
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn expect(&mut self, token: Token) -> Result<()> {
        match self.next() {
            Some(t) if t == token => Ok(()),
            other => Err(Error::CRule(format!("expected {:?}, found {:?}", token, other))),
        }
    }

    // or := and ( '||' and )*
    fn parse_or(&mut self) -> Result<CRuleNode> {
        let mut node = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.next();
            node = CRuleNode::Or(Box::new(node), Box::new(self.parse_and()?));
        }
        Ok(node)
    }

    // and := unary ( '&&' unary )*
    fn parse_and(&mut self) -> Result<CRuleNode> {
        let mut node = self.parse_unary()?;
        while self.peek() == Some(&Token::And) {
            self.next();
            node = CRuleNode::And(Box::new(node), Box::new(self.parse_unary()?));
        }
        Ok(node)
    }

    // unary := '!' unary | '(' or ')' | call
    fn parse_unary(&mut self) -> Result<CRuleNode> {
        match self.next() {
            Some(Token::Not) => Ok(CRuleNode::Not(Box::new(self.parse_unary()?))),
            Some(Token::LParen) => {
                let node = self.parse_or()?;
                self.expect(Token::RParen)?;
                Ok(node)
            }
            Some(Token::Ident(name)) => {
                self.expect(Token::LParen)?;
                let mask = match self.next() {
                    Some(Token::Ident(m)) => m,
                    other => return Err(Error::CRule(format!("expected mask, found {:?}", other))),
                };
                self.expect(Token::RParen)?;
                match name.to_lowercase().as_str() {
                    "connected" => Ok(CRuleNode::Connected(mask)),
                    "directcon" => Ok(CRuleNode::Directcon(mask)),
                    _ => Err(Error::CRule(format!("unknown function {:?}", name))),
                }
            }
            other => Err(Error::CRule(format!("unexpected token {:?}", other))),
        }
    }
}

/// Parse a rule expression into its evaluable form.
pub fn parse(input: &str) -> Result<CRuleNode> {
    let tokens = tokenize(input)?;
    if tokens.is_empty() {
        return Err(Error::CRule("empty rule".to_string()));
    }
    let mut parser = Parser { tokens, pos: 0 };
    let node = parser.parse_or()?;
    if parser.peek().is_some() {
        return Err(Error::CRule("trailing tokens".to_string()));
    }
    Ok(node)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::mask;

    struct FakeNet {
        linked: Vec<&'static str>,
        direct: Vec<&'static str>,
    }

    impl NetworkView for FakeNet {
        fn connected(&self, m: &str) -> bool {
            self.linked.iter().any(|s| mask::matches(m, s))
        }
        fn directcon(&self, m: &str) -> bool {
            self.direct.iter().any(|s| mask::matches(m, s))
        }
    }

    fn net() -> FakeNet {
        FakeNet {
            linked: vec!["hub.example", "leaf.example"],
            direct: vec!["hub.example"],
        }
    }

    #[test]
    fn test_primitives() {
        assert!(parse("connected(*.example)").unwrap().eval(&net()));
        assert!(parse("directcon(hub.example)").unwrap().eval(&net()));
        assert!(!parse("directcon(leaf.example)").unwrap().eval(&net()));
    }

    #[test]
    fn test_operators_and_precedence() {
        let n = net();
        assert!(parse("connected(hub.example) && !directcon(leaf.example)").unwrap().eval(&n));
        assert!(parse("directcon(leaf.example) || connected(leaf.example)").unwrap().eval(&n));
        // && binds tighter than ||
        let expr = parse("connected(none) && connected(none) || connected(hub.example)").unwrap();
        assert!(expr.eval(&n));
    }

    #[test]
    fn test_parentheses() {
        let n = net();
        let expr = parse("connected(none) && (connected(none) || connected(hub.example))").unwrap();
        assert!(!expr.eval(&n));
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse("").is_err());
        assert!(parse("connected(").is_err());
        assert!(parse("bogus(x)").is_err());
        assert!(parse("connected(a) &&").is_err());
        assert!(parse("connected(a) connected(b)").is_err());
    }
}
