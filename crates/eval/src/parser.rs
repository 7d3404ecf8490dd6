//! Recursive-descent parser producing the expression tree.

use serde_json::Value;

use crate::lexer::{Spanned, Token};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quantifier {
    Exists,
    All,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Lit(Value),
    Ident(String),
    List(Vec<Expr>),
    Select(Box<Expr>, String),
    Index(Box<Expr>, Box<Expr>),
    /// `has(operand.field)`
    Has(Box<Expr>, String),
    Call(String, Vec<Expr>),
    Method(Box<Expr>, String, Vec<Expr>),
    Comprehension { quantifier: Quantifier, range: Box<Expr>, var: String, predicate: Box<Expr> },
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Cond(Box<Expr>, Box<Expr>, Box<Expr>),
}

pub struct Parser {
    tokens: Vec<Spanned>,
    pos: usize,
    depth: usize,
    max_depth: usize,
    end: usize,
}

impl Parser {
    pub fn new(tokens: Vec<Spanned>, source_len: usize, max_depth: usize) -> Self {
        Self { tokens, pos: 0, depth: 0, max_depth, end: source_len }
    }

    pub fn parse(mut self) -> Result<Expr, String> {
        let expr = self.expr()?;
        match self.tokens.get(self.pos) {
            None => Ok(expr),
            Some((tok, at)) => Err(format!("unexpected {} at offset {}", tok, at)),
        }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    fn offset(&self) -> usize {
        self.tokens.get(self.pos).map(|(_, at)| *at).unwrap_or(self.end)
    }

    fn eat(&mut self, tok: &Token) -> bool {
        if self.peek() == Some(tok) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, tok: Token) -> Result<(), String> {
        if self.eat(&tok) {
            return Ok(());
        }
        match self.peek() {
            Some(found) => Err(format!("expected {} but found {} at offset {}", tok, found, self.offset())),
            None => Err(format!("expected {} but reached end of input", tok)),
        }
    }

    fn enter(&mut self) -> Result<(), String> {
        self.depth += 1;
        if self.depth > self.max_depth {
            return Err(format!("expression nests deeper than {} levels", self.max_depth));
        }
        Ok(())
    }

    /// Every operator application deepens the tree, including left-folded
    /// chains that do not recurse while parsing.
    fn fold(&mut self, folds: &mut usize) -> Result<(), String> {
        self.enter()?;
        *folds += 1;
        Ok(())
    }

    fn expr(&mut self) -> Result<Expr, String> {
        self.enter()?;
        let cond = self.or()?;
        let out = if self.eat(&Token::Question) {
            let then = self.expr()?;
            self.expect(Token::Colon)?;
            let otherwise = self.expr()?;
            Expr::Cond(Box::new(cond), Box::new(then), Box::new(otherwise))
        } else {
            cond
        };
        self.depth -= 1;
        Ok(out)
    }

    fn or(&mut self) -> Result<Expr, String> {
        let mut lhs = self.and()?;
        let mut folds = 0;
        while self.eat(&Token::OrOr) {
            self.fold(&mut folds)?;
            let rhs = self.and()?;
            lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
        }
        self.depth -= folds;
        Ok(lhs)
    }

    fn and(&mut self) -> Result<Expr, String> {
        let mut lhs = self.relation()?;
        let mut folds = 0;
        while self.eat(&Token::AndAnd) {
            self.fold(&mut folds)?;
            let rhs = self.relation()?;
            lhs = Expr::And(Box::new(lhs), Box::new(rhs));
        }
        self.depth -= folds;
        Ok(lhs)
    }

    fn relation(&mut self) -> Result<Expr, String> {
        let mut lhs = self.additive()?;
        let mut folds = 0;
        loop {
            let op = match self.peek() {
                Some(Token::EqEq) => BinaryOp::Eq,
                Some(Token::NotEq) => BinaryOp::Ne,
                Some(Token::Lt) => BinaryOp::Lt,
                Some(Token::Le) => BinaryOp::Le,
                Some(Token::Gt) => BinaryOp::Gt,
                Some(Token::Ge) => BinaryOp::Ge,
                Some(Token::In) => BinaryOp::In,
                _ => break,
            };
            self.pos += 1;
            self.fold(&mut folds)?;
            let rhs = self.additive()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        self.depth -= folds;
        Ok(lhs)
    }

    fn additive(&mut self) -> Result<Expr, String> {
        let mut lhs = self.multiplicative()?;
        let mut folds = 0;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinaryOp::Add,
                Some(Token::Minus) => BinaryOp::Sub,
                _ => break,
            };
            self.pos += 1;
            self.fold(&mut folds)?;
            let rhs = self.multiplicative()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        self.depth -= folds;
        Ok(lhs)
    }

    fn multiplicative(&mut self) -> Result<Expr, String> {
        let mut lhs = self.unary()?;
        let mut folds = 0;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinaryOp::Mul,
                Some(Token::Slash) => BinaryOp::Div,
                Some(Token::Percent) => BinaryOp::Rem,
                _ => break,
            };
            self.pos += 1;
            self.fold(&mut folds)?;
            let rhs = self.unary()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        self.depth -= folds;
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Expr, String> {
        let op = match self.peek() {
            Some(Token::Bang) => UnaryOp::Not,
            Some(Token::Minus) => UnaryOp::Neg,
            _ => return self.member(),
        };
        self.pos += 1;
        self.enter()?;
        let operand = self.unary()?;
        self.depth -= 1;
        Ok(match (op, operand) {
            (UnaryOp::Neg, Expr::Lit(Value::Number(n))) if n.is_i64() => Expr::Lit(Value::from(-n.as_i64().unwrap_or(0))),
            (op, operand) => Expr::Unary(op, Box::new(operand)),
        })
    }

    fn member(&mut self) -> Result<Expr, String> {
        let mut expr = self.primary()?;
        let mut folds = 0;
        loop {
            if self.eat(&Token::Dot) {
                self.fold(&mut folds)?;
                let name = self.ident()?;
                if self.eat(&Token::LParen) {
                    expr = self.method(expr, name)?;
                } else {
                    expr = Expr::Select(Box::new(expr), name);
                }
            } else if self.eat(&Token::LBracket) {
                self.fold(&mut folds)?;
                let index = self.expr()?;
                self.expect(Token::RBracket)?;
                expr = Expr::Index(Box::new(expr), Box::new(index));
            } else {
                self.depth -= folds;
                return Ok(expr);
            }
        }
    }

    fn method(&mut self, target: Expr, name: String) -> Result<Expr, String> {
        let quantifier = match name.as_str() {
            "exists" => Some(Quantifier::Exists),
            "all" => Some(Quantifier::All),
            _ => None,
        };
        if let Some(quantifier) = quantifier {
            let var = self.ident()?;
            self.expect(Token::Comma)?;
            let predicate = self.expr()?;
            self.expect(Token::RParen)?;
            return Ok(Expr::Comprehension { quantifier, range: Box::new(target), var, predicate: Box::new(predicate) });
        }
        let args = self.args()?;
        Ok(Expr::Method(Box::new(target), name, args))
    }

    /// Arguments after an opening parenthesis, through the closing one.
    fn args(&mut self) -> Result<Vec<Expr>, String> {
        let mut args = Vec::new();
        if self.eat(&Token::RParen) {
            return Ok(args);
        }
        loop {
            args.push(self.expr()?);
            if self.eat(&Token::RParen) {
                return Ok(args);
            }
            self.expect(Token::Comma)?;
        }
    }

    fn ident(&mut self) -> Result<String, String> {
        match self.peek().cloned() {
            Some(Token::Ident(name)) => {
                self.pos += 1;
                Ok(name)
            }
            Some(tok) => Err(format!("expected identifier but found {} at offset {}", tok, self.offset())),
            None => Err("expected identifier but reached end of input".to_string()),
        }
    }

    fn primary(&mut self) -> Result<Expr, String> {
        let at = self.offset();
        let Some(tok) = self.peek().cloned() else {
            return Err("unexpected end of input".to_string());
        };
        self.pos += 1;
        match tok {
            Token::Int(n) => Ok(Expr::Lit(Value::from(n))),
            Token::Float(f) => Ok(Expr::Lit(Value::from(f))),
            Token::Str(s) => Ok(Expr::Lit(Value::String(s))),
            Token::True => Ok(Expr::Lit(Value::Bool(true))),
            Token::False => Ok(Expr::Lit(Value::Bool(false))),
            Token::Null => Ok(Expr::Lit(Value::Null)),
            Token::LParen => {
                let inner = self.expr()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Token::LBracket => {
                self.enter()?;
                let mut items = Vec::new();
                if !self.eat(&Token::RBracket) {
                    loop {
                        items.push(self.expr()?);
                        if self.eat(&Token::RBracket) {
                            break;
                        }
                        self.expect(Token::Comma)?;
                    }
                }
                self.depth -= 1;
                Ok(Expr::List(items))
            }
            Token::Ident(name) if name == "has" => {
                self.expect(Token::LParen)?;
                let arg = self.expr()?;
                self.expect(Token::RParen)?;
                match arg {
                    Expr::Select(operand, field) => Ok(Expr::Has(operand, field)),
                    _ => Err(format!("has() at offset {} requires a field selection like has(object.status)", at)),
                }
            }
            Token::Ident(name) => {
                if self.eat(&Token::LParen) {
                    let args = self.args()?;
                    Ok(Expr::Call(name, args))
                } else {
                    Ok(Expr::Ident(name))
                }
            }
            other => Err(format!("unexpected {} at offset {}", other, at)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::tokenize;

    fn parse(src: &str) -> Result<Expr, String> {
        Parser::new(tokenize(src)?, src.len(), 32).parse()
    }

    #[test]
    fn precedence() {
        let e = parse("a || b && c == 1 + 2 * 3").unwrap();
        let Expr::Or(_, rhs) = e else { panic!("expected or at top") };
        let Expr::And(_, rhs) = *rhs else { panic!("expected and") };
        let Expr::Binary(BinaryOp::Eq, _, rhs) = *rhs else { panic!("expected ==") };
        assert!(matches!(*rhs, Expr::Binary(BinaryOp::Add, _, _)));
    }

    #[test]
    fn has_and_comprehensions() {
        assert!(matches!(parse("has(object.status)").unwrap(), Expr::Has(_, f) if f == "status"));
        assert!(parse("has(object)").is_err());
        let e = parse("object.spec.items.exists(i, i.ready)").unwrap();
        assert!(matches!(e, Expr::Comprehension { quantifier: Quantifier::Exists, .. }));
        assert!(matches!(parse("-3").unwrap(), Expr::Lit(v) if v == serde_json::json!(-3)));
    }

    #[test]
    fn syntax_errors_and_depth() {
        assert!(parse("a &&").is_err());
        assert!(parse("(a").is_err());
        assert!(parse("a b").is_err());
        let deep = format!("{}1{}", "(".repeat(40), ")".repeat(40));
        assert!(parse(&deep).unwrap_err().contains("deeper"));
    }

    #[test]
    fn operator_chains_count_towards_depth() {
        assert!(parse(&format!("1{} == 0", " + 1".repeat(20))).is_ok());
        for long in [
            format!("1{} == 0", "+1".repeat(40)),
            format!("a{}", " && a".repeat(40)),
            format!("a{}", " || a".repeat(40)),
            format!("2{}", "*2".repeat(40)),
            format!("object{}", ".x".repeat(40)),
            format!("object{}", "[0]".repeat(40)),
        ] {
            let err = parse(&long).unwrap_err();
            assert!(err.contains("deeper"), "{long}: {err}");
        }
    }
}
