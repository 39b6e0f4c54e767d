use super::{BinOp, Expr, UnaryOp};
use crate::TemplateError;

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Num(f64),
    Str(String),
    Ident(String),
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Dot,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Not,
    Lt,
    Gt,
    Le,
    Ge,
    EqEq,
    NotEq,
    AndAnd,
    OrOr,
    Question,
    Colon,
}

fn lex(src: &str) -> Result<Vec<Tok>, TemplateError> {
    let mut toks = Vec::new();
    let bytes: Vec<char> = src.chars().collect();
    let mut i = 0;

    let err = |msg: String| TemplateError::Parse(msg);

    while i < bytes.len() {
        let c = bytes[i];
        match c {
            ' ' | '\t' | '\r' | '\n' => i += 1,
            '(' => {
                toks.push(Tok::LParen);
                i += 1;
            }
            ')' => {
                toks.push(Tok::RParen);
                i += 1;
            }
            '[' => {
                toks.push(Tok::LBracket);
                i += 1;
            }
            ']' => {
                toks.push(Tok::RBracket);
                i += 1;
            }
            ',' => {
                toks.push(Tok::Comma);
                i += 1;
            }
            '.' => {
                toks.push(Tok::Dot);
                i += 1;
            }
            '+' => {
                toks.push(Tok::Plus);
                i += 1;
            }
            '-' => {
                toks.push(Tok::Minus);
                i += 1;
            }
            '*' => {
                toks.push(Tok::Star);
                i += 1;
            }
            '/' => {
                toks.push(Tok::Slash);
                i += 1;
            }
            '%' => {
                toks.push(Tok::Percent);
                i += 1;
            }
            '?' => {
                toks.push(Tok::Question);
                i += 1;
            }
            ':' => {
                toks.push(Tok::Colon);
                i += 1;
            }
            '!' => {
                if bytes.get(i + 1) == Some(&'=') {
                    toks.push(Tok::NotEq);
                    i += 2;
                } else {
                    toks.push(Tok::Not);
                    i += 1;
                }
            }
            '<' => {
                if bytes.get(i + 1) == Some(&'=') {
                    toks.push(Tok::Le);
                    i += 2;
                } else {
                    toks.push(Tok::Lt);
                    i += 1;
                }
            }
            '>' => {
                if bytes.get(i + 1) == Some(&'=') {
                    toks.push(Tok::Ge);
                    i += 2;
                } else {
                    toks.push(Tok::Gt);
                    i += 1;
                }
            }
            '=' => {
                if bytes.get(i + 1) == Some(&'=') {
                    toks.push(Tok::EqEq);
                    i += 2;
                } else {
                    return Err(err("assignment is not supported".to_string()));
                }
            }
            '&' => {
                if bytes.get(i + 1) == Some(&'&') {
                    toks.push(Tok::AndAnd);
                    i += 2;
                } else {
                    return Err(err("unexpected '&'".to_string()));
                }
            }
            '|' => {
                if bytes.get(i + 1) == Some(&'|') {
                    toks.push(Tok::OrOr);
                    i += 2;
                } else {
                    return Err(err("unexpected '|'".to_string()));
                }
            }
            '\'' | '"' => {
                let quote = c;
                i += 1;
                let mut s = String::new();
                loop {
                    match bytes.get(i) {
                        None => return Err(err("unterminated string".to_string())),
                        Some(&ch) if ch == quote => {
                            i += 1;
                            break;
                        }
                        Some('\\') => {
                            let escaped = bytes
                                .get(i + 1)
                                .ok_or_else(|| err("dangling escape".to_string()))?;
                            s.push(match escaped {
                                'n' => '\n',
                                't' => '\t',
                                'r' => '\r',
                                other => *other,
                            });
                            i += 2;
                        }
                        Some(&ch) => {
                            s.push(ch);
                            i += 1;
                        }
                    }
                }
                toks.push(Tok::Str(s));
            }
            '0'..='9' => {
                let start = i;
                while i < bytes.len() && (bytes[i].is_ascii_digit() || bytes[i] == '.') {
                    // a dot followed by a non-digit is member access, not a decimal point
                    if bytes[i] == '.' && !bytes.get(i + 1).is_some_and(char::is_ascii_digit) {
                        break;
                    }
                    i += 1;
                }
                let text: String = bytes[start..i].iter().collect();
                let n = text
                    .parse::<f64>()
                    .map_err(|_| err(format!("bad number '{text}'")))?;
                toks.push(Tok::Num(n));
            }
            c if c.is_ascii_alphabetic() || c == '_' || c == '$' => {
                let start = i;
                while i < bytes.len()
                    && (bytes[i].is_ascii_alphanumeric() || bytes[i] == '_' || bytes[i] == '$')
                {
                    i += 1;
                }
                let text: String = bytes[start..i].iter().collect();
                toks.push(Tok::Ident(text));
            }
            other => return Err(err(format!("unexpected character '{other}'"))),
        }
    }
    Ok(toks)
}

/// Recursive-descent parser. Precedence, loosest first:
/// ternary, `||`, `&&`, equality, comparison, additive, multiplicative,
/// unary, postfix (call / member / index).
struct Parser {
    toks: Vec<Tok>,
    pos: usize,
}

pub(crate) fn parse(src: &str) -> Result<Expr, TemplateError> {
    let toks = lex(src)?;
    let mut p = Parser { toks, pos: 0 };
    let expr = p.ternary()?;
    if p.pos != p.toks.len() {
        return Err(TemplateError::Parse(format!(
            "trailing input at token {}",
            p.pos
        )));
    }
    Ok(expr)
}

impl Parser {
    fn peek(&self) -> Option<&Tok> {
        self.toks.get(self.pos)
    }

    fn bump(&mut self) -> Option<Tok> {
        let t = self.toks.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn expect(&mut self, tok: &Tok, what: &str) -> Result<(), TemplateError> {
        if self.peek() == Some(tok) {
            self.pos += 1;
            Ok(())
        } else {
            Err(TemplateError::Parse(format!("expected {what}")))
        }
    }

    fn ternary(&mut self) -> Result<Expr, TemplateError> {
        let cond = self.or()?;
        if self.peek() == Some(&Tok::Question) {
            self.pos += 1;
            let then = self.ternary()?;
            self.expect(&Tok::Colon, "':' in ternary")?;
            let alt = self.ternary()?;
            return Ok(Expr::Ternary(Box::new(cond), Box::new(then), Box::new(alt)));
        }
        Ok(cond)
    }

    fn or(&mut self) -> Result<Expr, TemplateError> {
        let mut lhs = self.and()?;
        while self.peek() == Some(&Tok::OrOr) {
            self.pos += 1;
            let rhs = self.and()?;
            lhs = Expr::Binary(BinOp::Or, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn and(&mut self) -> Result<Expr, TemplateError> {
        let mut lhs = self.equality()?;
        while self.peek() == Some(&Tok::AndAnd) {
            self.pos += 1;
            let rhs = self.equality()?;
            lhs = Expr::Binary(BinOp::And, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn equality(&mut self) -> Result<Expr, TemplateError> {
        let mut lhs = self.comparison()?;
        loop {
            let op = match self.peek() {
                Some(Tok::EqEq) => BinOp::Eq,
                Some(Tok::NotEq) => BinOp::Ne,
                _ => break,
            };
            self.pos += 1;
            let rhs = self.comparison()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn comparison(&mut self) -> Result<Expr, TemplateError> {
        let mut lhs = self.additive()?;
        loop {
            let op = match self.peek() {
                Some(Tok::Lt) => BinOp::Lt,
                Some(Tok::Le) => BinOp::Le,
                Some(Tok::Gt) => BinOp::Gt,
                Some(Tok::Ge) => BinOp::Ge,
                _ => break,
            };
            self.pos += 1;
            let rhs = self.additive()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn additive(&mut self) -> Result<Expr, TemplateError> {
        let mut lhs = self.multiplicative()?;
        loop {
            let op = match self.peek() {
                Some(Tok::Plus) => BinOp::Add,
                Some(Tok::Minus) => BinOp::Sub,
                _ => break,
            };
            self.pos += 1;
            let rhs = self.multiplicative()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn multiplicative(&mut self) -> Result<Expr, TemplateError> {
        let mut lhs = self.unary()?;
        loop {
            let op = match self.peek() {
                Some(Tok::Star) => BinOp::Mul,
                Some(Tok::Slash) => BinOp::Div,
                Some(Tok::Percent) => BinOp::Rem,
                _ => break,
            };
            self.pos += 1;
            let rhs = self.unary()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Expr, TemplateError> {
        match self.peek() {
            Some(Tok::Not) => {
                self.pos += 1;
                Ok(Expr::Unary(UnaryOp::Not, Box::new(self.unary()?)))
            }
            Some(Tok::Minus) => {
                self.pos += 1;
                Ok(Expr::Unary(UnaryOp::Neg, Box::new(self.unary()?)))
            }
            _ => self.postfix(),
        }
    }

    fn postfix(&mut self) -> Result<Expr, TemplateError> {
        let mut expr = self.primary()?;
        loop {
            match self.peek() {
                Some(Tok::Dot) => {
                    self.pos += 1;
                    let Some(Tok::Ident(name)) = self.bump() else {
                        return Err(TemplateError::Parse("expected member name".to_string()));
                    };
                    expr = Expr::Member(Box::new(expr), name);
                }
                Some(Tok::LBracket) => {
                    self.pos += 1;
                    let idx = self.ternary()?;
                    self.expect(&Tok::RBracket, "']'")?;
                    expr = Expr::Index(Box::new(expr), Box::new(idx));
                }
                Some(Tok::LParen) => {
                    self.pos += 1;
                    let mut args = Vec::new();
                    if self.peek() != Some(&Tok::RParen) {
                        loop {
                            args.push(self.ternary()?);
                            if self.peek() == Some(&Tok::Comma) {
                                self.pos += 1;
                            } else {
                                break;
                            }
                        }
                    }
                    self.expect(&Tok::RParen, "')'")?;
                    expr = Expr::Call(Box::new(expr), args);
                }
                _ => break,
            }
        }
        Ok(expr)
    }

    fn primary(&mut self) -> Result<Expr, TemplateError> {
        match self.bump() {
            Some(Tok::Num(n)) => Ok(Expr::Number(n)),
            Some(Tok::Str(s)) => Ok(Expr::Str(s)),
            Some(Tok::Ident(name)) => match name.as_str() {
                "true" => Ok(Expr::Bool(true)),
                "false" => Ok(Expr::Bool(false)),
                "null" => Ok(Expr::Null),
                _ => Ok(Expr::Ident(name)),
            },
            Some(Tok::LParen) => {
                let inner = self.ternary()?;
                self.expect(&Tok::RParen, "')'")?;
                Ok(inner)
            }
            Some(Tok::LBracket) => {
                let mut items = Vec::new();
                if self.peek() != Some(&Tok::RBracket) {
                    loop {
                        items.push(self.ternary()?);
                        if self.peek() == Some(&Tok::Comma) {
                            self.pos += 1;
                        } else {
                            break;
                        }
                    }
                }
                self.expect(&Tok::RBracket, "']'")?;
                Ok(Expr::Array(items))
            }
            other => Err(TemplateError::Parse(format!(
                "unexpected token {other:?}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_arithmetic_with_precedence() {
        let e = parse("1+2*3").unwrap();
        assert_eq!(
            e,
            Expr::Binary(
                BinOp::Add,
                Box::new(Expr::Number(1.0)),
                Box::new(Expr::Binary(
                    BinOp::Mul,
                    Box::new(Expr::Number(2.0)),
                    Box::new(Expr::Number(3.0)),
                )),
            )
        );
    }

    #[test]
    fn parses_member_index_call_chains() {
        let e = parse("req.headers['x-y']").unwrap();
        assert_eq!(
            e,
            Expr::Index(
                Box::new(Expr::Member(
                    Box::new(Expr::Ident("req".to_string())),
                    "headers".to_string(),
                )),
                Box::new(Expr::Str("x-y".to_string())),
            )
        );
        assert!(matches!(
            parse("faker.name.firstName()").unwrap(),
            Expr::Call(_, _)
        ));
    }

    #[test]
    fn number_followed_by_member_access_lexes() {
        assert!(parse("1.5 + 2").is_ok());
        assert!(matches!(parse("x.y").unwrap(), Expr::Member(_, _)));
    }

    #[test]
    fn rejects_assignment_and_garbage() {
        assert!(parse("a = 1").is_err());
        assert!(parse("1 + ").is_err());
        assert!(parse("@").is_err());
        assert!(parse("'open").is_err());
    }

    #[test]
    fn parses_ternary_right_associative() {
        assert!(matches!(
            parse("a ? 1 : b ? 2 : 3").unwrap(),
            Expr::Ternary(_, _, _)
        ));
    }
}
