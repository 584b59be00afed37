//! Recursive-descent parser for the field path language
//!
//! Grammar:
//!
//! ```text
//! path     := '$' segment*
//! segment  := '.' ident | '.' '*' | '[' bracket ']'
//! bracket  := quoted | integer | '*' | slice | '?(' predicate ')'
//! slice    := integer? ':' integer? (':' integer)?
//! predicate:= '@' ('.' ident)+ (op literal)?
//! op       := '==' | '!=' | '<=' | '>=' | '<' | '>'
//! literal  := quoted | number | 'true' | 'false' | 'null'
//! ```

use super::{CmpOp, Literal, PathError, PathExpr, Predicate, Segment};

struct Parser<'a> {
    raw: &'a str,
    chars: Vec<char>,
    pos: usize,
}

/// Parse and validate a single path expression
pub(crate) fn parse_path(raw: &str) -> Result<PathExpr, PathError> {
    let mut parser = Parser {
        raw,
        chars: raw.chars().collect(),
        pos: 0,
    };
    let segments = parser.parse()?;
    Ok(PathExpr {
        raw: raw.to_string(),
        segments,
    })
}

impl<'a> Parser<'a> {
    fn error(&self, message: impl Into<String>) -> PathError {
        PathError {
            path: self.raw.to_string(),
            message: message.into(),
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += 1;
        Some(c)
    }

    fn eat(&mut self, expected: char) -> Result<(), PathError> {
        match self.bump() {
            Some(c) if c == expected => Ok(()),
            Some(c) => Err(self.error(format!("expected {expected:?}, found {c:?}"))),
            None => Err(self.error(format!("expected {expected:?}, found end of input"))),
        }
    }

    fn parse(&mut self) -> Result<Vec<Segment>, PathError> {
        if self.raw.is_empty() {
            return Err(self.error("empty path"));
        }
        self.eat('$')
            .map_err(|_| self.error("path must start with '$'"))?;

        let mut segments = Vec::new();
        while let Some(c) = self.peek() {
            match c {
                '.' => {
                    self.bump();
                    segments.push(self.parse_dot_segment()?);
                }
                '[' => {
                    self.bump();
                    segments.push(self.parse_bracket_segment()?);
                }
                other => {
                    return Err(self.error(format!("unexpected character {other:?}")));
                }
            }
        }

        if segments.is_empty() {
            return Err(self.error("path selects the whole document"));
        }

        Ok(segments)
    }

    fn parse_dot_segment(&mut self) -> Result<Segment, PathError> {
        if self.peek() == Some('*') {
            self.bump();
            return Ok(Segment::Wildcard);
        }
        let name = self.parse_ident()?;
        Ok(Segment::Child(name))
    }

    fn parse_ident(&mut self) -> Result<String, PathError> {
        let mut name = String::new();
        while let Some(c) = self.peek() {
            if c.is_alphanumeric() || c == '_' || c == '-' {
                name.push(c);
                self.bump();
            } else {
                break;
            }
        }
        if name.is_empty() {
            return Err(self.error("expected field name after '.'"));
        }
        Ok(name)
    }

    fn parse_bracket_segment(&mut self) -> Result<Segment, PathError> {
        let segment = match self.peek() {
            Some('\'') | Some('"') => {
                let name = self.parse_quoted()?;
                Segment::Child(name)
            }
            Some('*') => {
                self.bump();
                Segment::Wildcard
            }
            Some('?') => {
                self.bump();
                self.eat('(')?;
                let predicate = self.parse_predicate()?;
                self.eat(')')?;
                Segment::Filter(predicate)
            }
            Some(c) if c == '-' || c == ':' || c.is_ascii_digit() => self.parse_index_or_slice()?,
            Some(c) => return Err(self.error(format!("unexpected {c:?} in brackets"))),
            None => return Err(self.error("unterminated '['")),
        };
        self.eat(']')?;
        Ok(segment)
    }

    fn parse_quoted(&mut self) -> Result<String, PathError> {
        let quote = self.bump().expect("caller checked quote char");
        let mut name = String::new();
        loop {
            match self.bump() {
                Some(c) if c == quote => return Ok(name),
                Some('\\') => match self.bump() {
                    Some(escaped) => name.push(escaped),
                    None => return Err(self.error("unterminated escape in quoted name")),
                },
                Some(c) => name.push(c),
                None => return Err(self.error("unterminated quoted name")),
            }
        }
    }

    fn parse_integer(&mut self) -> Result<i64, PathError> {
        let mut text = String::new();
        if self.peek() == Some('-') {
            text.push('-');
            self.bump();
        }
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() {
                text.push(c);
                self.bump();
            } else {
                break;
            }
        }
        text.parse::<i64>()
            .map_err(|_| self.error(format!("invalid integer {text:?}")))
    }

    fn parse_index_or_slice(&mut self) -> Result<Segment, PathError> {
        let start = if self.peek() == Some(':') {
            None
        } else {
            Some(self.parse_integer()?)
        };

        if self.peek() != Some(':') {
            let idx = start.ok_or_else(|| self.error("expected index"))?;
            return Ok(Segment::Index(idx));
        }
        self.bump(); // first ':'

        let end = match self.peek() {
            Some(c) if c == '-' || c.is_ascii_digit() => Some(self.parse_integer()?),
            _ => None,
        };

        let step = if self.peek() == Some(':') {
            self.bump();
            match self.peek() {
                Some(c) if c == '-' || c.is_ascii_digit() => self.parse_integer()?,
                _ => 1,
            }
        } else {
            1
        };

        if step <= 0 {
            return Err(self.error("slice step must be positive"));
        }

        Ok(Segment::Slice { start, end, step })
    }

    fn parse_predicate(&mut self) -> Result<Predicate, PathError> {
        self.skip_spaces();
        self.eat('@')
            .map_err(|_| self.error("predicate must start with '@'"))?;

        let mut keys = Vec::new();
        while self.peek() == Some('.') {
            self.bump();
            keys.push(self.parse_ident()?);
        }
        if keys.is_empty() {
            return Err(self.error("predicate must reference a field, e.g. '@.status'"));
        }

        self.skip_spaces();
        let cmp = match self.peek() {
            Some(')') | None => None,
            _ => {
                let op = self.parse_operator()?;
                self.skip_spaces();
                let literal = self.parse_literal()?;
                self.skip_spaces();
                Some((op, literal))
            }
        };

        Ok(Predicate { keys, cmp })
    }

    fn parse_operator(&mut self) -> Result<CmpOp, PathError> {
        let first = self
            .bump()
            .ok_or_else(|| self.error("expected comparison operator"))?;
        match (first, self.peek()) {
            ('=', Some('=')) => {
                self.bump();
                Ok(CmpOp::Eq)
            }
            ('!', Some('=')) => {
                self.bump();
                Ok(CmpOp::Ne)
            }
            ('<', Some('=')) => {
                self.bump();
                Ok(CmpOp::Le)
            }
            ('>', Some('=')) => {
                self.bump();
                Ok(CmpOp::Ge)
            }
            ('<', _) => Ok(CmpOp::Lt),
            ('>', _) => Ok(CmpOp::Gt),
            (c, _) => Err(self.error(format!("invalid operator starting with {c:?}"))),
        }
    }

    fn parse_literal(&mut self) -> Result<Literal, PathError> {
        match self.peek() {
            Some('\'') | Some('"') => Ok(Literal::Str(self.parse_quoted()?)),
            Some(c) if c == '-' || c.is_ascii_digit() => {
                let mut text = String::new();
                if self.peek() == Some('-') {
                    text.push('-');
                    self.bump();
                }
                while let Some(c) = self.peek() {
                    if c.is_ascii_digit() || c == '.' {
                        text.push(c);
                        self.bump();
                    } else {
                        break;
                    }
                }
                text.parse::<f64>()
                    .map(Literal::Num)
                    .map_err(|_| self.error(format!("invalid number {text:?}")))
            }
            _ => {
                let mut word = String::new();
                while let Some(c) = self.peek() {
                    if c.is_alphabetic() {
                        word.push(c);
                        self.bump();
                    } else {
                        break;
                    }
                }
                match word.as_str() {
                    "true" => Ok(Literal::Bool(true)),
                    "false" => Ok(Literal::Bool(false)),
                    "null" => Ok(Literal::Null),
                    _ => Err(self.error(format!("invalid literal {word:?}"))),
                }
            }
        }
    }

    fn skip_spaces(&mut self) {
        while self.peek() == Some(' ') {
            self.bump();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_child_chain() {
        let expr = parse_path("$.spec.template.metadata").unwrap();
        assert_eq!(
            expr.segments,
            vec![
                Segment::Child("spec".into()),
                Segment::Child("template".into()),
                Segment::Child("metadata".into()),
            ]
        );
    }

    #[test]
    fn test_parse_quoted_child() {
        let expr = parse_path("$.metadata.labels['app.kubernetes.io/name']").unwrap();
        assert_eq!(
            expr.segments.last(),
            Some(&Segment::Child("app.kubernetes.io/name".into()))
        );

        let expr = parse_path(r#"$["with \"escape\""]"#).unwrap();
        assert_eq!(
            expr.segments,
            vec![Segment::Child("with \"escape\"".into())]
        );
    }

    #[test]
    fn test_parse_index_and_wildcard() {
        let expr = parse_path("$.items[3]").unwrap();
        assert_eq!(expr.segments[1], Segment::Index(3));

        let expr = parse_path("$.items[-1]").unwrap();
        assert_eq!(expr.segments[1], Segment::Index(-1));

        let expr = parse_path("$.items[*]").unwrap();
        assert_eq!(expr.segments[1], Segment::Wildcard);

        let expr = parse_path("$.items.*").unwrap();
        assert_eq!(expr.segments[1], Segment::Wildcard);
    }

    #[test]
    fn test_parse_slices() {
        let expr = parse_path("$.items[1:3]").unwrap();
        assert_eq!(
            expr.segments[1],
            Segment::Slice {
                start: Some(1),
                end: Some(3),
                step: 1
            }
        );

        let expr = parse_path("$.items[::2]").unwrap();
        assert_eq!(
            expr.segments[1],
            Segment::Slice {
                start: None,
                end: None,
                step: 2
            }
        );

        let expr = parse_path("$.items[2:]").unwrap();
        assert_eq!(
            expr.segments[1],
            Segment::Slice {
                start: Some(2),
                end: None,
                step: 1
            }
        );
    }

    #[test]
    fn test_parse_predicates() {
        let expr = parse_path("$.items[?(@.status == 'active')]").unwrap();
        match &expr.segments[1] {
            Segment::Filter(p) => {
                assert_eq!(p.keys, vec!["status"]);
                assert_eq!(p.cmp, Some((CmpOp::Eq, Literal::Str("active".into()))));
            }
            other => panic!("expected filter, got {other:?}"),
        }

        let expr = parse_path("$.items[?(@.spec.replicas >= 3)]").unwrap();
        match &expr.segments[1] {
            Segment::Filter(p) => {
                assert_eq!(p.keys, vec!["spec", "replicas"]);
                assert_eq!(p.cmp, Some((CmpOp::Ge, Literal::Num(3.0))));
            }
            other => panic!("expected filter, got {other:?}"),
        }

        let expr = parse_path("$.items[?(@.deleted)]").unwrap();
        match &expr.segments[1] {
            Segment::Filter(p) => assert_eq!(p.cmp, None),
            other => panic!("expected filter, got {other:?}"),
        }
    }

    #[test]
    fn test_reject_bad_syntax() {
        for bad in [
            "",
            "$",
            "x.y",
            "$..",
            "$.a.",
            "$[",
            "$[]",
            "$['a'",
            "$[1:2:0]",
            "$[?(a == 1)]",
            "$[?(@)]",
            "$.a b",
        ] {
            assert!(parse_path(bad).is_err(), "expected {bad:?} to fail");
        }
    }
}
