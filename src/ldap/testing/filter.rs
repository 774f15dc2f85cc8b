//! Search filter parser used by the in-memory directory.

use thiserror::Error;

/// Parsing error on a search filter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FilterError {
    #[error("filter is empty")]
    Empty,
    #[error("unexpected end of filter")]
    UnexpectedEnd,
    #[error("unexpected character `{found}` at {position}")]
    Unexpected { found: char, position: usize },
    #[error("invalid escape sequence at {0}")]
    InvalidEscape(usize),
    #[error("missing attribute description at {0}")]
    MissingAttribute(usize),
    #[error("trailing characters after filter at {0}")]
    Trailing(usize),
}

/// Parsed search filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
    Equality { attr: String, value: String },
    Present { attr: String },
    Substring {
        attr: String,
        initial: Option<String>,
        any: Vec<String>,
        last: Option<String>,
    },
    GreaterOrEqual { attr: String, value: String },
    LessOrEqual { attr: String, value: String },
    Approx { attr: String, value: String },
    /// `attr:dn:rule:=value`, kept opaque.
    Extensible { attr: String, value: String },
}

impl Filter {
    /// Parse a complete filter string.
    pub fn parse(input: &str) -> Result<Self, FilterError> {
        let input = input.trim();
        if input.is_empty() {
            return Err(FilterError::Empty);
        }

        let mut parser = Parser {
            chars: input.char_indices().collect(),
            pos: 0,
        };
        let filter = parser.filter()?;
        match parser.peek() {
            None => Ok(filter),
            Some((idx, _)) => Err(FilterError::Trailing(idx)),
        }
    }
}

struct Parser {
    chars: Vec<(usize, char)>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<(usize, char)> {
        self.chars.get(self.pos).copied()
    }

    fn next(&mut self) -> Result<(usize, char), FilterError> {
        let c = self.peek().ok_or(FilterError::UnexpectedEnd)?;
        self.pos += 1;
        Ok(c)
    }

    fn expect(&mut self, expected: char) -> Result<(), FilterError> {
        match self.next()? {
            (_, c) if c == expected => Ok(()),
            (position, found) => Err(FilterError::Unexpected { found, position }),
        }
    }

    fn filter(&mut self) -> Result<Filter, FilterError> {
        self.expect('(')?;
        let filter = match self.peek().ok_or(FilterError::UnexpectedEnd)?.1 {
            '&' => {
                self.pos += 1;
                Filter::And(self.list()?)
            },
            '|' => {
                self.pos += 1;
                Filter::Or(self.list()?)
            },
            '!' => {
                self.pos += 1;
                Filter::Not(Box::new(self.filter()?))
            },
            _ => self.item()?,
        };
        self.expect(')')?;
        Ok(filter)
    }

    fn list(&mut self) -> Result<Vec<Filter>, FilterError> {
        let mut filters = Vec::new();
        while let Some((_, '(')) = self.peek() {
            filters.push(self.filter()?);
        }
        if filters.is_empty() {
            let (position, found) = self.peek().ok_or(FilterError::UnexpectedEnd)?;
            return Err(FilterError::Unexpected { found, position });
        }
        Ok(filters)
    }

    fn item(&mut self) -> Result<Filter, FilterError> {
        let start = self.peek().map(|(i, _)| i).unwrap_or_default();
        let mut attr = String::new();
        loop {
            let (position, c) = self.peek().ok_or(FilterError::UnexpectedEnd)?;
            match c {
                '=' | '~' | '>' | '<' => break,
                '(' | ')' | '*' | '\\' => {
                    return Err(FilterError::Unexpected { found: c, position });
                },
                _ => {
                    attr.push(c);
                    self.pos += 1;
                },
            }
        }
        if attr.is_empty() || attr == ":" {
            return Err(FilterError::MissingAttribute(start));
        }

        let (_, op) = self.next()?;
        if op != '=' {
            self.expect('=')?;
        }

        if op == '=' && attr.ends_with(':') {
            attr.pop();
            let value = self.value(false)?.join("*");
            return Ok(Filter::Extensible { attr, value });
        }

        match op {
            '~' => Ok(Filter::Approx { attr, value: self.single_value()? }),
            '>' => Ok(Filter::GreaterOrEqual { attr, value: self.single_value()? }),
            '<' => Ok(Filter::LessOrEqual { attr, value: self.single_value()? }),
            _ => {
                let parts = self.value(true)?;
                Ok(match parts.as_slice() {
                    [value] => Filter::Equality { attr, value: value.clone() },
                    [a, b] if a.is_empty() && b.is_empty() => Filter::Present { attr },
                    _ => Filter::Substring {
                        initial: parts.first().filter(|s| !s.is_empty()).cloned(),
                        any: parts
                            .get(1..parts.len() - 1)
                            .unwrap_or_default()
                            .iter()
                            .filter(|s| !s.is_empty())
                            .cloned()
                            .collect(),
                        last: parts.last().filter(|s| !s.is_empty()).cloned(),
                        attr,
                    },
                })
            },
        }
    }

    fn single_value(&mut self) -> Result<String, FilterError> {
        Ok(self.value(false)?.join("*"))
    }

    /// Read an assertion value, split on unescaped `*` when `substrings` is set.
    fn value(&mut self, substrings: bool) -> Result<Vec<String>, FilterError> {
        let mut parts = vec![Vec::<u8>::new()];
        loop {
            let (position, c) = self.peek().ok_or(FilterError::UnexpectedEnd)?;
            match c {
                ')' => break,
                '(' => return Err(FilterError::Unexpected { found: c, position }),
                '*' if substrings => {
                    parts.push(Vec::new());
                    self.pos += 1;
                },
                '\\' => {
                    self.pos += 1;
                    let hi = self.next().map_err(|_| FilterError::InvalidEscape(position))?.1;
                    let lo = self.next().map_err(|_| FilterError::InvalidEscape(position))?.1;
                    let byte = hi
                        .to_digit(16)
                        .zip(lo.to_digit(16))
                        .map(|(h, l)| (h * 16 + l) as u8)
                        .ok_or(FilterError::InvalidEscape(position))?;
                    if let Some(part) = parts.last_mut() {
                        part.push(byte);
                    }
                },
                _ => {
                    let mut buf = [0u8; 4];
                    if let Some(part) = parts.last_mut() {
                        part.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
                    }
                    self.pos += 1;
                },
            }
        }

        Ok(parts
            .into_iter()
            .map(|p| String::from_utf8_lossy(&p).into_owned())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ldap::filter::build_filter;

    #[test]
    fn test_parse_escaped_value() {
        let filter = build_filter("(uid={0})", &["*)(uid=*"]);
        assert_eq!(
            Filter::parse(&filter).unwrap(),
            Filter::Equality {
                attr: "uid".into(),
                value: "*)(uid=*".into()
            }
        );
    }

    #[test]
    fn test_parse_composite() {
        let filter =
            Filter::parse("(&(objectClass=user)(|(cn=ad*)(!(mail=*))))").unwrap();
        let Filter::And(parts) = filter else {
            panic!("expected an AND filter");
        };
        assert_eq!(parts.len(), 2);
        assert_eq!(
            parts[1],
            Filter::Or(vec![
                Filter::Substring {
                    attr: "cn".into(),
                    initial: Some("ad".into()),
                    any: vec![],
                    last: None,
                },
                Filter::Not(Box::new(Filter::Present { attr: "mail".into() })),
            ])
        );
    }

    #[test]
    fn test_parse_extensible_match() {
        let filter = Filter::parse(
            "(member:1.2.840.113556.1.4.1941:=cn=alice,dc=example,dc=com)",
        )
        .unwrap();
        assert_eq!(
            filter,
            Filter::Extensible {
                attr: "member:1.2.840.113556.1.4.1941".into(),
                value: "cn=alice,dc=example,dc=com".into(),
            }
        );
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert_eq!(Filter::parse(""), Err(FilterError::Empty));
        assert!(Filter::parse("(uid=alice").is_err());
        assert!(Filter::parse("uid=alice").is_err());
        assert!(Filter::parse("(uid=a(b)").is_err());
        assert!(Filter::parse(r"(uid=\zz)").is_err());
        assert!(Filter::parse("(&)").is_err());
        assert!(Filter::parse("(uid=a)(cn=b)").is_err());
    }
}
