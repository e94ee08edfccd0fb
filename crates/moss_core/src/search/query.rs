//! Search query grammar.
//!
//! Supported input: bare terms (implicit AND), `"quoted phrases"`, a single
//! trailing `*` prefix wildcard on a term or phrase, uppercase `AND`, `OR`,
//! `NOT` (binary), and parentheses.
//!
//! Parsed queries are re-emitted with every term quoted, so user text never
//! reaches FTS5 as raw syntax.

use std::error::Error;
use std::fmt::{Display, Formatter};

/// Grammar violation in a user query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryError {
    Empty,
    UnterminatedQuote,
    UnbalancedParens,
    /// Operator without an operand on one side.
    BareOperator(&'static str),
    /// `*` with no term to apply to.
    BareWildcard,
    /// `*` anywhere but the end of a term.
    MisplacedWildcard(String),
    EmptyPhrase,
}

impl Display for QueryError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Empty => write!(f, "query has no searchable terms"),
            Self::UnterminatedQuote => write!(f, "unterminated quote"),
            Self::UnbalancedParens => write!(f, "unbalanced parentheses"),
            Self::BareOperator(op) => write!(f, "operator `{op}` is missing an operand"),
            Self::BareWildcard => write!(f, "wildcard `*` must follow a term"),
            Self::MisplacedWildcard(term) => {
                write!(f, "wildcard `*` is only allowed at the end of `{term}`")
            }
            Self::EmptyPhrase => write!(f, "quoted phrase is empty"),
        }
    }
}

impl Error for QueryError {}

/// Parsed query tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryNode {
    Term { text: String, prefix: bool },
    Phrase { text: String, prefix: bool },
    And(Box<QueryNode>, Box<QueryNode>),
    Or(Box<QueryNode>, Box<QueryNode>),
    Not(Box<QueryNode>, Box<QueryNode>),
}

impl QueryNode {
    /// Renders an FTS5 MATCH expression.
    pub fn to_fts(&self) -> String {
        match self {
            Self::Term { text, prefix } | Self::Phrase { text, prefix } => {
                let quoted = format!("\"{}\"", text.replace('"', "\"\""));
                if *prefix {
                    format!("{quoted}*")
                } else {
                    quoted
                }
            }
            Self::And(left, right) => format!("({} AND {})", left.to_fts(), right.to_fts()),
            Self::Or(left, right) => format!("({} OR {})", left.to_fts(), right.to_fts()),
            Self::Not(left, right) => format!("({} NOT {})", left.to_fts(), right.to_fts()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Word { text: String, prefix: bool },
    Phrase { text: String, prefix: bool },
    And,
    Or,
    Not,
    LParen,
    RParen,
}

impl Token {
    fn starts_operand(&self) -> bool {
        matches!(self, Self::Word { .. } | Self::Phrase { .. } | Self::LParen)
    }
}

/// Parses user query text.
pub fn parse_query(input: &str) -> Result<QueryNode, QueryError> {
    let tokens = tokenize(input)?;
    if tokens.is_empty() {
        return Err(QueryError::Empty);
    }
    let mut parser = Parser {
        tokens,
        position: 0,
    };
    let node = parser.parse_or()?;
    if parser.peek().is_some() {
        // Only a stray `)` can stop the top-level parse early.
        return Err(QueryError::UnbalancedParens);
    }
    Ok(node)
}

/// Parses user query text straight into an FTS5 expression.
pub fn build_match_expression(input: &str) -> Result<String, QueryError> {
    parse_query(input).map(|node| node.to_fts())
}

fn tokenize(input: &str) -> Result<Vec<Token>, QueryError> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&current) = chars.peek() {
        if current.is_whitespace() {
            chars.next();
            continue;
        }
        match current {
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            '"' => {
                chars.next();
                let mut text = String::new();
                let mut closed = false;
                for next in chars.by_ref() {
                    if next == '"' {
                        closed = true;
                        break;
                    }
                    text.push(next);
                }
                if !closed {
                    return Err(QueryError::UnterminatedQuote);
                }
                let prefix = chars.next_if_eq(&'*').is_some();
                if !text.chars().any(char::is_alphanumeric) {
                    return Err(QueryError::EmptyPhrase);
                }
                tokens.push(Token::Phrase {
                    text: text.trim().to_string(),
                    prefix,
                });
            }
            _ => {
                let mut word = String::new();
                while let Some(&next) = chars.peek() {
                    if next.is_whitespace() || matches!(next, '(' | ')' | '"') {
                        break;
                    }
                    word.push(next);
                    chars.next();
                }
                if let Some(token) = classify_word(word)? {
                    tokens.push(token);
                }
            }
        }
    }

    Ok(tokens)
}

fn classify_word(word: String) -> Result<Option<Token>, QueryError> {
    match word.as_str() {
        "AND" => return Ok(Some(Token::And)),
        "OR" => return Ok(Some(Token::Or)),
        "NOT" => return Ok(Some(Token::Not)),
        _ => {}
    }

    let (stem, prefix) = match word.strip_suffix('*') {
        Some(stem) => (stem, true),
        None => (word.as_str(), false),
    };
    if prefix && stem.is_empty() {
        return Err(QueryError::BareWildcard);
    }
    if stem.contains('*') {
        return Err(QueryError::MisplacedWildcard(word.clone()));
    }
    if !stem.chars().any(char::is_alphanumeric) {
        if prefix {
            return Err(QueryError::BareWildcard);
        }
        // Punctuation-only words tokenize to nothing; treat as separators.
        return Ok(None);
    }
    Ok(Some(Token::Word {
        text: stem.to_string(),
        prefix,
    }))
}

struct Parser {
    tokens: Vec<Token>,
    position: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.position)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.position).cloned();
        if token.is_some() {
            self.position += 1;
        }
        token
    }

    fn parse_or(&mut self) -> Result<QueryNode, QueryError> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.advance();
            let right = self.operand_after("OR", Self::parse_and)?;
            left = QueryNode::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<QueryNode, QueryError> {
        let mut left = self.parse_not()?;
        loop {
            let right = match self.peek() {
                Some(Token::And) => {
                    self.advance();
                    self.operand_after("AND", Self::parse_not)?
                }
                Some(token) if token.starts_operand() => self.parse_not()?,
                _ => break,
            };
            left = QueryNode::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<QueryNode, QueryError> {
        let mut left = self.parse_primary()?;
        while self.peek() == Some(&Token::Not) {
            self.advance();
            let right = self.operand_after("NOT", Self::parse_primary)?;
            left = QueryNode::Not(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn operand_after(
        &mut self,
        operator: &'static str,
        parse: fn(&mut Self) -> Result<QueryNode, QueryError>,
    ) -> Result<QueryNode, QueryError> {
        match self.peek() {
            Some(token) if token.starts_operand() => parse(self),
            _ => Err(QueryError::BareOperator(operator)),
        }
    }

    fn parse_primary(&mut self) -> Result<QueryNode, QueryError> {
        match self.advance() {
            Some(Token::Word { text, prefix }) => Ok(QueryNode::Term { text, prefix }),
            Some(Token::Phrase { text, prefix }) => Ok(QueryNode::Phrase { text, prefix }),
            Some(Token::LParen) => {
                if self.peek() == Some(&Token::RParen) {
                    return Err(QueryError::UnbalancedParens);
                }
                let inner = self.parse_or()?;
                match self.advance() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(QueryError::UnbalancedParens),
                }
            }
            Some(Token::RParen) => Err(QueryError::UnbalancedParens),
            Some(Token::And) => Err(QueryError::BareOperator("AND")),
            Some(Token::Or) => Err(QueryError::BareOperator("OR")),
            Some(Token::Not) => Err(QueryError::BareOperator("NOT")),
            None => Err(QueryError::Empty),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{build_match_expression, parse_query, QueryError};

    #[test]
    fn bare_terms_are_implicit_and() {
        assert_eq!(
            build_match_expression("redis cache").unwrap(),
            "(\"redis\" AND \"cache\")"
        );
    }

    #[test]
    fn phrases_prefixes_and_operators_render_quoted() {
        assert_eq!(
            build_match_expression("\"error budget\" OR auth* NOT legacy").unwrap(),
            "(\"error budget\" OR (\"auth\"* NOT \"legacy\"))"
        );
        assert_eq!(
            build_match_expression("(a OR b) c").unwrap(),
            "((\"a\" OR \"b\") AND \"c\")"
        );
    }

    #[test]
    fn syntax_characters_inside_terms_are_neutralized() {
        assert_eq!(build_match_expression("a:b").unwrap(), "\"a:b\"");
        assert_eq!(build_match_expression("x - y").unwrap(), "(\"x\" AND \"y\")");
    }

    #[test]
    fn lowercase_operators_are_terms() {
        assert_eq!(
            build_match_expression("cats and dogs").unwrap(),
            "((\"cats\" AND \"and\") AND \"dogs\")"
        );
    }

    #[test]
    fn malformed_queries_are_rejected() {
        assert_eq!(parse_query("\"open"), Err(QueryError::UnterminatedQuote));
        assert_eq!(parse_query("(a OR b"), Err(QueryError::UnbalancedParens));
        assert_eq!(parse_query("a)"), Err(QueryError::UnbalancedParens));
        assert_eq!(parse_query("()"), Err(QueryError::UnbalancedParens));
        assert_eq!(parse_query("AND"), Err(QueryError::BareOperator("AND")));
        assert_eq!(parse_query("a OR"), Err(QueryError::BareOperator("OR")));
        assert_eq!(parse_query("NOT a"), Err(QueryError::BareOperator("NOT")));
        assert_eq!(parse_query("a AND OR b"), Err(QueryError::BareOperator("AND")));
        assert_eq!(parse_query("*"), Err(QueryError::BareWildcard));
        assert_eq!(parse_query("a *"), Err(QueryError::BareWildcard));
        assert!(matches!(
            parse_query("a*b*"),
            Err(QueryError::MisplacedWildcard(_))
        ));
        assert_eq!(parse_query("   "), Err(QueryError::Empty));
        assert_eq!(parse_query("\"  \""), Err(QueryError::EmptyPhrase));
    }
}
