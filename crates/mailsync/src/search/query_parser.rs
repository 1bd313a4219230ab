//! Query-string parser for UI search boxes
//!
//! Understands operators like:
//! - `from:john@example.com` - sender filter
//! - `to:team@company.com` - recipient filter
//! - `subject:meeting` - subject filter
//! - `in:inbox` - folder filter
//! - `is:unread`, `is:read`, `is:flagged`, `is:answered` - flag filters
//! - `before:2024/12/01`, `after:2024-01-01` - date filters
//! - `larger:1000`, `smaller:50000` - size filters in bytes
//!
//! The result converts into a [`SearchConditionNode`] so UI strings go
//! through the same compiler as programmatic searches.

use chrono::{DateTime, NaiveDate, TimeZone, Utc};

use super::condition::{Attribute, SearchConditionNode, SearchField};

const OPERATORS: [&str; 9] = [
    "from", "to", "subject", "in", "is", "before", "after", "larger", "smaller",
];

/// Parsed query with structured components
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedQuery {
    /// Free-text search terms
    pub terms: Vec<String>,
    pub from: Vec<String>,
    pub to: Vec<String>,
    pub subject: Vec<String>,
    /// in: folder server id, as typed
    pub in_folder: Option<String>,
    /// is:unread / is:read
    pub is_unread: Option<bool>,
    /// is:flagged / is:starred
    pub is_flagged: Option<bool>,
    pub is_answered: Option<bool>,
    pub before: Option<DateTime<Utc>>,
    pub after: Option<DateTime<Utc>>,
    pub larger: Option<i64>,
    pub smaller: Option<i64>,
}

impl ParsedQuery {
    /// Check if the query is empty (no terms or filters)
    pub fn is_empty(&self) -> bool {
        *self == ParsedQuery::default()
    }

    /// Build the equivalent condition tree; None for an empty query
    ///
    /// Every component is ANDed. A free-text term matches subject, sender or
    /// preview text.
    pub fn to_conditions(&self) -> Option<SearchConditionNode> {
        use SearchConditionNode as N;

        let mut parts = Vec::new();
        for term in &self.terms {
            let any_field = [
                SearchField::Subject,
                SearchField::Sender,
                SearchField::MessageContents,
            ]
            .into_iter()
            .map(|field| N::condition(field, Attribute::Contains, term.as_str()));
            parts.extend(N::any(any_field));
        }
        parts.extend(
            self.from
                .iter()
                .map(|v| N::condition(SearchField::Sender, Attribute::Contains, v.as_str())),
        );
        parts.extend(
            self.to
                .iter()
                .map(|v| N::condition(SearchField::Recipient, Attribute::Contains, v.as_str())),
        );
        parts.extend(
            self.subject
                .iter()
                .map(|v| N::condition(SearchField::Subject, Attribute::Contains, v.as_str())),
        );
        if let Some(folder) = &self.in_folder {
            parts.push(N::condition(SearchField::Folder, Attribute::Equals, folder.as_str()));
        }
        if let Some(unread) = self.is_unread {
            parts.push(N::condition(SearchField::Read, Attribute::Equals, (!unread).to_string()));
        }
        if let Some(flagged) = self.is_flagged {
            parts.push(N::condition(SearchField::Flagged, Attribute::Equals, flagged.to_string()));
        }
        if let Some(answered) = self.is_answered {
            parts.push(N::condition(
                SearchField::Answered,
                Attribute::Equals,
                answered.to_string(),
            ));
        }
        if let Some(before) = self.before {
            parts.push(N::condition(
                SearchField::Date,
                Attribute::LessThan,
                before.timestamp_millis().to_string(),
            ));
        }
        if let Some(after) = self.after {
            parts.push(N::condition(
                SearchField::Date,
                Attribute::GreaterThan,
                after.timestamp_millis().to_string(),
            ));
        }
        if let Some(larger) = self.larger {
            parts.push(N::condition(SearchField::Size, Attribute::GreaterThan, larger.to_string()));
        }
        if let Some(smaller) = self.smaller {
            parts.push(N::condition(SearchField::Size, Attribute::LessThan, smaller.to_string()));
        }

        N::all(parts)
    }
}

enum Token {
    Operator { key: String, value: String },
    Term(String),
}

/// Parse a search query string into structured components
///
/// Unknown operators and operators with an empty value are kept as plain
/// terms, so `foo:bar` searches for the text "foo:bar".
pub fn parse_query(input: &str) -> ParsedQuery {
    let mut query = ParsedQuery::default();

    for token in tokenize(input) {
        match token {
            Token::Term(word) => query.terms.push(word),
            Token::Operator { key, value } => apply_operator(&mut query, &key, value),
        }
    }

    query
}

fn apply_operator(query: &mut ParsedQuery, key: &str, value: String) {
    match key {
        "from" => query.from.push(value),
        "to" => query.to.push(value),
        "subject" => query.subject.push(value),
        "in" => query.in_folder = Some(normalize_folder(&value)),
        "is" => match value.to_lowercase().as_str() {
            "unread" => query.is_unread = Some(true),
            "read" => query.is_unread = Some(false),
            "flagged" | "starred" => query.is_flagged = Some(true),
            "answered" => query.is_answered = Some(true),
            _ => {}
        },
        "before" => query.before = parse_date(&value).or(query.before),
        "after" => query.after = parse_date(&value).or(query.after),
        "larger" => query.larger = value.parse().ok().or(query.larger),
        "smaller" => query.smaller = value.parse().ok().or(query.smaller),
        _ => {}
    }
}

/// IMAP reserves INBOX case-insensitively; other folder names are exact
fn normalize_folder(value: &str) -> String {
    if value.eq_ignore_ascii_case("inbox") {
        "INBOX".to_string()
    } else {
        value.to_string()
    }
}

fn tokenize(input: &str) -> Vec<Token> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        if chars[i].is_whitespace() {
            i += 1;
            continue;
        }

        if let Some((key, value, consumed)) = operator_at(&chars[i..]) {
            tokens.push(Token::Operator { key, value });
            i += consumed;
            continue;
        }

        let (word, consumed) = read_value(&chars[i..]);
        if !word.is_empty() {
            tokens.push(Token::Term(word));
        }
        i += consumed.max(1);
    }

    tokens
}

/// Match `key:value` or `key:"quoted value"` at the start of `chars`
fn operator_at(chars: &[char]) -> Option<(String, String, usize)> {
    let colon = chars
        .iter()
        .take_while(|c| !c.is_whitespace())
        .position(|&c| c == ':')?;
    let key: String = chars[..colon].iter().collect::<String>().to_lowercase();
    if !OPERATORS.contains(&key.as_str()) {
        return None;
    }

    let (value, consumed) = read_value(&chars[colon + 1..]);
    if value.is_empty() {
        return None;
    }
    Some((key, value, colon + 1 + consumed))
}

/// Read a quoted phrase or a run of non-whitespace characters
fn read_value(chars: &[char]) -> (String, usize) {
    match chars.first() {
        None => (String::new(), 0),
        Some('"') => {
            let body: String = chars[1..].iter().take_while(|&&c| c != '"').collect();
            let len = body.chars().count();
            // Closing quote is optional at end of input
            let consumed = if 1 + len < chars.len() { len + 2 } else { len + 1 };
            (body, consumed)
        }
        Some(_) => {
            let word: String = chars.iter().take_while(|c| !c.is_whitespace()).collect();
            let len = word.chars().count();
            (word, len)
        }
    }
}

/// Parse a date string (YYYY/MM/DD or YYYY-MM-DD) as UTC midnight
fn parse_date(input: &str) -> Option<DateTime<Utc>> {
    ["%Y/%m/%d", "%Y-%m-%d"].iter().find_map(|fmt| {
        NaiveDate::parse_from_str(input, fmt)
            .ok()
            .and_then(|date| date.and_hms_opt(0, 0, 0))
            .map(|dt| Utc.from_utc_datetime(&dt))
    })
}
