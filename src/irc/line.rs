//! IRC protocol lines.

use std::fmt;

use super::IrcError;

/// A parsed IRC line: optional tags and prefix, a command and its parameters.
///
/// The trailing parameter is stored as the last element of `params`.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct Line {
    pub tags: Vec<(String, String)>,
    pub prefix: Option<String>,
    pub command: String,
    pub params: Vec<String>,
}

impl Line {
    pub fn new<I, S>(command: &str, params: I) -> Line
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Line {
            command: command.to_string(),
            params: params.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    /// Parses a line without its CRLF terminator.
    pub fn parse(line: &str) -> Result<Line, IrcError> {
        let mut rest = line.trim_end_matches(['\r', '\n']);
        let mut parsed = Line::default();

        if let Some(tagged) = rest.strip_prefix('@') {
            let (tags, tail) = tagged
                .split_once(' ')
                .ok_or_else(|| IrcError::Parse(line.to_string()))?;
            parsed.tags = tags
                .split(';')
                .filter(|t| !t.is_empty())
                .map(|t| match t.split_once('=') {
                    Some((k, v)) => (k.to_string(), unescape_tag(v)),
                    None => (t.to_string(), String::new()),
                })
                .collect();
            rest = tail.trim_start_matches(' ');
        }

        if let Some(prefixed) = rest.strip_prefix(':') {
            let (prefix, tail) = prefixed
                .split_once(' ')
                .ok_or_else(|| IrcError::Parse(line.to_string()))?;
            parsed.prefix = Some(prefix.to_string());
            rest = tail.trim_start_matches(' ');
        }

        let (command, mut rest) = match rest.split_once(' ') {
            Some((command, tail)) => (command, tail),
            None => (rest, ""),
        };
        if command.is_empty() {
            return Err(IrcError::Parse(line.to_string()));
        }
        parsed.command = command.to_ascii_uppercase();

        loop {
            rest = rest.trim_start_matches(' ');
            if rest.is_empty() {
                break;
            }
            if let Some(trailing) = rest.strip_prefix(':') {
                parsed.params.push(trailing.to_string());
                break;
            }
            match rest.split_once(' ') {
                Some((param, tail)) => {
                    parsed.params.push(param.to_string());
                    rest = tail;
                }
                None => {
                    parsed.params.push(rest.to_string());
                    break;
                }
            }
        }

        Ok(parsed)
    }

    /// Nickname part of the prefix.
    pub fn source_nick(&self) -> Option<&str> {
        let prefix = self.prefix.as_deref()?;
        Some(prefix.split(['!', '@']).next().unwrap_or(prefix))
    }

    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn param(&self, index: usize) -> Option<&str> {
        self.params.get(index).map(String::as_str)
    }
}

impl fmt::Display for Line {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(prefix) = &self.prefix {
            write!(f, ":{} ", prefix)?;
        }
        f.write_str(&self.command)?;

        let count = self.params.len();
        for (i, param) in self.params.iter().enumerate() {
            let trailing =
                i + 1 == count && (param.is_empty() || param.contains(' ') || param.starts_with(':'));
            if trailing {
                write!(f, " :{}", param)?;
            } else {
                write!(f, " {}", param)?;
            }
        }
        Ok(())
    }
}

fn unescape_tag(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some(':') => out.push(';'),
            Some('s') => out.push(' '),
            Some('r') => out.push('\r'),
            Some('n') => out.push('\n'),
            Some(other) => out.push(other),
            None => {}
        }
    }
    out
}
