//! Line oriented `key=value` encoding used by Sigsum
//!
//! Every line ends in a newline. Multiple values on one line are separated by
//! single spaces. Sections of a proof are separated by one empty line.

use crate::error::AttestError;
use std::fmt::Write;

pub(crate) struct AsciiReader<'a> {
    lines: Vec<&'a str>,
    pos: usize,
}

impl<'a> AsciiReader<'a> {
    pub fn new(text: &'a str) -> Result<Self, AttestError> {
        let mut lines: Vec<&str> = text.split('\n').collect();
        // split leaves one empty element after the final newline
        match lines.pop() {
            Some("") => {}
            _ => {
                return Err(AttestError::ParseError(
                    "ascii input must end with a newline".to_string(),
                ))
            }
        }
        Ok(AsciiReader { lines, pos: 0 })
    }

    pub fn at_end(&self) -> bool {
        self.pos >= self.lines.len()
    }

    /// Key of the next line, if it is a `key=value` line.
    pub fn peek_key(&self) -> Option<&'a str> {
        let line = self.lines.get(self.pos).copied()?;
        line.split_once('=').map(|(k, _)| k)
    }

    pub fn blank(&mut self) -> Result<(), AttestError> {
        match self.lines.get(self.pos).copied() {
            Some(line) if line.is_empty() => {
                self.pos += 1;
                Ok(())
            }
            Some(line) => Err(AttestError::ParseError(format!(
                "expected empty line, got '{}'",
                line
            ))),
            None => Err(AttestError::ParseError(
                "expected empty line, got end of input".to_string(),
            )),
        }
    }

    pub fn value(&mut self, key: &str) -> Result<&'a str, AttestError> {
        let line = self.lines.get(self.pos).copied().ok_or_else(|| {
            AttestError::ParseError(format!("expected '{}=', got end of input", key))
        })?;
        match line.split_once('=') {
            Some((k, v)) if k == key => {
                self.pos += 1;
                Ok(v)
            }
            _ => Err(AttestError::ParseError(format!(
                "expected '{}=', got '{}'",
                key, line
            ))),
        }
    }

    pub fn values(&mut self, key: &str, count: usize) -> Result<Vec<&'a str>, AttestError> {
        let values: Vec<&str> = self.value(key)?.split(' ').collect();
        if values.len() != count || values.iter().any(|v| v.is_empty()) {
            return Err(AttestError::ParseError(format!(
                "'{}' expects {} values, got {}",
                key,
                count,
                values.len()
            )));
        }
        Ok(values)
    }

    pub fn finish(&self) -> Result<(), AttestError> {
        if !self.at_end() {
            return Err(AttestError::ParseError(format!(
                "unexpected trailing line '{}'",
                self.lines[self.pos]
            )));
        }
        Ok(())
    }
}

/// Strict decimal, no sign or leading zeros.
pub(crate) fn parse_u64(s: &str, key: &str) -> Result<u64, AttestError> {
    let bad = || AttestError::ParseError(format!("invalid number for '{}': '{}'", key, s));
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) || (s.len() > 1 && s.starts_with('0')) {
        return Err(bad());
    }
    s.parse().map_err(|_| bad())
}

pub(crate) fn write_line(out: &mut String, key: &str, values: &[&dyn std::fmt::Display]) {
    out.push_str(key);
    out.push('=');
    for (i, v) in values.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        let _ = write!(out, "{}", v);
    }
    out.push('\n');
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reader() {
        let text = "version=2\nleaf=aa bb\n\nsize=3\n";
        let mut r = AsciiReader::new(text).unwrap();
        assert_eq!(r.value("version").unwrap(), "2");
        assert_eq!(r.peek_key(), Some("leaf"));
        assert_eq!(r.values("leaf", 2).unwrap(), vec!["aa", "bb"]);
        assert_eq!(r.peek_key(), None);
        r.blank().unwrap();
        assert_eq!(parse_u64(r.value("size").unwrap(), "size").unwrap(), 3);
        assert!(r.at_end());
        r.finish().unwrap();
    }

    #[test]
    fn test_missing_newline() {
        assert!(AsciiReader::new("version=2").is_err());
    }

    #[test]
    fn test_wrong_key_and_count() {
        let mut r = AsciiReader::new("size=3\n").unwrap();
        assert!(r.value("version").is_err());
        assert!(r.values("size", 2).is_err());
        let mut r = AsciiReader::new("leaf=aa  bb\n").unwrap();
        assert!(r.values("leaf", 2).is_err());
    }

    #[test]
    fn test_parse_u64() {
        assert_eq!(parse_u64("4684", "size").unwrap(), 4684);
        assert_eq!(parse_u64("0", "size").unwrap(), 0);
        assert!(parse_u64("", "size").is_err());
        assert!(parse_u64("+1", "size").is_err());
        assert!(parse_u64("01", "size").is_err());
        assert!(parse_u64("18446744073709551616", "size").is_err());
    }

    #[test]
    fn test_write_line() {
        let mut out = String::new();
        write_line(&mut out, "cosignature", &[&"ab", &12u64, &"cd"]);
        assert_eq!(out, "cosignature=ab 12 cd\n");
    }
}
