//! Trust policy: which logs to accept and which witnesses make a quorum
//!
//! ```text
//! log <public key hex> [url]
//! witness <name> <public key hex> [url]
//! group <name> <any|all|k> <member> ...
//! quorum <name|none>
//! ```
//!
//! Groups may contain witnesses and other groups defined earlier.

use super::leaf::{key_hash, KeyHash};
use crate::error::AttestError;
use crate::hexutil::decode_array;
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub public_key: [u8; 32],
    pub key_hash: KeyHash,
    pub url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Witness {
    pub name: String,
    pub public_key: [u8; 32],
    pub key_hash: KeyHash,
    pub url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Node {
    Witness(KeyHash),
    Group { threshold: usize, members: Vec<Node> },
}

impl Node {
    fn satisfied(&self, verified: &HashSet<KeyHash>) -> bool {
        match self {
            Node::Witness(h) => verified.contains(h),
            Node::Group { threshold, members } => {
                members.iter().filter(|m| m.satisfied(verified)).count() >= *threshold
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Policy {
    logs: Vec<LogEntry>,
    witnesses: HashMap<KeyHash, Witness>,
    // None is `quorum none`
    quorum: Option<Node>,
}

fn policy_error(lineno: usize, msg: impl std::fmt::Display) -> AttestError {
    AttestError::ParseError(format!("policy line {}: {}", lineno, msg))
}

impl Policy {
    /// The policy compiled into the binary.
    pub fn builtin() -> Result<Self, AttestError> {
        Self::parse(include_str!("../../data/sigsum-policy.conf"))
    }

    pub fn parse(text: &str) -> Result<Self, AttestError> {
        let mut logs: Vec<LogEntry> = Vec::new();
        let mut witnesses: HashMap<KeyHash, Witness> = HashMap::new();
        let mut names: HashMap<String, Node> = HashMap::new();
        let mut quorum: Option<Option<Node>> = None;

        for (i, line) in text.lines().enumerate() {
            let lineno = i + 1;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let fields: Vec<&str> = line.split_whitespace().collect();
            match fields[0] {
                "log" => {
                    if !(2..=3).contains(&fields.len()) {
                        return Err(policy_error(lineno, "expected 'log <key> [url]'"));
                    }
                    let public_key = decode_array(fields[1], "log public key")?;
                    let kh = key_hash(&public_key);
                    if logs.iter().any(|l| l.key_hash == kh) {
                        return Err(policy_error(lineno, "duplicate log key"));
                    }
                    logs.push(LogEntry {
                        public_key,
                        key_hash: kh,
                        url: fields.get(2).map(|s| s.to_string()),
                    });
                }
                "witness" => {
                    if !(3..=4).contains(&fields.len()) {
                        return Err(policy_error(lineno, "expected 'witness <name> <key> [url]'"));
                    }
                    let name = fields[1];
                    if names.contains_key(name) || name == "none" {
                        return Err(policy_error(lineno, format!("duplicate name '{}'", name)));
                    }
                    let public_key = decode_array(fields[2], "witness public key")?;
                    let kh = key_hash(&public_key);
                    if witnesses.contains_key(&kh) {
                        return Err(policy_error(lineno, "duplicate witness key"));
                    }
                    witnesses.insert(
                        kh,
                        Witness {
                            name: name.to_string(),
                            public_key,
                            key_hash: kh,
                            url: fields.get(3).map(|s| s.to_string()),
                        },
                    );
                    names.insert(name.to_string(), Node::Witness(kh));
                }
                "group" => {
                    if fields.len() < 4 {
                        return Err(policy_error(
                            lineno,
                            "expected 'group <name> <threshold> <member>...'",
                        ));
                    }
                    let name = fields[1];
                    if names.contains_key(name) || name == "none" {
                        return Err(policy_error(lineno, format!("duplicate name '{}'", name)));
                    }
                    let mut members = Vec::new();
                    let mut seen = HashSet::new();
                    for member in &fields[3..] {
                        if !seen.insert(*member) {
                            return Err(policy_error(
                                lineno,
                                format!("duplicate group member '{}'", member),
                            ));
                        }
                        let node = names.get(*member).ok_or_else(|| {
                            policy_error(lineno, format!("undefined name '{}'", member))
                        })?;
                        members.push(node.clone());
                    }
                    let threshold = match fields[2] {
                        "any" => 1,
                        "all" => members.len(),
                        k => {
                            let k: usize = k
                                .parse()
                                .map_err(|_| policy_error(lineno, format!("invalid threshold '{}'", k)))?;
                            if k < 1 || k > members.len() {
                                return Err(policy_error(
                                    lineno,
                                    format!("threshold {} out of range 1..={}", k, members.len()),
                                ));
                            }
                            k
                        }
                    };
                    names.insert(name.to_string(), Node::Group { threshold, members });
                }
                "quorum" => {
                    if fields.len() != 2 {
                        return Err(policy_error(lineno, "expected 'quorum <name>'"));
                    }
                    if quorum.is_some() {
                        return Err(policy_error(lineno, "quorum already defined"));
                    }
                    quorum = Some(match fields[1] {
                        "none" => None,
                        name => Some(names.get(name).cloned().ok_or_else(|| {
                            policy_error(lineno, format!("undefined name '{}'", name))
                        })?),
                    });
                }
                keyword => {
                    return Err(policy_error(lineno, format!("unknown keyword '{}'", keyword)));
                }
            }
        }

        if logs.is_empty() {
            return Err(AttestError::ParseError("policy has no log".to_string()));
        }
        let quorum = quorum
            .ok_or_else(|| AttestError::ParseError("policy has no quorum".to_string()))?;
        Ok(Policy {
            logs,
            witnesses,
            quorum,
        })
    }

    pub fn log(&self, key_hash: &KeyHash) -> Option<&LogEntry> {
        self.logs.iter().find(|l| &l.key_hash == key_hash)
    }

    pub fn logs(&self) -> &[LogEntry] {
        &self.logs
    }

    pub fn witness(&self, key_hash: &KeyHash) -> Option<&Witness> {
        self.witnesses.get(key_hash)
    }

    pub fn witnesses(&self) -> impl Iterator<Item = &Witness> {
        self.witnesses.values()
    }

    /// Whether the witnesses whose cosignatures verified satisfy the quorum.
    pub fn is_quorum(&self, verified: &HashSet<KeyHash>) -> bool {
        match &self.quorum {
            None => true,
            Some(node) => node.satisfied(verified),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(n: u8) -> String {
        hex::encode([n; 32])
    }

    fn kh(n: u8) -> KeyHash {
        key_hash(&[n; 32])
    }

    fn set(ids: &[u8]) -> HashSet<KeyHash> {
        ids.iter().map(|n| kh(*n)).collect()
    }

    #[test]
    fn test_builtin() {
        let policy = Policy::builtin().unwrap();
        assert_eq!(policy.logs().len(), 1);
        assert_eq!(
            policy.logs()[0].url.as_deref(),
            Some("https://test.sigsum.org/barreleye")
        );
        assert_eq!(policy.witnesses().count(), 1);
        assert!(!policy.is_quorum(&HashSet::new()));
    }

    #[test]
    fn test_thresholds() {
        let text = format!(
            "log {}\nwitness a {}\nwitness b {}\nwitness c {}\n\
             group two 2 a b c\ngroup every all a b c\ngroup one any a b\n\
             group nested all two one\nquorum nested\n",
            key(0),
            key(1),
            key(2),
            key(3)
        );
        let policy = Policy::parse(&text).unwrap();
        assert!(!policy.is_quorum(&set(&[])));
        assert!(!policy.is_quorum(&set(&[1])));
        assert!(policy.is_quorum(&set(&[1, 2])));
        assert!(policy.is_quorum(&set(&[2, 3])));
        // two of three but none of the `one` group
        assert!(!policy.is_quorum(&set(&[3, 9])));
    }

    #[test]
    fn test_quorum_none() {
        let policy = Policy::parse(&format!("log {}\nquorum none\n", key(0))).unwrap();
        assert!(policy.is_quorum(&HashSet::new()));
    }

    #[test]
    fn test_lookup() {
        let text = format!(
            "log {} http://log.example\nwitness w {} http://w.example\nquorum w\n",
            key(0),
            key(1)
        );
        let policy = Policy::parse(&text).unwrap();
        assert_eq!(policy.log(&kh(0)).unwrap().public_key, [0u8; 32]);
        assert!(policy.log(&kh(1)).is_none());
        assert_eq!(policy.witness(&kh(1)).unwrap().name, "w");
        assert!(policy.is_quorum(&set(&[1])));
    }

    #[test]
    fn test_parse_errors() {
        let cases = [
            format!("witness a {}\nquorum a\n", key(1)),
            format!("log {}\n", key(0)),
            format!("log {}\nquorum missing\n", key(0)),
            format!("log {}\nlog {}\nquorum none\n", key(0), key(0)),
            format!("log {}\nwitness a {}\nwitness a {}\nquorum a\n", key(0), key(1), key(2)),
            format!("log {}\nwitness a {}\nwitness b {}\nquorum a\n", key(0), key(1), key(1)),
            format!("log {}\nwitness a {}\ngroup g 2 a\nquorum g\n", key(0), key(1)),
            format!("log {}\nwitness a {}\ngroup g 0 a\nquorum g\n", key(0), key(1)),
            format!("log {}\nwitness a {}\ngroup g any a a\nquorum g\n", key(0), key(1)),
            format!("log {}\nwitness a {}\nquorum a\nquorum a\n", key(0), key(1)),
            format!("log {}\nfrobnicate\nquorum none\n", key(0)),
            format!("log {}\nquorum none\n", &key(0)[2..]),
        ];
        for text in cases {
            assert!(Policy::parse(&text).is_err(), "accepted:\n{}", text);
        }
    }
}
