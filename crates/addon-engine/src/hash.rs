//! Change detection.
//!
//! A [`Fingerprint`] is a SHA-256 digest over everything that influences a
//! feature's or release's rendered output. Structured inputs are parsed and
//! hashed in canonical form (sorted keys, no whitespace), so reformatting or
//! reordering keys never triggers a redeploy while any value change does.
//!
//! Hashing never fails. Input that cannot be parsed is hashed verbatim and the
//! fingerprint is marked volatile, which makes [`should_redeploy`] return
//! `true` for it every time.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::resource::split_documents;

const VOLATILE_PREFIX: &str = "volatile:";

/// One input to [`compute_hash`]. Inputs are digested in the order given.
#[derive(Debug, Clone, PartialEq)]
pub enum HashInput {
    /// A manifest bundle; every document is parsed and canonicalized.
    Manifests(String),
    /// A YAML or JSON document hashed in canonical form (e.g. Helm values).
    Yaml(String),
    /// An already structured value.
    Value(Value),
    /// Opaque text hashed byte for byte (templates, scripts, versions).
    Text(String),
}

/// Digest of a set of inputs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct Fingerprint {
    digest: String,
    stable: bool,
}

impl Fingerprint {
    /// Hex-encoded SHA-256 digest.
    #[must_use]
    pub fn digest(&self) -> &str {
        &self.digest
    }

    /// `false` when some input could not be canonicalized.
    #[must_use]
    pub fn is_stable(&self) -> bool {
        self.stable
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.stable {
            f.write_str(&self.digest)
        } else {
            write!(f, "{VOLATILE_PREFIX}{}", self.digest)
        }
    }
}

impl From<Fingerprint> for String {
    fn from(fingerprint: Fingerprint) -> Self {
        fingerprint.to_string()
    }
}

impl TryFrom<String> for Fingerprint {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let (digest, stable) = match value.strip_prefix(VOLATILE_PREFIX) {
            Some(digest) => (digest.to_string(), false),
            None => (value, true),
        };
        if digest.len() != 64 || !digest.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(format!("invalid fingerprint {digest:?}"));
        }
        Ok(Self { digest, stable })
    }
}

/// Digest `inputs` in order.
///
/// Each input is tagged and length-prefixed, so `["ab", "c"]` and `["a", "bc"]`
/// never collide.
#[must_use]
pub fn compute_hash(inputs: &[HashInput]) -> Fingerprint {
    let mut hasher = Sha256::new();
    let mut stable = true;

    for input in inputs {
        match input {
            HashInput::Manifests(text) => {
                update(&mut hasher, b'm', b"");
                for doc in split_documents(text) {
                    match serde_yaml::from_str::<Value>(&doc) {
                        Ok(value) => update(&mut hasher, b'd', canonical_json(&value).as_bytes()),
                        Err(_) => {
                            stable = false;
                            update(&mut hasher, b'r', doc.as_bytes());
                        }
                    }
                }
            }
            HashInput::Yaml(text) => {
                let parsed = if text.trim().is_empty() {
                    Ok(Value::Null)
                } else {
                    serde_yaml::from_str::<Value>(text)
                };
                match parsed {
                    Ok(value) => update(&mut hasher, b'y', canonical_json(&value).as_bytes()),
                    Err(_) => {
                        stable = false;
                        update(&mut hasher, b'r', text.as_bytes());
                    }
                }
            }
            HashInput::Value(value) => update(&mut hasher, b'v', canonical_json(value).as_bytes()),
            HashInput::Text(text) => update(&mut hasher, b't', text.as_bytes()),
        }
    }

    Fingerprint {
        digest: hex::encode(hasher.finalize()),
        stable,
    }
}

fn update(hasher: &mut Sha256, tag: u8, bytes: &[u8]) {
    hasher.update([tag]);
    hasher.update((bytes.len() as u64).to_be_bytes());
    hasher.update(bytes);
}

/// `true` iff the digests differ, either side is volatile, there is no
/// previous digest, or a redeploy is forced.
#[must_use]
pub fn should_redeploy(previous: Option<&Fingerprint>, current: &Fingerprint, force: bool) -> bool {
    if force || !current.stable {
        return true;
    }
    previous.map_or(true, |previous| !previous.stable || previous.digest != current.digest)
}

/// Serialize with object keys sorted at every level and no whitespace.
#[must_use]
pub fn canonical_json(value: &Value) -> String {
    sort_value(value).to_string()
}

fn sort_value(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            Value::Object(
                entries
                    .into_iter()
                    .map(|(k, v)| (k.clone(), sort_value(v)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.iter().map(sort_value).collect()),
        other => other.clone(),
    }
}
