use serde::{Deserialize, Serialize};
use uuid::Uuid;

const ALPHABET: &[u8; 62] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

/// Length of a base62-encoded UUID. 62^22 > 2^128, 62^21 < 2^128.
pub const B62_LEN: usize = 22;

/// Return the base62 encoding of the given UUID.
///
/// Base62 strings consist of digits (0-9) and letters (A-Z, a-z). UUIDs are
/// 128-bit numbers, so the result is always exactly 22 characters, left-padded
/// with '0'.
pub fn b62uuid_encode(uuid: Uuid) -> String {
    let mut n = uuid.as_u128();
    let mut out = [b'0'; B62_LEN];

    for slot in out.iter_mut().rev() {
        *slot = ALPHABET[(n % 62) as usize];
        n /= 62;
    }

    // ALPHABET is pure ASCII
    String::from_utf8(out.to_vec()).expect("base62 output is ascii")
}

/// Decode a 22-character base62 string back into a UUID.
///
/// Inverse of [`b62uuid_encode`]. Returns `None` for strings of the wrong
/// length, with characters outside the alphabet, or encoding a number larger
/// than 128 bits.
pub fn b62uuid_decode(s: &str) -> Option<Uuid> {
    if s.len() != B62_LEN {
        return None;
    }

    let mut n: u128 = 0;
    for c in s.bytes() {
        let digit = match c {
            b'0'..=b'9' => c - b'0',
            b'A'..=b'Z' => c - b'A' + 10,
            b'a'..=b'z' => c - b'a' + 36,
            _ => return None,
        };
        n = n.checked_mul(62)?.checked_add(digit as u128)?;
    }
    Some(Uuid::from_u128(n))
}

/// Generate a new prefixed base62-encoded UUID, e.g. `res-5ntqaD7PPwP2AgXIqQsOwm`.
pub fn b62uuid_new(prefix: &str) -> String {
    format!("{}{}", prefix, b62uuid_encode(Uuid::new_v4()))
}

// ── Entity kinds ──────────────────────────────────────────────────────────────

/// The closed set of entity kinds managed by the coordinator.
///
/// Each kind carries the schema metadata the store needs: the id prefix, the
/// lowercased type name used in events, the fields an entity can be addressed
/// by besides its id, the free-form map fields whose keys must be escaped at
/// the storage boundary, and the reference-typed fields with their target
/// kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Agent,
    Resource,
    Group,
    Application,
    Procedure,
    Job,
    Subscription,
}

impl EntityKind {
    pub const ALL: [EntityKind; 7] = [
        EntityKind::Agent,
        EntityKind::Resource,
        EntityKind::Group,
        EntityKind::Application,
        EntityKind::Procedure,
        EntityKind::Job,
        EntityKind::Subscription,
    ];

    pub fn prefix(self) -> &'static str {
        match self {
            EntityKind::Agent => "agt-",
            EntityKind::Resource => "res-",
            EntityKind::Group => "grp-",
            EntityKind::Application => "app-",
            EntityKind::Procedure => "prc-",
            EntityKind::Job => "job-",
            EntityKind::Subscription => "sub-",
        }
    }

    /// Lowercased kind name, as recorded in `Event.entity_type`.
    pub fn entity_type(self) -> &'static str {
        match self {
            EntityKind::Agent => "agent",
            EntityKind::Resource => "resource",
            EntityKind::Group => "group",
            EntityKind::Application => "application",
            EntityKind::Procedure => "procedure",
            EntityKind::Job => "job",
            EntityKind::Subscription => "subscription",
        }
    }

    /// Fields tried, in order, when a non-id value is used to address an
    /// entity of this kind. The id itself is always tried first.
    pub fn lookup_fields(self) -> &'static [&'static str] {
        match self {
            EntityKind::Agent
            | EntityKind::Group
            | EntityKind::Application
            | EntityKind::Procedure => &["name"],
            EntityKind::Resource => &["names"],
            EntityKind::Job | EntityKind::Subscription => &[],
        }
    }

    /// Free-form map fields with user-supplied keys. Their keys are escaped
    /// before storage and unescaped on read.
    pub fn escaped_fields(self) -> &'static [&'static str] {
        match self {
            EntityKind::Agent => &["options"],
            EntityKind::Resource => &["snapshot"],
            EntityKind::Group => &["query"],
            EntityKind::Application => &[],
            EntityKind::Procedure => &["options", "params"],
            EntityKind::Job => &["options", "params", "result"],
            EntityKind::Subscription => &["options", "params"],
        }
    }

    /// Reference-typed fields and their target kinds. List-valued reference
    /// fields (`Group.include`/`exclude`, `Application.components`) are
    /// included; their values are lists of ids.
    pub fn reference_fields(self) -> &'static [(&'static str, EntityKind)] {
        match self {
            EntityKind::Agent => &[],
            EntityKind::Resource => &[
                ("owner", EntityKind::Agent),
                ("parent", EntityKind::Resource),
                ("cluster", EntityKind::Resource),
                ("host", EntityKind::Resource),
            ],
            EntityKind::Group => &[
                ("include", EntityKind::Resource),
                ("exclude", EntityKind::Resource),
            ],
            EntityKind::Application => &[("components", EntityKind::Group)],
            EntityKind::Procedure => &[],
            EntityKind::Job => &[
                ("owner", EntityKind::Agent),
                ("target", EntityKind::Resource),
                ("procedure", EntityKind::Procedure),
            ],
            EntityKind::Subscription => &[
                ("group", EntityKind::Group),
                ("procedure", EntityKind::Procedure),
                ("target", EntityKind::Resource),
            ],
        }
    }

    /// Generate a fresh id for this kind.
    pub fn new_id(self) -> StormId {
        StormId(b62uuid_new(self.prefix()))
    }

    /// Whether `value` is syntactically a valid id of this kind.
    pub fn owns_id(self, value: &str) -> bool {
        value
            .strip_prefix(self.prefix())
            .map_or(false, |rest| b62uuid_decode(rest).is_some())
    }
}

// ── StormId ───────────────────────────────────────────────────────────────────

/// A prefixed base62 UUID, e.g. `agt-0aX9fKq2ZmVbNwE3Rt7YcD`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StormId(pub String);

impl StormId {
    pub fn new(s: impl Into<String>) -> Self {
        StormId(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The kind this id belongs to, judged by its prefix, if any.
    pub fn kind(&self) -> Option<EntityKind> {
        EntityKind::ALL.into_iter().find(|k| k.owns_id(&self.0))
    }
}

impl std::fmt::Display for StormId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for StormId {
    fn from(s: String) -> Self {
        StormId(s)
    }
}

impl From<&str> for StormId {
    fn from(s: &str) -> Self {
        StormId(s.to_string())
    }
}
