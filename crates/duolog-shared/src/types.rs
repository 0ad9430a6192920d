use std::fmt;
use std::str::FromStr;

use rand::Rng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::constants::{
    ANON_ID_LEN, ANON_ID_PREFIX, ID_SUFFIX_LEN, REPORT_ID_PREFIX, SESSION_ID_PREFIX,
};
use crate::error::ParseValueError;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Platform identity of a user (the chat platform's numeric account id).
///
/// Never leaves the core towards another user.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct UserId(pub i64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque, peer-visible identifier such as `u_k3j9x0aa`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct AnonId(String);

impl AnonId {
    const CHARSET: &'static [u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

    /// Draw a fresh random id. Uniqueness is enforced by the directory,
    /// which retries on collision.
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let suffix: String = (0..ANON_ID_LEN)
            .map(|_| Self::CHARSET[rng.gen_range(0..Self::CHARSET.len())] as char)
            .collect();
        Self(format!("{ANON_ID_PREFIX}{suffix}"))
    }

    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AnonId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn generate() -> Self {
        Self(format!("{SESSION_ID_PREFIX}{}", short_uuid_hex()))
    }

    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct ReportId(String);

impl ReportId {
    pub fn generate() -> Self {
        Self(format!("{REPORT_ID_PREFIX}{}", short_uuid_hex()))
    }

    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ReportId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Single-use gate token. A v4 UUID carries 122 random bits.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct TokenId(pub Uuid);

impl TokenId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for TokenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TokenId {
    type Err = ParseValueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim())
            .map(Self)
            .map_err(|_| ParseValueError::new("token", s))
    }
}

fn short_uuid_hex() -> String {
    hex::encode(Uuid::new_v4().as_bytes())[..ID_SUFFIX_LEN].to_string()
}

// ---------------------------------------------------------------------------
// Text-backed enums
// ---------------------------------------------------------------------------

/// Declares a fieldless enum whose serde, `Display` and `FromStr` forms are
/// the given lowercase strings (the same strings the store persists).
macro_rules! text_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(#[serde(rename = $text)] $variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = ParseValueError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.trim().to_ascii_lowercase().as_str() {
                    $($text => Ok(Self::$variant),)+
                    _ => Err(ParseValueError::new(stringify!($name), s)),
                }
            }
        }
    };
}

text_enum! {
    /// Self-declared gender collected during onboarding.
    Gender {
        Male => "male",
        Female => "female",
        Other => "other",
    }
}

text_enum! {
    /// Which partner genders a user is willing to be matched with.
    Preference {
        Any => "any",
        Same => "same",
        Opposite => "opposite",
        Other => "other",
    }
}

text_enum! {
    SessionStatus {
        Active => "active",
        Ended => "ended",
    }
}

text_enum! {
    /// Why a session left the `active` state.
    EndReason {
        Skip => "skip",
        End => "end",
        Block => "block",
        Report => "report",
        Disconnect => "disconnect",
    }
}

text_enum! {
    TokenStatus {
        Pending => "pending",
        Completed => "completed",
        Expired => "expired",
    }
}

text_enum! {
    ReportStatus {
        Pending => "pending",
        Reviewed => "reviewed",
    }
}

text_enum! {
    /// Kind of a relayed message, mirroring what the chat platform delivers.
    ContentKind {
        Text => "text",
        Photo => "photo",
        Video => "video",
        Document => "document",
        Audio => "audio",
        Voice => "voice",
        VideoNote => "video_note",
        Sticker => "sticker",
    }
}

impl ContentKind {
    /// Everything except plain text counts as a file for the
    /// `allow_files` consent check.
    pub fn is_file(&self) -> bool {
        !matches!(self, ContentKind::Text)
    }
}
