//! Connection handshake
//!
//! The first bytes a worker sends are not framed: a UTF-8 string
//! `<name>@@@***<hex md5(name + key)>`. The server answers with the four
//! unframed bytes `OK!!` on success and otherwise drops the connection
//! without saying why.
//!
//! # Pure Functions
//!
//! This module only builds, scans, parses and verifies handshakes. Socket
//! handling lives in the server's connection handler and the worker's bus.

/// Separator between the client name and the password hash
pub const HANDSHAKE_DELIMITER: &str = "@@@***";

/// Unframed acknowledgement sent after a successful handshake
pub const HANDSHAKE_ACK: &[u8; 4] = b"OK!!";

/// Length of a hex-encoded MD5 digest
pub const HASH_HEX_LEN: usize = 32;

/// Upper bound on the handshake size
pub const MAX_HANDSHAKE_LEN: usize = 512;

/// Handshake rejection reasons
///
/// Kept for the server log only; the peer never learns which one applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    /// Bytes are not valid UTF-8
    NotUtf8,

    /// No `@@@***` separator
    MissingDelimiter,

    /// Empty client name
    EmptyName,

    /// Hash is not 32 hex characters
    MalformedHash,

    /// Hash does not match `md5(name + key)`
    InvalidHash { name: String },

    /// Handshake grew past [`MAX_HANDSHAKE_LEN`]
    TooLong { len: usize },

    /// Server answered something other than `OK!!`
    Rejected,
}

impl std::fmt::Display for HandshakeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HandshakeError::NotUtf8 => write!(f, "handshake is not valid UTF-8"),
            HandshakeError::MissingDelimiter => write!(f, "handshake delimiter missing"),
            HandshakeError::EmptyName => write!(f, "empty client name"),
            HandshakeError::MalformedHash => write!(f, "malformed password hash"),
            HandshakeError::InvalidHash { name } => {
                write!(f, "invalid password hash for '{}'", name)
            }
            HandshakeError::TooLong { len } => {
                write!(f, "handshake too long ({} bytes, max {})", len, MAX_HANDSHAKE_LEN)
            }
            HandshakeError::Rejected => write!(f, "server rejected the handshake"),
        }
    }
}

impl std::error::Error for HandshakeError {}

/// Identity claimed by a connecting worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub name: String,
    pub password_hash: String,
}

/// Result of scanning a partially received handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeScan {
    /// Keep reading
    Incomplete,
    /// The first `len` bytes form the whole handshake
    Complete { len: usize },
}

/// `hex(md5(name + key))`
///
/// # Examples
///
/// ```
/// use yyspider_common::auth::password_hash;
///
/// let hash = password_hash("worker-1", "secret");
/// assert_eq!(hash.len(), 32);
/// assert_eq!(hash, password_hash("worker-1", "secret"));
/// ```
pub fn password_hash(name: &str, key: &str) -> String {
    format!("{:x}", md5::compute(format!("{}{}", name, key)))
}

/// Handshake string a worker sends for `name`
pub fn build_handshake(name: &str, key: &str) -> String {
    format!("{}{}{}", name, HANDSHAKE_DELIMITER, password_hash(name, key))
}

/// Decide whether `buf` holds a complete handshake yet
///
/// A handshake is complete once the delimiter and the 32 hash characters
/// after it are buffered. Bytes past that point belong to framed traffic.
pub fn scan_handshake(buf: &[u8]) -> Result<HandshakeScan, HandshakeError> {
    let delimiter = HANDSHAKE_DELIMITER.as_bytes();

    let found = buf
        .windows(delimiter.len())
        .position(|window| window == delimiter);

    match found {
        Some(pos) => {
            let len = pos + delimiter.len() + HASH_HEX_LEN;
            if len > MAX_HANDSHAKE_LEN {
                Err(HandshakeError::TooLong { len })
            } else if buf.len() >= len {
                Ok(HandshakeScan::Complete { len })
            } else {
                Ok(HandshakeScan::Incomplete)
            }
        }
        None if buf.len() > MAX_HANDSHAKE_LEN => Err(HandshakeError::TooLong { len: buf.len() }),
        None => Ok(HandshakeScan::Incomplete),
    }
}

/// Parse a complete handshake
pub fn parse_handshake(bytes: &[u8]) -> Result<Credentials, HandshakeError> {
    let text = std::str::from_utf8(bytes).map_err(|_| HandshakeError::NotUtf8)?;
    let (name, hash) = text
        .split_once(HANDSHAKE_DELIMITER)
        .ok_or(HandshakeError::MissingDelimiter)?;

    if name.is_empty() {
        return Err(HandshakeError::EmptyName);
    }
    if hash.len() != HASH_HEX_LEN || !hash.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(HandshakeError::MalformedHash);
    }

    Ok(Credentials {
        name: name.to_string(),
        password_hash: hash.to_ascii_lowercase(),
    })
}

/// Check credentials against the shared key
pub fn verify(credentials: &Credentials, key: &str) -> Result<(), HandshakeError> {
    if credentials.password_hash != password_hash(&credentials.name, key) {
        return Err(HandshakeError::InvalidHash {
            name: credentials.name.clone(),
        });
    }
    Ok(())
}

/// Parse and verify in one step
pub fn authenticate(bytes: &[u8], key: &str) -> Result<Credentials, HandshakeError> {
    let credentials = parse_handshake(bytes)?;
    verify(&credentials, key)?;
    Ok(credentials)
}
