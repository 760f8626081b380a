//! Client-side authentication: MD5 password hashing and SCRAM-SHA-256.
//!
//! SCRAM implements RFC 5802 (SCRAM) and RFC 7677 (SCRAM-SHA-256) without
//! channel binding.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hmac::{Hmac, Mac};
use rand::Rng;
use sha2::{Digest, Sha256};
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// SASL mechanism name advertised by the server.
pub const SCRAM_SHA_256: &str = "SCRAM-SHA-256";

/// Hash a password for `AuthenticationMD5Password`.
///
/// Result is `"md5" + hex(md5(hex(md5(password + user)) + salt))`.
pub fn md5_password(user: &str, password: &str, salt: &[u8; 4]) -> String {
    let inner = md5::compute(format!("{}{}", password, user));

    let mut outer_input = format!("{:x}", inner).into_bytes();
    outer_input.extend_from_slice(salt);

    format!("md5{:x}", md5::compute(&outer_input))
}

/// SCRAM authentication errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScramError {
    #[error("server message is not valid UTF-8")]
    InvalidServerMessage,
    #[error("invalid salt encoding")]
    InvalidSalt,
    #[error("invalid iteration count")]
    InvalidIterations,
    #[error("missing {0} in server-first-message")]
    MissingAttribute(&'static str),
    #[error("server nonce does not extend the client nonce")]
    NonceVerificationFailed,
    #[error("server reported an error: {0}")]
    ServerError(String),
    #[error("invalid server signature")]
    InvalidServerSignature,
    #[error("server signature verification failed")]
    ServerSignatureVerificationFailed,
    #[error("server-final-message received before server-first-message")]
    InvalidState,
    #[error("invalid key length")]
    KeyLength,
}

/// Values carried from the client-final step to the server-final check.
struct Proven {
    auth_message: String,
    salted_password: [u8; 32],
}

/// SCRAM-SHA-256 client state machine.
pub struct ScramClient {
    username: String,
    password: String,
    client_nonce: String,
    proven: Option<Proven>,
}

impl ScramClient {
    /// Create a new SCRAM client with a random nonce.
    pub fn new(username: &str, password: &str) -> Self {
        // 18 random bytes encode to 24 base64 characters
        let nonce_bytes: [u8; 18] = rand::thread_rng().gen();
        Self::with_nonce(username, password, &BASE64.encode(nonce_bytes))
    }

    /// Create a SCRAM client with a fixed client nonce.
    pub fn with_nonce(username: &str, password: &str, nonce: &str) -> Self {
        Self {
            username: username.to_string(),
            password: password.to_string(),
            client_nonce: nonce.to_string(),
            proven: None,
        }
    }

    fn client_first_bare(&self) -> String {
        format!("n={},r={}", escape_username(&self.username), self.client_nonce)
    }

    /// Generate the client-first-message: `n,,n=<username>,r=<client-nonce>`.
    pub fn client_first_message(&self) -> Vec<u8> {
        // GS2 header "n,,": no channel binding, no authzid
        format!("n,,{}", self.client_first_bare()).into_bytes()
    }

    /// Process the server-first-message and produce the client-final-message.
    ///
    /// Server message format: `r=<nonce>,s=<salt>,i=<iterations>`
    pub fn process_server_first(&mut self, server_msg: &[u8]) -> Result<Vec<u8>, ScramError> {
        let server_first =
            std::str::from_utf8(server_msg).map_err(|_| ScramError::InvalidServerMessage)?;

        let mut nonce = None;
        let mut salt = None;
        let mut iterations = None;

        for part in server_first.split(',') {
            if let Some(value) = part.strip_prefix("r=") {
                nonce = Some(value);
            } else if let Some(value) = part.strip_prefix("s=") {
                salt = Some(BASE64.decode(value).map_err(|_| ScramError::InvalidSalt)?);
            } else if let Some(value) = part.strip_prefix("i=") {
                let n: u32 = value.parse().map_err(|_| ScramError::InvalidIterations)?;
                if n == 0 {
                    return Err(ScramError::InvalidIterations);
                }
                iterations = Some(n);
            } else if let Some(value) = part.strip_prefix("e=") {
                return Err(ScramError::ServerError(value.to_string()));
            }
        }

        let combined_nonce = nonce.ok_or(ScramError::MissingAttribute("nonce"))?;
        let salt = salt.ok_or(ScramError::MissingAttribute("salt"))?;
        let iterations = iterations.ok_or(ScramError::MissingAttribute("iteration count"))?;

        if combined_nonce.len() <= self.client_nonce.len()
            || !combined_nonce.starts_with(&self.client_nonce)
        {
            return Err(ScramError::NonceVerificationFailed);
        }

        let salted_password = hi(&self.password, &salt, iterations)?;
        let client_key = hmac_sha256(&salted_password, b"Client Key")?;
        let stored_key = sha256(&client_key);

        let client_final_without_proof = format!("c=biws,r={}", combined_nonce);
        let auth_message = format!(
            "{},{},{}",
            self.client_first_bare(),
            server_first,
            client_final_without_proof
        );

        let client_signature = hmac_sha256(&stored_key, auth_message.as_bytes())?;
        let client_proof = xor_bytes(&client_key, &client_signature);

        self.proven = Some(Proven {
            auth_message,
            salted_password,
        });

        Ok(format!(
            "{},p={}",
            client_final_without_proof,
            BASE64.encode(client_proof)
        )
        .into_bytes())
    }

    /// Verify the server-final-message: `v=<verifier>`.
    pub fn verify_server_final(&self, server_msg: &[u8]) -> Result<(), ScramError> {
        let server_final =
            std::str::from_utf8(server_msg).map_err(|_| ScramError::InvalidServerMessage)?;

        if let Some(err) = server_final.strip_prefix("e=") {
            return Err(ScramError::ServerError(err.to_string()));
        }

        let verifier = server_final
            .split(',')
            .find_map(|part| part.strip_prefix("v="))
            .ok_or(ScramError::InvalidServerSignature)?;
        let server_signature = BASE64
            .decode(verifier)
            .map_err(|_| ScramError::InvalidServerSignature)?;

        let proven = self.proven.as_ref().ok_or(ScramError::InvalidState)?;
        let server_key = hmac_sha256(&proven.salted_password, b"Server Key")?;
        let expected = hmac_sha256(&server_key, proven.auth_message.as_bytes())?;

        if server_signature != expected {
            return Err(ScramError::ServerSignatureVerificationFailed);
        }

        Ok(())
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Hi() function - PBKDF2 with HMAC-SHA-256
fn hi(password: &str, salt: &[u8], iterations: u32) -> Result<[u8; 32], ScramError> {
    let mut output = [0u8; 32];
    pbkdf2::pbkdf2::<HmacSha256>(password.as_bytes(), salt, iterations, &mut output)
        .map_err(|_| ScramError::KeyLength)?;
    Ok(output)
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<[u8; 32], ScramError> {
    let mut mac = HmacSha256::new_from_slice(key).map_err(|_| ScramError::KeyLength)?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().into())
}

fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

fn xor_bytes(a: &[u8; 32], b: &[u8; 32]) -> [u8; 32] {
    std::array::from_fn(|i| a[i] ^ b[i])
}

/// Escape `=` and `,` in a SCRAM username (RFC 5802 section 5.1).
///
/// PostgreSQL ignores this name in favor of the startup user, so no SASLprep.
fn escape_username(s: &str) -> String {
    s.replace('=', "=3D").replace(',', "=2C")
}
