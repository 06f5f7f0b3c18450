use crate::error::GatewayError;
use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use aes::Aes256;
use base64::Engine;
use rand::RngCore;
use sha1::{Digest, Sha1};

type Aes256CbcDec = cbc::Decryptor<Aes256>;
type Aes256CbcEnc = cbc::Encryptor<Aes256>;

/// Callback signature: sort the four inputs lexicographically, concatenate,
/// SHA1, lowercase hex.
pub fn get_signature(token: &str, timestamp: &str, nonce: &str, text: &str) -> String {
    let mut parts = [token, timestamp, nonce, text];
    parts.sort_unstable();
    let mut hasher = Sha1::new();
    for part in parts {
        hasher.update(part.as_bytes());
    }
    hex::encode(hasher.finalize())
}

pub fn verify_signature(
    token: &str,
    timestamp: &str,
    nonce: &str,
    text: &str,
    signature: &str,
) -> bool {
    if token.is_empty() || timestamp.is_empty() || nonce.is_empty() || text.is_empty() {
        return false;
    }
    get_signature(token, timestamp, nonce, text) == signature
}

/// The vendor hands out a 43-char base64 value; one padding char restores a
/// decodable string and the result must be exactly 32 bytes.
pub fn decode_encoding_aes_key(raw: &str) -> Result<Vec<u8>, GatewayError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(GatewayError::Auth("encoding_aes_key is missing".to_string()));
    }
    let padded = if raw.ends_with('=') {
        raw.to_string()
    } else {
        format!("{raw}=")
    };
    let key = base64::engine::general_purpose::STANDARD
        .decode(padded)
        .map_err(|_| GatewayError::Auth("encoding_aes_key is not valid base64".to_string()))?;
    if key.len() != 32 {
        return Err(GatewayError::Auth(format!(
            "encoding_aes_key must decode to 32 bytes, got {}",
            key.len()
        )));
    }
    Ok(key)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecryptedEnvelope {
    pub message: String,
    /// Trailing id bytes, used for the secondary identity check only.
    pub receiver_id: String,
}

/// AES-256-CBC with the key doubling as IV source (first 16 bytes), PKCS#7
/// padding. Decrypted layout: `[16 random][4-byte BE length][payload][id]`.
pub fn decrypt_envelope(key: &[u8], encrypted: &str) -> Result<DecryptedEnvelope, GatewayError> {
    let encrypted = encrypted.trim();
    if encrypted.is_empty() {
        return Err(GatewayError::Auth("encrypted payload is empty".to_string()));
    }
    if key.len() != 32 {
        return Err(GatewayError::Auth("aes key must be 32 bytes".to_string()));
    }
    let cipher_text = base64::engine::general_purpose::STANDARD
        .decode(encrypted)
        .map_err(|_| GatewayError::Auth("encrypted payload is not valid base64".to_string()))?;

    let iv = &key[..16];
    let plain = Aes256CbcDec::new(key.into(), iv.into())
        .decrypt_padded_vec_mut::<Pkcs7>(&cipher_text)
        .map_err(|_| GatewayError::Auth("payload decrypt failed".to_string()))?;

    if plain.len() < 20 {
        return Err(GatewayError::Auth("decrypted payload is too short".to_string()));
    }
    let length_field: [u8; 4] = plain[16..20]
        .try_into()
        .map_err(|_| GatewayError::Auth("payload length parse failed".to_string()))?;
    let message_len = u32::from_be_bytes(length_field) as usize;
    let message_start = 20;
    let message_end = message_start + message_len;
    if message_end > plain.len() {
        return Err(GatewayError::Auth("payload length out of range".to_string()));
    }

    let message = String::from_utf8(plain[message_start..message_end].to_vec())
        .map_err(|_| GatewayError::Auth("payload body is not utf-8".to_string()))?;
    let receiver_id = String::from_utf8_lossy(&plain[message_end..])
        .trim()
        .to_string();

    Ok(DecryptedEnvelope {
        message,
        receiver_id,
    })
}

/// Inverse of [`decrypt_envelope`]; the gateway itself never sends encrypted
/// payloads, but the round trip anchors the envelope layout.
pub fn encrypt_envelope(
    key: &[u8],
    message: &str,
    receiver_id: &str,
) -> Result<String, GatewayError> {
    if key.len() != 32 {
        return Err(GatewayError::Auth("aes key must be 32 bytes".to_string()));
    }
    let mut random = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut random);

    let mut plain = Vec::with_capacity(20 + message.len() + receiver_id.len());
    plain.extend_from_slice(&random);
    plain.extend_from_slice(&(message.len() as u32).to_be_bytes());
    plain.extend_from_slice(message.as_bytes());
    plain.extend_from_slice(receiver_id.as_bytes());

    let iv = &key[..16];
    let cipher_text =
        Aes256CbcEnc::new(key.into(), iv.into()).encrypt_padded_vec_mut::<Pkcs7>(&plain);
    Ok(base64::engine::general_purpose::STANDARD.encode(cipher_text))
}
