//! Key material for the agent: wire decoding of added identities and signing.

use russh::keys::ssh_key::private::{Ed25519Keypair, KeypairData};
use russh::keys::ssh_key::{Algorithm, Signature};
use russh::keys::{PrivateKey, PublicKeyBase64};
use signature::Signer;

use super::protocol::{put_string, sign_flags, AgentError, WireReader};

/// Wire encoding of the key's public half, as used in identity answers
pub fn public_blob(key: &PrivateKey) -> Vec<u8> {
    key.public_key().public_key_bytes()
}

/// Decode `string keytype, <key fields>, string comment` from an add-identity body.
///
/// Only `ssh-ed25519` material is accepted; other types fail closed.
pub fn decode_identity(reader: &mut WireReader<'_>) -> Result<PrivateKey, AgentError> {
    let key_type = reader.read_utf8()?.to_string();

    let keypair = match key_type.as_str() {
        "ssh-ed25519" => {
            let public = reader.read_string()?;
            let secret = reader.read_string()?;
            let bytes: &[u8; 64] = secret
                .try_into()
                .map_err(|_| AgentError::InvalidKey("ed25519 secret must be 64 bytes".into()))?;
            let keypair = Ed25519Keypair::from_bytes(bytes)
                .map_err(|e| AgentError::InvalidKey(e.to_string()))?;
            if keypair.public.0.as_slice() != public {
                return Err(AgentError::InvalidKey(
                    "ed25519 public key does not match secret".into(),
                ));
            }
            KeypairData::from(keypair)
        }
        other => return Err(AgentError::UnsupportedKeyType(other.to_string())),
    };

    let comment = reader.read_utf8()?.to_string();
    PrivateKey::new(keypair, comment).map_err(|e| AgentError::InvalidKey(e.to_string()))
}

/// Sign `data` and return the signature blob (`string alg, string sig`).
///
/// Flag bits outside the known set fail. RSA keys sign with SHA-512 only.
pub fn sign(key: &PrivateKey, data: &[u8], flags: u32) -> Result<Vec<u8>, AgentError> {
    if flags & !sign_flags::KNOWN != 0 {
        return Err(AgentError::UnsupportedFlags(flags));
    }
    if matches!(key.algorithm(), Algorithm::Rsa { .. }) && flags != sign_flags::RSA_SHA2_512 {
        return Err(AgentError::UnsupportedFlags(flags));
    }

    let signature: Signature = key
        .try_sign(data)
        .map_err(|e| AgentError::SignFailed(e.to_string()))?;

    let mut out = bytes::BytesMut::new();
    put_string(&mut out, signature.algorithm().as_str().as_bytes());
    put_string(&mut out, signature.as_bytes());
    Ok(out.to_vec())
}
