//! One-time admin password retrieval.
//!
//! The platform's agent watches instance metadata for a public key under
//! `windows-keys`, resets the account password, and writes the password
//! RSA-OAEP-encrypted (SHA-1 digest, per the agent) as a JSON line on
//! serial port 4. The private key never leaves this process and the
//! password never crosses the wire in the clear.

use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use gce_api::{ComputeClient, Instance, Metadata, MetadataItem};
use rsa::traits::PublicKeyParts as _;
use rsa::{Oaep, RsaPrivateKey};
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use tracing::info;

use crate::instance::wait_for_zone_operation;
use crate::{Error, Result};

const METADATA_KEY: &str = "windows-keys";
const SERIAL_PORT: u8 = 4;
const KEY_BITS: usize = 2048;
const KEY_EXPIRY: Duration = Duration::from_secs(5 * 60);

const POLL_DEADLINE: Duration = Duration::from_secs(5 * 60);
const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Public key material published to the instance.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct KeyMetadata {
    user_name: String,
    modulus: String,
    exponent: String,
    email: String,
    expire_on: DateTime<Utc>,
}

/// Agent response read back from the serial console.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PasswordResponse {
    #[serde(default)]
    modulus: String,
    #[serde(default)]
    encrypted_password: String,
}

/// Run the exchange against `instance` and return the fresh password for
/// `username`.
pub async fn exchange(
    compute: &ComputeClient,
    project: &str,
    zone: &str,
    instance: &Instance,
    username: &str,
) -> Result<String> {
    let key = RsaPrivateKey::new(&mut rand::thread_rng(), KEY_BITS)
        .map_err(|e| Error::Internal(format!("RSA key generation failed: {e}")))?;

    let key_metadata = KeyMetadata {
        user_name: username.to_string(),
        modulus: BASE64.encode(key.n().to_bytes_be()),
        exponent: BASE64.encode(key.e().to_bytes_be()),
        email: "nobody@nowhere.com".to_string(),
        expire_on: Utc::now() + KEY_EXPIRY,
    };
    let expected_modulus = key_metadata.modulus.clone();
    let value = serde_json::to_string(&key_metadata)
        .map_err(|e| Error::Internal(format!("key metadata serialization failed: {e}")))?;

    info!(instance = %instance.name, "writing instance metadata for password reset");
    let metadata = metadata_with_key(instance.metadata.clone().unwrap_or_default(), value);
    let op = compute
        .set_metadata(project, zone, &instance.name, &metadata)
        .await?;
    wait_for_zone_operation(compute, project, zone, &op).await?;

    info!(instance = %instance.name, "waiting for password response on serial console");
    let deadline = tokio::time::Instant::now() + POLL_DEADLINE;
    while tokio::time::Instant::now() < deadline {
        let output = compute
            .get_serial_port_output(project, zone, &instance.name, SERIAL_PORT)
            .await?;

        if let Some(password) =
            scan_serial_contents(&output.contents, &expected_modulus, &key, &instance.name)?
        {
            return Ok(password);
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
    Err(Error::CredentialTimeout(instance.name.clone()))
}

/// Replace the existing `windows-keys` item in place, or append one.
/// Never append a duplicate: the agent only honors one value per key.
fn metadata_with_key(mut metadata: Metadata, value: String) -> Metadata {
    match metadata.items.iter_mut().find(|i| i.key == METADATA_KEY) {
        Some(item) => item.value = Some(value),
        None => metadata.items.push(MetadataItem {
            key: METADATA_KEY.to_string(),
            value: Some(value),
        }),
    }
    metadata
}

/// Scan one serial-console snapshot for our response.
///
/// Unparseable lines and responses for other moduli are interleaved
/// console noise, skipped silently. A response carrying *our* modulus
/// that fails to decode or decrypt is a terminal error: the agent will
/// not produce a second answer for the same key.
fn scan_serial_contents(
    contents: &str,
    expected_modulus: &str,
    key: &RsaPrivateKey,
    instance: &str,
) -> Result<Option<String>> {
    for line in contents.lines() {
        let Ok(response) = serde_json::from_str::<PasswordResponse>(line) else {
            continue;
        };
        if response.modulus != expected_modulus {
            continue;
        }

        let ciphertext = BASE64
            .decode(&response.encrypted_password)
            .map_err(|e| Error::CredentialDecrypt {
                instance: instance.to_string(),
                reason: format!("base64 decode failed: {e}"),
            })?;
        let plaintext = key
            .decrypt(Oaep::new::<Sha1>(), &ciphertext)
            .map_err(|e| Error::CredentialDecrypt {
                instance: instance.to_string(),
                reason: format!("OAEP decryption failed: {e}"),
            })?;
        let password = String::from_utf8(plaintext).map_err(|_| Error::CredentialDecrypt {
            instance: instance.to_string(),
            reason: "password is not valid UTF-8".into(),
        })?;
        return Ok(Some(password));
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsa::RsaPublicKey;

    // Small key to keep test key generation fast; OAEP/SHA-1 needs
    // a modulus of at least 42 bytes.
    fn test_key() -> RsaPrivateKey {
        RsaPrivateKey::new(&mut rand::thread_rng(), 512).unwrap()
    }

    fn encrypt_for(key: &RsaPrivateKey, plaintext: &str) -> String {
        let ciphertext = RsaPublicKey::from(key)
            .encrypt(&mut rand::thread_rng(), Oaep::new::<Sha1>(), plaintext.as_bytes())
            .unwrap();
        BASE64.encode(ciphertext)
    }

    #[test]
    fn matching_response_round_trips() {
        let key = test_key();
        let modulus = BASE64.encode(key.n().to_bytes_be());
        let contents = format!(
            "boot noise\n{{\"modulus\":\"{modulus}\",\"encryptedPassword\":\"{}\"}}\n",
            encrypt_for(&key, "s3cret!")
        );
        let password = scan_serial_contents(&contents, &modulus, &key, "i").unwrap();
        assert_eq!(password.as_deref(), Some("s3cret!"));
    }

    #[test]
    fn foreign_modulus_and_noise_are_skipped() {
        let key = test_key();
        let modulus = BASE64.encode(key.n().to_bytes_be());
        let contents = concat!(
            "not json at all\n",
            "{\"modulus\":\"c29tZW90aGVya2V5\",\"encryptedPassword\":\"aGVsbG8=\"}\n",
            "{}\n"
        );
        assert!(
            scan_serial_contents(contents, &modulus, &key, "i")
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn matching_modulus_with_garbage_ciphertext_is_terminal() {
        let key = test_key();
        let modulus = BASE64.encode(key.n().to_bytes_be());
        let contents = format!(
            "{{\"modulus\":\"{modulus}\",\"encryptedPassword\":\"{}\"}}\n",
            BASE64.encode(b"not a valid ciphertext")
        );
        assert!(matches!(
            scan_serial_contents(&contents, &modulus, &key, "i"),
            Err(Error::CredentialDecrypt { .. })
        ));
    }

    #[test]
    fn metadata_key_is_replaced_not_duplicated() {
        let metadata = Metadata {
            fingerprint: Some("fp".into()),
            items: vec![
                MetadataItem { key: "windows-startup-script-ps1".into(), value: Some("x".into()) },
                MetadataItem { key: METADATA_KEY.into(), value: Some("old".into()) },
            ],
        };
        let updated = metadata_with_key(metadata, "new".into());
        let keys: Vec<_> = updated.items.iter().filter(|i| i.key == METADATA_KEY).collect();
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].value.as_deref(), Some("new"));
        assert_eq!(updated.fingerprint.as_deref(), Some("fp"));
    }

    #[test]
    fn key_metadata_serializes_with_agent_field_names() {
        let key = test_key();
        let md = KeyMetadata {
            user_name: "builder".into(),
            modulus: BASE64.encode(key.n().to_bytes_be()),
            exponent: BASE64.encode(key.e().to_bytes_be()),
            email: "nobody@nowhere.com".into(),
            expire_on: Utc::now() + KEY_EXPIRY,
        };
        let json = serde_json::to_value(&md).unwrap();
        assert!(json.get("userName").is_some());
        assert!(json.get("expireOn").is_some());
        // 65537 big-endian is exactly three bytes
        assert_eq!(BASE64.decode(json["exponent"].as_str().unwrap()).unwrap(), vec![1, 0, 1]);
    }
}
