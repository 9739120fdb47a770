//! Integrity verification
//!
//! Two independent checks guard every artifact:
//! - a streamed SHA-256 of the file compared with the expected digest
//! - an Ed25519 cleartext signature, made by the pinned publisher key, over
//!   the document that carries the expected digest
//!
//! Neither check touches installation state. [`VerificationRecord`] joins
//! their outcomes and is the only way to obtain a [`VerifiedArtifact`].

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512};
use std::path::{Path, PathBuf};
use tokio::io::AsyncReadExt;

use super::manifest::{UpdateChannel, UpdateManifest};
use crate::core::config::PUBLISHER_PUBLIC_KEY;
use crate::core::error::VerifyError;
use crate::core::utils::normalize_sha256;

pub const SIGNED_MESSAGE_HEADER: &str = "-----BEGIN SIGNED MESSAGE-----";
pub const SIGNATURE_HEADER: &str = "-----BEGIN SIGNATURE-----";
pub const SIGNATURE_FOOTER: &str = "-----END SIGNATURE-----";

const HASH_BUFFER_SIZE: usize = 1024 * 1024;

/// Ed25519 key releases are signed with
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublisherKey(VerifyingKey);

impl PublisherKey {
    /// Parse a hex-encoded 32-byte public key
    pub fn from_hex(key_hex: &str) -> Result<Self, VerifyError> {
        let bytes = hex::decode(key_hex.trim()).map_err(|e| VerifyError::MalformedSignature {
            reason: format!("public key is not hex: {}", e),
        })?;
        let bytes: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| VerifyError::MalformedSignature {
                reason: format!("public key must be 32 bytes, got {}", bytes.len()),
            })?;
        let key = VerifyingKey::from_bytes(&bytes).map_err(|e| VerifyError::MalformedSignature {
            reason: format!("invalid public key: {}", e),
        })?;
        Ok(Self(key))
    }

    /// Key compiled into the application
    pub fn pinned() -> Result<Self, VerifyError> {
        Self::from_hex(PUBLISHER_PUBLIC_KEY)
    }

    pub fn from_verifying_key(key: VerifyingKey) -> Self {
        Self(key)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0.as_bytes())
    }
}

/// Payload text of a cleartext-signed document
///
/// Trailing whitespace is dropped from every line, lines are joined with
/// `\n` and trailing newlines are removed. Signer and verifier both hash
/// exactly this form.
pub fn canonical_text(text: &str) -> String {
    let joined = text
        .lines()
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n");
    joined.trim_end_matches('\n').to_string()
}

/// Parsed cleartext-signed document
#[derive(Debug, Clone)]
pub struct SignedDocument {
    text: String,
    signature: Signature,
}

impl SignedDocument {
    pub fn parse(document: &str) -> Result<Self, VerifyError> {
        if document.trim().is_empty() {
            return Err(VerifyError::MissingSignature);
        }

        let malformed = |reason: &str| VerifyError::MalformedSignature {
            reason: reason.to_string(),
        };

        let mut lines = document.lines().skip_while(|l| l.trim().is_empty());
        if lines.next().map(str::trim_end) != Some(SIGNED_MESSAGE_HEADER) {
            return Err(malformed("missing signed message header"));
        }

        // Armor headers up to the first blank line
        for line in lines.by_ref() {
            let line = line.trim_end();
            if line.is_empty() {
                break;
            }
            if let Some(hash) = line.strip_prefix("Hash:") {
                if !hash.trim().eq_ignore_ascii_case("SHA256") {
                    return Err(malformed("unsupported hash header"));
                }
            }
        }

        let mut body = Vec::new();
        let mut saw_signature = false;
        for line in lines.by_ref() {
            if line.trim_end() == SIGNATURE_HEADER {
                saw_signature = true;
                break;
            }
            body.push(line.strip_prefix("- ").unwrap_or(line));
        }
        if !saw_signature {
            return Err(VerifyError::MissingSignature);
        }

        let mut encoded = String::new();
        let mut saw_footer = false;
        for line in lines {
            let line = line.trim();
            if line == SIGNATURE_FOOTER {
                saw_footer = true;
                break;
            }
            encoded.push_str(line);
        }
        if !saw_footer {
            return Err(malformed("unterminated signature block"));
        }

        let raw = BASE64
            .decode(encoded.as_bytes())
            .map_err(|_| malformed("signature is not base64"))?;
        let signature =
            Signature::from_slice(&raw).map_err(|_| malformed("signature has wrong length"))?;

        Ok(Self {
            text: canonical_text(&body.join("\n")),
            signature,
        })
    }

    /// Render `text` with an attached signature block
    pub fn armor(text: &str, signature: &Signature) -> String {
        let mut out = String::new();
        out.push_str(SIGNED_MESSAGE_HEADER);
        out.push_str("\nHash: SHA256\n\n");
        for line in canonical_text(text).lines() {
            if line.starts_with('-') {
                out.push_str("- ");
            }
            out.push_str(line);
            out.push('\n');
        }
        out.push_str(SIGNATURE_HEADER);
        out.push('\n');
        out.push_str(&BASE64.encode(signature.to_bytes()));
        out.push('\n');
        out.push_str(SIGNATURE_FOOTER);
        out.push('\n');
        out
    }

    /// Sign `text` for publication
    pub fn sign(text: &str, key: &SigningKey) -> String {
        let signature = key.sign(canonical_text(text).as_bytes());
        Self::armor(text, &signature)
    }

    pub fn text(&self) -> &str {
        &self.text
    }
}

/// Signed text whose signature checked out against the publisher key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedPayload {
    text: String,
}

/// JSON payload signed for a content bundle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleSignatureMetadata {
    pub file_name: String,
    pub sha256: String,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub generated_at: Option<String>,
}

impl VerifiedPayload {
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Digest vouched for by the publisher
    ///
    /// Accepts the bundle JSON form and the `SHA256SUMS` line form
    /// (`<digest>  <file name>`).
    pub fn sha256(&self) -> Result<String, VerifyError> {
        let candidate = match self.metadata() {
            Ok(meta) => meta.sha256,
            Err(_) => self
                .text
                .split_whitespace()
                .next()
                .unwrap_or_default()
                .to_string(),
        };
        normalize_sha256(&candidate).ok_or_else(|| VerifyError::InvalidPayload {
            reason: "signed text carries no SHA-256 digest".to_string(),
        })
    }

    /// Bundle JSON form
    pub fn metadata(&self) -> Result<BundleSignatureMetadata, VerifyError> {
        serde_json::from_str(&self.text).map_err(|e| VerifyError::InvalidPayload {
            reason: e.to_string(),
        })
    }
}

/// Check `document` against `key` and hand back its payload
pub fn verify_signature(document: &str, key: &PublisherKey) -> Result<VerifiedPayload, VerifyError> {
    let parsed = SignedDocument::parse(document)?;
    key.0
        .verify_strict(parsed.text.as_bytes(), &parsed.signature)
        .map_err(|_| VerifyError::SignatureMismatch)?;
    Ok(VerifiedPayload { text: parsed.text })
}

async fn digest_file<D: Digest>(path: &Path) -> Result<String, VerifyError> {
    let unreadable = |e: std::io::Error| VerifyError::ArtifactUnreadable {
        path: path.display().to_string(),
        reason: e.to_string(),
    };

    let mut file = tokio::fs::File::open(path).await.map_err(unreadable)?;
    let mut hasher = D::new();
    let mut buffer = vec![0u8; HASH_BUFFER_SIZE];
    loop {
        let n = file.read(&mut buffer).await.map_err(unreadable)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Lowercase hex SHA-256 of a file, streamed
pub async fn compute_sha256(path: &Path) -> Result<String, VerifyError> {
    digest_file::<Sha256>(path).await
}

/// Lowercase hex SHA-512 of a file, streamed
pub async fn compute_sha512(path: &Path) -> Result<String, VerifyError> {
    digest_file::<Sha512>(path).await
}

/// Whether the file's SHA-256 equals `expected_hash`
pub async fn verify_content_hash(path: &Path, expected_hash: &str) -> Result<bool, VerifyError> {
    let computed = compute_sha256(path).await?;
    Ok(normalize_sha256(expected_hash).as_deref() == Some(computed.as_str()))
}

/// Outcome of both checks for one artifact. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationRecord {
    content_hash_expected: String,
    content_hash_computed: String,
    signature_valid: bool,
}

impl VerificationRecord {
    pub fn evaluate(expected: &str, computed: &str, signature_valid: bool) -> Self {
        Self {
            content_hash_expected: expected.trim().to_ascii_lowercase(),
            content_hash_computed: computed.trim().to_ascii_lowercase(),
            signature_valid,
        }
    }

    pub fn content_hash_expected(&self) -> &str {
        &self.content_hash_expected
    }

    pub fn content_hash_computed(&self) -> &str {
        &self.content_hash_computed
    }

    pub fn signature_valid(&self) -> bool {
        self.signature_valid
    }

    /// Installation may proceed
    pub fn passed(&self) -> bool {
        self.signature_valid && self.content_hash_expected == self.content_hash_computed
    }

    /// Blocking reason, hash first
    pub fn failure(&self) -> Option<VerifyError> {
        if self.content_hash_expected != self.content_hash_computed {
            Some(VerifyError::HashMismatch {
                expected: self.content_hash_expected.clone(),
                actual: self.content_hash_computed.clone(),
            })
        } else if !self.signature_valid {
            Some(VerifyError::SignatureMismatch)
        } else {
            None
        }
    }
}

/// An artifact that passed both checks; only built from a passing record
#[derive(Debug, Clone)]
pub struct VerifiedArtifact {
    channel: UpdateChannel,
    path: PathBuf,
    manifest: UpdateManifest,
    payload: VerifiedPayload,
    record: VerificationRecord,
}

impl VerifiedArtifact {
    pub fn channel(&self) -> UpdateChannel {
        self.channel
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn manifest(&self) -> &UpdateManifest {
        &self.manifest
    }

    pub fn payload(&self) -> &VerifiedPayload {
        &self.payload
    }

    pub fn record(&self) -> &VerificationRecord {
        &self.record
    }
}

/// Expected digest for the artifact of `channel`
///
/// Native packages take the signed digest, and a manifest disagreeing with
/// it was tampered with. Bundles sign their inner metadata, so the archive
/// digest comes from the manifest.
pub fn expected_hash(
    channel: UpdateChannel,
    manifest: &UpdateManifest,
    payload: &VerifiedPayload,
) -> Result<String, VerifyError> {
    match channel {
        UpdateChannel::Native => {
            let signed = payload.sha256()?;
            if normalize_sha256(&manifest.content_hash).as_deref() != Some(signed.as_str()) {
                return Err(VerifyError::HashMismatch {
                    expected: signed,
                    actual: manifest.content_hash.clone(),
                });
            }
            Ok(signed)
        }
        UpdateChannel::Bundle => {
            normalize_sha256(&manifest.content_hash).ok_or_else(|| VerifyError::InvalidPayload {
                reason: "manifest content hash is not a SHA-256 digest".to_string(),
            })
        }
    }
}

/// Run the hash check and combine it with the signature outcome
pub async fn verify_artifact(
    channel: UpdateChannel,
    manifest: &UpdateManifest,
    path: &Path,
    signature: Result<VerifiedPayload, VerifyError>,
) -> Result<VerifiedArtifact, VerifyError> {
    let computed = compute_sha256(path).await?;

    let (expected, payload) = match signature {
        Ok(payload) => (expected_hash(channel, manifest, &payload)?, Some(payload)),
        Err(e) => {
            tracing::warn!(%channel, error = %e, "Signature check failed");
            (manifest.content_hash.to_ascii_lowercase(), None)
        }
    };

    let record = VerificationRecord::evaluate(&expected, &computed, payload.is_some());
    tracing::info!(
        %channel,
        path = %path.display(),
        expected = record.content_hash_expected(),
        computed = record.content_hash_computed(),
        signature_valid = record.signature_valid(),
        "Artifact verification"
    );

    match (record.failure(), payload) {
        (None, Some(payload)) => Ok(VerifiedArtifact {
            channel,
            path: path.to_path_buf(),
            manifest: manifest.clone(),
            payload,
            record,
        }),
        (Some(err), _) => Err(err),
        (None, None) => Err(VerifyError::SignatureMismatch),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::update::manifest::UpdateStrategy;
    use tempfile::TempDir;

    fn signing_key() -> SigningKey {
        SigningKey::from_bytes(&[7u8; 32])
    }

    fn publisher() -> PublisherKey {
        PublisherKey::from_verifying_key(signing_key().verifying_key())
    }

    fn sha256_hex(data: &[u8]) -> String {
        hex::encode(Sha256::digest(data))
    }

    fn manifest_for(hash: &str) -> UpdateManifest {
        UpdateManifest {
            version: "5.1.0".to_string(),
            release_date: None,
            download_url: "https://web.example.com/Wallet-5.1.0.exe".to_string(),
            file_size: 11,
            content_hash: hash.to_string(),
            signature: None,
            bundle_version: None,
            change_log: None,
            update_strategy: UpdateStrategy::Silent,
            build_number: None,
        }
    }

    #[test]
    fn test_pinned_key_parses() {
        let key = PublisherKey::pinned().unwrap();
        assert_eq!(key.to_hex(), PUBLISHER_PUBLIC_KEY);
        assert!(PublisherKey::from_hex("abcd").is_err());
        assert!(PublisherKey::from_hex("zz").is_err());
    }

    #[test]
    fn test_sign_and_verify() {
        let text = "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08  Wallet-5.1.0.exe";
        let document = SignedDocument::sign(text, &signing_key());
        assert!(document.starts_with(SIGNED_MESSAGE_HEADER));

        let payload = verify_signature(&document, &publisher()).unwrap();
        assert_eq!(payload.text(), text);
        assert_eq!(
            payload.sha256().unwrap(),
            "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08"
        );
    }

    #[test]
    fn test_dash_escaping_round_trips() {
        let text = "-----not an armor line\n- list item\nplain";
        let document = SignedDocument::sign(text, &signing_key());
        assert!(document.contains("- -----not an armor line"));

        let payload = verify_signature(&document, &publisher()).unwrap();
        assert_eq!(payload.text(), text);
    }

    #[test]
    fn test_crlf_and_trailing_spaces_are_canonicalized() {
        let text = "line one\nline two";
        let document = SignedDocument::sign(text, &signing_key()).replace('\n', "  \r\n");
        assert!(verify_signature(&document, &publisher()).is_ok());
    }

    #[test]
    fn test_tampered_text_is_rejected() {
        let document = SignedDocument::sign("aaaa  file", &signing_key());
        let tampered = document.replace("aaaa", "bbbb");
        assert!(matches!(
            verify_signature(&tampered, &publisher()),
            Err(VerifyError::SignatureMismatch)
        ));
    }

    #[test]
    fn test_wrong_key_is_rejected() {
        let other = SigningKey::from_bytes(&[9u8; 32]);
        let document = SignedDocument::sign("payload", &other);
        assert!(matches!(
            verify_signature(&document, &publisher()),
            Err(VerifyError::SignatureMismatch)
        ));
    }

    #[test]
    fn test_malformed_documents() {
        let key = publisher();
        assert!(matches!(
            verify_signature("", &key),
            Err(VerifyError::MissingSignature)
        ));
        assert!(matches!(
            verify_signature("just text", &key),
            Err(VerifyError::MalformedSignature { .. })
        ));

        let unsigned = format!("{}\nHash: SHA256\n\nbody\n", SIGNED_MESSAGE_HEADER);
        assert!(matches!(
            verify_signature(&unsigned, &key),
            Err(VerifyError::MissingSignature)
        ));

        let bad_base64 = format!(
            "{}\n\nbody\n{}\n!!!\n{}\n",
            SIGNED_MESSAGE_HEADER, SIGNATURE_HEADER, SIGNATURE_FOOTER
        );
        assert!(matches!(
            verify_signature(&bad_base64, &key),
            Err(VerifyError::MalformedSignature { .. })
        ));

        let document = SignedDocument::sign("body", &signing_key());
        let md5 = document.replace("Hash: SHA256", "Hash: MD5");
        assert!(matches!(
            verify_signature(&md5, &key),
            Err(VerifyError::MalformedSignature { .. })
        ));
    }

    #[test]
    fn test_bundle_json_payload() {
        let digest = sha256_hex(b"metadata");
        let text = serde_json::json!({
            "fileName": "metadata.json",
            "sha256": digest,
            "size": 8,
            "generatedAt": "2024-12-01T00:00:00Z"
        })
        .to_string();
        let document = SignedDocument::sign(&text, &signing_key());
        let payload = verify_signature(&document, &publisher()).unwrap();

        let meta = payload.metadata().unwrap();
        assert_eq!(meta.file_name, "metadata.json");
        assert_eq!(payload.sha256().unwrap(), digest);
    }

    #[test]
    fn test_payload_without_digest() {
        let document = SignedDocument::sign("hello world", &signing_key());
        let payload = verify_signature(&document, &publisher()).unwrap();
        assert!(matches!(payload.sha256(), Err(VerifyError::InvalidPayload { .. })));
    }

    #[tokio::test]
    async fn test_content_hash() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("artifact.bin");
        tokio::fs::write(&path, b"hello world").await.unwrap();

        let expected = sha256_hex(b"hello world");
        assert_eq!(compute_sha256(&path).await.unwrap(), expected);
        assert!(verify_content_hash(&path, &expected.to_uppercase()).await.unwrap());
        assert!(!verify_content_hash(&path, &sha256_hex(b"other")).await.unwrap());

        let missing = temp.path().join("missing.bin");
        assert!(matches!(
            verify_content_hash(&missing, &expected).await,
            Err(VerifyError::ArtifactUnreadable { .. })
        ));
    }

    #[test]
    fn test_record_requires_both_checks() {
        let good = "ab".repeat(32);
        let bad = "cd".repeat(32);
        let cases = [
            (good.as_str(), true, true),
            (good.as_str(), false, false),
            (bad.as_str(), true, false),
            (bad.as_str(), false, false),
        ];
        for (computed, signature_valid, passes) in cases {
            let record = VerificationRecord::evaluate(&good, computed, signature_valid);
            assert_eq!(record.passed(), passes);
            assert_eq!(record.failure().is_none(), passes);
        }
    }

    #[tokio::test]
    async fn test_verify_artifact_combinations() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("5.1.0.exe");
        tokio::fs::write(&path, b"hello world").await.unwrap();
        let good_hash = sha256_hex(b"hello world");
        let bad_hash = sha256_hex(b"tampered");

        let signed = |hash: &str| {
            let doc = SignedDocument::sign(&format!("{}  Wallet-5.1.0.exe", hash), &signing_key());
            verify_signature(&doc, &publisher())
        };
        let forged = |hash: &str| {
            let doc = SignedDocument::sign(&format!("{}  Wallet-5.1.0.exe", hash), &SigningKey::from_bytes(&[1u8; 32]));
            verify_signature(&doc, &publisher())
        };

        // hash pass, signature pass
        let ok = verify_artifact(UpdateChannel::Native, &manifest_for(&good_hash), &path, signed(&good_hash))
            .await
            .unwrap();
        assert!(ok.record().passed());
        assert_eq!(ok.channel(), UpdateChannel::Native);

        // hash pass, signature fail
        let err = verify_artifact(UpdateChannel::Native, &manifest_for(&good_hash), &path, forged(&good_hash))
            .await
            .unwrap_err();
        assert!(matches!(err, VerifyError::SignatureMismatch));

        // hash fail, signature pass
        let err = verify_artifact(UpdateChannel::Native, &manifest_for(&bad_hash), &path, signed(&bad_hash))
            .await
            .unwrap_err();
        assert!(matches!(err, VerifyError::HashMismatch { .. }));

        // hash fail, signature fail
        let err = verify_artifact(UpdateChannel::Native, &manifest_for(&bad_hash), &path, forged(&bad_hash))
            .await
            .unwrap_err();
        assert!(matches!(err, VerifyError::HashMismatch { .. }));
    }

    #[tokio::test]
    async fn test_manifest_hash_must_match_signed_hash() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("5.1.0.exe");
        tokio::fs::write(&path, b"hello world").await.unwrap();
        let good_hash = sha256_hex(b"hello world");
        let other = sha256_hex(b"unrelated release");

        // Internally consistent manifest, but the publisher signed another digest
        let doc = SignedDocument::sign(&format!("{}  Wallet-5.1.0.exe", other), &signing_key());
        let result = verify_artifact(
            UpdateChannel::Native,
            &manifest_for(&good_hash),
            &path,
            verify_signature(&doc, &publisher()),
        )
        .await;
        assert!(matches!(result, Err(VerifyError::HashMismatch { .. })));
    }
}
