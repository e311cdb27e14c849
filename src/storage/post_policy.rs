//! Browser-based POST upload policies, signed with AWS Signature Version 4.
//!
//! The S3 SDK can presign single requests but not POST policies, so the policy
//! document is built and signed here. The local backend uses [`verify`] to
//! check forms it receives against the same rules S3 applies.

use crate::storage::{SizeRange, StoreError, StoreResult};
use base64::{Engine as _, engine::general_purpose};
use chrono::{DateTime, SecondsFormat, Utc};
use hmac::{Hmac, Mac};
use serde_json::{Value, json};
use sha2::Sha256;
use std::{collections::BTreeMap, fmt};
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

pub const ALGORITHM: &str = "AWS4-HMAC-SHA256";
const SERVICE: &str = "s3";
const TERMINATOR: &str = "aws4_request";

/// Form fields that are never themselves covered by a policy condition.
const UNCONDITIONED_FIELDS: [&str; 3] = ["policy", "x-amz-signature", "file"];

/// Key material used to sign a policy.
#[derive(Clone)]
pub struct SigningCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
    pub region: String,
}

impl fmt::Debug for SigningCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningCredentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field("session_token", &self.session_token.as_ref().map(|_| "<redacted>"))
            .field("region", &self.region)
            .finish()
    }
}

/// What a POST upload is allowed to do.
#[derive(Clone, Debug)]
pub struct PostPolicy {
    pub bucket: String,
    pub key: String,
    pub expires_at: DateTime<Utc>,
    pub content_length: SizeRange,
}

impl PostPolicy {
    /// Build the policy document and return the form fields a client must send.
    pub fn sign(
        &self,
        credentials: &SigningCredentials,
        now: DateTime<Utc>,
    ) -> StoreResult<BTreeMap<String, String>> {
        let date = now.format("%Y%m%d").to_string();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let credential = format!(
            "{}/{}/{}/{}/{}",
            credentials.access_key_id, date, credentials.region, SERVICE, TERMINATOR
        );

        let mut conditions = vec![
            json!({ "bucket": self.bucket }),
            json!(["eq", "$key", self.key]),
            json!([
                "content-length-range",
                self.content_length.min,
                self.content_length.max
            ]),
            json!({ "x-amz-algorithm": ALGORITHM }),
            json!({ "x-amz-credential": credential }),
            json!({ "x-amz-date": amz_date }),
        ];
        if let Some(token) = &credentials.session_token {
            conditions.push(json!({ "x-amz-security-token": token }));
        }

        let document = json!({
            "expiration": self.expires_at.to_rfc3339_opts(SecondsFormat::Millis, true),
            "conditions": conditions,
        });
        let raw = serde_json::to_vec(&document).map_err(|e| StoreError::Signing(e.to_string()))?;
        let encoded = general_purpose::STANDARD.encode(raw);

        let key = signing_key(&credentials.secret_access_key, &date, &credentials.region, SERVICE)
            .map_err(|e| StoreError::Signing(e.to_string()))?;
        let signature = hmac_sha256(&key, encoded.as_bytes())
            .map(hex::encode)
            .map_err(|e| StoreError::Signing(e.to_string()))?;

        let mut fields = BTreeMap::new();
        fields.insert("key".to_string(), self.key.clone());
        fields.insert("policy".to_string(), encoded);
        fields.insert("x-amz-algorithm".to_string(), ALGORITHM.to_string());
        fields.insert("x-amz-credential".to_string(), credential);
        fields.insert("x-amz-date".to_string(), amz_date);
        fields.insert("x-amz-signature".to_string(), signature);
        if let Some(token) = &credentials.session_token {
            fields.insert("x-amz-security-token".to_string(), token.clone());
        }
        Ok(fields)
    }
}

/// Derive the SigV4 signing key for one day, region and service.
pub fn signing_key(
    secret_access_key: &str,
    date: &str,
    region: &str,
    service: &str,
) -> Result<Vec<u8>, hmac::digest::InvalidLength> {
    let k_date = hmac_sha256(format!("AWS4{secret_access_key}").as_bytes(), date.as_bytes())?;
    let k_region = hmac_sha256(&k_date, region.as_bytes())?;
    let k_service = hmac_sha256(&k_region, service.as_bytes())?;
    hmac_sha256(&k_service, TERMINATOR.as_bytes())
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<Vec<u8>, hmac::digest::InvalidLength> {
    let mut mac = HmacSha256::new_from_slice(key)?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("missing form field `{0}`")]
    MissingField(&'static str),

    #[error("malformed policy: {0}")]
    Malformed(String),

    #[error("unsupported signing algorithm `{0}`")]
    Algorithm(String),

    #[error("policy signature does not match")]
    SignatureMismatch,

    #[error("policy expired at {0}")]
    Expired(DateTime<Utc>),

    #[error("form field `{0}` does not satisfy the policy")]
    ConditionFailed(String),
}

/// The constraints a verified form is bound to.
#[derive(Clone, Debug)]
pub struct VerifiedPolicy {
    pub bucket: String,
    pub key: String,
    pub content_length: SizeRange,
    pub expires_at: DateTime<Utc>,
}

/// Check a submitted form the way S3 does.
///
/// `fields` must use lowercase names. The signature is checked before the
/// policy body is trusted; every submitted field other than the policy, the
/// signature and the file must be covered by a condition.
pub fn verify(
    fields: &BTreeMap<String, String>,
    credentials: &SigningCredentials,
    now: DateTime<Utc>,
) -> Result<VerifiedPolicy, PolicyError> {
    let field = |name: &'static str| {
        fields
            .get(name)
            .map(String::as_str)
            .ok_or(PolicyError::MissingField(name))
    };

    let algorithm = field("x-amz-algorithm")?;
    if algorithm != ALGORITHM {
        return Err(PolicyError::Algorithm(algorithm.to_string()));
    }

    let encoded = field("policy")?;
    let signature = hex::decode(field("x-amz-signature")?)
        .map_err(|_| PolicyError::SignatureMismatch)?;

    let credential = field("x-amz-credential")?;
    let scope: Vec<&str> = credential.split('/').collect();
    let &[access_key_id, date, region, service, terminator] = scope.as_slice() else {
        return Err(PolicyError::Malformed("credential scope".into()));
    };
    if access_key_id != credentials.access_key_id
        || region != credentials.region
        || service != SERVICE
        || terminator != TERMINATOR
    {
        return Err(PolicyError::SignatureMismatch);
    }

    let key = signing_key(&credentials.secret_access_key, date, region, SERVICE)
        .map_err(|e| PolicyError::Malformed(e.to_string()))?;
    let mut mac =
        HmacSha256::new_from_slice(&key).map_err(|e| PolicyError::Malformed(e.to_string()))?;
    mac.update(encoded.as_bytes());
    mac.verify_slice(&signature)
        .map_err(|_| PolicyError::SignatureMismatch)?;

    let raw = general_purpose::STANDARD
        .decode(encoded)
        .map_err(|e| PolicyError::Malformed(e.to_string()))?;
    let document: Value =
        serde_json::from_slice(&raw).map_err(|e| PolicyError::Malformed(e.to_string()))?;

    let expiration = document
        .get("expiration")
        .and_then(Value::as_str)
        .ok_or_else(|| PolicyError::Malformed("expiration".into()))?;
    let expires_at = DateTime::parse_from_rfc3339(expiration)
        .map_err(|e| PolicyError::Malformed(e.to_string()))?
        .with_timezone(&Utc);
    if expires_at <= now {
        return Err(PolicyError::Expired(expires_at));
    }

    let conditions = document
        .get("conditions")
        .and_then(Value::as_array)
        .ok_or_else(|| PolicyError::Malformed("conditions".into()))?;

    let mut bucket = None;
    let mut content_length = None;
    let mut covered: Vec<String> = Vec::new();

    for condition in conditions {
        match condition {
            Value::Object(map) => {
                for (name, expected) in map {
                    let expected = expected
                        .as_str()
                        .ok_or_else(|| PolicyError::Malformed(format!("condition `{name}`")))?;
                    if name == "bucket" {
                        bucket = Some(expected.to_string());
                        continue;
                    }
                    let name = name.to_ascii_lowercase();
                    if fields.get(&name).map(String::as_str) != Some(expected) {
                        return Err(PolicyError::ConditionFailed(name));
                    }
                    covered.push(name);
                }
            }
            Value::Array(items) => match items.as_slice() {
                [Value::String(op), Value::Number(min), Value::Number(max)]
                    if op == "content-length-range" =>
                {
                    let (Some(min), Some(max)) = (min.as_u64(), max.as_u64()) else {
                        return Err(PolicyError::Malformed("content-length-range".into()));
                    };
                    content_length = Some(SizeRange { min, max });
                }
                [Value::String(op), Value::String(target), Value::String(expected)] => {
                    let name = target.trim_start_matches('$').to_ascii_lowercase();
                    let actual = fields.get(&name).map(String::as_str);
                    let satisfied = match op.as_str() {
                        "eq" => actual == Some(expected.as_str()),
                        "starts-with" => actual.is_some_and(|v| v.starts_with(expected.as_str())),
                        other => {
                            return Err(PolicyError::Malformed(format!("operator `{other}`")));
                        }
                    };
                    if !satisfied {
                        return Err(PolicyError::ConditionFailed(name));
                    }
                    covered.push(name);
                }
                _ => return Err(PolicyError::Malformed("condition shape".into())),
            },
            _ => return Err(PolicyError::Malformed("condition shape".into())),
        }
    }

    for name in fields.keys() {
        if !UNCONDITIONED_FIELDS.contains(&name.as_str()) && !covered.contains(name) {
            return Err(PolicyError::ConditionFailed(name.clone()));
        }
    }

    Ok(VerifiedPolicy {
        bucket: bucket.ok_or_else(|| PolicyError::Malformed("bucket condition".into()))?,
        key: field("key")?.to_string(),
        content_length: content_length
            .ok_or_else(|| PolicyError::Malformed("content-length-range".into()))?,
        expires_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn credentials() -> SigningCredentials {
        SigningCredentials {
            access_key_id: "AKIDEXAMPLE".into(),
            secret_access_key: "local-secret".into(),
            session_token: None,
            region: "us-east-1".into(),
        }
    }

    fn policy(now: DateTime<Utc>) -> PostPolicy {
        PostPolicy {
            bucket: "avatars".into(),
            key: "pending/avatars/abc.webp".into(),
            expires_at: now + Duration::minutes(3),
            content_length: SizeRange {
                min: 1,
                max: 2 * 1024 * 1024,
            },
        }
    }

    #[test]
    fn signing_key_matches_published_sigv4_vector() {
        let key = signing_key(
            "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY",
            "20120215",
            "us-east-1",
            "iam",
        )
        .unwrap();
        assert_eq!(
            hex::encode(key),
            "f4780e2d9f65fa895f9c67b32ce1baf0b0d8a43505a000a1a9e090d414db404d"
        );
    }

    #[test]
    fn signed_fields_pin_key_and_credential_scope() {
        let now = Utc::now();
        let fields = policy(now).sign(&credentials(), now).unwrap();

        assert_eq!(fields["key"], "pending/avatars/abc.webp");
        assert_eq!(fields["x-amz-algorithm"], ALGORITHM);
        assert!(
            fields["x-amz-credential"]
                .starts_with(&format!("AKIDEXAMPLE/{}/us-east-1/s3/", now.format("%Y%m%d")))
        );
        assert_eq!(fields["x-amz-signature"].len(), 64);

        let raw = general_purpose::STANDARD.decode(&fields["policy"]).unwrap();
        let doc: Value = serde_json::from_slice(&raw).unwrap();
        let conditions = doc["conditions"].as_array().unwrap();
        assert!(conditions.contains(&json!(["content-length-range", 1, 2097152])));
        assert!(conditions.contains(&json!(["eq", "$key", "pending/avatars/abc.webp"])));
    }

    #[test]
    fn verify_accepts_untampered_form() {
        let now = Utc::now();
        let fields = policy(now).sign(&credentials(), now).unwrap();

        let verified = verify(&fields, &credentials(), now).unwrap();
        assert_eq!(verified.bucket, "avatars");
        assert_eq!(verified.key, "pending/avatars/abc.webp");
        assert_eq!(verified.content_length, SizeRange { min: 1, max: 2097152 });
    }

    #[test]
    fn verify_rejects_redirected_key() {
        let now = Utc::now();
        let mut fields = policy(now).sign(&credentials(), now).unwrap();
        fields.insert("key".into(), "avatars/someone-else.webp".into());

        assert!(matches!(
            verify(&fields, &credentials(), now),
            Err(PolicyError::ConditionFailed(name)) if name == "key"
        ));
    }

    #[test]
    fn verify_rejects_foreign_secret() {
        let now = Utc::now();
        let fields = policy(now).sign(&credentials(), now).unwrap();
        let other = SigningCredentials {
            secret_access_key: "another-secret".into(),
            ..credentials()
        };

        assert!(matches!(
            verify(&fields, &other, now),
            Err(PolicyError::SignatureMismatch)
        ));
    }

    #[test]
    fn verify_rejects_expired_policy() {
        let now = Utc::now();
        let fields = policy(now).sign(&credentials(), now).unwrap();

        assert!(matches!(
            verify(&fields, &credentials(), now + Duration::minutes(4)),
            Err(PolicyError::Expired(_))
        ));
    }

    #[test]
    fn verify_rejects_fields_outside_policy() {
        let now = Utc::now();
        let mut fields = policy(now).sign(&credentials(), now).unwrap();
        fields.insert("content-type".into(), "text/html".into());

        assert!(matches!(
            verify(&fields, &credentials(), now),
            Err(PolicyError::ConditionFailed(name)) if name == "content-type"
        ));
    }
}
