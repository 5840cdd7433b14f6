//! Hand-rolled AWS SigV4 query presigning. Deliberately not delegated to the
//! `object_store` crate: that crate's own presign support is backend-specific
//! and we need a pure, offline-testable function (§6 requires presigned URLs
//! to be computable without any network round trip).

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use std::time::Duration;

use crate::errors::Error;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone)]
pub struct S3Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub region: String,
}

fn hmac_bytes(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts a key of any length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn signing_key(secret: &str, date_stamp: &str, region: &str, service: &str) -> Vec<u8> {
    let k_date = hmac_bytes(format!("AWS4{secret}").as_bytes(), date_stamp.as_bytes());
    let k_region = hmac_bytes(&k_date, region.as_bytes());
    let k_service = hmac_bytes(&k_region, service.as_bytes());
    hmac_bytes(&k_service, b"aws4_request")
}

fn uri_encode(value: &str, encode_slash: bool) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        let ch = byte as char;
        let unreserved = ch.is_ascii_alphanumeric() || matches!(ch, '-' | '.' | '_' | '~');
        if unreserved || (ch == '/' && !encode_slash) {
            out.push(ch);
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    out
}

/// Generates a presigned `GET` URL for `bucket/key` valid for `ttl` starting
/// at `now`. Pure and offline: no network access, no clock read beyond the
/// caller-supplied `now`.
pub fn presign_get_url(creds: &S3Credentials, endpoint: &str, bucket: &str, key: &str, ttl: Duration, now: DateTime<Utc>) -> Result<String, Error> {
    if ttl.as_secs() == 0 || ttl.as_secs() > 7 * 24 * 3600 {
        return Err(Error::InputInvalid("presign ttl must be between 1 second and 7 days".to_string()));
    }

    let service = "s3";
    let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
    let date_stamp = now.format("%Y%m%d").to_string();
    let host = format!("{bucket}.{endpoint}");
    let canonical_uri = format!("/{}", uri_encode(key, false));
    let credential_scope = format!("{date_stamp}/{}/{service}/aws4_request", creds.region);
    let credential = format!("{}/{credential_scope}", creds.access_key_id);

    let mut query_pairs = vec![
        ("X-Amz-Algorithm".to_string(), "AWS4-HMAC-SHA256".to_string()),
        ("X-Amz-Credential".to_string(), credential),
        ("X-Amz-Date".to_string(), amz_date.clone()),
        ("X-Amz-Expires".to_string(), ttl.as_secs().to_string()),
        ("X-Amz-SignedHeaders".to_string(), "host".to_string()),
    ];
    query_pairs.sort_by(|a, b| a.0.cmp(&b.0));
    let canonical_query_string = query_pairs
        .iter()
        .map(|(k, v)| format!("{}={}", uri_encode(k, true), uri_encode(v, true)))
        .collect::<Vec<_>>()
        .join("&");

    let canonical_headers = format!("host:{host}\n");
    let signed_headers = "host";
    let canonical_request = format!("GET\n{canonical_uri}\n{canonical_query_string}\n{canonical_headers}\n{signed_headers}\nUNSIGNED-PAYLOAD");

    let hashed_canonical_request = hex::encode(Sha256::digest(canonical_request.as_bytes()));
    let string_to_sign = format!("AWS4-HMAC-SHA256\n{amz_date}\n{credential_scope}\n{hashed_canonical_request}");

    let signing_key = signing_key(&creds.secret_access_key, &date_stamp, &creds.region, service);
    let signature = hex::encode(hmac_bytes(&signing_key, string_to_sign.as_bytes()));

    Ok(format!("https://{host}{canonical_uri}?{canonical_query_string}&X-Amz-Signature={signature}"))
}

mod hex {
    pub fn encode(bytes: impl AsRef<[u8]>) -> String {
        bytes.as_ref().iter().map(|b| format!("{b:02x}")).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn creds() -> S3Credentials {
        S3Credentials {
            access_key_id: "AKIDEXAMPLE".to_string(),
            secret_access_key: "wJalrXUtnFEMI/K7MDENG/bPxRfiCYEXAMPLEKEY".to_string(),
            region: "eu-west-2".to_string(),
        }
    }

    #[test]
    fn produces_a_stable_url_for_fixed_inputs() {
        let now = Utc.with_ymd_and_hms(2026, 1, 15, 12, 0, 0).unwrap();
        let url = presign_get_url(&creds(), "s3.amazonaws.com", "litp-reports", "cleanse/2026/report.zip", Duration::from_secs(3600), now).unwrap();
        assert!(url.starts_with("https://litp-reports.s3.amazonaws.com/cleanse/2026/report.zip?"));
        assert!(url.contains("X-Amz-Signature="));
        assert!(url.contains("X-Amz-Expires=3600"));
    }

    #[test]
    fn rejects_a_zero_or_excessive_ttl() {
        let now = Utc::now();
        assert!(presign_get_url(&creds(), "s3.amazonaws.com", "b", "k", Duration::from_secs(0), now).is_err());
        assert!(presign_get_url(&creds(), "s3.amazonaws.com", "b", "k", Duration::from_secs(8 * 24 * 3600), now).is_err());
    }

    #[test]
    fn different_keys_produce_different_signatures() {
        let now = Utc.with_ymd_and_hms(2026, 1, 15, 12, 0, 0).unwrap();
        let a = presign_get_url(&creds(), "s3.amazonaws.com", "b", "a.zip", Duration::from_secs(60), now).unwrap();
        let b = presign_get_url(&creds(), "s3.amazonaws.com", "b", "b.zip", Duration::from_secs(60), now).unwrap();
        assert_ne!(a, b);
    }
}
