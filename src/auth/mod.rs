pub mod credentials;

use std::{
    collections::HashSet,
    sync::Arc,
};

use axum::http::StatusCode;
use base64::{
    Engine as _,
    engine::general_purpose::URL_SAFE_NO_PAD,
};
use hmac::{
    Hmac,
    Mac,
};
use serde::{
    Deserialize,
    Serialize,
};
use sha2::Sha256;

use crate::clock::Clock;

type HmacSha256 = Hmac<Sha256>;

/// Authenticated identity extracted from a verified bearer token.
/// Lives only for the duration of one request.
#[derive(Debug, Clone, PartialEq)]
pub struct Principal {
    pub subject: String,
    pub roles: HashSet<String>,
    pub scopes: HashSet<String>,
    pub expires_at: u64,
}

impl Principal {
    /// All of `required` must be present in the principal's scopes.
    pub fn ensure_scopes(&self, required: &HashSet<String>) -> Result<(), AuthError> {
        for scope in required {
            if !self.scopes.contains(scope) {
                return Err(AuthError::Forbidden {
                    scope: scope.clone(),
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    Missing,
    Malformed,
    InvalidSignature,
    Expired,
    NotYetValid,
    MissingClaim(&'static str),
    Forbidden { scope: String },
}

impl AuthError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Missing => "auth_missing",
            Self::Malformed => "auth_malformed",
            Self::InvalidSignature => "invalid_signature",
            Self::Expired => "token_expired",
            Self::NotYetValid => "token_not_yet_valid",
            Self::MissingClaim(_) => "missing_claim",
            Self::Forbidden { .. } => "forbidden",
        }
    }

    pub fn message(&self) -> String {
        match self {
            Self::Missing => "Missing authorization header".to_string(),
            Self::Malformed => "Invalid authorization header format".to_string(),
            Self::InvalidSignature => "Token signature verification failed".to_string(),
            Self::Expired => "token expired".to_string(),
            Self::NotYetValid => "Token is not yet valid".to_string(),
            Self::MissingClaim(claim) => format!("Token is missing required claim: {claim}"),
            Self::Forbidden { scope } => format!("Required scope: {scope}"),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::Forbidden { .. } => StatusCode::FORBIDDEN,
            _ => StatusCode::UNAUTHORIZED,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Header {
    alg: String,
    typ: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Claims {
    sub: Option<String>,
    iat: Option<u64>,
    exp: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    nbf: Option<u64>,
    #[serde(default)]
    roles: Vec<String>,
    #[serde(default)]
    scopes: Vec<String>,
}

/// Signs and verifies three-part `header.payload.signature` bearer tokens.
///
/// Only HMAC-SHA256 is wired; the permitted-algorithm set exists so a token
/// carrying any other `alg` is rejected before signature work happens.
pub struct TokenAuthority {
    secret: Vec<u8>,
    permitted_algs: HashSet<String>,
    clock_skew_secs: u64,
    token_ttl_secs: u64,
    clock: Arc<dyn Clock>,
}

impl TokenAuthority {
    pub fn new(
        secret: impl Into<Vec<u8>>,
        permitted_algs: HashSet<String>,
        clock_skew_secs: u64,
        token_ttl_secs: u64,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            secret: secret.into(),
            permitted_algs,
            clock_skew_secs,
            token_ttl_secs,
            clock,
        }
    }

    pub fn token_ttl_secs(&self) -> u64 {
        self.token_ttl_secs
    }

    /// Issue a signed access token for `subject`.
    pub fn issue(&self, subject: &str, roles: &[String], scopes: &[String]) -> String {
        let now = self.clock.now_secs();
        let claims = Claims {
            sub: Some(subject.to_string()),
            iat: Some(now),
            exp: Some(now + self.token_ttl_secs),
            nbf: None,
            roles: roles.to_vec(),
            scopes: scopes.to_vec(),
        };
        self.sign(&claims)
    }

    fn sign(&self, claims: &Claims) -> String {
        let header = Header {
            alg: "HS256".to_string(),
            typ: "JWT".to_string(),
        };
        // serde_json can only fail on non-string map keys; these are structs.
        let header_b64 = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&header).unwrap_or_default());
        let claims_b64 = URL_SAFE_NO_PAD.encode(serde_json::to_vec(claims).unwrap_or_default());
        let signing_input = format!("{header_b64}.{claims_b64}");
        let signature = URL_SAFE_NO_PAD.encode(self.mac(signing_input.as_bytes()));
        format!("{signing_input}.{signature}")
    }

    /// Verify a bearer token and extract the principal.
    ///
    /// Each step is fatal on mismatch: segment structure, permitted
    /// algorithm, signature (constant-time), expiry and not-before with the
    /// configured skew, then required claims.
    pub fn verify(&self, token: &str) -> Result<Principal, AuthError> {
        let mut segments = token.split('.');
        let (header_b64, claims_b64, signature_b64) = match (
            segments.next(),
            segments.next(),
            segments.next(),
            segments.next(),
        ) {
            (Some(h), Some(c), Some(s), None) if !h.is_empty() && !c.is_empty() => (h, c, s),
            _ => return Err(AuthError::Malformed),
        };

        let header_raw = URL_SAFE_NO_PAD
            .decode(header_b64)
            .map_err(|_| AuthError::Malformed)?;
        let header: Header =
            serde_json::from_slice(&header_raw).map_err(|_| AuthError::Malformed)?;

        if !self.permitted_algs.contains(&header.alg) {
            return Err(AuthError::InvalidSignature);
        }

        let signing_input = format!("{header_b64}.{claims_b64}");
        let expected = self.mac(signing_input.as_bytes());
        let provided = URL_SAFE_NO_PAD
            .decode(signature_b64)
            .map_err(|_| AuthError::Malformed)?;
        if !timing_safe_eq(&expected, &provided) {
            return Err(AuthError::InvalidSignature);
        }

        let claims_raw = URL_SAFE_NO_PAD
            .decode(claims_b64)
            .map_err(|_| AuthError::Malformed)?;
        let claims: Claims =
            serde_json::from_slice(&claims_raw).map_err(|_| AuthError::Malformed)?;

        let now = self.clock.now_secs();
        let exp = claims.exp.ok_or(AuthError::MissingClaim("exp"))?;
        if now >= exp + self.clock_skew_secs {
            return Err(AuthError::Expired);
        }
        if let Some(nbf) = claims.nbf
            && now + self.clock_skew_secs < nbf
        {
            return Err(AuthError::NotYetValid);
        }

        let subject = claims.sub.ok_or(AuthError::MissingClaim("sub"))?;

        Ok(Principal {
            subject,
            roles: claims.roles.into_iter().collect(),
            scopes: claims.scopes.into_iter().collect(),
            expires_at: exp,
        })
    }

    fn mac(&self, input: &[u8]) -> Vec<u8> {
        let mut mac =
            HmacSha256::new_from_slice(&self.secret).expect("HMAC can take key of any size");
        mac.update(input);
        mac.finalize().into_bytes().to_vec()
    }
}

fn timing_safe_eq(a: &[u8], b: &[u8]) -> bool {
    let max = a.len().max(b.len());
    let mut diff = (a.len() ^ b.len()) as u8;

    for idx in 0..max {
        let av = *a.get(idx).unwrap_or(&0);
        let bv = *b.get(idx).unwrap_or(&0);
        diff |= av ^ bv;
    }

    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine as _;
    use std::sync::atomic::{
        AtomicU64,
        Ordering,
    };

    #[derive(Debug)]
    struct ManualClock {
        now_ms: AtomicU64,
    }

    impl ManualClock {
        fn at_secs(secs: u64) -> Self {
            Self {
                now_ms: AtomicU64::new(secs * 1_000),
            }
        }

        fn advance_secs(&self, secs: u64) {
            self.now_ms.fetch_add(secs * 1_000, Ordering::SeqCst);
        }
    }

    impl Clock for ManualClock {
        fn now_ms(&self) -> u64 {
            self.now_ms.load(Ordering::SeqCst)
        }
    }

    fn authority(clock: Arc<dyn Clock>) -> TokenAuthority {
        TokenAuthority::new(
            b"test-secret".to_vec(),
            HashSet::from(["HS256".to_string()]),
            5,
            1_800,
            clock,
        )
    }

    #[test]
    fn issued_token_round_trips() {
        let clock = Arc::new(ManualClock::at_secs(1_000_000));
        let authority = authority(clock);

        let token = authority.issue(
            "alice",
            &["user".to_string()],
            &["read".to_string(), "write".to_string()],
        );
        let principal = authority.verify(&token).expect("token should verify");

        assert_eq!(principal.subject, "alice");
        assert!(principal.scopes.contains("read"));
        assert!(principal.scopes.contains("write"));
        assert_eq!(principal.expires_at, 1_000_000 + 1_800);
    }

    #[test]
    fn expired_token_is_rejected() {
        let clock = Arc::new(ManualClock::at_secs(1_000_000));
        let authority = authority(clock.clone());

        let token = authority.issue("alice", &[], &[]);
        clock.advance_secs(1_800 + 6);

        assert_eq!(authority.verify(&token), Err(AuthError::Expired));
    }

    #[test]
    fn expiry_honors_clock_skew() {
        let clock = Arc::new(ManualClock::at_secs(1_000_000));
        let authority = authority(clock.clone());

        let token = authority.issue("alice", &[], &[]);
        // One second past exp but within the 5s skew tolerance.
        clock.advance_secs(1_801);

        assert!(authority.verify(&token).is_ok());
    }

    #[test]
    fn flipped_bit_in_any_segment_fails() {
        let clock = Arc::new(ManualClock::at_secs(1_000_000));
        let authority = authority(clock);
        let token = authority.issue("alice", &[], &["read".to_string()]);

        let segments: Vec<&str> = token.split('.').collect();
        for idx in 0..3 {
            let mut tampered: Vec<String> =
                segments.iter().map(ToString::to_string).collect();
            let mut bytes = tampered[idx].clone().into_bytes();
            // Flip within base64url alphabet so decoding still succeeds.
            bytes[1] = if bytes[1] == b'A' { b'B' } else { b'A' };
            tampered[idx] = String::from_utf8(bytes).unwrap();
            let tampered = tampered.join(".");

            assert!(
                authority.verify(&tampered).is_err(),
                "segment {idx} tamper should fail"
            );
        }
    }

    #[test]
    fn wrong_segment_count_is_malformed() {
        let clock = Arc::new(ManualClock::at_secs(1_000_000));
        let authority = authority(clock);

        assert_eq!(authority.verify("abc.def"), Err(AuthError::Malformed));
        assert_eq!(
            authority.verify("a.b.c.d"),
            Err(AuthError::Malformed)
        );
        assert_eq!(authority.verify(""), Err(AuthError::Malformed));
    }

    #[test]
    fn unpermitted_algorithm_is_rejected() {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::at_secs(1_000_000));
        let issuer = TokenAuthority::new(
            b"test-secret".to_vec(),
            HashSet::from(["HS256".to_string(), "none".to_string()]),
            5,
            1_800,
            clock.clone(),
        );
        let verifier = authority(clock);

        // Forge a token whose header claims alg=none; the strict verifier
        // must reject it even though the signature bytes check out.
        let header_b64 =
            URL_SAFE_NO_PAD.encode(br#"{"alg":"none","typ":"JWT"}"#);
        let claims_b64 = URL_SAFE_NO_PAD
            .encode(br#"{"sub":"mallory","exp":9999999999}"#);
        let signing_input = format!("{header_b64}.{claims_b64}");
        let signature = URL_SAFE_NO_PAD.encode(issuer.mac(signing_input.as_bytes()));
        let token = format!("{signing_input}.{signature}");

        assert_eq!(verifier.verify(&token), Err(AuthError::InvalidSignature));
    }

    #[test]
    fn not_yet_valid_token_is_rejected() {
        let clock = Arc::new(ManualClock::at_secs(1_000_000));
        let authority = authority(clock.clone());

        let claims = Claims {
            sub: Some("alice".to_string()),
            iat: Some(1_000_000),
            exp: Some(1_010_000),
            nbf: Some(1_000_100),
            roles: vec![],
            scopes: vec![],
        };
        let token = authority.sign(&claims);

        assert_eq!(authority.verify(&token), Err(AuthError::NotYetValid));

        clock.advance_secs(100);
        assert!(authority.verify(&token).is_ok());
    }

    #[test]
    fn missing_subject_is_rejected() {
        let clock = Arc::new(ManualClock::at_secs(1_000_000));
        let authority = authority(clock);

        let claims = Claims {
            sub: None,
            iat: Some(1_000_000),
            exp: Some(1_010_000),
            ..Claims::default()
        };
        let token = authority.sign(&claims);

        assert_eq!(
            authority.verify(&token),
            Err(AuthError::MissingClaim("sub"))
        );
    }

    #[test]
    fn scope_enforcement() {
        let principal = Principal {
            subject: "alice".to_string(),
            roles: HashSet::new(),
            scopes: HashSet::from(["read".to_string()]),
            expires_at: 0,
        };

        assert!(principal
            .ensure_scopes(&HashSet::from(["read".to_string()]))
            .is_ok());
        let err = principal
            .ensure_scopes(&HashSet::from(["write".to_string()]))
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::FORBIDDEN);
    }
}
