use anyhow::Result;
use base64::engine::general_purpose::URL_SAFE_NO_PAD as B64_URL;
use base64::Engine as _;
use rand::rngs::OsRng;
use rand::RngCore;
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};

use crate::db;

const SESSION_TTL_MS: i64 = 7 * 24 * 60 * 60 * 1000;

/// The identity the rest of the core works with: who the caller is and
/// what tier their account carries. Produced by `resolve_bearer`.
#[derive(Clone, Debug)]
pub struct Principal {
    pub user_id: i64,
    pub subscription_status: String,
}

fn token_hash(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    let mut out = String::with_capacity(64);
    for b in digest {
        use std::fmt::Write;
        let _ = write!(&mut out, "{:02x}", b);
    }
    out
}

// Tokens are opaque: 32 random bytes, url-safe base64 on the wire, only the
// SHA-256 stored. A leaked sessions table yields nothing replayable.
pub fn issue_token(conn: &Connection, user_id: i64) -> Result<String> {
    let mut raw = [0u8; 32];
    OsRng.fill_bytes(&mut raw);
    let token = B64_URL.encode(raw);

    let now = db::now_ms();
    conn.execute(
        r#"INSERT INTO sessions (token_hash, user_id, created_at, expires_at)
           VALUES (?1, ?2, ?3, ?4)"#,
        params![token_hash(&token), user_id, now, now + SESSION_TTL_MS],
    )?;
    Ok(token)
}

pub fn revoke_token(conn: &Connection, token: &str) -> Result<()> {
    conn.execute(
        r#"DELETE FROM sessions WHERE token_hash = ?1"#,
        params![token_hash(token)],
    )?;
    Ok(())
}

fn bearer_token(authorization: &str) -> Option<&str> {
    let rest = authorization.strip_prefix("Bearer ")?;
    let token = rest.trim();
    if token.is_empty() {
        return None;
    }
    Some(token)
}

/// Resolve an `Authorization` header to a principal. `None` means the
/// credential is missing, malformed, unknown or expired; the api layer
/// turns that into 401 without distinguishing which.
pub fn resolve_bearer(conn: &Connection, authorization: &str) -> Result<Option<Principal>> {
    let Some(token) = bearer_token(authorization) else {
        return Ok(None);
    };

    let user_id: Option<i64> = conn
        .query_row(
            r#"SELECT user_id FROM sessions WHERE token_hash = ?1 AND expires_at > ?2"#,
            params![token_hash(token), db::now_ms()],
            |row| row.get(0),
        )
        .optional()?;
    let Some(user_id) = user_id else {
        return Ok(None);
    };

    let Some(user) = db::get_user(conn, user_id)? else {
        return Ok(None);
    };

    Ok(Some(Principal {
        user_id: user.id,
        subscription_status: user.subscription_status,
    }))
}

/// The entitlement gate: a pure function of persisted account state. The
/// request path never calls out to subscription providers; a separate
/// verify/webhook process keeps `subscription_status` current.
pub fn is_entitled(principal: &Principal, allowed_statuses: &[String]) -> bool {
    allowed_statuses
        .iter()
        .any(|s| s == &principal.subscription_status)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bearer_parsing_requires_scheme_and_token() {
        assert!(bearer_token("").is_none());
        assert!(bearer_token("Bearer ").is_none());
        assert!(bearer_token("Basic abc").is_none());
        assert_eq!(bearer_token("Bearer abc"), Some("abc"));
    }

    #[test]
    fn issued_token_resolves_and_revokes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let conn = db::open(dir.path()).expect("open");
        let user = db::create_user(&conn, "t@example.com", "x", "t").expect("user");

        let token = issue_token(&conn, user.id).expect("issue");
        let header = format!("Bearer {token}");

        let principal = resolve_bearer(&conn, &header)
            .expect("resolve")
            .expect("principal");
        assert_eq!(principal.user_id, user.id);
        assert_eq!(principal.subscription_status, "free");

        revoke_token(&conn, &token).expect("revoke");
        assert!(resolve_bearer(&conn, &header).expect("resolve").is_none());
    }

    #[test]
    fn garbage_token_does_not_resolve() {
        let dir = tempfile::tempdir().expect("tempdir");
        let conn = db::open(dir.path()).expect("open");
        assert!(resolve_bearer(&conn, "Bearer nope")
            .expect("resolve")
            .is_none());
    }

    #[test]
    fn entitlement_is_a_membership_check() {
        let pro = Principal {
            user_id: 1,
            subscription_status: "pro".to_string(),
        };
        let free = Principal {
            user_id: 2,
            subscription_status: "free".to_string(),
        };
        let allowed = vec!["pro".to_string()];
        assert!(is_entitled(&pro, &allowed));
        assert!(!is_entitled(&free, &allowed));
    }
}
