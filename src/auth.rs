//! One-time codes and bearer sessions shared by the user, teacher and student
//! login flows.
//!
//! Bearer tokens are random and only their SHA-256 digest is stored, so a
//! leaked database does not leak live sessions.

use chrono::{DateTime, Duration, Utc};
use rusqlite::{Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountKind {
    User,
    Teacher,
    Student,
}

impl AccountKind {
    pub fn as_str(self) -> &'static str {
        match self {
            AccountKind::User => "user",
            AccountKind::Teacher => "teacher",
            AccountKind::Student => "student",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(AccountKind::User),
            "teacher" => Some(AccountKind::Teacher),
            "student" => Some(AccountKind::Student),
            _ => None,
        }
    }

    fn table(self) -> &'static str {
        match self {
            AccountKind::User => "users",
            AccountKind::Teacher => "teachers",
            AccountKind::Student => "students",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OtpCheck {
    Valid,
    Mismatch,
    Expired,
}

/// Six decimal digits, never with a leading zero.
pub fn generate_otp() -> String {
    let n = Uuid::new_v4().as_u128() % 900_000 + 100_000;
    n.to_string()
}

pub fn issue_otp(
    conn: &Connection,
    kind: AccountKind,
    account_id: &str,
    ttl_secs: i64,
    now: DateTime<Utc>,
) -> rusqlite::Result<String> {
    let code = generate_otp();
    let expires = (now + Duration::seconds(ttl_secs)).timestamp();
    conn.execute(
        &format!("UPDATE {} SET otp = ?, otp_expires = ? WHERE id = ?", kind.table()),
        (&code, expires, account_id),
    )?;
    Ok(code)
}

pub fn load_otp(
    conn: &Connection,
    kind: AccountKind,
    account_id: &str,
) -> rusqlite::Result<(Option<String>, Option<i64>)> {
    conn.query_row(
        &format!("SELECT otp, otp_expires FROM {} WHERE id = ?", kind.table()),
        [account_id],
        |r| Ok((r.get(0)?, r.get(1)?)),
    )
}

/// A code stays usable up to and including its expiry second.
pub fn verify_otp(
    stored: Option<&str>,
    expires_at: Option<i64>,
    given: &str,
    now: DateTime<Utc>,
) -> OtpCheck {
    let Some(stored) = stored else {
        return OtpCheck::Mismatch;
    };
    if stored != given.trim() {
        return OtpCheck::Mismatch;
    }
    match expires_at {
        Some(ts) if ts >= now.timestamp() => OtpCheck::Valid,
        _ => OtpCheck::Expired,
    }
}

pub fn clear_otp(conn: &Connection, kind: AccountKind, account_id: &str) -> rusqlite::Result<()> {
    conn.execute(
        &format!("UPDATE {} SET otp = NULL, otp_expires = NULL WHERE id = ?", kind.table()),
        [account_id],
    )?;
    Ok(())
}

pub fn hash_token(token: &str) -> String {
    format!("{:x}", Sha256::digest(token.as_bytes()))
}

#[derive(Debug, Clone)]
pub struct Session {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

pub fn create_session(
    conn: &Connection,
    kind: AccountKind,
    account_id: &str,
    ttl_hours: i64,
    now: DateTime<Utc>,
) -> rusqlite::Result<Session> {
    conn.execute(
        "DELETE FROM sessions WHERE expires_at < ?",
        [now.timestamp()],
    )?;

    let token = format!(
        "{}{}",
        Uuid::new_v4().simple(),
        Uuid::new_v4().simple()
    );
    let expires_at = now + Duration::hours(ttl_hours);
    conn.execute(
        "INSERT INTO sessions(token_hash, account_kind, account_id, expires_at, created_at)
         VALUES(?, ?, ?, ?, ?)",
        (
            hash_token(&token),
            kind.as_str(),
            account_id,
            expires_at.timestamp(),
            now.to_rfc3339(),
        ),
    )?;
    Ok(Session { token, expires_at })
}

/// Looks up a live session. Expired and unknown tokens both resolve to `None`.
pub fn resolve_session(
    conn: &Connection,
    token: &str,
    now: DateTime<Utc>,
) -> rusqlite::Result<Option<(AccountKind, String)>> {
    let row: Option<(String, String, i64)> = conn
        .query_row(
            "SELECT account_kind, account_id, expires_at FROM sessions WHERE token_hash = ?",
            [hash_token(token)],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()?;
    let Some((kind, id, expires_at)) = row else {
        return Ok(None);
    };
    if expires_at < now.timestamp() {
        return Ok(None);
    }
    Ok(AccountKind::parse(&kind).map(|k| (k, id)))
}

pub fn revoke_sessions(conn: &Connection, kind: AccountKind, account_id: &str) -> rusqlite::Result<()> {
    conn.execute(
        "DELETE FROM sessions WHERE account_kind = ? AND account_id = ?",
        (kind.as_str(), account_id),
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn otp_is_six_digits() {
        for _ in 0..200 {
            let code = generate_otp();
            assert_eq!(code.len(), 6);
            assert!(code.chars().all(|c| c.is_ascii_digit()));
            assert!(!code.starts_with('0'));
        }
    }

    #[test]
    fn otp_verification_states() {
        let now = Utc::now();
        let later = now.timestamp() + 60;
        assert_eq!(verify_otp(Some("123456"), Some(later), "123456", now), OtpCheck::Valid);
        assert_eq!(verify_otp(Some("123456"), Some(later), " 123456 ", now), OtpCheck::Valid);
        assert_eq!(verify_otp(Some("123456"), Some(later), "654321", now), OtpCheck::Mismatch);
        assert_eq!(
            verify_otp(Some("123456"), Some(now.timestamp() - 1), "123456", now),
            OtpCheck::Expired
        );
        assert_eq!(
            verify_otp(Some("123456"), Some(now.timestamp()), "123456", now),
            OtpCheck::Valid
        );
        assert_eq!(verify_otp(None, Some(later), "123456", now), OtpCheck::Mismatch);
        assert_eq!(verify_otp(Some("123456"), None, "123456", now), OtpCheck::Expired);
    }

    #[test]
    fn token_hash_is_hex_sha256() {
        let h = hash_token("abc");
        assert_eq!(
            h,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
