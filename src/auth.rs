//! Accounts and login sessions.
//!
//! Passwords are stored as Argon2id PHC strings. A login creates a row in
//! `sessions`; the browser receives `<session_id>.<signature>` in a cookie,
//! where the signature is the hex HMAC-SHA256 of the session id under the
//! server secret (`auth.session_secret_env`). A token is accepted only if
//! the signature verifies and the session row exists, is not revoked, and
//! has not expired.

use anyhow::Result;
use argon2::password_hash::{rand_core::OsRng, PasswordHash, SaltString};
use argon2::{Argon2, PasswordHasher, PasswordVerifier};
use chrono::{Duration, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use sqlx::{Row, SqlitePool};

use crate::error::AppError;
use crate::models::{Session, User};

type HmacSha256 = Hmac<Sha256>;

const INVALID_CREDENTIALS: &str = "invalid email or password";

// ============ Passwords ============

pub fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| anyhow::anyhow!("password hashing failed: {}", e))?;
    Ok(hash.to_string())
}

/// Returns `false` for a wrong password or a malformed stored hash.
pub fn verify_password(password: &str, stored_hash: &str) -> bool {
    match PasswordHash::new(stored_hash) {
        Ok(parsed) => Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok(),
        Err(_) => false,
    }
}

fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

fn is_valid_email(email: &str) -> bool {
    match email.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && domain.contains('.')
                && !domain.starts_with('.')
                && !domain.ends_with('.')
                && !email.chars().any(char::is_whitespace)
        }
        None => false,
    }
}

fn user_from_row(row: &sqlx::sqlite::SqliteRow) -> User {
    User {
        id: row.get("id"),
        email: row.get("email"),
        name: row.get("name"),
        created_at: row.get("created_at"),
    }
}

// ============ Users ============

pub async fn create_user(
    pool: &SqlitePool,
    email: &str,
    name: &str,
    password: &str,
    min_password_len: usize,
) -> Result<User> {
    let email = normalize_email(email);
    if !is_valid_email(&email) {
        return Err(AppError::BadRequest(format!("invalid email address: {}", email)).into());
    }
    if password.chars().count() < min_password_len {
        return Err(AppError::BadRequest(format!(
            "password must be at least {} characters",
            min_password_len
        ))
        .into());
    }

    let exists: bool = sqlx::query_scalar("SELECT COUNT(*) > 0 FROM users WHERE email = ?")
        .bind(&email)
        .fetch_one(pool)
        .await?;
    if exists {
        return Err(AppError::Conflict(format!("user already exists: {}", email)).into());
    }

    let name = match name.trim() {
        "" => email.split('@').next().unwrap_or_default().to_string(),
        n => n.to_string(),
    };

    let user = User {
        id: uuid::Uuid::new_v4().to_string(),
        email,
        name,
        created_at: Utc::now().timestamp(),
    };
    let password_hash = hash_password(password)?;

    sqlx::query(
        "INSERT INTO users (id, email, name, password_hash, created_at) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(&user.id)
    .bind(&user.email)
    .bind(&user.name)
    .bind(&password_hash)
    .bind(user.created_at)
    .execute(pool)
    .await?;

    tracing::info!(user_id = %user.id, email = %user.email, "user created");
    Ok(user)
}

/// Replaces a user's password and revokes all their sessions.
pub async fn set_password(
    pool: &SqlitePool,
    email: &str,
    password: &str,
    min_password_len: usize,
) -> Result<()> {
    if password.chars().count() < min_password_len {
        return Err(AppError::BadRequest(format!(
            "password must be at least {} characters",
            min_password_len
        ))
        .into());
    }
    let email = normalize_email(email);
    let user_id: Option<String> = sqlx::query_scalar("SELECT id FROM users WHERE email = ?")
        .bind(&email)
        .fetch_optional(pool)
        .await?;
    let user_id =
        user_id.ok_or_else(|| AppError::NotFound(format!("user not found: {}", email)))?;

    let password_hash = hash_password(password)?;
    sqlx::query("UPDATE users SET password_hash = ? WHERE id = ?")
        .bind(&password_hash)
        .bind(&user_id)
        .execute(pool)
        .await?;
    sqlx::query("UPDATE sessions SET revoked = 1 WHERE user_id = ?")
        .bind(&user_id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn list_users(pool: &SqlitePool) -> Result<Vec<User>> {
    let rows = sqlx::query("SELECT id, email, name, created_at FROM users ORDER BY email ASC")
        .fetch_all(pool)
        .await?;
    Ok(rows.iter().map(user_from_row).collect())
}

/// Checks credentials. Unknown email and wrong password fail identically.
pub async fn authenticate(pool: &SqlitePool, email: &str, password: &str) -> Result<User> {
    let email = normalize_email(email);
    let row = sqlx::query(
        "SELECT id, email, name, created_at, password_hash FROM users WHERE email = ?",
    )
    .bind(&email)
    .fetch_optional(pool)
    .await?;

    let row = match row {
        Some(row) => row,
        None => {
            tracing::info!(email = %email, "login rejected: unknown email");
            return Err(AppError::Unauthorized(INVALID_CREDENTIALS.to_string()).into());
        }
    };

    let stored: String = row.get("password_hash");
    if !verify_password(password, &stored) {
        tracing::info!(email = %email, "login rejected: wrong password");
        return Err(AppError::Unauthorized(INVALID_CREDENTIALS.to_string()).into());
    }

    Ok(user_from_row(&row))
}

// ============ Session tokens ============

/// Signs and verifies session tokens.
#[derive(Clone)]
pub struct SessionSigner {
    key: Vec<u8>,
}

impl SessionSigner {
    pub fn new(secret: &str) -> Self {
        Self {
            key: secret.as_bytes().to_vec(),
        }
    }

    fn mac(&self) -> HmacSha256 {
        HmacSha256::new_from_slice(&self.key).expect("HMAC can take key of any size")
    }

    pub fn sign(&self, session_id: &str) -> String {
        let mut mac = self.mac();
        mac.update(session_id.as_bytes());
        format!("{}.{}", session_id, hex::encode(mac.finalize().into_bytes()))
    }

    /// Returns the session id when the signature is valid.
    pub fn verify<'a>(&self, token: &'a str) -> Option<&'a str> {
        let (session_id, signature) = token.rsplit_once('.')?;
        let signature = hex::decode(signature).ok()?;
        let mut mac = self.mac();
        mac.update(session_id.as_bytes());
        mac.verify_slice(&signature).ok()?;
        Some(session_id)
    }
}

pub async fn create_session(pool: &SqlitePool, user_id: &str, ttl_hours: u64) -> Result<Session> {
    let now = Utc::now();
    let expires = now + Duration::hours(ttl_hours as i64);
    let session = Session {
        id: uuid::Uuid::new_v4().to_string(),
        user_id: user_id.to_string(),
        created_at: now.timestamp(),
        expires_at: expires.timestamp(),
    };

    sqlx::query(
        "INSERT INTO sessions (id, user_id, created_at, expires_at, revoked) VALUES (?, ?, ?, ?, 0)",
    )
    .bind(&session.id)
    .bind(&session.user_id)
    .bind(session.created_at)
    .bind(session.expires_at)
    .execute(pool)
    .await?;

    Ok(session)
}

/// Resolves a cookie token to its live session and user.
pub async fn lookup_session(
    pool: &SqlitePool,
    signer: &SessionSigner,
    token: &str,
) -> Result<Option<(Session, User)>> {
    let session_id = match signer.verify(token) {
        Some(id) => id,
        None => return Ok(None),
    };

    let row = sqlx::query(
        r#"
        SELECT s.id AS session_id, s.user_id, s.created_at AS session_created_at, s.expires_at,
               u.id, u.email, u.name, u.created_at
        FROM sessions s
        JOIN users u ON u.id = s.user_id
        WHERE s.id = ? AND s.revoked = 0 AND s.expires_at > ?
        "#,
    )
    .bind(session_id)
    .bind(Utc::now().timestamp())
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|row| {
        let session = Session {
            id: row.get("session_id"),
            user_id: row.get("user_id"),
            created_at: row.get("session_created_at"),
            expires_at: row.get("expires_at"),
        };
        (session, user_from_row(&row))
    }))
}

pub async fn revoke_session(pool: &SqlitePool, session_id: &str) -> Result<()> {
    sqlx::query("UPDATE sessions SET revoked = 1 WHERE id = ?")
        .bind(session_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Deletes expired and revoked sessions; returns how many were removed.
pub async fn purge_expired(pool: &SqlitePool) -> Result<u64> {
    let result = sqlx::query("DELETE FROM sessions WHERE revoked = 1 OR expires_at <= ?")
        .bind(Utc::now().timestamp())
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{db, migrate};
    use tempfile::TempDir;

    async fn pool() -> (TempDir, SqlitePool) {
        let tmp = TempDir::new().unwrap();
        let pool = db::connect_path(&tmp.path().join("auth.sqlite")).await.unwrap();
        migrate::apply_schema(&pool).await.unwrap();
        (tmp, pool)
    }

    #[test]
    fn test_password_hash_roundtrip() {
        let hash = hash_password("correct horse").unwrap();
        assert!(hash.starts_with("$argon2"));
        assert!(verify_password("correct horse", &hash));
        assert!(!verify_password("wrong horse", &hash));
        assert!(!verify_password("correct horse", "not-a-hash"));
    }

    #[test]
    fn test_signer_rejects_tampering() {
        let signer = SessionSigner::new("0123456789abcdef-secret");
        let token = signer.sign("abc-123");
        assert_eq!(signer.verify(&token), Some("abc-123"));

        let forged = token.replace("abc-123", "abc-124");
        assert_eq!(signer.verify(&forged), None);
        assert_eq!(signer.verify("abc-123"), None);
        assert_eq!(signer.verify("abc-123.zz"), None);

        let other = SessionSigner::new("another-secret-of-16+");
        assert_eq!(other.verify(&token), None);
    }

    #[test]
    fn test_email_validation() {
        assert!(is_valid_email("eng@plant.example"));
        assert!(!is_valid_email("eng@localhost"));
        assert!(!is_valid_email("@plant.example"));
        assert!(!is_valid_email("e ng@plant.example"));
    }

    #[tokio::test]
    async fn test_create_and_authenticate() {
        let (_tmp, pool) = pool().await;
        let user = create_user(&pool, " Ana@Plant.Example ", "", "s3cretpass", 8)
            .await
            .unwrap();
        assert_eq!(user.email, "ana@plant.example");
        assert_eq!(user.name, "ana");

        let dup = create_user(&pool, "ana@plant.example", "Ana", "s3cretpass", 8).await;
        let app: AppError = dup.unwrap_err().into();
        assert_eq!(app.code(), "conflict");

        let short = create_user(&pool, "bo@plant.example", "Bo", "short", 8).await;
        let app: AppError = short.unwrap_err().into();
        assert_eq!(app.code(), "bad_request");

        let ok = authenticate(&pool, "ANA@plant.example", "s3cretpass").await.unwrap();
        assert_eq!(ok.id, user.id);

        let wrong = authenticate(&pool, "ana@plant.example", "nope-nope").await.unwrap_err();
        let unknown = authenticate(&pool, "zed@plant.example", "nope-nope").await.unwrap_err();
        assert_eq!(wrong.to_string(), unknown.to_string());
    }

    #[tokio::test]
    async fn test_session_lifecycle() {
        let (_tmp, pool) = pool().await;
        let signer = SessionSigner::new("0123456789abcdef-secret");
        let user = create_user(&pool, "ana@plant.example", "Ana", "s3cretpass", 8)
            .await
            .unwrap();

        let session = create_session(&pool, &user.id, 1).await.unwrap();
        let token = signer.sign(&session.id);

        let (found, found_user) = lookup_session(&pool, &signer, &token).await.unwrap().unwrap();
        assert_eq!(found.id, session.id);
        assert_eq!(found_user.email, "ana@plant.example");

        revoke_session(&pool, &session.id).await.unwrap();
        assert!(lookup_session(&pool, &signer, &token).await.unwrap().is_none());
        assert_eq!(purge_expired(&pool).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_password_change_revokes_sessions() {
        let (_tmp, pool) = pool().await;
        let signer = SessionSigner::new("0123456789abcdef-secret");
        let user = create_user(&pool, "ana@plant.example", "Ana", "s3cretpass", 8)
            .await
            .unwrap();
        let session = create_session(&pool, &user.id, 1).await.unwrap();
        let token = signer.sign(&session.id);

        set_password(&pool, "ana@plant.example", "n3w-password", 8)
            .await
            .unwrap();
        assert!(lookup_session(&pool, &signer, &token).await.unwrap().is_none());
        assert!(authenticate(&pool, "ana@plant.example", "n3w-password").await.is_ok());
        assert!(set_password(&pool, "zed@plant.example", "n3w-password", 8)
            .await
            .is_err());
    }
}
