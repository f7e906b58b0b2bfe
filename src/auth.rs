use std::sync::Arc;

use argon2::password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::database::{Database, StoreError};

const ACCESS_TOKEN_EXPIRY_HOURS: i64 = 1;

/// Errors `AuthService` can raise, mapped 1:1 onto `ScoreboardError` at the
/// HTTP boundary (`api/auth.rs`) rather than collapsed through `anyhow`, so
/// a duplicate registration reaches the caller as 409 rather than 400.
#[derive(Debug)]
pub enum AuthServiceError {
    InvalidInput(String),
    InvalidCredentials,
    DuplicateIdentity,
    Internal(String),
}

impl From<StoreError> for AuthServiceError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::DuplicateIdentity => Self::DuplicateIdentity,
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<AuthServiceError> for crate::error::ScoreboardError {
    fn from(err: AuthServiceError) -> Self {
        match err {
            AuthServiceError::InvalidInput(m) => Self::MissingFields(m),
            AuthServiceError::InvalidCredentials => {
                Self::InvalidToken("invalid email or password".into())
            }
            AuthServiceError::DuplicateIdentity => {
                Self::DuplicateIdentity("username or email already registered".into())
            }
            AuthServiceError::Internal(m) => Self::Internal(m),
        }
    }
}

/// Public view of an identity, safe to hand back over the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub username: String,
}

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub username: String,
    pub email: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct RegisterResponse {
    pub identity: String,
    pub username: String,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub access_token: String,
    pub expires_in: i64,
    pub identity: String,
}

/// JWT claims carried on the access token.
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub username: String,
    pub exp: i64,
    pub iat: i64,
    pub token_type: String,
}

/// Registers and authenticates identities against the Store, and mints
/// the bearer tokens the rest of the service trusts.
pub struct AuthService {
    jwt_secret: String,
    store: Arc<Database>,
}

impl AuthService {
    pub fn new(jwt_secret: String, store: Arc<Database>) -> Self {
        Self { jwt_secret, store }
    }

    fn hash_password(&self, password: &str) -> Result<String, AuthServiceError> {
        let salt = SaltString::generate(&mut OsRng);
        Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .map(|hash| hash.to_string())
            .map_err(|e| AuthServiceError::Internal(format!("failed to hash password: {e}")))
    }

    fn verify_password(&self, password: &str, hash: &str) -> Result<bool, AuthServiceError> {
        let parsed = PasswordHash::new(hash)
            .map_err(|e| AuthServiceError::Internal(format!("stored hash is malformed: {e}")))?;
        Ok(Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok())
    }

    pub async fn register(&self, request: RegisterRequest) -> Result<RegisterResponse, AuthServiceError> {
        if request.username.trim().is_empty() || request.email.trim().is_empty() {
            return Err(AuthServiceError::InvalidInput(
                "username and email are required".into(),
            ));
        }
        if request.password.len() < 8 {
            return Err(AuthServiceError::InvalidInput(
                "password must be at least 8 characters".into(),
            ));
        }

        let password_hash = self.hash_password(&request.password)?;
        let id = Uuid::new_v4().to_string();

        let record = self
            .store
            .create_identity(&id, &request.username, &request.email, &password_hash)
            .await?;

        Ok(RegisterResponse {
            identity: record.id,
            username: record.username,
        })
    }

    pub async fn login(&self, request: LoginRequest) -> Result<LoginResponse, AuthServiceError> {
        let identity = self
            .store
            .get_identity_by_email(&request.email)
            .await?
            .ok_or(AuthServiceError::InvalidCredentials)?;

        if !self.verify_password(&request.password, &identity.password_hash)? {
            return Err(AuthServiceError::InvalidCredentials);
        }

        let access_token = self.generate_access_token(&identity.id, &identity.username)?;

        Ok(LoginResponse {
            access_token,
            expires_in: ACCESS_TOKEN_EXPIRY_HOURS * 3600,
            identity: identity.id,
        })
    }

    fn generate_access_token(&self, identity: &str, username: &str) -> Result<String, AuthServiceError> {
        let now = Utc::now();
        let claims = Claims {
            sub: identity.to_string(),
            username: username.to_string(),
            iat: now.timestamp(),
            exp: (now + Duration::hours(ACCESS_TOKEN_EXPIRY_HOURS)).timestamp(),
            token_type: "access".to_string(),
        };

        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.jwt_secret.as_bytes()),
        )
        .map_err(|e| AuthServiceError::Internal(format!("failed to sign access token: {e}")))
    }

    pub fn validate_token(&self, token: &str) -> Result<Claims, AuthServiceError> {
        let claims = decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.jwt_secret.as_bytes()),
            &Validation::default(),
        )
        .map(|data| data.claims)
        .map_err(|e| AuthServiceError::Internal(format!("invalid token: {e}")))?;

        if claims.token_type != "access" {
            return Err(AuthServiceError::Internal("not an access token".into()));
        }
        Ok(claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{Database, PoolConfig};

    async fn service() -> AuthService {
        let db = Database::connect("sqlite::memory:", PoolConfig::default())
            .await
            .unwrap();
        db.migrate().await.unwrap();
        AuthService::new("test-jwt-secret".into(), Arc::new(db))
    }

    #[tokio::test]
    async fn register_then_login_round_trips() {
        let auth = service().await;
        let registered = auth
            .register(RegisterRequest {
                username: "alice".into(),
                email: "alice@example.com".into(),
                password: "hunter2222".into(),
            })
            .await
            .unwrap();

        let login = auth
            .login(LoginRequest {
                email: "alice@example.com".into(),
                password: "hunter2222".into(),
            })
            .await
            .unwrap();

        assert_eq!(login.identity, registered.identity);
        let claims = auth.validate_token(&login.access_token).unwrap();
        assert_eq!(claims.sub, registered.identity);
    }

    #[tokio::test]
    async fn login_with_wrong_password_is_rejected() {
        let auth = service().await;
        auth.register(RegisterRequest {
            username: "bob".into(),
            email: "bob@example.com".into(),
            password: "correct-horse".into(),
        })
        .await
        .unwrap();

        let err = auth
            .login(LoginRequest {
                email: "bob@example.com".into(),
                password: "wrong-password".into(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AuthServiceError::InvalidCredentials));
    }

    #[tokio::test]
    async fn duplicate_registration_is_rejected() {
        let auth = service().await;
        auth.register(RegisterRequest {
            username: "carol".into(),
            email: "carol@example.com".into(),
            password: "password123".into(),
        })
        .await
        .unwrap();

        let err = auth
            .register(RegisterRequest {
                username: "carol".into(),
                email: "someone-else@example.com".into(),
                password: "password123".into(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AuthServiceError::DuplicateIdentity));
    }

    #[tokio::test]
    async fn short_password_is_rejected_before_touching_the_store() {
        let auth = service().await;
        let err = auth
            .register(RegisterRequest {
                username: "dave".into(),
                email: "dave@example.com".into(),
                password: "short".into(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AuthServiceError::InvalidInput(_)));
    }
}
