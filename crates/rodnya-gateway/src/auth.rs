use argon2::{
    Argon2, PasswordHash, PasswordHasher, PasswordVerifier, password_hash::SaltString,
};
use rand_core::OsRng;
use tracing::{info, warn};

use rodnya_db::{Database, is_unique_violation};
use rodnya_db::models::UserRow;
use rodnya_types::events::ServerEvent;

const MIN_CREDENTIAL_LEN: usize = 3;

pub fn hash_password(password: &str) -> anyhow::Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| anyhow::anyhow!("password hashing failed: {}", e))?
        .to_string();
    Ok(hash)
}

pub fn verify_password(hash: &str, password: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(hash) else {
        return false;
    };
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok()
}

/// Handle a `register` command. Always produces a response event; failures
/// carry a human-readable message per the protocol contract.
pub fn register(db: &Database, username: &str, password: &str) -> ServerEvent {
    let fail = |message: &str| ServerEvent::RegisterResponse {
        success: false,
        message: message.to_string(),
    };

    if username.len() < MIN_CREDENTIAL_LEN || password.len() < MIN_CREDENTIAL_LEN {
        return fail("Username and password must be at least 3 characters");
    }

    match db.get_user_by_username(username) {
        Ok(Some(_)) => return fail("Username already taken"),
        Ok(None) => {}
        Err(e) => {
            warn!("register: user lookup failed: {}", e);
            return fail("Server error");
        }
    }

    let hash = match hash_password(password) {
        Ok(h) => h,
        Err(e) => {
            warn!("register: {}", e);
            return fail("Server error");
        }
    };

    let now = chrono::Utc::now().to_rfc3339();
    match db.create_user(username, &hash, &now) {
        Ok(()) => {
            info!("User registered: {}", username);
            ServerEvent::RegisterResponse {
                success: true,
                message: "Registration successful".to_string(),
            }
        }
        // Concurrent registration of the same name loses the insert race.
        Err(e) if is_unique_violation(&e) => fail("Username already taken"),
        Err(e) => {
            warn!("register: insert failed: {}", e);
            fail("Server error")
        }
    }
}

/// Verify credentials for a `login` command. Returns the user row on
/// success, a response message on failure.
pub fn login(db: &Database, username: &str, password: &str) -> Result<UserRow, String> {
    if username.is_empty() || password.is_empty() {
        return Err("Username and password are required".to_string());
    }

    let user = match db.get_user_by_username(username) {
        Ok(Some(user)) => user,
        Ok(None) => return Err("User not found".to_string()),
        Err(e) => {
            warn!("login: user lookup failed: {}", e);
            return Err("Server error".to_string());
        }
    };

    if !verify_password(&user.password, password) {
        return Err("Wrong password".to_string());
    }

    Ok(user)
}
