//! Password hashing and the bulk user file format

use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine as _};
use rand::Rng;
use std::path::Path;

use super::models::{Permission, User};

/// Hash a password with a fresh random salt, returning `(hash, salt)`.
/// The hash is argon2 in its encoded form, which embeds the salt as well.
pub fn hash(password: &str) -> Result<(String, String), argon2::Error> {
    let salt: [u8; 32] = rand::thread_rng().gen();
    let config = argon2::Config::default();
    let hashed = argon2::hash_encoded(password.as_bytes(), &salt, &config)?;
    Ok((hashed, STANDARD_NO_PAD.encode(salt)))
}

/// Check a candidate password against a stored hash and salt
pub fn validate(hashed: &str, salt: &str, candidate: &str) -> bool {
    // $argon2i$v=19$m=4096,t=3,p=1$<salt>$<hash>
    if hashed.split('$').nth(4) != Some(salt) {
        return false;
    }
    argon2::verify_encoded(hashed, candidate.as_bytes()).unwrap_or(false)
}

/// Create a user with a freshly hashed password
pub fn new_user(name: &str, password: &str, permission: Permission) -> Result<User, argon2::Error> {
    let (password, salt) = hash(password)?;
    Ok(User {
        name: name.to_string(),
        password,
        salt,
        permission,
    })
}

/// Parse `username:password` lines into users with single-file permission
pub fn parse_users(content: &str) -> Result<Vec<User>> {
    let mut users = Vec::new();
    for (idx, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let mut parts = line.split(':');
        let (Some(name), Some(password), None) = (parts.next(), parts.next(), parts.next()) else {
            anyhow::bail!("Line {} in users file not formatted correctly: {:?}", idx + 1, line);
        };
        let (name, password) = (name.trim(), password.trim());
        if name.is_empty() || password.is_empty() {
            anyhow::bail!("Line {} in users file has an empty field", idx + 1);
        }
        let user = new_user(name, password, Permission::FILE)
            .with_context(|| format!("Failed to hash the password of {}", name))?;
        users.push(user);
    }
    Ok(users)
}

pub fn read_users(path: &Path) -> Result<Vec<User>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read users file {}", path.display()))?;
    parse_users(&content)
}
