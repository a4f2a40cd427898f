use super::config::ClientConfig;
use crate::core::{DbError, Result, ResultCode};
use crate::protocol::{MessageType, encode_frame};
use base64::Engine;
use base64::alphabet;
use base64::engine::general_purpose::{GeneralPurpose, NO_PAD};
use std::fmt;

/// Fixed bcrypt salt shared with the server's credential store.
const CREDENTIAL_SALT: &str = "7EqJtq98hPqEX7fNZaFWoO";
const CREDENTIAL_COST: u32 = 10;

/// Admin message header following the frame header.
pub const ADMIN_HEADER_SIZE: usize = 16;
const ADMIN_RESULT_CODE: usize = 1;
const ADMIN_COMMAND: usize = 2;
const ADMIN_FIELD_COUNT: usize = 3;

const AUTHENTICATE: u8 = 0;
const FIELD_USER: u8 = 0;
const FIELD_CREDENTIAL: u8 = 3;

/// User name and hashed password sent on every new connection.
///
/// The password is hashed once, when the cluster is created; the plain
/// text is not kept.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    user: String,
    credential: String,
}

impl Credentials {
    pub fn new(user: &str, password: &str) -> Result<Self> {
        if user.is_empty() {
            return Err(DbError::InvalidConfig("user name cannot be empty".to_string()));
        }
        Ok(Self {
            user: user.to_string(),
            credential: hash_password(password)?,
        })
    }

    /// Credentials configured in `config`, if any.
    pub fn from_config(config: &ClientConfig) -> Result<Option<Self>> {
        match (&config.user, &config.password) {
            (Some(user), password) => {
                Self::new(user, password.as_deref().unwrap_or_default()).map(Some)
            }
            (None, Some(_)) => Err(DbError::InvalidConfig(
                "password given without a user".to_string(),
            )),
            (None, None) => Ok(None),
        }
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    /// Framed authenticate request.
    pub fn login_request(&self) -> Result<Vec<u8>> {
        let mut body = vec![0u8; ADMIN_HEADER_SIZE];
        body[ADMIN_COMMAND] = AUTHENTICATE;
        body[ADMIN_FIELD_COUNT] = 2;
        write_field(&mut body, FIELD_USER, self.user.as_bytes())?;
        write_field(&mut body, FIELD_CREDENTIAL, self.credential.as_bytes())?;
        encode_frame(MessageType::Admin, &body)
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("credential", &"***")
            .finish()
    }
}

/// Checks the admin reply to a login; a non-zero result code rejects it.
pub fn check_login_reply(body: &[u8]) -> Result<()> {
    if body.len() < ADMIN_HEADER_SIZE {
        return Err(DbError::Protocol(format!(
            "admin reply is {} bytes, expected at least {}",
            body.len(),
            ADMIN_HEADER_SIZE
        )));
    }
    match ResultCode(i32::from(body[ADMIN_RESULT_CODE])) {
        ResultCode::OK => Ok(()),
        code => Err(DbError::Server {
            code,
            message: format!("login rejected: {}", code.name()),
        }),
    }
}

fn hash_password(password: &str) -> Result<String> {
    let salt_engine = GeneralPurpose::new(&alphabet::BCRYPT, NO_PAD);
    let salt: [u8; 16] = salt_engine
        .decode(CREDENTIAL_SALT)
        .map_err(|e| DbError::Fatal(format!("credential salt: {}", e)))?
        .try_into()
        .map_err(|_| DbError::Fatal("credential salt must be 16 bytes".to_string()))?;
    let parts = bcrypt::hash_with_salt(password, CREDENTIAL_COST, salt)
        .map_err(|e| DbError::InvalidConfig(format!("cannot hash password: {}", e)))?;
    Ok(parts.format_for_version(bcrypt::Version::TwoA))
}

fn write_field(body: &mut Vec<u8>, id: u8, value: &[u8]) -> Result<()> {
    let len = u32::try_from(value.len() + 1)
        .map_err(|_| DbError::InvalidArgument("admin field too large".to_string()))?;
    body.extend_from_slice(&len.to_be_bytes());
    body.push(id);
    body.extend_from_slice(value);
    Ok(())
}
