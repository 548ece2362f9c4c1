use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::PgWireResult;
use tracing::debug;

/// Single shared password for every login; the user name is not checked.
#[derive(Debug)]
pub struct AllotmentAuthSource {
    password: String,
}

impl AllotmentAuthSource {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

#[async_trait]
impl AuthSource for AllotmentAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        debug!(user = login.user().unwrap_or("-"), "password login");
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}
