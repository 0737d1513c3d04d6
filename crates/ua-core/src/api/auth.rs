use tracing::debug;

use crate::context::Context;
use crate::errors::Result;

impl Context {
    /// Credentials answering 401/407 challenges for `username`.
    ///
    /// An empty or missing `realm` matches any realm.
    pub fn add_authentication_info(
        &mut self,
        username: &str,
        userid: &str,
        passwd: Option<&str>,
        ha1: Option<&str>,
        realm: Option<&str>,
    ) -> Result<()> {
        self.auth.add(username, userid, passwd, ha1, realm)
    }

    pub fn clear_authentication_info(&mut self) {
        debug!("dropping {} credentials", self.auth.len());
        self.auth.clear();
    }
}
