//! `lumen token`: mint credentials for manual testing.

use anyhow::{Context, Result, bail};
use serde_json::Value;

use crate::auth::Signer;

/// Issue a join token for `topic`, and sign `session` when given.
pub fn issue(signer: &Signer, topic: &str, session: Option<&str>) -> Result<Issued> {
    let session = match session {
        Some(json) => {
            let value: Value = serde_json::from_str(json).context("--session is not valid JSON")?;
            let Value::Object(map) = value else {
                bail!("--session must be a JSON object");
            };
            Some(signer.sign_session(&map))
        }
        None => None,
    };
    Ok(Issued {
        token: signer.issue_token(topic),
        session,
    })
}

#[derive(Debug)]
pub struct Issued {
    pub token: String,
    pub session: Option<String>,
}

impl Issued {
    pub fn print(&self) {
        println!("_csrf_token = {}", self.token);
        if let Some(session) = &self.session {
            println!("session     = {session}");
        }
    }
}
