use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::scm::AuthenticatedUser;
use crate::store::paths;
use crate::store::{AppState, StoreError};

use super::error::PipelineError;

/// A registered user. Provider tokens held here make source-host calls on
/// behalf of pipelines the user owns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub user: String,
    #[serde(default)]
    pub emails: Vec<String>,
    #[serde(default)]
    pub avatar_url: String,
    /// provider → access token.
    #[serde(default)]
    pub keys: BTreeMap<String, String>,
}

impl User {
    pub fn token_for(&self, provider: &str) -> Option<&str> {
        self.keys.get(provider).map(String::as_str)
    }
}

/// Create or refresh the user record after an OAuth login.
#[tracing::instrument(skip(state, auth), fields(login = %auth.login, %provider), err)]
pub async fn upsert_login(
    state: &AppState,
    provider: &str,
    auth: &AuthenticatedUser,
) -> Result<User, PipelineError> {
    match find_by_login(state, provider, &auth.login).await {
        Ok(mut user) => {
            user.emails = auth.emails.clone();
            user.avatar_url = auth.avatar_url.clone();
            user.keys.insert(provider.to_owned(), auth.access_token.clone());
            save(state, &user).await?;
            Ok(user)
        }
        Err(PipelineError::NotFound(_)) => {
            let user = User {
                id: Uuid::new_v4().to_string(),
                user: auth.login.clone(),
                emails: auth.emails.clone(),
                avatar_url: auth.avatar_url.clone(),
                keys: BTreeMap::from([(provider.to_owned(), auth.access_token.clone())]),
            };
            let record = serde_json::to_vec(&user).map_err(anyhow::Error::from)?;
            state.kv.create(&paths::user(&user.id), record).await?;
            state
                .kv
                .create(
                    &paths::user_map(provider, &user.user),
                    user.id.clone().into_bytes(),
                )
                .await?;
            tracing::info!(user_id = %user.id, "new user created");
            Ok(user)
        }
        Err(e) => Err(e),
    }
}

pub async fn get(state: &AppState, id: &str) -> Result<User, PipelineError> {
    let bytes = match state.kv.get(&paths::user(id)).await {
        Ok(bytes) => bytes,
        Err(StoreError::NotFound(_)) => {
            return Err(PipelineError::NotFound(format!("user {id}")));
        }
        Err(e) => return Err(e.into()),
    };
    serde_json::from_slice(&bytes)
        .map_err(|e| PipelineError::Other(anyhow::anyhow!("corrupt user record {id}: {e}")))
}

pub async fn find_by_login(
    state: &AppState,
    provider: &str,
    login: &str,
) -> Result<User, PipelineError> {
    let id = match state.kv.get(&paths::user_map(provider, login)).await {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(StoreError::NotFound(_)) => {
            return Err(PipelineError::NotFound(format!("user {login}")));
        }
        Err(e) => return Err(e.into()),
    };
    get(state, &id).await
}

async fn save(state: &AppState, user: &User) -> Result<(), PipelineError> {
    let record = serde_json::to_vec(user).map_err(anyhow::Error::from)?;
    crate::store::put(state.kv.as_ref(), &paths::user(&user.id), record).await?;
    Ok(())
}
