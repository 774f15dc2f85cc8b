pub mod login;
pub mod status;

use axum::Json;
use axum::extract::{FromRequest, Request};
use serde::de::DeserializeOwned;
use validator::Validate;

use crate::error::ServerError;

/// JSON body that passed [`Validate`].
#[derive(Debug, Clone, Copy, Default)]
pub struct Valid<T>(pub T);

impl<T, S> FromRequest<S> for Valid<T>
where
    T: DeserializeOwned + Validate,
    S: Send + Sync,
{
    type Rejection = ServerError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state).await?;
        value.validate()?;
        Ok(Valid(value))
    }
}

/// State backed by the sample in-memory directory.
#[cfg(test)]
pub(crate) fn state(directory: &crate::ldap::testing::InMemoryDirectory) -> crate::AppState {
    use std::sync::Arc;

    use crate::config::{Configuration, GroupSearch, Ldap, UserSearch};
    use crate::ldap::testing::InMemoryDirectory;

    let ldap = Ldap {
        urls: vec!["ldap://primary".into()],
        base: "dc=example,dc=com".into(),
        user_dn: Some(InMemoryDirectory::SERVICE_DN.into()),
        password: Some(InMemoryDirectory::SERVICE_PASSWORD.into()),
        user_search: Some(UserSearch {
            base: "ou=users".into(),
            ..Default::default()
        }),
        group_search: Some(GroupSearch {
            base: "ou=groups".into(),
            ..Default::default()
        }),
        ..Default::default()
    };
    let engine = crate::assembly::build_engine_with(&ldap, directory.connector())
        .expect("sample configuration is valid");

    let mut config = Configuration::default();
    config.ldap = Some(ldap);

    crate::AppState {
        config: Arc::new(config),
        engine: Arc::new(engine),
        handlers: Default::default(),
        metrics: None,
    }
}
