//! MercadoLibre REST API client.
//!
//! Stateless with respect to tenants: every call takes the access token of
//! the user it acts for. Token lifecycle lives in the OAuth service.

use mercado_lister_core::MlSite;
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use tracing::instrument;
use url::Url;

use super::transport::Transport;
use super::types::{Category, CategoryAttribute, CategoryPrediction, MlUser};
use super::MercadoLibreError;
use crate::config::MercadoLibreConfig;

/// Largest `limit` accepted by domain discovery.
const MAX_PREDICTIONS: u8 = 8;

/// MercadoLibre REST API client.
#[derive(Debug, Clone)]
pub struct MercadoLibreClient {
    transport: Transport,
    api_base_url: String,
}

impl MercadoLibreClient {
    #[must_use]
    pub fn new(config: &MercadoLibreConfig, transport: Transport) -> Self {
        Self {
            transport,
            api_base_url: config.api_base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Profile of the account the token belongs to.
    ///
    /// # Errors
    ///
    /// Returns `MercadoLibreError::Unauthorized` if the token is rejected.
    #[instrument(skip(self, access_token))]
    pub async fn users_me(&self, access_token: &SecretString) -> Result<MlUser, MercadoLibreError> {
        let url = self.url(&["users", "me"])?;
        self.get_json("users.me", url, access_token).await
    }

    /// Predict categories on `site` for a free text product title.
    ///
    /// # Errors
    ///
    /// Returns `MercadoLibreError` if the request fails.
    #[instrument(skip(self, access_token))]
    pub async fn predict_category(
        &self,
        access_token: &SecretString,
        site: MlSite,
        query: &str,
        limit: u8,
    ) -> Result<Vec<CategoryPrediction>, MercadoLibreError> {
        let mut url = self.url(&["sites", site.id(), "domain_discovery", "search"])?;
        url.query_pairs_mut()
            .append_pair("q", query)
            .append_pair("limit", &limit.clamp(1, MAX_PREDICTIONS).to_string());
        self.get_json("categories.predict", url, access_token).await
    }

    /// Category detail including its path from the root.
    ///
    /// # Errors
    ///
    /// Returns `MercadoLibreError::NotFound` for unknown category ids.
    #[instrument(skip(self, access_token))]
    pub async fn category(
        &self,
        access_token: &SecretString,
        category_id: &str,
    ) -> Result<Category, MercadoLibreError> {
        let url = self.url(&["categories", category_id])?;
        self.get_json("categories.get", url, access_token).await
    }

    /// Attributes a listing in the category can or must carry.
    ///
    /// # Errors
    ///
    /// Returns `MercadoLibreError::NotFound` for unknown category ids.
    #[instrument(skip(self, access_token))]
    pub async fn category_attributes(
        &self,
        access_token: &SecretString,
        category_id: &str,
    ) -> Result<Vec<CategoryAttribute>, MercadoLibreError> {
        let url = self.url(&["categories", category_id, "attributes"])?;
        self.get_json("categories.attributes", url, access_token).await
    }

    /// Build `{api}/seg/seg/...` with each segment percent-encoded. `.` and
    /// `..` segments are still resolved by `url`; callers pass validated ids.
    fn url(&self, segments: &[&str]) -> Result<Url, MercadoLibreError> {
        let mut url = Url::parse(&self.api_base_url)?;
        url.path_segments_mut()
            .map_err(|()| url::ParseError::RelativeUrlWithCannotBeABaseBase)?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        operation: &str,
        url: Url,
        access_token: &SecretString,
    ) -> Result<T, MercadoLibreError> {
        let response = self
            .transport
            .send(
                operation,
                |http| {
                    http.get(url.clone())
                        .bearer_auth(access_token.expose_secret())
                },
                true,
            )
            .await?;
        Transport::read_json(response).await
    }
}
