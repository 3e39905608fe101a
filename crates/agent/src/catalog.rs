use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use aisle_core::domain::turn::ProductHit;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum CatalogError {
    #[error("catalog transport failure: {0}")]
    Transport(String),
    #[error("catalog returned status {0}")]
    Status(u16),
    #[error("catalog response could not be decoded: {0}")]
    Decode(String),
}

/// Either `text` or `image` must be present; an image query ignores `categories`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CatalogQuery {
    pub text: String,
    pub image: Option<String>,
    pub categories: Vec<String>,
    pub top_k: usize,
}

impl CatalogQuery {
    pub fn text(text: impl Into<String>, categories: Vec<String>, top_k: usize) -> Self {
        Self { text: text.into(), image: None, categories, top_k }
    }

    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = Some(image.into());
        self
    }
}

#[async_trait]
pub trait CatalogClient: Send + Sync {
    /// Ranked hits, best first.
    async fn search(&self, query: &CatalogQuery) -> Result<Vec<ProductHit>, CatalogError>;
}

#[derive(Debug, Serialize)]
struct TextQueryBody<'a> {
    text: &'a str,
    categories: &'a [String],
    k: usize,
}

#[derive(Debug, Serialize)]
struct ImageQueryBody<'a> {
    text: &'a str,
    image_base64: &'a str,
    categories: &'a [String],
    k: usize,
}

/// Parallel arrays as answered by the catalog service.
#[derive(Debug, Default, Deserialize)]
struct CatalogResponse {
    #[serde(default)]
    texts: Vec<String>,
    #[serde(default)]
    ids: Vec<Value>,
    #[serde(default)]
    similarities: Vec<f32>,
    #[serde(default)]
    names: Vec<String>,
    #[serde(default)]
    images: Vec<String>,
}

impl CatalogResponse {
    fn into_hits(self) -> Result<Vec<ProductHit>, CatalogError> {
        let len = self.names.len();
        if self.texts.len() != len || self.similarities.len() != len || self.images.len() != len {
            return Err(CatalogError::Decode(format!(
                "mismatched result arrays (names={len}, texts={}, similarities={}, images={})",
                self.texts.len(),
                self.similarities.len(),
                self.images.len()
            )));
        }

        let hits = self
            .names
            .into_iter()
            .zip(self.texts)
            .zip(self.similarities)
            .zip(self.images)
            .enumerate()
            .map(|(index, (((name, description), score), image_url))| {
                let id = match self.ids.get(index) {
                    Some(Value::String(id)) => id.clone(),
                    Some(Value::Number(id)) => id.to_string(),
                    _ => name.clone(),
                };
                ProductHit { id, name, description, image_url, score }
            })
            .collect();
        Ok(hits)
    }
}

pub struct HttpCatalogClient {
    http: reqwest::Client,
    base_url: String,
}

impl HttpCatalogClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self, CatalogError> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|error| CatalogError::Transport(error.to_string()))?;
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Ok(Self { http, base_url })
    }
}

#[async_trait]
impl CatalogClient for HttpCatalogClient {
    async fn search(&self, query: &CatalogQuery) -> Result<Vec<ProductHit>, CatalogError> {
        let request = match query.image.as_deref() {
            Some(image) => self.http.post(format!("{}/query/image", self.base_url)).json(
                &ImageQueryBody {
                    text: &query.text,
                    image_base64: image,
                    categories: &[],
                    k: query.top_k,
                },
            ),
            None => self.http.post(format!("{}/query/text", self.base_url)).json(&TextQueryBody {
                text: &query.text,
                categories: &query.categories,
                k: query.top_k,
            }),
        };

        let response =
            request.send().await.map_err(|error| CatalogError::Transport(error.to_string()))?;
        if !response.status().is_success() {
            return Err(CatalogError::Status(response.status().as_u16()));
        }

        response
            .json::<CatalogResponse>()
            .await
            .map_err(|error| CatalogError::Decode(error.to_string()))?
            .into_hits()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{CatalogError, CatalogResponse};

    #[test]
    fn parallel_arrays_become_ranked_hits() {
        let response: CatalogResponse = serde_json::from_value(json!({
            "texts": ["A red dress", "A crimson gown"],
            "ids": [12, "sku-9"],
            "similarities": [0.93, 0.81],
            "names": ["Red Dress", "Crimson Gown"],
            "images": ["http://img/12.png", "http://img/9.png"]
        }))
        .expect("response parses");

        let hits = response.into_hits().expect("hits");
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].id, "12");
        assert_eq!(hits[1].id, "sku-9");
        assert_eq!(hits[0].name, "Red Dress");
        assert_eq!(hits[1].image_url, "http://img/9.png");
    }

    #[test]
    fn empty_response_yields_no_hits() {
        let response: CatalogResponse = serde_json::from_value(json!({})).expect("parses");
        assert!(response.into_hits().expect("hits").is_empty());
    }

    #[test]
    fn mismatched_arrays_are_rejected() {
        let response: CatalogResponse = serde_json::from_value(json!({
            "texts": ["only one"],
            "similarities": [0.9, 0.8],
            "names": ["One", "Two"],
            "images": ["a", "b"]
        }))
        .expect("parses");

        assert!(matches!(response.into_hits(), Err(CatalogError::Decode(_))));
    }
}
