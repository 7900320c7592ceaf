use thiserror::Error;

/// Failures on the wire. Workers never propagate these; the crawler folds
/// them into a `Transport` classification carrying HTTP status 0.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("response body too large (>{limit} bytes) for {url}")]
    BodyTooLarge { url: String, limit: usize },
}
