use super::{BackendImage, ImageBackend, ImageRequest};
use crate::core::error::{GenResult, GenerationError};
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Mutex;

/// Records every request; returns a fake ephemeral URL per call.
pub(crate) struct MockBackend {
    fail: bool,
    calls: Mutex<Vec<ImageRequest>>,
    ephemeral: Mutex<Vec<String>>,
}

impl MockBackend {
    pub(crate) const IMAGE_BYTES: &'static [u8] = b"\x89PNG mock";

    pub(crate) fn new() -> Self {
        Self { fail: false, calls: Mutex::new(Vec::new()), ephemeral: Mutex::new(Vec::new()) }
    }

    pub(crate) fn failing() -> Self {
        Self { fail: true, ..Self::new() }
    }

    pub(crate) fn calls(&self) -> Vec<ImageRequest> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn last_ephemeral_url(&self) -> Option<String> {
        self.ephemeral.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl ImageBackend for MockBackend {
    async fn generate(&self, request: &ImageRequest) -> GenResult<BackendImage> {
        let n = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(request.clone());
            calls.len()
        };
        if self.fail {
            return Err(GenerationError::Upstream("mock backend down".to_string()));
        }
        let url = format!("https://replicate.delivery/tmp/{}/out-{}.png", request.book_id, n);
        self.ephemeral.lock().unwrap().push(url.clone());
        Ok(BackendImage { url, used_seed: request.seed })
    }

    async fn download(&self, _url: &str) -> Result<(Vec<u8>, Option<String>)> {
        Ok((Self::IMAGE_BYTES.to_vec(), Some("image/png".to_string())))
    }
}
