use async_trait::async_trait;
use log::{debug, error, info};
use reqwest::{Client, Url};
use sha2::{Digest, Sha256};

use super::models::{DownloadProgress, FileRef, Manifest, UpdateError, UpdateResult};

pub type ProgressFn<'a> = &'a (dyn Fn(DownloadProgress) + Send + Sync);

/// Remote source of the firmware manifest and the files it lists.
#[async_trait]
pub trait ManifestSource: Send + Sync {
    async fn fetch_manifest(&self) -> UpdateResult<Manifest>;

    /// Full contents of one manifest file, checked against its sha256 if given.
    async fn fetch_file(&self, name: &str, file: &FileRef, progress: ProgressFn<'_>) -> UpdateResult<Vec<u8>>;
}

pub struct UpdateService {
    client: Client,
    manifest_url: String,
}

impl UpdateService {
    pub fn new(manifest_url: impl Into<String>) -> Self {
        Self { client: Client::new(), manifest_url: manifest_url.into() }
    }

    pub fn manifest_url(&self) -> &str {
        &self.manifest_url
    }

    /// Absolute URLs pass through; anything else is relative to the manifest.
    pub fn resolve(&self, reference: &str) -> UpdateResult<Url> {
        if let Ok(url) = Url::parse(reference) {
            return Ok(url);
        }
        let base = Url::parse(&self.manifest_url)
            .map_err(|e| UpdateError::ManifestUnavailable(format!("bad manifest URL {}: {}", self.manifest_url, e)))?;
        base.join(reference)
            .map_err(|e| UpdateError::ManifestUnavailable(format!("bad file reference {}: {}", reference, e)))
    }
}

#[async_trait]
impl ManifestSource for UpdateService {
    async fn fetch_manifest(&self) -> UpdateResult<Manifest> {
        debug!("Fetching update manifest from: {}", self.manifest_url);

        let response = self
            .client
            .get(&self.manifest_url)
            .header("User-Agent", "bgg-config/1.0")
            .send()
            .await
            .map_err(|e| UpdateError::ManifestUnavailable(e.to_string()))?;

        if !response.status().is_success() {
            error!("Manifest request failed with status: {}", response.status());
            return Err(UpdateError::ManifestUnavailable(format!("HTTP {}", response.status())));
        }

        let manifest: Manifest = response
            .json()
            .await
            .map_err(|e| UpdateError::ManifestUnavailable(format!("invalid manifest: {}", e)))?;
        info!("Manifest lists firmware {} with {} files", manifest.firmware_version, manifest.files.len());
        Ok(manifest)
    }

    async fn fetch_file(&self, name: &str, file: &FileRef, progress: ProgressFn<'_>) -> UpdateResult<Vec<u8>> {
        let url = self.resolve(file.url())?;
        info!("Downloading {} from: {}", name, url);

        let response = self.client.get(url).send().await?.error_for_status()?;
        let total_bytes = response.content_length().unwrap_or(0);
        let mut body = Vec::with_capacity(total_bytes as usize);
        let mut stream = response.bytes_stream();

        while let Some(chunk) = futures_util::StreamExt::next(&mut stream).await {
            let chunk = chunk?;
            body.extend_from_slice(&chunk);
            let downloaded_bytes = body.len() as u64;
            progress(DownloadProgress {
                file: name.to_string(),
                downloaded_bytes,
                total_bytes,
                percentage: if total_bytes > 0 { (downloaded_bytes as f64 / total_bytes as f64) * 100.0 } else { 0.0 },
            });
        }

        verify_sha256(name, &body, file.sha256())?;
        debug!("Downloaded {}: {} bytes", name, body.len());
        Ok(body)
    }
}

/// Check `data` against an expected hex digest; no digest means no check.
pub fn verify_sha256(name: &str, data: &[u8], expected: Option<&str>) -> UpdateResult<()> {
    let Some(expected) = expected else { return Ok(()) };
    let computed = hex::encode(Sha256::digest(data));
    if computed.eq_ignore_ascii_case(expected.trim()) {
        debug!("{} verified: {}", name, computed);
        Ok(())
    } else {
        error!("{} verification failed - expected: {}, computed: {}", name, expected, computed);
        Err(UpdateError::Integrity { file: name.to_string(), expected: expected.to_lowercase(), computed })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_refs_resolve_against_manifest() {
        let svc = UpdateService::new("https://example.com/bgg/releases/latest/manifest.json");
        assert_eq!(svc.resolve("code.py").unwrap().as_str(), "https://example.com/bgg/releases/latest/code.py");
        assert_eq!(svc.resolve("lib/leds.py").unwrap().as_str(), "https://example.com/bgg/releases/latest/lib/leds.py");
        assert_eq!(svc.resolve("https://cdn.example.net/boot.py").unwrap().as_str(), "https://cdn.example.net/boot.py");
    }

    #[test]
    fn sha256_is_checked_case_insensitively() {
        // sha256("abc")
        let digest = "BA7816BF8F01CFEA414140DE5DAE2223B00361A396177A9CB410FF61F20015AD";
        assert!(verify_sha256("abc.txt", b"abc", Some(digest)).is_ok());
        assert!(verify_sha256("abc.txt", b"abc", None).is_ok());
        let err = verify_sha256("abc.txt", b"abd", Some(digest)).unwrap_err();
        assert!(matches!(err, UpdateError::Integrity { ref file, .. } if file == "abc.txt"));
    }
}
