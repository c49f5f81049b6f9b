use crate::config::StorageConfig;
use crate::provider::ClipStore;
use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as base64_engine;
use base64::Engine;
use chrono::Utc;
use hmac::{Hmac, Mac};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::Client;
use sha1::Sha1;
use std::fs;
use std::path::{Path, PathBuf};

type HmacSha1 = Hmac<Sha1>;

const GCS_XML_ENDPOINT: &str = "https://storage.googleapis.com";

/// 对象键编码时保留路径分隔符和常见安全字符
const OBJECT_KEY_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'/')
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// 生成片段的存储位置
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlobLocation {
    /// gs://bucket/key
    Gcs { bucket: String, key: String },
    /// http(s) 直链
    Http(String),
    /// 本地文件（file:// 或普通路径）
    Local(PathBuf),
}

impl BlobLocation {
    pub fn parse(uri: &str) -> Result<Self> {
        let uri = uri.trim();
        if let Some(rest) = uri.strip_prefix("gs://") {
            let (bucket, key) = rest
                .split_once('/')
                .filter(|(bucket, key)| !bucket.is_empty() && !key.is_empty())
                .with_context(|| format!("无效的 Cloud Storage 地址: {}", uri))?;
            return Ok(BlobLocation::Gcs {
                bucket: bucket.to_string(),
                key: key.to_string(),
            });
        }
        if uri.starts_with("http://") || uri.starts_with("https://") {
            return Ok(BlobLocation::Http(uri.to_string()));
        }
        if uri.is_empty() {
            anyhow::bail!("存储地址为空");
        }
        let path = uri.strip_prefix("file://").unwrap_or(uri);
        Ok(BlobLocation::Local(PathBuf::from(path)))
    }
}

/// Cloud Storage 下载客户端
///
/// 认证方式按优先级：
/// - HMAC 互操作密钥（GOOG1 签名）
/// - OAuth 访问令牌
/// - 匿名（公开对象）
///
/// 本地路径（`file://` 或普通路径）只允许复制 `local_roots` 下的文件，默认不允许。
pub struct BlobClient {
    client: Client,
    credentials: StorageConfig,
    local_roots: Vec<PathBuf>,
}

impl BlobClient {
    pub fn new(credentials: StorageConfig) -> Result<Self> {
        Ok(Self {
            client: Client::builder()
                .timeout(std::time::Duration::from_secs(300))
                .build()
                .context("创建 HTTP 客户端失败")?,
            credentials,
            local_roots: Vec::new(),
        })
    }

    /// 允许从该目录（含子目录）复制本地文件
    pub fn with_local_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.local_roots.push(root.into());
        self
    }

    /// 本地源文件必须位于某个允许的目录下（按规范化后的真实路径判断）
    fn check_local_source(&self, source: &Path) -> Result<PathBuf> {
        let resolved = fs::canonicalize(source)
            .with_context(|| format!("无法访问本地文件: {}", source.display()))?;
        let allowed = self
            .local_roots
            .iter()
            .filter_map(|root| fs::canonicalize(root).ok())
            .any(|root| resolved.starts_with(root));
        if !allowed {
            anyhow::bail!("不允许复制该本地文件: {}", source.display());
        }
        Ok(resolved)
    }

    fn hmac_keys(&self) -> Option<(&str, &str)> {
        match (&self.credentials.hmac_access_id, &self.credentials.hmac_secret) {
            (Some(id), Some(secret)) if !id.is_empty() && !secret.is_empty() => {
                Some((id.as_str(), secret.as_str()))
            }
            _ => None,
        }
    }

    /// 构建 XML API URL
    fn build_url(bucket: &str, object_key: &str) -> String {
        let encoded_key = utf8_percent_encode(object_key, OBJECT_KEY_ENCODE_SET).to_string();
        format!("{}/{}/{}", GCS_XML_ENDPOINT, bucket, encoded_key)
    }

    /// 生成 GOOG1 签名
    ///
    /// StringToSign = VERB\nContent-MD5\nContent-Type\nDate\nCanonicalizedExtensionHeaders + CanonicalizedResource
    fn sign_request(
        secret: &str,
        method: &str,
        bucket: &str,
        object_key: &str,
        headers: &HeaderMap,
    ) -> Result<String> {
        // 1. CanonicalizedResource: /{bucket}/{object_key}
        let canonicalized_resource = format!("/{}/{}", bucket, object_key);

        // 2. CanonicalizedExtensionHeaders: x-goog-* 头，小写并排序
        let mut goog_headers = Vec::new();
        for (name, value) in headers.iter() {
            let name_lower = name.as_str().to_lowercase();
            if name_lower.starts_with("x-goog-") {
                goog_headers.push((name_lower, value.to_str().unwrap_or("")));
            }
        }
        goog_headers.sort_by(|a, b| a.0.cmp(&b.0));

        let canonicalized_headers: String = goog_headers
            .iter()
            .map(|(k, v)| format!("{}:{}\n", k, v))
            .collect();

        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_string()
        };

        let string_to_sign = format!(
            "{}\n{}\n{}\n{}\n{}{}",
            method,
            header("Content-MD5"),
            header("Content-Type"),
            header("Date"),
            canonicalized_headers,
            canonicalized_resource
        );

        // 3. HMAC-SHA1 + Base64
        let mut mac = HmacSha1::new_from_slice(secret.as_bytes()).context("创建 HMAC 失败")?;
        mac.update(string_to_sign.as_bytes());
        Ok(base64_engine.encode(mac.finalize().into_bytes()))
    }

    /// 构建带认证信息的请求头
    fn build_auth_headers(&self, method: &str, bucket: &str, object_key: &str) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();

        if let Some((access_id, secret)) = self.hmac_keys() {
            let date = Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string();
            headers.insert(
                "Date",
                HeaderValue::from_str(&date).context("创建 Date header 失败")?,
            );

            let signature = Self::sign_request(secret, method, bucket, object_key, &headers)?;
            let authorization = format!("GOOG1 {}:{}", access_id, signature);
            headers.insert(
                "Authorization",
                HeaderValue::from_str(&authorization).context("创建 Authorization header 失败")?,
            );
        } else if let Some(token) = self.credentials.access_token.as_deref().filter(|t| !t.is_empty()) {
            headers.insert(
                "Authorization",
                HeaderValue::from_str(&format!("Bearer {}", token))
                    .context("创建 Authorization header 失败")?,
            );
        }

        Ok(headers)
    }

    async fn download_http(&self, url: &str, headers: HeaderMap, output_path: &Path) -> Result<()> {
        let response = self
            .client
            .get(url)
            .headers(headers)
            .send()
            .await
            .context("下载文件失败")?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            anyhow::bail!("下载文件失败: HTTP {} - {}", status, error_text);
        }

        let bytes = response.bytes().await.context("读取响应数据失败")?;
        if bytes.is_empty() {
            anyhow::bail!("下载的文件为空: {}", url);
        }
        fs::write(output_path, &bytes).context("保存文件失败")?;
        Ok(())
    }

    /// 下载文件到本地路径
    pub async fn download_file(&self, uri: &str, output_path: impl AsRef<Path>) -> Result<PathBuf> {
        let output_path = output_path.as_ref();

        // 确保父目录存在
        if let Some(parent) = output_path.parent() {
            fs::create_dir_all(parent).context("创建输出目录失败")?;
        }

        tracing::info!("正在下载文件: {} -> {}", uri, output_path.display());

        match BlobLocation::parse(uri)? {
            BlobLocation::Gcs { bucket, key } => {
                let url = Self::build_url(&bucket, &key);
                let headers = self.build_auth_headers("GET", &bucket, &key)?;
                self.download_http(&url, headers, output_path).await?;
            }
            BlobLocation::Http(url) => {
                self.download_http(&url, HeaderMap::new(), output_path).await?;
            }
            BlobLocation::Local(source) => {
                let source = self.check_local_source(&source)?;
                fs::copy(&source, output_path)
                    .with_context(|| format!("复制文件失败: {}", source.display()))?;
            }
        }

        tracing::info!("文件已下载到: {}", output_path.display());

        Ok(output_path.to_path_buf())
    }
}

#[async_trait]
impl ClipStore for BlobClient {
    async fn fetch(&self, uri: &str, dest: &Path) -> Result<()> {
        self.download_file(uri, dest).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_locations() {
        assert_eq!(
            BlobLocation::parse("gs://bucket/videos/c1/panel_1/sample_0.mp4").unwrap(),
            BlobLocation::Gcs {
                bucket: "bucket".to_string(),
                key: "videos/c1/panel_1/sample_0.mp4".to_string()
            }
        );
        assert_eq!(
            BlobLocation::parse("https://example.com/a.mp4").unwrap(),
            BlobLocation::Http("https://example.com/a.mp4".to_string())
        );
        assert_eq!(
            BlobLocation::parse("file:///tmp/a.mp4").unwrap(),
            BlobLocation::Local(PathBuf::from("/tmp/a.mp4"))
        );
        assert!(BlobLocation::parse("gs://bucket-only").is_err());
        assert!(BlobLocation::parse("").is_err());
    }

    #[test]
    fn test_build_url_keeps_path_separators() {
        let url = BlobClient::build_url("bucket", "videos/my comic/panel_1.mp4");
        assert_eq!(url, "https://storage.googleapis.com/bucket/videos/my%20comic/panel_1.mp4");
    }

    #[test]
    fn test_signature_is_deterministic() {
        let mut headers = HeaderMap::new();
        headers.insert("Date", HeaderValue::from_static("Mon, 19 Oct 2026 10:00:00 GMT"));
        headers.insert("x-goog-meta-b", HeaderValue::from_static("2"));
        headers.insert("x-goog-meta-a", HeaderValue::from_static("1"));

        let first = BlobClient::sign_request("secret", "GET", "bucket", "key.mp4", &headers).unwrap();
        let second = BlobClient::sign_request("secret", "GET", "bucket", "key.mp4", &headers).unwrap();
        let other = BlobClient::sign_request("secret", "GET", "bucket", "other.mp4", &headers).unwrap();

        assert_eq!(first, second);
        assert_ne!(first, other);
        // HMAC-SHA1 输出 20 字节，Base64 后 28 个字符
        assert_eq!(first.len(), 28);
    }

    #[test]
    fn test_auth_headers_prefer_hmac() {
        let client = BlobClient::new(StorageConfig {
            hmac_access_id: Some("GOOGTEST".to_string()),
            hmac_secret: Some("secret".to_string()),
            access_token: Some("token".to_string()),
        })
        .unwrap();
        let headers = client.build_auth_headers("GET", "bucket", "key").unwrap();
        let auth = headers.get("Authorization").unwrap().to_str().unwrap();
        assert!(auth.starts_with("GOOG1 GOOGTEST:"));
        assert!(headers.contains_key("Date"));
    }

    #[test]
    fn test_auth_headers_bearer_fallback() {
        let client = BlobClient::new(StorageConfig {
            access_token: Some("token".to_string()),
            ..Default::default()
        })
        .unwrap();
        let headers = client.build_auth_headers("GET", "bucket", "key").unwrap();
        assert_eq!(headers.get("Authorization").unwrap(), "Bearer token");
    }

    #[tokio::test]
    async fn test_fetch_local_file() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("clip.mp4");
        std::fs::write(&source, b"fake clip").unwrap();
        let dest = dir.path().join("nested").join("panel_1_video.mp4");

        let client = BlobClient::new(StorageConfig::default())
            .unwrap()
            .with_local_root(dir.path());
        client
            .fetch(&format!("file://{}", source.display()), &dest)
            .await
            .unwrap();

        assert_eq!(std::fs::read(&dest).unwrap(), b"fake clip");
    }

    #[tokio::test]
    async fn test_local_files_outside_roots_are_refused() {
        let allowed = tempfile::tempdir().unwrap();
        let elsewhere = tempfile::tempdir().unwrap();
        let secret = elsewhere.path().join("secret.txt");
        std::fs::write(&secret, b"do not copy").unwrap();
        let dest = allowed.path().join("panel_1_video.mp4");

        let without_roots = BlobClient::new(StorageConfig::default()).unwrap();
        assert!(without_roots
            .fetch(&format!("file://{}", secret.display()), &dest)
            .await
            .is_err());

        let client = BlobClient::new(StorageConfig::default())
            .unwrap()
            .with_local_root(allowed.path());
        assert!(client.fetch(secret.to_str().unwrap(), &dest).await.is_err());
        let escaping = allowed.path().join("..").join(elsewhere.path().file_name().unwrap()).join("secret.txt");
        assert!(client.fetch(escaping.to_str().unwrap(), &dest).await.is_err());
        assert!(!dest.exists());
    }
}
