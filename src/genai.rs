use crate::config::{ImageModelConfig, TextModelConfig, VideoModelConfig};
use crate::provider::{ImageModel, ImageRequest, OperationStatus, TextModel, VideoModel, VideoRequest};
use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as base64_engine;
use base64::Engine;
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, info};

/// Gemini API 客户端（剧本文本 + 分镜图片）
#[derive(Debug, Clone)]
pub struct GenAiClient {
    client: Client,
    api_key: String,
    text: TextModelConfig,
    image: ImageModelConfig,
}

impl GenAiClient {
    pub fn new(api_key: impl Into<String>, text: TextModelConfig, image: ImageModelConfig) -> Result<Self> {
        let api_key = api_key.into();
        if api_key.trim().is_empty() {
            anyhow::bail!("GEMINI_API_KEY 不能为空");
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(300))
            .build()
            .context("创建 HTTP 客户端失败")?;

        info!("🧠 [模型客户端] 文本模型: {}, 图像模型: {}", text.model_name, image.model_name);

        Ok(Self {
            client,
            api_key,
            text,
            image,
        })
    }

    async fn post_json(&self, url: &str, body: &Value) -> Result<Value> {
        let response = self
            .client
            .post(url)
            .header("x-goog-api-key", &self.api_key)
            .json(body)
            .send()
            .await
            .with_context(|| format!("请求失败: {}", url))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            anyhow::bail!("Gemini API error: HTTP {} - {}", status, error_text);
        }

        response.json().await.context("解析响应 JSON 失败")
    }
}

#[async_trait]
impl TextModel for GenAiClient {
    async fn generate_json(&self, prompt: &str) -> Result<String> {
        let url = format!(
            "{}/models/{}:generateContent",
            self.text.base_url.trim_end_matches('/'),
            self.text.model_name
        );
        let body = json!({
            "contents": [
                {
                    "role": "user",
                    "parts": [{ "text": prompt }]
                }
            ],
            "generationConfig": {
                "temperature": self.text.temperature,
                "maxOutputTokens": self.text.max_tokens,
                "responseMimeType": "application/json"
            }
        });

        let response = self.post_json(&url, &body).await?;
        extract_candidate_text(&response)
    }
}

#[async_trait]
impl ImageModel for GenAiClient {
    async fn generate_image(&self, prompt: &str, request: &ImageRequest) -> Result<Vec<u8>> {
        let url = format!(
            "{}/models/{}:predict",
            self.image.base_url.trim_end_matches('/'),
            self.image.model_name
        );
        let body = json!({
            "instances": [{ "prompt": prompt }],
            "parameters": {
                "sampleCount": request.sample_count,
                "aspectRatio": request.aspect_ratio
            }
        });

        let response = self.post_json(&url, &body).await?;
        let encoded = response["predictions"][0]["bytesBase64Encoded"]
            .as_str()
            .context("响应中没有图片数据")?;
        let bytes = base64_engine.decode(encoded).context("图片 base64 解码失败")?;
        debug!("📥 [模型客户端] 收到图片 {} 字节", bytes.len());
        Ok(bytes)
    }
}

/// 拼接候选结果中的全部文本片段
fn extract_candidate_text(response: &Value) -> Result<String> {
    let parts = response["candidates"][0]["content"]["parts"]
        .as_array()
        .context("响应中没有候选结果")?;

    let text: String = parts
        .iter()
        .filter_map(|part| part["text"].as_str())
        .collect();

    if text.trim().is_empty() {
        anyhow::bail!("候选结果文本为空");
    }
    Ok(text)
}

/// Vertex AI 图生视频客户端
#[derive(Debug, Clone)]
pub struct VertexVideoClient {
    client: Client,
    access_token: String,
    model_url: String,
}

impl VertexVideoClient {
    pub fn new(config: &VideoModelConfig) -> Result<Self> {
        let project = config
            .project_id
            .as_deref()
            .filter(|p| !p.is_empty())
            .context("未找到 GOOGLE_CLOUD_PROJECT 配置")?;
        let access_token = config
            .access_token
            .clone()
            .filter(|t| !t.is_empty())
            .context("未找到 GOOGLE_CLOUD_ACCESS_TOKEN 配置")?;
        // 未指定 storageUri 时片段以内联字节返回，下载流程只处理存储地址
        config
            .gcs_bucket
            .as_deref()
            .filter(|b| !b.is_empty())
            .context("未找到 GCS_BUCKET 配置，视频片段需要写入 Cloud Storage")?;

        let model_url = format!(
            "https://{location}-aiplatform.googleapis.com/v1/projects/{project}/locations/{location}/publishers/google/models/{model}",
            location = config.location,
            project = project,
            model = config.model_name,
        );

        Ok(Self {
            client: Client::builder()
                .timeout(Duration::from_secs(120))
                .build()
                .context("创建 HTTP 客户端失败")?,
            access_token,
            model_url,
        })
    }

    async fn post_json(&self, url: &str, body: &Value) -> Result<Value> {
        let response = self
            .client
            .post(url)
            .bearer_auth(&self.access_token)
            .json(body)
            .send()
            .await
            .with_context(|| format!("请求失败: {}", url))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            anyhow::bail!("Vertex AI error: HTTP {} - {}", status, error_text);
        }

        response.json().await.context("解析响应 JSON 失败")
    }
}

#[async_trait]
impl VideoModel for VertexVideoClient {
    async fn submit(&self, request: &VideoRequest) -> Result<String> {
        let mut parameters = json!({
            "aspectRatio": request.aspect_ratio,
            "durationSeconds": request.duration_secs,
            "sampleCount": 1
        });
        if let Some(uri) = &request.output_uri {
            parameters["storageUri"] = json!(uri);
        }

        let body = json!({
            "instances": [
                {
                    "prompt": request.prompt,
                    "image": {
                        "bytesBase64Encoded": base64_engine.encode(&request.image_png),
                        "mimeType": "image/png"
                    }
                }
            ],
            "parameters": parameters
        });

        let url = format!("{}:predictLongRunning", self.model_url);
        let response = self.post_json(&url, &body).await?;
        let name = response["name"]
            .as_str()
            .context("响应中没有任务名")?
            .to_string();

        info!("🎬 [模型客户端] 视频任务已提交: {}", name);
        Ok(name)
    }

    async fn poll(&self, operation: &str) -> Result<OperationStatus> {
        let url = format!("{}:fetchPredictOperation", self.model_url);
        let response = self
            .post_json(&url, &json!({ "operationName": operation }))
            .await?;
        Ok(parse_operation(&response))
    }
}

/// 解析长时任务状态（兼容 videos[].gcsUri 与 generatedSamples[].video.uri 两种格式）
fn parse_operation(response: &Value) -> OperationStatus {
    let done = response["done"].as_bool().unwrap_or(false);

    let error = response
        .get("error")
        .filter(|e| !e.is_null())
        .map(|e| {
            e["message"]
                .as_str()
                .map(str::to_string)
                .unwrap_or_else(|| e.to_string())
        });

    let result = &response["response"];
    let video_uri = result["videos"][0]["gcsUri"]
        .as_str()
        .or_else(|| result["generatedSamples"][0]["video"]["uri"].as_str())
        .map(str::to_string);

    let inline_only = video_uri.is_none() && !result["videos"][0]["bytesBase64Encoded"].is_null();
    let error = error.or_else(|| {
        (done && inline_only).then(|| "视频以内联字节返回，未写入 Cloud Storage（检查 storageUri）".to_string())
    });

    OperationStatus {
        done,
        video_uri,
        error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_candidate_text_joins_parts() {
        let response = json!({
            "candidates": [{
                "content": { "parts": [{ "text": "{\"title\":" }, { "text": "\"X\"}" }] }
            }]
        });
        assert_eq!(extract_candidate_text(&response).unwrap(), "{\"title\":\"X\"}");
    }

    #[test]
    fn test_extract_candidate_text_rejects_empty() {
        let response = json!({ "candidates": [] });
        assert!(extract_candidate_text(&response).is_err());
    }

    #[test]
    fn test_parse_operation_pending() {
        let status = parse_operation(&json!({ "name": "op-1" }));
        assert_eq!(status, OperationStatus::default());
    }

    #[test]
    fn test_parse_operation_done_with_video() {
        let status = parse_operation(&json!({
            "done": true,
            "response": { "videos": [{ "gcsUri": "gs://bucket/videos/c1/panel_1/sample_0.mp4" }] }
        }));
        assert!(status.done);
        assert_eq!(
            status.video_uri.as_deref(),
            Some("gs://bucket/videos/c1/panel_1/sample_0.mp4")
        );
        assert!(status.error.is_none());
    }

    #[test]
    fn test_parse_operation_error() {
        let status = parse_operation(&json!({
            "done": true,
            "error": { "code": 3, "message": "prompt rejected" }
        }));
        assert_eq!(status.error.as_deref(), Some("prompt rejected"));
        assert!(status.video_uri.is_none());
    }

    #[test]
    fn test_new_requires_api_key() {
        let result = GenAiClient::new("  ", TextModelConfig::default(), ImageModelConfig::default());
        assert!(result.is_err());
    }

    #[test]
    fn test_vertex_requires_project() {
        let config = VideoModelConfig::default();
        assert!(VertexVideoClient::new(&config).is_err());
    }

    #[test]
    fn test_vertex_requires_bucket() {
        let mut config = VideoModelConfig {
            project_id: Some("project".to_string()),
            access_token: Some("token".to_string()),
            ..VideoModelConfig::default()
        };
        let error = VertexVideoClient::new(&config).unwrap_err();
        assert!(error.to_string().contains("GCS_BUCKET"));

        config.gcs_bucket = Some("bucket".to_string());
        assert!(VertexVideoClient::new(&config).is_ok());
    }

    #[test]
    fn test_parse_operation_inline_bytes_is_reported() {
        let status = parse_operation(&json!({
            "done": true,
            "response": { "videos": [{ "bytesBase64Encoded": "AAAA", "mimeType": "video/mp4" }] }
        }));
        assert!(status.done);
        assert!(status.video_uri.is_none());
        assert!(status.error.unwrap().contains("storageUri"));
    }
}
