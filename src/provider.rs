//! 上游生成服务的抽象接口
//!
//! 各阶段只依赖这些 trait，具体的 HTTP 实现见 [`crate::genai`]，
//! 测试中使用内存实现替换。

use anyhow::Result;
use async_trait::async_trait;
use std::path::Path;

/// 文本模型：输入提示词，返回 JSON 形式的文本
#[async_trait]
pub trait TextModel: Send + Sync {
    async fn generate_json(&self, prompt: &str) -> Result<String>;
}

/// 单张图片生成请求参数
#[derive(Debug, Clone)]
pub struct ImageRequest {
    pub aspect_ratio: String,
    pub sample_count: u32,
}

/// 图像模型：输入提示词，返回编码后的图片字节
#[async_trait]
pub trait ImageModel: Send + Sync {
    async fn generate_image(&self, prompt: &str, request: &ImageRequest) -> Result<Vec<u8>>;
}

/// 图生视频请求
#[derive(Debug, Clone)]
pub struct VideoRequest {
    pub prompt: String,
    /// 作为首帧条件的分镜图片（PNG）
    pub image_png: Vec<u8>,
    pub duration_secs: u32,
    pub aspect_ratio: String,
    /// 生成结果的输出位置（gs:// 前缀）
    pub output_uri: Option<String>,
}

/// 长时任务的轮询结果
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OperationStatus {
    pub done: bool,
    /// 完成后生成片段的位置
    pub video_uri: Option<String>,
    /// 远端报告的错误信息
    pub error: Option<String>,
}

/// 视频模型：提交任务后轮询直到完成
#[async_trait]
pub trait VideoModel: Send + Sync {
    /// 提交生成任务，返回任务名
    async fn submit(&self, request: &VideoRequest) -> Result<String>;

    /// 查询任务状态
    async fn poll(&self, operation: &str) -> Result<OperationStatus>;
}

/// 生成片段的下载
#[async_trait]
pub trait ClipStore: Send + Sync {
    async fn fetch(&self, uri: &str, dest: &Path) -> Result<()>;
}
