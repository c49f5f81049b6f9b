use crate::artwork::ArtworkGenerator;
use crate::config::AppConfig;
use crate::error::{ComicError, Result};
use crate::genai::{GenAiClient, VertexVideoClient};
use crate::models::{ComicMetadata, GenerationParams};
use crate::provider::{ImageModel, TextModel};
use crate::script::ScriptGenerator;
use crate::storage::BlobClient;
use crate::store::{ComicStore, MetadataStore};
use crate::validator;
use crate::video::{FfmpegJoiner, VideoGenerator, VideoOutcome};
use anyhow::Context;
use chrono::{DateTime, Local, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};
use uuid::Uuid;

const TOPIC_ID_CHARS: usize = 30;
const TONE_ID_CHARS: usize = 15;

/// 单个主题的失败记录
#[derive(Debug, Clone, Serialize)]
pub struct BatchFailure {
    pub topic: String,
    pub error: String,
}

/// 批量生成结果
#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub batch_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub total: usize,
    pub comics: Vec<ComicMetadata>,
    pub failures: Vec<BatchFailure>,
}

impl BatchReport {
    pub fn success_ratio(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.comics.len() as f64 / self.total as f64
        }
    }
}

/// 漫画生成流程：剧本 -> 分镜校验 -> 作画 -> 拼版 -> 持久化，可选视频阶段
pub struct ComicEngine {
    config: AppConfig,
    scripts: ScriptGenerator,
    artwork: ArtworkGenerator,
    video: Option<VideoGenerator>,
    store: ComicStore,
}

impl ComicEngine {
    pub fn new(
        config: AppConfig,
        text_model: Arc<dyn TextModel>,
        image_model: Option<Arc<dyn ImageModel>>,
        video: Option<VideoGenerator>,
    ) -> Self {
        let scripts = ScriptGenerator::new(text_model, config.comic.clone());
        let artwork = ArtworkGenerator::new(image_model, config.comic.clone(), config.image.clone());
        let store = ComicStore::new(config.output_dir.clone());
        info!("🎨 [漫画生成] 引擎初始化完成，输出目录: {}", config.output_dir.display());

        Self {
            config,
            scripts,
            artwork,
            video,
            store,
        }
    }

    /// 按配置创建真实的模型客户端
    pub fn from_config(config: AppConfig) -> anyhow::Result<Self> {
        let api_key = config
            .text
            .api_key
            .clone()
            .context("未找到 GEMINI_API_KEY 配置")?;
        let text_client = Arc::new(GenAiClient::new(api_key, config.text.clone(), config.image.clone())?);

        // 图像模型单独配置密钥时使用独立客户端；未配置时作画阶段只出占位图
        let image_model: Option<Arc<dyn ImageModel>> = match &config.image.api_key {
            Some(key) if Some(key) != config.text.api_key.as_ref() => Some(Arc::new(GenAiClient::new(
                key.clone(),
                config.text.clone(),
                config.image.clone(),
            )?)),
            Some(_) => Some(text_client.clone()),
            None => None,
        };

        let video = match VertexVideoClient::new(&config.video) {
            Ok(client) => Some(VideoGenerator::new(
                Arc::new(client),
                Arc::new(BlobClient::new(config.storage.clone())?),
                Arc::new(FfmpegJoiner::default()),
                config.video.clone(),
            )),
            Err(e) => {
                info!("ℹ️  [漫画生成] 视频功能未启用: {}", e);
                None
            }
        };

        Ok(Self::new(config, text_client, image_model, video))
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// 由主题、基调和时间戳生成文件系统安全的漫画 ID
    pub fn comic_id(topic: &str, tone: &str, now: DateTime<Local>) -> String {
        let timestamp = now.format("%Y%m%d_%H%M%S");
        let topic = sanitize_topic(topic);
        let tone = sanitize_tone(tone);

        if topic.is_empty() {
            format!("daily_comic_{}", timestamp)
        } else if !tone.is_empty() && tone != "general" {
            format!("{}_{}_{}", topic, tone, timestamp)
        } else {
            format!("{}_{}", topic, timestamp)
        }
    }

    /// 生成一部漫画
    ///
    /// 各阶段自带兜底，这里不再额外兜底；逃逸出来的错误记录后原样返回。
    pub async fn generate(
        &self,
        topic: &str,
        tone: &str,
        target_audience: &str,
        visual_style: &str,
    ) -> Result<ComicMetadata> {
        let base_id = Self::comic_id(topic, tone, Local::now());
        info!("🚀 [漫画生成] 开始生成: {} (ID: {})", topic, base_id);

        let result = self
            .run_generation(&base_id, topic, tone, target_audience, visual_style)
            .await;
        match &result {
            Ok(metadata) => info!("🎉 [漫画生成] 生成完成: {}", metadata.comic_id),
            Err(e) => error!("❌ [漫画生成] 生成失败 {}: {}", base_id, e),
        }
        result
    }

    async fn run_generation(
        &self,
        base_id: &str,
        topic: &str,
        tone: &str,
        target_audience: &str,
        visual_style: &str,
    ) -> Result<ComicMetadata> {
        let started_at = Utc::now();
        let start = Instant::now();

        // 1. 剧本
        info!("📝 [漫画生成] 生成剧本...");
        let script = self.scripts.generate(topic, tone, target_audience).await;

        // 2. 分镜校验
        info!("🔍 [漫画生成] 校验分镜...");
        let panels = validator::validate(&script.panels);

        // 3. 作画与拼版
        let (comic_id, comic_dir) = self.store.allocate(base_id)?;
        info!("🎨 [漫画生成] 生成分镜图片...");
        let artwork = self
            .artwork
            .render_comic(&panels, visual_style, Some(&comic_dir))
            .await?;

        // 4. 持久化
        let script_path = self.store.write_script(&comic_id, &script)?;
        let image_path = self.store.write_image(&comic_id, &artwork.composite_png)?;

        let mut files = BTreeMap::new();
        files.insert("script".to_string(), script_path.to_string_lossy().to_string());
        files.insert("image".to_string(), image_path.to_string_lossy().to_string());

        let metadata = ComicMetadata {
            comic_id: comic_id.clone(),
            title: non_empty_or(&script.title, "Untitled Comic"),
            theme: script.theme.clone(),
            generated_at: Utc::now(),
            panel_count: artwork.panel_count,
            generation_params: GenerationParams {
                topic: topic.to_string(),
                tone: tone.to_string(),
                target_audience: target_audience.to_string(),
                visual_style: visual_style.to_string(),
            },
            files,
            processing_time_seconds: Some(start.elapsed().as_secs_f64()),
            generation_started_at: Some(started_at),
            generation_completed_at: Some(Utc::now()),
            panel_image_paths: artwork.panel_image_paths,
            video_url: None,
            video_status: None,
            video_generation_started_at: None,
            video_generation_completed_at: None,
            video_processing_time_seconds: None,
            panel_video_uris: Vec::new(),
            video_error: None,
            revision: 0,
        };
        self.store.save_metadata(&metadata)?;

        info!(
            "✅ [漫画生成] 已保存到 {}，耗时: {:.2}秒",
            comic_dir.display(),
            start.elapsed().as_secs_f64()
        );
        Ok(metadata)
    }

    /// 按顺序批量生成；单个主题失败只记录，不影响其余主题
    pub async fn generate_batch(&self, topics: &[String], tone: &str, visual_style: &str) -> BatchReport {
        let batch_id = Uuid::new_v4();
        let started_at = Utc::now();
        let total = topics.len();
        let mut comics = Vec::new();
        let mut failures = Vec::new();

        info!("🔄 [批量生成] 批次 {} 开始，共 {} 个主题", batch_id, total);

        for (i, topic) in topics.iter().enumerate() {
            info!("📚 [批量生成] 生成第 {}/{} 个: {}", i + 1, total, topic);
            match self.generate(topic, tone, "general", visual_style).await {
                Ok(comic) => comics.push(comic),
                Err(e) => {
                    warn!("⚠️  [批量生成] 主题 '{}' 生成失败: {}", topic, e);
                    failures.push(BatchFailure {
                        topic: topic.clone(),
                        error: e.to_string(),
                    });
                }
            }

            if i + 1 < total && !self.config.batch_delay.is_zero() {
                tokio::time::sleep(self.config.batch_delay).await;
            }
        }

        let report = BatchReport {
            batch_id,
            started_at,
            completed_at: Utc::now(),
            total,
            comics,
            failures,
        };
        info!(
            "🏁 [批量生成] 批次完成: {}/{} ({:.1}% 成功)",
            report.comics.len(),
            total,
            report.success_ratio() * 100.0
        );
        report
    }

    pub fn list_generated(&self) -> Result<Vec<ComicMetadata>> {
        self.store.list()
    }

    pub fn get(&self, comic_id: &str) -> Result<ComicMetadata> {
        self.store.load_metadata(comic_id)
    }

    pub fn update_metadata(
        &self,
        comic_id: &str,
        apply: &mut dyn FnMut(&mut ComicMetadata),
    ) -> Result<ComicMetadata> {
        self.store.update_metadata(comic_id, apply)
    }

    /// 为已生成的漫画生成视频
    pub async fn generate_video(&self, comic_id: &str) -> Result<VideoOutcome> {
        let video = self
            .video
            .as_ref()
            .ok_or_else(|| ComicError::VideoUnavailable("缺少 GOOGLE_CLOUD_PROJECT 或访问令牌".to_string()))?;
        video.generate_for_comic(&self.store, comic_id).await
    }

    /// 视频生成被取消后调用，只把仍为 generating 的状态改为 failed
    pub fn cancel_video(&self, comic_id: &str) -> Result<ComicMetadata> {
        crate::video::mark_cancelled(&self.store, comic_id)
    }
}

fn non_empty_or(value: &str, default: &str) -> String {
    if value.trim().is_empty() {
        default.to_string()
    } else {
        value.to_string()
    }
}

/// 小写，去掉单词字符、空白和连字符以外的字符，空白和连字符合并为下划线，最多 30 个字符
fn sanitize_topic(topic: &str) -> String {
    let kept: String = topic
        .to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-' || c.is_whitespace())
        .collect();

    let mut collapsed = String::with_capacity(kept.len());
    let mut in_separator = false;
    for c in kept.chars() {
        if c == '-' || c.is_whitespace() {
            if !in_separator {
                collapsed.push('_');
                in_separator = true;
            }
        } else {
            collapsed.push(c);
            in_separator = false;
        }
    }

    collapsed.chars().take(TOPIC_ID_CHARS).collect()
}

/// 小写，只保留单词字符，最多 15 个字符
fn sanitize_tone(tone: &str) -> String {
    tone.to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '_')
        .take(TONE_ID_CHARS)
        .collect()
}
