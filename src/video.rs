use crate::artwork::panel_image_file_name;
use crate::clip_probe::{check_uniform, probe_clip};
use crate::config::VideoModelConfig;
use crate::error::{ComicError, Result};
use crate::models::{ComicMetadata, Panel, Script, VideoStatus};
use crate::provider::{ClipStore, VideoModel, VideoRequest};
use crate::store::MetadataStore;
use crate::validator;
use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::{debug, error, info, warn};

pub const FINAL_VIDEO_FILE: &str = "final_video.mp4";
pub const CONCAT_LIST_FILE: &str = "video_concat_list.txt";

const GLOBAL_STYLE: &str = "animated comic book style with consistent character designs, same facial features, clothing, and proportions across all scenes";

pub fn panel_video_file_name(panel_number: u32) -> String {
    format!("panel_{}_video.mp4", panel_number)
}

/// 角色目录：每个角色一段固定描述，所有分镜的视频提示词引用同一份文本
#[derive(Debug, Clone, PartialEq)]
pub struct CharacterCatalog {
    pub descriptions: BTreeMap<String, String>,
    pub style: String,
}

impl CharacterCatalog {
    /// 按角色关键词（主角 / 反派 / 旁白 / 其他）生成描述
    pub fn from_panels(panels: &[Panel]) -> Self {
        let descriptions = panels
            .iter()
            .flat_map(|p| p.characters.iter())
            .map(|name| (name.clone(), describe_role(name)))
            .collect();

        Self {
            descriptions,
            style: GLOBAL_STYLE.to_string(),
        }
    }
}

fn describe_role(name: &str) -> String {
    match name.trim().to_lowercase().as_str() {
        "hero" | "protagonist" | "main character" => {
            "a brave heroic character with distinctive clothing and consistent facial features, medium build, confident posture".to_string()
        }
        "villain" | "antagonist" | "enemy" => {
            "a menacing villain character with dark clothing and consistent evil facial features, intimidating presence".to_string()
        }
        "narrator" | "storyteller" => {
            "a wise narrator figure with consistent appearance and authoritative presence".to_string()
        }
        other => format!(
            "a consistent {} character with distinctive features and clothing that remains the same throughout all scenes",
            other
        ),
    }
}

/// 单个分镜的图生视频提示词
pub fn build_clip_prompt(panel: &Panel, title: &str, catalog: &CharacterCatalog, duration_secs: u32) -> String {
    let mut parts = vec![format!(
        "Panel {} from comic series '{}' - MAINTAIN CHARACTER CONSISTENCY",
        panel.panel_number, title
    )];

    if !catalog.descriptions.is_empty() {
        let cast: Vec<String> = catalog
            .descriptions
            .iter()
            .map(|(name, desc)| format!("{}: {}", name, desc))
            .collect();
        parts.push(format!(
            "Characters (MUST maintain exact same appearance as in previous panels): {}",
            cast.join("; ")
        ));
    }
    if !panel.characters.is_empty() {
        parts.push(format!("Characters in this panel: {}", panel.characters.join(", ")));
    }

    parts.push(format!("Scene: {}", panel.scene_description));

    if !panel.dialogue.is_empty() {
        let mapping: Vec<String> = panel
            .dialogue
            .iter()
            .map(|d| format!("{}: '{}'", d.character, d.text))
            .collect();
        let speaking: Vec<String> = panel
            .dialogue
            .iter()
            .map(|d| {
                format!(
                    "CRITICAL: The character {who} must be clearly shown speaking the words '{line}' - show {who} with mouth movements, gestures, and body language indicating they are the active speaker for this specific dialogue",
                    who = d.character,
                    line = d.text
                )
            })
            .collect();
        parts.push(format!("Dialogue with CHARACTER-TO-SPEECH MAPPING: {}", mapping.join("; ")));
        parts.push(format!("SPEAKING INSTRUCTIONS: {}", speaking.join(". ")));
    }

    if !panel.visual_focus.is_empty() {
        parts.push(format!("Focus on: {}", panel.visual_focus));
    }

    format!(
        "Create an engaging {duration}-second animated video for this comic panel: {context}.\n\n\
         CRITICAL: All characters MUST have the exact same appearance, facial features, clothing, and proportions as they would have in the previous panels of this comic series. Character consistency is absolutely essential.\n\n\
         DIALOGUE REQUIREMENT: If dialogue is present, the EXACT character specified in the dialogue mapping above MUST be shown speaking their assigned lines. Show clear visual indicators of who is speaking:\n\
         - Speaking character should have mouth movements matching their dialogue\n\
         - Speaking character should have appropriate gestures and body language\n\
         - Non-speaking characters should have listening poses/expressions\n\
         - Camera should focus appropriately to show the speaker clearly\n\n\
         Style: {style} with dynamic camera movements and smooth transitions.\n\
         Include vibrant colors, dramatic lighting, expressive character animations, and comic book visual effects.\n\
         The video should feel cinematic and capture the specific mood and action of this single panel.\n\n\
         FINAL REMINDER: Ensure characters look identical to how they appeared in previous panels AND that the correct character speaks the correct dialogue as specified above.",
        duration = duration_secs,
        context = parts.join(". "),
        style = catalog.style,
    )
}

/// 把多个片段按顺序拼接为一个文件
#[async_trait]
pub trait ClipJoiner: Send + Sync {
    async fn join(&self, clips: &[PathBuf], output: &Path) -> Result<()>;
}

/// 调用 ffmpeg concat demuxer 做流拷贝拼接（不重新编码）
#[derive(Debug, Clone)]
pub struct FfmpegJoiner {
    binary: String,
}

impl Default for FfmpegJoiner {
    fn default() -> Self {
        Self {
            binary: "ffmpeg".to_string(),
        }
    }
}

impl FfmpegJoiner {
    pub fn new(binary: impl Into<String>) -> Self {
        Self { binary: binary.into() }
    }
}

/// concat demuxer 列表内容
///
/// ffmpeg 按列表文件所在目录解析相对路径，这里统一写绝对路径；单引号需要转义。
fn concat_list(clips: &[PathBuf]) -> std::io::Result<String> {
    clips
        .iter()
        .map(|clip| {
            let path = std::path::absolute(clip)?;
            Ok(format!("file '{}'\n", path.to_string_lossy().replace('\'', r"'\''")))
        })
        .collect()
}

#[async_trait]
impl ClipJoiner for FfmpegJoiner {
    async fn join(&self, clips: &[PathBuf], output: &Path) -> Result<()> {
        let mut infos = Vec::with_capacity(clips.len());
        for clip in clips {
            infos.push(probe_clip(clip)?);
        }
        check_uniform(&infos);

        let list_dir = output.parent().unwrap_or_else(|| Path::new("."));
        let list_path = list_dir.join(CONCAT_LIST_FILE);
        tokio::fs::write(&list_path, concat_list(clips)?).await?;

        info!("🎞️  [视频拼接] 正在拼接 {} 个片段 -> {}", clips.len(), output.display());
        let result = Command::new(&self.binary)
            .arg("-loglevel")
            .arg("error")
            .arg("-f")
            .arg("concat")
            .arg("-safe")
            .arg("0")
            .arg("-i")
            .arg(&list_path)
            .arg("-c")
            .arg("copy")
            .arg(output)
            .arg("-y")
            .output()
            .await;

        if let Err(e) = tokio::fs::remove_file(&list_path).await {
            debug!("清理拼接列表失败: {}", e);
        }

        let result = result.map_err(|e| ComicError::Join(format!("执行 ffmpeg 命令失败: {}", e)))?;
        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr).to_string();
            return Err(ComicError::Join(format!("ffmpeg 退出码 {}: {}", result.status, stderr.trim())));
        }
        Ok(())
    }
}

/// 视频阶段结果
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VideoOutcome {
    pub final_video_path: PathBuf,
    /// 成功生成的分镜片段地址（按分镜顺序）
    pub panel_video_uris: Vec<String>,
    /// 成功下载的本地片段
    pub panel_video_files: Vec<PathBuf>,
    pub processing_time: Duration,
    /// 是否直接返回了之前的结果
    pub cached: bool,
}

/// 分镜动画阶段
pub struct VideoGenerator {
    model: Arc<dyn VideoModel>,
    clips: Arc<dyn ClipStore>,
    joiner: Arc<dyn ClipJoiner>,
    config: VideoModelConfig,
}

impl VideoGenerator {
    pub fn new(
        model: Arc<dyn VideoModel>,
        clips: Arc<dyn ClipStore>,
        joiner: Arc<dyn ClipJoiner>,
        config: VideoModelConfig,
    ) -> Self {
        Self {
            model,
            clips,
            joiner,
            config,
        }
    }

    /// 为已存在的漫画生成视频，并把状态写回元数据
    ///
    /// 状态为 completed 时直接返回已有结果；为 generating 时拒绝重复请求，
    /// 除非开始时间已超过 [`Self::stale_after`]（进程中断后遗留的状态）。
    pub async fn generate_for_comic(&self, store: &dyn MetadataStore, comic_id: &str) -> Result<VideoOutcome> {
        let metadata = store.load_metadata(comic_id)?;

        match metadata.video_status {
            Some(VideoStatus::Completed) => {
                if let Some(outcome) = cached_outcome(&metadata) {
                    info!("♻️  [视频生成] 漫画 {} 的视频已存在，直接返回", comic_id);
                    return Ok(outcome);
                }
                warn!("⚠️  [视频生成] 漫画 {} 标记为已完成但缺少视频文件，重新生成", comic_id);
            }
            Some(VideoStatus::Generating) => {
                let limit = self.stale_after(metadata.panel_count);
                if !is_stale(&metadata, limit) {
                    return Err(ComicError::VideoInProgress(comic_id.to_string()));
                }
                warn!(
                    "⚠️  [视频生成] 漫画 {} 的 generating 状态已超过 {:?}，视为中断，重新生成",
                    comic_id, limit
                );
            }
            Some(VideoStatus::Failed) | None => {}
        }

        let script = store.load_script(comic_id)?;
        let started_at = Utc::now();
        store.update_metadata(comic_id, &mut |m| {
            m.video_status = Some(VideoStatus::Generating);
            m.video_generation_started_at = Some(started_at);
            m.video_generation_completed_at = None;
            m.video_error = None;
        })?;

        let comic_dir = store.comic_dir(comic_id);
        let result = self
            .generate_video(&script, &metadata.title, comic_id, &comic_dir)
            .await;
        let completed_at = Utc::now();

        // 终态总要尝试写入；写入失败时状态停在 generating，超时后可重新生成
        match result {
            Ok(outcome) => {
                let final_path = outcome.final_video_path.to_string_lossy().to_string();
                let written = store.update_metadata(comic_id, &mut |m| {
                    m.video_status = Some(VideoStatus::Completed);
                    m.video_generation_completed_at = Some(completed_at);
                    m.video_processing_time_seconds = Some(outcome.processing_time.as_secs_f64());
                    m.panel_video_uris = outcome.panel_video_uris.clone();
                    m.video_url = Some(final_path.clone());
                    m.files.insert("video".to_string(), final_path.clone());
                });
                if let Err(e) = written {
                    error!("❌ [视频生成] 视频已生成但写入完成状态失败: {}: {}", comic_id, e);
                    return Err(e);
                }
                Ok(outcome)
            }
            Err(e) => {
                let reason = e.to_string();
                let written = store.update_metadata(comic_id, &mut |m| {
                    m.video_status = Some(VideoStatus::Failed);
                    m.video_generation_completed_at = Some(completed_at);
                    m.video_error = Some(reason.clone());
                });
                if let Err(write_err) = written {
                    error!("❌ [视频生成] 写入失败状态失败: {}: {}", comic_id, write_err);
                }
                Err(e)
            }
        }
    }

    /// generating 状态超过该时长即视为遗留：每个分镜一个轮询超时，再加一个用于下载和拼接
    pub fn stale_after(&self, panel_count: usize) -> Duration {
        let rounds = u32::try_from(panel_count.max(1)).unwrap_or(u32::MAX).saturating_add(1);
        self.config.timeout.saturating_mul(rounds)
    }

    /// 逐个分镜生成片段、下载并拼接
    ///
    /// 单个分镜失败只跳过该分镜；没有任何可用片段时返回 [`ComicError::NoClips`]。
    pub async fn generate_video(
        &self,
        script: &Script,
        title: &str,
        comic_id: &str,
        comic_dir: &Path,
    ) -> Result<VideoOutcome> {
        let start = Instant::now();
        info!("🎬 [视频生成] 开始为漫画生成视频: {}", title);

        // 校验后编号即位置，与分镜图片文件名一致
        let panels = validator::validate(&script.panels);
        if panels.is_empty() {
            error!("❌ [视频生成] 剧本中没有分镜");
            return Err(ComicError::NoClips);
        }

        let catalog = CharacterCatalog::from_panels(&panels);
        info!(
            "🎭 [视频生成] 角色目录: {:?}",
            catalog.descriptions.keys().collect::<Vec<_>>()
        );

        let mut panel_video_uris = Vec::new();
        let mut panel_video_files = Vec::new();
        let total = panels.len();

        for (i, panel) in panels.iter().enumerate() {
            info!("🎬 [视频生成] 生成分镜 {} 的片段 ({}/{})", panel.panel_number, i + 1, total);
            let prompt = build_clip_prompt(panel, title, &catalog, self.config.clip_duration_secs);

            let uri = match self.generate_clip(panel, &prompt, comic_id, comic_dir).await {
                Ok(uri) => uri,
                Err(e) => {
                    warn!("⚠️  [视频生成] 分镜 {} 片段生成失败，跳过: {}", panel.panel_number, e);
                    continue;
                }
            };
            panel_video_uris.push(uri.clone());

            let dest = comic_dir.join(panel_video_file_name(panel.panel_number));
            match self.clips.fetch(&uri, &dest).await {
                Ok(()) => {
                    info!("📥 [视频生成] 分镜 {} 片段已下载: {}", panel.panel_number, dest.display());
                    panel_video_files.push(dest);
                }
                Err(e) => {
                    warn!("⚠️  [视频生成] 分镜 {} 片段下载失败，跳过: {:#}", panel.panel_number, e);
                }
            }
        }

        if panel_video_files.is_empty() {
            error!("❌ [视频生成] 没有可用的分镜片段");
            return Err(ComicError::NoClips);
        }

        let final_video_path = comic_dir.join(FINAL_VIDEO_FILE);
        self.joiner.join(&panel_video_files, &final_video_path).await?;

        let processing_time = start.elapsed();
        info!(
            "✅ [视频生成] 视频生成完成: {} 个片段，耗时: {:.2}秒",
            panel_video_files.len(),
            processing_time.as_secs_f64()
        );

        Ok(VideoOutcome {
            final_video_path,
            panel_video_uris,
            panel_video_files,
            processing_time,
            cached: false,
        })
    }

    async fn generate_clip(&self, panel: &Panel, prompt: &str, comic_id: &str, comic_dir: &Path) -> Result<String> {
        debug!("🎬 [视频生成] 分镜 {} 提示词: {}", panel.panel_number, prompt);

        let image_path = comic_dir.join(panel_image_file_name(panel.panel_number));
        let image_png = tokio::fs::read(&image_path).await?;

        let request = VideoRequest {
            prompt: prompt.to_string(),
            image_png,
            duration_secs: self.config.clip_duration_secs,
            aspect_ratio: self.config.aspect_ratio.clone(),
            output_uri: self
                .config
                .gcs_bucket
                .as_ref()
                .map(|bucket| format!("gs://{}/videos/{}/panel_{}", bucket, comic_id, panel.panel_number)),
        };

        let operation = self
            .model
            .submit(&request)
            .await
            .map_err(|e| ComicError::Api(format!("{:#}", e)))?;
        self.wait_for_operation(panel.panel_number, &operation).await
    }

    /// 轮询任务直到完成
    ///
    /// 间隔按 `poll_backoff` 放大，不超过 `max_poll_interval`；总等待超过 `timeout`
    /// 时返回 [`ComicError::VideoTimeout`]。丢弃返回的 future 即取消等待。
    async fn wait_for_operation(&self, panel_number: u32, operation: &str) -> Result<String> {
        let started = Instant::now();
        let mut interval = self.config.poll_interval;

        loop {
            let status = self
                .model
                .poll(operation)
                .await
                .map_err(|e| ComicError::Api(format!("{:#}", e)))?;

            if status.done {
                if let Some(reason) = status.error {
                    return Err(ComicError::VideoOperation {
                        panel: panel_number,
                        reason,
                    });
                }
                let uri = status.video_uri.ok_or_else(|| ComicError::VideoOperation {
                    panel: panel_number,
                    reason: "任务完成但没有返回视频地址".to_string(),
                })?;
                info!("✅ [视频生成] 分镜 {} 片段完成: {}", panel_number, uri);
                return Ok(uri);
            }

            let waited = started.elapsed();
            if waited >= self.config.timeout {
                return Err(ComicError::VideoTimeout {
                    panel: panel_number,
                    waited,
                });
            }

            debug!("⏳ [视频生成] 分镜 {} 仍在生成，{:?} 后重试", panel_number, interval);
            tokio::time::sleep(interval.min(self.config.timeout - waited)).await;
            interval = interval
                .mul_f64(self.config.poll_backoff.max(1.0))
                .min(self.config.max_poll_interval);
        }
    }
}

/// 没有开始时间，或开始时间早于 `limit` 之前
fn is_stale(metadata: &ComicMetadata, limit: Duration) -> bool {
    let Some(started_at) = metadata.video_generation_started_at else {
        return true;
    };
    match chrono::Duration::from_std(limit) {
        Ok(limit) => Utc::now().signed_duration_since(started_at) >= limit,
        Err(_) => false,
    }
}

/// 取消视频生成：仅当状态仍为 generating 时改为 failed，其他状态保持不变
pub fn mark_cancelled(store: &dyn MetadataStore, comic_id: &str) -> Result<ComicMetadata> {
    let cancelled_at = Utc::now();
    store.update_metadata(comic_id, &mut |m| {
        if m.video_status == Some(VideoStatus::Generating) {
            m.video_status = Some(VideoStatus::Failed);
            m.video_error = Some("cancelled".to_string());
            m.video_generation_completed_at = Some(cancelled_at);
        }
    })
}

fn cached_outcome(metadata: &ComicMetadata) -> Option<VideoOutcome> {
    let path = PathBuf::from(metadata.files.get("video")?);
    if !path.exists() {
        return None;
    }
    Some(VideoOutcome {
        final_video_path: path,
        panel_video_uris: metadata.panel_video_uris.clone(),
        panel_video_files: Vec::new(),
        processing_time: Duration::from_secs_f64(metadata.video_processing_time_seconds.unwrap_or(0.0).max(0.0)),
        cached: true,
    })
}
