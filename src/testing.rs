//! 测试用的内存实现

use crate::artwork::panel_image_file_name;
use crate::compositor::encode_png;
use crate::error::Result;
use crate::models::{ComicMetadata, Dialogue, GenerationParams, Panel, PanelEntry, Script};
use crate::provider::{ClipStore, ImageModel, ImageRequest, OperationStatus, TextModel, VideoModel, VideoRequest};
use crate::store::{ComicStore, MetadataStore};
use crate::video::ClipJoiner;
use async_trait::async_trait;
use chrono::Utc;
use image::{Rgb, RgbImage};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

pub fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    encode_png(&RgbImage::from_pixel(width, height, Rgb([200, 120, 40]))).unwrap()
}

pub fn sample_panel(number: u32) -> Panel {
    Panel {
        panel_number: number,
        scene_description: format!("Scene {}", number),
        characters: vec!["Hero".to_string()],
        dialogue: vec![Dialogue::new("Hero", format!("Line {}", number))],
        visual_focus: format!("Focus {}", number),
        art_direction: None,
        character_appearances: BTreeMap::new(),
    }
}

/// 合法的模型剧本响应，标题固定为 "Mock Comic"
pub fn script_json(panels: u32) -> String {
    let script = Script {
        title: "Mock Comic".to_string(),
        theme: "Testing".to_string(),
        tone: "humorous".to_string(),
        target_audience: "general".to_string(),
        panels: (1..=panels).map(|n| PanelEntry::Panel(sample_panel(n))).collect(),
        character_descriptions: BTreeMap::from([("Hero".to_string(), "Red cape, short black hair".to_string())]),
    };
    serde_json::to_string(&script).unwrap()
}

pub struct MockTextModel {
    response: Option<String>,
    fail_when_contains: Option<String>,
}

impl MockTextModel {
    pub fn responding(response: &str) -> Self {
        Self {
            response: Some(response.to_string()),
            fail_when_contains: None,
        }
    }

    pub fn failing() -> Self {
        Self {
            response: None,
            fail_when_contains: None,
        }
    }

    pub fn failing_when_contains(mut self, needle: &str) -> Self {
        self.fail_when_contains = Some(needle.to_string());
        self
    }
}

#[async_trait]
impl TextModel for MockTextModel {
    async fn generate_json(&self, prompt: &str) -> anyhow::Result<String> {
        if let Some(needle) = &self.fail_when_contains {
            if prompt.contains(needle.as_str()) {
                anyhow::bail!("mock text model refused prompt");
            }
        }
        self.response
            .clone()
            .ok_or_else(|| anyhow::anyhow!("mock text model unavailable"))
    }
}

pub struct MockImageModel {
    response: Option<Vec<u8>>,
    /// 从 1 开始计数
    failing_call: Option<usize>,
    calls: AtomicUsize,
}

impl MockImageModel {
    pub fn responding(bytes: Vec<u8>) -> Self {
        Self {
            response: Some(bytes),
            failing_call: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing() -> Self {
        Self {
            response: None,
            failing_call: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing_on_call(mut self, call: usize) -> Self {
        self.failing_call = Some(call);
        self
    }
}

#[async_trait]
impl ImageModel for MockImageModel {
    async fn generate_image(&self, _prompt: &str, _request: &ImageRequest) -> anyhow::Result<Vec<u8>> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.failing_call == Some(call) {
            anyhow::bail!("mock image model failed on call {}", call);
        }
        self.response
            .clone()
            .ok_or_else(|| anyhow::anyhow!("mock image model unavailable"))
    }
}

/// 任务名为 `op-panel-<n>`，完成后片段位置为 `mock://clips/panel_<n>.mp4`
pub struct MockVideoModel {
    pending_polls: usize,
    failing_panels: Vec<u32>,
    never_done: bool,
    requests: Mutex<Vec<VideoRequest>>,
    polls: Mutex<HashMap<String, usize>>,
}

impl MockVideoModel {
    pub fn new() -> Self {
        Self {
            pending_polls: 0,
            failing_panels: Vec::new(),
            never_done: false,
            requests: Mutex::new(Vec::new()),
            polls: Mutex::new(HashMap::new()),
        }
    }

    /// 每个任务先返回 n 次未完成
    pub fn pending_polls(mut self, polls: usize) -> Self {
        self.pending_polls = polls;
        self
    }

    pub fn failing_panel(mut self, panel: u32) -> Self {
        self.failing_panels.push(panel);
        self
    }

    pub fn never_done(mut self) -> Self {
        self.never_done = true;
        self
    }

    pub fn requests(&self) -> Vec<VideoRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl VideoModel for MockVideoModel {
    async fn submit(&self, request: &VideoRequest) -> anyhow::Result<String> {
        let mut requests = self.requests.lock().unwrap();
        requests.push(request.clone());
        let panel = request
            .output_uri
            .as_deref()
            .and_then(|uri| uri.rsplit("panel_").next())
            .and_then(|n| n.parse::<u32>().ok())
            .unwrap_or(requests.len() as u32);
        Ok(format!("op-panel-{}", panel))
    }

    async fn poll(&self, operation: &str) -> anyhow::Result<OperationStatus> {
        if self.never_done {
            return Ok(OperationStatus::default());
        }

        let seen = {
            let mut polls = self.polls.lock().unwrap();
            let count = polls.entry(operation.to_string()).or_insert(0);
            *count += 1;
            *count
        };
        if seen <= self.pending_polls {
            return Ok(OperationStatus::default());
        }

        let panel: u32 = operation.trim_start_matches("op-panel-").parse()?;
        if self.failing_panels.contains(&panel) {
            return Ok(OperationStatus {
                done: true,
                video_uri: None,
                error: Some(format!("mock generation failed for panel {}", panel)),
            });
        }
        Ok(OperationStatus {
            done: true,
            video_uri: Some(format!("mock://clips/panel_{}.mp4", panel)),
            error: None,
        })
    }
}

pub struct MockClipStore {
    failing_uri: Option<String>,
}

impl MockClipStore {
    pub fn new() -> Self {
        Self { failing_uri: None }
    }

    pub fn failing_uri_containing(mut self, needle: &str) -> Self {
        self.failing_uri = Some(needle.to_string());
        self
    }
}

#[async_trait]
impl ClipStore for MockClipStore {
    async fn fetch(&self, uri: &str, dest: &Path) -> anyhow::Result<()> {
        if let Some(needle) = &self.failing_uri {
            if uri.contains(needle.as_str()) {
                anyhow::bail!("mock download failed: {}", uri);
            }
        }
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(dest, format!("clip from {}", uri)).await?;
        Ok(())
    }
}

/// 记录拼接输入，并写出一个假的成片
pub struct MockJoiner {
    joined: Mutex<Vec<PathBuf>>,
}

impl MockJoiner {
    pub fn new() -> Self {
        Self {
            joined: Mutex::new(Vec::new()),
        }
    }

    pub fn joined(&self) -> Vec<PathBuf> {
        self.joined.lock().unwrap().clone()
    }
}

#[async_trait]
impl ClipJoiner for MockJoiner {
    async fn join(&self, clips: &[PathBuf], output: &Path) -> Result<()> {
        *self.joined.lock().unwrap() = clips.to_vec();
        tokio::fs::write(output, b"joined video").await?;
        Ok(())
    }
}

/// 在存储中放一部已生成完毕的漫画（剧本、分镜图、拼版图、元数据），返回实际 ID
pub fn seed_comic(store: &ComicStore, base_id: &str, panels: u32) -> String {
    let (comic_id, dir) = store.allocate(base_id).unwrap();

    let script = Script {
        title: "Seeded Comic".to_string(),
        theme: "Testing".to_string(),
        tone: "humorous".to_string(),
        target_audience: "general".to_string(),
        panels: (1..=panels).map(|n| PanelEntry::Panel(sample_panel(n))).collect(),
        character_descriptions: BTreeMap::new(),
    };
    let script_path = store.write_script(&comic_id, &script).unwrap();

    let mut panel_image_paths = BTreeMap::new();
    for n in 1..=panels {
        let path = dir.join(panel_image_file_name(n));
        std::fs::write(&path, png_bytes(16, 16)).unwrap();
        panel_image_paths.insert(n, path.to_string_lossy().to_string());
    }
    let image_path = store.write_image(&comic_id, &png_bytes(32, 32)).unwrap();

    let files = BTreeMap::from([
        ("script".to_string(), script_path.to_string_lossy().to_string()),
        ("image".to_string(), image_path.to_string_lossy().to_string()),
    ]);
    store
        .save_metadata(&ComicMetadata {
            comic_id: comic_id.clone(),
            title: script.title.clone(),
            theme: script.theme.clone(),
            generated_at: Utc::now(),
            panel_count: panels as usize,
            generation_params: GenerationParams {
                topic: "seed".to_string(),
                tone: "humorous".to_string(),
                target_audience: "general".to_string(),
                visual_style: "ink".to_string(),
            },
            files,
            processing_time_seconds: None,
            generation_started_at: None,
            generation_completed_at: None,
            panel_image_paths,
            video_url: None,
            video_status: None,
            video_generation_started_at: None,
            video_generation_completed_at: None,
            video_processing_time_seconds: None,
            panel_video_uris: Vec::new(),
            video_error: None,
            revision: 0,
        })
        .unwrap();

    assert!(store.comic_dir(&comic_id).is_dir());
    comic_id
}
