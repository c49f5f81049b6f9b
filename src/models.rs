use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// 分镜中的一句台词
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dialogue {
    /// 说话的角色
    #[serde(default = "default_speaker")]
    pub character: String,
    /// 台词内容
    pub text: String,
}

fn default_speaker() -> String {
    "Character".to_string()
}

impl Dialogue {
    pub fn new(character: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            character: character.into(),
            text: text.into(),
        }
    }
}

/// 单个漫画分镜
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Panel {
    /// 分镜编号（从 1 开始），同时用作分镜图片/视频文件名的键
    pub panel_number: u32,
    /// 画面描述
    pub scene_description: String,
    /// 出场角色（按出场顺序）
    #[serde(default)]
    pub characters: Vec<String>,
    /// 台词列表，第一句视为主台词
    #[serde(default)]
    pub dialogue: Vec<Dialogue>,
    /// 画面重点
    #[serde(default)]
    pub visual_focus: String,
    /// 美术指导说明
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub art_direction: Option<String>,
    /// 本分镜的角色外观描述（剧本级描述的子集）
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub character_appearances: BTreeMap<String, String>,
}

impl Panel {
    /// 下游渲染所需的最低要求：编号为正、画面描述与角色列表非空
    pub fn is_well_formed(&self) -> bool {
        self.panel_number > 0
            && !self.scene_description.trim().is_empty()
            && !self.characters.is_empty()
    }

    pub fn primary_dialogue(&self) -> Option<&Dialogue> {
        self.dialogue.first()
    }
}

/// 模型返回的分镜条目：结构正确的分镜，或无法解析的原始 JSON
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PanelEntry {
    Panel(Panel),
    Malformed(serde_json::Value),
}

impl PanelEntry {
    pub fn as_panel(&self) -> Option<&Panel> {
        match self {
            PanelEntry::Panel(panel) => Some(panel),
            PanelEntry::Malformed(_) => None,
        }
    }
}

/// 完整的漫画剧本
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Script {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub theme: String,
    #[serde(default)]
    pub tone: String,
    #[serde(default)]
    pub target_audience: String,
    #[serde(default)]
    pub panels: Vec<PanelEntry>,
    /// 角色名 -> 外观描述
    #[serde(default)]
    pub character_descriptions: BTreeMap<String, String>,
}

impl Script {
    /// 结构正确的分镜（跳过无法解析的条目）
    pub fn structured_panels(&self) -> impl Iterator<Item = &Panel> {
        self.panels.iter().filter_map(PanelEntry::as_panel)
    }

    pub fn structured_panels_mut(&mut self) -> impl Iterator<Item = &mut Panel> {
        self.panels.iter_mut().filter_map(|entry| match entry {
            PanelEntry::Panel(panel) => Some(panel),
            PanelEntry::Malformed(_) => None,
        })
    }
}

/// 生成请求参数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    pub topic: String,
    pub tone: String,
    pub target_audience: String,
    pub visual_style: String,
}

/// 视频生成状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoStatus {
    Generating,
    Completed,
    Failed,
}

/// 漫画元数据（metadata.json）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComicMetadata {
    pub comic_id: String,
    pub title: String,
    pub theme: String,
    pub generated_at: DateTime<Utc>,
    pub panel_count: usize,
    pub generation_params: GenerationParams,
    /// 产物类型 -> 文件路径（script / image / video）
    pub files: BTreeMap<String, String>,
    #[serde(default)]
    pub processing_time_seconds: Option<f64>,
    #[serde(default)]
    pub generation_started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub generation_completed_at: Option<DateTime<Utc>>,
    /// 分镜编号 -> 分镜图片路径
    #[serde(default)]
    pub panel_image_paths: BTreeMap<u32, String>,
    #[serde(default)]
    pub video_url: Option<String>,
    #[serde(default)]
    pub video_status: Option<VideoStatus>,
    #[serde(default)]
    pub video_generation_started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub video_generation_completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub video_processing_time_seconds: Option<f64>,
    #[serde(default)]
    pub panel_video_uris: Vec<String>,
    #[serde(default)]
    pub video_error: Option<String>,
    /// 每次通过 update_metadata 修改后递增
    #[serde(default)]
    pub revision: u64,
}

impl ComicMetadata {
    pub fn script_path(&self) -> Option<&str> {
        self.files.get("script").map(String::as_str)
    }

    pub fn image_path(&self) -> Option<&str> {
        self.files.get("image").map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_panel_entry_accepts_structured_and_malformed() {
        let entries: Vec<PanelEntry> = serde_json::from_value(json!([
            {
                "panel_number": 1,
                "scene_description": "A lab at night",
                "characters": ["Scientist"],
                "dialogue": [{"character": "Scientist", "text": "Eureka!"}],
                "visual_focus": "The glowing flask"
            },
            "just a string",
            {"panel_number": 3}
        ]))
        .unwrap();

        assert!(matches!(entries[0], PanelEntry::Panel(_)));
        assert!(matches!(entries[1], PanelEntry::Malformed(_)));
        assert!(matches!(entries[2], PanelEntry::Malformed(_)));
    }

    #[test]
    fn test_dialogue_defaults_speaker() {
        let dialogue: Dialogue = serde_json::from_value(json!({"text": "Hi"})).unwrap();
        assert_eq!(dialogue.character, "Character");
    }

    #[test]
    fn test_video_status_serializes_lowercase() {
        let value = serde_json::to_value(VideoStatus::Generating).unwrap();
        assert_eq!(value, json!("generating"));
    }

    #[test]
    fn test_well_formed_requires_characters() {
        let panel = Panel {
            panel_number: 2,
            scene_description: "Sunset".to_string(),
            characters: vec![],
            dialogue: vec![],
            visual_focus: String::new(),
            art_direction: None,
            character_appearances: BTreeMap::new(),
        };
        assert!(!panel.is_well_formed());
    }
}
