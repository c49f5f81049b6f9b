use crate::config::ComicConfig;
use crate::models::{Dialogue, Panel, PanelEntry, Script};
use crate::provider::TextModel;
use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// 兜底剧本的固定分镜数
pub const FALLBACK_PANEL_COUNT: usize = 4;

/// 剧本生成阶段
///
/// 调用文本模型生成结构化剧本。模型调用失败、返回非 JSON 或没有分镜时，
/// 返回按主题和基调参数化的固定 4 格兜底剧本，错误不会向上传播。
pub struct ScriptGenerator {
    model: Arc<dyn TextModel>,
    comic: ComicConfig,
}

impl ScriptGenerator {
    pub fn new(model: Arc<dyn TextModel>, comic: ComicConfig) -> Self {
        Self { model, comic }
    }

    pub async fn generate(&self, topic: &str, tone: &str, target_audience: &str) -> Script {
        let start = Instant::now();
        info!("📝 [剧本生成] 开始生成剧本，主题: {}", topic);

        let mut script = match self.request_script(topic, tone, target_audience).await {
            Ok(script) => {
                info!(
                    "✅ [剧本生成] 剧本生成成功，共 {} 个分镜，耗时: {:.2}秒",
                    script.panels.len(),
                    start.elapsed().as_secs_f64()
                );
                script
            }
            Err(e) => {
                error!("❌ [剧本生成] 剧本生成失败: {:#}", e);
                self.fallback_script(topic, tone)
            }
        };

        repair_fields(&mut script, topic, tone, target_audience);
        self.ensure_consistency(&mut script);
        script
    }

    async fn request_script(&self, topic: &str, tone: &str, target_audience: &str) -> Result<Script> {
        let prompt = self.build_prompt(topic, tone, target_audience);
        debug!("📝 [剧本生成] 提示词: {}", prompt);

        let response = self.model.generate_json(&prompt).await?;
        let script: Script = serde_json::from_str(strip_code_fence(&response))
            .context("剧本 JSON 解析失败")?;

        if script.panels.is_empty() {
            anyhow::bail!("模型返回的剧本没有分镜");
        }
        Ok(script)
    }

    fn build_prompt(&self, topic: &str, tone: &str, target_audience: &str) -> String {
        let mut examples_prompt = String::new();
        if self.comic.maintain_consistent_cast && !self.comic.example_characters.is_empty() {
            let examples: Vec<String> = self
                .comic
                .example_characters
                .iter()
                .map(|(name, desc)| format!("- {}: {}", name, desc))
                .collect();
            examples_prompt = format!(
                "Character Consistency Examples (use these as reference for consistent character designs):\n{}\n\n\
                 When creating new characters, provide similarly detailed descriptions for visual consistency.\n\
                 Every character must keep exactly the same appearance, clothing, colors and proportions in every panel. \
                 Do not change how a character looks between panels.\n",
                examples.join("\n")
            );
        }

        format!(
            r#"Create a {panels}-panel comic script about: {topic}

Requirements:
- Tone: {tone}
- Target audience: {audience}
- Style: {style}
- Each panel should have engaging visuals and clear storytelling

{examples}
Return ONLY a valid JSON object with this exact structure:
{{
  "title": "Engaging Comic Title",
  "theme": "Brief theme description",
  "tone": "{tone}",
  "target_audience": "{audience}",
  "character_descriptions": {{
    "Character1": "Detailed, fixed visual description of Character1"
  }},
  "panels": [
    {{
      "panel_number": 1,
      "scene_description": "Detailed visual description of what's happening in this panel",
      "characters": ["Character1", "Character2"],
      "dialogue": [
        {{
          "character": "Character1",
          "text": "What they're saying"
        }}
      ],
      "visual_focus": "What should be the main visual element",
      "art_direction": "Specific visual style notes for this panel"
    }}
  ]
}}

Make it creative, engaging, and appropriate for the {audience} audience with a {tone} tone.
"#,
            panels = self.comic.panels_per_comic,
            topic = topic,
            tone = tone,
            audience = target_audience,
            style = self.comic.comic_style,
            examples = examples_prompt,
        )
    }

    /// 兜底剧本，只依赖主题和基调
    fn fallback_script(&self, topic: &str, tone: &str) -> Script {
        info!("📝 [剧本生成] 使用兜底剧本");

        let style = &self.comic.comic_style;
        let beats = [
            (
                format!("Introduction to {}", topic),
                format!("Let me tell you about {}!", topic),
                "Character introduction",
                "clear character introduction",
            ),
            (
                format!("Exploring the world of {}", topic),
                "This is fascinating!".to_string(),
                "World building",
                "detailed background",
            ),
            (
                format!("Discovering something interesting about {}", topic),
                "I never knew this!".to_string(),
                "Discovery moment",
                "moment of realization",
            ),
            (
                format!("Conclusion about {}", topic),
                "What an adventure!".to_string(),
                "Happy conclusion",
                "satisfying ending",
            ),
        ];

        let panels = beats
            .into_iter()
            .take(FALLBACK_PANEL_COUNT)
            .enumerate()
            .map(|(i, (scene, line, focus, direction))| {
                PanelEntry::Panel(Panel {
                    panel_number: i as u32 + 1,
                    scene_description: scene,
                    characters: vec!["Protagonist".to_string()],
                    dialogue: vec![Dialogue::new("Protagonist", line)],
                    visual_focus: focus.to_string(),
                    art_direction: Some(format!("{}, {}", style, direction)),
                    character_appearances: BTreeMap::new(),
                })
            })
            .collect();

        Script {
            title: format!("Comic about {}", topic),
            theme: format!("A {} story about {}", tone, topic),
            tone: tone.to_string(),
            target_audience: "general".to_string(),
            panels,
            character_descriptions: BTreeMap::new(),
        }
    }

    /// 角色一致性处理
    ///
    /// - 每个出场角色在剧本级描述中都有条目（缺失时生成通用描述）
    /// - 每个分镜的 character_appearances 从剧本级描述补全
    /// - 开启角色一致性时，在 art_direction 中追加每个角色的提醒（已存在则跳过）
    fn ensure_consistency(&self, script: &mut Script) {
        let mut descriptions = std::mem::take(&mut script.character_descriptions);

        for panel in script.structured_panels() {
            for name in &panel.characters {
                if !descriptions.contains_key(name) {
                    debug!("📝 [剧本生成] 为角色 {} 生成通用描述", name);
                    descriptions.insert(name.clone(), generic_description(name));
                }
            }
        }

        let remind = self.comic.maintain_consistent_cast;
        for panel in script.structured_panels_mut() {
            for name in &panel.characters {
                if let Some(desc) = descriptions.get(name) {
                    panel
                        .character_appearances
                        .entry(name.clone())
                        .or_insert_with(|| desc.clone());
                }
            }

            if remind {
                for name in &panel.characters {
                    let reminder = consistency_reminder(name);
                    let direction = panel.art_direction.get_or_insert_with(String::new);
                    if direction.contains(&reminder) {
                        continue;
                    }
                    if !direction.is_empty() {
                        direction.push_str(". ");
                    }
                    direction.push_str(&reminder);
                }
            }
        }

        script.character_descriptions = descriptions;
    }
}

/// 补全模型可能遗漏的顶层字段
fn repair_fields(script: &mut Script, topic: &str, tone: &str, target_audience: &str) {
    if script.title.trim().is_empty() {
        warn!("⚠️  [剧本生成] 剧本缺少标题，使用默认标题");
        script.title = format!("Comic about {}", topic);
    }
    if script.theme.trim().is_empty() {
        script.theme = format!("A {} story about {}", tone, topic);
    }
    if script.tone.trim().is_empty() {
        script.tone = tone.to_string();
    }
    if script.target_audience.trim().is_empty() {
        script.target_audience = target_audience.to_string();
    }
}

fn generic_description(name: &str) -> String {
    format!(
        "{} with a distinctive, consistent appearance: the same face, hairstyle, clothing and color palette in every panel",
        name
    )
}

fn consistency_reminder(name: &str) -> String {
    format!("Keep {} visually identical to previous panels", name)
}

/// 去掉模型输出外层的 Markdown 代码块标记
pub fn strip_code_fence(text: &str) -> &str {
    text.trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim()
}
