use crate::compositor::{self, encode_png};
use crate::config::{ComicConfig, ImageModelConfig};
use crate::error::Result;
use crate::models::Panel;
use crate::placeholder;
use crate::provider::{ImageModel, ImageRequest};
use anyhow::Context;
use image::imageops::{self, FilterType};
use image::RgbImage;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

const DIALOGUE_SUMMARY_CHARS: usize = 100;

/// 分镜图片的来源
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtworkSource {
    /// 图像模型生成
    Model,
    /// 程序化占位图
    Placeholder,
    /// 最简占位图（边框 + 编号）
    Minimal,
}

/// 单个分镜的作画结果，尺寸总是标准边长
#[derive(Debug, Clone)]
pub struct PanelArt {
    pub image: RgbImage,
    pub source: ArtworkSource,
}

/// 整部漫画的作画结果
#[derive(Debug, Clone)]
pub struct ComicArtwork {
    /// 拼版后的 PNG
    pub composite_png: Vec<u8>,
    /// 实际渲染的分镜数
    pub panel_count: usize,
    /// 分镜编号 -> 已保存的分镜图片路径
    pub panel_image_paths: BTreeMap<u32, String>,
    /// 每个分镜的图片来源（按渲染顺序）
    pub sources: Vec<ArtworkSource>,
}

/// 分镜作画阶段
pub struct ArtworkGenerator {
    /// 未配置图像模型时所有分镜都使用占位图
    model: Option<Arc<dyn ImageModel>>,
    comic: ComicConfig,
    image: ImageModelConfig,
}

impl ArtworkGenerator {
    pub fn new(model: Option<Arc<dyn ImageModel>>, comic: ComicConfig, image: ImageModelConfig) -> Self {
        if model.is_none() {
            warn!("⚠️  [分镜作画] 未配置图像模型，所有分镜将使用占位图");
        }
        Self { model, comic, image }
    }

    /// 渲染单个分镜，不会失败
    ///
    /// 优先调用图像模型；提示词构建、模型调用或解码中的任何错误都会退回占位图，
    /// 占位图也失败时退回最简占位图。
    pub async fn render_panel(&self, panel: &Panel, style_prompt: &str) -> PanelArt {
        if let Some(model) = &self.model {
            match self.generate_with_model(model.as_ref(), panel, style_prompt).await {
                Ok(image) => {
                    return PanelArt {
                        image,
                        source: ArtworkSource::Model,
                    }
                }
                Err(e) => {
                    error!("❌ [分镜作画] 分镜 {} 图像生成失败: {:#}", panel.panel_number, e);
                }
            }
        }
        self.render_placeholder(panel)
    }

    fn render_placeholder(&self, panel: &Panel) -> PanelArt {
        let (image, source) = match placeholder::render_placeholder(panel) {
            Ok(image) => (image, ArtworkSource::Placeholder),
            Err(e) => {
                error!("❌ [分镜作画] 分镜 {} 占位图绘制失败: {:#}", panel.panel_number, e);
                (placeholder::render_minimal(panel.panel_number), ArtworkSource::Minimal)
            }
        };
        info!("🖼️  [分镜作画] 分镜 {} 使用{}", panel.panel_number, match source {
            ArtworkSource::Minimal => "最简占位图",
            _ => "占位图",
        });
        PanelArt {
            image: self.normalize(image),
            source,
        }
    }

    async fn generate_with_model(
        &self,
        model: &dyn ImageModel,
        panel: &Panel,
        style_prompt: &str,
    ) -> anyhow::Result<RgbImage> {
        let start = Instant::now();
        let prompt = self.build_prompt(panel, style_prompt);
        info!(
            "🎨 [分镜作画] 分镜 {} 提示词: {}",
            panel.panel_number,
            prompt.chars().take(150).collect::<String>()
        );

        let request = ImageRequest {
            aspect_ratio: self.image.aspect_ratio.clone(),
            sample_count: 1,
        };
        let bytes = model.generate_image(&prompt, &request).await?;
        let decoded = image::load_from_memory(&bytes).context("解码模型返回的图片失败")?;
        let image = self.normalize(decoded.to_rgb8());

        info!(
            "✅ [分镜作画] 分镜 {} 图像生成成功，{}x{}，耗时: {:.2}秒",
            panel.panel_number,
            image.width(),
            image.height(),
            start.elapsed().as_secs_f64()
        );
        Ok(image)
    }

    /// 统一缩放到标准边长
    fn normalize(&self, image: RgbImage) -> RgbImage {
        let size = self.image.image_size;
        if image.dimensions() == (size, size) {
            image
        } else {
            imageops::resize(&image, size, size, FilterType::Lanczos3)
        }
    }

    /// 拼接图像提示词，按字符数截断
    pub fn build_prompt(&self, panel: &Panel, style_prompt: &str) -> String {
        let mut parts = vec![format!("Comic book panel showing: {}", panel.scene_description)];

        if !panel.characters.is_empty() {
            parts.push(format!("Characters: {}", panel.characters.join(", ")));
        }

        let spoken: Vec<&str> = panel.dialogue.iter().map(|d| d.text.as_str()).collect();
        if !spoken.is_empty() {
            let summary: String = spoken.join(" ").chars().take(DIALOGUE_SUMMARY_CHARS).collect();
            parts.push(format!("showing conversation about: {}", summary));
        }

        if !panel.visual_focus.is_empty() {
            parts.push(format!("Main visual element: {}", panel.visual_focus));
        }
        if let Some(direction) = &panel.art_direction {
            parts.push(direction.clone());
        }

        if self.comic.maintain_consistent_cast && !panel.characters.is_empty() {
            let details: Vec<String> = panel
                .characters
                .iter()
                .map(|name| format!("{}: {}", name, self.character_details(panel, name)))
                .collect();
            parts.push(format!("Character details: {}", details.join(" | ")));
            parts.push(self.comic.character_consistency_prompt.clone());
        }

        parts.push(style_prompt.to_string());
        if style_prompt.trim() != self.comic.comic_style.trim() {
            parts.push(self.comic.comic_style.clone());
        }
        parts.push("professional comic book illustration, clear and specific content".to_string());

        let prompt = parts
            .iter()
            .map(|p| p.trim().trim_end_matches('.'))
            .filter(|p| !p.is_empty())
            .collect::<Vec<_>>()
            .join(". ");
        prompt.chars().take(self.comic.max_prompt_chars).collect()
    }

    /// 角色外观查找：分镜自带描述 > 示例角色模糊匹配 > 通用描述
    fn character_details(&self, panel: &Panel, name: &str) -> String {
        if let Some(desc) = panel.character_appearances.get(name) {
            return desc.clone();
        }
        if let Some(desc) = fuzzy_lookup(&self.comic.example_characters, name) {
            return desc.to_string();
        }
        debug!("🎨 [分镜作画] 角色 {} 没有匹配的外观描述，使用通用描述", name);
        "consistent character design matching previous appearances".to_string()
    }

    /// 逐个渲染分镜并拼版
    ///
    /// 分镜按顺序渲染，单个分镜失败只影响自身。`panel_dir` 存在且开启保存时，
    /// 每个分镜另存为 `panel_<编号>_image.png`。
    pub async fn render_comic(
        &self,
        panels: &[Panel],
        style_prompt: &str,
        panel_dir: Option<&Path>,
    ) -> Result<ComicArtwork> {
        let start = Instant::now();
        let total = panels.len();
        let mut images = Vec::with_capacity(total);
        let mut sources = Vec::with_capacity(total);
        let mut panel_image_paths = BTreeMap::new();

        for (i, panel) in panels.iter().enumerate() {
            info!(
                "🎨 [分镜作画] 处理分镜 {}/{}: {}",
                i + 1,
                total,
                panel.scene_description.chars().take(50).collect::<String>()
            );
            let art = self.render_panel(panel, style_prompt).await;

            if let (Some(dir), true) = (panel_dir, self.comic.save_panel_images) {
                match save_panel_image(dir, panel.panel_number, &art.image) {
                    Ok(path) => {
                        panel_image_paths.insert(panel.panel_number, path);
                    }
                    Err(e) => warn!("⚠️  [分镜作画] 保存分镜 {} 图片失败: {:#}", panel.panel_number, e),
                }
            }

            images.push(art.image);
            sources.push(art.source);
            info!("✅ [分镜作画] 分镜 {}/{} 完成", i + 1, total);
        }

        let sheet = compositor::compose(&images)?;
        let composite_png = encode_png(&sheet)?;

        info!(
            "✅ [分镜作画] 漫画作画完成，共 {} 个分镜，耗时: {:.2}秒",
            total,
            start.elapsed().as_secs_f64()
        );

        Ok(ComicArtwork {
            composite_png,
            panel_count: images.len(),
            panel_image_paths,
            sources,
        })
    }
}

/// 大小写不敏感的双向子串匹配，返回第一个命中的描述
pub fn fuzzy_lookup<'a>(catalog: &'a BTreeMap<String, String>, name: &str) -> Option<&'a str> {
    let key = name.trim().to_lowercase();
    if key.is_empty() {
        return None;
    }
    catalog.iter().find_map(|(candidate, desc)| {
        let candidate = candidate.to_lowercase();
        (candidate.contains(&key) || key.contains(&candidate)).then_some(desc.as_str())
    })
}

pub fn panel_image_file_name(panel_number: u32) -> String {
    format!("panel_{}_image.png", panel_number)
}

fn save_panel_image(dir: &Path, panel_number: u32, image: &RgbImage) -> anyhow::Result<String> {
    fs::create_dir_all(dir).context("创建漫画目录失败")?;
    let path = dir.join(panel_image_file_name(panel_number));
    let bytes = encode_png(image)?;
    fs::write(&path, bytes).with_context(|| format!("写入 {} 失败", path.display()))?;
    debug!("💾 [分镜作画] 分镜 {} 图片已保存: {}", panel_number, path.display());
    Ok(path.to_string_lossy().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Dialogue;
    use crate::testing::{png_bytes, MockImageModel};

    fn panel(number: u32, characters: &[&str]) -> Panel {
        Panel {
            panel_number: number,
            scene_description: format!("Scene number {}", number),
            characters: characters.iter().map(|c| c.to_string()).collect(),
            dialogue: vec![Dialogue::new("Hero", "We have to hurry"), Dialogue::new("Mentor", "Patience")],
            visual_focus: "The ticking clock".to_string(),
            art_direction: Some("Warm light".to_string()),
            character_appearances: BTreeMap::new(),
        }
    }

    fn generator(model: Option<MockImageModel>) -> ArtworkGenerator {
        ArtworkGenerator::new(
            model.map(|m| Arc::new(m) as Arc<dyn ImageModel>),
            ComicConfig::default(),
            ImageModelConfig::default(),
        )
    }

    #[test]
    fn test_fuzzy_lookup_matches_substrings_case_insensitively() {
        let catalog = ComicConfig::default().example_characters;
        assert!(fuzzy_lookup(&catalog, "The HERO").unwrap().contains("Lukas"));
        assert!(fuzzy_lookup(&catalog, "mentor").unwrap().contains("Merlin"));
        assert!(fuzzy_lookup(&catalog, "Villa").unwrap().contains("Crimsonscythe"));
        assert!(fuzzy_lookup(&catalog, "Astronaut").is_none());
        assert!(fuzzy_lookup(&catalog, "  ").is_none());
    }

    #[test]
    fn test_prompt_contains_all_parts_in_order() {
        let mut p = panel(1, &["Young Hero", "Astronaut"]);
        p.character_appearances
            .insert("Astronaut".to_string(), "Silver suit, gold visor".to_string());

        let prompt = generator(None).build_prompt(&p, "watercolor");

        assert!(prompt.starts_with("Comic book panel showing: Scene number 1. Characters: Young Hero, Astronaut"));
        assert!(prompt.contains("showing conversation about: We have to hurry Patience"));
        assert!(prompt.contains("Main visual element: The ticking clock. Warm light"));
        assert!(prompt.contains("Young Hero: Named Lukas"));
        assert!(prompt.contains("Astronaut: Silver suit, gold visor"));
        assert!(prompt.contains("watercolor. modern digital comic art"));
        assert!(prompt.ends_with("professional comic book illustration, clear and specific content"));
    }

    #[test]
    fn test_prompt_unknown_character_gets_generic_details() {
        let prompt = generator(None).build_prompt(&panel(1, &["Zorblax"]), "");
        assert!(prompt.contains("Zorblax: consistent character design matching previous appearances"));
    }

    #[test]
    fn test_prompt_is_truncated() {
        let mut p = panel(1, &["Hero"]);
        p.scene_description = "x".repeat(5000);
        let prompt = generator(None).build_prompt(&p, "");
        assert_eq!(prompt.chars().count(), ComicConfig::default().max_prompt_chars);
    }

    #[tokio::test]
    async fn test_model_image_is_normalized() {
        let model = MockImageModel::responding(png_bytes(300, 200));
        let art = generator(Some(model)).render_panel(&panel(1, &["Hero"]), "").await;
        assert_eq!(art.source, ArtworkSource::Model);
        assert_eq!(art.image.dimensions(), (1024, 1024));
    }

    #[tokio::test]
    async fn test_model_failure_falls_back_to_placeholder() {
        let art = generator(Some(MockImageModel::failing()))
            .render_panel(&panel(2, &["Hero"]), "")
            .await;
        assert_eq!(art.source, ArtworkSource::Placeholder);
        assert_eq!(art.image.dimensions(), (1024, 1024));
    }

    #[tokio::test]
    async fn test_undecodable_bytes_fall_back_to_placeholder() {
        let model = MockImageModel::responding(b"definitely not a png".to_vec());
        let art = generator(Some(model)).render_panel(&panel(2, &["Hero"]), "").await;
        assert_eq!(art.source, ArtworkSource::Placeholder);
    }

    #[tokio::test]
    async fn test_render_comic_saves_panels_and_composes() {
        let dir = tempfile::tempdir().unwrap();
        let model = MockImageModel::responding(png_bytes(64, 64)).failing_on_call(2);
        let gen = generator(Some(model));
        let panels: Vec<Panel> = (1..=4).map(|n| panel(n, &["Hero"])).collect();

        let artwork = gen.render_comic(&panels, "ink", Some(dir.path())).await.unwrap();

        assert_eq!(artwork.panel_count, 4);
        assert_eq!(
            artwork.sources,
            vec![
                ArtworkSource::Model,
                ArtworkSource::Placeholder,
                ArtworkSource::Model,
                ArtworkSource::Model
            ]
        );
        for n in 1..=4 {
            let path = dir.path().join(panel_image_file_name(n));
            assert!(path.exists());
            assert_eq!(artwork.panel_image_paths[&n], path.to_string_lossy());
            let saved = image::open(&path).unwrap();
            assert_eq!(saved.width(), 1024);
        }
        let composite = image::load_from_memory(&artwork.composite_png).unwrap();
        assert_eq!(composite.width(), compositor::SHEET_SIZE);
        assert_eq!(composite.height(), compositor::SHEET_SIZE);
    }

    #[tokio::test]
    async fn test_render_comic_with_no_panels_fails() {
        let result = generator(None).render_comic(&[], "", None).await;
        assert!(matches!(result, Err(crate::error::ComicError::NoPanels)));
    }
}
