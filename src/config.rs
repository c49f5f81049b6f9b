use anyhow::{Context, Result};
use configparser::ini::Ini;
use std::collections::BTreeMap;
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// 文本模型（剧本生成）配置
#[derive(Debug, Clone)]
pub struct TextModelConfig {
    pub api_key: Option<String>,
    pub model_name: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub base_url: String,
}

impl Default for TextModelConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            model_name: "gemini-2.5-flash".to_string(),
            temperature: 0.7,
            max_tokens: 10000,
            base_url: GEMINI_BASE_URL.to_string(),
        }
    }
}

/// 图像模型（分镜作画）配置
#[derive(Debug, Clone)]
pub struct ImageModelConfig {
    pub api_key: Option<String>,
    pub model_name: String,
    /// 标准分镜边长（像素），生成结果统一缩放到该尺寸
    pub image_size: u32,
    pub aspect_ratio: String,
    pub base_url: String,
}

impl Default for ImageModelConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            model_name: "imagen-4.0-generate-preview-06-06".to_string(),
            image_size: 1024,
            aspect_ratio: "1:1".to_string(),
            base_url: GEMINI_BASE_URL.to_string(),
        }
    }
}

/// 视频模型（分镜动画）配置
#[derive(Debug, Clone)]
pub struct VideoModelConfig {
    pub project_id: Option<String>,
    pub location: String,
    pub model_name: String,
    pub aspect_ratio: String,
    /// 每个分镜片段时长（秒）
    pub clip_duration_secs: u32,
    /// 生成结果输出的 Cloud Storage bucket（不含 gs:// 前缀）
    pub gcs_bucket: Option<String>,
    /// Vertex AI 访问令牌
    pub access_token: Option<String>,
    /// 首次轮询间隔
    pub poll_interval: Duration,
    /// 每次轮询后间隔的放大倍数
    pub poll_backoff: f64,
    pub max_poll_interval: Duration,
    /// 单个分镜等待的总时长上限
    pub timeout: Duration,
}

impl Default for VideoModelConfig {
    fn default() -> Self {
        Self {
            project_id: None,
            location: "us-central1".to_string(),
            model_name: "veo-3.0-generate-001".to_string(),
            aspect_ratio: "16:9".to_string(),
            clip_duration_secs: 8,
            gcs_bucket: None,
            access_token: None,
            poll_interval: Duration::from_secs(15),
            poll_backoff: 1.5,
            max_poll_interval: Duration::from_secs(60),
            timeout: Duration::from_secs(15 * 60),
        }
    }
}

/// 漫画内容相关配置
#[derive(Debug, Clone)]
pub struct ComicConfig {
    pub panels_per_comic: usize,
    pub comic_style: String,
    pub maintain_consistent_cast: bool,
    pub character_consistency_prompt: String,
    /// 示例角色外观（用于提示词参考和模糊匹配）
    pub example_characters: BTreeMap<String, String>,
    /// 是否把每个分镜图片单独保存（视频阶段依赖这些图片）
    pub save_panel_images: bool,
    /// 图像提示词最大长度（字符）
    pub max_prompt_chars: usize,
}

impl Default for ComicConfig {
    fn default() -> Self {
        Self {
            panels_per_comic: 4,
            comic_style: "modern digital comic art".to_string(),
            maintain_consistent_cast: true,
            character_consistency_prompt: "Keep the same character appearances, facial features, clothing, and visual style throughout all panels.".to_string(),
            example_characters: default_example_characters(),
            save_panel_images: true,
            max_prompt_chars: 1200,
        }
    }
}

fn default_example_characters() -> BTreeMap<String, String> {
    [
        ("Hero", "Named Lukas, a young adventurer with short brown hair, green eyes, wearing a blue tunic and brown leather boots. Always has a determined expression and carries a wooden staff."),
        ("Mentor", "Named Merlin, an elderly wizard with a long white beard, wise eyes, purple robes with star patterns, and a tall pointed hat. Walks with a gnarled wooden staff."),
        ("Companion", "Named Pip, a small, fluffy golden-brown hamster with bright black eyes, chubby cheeks often stuffed with food, and tiny pink paws. Wears a tiny blue vest with silver buttons and often perches on the hero's shoulder."),
        ("Villain", "Named Crimsonscythe, a tall figure in dark crimson armor with burning yellow eyes visible through the helmet visor. Black cape and a massive curved scythe wreathed in hellfire."),
        ("Shopkeeper", "Named Martha, a plump, cheerful merchant with curly gray hair, rosy cheeks, wearing a green apron over brown clothes. Always smiling and welcoming."),
    ]
    .into_iter()
    .map(|(name, desc)| (name.to_string(), desc.to_string()))
    .collect()
}

/// Cloud Storage 下载凭证
#[derive(Debug, Clone, Default)]
pub struct StorageConfig {
    /// HMAC 互操作密钥 ID
    pub hmac_access_id: Option<String>,
    pub hmac_secret: Option<String>,
    /// OAuth 访问令牌（没有 HMAC 密钥时使用）
    pub access_token: Option<String>,
}

/// 应用配置，由调用方显式传给各个阶段
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub text: TextModelConfig,
    pub image: ImageModelConfig,
    pub video: VideoModelConfig,
    pub comic: ComicConfig,
    pub storage: StorageConfig,
    /// 漫画输出根目录（每个漫画一个子目录）
    pub output_dir: PathBuf,
    /// 批量生成时两次请求之间的间隔
    pub batch_delay: Duration,
    /// 日志级别（trace, debug, info, warn, error）
    pub log_level: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            text: TextModelConfig::default(),
            image: ImageModelConfig::default(),
            video: VideoModelConfig::default(),
            comic: ComicConfig::default(),
            storage: StorageConfig::default(),
            output_dir: PathBuf::from("output/comics"),
            batch_delay: Duration::from_secs(2),
            log_level: "info".to_string(),
        }
    }
}

/// 命令行覆盖项（优先级最高）
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub output_dir: Option<PathBuf>,
    pub log_level: Option<String>,
    pub panels_per_comic: Option<usize>,
}

/// 配置加载器
pub struct ConfigLoader;

impl ConfigLoader {
    /// 从多个源加载配置，优先级：命令行参数 > 环境变量 > 配置文件 > 默认值
    pub fn load_config(config_file: Option<&Path>, overrides: &ConfigOverrides) -> Result<AppConfig> {
        // 1. 配置文件：显式指定的文件必须可读，默认位置找不到则使用默认值
        let mut config = match config_file {
            Some(path) => Self::load_from_file(path)?,
            None => Self::load_from_default_locations().unwrap_or_default(),
        };

        // 2. 环境变量
        Self::apply_env(&mut config, |key| env::var(key).ok());

        // 3. 命令行参数
        if let Some(dir) = &overrides.output_dir {
            config.output_dir = dir.clone();
        }
        if let Some(level) = &overrides.log_level {
            config.log_level = level.clone();
        }
        if let Some(panels) = overrides.panels_per_comic {
            config.comic.panels_per_comic = panels;
        }

        Ok(config)
    }

    /// 用环境变量覆盖配置
    fn apply_env(config: &mut AppConfig, lookup: impl Fn(&str) -> Option<String>) {
        let lookup = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(key) = lookup("GEMINI_API_KEY") {
            config.text.api_key = Some(key.clone());
            config.image.api_key = Some(key);
        }
        if let Some(project) = lookup("GOOGLE_CLOUD_PROJECT") {
            config.video.project_id = Some(project);
        }
        if let Some(location) = lookup("GOOGLE_CLOUD_LOCATION") {
            config.video.location = location;
        }
        if let Some(token) = lookup("GOOGLE_CLOUD_ACCESS_TOKEN") {
            config.video.access_token = Some(token.clone());
            config.storage.access_token = Some(token);
        }
        if let Some(bucket) = lookup("GCS_BUCKET") {
            config.video.gcs_bucket = Some(normalize_bucket(&bucket));
        }
        if let Some(id) = lookup("GCS_HMAC_ACCESS_ID") {
            config.storage.hmac_access_id = Some(id);
        }
        if let Some(secret) = lookup("GCS_HMAC_SECRET") {
            config.storage.hmac_secret = Some(secret);
        }
        if let Some(dir) = lookup("COMICS_OUTPUT_DIR") {
            config.output_dir = PathBuf::from(dir);
        }
        if let Some(panels) = lookup("COMICS_PANELS").and_then(|v| v.trim().parse().ok()) {
            config.comic.panels_per_comic = panels;
        }
        if let Some(level) = lookup("LOG_LEVEL") {
            config.log_level = level;
        }
    }

    /// 从INI配置文件加载配置
    fn load_from_file(config_path: &Path) -> Result<AppConfig> {
        if !config_path.exists() {
            return Err(anyhow::anyhow!("配置文件不存在: {}", config_path.display()));
        }

        let mut ini = Ini::new_cs();
        ini.load(config_path)
            .map_err(|e| anyhow::anyhow!("读取配置文件失败: {}: {}", config_path.display(), e))?;

        let mut config = AppConfig::default();

        // [text_model]
        let api_key = ini_value(&ini, "text_model", "api_key");
        config.text.api_key = api_key.clone();
        if let Some(model) = ini_value(&ini, "text_model", "model_name") {
            config.text.model_name = model;
        }
        if let Some(temperature) = ini_parse(&ini, "text_model", "temperature") {
            config.text.temperature = temperature;
        }
        if let Some(max_tokens) = ini_parse(&ini, "text_model", "max_tokens") {
            config.text.max_tokens = max_tokens;
        }

        // [image_model]，未单独配置 api_key 时沿用文本模型的 key
        config.image.api_key = ini_value(&ini, "image_model", "api_key").or(api_key);
        if let Some(model) = ini_value(&ini, "image_model", "model_name") {
            config.image.model_name = model;
        }
        if let Some(size) = ini_parse(&ini, "image_model", "image_size") {
            config.image.image_size = size;
        }
        if let Some(ratio) = ini_value(&ini, "image_model", "aspect_ratio") {
            config.image.aspect_ratio = ratio;
        }

        // [video_model]
        config.video.project_id = ini_value(&ini, "video_model", "project_id");
        if let Some(location) = ini_value(&ini, "video_model", "location") {
            config.video.location = location;
        }
        if let Some(model) = ini_value(&ini, "video_model", "model_name") {
            config.video.model_name = model;
        }
        if let Some(ratio) = ini_value(&ini, "video_model", "aspect_ratio") {
            config.video.aspect_ratio = ratio;
        }
        if let Some(duration) = ini_parse(&ini, "video_model", "clip_duration_secs") {
            config.video.clip_duration_secs = duration;
        }
        config.video.gcs_bucket = ini_value(&ini, "video_model", "gcs_bucket").map(|b| normalize_bucket(&b));
        config.video.access_token = ini_value(&ini, "video_model", "access_token");
        if let Some(duration) = ini_duration(&ini, "video_model", "poll_interval_secs")? {
            config.video.poll_interval = duration;
        }
        if let Some(backoff) = ini_parse(&ini, "video_model", "poll_backoff") {
            config.video.poll_backoff = backoff;
        }
        if let Some(duration) = ini_duration(&ini, "video_model", "max_poll_interval_secs")? {
            config.video.max_poll_interval = duration;
        }
        if let Some(duration) = ini_duration(&ini, "video_model", "timeout_secs")? {
            config.video.timeout = duration;
        }

        // [comic]
        if let Some(panels) = ini_parse(&ini, "comic", "panels_per_comic") {
            config.comic.panels_per_comic = panels;
        }
        if let Some(style) = ini_value(&ini, "comic", "comic_style") {
            config.comic.comic_style = style;
        }
        if let Some(flag) = ini_bool(&ini, "comic", "maintain_consistent_cast") {
            config.comic.maintain_consistent_cast = flag;
        }
        if let Some(prompt) = ini_value(&ini, "comic", "character_consistency_prompt") {
            config.comic.character_consistency_prompt = prompt;
        }
        if let Some(flag) = ini_bool(&ini, "comic", "save_panel_images") {
            config.comic.save_panel_images = flag;
        }
        if let Some(max) = ini_parse(&ini, "comic", "max_prompt_chars") {
            config.comic.max_prompt_chars = max;
        }

        // [characters] 整体替换示例角色
        if let Some(section) = ini.get_map_ref().get("characters") {
            let characters: BTreeMap<String, String> = section
                .iter()
                .filter_map(|(name, desc)| {
                    desc.as_ref()
                        .filter(|d| !d.trim().is_empty())
                        .map(|d| (name.clone(), d.trim().to_string()))
                })
                .collect();
            if !characters.is_empty() {
                config.comic.example_characters = characters;
            }
        }

        // [storage]
        config.storage.hmac_access_id = ini_value(&ini, "storage", "hmac_access_id");
        config.storage.hmac_secret = ini_value(&ini, "storage", "hmac_secret");
        config.storage.access_token = ini_value(&ini, "storage", "access_token")
            .or_else(|| config.video.access_token.clone());

        // [output]
        if let Some(dir) = ini_value(&ini, "output", "output_dir") {
            config.output_dir = PathBuf::from(dir);
        }
        if let Some(duration) = ini_duration(&ini, "output", "batch_delay_secs")? {
            config.batch_delay = duration;
        }

        // [logging]
        if let Some(level) = ini_value(&ini, "logging", "level") {
            config.log_level = level;
        }

        Ok(config)
    }

    /// 从默认位置加载配置文件
    fn load_from_default_locations() -> Result<AppConfig> {
        // 1. 当前目录的 daily-comics.ini
        let current_dir_config = PathBuf::from("daily-comics.ini");
        if current_dir_config.exists() {
            return Self::load_from_file(&current_dir_config);
        }

        // 2. 当前目录的 .daily-comics.ini
        let hidden_config = PathBuf::from(".daily-comics.ini");
        if hidden_config.exists() {
            return Self::load_from_file(&hidden_config);
        }

        // 3. 用户主目录的 .daily-comics.ini
        if let Some(home) = env::var_os("HOME") {
            let home_config = PathBuf::from(home).join(".daily-comics.ini");
            if home_config.exists() {
                return Self::load_from_file(&home_config);
            }
        }

        // 4. /etc/daily-comics.ini (Linux/macOS)
        let etc_config = PathBuf::from("/etc/daily-comics.ini");
        if etc_config.exists() {
            return Self::load_from_file(&etc_config);
        }

        Err(anyhow::anyhow!("未找到配置文件"))
    }

    /// 创建默认配置文件
    pub fn create_default_config(config_path: &Path) -> Result<()> {
        let defaults = AppConfig::default();
        let mut ini = Ini::new_cs();

        ini.set("text_model", "api_key", Some(String::new()));
        ini.set("text_model", "model_name", Some(defaults.text.model_name.clone()));
        ini.set("text_model", "temperature", Some(defaults.text.temperature.to_string()));
        ini.set("text_model", "max_tokens", Some(defaults.text.max_tokens.to_string()));

        ini.set("image_model", "model_name", Some(defaults.image.model_name.clone()));
        ini.set("image_model", "image_size", Some(defaults.image.image_size.to_string()));
        ini.set("image_model", "aspect_ratio", Some(defaults.image.aspect_ratio.clone()));

        ini.set("video_model", "project_id", Some(String::new()));
        ini.set("video_model", "location", Some(defaults.video.location.clone()));
        ini.set("video_model", "model_name", Some(defaults.video.model_name.clone()));
        ini.set("video_model", "aspect_ratio", Some(defaults.video.aspect_ratio.clone()));
        ini.set("video_model", "clip_duration_secs", Some(defaults.video.clip_duration_secs.to_string()));
        ini.set("video_model", "gcs_bucket", Some(String::new()));
        ini.set("video_model", "poll_interval_secs", Some(defaults.video.poll_interval.as_secs().to_string()));
        ini.set("video_model", "poll_backoff", Some(defaults.video.poll_backoff.to_string()));
        ini.set("video_model", "max_poll_interval_secs", Some(defaults.video.max_poll_interval.as_secs().to_string()));
        ini.set("video_model", "timeout_secs", Some(defaults.video.timeout.as_secs().to_string()));

        ini.set("comic", "panels_per_comic", Some(defaults.comic.panels_per_comic.to_string()));
        ini.set("comic", "comic_style", Some(defaults.comic.comic_style.clone()));
        ini.set("comic", "maintain_consistent_cast", Some(defaults.comic.maintain_consistent_cast.to_string()));
        ini.set("comic", "character_consistency_prompt", Some(defaults.comic.character_consistency_prompt.clone()));
        ini.set("comic", "save_panel_images", Some(defaults.comic.save_panel_images.to_string()));
        ini.set("comic", "max_prompt_chars", Some(defaults.comic.max_prompt_chars.to_string()));

        for (name, desc) in &defaults.comic.example_characters {
            ini.set("characters", name, Some(desc.clone()));
        }

        ini.set("storage", "hmac_access_id", Some(String::new()));
        ini.set("storage", "hmac_secret", Some(String::new()));

        ini.set("output", "output_dir", Some(defaults.output_dir.to_string_lossy().to_string()));
        ini.set("output", "batch_delay_secs", Some(defaults.batch_delay.as_secs().to_string()));
        ini.set("logging", "level", Some(defaults.log_level.clone()));

        ini.write(config_path)
            .with_context(|| format!("写入配置文件失败: {}", config_path.display()))?;

        Ok(())
    }
}

/// 读取配置项：先查指定节，再查 [DEFAULT] 节，空值视为未设置
fn ini_value(ini: &Ini, section: &str, key: &str) -> Option<String> {
    ini.get(section, key)
        .or_else(|| ini.get("DEFAULT", key))
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn ini_parse<T: FromStr>(ini: &Ini, section: &str, key: &str) -> Option<T> {
    ini_value(ini, section, key).and_then(|v| v.parse().ok())
}

/// 秒数配置；负数、NaN、无穷大等无法表示为时长的值报错
fn ini_duration(ini: &Ini, section: &str, key: &str) -> Result<Option<Duration>> {
    let Some(secs) = ini_parse::<f64>(ini, section, key) else {
        return Ok(None);
    };
    Duration::try_from_secs_f64(secs)
        .map(Some)
        .with_context(|| format!("[{}] {} 不是有效的秒数: {}", section, key, secs))
}

fn ini_bool(ini: &Ini, section: &str, key: &str) -> Option<bool> {
    ini_value(ini, section, key).and_then(|v| match v.to_lowercase().as_str() {
        "true" | "yes" | "1" | "on" => Some(true),
        "false" | "no" | "0" | "off" => Some(false),
        _ => None,
    })
}

/// 去掉 gs:// 前缀和末尾的 /
fn normalize_bucket(bucket: &str) -> String {
    bucket
        .trim()
        .trim_start_matches("gs://")
        .trim_end_matches('/')
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_load_from_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daily-comics.ini");
        std::fs::write(
            &path,
            "[text_model]\napi_key = secret\nmodel_name = gemini-test\n\n\
             [comic]\npanels_per_comic = 6\nmaintain_consistent_cast = false\n\n\
             [characters]\nRobot = A shiny chrome robot with blue eyes\n\n\
             [video_model]\ngcs_bucket = gs://my-bucket/\npoll_interval_secs = 0.5\n\n\
             [output]\nbatch_delay_secs = 0\n",
        )
        .unwrap();

        let config = ConfigLoader::load_from_file(&path).unwrap();
        assert_eq!(config.text.api_key.as_deref(), Some("secret"));
        assert_eq!(config.image.api_key.as_deref(), Some("secret"));
        assert_eq!(config.text.model_name, "gemini-test");
        assert_eq!(config.comic.panels_per_comic, 6);
        assert!(!config.comic.maintain_consistent_cast);
        assert_eq!(config.comic.example_characters.len(), 1);
        assert!(config.comic.example_characters.contains_key("Robot"));
        assert_eq!(config.video.gcs_bucket.as_deref(), Some("my-bucket"));
        assert_eq!(config.video.poll_interval, Duration::from_millis(500));
        assert_eq!(config.batch_delay, Duration::ZERO);
        // 未配置的项保持默认值
        assert_eq!(config.image.image_size, 1024);
    }

    #[test]
    fn test_invalid_durations_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        for value in ["inf", "NaN", "-3"] {
            let path = dir.path().join("daily-comics.ini");
            std::fs::write(&path, format!("[video_model]\ntimeout_secs = {}\n", value)).unwrap();
            let error = ConfigLoader::load_from_file(&path).unwrap_err();
            assert!(error.to_string().contains("timeout_secs"), "{}: {}", value, error);
        }

        let path = dir.path().join("ok.ini");
        std::fs::write(&path, "[output]\nbatch_delay_secs = 1.5\n").unwrap();
        let config = ConfigLoader::load_from_file(&path).unwrap();
        assert_eq!(config.batch_delay, Duration::from_millis(1500));
    }

    #[test]
    fn test_missing_explicit_file_is_error() {
        let result = ConfigLoader::load_config(
            Some(Path::new("/nonexistent/daily-comics.ini")),
            &ConfigOverrides::default(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_env_overrides_file_values() {
        let mut config = AppConfig::default();
        let vars: HashMap<&str, &str> = [
            ("GEMINI_API_KEY", "env-key"),
            ("GCS_BUCKET", "gs://env-bucket"),
            ("COMICS_PANELS", "3"),
            ("LOG_LEVEL", ""),
        ]
        .into_iter()
        .collect();

        ConfigLoader::apply_env(&mut config, |key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(config.text.api_key.as_deref(), Some("env-key"));
        assert_eq!(config.video.gcs_bucket.as_deref(), Some("env-bucket"));
        assert_eq!(config.comic.panels_per_comic, 3);
        // 空字符串不覆盖
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_default_config_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("generated.ini");
        ConfigLoader::create_default_config(&path).unwrap();

        let config = ConfigLoader::load_from_file(&path).unwrap();
        let defaults = AppConfig::default();
        assert_eq!(config.comic.panels_per_comic, defaults.comic.panels_per_comic);
        assert_eq!(config.comic.example_characters, defaults.comic.example_characters);
        assert_eq!(config.video.timeout, defaults.video.timeout);
        assert!(config.text.api_key.is_none());
    }
}
