use crate::error::{ComicError, Result};
use crate::models::{ComicMetadata, Script};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};

pub const SCRIPT_FILE: &str = "script.json";
pub const IMAGE_FILE: &str = "comic.png";
pub const METADATA_FILE: &str = "metadata.json";

/// 检查漫画 ID：非空，只含字母、数字和下划线（与生成的 ID 字符集一致）
pub fn check_comic_id(comic_id: &str) -> Result<()> {
    let valid = !comic_id.is_empty() && comic_id.chars().all(|c| c.is_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(ComicError::InvalidComicId(comic_id.to_string()))
    }
}

/// 视频阶段读写漫画数据的窄接口
pub trait MetadataStore: Send + Sync {
    /// 漫画自己的资源目录
    fn comic_dir(&self, comic_id: &str) -> PathBuf;

    fn load_metadata(&self, comic_id: &str) -> Result<ComicMetadata>;

    fn load_script(&self, comic_id: &str) -> Result<Script>;

    /// 读取 - 修改 - 写回，revision 加一，返回修改后的元数据
    fn update_metadata(
        &self,
        comic_id: &str,
        apply: &mut dyn FnMut(&mut ComicMetadata),
    ) -> Result<ComicMetadata>;
}

/// 按漫画 ID 分目录的本地存储
///
/// ```text
/// <output_dir>/<comic_id>/
///     script.json
///     comic.png
///     metadata.json
///     panel_<n>_image.png
///     panel_<n>_video.mp4
///     final_video.mp4
/// ```
pub struct ComicStore {
    output_dir: PathBuf,
    /// 串行化同一进程内的元数据更新
    update_lock: Mutex<()>,
}

impl ComicStore {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            update_lock: Mutex::new(()),
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// 为新漫画创建目录；目录已存在时追加数字后缀，返回最终 ID
    pub fn allocate(&self, comic_id: &str) -> Result<(String, PathBuf)> {
        check_comic_id(comic_id)?;
        fs::create_dir_all(&self.output_dir)?;

        let mut candidate = comic_id.to_string();
        let mut suffix = 2;
        loop {
            let dir = self.output_dir.join(&candidate);
            match fs::create_dir(&dir) {
                Ok(()) => return Ok((candidate, dir)),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    candidate = format!("{}_{}", comic_id, suffix);
                    suffix += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    pub fn write_script(&self, comic_id: &str, script: &Script) -> Result<PathBuf> {
        check_comic_id(comic_id)?;
        let path = self.comic_dir(comic_id).join(SCRIPT_FILE);
        write_atomic(&path, serde_json::to_string_pretty(script)?.as_bytes())?;
        Ok(path)
    }

    pub fn write_image(&self, comic_id: &str, png: &[u8]) -> Result<PathBuf> {
        check_comic_id(comic_id)?;
        let path = self.comic_dir(comic_id).join(IMAGE_FILE);
        write_atomic(&path, png)?;
        Ok(path)
    }

    /// 写入元数据（新建漫画时使用；已有漫画请用 update_metadata）
    pub fn save_metadata(&self, metadata: &ComicMetadata) -> Result<PathBuf> {
        check_comic_id(&metadata.comic_id)?;
        let path = self.comic_dir(&metadata.comic_id).join(METADATA_FILE);
        write_atomic(&path, serde_json::to_string_pretty(metadata)?.as_bytes())?;
        debug!("💾 [存储] 元数据已保存: {} (revision {})", path.display(), metadata.revision);
        Ok(path)
    }

    /// 所有可读的漫画元数据，按生成时间从新到旧
    pub fn list(&self) -> Result<Vec<ComicMetadata>> {
        let entries = match fs::read_dir(&self.output_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut comics = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let metadata_path = path.join(METADATA_FILE);
            if !metadata_path.exists() {
                continue;
            }
            match read_json::<ComicMetadata>(&metadata_path) {
                Ok(metadata) => comics.push(metadata),
                Err(e) => warn!(
                    "⚠️  [存储] 无法读取 {} 的元数据: {}",
                    entry.file_name().to_string_lossy(),
                    e
                ),
            }
        }

        comics.sort_by(|a, b| b.generated_at.cmp(&a.generated_at));
        Ok(comics)
    }
}

impl MetadataStore for ComicStore {
    fn comic_dir(&self, comic_id: &str) -> PathBuf {
        self.output_dir.join(comic_id)
    }

    fn load_metadata(&self, comic_id: &str) -> Result<ComicMetadata> {
        check_comic_id(comic_id)?;
        let path = self.comic_dir(comic_id).join(METADATA_FILE);
        if !path.exists() {
            return Err(ComicError::NotFound(comic_id.to_string()));
        }
        read_json(&path)
    }

    fn load_script(&self, comic_id: &str) -> Result<Script> {
        check_comic_id(comic_id)?;
        let path = self.comic_dir(comic_id).join(SCRIPT_FILE);
        if !path.exists() {
            return Err(ComicError::NotFound(comic_id.to_string()));
        }
        read_json(&path)
    }

    fn update_metadata(
        &self,
        comic_id: &str,
        apply: &mut dyn FnMut(&mut ComicMetadata),
    ) -> Result<ComicMetadata> {
        check_comic_id(comic_id)?;
        let _guard = self
            .update_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let mut metadata = self.load_metadata(comic_id)?;
        apply(&mut metadata);
        metadata.comic_id = comic_id.to_string();
        metadata.revision += 1;
        self.save_metadata(&metadata)?;
        Ok(metadata)
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let content = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

/// 先写临时文件再重命名，避免读到写了一半的文件
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)?;
    Ok(())
}
