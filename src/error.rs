use std::time::Duration;
use thiserror::Error;

/// 漫画生成流程中需要显式上报的错误
#[derive(Error, Debug)]
pub enum ComicError {
    #[error("API error: {0}")]
    Api(String),

    /// 拼版时没有任何分镜图片，属于不可恢复的输入错误
    #[error("no panels to combine")]
    NoPanels,

    #[error("video generation for panel {panel} timed out after {}s", waited.as_secs())]
    VideoTimeout { panel: u32, waited: Duration },

    #[error("video operation for panel {panel} failed: {reason}")]
    VideoOperation { panel: u32, reason: String },

    /// 所有分镜视频都失败，视频阶段整体失败
    #[error("no panel videos were generated successfully")]
    NoClips,

    #[error("video generation already in progress for comic {0}")]
    VideoInProgress(String),

    #[error("video generation is not configured: {0}")]
    VideoUnavailable(String),

    #[error("failed to join panel videos: {0}")]
    Join(String),

    #[error("comic not found: {0}")]
    NotFound(String),

    /// 只接受由单词字符组成的 ID，防止拼出漫画目录以外的路径
    #[error("invalid comic id: {0:?}")]
    InvalidComicId(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, ComicError>;
