pub mod config;
pub mod error;
pub mod models;
pub mod provider;
pub mod genai;
pub mod storage;
pub mod script;
pub mod validator;
pub mod placeholder;
pub mod artwork;
pub mod compositor;
pub mod clip_probe;
pub mod video;
pub mod store;
pub mod pipeline;

#[cfg(test)]
pub(crate) mod testing;

pub use config::{AppConfig, ConfigLoader, ConfigOverrides};
pub use error::{ComicError, Result};
pub use models::{ComicMetadata, Dialogue, Panel, PanelEntry, Script, VideoStatus};
pub use provider::{ClipStore, ImageModel, TextModel, VideoModel};
pub use genai::{GenAiClient, VertexVideoClient};
pub use storage::BlobClient;
pub use script::ScriptGenerator;
pub use artwork::{ArtworkGenerator, ComicArtwork};
pub use video::{ClipJoiner, FfmpegJoiner, VideoGenerator, VideoOutcome};
pub use store::{ComicStore, MetadataStore};
pub use pipeline::{BatchReport, ComicEngine};
