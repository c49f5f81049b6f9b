use crate::error::{ComicError, Result};
use image::imageops::{self, FilterType};
use image::{ImageFormat, Rgb, RgbImage};
use std::io::Cursor;
use tracing::{info, warn};

/// 单格分镜边长
pub const PANEL_SIZE: u32 = 1024;
/// 分镜之间及四周的留白
pub const MARGIN: u32 = 15;
/// 固定 2x2 画布边长
pub const SHEET_SIZE: u32 = PANEL_SIZE * 2 + MARGIN * 3;

const MAX_SLOTS: usize = 4;

/// 把分镜按 2x2 网格拼成整张漫画
///
/// 画布尺寸固定；超过 4 张的图片被忽略，不足 4 张时空位保持白色。
pub fn compose(panels: &[RgbImage]) -> Result<RgbImage> {
    if panels.is_empty() {
        return Err(ComicError::NoPanels);
    }
    if panels.len() > MAX_SLOTS {
        warn!("⚠️  [拼版] 共 {} 张分镜，只使用前 {} 张", panels.len(), MAX_SLOTS);
    }

    let mut sheet = RgbImage::from_pixel(SHEET_SIZE, SHEET_SIZE, Rgb([255, 255, 255]));
    for (slot, panel) in panels.iter().take(MAX_SLOTS).enumerate() {
        let (x, y) = slot_origin(slot);
        if panel.dimensions() == (PANEL_SIZE, PANEL_SIZE) {
            imageops::overlay(&mut sheet, panel, x, y);
        } else {
            let resized = imageops::resize(panel, PANEL_SIZE, PANEL_SIZE, FilterType::Lanczos3);
            imageops::overlay(&mut sheet, &resized, x, y);
        }
    }

    info!("✅ [拼版] 拼版完成: {} 格, {}x{}", panels.len().min(MAX_SLOTS), SHEET_SIZE, SHEET_SIZE);
    Ok(sheet)
}

/// 左上、右上、左下、右下
fn slot_origin(slot: usize) -> (i64, i64) {
    let col = (slot % 2) as u32;
    let row = (slot / 2) as u32;
    let offset = |i: u32| (MARGIN + i * (PANEL_SIZE + MARGIN)) as i64;
    (offset(col), offset(row))
}

/// 编码为 PNG
pub fn encode_png(image: &RgbImage) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    image.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)?;
    Ok(bytes)
}
