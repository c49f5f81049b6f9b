//! 程序化绘制的占位分镜
//!
//! 图像模型不可用或失败时使用。完整占位图先拼出 SVG，再用 resvg 栅格化；
//! 连这一步都失败时，退回只用 image crate 绘制的最简占位图（边框 + 编号）。

use crate::models::Panel;
use anyhow::{Context, Result};
use image::{Rgb, RgbImage, RgbaImage};
use std::fmt::Write as _;
use std::sync::{Arc, OnceLock};
use tracing::debug;

/// 占位图边长，与标准分镜尺寸一致
pub const PLACEHOLDER_SIZE: u32 = 1024;

const BACKGROUND: &str = "#f0f8ff";
const BORDER: &str = "#2c3e50";
const BORDER_WIDTH: u32 = 12;
const INNER_MARGIN: u32 = 30;
const GRADIENT: [&str; 4] = ["#e3f2fd", "#bbdefb", "#90caf9", "#64b5f6"];

const SCENE_MAX_CHARS: usize = 80;
const LINE_MAX_CHARS: usize = 40;
const MAX_SCENE_LINES: usize = 5;
const LINE_STEP: u32 = 25;
const DIALOGUE_MAX_CHARS: usize = 60;
const FOCUS_MAX_CHARS: usize = 50;

static FONT_DB: OnceLock<Arc<usvg::fontdb::Database>> = OnceLock::new();

fn font_db() -> Arc<usvg::fontdb::Database> {
    FONT_DB
        .get_or_init(|| {
            let mut db = usvg::fontdb::Database::new();
            db.load_system_fonts();
            debug!("🔤 [占位图] 已加载 {} 个系统字体", db.len());
            Arc::new(db)
        })
        .clone()
}

/// 绘制完整占位分镜：边框、渐变背景、换行的画面描述、对话气泡和画面重点
pub fn render_placeholder(panel: &Panel) -> Result<RgbImage> {
    let svg = placeholder_svg(panel);

    let opts = usvg::Options {
        fontdb: font_db(),
        ..Default::default()
    };
    let tree = usvg::Tree::from_str(&svg, &opts).context("解析占位图 SVG 失败")?;

    let mut pixmap = resvg::tiny_skia::Pixmap::new(PLACEHOLDER_SIZE, PLACEHOLDER_SIZE)
        .context("分配占位图画布失败")?;
    resvg::render(&tree, resvg::tiny_skia::Transform::default(), &mut pixmap.as_mut());

    // 背景不透明，预乘 alpha 与直通 alpha 相同
    let rgba = RgbaImage::from_raw(PLACEHOLDER_SIZE, PLACEHOLDER_SIZE, pixmap.data().to_vec())
        .context("占位图像素数据长度不匹配")?;
    Ok(image::DynamicImage::ImageRgba8(rgba).to_rgb8())
}

fn placeholder_svg(panel: &Panel) -> String {
    let size = PLACEHOLDER_SIZE;
    let (x1, y1) = (INNER_MARGIN, INNER_MARGIN);
    let (x2, y2) = (size - INNER_MARGIN, size - INNER_MARGIN);
    let inner_width = x2 - x1;
    let inner_height = y2 - y1;

    let mut svg = String::new();
    let _ = write!(
        svg,
        r#"<svg xmlns="http://www.w3.org/2000/svg" width="{size}" height="{size}" viewBox="0 0 {size} {size}" font-family="sans-serif">"#
    );
    let _ = write!(svg, r#"<rect width="{size}" height="{size}" fill="{BACKGROUND}"/>"#);

    let half = BORDER_WIDTH / 2;
    let _ = write!(
        svg,
        r#"<rect x="{half}" y="{half}" width="{w}" height="{w}" fill="none" stroke="{BORDER}" stroke-width="{BORDER_WIDTH}"/>"#,
        w = size - BORDER_WIDTH,
    );

    // 四段纵向渐变
    for (i, color) in GRADIENT.iter().enumerate() {
        let top = y1 + inner_height * i as u32 / GRADIENT.len() as u32;
        let bottom = y1 + inner_height * (i as u32 + 1) / GRADIENT.len() as u32;
        let _ = write!(
            svg,
            r#"<rect x="{x1}" y="{top}" width="{inner_width}" height="{h}" fill="{color}"/>"#,
            h = bottom - top,
        );
    }

    // 标题
    let _ = write!(
        svg,
        r##"<text x="{x}" y="{y}" font-size="32" font-weight="bold" fill="#1a237e">Panel {n}</text>"##,
        x = x1 + 20,
        y = y1 + 20 + 32,
        n = panel.panel_number,
    );

    // 画面描述
    let mut y_offset = y1 + 80;
    for line in wrap_scene(&panel.scene_description) {
        let _ = write!(
            svg,
            r##"<text x="{x}" y="{y}" font-size="20" fill="#37474f">{text}</text>"##,
            x = x1 + 20,
            y = y_offset + 20,
            text = escape_xml(&line),
        );
        y_offset += LINE_STEP;
    }

    // 对话气泡，只显示第一句
    if let Some(first) = panel.primary_dialogue() {
        let bubble_y = y_offset + 40;
        let _ = write!(
            svg,
            r##"<ellipse cx="{cx}" cy="{cy}" rx="{rx}" ry="60" fill="white" stroke="#455a64" stroke-width="3"/>"##,
            cx = size / 2,
            cy = bubble_y + 60,
            rx = (inner_width - 100) / 2,
        );
        if !first.text.is_empty() {
            let _ = write!(
                svg,
                r##"<text x="{x}" y="{y}" font-size="20" fill="#1565c0">{name}:</text>"##,
                x = x1 + 70,
                y = bubble_y + 20 + 20,
                name = escape_xml(&first.character),
            );
            let _ = write!(
                svg,
                r##"<text x="{x}" y="{y}" font-size="20" fill="#424242">{text}</text>"##,
                x = x1 + 70,
                y = bubble_y + 45 + 20,
                text = escape_xml(&truncate_chars(&first.text, DIALOGUE_MAX_CHARS)),
            );
        }
    }

    // 画面重点
    if !panel.visual_focus.is_empty() {
        let _ = write!(
            svg,
            r##"<text x="{x}" y="{y}" font-size="20" fill="#78909c">Focus: {focus}...</text>"##,
            x = x1 + 20,
            y = y2 - 40 + 20,
            focus = escape_xml(&truncate_chars(&panel.visual_focus, FOCUS_MAX_CHARS)),
        );
    }

    svg.push_str("</svg>");
    svg
}

/// 画面描述超过 80 字符时截断加省略号，再按单词换行（每行少于 40 字符，最多 5 行）
fn wrap_scene(scene: &str) -> Vec<String> {
    let scene = if scene.chars().count() > SCENE_MAX_CHARS {
        format!("{}...", truncate_chars(scene, SCENE_MAX_CHARS))
    } else {
        scene.to_string()
    };

    let mut lines = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    for word in scene.split_whitespace() {
        let candidate_len = current.iter().map(|w| w.chars().count() + 1).sum::<usize>()
            + word.chars().count();
        if candidate_len < LINE_MAX_CHARS {
            current.push(word);
        } else {
            if !current.is_empty() {
                lines.push(current.join(" "));
            }
            current = vec![word];
        }
    }
    if !current.is_empty() {
        lines.push(current.join(" "));
    }

    lines.truncate(MAX_SCENE_LINES);
    lines
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

fn escape_xml(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            c if c.is_control() => escaped.push(' '),
            c => escaped.push(c),
        }
    }
    escaped
}

/// 最简占位图：浅灰底、深色边框、七段数码管样式的分镜编号，不依赖字体
pub fn render_minimal(panel_number: u32) -> RgbImage {
    let size = PLACEHOLDER_SIZE;
    let fill = Rgb([0xf0, 0xf0, 0xf0]);
    let ink = Rgb([0x33, 0x33, 0x33]);
    let mut img = RgbImage::from_pixel(size, size, fill);

    // 边框 [10, 10, 1014, 1014]，线宽 5
    let (inset, width) = (10, 5);
    let span = size - 2 * inset;
    fill_rect(&mut img, inset, inset, span, width, ink);
    fill_rect(&mut img, inset, size - inset - width, span, width, ink);
    fill_rect(&mut img, inset, inset, width, span, ink);
    fill_rect(&mut img, size - inset - width, inset, width, span, ink);

    let digits: Vec<u32> = panel_number
        .to_string()
        .chars()
        .filter_map(|c| c.to_digit(10))
        .collect();
    let (digit_w, digit_h, gap) = (60, 120, 24);
    let total_w = digits.len() as u32 * digit_w + digits.len().saturating_sub(1) as u32 * gap;
    let mut x = size.saturating_sub(total_w) / 2;
    let y = (size - digit_h) / 2;
    for digit in digits {
        draw_digit(&mut img, digit, x, y, digit_w, digit_h, ink);
        x += digit_w + gap;
    }

    img
}

/// 段顺序：上、右上、右下、下、左下、左上、中
const SEGMENTS: [[bool; 7]; 10] = [
    [true, true, true, true, true, true, false],
    [false, true, true, false, false, false, false],
    [true, true, false, true, true, false, true],
    [true, true, true, true, false, false, true],
    [false, true, true, false, false, true, true],
    [true, false, true, true, false, true, true],
    [true, false, true, true, true, true, true],
    [true, true, true, false, false, false, false],
    [true, true, true, true, true, true, true],
    [true, true, true, true, false, true, true],
];

fn draw_digit(img: &mut RgbImage, digit: u32, x: u32, y: u32, w: u32, h: u32, color: Rgb<u8>) {
    let Some(segments) = SEGMENTS.get(digit as usize) else {
        return;
    };
    let t = 14;
    let half = h / 2;
    let rects = [
        (x, y, w, t),
        (x + w - t, y, t, half),
        (x + w - t, y + half, t, h - half),
        (x, y + h - t, w, t),
        (x, y + half, t, h - half),
        (x, y, t, half),
        (x, y + half - t / 2, w, t),
    ];
    for (on, (rx, ry, rw, rh)) in segments.iter().zip(rects) {
        if *on {
            fill_rect(img, rx, ry, rw, rh, color);
        }
    }
}

fn fill_rect(img: &mut RgbImage, x: u32, y: u32, w: u32, h: u32, color: Rgb<u8>) {
    let x_end = (x + w).min(img.width());
    let y_end = (y + h).min(img.height());
    for py in y..y_end {
        for px in x..x_end {
            img.put_pixel(px, py, color);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Dialogue;
    use std::collections::BTreeMap;

    fn sample_panel() -> Panel {
        Panel {
            panel_number: 3,
            scene_description: "A tiny robot <R2> & its friend stare at an enormous glowing crystal \
                                 in the middle of an abandoned mine shaft far below the city"
                .to_string(),
            characters: vec!["Robot".to_string()],
            dialogue: vec![Dialogue::new("Robot", "\"Beep\" means hello")],
            visual_focus: "The crystal".to_string(),
            art_direction: None,
            character_appearances: BTreeMap::new(),
        }
    }

    #[test]
    fn test_wrap_scene_limits() {
        let lines = wrap_scene(&sample_panel().scene_description);
        assert!(!lines.is_empty());
        assert!(lines.len() <= MAX_SCENE_LINES);
        for line in &lines {
            assert!(line.chars().count() < LINE_MAX_CHARS, "line too long: {}", line);
        }
        assert!(lines.last().unwrap().ends_with("..."));
    }

    #[test]
    fn test_wrap_scene_short_text_is_untouched() {
        assert_eq!(wrap_scene("Sunrise over hills"), vec!["Sunrise over hills".to_string()]);
        assert!(wrap_scene("").is_empty());
    }

    #[test]
    fn test_svg_escapes_text() {
        let svg = placeholder_svg(&sample_panel());
        assert!(svg.contains("&lt;R2&gt; &amp;"));
        assert!(svg.contains("&quot;Beep&quot;"));
        assert!(svg.contains("Panel 3"));
        assert!(svg.contains("Focus: The crystal..."));
    }

    #[test]
    fn test_render_placeholder_has_canonical_size_and_colors() {
        let img = render_placeholder(&sample_panel()).unwrap();
        assert_eq!(img.dimensions(), (PLACEHOLDER_SIZE, PLACEHOLDER_SIZE));
        // 边框
        assert_eq!(img.get_pixel(3, 500), &Rgb([0x2c, 0x3e, 0x50]));
        // 边框与内容区之间的背景
        assert_eq!(img.get_pixel(20, 500), &Rgb([0xf0, 0xf8, 0xff]));
        // 渐变最后一段
        assert_eq!(img.get_pixel(980, 900), &Rgb([0x64, 0xb5, 0xf6]));
    }

    #[test]
    fn test_render_minimal() {
        let img = render_minimal(12);
        assert_eq!(img.dimensions(), (PLACEHOLDER_SIZE, PLACEHOLDER_SIZE));
        assert_eq!(img.get_pixel(12, 500), &Rgb([0x33, 0x33, 0x33]));
        assert_eq!(img.get_pixel(200, 200), &Rgb([0xf0, 0xf0, 0xf0]));
        // 两位数居中：第一位 "1" 的右上段
        assert_eq!(img.get_pixel(490, 470), &Rgb([0x33, 0x33, 0x33]));
        // "1" 没有上横段
        assert_eq!(img.get_pixel(460, 455), &Rgb([0xf0, 0xf0, 0xf0]));
    }
}
