use crate::models::{Dialogue, Panel, PanelEntry};
use std::collections::BTreeMap;
use tracing::{info, warn};

/// 规范化分镜列表
///
/// 结构正确的分镜保留内容，其余条目（无法解析、缺少画面描述或角色）替换为
/// 占位分镜。输出长度始终等于输入长度，编号一律改为位置编号（从 1 连续递增），
/// 分镜图片和视频文件都以编号命名，重复或跳号会互相覆盖。
pub fn validate(entries: &[PanelEntry]) -> Vec<Panel> {
    let panels: Vec<Panel> = entries
        .iter()
        .enumerate()
        .map(|(i, entry)| {
            let position = i as u32 + 1;
            match entry {
                PanelEntry::Panel(panel) if panel.is_well_formed() => {
                    if i < 2 {
                        info!("   分镜 {}: {}", position, preview(&panel.scene_description, 80));
                    }
                    let mut panel = panel.clone();
                    if panel.panel_number != position {
                        warn!(
                            "⚠️  [分镜校验] 第 {} 个分镜编号为 {}，改为 {}",
                            position, panel.panel_number, position
                        );
                        panel.panel_number = position;
                    }
                    panel
                }
                PanelEntry::Panel(_) => {
                    warn!("⚠️  [分镜校验] 分镜 {} 缺少必要字段，使用占位分镜", position);
                    synthetic_panel(position)
                }
                PanelEntry::Malformed(value) => {
                    warn!(
                        "⚠️  [分镜校验] 分镜 {} 不是结构化数据: {}",
                        position,
                        preview(&value.to_string(), 100)
                    );
                    synthetic_panel(position)
                }
            }
        })
        .collect();

    info!("✅ [分镜校验] 校验完成，共 {} 个分镜", panels.len());
    panels
}

/// 按位置生成的占位分镜
pub fn synthetic_panel(position: u32) -> Panel {
    Panel {
        panel_number: position,
        scene_description: format!("Panel {} scene", position),
        characters: vec!["Character".to_string()],
        dialogue: vec![Dialogue::new("Character", format!("Panel {}", position))],
        visual_focus: "Main scene".to_string(),
        art_direction: None,
        character_appearances: BTreeMap::new(),
    }
}

/// 按字符截断，用于日志预览
fn preview(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}
