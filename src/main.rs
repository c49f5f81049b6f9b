use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use daily_comics::config::{ConfigLoader, ConfigOverrides};
use daily_comics::store::{ComicStore, MetadataStore};
use daily_comics::ComicEngine;
use std::path::PathBuf;
use tracing::Level;

/// 每日漫画生成工具 - 根据主题生成四格漫画，可选生成动画视频
#[derive(Parser, Debug)]
#[command(name = "daily-comics")]
#[command(about = "每日漫画生成工具：剧本、分镜作画、拼版、视频", long_about = None)]
struct Args {
    /// 配置文件路径（可选，支持 .ini 格式）
    /// 优先级：命令行参数 > 环境变量 > 配置文件 > 默认值
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// 漫画输出目录
    #[arg(long, global = true)]
    output_dir: Option<PathBuf>,

    /// 日志级别（trace, debug, info, warn, error）
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// 根据单个主题生成漫画
    Generate {
        /// 漫画主题
        topic: String,

        /// 基调，例如 humorous、educational、dramatic
        #[arg(long, default_value = "humorous")]
        tone: String,

        /// 目标读者
        #[arg(long, default_value = "general")]
        audience: String,

        /// 画风
        #[arg(long, default_value = "modern digital comic")]
        style: String,

        /// 每部漫画的分镜数
        #[arg(long)]
        panels: Option<usize>,
    },
    /// 按顺序批量生成，单个主题失败不影响其他主题
    Batch {
        /// 主题列表
        #[arg(required = true)]
        topics: Vec<String>,

        #[arg(long, default_value = "humorous")]
        tone: String,

        #[arg(long, default_value = "modern digital comic")]
        style: String,
    },
    /// 为已生成的漫画生成视频（Ctrl+C 取消）
    Video {
        /// 漫画 ID
        comic_id: String,
    },
    /// 列出已生成的漫画（从新到旧）
    List,
    /// 查看某部漫画的元数据
    Show {
        comic_id: String,
    },
    /// 写出一份默认配置文件
    InitConfig {
        #[arg(default_value = "daily-comics.ini")]
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if let Commands::InitConfig { path } = &args.command {
        ConfigLoader::create_default_config(path).context("写入默认配置失败")?;
        println!("默认配置已写入: {}", path.display());
        return Ok(());
    }

    let panels = match &args.command {
        Commands::Generate { panels, .. } => *panels,
        _ => None,
    };
    let overrides = ConfigOverrides {
        output_dir: args.output_dir.clone(),
        log_level: args.log_level.clone(),
        panels_per_comic: panels,
    };
    let config = ConfigLoader::load_config(args.config.as_deref(), &overrides).context("加载配置失败")?;

    // 初始化日志
    let level = config.log_level.parse::<Level>().unwrap_or(Level::INFO);
    tracing_subscriber::fmt().with_max_level(level).init();

    // 只读命令不需要模型客户端
    match &args.command {
        Commands::List => {
            let comics = ComicStore::new(config.output_dir.clone()).list()?;
            println!("{}", serde_json::to_string_pretty(&comics)?);
            return Ok(());
        }
        Commands::Show { comic_id } => {
            let metadata = ComicStore::new(config.output_dir.clone()).load_metadata(comic_id)?;
            println!("{}", serde_json::to_string_pretty(&metadata)?);
            return Ok(());
        }
        _ => {}
    }

    let engine = ComicEngine::from_config(config).context("初始化漫画引擎失败")?;

    match args.command {
        Commands::Generate {
            topic,
            tone,
            audience,
            style,
            ..
        } => {
            let metadata = engine
                .generate(&topic, &tone, &audience, &style)
                .await
                .context("生成漫画失败")?;
            println!("{}", serde_json::to_string_pretty(&metadata)?);
        }
        Commands::Batch { topics, tone, style } => {
            let report = engine.generate_batch(&topics, &tone, &style).await;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Video { comic_id } => {
            tokio::select! {
                result = engine.generate_video(&comic_id) => {
                    let outcome = result.context("生成视频失败")?;
                    println!("{}", serde_json::to_string_pretty(&outcome)?);
                }
                _ = tokio::signal::ctrl_c() => {
                    // 取消后不能让状态停留在 generating
                    engine.cancel_video(&comic_id)?;
                    tracing::warn!("🛑 视频生成已取消: {}", comic_id);
                }
            }
        }
        Commands::List | Commands::Show { .. } | Commands::InitConfig { .. } => {}
    }

    Ok(())
}
