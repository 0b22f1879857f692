use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use pagetree::cache::LocalCache;
use pagetree::config::StoreConfig;
use pagetree::core::{Component, KeyPath, KeyPrefix, Level, Value};
use pagetree::stats::StatsReport;
use pagetree::error::StorageError;
use pagetree::storage::FileTable;
use pagetree::trie::{self, TrieNode};
use pagetree::{DropCtrl, Match, PagedStore, ResetScope};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

/// pagetree：分页五级键值存储的管理工具
#[derive(Parser, Debug)]
#[command(name = "pagetree", version)]
struct Cli {
    /// 配置文件（默认 <data_dir>/pagetree/config.toml）
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// 创建表
    Install,
    /// 删除表
    Uninstall,
    /// 写一条记录；VALUE 为 JSON，无法解析时按字符串保存
    Set {
        l5: i64,
        l4: String,
        l3: String,
        l2: String,
        l1: i64,
        value: String,
    },
    /// 按前缀读取（L5 [L4 [L3 [L2 [L1]]]]）
    Get {
        #[arg(required = true, num_args = 1..=5)]
        parts: Vec<String>,
    },
    /// 跨全部页删除某一层等于给定值的记录
    Drop {
        #[arg(long)]
        level: u8,
        #[arg(required = true)]
        values: Vec<String>,
        /// 类型不符的值不报错，只是不匹配
        #[arg(long)]
        no_validate: bool,
    },
    /// 重置（总是先 flush 缓存）
    Reset {
        #[arg(value_enum)]
        scope: ResetArg,
    },
    /// 写快照并清理 WAL
    Checkpoint {
        /// 常驻：按配置间隔周期 checkpoint，直到 Ctrl-C
        #[arg(long)]
        follow: bool,
    },
    /// 运行统计
    Stats,
    /// 展开决策树为扁平元组
    Flatten {
        file: PathBuf,
        #[arg(long, value_delimiter = ',', required = true)]
        columns: Vec<String>,
    },
    /// 最小化决策树
    Clip { file: PathBuf },
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum ResetArg {
    Cache,
    Tables,
    Schema,
}

impl From<ResetArg> for ResetScope {
    fn from(a: ResetArg) -> Self {
        match a {
            ResetArg::Cache => ResetScope::Cache,
            ResetArg::Tables => ResetScope::Tables,
            ResetArg::Schema => ResetScope::Schema,
        }
    }
}

fn read_trie(file: &Path) -> anyhow::Result<TrieNode> {
    let text = std::fs::read_to_string(file)
        .with_context(|| format!("reading {}", file.display()))?;
    Ok(TrieNode::parse(&text)?)
}

fn print_json<T: serde::Serialize>(v: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(v)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    // 纯函数命令不需要打开存储
    match &cli.command {
        Command::Flatten { file, columns } => {
            let tuples = trie::flatten(&read_trie(file)?, columns.as_slice())?;
            return print_json(&tuples);
        }
        Command::Clip { file } => {
            return print_json(&trie::clip(&read_trie(file)?));
        }
        _ => {}
    }

    let config_path = cli.config.clone().unwrap_or_else(StoreConfig::default_path);
    let cfg = StoreConfig::load(&config_path)?;
    let table = Arc::new(FileTable::open(&cfg.data_dir, &cfg.table.name)?);
    let cache = Arc::new(LocalCache::new());
    let store = PagedStore::new(cfg.table.clone(), table.clone(), cache.clone(), cfg.lock_policy())?;

    match cli.command {
        Command::Install => match store.install() {
            Err(e) if e.is_already_satisfied() => info!("Table '{}' already installed", cfg.table.name),
            other => {
                other?;
            }
        },
        Command::Uninstall => match store.uninstall() {
            Err(e) if e.is_already_satisfied() => info!("Table '{}' not installed", cfg.table.name),
            other => {
                other?;
            }
        },
        Command::Set {
            l5,
            l4,
            l3,
            l2,
            l1,
            value,
        } => {
            let path = KeyPath::new(l5, &l4, &l3, &l2, l1)?;
            let value: Value = serde_json::from_str(&value).unwrap_or_else(|_| Value::String(value));
            let changed = store.set(&path, value)?;
            println!("{changed}");
        }
        Command::Get { parts } => {
            // L5/L1 按整数解析，段键原样保留（允许纯数字的段）
            let parts: Vec<Component> = parts
                .iter()
                .enumerate()
                .map(|(i, p)| match i {
                    1..=3 => Component::Str(p.clone()),
                    _ => Component::parse(p),
                })
                .collect();
            let prefix = KeyPrefix::from_components(&parts)?;
            let (tree, valid) = store.get(&prefix)?;
            print_json(&tree)?;
            if !valid {
                eprintln!("page {} has no records", prefix.l5);
            }
        }
        Command::Drop {
            level,
            values,
            no_validate,
        } => {
            let level = Level::from_number(level)?;
            let m = Match::Many(
                values
                    .iter()
                    .map(|v| {
                        if level.is_int() {
                            Component::parse(v)
                        } else {
                            Component::Str(v.clone())
                        }
                    })
                    .collect(),
            );
            let deleted = store.drop_global(
                level,
                &m,
                DropCtrl {
                    validate: !no_validate,
                },
            )?;
            println!("{deleted}");
        }
        Command::Reset { scope } => {
            store.reset(scope.into())?;
            info!("Reset {:?} complete", scope);
        }
        Command::Checkpoint { follow: false } => {
            let rows = table.checkpoint()?;
            println!("{rows}");
        }
        Command::Checkpoint { follow: true } => {
            let interval = cfg.checkpoint_interval_secs.max(1);
            info!("Checkpointing '{}' every {}s, Ctrl-C to stop", cfg.table.name, interval);
            tokio::spawn(table.clone().checkpoint_loop(interval));
            tokio::signal::ctrl_c().await?;
            info!("Shutting down, final checkpoint");
            match table.checkpoint() {
                Ok(rows) => println!("{rows}"),
                Err(StorageError::NotInstalled(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Command::Stats => {
            let report = StatsReport {
                cache_entries: cache.entry_count(),
                cache_bytes: cache.estimated_bytes(),
                process_rss_bytes: StatsReport::read_process_rss(),
                ..store.report()
            };
            print!("{report}");
        }
        Command::Flatten { .. } | Command::Clip { .. } => {}
    }

    Ok(())
}
