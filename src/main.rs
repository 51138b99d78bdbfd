mod backend;
mod config;
mod error;
mod handle;
mod key;
mod launcher;
mod process;
mod state;
mod store;
mod supervisor;
mod web;

use backend::{BackendController, ComposeBackend};
use clap::{Parser, Subcommand};
use config::AppConfig;
use error::RestreamError;
use handle::{ActiveRestream, Profile};
use state::AppState;
use std::sync::Arc;
use supervisor::Supervisor;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// IPTV Restream - 通过自建 NGINX-RTMP 后端转推 IPTV 频道
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// 配置文件路径
    #[arg(short, long, default_value = "iptv-restream.yaml")]
    config: String,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// 启动转推
    Start {
        /// 频道的源地址
        #[arg(long)]
        url: String,
        /// 已清洗的转推 key
        #[arg(long, conflicts_with = "name", required_unless_present = "name")]
        key: Option<String>,
        /// 频道显示名, 自动生成 key
        #[arg(long)]
        name: Option<String>,
        /// 以低码率重新编码 (854x480 @ 1Mbps)
        #[arg(long)]
        transcode: bool,
    },
    /// 停止转推
    Stop { key: String },
    /// 列出活跃转推
    Status,
    /// 端到端连通性测试, 不指定 --url 时使用测试图案
    Test {
        #[arg(long)]
        url: Option<String>,
    },
    /// 显示某个 key 的播放地址
    Urls {
        key: String,
        #[arg(long)]
        transcode: bool,
    },
    /// 由显示名生成 key
    Key { name: String },
    /// 管理媒体服务后端容器组
    Backend {
        #[command(subcommand)]
        action: BackendCmd,
    },
    /// 启动 HTTP 控制 API
    Serve,
}

#[derive(Subcommand, Debug)]
enum BackendCmd {
    /// 构建镜像 (已构建则跳过)
    Build,
    /// 启动容器组并等待就绪
    Up,
    /// 停止容器组
    Down,
    Status,
    Logs {
        #[arg(long, default_value_t = 50)]
        lines: usize,
    },
    Endpoints,
}

fn profile_for(transcode: bool) -> Profile {
    if transcode {
        Profile::Transcoded
    } else {
        Profile::DirectCopy
    }
}

fn print_active(active: &ActiveRestream) {
    let h = &active.handle;
    println!("{} (pid {}, {}, since {})", h.key, h.pid, h.profile, h.started_at.to_rfc3339());
    println!("  source: {}", h.source_url);
    println!("  rtmp:   {}", active.urls.rtmp);
    for hls in &active.urls.hls {
        println!("  hls:    {}", hls);
    }
    println!("  log:    {}", h.log_path.display());
}

fn report(err: &RestreamError) {
    eprintln!("error[{}]: {}", err.kind(), err);
    eprintln!("hint: {}", err.hint());
}

async fn run(cmd: Cmd, config: AppConfig) -> anyhow::Result<Result<(), RestreamError>> {
    let backend: Arc<dyn BackendController> = Arc::new(ComposeBackend::new(config.backend.clone()));
    let supervisor = Supervisor::new(config.restream.clone(), backend.clone());

    let outcome = match cmd {
        Cmd::Start {
            url,
            key,
            name,
            transcode,
        } => {
            let key = key.unwrap_or_else(|| key::derive_key(name.as_deref().unwrap_or_default()));
            supervisor
                .start(&key, &url, profile_for(transcode))
                .await
                .map(|active| {
                    println!("✓ Restream started");
                    print_active(&active);
                })
        }
        Cmd::Stop { key } => supervisor.stop(&key).await.map(|handle| {
            println!("✓ Stopped restream {} (pid {})", handle.key, handle.pid);
        }),
        Cmd::Status => {
            let active = supervisor.status().await;
            if active.is_empty() {
                println!("No active restreams");
            }
            active.iter().for_each(print_active);
            Ok(())
        }
        Cmd::Test { url } => supervisor.test(url.as_deref()).await.map(|report| {
            if report.segments_appeared {
                println!("✓ HLS segments appeared at {}", report.hls_url);
            } else {
                println!("⚠ No HLS segments appeared at {} (check `backend logs`)", report.hls_url);
            }
        }),
        Cmd::Urls { key, transcode } => {
            let urls = supervisor.urls(&key, profile_for(transcode));
            println!("rtmp: {}", urls.rtmp);
            for hls in urls.hls {
                println!("hls:  {}", hls);
            }
            Ok(())
        }
        Cmd::Key { name } => {
            println!("{}", key::derive_key(&name));
            Ok(())
        }
        Cmd::Backend { action } => run_backend(action, backend.as_ref()).await,
        Cmd::Serve => {
            let listen = config.server.listen.clone();
            let state = Arc::new(AppState { supervisor });
            let app = web::router(state);

            // 启动HTTP服务，监听指定的地址和端口
            info!("Listening on {}", listen);
            let listener = tokio::net::TcpListener::bind(&listen).await?;
            axum::serve(listener, app).await?;
            Ok(())
        }
    };
    Ok(outcome)
}

async fn run_backend(action: BackendCmd, backend: &dyn BackendController) -> Result<(), RestreamError> {
    let endpoints = backend.endpoints();
    match action {
        BackendCmd::Build => {
            backend.ensure_built().await?;
            println!("✓ Backend built ({})", backend.status().await);
        }
        BackendCmd::Up => {
            backend.start().await?;
            println!("✓ Backend running");
            println!("  rtmp ingest: {}/<stream_key>", endpoints.ingest);
            println!("  hls output:  {}/<stream_key>.m3u8", endpoints.hls_base);
        }
        BackendCmd::Down => {
            backend.stop().await?;
            println!("✓ Backend stopped");
        }
        BackendCmd::Status => println!("{}", backend.status().await),
        BackendCmd::Logs { lines } => {
            for line in backend.tail_logs(lines).await? {
                println!("{}", line);
            }
        }
        BackendCmd::Endpoints => {
            println!("ingest: {}", endpoints.ingest);
            println!("hls:    {}", endpoints.hls_base);
            println!("stats:  {}", endpoints.stats_url);
            println!("admin:  {}", endpoints.admin_url);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志系统, 输出到 stderr, 默认 info 级别
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    // 解析命令行参数，获取配置文件路径
    let args = Args::parse();

    // 加载配置文件
    let config = AppConfig::load(&args.config)?;

    if let Err(err) = run(args.command, config).await? {
        report(&err);
        std::process::exit(1);
    }
    Ok(())
}
