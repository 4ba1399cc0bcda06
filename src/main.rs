use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::EnvFilter;
use video_proxy_server::cache::CACHE_DIR;
use video_proxy_server::ProxyServer;

#[derive(Parser, Debug)]
#[command(name = "video_proxy_server", version, about = "Caching loopback proxy for media streams")]
struct Args {
    /// Listening port on 127.0.0.1 (0 picks a free one)
    #[arg(short, long, default_value_t = 3000)]
    port: u16,

    /// Cache directory
    #[arg(short, long, default_value = CACHE_DIR)]
    cache_dir: PathBuf,

    /// Maximum total size of cached files, in bytes
    #[arg(long)]
    max_size: Option<u64>,

    /// Maximum number of cached files
    #[arg(long)]
    max_files: Option<usize>,

    /// 最大并发连接数
    #[arg(long, default_value_t = 100)]
    max_connections: usize,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Urls to print proxy urls for
    urls: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&args.log_level))?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut builder = ProxyServer::builder()
        .cache_directory(args.cache_dir)
        .port(args.port)
        .max_connections(args.max_connections);
    if let Some(max_size) = args.max_size {
        builder = builder.max_cache_size(max_size);
    }
    if let Some(max_files) = args.max_files {
        builder = builder.max_cache_files_count(max_files);
    }
    let server = builder.build().await?;

    println!("视频代理服务器运行在 http://127.0.0.1:{}", server.port());
    for url in &args.urls {
        println!("{url}\n  -> {}", server.proxy_url(url).await);
    }

    tokio::signal::ctrl_c().await?;
    server.shutdown().await;
    Ok(())
}
