//! Local KV proxy.
//!
//! Listens on a plain KV port and forwards binary frames to an upstream data
//! node. Two request classes are intercepted: VERSION is answered locally,
//! and STAT requests whose key begins with `query ` or `search ` are
//! redirected to the corresponding HTTP service, with result rows streamed
//! back to the client as STAT responses (`row-N` entries, a `meta` entry,
//! then an empty terminator).

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Context;
use bytes::Bytes;
use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;
use tracing::{debug, error, info, warn};

use skerry_client::protocol::{
    opcode, ClientCodec, RequestPacket, ResponsePacket, ServerCodec, Status,
};

const CLIENT_STRING: &str = concat!("skerry-proxy/", env!("CARGO_PKG_VERSION"));

/// KV proxy with query/search redirection.
#[derive(Parser, Debug)]
#[command(name = "skerry-proxy", about = "Forwarding proxy for Skerry KV traffic")]
struct Args {
    /// Port to listen on for client connections.
    #[arg(short, long, env = "SKERRY_PROXY_PORT", default_value_t = 11211)]
    port: u16,

    /// Upstream data node, `host:port`.
    #[arg(long, env = "SKERRY_PROXY_UPSTREAM")]
    upstream: SocketAddr,

    /// HTTP endpoint for redirected `query ` STAT requests.
    #[arg(long, env = "SKERRY_PROXY_QUERY_URL")]
    query_url: Option<String>,

    /// HTTP endpoint for redirected `search ` STAT requests.
    #[arg(long, env = "SKERRY_PROXY_SEARCH_URL")]
    search_url: Option<String>,

    /// Log a hex dump of every forwarded frame.
    #[arg(short, long)]
    trace: bool,
}

#[derive(Default)]
struct ProxyStats {
    connections: AtomicU64,
    forwarded: AtomicU64,
    redirected: AtomicU64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("skerry_proxy=info,info")),
        )
        .init();
    let args = Args::parse();
    let stats = Arc::new(ProxyStats::default());

    let listener = TcpListener::bind(("0.0.0.0", args.port))
        .await
        .with_context(|| format!("failed to bind proxy port {}", args.port))?;
    info!(port = args.port, upstream = %args.upstream, "proxy listening");

    let args = Arc::new(args);
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (socket, peer) = accepted.context("accept failed")?;
                info!(%peer, "new client connection");
                stats.connections.fetch_add(1, Ordering::Relaxed);
                let args = args.clone();
                let stats = stats.clone();
                tokio::spawn(async move {
                    if let Err(err) = serve_client(socket, peer, args, stats).await {
                        warn!(%peer, error = %err, "client connection closed with error");
                    }
                });
            }
            _ = tokio::signal::ctrl_c() => {
                info!(
                    connections = stats.connections.load(Ordering::Relaxed),
                    forwarded = stats.forwarded.load(Ordering::Relaxed),
                    redirected = stats.redirected.load(Ordering::Relaxed),
                    "terminating the proxy"
                );
                return Ok(());
            }
        }
    }
}

async fn serve_client(
    socket: TcpStream,
    peer: SocketAddr,
    args: Arc<Args>,
    stats: Arc<ProxyStats>,
) -> anyhow::Result<()> {
    let mut client = Framed::new(socket, ServerCodec);
    let upstream_socket = TcpStream::connect(args.upstream)
        .await
        .with_context(|| format!("failed to connect upstream {}", args.upstream))?;
    let _ = upstream_socket.set_nodelay(true);
    let mut upstream = Framed::new(upstream_socket, ClientCodec);
    let http = reqwest::Client::new();

    loop {
        tokio::select! {
            request = client.next() => {
                let Some(request) = request else {
                    debug!(%peer, "client disconnected");
                    return Ok(());
                };
                let request = request.context("malformed client frame")?;
                if args.trace {
                    trace_frame(peer, "request", &request);
                }
                match classify(&request, &args) {
                    Intercept::Version => {
                        let mut resp = ResponsePacket::new(opcode::VERSION, Status::Success);
                        resp.opaque = request.opaque;
                        resp.value = Bytes::from_static(CLIENT_STRING.as_bytes());
                        client.send(resp).await.context("write version response")?;
                    }
                    Intercept::Http { url, statement } => {
                        stats.redirected.fetch_add(1, Ordering::Relaxed);
                        if let Err(err) =
                            redirect_http(&http, &url, statement, request.opaque, &mut client).await
                        {
                            warn!(%peer, error = %err, "HTTP redirection failed");
                            let mut resp =
                                ResponsePacket::new(opcode::STAT, Status::TemporaryFailure);
                            resp.opaque = request.opaque;
                            client.send(resp).await.context("write redirect failure")?;
                        }
                    }
                    Intercept::Forward => {
                        stats.forwarded.fetch_add(1, Ordering::Relaxed);
                        upstream.send(request).await.context("write upstream")?;
                    }
                }
            }
            response = upstream.next() => {
                let Some(response) = response else {
                    error!(%peer, "upstream closed the connection");
                    return Ok(());
                };
                let response = response.context("malformed upstream frame")?;
                client.send(response).await.context("write client response")?;
            }
        }
    }
}

enum Intercept {
    Version,
    Http { url: String, statement: Bytes },
    Forward,
}

/// Decide what to do with one client request.
fn classify(request: &RequestPacket, args: &Args) -> Intercept {
    match request.opcode {
        opcode::VERSION => Intercept::Version,
        opcode::STAT => {
            if let Some(statement) = request.key.strip_prefix(b"query ") {
                if let Some(url) = &args.query_url {
                    return Intercept::Http {
                        url: url.clone(),
                        statement: Bytes::copy_from_slice(statement),
                    };
                }
            }
            if let Some(payload) = request.key.strip_prefix(b"search ") {
                if let Some(url) = &args.search_url {
                    return Intercept::Http {
                        url: url.clone(),
                        statement: Bytes::copy_from_slice(payload),
                    };
                }
            }
            Intercept::Forward
        }
        _ => Intercept::Forward,
    }
}

/// Stream an HTTP service response back as STAT rows.
///
/// Each received chunk becomes a `row-N` STAT entry; the stream ends with a
/// `meta` entry and the empty STAT terminator the protocol requires.
async fn redirect_http(
    http: &reqwest::Client,
    url: &str,
    statement: Bytes,
    opaque: u32,
    client: &mut Framed<TcpStream, ServerCodec>,
) -> anyhow::Result<()> {
    let response = http
        .post(url)
        .body(statement)
        .send()
        .await
        .with_context(|| format!("POST {url}"))?;
    let mut rows = response.bytes_stream();
    let mut count = 0u64;
    while let Some(chunk) = rows.next().await {
        let chunk = chunk.context("read HTTP chunk")?;
        let mut resp = ResponsePacket::new(opcode::STAT, Status::Success);
        resp.opaque = opaque;
        resp.key = Bytes::from(format!("row-{count}"));
        resp.value = Bytes::from(chunk.to_vec());
        client.send(resp).await.context("write row")?;
        count += 1;
    }
    let mut meta = ResponsePacket::new(opcode::STAT, Status::Success);
    meta.opaque = opaque;
    meta.key = Bytes::from_static(b"meta");
    client.send(meta).await.context("write meta")?;
    // Empty STAT response terminates the sequence.
    let mut fin = ResponsePacket::new(opcode::STAT, Status::Success);
    fin.opaque = opaque;
    client.send(fin).await.context("write terminator")?;
    Ok(())
}

/// Hex dump in the classic offset/hex/ascii layout.
fn trace_frame(peer: SocketAddr, direction: &str, request: &RequestPacket) {
    let mut dump = String::new();
    let mut all = Vec::new();
    all.extend_from_slice(&request.frame_extras);
    all.extend_from_slice(&request.extras);
    all.extend_from_slice(&request.key);
    all.extend_from_slice(&request.value);
    for (row, bytes) in all.chunks(16).enumerate() {
        dump.push_str(&format!("\n{:08x} ", row * 16));
        for byte in bytes {
            dump.push_str(&format!(" {byte:02x}"));
        }
        dump.push_str(&"   ".repeat(16 - bytes.len()));
        dump.push_str("  |");
        for byte in bytes {
            dump.push(if byte.is_ascii_graphic() || *byte == b' ' {
                *byte as char
            } else {
                '.'
            });
        }
        dump.push('|');
    }
    info!(
        %peer,
        direction,
        opcode = format!("0x{:02x}", request.opcode),
        opaque = request.opaque,
        body = all.len(),
        "frame{dump}"
    );
}
