use async_trait::async_trait;
use bytes::Bytes;
use clap::Parser;
use http::{Request, Response, StatusCode};
use http_body_util::Full;
use hyflux_worker::config::args::normalize;
use hyflux_worker::{
    Hooks, Lifecycle, LifecycleOptions, Runtime, ServiceArgs, SocketAddress, StopStatus, Stream,
    TcpHandler, TcpService, WebHandler, WebService,
};
use hyper::body::Incoming;
use std::process::ExitCode;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, error, info};

/// grace period for tasks still alive once the service returned
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Parser, Debug)]
#[command(name = "hyflux-workerd", about = "sample worker served under a master supervisor or standalone")]
struct Cli {
    #[command(flatten)]
    service: ServiceArgs,

    /// addresses to bind when started with --alone, e.g. "127.0.0.1:8080,/tmp/echo.sock"
    #[arg(long = "listen", value_name = "ADDRS", default_value = "")]
    listen: String,
}

/// writes back whatever the peer sends
struct Echo;

#[async_trait]
impl TcpHandler for Echo {
    async fn on_accept(&self, stream: &mut Stream, peer: &SocketAddress) {
        let mut buf = vec![0u8; 8192];
        loop {
            let n = match stream.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    debug!(%peer, "read failed: {e}");
                    break;
                }
            };
            if let Err(e) = stream.write_all(&buf[..n]).await {
                debug!(%peer, "write failed: {e}");
                break;
            }
        }
    }

    async fn on_close(&self, peer: &SocketAddress) {
        debug!(%peer, "echo connection closed");
    }
}

struct Hello {
    name: String,
}

#[async_trait]
impl WebHandler for Hello {
    async fn handle(&self, request: Request<Incoming>, peer: &SocketAddress) -> Response<Full<Bytes>> {
        debug!(%peer, method = %request.method(), path = %request.uri().path(), "request");
        let body = format!("hello from {} at {}\n", self.name, request.uri().path());
        Response::builder()
            .status(StatusCode::OK)
            .header(http::header::CONTENT_TYPE, "text/plain")
            .body(Full::new(Bytes::from(body)))
            .unwrap_or_else(|_| Response::new(Full::new(Bytes::new())))
    }
}

impl Cli {
    /// strict parsing for standalone runs and help, the supervisor may pass
    /// flags this worker does not know so they are skipped otherwise
    fn from_args<I: IntoIterator<Item = String>>(args: I) -> Self {
        let args = normalize(args);
        let strict = args
            .iter()
            .any(|arg| matches!(arg.as_str(), "--alone" | "--listen" | "-h" | "--help"));
        if strict {
            Cli::parse_from(args)
        } else {
            Cli {
                service: ServiceArgs::scan(args.iter().skip(1)),
                listen: String::new(),
            }
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::from_args(std::env::args());
    if cli.service.alone && cli.listen.trim().is_empty() {
        eprintln!("hyflux-workerd: --alone needs --listen addresses");
        return ExitCode::from(2);
    }
    let addresses = if cli.service.alone { cli.listen.clone() } else { String::new() };
    let name = if cli.service.service_name.is_empty() {
        "hyflux-workerd".to_string()
    } else {
        cli.service.service_name.clone()
    };
    let web = matches!(cli.service.service_type.as_str(), "web" | "http");

    let hooks = Hooks::new()
        .on_init(|| info!("worker ready"))
        .on_exit(|| info!("worker exiting"));
    let lifecycle = Lifecycle::new(LifecycleOptions::new(cli.service), hooks);
    let settings = match lifecycle.prepare() {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("hyflux-workerd: {e}");
            return ExitCode::FAILURE;
        }
    };
    let runtime = match Runtime::new("hyflux-worker", settings.worker_threads()) {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("create runtime failed: {e}");
            return ExitCode::FAILURE;
        }
    };

    let result = runtime.block_on(async {
        if web {
            WebService::new(Hello { name }).start(&lifecycle, &addresses).await
        } else {
            TcpService::new(Echo).start(&lifecycle, &addresses).await
        }
    });
    runtime.shutdown(SHUTDOWN_TIMEOUT);

    match result {
        Ok(StopStatus::Normal) => ExitCode::SUCCESS,
        Ok(StopStatus::Forced) => ExitCode::from(1),
        Err(e) => {
            error!("worker failed: {e}");
            ExitCode::FAILURE
        }
    }
}
