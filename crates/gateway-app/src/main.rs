mod config;

use std::path::PathBuf;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use clap::Parser;
use futures::StreamExt;
use gateway::{FrontdoorReply, Handler};
use tracing::info;

#[derive(Parser, Debug)]
#[command(about, long_about = None)]
struct Args {
	/// Inline JSON configuration.
	#[arg(short, long, value_name = "config")]
	config: Option<String>,

	/// Path to a JSON configuration file.
	#[arg(short, long, value_name = "file")]
	file: Option<PathBuf>,

	/// Parse and validate configuration, then exit.
	#[arg(long)]
	validate_only: bool,

	/// Address to listen on.
	#[arg(long, default_value = "0.0.0.0:8080")]
	listen: String,
}

fn init_logging() {
	tracing_subscriber::fmt()
		.with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")))
		.init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_logging();

	let args = Args::parse();
	let contents = match (args.config, args.file) {
		(Some(_), Some(_)) => anyhow::bail!("only one of --config or --file may be given"),
		(Some(inline), None) => inline,
		(None, Some(path)) => fs_err::read_to_string(&path)?,
		(None, None) => "{}".to_string(),
	};

	let parsed: config::Config = serde_json::from_str(&contents)?;
	if args.validate_only {
		config::build(parsed)?;
		println!("configuration is valid");
		return Ok(());
	}

	let built = config::build(parsed)?;
	info!(frontdoors = built.frontdoors.len(), "gateway starting");

	let mut app = axum::Router::new();
	for (path, handler) in built.frontdoors {
		let prefix = path.trim_end_matches('/').to_string();
		info!(path = %prefix, frontdoor = %handler.frontdoor_format.as_str(), "mounted frontdoor");
		app = app.route(&format!("{prefix}/{{*rest}}"), post(dispatch).with_state(handler));
	}

	let listener = tokio::net::TcpListener::bind(&args.listen).await?;
	info!(addr = %args.listen, "listening");
	axum::serve(listener, app).await?;
	Ok(())
}

async fn dispatch(State(handler): State<Arc<Handler>>, Path(_rest): Path<String>, headers: HeaderMap, body: Body) -> Response {
	let user_agent = headers.get(axum::http::header::USER_AGENT).and_then(|v| v.to_str().ok()).map(str::to_string);

	let raw_body = match axum::body::to_bytes(body, 32 * 1024 * 1024).await {
		Ok(bytes) => bytes,
		Err(e) => return (StatusCode::BAD_REQUEST, format!("failed to read request body: {e}")).into_response(),
	};

	let result = handler.handle(raw_body, user_agent).await;
	match result.reply {
		FrontdoorReply::Complete { status, body } => (StatusCode::from_u16(status).unwrap_or(StatusCode::OK), body).into_response(),
		FrontdoorReply::Stream { status, frames } => {
			let body_stream = frames.map(|frame| frame.map_err(std::io::Error::other));
			let mut response = Response::new(Body::from_stream(body_stream));
			*response.status_mut() = StatusCode::from_u16(status).unwrap_or(StatusCode::OK);
			response.headers_mut().insert(axum::http::header::CONTENT_TYPE, axum::http::HeaderValue::from_static("text/event-stream"));
			response
		}
		FrontdoorReply::Suppressed => StatusCode::NO_CONTENT.into_response(),
	}
}
